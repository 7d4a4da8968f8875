//! Structural protobuf comparison
//!
//! Fields are matched by tag. Messages reached through a field are compared
//! recursively across the linked dependency graphs, so a change inside a
//! referenced schema surfaces at the path of the field that uses it.

use super::elements::{EnumElement, FieldElement, MessageElement, TypeElement};
use super::{ProtobufSchema, ResolvedType, TypeIndex};
use crate::compatibility::{ChangeKind, CompareResult};
use crate::model::join_path;
use std::collections::{BTreeMap, HashSet};

/// Compare a reader schema against a writer schema, appending every
/// difference to `result`
pub fn compare(reader: &ProtobufSchema, writer: &ProtobufSchema, result: &mut CompareResult) {
    if reader.package() != writer.package() {
        result.add(
            ChangeKind::PackageChanged,
            "",
            format!(
                "package changed from '{}' to '{}'",
                reader.package().unwrap_or_default(),
                writer.package().unwrap_or_default()
            ),
        );
    }
    if reader.file().syntax != writer.file().syntax {
        result.add(
            ChangeKind::SyntaxChanged,
            "",
            format!(
                "syntax changed from {} to {}",
                reader.file().syntax.as_deref().unwrap_or("proto2"),
                writer.file().syntax.as_deref().unwrap_or("proto2")
            ),
        );
    }

    let reader_index = TypeIndex::new(reader);
    let writer_index = TypeIndex::new(writer);
    let mut cmp = Comparison {
        reader: &reader_index,
        writer: &writer_index,
        visited: HashSet::new(),
        result,
    };
    cmp.types(
        "",
        &reader.scope(),
        &reader.file().types,
        &writer.scope(),
        &writer.file().types,
    );
}

struct Comparison<'i, 'a, 'r> {
    reader: &'i TypeIndex<'a>,
    writer: &'i TypeIndex<'a>,
    visited: HashSet<(String, String)>,
    result: &'r mut CompareResult,
}

impl Comparison<'_, '_, '_> {
    /// Match sibling type declarations by name
    fn types(
        &mut self,
        path: &str,
        reader_scope: &str,
        reader: &[TypeElement],
        writer_scope: &str,
        writer: &[TypeElement],
    ) {
        for r in reader {
            let at = join_path(path, r.name());
            let r_fqn = format!("{}.{}", reader_scope, r.name());
            let w_fqn = format!("{}.{}", writer_scope, r.name());
            match (r, writer.iter().find(|w| w.name() == r.name())) {
                (TypeElement::Message(rm), Some(TypeElement::Message(wm))) => {
                    self.message(&at, &r_fqn, rm, &w_fqn, wm)
                }
                (TypeElement::Enum(re), Some(TypeElement::Enum(we))) => self.enumeration(&at, re, we),
                (TypeElement::Message(_), None) => self.result.add(
                    ChangeKind::MessageRemoved,
                    at,
                    format!("message {} removed", r.name()),
                ),
                (TypeElement::Enum(_), None) => self.result.add(
                    ChangeKind::EnumRemoved,
                    at,
                    format!("enum {} removed", r.name()),
                ),
                (_, Some(_)) => self.result.add(
                    ChangeKind::TypeChanged,
                    at,
                    format!("{} changed between message and enum", r.name()),
                ),
            }
        }

        for w in writer {
            if reader.iter().any(|r| r.name() == w.name()) {
                continue;
            }
            let (kind, what) = match w {
                TypeElement::Message(_) => (ChangeKind::MessageAdded, "message"),
                TypeElement::Enum(_) => (ChangeKind::EnumAdded, "enum"),
            };
            self.result.add(
                kind,
                join_path(path, w.name()),
                format!("{} {} added", what, w.name()),
            );
        }
    }

    fn message(
        &mut self,
        path: &str,
        r_fqn: &str,
        reader: &MessageElement,
        w_fqn: &str,
        writer: &MessageElement,
    ) {
        if !self.visited.insert((r_fqn.to_string(), w_fqn.to_string())) {
            return;
        }

        self.types(path, r_fqn, &reader.nested, w_fqn, &writer.nested);

        let reader_fields: BTreeMap<u32, (&FieldElement, Option<&str>)> =
            reader.all_fields().map(|(f, o)| (f.tag, (f, o))).collect();
        let writer_fields: BTreeMap<u32, (&FieldElement, Option<&str>)> =
            writer.all_fields().map(|(f, o)| (f.tag, (f, o))).collect();

        for (tag, (rf, r_oneof)) in &reader_fields {
            let at = join_path(path, &rf.name);
            match writer_fields.get(tag) {
                Some((wf, w_oneof)) => {
                    self.field(&at, r_fqn, rf, *r_oneof, w_fqn, wf, *w_oneof);
                }
                None if writer.reserves_tag(*tag) || writer.reserves_name(&rf.name) => {
                    self.result.add(
                        ChangeKind::ReservedFieldRemoved,
                        at,
                        format!("field {} = {} removed and reserved", rf.name, tag),
                    )
                }
                None => self.result.add(
                    ChangeKind::FieldRemoved,
                    at,
                    format!("field {} = {} removed without reserving it", rf.name, tag),
                ),
            }
        }

        for (tag, (wf, _)) in &writer_fields {
            if reader_fields.contains_key(tag) {
                continue;
            }
            let at = join_path(path, &wf.name);
            if reader.reserves_tag(*tag) || reader.reserves_name(&wf.name) {
                self.result.add(
                    ChangeKind::ReservedTagReused,
                    at,
                    format!("field {} = {} reuses a reserved name or number", wf.name, tag),
                );
            } else {
                self.result.add(
                    ChangeKind::FieldAdded,
                    at,
                    format!("field {} = {} added", wf.name, tag),
                );
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn field(
        &mut self,
        path: &str,
        r_scope: &str,
        reader: &FieldElement,
        r_oneof: Option<&str>,
        w_scope: &str,
        writer: &FieldElement,
        w_oneof: Option<&str>,
    ) {
        if reader.name != writer.name {
            self.result.add(
                ChangeKind::FieldRenamed,
                path,
                format!("field {} renamed to {}", reader.name, writer.name),
            );
        }

        if reader.is_repeated() != writer.is_repeated() || reader.is_required() != writer.is_required() {
            self.result.add(
                ChangeKind::FieldLabelChanged,
                path,
                format!(
                    "label changed from '{}' to '{}'",
                    reader.label.map(|l| l.as_str()).unwrap_or("singular"),
                    writer.label.map(|l| l.as_str()).unwrap_or("singular")
                ),
            );
        }

        match (r_oneof, w_oneof) {
            (None, Some(oneof)) => self.result.add(
                ChangeKind::FieldMovedIntoOneof,
                path,
                format!("field moved into oneof {}", oneof),
            ),
            (Some(oneof), None) => self.result.add(
                ChangeKind::FieldMovedOutOfOneof,
                path,
                format!("field moved out of oneof {}", oneof),
            ),
            (Some(from), Some(to)) if from != to => self.result.add(
                ChangeKind::FieldMovedIntoOneof,
                path,
                format!("field moved from oneof {} to oneof {}", from, to),
            ),
            _ => {}
        }

        let reader_type = self.reader.resolve(r_scope, &reader.type_name);
        let writer_type = self.writer.resolve(w_scope, &writer.type_name);
        match (reader_type, writer_type) {
            (Some(r), Some(w)) => self.field_type(path, &r, &w),
            _ if reader.type_name != writer.type_name => self.result.add(
                ChangeKind::FieldTypeChanged,
                path,
                format!(
                    "field type changed from {} to {}",
                    reader.type_name, writer.type_name
                ),
            ),
            _ => {}
        }
    }

    fn field_type(&mut self, path: &str, reader: &ResolvedType, writer: &ResolvedType) {
        match (reader, writer) {
            (ResolvedType::Message(r), ResolvedType::Message(w)) if r == w => {
                if let (Some(rm), Some(wm)) = (self.reader.message(r), self.writer.message(w)) {
                    self.message(path, r, rm, w, wm);
                }
            }
            (ResolvedType::Enum(r), ResolvedType::Enum(w)) if r == w => {
                if let (Some(re), Some(we)) = (self.reader.enumeration(r), self.writer.enumeration(w)) {
                    self.enumeration(path, re, we);
                }
            }
            (ResolvedType::Map(rk, rv), ResolvedType::Map(wk, wv)) => {
                self.field_type(path, rk, wk);
                self.field_type(path, rv, wv);
            }
            (r, w) if r == w => {}
            (r, w) => self.result.add(
                ChangeKind::FieldTypeChanged,
                path,
                format!(
                    "field type changed from {} to {}",
                    r.describe(),
                    w.describe()
                ),
            ),
        }
    }

    fn enumeration(&mut self, path: &str, reader: &EnumElement, writer: &EnumElement) {
        for rc in &reader.constants {
            let at = join_path(path, &rc.name);
            if let Some(wc) = writer.constants.iter().find(|c| c.name == rc.name) {
                if wc.number != rc.number {
                    self.result.add(
                        ChangeKind::EnumConstantNumberChanged,
                        at,
                        format!("{} changed from {} to {}", rc.name, rc.number, wc.number),
                    );
                }
            } else if let Some(wc) = writer.constants.iter().find(|c| c.number == rc.number) {
                self.result.add(
                    ChangeKind::EnumConstantRenamed,
                    at,
                    format!("{} = {} renamed to {}", rc.name, rc.number, wc.name),
                );
            } else if writer.reserves(&rc.name, rc.number) {
                self.result.add(
                    ChangeKind::ReservedEnumConstantRemoved,
                    at,
                    format!("{} = {} removed and reserved", rc.name, rc.number),
                );
            } else {
                self.result.add(
                    ChangeKind::EnumConstantRemoved,
                    at,
                    format!("{} = {} removed", rc.name, rc.number),
                );
            }
        }

        for wc in &writer.constants {
            let known = reader
                .constants
                .iter()
                .any(|c| c.name == wc.name || c.number == wc.number);
            if !known {
                self.result.add(
                    ChangeKind::EnumConstantAdded,
                    join_path(path, &wc.name),
                    format!("{} = {} added", wc.name, wc.number),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Dependency, ParsedSchema};
    use std::sync::Arc;

    fn parse(text: &str) -> ProtobufSchema {
        ProtobufSchema::parse(text, &[]).unwrap()
    }

    fn parse_with(text: &str, deps: &[Dependency]) -> ProtobufSchema {
        ProtobufSchema::parse(text, deps).unwrap()
    }

    fn diff(reader: &ProtobufSchema, writer: &ProtobufSchema) -> CompareResult {
        let mut result = CompareResult::new();
        compare(reader, writer, &mut result);
        result
    }

    fn kinds(result: &CompareResult) -> Vec<ChangeKind> {
        result.records.iter().map(|r| r.kind).collect()
    }

    // ========================================================================
    // Fields
    // ========================================================================

    #[test]
    fn test_identical_schemas_have_no_records() {
        let text = "syntax = \"proto3\";\nmessage Msg { string name = 1; repeated int32 ids = 2; }";
        assert!(diff(&parse(text), &parse(text)).records.is_empty());
    }

    #[test]
    fn test_field_type_change_reported_at_field_path() {
        let v1 = parse("syntax = \"proto3\";\nmessage Msg { string name = 1; }");
        let v2 = parse("syntax = \"proto3\";\nmessage Msg { int32 name = 1; }");
        let result = diff(&v1, &v2);
        assert!(!result.is_compatible());
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0].kind, ChangeKind::FieldTypeChanged);
        assert_eq!(result.records[0].path, "Msg.name");
    }

    #[test]
    fn test_field_removed_unless_reserved() {
        let v1 = parse("syntax = \"proto3\";\nmessage M { string a = 1; string b = 2; }");
        let dropped = parse("syntax = \"proto3\";\nmessage M { string a = 1; }");
        let reserved = parse("syntax = \"proto3\";\nmessage M { reserved 2; string a = 1; }");
        let by_name = parse("syntax = \"proto3\";\nmessage M { reserved \"b\"; string a = 1; }");
        let extension = parse("syntax = \"proto2\";\nmessage M { optional string a = 1; extensions 2 to max; }");

        assert_eq!(kinds(&diff(&v1, &dropped)), vec![ChangeKind::FieldRemoved]);
        assert_eq!(kinds(&diff(&v1, &reserved)), vec![ChangeKind::ReservedFieldRemoved]);
        assert_eq!(kinds(&diff(&v1, &by_name)), vec![ChangeKind::ReservedFieldRemoved]);
        assert!(diff(&v1, &extension).incompatibilities().all(|r| r.kind == ChangeKind::SyntaxChanged));
    }

    #[test]
    fn test_reserved_tag_reuse_is_incompatible() {
        let reader = parse("syntax = \"proto3\";\nmessage M { reserved 2; string a = 1; }");
        let writer = parse("syntax = \"proto3\";\nmessage M { string a = 1; int64 b = 2; }");
        assert_eq!(kinds(&diff(&reader, &writer)), vec![ChangeKind::ReservedTagReused]);
    }

    #[test]
    fn test_rename_label_and_oneof_changes() {
        let v1 = parse("syntax = \"proto3\";\nmessage M { string a = 1; int32 n = 2; string c = 3; }");
        let v2 = parse(
            "syntax = \"proto3\";\nmessage M { string renamed = 1; repeated int32 n = 2; oneof o { string c = 3; } }",
        );
        let result = diff(&v1, &v2);
        assert_eq!(
            kinds(&result),
            vec![
                ChangeKind::FieldRenamed,
                ChangeKind::FieldLabelChanged,
                ChangeKind::FieldMovedIntoOneof
            ]
        );
        assert_eq!(result.incompatibilities().count(), 2);
    }

    #[test]
    fn test_optional_keyword_is_not_a_label_change() {
        let v1 = parse("syntax = \"proto3\";\nmessage M { string a = 1; }");
        let v2 = parse("syntax = \"proto3\";\nmessage M { optional string a = 1; }");
        assert!(diff(&v1, &v2).records.is_empty());
    }

    #[test]
    fn test_map_value_type_change() {
        let v1 = parse("syntax = \"proto3\";\nmessage M { map<string, int32> m = 1; }");
        let v2 = parse("syntax = \"proto3\";\nmessage M { map<string, int64> m = 1; }");
        assert_eq!(kinds(&diff(&v1, &v2)), vec![ChangeKind::FieldTypeChanged]);
    }

    // ========================================================================
    // Messages and enums
    // ========================================================================

    #[test]
    fn test_message_added_and_removed() {
        let v1 = parse("syntax = \"proto3\";\nmessage A {}\nmessage B {}");
        let v2 = parse("syntax = \"proto3\";\nmessage A {}\nmessage C {}");
        let result = diff(&v1, &v2);
        assert_eq!(kinds(&result), vec![ChangeKind::MessageRemoved, ChangeKind::MessageAdded]);
        assert_eq!(result.records[0].path, "B");
    }

    #[test]
    fn test_nested_message_compared_through_field() {
        let v1 = parse("syntax = \"proto3\";\nmessage Outer { message In { string s = 1; } In i = 1; }");
        let v2 = parse("syntax = \"proto3\";\nmessage Outer { message In { bytes s = 1; } In i = 1; }");
        let result = diff(&v1, &v2);
        assert_eq!(kinds(&result), vec![ChangeKind::FieldTypeChanged]);
        assert_eq!(result.records[0].path, "Outer.In.s");
    }

    #[test]
    fn test_recursive_message_terminates() {
        let text = "syntax = \"proto3\";\nmessage Node { repeated Node children = 1; string v = 2; }";
        assert!(diff(&parse(text), &parse(text)).records.is_empty());
    }

    #[test]
    fn test_enum_constant_rules() {
        let v1 = parse("syntax = \"proto3\";\nenum E { A = 0; B = 1; C = 2; D = 3; }");
        let v2 = parse("syntax = \"proto3\";\nenum E { reserved \"D\"; A = 0; B = 5; X = 2; Y = 9; }");
        let result = diff(&v1, &v2);
        assert_eq!(
            kinds(&result),
            vec![
                ChangeKind::EnumConstantNumberChanged,
                ChangeKind::EnumConstantRenamed,
                ChangeKind::ReservedEnumConstantRemoved,
                ChangeKind::EnumConstantAdded,
            ]
        );
        assert_eq!(result.records[0].path, "E.B");
    }

    #[test]
    fn test_package_change_is_incompatible() {
        let v1 = parse("syntax = \"proto3\";\npackage a;\nmessage M {}");
        let v2 = parse("syntax = \"proto3\";\npackage b;\nmessage M {}");
        assert_eq!(kinds(&diff(&v1, &v2)), vec![ChangeKind::PackageChanged]);
    }

    // ========================================================================
    // Linked schemas
    // ========================================================================

    fn container(field_type: &str) -> Dependency {
        let text = format!(
            "syntax = \"proto3\";\npackage container;\nmessage H {{ {} s = 1; }}\n",
            field_type
        );
        Dependency::new(
            "container.proto",
            Arc::new(ParsedSchema::Protobuf(parse(&text))),
        )
    }

    const USES_CONTAINER: &str = "syntax = \"proto3\";\nimport \"container.proto\";\n\
                                  message Msg { .container.H h = 1; }\n";

    #[test]
    fn test_change_inside_dependency_is_detected() {
        let reader = parse_with(USES_CONTAINER, &[container("string")]);
        let writer = parse_with(USES_CONTAINER, &[container("int32")]);
        let result = diff(&reader, &writer);
        assert_eq!(kinds(&result), vec![ChangeKind::FieldTypeChanged]);
        assert_eq!(result.records[0].path, "Msg.h.s");
    }

    #[test]
    fn test_local_message_swapped_for_well_known_type() {
        let local = parse_with(USES_CONTAINER, &[container("string")]);
        let external = parse(
            "syntax = \"proto3\";\nimport \"google/protobuf/any.proto\";\n\
             message Msg { google.protobuf.Any h = 1; }\n",
        );
        for (reader, writer) in [(&local, &external), (&external, &local)] {
            let result = diff(reader, writer);
            assert!(
                result.incompatibilities().any(|r| r.kind == ChangeKind::FieldTypeChanged),
                "{:?}",
                result.records
            );
        }
    }
}
