//! Protobuf schema tree and its canonical text rendering
//!
//! Rendering drops comments and layout, sorts option sets and imports, and
//! keeps declaration order everywhere else. Tags are explicit, so field
//! order carries no meaning, but the declared order is kept stable.

use std::fmt::Write as _;

/// Highest field number a message may use (2^29 - 1)
pub const MAX_TAG_VALUE: u32 = 536_870_911;

const INDENT: &str = "  ";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProtoFile {
    pub syntax: Option<String>,
    pub package: Option<String>,
    pub imports: Vec<Import>,
    pub options: Vec<OptionElement>,
    pub types: Vec<TypeElement>,
    pub extends: Vec<ExtendElement>,
    pub services: Vec<ServiceElement>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ImportKind {
    Default,
    Public,
    Weak,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Import {
    pub path: String,
    pub kind: ImportKind,
}

/// `name = value`; the value is kept in its rendered form
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct OptionElement {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeElement {
    Message(MessageElement),
    Enum(EnumElement),
}

impl TypeElement {
    pub fn name(&self) -> &str {
        match self {
            TypeElement::Message(m) => &m.name,
            TypeElement::Enum(e) => &e.name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageElement {
    pub name: String,
    pub options: Vec<OptionElement>,
    pub reserveds: Vec<ReservedElement>,
    pub fields: Vec<FieldElement>,
    pub oneofs: Vec<OneOfElement>,
    pub extensions: Vec<ExtensionsElement>,
    pub nested: Vec<TypeElement>,
    pub extends: Vec<ExtendElement>,
}

impl MessageElement {
    /// Every field with the oneof it belongs to
    pub fn all_fields(&self) -> impl Iterator<Item = (&FieldElement, Option<&str>)> {
        self.fields.iter().map(|f| (f, None)).chain(
            self.oneofs
                .iter()
                .flat_map(|o| o.fields.iter().map(move |f| (f, Some(o.name.as_str())))),
        )
    }

    /// Whether `tag` is reserved or claimed by an extension range
    pub fn reserves_tag(&self, tag: u32) -> bool {
        self.reserveds.iter().any(|r| r.contains_tag(tag))
            || self
                .extensions
                .iter()
                .any(|e| e.ranges.iter().any(|r| r.contains(tag)))
    }

    pub fn reserves_name(&self, name: &str) -> bool {
        self.reserveds.iter().any(|r| r.contains_name(name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    Optional,
    Required,
    Repeated,
}

impl Label {
    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Optional => "optional",
            Label::Required => "required",
            Label::Repeated => "repeated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldElement {
    pub label: Option<Label>,
    /// Declared type, e.g. `string`, `.pkg.Msg` or `map<string, int32>`
    pub type_name: String,
    pub name: String,
    pub tag: u32,
    pub options: Vec<OptionElement>,
}

impl FieldElement {
    pub fn is_repeated(&self) -> bool {
        self.label == Some(Label::Repeated) || self.type_name.starts_with("map<")
    }

    pub fn is_required(&self) -> bool {
        self.label == Some(Label::Required)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneOfElement {
    pub name: String,
    pub options: Vec<OptionElement>,
    pub fields: Vec<FieldElement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EnumElement {
    pub name: String,
    pub options: Vec<OptionElement>,
    pub reserveds: Vec<ReservedElement>,
    pub constants: Vec<EnumConstant>,
}

impl EnumElement {
    pub fn reserves(&self, name: &str, number: i32) -> bool {
        self.reserveds.iter().any(|r| {
            r.contains_name(name) || u32::try_from(number).is_ok_and(|n| r.contains_tag(n))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumConstant {
    pub name: String,
    pub number: i32,
    pub options: Vec<OptionElement>,
}

/// A single tag or an inclusive tag range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagRange {
    Single(u32),
    Range(u32, u32),
}

impl TagRange {
    pub fn contains(&self, tag: u32) -> bool {
        match *self {
            TagRange::Single(t) => t == tag,
            TagRange::Range(lo, hi) => lo <= tag && tag <= hi,
        }
    }
}

impl std::fmt::Display for TagRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            TagRange::Single(t) => write!(f, "{}", t),
            TagRange::Range(lo, hi) if hi >= MAX_TAG_VALUE => write!(f, "{} to max", lo),
            TagRange::Range(lo, hi) => write!(f, "{} to {}", lo, hi),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservedValue {
    Tags(TagRange),
    Name(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedElement {
    pub values: Vec<ReservedValue>,
}

impl ReservedElement {
    pub fn contains_tag(&self, tag: u32) -> bool {
        self.values
            .iter()
            .any(|v| matches!(v, ReservedValue::Tags(r) if r.contains(tag)))
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.values
            .iter()
            .any(|v| matches!(v, ReservedValue::Name(n) if n == name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionsElement {
    pub ranges: Vec<TagRange>,
    pub options: Vec<OptionElement>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendElement {
    pub name: String,
    pub fields: Vec<FieldElement>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceElement {
    pub name: String,
    pub options: Vec<OptionElement>,
    pub rpcs: Vec<RpcElement>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcElement {
    pub name: String,
    pub request_type: String,
    pub request_streaming: bool,
    pub response_type: String,
    pub response_streaming: bool,
    pub options: Vec<OptionElement>,
}

// ============================================================================
// Rendering
// ============================================================================

impl ProtoFile {
    /// Canonical text form
    pub fn to_schema(&self) -> String {
        let mut out = String::new();
        if let Some(syntax) = &self.syntax {
            let _ = writeln!(out, "syntax = \"{}\";", syntax);
        }
        if let Some(package) = &self.package {
            let _ = writeln!(out, "package {};", package);
        }

        if !self.imports.is_empty() {
            out.push('\n');
            let mut imports = self.imports.clone();
            imports.sort();
            imports.dedup();
            for import in &imports {
                let kind = match import.kind {
                    ImportKind::Default => "",
                    ImportKind::Public => "public ",
                    ImportKind::Weak => "weak ",
                };
                let _ = writeln!(out, "import {}\"{}\";", kind, import.path);
            }
        }

        if !self.options.is_empty() {
            out.push('\n');
            render_options(&mut out, &self.options, 0);
        }

        for element in &self.types {
            out.push('\n');
            render_type(&mut out, element, 0);
        }
        for extend in &self.extends {
            out.push('\n');
            render_extend(&mut out, extend, 0);
        }
        for service in &self.services {
            out.push('\n');
            render_service(&mut out, service);
        }
        out
    }
}

fn indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push_str(INDENT);
    }
}

fn sorted(options: &[OptionElement]) -> Vec<&OptionElement> {
    let mut sorted: Vec<&OptionElement> = options.iter().collect();
    sorted.sort();
    sorted
}

fn render_options(out: &mut String, options: &[OptionElement], depth: usize) {
    for option in sorted(options) {
        indent(out, depth);
        let _ = writeln!(out, "option {} = {};", option.name, option.value);
    }
}

fn render_inline_options(out: &mut String, options: &[OptionElement]) {
    if options.is_empty() {
        return;
    }
    let rendered: Vec<String> = sorted(options)
        .into_iter()
        .map(|o| format!("{} = {}", o.name, o.value))
        .collect();
    let _ = write!(out, " [{}]", rendered.join(", "));
}

fn render_type(out: &mut String, element: &TypeElement, depth: usize) {
    match element {
        TypeElement::Message(m) => render_message(out, m, depth),
        TypeElement::Enum(e) => render_enum(out, e, depth),
    }
}

fn render_reserved(out: &mut String, reserved: &ReservedElement, depth: usize) {
    let values: Vec<String> = reserved
        .values
        .iter()
        .map(|v| match v {
            ReservedValue::Tags(r) => r.to_string(),
            ReservedValue::Name(n) => format!("\"{}\"", n),
        })
        .collect();
    indent(out, depth);
    let _ = writeln!(out, "reserved {};", values.join(", "));
}

fn render_field(out: &mut String, field: &FieldElement, depth: usize) {
    indent(out, depth);
    if let Some(label) = field.label {
        let _ = write!(out, "{} ", label.as_str());
    }
    let _ = write!(out, "{} {} = {}", field.type_name, field.name, field.tag);
    render_inline_options(out, &field.options);
    out.push_str(";\n");
}

fn render_message(out: &mut String, message: &MessageElement, depth: usize) {
    indent(out, depth);
    let _ = writeln!(out, "message {} {{", message.name);
    render_options(out, &message.options, depth + 1);
    for reserved in &message.reserveds {
        render_reserved(out, reserved, depth + 1);
    }
    for field in &message.fields {
        render_field(out, field, depth + 1);
    }
    for oneof in &message.oneofs {
        indent(out, depth + 1);
        let _ = writeln!(out, "oneof {} {{", oneof.name);
        render_options(out, &oneof.options, depth + 2);
        for field in &oneof.fields {
            render_field(out, field, depth + 2);
        }
        indent(out, depth + 1);
        out.push_str("}\n");
    }
    for extensions in &message.extensions {
        let ranges: Vec<String> = extensions.ranges.iter().map(TagRange::to_string).collect();
        indent(out, depth + 1);
        let _ = write!(out, "extensions {}", ranges.join(", "));
        render_inline_options(out, &extensions.options);
        out.push_str(";\n");
    }
    for nested in &message.nested {
        render_type(out, nested, depth + 1);
    }
    for extend in &message.extends {
        render_extend(out, extend, depth + 1);
    }
    indent(out, depth);
    out.push_str("}\n");
}

fn render_enum(out: &mut String, element: &EnumElement, depth: usize) {
    indent(out, depth);
    let _ = writeln!(out, "enum {} {{", element.name);
    render_options(out, &element.options, depth + 1);
    for reserved in &element.reserveds {
        render_reserved(out, reserved, depth + 1);
    }
    for constant in &element.constants {
        indent(out, depth + 1);
        let _ = write!(out, "{} = {}", constant.name, constant.number);
        render_inline_options(out, &constant.options);
        out.push_str(";\n");
    }
    indent(out, depth);
    out.push_str("}\n");
}

fn render_extend(out: &mut String, extend: &ExtendElement, depth: usize) {
    indent(out, depth);
    let _ = writeln!(out, "extend {} {{", extend.name);
    for field in &extend.fields {
        render_field(out, field, depth + 1);
    }
    indent(out, depth);
    out.push_str("}\n");
}

fn render_service(out: &mut String, service: &ServiceElement) {
    let _ = writeln!(out, "service {} {{", service.name);
    render_options(out, &service.options, 1);
    for rpc in &service.rpcs {
        indent(out, 1);
        let stream = |s: bool| if s { "stream " } else { "" };
        let _ = write!(
            out,
            "rpc {} ({}{}) returns ({}{})",
            rpc.name,
            stream(rpc.request_streaming),
            rpc.request_type,
            stream(rpc.response_streaming),
            rpc.response_type
        );
        if rpc.options.is_empty() {
            out.push_str(";\n");
        } else {
            out.push_str(" {\n");
            render_options(out, &rpc.options, 2);
            indent(out, 1);
            out.push_str("}\n");
        }
    }
    out.push_str("}\n");
}
