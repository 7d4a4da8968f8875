//! Protobuf text parser
//!
//! Covers proto2 and proto3 files: messages, enums, oneofs, maps, reserved
//! and extension ranges, extend blocks, services and options. Groups and
//! editions are rejected.

use super::elements::*;
use crate::error::{SchemaError, SchemaResult};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok {
    Ident(String),
    Number(String),
    /// String literal contents, normalized to double-quote escaping
    Str(String),
    Sym(char),
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    line: usize,
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

fn tokenize(text: &str) -> SchemaResult<Vec<Token>> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut line = 1;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\n' => {
                line += 1;
                i += 1;
            }
            c if c.is_whitespace() => i += 1,
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                loop {
                    match chars.get(i) {
                        None => return Err(syntax_error(line, "unterminated block comment")),
                        Some('*') if chars.get(i + 1) == Some(&'/') => {
                            i += 2;
                            break;
                        }
                        Some('\n') => {
                            line += 1;
                            i += 1;
                        }
                        Some(_) => i += 1,
                    }
                }
            }
            '"' | '\'' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None | Some('\n') => {
                            return Err(syntax_error(line, "unterminated string literal"))
                        }
                        Some('\\') => {
                            let escaped = chars
                                .get(i + 1)
                                .copied()
                                .ok_or_else(|| syntax_error(line, "unterminated string literal"))?;
                            if escaped == '\'' {
                                value.push('\'');
                            } else {
                                value.push('\\');
                                value.push(escaped);
                            }
                            i += 2;
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('"') => {
                            value.push_str("\\\"");
                            i += 1;
                        }
                        Some(&ch) => {
                            value.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token {
                    tok: Tok::Str(value),
                    line,
                });
            }
            c if is_ident_start(c)
                || (c == '.' && chars.get(i + 1).is_some_and(|n| is_ident_start(*n))) =>
            {
                let start = i;
                i += 1;
                while i < chars.len() && is_ident_char(chars[i]) {
                    i += 1;
                }
                tokens.push(Token {
                    tok: Tok::Ident(chars[start..i].iter().collect()),
                    line,
                });
            }
            c if c.is_ascii_digit()
                || (c == '.' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) =>
            {
                let start = i;
                let hex = c == '0' && matches!(chars.get(i + 1), Some('x') | Some('X'));
                i += 1;
                while i < chars.len() {
                    let ch = chars[i];
                    let exponent_sign = !hex
                        && (ch == '+' || ch == '-')
                        && matches!(chars[i - 1], 'e' | 'E');
                    if ch.is_ascii_alphanumeric() || ch == '.' || ch == '_' || exponent_sign {
                        i += 1;
                    } else {
                        break;
                    }
                }
                tokens.push(Token {
                    tok: Tok::Number(chars[start..i].iter().collect()),
                    line,
                });
            }
            c => {
                tokens.push(Token {
                    tok: Tok::Sym(c),
                    line,
                });
                i += 1;
            }
        }
    }
    Ok(tokens)
}

fn syntax_error(line: usize, message: impl std::fmt::Display) -> SchemaError {
    SchemaError::InvalidSchema(format!("Protobuf syntax error at line {}: {}", line, message))
}

/// Parse protobuf source text into a [`ProtoFile`]
pub fn parse(text: &str) -> SchemaResult<ProtoFile> {
    let tokens = tokenize(text)?;
    Parser { tokens, pos: 0 }.file()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|t| &t.tok)
    }

    fn peek_at(&self, offset: usize) -> Option<&Tok> {
        self.tokens.get(self.pos + offset).map(|t| &t.tok)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.line)
            .unwrap_or(1)
    }

    fn error(&self, message: impl std::fmt::Display) -> SchemaError {
        syntax_error(self.line(), message)
    }

    fn next(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).map(|t| t.tok.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn at_sym(&self, c: char) -> bool {
        self.peek() == Some(&Tok::Sym(c))
    }

    fn at_keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Tok::Ident(w)) if w == word)
    }

    fn eat_sym(&mut self, c: char) -> bool {
        if self.at_sym(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_sym(&mut self, c: char) -> SchemaResult<()> {
        if self.eat_sym(c) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}', found {}", c, self.describe_next())))
        }
    }

    fn expect_keyword(&mut self, word: &str) -> SchemaResult<()> {
        if self.at_keyword(word) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected '{}', found {}", word, self.describe_next())))
        }
    }

    fn ident(&mut self) -> SchemaResult<String> {
        match self.peek() {
            Some(Tok::Ident(word)) => {
                let word = word.clone();
                self.pos += 1;
                Ok(word)
            }
            _ => Err(self.error(format!("expected identifier, found {}", self.describe_next()))),
        }
    }

    fn string(&mut self) -> SchemaResult<String> {
        let mut value = match self.peek() {
            Some(Tok::Str(s)) => s.clone(),
            _ => return Err(self.error("expected string literal")),
        };
        self.pos += 1;
        // Adjacent literals concatenate
        while let Some(Tok::Str(s)) = self.peek() {
            value.push_str(s);
            self.pos += 1;
        }
        Ok(value)
    }

    fn describe_next(&self) -> String {
        match self.peek() {
            None => "end of input".to_string(),
            Some(Tok::Ident(s)) | Some(Tok::Number(s)) => format!("'{}'", s),
            Some(Tok::Str(s)) => format!("\"{}\"", s),
            Some(Tok::Sym(c)) => format!("'{}'", c),
        }
    }

    fn integer(&mut self) -> SchemaResult<i64> {
        let negative = self.eat_sym('-');
        let text = match self.peek() {
            Some(Tok::Number(n)) => n.clone(),
            _ => return Err(self.error("expected integer")),
        };
        self.pos += 1;
        let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            i64::from_str_radix(hex, 16)
        } else if text.len() > 1 && text.starts_with('0') {
            i64::from_str_radix(&text[1..], 8)
        } else {
            text.parse::<i64>()
        };
        let value = parsed.map_err(|_| self.error(format!("invalid integer '{}'", text)))?;
        Ok(if negative { -value } else { value })
    }

    fn tag(&mut self) -> SchemaResult<u32> {
        let value = self.integer()?;
        if value < 1 || value > i64::from(MAX_TAG_VALUE) {
            return Err(self.error(format!("tag {} out of range", value)));
        }
        Ok(value as u32)
    }

    fn range_bound(&mut self) -> SchemaResult<u32> {
        if self.at_keyword("max") {
            self.pos += 1;
            return Ok(MAX_TAG_VALUE);
        }
        let value = self.integer()?;
        u32::try_from(value).map_err(|_| self.error(format!("range bound {} out of range", value)))
    }

    fn tag_range(&mut self) -> SchemaResult<TagRange> {
        let lo = self.range_bound()?;
        if self.at_keyword("to") {
            self.pos += 1;
            let hi = self.range_bound()?;
            if hi < lo {
                return Err(self.error(format!("empty range {} to {}", lo, hi)));
            }
            Ok(TagRange::Range(lo, hi))
        } else {
            Ok(TagRange::Single(lo))
        }
    }

    // ------------------------------------------------------------------------
    // Options
    // ------------------------------------------------------------------------

    fn option_name(&mut self) -> SchemaResult<String> {
        let mut name = String::new();
        loop {
            if self.eat_sym('(') {
                name.push('(');
                name.push_str(&self.ident()?);
                self.expect_sym(')')?;
                name.push(')');
            } else {
                name.push_str(&self.ident()?);
            }
            // `(custom).field` lexes the suffix as an identifier starting with '.'
            match self.peek() {
                Some(Tok::Ident(s)) if s.starts_with('.') => {
                    name.push_str(s);
                    self.pos += 1;
                    break;
                }
                Some(Tok::Sym('.')) => {
                    self.pos += 1;
                    name.push('.');
                }
                _ => break,
            }
        }
        Ok(name)
    }

    fn option_value(&mut self) -> SchemaResult<String> {
        match self.peek() {
            Some(Tok::Str(_)) => Ok(format!("\"{}\"", self.string()?)),
            Some(Tok::Sym('-')) => {
                self.pos += 1;
                match self.next() {
                    Some(Tok::Number(n)) | Some(Tok::Ident(n)) => Ok(format!("-{}", n)),
                    _ => Err(self.error("expected number after '-'")),
                }
            }
            Some(Tok::Number(_)) | Some(Tok::Ident(_)) => match self.next() {
                Some(Tok::Number(n)) | Some(Tok::Ident(n)) => Ok(n),
                _ => Err(self.error("expected option value")),
            },
            Some(Tok::Sym('{')) => self.aggregate(),
            _ => Err(self.error(format!("expected option value, found {}", self.describe_next()))),
        }
    }

    /// Text-format aggregate value, re-rendered token by token
    fn aggregate(&mut self) -> SchemaResult<String> {
        let mut depth = 0usize;
        let mut parts = Vec::new();
        loop {
            let tok = self
                .next()
                .ok_or_else(|| self.error("unterminated aggregate option value"))?;
            match &tok {
                Tok::Sym('{') => depth += 1,
                Tok::Sym('}') => depth -= 1,
                _ => {}
            }
            parts.push(match tok {
                Tok::Ident(s) | Tok::Number(s) => s,
                Tok::Str(s) => format!("\"{}\"", s),
                Tok::Sym(c) => c.to_string(),
            });
            if depth == 0 {
                break;
            }
        }
        Ok(parts.join(" "))
    }

    fn option(&mut self) -> SchemaResult<OptionElement> {
        let name = self.option_name()?;
        self.expect_sym('=')?;
        let value = self.option_value()?;
        Ok(OptionElement { name, value })
    }

    fn option_statement(&mut self) -> SchemaResult<OptionElement> {
        self.expect_keyword("option")?;
        let option = self.option()?;
        self.expect_sym(';')?;
        Ok(option)
    }

    fn inline_options(&mut self) -> SchemaResult<Vec<OptionElement>> {
        let mut options = Vec::new();
        if self.eat_sym('[') {
            loop {
                options.push(self.option()?);
                if self.eat_sym(']') {
                    break;
                }
                self.expect_sym(',')?;
            }
        }
        Ok(options)
    }

    // ------------------------------------------------------------------------
    // File
    // ------------------------------------------------------------------------

    fn file(mut self) -> SchemaResult<ProtoFile> {
        let mut file = ProtoFile::default();
        while let Some(tok) = self.peek().cloned() {
            match tok {
                Tok::Sym(';') => self.pos += 1,
                Tok::Ident(word) => match word.as_str() {
                    "syntax" => {
                        if file.syntax.is_some() || file.package.is_some() || !file.types.is_empty() {
                            return Err(self.error("syntax must be the first statement"));
                        }
                        self.pos += 1;
                        self.expect_sym('=')?;
                        let syntax = self.string()?;
                        if syntax != "proto2" && syntax != "proto3" {
                            return Err(self.error(format!("unsupported syntax \"{}\"", syntax)));
                        }
                        self.expect_sym(';')?;
                        file.syntax = Some(syntax);
                    }
                    "edition" => return Err(self.error("editions are not supported")),
                    "package" => {
                        if file.package.is_some() {
                            return Err(self.error("duplicate package statement"));
                        }
                        self.pos += 1;
                        file.package = Some(self.ident()?);
                        self.expect_sym(';')?;
                    }
                    "import" => {
                        self.pos += 1;
                        let kind = if self.at_keyword("public") {
                            self.pos += 1;
                            ImportKind::Public
                        } else if self.at_keyword("weak") {
                            self.pos += 1;
                            ImportKind::Weak
                        } else {
                            ImportKind::Default
                        };
                        let path = self.string()?;
                        self.expect_sym(';')?;
                        file.imports.push(Import { path, kind });
                    }
                    "option" => file.options.push(self.option_statement()?),
                    "message" => file.types.push(TypeElement::Message(self.message()?)),
                    "enum" => file.types.push(TypeElement::Enum(self.enumeration()?)),
                    "extend" => file.extends.push(self.extend()?),
                    "service" => file.services.push(self.service()?),
                    other => return Err(self.error(format!("unexpected '{}'", other))),
                },
                _ => return Err(self.error(format!("unexpected {}", self.describe_next()))),
            }
        }
        Ok(file)
    }

    // ------------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------------

    fn message(&mut self) -> SchemaResult<MessageElement> {
        self.expect_keyword("message")?;
        let mut message = MessageElement {
            name: self.ident()?,
            ..Default::default()
        };
        self.expect_sym('{')?;
        loop {
            match self.peek().cloned() {
                None => return Err(self.error(format!("unterminated message {}", message.name))),
                Some(Tok::Sym('}')) => {
                    self.pos += 1;
                    break;
                }
                Some(Tok::Sym(';')) => self.pos += 1,
                Some(Tok::Ident(word)) => match word.as_str() {
                    "option" => message.options.push(self.option_statement()?),
                    "reserved" => message.reserveds.push(self.reserved()?),
                    "extensions" => {
                        self.pos += 1;
                        let mut ranges = vec![self.tag_range()?];
                        while self.eat_sym(',') {
                            ranges.push(self.tag_range()?);
                        }
                        let options = self.inline_options()?;
                        self.expect_sym(';')?;
                        message.extensions.push(ExtensionsElement { ranges, options });
                    }
                    "message" if self.is_declaration() => {
                        message.nested.push(TypeElement::Message(self.message()?))
                    }
                    "enum" if self.is_declaration() => {
                        message.nested.push(TypeElement::Enum(self.enumeration()?))
                    }
                    "extend" if self.is_declaration() => message.extends.push(self.extend()?),
                    "oneof" if self.is_declaration() => message.oneofs.push(self.oneof()?),
                    _ => message.fields.push(self.field(true)?),
                },
                Some(_) => return Err(self.error(format!("unexpected {}", self.describe_next()))),
            }
        }
        Ok(message)
    }

    /// `keyword Name {` as opposed to a field whose type is named like a keyword
    fn is_declaration(&self) -> bool {
        matches!(self.peek_at(1), Some(Tok::Ident(_)))
            && matches!(self.peek_at(2), Some(Tok::Sym('{')))
    }

    fn field(&mut self, allow_label: bool) -> SchemaResult<FieldElement> {
        let label = match self.peek() {
            Some(Tok::Ident(w)) if allow_label => match w.as_str() {
                "optional" => Some(Label::Optional),
                "required" => Some(Label::Required),
                "repeated" => Some(Label::Repeated),
                _ => None,
            },
            _ => None,
        };
        if label.is_some() {
            self.pos += 1;
        }
        if self.at_keyword("group") {
            return Err(self.error("groups are not supported"));
        }

        let type_name = if self.at_keyword("map") && self.peek_at(1) == Some(&Tok::Sym('<')) {
            self.pos += 2;
            let key = self.ident()?;
            self.expect_sym(',')?;
            let value = self.ident()?;
            self.expect_sym('>')?;
            format!("map<{}, {}>", key, value)
        } else {
            self.ident()?
        };
        let name = self.ident()?;
        self.expect_sym('=')?;
        let tag = self.tag()?;
        let options = self.inline_options()?;
        self.expect_sym(';')?;

        Ok(FieldElement {
            label,
            type_name,
            name,
            tag,
            options,
        })
    }

    fn oneof(&mut self) -> SchemaResult<OneOfElement> {
        self.expect_keyword("oneof")?;
        let name = self.ident()?;
        self.expect_sym('{')?;
        let mut oneof = OneOfElement {
            name,
            options: Vec::new(),
            fields: Vec::new(),
        };
        loop {
            if self.eat_sym('}') {
                break;
            }
            if self.eat_sym(';') {
                continue;
            }
            if self.peek().is_none() {
                return Err(self.error(format!("unterminated oneof {}", oneof.name)));
            }
            if self.at_keyword("option") {
                oneof.options.push(self.option_statement()?);
            } else {
                oneof.fields.push(self.field(false)?);
            }
        }
        Ok(oneof)
    }

    fn reserved(&mut self) -> SchemaResult<ReservedElement> {
        self.expect_keyword("reserved")?;
        let mut values = Vec::new();
        loop {
            if let Some(Tok::Str(_)) = self.peek() {
                values.push(ReservedValue::Name(self.string()?));
            } else if let Some(Tok::Ident(name)) = self.peek().cloned() {
                // edition-style bare identifiers
                self.pos += 1;
                values.push(ReservedValue::Name(name));
            } else {
                values.push(ReservedValue::Tags(self.tag_range()?));
            }
            if !self.eat_sym(',') {
                break;
            }
        }
        self.expect_sym(';')?;
        Ok(ReservedElement { values })
    }

    fn extend(&mut self) -> SchemaResult<ExtendElement> {
        self.expect_keyword("extend")?;
        let name = self.ident()?;
        self.expect_sym('{')?;
        let mut fields = Vec::new();
        loop {
            if self.eat_sym('}') {
                break;
            }
            if self.eat_sym(';') {
                continue;
            }
            if self.peek().is_none() {
                return Err(self.error(format!("unterminated extend {}", name)));
            }
            fields.push(self.field(true)?);
        }
        Ok(ExtendElement { name, fields })
    }

    // ------------------------------------------------------------------------
    // Enums
    // ------------------------------------------------------------------------

    fn enumeration(&mut self) -> SchemaResult<EnumElement> {
        self.expect_keyword("enum")?;
        let mut element = EnumElement {
            name: self.ident()?,
            ..Default::default()
        };
        self.expect_sym('{')?;
        loop {
            match self.peek().cloned() {
                None => return Err(self.error(format!("unterminated enum {}", element.name))),
                Some(Tok::Sym('}')) => {
                    self.pos += 1;
                    break;
                }
                Some(Tok::Sym(';')) => self.pos += 1,
                Some(Tok::Ident(word)) if word == "option" && self.peek_at(1) != Some(&Tok::Sym('=')) => {
                    element.options.push(self.option_statement()?)
                }
                Some(Tok::Ident(word)) if word == "reserved" && self.peek_at(1) != Some(&Tok::Sym('=')) => {
                    element.reserveds.push(self.reserved()?)
                }
                Some(Tok::Ident(name)) => {
                    self.pos += 1;
                    self.expect_sym('=')?;
                    let number = self.integer()?;
                    let number = i32::try_from(number)
                        .map_err(|_| self.error(format!("enum value {} out of range", number)))?;
                    let options = self.inline_options()?;
                    self.expect_sym(';')?;
                    element.constants.push(EnumConstant {
                        name,
                        number,
                        options,
                    });
                }
                Some(_) => return Err(self.error(format!("unexpected {}", self.describe_next()))),
            }
        }
        Ok(element)
    }

    // ------------------------------------------------------------------------
    // Services
    // ------------------------------------------------------------------------

    fn service(&mut self) -> SchemaResult<ServiceElement> {
        self.expect_keyword("service")?;
        let mut service = ServiceElement {
            name: self.ident()?,
            options: Vec::new(),
            rpcs: Vec::new(),
        };
        self.expect_sym('{')?;
        loop {
            if self.eat_sym('}') {
                break;
            }
            if self.eat_sym(';') {
                continue;
            }
            if self.at_keyword("option") {
                service.options.push(self.option_statement()?);
            } else if self.at_keyword("rpc") {
                service.rpcs.push(self.rpc()?);
            } else {
                return Err(self.error(format!(
                    "unexpected {} in service {}",
                    self.describe_next(),
                    service.name
                )));
            }
        }
        Ok(service)
    }

    fn rpc_type(&mut self) -> SchemaResult<(String, bool)> {
        self.expect_sym('(')?;
        // `stream` is only a keyword when a type name follows it
        let streaming = self.at_keyword("stream") && matches!(self.peek_at(1), Some(Tok::Ident(_)));
        if streaming {
            self.pos += 1;
        }
        let type_name = self.ident()?;
        self.expect_sym(')')?;
        Ok((type_name, streaming))
    }

    fn rpc(&mut self) -> SchemaResult<RpcElement> {
        self.expect_keyword("rpc")?;
        let name = self.ident()?;
        let (request_type, request_streaming) = self.rpc_type()?;
        self.expect_keyword("returns")?;
        let (response_type, response_streaming) = self.rpc_type()?;
        let mut options = Vec::new();
        if self.eat_sym('{') {
            loop {
                if self.eat_sym('}') {
                    break;
                }
                if self.eat_sym(';') {
                    continue;
                }
                options.push(self.option_statement()?);
            }
            self.eat_sym(';');
        } else {
            self.expect_sym(';')?;
        }
        Ok(RpcElement {
            name,
            request_type,
            request_streaming,
            response_type,
            response_streaming,
            options,
        })
    }
}
