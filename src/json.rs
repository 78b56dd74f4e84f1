//! JSON text serialization: the `build_json` implementations for the
//! built-in types and the dispatch that stitches them together.

use std::fmt::{self, Write};

use crate::flag;
use crate::types;
use crate::value::{Document, Value};

/// Serialize a value as JSON text, dispatching through the registered
/// per-type serializers.
pub(crate) fn build(value: &Value, out: &mut String) {
    let value = value.follow();
    let ty = value.head().type_id();

    match types::build_json_fn(ty) {
        Some(build) => build(value, out),
        None => panic!("type {} has no JSON serializer", types::to_str(ty)),
    }
}

pub(crate) fn build_null(_: &Value, out: &mut String) {
    out.push_str("null");
}

pub(crate) fn build_bool(value: &Value, out: &mut String) {
    out.push_str(if value.get_bool() { "true" } else { "false" });
}

pub(crate) fn build_number(value: &Value, out: &mut String) {
    if value.head().has_flag(flag::IS_UINT) {
        let _ = write!(out, "{}", value.get_uint());
        return;
    }

    let number = value.get_number();

    if number.is_finite() {
        let _ = write!(out, "{number}");
    } else {
        out.push_str("null"); // JSON has no spelling for NaN or infinity
    }
}

pub(crate) fn build_string(value: &Value, out: &mut String) {
    escape_into(&value.get_string(), out);
}

pub(crate) fn build_array(value: &Value, out: &mut String) {
    out.push('[');

    for (i, element) in value.iter_elements().enumerate() {
        if i > 0 {
            out.push(',');
        }

        build(element, out);
    }

    out.push(']');
}

pub(crate) fn build_object(value: &Value, out: &mut String) {
    out.push('{');

    for (i, (name, member)) in value.iter_members().enumerate() {
        if i > 0 {
            out.push(',');
        }

        escape_into(&name.get_string(), out);
        out.push(':');
        build(member, out);
    }

    out.push('}');
}

/// Append `string` as a quoted JSON string literal.
pub(crate) fn escape_into(string: &str, out: &mut String) {
    out.push('"');

    for c in string.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }

    out.push('"');
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_json())
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value({self})")
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Document({self})")
    }
}
