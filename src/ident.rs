//! The identifier extension: bare alphanumeric runs that are neither
//! JSON keywords nor registered constants are kept as values of their
//! own type, laid out exactly like copied strings.

use std::borrow::Cow;
use std::sync::OnceLock;

use crate::cell::{Cell, Payload, STRING_SIZE, TOKEN_SIZE};
use crate::error::{Error, Result};
use crate::flag;
use crate::stack::{self, Stack};
use crate::types::{self, TypeOps};
use crate::value::Value;

static IDENT_TYPE: OnceLock<u16> = OnceLock::new();

/// Register the identifier type and hook the parser so unmatched bare
/// identifiers become identifier values. Turns `ALLOW_IDENTS` on by
/// default. Call after [`types::init`]; returns the type id.
pub fn register() -> u16 {
    let ty = *IDENT_TYPE.get_or_init(|| {
        types::register(TypeOps {
            name: "identifier",
            size: ident_size,
            len: Some(ident_len),
            test: ident_test,
            clone: None,
            free: None,
            build_json: Some(ident_build_json),
        })
    });

    stack::set_push_ident(push_ident_at_index);
    crate::add_default_flags(flag::ALLOW_IDENTS);
    ty
}

/// The registered identifier type id, if the extension is registered.
pub fn type_id() -> Option<u16> {
    IDENT_TYPE.get().copied()
}

/// The identifier's name.
pub fn name(value: &Value) -> Cow<'_, str> {
    value.get_string()
}

// Identifiers are stored like strings: up to 8 bytes in the head cell,
// then up to 16 in each continuation cell.
fn ident_size(head: &Cell) -> u32 {
    1 + ((u64::from(head.len) + 8) / 16) as u32
}

fn ident_len(value: &Value) -> usize {
    value.head().len as usize
}

fn ident_test(value: &Value) -> bool {
    value.head().len != 0
}

// Emitted bare, the way it was parsed.
fn ident_build_json(value: &Value, out: &mut String) {
    out.push_str(&value.get_string());
}

/// Called back from the parser when an unrecognized identifier is found.
fn push_ident_at_index(stack: &mut Stack, index: usize, ident: &[u8]) -> Result<()> {
    let ty = type_id().expect("identifier type is not registered");
    let len = u32::try_from(ident.len()).map_err(|_| Error::StringTooLong)?;

    if ident.len() >= STRING_SIZE {
        stack.expand((ident.len() + STRING_SIZE) / TOKEN_SIZE);
    }

    stack.cells[index] = Cell {
        ty: u32::from(ty),
        len,
        payload: Payload::Str([0; STRING_SIZE]),
    };

    for (pos, &byte) in ident.iter().enumerate() {
        stack.put_string_byte(index, pos, byte);
    }

    stack.put_string_byte(index, ident.len(), 0);
    Ok(())
}
