use std::ptr::NonNull;
use std::sync::OnceLock;

use crate::flag;
use crate::types::JsonType;
use crate::value::Value;

/// String bytes held inline by a head cell, including the terminating
/// NUL when the string is short enough to fit.
pub const STRING_SIZE: usize = 8;
/// String bytes held by each continuation cell.
pub const TOKEN_SIZE: usize = 16;

/// The fixed-size storage unit. A value is a contiguous run of cells (a
/// span): scalars take one cell, copied strings longer than 7 bytes spill
/// into continuation cells, and collections are a head cell immediately
/// followed by their children's spans.
#[derive(Clone, Debug)]
pub struct Cell {
    /// Type id in the low 16 bits, flags in the high half.
    pub(crate) ty: u32,
    /// String length in bytes, or element/member count for collections.
    pub(crate) len: u32,
    pub(crate) payload: Payload,
}

/// The discriminated payload. The original record overlays these as an
/// 8-byte union; a tagged sum keeps every access checked.
#[derive(Clone, Debug)]
pub(crate) enum Payload {
    /// Null values and freshly reserved slots.
    None,
    Bool(bool),
    Number(f64),
    Uint(u64),
    /// First 8 bytes of a copied string, NUL terminated when it fits.
    Str([u8; STRING_SIZE]),
    /// 16 raw bytes continuing a copied string from the previous cell.
    Chunk([u8; TOKEN_SIZE]),
    /// String bytes held outside the span.
    StrRef(StrRef),
    /// A closed collection: its span size and lazily published index.
    Spanned(Span),
    /// A collection still under construction on a stack.
    Open(Open),
    /// Points at another value's head cell; reads follow it transparently.
    Ref(NonNull<Cell>),
}

#[derive(Clone, Debug)]
pub(crate) enum StrRef {
    /// A shared constant the span is not responsible for freeing.
    Shared(&'static str),
    /// Bytes owned by this cell (`IS_OWN`), freed with the span.
    Owned(Box<str>),
}

impl StrRef {
    pub(crate) fn as_str(&self) -> &str {
        match self {
            StrRef::Shared(s) => s,
            StrRef::Owned(s) => s,
        }
    }
}

/// Collection payload after `close_collection`. The span size stays
/// valid after indexing, so `size()` never needs the offset table.
#[derive(Clone, Debug)]
pub(crate) struct Span {
    /// Cell count of the whole span, head included.
    pub(crate) size: u32,
    /// Offset index, published atomically on first element/member access.
    pub(crate) index: OnceLock<Index>,
}

impl Span {
    pub(crate) fn new(size: u32) -> Self {
        Span {
            size,
            index: OnceLock::new(),
        }
    }
}

/// Sentinel for an empty hash bucket or the end of a member chain.
pub(crate) const NO_MEMBER: u32 = u32::MAX;

/// Offset index of a collection. Offsets are in cells, relative to the
/// head. For objects, `buckets` and `links` form an open hash over the
/// member names: `buckets[hash % len]` is the first member index in the
/// bucket and `links[m]` chains to the next, both `NO_MEMBER` terminated.
#[derive(Clone, Debug)]
pub(crate) struct Index {
    pub(crate) offsets: Box<[u32]>,
    pub(crate) buckets: Box<[u32]>,
    pub(crate) links: Box<[u32]>,
}

/// Parser-only payload of a collection under construction.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Open {
    /// An object member name has been added with no value yet.
    pub(crate) no_value: bool,
    /// A nested collection is still open. Never observed set at close.
    pub(crate) nested: bool,
    /// Index + 1 of the enclosing open collection, or 0 at the root.
    pub(crate) parent: u32,
}

// A finished cell is immutable except for the one-shot index publication,
// which the OnceLock serializes. Reference payloads are read-only aliases
// whose liveness is the creator's contract (see `Cell::reference`).
unsafe impl Send for Cell {}
unsafe impl Sync for Cell {}

impl Cell {
    pub(crate) fn invalid() -> Self {
        Cell {
            ty: JsonType::Invalid as u32,
            len: 0,
            payload: Payload::None,
        }
    }

    pub fn null() -> Self {
        Cell {
            ty: JsonType::Null as u32,
            len: 0,
            payload: Payload::None,
        }
    }

    pub fn boolean(boolean: bool) -> Self {
        Cell {
            ty: JsonType::Bool as u32,
            len: 0,
            payload: Payload::Bool(boolean),
        }
    }

    pub fn number(number: f64) -> Self {
        Cell {
            ty: JsonType::Number as u32,
            len: 0,
            payload: Payload::Number(number),
        }
    }

    pub fn uint(uint: u64) -> Self {
        Cell {
            ty: JsonType::Number as u32 | flag::IS_UINT,
            len: 0,
            payload: Payload::Uint(uint),
        }
    }

    /// A string cell referencing an immutable constant.
    pub fn string_ref(string: &'static str) -> Self {
        Cell {
            ty: JsonType::String as u32 | flag::IS_REF,
            len: string.len().try_into().expect("string exceeds u32::MAX"),
            payload: Payload::StrRef(StrRef::Shared(string)),
        }
    }

    /// A string cell owning a duplicate of `string`.
    pub fn string_dup(string: &str) -> Self {
        Cell {
            ty: JsonType::String as u32 | flag::IS_REF | flag::IS_OWN,
            len: string.len().try_into().expect("string exceeds u32::MAX"),
            payload: Payload::StrRef(StrRef::Owned(string.into())),
        }
    }

    /// A cell that behaves exactly like the value it points at.
    ///
    /// # Safety
    ///
    /// `to` must outlive every read of the constructed cell. The
    /// reference is a raw alias; dropping or moving the referent while
    /// the cell is still reachable invalidates it.
    pub unsafe fn reference(to: &Value) -> Self {
        Cell {
            ty: JsonType::Reference as u32,
            len: 0,
            payload: Payload::Ref(NonNull::from(&to.cells()[0])),
        }
    }

    /// The type id with the flag bits masked off.
    pub fn type_id(&self) -> u16 {
        (self.ty & flag::TYPE_MASK) as u16
    }

    pub(crate) fn has_flag(&self, bit: u32) -> bool {
        self.ty & bit != 0
    }

    /// The inline bytes of a copied string head, including the NUL when
    /// the string is shorter than the fragment.
    pub(crate) fn str_fragment(&self) -> &[u8; STRING_SIZE] {
        match &self.payload {
            Payload::Str(bytes) => bytes,
            other => panic!("cell is not a string head: {other:?}"),
        }
    }

    pub(crate) fn chunk(&self) -> &[u8; TOKEN_SIZE] {
        match &self.payload {
            Payload::Chunk(bytes) => bytes,
            other => panic!("cell is not a string continuation: {other:?}"),
        }
    }

    pub(crate) fn span(&self) -> &Span {
        match &self.payload {
            Payload::Spanned(span) => span,
            other => panic!("cell is not a closed collection: {other:?}"),
        }
    }

    pub(crate) fn open(&self) -> Open {
        match self.payload {
            Payload::Open(open) => open,
            ref other => panic!("cell is not under construction: {other:?}"),
        }
    }
}
