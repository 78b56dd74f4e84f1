use std::borrow::Cow;
use std::ops::Deref;

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

use crate::cell::{Cell, Index, Payload, NO_MEMBER, STRING_SIZE, TOKEN_SIZE};
use crate::dict;
use crate::error::Result;
use crate::flag;
use crate::json;
use crate::stack::Stack;
use crate::types::{self, JsonType};

/// A read-only view of one value: a contiguous span of cells. Obtained
/// by dereferencing a [`Document`] or by navigating into one.
///
/// Accessors resolve the value's type through the registry, and
/// transparently follow reference cells.
#[repr(transparent)]
pub struct Value([Cell]);

impl Value {
    pub(crate) fn from_cells(cells: &[Cell]) -> &Value {
        debug_assert!(!cells.is_empty(), "a value needs at least a head cell");
        // Safety: Value is a transparent wrapper over [Cell].
        unsafe { &*(cells as *const [Cell] as *const Value) }
    }

    /// The raw cells of this value's span.
    pub fn cells(&self) -> &[Cell] {
        &self.0
    }

    pub(crate) fn head(&self) -> &Cell {
        &self.0[0]
    }

    /// The value's type id, following references.
    pub fn get_type(&self) -> u16 {
        self.follow().head().type_id()
    }

    /// The built-in JSON type, or None for a dynamically registered id.
    pub fn json_type(&self) -> Option<JsonType> {
        JsonType::try_from(self.get_type()).ok()
    }

    /// The registered name of the value's type.
    pub fn type_str(&self) -> &'static str {
        types::to_str(self.get_type())
    }

    /// Follow a chain of reference cells to the value they designate.
    pub fn follow(&self) -> &Value {
        let mut value = self;

        while value.head().type_id() == JsonType::Reference as u16 {
            let target = match value.head().payload {
                Payload::Ref(ptr) => ptr,
                ref other => panic!("reference cell without a referent: {other:?}"),
            };

            // Safety: whoever built the reference cell guaranteed the
            // referent outlives it (see Cell::reference).
            value = unsafe {
                let size = types::size_of(target.as_ref()) as usize;
                Value::from_cells(std::slice::from_raw_parts(target.as_ptr(), size))
            };
        }

        value
    }

    /// Cell count of this value's span. A reference counts as its own
    /// one-cell span, not the referent's.
    pub fn size(&self) -> u32 {
        types::size_of(self.head())
    }

    /// String length in bytes, or element/member count of a collection.
    /// Panics if the type does not support a length; see
    /// [`types::supports_len`].
    pub fn len(&self) -> usize {
        let value = self.follow();
        let ty = value.head().type_id();

        match types::len_fn(ty) {
            Some(len) => len(value),
            None => panic!("type {} does not support len", types::to_str(ty)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Coerce to a boolean: null, false, zero, and empty are false.
    pub fn test(&self) -> bool {
        let value = self.follow();
        types::test_fn(value.head().type_id())(value)
    }

    /// The unsigned integer held by a number cell. The caller must have
    /// checked the type; a mismatch is a bug and panics.
    pub fn get_uint(&self) -> u64 {
        match self.follow().head().payload {
            Payload::Uint(uint) => uint,
            ref other => panic!("value is not an unsigned integer: {other:?}"),
        }
    }

    /// The value of a number cell as a double, widening unsigned
    /// integers. Panics on a non-number.
    pub fn get_number(&self) -> f64 {
        match self.follow().head().payload {
            Payload::Number(number) => number,
            Payload::Uint(uint) => uint as f64,
            ref other => panic!("value is not a number: {other:?}"),
        }
    }

    pub fn get_bool(&self) -> bool {
        match self.follow().head().payload {
            Payload::Bool(boolean) => boolean,
            ref other => panic!("value is not a bool: {other:?}"),
        }
    }

    /// The bytes of a string-layout value (strings, member names,
    /// identifiers): borrowed when contiguous, copied out when the
    /// string spans continuation cells.
    pub fn string_bytes(&self) -> Cow<'_, [u8]> {
        let value = self.follow();
        let head = value.head();
        let len = head.len as usize;

        match &head.payload {
            Payload::StrRef(string) => Cow::Borrowed(string.as_str().as_bytes()),
            Payload::Str(bytes) if len < STRING_SIZE => Cow::Borrowed(&bytes[..len]),
            Payload::Str(bytes) => {
                let mut out = Vec::with_capacity(len);
                out.extend_from_slice(bytes);

                for cell in &value.cells()[1..] {
                    let take = (len - out.len()).min(TOKEN_SIZE);
                    out.extend_from_slice(&cell.chunk()[..take]);

                    if out.len() >= len {
                        break;
                    }
                }

                Cow::Owned(out)
            }
            other => panic!("value is not a string: {other:?}"),
        }
    }

    /// The string content, decoded lossily if the bytes are not UTF-8.
    pub fn get_string(&self) -> Cow<'_, str> {
        match self.string_bytes() {
            Cow::Borrowed(bytes) => String::from_utf8_lossy(bytes),
            Cow::Owned(bytes) => Cow::Owned(String::from_utf8_lossy(&bytes).into_owned()),
        }
    }

    /// The `i`th element of an array, or None past the end. The first
    /// access publishes the array's offset index; later accesses are
    /// O(1) and return the same span.
    pub fn element(&self, i: usize) -> Option<&Value> {
        let value = self.follow();
        assert_eq!(
            value.head().type_id(),
            JsonType::Array as u16,
            "elements can only be taken from arrays"
        );

        if i >= value.head().len as usize {
            return None;
        }

        let index = value.collection_index();
        Some(value.subspan(index.offsets[i]))
    }

    /// An object member by name, or None if absent. The first access
    /// publishes the offset index and the member-name hash.
    pub fn member(&self, name: &str) -> Option<&Value> {
        let value = self.follow();
        assert_eq!(
            value.head().type_id(),
            JsonType::Object as u16,
            "members can only be looked up in objects"
        );

        let len = value.head().len as usize;

        if len == 0 {
            return None;
        }

        let index = value.collection_index();
        let bucket = dict::hash_bytes(name.as_bytes()) as usize % len;
        let mut m = index.buckets[bucket];

        while m != NO_MEMBER {
            let key = value.subspan(index.offsets[m as usize]);

            if key.head().len as usize == name.len() && *key.string_bytes() == *name.as_bytes() {
                return Some(value.subspan(index.offsets[m as usize] + key.size()));
            }

            m = index.links[m as usize];
        }

        None
    }

    /// Whether the collection's offset index has been published.
    pub fn is_indexed(&self) -> bool {
        matches!(&self.follow().head().payload,
                 Payload::Spanned(span) if span.index.get().is_some())
    }

    // The OnceLock makes the size-to-index transition atomic: racing
    // readers either compute the same table or adopt the winner's.
    fn collection_index(&self) -> &Index {
        self.head().span().index.get_or_init(|| self.build_index())
    }

    fn build_index(&self) -> Index {
        let len = self.head().len as usize;
        let is_object = self.head().type_id() == JsonType::Object as u16;
        let mut offsets = Vec::with_capacity(len);
        let mut off = 1u32;

        for _ in 0..len {
            offsets.push(off);
            off += types::size_of(&self.cells()[off as usize]);

            if is_object {
                off += types::size_of(&self.cells()[off as usize]);
            }
        }

        let mut buckets = Vec::new();
        let mut links = Vec::new();

        if is_object {
            buckets = vec![NO_MEMBER; len];
            links = vec![NO_MEMBER; len];

            for m in 0..len {
                let name = self.subspan(offsets[m]);
                let bucket = dict::hash_bytes(&name.string_bytes()) as usize % len;
                links[m] = buckets[bucket];
                buckets[bucket] = m as u32;
            }
        }

        Index {
            offsets: offsets.into(),
            buckets: buckets.into(),
            links: links.into(),
        }
    }

    pub(crate) fn subspan(&self, offset: u32) -> &Value {
        let off = offset as usize;
        let size = types::size_of(&self.cells()[off]) as usize;
        Value::from_cells(&self.cells()[off..off + size])
    }

    /// Iterate an array's elements in order without forcing the index.
    pub fn iter_elements(&self) -> Elements<'_> {
        let value = self.follow();
        assert_eq!(
            value.head().type_id(),
            JsonType::Array as u16,
            "elements can only be iterated on arrays"
        );
        Elements {
            value,
            off: 1,
            remaining: value.head().len,
        }
    }

    /// Iterate an object's `(name, value)` pairs in order without
    /// forcing the index.
    pub fn iter_members(&self) -> Members<'_> {
        let value = self.follow();
        assert_eq!(
            value.head().type_id(),
            JsonType::Object as u16,
            "members can only be iterated on objects"
        );
        Members {
            value,
            off: 1,
            remaining: value.head().len,
        }
    }

    /// A value-equivalent, self-contained copy as an owned document.
    pub fn duplicate(&self) -> Document {
        let mut cells: Vec<Cell> = self.cells().to_vec();
        types::clone_fixup(&mut cells);
        cells[0].ty |= flag::ALLOCED;
        Document {
            cells: cells.into_boxed_slice(),
        }
    }

    /// Value equivalence: numbers compare as doubles, object members
    /// match by name ignoring order, references compare as their
    /// referents.
    pub fn value_eq(&self, other: &Value) -> bool {
        let a = self.follow();
        let b = other.follow();

        match (a.json_type(), b.json_type()) {
            (Some(JsonType::Null), Some(JsonType::Null)) => true,
            (Some(JsonType::Bool), Some(JsonType::Bool)) => a.get_bool() == b.get_bool(),
            (Some(JsonType::Number), Some(JsonType::Number)) => a.get_number() == b.get_number(),
            (Some(JsonType::String), Some(JsonType::String)) => a.string_bytes() == b.string_bytes(),
            (Some(JsonType::Array), Some(JsonType::Array)) => {
                a.head().len == b.head().len
                    && a.iter_elements()
                        .zip(b.iter_elements())
                        .all(|(x, y)| x.value_eq(y))
            }
            (Some(JsonType::Object), Some(JsonType::Object)) => {
                a.head().len == b.head().len
                    && a.iter_members()
                        .all(|(name, value)| match b.member(&name.get_string()) {
                            Some(found) => value.value_eq(found),
                            None => false,
                        })
            }
            (None, None) if a.get_type() == b.get_type() => a.to_json() == b.to_json(),
            _ => false,
        }
    }

    /// Serialize to JSON text through the registered serializers.
    pub fn to_json(&self) -> String {
        let mut out = String::new();
        json::build(self, &mut out);
        out
    }
}

pub struct Elements<'a> {
    value: &'a Value,
    off: u32,
    remaining: u32,
}

impl<'a> Iterator for Elements<'a> {
    type Item = &'a Value;

    fn next(&mut self) -> Option<&'a Value> {
        if self.remaining == 0 {
            return None;
        }

        let element = self.value.subspan(self.off);
        self.off += element.size();
        self.remaining -= 1;
        Some(element)
    }
}

pub struct Members<'a> {
    value: &'a Value,
    off: u32,
    remaining: u32,
}

impl<'a> Iterator for Members<'a> {
    type Item = (&'a Value, &'a Value);

    fn next(&mut self) -> Option<(&'a Value, &'a Value)> {
        if self.remaining == 0 {
            return None;
        }

        let name = self.value.subspan(self.off);
        let member = self.value.subspan(self.off + name.size());
        self.off += name.size() + member.size();
        self.remaining -= 1;
        Some((name, member))
    }
}

/// An owned document: a heap-owned span whose head cell carries
/// `ALLOCED`. Dereferences to [`Value`] for reading.
pub struct Document {
    cells: Box<[Cell]>,
}

impl Document {
    pub(crate) fn from_boxed(cells: Box<[Cell]>) -> Document {
        debug_assert!(cells[0].has_flag(flag::ALLOCED));
        Document { cells }
    }

    fn from_cell(mut cell: Cell) -> Document {
        cell.ty |= flag::ALLOCED;
        Document {
            cells: Box::new([cell]),
        }
    }

    pub fn null() -> Document {
        Self::from_cell(Cell::null())
    }

    pub fn boolean(boolean: bool) -> Document {
        Self::from_cell(Cell::boolean(boolean))
    }

    pub fn number(number: f64) -> Document {
        Self::from_cell(Cell::number(number))
    }

    pub fn uint(uint: u64) -> Document {
        Self::from_cell(Cell::uint(uint))
    }

    /// A one-cell string document referencing an immutable constant.
    pub fn string_ref(string: &'static str) -> Document {
        Self::from_cell(Cell::string_ref(string))
    }

    /// A one-cell string document owning a duplicate of `string`.
    pub fn string_dup(string: &str) -> Document {
        Self::from_cell(Cell::string_dup(string))
    }

    /// A one-cell document referring to another value.
    ///
    /// # Safety
    ///
    /// `to` must outlive every read of the document; see
    /// [`Cell::reference`].
    pub unsafe fn reference(to: &Value) -> Document {
        Self::from_cell(unsafe { Cell::reference(to) })
    }

    /// Parse one JSON value using this thread's cached parser stack and
    /// the crate-default extension flags.
    pub fn parse(json: &str) -> Result<Document> {
        Self::parse_with_flags(json, crate::default_flags())
    }

    pub fn parse_with_flags(json: &str, flags: u32) -> Result<Document> {
        Stack::with_thread(|stack| {
            let mut source = crate::source::Source::with_flags(json, flags);
            stack.load_json(&mut source)?;
            Ok(stack.get_document())
        })
    }
}

impl Deref for Document {
    type Target = Value;

    fn deref(&self) -> &Value {
        Value::from_cells(&self.cells)
    }
}

impl AsRef<Value> for Document {
    fn as_ref(&self) -> &Value {
        self
    }
}

impl Clone for Document {
    fn clone(&self) -> Document {
        self.duplicate()
    }
}

impl Drop for Document {
    fn drop(&mut self) {
        if types::have_free_hooks() {
            types::free_fixup(&mut self.cells);
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let value = self.follow();

        match value.json_type() {
            Some(JsonType::Null) => serializer.serialize_unit(),
            Some(JsonType::Bool) => serializer.serialize_bool(value.get_bool()),
            Some(JsonType::Number) if value.head().has_flag(flag::IS_UINT) => {
                serializer.serialize_u64(value.get_uint())
            }
            Some(JsonType::Number) => serializer.serialize_f64(value.get_number()),
            Some(JsonType::String) => serializer.serialize_str(&value.get_string()),
            Some(JsonType::Array) => {
                let mut seq = serializer.serialize_seq(Some(value.len()))?;

                for element in value.iter_elements() {
                    seq.serialize_element(element)?;
                }

                seq.end()
            }
            Some(JsonType::Object) => {
                let mut map = serializer.serialize_map(Some(value.len()))?;

                for (name, member) in value.iter_members() {
                    map.serialize_entry(&name.get_string(), member)?;
                }

                map.end()
            }
            // Registered types serialize as their JSON text.
            _ => serializer.serialize_str(&value.to_json()),
        }
    }
}

impl Serialize for Document {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        (**self).serialize(serializer)
    }
}
