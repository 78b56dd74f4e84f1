//! The parser stack: a growable buffer of cells that documents are
//! parsed or programmatically built onto, then extracted from as owned
//! spans.

use std::ptr;
use std::sync::{OnceLock, RwLock};

use crate::cell::{Cell, Open, Payload, Span, StrRef, STRING_SIZE, TOKEN_SIZE};
use crate::error::{Error, Result};
use crate::flag;
use crate::source::Source;
use crate::thread_memory;
use crate::types::{self, JsonType};
use crate::value::{Document, Value};

/// Initial cell capacity of the per-thread stack.
const THREAD_STACK_INIT: usize = 1;
/// The stack doubles below this many cells and grows linearly above it.
const MAX_INCREMENT: usize = 4096;

/// The constants object consulted for bare identifiers when
/// `ALLOW_CONSTS` is in effect.
static CONSTANTS: RwLock<Option<Document>> = RwLock::new(None);

/// Hook giving the identifier extension access to unmatched identifiers.
pub(crate) type PushIdentFn = fn(&mut Stack, usize, &[u8]) -> Result<()>;
static PUSH_IDENT: OnceLock<PushIdentFn> = OnceLock::new();

pub(crate) fn set_push_ident(hook: PushIdentFn) {
    let _ = PUSH_IDENT.set(hook);
}

/// Install the constants object whose members are substituted for bare
/// identifiers in parsed JSON, and turn `ALLOW_CONSTS` on by default.
///
/// Member values are duplicated into the parsed document. A large value
/// that may appear many times is better stored as a reference, with the
/// usual caveat about the referent's lifetime.
pub fn set_constants(constants: Document) {
    *CONSTANTS.write().unwrap() = Some(constants);
    crate::add_default_flags(flag::ALLOW_CONSTS);
}

pub fn clear_constants() {
    *CONSTANTS.write().unwrap() = None;
}

pub struct Stack {
    pub(crate) cells: Vec<Cell>,
    /// Index + 1 of the innermost open collection, or 0 if none.
    open: u32,
    /// Capacity target maintained by the growth policy.
    maximum: usize,
}

thread_local! {
    static THREAD_STACK: std::cell::Cell<*mut Stack> =
        const { std::cell::Cell::new(ptr::null_mut()) };
}

impl Stack {
    /// A stack with room for `init_size` cells. Zero is fine; the first
    /// reservation allocates.
    pub fn new(init_size: usize) -> Self {
        Stack {
            cells: Vec::with_capacity(init_size),
            open: 0,
            maximum: init_size,
        }
    }

    /// Run `f` on this thread's cached parser stack, creating it through
    /// the thread-memory tracker on first use so the main thread can
    /// reclaim it with [`thread_memory::reap`] after this thread exits.
    ///
    /// `f` must not use the thread stack reentrantly (for example by
    /// calling [`Document::parse`]); the stack is exclusive while
    /// borrowed.
    pub fn with_thread<R>(f: impl FnOnce(&mut Stack) -> R) -> R {
        THREAD_STACK.with(|slot| {
            let mut stack = slot.get();

            if stack.is_null() {
                stack = thread_memory::track(Stack::new(THREAD_STACK_INIT)).as_ptr();
                slot.set(stack);
            }

            // Safety: the stack is only touched from this thread, and
            // the tracker keeps it alive for the thread's lifetime.
            f(unsafe { &mut *stack })
        })
    }

    /// Discard any partial construction.
    pub fn clear(&mut self) {
        self.cells.clear();
        self.open = 0;
    }

    pub fn count(&self) -> usize {
        self.cells.len()
    }

    /// Reserve room for `more` cells, growing the buffer per the policy:
    /// round up to a multiple of the current maximum (doubling) below
    /// the increment cap, to a multiple of the cap above it. Returns the
    /// index of the first new slot.
    pub(crate) fn expand(&mut self, more: usize) -> usize {
        let expanded = self.cells.len() + more;

        if expanded > self.maximum {
            let base = self.maximum.max(1);

            self.maximum = if expanded < MAX_INCREMENT {
                ((expanded - 1) / base + 1) * base
            } else {
                ((expanded - 1) / MAX_INCREMENT + 1) * MAX_INCREMENT
            };
        }

        if self.cells.capacity() < self.maximum {
            let len = self.cells.len();
            self.cells.reserve_exact(self.maximum - len);
        }

        self.cells.resize_with(expanded, Cell::invalid);
        expanded - more
    }

    /// Extract the document parsed or built on the stack, leaving the
    /// stack empty. Panics if the stack holds nothing or a collection is
    /// still open.
    pub fn get_document(&mut self) -> Document {
        assert!(!self.cells.is_empty(), "can't take a document from an empty stack");
        assert_eq!(self.open, 0, "can't take a document while a collection is open");

        let mut cells = std::mem::take(&mut self.cells);
        cells.shrink_to_fit();
        let mut cells = cells.into_boxed_slice();
        cells[0].ty |= flag::ALLOCED;
        Document::from_boxed(cells)
    }

    // ------------------------------------------------------------------
    // JSON parsing
    // ------------------------------------------------------------------

    /// Parse one JSON value from `json` onto the stack, returning the
    /// unconsumed remainder. The source inherits the crate-default
    /// extension flags.
    pub fn parse_json<'a>(&mut self, json: &'a str) -> Result<&'a str> {
        let mut source = Source::from_str(json);
        self.load_json(&mut source)?;
        Ok(&json[source.consumed()..])
    }

    /// Load one JSON value from a source onto the stack.
    ///
    /// On error, anything this call pushed is discarded; values loaded
    /// earlier stay intact.
    pub fn load_json(&mut self, source: &mut Source) -> Result<()> {
        let c = source.get_nonspace();

        if c == 0 {
            return Err(Error::NoData);
        }

        let index = self.expand(1);
        let result = self.load_value(index, c, source);

        if result.is_err() {
            self.cells.truncate(index);
        }

        result
    }

    fn load_value(&mut self, index: usize, c: u8, source: &mut Source) -> Result<()> {
        match c {
            b'"' => {
                // Return the cell just reserved; load_string takes it back.
                self.cells.truncate(index);
                self.load_string(source, false)
            }
            b'{' => self.load_object(index, source),
            b'[' => self.load_array(index, source),
            b'-' | b'0'..=b'9' => self.load_number(index, c, source),
            c if c == b'_' || c.is_ascii_alphabetic() => self.load_word(index, c, source),
            _ => Err(Error::Invalid(source.consumed())),
        }
    }

    fn load_object(&mut self, index: usize, source: &mut Source) -> Result<()> {
        self.cells[index] = Cell {
            ty: JsonType::Object as u32,
            len: 0,
            payload: Payload::None,
        };

        let mut c = source.get_nonspace();

        if c == b'}' {
            self.cells[index].payload = Payload::Spanned(Span::new(1));
            return Ok(());
        }

        loop {
            if c != b'"' {
                return Err(Error::Invalid(source.consumed()));
            }

            self.load_string(source, true)?; // member name

            if source.get_nonspace() != b':' {
                return Err(Error::Invalid(source.consumed()));
            }

            self.load_json(source)?; // value can be any JSON value
            self.cells[index].len += 1;
            c = source.get_nonspace();

            if c != b',' {
                break;
            }

            c = source.get_nonspace();
        }

        if c == b'}' {
            let size = (self.cells.len() - index) as u32;
            self.cells[index].payload = Payload::Spanned(Span::new(size));
            return Ok(());
        }

        Err(Error::Invalid(source.consumed()))
    }

    fn load_array(&mut self, index: usize, source: &mut Source) -> Result<()> {
        self.cells[index] = Cell {
            ty: JsonType::Array as u32,
            len: 0,
            payload: Payload::None,
        };

        let mut c = source.get_nonspace();

        if c == b']' {
            self.cells[index].payload = Payload::Spanned(Span::new(1));
            return Ok(());
        }

        if c == 0 {
            return Err(Error::Invalid(source.consumed()));
        }

        source.push_char(c);

        loop {
            self.load_json(source)?;
            self.cells[index].len += 1;
            c = source.get_nonspace();

            if c != b',' {
                break;
            }
        }

        if c == b']' {
            let size = (self.cells.len() - index) as u32;
            self.cells[index].payload = Payload::Spanned(Span::new(size));
            return Ok(());
        }

        Err(Error::Invalid(source.consumed()))
    }

    fn load_number(&mut self, index: usize, c: u8, source: &mut Source) -> Result<()> {
        source.push_char(c);
        let (token, is_uint) = source.get_number()?;
        let text = std::str::from_utf8(token).map_err(|_| Error::Invalid(source.consumed()))?;

        if is_uint {
            match text.strip_prefix("0x") {
                Some(hex) if source.flags() & flag::ALLOW_HEX != 0 => {
                    if let Ok(uint) = u64::from_str_radix(hex, 16) {
                        self.cells[index] = Cell::uint(uint);
                    } else {
                        // Too wide for u64. f64 parsing has no hex
                        // notation, so refold the digits; get_number
                        // guarantees they are all hex.
                        let wide = hex
                            .bytes()
                            .filter_map(|digit| (digit as char).to_digit(16))
                            .fold(0.0f64, |acc, digit| acc * 16.0 + f64::from(digit));
                        self.cells[index] = Cell::number(wide);
                    }

                    return Ok(());
                }
                _ => {
                    // A literal too big for u64 falls through to a double.
                    if let Ok(uint) = text.parse() {
                        self.cells[index] = Cell::uint(uint);
                        return Ok(());
                    }
                }
            }
        }

        let number: f64 = text.parse().map_err(|_| Error::Invalid(source.consumed()))?;
        self.cells[index] = Cell::number(number);
        Ok(())
    }

    fn load_word(&mut self, index: usize, c: u8, source: &mut Source) -> Result<()> {
        source.push_char(c);
        let token = source.get_identifier();

        match token {
            b"false" => {
                self.cells[index] = Cell::boolean(false);
                return Ok(());
            }
            b"null" => {
                self.cells[index] = Cell::null();
                return Ok(());
            }
            b"true" => {
                self.cells[index] = Cell::boolean(true);
                return Ok(());
            }
            _ => {}
        }

        let have_constants = if source.flags() & flag::ALLOW_CONSTS != 0 {
            let constants = CONSTANTS.read().unwrap();

            if let Some(value) = constants.as_deref().and_then(|consts| {
                std::str::from_utf8(token).ok().and_then(|name| consts.member(name))
            }) {
                let size = value.size() as usize;

                if size > 1 {
                    self.expand(size - 1);
                }

                self.dup_at_index(index, value);
                return Ok(());
            }

            constants.is_some()
        } else {
            false
        };

        if source.flags() & flag::ALLOW_IDENTS != 0 {
            if let Some(push_ident) = PUSH_IDENT.get() {
                return push_ident(self, index, token);
            }
        }

        if have_constants {
            log::trace!(
                "identifier '{}' is neither a JSON keyword nor a registered constant",
                String::from_utf8_lossy(token)
            );
        } else {
            log::trace!("identifier '{}' is not a JSON keyword", String::from_utf8_lossy(token));
        }

        Err(Error::Invalid(source.consumed()))
    }

    /// Load a JSON string from a source. The opening quote must already
    /// have been consumed.
    pub(crate) fn load_string(&mut self, source: &mut Source, is_key: bool) -> Result<()> {
        let index = self.expand(1);
        self.cells[index] = Cell {
            ty: JsonType::String as u32 | if is_key { flag::IS_KEY } else { 0 },
            len: 0,
            payload: Payload::Str([0; STRING_SIZE]),
        };

        let result = self.load_string_bytes(index, source);

        if result.is_err() {
            self.cells.truncate(index);
        }

        result
    }

    fn load_string_bytes(&mut self, index: usize, source: &mut Source) -> Result<()> {
        loop {
            let c = source.get_char();

            match c {
                b'"' => break,
                0 => return Err(Error::Invalid(source.consumed())), // no terminating quote
                b'\\' => match source.get_char() {
                    c @ (b'"' | b'\\' | b'/') => self.push_string_byte(index, c)?,
                    b'b' => self.push_string_byte(index, 0x08)?,
                    b'f' => self.push_string_byte(index, 0x0c)?,
                    b'n' => self.push_string_byte(index, b'\n')?,
                    b'r' => self.push_string_byte(index, b'\r')?,
                    b't' => self.push_string_byte(index, b'\t')?,
                    b'u' => {
                        let mut unicode = 0u32;

                        for _ in 0..4 {
                            let digit = (source.get_char() as char)
                                .to_digit(16)
                                .ok_or(Error::BadEscape(source.consumed()))?;
                            unicode = (unicode << 4) + digit;
                        }

                        let c = char::from_u32(unicode)
                            .ok_or(Error::BadEscape(source.consumed()))?;
                        let mut utf8 = [0u8; 4];

                        for &byte in c.encode_utf8(&mut utf8).as_bytes() {
                            self.push_string_byte(index, byte)?;
                        }
                    }
                    _ => return Err(Error::BadEscape(source.consumed())),
                },
                c => self.push_string_byte(index, c)?,
            }
        }

        let len = self.cells[index].len as usize;
        self.put_string_byte(index, len, 0); // terminating NUL
        Ok(())
    }

    /// Append one byte to the string headed at `index` and bump its
    /// length.
    fn push_string_byte(&mut self, index: usize, byte: u8) -> Result<()> {
        let len = self.cells[index].len;

        if len == u32::MAX {
            return Err(Error::StringTooLong);
        }

        self.put_string_byte(index, len as usize, byte);
        self.cells[index].len = len + 1;
        Ok(())
    }

    /// Store a string byte at `pos`, reserving a continuation cell when
    /// the write lands past the cells reserved so far.
    pub(crate) fn put_string_byte(&mut self, head: usize, pos: usize, byte: u8) {
        if pos < STRING_SIZE {
            match &mut self.cells[head].payload {
                Payload::Str(bytes) => bytes[pos] = byte,
                other => panic!("not a string head: {other:?}"),
            }

            return;
        }

        let rel = pos - STRING_SIZE;
        let cell = head + 1 + rel / TOKEN_SIZE;

        if cell >= self.cells.len() {
            let reserved = self.expand(1);
            debug_assert_eq!(reserved, cell);
        }

        if !matches!(self.cells[cell].payload, Payload::Chunk(_)) {
            self.cells[cell] = Cell {
                ty: 0,
                len: 0,
                payload: Payload::Chunk([0; TOKEN_SIZE]),
            };
        }

        match &mut self.cells[cell].payload {
            Payload::Chunk(bytes) => bytes[rel % TOKEN_SIZE] = byte,
            _ => unreachable!(),
        }
    }

    // ------------------------------------------------------------------
    // Builder interface
    // ------------------------------------------------------------------

    fn open_cell(&mut self, index: usize) -> Open {
        self.cells[index].open()
    }

    fn open_cell_mut(&mut self, index: usize) -> &mut Open {
        match &mut self.cells[index].payload {
            Payload::Open(open) => open,
            other => panic!("cell is not under construction: {other:?}"),
        }
    }

    /// Make room for a value of `size` cells in the open collection,
    /// bumping its length. Misuse of the builder is a bug and panics.
    fn add_value(&mut self, size: usize) -> usize {
        assert!(self.open != 0, "no array or object is under construction");
        let collection = (self.open - 1) as usize;
        let ty = self.cells[collection].type_id();
        assert!(
            ty == JsonType::Object as u16 || ty == JsonType::Array as u16,
            "values can only be added to arrays or objects"
        );
        assert!(
            ty == JsonType::Array as u16 || self.open_cell(collection).no_value,
            "a member name must be added to an object before a value"
        );

        let index = self.expand(size);
        self.cells[collection].len += 1;
        self.open_cell_mut(collection).no_value = false;
        index
    }

    /// Begin construction of an array or object on the stack. If a
    /// collection is already open, the new one becomes its next value.
    pub fn open_collection(&mut self, ty: JsonType) {
        assert!(
            matches!(ty, JsonType::Array | JsonType::Object),
            "only arrays and objects can be constructed"
        );

        let index = if self.open != 0 {
            self.add_value(1)
        } else {
            self.expand(1)
        };

        self.cells[index] = Cell {
            ty: ty as u32,
            len: 0,
            payload: Payload::Open(Open {
                no_value: false,
                nested: false,
                parent: self.open,
            }),
        };
        self.open = index as u32 + 1;
    }

    /// Finish the open collection: its span size is written into the
    /// head cell and construction resumes on the enclosing collection.
    pub fn close_collection(&mut self) {
        assert!(self.open != 0, "there is no open collection on the stack");
        let index = (self.open - 1) as usize;
        let open = self.open_cell(index);
        assert!(!open.no_value, "the object has a member name with no value");
        assert!(!open.nested, "a nested collection is still open");

        self.open = open.parent;
        let size = (self.cells.len() - index) as u32;
        self.cells[index].payload = Payload::Spanned(Span::new(size));
    }

    fn push_string_copy(&mut self, string: &str, extra: u32) -> Result<()> {
        let index = self.expand(1);

        let Ok(len) = u32::try_from(string.len()) else {
            self.cells.truncate(index);
            return Err(Error::StringTooLong);
        };

        self.cells[index] = Cell {
            ty: JsonType::String as u32 | extra,
            len,
            payload: Payload::Str([0; STRING_SIZE]),
        };

        if string.len() >= STRING_SIZE {
            self.expand((string.len() + STRING_SIZE) / TOKEN_SIZE);
        }

        for (pos, &byte) in string.as_bytes().iter().enumerate() {
            self.put_string_byte(index, pos, byte);
        }

        self.put_string_byte(index, string.len(), 0);
        Ok(())
    }

    fn push_string_ref(&mut self, string: StrRef, extra: u32) -> Result<()> {
        let index = self.expand(1);

        let Ok(len) = u32::try_from(string.as_str().len()) else {
            self.cells.truncate(index);
            return Err(Error::StringTooLong);
        };

        let own = match string {
            StrRef::Owned(_) => flag::IS_OWN,
            StrRef::Shared(_) => 0,
        };

        self.cells[index] = Cell {
            ty: JsonType::String as u32 | flag::IS_REF | own | extra,
            len,
            payload: Payload::StrRef(string),
        };
        Ok(())
    }

    fn member_name_target(&mut self) -> usize {
        assert!(self.open != 0, "no object is under construction");
        let object = (self.open - 1) as usize;
        assert_eq!(
            self.cells[object].type_id(),
            JsonType::Object as u16,
            "member names can only be added to objects"
        );
        assert!(
            !self.open_cell(object).no_value,
            "a member name was already added without a value"
        );
        object
    }

    /// Add a copied member name to the object under construction. The
    /// next addition must be its value.
    pub fn add_member_name(&mut self, name: &str) -> Result<()> {
        let object = self.member_name_target();
        self.open_cell_mut(object).no_value = true;
        self.push_string_copy(name, flag::IS_KEY)
    }

    /// Like [`Stack::add_member_name`], referencing a constant name
    /// instead of copying it.
    pub fn add_member_name_ref(&mut self, name: &'static str) -> Result<()> {
        let object = self.member_name_target();
        self.open_cell_mut(object).no_value = true;
        self.push_string_ref(StrRef::Shared(name), flag::IS_KEY)
    }

    fn string_value_target(&mut self) -> usize {
        assert!(self.open != 0, "no array or object is under construction");
        let collection = (self.open - 1) as usize;
        let ty = self.cells[collection].type_id();
        assert!(
            ty == JsonType::Object as u16 || ty == JsonType::Array as u16,
            "strings can only be added to arrays or objects"
        );
        assert!(
            ty == JsonType::Array as u16 || self.open_cell(collection).no_value,
            "a member name must be added to an object before a string value"
        );
        self.open_cell_mut(collection).no_value = false;
        collection
    }

    /// Add a copied string to the open collection.
    pub fn add_string(&mut self, string: &str) -> Result<()> {
        let collection = self.string_value_target();
        self.push_string_copy(string, 0)?;
        self.cells[collection].len += 1;
        Ok(())
    }

    /// Add a string referencing an immutable constant.
    pub fn add_string_ref(&mut self, string: &'static str) -> Result<()> {
        let collection = self.string_value_target();
        self.push_string_ref(StrRef::Shared(string), 0)?;
        self.cells[collection].len += 1;
        Ok(())
    }

    /// Add a string whose bytes the document will own.
    pub fn add_string_owned(&mut self, string: String) -> Result<()> {
        let collection = self.string_value_target();
        self.push_string_ref(StrRef::Owned(string.into_boxed_str()), 0)?;
        self.cells[collection].len += 1;
        Ok(())
    }

    pub fn add_null(&mut self) {
        let index = self.add_value(1);
        self.cells[index] = Cell::null();
    }

    pub fn add_bool(&mut self, boolean: bool) {
        let index = self.add_value(1);
        self.cells[index] = Cell::boolean(boolean);
    }

    pub fn add_number(&mut self, number: f64) {
        let index = self.add_value(1);
        self.cells[index] = Cell::number(number);
    }

    pub fn add_uint(&mut self, uint: u64) {
        let index = self.add_value(1);
        self.cells[index] = Cell::uint(uint);
    }

    /// Add a reference to another value.
    ///
    /// # Safety
    ///
    /// `to` must outlive the document built from this stack; see
    /// [`Cell::reference`].
    pub unsafe fn add_reference(&mut self, to: &Value) {
        let index = self.add_value(1);
        self.cells[index] = unsafe { Cell::reference(to) };
    }

    /// Add a deep copy of a value to the open collection.
    pub fn add_dup(&mut self, value: &Value) {
        let size = value.size() as usize;
        let index = self.add_value(size);
        self.dup_at_index(index, value);
    }

    // The room must already have been made; careful.
    fn dup_at_index(&mut self, index: usize, value: &Value) {
        let size = value.cells().len();

        for (i, cell) in value.cells().iter().enumerate() {
            self.cells[index + i] = cell.clone();
        }

        self.cells[index].ty &= !flag::ALLOCED;
        types::clone_fixup(&mut self.cells[index..index + size]);
    }

    /// Append deep copies of all of another object's members to the
    /// object under construction.
    pub fn add_dup_members(&mut self, object: &Value) {
        assert!(self.open != 0, "no object is under construction");
        let target = (self.open - 1) as usize;
        assert_eq!(
            self.cells[target].type_id(),
            JsonType::Object as u16,
            "members can only be added to an object"
        );
        assert!(
            !self.open_cell(target).no_value,
            "a member name was already added without a value"
        );

        let object = object.follow();
        assert_eq!(
            object.head().type_id(),
            JsonType::Object as u16,
            "can't add members from a {}",
            object.type_str()
        );

        let len = object.head().len;

        if len == 0 {
            return;
        }

        let size = object.cells().len() - 1; // not the object cell itself
        let index = self.expand(size);

        for (i, cell) in object.cells()[1..].iter().enumerate() {
            self.cells[index + i] = cell.clone();
        }

        types::clone_fixup(&mut self.cells[index..index + size]);
        self.cells[target].len += len;
    }

    /// Add a member name and a copied string value in one call.
    pub fn add_member_string(&mut self, name: &str, value: &str) -> Result<()> {
        self.add_member_name(name)?;
        self.add_string(value)
    }

    pub fn add_member_null(&mut self, name: &str) -> Result<()> {
        self.add_member_name(name)?;
        self.add_null();
        Ok(())
    }

    pub fn add_member_bool(&mut self, name: &str, boolean: bool) -> Result<()> {
        self.add_member_name(name)?;
        self.add_bool(boolean);
        Ok(())
    }

    pub fn add_member_number(&mut self, name: &str, number: f64) -> Result<()> {
        self.add_member_name(name)?;
        self.add_number(number);
        Ok(())
    }

    pub fn add_member_uint(&mut self, name: &str, uint: u64) -> Result<()> {
        self.add_member_name(name)?;
        self.add_uint(uint);
        Ok(())
    }

    pub fn add_member_dup(&mut self, name: &str, value: &Value) -> Result<()> {
        self.add_member_name(name)?;
        self.add_dup(value);
        Ok(())
    }
}
