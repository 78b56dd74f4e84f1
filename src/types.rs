//! Process-wide type registry. Each type id maps to a descriptor giving
//! the operations a value of that type supports; the eight JSON ids are
//! fixed, further ids are handed out by [`register`].
//!
//! Registration happens during single-threaded startup; steady-state
//! reads take an uncontended read lock and copy the function pointer out
//! before calling it.

use std::sync::RwLock;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::cell::Cell;
use crate::dict::Dict;
use crate::flag;
use crate::json;
use crate::value::Value;

/// The minimum size of the type table, keeping the built-in ids
/// contiguous and fixed.
pub const MIN_TYPES: usize = 8;

/// The built-in type ids. Ids registered at runtime extend past
/// `Reference` and have no enum counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum JsonType {
    Invalid = 0,
    Null = 1,
    Bool = 2,
    Number = 3,
    String = 4,
    Array = 5,
    Object = 6,
    /// Acts like the type of the value it points to.
    Reference = 7,
}

pub type SizeFn = fn(&Cell) -> u32;
pub type LenFn = fn(&Value) -> usize;
pub type TestFn = fn(&Value) -> bool;
/// Fix up a freshly cell-copied span (one value) whose type owns
/// resources the plain copy did not duplicate.
pub type CloneFn = fn(&mut [Cell]);
/// Release resources a span holds outside its cells.
pub type FreeFn = fn(&mut [Cell]);
pub type BuildJsonFn = fn(&Value, &mut String);

/// A type's descriptor. `len`, `clone`, `free`, and `build_json` are
/// optional; `size` and `test` every type must provide.
pub struct TypeOps {
    pub name: &'static str,
    pub size: SizeFn,
    pub len: Option<LenFn>,
    pub test: TestFn,
    pub clone: Option<CloneFn>,
    pub free: Option<FreeFn>,
    pub build_json: Option<BuildJsonFn>,
}

struct Registry {
    types: Vec<TypeOps>,
    by_name: Dict<u16>,
    have_clone_hooks: bool,
    have_free_hooks: bool,
}

static REGISTRY: RwLock<Registry> = RwLock::new(Registry {
    types: Vec::new(),
    by_name: Dict::empty(),
    have_clone_hooks: false,
    have_free_hooks: false,
});

/// Register the built-in JSON types and set the crate-default parse
/// flags. Call once during single-threaded startup; later calls only
/// reset the default flags.
pub fn init(flags: u32) {
    let mut registry = REGISTRY.write().unwrap();

    if registry.types.is_empty() {
        registry.types.reserve(MIN_TYPES);

        for ops in builtin_types() {
            register_locked(&mut registry, ops);
        }
    }

    drop(registry);
    crate::set_default_flags(flags);
}

pub fn is_init() -> bool {
    !REGISTRY.read().unwrap().types.is_empty()
}

/// Tear the registry down. Only sensible at process shutdown, after
/// every document has been dropped.
pub fn fini() {
    let mut registry = REGISTRY.write().unwrap();
    registry.types = Vec::new();
    registry.by_name = Dict::empty();
    registry.have_clone_hooks = false;
    registry.have_free_hooks = false;
}

/// Register a new type, returning its fresh id. Registration is
/// one-shot: there is no unregister.
pub fn register(ops: TypeOps) -> u16 {
    let mut registry = REGISTRY.write().unwrap();
    assert!(
        !registry.types.is_empty(),
        "the type registry must be initialized before registering types"
    );
    register_locked(&mut registry, ops)
}

fn register_locked(registry: &mut Registry, ops: TypeOps) -> u16 {
    let id = u16::try_from(registry.types.len()).expect("type table is full");
    registry.have_clone_hooks |= ops.clone.is_some();
    registry.have_free_hooks |= ops.free.is_some();
    *registry.by_name.add(ops.name.as_bytes()) = Some(id);
    registry.types.push(ops);
    id
}

/// The registered name of a type id, for diagnostics.
pub fn to_str(ty: u16) -> &'static str {
    REGISTRY
        .read()
        .unwrap()
        .types
        .get(usize::from(ty))
        .map(|ops| ops.name)
        .unwrap_or("unregistered")
}

/// Look a type id up by its registered name.
pub fn from_str(name: &str) -> Option<u16> {
    REGISTRY.read().unwrap().by_name.find(name.as_bytes()).copied()
}

/// Whether values of this type support [`Value::len`].
pub fn supports_len(ty: u16) -> bool {
    REGISTRY
        .read()
        .unwrap()
        .types
        .get(usize::from(ty))
        .is_some_and(|ops| ops.len.is_some())
}

pub(crate) fn size_of(head: &Cell) -> u32 {
    let size = REGISTRY
        .read()
        .unwrap()
        .types
        .get(usize::from(head.type_id()))
        .map(|ops| ops.size)
        .unwrap_or_else(|| panic!("size of unregistered type {}", head.type_id()));
    size(head)
}

pub(crate) fn len_fn(ty: u16) -> Option<LenFn> {
    REGISTRY.read().unwrap().types.get(usize::from(ty)).and_then(|ops| ops.len)
}

pub(crate) fn test_fn(ty: u16) -> TestFn {
    REGISTRY
        .read()
        .unwrap()
        .types
        .get(usize::from(ty))
        .map(|ops| ops.test)
        .unwrap_or_else(|| panic!("test of unregistered type {ty}"))
}

pub(crate) fn build_json_fn(ty: u16) -> Option<BuildJsonFn> {
    REGISTRY.read().unwrap().types.get(usize::from(ty)).and_then(|ops| ops.build_json)
}

fn clone_fn(ty: u16) -> Option<CloneFn> {
    REGISTRY.read().unwrap().types.get(usize::from(ty)).and_then(|ops| ops.clone)
}

fn free_fn(ty: u16) -> Option<FreeFn> {
    REGISTRY.read().unwrap().types.get(usize::from(ty)).and_then(|ops| ops.free)
}

pub(crate) fn have_free_hooks() -> bool {
    REGISTRY.read().unwrap().have_free_hooks
}

fn have_clone_hooks() -> bool {
    REGISTRY.read().unwrap().have_clone_hooks
}

/// Run registered clone hooks over a freshly copied run of spans.
pub(crate) fn clone_fixup(cells: &mut [Cell]) {
    if have_clone_hooks() {
        for_each_span(cells, &|span| {
            if let Some(fixup) = clone_fn(span[0].type_id()) {
                fixup(span);
            }
        });
    }
}

/// Run registered free hooks over a document that is being dropped.
pub(crate) fn free_fixup(cells: &mut [Cell]) {
    for_each_span(cells, &|span| {
        if let Some(release) = free_fn(span[0].type_id()) {
            release(span);
        }
    });
}

/// Visit every span in a run of consecutive spans, recursing into
/// collections.
fn for_each_span(cells: &mut [Cell], visit: &impl Fn(&mut [Cell])) {
    let mut off = 0usize;

    while off < cells.len() {
        let size = size_of(&cells[off]) as usize;
        let ty = cells[off].type_id();
        visit(&mut cells[off..off + size]);

        if ty == JsonType::Array as u16 || ty == JsonType::Object as u16 {
            for_each_span(&mut cells[off + 1..off + size], visit);
        }

        off += size;
    }
}

fn builtin_types() -> [TypeOps; MIN_TYPES] {
    [
        TypeOps {
            name: "invalid",
            size: size_one,
            len: None,
            test: test_false,
            clone: None,
            free: None,
            build_json: None,
        },
        TypeOps {
            name: "null",
            size: size_one,
            len: None,
            test: test_false,
            clone: None,
            free: None,
            build_json: Some(json::build_null),
        },
        TypeOps {
            name: "bool",
            size: size_one,
            len: None,
            test: test_bool,
            clone: None,
            free: None,
            build_json: Some(json::build_bool),
        },
        TypeOps {
            name: "number",
            size: size_one,
            len: None,
            test: test_number,
            clone: None,
            free: None,
            build_json: Some(json::build_number),
        },
        TypeOps {
            name: "string",
            size: size_string,
            len: Some(len_field),
            test: test_len,
            clone: None,
            free: None,
            build_json: Some(json::build_string),
        },
        TypeOps {
            name: "array",
            size: size_collection,
            len: Some(len_field),
            test: test_len,
            clone: None,
            free: None,
            build_json: Some(json::build_array),
        },
        TypeOps {
            name: "object",
            size: size_collection,
            len: Some(len_field),
            test: test_len,
            clone: None,
            free: None,
            build_json: Some(json::build_object),
        },
        TypeOps {
            name: "reference",
            size: size_one,
            len: None,
            test: test_unreachable,
            clone: None,
            free: None,
            build_json: None,
        },
    ]
}

fn size_one(_: &Cell) -> u32 {
    1
}

/// An inline string is a head cell plus 16-byte continuations holding
/// the bytes past the first 8; a referenced string is the one cell.
fn size_string(head: &Cell) -> u32 {
    if head.has_flag(flag::IS_REF) {
        1
    } else {
        1 + ((u64::from(head.len) + 8) / 16) as u32
    }
}

fn size_collection(head: &Cell) -> u32 {
    head.span().size
}

fn len_field(value: &Value) -> usize {
    value.head().len as usize
}

fn test_false(_: &Value) -> bool {
    false
}

fn test_bool(value: &Value) -> bool {
    value.get_bool()
}

fn test_number(value: &Value) -> bool {
    if value.head().has_flag(flag::IS_UINT) {
        value.get_uint() != 0
    } else {
        value.get_number() != 0.0
    }
}

fn test_len(value: &Value) -> bool {
    value.head().len != 0
}

// References are resolved before dispatch ever reaches their descriptor.
fn test_unreachable(_: &Value) -> bool {
    unreachable!("reference cells are followed before dispatch")
}
