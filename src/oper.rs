//! Named operators over values, dispatched by the type of one argument
//! with an optional default fallback.
//!
//! Every value an operator returns must either be a fresh allocation or
//! a borrow of something the caller already owns; returning an argument
//! unchanged is expressed as [`OperOut::Borrowed`].

use std::ops::Deref;
use std::sync::RwLock;

use crate::dict::Dict;
use crate::error::{Error, Result};
use crate::value::{Document, Value};

/// Set in an operator's flags word if it takes two arguments.
pub const BINARY: u32 = 0x1;
/// Set if a binary operator dispatches on its right argument's type
/// instead of the left.
pub const TYPE_RIGHT: u32 = 0x2;

pub type UnaryFn = for<'a> fn(&'a Value) -> Result<OperOut<'a>>;
pub type BinaryFn = for<'a> fn(&'a Value, &'a Value) -> Result<OperOut<'a>>;

#[derive(Clone, Copy)]
pub enum OperFn {
    Unary(UnaryFn),
    Binary(BinaryFn),
}

/// An operator's result: owned by the caller, or borrowed from an
/// argument the caller already owns.
#[derive(Debug)]
pub enum OperOut<'a> {
    Owned(Document),
    Borrowed(&'a Value),
}

impl Deref for OperOut<'_> {
    type Target = Value;

    fn deref(&self) -> &Value {
        match self {
            OperOut::Owned(document) => document,
            OperOut::Borrowed(value) => value,
        }
    }
}

struct Oper {
    name: &'static str,
    flags: u32,
    default: Option<OperFn>,
}

struct Registry {
    /// Operator id 0 is reserved as invalid.
    opers: Vec<Oper>,
    /// Sparse type-by-operator override matrix: one operator-indexed
    /// vector per type id, slots for unregistered operators left None.
    per_type: Vec<Vec<Option<OperFn>>>,
    by_name: Dict<u32>,
}

static REGISTRY: RwLock<Registry> = RwLock::new(Registry {
    opers: Vec::new(),
    per_type: Vec::new(),
    by_name: Dict::empty(),
});

fn arity_matches(flags: u32, func: &OperFn) -> bool {
    match func {
        OperFn::Unary(_) => flags & BINARY == 0,
        OperFn::Binary(_) => flags & BINARY != 0,
    }
}

/// Register an operator, returning its id. The name (a symbol like `==`
/// or a word like `in`) must be unique; `default` is called when the
/// governing argument's type has no override, and may be None, in which
/// case unsupported dispatch is an error.
pub fn register(name: &'static str, flags: u32, default: Option<OperFn>) -> u32 {
    let mut registry = REGISTRY.write().unwrap();

    if let Some(func) = &default {
        assert!(
            arity_matches(flags, func),
            "default function arity does not match operator '{name}'"
        );
    }

    assert!(
        registry.by_name.find(name.as_bytes()).is_none(),
        "operator '{name}' is already registered"
    );

    if registry.opers.is_empty() {
        registry.opers.push(Oper {
            name: "",
            flags: 0,
            default: None,
        });
    }

    let op = registry.opers.len() as u32;
    registry.opers.push(Oper {
        name,
        flags,
        default,
    });
    *registry.by_name.add(name.as_bytes()) = Some(op);
    op
}

/// Install a type-specific implementation of a registered operator.
pub fn add_to_type(op: u32, ty: u16, func: OperFn) {
    let mut registry = REGISTRY.write().unwrap();
    let count = registry.opers.len();
    assert!(
        op != 0 && (op as usize) < count,
        "operator {op} is invalid with only {} operators registered",
        count.saturating_sub(1)
    );
    assert!(
        arity_matches(registry.opers[op as usize].flags, &func),
        "function arity does not match operator '{}'",
        registry.opers[op as usize].name
    );

    let ty = usize::from(ty);

    if ty >= registry.per_type.len() {
        registry.per_type.resize_with(ty + 1, Vec::new);
    }

    let slots = &mut registry.per_type[ty];

    if op as usize >= slots.len() {
        slots.resize(op as usize + 1, None);
    }

    slots[op as usize] = Some(func);
}

/// The name an operator was registered under.
pub fn name(op: u32) -> &'static str {
    let registry = REGISTRY.read().unwrap();
    assert!(
        op != 0 && (op as usize) < registry.opers.len(),
        "operator {op} is invalid with only {} operators registered",
        registry.opers.len().saturating_sub(1)
    );
    registry.opers[op as usize].name
}

/// Look an operator up by name.
pub fn find(name: &str) -> Option<u32> {
    REGISTRY.read().unwrap().by_name.find(name.as_bytes()).copied()
}

fn resolve(op: u32, ty: u16, binary: bool) -> (&'static str, Option<OperFn>) {
    let registry = REGISTRY.read().unwrap();
    assert!(
        op != 0 && (op as usize) < registry.opers.len(),
        "operator {op} is invalid with only {} operators registered",
        registry.opers.len().saturating_sub(1)
    );
    let oper = &registry.opers[op as usize];

    if binary {
        assert!(oper.flags & BINARY != 0, "operator '{}' is unary", oper.name);
    } else {
        assert!(oper.flags & BINARY == 0, "operator '{}' is binary", oper.name);
    }

    let overridden = registry
        .per_type
        .get(usize::from(ty))
        .and_then(|slots| slots.get(op as usize))
        .copied()
        .flatten();

    (oper.name, overridden.or(oper.default))
}

fn oper_flags(op: u32) -> u32 {
    let registry = REGISTRY.read().unwrap();
    assert!(
        op != 0 && (op as usize) < registry.opers.len(),
        "operator {op} is invalid with only {} operators registered",
        registry.opers.len().saturating_sub(1)
    );
    registry.opers[op as usize].flags
}

/// Apply a unary operator. Applying a binary operator here is a bug and
/// panics; an operator with neither an override for the argument's type
/// nor a default returns [`Error::Unsupported`].
pub fn apply_unary<'a>(op: u32, arg: &'a Value) -> Result<OperOut<'a>> {
    let (name, func) = resolve(op, arg.get_type(), false);

    match func {
        Some(OperFn::Unary(unary)) => unary(arg),
        Some(OperFn::Binary(_)) => unreachable!("arity is checked at registration"),
        None => {
            log::error!("no function for operator '{name}' on type {}", arg.type_str());
            Err(Error::Unsupported(name))
        }
    }
}

/// Apply a binary operator, dispatching on the type of the left argument
/// unless the operator was registered with [`TYPE_RIGHT`].
pub fn apply_binary<'a>(left: &'a Value, op: u32, right: &'a Value) -> Result<OperOut<'a>> {
    let governing = if oper_flags(op) & TYPE_RIGHT != 0 {
        right
    } else {
        left
    };
    let (name, func) = resolve(op, governing.get_type(), true);

    match func {
        Some(OperFn::Binary(binary)) => binary(left, right),
        Some(OperFn::Unary(_)) => unreachable!("arity is checked at registration"),
        None => {
            log::error!(
                "no function for operator '{name}' on type {}",
                governing.type_str()
            );
            Err(Error::Unsupported(name))
        }
    }
}

/// Tear the operator registry down at process shutdown.
pub fn fini() {
    let mut registry = REGISTRY.write().unwrap();
    registry.opers = Vec::new();
    registry.per_type = Vec::new();
    registry.by_name = Dict::empty();
}
