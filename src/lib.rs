pub mod cell;
pub mod dict;
pub mod error;
pub mod flag;
pub mod ident;
pub(crate) mod json;
pub mod oper;
pub mod source;
pub mod stack;
pub mod thread_memory;
pub mod types;
pub mod value;

#[cfg(test)]
mod test;

pub use cell::Cell;
pub use error::{Error, Result};
pub use source::Source;
pub use stack::Stack;
pub use types::JsonType;
pub use value::{Document, Value};

use std::sync::atomic::{AtomicU32, Ordering};

/// Default extension flags for sources constructed without explicit
/// flags. [`types::init`] seeds it; registering the identifier extension
/// or a constants object turns their bits on.
static DEFAULT_FLAGS: AtomicU32 = AtomicU32::new(flag::STRICT);

pub fn default_flags() -> u32 {
    DEFAULT_FLAGS.load(Ordering::Relaxed)
}

pub(crate) fn set_default_flags(flags: u32) {
    DEFAULT_FLAGS.store(flags, Ordering::Relaxed);
}

pub(crate) fn add_default_flags(flags: u32) {
    DEFAULT_FLAGS.fetch_or(flags, Ordering::Relaxed);
}
