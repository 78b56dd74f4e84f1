//! Flag words shared by the parser, the cell layout, and the registries.

/// Parse with the base JSON grammar only.
pub const STRICT: u32 = 0;
/// Numbers may be `0x` followed by hex digits; parsed as unsigned integers.
pub const ALLOW_HEX: u32 = 0x0000_0001;
/// Bare identifiers matching a registered constant expand to its value.
pub const ALLOW_CONSTS: u32 = 0x0000_0002;
/// Bare identifiers that match nothing else become identifier values.
pub const ALLOW_IDENTS: u32 = 0x0000_0004;

/// Bits of the type word holding the type id; the high half holds flags.
pub const TYPE_MASK: u32 = 0x0000_FFFF;

/// Number cell holds an unsigned integer rather than a double.
pub const IS_UINT: u32 = 0x0800_0000;
/// String cell is an object member name.
pub const IS_KEY: u32 = 0x1000_0000;
/// String cell's payload lives outside the span.
pub const IS_REF: u32 = 0x2000_0000;
/// The cell owns the referenced bytes. Implies `IS_REF` on strings.
pub const IS_OWN: u32 = 0x4000_0000;
/// Collection's offset index has been published. Reuses the `IS_OWN` bit,
/// which is legal because the bit is never set on collections for any
/// other reason; the helper constructors enforce the disjointness.
pub const INDEXED: u32 = 0x4000_0000;
/// Head of a heap-owned span.
pub const ALLOCED: u32 = 0x8000_0000;
