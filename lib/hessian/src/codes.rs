//! Wire constants for the Hessian 2.0 grammar.
//!
//! Names follow the `BC_*` convention of the reference implementation; the
//! `*_MIN`/`*_MAX` pairs delimit the value range a compact form can carry and
//! the `*_ZERO` bytes are the opcode that encodes zero in that form.

// Compact int: one byte, [-0x10, 0x2f].
pub const INT_DIRECT_MIN: i32 = -0x10;
pub const INT_DIRECT_MAX: i32 = 0x2f;
pub const BC_INT_ZERO: u8 = 0x90;

// Compact int: two bytes, [-0x800, 0x7ff].
pub const INT_BYTE_MIN: i32 = -0x800;
pub const INT_BYTE_MAX: i32 = 0x7ff;
pub const BC_INT_BYTE_ZERO: u8 = 0xc8;

// Compact int: three bytes, [-0x40000, 0x3ffff].
pub const INT_SHORT_MIN: i32 = -0x40000;
pub const INT_SHORT_MAX: i32 = 0x3ffff;
pub const BC_INT_SHORT_ZERO: u8 = 0xd4;

pub const BC_INT: u8 = b'I';

// Compact long: one byte, [-0x08, 0x0f].
pub const LONG_DIRECT_MIN: i64 = -0x08;
pub const LONG_DIRECT_MAX: i64 = 0x0f;
pub const BC_LONG_ZERO: u8 = 0xe0;

// Compact long: two bytes, [-0x800, 0x7ff].
pub const LONG_BYTE_MIN: i64 = -0x800;
pub const LONG_BYTE_MAX: i64 = 0x7ff;
pub const BC_LONG_BYTE_ZERO: u8 = 0xf8;

// Compact long: three bytes, [-0x40000, 0x3ffff].
pub const LONG_SHORT_MIN: i64 = -0x40000;
pub const LONG_SHORT_MAX: i64 = 0x3ffff;
pub const BC_LONG_SHORT_ZERO: u8 = 0x3c;

pub const BC_LONG_INT: u8 = 0x59;
pub const BC_LONG: u8 = b'L';

pub const BC_DOUBLE_ZERO: u8 = 0x5b;
pub const BC_DOUBLE_ONE: u8 = 0x5c;
pub const BC_DOUBLE_BYTE: u8 = 0x5d;
pub const BC_DOUBLE_SHORT: u8 = 0x5e;
pub const BC_DOUBLE_MILL: u8 = 0x5f;
pub const BC_DOUBLE: u8 = b'D';

// The canonical quiet-NaN bit pattern every NaN must collapse to.
pub const NAN_BITS: u64 = 0x7ff8_0000_0000_0000;

pub const BC_TRUE: u8 = b'T';
pub const BC_FALSE: u8 = b'F';
pub const BC_NULL: u8 = b'N';

pub const BC_DATE_MILLIS: u8 = 0x4a;
pub const BC_DATE_MINUTES: u8 = 0x4b;

// Strings are chunked at 0x8000 characters; every chunk but the last is
// framed with BC_STRING_CHUNK.
pub const STRING_DIRECT_MAX: usize = 0x1f;
pub const STRING_SHORT_MAX: usize = 0x3ff;
pub const BC_STRING_SHORT: u8 = 0x30;
pub const BC_STRING_CHUNK: u8 = 0x52;
pub const BC_STRING: u8 = b'S';
pub const STRING_CHUNK_SIZE: usize = 0x8000;

pub const BINARY_DIRECT_MAX: usize = 0x0f;
pub const BC_BINARY_DIRECT: u8 = 0x20;
pub const BC_BINARY_CHUNK: u8 = b'A';
pub const BC_BINARY: u8 = b'B';
pub const BINARY_CHUNK_SIZE: usize = 0x8000;

// Lists: fixed-length forms carry their length in the opcode (up to 7
// elements) or as a following int; the variable-length forms are terminated
// by BC_END and only appear on decode.
pub const LIST_DIRECT_MAX: usize = 0x07;
pub const BC_LIST_DIRECT_TYPED: u8 = 0x70;
pub const BC_LIST_DIRECT_UNTYPED: u8 = 0x78;
pub const BC_LIST_VARIABLE_TYPED: u8 = 0x55;
pub const BC_LIST_FIXED_TYPED: u8 = 0x56;
pub const BC_LIST_VARIABLE_UNTYPED: u8 = 0x57;
pub const BC_LIST_FIXED_UNTYPED: u8 = 0x58;

pub const BC_MAP_TYPED: u8 = b'M';
pub const BC_MAP_UNTYPED: u8 = b'H';
pub const BC_END: u8 = b'Z';

// Objects: a class definition interns the path and field names, instances
// reference the definition by index.
pub const BC_CLASS_DEF: u8 = b'C';
pub const BC_OBJECT: u8 = b'O';
pub const BC_OBJECT_DIRECT: u8 = 0x60;
pub const OBJECT_DIRECT_MAX: usize = 0x0f;

pub const BC_REF: u8 = 0x51;
