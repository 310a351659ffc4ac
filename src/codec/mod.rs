//! Decoding of raw controller force dumps.
//!
//! A dump is a text file with one forced signal per line: an identifier token followed by one
//! or more hex value words.
//!
//! ```text
//! 5700368 00000001
//! 52000A1 3F800000
//! 44000FF 3FF00000 00000000
//! ```
//!
//! ## Key Components
//!
//! - [`DumpParser`] - Lazy line splitter producing [`DumpRow`]s
//! - [`CanonicalName`] - Identifier decoding (`5700368` → `W00872`)
//! - [`value::decode`] - Typed decoding of value words according to a declared type
//!
//! Nothing in this module fails on bad input. A line without tokens is dropped, an identifier
//! that does not decode passes through unchanged (and will simply not match any metadata), and
//! a value that does not decode becomes [`DecodedValue::Invalid`]. The only error surfaced is
//! an I/O failure while reading the file itself.

pub mod dump;
pub mod value;

pub use dump::{decode_row, CanonicalName, DumpParser, DumpRow};
pub use value::{decode, decode_all, DecodedValue};
