//! Schema layer: external argument dumps + the normalized argument table.
//!
//! This module only inspects the external parser's declarations; it never
//! redefines them.

pub mod raw;
pub mod spec;
pub mod value;

pub use raw::{RawArgument, RawSchema, extract, load_schema};
pub use spec::{ArgKind, ArgumentSpec, ScalarType, Schema, ValueType};
