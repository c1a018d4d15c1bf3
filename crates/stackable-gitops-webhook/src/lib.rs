//! The admission-facing side of the declared-field ownership model.
//!
//! The admission guard is invoked by the API server on every write to a
//! managed object. It computes the set of field paths the write touches
//! ([`fields::field_diff`]), looks up the set of paths the pipeline declared
//! ownership of ([`fields::declared_fields`]), and rejects the write if the
//! two sets intersect. [`fields::reserved_metadata`] additionally detects
//! writes that tamper with the pipeline's own bookkeeping metadata, which is
//! protected even when it is not declared in the source of truth.

pub mod fields;

pub use fields::{Error, declared_fields, field_diff, field_diff_equivalent, reserved_metadata};
