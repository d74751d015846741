//! Domain model for synchronized field-operations data.
//!
//! # Responsibility
//! - Define collections, in-memory records and typed entities.
//! - Keep validation next to the entity definitions.
//!
//! # Invariants
//! - Record ids are unique within one state slot.
//! - Only `ValidationError` blocks a mutation.

pub mod collection;
pub mod entity;
pub mod record;
pub mod validation;
