//! Value object trait: equality by value, not identity.

/// Marker trait for immutable domain values compared by their attributes.
///
/// Two value objects with the same attribute values are the same value;
/// "modifying" one means constructing a new one. Construction is the only
/// validation point, so a held value object is always valid.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
