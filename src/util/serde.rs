use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserializer, Serializer, de};

/// Custom deserializer to allow deserializing a string field as the given type `T`, as long as
/// the type implements [FromStr].
pub fn deserialize_from_str<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    let s: String = serde::Deserialize::deserialize(deserializer)?;
    T::from_str(&s).map_err(de::Error::custom)
}

/// Custom serializer to allow serializing the given type `T` as a string, as long as the type
/// implements [Display].
pub fn serialize_to_str<S, T>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: Display,
{
    serializer.serialize_str(&value.to_string())
}

/// Function to default a boolean field to `true`.
pub const fn default_true() -> bool {
    true
}
