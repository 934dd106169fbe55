use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde::{Deserializer, Serializer};

/// Enable serde to serialize [`Bytes`] as a hex encoded [`String`].
///
/// Serialized keys are binary (see [`crate::partitioning::Key::serialize`]) so they can't be
/// rendered as utf8.
pub fn serialize<S: Serializer>(v: &Bytes, s: S) -> Result<S::Ok, S::Error> {
    String::serialize(&hex::encode(v), s)
}

/// Enable serde to deserialize a hex encoded [`String`] into [`Bytes`]
pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
    let stringified = String::deserialize(d)?;
    let decoded = hex::decode(stringified.into_bytes())
        .map_err(|e| serde::de::Error::custom(format!("Unable to hex::decode {}", e)))?;
    Ok(decoded.into())
}
