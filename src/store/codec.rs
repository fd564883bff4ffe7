//! Serde helpers that store byte buffers as hex strings inside JSON records.

use serde::{Deserialize, Deserializer, Serializer};

pub mod hex_bytes {
  use super::*;

  pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&hex::encode(bytes))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
    let s = String::deserialize(d)?;
    hex::decode(s).map_err(serde::de::Error::custom)
  }
}

pub mod opt_hex_bytes {
  use super::*;

  pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
    match bytes {
      Some(b) => s.serialize_some(&hex::encode(b)),
      None => s.serialize_none(),
    }
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
    Option::<String>::deserialize(d)?
      .map(|s| hex::decode(s).map_err(serde::de::Error::custom))
      .transpose()
  }
}
