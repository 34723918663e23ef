//! Wire codecs for `Channel` (spec §9.1, resolving the distilled spec's
//! language-specific "Storable"/"Sereal" names into concrete Rust crates):
//! `Native` uses `bincode` for a compact, Rust-native wire format; `Fast`
//! uses `rmp-serde` (MessagePack) for a self-describing, cross-language
//! wire format. Both encode/decode any `Serialize + DeserializeOwned` type.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Native,
    Fast,
}

impl Codec {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "native" | "storable" => Ok(Codec::Native),
            "fast" | "sereal" => Ok(Codec::Fast),
            other => Err(Error::EncodingUnknown(other.to_string())),
        }
    }

    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Codec::Native => bincode::serialize(value).map_err(|e| Error::EncodingUnknown(e.to_string())),
            Codec::Fast => rmp_serde::to_vec(value).map_err(|e| Error::EncodingUnknown(e.to_string())),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            Codec::Native => bincode::deserialize(bytes).map_err(|e| Error::EncodingUnknown(e.to_string())),
            Codec::Fast => rmp_serde::from_slice(bytes).map_err(|e| Error::EncodingUnknown(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Msg {
        id: u32,
        text: String,
    }

    #[test]
    fn native_roundtrip() {
        let msg = Msg { id: 7, text: "hi".into() };
        let bytes = Codec::Native.encode(&msg).unwrap();
        let back: Msg = Codec::Native.decode(&bytes).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn fast_roundtrip() {
        let msg = Msg { id: 9, text: "yo".into() };
        let bytes = Codec::Fast.encode(&msg).unwrap();
        let back: Msg = Codec::Fast.decode(&bytes).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn parse_rejects_unknown() {
        assert!(Codec::parse("bogus").is_err());
    }
}
