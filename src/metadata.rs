//! Encoding of caller-defined user metadata.
//!
//! The store never looks inside `user_metadata`; it only hands the value to a
//! [`MetadataCodec`] at the JSON-text boundary.

use std::fmt;
use std::marker::PhantomData;

use serde::{de::DeserializeOwned, Serialize};

#[derive(Debug, thiserror::Error)]
#[error("metadata codec error: {0}")]
pub struct CodecError(pub String);

/// Converts a metadata value to and from its stored text form.
pub trait MetadataCodec: Send + Sync {
    type Value: Clone + Send + Sync + 'static;

    fn encode(&self, value: &Self::Value) -> Result<String, CodecError>;
    fn decode(&self, text: &str) -> Result<Self::Value, CodecError>;
}

/// JSON codec for any serde type.
pub struct JsonCodec<T>(PhantomData<fn() -> T>);

impl<T> JsonCodec<T> {
    pub const fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> Copy for JsonCodec<T> {}

impl<T> fmt::Debug for JsonCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JsonCodec")
    }
}

impl<T> MetadataCodec for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    type Value = T;

    fn encode(&self, value: &T) -> Result<String, CodecError> {
        serde_json::to_string(value).map_err(|e| CodecError(e.to_string()))
    }

    fn decode(&self, text: &str) -> Result<T, CodecError> {
        serde_json::from_str(text).map_err(|e| CodecError(e.to_string()))
    }
}

/// Internal key/value map kept alongside each user.
pub type AppMetadata = serde_json::Map<String, serde_json::Value>;

pub(crate) fn encode_app_metadata(value: &AppMetadata) -> Result<String, CodecError> {
    serde_json::to_string(value).map_err(|e| CodecError(e.to_string()))
}

pub(crate) fn decode_app_metadata(text: &str) -> Result<AppMetadata, CodecError> {
    serde_json::from_str(text).map_err(|e| CodecError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        display_name: String,
        newsletter: bool,
    }

    #[test]
    fn json_codec_encodes_struct_as_json_text() {
        let codec = JsonCodec::<Profile>::new();
        let text = codec
            .encode(&Profile {
                display_name: "Lucy".into(),
                newsletter: true,
            })
            .unwrap();
        assert_eq!(text, r#"{"display_name":"Lucy","newsletter":true}"#);
        assert_eq!(codec.decode(&text).unwrap().display_name, "Lucy");
    }

    #[test]
    fn json_codec_rejects_foreign_shape() {
        let codec = JsonCodec::<Profile>::new();
        let err = codec.decode(r#"{"unexpected": 1}"#).unwrap_err();
        assert!(err.to_string().starts_with("metadata codec error"));
    }

    #[test]
    fn app_metadata_defaults_to_empty_object() {
        let text = encode_app_metadata(&AppMetadata::new()).unwrap();
        assert_eq!(text, "{}");
        assert!(decode_app_metadata(&text).unwrap().is_empty());
    }
}
