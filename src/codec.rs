//! Typed payload encoding. Payloads are stored as strings; typed helpers
//! encode with `serde_json`. Plain string payloads never pass through here.

use crate::FailureDetail;
use serde::{Serialize, de::DeserializeOwned};

pub(crate) struct Json;

impl Json {
    pub(crate) fn encode<T: Serialize + ?Sized>(value: &T) -> Result<String, FailureDetail> {
        serde_json::to_string(value).map_err(|e| FailureDetail::new("SerializationError", format!("encode: {e}")))
    }

    pub(crate) fn decode<T: DeserializeOwned>(raw: &str) -> Result<T, FailureDetail> {
        serde_json::from_str(raw).map_err(|e| FailureDetail::new("SerializationError", format!("decode: {e}")))
    }
}
