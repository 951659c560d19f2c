//! Wire-level error type: malformed payloads and the named API error codes.

use thiserror::Error;

use crate::api::ApiErrorCode;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error("malformed invite payload: {0}")]
    MalformedInvite(String),
    #[error("server reported {0:?}")]
    Api(ApiErrorCode),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Base64(#[from] base64::DecodeError),
}
