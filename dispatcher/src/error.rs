//! Converts the internal error hierarchy (`dispatcher_base`'s `NotFound`,
//! `ClientError`, protocol parse failures) into the `tonic::Status` codes
//! the inference RPC surface promises: `NOT_FOUND` is reported verbatim,
//! transport and protocol failures collapse to `INTERNAL`, an unavailable
//! server reports `UNAVAILABLE`, and a rejected second delegation hop
//! reports `FAILED_PRECONDITION`.

use dispatcher_base::registry::NotFound;
use dispatcher_base::worker::ClientError;
use thiserror::Error;
use tonic::Status;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("model not found: {0}")]
    ModelNotFound(String),
    #[error("transport error: {0}")]
    Transport(#[from] ClientError),
    #[error("malformed response from worker: {0}")]
    Protocol(String),
    #[error("dispatcher is not ready")]
    Unavailable,
    #[error("delegation depth exceeded: a request may only be delegated once")]
    DelegationDepthExceeded,
    #[error("delegation failed: {0}")]
    DelegationFailed(String),
}

impl DispatchError {
    pub fn not_found(model_name: &str, model_version: &str) -> Self {
        let described = if model_version.is_empty() {
            model_name.to_string()
        } else {
            format!("{model_name}:{model_version}")
        };
        DispatchError::ModelNotFound(described)
    }
}

impl From<NotFound> for DispatchError {
    fn from(_: NotFound) -> Self {
        // Callers that can name the model prefer `DispatchError::not_found`
        // directly, since it can include the version; this impl exists so
        // `?` works in contexts that only have the opaque `NotFound` token.
        DispatchError::ModelNotFound("<unknown>".to_string())
    }
}

impl From<DispatchError> for Status {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::ModelNotFound(model) => {
                Status::not_found(format!("model not found: {model}"))
            }
            DispatchError::Transport(reason) => {
                Status::internal(format!("worker transport error: {reason}"))
            }
            DispatchError::Protocol(reason) => {
                Status::internal(format!("malformed worker response: {reason}"))
            }
            DispatchError::Unavailable => Status::unavailable("dispatcher is not ready"),
            DispatchError::DelegationDepthExceeded => {
                Status::failed_precondition("delegation depth exceeded")
            }
            DispatchError::DelegationFailed(reason) => {
                Status::not_found(format!("no dispatcher could serve this request: {reason}"))
            }
        }
    }
}
