//! Converts directory-layer failures into HTTP responses, the parallel of
//! `dispatcher`'s `DispatchError` -> `tonic::Status` conversion but for the
//! `poem` HTTP stack.

use poem::http::StatusCode;
use poem::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("no replica offers a matching capability")]
    NotFound,
    #[error("malformed registration: {0}")]
    BadRequest(String),
}

impl IntoResponse for DirectoryError {
    fn into_response(self) -> Response {
        let status = match &self {
            DirectoryError::NotFound => StatusCode::NOT_FOUND,
            DirectoryError::BadRequest(_) => StatusCode::BAD_REQUEST,
        };
        Response::builder().status(status).body(self.to_string())
    }
}
