//! The Worker Client: sends one inference request to a Worker endpoint and
//! returns its response, using the connection pool and framing codec. It
//! never parses the payload and never retries — retry policy belongs to the
//! caller, which holds the request identity and side-effect semantics.

use thiserror::Error;
use tracing::warn;

use crate::codec::{read_frame, write_frame, FramingError};
use crate::pool::{Pool, PoolError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error talking to {endpoint}: {reason}")]
    Transport { endpoint: String, reason: String },
}

impl ClientError {
    fn transport(endpoint: &str, reason: impl std::fmt::Display) -> Self {
        Self::Transport {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<PoolError> for ClientError {
    fn from(err: PoolError) -> Self {
        // Exhaustion and connect failures are both transport failures from
        // the caller's point of view; only the message differs.
        ClientError::Transport {
            endpoint: "<pool>".to_string(),
            reason: err.to_string(),
        }
    }
}

/// Forwards one request to a Worker and returns its raw response bytes.
/// `max_frame_bytes` bounds both the outgoing and incoming frame.
pub struct WorkerClient {
    pool: Pool,
    max_frame_bytes: u32,
}

impl WorkerClient {
    pub fn new(pool: Pool, max_frame_bytes: u32) -> Self {
        Self {
            pool,
            max_frame_bytes,
        }
    }

    pub async fn forward(&self, endpoint: &str, request_bytes: &[u8]) -> Result<Vec<u8>, ClientError> {
        let mut conn = self.pool.acquire(endpoint).await.map_err(|err| {
            ClientError::transport(endpoint, err)
        })?;

        if let Err(err) = write_frame(conn.stream_mut(), request_bytes).await {
            self.discard(conn, &err);
            return Err(ClientError::transport(endpoint, err));
        }

        match read_frame(conn.stream_mut(), self.max_frame_bytes).await {
            Ok(response_bytes) => {
                self.pool.release(conn, true);
                Ok(response_bytes)
            }
            Err(err) => {
                self.discard(conn, &err);
                Err(ClientError::transport(endpoint, err))
            }
        }
    }

    fn discard(&self, conn: crate::pool::Connection, reason: &FramingError) {
        warn!(endpoint = conn.endpoint(), %reason, "discarding connection after transport failure");
        self.pool.release(conn, false);
    }
}
