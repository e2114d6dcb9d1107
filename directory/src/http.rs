//! The Directory's HTTP surface: `POST /register` (a long-lived control
//! stream), `GET /route` (capability lookup), `GET /registry` (snapshot).
//!
//! Liveness is stream-based: an entry lives exactly as long as its
//! `/register` response body is being read. [`RegistrationStream`]'s `Drop`
//! is the single place an entry is removed, so a client disconnect, a write
//! failure on a keep-alive, and a graceful client-initiated close are all
//! handled the same way, matching the "any stream error is a deregistration
//! event" rule.

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::Stream;
use poem::web::{Data, Json, Query};
use poem::{get, handler, post, Body, EndpointExt, IntoResponse, Response, Route};
use serde::{Deserialize, Serialize};
use tokio::time::Interval;
use tracing::{info, warn};

use crate::error::DirectoryError;
use crate::registry::{DirectoryRegistry, Entry};

const EXCLUDE_REPLICA_ID_PARAM: &str = "exclude_replica_id";

#[derive(Debug, Deserialize)]
struct RegisterBody {
    replica_id: String,
    endpoint: String,
    capabilities: Vec<BTreeMap<String, String>>,
}

#[derive(Debug, Serialize)]
struct RouteResponse {
    endpoint: String,
    replica_id: String,
}

#[derive(Debug, Serialize)]
struct RegistryEntryView {
    replica_id: String,
    endpoint: String,
    capabilities: Vec<BTreeMap<String, String>>,
}

#[derive(Debug, Serialize)]
struct KeepAliveEvent<'a> {
    event: &'a str,
    replica_id: &'a str,
}

/// Builds the `poem` router for the Directory's three operations.
pub fn routes(directory: DirectoryRegistry, keep_alive_interval: Duration) -> Route {
    Route::new()
        .at("/register", post(register))
        .at("/route", get(route))
        .at("/registry", get(registry_snapshot))
        .data(directory)
        .data(keep_alive_interval)
}

#[handler]
fn register(
    Json(body): Json<RegisterBody>,
    Data(directory): Data<&DirectoryRegistry>,
    Data(keep_alive_interval): Data<&Duration>,
) -> Response {
    if body.replica_id.is_empty() {
        return DirectoryError::BadRequest("replica_id must not be empty".to_string())
            .into_response();
    }

    info!(
        replica_id = %body.replica_id,
        endpoint = %body.endpoint,
        offers = body.capabilities.len(),
        "directory: replica registered"
    );

    let token = directory.register(Entry {
        replica_id: body.replica_id.clone(),
        endpoint: body.endpoint,
        capabilities: body.capabilities,
    });

    let stream = RegistrationStream::new(
        directory.clone(),
        body.replica_id,
        token,
        *keep_alive_interval,
    );

    Response::builder()
        .header("content-type", "application/x-ndjson")
        .body(Body::from_bytes_stream(stream))
}

#[handler]
fn route(
    Query(mut params): Query<HashMap<String, String>>,
    Data(directory): Data<&DirectoryRegistry>,
) -> Result<Json<RouteResponse>, DirectoryError> {
    let exclude_replica_id = params.remove(EXCLUDE_REPLICA_ID_PARAM);
    let query: BTreeMap<String, String> = params.into_iter().collect();

    match directory.route(&query, exclude_replica_id.as_deref()) {
        Some(entry) => Ok(Json(RouteResponse {
            endpoint: entry.endpoint,
            replica_id: entry.replica_id,
        })),
        None => Err(DirectoryError::NotFound),
    }
}

#[handler]
fn registry_snapshot(Data(directory): Data<&DirectoryRegistry>) -> Json<Vec<RegistryEntryView>> {
    let entries = directory
        .snapshot()
        .into_iter()
        .map(|entry| RegistryEntryView {
            replica_id: entry.replica_id,
            endpoint: entry.endpoint,
            capabilities: entry.capabilities,
        })
        .collect();
    Json(entries)
}

/// A `Stream` of newline-delimited JSON keep-alive events, one per
/// `interval` tick, for as long as the response body is polled. Its `Drop`
/// is the entry's sole removal path.
struct RegistrationStream {
    directory: DirectoryRegistry,
    replica_id: String,
    token: u64,
    interval: Interval,
}

impl RegistrationStream {
    fn new(directory: DirectoryRegistry, replica_id: String, token: u64, interval: Duration) -> Self {
        Self {
            directory,
            replica_id,
            token,
            interval: tokio::time::interval(interval),
        }
    }
}

impl Stream for RegistrationStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.interval.poll_tick(cx) {
            Poll::Ready(_) => {
                let event = KeepAliveEvent {
                    event: "keep_alive",
                    replica_id: &this.replica_id,
                };
                let mut line = serde_json::to_vec(&event).expect("keep-alive event is serializable");
                line.push(b'\n');
                Poll::Ready(Some(Ok(Bytes::from(line))))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for RegistrationStream {
    fn drop(&mut self) {
        warn!(replica_id = %self.replica_id, "directory: control stream closed, removing replica");
        self.directory.remove_if_current(&self.replica_id, self.token);
    }
}
