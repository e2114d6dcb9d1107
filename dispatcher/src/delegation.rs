//! Talks to the Directory on behalf of this Dispatcher: announces this
//! replica's locally hosted models via a long-lived `POST /register`
//! stream, and answers `Route` queries for delegation — forwarding a
//! request whose capability this Dispatcher cannot satisfy locally to
//! whichever Dispatcher the Directory names instead.

use std::time::Duration;

use dispatcher_base::capability::Capability;
use dispatcher_base::registry::Registry;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// How long a single `/register` control stream is held open for before it
/// is torn down and reopened with a freshly rebuilt capability list, so
/// models added or removed locally are eventually reflected at the
/// Directory.
const REGISTRATION_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
const REGISTRATION_RETRY_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum DelegationError {
    #[error("directory request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("directory has no replica offering a matching capability")]
    NotFound,
}

#[derive(Debug, Serialize)]
struct RegisterBody<'a> {
    replica_id: &'a str,
    endpoint: &'a str,
    capabilities: Vec<Capability>,
}

#[derive(Debug, Deserialize)]
struct RouteResponse {
    endpoint: String,
    replica_id: String,
}

/// A thin HTTP client over the Directory's `/register` and `/route`
/// endpoints. Cheaply cloneable.
#[derive(Clone)]
pub struct DirectoryClient {
    base_url: String,
    http: reqwest::Client,
}

impl DirectoryClient {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            http: reqwest::Client::new(),
        }
    }

    /// Looks up one Dispatcher replica offering a capability matching
    /// `query`, excluding `exclude_replica_id` if given.
    pub async fn route(
        &self,
        query: &Capability,
        exclude_replica_id: Option<&str>,
    ) -> Result<(String, String), DelegationError> {
        let mut params: Vec<(&str, &str)> =
            query.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        if let Some(exclude) = exclude_replica_id {
            params.push(("exclude_replica_id", exclude));
        }

        let resp = self
            .http
            .get(format!("{}/route", self.base_url))
            .query(&params)
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(DelegationError::NotFound);
        }
        let resp = resp.error_for_status()?;
        let body: RouteResponse = resp.json().await?;
        Ok((body.endpoint, body.replica_id))
    }

    /// Opens one `/register` control stream, reading (and discarding) its
    /// keep-alive events until it ends or `REGISTRATION_REFRESH_INTERVAL`
    /// elapses, whichever first. Returns once the stream has ended, so the
    /// caller can rebuild the capability list and call again.
    async fn register_once(
        &self,
        replica_id: &str,
        endpoint: &str,
        capabilities: Vec<Capability>,
    ) -> Result<(), DelegationError> {
        use futures_util::StreamExt;

        let resp = self
            .http
            .post(format!("{}/register", self.base_url))
            .json(&RegisterBody {
                replica_id,
                endpoint,
                capabilities,
            })
            .send()
            .await?
            .error_for_status()?;

        let mut stream = resp.bytes_stream();
        let deadline = tokio::time::sleep(REGISTRATION_REFRESH_INTERVAL);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                chunk = stream.next() => {
                    match chunk {
                        Some(Ok(bytes)) => debug!(bytes = bytes.len(), "directory: keep-alive received"),
                        Some(Err(err)) => return Err(DelegationError::Http(err)),
                        None => return Ok(()),
                    }
                }
                _ = &mut deadline => return Ok(()),
            }
        }
    }
}

/// Runs forever, re-announcing this Dispatcher's current model set to the
/// Directory. Intended to be spawned as a background task at startup; any
/// failure is logged and retried after a fixed backoff rather than
/// propagated, since delegation is an optional enhancement.
pub async fn run_self_registration(
    client: DirectoryClient,
    registry: Registry,
    replica_id: String,
    endpoint: String,
) {
    loop {
        let capabilities = local_model_capabilities(&registry);
        match client
            .register_once(&replica_id, &endpoint, capabilities)
            .await
        {
            Ok(()) => debug!("directory: registration stream ended, refreshing"),
            Err(err) => {
                warn!(%err, "directory: registration failed, retrying");
                tokio::time::sleep(REGISTRATION_RETRY_BACKOFF).await;
            }
        }
    }
}

fn local_model_capabilities(registry: &Registry) -> Vec<Capability> {
    registry
        .list_models()
        .into_iter()
        .map(|model_key| {
            let mut capability = Capability::new();
            match model_key.split_once(':') {
                Some((name, version)) => {
                    capability.insert("model_name".to_string(), name.to_string());
                    capability.insert("model_version".to_string(), version.to_string());
                }
                None => {
                    capability.insert("model_name".to_string(), model_key);
                }
            }
            capability
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_model_capabilities_splits_name_and_version() {
        let registry = Registry::new();
        registry.register("classifier", "v1", "unix:///tmp/a.sock", "w1");
        registry.register("echo", "", "unix:///tmp/b.sock", "w2");

        let mut capabilities = local_model_capabilities(&registry);
        capabilities.sort_by(|a, b| a.get("model_name").cmp(&b.get("model_name")));

        assert_eq!(capabilities.len(), 2);
        assert_eq!(capabilities[0].get("model_name").unwrap(), "classifier");
        assert_eq!(capabilities[0].get("model_version").unwrap(), "v1");
        assert_eq!(capabilities[1].get("model_name").unwrap(), "echo");
        assert_eq!(capabilities[1].get("model_version"), None);
    }
}
