//! The inference RPC surface (§4.5): health/readiness/metadata short-circuit
//! locally; `ModelInfer` consults the Registry and forwards the request
//! verbatim to the owning Worker. A `model_key` not found locally may be
//! delegated through the Directory exactly once (§4.8); the service never
//! runs model code itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dispatcher_base::capability::model_capability;
use dispatcher_base::registry::Registry;
use dispatcher_base::worker::WorkerClient;
use dispatcher_proto::proto::dispatcher::v2::grpc_inference_service_client::GrpcInferenceServiceClient;
use dispatcher_proto::proto::dispatcher::v2::grpc_inference_service_server::GrpcInferenceService;
use dispatcher_proto::proto::dispatcher::v2::{
    ModelInferRequest, ModelInferResponse, ModelMetadataRequest, ModelMetadataResponse,
    ModelReadyRequest, ModelReadyResponse, ServerLiveRequest, ServerLiveResponse,
    ServerMetadataRequest, ServerMetadataResponse, ServerReadyRequest, ServerReadyResponse,
};
use prost::Message;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::delegation::DirectoryClient;
use crate::error::DispatchError;

const SERVER_NAME: &str = "dispatcher";
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared flag reporting whether the Dispatcher is accepting requests:
/// false during startup and shutdown, true once both servers are bound and
/// (if configured) the initial Worker fleet has reached readiness.
#[derive(Clone)]
pub struct ReadinessFlag(Arc<AtomicBool>);

impl Default for ReadinessFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn set_ready(&self, ready: bool) {
        self.0.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What's needed to delegate a request this Dispatcher cannot satisfy
/// locally: the Directory client to find another replica, and this
/// replica's own id so the Directory excludes it from the match.
#[derive(Clone)]
pub struct DelegationContext {
    pub directory: DirectoryClient,
    pub replica_id: String,
}

pub struct DispatchGrpcApi {
    registry: Registry,
    worker_client: WorkerClient,
    readiness: ReadinessFlag,
    delegation: Option<DelegationContext>,
}

impl DispatchGrpcApi {
    pub fn new(
        registry: Registry,
        worker_client: WorkerClient,
        readiness: ReadinessFlag,
        delegation: Option<DelegationContext>,
    ) -> Self {
        Self {
            registry,
            worker_client,
            readiness,
            delegation,
        }
    }

    async fn infer_locally(
        &self,
        req: &ModelInferRequest,
        endpoint: &str,
    ) -> Result<ModelInferResponse, DispatchError> {
        let request_bytes = req.encode_to_vec();
        let response_bytes = self.worker_client.forward(endpoint, &request_bytes).await?;
        ModelInferResponse::decode(response_bytes.as_slice())
            .map_err(|err| DispatchError::Protocol(err.to_string()))
    }

    /// Re-issues `req` through the Directory, excluding this replica, to
    /// whichever Dispatcher can satisfy it instead. Bumps `delegation_hop`
    /// to 1 so the receiving Dispatcher refuses to delegate it again.
    async fn delegate(&self, req: &ModelInferRequest) -> Result<ModelInferResponse, DispatchError> {
        let Some(ctx) = &self.delegation else {
            return Err(DispatchError::not_found(&req.model_name, &req.model_version));
        };
        if req.delegation_hop >= 1 {
            return Err(DispatchError::DelegationDepthExceeded);
        }

        let query = model_capability(&req.model_name, &req.model_version);
        let (target_endpoint, target_replica_id) = ctx
            .directory
            .route(&query, Some(&ctx.replica_id))
            .await
            .map_err(|err| DispatchError::DelegationFailed(err.to_string()))?;

        debug!(
            model_name = %req.model_name,
            target_replica_id,
            "delegating request through the directory"
        );

        let mut delegated = req.clone();
        delegated.delegation_hop = 1;

        let channel = tonic::transport::Channel::from_shared(format!("http://{target_endpoint}"))
            .map_err(|err| DispatchError::DelegationFailed(err.to_string()))?
            .connect()
            .await
            .map_err(|err| DispatchError::DelegationFailed(err.to_string()))?;

        let mut client = GrpcInferenceServiceClient::new(channel);
        let response = client
            .model_infer(Request::new(delegated))
            .await
            .map_err(|status| DispatchError::DelegationFailed(status.message().to_string()))?;
        Ok(response.into_inner())
    }
}

impl GrpcInferenceService for DispatchGrpcApi {
    async fn server_live(
        &self,
        _request: Request<ServerLiveRequest>,
    ) -> Result<Response<ServerLiveResponse>, Status> {
        Ok(Response::new(ServerLiveResponse { live: true }))
    }

    async fn server_ready(
        &self,
        _request: Request<ServerReadyRequest>,
    ) -> Result<Response<ServerReadyResponse>, Status> {
        Ok(Response::new(ServerReadyResponse {
            ready: self.readiness.is_ready(),
        }))
    }

    async fn server_metadata(
        &self,
        _request: Request<ServerMetadataRequest>,
    ) -> Result<Response<ServerMetadataResponse>, Status> {
        Ok(Response::new(ServerMetadataResponse {
            name: SERVER_NAME.to_string(),
            version: SERVER_VERSION.to_string(),
            extensions: Vec::new(),
        }))
    }

    async fn model_ready(
        &self,
        request: Request<ModelReadyRequest>,
    ) -> Result<Response<ModelReadyResponse>, Status> {
        let req = request.into_inner();
        let ready = self.registry.lookup(&req.name, &req.version).is_ok();
        Ok(Response::new(ModelReadyResponse { ready }))
    }

    async fn model_metadata(
        &self,
        request: Request<ModelMetadataRequest>,
    ) -> Result<Response<ModelMetadataResponse>, Status> {
        let req = request.into_inner();
        self.registry
            .lookup(&req.name, &req.version)
            .map_err(|_| DispatchError::not_found(&req.name, &req.version))?;

        Ok(Response::new(ModelMetadataResponse {
            name: req.name,
            versions: if req.version.is_empty() {
                Vec::new()
            } else {
                vec![req.version]
            },
            platform: "dispatcher".to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }))
    }

    async fn model_infer(
        &self,
        request: Request<ModelInferRequest>,
    ) -> Result<Response<ModelInferResponse>, Status> {
        if !self.readiness.is_ready() {
            return Err(DispatchError::Unavailable.into());
        }

        let req = request.into_inner();
        let span = tracing::info_span!(
            "model_infer",
            model_name = %req.model_name,
            model_version = %req.model_version,
            id = %req.id,
        );
        let _enter = span.enter();

        match self.registry.lookup(&req.model_name, &req.model_version) {
            Ok(endpoint) => {
                let response = self.infer_locally(&req, &endpoint).await.map_err(|err| {
                    warn!(%err, "worker forward failed");
                    err
                })?;
                Ok(Response::new(response))
            }
            Err(_not_found) => {
                info!("model not found locally, attempting delegation");
                let response = self.delegate(&req).await.map_err(|err| {
                    debug!(%err, "delegation did not resolve the request");
                    match err {
                        DispatchError::DelegationDepthExceeded => err,
                        _ => DispatchError::not_found(&req.model_name, &req.model_version),
                    }
                })?;
                Ok(Response::new(response))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;

    fn api(registry: Registry) -> DispatchGrpcApi {
        let pool = dispatcher_base::pool::Pool::new(4);
        let worker_client = WorkerClient::new(pool, dispatcher_base::codec::DEFAULT_MAX_FRAME_BYTES);
        let readiness = ReadinessFlag::new();
        readiness.set_ready(true);
        DispatchGrpcApi::new(registry, worker_client, readiness, None)
    }

    #[tokio::test]
    async fn server_live_is_always_true() {
        let response = api(Registry::new())
            .server_live(Request::new(ServerLiveRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert!(response.live);
    }

    #[tokio::test]
    async fn server_ready_reflects_the_readiness_flag() {
        let dispatch = api(Registry::new());
        let response = dispatch
            .server_ready(Request::new(ServerReadyRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert!(response.ready);

        dispatch.readiness.set_ready(false);
        let response = dispatch
            .server_ready(Request::new(ServerReadyRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert!(!response.ready);
    }

    #[tokio::test]
    async fn model_ready_reflects_registry_lookup() {
        let registry = Registry::new();
        registry.register("add", "", "unix:///tmp/w0.sock", "w0");
        let dispatch = api(registry);

        let response = dispatch
            .model_ready(Request::new(ModelReadyRequest {
                name: "add".to_string(),
                version: String::new(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(response.ready);

        let response = dispatch
            .model_ready(Request::new(ModelReadyRequest {
                name: "missing".to_string(),
                version: String::new(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(!response.ready);
    }

    #[tokio::test]
    async fn model_infer_on_a_missing_model_without_delegation_is_not_found() {
        let dispatch = api(Registry::new());

        let status = dispatch
            .model_infer(Request::new(ModelInferRequest {
                model_name: "missing".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn model_infer_when_not_ready_is_unavailable() {
        let dispatch = api(Registry::new());
        dispatch.readiness.set_ready(false);

        let status = dispatch
            .model_infer(Request::new(ModelInferRequest {
                model_name: "add".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unavailable);
    }

    #[tokio::test]
    async fn model_infer_forwards_to_the_registered_worker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w0.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let payload = dispatcher_base::codec::read_frame(
                    &mut stream,
                    dispatcher_base::codec::DEFAULT_MAX_FRAME_BYTES,
                )
                .await
                .unwrap();
                let request = ModelInferRequest::decode(payload.as_slice()).unwrap();
                let response = ModelInferResponse {
                    model_name: request.model_name,
                    model_version: request.model_version,
                    id: request.id,
                    ..Default::default()
                };
                dispatcher_base::codec::write_frame(&mut stream, &response.encode_to_vec())
                    .await
                    .unwrap();
            }
        });

        let registry = Registry::new();
        registry.register(
            "add",
            "",
            &format!("unix://{}", path.display()),
            "w0",
        );
        let dispatch = api(registry);

        let response = dispatch
            .model_infer(Request::new(ModelInferRequest {
                model_name: "add".to_string(),
                id: "req-1".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.model_name, "add");
        assert_eq!(response.id, "req-1");
    }
}
