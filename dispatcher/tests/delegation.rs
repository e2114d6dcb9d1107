//! S6 (§8): two Dispatchers register with a real Directory over HTTP; a
//! request arriving at the Dispatcher that doesn't host the model is
//! delegated through the Directory to the one that does, and a second hop
//! is rejected without any network call.

use std::time::Duration;

use dispatcher::delegation::{run_self_registration, DirectoryClient};
use dispatcher::service::dispatch::{DelegationContext, DispatchGrpcApi, ReadinessFlag};
use dispatcher_base::codec::DEFAULT_MAX_FRAME_BYTES;
use dispatcher_base::pool::Pool;
use dispatcher_base::registry::Registry;
use dispatcher_base::worker::WorkerClient;
use dispatcher_proto::proto::dispatcher::v2::grpc_inference_service_server::{
    GrpcInferenceService, GrpcInferenceServiceServer,
};
use dispatcher_proto::proto::dispatcher::v2::{
    ModelInferRequest, ModelInferResponse, ModelMetadataRequest, ModelMetadataResponse,
    ModelReadyRequest, ModelReadyResponse, ServerLiveRequest, ServerLiveResponse,
    ServerMetadataRequest, ServerMetadataResponse, ServerReadyRequest, ServerReadyResponse,
};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{Request, Response, Status};

/// Stands in for a second Dispatcher replica's inference surface: answers
/// every `ModelInfer` with a fixed, recognizable response rather than
/// forwarding to a Worker, so the test can assert the request actually
/// reached this replica and not some other path.
struct CannedDispatch {
    model_name: String,
}

impl GrpcInferenceService for CannedDispatch {
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
        Ok(Response::new(ServerReadyResponse { ready: true }))
    }

    async fn server_metadata(
        &self,
        _request: Request<ServerMetadataRequest>,
    ) -> Result<Response<ServerMetadataResponse>, Status> {
        Ok(Response::new(ServerMetadataResponse {
            name: "dispatcher-b".to_string(),
            version: "test".to_string(),
            extensions: Vec::new(),
        }))
    }

    async fn model_ready(
        &self,
        request: Request<ModelReadyRequest>,
    ) -> Result<Response<ModelReadyResponse>, Status> {
        let req = request.into_inner();
        Ok(Response::new(ModelReadyResponse {
            ready: req.name == self.model_name,
        }))
    }

    async fn model_metadata(
        &self,
        _request: Request<ModelMetadataRequest>,
    ) -> Result<Response<ModelMetadataResponse>, Status> {
        Ok(Response::new(ModelMetadataResponse::default()))
    }

    async fn model_infer(
        &self,
        request: Request<ModelInferRequest>,
    ) -> Result<Response<ModelInferResponse>, Status> {
        let req = request.into_inner();
        assert_eq!(
            req.delegation_hop, 1,
            "a delegated request must carry delegation_hop = 1"
        );
        Ok(Response::new(ModelInferResponse {
            model_name: req.model_name,
            model_version: "from-b".to_string(),
            id: req.id,
            ..Default::default()
        }))
    }
}

/// Binds a real Directory HTTP server on an ephemeral port, matching this
/// workspace's `poem::listener::TcpListener` + `into_acceptor` convention
/// for learning the bound port before serving.
async fn spawn_directory() -> String {
    let listener = poem::listener::TcpListener::bind("127.0.0.1:0");
    let acceptor = listener.into_acceptor().await.unwrap();
    let port = acceptor.local_addr()[0]
        .as_socket_addr()
        .expect("socket address")
        .port();

    let routes = directory::http::routes(
        directory::registry::DirectoryRegistry::new(),
        Duration::from_secs(15),
    );
    tokio::spawn(async move {
        let _ = poem::Server::new_with_acceptor(acceptor).run(routes).await;
    });

    format!("http://127.0.0.1:{port}")
}

/// Binds a second Dispatcher's inference gRPC service on an ephemeral port
/// via a pre-bound `tokio::net::TcpListener`, so the port is known before
/// `serve_with_incoming` starts accepting (no bind-then-connect race).
async fn spawn_remote_dispatcher(model_name: &str) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let incoming = TcpListenerStream::new(listener);

    let service = CannedDispatch {
        model_name: model_name.to_string(),
    };
    tokio::spawn(async move {
        let _ = tonic::transport::Server::builder()
            .add_service(GrpcInferenceServiceServer::new(service))
            .serve_with_incoming(incoming)
            .await;
    });

    addr.to_string()
}

fn dispatch_with_delegation(registry: Registry, delegation: DelegationContext) -> DispatchGrpcApi {
    let worker_client = WorkerClient::new(Pool::new(4), DEFAULT_MAX_FRAME_BYTES);
    let readiness = ReadinessFlag::new();
    readiness.set_ready(true);
    DispatchGrpcApi::new(registry, worker_client, readiness, Some(delegation))
}

async fn wait_until_registered(base_url: &str, replica_id: &str) {
    for _ in 0..100 {
        if let Ok(resp) = reqwest::get(format!("{base_url}/registry")).await {
            if let Ok(entries) = resp.json::<Vec<serde_json::Value>>().await {
                if entries
                    .iter()
                    .any(|e| e["replica_id"] == serde_json::Value::String(replica_id.to_string()))
                {
                    return;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("replica {replica_id} never appeared in the directory snapshot");
}

#[tokio::test]
async fn s6_a_request_this_dispatcher_cannot_satisfy_is_delegated_through_the_directory() {
    let directory_base_url = spawn_directory().await;
    let remote_endpoint = spawn_remote_dispatcher("embed").await;

    // Dispatcher B hosts "embed" and announces it to the directory.
    let registry_b = Registry::new();
    registry_b.register("embed", "", &format!("unix:///unused-{remote_endpoint}"), "w-b");
    let directory_client_b = DirectoryClient::new(directory_base_url.clone());
    tokio::spawn(run_self_registration(
        directory_client_b,
        registry_b,
        "replica-b".to_string(),
        remote_endpoint.clone(),
    ));
    wait_until_registered(&directory_base_url, "replica-b").await;

    // Dispatcher A hosts nothing locally and delegates through the directory.
    let registry_a = Registry::new();
    let delegation = DelegationContext {
        directory: DirectoryClient::new(directory_base_url),
        replica_id: "replica-a".to_string(),
    };
    let dispatch_a = dispatch_with_delegation(registry_a, delegation);

    let response = dispatch_a
        .model_infer(Request::new(ModelInferRequest {
            model_name: "embed".to_string(),
            id: "req-1".to_string(),
            ..Default::default()
        }))
        .await
        .unwrap()
        .into_inner();

    assert_eq!(response.model_version, "from-b");
    assert_eq!(response.id, "req-1");
}

#[tokio::test]
async fn s6_a_second_delegation_hop_is_rejected_without_any_network_call() {
    // directory_base_url points nowhere reachable; if the dispatcher tried
    // a network call it would hang or error out as a transport failure
    // instead of failing fast, so reaching NotFound proves the depth check
    // ran before any request left the process.
    let delegation = DelegationContext {
        directory: DirectoryClient::new("http://127.0.0.1:1".to_string()),
        replica_id: "replica-a".to_string(),
    };
    let dispatch_a = dispatch_with_delegation(Registry::new(), delegation);

    let status = dispatch_a
        .model_infer(Request::new(ModelInferRequest {
            model_name: "embed".to_string(),
            delegation_hop: 1,
            ..Default::default()
        }))
        .await
        .unwrap_err();

    assert_eq!(status.code(), tonic::Code::FailedPrecondition);
}
