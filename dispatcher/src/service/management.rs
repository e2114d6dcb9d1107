//! The Management RPC surface (§4.6): `RegisterModel`, `UnregisterModel`,
//! `Heartbeat`. Exposed on a distinct port from the inference surface and
//! consumed only by local Workers; this is the Registry's sole mutator
//! from outside the process.

use dispatcher_base::registry::Registry;
use dispatcher_proto::proto::dispatcher::management::v1::management_service_server::ManagementService;
use dispatcher_proto::proto::dispatcher::management::v1::{
    HeartbeatRequest, HeartbeatResponse, RegisterModelRequest, RegisterModelResponse,
    UnregisterModelRequest, UnregisterModelResponse,
};
use tonic::{Request, Response, Status};
use tracing::info;

pub struct ManagementGrpcApi {
    registry: Registry,
}

impl ManagementGrpcApi {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }
}

impl ManagementService for ManagementGrpcApi {
    async fn register_model(
        &self,
        request: Request<RegisterModelRequest>,
    ) -> Result<Response<RegisterModelResponse>, Status> {
        let req = request.into_inner();
        info!(
            model_name = %req.model_name,
            model_version = %req.model_version,
            worker_id = %req.worker_id,
            worker_address = %req.worker_address,
            "management: register_model"
        );

        self.registry.register(
            &req.model_name,
            &req.model_version,
            &req.worker_address,
            &req.worker_id,
        );

        Ok(Response::new(RegisterModelResponse {
            success: true,
            message: format!("registered {} for worker {}", req.model_name, req.worker_id),
        }))
    }

    async fn unregister_model(
        &self,
        request: Request<UnregisterModelRequest>,
    ) -> Result<Response<UnregisterModelResponse>, Status> {
        let req = request.into_inner();
        let removed =
            self.registry
                .unregister_model(&req.model_name, &req.model_version, &req.worker_id);

        info!(
            model_name = %req.model_name,
            model_version = %req.model_version,
            worker_id = %req.worker_id,
            removed,
            "management: unregister_model"
        );

        let message = if removed {
            format!("unregistered {} for worker {}", req.model_name, req.worker_id)
        } else {
            format!(
                "no entry for {} owned by worker {}",
                req.model_name, req.worker_id
            )
        };

        Ok(Response::new(UnregisterModelResponse {
            success: removed,
            message,
        }))
    }

    async fn heartbeat(
        &self,
        request: Request<HeartbeatRequest>,
    ) -> Result<Response<HeartbeatResponse>, Status> {
        // Reserved for future TTL-based pruning; currently a no-op that
        // always reports healthy, but the call must still be accepted.
        let _req = request.into_inner();
        Ok(Response::new(HeartbeatResponse { healthy: true }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_unregister_round_trips_through_the_registry() {
        let registry = Registry::new();
        let api = ManagementGrpcApi::new(registry.clone());

        let response = api
            .register_model(Request::new(RegisterModelRequest {
                model_name: "add".to_string(),
                model_version: String::new(),
                worker_address: "unix:///tmp/w0.sock".to_string(),
                worker_id: "w0".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(response.success);
        assert_eq!(registry.lookup("add", "").unwrap(), "unix:///tmp/w0.sock");

        let response = api
            .unregister_model(Request::new(UnregisterModelRequest {
                model_name: "add".to_string(),
                model_version: String::new(),
                worker_id: "w0".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(response.success);
        assert!(registry.lookup("add", "").is_err());
    }

    #[tokio::test]
    async fn unregister_of_an_absent_entry_reports_failure_not_an_error() {
        let api = ManagementGrpcApi::new(Registry::new());

        let response = api
            .unregister_model(Request::new(UnregisterModelRequest {
                model_name: "missing".to_string(),
                model_version: String::new(),
                worker_id: "w0".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(!response.success);
    }

    #[tokio::test]
    async fn heartbeat_is_accepted_and_reports_healthy() {
        let api = ManagementGrpcApi::new(Registry::new());

        let response = api
            .heartbeat(Request::new(HeartbeatRequest {
                worker_id: "w0".to_string(),
                model_names: vec!["add".to_string()],
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(response.healthy);
    }
}
