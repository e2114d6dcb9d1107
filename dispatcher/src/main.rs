use std::time::Duration;

use dispatcher::config::{make_config_loader, DispatcherConfig};
use dispatcher::delegation::{run_self_registration, DirectoryClient};
use dispatcher::service::dispatch::{DelegationContext, DispatchGrpcApi, ReadinessFlag};
use dispatcher::service::management::ManagementGrpcApi;
use dispatcher::supervisor::ManagedWorkers;
use dispatcher_base::pool::Pool;
use dispatcher_base::registry::Registry;
use dispatcher_base::tracing::init_tracing_with_default_env_filter;
use dispatcher_base::worker::WorkerClient;
use dispatcher_proto::proto;
use dispatcher_proto::proto::dispatcher::management::v1::management_service_server::ManagementServiceServer;
use dispatcher_proto::proto::dispatcher::v2::grpc_inference_service_server::GrpcInferenceServiceServer;
use tokio::select;
use tonic::transport::Server;
use tracing::{error, info};

fn main() -> anyhow::Result<()> {
    let Some(config) = make_config_loader().load_or_dump_config() else {
        return Ok(());
    };
    let config = config?;

    init_tracing_with_default_env_filter(&config.tracing);

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(config))
}

async fn async_main(config: DispatcherConfig) -> anyhow::Result<()> {
    let registry = Registry::new();
    let pool = Pool::new(config.pool.max_connections_per_worker);
    let worker_client = WorkerClient::new(pool.clone(), config.pool.max_frame_bytes);
    let readiness = ReadinessFlag::new();

    let delegation = match &config.delegation.directory_base_url {
        Some(base_url) => {
            let replica_id = config
                .delegation
                .replica_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            Some(DelegationContext {
                directory: DirectoryClient::new(base_url.clone()),
                replica_id,
            })
        }
        None => None,
    };

    if let Some(ctx) = &delegation {
        let endpoint = config
            .delegation
            .advertised_endpoint
            .clone()
            .unwrap_or_else(|| config.inference_bind_address());
        let directory = ctx.directory.clone();
        let registry_for_registration = registry.clone();
        let replica_id = ctx.replica_id.clone();
        tokio::spawn(run_self_registration(
            directory,
            registry_for_registration,
            replica_id,
            endpoint,
        ));
    }

    info!(workers = config.workers.len(), "spawning configured workers");
    let managed_workers =
        ManagedWorkers::spawn_all(&config.workers, config.supervisor.readiness_timeout()).await;
    if managed_workers.len().await < config.workers.len() {
        error!(
            spawned = managed_workers.len().await,
            configured = config.workers.len(),
            "not every configured worker became ready"
        );
    }

    let watchdog_workers = managed_workers.clone();
    let watchdog_registry = registry.clone();
    let liveness_poll_interval = Duration::from_secs(2);

    let dispatch_api = DispatchGrpcApi::new(
        registry.clone(),
        worker_client,
        readiness.clone(),
        delegation,
    );
    let management_api = ManagementGrpcApi::new(registry.clone());

    let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<GrpcInferenceServiceServer<DispatchGrpcApi>>()
        .await;

    let reflection_service = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(proto::FILE_DESCRIPTOR_SET)
        .build_v1()?;

    let inference_addr = config.inference_bind_address().parse()?;
    let management_addr = config.management_bind_address().parse()?;

    info!(%inference_addr, %management_addr, "dispatcher: listening");
    readiness.set_ready(true);

    let inference_server = tokio::spawn(async move {
        Server::builder()
            .add_service(reflection_service)
            .add_service(health_service)
            .add_service(GrpcInferenceServiceServer::new(dispatch_api))
            .serve(inference_addr)
            .await
    });

    let management_server = tokio::spawn(async move {
        Server::builder()
            .add_service(ManagementServiceServer::new(management_api))
            .serve(management_addr)
            .await
    });

    let watchdog = tokio::spawn(async move {
        watchdog_workers
            .watch_liveness(watchdog_registry, liveness_poll_interval)
            .await;
    });

    select! {
        result = inference_server => {
            result??;
        }
        result = management_server => {
            result??;
        }
        _ = shutdown_signal() => {
            info!("dispatcher: shutdown signal received");
        }
    }

    readiness.set_ready(false);
    watchdog.abort();
    managed_workers
        .stop_all(config.supervisor.graceful_stop())
        .await;

    info!("dispatcher: shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
