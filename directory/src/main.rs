use std::time::Duration;

use directory::config::make_config_loader;
use directory::http::routes;
use directory::registry::DirectoryRegistry;
use dispatcher_base::tracing::init_tracing_with_default_env_filter;
use poem::listener::TcpListener;
use tracing::info;

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

async fn async_main(config: directory::config::DirectoryConfig) -> anyhow::Result<()> {
    let directory = DirectoryRegistry::new();
    let app = routes(directory, config.keep_alive_interval());

    let bind_address = config.http_bind_address();
    info!(%bind_address, "directory: listening");

    poem::Server::new(TcpListener::bind(bind_address))
        .run_with_graceful_shutdown(app, shutdown_signal(), Some(Duration::from_secs(5)))
        .await?;

    info!("directory: shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
