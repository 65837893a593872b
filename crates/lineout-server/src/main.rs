mod admin;
mod http;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use lineout_agent::AgentService;
use lineout_core::{emit_error, emit_progress, Core, LineoutPaths};
use tokio::net::UnixListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::admin::{handle_admin_client, AdminHandler, ServerState, Services};

/// Bring up webhooks, polling and the agent over an initialized core.
async fn start_services(core: Core, shutdown: watch::Receiver<bool>) -> Result<Services> {
    let (webhook, worker) = core.webhook_handler();
    tokio::spawn(worker.run());

    let loaded = match webhook.load_channel().await {
        Ok(channel) => channel,
        Err(err) => {
            warn!("Failed to load persisted watch channel: {:#}", err);
            None
        }
    };

    if core.config.webhook.enabled {
        http::spawn_listener(
            &core.config.webhook.bind_address,
            &core.config.webhook.path,
            webhook.clone(),
        )?;
        if loaded.is_none() {
            match webhook.register_channel().await {
                Ok(channel) => info!("Registered Drive watch channel {}", channel.id),
                Err(err) => warn!("Webhook registration failed, relying on polling: {:#}", err),
            }
        }
    }

    let polling = Arc::new(core.polling_service(Some(webhook.clone())));
    if core.config.polling.enabled {
        let poller = polling.clone();
        tokio::spawn(async move { poller.run(shutdown).await });
    }

    let agent = Arc::new(AgentService::from_core(&core)?);
    Ok(Services {
        core,
        agent,
        webhook,
        polling,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout is reserved for LINEOUT_PROGRESS lines
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let paths = LineoutPaths::from_env();
    paths.ensure_dirs()?;

    if Path::new(&paths.admin_socket_path).exists() {
        std::fs::remove_file(&paths.admin_socket_path)?;
    }

    let state = Arc::new(ServerState::default());

    // bind before init so clients can poll get_status while Mongo and Elastic come up
    let admin_listener = UnixListener::bind(&paths.admin_socket_path)?;
    info!("Admin server listening on {}", paths.admin_socket_path.display());

    let admin_handler = Arc::new(AdminHandler::new(state.clone()));
    tokio::spawn(async move {
        loop {
            match admin_listener.accept().await {
                Ok((stream, _)) => {
                    let handler = admin_handler.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_admin_client(stream, handler).await {
                            error!("Admin client error: {}", err);
                        }
                    });
                }
                Err(err) => {
                    error!("Admin accept error: {}", err);
                }
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    info!("Initializing engine...");
    let init_state = state.clone();
    let init_paths = paths.clone();
    tokio::spawn(async move {
        let started = match Core::init(&init_paths).await {
            Ok(core) => start_services(core, shutdown_rx).await,
            Err(err) => Err(err),
        };
        match started {
            Ok(services) => {
                init_state.set_ready(services).await;
                info!("Engine ready");
                emit_progress("daemon", "complete", "Engine ready", None);
            }
            Err(err) => {
                error!("Failed to initialize engine: {:#}", err);
                emit_error("daemon", &format!("Failed to initialize: {:#}", err));
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    let _ = shutdown_tx.send(true);

    if Path::new(&paths.admin_socket_path).exists() {
        if let Err(err) = std::fs::remove_file(&paths.admin_socket_path) {
            warn!("Failed to remove admin socket: {}", err);
        }
    }
    Ok(())
}
