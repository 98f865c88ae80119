//! Core application
//!
//! Wires the pieces together: configuration, the metrics sink, the sharded
//! datastore, the REST and HRPC servers, the optional startup notification,
//! and graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use crate::api::{ApiState, HrpcServer};
use crate::core::cli::{self, Cli};
use crate::core::config::AppConfig;
use crate::core::constants::ENV_LOG;
use crate::core::notify::{StartupNotification, send_startup_notification};
use crate::core::shutdown::ShutdownService;
use crate::data::DataStore;
use crate::domain::metrics::MetricsSink;

pub struct CoreApp {
    pub shutdown: ShutdownService,
    pub config: AppConfig,
    pub store: Arc<DataStore>,
    pub msink: Arc<MetricsSink>,
}

impl CoreApp {
    /// Run the daemon with CLI argument parsing
    pub async fn run() -> Result<()> {
        let cli = cli::parse();
        let config = AppConfig::load(&cli)?;
        Self::init_logging(&config);
        tracing::debug!("Daemon starting");

        let app = Self::init(&cli, config).await?;
        Self::start_servers(app).await
    }

    async fn init(_cli: &Cli, config: AppConfig) -> Result<CoreApp> {
        let msink = Arc::new(MetricsSink::new(config.metrics_config()));
        let store = Arc::new(
            DataStore::open(config.datastore_config(), Arc::clone(&msink))
                .await
                .context("Error creating datastore")?,
        );
        Ok(CoreApp {
            shutdown: ShutdownService::new(),
            config,
            store,
            msink,
        })
    }

    fn init_logging(config: &AppConfig) {
        let filter = std::env::var(ENV_LOG)
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or_else(|_| format!("{},htraced={}", config.log_level, config.log_level));

        tracing_subscriber::fmt()
            .with_target(false)
            .with_level(true)
            .compact()
            .with_env_filter(filter)
            .init();
    }

    async fn start_servers(app: CoreApp) -> Result<()> {
        app.shutdown.install_signal_handlers();

        let listener = TcpListener::bind(app.config.web_address)
            .await
            .with_context(|| format!("Failed to bind web address {}", app.config.web_address))?;
        let http_addr = listener.local_addr()?;

        let hrpc = match app.config.hrpc_address {
            Some(addr) => {
                let server = HrpcServer::start(
                    addr,
                    Arc::clone(&app.store),
                    app.config.query_timeout,
                    app.shutdown.subscribe(),
                )
                .await
                .with_context(|| format!("Failed to bind HRPC address {}", addr))?;
                Some(server)
            }
            None => {
                tracing::info!("Not starting the HRPC server because hrpc.address is unset");
                None
            }
        };
        let hrpc_addr = hrpc.as_ref().map(|server| server.local_addr);
        if let Some(server) = hrpc {
            app.shutdown.register(server.task).await;
        }

        if let Some(naddr) = &app.config.startup_notification_address {
            send_startup_notification(
                naddr,
                &StartupNotification {
                    http_addr: http_addr.to_string(),
                    hrpc_addr: hrpc_addr.map(|a| a.to_string()).unwrap_or_default(),
                    process_id: std::process::id(),
                },
            )
            .await
            .context("Failed to send startup notification")?;
        }

        tracing::info!(addr = %http_addr, "REST server listening");
        axum::serve(
            listener,
            crate::api::router(ApiState {
                store: Arc::clone(&app.store),
                query_timeout: app.config.query_timeout,
            })
            .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(app.shutdown.wait())
        .await?;

        // Stop accepting, drain the writers, then let the sink go quiet.
        app.shutdown.shutdown().await;
        app.store.shutdown().await;
        app.msink.shutdown().await;
        tracing::info!("Shutdown complete");
        Ok(())
    }
}
