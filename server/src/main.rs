use std::net::SocketAddr;
use tokio::net::TcpListener;

use clap::Parser;

use devlink_server::config::{generate_config_template, Cli, Config};
use devlink_server::{routes, state, store, ws};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Handle --generate-config: print template and exit
    if cli.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load(&cli)?;

    // Initialize tracing/logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("devlink_server=info,tower_http=info"));
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().pretty().with_env_filter(filter).init();
    }

    tracing::info!("devlink server v{} starting", env!("CARGO_PKG_VERSION"));

    let store = store::init_store(&config.data_file)?;

    let app_state = state::AppState {
        store,
        connections: ws::ConnectionRegistry::new(),
        liveness: config.liveness(),
    };

    // Dedicated device WebSocket listener
    if config.ws_port != 0 {
        let ws_addr = format!("{}:{}", config.bind_address, config.ws_port);
        let ws_listener = TcpListener::bind(&ws_addr).await?;
        tracing::info!("Device WebSocket listening on ws://{}", ws_addr);

        let device_app = routes::build_device_router(app_state.clone());
        tokio::spawn(async move {
            if let Err(e) = axum::serve(
                ws_listener,
                device_app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            {
                tracing::error!(error = %e, "Device WebSocket listener failed");
            }
        });
    }

    let app = routes::build_router(app_state);

    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("HTTP API listening on http://{}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
