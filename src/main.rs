use geo_relay::api::build_router;
use geo_relay::logging::{FileLogger, setup_logging};
use geo_relay::rate_limit::spawn_sweeper;
use geo_relay::{build_state, load_config};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_appender::rolling::Rotation;

const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8888";
const DEFAULT_CONFIG_PATH: &str = "relay_config.toml";

fn rotation_from_env() -> Rotation {
    match std::env::var("LOG_ROTATION").as_deref() {
        Ok("hourly") => Rotation::HOURLY,
        Ok("never") => Rotation::NEVER,
        _ => Rotation::DAILY,
    }
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let file_logger = std::env::var("LOG_DIR")
        .ok()
        .map(|dir| FileLogger::new(PathBuf::from(dir)).with_rotation(rotation_from_env()));
    // flushes file logs on shutdown
    let _log_guard = setup_logging(file_logger.as_ref());

    let bind_address =
        std::env::var("BIND_ADDRESS").unwrap_or_else(|_| DEFAULT_BIND_ADDRESS.to_string());
    let config_path =
        std::env::var("RELAY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

    let config = match load_config(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };
    let sweep_interval = config
        .rate_limit
        .needs_sweeper()
        .then(|| config.rate_limit.sweep_interval());

    let state = match build_state(config).await {
        Ok(state) => state,
        Err(e) => {
            error!("Startup failed: {}", e);
            std::process::exit(1);
        }
    };

    if let (Some(limiter), Some(every)) = (&state.limiter, sweep_interval) {
        spawn_sweeper(limiter.clone(), every);
    }

    let app = build_router(state);

    let listener = match tokio::net::TcpListener::bind(&bind_address).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", bind_address, e);
            std::process::exit(1);
        }
    };

    info!("Listening on {}", bind_address);
    info!("Using config at {:?}", config_path);
    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}
