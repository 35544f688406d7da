use anyhow::{Context, Result};
use authz_graph::AuthzConfig;
use authz_server::{create_app, AppState};
use clap::Parser;
use std::{env, net::SocketAddr};
use tracing::{info, Level};
use tracing_subscriber::{
    fmt::{self, time::ChronoUtc},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Authorization graph HTTP server
#[derive(Parser, Debug)]
#[command(name = "authz-server")]
#[command(about = "Relationship-based attribute check service")]
struct Args {
    /// Server bind address
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Server port
    #[arg(short, long, default_value = "8080", env = "AUTHZ_PORT")]
    port: u16,

    /// Configuration file path (environment overrides use the AUTHZ__ prefix)
    #[arg(short, long)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    init_tracing(args.verbose)?;

    info!("Starting authz server v{}", env!("CARGO_PKG_VERSION"));

    let config = AuthzConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    info!(
        edge_cache = config.edge_cache.enabled,
        shadow = config.evaluation.shadow,
        remote = config.evaluation.remote_url.is_some(),
        "configuration loaded"
    );

    let state = AppState::connect(config).await?;
    let app = create_app(state);

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", args.host, args.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("authz server running on http://{}", addr);
    info!("Health check available at: http://{}/health", addr);

    axum::serve(listener, app).await.context("HTTP server error")?;
    Ok(())
}

fn init_tracing(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };

    let is_production = env::var("AUTHZ_ENV").map_or(false, |value| value == "production");

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "authz_server={},authz_graph={},tower_http=info,sqlx=warn,hyper=info",
            level, level
        )
        .into()
    });

    if is_production {
        // Structured JSON logging for production
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(false)
                    .json(),
            )
            .try_init()
            .context("Failed to initialise tracing")?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true)
                    .with_timer(ChronoUtc::rfc_3339()),
            )
            .try_init()
            .context("Failed to initialise tracing")?;
    }

    Ok(())
}
