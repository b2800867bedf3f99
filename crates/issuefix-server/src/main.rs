mod logging;
mod routes;
mod webhook;

use axum::{
    routing::{get, post},
    Router,
};
use issuefix_agent::{AiderBackend, ClaudeBackend};
use issuefix_core::{
    agent::AgentBackend,
    config::Config,
    git::GitCli,
    github::GithubClient,
    pipeline::Pipeline,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use logging::BroadcastLayer;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

// ── AppState ──────────────────────────────────────────────────────────────

pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub start_time: Instant,
    pub webhook_secret: String,
    pub bot_login: String,
    pub log_tx: broadcast::Sender<String>,
    pub log_ring: Arc<std::sync::Mutex<VecDeque<String>>>,
}

fn build_backend(config: &Config) -> Arc<dyn AgentBackend> {
    match config.backend.as_str() {
        "aider" => Arc::new(AiderBackend::new(&config.agent_bin, &config.model)),
        _ => Arc::new(ClaudeBackend::new(&config.agent_bin, &config.model)),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

// ── main ──────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (log_tx, _log_rx) = broadcast::channel::<String>(256);
    let log_ring = Arc::new(std::sync::Mutex::new(VecDeque::new()));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "issuefix_server=info,issuefix_core=info,issuefix_agent=info,tower_http=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(BroadcastLayer {
            tx: log_tx.clone(),
            ring: Arc::clone(&log_ring),
        })
        .init();

    let config = Config::from_env()?;
    if config.github_token.is_empty() {
        warn!("GITHUB_TOKEN is not set; platform calls will be unauthenticated");
    }
    if config.webhook_secret.is_empty() {
        warn!("GITHUB_WEBHOOK_SECRET is not set; webhook signatures are not verified");
    }

    let mut settings = config.pipeline_settings();
    std::fs::create_dir_all(&settings.workspace_root)?;

    let platform = Arc::new(GithubClient::new(
        &config.github_api_base,
        &config.github_token,
        REQUEST_TIMEOUT,
    )?);
    if settings.bot_login.is_empty() {
        match platform.authenticated_login().await {
            Ok(login) => {
                info!(bot_login = %login, "resolved bot login from token");
                settings.bot_login = login;
            }
            Err(e) => warn!(
                "BOT_LOGIN is not set and the token owner could not be resolved ({e}); \
                 only marked bot comments will be recognized"
            ),
        }
    }
    let bot_login = settings.bot_login.clone();
    let backend = build_backend(&config);
    info!(
        backend = backend.name(),
        workspace = %settings.workspace_root.display(),
        max_concurrent_runs = settings.max_concurrent_runs,
        "pipeline configured"
    );

    let (pipeline, _event_rx) = Pipeline::new(platform, Arc::new(GitCli::new()), backend, settings);
    let pipeline = Arc::new(pipeline);

    let state = Arc::new(AppState {
        pipeline: Arc::clone(&pipeline),
        start_time: Instant::now(),
        webhook_secret: config.webhook_secret.clone(),
        bot_login,
        log_tx,
        log_ring,
    });

    let app = Router::new()
        .route("/health", get(routes::health))
        .route("/webhook", post(routes::webhook))
        .route("/api/logs", get(routes::recent_logs))
        .route("/api/logs/stream", get(routes::sse_logs))
        .route("/api/events", get(routes::sse_events))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("{}:{}", config.web_bind, config.web_port);
    info!("Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if tokio::time::timeout(SHUTDOWN_GRACE, pipeline.wait_idle()).await.is_err() {
        warn!(
            active = pipeline.active_issues().await.len(),
            "shutting down with runs still in flight"
        );
    }
    Ok(())
}
