//! Axum-based API Gateway for the fundraising assistant. Config-driven via CoreConfig.

mod handlers;

use axum::http::Method;
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, patch, post},
    Json, Router,
};
use std::path::Path as StdPath;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::field::Visit;
use tracing_subscriber::layer::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fundr_core::{
    BroadcastProgress, CoreConfig, LanguageModel, Orchestrator, Reconciler, ReconcilerHandle, SearchIndex, SledStore,
    SystemClock,
};
use fundr_skills::{default_registry, DatasetIndex, LlmMode, ModelRouter};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// How often expired credit reservations are released.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Captures the "message" field from a tracing event.
struct MessageCollector<'a>(&'a mut String);

impl Visit for MessageCollector<'_> {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            *self.0 = value.to_string();
        }
    }
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            *self.0 = format!("{:?}", value);
        }
    }
}

/// Sends each tracing event as a line to a broadcast channel for SSE log streaming.
#[derive(Clone)]
struct LogBroadcastLayer {
    tx: broadcast::Sender<String>,
}

impl LogBroadcastLayer {
    fn new(tx: broadcast::Sender<String>) -> Self {
        Self { tx }
    }
}

impl<S> tracing_subscriber::Layer<S> for LogBroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut message = String::new();
        event.record(&mut MessageCollector(&mut message));
        let line = format!(
            "{} [{}] {}",
            event.metadata().level(),
            event.metadata().target(),
            message
        );
        let _ = self.tx.send(line);
    }
}

fn db_path(config: &CoreConfig) -> std::path::PathBuf {
    StdPath::new(&config.storage_path).join("fundr")
}

/// Pre-flight check: config loads, database opens, dataset parses, port is free.
fn run_verify() -> Result<(), String> {
    let config = CoreConfig::load().map_err(|e| format!("Config load failed: {}", e))?;

    print!("Checking database... ");
    let store = SledStore::open_path(db_path(&config)).map_err(|e| format!("database LOCKED or inaccessible: {}", e))?;
    let counts = store.tree_counts();
    drop(store);
    println!("OK ({} trees)", counts.len());

    match &config.search_dataset_path {
        Some(path) => {
            print!("Checking search dataset {}... ", path);
            let index = DatasetIndex::load(path).map_err(|e| e.to_string())?;
            let (investors, companies) = index.counts();
            println!("OK ({} investors, {} companies)", investors, companies);
        }
        None => println!("No search dataset configured; searches will return no results."),
    }

    let port = config.port;
    print!("Checking port {}... ", port);
    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
    match std::net::TcpListener::bind(addr) {
        Ok(listener) => {
            drop(listener);
            println!("OK (available)");
        }
        Err(e) => {
            return Err(format!("Port {} BLOCKED: {}", port, e));
        }
    }

    println!("\nSUCCESS: ready to start gateway.");
    Ok(())
}

#[tokio::main]
async fn main() {
    // Load .env file if present (before any env::var calls)
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[fundr-gateway] .env not loaded: {} (using system environment)", e);
    }

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--verify") {
        match run_verify() {
            Ok(()) => std::process::exit(0),
            Err(e) => {
                eprintln!("PRE-FLIGHT FAILED: {}", e);
                std::process::exit(1);
            }
        }
    }

    let (log_tx, _) = broadcast::channel(1000);
    let log_layer = LogBroadcastLayer::new(log_tx.clone());

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(log_layer)
        .init();

    if let Err(e) = run(log_tx).await {
        tracing::error!(target: "fundr::gateway", error = %e, "gateway stopped");
        std::process::exit(1);
    }
}

async fn run(log_tx: broadcast::Sender<String>) -> Result<(), BoxError> {
    let config = Arc::new(CoreConfig::load()?);
    let store = Arc::new(SledStore::open_path(db_path(&config))?);
    let model: Arc<dyn LanguageModel> = Arc::new(ModelRouter::from_config(&config));
    let index: Arc<dyn SearchIndex> = match &config.search_dataset_path {
        Some(path) => Arc::new(DatasetIndex::load(path)?),
        None => {
            tracing::warn!(target: "fundr::gateway", "no search_dataset_path configured; searches return no results");
            Arc::new(DatasetIndex::empty())
        }
    };

    let (state, reconciler, worker) = assemble(Arc::clone(&config), Arc::clone(&store), model, index, log_tx);
    let sweeper = tokio::spawn(sweep_loop(state.clone(), SWEEP_INTERVAL));
    let app = build_app(state);

    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], config.port));
    tracing::info!(target: "fundr::gateway", "{} listening on {}", config.app_name, addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!(target: "fundr::gateway", "draining reconciliation queue");
    sweeper.abort();
    reconciler.shutdown().await;
    if let Err(e) = worker.await {
        tracing::warn!(target: "fundr::gateway", error = %e, "reconciler worker ended abnormally");
    }
    store.flush().await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(target: "fundr::gateway", error = %e, "ctrl-c handler unavailable");
        std::future::pending::<()>().await;
    }
}

/// Wires store, model, search index, skills, reconciler and orchestrator into the app state.
fn assemble(
    config: Arc<CoreConfig>,
    store: Arc<SledStore>,
    model: Arc<dyn LanguageModel>,
    index: Arc<dyn SearchIndex>,
    log_tx: broadcast::Sender<String>,
) -> (AppState, ReconcilerHandle, JoinHandle<()>) {
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        store.clone(),
        Some(model.clone()),
        config.reconciler.clone(),
    ));
    let (handle, worker) = Arc::clone(&reconciler).spawn();
    let progress = Arc::new(BroadcastProgress::default());
    let registry = Arc::new(default_registry(model.clone(), index));
    let orchestrator = Arc::new(Orchestrator::new(
        &config,
        store.clone(),
        model,
        registry,
        progress.clone(),
        Arc::new(SystemClock),
        handle.clone(),
    ));
    let state = AppState {
        llm_mode: LlmMode::parse(&config.llm_mode),
        config,
        store,
        orchestrator,
        reconciler,
        progress,
        log_tx,
    };
    (state, handle, worker)
}

/// Periodically releases credit reservations that were never committed.
async fn sweep_loop(state: AppState, tick: Duration) {
    let mut interval = tokio::time::interval(tick);
    loop {
        interval.tick().await;
        match state.orchestrator.meter().sweep_expired() {
            Ok(0) => {}
            Ok(n) => tracing::info!(target: "fundr::gateway", released = n, "expired reservations released"),
            Err(e) => tracing::warn!(target: "fundr::gateway", error = %e, "reservation sweep failed"),
        }
    }
}

fn build_app(state: AppState) -> Router {
    // CORS: allow Backend/API (8001-8099) and Frontend/UI (3001-3099) port ranges.
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(|origin: &axum::http::HeaderValue, _| {
            let s = origin.to_str().unwrap_or("");
            let port = s
                .rsplit(':')
                .next()
                .and_then(|p| p.parse::<u16>().ok())
                .unwrap_or(0);
            (3001..=3099).contains(&port) || (8001..=8099).contains(&port)
        }))
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
        .expose_headers(tower_http::cors::Any);

    Router::new()
        .route("/v1/status", get(status))
        .route("/v1/chat", post(handlers::chat::chat))
        .route("/v1/progress/:user_id", get(handlers::chat::progress_stream))
        .route("/v1/projects/:project_id/completeness", get(handlers::projects::completeness))
        .route("/v1/projects/:project_id/welcome", get(handlers::projects::welcome))
        .route("/v1/projects/:project_id/profile", patch(handlers::projects::edit_profile))
        .route("/v1/projects/:project_id/reconcile", post(handlers::projects::reconcile))
        .route(
            "/v1/credits/:user_id",
            get(handlers::credits::balance).post(handlers::credits::set_plan),
        )
        .route("/v1/upsell/:user_id/analytics", get(handlers::credits::upsell_analytics))
        .route("/api/v1/health", get(health))
        .route("/v1/logs/stream", get(logs_stream))
        .with_state(state)
        .layer(cors)
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) config: Arc<CoreConfig>,
    pub(crate) store: Arc<SledStore>,
    pub(crate) orchestrator: Arc<Orchestrator>,
    pub(crate) reconciler: Arc<Reconciler>,
    pub(crate) progress: Arc<BroadcastProgress>,
    pub(crate) log_tx: broadcast::Sender<String>,
    pub(crate) llm_mode: LlmMode,
}

/// GET /api/v1/health – liveness check for UI and scripts.
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// GET /v1/logs/stream – Server-Sent Events stream of gateway logs (tracing output).
async fn logs_stream(
    State(state): State<AppState>,
) -> Sse<impl futures_util::Stream<Item = Result<Event, std::convert::Infallible>> + Send + 'static> {
    use async_stream::stream;
    let mut rx = state.log_tx.subscribe();
    let stream = stream! {
        loop {
            match rx.recv().await {
                Ok(line) => yield Ok(Event::default().data(line)),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    yield Ok(Event::default().data(format!("... {} log lines dropped", n)));
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("keepalive"))
}

/// GET /v1/status – app identity, model mode, registered skills and store sizes.
async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let trees: serde_json::Map<String, serde_json::Value> = state
        .store
        .tree_counts()
        .into_iter()
        .map(|(name, count)| (name.to_string(), count.into()))
        .collect();
    Json(serde_json::json!({
        "app_name": state.config.app_name,
        "port": state.config.port,
        "llm_mode": state.llm_mode.as_str(),
        "skills": state.orchestrator.registry().skill_names(),
        "store": trees,
    }))
}
