pub mod auth;
pub mod batcher;
pub mod config;
pub mod db;
pub mod docs;
pub mod error;
pub mod registry;
pub mod session;
pub mod ws;

use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::get};
use tokio::sync::mpsc;
use tracing::{debug, info};

use notewire_sync::{Frame, Metadata, encode};

use crate::auth::{AccessControl, Authenticator, StoreAuth};
use crate::batcher::Batcher;
use crate::config::Config;
use crate::db::Store;
use crate::docs::{DocConfig, DocEvent, DocManager};
use crate::registry::Registry;

/// Shared server state threaded through every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub registry: Arc<Registry>,
    pub batcher: Arc<Batcher>,
    pub docs: Arc<DocManager>,
    pub auth: Arc<dyn Authenticator>,
    pub access: Arc<dyn AccessControl>,
}

impl AppState {
    /// Wire up the full state from configuration. Also returns the
    /// document event stream, which [`run_background_tasks`] consumes.
    pub fn build(
        config: Arc<Config>,
        store: Arc<Store>,
    ) -> (Self, mpsc::UnboundedReceiver<DocEvent>) {
        let registry = Arc::new(Registry::new());
        let batcher = Batcher::new(
            Arc::clone(&registry),
            config.batch_max_wait,
            config.batch_max_size,
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let docs = Arc::new(DocManager::new(
            Arc::clone(&store),
            DocConfig {
                save_debounce: config.save_debounce,
                save_retry_backoff: config.save_retry_backoff,
                compaction_threshold: config.compaction_threshold as u64,
            },
            events_tx,
        ));
        let auth = Arc::new(StoreAuth::new(Arc::clone(&store)));

        (
            Self {
                config,
                store,
                registry,
                batcher,
                docs,
                auth: auth.clone(),
                access: auth,
            },
            events_rx,
        )
    }
}

/// Spawn the long-running server tasks: the saved-ack forwarder and
/// the idle-document sweeper.
pub fn run_background_tasks(state: &AppState, mut events_rx: mpsc::UnboundedReceiver<DocEvent>) {
    let registry = Arc::clone(&state.registry);
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            let DocEvent::Saved {
                room_id,
                document_id,
                saved_at,
            } = event;
            debug!(document_id, "forwarding saved ack");
            let frame = encode(&Frame::new(
                &room_id,
                Metadata::SavedAck {
                    document_id: document_id.clone(),
                    saved_at,
                },
            ));
            registry.send_to_subscribers(&room_id, &document_id, &frame);
        }
    });

    let docs = Arc::clone(&state.docs);
    let idle_timeout = state.config.doc_idle_timeout;
    let sweep_interval = state.config.sweep_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            docs.sweep_idle(idle_timeout);
        }
    });

    info!("background tasks started");
}

#[derive(serde::Serialize)]
struct HealthResponse {
    status: &'static str,
    active_connections: usize,
    active_rooms: usize,
    open_documents: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.registry.stats();
    Json(HealthResponse {
        status: "ok",
        active_connections: stats.active_connections,
        active_rooms: stats.active_rooms,
        open_documents: state.docs.open_docs(),
    })
}

/// Build the HTTP router.
pub fn router(state: AppState) -> Router {
    use axum::http::{Method, header};
    use tower_http::{
        cors::{AllowOrigin, CorsLayer},
        trace::TraceLayer,
    };

    let origins: Vec<_> = state
        .config
        .cors_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_origin(AllowOrigin::list(origins));

    Router::new()
        .route("/", get(|| async { "Notewire Sync Server" }))
        .route("/health", get(health))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
