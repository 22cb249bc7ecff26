//! HTTP and WebSocket surface.
//!
//! Client routes under `/client`, operator routes under `/admin`, and the
//! device command channel at `/client/ws`. Handlers are thin: they decode the
//! request, call one service and wrap the result in the response envelope.

pub mod admin;
pub mod client;
pub mod response;
pub mod ws;

use axum::Router;
use axum::extract::State;
use axum::routing::{get, post};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use scriptgate_core::ServerConfig;

use crate::apps::AppService;
use crate::delivery::DeliveryService;
use crate::hub::{Hub, HubConfig};
use crate::lifecycle::LifecycleTracker;
use crate::scripts::ScriptService;
use crate::storage::ServerDatabase;

use self::response::{ApiResult, ok};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub apps: AppService,
    pub scripts: ScriptService,
    pub deliveries: DeliveryService,
    pub tracker: LifecycleTracker,
    pub hub: Hub,
    pub max_message_bytes: usize,
}

impl AppState {
    /// Wire every service over one database.
    pub fn new(db: &ServerDatabase, config: &ServerConfig) -> Self {
        let tracker = LifecycleTracker::new(db.clone());
        let deliveries = DeliveryService::new(db.clone(), tracker.clone(), config.delivery_ttl());
        let hub = Hub::new(
            db.clone(),
            tracker.clone(),
            deliveries.clone(),
            HubConfig::from(config),
        );
        Self {
            apps: AppService::new(db.clone(), config.rsa_key_bits),
            scripts: ScriptService::new(db.clone()),
            deliveries,
            tracker,
            hub,
            max_message_bytes: config.max_message_bytes,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/client/ws", get(ws::upgrade))
        .route("/client/secure-scripts/fetch", post(client::fetch))
        .route("/client/secure-scripts/report", post(client::report))
        .route("/client/secure-scripts/versions", get(client::versions))
        .route("/admin/apps", post(admin::create_app))
        .route("/admin/apps/{id}/devices", post(admin::register_device))
        .route("/admin/apps/{id}/online-devices", get(admin::online_devices))
        .route(
            "/admin/apps/{id}/secure-scripts",
            post(admin::create_script).get(admin::list_scripts),
        )
        .route(
            "/admin/apps/{id}/secure-scripts/stats",
            get(admin::script_stats),
        )
        .route(
            "/admin/secure-scripts/{id}",
            get(admin::get_script)
                .put(admin::update_policy)
                .delete(admin::delete_script),
        )
        .route(
            "/admin/secure-scripts/{id}/content",
            post(admin::update_content),
        )
        .route("/admin/secure-scripts/{id}/publish", post(admin::publish))
        .route("/admin/secure-scripts/{id}/deprecate", post(admin::deprecate))
        .route("/admin/secure-scripts/{id}/rotate-key", post(admin::rotate_key))
        .route(
            "/admin/secure-scripts/{id}/deliveries",
            get(admin::deliveries),
        )
        .route("/admin/instructions", get(admin::list_instructions))
        .route("/admin/instructions/send", post(admin::send_instruction))
        .route("/admin/instructions/{id}", get(admin::get_instruction))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub version: &'static str,
    pub online_devices: usize,
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> ApiResult<Health> {
    ok(Health {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        online_devices: state.hub.registry().online_count().await,
    })
}
