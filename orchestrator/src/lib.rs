//! webmod orchestrator: the web facade over the proxy suite.
//!
//! Owns the single long-lived [`AppContext`] (event bus, CA store,
//! intercept coordinator, engines, storage) and serves the REST API
//! under `/api` plus the `/ws` event stream.

pub mod api;
pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod state;
pub mod system_proxy;
pub mod ws;

pub use config::Config;
pub use database::Database;
pub use state::AppContext;

use axum::http::{header, HeaderValue, Method};
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

pub struct Orchestrator {
    ctx: Arc<AppContext>,
}

impl Orchestrator {
    pub async fn new(config: Config) -> Result<Self, Box<dyn std::error::Error>> {
        let ctx = AppContext::init(config).await?;
        Ok(Self { ctx })
    }

    pub fn context(&self) -> Arc<AppContext> {
        self.ctx.clone()
    }

    /// Start the proxy listener and serve the API until the task ends.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.ctx
            .proxy
            .start(&self.ctx.config.proxy_host, self.ctx.config.proxy_port)
            .await?;

        let app = build_router(self.ctx.clone());
        let addr: SocketAddr = format!("{}:{}", self.ctx.config.api_host, self.ctx.config.api_port)
            .parse()?;
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %addr, "API listening");
        axum::serve(listener, app).await?;
        Ok(())
    }

    /// Shutdown: resolve pending intercepts as forward, then stop the
    /// proxy.
    pub async fn shutdown(&self) {
        self.ctx.coordinator.shutdown();
        let _ = self.ctx.proxy.stop().await;
    }
}

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    let cors = cors_layer(&ctx.config.cors_origins);
    Router::new()
        .nest("/api", api::api_router())
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(ctx)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(
            origins
                .iter()
                .filter_map(|o| HeaderValue::from_str(o).ok())
                .collect::<Vec<_>>(),
        )
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE])
}

async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "healthy",
        "service": "webmod",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
