//! REST API under `/api`.

pub mod collections;
pub mod comparer;
pub mod decoder;
pub mod intruder;
pub mod proxy;
pub mod requests;
pub mod rules;
pub mod scanner;
pub mod sequencer;
pub mod spider;
pub mod targets;

use crate::state::AppContext;
use axum::Router;
use std::sync::Arc;

pub fn api_router() -> Router<Arc<AppContext>> {
    Router::new()
        .nest("/requests", requests::router())
        .nest("/rules", rules::router())
        .nest("/proxy", proxy::router())
        .nest("/intruder", intruder::router())
        .nest("/spider", spider::router())
        .nest("/scanner", scanner::router())
        .nest("/decoder", decoder::router())
        .nest("/sequencer", sequencer::router())
        .nest("/comparer", comparer::router())
        .nest("/collections", collections::router())
        .nest("/targets", targets::router())
}
