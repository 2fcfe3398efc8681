//! Flow Engine - Traffic Flow Records & Persistence Interface
//!
//! This crate owns the central `Flow` entity (one recorded client to
//! upstream transaction), the recorder that persists finalized flows, the
//! site-map builder that derives per-host path trees from recorded
//! traffic, and the storage traits every persistence backend implements.
//!
//! ## Core Concepts
//!
//! - **Flow**: one recorded HTTP(S)/WebSocket transaction
//! - **Recorder**: persists finalized flows exactly once and announces them
//! - **FlowStore**: the only seam the engines use to reach persistence;
//!   SQL lives entirely behind it

pub mod error;
pub mod flow;
pub mod store;

pub use error::{FlowEngineError, FlowResult};
pub use flow::model::{Flow, FlowFilter, Scheme, WebSocketDirection, WebSocketMessage};
pub use flow::recorder::Recorder;
pub use flow::sitemap::{build_site_map, SiteMapNode};
pub use store::{FlowStore, StoreError};
