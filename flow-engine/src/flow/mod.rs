//! Flow module - recorded transactions, persistence, site-map derivation

pub mod model;
pub mod recorder;
pub mod sitemap;
