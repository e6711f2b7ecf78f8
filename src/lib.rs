//! liqhunter - liquidation-cascade counter-trading engine.
//!
//! Ingests the venue-wide forced-liquidation stream, detects cascades in a
//! rolling volume window, opens counter-directional leveraged entries, and
//! protects the resulting position as independent tranches with one TP and
//! one SL each. A mark-price fast path market-reduces tranches whose TP the
//! venue printed through, and a periodic reconciler keeps engine state
//! aligned with venue truth.

pub mod config;
pub mod engine;
pub mod error;
pub mod models;
pub mod projections;
pub mod store;
pub mod streams;
pub mod venue;

pub use config::{Config, Credentials};
pub use engine::Engine;
pub use error::{VenueError, VenueResult};
pub use projections::Projections;
