//! Convo Pipeline: multi-tenant conversation ingestion, real-time analysis,
//! and orchestration.

pub mod analysis;
pub mod api;
pub mod config;
pub mod error;
pub mod health;
pub mod ingestion;
pub mod orchestrator;
pub mod tenant;
