//! Vectormesh — the control plane of a multi-tenant data-integration
//! platform:
//! - content-addressed, versioned workflow definitions over a step DAG
//! - an execution orchestrator with retry, pause/resume/cancel, and an
//!   append-only event log
//! - typed activity dispatch (extract, transform, load, filter, join,
//!   remote-agent sources)
//! - a duplex WebSocket channel to remote data-plane agents
//! - tiered admission control with per-tenant rate limits

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;
