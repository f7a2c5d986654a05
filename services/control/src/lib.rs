//! Edgeward tunnel control plane library.
//!
//! The crate ships the `edgeward-control` daemon, but the components are
//! exposed as a library so the integration tests can assemble them with
//! in-memory collaborators.

pub mod api;
pub mod app;
pub mod broker;
pub mod collaborators;
pub mod config;
pub mod dns;
pub mod docker;
pub mod health;
pub mod ingress;
pub mod reconcile;
pub mod restart;
pub mod retry;
pub mod state;
pub mod topology;
pub mod zones;
