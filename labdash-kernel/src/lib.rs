//! Lab fleet dashboard kernel.
//!
//! Keeps a live view of the targets exposed by a labgrid-style coordinator,
//! runs ad-hoc and scheduled commands under exclusive ownership, and streams
//! changes to connected clients.

pub mod acquisition;
pub mod app;
pub mod broadcast;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod http;
pub mod locks;
pub mod models;
pub mod mqtt;
pub mod presets;
pub mod registry;
pub mod scheduler;
pub mod ws;
