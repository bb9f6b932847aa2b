pub mod api;
pub mod audit;
pub mod auth;
pub mod config;
pub mod error;
pub mod fleet;
pub mod guard;
pub mod images;
pub mod node_client;
pub mod node_health;
pub mod orchestrator;
pub mod reconcile;
pub mod registry;
pub mod relay;
pub mod request_meta;
pub mod scheduler;
pub mod state;
pub mod workflow_store;
