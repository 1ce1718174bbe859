pub mod api;
pub mod auth;
pub mod backup_bundle;
pub mod cli;
pub mod config;
pub mod core_node;
pub mod db;
pub mod device_catalog;
pub mod error;
pub mod ids;
pub mod json;
pub mod node_agent_auth;
pub mod openapi;
pub mod presets;
pub mod routes;
pub mod services;
pub mod state;
pub mod static_assets;
pub mod time;

#[cfg(test)]
pub mod test_support;
