//! carrot-gateway - HTTP and WebSocket surface for the carrot hub
//!
//! Upgrades connections on `/ws`, hands each one to the hub's connection
//! pumps, and serves a status endpoint plus an embedded home page.

pub mod auth;
pub mod home;
pub mod server;

pub use server::{GatewayConfig, GatewayServer, GatewayState};
