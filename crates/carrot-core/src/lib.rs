//! carrot-core - Session-resumable broadcast hub
//!
//! This crate provides:
//! - Session store with sliding expiry and resumable tokens
//! - Broadcast hub actor that owns every session mutation
//! - Per-connection read and write pumps over any frame sink/stream
//! - Middleware pipeline fed by a single ordered ingress

pub mod client;
pub mod config;
pub mod error;
pub mod frame;
pub mod hub;
pub mod pipeline;
pub mod session;
pub mod stages;
pub mod streams;

// Re-export main types for convenience
pub use client::{Client, ClientQueues, Pressure, serve};
pub use config::HubConfig;
pub use error::{CarrotError, CarrotResult};
pub use frame::Frame;
pub use hub::{BroadcastReport, Hub, HubHandle};
pub use pipeline::{Flow, Middleware, MiddlewarePipeline, PipelineContext, Request};
pub use session::{DefaultSessionStore, Session, SessionStore, SessionToken};
pub use stages::{Broadcaster, DropEmpty};
pub use streams::StreamRegistry;
