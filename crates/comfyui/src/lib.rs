//! ComfyUI WebSocket and REST client library.
//!
//! Provides typed message parsing, WebSocket connection management,
//! HTTP API wrappers, reconnection logic, workflow template filling and
//! the [`backend::JobBackend`] trait the gateway drives jobs through.

pub mod api;
pub mod backend;
pub mod client;
pub mod messages;
pub mod reconnect;
pub mod workflow;
