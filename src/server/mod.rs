//! HTTP server and WebSocket push feed

pub mod http;
pub mod websocket;

pub use http::{run, AppState};
