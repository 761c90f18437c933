//! Proxy server module.
//!
//! # Module Structure
//!
//! - `server` - ProxyServer struct and main run loop
//! - `handler` - HTTP request/response conversion around the controller
//! - `controller` - Mode dispatch: replay, forward and record
//! - `forwarding` - Request forwarding to the upstream server
//! - `client` - HTTP client creation and configuration
//! - `headers` - Hop-by-hop filtering and reprise header names
//! - `network` - Network listener utilities

mod client;
mod controller;
mod forwarding;
mod handler;
pub mod headers;
mod network;
mod server;

pub use client::{create_http_client, HttpClient};
pub use controller::{Outcome, ProxyController};
pub use forwarding::{ForwardError, Forwarder, HttpForwarder};
pub use handler::{to_http, RequestHandler};
pub use network::create_listener;
pub use server::{BoundProxy, ProxyServer};
