//! Mcpgate - an SSE gateway for MCP stdio servers
//!
//! This library implements a protocol bridge that:
//! - Accepts long-lived streaming HTTP connections on an SSE endpoint
//! - Spawns one MCP stdio subprocess per connection (strictly 1:1)
//! - Forwards the request body to the subprocess as its first input line
//! - Relays every stdout line back to the client as one SSE event, in order
//! - Authenticates clients against a static multi-identity token registry
//! - Rate-limits requests per source with a sliding window
//! - Guarantees subprocess teardown (SIGTERM, grace period, SIGKILL) on
//!   every exit path, including client disconnects and internal errors

pub mod auth;
pub mod bridge;
pub mod config;
pub mod error;
pub mod limiter;
pub mod registry;
pub mod server;
pub mod supervisor;
