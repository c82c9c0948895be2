#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]

//! # mcp-proxy
//!
//! Relays a message-oriented protocol between transports that cannot talk to
//! each other directly.
//!
//! ## Modes
//!
//! - `mcp-proxy sse-to-stdio <command...>` — serve a stdio child process to
//!   any number of remote peers over SSE + HTTP POST, one session per peer
//! - `mcp-proxy stdio-to-sse <url>` — bridge this process's stdio to a single
//!   remote SSE server
//!
//! ## API surface (`sse-to-stdio`)
//!
//! | Method | Path                          | Description                            |
//! |--------|-------------------------------|----------------------------------------|
//! | GET    | `/sse`                        | Open a session, stream child output    |
//! | POST   | `/messages?sessionId=<id>`    | Send one message to a session's child  |
//! | GET    | `/health`                     | Liveness check                         |
//!
//! Both relay paths are configurable (`server.sse_path`, `server.messages_path`).
//!
//! ## Architecture
//!
//! ```text
//! main.rs              — entry point, clap subcommands, tracing setup
//! config.rs            — TOML + env-var + CLI configuration
//! error.rs             — error types
//! message.rs           — opaque JSON message unit
//! port.rs              — preferred-port allocation with ephemeral fallback
//! transport/
//!   mod.rs             — MessageSource / MessageSink seams, forward() pump
//!   stdio.rs           — newline-delimited duplex channel (child or own stdio)
//!   sse.rs             — server side of a remote peer's SSE stream
//!   sse_client.rs      — client side of a remote SSE server
//! registry.rs          — SessionId -> Session map
//! relay.rs             — session creation, wiring, routing, teardown
//! routes/
//!   sse.rs             — GET <sse_path>
//!   messages.rs        — POST <messages_path>
//!   health.rs          — GET /health
//! server.rs            — listener, graceful shutdown, signals
//! bridge.rs            — stdio-to-sse single-session bridge
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod message;
pub mod port;
pub mod registry;
pub mod relay;
pub mod routes;
pub mod server;
pub mod state;
pub mod transport;

// Re-export key types at crate root for convenience.
pub use config::{Config, Isolation};
pub use error::ProxyError;
pub use message::Message;
pub use registry::{SessionId, SessionRegistry};
pub use relay::RelayController;
pub use state::AppState;
