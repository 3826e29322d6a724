//! Streamable-HTTP session transport for MCP servers.
//!
//! Clients open a session with a POSTed `initialize`, keep talking to it with
//! the returned `mcp-session-id`, receive server pushes over an SSE GET, and
//! pick up missed pushes after a reconnect by sending `Last-Event-ID`.

pub mod config;
pub mod controller;
pub mod dispatch;
pub mod error;
pub mod event_store;
pub mod gate;
pub mod jsonrpc;
pub mod routes;
pub mod session;
pub mod state;
pub mod telemetry;

pub use config::{Cli, TransportConfig};
pub use controller::{CloseReason, PushFrame, PushSubscription, RpcReply, Session, SessionState};
pub use dispatch::{CallContext, DispatchError, Dispatcher, Notifier, ToolRegistry};
pub use error::{SessionIntent, TransportError};
pub use event_store::{EventId, EventStore, InMemoryEventStore, StreamId};
pub use gate::{GateConfig, SecurityGate};
pub use routes::build_router;
pub use session::{SessionConfig, SessionId, SessionTable};
pub use state::AppState;
