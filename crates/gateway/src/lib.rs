//! Gateway: authenticated HTTP + WebSocket server on a dedicated event-loop thread.
//!
//! Lifecycle:
//! 1. Load + validate config, resolve the static key pair
//! 2. `ServerManager::start` spawns the event-loop thread
//! 3. The backend binds, registers guarded routes and reports `Running`
//! 4. Streaming messages flow through the data observable into a `MessageSink`
//! 5. `stop` schedules the shutdown; connections are closed with "going away"
//!
//! The control thread only ever talks to the loop through queued commands.

pub mod manager;
pub mod observable;
pub mod registry;
pub mod routes;
pub mod runtime;
pub mod server;
pub mod ws;

pub use {
    manager::{EchoSink, MessageSink, ServerError, ServerManager},
    observable::Observable,
    registry::{
        BroadcastReport, ConnectionHandle, ConnectionRegistry, InboundMessage, TransportError,
    },
    routes::GuardedRouter,
    runtime::{LifecycleError, QueuedBroadcast, ServerBackend, ServerRuntime, ServerStatus},
    server::{ServerSettings, WebSocketServer},
    ws::MalformedPayload,
};
