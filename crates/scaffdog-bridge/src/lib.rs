//! scaffdog-bridge: session-multiplexed host/worker channel for scaffdog
//! generation.

pub mod bridge;
pub mod client;
pub mod config;
pub mod connector;
pub mod engine;
pub mod error;
pub mod logging;
pub mod messages;
pub mod module;
pub mod project;
pub mod prompt;
pub mod scaffold;
pub mod session;
pub mod turn;
mod version;
pub mod worker;

#[cfg(test)]
mod testing;

pub use bridge::{Envelope, Method, Payload, Port, SessionId, WireError};
pub use client::{ScaffdogClient, WorkerHandle, spawn_local_worker};
pub use config::{BridgeConfig, DEFAULT_CONNECT_TIMEOUT, ScaffdogConfig};
pub use connector::{HostConnector, Role, WorkerConnector};
pub use engine::{Engine, EngineLoader, InputProvider, Project};
pub use error::{BridgeError, EngineError, ProtocolError, ResolveError, ScaffoldError};
pub use logging::init_tracing;
pub use prompt::{PromptLibrary, PromptResult};
pub use scaffold::{ScaffoldOutcome, ScaffoldReport, Scaffolder};
pub use session::{Received, Session, SessionState};
pub use turn::{Answer, Prompter, Turn};
pub use version::{BRIDGE_VERSION, EngineVersion, MIN_ENGINE_VERSION, VersionParseError};
pub use worker::{WorkerService, run_stdio_worker, run_worker};
