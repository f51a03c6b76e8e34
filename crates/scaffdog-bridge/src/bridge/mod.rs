//! IPC bridge between the host and the worker.
//!
//! This module provides the wire protocol, the frame codec and the raw
//! channel abstraction the connectors run on.
//!
//! # Architecture
//!
//! - **protocol**: Envelope, Method, SessionId, WireError
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite
//! - **channel**: Port (post/receive capability), in-process or framed

pub mod channel;
pub mod codec;
pub mod protocol;

pub use channel::{ChannelClosed, Inbox, Outbox, Port};
pub use protocol::{Envelope, Method, Payload, SessionId, WireError};
