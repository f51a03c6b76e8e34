//! Connectors - per-context session registries and handshake.
//!
//! Each connector owns one dispatch task reading the channel. Routing:
//! 1. `worker/open` (worker only): pop the oldest idle session, bind it,
//!    ack, resolve its open waiter
//! 2. `worker/close`: ack, unregister, dispose (no-op when unknown)
//! 3. `worker/ack`: resolve the waiter named by `ack`; a close ack also
//!    unregisters the session
//! 4. anything else: route to the active session, falling back to its
//!    wildcard waiter
//!
//! A dispatch failure is a desynchronization. It is logged at error level
//! and the affected session is torn down; other sessions keep running.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;

use crate::bridge::channel::{Inbox, Outbox, Port};
use crate::bridge::protocol::{Envelope, Method, Payload, SessionId, WireError};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, ProtocolError};
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Worker,
}

struct Registry {
    idle: VecDeque<Session>,
    active: HashMap<SessionId, Session>,
    closed: bool,
}

struct Shared {
    role: Role,
    registry: StdMutex<Registry>,
    outbox: Outbox,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!(role = ?self.role, "Registry mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.registry().closed
    }

    /// Drop `session` from the active registry if it is still the one
    /// registered under its id, then dispose it.
    fn forget(&self, session: &Session) {
        let id = session.id();
        let mut registry = self.registry();
        if registry.active.get(&id).is_some_and(|s| s.same(session)) {
            registry.active.remove(&id);
        }
        drop(registry);
        session.dispose();
    }

    fn dispose_all(&self) {
        let (idle, active) = {
            let mut registry = self.registry();
            registry.closed = true;
            (
                std::mem::take(&mut registry.idle),
                std::mem::take(&mut registry.active),
            )
        };
        if !active.is_empty() {
            tracing::debug!(role = ?self.role, sessions = active.len(), "Disposing active sessions");
        }
        for session in idle.into_iter().chain(active.into_values()) {
            session.dispose();
        }
    }

    fn dispatch(&self, envelope: Envelope) -> Result<(), ProtocolError> {
        let id = envelope.session;
        tracing::debug!(
            role = ?self.role,
            session = %id,
            method = %envelope.method,
            ack = ?envelope.ack,
            "Dispatching envelope"
        );

        if envelope.method == Method::OPEN {
            return self.dispatch_open(envelope);
        }
        if envelope.method == Method::CLOSE {
            let removed = self.registry().active.remove(&id);
            match removed {
                Some(session) => {
                    if let Err(e) = session.ack(&Method::CLOSE) {
                        tracing::warn!(session = %id, error = %e, "Failed to ack close");
                    }
                    session.dispose();
                }
                None => tracing::debug!(session = %id, "Close for unknown session ignored"),
            }
            return Ok(());
        }
        if envelope.method == Method::ACK {
            return self.dispatch_ack(envelope);
        }

        let session = self.registry().active.get(&id).cloned();
        match session {
            Some(session) => session.route(envelope),
            None => Err(ProtocolError::UnknownSession { session: id }),
        }
    }

    fn dispatch_open(&self, envelope: Envelope) -> Result<(), ProtocolError> {
        let id = envelope.session;
        if self.role == Role::Host {
            return Err(ProtocolError::UnexpectedOpen { session: id });
        }
        let session = {
            let mut registry = self.registry();
            let session = registry
                .idle
                .pop_front()
                .ok_or(ProtocolError::IdlePoolEmpty { session: id })?;
            session.bind(id);
            if let Some(previous) = registry.active.insert(id, session.clone()) {
                tracing::warn!(session = %id, "Open replaced a live session");
                previous.dispose();
            }
            session
        };
        if let Err(e) = session.ack(&Method::OPEN) {
            tracing::warn!(session = %id, error = %e, "Failed to ack open");
        }
        session.resolve(&Method::OPEN, envelope)
    }

    fn dispatch_ack(&self, envelope: Envelope) -> Result<(), ProtocolError> {
        let id = envelope.session;
        let acked = envelope
            .ack
            .clone()
            .ok_or(ProtocolError::MissingAckTag { session: id })?;

        let session = self.registry().active.get(&id).cloned();
        let Some(session) = session else {
            if acked == Method::OPEN {
                // The handshake timed out here; release the worker's side.
                tracing::debug!(session = %id, "Late open ack, closing orphaned session");
                if let Err(e) = self.outbox.post(Envelope::control(id, Method::CLOSE)) {
                    tracing::warn!(session = %id, error = %e, "Failed to close orphaned session");
                }
            } else {
                tracing::debug!(session = %id, ack = %acked, "Ack for unknown session ignored");
            }
            return Ok(());
        };

        session.resolve(&acked, envelope)?;
        if acked == Method::CLOSE {
            let mut registry = self.registry();
            if registry.active.get(&id).is_some_and(|s| s.same(&session)) {
                registry.active.remove(&id);
            }
        }
        Ok(())
    }

    /// Tear down whatever the failure is fatal for.
    fn fault(&self, error: ProtocolError) {
        tracing::error!(role = ?self.role, error = %error, "Protocol desynchronization");
        let wire = WireError::desync(error.to_string());

        if let ProtocolError::IdlePoolEmpty { session } = &error {
            // Report back instead of leaving the host to time out.
            let reply = Envelope {
                session: *session,
                method: Method::ACK,
                ack: Some(Method::OPEN),
                payload: Payload::Error(wire),
            };
            if let Err(e) = self.outbox.post(reply) {
                tracing::warn!(session = %session, error = %e, "Failed to report empty idle pool");
            }
            return;
        }

        let Some(id) = error.session() else {
            return;
        };
        let removed = self.registry().active.remove(&id);
        if let Some(session) = removed {
            session.abort(wire);
        }
    }
}

async fn run_dispatch(shared: Arc<Shared>, mut inbox: Inbox) {
    while let Some(envelope) = inbox.recv().await {
        if let Err(e) = shared.dispatch(envelope) {
            shared.fault(e);
        }
    }
    tracing::info!(role = ?shared.role, "Channel closed, disposing sessions");
    shared.dispose_all();
}

/// Registry plus the dispatch task. Shared by both connector variants.
struct ConnectorCore {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl ConnectorCore {
    fn spawn(port: Port, role: Role) -> Self {
        let (outbox, inbox) = port.into_parts();
        let shared = Arc::new(Shared {
            role,
            registry: StdMutex::new(Registry {
                idle: VecDeque::new(),
                active: HashMap::new(),
                closed: false,
            }),
            outbox,
        });
        let task = tokio::spawn(run_dispatch(Arc::clone(&shared), inbox));
        Self { shared, task }
    }

    fn dispose(&self) {
        self.task.abort();
        self.shared.dispose_all();
    }

    fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    fn active_count(&self) -> usize {
        self.shared.registry().active.len()
    }
}

impl Drop for ConnectorCore {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Host side: numbers sessions and opens them on demand.
pub struct HostConnector {
    core: ConnectorCore,
    next_id: AtomicU64,
    connect_timeout: Duration,
}

impl HostConnector {
    pub fn new(port: Port, config: &BridgeConfig) -> Self {
        Self {
            core: ConnectorCore::spawn(port, Role::Host),
            next_id: AtomicU64::new(0),
            connect_timeout: config.connect_timeout,
        }
    }

    pub async fn connect(&self) -> Result<Session, BridgeError> {
        self.connect_with_timeout(self.connect_timeout).await
    }

    /// Open a new session. The session is registered before `open` is
    /// posted; on timeout it is unregistered and disposed.
    pub async fn connect_with_timeout(&self, timeout: Duration) -> Result<Session, BridgeError> {
        let id = SessionId::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let shared = &self.core.shared;
        let session = Session::active(id, shared.outbox.clone());
        {
            let mut registry = shared.registry();
            if registry.closed {
                return Err(BridgeError::ChannelClosed);
            }
            registry.active.insert(id, session.clone());
        }

        tracing::debug!(session = %id, timeout_ms = timeout.as_millis() as u64, "Opening session");
        if let Err(e) =
            session.post_expecting(Envelope::control(id, Method::OPEN), &Method::OPEN)
        {
            shared.forget(&session);
            return Err(e);
        }

        match tokio::time::timeout(timeout, session.consume(&Method::OPEN)).await {
            Ok(Ok(envelope)) => match envelope.payload {
                Payload::Error(error) => {
                    shared.forget(&session);
                    if shared.is_closed() {
                        return Err(BridgeError::ChannelClosed);
                    }
                    Err(BridgeError::from_wire(error))
                }
                _ => {
                    tracing::debug!(session = %id, "Session opened");
                    Ok(session)
                }
            },
            Ok(Err(e)) => {
                shared.forget(&session);
                Err(e.into())
            }
            Err(_) => {
                tracing::warn!(session = %id, "Open handshake timed out");
                shared.forget(&session);
                Err(BridgeError::HandshakeTimeout {
                    session: id,
                    timeout,
                })
            }
        }
    }

    pub fn dispose(&self) {
        self.core.dispose();
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    pub fn active_sessions(&self) -> usize {
        self.core.active_count()
    }
}

/// Worker side: keeps unbound sessions ready for the host to claim.
pub struct WorkerConnector {
    core: ConnectorCore,
}

impl WorkerConnector {
    pub fn new(port: Port) -> Self {
        Self {
            core: ConnectorCore::spawn(port, Role::Worker),
        }
    }

    /// Queue an unbound session in the idle pool and wait for an `open`
    /// to claim it.
    ///
    /// The session joins the pool when this is called, not when the
    /// returned future is first polled, so the caller can arm several
    /// before awaiting any. Its open and wildcard waiters are armed up
    /// front: the first request may arrive before the accept loop resumes.
    pub fn wait(&self) -> BoxFuture<'static, Result<Session, BridgeError>> {
        let shared = Arc::clone(&self.core.shared);
        let session = Session::unbound(shared.outbox.clone());
        let armed = session
            .produce(&Method::OPEN)
            .and_then(|()| session.produce(&Method::ANY));
        if let Err(e) = armed {
            return futures::future::ready(Err(e.into())).boxed();
        }
        {
            let mut registry = shared.registry();
            if registry.closed {
                return futures::future::ready(Err(BridgeError::ChannelClosed)).boxed();
            }
            registry.idle.push_back(session.clone());
        }

        async move {
            let envelope = session.consume(&Method::OPEN).await?;
            match envelope.payload {
                Payload::Error(_) if shared.is_closed() => Err(BridgeError::ChannelClosed),
                Payload::Error(error) => Err(BridgeError::from_wire(error)),
                _ => {
                    tracing::debug!(session = %session.id(), "Session claimed");
                    Ok(session)
                }
            }
        }
        .boxed()
    }

    pub fn dispose(&self) {
        self.core.dispose();
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    pub fn idle_sessions(&self) -> usize {
        self.core.shared.registry().idle.len()
    }

    pub fn active_sessions(&self) -> usize {
        self.core.active_count()
    }
}
