//! One logical conversation multiplexed over the channel.
//!
//! A session holds a mailbox with at most one waiter per method. A waiter
//! is a oneshot pair: the dispatch loop resolves the sending half, the
//! caller consumes the receiving half, and whichever happens second removes
//! the entry. Registering a second waiter for a method that still has one
//! is a [`ProtocolError::DoubleRegistration`].
//!
//! Sends always arm the expectation before the envelope is posted so a
//! fast reply cannot race past an unregistered waiter.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::bridge::channel::Outbox;
use crate::bridge::protocol::{Envelope, Method, Payload, SessionId, WireError};
use crate::error::{BridgeError, ProtocolError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Sitting in the worker's idle pool with a placeholder id.
    Unbound,
    Active,
    Disposed,
}

/// Result of a receive: the success body or the carried failure.
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    Success(Value),
    Failure(WireError),
}

impl Received {
    pub fn from_payload(payload: Payload) -> Self {
        match payload.into_result() {
            Ok(body) => Self::Success(body),
            Err(error) => Self::Failure(error),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    pub fn into_result(self) -> Result<Value, BridgeError> {
        match self {
            Self::Success(body) => Ok(body),
            Self::Failure(error) => Err(BridgeError::from_wire(error)),
        }
    }

    /// Decode the body as `T`. A shape mismatch is a validation failure
    /// local to this operation.
    pub fn parse<T: DeserializeOwned>(self, method: &Method) -> Result<T, BridgeError> {
        let body = self.into_result()?;
        serde_json::from_value(body).map_err(|e| BridgeError::validation(method, e))
    }
}

struct Waiter {
    tx: Option<oneshot::Sender<Envelope>>,
    rx: Option<oneshot::Receiver<Envelope>>,
}

impl Waiter {
    fn armed() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            tx: Some(tx),
            rx: Some(rx),
        }
    }
}

struct SessionCore {
    id: SessionId,
    state: SessionState,
    mailbox: HashMap<Method, Waiter>,
    /// Why the session was torn down, reported to late consumers.
    fault: Option<WireError>,
}

impl SessionCore {
    fn produce(&mut self, method: &Method) -> Result<(), ProtocolError> {
        match self.mailbox.entry(method.clone()) {
            Entry::Occupied(_) => Err(ProtocolError::DoubleRegistration {
                session: self.id,
                method: method.clone(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(Waiter::armed());
                Ok(())
            }
        }
    }

    /// Hands the envelope back when no waiter can take it.
    fn try_resolve(&mut self, method: &Method, envelope: Envelope) -> Result<(), Envelope> {
        let Some(waiter) = self.mailbox.get_mut(method) else {
            return Err(envelope);
        };
        let Some(tx) = waiter.tx.take() else {
            return Err(envelope);
        };
        if waiter.rx.is_none() {
            self.mailbox.remove(method);
        }
        if tx.send(envelope).is_err() {
            tracing::debug!(session = %self.id, %method, "Waiter dropped before delivery");
        }
        Ok(())
    }

    fn take_receiver(
        &mut self,
        method: &Method,
    ) -> Result<oneshot::Receiver<Envelope>, ProtocolError> {
        if !self.mailbox.contains_key(method) {
            self.produce(method)?;
        }
        let Some(waiter) = self.mailbox.get_mut(method) else {
            return Err(ProtocolError::MissingWaiter {
                session: self.id,
                method: method.clone(),
            });
        };
        let rx = waiter.rx.take().ok_or_else(|| ProtocolError::DuplicateConsumer {
            session: self.id,
            method: method.clone(),
        })?;
        if waiter.tx.is_none() {
            self.mailbox.remove(method);
        }
        Ok(rx)
    }

    /// Put back a receiver whose consumer went away before delivery.
    fn restore_receiver(&mut self, method: &Method, rx: oneshot::Receiver<Envelope>) {
        if self.state == SessionState::Disposed {
            return;
        }
        match self.mailbox.entry(method.clone()) {
            Entry::Occupied(mut slot) => {
                let waiter = slot.get_mut();
                if waiter.rx.is_none() {
                    waiter.rx = Some(rx);
                } else {
                    tracing::debug!(session = %self.id, %method, "Dropping stale receiver");
                }
            }
            // Already resolved: keep the delivered envelope for the next consumer.
            Entry::Vacant(slot) => {
                slot.insert(Waiter { tx: None, rx: Some(rx) });
            }
        }
    }

    fn dispose(&mut self) {
        self.state = SessionState::Disposed;
        self.mailbox.clear();
    }

    fn lost(&self, method: &Method) -> Envelope {
        let error = self.fault.clone().unwrap_or_else(|| {
            WireError::desync(format!(
                "{} was disposed while awaiting `{}`",
                self.id, method
            ))
        });
        Envelope::failure(self.id, method.clone(), error)
    }
}

/// A receiver taken out of the mailbox. Dropping it before delivery hands
/// the receiver back, so a cancelled `consume` leaves the slot usable.
struct PendingReceive<'a> {
    session: &'a Session,
    method: &'a Method,
    rx: Option<oneshot::Receiver<Envelope>>,
}

impl PendingReceive<'_> {
    async fn wait(&mut self) -> Option<Envelope> {
        let delivered = match self.rx.as_mut() {
            Some(rx) => rx.await.ok(),
            None => None,
        };
        self.rx = None;
        delivered
    }
}

impl Drop for PendingReceive<'_> {
    fn drop(&mut self) {
        if let Some(rx) = self.rx.take() {
            self.session.core().restore_receiver(self.method, rx);
        }
    }
}

struct SessionInner {
    core: StdMutex<SessionCore>,
    outbox: Outbox,
}

/// Handle to one session. Clones share the same mailbox.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core();
        f.debug_struct("Session")
            .field("id", &core.id)
            .field("state", &core.state)
            .field("pending", &core.mailbox.len())
            .finish()
    }
}

impl Session {
    pub(crate) fn active(id: SessionId, outbox: Outbox) -> Self {
        Self::with_state(id, SessionState::Active, outbox)
    }

    pub(crate) fn unbound(outbox: Outbox) -> Self {
        Self::with_state(SessionId::PLACEHOLDER, SessionState::Unbound, outbox)
    }

    fn with_state(id: SessionId, state: SessionState, outbox: Outbox) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                core: StdMutex::new(SessionCore {
                    id,
                    state,
                    mailbox: HashMap::new(),
                    fault: None,
                }),
                outbox,
            }),
        }
    }

    fn core(&self) -> MutexGuard<'_, SessionCore> {
        match self.inner.core.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Session mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn id(&self) -> SessionId {
        self.core().id
    }

    pub fn state(&self) -> SessionState {
        self.core().state
    }

    pub fn is_disposed(&self) -> bool {
        self.state() == SessionState::Disposed
    }

    pub(crate) fn same(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Claim an unbound session for `id`.
    pub(crate) fn bind(&self, id: SessionId) {
        let mut core = self.core();
        core.id = id;
        core.state = SessionState::Active;
    }

    /// Register an expectation for the next `method` envelope.
    pub fn produce(&self, method: &Method) -> Result<(), ProtocolError> {
        self.core().produce(method)
    }

    /// Wait for the next `method` envelope. Never fails on teardown: a
    /// disposed session yields a synthesized failure envelope instead.
    pub async fn consume(&self, method: &Method) -> Result<Envelope, ProtocolError> {
        let rx = {
            let mut core = self.core();
            if core.state == SessionState::Disposed {
                return Ok(core.lost(method));
            }
            core.take_receiver(method)?
        };
        let mut pending = PendingReceive {
            session: self,
            method,
            rx: Some(rx),
        };
        match pending.wait().await {
            Some(envelope) => Ok(envelope),
            None => Ok(self.core().lost(method)),
        }
    }

    /// Deliver to the waiter for `method`. A missing waiter is fatal.
    pub fn resolve(&self, method: &Method, envelope: Envelope) -> Result<(), ProtocolError> {
        let mut core = self.core();
        let session = core.id;
        core.try_resolve(method, envelope)
            .map_err(|_| ProtocolError::MissingWaiter {
                session,
                method: method.clone(),
            })
    }

    /// Deliver an application envelope, falling back to the wildcard
    /// waiter when nobody expects its method.
    pub(crate) fn route(&self, envelope: Envelope) -> Result<(), ProtocolError> {
        let method = envelope.method.clone();
        let mut core = self.core();
        let session = core.id;
        let Err(envelope) = core.try_resolve(&method, envelope) else {
            return Ok(());
        };
        tracing::trace!(%session, %method, "No waiter, trying wildcard");
        core.try_resolve(&Method::ANY, envelope)
            .map_err(|_| ProtocolError::MissingWaiter { session, method })
    }

    /// Post a zero-payload acknowledgement of `method`.
    pub fn ack(&self, method: &Method) -> Result<(), BridgeError> {
        let id = self.id();
        tracing::debug!(session = %id, ack = %method, "Posting ack");
        self.inner.outbox.post(Envelope::ack(id, method.clone()))?;
        Ok(())
    }

    /// Arm `expect`, then post. The waiter is withdrawn if posting fails.
    pub(crate) fn post_expecting(
        &self,
        envelope: Envelope,
        expect: &Method,
    ) -> Result<(), BridgeError> {
        {
            let mut core = self.core();
            if core.state != SessionState::Active {
                return Err(BridgeError::WrongState {
                    session: core.id,
                    state: core.state,
                });
            }
            core.produce(expect)?;
        }
        tracing::debug!(
            session = %envelope.session,
            method = %envelope.method,
            failure = envelope.payload.is_failure(),
            "Posting envelope"
        );
        if let Err(e) = self.inner.outbox.post(envelope) {
            self.core().mailbox.remove(expect);
            return Err(e.into());
        }
        Ok(())
    }

    fn send_payload(&self, method: &Method, payload: Payload) -> Result<(), BridgeError> {
        let envelope = Envelope::new(self.id(), method.clone(), payload);
        self.post_expecting(envelope, method)
    }

    /// Post `body` on `method` and expect the next `method` reply.
    pub fn send(&self, method: &Method, body: Value) -> Result<(), BridgeError> {
        self.send_payload(method, Payload::body(body))
    }

    pub fn send_error(&self, method: &Method, error: WireError) -> Result<(), BridgeError> {
        self.send_payload(method, Payload::Error(error))
    }

    pub fn send_json<T: Serialize>(&self, method: &Method, body: &T) -> Result<(), BridgeError> {
        let body = serde_json::to_value(body).map_err(|e| BridgeError::validation(method, e))?;
        self.send(method, body)
    }

    pub async fn receive(&self, method: &Method) -> Result<Received, BridgeError> {
        let envelope = self.consume(method).await?;
        tracing::debug!(session = %envelope.session, %method, "Received envelope");
        Ok(Received::from_payload(envelope.payload))
    }

    /// Next envelope nobody registered a specific expectation for.
    pub async fn receive_any(&self) -> Result<(Method, Received), BridgeError> {
        let envelope = self.consume(&Method::ANY).await?;
        tracing::debug!(session = %envelope.session, method = %envelope.method, "Received envelope");
        Ok((envelope.method, Received::from_payload(envelope.payload)))
    }

    /// Close handshake: post `close`, await its ack, dispose.
    ///
    /// Closing a disposed session is a no-op. The registry entry is removed
    /// by the connector when the ack arrives.
    pub async fn close(&self) -> Result<(), BridgeError> {
        match self.state() {
            SessionState::Disposed => return Ok(()),
            SessionState::Unbound => {
                self.dispose();
                return Ok(());
            }
            SessionState::Active => {}
        }

        let id = self.id();
        if let Err(e) = self.post_expecting(Envelope::control(id, Method::CLOSE), &Method::CLOSE) {
            self.dispose();
            return match e {
                BridgeError::ChannelClosed => Ok(()),
                other => Err(other),
            };
        }
        let reply = self.consume(&Method::CLOSE).await?;
        if let Payload::Error(error) = reply.payload {
            // Both sides closed at once; the peer's close disposed us first.
            tracing::debug!(session = %id, error = %error, "Close completed without ack");
        }
        self.dispose();
        Ok(())
    }

    /// Clear every waiter. Suspended consumers observe a desynchronization.
    pub fn dispose(&self) {
        let mut core = self.core();
        if core.state != SessionState::Disposed {
            tracing::trace!(session = %core.id, "Disposing session");
        }
        core.dispose();
    }

    /// Fail every outstanding waiter with `error`, then dispose.
    pub(crate) fn abort(&self, error: WireError) {
        let mut core = self.core();
        let id = core.id;
        for (method, waiter) in core.mailbox.iter_mut() {
            if let Some(tx) = waiter.tx.take() {
                let _ = tx.send(Envelope::failure(id, method.clone(), error.clone()));
            }
        }
        core.fault = Some(error);
        core.dispose();
    }
}
