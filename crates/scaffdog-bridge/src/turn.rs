//! Nested request/response turns within one session.
//!
//! Both directions reuse the operation's method name. The payload's `kind`
//! tells a final answer (`main`) from a prompt sub-turn (`prompt`):
//!
//! ```text
//! host                                   worker
//!  | -- M {kind: main, ...request} -------> |
//!  | <------- M {kind: prompt, question} -- |   zero or more times
//!  | -- M {kind: prompt, cancel, value} --> |
//!  | <------- M {kind: main, ...result} --- |
//! ```
//!
//! Each side alternates strictly. A second envelope before the answer to
//! the first is a double registration on the sender and a missing waiter
//! on the receiver.

use std::future::Future;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bridge::protocol::{Method, WireError};
use crate::error::{BridgeError, ProtocolError};
use crate::session::Session;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Turn<M, P> {
    Main(M),
    Prompt(P),
}

/// Host's answer to a prompt sub-turn, as it travels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptReply<A> {
    pub cancel: bool,
    pub value: Option<A>,
}

impl<A> PromptReply<A> {
    pub fn answer(value: A) -> Self {
        Self {
            cancel: false,
            value: Some(value),
        }
    }

    pub fn cancel() -> Self {
        Self {
            cancel: true,
            value: None,
        }
    }

    fn into_answer(self, method: &Method) -> Result<Answer<A>, BridgeError> {
        match (self.cancel, self.value) {
            (true, _) => Ok(Answer::Cancel),
            (false, Some(value)) => Ok(Answer::Value(value)),
            (false, None) => Err(BridgeError::validation(
                method,
                serde::de::Error::custom("prompt reply without a value"),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer<A> {
    Value(A),
    Cancel,
}

impl<A> From<Answer<A>> for PromptReply<A> {
    fn from(answer: Answer<A>) -> Self {
        match answer {
            Answer::Value(value) => Self::answer(value),
            Answer::Cancel => Self::cancel(),
        }
    }
}

/// Plain request/response: send, await the reply, decode it.
pub async fn request<Req, Res>(
    session: &Session,
    method: &Method,
    request: &Req,
) -> Result<Res, BridgeError>
where
    Req: Serialize,
    Res: DeserializeOwned,
{
    session.send_json(method, request)?;
    session.receive(method).await?.parse(method)
}

/// Host side of a turn. `respond` is called once per prompt, in order.
///
/// A cancelled answer is sent to the worker and the exchange ends with
/// [`BridgeError::Cancelled`]; the caller is expected to close the session.
pub async fn converse<Req, Res, Q, A, F, Fut>(
    session: &Session,
    method: &Method,
    request: &Req,
    mut respond: F,
) -> Result<Res, BridgeError>
where
    Req: Serialize,
    Res: DeserializeOwned,
    Q: DeserializeOwned,
    A: Serialize,
    F: FnMut(Q) -> Fut,
    Fut: Future<Output = Result<Answer<A>, BridgeError>>,
{
    session.send_json(method, &Turn::<&Req, ()>::Main(request))?;

    loop {
        let turn: Turn<Res, Q> = session.receive(method).await?.parse(method)?;
        let question = match turn {
            Turn::Main(result) => return Ok(result),
            Turn::Prompt(question) => question,
        };

        let answer = respond(question).await?;
        let cancelled = matches!(answer, Answer::Cancel);
        session.send_json(method, &Turn::<(), _>::Prompt(PromptReply::from(answer)))?;
        if cancelled {
            tracing::info!(session = %session.id(), %method, "Prompt cancelled");
            return Err(BridgeError::Cancelled);
        }
    }
}

/// Worker side of a turn.
#[derive(Debug, Clone)]
pub struct Prompter {
    session: Session,
    method: Method,
}

impl Prompter {
    pub fn new(session: Session, method: Method) -> Self {
        Self { session, method }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Send one prompt and wait for the host's reply.
    pub async fn ask<Q, A>(&self, question: &Q) -> Result<Answer<A>, BridgeError>
    where
        Q: Serialize,
        A: DeserializeOwned,
    {
        self.session
            .send_json(&self.method, &Turn::<(), &Q>::Prompt(question))?;
        let turn: Turn<Value, PromptReply<A>> = self
            .session
            .receive(&self.method)
            .await?
            .parse(&self.method)?;
        match turn {
            Turn::Prompt(reply) => reply.into_answer(&self.method),
            Turn::Main(_) => Err(ProtocolError::UnexpectedTurn {
                session: self.session.id(),
                method: self.method.clone(),
            }
            .into()),
        }
    }

    /// Deliver the final answer.
    pub fn finish<R: Serialize>(&self, result: &R) -> Result<(), BridgeError> {
        self.session
            .send_json(&self.method, &Turn::<&R, ()>::Main(result))
    }

    pub fn fail(&self, error: WireError) -> Result<(), BridgeError> {
        self.session.send_error(&self.method, error)
    }
}
