//! The raw channel between the two contexts.
//!
//! A [`Port`] is the minimal capability the protocol needs: post one
//! envelope (never blocks) and receive the next one in order. Two
//! implementations:
//! - **Port::pair**: in-process, both contexts in one runtime
//! - **Port::framed**: any AsyncRead/AsyncWrite pair, framed with [`JsonCodec`]

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use super::codec::{DEFAULT_MAX_FRAME_LENGTH, JsonCodec, framing};
use super::protocol::Envelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("channel closed")]
pub struct ChannelClosed;

/// Sending half of a port. Cheap to clone; every session holds one.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl Outbox {
    pub fn post(&self, envelope: Envelope) -> Result<(), ChannelClosed> {
        self.tx.send(envelope).map_err(|_| ChannelClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half of a port. Owned by the connector's dispatch loop.
#[derive(Debug)]
pub struct Inbox {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Inbox {
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }
}

#[derive(Debug)]
pub struct Port {
    outbox: Outbox,
    inbox: Inbox,
}

impl Port {
    /// Two connected ports: what one posts, the other receives.
    pub fn pair() -> (Port, Port) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Port {
                outbox: Outbox { tx: a_tx },
                inbox: Inbox { rx: b_rx },
            },
            Port {
                outbox: Outbox { tx: b_tx },
                inbox: Inbox { rx: a_rx },
            },
        )
    }

    /// Port over a byte stream. Spawns a reader and a writer task on the
    /// current runtime; both end when their side of the stream closes.
    pub fn framed<R, W>(reader: R, writer: W) -> Port
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_frames(
            FramedWrite::new(writer, JsonCodec::<Envelope>::new()),
            out_rx,
        ));
        tokio::spawn(read_frames(
            FramedRead::new(reader, framing(DEFAULT_MAX_FRAME_LENGTH)),
            in_tx,
        ));

        Port {
            outbox: Outbox { tx: out_tx },
            inbox: Inbox { rx: in_rx },
        }
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn into_parts(self) -> (Outbox, Inbox) {
        (self.outbox, self.inbox)
    }
}

async fn write_frames<W>(
    mut writer: FramedWrite<W, JsonCodec<Envelope>>,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(envelope) = rx.recv().await {
        if let Err(e) = writer.send(envelope).await {
            tracing::warn!(error = %e, "Failed to write frame");
            break;
        }
    }
    tracing::trace!("Frame writer exiting");
}

/// Frames are split here and decoded one by one: a decoder error inside
/// `FramedRead` would end the stream, a bad document must not.
async fn read_frames<R>(
    mut reader: FramedRead<R, LengthDelimitedCodec>,
    tx: mpsc::UnboundedSender<Envelope>,
) where
    R: AsyncRead + Unpin,
{
    while let Some(frame) = reader.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, "Channel read error");
                break;
            }
        };
        match serde_json::from_slice::<Envelope>(&frame) {
            Ok(envelope) => {
                if tx.send(envelope).is_err() {
                    break;
                }
            }
            Err(e) => tracing::warn!(error = %e, frame_len = frame.len(), "Dropping undecodable frame"),
        }
    }
    tracing::trace!("Frame reader exiting");
}
