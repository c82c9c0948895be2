//! Endpoint abstractions and the forwarding pump shared by every relay path.
//!
//! Each relay direction is a [`MessageSource`] drained into a [`MessageSink`]
//! by [`forward`]. The session relay runs two pumps per session; the
//! single-session bridge runs the same two pumps once.
//!
//! - [`stdio`] — duplex channel over a child process (or our own stdio)
//! - [`sse`] — server side of a remote peer's SSE stream
//! - [`sse_client`] — client side of a remote SSE server (bridge mode)

pub mod sse;
pub mod sse_client;
pub mod stdio;

use std::fmt;
use std::future::Future;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::SendError;
use crate::message::Message;

/// Somewhere messages can be delivered to, in order.
pub trait MessageSink: Send + Sync {
    /// Deliver one message. Resolves once the message is queued or written.
    fn send(&self, message: Message) -> impl Future<Output = Result<(), SendError>> + Send;

    /// Resolves when the sink can no longer accept messages.
    fn closed(&self) -> impl Future<Output = ()> + Send;
}

/// Somewhere messages arrive from, in order. `None` means closed.
pub trait MessageSource: Send {
    fn recv(&mut self) -> impl Future<Output = Option<Message>> + Send;
}

impl MessageSource for mpsc::Receiver<Message> {
    async fn recv(&mut self) -> Option<Message> {
        mpsc::Receiver::recv(self).await
    }
}

/// A fan-out subscription ends when the subscriber lags: skipping messages
/// silently would break the lossless guarantee.
impl MessageSource for broadcast::Receiver<Message> {
    async fn recv(&mut self) -> Option<Message> {
        match broadcast::Receiver::recv(self).await {
            Ok(message) => Some(message),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Shared channel subscriber lagged by {missed} messages, closing");
                None
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

/// Which way a pump moves messages, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Remote peer to local child.
    Inbound,
    /// Local child to remote peer.
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        })
    }
}

/// Why a [`forward`] pump stopped.
#[derive(Debug)]
pub enum ForwardEnd {
    /// The owning session was closed.
    Cancelled,
    /// The source has no more messages.
    SourceClosed,
    /// The sink went away while idle.
    SinkClosed,
    /// Delivering a message failed.
    SinkFailed(SendError),
}

impl fmt::Display for ForwardEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => f.write_str("cancelled"),
            Self::SourceClosed => f.write_str("source closed"),
            Self::SinkClosed => f.write_str("sink closed"),
            Self::SinkFailed(e) => write!(f, "send failed: {e}"),
        }
    }
}

/// Move messages from `source` to `sink` one at a time until either side
/// closes, a send fails, or `cancel` fires.
///
/// Messages are never reordered or batched. A message already handed to the
/// sink when `cancel` fires is not recalled.
pub async fn forward<Src, Snk>(source: &mut Src, sink: &Snk, cancel: &CancellationToken) -> ForwardEnd
where
    Src: MessageSource,
    Snk: MessageSink,
{
    loop {
        let message = tokio::select! {
            biased;
            () = cancel.cancelled() => return ForwardEnd::Cancelled,
            () = sink.closed() => return ForwardEnd::SinkClosed,
            next = source.recv() => match next {
                Some(message) => message,
                None => return ForwardEnd::SourceClosed,
            },
        };
        tokio::select! {
            biased;
            () = cancel.cancelled() => return ForwardEnd::Cancelled,
            sent = sink.send(message) => {
                if let Err(e) = sent {
                    return ForwardEnd::SinkFailed(e);
                }
            }
        }
    }
}
