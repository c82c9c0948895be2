//! Server side of a remote peer's Server-Sent Events stream.
//!
//! An [`SseEndpoint`] is the write handle for one open `GET /sse` response.
//! Frames are queued on a bounded channel; the route handler turns the
//! receiving half into the response body with [`frame_stream`]. When the
//! remote peer disconnects, axum drops the body, the receiver goes with it,
//! and [`MessageSink::closed`] resolves on the endpoint.

use futures::stream::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use axum::response::sse::Event;

use super::MessageSink;
use crate::error::SendError;
use crate::message::Message;
use crate::registry::SessionId;

/// One SSE event destined for the remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// Handshake announcing where to POST messages for this session.
    Endpoint(String),
    /// A relayed message.
    Message(Message),
}

impl SseFrame {
    /// SSE `event:` name.
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Endpoint(_) => "endpoint",
            Self::Message(_) => "message",
        }
    }

    /// SSE `data:` payload.
    #[must_use]
    pub fn data(&self) -> &str {
        match self {
            Self::Endpoint(url) => url,
            Self::Message(message) => message.as_str(),
        }
    }

    #[must_use]
    pub fn into_event(self) -> Event {
        Event::default().event(self.event_name()).data(self.data())
    }
}

/// Write handle for a remote peer's event stream.
pub struct SseEndpoint {
    session_id: SessionId,
    frames: mpsc::Sender<SseFrame>,
}

impl SseEndpoint {
    /// Create an endpoint and the receiver that feeds its HTTP response.
    pub fn new(session_id: SessionId, capacity: usize) -> (Self, mpsc::Receiver<SseFrame>) {
        let (frames, rx) = mpsc::channel(capacity);
        (Self { session_id, frames }, rx)
    }

    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Queue the `endpoint` handshake. Must precede every message frame.
    pub async fn announce(&self, post_url: String) -> Result<(), SendError> {
        self.frames
            .send(SseFrame::Endpoint(post_url))
            .await
            .map_err(|_| SendError::Closed)
    }

    /// Whether the remote peer has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.frames.is_closed()
    }
}

impl MessageSink for SseEndpoint {
    async fn send(&self, message: Message) -> Result<(), SendError> {
        self.frames
            .send(SseFrame::Message(message))
            .await
            .map_err(|_| SendError::Closed)
    }

    async fn closed(&self) {
        self.frames.closed().await;
    }
}

/// Turn queued frames into a stream that ends once `cancel` fires and every
/// frame queued before it has been yielded.
pub fn frame_stream(
    frames: mpsc::Receiver<SseFrame>,
    cancel: CancellationToken,
) -> impl Stream<Item = SseFrame> + Send + 'static {
    futures::stream::unfold((frames, cancel), |(mut frames, cancel)| async move {
        let frame = tokio::select! {
            biased;
            frame = frames.recv() => frame,
            () = cancel.cancelled() => frames.try_recv().ok(),
        };
        frame.map(|frame| (frame, (frames, cancel)))
    })
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    fn msg(text: &str) -> Message {
        Message::from_json(text).unwrap()
    }

    #[tokio::test]
    async fn handshake_precedes_messages() {
        let (endpoint, rx) = SseEndpoint::new(SessionId::from("s1"), 8);
        endpoint.announce("/messages?sessionId=s1".into()).await.unwrap();
        endpoint.send(msg(r#"{"id":1}"#)).await.unwrap();

        let cancel = CancellationToken::new();
        let mut stream = Box::pin(frame_stream(rx, cancel.clone()));
        let first = stream.next().await.unwrap();
        assert_eq!(first.event_name(), "endpoint");
        assert_eq!(first.data(), "/messages?sessionId=s1");
        assert_eq!(stream.next().await, Some(SseFrame::Message(msg(r#"{"id":1}"#))));
    }

    #[tokio::test]
    async fn cancel_drains_then_ends() {
        let (endpoint, rx) = SseEndpoint::new(SessionId::from("s2"), 8);
        endpoint.send(msg("1")).await.unwrap();
        endpoint.send(msg("2")).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let frames: Vec<SseFrame> = frame_stream(rx, cancel).collect().await;
        assert_eq!(
            frames,
            vec![SseFrame::Message(msg("1")), SseFrame::Message(msg("2"))]
        );
    }

    #[tokio::test]
    async fn dropping_the_stream_closes_the_endpoint() {
        let (endpoint, rx) = SseEndpoint::new(SessionId::from("s3"), 8);
        assert!(!endpoint.is_closed());
        drop(frame_stream(rx, CancellationToken::new()));
        MessageSink::closed(&endpoint).await;
        assert!(endpoint.is_closed());
        assert!(matches!(
            endpoint.send(msg("{}")).await,
            Err(SendError::Closed)
        ));
    }
}
