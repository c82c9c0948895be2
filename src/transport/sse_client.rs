//! Client side of an SSE transport, used by the `stdio-to-sse` bridge.
//!
//! Opens `GET <url>` with `Accept: text/event-stream`, waits for the server's
//! `endpoint` event, and from then on POSTs every outgoing message to that
//! URL. Incoming `message` events are parsed and queued for the caller.

use std::time::Duration;

use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Url;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::MessageSink;
use crate::error::{BridgeError, SendError};
use crate::message::Message;

/// A connected SSE session on a remote server.
pub struct SseClient {
    http: reqwest::Client,
    post_url: Url,
    /// Fired when the event stream ends, or on [`SseClient::close`].
    closed: CancellationToken,
}

impl SseClient {
    /// Connect to `url` and wait up to `timeout` for the endpoint handshake.
    ///
    /// Returns the client and a receiver of the messages the server pushes.
    pub async fn connect(
        url: &str,
        timeout: Duration,
        capacity: usize,
    ) -> Result<(Self, mpsc::Receiver<Message>), BridgeError> {
        let base = Url::parse(url).map_err(|e| BridgeError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let http = reqwest::Client::new();

        let response = http
            .get(base.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|source| BridgeError::Connect {
                url: url.to_string(),
                source,
            })?;
        if !response.status().is_success() {
            return Err(BridgeError::Status {
                url: url.to_string(),
                status: response.status(),
            });
        }

        let closed = CancellationToken::new();
        let (incoming_tx, incoming_rx) = mpsc::channel(capacity.max(1));
        let (endpoint_tx, endpoint_rx) = oneshot::channel();

        let events = response.bytes_stream().eventsource();
        tokio::spawn(read_events(
            events,
            base,
            endpoint_tx,
            incoming_tx,
            closed.clone(),
        ));

        let post_url = match tokio::time::timeout(timeout, endpoint_rx).await {
            Ok(Ok(post_url)) => post_url,
            Ok(Err(_)) => {
                closed.cancel();
                return Err(BridgeError::NoEndpoint(url.to_string()));
            }
            Err(_) => {
                closed.cancel();
                return Err(BridgeError::Timeout(url.to_string()));
            }
        };
        debug!(%post_url, "sse endpoint announced");

        Ok((
            Self {
                http,
                post_url,
                closed,
            },
            incoming_rx,
        ))
    }

    /// Where outgoing messages are POSTed.
    #[must_use]
    pub fn post_url(&self) -> &Url {
        &self.post_url
    }

    /// Stop reading the event stream. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }
}

impl Drop for SseClient {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

impl MessageSink for SseClient {
    async fn send(&self, message: Message) -> Result<(), SendError> {
        if self.closed.is_cancelled() {
            return Err(SendError::Closed);
        }
        let response = self
            .http
            .post(self.post_url.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(message.as_str().to_owned())
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(SendError::Rejected { status, body })
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

/// Pump the event stream until it ends or `closed` fires.
///
/// The first `endpoint` event resolves the POST URL; `message` events go to
/// `incoming`. Dropping `incoming` on exit ends the caller's receiver.
async fn read_events<S, E>(
    events: S,
    base: Url,
    endpoint_tx: oneshot::Sender<Url>,
    incoming: mpsc::Sender<Message>,
    closed: CancellationToken,
) where
    S: futures::Stream<Item = Result<eventsource_stream::Event, E>> + Send + 'static,
    E: std::fmt::Display + Send,
{
    let mut events = std::pin::pin!(events);
    let mut endpoint_tx = Some(endpoint_tx);
    loop {
        let event = tokio::select! {
            biased;
            () = closed.cancelled() => break,
            event = events.next() => event,
        };
        let event = match event {
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                warn!(error = %e, "sse stream error");
                break;
            }
            None => {
                debug!("sse stream ended");
                break;
            }
        };

        match event.event.as_str() {
            "endpoint" => {
                let Some(tx) = endpoint_tx.take() else {
                    debug!(data = %event.data, "ignoring repeated endpoint event");
                    continue;
                };
                match resolve_endpoint(&base, &event.data) {
                    Ok(url) => {
                        let _ = tx.send(url);
                    }
                    Err(reason) => {
                        warn!(data = %event.data, %reason, "unusable endpoint event");
                        break;
                    }
                }
            }
            "" | "message" => match Message::from_json(&event.data) {
                Ok(message) => {
                    let sent = tokio::select! {
                        biased;
                        () = closed.cancelled() => break,
                        sent = incoming.send(message) => sent,
                    };
                    if sent.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "dropping non-JSON sse message"),
            },
            other => debug!(event = other, "ignoring sse event"),
        }
    }
    closed.cancel();
}

/// Resolve an announced endpoint against the stream URL. The result must
/// share the stream's origin.
fn resolve_endpoint(base: &Url, announced: &str) -> Result<Url, String> {
    let url = base.join(announced.trim()).map_err(|e| e.to_string())?;
    if url.origin() != base.origin() {
        return Err(format!(
            "endpoint origin {} does not match {}",
            url.origin().ascii_serialization(),
            base.origin().ascii_serialization()
        ));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use axum::body::Bytes;
    use axum::extract::State;
    use axum::response::sse::{Event, Sse};
    use axum::routing::{get, post};
    use axum::Router;
    use futures::stream;

    use super::*;

    #[test]
    fn relative_endpoint_resolves_against_base() {
        let base = Url::parse("http://127.0.0.1:9000/sse").unwrap();
        let url = resolve_endpoint(&base, "/messages?sessionId=abc").unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:9000/messages?sessionId=abc");
    }

    #[test]
    fn foreign_endpoint_is_rejected() {
        let base = Url::parse("http://127.0.0.1:9000/sse").unwrap();
        assert!(resolve_endpoint(&base, "http://evil.example/messages").is_err());
    }

    #[tokio::test]
    async fn invalid_url_is_reported() {
        let err = SseClient::connect("not a url", Duration::from_secs(1), 4)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BridgeError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn unreachable_server_is_a_connect_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let url = format!("http://127.0.0.1:{port}/sse");
        let err = SseClient::connect(&url, Duration::from_secs(1), 4)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BridgeError::Connect { .. }));
    }

    /// A server that announces `/post`, pushes one message, and records the
    /// bodies POSTed back to it.
    async fn fake_server() -> (String, mpsc::Receiver<Bytes>) {
        let (posted_tx, posted_rx) = mpsc::channel::<Bytes>(8);
        let app = Router::new()
            .route(
                "/sse",
                get(|| async {
                    let frames = stream::iter(vec![
                        Ok::<_, Infallible>(
                            Event::default().event("endpoint").data("/post?sessionId=x"),
                        ),
                        Ok(Event::default().event("message").data(r#"{"id":7}"#)),
                    ])
                    .chain(stream::pending());
                    Sse::new(frames)
                }),
            )
            .route(
                "/post",
                post(|State(tx): State<mpsc::Sender<Bytes>>, body: Bytes| async move {
                    let _ = tx.send(body).await;
                    (axum::http::StatusCode::ACCEPTED, "Accepted")
                }),
            )
            .with_state(posted_tx);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{addr}/sse"), posted_rx)
    }

    #[tokio::test]
    async fn handshake_receive_and_post() {
        let (url, mut posted) = fake_server().await;
        let (client, mut incoming) = SseClient::connect(&url, Duration::from_secs(5), 4)
            .await
            .unwrap();

        assert!(client.post_url().as_str().ends_with("/post?sessionId=x"));
        let pushed = incoming.recv().await.unwrap();
        assert_eq!(pushed.as_str(), r#"{"id":7}"#);

        client
            .send(Message::from_json(r#"{"method":"ping"}"#).unwrap())
            .await
            .unwrap();
        assert_eq!(posted.recv().await.unwrap(), Bytes::from(r#"{"method":"ping"}"#));

        client.close();
        assert!(matches!(
            client.send(Message::from_json("{}").unwrap()).await,
            Err(SendError::Closed)
        ));
    }

    #[tokio::test]
    async fn missing_handshake_times_out() {
        let app = Router::new().route(
            "/sse",
            get(|| async { Sse::new(stream::pending::<Result<Event, Infallible>>()) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let err = SseClient::connect(&format!("http://{addr}/sse"), Duration::from_millis(200), 4)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BridgeError::Timeout(_)));
    }
}
