//! Relay controller. Creates, wires, routes to and tears down sessions.
//!
//! ## Session creation
//!
//! [`RelayController::open_session`] mints an id, starts (or, in shared mode,
//! reuses) a duplex channel, registers the session, queues the `endpoint`
//! handshake and only then arms the two forwarding pumps. POSTs that arrive
//! between registration and arming wait in the session's inbound queue, and
//! the handshake is always the first frame on the stream.
//!
//! ## Forwarding
//!
//! Each session runs two independent [`forward`] pumps:
//!
//! - **inbound** — POSTed messages to the duplex channel
//! - **outbound** — duplex channel output to the SSE stream
//!
//! ## Teardown
//!
//! [`RelayController::close_session`] is idempotent: whoever removes the
//! registry entry first closes both endpoints, everyone else is a no-op. The
//! outbound pump triggers it when the child's output ends or the remote peer
//! disconnects. The inbound pump triggers it on a failed write; when the child
//! has merely exited it leaves teardown to the outbound pump so the child's
//! last messages are still delivered.
//!
//! [`RelayController::shutdown`] drains the registry and closes everything,
//! and refuses new sessions from then on.

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use futures::stream::Stream;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{ChildConfig, Isolation, ServerConfig};
use crate::error::{RouteError, SessionError};
use crate::message::Message;
use crate::registry::{Session, SessionId, SessionRegistry};
use crate::transport::sse::{frame_stream, SseEndpoint, SseFrame};
use crate::transport::stdio::DuplexChannel;
use crate::transport::{forward, Direction, ForwardEnd, MessageSource};

/// Attempts at drawing a session id that is not already registered.
const MAX_ID_ATTEMPTS: usize = 8;

/// Drives every session of one relay.
///
/// Clones share one set of sessions.
#[derive(Clone)]
pub struct RelayController {
    inner: Arc<Inner>,
}

struct Inner {
    child: ChildConfig,
    messages_path: String,
    capacity: usize,
    max_line: usize,
    registry: SessionRegistry,
    /// The single child of `Isolation::Shared` mode, spawned on demand.
    shared: Mutex<Option<SharedChild>>,
    shutting_down: CancellationToken,
    started: Instant,
}

struct SharedChild {
    channel: Arc<DuplexChannel>,
    fanout: broadcast::Sender<Message>,
}

/// Where a session's outbound pump reads child output from.
enum LocalFeed {
    /// The session's own child.
    Dedicated(mpsc::Receiver<Message>),
    /// A subscription to the shared child's output.
    Shared(broadcast::Receiver<Message>),
}

impl MessageSource for LocalFeed {
    async fn recv(&mut self) -> Option<Message> {
        match self {
            Self::Dedicated(rx) => MessageSource::recv(rx).await,
            Self::Shared(rx) => MessageSource::recv(rx).await,
        }
    }
}

/// A freshly opened session, handed to the `GET /sse` handler.
pub struct OpenedSession {
    pub id: SessionId,
    frames: mpsc::Receiver<SseFrame>,
    cancel: CancellationToken,
}

impl OpenedSession {
    /// Frames for the response body. Ends when the session is torn down.
    pub fn into_stream(self) -> impl Stream<Item = SseFrame> + Send + 'static {
        frame_stream(self.frames, self.cancel)
    }
}

impl RelayController {
    pub fn new(child: ChildConfig, server: &ServerConfig) -> Self {
        Self::with_registry(child, server, SessionRegistry::new())
    }

    /// Build a controller around an existing registry.
    pub fn with_registry(child: ChildConfig, server: &ServerConfig, registry: SessionRegistry) -> Self {
        Self {
            inner: Arc::new(Inner {
                child,
                messages_path: server.messages_path.clone(),
                capacity: server.channel_capacity.max(1),
                max_line: server.max_body_bytes.max(1),
                registry,
                shared: Mutex::new(None),
                shutting_down: CancellationToken::new(),
                started: Instant::now(),
            }),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    #[must_use]
    pub fn isolation(&self) -> Isolation {
        self.inner.child.isolation
    }

    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.inner.started.elapsed().as_secs()
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.is_cancelled()
    }

    pub async fn session_count(&self) -> usize {
        self.inner.registry.len().await
    }

    /// Open a session for a newly connected remote peer.
    ///
    /// On failure nothing is left in the registry and no child is left running.
    pub async fn open_session(&self) -> Result<OpenedSession, SessionError> {
        self.open_session_with(SessionId::generate).await
    }

    async fn open_session_with(
        &self,
        generate: impl FnMut() -> SessionId,
    ) -> Result<OpenedSession, SessionError> {
        if self.is_shutting_down() {
            return Err(SessionError::ShuttingDown);
        }
        let id = self.mint_id(generate).await?;
        let (channel, local) = self.acquire_channel(&id).await?;

        let capacity = self.inner.capacity;
        let (endpoint, frames) = SseEndpoint::new(id.clone(), capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let cancel = CancellationToken::new();
        let session = Arc::new(Session::new(
            endpoint,
            Arc::clone(&channel),
            inbound_tx,
            cancel.clone(),
        ));

        if let Err(e) = self.inner.registry.insert(Arc::clone(&session)).await {
            if self.isolation() == Isolation::PerSession {
                channel.close().await;
            }
            return Err(e);
        }
        // shutdown() may have drained the registry just before our insert.
        if self.is_shutting_down() {
            self.close_session(&id, "relay shutting down").await;
            return Err(SessionError::ShuttingDown);
        }

        let post_url = format!("{}?sessionId={id}", self.inner.messages_path);
        if let Err(e) = session.endpoint().announce(post_url).await {
            warn!(session = %id, "Failed to queue endpoint handshake: {e}");
        }
        self.arm(&session, inbound_rx, local);

        let total = self.session_count().await;
        info!(
            session = %id,
            pid = channel.pid().unwrap_or(0),
            "Session opened ({}), total: {total}",
            self.isolation()
        );
        Ok(OpenedSession { id, frames, cancel })
    }

    async fn mint_id(&self, mut generate: impl FnMut() -> SessionId) -> Result<SessionId, SessionError> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = generate();
            if !self.inner.registry.contains(id.as_str()).await {
                return Ok(id);
            }
            warn!(session = %id, "Session id collision, drawing another");
        }
        Err(SessionError::IdExhausted(MAX_ID_ATTEMPTS))
    }

    async fn acquire_channel(&self, id: &SessionId) -> Result<(Arc<DuplexChannel>, LocalFeed), SessionError> {
        let (capacity, max_line) = (self.inner.capacity, self.inner.max_line);
        match self.isolation() {
            Isolation::PerSession => {
                let (channel, incoming) = DuplexChannel::spawn(&self.inner.child, id.as_str(), capacity, max_line)?;
                Ok((Arc::new(channel), LocalFeed::Dedicated(incoming)))
            }
            Isolation::Shared => {
                let mut slot = self.inner.shared.lock().await;
                if let Some(shared) = slot.as_ref().filter(|s| !s.channel.is_closed()) {
                    return Ok((
                        Arc::clone(&shared.channel),
                        LocalFeed::Shared(shared.fanout.subscribe()),
                    ));
                }
                let (channel, incoming) = DuplexChannel::spawn(&self.inner.child, "shared", capacity, max_line)?;
                let channel = Arc::new(channel);
                let (fanout, feed) = broadcast::channel(capacity);
                tokio::spawn(self.clone().pump_shared(incoming, fanout.clone(), Arc::clone(&channel)));
                *slot = Some(SharedChild {
                    channel: Arc::clone(&channel),
                    fanout,
                });
                Ok((channel, LocalFeed::Shared(feed)))
            }
        }
    }

    /// Fan the shared child's output out to every subscribed session. When the
    /// output ends, retire the child so subscribers observe the close.
    async fn pump_shared(
        self,
        mut incoming: mpsc::Receiver<Message>,
        fanout: broadcast::Sender<Message>,
        channel: Arc<DuplexChannel>,
    ) {
        while let Some(message) = incoming.recv().await {
            if fanout.send(message).is_err() {
                debug!("Shared child output with no live sessions, dropped");
            }
        }
        info!("Shared child output ended");
        let mut slot = self.inner.shared.lock().await;
        if slot.as_ref().is_some_and(|s| Arc::ptr_eq(&s.channel, &channel)) {
            *slot = None;
        }
    }

    /// Close the shared child (if any). Every session subscribed to it will
    /// see its output end and tear itself down.
    async fn close_shared(&self) {
        let shared = self.inner.shared.lock().await.take();
        if let Some(shared) = shared {
            info!("Closing shared child");
            shared.channel.close().await;
        }
    }

    /// Close `channel`, retiring it from the shared slot if it is still the
    /// current shared child. A replacement spawned since is left alone.
    async fn close_shared_channel(&self, channel: &Arc<DuplexChannel>) {
        {
            let mut slot = self.inner.shared.lock().await;
            if slot.as_ref().is_some_and(|s| Arc::ptr_eq(&s.channel, channel)) {
                info!("Closing shared child");
                *slot = None;
            }
        }
        channel.close().await;
    }

    fn arm(&self, session: &Arc<Session>, mut inbound: mpsc::Receiver<Message>, mut local: LocalFeed) {
        let id = session.id().clone();

        let relay = self.clone();
        let s = Arc::clone(session);
        tokio::spawn(
            async move {
                let end = forward(&mut inbound, s.channel().as_ref(), s.cancel_token()).await;
                match end {
                    ForwardEnd::Cancelled => {}
                    ForwardEnd::SinkClosed => {
                        debug!("Duplex channel closed, waiting for its output to drain");
                    }
                    ForwardEnd::SinkFailed(ref e) => {
                        warn!("Forwarding failed: {e}");
                        relay.close_session(s.id(), "inbound forwarding failed").await;
                    }
                    ForwardEnd::SourceClosed => {
                        relay.close_session(s.id(), "inbound queue closed").await;
                    }
                }
            }
            .instrument(info_span!("relay", session = %id, direction = %Direction::Inbound)),
        );

        let relay = self.clone();
        let s = Arc::clone(session);
        tokio::spawn(
            async move {
                let end = forward(&mut local, s.endpoint(), s.cancel_token()).await;
                let reason = match end {
                    ForwardEnd::Cancelled => return,
                    ForwardEnd::SourceClosed => "duplex channel closed",
                    ForwardEnd::SinkClosed => "remote peer disconnected",
                    ForwardEnd::SinkFailed(ref e) => {
                        warn!("Forwarding failed: {e}");
                        "outbound forwarding failed"
                    }
                };
                relay.close_session(s.id(), reason).await;
            }
            .instrument(info_span!("relay", session = %id, direction = %Direction::Outbound)),
        );
    }

    /// Deliver a POSTed message to the session it names.
    ///
    /// Unknown and already torn-down sessions both yield
    /// [`RouteError::NotFound`]; nothing is ever inserted here.
    pub async fn route(&self, session_id: &str, message: Message) -> Result<(), RouteError> {
        let Some(session) = self.inner.registry.get(session_id).await else {
            debug!(session = %session_id, "POST for unknown session");
            return Err(RouteError::NotFound(SessionId::from(session_id)));
        };
        session.deliver(message).await
    }

    /// Tear a session down. Returns `false` if it was already gone.
    ///
    /// In shared mode this also closes the shared child, which ends every
    /// other session.
    pub async fn close_session(&self, session_id: &SessionId, reason: &str) -> bool {
        let Some(session) = self.inner.registry.remove(session_id.as_str()).await else {
            return false;
        };
        session.close_stream();
        match self.isolation() {
            Isolation::PerSession => session.channel().close().await,
            Isolation::Shared => self.close_shared_channel(session.channel()).await,
        }
        let remaining = self.session_count().await;
        info!(
            session = %session_id,
            "Session closed ({reason}) after {}s, remaining: {remaining}",
            session.age_secs()
        );
        true
    }

    /// Close every session and stop accepting new ones. Idempotent.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.cancel();
        let sessions = self.inner.registry.drain().await;
        let count = sessions.len();
        for session in &sessions {
            session.close_stream();
        }
        join_all(sessions.iter().map(|s| s.channel().close())).await;
        self.close_shared().await;
        if count > 0 {
            info!("Shut down {count} session(s)");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::time::Duration;

    use futures::StreamExt;

    use super::*;

    type Frames = Pin<Box<dyn Stream<Item = SseFrame> + Send>>;

    const WAIT: Duration = Duration::from_secs(5);

    fn relay_for(child: ChildConfig) -> RelayController {
        RelayController::new(child, &ServerConfig::default())
    }

    fn cat(isolation: Isolation) -> ChildConfig {
        ChildConfig {
            command: "cat".into(),
            isolation,
            shutdown_grace_ms: 500,
            ..ChildConfig::default()
        }
    }

    fn msg(text: &str) -> Message {
        Message::from_json(text).unwrap()
    }

    async fn open(relay: &RelayController) -> (SessionId, Frames) {
        let opened = relay.open_session().await.unwrap();
        let id = opened.id.clone();
        (id, Box::pin(opened.into_stream()))
    }

    async fn next(frames: &mut Frames) -> Option<SseFrame> {
        tokio::time::timeout(WAIT, frames.next()).await.unwrap()
    }

    async fn wait_until_empty(relay: &RelayController) {
        tokio::time::timeout(WAIT, async {
            while !relay.registry().is_empty().await {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn handshake_then_echo_round_trip() {
        let relay = relay_for(cat(Isolation::PerSession));
        let (id, mut frames) = open(&relay).await;

        assert_eq!(
            next(&mut frames).await,
            Some(SseFrame::Endpoint(format!("/messages?sessionId={id}")))
        );

        let ping = msg(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#);
        relay.route(id.as_str(), ping.clone()).await.unwrap();
        assert_eq!(next(&mut frames).await, Some(SseFrame::Message(ping)));

        assert!(relay.close_session(&id, "test").await);
        assert_eq!(next(&mut frames).await, None);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found_and_not_inserted() {
        let relay = relay_for(cat(Isolation::PerSession));
        let err = relay.route("nonexistent-id", msg("{}")).await.unwrap_err();
        assert_eq!(err, RouteError::NotFound(SessionId::from("nonexistent-id")));
        assert!(relay.registry().is_empty().await);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let relay = relay_for(cat(Isolation::PerSession));
        let (id, _frames) = open(&relay).await;
        let session = relay.registry().get(id.as_str()).await.unwrap();

        let (a, b) = tokio::join!(
            relay.close_session(&id, "first"),
            relay.close_session(&id, "second")
        );
        assert!(a ^ b);
        assert!(!relay.close_session(&id, "third").await);
        assert!(session.channel().is_closed());
        assert!(relay.registry().is_empty().await);
        assert!(relay.route(id.as_str(), msg("{}")).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn close_racing_in_flight_posts_leaves_no_session() {
        let relay = relay_for(cat(Isolation::PerSession));
        let (id, _frames) = open(&relay).await;

        let senders: Vec<_> = (0..4)
            .map(|n| {
                let relay = relay.clone();
                let id = id.clone();
                tokio::spawn(async move {
                    let mut outcomes = Vec::new();
                    for i in 0..50 {
                        let body = format!(r#"{{"sender":{n},"seq":{i}}}"#);
                        outcomes.push(relay.route(id.as_str(), msg(&body)).await);
                    }
                    outcomes
                })
            })
            .collect();
        tokio::task::yield_now().await;
        let closed = tokio::time::timeout(WAIT, relay.close_session(&id, "race"))
            .await
            .unwrap();
        assert!(closed);

        for sender in senders {
            let outcomes = tokio::time::timeout(WAIT, sender).await.unwrap().unwrap();
            for outcome in outcomes {
                assert!(
                    matches!(&outcome, Ok(()))
                        || matches!(&outcome, Err(RouteError::NotFound(gone)) if *gone == id),
                    "{outcome:?}"
                );
            }
        }
        assert!(!relay.registry().contains(id.as_str()).await);
        assert_eq!(relay.session_count().await, 0);
        assert_eq!(
            relay.route(id.as_str(), msg("{}")).await,
            Err(RouteError::NotFound(id.clone()))
        );
    }

    #[tokio::test]
    async fn remote_disconnect_tears_down_the_session() {
        let relay = relay_for(cat(Isolation::PerSession));
        let (id, frames) = open(&relay).await;
        let session = relay.registry().get(id.as_str()).await.unwrap();

        drop(frames);
        wait_until_empty(&relay).await;
        tokio::time::timeout(WAIT, session.channel().close()).await.unwrap();
    }

    #[tokio::test]
    async fn child_exit_delivers_last_output_then_ends_the_stream() {
        let relay = relay_for(ChildConfig {
            command: "sh".into(),
            args: vec!["-c".into(), "read line; echo \"$line\"".into()],
            ..ChildConfig::default()
        });
        let (id, mut frames) = open(&relay).await;
        assert!(matches!(next(&mut frames).await, Some(SseFrame::Endpoint(_))));

        relay.route(id.as_str(), msg(r#"{"id":7}"#)).await.unwrap();
        assert_eq!(next(&mut frames).await, Some(SseFrame::Message(msg(r#"{"id":7}"#))));
        assert_eq!(next(&mut frames).await, None);
        wait_until_empty(&relay).await;
    }

    #[tokio::test]
    async fn launch_failure_leaves_no_session() {
        let relay = relay_for(ChildConfig {
            command: "/nonexistent/mcp-server".into(),
            ..ChildConfig::default()
        });
        let err = relay.open_session().await.err().unwrap();
        assert!(matches!(err, SessionError::Launch(_)));
        assert!(relay.registry().is_empty().await);
    }

    #[tokio::test]
    async fn id_exhaustion_is_reported() {
        let relay = relay_for(cat(Isolation::PerSession));
        let (taken, _frames) = open(&relay).await;
        let err = relay
            .open_session_with(|| taken.clone())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::IdExhausted(MAX_ID_ATTEMPTS)));
        assert_eq!(relay.session_count().await, 1);
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let relay = relay_for(cat(Isolation::PerSession));
        let mut sessions = Vec::new();
        for _ in 0..4 {
            let (id, mut frames) = open(&relay).await;
            assert!(matches!(next(&mut frames).await, Some(SseFrame::Endpoint(_))));
            sessions.push((id, frames));
        }
        for (id, _) in &sessions {
            let tagged = msg(&format!(r#"{{"tag":"{id}"}}"#));
            relay.route(id.as_str(), tagged).await.unwrap();
        }
        for (id, frames) in &mut sessions {
            let expected = msg(&format!(r#"{{"tag":"{id}"}}"#));
            assert_eq!(next(frames).await, Some(SseFrame::Message(expected)));
        }

        relay.shutdown().await;
        for (_, frames) in &mut sessions {
            assert_eq!(next(frames).await, None);
        }
    }

    #[tokio::test]
    async fn shutdown_closes_every_session_and_refuses_new_ones() {
        let relay = relay_for(cat(Isolation::PerSession));
        let mut channels = Vec::new();
        let mut streams = Vec::new();
        for _ in 0..3 {
            let (id, frames) = open(&relay).await;
            channels.push(Arc::clone(
                relay.registry().get(id.as_str()).await.unwrap().channel(),
            ));
            streams.push(frames);
        }

        relay.shutdown().await;
        assert!(relay.registry().is_empty().await);
        assert!(channels.iter().all(|c| c.is_closed()));
        assert!(matches!(
            relay.open_session().await.err().unwrap(),
            SessionError::ShuttingDown
        ));
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn shared_mode_fans_out_and_closes_together() {
        let relay = relay_for(cat(Isolation::Shared));
        let (a, mut frames_a) = open(&relay).await;
        let (b, mut frames_b) = open(&relay).await;
        assert!(matches!(next(&mut frames_a).await, Some(SseFrame::Endpoint(_))));
        assert!(matches!(next(&mut frames_b).await, Some(SseFrame::Endpoint(_))));

        let pid_a = relay.registry().get(a.as_str()).await.unwrap().channel().pid();
        let pid_b = relay.registry().get(b.as_str()).await.unwrap().channel().pid();
        assert_eq!(pid_a, pid_b);

        let hello = msg(r#"{"id":"hello"}"#);
        relay.route(a.as_str(), hello.clone()).await.unwrap();
        assert_eq!(next(&mut frames_a).await, Some(SseFrame::Message(hello.clone())));
        assert_eq!(next(&mut frames_b).await, Some(SseFrame::Message(hello)));

        relay.close_session(&a, "test").await;
        assert_eq!(next(&mut frames_b).await, None);
        wait_until_empty(&relay).await;

        // The next session gets a fresh child.
        let (c, _frames_c) = open(&relay).await;
        let pid_c = relay.registry().get(c.as_str()).await.unwrap().channel().pid();
        assert_ne!(pid_c, pid_a);
        relay.shutdown().await;
    }
}
