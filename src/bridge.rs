//! `stdio-to-sse`: bridge this process's stdin/stdout to one remote SSE
//! session.
//!
//! Lines read from stdin are POSTed to the server's announced endpoint;
//! `message` events from the server are written to stdout, one per line.
//! The bridge ends when either side closes or the shutdown future resolves.
//! Logs go to stderr so stdout carries protocol traffic only.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::transport::sse_client::SseClient;
use crate::transport::stdio::DuplexChannel;
use crate::transport::{forward, Direction, ForwardEnd, MessageSink, MessageSource};

/// Which event ended a [`splice`].
#[derive(Debug)]
pub enum BridgeEnd {
    /// The shutdown future resolved.
    Shutdown,
    /// A pump stopped on its own.
    Pump(Direction, ForwardEnd),
}

/// Connect to `url` and relay between it and stdio until either side closes.
///
/// Stdin lines longer than `max_line` bytes are dropped.
pub async fn run_bridge<F>(
    url: &str,
    config: &BridgeConfig,
    capacity: usize,
    max_line: usize,
    shutdown: F,
) -> Result<(), BridgeError>
where
    F: Future<Output = ()> + Send,
{
    let timeout = Duration::from_secs(config.connect_timeout_secs);
    let (client, mut remote) = SseClient::connect(url, timeout, capacity).await?;
    info!(url, post_url = %client.post_url(), "Connected to SSE server");

    let (local, mut stdin) = DuplexChannel::stdio(capacity, max_line);
    let end = splice(&mut stdin, &client, &mut remote, &local, shutdown).await;
    info!("Bridge stopped: {}", describe(&end));

    client.close();
    local.close().await;
    Ok(())
}

/// Run both relay directions between a local and a remote peer.
///
/// `local_in` feeds `remote_out` (outbound) and `remote_in` feeds
/// `local_out` (inbound). Returns once the first direction stops, after
/// which neither pump runs.
pub async fn splice<LI, RO, RI, LO, F>(
    local_in: &mut LI,
    remote_out: &RO,
    remote_in: &mut RI,
    local_out: &LO,
    shutdown: F,
) -> BridgeEnd
where
    LI: MessageSource,
    RO: MessageSink,
    RI: MessageSource,
    LO: MessageSink,
    F: Future<Output = ()>,
{
    let cancel = CancellationToken::new();
    let outbound = forward(local_in, remote_out, &cancel);
    let inbound = forward(remote_in, local_out, &cancel);
    tokio::pin!(outbound, inbound, shutdown);

    let end = tokio::select! {
        () = &mut shutdown => BridgeEnd::Shutdown,
        end = &mut outbound => BridgeEnd::Pump(Direction::Outbound, end),
        end = &mut inbound => BridgeEnd::Pump(Direction::Inbound, end),
    };
    cancel.cancel();

    if let BridgeEnd::Pump(direction, ForwardEnd::SinkFailed(e)) = &end {
        warn!(%direction, "Bridge send failed: {e}");
    }
    end
}

fn describe(end: &BridgeEnd) -> String {
    match end {
        BridgeEnd::Shutdown => "shutdown requested".to_string(),
        BridgeEnd::Pump(Direction::Outbound, ForwardEnd::SourceClosed) => "stdin closed".to_string(),
        BridgeEnd::Pump(Direction::Inbound, ForwardEnd::SourceClosed) => {
            "server closed the stream".to_string()
        }
        BridgeEnd::Pump(direction, end) => format!("{direction} {end}"),
    }
}
