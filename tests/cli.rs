//! Tests that drive the built `mcp-proxy` binary.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;

use mcp_proxy::config::{ChildConfig, Config};
use mcp_proxy::server;

const WAIT: Duration = Duration::from_secs(10);

fn binary() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_mcp-proxy"));
    command
        .env_remove("RUST_LOG")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    command
}

#[tokio::test]
async fn bridge_exits_when_the_server_goes_away_with_stdin_open() {
    let mut config = Config::default();
    config.server.host = "127.0.0.1".into();
    config.server.port = 0;
    config.child = ChildConfig {
        command: "cat".into(),
        shutdown_grace_ms: 200,
        ..ChildConfig::default()
    };
    let bound = server::bind(config).await.unwrap();
    let url = format!("http://{}/sse", bound.local_addr());
    let (stop, stopped) = oneshot::channel::<()>();
    let serving = tokio::spawn(bound.serve(async move {
        let _ = stopped.await;
    }));

    let mut bridge = binary().args(["stdio-to-sse", &url]).spawn().unwrap();
    let mut stdin = bridge.stdin.take().unwrap();
    let mut stdout = BufReader::new(bridge.stdout.take().unwrap()).lines();

    stdin.write_all(b"{\"id\":1}\n").await.unwrap();
    stdin.flush().await.unwrap();
    let echoed = tokio::time::timeout(WAIT, stdout.next_line())
        .await
        .expect("no echo from the bridge")
        .unwrap();
    assert_eq!(echoed.as_deref(), Some(r#"{"id":1}"#));

    let _ = stop.send(());
    tokio::time::timeout(WAIT, serving).await.unwrap().unwrap().unwrap();

    // stdin is still held open here.
    let status = tokio::time::timeout(WAIT, bridge.wait())
        .await
        .expect("bridge kept running after the stream ended")
        .unwrap();
    assert!(status.success(), "{status}");
    drop(stdin);
}

#[tokio::test]
async fn no_subcommand_prints_help() {
    let output = tokio::time::timeout(WAIT, binary().stdin(Stdio::null()).output())
        .await
        .unwrap()
        .unwrap();
    assert!(output.status.success());
    let help = String::from_utf8(output.stdout).unwrap();
    assert!(help.contains("stdio-to-sse"), "{help}");
    assert!(help.contains("sse-to-stdio"), "{help}");
}
