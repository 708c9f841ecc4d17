// In-process integration tests for the probe protocol: a real server
// task on a loopback socket, exercised by the client and by raw
// connections that misbehave on purpose.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;

use pingrig_launcher::client::ProbeClient;
use pingrig_launcher::config::RetryConfig;
use pingrig_launcher::event_log::EventLog;
use pingrig_launcher::server::ProbeServer;

async fn find_available_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    Ok(addr.port())
}

struct TestServer {
    port: u16,
    log_path: std::path::PathBuf,
    _log_dir: TempDir,
}

/// Start a server task and wait until it accepts connections.
async fn start_server(idle_timeout: Duration) -> Result<TestServer> {
    let _ = env_logger::builder().is_test(true).try_init();

    let log_dir = TempDir::new()?;
    let log_path = log_dir.path().join("server.log");
    let port = find_available_port().await?;

    let event_log = Arc::new(EventLog::create(&log_path)?);
    let server = ProbeServer::new(format!("127.0.0.1:{port}"), event_log)
        .with_idle_timeout(idle_timeout)
        .with_run_duration(Duration::from_secs(30));

    tokio::spawn(async move {
        if let Err(e) = server.run().await {
            log::error!("Server failed: {e:#}");
        }
    });

    let mut attempts = 0;
    loop {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            break;
        }
        attempts += 1;
        if attempts > 50 {
            anyhow::bail!("Server did not start in time");
        }
        sleep(Duration::from_millis(100)).await;
    }

    Ok(TestServer {
        port,
        log_path,
        _log_dir: log_dir,
    })
}

async fn read_until_eof(stream: &mut TcpStream) -> Result<String> {
    let mut buf = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf)).await??;
    Ok(String::from_utf8_lossy(&buf).to_string())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_client_probes_are_acked() -> Result<()> {
    let server = start_server(Duration::from_secs(5)).await?;

    let client_dir = TempDir::new()?;
    let client_log_path = client_dir.path().join("client_1.log");
    let client_log = Arc::new(EventLog::create(&client_log_path)?);

    let client = ProbeClient::new(1, format!("127.0.0.1:{}", server.port), client_log)
        .with_interval(Duration::from_millis(100))
        .with_response_timeout(Duration::from_secs(1))
        .with_run_duration(Duration::from_millis(650));
    client.run().await?;

    let contents = std::fs::read_to_string(&client_log_path)?;
    let sent: Vec<&str> = contents.lines().filter(|l| l.contains(";sent;")).collect();
    let acked: Vec<&str> = contents.lines().filter(|l| l.contains(";acked;")).collect();

    assert!(sent.len() >= 2, "expected at least 2 probes, log:\n{contents}");
    assert!(acked.len() >= 2, "expected at least 2 acks, log:\n{contents}");

    // Sequences start at 0 and increase; every ack carries a latency
    // bounded by the response timeout.
    assert!(sent[0].contains(";sent;0;"));
    for (i, line) in sent.iter().enumerate() {
        assert!(line.contains(&format!(";sent;{i};")), "bad sequence: {line}");
    }
    for line in &acked {
        let detail = line.rsplit(';').next().unwrap();
        let latency_ms: u64 = detail
            .strip_prefix("latency_ms=")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| panic!("missing latency in {line:?}"));
        assert!(latency_ms <= 1000, "latency above response timeout: {line}");
    }

    // The server recorded the same acks.
    let server_contents = std::fs::read_to_string(&server.log_path)?;
    assert!(server_contents.contains(";acked;0;"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_idle_connection_is_closed() -> Result<()> {
    let server = start_server(Duration::from_millis(200)).await?;

    let mut stream = TcpStream::connect(("127.0.0.1", server.port)).await?;
    sleep(Duration::from_millis(600)).await;

    // The server should have dropped us without sending anything.
    let leftover = read_until_eof(&mut stream).await?;
    assert!(leftover.is_empty(), "unexpected data: {leftover:?}");

    let contents = std::fs::read_to_string(&server.log_path)?;
    assert!(
        contents.contains("idle timeout"),
        "no idle-timeout entry, log:\n{contents}"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_malformed_message_closes_only_offender() -> Result<()> {
    let server = start_server(Duration::from_secs(5)).await?;

    // Healthy connection, first probe round-trips.
    let mut healthy = TcpStream::connect(("127.0.0.1", server.port)).await?;
    healthy.write_all(b"PROBE 0 1000\n").await?;
    let mut buf = [0u8; 128];
    let n = tokio::time::timeout(Duration::from_secs(2), healthy.read(&mut buf)).await??;
    let reply = String::from_utf8_lossy(&buf[..n]).to_string();
    assert!(reply.starts_with("ACK 0 "), "unexpected reply: {reply:?}");

    // Offending connection gets closed without a reply.
    let mut offender = TcpStream::connect(("127.0.0.1", server.port)).await?;
    offender.write_all(b"THIS IS GARBAGE\n").await?;
    let leftover = read_until_eof(&mut offender).await?;
    assert!(leftover.is_empty(), "unexpected data: {leftover:?}");

    // The healthy connection keeps working.
    healthy.write_all(b"PROBE 1 2000\n").await?;
    let n = tokio::time::timeout(Duration::from_secs(2), healthy.read(&mut buf)).await??;
    let reply = String::from_utf8_lossy(&buf[..n]).to_string();
    assert!(reply.starts_with("ACK 1 "), "unexpected reply: {reply:?}");

    // The raw offending content is logged.
    let contents = std::fs::read_to_string(&server.log_path)?;
    assert!(
        contents.lines().any(|l| l.contains(";error;") && l.contains("GARBAGE")),
        "no error entry with raw content, log:\n{contents}"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_accept_loop_survives_connection_churn() -> Result<()> {
    let server = start_server(Duration::from_secs(5)).await?;

    // A burst of connections reset abruptly (SO_LINGER 0 turns the
    // close into a RST). None of this may take down the accept loop.
    for _ in 0..20 {
        let stream = TcpStream::connect(("127.0.0.1", server.port)).await?;
        stream.set_linger(Some(Duration::ZERO))?;
        drop(stream);
    }

    let mut healthy = TcpStream::connect(("127.0.0.1", server.port)).await?;
    healthy.write_all(b"PROBE 0 1000\n").await?;
    let mut buf = [0u8; 128];
    let n = tokio::time::timeout(Duration::from_secs(2), healthy.read(&mut buf)).await??;
    let reply = String::from_utf8_lossy(&buf[..n]).to_string();
    assert!(reply.starts_with("ACK 0 "), "unexpected reply: {reply:?}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_non_increasing_sequence_is_rejected() -> Result<()> {
    let server = start_server(Duration::from_secs(5)).await?;

    let mut stream = TcpStream::connect(("127.0.0.1", server.port)).await?;
    stream.write_all(b"PROBE 5 1000\n").await?;
    let mut buf = [0u8; 128];
    let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf)).await??;
    assert!(String::from_utf8_lossy(&buf[..n]).starts_with("ACK 5 "));

    // Replaying the same sequence number violates the protocol.
    stream.write_all(b"PROBE 5 2000\n").await?;
    let leftover = read_until_eof(&mut stream).await?;
    assert!(leftover.is_empty(), "unexpected data: {leftover:?}");

    let contents = std::fs::read_to_string(&server.log_path)?;
    assert!(
        contents.contains("non-increasing sequence"),
        "missing sequence violation entry, log:\n{contents}"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_client_gives_up_after_bounded_retries() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();

    // Nothing is listening on this port.
    let port = find_available_port().await?;

    let client_dir = TempDir::new()?;
    let client_log_path = client_dir.path().join("client_1.log");
    let client_log = Arc::new(EventLog::create(&client_log_path)?);

    let retry = RetryConfig {
        max_attempts: 3,
        initial_backoff_ms: 50,
        max_backoff_ms: 100,
    };
    let client = ProbeClient::new(1, format!("127.0.0.1:{port}"), client_log)
        .with_retry(retry)
        .with_run_duration(Duration::from_secs(10));

    let err = client.run().await.expect_err("client should give up");
    assert!(err.to_string().contains("after 3 attempts"), "got: {err:#}");

    let contents = std::fs::read_to_string(&client_log_path)?;
    let errors = contents.lines().filter(|l| l.contains(";error;")).count();
    assert_eq!(errors, 3, "one error entry per attempt, log:\n{contents}");
    assert!(contents.contains("retries exhausted"));
    Ok(())
}
