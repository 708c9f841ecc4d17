// Probe server: accepts concurrent connections and answers each
// well-formed PROBE with an ACK carrying the same sequence number.
//
// One task per connection; the only state shared between connection
// tasks is the append-only event log. A failure on one connection
// never affects the accept loop or any other connection.

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use pingrig_protocol::{LineCodec, Message, MessageKind, ProtocolError};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tokio_util::codec::Framed;

use crate::event_log::{EventKind, EventLog};
use crate::shutdown;

pub struct ProbeServer {
    bind_addr: String,
    idle_timeout: Duration,
    run_for: Duration,
    log: Arc<EventLog>,
}

impl ProbeServer {
    pub fn new(bind_addr: String, log: Arc<EventLog>) -> Self {
        Self {
            bind_addr,
            idle_timeout: Duration::from_secs(10),
            run_for: Duration::from_secs(300),
            log,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_run_duration(mut self, run_for: Duration) -> Self {
        self.run_for = run_for;
        self
    }

    /// Bind the listen address and serve until the run duration
    /// elapses or a termination signal arrives. Bind failure is fatal
    /// and bubbles up to a non-zero exit.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_addr)
            .await
            .context(format!("Failed to bind {}", self.bind_addr))?;

        let local_addr = listener.local_addr().context("Failed to read bound address")?;
        log::info!("Server listening on {}", local_addr);

        // Readiness handshake: the supervisor reads this line from our
        // stdout. Nothing ever connects just to detect the open port.
        println!("READY {local_addr}");

        let mut shutdown_rx = shutdown::shutdown_channel();
        let deadline = time::Instant::now() + self.run_for;
        let mut conn_counter: u64 = 0;

        loop {
            tokio::select! {
                _ = time::sleep_until(deadline) => {
                    log::info!("Run duration elapsed, stopping server");
                    break;
                }

                _ = shutdown_rx.changed() => {
                    log::info!("Termination requested, stopping server");
                    break;
                }

                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            // Transient accept failures (ECONNABORTED
                            // and friends) affect no open connection;
                            // keep serving.
                            log::warn!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };
                    conn_counter += 1;
                    let conn_id = conn_counter;
                    log::info!("Accepted connection #{} from {}", conn_id, peer);

                    let idle_timeout = self.idle_timeout;
                    let log = self.log.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, conn_id, idle_timeout, log).await;
                        log::info!("Connection #{} closed", conn_id);
                    });
                }
            }
        }

        self.log.record(EventKind::Closed, None, "server stopped");
        Ok(())
    }
}

/// Per-connection protocol handler. Owns the connection exclusively;
/// every exit path records exactly one event and releases the socket.
async fn handle_connection(
    stream: TcpStream,
    conn_id: u64,
    idle_timeout: Duration,
    log: Arc<EventLog>,
) {
    let mut framed = Framed::new(stream, LineCodec::new());
    let mut last_sequence: Option<u64> = None;

    loop {
        match time::timeout(idle_timeout, framed.next()).await {
            // Idle timeout: drop the connection, no error to the peer.
            Err(_) => {
                log.record(
                    EventKind::Closed,
                    None,
                    &format!("conn={conn_id} idle timeout"),
                );
                break;
            }

            // Peer closed the stream.
            Ok(None) => {
                log.record(
                    EventKind::Closed,
                    None,
                    &format!("conn={conn_id} peer disconnected"),
                );
                break;
            }

            Ok(Some(Ok(msg))) => {
                if msg.kind != MessageKind::Probe {
                    log.record(
                        EventKind::Error,
                        Some(msg.sequence),
                        &format!("conn={conn_id} unexpected {} from client", msg.kind.as_str()),
                    );
                    break;
                }

                // Sequences must be strictly increasing within a
                // connection; anything else is a protocol violation.
                if let Some(last) = last_sequence {
                    if msg.sequence <= last {
                        log.record(
                            EventKind::Error,
                            Some(msg.sequence),
                            &format!("conn={conn_id} non-increasing sequence (last {last})"),
                        );
                        break;
                    }
                }
                last_sequence = Some(msg.sequence);

                let ack = Message::ack_for(&msg);
                if let Err(e) = framed.send(ack).await {
                    log.record(
                        EventKind::Closed,
                        Some(msg.sequence),
                        &format!("conn={conn_id} reply failed: {e}"),
                    );
                    break;
                }
                log.record(
                    EventKind::Acked,
                    Some(msg.sequence),
                    &format!("conn={conn_id}"),
                );
            }

            Ok(Some(Err(e))) => {
                let detail = match &e {
                    ProtocolError::Malformed { line } => {
                        format!("conn={conn_id} malformed message: {line:?}")
                    }
                    other => format!("conn={conn_id} {other}"),
                };
                log::warn!("Protocol error on connection #{}: {}", conn_id, e);
                log.record(EventKind::Error, None, &detail);
                break;
            }
        }
    }
}
