// Probe client: sends a PROBE on a fixed interval, waits for the
// matching ACK, and records the round-trip outcome. Connection loss
// triggers bounded reconnection with exponential backoff; exhausting
// the retries terminates the process with failure.

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use pingrig_protocol::{LineCodec, Message, MessageKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time;
use tokio_util::codec::Framed;

use crate::config::RetryConfig;
use crate::event_log::{EventKind, EventLog};
use crate::shutdown;

/// Why a probe session over one connection ended.
enum SessionEnd {
    /// Run duration elapsed; the client is done.
    Finished,
    /// Termination signal; the client is done.
    Terminated,
    /// Timeout, mismatch, or socket failure; reconnect.
    ConnectionLost,
}

pub struct ProbeClient {
    id: u32,
    server_addr: String,
    interval: Duration,
    response_timeout: Duration,
    retry: RetryConfig,
    run_for: Duration,
    log: Arc<EventLog>,
}

impl ProbeClient {
    pub fn new(id: u32, server_addr: String, log: Arc<EventLog>) -> Self {
        Self {
            id,
            server_addr,
            interval: Duration::from_secs(1),
            response_timeout: Duration::from_secs(2),
            retry: RetryConfig::default(),
            run_for: Duration::from_secs(300),
            log,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_response_timeout(mut self, response_timeout: Duration) -> Self {
        self.response_timeout = response_timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_run_duration(mut self, run_for: Duration) -> Self {
        self.run_for = run_for;
        self
    }

    pub async fn run(&self) -> Result<()> {
        log::info!(
            "Client #{} starting, probing {} every {:?} for {:?}",
            self.id,
            self.server_addr,
            self.interval,
            self.run_for
        );

        let mut shutdown_rx = shutdown::shutdown_channel();
        let deadline = time::Instant::now() + self.run_for;

        loop {
            if time::Instant::now() >= deadline {
                self.log
                    .record(EventKind::Closed, None, "run duration elapsed");
                break;
            }

            let stream = tokio::select! {
                connected = self.connect_with_retry() => connected?,
                _ = shutdown_rx.changed() => {
                    self.log.record(EventKind::Closed, None, "terminated while connecting");
                    return Ok(());
                }
                _ = time::sleep_until(deadline) => {
                    self.log.record(EventKind::Closed, None, "run duration elapsed");
                    return Ok(());
                }
            };

            let framed = Framed::new(stream, LineCodec::new());
            match self.session(framed, deadline, &mut shutdown_rx).await {
                SessionEnd::Finished | SessionEnd::Terminated => break,
                SessionEnd::ConnectionLost => {
                    log::warn!("Client #{}: connection lost, reconnecting", self.id);
                }
            }
        }

        log::info!("Client #{} stopped", self.id);
        Ok(())
    }

    /// Connect with bounded retries and exponential backoff. Returns
    /// an error once the attempts are exhausted; the caller turns that
    /// into a failing process exit.
    async fn connect_with_retry(&self) -> Result<TcpStream> {
        let mut backoff = self.retry.initial_backoff();

        for attempt in 1..=self.retry.max_attempts {
            match TcpStream::connect(&self.server_addr).await {
                Ok(stream) => {
                    log::info!(
                        "Client #{} connected to {} (attempt {})",
                        self.id,
                        self.server_addr,
                        attempt
                    );
                    return Ok(stream);
                }
                Err(e) => {
                    log::warn!(
                        "Client #{}: connect attempt {}/{} failed: {}",
                        self.id,
                        attempt,
                        self.retry.max_attempts,
                        e
                    );
                    self.log.record(
                        EventKind::Error,
                        None,
                        &format!(
                            "connect attempt {}/{} failed: {}",
                            attempt, self.retry.max_attempts, e
                        ),
                    );
                }
            }

            if attempt < self.retry.max_attempts {
                time::sleep(backoff).await;
                backoff = std::cmp::min(backoff * 2, self.retry.max_backoff());
            }
        }

        self.log.record(
            EventKind::Closed,
            None,
            &format!("retries exhausted after {} attempts", self.retry.max_attempts),
        );
        anyhow::bail!(
            "Failed to connect to {} after {} attempts",
            self.server_addr,
            self.retry.max_attempts
        )
    }

    /// Probe loop over one established connection. Sequence numbers
    /// restart at 0 per connection.
    async fn session(
        &self,
        mut framed: Framed<TcpStream, LineCodec>,
        deadline: time::Instant,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let mut sequence: u64 = 0;
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let probe = Message::probe(sequence);
                    let sent_at = time::Instant::now();

                    if let Err(e) = framed.send(probe).await {
                        self.log.record(
                            EventKind::Closed,
                            Some(sequence),
                            &format!("send failed: {e}"),
                        );
                        return SessionEnd::ConnectionLost;
                    }
                    self.log.record(EventKind::Sent, Some(sequence), "");

                    // The pending probe is abandoned (and recorded as
                    // incomplete) if the deadline or a termination
                    // signal interrupts the wait.
                    tokio::select! {
                        end = self.await_ack(&mut framed, sequence, sent_at) => {
                            match end {
                                None => sequence += 1,
                                Some(end) => return end,
                            }
                        }
                        _ = shutdown_rx.changed() => {
                            self.log.record(
                                EventKind::Closed,
                                Some(sequence),
                                "in-flight probe abandoned (terminated)",
                            );
                            return SessionEnd::Terminated;
                        }
                        _ = time::sleep_until(deadline) => {
                            self.log.record(
                                EventKind::Closed,
                                Some(sequence),
                                "in-flight probe abandoned (run duration elapsed)",
                            );
                            return SessionEnd::Finished;
                        }
                    }
                }

                _ = shutdown_rx.changed() => {
                    self.log.record(EventKind::Closed, None, "terminated");
                    return SessionEnd::Terminated;
                }

                _ = time::sleep_until(deadline) => {
                    self.log.record(EventKind::Closed, None, "run duration elapsed");
                    return SessionEnd::Finished;
                }
            }
        }
    }

    /// Wait for the ACK matching `sequence`. Returns None when the
    /// loop should continue with the next probe, or the session end
    /// otherwise.
    async fn await_ack(
        &self,
        framed: &mut Framed<TcpStream, LineCodec>,
        sequence: u64,
        sent_at: time::Instant,
    ) -> Option<SessionEnd> {
        match time::timeout(self.response_timeout, framed.next()).await {
            Err(_) => {
                self.log.record(EventKind::Timeout, Some(sequence), "");
                Some(SessionEnd::ConnectionLost)
            }

            Ok(None) => {
                self.log.record(
                    EventKind::Closed,
                    Some(sequence),
                    "server closed connection",
                );
                Some(SessionEnd::ConnectionLost)
            }

            Ok(Some(Ok(msg))) => {
                if msg.kind == MessageKind::Ack && msg.sequence == sequence {
                    let latency = sent_at.elapsed();
                    self.log.record(
                        EventKind::Acked,
                        Some(sequence),
                        &format!("latency_ms={}", latency.as_millis()),
                    );
                    None
                } else {
                    self.log.record(
                        EventKind::Error,
                        Some(sequence),
                        &format!(
                            "expected ACK {}, got {} {}",
                            sequence,
                            msg.kind.as_str(),
                            msg.sequence
                        ),
                    );
                    Some(SessionEnd::ConnectionLost)
                }
            }

            Ok(Some(Err(e))) => {
                self.log.record(
                    EventKind::Error,
                    Some(sequence),
                    &format!("protocol error: {e}"),
                );
                Some(SessionEnd::ConnectionLost)
            }
        }
    }
}
