//! Telemetry Listener.
//!
//! Raw TCP, one task per sensor connection. There is no framing beyond the
//! parser's minimum length: each `read` is handed to the parser as one frame.
//! Parse failures are audited and the connection keeps going; a read error,
//! peer close, idle timeout or shutdown ends only that connection.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use psr_config::ListenerSettings;
use psr_reconcile::ReconcileEngine;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::state::ListenerCounters;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerConfig {
    pub read_buffer_bytes: usize,
    /// Close a connection that sends nothing for this long.
    pub idle_timeout: Option<Duration>,
}

impl From<&ListenerSettings> for ListenerConfig {
    fn from(s: &ListenerSettings) -> Self {
        Self {
            read_buffer_bytes: s.read_buffer_bytes,
            idle_timeout: s.idle_timeout(),
        }
    }
}

pub struct TelemetryListener {
    listener: TcpListener,
    config: ListenerConfig,
    engine: Arc<ReconcileEngine>,
    counters: Arc<ListenerCounters>,
}

impl TelemetryListener {
    pub async fn bind(
        addr: &str,
        config: ListenerConfig,
        engine: Arc<ReconcileEngine>,
        counters: Arc<ListenerCounters>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind telemetry listener on {addr}"))?;
        Ok(Self {
            listener,
            config,
            engine,
            counters,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until `shutdown` becomes `true` (or its sender goes away).
    /// A failed accept is logged and the loop continues.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        match self.local_addr() {
            Ok(addr) => info!(%addr, "telemetry listener accepting"),
            Err(e) => warn!(error = %e, "telemetry listener has no local addr"),
        }

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        self.counters.connection_opened();
                        debug!(%peer, "sensor connected");
                        let conn = Connection {
                            stream,
                            peer,
                            config: self.config,
                            engine: self.engine.clone(),
                            counters: self.counters.clone(),
                        };
                        tokio::spawn(conn.serve(shutdown.clone()));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("telemetry listener stopping");
                        break;
                    }
                }
            }
        }
    }
}

struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    config: ListenerConfig,
    engine: Arc<ReconcileEngine>,
    counters: Arc<ListenerCounters>,
}

enum Read {
    Data(usize),
    Closed,
    Idle,
    Failed(io::Error),
    Shutdown,
}

impl Connection {
    async fn serve(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; self.config.read_buffer_bytes];
        loop {
            let read = tokio::select! {
                r = read_with_deadline(&mut self.stream, &mut buf, self.config.idle_timeout) => r,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        Read::Shutdown
                    } else {
                        continue;
                    }
                }
            };

            match read {
                Read::Data(n) => self.handle_frame(&buf[..n]).await,
                Read::Closed => {
                    debug!(peer = %self.peer, "sensor closed connection");
                    break;
                }
                Read::Idle => {
                    info!(peer = %self.peer, "idle timeout; closing sensor connection");
                    break;
                }
                Read::Failed(e) => {
                    warn!(peer = %self.peer, error = %e, "sensor read failed");
                    break;
                }
                Read::Shutdown => break,
            }
        }
        self.counters.connection_closed();
    }

    async fn handle_frame(&self, frame: &[u8]) {
        match psr_proto::parse_frame(frame, Utc::now()) {
            Ok(event) => {
                self.counters.frame_ok();
                if let Err(e) = self.engine.apply_sensor_event(&event).await {
                    self.counters.reconcile_failed();
                    warn!(peer = %self.peer, sensor = %event.sensor_external_id, error = %e, "sensor event not applied");
                }
            }
            Err(perr) => {
                self.counters.frame_rejected();
                debug!(peer = %self.peer, error = %perr, "frame rejected");
                if let Err(e) = self
                    .engine
                    .audit_protocol_error(&hex::encode_upper(frame), &perr)
                    .await
                {
                    warn!(error = %e, "audit of rejected frame failed");
                }
            }
        }
    }
}

async fn read_with_deadline(
    stream: &mut TcpStream,
    buf: &mut [u8],
    idle_timeout: Option<Duration>,
) -> Read {
    let res = match idle_timeout {
        Some(limit) => match tokio::time::timeout(limit, stream.read(buf)).await {
            Ok(r) => r,
            Err(_) => return Read::Idle,
        },
        None => stream.read(buf).await,
    };
    match res {
        Ok(0) => Read::Closed,
        Ok(n) => Read::Data(n),
        Err(e) => Read::Failed(e),
    }
}
