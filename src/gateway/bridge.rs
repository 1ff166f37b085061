//! WebSocket ↔ duplex call bridge.
//!
//! # Data Flow
//! ```text
//!            socket_reader ──▶ [10] ──▶ backend_writer
//! WebSocket                                            duplex call
//!            socket_writer ◀── [10] ◀── backend_reader
//!                 │
//!                 └── ping every ws_ping_period
//! ```
//!
//! # Design Decisions
//! - The four pumps run in one `JoinSet` owned by the session supervisor
//! - Every pump exit, panics included, goes through one one-shot closer
//!   that cancels the session and closes the backend call
//! - Text frames only; a binary frame ends the session
//! - No retries: any failure tears the session down

use std::fmt::Display;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{ClientStream, StreamCloser, StreamReceiver, StreamSender};
use crate::net::connection::ConnectionId;

/// Messages buffered in each direction.
pub const CHANNEL_CAPACITY: usize = 10;

/// Outcome of a finished session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionReport {
    /// Pumps that ran to completion (always four).
    pub pumps_exited: usize,
    /// Times the close routine actually ran (always one).
    pub closes: usize,
}

/// One-shot teardown shared by the pumps.
pub(crate) struct SessionCloser {
    closed: Mutex<bool>,
    closes: AtomicUsize,
    cancel: CancellationToken,
    backend: StreamCloser,
}

impl SessionCloser {
    pub(crate) fn new(cancel: CancellationToken, backend: StreamCloser) -> Self {
        Self {
            closed: Mutex::new(false),
            closes: AtomicUsize::new(0),
            cancel,
            backend,
        }
    }

    /// Returns `true` for the call that performed the teardown.
    pub(crate) fn close(&self, reason: &str) -> bool {
        let mut closed = self.closed.lock().unwrap_or_else(PoisonError::into_inner);
        if *closed {
            return false;
        }
        *closed = true;
        self.closes.fetch_add(1, Ordering::SeqCst);
        debug!(reason, "Closing bridge session");
        self.cancel.cancel();
        self.backend.close();
        true
    }

    pub(crate) fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// Runs the closer when a pump ends, however it ends.
struct PumpExit {
    closer: Arc<SessionCloser>,
    pump: &'static str,
}

impl Drop for PumpExit {
    fn drop(&mut self) {
        self.closer.close(self.pump);
    }
}

/// Bridge an upgraded socket to an open duplex call.
pub async fn bridge(socket: WebSocket, stream: ClientStream, cancel: CancellationToken, ping_period: Duration) -> SessionReport {
    let (sink, source) = socket.split();
    run_session(source, sink, stream, cancel, ping_period).await
}

/// Session supervisor over any socket halves.
pub(crate) async fn run_session<R, W, RE, WE>(
    source: R,
    sink: W,
    stream: ClientStream,
    cancel: CancellationToken,
    ping_period: Duration,
) -> SessionReport
where
    R: Stream<Item = Result<Message, RE>> + Send + Unpin + 'static,
    W: Sink<Message, Error = WE> + Send + Unpin + 'static,
    RE: Display + Send + 'static,
    WE: Display + Send + 'static,
{
    let session = ConnectionId::new();
    let (sender, receiver) = stream.split();
    let closer = Arc::new(SessionCloser::new(cancel.clone(), sender.closer()));
    let exit = |pump| PumpExit {
        closer: Arc::clone(&closer),
        pump,
    };

    let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);

    let mut pumps = JoinSet::new();
    pumps.spawn(socket_reader(source, inbound_tx, cancel.clone(), exit("socket_reader")));
    pumps.spawn(socket_writer(sink, outbound_rx, cancel.clone(), ping_period, exit("socket_writer")));
    pumps.spawn(backend_writer(sender, inbound_rx, cancel.clone(), exit("backend_writer")));
    pumps.spawn(backend_reader(receiver, outbound_tx, cancel.clone(), exit("backend_reader")));

    let mut pumps_exited = 0;
    while let Some(joined) = pumps.join_next().await {
        pumps_exited += 1;
        if let Err(e) = joined {
            error!(session = %session, error = %e, "Bridge pump failed");
            closer.close("pump_failed");
        }
    }

    let report = SessionReport {
        pumps_exited,
        closes: closer.closes(),
    };
    info!(session = %session, pumps_exited, closes = report.closes, "Bridge session ended");
    report
}

async fn socket_reader<R, RE>(mut source: R, to_backend: mpsc::Sender<Bytes>, cancel: CancellationToken, _exit: PumpExit)
where
    R: Stream<Item = Result<Message, RE>> + Unpin,
    RE: Display,
{
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = source.next() => frame,
        };
        let payload = match frame {
            Some(Ok(Message::Text(text))) => Bytes::copy_from_slice(text.as_str().as_bytes()),
            Some(Ok(Message::Binary(_))) => {
                warn!("Binary frames are not supported");
                return;
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => return,
            Some(Err(e)) => {
                debug!(error = %e, "Socket read failed");
                return;
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => return,
            sent = to_backend.send(payload) => if sent.is_err() { return },
        }
    }
}

async fn socket_writer<W, WE>(
    mut sink: W,
    mut from_backend: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
    ping_period: Duration,
    _exit: PumpExit,
) where
    W: Sink<Message, Error = WE> + Unpin,
    WE: Display,
{
    let mut ping = interval_at(Instant::now() + ping_period, ping_period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ping.tick() => Message::Ping(Bytes::new()),
            msg = from_backend.recv() => match msg {
                Some(payload) => Message::Text(String::from_utf8_lossy(&payload).into_owned().into()),
                None => break,
            },
        };
        if let Err(e) = sink.send(frame).await {
            debug!(error = %e, "Socket write failed");
            break;
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}

async fn backend_writer(sender: StreamSender, mut from_socket: mpsc::Receiver<Bytes>, cancel: CancellationToken, _exit: PumpExit) {
    loop {
        let payload = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = from_socket.recv() => match msg {
                Some(payload) => payload,
                None => break,
            },
        };
        if let Err(e) = sender.send_raw(payload).await {
            debug!(error = %e, "Backend send failed");
            break;
        }
    }
    sender.close_send();
}

async fn backend_reader(mut receiver: StreamReceiver, to_socket: mpsc::Sender<Bytes>, cancel: CancellationToken, _exit: PumpExit) {
    loop {
        let payload = tokio::select! {
            _ = cancel.cancelled() => return,
            msg = receiver.recv_raw() => match msg {
                Ok(Some(payload)) => payload,
                Ok(None) => return,
                Err(e) => {
                    debug!(error = %e, "Backend receive failed");
                    return;
                }
            },
        };
        tokio::select! {
            _ = cancel.cancelled() => return,
            sent = to_socket.send(payload) => if sent.is_err() { return },
        }
    }
}
