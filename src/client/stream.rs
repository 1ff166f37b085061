//! Duplex call wrapper.
//!
//! The stream keeps the first send/receive error it sees. `close` is
//! idempotent: the pool release callback runs exactly once, and the call
//! context is cancelled only when the stream ended in error.

use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::Status;

use crate::codec::Codec;
use crate::errors::NetError;

/// Callback handing the connection back to its pool.
pub(crate) type ReleaseFn = Box<dyn FnOnce(Option<&NetError>) + Send>;

#[derive(Default)]
struct StreamState {
    closed: bool,
    error: Option<NetError>,
}

struct Shared {
    state: Mutex<StreamState>,
    release: Mutex<Option<ReleaseFn>>,
    /// Call context; cancelled on error close.
    cancel: CancellationToken,
    /// Ends the outbound half.
    send_closed: CancellationToken,
}

impl Shared {
    fn set_error(&self, err: &NetError) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.error.is_none() {
            state.error = Some(err.clone());
        }
    }

    fn error(&self) -> Option<NetError> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .error
            .clone()
    }

    fn is_closed(&self) -> bool {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).closed
    }

    /// Returns `true` only for the call that actually closed.
    fn close(&self) -> bool {
        let error = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.closed {
                return false;
            }
            state.closed = true;
            state.error.clone()
        };

        self.send_closed.cancel();
        let release = self
            .release
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(release) = release {
            release(error.as_ref());
        }
        if error.is_some() {
            self.cancel.cancel();
        }
        true
    }
}

/// A duplex call on a pooled connection.
pub struct ClientStream {
    sender: StreamSender,
    receiver: StreamReceiver,
}

impl ClientStream {
    pub(crate) fn new(
        codec: Codec,
        outbound: mpsc::Sender<Bytes>,
        inbound: BoxStream<'static, Result<Bytes, Status>>,
        cancel: CancellationToken,
        send_closed: CancellationToken,
        release: ReleaseFn,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(StreamState::default()),
            release: Mutex::new(Some(release)),
            cancel,
            send_closed,
        });
        Self {
            sender: StreamSender {
                shared: Arc::clone(&shared),
                tx: outbound,
                codec,
            },
            receiver: StreamReceiver {
                shared,
                inbound,
                codec,
            },
        }
    }

    pub async fn send<T: Serialize + ?Sized>(&self, msg: &T) -> Result<(), NetError> {
        self.sender.send(msg).await
    }

    pub async fn send_raw(&self, payload: Bytes) -> Result<(), NetError> {
        self.sender.send_raw(payload).await
    }

    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>, NetError> {
        self.receiver.recv().await
    }

    pub async fn recv_raw(&mut self) -> Result<Option<Bytes>, NetError> {
        self.receiver.recv_raw().await
    }

    /// Stop sending; the peer sees end of stream.
    pub fn close_send(&self) {
        self.sender.close_send();
    }

    pub fn close(&self) -> bool {
        self.sender.close()
    }

    pub fn error(&self) -> Option<NetError> {
        self.sender.shared.error()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.shared.is_closed()
    }

    /// Token cancelled when the call context ends.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.sender.shared.cancel.clone()
    }

    pub fn split(self) -> (StreamSender, StreamReceiver) {
        (self.sender, self.receiver)
    }
}

/// Outbound half of a [`ClientStream`].
pub struct StreamSender {
    shared: Arc<Shared>,
    tx: mpsc::Sender<Bytes>,
    codec: Codec,
}

impl StreamSender {
    pub async fn send<T: Serialize + ?Sized>(&self, msg: &T) -> Result<(), NetError> {
        let payload = self
            .codec
            .encode(msg)
            .map_err(|e| NetError::bad_request(format!("[rpc-client] stream encode: {e}")))?;
        self.send_raw(payload).await
    }

    pub async fn send_raw(&self, payload: Bytes) -> Result<(), NetError> {
        if self.shared.send_closed.is_cancelled() {
            return Err(NetError::bad_request("[rpc-client] stream send: closed"));
        }
        let sent = tokio::select! {
            _ = self.shared.send_closed.cancelled() => Err(NetError::bad_request("[rpc-client] stream send: closed")),
            res = self.tx.send(payload) => res.map_err(|_| NetError::bad_request("[rpc-client] stream send: call ended")),
        };
        if let Err(err) = &sent {
            self.shared.set_error(err);
        }
        sent
    }

    pub fn close_send(&self) {
        self.shared.send_closed.cancel();
    }

    pub fn close(&self) -> bool {
        self.shared.close()
    }

    pub fn closer(&self) -> StreamCloser {
        StreamCloser {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Inbound half of a [`ClientStream`].
pub struct StreamReceiver {
    shared: Arc<Shared>,
    inbound: BoxStream<'static, Result<Bytes, Status>>,
    codec: Codec,
}

impl StreamReceiver {
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>, NetError> {
        let Some(payload) = self.recv_raw().await? else {
            return Ok(None);
        };
        self.codec
            .decode(&payload)
            .map(Some)
            .map_err(|e| NetError::bad_request(format!("[rpc-client] stream decode: {e}")))
    }

    /// Next message, or `None` at end of stream. Errors and end of
    /// stream both close the stream.
    pub async fn recv_raw(&mut self) -> Result<Option<Bytes>, NetError> {
        let item = tokio::select! {
            _ = self.shared.cancel.cancelled() => {
                let err = NetError::timeout("[rpc-client] stream recv: context canceled");
                self.shared.set_error(&err);
                self.shared.close();
                return Err(err);
            }
            item = self.inbound.next() => item,
        };

        match item {
            Some(Ok(payload)) => Ok(Some(payload)),
            Some(Err(status)) => {
                let err = super::classify_status(&status);
                self.shared.set_error(&err);
                self.shared.close();
                Err(err)
            }
            None => {
                self.shared.close();
                Ok(None)
            }
        }
    }

    pub fn close(&self) -> bool {
        self.shared.close()
    }

    pub fn closer(&self) -> StreamCloser {
        StreamCloser {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Cloneable handle that can only close the stream.
#[derive(Clone)]
pub struct StreamCloser {
    shared: Arc<Shared>,
}

impl StreamCloser {
    pub fn close(&self) -> bool {
        self.shared.close()
    }

    pub fn error(&self) -> Option<NetError> {
        self.shared.error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_stream::wrappers::ReceiverStream;

    struct Harness {
        stream: ClientStream,
        peer_rx: mpsc::Receiver<Bytes>,
        peer_tx: mpsc::Sender<Result<Bytes, Status>>,
        cancel: CancellationToken,
        releases: Arc<AtomicUsize>,
        released_with_error: Arc<Mutex<Option<bool>>>,
    }

    fn harness() -> Harness {
        let (tx, peer_rx) = mpsc::channel(4);
        let (peer_tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let releases = Arc::new(AtomicUsize::new(0));
        let released_with_error = Arc::new(Mutex::new(None));

        let counter = Arc::clone(&releases);
        let flag = Arc::clone(&released_with_error);
        let stream = ClientStream::new(
            Codec::Json,
            tx,
            ReceiverStream::new(rx).boxed(),
            cancel.clone(),
            CancellationToken::new(),
            Box::new(move |err| {
                counter.fetch_add(1, Ordering::SeqCst);
                *flag.lock().unwrap() = Some(err.is_some());
            }),
        );
        Harness {
            stream,
            peer_rx,
            peer_tx,
            cancel,
            releases,
            released_with_error,
        }
    }

    #[tokio::test]
    async fn typed_send_and_recv() {
        let mut h = harness();
        h.stream.send(&serde_json::json!({"n": 1})).await.unwrap();
        assert_eq!(h.peer_rx.recv().await.unwrap(), Bytes::from_static(br#"{"n":1}"#));

        h.peer_tx.send(Ok(Bytes::from_static(br#"{"n":2}"#))).await.unwrap();
        let got: serde_json::Value = h.stream.recv().await.unwrap().unwrap();
        assert_eq!(got["n"], 2);
    }

    #[tokio::test]
    async fn close_is_idempotent_across_halves() {
        let h = harness();
        let (sender, receiver) = h.stream.split();
        let closer = sender.closer();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let closer = closer.clone();
                tokio::spawn(async move { closer.close() })
            })
            .collect();
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert!(!sender.close());
        assert!(!receiver.close());

        assert_eq!(winners, 1);
        assert_eq!(h.releases.load(Ordering::SeqCst), 1);
        assert_eq!(*h.released_with_error.lock().unwrap(), Some(false));
        assert!(!h.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn recv_error_closes_and_cancels() {
        let mut h = harness();
        h.peer_tx
            .send(Err(Status::unavailable("connection reset")))
            .await
            .unwrap();

        let err = h.stream.recv_raw().await.unwrap_err();
        assert_eq!(err.status, 503);
        assert!(h.stream.is_closed());
        assert_eq!(h.stream.error(), Some(err));
        assert_eq!(*h.released_with_error.lock().unwrap(), Some(true));
        assert!(h.cancel.is_cancelled());

        h.stream.close();
        assert_eq!(h.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn end_of_stream_closes_cleanly() {
        let mut h = harness();
        drop(h.peer_tx);
        assert!(h.stream.recv_raw().await.unwrap().is_none());
        assert!(h.stream.is_closed());
        assert_eq!(*h.released_with_error.lock().unwrap(), Some(false));
        assert!(!h.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let h = harness();
        h.stream.close();
        let err = h.stream.send_raw(Bytes::from_static(b"{}")).await.unwrap_err();
        assert_eq!(err.status, 400);
    }

    #[tokio::test]
    async fn cancelled_context_unblocks_recv() {
        let mut h = harness();
        let cancel = h.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let err = h.stream.recv_raw().await.unwrap_err();
        assert_eq!(err.status, 408);
        assert_eq!(h.releases.load(Ordering::SeqCst), 1);
    }
}
