//! tonic channel dialer.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tonic::transport::{Channel, Endpoint};

use super::pool::{ConnState, Connector, PoolError, Transport};

const READY: u8 = 0;
const FAILED: u8 = 1;
const SHUTDOWN: u8 = 2;

/// An HTTP/2 channel to one backend address.
///
/// The channel reconnects on its own; the state here tracks what the
/// client observed so the pool can retire connections that failed.
#[derive(Clone, Debug)]
pub struct RpcChannel {
    channel: Channel,
    state: Arc<AtomicU8>,
}

impl RpcChannel {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            state: Arc::new(AtomicU8::new(READY)),
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    /// Record a transport-level failure seen on this channel.
    pub fn mark_failed(&self) {
        let _ = self
            .state
            .compare_exchange(READY, FAILED, Ordering::SeqCst, Ordering::SeqCst);
    }
}

impl Transport for RpcChannel {
    fn state(&self) -> ConnState {
        match self.state.load(Ordering::SeqCst) {
            READY => ConnState::Ready,
            FAILED => ConnState::TransientFailure,
            _ => ConnState::Shutdown,
        }
    }

    fn close(&self) {
        // The underlying connection closes once the last clone drops.
        self.state.store(SHUTDOWN, Ordering::SeqCst);
    }
}

/// Dials plaintext HTTP/2 channels.
#[derive(Debug, Clone)]
pub struct GrpcConnector {
    dial_timeout: Duration,
}

impl GrpcConnector {
    pub fn new(dial_timeout: Duration) -> Self {
        Self { dial_timeout }
    }
}

impl Default for GrpcConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

fn endpoint_uri(addr: &str) -> String {
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    }
}

impl Connector for GrpcConnector {
    type Conn = RpcChannel;

    async fn connect(&self, addr: &str) -> Result<RpcChannel, PoolError> {
        let dial_err = |reason: String| PoolError::Dial {
            addr: addr.to_string(),
            reason,
        };

        let endpoint = Endpoint::from_shared(endpoint_uri(addr))
            .map_err(|e| dial_err(e.to_string()))?
            .connect_timeout(self.dial_timeout)
            .tcp_nodelay(true);

        let channel = endpoint.connect().await.map_err(|e| dial_err(e.to_string()))?;
        Ok(RpcChannel::new(channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_gets_scheme() {
        assert_eq!(endpoint_uri("svc:10000"), "http://svc:10000");
        assert_eq!(endpoint_uri("https://svc"), "https://svc");
    }

    #[tokio::test]
    async fn channel_state_transitions() {
        let channel = Endpoint::from_static("http://127.0.0.1:1").connect_lazy();
        let conn = RpcChannel::new(channel);
        assert_eq!(conn.state(), ConnState::Ready);
        conn.mark_failed();
        assert_eq!(conn.clone().state(), ConnState::TransientFailure);
        conn.close();
        conn.mark_failed();
        assert_eq!(conn.state(), ConnState::Shutdown);
    }

    #[tokio::test]
    async fn dial_refused_is_error() {
        let connector = GrpcConnector::new(Duration::from_millis(300));
        let err = connector.connect("127.0.0.1:1").await.unwrap_err();
        assert!(matches!(err, PoolError::Dial { .. }));
    }
}
