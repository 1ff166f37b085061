//! Server side of a streaming call.

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tonic::Status;

use crate::codec::Codec;
use crate::errors::NetError;

/// Typed access to a call's inbound and outbound messages, handed to
/// stream handlers.
pub struct ServerStream {
    codec: Codec,
    inbound: BoxStream<'static, Result<Bytes, Status>>,
    outbound: mpsc::Sender<Result<Bytes, Status>>,
}

impl ServerStream {
    pub fn new(
        codec: Codec,
        inbound: BoxStream<'static, Result<Bytes, Status>>,
        outbound: mpsc::Sender<Result<Bytes, Status>>,
    ) -> Self {
        Self {
            codec,
            inbound,
            outbound,
        }
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Next message, or `None` once the client finished sending.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>, NetError> {
        match self.recv_raw().await? {
            Some(payload) => self
                .codec
                .decode(&payload)
                .map(Some)
                .map_err(|e| NetError::bad_request(format!("Unmarshal error: {e}"))),
            None => Ok(None),
        }
    }

    pub async fn recv_raw(&mut self) -> Result<Option<Bytes>, NetError> {
        match self.inbound.next().await {
            Some(Ok(payload)) => Ok(Some(payload)),
            Some(Err(status)) => Err(NetError::bad_request(format!("stream recv: {}", status.message()))),
            None => Ok(None),
        }
    }

    pub async fn send<T: Serialize + ?Sized>(&mut self, msg: &T) -> Result<(), NetError> {
        let payload = self
            .codec
            .encode(msg)
            .map_err(|e| NetError::internal(format!("Marshal error: {e}")))?;
        self.send_raw(payload).await
    }

    pub async fn send_raw(&mut self, payload: Bytes) -> Result<(), NetError> {
        self.outbound
            .send(Ok(payload))
            .await
            .map_err(|_| NetError::bad_request("stream send: client went away"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::wrappers::ReceiverStream;

    #[tokio::test]
    async fn typed_roundtrip() {
        let (client_tx, inbound) = mpsc::channel(4);
        let (outbound, mut client_rx) = mpsc::channel(4);
        let mut stream = ServerStream::new(Codec::MsgPack, ReceiverStream::new(inbound).boxed(), outbound);

        client_tx
            .send(Ok(Codec::MsgPack.encode(&vec![1u32, 2, 3]).unwrap()))
            .await
            .unwrap();
        drop(client_tx);

        let got: Vec<u32> = stream.recv().await.unwrap().unwrap();
        assert_eq!(got, vec![1, 2, 3]);
        assert!(stream.recv::<Vec<u32>>().await.unwrap().is_none());

        stream.send(&"pong").await.unwrap();
        let sent = client_rx.recv().await.unwrap().unwrap();
        let text: String = Codec::MsgPack.decode(&sent).unwrap();
        assert_eq!(text, "pong");
    }

    #[tokio::test]
    async fn send_fails_when_client_gone() {
        let (_client_tx, inbound) = mpsc::channel::<Result<Bytes, Status>>(1);
        let (outbound, client_rx) = mpsc::channel(1);
        drop(client_rx);
        let mut stream = ServerStream::new(Codec::Json, ReceiverStream::new(inbound).boxed(), outbound);
        assert!(stream.send(&1).await.is_err());
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn handler_futures_that_send_are_send() {
        let (_client_tx, inbound) = mpsc::channel::<Result<Bytes, Status>>(1);
        let (outbound, _client_rx) = mpsc::channel(1);
        let mut stream = ServerStream::new(Codec::Json, ReceiverStream::new(inbound).boxed(), outbound);
        let echo = async move {
            while let Some(msg) = stream.recv_raw().await? {
                stream.send_raw(msg).await?;
            }
            stream.send(&"done").await
        };
        assert_send(&echo);
    }
}
