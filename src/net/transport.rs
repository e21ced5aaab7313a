//! Length-delimited JSON framing over TCP.
//!
//! A frame is a 4 byte big-endian length followed by that many bytes of JSON. Every message is
//! sent over a fresh connection which is closed right after the frame is written.

use std::{io, time::Duration};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::debug;

use crate::message::Message;

const MIB: usize = 1024 * 1024;

/// Size of the frame header in bytes.
pub const FRAME_HEADER_LENGTH: usize = 4;

/// Default upper bound for a single frame. Photos travel base64 encoded, so this is generous.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 64 * MIB;

/// Timeouts and limits applied to every connection.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub max_frame_length: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connecting to {0} timed out")]
    ConnectTimeout(String),
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("timed out waiting for a frame")]
    ReadTimeout,
    #[error("connection closed before a frame was received")]
    ConnectionClosed,
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),
}

impl TransportError {
    /// Whether the peer could not be reached at all.
    pub fn is_connect_error(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectTimeout(_) | TransportError::Connect { .. }
        )
    }
}

/// Builds the codec shared by senders and receivers.
pub fn codec(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(FRAME_HEADER_LENGTH)
        .big_endian()
        .max_frame_length(max_frame_length)
        .new_codec()
}

/// Opens a connection to `addr`, bounded by the connect timeout.
pub async fn connect(addr: &str, config: &TransportConfig) -> Result<TcpStream, TransportError> {
    match timeout(config.connect_timeout, TcpStream::connect(addr)).await {
        Err(_) => Err(TransportError::ConnectTimeout(addr.to_string())),
        Ok(Err(source)) => Err(TransportError::Connect {
            addr: addr.to_string(),
            source,
        }),
        Ok(Ok(stream)) => Ok(stream),
    }
}

/// Sends `message` to `addr` over a new connection and closes it.
pub async fn send(
    addr: &str,
    message: &Message,
    config: &TransportConfig,
) -> Result<(), TransportError> {
    let body = serde_json::to_vec(message).map_err(TransportError::Encode)?;
    let length = body.len();

    let stream = connect(addr, config).await?;
    let mut framed = FramedWrite::new(stream, codec(config.max_frame_length));
    framed.send(Bytes::from(body)).await?;

    let mut stream = framed.into_inner();
    stream.shutdown().await?;
    debug!("sent `{}` ({} bytes) to {}", message.kind, length, addr);
    Ok(())
}

/// Reads exactly one framed message from `stream`, bounded by the read timeout.
pub async fn recv<S>(stream: S, config: &TransportConfig) -> Result<Message, TransportError>
where
    S: AsyncRead + Unpin,
{
    let mut framed = FramedRead::new(stream, codec(config.max_frame_length));
    let frame = timeout(config.read_timeout, framed.next())
        .await
        .map_err(|_| TransportError::ReadTimeout)?
        .ok_or(TransportError::ConnectionClosed)??;
    debug!("received frame of {} bytes", frame.len());
    serde_json::from_slice(&frame).map_err(TransportError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use tokio::net::TcpListener;

    fn config() -> TransportConfig {
        TransportConfig {
            connect_timeout: Duration::from_millis(500),
            read_timeout: Duration::from_millis(500),
            max_frame_length: 1024,
        }
    }

    async fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    #[tokio::test]
    async fn test_send_and_recv() {
        let (listener, addr) = listener().await;
        let msg = Message::new(MessageType::RegistrationId, &"id-123")
            .unwrap()
            .reply_to("127.0.0.1:1");

        let sent = msg.clone();
        let sender = tokio::spawn(async move { send(&addr, &sent, &config()).await });

        let (stream, _) = listener.accept().await.unwrap();
        let received = recv(stream, &config()).await.unwrap();
        assert_eq!(received, msg);
        sender.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_frame_split_across_small_writes() {
        let (listener, addr) = listener().await;
        let msg = Message::new(MessageType::Embedding, &vec![0.25_f64; 32]).unwrap();
        let body = serde_json::to_vec(&msg).unwrap();
        let mut raw = (body.len() as u32).to_be_bytes().to_vec();
        raw.extend_from_slice(&body);

        let writer = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            for chunk in raw.chunks(7) {
                stream.write_all(chunk).await.unwrap();
                stream.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            stream.shutdown().await.unwrap();
        });

        let (stream, _) = listener.accept().await.unwrap();
        assert_eq!(recv(stream, &config()).await.unwrap(), msg);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_truncated_frame_is_an_error() {
        let (listener, addr) = listener().await;
        let writer = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(&100u32.to_be_bytes()).await.unwrap();
            stream.write_all(b"{\"type\":").await.unwrap();
            stream.shutdown().await.unwrap();
        });

        let (stream, _) = listener.accept().await.unwrap();
        assert!(matches!(
            recv(stream, &config()).await,
            Err(TransportError::Io(_))
        ));
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (listener, addr) = listener().await;
        let writer = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            // the receiver bails out on the header alone
            let _ = stream.write_all(&(4096u32).to_be_bytes()).await;
        });

        let (stream, _) = listener.accept().await.unwrap();
        assert!(recv(stream, &config()).await.is_err());
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_sending_an_oversized_message_fails() {
        let (_listener, addr) = listener().await;
        let msg = Message::new(MessageType::Embedding, &vec![1.5_f64; 1024]).unwrap();
        assert!(matches!(
            send(&addr, &msg, &config()).await,
            Err(TransportError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_json_is_a_decode_error() {
        let (listener, addr) = listener().await;
        let writer = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let mut framed = FramedWrite::new(stream, codec(1024));
            framed.send(Bytes::from_static(b"not json")).await.unwrap();
        });

        let (stream, _) = listener.accept().await.unwrap();
        assert!(matches!(
            recv(stream, &config()).await,
            Err(TransportError::Decode(_))
        ));
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let (listener, addr) = listener().await;
        let _peer = TcpStream::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        assert!(matches!(
            recv(stream, &config()).await,
            Err(TransportError::ReadTimeout)
        ));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let (listener, addr) = listener().await;
        drop(listener);
        let msg = Message::new(MessageType::GetEmbedding, &"id").unwrap();
        let err = send(&addr, &msg, &config()).await.unwrap_err();
        assert!(err.is_connect_error());
    }
}
