//! Transport abstraction towards the counterparty.
//!
//! The update protocol only needs an ordered, bidirectional stream of
//! [Message]s; what carries them is up to the application. [FramedTransport]
//! is the provided implementation for byte streams, using the length-prefix
//! framing from [encoding].

pub mod encoding;

use crate::messages::Message;
use async_trait::async_trait;
use core::fmt::Debug;
use thiserror::Error;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection to counterparty closed")]
    Closed,
    #[error("message exceeds the maximum frame size")]
    FrameTooLarge,
    #[error("message codec: {0}")]
    Codec(#[from] bincode::Error),
    #[error("transport i/o: {0}")]
    Io(#[from] io::Error),
}

/// Ordered bidirectional message channel to the counterparty process.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    async fn send(&self, msg: Message) -> Result<(), TransportError>;
    async fn recv(&self) -> Result<Message, TransportError>;
}

/// [Transport] over any async byte stream, framing each message with a
/// big-endian u16 length prefix.
pub struct FramedTransport<S> {
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<WriteHalf<S>>,
}

impl<S> Debug for FramedTransport<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("FramedTransport")
    }
}

impl<S: AsyncRead + AsyncWrite> FramedTransport<S> {
    pub fn new(stream: S) -> Self {
        let (reader, writer) = io::split(stream);
        FramedTransport {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Send + Unpin + 'static> Transport for FramedTransport<S> {
    async fn send(&self, msg: Message) -> Result<(), TransportError> {
        let frame = encoding::encode(&msg)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Message, TransportError> {
        let mut reader = self.reader.lock().await;
        let mut len = [0u8; 2];
        if let Err(e) = reader.read_exact(&mut len).await {
            return Err(match e.kind() {
                io::ErrorKind::UnexpectedEof => TransportError::Closed,
                _ => TransportError::Io(e),
            });
        }
        let mut body = vec![0u8; u16::from_be_bytes(len) as usize];
        reader.read_exact(&mut body).await?;
        encoding::decode(&body)
    }
}
