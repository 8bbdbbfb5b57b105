//! Dealer-style multipart wire contract and its implementations.
//!
//! The client core only assumes a reliable bidirectional socket that moves
//! whole multi-frame messages and carries an attachable binary identity.
//! [`TcpDealerSocket`] realizes that contract over TCP with length-prefixed
//! framing; [`PairSocket`] realizes it in memory so tests can script the
//! peer side.

use std::io;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::identity::ClientId;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("transport closed")]
    Closed,
    #[error("unsupported connection string: {0}")]
    InvalidEndpoint(String),
}

/// Reliable bidirectional multi-frame message socket.
#[async_trait]
pub trait WireSocket: Send {
    async fn send(&mut self, frames: Vec<Vec<u8>>) -> Result<(), TransportError>;
    async fn recv(&mut self) -> Result<Vec<Vec<u8>>, TransportError>;
}

const MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

/// Multipart framing: a u32 body length, then per frame a u32 frame length
/// followed by the frame bytes. All integers big-endian.
#[derive(Debug, Default)]
pub struct MultipartCodec;

impl Decoder for MultipartCodec {
    type Item = Vec<Vec<u8>>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, io::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let body = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if body > MAX_MESSAGE_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "message exceeds size cap",
            ));
        }
        if src.len() < 4 + body {
            src.reserve(4 + body - src.len());
            return Ok(None);
        }
        src.advance(4);
        let mut rest = src.split_to(body);
        let mut frames = Vec::new();
        while !rest.is_empty() {
            if rest.len() < 4 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "truncated frame length",
                ));
            }
            let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
            rest.advance(4);
            if rest.len() < len {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "truncated frame body",
                ));
            }
            frames.push(rest.split_to(len).to_vec());
        }
        Ok(Some(frames))
    }
}

impl Encoder<Vec<Vec<u8>>> for MultipartCodec {
    type Error = io::Error;

    fn encode(&mut self, frames: Vec<Vec<u8>>, dst: &mut BytesMut) -> Result<(), io::Error> {
        let body: usize = frames.iter().map(|frame| 4 + frame.len()).sum();
        if body > MAX_MESSAGE_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "message exceeds size cap",
            ));
        }
        dst.reserve(4 + body);
        dst.put_u32(body as u32);
        for frame in frames {
            dst.put_u32(frame.len() as u32);
            dst.put_slice(&frame);
        }
        Ok(())
    }
}

/// TCP realization of the dealer contract. The 16-byte identity is attached
/// by sending it as a single-frame greeting immediately after connect, which
/// is how the peer learns the route back.
pub struct TcpDealerSocket {
    framed: Framed<TcpStream, MultipartCodec>,
}

impl TcpDealerSocket {
    /// Connects a `tcp://host:port` connection string and attaches the
    /// identity.
    pub async fn connect(connection: &str, identity: ClientId) -> Result<Self, TransportError> {
        let endpoint = parse_endpoint(connection)?;
        let stream = TcpStream::connect(endpoint).await?;
        stream.set_nodelay(true)?;
        let mut framed = Framed::new(stream, MultipartCodec);
        framed.send(vec![identity.as_bytes().to_vec()]).await?;
        Ok(Self { framed })
    }
}

#[async_trait]
impl WireSocket for TcpDealerSocket {
    async fn send(&mut self, frames: Vec<Vec<u8>>) -> Result<(), TransportError> {
        self.framed.send(frames).await.map_err(TransportError::from)
    }

    async fn recv(&mut self) -> Result<Vec<Vec<u8>>, TransportError> {
        match self.framed.next().await {
            Some(result) => result.map_err(TransportError::from),
            None => Err(TransportError::Closed),
        }
    }
}

fn parse_endpoint(connection: &str) -> Result<String, TransportError> {
    connection
        .strip_prefix("tcp://")
        .filter(|rest| rest.rsplit_once(':').is_some_and(|(host, port)| {
            !host.is_empty() && port.parse::<u16>().is_ok()
        }))
        .map(str::to_string)
        .ok_or_else(|| TransportError::InvalidEndpoint(connection.to_string()))
}

/// In-memory socket pair honoring the same contract; one end plays the peer
/// in tests and examples.
pub struct PairSocket {
    tx: mpsc::Sender<Vec<Vec<u8>>>,
    rx: mpsc::Receiver<Vec<Vec<u8>>>,
}

impl PairSocket {
    pub fn pair() -> (PairSocket, PairSocket) {
        let (left_tx, left_rx) = mpsc::channel(64);
        let (right_tx, right_rx) = mpsc::channel(64);
        (
            PairSocket {
                tx: left_tx,
                rx: right_rx,
            },
            PairSocket {
                tx: right_tx,
                rx: left_rx,
            },
        )
    }
}

#[async_trait]
impl WireSocket for PairSocket {
    async fn send(&mut self, frames: Vec<Vec<u8>>) -> Result<(), TransportError> {
        self.tx.send(frames).await.map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Result<Vec<Vec<u8>>, TransportError> {
        self.rx.recv().await.ok_or(TransportError::Closed)
    }
}
