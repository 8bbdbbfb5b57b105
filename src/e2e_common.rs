//! In-process peer used by the integration suite: the honest responder half
//! of the exchange plus low-level helpers for hand-scripted server replies.

use thiserror::Error;

use crate::codec::{self, Phase};
use crate::crypto::exchange::ResponderExchange;
use crate::crypto::FrameCipher;
use crate::transport::{PairSocket, TransportError, WireSocket};

#[derive(Debug, Error)]
pub enum ResponderError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Sends frames to the client with the leading addressing frame a dealer
/// peer puts on the wire.
pub async fn send_to_client(
    socket: &mut PairSocket,
    frames: Vec<Vec<u8>>,
) -> Result<(), TransportError> {
    let mut wire = Vec::with_capacity(frames.len() + 1);
    wire.push(Vec::new());
    wire.extend(frames);
    socket.send(wire).await
}

/// Receives one message from the client and strips the addressing frame.
pub async fn recv_from_client(socket: &mut PairSocket) -> Result<Vec<Vec<u8>>, TransportError> {
    let mut frames = socket.recv().await?;
    if !frames.is_empty() {
        frames.remove(0);
    }
    Ok(frames)
}

/// Like [`recv_from_client`] but skips heartbeats, which interleave freely
/// with everything else.
pub async fn next_non_heartbeat(
    socket: &mut PairSocket,
) -> Result<Vec<Vec<u8>>, TransportError> {
    loop {
        let frames = recv_from_client(socket).await?;
        if frames.is_empty() || codec::is_heartbeat(&frames) {
            continue;
        }
        return Ok(frames);
    }
}

pub async fn send_heartbeat(socket: &mut PairSocket) -> Result<(), TransportError> {
    send_to_client(socket, vec![codec::HEARTBEAT.to_vec()]).await
}

/// Runs the honest responder half of the exchange to completion and returns
/// the session cipher for encrypted echo traffic.
pub async fn run_responder(
    socket: &mut PairSocket,
    identity: &str,
    secret: &str,
) -> Result<FrameCipher, ResponderError> {
    let mut exchange = ResponderExchange::new(identity, secret);

    let hello = next_non_heartbeat(socket).await?;
    if hello.len() != 1 || hello[0] != codec::header(codec::CLIENT_HELLO) {
        return Err(ResponderError::Protocol("expected hello".into()));
    }
    send_to_client(
        socket,
        vec![
            codec::header(Phase::Step0.byte()),
            exchange.server_nonce().to_vec(),
        ],
    )
    .await?;

    let request = next_non_heartbeat(socket).await?;
    if request.len() != 3 || request[0] != codec::header(codec::CLIENT_EXCHANGE) {
        return Err(ResponderError::Protocol("expected exchange step".into()));
    }
    let Some((salt, public)) = exchange.accept(&request[1], &request[2]) else {
        return Err(ResponderError::Protocol("exchange rejected".into()));
    };
    send_to_client(
        socket,
        vec![
            codec::header(Phase::Step1.byte()),
            salt.to_vec(),
            public.to_vec(),
        ],
    )
    .await?;

    let proof = next_non_heartbeat(socket).await?;
    if proof.len() != 2 || proof[0] != codec::header(codec::CLIENT_PROOF) {
        return Err(ResponderError::Protocol("expected proof step".into()));
    }
    let Some((key, responder_proof)) = exchange.verify_initiator(&proof[1]) else {
        return Err(ResponderError::Protocol("initiator proof rejected".into()));
    };
    send_to_client(
        socket,
        vec![
            codec::header(Phase::Step2.byte()),
            responder_proof.to_vec(),
        ],
    )
    .await?;

    Ok(FrameCipher::new(&key))
}

/// Echoes one plaintext application message back to the client.
pub async fn echo_plaintext_once(socket: &mut PairSocket) -> Result<(), TransportError> {
    let frames = recv_from_client(socket).await?;
    send_to_client(socket, frames).await
}

/// Decrypts one inbound application message and echoes it back encrypted.
pub async fn echo_encrypted_once(
    socket: &mut PairSocket,
    cipher: &FrameCipher,
) -> Result<(), ResponderError> {
    let frames = next_non_heartbeat(socket).await?;
    let mut echoed = Vec::with_capacity(frames.len());
    for frame in &frames {
        let opened = cipher
            .decrypt(frame)
            .map_err(|error| ResponderError::Protocol(error.to_string()))?;
        let resealed = cipher
            .encrypt(&opened)
            .map_err(|error| ResponderError::Protocol(error.to_string()))?;
        echoed.push(resealed);
    }
    send_to_client(socket, echoed).await?;
    Ok(())
}
