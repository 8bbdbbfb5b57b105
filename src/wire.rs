//! Wire I/O loop: owns the socket and the outbound queue. Its only job is
//! to keep the socket moving; it performs per-frame symmetric work and
//! nothing else. User callbacks and the handshake live on the dispatch
//! loop.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::state::Shared;
use crate::stats::WireStats;
use crate::transport::WireSocket;

/// Outbound hand-off unit. Control batches (handshake steps, heartbeats)
/// bypass the cipher; payload batches are encrypted once it is installed.
#[derive(Debug)]
pub(crate) enum Outbound {
    Control(Vec<Vec<u8>>),
    Payload(Vec<Vec<u8>>),
}

pub(crate) async fn wire_loop<S: WireSocket>(
    mut socket: S,
    mut outbound: mpsc::Receiver<Outbound>,
    inbound: mpsc::Sender<Vec<Vec<u8>>>,
    shared: Arc<Shared>,
    stats: Arc<dyn WireStats>,
) {
    loop {
        tokio::select! {
            queued = outbound.recv() => {
                let Some(queued) = queued else {
                    debug!(target: "framewire::wire", "outbound queue closed; exiting");
                    break;
                };
                let frames = match queued {
                    Outbound::Control(frames) => frames,
                    Outbound::Payload(frames) => match seal(&shared, frames) {
                        Some(frames) => frames,
                        None => continue,
                    },
                };
                let count = frames.len();
                // dealer addressing convention: empty leading wire frame
                let mut wire = Vec::with_capacity(count + 1);
                wire.push(Vec::new());
                wire.extend(frames);
                if let Err(error) = socket.send(wire).await {
                    warn!(target: "framewire::wire", %error, "send failed");
                    continue;
                }
                stats.frames_sent(count);
            }
            received = socket.recv() => {
                match received {
                    Ok(mut frames) => {
                        if frames.is_empty() {
                            continue;
                        }
                        frames.remove(0); // addressing frame
                        if frames.is_empty() {
                            continue;
                        }
                        stats.frames_received(frames.len());
                        if inbound.send(frames).await.is_err() {
                            debug!(target: "framewire::wire", "inbound queue closed; exiting");
                            break;
                        }
                    }
                    Err(error) => {
                        warn!(target: "framewire::wire", %error, "receive failed; exiting");
                        break;
                    }
                }
            }
        }
    }
}

/// Encrypts a payload batch in place once the session cipher is published;
/// passes it through verbatim before that (plaintext mode).
fn seal(shared: &Shared, frames: Vec<Vec<u8>>) -> Option<Vec<Vec<u8>>> {
    let Some(cipher) = shared.cipher() else {
        return Some(frames);
    };
    let mut sealed = Vec::with_capacity(frames.len());
    for frame in &frames {
        match cipher.encrypt(frame) {
            Ok(frame) => sealed.push(frame),
            Err(error) => {
                warn!(target: "framewire::wire", %error, "encryption failed; batch dropped");
                return None;
            }
        }
    }
    Some(sealed)
}
