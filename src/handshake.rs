//! Client-side handshake session: the challenge-response state machine that
//! turns server step messages into the next outbound frames and, at the end,
//! into an installed session cipher.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::codec;
use crate::crypto::exchange::{InitiatorExchange, PendingSession};
use crate::crypto::FrameCipher;
use crate::identity::Credentials;

/// Where the exchange currently stands. `Failed` is terminal; recovery means
/// starting a fresh session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    Init,
    AwaitStep0,
    AwaitStep1,
    AwaitStep2,
    Established,
    Failed,
}

/// One secured-session attempt. Created on `secure_connection`, mutated only
/// on the dispatch loop; the cipher slot transitions empty to populated at
/// most once.
pub struct HandshakeSession {
    credentials: Credentials,
    phase: HandshakePhase,
    exchange: Option<InitiatorExchange>,
    pending: Option<PendingSession>,
    cipher: Option<Arc<FrameCipher>>,
    last_heartbeat: Instant,
}

impl HandshakeSession {
    pub fn new(credentials: Credentials) -> Self {
        let exchange = InitiatorExchange::new(&credentials.identity, &credentials.secret);
        Self {
            credentials,
            phase: HandshakePhase::Init,
            exchange: Some(exchange),
            pending: None,
            cipher: None,
            last_heartbeat: Instant::now(),
        }
    }

    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    pub fn is_established(&self) -> bool {
        self.phase == HandshakePhase::Established
    }

    pub fn cipher(&self) -> Option<Arc<FrameCipher>> {
        self.cipher.clone()
    }

    pub fn last_heartbeat(&self) -> Instant {
        self.last_heartbeat
    }

    pub fn record_heartbeat(&mut self) {
        self.last_heartbeat = Instant::now();
    }

    pub fn fail(&mut self) {
        self.phase = HandshakePhase::Failed;
    }

    /// Emits the opening client frames and starts awaiting the first server
    /// step.
    pub fn create_initiation_request(&mut self) -> Vec<Vec<u8>> {
        self.phase = HandshakePhase::AwaitStep0;
        debug!(target: "framewire::handshake", "initiating exchange");
        vec![codec::header(codec::CLIENT_HELLO)]
    }

    /// Consumes the first server step (nonce) and emits the identity plus
    /// the ephemeral public value. `None` marks the session failed.
    pub fn create_handshake_request(&mut self, frames: &[Vec<u8>]) -> Option<Vec<Vec<u8>>> {
        if self.phase != HandshakePhase::AwaitStep0 || frames.len() != 2 {
            self.reject("unexpected opening step");
            return None;
        }
        let noted = self
            .exchange
            .as_mut()
            .map(|exchange| exchange.note_server_nonce(&frames[1]))
            .unwrap_or(false);
        if !noted {
            self.reject("malformed server nonce");
            return None;
        }
        let public = self.exchange.as_ref()?.public();
        self.phase = HandshakePhase::AwaitStep1;
        Some(vec![
            codec::header(codec::CLIENT_EXCHANGE),
            self.credentials.identity.clone().into_bytes(),
            public.to_vec(),
        ])
    }

    /// Consumes the second server step (salt plus responder public value)
    /// and emits the initiator proof. `None` marks the session failed.
    pub fn create_proof_request(&mut self, frames: &[Vec<u8>]) -> Option<Vec<Vec<u8>>> {
        if self.phase != HandshakePhase::AwaitStep1 || frames.len() != 3 {
            self.reject("unexpected challenge step");
            return None;
        }
        let pending = self
            .exchange
            .as_mut()
            .and_then(|exchange| exchange.complete(&frames[1], &frames[2]));
        let Some(pending) = pending else {
            self.reject("malformed challenge material");
            return None;
        };
        let proof = pending.initiator_proof().to_vec();
        self.pending = Some(pending);
        self.phase = HandshakePhase::AwaitStep2;
        Some(vec![codec::header(codec::CLIENT_PROOF), proof])
    }

    /// Consumes the closing server step. A valid responder proof installs
    /// the cipher and establishes the session; anything else fails it.
    pub fn process_proof_reply(&mut self, frames: &[Vec<u8>]) -> bool {
        if self.phase != HandshakePhase::AwaitStep2 || frames.len() != 2 {
            self.reject("unexpected closing step");
            return false;
        }
        match self
            .pending
            .take()
            .and_then(|pending| pending.verify_responder(&frames[1]))
        {
            Some(key) => {
                self.cipher = Some(Arc::new(FrameCipher::new(&key)));
                self.phase = HandshakePhase::Established;
                self.last_heartbeat = Instant::now();
                debug!(target: "framewire::handshake", "session established");
                true
            }
            None => {
                self.reject("responder proof rejected");
                false
            }
        }
    }

    fn reject(&mut self, reason: &str) {
        warn!(target: "framewire::handshake", reason, "exchange failed");
        self.phase = HandshakePhase::Failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Phase;
    use crate::crypto::exchange::ResponderExchange;

    fn credentials() -> Credentials {
        Credentials::new("alice", "s3cret")
    }

    fn step(phase: Phase, tail: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        let mut frames = vec![codec::header(phase.byte())];
        frames.extend(tail);
        frames
    }

    /// Drives a full exchange against the in-process responder.
    fn establish(session: &mut HandshakeSession, mut responder: ResponderExchange) -> bool {
        let hello = session.create_initiation_request();
        assert_eq!(hello, vec![codec::header(codec::CLIENT_HELLO)]);

        let request = session
            .create_handshake_request(&step(
                Phase::Step0,
                vec![responder.server_nonce().to_vec()],
            ))
            .expect("nonce accepted");
        let (salt, server_public) = responder
            .accept(&request[1], &request[2])
            .expect("identity accepted");

        let proof = session
            .create_proof_request(&step(
                Phase::Step1,
                vec![salt.to_vec(), server_public.to_vec()],
            ))
            .expect("challenge accepted");

        // a responder that rejects the proof would answer with garbage the
        // client cannot verify
        let responder_proof = responder
            .verify_initiator(&proof[1])
            .map(|(_, proof)| proof.to_vec())
            .unwrap_or_else(|| vec![0u8; 32]);
        session.process_proof_reply(&step(Phase::Step2, vec![responder_proof]))
    }

    #[test]
    fn full_exchange_installs_the_cipher_once() {
        let mut session = HandshakeSession::new(credentials());
        let responder = ResponderExchange::new("alice", "s3cret");
        assert!(session.cipher().is_none());
        assert!(establish(&mut session, responder));
        assert_eq!(session.phase(), HandshakePhase::Established);
        assert!(session.cipher().is_some());
    }

    #[test]
    fn wrong_server_secret_fails_the_proof_step() {
        let mut session = HandshakeSession::new(credentials());
        let responder = ResponderExchange::new("alice", "not-the-secret");
        assert!(!establish(&mut session, responder));
        assert_eq!(session.phase(), HandshakePhase::Failed);
        assert!(session.cipher().is_none());
    }

    #[test]
    fn out_of_order_steps_are_terminal() {
        let mut session = HandshakeSession::new(credentials());
        session.create_initiation_request();
        assert!(session
            .create_proof_request(&step(Phase::Step1, vec![vec![0; 16], vec![0; 32]]))
            .is_none());
        assert_eq!(session.phase(), HandshakePhase::Failed);
        // terminal: even a well-formed opening step is rejected now
        assert!(session
            .create_handshake_request(&step(Phase::Step0, vec![vec![0; 32]]))
            .is_none());
    }

    #[test]
    fn malformed_nonce_fails_the_opening_step() {
        let mut session = HandshakeSession::new(credentials());
        session.create_initiation_request();
        assert!(session
            .create_handshake_request(&step(Phase::Step0, vec![vec![0; 5]]))
            .is_none());
        assert_eq!(session.phase(), HandshakePhase::Failed);
    }

    #[test]
    fn heartbeat_recording_moves_the_clock() {
        let mut session = HandshakeSession::new(credentials());
        let before = session.last_heartbeat();
        session.record_heartbeat();
        assert!(session.last_heartbeat() >= before);
    }
}
