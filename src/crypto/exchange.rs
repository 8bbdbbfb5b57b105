//! Mutual-authentication key exchange.
//!
//! Verifier-style challenge-response over X25519 ephemerals: both sides mix
//! the Diffie-Hellman output with a digest of the shared secret, derive the
//! session key through HKDF-SHA256, and prove knowledge of the result with
//! HMAC transcripts. The secret itself never crosses the wire; a party that
//! does not hold it cannot produce either proof.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use x25519_dalek::{EphemeralSecret, PublicKey};

use super::{SessionKey, KEY_LEN};

pub const NONCE_LEN: usize = 32;
pub const SALT_LEN: usize = 16;
pub const PUBLIC_LEN: usize = 32;
pub const PROOF_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

const SESSION_INFO: &[u8] = b"framewire session v1";
const INITIATOR_LABEL: &[u8] = b"framewire initiator proof";
const RESPONDER_LABEL: &[u8] = b"framewire responder proof";

fn secret_digest(identity: &str, secret: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(identity.as_bytes());
    hasher.update([0x1f]);
    hasher.update(secret.as_bytes());
    hasher.finalize().into()
}

struct Material {
    key: SessionKey,
    initiator_proof: [u8; PROOF_LEN],
    responder_proof: [u8; PROOF_LEN],
}

/// Shared derivation: key and both proofs over the full transcript
/// (initiator public ‖ responder public ‖ server nonce ‖ salt).
fn derive(
    digest: &[u8; 32],
    shared: &[u8; 32],
    salt: &[u8],
    initiator_public: &[u8; PUBLIC_LEN],
    responder_public: &[u8; PUBLIC_LEN],
    server_nonce: &[u8],
) -> Material {
    let mut ikm = [0u8; 64];
    ikm[..32].copy_from_slice(shared);
    ikm[32..].copy_from_slice(digest);

    let hk = Hkdf::<Sha256>::new(Some(salt), &ikm);
    let mut okm = [0u8; KEY_LEN + 32];
    hk.expand(SESSION_INFO, &mut okm)
        .expect("okm length is valid for hkdf-sha256");
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&okm[..KEY_LEN]);
    let proof_key = &okm[KEY_LEN..];

    let transcript_mac = |label: &[u8], extra: Option<&[u8]>| -> [u8; PROOF_LEN] {
        let mut mac = HmacSha256::new_from_slice(proof_key)
            .expect("hmac-sha256 accepts any key length");
        mac.update(label);
        mac.update(initiator_public);
        mac.update(responder_public);
        mac.update(server_nonce);
        mac.update(salt);
        if let Some(extra) = extra {
            mac.update(extra);
        }
        mac.finalize().into_bytes().into()
    };

    let initiator_proof = transcript_mac(INITIATOR_LABEL, None);
    let responder_proof = transcript_mac(RESPONDER_LABEL, Some(&initiator_proof));

    Material {
        key: SessionKey::new(key),
        initiator_proof,
        responder_proof,
    }
}

/// Client half of the exchange. Ephemeral state lives exactly as long as one
/// handshake attempt.
pub struct InitiatorExchange {
    digest: [u8; 32],
    ephemeral: Option<EphemeralSecret>,
    public: [u8; PUBLIC_LEN],
    server_nonce: Option<[u8; NONCE_LEN]>,
}

impl InitiatorExchange {
    pub fn new(identity: &str, secret: &str) -> Self {
        let ephemeral = EphemeralSecret::random();
        let public = PublicKey::from(&ephemeral).to_bytes();
        Self {
            digest: secret_digest(identity, secret),
            ephemeral: Some(ephemeral),
            public,
            server_nonce: None,
        }
    }

    pub fn public(&self) -> [u8; PUBLIC_LEN] {
        self.public
    }

    /// Records the responder nonce from the opening server step.
    pub fn note_server_nonce(&mut self, nonce: &[u8]) -> bool {
        if nonce.len() != NONCE_LEN {
            return false;
        }
        let mut fixed = [0u8; NONCE_LEN];
        fixed.copy_from_slice(nonce);
        self.server_nonce = Some(fixed);
        true
    }

    /// Consumes the ephemeral against the responder's salt and public value
    /// and produces the derived material awaiting the responder proof.
    pub fn complete(&mut self, salt: &[u8], responder_public: &[u8]) -> Option<PendingSession> {
        if salt.len() != SALT_LEN || responder_public.len() != PUBLIC_LEN {
            return None;
        }
        let server_nonce = self.server_nonce?;
        let ephemeral = self.ephemeral.take()?;
        let mut their_public = [0u8; PUBLIC_LEN];
        their_public.copy_from_slice(responder_public);
        let shared = ephemeral.diffie_hellman(&PublicKey::from(their_public));
        let material = derive(
            &self.digest,
            shared.as_bytes(),
            salt,
            &self.public,
            &their_public,
            &server_nonce,
        );
        Some(PendingSession { material })
    }
}

/// Derived material waiting for the responder's closing proof.
pub struct PendingSession {
    material: Material,
}

impl PendingSession {
    pub fn initiator_proof(&self) -> &[u8; PROOF_LEN] {
        &self.material.initiator_proof
    }

    /// Constant-time check of the responder proof; success yields the
    /// session key.
    pub fn verify_responder(self, proof: &[u8]) -> Option<SessionKey> {
        if bool::from(self.material.responder_proof.as_slice().ct_eq(proof)) {
            Some(self.material.key)
        } else {
            None
        }
    }
}

/// Server half of the exchange. Lives next to the initiator so both halves
/// share one derivation; the in-process responder drives it in tests.
pub struct ResponderExchange {
    identity: String,
    digest: [u8; 32],
    server_nonce: [u8; NONCE_LEN],
    material: Option<Material>,
}

impl ResponderExchange {
    pub fn new(identity: impl Into<String>, secret: &str) -> Self {
        let identity = identity.into();
        let digest = secret_digest(&identity, secret);
        let mut server_nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut server_nonce);
        Self {
            identity,
            digest,
            server_nonce,
            material: None,
        }
    }

    pub fn server_nonce(&self) -> [u8; NONCE_LEN] {
        self.server_nonce
    }

    /// Processes the initiator's identity and public value; returns the salt
    /// and responder public value for the next server step, or `None` when
    /// the identity is unknown or the public value malformed.
    pub fn accept(
        &mut self,
        identity: &[u8],
        initiator_public: &[u8],
    ) -> Option<([u8; SALT_LEN], [u8; PUBLIC_LEN])> {
        if identity != self.identity.as_bytes() || initiator_public.len() != PUBLIC_LEN {
            return None;
        }
        let mut their_public = [0u8; PUBLIC_LEN];
        their_public.copy_from_slice(initiator_public);

        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let ephemeral = EphemeralSecret::random();
        let public = PublicKey::from(&ephemeral).to_bytes();
        let shared = ephemeral.diffie_hellman(&PublicKey::from(their_public));
        self.material = Some(derive(
            &self.digest,
            shared.as_bytes(),
            &salt,
            &their_public,
            &public,
            &self.server_nonce,
        ));
        Some((salt, public))
    }

    /// Constant-time check of the initiator proof; success yields the
    /// session key and the responder's closing proof.
    pub fn verify_initiator(self, proof: &[u8]) -> Option<(SessionKey, [u8; PROOF_LEN])> {
        let material = self.material?;
        if bool::from(material.initiator_proof.as_slice().ct_eq(proof)) {
            Some((material.key, material.responder_proof))
        } else {
            None
        }
    }
}
