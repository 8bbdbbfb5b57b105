//! State shared between the two loops and the facade: three monotonic flags
//! and the one-shot cipher slot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::crypto::FrameCipher;

/// Session lifecycle as broadcast to `secure_connection` waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionStatus {
    Idle,
    Pending,
    Established,
    Failed,
}

pub(crate) struct Shared {
    /// True while application sends must be refused. Secured mode starts
    /// true; cleared at establishment; re-set on host-dead and disposal.
    throw_on_send: AtomicBool,
    /// Latched when heartbeat liveness fails. Never clears.
    host_dead: AtomicBool,
    disposed: AtomicBool,
    /// Written once per session by the dispatch loop, read by the wire loop.
    /// The lock supplies the publication barrier.
    cipher: RwLock<Option<Arc<FrameCipher>>>,
}

impl Shared {
    pub fn new(secured: bool) -> Self {
        Self {
            throw_on_send: AtomicBool::new(secured),
            host_dead: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            cipher: RwLock::new(None),
        }
    }

    pub fn throw_on_send(&self) -> bool {
        self.throw_on_send.load(Ordering::Acquire)
    }

    pub fn set_throw_on_send(&self, value: bool) {
        self.throw_on_send.store(value, Ordering::Release);
    }

    pub fn host_dead(&self) -> bool {
        self.host_dead.load(Ordering::Acquire)
    }

    pub fn latch_host_dead(&self) {
        self.host_dead.store(true, Ordering::Release);
        self.set_throw_on_send(true);
    }

    pub fn disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Returns true exactly once, for the caller that performs the teardown.
    pub fn mark_disposed(&self) -> bool {
        !self.disposed.swap(true, Ordering::AcqRel)
    }

    pub fn cipher(&self) -> Option<Arc<FrameCipher>> {
        self.cipher.read().clone()
    }

    pub fn cipher_installed(&self) -> bool {
        self.cipher.read().is_some()
    }

    pub fn install_cipher(&self, cipher: Arc<FrameCipher>) {
        *self.cipher.write() = Some(cipher);
    }

    /// Clears the slot when a fresh handshake begins.
    pub fn reset_cipher(&self) {
        *self.cipher.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{SessionKey, KEY_LEN};

    #[test]
    fn secured_mode_starts_gated() {
        assert!(Shared::new(true).throw_on_send());
        assert!(!Shared::new(false).throw_on_send());
    }

    #[test]
    fn dispose_is_first_caller_wins() {
        let shared = Shared::new(true);
        assert!(shared.mark_disposed());
        assert!(!shared.mark_disposed());
        assert!(shared.disposed());
    }

    #[test]
    fn host_dead_latch_gates_sends() {
        let shared = Shared::new(false);
        assert!(!shared.host_dead());
        shared.latch_host_dead();
        assert!(shared.host_dead());
        assert!(shared.throw_on_send());
    }

    #[test]
    fn cipher_slot_round_trips() {
        let shared = Shared::new(true);
        assert!(!shared.cipher_installed());
        shared.install_cipher(Arc::new(FrameCipher::new(&SessionKey::new([1u8; KEY_LEN]))));
        assert!(shared.cipher_installed());
        assert!(shared.cipher().is_some());
        shared.reset_cipher();
        assert!(!shared.cipher_installed());
    }
}
