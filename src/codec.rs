//! Wire vocabulary: the byte patterns that classify a multipart message as
//! handshake control, heartbeat, or opaque application payload.

/// Start-of-heading control character opening a handshake header.
pub const SOH: u8 = 0x01;
/// Acknowledge control character at byte 1 of a handshake header.
pub const ACK: u8 = 0x06;
/// Bell control character closing a handshake header.
pub const BEL: u8 = 0x07;

/// Liveness sentinel carried as the sole frame of a heartbeat message
/// (SOH ENQ ENQ BEL). Byte 1 is not ACK, so the sentinel can never parse as
/// a handshake-control header.
pub const HEARTBEAT: [u8; 4] = [0x01, 0x05, 0x05, 0x07];

/// Client header byte opening the exchange.
pub const CLIENT_HELLO: u8 = 0x20;
/// Client header byte carrying the identity and ephemeral public value.
pub const CLIENT_EXCHANGE: u8 = 0x21;
/// Client header byte carrying the initiator proof.
pub const CLIENT_PROOF: u8 = 0x22;

/// Server-emitted handshake phases. Step messages drive the client forward,
/// Fail messages abort one step, Fatal aborts the whole exchange. The byte
/// values are shared with the server and opaque to everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Step0,
    Step1,
    Step2,
    Fail0,
    Fail1,
    Fail2,
    Fatal,
}

impl Phase {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x10 => Some(Phase::Step0),
            0x11 => Some(Phase::Step1),
            0x12 => Some(Phase::Step2),
            0x90 => Some(Phase::Fail0),
            0x91 => Some(Phase::Fail1),
            0x92 => Some(Phase::Fail2),
            0x9f => Some(Phase::Fatal),
            _ => None,
        }
    }

    pub fn byte(self) -> u8 {
        match self {
            Phase::Step0 => 0x10,
            Phase::Step1 => 0x11,
            Phase::Step2 => 0x12,
            Phase::Fail0 => 0x90,
            Phase::Fail1 => 0x91,
            Phase::Fail2 => 0x92,
            Phase::Fatal => 0x9f,
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, Phase::Fail0 | Phase::Fail1 | Phase::Fail2 | Phase::Fatal)
    }
}

/// Builds the 4-byte control header for the given phase byte.
pub fn header(phase: u8) -> Vec<u8> {
    vec![SOH, ACK, phase, BEL]
}

/// True iff `frames` is a server handshake reply: 2 or 3 frames, a 4-byte
/// leading frame with SOH/ACK/BEL at bytes 0, 1, 3 and a known server phase
/// at byte 2.
pub fn is_handshake_reply(frames: &[Vec<u8>]) -> bool {
    if frames.len() != 2 && frames.len() != 3 {
        return false;
    }
    let head = &frames[0];
    head.len() == 4
        && head[0] == SOH
        && head[1] == ACK
        && head[3] == BEL
        && Phase::from_byte(head[2]).is_some()
}

/// Extracts the server phase of a handshake reply, if `frames` is one.
pub fn reply_phase(frames: &[Vec<u8>]) -> Option<Phase> {
    if !is_handshake_reply(frames) {
        return None;
    }
    Phase::from_byte(frames[0][2])
}

/// True iff the leading frame is the heartbeat sentinel.
pub fn is_heartbeat(frames: &[Vec<u8>]) -> bool {
    frames
        .first()
        .map(|frame| frame.as_slice() == HEARTBEAT)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVER_PHASES: [u8; 7] = [0x10, 0x11, 0x12, 0x90, 0x91, 0x92, 0x9f];

    #[test]
    fn accepts_every_server_phase() {
        for phase in SERVER_PHASES {
            let frames = vec![header(phase), vec![0u8; 32]];
            assert!(is_handshake_reply(&frames), "phase {phase:#04x}");
            assert_eq!(reply_phase(&frames), Phase::from_byte(phase));
        }
    }

    #[test]
    fn rejects_client_headers_and_unknown_phases() {
        for phase in [CLIENT_HELLO, CLIENT_EXCHANGE, CLIENT_PROOF, 0x00, 0xff] {
            let frames = vec![header(phase), vec![1, 2, 3]];
            assert!(!is_handshake_reply(&frames));
        }
    }

    #[test]
    fn rejects_wrong_frame_counts() {
        let head = header(Phase::Step0.byte());
        assert!(!is_handshake_reply(&[head.clone()]));
        assert!(!is_handshake_reply(&[
            head.clone(),
            vec![1],
            vec![2],
            vec![3]
        ]));
        assert!(is_handshake_reply(&[head.clone(), vec![1]]));
        assert!(is_handshake_reply(&[head, vec![1], vec![2]]));
    }

    #[test]
    fn rejects_malformed_heads() {
        assert!(!is_handshake_reply(&[vec![SOH, ACK, 0x10], vec![1]]));
        assert!(!is_handshake_reply(&[vec![SOH, ACK, 0x10, BEL, 0], vec![1]]));
        assert!(!is_handshake_reply(&[vec![0x02, ACK, 0x10, BEL], vec![1]]));
        assert!(!is_handshake_reply(&[vec![SOH, 0x05, 0x10, BEL], vec![1]]));
        assert!(!is_handshake_reply(&[vec![SOH, ACK, 0x10, 0x08], vec![1]]));
    }

    #[test]
    fn heartbeat_sentinel_is_not_a_handshake_header() {
        let frames = vec![HEARTBEAT.to_vec()];
        assert!(is_heartbeat(&frames));
        assert!(!is_handshake_reply(&frames));
        assert!(!is_heartbeat(&[vec![0x01, 0x05, 0x05]]));
        assert!(!is_heartbeat(&[]));
    }
}
