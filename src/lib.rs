//! Secure framed-message transport client.
//!
//! Establishes a mutually-authenticated encrypted session with a remote peer
//! through a challenge-response exchange, then moves opaque byte frames over
//! a dealer-style multipart wire. Wire I/O and application callbacks run on
//! two independent loops joined by bounded queues, so per-frame symmetric
//! work is the only cryptography on the socket path and a slow event handler
//! never stalls the transport.

pub mod codec;
pub mod crypto;
pub mod e2e_common;
pub mod events;
pub mod handshake;
pub mod identity;
pub mod sdk;
pub mod stats;
pub mod transport;

mod dispatch;
mod state;
mod wire;

pub use events::{EventHub, Message, ProtocolFailure, SubscriptionId};
pub use identity::{ClientId, Credentials};
pub use sdk::{ClientError, ClientOptions, WireClient};
pub use stats::WireStats;
pub use transport::{PairSocket, TcpDealerSocket, WireSocket};
