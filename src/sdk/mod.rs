//! SDK surface wrapping the loops and queues with an ergonomic client
//! facade. Documented guarantees on [`client::WireClient`] are canonical
//! for higher-level behavior: lifecycle, readiness gating, event delivery,
//! and disposal.

pub mod client;

pub use client::{ClientError, ClientOptions, WireClient};
