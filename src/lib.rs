//! # Crossbear
//! Distributed detection of TLS man-in-the-middle attacks.
//!
//! Clients submit the certificate chain they observe at a host; the
//! server compares it with its own view, the observation history and a
//! Convergence-style notary, and answers with a weighted judgment. When
//! the views disagree and nobody can corroborate either one, the server
//! issues a hunting task and hunters all over the network observe the
//! target and trace the route to it, localizing the attacker.
//!
//! The main components include:
//! - Messaging: the typed, length-prefixed wire protocol and its codec
//! - Cert: chain validation, chain identities, raw ASN.1 name matching
//! - Judge: the weighted judgment engine and notary corroboration
//! - Hunt: task issuance, reply validation, hunter execution, traces
//! - Store: the persistence boundary with an in-memory implementation
//! - Verify: the end-to-end certificate verification pipeline
//! - Transport: the certificate-pinned TLS client boundary
pub mod config;
pub mod error;

pub mod cert;
pub mod hunt;
pub mod judge;
pub mod messaging;
pub mod store;
pub mod transport;
pub mod utils;
pub mod verify;

pub use error::{CrossbearError, Result};
pub use messaging::{Message, MessageCodec};
pub use verify::VerifyProcessor;
