//! Types and methods for speaking the DICOM Upper Layer protocol
//! over TCP, as one or both of an association requestor
//! and an association acceptor.
//!
//! - The [`address`] module
//!   provides an abstraction for compound addresses
//!   referring to application entities in a network.
//! - The [`pdu`] module
//!   provides data structures and a byte-exact codec
//!   for the seven _protocol data unit_ types
//!   and their variable items.
//! - The [`machine`] module
//!   implements the upper layer state machine:
//!   13 states, the full event alphabet,
//!   and a pure transition function suitable for testing by event injection.
//! - The [`transport`] module
//!   owns the raw TCP (and optionally TLS) byte streams.
//! - The [`association`] module
//!   comprises the abstractions for establishing, negotiating,
//!   using and ending associations between application entities.
//!
//! Higher level message semantics (DIMSE) are out of this crate's scope
//! and are built on top of it.
//!
//! ## Features
//! * `tls`: enables secure transport connections through `rustls`.

pub mod address;
pub mod association;
pub mod machine;
pub mod pdu;
pub mod transport;

/// The implementation class UID advertised by this implementation,
/// generated as per the standard, part 5, section B.2.
///
/// This UID may change in future versions,
/// even between patch versions.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.306430544688638500833389544632385752327";

/// The implementation version name advertised by this implementation.
///
/// This name may change in future versions,
/// even between patch versions.
pub const IMPLEMENTATION_VERSION_NAME: &str = "NETDICOM-RS 0.1";

// re-exports

pub use address::AeAddr;
pub use association::client::{ClientAssociation, ClientAssociationOptions};
pub use association::server::{ServerAssociation, ServerAssociationOptions};
pub use association::{Association, AsyncAssociation};
pub use pdu::read_pdu;
pub use pdu::write_pdu;
pub use pdu::Pdu;
