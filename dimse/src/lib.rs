//! DICOM message service element (DIMSE) support
//! on top of the upper layer protocol.
//!
//! This crate turns the P-DATA byte streams of an established association
//! into typed DIMSE messages and back:
//!
//! - The [`commands`] module holds the command set dictionary,
//!   the command field codes
//!   and typed builders for every DIMSE-C and DIMSE-N message.
//! - The [`status`] module classifies the 16-bit status codes.
//! - The [`message`] module assembles incoming presentation data value
//!   fragments into complete messages, per presentation context
//!   and in send order, and fragments outgoing ones.
//! - The [`assoc`] module wraps an established association
//!   with typed send/receive/cancel operations.
//! - The [`service`] module defines the SOP class registry,
//!   the per-event intervention handler traits
//!   and the notification event bus.
//! - The [`scp`] module runs the service provider side:
//!   one reactor task per accepted association,
//!   dispatching requests to the registered handlers.
//! - The [`scu`] module offers ready-made service user operations
//!   (echo, store, find) over a [`DimseAssociation`].
//! - The [`config`] module carries the engine-wide options
//!   with a blessed process default.

pub mod assoc;
pub mod commands;
pub mod config;
pub mod message;
pub mod scp;
pub mod scu;
pub mod service;
pub mod status;

mod error;

pub use assoc::DimseAssociation;
pub use commands::{Command, CommandField, Priority};
pub use config::Config;
pub use error::Error;
pub use message::DimseMessage;
pub use status::{Status, StatusClass};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The transfer syntax under which every command set is encoded,
/// regardless of the presentation context's accepted transfer syntax.
pub const COMMAND_SET_TRANSFER_SYNTAX: &str = "1.2.840.10008.1.2";
