//! Shared plumbing for the command line front-ends:
//! textual query parsing
//! and (behind the `tls` feature) option groups
//! which build `rustls` configurations from PEM files.

pub mod query;

#[cfg(feature = "tls")]
pub mod tls;
