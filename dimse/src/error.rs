//! The error type of the DIMSE layer.

use snafu::{Backtrace, Snafu};

use netdicom_ul::pdu::{AbortRQSource, Pdu};

/// An error in the DIMSE message layer.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum Error {
    /// an upper layer operation failed
    #[snafu(display("upper layer error"))]
    Ul {
        #[snafu(backtrace)]
        source: netdicom_ul::association::Error,
    },

    /// could not bind the service listener
    Bind {
        #[snafu(backtrace)]
        source: netdicom_ul::transport::Error,
    },

    #[snafu(display(
        "presentation context {} was not accepted for this association",
        context_id
    ))]
    UnsupportedContext { context_id: u8, backtrace: Backtrace },

    #[snafu(display("no accepted presentation context for abstract syntax {}", abstract_syntax))]
    NoSuitableContext {
        abstract_syntax: String,
        backtrace: Backtrace,
    },

    #[snafu(display("unknown or undecodable transfer syntax {}", uid))]
    UnknownTransferSyntax { uid: String, backtrace: Backtrace },

    /// failed to encode command set
    EncodeCommand {
        source: Box<dicom_object::WriteError>,
        backtrace: Backtrace,
    },

    /// failed to decode command set
    DecodeCommand {
        source: Box<dicom_object::ReadError>,
        backtrace: Backtrace,
    },

    /// failed to encode data set
    EncodeData {
        source: Box<dicom_object::WriteError>,
        backtrace: Backtrace,
    },

    /// failed to decode data set
    DecodeData {
        source: Box<dicom_object::ReadError>,
        backtrace: Backtrace,
    },

    #[snafu(display("missing required command set field `{}`", name))]
    MissingCommandField {
        name: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("invalid value in command set field `{}`", name))]
    InvalidCommandField {
        name: &'static str,
        source: dicom_core::value::ConvertValueError,
        backtrace: Backtrace,
    },

    #[snafu(display("fragment stream violates message boundaries on context {}", context_id))]
    FragmentOutOfOrder { context_id: u8, backtrace: Backtrace },

    /// the peer requested a release of the association
    Released { backtrace: Backtrace },

    /// the association was aborted
    #[snafu(display("association aborted: {:?}", source_info))]
    Aborted {
        source_info: AbortRQSource,
        backtrace: Backtrace,
    },

    #[snafu(display("unexpected PDU `{}`", pdu.short_description()))]
    UnexpectedPdu { pdu: Box<Pdu>, backtrace: Backtrace },

    #[snafu(display("operation timed out"))]
    OperationTimedOut { backtrace: Backtrace },

    #[snafu(display("unrecognized command field {:#06x}", field))]
    UnrecognizedCommandField { field: u16, backtrace: Backtrace },

    #[snafu(display("service returned non-success status {:#06x}", status))]
    ServiceStatus { status: u16, backtrace: Backtrace },
}

impl From<netdicom_ul::association::Error> for Error {
    fn from(source: netdicom_ul::association::Error) -> Self {
        match source {
            netdicom_ul::association::Error::Aborted { source_info, .. } => {
                AbortedSnafu { source_info }.build()
            }
            netdicom_ul::association::Error::Timeout { .. } => OperationTimedOutSnafu.build(),
            source => Error::Ul { source },
        }
    }
}
