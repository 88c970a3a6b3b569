//! Protocol data unit module
//!
//! This module comprises the data structures
//! representing the seven upper layer protocol data units (PDUs),
//! their variable items and user information sub-items,
//! plus the codec functions [`read_pdu`] and [`write_pdu`].

pub mod reader;
pub mod writer;

pub use reader::read_pdu;
pub use writer::write_pdu;

pub use reader::Error as ReadError;
pub use writer::Error as WriteError;

/// The default maximum PDU size
pub const DEFAULT_MAX_PDU: u32 = 16_384;

/// The minimum PDU size,
/// as specified by the standard
pub const MINIMUM_PDU_SIZE: u32 = 4_096;

/// The maximum PDU size,
/// as specified by the standard
pub const MAXIMUM_PDU_SIZE: u32 = 131_072;

/// The length of the PDU header in bytes,
/// comprising the PDU type (1 byte),
/// reserved byte (1 byte),
/// and PDU length (4 bytes).
pub const PDU_HEADER_SIZE: u32 = 6;

/// A presentation context as proposed by the association requestor:
/// an odd identifier,
/// one abstract syntax
/// and one or more transfer syntaxes in preference order.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PresentationContextProposed {
    /// the presentation context identifier, an odd integer between 1 and 255
    pub id: u8,
    /// the abstract syntax UID
    pub abstract_syntax: String,
    /// the candidate transfer syntax UIDs
    pub transfer_syntaxes: Vec<String>,
}

/// A presentation context result as carried in an A-ASSOCIATE-AC:
/// the outcome for one proposed context.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PresentationContextResult {
    /// the presentation context identifier, matching the proposal
    pub id: u8,
    /// the negotiation outcome
    pub reason: PresentationContextResultReason,
    /// the accepted transfer syntax UID
    /// (not significant unless the outcome is an acceptance)
    pub transfer_syntax: String,
}

/// A fully negotiated presentation context
/// as retained by either end of an established association.
///
/// Unlike [`PresentationContextResult`],
/// this form also records the abstract syntax of the original proposal
/// and the service class roles agreed for the local node.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PresentationContextNegotiated {
    /// the presentation context identifier
    pub id: u8,
    /// the negotiation outcome
    pub reason: PresentationContextResultReason,
    /// the accepted transfer syntax UID
    pub transfer_syntax: String,
    /// the abstract syntax UID from the proposal
    pub abstract_syntax: String,
    /// whether the local node may act as a service class user
    /// on this context
    pub local_scu: bool,
    /// whether the local node may act as a service class provider
    /// on this context
    pub local_scp: bool,
}

impl PresentationContextNegotiated {
    /// Whether the context was accepted by the acceptor.
    pub fn is_accepted(&self) -> bool {
        self.reason == PresentationContextResultReason::Acceptance
    }
}

/// The outcome of the negotiation of a single presentation context.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum PresentationContextResultReason {
    /// the presentation context was accepted
    Acceptance = 0,
    /// the association user rejected the presentation context
    UserRejection = 1,
    /// the provider rejected the presentation context
    /// for unspecified reasons
    NoReason = 2,
    /// the abstract syntax is not supported by the acceptor
    AbstractSyntaxNotSupported = 3,
    /// none of the proposed transfer syntaxes
    /// is supported by the acceptor
    TransferSyntaxesNotSupported = 4,
}

impl PresentationContextResultReason {
    fn from(reason: u8) -> Option<Self> {
        match reason {
            0 => Some(PresentationContextResultReason::Acceptance),
            1 => Some(PresentationContextResultReason::UserRejection),
            2 => Some(PresentationContextResultReason::NoReason),
            3 => Some(PresentationContextResultReason::AbstractSyntaxNotSupported),
            4 => Some(PresentationContextResultReason::TransferSyntaxesNotSupported),
            _ => None,
        }
    }
}

/// The result field of an association rejection.
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJResult {
    /// the rejection is permanent
    Permanent,
    /// the rejection is transient,
    /// such as when the acceptor is temporarily congested
    Transient,
}

impl AssociationRJResult {
    fn from(value: u8) -> Option<Self> {
        match value {
            1 => Some(AssociationRJResult::Permanent),
            2 => Some(AssociationRJResult::Transient),
            _ => None,
        }
    }
}

/// The source and reason of an association rejection.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJSource {
    /// the upper layer service user rejected the association
    ServiceUser(AssociationRJServiceUserReason),
    /// the service provider rejected the association
    /// at the ACSE level
    ServiceProviderAsce(AssociationRJServiceProviderAsceReason),
    /// the service provider rejected the association
    /// at the presentation level
    ServiceProviderPresentation(AssociationRJServiceProviderPresentationReason),
}

impl AssociationRJSource {
    fn from(source: u8, reason: u8) -> Option<Self> {
        match (source, reason) {
            (1, 1) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::NoReasonGiven,
            )),
            (1, 2) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
            )),
            (1, 3) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CallingAETitleNotRecognized,
            )),
            (1, 7) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CalledAETitleNotRecognized,
            )),
            (1, x @ 4..=6) | (1, x @ 8..=10) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::Reserved(x),
            )),
            (2, 1) => Some(AssociationRJSource::ServiceProviderAsce(
                AssociationRJServiceProviderAsceReason::NoReasonGiven,
            )),
            (2, 2) => Some(AssociationRJSource::ServiceProviderAsce(
                AssociationRJServiceProviderAsceReason::ProtocolVersionNotSupported,
            )),
            (3, 1) => Some(AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::TemporaryCongestion,
            )),
            (3, 2) => Some(AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::LocalLimitExceeded,
            )),
            (3, x @ 0) | (3, x @ 3..=7) => Some(AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::Reserved(x),
            )),
            _ => None,
        }
    }
}

/// A rejection reason given by the upper layer service user.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJServiceUserReason {
    /// no reason given
    NoReasonGiven,
    /// the proposed application context name is not supported
    ApplicationContextNameNotSupported,
    /// the calling AE title was not recognized
    CallingAETitleNotRecognized,
    /// the called AE title was not recognized
    CalledAETitleNotRecognized,
    /// a reserved code
    Reserved(u8),
}

/// A rejection reason given by the service provider
/// at the ACSE level.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJServiceProviderAsceReason {
    /// no reason given
    NoReasonGiven,
    /// the proposed protocol version is not supported
    ProtocolVersionNotSupported,
}

/// A rejection reason given by the service provider
/// at the presentation level.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJServiceProviderPresentationReason {
    /// the acceptor is temporarily congested
    TemporaryCongestion,
    /// a local limit (such as the number of concurrent associations)
    /// was exceeded
    LocalLimitExceeded,
    /// a reserved code
    Reserved(u8),
}

/// A single presentation data value fragment.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PDataValue {
    /// the presentation context identifier of the message
    /// this fragment belongs to
    pub presentation_context_id: u8,
    /// whether this fragment carries command set or data set bytes
    pub value_type: PDataValueType,
    /// whether this is the last fragment
    /// of the respective message half
    pub is_last: bool,
    /// the fragment payload
    pub data: Vec<u8>,
}

/// Whether a presentation data value fragment
/// carries command set or data set bytes.
///
/// Command and data fragments are never mixed within a single fragment.
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum PDataValueType {
    /// the fragment carries command set bytes
    Command,
    /// the fragment carries data set bytes
    Data,
}

/// The source (and provider reason) of an A-ABORT.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AbortRQSource {
    /// the abort was initiated by the upper layer service user
    ServiceUser,
    /// the abort was initiated by the upper layer service provider
    ServiceProvider(AbortRQServiceProviderReason),
    /// a reserved source code
    Reserved,
}

impl AbortRQSource {
    fn from(source: u8, reason: u8) -> Option<Self> {
        match (source, reason) {
            (0, _) => Some(AbortRQSource::ServiceUser),
            (1, _) => Some(AbortRQSource::Reserved),
            (2, 0) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::ReasonNotSpecified,
            )),
            (2, 1) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnrecognizedPdu,
            )),
            (2, 2) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnexpectedPdu,
            )),
            (2, 3) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::Reserved,
            )),
            (2, 4) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnrecognizedPduParameter,
            )),
            (2, 5) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnexpectedPduParameter,
            )),
            (2, 6) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::InvalidPduParameter,
            )),
            _ => None,
        }
    }
}

/// The reason of a provider initiated A-ABORT.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AbortRQServiceProviderReason {
    /// no particular reason specified
    ReasonNotSpecified,
    /// a PDU of an unrecognized type was received
    UnrecognizedPdu,
    /// a PDU was received at a point of the association lifecycle
    /// at which it is not permitted
    UnexpectedPdu,
    /// a reserved code
    Reserved,
    /// a PDU parameter was not recognized
    UnrecognizedPduParameter,
    /// a PDU parameter was not expected
    UnexpectedPduParameter,
    /// a PDU parameter has an invalid value
    InvalidPduParameter,
}

/// An identified variable item of an A-ASSOCIATE-RQ/AC PDU.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum PduVariableItem {
    /// an unrecognized variable item
    Unknown(u8),
    /// the application context name item
    ApplicationContext(String),
    /// a proposed presentation context item
    PresentationContextProposed(PresentationContextProposed),
    /// a presentation context result item
    PresentationContextResult(PresentationContextResult),
    /// the user information item
    UserVariables(Vec<UserVariableItem>),
}

/// The kind of user identity being negotiated.
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum UserIdentityType {
    /// a username alone
    Username = 1,
    /// a username and a password
    UsernameAndPassword = 2,
    /// a Kerberos service ticket
    KerberosServiceTicket = 3,
    /// a SAML assertion
    SamlAssertion = 4,
    /// a JSON web token
    Jwt = 5,
}

impl UserIdentityType {
    fn from(value: u8) -> Option<Self> {
        match value {
            1 => Some(UserIdentityType::Username),
            2 => Some(UserIdentityType::UsernameAndPassword),
            3 => Some(UserIdentityType::KerberosServiceTicket),
            4 => Some(UserIdentityType::SamlAssertion),
            5 => Some(UserIdentityType::Jwt),
            _ => None,
        }
    }
}

/// A user identity negotiation request,
/// as carried in the user information item of an A-ASSOCIATE-RQ.
///
/// The primary and secondary fields are opaque to this layer:
/// their semantics depend on the identity type
/// and credential validation is up to the application.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct UserIdentity {
    /// whether a positive server response was requested
    positive_response_requested: bool,
    /// the kind of identity carried
    identity_type: UserIdentityType,
    /// the primary credential field (e.g. the username)
    primary_field: Vec<u8>,
    /// the secondary credential field
    /// (only non-empty for username-and-password identities)
    secondary_field: Vec<u8>,
}

impl UserIdentity {
    /// Create a new user identity negotiation request.
    pub fn new(
        positive_response_requested: bool,
        identity_type: UserIdentityType,
        primary_field: Vec<u8>,
        secondary_field: Vec<u8>,
    ) -> Self {
        UserIdentity {
            positive_response_requested,
            identity_type,
            primary_field,
            secondary_field,
        }
    }

    /// Whether a positive server response was requested.
    pub fn positive_response_requested(&self) -> bool {
        self.positive_response_requested
    }

    /// The kind of identity carried.
    pub fn identity_type(&self) -> UserIdentityType {
        self.identity_type
    }

    /// The primary credential field.
    pub fn primary_field(&self) -> &[u8] {
        &self.primary_field
    }

    /// The secondary credential field.
    pub fn secondary_field(&self) -> &[u8] {
        &self.secondary_field
    }
}

/// An SCP/SCU role selection item for one SOP class,
/// as proposed by the requestor or answered by the acceptor.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct RoleSelection {
    /// the SOP class (abstract syntax) UID this selection applies to
    pub sop_class_uid: String,
    /// whether the emitting node proposes (or accepts) the SCU role
    pub scu_role: bool,
    /// whether the emitting node proposes (or accepts) the SCP role
    pub scp_role: bool,
}

/// An SOP class common extended negotiation item.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct SopClassCommonExtended {
    /// the SOP class UID
    pub sop_class_uid: String,
    /// the related service class UID
    pub service_class_uid: String,
    /// UIDs of related general SOP classes
    pub related_general_sop_classes: Vec<String>,
}

/// An identified sub-item of the user information variable item.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum UserVariableItem {
    /// an unrecognized sub-item, kept as an opaque blob
    /// so that it can round-trip through re-encoding
    Unknown(u8, Vec<u8>),
    /// the maximum length sub-item (`0` means unlimited)
    MaxLength(u32),
    /// the implementation class UID sub-item
    ImplementationClassUID(String),
    /// the implementation version name sub-item
    ImplementationVersionName(String),
    /// the asynchronous operations window sub-item:
    /// maximum number of operations invoked and performed
    AsyncOperationsWindow(u16, u16),
    /// an SCP/SCU role selection sub-item
    RoleSelection(RoleSelection),
    /// an SOP class extended negotiation sub-item:
    /// SOP class UID and opaque service class application information
    SopClassExtendedNegotiationSubItem(String, Vec<u8>),
    /// an SOP class common extended negotiation sub-item
    SopClassCommonExtendedNegotiationSubItem(SopClassCommonExtended),
    /// a user identity negotiation request sub-item
    UserIdentityItem(UserIdentity),
    /// a user identity negotiation response sub-item,
    /// carrying the opaque server response
    UserIdentityResponseItem(Vec<u8>),
}

/// An A-ASSOCIATE-RQ PDU.
#[derive(Debug, Clone, PartialEq)]
pub struct AssociationRQ {
    /// the protocol version bit field (bit 0 identifies version 1)
    pub protocol_version: u16,
    /// the application entity title of the requesting node
    pub calling_ae_title: String,
    /// the application entity title of the destination node
    pub called_ae_title: String,
    /// the application context name proposed
    pub application_context_name: String,
    /// the proposed presentation contexts
    pub presentation_contexts: Vec<PresentationContextProposed>,
    /// the user information sub-items
    pub user_variables: Vec<UserVariableItem>,
}

impl From<AssociationRQ> for Pdu {
    fn from(value: AssociationRQ) -> Self {
        Pdu::AssociationRQ(value)
    }
}

/// An A-ASSOCIATE-AC PDU.
#[derive(Debug, Clone, PartialEq)]
pub struct AssociationAC {
    /// the protocol version bit field (bit 0 identifies version 1)
    pub protocol_version: u16,
    /// reserved field echoing the calling AE title,
    /// not to be tested on receipt
    pub calling_ae_title: String,
    /// reserved field echoing the called AE title,
    /// not to be tested on receipt
    pub called_ae_title: String,
    /// the application context name in effect
    pub application_context_name: String,
    /// the presentation context results, one per proposed context
    pub presentation_contexts: Vec<PresentationContextResult>,
    /// the user information sub-items
    pub user_variables: Vec<UserVariableItem>,
}

impl From<AssociationAC> for Pdu {
    fn from(value: AssociationAC) -> Self {
        Pdu::AssociationAC(value)
    }
}

/// An A-ASSOCIATE-RJ PDU.
#[derive(Debug, Clone, PartialEq)]
pub struct AssociationRJ {
    /// whether the rejection is permanent or transient
    pub result: AssociationRJResult,
    /// the source and reason of the rejection
    pub source: AssociationRJSource,
}

impl From<AssociationRJ> for Pdu {
    fn from(value: AssociationRJ) -> Self {
        Pdu::AssociationRJ(value)
    }
}

/// A DICOM upper layer protocol data unit.
#[derive(Debug, Clone, PartialEq)]
pub enum Pdu {
    /// a PDU of an unrecognized type, kept as raw bytes
    Unknown {
        /// the PDU type code found on the wire
        pdu_type: u8,
        /// the PDU payload
        data: Vec<u8>,
    },
    /// A-ASSOCIATE-RQ (type `0x01`)
    AssociationRQ(AssociationRQ),
    /// A-ASSOCIATE-AC (type `0x02`)
    AssociationAC(AssociationAC),
    /// A-ASSOCIATE-RJ (type `0x03`)
    AssociationRJ(AssociationRJ),
    /// P-DATA-TF (type `0x04`)
    PData {
        /// the presentation data value fragments
        data: Vec<PDataValue>,
    },
    /// A-RELEASE-RQ (type `0x05`)
    ReleaseRQ,
    /// A-RELEASE-RP (type `0x06`)
    ReleaseRP,
    /// A-ABORT (type `0x07`)
    AbortRQ {
        /// the source (and reason) of the abort
        source: AbortRQSource,
    },
}

impl Pdu {
    /// Provide a short description of the PDU,
    /// for logging purposes.
    pub fn short_description(&self) -> impl std::fmt::Display + '_ {
        PduShortDescription(self)
    }
}

struct PduShortDescription<'a>(&'a Pdu);

impl std::fmt::Display for PduShortDescription<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Pdu::Unknown { pdu_type, data } => {
                write!(f, "Unknown[type = {:#04x}, {} bytes]", pdu_type, data.len())
            }
            Pdu::AssociationRQ(AssociationRQ {
                calling_ae_title,
                called_ae_title,
                presentation_contexts,
                ..
            }) => write!(
                f,
                "AssociationRQ[{} -> {}, {} presentation contexts]",
                calling_ae_title,
                called_ae_title,
                presentation_contexts.len()
            ),
            Pdu::AssociationAC(AssociationAC {
                presentation_contexts,
                ..
            }) => write!(
                f,
                "AssociationAC[{} presentation contexts]",
                presentation_contexts.len()
            ),
            Pdu::AssociationRJ(AssociationRJ { result, .. }) => {
                write!(f, "AssociationRJ[{:?}]", result)
            }
            Pdu::PData { data } => {
                let bytes: usize = data.iter().map(|pdv| pdv.data.len()).sum();
                write!(f, "PData[{} values, {} bytes]", data.len(), bytes)
            }
            Pdu::ReleaseRQ => f.write_str("ReleaseRQ"),
            Pdu::ReleaseRP => f.write_str("ReleaseRP"),
            Pdu::AbortRQ { source } => write!(f, "AbortRQ[{:?}]", source),
        }
    }
}
