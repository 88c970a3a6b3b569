//! Association requestor module
//!
//! The module provides an abstraction for a DICOM association
//! in which this application entity requests an association
//! with a remote node.
//! See [`ClientAssociationOptions`]
//! for details and examples on how to create an association.
use std::borrow::Cow;
use std::net::SocketAddr;

use snafu::{ensure, ResultExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::machine::{Event, Role};
use crate::pdu::{
    AssociationAC, AssociationRQ, Pdu, PresentationContextNegotiated, PresentationContextProposed,
    PresentationContextResultReason, RoleSelection, UserIdentity, UserVariableItem,
    DEFAULT_MAX_PDU,
};
use crate::transport;
use crate::{AeAddr, IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

use super::negotiation::{find_role_selection, peer_max_pdu_length, resolve_roles, trim_uid};
use super::pdata::{PDataReader, PDataWriter};
use super::{
    AbortedSnafu, Association, AsyncAssociation, Channel, ConnectSnafu,
    MissingAbstractSyntaxSnafu, NegotiatedOptions, NoAcceptedPresentationContextsSnafu,
    ProtocolVersionMismatchSnafu, RejectedSnafu, Result, TimerKind, TimerOptions,
    UnexpectedPduSnafu, UnknownPduSnafu,
};

/// A DICOM association builder for a client node.
/// The final outcome is a [`ClientAssociation`].
///
/// This is the standard way of requesting and establishing
/// an association with another DICOM node,
/// that one usually taking the role of a service class provider (SCP).
///
/// # Example
///
/// ```no_run
/// # use netdicom_ul::association::client::ClientAssociationOptions;
/// # use netdicom_ul::association::AsyncAssociation;
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut association = ClientAssociationOptions::new()
///     .with_abstract_syntax("1.2.840.10008.1.1")
///     .establish("129.168.0.5:104")
///     .await?;
/// association.release().await?;
/// # Ok(())
/// # }
/// ```
///
/// When no transfer syntaxes are provided for a presentation context,
/// the standard set of uncompressed syntaxes is proposed:
/// _Implicit VR Little Endian_,
/// _Explicit VR Little Endian_,
/// _Deflated Explicit VR Little Endian_
/// and _Explicit VR Big Endian_.
#[derive(Debug, Clone)]
pub struct ClientAssociationOptions<'a> {
    /// the calling AE title
    calling_ae_title: Cow<'a, str>,
    /// the called AE title
    called_ae_title: Cow<'a, str>,
    /// the requested application context name
    application_context_name: Cow<'a, str>,
    /// the presentation contexts to propose:
    /// an abstract syntax each, with an optional dedicated
    /// transfer syntax list
    presentation_contexts: Vec<(Cow<'a, str>, Vec<Cow<'a, str>>)>,
    /// the transfer syntaxes proposed for contexts without a dedicated list
    transfer_syntax_uids: Vec<Cow<'a, str>>,
    /// the role selections to propose, per SOP class
    role_selections: Vec<RoleSelection>,
    /// the user identity to negotiate, if any
    user_identity: Option<UserIdentity>,
    /// the asynchronous operations window to propose, if any
    async_ops_window: Option<(u16, u16)>,
    /// SOP class extended negotiation items to propose
    sop_class_extended: Vec<(Cow<'a, str>, Vec<u8>)>,
    /// the expected protocol version
    protocol_version: u16,
    /// the maximum PDU length that this node accepts
    max_pdu_length: u32,
    /// whether to receive PDUs in strict mode
    strict: bool,
    /// the local address to bind the socket to, if any
    bind_addr: Option<SocketAddr>,
    /// the timer configuration
    timers: TimerOptions,
    /// TLS configuration for the connection
    #[cfg(feature = "tls")]
    tls_config: Option<std::sync::Arc<rustls::ClientConfig>>,
}

impl Default for ClientAssociationOptions<'_> {
    fn default() -> Self {
        ClientAssociationOptions {
            calling_ae_title: "THIS-SCU".into(),
            called_ae_title: "ANY-SCP".into(),
            application_context_name: "1.2.840.10008.3.1.1.1".into(),
            presentation_contexts: Vec::new(),
            transfer_syntax_uids: Vec::new(),
            role_selections: Vec::new(),
            user_identity: None,
            async_ops_window: None,
            sop_class_extended: Vec::new(),
            protocol_version: 1,
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            bind_addr: None,
            timers: TimerOptions::default(),
            #[cfg(feature = "tls")]
            tls_config: None,
        }
    }
}

impl<'a> ClientAssociationOptions<'a> {
    /// Create a new set of options for establishing an association.
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the calling application entity title for the association,
    /// which refers to this DICOM node.
    ///
    /// The default is `THIS-SCU`.
    pub fn calling_ae_title<T>(mut self, calling_ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.calling_ae_title = calling_ae_title.into();
        self
    }

    /// Define the called application entity title for the association,
    /// which refers to the target DICOM node.
    ///
    /// The default is `ANY-SCP`.
    pub fn called_ae_title<T>(mut self, called_ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.called_ae_title = called_ae_title.into();
        self
    }

    /// Propose a presentation context with the given abstract syntax
    /// and the common transfer syntax list
    /// (see [`with_transfer_syntax`](Self::with_transfer_syntax)).
    pub fn with_abstract_syntax<T>(mut self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.presentation_contexts
            .push((trim_uid(abstract_syntax_uid.into()), Vec::new()));
        self
    }

    /// Propose a presentation context with the given abstract syntax
    /// and its own dedicated transfer syntax list.
    pub fn with_presentation_context<T, U>(
        mut self,
        abstract_syntax_uid: T,
        transfer_syntax_uids: Vec<U>,
    ) -> Self
    where
        T: Into<Cow<'a, str>>,
        U: Into<Cow<'a, str>>,
    {
        self.presentation_contexts.push((
            trim_uid(abstract_syntax_uid.into()),
            transfer_syntax_uids
                .into_iter()
                .map(|ts| trim_uid(ts.into()))
                .collect(),
        ));
        self
    }

    /// Include this transfer syntax in every proposed presentation context
    /// which does not carry a dedicated transfer syntax list.
    pub fn with_transfer_syntax<T>(mut self, transfer_syntax_uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.transfer_syntax_uids
            .push(trim_uid(transfer_syntax_uid.into()));
        self
    }

    /// Propose SCU/SCP roles for the given SOP class.
    pub fn with_role_selection<T>(mut self, sop_class_uid: T, scu: bool, scp: bool) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.role_selections.push(RoleSelection {
            sop_class_uid: trim_uid(sop_class_uid.into()).to_string(),
            scu_role: scu,
            scp_role: scp,
        });
        self
    }

    /// Negotiate a user identity with the acceptor.
    pub fn user_identity(mut self, identity: UserIdentity) -> Self {
        self.user_identity = Some(identity);
        self
    }

    /// Propose an asynchronous operations window:
    /// the maximum number of operations invoked and performed.
    pub fn async_ops_window(mut self, invoked: u16, performed: u16) -> Self {
        self.async_ops_window = Some((invoked, performed));
        self
    }

    /// Attach SOP class extended negotiation information
    /// for the given SOP class.
    pub fn with_sop_class_extended<T>(mut self, sop_class_uid: T, info: Vec<u8>) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.sop_class_extended
            .push((trim_uid(sop_class_uid.into()), info));
        self
    }

    /// Override the maximum PDU length that this node accepts.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Override strict mode:
    /// whether inbound PDUs may not surpass
    /// the negotiated maximum PDU length.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Bind the outbound socket to the given local address.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    /// Replace the whole timer configuration.
    pub fn timers(mut self, timers: TimerOptions) -> Self {
        self.timers = timers;
        self
    }

    /// Bound the opening of the TCP connection.
    pub fn connection_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timers.connection_timeout = Some(timeout);
        self
    }

    /// Bound each association establishment and release step
    /// (the ARTIM timer).
    pub fn acse_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timers.acse_timeout = Some(timeout);
        self
    }

    /// Bound each outstanding DIMSE operation.
    pub fn dimse_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timers.dimse_timeout = Some(timeout);
        self
    }

    /// Bound inactivity on the established association,
    /// reacting as configured by
    /// [`network_timeout_response`](Self::network_timeout_response).
    pub fn network_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timers.network_timeout = Some(timeout);
        self
    }

    /// Choose how an inactivity timeout is resolved:
    /// by aborting (the default) or by an orderly release.
    pub fn network_timeout_response(mut self, response: super::NetworkTimeoutResponse) -> Self {
        self.timers.network_timeout_response = response;
        self
    }

    /// Set the TLS configuration to use
    /// when establishing a secured association
    /// (see [`establish_tls`](Self::establish_tls)).
    #[cfg(feature = "tls")]
    pub fn tls_config(mut self, config: impl Into<std::sync::Arc<rustls::ClientConfig>>) -> Self {
        self.tls_config = Some(config.into());
        self
    }

    /// Initiate the TCP connection and negotiate the association
    /// with the node at the given address.
    pub async fn establish<A>(self, address: A) -> Result<ClientAssociation<TcpStream>>
    where
        A: tokio::net::ToSocketAddrs,
    {
        let socket = transport::connect(
            address,
            self.bind_addr,
            self.timers.connection_timeout,
        )
        .await
        .context(ConnectSnafu)?;
        self.establish_on(socket).await
    }

    /// Initiate the connection and negotiate the association
    /// against an AE address specification
    /// in the form `{ae_title}@{ip}:{port}`.
    ///
    /// The AE title and the port may be omitted
    /// (see [`AeAddr`]);
    /// without an AE title, the configured called AE title stands.
    /// Text which is not an AE address is handed to the resolver
    /// as a plain socket address.
    pub async fn establish_with(self, ae_address: &str) -> Result<ClientAssociation<TcpStream>> {
        match ae_address.parse::<AeAddr>() {
            Ok(target) => {
                let options = match target.ae_title() {
                    Some(title) => self.called_ae_title(title.to_string()),
                    None => self,
                };
                options.establish(target.socket_addr()).await
            }
            Err(_) => self.establish(ae_address).await,
        }
    }

    /// Initiate a TLS-secured connection
    /// and negotiate the association.
    ///
    /// The server certificate is verified against `domain`.
    #[cfg(feature = "tls")]
    pub async fn establish_tls(
        self,
        address: impl tokio::net::ToSocketAddrs,
        domain: &str,
    ) -> Result<ClientAssociation<transport::tls::ClientTlsStream>> {
        let tls_config = self
            .tls_config
            .clone()
            .ok_or_else(|| super::TlsConfigMissingSnafu.build())?;
        let socket = transport::connect(
            address,
            self.bind_addr,
            self.timers.connection_timeout,
        )
        .await
        .context(ConnectSnafu)?;
        let stream = transport::tls::wrap_client(socket, tls_config, domain)
            .await
            .context(super::TlsSnafu)?;
        self.establish_on(stream).await
    }

    /// Negotiate an association over an already opened stream.
    pub async fn establish_on<S>(self, socket: S) -> Result<ClientAssociation<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let ClientAssociationOptions {
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            transfer_syntax_uids,
            role_selections,
            user_identity,
            async_ops_window,
            sop_class_extended,
            protocol_version,
            max_pdu_length,
            strict,
            bind_addr: _,
            timers,
            #[cfg(feature = "tls")]
                tls_config: _,
        } = self;

        // abstract syntaxes represent intent and must not be omitted
        ensure!(!presentation_contexts.is_empty(), MissingAbstractSyntaxSnafu);

        let common_transfer_syntaxes: Vec<String> = if transfer_syntax_uids.is_empty() {
            vec![
                // Implicit VR Little Endian
                "1.2.840.10008.1.2".to_string(),
                // Explicit VR Little Endian
                "1.2.840.10008.1.2.1".to_string(),
                // Deflated Explicit VR Little Endian
                "1.2.840.10008.1.2.1.99".to_string(),
                // Explicit VR Big Endian
                "1.2.840.10008.1.2.2".to_string(),
            ]
        } else {
            transfer_syntax_uids.iter().map(|ts| ts.to_string()).collect()
        };

        let presentation_contexts: Vec<_> = presentation_contexts
            .into_iter()
            .enumerate()
            .map(|(i, (abstract_syntax, dedicated))| PresentationContextProposed {
                // identifiers are odd integers in ascending order
                id: (i as u8) * 2 + 1,
                abstract_syntax: abstract_syntax.to_string(),
                transfer_syntaxes: if dedicated.is_empty() {
                    common_transfer_syntaxes.clone()
                } else {
                    dedicated.iter().map(|ts| ts.to_string()).collect()
                },
            })
            .collect();

        let mut user_variables = vec![
            UserVariableItem::MaxLength(max_pdu_length),
            UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
            UserVariableItem::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
        ];
        if let Some((invoked, performed)) = async_ops_window {
            user_variables.push(UserVariableItem::AsyncOperationsWindow(invoked, performed));
        }
        for role in &role_selections {
            user_variables.push(UserVariableItem::RoleSelection(role.clone()));
        }
        for (sop_class_uid, info) in sop_class_extended {
            user_variables.push(UserVariableItem::SopClassExtendedNegotiationSubItem(
                sop_class_uid.to_string(),
                info,
            ));
        }
        if let Some(identity) = user_identity {
            user_variables.push(UserVariableItem::UserIdentityItem(identity));
        }

        let request = Pdu::AssociationRQ(AssociationRQ {
            protocol_version,
            calling_ae_title: calling_ae_title.to_string(),
            called_ae_title: called_ae_title.to_string(),
            application_context_name: application_context_name.to_string(),
            presentation_contexts: presentation_contexts.clone(),
            user_variables,
        });

        let mut channel = Channel::new(socket, Role::Requestor, max_pdu_length, strict, timers);
        // the connection is already open when the channel is built
        channel.machine().handle(Event::AssociateRequest);
        channel.step(Event::TransportConnected, Some(&request)).await?;

        let acse_timeout = channel.timers().acse_timeout;
        let response = channel.receive_timed(TimerKind::Acse, acse_timeout).await?;

        match response {
            Pdu::AssociationAC(AssociationAC {
                protocol_version: protocol_version_scp,
                application_context_name: _,
                presentation_contexts: presentation_contexts_scp,
                calling_ae_title: _,
                called_ae_title: _,
                user_variables,
            }) => {
                // only bit 0 of the protocol version field is tested
                ensure!(
                    protocol_version_scp & 0x01 == protocol_version & 0x01,
                    ProtocolVersionMismatchSnafu {
                        expected: protocol_version,
                        got: protocol_version_scp,
                    }
                );

                let peer_max = peer_max_pdu_length(&user_variables, DEFAULT_MAX_PDU);

                let negotiated: Vec<_> = presentation_contexts
                    .iter()
                    .map(|proposed| {
                        let result = presentation_contexts_scp
                            .iter()
                            .find(|result| result.id == proposed.id);
                        let (reason, transfer_syntax) = match result {
                            Some(result) => (
                                result.reason.clone(),
                                trim_uid(Cow::from(result.transfer_syntax.as_str())).to_string(),
                            ),
                            // a context the acceptor failed to answer
                            // cannot be used
                            None => (
                                PresentationContextResultReason::NoReason,
                                "1.2.840.10008.1.2".to_string(),
                            ),
                        };

                        let proposed_role = role_selections
                            .iter()
                            .find(|role| role.sop_class_uid == proposed.abstract_syntax);
                        let outcome = resolve_roles(
                            proposed_role,
                            find_role_selection(&user_variables, &proposed.abstract_syntax),
                        );
                        let (local_scu, local_scp) = outcome.requestor_roles();

                        let reason = if outcome
                            == super::negotiation::RoleOutcome::Rejected
                            && reason == PresentationContextResultReason::Acceptance
                        {
                            // the acceptor declined both roles:
                            // the context cannot carry any operation
                            PresentationContextResultReason::UserRejection
                        } else {
                            reason
                        };

                        PresentationContextNegotiated {
                            id: proposed.id,
                            reason,
                            transfer_syntax,
                            abstract_syntax: proposed.abstract_syntax.clone(),
                            local_scu,
                            local_scp,
                        }
                    })
                    .collect();

                ensure!(
                    negotiated.iter().any(|pc| pc.is_accepted()),
                    NoAcceptedPresentationContextsSnafu
                );

                debug!(
                    "association established with {} ({} context(s) accepted)",
                    calling_ae_title,
                    negotiated.iter().filter(|pc| pc.is_accepted()).count()
                );

                channel.set_negotiated(NegotiatedOptions {
                    peer_max_pdu_length: peer_max,
                    user_variables,
                    presentation_contexts: negotiated,
                    peer_ae_title: called_ae_title.to_string(),
                });

                Ok(ClientAssociation { channel })
            }
            Pdu::AssociationRJ(association_rj) => RejectedSnafu { association_rj }.fail(),
            Pdu::AbortRQ { source } => AbortedSnafu { source_info: source }.fail(),
            pdu @ Pdu::Unknown { .. } => UnknownPduSnafu { pdu: Box::new(pdu) }.fail(),
            pdu => UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail(),
        }
    }
}

/// A DICOM upper level association from the perspective
/// of a requesting application entity.
///
/// The most common operations of an established association are
/// [`send`](AsyncAssociation::send)
/// and [`receive`](AsyncAssociation::receive).
/// Sending large P-Data fragments may be easier through the P-Data sender
/// abstraction (see [`send_pdata`](AsyncAssociation::send_pdata)).
///
/// When the value falls out of scope,
/// the underlying TCP connection is shut down
/// without an orderly release;
/// use [`release`](AsyncAssociation::release) for a clean ending.
#[derive(Debug)]
pub struct ClientAssociation<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    channel: Channel<S>,
}

impl<S> Association for ClientAssociation<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
        self.channel.presentation_contexts()
    }

    fn peer_max_pdu_length(&self) -> u32 {
        self.channel.peer_max_pdu_length()
    }

    fn local_max_pdu_length(&self) -> u32 {
        self.channel.local_max_pdu_length()
    }

    fn peer_ae_title(&self) -> &str {
        self.channel.peer_ae_title()
    }

    fn peer_user_variables(&self) -> &[UserVariableItem] {
        self.channel.peer_user_variables()
    }

    fn timers(&self) -> &TimerOptions {
        self.channel.timers()
    }
}

impl<S> AsyncAssociation for ClientAssociation<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn send(&mut self, msg: &Pdu) -> Result<()> {
        self.channel.send(msg).await
    }

    async fn receive(&mut self) -> Result<Pdu> {
        self.channel.receive().await
    }

    async fn release(&mut self) -> Result<()> {
        self.channel.release().await
    }

    async fn abort(&mut self) -> Result<()> {
        self.channel.abort().await
    }

    async fn close(&mut self) -> std::io::Result<()> {
        self.channel.close().await
    }

    async fn receive_timed(
        &mut self,
        timer: TimerKind,
        deadline: Option<std::time::Duration>,
    ) -> Result<Pdu> {
        self.channel.receive_timed(timer, deadline).await
    }

    fn send_pdata(&mut self, presentation_context_id: u8) -> PDataWriter<'_, Self> {
        let peer_max = self.peer_max_pdu_length();
        PDataWriter::new(self, presentation_context_id, peer_max)
    }
}

impl<S> ClientAssociation<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Prepare a reader to consume an incoming data set
    /// on the given presentation context in chunks.
    pub fn receive_pdata(&mut self, presentation_context_id: u8) -> PDataReader<'_, Self> {
        PDataReader::new(
            self,
            presentation_context_id,
            crate::pdu::PDataValueType::Data,
        )
    }
}
