//! Association acceptor module
//!
//! The module provides an abstraction for a DICOM association
//! in which this application entity listens to incoming association requests.
//! See [`ServerAssociationOptions`]
//! for details and examples on how to negotiate an association
//! on an accepted socket.
use std::borrow::Cow;

use snafu::ensure;
#[cfg(feature = "tls")]
use snafu::ResultExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::machine::{Event, Role};
use crate::pdu::{
    AbortRQServiceProviderReason, AbortRQSource, AssociationAC, AssociationRJ, AssociationRJResult,
    AssociationRJServiceProviderAsceReason, AssociationRJServiceUserReason, AssociationRJSource,
    AssociationRQ, Pdu, PresentationContextNegotiated, PresentationContextResult, RoleSelection,
    UserIdentity, UserVariableItem, DEFAULT_MAX_PDU,
};
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

use super::negotiation::{
    answer_role_selection, find_role_selection, find_user_identity, negotiate_presentation_context,
    peer_max_pdu_length, resolve_roles, trim_uid, AcceptorPolicy, RoleOutcome,
};
use super::pdata::{PDataReader, PDataWriter};
use super::{
    AbortedSnafu, Association, AsyncAssociation, Channel, Error, MissingAbstractSyntaxSnafu,
    NegotiatedOptions, RejectedSnafu, Result, TimerKind, TimerOptions, UnexpectedPduSnafu,
    UnknownPduSnafu,
};

/// Common interface for application entity access control policies.
///
/// Existing implementations include [`AcceptAny`] and [`AcceptCalledAeTitle`],
/// but users are free to implement their own,
/// including policies which validate the negotiated user identity.
pub trait AccessControl {
    /// Obtain the decision of whether to accept an incoming association
    /// request based on the recorded application entity titles
    /// and/or user identity.
    ///
    /// Returns Ok(()) if the requestor node should be given clearance.
    /// Otherwise, a concrete association RJ service user reason is given.
    fn check_access(
        &self,
        this_ae_title: &str,
        calling_ae_title: &str,
        called_ae_title: &str,
        user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason>;
}

/// An access control rule that accepts any incoming association request.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptAny;

impl AccessControl for AcceptAny {
    fn check_access(
        &self,
        _this_ae_title: &str,
        _calling_ae_title: &str,
        _called_ae_title: &str,
        _user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason> {
        Ok(())
    }
}

/// An access control rule that accepts association requests
/// whose called AE title matches the node's AE title.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptCalledAeTitle;

impl AccessControl for AcceptCalledAeTitle {
    fn check_access(
        &self,
        this_ae_title: &str,
        _calling_ae_title: &str,
        called_ae_title: &str,
        _user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason> {
        if this_ae_title == called_ae_title {
            Ok(())
        } else {
            Err(AssociationRJServiceUserReason::CalledAETitleNotRecognized)
        }
    }
}

/// The acceptor's answer to a user identity negotiation request.
///
/// Credential validation does not belong here:
/// it is an access control concern
/// (see [`AccessControl::check_access`],
/// which receives the identity).
pub trait UserIdentityPolicy {
    /// Decide the response to a user identity request:
    /// `None` accepts silently (no item in the A-ASSOCIATE-AC),
    /// `Some(blob)` acknowledges with the given server response
    /// when the requestor asked for a positive response.
    fn respond(&self, identity: &UserIdentity) -> Option<Vec<u8>>;
}

/// A user identity policy which accepts every identity silently.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptIdentitySilently;

impl UserIdentityPolicy for AcceptIdentitySilently {
    fn respond(&self, _identity: &UserIdentity) -> Option<Vec<u8>> {
        None
    }
}

/// A user identity policy which acknowledges requests
/// asking for a positive response with an empty server response.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcknowledgeIdentity;

impl UserIdentityPolicy for AcknowledgeIdentity {
    fn respond(&self, identity: &UserIdentity) -> Option<Vec<u8>> {
        if identity.positive_response_requested() {
            Some(Vec::new())
        } else {
            None
        }
    }
}

/// A DICOM association builder for an acceptor DICOM node,
/// often taking the role of a service class provider (SCP).
///
/// This is the standard way of negotiating and establishing
/// an association with a requesting node.
/// The outcome is a [`ServerAssociation`].
/// Unlike [`ClientAssociationOptions`],
/// a value of this type can be reused for multiple connections.
///
/// [`ClientAssociationOptions`]: crate::association::client::ClientAssociationOptions
///
/// The SCP will by default accept all transfer syntaxes
/// supported by the main [transfer syntax registry][1],
/// unless one or more transfer syntaxes are explicitly indicated
/// through calls to [`with_transfer_syntax`][2]
/// (which also establishes the acceptor's preference order).
///
/// Access control logic is also available,
/// enabling application entities to decide on
/// whether to accept or reject the association request
/// based on the _called_ and _calling_ AE titles
/// and the negotiated user identity.
///
/// - By default, the application will accept requests from anyone
///   ([`AcceptAny`])
/// - To only accept requests with a matching _called_ AE title,
///   add a call to [`accept_called_ae_title`]
///   ([`AcceptCalledAeTitle`]).
/// - Any other policy can be implemented through the [`AccessControl`] trait.
///
/// [`accept_called_ae_title`]: Self::accept_called_ae_title
///
/// [1]: dicom_transfer_syntax_registry
/// [2]: Self::with_transfer_syntax
///
/// # Example
///
/// Spawn a task for each incoming association request.
///
/// ```no_run
/// # use netdicom_ul::association::server::ServerAssociationOptions;
/// # use netdicom_ul::association::AsyncAssociation;
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let listener = tokio::net::TcpListener::bind("0.0.0.0:11111").await?;
/// loop {
///     let (socket, _addr) = listener.accept().await?;
///     tokio::task::spawn(async move {
///         let mut scp = ServerAssociationOptions::new()
///             .with_abstract_syntax("1.2.840.10008.1.1")
///             .establish(socket)
///             .await
///             .expect("could not establish association on socket");
///         loop {
///             match scp.receive().await {
///                 Ok(netdicom_ul::Pdu::PData { data }) => {
///                     // handle P-Data here
///                 }
///                 Ok(netdicom_ul::Pdu::ReleaseRQ) => {
///                     let _ = scp.send(&netdicom_ul::Pdu::ReleaseRP).await;
///                     break;
///                 }
///                 _ => break,
///             }
///         }
///     });
/// }
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ServerAssociationOptions<'a, A, I = AcceptIdentitySilently> {
    /// the application entity access control policy
    ae_access_control: A,
    /// the user identity negotiation policy
    user_identity_policy: I,
    /// the AE title of this DICOM node
    ae_title: Cow<'a, str>,
    /// the expected application context name
    application_context_name: Cow<'a, str>,
    /// the list of supported abstract syntaxes
    abstract_syntax_uids: Vec<Cow<'a, str>>,
    /// the list of supported transfer syntaxes, in preference order
    transfer_syntax_uids: Vec<Cow<'a, str>>,
    /// the roles this node is willing to take, per SOP class
    /// (`scu_role`/`scp_role` are the local willingness)
    role_selections: Vec<RoleSelection>,
    /// the asynchronous operations window to answer with, if any
    async_ops_window: Option<(u16, u16)>,
    /// SOP class extended negotiation answers, per SOP class
    sop_class_extended: Vec<(Cow<'a, str>, Vec<u8>)>,
    /// the expected protocol version
    protocol_version: u16,
    /// the maximum PDU length that this node accepts
    max_pdu_length: u32,
    /// whether to receive PDUs in strict mode
    strict: bool,
    /// whether to accept unknown abstract syntaxes
    promiscuous: bool,
    /// the timer configuration
    timers: TimerOptions,
    /// TLS configuration for accepted sockets
    #[cfg(feature = "tls")]
    tls_config: Option<std::sync::Arc<rustls::ServerConfig>>,
}

impl Default for ServerAssociationOptions<'_, AcceptAny> {
    fn default() -> Self {
        ServerAssociationOptions {
            ae_access_control: AcceptAny,
            user_identity_policy: AcceptIdentitySilently,
            ae_title: "THIS-SCP".into(),
            application_context_name: "1.2.840.10008.3.1.1.1".into(),
            abstract_syntax_uids: Vec::new(),
            transfer_syntax_uids: Vec::new(),
            role_selections: Vec::new(),
            async_ops_window: None,
            sop_class_extended: Vec::new(),
            protocol_version: 1,
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            promiscuous: false,
            timers: TimerOptions::default(),
            #[cfg(feature = "tls")]
            tls_config: None,
        }
    }
}

impl ServerAssociationOptions<'_, AcceptAny> {
    /// Create a new set of options for accepting an association.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<'a, A, I> ServerAssociationOptions<'a, A, I>
where
    A: AccessControl,
    I: UserIdentityPolicy,
{
    /// Change the access control policy to accept any association
    /// regardless of the specified AE titles.
    ///
    /// This is the default behavior when the options are first created.
    pub fn accept_any(self) -> ServerAssociationOptions<'a, AcceptAny, I> {
        self.ae_access_control(AcceptAny)
    }

    /// Change the access control policy to accept an association
    /// if the called AE title matches this node's AE title.
    pub fn accept_called_ae_title(self) -> ServerAssociationOptions<'a, AcceptCalledAeTitle, I> {
        self.ae_access_control(AcceptCalledAeTitle)
    }

    /// Change the access control policy.
    pub fn ae_access_control<P>(self, access_control: P) -> ServerAssociationOptions<'a, P, I>
    where
        P: AccessControl,
    {
        let ServerAssociationOptions {
            ae_access_control: _,
            user_identity_policy,
            ae_title,
            application_context_name,
            abstract_syntax_uids,
            transfer_syntax_uids,
            role_selections,
            async_ops_window,
            sop_class_extended,
            protocol_version,
            max_pdu_length,
            strict,
            promiscuous,
            timers,
            #[cfg(feature = "tls")]
            tls_config,
        } = self;

        ServerAssociationOptions {
            ae_access_control: access_control,
            user_identity_policy,
            ae_title,
            application_context_name,
            abstract_syntax_uids,
            transfer_syntax_uids,
            role_selections,
            async_ops_window,
            sop_class_extended,
            protocol_version,
            max_pdu_length,
            strict,
            promiscuous,
            timers,
            #[cfg(feature = "tls")]
            tls_config,
        }
    }

    /// Change the user identity negotiation policy.
    ///
    /// The default accepts every identity silently;
    /// see [`AcknowledgeIdentity`] for a policy which confirms
    /// identities when a positive response is requested.
    pub fn user_identity_policy<P>(self, policy: P) -> ServerAssociationOptions<'a, A, P>
    where
        P: UserIdentityPolicy,
    {
        let ServerAssociationOptions {
            ae_access_control,
            user_identity_policy: _,
            ae_title,
            application_context_name,
            abstract_syntax_uids,
            transfer_syntax_uids,
            role_selections,
            async_ops_window,
            sop_class_extended,
            protocol_version,
            max_pdu_length,
            strict,
            promiscuous,
            timers,
            #[cfg(feature = "tls")]
            tls_config,
        } = self;

        ServerAssociationOptions {
            ae_access_control,
            user_identity_policy: policy,
            ae_title,
            application_context_name,
            abstract_syntax_uids,
            transfer_syntax_uids,
            role_selections,
            async_ops_window,
            sop_class_extended,
            protocol_version,
            max_pdu_length,
            strict,
            promiscuous,
            timers,
            #[cfg(feature = "tls")]
            tls_config,
        }
    }

    /// Define the application entity title referring to this DICOM node.
    ///
    /// The default is `THIS-SCP`.
    pub fn ae_title<T>(mut self, ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.ae_title = ae_title.into();
        self
    }

    /// Include this abstract syntax
    /// in the list of services supported by this node.
    pub fn with_abstract_syntax<T>(mut self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.abstract_syntax_uids
            .push(trim_uid(abstract_syntax_uid.into()));
        self
    }

    /// Include this transfer syntax
    /// in the list of transfer syntaxes accepted by this node.
    ///
    /// The call order establishes the preference order
    /// applied during negotiation.
    pub fn with_transfer_syntax<T>(mut self, transfer_syntax_uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.transfer_syntax_uids
            .push(trim_uid(transfer_syntax_uid.into()));
        self
    }

    /// Declare the roles this node is willing to take
    /// for the given SOP class,
    /// answered when the requestor proposes role selection.
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

    /// Answer asynchronous operations window proposals
    /// with the given maximum numbers of operations
    /// invoked and performed.
    pub fn async_ops_window(mut self, invoked: u16, performed: u16) -> Self {
        self.async_ops_window = Some((invoked, performed));
        self
    }

    /// Answer SOP class extended negotiation proposals
    /// for the given SOP class with the given
    /// service class application information.
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
    /// whether receiving PDUs must not
    /// surpass the negotiated maximum PDU length.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Override promiscuous mode:
    /// whether to accept unknown abstract syntaxes.
    pub fn promiscuous(mut self, promiscuous: bool) -> Self {
        self.promiscuous = promiscuous;
        self
    }

    /// Replace the whole timer configuration.
    pub fn timers(mut self, timers: TimerOptions) -> Self {
        self.timers = timers;
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

    /// Bound inactivity on the established association.
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

    /// Set the TLS configuration to use on accepted sockets
    /// (see [`establish_tls`](Self::establish_tls)).
    #[cfg(feature = "tls")]
    pub fn tls_config(mut self, config: impl Into<std::sync::Arc<rustls::ServerConfig>>) -> Self {
        self.tls_config = Some(config.into());
        self
    }

    /// Process an association request PDU.
    ///
    /// In the success case, returns the A-ASSOCIATE-AC to send back
    /// and the negotiated options;
    /// in the error case, the PDU to send back and the error to surface.
    #[allow(clippy::result_large_err)]
    fn process_a_association_rq(
        &self,
        msg: Pdu,
    ) -> std::result::Result<(Pdu, NegotiatedOptions), (Pdu, Error)> {
        match msg {
            Pdu::AssociationRQ(AssociationRQ {
                protocol_version,
                calling_ae_title,
                called_ae_title,
                application_context_name,
                presentation_contexts,
                user_variables,
            }) => {
                // only bit 0 of the protocol version field is tested
                if protocol_version & 0x01 != self.protocol_version & 0x01 {
                    let association_rj = AssociationRJ {
                        result: AssociationRJResult::Permanent,
                        source: AssociationRJSource::ServiceProviderAsce(
                            AssociationRJServiceProviderAsceReason::ProtocolVersionNotSupported,
                        ),
                    };
                    let pdu = Pdu::AssociationRJ(association_rj.clone());
                    return Err((pdu, RejectedSnafu { association_rj }.build()));
                }

                if application_context_name != self.application_context_name {
                    let association_rj = AssociationRJ {
                        result: AssociationRJResult::Permanent,
                        source: AssociationRJSource::ServiceUser(
                            AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
                        ),
                    };
                    let pdu = Pdu::AssociationRJ(association_rj.clone());
                    return Err((pdu, RejectedSnafu { association_rj }.build()));
                }

                let user_identity = find_user_identity(&user_variables);

                if let Err(reason) = self.ae_access_control.check_access(
                    &self.ae_title,
                    &calling_ae_title,
                    &called_ae_title,
                    user_identity,
                ) {
                    let association_rj = AssociationRJ {
                        result: AssociationRJResult::Permanent,
                        source: AssociationRJSource::ServiceUser(reason),
                    };
                    let pdu = Pdu::AssociationRJ(association_rj.clone());
                    return Err((pdu, RejectedSnafu { association_rj }.build()));
                }

                let requestor_max_pdu_length =
                    peer_max_pdu_length(&user_variables, DEFAULT_MAX_PDU);

                let policy = AcceptorPolicy {
                    abstract_syntax_uids: &self.abstract_syntax_uids,
                    transfer_syntax_uids: &self.transfer_syntax_uids,
                    promiscuous: self.promiscuous,
                };

                let mut role_answers: Vec<UserVariableItem> = Vec::new();
                let presentation_contexts_negotiated: Vec<_> = presentation_contexts
                    .into_iter()
                    .map(|pc| {
                        let mut negotiated = negotiate_presentation_context(pc, &policy);

                        if let Some(proposed_role) =
                            find_role_selection(&user_variables, &negotiated.abstract_syntax)
                        {
                            let willing = self
                                .role_selections
                                .iter()
                                .find(|role| role.sop_class_uid == negotiated.abstract_syntax)
                                .map(|role| (role.scu_role, role.scp_role));
                            if let Some(willing) = willing {
                                let answer = answer_role_selection(proposed_role, willing);
                                let outcome = resolve_roles(Some(proposed_role), Some(&answer));
                                let (local_scu, local_scp) = outcome.acceptor_roles();
                                negotiated.local_scu = local_scu;
                                negotiated.local_scp = local_scp;
                                if outcome == RoleOutcome::Rejected && negotiated.is_accepted() {
                                    negotiated.reason =
                                        crate::pdu::PresentationContextResultReason::UserRejection;
                                }
                                if role_answers.iter().all(|item| {
                                    !matches!(item, UserVariableItem::RoleSelection(r)
                                        if r.sop_class_uid == answer.sop_class_uid)
                                }) {
                                    role_answers
                                        .push(UserVariableItem::RoleSelection(answer));
                                }
                            }
                        }

                        negotiated
                    })
                    .collect();

                let mut ac_user_variables = vec![
                    UserVariableItem::MaxLength(self.max_pdu_length),
                    UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
                    UserVariableItem::ImplementationVersionName(
                        IMPLEMENTATION_VERSION_NAME.to_string(),
                    ),
                ];
                ac_user_variables.extend(role_answers);
                if let Some((invoked, performed)) = self.async_ops_window {
                    // only answered when the requestor proposed a window
                    if user_variables
                        .iter()
                        .any(|item| matches!(item, UserVariableItem::AsyncOperationsWindow(..)))
                    {
                        ac_user_variables
                            .push(UserVariableItem::AsyncOperationsWindow(invoked, performed));
                    }
                }
                for (sop_class_uid, info) in &self.sop_class_extended {
                    let proposed = user_variables.iter().any(|item| {
                        matches!(item, UserVariableItem::SopClassExtendedNegotiationSubItem(uid, _)
                            if uid == sop_class_uid)
                    });
                    if proposed {
                        ac_user_variables.push(
                            UserVariableItem::SopClassExtendedNegotiationSubItem(
                                sop_class_uid.to_string(),
                                info.clone(),
                            ),
                        );
                    }
                }
                if let Some(identity) = user_identity {
                    if let Some(server_response) = self.user_identity_policy.respond(identity) {
                        ac_user_variables
                            .push(UserVariableItem::UserIdentityResponseItem(server_response));
                    }
                }

                let pdu = Pdu::AssociationAC(AssociationAC {
                    protocol_version: self.protocol_version,
                    application_context_name,
                    presentation_contexts: presentation_contexts_negotiated
                        .iter()
                        .map(PresentationContextResult::from)
                        .collect(),
                    calling_ae_title: calling_ae_title.clone(),
                    called_ae_title,
                    user_variables: ac_user_variables,
                });
                Ok((
                    pdu,
                    NegotiatedOptions {
                        peer_max_pdu_length: requestor_max_pdu_length,
                        user_variables,
                        presentation_contexts: presentation_contexts_negotiated,
                        peer_ae_title: calling_ae_title,
                    },
                ))
            }
            Pdu::ReleaseRQ => Err((
                Pdu::ReleaseRP,
                AbortedSnafu {
                    source_info: AbortRQSource::ServiceUser,
                }
                .build(),
            )),
            pdu @ (Pdu::AssociationAC { .. }
            | Pdu::AssociationRJ { .. }
            | Pdu::PData { .. }
            | Pdu::ReleaseRP
            | Pdu::AbortRQ { .. }) => Err((
                Pdu::AbortRQ {
                    source: AbortRQSource::ServiceProvider(
                        AbortRQServiceProviderReason::UnexpectedPdu,
                    ),
                },
                UnexpectedPduSnafu { pdu: Box::new(pdu) }.build(),
            )),
            pdu @ Pdu::Unknown { .. } => Err((
                Pdu::AbortRQ {
                    source: AbortRQSource::ServiceProvider(
                        AbortRQServiceProviderReason::UnrecognizedPdu,
                    ),
                },
                UnknownPduSnafu { pdu: Box::new(pdu) }.build(),
            )),
        }
    }

    /// Negotiate an association over the given TCP stream.
    pub async fn establish(&self, socket: TcpStream) -> Result<ServerAssociation<TcpStream>> {
        self.establish_on(socket).await
    }

    /// Negotiate an association over the given TCP stream using TLS.
    #[cfg(feature = "tls")]
    pub async fn establish_tls(
        &self,
        socket: TcpStream,
    ) -> Result<ServerAssociation<crate::transport::tls::ServerTlsStream>> {
        let tls_config = self
            .tls_config
            .as_ref()
            .cloned()
            .ok_or_else(|| super::TlsConfigMissingSnafu.build())?;
        let stream = crate::transport::tls::wrap_server(socket, tls_config)
            .await
            .context(super::TlsSnafu)?;
        self.establish_on(stream).await
    }

    /// Negotiate an association over an already opened stream.
    pub async fn establish_on<S>(&self, socket: S) -> Result<ServerAssociation<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        ensure!(
            !self.abstract_syntax_uids.is_empty() || self.promiscuous,
            MissingAbstractSyntaxSnafu
        );

        let mut channel = Channel::new(
            socket,
            Role::Acceptor,
            self.max_pdu_length,
            self.strict,
            self.timers,
        );
        channel.step(Event::TransportConnectionIndication, None).await?;

        let acse_timeout = channel.timers().acse_timeout;
        let msg = channel.receive_timed(TimerKind::Acse, acse_timeout).await?;

        match self.process_a_association_rq(msg) {
            Ok((pdu, negotiated)) => {
                channel.send(&pdu).await?;
                debug!(
                    "association established with {} ({} context(s) accepted)",
                    negotiated.peer_ae_title,
                    negotiated
                        .presentation_contexts
                        .iter()
                        .filter(|pc| pc.is_accepted())
                        .count()
                );
                channel.set_negotiated(negotiated);
                Ok(ServerAssociation { channel })
            }
            Err((pdu, err)) => {
                // send the rejection/abort PDU and close;
                // the association is going away regardless of the outcome
                if let Err(e) = channel.send(&pdu).await {
                    debug!(
                        "could not answer defective association request: {}",
                        snafu::Report::from_error(e)
                    );
                }
                let _ = channel.close().await;
                let _ = channel.step(Event::TransportClosed, None).await;
                Err(err)
            }
        }
    }
}

/// A DICOM upper level association from the perspective
/// of an accepting application entity.
///
/// The most common operations of an established association are
/// [`send`](AsyncAssociation::send)
/// and [`receive`](AsyncAssociation::receive).
/// Sending large P-Data fragments may be easier through the P-Data sender
/// abstraction (see [`send_pdata`](AsyncAssociation::send_pdata)).
#[derive(Debug)]
pub struct ServerAssociation<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    channel: Channel<S>,
}

impl<S> Association for ServerAssociation<S>
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

impl<S> AsyncAssociation for ServerAssociation<S>
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

impl<S> ServerAssociation<S>
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

    /// Answer a peer's release request,
    /// completing the orderly release from this side.
    pub async fn confirm_release(&mut self) -> Result<()> {
        self.channel.send(&Pdu::ReleaseRP).await?;
        let _ = self.channel.close().await;
        self.channel.step(Event::TransportClosed, None).await?;
        Ok(())
    }
}
