//! DICOM association module
//!
//! This module contains the mechanisms for establishing,
//! using and ending associations between application entities over TCP,
//! from both the requestor and the acceptor perspective.
//!
//! - [`client`] hosts [`ClientAssociationOptions`](client::ClientAssociationOptions),
//!   the builder for requesting an association with a remote node.
//! - [`server`] hosts [`ServerAssociationOptions`](server::ServerAssociationOptions),
//!   the builder for negotiating an association on an accepted socket.
//! - [`negotiation`] implements the ACSE rules applied during establishment:
//!   presentation context outcomes, role selection and user identity.
//! - [`pdata`] provides helpers for sending and receiving
//!   arbitrarily large data set streams as P-DATA fragments.
//!
//! All socket I/O of an established association flows through
//! the state machine in [`crate::machine`]:
//! every PDU sent or received is translated into a machine event
//! and the resulting actions (PDU writes, timer changes, socket closure)
//! are carried out in order.

use std::time::Duration;

use bytes::BytesMut;
use snafu::{Backtrace, ResultExt, Snafu};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::warn;

use crate::machine::{self, Action, Event, Indication, Machine, PduHint, Role, State};
use crate::pdu::{
    write_pdu, AbortRQServiceProviderReason, AbortRQSource, AssociationRJ, Pdu,
    PresentationContextNegotiated, UserVariableItem, PDU_HEADER_SIZE,
};
use crate::transport::{self, read_buffer_capacity, read_pdu_from_wire, with_timeout};

pub mod client;
pub mod negotiation;
pub mod pdata;
pub mod server;

/// An error during association negotiation or data exchange.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// missing at least one abstract syntax to begin negotiation
    MissingAbstractSyntax { backtrace: Backtrace },

    /// could not connect to peer
    Connect {
        #[snafu(backtrace)]
        source: transport::Error,
    },

    /// failed to encode outgoing PDU
    SendPdu {
        #[snafu(backtrace)]
        source: crate::pdu::WriteError,
    },

    /// failed to send PDU on the wire
    WireSend {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// failed to receive PDU from the wire
    Receive {
        #[snafu(backtrace)]
        source: crate::pdu::ReadError,
    },

    #[snafu(display("PDU is too large to be sent ({} bytes where the maximum is {})", length, maximum))]
    SendTooLongPdu {
        length: usize,
        maximum: usize,
        backtrace: Backtrace,
    },

    #[snafu(display("connection closed by peer"))]
    ConnectionClosed { backtrace: Backtrace },

    #[snafu(display("operation timed out ({:?} timer)", timer))]
    Timeout {
        /// which timer class expired
        timer: TimerKind,
        backtrace: Backtrace,
    },

    #[snafu(display("protocol version mismatch: expected {}, got {}", expected, got))]
    ProtocolVersionMismatch {
        expected: u16,
        got: u16,
        backtrace: Backtrace,
    },

    /// the association was rejected by the peer
    #[snafu(display("association rejected: {:?}", association_rj))]
    Rejected {
        association_rj: AssociationRJ,
        backtrace: Backtrace,
    },

    /// the association was aborted
    #[snafu(display("association aborted: {:?}", source_info))]
    Aborted {
        source_info: AbortRQSource,
        backtrace: Backtrace,
    },

    /// no presentation contexts accepted by the peer
    NoAcceptedPresentationContexts { backtrace: Backtrace },

    #[snafu(display("unexpected PDU `{}`", pdu.short_description()))]
    #[non_exhaustive]
    UnexpectedPdu { pdu: Box<Pdu>, backtrace: Backtrace },

    #[snafu(display("unknown PDU `{}`", pdu.short_description()))]
    #[non_exhaustive]
    UnknownPdu { pdu: Box<Pdu>, backtrace: Backtrace },

    #[snafu(display(
        "operation not permitted in protocol state {:?} (event {:?})",
        state,
        event
    ))]
    NotPermitted {
        state: State,
        event: Event,
        backtrace: Backtrace,
    },

    /// missing TLS configuration
    #[cfg(feature = "tls")]
    TlsConfigMissing { backtrace: Backtrace },

    /// failed to establish the TLS layer
    #[cfg(feature = "tls")]
    Tls {
        #[snafu(backtrace)]
        source: transport::tls::TlsError,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The timer classes of an association.
///
/// Every suspension point of an association is bounded by
/// at most one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// bounds the opening of the TCP connection
    Connection,
    /// bounds association establishment and release (the ARTIM timer)
    Acse,
    /// bounds each outstanding DIMSE operation
    Dimse,
    /// bounds inactivity on an established association
    Network,
}

/// What to do when the network (inactivity) timer expires
/// on an established association.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkTimeoutResponse {
    /// abort the association (the default)
    #[default]
    Abort,
    /// request an orderly release
    Release,
}

/// Deadlines for the four timer classes of an association.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimerOptions {
    /// maximum time for the TCP connection to open
    pub connection_timeout: Option<Duration>,
    /// maximum time for association establishment and release steps
    pub acse_timeout: Option<Duration>,
    /// maximum time for each outstanding DIMSE operation
    pub dimse_timeout: Option<Duration>,
    /// maximum inactivity time on an established association
    pub network_timeout: Option<Duration>,
    /// what to do when the inactivity timer expires
    pub network_timeout_response: NetworkTimeoutResponse,
}

impl Default for TimerOptions {
    fn default() -> Self {
        TimerOptions {
            connection_timeout: Some(Duration::from_secs(60)),
            acse_timeout: Some(Duration::from_secs(30)),
            dimse_timeout: Some(Duration::from_secs(30)),
            network_timeout: None,
            network_timeout_response: NetworkTimeoutResponse::default(),
        }
    }
}

/// The outcome of a successful negotiation,
/// as recorded by either side of the association.
#[derive(Debug, Clone)]
pub(crate) struct NegotiatedOptions {
    /// the maximum PDU length the peer is willing to receive
    pub peer_max_pdu_length: u32,
    /// the user variables received from the peer
    pub user_variables: Vec<UserVariableItem>,
    /// the negotiated presentation contexts
    pub presentation_contexts: Vec<PresentationContextNegotiated>,
    /// the peer's application entity title
    pub peer_ae_title: String,
}

/// Common read access to the negotiated properties of an association.
pub trait Association {
    /// Obtain a view of the negotiated presentation contexts.
    fn presentation_contexts(&self) -> &[PresentationContextNegotiated];

    /// Retrieve the maximum PDU length that the peer accepts.
    fn peer_max_pdu_length(&self) -> u32;

    /// Retrieve the maximum PDU length
    /// that this node is expecting to receive.
    fn local_max_pdu_length(&self) -> u32;

    /// Obtain the remote node's application entity title.
    fn peer_ae_title(&self) -> &str;

    /// Obtain the user variables received from the peer.
    fn peer_user_variables(&self) -> &[UserVariableItem];

    /// The timer configuration of this association.
    fn timers(&self) -> &TimerOptions;

    /// Find an accepted presentation context by its identifier.
    fn accepted_context(&self, id: u8) -> Option<&PresentationContextNegotiated> {
        self.presentation_contexts()
            .iter()
            .find(|pc| pc.id == id && pc.is_accepted())
    }
}

/// The operations of an established association.
///
/// All methods drive the underlying protocol machine,
/// so that an operation which is not permitted in the current state
/// cleanly aborts the association
/// instead of emitting protocol-violating bytes.
#[allow(async_fn_in_trait)]
pub trait AsyncAssociation: Association {
    /// Send a PDU message to the peer.
    async fn send(&mut self, msg: &Pdu) -> Result<()>;

    /// Read a PDU message from the peer.
    async fn receive(&mut self) -> Result<Pdu>;

    /// Gracefully release the association, handling a release collision
    /// if one occurs.
    async fn release(&mut self) -> Result<()>;

    /// Abort the association immediately.
    async fn abort(&mut self) -> Result<()>;

    /// Shut down the underlying transport connection.
    async fn close(&mut self) -> std::io::Result<()>;

    /// Receive a PDU bounded by the given timer class
    /// instead of the default inactivity timer.
    async fn receive_timed(&mut self, timer: TimerKind, deadline: Option<Duration>) -> Result<Pdu>;

    /// Prepare a fragmenting writer to send a large message payload
    /// on the given presentation context.
    fn send_pdata(&mut self, presentation_context_id: u8) -> pdata::PDataWriter<'_, Self>
    where
        Self: Sized;
}

/// Encode a PDU into `buffer`,
/// failing if the encoded form would exceed `max_pdu_length`
/// plus the PDU header.
pub(crate) fn encode_pdu(buffer: &mut Vec<u8>, pdu: &Pdu, max_pdu_length: u32) -> Result<()> {
    write_pdu(buffer, pdu).context(SendPduSnafu)?;
    let maximum = max_pdu_length as usize + PDU_HEADER_SIZE as usize;
    snafu::ensure!(
        buffer.len() <= maximum,
        SendTooLongPduSnafu {
            length: buffer.len(),
            maximum,
        }
    );
    Ok(())
}

/// The state shared by both association perspectives
/// once the transport connection exists:
/// the socket, the protocol machine, the reusable buffers,
/// the negotiated parameters and the timers.
#[derive(Debug)]
pub(crate) struct Channel<S> {
    /// the stream to the other DICOM node
    socket: S,
    /// the upper layer protocol machine
    machine: Machine,
    /// reusable read buffer
    read_buffer: BytesMut,
    /// reusable write buffer
    write_buffer: Vec<u8>,
    /// the maximum PDU length the peer accepts
    peer_max_pdu_length: u32,
    /// the maximum PDU length this node accepts
    local_max_pdu_length: u32,
    /// whether to enforce the local maximum on inbound PDUs
    strict: bool,
    /// the negotiated presentation contexts
    presentation_contexts: Vec<PresentationContextNegotiated>,
    /// the peer's application entity title
    peer_ae_title: String,
    /// the user variables received from the peer
    peer_user_variables: Vec<UserVariableItem>,
    /// the timer configuration
    timers: TimerOptions,
    /// whether the ARTIM timer is running
    artim: bool,
}

impl<S> Channel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(socket: S, role: Role, local_max_pdu_length: u32, strict: bool, timers: TimerOptions) -> Self {
        Channel {
            socket,
            machine: Machine::new(role),
            read_buffer: BytesMut::with_capacity(read_buffer_capacity(local_max_pdu_length)),
            write_buffer: Vec::with_capacity(read_buffer_capacity(local_max_pdu_length)),
            peer_max_pdu_length: 0,
            local_max_pdu_length,
            strict,
            presentation_contexts: Vec::new(),
            peer_ae_title: String::new(),
            peer_user_variables: Vec::new(),
            timers,
            artim: false,
        }
    }

    pub(crate) fn machine(&mut self) -> &mut Machine {
        &mut self.machine
    }

    pub(crate) fn timers(&self) -> &TimerOptions {
        &self.timers
    }

    pub(crate) fn set_negotiated(&mut self, negotiated: NegotiatedOptions) {
        let NegotiatedOptions {
            peer_max_pdu_length,
            user_variables,
            presentation_contexts,
            peer_ae_title,
        } = negotiated;
        self.peer_max_pdu_length = peer_max_pdu_length;
        self.peer_user_variables = user_variables;
        self.presentation_contexts = presentation_contexts;
        self.peer_ae_title = peer_ae_title;
    }

    /// Write a fully assembled PDU to the socket,
    /// honouring the peer's maximum length and the write timeout.
    async fn write_pdu_to_wire(&mut self, pdu: &Pdu) -> Result<()> {
        self.write_buffer.clear();
        // the peer maximum is unknown until negotiation completes
        let maximum = match self.peer_max_pdu_length {
            0 => crate::pdu::MAXIMUM_PDU_SIZE.max(self.local_max_pdu_length),
            n => n,
        };
        encode_pdu(&mut self.write_buffer, pdu, maximum)?;
        self.socket
            .write_all(&self.write_buffer)
            .await
            .context(WireSendSnafu)
    }

    /// Build the PDU for an abort instruction from the machine.
    fn abort_pdu_for(hint: PduHint) -> Pdu {
        match hint {
            PduHint::AbortUser => Pdu::AbortRQ {
                source: AbortRQSource::ServiceUser,
            },
            PduHint::AbortUnrecognizedPdu => Pdu::AbortRQ {
                source: AbortRQSource::ServiceProvider(
                    AbortRQServiceProviderReason::UnrecognizedPdu,
                ),
            },
            _ => Pdu::AbortRQ {
                source: AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnexpectedPdu),
            },
        }
    }

    /// Feed one event into the machine
    /// and carry out the resulting actions in order.
    ///
    /// `pdu` is the PDU being sent when the event is a local send primitive.
    /// Returns the indications raised along the way.
    pub(crate) async fn step(
        &mut self,
        event: Event,
        pdu: Option<&Pdu>,
    ) -> Result<Vec<Indication>> {
        let actions = self.machine.handle(event);
        let mut indications = Vec::new();
        for action in actions {
            match action {
                Action::OpenTransport => {
                    // connections are opened before a channel exists
                    unreachable!("transport opening is handled at establishment")
                }
                Action::CloseTransport => {
                    let _ = self.socket.shutdown().await;
                }
                Action::StartArtim => self.artim = true,
                Action::StopArtim => self.artim = false,
                Action::SendPdu(
                    hint @ (PduHint::AbortUser
                    | PduHint::AbortUnexpectedPdu
                    | PduHint::AbortUnrecognizedPdu),
                ) => {
                    let abort = Self::abort_pdu_for(*hint);
                    if let Err(e) = self.write_pdu_to_wire(&abort).await {
                        // the peer may already be gone; the association
                        // is being torn down either way
                        warn!("failed to send abort: {}", snafu::Report::from_error(e));
                    }
                }
                Action::SendPdu(_) => {
                    let pdu = pdu.ok_or_else(|| {
                        NotPermittedSnafu {
                            state: self.machine.state(),
                            event,
                        }
                        .build()
                    })?;
                    self.write_pdu_to_wire(pdu).await?;
                }
                Action::Indicate(indication) => indications.push(*indication),
            }
        }
        Ok(indications)
    }

    /// Send a PDU, translating it into its request primitive first.
    ///
    /// If the protocol machine does not permit the primitive
    /// in the current state, the association is aborted
    /// and an error is returned.
    pub(crate) async fn send(&mut self, pdu: &Pdu) -> Result<()> {
        let event = machine::event_for_outgoing(pdu);
        let state = self.machine.state();
        let indications = self.step(event, Some(pdu)).await?;
        if indications.contains(&Indication::ProviderAbort) {
            return NotPermittedSnafu { state, event }.fail();
        }
        Ok(())
    }

    /// Receive the next PDU addressed to the upper layers.
    ///
    /// PDUs which the machine decides to ignore are skipped;
    /// protocol violations abort the association.
    pub(crate) async fn receive(&mut self) -> Result<Pdu> {
        let timer = if self.artim {
            TimerKind::Acse
        } else {
            TimerKind::Network
        };
        let deadline = match timer {
            TimerKind::Acse => self.timers.acse_timeout,
            _ => self.timers.network_timeout,
        };
        self.receive_timed(timer, deadline).await
    }

    /// Receive the next PDU bounded by an explicit deadline.
    pub(crate) async fn receive_timed(
        &mut self,
        timer: TimerKind,
        deadline: Option<Duration>,
    ) -> Result<Pdu> {
        loop {
            let Channel {
                socket,
                read_buffer,
                local_max_pdu_length,
                strict,
                ..
            } = &mut *self;
            let read = with_timeout(
                deadline,
                || TimeoutSnafu { timer }.build(),
                async {
                    read_pdu_from_wire(socket, read_buffer, *local_max_pdu_length, *strict)
                        .await
                        .context(ReceiveSnafu)
                },
            )
            .await;

            let pdu = match read {
                Ok(pdu) => pdu,
                Err(Error::Timeout { .. }) => {
                    return self.handle_receive_timeout(timer).await;
                }
                Err(Error::Receive {
                    source: crate::pdu::ReadError::NoPduAvailable { .. },
                    ..
                }) => {
                    self.step(Event::TransportClosed, None).await?;
                    return ConnectionClosedSnafu.fail();
                }
                Err(e @ Error::Receive { .. }) => {
                    // a malformed PDU triggers the abort sequence
                    self.step(Event::InvalidPduReceived, None).await?;
                    return Err(e);
                }
                Err(e) => return Err(e),
            };

            let state_before = self.machine.state();
            let event = machine::event_for_incoming(&pdu);
            let indications = self.step(event, None).await?;

            if indications.contains(&Indication::ProviderAbort) {
                // the machine refused the PDU and aborted
                return UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail();
            }
            if indications.is_empty() {
                match self.machine.state() {
                    State::Sta1 => return ConnectionClosedSnafu.fail(),
                    // the machine just sent an abort over this PDU
                    State::Sta13 if state_before != State::Sta13 => {
                        return UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail();
                    }
                    // ignored (e.g. stray PDU while closing); keep reading
                    _ => continue,
                }
            }
            return Ok(pdu);
        }
    }

    /// Resolve a receive timeout according to the timer class:
    /// the ARTIM timer and DIMSE timers force an abort,
    /// the inactivity timer follows the configured response.
    ///
    /// Written without re-entering `receive`,
    /// so that the receive future stays finitely sized.
    async fn handle_receive_timeout(&mut self, timer: TimerKind) -> Result<Pdu> {
        match timer {
            TimerKind::Acse => {
                self.step(Event::ArtimExpired, None).await?;
                let _ = self.close().await;
                self.step(Event::TransportClosed, None).await?;
            }
            TimerKind::Network
                if self.timers.network_timeout_response == NetworkTimeoutResponse::Release =>
            {
                if let Err(e) = self.release_quietly().await {
                    warn!(
                        "release on inactivity failed: {}",
                        snafu::Report::from_error(e)
                    );
                }
            }
            TimerKind::Network => {
                let abort = Pdu::AbortRQ {
                    source: AbortRQSource::ServiceUser,
                };
                let _ = self.step(Event::AbortRequest, Some(&abort)).await;
                let _ = self.close().await;
                let _ = self.step(Event::TransportClosed, None).await;
            }
            // expiry of the remaining timer classes is resolved
            // by the owning operation
            TimerKind::Connection | TimerKind::Dimse => {}
        }
        TimeoutSnafu { timer }.fail()
    }

    /// Issue a release and wait for the peer's reply
    /// without surfacing data to the upper layers.
    ///
    /// Used when the inactivity timer elects an orderly release;
    /// any data still in flight is dropped.
    async fn release_quietly(&mut self) -> Result<()> {
        self.step(Event::ReleaseRequest, Some(&Pdu::ReleaseRQ))
            .await?;
        let deadline = self.timers.acse_timeout;
        loop {
            let Channel {
                socket,
                read_buffer,
                local_max_pdu_length,
                strict,
                ..
            } = &mut *self;
            let pdu = with_timeout(
                deadline,
                || {
                    TimeoutSnafu {
                        timer: TimerKind::Acse,
                    }
                    .build()
                },
                async {
                    read_pdu_from_wire(socket, read_buffer, *local_max_pdu_length, *strict)
                        .await
                        .context(ReceiveSnafu)
                },
            )
            .await?;
            let event = machine::event_for_incoming(&pdu);
            self.step(event, None).await?;
            match self.machine.state() {
                State::Sta1 => return Ok(()),
                State::Sta9 | State::Sta12 => {
                    self.step(Event::ReleaseResponse, Some(&Pdu::ReleaseRP))
                        .await?;
                    if self.machine.state() == State::Sta13 {
                        let _ = self.close().await;
                        self.step(Event::TransportClosed, None).await?;
                        return Ok(());
                    }
                }
                State::Sta13 => {
                    let _ = self.close().await;
                    self.step(Event::TransportClosed, None).await?;
                    return Ok(());
                }
                _ => {}
            }
        }
    }

    /// Gracefully release the association,
    /// resolving a release collision if both sides requested release
    /// within the same round trip.
    pub(crate) async fn release(&mut self) -> Result<()> {
        self.send(&Pdu::ReleaseRQ).await?;

        loop {
            let pdu = self.receive().await?;
            match pdu {
                Pdu::ReleaseRP => {
                    match self.machine.state() {
                        // collision (acceptor side): confirmed, now answer
                        State::Sta12 => {
                            self.send(&Pdu::ReleaseRP).await?;
                            let _ = self.close().await;
                            self.step(Event::TransportClosed, None).await?;
                        }
                        // plain release or collision requestor side:
                        // the machine has already closed the transport
                        _ => {}
                    }
                    return Ok(());
                }
                Pdu::ReleaseRQ => {
                    // release collision
                    if self.machine.state() == State::Sta9 {
                        // requestor side answers right away and
                        // keeps waiting for the peer's reply
                        self.send(&Pdu::ReleaseRP).await?;
                    }
                    // acceptor side (Sta10) simply waits for the reply
                }
                Pdu::PData { .. } => {
                    // late data while releasing is dropped
                    warn!("discarding P-DATA received during release");
                }
                Pdu::AbortRQ { source } => {
                    return AbortedSnafu {
                        source_info: source,
                    }
                    .fail();
                }
                pdu @ Pdu::Unknown { .. } => {
                    return UnknownPduSnafu { pdu: Box::new(pdu) }.fail()
                }
                pdu => return UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail(),
            }
        }
    }

    /// Abort the association immediately:
    /// send A-ABORT (service user source) and close the transport.
    pub(crate) async fn abort(&mut self) -> Result<()> {
        let abort = Pdu::AbortRQ {
            source: AbortRQSource::ServiceUser,
        };
        self.send(&abort).await?;
        let _ = self.close().await;
        self.step(Event::TransportClosed, None).await?;
        Ok(())
    }

    pub(crate) async fn close(&mut self) -> std::io::Result<()> {
        self.socket.shutdown().await
    }

    pub(crate) fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
        &self.presentation_contexts
    }

    pub(crate) fn peer_max_pdu_length(&self) -> u32 {
        self.peer_max_pdu_length
    }

    pub(crate) fn local_max_pdu_length(&self) -> u32 {
        self.local_max_pdu_length
    }

    pub(crate) fn peer_ae_title(&self) -> &str {
        &self.peer_ae_title
    }

    pub(crate) fn peer_user_variables(&self) -> &[UserVariableItem] {
        &self.peer_user_variables
    }
}
