//! The upper layer protocol state machine.
//!
//! This module implements the DICOM Upper Layer finite state machine
//! (PS3.8, section 9.2):
//! the 13 protocol states,
//! the full event alphabet
//! (service primitives issued locally,
//! PDUs arriving from the peer,
//! transport connection events
//! and ARTIM timer expiry),
//! and the transition table.
//!
//! The table is exposed as a pure function,
//! [`transition`],
//! from a (role, state, event) triple
//! to the next state and an ordered list of [actions](Action).
//! Actions are instructions to the surrounding association logic:
//! send a PDU, start or stop the ARTIM timer,
//! open or close the transport connection,
//! or surface a service [indication](Indication) to the upper layers.
//! No I/O happens here,
//! which makes every path testable by plain event injection.
//!
//! Events which the standard's table does not permit in the current state
//! resolve to the "AA" abort sequence:
//! an A-ABORT PDU with a service provider source
//! and an unexpected-PDU reason.

/// The thirteen states of the upper layer protocol machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum State {
    /// Sta1: idle, no association and no transport connection
    Sta1,
    /// Sta2: transport connection open,
    /// awaiting A-ASSOCIATE-RQ (acceptor)
    Sta2,
    /// Sta3: awaiting the local A-ASSOCIATE response primitive (acceptor)
    Sta3,
    /// Sta4: awaiting the transport connection to open (requestor)
    Sta4,
    /// Sta5: awaiting A-ASSOCIATE-AC or -RJ (requestor)
    Sta5,
    /// Sta6: association established, data transfer permitted
    Sta6,
    /// Sta7: release requested, awaiting A-RELEASE-RP
    Sta7,
    /// Sta8: peer requested release,
    /// awaiting the local A-RELEASE response primitive
    Sta8,
    /// Sta9: release collision (requestor side),
    /// awaiting the local A-RELEASE response primitive
    Sta9,
    /// Sta10: release collision (acceptor side), awaiting A-RELEASE-RP
    Sta10,
    /// Sta11: release collision (requestor side), awaiting A-RELEASE-RP
    Sta11,
    /// Sta12: release collision (acceptor side),
    /// awaiting the local A-RELEASE response primitive
    Sta12,
    /// Sta13: association ended,
    /// awaiting the transport connection to close
    Sta13,
}

impl State {
    /// All states, in order. Useful for exhaustive table tests.
    pub const ALL: [State; 13] = [
        State::Sta1,
        State::Sta2,
        State::Sta3,
        State::Sta4,
        State::Sta5,
        State::Sta6,
        State::Sta7,
        State::Sta8,
        State::Sta9,
        State::Sta10,
        State::Sta11,
        State::Sta12,
        State::Sta13,
    ];
}

/// Whether the local node requested the association
/// or accepted an incoming one.
///
/// The role only matters for one row of the table:
/// the release collision,
/// which the requestor and the acceptor resolve
/// through different state sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// the local node requested the association
    Requestor,
    /// the local node accepted the association
    Acceptor,
}

/// An event fed into the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// the local user issued an A-ASSOCIATE request primitive
    AssociateRequest,
    /// the transport connection opened (requestor side)
    TransportConnected,
    /// an A-ASSOCIATE-AC PDU arrived
    AssociateAcReceived,
    /// an A-ASSOCIATE-RJ PDU arrived
    AssociateRjReceived,
    /// a new inbound transport connection arrived (acceptor side)
    TransportConnectionIndication,
    /// an A-ASSOCIATE-RQ PDU arrived
    AssociateRqReceived,
    /// the local user answered an association request with an acceptance
    AssociateResponseAccept,
    /// the local user answered an association request with a rejection
    AssociateResponseReject,
    /// the local user issued a P-DATA request primitive
    PDataRequest,
    /// a P-DATA-TF PDU arrived
    PDataReceived,
    /// the local user issued an A-RELEASE request primitive
    ReleaseRequest,
    /// an A-RELEASE-RQ PDU arrived
    ReleaseRqReceived,
    /// an A-RELEASE-RP PDU arrived
    ReleaseRpReceived,
    /// the local user answered a release request
    ReleaseResponse,
    /// the local user issued an A-ABORT request primitive
    AbortRequest,
    /// an A-ABORT PDU arrived
    AbortReceived,
    /// the transport connection was closed by the peer
    TransportClosed,
    /// the ARTIM timer expired
    ArtimExpired,
    /// an unrecognized or malformed PDU arrived
    InvalidPduReceived,
}

impl Event {
    /// All events, in order. Useful for exhaustive table tests.
    pub const ALL: [Event; 19] = [
        Event::AssociateRequest,
        Event::TransportConnected,
        Event::AssociateAcReceived,
        Event::AssociateRjReceived,
        Event::TransportConnectionIndication,
        Event::AssociateRqReceived,
        Event::AssociateResponseAccept,
        Event::AssociateResponseReject,
        Event::PDataRequest,
        Event::PDataReceived,
        Event::ReleaseRequest,
        Event::ReleaseRqReceived,
        Event::ReleaseRpReceived,
        Event::ReleaseResponse,
        Event::AbortRequest,
        Event::AbortReceived,
        Event::TransportClosed,
        Event::ArtimExpired,
        Event::InvalidPduReceived,
    ];
}

/// Which PDU an [`Action::SendPdu`] instruction refers to.
///
/// The machine never constructs PDUs itself;
/// the association logic supplies the concrete value
/// (for aborts, built from the hinted source and reason).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PduHint {
    /// the A-ASSOCIATE-RQ under negotiation
    AssociateRq,
    /// the A-ASSOCIATE-AC produced by the local response
    AssociateAc,
    /// the A-ASSOCIATE-RJ produced by the local response
    AssociateRj,
    /// the pending P-DATA-TF
    PData,
    /// an A-RELEASE-RQ
    ReleaseRq,
    /// an A-RELEASE-RP
    ReleaseRp,
    /// an A-ABORT with service user source
    AbortUser,
    /// an A-ABORT with service provider source
    /// and an unexpected-PDU reason
    AbortUnexpectedPdu,
    /// an A-ABORT with service provider source
    /// and an unrecognized-PDU reason
    AbortUnrecognizedPdu,
}

/// A service indication surfaced to the upper layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Indication {
    /// an association is being requested by the peer
    Associate,
    /// the peer accepted the association
    AssociateAccepted,
    /// the peer rejected the association
    AssociateRejected,
    /// message data arrived
    PData,
    /// the peer requested an orderly release
    Release,
    /// the orderly release completed
    ReleaseConfirmed,
    /// both sides requested release at the same time
    ReleaseCollision,
    /// the peer aborted the association
    Abort,
    /// the provider aborted the association
    /// (protocol error or lost transport connection)
    ProviderAbort,
}

/// One instruction produced by a state transition,
/// to be executed in list order by the association logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// open the transport connection to the peer
    OpenTransport,
    /// close the transport connection
    CloseTransport,
    /// start (or restart) the ARTIM timer
    StartArtim,
    /// stop the ARTIM timer
    StopArtim,
    /// transmit a PDU
    SendPdu(PduHint),
    /// surface a service indication
    Indicate(Indication),
}

use Action::*;
use Indication as Ind;
use PduHint::*;

/// The outcome of feeding one event into the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// the state after the event
    pub next: State,
    /// the ordered instructions to carry out
    pub actions: &'static [Action],
}

const fn to(next: State, actions: &'static [Action]) -> Transition {
    Transition { next, actions }
}

// The AA-8 sequence: abort a live association upon a protocol error.
const AA8: &[Action] = &[
    SendPdu(AbortUnexpectedPdu),
    Indicate(Ind::ProviderAbort),
    StartArtim,
];

/// Compute the transition for the given role, state and event.
///
/// This function is total:
/// combinations not listed in the standard's table
/// resolve to the abort sequence appropriate for the current state
/// (send A-ABORT with a provider source where a transport connection exists,
/// plain closure otherwise).
pub fn transition(role: Role, state: State, event: Event) -> Transition {
    use Event as Ev;
    use State::*;

    match (state, event) {
        // --- association establishment, requestor ---
        (Sta1, Ev::AssociateRequest) => to(Sta4, &[OpenTransport]),
        (Sta4, Ev::TransportConnected) => to(Sta5, &[SendPdu(AssociateRq)]),
        (Sta5, Ev::AssociateAcReceived) => to(Sta6, &[Indicate(Ind::AssociateAccepted)]),
        (Sta5, Ev::AssociateRjReceived) => {
            to(Sta1, &[Indicate(Ind::AssociateRejected), CloseTransport])
        }

        // --- association establishment, acceptor ---
        (Sta1, Ev::TransportConnectionIndication) => to(Sta2, &[StartArtim]),
        (Sta2, Ev::AssociateRqReceived) => to(Sta3, &[StopArtim, Indicate(Ind::Associate)]),
        (Sta3, Ev::AssociateResponseAccept) => to(Sta6, &[SendPdu(AssociateAc)]),
        (Sta3, Ev::AssociateResponseReject) => to(Sta13, &[SendPdu(AssociateRj), StartArtim]),

        // --- data transfer ---
        (Sta6, Ev::PDataRequest) => to(Sta6, &[SendPdu(PData)]),
        (Sta6, Ev::PDataReceived) => to(Sta6, &[Indicate(Ind::PData)]),

        // --- orderly release ---
        (Sta6, Ev::ReleaseRequest) => to(Sta7, &[SendPdu(ReleaseRq), StartArtim]),
        (Sta6, Ev::ReleaseRqReceived) => to(Sta8, &[Indicate(Ind::Release)]),
        // data may still flow while a release is pending
        (Sta7, Ev::PDataReceived) => to(Sta7, &[Indicate(Ind::PData)]),
        (Sta8, Ev::PDataRequest) => to(Sta8, &[SendPdu(PData)]),
        (Sta7, Ev::ReleaseRpReceived) => {
            to(Sta1, &[StopArtim, Indicate(Ind::ReleaseConfirmed), CloseTransport])
        }
        (Sta8, Ev::ReleaseResponse) => to(Sta13, &[SendPdu(ReleaseRp), StartArtim]),

        // --- release collision ---
        // both sides sent A-RELEASE-RQ within the same round trip;
        // the requestor and acceptor take distinct paths back to Sta1
        (Sta7, Ev::ReleaseRqReceived) => match role {
            Role::Requestor => to(Sta9, &[Indicate(Ind::ReleaseCollision)]),
            Role::Acceptor => to(Sta10, &[Indicate(Ind::ReleaseCollision)]),
        },
        (Sta9, Ev::ReleaseResponse) => to(Sta11, &[SendPdu(ReleaseRp)]),
        (Sta11, Ev::ReleaseRpReceived) => {
            to(Sta1, &[StopArtim, Indicate(Ind::ReleaseConfirmed), CloseTransport])
        }
        (Sta10, Ev::ReleaseRpReceived) => to(Sta12, &[Indicate(Ind::ReleaseConfirmed)]),
        (Sta12, Ev::ReleaseResponse) => to(Sta13, &[SendPdu(ReleaseRp), StartArtim]),

        // --- aborting ---
        (Sta4, Ev::AbortRequest) => to(Sta1, &[StopArtim, CloseTransport]),
        (
            Sta2 | Sta3 | Sta5 | Sta6 | Sta7 | Sta8 | Sta9 | Sta10 | Sta11 | Sta12,
            Ev::AbortRequest,
        ) => to(Sta13, &[SendPdu(AbortUser), StartArtim]),
        (Sta2 | Sta13, Ev::AbortReceived) => to(Sta1, &[StopArtim, CloseTransport]),
        (
            Sta3 | Sta5 | Sta6 | Sta7 | Sta8 | Sta9 | Sta10 | Sta11 | Sta12,
            Ev::AbortReceived,
        ) => to(Sta1, &[Indicate(Ind::Abort), CloseTransport]),

        // --- transport closed by the peer ---
        (Sta2, Ev::TransportClosed) => to(Sta1, &[StopArtim]),
        (Sta13, Ev::TransportClosed) => to(Sta1, &[StopArtim]),
        (
            Sta3 | Sta4 | Sta5 | Sta6 | Sta7 | Sta8 | Sta9 | Sta10 | Sta11 | Sta12,
            Ev::TransportClosed,
        ) => to(Sta1, &[Indicate(Ind::ProviderAbort), StopArtim]),

        // --- ARTIM expiry ---
        (Sta2 | Sta13, Ev::ArtimExpired) => to(Sta1, &[CloseTransport]),
        // a pending release that never completes is forced into an abort
        (Sta7 | Sta10 | Sta11 | Sta12, Ev::ArtimExpired) => to(
            Sta13,
            &[
                SendPdu(AbortUnexpectedPdu),
                Indicate(Ind::ProviderAbort),
                StartArtim,
            ],
        ),

        // --- unrecognized or malformed PDUs ---
        (Sta2, Ev::InvalidPduReceived) => to(Sta13, &[SendPdu(AbortUnrecognizedPdu), StartArtim]),
        (Sta13, Ev::InvalidPduReceived) => to(Sta13, &[SendPdu(AbortUnrecognizedPdu)]),
        (
            Sta3 | Sta5 | Sta6 | Sta7 | Sta8 | Sta9 | Sta10 | Sta11 | Sta12,
            Ev::InvalidPduReceived,
        ) => to(
            Sta13,
            &[
                SendPdu(AbortUnrecognizedPdu),
                Indicate(Ind::ProviderAbort),
                StartArtim,
            ],
        ),

        // --- PDUs arriving while the association is going away ---
        (Sta13, Ev::AssociateRqReceived) => to(Sta13, &[SendPdu(AbortUnexpectedPdu)]),
        (
            Sta13,
            Ev::AssociateAcReceived
            | Ev::AssociateRjReceived
            | Ev::PDataReceived
            | Ev::ReleaseRqReceived
            | Ev::ReleaseRpReceived,
        ) => to(Sta13, &[]),

        // --- PDUs out of place on a live association ---
        (
            Sta2,
            Ev::AssociateAcReceived
            | Ev::AssociateRjReceived
            | Ev::PDataReceived
            | Ev::ReleaseRqReceived
            | Ev::ReleaseRpReceived,
        ) => to(Sta13, &[SendPdu(AbortUnexpectedPdu), StartArtim]),
        (
            Sta3 | Sta5 | Sta6 | Sta7 | Sta8 | Sta9 | Sta10 | Sta11 | Sta12,
            Ev::AssociateAcReceived
            | Ev::AssociateRjReceived
            | Ev::AssociateRqReceived
            | Ev::PDataReceived
            | Ev::ReleaseRqReceived
            | Ev::ReleaseRpReceived,
        ) => to(Sta13, AA8),

        // --- local primitives issued in a state that does not allow them ---
        // not rows of the standard's table (the peer never sees these events),
        // but the function must stay total:
        // tear the association down rather than violate the protocol
        (Sta1, _) => to(Sta1, &[]),
        (Sta4, _) => to(Sta1, &[StopArtim, CloseTransport]),
        (Sta13, _) => to(Sta13, &[]),
        (_, _) => to(Sta13, AA8),
    }
}

/// The upper layer protocol machine of one association:
/// the current state plus the local role.
#[derive(Debug, Clone)]
pub struct Machine {
    role: Role,
    state: State,
}

impl Machine {
    /// Create a machine in the idle state for the given role.
    pub fn new(role: Role) -> Self {
        Machine {
            role,
            state: State::Sta1,
        }
    }

    /// The current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// The local role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether the association is established
    /// and data transfer is permitted.
    pub fn is_established(&self) -> bool {
        self.state == State::Sta6
    }

    /// Feed one event into the machine,
    /// advancing the state and returning the instructions to carry out.
    pub fn handle(&mut self, event: Event) -> &'static [Action] {
        let Transition { next, actions } = transition(self.role, self.state, event);
        tracing::trace!(
            "{:?} + {:?} -> {:?} {:?}",
            self.state,
            event,
            next,
            actions
        );
        self.state = next;
        actions
    }
}

/// Translate an arriving PDU into its machine event.
pub fn event_for_incoming(pdu: &crate::pdu::Pdu) -> Event {
    use crate::pdu::Pdu;
    match pdu {
        Pdu::AssociationRQ { .. } => Event::AssociateRqReceived,
        Pdu::AssociationAC { .. } => Event::AssociateAcReceived,
        Pdu::AssociationRJ { .. } => Event::AssociateRjReceived,
        Pdu::PData { .. } => Event::PDataReceived,
        Pdu::ReleaseRQ => Event::ReleaseRqReceived,
        Pdu::ReleaseRP => Event::ReleaseRpReceived,
        Pdu::AbortRQ { .. } => Event::AbortReceived,
        Pdu::Unknown { .. } => Event::InvalidPduReceived,
    }
}

/// Translate an outgoing PDU into the primitive event
/// that requests its transmission.
pub fn event_for_outgoing(pdu: &crate::pdu::Pdu) -> Event {
    use crate::pdu::Pdu;
    match pdu {
        Pdu::AssociationRQ { .. } => Event::AssociateRequest,
        Pdu::AssociationAC { .. } => Event::AssociateResponseAccept,
        Pdu::AssociationRJ { .. } => Event::AssociateResponseReject,
        Pdu::PData { .. } => Event::PDataRequest,
        Pdu::ReleaseRQ => Event::ReleaseRequest,
        Pdu::ReleaseRP => Event::ReleaseResponse,
        Pdu::AbortRQ { .. } => Event::AbortRequest,
        Pdu::Unknown { .. } => Event::AbortRequest,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// every (role, state, event) combination resolves to a transition
    /// and illegal PDU arrivals on a live association produce an abort
    #[test]
    fn table_is_total() {
        for role in [Role::Requestor, Role::Acceptor] {
            for state in State::ALL {
                for event in Event::ALL {
                    let t = transition(role, state, event);
                    // no transition may leave the machine without a next state
                    // (vacuously true by type, but exercise every row)
                    assert!(State::ALL.contains(&t.next));
                }
            }
        }
    }

    #[test]
    fn pdus_in_wrong_state_trigger_abort() {
        for event in [
            Event::AssociateAcReceived,
            Event::AssociateRjReceived,
            Event::AssociateRqReceived,
            Event::ReleaseRpReceived,
        ] {
            let t = transition(Role::Acceptor, State::Sta6, event);
            assert_eq!(t.next, State::Sta13);
            assert!(t
                .actions
                .contains(&Action::SendPdu(PduHint::AbortUnexpectedPdu)));
        }
    }

    #[test]
    fn requestor_establishment_path() {
        let mut m = Machine::new(Role::Requestor);
        assert_eq!(m.handle(Event::AssociateRequest), &[Action::OpenTransport]);
        assert_eq!(m.state(), State::Sta4);
        assert_eq!(
            m.handle(Event::TransportConnected),
            &[Action::SendPdu(PduHint::AssociateRq)]
        );
        assert_eq!(m.state(), State::Sta5);
        m.handle(Event::AssociateAcReceived);
        assert!(m.is_established());
    }

    #[test]
    fn acceptor_establishment_path() {
        let mut m = Machine::new(Role::Acceptor);
        m.handle(Event::TransportConnectionIndication);
        assert_eq!(m.state(), State::Sta2);
        let actions = m.handle(Event::AssociateRqReceived);
        assert_eq!(
            actions,
            &[Action::StopArtim, Action::Indicate(Indication::Associate)]
        );
        assert_eq!(m.state(), State::Sta3);
        m.handle(Event::AssociateResponseAccept);
        assert!(m.is_established());
    }

    #[test]
    fn rejection_returns_to_idle() {
        let mut m = Machine::new(Role::Acceptor);
        m.handle(Event::TransportConnectionIndication);
        m.handle(Event::AssociateRqReceived);
        let actions = m.handle(Event::AssociateResponseReject);
        assert_eq!(
            actions,
            &[Action::SendPdu(PduHint::AssociateRj), Action::StartArtim]
        );
        assert_eq!(m.state(), State::Sta13);
        m.handle(Event::TransportClosed);
        assert_eq!(m.state(), State::Sta1);
    }

    #[test]
    fn orderly_release_from_either_side() {
        // local side requests the release
        let mut m = Machine::new(Role::Requestor);
        m.handle(Event::AssociateRequest);
        m.handle(Event::TransportConnected);
        m.handle(Event::AssociateAcReceived);
        assert_eq!(
            m.handle(Event::ReleaseRequest),
            &[Action::SendPdu(PduHint::ReleaseRq), Action::StartArtim]
        );
        assert_eq!(m.state(), State::Sta7);
        let actions = m.handle(Event::ReleaseRpReceived);
        assert!(actions.contains(&Action::Indicate(Indication::ReleaseConfirmed)));
        assert!(actions.contains(&Action::CloseTransport));
        assert_eq!(m.state(), State::Sta1);

        // peer requests the release
        let mut m = Machine::new(Role::Acceptor);
        m.handle(Event::TransportConnectionIndication);
        m.handle(Event::AssociateRqReceived);
        m.handle(Event::AssociateResponseAccept);
        assert_eq!(
            m.handle(Event::ReleaseRqReceived),
            &[Action::Indicate(Indication::Release)]
        );
        assert_eq!(m.state(), State::Sta8);
        assert_eq!(
            m.handle(Event::ReleaseResponse),
            &[Action::SendPdu(PduHint::ReleaseRp), Action::StartArtim]
        );
        assert_eq!(m.state(), State::Sta13);
        m.handle(Event::TransportClosed);
        assert_eq!(m.state(), State::Sta1);
    }

    /// both sides issue A-RELEASE-RQ within the same round trip
    /// and both come back to rest without aborting
    #[test]
    fn release_collision_both_roles() {
        // requestor: Sta7 -> Sta9 -> Sta11 -> Sta1
        let mut m = Machine::new(Role::Requestor);
        m.handle(Event::AssociateRequest);
        m.handle(Event::TransportConnected);
        m.handle(Event::AssociateAcReceived);
        m.handle(Event::ReleaseRequest);
        assert_eq!(
            m.handle(Event::ReleaseRqReceived),
            &[Action::Indicate(Indication::ReleaseCollision)]
        );
        assert_eq!(m.state(), State::Sta9);
        assert_eq!(
            m.handle(Event::ReleaseResponse),
            &[Action::SendPdu(PduHint::ReleaseRp)]
        );
        assert_eq!(m.state(), State::Sta11);
        let actions = m.handle(Event::ReleaseRpReceived);
        assert!(actions.contains(&Action::CloseTransport));
        assert_eq!(m.state(), State::Sta1);

        // acceptor: Sta7 -> Sta10 -> Sta12 -> Sta13 -> Sta1
        let mut m = Machine::new(Role::Acceptor);
        m.handle(Event::TransportConnectionIndication);
        m.handle(Event::AssociateRqReceived);
        m.handle(Event::AssociateResponseAccept);
        m.handle(Event::ReleaseRequest);
        assert_eq!(m.state(), State::Sta7);
        m.handle(Event::ReleaseRqReceived);
        assert_eq!(m.state(), State::Sta10);
        m.handle(Event::ReleaseRpReceived);
        assert_eq!(m.state(), State::Sta12);
        assert_eq!(
            m.handle(Event::ReleaseResponse),
            &[Action::SendPdu(PduHint::ReleaseRp), Action::StartArtim]
        );
        assert_eq!(m.state(), State::Sta13);
        m.handle(Event::TransportClosed);
        assert_eq!(m.state(), State::Sta1);
    }

    #[test]
    fn artim_expiry_during_release_aborts() {
        for state in [State::Sta7, State::Sta10, State::Sta11, State::Sta12] {
            let t = transition(Role::Requestor, state, Event::ArtimExpired);
            assert_eq!(t.next, State::Sta13);
            assert!(t
                .actions
                .contains(&Action::SendPdu(PduHint::AbortUnexpectedPdu)));
        }
    }

    #[test]
    fn abort_is_permitted_anywhere() {
        for state in State::ALL {
            let t = transition(Role::Requestor, state, Event::AbortRequest);
            assert!(matches!(t.next, State::Sta1 | State::Sta13));
        }
    }
}
