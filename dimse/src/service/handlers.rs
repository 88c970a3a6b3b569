//! Intervention handlers and notification events.
//!
//! The service provider reacts to incoming requests
//! by calling *intervention handlers*:
//! exactly one handler may be installed per intervention event,
//! and its return value becomes the outgoing response.
//! A handler that panics is caught and reported to the peer
//! as a service-specific failure status
//! without tearing down the association.
//!
//! *Notification events* are informational:
//! any number of subscribers may observe them,
//! and a panicking subscriber is logged and ignored.

use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dicom_object::InMemDicomObject;
use tracing::warn;

use netdicom_ul::pdu::UserIdentity;

use crate::Status;

/// A cooperative cancellation signal for query-style handlers.
///
/// The dispatcher trips the token when a C-CANCEL arrives
/// for the operation the handler is serving;
/// handlers should poll it between matches.
#[derive(Debug, Default, Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the operation was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Trip the token.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// An incoming C-STORE request.
#[derive(Debug)]
pub struct StoreRequest {
    /// the presentation context the request arrived on
    pub presentation_context_id: u8,
    /// the transfer syntax of the data set bytes
    pub transfer_syntax: String,
    /// the SOP class UID of the instance
    pub sop_class_uid: String,
    /// the SOP instance UID of the instance
    pub sop_instance_uid: String,
    /// the raw data set bytes
    pub data: Vec<u8>,
}

/// The single intervention handler for C-STORE requests.
pub trait StoreHandler: Send + Sync {
    /// Keep (or dispose of) the instance and report the outcome.
    fn handle_store(&self, request: StoreRequest) -> Status;
}

/// An incoming C-FIND request.
#[derive(Debug)]
pub struct QueryRequest {
    /// the presentation context the request arrived on
    pub presentation_context_id: u8,
    /// the SOP class UID of the information model
    pub sop_class_uid: String,
    /// the decoded query identifier
    pub identifier: InMemDicomObject,
}

/// The finite sequence of responses produced by a query-style handler:
/// zero or more pending matches, then one final status.
///
/// The dispatcher appends the final success status
/// if the sequence ends without one.
pub type QueryResponses = Box<dyn Iterator<Item = (Status, Option<InMemDicomObject>)> + Send>;

/// The single intervention handler for C-FIND requests.
pub trait FindHandler: Send + Sync {
    /// Yield the matches for the given query.
    fn handle_find(&self, request: QueryRequest, cancel: CancelToken) -> QueryResponses;
}

/// The instances produced by a retrieve handler (C-GET or C-MOVE):
/// the announced number of C-STORE sub-operations,
/// then one instance per sub-operation.
pub struct RetrieveResponses {
    /// how many C-STORE sub-operations will be performed
    pub sub_operations: u16,
    /// the instances to transfer:
    /// SOP class UID, SOP instance UID, data set
    pub instances: Box<dyn Iterator<Item = (String, String, InMemDicomObject)> + Send>,
}

impl std::fmt::Debug for RetrieveResponses {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrieveResponses")
            .field("sub_operations", &self.sub_operations)
            .finish_non_exhaustive()
    }
}

/// The single intervention handler for C-GET requests.
pub trait GetHandler: Send + Sync {
    /// Resolve the identifier into the instances to transfer.
    fn handle_get(&self, request: QueryRequest, cancel: CancelToken) -> RetrieveResponses;
}

/// The single intervention handler for C-MOVE requests.
pub trait MoveHandler: Send + Sync {
    /// Resolve a move destination AE title into a socket address,
    /// or decline it.
    fn resolve_destination(&self, destination_aet: &str) -> Option<SocketAddr>;

    /// Resolve the identifier into the instances to transfer.
    fn handle_move(&self, request: QueryRequest, cancel: CancelToken) -> RetrieveResponses;
}

/// An incoming DIMSE-N request.
#[derive(Debug)]
pub struct NRequest {
    /// the presentation context the request arrived on
    pub presentation_context_id: u8,
    /// the decoded command set
    pub command: InMemDicomObject,
    /// the raw data set bytes, when present
    pub data: Option<Vec<u8>>,
}

/// The response of a DIMSE-N handler method.
#[derive(Debug)]
pub struct NResponse {
    /// the outcome of the operation
    pub status: Status,
    /// the data set to attach to the response, if any
    pub dataset: Option<InMemDicomObject>,
}

impl NResponse {
    /// A response refusing the operation as unrecognized.
    pub fn unrecognized() -> Self {
        NResponse {
            status: Status::UNRECOGNIZED_OPERATION,
            dataset: None,
        }
    }
}

/// The single intervention handler for the DIMSE-N services,
/// with one method per message type.
///
/// Every method declines the operation by default;
/// implementors override the ones their SOP classes support.
pub trait NServiceHandler: Send + Sync {
    fn handle_event_report(&self, _request: NRequest) -> NResponse {
        NResponse::unrecognized()
    }

    fn handle_get(&self, _request: NRequest) -> NResponse {
        NResponse::unrecognized()
    }

    fn handle_set(&self, _request: NRequest) -> NResponse {
        NResponse::unrecognized()
    }

    fn handle_action(&self, _request: NRequest) -> NResponse {
        NResponse::unrecognized()
    }

    fn handle_create(&self, _request: NRequest) -> NResponse {
        NResponse::unrecognized()
    }

    fn handle_delete(&self, _request: NRequest) -> NResponse {
        NResponse::unrecognized()
    }
}

/// The outcome of user identity validation.
#[derive(Debug, Clone)]
pub enum IdentityOutcome {
    /// proceed with the association;
    /// the blob (when given) is returned to the requestor
    /// if a positive response was requested
    Accept(Option<Vec<u8>>),
    /// reject the association
    Reject,
}

/// The extended negotiation hooks,
/// consulted while an association request is being answered.
///
/// The default implementation accepts identities silently,
/// mirrors no extended items
/// and leaves the asynchronous operations window unanswered.
pub trait ExtendedNegotiationHandler: Send + Sync {
    /// Validate a user identity negotiation request.
    fn handle_user_identity(&self, _identity: &UserIdentity) -> IdentityOutcome {
        IdentityOutcome::Accept(None)
    }

    /// Answer an asynchronous operations window proposal.
    fn handle_async_ops_window(&self, _invoked: u16, _performed: u16) -> Option<(u16, u16)> {
        None
    }

    /// Answer a SOP class extended negotiation proposal.
    fn handle_sop_class_extended(&self, _sop_class_uid: &str, _info: &[u8]) -> Option<Vec<u8>> {
        None
    }

    /// Observe a SOP class common extended negotiation proposal.
    fn handle_sop_class_common_extended(
        &self,
        _sop_class_uid: &str,
        _service_class_uid: &str,
        _related: &[String],
    ) {
    }
}

/// An [`ExtendedNegotiationHandler`] with all defaults.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultNegotiation;

impl ExtendedNegotiationHandler for DefaultNegotiation {}

/// The intervention handler registry:
/// one optional slot per intervention event.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    pub(crate) store: Option<Arc<dyn StoreHandler>>,
    pub(crate) find: Option<Arc<dyn FindHandler>>,
    pub(crate) get: Option<Arc<dyn GetHandler>>,
    pub(crate) mov: Option<Arc<dyn MoveHandler>>,
    pub(crate) n_service: Option<Arc<dyn NServiceHandler>>,
    pub(crate) negotiation: Option<Arc<dyn ExtendedNegotiationHandler>>,
    /// answers C-ECHO when installed; the provider answers success
    /// on its own otherwise
    pub(crate) echo: Option<Arc<dyn Fn() -> Status + Send + Sync>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("store", &self.store.is_some())
            .field("find", &self.find.is_some())
            .field("get", &self.get.is_some())
            .field("mov", &self.mov.is_some())
            .field("n_service", &self.n_service.is_some())
            .field("negotiation", &self.negotiation.is_some())
            .field("echo", &self.echo.is_some())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the C-ECHO handler.
    pub fn on_echo(mut self, handler: impl Fn() -> Status + Send + Sync + 'static) -> Self {
        self.echo = Some(Arc::new(handler));
        self
    }

    /// Install the C-STORE handler.
    pub fn on_store(mut self, handler: impl StoreHandler + 'static) -> Self {
        self.store = Some(Arc::new(handler));
        self
    }

    /// Install the C-FIND handler.
    pub fn on_find(mut self, handler: impl FindHandler + 'static) -> Self {
        self.find = Some(Arc::new(handler));
        self
    }

    /// Install the C-GET handler.
    pub fn on_get(mut self, handler: impl GetHandler + 'static) -> Self {
        self.get = Some(Arc::new(handler));
        self
    }

    /// Install the C-MOVE handler.
    pub fn on_move(mut self, handler: impl MoveHandler + 'static) -> Self {
        self.mov = Some(Arc::new(handler));
        self
    }

    /// Install the DIMSE-N handler.
    pub fn on_n_service(mut self, handler: impl NServiceHandler + 'static) -> Self {
        self.n_service = Some(Arc::new(handler));
        self
    }

    /// Install the extended negotiation hooks.
    pub fn on_negotiation(mut self, handler: impl ExtendedNegotiationHandler + 'static) -> Self {
        self.negotiation = Some(Arc::new(handler));
        self
    }
}

/// A notification event observed on a service provider or user.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Notification {
    /// a transport connection was accepted
    ConnectionOpen { peer: SocketAddr },
    /// an association was established
    AssociationEstablished { peer_ae_title: String },
    /// an association request was rejected
    AssociationRejected,
    /// an association was released in an orderly way
    AssociationReleased,
    /// an association was aborted
    AssociationAborted,
    /// a complete DIMSE message arrived
    MessageReceived { context_id: u8, command_field: u16 },
    /// a complete DIMSE message was sent
    MessageSent { context_id: u8, command_field: u16 },
}

/// A subscriber-model bus for notification events.
///
/// Subscribers run synchronously in subscription order;
/// a panicking subscriber is logged and does not affect the others.
#[derive(Default, Clone)]
pub struct EventBus {
    subscribers: Vec<Arc<dyn Fn(&Notification) + Send + Sync>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber for all notification events.
    pub fn subscribe(&mut self, subscriber: impl Fn(&Notification) + Send + Sync + 'static) {
        self.subscribers.push(Arc::new(subscriber));
    }

    /// Publish one event to every subscriber.
    pub fn publish(&self, notification: &Notification) {
        for subscriber in &self.subscribers {
            if catch_unwind(AssertUnwindSafe(|| subscriber(notification))).is_err() {
                warn!("event subscriber panicked on {:?}", notification);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn cancel_token_trips_once() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn event_bus_swallows_panicking_subscribers() {
        let mut bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        bus.subscribe(|_| panic!("misbehaving subscriber"));
        let seen2 = Arc::clone(&seen);
        bus.subscribe(move |_| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&Notification::AssociationReleased);
        bus.publish(&Notification::AssociationAborted);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
