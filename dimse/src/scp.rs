//! The service provider side:
//! a listener loop which spawns one task per accepted association,
//! and the dispatcher which routes incoming messages
//! to the registered intervention handlers.
//!
//! Each association is served by exactly one task
//! which owns the socket, the protocol machine and the timers,
//! so state transitions are serialized without locking.
//! Handlers for the one-shot events (echo, store, the N services)
//! run on the blocking worker pool
//! so that a slow handler does not stall the reactor;
//! query-style handlers yield their response sequences
//! on the association task,
//! which polls for C-CANCEL between responses.

use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use snafu::{IntoError, OptionExt, ResultExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use netdicom_ul::association::server::{
    AccessControl, ServerAssociation, ServerAssociationOptions, UserIdentityPolicy,
};
use netdicom_ul::association::{Association, TimerOptions};
use netdicom_ul::pdu::{AssociationRJServiceUserReason, UserIdentity, UserVariableItem};
use netdicom_ul::transport;

use crate::assoc::DimseAssociation;
use crate::commands::{
    CEchoRsp, CFindRsp, CGetRsp, CMoveRsp, CStoreRq, CStoreRsp, Command, CommandField,
    NActionRsp, NCreateRsp, NDeleteRsp, NEventReportRsp, NGetRsp, NSetRsp, SubOperationCounts,
};
use crate::config::Config;
use crate::error::{BindSnafu, DecodeDataSnafu, UnknownTransferSyntaxSnafu};
use crate::message::DimseMessage;
use crate::service::handlers::{
    CancelToken, EventBus, HandlerRegistry, IdentityOutcome, NRequest, Notification, QueryRequest,
    RetrieveResponses, StoreRequest,
};
use crate::service::{self, QueryRetrieveMessage, ServiceClassKind};
use crate::status::Status;
use crate::{Error, Result};

/// How long to peek for an interleaved C-CANCEL
/// between the responses of a pending operation.
const CANCEL_POLL: Duration = Duration::from_millis(5);

/// The options of a DIMSE service provider.
#[derive(Debug, Clone)]
pub struct ScpOptions {
    /// the application entity title of this provider
    pub ae_title: String,
    /// the maximum PDU length announced to peers
    pub max_pdu_length: u32,
    /// whether inbound PDUs may not surpass the announced maximum
    pub strict: bool,
    /// whether to accept unknown abstract syntaxes
    pub promiscuous: bool,
    /// the accept backlog of the listener
    pub backlog: u32,
    /// the accepted transfer syntaxes, in preference order
    /// (empty accepts anything the registry can decode)
    pub transfer_syntaxes: Vec<String>,
    /// the timer configuration applied to every association
    pub timers: TimerOptions,
    /// the intervention handlers
    pub handlers: HandlerRegistry,
    /// the notification event subscribers
    pub events: EventBus,
    /// the engine configuration
    pub config: Config,
}

impl Default for ScpOptions {
    fn default() -> Self {
        ScpOptions {
            ae_title: "THIS-SCP".to_string(),
            max_pdu_length: netdicom_ul::pdu::DEFAULT_MAX_PDU,
            strict: true,
            promiscuous: false,
            backlog: 128,
            transfer_syntaxes: Vec::new(),
            timers: TimerOptions::default(),
            handlers: HandlerRegistry::new(),
            events: EventBus::new(),
            config: Config::global().clone(),
        }
    }
}

impl ScpOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// The abstract syntaxes this provider serves,
    /// derived from the installed handlers:
    /// verification always,
    /// plus the registered SOP classes of each service class
    /// with a handler in place.
    fn supported_abstract_syntaxes(&self) -> Vec<String> {
        let mut uids = service::uids_of(ServiceClassKind::Verification);
        if self.handlers.store.is_some() || self.config.unrestricted_storage {
            uids.extend(service::uids_of(ServiceClassKind::Storage));
        }
        if self.handlers.find.is_some() {
            uids.extend(
                service::uids_of(ServiceClassKind::QueryRetrieve)
                    .into_iter()
                    .filter(|uid| {
                        service::lookup(uid)
                            .and_then(|e| e.message_type)
                            == Some(QueryRetrieveMessage::Find)
                    }),
            );
            uids.extend(service::uids_of(ServiceClassKind::BasicWorklist));
        }
        if self.handlers.get.is_some() {
            uids.extend(
                service::uids_of(ServiceClassKind::QueryRetrieve)
                    .into_iter()
                    .filter(|uid| {
                        service::lookup(uid)
                            .and_then(|e| e.message_type)
                            == Some(QueryRetrieveMessage::Get)
                    }),
            );
        }
        if self.handlers.mov.is_some() {
            uids.extend(
                service::uids_of(ServiceClassKind::QueryRetrieve)
                    .into_iter()
                    .filter(|uid| {
                        service::lookup(uid)
                            .and_then(|e| e.message_type)
                            == Some(QueryRetrieveMessage::Move)
                    }),
            );
        }
        uids
    }
}

/// Bridges the extended negotiation hooks
/// into the association acceptor's access control
/// and user identity answering.
///
/// The identity decision is taken once per association
/// (during access control) and reused for the response item.
#[derive(Debug, Clone)]
struct NegotiationAdapter {
    inner: Arc<NegotiationAdapterInner>,
}

struct NegotiationAdapterInner {
    handler: Option<Arc<dyn crate::service::ExtendedNegotiationHandler>>,
    decided: Mutex<Option<IdentityOutcome>>,
}

impl std::fmt::Debug for NegotiationAdapterInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiationAdapterInner")
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

impl NegotiationAdapter {
    fn new(handler: Option<Arc<dyn crate::service::ExtendedNegotiationHandler>>) -> Self {
        NegotiationAdapter {
            inner: Arc::new(NegotiationAdapterInner {
                handler,
                decided: Mutex::new(None),
            }),
        }
    }
}

impl AccessControl for NegotiationAdapter {
    fn check_access(
        &self,
        _this_ae_title: &str,
        _calling_ae_title: &str,
        _called_ae_title: &str,
        user_identity: Option<&UserIdentity>,
    ) -> std::result::Result<(), AssociationRJServiceUserReason> {
        if let (Some(handler), Some(identity)) = (&self.inner.handler, user_identity) {
            let outcome = handler.handle_user_identity(identity);
            if matches!(outcome, IdentityOutcome::Reject) {
                return Err(AssociationRJServiceUserReason::NoReasonGiven);
            }
            *self.inner.decided.lock().expect("identity decision poisoned") = Some(outcome);
        }
        Ok(())
    }
}

impl UserIdentityPolicy for NegotiationAdapter {
    fn respond(&self, identity: &UserIdentity) -> Option<Vec<u8>> {
        if !identity.positive_response_requested() {
            return None;
        }
        match self
            .inner
            .decided
            .lock()
            .expect("identity decision poisoned")
            .take()
        {
            Some(IdentityOutcome::Accept(blob)) => blob,
            _ => None,
        }
    }
}

/// Listen on the given address and serve every accepted connection
/// on its own task, indefinitely.
pub async fn serve(addr: SocketAddr, options: ScpOptions) -> Result<()> {
    let listener = transport::bind(addr, options.backlog)
        .await
        .context(BindSnafu)?;
    info!("{} listening on {}", options.ae_title, addr);
    let options = Arc::new(options);
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("could not accept connection: {}", e);
                continue;
            }
        };
        let options = Arc::clone(&options);
        tokio::spawn(async move {
            if let Err(e) = run_association(socket, peer, options).await {
                warn!(
                    "association with {} ended with error: {}",
                    peer,
                    snafu::Report::from_error(e)
                );
            }
        });
    }
}

/// Serve a single accepted connection:
/// negotiate the association
/// and dispatch its messages until it ends.
pub async fn run_association(
    socket: TcpStream,
    peer: SocketAddr,
    options: Arc<ScpOptions>,
) -> Result<()> {
    options.events.publish(&Notification::ConnectionOpen { peer });

    let adapter = NegotiationAdapter::new(options.handlers.negotiation.clone());
    let mut ul_options = ServerAssociationOptions::new()
        .ae_access_control(adapter.clone())
        .user_identity_policy(adapter)
        .ae_title(options.ae_title.clone())
        .max_pdu_length(options.max_pdu_length)
        .strict(options.strict)
        .promiscuous(options.promiscuous || options.config.unrestricted_storage)
        .timers(options.timers);

    for uid in options.supported_abstract_syntaxes() {
        ul_options = ul_options.with_abstract_syntax(uid.clone());
        // a C-GET provider is willing to reverse storage roles
        if options.handlers.get.is_some()
            && service::lookup(&uid).map(|e| e.service_class) == Some(ServiceClassKind::Storage)
        {
            ul_options = ul_options.with_role_selection(
                uid,
                true,
                options.handlers.store.is_some() || options.config.unrestricted_storage,
            );
        }
    }
    for ts in &options.transfer_syntaxes {
        ul_options = ul_options.with_transfer_syntax(ts.clone());
    }

    let association = match ul_options.establish(socket).await {
        Ok(association) => association,
        Err(e) => {
            options.events.publish(&Notification::AssociationRejected);
            return Err(e.into());
        }
    };
    options.events.publish(&Notification::AssociationEstablished {
        peer_ae_title: association.peer_ae_title().to_string(),
    });

    observe_negotiation_items(&options, association.peer_user_variables());

    let mut dimse = DimseAssociation::new(association);
    loop {
        let received = if options.config.store_recv_chunked {
            dimse.recv_chunked().await
        } else {
            dimse.recv().await
        };
        match received {
            Ok(message) => {
                options.events.publish(&Notification::MessageReceived {
                    context_id: message.presentation_context_id,
                    command_field: message.command_field().unwrap_or(0),
                });
                dispatch(&mut dimse, &options, message).await?;
            }
            Err(Error::Released { .. }) => {
                dimse.inner_mut().confirm_release().await.map_err(Error::from)?;
                options.events.publish(&Notification::AssociationReleased);
                return Ok(());
            }
            Err(Error::Aborted { .. }) => {
                options.events.publish(&Notification::AssociationAborted);
                return Ok(());
            }
            Err(e) => {
                let _ = dimse.abort().await;
                options.events.publish(&Notification::AssociationAborted);
                return Err(e);
            }
        }
    }
}

/// Surface the peer's extended negotiation items
/// to the negotiation hooks after establishment.
fn observe_negotiation_items(options: &ScpOptions, user_variables: &[UserVariableItem]) {
    let handler = match &options.handlers.negotiation {
        Some(handler) => handler,
        None => return,
    };
    for item in user_variables {
        match item {
            UserVariableItem::AsyncOperationsWindow(invoked, performed) => {
                let _ = handler.handle_async_ops_window(*invoked, *performed);
            }
            UserVariableItem::SopClassExtendedNegotiationSubItem(uid, info) => {
                let _ = handler.handle_sop_class_extended(uid, info);
            }
            UserVariableItem::SopClassCommonExtendedNegotiationSubItem(common) => {
                handler.handle_sop_class_common_extended(
                    &common.sop_class_uid,
                    &common.service_class_uid,
                    &common.related_general_sop_classes,
                );
            }
            _ => {}
        }
    }
}

type Scp = DimseAssociation<ServerAssociation<TcpStream>>;

/// Route one complete message to its handler
/// and send the response(s).
async fn dispatch(dimse: &mut Scp, options: &ScpOptions, message: DimseMessage) -> Result<()> {
    let field = match message
        .command_field()
        .ok()
        .and_then(|code| CommandField::from_code(code).map(|f| (code, f)))
    {
        Some((_code, field)) => field,
        None => {
            warn!("message with unrecognized command field; ignoring");
            return Ok(());
        }
    };

    // chunked receive only pays off for storage;
    // any other message gets its data set collected whole
    let mut message = message;
    if message.dataset.is_none()
        && message.declares_dataset()
        && field != CommandField::CStoreRq
    {
        let mut data = Vec::new();
        while let Some(chunk) = dimse.read_dataset_chunk().await? {
            data.extend_from_slice(&chunk);
        }
        message.dataset = Some(data);
    }

    match field {
        CommandField::CEchoRq => handle_echo(dimse, options, message).await,
        CommandField::CStoreRq => handle_store(dimse, options, message).await,
        CommandField::CFindRq => handle_find(dimse, options, message).await,
        CommandField::CGetRq => handle_get(dimse, options, message).await,
        CommandField::CMoveRq => handle_move(dimse, options, message).await,
        CommandField::NEventReportRq
        | CommandField::NGetRq
        | CommandField::NSetRq
        | CommandField::NActionRq
        | CommandField::NCreateRq
        | CommandField::NDeleteRq => handle_n_service(dimse, options, message, field).await,
        CommandField::CCancelRq => {
            // no pending operation to interrupt
            debug!("stray C-CANCEL ignored");
            Ok(())
        }
        _ => {
            warn!("unexpected {:?} at the service provider; ignoring", field);
            Ok(())
        }
    }
}

async fn handle_echo(dimse: &mut Scp, options: &ScpOptions, message: DimseMessage) -> Result<()> {
    let message_id = message.message_id()?;
    let sop_class_uid = message.affected_sop_class_uid().ok();

    let status = match options.handlers.echo.clone() {
        Some(handler) => tokio::task::spawn_blocking(move || (*handler)())
            .await
            .unwrap_or(Status::PROCESSING_FAILURE),
        None => Status::SUCCESS,
    };

    let rsp = CEchoRsp::builder()
        .message_id_being_responded_to(message_id)
        .maybe_affected_sop_class_uid(sop_class_uid.as_deref())
        .status(status.code())
        .build();
    send_response(dimse, options, message.presentation_context_id, &rsp, None).await
}

async fn handle_store(dimse: &mut Scp, options: &ScpOptions, message: DimseMessage) -> Result<()> {
    let context_id = message.presentation_context_id;
    let message_id = message.message_id()?;
    let sop_class_uid = message.affected_sop_class_uid()?;
    let sop_instance_uid = message.affected_sop_instance_uid()?;

    // collect the data set, streaming it chunk by chunk
    // when chunked receive is in effect
    let data = match message.dataset {
        Some(data) => data,
        None if message.declares_dataset() => {
            let mut data = Vec::new();
            while let Some(chunk) = dimse.read_dataset_chunk().await? {
                data.extend_from_slice(&chunk);
            }
            data
        }
        None => Vec::new(),
    };

    let known = options.config.unrestricted_storage
        || service::lookup(&sop_class_uid)
            .map(|e| e.service_class == ServiceClassKind::Storage)
            .unwrap_or(false);

    let status = if !known {
        Status::SOP_CLASS_NOT_SUPPORTED
    } else if !options.config.check_uid(&sop_instance_uid) {
        warn!("refusing instance with invalid SOP instance UID");
        Status::STORAGE_CANNOT_UNDERSTAND
    } else {
        match options.handlers.store.clone() {
            Some(handler) => {
                let request = StoreRequest {
                    presentation_context_id: context_id,
                    transfer_syntax: dimse.transfer_syntax(context_id)?,
                    sop_class_uid: sop_class_uid.clone(),
                    sop_instance_uid: sop_instance_uid.clone(),
                    data,
                };
                tokio::task::spawn_blocking(move || handler.handle_store(request))
                    .await
                    .unwrap_or_else(|e| {
                        warn!("C-STORE handler panicked: {}", e);
                        Status::STORAGE_CANNOT_UNDERSTAND
                    })
            }
            None => Status::SOP_CLASS_NOT_SUPPORTED,
        }
    };

    let rsp = CStoreRsp::builder()
        .message_id_being_responded_to(message_id)
        .affected_sop_class_uid(sop_class_uid.as_str())
        .affected_sop_instance_uid(sop_instance_uid.as_str())
        .status(status.code())
        .build();
    send_response(dimse, options, context_id, &rsp, None).await
}

/// Decode the identifier data set of a query-style request.
fn decode_identifier(dimse: &Scp, message: &DimseMessage) -> Result<InMemDicomObject> {
    let ts_uid = dimse.transfer_syntax(message.presentation_context_id)?;
    let ts = TransferSyntaxRegistry
        .get(&ts_uid)
        .context(UnknownTransferSyntaxSnafu { uid: ts_uid })?;
    let bytes = message.dataset.as_deref().unwrap_or(&[]);
    InMemDicomObject::read_dataset_with_ts(bytes, ts)
        .map_err(Box::from)
        .map_err(|source| DecodeDataSnafu.into_error(source))
}

/// Check for an interleaved C-CANCEL answering `message_id`.
/// Other messages arriving early are pushed back for later dispatch.
async fn cancel_requested(dimse: &mut Scp, message_id: u16) -> Result<bool> {
    match dimse.try_recv_for(CANCEL_POLL).await? {
        Some(message) => {
            let is_cancel = message.command_field().ok()
                == Some(CommandField::CCancelRq as u16)
                && message.message_id_being_responded_to().ok() == Some(message_id);
            if is_cancel {
                Ok(true)
            } else {
                dimse.requeue(message);
                Ok(false)
            }
        }
        None => Ok(false),
    }
}

async fn handle_find(dimse: &mut Scp, options: &ScpOptions, message: DimseMessage) -> Result<()> {
    let context_id = message.presentation_context_id;
    let message_id = message.message_id()?;
    let sop_class_uid = message.affected_sop_class_uid()?;

    let handler = match options.handlers.find.clone() {
        Some(handler) => handler,
        None => {
            let rsp = CFindRsp::builder()
                .message_id_being_responded_to(message_id)
                .affected_sop_class_uid(sop_class_uid.as_str())
                .status(Status::SOP_CLASS_NOT_SUPPORTED.code())
                .build();
            return send_response(dimse, options, context_id, &rsp, None).await;
        }
    };

    let identifier = decode_identifier(dimse, &message)?;
    if options.config.log_request_identifiers {
        debug!("C-FIND identifier: {:?}", identifier);
    }
    let cancel = CancelToken::new();
    let request = QueryRequest {
        presentation_context_id: context_id,
        sop_class_uid: sop_class_uid.clone(),
        identifier,
    };

    let mut responses = match catch_unwind(AssertUnwindSafe(|| {
        handler.handle_find(request, cancel.clone())
    })) {
        Ok(responses) => responses,
        Err(_) => {
            warn!("C-FIND handler panicked");
            let rsp = CFindRsp::builder()
                .message_id_being_responded_to(message_id)
                .affected_sop_class_uid(sop_class_uid.as_str())
                .status(0xC311)
                .build();
            return send_response(dimse, options, context_id, &rsp, None).await;
        }
    };

    loop {
        if cancel_requested(dimse, message_id).await? {
            cancel.cancel();
            let rsp = CFindRsp::builder()
                .message_id_being_responded_to(message_id)
                .affected_sop_class_uid(sop_class_uid.as_str())
                .status(Status::CANCEL.code())
                .build();
            return send_response(dimse, options, context_id, &rsp, None).await;
        }

        let next = match catch_unwind(AssertUnwindSafe(|| responses.next())) {
            Ok(next) => next,
            Err(_) => {
                warn!("C-FIND handler panicked while matching");
                Some((Status(0xC311), None))
            }
        };

        match next {
            Some((status, identifier)) => {
                let rsp = CFindRsp::builder()
                    .message_id_being_responded_to(message_id)
                    .affected_sop_class_uid(sop_class_uid.as_str())
                    .status(status.code())
                    .build();
                send_response(dimse, options, context_id, &rsp, identifier.as_ref()).await?;
                if status.is_final() {
                    return Ok(());
                }
            }
            None => {
                // the handler ran dry without a final status
                let rsp = CFindRsp::builder()
                    .message_id_being_responded_to(message_id)
                    .affected_sop_class_uid(sop_class_uid.as_str())
                    .status(Status::SUCCESS.code())
                    .build();
                return send_response(dimse, options, context_id, &rsp, None).await;
            }
        }
    }
}

async fn handle_get(dimse: &mut Scp, options: &ScpOptions, message: DimseMessage) -> Result<()> {
    let context_id = message.presentation_context_id;
    let message_id = message.message_id()?;
    let sop_class_uid = message.affected_sop_class_uid()?;

    let handler = match options.handlers.get.clone() {
        Some(handler) => handler,
        None => {
            let rsp = CGetRsp::builder()
                .message_id_being_responded_to(message_id)
                .affected_sop_class_uid(sop_class_uid.as_str())
                .status(Status::SOP_CLASS_NOT_SUPPORTED.code())
                .build();
            return send_response(dimse, options, context_id, &rsp, None).await;
        }
    };

    let identifier = decode_identifier(dimse, &message)?;
    let cancel = CancelToken::new();
    let request = QueryRequest {
        presentation_context_id: context_id,
        sop_class_uid: sop_class_uid.clone(),
        identifier,
    };

    let RetrieveResponses {
        sub_operations,
        mut instances,
    } = match catch_unwind(AssertUnwindSafe(|| handler.handle_get(request, cancel.clone()))) {
        Ok(responses) => responses,
        Err(_) => {
            warn!("C-GET handler panicked");
            let rsp = CGetRsp::builder()
                .message_id_being_responded_to(message_id)
                .affected_sop_class_uid(sop_class_uid.as_str())
                .status(0xC411)
                .build();
            return send_response(dimse, options, context_id, &rsp, None).await;
        }
    };

    let mut remaining = sub_operations;
    let mut completed = 0u16;
    let mut failed = 0u16;
    let mut warnings = 0u16;

    loop {
        if cancel_requested(dimse, message_id).await? {
            cancel.cancel();
            let rsp = CGetRsp::builder()
                .message_id_being_responded_to(message_id)
                .affected_sop_class_uid(sop_class_uid.as_str())
                .status(Status::CANCEL.code())
                .sub_operations(counts(remaining, completed, failed, warnings))
                .build();
            return send_response(dimse, options, context_id, &rsp, None).await;
        }

        let next = match catch_unwind(AssertUnwindSafe(|| instances.next())) {
            Ok(next) => next,
            Err(_) => {
                warn!("C-GET handler panicked while yielding instances");
                failed = failed.saturating_add(remaining);
                remaining = 0;
                None
            }
        };

        let (instance_class, instance_uid, dataset) = match next {
            Some(instance) => instance,
            None => break,
        };
        remaining = remaining.saturating_sub(1);

        // sub-operations flow over the same association,
        // on a context with reversed storage roles
        let store_status = match dimse.find_context(&instance_class, true) {
            Ok(store_context) => {
                let sub_id = dimse.next_message_id();
                let rq = CStoreRq::builder()
                    .message_id(sub_id)
                    .affected_sop_class_uid(instance_class.as_str())
                    .affected_sop_instance_uid(instance_uid.as_str())
                    .build();
                dimse.send(store_context, &rq, Some(&dataset)).await?;
                wait_store_rsp(dimse, sub_id).await?
            }
            Err(_) => {
                warn!(
                    "no reversed-role context for {}; sub-operation failed",
                    instance_class
                );
                Status(0xA702)
            }
        };

        match store_status.class() {
            crate::StatusClass::Success => completed += 1,
            crate::StatusClass::Warning => warnings += 1,
            _ => failed += 1,
        }

        let rsp = CGetRsp::builder()
            .message_id_being_responded_to(message_id)
            .affected_sop_class_uid(sop_class_uid.as_str())
            .status(Status::PENDING.code())
            .sub_operations(counts(remaining, completed, failed, warnings))
            .build();
        send_response(dimse, options, context_id, &rsp, None).await?;
    }

    let status = if failed > 0 {
        Status(0xB000)
    } else {
        Status::SUCCESS
    };
    let rsp = CGetRsp::builder()
        .message_id_being_responded_to(message_id)
        .affected_sop_class_uid(sop_class_uid.as_str())
        .status(status.code())
        .sub_operations(counts(0, completed, failed, warnings))
        .build();
    send_response(dimse, options, context_id, &rsp, None).await
}

/// Wait for the C-STORE-RSP answering a sub-operation,
/// requeueing unrelated traffic.
async fn wait_store_rsp(dimse: &mut Scp, sub_id: u16) -> Result<Status> {
    let mut unrelated = Vec::new();
    let found = loop {
        let message = dimse.recv_response().await?;
        if message.command_field().ok() == Some(CommandField::CStoreRsp as u16)
            && message.message_id_being_responded_to().ok() == Some(sub_id)
        {
            break message.status();
        }
        unrelated.push(message);
    };
    for message in unrelated.into_iter().rev() {
        dimse.requeue(message);
    }
    found
}

async fn handle_move(dimse: &mut Scp, options: &ScpOptions, message: DimseMessage) -> Result<()> {
    let context_id = message.presentation_context_id;
    let message_id = message.message_id()?;
    let sop_class_uid = message.affected_sop_class_uid()?;
    let destination_aet = message
        .command
        .get(dicom_dictionary_std::tags::MOVE_DESTINATION)
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_default();

    let handler = match options.handlers.mov.clone() {
        Some(handler) => handler,
        None => {
            let rsp = CMoveRsp::builder()
                .message_id_being_responded_to(message_id)
                .affected_sop_class_uid(sop_class_uid.as_str())
                .status(Status::SOP_CLASS_NOT_SUPPORTED.code())
                .build();
            return send_response(dimse, options, context_id, &rsp, None).await;
        }
    };

    let destination = match handler.resolve_destination(&destination_aet) {
        Some(addr) => addr,
        None => {
            // move destination unknown
            let rsp = CMoveRsp::builder()
                .message_id_being_responded_to(message_id)
                .affected_sop_class_uid(sop_class_uid.as_str())
                .status(0xA801)
                .build();
            return send_response(dimse, options, context_id, &rsp, None).await;
        }
    };

    let identifier = decode_identifier(dimse, &message)?;
    let cancel = CancelToken::new();
    let request = QueryRequest {
        presentation_context_id: context_id,
        sop_class_uid: sop_class_uid.clone(),
        identifier,
    };

    let RetrieveResponses {
        sub_operations,
        mut instances,
    } = match catch_unwind(AssertUnwindSafe(|| {
        handler.handle_move(request, cancel.clone())
    })) {
        Ok(responses) => responses,
        Err(_) => {
            warn!("C-MOVE handler panicked");
            let rsp = CMoveRsp::builder()
                .message_id_being_responded_to(message_id)
                .affected_sop_class_uid(sop_class_uid.as_str())
                .status(0xC511)
                .build();
            return send_response(dimse, options, context_id, &rsp, None).await;
        }
    };

    // one sub-association to the move destination
    // carries all C-STORE sub-operations
    let mut sub_options = netdicom_ul::association::client::ClientAssociationOptions::new()
        .calling_ae_title(options.ae_title.clone())
        .called_ae_title(destination_aet.clone())
        .max_pdu_length(options.max_pdu_length);
    for uid in service::uids_of(ServiceClassKind::Storage) {
        sub_options = sub_options.with_abstract_syntax(uid);
    }
    let sub_assoc = match sub_options.establish(destination).await {
        Ok(assoc) => assoc,
        Err(e) => {
            warn!("could not reach move destination {}: {}", destination_aet, e);
            let rsp = CMoveRsp::builder()
                .message_id_being_responded_to(message_id)
                .affected_sop_class_uid(sop_class_uid.as_str())
                .status(0xA801)
                .build();
            return send_response(dimse, options, context_id, &rsp, None).await;
        }
    };
    let mut sub_dimse = DimseAssociation::new(sub_assoc);

    let mut remaining = sub_operations;
    let mut completed = 0u16;
    let mut failed = 0u16;
    let mut warnings = 0u16;
    let mut cancelled = false;

    loop {
        if cancel_requested(dimse, message_id).await? {
            cancel.cancel();
            cancelled = true;
            break;
        }

        let next = match catch_unwind(AssertUnwindSafe(|| instances.next())) {
            Ok(next) => next,
            Err(_) => {
                warn!("C-MOVE handler panicked while yielding instances");
                failed = failed.saturating_add(remaining);
                remaining = 0;
                None
            }
        };

        let (instance_class, instance_uid, dataset) = match next {
            Some(instance) => instance,
            None => break,
        };
        remaining = remaining.saturating_sub(1);

        let store_status = match sub_dimse.find_context(&instance_class, true) {
            Ok(store_context) => {
                let sub_id = sub_dimse.next_message_id();
                let rq = CStoreRq::builder()
                    .message_id(sub_id)
                    .affected_sop_class_uid(instance_class.as_str())
                    .affected_sop_instance_uid(instance_uid.as_str())
                    .move_originator_application_entity_title(options.ae_title.as_str())
                    .move_originator_message_id(message_id)
                    .build();
                match sub_dimse.send(store_context, &rq, Some(&dataset)).await {
                    Ok(()) => match wait_store_rsp_on(&mut sub_dimse, sub_id).await {
                        Ok(status) => status,
                        Err(e) => {
                            warn!("sub-operation failed: {}", e);
                            Status(0xA702)
                        }
                    },
                    Err(e) => {
                        warn!("sub-operation failed: {}", e);
                        Status(0xA702)
                    }
                }
            }
            Err(_) => {
                warn!(
                    "destination accepted no context for {}; sub-operation failed",
                    instance_class
                );
                Status(0xA702)
            }
        };

        match store_status.class() {
            crate::StatusClass::Success => completed += 1,
            crate::StatusClass::Warning => warnings += 1,
            _ => failed += 1,
        }

        let rsp = CMoveRsp::builder()
            .message_id_being_responded_to(message_id)
            .affected_sop_class_uid(sop_class_uid.as_str())
            .status(Status::PENDING.code())
            .sub_operations(counts(remaining, completed, failed, warnings))
            .build();
        send_response(dimse, options, context_id, &rsp, None).await?;
    }

    if let Err(e) = sub_dimse.release().await {
        debug!("sub-association release failed: {}", e);
    }

    let status = if cancelled {
        Status::CANCEL
    } else if failed > 0 {
        Status(0xB000)
    } else {
        Status::SUCCESS
    };
    let rsp = CMoveRsp::builder()
        .message_id_being_responded_to(message_id)
        .affected_sop_class_uid(sop_class_uid.as_str())
        .status(status.code())
        .sub_operations(counts(remaining, completed, failed, warnings))
        .build();
    send_response(dimse, options, context_id, &rsp, None).await
}

/// Same as [`wait_store_rsp`] for the outbound sub-association
/// of a C-MOVE.
async fn wait_store_rsp_on(
    dimse: &mut DimseAssociation<netdicom_ul::ClientAssociation<TcpStream>>,
    sub_id: u16,
) -> Result<Status> {
    let mut unrelated = Vec::new();
    let found = loop {
        let message = dimse.recv_response().await?;
        if message.command_field().ok() == Some(CommandField::CStoreRsp as u16)
            && message.message_id_being_responded_to().ok() == Some(sub_id)
        {
            break message.status();
        }
        unrelated.push(message);
    };
    for message in unrelated.into_iter().rev() {
        dimse.requeue(message);
    }
    found
}

async fn handle_n_service(
    dimse: &mut Scp,
    options: &ScpOptions,
    message: DimseMessage,
    field: CommandField,
) -> Result<()> {
    let context_id = message.presentation_context_id;
    let message_id = message.message_id()?;

    let response = match options.handlers.n_service.clone() {
        Some(handler) => {
            let request = NRequest {
                presentation_context_id: context_id,
                command: message.command.clone(),
                data: message.dataset.clone(),
            };
            let field_for_handler = field;
            tokio::task::spawn_blocking(move || match field_for_handler {
                CommandField::NEventReportRq => handler.handle_event_report(request),
                CommandField::NGetRq => handler.handle_get(request),
                CommandField::NSetRq => handler.handle_set(request),
                CommandField::NActionRq => handler.handle_action(request),
                CommandField::NCreateRq => handler.handle_create(request),
                _ => handler.handle_delete(request),
            })
            .await
            .unwrap_or_else(|e| {
                warn!("DIMSE-N handler panicked: {}", e);
                crate::service::NResponse {
                    status: Status::PROCESSING_FAILURE,
                    dataset: None,
                }
            })
        }
        None => crate::service::NResponse {
            status: Status::UNRECOGNIZED_OPERATION,
            dataset: None,
        },
    };

    let status = response.status.code();
    match field {
        CommandField::NEventReportRq => {
            let rsp = NEventReportRsp::builder()
                .message_id_being_responded_to(message_id)
                .status(status)
                .build();
            send_response(dimse, options, context_id, &rsp, response.dataset.as_ref()).await
        }
        CommandField::NGetRq => {
            let rsp = NGetRsp::builder()
                .message_id_being_responded_to(message_id)
                .status(status)
                .build();
            send_response(dimse, options, context_id, &rsp, response.dataset.as_ref()).await
        }
        CommandField::NSetRq => {
            let rsp = NSetRsp::builder()
                .message_id_being_responded_to(message_id)
                .status(status)
                .build();
            send_response(dimse, options, context_id, &rsp, response.dataset.as_ref()).await
        }
        CommandField::NActionRq => {
            let rsp = NActionRsp::builder()
                .message_id_being_responded_to(message_id)
                .status(status)
                .build();
            send_response(dimse, options, context_id, &rsp, response.dataset.as_ref()).await
        }
        CommandField::NCreateRq => {
            let rsp = NCreateRsp::builder()
                .message_id_being_responded_to(message_id)
                .status(status)
                .build();
            send_response(dimse, options, context_id, &rsp, response.dataset.as_ref()).await
        }
        _ => {
            let rsp = NDeleteRsp::builder()
                .message_id_being_responded_to(message_id)
                .status(status)
                .build();
            send_response(dimse, options, context_id, &rsp, response.dataset.as_ref()).await
        }
    }
}

fn counts(remaining: u16, completed: u16, failed: u16, warnings: u16) -> SubOperationCounts {
    SubOperationCounts::builder()
        .remaining(remaining)
        .completed(completed)
        .failed(failed)
        .warnings(warnings)
        .build()
}

/// Send a response command, publishing the send notification.
async fn send_response(
    dimse: &mut Scp,
    options: &ScpOptions,
    context_id: u8,
    command: &dyn Command,
    dataset: Option<&InMemDicomObject>,
) -> Result<()> {
    if options.config.log_response_identifiers {
        if let Some(dataset) = dataset {
            debug!("response identifier: {:?}", dataset);
        }
    }
    dimse.send(context_id, command, dataset).await?;
    options.events.publish(&Notification::MessageSent {
        context_id,
        command_field: command.command_field(),
    });
    Ok(())
}
