//! Typed DIMSE message exchange over an established association.
//!
//! [`DimseAssociation`] wraps either side of an upper layer association
//! and exposes message-level operations:
//! sending a typed command (with an optional data set),
//! receiving complete messages in per-context send order,
//! issuing C-CANCEL,
//! and a chunked receive mode which streams a large data set
//! without materializing it whole.

use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use snafu::{IntoError, OptionExt};
use tracing::debug;

use netdicom_ul::association::{AsyncAssociation, TimerKind};
use netdicom_ul::pdu::{PDataValueType, Pdu};

use crate::commands::{CCancelRq, Command};
use crate::error::{
    AbortedSnafu, EncodeDataSnafu, FragmentOutOfOrderSnafu, NoSuitableContextSnafu, ReleasedSnafu,
    UnexpectedPduSnafu, UnknownTransferSyntaxSnafu, UnsupportedContextSnafu,
};
use crate::message::{DimseMessage, MessageAssembler};
use crate::{Error, Result};

/// A DIMSE view over an established association.
#[derive(Debug)]
pub struct DimseAssociation<A> {
    inner: A,
    assembler: MessageAssembler,
    next_message_id: u16,
    /// a context detached for chunked data set consumption
    streaming_context: Option<u8>,
}

impl<A> DimseAssociation<A>
where
    A: AsyncAssociation,
{
    /// Wrap an established association for message-level exchange.
    pub fn new(inner: A) -> Self {
        DimseAssociation {
            inner,
            assembler: MessageAssembler::new(),
            next_message_id: 1,
            streaming_context: None,
        }
    }

    /// Access the underlying association.
    pub fn inner(&self) -> &A {
        &self.inner
    }

    /// Access the underlying association mutably.
    pub fn inner_mut(&mut self) -> &mut A {
        &mut self.inner
    }

    /// Recover the underlying association.
    pub fn into_inner(self) -> A {
        self.inner
    }

    /// Allocate the next message identifier.
    pub fn next_message_id(&mut self) -> u16 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.checked_add(1).unwrap_or(1);
        id
    }

    /// Find an accepted presentation context for the given
    /// abstract syntax, requiring the given local role.
    ///
    /// `as_scu` selects contexts on which the local node
    /// may invoke operations;
    /// otherwise contexts on which it may perform them.
    pub fn find_context(&self, abstract_syntax: &str, as_scu: bool) -> Result<u8> {
        self.inner
            .presentation_contexts()
            .iter()
            .find(|pc| {
                pc.is_accepted()
                    && pc.abstract_syntax == abstract_syntax
                    && if as_scu { pc.local_scu } else { pc.local_scp }
            })
            .map(|pc| pc.id)
            .context(NoSuitableContextSnafu { abstract_syntax })
    }

    /// The transfer syntax accepted for the given presentation context.
    pub fn transfer_syntax(&self, context_id: u8) -> Result<String> {
        let pc = self
            .inner
            .accepted_context(context_id)
            .context(UnsupportedContextSnafu { context_id })?;
        Ok(pc.transfer_syntax.clone())
    }

    /// Send a typed command, with an optional data set,
    /// on the given presentation context.
    ///
    /// The data set is encoded with the transfer syntax accepted
    /// for the context;
    /// both halves are fragmented to the peer's maximum PDU length.
    pub async fn send(
        &mut self,
        context_id: u8,
        command: &dyn Command,
        dataset: Option<&InMemDicomObject>,
    ) -> Result<()> {
        let dataset_bytes = match dataset {
            Some(obj) => {
                let ts_uid = self.transfer_syntax(context_id)?;
                let ts = TransferSyntaxRegistry
                    .get(&ts_uid)
                    .context(UnknownTransferSyntaxSnafu { uid: ts_uid })?;
                let mut bytes = Vec::new();
                obj.write_dataset_with_ts(&mut bytes, ts)
                    .map_err(Box::from)
                    .map_err(|source| EncodeDataSnafu.into_error(source))?;
                Some(bytes)
            }
            None => None,
        };
        self.send_raw(context_id, command, dataset_bytes.as_deref())
            .await
    }

    /// Send a typed command with a pre-encoded data set.
    ///
    /// The data set bytes must already be in the transfer syntax
    /// accepted for the context;
    /// they pass through without inspection.
    pub async fn send_raw(
        &mut self,
        context_id: u8,
        command: &dyn Command,
        dataset: Option<&[u8]>,
    ) -> Result<()> {
        // a context that was not accepted never carries a fragment
        snafu::ensure!(
            self.inner.accepted_context(context_id).is_some(),
            UnsupportedContextSnafu { context_id }
        );

        let command_bytes = command
            .encode(dataset.is_some())
            .map_err(|source| crate::error::EncodeCommandSnafu.into_error(source))?;

        debug!(
            "sending command {:#06x} on context {}",
            command.command_field(),
            context_id
        );

        let mut writer = self
            .inner
            .send_pdata(context_id)
            .value_type(PDataValueType::Command);
        writer.write_all(&command_bytes).await?;
        writer.finish().await?;

        if let Some(dataset) = dataset {
            let mut writer = self
                .inner
                .send_pdata(context_id)
                .value_type(PDataValueType::Data);
            writer.write_all(dataset).await?;
            writer.finish().await?;
        }
        Ok(())
    }

    /// Receive the next complete message,
    /// waiting under the association's inactivity rules.
    ///
    /// Within a presentation context, messages are yielded
    /// in the order they were sent;
    /// across contexts no order is guaranteed.
    ///
    /// A peer release request surfaces as [`Error::Released`]
    /// and an abort as [`Error::Aborted`].
    pub async fn recv(&mut self) -> Result<DimseMessage> {
        loop {
            if let Some(message) = self.assembler.pop_ready() {
                return Ok(message);
            }
            self.pump(false).await?;
        }
    }

    /// Receive the next complete message
    /// while a request of ours is outstanding:
    /// the wait is bounded by the DIMSE timer,
    /// whose expiry aborts the association.
    pub async fn recv_response(&mut self) -> Result<DimseMessage> {
        loop {
            if let Some(message) = self.assembler.pop_ready() {
                return Ok(message);
            }
            self.pump(true).await?;
        }
    }

    /// Receive the next message, but yield as soon as a command set
    /// declaring a data set is complete:
    /// the returned message then has `dataset == None`
    /// and [`read_dataset_chunk`](Self::read_dataset_chunk)
    /// streams the data set that follows.
    pub async fn recv_chunked(&mut self) -> Result<DimseMessage> {
        loop {
            if let Some(message) = self.assembler.pop_ready() {
                return Ok(message);
            }
            if let Some((context_id, command)) = self.assembler.take_command_awaiting_dataset() {
                self.streaming_context = Some(context_id);
                return Ok(DimseMessage {
                    presentation_context_id: context_id,
                    command,
                    dataset: None,
                });
            }
            self.pump(false).await?;
        }
    }

    /// Obtain the next chunk of the data set announced by the last
    /// [`recv_chunked`](Self::recv_chunked) message,
    /// or `None` once the last fragment was consumed.
    pub async fn read_dataset_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        let context_id = match self.streaming_context {
            Some(id) => id,
            None => return Ok(None),
        };
        loop {
            let dimse_timeout = self.inner.timers().dimse_timeout;
            let pdu = match self
                .inner
                .receive_timed(TimerKind::Dimse, dimse_timeout)
                .await
            {
                Ok(pdu) => pdu,
                Err(e) => return Err(self.resolve_receive_error(e).await),
            };
            match pdu {
                Pdu::PData { data } => {
                    let mut chunk: Option<Vec<u8>> = None;
                    for pdv in data {
                        if pdv.presentation_context_id == context_id {
                            // the stream within one context is contiguous
                            snafu::ensure!(
                                pdv.value_type == PDataValueType::Data,
                                FragmentOutOfOrderSnafu { context_id }
                            );
                            if pdv.is_last {
                                self.streaming_context = None;
                            }
                            chunk
                                .get_or_insert_with(Vec::new)
                                .extend_from_slice(&pdv.data);
                        } else {
                            // fragments of other contexts
                            // keep assembling in the background
                            self.assembler.push_fragment(pdv)?;
                        }
                    }
                    if let Some(chunk) = chunk {
                        return Ok(Some(chunk));
                    }
                }
                Pdu::ReleaseRQ => return ReleasedSnafu.fail(),
                Pdu::AbortRQ { source } => {
                    return AbortedSnafu {
                        source_info: source,
                    }
                    .fail()
                }
                pdu => return UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail(),
            }
        }
    }

    /// Poll for an incoming message within the given deadline,
    /// returning `None` when nothing arrived in time.
    ///
    /// Useful to watch for a C-CANCEL between pending responses.
    pub async fn try_recv_for(
        &mut self,
        deadline: std::time::Duration,
    ) -> Result<Option<DimseMessage>> {
        if let Some(message) = self.assembler.pop_ready() {
            return Ok(Some(message));
        }
        match self
            .inner
            .receive_timed(TimerKind::Dimse, Some(deadline))
            .await
        {
            Ok(Pdu::PData { data }) => {
                self.assembler.push_pdu(data)?;
                Ok(self.assembler.pop_ready())
            }
            Ok(Pdu::ReleaseRQ) => ReleasedSnafu.fail(),
            Ok(Pdu::AbortRQ { source }) => AbortedSnafu {
                source_info: source,
            }
            .fail(),
            Ok(pdu) => UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail(),
            Err(netdicom_ul::association::Error::Timeout { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Return a received message to the front of the queue,
    /// so that the next [`recv`](Self::recv) yields it again.
    pub fn requeue(&mut self, message: DimseMessage) {
        self.assembler.push_ready_front(message);
    }

    /// Interrupt the pending C-FIND/C-GET/C-MOVE operation
    /// with the given message ID.
    pub async fn cancel(&mut self, context_id: u8, message_id: u16) -> Result<()> {
        let cancel = CCancelRq::builder()
            .message_id_being_responded_to(message_id)
            .build();
        self.send_raw(context_id, &cancel, None).await
    }

    /// Gracefully release the association.
    pub async fn release(&mut self) -> Result<()> {
        self.inner.release().await.map_err(Error::from)
    }

    /// Abort the association immediately.
    pub async fn abort(&mut self) -> Result<()> {
        self.inner.abort().await.map_err(Error::from)
    }

    /// Read one PDU and feed the assembler.
    ///
    /// With `awaiting_response` set, the read is bounded
    /// by the DIMSE timer; otherwise the association's
    /// inactivity rules apply.
    async fn pump(&mut self, awaiting_response: bool) -> Result<()> {
        let pdu = if awaiting_response {
            let dimse_timeout = self.inner.timers().dimse_timeout;
            match self
                .inner
                .receive_timed(TimerKind::Dimse, dimse_timeout)
                .await
            {
                Ok(pdu) => pdu,
                Err(e) => return Err(self.resolve_receive_error(e).await),
            }
        } else {
            self.inner.receive().await?
        };
        match pdu {
            Pdu::PData { data } => self.assembler.push_pdu(data),
            Pdu::ReleaseRQ => ReleasedSnafu.fail(),
            Pdu::AbortRQ { source } => AbortedSnafu {
                source_info: source,
            }
            .fail(),
            pdu => UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail(),
        }
    }

    /// Expiry of the DIMSE timer aborts the association;
    /// other upper layer errors pass through.
    async fn resolve_receive_error(&mut self, e: netdicom_ul::association::Error) -> Error {
        if let netdicom_ul::association::Error::Timeout { .. } = e {
            let _ = self.inner.abort().await;
        }
        e.into()
    }
}
