//! DIMSE message assembly and fragmentation.
//!
//! A DIMSE message travels as one or more command fragments,
//! optionally followed by one or more data set fragments,
//! all bound to a single presentation context.
//! Fragments of messages on *different* contexts may interleave
//! on the wire;
//! within one context the stream is contiguous,
//! so the assembler keeps one partial message per context
//! and releases complete messages in the order their
//! last fragment arrived,
//! which preserves send order per context.

use std::collections::{HashMap, VecDeque};

use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use snafu::{IntoError, OptionExt};

use netdicom_ul::pdu::{PDataValue, PDataValueType};

use crate::commands::{decode_command_set, CommandDataSetType};
use crate::error::{
    DecodeCommandSnafu, FragmentOutOfOrderSnafu, InvalidCommandFieldSnafu, MissingCommandFieldSnafu,
};
use crate::{Result, Status};

/// A complete DIMSE message:
/// the decoded command set
/// and the raw bytes of the data set, if one was present.
///
/// The data set bytes are kept unparsed;
/// they are encoded in the transfer syntax
/// accepted for the presentation context.
#[derive(Debug, Clone)]
pub struct DimseMessage {
    /// the presentation context the message arrived on
    pub presentation_context_id: u8,
    /// the decoded command set
    pub command: InMemDicomObject,
    /// the raw data set bytes, when the message carries one
    pub dataset: Option<Vec<u8>>,
}

impl DimseMessage {
    fn u16_field(&self, tag: dicom_core::Tag, name: &'static str) -> Result<u16> {
        self.command
            .get(tag)
            .context(MissingCommandFieldSnafu { name })?
            .to_int::<u16>()
            .map_err(|source| InvalidCommandFieldSnafu { name }.into_error(source))
    }

    /// The command field code (element (0000,0100)).
    pub fn command_field(&self) -> Result<u16> {
        self.u16_field(tags::COMMAND_FIELD, "Command Field")
    }

    /// The message ID of a request (element (0000,0110)).
    pub fn message_id(&self) -> Result<u16> {
        self.u16_field(tags::MESSAGE_ID, "Message ID")
    }

    /// The message ID a response answers (element (0000,0120)).
    pub fn message_id_being_responded_to(&self) -> Result<u16> {
        self.u16_field(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            "Message ID Being Responded To",
        )
    }

    /// The status of a response (element (0000,0900)).
    pub fn status(&self) -> Result<Status> {
        self.u16_field(tags::STATUS, "Status").map(Status)
    }

    /// The affected SOP class UID (element (0000,0002)),
    /// with non-significant trailing padding removed.
    pub fn affected_sop_class_uid(&self) -> Result<String> {
        let name = "Affected SOP Class UID";
        Ok(self
            .command
            .get(tags::AFFECTED_SOP_CLASS_UID)
            .context(MissingCommandFieldSnafu { name })?
            .to_str()
            .map_err(|source| InvalidCommandFieldSnafu { name }.into_error(source))?
            .trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
            .to_string())
    }

    /// The affected SOP instance UID (element (0000,1000)).
    pub fn affected_sop_instance_uid(&self) -> Result<String> {
        let name = "Affected SOP Instance UID";
        Ok(self
            .command
            .get(tags::AFFECTED_SOP_INSTANCE_UID)
            .context(MissingCommandFieldSnafu { name })?
            .to_str()
            .map_err(|source| InvalidCommandFieldSnafu { name }.into_error(source))?
            .trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
            .to_string())
    }

    /// Whether the command set declares an accompanying data set.
    pub fn declares_dataset(&self) -> bool {
        self.command
            .get(tags::COMMAND_DATA_SET_TYPE)
            .and_then(|e| e.to_int::<u16>().ok())
            .map(|v| v != CommandDataSetType::Absent as u16)
            .unwrap_or(false)
    }
}

/// One partially received message on a presentation context.
#[derive(Debug, Default)]
struct PartialMessage {
    command_bytes: Vec<u8>,
    command: Option<InMemDicomObject>,
    expects_dataset: bool,
    dataset_bytes: Vec<u8>,
    dataset_done: bool,
}

/// Reassembles presentation data value fragments
/// into complete DIMSE messages.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    partial: HashMap<u8, PartialMessage>,
    ready: VecDeque<DimseMessage>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the fragments of one P-DATA-TF PDU into the assembler.
    ///
    /// Completed messages become available through
    /// [`pop_ready`](Self::pop_ready).
    pub fn push_pdu(&mut self, fragments: Vec<PDataValue>) -> Result<()> {
        for pdv in fragments {
            self.push_fragment(pdv)?;
        }
        Ok(())
    }

    /// Feed a single fragment into the assembler.
    pub fn push_fragment(&mut self, pdv: PDataValue) -> Result<()> {
        let context_id = pdv.presentation_context_id;
        let partial = self.partial.entry(context_id).or_default();

        match pdv.value_type {
            PDataValueType::Command => {
                // a command fragment may not arrive
                // while a data set is still underway
                if partial.command.is_some() {
                    return FragmentOutOfOrderSnafu { context_id }.fail();
                }
                partial.command_bytes.extend_from_slice(&pdv.data);
                if pdv.is_last {
                    let command = decode_command_set(&partial.command_bytes)
                        .map_err(|source| DecodeCommandSnafu.into_error(source))?;
                    let message = DimseMessage {
                        presentation_context_id: context_id,
                        command,
                        dataset: None,
                    };
                    if message.declares_dataset() {
                        partial.command = Some(message.command);
                        partial.expects_dataset = true;
                        partial.command_bytes.clear();
                    } else {
                        self.partial.remove(&context_id);
                        self.ready.push_back(message);
                    }
                }
            }
            PDataValueType::Data => {
                if !partial.expects_dataset {
                    return FragmentOutOfOrderSnafu { context_id }.fail();
                }
                partial.dataset_bytes.extend_from_slice(&pdv.data);
                if pdv.is_last {
                    partial.dataset_done = true;
                }
                if partial.dataset_done {
                    let partial = self
                        .partial
                        .remove(&context_id)
                        .expect("partial message must exist");
                    self.ready.push_back(DimseMessage {
                        presentation_context_id: context_id,
                        command: partial.command.expect("command must be complete"),
                        dataset: Some(partial.dataset_bytes),
                    });
                }
            }
        }
        Ok(())
    }

    /// Take the next completed message, if any.
    pub fn pop_ready(&mut self) -> Option<DimseMessage> {
        self.ready.pop_front()
    }

    /// Return a message to the front of the ready queue,
    /// e.g. after peeking for a C-CANCEL and finding something else.
    pub fn push_ready_front(&mut self, message: DimseMessage) {
        self.ready.push_front(message);
    }

    /// For chunked receive:
    /// detach a context whose command half is complete
    /// and whose data set has not started arriving yet.
    ///
    /// Once detached, the caller is responsible for consuming
    /// the data set fragments of that context
    /// before resuming regular assembly on it.
    pub fn take_command_awaiting_dataset(&mut self) -> Option<(u8, InMemDicomObject)> {
        let context_id = self.partial.iter().find_map(|(id, partial)| {
            (partial.expects_dataset
                && partial.command.is_some()
                && partial.dataset_bytes.is_empty()
                && !partial.dataset_done)
                .then_some(*id)
        })?;
        let partial = self.partial.remove(&context_id)?;
        Some((context_id, partial.command?))
    }

    /// Whether a message is currently being assembled
    /// on any context.
    pub fn has_partial(&self) -> bool {
        !self.partial.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{CEchoRq, CStoreRq, Command};

    fn command_pdvs(
        context_id: u8,
        command: &dyn Command,
        with_dataset: bool,
        chunk: usize,
    ) -> Vec<PDataValue> {
        let bytes = command.encode(with_dataset).unwrap();
        let chunks: Vec<_> = bytes.chunks(chunk).collect();
        let n = chunks.len();
        chunks
            .into_iter()
            .enumerate()
            .map(|(i, c)| PDataValue {
                presentation_context_id: context_id,
                value_type: PDataValueType::Command,
                is_last: i + 1 == n,
                data: c.to_vec(),
            })
            .collect()
    }

    fn data_pdvs(context_id: u8, bytes: &[u8], chunk: usize) -> Vec<PDataValue> {
        let chunks: Vec<_> = bytes.chunks(chunk).collect();
        let n = chunks.len();
        chunks
            .into_iter()
            .enumerate()
            .map(|(i, c)| PDataValue {
                presentation_context_id: context_id,
                value_type: PDataValueType::Data,
                is_last: i + 1 == n,
                data: c.to_vec(),
            })
            .collect()
    }

    #[test]
    fn assembles_command_only_message() {
        let cmd = CEchoRq::builder()
            .message_id(1)
            .affected_sop_class_uid("1.2.840.10008.1.1")
            .build();

        let mut assembler = MessageAssembler::new();
        assembler.push_pdu(command_pdvs(1, &cmd, false, 16)).unwrap();

        let message = assembler.pop_ready().expect("message should be complete");
        assert_eq!(message.presentation_context_id, 1);
        assert_eq!(message.command_field().unwrap(), 0x0030);
        assert_eq!(message.message_id().unwrap(), 1);
        assert!(message.dataset.is_none());
        assert!(assembler.pop_ready().is_none());
        assert!(!assembler.has_partial());
    }

    #[test]
    fn assembles_message_with_fragmented_dataset() {
        let cmd = CStoreRq::builder()
            .message_id(7)
            .affected_sop_class_uid("1.2.840.10008.5.1.4.1.1.2")
            .affected_sop_instance_uid("1.2.3.4.5")
            .build();
        let dataset: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();

        let mut assembler = MessageAssembler::new();
        assembler.push_pdu(command_pdvs(3, &cmd, true, 64)).unwrap();
        // not complete until the last data fragment
        assert!(assembler.pop_ready().is_none());
        assert!(assembler.has_partial());

        assembler.push_pdu(data_pdvs(3, &dataset, 100)).unwrap();
        let message = assembler.pop_ready().expect("message should be complete");
        assert_eq!(message.presentation_context_id, 3);
        assert_eq!(message.command_field().unwrap(), 0x0001);
        assert_eq!(message.dataset.as_deref(), Some(&dataset[..]));
    }

    /// fragments of messages on distinct contexts may interleave;
    /// each context reassembles independently and in order
    #[test]
    fn interleaved_contexts_reassemble_independently() {
        let cmd1 = CStoreRq::builder()
            .message_id(1)
            .affected_sop_class_uid("1.2.840.10008.5.1.4.1.1.2")
            .affected_sop_instance_uid("1.1.1")
            .build();
        let cmd2 = CStoreRq::builder()
            .message_id(2)
            .affected_sop_class_uid("1.2.840.10008.5.1.4.1.1.4")
            .affected_sop_instance_uid("2.2.2")
            .build();
        let data1 = vec![0x11_u8; 300];
        let data2 = vec![0x22_u8; 300];

        let mut assembler = MessageAssembler::new();
        assembler.push_pdu(command_pdvs(1, &cmd1, true, 4096)).unwrap();
        assembler.push_pdu(command_pdvs(3, &cmd2, true, 4096)).unwrap();

        let d1 = data_pdvs(1, &data1, 100);
        let d2 = data_pdvs(3, &data2, 100);
        // interleave the data fragments of the two contexts
        for (a, b) in d1.into_iter().zip(d2.into_iter()) {
            assembler.push_fragment(a).unwrap();
            assembler.push_fragment(b).unwrap();
        }

        let first = assembler.pop_ready().unwrap();
        let second = assembler.pop_ready().unwrap();
        assert_eq!(first.presentation_context_id, 1);
        assert_eq!(first.message_id().unwrap(), 1);
        assert_eq!(second.presentation_context_id, 3);
        assert_eq!(second.message_id().unwrap(), 2);
        assert_eq!(first.dataset.as_deref(), Some(&data1[..]));
        assert_eq!(second.dataset.as_deref(), Some(&data2[..]));
    }

    /// a data fragment with no preceding command set is a protocol error
    #[test]
    fn stray_data_fragment_is_rejected() {
        let mut assembler = MessageAssembler::new();
        let result = assembler.push_fragment(PDataValue {
            presentation_context_id: 5,
            value_type: PDataValueType::Data,
            is_last: true,
            data: vec![0; 10],
        });
        assert!(result.is_err());
    }
}
