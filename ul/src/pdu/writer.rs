//! PDU encoding.
use crate::pdu::*;
use byteordered::byteorder::{BigEndian, WriteBytesExt};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{Backtrace, ResultExt, Snafu};
use std::io::Write;

/// An error encoding a PDU into its wire representation.
///
/// Mirrors the decoder's taxonomy:
/// byte-level failures carry the name of the field being written.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("could not write `{}`", field))]
    WriteField {
        field: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("text in `{}` is not encodable", field))]
    EncodeText {
        field: &'static str,
        #[snafu(backtrace)]
        source: dicom_encoding::text::EncodeTextError,
    },

    #[snafu(display("could not assemble the `{}` section", name))]
    WriteChunk {
        name: &'static str,
        #[snafu(backtrace)]
        source: WriteChunkError,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// A failure within one length-prefixed section.
#[derive(Debug, Snafu)]
pub enum WriteChunkError {
    #[snafu(display("the section body could not be produced"))]
    Assemble {
        #[snafu(backtrace)]
        source: Box<Error>,
    },
    #[snafu(display("the section length prefix could not be written"))]
    LengthPrefix {
        backtrace: Backtrace,
        source: std::io::Error,
    },
    #[snafu(display("the section payload could not be written"))]
    Payload {
        backtrace: Backtrace,
        source: std::io::Error,
    },
}

/// Run `func` against a scratch buffer,
/// then write the buffer prefixed by its length as a big-endian u32.
fn write_chunk_u32<F>(writer: &mut dyn Write, func: F) -> std::result::Result<(), WriteChunkError>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data).map_err(Box::from).context(AssembleSnafu)?;

    let length = data.len() as u32;
    writer
        .write_u32::<BigEndian>(length)
        .context(LengthPrefixSnafu)?;

    writer.write_all(&data).context(PayloadSnafu)?;

    Ok(())
}

/// Run `func` against a scratch buffer,
/// then write the buffer prefixed by its length as a big-endian u16.
fn write_chunk_u16<F>(writer: &mut dyn Write, func: F) -> std::result::Result<(), WriteChunkError>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data).map_err(Box::from).context(AssembleSnafu)?;

    let length = data.len() as u16;
    writer
        .write_u16::<BigEndian>(length)
        .context(LengthPrefixSnafu)?;

    writer.write_all(&data).context(PayloadSnafu)?;

    Ok(())
}

/// Encode a full PDU into the given writer.
pub fn write_pdu<W>(writer: &mut W, pdu: &Pdu) -> Result<()>
where
    W: Write,
{
    let codec = DefaultCharacterSetCodec;
    match pdu {
        Pdu::AssociationRQ(AssociationRQ {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        }) => {
            // PDU type and reserved byte, then the length-prefixed body
            writer
                .write_u8(0x01)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteFieldSnafu { field: "reserved" })?;

            write_chunk_u32(writer, |writer| {
                writer
                    .write_u16::<BigEndian>(*protocol_version)
                    .context(WriteFieldSnafu {
                        field: "Protocol-version",
                    })?;
                writer
                    .write_u16::<BigEndian>(0x00)
                    .context(WriteFieldSnafu { field: "reserved" })?;

                write_ae_title(writer, called_ae_title, "Called-AE-title", &codec)?;
                write_ae_title(writer, calling_ae_title, "Calling-AE-title", &codec)?;

                writer
                    .write_all(&[0; 32])
                    .context(WriteFieldSnafu { field: "reserved" })?;

                write_pdu_variable_application_context_name(
                    writer,
                    application_context_name,
                    &codec,
                )?;

                for presentation_context in presentation_contexts {
                    write_pdu_variable_presentation_context_proposed(
                        writer,
                        presentation_context,
                        &codec,
                    )?;
                }

                write_pdu_variable_user_variables(writer, user_variables, &codec)?;

                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-ASSOCIATE-RQ",
            })?;

            Ok(())
        }
        Pdu::AssociationAC(AssociationAC {
            protocol_version,
            application_context_name,
            called_ae_title,
            calling_ae_title,
            presentation_contexts,
            user_variables,
        }) => {
            writer
                .write_u8(0x02)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteFieldSnafu { field: "reserved" })?;

            write_chunk_u32(writer, |writer| {
                writer
                    .write_u16::<BigEndian>(*protocol_version)
                    .context(WriteFieldSnafu {
                        field: "Protocol-version",
                    })?;
                writer
                    .write_u16::<BigEndian>(0x00)
                    .context(WriteFieldSnafu { field: "reserved" })?;

                // the two AE title fields of the AC are reserved,
                // echoing what was received in the RQ
                write_ae_title(writer, called_ae_title, "Called-AE-title", &codec)?;
                write_ae_title(writer, calling_ae_title, "Calling-AE-title", &codec)?;

                writer
                    .write_all(&[0; 32])
                    .context(WriteFieldSnafu { field: "reserved" })?;

                write_pdu_variable_application_context_name(
                    writer,
                    application_context_name,
                    &codec,
                )?;

                for presentation_context in presentation_contexts {
                    write_pdu_variable_presentation_context_result(
                        writer,
                        presentation_context,
                        &codec,
                    )?;
                }

                write_pdu_variable_user_variables(writer, user_variables, &codec)?;

                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-ASSOCIATE-AC",
            })
        }
        Pdu::AssociationRJ(AssociationRJ { result, source }) => {
            writer
                .write_u8(0x03)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteFieldSnafu { field: "reserved" })?;

            write_chunk_u32(writer, |writer| {
                writer
                    .write_u8(0x00)
                    .context(WriteFieldSnafu { field: "reserved" })?;

                writer
                    .write_u8(match result {
                        AssociationRJResult::Permanent => 0x01,
                        AssociationRJResult::Transient => 0x02,
                    })
                    .context(WriteFieldSnafu { field: "Result" })?;

                let (source_code, reason_code) = reject_source_and_reason(source);
                writer
                    .write_u8(source_code)
                    .context(WriteFieldSnafu { field: "Source" })?;
                writer
                    .write_u8(reason_code)
                    .context(WriteFieldSnafu {
                        field: "Reason/Diag.",
                    })?;

                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-ASSOCIATE-RJ",
            })?;

            Ok(())
        }
        Pdu::PData { data } => {
            writer
                .write_u8(0x04)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteFieldSnafu { field: "reserved" })?;

            write_chunk_u32(writer, |writer| {
                for presentation_data_value in data {
                    write_chunk_u32(writer, |writer| {
                        writer.push(presentation_data_value.presentation_context_id);

                        // message control header:
                        // bit 0 set = command fragment, bit 1 set = last fragment
                        let mut message_header = 0x00;
                        if presentation_data_value.value_type == PDataValueType::Command {
                            message_header |= 0x01;
                        }
                        if presentation_data_value.is_last {
                            message_header |= 0x02;
                        }
                        writer.push(message_header);

                        writer.extend_from_slice(&presentation_data_value.data);
                        Ok(())
                    })
                    .context(WriteChunkSnafu {
                        name: "Presentation-data-value",
                    })?;
                }
                Ok(())
            })
            .context(WriteChunkSnafu { name: "P-DATA-TF" })?;

            Ok(())
        }
        Pdu::ReleaseRQ => {
            writer
                .write_u8(0x05)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteFieldSnafu { field: "reserved" })?;
            write_chunk_u32(writer, |writer| {
                writer
                    .write_all(&[0; 4])
                    .context(WriteFieldSnafu { field: "reserved" })?;
                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-RELEASE-RQ",
            })?;
            Ok(())
        }
        Pdu::ReleaseRP => {
            writer
                .write_u8(0x06)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteFieldSnafu { field: "reserved" })?;
            write_chunk_u32(writer, |writer| {
                writer
                    .write_all(&[0; 4])
                    .context(WriteFieldSnafu { field: "reserved" })?;
                Ok(())
            })
            .context(WriteChunkSnafu {
                name: "A-RELEASE-RP",
            })?;
            Ok(())
        }
        Pdu::AbortRQ { source } => {
            writer
                .write_u8(0x07)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteFieldSnafu { field: "reserved" })?;
            write_chunk_u32(writer, |writer| {
                writer
                    .write_all(&[0; 2])
                    .context(WriteFieldSnafu { field: "reserved" })?;

                let (source_code, reason_code) = abort_source_and_reason(source);
                writer
                    .write_u8(source_code)
                    .context(WriteFieldSnafu { field: "Source" })?;
                writer
                    .write_u8(reason_code)
                    .context(WriteFieldSnafu {
                        field: "Reason/Diag",
                    })?;
                Ok(())
            })
            .context(WriteChunkSnafu { name: "A-ABORT" })?;
            Ok(())
        }
        Pdu::Unknown { pdu_type, data } => {
            writer
                .write_u8(*pdu_type)
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            writer
                .write_u8(0x00)
                .context(WriteFieldSnafu { field: "reserved" })?;
            write_chunk_u32(writer, |writer| {
                writer.extend_from_slice(data);
                Ok(())
            })
            .context(WriteChunkSnafu { name: "Unknown" })?;
            Ok(())
        }
    }
}

fn reject_source_and_reason(source: &AssociationRJSource) -> (u8, u8) {
    match source {
        AssociationRJSource::ServiceUser(reason) => (
            0x01,
            match reason {
                AssociationRJServiceUserReason::NoReasonGiven => 0x01,
                AssociationRJServiceUserReason::ApplicationContextNameNotSupported => 0x02,
                AssociationRJServiceUserReason::CallingAETitleNotRecognized => 0x03,
                AssociationRJServiceUserReason::CalledAETitleNotRecognized => 0x07,
                AssociationRJServiceUserReason::Reserved(data) => *data,
            },
        ),
        AssociationRJSource::ServiceProviderAsce(reason) => (
            0x02,
            match reason {
                AssociationRJServiceProviderAsceReason::NoReasonGiven => 0x01,
                AssociationRJServiceProviderAsceReason::ProtocolVersionNotSupported => 0x02,
            },
        ),
        AssociationRJSource::ServiceProviderPresentation(reason) => (
            0x03,
            match reason {
                AssociationRJServiceProviderPresentationReason::TemporaryCongestion => 0x01,
                AssociationRJServiceProviderPresentationReason::LocalLimitExceeded => 0x02,
                AssociationRJServiceProviderPresentationReason::Reserved(data) => *data,
            },
        ),
    }
}

fn abort_source_and_reason(source: &AbortRQSource) -> (u8, u8) {
    match source {
        AbortRQSource::ServiceUser => (0x00, 0x00),
        AbortRQSource::Reserved => (0x01, 0x00),
        AbortRQSource::ServiceProvider(reason) => (
            0x02,
            match reason {
                AbortRQServiceProviderReason::ReasonNotSpecified => 0x00,
                AbortRQServiceProviderReason::UnrecognizedPdu => 0x01,
                AbortRQServiceProviderReason::UnexpectedPdu => 0x02,
                AbortRQServiceProviderReason::Reserved => 0x03,
                AbortRQServiceProviderReason::UnrecognizedPduParameter => 0x04,
                AbortRQServiceProviderReason::UnexpectedPduParameter => 0x05,
                AbortRQServiceProviderReason::InvalidPduParameter => 0x06,
            },
        ),
    }
}

/// Write an AE title padded with spaces to 16 bytes.
fn write_ae_title(
    writer: &mut dyn Write,
    ae_title: &str,
    field: &'static str,
    codec: &dyn TextCodec,
) -> Result<()> {
    let mut ae_title_bytes = codec.encode(ae_title).context(EncodeTextSnafu { field })?;
    ae_title_bytes.resize(16, b' ');
    writer
        .write_all(&ae_title_bytes)
        .context(WriteFieldSnafu { field })
}

/// Write a variable item header (type byte plus reserved byte)
/// followed by the length-prefixed payload produced by `func`.
fn write_item<F>(
    writer: &mut dyn Write,
    item_type: u8,
    name: &'static str,
    func: F,
) -> Result<()>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    writer
        .write_u8(item_type)
        .context(WriteFieldSnafu { field: "Item-type" })?;
    writer
        .write_u8(0x00)
        .context(WriteFieldSnafu { field: "reserved" })?;
    write_chunk_u16(writer, func).context(WriteChunkSnafu { name })
}

fn write_pdu_variable_application_context_name(
    writer: &mut dyn Write,
    application_context_name: &str,
    codec: &dyn TextCodec,
) -> Result<()> {
    write_item(writer, 0x10, "Application-context-name", |writer| {
        let bytes = codec
            .encode(application_context_name)
            .context(EncodeTextSnafu {
                field: "Application-context-name",
            })?;
        writer.extend_from_slice(&bytes);
        Ok(())
    })
}

fn write_pdu_variable_presentation_context_proposed(
    writer: &mut dyn Write,
    presentation_context: &PresentationContextProposed,
    codec: &dyn TextCodec,
) -> Result<()> {
    write_item(writer, 0x20, "Presentation-context (proposed)", |writer| {
        writer.push(presentation_context.id);
        // 3 reserved bytes
        writer.extend_from_slice(&[0x00; 3]);

        // one abstract syntax sub-item
        write_item(writer, 0x30, "Abstract-syntax", |writer| {
            let bytes = codec
                .encode(&presentation_context.abstract_syntax)
                .context(EncodeTextSnafu {
                    field: "Abstract-syntax-name",
                })?;
            writer.extend_from_slice(&bytes);
            Ok(())
        })?;

        // one or more transfer syntax sub-items
        for transfer_syntax in &presentation_context.transfer_syntaxes {
            write_item(writer, 0x40, "Transfer-syntax", |writer| {
                let bytes = codec.encode(transfer_syntax).context(EncodeTextSnafu {
                    field: "Transfer-syntax-name",
                })?;
                writer.extend_from_slice(&bytes);
                Ok(())
            })?;
        }
        Ok(())
    })
}

fn write_pdu_variable_presentation_context_result(
    writer: &mut dyn Write,
    presentation_context: &PresentationContextResult,
    codec: &dyn TextCodec,
) -> Result<()> {
    write_item(writer, 0x21, "Presentation-context (result)", |writer| {
        writer.push(presentation_context.id);
        writer.push(0x00);
        writer.push(presentation_context.reason.clone() as u8);
        writer.push(0x00);

        // exactly one transfer syntax sub-item
        write_item(writer, 0x40, "Transfer-syntax", |writer| {
            let bytes = codec
                .encode(&presentation_context.transfer_syntax)
                .context(EncodeTextSnafu {
                    field: "Transfer-syntax-name",
                })?;
            writer.extend_from_slice(&bytes);
            Ok(())
        })
    })
}

fn write_pdu_variable_user_variables(
    writer: &mut dyn Write,
    user_variables: &[UserVariableItem],
    codec: &dyn TextCodec,
) -> Result<()> {
    if user_variables.is_empty() {
        return Ok(());
    }

    write_item(writer, 0x50, "User-information", |writer| {
        for user_variable in user_variables {
            match user_variable {
                UserVariableItem::MaxLength(max_length) => {
                    write_item(writer, 0x51, "Maximum-length", |writer| {
                        writer
                            .write_u32::<BigEndian>(*max_length)
                            .context(WriteFieldSnafu {
                                field: "Maximum-length-received",
                            })?;
                        Ok(())
                    })?;
                }
                UserVariableItem::ImplementationClassUID(impl_class_uid) => {
                    write_item(writer, 0x52, "Implementation-class-uid", |writer| {
                        let bytes = codec.encode(impl_class_uid).context(EncodeTextSnafu {
                            field: "Implementation-class-uid",
                        })?;
                        writer.extend_from_slice(&bytes);
                        Ok(())
                    })?;
                }
                UserVariableItem::AsyncOperationsWindow(invoked, performed) => {
                    write_item(writer, 0x53, "Asynchronous-operations-window", |writer| {
                        writer
                            .write_u16::<BigEndian>(*invoked)
                            .context(WriteFieldSnafu {
                                field: "Maximum-number-operations-invoked",
                            })?;
                        writer
                            .write_u16::<BigEndian>(*performed)
                            .context(WriteFieldSnafu {
                                field: "Maximum-number-operations-performed",
                            })?;
                        Ok(())
                    })?;
                }
                UserVariableItem::RoleSelection(role_selection) => {
                    write_item(writer, 0x54, "Role-selection", |writer| {
                        write_chunk_u16(writer, |writer| {
                            let bytes = codec
                                .encode(&role_selection.sop_class_uid)
                                .context(EncodeTextSnafu {
                                    field: "SOP-class-uid",
                                })?;
                            writer.extend_from_slice(&bytes);
                            Ok(())
                        })
                        .context(WriteChunkSnafu {
                            name: "SOP-class-uid",
                        })?;
                        writer.push(role_selection.scu_role as u8);
                        writer.push(role_selection.scp_role as u8);
                        Ok(())
                    })?;
                }
                UserVariableItem::ImplementationVersionName(impl_version_name) => {
                    write_item(writer, 0x55, "Implementation-version-name", |writer| {
                        let bytes =
                            codec.encode(impl_version_name).context(EncodeTextSnafu {
                                field: "Implementation-version-name",
                            })?;
                        writer.extend_from_slice(&bytes);
                        Ok(())
                    })?;
                }
                UserVariableItem::SopClassExtendedNegotiationSubItem(sop_class_uid, data) => {
                    write_item(writer, 0x56, "SOP-class-extended-negotiation", |writer| {
                        write_chunk_u16(writer, |writer| {
                            let bytes = codec.encode(sop_class_uid).context(EncodeTextSnafu {
                                field: "SOP-class-uid",
                            })?;
                            writer.extend_from_slice(&bytes);
                            Ok(())
                        })
                        .context(WriteChunkSnafu {
                            name: "SOP-class-uid",
                        })?;
                        writer.extend_from_slice(data);
                        Ok(())
                    })?;
                }
                UserVariableItem::SopClassCommonExtendedNegotiationSubItem(common) => {
                    write_item(
                        writer,
                        0x57,
                        "SOP-class-common-extended-negotiation",
                        |writer| {
                            write_chunk_u16(writer, |writer| {
                                let bytes =
                                    codec.encode(&common.sop_class_uid).context(
                                        EncodeTextSnafu {
                                            field: "SOP-class-uid",
                                        },
                                    )?;
                                writer.extend_from_slice(&bytes);
                                Ok(())
                            })
                            .context(WriteChunkSnafu {
                                name: "SOP-class-uid",
                            })?;
                            write_chunk_u16(writer, |writer| {
                                let bytes = codec.encode(&common.service_class_uid).context(
                                    EncodeTextSnafu {
                                        field: "Service-class-uid",
                                    },
                                )?;
                                writer.extend_from_slice(&bytes);
                                Ok(())
                            })
                            .context(WriteChunkSnafu {
                                name: "Service-class-uid",
                            })?;
                            write_chunk_u16(writer, |writer| {
                                for related in &common.related_general_sop_classes {
                                    write_chunk_u16(writer, |writer| {
                                        let bytes = codec.encode(related).context(
                                            EncodeTextSnafu {
                                                field: "Related-general-sop-class-uid",
                                            },
                                        )?;
                                        writer.extend_from_slice(&bytes);
                                        Ok(())
                                    })
                                    .context(WriteChunkSnafu {
                                        name: "Related-general-sop-class-uid",
                                    })?;
                                }
                                Ok(())
                            })
                            .context(WriteChunkSnafu {
                                name: "Related-general-sop-class-identification",
                            })?;
                            Ok(())
                        },
                    )?;
                }
                UserVariableItem::UserIdentityItem(user_identity) => {
                    write_item(writer, 0x58, "User-identity", |writer| {
                        writer.push(user_identity.identity_type() as u8);
                        writer.push(user_identity.positive_response_requested() as u8);
                        write_chunk_u16(writer, |writer| {
                            writer.extend_from_slice(user_identity.primary_field());
                            Ok(())
                        })
                        .context(WriteChunkSnafu {
                            name: "User-identity-primary-field",
                        })?;
                        write_chunk_u16(writer, |writer| {
                            writer.extend_from_slice(user_identity.secondary_field());
                            Ok(())
                        })
                        .context(WriteChunkSnafu {
                            name: "User-identity-secondary-field",
                        })?;
                        Ok(())
                    })?;
                }
                UserVariableItem::UserIdentityResponseItem(server_response) => {
                    write_item(writer, 0x59, "User-identity-response", |writer| {
                        write_chunk_u16(writer, |writer| {
                            writer.extend_from_slice(server_response);
                            Ok(())
                        })
                        .context(WriteChunkSnafu {
                            name: "User-identity-server-response",
                        })?;
                        Ok(())
                    })?;
                }
                UserVariableItem::Unknown(item_type, data) => {
                    write_item(writer, *item_type, "Unknown", |writer| {
                        writer.extend_from_slice(data);
                        Ok(())
                    })?;
                }
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_chunks_with_preceding_u32_length() {
        let mut bytes = vec![0u8; 0];
        write_chunk_u32(&mut bytes, |writer| {
            writer.push(0x02);
            write_chunk_u32(writer, |writer| {
                writer.push(0x03);
                Ok(())
            })
            .context(WriteChunkSnafu { name: "inner" })?;
            Ok(())
        })
        .unwrap();

        assert_eq!(bytes.len(), 10);
        assert_eq!(bytes, &[0, 0, 0, 6, 2, 0, 0, 0, 1, 3]);
    }

    #[test]
    fn write_chunks_with_preceding_u16_length() {
        let mut bytes = vec![0u8; 0];
        write_chunk_u16(&mut bytes, |writer| {
            writer.push(0x02);
            write_chunk_u16(writer, |writer| {
                writer.push(0x03);
                Ok(())
            })
            .context(WriteChunkSnafu { name: "inner" })?;
            Ok(())
        })
        .unwrap();

        assert_eq!(bytes.len(), 6);
        assert_eq!(bytes, &[0, 4, 2, 0, 1, 3]);
    }
}
