//! PDU decoding.
use crate::pdu::*;
use byteordered::byteorder::{BigEndian, ReadBytesExt};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use std::io::{Cursor, ErrorKind, Read, Seek, SeekFrom};
use tracing::warn;

/// An error decoding a PDU from its wire representation.
///
/// Byte-level failures carry the name of the field being read;
/// semantic violations carry the offending codes,
/// so that the abort diagnostics of the caller can name them.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum Error {
    #[snafu(display(
        "maximum PDU length of {} is outside the bounds admitted by the protocol",
        max_pdu_length
    ))]
    MaxPduOutOfBounds {
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("no PDU available on the stream"))]
    NoPduAvailable { backtrace: Backtrace },

    #[snafu(display("could not read `{}`", field))]
    ReadField {
        field: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("text in `{}` is not decodable", field))]
    DecodeText {
        field: &'static str,
        #[snafu(backtrace)]
        source: dicom_encoding::text::DecodeTextError,
    },

    #[snafu(display(
        "incoming PDU of {} bytes exceeds the admitted {} bytes",
        pdu_length,
        max_pdu_length
    ))]
    PduTooLarge {
        pdu_length: u32,
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "presentation data value header declares {} bytes where at least 2 are required",
        length
    ))]
    PdvTooShort { length: u32, backtrace: Backtrace },

    #[snafu(display("{:?} item may not appear in this PDU", var_item))]
    MisplacedItem {
        var_item: PduVariableItem,
        backtrace: Backtrace,
    },

    #[snafu(display("mandatory {} is missing from the PDU", item))]
    MissingItem {
        item: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("sub-item {:#04x} may not appear in a {}", item_type, place))]
    UnexpectedSubItem {
        place: &'static str,
        item_type: u8,
        backtrace: Backtrace,
    },

    #[snafu(display("a presentation context result admits a single transfer syntax"))]
    AmbiguousTransferSyntax { backtrace: Backtrace },

    #[snafu(display("{} is not a recognized rejection result", code))]
    UnknownRejectionResult { code: u8, backtrace: Backtrace },

    #[snafu(display(
        "{}/{} is not a recognized rejection diagnostic",
        source_code,
        reason_code
    ))]
    UnknownRejectionCode {
        source_code: u8,
        reason_code: u8,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "{}/{} is not a recognized abort diagnostic",
        source_code,
        reason_code
    ))]
    UnknownAbortCode {
        source_code: u8,
        reason_code: u8,
        backtrace: Backtrace,
    },

    #[snafu(display("{} is not a recognized presentation context outcome", code))]
    UnknownContextOutcome { code: u8, backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Read a full PDU from the given source.
///
/// When `strict` is set,
/// an incoming PDU longer than `max_pdu_length` is refused;
/// otherwise it is tolerated (with a warning) up to the standard ceiling
/// of [`MAXIMUM_PDU_SIZE`].
pub fn read_pdu<R>(reader: &mut R, max_pdu_length: u32, strict: bool) -> Result<Pdu>
where
    R: Read,
{
    ensure!(
        (MINIMUM_PDU_SIZE..=MAXIMUM_PDU_SIZE).contains(&max_pdu_length),
        MaxPduOutOfBoundsSnafu { max_pdu_length }
    );

    // Failing to read the very first bytes means that no PDU arrived at all,
    // which callers handle differently from a PDU truncated half-way
    // (the stream may simply have been closed by the peer).
    let mut bytes = [0; 2];
    if let Err(e) = reader.read_exact(&mut bytes) {
        ensure!(e.kind() != ErrorKind::UnexpectedEof, NoPduAvailableSnafu);
        return Err(e).context(ReadFieldSnafu { field: "PDU type" });
    }

    let pdu_type = bytes[0];
    let pdu_length = reader
        .read_u32::<BigEndian>()
        .context(ReadFieldSnafu { field: "PDU length" })?;

    check_pdu_length(pdu_length, max_pdu_length, strict)?;

    let bytes = read_n(reader, pdu_length as usize).context(ReadFieldSnafu { field: "PDU body" })?;
    read_pdu_body(pdu_type, &bytes)
}

/// Validate the length field of an incoming PDU
/// against the negotiated maximum.
pub(crate) fn check_pdu_length(pdu_length: u32, max_pdu_length: u32, strict: bool) -> Result<()> {
    if strict {
        ensure!(
            pdu_length <= max_pdu_length,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length
            }
        );
    } else if pdu_length > max_pdu_length {
        ensure!(
            pdu_length <= MAXIMUM_PDU_SIZE,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length: MAXIMUM_PDU_SIZE
            }
        );
        warn!(
            "tolerating PDU of {} bytes over the admitted {}",
            pdu_length, max_pdu_length
        );
    }
    Ok(())
}

/// Decode the body of a PDU of the given type,
/// the header having already been consumed.
pub(crate) fn read_pdu_body(pdu_type: u8, body: &[u8]) -> Result<Pdu> {
    let mut cursor = Cursor::new(body);
    let codec = DefaultCharacterSetCodec;

    match pdu_type {
        0x01 | 0x02 => read_association_pdu(pdu_type, &mut cursor, &codec),
        0x03 => {
            // A-ASSOCIATE-RJ: reserved byte, result, source, reason
            cursor
                .read_u8()
                .context(ReadFieldSnafu { field: "reserved" })?;

            let result_code = cursor
                .read_u8()
                .context(ReadFieldSnafu { field: "Result" })?;
            let result = AssociationRJResult::from(result_code)
                .context(UnknownRejectionResultSnafu { code: result_code })?;

            let source_code = cursor
                .read_u8()
                .context(ReadFieldSnafu { field: "Source" })?;
            let reason_code = cursor.read_u8().context(ReadFieldSnafu {
                field: "Reason/Diag.",
            })?;
            let source = AssociationRJSource::from(source_code, reason_code).context(
                UnknownRejectionCodeSnafu {
                    source_code,
                    reason_code,
                },
            )?;

            Ok(Pdu::AssociationRJ(AssociationRJ { result, source }))
        }
        0x04 => {
            // P-DATA-TF: a sequence of presentation data value items,
            // each with a 4-byte length, the context ID
            // and the message control header
            let mut values = vec![];
            while cursor.position() < cursor.get_ref().len() as u64 {
                let item_length = cursor.read_u32::<BigEndian>().context(ReadFieldSnafu {
                    field: "PDV item length",
                })?;

                ensure!(
                    item_length >= 2,
                    PdvTooShortSnafu {
                        length: item_length
                    }
                );

                let presentation_context_id = cursor.read_u8().context(ReadFieldSnafu {
                    field: "presentation context ID",
                })?;

                // message control header:
                // bit 0 set = command fragment, bit 1 set = last fragment
                let header = cursor.read_u8().context(ReadFieldSnafu {
                    field: "message control header",
                })?;

                let value_type = if header & 0x01 > 0 {
                    PDataValueType::Command
                } else {
                    PDataValueType::Data
                };
                let is_last = (header & 0x02) > 0;

                let data =
                    read_n(&mut cursor, (item_length - 2) as usize).context(ReadFieldSnafu {
                        field: "presentation data value",
                    })?;

                values.push(PDataValue {
                    presentation_context_id,
                    value_type,
                    is_last,
                    data,
                })
            }

            Ok(Pdu::PData { data: values })
        }
        0x05 => {
            // A-RELEASE-RQ: 4 reserved bytes only
            cursor
                .seek(SeekFrom::Current(4))
                .context(ReadFieldSnafu { field: "reserved" })?;

            Ok(Pdu::ReleaseRQ)
        }
        0x06 => {
            // A-RELEASE-RP: 4 reserved bytes only
            cursor
                .seek(SeekFrom::Current(4))
                .context(ReadFieldSnafu { field: "reserved" })?;

            Ok(Pdu::ReleaseRP)
        }
        0x07 => {
            // A-ABORT: 2 reserved bytes, source, reason
            let mut buf = [0u8; 2];
            cursor
                .read_exact(&mut buf)
                .context(ReadFieldSnafu { field: "reserved" })?;

            let source_code = cursor
                .read_u8()
                .context(ReadFieldSnafu { field: "Source" })?;
            let reason_code = cursor.read_u8().context(ReadFieldSnafu {
                field: "Reason/Diag",
            })?;
            let source = AbortRQSource::from(source_code, reason_code).context(
                UnknownAbortCodeSnafu {
                    source_code,
                    reason_code,
                },
            )?;

            Ok(Pdu::AbortRQ { source })
        }
        _ => Ok(Pdu::Unknown {
            pdu_type,
            data: body.to_vec(),
        }),
    }
}

/// Decode an A-ASSOCIATE-RQ (0x01) or A-ASSOCIATE-AC (0x02) body,
/// which share the same fixed layout:
/// protocol version, 2 reserved bytes, called AE title (16 bytes),
/// calling AE title (16 bytes), 32 reserved bytes,
/// then the variable items.
fn read_association_pdu(
    pdu_type: u8,
    cursor: &mut Cursor<&[u8]>,
    codec: &dyn TextCodec,
) -> Result<Pdu> {
    let mut application_context_name: Option<String> = None;
    let mut presentation_contexts_proposed = vec![];
    let mut presentation_contexts_results = vec![];
    let mut user_variables = vec![];

    let protocol_version = cursor.read_u16::<BigEndian>().context(ReadFieldSnafu {
        field: "protocol version",
    })?;

    cursor
        .read_u16::<BigEndian>()
        .context(ReadFieldSnafu { field: "reserved" })?;

    // AE titles are 16 characters of the ISO 646:1990 basic G0 set,
    // leading and trailing spaces not significant
    let mut ae_bytes = [0; 16];
    cursor.read_exact(&mut ae_bytes).context(ReadFieldSnafu {
        field: "called AE title",
    })?;
    let called_ae_title = codec
        .decode(&ae_bytes)
        .context(DecodeTextSnafu {
            field: "called AE title",
        })?
        .trim()
        .to_string();

    let mut ae_bytes = [0; 16];
    cursor.read_exact(&mut ae_bytes).context(ReadFieldSnafu {
        field: "calling AE title",
    })?;
    let calling_ae_title = codec
        .decode(&ae_bytes)
        .context(DecodeTextSnafu {
            field: "calling AE title",
        })?
        .trim()
        .to_string();

    cursor
        .seek(SeekFrom::Current(32))
        .context(ReadFieldSnafu { field: "reserved" })?;

    // one application context item,
    // one or more presentation context items,
    // one user information item
    while cursor.position() < cursor.get_ref().len() as u64 {
        match read_pdu_variable(cursor, codec)? {
            PduVariableItem::ApplicationContext(val) => {
                application_context_name = Some(val);
            }
            PduVariableItem::PresentationContextProposed(val) if pdu_type == 0x01 => {
                presentation_contexts_proposed.push(val);
            }
            PduVariableItem::PresentationContextResult(val) if pdu_type == 0x02 => {
                presentation_contexts_results.push(val);
            }
            PduVariableItem::UserVariables(val) => {
                user_variables = val;
            }
            var_item => {
                return MisplacedItemSnafu { var_item }.fail();
            }
        }
    }

    let application_context_name = application_context_name.context(MissingItemSnafu {
        item: "application context name",
    })?;

    if pdu_type == 0x01 {
        Ok(Pdu::AssociationRQ(AssociationRQ {
            protocol_version,
            application_context_name,
            called_ae_title,
            calling_ae_title,
            presentation_contexts: presentation_contexts_proposed,
            user_variables,
        }))
    } else {
        Ok(Pdu::AssociationAC(AssociationAC {
            protocol_version,
            application_context_name,
            called_ae_title,
            calling_ae_title,
            presentation_contexts: presentation_contexts_results,
            user_variables,
        }))
    }
}

fn read_n<R>(reader: &mut R, bytes_to_read: usize) -> std::io::Result<Vec<u8>>
where
    R: Read,
{
    let mut result = Vec::new();
    reader.take(bytes_to_read as u64).read_to_end(&mut result)?;
    if result.len() != bytes_to_read {
        // an inner length field pointing past the end of the PDU
        return Err(std::io::Error::new(
            ErrorKind::UnexpectedEof,
            format!(
                "expected {} bytes, only {} available",
                bytes_to_read,
                result.len()
            ),
        ));
    }
    Ok(result)
}

fn read_uid<R>(reader: &mut R, length: usize, codec: &dyn TextCodec) -> Result<String>
where
    R: Read,
{
    Ok(codec
        .decode(&read_n(reader, length).context(ReadFieldSnafu { field: "UID" })?)
        .context(DecodeTextSnafu { field: "UID" })?
        .trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
        .to_string())
}

fn read_pdu_variable<R>(reader: &mut R, codec: &dyn TextCodec) -> Result<PduVariableItem>
where
    R: Read,
{
    // every variable item: type byte, reserved byte, 2-byte length
    let item_type = reader
        .read_u8()
        .context(ReadFieldSnafu { field: "item type" })?;

    reader
        .read_u8()
        .context(ReadFieldSnafu { field: "reserved" })?;

    let item_length = reader.read_u16::<BigEndian>().context(ReadFieldSnafu {
        field: "item length",
    })?;

    let bytes = read_n(reader, item_length as usize)
        .context(ReadFieldSnafu { field: "item body" })?;
    let mut cursor = Cursor::new(bytes);

    match item_type {
        0x10 => {
            // Application Context item: the full payload is the context name
            let val = codec
                .decode(&cursor.into_inner())
                .context(DecodeTextSnafu {
                    field: "application context name",
                })?
                .trim()
                .to_string();
            Ok(PduVariableItem::ApplicationContext(val))
        }
        0x20 => {
            // Presentation Context item (proposed):
            // context ID, 3 reserved bytes,
            // then one abstract syntax sub-item (0x30)
            // and one or more transfer syntax sub-items (0x40)
            let mut abstract_syntax: Option<String> = None;
            let mut transfer_syntaxes = vec![];

            let presentation_context_id = cursor.read_u8().context(ReadFieldSnafu {
                field: "presentation context ID",
            })?;

            cursor
                .seek(SeekFrom::Current(3))
                .context(ReadFieldSnafu { field: "reserved" })?;

            while cursor.position() < cursor.get_ref().len() as u64 {
                let item_type = cursor
                    .read_u8()
                    .context(ReadFieldSnafu { field: "item type" })?;

                cursor
                    .read_u8()
                    .context(ReadFieldSnafu { field: "reserved" })?;

                let item_length = cursor.read_u16::<BigEndian>().context(ReadFieldSnafu {
                    field: "item length",
                })?;

                match item_type {
                    0x30 => {
                        abstract_syntax =
                            Some(read_uid(&mut cursor, item_length as usize, codec)?);
                    }
                    0x40 => {
                        transfer_syntaxes.push(read_uid(
                            &mut cursor,
                            item_length as usize,
                            codec,
                        )?);
                    }
                    _ => {
                        return UnexpectedSubItemSnafu {
                            place: "presentation context item",
                            item_type,
                        }
                        .fail();
                    }
                }
            }

            Ok(PduVariableItem::PresentationContextProposed(
                PresentationContextProposed {
                    id: presentation_context_id,
                    abstract_syntax: abstract_syntax.context(MissingItemSnafu {
                        item: "abstract syntax",
                    })?,
                    transfer_syntaxes,
                },
            ))
        }
        0x21 => {
            // Presentation Context item (result):
            // context ID, reserved, result/reason, reserved,
            // then exactly one transfer syntax sub-item
            let mut transfer_syntax: Option<String> = None;

            let presentation_context_id = cursor.read_u8().context(ReadFieldSnafu {
                field: "presentation context ID",
            })?;

            cursor
                .read_u8()
                .context(ReadFieldSnafu { field: "reserved" })?;

            let outcome_code = cursor.read_u8().context(ReadFieldSnafu {
                field: "result/reason",
            })?;
            let reason = PresentationContextResultReason::from(outcome_code)
                .context(UnknownContextOutcomeSnafu { code: outcome_code })?;

            cursor
                .read_u8()
                .context(ReadFieldSnafu { field: "reserved" })?;

            while cursor.position() < cursor.get_ref().len() as u64 {
                let item_type = cursor
                    .read_u8()
                    .context(ReadFieldSnafu { field: "item type" })?;

                cursor
                    .read_u8()
                    .context(ReadFieldSnafu { field: "reserved" })?;

                let item_length = cursor.read_u16::<BigEndian>().context(ReadFieldSnafu {
                    field: "item length",
                })?;

                match item_type {
                    0x40 => {
                        if transfer_syntax.is_some() {
                            // only one may be accepted
                            return AmbiguousTransferSyntaxSnafu.fail();
                        }
                        transfer_syntax =
                            Some(read_uid(&mut cursor, item_length as usize, codec)?);
                    }
                    _ => {
                        return UnexpectedSubItemSnafu {
                            place: "presentation context result item",
                            item_type,
                        }
                        .fail();
                    }
                }
            }

            Ok(PduVariableItem::PresentationContextResult(
                PresentationContextResult {
                    id: presentation_context_id,
                    reason,
                    transfer_syntax: transfer_syntax.context(MissingItemSnafu {
                        item: "transfer syntax",
                    })?,
                },
            ))
        }
        0x50 => {
            // User Information item: a sequence of sub-items
            let mut user_variables = vec![];

            while cursor.position() < cursor.get_ref().len() as u64 {
                let item_type = cursor
                    .read_u8()
                    .context(ReadFieldSnafu { field: "item type" })?;

                cursor
                    .read_u8()
                    .context(ReadFieldSnafu { field: "reserved" })?;

                let item_length = cursor.read_u16::<BigEndian>().context(ReadFieldSnafu {
                    field: "item length",
                })?;

                match item_type {
                    0x51 => {
                        // Maximum Length: a single big-endian u32,
                        // zero meaning unlimited
                        user_variables.push(UserVariableItem::MaxLength(
                            cursor.read_u32::<BigEndian>().context(ReadFieldSnafu {
                                field: "maximum length received",
                            })?,
                        ));
                    }
                    0x52 => {
                        let implementation_class_uid =
                            read_uid(&mut cursor, item_length as usize, codec)?;
                        user_variables.push(UserVariableItem::ImplementationClassUID(
                            implementation_class_uid,
                        ));
                    }
                    0x53 => {
                        // Asynchronous Operations Window:
                        // max operations invoked, max operations performed
                        let invoked = cursor.read_u16::<BigEndian>().context(ReadFieldSnafu {
                            field: "maximum operations invoked",
                        })?;
                        let performed =
                            cursor.read_u16::<BigEndian>().context(ReadFieldSnafu {
                                field: "maximum operations performed",
                            })?;
                        user_variables
                            .push(UserVariableItem::AsyncOperationsWindow(invoked, performed));
                    }
                    0x54 => {
                        // SCP/SCU Role Selection:
                        // UID length, SOP class UID, SCU role byte, SCP role byte
                        let uid_length =
                            cursor.read_u16::<BigEndian>().context(ReadFieldSnafu {
                                field: "SOP class UID length",
                            })?;
                        let sop_class_uid = read_uid(&mut cursor, uid_length as usize, codec)?;
                        let scu_role = cursor
                            .read_u8()
                            .context(ReadFieldSnafu { field: "SCU role" })?;
                        let scp_role = cursor
                            .read_u8()
                            .context(ReadFieldSnafu { field: "SCP role" })?;
                        user_variables.push(UserVariableItem::RoleSelection(RoleSelection {
                            sop_class_uid,
                            scu_role: scu_role == 1,
                            scp_role: scp_role == 1,
                        }));
                    }
                    0x55 => {
                        let implementation_version_name = codec
                            .decode(&read_n(&mut cursor, item_length as usize).context(
                                ReadFieldSnafu {
                                    field: "implementation version name",
                                },
                            )?)
                            .context(DecodeTextSnafu {
                                field: "implementation version name",
                            })?
                            .trim()
                            .to_string();
                        user_variables.push(UserVariableItem::ImplementationVersionName(
                            implementation_version_name,
                        ));
                    }
                    0x56 => {
                        // SOP Class Extended Negotiation:
                        // UID length, SOP class UID,
                        // then the service class application information
                        // up to the end of the sub-item
                        let sop_class_uid_length =
                            cursor.read_u16::<BigEndian>().context(ReadFieldSnafu {
                                field: "SOP class UID length",
                            })?;

                        let sop_class_uid =
                            read_uid(&mut cursor, sop_class_uid_length as usize, codec)?;

                        let data_length = item_length
                            .saturating_sub(2)
                            .saturating_sub(sop_class_uid_length);
                        let data = read_n(&mut cursor, data_length as usize).context(
                            ReadFieldSnafu {
                                field: "service class application information",
                            },
                        )?;

                        user_variables.push(UserVariableItem::SopClassExtendedNegotiationSubItem(
                            sop_class_uid,
                            data,
                        ));
                    }
                    0x57 => {
                        // SOP Class Common Extended Negotiation:
                        // SOP class UID, service class UID,
                        // then a list of related general SOP class UIDs
                        let sop_class_uid_length =
                            cursor.read_u16::<BigEndian>().context(ReadFieldSnafu {
                                field: "SOP class UID length",
                            })?;
                        let sop_class_uid =
                            read_uid(&mut cursor, sop_class_uid_length as usize, codec)?;

                        let service_class_uid_length =
                            cursor.read_u16::<BigEndian>().context(ReadFieldSnafu {
                                field: "service class UID length",
                            })?;
                        let service_class_uid =
                            read_uid(&mut cursor, service_class_uid_length as usize, codec)?;

                        let related_length =
                            cursor.read_u16::<BigEndian>().context(ReadFieldSnafu {
                                field: "related general SOP class identification length",
                            })?;
                        let related_bytes =
                            read_n(&mut cursor, related_length as usize).context(
                                ReadFieldSnafu {
                                    field: "related general SOP class identification",
                                },
                            )?;

                        let mut related_general_sop_classes = vec![];
                        let mut related_cursor = Cursor::new(&related_bytes[..]);
                        while related_cursor.position() < related_bytes.len() as u64 {
                            let uid_length = related_cursor.read_u16::<BigEndian>().context(
                                ReadFieldSnafu {
                                    field: "related general SOP class UID length",
                                },
                            )?;
                            related_general_sop_classes.push(read_uid(
                                &mut related_cursor,
                                uid_length as usize,
                                codec,
                            )?);
                        }

                        user_variables.push(
                            UserVariableItem::SopClassCommonExtendedNegotiationSubItem(
                                SopClassCommonExtended {
                                    sop_class_uid,
                                    service_class_uid,
                                    related_general_sop_classes,
                                },
                            ),
                        );
                    }
                    0x58 => {
                        // User Identity negotiation request
                        let user_identity_type = cursor.read_u8().context(ReadFieldSnafu {
                            field: "user identity type",
                        })?;

                        let positive_response_requested =
                            cursor.read_u8().context(ReadFieldSnafu {
                                field: "positive response requested",
                            })?;

                        let primary_field_length =
                            cursor.read_u16::<BigEndian>().context(ReadFieldSnafu {
                                field: "primary field length",
                            })?;

                        let primary_field = read_n(&mut cursor, primary_field_length as usize)
                            .context(ReadFieldSnafu {
                                field: "primary field",
                            })?;

                        // only non-zero for username-and-password identities
                        let secondary_field_length =
                            cursor.read_u16::<BigEndian>().context(ReadFieldSnafu {
                                field: "secondary field length",
                            })?;

                        let secondary_field = read_n(&mut cursor, secondary_field_length as usize)
                            .context(ReadFieldSnafu {
                                field: "secondary field",
                            })?;

                        match UserIdentityType::from(user_identity_type) {
                            Some(user_identity_type) => {
                                user_variables.push(UserVariableItem::UserIdentityItem(
                                    UserIdentity::new(
                                        positive_response_requested == 1,
                                        user_identity_type,
                                        primary_field,
                                        secondary_field,
                                    ),
                                ));
                            }
                            None => {
                                warn!("unknown user identity type code {}", user_identity_type);
                            }
                        }
                    }
                    0x59 => {
                        // User Identity negotiation response:
                        // the server response blob, opaque at this layer
                        let server_response_length =
                            cursor.read_u16::<BigEndian>().context(ReadFieldSnafu {
                                field: "server response length",
                            })?;
                        let server_response = read_n(&mut cursor, server_response_length as usize)
                            .context(ReadFieldSnafu {
                                field: "server response",
                            })?;
                        user_variables
                            .push(UserVariableItem::UserIdentityResponseItem(server_response));
                    }
                    _ => {
                        // unknown sub-items round-trip as opaque blobs
                        user_variables.push(UserVariableItem::Unknown(
                            item_type,
                            read_n(&mut cursor, item_length as usize)
                                .context(ReadFieldSnafu { field: "sub-item" })?,
                        ));
                    }
                }
            }

            Ok(PduVariableItem::UserVariables(user_variables))
        }
        _ => Ok(PduVariableItem::Unknown(item_type)),
    }
}
