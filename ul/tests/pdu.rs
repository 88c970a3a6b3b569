//! Round-trip tests for the PDU codec:
//! for every well-formed PDU `P`, `decode(encode(P)) == P`.
use netdicom_ul::pdu::{
    read_pdu, write_pdu, AbortRQServiceProviderReason, AbortRQSource, AssociationAC, AssociationRJ,
    AssociationRJResult, AssociationRJServiceUserReason, AssociationRJSource, AssociationRQ,
    PDataValue, PDataValueType, Pdu, PresentationContextProposed, PresentationContextResult,
    PresentationContextResultReason, RoleSelection, SopClassCommonExtended, UserIdentity,
    UserIdentityType, UserVariableItem, DEFAULT_MAX_PDU, MAXIMUM_PDU_SIZE,
};
use std::io::Cursor;

fn roundtrip(pdu: Pdu) {
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &pdu).expect("encoding should succeed");

    let decoded = read_pdu(&mut Cursor::new(&bytes), MAXIMUM_PDU_SIZE, true)
        .expect("decoding should succeed");
    assert_eq!(decoded, pdu);
}

#[test]
fn roundtrip_association_rq() {
    roundtrip(Pdu::AssociationRQ(AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "SOME-SCU".to_string(),
        called_ae_title: "MAIN-STORAGE".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![
            PresentationContextProposed {
                id: 1,
                abstract_syntax: "1.2.840.10008.1.1".to_string(),
                transfer_syntaxes: vec![
                    "1.2.840.10008.1.2".to_string(),
                    "1.2.840.10008.1.2.1".to_string(),
                ],
            },
            PresentationContextProposed {
                id: 3,
                abstract_syntax: "1.2.840.10008.5.1.4.1.1.2".to_string(),
                transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
            },
        ],
        user_variables: vec![
            UserVariableItem::MaxLength(16_384),
            UserVariableItem::ImplementationClassUID("2.25.137".to_string()),
            UserVariableItem::ImplementationVersionName("TEST01".to_string()),
        ],
    }));
}

#[test]
fn roundtrip_association_rq_with_negotiation_items() {
    roundtrip(Pdu::AssociationRQ(AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "GET-SCU".to_string(),
        called_ae_title: "QR-SCP".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.840.10008.5.1.4.1.1.2".to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        }],
        user_variables: vec![
            UserVariableItem::MaxLength(0),
            UserVariableItem::AsyncOperationsWindow(5, 1),
            UserVariableItem::RoleSelection(RoleSelection {
                sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".to_string(),
                scu_role: true,
                scp_role: true,
            }),
            UserVariableItem::SopClassExtendedNegotiationSubItem(
                "1.2.840.10008.5.1.4.1.2.2.1".to_string(),
                vec![0x01, 0x00, 0x01],
            ),
            UserVariableItem::SopClassCommonExtendedNegotiationSubItem(SopClassCommonExtended {
                sop_class_uid: "1.2.840.10008.5.1.4.1.1.88.22".to_string(),
                service_class_uid: "1.2.840.10008.4.2".to_string(),
                related_general_sop_classes: vec!["1.2.840.10008.5.1.4.1.1.88.11".to_string()],
            }),
            UserVariableItem::UserIdentityItem(UserIdentity::new(
                true,
                UserIdentityType::UsernameAndPassword,
                b"caesar".to_vec(),
                b"veni-vidi-vici".to_vec(),
            )),
        ],
    }));
}

#[test]
fn roundtrip_association_ac() {
    roundtrip(Pdu::AssociationAC(AssociationAC {
        protocol_version: 1,
        calling_ae_title: "SOME-SCU".to_string(),
        called_ae_title: "MAIN-STORAGE".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![
            PresentationContextResult {
                id: 1,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
            },
            PresentationContextResult {
                id: 3,
                reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
            },
        ],
        user_variables: vec![
            UserVariableItem::MaxLength(32_768),
            UserVariableItem::RoleSelection(RoleSelection {
                sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".to_string(),
                scu_role: false,
                scp_role: true,
            }),
            UserVariableItem::UserIdentityResponseItem(vec![0xAA, 0xBB]),
        ],
    }));
}

#[test]
fn roundtrip_association_rj() {
    roundtrip(Pdu::AssociationRJ(AssociationRJ {
        result: AssociationRJResult::Permanent,
        source: AssociationRJSource::ServiceUser(
            AssociationRJServiceUserReason::CalledAETitleNotRecognized,
        ),
    }));
    roundtrip(Pdu::AssociationRJ(AssociationRJ {
        result: AssociationRJResult::Transient,
        source: AssociationRJSource::ServiceProviderPresentation(
            netdicom_ul::pdu::AssociationRJServiceProviderPresentationReason::LocalLimitExceeded,
        ),
    }));
}

#[test]
fn roundtrip_pdata() {
    roundtrip(Pdu::PData {
        data: vec![
            PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![0x55; 64],
            },
            PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Data,
                is_last: false,
                data: vec![0xAA; 128],
            },
        ],
    });
}

#[test]
fn roundtrip_release_and_abort() {
    roundtrip(Pdu::ReleaseRQ);
    roundtrip(Pdu::ReleaseRP);
    roundtrip(Pdu::AbortRQ {
        source: AbortRQSource::ServiceUser,
    });
    roundtrip(Pdu::AbortRQ {
        source: AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnexpectedPdu),
    });
}

/// unknown user information sub-items survive decoding
/// and re-encoding unchanged
#[test]
fn unknown_user_sub_items_pass_through() {
    let pdu = Pdu::AssociationRQ(AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "SOME-SCU".to_string(),
        called_ae_title: "SOME-SCP".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.840.10008.1.1".to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        }],
        user_variables: vec![
            UserVariableItem::MaxLength(16_384),
            // a private sub-item this implementation knows nothing about
            UserVariableItem::Unknown(0x77, vec![1, 2, 3, 4, 5]),
        ],
    });

    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &pdu).unwrap();
    let decoded = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true).unwrap();
    assert_eq!(decoded, pdu);

    // and they are re-encoded byte for byte
    let mut bytes2 = Vec::new();
    write_pdu(&mut bytes2, &decoded).unwrap();
    assert_eq!(bytes, bytes2);
}

/// an inner length field pointing past the end of the PDU
/// is a decoding error, not a silent truncation
#[test]
fn inconsistent_item_length_is_an_error() {
    let pdu = Pdu::AssociationRQ(AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "SOME-SCU".to_string(),
        called_ae_title: "SOME-SCP".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.840.10008.1.1".to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        }],
        user_variables: vec![],
    });
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &pdu).unwrap();

    // truncate the PDU body and fix up the outer length accordingly:
    // the application context item length now exceeds the payload
    let truncated_len = bytes.len() - 8;
    let mut bytes = bytes[..truncated_len].to_vec();
    let body_len = (truncated_len - 6) as u32;
    bytes[2..6].copy_from_slice(&body_len.to_be_bytes());

    let result = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true);
    assert!(result.is_err(), "expected malformed PDU error");
}

/// PDUs longer than the negotiated maximum are refused in strict mode
/// and tolerated up to the hard ceiling otherwise
#[test]
fn oversized_pdu_enforcement() {
    let payload_len = 8_000_usize;
    let pdu = Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Data,
            is_last: true,
            data: vec![0; payload_len],
        }],
    };
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &pdu).unwrap();

    let strict = read_pdu(&mut Cursor::new(&bytes), 4_096, true);
    assert!(strict.is_err());

    let lenient = read_pdu(&mut Cursor::new(&bytes), 4_096, false).unwrap();
    assert_eq!(lenient, pdu);
}
