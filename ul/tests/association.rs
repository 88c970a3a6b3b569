//! Socket-level association tests:
//! negotiated parameters, maximum-length enforcement,
//! fragment sizing and the ways an association can end.
use netdicom_ul::association::client::ClientAssociationOptions;
use netdicom_ul::association::server::ServerAssociationOptions;
use netdicom_ul::association::{Association, AsyncAssociation, Error};
use netdicom_ul::pdu::{
    PDataValue, PDataValueType, Pdu, PresentationContextResultReason,
};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

static SCU_AE_TITLE: &str = "UNIT-SCU";
static SCP_AE_TITLE: &str = "UNIT-SCP";

static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
static EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";
static VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";
static MR_IMAGE_STORAGE_SOP_CLASS: &str = "1.2.840.10008.5.1.4.1.1.4";

// Deliberately odd, distinct maximum lengths for the two sides,
// so that each direction is bounded by the *other* side's announcement.
const SCU_MAX_PDU: u32 = 6_244;
const SCP_MAX_PDU: u32 = 9_360;
/// bytes of PDV framing inside one P-DATA-TF:
/// item length (4), context ID (1) and message control header (1)
const FRAGMENT_OVERHEAD: usize = 6;

/// The largest single-fragment payload a peer with the given
/// maximum PDU length can take.
fn payload_capacity(peer_max: u32) -> usize {
    peer_max as usize - FRAGMENT_OVERHEAD
}

/// A command fragment filled with a recognizable byte pattern.
fn patterned_fragment(len: usize) -> Pdu {
    Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Command,
            is_last: true,
            data: (0..len).map(|i| (i * 7 % 251) as u8).collect(),
        }],
    }
}

/// Drain incoming P-DATA until a last fragment arrives,
/// returning the fragment sizes seen along the way.
async fn collect_fragment_sizes<A: AsyncAssociation>(assoc: &mut A) -> Result<Vec<usize>> {
    let mut sizes = Vec::new();
    loop {
        match assoc.receive().await? {
            Pdu::PData { data } => {
                let mut done = false;
                for pdv in data {
                    sizes.push(pdv.data.len());
                    done = pdv.is_last;
                }
                if done {
                    return Ok(sizes);
                }
            }
            other => panic!("expected P-DATA, got {:?}", other),
        }
    }
}

/// One association exercised end to end over localhost:
/// negotiation outcomes on both sides, the maximum-length guard
/// in both directions, fragment sizing by `send_pdata`,
/// and an orderly release.
#[tokio::test(flavor = "multi_thread")]
async fn negotiation_and_fragment_bounds() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let acceptor = tokio::spawn(async move {
        let (stream, _peer) = listener.accept().await?;
        let mut assoc = ServerAssociationOptions::new()
            .accept_called_ae_title()
            .ae_title(SCP_AE_TITLE)
            .max_pdu_length(SCP_MAX_PDU)
            .with_abstract_syntax(VERIFICATION_SOP_CLASS)
            .establish(stream)
            .await?;

        // of the two proposals, only verification is served
        assert_eq!(assoc.presentation_contexts().len(), 2);
        let verification = assoc.accepted_context(1).expect("context 1 accepted");
        assert_eq!(verification.abstract_syntax, VERIFICATION_SOP_CLASS);
        assert_eq!(verification.transfer_syntax, IMPLICIT_VR_LE);
        assert!(assoc.accepted_context(3).is_none());
        let storage = &assoc.presentation_contexts()[1];
        assert_eq!(
            storage.reason,
            PresentationContextResultReason::AbstractSyntaxNotSupported
        );

        // each side announced its own maximum
        assert_eq!(assoc.peer_max_pdu_length(), SCU_MAX_PDU);
        assert_eq!(assoc.local_max_pdu_length(), SCP_MAX_PDU);

        // the requestor fills our announced maximum exactly
        let sizes = collect_fragment_sizes(&mut assoc).await?;
        assert_eq!(sizes, vec![payload_capacity(SCP_MAX_PDU)]);

        // answer with the largest PDU the requestor takes,
        // then overshoot by one byte and watch the guard trip
        assoc
            .send(&patterned_fragment(payload_capacity(SCU_MAX_PDU)))
            .await?;
        match assoc
            .send(&patterned_fragment(payload_capacity(SCU_MAX_PDU) + 1))
            .await
        {
            Err(Error::SendTooLongPdu { .. }) => {}
            other => panic!("oversized send must be refused, got {:?}", other),
        }

        // a three-fragment streamed payload from the requestor:
        // two full fragments and a remainder of 9 bytes
        let sizes = collect_fragment_sizes(&mut assoc).await?;
        assert_eq!(
            sizes,
            vec![
                payload_capacity(SCP_MAX_PDU),
                payload_capacity(SCP_MAX_PDU),
                9
            ]
        );

        // the peer asks for an orderly release
        assert_eq!(assoc.receive().await?, Pdu::ReleaseRQ);
        assoc.send(&Pdu::ReleaseRP).await?;
        Ok::<_, Box<dyn std::error::Error + Send + Sync>>(())
    });

    let mut assoc = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_presentation_context(VERIFICATION_SOP_CLASS, vec![IMPLICIT_VR_LE, EXPLICIT_VR_LE])
        .with_presentation_context(
            MR_IMAGE_STORAGE_SOP_CLASS,
            vec![EXPLICIT_VR_LE, IMPLICIT_VR_LE],
        )
        .max_pdu_length(SCU_MAX_PDU)
        .establish(addr)
        .await
        .expect("requestor-side establishment failed");

    // the requestor sees the same negotiated parameters
    assert_eq!(assoc.peer_max_pdu_length(), SCP_MAX_PDU);
    assert_eq!(assoc.local_max_pdu_length(), SCU_MAX_PDU);
    assert!(assoc.accepted_context(1).is_some());
    assert!(assoc.accepted_context(3).is_none());

    // fill the acceptor's maximum exactly; one byte more must be refused
    assoc
        .send(&patterned_fragment(payload_capacity(SCP_MAX_PDU)))
        .await
        .expect("maximal fragment should go through");
    match assoc
        .send(&patterned_fragment(payload_capacity(SCP_MAX_PDU) + 1))
        .await
    {
        Err(Error::SendTooLongPdu { .. }) => {}
        other => panic!("oversized send must be refused, got {:?}", other),
    }

    // the acceptor's maximal answer arrives in one piece
    let sizes = collect_fragment_sizes(&mut assoc).await.unwrap();
    assert_eq!(sizes, vec![payload_capacity(SCU_MAX_PDU)]);

    // stream two full fragments plus a 9-byte remainder
    {
        let payload = vec![0x5A_u8; payload_capacity(SCP_MAX_PDU) * 2 + 9];
        let mut sender = assoc.send_pdata(1);
        sender.write_all(&payload).await.unwrap();
        sender.finish().await.unwrap();
    }

    assoc.release().await.expect("release should be orderly");
    acceptor
        .await
        .expect("acceptor task panicked")
        .expect("acceptor-side failure");
}

/// a single proposed context for an unknown abstract syntax
/// leaves the client with no accepted contexts
#[tokio::test(flavor = "multi_thread")]
async fn no_accepted_contexts_is_an_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = ServerAssociationOptions::new()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS);

    let scp_handle = tokio::spawn(async move {
        let (stream, _addr) = listener.accept().await.unwrap();
        // the association is established from the acceptor's side,
        // with the single context rejected
        let association = scp.establish(stream).await.unwrap();
        assert_eq!(
            association.presentation_contexts()[0].reason,
            PresentationContextResultReason::AbstractSyntaxNotSupported,
        );
    });

    let outcome = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .with_presentation_context(
            "1.2.840.10008.5.1.4.1.1.88.11",
            vec![IMPLICIT_VR_LE],
        )
        .establish(addr)
        .await;

    assert!(
        matches!(outcome, Err(Error::NoAcceptedPresentationContexts { .. })),
        "unexpected outcome: {:?}",
        outcome.err()
    );
    scp_handle.await.unwrap();
}

/// both peers issue A-RELEASE-RQ within the same round trip;
/// both resolve the collision and come back to rest without an abort
#[tokio::test(flavor = "multi_thread")]
async fn release_collision_resolves_cleanly() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = ServerAssociationOptions::new()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS);

    let scp_handle = tokio::spawn(async move {
        let (stream, _addr) = listener.accept().await.unwrap();
        let mut association = scp.establish(stream).await.unwrap();

        // issue our own release while the peer is doing the same
        association.release().await.expect("SCP-side release failed");
    });

    let mut association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_presentation_context(VERIFICATION_SOP_CLASS, vec![IMPLICIT_VR_LE])
        .establish(addr)
        .await
        .unwrap();

    association.release().await.expect("SCU-side release failed");
    scp_handle.await.unwrap();
}

/// aborting tears the association down without a release handshake
#[tokio::test(flavor = "multi_thread")]
async fn abort_closes_the_association() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = ServerAssociationOptions::new()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS);

    let scp_handle = tokio::spawn(async move {
        let (stream, _addr) = listener.accept().await.unwrap();
        let mut association = scp.establish(stream).await.unwrap();
        match association.receive().await {
            Ok(Pdu::AbortRQ { .. }) => (),
            other => panic!("expected abort, got {:?}", other),
        }
    });

    let mut association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .with_presentation_context(VERIFICATION_SOP_CLASS, vec![IMPLICIT_VR_LE])
        .establish(addr)
        .await
        .unwrap();

    association.abort().await.expect("abort failed");
    scp_handle.await.unwrap();
}

/// fragmentation round trip: a large payload crosses the wire
/// in max-length fragments and reassembles byte-equal
#[tokio::test(flavor = "multi_thread")]
async fn large_payload_fragmentation_roundtrip() {
    const MAX_PDU: u32 = 16_384;
    let payload: Vec<u8> = (0..100_000_u32).map(|i| (i % 251) as u8).collect();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = ServerAssociationOptions::new()
        .ae_title(SCP_AE_TITLE)
        .max_pdu_length(MAX_PDU)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS);

    let expected = payload.clone();
    let scp_handle = tokio::spawn(async move {
        let (stream, _addr) = listener.accept().await.unwrap();
        let mut association = scp.establish(stream).await.unwrap();

        let mut received = Vec::new();
        let mut reader = association.receive_pdata(1);
        reader.read_to_end(&mut received).await.unwrap();
        assert_eq!(received.len(), expected.len());
        assert_eq!(received, expected);

        let pdu = association.receive().await.unwrap();
        assert_eq!(pdu, Pdu::ReleaseRQ);
        association.send(&Pdu::ReleaseRP).await.unwrap();
    });

    let mut association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .with_presentation_context(VERIFICATION_SOP_CLASS, vec![IMPLICIT_VR_LE])
        .max_pdu_length(MAX_PDU)
        .establish(addr)
        .await
        .unwrap();

    {
        let mut sender = association.send_pdata(1);
        sender.write_all(&payload).await.unwrap();
        sender.finish().await.unwrap();
    }

    association.release().await.unwrap();
    scp_handle.await.unwrap();
}
