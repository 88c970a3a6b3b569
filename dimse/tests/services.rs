//! End-to-end service tests over localhost TCP:
//! verification echo, storage with byte-equal reassembly,
//! rejected-context enforcement and query response streaming.
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::entries;

use netdicom_dimse::scp::{run_association, ScpOptions};
use netdicom_dimse::scu;
use netdicom_dimse::service::{
    CancelToken, HandlerRegistry, QueryRequest, QueryResponses, StoreHandler, StoreRequest,
};
use netdicom_dimse::{DimseAssociation, Error, Status};
use netdicom_ul::association::client::ClientAssociationOptions;

static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
static VERIFICATION: &str = "1.2.840.10008.1.1";
static CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
static BASIC_TEXT_SR_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.88.11";
static STUDY_ROOT_FIND: &str = "1.2.840.10008.5.1.4.1.2.2.1";

static SCU_AET: &str = "TEST-SCU";
static SCP_AET: &str = "TEST-SCP";

async fn spawn_scp(options: ScpOptions) -> (tokio::task::JoinHandle<()>, SocketAddr) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (socket, peer) = listener.accept().await.unwrap();
        run_association(socket, peer, Arc::new(options))
            .await
            .expect("SCP association failed");
    });
    (handle, addr)
}

/// Scenario: plain verification echo.
/// One context with the verification SOP class over
/// implicit VR little endian; C-ECHO-RQ with message ID 1
/// elicits a successful C-ECHO-RSP.
#[tokio::test(flavor = "multi_thread")]
async fn verification_echo() {
    let options = ScpOptions {
        ae_title: SCP_AET.to_string(),
        ..ScpOptions::new()
    };
    let (scp, addr) = spawn_scp(options).await;

    let association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AET)
        .called_ae_title(SCP_AET)
        .with_presentation_context(VERIFICATION, vec![IMPLICIT_VR_LE])
        .establish(addr)
        .await
        .unwrap();

    // the context is accepted with the proposed transfer syntax
    let pc = &association.presentation_contexts()[0];
    assert!(pc.is_accepted());
    assert_eq!(pc.transfer_syntax, IMPLICIT_VR_LE);

    let mut dimse = DimseAssociation::new(association);
    let status = scu::echo(&mut dimse, 1, VERIFICATION).await.unwrap();
    assert_eq!(status, Status::SUCCESS);

    dimse.release().await.unwrap();
    scp.await.unwrap();
}

use netdicom_ul::association::Association;

#[derive(Debug, Default)]
struct CapturingStore {
    received: Arc<Mutex<Vec<(String, String, Vec<u8>)>>>,
}

impl StoreHandler for CapturingStore {
    fn handle_store(&self, request: StoreRequest) -> Status {
        self.received.lock().unwrap().push((
            request.sop_class_uid,
            request.sop_instance_uid,
            request.data,
        ));
        Status::SUCCESS
    }
}

fn sample_instance(sop_instance_uid: &str) -> InMemDicomObject {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        tags::SOP_CLASS_UID,
        VR::UI,
        dicom_value!(Str, CT_IMAGE_STORAGE),
    ));
    obj.put(DataElement::new(
        tags::SOP_INSTANCE_UID,
        VR::UI,
        dicom_value!(Str, sop_instance_uid),
    ));
    obj.put(DataElement::new(
        tags::PATIENT_ID,
        VR::LO,
        dicom_value!(Str, "PAT0001"),
    ));
    // bulk payload large enough to require fragmentation
    // at the negotiated maximum PDU length
    let bulk: Vec<u8> = (0..100_000u32).map(|i| (i % 199) as u8).collect();
    obj.put(DataElement::new(
        tags::PIXEL_DATA,
        VR::OB,
        dicom_core::PrimitiveValue::from(bulk),
    ));
    obj
}

/// Scenario: a 100 KB instance crosses the wire in fragments
/// bounded by a 16384-byte maximum PDU length
/// and reassembles byte-equal on the storage provider.
#[tokio::test(flavor = "multi_thread")]
async fn storage_roundtrip_with_fragmentation() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let options = ScpOptions {
        ae_title: SCP_AET.to_string(),
        max_pdu_length: 16_384,
        handlers: HandlerRegistry::new().on_store(CapturingStore {
            received: Arc::clone(&received),
        }),
        ..ScpOptions::new()
    };
    let (scp, addr) = spawn_scp(options).await;

    let association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AET)
        .called_ae_title(SCP_AET)
        .with_presentation_context(CT_IMAGE_STORAGE, vec![IMPLICIT_VR_LE])
        .max_pdu_length(16_384)
        .establish(addr)
        .await
        .unwrap();

    let mut dimse = DimseAssociation::new(association);

    let instance = sample_instance("1.2.3.4.5.6");
    let status = scu::store(&mut dimse, 1, CT_IMAGE_STORAGE, "1.2.3.4.5.6", &instance)
        .await
        .unwrap();
    assert_eq!(status, Status::SUCCESS);

    dimse.release().await.unwrap();
    scp.await.unwrap();

    // the provider saw the exact bytes the user encoded
    let mut expected = Vec::new();
    instance
        .write_dataset_with_ts(&mut expected, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .unwrap();
    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    let (class_uid, instance_uid, bytes) = &received[0];
    assert_eq!(class_uid, CT_IMAGE_STORAGE);
    assert_eq!(instance_uid, "1.2.3.4.5.6");
    assert_eq!(bytes, &expected);
}

/// Scenario: one proposed context for a SOP class the acceptor
/// does not serve is rejected with outcome 0x03;
/// the association still stands on the remaining context,
/// and any send on the rejected context is refused locally.
#[tokio::test(flavor = "multi_thread")]
async fn rejected_context_is_never_used() {
    let options = ScpOptions {
        ae_title: SCP_AET.to_string(),
        ..ScpOptions::new()
    };
    let (scp, addr) = spawn_scp(options).await;

    let association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AET)
        .called_ae_title(SCP_AET)
        .with_presentation_context(VERIFICATION, vec![IMPLICIT_VR_LE])
        // no storage handler at the SCP: not in its supported set
        .with_presentation_context(BASIC_TEXT_SR_STORAGE, vec![IMPLICIT_VR_LE])
        .establish(addr)
        .await
        .unwrap();

    use netdicom_ul::pdu::PresentationContextResultReason;
    let rejected = association
        .presentation_contexts()
        .iter()
        .find(|pc| pc.id == 3)
        .unwrap();
    assert_eq!(
        rejected.reason,
        PresentationContextResultReason::AbstractSyntaxNotSupported
    );

    let mut dimse = DimseAssociation::new(association);

    // a C-STORE on the rejected context fails before any byte is sent
    let instance = sample_instance("1.2.3.4");
    let outcome = scu::store(&mut dimse, 3, BASIC_TEXT_SR_STORAGE, "1.2.3.4", &instance).await;
    assert!(
        matches!(outcome, Err(Error::UnsupportedContext { context_id: 3, .. })),
        "unexpected outcome: {:?}",
        outcome.err()
    );

    // the accepted context still works
    let status = scu::echo(&mut dimse, 1, VERIFICATION).await.unwrap();
    assert_eq!(status, Status::SUCCESS);

    dimse.release().await.unwrap();
    scp.await.unwrap();
}

#[derive(Debug)]
struct TwoMatchFind;

impl netdicom_dimse::service::FindHandler for TwoMatchFind {
    fn handle_find(&self, request: QueryRequest, _cancel: CancelToken) -> QueryResponses {
        assert_eq!(request.sop_class_uid, STUDY_ROOT_FIND);
        let matches = ["STUDY-A", "STUDY-B"].map(|study| {
            let mut obj = InMemDicomObject::new_empty();
            obj.put(DataElement::new(
                tags::STUDY_ID,
                VR::SH,
                dicom_value!(Str, study),
            ));
            (Status::PENDING, Some(obj))
        });
        Box::new(matches.into_iter())
    }
}

/// C-FIND: pending matches stream in order,
/// the final response carries the success status.
#[tokio::test(flavor = "multi_thread")]
async fn find_streams_matches_in_order() {
    let options = ScpOptions {
        ae_title: SCP_AET.to_string(),
        handlers: HandlerRegistry::new().on_find(TwoMatchFind),
        ..ScpOptions::new()
    };
    let (scp, addr) = spawn_scp(options).await;

    let association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AET)
        .called_ae_title(SCP_AET)
        .with_presentation_context(STUDY_ROOT_FIND, vec![IMPLICIT_VR_LE])
        .establish(addr)
        .await
        .unwrap();

    let mut dimse = DimseAssociation::new(association);

    let mut query = InMemDicomObject::new_empty();
    query.put(DataElement::new(
        tags::QUERY_RETRIEVE_LEVEL,
        VR::CS,
        dicom_value!(Str, "STUDY"),
    ));
    query.put(DataElement::new(
        tags::STUDY_ID,
        VR::SH,
        dicom_value!(Str, ""),
    ));

    let mut matches = Vec::new();
    let status = scu::find(&mut dimse, 1, STUDY_ROOT_FIND, &query, |identifier| {
        let obj = InMemDicomObject::read_dataset_with_ts(
            identifier.as_slice(),
            &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
        )
        .unwrap();
        matches.push(obj.element(tags::STUDY_ID).unwrap().to_str().unwrap().to_string());
    })
    .await
    .unwrap();

    assert_eq!(status, Status::SUCCESS);
    assert_eq!(matches, vec!["STUDY-A".to_string(), "STUDY-B".to_string()]);

    dimse.release().await.unwrap();
    scp.await.unwrap();
}
