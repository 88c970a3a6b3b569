//! Service class support:
//! the SOP class registry mapping UIDs to service classes,
//! the intervention handler traits
//! and the notification event bus.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

pub mod handlers;

pub use handlers::{
    CancelToken, DefaultNegotiation, EventBus, ExtendedNegotiationHandler, FindHandler, GetHandler,
    HandlerRegistry, IdentityOutcome, MoveHandler, NRequest, NResponse, NServiceHandler,
    Notification, QueryRequest, QueryResponses, RetrieveResponses, StoreHandler, StoreRequest,
};

use dicom_dictionary_std::uids;

/// The service class a SOP class is registered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceClassKind {
    /// the verification service class (C-ECHO)
    Verification,
    /// the storage service class (C-STORE)
    Storage,
    /// the query/retrieve service class (C-FIND/C-GET/C-MOVE)
    QueryRetrieve,
    /// the basic worklist management service class (C-FIND)
    BasicWorklist,
}

/// Distinguishes the message type a query/retrieve SOP class uses,
/// since the service class spans three operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryRetrieveMessage {
    Find,
    Get,
    Move,
}

/// One entry of the SOP class registry.
#[derive(Debug, Clone)]
pub struct SopClassEntry {
    /// the SOP class UID
    pub uid: String,
    /// a keyword naming the SOP class
    pub keyword: String,
    /// the service class the SOP class belongs to
    pub service_class: ServiceClassKind,
    /// for query/retrieve SOP classes, which operation they carry
    pub message_type: Option<QueryRetrieveMessage>,
}

type Registry = RwLock<HashMap<String, SopClassEntry>>;

static REGISTRY: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| RwLock::new(standard_entries()))
}

/// Register a SOP class with a service class,
/// extending (or overriding) the standard registrations.
pub fn register_uid(
    uid: &str,
    keyword: &str,
    service_class: ServiceClassKind,
    message_type: Option<QueryRetrieveMessage>,
) {
    let entry = SopClassEntry {
        uid: uid.to_string(),
        keyword: keyword.to_string(),
        service_class,
        message_type,
    };
    registry()
        .write()
        .expect("SOP class registry poisoned")
        .insert(uid.to_string(), entry);
}

/// Look up the registered service class of a SOP class.
pub fn lookup(uid: &str) -> Option<SopClassEntry> {
    registry()
        .read()
        .expect("SOP class registry poisoned")
        .get(uid)
        .cloned()
}

/// The UIDs registered to the given service class.
pub fn uids_of(service_class: ServiceClassKind) -> Vec<String> {
    registry()
        .read()
        .expect("SOP class registry poisoned")
        .values()
        .filter(|entry| entry.service_class == service_class)
        .map(|entry| entry.uid.clone())
        .collect()
}

fn entry(
    uid: &str,
    keyword: &str,
    service_class: ServiceClassKind,
    message_type: Option<QueryRetrieveMessage>,
) -> (String, SopClassEntry) {
    (
        uid.to_string(),
        SopClassEntry {
            uid: uid.to_string(),
            keyword: keyword.to_string(),
            service_class,
            message_type,
        },
    )
}

/// The standard SOP classes known out of the box.
fn standard_entries() -> HashMap<String, SopClassEntry> {
    use QueryRetrieveMessage::*;
    use ServiceClassKind::*;

    let mut entries = HashMap::new();
    entries.extend([
        entry(uids::VERIFICATION, "Verification", Verification, None),
        // query/retrieve information models
        entry(
            uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
            "PatientRootQueryRetrieveInformationModelFind",
            QueryRetrieve,
            Some(Find),
        ),
        entry(
            uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET,
            "PatientRootQueryRetrieveInformationModelGet",
            QueryRetrieve,
            Some(Get),
        ),
        entry(
            uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
            "PatientRootQueryRetrieveInformationModelMove",
            QueryRetrieve,
            Some(Move),
        ),
        entry(
            uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
            "StudyRootQueryRetrieveInformationModelFind",
            QueryRetrieve,
            Some(Find),
        ),
        entry(
            uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET,
            "StudyRootQueryRetrieveInformationModelGet",
            QueryRetrieve,
            Some(Get),
        ),
        entry(
            uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
            "StudyRootQueryRetrieveInformationModelMove",
            QueryRetrieve,
            Some(Move),
        ),
        entry(
            uids::MODALITY_WORKLIST_INFORMATION_MODEL_FIND,
            "ModalityWorklistInformationModelFind",
            BasicWorklist,
            Some(Find),
        ),
        // common storage SOP classes,
        // identified by their registered UIDs
        entry("1.2.840.10008.5.1.4.1.1.1", "ComputedRadiographyImageStorage", Storage, None),
        entry("1.2.840.10008.5.1.4.1.1.1.1", "DigitalXRayImageStorageForPresentation", Storage, None),
        entry("1.2.840.10008.5.1.4.1.1.1.2", "DigitalMammographyXRayImageStorageForPresentation", Storage, None),
        entry("1.2.840.10008.5.1.4.1.1.2", "CTImageStorage", Storage, None),
        entry("1.2.840.10008.5.1.4.1.1.2.1", "EnhancedCTImageStorage", Storage, None),
        entry("1.2.840.10008.5.1.4.1.1.3.1", "UltrasoundMultiFrameImageStorage", Storage, None),
        entry("1.2.840.10008.5.1.4.1.1.4", "MRImageStorage", Storage, None),
        entry("1.2.840.10008.5.1.4.1.1.4.1", "EnhancedMRImageStorage", Storage, None),
        entry("1.2.840.10008.5.1.4.1.1.6.1", "UltrasoundImageStorage", Storage, None),
        entry("1.2.840.10008.5.1.4.1.1.7", "SecondaryCaptureImageStorage", Storage, None),
        entry("1.2.840.10008.5.1.4.1.1.11.1", "GrayscaleSoftcopyPresentationStateStorage", Storage, None),
        entry("1.2.840.10008.5.1.4.1.1.12.1", "XRayAngiographicImageStorage", Storage, None),
        entry("1.2.840.10008.5.1.4.1.1.12.2", "XRayRadiofluoroscopicImageStorage", Storage, None),
        entry("1.2.840.10008.5.1.4.1.1.20", "NuclearMedicineImageStorage", Storage, None),
        entry("1.2.840.10008.5.1.4.1.1.77.1.4", "VLPhotographicImageStorage", Storage, None),
        entry("1.2.840.10008.5.1.4.1.1.77.1.5.1", "OphthalmicPhotography8BitImageStorage", Storage, None),
        entry("1.2.840.10008.5.1.4.1.1.88.11", "BasicTextSRStorage", Storage, None),
        entry("1.2.840.10008.5.1.4.1.1.88.22", "EnhancedSRStorage", Storage, None),
        entry("1.2.840.10008.5.1.4.1.1.88.33", "ComprehensiveSRStorage", Storage, None),
        entry("1.2.840.10008.5.1.4.1.1.104.1", "EncapsulatedPDFStorage", Storage, None),
        entry("1.2.840.10008.5.1.4.1.1.128", "PositronEmissionTomographyImageStorage", Storage, None),
        entry("1.2.840.10008.5.1.4.1.1.481.1", "RTImageStorage", Storage, None),
        entry("1.2.840.10008.5.1.4.1.1.481.2", "RTDoseStorage", Storage, None),
        entry("1.2.840.10008.5.1.4.1.1.481.3", "RTStructureSetStorage", Storage, None),
        entry("1.2.840.10008.5.1.4.1.1.481.5", "RTPlanStorage", Storage, None),
    ]);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registrations_are_present() {
        let verification = lookup(uids::VERIFICATION).unwrap();
        assert_eq!(verification.service_class, ServiceClassKind::Verification);

        let ct = lookup(uids::CT_IMAGE_STORAGE).unwrap();
        assert_eq!(ct.service_class, ServiceClassKind::Storage);
        assert_eq!(ct.message_type, None);

        let find = lookup(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND).unwrap();
        assert_eq!(find.service_class, ServiceClassKind::QueryRetrieve);
        assert_eq!(find.message_type, Some(QueryRetrieveMessage::Find));
    }

    #[test]
    fn private_sop_classes_can_be_registered() {
        register_uid(
            "1.2.246.352.70.1.70",
            "PrivateRTPlanStorage",
            ServiceClassKind::Storage,
            None,
        );
        let entry = lookup("1.2.246.352.70.1.70").unwrap();
        assert_eq!(entry.keyword, "PrivateRTPlanStorage");
        assert_eq!(entry.service_class, ServiceClassKind::Storage);
        assert!(uids_of(ServiceClassKind::Storage)
            .contains(&"1.2.246.352.70.1.70".to_string()));
    }
}
