//! Typed builders for the DIMSE command messages.
//!
//! Each struct mirrors the command set of one message type;
//! mandatory fields are required by the builder,
//! conditional fields are optional
//! and omitted from the encoded command set when absent.

use bon::Builder;
use dicom_core::{dicom_value, DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;

use super::{Command, CommandField, Priority};

fn put_us(obj: &mut InMemDicomObject, tag: Tag, value: u16) {
    obj.put(DataElement::new(tag, VR::US, dicom_value!(U16, [value])));
}

fn put_uid(obj: &mut InMemDicomObject, tag: Tag, value: &str) {
    obj.put(DataElement::new(tag, VR::UI, dicom_value!(Str, value)));
}

fn put_ae(obj: &mut InMemDicomObject, tag: Tag, value: &str) {
    obj.put(DataElement::new(tag, VR::AE, dicom_value!(Str, value)));
}

/// C-ECHO-RQ
#[derive(Debug, Builder)]
pub struct CEchoRq<'a> {
    /// Implementation-specific value distinguishing
    /// this message from other messages.
    pub message_id: u16,
    /// SOP class UID associated with the operation
    /// (the verification SOP class).
    pub affected_sop_class_uid: &'a str,
}

impl Command for CEchoRq<'_> {
    fn command_field(&self) -> u16 {
        CommandField::CEchoRq as u16
    }

    fn command_set(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        put_us(&mut obj, tags::MESSAGE_ID, self.message_id);
        put_uid(&mut obj, tags::AFFECTED_SOP_CLASS_UID, self.affected_sop_class_uid);
        obj
    }
}

/// C-ECHO-RSP
#[derive(Debug, Builder)]
pub struct CEchoRsp<'a> {
    /// The message ID of the C-ECHO-RQ being answered.
    pub message_id_being_responded_to: u16,
    /// SOP class UID associated with the operation.
    pub affected_sop_class_uid: Option<&'a str>,
    /// The outcome of the operation.
    pub status: u16,
}

impl Command for CEchoRsp<'_> {
    fn command_field(&self) -> u16 {
        CommandField::CEchoRsp as u16
    }

    fn command_set(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        put_us(
            &mut obj,
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            self.message_id_being_responded_to,
        );
        if let Some(uid) = self.affected_sop_class_uid {
            put_uid(&mut obj, tags::AFFECTED_SOP_CLASS_UID, uid);
        }
        put_us(&mut obj, tags::STATUS, self.status);
        obj
    }
}

/// C-STORE-RQ
#[derive(Debug, Builder)]
pub struct CStoreRq<'a> {
    /// Implementation-specific value distinguishing
    /// this message from other messages.
    pub message_id: u16,
    /// SOP class UID of the SOP instance to be stored.
    pub affected_sop_class_uid: &'a str,
    /// UID of the SOP instance to be stored.
    pub affected_sop_instance_uid: &'a str,
    /// Priority of the request.
    #[builder(default = Priority::Medium)]
    pub priority: Priority,
    /// AE title of the node which invoked the C-MOVE operation
    /// from which this C-STORE sub-operation stems.
    pub move_originator_application_entity_title: Option<&'a str>,
    /// Message ID of the C-MOVE-RQ from which
    /// this C-STORE sub-operation stems.
    pub move_originator_message_id: Option<u16>,
}

impl Command for CStoreRq<'_> {
    fn command_field(&self) -> u16 {
        CommandField::CStoreRq as u16
    }

    fn command_set(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        put_us(&mut obj, tags::MESSAGE_ID, self.message_id);
        put_uid(&mut obj, tags::AFFECTED_SOP_CLASS_UID, self.affected_sop_class_uid);
        put_uid(
            &mut obj,
            tags::AFFECTED_SOP_INSTANCE_UID,
            self.affected_sop_instance_uid,
        );
        put_us(&mut obj, tags::PRIORITY, self.priority as u16);
        if let Some(aet) = self.move_originator_application_entity_title {
            put_ae(
                &mut obj,
                tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE,
                aet,
            );
        }
        if let Some(id) = self.move_originator_message_id {
            put_us(&mut obj, tags::MOVE_ORIGINATOR_MESSAGE_ID, id);
        }
        obj
    }
}

/// C-STORE-RSP
#[derive(Debug, Builder)]
pub struct CStoreRsp<'a> {
    /// The message ID of the C-STORE-RQ being answered.
    pub message_id_being_responded_to: u16,
    /// SOP class UID of the stored SOP instance.
    pub affected_sop_class_uid: Option<&'a str>,
    /// UID of the stored SOP instance.
    pub affected_sop_instance_uid: Option<&'a str>,
    /// The outcome of the operation.
    pub status: u16,
}

impl Command for CStoreRsp<'_> {
    fn command_field(&self) -> u16 {
        CommandField::CStoreRsp as u16
    }

    fn command_set(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        put_us(
            &mut obj,
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            self.message_id_being_responded_to,
        );
        if let Some(uid) = self.affected_sop_class_uid {
            put_uid(&mut obj, tags::AFFECTED_SOP_CLASS_UID, uid);
        }
        if let Some(uid) = self.affected_sop_instance_uid {
            put_uid(&mut obj, tags::AFFECTED_SOP_INSTANCE_UID, uid);
        }
        put_us(&mut obj, tags::STATUS, self.status);
        obj
    }
}

/// C-FIND-RQ
#[derive(Debug, Builder)]
pub struct CFindRq<'a> {
    /// Implementation-specific value distinguishing
    /// this message from other messages.
    pub message_id: u16,
    /// SOP class UID of the information model queried.
    pub affected_sop_class_uid: &'a str,
    /// Priority of the request.
    #[builder(default = Priority::Medium)]
    pub priority: Priority,
}

impl Command for CFindRq<'_> {
    fn command_field(&self) -> u16 {
        CommandField::CFindRq as u16
    }

    fn command_set(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        put_us(&mut obj, tags::MESSAGE_ID, self.message_id);
        put_uid(&mut obj, tags::AFFECTED_SOP_CLASS_UID, self.affected_sop_class_uid);
        put_us(&mut obj, tags::PRIORITY, self.priority as u16);
        obj
    }
}

/// C-FIND-RSP
#[derive(Debug, Builder)]
pub struct CFindRsp<'a> {
    /// The message ID of the C-FIND-RQ being answered.
    pub message_id_being_responded_to: u16,
    /// SOP class UID of the information model queried.
    pub affected_sop_class_uid: Option<&'a str>,
    /// The outcome of the operation.
    pub status: u16,
}

impl Command for CFindRsp<'_> {
    fn command_field(&self) -> u16 {
        CommandField::CFindRsp as u16
    }

    fn command_set(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        put_us(
            &mut obj,
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            self.message_id_being_responded_to,
        );
        if let Some(uid) = self.affected_sop_class_uid {
            put_uid(&mut obj, tags::AFFECTED_SOP_CLASS_UID, uid);
        }
        put_us(&mut obj, tags::STATUS, self.status);
        obj
    }
}

/// Sub-operation progress counters shared by the C-GET
/// and C-MOVE responses.
#[derive(Debug, Default, Clone, Copy, Builder)]
pub struct SubOperationCounts {
    /// C-STORE sub-operations still to be invoked.
    pub remaining: Option<u16>,
    /// C-STORE sub-operations completed successfully.
    pub completed: Option<u16>,
    /// C-STORE sub-operations which failed.
    pub failed: Option<u16>,
    /// C-STORE sub-operations which returned a warning.
    pub warnings: Option<u16>,
}

impl SubOperationCounts {
    fn write_to(&self, obj: &mut InMemDicomObject) {
        if let Some(n) = self.remaining {
            put_us(obj, tags::NUMBER_OF_REMAINING_SUBOPERATIONS, n);
        }
        if let Some(n) = self.completed {
            put_us(obj, tags::NUMBER_OF_COMPLETED_SUBOPERATIONS, n);
        }
        if let Some(n) = self.failed {
            put_us(obj, tags::NUMBER_OF_FAILED_SUBOPERATIONS, n);
        }
        if let Some(n) = self.warnings {
            put_us(obj, tags::NUMBER_OF_WARNING_SUBOPERATIONS, n);
        }
    }
}

/// C-GET-RQ
#[derive(Debug, Builder)]
pub struct CGetRq<'a> {
    /// Implementation-specific value distinguishing
    /// this message from other messages.
    pub message_id: u16,
    /// SOP class UID of the information model queried.
    pub affected_sop_class_uid: &'a str,
    /// Priority of the request.
    #[builder(default = Priority::Medium)]
    pub priority: Priority,
}

impl Command for CGetRq<'_> {
    fn command_field(&self) -> u16 {
        CommandField::CGetRq as u16
    }

    fn command_set(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        put_us(&mut obj, tags::MESSAGE_ID, self.message_id);
        put_uid(&mut obj, tags::AFFECTED_SOP_CLASS_UID, self.affected_sop_class_uid);
        put_us(&mut obj, tags::PRIORITY, self.priority as u16);
        obj
    }
}

/// C-GET-RSP
#[derive(Debug, Builder)]
pub struct CGetRsp<'a> {
    /// The message ID of the C-GET-RQ being answered.
    pub message_id_being_responded_to: u16,
    /// SOP class UID of the information model queried.
    pub affected_sop_class_uid: Option<&'a str>,
    /// The outcome of the operation.
    pub status: u16,
    /// Progress of the C-STORE sub-operations.
    #[builder(default)]
    pub sub_operations: SubOperationCounts,
}

impl Command for CGetRsp<'_> {
    fn command_field(&self) -> u16 {
        CommandField::CGetRsp as u16
    }

    fn command_set(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        put_us(
            &mut obj,
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            self.message_id_being_responded_to,
        );
        if let Some(uid) = self.affected_sop_class_uid {
            put_uid(&mut obj, tags::AFFECTED_SOP_CLASS_UID, uid);
        }
        put_us(&mut obj, tags::STATUS, self.status);
        self.sub_operations.write_to(&mut obj);
        obj
    }
}

/// C-MOVE-RQ
#[derive(Debug, Builder)]
pub struct CMoveRq<'a> {
    /// Implementation-specific value distinguishing
    /// this message from other messages.
    pub message_id: u16,
    /// SOP class UID of the information model queried.
    pub affected_sop_class_uid: &'a str,
    /// Priority of the request.
    #[builder(default = Priority::Medium)]
    pub priority: Priority,
    /// AE title of the node which shall receive
    /// the C-STORE sub-operations.
    pub move_destination: &'a str,
}

impl Command for CMoveRq<'_> {
    fn command_field(&self) -> u16 {
        CommandField::CMoveRq as u16
    }

    fn command_set(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        put_us(&mut obj, tags::MESSAGE_ID, self.message_id);
        put_uid(&mut obj, tags::AFFECTED_SOP_CLASS_UID, self.affected_sop_class_uid);
        put_us(&mut obj, tags::PRIORITY, self.priority as u16);
        put_ae(&mut obj, tags::MOVE_DESTINATION, self.move_destination);
        obj
    }
}

/// C-MOVE-RSP
#[derive(Debug, Builder)]
pub struct CMoveRsp<'a> {
    /// The message ID of the C-MOVE-RQ being answered.
    pub message_id_being_responded_to: u16,
    /// SOP class UID of the information model queried.
    pub affected_sop_class_uid: Option<&'a str>,
    /// The outcome of the operation.
    pub status: u16,
    /// Progress of the C-STORE sub-operations.
    #[builder(default)]
    pub sub_operations: SubOperationCounts,
}

impl Command for CMoveRsp<'_> {
    fn command_field(&self) -> u16 {
        CommandField::CMoveRsp as u16
    }

    fn command_set(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        put_us(
            &mut obj,
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            self.message_id_being_responded_to,
        );
        if let Some(uid) = self.affected_sop_class_uid {
            put_uid(&mut obj, tags::AFFECTED_SOP_CLASS_UID, uid);
        }
        put_us(&mut obj, tags::STATUS, self.status);
        self.sub_operations.write_to(&mut obj);
        obj
    }
}

/// C-CANCEL-RQ,
/// interrupting the C-FIND/C-GET/C-MOVE operation
/// identified by the given message ID.
#[derive(Debug, Builder)]
pub struct CCancelRq {
    /// The message ID of the operation to interrupt.
    pub message_id_being_responded_to: u16,
}

impl Command for CCancelRq {
    fn command_field(&self) -> u16 {
        CommandField::CCancelRq as u16
    }

    fn command_set(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        put_us(
            &mut obj,
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            self.message_id_being_responded_to,
        );
        obj
    }
}

/// N-EVENT-REPORT-RQ
#[derive(Debug, Builder)]
pub struct NEventReportRq<'a> {
    /// Implementation-specific value distinguishing
    /// this message from other messages.
    pub message_id: u16,
    /// SOP class UID of the SOP instance the event applies to.
    pub affected_sop_class_uid: &'a str,
    /// SOP instance UID the event applies to.
    pub affected_sop_instance_uid: &'a str,
    /// The type of event being reported.
    pub event_type_id: u16,
}

impl Command for NEventReportRq<'_> {
    fn command_field(&self) -> u16 {
        CommandField::NEventReportRq as u16
    }

    fn command_set(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        put_us(&mut obj, tags::MESSAGE_ID, self.message_id);
        put_uid(&mut obj, tags::AFFECTED_SOP_CLASS_UID, self.affected_sop_class_uid);
        put_uid(
            &mut obj,
            tags::AFFECTED_SOP_INSTANCE_UID,
            self.affected_sop_instance_uid,
        );
        put_us(&mut obj, tags::EVENT_TYPE_ID, self.event_type_id);
        obj
    }
}

/// N-EVENT-REPORT-RSP
#[derive(Debug, Builder)]
pub struct NEventReportRsp<'a> {
    /// The message ID of the N-EVENT-REPORT-RQ being answered.
    pub message_id_being_responded_to: u16,
    /// SOP class UID of the SOP instance the event applied to.
    pub affected_sop_class_uid: Option<&'a str>,
    /// SOP instance UID the event applied to.
    pub affected_sop_instance_uid: Option<&'a str>,
    /// The type of event reported.
    pub event_type_id: Option<u16>,
    /// The outcome of the operation.
    pub status: u16,
}

impl Command for NEventReportRsp<'_> {
    fn command_field(&self) -> u16 {
        CommandField::NEventReportRsp as u16
    }

    fn command_set(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        put_us(
            &mut obj,
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            self.message_id_being_responded_to,
        );
        if let Some(uid) = self.affected_sop_class_uid {
            put_uid(&mut obj, tags::AFFECTED_SOP_CLASS_UID, uid);
        }
        if let Some(uid) = self.affected_sop_instance_uid {
            put_uid(&mut obj, tags::AFFECTED_SOP_INSTANCE_UID, uid);
        }
        if let Some(id) = self.event_type_id {
            put_us(&mut obj, tags::EVENT_TYPE_ID, id);
        }
        put_us(&mut obj, tags::STATUS, self.status);
        obj
    }
}

/// N-GET-RQ
#[derive(Debug, Builder)]
pub struct NGetRq<'a> {
    /// Implementation-specific value distinguishing
    /// this message from other messages.
    pub message_id: u16,
    /// SOP class UID of the SOP instance to read from.
    pub requested_sop_class_uid: &'a str,
    /// SOP instance UID to read from.
    pub requested_sop_instance_uid: &'a str,
    /// The attributes to retrieve; all when absent.
    pub attribute_identifier_list: Option<Vec<Tag>>,
}

impl Command for NGetRq<'_> {
    fn command_field(&self) -> u16 {
        CommandField::NGetRq as u16
    }

    fn command_set(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        put_us(&mut obj, tags::MESSAGE_ID, self.message_id);
        put_uid(
            &mut obj,
            tags::REQUESTED_SOP_CLASS_UID,
            self.requested_sop_class_uid,
        );
        put_uid(
            &mut obj,
            tags::REQUESTED_SOP_INSTANCE_UID,
            self.requested_sop_instance_uid,
        );
        if let Some(attributes) = &self.attribute_identifier_list {
            obj.put(DataElement::new(
                tags::ATTRIBUTE_IDENTIFIER_LIST,
                VR::AT,
                PrimitiveValue::Tags(attributes.iter().copied().collect()),
            ));
        }
        obj
    }
}

/// N-GET-RSP
#[derive(Debug, Builder)]
pub struct NGetRsp<'a> {
    /// The message ID of the N-GET-RQ being answered.
    pub message_id_being_responded_to: u16,
    /// SOP class UID of the SOP instance read from.
    pub affected_sop_class_uid: Option<&'a str>,
    /// SOP instance UID read from.
    pub affected_sop_instance_uid: Option<&'a str>,
    /// The outcome of the operation.
    pub status: u16,
}

impl Command for NGetRsp<'_> {
    fn command_field(&self) -> u16 {
        CommandField::NGetRsp as u16
    }

    fn command_set(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        put_us(
            &mut obj,
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            self.message_id_being_responded_to,
        );
        if let Some(uid) = self.affected_sop_class_uid {
            put_uid(&mut obj, tags::AFFECTED_SOP_CLASS_UID, uid);
        }
        if let Some(uid) = self.affected_sop_instance_uid {
            put_uid(&mut obj, tags::AFFECTED_SOP_INSTANCE_UID, uid);
        }
        put_us(&mut obj, tags::STATUS, self.status);
        obj
    }
}

/// N-SET-RQ
#[derive(Debug, Builder)]
pub struct NSetRq<'a> {
    /// Implementation-specific value distinguishing
    /// this message from other messages.
    pub message_id: u16,
    /// SOP class UID of the SOP instance to modify.
    pub requested_sop_class_uid: &'a str,
    /// SOP instance UID to modify.
    pub requested_sop_instance_uid: &'a str,
}

impl Command for NSetRq<'_> {
    fn command_field(&self) -> u16 {
        CommandField::NSetRq as u16
    }

    fn command_set(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        put_us(&mut obj, tags::MESSAGE_ID, self.message_id);
        put_uid(
            &mut obj,
            tags::REQUESTED_SOP_CLASS_UID,
            self.requested_sop_class_uid,
        );
        put_uid(
            &mut obj,
            tags::REQUESTED_SOP_INSTANCE_UID,
            self.requested_sop_instance_uid,
        );
        obj
    }
}

/// N-SET-RSP
#[derive(Debug, Builder)]
pub struct NSetRsp<'a> {
    /// The message ID of the N-SET-RQ being answered.
    pub message_id_being_responded_to: u16,
    /// SOP class UID of the modified SOP instance.
    pub affected_sop_class_uid: Option<&'a str>,
    /// SOP instance UID of the modified SOP instance.
    pub affected_sop_instance_uid: Option<&'a str>,
    /// The outcome of the operation.
    pub status: u16,
}

impl Command for NSetRsp<'_> {
    fn command_field(&self) -> u16 {
        CommandField::NSetRsp as u16
    }

    fn command_set(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        put_us(
            &mut obj,
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            self.message_id_being_responded_to,
        );
        if let Some(uid) = self.affected_sop_class_uid {
            put_uid(&mut obj, tags::AFFECTED_SOP_CLASS_UID, uid);
        }
        if let Some(uid) = self.affected_sop_instance_uid {
            put_uid(&mut obj, tags::AFFECTED_SOP_INSTANCE_UID, uid);
        }
        put_us(&mut obj, tags::STATUS, self.status);
        obj
    }
}

/// N-ACTION-RQ
#[derive(Debug, Builder)]
pub struct NActionRq<'a> {
    /// Implementation-specific value distinguishing
    /// this message from other messages.
    pub message_id: u16,
    /// SOP class UID of the SOP instance to act upon.
    pub requested_sop_class_uid: &'a str,
    /// SOP instance UID to act upon.
    pub requested_sop_instance_uid: &'a str,
    /// The action to perform.
    pub action_type_id: u16,
}

impl Command for NActionRq<'_> {
    fn command_field(&self) -> u16 {
        CommandField::NActionRq as u16
    }

    fn command_set(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        put_us(&mut obj, tags::MESSAGE_ID, self.message_id);
        put_uid(
            &mut obj,
            tags::REQUESTED_SOP_CLASS_UID,
            self.requested_sop_class_uid,
        );
        put_uid(
            &mut obj,
            tags::REQUESTED_SOP_INSTANCE_UID,
            self.requested_sop_instance_uid,
        );
        put_us(&mut obj, tags::ACTION_TYPE_ID, self.action_type_id);
        obj
    }
}

/// N-ACTION-RSP
#[derive(Debug, Builder)]
pub struct NActionRsp<'a> {
    /// The message ID of the N-ACTION-RQ being answered.
    pub message_id_being_responded_to: u16,
    /// SOP class UID of the SOP instance acted upon.
    pub affected_sop_class_uid: Option<&'a str>,
    /// SOP instance UID acted upon.
    pub affected_sop_instance_uid: Option<&'a str>,
    /// The action performed.
    pub action_type_id: Option<u16>,
    /// The outcome of the operation.
    pub status: u16,
}

impl Command for NActionRsp<'_> {
    fn command_field(&self) -> u16 {
        CommandField::NActionRsp as u16
    }

    fn command_set(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        put_us(
            &mut obj,
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            self.message_id_being_responded_to,
        );
        if let Some(uid) = self.affected_sop_class_uid {
            put_uid(&mut obj, tags::AFFECTED_SOP_CLASS_UID, uid);
        }
        if let Some(uid) = self.affected_sop_instance_uid {
            put_uid(&mut obj, tags::AFFECTED_SOP_INSTANCE_UID, uid);
        }
        if let Some(id) = self.action_type_id {
            put_us(&mut obj, tags::ACTION_TYPE_ID, id);
        }
        put_us(&mut obj, tags::STATUS, self.status);
        obj
    }
}

/// N-CREATE-RQ
#[derive(Debug, Builder)]
pub struct NCreateRq<'a> {
    /// Implementation-specific value distinguishing
    /// this message from other messages.
    pub message_id: u16,
    /// SOP class UID of the SOP instance to create.
    pub affected_sop_class_uid: &'a str,
    /// SOP instance UID to create;
    /// chosen by the performer when absent.
    pub affected_sop_instance_uid: Option<&'a str>,
}

impl Command for NCreateRq<'_> {
    fn command_field(&self) -> u16 {
        CommandField::NCreateRq as u16
    }

    fn command_set(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        put_us(&mut obj, tags::MESSAGE_ID, self.message_id);
        put_uid(&mut obj, tags::AFFECTED_SOP_CLASS_UID, self.affected_sop_class_uid);
        if let Some(uid) = self.affected_sop_instance_uid {
            put_uid(&mut obj, tags::AFFECTED_SOP_INSTANCE_UID, uid);
        }
        obj
    }
}

/// N-CREATE-RSP
#[derive(Debug, Builder)]
pub struct NCreateRsp<'a> {
    /// The message ID of the N-CREATE-RQ being answered.
    pub message_id_being_responded_to: u16,
    /// SOP class UID of the created SOP instance.
    pub affected_sop_class_uid: Option<&'a str>,
    /// SOP instance UID of the created SOP instance.
    pub affected_sop_instance_uid: Option<&'a str>,
    /// The outcome of the operation.
    pub status: u16,
}

impl Command for NCreateRsp<'_> {
    fn command_field(&self) -> u16 {
        CommandField::NCreateRsp as u16
    }

    fn command_set(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        put_us(
            &mut obj,
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            self.message_id_being_responded_to,
        );
        if let Some(uid) = self.affected_sop_class_uid {
            put_uid(&mut obj, tags::AFFECTED_SOP_CLASS_UID, uid);
        }
        if let Some(uid) = self.affected_sop_instance_uid {
            put_uid(&mut obj, tags::AFFECTED_SOP_INSTANCE_UID, uid);
        }
        put_us(&mut obj, tags::STATUS, self.status);
        obj
    }
}

/// N-DELETE-RQ
#[derive(Debug, Builder)]
pub struct NDeleteRq<'a> {
    /// Implementation-specific value distinguishing
    /// this message from other messages.
    pub message_id: u16,
    /// SOP class UID of the SOP instance to delete.
    pub requested_sop_class_uid: &'a str,
    /// SOP instance UID to delete.
    pub requested_sop_instance_uid: &'a str,
}

impl Command for NDeleteRq<'_> {
    fn command_field(&self) -> u16 {
        CommandField::NDeleteRq as u16
    }

    fn command_set(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        put_us(&mut obj, tags::MESSAGE_ID, self.message_id);
        put_uid(
            &mut obj,
            tags::REQUESTED_SOP_CLASS_UID,
            self.requested_sop_class_uid,
        );
        put_uid(
            &mut obj,
            tags::REQUESTED_SOP_INSTANCE_UID,
            self.requested_sop_instance_uid,
        );
        obj
    }
}

/// N-DELETE-RSP
#[derive(Debug, Builder)]
pub struct NDeleteRsp<'a> {
    /// The message ID of the N-DELETE-RQ being answered.
    pub message_id_being_responded_to: u16,
    /// SOP class UID of the deleted SOP instance.
    pub affected_sop_class_uid: Option<&'a str>,
    /// SOP instance UID of the deleted SOP instance.
    pub affected_sop_instance_uid: Option<&'a str>,
    /// The outcome of the operation.
    pub status: u16,
}

impl Command for NDeleteRsp<'_> {
    fn command_field(&self) -> u16 {
        CommandField::NDeleteRsp as u16
    }

    fn command_set(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        put_us(
            &mut obj,
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            self.message_id_being_responded_to,
        );
        if let Some(uid) = self.affected_sop_class_uid {
            put_uid(&mut obj, tags::AFFECTED_SOP_CLASS_UID, uid);
        }
        if let Some(uid) = self.affected_sop_instance_uid {
            put_uid(&mut obj, tags::AFFECTED_SOP_INSTANCE_UID, uid);
        }
        put_us(&mut obj, tags::STATUS, self.status);
        obj
    }
}
