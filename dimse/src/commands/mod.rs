//! Command sets: the dictionary of command set elements,
//! the command field codes
//! and the encoding of command sets on the wire.
//!
//! Command sets are always encoded in Implicit VR Little Endian,
//! regardless of the transfer syntax accepted
//! for the presentation context carrying them,
//! and open with the mandatory command group length element.

use dicom_core::{dicom_value, DataElement, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::{InMemDicomObject, WriteError};
use dicom_transfer_syntax_registry::entries;

pub mod builders;

pub use builders::*;

/// The priority of a DIMSE-C request.
#[repr(u16)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Priority {
    Low = 0x0002,
    Medium = 0x0000,
    High = 0x0001,
}

/// The value of the command data set type element (0000,0800)
/// declaring whether a data set follows the command set.
#[repr(u16)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum CommandDataSetType {
    /// a data set is present in the message
    Present = 0x0001,
    /// no data set is present in the message
    Absent = 0x0101,
}

/// The command field codes (element (0000,0100)) of the DIMSE services.
#[repr(u16)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum CommandField {
    CStoreRq = 0x0001,
    CStoreRsp = 0x8001,
    CGetRq = 0x0010,
    CGetRsp = 0x8010,
    CFindRq = 0x0020,
    CFindRsp = 0x8020,
    CMoveRq = 0x0021,
    CMoveRsp = 0x8021,
    CEchoRq = 0x0030,
    CEchoRsp = 0x8030,
    NEventReportRq = 0x0100,
    NEventReportRsp = 0x8100,
    NGetRq = 0x0110,
    NGetRsp = 0x8110,
    NSetRq = 0x0120,
    NSetRsp = 0x8120,
    NActionRq = 0x0130,
    NActionRsp = 0x8130,
    NCreateRq = 0x0140,
    NCreateRsp = 0x8140,
    NDeleteRq = 0x0150,
    NDeleteRsp = 0x8150,
    CCancelRq = 0x0FFF,
}

impl CommandField {
    /// Interpret a command field code.
    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            0x0001 => CommandField::CStoreRq,
            0x8001 => CommandField::CStoreRsp,
            0x0010 => CommandField::CGetRq,
            0x8010 => CommandField::CGetRsp,
            0x0020 => CommandField::CFindRq,
            0x8020 => CommandField::CFindRsp,
            0x0021 => CommandField::CMoveRq,
            0x8021 => CommandField::CMoveRsp,
            0x0030 => CommandField::CEchoRq,
            0x8030 => CommandField::CEchoRsp,
            0x0100 => CommandField::NEventReportRq,
            0x8100 => CommandField::NEventReportRsp,
            0x0110 => CommandField::NGetRq,
            0x8110 => CommandField::NGetRsp,
            0x0120 => CommandField::NSetRq,
            0x8120 => CommandField::NSetRsp,
            0x0130 => CommandField::NActionRq,
            0x8130 => CommandField::NActionRsp,
            0x0140 => CommandField::NCreateRq,
            0x8140 => CommandField::NCreateRsp,
            0x0150 => CommandField::NDeleteRq,
            0x8150 => CommandField::NDeleteRsp,
            0x0FFF => CommandField::CCancelRq,
            _ => return None,
        })
    }

    /// Whether this code identifies a response message.
    pub fn is_response(self) -> bool {
        (self as u16) & 0x8000 != 0
    }

    /// The response counterpart of a request code
    /// (responses and C-CANCEL map to themselves).
    pub fn response(self) -> Self {
        CommandField::from_code(self as u16 | 0x8000).unwrap_or(self)
    }
}

impl TryFrom<u16> for CommandField {
    type Error = u16;

    fn try_from(code: u16) -> Result<Self, u16> {
        CommandField::from_code(code).ok_or(code)
    }
}

/// A typed DIMSE message command,
/// able to render itself as a command set.
pub trait Command: Sync {
    /// Get the command field code for this command.
    fn command_field(&self) -> u16;

    /// Get the command set elements of this command,
    /// without the group length and data set type elements.
    fn command_set(&self) -> InMemDicomObject;

    /// Encode the command set into bytes,
    /// always in Implicit VR Little Endian,
    /// prefixed by the command group length element
    /// and carrying the data set type marker.
    fn encode(&self, dataset_included: bool) -> Result<Vec<u8>, Box<WriteError>> {
        let mut obj = self.command_set();
        obj.put(DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [self.command_field()]),
        ));
        obj.put(DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(
                U16,
                [if dataset_included {
                    CommandDataSetType::Present as u16
                } else {
                    CommandDataSetType::Absent as u16
                }]
            ),
        ));
        encode_command_set(&obj)
    }
}

/// Encode a fully assembled command set in Implicit VR Little Endian,
/// prepending the mandatory command group length element (0000,0000).
pub fn encode_command_set(obj: &InMemDicomObject) -> Result<Vec<u8>, Box<WriteError>> {
    let mut elements = Vec::new();
    obj.write_dataset_with_ts(&mut elements, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .map_err(Box::from)?;

    // (0000,0000) UL, 4 bytes, in implicit VR little endian
    let mut buffer = Vec::with_capacity(12 + elements.len());
    buffer.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
    buffer.extend_from_slice(&4_u32.to_le_bytes());
    buffer.extend_from_slice(&(elements.len() as u32).to_le_bytes());
    buffer.extend_from_slice(&elements);
    Ok(buffer)
}

/// Decode a command set from its Implicit VR Little Endian bytes.
pub fn decode_command_set(
    bytes: &[u8],
) -> Result<InMemDicomObject, Box<dicom_object::ReadError>> {
    InMemDicomObject::read_dataset_with_ts(bytes, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .map_err(Box::from)
}

/// The tag of the command group length element.
pub const COMMAND_GROUP_LENGTH: Tag = Tag(0x0000, 0x0000);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_field_codes() {
        assert_eq!(CommandField::CEchoRq as u16, 0x0030);
        assert_eq!(CommandField::CEchoRq.response(), CommandField::CEchoRsp);
        assert_eq!(CommandField::CEchoRsp as u16, 0x8030);
        assert!(CommandField::CEchoRsp.is_response());
        assert!(!CommandField::CCancelRq.is_response());
        assert_eq!(CommandField::from_code(0xABCD), None);
    }

    #[test]
    fn encoded_command_set_opens_with_group_length() {
        let cmd = CEchoRq::builder()
            .message_id(1)
            .affected_sop_class_uid("1.2.840.10008.1.1")
            .build();
        let bytes = cmd.encode(false).unwrap();

        // tag (0000,0000), length 4
        assert_eq!(&bytes[0..4], &[0x00, 0x00, 0x00, 0x00]);
        assert_eq!(&bytes[4..8], &4_u32.to_le_bytes());
        let group_length = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        assert_eq!(group_length as usize, bytes.len() - 12);

        let obj = decode_command_set(&bytes[12..]).unwrap();
        assert_eq!(
            obj.element(dicom_dictionary_std::tags::COMMAND_FIELD)
                .unwrap()
                .to_int::<u16>()
                .unwrap(),
            0x0030
        );
        assert_eq!(
            obj.element(dicom_dictionary_std::tags::COMMAND_DATA_SET_TYPE)
                .unwrap()
                .to_int::<u16>()
                .unwrap(),
            0x0101
        );
    }
}
