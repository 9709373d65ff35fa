use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;

use super::secondary::{CommandSecondaryHeader, TelemetrySecondaryHeader};
use crate::error::TypeError;

pub const PRIMARY_HEADER_SIZE: usize = 6;
pub const EXTENDED_HEADER_SIZE: usize = 4;
pub const CMD_SECONDARY_HEADER_SIZE: usize = 2;
pub const TLM_SECONDARY_HEADER_SIZE: usize = 6;
/// Padding after the V2 command secondary header.
pub const V2_COMMAND_SPARE_SIZE: usize = 4;

pub const APP_ID_MASK: u16 = 0x07FF;
pub const SEQUENCE_COUNT_MASK: u16 = 0x3FFF;
pub const CMD_MESSAGE_TYPE: u16 = 0x0080;

const_assert_eq!(PRIMARY_HEADER_SIZE + CMD_SECONDARY_HEADER_SIZE, 8);
const_assert_eq!(
    PRIMARY_HEADER_SIZE + EXTENDED_HEADER_SIZE + CMD_SECONDARY_HEADER_SIZE + V2_COMMAND_SPARE_SIZE,
    16
);
const_assert_eq!(PRIMARY_HEADER_SIZE + EXTENDED_HEADER_SIZE + TLM_SECONDARY_HEADER_SIZE, 16);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CcsdsVersion {
    #[default]
    V1,
    V2,
}

impl CcsdsVersion {
    pub fn from_number(number: u8) -> Option<Self> {
        match number {
            1 => Some(CcsdsVersion::V1),
            2 => Some(CcsdsVersion::V2),
            _ => None,
        }
    }

    /// Total bytes preceding the payload of a command packet.
    pub fn command_header_size(self) -> usize {
        match self {
            CcsdsVersion::V1 => PRIMARY_HEADER_SIZE + CMD_SECONDARY_HEADER_SIZE,
            CcsdsVersion::V2 => {
                PRIMARY_HEADER_SIZE
                    + EXTENDED_HEADER_SIZE
                    + CMD_SECONDARY_HEADER_SIZE
                    + V2_COMMAND_SPARE_SIZE
            }
        }
    }

    /// Total bytes preceding the payload of a telemetry packet.
    pub fn telemetry_header_size(self) -> usize {
        match self {
            CcsdsVersion::V1 => PRIMARY_HEADER_SIZE + TLM_SECONDARY_HEADER_SIZE,
            CcsdsVersion::V2 => {
                PRIMARY_HEADER_SIZE + EXTENDED_HEADER_SIZE + TLM_SECONDARY_HEADER_SIZE
            }
        }
    }
}

/// CCSDS primary header, always big-endian on the wire.
///
/// ```text
/// | version:3 | type:1 | sec_hdr:1 | app_id:11 | seg_flags:2 | seq_count:14 | length:16 |
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PrimaryHeader {
    pub version_number: u8,
    pub packet_type: u8,
    pub secondary_header_flag: u8,
    pub app_id: u16,
    pub segmentation_flags: u8,
    pub sequence_count: u16,
    pub length: u16,
}

impl PrimaryHeader {
    pub fn set_version_number(&mut self, version: u16) {
        self.version_number = (version & 0x7) as u8;
    }

    pub fn set_packet_type(&mut self, packet_type: u16) {
        self.packet_type = (packet_type & 0x1) as u8;
    }

    pub fn set_secondary_header_flag(&mut self, flag: u16) {
        self.secondary_header_flag = (flag & 0x1) as u8;
    }

    pub fn set_app_id(&mut self, app_id: u16) {
        self.app_id = app_id & APP_ID_MASK;
    }

    pub fn set_segmentation_flags(&mut self, flags: u16) {
        self.segmentation_flags = (flags & 0x3) as u8;
    }

    pub fn set_sequence_count(&mut self, count: u16) {
        self.sequence_count = count & SEQUENCE_COUNT_MASK;
    }

    pub fn set_length(&mut self, length: u16) {
        self.length = length;
    }

    pub fn is_command(&self) -> bool {
        self.packet_type == 1
    }

    pub fn encode(&self) -> [u8; PRIMARY_HEADER_SIZE] {
        let word0 = (u16::from(self.version_number) << 13)
            | (u16::from(self.packet_type) << 12)
            | (u16::from(self.secondary_header_flag) << 11)
            | (self.app_id & APP_ID_MASK);
        let word1 = (u16::from(self.segmentation_flags) << 14)
            | (self.sequence_count & SEQUENCE_COUNT_MASK);

        let mut bytes = [0u8; PRIMARY_HEADER_SIZE];
        bytes[0..2].copy_from_slice(&word0.to_be_bytes());
        bytes[2..4].copy_from_slice(&word1.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.length.to_be_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < PRIMARY_HEADER_SIZE {
            return None;
        }
        let word0 = u16::from_be_bytes([bytes[0], bytes[1]]);
        let word1 = u16::from_be_bytes([bytes[2], bytes[3]]);
        let length = u16::from_be_bytes([bytes[4], bytes[5]]);

        Some(Self {
            version_number: (word0 >> 13) as u8 & 0x7,
            packet_type: (word0 >> 12) as u8 & 0x1,
            secondary_header_flag: (word0 >> 11) as u8 & 0x1,
            app_id: word0 & APP_ID_MASK,
            segmentation_flags: (word1 >> 14) as u8 & 0x3,
            sequence_count: word1 & SEQUENCE_COUNT_MASK,
            length,
        })
    }

    /// V1 message ID: the header's first 16 bits reassembled.
    pub fn msg_id_v1(&self) -> u16 {
        (u16::from(self.version_number) << 15)
            .wrapping_add(u16::from(self.packet_type) << 12)
            .wrapping_add(u16::from(self.secondary_header_flag) << 11)
            .wrapping_add(self.app_id)
    }

    pub fn field(&self, name: &str) -> Option<u64> {
        let value = match name {
            "version_number" => u64::from(self.version_number),
            "type" | "packet_type" => u64::from(self.packet_type),
            "secondary_header_flag" => u64::from(self.secondary_header_flag),
            "app_id" => u64::from(self.app_id),
            "segmentation_flags" => u64::from(self.segmentation_flags),
            "sequence_count" => u64::from(self.sequence_count),
            "length" => u64::from(self.length),
            _ => return None,
        };
        Some(value)
    }

    pub fn set_field(&mut self, name: &str, value: u64) -> Result<(), TypeError> {
        let value = value as u16;
        match name {
            "version_number" => self.set_version_number(value),
            "type" | "packet_type" => self.set_packet_type(value),
            "secondary_header_flag" => self.set_secondary_header_flag(value),
            "app_id" => self.set_app_id(value),
            "segmentation_flags" => self.set_segmentation_flags(value),
            "sequence_count" => self.set_sequence_count(value),
            "length" => self.set_length(value),
            _ => {
                return Err(TypeError::NoSuchField {
                    field: name.to_string(),
                    type_name: "pheader".to_string(),
                })
            }
        }
        Ok(())
    }
}

/// CCSDS V2 extended header, big-endian.
///
/// ```text
/// | eds_version:5 | endian:1 | playback:1 | subsystem_id:9 | system_id:16 |
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExtendedHeader {
    pub eds_version: u8,
    pub endian: u8,
    pub playback_flag: u8,
    pub subsystem_id: u16,
    pub system_id: u16,
}

impl ExtendedHeader {
    pub fn encode(&self) -> [u8; EXTENDED_HEADER_SIZE] {
        let word0 = (u16::from(self.eds_version & 0x1F) << 11)
            | (u16::from(self.endian & 0x1) << 10)
            | (u16::from(self.playback_flag & 0x1) << 9)
            | (self.subsystem_id & 0x1FF);
        let mut bytes = [0u8; EXTENDED_HEADER_SIZE];
        bytes[0..2].copy_from_slice(&word0.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.system_id.to_be_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < EXTENDED_HEADER_SIZE {
            return None;
        }
        let word0 = u16::from_be_bytes([bytes[0], bytes[1]]);
        Some(Self {
            eds_version: (word0 >> 11) as u8 & 0x1F,
            endian: (word0 >> 10) as u8 & 0x1,
            playback_flag: (word0 >> 9) as u8 & 0x1,
            subsystem_id: word0 & 0x1FF,
            system_id: u16::from_be_bytes([bytes[2], bytes[3]]),
        })
    }

    pub fn field(&self, name: &str) -> Option<u64> {
        let value = match name {
            "eds_version" => u64::from(self.eds_version),
            "endian" => u64::from(self.endian),
            "playback_flag" => u64::from(self.playback_flag),
            "subsystem_id" => u64::from(self.subsystem_id),
            "system_id" => u64::from(self.system_id),
            _ => return None,
        };
        Some(value)
    }

    pub fn set_field(&mut self, name: &str, value: u64) -> Result<(), TypeError> {
        match name {
            "eds_version" => self.eds_version = (value & 0x1F) as u8,
            "endian" => self.endian = (value & 0x1) as u8,
            "playback_flag" => self.playback_flag = (value & 0x1) as u8,
            "subsystem_id" => self.subsystem_id = (value & 0x1FF) as u16,
            "system_id" => self.system_id = value as u16,
            _ => {
                return Err(TypeError::NoSuchField {
                    field: name.to_string(),
                    type_name: "eheader".to_string(),
                })
            }
        }
        Ok(())
    }
}

fn set_msg_id_fields(
    version: CcsdsVersion,
    msg_id: u16,
    pheader: &mut PrimaryHeader,
    eheader: &mut Option<ExtendedHeader>,
) {
    pheader.set_packet_type((msg_id & CMD_MESSAGE_TYPE) >> 7);
    pheader.set_app_id(msg_id & APP_ID_MASK);
    match version {
        CcsdsVersion::V1 => pheader.set_version_number(0),
        CcsdsVersion::V2 => {
            pheader.set_version_number(1);
            let ext = eheader.get_or_insert_with(ExtendedHeader::default);
            ext.eds_version = 0;
            ext.playback_flag = 0;
            ext.subsystem_id = (msg_id & 0xFF00) >> 8;
            ext.system_id = 0;
        }
    }
}

fn msg_id_of(version: CcsdsVersion, pheader: &PrimaryHeader, eheader: Option<&ExtendedHeader>) -> u16 {
    match version {
        CcsdsVersion::V1 => pheader.msg_id_v1(),
        CcsdsVersion::V2 => {
            let mut msg_id = pheader.app_id;
            if pheader.is_command() {
                msg_id |= CMD_MESSAGE_TYPE;
            }
            if let Some(ext) = eheader {
                msg_id |= ext.subsystem_id << 8;
            }
            msg_id
        }
    }
}

/// Complete header of a command packet: primary, optional extended, secondary (and the V2 spare).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandHeader {
    pub version: CcsdsVersion,
    pub pheader: PrimaryHeader,
    pub eheader: Option<ExtendedHeader>,
    pub sheader: CommandSecondaryHeader,
}

impl CommandHeader {
    /// Header for a complete, unsegmented command carrying `payload_len` bytes.
    pub fn new(
        version: CcsdsVersion,
        msg_id: u16,
        function_code: u8,
        payload_len: usize,
        big_endian_target: bool,
    ) -> Self {
        let mut header = Self {
            version,
            pheader: PrimaryHeader::default(),
            eheader: None,
            sheader: CommandSecondaryHeader::default(),
        };
        header.set_msg_id(msg_id);
        header.pheader.set_segmentation_flags(3);
        header.pheader.set_secondary_header_flag(1);
        header.pheader.set_sequence_count(0);
        header.set_payload_len(payload_len);

        if let Some(ext) = header.eheader.as_mut() {
            ext.endian = u8::from(big_endian_target);
        }

        header.sheader.function_code = function_code;
        header.sheader.checksum = function_code;
        header
    }

    pub fn size(&self) -> usize {
        self.version.command_header_size()
    }

    /// Packet length field: total length minus 7.
    pub fn set_payload_len(&mut self, payload_len: usize) {
        let total = payload_len + self.size();
        self.pheader.set_length(total.saturating_sub(7) as u16);
    }

    pub fn set_msg_id(&mut self, msg_id: u16) {
        set_msg_id_fields(self.version, msg_id, &mut self.pheader, &mut self.eheader);
    }

    pub fn msg_id(&self) -> u16 {
        msg_id_of(self.version, &self.pheader, self.eheader.as_ref())
    }

    pub fn function_code(&self) -> u8 {
        self.sheader.function_code
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.size());
        bytes.extend_from_slice(&self.pheader.encode());
        if self.version == CcsdsVersion::V2 {
            bytes.extend_from_slice(&self.eheader.unwrap_or_default().encode());
        }
        bytes.extend_from_slice(&self.sheader.encode());
        if self.version == CcsdsVersion::V2 {
            bytes.extend_from_slice(&[0u8; V2_COMMAND_SPARE_SIZE]);
        }
        bytes
    }

    pub fn decode(version: CcsdsVersion, bytes: &[u8]) -> Option<Self> {
        if bytes.len() < version.command_header_size() {
            return None;
        }
        let pheader = PrimaryHeader::decode(bytes)?;
        let (eheader, offset) = match version {
            CcsdsVersion::V1 => (None, PRIMARY_HEADER_SIZE),
            CcsdsVersion::V2 => (
                Some(ExtendedHeader::decode(&bytes[PRIMARY_HEADER_SIZE..])?),
                PRIMARY_HEADER_SIZE + EXTENDED_HEADER_SIZE,
            ),
        };
        let sheader = CommandSecondaryHeader::decode(&bytes[offset..])?;
        Some(Self {
            version,
            pheader,
            eheader,
            sheader,
        })
    }

    /// Read a header field by dotted path, e.g. `pheader.sequence_count`.
    pub fn field(&self, path: &str) -> Option<u64> {
        let (section, name) = path.split_once('.')?;
        match section {
            "pheader" => self.pheader.field(name),
            "eheader" => self.eheader.as_ref().and_then(|ext| ext.field(name)),
            "sheader" => self.sheader.field(name),
            _ => None,
        }
    }

    /// Overwrite a header field by dotted path. Values are truncated to the field width.
    pub fn set_field(&mut self, path: &str, value: u64) -> Result<(), TypeError> {
        let (section, name) = path
            .split_once('.')
            .ok_or_else(|| TypeError::InvalidPath(path.to_string()))?;
        match section {
            "pheader" => self.pheader.set_field(name, value),
            "eheader" => match self.eheader.as_mut() {
                Some(ext) => ext.set_field(name, value),
                None => Err(TypeError::NoSuchField {
                    field: path.to_string(),
                    type_name: "CommandHeader".to_string(),
                }),
            },
            "sheader" => self.sheader.set_field(name, value),
            _ => Err(TypeError::InvalidPath(path.to_string())),
        }
    }
}

/// Complete header of a telemetry packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryHeader {
    pub version: CcsdsVersion,
    pub pheader: PrimaryHeader,
    pub eheader: Option<ExtendedHeader>,
    pub sheader: TelemetrySecondaryHeader,
}

impl TelemetryHeader {
    pub fn new(version: CcsdsVersion, msg_id: u16, payload_len: usize) -> Self {
        let mut header = Self {
            version,
            pheader: PrimaryHeader::default(),
            eheader: None,
            sheader: TelemetrySecondaryHeader::default(),
        };
        set_msg_id_fields(version, msg_id, &mut header.pheader, &mut header.eheader);
        header.pheader.set_segmentation_flags(3);
        header.pheader.set_secondary_header_flag(1);
        let total = payload_len + header.size();
        header.pheader.set_length(total.saturating_sub(7) as u16);
        header
    }

    pub fn size(&self) -> usize {
        self.version.telemetry_header_size()
    }

    pub fn msg_id(&self) -> u16 {
        msg_id_of(self.version, &self.pheader, self.eheader.as_ref())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.size());
        bytes.extend_from_slice(&self.pheader.encode());
        if self.version == CcsdsVersion::V2 {
            bytes.extend_from_slice(&self.eheader.unwrap_or_default().encode());
        }
        bytes.extend_from_slice(&self.sheader.encode());
        bytes
    }

    pub fn decode(version: CcsdsVersion, bytes: &[u8]) -> Option<Self> {
        if bytes.len() < version.telemetry_header_size() {
            return None;
        }
        let pheader = PrimaryHeader::decode(bytes)?;
        let (eheader, offset) = match version {
            CcsdsVersion::V1 => (None, PRIMARY_HEADER_SIZE),
            CcsdsVersion::V2 => (
                Some(ExtendedHeader::decode(&bytes[PRIMARY_HEADER_SIZE..])?),
                PRIMARY_HEADER_SIZE + EXTENDED_HEADER_SIZE,
            ),
        };
        let sheader = TelemetrySecondaryHeader::decode(&bytes[offset..])?;
        Some(Self {
            version,
            pheader,
            eheader,
            sheader,
        })
    }
}

/// Message ID of a raw datagram, read from the primary (and, for V2, extended) header only.
pub fn peek_msg_id(version: CcsdsVersion, bytes: &[u8]) -> Option<(PrimaryHeader, u16)> {
    let pheader = PrimaryHeader::decode(bytes)?;
    let eheader = match version {
        CcsdsVersion::V1 => None,
        CcsdsVersion::V2 => ExtendedHeader::decode(bytes.get(PRIMARY_HEADER_SIZE..)?),
    };
    let msg_id = msg_id_of(version, &pheader, eheader.as_ref());
    Some((pheader, msg_id))
}
