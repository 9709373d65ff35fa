//! CCSDS space packet headers as used on the flight software bus.
//!
//! Two header generations are supported. V1 packs the message ID into the primary
//! header; V2 adds an extended header carrying the subsystem and system IDs.

pub mod header;
pub mod secondary;

pub use header::{
    peek_msg_id, CcsdsVersion, CommandHeader, ExtendedHeader, PrimaryHeader, TelemetryHeader,
    APP_ID_MASK, CMD_MESSAGE_TYPE, PRIMARY_HEADER_SIZE,
};
pub use secondary::{CommandSecondaryHeader, TelemetrySecondaryHeader};

use serde::{Deserialize, Serialize};

/// Decoded header of a received packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketHeader {
    Command(CommandHeader),
    Telemetry(TelemetryHeader),
}

impl PacketHeader {
    pub fn msg_id(&self) -> u16 {
        match self {
            PacketHeader::Command(header) => header.msg_id(),
            PacketHeader::Telemetry(header) => header.msg_id(),
        }
    }

    pub fn size(&self) -> usize {
        match self {
            PacketHeader::Command(header) => header.size(),
            PacketHeader::Telemetry(header) => header.size(),
        }
    }

    pub fn primary(&self) -> &PrimaryHeader {
        match self {
            PacketHeader::Command(header) => &header.pheader,
            PacketHeader::Telemetry(header) => &header.pheader,
        }
    }
}
