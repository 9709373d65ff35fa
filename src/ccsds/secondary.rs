use serde::{Deserialize, Serialize};

use super::header::{CMD_SECONDARY_HEADER_SIZE, TLM_SECONDARY_HEADER_SIZE};
use crate::error::TypeError;

/// Secondary header of a command packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommandSecondaryHeader {
    pub function_code: u8,
    pub checksum: u8,
}

impl CommandSecondaryHeader {
    pub fn encode(&self) -> [u8; CMD_SECONDARY_HEADER_SIZE] {
        [self.function_code, self.checksum]
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        match bytes {
            [function_code, checksum, ..] => Some(Self {
                function_code: *function_code,
                checksum: *checksum,
            }),
            _ => None,
        }
    }

    pub fn field(&self, name: &str) -> Option<u64> {
        match name {
            "function_code" => Some(u64::from(self.function_code)),
            "checksum" => Some(u64::from(self.checksum)),
            _ => None,
        }
    }

    pub fn set_field(&mut self, name: &str, value: u64) -> Result<(), TypeError> {
        match name {
            "function_code" => self.function_code = value as u8,
            "checksum" => self.checksum = value as u8,
            _ => {
                return Err(TypeError::NoSuchField {
                    field: name.to_string(),
                    type_name: "sheader".to_string(),
                })
            }
        }
        Ok(())
    }
}

/// Secondary header of a telemetry packet: a seconds/subseconds timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TelemetrySecondaryHeader {
    pub seconds: u32,
    pub subseconds: u16,
}

impl TelemetrySecondaryHeader {
    pub fn encode(&self) -> [u8; TLM_SECONDARY_HEADER_SIZE] {
        let mut bytes = [0u8; TLM_SECONDARY_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.seconds.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.subseconds.to_be_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < TLM_SECONDARY_HEADER_SIZE {
            return None;
        }
        Some(Self {
            seconds: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            subseconds: u16::from_be_bytes([bytes[4], bytes[5]]),
        })
    }

    /// Timestamp in seconds; subseconds count 1/65536 s.
    pub fn as_seconds(&self) -> f64 {
        f64::from(self.seconds) + f64::from(self.subseconds) / 65536.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_secondary_header_bytes() {
        let header = CommandSecondaryHeader {
            function_code: 3,
            checksum: 0xAA,
        };
        assert_eq!(header.encode(), [0x03, 0xAA]);
        assert_eq!(CommandSecondaryHeader::decode(&[0x03, 0xAA]), Some(header));
        assert!(CommandSecondaryHeader::decode(&[0x03]).is_none());
    }

    #[test]
    fn test_telemetry_secondary_header_bytes() {
        let header = TelemetrySecondaryHeader {
            seconds: 0x0102_0304,
            subseconds: 0x8000,
        };
        assert_eq!(header.encode(), [0x01, 0x02, 0x03, 0x04, 0x80, 0x00]);
        assert_eq!(TelemetrySecondaryHeader::decode(&header.encode()), Some(header));
        assert!((header.as_seconds() - (16_909_060.0 + 0.5)).abs() < f64::EPSILON);
    }
}
