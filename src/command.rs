use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::ccsds::{CcsdsVersion, CommandHeader, TelemetryHeader};
use crate::error::ControllerError;

const CRC32C: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISCSI);

/// Size of the trailing CRC slot when `command_crc` is enabled.
pub const CRC_SIZE: usize = 4;

/// A resolved header override, e.g. `pheader.sequence_count = 7`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderOverride {
    pub path: String,
    pub value: u64,
}

impl HeaderOverride {
    pub fn new(path: impl Into<String>, value: u64) -> Self {
        Self {
            path: path.into(),
            value,
        }
    }
}

/// UDP sender for command packets addressed to one target.
#[derive(Debug)]
pub struct CommandChannel {
    socket: Option<UdpSocket>,
    destination: SocketAddr,
    version: CcsdsVersion,
    big_endian: bool,
    crc: bool,
}

impl CommandChannel {
    pub async fn connect(
        destination: SocketAddr,
        version: CcsdsVersion,
        big_endian: bool,
        crc: bool,
    ) -> Result<Self, ControllerError> {
        let socket = Self::open_socket(destination).await?;
        Ok(Self {
            socket: Some(socket),
            destination,
            version,
            big_endian,
            crc,
        })
    }

    async fn open_socket(destination: SocketAddr) -> std::io::Result<UdpSocket> {
        let bind: SocketAddr = if destination.is_ipv6() {
            SocketAddr::from(([0u16; 8], 0))
        } else {
            SocketAddr::from(([0u8; 4], 0))
        };
        UdpSocket::bind(bind).await
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    pub fn version(&self) -> CcsdsVersion {
        self.version
    }

    /// Assemble header and payload into one datagram without sending it.
    pub fn build_packet(
        &self,
        msg_id: u16,
        function_code: u8,
        payload: &[u8],
        overrides: &[HeaderOverride],
    ) -> Result<Vec<u8>, ControllerError> {
        let mut header = CommandHeader::new(
            self.version,
            msg_id,
            function_code,
            payload.len(),
            self.big_endian,
        );
        for over in overrides {
            header.set_field(&over.path, over.value)?;
        }

        let mut packet = header.encode();
        packet.extend_from_slice(payload);

        if self.crc && payload.len() >= CRC_SIZE {
            let split = packet.len() - CRC_SIZE;
            if packet[split..].iter().all(|b| *b == 0) {
                let crc = CRC32C.checksum(&packet[..split]);
                let bytes = if self.big_endian {
                    crc.to_be_bytes()
                } else {
                    crc.to_le_bytes()
                };
                packet[split..].copy_from_slice(&bytes);
            }
        }
        Ok(packet)
    }

    /// Send one command. A failed send reopens the socket and retries once.
    pub async fn send_command(
        &mut self,
        msg_id: u16,
        function_code: u8,
        payload: &[u8],
        overrides: &[HeaderOverride],
    ) -> Result<usize, ControllerError> {
        let packet = self.build_packet(msg_id, function_code, payload, overrides)?;
        debug!(
            "Sending command MID {:#06x} CC {} to {}: {}",
            msg_id,
            function_code,
            self.destination,
            hex::encode(&packet)
        );
        self.send(&packet).await
    }

    /// Send a telemetry packet, e.g. to inject data through a bridge app.
    pub async fn send_telemetry(&mut self, msg_id: u16, payload: &[u8]) -> Result<usize, ControllerError> {
        let mut packet = TelemetryHeader::new(self.version, msg_id, payload.len()).encode();
        packet.extend_from_slice(payload);
        self.send(&packet).await
    }

    async fn send(&mut self, packet: &[u8]) -> Result<usize, ControllerError> {
        match self.try_send(packet).await {
            Ok(sent) => Ok(sent),
            Err(first) => {
                warn!("Command socket error ({}), reconnecting", first);
                self.socket = None;
                self.try_send(packet)
                    .await
                    .map_err(|e| ControllerError::Send(e.to_string()))
            }
        }
    }

    async fn try_send(&mut self, packet: &[u8]) -> std::io::Result<usize> {
        if self.socket.is_none() {
            self.socket = Some(Self::open_socket(self.destination).await?);
        }
        let Some(socket) = self.socket.as_ref() else {
            return Err(std::io::Error::from(std::io::ErrorKind::NotConnected));
        };
        let sent = socket.send_to(packet, self.destination).await?;
        if sent != packet.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                format!("sent {} of {} bytes", sent, packet.len()),
            ));
        }
        Ok(sent)
    }

    /// Drop the socket. The next send opens a new one.
    pub fn close(&mut self) {
        self.socket = None;
    }
}
