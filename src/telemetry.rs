//! Telemetry reception: non-blocking UDP drain, packet decoding and per-MID history.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::File;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::ccsds::{peek_msg_id, CcsdsVersion, CommandHeader, PacketHeader, TelemetryHeader, PRIMARY_HEADER_SIZE};
use crate::dictionary::Dictionary;
use crate::error::ControllerError;
use crate::types::{display_value, Payload};

/// Largest datagram read from the socket.
pub const CCSDS_MAX_SIZE: usize = 65535;

/// One received message, stamped with the execution time at reception.
#[derive(Debug, Clone)]
pub struct Packet {
    pub mid: u16,
    pub header: PacketHeader,
    /// `None` when the bytes could not be decoded as the MID's payload type.
    pub payload: Option<Payload>,
    /// Position of this packet among all packets received for the MID, starting at 1.
    pub count: usize,
    pub timestamp: f64,
}

impl Packet {
    pub fn function_code(&self) -> Option<u8> {
        match &self.header {
            PacketHeader::Command(header) => Some(header.function_code()),
            PacketHeader::Telemetry(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TelemetryOptions {
    pub version: CcsdsVersion,
    /// Payload definitions exclude the CCSDS header, so decoding starts after it.
    pub skip_header: bool,
    pub evs_mids: Vec<u16>,
    pub target_name: String,
    pub tlm_log_file: String,
    pub evs_log_file: String,
}

impl Default for TelemetryOptions {
    fn default() -> Self {
        Self {
            version: CcsdsVersion::V1,
            skip_header: true,
            evs_mids: Vec::new(),
            target_name: "cfs".to_string(),
            tlm_log_file: "tlm_msgs.log".to_string(),
            evs_log_file: "evs_msgs.log".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct TelemetryChannel {
    socket: UdpSocket,
    local_addr: SocketAddr,
    options: TelemetryOptions,
    history: HashMap<u16, Vec<Packet>>,
    counts: HashMap<u16, usize>,
    received_mids: HashSet<u16>,
    unchecked: BTreeSet<u16>,
    log_dir: Option<PathBuf>,
    tlm_log: Option<File>,
    evs_log: Option<File>,
    received_any: bool,
}

impl TelemetryChannel {
    /// Bind the telemetry socket. Port 0 picks a free port; see [`TelemetryChannel::port`].
    pub async fn bind(addr: SocketAddr, options: TelemetryOptions) -> Result<Self, ControllerError> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        debug!("Listening for telemetry on {}", local_addr);
        Ok(Self {
            socket,
            local_addr,
            options,
            history: HashMap::new(),
            counts: HashMap::new(),
            received_mids: HashSet::new(),
            unchecked: BTreeSet::new(),
            log_dir: None,
            tlm_log: None,
            evs_log: None,
            received_any: false,
        })
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// True once any packet has been received since the channel was created.
    pub fn received_any(&self) -> bool {
        self.received_any
    }

    pub fn is_evs_mid(&self, mid: u16) -> bool {
        self.options.evs_mids.contains(&mid)
    }

    /// Redirect the TLM and EVS logs into `dir`. Files open lazily on the next packet.
    pub fn set_log_dir(&mut self, dir: &Path) {
        self.log_dir = Some(dir.to_path_buf());
        self.tlm_log = None;
        self.evs_log = None;
    }

    /// Read every pending datagram without blocking. Returns the number ingested.
    pub fn drain(&mut self, dictionary: &Dictionary, exec_time: f64) -> usize {
        let mut buf = vec![0u8; CCSDS_MAX_SIZE];
        let mut count = 0;
        loop {
            match self.socket.try_recv_from(&mut buf) {
                Ok((len, _)) => {
                    self.ingest(&buf[..len], dictionary, exec_time);
                    count += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("Telemetry socket error: {}", e);
                    break;
                }
            }
        }
        count
    }

    /// Decode one datagram and append it to its MID's history.
    pub fn ingest(&mut self, data: &[u8], dictionary: &Dictionary, exec_time: f64) {
        if data.len() < PRIMARY_HEADER_SIZE {
            error!("Cannot create CCSDS Primary Header from {} bytes", data.len());
            return;
        }
        let Some((pheader, mid)) = peek_msg_id(self.options.version, data) else {
            error!("Cannot create CCSDS Primary Header");
            return;
        };

        let Some(entry) = dictionary.mids.by_value(mid) else {
            let msg = format!(
                "Received Message with MID = {:#x}. This MID is not in the CCSDS MID Map. Ignoring...",
                mid
            );
            if self.received_mids.insert(mid) {
                warn!("{}", msg);
            }
            debug!("{}", msg);
            return;
        };

        let first_time = !self.received_mids.contains(&mid);
        let (header, payload) = if pheader.is_command() {
            let Some(header) = CommandHeader::decode(self.options.version, data) else {
                debug!("Cannot retrieve command header for MID {:#x}", mid);
                return;
            };
            let payload = entry
                .command_by_value(header.function_code())
                .and_then(|cc| Payload::from_bytes(cc.arg_type.clone(), &data[header.size()..]).ok());
            if first_time {
                info!("Receiving command packets for MID: {:#x}", mid);
            }
            (PacketHeader::Command(header), payload)
        } else {
            let Some(header) = TelemetryHeader::decode(self.options.version, data) else {
                debug!("Cannot retrieve telemetry header for MID {:#x}", mid);
                return;
            };
            let offset = if self.options.skip_header { header.size() } else { 0 };
            let payload = match entry.payload_type() {
                Some(def) => match Payload::from_bytes(def.clone(), &data[offset..]) {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        if first_time {
                            error!("Cannot retrieve payload from TLM packet with MID {:#x}: {}", mid, e);
                        }
                        None
                    }
                },
                None => None,
            };
            if first_time {
                info!(
                    "Receiving Telemetry Packets for Data Type: {} with MID: {:#x}",
                    entry.payload_type().map_or("?", |def| def.name()),
                    mid
                );
            }
            (PacketHeader::Telemetry(header), payload)
        };
        self.received_mids.insert(mid);

        if let Some(payload) = &payload {
            self.write_tlm_log(mid, payload, exec_time);
            if self.is_evs_mid(mid) {
                self.write_evs_log(payload);
            }
        }

        let count = self.counts.entry(mid).or_default();
        *count += 1;
        self.history.entry(mid).or_default().push(Packet {
            mid,
            header,
            payload,
            count: *count,
            timestamp: exec_time,
        });
        self.unchecked.insert(mid);
        self.received_any = true;
    }

    pub fn history(&self, mid: u16) -> &[Packet] {
        self.history.get(&mid).map_or(&[], Vec::as_slice)
    }

    pub fn latest(&self, mid: u16) -> Option<&Packet> {
        self.history.get(&mid).and_then(|packets| packets.last())
    }

    pub fn has_history(&self, mid: u16) -> bool {
        self.history.contains_key(&mid)
    }

    /// Drop packets stamped before `start_time`.
    pub fn prune_before(&mut self, mid: u16, start_time: f64) {
        if let Some(packets) = self.history.get_mut(&mid) {
            debug!("Clearing received packets for MID: {:#x} before time = {}", mid, start_time);
            packets.retain(|packet| packet.timestamp >= start_time);
        }
    }

    pub fn clear(&mut self, mid: u16) {
        if let Some(packets) = self.history.get_mut(&mid) {
            packets.clear();
        }
    }

    /// MIDs received since the last call.
    pub fn take_unchecked(&mut self) -> BTreeSet<u16> {
        std::mem::take(&mut self.unchecked)
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.counts.clear();
        self.unchecked.clear();
        self.received_any = false;
    }

    fn open_log(&self, file_name: &str) -> Option<File> {
        let dir = self.log_dir.as_ref()?;
        let path = dir.join(format!("{}_{}", self.options.target_name, file_name));
        match File::create(&path) {
            Ok(file) => Some(file),
            Err(e) => {
                error!("Failed to open {}: {}", path.display(), e);
                None
            }
        }
    }

    fn write_tlm_log(&mut self, mid: u16, payload: &Payload, exec_time: f64) {
        if self.tlm_log.is_none() {
            self.tlm_log = self.open_log(&self.options.tlm_log_file);
            if let Some(file) = self.tlm_log.as_mut() {
                if let Err(e) = writeln!(file, "Time: MID, Data") {
                    warn!("Failed to write telemetry log header: {}", e);
                }
            }
        }
        if let Some(file) = self.tlm_log.as_mut() {
            let text = payload.to_string().replace('\n', "\n\t");
            if writeln!(file, "{}: {:#x}\n\t{}", exec_time, mid, text).is_err() {
                error!("Failed to write telemetry packet received for {:#x}", mid);
            }
        }
    }

    fn write_evs_log(&mut self, payload: &Payload) {
        if self.evs_log.is_none() {
            self.evs_log = self.open_log(&self.options.evs_log_file);
        }
        let field = |name: &str| {
            payload
                .get(&format!("Payload.{}", name))
                .map(|value| display_value(&value))
                .unwrap_or_default()
        };
        let line = format!(
            "{}/{}/{} {}: {}",
            field("PacketID.SpacecraftID"),
            field("PacketID.ProcessorID"),
            field("PacketID.AppName"),
            field("PacketID.EventID"),
            field("Message"),
        );
        if let Some(file) = self.evs_log.as_mut() {
            if writeln!(file, "{}", line).is_err() {
                error!("Failed to write event packet to EVS log: {}", payload);
            }
        }
    }
}

/// Field value of the newest packet, used to copy telemetry into user variables.
pub fn latest_field(channel: &TelemetryChannel, mid: u16, path: &str) -> Option<Value> {
    channel
        .latest(mid)
        .and_then(|packet| packet.payload.as_ref())
        .and_then(|payload| payload.get(path).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionary::{MessageKind, MidEntry};
    use crate::types::{Endianness, FieldType, Primitive, TypeDef};
    use serde_json::json;
    use std::sync::Arc;

    fn dictionary() -> Dictionary {
        let mut dictionary = Dictionary::default();
        let hk = Arc::new(
            TypeDef::builder("TO_HkTlm_t", Endianness::Little)
                .field("usCmdCnt", FieldType::Primitive(Primitive::U16))
                .field("usCmdErrCnt", FieldType::Primitive(Primitive::U16))
                .build(),
        );
        dictionary
            .mids
            .insert(MidEntry {
                name: "TO_HK_TLM_MID".into(),
                mid: 0x0880,
                kind: MessageKind::Telemetry { payload: hk },
            })
            .unwrap();
        dictionary
    }

    fn packet(mid: u16, payload: &[u8]) -> Vec<u8> {
        let mut bytes = TelemetryHeader::new(CcsdsVersion::V1, mid, payload.len()).encode();
        bytes.extend_from_slice(payload);
        bytes
    }

    async fn channel() -> TelemetryChannel {
        TelemetryChannel::bind("127.0.0.1:0".parse().unwrap(), TelemetryOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_ingest_decodes_payload() {
        let mut channel = channel().await;
        let dictionary = dictionary();
        channel.ingest(&packet(0x0880, &[1, 0, 2, 0]), &dictionary, 0.5);

        let history = channel.history(0x0880);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].count, 1);
        assert_eq!(history[0].timestamp, 0.5);
        let payload = history[0].payload.as_ref().unwrap();
        assert_eq!(payload.get("usCmdCnt").unwrap(), json!(1));
        assert_eq!(payload.get("usCmdErrCnt").unwrap(), json!(2));
        assert!(channel.received_any());
    }

    #[tokio::test]
    async fn test_short_and_unknown_packets_are_dropped() {
        let mut channel = channel().await;
        let dictionary = dictionary();
        channel.ingest(&[0x08, 0x80], &dictionary, 0.0);
        channel.ingest(&packet(0x0999, &[0; 4]), &dictionary, 0.0);
        channel.ingest(&packet(0x0999, &[0; 4]), &dictionary, 0.0);
        assert!(channel.history(0x0999).is_empty());
        assert!(!channel.received_any());
    }

    #[tokio::test]
    async fn test_truncated_payload_is_kept_without_payload() {
        let mut channel = channel().await;
        channel.ingest(&packet(0x0880, &[1]), &dictionary(), 0.0);
        assert_eq!(channel.history(0x0880).len(), 1);
        assert!(channel.history(0x0880)[0].payload.is_none());
    }

    #[tokio::test]
    async fn test_prune_keeps_packets_from_start_time() {
        let mut channel = channel().await;
        let dictionary = dictionary();
        for time in [0.0, 1.0, 2.0] {
            channel.ingest(&packet(0x0880, &[0; 4]), &dictionary, time);
        }
        channel.prune_before(0x0880, 1.0);
        let stamps: Vec<f64> = channel.history(0x0880).iter().map(|p| p.timestamp).collect();
        assert_eq!(stamps, vec![1.0, 2.0]);
        assert_eq!(channel.take_unchecked().into_iter().collect::<Vec<_>>(), vec![0x0880]);
        assert!(channel.take_unchecked().is_empty());
    }

    #[tokio::test]
    async fn test_drain_reads_socket() {
        let mut channel = channel().await;
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(&packet(0x0880, &[5, 0, 0, 0]), channel.local_addr())
            .await
            .unwrap();

        let dictionary = dictionary();
        let mut received = 0;
        for _ in 0..50 {
            received += channel.drain(&dictionary, 0.0);
            if received > 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(received, 1);
        assert_eq!(
            latest_field(&channel, 0x0880, "usCmdCnt"),
            Some(json!(5))
        );
    }

    #[tokio::test]
    async fn test_tlm_log_written_to_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut channel = channel().await;
        channel.set_log_dir(dir.path());
        channel.ingest(&packet(0x0880, &[3, 0, 0, 0]), &dictionary(), 1.5);
        drop(channel);

        let log = std::fs::read_to_string(dir.path().join("cfs_tlm_msgs.log")).unwrap();
        assert!(log.starts_with("Time: MID, Data\n"));
        assert!(log.contains("1.5: 0x880\n\tTO_HkTlm_t: {usCmdCnt: 3, usCmdErrCnt: 0}"));
    }
}
