//! Packets as they come off the wire, and the records sinks receive.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::net::SocketAddr;

use crate::config::InstrumentId;

/// One datagram, stamped on arrival. Never persisted as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
    pub source: SocketAddr,
    /// Local port the datagram arrived on
    pub port: u16,
}

impl Packet {
    pub fn new(payload: Vec<u8>, source: SocketAddr, port: u16) -> Self {
        Packet {
            payload,
            received_at: Utc::now(),
            source,
            port,
        }
    }
}

/// A packet attributed to an instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub instrument: InstrumentId,
    pub data_id: String,
    pub received_at: DateTime<Utc>,
    pub source: SocketAddr,
    #[serde(serialize_with = "serialize_payload")]
    pub payload: Vec<u8>,
}

fn serialize_payload<S: serde::Serializer>(payload: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&String::from_utf8_lossy(payload))
}

impl Record {
    pub fn from_packet(instrument: InstrumentId, data_id: &str, packet: Packet) -> Self {
        Record {
            instrument,
            data_id: data_id.to_string(),
            received_at: packet.received_at,
            source: packet.source,
            payload: packet.payload,
        }
    }

    /// Payload as text with trailing line terminators removed.
    ///
    /// Instruments send ASCII sentences; anything else is replaced lossily.
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload)
            .trim_end_matches(['\r', '\n'])
            .to_string()
    }

    /// One log line: `<data_id> <timestamp> <payload>`, no newline.
    pub fn to_line(&self) -> String {
        format!(
            "{} {} {}",
            self.data_id,
            self.received_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            self.payload_text()
        )
    }
}
