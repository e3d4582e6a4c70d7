//! Routing of packets to instruments.
//!
//! A port used by exactly one instrument delivers everything to it. A port
//! used by several instruments is shared: a packet belongs to the instrument
//! whose data id is the longest prefix of the payload, and a packet that
//! matches no data id belongs to nobody and is dropped.

use std::collections::BTreeMap;

use crate::config::{InstrumentConfig, InstrumentId};
use crate::error::ConfigError;

/// The instruments listening on one UDP port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRoute {
    port: u16,
    /// (instrument, prefix), sorted by descending prefix length
    consumers: Vec<(InstrumentId, Vec<u8>)>,
}

impl PortRoute {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_shared(&self) -> bool {
        self.consumers.len() > 1
    }

    pub fn instruments(&self) -> impl Iterator<Item = &InstrumentId> {
        self.consumers.iter().map(|(id, _)| id)
    }

    /// The instrument a payload belongs to, if any.
    pub fn route(&self, payload: &[u8]) -> Option<&InstrumentId> {
        match self.consumers.as_slice() {
            [(only, _)] => Some(only),
            consumers => consumers
                .iter()
                .find(|(_, prefix)| payload.starts_with(prefix))
                .map(|(id, _)| id),
        }
    }
}

/// Routing table for every configured port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortRoutes {
    ports: BTreeMap<u16, PortRoute>,
}

impl PortRoutes {
    pub fn build<'a>(
        instruments: impl IntoIterator<Item = &'a InstrumentConfig>,
    ) -> Result<Self, ConfigError> {
        let mut ports: BTreeMap<u16, PortRoute> = BTreeMap::new();

        for inst in instruments {
            let route = ports.entry(inst.port).or_insert_with(|| PortRoute {
                port: inst.port,
                consumers: Vec::new(),
            });
            let prefix = inst.data_id.as_bytes().to_vec();
            if let Some((other, _)) = route.consumers.iter().find(|(_, p)| *p == prefix) {
                return Err(ConfigError::DuplicatePrefix {
                    port: inst.port,
                    first: other.to_string(),
                    second: inst.id.to_string(),
                    data_id: inst.data_id.clone(),
                });
            }
            route.consumers.push((inst.id.clone(), prefix));
        }

        for route in ports.values_mut() {
            route
                .consumers
                .sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(&b.0)));
        }

        Ok(PortRoutes { ports })
    }

    pub fn get(&self, port: u16) -> Option<&PortRoute> {
        self.ports.get(&port)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PortRoute> {
        self.ports.values()
    }
}
