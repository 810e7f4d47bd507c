//! Local mirror of the staged listen-mode routing table.
//!
//! Updated only after the controller acknowledged the corresponding
//! command, so it reflects what the next routing update will push.

use bytes::Bytes;

use nfc_hal::{AidInfo, EeHandle, PowerStates, ProtoMask, RoutingEntry, TechMask};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RoutingTable {
    entries: Vec<RoutingEntry>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[RoutingEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Install one entry per technology bit, replacing the handle's
    /// previous entry for that bit.
    pub fn set_technology(&mut self, handle: EeHandle, technology: TechMask, power: PowerStates) {
        self.clear_technology(handle, technology);
        for bit in technology.iter() {
            self.entries.push(RoutingEntry::Technology {
                technology: bit,
                destination: handle,
                power,
            });
        }
    }

    pub fn clear_technology(&mut self, handle: EeHandle, technology: TechMask) {
        self.entries.retain(|e| {
            !matches!(e, RoutingEntry::Technology { technology: t, destination, .. }
                if *destination == handle && technology.contains(*t))
        });
    }

    pub fn set_protocol(&mut self, handle: EeHandle, protocol: ProtoMask, power: PowerStates) {
        self.clear_protocol(handle, protocol);
        for bit in protocol.iter() {
            self.entries.push(RoutingEntry::Protocol {
                protocol: bit,
                destination: handle,
                power,
            });
        }
    }

    pub fn clear_protocol(&mut self, handle: EeHandle, protocol: ProtoMask) {
        self.entries.retain(|e| {
            !matches!(e, RoutingEntry::Protocol { protocol: p, destination, .. }
                if *destination == handle && protocol.contains(*p))
        });
    }

    pub fn upsert_aid(&mut self, aid: &[u8], info: AidInfo, handle: EeHandle, power: PowerStates) {
        self.remove_aid(aid);
        self.entries.push(RoutingEntry::Aid {
            aid: Bytes::copy_from_slice(aid),
            info,
            destination: handle,
            power,
        });
    }

    /// Returns false if the AID was not staged.
    pub fn remove_aid(&mut self, aid: &[u8]) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|e| !matches!(e, RoutingEntry::Aid { aid: a, .. } if a[..] == aid[..]));
        self.entries.len() < before
    }

    pub fn contains_aid(&self, aid: &[u8]) -> bool {
        self.entries
            .iter()
            .any(|e| matches!(e, RoutingEntry::Aid { aid: a, .. } if a[..] == aid[..]))
    }

    pub fn aids(&self) -> Vec<Bytes> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                RoutingEntry::Aid { aid, .. } => Some(aid.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn set_system_code(&mut self, system_code: u16, handle: EeHandle, power: PowerStates) {
        self.remove_system_code(system_code);
        self.entries.push(RoutingEntry::SystemCode {
            system_code,
            destination: handle,
            power,
        });
    }

    pub fn remove_system_code(&mut self, system_code: u16) {
        self.entries
            .retain(|e| !matches!(e, RoutingEntry::SystemCode { system_code: c, .. } if *c == system_code));
    }

    pub fn system_codes(&self) -> Vec<u16> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                RoutingEntry::SystemCode { system_code, .. } => Some(*system_code),
                _ => None,
            })
            .collect()
    }

    /// Handles holding a technology entry among `technology`, with the bits
    /// each holds.
    pub fn technology_holders(&self, technology: TechMask) -> Vec<(EeHandle, TechMask)> {
        let mut holders: Vec<(EeHandle, TechMask)> = Vec::new();
        for entry in &self.entries {
            if let RoutingEntry::Technology { technology: t, destination, .. } = entry {
                if !technology.intersects(*t) {
                    continue;
                }
                match holders.iter_mut().find(|(h, _)| h == destination) {
                    Some((_, mask)) => *mask |= *t,
                    None => holders.push((*destination, *t)),
                }
            }
        }
        holders
    }

    /// Handles holding a protocol entry among `protocol`.
    pub fn protocol_holders(&self, protocol: ProtoMask) -> Vec<EeHandle> {
        let mut holders = Vec::new();
        for entry in &self.entries {
            if let RoutingEntry::Protocol { protocol: p, destination, .. } = entry {
                if protocol.intersects(*p) && !holders.contains(destination) {
                    holders.push(*destination);
                }
            }
        }
        holders
    }

    /// Destinations routing `technology` while switched on.
    pub fn technology_owners(&self, technology: TechMask) -> Vec<EeHandle> {
        let mut owners = Vec::new();
        for entry in &self.entries {
            if let RoutingEntry::Technology { technology: t, destination, power } = entry {
                if t.intersects(technology) && power.switch_on() && !owners.contains(destination) {
                    owners.push(*destination);
                }
            }
        }
        owners
    }

    /// At most one switched-on destination per technology.
    pub fn is_exclusive(&self) -> bool {
        TechMask::all().iter().all(|tech| self.technology_owners(tech).len() <= 1)
    }
}
