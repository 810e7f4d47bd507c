//! Listen-mode routing entries and their NCI TLV encoding.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::power::PowerStates;
use crate::types::{AidInfo, EeHandle, ProtoMask, TechMask};

/// Maximum AID length accepted by NCI routing.
pub const NCI_MAX_AID_LEN: usize = 16;

const TLV_TECHNOLOGY: u8 = 0x00;
const TLV_PROTOCOL: u8 = 0x01;
const TLV_AID: u8 = 0x02;
const TLV_SYSTEM_CODE: u8 = 0x03;
const TLV_TYPE_MASK: u8 = 0x0F;
const TLV_QUALIFIER_MASK: u8 = 0xF0;

/// Listen-mode routing codec error
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LmrtError {
    #[error("truncated TLV at offset {0}")]
    Truncated(usize),

    #[error("TLV at offset {offset} has invalid length {len}")]
    InvalidLength { offset: usize, len: usize },

    #[error("AID of {0} bytes exceeds the NCI maximum")]
    AidTooLong(usize),
}

/// Category of a routing entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Technology,
    Protocol,
    Aid,
    SystemCode,
}

/// One listen-mode routing rule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoutingEntry {
    Technology {
        technology: TechMask,
        destination: EeHandle,
        power: PowerStates,
    },
    Protocol {
        protocol: ProtoMask,
        destination: EeHandle,
        power: PowerStates,
    },
    Aid {
        #[serde(serialize_with = "serialize_hex")]
        aid: Bytes,
        info: AidInfo,
        destination: EeHandle,
        power: PowerStates,
    },
    SystemCode {
        system_code: u16,
        destination: EeHandle,
        power: PowerStates,
    },
}

fn serialize_hex<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(bytes))
}

impl RoutingEntry {
    pub fn kind(&self) -> EntryKind {
        match self {
            RoutingEntry::Technology { .. } => EntryKind::Technology,
            RoutingEntry::Protocol { .. } => EntryKind::Protocol,
            RoutingEntry::Aid { .. } => EntryKind::Aid,
            RoutingEntry::SystemCode { .. } => EntryKind::SystemCode,
        }
    }

    pub fn destination(&self) -> EeHandle {
        match self {
            RoutingEntry::Technology { destination, .. }
            | RoutingEntry::Protocol { destination, .. }
            | RoutingEntry::Aid { destination, .. }
            | RoutingEntry::SystemCode { destination, .. } => *destination,
        }
    }

    pub fn power(&self) -> PowerStates {
        match self {
            RoutingEntry::Technology { power, .. }
            | RoutingEntry::Protocol { power, .. }
            | RoutingEntry::Aid { power, .. }
            | RoutingEntry::SystemCode { power, .. } => *power,
        }
    }
}

/// Encode entries as NCI listen-mode routing TLVs.
///
/// Technology and protocol entries covering several members are split into
/// one TLV per member.
/// Format per TLV: type || length || nfcee id || power || selector
pub fn encode_entries(entries: &[RoutingEntry]) -> Result<Bytes, LmrtError> {
    let mut buf = BytesMut::new();

    for entry in entries {
        let route = entry.destination().nfcee_id();
        let power = entry.power().bits();
        match entry {
            RoutingEntry::Technology { technology, .. } => {
                for nci in technology.iter().filter_map(TechMask::to_nci) {
                    buf.put_slice(&[TLV_TECHNOLOGY, 3, route, power, nci]);
                }
            }
            RoutingEntry::Protocol { protocol, .. } => {
                for nci in protocol.iter().filter_map(ProtoMask::to_nci) {
                    buf.put_slice(&[TLV_PROTOCOL, 3, route, power, nci]);
                }
            }
            RoutingEntry::Aid { aid, info, .. } => {
                if aid.len() > NCI_MAX_AID_LEN {
                    return Err(LmrtError::AidTooLong(aid.len()));
                }
                buf.put_u8(TLV_AID | info.bits());
                buf.put_u8((2 + aid.len()) as u8);
                buf.put_slice(&[route, power]);
                buf.put_slice(aid);
            }
            RoutingEntry::SystemCode { system_code, .. } => {
                buf.put_slice(&[TLV_SYSTEM_CODE, 4, route, power]);
                buf.put_u16(*system_code);
            }
        }
    }

    Ok(buf.freeze())
}

/// Decode NCI listen-mode routing TLVs.
///
/// TLVs of unknown type and selectors without a typed counterpart are
/// skipped.
pub fn decode_entries(tlvs: &[u8]) -> Result<Vec<RoutingEntry>, LmrtError> {
    let mut entries = Vec::new();
    let mut offset = 0;

    while offset < tlvs.len() {
        if tlvs.len() - offset < 2 {
            return Err(LmrtError::Truncated(offset));
        }
        let tlv_type = tlvs[offset];
        let len = tlvs[offset + 1] as usize;
        let value_start = offset + 2;
        if tlvs.len() - value_start < len {
            return Err(LmrtError::Truncated(offset));
        }
        let value = &tlvs[value_start..value_start + len];
        if len < 2 {
            return Err(LmrtError::InvalidLength { offset, len });
        }

        let destination = EeHandle::from_nfcee_id(value[0]);
        let power = PowerStates::from_bits_truncate(value[1]);
        let selector = &value[2..];

        let entry = match tlv_type & TLV_TYPE_MASK {
            TLV_TECHNOLOGY => single_byte(selector, offset, len)?
                .and_then(TechMask::from_nci)
                .map(|technology| RoutingEntry::Technology { technology, destination, power }),
            TLV_PROTOCOL => single_byte(selector, offset, len)?
                .and_then(ProtoMask::from_nci)
                .map(|protocol| RoutingEntry::Protocol { protocol, destination, power }),
            TLV_AID => {
                if selector.len() > NCI_MAX_AID_LEN {
                    return Err(LmrtError::InvalidLength { offset, len });
                }
                Some(RoutingEntry::Aid {
                    aid: Bytes::copy_from_slice(selector),
                    info: AidInfo::from_bits_truncate(tlv_type & TLV_QUALIFIER_MASK),
                    destination,
                    power,
                })
            }
            TLV_SYSTEM_CODE => {
                if selector.len() != 2 {
                    return Err(LmrtError::InvalidLength { offset, len });
                }
                Some(RoutingEntry::SystemCode {
                    system_code: u16::from_be_bytes([selector[0], selector[1]]),
                    destination,
                    power,
                })
            }
            _ => None,
        };

        entries.extend(entry);
        offset = value_start + len;
    }

    Ok(entries)
}

fn single_byte(selector: &[u8], offset: usize, len: usize) -> Result<Option<u8>, LmrtError> {
    match selector {
        [value] => Ok(Some(*value)),
        _ => Err(LmrtError::InvalidLength { offset, len }),
    }
}
