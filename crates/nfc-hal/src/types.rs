//! Value types shared by the controller interface and the routing core.

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

// ============================================================================
// Execution environment handles
// ============================================================================

/// Native execution-environment handle as assigned by the controller stack.
///
/// Handles carry the EE group bits (`0x400`) over the NFCEE id; the host
/// pseudo-EE is always `0x400`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EeHandle(pub u16);

impl EeHandle {
    const GROUP_EE: u16 = 0x400;

    /// Device host.
    pub const HOST: EeHandle = EeHandle(0x400);
    /// HCI network; never a routing destination.
    pub const HCI_NETWORK: EeHandle = EeHandle(0x401);
    /// UICC slot 1 on NCI 1.0 controllers.
    pub const UICC_NCI1: EeHandle = EeHandle(0x402);
    /// T4T NFCEE.
    pub const T4T_NFCEE: EeHandle = EeHandle(0x410);
    /// UICC slot 1 on NCI 2.0 controllers.
    pub const UICC: EeHandle = EeHandle(0x480);
    pub const UICC2: EeHandle = EeHandle(0x481);
    pub const UICC3: EeHandle = EeHandle(0x482);
    /// Embedded secure element.
    pub const ESE: EeHandle = EeHandle(0x4C0);
    pub const EUICC: EeHandle = EeHandle(0x4C1);
    pub const EUICC2: EeHandle = EeHandle(0x4C2);
    pub const INVALID: EeHandle = EeHandle(0xFFFF);

    pub fn is_host(self) -> bool {
        self == Self::HOST
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    /// NFCEE id, i.e. the handle without its group bits.
    pub fn nfcee_id(self) -> u8 {
        (self.0 & !Self::GROUP_EE) as u8
    }

    pub fn from_nfcee_id(id: u8) -> Self {
        EeHandle(Self::GROUP_EE | u16::from(id))
    }
}

impl fmt::Debug for EeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EeHandle({:#05x})", self.0)
    }
}

impl fmt::Display for EeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#05x}", self.0)
    }
}

// ============================================================================
// Technology / protocol masks
// ============================================================================

/// Listen-mode RF technologies.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TechMask(u8);

bitflags! {
    impl TechMask: u8 {
        const A = 0x01;
        const B = 0x02;
        const F = 0x04;
    }
}

impl TechMask {
    /// NCI RF technology value for a single-bit mask.
    pub fn to_nci(self) -> Option<u8> {
        match self {
            TechMask::A => Some(0x00),
            TechMask::B => Some(0x01),
            TechMask::F => Some(0x02),
            _ => None,
        }
    }

    pub fn from_nci(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(TechMask::A),
            0x01 => Some(TechMask::B),
            0x02 => Some(TechMask::F),
            _ => None,
        }
    }

    /// Technology A or B, the carriers of ISO-DEP.
    pub fn supports_iso_dep(self) -> bool {
        self.intersects(TechMask::A | TechMask::B)
    }
}

/// Listen-mode RF protocols.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtoMask(u8);

bitflags! {
    impl ProtoMask: u8 {
        const T3T = 0x04;
        const ISO_DEP = 0x08;
        const NFC_DEP = 0x10;
    }
}

impl ProtoMask {
    /// NCI RF protocol value for a single-bit mask.
    pub fn to_nci(self) -> Option<u8> {
        match self {
            ProtoMask::T3T => Some(0x03),
            ProtoMask::ISO_DEP => Some(0x04),
            ProtoMask::NFC_DEP => Some(0x05),
            _ => None,
        }
    }

    pub fn from_nci(value: u8) -> Option<Self> {
        match value {
            0x03 => Some(ProtoMask::T3T),
            0x04 => Some(ProtoMask::ISO_DEP),
            0x05 => Some(ProtoMask::NFC_DEP),
            _ => None,
        }
    }
}

/// NFCEE power supply and communication link configuration.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PowerLink(u8);

bitflags! {
    impl PowerLink: u8 {
        /// NFCEE power supply always on.
        const ALWAYS_ON = 0x01;
        /// NFCC to NFCEE link always active while the NFCEE is powered.
        const LINK_ACTIVE = 0x02;
    }
}

impl PowerLink {
    /// NFCC decides power and link state on its own.
    pub const NFCC_DECIDES: PowerLink = PowerLink::empty();
    pub const ALWAYS_ON_LINK_ACTIVE: PowerLink = PowerLink::ALWAYS_ON.union(PowerLink::LINK_ACTIVE);
}

/// Qualifiers attached to an AID routing entry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AidInfo(u8);

bitflags! {
    impl AidInfo: u8 {
        /// Match the AID as a prefix.
        const PREFIX = 0x10;
        /// Match the AID as a subset.
        const SUBSET = 0x20;
    }
}

impl_mask_fmt!(TechMask, ProtoMask, PowerLink, AidInfo);

// ============================================================================
// Status codes
// ============================================================================

/// Status carried by a controller completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NfcStatus {
    Ok,
    Failed,
    InvalidParam,
    NotSupported,
    /// Plain protocol timeout.
    Timeout,
    /// Extended-wait (WTX) limit reached.
    WtxTimeout,
    /// HCI reported an unrecoverable error; the NFCC reinitializes the EE.
    Unrecoverable,
}

impl NfcStatus {
    pub fn is_ok(self) -> bool {
        self == NfcStatus::Ok
    }
}

/// Status of an execution environment as last reported by the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EeStatus {
    Active,
    Inactive,
    Removed,
}

// ============================================================================
// Discovery records
// ============================================================================

/// One execution environment as reported by EE discovery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EeInfo {
    pub handle: EeHandle,
    pub status: EeStatus,
    /// Listen technologies with at least one supported protocol.
    pub technologies: TechMask,
    pub protocols: ProtoMask,
    /// Reachable only through the HCI access interface.
    #[serde(default)]
    pub hci_access_only: bool,
}

impl EeInfo {
    pub fn new(handle: EeHandle, status: EeStatus) -> Self {
        Self {
            handle,
            status,
            technologies: TechMask::empty(),
            protocols: ProtoMask::empty(),
            hci_access_only: false,
        }
    }

    pub fn with_technologies(mut self, technologies: TechMask) -> Self {
        self.technologies = technologies;
        self
    }

    pub fn with_protocols(mut self, protocols: ProtoMask) -> Self {
        self.protocols = protocols;
        self
    }

    pub fn hci_access_only(mut self) -> Self {
        self.hci_access_only = true;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == EeStatus::Active
    }
}

/// HCI pipe as reported by the gate/pipe list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PipeInfo {
    pub pipe_id: u8,
    pub local_gate: u8,
    pub dest_host: u8,
    pub dest_gate: u8,
}
