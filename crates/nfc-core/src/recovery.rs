//! Wired-session recovery sequences.

use std::time::Duration;

use nfc_hal::PowerLink;

/// Largest APDU the wired link carries.
pub const MAX_APDU_LEN: usize = 0x800B;

/// Status word answered to an oversized APDU: wrong length.
pub const SW_WRONG_LENGTH: [u8; 2] = [0x67, 0x00];

/// HCI event closing an APDU exchange on the APDU gate.
pub const EVT_END_OF_APDU_TRANSFER: u8 = 0x61;

/// Local APDU gate.
pub const APDU_GATE: u8 = 0xF0;

/// Gate reset attempts while the SE answers invalid-parameter.
pub const GATE_RESET_ATTEMPTS: usize = 3;

/// Timeout handed to the controller for an abort.
pub const ABORT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Bound for gate allocation and pipe listing.
pub const GATE_PIPE_TIMEOUT: Duration = Duration::from_millis(500);

/// Proprietary SET_CONFIG clearing the NFCEE session identity.
pub const SESSION_RESET_COMMAND: [u8; 15] = [
    0x20, 0x02, 0x0C, 0x01, 0xA0, 0xEB, 0x08, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
];

/// Power-link configuration with the link up and power always on.
pub const POWER_LINK_ON: PowerLink = PowerLink::ALWAYS_ON_LINK_ACTIVE;

/// Power-link cycle used to bring a hung SE back.
///
/// Sequence: `first`, mode disable, wait `off_settle`, power-link on,
/// mode enable, wait `on_settle`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PowerCycle {
    pub first: PowerLink,
    pub off_settle: Duration,
    pub on_settle: Duration,
}

impl PowerCycle {
    /// After a WTX timeout during gate reset.
    pub const WTX_GATE_RESET: PowerCycle = PowerCycle {
        first: PowerLink::NFCC_DECIDES,
        off_settle: Duration::from_millis(50),
        on_settle: Duration::ZERO,
    };

    /// Around a session identity reset.
    pub const SESSION_RESET: PowerCycle = PowerCycle {
        first: PowerLink::ALWAYS_ON,
        off_settle: Duration::from_millis(100),
        on_settle: Duration::from_millis(100),
    };

    /// After a transceive timeout.
    pub const fn transceive_timeout(first: PowerLink) -> PowerCycle {
        PowerCycle {
            first,
            off_settle: Duration::from_millis(1000),
            on_settle: Duration::from_millis(200),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_reset_command_length() {
        // Header length byte covers everything after the 3-byte header
        assert_eq!(SESSION_RESET_COMMAND[2] as usize, SESSION_RESET_COMMAND.len() - 3);
    }

    #[test]
    fn test_power_link_on_value() {
        assert_eq!(POWER_LINK_ON.bits(), 0x03);
        assert_eq!(PowerCycle::transceive_timeout(PowerLink::ALWAYS_ON).first, PowerLink::ALWAYS_ON);
    }
}
