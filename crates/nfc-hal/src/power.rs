//! Device power states qualifying a routing entry.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Set of device power states in which a routing entry is active.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PowerStates(u8);

bitflags! {
    impl PowerStates: u8 {
        /// Switched on, screen unlocked.
        const SWITCH_ON = 0x01;
        const SWITCH_OFF = 0x02;
        const BATTERY_OFF = 0x04;
        /// Switched on, screen off.
        const SCREEN_OFF = 0x08;
        /// Switched on, screen locked.
        const SCREEN_LOCK = 0x10;
        /// Switched on, screen off and locked.
        const SCREEN_OFF_LOCK = 0x20;
    }
}

impl_mask_fmt!(PowerStates);

impl PowerStates {
    /// States in which the host processor cannot service a selection.
    pub const HOST_UNREACHABLE: PowerStates = PowerStates::SWITCH_OFF.union(PowerStates::BATTERY_OFF);

    /// Default power for host destinations: switched on, unlocked or locked.
    pub const HOST_DEFAULT: PowerStates = PowerStates::SWITCH_ON.union(PowerStates::SCREEN_LOCK);

    /// Every switched-on state, locked or not, screen on or off.
    pub const SWITCHED_ON_ANY: PowerStates = PowerStates::SWITCH_ON
        .union(PowerStates::SCREEN_LOCK)
        .union(PowerStates::SCREEN_OFF)
        .union(PowerStates::SCREEN_OFF_LOCK);

    pub fn switch_on(self) -> bool {
        self.contains(Self::SWITCH_ON)
    }

    pub fn switch_off(self) -> bool {
        self.contains(Self::SWITCH_OFF)
    }

    pub fn battery_off(self) -> bool {
        self.contains(Self::BATTERY_OFF)
    }

    pub fn screen_off(self) -> bool {
        self.contains(Self::SCREEN_OFF)
    }

    pub fn screen_lock(self) -> bool {
        self.contains(Self::SCREEN_LOCK)
    }

    pub fn screen_off_lock(self) -> bool {
        self.contains(Self::SCREEN_OFF_LOCK)
    }

    /// Drops the states the host cannot be reached in.
    pub fn for_host(self) -> Self {
        self - Self::HOST_UNREACHABLE
    }

    /// Applies an off-host ceiling.
    pub fn capped(self, ceiling: PowerStates) -> Self {
        self & ceiling
    }
}
