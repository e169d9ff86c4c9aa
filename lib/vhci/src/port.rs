// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Root-hub port state machines.
//!
//! Each port has separate entry points for register changes driven by the
//! bus stack (hub class requests, [RootHubPort::set_feature] and
//! [RootHubPort::clear_feature]) and by the worker reporting an observed
//! electrical transition ([RootHubPort::apply_report]). Methods return
//! whether the registers changed in a way the worker has not seen yet, so
//! the controller can flag the port for delivery.

use serde::{Deserialize, Serialize};

use crate::bits::{PortChange, PortFeature, PortStatus};
use crate::{Error, MAX_PORTS};

/// 1-based root-hub port number, as used on the wire and in hub requests.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct PortId(u8);

impl TryFrom<u8> for PortId {
    type Error = Error;
    fn try_from(value: u8) -> Result<Self, Error> {
        if value > 0 && value <= MAX_PORTS {
            Ok(Self(value - 1))
        } else {
            Err(Error::PortOutOfRange(value))
        }
    }
}

impl PortId {
    pub fn as_raw_id(&self) -> u8 {
        self.0 + 1
    }

    pub fn as_index(&self) -> usize {
        self.0 as usize
    }

    pub(crate) fn from_index(index: usize) -> Self {
        debug_assert!(index < MAX_PORTS as usize);
        Self(index as u8)
    }
}

impl std::fmt::Display for PortId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_raw_id())
    }
}

/// The worker's classification of an observed port transition, decoded from
/// the change mask it reports. Any other mask is rejected before it can
/// touch port state.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeReason {
    /// Device attached or detached.
    Connect,
    /// Port stopped being enabled (error condition on the emulated bus).
    Enable,
    /// Suspend state completed a transition (including resume completion).
    Suspend,
    /// Overcurrent condition changed.
    Overcurrent,
    /// Reset signaling completed.
    Reset,
    /// Reset signaling completed and the enable state changed with it.
    ResetEnable,
}

impl TryFrom<PortChange> for ChangeReason {
    type Error = Error;
    fn try_from(mask: PortChange) -> Result<Self, Error> {
        if mask == PortChange::C_CONNECTION {
            Ok(Self::Connect)
        } else if mask == PortChange::C_ENABLE {
            Ok(Self::Enable)
        } else if mask == PortChange::C_SUSPEND {
            Ok(Self::Suspend)
        } else if mask == PortChange::C_OVERCURRENT {
            Ok(Self::Overcurrent)
        } else if mask == PortChange::C_RESET {
            Ok(Self::Reset)
        } else if mask == PortChange::C_RESET | PortChange::C_ENABLE {
            Ok(Self::ResetEnable)
        } else {
            Err(Error::InvalidArgument("unrecognized port change mask"))
        }
    }
}

/// One downstream port's status/change register pair plus the transitional
/// resuming flag. Change bits are sticky: they are only cleared by an
/// explicit acknowledgment from the bus stack or a countervailing worker
/// report, never by polling.
#[derive(Default)]
pub struct RootHubPort {
    status: PortStatus,
    change: PortChange,
    resuming: bool,
}

impl RootHubPort {
    pub fn status(&self) -> PortStatus {
        self.status
    }

    pub fn change(&self) -> PortChange {
        self.change
    }

    pub fn resuming(&self) -> bool {
        self.resuming
    }

    /// SetPortFeature with a status selector. Returns whether the worker
    /// needs to be told.
    pub fn set_feature(&mut self, feature: PortFeature) -> Result<bool, Error> {
        Ok(match feature {
            // USB 2.0 sect 11.24.2.7.1.3: only an enabled, not-yet-suspended
            // port can be suspended; the suspend bit clears whenever the
            // enable bit does.
            PortFeature::Suspend => {
                if self.status.contains(PortStatus::ENABLE)
                    && !self.status.contains(PortStatus::SUSPEND)
                {
                    self.status |= PortStatus::SUSPEND;
                    true
                } else {
                    false
                }
            }
            // USB 2.0 sect 11.11, 11.24.2.7.1.6
            PortFeature::Power => {
                if !self.status.contains(PortStatus::POWER) {
                    self.status |= PortStatus::POWER;
                    true
                } else {
                    false
                }
            }
            // USB 2.0 sect 11.24.2.7.1.5: reset requires a connected device
            // and no reset already signaling. A second reset request before
            // the first is acknowledged is a no-op.
            PortFeature::Reset => {
                if self.status.contains(PortStatus::CONNECTION)
                    && !self.status.contains(PortStatus::RESET)
                {
                    self.status &= PortStatus::POWER
                        | PortStatus::CONNECTION
                        | PortStatus::LOW_SPEED
                        | PortStatus::HIGH_SPEED
                        | PortStatus::OVERCURRENT;
                    self.status |= PortStatus::RESET;
                    self.resuming = false;
                    true
                } else {
                    false
                }
            }
            PortFeature::Connection
            | PortFeature::OverCurrent
            | PortFeature::LowSpeed
            | PortFeature::HighSpeed
            | PortFeature::Indicator => false,
            feature => match feature.change_bit() {
                // setting a change bit directly notifies only if it was clear
                Some(bit) => {
                    let newly = !self.change.contains(bit);
                    self.change |= bit;
                    newly
                }
                // PORT_ENABLE is only ever set by a completed reset
                // (USB 2.0 sect 11.24.2.7.1.2), and PORT_TEST is unsupported
                None => return Err(Error::Protocol),
            },
        })
    }

    /// ClearPortFeature with a status selector. Returns whether the worker
    /// needs to be told.
    pub fn clear_feature(
        &mut self,
        feature: PortFeature,
    ) -> Result<bool, Error> {
        Ok(match feature {
            // USB 2.0 sect 11.5, 11.24.2.7.1.3: clearing suspend starts the
            // resume transition; the suspend bit stays up until the worker
            // reports the resume complete.
            PortFeature::Suspend => {
                if self.status.contains(PortStatus::SUSPEND) {
                    self.resuming = true;
                    true
                } else {
                    false
                }
            }
            // USB 2.0 sect 11.24.2.7.{1,2}: power-off clears everything but
            // the overcurrent state.
            PortFeature::Power => {
                if self.status.contains(PortStatus::POWER) {
                    self.status &= PortStatus::OVERCURRENT;
                    self.change &= PortChange::C_OVERCURRENT;
                    self.resuming = false;
                    true
                } else {
                    false
                }
            }
            // USB 2.0 sect 11.5.1.4, 11.24.2.7.{1,2}.2
            PortFeature::Enable => {
                if self.status.contains(PortStatus::ENABLE) {
                    self.status &=
                        !(PortStatus::ENABLE | PortStatus::SUSPEND);
                    self.change &=
                        !(PortChange::C_ENABLE | PortChange::C_SUSPEND);
                    self.resuming = false;
                    true
                } else {
                    false
                }
            }
            PortFeature::Connection
            | PortFeature::OverCurrent
            | PortFeature::Reset
            | PortFeature::LowSpeed
            | PortFeature::HighSpeed
            | PortFeature::Indicator => false,
            feature => match feature.change_bit() {
                Some(bit) => self.acknowledge(bit),
                None => return Err(Error::Protocol),
            },
        })
    }

    /// Clear one sticky change bit. Returns whether it was set.
    pub fn acknowledge(&mut self, bit: PortChange) -> bool {
        let was_set = self.change.contains(bit);
        self.change &= !bit;
        was_set
    }

    /// Force-suspend an enabled, not-yet-suspended port on behalf of a
    /// root-hub bus suspend.
    pub(crate) fn force_suspend(&mut self) -> bool {
        if self.status.contains(PortStatus::ENABLE)
            && !self.status.contains(PortStatus::SUSPEND)
        {
            self.status |= PortStatus::SUSPEND;
            self.resuming = false;
            true
        } else {
            false
        }
    }

    /// Apply a worker-observed transition to the registers.
    ///
    /// Each reason carries a validity precondition checked against the
    /// current registers; a violation changes nothing and surfaces as a
    /// protocol error. On success the matching change bit is set and the
    /// per-reason status rules applied.
    pub fn apply_report(
        &mut self,
        reported: PortStatus,
        reason: ChangeReason,
    ) -> Result<(), Error> {
        if !self.status.contains(PortStatus::POWER) {
            return Err(Error::Protocol);
        }
        match reason {
            ChangeReason::Connect => {
                let overcurrent = self.status & PortStatus::OVERCURRENT;
                self.change |= PortChange::C_CONNECTION;
                if reported.contains(PortStatus::CONNECTION) {
                    let speed = if reported.contains(PortStatus::LOW_SPEED) {
                        PortStatus::LOW_SPEED
                    } else if reported.contains(PortStatus::HIGH_SPEED) {
                        PortStatus::HIGH_SPEED
                    } else {
                        PortStatus::empty()
                    };
                    self.status = PortStatus::POWER
                        | PortStatus::CONNECTION
                        | speed
                        | overcurrent;
                } else {
                    self.status = PortStatus::POWER | overcurrent;
                }
                self.resuming = false;
            }
            ChangeReason::Enable => {
                if !self.status.contains(PortStatus::CONNECTION)
                    || self.status.contains(PortStatus::RESET)
                    || reported.contains(PortStatus::ENABLE)
                {
                    return Err(Error::Protocol);
                }
                self.change |= PortChange::C_ENABLE;
                self.status &= !PortStatus::ENABLE;
                self.resuming = false;
                self.status &= !PortStatus::SUSPEND;
            }
            ChangeReason::Suspend => {
                if !self.status.contains(PortStatus::CONNECTION)
                    || !self.status.contains(PortStatus::ENABLE)
                    || self.status.contains(PortStatus::RESET)
                    || reported.contains(PortStatus::SUSPEND)
                {
                    return Err(Error::Protocol);
                }
                self.resuming = false;
                self.change |= PortChange::C_SUSPEND;
                self.status &= !PortStatus::SUSPEND;
            }
            ChangeReason::Overcurrent => {
                self.change |= PortChange::C_OVERCURRENT;
                self.status &= !PortStatus::OVERCURRENT;
                self.status |= reported & PortStatus::OVERCURRENT;
            }
            ChangeReason::Reset | ChangeReason::ResetEnable => {
                if !self.status.contains(PortStatus::CONNECTION)
                    || !self.status.contains(PortStatus::RESET)
                    || reported.contains(PortStatus::RESET)
                {
                    return Err(Error::Protocol);
                }
                if reason == ChangeReason::ResetEnable {
                    if reported.contains(PortStatus::ENABLE) {
                        return Err(Error::Protocol);
                    }
                    self.change |= PortChange::C_ENABLE;
                } else {
                    self.status |= reported & PortStatus::ENABLE;
                }
                self.change |= PortChange::C_RESET;
                self.status &= !PortStatus::RESET;
            }
        }
        Ok(())
    }
}
