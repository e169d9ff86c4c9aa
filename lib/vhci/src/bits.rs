// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Register-level constants and structures for the emulated root hub and the
//! transfer descriptors exchanged with the worker process.

use bitstruct::bitstruct;
use serde::{Deserialize, Serialize};
use strum::FromRepr;

bitflags::bitflags! {
    /// Port status register, laid out as wPortStatus.
    ///
    /// See USB 2.0 table 11-21.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct PortStatus: u16 {
        const CONNECTION = 1 << 0;
        const ENABLE = 1 << 1;
        const SUSPEND = 1 << 2;
        const OVERCURRENT = 1 << 3;
        const RESET = 1 << 4;
        const POWER = 1 << 8;
        const LOW_SPEED = 1 << 9;
        const HIGH_SPEED = 1 << 10;
    }
}

bitflags::bitflags! {
    /// Port change register, laid out as wPortChange. Each bit shadows the
    /// status bit in the same position and sticks until acknowledged.
    ///
    /// See USB 2.0 table 11-22.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct PortChange: u16 {
        const C_CONNECTION = 1 << 0;
        const C_ENABLE = 1 << 1;
        const C_SUSPEND = 1 << 2;
        const C_OVERCURRENT = 1 << 3;
        const C_RESET = 1 << 4;
    }
}

bitflags::bitflags! {
    /// Per-transfer behavior flags carried through to the worker.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct TransferFlags: u16 {
        /// A short inbound transfer is an error rather than a success.
        const SHORT_NOT_OK = 1 << 0;
        /// Schedule the isochronous transfer as soon as bandwidth allows.
        const ISO_ASAP = 1 << 1;
        /// Terminate an outbound bulk transfer with a zero-length packet.
        const ZERO_PACKET = 1 << 2;
    }
}

// The register types cross the control channel as their raw wire values.
macro_rules! serde_as_bits {
    ($($ty:ty),*) => {
        $(
            impl Serialize for $ty {
                fn serialize<S: serde::Serializer>(
                    &self,
                    serializer: S,
                ) -> Result<S::Ok, S::Error> {
                    self.bits().serialize(serializer)
                }
            }

            impl<'de> Deserialize<'de> for $ty {
                fn deserialize<D: serde::Deserializer<'de>>(
                    deserializer: D,
                ) -> Result<Self, D::Error> {
                    Ok(Self::from_bits_retain(u16::deserialize(deserializer)?))
                }
            }
        )*
    };
}
serde_as_bits!(PortStatus, PortChange, TransferFlags);

/// Hub class feature selectors addressed to a port.
///
/// See USB 2.0 table 11-17.
#[derive(FromRepr, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum PortFeature {
    Connection = 0,
    Enable = 1,
    Suspend = 2,
    OverCurrent = 3,
    Reset = 4,
    Power = 8,
    LowSpeed = 9,
    HighSpeed = 10,
    CConnection = 16,
    CEnable = 17,
    CSuspend = 18,
    COverCurrent = 19,
    CReset = 20,
    Test = 21,
    Indicator = 22,
}

impl PortFeature {
    /// The change-register bit acknowledged by this selector, if it names
    /// one. The change selectors start at 16 and mirror the change-register
    /// bit layout.
    pub fn change_bit(&self) -> Option<PortChange> {
        let shift = (*self as u16).checked_sub(16)?;
        PortChange::from_bits(1 << shift)
    }
}

/// Hub class feature selectors addressed to the hub itself.
#[derive(FromRepr, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum HubFeature {
    CLocalPower = 0,
    COverCurrent = 1,
}

/// Hub class request codes: bmRequestType in the high byte, bRequest in the
/// low byte, as delivered by the bus stack's hub-control path.
pub const CLEAR_HUB_FEATURE: u16 = 0x2001;
pub const CLEAR_PORT_FEATURE: u16 = 0x2301;
pub const GET_HUB_DESCRIPTOR: u16 = 0xa006;
pub const GET_HUB_STATUS: u16 = 0xa000;
pub const GET_PORT_STATUS: u16 = 0xa300;
pub const SET_HUB_FEATURE: u16 = 0x2003;
pub const SET_PORT_FEATURE: u16 = 0x2303;

/// Hub descriptor type (bDescriptorType).
pub const DT_HUB: u8 = 0x29;

/// wHubCharacteristics: per-port power switching and per-port overcurrent
/// reporting.
///
/// See USB 2.0 table 11-13.
pub const HUB_CHARACTERISTICS: u16 = 0x0009;

bitstruct! {
    /// The 8-byte setup stage header of a control transfer, packed
    /// little-endian as it appears on the wire.
    ///
    /// See USB 2.0 table 9-2.
    #[derive(Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct SetupPacket(pub u64) {
        /// Part of bmRequestType: device, interface, endpoint, or other.
        pub recipient: u8 = 0..5;
        /// Part of bmRequestType: standard, class, or vendor.
        pub request_type: u8 = 5..7;
        /// Part of bmRequestType: set for device-to-host (IN) data stages.
        pub device_to_host: bool = 7;
        /// bRequest.
        pub request: u8 = 8..16;
        /// wValue.
        pub value: u16 = 16..32;
        /// wIndex.
        pub index: u16 = 32..48;
        /// wLength: bytes to transfer in the data stage.
        pub length: u16 = 48..64;
    }
}

impl SetupPacket {
    pub fn from_bytes(raw: [u8; 8]) -> Self {
        Self(u64::from_le_bytes(raw))
    }

    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    /// The whole bmRequestType byte, for callers that want it unparsed.
    pub fn request_type_byte(&self) -> u8 {
        self.0.to_le_bytes()[0]
    }
}

impl core::fmt::Debug for SetupPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SetupPacket {{ bmRequestType: {:#04x}, bRequest: {:#04x}, \
             wValue: {:#06x}, wIndex: {:#06x}, wLength: {} }}",
            self.request_type_byte(),
            self.request(),
            self.value(),
            self.index(),
            self.length()
        )
    }
}
