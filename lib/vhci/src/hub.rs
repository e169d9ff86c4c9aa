// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hub class request decoding for the emulated root hub.
//!
//! The raw (typeReq, wValue, wIndex, wLength) quadruple from the bus stack's
//! hub-control path is decoded into [HubRequest] before any register is
//! touched; anything malformed or unsupported fails the decode and surfaces
//! to the bus stack as a protocol stall with no partial effects.

use crate::bits::{
    self, HubFeature, PortChange, PortFeature, PortStatus, DT_HUB,
    HUB_CHARACTERISTICS,
};
use crate::port::PortId;
use crate::Error;

/// A decoded hub class control request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HubRequest {
    ClearHubFeature(HubFeature),
    SetHubFeature(HubFeature),
    ClearPortFeature(PortId, PortFeature),
    SetPortFeature(PortId, PortFeature),
    GetHubDescriptor { length: u16 },
    GetHubStatus,
    GetPortStatus(PortId),
}

impl HubRequest {
    /// Decode a raw hub class control request, stalling on anything the root
    /// hub does not implement.
    pub fn decode(
        type_req: u16,
        value: u16,
        index: u16,
        length: u16,
    ) -> Result<Self, Error> {
        match type_req {
            bits::CLEAR_HUB_FEATURE | bits::SET_HUB_FEATURE => {
                if index != 0 || length != 0 {
                    return Err(Error::Protocol);
                }
                let feature =
                    HubFeature::from_repr(value).ok_or(Error::Protocol)?;
                if type_req == bits::CLEAR_HUB_FEATURE {
                    Ok(Self::ClearHubFeature(feature))
                } else {
                    Ok(Self::SetHubFeature(feature))
                }
            }
            bits::CLEAR_PORT_FEATURE | bits::SET_PORT_FEATURE => {
                if length != 0 || index > u8::MAX as u16 {
                    return Err(Error::Protocol);
                }
                let port = PortId::try_from(index as u8)
                    .map_err(|_| Error::Protocol)?;
                let feature =
                    PortFeature::from_repr(value).ok_or(Error::Protocol)?;
                if type_req == bits::CLEAR_PORT_FEATURE {
                    Ok(Self::ClearPortFeature(port, feature))
                } else {
                    Ok(Self::SetPortFeature(port, feature))
                }
            }
            bits::GET_HUB_DESCRIPTOR => {
                if index != 0 {
                    return Err(Error::Protocol);
                }
                Ok(Self::GetHubDescriptor { length })
            }
            bits::GET_HUB_STATUS => {
                if value != 0 || index != 0 || length != 4 {
                    return Err(Error::Protocol);
                }
                Ok(Self::GetHubStatus)
            }
            bits::GET_PORT_STATUS => {
                if value != 0 || length != 4 || index > u8::MAX as u16 {
                    return Err(Error::Protocol);
                }
                let port = PortId::try_from(index as u8)
                    .map_err(|_| Error::Protocol)?;
                Ok(Self::GetPortStatus(port))
            }
            _ => Err(Error::Protocol),
        }
    }
}

/// Reply to a successfully executed [HubRequest].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HubReply {
    /// Accepted with nothing to return.
    Ack,
    HubDescriptor(Vec<u8>),
    HubStatus { status: u16, change: u16 },
    PortStatus { status: PortStatus, change: PortChange },
}

/// Build the hub descriptor (USB 2.0 sect 11.23.2.1), truncated to the
/// requested length. DeviceRemovable reports every port removable; the
/// power control mask is all-ones per USB 2.0 table 11-13.
pub(crate) fn hub_descriptor(port_count: u8, length: u16) -> Vec<u8> {
    let var_bytes = (port_count as usize / 8) + 1;
    let total = 7 + 2 * var_bytes;
    let mut desc = vec![0u8; total];
    desc[0] = total as u8;
    desc[1] = DT_HUB;
    desc[2] = port_count;
    desc[3..5].copy_from_slice(&HUB_CHARACTERISTICS.to_le_bytes());
    // bPwrOn2PwrGood and bHubContrCurrent stay zero: power is virtual
    for byte in desc[7..].iter_mut() {
        *byte = 0xff;
    }
    desc.truncate(length as usize);
    desc
}
