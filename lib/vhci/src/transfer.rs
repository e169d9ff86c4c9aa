// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transfer records: one in-flight request each, owning its buffer and a
//! write-once completion status.

use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};
use strum::FromRepr;

use crate::bits::{SetupPacket, TransferFlags};
use crate::Error;

/// Stable identity of one in-flight transfer. Handles are allocated by the
/// controller at submission and remain valid until give-back; the worker
/// refers to transfers exclusively by handle across the process boundary.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct UrbHandle(NonZeroU64);

impl UrbHandle {
    pub(crate) fn new(raw: NonZeroU64) -> Self {
        Self(raw)
    }

    pub fn as_raw(&self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for UrbHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0.get())
    }
}

/// Direction of the data stage, from the host's point of view.
#[derive(FromRepr, Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Direction {
    Out = 0,
    In = 1,
}

/// USB transfer types.
#[derive(FromRepr, Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransferType {
    Isochronous = 0,
    Interrupt = 1,
    Control = 2,
    Bulk = 3,
}

/// Final disposition of a transfer, decided exactly once per record and
/// reported to the submitter at give-back.
#[derive(FromRepr, Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum TransferStatus {
    Success = 0,
    /// Endpoint stalled.
    Stall = 1,
    /// The emulated device did not respond.
    NoResponse = 2,
    /// The device kept transmitting past the end of the packet.
    Babble = 3,
    /// The device sent more data than the submitter's buffer holds.
    Overrun = 4,
    /// The transfer ended short with SHORT_NOT_OK set.
    Underrun = 5,
    /// Malformed request or reply; reported to the submitter as a stall.
    ProtocolError = 6,
    Canceled = 7,
    /// The controller was torn down with the transfer still in flight.
    Shutdown = 8,
}

/// Sentinel stored in a [StatusCell] that has not been finalized.
const PENDING: i64 = -1;

/// Write-once completion status. The first finalizer (cancellation or
/// completion path) decides the final status; later writes are no-ops. This
/// is what makes a give-back racing a cancellation converge on one outcome.
pub struct StatusCell(AtomicI64);

impl StatusCell {
    pub fn new() -> Self {
        Self(AtomicI64::new(PENDING))
    }

    /// Record `status` if no status has been recorded yet. Returns the status
    /// that actually stuck, whether `status` or an earlier winner's.
    pub fn finalize(&self, status: TransferStatus) -> TransferStatus {
        match self.0.compare_exchange(
            PENDING,
            status as i64,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => status,
            Err(prior) => {
                TransferStatus::from_repr(prior as i32).unwrap_or(status)
            }
        }
    }

    /// The recorded status, if any finalizer has run.
    pub fn get(&self) -> Option<TransferStatus> {
        let raw = self.0.load(Ordering::Acquire);
        if raw == PENDING {
            None
        } else {
            TransferStatus::from_repr(raw as i32)
        }
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

/// One transfer request as submitted by the bus stack. The controller owns
/// the buffer from submission until give-back hands it back.
#[derive(Debug)]
pub struct Urb {
    /// Device address on the emulated bus.
    pub address: u8,
    /// Endpoint number (0-15). The direction is carried separately.
    pub endpoint: u8,
    pub direction: Direction,
    pub transfer_type: TransferType,
    pub flags: TransferFlags,
    /// Declared transfer length in bytes. For inbound transfers this is the
    /// buffer capacity; for outbound ones, the payload size.
    pub buffer_length: usize,
    /// Transfer data. `None` models a request submitted without a buffer,
    /// which is only legal when `buffer_length` is zero.
    pub buffer: Option<Vec<u8>>,
    /// Bytes actually transferred; meaningful once the record is given back.
    pub actual_length: usize,
    /// Setup stage header; control transfers only.
    pub setup: Option<SetupPacket>,
    /// Polling interval for periodic transfers.
    pub interval: i32,
}

impl Urb {
    /// Direction of the data stage. Control transfers encode it in the setup
    /// packet rather than the endpoint.
    pub fn data_direction(&self) -> Direction {
        match (self.transfer_type, &self.setup) {
            (TransferType::Control, Some(setup)) => {
                if setup.device_to_host() {
                    Direction::In
                } else {
                    Direction::Out
                }
            }
            _ => self.direction,
        }
    }

    /// The length the worker is asked to transfer: wLength for control
    /// transfers, the declared buffer length otherwise.
    pub fn wire_length(&self) -> usize {
        match (self.transfer_type, &self.setup) {
            (TransferType::Control, Some(setup)) => setup.length() as usize,
            _ => self.buffer_length,
        }
    }
}

/// Everything the worker needs to execute one transfer, reported by
/// fetch-work.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferDescriptor {
    pub handle: UrbHandle,
    pub address: u8,
    /// Endpoint number with the direction in bit 7, as on the wire.
    pub endpoint: u8,
    pub transfer_type: TransferType,
    pub flags: TransferFlags,
    /// Bytes to transfer: wLength for control transfers, the declared
    /// buffer length otherwise.
    pub buffer_length: u32,
    pub setup: Option<SetupPacket>,
    pub interval: i32,
}

impl TransferDescriptor {
    /// Validate a fetched record and build the descriptor the worker sees.
    ///
    /// Control transfers must carry a setup packet whose wLength fits the
    /// declared buffer, with a buffer present whenever the data stage moves
    /// bytes; other types must have a buffer consistent with their
    /// direction. A malformed record is never dispatched.
    pub(crate) fn from_urb(handle: UrbHandle, urb: &Urb) -> Result<Self, Error> {
        let buffer_length = match urb.transfer_type {
            TransferType::Control => {
                let setup = urb.setup.ok_or(Error::Protocol)?;
                let len = setup.length() as usize;
                if len > urb.buffer_length {
                    return Err(Error::Protocol);
                }
                if setup.device_to_host() {
                    if len == 0 || urb.buffer.is_none() {
                        return Err(Error::Protocol);
                    }
                } else if len > 0 && urb.buffer.is_none() {
                    return Err(Error::Protocol);
                }
                len
            }
            _ => {
                match urb.direction {
                    Direction::In => {
                        if urb.buffer_length == 0 || urb.buffer.is_none() {
                            return Err(Error::Protocol);
                        }
                    }
                    Direction::Out => {
                        if urb.buffer_length > 0 && urb.buffer.is_none() {
                            return Err(Error::Protocol);
                        }
                    }
                }
                urb.buffer_length
            }
        };

        let dir_bit = match urb.direction {
            Direction::In => 0x80,
            Direction::Out => 0,
        };
        Ok(Self {
            handle,
            address: urb.address,
            endpoint: urb.endpoint | dir_bit,
            transfer_type: urb.transfer_type,
            flags: urb.flags,
            buffer_length: buffer_length as u32,
            setup: match urb.transfer_type {
                TransferType::Control => urb.setup,
                _ => None,
            },
            interval: urb.interval,
        })
    }
}

/// Lifecycle state of a record, naming the queue that owns it. A record is
/// in exactly one state (and one queue) at any time.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UrbState {
    /// Submitted, not yet fetched by the worker.
    Inbox,
    /// Fetched by the worker, awaiting give-back.
    Fetched,
    /// Cancellation requested; the worker has not seen it yet.
    CancelPending,
    /// The worker has been told to abandon the transfer.
    CancelAcked,
}

/// Arena entry tying a submitted [Urb] to its handle, lifecycle state, and
/// completion status.
pub(crate) struct TransferRecord {
    pub handle: UrbHandle,
    pub urb: Urb,
    pub status: StatusCell,
    pub state: UrbState,
}

impl TransferRecord {
    pub(crate) fn new(handle: UrbHandle, urb: Urb) -> Self {
        Self { handle, urb, status: StatusCell::new(), state: UrbState::Inbox }
    }
}
