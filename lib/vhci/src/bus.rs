// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The seam between the controller engine and the bus-stack integration
//! layer that sits above it.

use crate::transfer::{TransferStatus, Urb, UrbHandle};
use crate::Error;

/// Callbacks into the bus-stack integration layer.
///
/// [`link_urb`], [`check_unlink`], and [`unlink_urb`] maintain the
/// per-endpoint bookkeeping the bus framework uses for cancellation
/// fairness. They are invoked with the controller lock held and must not
/// call back into the controller. [`giveback`] is invoked with the lock
/// released, after the record has been unlinked from every queue, and may
/// reenter the controller freely (e.g. to resubmit).
///
/// [`link_urb`]: UsbBus::link_urb
/// [`check_unlink`]: UsbBus::check_unlink
/// [`unlink_urb`]: UsbBus::unlink_urb
/// [`giveback`]: UsbBus::giveback
pub trait UsbBus: Send + Sync + 'static {
    /// Endpoint bookkeeping at submission. An error rejects the submission
    /// before the transfer reaches any queue.
    fn link_urb(&self, handle: UrbHandle, urb: &Urb) -> Result<(), Error>;

    /// Cancellation pre-check, making double-cancel idempotent: an error
    /// here (transfer already unlinking, or never submitted) aborts the
    /// cancel.
    fn check_unlink(&self, handle: UrbHandle) -> Result<(), Error>;

    /// Endpoint bookkeeping teardown, just before give-back.
    fn unlink_urb(&self, handle: UrbHandle);

    /// Final delivery of a completed transfer. Buffer ownership returns to
    /// the submitter here. Called exactly once per submitted transfer.
    fn giveback(&self, handle: UrbHandle, urb: Urb, status: TransferStatus);

    /// Some port has unacknowledged change bits; kick the periodic root-hub
    /// status poll.
    fn poll_root_hub(&self);

    /// A status poll found pending changes while the root hub was
    /// suspended; ask the bus stack to resume it.
    fn resume_root_hub(&self);
}
