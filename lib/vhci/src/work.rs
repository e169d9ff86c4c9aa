// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The worker-facing work-exchange surface.
//!
//! The worker process drains the controller through a [WorkerHandle]:
//! [fetch_work] blocks for the next unit of work (cancellation notice, port
//! update, or new transfer, in that priority order), [giveback] completes a
//! transfer, [fetch_payload] retrieves outbound request data, and
//! [report_port_status] feeds observed electrical transitions back into the
//! port registers.
//!
//! [fetch_work]: WorkerHandle::fetch_work
//! [giveback]: WorkerHandle::giveback
//! [fetch_payload]: WorkerHandle::fetch_payload
//! [report_port_status]: WorkerHandle::report_port_status

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use pin_project_lite::pin_project;
use serde::{Deserialize, Serialize};
use tokio::sync::futures::Notified;

use crate::bits::{PortChange, PortStatus};
use crate::controller::{RootHubState, VhciHcd, VhciState};
use crate::port::{ChangeReason, PortId};
use crate::transfer::{
    Direction, TransferDescriptor, TransferRecord, TransferStatus, UrbHandle,
    UrbState,
};
use crate::{Error, WORK_POLL_TIMEOUT};

#[usdt::provider(provider = "vhci")]
mod probes {
    fn work_fetch(instance: u32, kind: &str) {}
}

/// One unit of work handed to the worker by [WorkerHandle::fetch_work].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkItem {
    /// A previously fetched transfer must be abandoned. The worker is
    /// expected to give it back (and will see `WasCanceled`).
    Cancel { handle: UrbHandle },
    /// A port's registers changed since the worker last saw them.
    PortUpdate(PortStatusUpdate),
    /// A new transfer to execute against the emulated device.
    Transfer(TransferDescriptor),
}

/// Snapshot of one port's registers, delivered through fetch-work.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortStatusUpdate {
    pub port: PortId,
    pub status: PortStatus,
    pub change: PortChange,
    /// A suspend-to-running transition is pending completion; the worker
    /// finishes it by reporting a suspend change.
    pub resuming: bool,
}

/// Why no work item was returned.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FetchWorkError {
    /// No work is currently pending (non-blocking path only).
    #[error("no work pending")]
    NonePending,
    /// No work arrived within the poll window.
    #[error("no work within the poll window")]
    TimedOut,
    /// The wait was aborted by [WorkerHandle::interrupt].
    #[error("wait interrupted")]
    Interrupted,
    /// The controller is stopped or being torn down.
    #[error("controller shut down")]
    Shutdown,
}

/// How a give-back concluded.
#[must_use]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Giveback {
    /// The transfer completed with the worker-supplied status.
    Completed,
    /// The give-back raced a cancellation; the staged cancel status won.
    /// Informational, not a failure.
    WasCanceled,
}

/// Outcome of a payload fetch.
#[must_use]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PayloadFetch {
    /// Payload bytes copied into the destination.
    Copied(usize),
    /// The transfer was canceled before its payload was fetched; the record
    /// has been given back.
    WasCanceled,
}

/// The worker process's side of one controller instance.
///
/// Closing (or dropping) the handle tears the controller down, giving every
/// in-flight transfer back as a shutdown failure.
pub struct WorkerHandle {
    hcd: Arc<VhciHcd>,
}

impl WorkerHandle {
    pub(crate) fn new(hcd: Arc<VhciHcd>) -> Self {
        Self { hcd }
    }

    /// The controller this handle drains.
    pub fn controller(&self) -> &Arc<VhciHcd> {
        &self.hcd
    }

    /// Block for the next unit of work, with the standard poll timeout.
    pub fn fetch_work(&self) -> Result<WorkItem, FetchWorkError> {
        self.fetch_work_timeout(WORK_POLL_TIMEOUT)
    }

    /// Block for the next unit of work for at most `timeout`.
    ///
    /// Cancellation notices are dispatched before port updates, and port
    /// updates before new transfers, so a stuck cancellation cannot be
    /// starved by a busy inbox.
    pub fn fetch_work_timeout(
        &self,
        timeout: Duration,
    ) -> Result<WorkItem, FetchWorkError> {
        let hcd = &self.hcd;
        let deadline = Instant::now() + timeout;
        let mut state = hcd.state.lock().unwrap();
        loop {
            if state.rh_state == RootHubState::Reset {
                return Err(FetchWorkError::Shutdown);
            }
            if state.interrupted {
                state.interrupted = false;
                return Err(FetchWorkError::Interrupted);
            }
            if VhciHcd::has_work(&state) {
                let (item, rejects) = take_work(hcd, &mut state);
                if item.is_some() || !rejects.is_empty() {
                    drop(state);
                    for record in rejects {
                        hcd.deliver(record);
                    }
                    match item {
                        Some(work) => return Ok(work),
                        // everything pending was malformed; wait on
                        None => state = hcd.state.lock().unwrap(),
                    }
                    continue;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(FetchWorkError::TimedOut);
            }
            let (guard, _timeout_result) =
                hcd.cv.wait_timeout(state, deadline - now).unwrap();
            state = guard;
        }
    }

    /// Take the next work item if one is immediately available.
    pub fn next_work(&self) -> Result<WorkItem, FetchWorkError> {
        let hcd = &self.hcd;
        let mut state = hcd.state.lock().unwrap();
        if state.rh_state == RootHubState::Reset {
            return Err(FetchWorkError::Shutdown);
        }
        let (item, rejects) = take_work(hcd, &mut state);
        drop(state);
        for record in rejects {
            hcd.deliver(record);
        }
        item.ok_or(FetchWorkError::NonePending)
    }

    /// Wait (via a [Future]) for the next work item. Resolves to [None]
    /// when the controller shuts down.
    pub fn wait_for_work(&self) -> WaitForWork<'_> {
        WaitForWork { worker: self, wait: self.hcd.work_notifier.notified() }
    }

    /// Abort any in-progress [fetch_work](Self::fetch_work) wait; it
    /// returns [FetchWorkError::Interrupted]. No pending work is consumed.
    pub fn interrupt(&self) {
        let mut state = self.hcd.state.lock().unwrap();
        state.interrupted = true;
        self.hcd.cv.notify_all();
    }

    /// Complete a previously fetched transfer.
    ///
    /// `payload` carries the received data for inbound transfers and must
    /// be absent for outbound ones. If the transfer was canceled while the
    /// worker held it, the give-back still consumes the record but reports
    /// [Giveback::WasCanceled], and the staged cancellation status wins.
    pub fn giveback(
        &self,
        handle: UrbHandle,
        status: TransferStatus,
        actual: usize,
        payload: Option<&[u8]>,
    ) -> Result<Giveback, Error> {
        let hcd = &self.hcd;
        let mut state = hcd.state.lock().unwrap();
        let record_state = match state.queues.state_of(handle) {
            // inbox records were never dispatched; the worker cannot know
            // this handle
            None | Some(UrbState::Inbox) => {
                return Err(Error::NotFound(handle))
            }
            Some(other) => other,
        };
        let was_canceled = matches!(
            record_state,
            UrbState::CancelPending | UrbState::CancelAcked
        );

        let (direction, requested, has_buffer) = {
            let record = state
                .queues
                .get(handle)
                .expect("record state was just observed");
            (
                record.urb.data_direction(),
                record.urb.buffer_length,
                record.urb.buffer.is_some(),
            )
        };

        if actual > requested {
            let (forced, err) = match direction {
                Direction::In => (TransferStatus::Overrun, Error::Overrun),
                Direction::Out => (
                    TransferStatus::ProtocolError,
                    Error::InvalidArgument("actual length exceeds requested"),
                ),
            };
            return Err(self.fail_giveback(state, handle, forced, err));
        }

        match direction {
            Direction::In => {
                if actual > 0 {
                    let Some(data) = payload else {
                        return Err(self.fail_giveback(
                            state,
                            handle,
                            TransferStatus::ProtocolError,
                            Error::InvalidArgument(
                                "payload required for inbound give-back",
                            ),
                        ));
                    };
                    if data.len() < actual {
                        return Err(self.fail_giveback(
                            state,
                            handle,
                            TransferStatus::ProtocolError,
                            Error::InvalidArgument(
                                "payload shorter than actual length",
                            ),
                        ));
                    }
                    if !has_buffer {
                        return Err(self.fail_giveback(
                            state,
                            handle,
                            TransferStatus::ProtocolError,
                            Error::InvalidArgument(
                                "inbound transfer has no buffer",
                            ),
                        ));
                    }
                    if let Some(record) = state.queues.get_mut(handle) {
                        if let Some(buffer) = record.urb.buffer.as_mut() {
                            buffer[..actual].copy_from_slice(&data[..actual]);
                        }
                    }
                }
            }
            Direction::Out => {
                if payload.is_some() {
                    return Err(self.fail_giveback(
                        state,
                        handle,
                        TransferStatus::ProtocolError,
                        Error::InvalidArgument(
                            "unexpected payload for outbound give-back",
                        ),
                    ));
                }
            }
        }

        if let Some(record) = state.queues.get_mut(handle) {
            record.urb.actual_length = actual;
            record.status.finalize(status);
        }
        if let Some(record) = state.queues.remove(handle) {
            hcd.bus.unlink_urb(handle);
            drop(state);
            hcd.deliver(record);
        }
        Ok(if was_canceled { Giveback::WasCanceled } else { Giveback::Completed })
    }

    /// Copy an outbound transfer's request payload (wLength bytes for
    /// control transfers) into `dest`, returning the byte count.
    pub fn fetch_payload(
        &self,
        handle: UrbHandle,
        dest: &mut [u8],
    ) -> Result<PayloadFetch, Error> {
        let hcd = &self.hcd;
        let mut state = hcd.state.lock().unwrap();
        match state.queues.state_of(handle) {
            None | Some(UrbState::Inbox) => {
                return Err(Error::NotFound(handle))
            }
            Some(UrbState::CancelPending) | Some(UrbState::CancelAcked) => {
                // the worker has now observed the cancellation; the record
                // is done
                if let Some(record) = state.queues.remove(handle) {
                    record.status.finalize(TransferStatus::Canceled);
                    hcd.bus.unlink_urb(handle);
                    drop(state);
                    hcd.deliver(record);
                }
                return Ok(PayloadFetch::WasCanceled);
            }
            Some(UrbState::Fetched) => {}
        }

        let record = state
            .queues
            .get(handle)
            .expect("record state was just observed");
        let len = record.urb.wire_length();
        if record.urb.data_direction() == Direction::In
            || len == 0
            || record.urb.buffer.is_none()
        {
            return Err(Error::NoData);
        }
        if dest.len() < len {
            return Err(Error::BufferTooSmall);
        }
        let buffer = record
            .urb
            .buffer
            .as_ref()
            .expect("buffer presence was just checked");
        dest[..len].copy_from_slice(&buffer[..len]);
        Ok(PayloadFetch::Copied(len))
    }

    /// Report an observed electrical transition for one port.
    pub fn report_port_status(
        &self,
        port: PortId,
        reported: PortStatus,
        reason: ChangeReason,
    ) -> Result<(), Error> {
        let hcd = &self.hcd;
        let mut state = hcd.state.lock().unwrap();
        if port.as_index() >= state.ports.len() {
            return Err(Error::PortOutOfRange(port.as_raw_id()));
        }
        state.ports[port.as_index()].apply_report(reported, reason)?;
        slog::debug!(hcd.log, "port status reported"; "port" => %port,
            "reason" => ?reason, "status" => ?reported);
        hcd.flag_port_update(&mut state, port);
        drop(state);
        hcd.bus.poll_root_hub();
        Ok(())
    }

    /// Tear the controller instance down, failing out every in-flight
    /// transfer as a shutdown error. Equivalent to dropping the handle.
    pub fn close(&self) {
        self.hcd.stop();
    }

    fn fail_giveback(
        &self,
        mut state: std::sync::MutexGuard<'_, VhciState>,
        handle: UrbHandle,
        forced: TransferStatus,
        err: Error,
    ) -> Error {
        if let Some(record) = state.queues.remove(handle) {
            record.status.finalize(forced);
            self.hcd.bus.unlink_urb(handle);
            drop(state);
            self.hcd.deliver(record);
        }
        err
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.hcd.stop();
    }
}

/// Dispatch the next unit of work, in priority order. Returns the work item
/// (if any) plus malformed inbox records that must be given back once the
/// lock is released; those have already been unlinked and finalized with a
/// protocol error.
fn take_work(
    hcd: &VhciHcd,
    state: &mut VhciState,
) -> (Option<WorkItem>, Vec<TransferRecord>) {
    // cancellations first: they bound the worker-side backlog a stuck
    // cancel would otherwise grow
    if let Some(handle) = state.queues.cancel_head() {
        state.queues.move_to(handle, UrbState::CancelAcked);
        probes::work_fetch!(|| (hcd.instance_id(), "cancel"));
        slog::debug!(hcd.log, "cancel dispatched"; "handle" => %handle);
        return (Some(WorkItem::Cancel { handle }), Vec::new());
    }

    // then port updates, round-robin from the cursor
    if state.port_update != 0 && !state.ports.is_empty() {
        let count = state.ports.len();
        if state.port_sched_offset as usize >= count {
            state.port_sched_offset = 0;
        }
        for step in 0..count {
            let index = (step + state.port_sched_offset as usize) % count;
            let bit = 1u32 << index;
            if state.port_update & bit != 0 {
                state.port_update &= !bit;
                state.port_sched_offset = (index + 1) as u8;
                let port = &state.ports[index];
                let update = PortStatusUpdate {
                    port: PortId::from_index(index),
                    status: port.status(),
                    change: port.change(),
                    resuming: port.resuming(),
                };
                probes::work_fetch!(|| (hcd.instance_id(), "port"));
                slog::debug!(hcd.log, "port update dispatched";
                    "port" => %update.port, "status" => ?update.status,
                    "change" => ?update.change);
                return (Some(WorkItem::PortUpdate(update)), Vec::new());
            }
        }
    }

    // finally new transfers, discarding malformed ones as they surface
    let mut rejects = Vec::new();
    while let Some(handle) = state.queues.inbox_head() {
        let descriptor = state
            .queues
            .get(handle)
            .map(|record| TransferDescriptor::from_urb(handle, &record.urb));
        match descriptor {
            Some(Ok(descriptor)) => {
                state.queues.move_to(handle, UrbState::Fetched);
                probes::work_fetch!(|| (hcd.instance_id(), "transfer"));
                return (Some(WorkItem::Transfer(descriptor)), rejects);
            }
            Some(Err(_)) => {
                if let Some(record) = state.queues.remove(handle) {
                    slog::debug!(hcd.log, "discarding malformed transfer";
                        "handle" => %handle);
                    record.status.finalize(TransferStatus::ProtocolError);
                    hcd.bus.unlink_urb(handle);
                    rejects.push(record);
                }
            }
            None => break,
        }
    }

    (None, rejects)
}

pin_project! {
    /// Future returned from [WorkerHandle::wait_for_work].
    ///
    /// Not fused: poll it repeatedly for additional work items as they
    /// become available.
    pub struct WaitForWork<'a> {
        worker: &'a WorkerHandle,
        #[pin]
        wait: Notified<'a>,
    }
}

impl Future for WaitForWork<'_> {
    type Output = Option<WorkItem>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        loop {
            match this.worker.next_work() {
                Ok(item) => return Poll::Ready(Some(item)),
                Err(FetchWorkError::Shutdown) => return Poll::Ready(None),
                Err(_) => {
                    if let Poll::Ready(_) = Notified::poll(this.wait.as_mut(), cx)
                    {
                        // the `Notified` future is fused; refresh it before
                        // polling again, then take another lap in case work
                        // arrived with the notification
                        this.wait.set(
                            this.worker.hcd.work_notifier.notified(),
                        );
                        continue;
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bits::{PortFeature, SetupPacket, TransferFlags};
    use crate::hub::{HubReply, HubRequest};
    use crate::testutil::{test_hcd, Completion};
    use crate::transfer::{TransferType, Urb};
    use crossbeam_channel::Receiver;
    use std::thread;

    const SHORT: Duration = Duration::from_millis(20);
    const LONG: Duration = Duration::from_secs(5);

    fn bulk(direction: Direction, len: usize) -> Urb {
        Urb {
            address: 1,
            endpoint: 2,
            direction,
            transfer_type: TransferType::Bulk,
            flags: TransferFlags::empty(),
            buffer_length: len,
            buffer: Some(vec![0; len]),
            actual_length: 0,
            setup: None,
            interval: 0,
        }
    }

    fn control(setup: SetupPacket, buffer: Vec<u8>) -> Urb {
        Urb {
            address: 0,
            endpoint: 0,
            direction: if setup.device_to_host() {
                Direction::In
            } else {
                Direction::Out
            },
            transfer_type: TransferType::Control,
            flags: TransferFlags::empty(),
            buffer_length: buffer.len(),
            buffer: Some(buffer),
            actual_length: 0,
            setup: Some(setup),
            interval: 0,
        }
    }

    fn expect_transfer(item: WorkItem) -> TransferDescriptor {
        match item {
            WorkItem::Transfer(descriptor) => descriptor,
            other => panic!("expected a transfer, got {other:?}"),
        }
    }

    fn expect_port_update(item: WorkItem) -> PortStatusUpdate {
        match item {
            WorkItem::PortUpdate(update) => update,
            other => panic!("expected a port update, got {other:?}"),
        }
    }

    fn recv(completions: &Receiver<Completion>) -> Completion {
        completions.recv_timeout(LONG).expect("completion expected")
    }

    fn power_on(hcd: &VhciHcd, raw_port: u8) {
        let port = PortId::try_from(raw_port).unwrap();
        match hcd
            .hub_control(HubRequest::SetPortFeature(port, PortFeature::Power))
            .unwrap()
        {
            HubReply::Ack => (),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn end_to_end_control_transfer() {
        let (hcd, _bus, completions) = test_hcd(1);
        let worker = hcd.worker_handle();

        let setup = SetupPacket::from_bytes([
            0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x04, 0x00,
        ]);
        let handle = hcd.urb_enqueue(control(setup, vec![0; 4])).unwrap();

        let descriptor = expect_transfer(worker.fetch_work().unwrap());
        assert_eq!(descriptor.handle, handle);
        assert_eq!(descriptor.buffer_length, 4);
        assert_eq!(descriptor.transfer_type, TransferType::Control);
        assert_eq!(descriptor.setup, Some(setup));

        let outcome = worker
            .giveback(
                handle,
                TransferStatus::Success,
                4,
                Some(&[0x12, 0x01, 0x00, 0x02]),
            )
            .unwrap();
        assert_eq!(outcome, Giveback::Completed);

        let (done, urb, status) = recv(&completions);
        assert_eq!(done, handle);
        assert_eq!(status, TransferStatus::Success);
        assert_eq!(urb.actual_length, 4);
        assert_eq!(urb.buffer.as_deref(), Some(&[0x12, 0x01, 0x00, 0x02][..]));
    }

    #[test]
    fn port_power_produces_port_update() {
        let (hcd, _bus, _completions) = test_hcd(4);
        let worker = hcd.worker_handle();
        power_on(&hcd, 2);

        let update = expect_port_update(worker.fetch_work().unwrap());
        assert_eq!(update.port.as_raw_id(), 2);
        assert_eq!(update.status, PortStatus::POWER);
        assert!(update.change.is_empty());
        assert!(!update.resuming);

        // the update was consumed; nothing else is pending
        assert_eq!(
            worker.fetch_work_timeout(SHORT),
            Err(FetchWorkError::TimedOut)
        );
    }

    #[test]
    fn cancel_after_fetch_routes_through_worker() {
        let (hcd, _bus, completions) = test_hcd(1);
        let worker = hcd.worker_handle();

        let handle = hcd.urb_enqueue(bulk(Direction::Out, 8)).unwrap();
        let _ = expect_transfer(worker.fetch_work().unwrap());

        hcd.urb_dequeue(handle, TransferStatus::Canceled).unwrap();
        // no completion yet: the worker must observe the cancel first
        assert!(completions.try_recv().is_err());

        match worker.fetch_work().unwrap() {
            WorkItem::Cancel { handle: canceled } => {
                assert_eq!(canceled, handle)
            }
            other => panic!("expected a cancel notice, got {other:?}"),
        }

        let outcome = worker
            .giveback(handle, TransferStatus::Success, 0, None)
            .unwrap();
        assert_eq!(outcome, Giveback::WasCanceled);

        // the staged cancellation status won the race
        let (_, _, status) = recv(&completions);
        assert_eq!(status, TransferStatus::Canceled);
    }

    #[test]
    fn cancel_notices_precede_all_other_work() {
        let (hcd, _bus, _completions) = test_hcd(2);
        let worker = hcd.worker_handle();

        let first = hcd.urb_enqueue(bulk(Direction::Out, 4)).unwrap();
        let _ = expect_transfer(worker.fetch_work().unwrap());

        // queue up competing work of both other kinds, then cancel
        hcd.urb_enqueue(bulk(Direction::Out, 4)).unwrap();
        power_on(&hcd, 1);
        hcd.urb_dequeue(first, TransferStatus::Canceled).unwrap();

        match worker.fetch_work().unwrap() {
            WorkItem::Cancel { handle } => assert_eq!(handle, first),
            other => panic!("cancel must come first, got {other:?}"),
        }
        let _ = expect_port_update(worker.fetch_work().unwrap());
        let _ = expect_transfer(worker.fetch_work().unwrap());
    }

    #[test]
    fn port_updates_rotate_fairly() {
        let (hcd, _bus, _completions) = test_hcd(4);
        let worker = hcd.worker_handle();
        for raw in 1..=4 {
            power_on(&hcd, raw);
        }

        let update = expect_port_update(worker.fetch_work().unwrap());
        assert_eq!(update.port.as_raw_id(), 1);

        // re-flag port 1 right away; the cursor keeps it behind the others
        let port1 = PortId::try_from(1).unwrap();
        hcd.hub_control(HubRequest::SetPortFeature(
            port1,
            PortFeature::CConnection,
        ))
        .unwrap();

        let order: Vec<u8> = (0..4)
            .map(|_| {
                expect_port_update(worker.fetch_work().unwrap())
                    .port
                    .as_raw_id()
            })
            .collect();
        assert_eq!(order, vec![2, 3, 4, 1]);
    }

    #[test]
    fn malformed_inbox_records_are_discarded() {
        let (hcd, _bus, completions) = test_hcd(1);
        let worker = hcd.worker_handle();

        // control transfer with no setup packet: passes submission, fails
        // dispatch validation
        let malformed = hcd
            .urb_enqueue(Urb {
                address: 1,
                endpoint: 0,
                direction: Direction::In,
                transfer_type: TransferType::Control,
                flags: TransferFlags::empty(),
                buffer_length: 4,
                buffer: Some(vec![0; 4]),
                actual_length: 0,
                setup: None,
                interval: 0,
            })
            .unwrap();
        let good = hcd.urb_enqueue(bulk(Direction::Out, 4)).unwrap();

        // one fetch skips the malformed record and returns the next one
        let descriptor = expect_transfer(worker.fetch_work().unwrap());
        assert_eq!(descriptor.handle, good);

        let (done, _, status) = recv(&completions);
        assert_eq!(done, malformed);
        assert_eq!(status, TransferStatus::ProtocolError);
    }

    #[test]
    fn giveback_is_exactly_once() {
        let (hcd, _bus, completions) = test_hcd(1);
        let worker = hcd.worker_handle();

        let handle = hcd.urb_enqueue(bulk(Direction::Out, 4)).unwrap();
        let _ = expect_transfer(worker.fetch_work().unwrap());

        let outcome = worker
            .giveback(handle, TransferStatus::Success, 4, None)
            .unwrap();
        assert_eq!(outcome, Giveback::Completed);
        let _ = recv(&completions);

        assert_eq!(
            worker.giveback(handle, TransferStatus::Success, 4, None),
            Err(Error::NotFound(handle))
        );
        assert!(completions.try_recv().is_err());
    }

    #[test]
    fn unfetched_handles_are_unknown_to_the_worker() {
        let (hcd, _bus, _completions) = test_hcd(1);
        let worker = hcd.worker_handle();
        let handle = hcd.urb_enqueue(bulk(Direction::Out, 4)).unwrap();
        // still in the inbox: the worker has never seen this handle
        assert_eq!(
            worker.giveback(handle, TransferStatus::Success, 0, None),
            Err(Error::NotFound(handle))
        );
    }

    #[test]
    fn overlong_giveback_forces_error_status() {
        let (hcd, _bus, completions) = test_hcd(1);
        let worker = hcd.worker_handle();

        let handle = hcd.urb_enqueue(bulk(Direction::In, 4)).unwrap();
        let _ = expect_transfer(worker.fetch_work().unwrap());

        assert_eq!(
            worker.giveback(
                handle,
                TransferStatus::Success,
                8,
                Some(&[0; 8])
            ),
            Err(Error::Overrun)
        );
        let (_, _, status) = recv(&completions);
        assert_eq!(status, TransferStatus::Overrun);
    }

    #[test]
    fn inbound_giveback_requires_payload() {
        let (hcd, _bus, completions) = test_hcd(1);
        let worker = hcd.worker_handle();

        let handle = hcd.urb_enqueue(bulk(Direction::In, 4)).unwrap();
        let _ = expect_transfer(worker.fetch_work().unwrap());
        assert!(matches!(
            worker.giveback(handle, TransferStatus::Success, 4, None),
            Err(Error::InvalidArgument(_))
        ));
        let (_, _, status) = recv(&completions);
        assert_eq!(status, TransferStatus::ProtocolError);
    }

    #[test]
    fn outbound_giveback_rejects_payload() {
        let (hcd, _bus, completions) = test_hcd(1);
        let worker = hcd.worker_handle();

        let handle = hcd.urb_enqueue(bulk(Direction::Out, 4)).unwrap();
        let _ = expect_transfer(worker.fetch_work().unwrap());
        assert!(matches!(
            worker.giveback(
                handle,
                TransferStatus::Success,
                4,
                Some(&[0; 4])
            ),
            Err(Error::InvalidArgument(_))
        ));
        let (_, _, status) = recv(&completions);
        assert_eq!(status, TransferStatus::ProtocolError);
    }

    #[test]
    fn fetch_payload_returns_outbound_data() {
        let (hcd, _bus, completions) = test_hcd(1);
        let worker = hcd.worker_handle();

        // SET_DESCRIPTOR-shaped request with a 4-byte data stage
        let setup = SetupPacket::from_bytes([
            0x00, 0x07, 0x00, 0x02, 0x00, 0x00, 0x04, 0x00,
        ]);
        let handle =
            hcd.urb_enqueue(control(setup, vec![9, 8, 7, 6])).unwrap();
        let _ = expect_transfer(worker.fetch_work().unwrap());

        let mut dest = [0u8; 8];
        assert_eq!(
            worker.fetch_payload(handle, &mut dest).unwrap(),
            PayloadFetch::Copied(4)
        );
        assert_eq!(&dest[..4], &[9, 8, 7, 6]);

        let mut tiny = [0u8; 2];
        assert_eq!(
            worker.fetch_payload(handle, &mut tiny),
            Err(Error::BufferTooSmall)
        );

        let outcome = worker
            .giveback(handle, TransferStatus::Success, 4, None)
            .unwrap();
        assert_eq!(outcome, Giveback::Completed);
        let (_, _, status) = recv(&completions);
        assert_eq!(status, TransferStatus::Success);
    }

    #[test]
    fn fetch_payload_refuses_inbound_transfers() {
        let (hcd, _bus, _completions) = test_hcd(1);
        let worker = hcd.worker_handle();
        let handle = hcd.urb_enqueue(bulk(Direction::In, 4)).unwrap();
        let _ = expect_transfer(worker.fetch_work().unwrap());
        let mut dest = [0u8; 4];
        assert_eq!(
            worker.fetch_payload(handle, &mut dest),
            Err(Error::NoData)
        );
    }

    #[test]
    fn fetch_payload_observes_cancellation() {
        let (hcd, _bus, completions) = test_hcd(1);
        let worker = hcd.worker_handle();

        let handle = hcd.urb_enqueue(bulk(Direction::Out, 4)).unwrap();
        let _ = expect_transfer(worker.fetch_work().unwrap());
        hcd.urb_dequeue(handle, TransferStatus::Canceled).unwrap();

        let mut dest = [0u8; 4];
        assert_eq!(
            worker.fetch_payload(handle, &mut dest).unwrap(),
            PayloadFetch::WasCanceled
        );
        // observing the cancellation completed the record
        let (done, _, status) = recv(&completions);
        assert_eq!(done, handle);
        assert_eq!(status, TransferStatus::Canceled);
        assert_eq!(
            worker.fetch_payload(handle, &mut dest),
            Err(Error::NotFound(handle))
        );
    }

    #[test]
    fn fetch_work_times_out_when_idle() {
        let (hcd, _bus, _completions) = test_hcd(1);
        let worker = hcd.worker_handle();
        assert_eq!(
            worker.fetch_work_timeout(SHORT),
            Err(FetchWorkError::TimedOut)
        );
    }

    #[test]
    fn interrupt_is_distinct_from_timeout() {
        let (hcd, _bus, _completions) = test_hcd(1);
        let worker = Arc::new(hcd.worker_handle());

        let waiter = {
            let worker = worker.clone();
            thread::spawn(move || worker.fetch_work_timeout(LONG))
        };
        // the flag is sticky, so the wake cannot be lost no matter how the
        // threads interleave
        worker.interrupt();
        assert_eq!(waiter.join().unwrap(), Err(FetchWorkError::Interrupted));

        // the interrupt was consumed; the next wait times out normally
        assert_eq!(
            worker.fetch_work_timeout(SHORT),
            Err(FetchWorkError::TimedOut)
        );
    }

    #[test]
    fn submission_wakes_blocked_fetch() {
        let (hcd, _bus, _completions) = test_hcd(1);
        let worker = Arc::new(hcd.worker_handle());

        let waiter = {
            let worker = worker.clone();
            thread::spawn(move || worker.fetch_work_timeout(LONG))
        };
        thread::sleep(SHORT);
        let handle = hcd.urb_enqueue(bulk(Direction::Out, 4)).unwrap();
        let descriptor = expect_transfer(waiter.join().unwrap().unwrap());
        assert_eq!(descriptor.handle, handle);
    }

    #[test]
    fn close_fails_out_in_flight_transfers() {
        let (hcd, _bus, completions) = test_hcd(1);
        let worker = hcd.worker_handle();

        let fetched = hcd.urb_enqueue(bulk(Direction::Out, 4)).unwrap();
        let _ = expect_transfer(worker.fetch_work().unwrap());
        let queued = hcd.urb_enqueue(bulk(Direction::Out, 4)).unwrap();

        worker.close();

        let mut done = vec![recv(&completions), recv(&completions)];
        done.sort_by_key(|(handle, _, _)| handle.as_raw());
        assert_eq!(done[0].0, fetched);
        assert_eq!(done[1].0, queued);
        assert!(done.iter().all(|(_, _, s)| *s == TransferStatus::Shutdown));

        assert_eq!(worker.fetch_work(), Err(FetchWorkError::Shutdown));
    }

    #[test]
    fn wait_for_work_resolves_async() {
        let (hcd, _bus, _completions) = test_hcd(1);
        let worker = hcd.worker_handle();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let handle = hcd.urb_enqueue(bulk(Direction::Out, 4)).unwrap();
        let item = rt.block_on(worker.wait_for_work());
        let descriptor = expect_transfer(item.expect("work should be ready"));
        assert_eq!(descriptor.handle, handle);

        // shutdown resolves the future to None
        hcd.stop();
        assert_eq!(rt.block_on(worker.wait_for_work()), None);
    }

    #[test]
    fn report_port_status_validates_index() {
        let (hcd, _bus, _completions) = test_hcd(2);
        let worker = hcd.worker_handle();
        let port = PortId::try_from(3).unwrap();
        assert_eq!(
            worker.report_port_status(
                port,
                PortStatus::CONNECTION,
                ChangeReason::Connect
            ),
            Err(Error::PortOutOfRange(3))
        );
    }

    #[test]
    fn connect_report_round_trips_to_status_poll() {
        let (hcd, bus, _completions) = test_hcd(2);
        let worker = hcd.worker_handle();
        power_on(&hcd, 1);
        let _ = expect_port_update(worker.fetch_work().unwrap());

        let port = PortId::try_from(1).unwrap();
        worker
            .report_port_status(
                port,
                PortStatus::CONNECTION | PortStatus::HIGH_SPEED,
                ChangeReason::Connect,
            )
            .unwrap();
        assert!(bus.poll_requests() > 0);

        // the change bit reaches the bus stack's poll, port 1 == bit 1
        assert_eq!(hcd.hub_status_data(), 1 << 1);

        // and the worker sees the connected state it reported
        let update = expect_port_update(worker.fetch_work().unwrap());
        assert_eq!(update.port, port);
        assert!(update.status.contains(PortStatus::CONNECTION));
        assert!(update.change.contains(PortChange::C_CONNECTION));
    }

    #[test]
    fn unpowered_port_rejects_reports() {
        let (hcd, _bus, _completions) = test_hcd(1);
        let worker = hcd.worker_handle();
        let port = PortId::try_from(1).unwrap();
        assert_eq!(
            worker.report_port_status(
                port,
                PortStatus::CONNECTION,
                ChangeReason::Connect
            ),
            Err(Error::Protocol)
        );
        // the rejected report left no trace for the fetch path
        assert_eq!(
            worker.fetch_work_timeout(SHORT),
            Err(FetchWorkError::TimedOut)
        );
    }
}
