// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The virtual host controller engine.
//!
//! One [VhciHcd] instance exists per registration. All mutable state sits
//! behind a single lock; the paired condition variable (and its async
//! mirror) wakes the worker's fetch-work wait whenever a new inbox record,
//! a staged cancellation, or a pending port update appears.

use std::num::NonZeroU64;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::bus::UsbBus;
use crate::hub::{self, HubReply, HubRequest};
use crate::port::{PortId, RootHubPort};
use crate::queues::QueueSet;
use crate::transfer::{
    TransferRecord, TransferStatus, Urb, UrbHandle, UrbState,
};
use crate::work::WorkerHandle;
use crate::{Error, MAX_PORTS};

#[usdt::provider(provider = "vhci")]
mod probes {
    fn urb_submit(instance: u32, handle: u64, length: u64) {}
    fn urb_giveback(instance: u32, handle: u64, status: u8, actual: u64) {}
    fn port_update(instance: u32, port: u8) {}
}

/// Root-hub power state. `Reset` is the boundary state before start and
/// after stop; `Running` and `Suspended` are driven by the bus-level
/// suspend/resume calls.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RootHubState {
    Reset,
    Running,
    Suspended,
}

/// Parameters for registering a new controller instance.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct CreateParams {
    /// Instance number assigned by the registration layer; becomes part of
    /// the bus location string.
    pub instance: u32,
    /// Number of downstream root-hub ports, 1..=31.
    pub port_count: u8,
}

pub(crate) struct VhciState {
    pub rh_state: RootHubState,
    /// Allocated at start, released at stop.
    pub ports: Vec<RootHubPort>,
    /// One bit per port (by index) whose registers changed since the worker
    /// last fetched them.
    pub port_update: u32,
    /// Round-robin cursor for fair port-update delivery.
    pub port_sched_offset: u8,
    pub queues: QueueSet,
    next_handle: u64,
    /// Set by [WorkerHandle::interrupt]; consumed by the next fetch-work
    /// waiter.
    pub interrupted: bool,
}

impl VhciState {
    pub(crate) fn alloc_handle(&mut self) -> UrbHandle {
        self.next_handle += 1;
        let raw = NonZeroU64::new(self.next_handle)
            .expect("handle counter starts at one and only increments");
        UrbHandle::new(raw)
    }
}

/// A software-emulated USB host controller.
///
/// The bus-stack integration layer drives the [HostController] surface;
/// the worker process drives the [WorkerHandle] obtained from
/// [VhciHcd::worker_handle].
pub struct VhciHcd {
    instance: u32,
    bus_location: String,
    port_count: u8,
    pub(crate) bus: Arc<dyn UsbBus>,
    pub(crate) state: Mutex<VhciState>,
    pub(crate) cv: Condvar,
    /// Async mirror of `cv` for [WorkerHandle::wait_for_work].
    pub(crate) work_notifier: Notify,
    /// Emulated frame counter.
    // TODO: drive this from a periodic timer while the root hub is running
    frame_num: AtomicU32,
    /// Whether the underlying controller device is powered and reachable.
    /// Cleared by [VhciHcd::device_suspend], set by [VhciHcd::device_resume].
    hw_accessible: AtomicBool,
    pub(crate) log: slog::Logger,
}

impl VhciHcd {
    /// Register a new controller instance.
    pub fn create(
        params: CreateParams,
        bus: Arc<dyn UsbBus>,
        log: slog::Logger,
    ) -> Result<Arc<Self>, Error> {
        let CreateParams { instance, port_count } = params;
        if port_count == 0 || port_count > MAX_PORTS {
            return Err(Error::InvalidArgument("port count must be in 1..=31"));
        }
        let bus_location = format!("vhci_hcd.{instance}");
        slog::info!(log, "controller registered";
            "bus_id" => %bus_location, "ports" => port_count);
        Ok(Arc::new(Self {
            instance,
            bus_location,
            port_count,
            bus,
            state: Mutex::new(VhciState {
                rh_state: RootHubState::Reset,
                ports: Vec::new(),
                port_update: 0,
                port_sched_offset: 0,
                queues: QueueSet::new(),
                next_handle: 0,
                interrupted: false,
            }),
            cv: Condvar::new(),
            work_notifier: Notify::new(),
            frame_num: AtomicU32::new(0),
            hw_accessible: AtomicBool::new(true),
            log,
        }))
    }

    /// Opaque instance identifier assigned at registration.
    pub fn instance_id(&self) -> u32 {
        self.instance
    }

    /// Human-readable bus location of this controller.
    pub fn bus_location(&self) -> &str {
        &self.bus_location
    }

    pub fn port_count(&self) -> u8 {
        self.port_count
    }

    /// Open the worker-facing side of this controller. Closing (or
    /// dropping) the handle tears the instance down, failing out every
    /// in-flight transfer.
    pub fn worker_handle(self: &Arc<Self>) -> WorkerHandle {
        WorkerHandle::new(self.clone())
    }

    /// Bring the controller up: allocate the port array and put the root
    /// hub in the running state.
    pub fn start(&self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.rh_state != RootHubState::Reset {
            return Err(Error::Busy);
        }
        state.ports =
            (0..self.port_count).map(|_| RootHubPort::default()).collect();
        state.port_update = 0;
        state.port_sched_offset = 0;
        state.rh_state = RootHubState::Running;
        slog::info!(self.log, "started"; "ports" => self.port_count);
        Ok(())
    }

    /// Tear the controller down: every record still in any queue is given
    /// back as a shutdown failure, the port array is released, and the root
    /// hub returns to the reset state. Idempotent.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        if state.rh_state == RootHubState::Reset && state.queues.is_empty() {
            return;
        }
        let drained = state.queues.drain();
        for record in &drained {
            record.status.finalize(TransferStatus::Shutdown);
            self.bus.unlink_urb(record.handle);
        }
        state.ports.clear();
        state.port_update = 0;
        state.rh_state = RootHubState::Reset;
        drop(state);
        self.cv.notify_all();
        self.work_notifier.notify_waiters();
        for record in drained {
            self.deliver(record);
        }
        slog::info!(self.log, "stopped");
    }

    /// Submit one transfer. Non-blocking; the returned handle identifies the
    /// transfer until give-back.
    pub fn urb_enqueue(&self, urb: Urb) -> Result<UrbHandle, Error> {
        if urb.buffer.is_none() && urb.buffer_length > 0 {
            return Err(Error::InvalidArgument(
                "buffer missing for nonzero transfer length",
            ));
        }
        if let Some(buffer) = &urb.buffer {
            if buffer.len() != urb.buffer_length {
                return Err(Error::InvalidArgument(
                    "buffer disagrees with declared transfer length",
                ));
            }
        }
        let mut state = self.state.lock().unwrap();
        if state.rh_state == RootHubState::Reset {
            return Err(Error::Shutdown);
        }
        let handle = state.alloc_handle();
        self.bus.link_urb(handle, &urb)?;
        probes::urb_submit!(|| (
            self.instance,
            handle.as_raw(),
            urb.buffer_length as u64
        ));
        slog::debug!(self.log, "transfer submitted"; "handle" => %handle,
            "type" => ?urb.transfer_type, "len" => urb.buffer_length);
        state.queues.push_inbox(TransferRecord::new(handle, urb));
        drop(state);
        self.notify_work();
        Ok(handle)
    }

    /// Cancel a previously submitted transfer with the given final status.
    ///
    /// A record still in the inbox completes right here, with no worker
    /// involvement; a fetched record is staged for the worker to abandon.
    /// A transfer already completing (or unknown) is a no-op.
    pub fn urb_dequeue(
        &self,
        handle: UrbHandle,
        status: TransferStatus,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        self.bus.check_unlink(handle)?;
        match state.queues.state_of(handle) {
            Some(UrbState::Inbox) => {
                if let Some(record) = state.queues.remove(handle) {
                    record.status.finalize(status);
                    self.bus.unlink_urb(handle);
                    drop(state);
                    self.deliver(record);
                }
                Ok(())
            }
            Some(UrbState::Fetched) => {
                if let Some(record) = state.queues.get(handle) {
                    // stage the cancellation status now so it wins any race
                    // with a concurrent give-back
                    record.status.finalize(status);
                }
                state.queues.move_to(handle, UrbState::CancelPending);
                slog::debug!(self.log, "cancel staged"; "handle" => %handle);
                self.cv.notify_all();
                self.work_notifier.notify_waiters();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Read the emulated frame counter.
    pub fn get_frame_number(&self) -> u32 {
        self.frame_num.load(Ordering::Relaxed)
    }

    /// The periodic root-hub status poll: one bit per port (bit *n* is port
    /// *n*, 1-based) with unacknowledged change bits. A poll observing a
    /// suspended root hub asks the bus stack to resume it.
    pub fn hub_status_data(&self) -> u32 {
        if !self.hw_accessible.load(Ordering::Acquire) {
            return 0;
        }
        let state = self.state.lock().unwrap();
        let mut changed = 0u32;
        for (index, port) in state.ports.iter().enumerate() {
            if !port.change().is_empty() {
                changed |= 1 << (index + 1);
            }
        }
        let suspended = state.rh_state == RootHubState::Suspended;
        drop(state);
        if suspended {
            self.bus.resume_root_hub();
        }
        changed
    }

    /// Execute one decoded hub class request against the port registers.
    /// State-machine violations stall with no partial effects.
    pub fn hub_control(&self, req: HubRequest) -> Result<HubReply, Error> {
        if !self.hw_accessible.load(Ordering::Acquire) {
            return Err(Error::NotReady);
        }
        let mut state = self.state.lock().unwrap();
        let reply = self.hub_control_locked(&mut state, req);
        let has_changes =
            state.ports.iter().any(|port| !port.change().is_empty());
        drop(state);
        if has_changes {
            self.bus.poll_root_hub();
        }
        reply
    }

    fn hub_control_locked(
        &self,
        state: &mut VhciState,
        req: HubRequest,
    ) -> Result<HubReply, Error> {
        match req {
            HubRequest::ClearHubFeature(feature)
            | HubRequest::SetHubFeature(feature) => {
                // the virtual hub's local power and overcurrent status
                // never change; accept the acknowledgment as-is
                slog::debug!(self.log, "hub feature request";
                    "feature" => ?feature);
                Ok(HubReply::Ack)
            }
            HubRequest::GetHubDescriptor { length } => {
                Ok(HubReply::HubDescriptor(hub::hub_descriptor(
                    self.port_count,
                    length,
                )))
            }
            HubRequest::GetHubStatus => {
                Ok(HubReply::HubStatus { status: 0, change: 0 })
            }
            HubRequest::GetPortStatus(port) => {
                let p = Self::port_mut(state, port).ok_or(Error::Protocol)?;
                slog::debug!(self.log, "port status read"; "port" => %port,
                    "status" => ?p.status(), "change" => ?p.change());
                Ok(HubReply::PortStatus {
                    status: p.status(),
                    change: p.change(),
                })
            }
            HubRequest::ClearPortFeature(port, feature) => {
                let p = Self::port_mut(state, port).ok_or(Error::Protocol)?;
                if p.clear_feature(feature)? {
                    slog::debug!(self.log, "port feature cleared";
                        "port" => %port, "feature" => ?feature);
                    self.flag_port_update(state, port);
                }
                Ok(HubReply::Ack)
            }
            HubRequest::SetPortFeature(port, feature) => {
                let p = Self::port_mut(state, port).ok_or(Error::Protocol)?;
                if p.set_feature(feature)? {
                    slog::debug!(self.log, "port feature set";
                        "port" => %port, "feature" => ?feature);
                    self.flag_port_update(state, port);
                }
                Ok(HubReply::Ack)
            }
        }
    }

    /// Suspend the root hub, force-suspending every enabled port that is
    /// not already suspended.
    pub fn bus_suspend(&self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        for index in 0..state.ports.len() {
            if state.ports[index].force_suspend() {
                let port = PortId::from_index(index);
                slog::debug!(self.log, "port suspended"; "port" => %port);
                self.flag_port_update(&mut state, port);
            }
        }
        // TODO: a ClearPortFeature(SUSPEND) interleaved with this transition
        // is not serialized against it and can leave a port resuming under a
        // suspended root hub
        state.rh_state = RootHubState::Suspended;
        Ok(())
    }

    /// Resume the root hub. The controller device itself must have been
    /// resumed first.
    pub fn bus_resume(&self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if !self.hw_accessible.load(Ordering::Acquire) {
            slog::warn!(
                self.log,
                "resume the controller device before resuming its root hub"
            );
            return Err(Error::NotReady);
        }
        state.rh_state = RootHubState::Running;
        Ok(())
    }

    /// Power down the controller device. Refused while the root hub is
    /// still running.
    pub fn device_suspend(&self) -> Result<(), Error> {
        let state = self.state.lock().unwrap();
        if state.rh_state == RootHubState::Running {
            slog::warn!(
                self.log,
                "suspend the root hub before suspending the controller device"
            );
            return Err(Error::Busy);
        }
        drop(state);
        self.hw_accessible.store(false, Ordering::Release);
        Ok(())
    }

    /// Power the controller device back up and kick the status poll.
    pub fn device_resume(&self) {
        self.hw_accessible.store(true, Ordering::Release);
        self.bus.poll_root_hub();
    }

    fn port_mut(
        state: &mut VhciState,
        id: PortId,
    ) -> Option<&mut RootHubPort> {
        state.ports.get_mut(id.as_index())
    }

    /// Mark a port's registers as changed since the worker last saw them
    /// and wake any fetch-work waiter. Caller holds the lock.
    pub(crate) fn flag_port_update(&self, state: &mut VhciState, port: PortId) {
        state.port_update |= 1 << port.as_index();
        probes::port_update!(|| (self.instance, port.as_raw_id()));
        self.cv.notify_all();
        self.work_notifier.notify_waiters();
    }

    pub(crate) fn notify_work(&self) {
        self.cv.notify_all();
        self.work_notifier.notify_waiters();
    }

    /// New work for the fetch path? Checked under the lock by every waiter.
    pub(crate) fn has_work(state: &VhciState) -> bool {
        state.port_update != 0
            || !state.queues.cancel_pending_is_empty()
            || !state.queues.inbox_is_empty()
    }

    /// Deliver one finished record to its submitter. The record has already
    /// been unlinked from every queue; the lock must not be held.
    pub(crate) fn deliver(&self, record: TransferRecord) {
        let TransferRecord { handle, urb, status, .. } = record;
        let status = status.get().unwrap_or(TransferStatus::ProtocolError);
        probes::urb_giveback!(|| (
            self.instance,
            handle.as_raw(),
            status as u8,
            urb.actual_length as u64
        ));
        slog::debug!(self.log, "giveback"; "handle" => %handle,
            "status" => ?status, "actual" => urb.actual_length);
        self.bus.giveback(handle, urb, status);
    }
}

/// The host-controller surface the bus-stack integration layer drives:
/// start/stop, submit/cancel, the root-hub operations, and bus-level power
/// transitions. [VhciHcd] is the one concrete implementation; the trait
/// leaves room for alternative controller backends without changing
/// callers.
pub trait HostController: Send + Sync + 'static {
    fn start(&self) -> anyhow::Result<()>;
    fn stop(&self);
    fn urb_enqueue(&self, urb: Urb) -> Result<UrbHandle, Error>;
    fn urb_dequeue(
        &self,
        handle: UrbHandle,
        status: TransferStatus,
    ) -> Result<(), Error>;
    fn get_frame_number(&self) -> u32;
    fn hub_status_data(&self) -> u32;
    fn hub_control(&self, req: HubRequest) -> Result<HubReply, Error>;
    fn bus_suspend(&self) -> Result<(), Error>;
    fn bus_resume(&self) -> Result<(), Error>;
}

impl HostController for VhciHcd {
    fn start(&self) -> anyhow::Result<()> {
        VhciHcd::start(self).map_err(anyhow::Error::from)
    }

    fn stop(&self) {
        VhciHcd::stop(self)
    }

    fn urb_enqueue(&self, urb: Urb) -> Result<UrbHandle, Error> {
        VhciHcd::urb_enqueue(self, urb)
    }

    fn urb_dequeue(
        &self,
        handle: UrbHandle,
        status: TransferStatus,
    ) -> Result<(), Error> {
        VhciHcd::urb_dequeue(self, handle, status)
    }

    fn get_frame_number(&self) -> u32 {
        VhciHcd::get_frame_number(self)
    }

    fn hub_status_data(&self) -> u32 {
        VhciHcd::hub_status_data(self)
    }

    fn hub_control(&self, req: HubRequest) -> Result<HubReply, Error> {
        VhciHcd::hub_control(self, req)
    }

    fn bus_suspend(&self) -> Result<(), Error> {
        VhciHcd::bus_suspend(self)
    }

    fn bus_resume(&self) -> Result<(), Error> {
        VhciHcd::bus_resume(self)
    }
}
