// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*!
## Software-emulated USB host controller

A host controller emulated entirely in software: the bus stack above sees a
standard controller/root-hub surface, while the hardware behavior (device
enumeration, transfer execution, port electrical state) is supplied by a
separate worker process that pulls work from the controller and pushes
completions and port reports back in.

```text
      bus stack                               worker process
 submit / cancel / hub control           fetch-work / give-back /
  / bus suspend / resume                fetch-payload / port reports
          |                                        |
          v                                        v
  +----------------+                      +----------------+
  | HostController |                      |  WorkerHandle  |
  +----------------+                      +----------------+
           \                                      /
            `------------.          .------------'
                         v          v
               +-----------------------------+
               |           VhciHcd           |
               |-----------------------------|
               | QueueSet (Inbox / Fetched / |
               |  CancelPending/CancelAcked) |
               | RootHubPort array           |
               | root-hub power state        |
               | port-update bitmap + cursor |
               | frame counter               |
               +-----------------------------+
```

A submitted transfer moves Inbox -> Fetched when the worker picks it up, and
is destroyed only at give-back. Cancellation either completes the transfer
in place (still in Inbox) or routes it Fetched -> CancelPending ->
CancelAcked so the worker learns to abandon it; whichever of cancellation
and completion finalizes the write-once status cell first decides the final
status, so racing paths converge on exactly one give-back. Port state flows
the other way: the worker reports electrical transitions, the controller
folds them into the sticky status/change registers, and the bus stack picks
them up through its periodic status poll and hub-control requests.

### Conventions

Port numbers are 1-based on every external surface; [port::PortId] carries
the checked conversion and `as_index()` so the off-by-one lives in exactly
one place. Raw wire values (hub requests, change masks) are decoded into
enums ([hub::HubRequest], [port::ChangeReason]) before they touch any
state, so validity checking lives in the conversion rather than strewn
through the state machines.
*/

use std::time::Duration;

pub mod bits;
pub mod bus;
pub mod controller;
pub mod hub;
pub mod port;
mod queues;
pub mod transfer;
pub mod work;

#[cfg(test)]
pub(crate) mod testutil;

pub use controller::{
    CreateParams, HostController, RootHubState, VhciHcd,
};
pub use work::{
    FetchWorkError, Giveback, PayloadFetch, PortStatusUpdate, WorkItem,
    WorkerHandle,
};

/// The largest number of downstream ports a controller instance may have.
pub const MAX_PORTS: u8 = 31;

/// How long one fetch-work call waits before reporting a timeout.
pub const WORK_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Errors returned by controller and work-exchange operations.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Malformed request shape.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The handle names no in-flight transfer.
    #[error("unknown transfer handle {0}")]
    NotFound(transfer::UrbHandle),
    /// Port number outside the configured range.
    #[error("port {0} out of range")]
    PortOutOfRange(u8),
    /// Operation invalid for the current port or record state; surfaces to
    /// the bus stack as a protocol stall.
    #[error("protocol violation")]
    Protocol,
    /// Actual transferred length exceeds the requested length.
    #[error("transfer longer than requested")]
    Overrun,
    /// The transfer carries no outbound payload to fetch.
    #[error("no payload data")]
    NoData,
    /// Destination buffer too small for the payload.
    #[error("destination buffer too small")]
    BufferTooSmall,
    /// The underlying controller device is suspended or not yet accessible.
    #[error("controller not accessible")]
    NotReady,
    /// The root hub must be suspended before the controller device.
    #[error("root hub still running")]
    Busy,
    /// The controller is stopped or being torn down.
    #[error("controller shut down")]
    Shutdown,
}
