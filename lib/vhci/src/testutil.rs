// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared helpers for tests: a stub bus-stack collaborator that records
//! give-backs over a channel so tests can observe completions from any
//! thread.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender};

use crate::bus::UsbBus;
use crate::controller::{CreateParams, VhciHcd};
use crate::transfer::{TransferStatus, Urb, UrbHandle};
use crate::Error;

pub(crate) type Completion = (UrbHandle, Urb, TransferStatus);

pub(crate) struct TestBus {
    completions: Sender<Completion>,
    linked: Mutex<HashSet<UrbHandle>>,
    unlinked: Mutex<HashSet<UrbHandle>>,
    refuse_link: AtomicBool,
    refuse_unlink: AtomicBool,
    polls: AtomicUsize,
    resumes: AtomicUsize,
}

impl TestBus {
    pub fn new() -> (Arc<Self>, Receiver<Completion>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (
            Arc::new(Self {
                completions: tx,
                linked: Mutex::new(HashSet::new()),
                unlinked: Mutex::new(HashSet::new()),
                refuse_link: AtomicBool::new(false),
                refuse_unlink: AtomicBool::new(false),
                polls: AtomicUsize::new(0),
                resumes: AtomicUsize::new(0),
            }),
            rx,
        )
    }

    pub fn refuse_link(&self, refuse: bool) {
        self.refuse_link.store(refuse, Ordering::Relaxed);
    }

    pub fn refuse_unlink(&self, refuse: bool) {
        self.refuse_unlink.store(refuse, Ordering::Relaxed);
    }

    /// Every linked transfer was eventually unlinked.
    pub fn links_balanced(&self) -> bool {
        *self.linked.lock().unwrap() == *self.unlinked.lock().unwrap()
    }

    pub fn poll_requests(&self) -> usize {
        self.polls.load(Ordering::Relaxed)
    }

    pub fn resume_requests(&self) -> usize {
        self.resumes.load(Ordering::Relaxed)
    }
}

impl UsbBus for TestBus {
    fn link_urb(&self, handle: UrbHandle, _urb: &Urb) -> Result<(), Error> {
        if self.refuse_link.load(Ordering::Relaxed) {
            return Err(Error::InvalidArgument("link refused"));
        }
        self.linked.lock().unwrap().insert(handle);
        Ok(())
    }

    fn check_unlink(&self, _handle: UrbHandle) -> Result<(), Error> {
        if self.refuse_unlink.load(Ordering::Relaxed) {
            return Err(Error::Busy);
        }
        Ok(())
    }

    fn unlink_urb(&self, handle: UrbHandle) {
        self.unlinked.lock().unwrap().insert(handle);
    }

    fn giveback(&self, handle: UrbHandle, urb: Urb, status: TransferStatus) {
        // tests may have dropped the receiver already
        let _ = self.completions.send((handle, urb, status));
    }

    fn poll_root_hub(&self) {
        self.polls.fetch_add(1, Ordering::Relaxed);
    }

    fn resume_root_hub(&self) {
        self.resumes.fetch_add(1, Ordering::Relaxed);
    }
}

/// Discards log output unless TEST_LOG is set in the environment.
pub(crate) fn test_log() -> slog::Logger {
    use slog::Drain;
    if std::env::var_os("TEST_LOG").is_some() {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        slog::Logger::root(drain, slog::o!())
    } else {
        slog::Logger::root(slog::Discard, slog::o!())
    }
}

/// A started controller on a fresh stub bus.
pub(crate) fn test_hcd(
    port_count: u8,
) -> (Arc<VhciHcd>, Arc<TestBus>, Receiver<Completion>) {
    let (bus, completions) = TestBus::new();
    let hcd = VhciHcd::create(
        CreateParams { instance: 0, port_count },
        bus.clone(),
        test_log(),
    )
    .expect("test controller parameters are valid");
    hcd.start().expect("fresh controller starts");
    (hcd, bus, completions)
}
