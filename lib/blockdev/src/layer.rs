// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The block layer context.
//!
//! All state of the subsystem (the drive registry, the deferred task queue,
//! queued events, the attached jobs) is owned by a [BlockLayer].  Every
//! operation runs on the thread that owns it; long-running jobs make
//! progress only when [BlockLayer::poll] is called.

use std::collections::BTreeMap;
use std::time::Instant;

use blockdev_types::IfType;
use slog::{debug, info, o, Logger};

use crate::backend::{BackendError, DriverRegistry};
use crate::deferred::DeferredQueue;
use crate::drive::{Drive, DriveKey};
use crate::error::{Error, Result};
use crate::events::BlockEvent;
use crate::job::{JobId, Step};
use crate::node::BlockNode;
use crate::registry::DriveRegistry;

/// Execution state of the machine, as far as the block layer cares.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum RunState {
    #[default]
    Running,
    /// Waiting for an inbound migration stream.
    InMigrate,
}

pub struct BlockLayer {
    pub(crate) log: Logger,
    pub(crate) drivers: DriverRegistry,
    pub(crate) drives: DriveRegistry,
    pub(crate) deferred: DeferredQueue,
    events: Vec<BlockEvent>,
    runstate: RunState,
    autostart: bool,
    next_job_id: JobId,
    next_unit: BTreeMap<IfType, u32>,
}

impl BlockLayer {
    pub fn new(log: Logger, drivers: DriverRegistry) -> Self {
        Self {
            log,
            drivers,
            drives: DriveRegistry::default(),
            deferred: DeferredQueue::default(),
            events: Vec::new(),
            runstate: RunState::Running,
            autostart: true,
            next_job_id: 1,
            next_unit: BTreeMap::new(),
        }
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    pub fn drivers(&self) -> &DriverRegistry {
        &self.drivers
    }

    pub fn drivers_mut(&mut self) -> &mut DriverRegistry {
        &mut self.drivers
    }

    pub fn drives(&self) -> &DriveRegistry {
        &self.drives
    }

    pub fn runstate(&self) -> RunState {
        self.runstate
    }

    pub fn set_runstate(&mut self, state: RunState) {
        self.runstate = state;
    }

    /// Whether the machine may start running once set up.  Cleared when a
    /// drive still waits for its unlock key.
    pub fn autostart(&self) -> bool {
        self.autostart
    }

    pub fn set_autostart(&mut self, autostart: bool) {
        self.autostart = autostart;
    }

    pub(crate) fn alloc_job_id(&mut self) -> JobId {
        let id = self.next_job_id;
        self.next_job_id += 1;
        id
    }

    pub(crate) fn emit(&mut self, event: BlockEvent) {
        info!(self.log, "block event";
            "event" => event.name(),
            "device" => event.device().to_string());
        self.events.push(event);
    }

    pub fn events(&self) -> &[BlockEvent] {
        &self.events
    }

    /// Remove and return all queued events.
    pub fn take_events(&mut self) -> Vec<BlockEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn drive_get(
        &self,
        kind: IfType,
        bus: u32,
        unit: u32,
    ) -> Option<&Drive> {
        self.drives.find(kind, bus, unit)
    }

    pub fn drive_get_by_index(
        &self,
        kind: IfType,
        index: u32,
    ) -> Option<&Drive> {
        self.drives.by_index(kind, index)
    }

    pub fn drive_get_max_bus(&self, kind: IfType) -> Option<u32> {
        self.drives.max_bus(kind)
    }

    /// Hand out the drives of `kind` one at a time, in index order.
    pub fn drive_get_next(&mut self, kind: IfType) -> Option<&Drive> {
        let next = self.next_unit.entry(kind).or_insert(0);
        let index = *next;
        *next += 1;
        self.drives.by_index(kind, index)
    }

    pub fn drive_get_by_device(&self, device: &str) -> Option<&Drive> {
        self.drives.by_device(device)
    }

    pub fn drive_get_by_blockdev(&self, node: &BlockNode) -> Option<&Drive> {
        self.drives.by_node(node)
    }

    pub fn drive(&self, key: DriveKey) -> Option<&Drive> {
        self.drives.get(key)
    }

    pub(crate) fn find_device(&self, device: &str) -> Result<DriveKey> {
        self.drives
            .by_device(device)
            .map(|d| d.key)
            .ok_or_else(|| Error::DeviceNotFound(device.to_string()))
    }

    pub(crate) fn drive_mut(&mut self, key: DriveKey) -> Result<&mut Drive> {
        // Keys handed out internally always name a live drive.
        self.drives
            .get_mut(key)
            .ok_or_else(|| Error::Generic("drive no longer exists".into()))
    }

    /// Wait for all in-flight I/O on every drive to settle.
    pub fn drain_all(&mut self) {
        for key in self.drives.keys() {
            if let Some(drive) = self.drives.get_mut(key) {
                drive.node.drain();
            }
        }
    }

    /// Run one round of the control loop: deferred tasks queued before the
    /// call, due throttle timers, then one chunk of every runnable job.
    /// Returns whether anything happened.
    pub fn poll(&mut self) -> bool {
        let mut progressed = self.run_deferred() > 0;
        let now = Instant::now();

        for key in self.drives.keys() {
            let Some(drive) = self.drives.get_mut(key) else {
                continue;
            };
            if drive.node.throttle.fire_if_due(now) {
                debug!(self.log, "throttle timer fired";
                    "drive" => drive.id.clone());
            }

            let runnable =
                drive.node.job.as_ref().is_some_and(|j| j.is_runnable(now));
            if !runnable {
                continue;
            }
            let Some(mut job) = drive.node.job.take() else {
                continue;
            };
            let mut events = Vec::new();
            let step = job.run_step(&mut drive.node, now, &mut events);
            for ev in events {
                self.emit(ev);
            }
            match step {
                Step::Progress => {
                    progressed = true;
                    if let Some(drive) = self.drives.get_mut(key) {
                        drive.node.job = Some(job);
                    }
                }
                Step::Idle => {
                    if let Some(drive) = self.drives.get_mut(key) {
                        drive.node.job = Some(job);
                    }
                }
                Step::Done(result) => {
                    progressed = true;
                    self.job_completed(key, job, result);
                }
            }
        }
        progressed
    }

    /// Earliest moment a rate-limited job wants to run again.
    pub fn next_wakeup(&self) -> Option<Instant> {
        self.drives
            .iter()
            .filter_map(|d| d.node.job())
            .filter_map(|j| j.sleeping_until())
            .min()
    }

    /// Poll until nothing is left to do, sleeping through rate limits, for
    /// at most `max_polls` rounds.  Returns the number of rounds run.
    pub fn run_until_idle(&mut self, max_polls: usize) -> usize {
        for round in 0..max_polls {
            if self.poll() {
                continue;
            }
            match self.next_wakeup() {
                Some(when) => {
                    let now = Instant::now();
                    if when > now {
                        std::thread::sleep(when - now);
                    }
                }
                None if self.deferred.is_empty() => return round + 1,
                None => {}
            }
        }
        max_polls
    }

    /// Guest read through the drive's chain.
    pub fn read(
        &mut self,
        device: &str,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        let key = self.find_device(device)?;
        let drive = self.drive_mut(key)?;
        let len = buf.len() as u64;
        let now = Instant::now();
        if let Some(wait) = drive.node.throttle.account(false, len, now) {
            debug!(self.log, "read throttled";
                "device" => device, "wait_us" => wait.as_micros() as u64);
        }
        let drive = self.drive_mut(key)?;
        drive
            .node
            .read(offset, buf)
            .map_err(|e| guest_io_error(device, "read", e))
    }

    /// Guest write.  An attached job sees the request before it reaches
    /// the image.
    pub fn write(
        &mut self,
        device: &str,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        let key = self.find_device(device)?;
        let drive = self.drive_mut(key)?;
        let len = data.len() as u64;
        let now = Instant::now();

        if let Some(mut job) = drive.node.job.take() {
            let res = job.before_write(&mut drive.node, offset, len);
            drive.node.job = Some(job);
            res.map_err(|e| guest_io_error(device, "write", e))?;
        }
        if let Some(wait) = drive.node.throttle.account(true, len, now) {
            debug!(self.log, "write throttled";
                "device" => device, "wait_us" => wait.as_micros() as u64);
        }
        let drive = self.drive_mut(key)?;
        drive
            .node
            .write(offset, data)
            .map_err(|e| guest_io_error(device, "write", e))
    }

    /// Logger for work done on behalf of one drive.
    pub(crate) fn drive_log(&self, id: &str) -> Logger {
        self.log.new(o!("drive" => id.to_string()))
    }
}

fn guest_io_error(device: &str, what: &str, err: BackendError) -> Error {
    match err {
        BackendError::NoMedium => Error::DeviceHasNoMedium(device.to_string()),
        BackendError::ReadOnly => Error::DeviceIsReadOnly(device.to_string()),
        err => Error::backend(
            format!("guest {} on '{}' failed", what, device),
            err,
        ),
    }
}
