// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Drive reference counting and teardown.
//!
//! Releases that may happen while the drive is still on the call stack (a
//! job completing against its own node) go through the deferred queue and
//! run at the start of the next [BlockLayer::poll].

use std::collections::VecDeque;

use slog::{debug, info};

use crate::drive::{AttachedDevice, DriveKey};
use crate::error::{Error, Result};
use crate::layer::BlockLayer;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Deferred {
    PutRef(DriveKey),
}

#[derive(Debug, Default)]
pub(crate) struct DeferredQueue {
    tasks: VecDeque<Deferred>,
}

impl DeferredQueue {
    pub(crate) fn push(&mut self, task: Deferred) {
        self.tasks.push_back(task);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    fn pop(&mut self) -> Option<Deferred> {
        self.tasks.pop_front()
    }
}

impl BlockLayer {
    /// Run the tasks queued so far.  Tasks queued while running wait for
    /// the next call.
    pub(crate) fn run_deferred(&mut self) -> usize {
        let count = self.deferred.len();
        for _ in 0..count {
            match self.deferred.pop() {
                Some(Deferred::PutRef(key)) => self.drive_put_ref(key),
                None => break,
            }
        }
        count
    }

    pub fn pending_deferred(&self) -> usize {
        self.deferred.len()
    }

    pub fn drive_get_ref(&mut self, key: DriveKey) {
        if let Some(drive) = self.drives.get_mut(key) {
            drive.refcount += 1;
        }
    }

    /// Drop a reference, destroying the drive when it was the last one.
    pub fn drive_put_ref(&mut self, key: DriveKey) {
        let Some(drive) = self.drives.get_mut(key) else {
            return;
        };
        assert!(drive.refcount > 0, "drive reference count underflow");
        drive.refcount -= 1;
        if drive.refcount == 0 {
            self.drive_uninit(key);
        }
    }

    pub(crate) fn drive_put_ref_deferred(&mut self, key: DriveKey) {
        debug!(self.log, "deferring drive release"; "key" => key.0);
        self.deferred.push(Deferred::PutRef(key));
    }

    /// Close the drive's medium and remove it from the registry.
    pub(crate) fn drive_uninit(&mut self, key: DriveKey) {
        if let Some(mut drive) = self.drives.remove(key) {
            drive.node.close();
            info!(self.log, "drive destroyed"; drive);
        }
    }

    /// Hot-unplug hook: stop any job on the drive and have it released
    /// once its device is gone.  Drives are named by id, which survives
    /// the drive being made anonymous.
    pub fn blockdev_mark_auto_del(&mut self, id: &str) {
        let Some(key) = self.drives.by_id(id).map(|d| d.key) else {
            return;
        };
        let Some(drive) = self.drives.get_mut(key) else {
            return;
        };
        if let Some(job) = drive.node.job.as_deref_mut() {
            job.cancel();
        }
        drive.auto_del = true;
    }

    /// Release a drive marked for automatic deletion.
    pub fn blockdev_auto_del(&mut self, id: &str) {
        let Some(drive) = self.drives.by_id(id) else {
            return;
        };
        if drive.auto_del {
            let key = drive.key;
            self.drive_put_ref(key);
        }
    }

    /// Plug a guest device into the drive.
    pub fn attach_device(
        &mut self,
        id: &str,
        device: AttachedDevice,
    ) -> Result<()> {
        let drive = self
            .drives
            .by_id(id)
            .ok_or_else(|| Error::DeviceNotFound(id.to_string()))?;
        if drive.device.is_some() {
            return Err(Error::DeviceInUse(id.to_string()));
        }
        let key = drive.key;
        self.drive_mut(key)?.device = Some(device);
        Ok(())
    }

    /// Unplug the guest device.  A drive marked for automatic deletion is
    /// released with it.
    pub fn detach_device(&mut self, id: &str) -> Result<()> {
        let key = self
            .drives
            .by_id(id)
            .filter(|d| d.device.is_some())
            .map(|d| d.key)
            .ok_or_else(|| Error::DeviceNotFound(id.to_string()))?;
        self.drive_mut(key)?.device = None;
        debug!(self.log, "device detached"; "drive" => id);
        self.blockdev_auto_del(id);
        Ok(())
    }

    pub(crate) fn device_mut(
        &mut self,
        key: DriveKey,
    ) -> Option<&mut AttachedDevice> {
        self.drives.get_mut(key).and_then(|d| d.device.as_mut())
    }
}
