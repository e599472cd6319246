// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Monitor-level operations on drives: medium changes, deletion, resizing,
//! throttling and the synchronous commit.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use slog::{debug, info};

use crate::backend::{BackendError, OpenFlags};
use crate::drive::DriveKey;
use crate::error::{Error, Result};
use crate::layer::BlockLayer;
use crate::node::OnError;
use crate::throttle::IoLimits;

/// How the target image of a snapshot, mirror or backup comes to be.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum NewImageMode {
    /// The image already exists and is used as is.
    Existing,
    /// Create the image, recording the backing file by absolute path.
    #[default]
    AbsolutePaths,
}

impl BlockLayer {
    /// Close the medium of a drive whose device allows removal.  A locked
    /// medium is asked to be released; without `force` that request is all
    /// that happens.
    fn eject_device(&mut self, key: DriveKey, force: bool) -> Result<()> {
        let drive = self.drive_mut(key)?;
        let device = drive.node.device_name().to_string();
        if drive.node.in_use() {
            return Err(Error::DeviceInUse(device));
        }
        if !drive.has_removable_media() {
            return Err(Error::DeviceNotRemovable(device));
        }
        if let Some(dev) = drive.device.as_mut() {
            if dev.medium_locked && !dev.tray_open {
                dev.eject_requested = Some(force);
                if !force {
                    return Err(Error::DeviceLocked(device));
                }
            }
        }
        drive.node.close();
        debug!(self.log, "medium ejected"; "device" => device);
        Ok(())
    }

    pub fn eject(&mut self, device: &str, force: bool) -> Result<()> {
        let key = self.find_device(device)?;
        self.eject_device(key, force)
    }

    /// Replace the medium of a removable drive.  The new image is opened
    /// read-only if the drive was, and in snapshot mode if the drive was.
    pub fn change_medium(
        &mut self,
        device: &str,
        filename: &str,
        format: Option<&str>,
    ) -> Result<()> {
        let key = self.find_device(device)?;
        let drive = self.drive_mut(key)?;
        let read_only = drive.node.is_read_only();
        let snapshot = drive.node.is_snapshot();
        let drv = match format {
            Some(fmt) => Some(
                self.drivers
                    .find_whitelisted_format(fmt, read_only)
                    .ok_or_else(|| Error::InvalidBlockFormat(fmt.to_string()))?,
            ),
            None => None,
        };

        self.eject_device(key, false)?;

        let mut flags = OpenFlags::empty();
        flags.set(OpenFlags::RDWR, !read_only);
        flags.set(OpenFlags::SNAPSHOT, snapshot);
        let drivers = &self.drivers;
        let drive = self
            .drives
            .get_mut(key)
            .ok_or_else(|| Error::DeviceNotFound(device.to_string()))?;
        drive
            .node
            .open(drivers, Some(filename), &BTreeMap::new(), flags, drv)
            .map_err(|source| Error::OpenFile {
                filename: filename.to_string(),
                source,
            })?;
        info!(self.log, "medium changed";
            "device" => device, "file" => filename);

        if drive.node.key_required() {
            let filename =
                drive.node.encrypted_filename().unwrap_or(filename).to_string();
            return Err(Error::DeviceEncrypted {
                device: device.to_string(),
                filename,
            });
        }
        Ok(())
    }

    /// Supply the unlock key of an encrypted medium.
    pub fn set_password(&mut self, device: &str, password: &str) -> Result<()> {
        let key = self.find_device(device)?;
        let drive = self.drive_mut(key)?;
        match drive.node.set_key(password) {
            Ok(()) => Ok(()),
            Err(BackendError::InvalidArgument) => {
                Err(Error::DeviceNotEncrypted(device.to_string()))
            }
            Err(_) => Err(Error::InvalidPassword),
        }
    }

    /// Replace a drive's I/O limits, switching the limiter on or off as
    /// needed.  A limiter that stays on has its timer fire right away so
    /// the new limits apply from the next request.
    pub fn set_io_throttle(
        &mut self,
        device: &str,
        limits: IoLimits,
    ) -> Result<()> {
        let key = self.find_device(device)?;
        limits.check()?;

        let log = self.drive_log(device);
        let drive = self.drive_mut(key)?;
        let throttle = &mut drive.node.throttle;
        throttle.set_limits(limits);
        match (throttle.is_enabled(), limits.is_enabled()) {
            (false, true) => {
                throttle.enable();
                info!(log, "I/O throttling enabled"; "limits" => ?limits);
            }
            (true, false) => {
                throttle.disable();
                info!(log, "I/O throttling disabled");
            }
            _ => {
                if throttle.rearm(Instant::now()) {
                    debug!(log, "I/O limits updated"; "limits" => ?limits);
                }
            }
        }
        Ok(())
    }

    /// Delete a drive.  While a guest device still holds it the drive only
    /// loses its medium and name; it goes away when the device does.
    pub fn drive_del(&mut self, id: &str) -> Result<()> {
        let key = self.find_device(id)?;
        if self.drive_mut(key)?.node.in_use() {
            return Err(Error::DeviceInUse(id.to_string()));
        }

        self.drain_all();
        let drive = self.drive_mut(key)?;
        // Nobody is left to hear about a failed flush.
        let _ = drive.node.flush();
        drive.node.close();

        if drive.device.is_some() {
            drive.node.make_anon();
            drive.node.set_on_error(OnError::Report, OnError::Report);
            info!(self.log, "drive detached from its name"; "drive" => id);
        } else {
            self.drive_put_ref(key);
        }
        Ok(())
    }

    /// Grow or shrink the medium of a drive.
    pub fn resize(&mut self, device: &str, size: i64) -> Result<()> {
        let key = self.find_device(device)?;
        let size = u64::try_from(size).map_err(|_| {
            Error::InvalidParameterValue {
                name: "size".into(),
                expected: "a >0 size".into(),
            }
        })?;

        self.drain_all();
        let drive = self.drive_mut(key)?;
        match drive.node.truncate(size) {
            Ok(()) => {
                info!(self.log, "drive resized";
                    "device" => device, "size" => size);
                Ok(())
            }
            Err(BackendError::NoMedium) => {
                Err(Error::DeviceHasNoMedium(device.to_string()))
            }
            Err(BackendError::NotSupported) => Err(Error::Unsupported),
            Err(BackendError::ReadOnly) => {
                Err(Error::DeviceIsReadOnly(device.to_string()))
            }
            Err(BackendError::Busy) => {
                Err(Error::DeviceInUse(device.to_string()))
            }
            Err(e) => Err(Error::backend("Could not resize", e)),
        }
    }

    /// Write the top layer of a drive (or of every drive, for `all`) into
    /// its backing image and empty it.
    pub fn commit(&mut self, device: &str) -> Result<()> {
        let commit_error = |e: BackendError| {
            Error::Generic(format!("'commit' error for '{}': {}", device, e))
        };
        if device == "all" {
            self.drain_all();
            for key in self.drives.keys() {
                let Some(drive) = self.drives.get_mut(key) else {
                    continue;
                };
                if drive.node.is_inserted() && drive.node.backing().is_some() {
                    drive.node.commit_to_backing().map_err(commit_error)?;
                }
            }
            return Ok(());
        }

        let key = self.find_device(device)?;
        let drive = self.drive_mut(key)?;
        drive.node.commit_to_backing().map_err(commit_error)?;
        info!(self.log, "top layer committed"; "device" => device);
        Ok(())
    }
}
