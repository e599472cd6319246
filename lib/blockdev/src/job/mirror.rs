// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mirroring: keep a target in sync with a drive, then optionally pivot the
//! drive onto the target.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use slog::info;

use super::{check_speed, check_stop_policy, Chunk, JobDriver, JobIoError};
use super::{JobId, JobKind, MirrorSyncMode, Progress};
use crate::backend::{BackendError, DriverRegistry, OpenFlags};
use crate::commands::NewImageMode;
use crate::error::{Error, Result};
use crate::layer::BlockLayer;
use crate::node::{BlockNode, OnError};

const DEFAULT_GRANULARITY: u64 = 64 * 1024;
const DEFAULT_BUF_SIZE: u64 = 10 << 20;
const MIN_GRANULARITY: u64 = 512;
const MAX_GRANULARITY: u64 = 64 << 20;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DriveMirror {
    pub device: String,
    pub target: String,
    #[serde(default)]
    pub format: Option<String>,
    pub sync: MirrorSyncMode,
    #[serde(default)]
    pub mode: NewImageMode,
    #[serde(default)]
    pub speed: i64,
    #[serde(default)]
    pub on_source_error: OnError,
    #[serde(default)]
    pub on_target_error: OnError,
    #[serde(default)]
    pub granularity: u64,
    #[serde(default)]
    pub buf_size: Option<i64>,
}

struct MirrorJob {
    target: BlockNode,
    sync: MirrorSyncMode,
    granularity: u64,
    buf_size: u64,
    len: u64,
    /// Granules that differ between source and target.
    dirty: BTreeSet<u64>,
    synced: bool,
    should_complete: bool,
    on_source_error: OnError,
    on_target_error: OnError,
}

impl MirrorJob {
    fn mark_dirty(&mut self, offset: u64, len: u64) {
        if len == 0 {
            return;
        }
        let first = offset / self.granularity;
        let last = (offset + len - 1) / self.granularity;
        self.dirty.extend(first..=last);
    }

    fn remaining(&self) -> u64 {
        (self.dirty.len() as u64 * self.granularity).min(self.len)
    }

    /// Seed the dirty set from what the sync mode asks to be copied.
    fn seed(
        &mut self,
        bs: &mut BlockNode,
    ) -> std::result::Result<(), BackendError> {
        let base = match self.sync {
            MirrorSyncMode::None => return Ok(()),
            MirrorSyncMode::Top => Some(1),
            MirrorSyncMode::Full => None,
        };
        let mut offset = 0;
        while offset < self.len {
            let n = self.granularity.min(self.len - offset);
            if bs.is_allocated_above(0, base, offset, n)? {
                self.mark_dirty(offset, n);
            }
            offset += n;
        }
        Ok(())
    }
}

impl JobDriver for MirrorJob {
    fn step(
        &mut self,
        progress: &mut Progress,
        bs: &mut BlockNode,
    ) -> std::result::Result<Chunk, JobIoError> {
        progress.offset = self.len - self.remaining();
        if self.dirty.is_empty() {
            if self.should_complete {
                return Ok(Chunk::Finished);
            }
            if !self.synced {
                self.synced = true;
                return Ok(Chunk::Ready);
            }
            return Ok(Chunk::Idle);
        }

        let batch = (self.buf_size / self.granularity).max(1);
        let mut copied = 0;
        for _ in 0..batch {
            let Some(granule) = self.dirty.pop_first() else {
                break;
            };
            let offset = granule * self.granularity;
            let n = self.granularity.min(self.len - offset);
            let mut buf = vec![0u8; n as usize];
            let res = match bs.read(offset, &mut buf) {
                Err(err) => Err((err, true, self.on_source_error)),
                Ok(()) => self
                    .target
                    .write(offset, &buf)
                    .map_err(|err| (err, false, self.on_target_error)),
            };
            if let Err((err, is_read, policy)) = res {
                self.dirty.insert(granule);
                progress.offset = self.len - self.remaining();
                return Err(JobIoError { err, is_read, policy, len: n });
            }
            copied += n;
        }
        progress.offset = self.len - self.remaining();
        Ok(Chunk::Copied(copied))
    }

    /// Failed granules stay dirty and are retried.
    fn skip(&mut self, _progress: &mut Progress, _err: &JobIoError) {}

    fn before_write(
        &mut self,
        _bs: &mut BlockNode,
        offset: u64,
        len: u64,
    ) -> std::result::Result<(), BackendError> {
        self.mark_dirty(offset, len);
        Ok(())
    }

    fn completable(&self) -> bool {
        true
    }

    fn complete(
        &mut self,
        device: &str,
        drivers: &DriverRegistry,
    ) -> Result<()> {
        if !self.synced {
            return Err(Error::BlockJobNotReady(device.to_string()));
        }
        if let Err(source) = self.target.open_backing(drivers) {
            return Err(Error::OpenFile {
                filename: self.target.filename().to_string(),
                source,
            });
        }
        self.should_complete = true;
        Ok(())
    }

    fn finalize(
        self: Box<Self>,
        bs: &mut BlockNode,
        ok: bool,
    ) -> std::result::Result<(), BackendError> {
        let mut this = *self;
        if ok && this.should_complete {
            this.target.flush()?;
            let mut old = bs.replace_with(this.target);
            old.close();
        } else {
            this.target.close();
        }
        Ok(())
    }
}

impl BlockLayer {
    /// Start mirroring a drive to a new or existing target image.
    pub fn drive_mirror(&mut self, args: &DriveMirror) -> Result<JobId> {
        let device = args.device.as_str();
        let granularity = args.granularity;
        if granularity != 0
            && (!(MIN_GRANULARITY..=MAX_GRANULARITY).contains(&granularity)
                || !granularity.is_power_of_two())
        {
            return Err(Error::InvalidParameter(device.to_string()));
        }
        let granularity = match granularity {
            0 => DEFAULT_GRANULARITY,
            g => g,
        };
        let buf_size = match args.buf_size {
            None | Some(0) => DEFAULT_BUF_SIZE,
            Some(n) => u64::try_from(n)
                .map_err(|_| Error::InvalidParameter("buf-size".into()))?,
        };
        let speed = check_speed(args.speed)?;

        let key = self.find_device(device)?;
        let drive = self.drive_mut(key)?;
        if !drive.node.is_inserted() {
            return Err(Error::DeviceHasNoMedium(device.to_string()));
        }
        let format = match (&args.format, args.mode) {
            (Some(f), _) => Some(f.clone()),
            (None, NewImageMode::Existing) => None,
            (None, NewImageMode::AbsolutePaths) => {
                drive.node.format_name().map(str::to_string)
            }
        };
        let drv = match &format {
            Some(f) => Some(
                self.drivers
                    .find_format(f)
                    .ok_or_else(|| Error::InvalidBlockFormat(f.clone()))?,
            ),
            None => None,
        };

        let drive = self.drive_mut(key)?;
        if drive.node.in_use() {
            return Err(Error::DeviceInUse(device.to_string()));
        }
        let flags = drive.node.open_flags() | OpenFlags::RDWR;
        let source = drive
            .node
            .backing()
            .map(|b| {
                (b.filename().to_string(), b.format_name().map(str::to_string))
            });
        let sync = match (args.sync, &source) {
            (MirrorSyncMode::Top, None) => MirrorSyncMode::Full,
            (sync, _) => sync,
        };
        let len = drive
            .node
            .length()
            .map_err(|e| Error::backend("bdrv_getlength failed", e))?;

        if let Some(fmt) = &format {
            match (sync, args.mode, &source) {
                (_, NewImageMode::Existing, _) => {}
                (MirrorSyncMode::Full, _, _) | (_, _, None) => {
                    self.drivers.img_create(
                        &args.target, fmt, None, None, Some(len), flags, None,
                    )?;
                }
                (_, NewImageMode::AbsolutePaths, Some((file, file_fmt))) => {
                    self.drivers.img_create(
                        &args.target,
                        fmt,
                        Some(file),
                        file_fmt.as_deref(),
                        Some(len),
                        flags,
                        None,
                    )?;
                }
            }
        }

        let mut target = BlockNode::new("");
        target
            .open(
                &self.drivers,
                Some(&args.target),
                &BTreeMap::new(),
                flags | OpenFlags::NO_BACKING,
                drv,
            )
            .map_err(|source| Error::OpenFile {
                filename: args.target.clone(),
                source,
            })?;

        check_stop_policy(self, key, args.on_source_error, "on-source-error")?;
        let mut job = MirrorJob {
            target,
            sync,
            granularity,
            buf_size,
            len,
            dirty: BTreeSet::new(),
            synced: false,
            should_complete: false,
            on_source_error: args.on_source_error,
            on_target_error: args.on_target_error,
        };
        let drive = self.drive_mut(key)?;
        job.seed(&mut drive.node)
            .map_err(|e| Error::backend("Could not scan source", e))?;

        let id =
            self.attach_job(key, JobKind::Mirror, speed, len, Box::new(job))?;
        info!(self.log, "drive mirror started";
            "device" => device, "target" => &args.target,
            "granularity" => granularity);
        Ok(id)
    }
}
