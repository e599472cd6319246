// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Point-in-time backup.  Clusters are copied to the target in order, and
//! any cluster the guest is about to overwrite is copied first.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use slog::info;

use super::{check_speed, check_stop_policy, Chunk, JobDriver, JobIoError};
use super::{JobId, JobKind, MirrorSyncMode, Progress};
use crate::backend::{BackendError, OpenFlags};
use crate::commands::NewImageMode;
use crate::error::{Error, Result};
use crate::layer::BlockLayer;
use crate::node::{BlockNode, OnError};

const CLUSTER: u64 = 64 * 1024;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DriveBackup {
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
}

struct BackupJob {
    target: BlockNode,
    sync: MirrorSyncMode,
    len: u64,
    /// Clusters already on the target.
    done: BTreeSet<u64>,
    on_source_error: OnError,
    on_target_error: OnError,
}

impl BackupJob {
    fn copy_cluster(
        &mut self,
        bs: &mut BlockNode,
        cluster: u64,
    ) -> std::result::Result<u64, JobIoError> {
        let offset = cluster * CLUSTER;
        let n = CLUSTER.min(self.len - offset);
        let mut buf = vec![0u8; n as usize];
        bs.read(offset, &mut buf).map_err(|err| JobIoError {
            err,
            is_read: true,
            policy: self.on_source_error,
            len: n,
        })?;
        self.target.write(offset, &buf).map_err(|err| JobIoError {
            err,
            is_read: false,
            policy: self.on_target_error,
            len: n,
        })?;
        self.done.insert(cluster);
        Ok(n)
    }
}

impl JobDriver for BackupJob {
    fn step(
        &mut self,
        progress: &mut Progress,
        bs: &mut BlockNode,
    ) -> std::result::Result<Chunk, JobIoError> {
        if self.sync == MirrorSyncMode::None {
            return Ok(Chunk::Idle);
        }
        if progress.offset >= progress.len {
            return Ok(Chunk::Finished);
        }
        let cluster = progress.offset / CLUSTER;
        let n = CLUSTER.min(self.len - cluster * CLUSTER);
        if self.done.contains(&cluster) {
            progress.offset += n;
            return Ok(Chunk::Copied(0));
        }
        if self.sync == MirrorSyncMode::Top {
            let (allocated, _) =
                bs.allocated_extent(cluster * CLUSTER, n).map_err(|err| {
                    JobIoError {
                        err,
                        is_read: true,
                        policy: self.on_source_error,
                        len: n,
                    }
                })?;
            if !allocated {
                progress.offset += n;
                return Ok(Chunk::Copied(0));
            }
        }
        let copied = self.copy_cluster(bs, cluster)?;
        progress.offset += n;
        Ok(Chunk::Copied(copied))
    }

    /// Failed clusters are retried.
    fn skip(&mut self, _progress: &mut Progress, _err: &JobIoError) {}

    fn before_write(
        &mut self,
        bs: &mut BlockNode,
        offset: u64,
        len: u64,
    ) -> std::result::Result<(), BackendError> {
        if len == 0 {
            return Ok(());
        }
        let first = offset / CLUSTER;
        let last = ((offset + len - 1) / CLUSTER)
            .min(self.len.saturating_sub(1) / CLUSTER);
        for cluster in first..=last {
            if !self.done.contains(&cluster) {
                self.copy_cluster(bs, cluster).map_err(|e| e.err)?;
            }
        }
        Ok(())
    }

    fn finalize(
        self: Box<Self>,
        _bs: &mut BlockNode,
        _ok: bool,
    ) -> std::result::Result<(), BackendError> {
        let mut this = *self;
        let res = this.target.flush();
        this.target.close();
        res
    }
}

impl BlockLayer {
    /// Start a point-in-time copy of a drive to a new or existing image.
    pub fn drive_backup(&mut self, args: &DriveBackup) -> Result<JobId> {
        let device = args.device.as_str();
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
        let describe = |n: &BlockNode| {
            (n.filename().to_string(), n.format_name().map(str::to_string))
        };
        let mut sync = args.sync;
        let source = match sync {
            MirrorSyncMode::Top => drive.node.backing().map(describe),
            MirrorSyncMode::None => Some(describe(&drive.node)),
            MirrorSyncMode::Full => None,
        };
        if sync == MirrorSyncMode::Top && source.is_none() {
            sync = MirrorSyncMode::Full;
        }
        let len = drive
            .node
            .length()
            .map_err(|e| Error::backend("bdrv_getlength failed", e))?;

        if args.mode != NewImageMode::Existing {
            if let Some(fmt) = &format {
                let (file, file_fmt) = match &source {
                    Some((file, fmt)) => (Some(file.as_str()), fmt.as_deref()),
                    None => (None, None),
                };
                self.drivers.img_create(
                    &args.target,
                    fmt,
                    file,
                    file_fmt,
                    Some(len),
                    flags,
                    None,
                )?;
            }
        }

        let mut target = BlockNode::new("");
        target
            .open(
                &self.drivers,
                Some(&args.target),
                &BTreeMap::new(),
                flags,
                drv,
            )
            .map_err(|source| Error::OpenFile {
                filename: args.target.clone(),
                source,
            })?;

        check_stop_policy(self, key, args.on_source_error, "on-source-error")?;
        let job = BackupJob {
            target,
            sync,
            len,
            done: BTreeSet::new(),
            on_source_error: args.on_source_error,
            on_target_error: args.on_target_error,
        };
        let id =
            self.attach_job(key, JobKind::Backup, speed, len, Box::new(job))?;
        info!(self.log, "drive backup started";
            "device" => device, "target" => &args.target);
        Ok(id)
    }
}
