// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Live commit: merge the layers between `top` and `base` down into `base`
//! while the active layer stays in use.

use slog::info;

use super::{check_speed, check_stop_policy, Chunk, JobDriver, JobIoError};
use super::{JobId, JobKind, Progress};
use crate::backend::{BackendError, OpenFlags};
use crate::error::{Error, Result};
use crate::layer::BlockLayer;
use crate::node::{BlockNode, OnError};

const CHUNK: u64 = 64 * 1024;

struct CommitJob {
    top: usize,
    base: usize,
    on_error: OnError,
    /// Flags to restore on the base and on the overlay of top when done.
    base_flags: OpenFlags,
    overlay_flags: OpenFlags,
}

impl CommitJob {
    /// Make the nodes the job writes to writable.
    fn new(
        bs: &mut BlockNode,
        top: usize,
        base: usize,
        on_error: OnError,
    ) -> std::result::Result<Self, BackendError> {
        let reopen_rw = |node: Option<&mut BlockNode>| {
            let node = node.ok_or(BackendError::InvalidArgument)?;
            let flags = node.open_flags();
            if !flags.contains(OpenFlags::RDWR) {
                node.reopen(flags | OpenFlags::RDWR)?;
            }
            Ok::<_, BackendError>(flags)
        };
        let base_flags = reopen_rw(bs.chain_node_mut(base))?;
        let overlay_flags = match reopen_rw(bs.chain_node_mut(top - 1)) {
            Ok(flags) => flags,
            Err(e) => {
                if let Some(node) = bs.chain_node_mut(base) {
                    let _ = node.reopen(base_flags);
                }
                return Err(e);
            }
        };
        Ok(Self { top, base, on_error, base_flags, overlay_flags })
    }
}

impl JobDriver for CommitJob {
    fn step(
        &mut self,
        progress: &mut Progress,
        bs: &mut BlockNode,
    ) -> std::result::Result<Chunk, JobIoError> {
        if progress.offset >= progress.len {
            return Ok(Chunk::Finished);
        }
        let offset = progress.offset;
        let n = CHUNK.min(progress.len - offset);
        let io_err = |err, is_read| JobIoError {
            err,
            is_read,
            policy: self.on_error,
            len: n,
        };

        let dirty = bs
            .is_allocated_above(self.top, Some(self.base), offset, n)
            .map_err(|e| io_err(e, true))?;
        if !dirty {
            progress.offset += n;
            return Ok(Chunk::Copied(0));
        }

        let mut buf = vec![0u8; n as usize];
        bs.chain_node_mut(self.top)
            .ok_or(BackendError::InvalidArgument)
            .and_then(|top| top.read(offset, &mut buf))
            .map_err(|e| io_err(e, true))?;
        bs.chain_node_mut(self.base)
            .ok_or(BackendError::InvalidArgument)
            .and_then(|base| base.write(offset, &buf))
            .map_err(|e| io_err(e, false))?;
        progress.offset += n;
        Ok(Chunk::Copied(n))
    }

    fn finalize(
        self: Box<Self>,
        bs: &mut BlockNode,
        ok: bool,
    ) -> std::result::Result<(), BackendError> {
        let result = match ok {
            true => bs.drop_intermediate(self.top - 1, Some(self.base)),
            false => Ok(()),
        };
        // Once dropped, the layers between the overlay and base are gone and
        // base sits right below the overlay.
        let base = match (ok, &result) {
            (true, Ok(())) => self.top,
            _ => self.base,
        };
        if let Some(node) = bs.chain_node_mut(base) {
            if node.open_flags() != self.base_flags {
                node.reopen(self.base_flags)?;
            }
        }
        if let Some(node) = bs.chain_node_mut(self.top - 1) {
            if node.open_flags() != self.overlay_flags {
                node.reopen(self.overlay_flags)?;
            }
        }
        result
    }
}

impl BlockLayer {
    /// Start merging the layers from `top` down into `base`.  Without `top`
    /// the layer right below the active one is the default, which must not
    /// be the active layer itself.
    pub fn block_commit(
        &mut self,
        device: &str,
        base: Option<&str>,
        top: Option<&str>,
        speed: Option<i64>,
    ) -> Result<JobId> {
        let on_error = OnError::Report;
        let key = self.find_device(device)?;
        let speed = check_speed(speed.unwrap_or(0))?;

        let drive = self.drive_mut(key)?;
        let base_depth = match base {
            Some(name) => drive.node.find_backing_image(name),
            None => Some(drive.node.find_base()),
        }
        .ok_or_else(|| {
            Error::BaseNotFound(base.unwrap_or("NULL").to_string())
        })?;

        self.drain_all();
        let drive = self.drive_mut(key)?;
        let top_depth = match top {
            Some(name) if name != drive.node.filename() => {
                drive.node.find_backing_image(name)
            }
            _ => Some(0),
        }
        .ok_or_else(|| {
            Error::Generic(format!(
                "Top image file {} not found",
                top.unwrap_or("NULL")
            ))
        })?;

        if top_depth == 0 {
            return Err(Error::Generic(
                "Top image as the active layer is currently unsupported"
                    .into(),
            ));
        }
        if top_depth == base_depth {
            return Err(Error::Generic(
                "Invalid files for merge: top and base are the same".into(),
            ));
        }
        if base_depth < top_depth {
            return Err(Error::Generic(format!(
                "Base '{}' is not below top image",
                base.unwrap_or("NULL")
            )));
        }
        let len = drive
            .node
            .chain_node(top_depth)
            .map_or(Err(BackendError::InvalidArgument), |n| n.length())
            .map_err(|e| Error::backend("Could not get length", e))?;

        check_stop_policy(self, key, on_error, "on-error")?;
        self.check_job_slot(key)?;
        let drive = self.drive_mut(key)?;
        let job =
            CommitJob::new(&mut drive.node, top_depth, base_depth, on_error)
                .map_err(|e| {
                    Error::backend("Could not reopen for commit", e)
                })?;
        if let Some(base) = drive.node.chain_node_mut(base_depth) {
            let base_len = base.length().unwrap_or(0);
            if base_len < len {
                if let Err(e) = base.truncate(len) {
                    let _ = Box::new(job).finalize(&mut drive.node, false);
                    return Err(Error::backend("Could not resize base", e));
                }
            }
        }

        let id =
            self.attach_job(key, JobKind::Commit, speed, len, Box::new(job))?;
        info!(self.log, "block commit started";
            "device" => device, "top" => top_depth, "base" => base_depth);
        Ok(id)
    }
}
