// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Streaming: pull data from the backing chain into the active layer, then
//! cut the streamed layers out of the chain.

use slog::info;

use super::{check_speed, check_stop_policy, Chunk, JobDriver, JobIoError};
use super::{JobId, JobKind, Progress};
use crate::backend::BackendError;
use crate::error::{Error, Result};
use crate::layer::BlockLayer;
use crate::node::{BlockNode, OnError};

const CHUNK: u64 = 64 * 1024;

struct StreamJob {
    /// Depth of the node streaming stops at.  `None` streams everything.
    base: Option<usize>,
    on_error: OnError,
}

impl JobDriver for StreamJob {
    fn step(
        &mut self,
        progress: &mut Progress,
        bs: &mut BlockNode,
    ) -> std::result::Result<Chunk, JobIoError> {
        if progress.offset >= progress.len {
            return Ok(Chunk::Finished);
        }
        let offset = progress.offset;
        let io_err = |err, len| JobIoError {
            err,
            is_read: true,
            policy: self.on_error,
            len,
        };

        let want = CHUNK.min(progress.len - offset);
        let (allocated, n) =
            bs.allocated_extent(offset, want).map_err(|e| io_err(e, want))?;
        if allocated {
            progress.offset += n;
            return Ok(Chunk::Copied(0));
        }
        let above_base = bs
            .is_allocated_above(1, self.base, offset, n)
            .map_err(|e| io_err(e, n))?;
        if !above_base {
            progress.offset += n;
            return Ok(Chunk::Copied(0));
        }

        let mut buf = vec![0u8; n as usize];
        bs.read(offset, &mut buf).map_err(|e| io_err(e, n))?;
        bs.write(offset, &buf).map_err(|e| io_err(e, n))?;
        progress.offset += n;
        Ok(Chunk::Copied(n))
    }

    fn finalize(
        self: Box<Self>,
        bs: &mut BlockNode,
        ok: bool,
    ) -> std::result::Result<(), BackendError> {
        match ok {
            true => bs.drop_intermediate(0, self.base),
            false => Ok(()),
        }
    }
}

impl BlockLayer {
    /// Start streaming into the active layer of `device`, from the whole
    /// chain or from the layers above `base`.
    pub fn block_stream(
        &mut self,
        device: &str,
        base: Option<&str>,
        speed: Option<i64>,
        on_error: Option<OnError>,
    ) -> Result<JobId> {
        let key = self.find_device(device)?;
        let on_error = on_error.unwrap_or_default();
        let speed = check_speed(speed.unwrap_or(0))?;

        let drive = self.drive_mut(key)?;
        let base = match base {
            Some(name) => Some(
                drive
                    .node
                    .find_backing_image(name)
                    .ok_or_else(|| Error::BaseNotFound(name.to_string()))?,
            ),
            None => None,
        };
        let len = drive
            .node
            .length()
            .map_err(|e| Error::backend("Could not get length", e))?;

        check_stop_policy(self, key, on_error, "on-error")?;
        let job = Box::new(StreamJob { base, on_error });
        let id = self.attach_job(key, JobKind::Stream, speed, len, job)?;
        info!(self.log, "block stream started";
            "device" => device, "base" => base);
        Ok(id)
    }
}
