// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Long-running block jobs.
//!
//! A job is attached to the top node of the drive it operates on and is
//! advanced one chunk at a time by [BlockLayer::poll].  While attached, the
//! node is marked in use and the job holds a reference on the drive, which
//! is released through the deferred queue once the job completes.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use slog::{info, o, warn, Logger};

use crate::backend::{BackendError, DriverRegistry};
use crate::drive::DriveKey;
use crate::error::{Error, Result};
use crate::events::{BlockEvent, BlockJobEventInfo, BlockJobInfo, IoOperation};
use crate::layer::BlockLayer;
use crate::node::{BlockNode, ErrorAction, OnError};
use crate::throttle::SLICE_TIME;

mod backup;
mod commit;
mod mirror;
mod stream;

pub use backup::DriveBackup;
pub use mirror::DriveMirror;

#[cfg(test)]
mod test;

pub type JobId = u64;

#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum JobKind {
    Stream,
    Commit,
    Mirror,
    Backup,
}

/// Which part of the source a mirror or backup job copies.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum MirrorSyncMode {
    /// Only the top layer of the chain.
    Top,
    #[default]
    Full,
    /// Only data touched by the guest while the job runs.
    None,
}

/// Slice-based limiter for job copy speed.  A quota of zero is unlimited.
#[derive(Debug, Default)]
struct RateLimit {
    slice_quota: u64,
    slice_end: Option<Instant>,
    dispatched: u64,
}

impl RateLimit {
    fn set_speed(&mut self, bytes_per_sec: u64) {
        let slices_per_sec = 1000 / SLICE_TIME.as_millis() as u64;
        self.slice_quota = bytes_per_sec / slices_per_sec;
    }

    /// Account `n` bytes, returning how long to sleep before the next chunk.
    fn calculate_delay(&mut self, n: u64, now: Instant) -> Option<Duration> {
        if self.slice_quota == 0 {
            return None;
        }
        let end = match self.slice_end {
            Some(end) if end >= now => end,
            _ => {
                self.dispatched = 0;
                *self.slice_end.insert(now + SLICE_TIME)
            }
        };
        if self.dispatched == 0 || self.dispatched + n <= self.slice_quota {
            self.dispatched += n;
            None
        } else {
            self.dispatched = n;
            Some(end - now)
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Progress {
    pub offset: u64,
    pub len: u64,
}

/// Outcome of one successful step of a job.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Chunk {
    /// Progress was made, copying this many bytes.
    Copied(u64),
    /// Nothing to do until the guest writes something.
    Idle,
    /// First reached a synchronized state.
    Ready,
    Finished,
}

#[derive(Debug)]
pub(crate) struct JobIoError {
    pub err: BackendError,
    pub is_read: bool,
    pub policy: OnError,
    /// Length of the chunk that failed.
    pub len: u64,
}

#[derive(Debug)]
pub(crate) enum Step {
    Progress,
    Idle,
    Done(std::result::Result<(), String>),
}

/// The kind-specific half of a job.
pub(crate) trait JobDriver: Send {
    fn step(
        &mut self,
        progress: &mut Progress,
        bs: &mut BlockNode,
    ) -> std::result::Result<Chunk, JobIoError>;

    /// Move past a chunk whose failure is being ignored.
    fn skip(&mut self, progress: &mut Progress, err: &JobIoError) {
        progress.offset += err.len;
    }

    /// Observe a guest write to the node before it lands.
    fn before_write(
        &mut self,
        _bs: &mut BlockNode,
        _offset: u64,
        _len: u64,
    ) -> std::result::Result<(), BackendError> {
        Ok(())
    }

    fn completable(&self) -> bool {
        false
    }

    fn complete(
        &mut self,
        device: &str,
        _drivers: &DriverRegistry,
    ) -> Result<()> {
        Err(Error::BlockJobNotReady(device.to_string()))
    }

    /// Apply (`ok`) or discard the job's result to the node.
    fn finalize(
        self: Box<Self>,
        bs: &mut BlockNode,
        ok: bool,
    ) -> std::result::Result<(), BackendError>;
}

pub struct BlockJob {
    id: JobId,
    kind: JobKind,
    device: String,
    log: Logger,
    progress: Progress,
    speed: u64,
    limit: RateLimit,
    sleep_until: Option<Instant>,
    paused: bool,
    cancelled: bool,
    busy: bool,
    first_error: Option<String>,
    driver: Box<dyn JobDriver>,
}

impl BlockJob {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn progress(&self) -> Progress {
        self.progress
    }

    pub fn speed(&self) -> u64 {
        self.speed
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn info(&self) -> BlockJobInfo {
        BlockJobInfo {
            kind: self.kind,
            device: self.device.clone(),
            len: self.progress.len,
            offset: self.progress.offset,
            busy: self.busy,
            paused: self.paused,
            speed: self.speed,
        }
    }

    fn event_info(&self, error: Option<String>) -> BlockJobEventInfo {
        BlockJobEventInfo {
            kind: self.kind,
            device: self.device.clone(),
            len: self.progress.len,
            offset: self.progress.offset,
            speed: self.speed,
            error,
        }
    }

    pub(crate) fn is_runnable(&self, now: Instant) -> bool {
        !self.paused && self.sleep_until.map_or(true, |t| t <= now)
    }

    pub(crate) fn sleeping_until(&self) -> Option<Instant> {
        match self.paused {
            true => None,
            false => self.sleep_until,
        }
    }

    fn set_speed(&mut self, speed: i64) -> Result<()> {
        let speed = check_speed(speed)?;
        self.speed = speed;
        self.limit.set_speed(speed);
        Ok(())
    }

    fn pause(&mut self) {
        self.paused = true;
        self.busy = false;
    }

    fn resume(&mut self) {
        self.paused = false;
        self.sleep_until = None;
    }

    pub(crate) fn cancel(&mut self) {
        self.cancelled = true;
        self.resume();
    }

    fn complete(&mut self, drivers: &DriverRegistry) -> Result<()> {
        if self.paused || self.cancelled || !self.driver.completable() {
            return Err(Error::BlockJobNotReady(self.device.clone()));
        }
        self.driver.complete(&self.device, drivers)?;
        self.resume();
        Ok(())
    }

    fn final_result(&mut self) -> std::result::Result<(), String> {
        match self.first_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub(crate) fn before_write(
        &mut self,
        bs: &mut BlockNode,
        offset: u64,
        len: u64,
    ) -> std::result::Result<(), BackendError> {
        self.driver.before_write(bs, offset, len)
    }

    /// Advance the job by one chunk.
    pub(crate) fn run_step(
        &mut self,
        bs: &mut BlockNode,
        now: Instant,
        events: &mut Vec<BlockEvent>,
    ) -> Step {
        if self.cancelled {
            return Step::Done(self.final_result());
        }
        self.sleep_until = None;
        self.busy = true;

        match self.driver.step(&mut self.progress, bs) {
            Ok(Chunk::Copied(n)) => {
                if let Some(delay) = self.limit.calculate_delay(n, now) {
                    self.sleep_until = Some(now + delay);
                    self.busy = false;
                }
                Step::Progress
            }
            Ok(Chunk::Idle) => {
                self.busy = false;
                Step::Idle
            }
            Ok(Chunk::Ready) => {
                info!(self.log, "job ready");
                events.push(BlockEvent::BlockJobReady(self.event_info(None)));
                Step::Progress
            }
            Ok(Chunk::Finished) => Step::Done(self.final_result()),
            Err(e) => {
                let action = e.policy.action(&e.err);
                let operation = match e.is_read {
                    true => IoOperation::Read,
                    false => IoOperation::Write,
                };
                let action_name: &'static str = action.into();
                warn!(self.log, "job I/O error";
                    "error" => %e.err,
                    "action" => action_name);
                events.push(BlockEvent::BlockJobError {
                    device: self.device.clone(),
                    operation,
                    action,
                });
                match action {
                    ErrorAction::Stop => {
                        self.pause();
                        Step::Progress
                    }
                    ErrorAction::Report => Step::Done(Err(e.err.to_string())),
                    ErrorAction::Ignore => {
                        self.first_error.get_or_insert(e.err.to_string());
                        self.driver.skip(&mut self.progress, &e);
                        Step::Progress
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for BlockJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockJob")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("device", &self.device)
            .field("progress", &self.progress)
            .field("speed", &self.speed)
            .field("paused", &self.paused)
            .field("cancelled", &self.cancelled)
            .finish()
    }
}

fn check_speed(speed: i64) -> Result<u64> {
    u64::try_from(speed).map_err(|_| Error::InvalidParameter("speed".into()))
}

/// Policies that pause the job need a device to report the pause to.
fn check_stop_policy(
    layer: &BlockLayer,
    key: DriveKey,
    policy: OnError,
    name: &str,
) -> Result<()> {
    let attached = layer.drive(key).is_some_and(|d| d.device().is_some());
    match policy.may_stop() && !attached {
        true => Err(Error::InvalidParameter(name.to_string())),
        false => Ok(()),
    }
}

impl BlockLayer {
    /// Fail unless a new job may be attached to the drive.
    pub(crate) fn check_job_slot(&self, key: DriveKey) -> Result<()> {
        let drive = self
            .drive(key)
            .ok_or_else(|| Error::Generic("drive no longer exists".into()))?;
        match drive.node.in_use() || drive.node.job().is_some() {
            true => Err(Error::DeviceInUse(drive.id.clone())),
            false => Ok(()),
        }
    }

    /// Attach a job to the drive's top node, claiming the node and taking a
    /// reference on the drive for the life of the job.
    fn attach_job(
        &mut self,
        key: DriveKey,
        kind: JobKind,
        speed: u64,
        len: u64,
        driver: Box<dyn JobDriver>,
    ) -> Result<JobId> {
        self.check_job_slot(key)?;
        let id = self.alloc_job_id();
        let drive = self.drive_mut(key)?;
        let device = drive.node.device_name().to_string();
        let kind_name: &'static str = kind.into();
        let mut job = BlockJob {
            id,
            kind,
            device: device.clone(),
            log: self.drive_log(&device).new(o!("job" => kind_name)),
            progress: Progress { offset: 0, len },
            speed,
            limit: RateLimit::default(),
            sleep_until: None,
            paused: false,
            cancelled: false,
            busy: true,
            first_error: None,
            driver,
        };
        job.limit.set_speed(speed);
        info!(job.log, "job started"; "len" => len, "speed" => speed);

        let drive = self.drive_mut(key)?;
        drive.node.set_in_use(true);
        drive.node.job = Some(Box::new(job));
        self.drive_get_ref(key);
        Ok(id)
    }

    /// Tear down a finished job: apply or discard its result, announce the
    /// outcome, and queue the release of the drive reference it held.
    pub(crate) fn job_completed(
        &mut self,
        key: DriveKey,
        mut job: Box<BlockJob>,
        result: std::result::Result<(), String>,
    ) {
        let cancelled = job.cancelled;
        let ok = result.is_ok() && !cancelled;
        let driver = std::mem::replace(&mut job.driver, Box::new(Finished));

        let mut result = result;
        if let Ok(drive) = self.drive_mut(key) {
            if let Err(e) = driver.finalize(&mut drive.node, ok) {
                if result.is_ok() {
                    result = Err(e.to_string());
                }
            }
            drive.node.set_in_use(false);
        }

        let event = match cancelled {
            true => BlockEvent::BlockJobCancelled(job.event_info(None)),
            false => {
                BlockEvent::BlockJobCompleted(job.event_info(result.err()))
            }
        };
        info!(job.log, "job finished"; "cancelled" => cancelled);
        self.emit(event);
        self.drive_put_ref_deferred(key);
    }

    fn find_job_mut(&mut self, device: &str) -> Result<&mut BlockJob> {
        self.drives
            .by_device_mut(device)
            .and_then(|d| d.node.job.as_deref_mut())
            .ok_or_else(|| Error::BlockJobNotActive(device.to_string()))
    }

    pub fn block_job_set_speed(
        &mut self,
        device: &str,
        speed: i64,
    ) -> Result<()> {
        self.find_job_mut(device)?.set_speed(speed)
    }

    /// Request cancellation.  The job finishes on a later poll.
    pub fn block_job_cancel(
        &mut self,
        device: &str,
        force: bool,
    ) -> Result<()> {
        let job = self.find_job_mut(device)?;
        if job.paused && !force {
            return Err(Error::BlockJobPaused(device.to_string()));
        }
        info!(job.log, "job cancel requested");
        job.cancel();
        Ok(())
    }

    pub fn block_job_pause(&mut self, device: &str) -> Result<()> {
        let job = self.find_job_mut(device)?;
        info!(job.log, "job paused");
        job.pause();
        Ok(())
    }

    pub fn block_job_resume(&mut self, device: &str) -> Result<()> {
        let job = self.find_job_mut(device)?;
        info!(job.log, "job resumed");
        job.resume();
        Ok(())
    }

    pub fn block_job_complete(&mut self, device: &str) -> Result<()> {
        let drivers = &self.drivers;
        let job = self
            .drives
            .by_device_mut(device)
            .and_then(|d| d.node.job.as_deref_mut())
            .ok_or_else(|| Error::BlockJobNotActive(device.to_string()))?;
        job.complete(drivers)
    }

    pub fn query_block_jobs(&self) -> Vec<BlockJobInfo> {
        self.drives
            .iter()
            .filter_map(|d| d.node.job())
            .map(BlockJob::info)
            .collect()
    }

    /// Cancel the drive's job and finish it before returning.
    pub(crate) fn block_job_cancel_sync(&mut self, key: DriveKey) {
        let Some(drive) = self.drives.get_mut(key) else {
            return;
        };
        let Some(mut job) = drive.node.job.take() else {
            return;
        };
        job.cancel();
        let result = job.final_result();
        self.job_completed(key, job, result);
    }
}

/// Stand-in driver left behind once the real one has been finalized.
struct Finished;

impl JobDriver for Finished {
    fn step(
        &mut self,
        _progress: &mut Progress,
        _bs: &mut BlockNode,
    ) -> std::result::Result<Chunk, JobIoError> {
        Ok(Chunk::Finished)
    }

    fn finalize(
        self: Box<Self>,
        _bs: &mut BlockNode,
        _ok: bool,
    ) -> std::result::Result<(), BackendError> {
        Ok(())
    }
}
