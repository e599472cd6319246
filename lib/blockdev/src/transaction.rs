// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transactions: a list of actions that take effect together or not at
//! all, as far as the guest can tell.
//!
//! Every action is prepared in order.  If all preparations succeed each
//! action is committed; otherwise every action prepared so far (the failed
//! one included) is aborted.  Either way every prepared action is cleaned
//! up afterwards.  This guards against logical failures only: nothing is
//! logged to disk, and a crash part way through can leave some actions
//! applied.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use slog::{info, warn};

use crate::backend::OpenFlags;
use crate::commands::NewImageMode;
use crate::drive::DriveKey;
use crate::error::{Error, Result};
use crate::job::{DriveBackup, JobId};
use crate::layer::BlockLayer;
use crate::node::BlockNode;


const DEFAULT_SNAPSHOT_FORMAT: &str = "qcow2";

/// Arguments of an external snapshot: a new image is put in front of the
/// drive's current one, which becomes its backing image.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BlockdevSnapshot {
    pub device: String,
    pub snapshot_file: String,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub mode: NewImageMode,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum TransactionAction {
    BlockdevSnapshotSync(BlockdevSnapshot),
    DriveBackup(DriveBackup),
    /// Always fails to prepare, failing the whole transaction.
    Abort,
}

impl TransactionAction {
    /// The state record which carries this action through the transaction.
    fn into_ops(self) -> Box<dyn ActionOps> {
        match self {
            TransactionAction::BlockdevSnapshotSync(args) => {
                Box::new(ExternalSnapshot { args, old: None, new_bs: None })
            }
            TransactionAction::DriveBackup(args) => {
                Box::new(BackupAction { args, job: None })
            }
            TransactionAction::Abort => Box::new(AbortAction),
        }
    }
}

/// One action's part in a transaction.  Only `prepare` may fail.
pub(crate) trait ActionOps {
    fn kind(&self) -> &'static str;

    fn prepare(&mut self, layer: &mut BlockLayer) -> Result<()>;

    fn commit(&mut self, _layer: &mut BlockLayer) {}

    fn abort(&mut self, _layer: &mut BlockLayer) {}

    fn clean(&mut self, _layer: &mut BlockLayer) {}
}

struct ExternalSnapshot {
    args: BlockdevSnapshot,
    old: Option<DriveKey>,
    new_bs: Option<BlockNode>,
}

impl ActionOps for ExternalSnapshot {
    fn kind(&self) -> &'static str {
        "blockdev-snapshot-sync"
    }

    fn prepare(&mut self, layer: &mut BlockLayer) -> Result<()> {
        let args = &self.args;
        let device = args.device.as_str();
        let format =
            args.format.as_deref().unwrap_or(DEFAULT_SNAPSHOT_FORMAT);
        let drv = layer
            .drivers
            .find_format(format)
            .ok_or_else(|| Error::InvalidBlockFormat(format.to_string()))?;

        let key = layer.find_device(device)?;
        let drive = layer.drive_mut(key)?;
        if !drive.node.is_inserted() {
            return Err(Error::DeviceHasNoMedium(device.to_string()));
        }
        if drive.node.in_use() {
            return Err(Error::DeviceInUse(device.to_string()));
        }
        if !drive.node.is_read_only() {
            drive.node.flush().map_err(|_| Error::IoError)?;
        }

        let flags = drive.node.open_flags();
        let old_file = drive.node.filename().to_string();
        let old_format = drive.node.format_name().map(str::to_string);
        if args.mode != NewImageMode::Existing {
            layer.drivers.img_create(
                &args.snapshot_file,
                format,
                Some(&old_file),
                old_format.as_deref(),
                None,
                flags,
                None,
            )?;
        }

        let mut new_bs = BlockNode::new("");
        new_bs
            .open(
                &layer.drivers,
                Some(&args.snapshot_file),
                &BTreeMap::new(),
                flags | OpenFlags::NO_BACKING,
                Some(drv),
            )
            .map_err(|source| Error::OpenFile {
                filename: args.snapshot_file.clone(),
                source,
            })?;
        self.old = Some(key);
        self.new_bs = Some(new_bs);
        Ok(())
    }

    fn commit(&mut self, layer: &mut BlockLayer) {
        let (Some(key), Some(new_bs)) = (self.old, self.new_bs.take()) else {
            return;
        };
        let Some(drive) = layer.drives.get_mut(key) else {
            return;
        };
        drive.node.append(new_bs);

        // The previous top is now a backing image and no longer written.
        if let Some(old) = drive.node.chain_node_mut(1) {
            let flags = old.open_flags() - OpenFlags::RDWR;
            if let Err(e) = old.reopen(flags) {
                warn!(layer.log, "could not reopen old image read-only";
                    "device" => &self.args.device, "error" => %e);
            }
        }
        info!(layer.log, "snapshot taken";
            "device" => &self.args.device,
            "file" => &self.args.snapshot_file);
    }

    fn abort(&mut self, _layer: &mut BlockLayer) {
        if let Some(mut new_bs) = self.new_bs.take() {
            new_bs.close();
        }
    }
}

struct BackupAction {
    args: DriveBackup,
    job: Option<(DriveKey, JobId)>,
}

impl ActionOps for BackupAction {
    fn kind(&self) -> &'static str {
        "drive-backup"
    }

    fn prepare(&mut self, layer: &mut BlockLayer) -> Result<()> {
        let id = layer.drive_backup(&self.args)?;
        let key = layer.find_device(&self.args.device)?;
        self.job = Some((key, id));
        Ok(())
    }

    fn abort(&mut self, layer: &mut BlockLayer) {
        let Some((key, id)) = self.job else {
            return;
        };
        // The job may have finished already, and another taken its place.
        let same_job = layer
            .drive(key)
            .and_then(|d| d.node().job())
            .is_some_and(|job| job.id() == id);
        if same_job {
            layer.block_job_cancel_sync(key);
        }
    }
}

struct AbortAction;

impl ActionOps for AbortAction {
    fn kind(&self) -> &'static str {
        "abort"
    }

    fn prepare(&mut self, _layer: &mut BlockLayer) -> Result<()> {
        Err(Error::TransactionAborted)
    }

    fn commit(&mut self, _layer: &mut BlockLayer) {
        unreachable!("abort action committed");
    }
}

impl BlockLayer {
    /// Run `actions` as one transaction.  Returns the error of the first
    /// action that failed to prepare.
    pub fn transaction(
        &mut self,
        actions: Vec<TransactionAction>,
    ) -> Result<()> {
        let states =
            actions.into_iter().map(TransactionAction::into_ops).collect();
        self.run_actions(states)
    }

    pub(crate) fn run_actions(
        &mut self,
        mut states: Vec<Box<dyn ActionOps>>,
    ) -> Result<()> {
        // Snapshots must see a consistent point in time.
        self.drain_all();

        let mut failure = None;
        let mut prepared = 0;
        for (index, state) in states.iter_mut().enumerate() {
            prepared += 1;
            if let Err(e) = state.prepare(self) {
                warn!(self.log, "transaction action failed";
                    "index" => index, "action" => state.kind(),
                    "error" => %e);
                failure = Some(e);
                break;
            }
        }
        states.truncate(prepared);

        match failure {
            None => {
                for state in states.iter_mut() {
                    state.commit(self);
                }
                info!(self.log, "transaction committed";
                    "actions" => states.len());
            }
            Some(_) => {
                for state in states.iter_mut() {
                    state.abort(self);
                }
                info!(self.log, "transaction aborted";
                    "actions" => states.len());
            }
        }
        for state in states.iter_mut() {
            state.clean(self);
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Take an external snapshot of a single drive.
    pub fn blockdev_snapshot_sync(
        &mut self,
        device: &str,
        snapshot_file: &str,
        format: Option<&str>,
        mode: Option<NewImageMode>,
    ) -> Result<()> {
        let args = BlockdevSnapshot {
            device: device.to_string(),
            snapshot_file: snapshot_file.to_string(),
            format: format.map(str::to_string),
            mode: mode.unwrap_or_default(),
        };
        self.transaction(vec![TransactionAction::BlockdevSnapshotSync(args)])
    }
}
