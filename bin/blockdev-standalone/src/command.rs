// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scripted management commands, in the `{"execute": ..., "arguments": ...}`
//! shape of a machine monitor.

use blockdev::drive::AttachedDevice;
use blockdev::job::{DriveBackup, DriveMirror};
use blockdev::node::OnError;
use blockdev::throttle::IoLimits;
use blockdev::transaction::{BlockdevSnapshot, TransactionAction};
use blockdev::{BlockLayer, Drive, Error, ErrorClass, IfType};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
#[serde(tag = "execute", content = "arguments", rename_all = "kebab-case")]
pub enum Command {
    /// Admit a drive from a legacy option string.
    DriveAdd {
        opts: String,
    },
    DriveDel {
        id: String,
    },
    /// Plug a guest device into a drive.
    DeviceAdd {
        drive: String,
        driver: String,
        #[serde(default)]
        removable: bool,
    },
    /// Unplug the guest device, releasing the drive with it.
    DeviceDel {
        drive: String,
    },
    Eject {
        device: String,
        #[serde(default)]
        force: bool,
    },
    Change {
        device: String,
        target: String,
        #[serde(default)]
        arg: Option<String>,
    },
    BlockPasswd {
        device: String,
        password: String,
    },
    BlockSetIoThrottle {
        device: String,
        #[serde(flatten)]
        limits: IoLimits,
    },
    BlockResize {
        device: String,
        size: i64,
    },
    BlockdevSnapshotSync(BlockdevSnapshot),
    Transaction {
        actions: Vec<TransactionAction>,
    },
    BlockStream {
        device: String,
        #[serde(default)]
        base: Option<String>,
        #[serde(default)]
        speed: Option<i64>,
        #[serde(default, rename = "on-error")]
        on_error: Option<OnError>,
    },
    BlockCommit {
        device: String,
        #[serde(default)]
        base: Option<String>,
        #[serde(default)]
        top: Option<String>,
        #[serde(default)]
        speed: Option<i64>,
    },
    DriveMirror(DriveMirror),
    DriveBackup(DriveBackup),
    BlockJobSetSpeed {
        device: String,
        speed: i64,
    },
    BlockJobCancel {
        device: String,
        #[serde(default)]
        force: bool,
    },
    BlockJobPause {
        device: String,
    },
    BlockJobResume {
        device: String,
    },
    BlockJobComplete {
        device: String,
    },
    QueryBlockJobs,
    QueryBlock,
    /// Commit a drive's top layer, or every drive's with "all".
    Commit {
        device: String,
    },
    GuestWrite {
        device: String,
        offset: u64,
        data: String,
    },
    GuestRead {
        device: String,
        offset: u64,
        len: usize,
    },
    /// Run the control loop until no work is left.
    Run {
        #[serde(default, rename = "max-polls")]
        max_polls: Option<usize>,
    },
}

#[derive(Debug, Serialize)]
struct DriveInfo<'a> {
    id: &'a str,
    #[serde(rename = "if")]
    if_type: IfType,
    bus: u32,
    unit: u32,
    inserted: bool,
    file: &'a str,
    format: Option<&'a str>,
    ro: bool,
    device: Option<&'a str>,
    locked: bool,
}

impl<'a> From<&'a Drive> for DriveInfo<'a> {
    fn from(drive: &'a Drive) -> Self {
        let node = drive.node();
        Self {
            id: drive.id(),
            if_type: drive.if_type(),
            bus: drive.bus(),
            unit: drive.unit(),
            inserted: node.is_inserted(),
            file: node.filename(),
            format: node.format_name(),
            ro: node.is_read_only(),
            device: drive.device().map(|d| d.name.as_str()),
            locked: drive.device().is_some_and(|d| d.medium_locked),
        }
    }
}

/// Settings commands fall back on when their arguments leave them out.
#[derive(Copy, Clone, Debug)]
pub struct Defaults {
    pub if_type: IfType,
    pub max_polls: usize,
}

/// Run one command, producing its reply.
pub fn execute(
    layer: &mut BlockLayer,
    cmd: Command,
    defaults: Defaults,
) -> Value {
    match dispatch(layer, cmd, defaults) {
        Ok(ret) => json!({ "return": ret }),
        Err(e) => error_reply(e.class(), &e.to_string()),
    }
}

pub fn error_reply(class: ErrorClass, desc: &str) -> Value {
    json!({ "error": { "class": class, "desc": desc } })
}

fn dispatch(
    layer: &mut BlockLayer,
    cmd: Command,
    defaults: Defaults,
) -> Result<Value, Error> {
    let empty = Value::Object(Default::default());
    match cmd {
        Command::DriveAdd { opts } => {
            let opts = blockdev::admission::drive_def(&opts)?;
            let key = layer.drive_init(opts, defaults.if_type)?;
            let id = layer.drive(key).map(|d| d.id().to_string());
            Ok(json!({ "id": id }))
        }
        Command::DriveDel { id } => layer.drive_del(&id).map(|_| empty),
        Command::DeviceAdd { drive, driver, removable } => {
            let device = AttachedDevice {
                name: driver,
                removable,
                ..Default::default()
            };
            layer.attach_device(&drive, device).map(|_| empty)
        }
        Command::DeviceDel { drive } => {
            layer.blockdev_mark_auto_del(&drive);
            layer.detach_device(&drive).map(|_| empty)
        }
        Command::Eject { device, force } => {
            layer.eject(&device, force).map(|_| empty)
        }
        Command::Change { device, target, arg } => layer
            .change_medium(&device, &target, arg.as_deref())
            .map(|_| empty),
        Command::BlockPasswd { device, password } => {
            layer.set_password(&device, &password).map(|_| empty)
        }
        Command::BlockSetIoThrottle { device, limits } => {
            layer.set_io_throttle(&device, limits).map(|_| empty)
        }
        Command::BlockResize { device, size } => {
            layer.resize(&device, size).map(|_| empty)
        }
        Command::BlockdevSnapshotSync(args) => layer
            .transaction(vec![TransactionAction::BlockdevSnapshotSync(args)])
            .map(|_| empty),
        Command::Transaction { actions } => {
            layer.transaction(actions).map(|_| empty)
        }
        Command::BlockStream { device, base, speed, on_error } => layer
            .block_stream(&device, base.as_deref(), speed, on_error)
            .map(|_| empty),
        Command::BlockCommit { device, base, top, speed } => layer
            .block_commit(&device, base.as_deref(), top.as_deref(), speed)
            .map(|_| empty),
        Command::DriveMirror(args) => {
            layer.drive_mirror(&args).map(|_| empty)
        }
        Command::DriveBackup(args) => {
            layer.drive_backup(&args).map(|_| empty)
        }
        Command::BlockJobSetSpeed { device, speed } => {
            layer.block_job_set_speed(&device, speed).map(|_| empty)
        }
        Command::BlockJobCancel { device, force } => {
            layer.block_job_cancel(&device, force).map(|_| empty)
        }
        Command::BlockJobPause { device } => {
            layer.block_job_pause(&device).map(|_| empty)
        }
        Command::BlockJobResume { device } => {
            layer.block_job_resume(&device).map(|_| empty)
        }
        Command::BlockJobComplete { device } => {
            layer.block_job_complete(&device).map(|_| empty)
        }
        Command::QueryBlockJobs => Ok(to_value(layer.query_block_jobs())),
        Command::QueryBlock => {
            let drives: Vec<DriveInfo> =
                layer.drives().iter().map(DriveInfo::from).collect();
            Ok(to_value(drives))
        }
        Command::Commit { device } => layer.commit(&device).map(|_| empty),
        Command::GuestWrite { device, offset, data } => {
            layer.write(&device, offset, data.as_bytes()).map(|_| empty)
        }
        Command::GuestRead { device, offset, len } => {
            let mut buf = vec![0u8; len];
            layer.read(&device, offset, &mut buf)?;
            Ok(Value::String(String::from_utf8_lossy(&buf).into_owned()))
        }
        Command::Run { max_polls } => {
            let max_polls = max_polls.unwrap_or(defaults.max_polls);
            let polls = layer.run_until_idle(max_polls);
            Ok(json!({ "polls": polls }))
        }
    }
}

fn to_value<T: Serialize>(v: T) -> Value {
    // Reply types are plain data and always serialize.
    serde_json::to_value(v).unwrap_or(Value::Null)
}
