// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::*;
use crate::backend::{Fault, MemStore};
use crate::commands::NewImageMode;
use crate::drive::AttachedDevice;
use crate::error::ErrorClass;
use crate::test_util::{
    self, add, create, three_layer_drive, CLUSTER_SIZE, SIZE,
};

const POLLS: usize = 100;

fn virtio_blk() -> AttachedDevice {
    AttachedDevice { name: "virtio-blk".into(), ..Default::default() }
}

fn event_names(layer: &BlockLayer) -> Vec<&'static str> {
    layer.events().iter().map(BlockEvent::name).collect()
}

fn completion_error(layer: &BlockLayer) -> Option<String> {
    match layer.events().last() {
        Some(BlockEvent::BlockJobCompleted(info)) => info.error.clone(),
        other => panic!("expected a completion, got {:?}", other),
    }
}

fn read(layer: &mut BlockLayer, offset: u64) -> [u8; 4] {
    let mut buf = [0u8; 4];
    layer.read("virtio0", offset, &mut buf).unwrap();
    buf
}

/// A single-layer qcow2 drive holding `abcd` at 0 and `tail` in its last
/// cluster, admitted as `virtio0`.
fn one_layer_drive(store: &MemStore, layer: &mut BlockLayer) -> DriveKey {
    create(layer, "disk.qcow2", "qcow2", None);
    store.fill("disk.qcow2", 0, b"abcd");
    store.fill("disk.qcow2", 3 * CLUSTER_SIZE, b"tail");
    add(layer, "file=disk.qcow2,if=virtio")
}

fn mirror_args(target: &str) -> DriveMirror {
    DriveMirror {
        device: "virtio0".into(),
        target: target.into(),
        format: None,
        sync: MirrorSyncMode::Full,
        mode: NewImageMode::AbsolutePaths,
        speed: 0,
        on_source_error: OnError::Report,
        on_target_error: OnError::Report,
        granularity: 0,
        buf_size: None,
    }
}

#[test]
fn rate_limit_slices() {
    let slices_per_sec = 1000 / SLICE_TIME.as_millis() as u64;
    let now = Instant::now();

    let mut limit = RateLimit::default();
    assert_eq!(limit.calculate_delay(u64::MAX, now), None);

    limit.set_speed(100 * slices_per_sec);
    assert_eq!(limit.calculate_delay(60, now), None);
    assert_eq!(limit.calculate_delay(40, now), None);
    assert_eq!(limit.calculate_delay(1, now), Some(SLICE_TIME));
    // The first chunk of a slice always goes through.
    let later = now + SLICE_TIME * 2;
    assert_eq!(limit.calculate_delay(500, later), None);
}

#[test]
fn stream_whole_chain() {
    let (store, mut layer) = test_util::layer();
    let key = three_layer_drive(&store, &mut layer);

    layer.block_stream("virtio0", None, None, None).unwrap();
    let drive = layer.drive(key).unwrap();
    assert!(drive.node().in_use());
    assert_eq!(drive.refcount(), 2);

    layer.run_until_idle(POLLS);
    assert_eq!(event_names(&layer), ["BLOCK_JOB_COMPLETED"]);
    assert_eq!(completion_error(&layer), None);

    assert_eq!(store.contents("top.qcow2", 0, 4).unwrap(), b"bbbb");
    assert_eq!(store.contents("top.qcow2", CLUSTER_SIZE, 4).unwrap(), b"mmmm");
    assert_eq!(store.backing_of("top.qcow2"), None);

    let drive = layer.drive(key).unwrap();
    assert_eq!(drive.node().chain_len(), 1);
    assert!(!drive.node().in_use());
    assert_eq!(drive.refcount(), 1);
    assert!(layer.query_block_jobs().is_empty());
}

#[test]
fn drive_del_before_job_reference_released() {
    let (store, mut layer) = test_util::layer();
    let key = three_layer_drive(&store, &mut layer);
    layer.block_stream("virtio0", None, None, None).unwrap();

    // Stop on the poll that finishes the job, before its reference is
    // dropped.
    for _ in 0..POLLS {
        layer.poll();
        if layer.pending_deferred() > 0 {
            break;
        }
    }
    assert_eq!(event_names(&layer), ["BLOCK_JOB_COMPLETED"]);
    assert_eq!(layer.drive(key).unwrap().refcount(), 2);
    assert!(!layer.drive(key).unwrap().node().in_use());

    layer.drive_del("virtio0").unwrap();
    assert_eq!(layer.drive(key).unwrap().refcount(), 1);

    layer.poll();
    assert!(layer.drive(key).is_none());
    assert!(layer.drives().is_empty());
}

#[test]
fn stream_above_base() {
    let (store, mut layer) = test_util::layer();
    let key = three_layer_drive(&store, &mut layer);

    layer.block_stream("virtio0", Some("base.img"), None, None).unwrap();
    layer.run_until_idle(POLLS);
    assert_eq!(completion_error(&layer), None);

    // Only the intermediate layer was pulled up.
    assert!(!store.is_allocated("top.qcow2", 0));
    assert!(store.is_allocated("top.qcow2", CLUSTER_SIZE));
    assert_eq!(store.backing_of("top.qcow2").as_deref(), Some("base.img"));

    let node = layer.drive(key).unwrap().node();
    assert_eq!(node.chain_len(), 2);
    assert_eq!(node.chain_node(1).unwrap().filename(), "base.img");
    assert_eq!(&read(&mut layer, 0), b"bbbb");
    assert_eq!(&read(&mut layer, CLUSTER_SIZE), b"mmmm");
}

#[test]
fn stream_errors() {
    let (store, mut layer) = test_util::layer();
    three_layer_drive(&store, &mut layer);

    let err =
        layer.block_stream("virtio0", Some("nope"), None, None).unwrap_err();
    assert_eq!(err.class(), ErrorClass::BaseNotFound);

    let err = layer.block_stream("virtio0", None, Some(-1), None).unwrap_err();
    assert_eq!(err.class(), ErrorClass::InvalidParameter);

    // Pausing policies need a device to pause.
    let err = layer
        .block_stream("virtio0", None, None, Some(OnError::Stop))
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::InvalidParameter);

    layer.block_stream("virtio0", None, None, None).unwrap();
    let err = layer.block_stream("virtio0", None, None, None).unwrap_err();
    assert_eq!(err.class(), ErrorClass::DeviceInUse);
}

#[test]
fn stream_read_error_reported() {
    let (store, mut layer) = test_util::layer();
    let key = three_layer_drive(&store, &mut layer);
    store.set_faults("base.img", Fault::READ);

    layer.block_stream("virtio0", None, None, None).unwrap();
    layer.run_until_idle(POLLS);

    assert_eq!(event_names(&layer), ["BLOCK_JOB_ERROR", "BLOCK_JOB_COMPLETED"]);
    assert_eq!(
        layer.events()[0],
        BlockEvent::BlockJobError {
            device: "virtio0".into(),
            operation: IoOperation::Read,
            action: ErrorAction::Report,
        }
    );
    assert!(completion_error(&layer).is_some());
    assert_eq!(layer.drive(key).unwrap().node().chain_len(), 3);
}

#[test]
fn stream_read_error_ignored() {
    let (store, mut layer) = test_util::layer();
    let key = three_layer_drive(&store, &mut layer);
    store.set_faults("base.img", Fault::READ);

    layer
        .block_stream("virtio0", None, None, Some(OnError::Ignore))
        .unwrap();
    layer.run_until_idle(POLLS);

    let names = event_names(&layer);
    assert_eq!(names.last(), Some(&"BLOCK_JOB_COMPLETED"));
    // Clusters 0, 2 and 3 come from the faulty base.
    assert_eq!(names.iter().filter(|n| **n == "BLOCK_JOB_ERROR").count(), 3);
    assert!(completion_error(&layer).is_some());

    // The readable cluster was still copied, but the chain is kept.
    assert!(store.is_allocated("top.qcow2", CLUSTER_SIZE));
    assert_eq!(layer.drive(key).unwrap().node().chain_len(), 3);
}

#[test]
fn stop_on_error_then_resume() {
    let (store, mut layer) = test_util::layer();
    let key = three_layer_drive(&store, &mut layer);
    layer.attach_device("virtio0", virtio_blk()).unwrap();
    store.set_faults("base.img", Fault::READ);

    layer
        .block_stream("virtio0", None, None, Some(OnError::Stop))
        .unwrap();
    layer.run_until_idle(POLLS);
    assert_eq!(event_names(&layer), ["BLOCK_JOB_ERROR"]);
    let jobs = layer.query_block_jobs();
    assert_eq!(jobs.len(), 1);
    assert!(jobs[0].paused);
    assert!(!jobs[0].busy);

    store.set_faults("base.img", Fault::empty());
    layer.block_job_resume("virtio0").unwrap();
    layer.run_until_idle(POLLS);
    assert_eq!(completion_error(&layer), None);
    assert_eq!(layer.drive(key).unwrap().node().chain_len(), 1);
}

#[test]
fn cancel_paused_job() {
    let (store, mut layer) = test_util::layer();
    let key = three_layer_drive(&store, &mut layer);

    layer.block_stream("virtio0", None, None, None).unwrap();
    layer.block_job_pause("virtio0").unwrap();
    layer.run_until_idle(POLLS);
    assert!(layer.query_block_jobs()[0].paused);
    assert_eq!(layer.query_block_jobs()[0].offset, 0);

    let err = layer.block_job_cancel("virtio0", false).unwrap_err();
    assert_eq!(err.class(), ErrorClass::BlockJobPaused);

    layer.block_job_cancel("virtio0", true).unwrap();
    // Cancellation takes effect on the next poll.
    assert!(layer.events().is_empty());
    assert!(layer.poll());
    assert_eq!(event_names(&layer), ["BLOCK_JOB_CANCELLED"]);

    layer.run_until_idle(POLLS);
    let drive = layer.drive(key).unwrap();
    assert_eq!(drive.node().chain_len(), 3);
    assert!(!drive.node().in_use());
    assert_eq!(drive.refcount(), 1);
    assert_eq!(store.backing_of("top.qcow2").as_deref(), Some("mid.qcow2"));
}

#[test]
fn job_control_without_job() {
    let (store, mut layer) = test_util::layer();
    three_layer_drive(&store, &mut layer);

    for err in [
        layer.block_job_set_speed("virtio0", 1).unwrap_err(),
        layer.block_job_cancel("virtio0", false).unwrap_err(),
        layer.block_job_pause("virtio0").unwrap_err(),
        layer.block_job_resume("virtio0").unwrap_err(),
        layer.block_job_complete("virtio0").unwrap_err(),
        layer.block_job_pause("nope").unwrap_err(),
    ] {
        assert_eq!(err.class(), ErrorClass::BlockJobNotActive);
    }
}

#[test]
fn query_and_set_speed() {
    let (store, mut layer) = test_util::layer();
    three_layer_drive(&store, &mut layer);

    layer.block_stream("virtio0", None, Some(1 << 20), None).unwrap();
    let info = layer.query_block_jobs();
    assert_eq!(
        info,
        [BlockJobInfo {
            kind: JobKind::Stream,
            device: "virtio0".into(),
            len: SIZE,
            offset: 0,
            busy: true,
            paused: false,
            speed: 1 << 20,
        }]
    );

    let err = layer.block_job_set_speed("virtio0", -1).unwrap_err();
    assert_eq!(err.class(), ErrorClass::InvalidParameter);
    layer.block_job_set_speed("virtio0", 0).unwrap();
    assert_eq!(layer.query_block_jobs()[0].speed, 0);

    // Streaming cannot be completed by hand.
    let err = layer.block_job_complete("virtio0").unwrap_err();
    assert_eq!(err.class(), ErrorClass::BlockJobNotReady);
}

#[test]
fn commit_intermediate_layer() {
    let (store, mut layer) = test_util::layer();
    let key = three_layer_drive(&store, &mut layer);

    layer.block_commit("virtio0", None, Some("mid.qcow2"), None).unwrap();
    layer.run_until_idle(POLLS);
    assert_eq!(event_names(&layer), ["BLOCK_JOB_COMPLETED"]);
    assert_eq!(completion_error(&layer), None);

    assert_eq!(store.contents("base.img", 0, 4).unwrap(), b"bbbb");
    assert_eq!(store.contents("base.img", CLUSTER_SIZE, 4).unwrap(), b"mmmm");
    assert_eq!(store.backing_of("top.qcow2").as_deref(), Some("base.img"));

    let node = layer.drive(key).unwrap().node();
    assert_eq!(node.chain_len(), 2);
    let base = node.chain_node(1).unwrap();
    assert_eq!(base.filename(), "base.img");
    assert!(base.is_read_only());
    assert_eq!(&read(&mut layer, CLUSTER_SIZE), b"mmmm");
}

#[test]
fn commit_errors() {
    let (store, mut layer) = test_util::layer();
    let key = three_layer_drive(&store, &mut layer);

    let err = layer.block_commit("virtio0", None, None, None).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Top image as the active layer is currently unsupported"
    );

    let err = layer
        .block_commit("virtio0", Some("nope"), Some("mid.qcow2"), None)
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::BaseNotFound);

    let err = layer
        .block_commit("virtio0", Some("mid.qcow2"), Some("mid.qcow2"), None)
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Invalid files for merge: top and base are the same"
    );

    let err = layer
        .block_commit("virtio0", Some("mid.qcow2"), Some("base.img"), None)
        .unwrap_err();
    assert_eq!(err.to_string(), "Base 'mid.qcow2' is not below top image");

    let err = layer
        .block_commit("virtio0", None, Some("gone.qcow2"), None)
        .unwrap_err();
    assert_eq!(err.to_string(), "Top image file gone.qcow2 not found");

    // Nothing was reopened along the way.
    let node = layer.drive(key).unwrap().node();
    assert!(node.chain_node(1).unwrap().is_read_only());
    assert!(node.chain_node(2).unwrap().is_read_only());
    assert!(!node.in_use());
}

#[test]
fn mirror_and_pivot() {
    let (store, mut layer) = test_util::layer();
    let key = one_layer_drive(&store, &mut layer);

    layer.drive_mirror(&mirror_args("mirror.qcow2")).unwrap();
    let err = layer.block_job_complete("virtio0").unwrap_err();
    assert_eq!(err.class(), ErrorClass::BlockJobNotReady);

    layer.run_until_idle(POLLS);
    assert_eq!(event_names(&layer), ["BLOCK_JOB_READY"]);
    assert_eq!(store.contents("mirror.qcow2", 0, 4).unwrap(), b"abcd");

    // Guest writes after the job is ready still reach the target.
    layer.write("virtio0", 2 * CLUSTER_SIZE, b"late").unwrap();
    layer.block_job_complete("virtio0").unwrap();
    layer.run_until_idle(POLLS);
    assert_eq!(event_names(&layer), ["BLOCK_JOB_READY", "BLOCK_JOB_COMPLETED"]);
    assert_eq!(completion_error(&layer), None);

    assert_eq!(
        store.contents("mirror.qcow2", 2 * CLUSTER_SIZE, 4).unwrap(),
        b"late"
    );
    let drive = layer.drive(key).unwrap();
    assert_eq!(drive.node().filename(), "mirror.qcow2");
    assert_eq!(drive.node().device_name(), "virtio0");
    assert!(!drive.node().in_use());
    assert_eq!(drive.refcount(), 1);
    assert_eq!(&read(&mut layer, 3 * CLUSTER_SIZE), b"tail");
}

#[test]
fn mirror_cancel_after_ready() {
    let (store, mut layer) = test_util::layer();
    let key = one_layer_drive(&store, &mut layer);

    layer.drive_mirror(&mirror_args("mirror.qcow2")).unwrap();
    layer.run_until_idle(POLLS);
    layer.block_job_cancel("virtio0", false).unwrap();
    layer.run_until_idle(POLLS);

    assert_eq!(event_names(&layer), ["BLOCK_JOB_READY", "BLOCK_JOB_CANCELLED"]);
    assert_eq!(layer.drive(key).unwrap().node().filename(), "disk.qcow2");
}

#[test]
fn mirror_target_error() {
    let (store, mut layer) = test_util::layer();
    let key = one_layer_drive(&store, &mut layer);

    layer.drive_mirror(&mirror_args("mirror.qcow2")).unwrap();
    store.set_faults("mirror.qcow2", Fault::WRITE);
    layer.run_until_idle(POLLS);

    assert_eq!(
        layer.events()[0],
        BlockEvent::BlockJobError {
            device: "virtio0".into(),
            operation: IoOperation::Write,
            action: ErrorAction::Report,
        }
    );
    assert!(completion_error(&layer).is_some());
    assert_eq!(layer.drive(key).unwrap().node().filename(), "disk.qcow2");
}

#[test]
fn mirror_bad_arguments() {
    let (store, mut layer) = test_util::layer();
    one_layer_drive(&store, &mut layer);

    let mut args = mirror_args("mirror.qcow2");
    args.granularity = 3000;
    let err = layer.drive_mirror(&args).unwrap_err();
    assert_eq!(err.class(), ErrorClass::InvalidParameter);

    let mut args = mirror_args("mirror.qcow2");
    args.format = Some("vmdk".into());
    let err = layer.drive_mirror(&args).unwrap_err();
    assert_eq!(err.class(), ErrorClass::InvalidBlockFormat);

    let mut args = mirror_args("missing.qcow2");
    args.mode = NewImageMode::Existing;
    let err = layer.drive_mirror(&args).unwrap_err();
    assert!(matches!(err, Error::OpenFile { .. }));
    assert!(layer.query_block_jobs().is_empty());
}

#[test]
fn backup_copies_before_write() {
    let (store, mut layer) = test_util::layer();
    let key = one_layer_drive(&store, &mut layer);

    let args = DriveBackup {
        device: "virtio0".into(),
        target: "backup.qcow2".into(),
        format: None,
        sync: MirrorSyncMode::Full,
        mode: NewImageMode::AbsolutePaths,
        speed: 0,
        on_source_error: OnError::Report,
        on_target_error: OnError::Report,
    };
    layer.drive_backup(&args).unwrap();

    // The old contents land in the backup before the write goes through.
    layer.write("virtio0", 3 * CLUSTER_SIZE, b"new!").unwrap();
    assert_eq!(
        store.contents("backup.qcow2", 3 * CLUSTER_SIZE, 4).unwrap(),
        b"tail"
    );
    assert_eq!(&read(&mut layer, 3 * CLUSTER_SIZE), b"new!");

    layer.run_until_idle(POLLS);
    assert_eq!(event_names(&layer), ["BLOCK_JOB_COMPLETED"]);
    assert_eq!(completion_error(&layer), None);
    assert_eq!(store.contents("backup.qcow2", 0, 4).unwrap(), b"abcd");
    assert_eq!(
        store.contents("backup.qcow2", 3 * CLUSTER_SIZE, 4).unwrap(),
        b"tail"
    );
    assert_eq!(layer.drive(key).unwrap().node().filename(), "disk.qcow2");
}

#[test]
fn unplug_during_job() {
    let (store, mut layer) = test_util::layer();
    let key = three_layer_drive(&store, &mut layer);
    layer.attach_device("virtio0", virtio_blk()).unwrap();

    layer.block_stream("virtio0", None, None, None).unwrap();
    assert_eq!(layer.drive(key).unwrap().refcount(), 2);

    layer.blockdev_mark_auto_del("virtio0");
    layer.detach_device("virtio0").unwrap();
    // The job still holds its reference.
    assert_eq!(layer.drive(key).unwrap().refcount(), 1);

    assert!(layer.poll());
    assert_eq!(event_names(&layer), ["BLOCK_JOB_CANCELLED"]);
    assert!(layer.drive(key).is_some());
    assert_eq!(layer.pending_deferred(), 1);

    layer.poll();
    assert!(layer.drive(key).is_none());
    assert!(layer.drive_get_by_device("virtio0").is_none());
    assert_eq!(layer.pending_deferred(), 0);
}
