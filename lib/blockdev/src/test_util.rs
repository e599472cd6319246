// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixtures shared by the unit tests.

use std::sync::Arc;

use slog::{o, Discard, Logger};

use crate::backend::{DriverRegistry, InMemoryDriver, MemStore, OpenFlags};
use crate::drive::DriveKey;
use crate::layer::BlockLayer;
use crate::opts::OptionSet;

pub(crate) use crate::backend::in_memory::CLUSTER_SIZE;

pub(crate) const SIZE: u64 = 4 * CLUSTER_SIZE;

pub(crate) fn logger() -> Logger {
    Logger::root(Discard, o!())
}

/// A block layer knowing the `qcow2` (copy-on-write) and `raw-mem` (flat)
/// formats, both kept in the returned store.
pub(crate) fn layer() -> (MemStore, BlockLayer) {
    let store = MemStore::new();
    let mut drivers = DriverRegistry::new();
    drivers.register(Arc::new(InMemoryDriver::cow("qcow2", store.clone())));
    drivers.register(Arc::new(InMemoryDriver::flat("raw-mem", store.clone())));
    (store, BlockLayer::new(logger(), drivers))
}

pub(crate) fn create(
    layer: &BlockLayer,
    name: &str,
    fmt: &str,
    backing: Option<(&str, &str)>,
) {
    let size = match backing {
        Some(_) => None,
        None => Some(SIZE),
    };
    layer
        .drivers()
        .img_create(
            name,
            fmt,
            backing.map(|b| b.0),
            backing.map(|b| b.1),
            size,
            OpenFlags::empty(),
            None,
        )
        .unwrap();
}

/// Admit a drive from an option string.
pub(crate) fn add(layer: &mut BlockLayer, optstr: &str) -> DriveKey {
    let opts = OptionSet::parse(optstr).unwrap();
    layer.drive_init(opts, blockdev_types::IfType::Ide).unwrap()
}

/// base.img (flat) <- mid.qcow2 <- top.qcow2, admitted as `virtio0`.
///
/// base.img holds `b` in the first two clusters, mid.qcow2 overrides the
/// second with `m`.
pub(crate) fn three_layer_drive(
    store: &MemStore,
    layer: &mut BlockLayer,
) -> DriveKey {
    create(layer, "base.img", "raw-mem", None);
    store.fill("base.img", 0, &[b'b'; 16]);
    store.fill("base.img", CLUSTER_SIZE, &[b'b'; 16]);
    create(layer, "mid.qcow2", "qcow2", Some(("base.img", "raw-mem")));
    store.fill("mid.qcow2", CLUSTER_SIZE, &[b'm'; 16]);
    create(layer, "top.qcow2", "qcow2", Some(("mid.qcow2", "qcow2")));
    add(layer, "file=top.qcow2,if=virtio")
}
