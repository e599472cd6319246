// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The ordered collection of drives known to a block layer.

use blockdev_types::IfType;

use crate::drive::{Drive, DriveKey};
use crate::node::BlockNode;

#[derive(Debug, Default)]
pub struct DriveRegistry {
    drives: Vec<Drive>,
    next_key: u64,
}

impl DriveRegistry {
    pub(crate) fn alloc_key(&mut self) -> DriveKey {
        let key = DriveKey(self.next_key);
        self.next_key += 1;
        key
    }

    pub(crate) fn insert(&mut self, drive: Drive) {
        self.drives.push(drive);
    }

    pub(crate) fn remove(&mut self, key: DriveKey) -> Option<Drive> {
        let pos = self.drives.iter().position(|d| d.key == key)?;
        Some(self.drives.remove(pos))
    }

    pub fn len(&self) -> usize {
        self.drives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drives.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Drive> {
        self.drives.iter()
    }

    pub(crate) fn keys(&self) -> Vec<DriveKey> {
        self.drives.iter().map(|d| d.key).collect()
    }

    pub fn get(&self, key: DriveKey) -> Option<&Drive> {
        self.drives.iter().find(|d| d.key == key)
    }

    pub(crate) fn get_mut(&mut self, key: DriveKey) -> Option<&mut Drive> {
        self.drives.iter_mut().find(|d| d.key == key)
    }

    /// The drive at (kind, bus, unit).
    pub fn find(&self, kind: IfType, bus: u32, unit: u32) -> Option<&Drive> {
        self.drives
            .iter()
            .find(|d| d.if_type == kind && d.bus == bus && d.unit == unit)
    }

    pub fn by_index(&self, kind: IfType, index: u32) -> Option<&Drive> {
        let (bus, unit) = kind.index_to_addr(index);
        self.find(kind, bus, unit)
    }

    /// Highest bus number in use for `kind`.
    pub fn max_bus(&self, kind: IfType) -> Option<u32> {
        self.drives.iter().filter(|d| d.if_type == kind).map(|d| d.bus).max()
    }

    pub fn by_id(&self, id: &str) -> Option<&Drive> {
        self.drives.iter().find(|d| d.id == id)
    }

    /// The drive whose top node carries the device name `name`.  Anonymous
    /// drives are never found.
    pub fn by_device(&self, name: &str) -> Option<&Drive> {
        if name.is_empty() {
            return None;
        }
        self.drives.iter().find(|d| d.node.device_name() == name)
    }

    pub(crate) fn by_device_mut(&mut self, name: &str) -> Option<&mut Drive> {
        if name.is_empty() {
            return None;
        }
        self.drives.iter_mut().find(|d| d.node.device_name() == name)
    }

    /// The drive owning `node` as its top node.
    pub fn by_node(&self, node: &BlockNode) -> Option<&Drive> {
        self.drives.iter().find(|d| std::ptr::eq(&d.node, node))
    }
}
