// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Block nodes: an open image plus the chain of backing nodes beneath it.
//!
//! The node at the top of a drive's chain carries the device-facing state
//! (device name, throttle, error policies, the attached job).  Nodes further
//! down are anonymous and opened read-only.  Chain positions are addressed
//! by depth, with the top node at depth 0.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::{
    BackendError, Driver, DriverRegistry, Image, ImageCreateOpts,
    InMemoryDriver, MemStore, OpenFlags,
};
use crate::job::BlockJob;
use crate::throttle::Throttle;

/// Format name reported by the volatile overlay used in snapshot mode.
pub const SNAPSHOT_OVERLAY_FORMAT: &str = "snapshot-overlay";

/// What to do when an I/O request fails.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OnError {
    #[default]
    Report,
    Ignore,
    /// Stop only when the failure is a lack of space.  Write errors only.
    Enospc,
    Stop,
}

/// The action chosen for one failed request.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, strum::IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ErrorAction {
    Report,
    Ignore,
    Stop,
}

impl OnError {
    pub fn action(self, err: &BackendError) -> ErrorAction {
        match self {
            OnError::Report => ErrorAction::Report,
            OnError::Ignore => ErrorAction::Ignore,
            OnError::Stop => ErrorAction::Stop,
            OnError::Enospc => match err {
                BackendError::NoSpace => ErrorAction::Stop,
                _ => ErrorAction::Report,
            },
        }
    }

    /// Whether the policy may pause whoever issued the request.
    pub fn may_stop(self) -> bool {
        matches!(self, OnError::Stop | OnError::Enospc)
    }
}

pub struct BlockNode {
    device_name: String,
    filename: String,
    format: Option<String>,
    image: Option<Box<dyn Image>>,
    open_flags: OpenFlags,
    read_only: bool,
    in_use: bool,
    pub(crate) job: Option<Box<BlockJob>>,
    backing: Option<Box<BlockNode>>,
    pub(crate) throttle: Throttle,
    on_read_error: OnError,
    on_write_error: OnError,
}

impl BlockNode {
    pub fn new(device_name: &str) -> Self {
        Self {
            device_name: device_name.to_string(),
            filename: String::new(),
            format: None,
            image: None,
            open_flags: OpenFlags::empty(),
            read_only: false,
            in_use: false,
            job: None,
            backing: None,
            throttle: Throttle::default(),
            on_read_error: OnError::Report,
            on_write_error: OnError::Enospc,
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Detach the node from its device name.
    pub(crate) fn make_anon(&mut self) {
        self.device_name.clear();
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn format_name(&self) -> Option<&str> {
        self.format.as_deref()
    }

    pub fn open_flags(&self) -> OpenFlags {
        self.open_flags
    }

    pub fn is_inserted(&self) -> bool {
        self.image.is_some()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub(crate) fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    pub fn is_snapshot(&self) -> bool {
        self.open_flags.contains(OpenFlags::SNAPSHOT)
    }

    /// Record snapshot mode on a node without medium, for the next open.
    pub(crate) fn set_snapshot(&mut self, snapshot: bool) {
        self.open_flags.set(OpenFlags::SNAPSHOT, snapshot);
    }

    pub fn in_use(&self) -> bool {
        self.in_use
    }

    pub(crate) fn set_in_use(&mut self, in_use: bool) {
        assert_ne!(self.in_use, in_use, "in-use flag toggled to same state");
        self.in_use = in_use;
    }

    pub fn job(&self) -> Option<&BlockJob> {
        self.job.as_deref()
    }

    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }

    pub fn on_error(&self, is_read: bool) -> OnError {
        match is_read {
            true => self.on_read_error,
            false => self.on_write_error,
        }
    }

    pub(crate) fn set_on_error(&mut self, read: OnError, write: OnError) {
        self.on_read_error = read;
        self.on_write_error = write;
    }

    pub fn backing(&self) -> Option<&BlockNode> {
        self.backing.as_deref()
    }

    pub fn backing_mut(&mut self) -> Option<&mut BlockNode> {
        self.backing.as_deref_mut()
    }

    /// Number of nodes in the chain, this one included.
    pub fn chain_len(&self) -> usize {
        1 + self.backing.as_ref().map_or(0, |b| b.chain_len())
    }

    pub fn chain_node(&self, depth: usize) -> Option<&BlockNode> {
        let mut node = self;
        for _ in 0..depth {
            node = node.backing.as_deref()?;
        }
        Some(node)
    }

    pub fn chain_node_mut(&mut self, depth: usize) -> Option<&mut BlockNode> {
        let mut node = self;
        for _ in 0..depth {
            node = node.backing.as_deref_mut()?;
        }
        Some(node)
    }

    /// Depth of the backing node (below this one) whose filename is `name`.
    pub fn find_backing_image(&self, name: &str) -> Option<usize> {
        let mut depth = 1;
        let mut node = self.backing.as_deref();
        while let Some(n) = node {
            if n.filename == name {
                return Some(depth);
            }
            node = n.backing.as_deref();
            depth += 1;
        }
        None
    }

    /// Depth of the bottom-most node of the chain.
    pub fn find_base(&self) -> usize {
        self.chain_len() - 1
    }

    /// Open an image into this node.  Without an explicit driver the format
    /// is probed.  Unless `NO_BACKING` is given, the image's backing chain
    /// is opened beneath it.
    pub fn open(
        &mut self,
        drivers: &DriverRegistry,
        filename: Option<&str>,
        options: &BTreeMap<String, String>,
        flags: OpenFlags,
        drv: Option<Arc<dyn Driver>>,
    ) -> Result<(), BackendError> {
        if flags.contains(OpenFlags::SNAPSHOT) {
            return self.open_snapshot(drivers, filename, options, flags, drv);
        }

        let drv = match drv {
            Some(drv) => drv,
            None => {
                let name = filename.ok_or(BackendError::InvalidArgument)?;
                drivers.probe(name).ok_or(BackendError::NotFound)?
            }
        };
        let image = drv.open(filename, options, flags)?;
        self.install(image, drv.format_name(), flags);

        if !flags.contains(OpenFlags::NO_BACKING) {
            if let Err(e) = self.open_backing(drivers) {
                self.close();
                return Err(e);
            }
        }
        Ok(())
    }

    fn install(
        &mut self,
        image: Box<dyn Image>,
        format: &str,
        flags: OpenFlags,
    ) {
        self.filename = image.filename().to_string();
        self.format = Some(format.to_string());
        self.image = Some(image);
        self.open_flags = flags;
        self.read_only = !flags.contains(OpenFlags::RDWR);
    }

    /// Stack a volatile copy-on-write overlay above the image, so guest
    /// writes never reach it.
    fn open_snapshot(
        &mut self,
        drivers: &DriverRegistry,
        filename: Option<&str>,
        options: &BTreeMap<String, String>,
        flags: OpenFlags,
        drv: Option<Arc<dyn Driver>>,
    ) -> Result<(), BackendError> {
        let mut base = BlockNode::new("");
        let base_flags = (flags - OpenFlags::SNAPSHOT - OpenFlags::RDWR)
            | OpenFlags::NO_BACKING;
        base.open(drivers, filename, options, base_flags, drv)?;
        let opts = ImageCreateOpts {
            size: base.length()?,
            backing_file: Some(base.filename.clone()),
            backing_format: base.format.clone(),
            encryption_key: None,
        };
        let name = format!("{}.overlay", base.filename);

        let overlay =
            InMemoryDriver::cow(SNAPSHOT_OVERLAY_FORMAT, MemStore::new());
        overlay.create(&name, &opts)?;
        let image = overlay.open(
            Some(&name),
            &BTreeMap::new(),
            flags - OpenFlags::SNAPSHOT,
        )?;
        self.install(image, SNAPSHOT_OVERLAY_FORMAT, flags);

        // The base is reopened below as an ordinary read-only backing node.
        drop(base);
        if let Err(e) = self.open_backing(drivers) {
            self.close();
            return Err(e);
        }
        Ok(())
    }

    /// Open the backing chain named by this node's image, if not already
    /// open.  Backing nodes are always read-only.
    pub fn open_backing(
        &mut self,
        drivers: &DriverRegistry,
    ) -> Result<(), BackendError> {
        if self.backing.is_some() {
            return Ok(());
        }
        let Some(image) = self.image.as_ref() else {
            return Ok(());
        };
        let Some(file) = image.backing_file().map(str::to_string) else {
            return Ok(());
        };
        let drv = image.backing_format().and_then(|f| drivers.find_format(f));
        let flags = self.open_flags
            - (OpenFlags::RDWR | OpenFlags::SNAPSHOT | OpenFlags::NO_BACKING);

        let mut node = BlockNode::new("");
        node.open(drivers, Some(&file), &BTreeMap::new(), flags, drv)?;
        self.backing = Some(Box::new(node));
        Ok(())
    }

    /// Close the image and its backing chain, leaving the node mediumless.
    pub fn close(&mut self) {
        if let Some(mut image) = self.image.take() {
            image.drain();
            // Errors here have nowhere to go; the medium is going away.
            let _ = image.flush();
        }
        self.backing = None;
        self.filename.clear();
        self.format = None;
        self.open_flags = OpenFlags::empty();
    }

    pub fn drain(&mut self) {
        if let Some(image) = self.image.as_mut() {
            image.drain();
        }
        if let Some(backing) = self.backing.as_mut() {
            backing.drain();
        }
    }

    pub fn flush(&mut self) -> Result<(), BackendError> {
        match self.image.as_mut() {
            Some(image) => image.flush(),
            None => Ok(()),
        }
    }

    pub fn length(&self) -> Result<u64, BackendError> {
        self.image.as_ref().ok_or(BackendError::NoMedium)?.length()
    }

    pub fn truncate(&mut self, size: u64) -> Result<(), BackendError> {
        let image = self.image.as_mut().ok_or(BackendError::NoMedium)?;
        if self.read_only {
            return Err(BackendError::ReadOnly);
        }
        if self.in_use {
            return Err(BackendError::Busy);
        }
        image.truncate(size)
    }

    pub fn reopen(&mut self, flags: OpenFlags) -> Result<(), BackendError> {
        let image = self.image.as_mut().ok_or(BackendError::NoMedium)?;
        image.reopen(flags)?;
        self.open_flags = flags;
        self.read_only = !flags.contains(OpenFlags::RDWR);
        Ok(())
    }

    /// Read through the chain: ranges not allocated in this node come from
    /// its backing node, or read as zeroes at the bottom of the chain.
    pub fn read(
        &mut self,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), BackendError> {
        let image = self.image.as_mut().ok_or(BackendError::NoMedium)?;
        let len = buf.len() as u64;
        let mut pos = 0u64;
        while pos < len {
            let (allocated, n) =
                image.allocated_extent(offset + pos, len - pos)?;
            let n = n.clamp(1, len - pos);
            let chunk = &mut buf[pos as usize..(pos + n) as usize];
            if allocated {
                image.read_at(offset + pos, chunk)?;
            } else if let Some(backing) = self.backing.as_mut() {
                backing.read_as_backing(offset + pos, chunk)?;
            } else {
                chunk.fill(0);
            }
            pos += n;
        }
        Ok(())
    }

    fn read_as_backing(
        &mut self,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), BackendError> {
        let len = self.length()?;
        if offset >= len {
            buf.fill(0);
            return Ok(());
        }
        let avail = ((len - offset) as usize).min(buf.len());
        let (head, tail) = buf.split_at_mut(avail);
        tail.fill(0);
        self.read(offset, head)
    }

    /// Write into this node's own image.  Clusters first touched by a
    /// partial write are filled from the backing chain.
    pub fn write(
        &mut self,
        offset: u64,
        data: &[u8],
    ) -> Result<(), BackendError> {
        let image = self.image.as_mut().ok_or(BackendError::NoMedium)?;
        if self.read_only {
            return Err(BackendError::ReadOnly);
        }
        let cluster = match (image.cluster_size(), self.backing.is_some()) {
            (Some(cluster), true) => cluster,
            _ => return image.write_at(offset, data),
        };

        let len = data.len() as u64;
        match offset.checked_add(len) {
            Some(end) if end <= image.length()? => {}
            _ => return Err(BackendError::InvalidArgument),
        }
        let start = offset / cluster * cluster;
        let end = ((offset + len + cluster - 1) / cluster * cluster)
            .min(image.length()?);
        if start == offset && end == offset + len {
            return image.write_at(offset, data);
        }

        let mut buf = vec![0u8; (end - start) as usize];
        self.read(start, &mut buf)?;
        let at = (offset - start) as usize;
        buf[at..at + data.len()].copy_from_slice(data);
        match self.image.as_mut() {
            Some(image) => image.write_at(start, &buf),
            None => Err(BackendError::NoMedium),
        }
    }

    /// Allocation state of this node's own image at `offset`, and for how
    /// many bytes it holds.
    pub fn allocated_extent(
        &mut self,
        offset: u64,
        len: u64,
    ) -> Result<(bool, u64), BackendError> {
        let image = self.image.as_mut().ok_or(BackendError::NoMedium)?;
        let (allocated, n) = image.allocated_extent(offset, len)?;
        Ok((allocated, n.clamp(1, len.max(1))))
    }

    /// Whether any part of the range is allocated in the nodes from
    /// `top_depth` down to, but excluding, `base_depth`.
    pub fn is_allocated_above(
        &mut self,
        top_depth: usize,
        base_depth: Option<usize>,
        offset: u64,
        len: u64,
    ) -> Result<bool, BackendError> {
        let mut depth = top_depth;
        let mut node = self
            .chain_node_mut(top_depth)
            .ok_or(BackendError::InvalidArgument)?;
        loop {
            if Some(depth) == base_depth {
                return Ok(false);
            }
            if let Some(image) = node.image.as_mut() {
                let (allocated, n) = image.allocated_extent(offset, len)?;
                if allocated || n < len {
                    return Ok(true);
                }
            }
            node = match node.backing.as_deref_mut() {
                Some(backing) => backing,
                None => return Ok(false),
            };
            depth += 1;
        }
    }

    /// Drop the nodes between `overlay_depth` and `base_depth`, making the
    /// base (or nothing) the overlay's backing node.  The overlay's stored
    /// backing file reference is rewritten to match.
    pub(crate) fn drop_intermediate(
        &mut self,
        overlay_depth: usize,
        base_depth: Option<usize>,
    ) -> Result<(), BackendError> {
        let overlay = self
            .chain_node_mut(overlay_depth)
            .ok_or(BackendError::InvalidArgument)?;
        let mut detached = overlay.backing.take();
        let mut depth = overlay_depth + 1;
        let base = loop {
            match detached {
                None => break None,
                Some(node) if Some(depth) == base_depth => break Some(node),
                Some(mut node) => {
                    detached = node.backing.take();
                    depth += 1;
                }
            }
        };

        let (file, format) = match base.as_deref() {
            Some(b) => (Some(b.filename.clone()), b.format.clone()),
            None => (None, None),
        };
        overlay.backing = base;
        match overlay.image.as_mut() {
            Some(image) => {
                image.set_backing_file(file.as_deref(), format.as_deref())
            }
            None => Ok(()),
        }
    }

    fn take_device_state(&mut self, from: &mut BlockNode) {
        self.device_name = std::mem::take(&mut from.device_name);
        self.throttle = std::mem::take(&mut from.throttle);
        self.on_read_error = from.on_read_error;
        self.on_write_error = from.on_write_error;
        self.in_use = std::mem::replace(&mut from.in_use, false);
        self.job = from.job.take();
    }

    /// Put `top` in front of this node.  `top` takes over the device-facing
    /// state and the current node becomes its backing node.
    pub(crate) fn append(&mut self, mut top: BlockNode) {
        std::mem::swap(self, &mut top);
        let mut old = top;
        self.take_device_state(&mut old);
        self.backing = Some(Box::new(old));
    }

    /// Put `new` in place of this node, handing it the device-facing state.
    /// The displaced node is returned.
    pub(crate) fn replace_with(&mut self, mut new: BlockNode) -> BlockNode {
        std::mem::swap(self, &mut new);
        let mut old = new;
        self.take_device_state(&mut old);
        old
    }

    /// Commit the contents of this node into its backing node and empty it.
    pub fn commit_to_backing(&mut self) -> Result<(), BackendError> {
        const CHUNK: u64 = 64 * 1024;

        let len = self.length()?;
        let backing = self.backing.as_mut().ok_or(BackendError::NotSupported)?;
        let flags = backing.open_flags;
        let was_ro = backing.read_only;
        if was_ro {
            backing.reopen(flags | OpenFlags::RDWR)?;
        }

        let result = (|| {
            let mut buf = vec![0u8; CHUNK as usize];
            let mut offset = 0;
            while offset < len {
                let n = CHUNK.min(len - offset);
                if self.is_allocated_above(0, Some(1), offset, n)? {
                    let buf = &mut buf[..n as usize];
                    self.read(offset, buf)?;
                    if let Some(b) = self.backing.as_mut() {
                        b.write(offset, buf)?;
                    }
                }
                offset += n;
            }
            match self.image.as_mut() {
                Some(image) => match image.make_empty() {
                    Err(BackendError::NotSupported) => Ok(()),
                    other => other,
                },
                None => Ok(()),
            }
        })();

        if let Some(b) = self.backing.as_mut() {
            let _ = b.flush();
            if was_ro {
                b.reopen(flags)?;
            }
        }
        result
    }

    pub fn is_encrypted(&self) -> bool {
        self.image.as_ref().is_some_and(|i| i.is_encrypted())
            || self.backing.as_ref().is_some_and(|b| b.is_encrypted())
    }

    pub fn key_required(&self) -> bool {
        if self.backing.as_ref().is_some_and(|b| b.key_required()) {
            return true;
        }
        self.image.as_ref().is_some_and(|i| i.key_required())
    }

    /// Filename of the layer an unlock key is wanted for.
    pub fn encrypted_filename(&self) -> Option<&str> {
        match self.backing.as_deref() {
            Some(b) if b.is_encrypted() => Some(b.filename.as_str()),
            _ if self.is_encrypted() => Some(self.filename.as_str()),
            _ => None,
        }
    }

    pub fn set_key(&mut self, key: &str) -> Result<(), BackendError> {
        let own = self.image.as_ref().is_some_and(|i| i.is_encrypted());
        if let Some(backing) = self.backing.as_mut() {
            if backing.is_encrypted() {
                backing.set_key(key)?;
                if !own {
                    return Ok(());
                }
            }
        }
        match self.image.as_mut() {
            Some(image) if own => image.set_key(key),
            _ => Err(BackendError::InvalidArgument),
        }
    }
}

impl std::fmt::Debug for BlockNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockNode")
            .field("device_name", &self.device_name)
            .field("filename", &self.filename)
            .field("format", &self.format)
            .field("open_flags", &self.open_flags)
            .field("read_only", &self.read_only)
            .field("in_use", &self.in_use)
            .field("has_job", &self.job.is_some())
            .field("backing", &self.backing)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::in_memory::CLUSTER_SIZE;

    const SIZE: u64 = 4 * CLUSTER_SIZE;

    fn setup() -> (MemStore, DriverRegistry) {
        let store = MemStore::new();
        let mut drivers = DriverRegistry::new();
        drivers.register(Arc::new(InMemoryDriver::cow("qcow2", store.clone())));
        drivers
            .register(Arc::new(InMemoryDriver::flat("raw-mem", store.clone())));
        (store, drivers)
    }

    fn create(
        drivers: &DriverRegistry,
        name: &str,
        fmt: &str,
        backing: Option<(&str, &str)>,
    ) {
        let size = match backing {
            Some(_) => None,
            None => Some(SIZE),
        };
        drivers
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

    fn open(
        drivers: &DriverRegistry,
        name: &str,
        flags: OpenFlags,
    ) -> BlockNode {
        let mut node = BlockNode::new("");
        node.open(drivers, Some(name), &BTreeMap::new(), flags, None).unwrap();
        node
    }

    /// base.img (flat) <- mid.qcow2 <- top.qcow2
    fn three_layer_chain(
        store: &MemStore,
        drivers: &DriverRegistry,
    ) -> BlockNode {
        create(drivers, "base.img", "raw-mem", None);
        store.fill("base.img", 0, &[b'b'; 16]);
        store.fill("base.img", CLUSTER_SIZE, &[b'b'; 16]);
        create(drivers, "mid.qcow2", "qcow2", Some(("base.img", "raw-mem")));
        store.fill("mid.qcow2", CLUSTER_SIZE, &[b'm'; 16]);
        create(drivers, "top.qcow2", "qcow2", Some(("mid.qcow2", "qcow2")));

        let mut node = BlockNode::new("virtio0");
        node.open(
            drivers,
            Some("top.qcow2"),
            &BTreeMap::new(),
            OpenFlags::RDWR,
            None,
        )
        .unwrap();
        node
    }

    #[test]
    fn opens_backing_chain_read_only() {
        let (store, drivers) = setup();
        let node = three_layer_chain(&store, &drivers);
        assert_eq!(node.chain_len(), 3);
        assert!(!node.is_read_only());
        assert!(node.backing().unwrap().is_read_only());
        assert_eq!(node.chain_node(2).unwrap().filename(), "base.img");
        assert_eq!(node.find_backing_image("mid.qcow2"), Some(1));
        assert_eq!(node.find_backing_image("top.qcow2"), None);
        assert_eq!(node.find_base(), 2);
    }

    #[test]
    fn reads_fall_through() {
        let (store, drivers) = setup();
        let mut node = three_layer_chain(&store, &drivers);
        node.write(0, b"top!").unwrap();

        let mut buf = [0u8; 6];
        node.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"top!bb");
        node.read(CLUSTER_SIZE, &mut buf).unwrap();
        assert_eq!(&buf, b"mmmmmm");
        node.read(2 * CLUSTER_SIZE, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 6]);
    }

    #[test]
    fn allocation_above_base() {
        let (store, drivers) = setup();
        let mut node = three_layer_chain(&store, &drivers);
        assert!(!node
            .is_allocated_above(0, Some(1), 0, CLUSTER_SIZE)
            .unwrap());
        assert!(node
            .is_allocated_above(0, Some(2), CLUSTER_SIZE, CLUSTER_SIZE)
            .unwrap());
        assert!(!node
            .is_allocated_above(0, Some(2), 0, CLUSTER_SIZE)
            .unwrap());
        assert!(node.is_allocated_above(0, None, 0, CLUSTER_SIZE).unwrap());
    }

    #[test]
    fn drop_intermediate_rewrites_backing() {
        let (store, drivers) = setup();
        let mut node = three_layer_chain(&store, &drivers);
        node.drop_intermediate(0, Some(2)).unwrap();
        assert_eq!(node.chain_len(), 2);
        assert_eq!(node.backing().unwrap().filename(), "base.img");
        assert_eq!(store.backing_of("top.qcow2").as_deref(), Some("base.img"));

        node.drop_intermediate(0, None).unwrap();
        assert_eq!(node.chain_len(), 1);
        assert_eq!(store.backing_of("top.qcow2"), None);
    }

    #[test]
    fn append_moves_device_identity() {
        let (store, drivers) = setup();
        let mut node = three_layer_chain(&store, &drivers);
        node.set_on_error(OnError::Stop, OnError::Ignore);
        create(&drivers, "snap.qcow2", "qcow2", Some(("top.qcow2", "qcow2")));
        let flags = OpenFlags::RDWR | OpenFlags::NO_BACKING;
        let snap = open(&drivers, "snap.qcow2", flags);

        node.append(snap);
        assert_eq!(node.device_name(), "virtio0");
        assert_eq!(node.filename(), "snap.qcow2");
        assert_eq!(node.on_error(true), OnError::Stop);
        assert_eq!(node.chain_len(), 4);
        assert_eq!(node.backing().unwrap().device_name(), "");
        assert_eq!(node.backing().unwrap().filename(), "top.qcow2");
    }

    #[test]
    fn snapshot_mode_keeps_image_pristine() {
        let (store, drivers) = setup();
        create(&drivers, "disk.img", "raw-mem", None);
        let mut node =
            open(&drivers, "disk.img", OpenFlags::RDWR | OpenFlags::SNAPSHOT);
        assert!(node.is_snapshot());
        assert_eq!(node.format_name(), Some(SNAPSHOT_OVERLAY_FORMAT));
        node.write(0, b"scratch").unwrap();

        let mut buf = [0u8; 7];
        node.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"scratch");
        assert_eq!(store.contents("disk.img", 0, 7).unwrap(), vec![0u8; 7]);
    }

    #[test]
    fn truncate_errors() {
        let (store, drivers) = setup();
        let mut node = three_layer_chain(&store, &drivers);
        node.set_in_use(true);
        assert!(matches!(node.truncate(SIZE * 2), Err(BackendError::Busy)));
        node.set_in_use(false);
        node.truncate(SIZE * 2).unwrap();
        assert_eq!(node.length().unwrap(), SIZE * 2);

        node.close();
        assert!(matches!(node.truncate(SIZE), Err(BackendError::NoMedium)));
    }

    #[test]
    fn commit_to_backing_empties_top() {
        let (store, drivers) = setup();
        let mut node = three_layer_chain(&store, &drivers);
        node.write(2 * CLUSTER_SIZE, b"new data").unwrap();
        node.commit_to_backing().unwrap();

        assert!(!store.is_allocated("top.qcow2", 2 * CLUSTER_SIZE));
        assert_eq!(
            store.contents("mid.qcow2", 2 * CLUSTER_SIZE, 8).unwrap(),
            b"new data".to_vec()
        );
        assert!(node.backing().unwrap().is_read_only());
    }
}
