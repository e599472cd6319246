// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Image formats kept entirely in memory.
//!
//! Images live in a [`MemStore`], a shared namespace of named files.  The
//! "cow" flavor tracks allocation per cluster and may reference a backing
//! file; the "flat" flavor reports every byte as allocated.  Faults can be
//! injected per file to exercise error paths.

use std::collections::BTreeMap;
use std::io::{Error, ErrorKind};
use std::sync::{Arc, Mutex};

use super::{BackendError, Driver, Image, ImageCreateOpts, OpenFlags};

pub const CLUSTER_SIZE: u64 = 64 * 1024;

bitflags! {
    /// Operations which fail on a file with injected faults.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Fault: u8 {
        const OPEN = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const FLUSH = 1 << 3;
        /// Writes fail as though the underlying storage were full.
        const FULL = 1 << 4;
    }
}

struct MemFile {
    format: String,
    size: u64,
    clusters: BTreeMap<u64, Box<[u8]>>,
    backing_file: Option<String>,
    backing_format: Option<String>,
    encryption_key: Option<String>,
    faults: Fault,
}

impl MemFile {
    fn check(&self, fault: Fault, what: &str) -> Result<(), BackendError> {
        if self.faults.intersects(fault) {
            return Err(BackendError::Io(Error::new(
                ErrorKind::Other,
                format!("injected {} fault", what),
            )));
        }
        Ok(())
    }

    fn check_bounds(
        &self,
        offset: u64,
        len: usize,
    ) -> Result<(), BackendError> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(BackendError::InvalidArgument),
        }
    }

    fn read(&self, offset: u64, buf: &mut [u8]) {
        for_each_cluster(offset, buf.len(), |idx, within, pos, n| {
            let dst = &mut buf[pos..pos + n];
            match self.clusters.get(&idx) {
                Some(data) => dst.copy_from_slice(&data[within..within + n]),
                None => dst.fill(0),
            }
        });
    }

    fn write(&mut self, offset: u64, data: &[u8]) {
        for_each_cluster(offset, data.len(), |idx, within, pos, n| {
            let cluster = self.clusters.entry(idx).or_insert_with(|| {
                vec![0u8; CLUSTER_SIZE as usize].into_boxed_slice()
            });
            cluster[within..within + n].copy_from_slice(&data[pos..pos + n]);
        });
    }
}

/// Walk the clusters covering `len` bytes at `offset`.  The callback receives
/// the cluster index, the offset within that cluster, the offset within the
/// caller's buffer, and the byte count.
fn for_each_cluster(
    offset: u64,
    len: usize,
    mut f: impl FnMut(u64, usize, usize, usize),
) {
    let mut pos = 0usize;
    while pos < len {
        let abs = offset + pos as u64;
        let idx = abs / CLUSTER_SIZE;
        let within = (abs % CLUSTER_SIZE) as usize;
        let n = (CLUSTER_SIZE as usize - within).min(len - pos);
        f(idx, within, pos, n);
        pos += n;
    }
}

/// A shared namespace of in-memory files.
#[derive(Clone, Default)]
pub struct MemStore(Arc<Mutex<BTreeMap<String, MemFile>>>);

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.0.lock().unwrap().contains_key(name)
    }

    pub fn remove(&self, name: &str) -> bool {
        self.0.lock().unwrap().remove(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.0.lock().unwrap().keys().cloned().collect()
    }

    pub fn format_of(&self, name: &str) -> Option<String> {
        self.0.lock().unwrap().get(name).map(|f| f.format.clone())
    }

    pub fn size_of(&self, name: &str) -> Option<u64> {
        self.0.lock().unwrap().get(name).map(|f| f.size)
    }

    pub fn backing_of(&self, name: &str) -> Option<String> {
        self.0.lock().unwrap().get(name).and_then(|f| f.backing_file.clone())
    }

    /// Make the given operations fail on `name` until cleared.
    pub fn set_faults(&self, name: &str, faults: Fault) {
        if let Some(file) = self.0.lock().unwrap().get_mut(name) {
            file.faults = faults;
        }
    }

    /// A copy of the file's own data, ignoring any backing file.
    pub fn contents(
        &self,
        name: &str,
        offset: u64,
        len: usize,
    ) -> Option<Vec<u8>> {
        let files = self.0.lock().unwrap();
        let file = files.get(name)?;
        file.check_bounds(offset, len).ok()?;
        let mut buf = vec![0u8; len];
        file.read(offset, &mut buf);
        Some(buf)
    }

    /// Write into a file directly, bypassing any open image.
    pub fn fill(&self, name: &str, offset: u64, data: &[u8]) -> bool {
        let mut files = self.0.lock().unwrap();
        match files.get_mut(name) {
            Some(file) if file.check_bounds(offset, data.len()).is_ok() => {
                file.write(offset, data);
                true
            }
            _ => false,
        }
    }

    pub fn is_allocated(&self, name: &str, offset: u64) -> bool {
        self.0
            .lock()
            .unwrap()
            .get(name)
            .map(|f| f.clusters.contains_key(&(offset / CLUSTER_SIZE)))
            .unwrap_or(false)
    }

    fn create(&self, name: &str, format: &str, opts: &ImageCreateOpts) {
        let file = MemFile {
            format: format.to_string(),
            size: opts.size,
            clusters: BTreeMap::new(),
            backing_file: opts.backing_file.clone(),
            backing_format: opts.backing_format.clone(),
            encryption_key: opts.encryption_key.clone(),
            faults: Fault::empty(),
        };
        self.0.lock().unwrap().insert(name.to_string(), file);
    }

    fn with_file<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut MemFile) -> Result<R, BackendError>,
    ) -> Result<R, BackendError> {
        let mut files = self.0.lock().unwrap();
        let file = files.get_mut(name).ok_or(BackendError::NotFound)?;
        f(file)
    }
}

/// An image format backed by a [`MemStore`].
pub struct InMemoryDriver {
    name: String,
    store: MemStore,
    cow: bool,
}

impl InMemoryDriver {
    /// A copy-on-write format with backing file support.
    pub fn cow(name: &str, store: MemStore) -> Self {
        Self { name: name.to_string(), store, cow: true }
    }

    /// A fully allocated format without backing file support.
    pub fn flat(name: &str, store: MemStore) -> Self {
        Self { name: name.to_string(), store, cow: false }
    }
}

impl Driver for InMemoryDriver {
    fn format_name(&self) -> &str {
        &self.name
    }

    fn supports_backing(&self) -> bool {
        self.cow
    }

    fn probe(&self, filename: &str) -> bool {
        self.store.format_of(filename).as_deref() == Some(self.name.as_str())
    }

    fn create(
        &self,
        filename: &str,
        opts: &ImageCreateOpts,
    ) -> Result<(), BackendError> {
        if opts.backing_file.is_some() && !self.cow {
            return Err(BackendError::NotSupported);
        }
        self.store.create(filename, &self.name, opts);
        Ok(())
    }

    fn open(
        &self,
        filename: Option<&str>,
        options: &BTreeMap<String, String>,
        flags: OpenFlags,
    ) -> Result<Box<dyn Image>, BackendError> {
        let filename = filename
            .or_else(|| options.get("filename").map(String::as_str))
            .ok_or(BackendError::InvalidArgument)?;

        let (backing_file, backing_format, encrypted) =
            self.store.with_file(filename, |file| {
                file.check(Fault::OPEN, "open")?;
                if file.format != self.name {
                    return Err(BackendError::WrongFormat(self.name.clone()));
                }
                Ok((
                    file.backing_file.clone(),
                    file.backing_format.clone(),
                    file.encryption_key.is_some(),
                ))
            })?;

        Ok(Box::new(MemImage {
            store: self.store.clone(),
            filename: filename.to_string(),
            cow: self.cow,
            read_only: !flags.contains(OpenFlags::RDWR),
            encrypted,
            key_valid: !encrypted,
            backing_file,
            backing_format,
        }))
    }
}

struct MemImage {
    store: MemStore,
    filename: String,
    cow: bool,
    read_only: bool,
    encrypted: bool,
    key_valid: bool,
    backing_file: Option<String>,
    backing_format: Option<String>,
}

impl Image for MemImage {
    fn filename(&self) -> &str {
        &self.filename
    }

    fn length(&self) -> Result<u64, BackendError> {
        self.store.with_file(&self.filename, |file| Ok(file.size))
    }

    fn read_at(
        &mut self,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), BackendError> {
        self.store.with_file(&self.filename, |file| {
            file.check(Fault::READ, "read")?;
            file.check_bounds(offset, buf.len())?;
            file.read(offset, buf);
            Ok(())
        })
    }

    fn write_at(
        &mut self,
        offset: u64,
        data: &[u8],
    ) -> Result<(), BackendError> {
        if self.read_only {
            return Err(BackendError::ReadOnly);
        }
        self.store.with_file(&self.filename, |file| {
            file.check(Fault::WRITE, "write")?;
            if file.faults.contains(Fault::FULL) {
                return Err(BackendError::NoSpace);
            }
            file.check_bounds(offset, data.len())?;
            file.write(offset, data);
            Ok(())
        })
    }

    fn flush(&mut self) -> Result<(), BackendError> {
        self.store
            .with_file(&self.filename, |file| file.check(Fault::FLUSH, "flush"))
    }

    fn truncate(&mut self, size: u64) -> Result<(), BackendError> {
        if self.read_only {
            return Err(BackendError::ReadOnly);
        }
        self.store.with_file(&self.filename, |file| {
            let first_gone = (size + CLUSTER_SIZE - 1) / CLUSTER_SIZE;
            file.clusters.retain(|&idx, _| idx < first_gone);
            if let Some(last) = file.clusters.get_mut(&(size / CLUSTER_SIZE)) {
                let within = (size % CLUSTER_SIZE) as usize;
                last[within..].fill(0);
            }
            file.size = size;
            Ok(())
        })
    }

    fn cluster_size(&self) -> Option<u64> {
        self.cow.then_some(CLUSTER_SIZE)
    }

    fn allocated_extent(
        &mut self,
        offset: u64,
        len: u64,
    ) -> Result<(bool, u64), BackendError> {
        if !self.cow {
            return Ok((true, len));
        }
        self.store.with_file(&self.filename, |file| {
            let state =
                |pos: u64| file.clusters.contains_key(&(pos / CLUSTER_SIZE));
            let end = offset + len;
            let first = state(offset);
            let mut pos = (offset / CLUSTER_SIZE + 1) * CLUSTER_SIZE;
            while pos < end && state(pos) == first {
                pos += CLUSTER_SIZE;
            }
            Ok((first, pos.min(end) - offset))
        })
    }

    fn make_empty(&mut self) -> Result<(), BackendError> {
        if !self.cow {
            return Err(BackendError::NotSupported);
        }
        if self.read_only {
            return Err(BackendError::ReadOnly);
        }
        self.store.with_file(&self.filename, |file| {
            file.clusters.clear();
            Ok(())
        })
    }

    fn backing_file(&self) -> Option<&str> {
        self.backing_file.as_deref()
    }

    fn backing_format(&self) -> Option<&str> {
        self.backing_format.as_deref()
    }

    fn set_backing_file(
        &mut self,
        file: Option<&str>,
        format: Option<&str>,
    ) -> Result<(), BackendError> {
        if !self.cow {
            return Err(BackendError::NotSupported);
        }
        self.store.with_file(&self.filename, |f| {
            f.backing_file = file.map(str::to_string);
            f.backing_format = format.map(str::to_string);
            Ok(())
        })?;
        self.backing_file = file.map(str::to_string);
        self.backing_format = format.map(str::to_string);
        Ok(())
    }

    fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    fn key_required(&self) -> bool {
        self.encrypted && !self.key_valid
    }

    fn set_key(&mut self, key: &str) -> Result<(), BackendError> {
        if !self.encrypted {
            return Err(BackendError::InvalidArgument);
        }
        let matches = self.store.with_file(&self.filename, |file| {
            Ok(file.encryption_key.as_deref() == Some(key))
        })?;
        if !matches {
            self.key_valid = false;
            return Err(BackendError::InvalidKey);
        }
        self.key_valid = true;
        Ok(())
    }

    fn reopen(&mut self, flags: OpenFlags) -> Result<(), BackendError> {
        self.read_only = !flags.contains(OpenFlags::RDWR);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn create(drv: &InMemoryDriver, name: &str, size: u64) {
        let opts = ImageCreateOpts { size, ..Default::default() };
        drv.create(name, &opts).unwrap();
    }

    fn open_rw(drv: &InMemoryDriver, name: &str) -> Box<dyn Image> {
        drv.open(Some(name), &BTreeMap::new(), OpenFlags::RDWR).unwrap()
    }

    #[test]
    fn cow_tracks_allocation() {
        let store = MemStore::new();
        let drv = InMemoryDriver::cow("qcow2", store.clone());
        create(&drv, "a", 4 * CLUSTER_SIZE);
        let mut img = open_rw(&drv, "a");

        assert_eq!(
            img.allocated_extent(0, 4 * CLUSTER_SIZE).unwrap(),
            (false, 4 * CLUSTER_SIZE)
        );
        img.write_at(CLUSTER_SIZE + 10, b"hello").unwrap();
        assert_eq!(
            img.allocated_extent(0, 4 * CLUSTER_SIZE).unwrap(),
            (false, CLUSTER_SIZE)
        );
        assert_eq!(
            img.allocated_extent(CLUSTER_SIZE, 3 * CLUSTER_SIZE).unwrap(),
            (true, CLUSTER_SIZE)
        );

        let mut buf = [0u8; 5];
        img.read_at(CLUSTER_SIZE + 10, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert!(store.is_allocated("a", CLUSTER_SIZE));

        img.make_empty().unwrap();
        assert!(!store.is_allocated("a", CLUSTER_SIZE));
    }

    #[test]
    fn flat_is_fully_allocated() {
        let store = MemStore::new();
        let drv = InMemoryDriver::flat("raw-mem", store);
        create(&drv, "b", 1024);
        let mut img = open_rw(&drv, "b");
        assert_eq!(img.allocated_extent(0, 1024).unwrap(), (true, 1024));
        assert!(matches!(img.make_empty(), Err(BackendError::NotSupported)));
    }

    #[test]
    fn wrong_format_and_missing() {
        let store = MemStore::new();
        let cow = InMemoryDriver::cow("qcow2", store.clone());
        let flat = InMemoryDriver::flat("raw-mem", store);
        create(&flat, "c", 512);
        assert!(matches!(
            cow.open(Some("c"), &BTreeMap::new(), OpenFlags::empty()),
            Err(BackendError::WrongFormat(f)) if f == "qcow2"
        ));
        assert!(matches!(
            cow.open(Some("nope"), &BTreeMap::new(), OpenFlags::empty()),
            Err(BackendError::NotFound)
        ));
    }

    #[test]
    fn read_only_and_bounds() {
        let store = MemStore::new();
        let drv = InMemoryDriver::flat("raw-mem", store);
        create(&drv, "d", 512);
        let mut img =
            drv.open(Some("d"), &BTreeMap::new(), OpenFlags::empty()).unwrap();
        assert!(matches!(img.write_at(0, b"x"), Err(BackendError::ReadOnly)));
        img.reopen(OpenFlags::RDWR).unwrap();
        img.write_at(0, b"x").unwrap();
        assert!(matches!(
            img.write_at(510, b"xyz"),
            Err(BackendError::InvalidArgument)
        ));
    }

    #[test]
    fn injected_faults() {
        let store = MemStore::new();
        let drv = InMemoryDriver::cow("qcow2", store.clone());
        create(&drv, "e", 4096);
        let mut img = open_rw(&drv, "e");
        store.set_faults("e", Fault::FLUSH | Fault::WRITE);
        assert!(matches!(img.flush(), Err(BackendError::Io(_))));
        assert!(matches!(img.write_at(0, b"x"), Err(BackendError::Io(_))));
        img.read_at(0, &mut [0u8; 16]).unwrap();

        store.set_faults("e", Fault::OPEN);
        assert!(drv
            .open(Some("e"), &BTreeMap::new(), OpenFlags::empty())
            .is_err());
        store.set_faults("e", Fault::empty());
        img.flush().unwrap();
    }

    #[test]
    fn encryption_key() {
        let store = MemStore::new();
        let drv = InMemoryDriver::cow("qcow2", store);
        let opts = ImageCreateOpts {
            size: 4096,
            encryption_key: Some("sekrit".into()),
            ..Default::default()
        };
        drv.create("f", &opts).unwrap();
        let mut img = open_rw(&drv, "f");
        assert!(img.is_encrypted());
        assert!(img.key_required());
        assert!(matches!(img.set_key("guess"), Err(BackendError::InvalidKey)));
        img.set_key("sekrit").unwrap();
        assert!(!img.key_required());
    }

    #[test]
    fn truncate_drops_clusters() {
        let store = MemStore::new();
        let drv = InMemoryDriver::cow("qcow2", store.clone());
        create(&drv, "g", 4 * CLUSTER_SIZE);
        let mut img = open_rw(&drv, "g");
        img.write_at(3 * CLUSTER_SIZE, b"tail").unwrap();
        img.truncate(CLUSTER_SIZE).unwrap();
        assert_eq!(img.length().unwrap(), CLUSTER_SIZE);
        assert!(!store.is_allocated("g", 3 * CLUSTER_SIZE));
    }
}
