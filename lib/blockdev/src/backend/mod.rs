// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Image format drivers and open images.
//!
//! A [`Driver`] knows how to probe, create and open images of one format.  An
//! open image is a [`Image`] trait object: a flat byte-addressed store which
//! may report that some of its ranges are unallocated, in which case the
//! owning [`BlockNode`](crate::node::BlockNode) falls through to its backing
//! node for those ranges.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use crate::error::{Error as BlockError, Result as BlockResult};

pub mod file;
pub mod in_memory;

pub use file::FileDriver;
pub use in_memory::{Fault, InMemoryDriver, MemStore};

bitflags! {
    /// Flags governing how an image is opened.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const RDWR = 1 << 1;
        /// Open a volatile overlay above the image; writes never reach it.
        const SNAPSHOT = 1 << 3;
        const NOCACHE = 1 << 5;
        const CACHE_WB = 1 << 6;
        const NATIVE_AIO = 1 << 7;
        /// Do not open the image's backing file.
        const NO_BACKING = 1 << 8;
        /// Guest flush requests are ignored.
        const NO_FLUSH = 1 << 9;
        const COPY_ON_READ = 1 << 10;
        /// Image contents arrive through an inbound migration.
        const INCOMING = 1 << 11;
        const UNMAP = 1 << 14;

        const CACHE_MASK = Self::NOCACHE.bits()
            | Self::CACHE_WB.bits()
            | Self::NO_FLUSH.bits();
    }
}

/// Translate a legacy `cache=` mode into the flags it stands for.
pub fn parse_cache_mode(mode: &str) -> Option<OpenFlags> {
    let flags = match mode {
        "off" | "none" => OpenFlags::NOCACHE | OpenFlags::CACHE_WB,
        "directsync" => OpenFlags::NOCACHE,
        "writeback" => OpenFlags::CACHE_WB,
        "unsafe" => OpenFlags::CACHE_WB | OpenFlags::NO_FLUSH,
        "writethrough" => OpenFlags::empty(),
        _ => return None,
    };
    Some(flags)
}

/// Apply a `discard=` mode to `flags`.
pub fn parse_discard_mode(mode: &str, flags: &mut OpenFlags) -> Option<()> {
    match mode {
        "off" | "ignore" => flags.remove(OpenFlags::UNMAP),
        "on" | "unmap" => flags.insert(OpenFlags::UNMAP),
        _ => return None,
    }
    Some(())
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("not in {0} format")]
    WrongFormat(String),

    #[error("No such file or directory")]
    NotFound,

    #[error("No medium found")]
    NoMedium,

    #[error("Permission denied")]
    ReadOnly,

    #[error("Device or resource busy")]
    Busy,

    #[error("Operation not supported")]
    NotSupported,

    #[error("Invalid argument")]
    InvalidArgument,

    #[error("Invalid key")]
    InvalidKey,

    #[error("No space left on device")]
    NoSpace,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// I/O errors compare by kind.
impl PartialEq for BackendError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (BackendError::WrongFormat(a), BackendError::WrongFormat(b)) => {
                a == b
            }
            (BackendError::Io(a), BackendError::Io(b)) => a.kind() == b.kind(),
            (a, b) => {
                std::mem::discriminant(a) == std::mem::discriminant(b)
            }
        }
    }
}

impl Eq for BackendError {}

/// Parameters for creating a fresh image.
#[derive(Clone, Debug, Default)]
pub struct ImageCreateOpts {
    pub size: u64,
    pub backing_file: Option<String>,
    pub backing_format: Option<String>,
    pub encryption_key: Option<String>,
}

/// An image format.
pub trait Driver: Send + Sync + 'static {
    fn format_name(&self) -> &str;

    /// Whether images of this format may reference a backing file.
    fn supports_backing(&self) -> bool {
        false
    }

    /// Whether `filename` holds an image in this format.
    fn probe(&self, filename: &str) -> bool;

    fn create(
        &self,
        filename: &str,
        opts: &ImageCreateOpts,
    ) -> Result<(), BackendError>;

    /// Open `filename`.  Drivers which need no filename may instead take
    /// their target from `options`.
    fn open(
        &self,
        filename: Option<&str>,
        options: &BTreeMap<String, String>,
        flags: OpenFlags,
    ) -> Result<Box<dyn Image>, BackendError>;
}

/// An open image.
pub trait Image: Send + 'static {
    fn filename(&self) -> &str;

    fn length(&self) -> Result<u64, BackendError>;

    /// Read this image's own contents.  Unallocated ranges read as zeroes.
    fn read_at(
        &mut self,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), BackendError>;

    fn write_at(&mut self, offset: u64, data: &[u8])
        -> Result<(), BackendError>;

    fn flush(&mut self) -> Result<(), BackendError>;

    fn truncate(&mut self, size: u64) -> Result<(), BackendError>;

    /// Allocation granularity of formats that track allocation.
    fn cluster_size(&self) -> Option<u64> {
        None
    }

    /// Report whether the range starting at `offset` is allocated in this
    /// image, and for how many bytes (at most `len`) that answer holds.
    fn allocated_extent(
        &mut self,
        _offset: u64,
        len: u64,
    ) -> Result<(bool, u64), BackendError> {
        Ok((true, len))
    }

    /// Drop all allocated data, exposing the backing image again.
    fn make_empty(&mut self) -> Result<(), BackendError> {
        Err(BackendError::NotSupported)
    }

    fn backing_file(&self) -> Option<&str> {
        None
    }

    fn backing_format(&self) -> Option<&str> {
        None
    }

    /// Rewrite the backing file reference stored in the image.
    fn set_backing_file(
        &mut self,
        _file: Option<&str>,
        _format: Option<&str>,
    ) -> Result<(), BackendError> {
        Err(BackendError::NotSupported)
    }

    fn is_encrypted(&self) -> bool {
        false
    }

    /// Whether the image is encrypted and still awaits its key.
    fn key_required(&self) -> bool {
        false
    }

    fn set_key(&mut self, _key: &str) -> Result<(), BackendError> {
        Err(BackendError::InvalidArgument)
    }

    fn reopen(&mut self, _flags: OpenFlags) -> Result<(), BackendError> {
        Ok(())
    }

    /// Wait for any in-flight requests to settle.
    fn drain(&mut self) {}
}

/// The set of image formats known to a block layer.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: Vec<Arc<dyn Driver>>,
    whitelist: Option<Whitelist>,
}

#[derive(Clone, Debug)]
struct Whitelist {
    rw: Vec<String>,
    ro: Vec<String>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, driver: Arc<dyn Driver>) {
        self.drivers.push(driver);
    }

    pub fn find_format(&self, name: &str) -> Option<Arc<dyn Driver>> {
        self.drivers.iter().find(|d| d.format_name() == name).cloned()
    }

    /// Restrict the formats usable by drives and media changes.  Formats in
    /// `ro` may only be used read-only.
    pub fn set_whitelist(&mut self, rw: &[&str], ro: &[&str]) {
        self.whitelist = Some(Whitelist {
            rw: rw.iter().map(|s| s.to_string()).collect(),
            ro: ro.iter().map(|s| s.to_string()).collect(),
        });
    }

    pub fn is_whitelisted(&self, name: &str, read_only: bool) -> bool {
        match &self.whitelist {
            None => true,
            Some(wl) => {
                wl.rw.iter().any(|f| f == name)
                    || (read_only && wl.ro.iter().any(|f| f == name))
            }
        }
    }

    pub fn find_whitelisted_format(
        &self,
        name: &str,
        read_only: bool,
    ) -> Option<Arc<dyn Driver>> {
        self.find_format(name)
            .filter(|d| self.is_whitelisted(d.format_name(), read_only))
    }

    pub fn format_names(&self) -> impl Iterator<Item = &str> {
        self.drivers.iter().map(|d| d.format_name())
    }

    /// Guess the format of `filename`.  Drivers are asked in registration
    /// order.
    pub fn probe(&self, filename: &str) -> Option<Arc<dyn Driver>> {
        self.drivers.iter().find(|d| d.probe(filename)).cloned()
    }

    /// Create a new image.  When `size` is omitted it is inherited from the
    /// backing image.
    #[allow(clippy::too_many_arguments)]
    pub fn img_create(
        &self,
        filename: &str,
        fmt: &str,
        base_filename: Option<&str>,
        base_fmt: Option<&str>,
        size: Option<u64>,
        flags: OpenFlags,
        encryption_key: Option<&str>,
    ) -> BlockResult<()> {
        let drv = self.find_format(fmt).ok_or_else(|| {
            BlockError::Generic(format!("Unknown file format '{}'", fmt))
        })?;
        if base_filename.is_some() && !drv.supports_backing() {
            return Err(BlockError::Generic(format!(
                "Backing file not supported for file format '{}'",
                fmt
            )));
        }
        if let Some(base_fmt) = base_fmt {
            if self.find_format(base_fmt).is_none() {
                return Err(BlockError::Generic(format!(
                    "Unknown backing file format '{}'",
                    base_fmt
                )));
            }
        }

        let size = match (size, base_filename) {
            (Some(size), _) => size,
            (None, Some(base)) => {
                let base_drv = base_fmt
                    .and_then(|f| self.find_format(f))
                    .or_else(|| self.probe(base))
                    .ok_or_else(|| {
                        BlockError::backend(
                            format!("Could not open '{}'", base),
                            BackendError::NotFound,
                        )
                    })?;
                let flags = (flags - OpenFlags::RDWR) | OpenFlags::NO_BACKING;
                base_drv
                    .open(Some(base), &BTreeMap::new(), flags)
                    .and_then(|img| img.length())
                    .map_err(|e| {
                        BlockError::backend(
                            format!("Could not open '{}'", base),
                            e,
                        )
                    })?
            }
            (None, None) => {
                return Err(BlockError::Generic(
                    "Image creation needs a size parameter".to_string(),
                ))
            }
        };

        let opts = ImageCreateOpts {
            size,
            backing_file: base_filename.map(str::to_string),
            backing_format: base_fmt.map(str::to_string),
            encryption_key: encryption_key.map(str::to_string),
        };
        drv.create(filename, &opts).map_err(|e| {
            BlockError::backend(
                format!("{}: error while creating {}", filename, fmt),
                e,
            )
        })
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("formats", &self.format_names().collect::<Vec<_>>())
            .field("whitelist", &self.whitelist)
            .finish()
    }
}
