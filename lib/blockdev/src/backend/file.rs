// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::fs::{metadata, File, OpenOptions};
use std::io::{Error, ErrorKind};
use std::os::unix::fs::FileExt;
use std::path::Path;

use super::{BackendError, Driver, Image, ImageCreateOpts, OpenFlags};

/// Raw images stored in host files.
#[derive(Default)]
pub struct FileDriver;

impl FileDriver {
    pub const FORMAT: &'static str = "raw";
}

fn map_io(err: Error) -> BackendError {
    match err.kind() {
        ErrorKind::NotFound => BackendError::NotFound,
        ErrorKind::PermissionDenied => BackendError::ReadOnly,
        _ => BackendError::Io(err),
    }
}

fn open_file(path: &Path, read_only: bool) -> Result<File, BackendError> {
    let meta = metadata(path).map_err(map_io)?;
    if !read_only && meta.permissions().readonly() {
        return Err(BackendError::Io(Error::new(
            ErrorKind::Other,
            "writeable backend with read-only file not allowed",
        )));
    }
    OpenOptions::new().read(true).write(!read_only).open(path).map_err(map_io)
}

impl Driver for FileDriver {
    fn format_name(&self) -> &str {
        Self::FORMAT
    }

    fn probe(&self, filename: &str) -> bool {
        Path::new(filename).is_file()
    }

    fn create(
        &self,
        filename: &str,
        opts: &ImageCreateOpts,
    ) -> Result<(), BackendError> {
        if opts.backing_file.is_some() || opts.encryption_key.is_some() {
            return Err(BackendError::NotSupported);
        }
        let fp = File::create(filename).map_err(map_io)?;
        fp.set_len(opts.size)?;
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
        let read_only = !flags.contains(OpenFlags::RDWR);
        let fp = open_file(Path::new(filename), read_only)?;

        Ok(Box::new(FileImage {
            fp,
            filename: filename.to_string(),
            read_only,
            skip_flush: flags.contains(OpenFlags::NO_FLUSH),
        }))
    }
}

struct FileImage {
    fp: File,
    filename: String,
    read_only: bool,
    skip_flush: bool,
}

impl Image for FileImage {
    fn filename(&self) -> &str {
        &self.filename
    }

    fn length(&self) -> Result<u64, BackendError> {
        Ok(self.fp.metadata()?.len())
    }

    fn read_at(
        &mut self,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), BackendError> {
        self.fp.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_at(
        &mut self,
        offset: u64,
        data: &[u8],
    ) -> Result<(), BackendError> {
        if self.read_only {
            return Err(BackendError::ReadOnly);
        }
        self.fp.write_all_at(data, offset)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), BackendError> {
        if !self.skip_flush {
            self.fp.sync_data()?;
        }
        Ok(())
    }

    fn truncate(&mut self, size: u64) -> Result<(), BackendError> {
        if self.read_only {
            return Err(BackendError::ReadOnly);
        }
        self.fp.set_len(size)?;
        Ok(())
    }

    fn reopen(&mut self, flags: OpenFlags) -> Result<(), BackendError> {
        let read_only = !flags.contains(OpenFlags::RDWR);
        if read_only != self.read_only {
            self.fp = open_file(Path::new(&self.filename), read_only)?;
            self.read_only = read_only;
        }
        self.skip_flush = flags.contains(OpenFlags::NO_FLUSH);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn create_write_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.raw");
        let path = path.to_str().unwrap();

        let drv = FileDriver;
        assert!(!drv.probe(path));
        drv.create(path, &ImageCreateOpts { size: 8192, ..Default::default() })
            .unwrap();
        assert!(drv.probe(path));

        let mut img =
            drv.open(Some(path), &BTreeMap::new(), OpenFlags::RDWR).unwrap();
        assert_eq!(img.length().unwrap(), 8192);
        img.write_at(4096, b"sector").unwrap();
        img.flush().unwrap();

        let mut buf = [0u8; 6];
        img.read_at(4096, &mut buf).unwrap();
        assert_eq!(&buf, b"sector");
        assert_eq!(img.allocated_extent(0, 8192).unwrap(), (true, 8192));
    }

    #[test]
    fn read_only_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro.raw");
        let path = path.to_str().unwrap();
        FileDriver
            .create(path, &ImageCreateOpts { size: 512, ..Default::default() })
            .unwrap();

        let mut img = FileDriver
            .open(Some(path), &BTreeMap::new(), OpenFlags::empty())
            .unwrap();
        assert!(matches!(img.write_at(0, b"x"), Err(BackendError::ReadOnly)));
        assert!(matches!(img.truncate(1024), Err(BackendError::ReadOnly)));
        img.reopen(OpenFlags::RDWR).unwrap();
        img.truncate(1024).unwrap();
        assert_eq!(img.length().unwrap(), 1024);
    }

    #[test]
    fn missing_file() {
        assert!(matches!(
            FileDriver.open(
                Some("/nonexistent/disk.raw"),
                &BTreeMap::new(),
                OpenFlags::empty()
            ),
            Err(BackendError::NotFound)
        ));
    }

    #[test]
    fn no_backing_support() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("top.raw");
        let opts = ImageCreateOpts {
            size: 512,
            backing_file: Some("base.raw".into()),
            ..Default::default()
        };
        assert!(matches!(
            FileDriver.create(path.to_str().unwrap(), &opts),
            Err(BackendError::NotSupported)
        ));
    }
}
