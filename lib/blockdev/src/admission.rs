// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Drive admission: turning a drive's option set into a registered drive.
//!
//! Options are checked in a fixed order so the first problem reported is
//! the same one every time.  The drive is entered into the registry before
//! its image is opened, and removed again if the open fails.

use std::collections::BTreeMap;
use std::str::FromStr;

use blockdev_types::{IfType, PciAddr};
use slog::{info, warn};
use thiserror::Error;

use crate::backend::{
    parse_cache_mode, parse_discard_mode, BackendError, OpenFlags,
};
use crate::drive::{Drive, DriveKey, Geometry, Media, Translation};
use crate::error::{Error, ErrorClass, Result};
use crate::layer::{BlockLayer, RunState};
use crate::node::{BlockNode, OnError};
use crate::opts::{id_wellformed, OptionError, OptionSet};
use crate::throttle::IoLimits;

/// Keys accepted by the legacy `-drive` syntax.
const LEGACY_KEYS: &[&str] = &[
    "bus", "unit", "if", "index", "cyls", "heads", "secs", "trans", "media",
    "snapshot", "file", "cache", "aio", "format", "serial", "rerror",
    "werror", "readonly", "iops", "iops_rd", "iops_wr", "bps", "bps_rd",
    "bps_wr", "copy-on-read", "boot", "addr", "discard",
];

const LEGACY_RENAMES: &[(&str, &str)] = &[
    ("iops", "throttling.iops-total"),
    ("iops_rd", "throttling.iops-read"),
    ("iops_wr", "throttling.iops-write"),
    ("bps", "throttling.bps-total"),
    ("bps_rd", "throttling.bps-read"),
    ("bps_wr", "throttling.bps-write"),
    ("readonly", "read-only"),
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("unsupported bus type '{0}'")]
    UnsupportedBus(String),

    #[error("invalid physical cyls number")]
    InvalidCylinders,

    #[error("invalid physical heads number")]
    InvalidHeads,

    #[error("invalid physical secs number")]
    InvalidSectors,

    #[error("'{0}' trans must be used with cyls, heads and secs")]
    TranslationWithoutGeometry(String),

    #[error("'{0}' invalid translation type")]
    InvalidTranslation(String),

    #[error("CHS can't be set with media={0}")]
    GeometryWithMedia(String),

    #[error("'{0}' invalid media")]
    InvalidMedia(String),

    #[error("invalid discard option")]
    InvalidDiscard,

    #[error("invalid cache option")]
    InvalidCache,

    #[error("invalid aio option")]
    InvalidAio,

    #[error("Supported formats: {}", .0.join(" "))]
    FormatHelp(Vec<String>),

    #[error("'{0}' invalid format")]
    UnknownFormat(String),

    #[error("{0} is not supported by this bus type")]
    NotSupportedByBus(&'static str),

    #[error("'{value}' invalid {kind} error action")]
    InvalidErrorAction { value: String, kind: &'static str },

    #[error("invalid PCI address '{0}'")]
    InvalidAddr(String),

    #[error("invalid bus number {0}")]
    InvalidBus(i64),

    #[error("index cannot be used with bus and unit")]
    IndexWithBusUnit,

    #[error("unit {unit} too big (max is {max})")]
    UnitTooBig { unit: u32, max: u32 },

    #[error("drive with bus={bus}, unit={unit} (index={index}) exists")]
    DriveExists { bus: u32, unit: u32, index: i64 },

    #[error("read-only not supported by this bus type")]
    ReadOnlyNotSupported,

    #[error("could not open disk image {file}: not in {format} format")]
    WrongFormat { file: String, format: String },

    #[error("could not open disk image {file}: {source}")]
    OpenFailed {
        file: String,
        #[source]
        source: BackendError,
    },
}

impl AdmissionError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AdmissionError::UnknownFormat(_)
            | AdmissionError::WrongFormat { .. } => {
                ErrorClass::InvalidBlockFormat
            }
            AdmissionError::DriveExists { .. }
            | AdmissionError::FormatHelp(_) => ErrorClass::GenericError,
            AdmissionError::OpenFailed { source, .. } => match source {
                BackendError::Io(_) => ErrorClass::IoError,
                _ => ErrorClass::GenericError,
            },
            _ => ErrorClass::InvalidParameter,
        }
    }
}

/// The options admission interprets itself.  Whatever is left in the set
/// after [DriveOpts::absorb] is handed to the format driver.
#[derive(Debug, Default)]
struct DriveOpts {
    bus: Option<i64>,
    unit: Option<i64>,
    index: Option<i64>,
    cyls: i64,
    heads: i64,
    secs: i64,
    snapshot: bool,
    read_only: bool,
    copy_on_read: bool,
    file: Option<String>,
    serial: Option<String>,
    if_name: Option<String>,
    trans: Option<String>,
    media: Option<String>,
    discard: Option<String>,
    cache_writeback: bool,
    cache_direct: bool,
    cache_no_flush: bool,
    aio: Option<String>,
    format: Option<String>,
    limits: IoLimits,
    boot: bool,
    werror: Option<String>,
    rerror: Option<String>,
    addr: Option<String>,
}

impl DriveOpts {
    fn absorb(opts: &mut OptionSet) -> std::result::Result<Self, OptionError> {
        let num = |opts: &mut OptionSet, key| {
            opts.take_number(key).map(|v| v.unwrap_or(0))
        };
        let flag = |opts: &mut OptionSet, key, default| {
            opts.take_bool(key).map(|v| v.unwrap_or(default))
        };
        Ok(Self {
            bus: opts.take_number("bus")?,
            unit: opts.take_number("unit")?,
            index: opts.take_number("index")?,
            cyls: num(opts, "cyls")?,
            heads: num(opts, "heads")?,
            secs: num(opts, "secs")?,
            snapshot: flag(opts, "snapshot", false)?,
            read_only: flag(opts, "read-only", false)?,
            copy_on_read: flag(opts, "copy-on-read", false)?,
            file: opts.take("file"),
            serial: opts.take("serial"),
            if_name: opts.take("if"),
            trans: opts.take("trans"),
            media: opts.take("media"),
            discard: opts.take("discard"),
            cache_writeback: flag(opts, "cache.writeback", true)?,
            cache_direct: flag(opts, "cache.direct", false)?,
            cache_no_flush: flag(opts, "cache.no-flush", true)?,
            aio: opts.take("aio"),
            format: opts.take("format"),
            limits: IoLimits {
                bps: num(opts, "throttling.bps-total")?,
                bps_rd: num(opts, "throttling.bps-read")?,
                bps_wr: num(opts, "throttling.bps-write")?,
                iops: num(opts, "throttling.iops-total")?,
                iops_rd: num(opts, "throttling.iops-read")?,
                iops_wr: num(opts, "throttling.iops-write")?,
            },
            boot: opts.take("boot").is_some(),
            werror: opts.take("werror"),
            rerror: opts.take("rerror"),
            addr: opts.take("addr"),
        })
    }
}

fn parse_error_action(
    value: &str,
    is_read: bool,
) -> std::result::Result<OnError, AdmissionError> {
    match OnError::from_str(value) {
        Ok(OnError::Enospc) if is_read => {}
        Ok(policy) => return Ok(policy),
        Err(_) => {}
    }
    Err(AdmissionError::InvalidErrorAction {
        value: value.to_string(),
        kind: if is_read { "read" } else { "write" },
    })
}

/// Error policies are only honored by these bus kinds.
fn bus_reports_errors(kind: IfType) -> bool {
    matches!(kind, IfType::Ide | IfType::Scsi | IfType::Virtio | IfType::None)
}

/// Bus kinds which may present a read-only disk.
fn bus_allows_read_only(kind: IfType) -> bool {
    matches!(
        kind,
        IfType::Scsi
            | IfType::Virtio
            | IfType::Floppy
            | IfType::None
            | IfType::Pflash
    )
}

fn synthesize_id(kind: IfType, bus: u32, unit: u32, media: Media) -> String {
    let mediastr = match (kind, media) {
        (IfType::Ide | IfType::Scsi, Media::Cdrom) => "-cd",
        (IfType::Ide | IfType::Scsi, Media::Disk) => "-hd",
        _ => "",
    };
    match kind.max_devs() {
        0 => format!("{}{}{}", kind, mediastr, unit),
        _ => format!("{}{}{}{}", kind, bus, mediastr, unit),
    }
}

impl BlockLayer {
    /// Admit a drive described by the legacy option syntax.
    ///
    /// Only legacy keys are accepted.  Throttling and read-only keys are
    /// renamed to their structured spelling, and a `cache` mode is spread
    /// over the `cache.*` switches it stands for, unless those were given.
    pub fn drive_init(
        &mut self,
        mut opts: OptionSet,
        default_if: IfType,
    ) -> Result<DriveKey> {
        if let Some(key) = opts.keys().find(|k| !LEGACY_KEYS.contains(k)) {
            return Err(OptionError::InvalidParameter(key.to_string()).into());
        }
        for (from, to) in LEGACY_RENAMES {
            opts.rename(from, to);
        }
        if let Some(mode) = opts.take("cache") {
            let flags =
                parse_cache_mode(&mode).ok_or(AdmissionError::InvalidCache)?;
            let on_off = |b: bool| if b { "on" } else { "off" };
            for (key, set) in [
                ("cache.writeback", flags.contains(OpenFlags::CACHE_WB)),
                ("cache.direct", flags.contains(OpenFlags::NOCACHE)),
                ("cache.no-flush", flags.contains(OpenFlags::NO_FLUSH)),
            ] {
                if !opts.contains(key) {
                    opts.set(key, on_off(set));
                }
            }
        }
        self.blockdev_init(opts, default_if)
    }

    /// Admit a drive.  On failure nothing is left registered.
    pub fn blockdev_init(
        &mut self,
        mut opts: OptionSet,
        default_if: IfType,
    ) -> Result<DriveKey> {
        let all_opts = opts.clone();
        let id = opts.id().map(str::to_string);
        if let Some(id) = &id {
            if !id_wellformed(id) {
                return Err(OptionError::MalformedId.into());
            }
            if self.drives.by_id(id).is_some() {
                return Err(Error::DuplicateId(id.clone()));
            }
        }
        opts.set_id(None);
        let o = DriveOpts::absorb(&mut opts)?;
        let has_driver_specific_opts = !opts.is_empty();

        let kind = match &o.if_name {
            Some(name) => IfType::from_str(name)
                .map_err(|_| AdmissionError::UnsupportedBus(name.clone()))?,
            None => default_if,
        };
        let geometry = if o.cyls != 0 || o.heads != 0 || o.secs != 0 {
            let dim = |v: i64, err| {
                u32::try_from(v).ok().filter(|v| *v >= 1).ok_or(err)
            };
            Some(Geometry {
                cylinders: dim(o.cyls, AdmissionError::InvalidCylinders)?,
                heads: dim(o.heads, AdmissionError::InvalidHeads)?,
                sectors: dim(o.secs, AdmissionError::InvalidSectors)?,
            })
        } else {
            None
        };

        let mut translation = Translation::Auto;
        if let Some(trans) = &o.trans {
            if o.cyls == 0 {
                return Err(AdmissionError::TranslationWithoutGeometry(
                    trans.clone(),
                )
                .into());
            }
            translation = Translation::from_str(trans).map_err(|_| {
                AdmissionError::InvalidTranslation(trans.clone())
            })?;
        }

        let mut media = Media::Disk;
        if let Some(m) = &o.media {
            media = Media::from_str(m)
                .map_err(|_| AdmissionError::InvalidMedia(m.clone()))?;
            if media == Media::Cdrom && geometry.is_some() {
                return Err(AdmissionError::GeometryWithMedia(m.clone()).into());
            }
        }

        let mut flags = OpenFlags::empty();
        if let Some(discard) = &o.discard {
            parse_discard_mode(discard, &mut flags)
                .ok_or(AdmissionError::InvalidDiscard)?;
        }
        flags.set(OpenFlags::CACHE_WB, o.cache_writeback);
        flags.set(OpenFlags::NOCACHE, o.cache_direct);
        flags.set(OpenFlags::NO_FLUSH, o.cache_no_flush);

        match o.aio.as_deref() {
            None | Some("threads") => {}
            Some("native") => flags.insert(OpenFlags::NATIVE_AIO),
            Some(_) => return Err(AdmissionError::InvalidAio.into()),
        }

        let drv = match o.format.as_deref() {
            Some("help" | "?") => {
                let names = self.drivers.format_names();
                let names = names.map(str::to_string).collect();
                return Err(AdmissionError::FormatHelp(names).into());
            }
            Some(fmt) => Some(
                self.drivers
                    .find_whitelisted_format(fmt, o.read_only)
                    .ok_or_else(|| {
                        AdmissionError::UnknownFormat(fmt.to_string())
                    })?,
            ),
            None => None,
        };

        o.limits.check()?;

        if o.boot {
            warn!(self.log,
                "boot=on|off is deprecated and will be ignored");
        }

        let mut on_write_error = OnError::Enospc;
        if let Some(werror) = &o.werror {
            if !bus_reports_errors(kind) {
                return Err(AdmissionError::NotSupportedByBus("werror").into());
            }
            on_write_error = parse_error_action(werror, false)?;
        }
        let mut on_read_error = OnError::Report;
        if let Some(rerror) = &o.rerror {
            if !bus_reports_errors(kind) {
                return Err(AdmissionError::NotSupportedByBus("rerror").into());
            }
            on_read_error = parse_error_action(rerror, true)?;
        }

        let devaddr = match &o.addr {
            Some(_) if kind != IfType::Virtio => {
                return Err(AdmissionError::NotSupportedByBus("addr").into());
            }
            Some(addr) => Some(
                PciAddr::from_str(addr)
                    .map_err(|_| AdmissionError::InvalidAddr(addr.clone()))?,
            ),
            None => None,
        };

        let (bus, unit) = self.resolve_address(kind, &o)?;

        let id = id.unwrap_or_else(|| synthesize_id(kind, bus, unit, media));
        if self.drives.by_id(&id).is_some() {
            return Err(Error::DuplicateId(id));
        }

        let mut node = BlockNode::new(&id);
        node.set_snapshot(o.snapshot);
        node.set_read_only(o.read_only);
        node.set_on_error(on_read_error, on_write_error);
        node.throttle.set_limits(o.limits);
        if o.limits.is_enabled() {
            node.throttle.enable();
        }

        let key = self.drives.alloc_key();
        let media_cd = media == Media::Cdrom
            && matches!(
                kind,
                IfType::Ide | IfType::Scsi | IfType::Xen | IfType::None
            );
        self.drives.insert(Drive {
            key,
            id: id.clone(),
            if_type: kind,
            bus,
            unit,
            node,
            geometry,
            translation,
            media_cd,
            devaddr,
            serial: o.serial.clone(),
            opts: all_opts,
            refcount: 1,
            auto_del: false,
            device: None,
        });

        let file = o.file.as_deref().filter(|f| !f.is_empty());
        if file.is_none() && !has_driver_specific_opts {
            info!(self.log, "drive added without medium";
                "drive" => &id, "if" => kind.name(), "bus" => bus,
                "unit" => unit);
            return Ok(key);
        }

        if o.snapshot {
            flags.remove(OpenFlags::CACHE_MASK);
            flags |=
                OpenFlags::SNAPSHOT | OpenFlags::CACHE_WB | OpenFlags::NO_FLUSH;
        }
        if o.copy_on_read {
            flags.insert(OpenFlags::COPY_ON_READ);
        }
        if self.runstate() == RunState::InMigrate {
            flags.insert(OpenFlags::INCOMING);
        }

        let mut read_only = o.read_only;
        if media == Media::Cdrom {
            read_only = true;
        } else if read_only && !bus_allows_read_only(kind) {
            self.drives.remove(key);
            return Err(AdmissionError::ReadOnlyNotSupported.into());
        }
        if !read_only {
            flags.insert(OpenFlags::RDWR);
        }
        if read_only && o.copy_on_read {
            warn!(self.log, "disabling copy_on_read on read-only drive";
                "drive" => &id);
        }

        let options: BTreeMap<String, String> = opts
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let drivers = &self.drivers;
        let res = match self.drives.get_mut(key) {
            Some(drive) => drive.node.open(drivers, file, &options, flags, drv),
            None => Err(BackendError::InvalidArgument),
        };
        if let Err(source) = res {
            self.drives.remove(key);
            let file = file.unwrap_or(&id).to_string();
            return Err(match source {
                BackendError::WrongFormat(format) => {
                    AdmissionError::WrongFormat { file, format }
                }
                source => AdmissionError::OpenFailed { file, source },
            }
            .into());
        }

        if self.drives.get(key).is_some_and(|d| d.node.key_required()) {
            warn!(self.log, "drive needs a key, autostart disabled";
                "drive" => &id);
            self.set_autostart(false);
        }

        let log = self.drive_log(&id);
        if let Some(drive) = self.drives.get(key) {
            let file = drive.node.filename();
            let format = drive.node.format_name().unwrap_or("");
            match drive.geometry {
                Some(geometry) => info!(log, "drive added";
                    "if" => kind.name(), "bus" => bus, "unit" => unit,
                    "file" => file, "format" => format,
                    "flags" => ?flags, geometry),
                None => info!(log, "drive added";
                    "if" => kind.name(), "bus" => bus, "unit" => unit,
                    "file" => file, "format" => format,
                    "flags" => ?flags),
            }
        }
        Ok(key)
    }

    /// Work out the (bus, unit) a new drive lands on.
    fn resolve_address(
        &self,
        kind: IfType,
        o: &DriveOpts,
    ) -> Result<(u32, u32)> {
        let max_devs = kind.max_devs();
        let bus = o.bus.unwrap_or(0);
        let unit = o.unit.filter(|u| *u >= 0);
        let index = o.index.filter(|i| *i >= 0);

        let mut bus =
            u32::try_from(bus).map_err(|_| AdmissionError::InvalidBus(bus))?;
        let mut unit = match unit {
            Some(u) => Some(u32::try_from(u).unwrap_or(u32::MAX)),
            None => None,
        };
        if let Some(index) = index {
            if bus != 0 || unit.is_some() {
                return Err(AdmissionError::IndexWithBusUnit.into());
            }
            let index = u32::try_from(index).unwrap_or(u32::MAX);
            let (b, u) = kind.index_to_addr(index);
            bus = b;
            unit = Some(u);
        }

        let unit = match unit {
            Some(unit) => unit,
            None => {
                let mut unit = 0;
                while self.drives.find(kind, bus, unit).is_some() {
                    unit += 1;
                    if max_devs != 0 && unit >= max_devs {
                        unit -= max_devs;
                        bus += 1;
                    }
                }
                unit
            }
        };

        if max_devs != 0 && unit >= max_devs {
            return Err(AdmissionError::UnitTooBig { unit, max: max_devs - 1 }
                .into());
        }
        if self.drives.find(kind, bus, unit).is_some() {
            return Err(AdmissionError::DriveExists {
                bus,
                unit,
                index: o.index.unwrap_or(-1),
            }
            .into());
        }
        Ok((bus, unit))
    }

    /// Drives a guest device must be created for, such as the PCI function
    /// behind each virtio drive.
    pub fn implicit_devices(&self) -> Vec<crate::drive::ImplicitDevice> {
        self.drives.iter().filter_map(|d| d.implicit_device()).collect()
    }
}

/// Parse a legacy option string into an option set ready for
/// [BlockLayer::drive_init].
pub fn drive_def(optstr: &str) -> Result<OptionSet> {
    Ok(OptionSet::parse(optstr)?)
}

/// Build a drive definition the way the short command line forms
/// (`-hda`, `-cdrom`, `-fda`, ...) do, on top of the options in `optstr`.
pub fn drive_add(
    kind: Option<IfType>,
    index: Option<u32>,
    file: Option<&str>,
    optstr: &str,
) -> Result<OptionSet> {
    let mut opts = drive_def(optstr)?;
    if let Some(kind) = kind {
        opts.set("if", kind.name());
    }
    if let Some(index) = index {
        opts.set("index", index);
    }
    if let Some(file) = file {
        opts.set("file", file);
    }
    Ok(opts)
}
