// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use blockdev_types::{IfType, PciAddr};
use serde::Serialize;
use slog::{Record, Serializer, KV};

use crate::node::BlockNode;
use crate::opts::OptionSet;

/// Handle for a drive in the registry.  Never reused.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DriveKey(pub(crate) u64);

/// Cylinder/head/sector geometry requested for a drive.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Geometry {
    pub cylinders: u32,
    pub heads: u32,
    pub sectors: u32,
}

impl KV for Geometry {
    fn serialize(
        &self,
        _rec: &Record,
        serializer: &mut dyn Serializer,
    ) -> slog::Result {
        serializer.emit_u32("cylinders", self.cylinders)?;
        serializer.emit_u32("heads", self.heads)?;
        serializer.emit_u32("sectors", self.sectors)
    }
}

/// BIOS CHS translation mode.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Translation {
    #[default]
    Auto,
    None,
    Lba,
}

#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Media {
    #[default]
    Disk,
    Cdrom,
}

/// State of the guest device a drive is plugged into.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AttachedDevice {
    pub name: String,
    pub removable: bool,
    pub medium_locked: bool,
    pub tray_open: bool,
    /// Set when an eject was asked of a locked medium.  `Some(force)`.
    pub eject_requested: Option<bool>,
}

/// A device the block layer asks the device layer to create on its behalf.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ImplicitDevice {
    pub driver: &'static str,
    pub drive: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr: Option<PciAddr>,
}

#[derive(Debug)]
pub struct Drive {
    pub(crate) key: DriveKey,
    pub(crate) id: String,
    pub(crate) if_type: IfType,
    pub(crate) bus: u32,
    pub(crate) unit: u32,
    pub(crate) node: BlockNode,
    pub(crate) geometry: Option<Geometry>,
    pub(crate) translation: Translation,
    pub(crate) media_cd: bool,
    pub(crate) devaddr: Option<PciAddr>,
    pub(crate) serial: Option<String>,
    pub(crate) opts: OptionSet,
    pub(crate) refcount: u32,
    pub(crate) auto_del: bool,
    pub(crate) device: Option<AttachedDevice>,
}

impl Drive {
    pub fn key(&self) -> DriveKey {
        self.key
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn if_type(&self) -> IfType {
        self.if_type
    }

    pub fn bus(&self) -> u32 {
        self.bus
    }

    pub fn unit(&self) -> u32 {
        self.unit
    }

    pub fn node(&self) -> &BlockNode {
        &self.node
    }

    pub fn geometry(&self) -> Option<Geometry> {
        self.geometry
    }

    pub fn translation(&self) -> Translation {
        self.translation
    }

    pub fn media_cd(&self) -> bool {
        self.media_cd
    }

    pub fn devaddr(&self) -> Option<PciAddr> {
        self.devaddr
    }

    pub fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    /// The options the drive was created from.
    pub fn opts(&self) -> &OptionSet {
        &self.opts
    }

    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    pub fn auto_del(&self) -> bool {
        self.auto_del
    }

    pub fn device(&self) -> Option<&AttachedDevice> {
        self.device.as_ref()
    }

    /// Whether the guest can see the medium being removed.
    pub fn has_removable_media(&self) -> bool {
        match &self.device {
            Some(dev) => dev.removable,
            None => true,
        }
    }

    /// Virtio drives are plugged into a device created on their behalf.
    pub fn implicit_device(&self) -> Option<ImplicitDevice> {
        match self.if_type {
            IfType::Virtio => Some(ImplicitDevice {
                driver: "virtio-blk-pci",
                drive: self.id.clone(),
                addr: self.devaddr,
            }),
            _ => None,
        }
    }
}

impl KV for Drive {
    fn serialize(
        &self,
        _rec: &Record,
        serializer: &mut dyn Serializer,
    ) -> slog::Result {
        serializer.emit_str("drive", &self.id)?;
        serializer.emit_str("if", self.if_type.name())?;
        serializer.emit_u32("bus", self.bus)?;
        serializer.emit_u32("unit", self.unit)
    }
}
