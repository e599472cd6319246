// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fundamental types shared by the blockdev crates.
//!
//! This crate defines the handful of types that the block layer library, the
//! TOML configuration crate, and the standalone binary all need to agree on
//! (bus interface kinds and their addressing scheme, PCI slot addresses)
//! without any layering oddities.

use std::fmt::Display;
use std::io::{Error, ErrorKind};
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

const PCI_DEVICES_PER_BUS: u8 = 32;
const PCI_FUNCTIONS_PER_DEVICE: u8 = 8;

/// The kind of virtual storage controller a drive is attached to.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
    strum::EnumIter,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum IfType {
    None,
    Ide,
    Scsi,
    Floppy,
    Pflash,
    Mtd,
    Sd,
    Virtio,
    Xen,
}

impl IfType {
    /// Number of units per bus for this interface kind, or 0 when the kind
    /// has no per-bus limit.
    ///
    /// Do not change these numbers!  They govern how a drive's flat `index`
    /// maps onto (bus, unit), and that mapping is ABI.  Every controller
    /// backing an interface kind with a non-zero limit must support that many
    /// units; otherwise some index values map to impossible addresses.
    pub const fn max_devs(self) -> u32 {
        match self {
            IfType::Ide => 2,
            IfType::Scsi => 7,
            _ => 0,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            IfType::None => "none",
            IfType::Ide => "ide",
            IfType::Scsi => "scsi",
            IfType::Floppy => "floppy",
            IfType::Pflash => "pflash",
            IfType::Mtd => "mtd",
            IfType::Sd => "sd",
            IfType::Virtio => "virtio",
            IfType::Xen => "xen",
        }
    }

    /// Bus number addressed by a flat drive index.
    pub const fn index_to_bus_id(self, index: u32) -> u32 {
        match self.max_devs() {
            0 => 0,
            max => index / max,
        }
    }

    /// Unit number addressed by a flat drive index.
    pub const fn index_to_unit_id(self, index: u32) -> u32 {
        match self.max_devs() {
            0 => index,
            max => index % max,
        }
    }

    /// The (bus, unit) pair addressed by a flat drive index.
    pub const fn index_to_addr(self, index: u32) -> (u32, u32) {
        (self.index_to_bus_id(index), self.index_to_unit_id(index))
    }
}

impl Display for IfType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A PCI slot address as accepted by the `addr` drive option: a hexadecimal
/// device number, optionally followed by `.` and a function number, e.g.
/// "5", "0x1f" or "04.2".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, JsonSchema)]
pub struct PciAddr {
    device: u8,
    function: u8,
}

impl PciAddr {
    pub fn new(device: u8, function: u8) -> Result<Self, std::io::Error> {
        if device >= PCI_DEVICES_PER_BUS {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "PCI device {} outside range of 0-{}",
                    device,
                    PCI_DEVICES_PER_BUS - 1
                ),
            ));
        }

        if function >= PCI_FUNCTIONS_PER_DEVICE {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "PCI function {} outside range of 0-{}",
                    function,
                    PCI_FUNCTIONS_PER_DEVICE - 1
                ),
            ));
        }

        Ok(Self { device, function })
    }

    #[inline]
    pub fn device(&self) -> u8 {
        self.device
    }

    #[inline]
    pub fn function(&self) -> u8 {
        self.function
    }
}

impl FromStr for PciAddr {
    type Err = std::io::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_hex = |field: &str| {
            let digits = field
                .strip_prefix("0x")
                .or_else(|| field.strip_prefix("0X"))
                .unwrap_or(field);
            u8::from_str_radix(digits, 16).map_err(|e| {
                Self::Err::new(
                    ErrorKind::InvalidInput,
                    format!("Failed to parse PCI address {}: {}", s, e),
                )
            })
        };

        match s.split_once('.') {
            Some((dev, func)) => Self::new(parse_hex(dev)?, parse_hex(func)?),
            None => Self::new(parse_hex(s)?, 0),
        }
    }
}

impl Display for PciAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02x}.{:x}", self.device, self.function)
    }
}

impl Serialize for PciAddr {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(format!("{}", self).as_str())
    }
}

impl<'d> Deserialize<'d> for PciAddr {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'d>,
    {
        let s = String::deserialize(deserializer)?;
        FromStr::from_str(&s).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::{IfType, PciAddr};
    use proptest::prelude::*;
    use serde::Deserialize;
    use serde_test::{assert_tokens, Token};
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    const TEST_CASES: &[(&str, Result<PciAddr, ()>)] = &[
        ("05.0", Ok(PciAddr { device: 5, function: 0 })),
        ("1f.7", Ok(PciAddr { device: 0x1f, function: 7 })),
        ("20.0", Err(())),
        ("01.8", Err(())),
        ("1.2.3", Err(())),
        ("zz", Err(())),
        ("", Err(())),
        ("alas, poor PCI device", Err(())),
    ];

    #[test]
    fn pci_addr_from_str() {
        for (input, expected) in TEST_CASES {
            match PciAddr::from_str(input) {
                Ok(addr) => assert_eq!(addr, expected.unwrap()),
                Err(_) => assert!(
                    expected.is_err(),
                    "Expected error parsing PCI address {}",
                    input
                ),
            }
        }
    }

    #[test]
    fn pci_addr_short_forms() {
        assert_eq!(
            PciAddr::from_str("5").unwrap(),
            PciAddr::new(5, 0).unwrap()
        );
        assert_eq!(
            PciAddr::from_str("0x1e").unwrap(),
            PciAddr::new(0x1e, 0).unwrap()
        );
    }

    #[test]
    fn pci_addr_serialization() {
        for (input, expected) in TEST_CASES {
            match expected {
                Ok(addr) => {
                    assert_tokens(addr, &[Token::Str(input)]);
                }
                Err(_) => {
                    let tokens = [Token::Str(input)];
                    let mut de = serde_test::Deserializer::new(&tokens);
                    assert!(PciAddr::deserialize(&mut de).is_err());
                }
            }
        }
    }

    #[test]
    fn if_type_names_round_trip() {
        for kind in IfType::iter() {
            assert_eq!(IfType::from_str(kind.name()).unwrap(), kind);
            assert_tokens(&kind, &[Token::UnitVariant {
                name: "IfType",
                variant: kind.name(),
            }]);
        }
        assert!(IfType::from_str("usb").is_err());
    }

    #[test]
    fn index_mapping_examples() {
        assert_eq!(IfType::Scsi.index_to_addr(0), (0, 0));
        assert_eq!(IfType::Scsi.index_to_addr(1), (0, 1));
        assert_eq!(IfType::Scsi.index_to_addr(7), (1, 0));
        assert_eq!(IfType::Scsi.index_to_addr(12), (1, 5));
        assert_eq!(IfType::Ide.index_to_addr(3), (1, 1));
        assert_eq!(IfType::Virtio.index_to_addr(12), (0, 12));
    }

    fn any_if_type() -> impl Strategy<Value = IfType> {
        proptest::sample::select(IfType::iter().collect::<Vec<_>>())
    }

    proptest! {
        #[test]
        fn index_maps_to_bus_and_unit(
            kind in any_if_type(),
            index in 0u32..100_000,
        ) {
            let (bus, unit) = kind.index_to_addr(index);
            match kind.max_devs() {
                0 => {
                    prop_assert_eq!(bus, 0);
                    prop_assert_eq!(unit, index);
                }
                max => {
                    prop_assert_eq!(bus, index / max);
                    prop_assert_eq!(unit, index % max);
                    prop_assert!(unit < max);
                    prop_assert_eq!(bus * max + unit, index);
                }
            }
        }
    }
}
