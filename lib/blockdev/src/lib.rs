// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Drive management for an emulated machine.
//!
//! A [BlockLayer] owns every drive attached to the machine: it admits new
//! drives from option strings, runs the management commands that act on
//! them (media changes, snapshots, throttling, hot-unplug), and drives the
//! long-running block jobs that copy data between images.  It is entirely
//! single-threaded; callers advance pending work with [BlockLayer::poll].

#![allow(clippy::style)]

#[macro_use]
extern crate bitflags;

pub mod admission;
pub mod backend;
pub mod commands;
mod deferred;
pub mod drive;
pub mod error;
pub mod events;
pub mod job;
pub mod layer;
pub mod node;
pub mod opts;
pub mod registry;
pub mod throttle;
pub mod transaction;

#[cfg(test)]
mod test_util;

pub use blockdev_types::{IfType, PciAddr};
pub use drive::{Drive, DriveKey};
pub use error::{Error, ErrorClass, Result};
pub use layer::BlockLayer;
pub use opts::OptionSet;
