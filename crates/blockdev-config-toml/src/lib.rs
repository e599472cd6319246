// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::Path;

use blockdev::opts::{id_wellformed, OptionSet};
use blockdev_types::IfType;
use serde_derive::Deserialize;
use thiserror::Error;

/// Configuration for a standalone block layer.
#[derive(Deserialize, Debug, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub main: Main,

    /// Images to create before any drive is admitted.
    #[serde(default, rename = "image")]
    pub images: Vec<Image>,

    /// Drives, admitted in order.
    #[serde(default, rename = "drive")]
    pub drives: Vec<Drive>,
}

#[derive(Deserialize, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Main {
    /// Bus kind for drives which do not name one.
    #[serde(default = "default_if")]
    pub default_if: IfType,

    /// Open every drive as the target of an incoming migration.
    #[serde(default)]
    pub incoming: bool,

    /// Restrict the image formats drives may use.
    #[serde(default)]
    pub formats: Option<Formats>,
}

impl Default for Main {
    fn default() -> Self {
        Self { default_if: default_if(), incoming: false, formats: None }
    }
}

fn default_if() -> IfType {
    IfType::Ide
}

/// Format whitelist.  Formats in `ro` may only be opened read-only.
#[derive(Deserialize, Debug, Default, PartialEq, Eq)]
pub struct Formats {
    #[serde(default)]
    pub rw: Vec<String>,
    #[serde(default)]
    pub ro: Vec<String>,
}

#[derive(Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct Image {
    pub name: String,
    pub format: String,
    /// Taken from the backing image when omitted.
    pub size: Option<u64>,
    pub backing: Option<String>,
    pub backing_format: Option<String>,
    pub encryption_key: Option<String>,
}

/// A drive, given as the same flat key/value options the command line
/// takes.
#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Drive {
    #[serde(flatten, default)]
    pub options: toml::Table,
}

impl Drive {
    pub fn get_string<S: AsRef<str>>(&self, key: S) -> Option<&str> {
        self.options.get(key.as_ref())?.as_str()
    }

    /// Convert to an option set.  Booleans become `on` or `off`.
    pub fn to_option_set(&self) -> Result<OptionSet, ParseError> {
        let mut opts = OptionSet::new();
        for (key, value) in self.options.iter() {
            let value = match value {
                toml::Value::String(s) => s.clone(),
                toml::Value::Integer(n) => n.to_string(),
                toml::Value::Float(f) => f.to_string(),
                toml::Value::Boolean(true) => "on".to_string(),
                toml::Value::Boolean(false) => "off".to_string(),
                _ => return Err(ParseError::NotScalar(key.clone())),
            };
            if key == "id" {
                if !id_wellformed(&value) {
                    return Err(ParseError::MalformedId(value));
                }
                opts.set_id(Some(value));
            } else {
                opts.set(key, value);
            }
        }
        Ok(opts)
    }
}

/// Errors which may be returned when parsing the configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Drive option {0} must be a string, number or boolean")]
    NotScalar(String),

    #[error("Malformed drive id {0:?}")]
    MalformedId(String),
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    parse_str(&contents)
}

pub fn parse_str(contents: &str) -> Result<Config, ParseError> {
    Ok(toml::from_str::<Config>(contents)?)
}
