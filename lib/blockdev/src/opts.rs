// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flat key/value option sets, as consumed by drive admission.
//!
//! An [`OptionSet`] is an ordered list of string keys and values plus an
//! optional identifier.  It can be built programmatically or parsed from the
//! familiar `key=value,key=value` syntax, where a doubled comma (`,,`) stands
//! for a literal comma inside a value.  Values are kept as strings; callers
//! pull typed values out with [`OptionSet::get_number`] and
//! [`OptionSet::get_bool`].

use std::fmt::Display;

use thiserror::Error;

use crate::error::ErrorClass;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OptionError {
    #[error("Parameter '{0}' expects a number")]
    ExpectedNumber(String),

    #[error("Parameter '{0}' expects 'on' or 'off'")]
    ExpectedBool(String),

    #[error("Invalid parameter '{0}'")]
    InvalidParameter(String),

    #[error("Parameter 'id' expects an identifier")]
    MalformedId,
}

impl OptionError {
    pub fn class(&self) -> ErrorClass {
        match self {
            OptionError::InvalidParameter(_) => ErrorClass::InvalidParameter,
            _ => ErrorClass::InvalidParameterValue,
        }
    }
}

/// Identifiers start with a letter and continue with letters, digits, `-`,
/// `.` or `_`.
pub fn id_wellformed(id: &str) -> bool {
    let mut chars = id.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'))
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OptionSet {
    id: Option<String>,
    entries: Vec<(String, String)>,
}

impl OptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an option string such as `file=disk.img,if=virtio,id=root`.
    ///
    /// A key given without a value is taken to mean `key=on`.
    pub fn parse(optstr: &str) -> Result<Self, OptionError> {
        let mut set = OptionSet::new();
        for item in split_escaped(optstr) {
            if item.is_empty() {
                continue;
            }
            let (key, value) = match item.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (item, "on".to_string()),
            };
            if key.is_empty() {
                return Err(OptionError::InvalidParameter(key));
            }
            if key == "id" {
                if !id_wellformed(&value) {
                    return Err(OptionError::MalformedId);
                }
                set.id = Some(value);
            } else {
                set.entries.push((key, value));
            }
        }
        Ok(set)
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn set_id(&mut self, id: Option<String>) {
        self.id = id;
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Fetch the value for `key`.  When a key was given more than once the
    /// last occurrence wins.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Replace any existing value(s) for `key` with `value`.
    pub fn set(&mut self, key: &str, value: impl Display) {
        self.unset(key);
        self.entries.push((key.to_string(), value.to_string()));
    }

    pub fn unset(&mut self, key: &str) {
        self.entries.retain(|(k, _)| k != key);
    }

    /// Remove `key` from the set, returning its (last) value.
    pub fn take(&mut self, key: &str) -> Option<String> {
        let value = self.get(key).map(str::to_string);
        self.unset(key);
        value
    }

    pub fn rename(&mut self, from: &str, to: &str) {
        for (k, _) in self.entries.iter_mut().filter(|(k, _)| k == from) {
            *k = to.to_string();
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn get_number(&self, key: &str) -> Result<Option<i64>, OptionError> {
        self.get(key)
            .map(|v| {
                v.trim()
                    .parse::<i64>()
                    .map_err(|_| OptionError::ExpectedNumber(key.to_string()))
            })
            .transpose()
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, OptionError> {
        self.get(key)
            .map(|v| match v {
                "on" | "yes" | "true" => Ok(true),
                "off" | "no" | "false" => Ok(false),
                _ => Err(OptionError::ExpectedBool(key.to_string())),
            })
            .transpose()
    }

    pub(crate) fn take_number(
        &mut self,
        key: &str,
    ) -> Result<Option<i64>, OptionError> {
        let v = self.get_number(key)?;
        self.unset(key);
        Ok(v)
    }

    pub(crate) fn take_bool(
        &mut self,
        key: &str,
    ) -> Result<Option<bool>, OptionError> {
        let v = self.get_bool(key)?;
        self.unset(key);
        Ok(v)
    }
}

impl Display for OptionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        let id = self.id.iter().map(|id| ("id", id.as_str()));
        for (k, v) in id.chain(self.iter()) {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            write!(f, "{}={}", k, v.replace(',', ",,"))?;
        }
        Ok(())
    }
}

fn split_escaped(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == ',' {
            if chars.peek() == Some(&',') {
                chars.next();
                cur.push(',');
            } else {
                out.push(std::mem::take(&mut cur));
            }
        } else {
            cur.push(c);
        }
    }
    out.push(cur);
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_basic() {
        let opts =
            OptionSet::parse("file=a.img,if=scsi,index=3,id=disk0").unwrap();
        assert_eq!(opts.id(), Some("disk0"));
        assert_eq!(opts.get("file"), Some("a.img"));
        assert_eq!(opts.get("if"), Some("scsi"));
        assert_eq!(opts.get_number("index").unwrap(), Some(3));
        assert_eq!(opts.len(), 3);
    }

    #[test]
    fn escaped_comma() {
        let opts = OptionSet::parse("file=odd,,name.img,media=cdrom").unwrap();
        assert_eq!(opts.get("file"), Some("odd,name.img"));
        assert_eq!(opts.get("media"), Some("cdrom"));
        assert_eq!(opts.to_string(), "file=odd,,name.img,media=cdrom");
    }

    #[test]
    fn bare_key_is_on() {
        let opts = OptionSet::parse("snapshot,readonly=off").unwrap();
        assert_eq!(opts.get_bool("snapshot").unwrap(), Some(true));
        assert_eq!(opts.get_bool("readonly").unwrap(), Some(false));
        assert_eq!(opts.get_bool("missing").unwrap(), None);
    }

    #[test]
    fn typed_getters_reject_garbage() {
        let opts = OptionSet::parse("cyls=ten,snapshot=maybe").unwrap();
        assert_eq!(
            opts.get_number("cyls"),
            Err(OptionError::ExpectedNumber("cyls".into()))
        );
        assert_eq!(
            opts.get_bool("snapshot"),
            Err(OptionError::ExpectedBool("snapshot".into()))
        );
    }

    #[test]
    fn malformed_id() {
        assert_eq!(OptionSet::parse("id=0bad"), Err(OptionError::MalformedId));
        assert!(id_wellformed("ide0-hd0"));
        assert!(id_wellformed("a.b_c"));
        assert!(!id_wellformed(""));
        assert!(!id_wellformed("has space"));
    }

    #[test]
    fn rename_set_unset() {
        let mut opts = OptionSet::parse("iops=10,bps=20,bps=30").unwrap();
        assert_eq!(opts.get("bps"), Some("30"));
        opts.rename("iops", "throttling.iops-total");
        assert_eq!(opts.get("throttling.iops-total"), Some("10"));
        assert!(!opts.contains("iops"));
        opts.set("bps", 5);
        assert_eq!(opts.len(), 2);
        assert_eq!(opts.take("bps").as_deref(), Some("5"));
        assert!(!opts.contains("bps"));
    }
}
