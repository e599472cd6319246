// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The structured error returned by every public block layer operation.

use serde::Serialize;
use thiserror::Error;

use crate::admission::AdmissionError;
use crate::backend::BackendError;
use crate::opts::OptionError;
use crate::throttle::ThrottleError;

/// Machine-readable error kind, as reported alongside the human message.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Serialize, strum::IntoStaticStr,
)]
pub enum ErrorClass {
    GenericError,
    DeviceNotFound,
    DeviceInUse,
    DeviceHasNoMedium,
    DeviceNotRemovable,
    DeviceLocked,
    DeviceIsReadOnly,
    DeviceEncrypted,
    DeviceNotEncrypted,
    InvalidPassword,
    InvalidBlockFormat,
    InvalidParameter,
    InvalidParameterValue,
    BaseNotFound,
    BlockJobNotActive,
    BlockJobPaused,
    BlockJobNotReady,
    Unsupported,
    IoError,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Option(#[from] OptionError),

    #[error(transparent)]
    Throttle(#[from] ThrottleError),

    #[error("Device '{0}' not found")]
    DeviceNotFound(String),

    #[error("Device '{0}' is in use")]
    DeviceInUse(String),

    #[error("Device '{0}' has no medium")]
    DeviceHasNoMedium(String),

    #[error("Device '{0}' is not removable")]
    DeviceNotRemovable(String),

    #[error("Device '{0}' is locked")]
    DeviceLocked(String),

    #[error("Device '{0}' is read only")]
    DeviceIsReadOnly(String),

    #[error("'{device}' ({filename}) is encrypted")]
    DeviceEncrypted { device: String, filename: String },

    #[error("Device '{0}' is not encrypted")]
    DeviceNotEncrypted(String),

    #[error("Password incorrect")]
    InvalidPassword,

    #[error("Invalid block format '{0}'")]
    InvalidBlockFormat(String),

    #[error("Invalid parameter '{0}'")]
    InvalidParameter(String),

    #[error("Parameter '{name}' expects {expected}")]
    InvalidParameterValue { name: String, expected: String },

    #[error("Base '{0}' not found")]
    BaseNotFound(String),

    #[error("No active block job on device '{0}'")]
    BlockJobNotActive(String),

    #[error("The block job for device '{0}' is currently paused")]
    BlockJobPaused(String),

    #[error("The active block job for device '{0}' cannot be completed")]
    BlockJobNotReady(String),

    #[error("this feature or command is not currently supported")]
    Unsupported,

    #[error("An IO error has occurred")]
    IoError,

    #[error("Duplicate ID '{0}' for drive")]
    DuplicateId(String),

    #[error("Could not open '{filename}': {source}")]
    OpenFile {
        filename: String,
        #[source]
        source: BackendError,
    },

    #[error("{context}: {source}")]
    Backend {
        context: String,
        #[source]
        source: BackendError,
    },

    #[error("Transaction aborted using Abort action")]
    TransactionAborted,

    #[error("{0}")]
    Generic(String),
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Admission(e) => e.class(),
            Error::Option(e) => e.class(),
            Error::Throttle(_) => ErrorClass::InvalidParameter,
            Error::DeviceNotFound(_) => ErrorClass::DeviceNotFound,
            Error::DeviceInUse(_) => ErrorClass::DeviceInUse,
            Error::DeviceHasNoMedium(_) => ErrorClass::DeviceHasNoMedium,
            Error::DeviceNotRemovable(_) => ErrorClass::DeviceNotRemovable,
            Error::DeviceLocked(_) => ErrorClass::DeviceLocked,
            Error::DeviceIsReadOnly(_) => ErrorClass::DeviceIsReadOnly,
            Error::DeviceEncrypted { .. } => ErrorClass::DeviceEncrypted,
            Error::DeviceNotEncrypted(_) => ErrorClass::DeviceNotEncrypted,
            Error::InvalidPassword => ErrorClass::InvalidPassword,
            Error::InvalidBlockFormat(_) => ErrorClass::InvalidBlockFormat,
            Error::InvalidParameter(_) => ErrorClass::InvalidParameter,
            Error::InvalidParameterValue { .. } => {
                ErrorClass::InvalidParameterValue
            }
            Error::BaseNotFound(_) => ErrorClass::BaseNotFound,
            Error::BlockJobNotActive(_) => ErrorClass::BlockJobNotActive,
            Error::BlockJobPaused(_) => ErrorClass::BlockJobPaused,
            Error::BlockJobNotReady(_) => ErrorClass::BlockJobNotReady,
            Error::Unsupported => ErrorClass::Unsupported,
            Error::IoError => ErrorClass::IoError,
            Error::DuplicateId(_)
            | Error::OpenFile { .. }
            | Error::Backend { .. }
            | Error::TransactionAborted
            | Error::Generic(_) => ErrorClass::GenericError,
        }
    }

    pub(crate) fn backend(
        context: impl Into<String>,
        source: BackendError,
    ) -> Self {
        Error::Backend { context: context.into(), source }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn class_names_are_stable() {
        let name: &'static str =
            Error::DeviceNotFound("ide0-hd0".into()).class().into();
        assert_eq!(name, "DeviceNotFound");
        assert_eq!(
            serde_json::to_string(&ErrorClass::BlockJobPaused).unwrap(),
            "\"BlockJobPaused\""
        );
    }

    #[test]
    fn messages_name_the_device() {
        let err = Error::BlockJobNotActive("virtio0".into());
        assert_eq!(err.to_string(), "No active block job on device 'virtio0'");
        assert_eq!(err.class(), ErrorClass::BlockJobNotActive);

        let err = Error::OpenFile {
            filename: "snap.qcow2".into(),
            source: BackendError::NotFound,
        };
        assert_eq!(
            err.to_string(),
            "Could not open 'snap.qcow2': No such file or directory"
        );
        assert_eq!(err.class(), ErrorClass::GenericError);
    }
}
