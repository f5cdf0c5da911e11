use std::io;

use thiserror::Error;

/// Error conditions raised by the persistence layer and the objects it
/// walks.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("file is not a saved state")]
    NotSavedState,
    #[error("saved state file is damaged (checksum mismatch)")]
    BadSavedState,
    #[error("saved state belongs to a different image")]
    WrongSavedState,
    #[error("error reading file: {0}")]
    ReadFile(#[source] io::Error),
    #[error("error writing file: {0}")]
    WriteFile(#[source] io::Error),
    #[error("metadata table exceeds 65535 bytes")]
    DescTabOverflow,
    #[error("invalid property assignment")]
    InvalidSetProp,
    #[error("wrong number of arguments")]
    WrongNumArgs,
    #[error("invalid value for built-in function argument")]
    BadValBif,
    #[error("index out of range")]
    OutOfRange,
    #[error("saved state refers to object {0} which is not in the image")]
    SavedObjIdInvalid(u32),
    #[error("unknown metaclass {0:?}")]
    UnknownMetaclass(String),
    #[error("object {id} is not a {expected}")]
    WrongObjectType { id: u32, expected: &'static str },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl VmError {
    /// Short identifier for the error kind, suitable for tooling output.
    pub fn kind_name(&self) -> &'static str {
        match self {
            VmError::NotSavedState => "NotSavedState",
            VmError::BadSavedState => "BadSavedState",
            VmError::WrongSavedState => "WrongSavedState",
            VmError::ReadFile(_) => "ReadFile",
            VmError::WriteFile(_) => "WriteFile",
            VmError::DescTabOverflow => "DescTabOverflow",
            VmError::InvalidSetProp => "InvalidSetProp",
            VmError::WrongNumArgs => "WrongNumArgs",
            VmError::BadValBif => "BadValBif",
            VmError::OutOfRange => "OutOfRange",
            VmError::SavedObjIdInvalid(_) => "SavedObjIdInvalid",
            VmError::UnknownMetaclass(_) => "UnknownMetaclass",
            VmError::WrongObjectType { .. } => "WrongObjectType",
            VmError::InvalidConfig(_) => "InvalidConfig",
        }
    }
}

pub type Result<T, E = VmError> = std::result::Result<T, E>;
