use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Precondition,
    AlreadyInstalled,
    NoStorageFound,
    MissingReleaseFile,
    InvalidUuid,
    RegistryLookup,
    EmptyRegistry,
    ExternalTool,
    Backup,
    Wipe,
    Partition,
    BootloaderWrite,
    Format,
    Copy,
    WriteFailed,
    Other,
}

/// Coarse failure classes used for exit reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    PreconditionFailure,
    AlreadyInstalled,
    NoStorageFound,
    RegistryLookupFailure,
    ExternalToolFailure,
    DestructiveStepFailure,
}

impl ErrorKind {
    pub fn class(self) -> ErrorClass {
        match self {
            ErrorKind::Precondition
            | ErrorKind::MissingReleaseFile
            | ErrorKind::InvalidUuid
            | ErrorKind::Other => ErrorClass::PreconditionFailure,
            ErrorKind::AlreadyInstalled => ErrorClass::AlreadyInstalled,
            ErrorKind::NoStorageFound => ErrorClass::NoStorageFound,
            ErrorKind::RegistryLookup | ErrorKind::EmptyRegistry => {
                ErrorClass::RegistryLookupFailure
            }
            ErrorKind::ExternalTool => ErrorClass::ExternalToolFailure,
            ErrorKind::Backup
            | ErrorKind::Wipe
            | ErrorKind::Partition
            | ErrorKind::BootloaderWrite
            | ErrorKind::Format
            | ErrorKind::Copy
            | ErrorKind::WriteFailed => ErrorClass::DestructiveStepFailure,
        }
    }

    pub fn is_destructive(self) -> bool {
        self.class() == ErrorClass::DestructiveStepFailure
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Other, msg)
    }

    pub fn new<M: Into<String>>(kind: ErrorKind, msg: M) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    // Keeps the message, replaces the classification.
    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn message(&self) -> &str {
        &self.msg
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::msg(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
