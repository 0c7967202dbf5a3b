//! Error types and the engine-code to POSIX translation.

use thiserror::Error;

use crate::arena::HandleId;
use crate::engine::FatCode;

/// POSIX-style error kinds surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// `EINVAL`
    InvalidArgument,
    /// `ECANCELED`
    Canceled,
    /// `EIO`
    Io,
    /// `EACCES`
    PermissionDenied,
    /// `ENOENT`
    NotFound,
    /// `ENFILE`
    TooManyOpen,
    /// `EEXIST`
    AlreadyExists,
    /// `ENOMEM`
    OutOfMemory,
    /// `EBUSY`
    Busy,
    /// `ENODATA`
    NoFilesystem,
    /// `EBADF`
    BadHandle,
    /// `ENOSYS`
    NotSupported,
    /// `ENOTSUP`
    Unsupported,
}

impl ErrorKind {
    /// The errno value for this kind.
    pub fn errno(&self) -> i32 {
        use libc::*;
        match self {
            ErrorKind::InvalidArgument => EINVAL,
            ErrorKind::Canceled => ECANCELED,
            ErrorKind::Io => EIO,
            ErrorKind::PermissionDenied => EACCES,
            ErrorKind::NotFound => ENOENT,
            ErrorKind::TooManyOpen => ENFILE,
            ErrorKind::AlreadyExists => EEXIST,
            ErrorKind::OutOfMemory => ENOMEM,
            ErrorKind::Busy => EBUSY,
            ErrorKind::NoFilesystem => ENODATA,
            ErrorKind::BadHandle => EBADF,
            ErrorKind::NotSupported => ENOSYS,
            ErrorKind::Unsupported => ENOTSUP,
        }
    }
}

/// Translates an engine result code. `Ok` translates to `None`; codes
/// outside the table translate to [`ErrorKind::Unsupported`].
pub fn compute_errno(code: FatCode) -> Option<ErrorKind> {
    let kind = match code {
        FatCode::Ok => return None,

        FatCode::IntErr
        | FatCode::NotReady
        | FatCode::InvalidObject
        | FatCode::NotEnabled
        | FatCode::Locked
        | FatCode::InvalidParameter => ErrorKind::InvalidArgument,

        FatCode::MkfsAborted => ErrorKind::Canceled,

        FatCode::DiskErr => ErrorKind::Io,

        FatCode::Denied | FatCode::WriteProtected => ErrorKind::PermissionDenied,

        FatCode::NoFile | FatCode::NoPath | FatCode::InvalidName | FatCode::InvalidDrive => {
            ErrorKind::NotFound
        }

        FatCode::TooManyOpenFiles => ErrorKind::TooManyOpen,

        FatCode::Exist => ErrorKind::AlreadyExists,

        FatCode::NotEnoughCore => ErrorKind::OutOfMemory,

        FatCode::Timeout => ErrorKind::Busy,

        FatCode::NoFilesystem => ErrorKind::NoFilesystem,

        FatCode::Unknown(_) => ErrorKind::Unsupported,
    };
    Some(kind)
}

/// Errors returned by the adapter.
#[derive(Debug, Error)]
pub enum FsError {
    /// The engine rejected a call.
    #[error("{op} failed: engine code {code:?}")]
    Engine {
        /// The adapter operation that issued the call.
        op: &'static str,
        /// The engine result code.
        code: FatCode,
    },

    /// The path exists but has the wrong type for the operation.
    #[error("{op}: {path} not found")]
    NotFound {
        /// The adapter operation.
        op: &'static str,
        /// The offending path.
        path: String,
    },

    /// A caller-supplied argument was rejected before reaching the engine.
    #[error("Invalid argument: {msg}")]
    InvalidArgument {
        /// What was wrong.
        msg: String,
    },

    /// The operation has no counterpart in the engine.
    #[error("Operation not supported: {op}")]
    NotSupported {
        /// The adapter operation.
        op: &'static str,
    },

    /// The handle was closed or its volume was unmounted.
    #[error("Stale handle: {handle}")]
    StaleHandle {
        /// The invalidated handle.
        handle: HandleId,
    },

    /// Mount was requested on an adapter that is already mounted.
    #[error("Volume already mounted")]
    AlreadyMounted,
}

/// Result alias for adapter operations.
pub type Result<T> = std::result::Result<T, FsError>;

impl FsError {
    /// Wraps an engine code reported by `op`.
    pub fn engine(op: &'static str, code: FatCode) -> Self {
        FsError::Engine { op, code }
    }

    /// The POSIX error kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FsError::Engine { code, .. } => {
                compute_errno(*code).unwrap_or(ErrorKind::Unsupported)
            }
            FsError::NotFound { .. } => ErrorKind::NotFound,
            FsError::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            FsError::NotSupported { .. } => ErrorKind::NotSupported,
            FsError::StaleHandle { .. } => ErrorKind::BadHandle,
            FsError::AlreadyMounted => ErrorKind::Busy,
        }
    }

    /// The errno value for this error.
    pub fn to_errno(&self) -> i32 {
        self.kind().errno()
    }
}

impl From<FsError> for std::io::Error {
    fn from(err: FsError) -> Self {
        use std::io::ErrorKind as Io;
        let kind = match err.kind() {
            ErrorKind::NotFound => Io::NotFound,
            ErrorKind::PermissionDenied => Io::PermissionDenied,
            ErrorKind::AlreadyExists => Io::AlreadyExists,
            ErrorKind::InvalidArgument => Io::InvalidInput,
            ErrorKind::OutOfMemory => Io::OutOfMemory,
            ErrorKind::NotSupported | ErrorKind::Unsupported => Io::Unsupported,
            _ => Io::Other,
        };
        std::io::Error::new(kind, err)
    }
}

/// Attaches the issuing operation name to engine failures.
pub(crate) trait EngineContext<T> {
    fn context(self, op: &'static str) -> Result<T>;
}

impl<T> EngineContext<T> for std::result::Result<T, FatCode> {
    fn context(self, op: &'static str) -> Result<T> {
        self.map_err(|code| FsError::engine(op, code))
    }
}
