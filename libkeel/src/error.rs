use crate::obj::{KeelId, KeelObjType, Oid, PartialOid};
use std::path::PathBuf;
use thiserror::Error;

pub type KeelResult<T> = Result<T, KeelGenericError>;
pub type KeelGenericError = anyhow::Error;

// usually anyhow is enough, but some errors need a typed representation the
// caller can match against (lock conflicts, not-found during backend search, ...)
#[derive(Debug, Error)]
#[cfg_attr(test, derive(PartialEq))]
pub enum KeelError {
    #[error("object with id `{0}` not found")]
    ObjectNotFound(KeelId),
    /// object `{0}` not found in pack index but could be inserted at `{1}`
    #[error("object `{0}` not found in pack index")]
    ObjectNotFoundInPackIndex(Oid, u64),
    #[error("prefix `{0}` is ambiguous")]
    AmbiguousPrefix(PartialOid, Vec<Oid>),
    #[error("failed to resolve symbolic reference `{0}`")]
    NonExistentSymRef(String),
    #[error("reference `{0}` is malformed or points outside the ref namespace")]
    BadRef(String),
    #[error("failed to lock `{0}` (the lock file already exists)")]
    LockBusy(PathBuf),
    #[error("protocol error: {0}")]
    ProtocolError(String),
    #[error("`{0}` is a {1}, expected commit")]
    ExpectedCommit(Oid, KeelObjType),
    #[error("object `{0}` is corrupt: {1}")]
    CorruptObject(Oid, String),
    #[error("cannot write to pack backend")]
    PackBackendWrite,
}

pub trait KeelErrorExt {
    fn try_into_obj_not_found_in_pack_index_err(self) -> KeelResult<(Oid, u64)>;
    fn try_into_obj_not_found_err(self) -> KeelResult<KeelId>;
    fn try_into_keel_error(self) -> KeelResult<KeelError>;
    fn try_into_expected_commit_error(self) -> KeelResult<(Oid, KeelObjType)>;
}

impl KeelErrorExt for KeelGenericError {
    /// tries to convert the generic error into the specific error, returning the original on failure
    fn try_into_obj_not_found_in_pack_index_err(self) -> KeelResult<(Oid, u64)> {
        match self.try_into_keel_error()? {
            KeelError::ObjectNotFoundInPackIndex(oid, idx) => Ok((oid, idx)),
            err => Err(anyhow!(err)),
        }
    }

    fn try_into_obj_not_found_err(self) -> KeelResult<KeelId> {
        match self.try_into_keel_error()? {
            KeelError::ObjectNotFound(id) => Ok(id),
            err => Err(anyhow!(err)),
        }
    }

    fn try_into_keel_error(self) -> KeelResult<KeelError> {
        self.downcast::<KeelError>()
    }

    fn try_into_expected_commit_error(self) -> KeelResult<(Oid, KeelObjType)> {
        match self.try_into_keel_error()? {
            KeelError::ExpectedCommit(oid, obj_type) => Ok((oid, obj_type)),
            err => Err(anyhow!(err)),
        }
    }
}

pub trait KeelResultExt {
    fn is_not_found_err(&self) -> bool;
    fn is_lock_busy(&self) -> bool;
    fn is_fatal(&self) -> bool;
}

macro_rules! error_ext_is_method {
    ($method:ident) => {
        fn $method(&self) -> bool {
            match self {
                Ok(..) => false,
                Err(err) => err.$method(),
            }
        }
    };
}

impl<T> KeelResultExt for KeelResult<T> {
    error_ext_is_method!(is_not_found_err);

    error_ext_is_method!(is_lock_busy);

    error_ext_is_method!(is_fatal);
}

impl KeelResultExt for KeelGenericError {
    fn is_not_found_err(&self) -> bool {
        matches!(
            self.downcast_ref::<KeelError>(),
            Some(KeelError::ObjectNotFound(..) | KeelError::ObjectNotFoundInPackIndex(..))
        )
    }

    fn is_lock_busy(&self) -> bool {
        matches!(self.downcast_ref::<KeelError>(), Some(KeelError::LockBusy(..)))
    }

    fn is_fatal(&self) -> bool {
        match self.downcast_ref::<KeelError>() {
            Some(err) => !matches!(
                err,
                KeelError::ObjectNotFound(..)
                    | KeelError::ObjectNotFoundInPackIndex(..)
                    | KeelError::PackBackendWrite
            ),
            None => true,
        }
    }
}
