//! Kernel error types

use crate::status;
use core_types::{Handle, MemoryError, ObjectId, ObjectType, ProcessUidType};
use thiserror::Error;

/// Errors that can occur when interacting with the kernel
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KernelError {
    /// The loaded module could not be turned into a process
    #[error("Failed to load module: {0}")]
    LoadFailed(String),

    /// Memory allocation or translation failed
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    /// A running process already carries this uid triple
    #[error("Process with uids {0} already exists")]
    AlreadyExists(ProcessUidType),

    /// The process already has a code segment attached
    #[error("Process {0} is already constructed")]
    AlreadyConstructed(ObjectId),

    /// The process has no code segment attached yet
    #[error("Process {0} has no code segment")]
    NotConstructed(ObjectId),

    /// No object with this id
    #[error("Object not found: {0}")]
    ObjectNotFound(ObjectId),

    /// The object exists but has a different type
    #[error("Object {id} is a {actual}, expected {expected}")]
    WrongObjectType {
        id: ObjectId,
        expected: ObjectType,
        actual: ObjectType,
    },

    /// The handle does not name an open object
    #[error("Invalid handle: {0}")]
    InvalidHandle(Handle),

    /// A security policy was not satisfied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Mutex released by a thread that does not hold it
    #[error("Thread {thread} does not hold mutex {mutex}")]
    NotMutexHolder { mutex: ObjectId, thread: ObjectId },

    /// The operation needs the process to have exited
    #[error("Process {0} is still alive")]
    ProcessStillAlive(ObjectId),

    /// The operation needs a current thread
    #[error("No thread is current")]
    NoCurrentThread,
}

impl KernelError {
    /// Guest-visible status code for this error
    pub fn status_code(&self) -> i32 {
        match self {
            KernelError::LoadFailed(_) => status::KERR_CORRUPT,
            KernelError::Memory(_) => status::KERR_NO_MEMORY,
            KernelError::AlreadyExists(_) => status::KERR_ALREADY_EXISTS,
            KernelError::AlreadyConstructed(_) | KernelError::NotConstructed(_) => {
                status::KERR_GENERAL
            }
            KernelError::ObjectNotFound(_) | KernelError::InvalidHandle(_) => {
                status::KERR_NOT_FOUND
            }
            KernelError::WrongObjectType { .. } => status::KERR_ARGUMENT,
            KernelError::PermissionDenied(_) => status::KERR_PERMISSION_DENIED,
            KernelError::NotMutexHolder { .. }
            | KernelError::ProcessStillAlive(_)
            | KernelError::NoCurrentThread => status::KERR_GENERAL,
        }
    }

    /// Returns true for lookup failures a caller can recover from
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            KernelError::ObjectNotFound(_) | KernelError::InvalidHandle(_)
        )
    }
}
