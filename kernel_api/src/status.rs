//! Guest-visible status codes
//!
//! These are the values written into a request status word when the kernel
//! completes an asynchronous request.

/// Request completed successfully
pub const KERR_NONE: i32 = 0;
/// Object or handle not found
pub const KERR_NOT_FOUND: i32 = -1;
/// Unspecified failure
pub const KERR_GENERAL: i32 = -2;
/// Request was cancelled
pub const KERR_CANCEL: i32 = -3;
/// Out of memory or address space
pub const KERR_NO_MEMORY: i32 = -4;
/// Bad argument
pub const KERR_ARGUMENT: i32 = -6;
/// Object already exists
pub const KERR_ALREADY_EXISTS: i32 = -11;
/// Malformed data
pub const KERR_CORRUPT: i32 = -20;
/// Security policy not satisfied
pub const KERR_PERMISSION_DENIED: i32 = -46;

/// Panic reason given to a thread killed by an unhandled CPU exception
pub const KERN_EXEC_EXCEPTION: i32 = 3;

/// Value held by a request status word while the request is outstanding
pub const KREQUEST_PENDING: i32 = i32::MIN;

/// Human-readable name of a status code
pub fn status_name(code: i32) -> &'static str {
    match code {
        KERR_NONE => "KErrNone",
        KERR_NOT_FOUND => "KErrNotFound",
        KERR_GENERAL => "KErrGeneral",
        KERR_CANCEL => "KErrCancel",
        KERR_NO_MEMORY => "KErrNoMemory",
        KERR_ARGUMENT => "KErrArgument",
        KERR_ALREADY_EXISTS => "KErrAlreadyExists",
        KERR_CORRUPT => "KErrCorrupt",
        KERR_PERMISSION_DENIED => "KErrPermissionDenied",
        KREQUEST_PENDING => "KRequestPending",
        _ => "Unknown",
    }
}
