//! # Kernel API
//!
//! This crate defines the contract between the emulated kernel and its
//! callers: the emulator front-end and the loader.
//!
//! ## Philosophy
//!
//! The kernel provides **mechanisms**, not policies:
//! - Process creation from an already loaded module (not image parsing)
//! - Explicit error values (not sentinel returns)
//! - Guest status codes kept separate from host errors
//!
//! ## Non-Goals
//!
//! This is NOT:
//! - An executable image loader
//! - A guest syscall dispatcher

pub mod codeseg;
pub mod error;
pub mod status;

pub use codeseg::{CodeSegment, ModuleImage};
pub use error::KernelError;
