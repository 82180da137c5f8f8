//! Provides platform-specific functionality.
//!
//! This module contains the logic for interacting with the operating system to
//! discover candidate block devices, query their size, mount state and I/O
//! counters, and check that the external tools the pipeline drives are
//! installed.
//!
//! Only Linux block devices are supported. The submodule exposes the public API
//! the rest of the library uses, so another POSIX backend could slot in beside
//! it without touching the pipeline.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;
