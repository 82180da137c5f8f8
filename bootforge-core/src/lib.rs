//! The core, UI-agnostic library for the `bootforge` USB imaging utility.
//!
//! `bootforge-core` turns "write this ISO to that stick" into a safe,
//! cancellable pipeline built from external tools. It can be driven by any
//! front-end, whether it's the `bootforge` command-line interface or a
//! graphical shell.
//!
//! The library is structured into several key modules:
//! - [`exec`]: runs commands, optionally elevated, with timeouts and redaction.
//! - [`platform`]: discovers candidate block devices and reads their counters.
//! - [`guard`]: verifies a target and unmounts its partitions.
//! - [`conflict`]: finds and stops other processes writing to the target.
//! - [`partition`]: the three-strategy partition/format engine.
//! - [`mod@write`]: streams the image with the copy tool, with live progress.
//! - [`controller`]: sequences all of the above as one operation.
//! - [`catalog`]: distribution records for front-ends that offer downloads.
//!
//! ## Example: Writing an Image with Progress Reporting
//!
//! ```rust,no_run
//! use bootforge_core::{Executor, OperationController, OperationEvent, Settings, WriteRequest};
//! use std::sync::{Arc, mpsc};
//!
//! fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load(None)?;
//!     let executor = Arc::new(Executor::new(&settings));
//!     let controller = OperationController::new(executor, settings);
//!     controller.authenticate("hunter2")?;
//!
//!     let devices = bootforge_core::platform::list_removable_devices(
//!         controller.runner(),
//!         controller.settings(),
//!     );
//!     let target = devices.first().expect("No removable devices found.");
//!
//!     let (tx, rx) = mpsc::channel();
//!     let worker = controller.start(WriteRequest::new("ubuntu.iso", &target.path), tx)?;
//!     for event in rx {
//!         if let OperationEvent::Progress { percent, .. } = event {
//!             println!("{percent:.1}%");
//!         }
//!     }
//!     println!("{}", worker.join().expect("worker panicked"));
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod config;
pub mod conflict;
pub mod controller;
pub mod device;
pub mod error;
pub mod exec;
pub mod guard;
pub mod image;
pub mod operation;
pub mod partition;
pub mod platform;
pub mod progress;
pub mod write;

#[cfg(test)]
mod testing;

pub use config::Settings;
pub use controller::OperationController;
pub use device::BlockDevice;
pub use error::{ImagingError, Result};
pub use exec::{CommandRunner, Executor};
pub use operation::{CancelFlag, OperationEvent, OperationOutcome, OperationState, WriteRequest};
