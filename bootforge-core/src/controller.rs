//! Operation Controller: sequences the pipeline and owns the single
//! process-wide operation.
//!
//! ```text
//! Validating   credential, image (decompress, checksum), device verify,
//!              conflict pre-check
//! Unmounting   unmount all, force unmount, refuse if anything stays mounted
//! Wiping .. Formatting   FormatEngine strategies
//! Writing      re-unmount, conflict re-check, WriteEngine
//! ```
//!
//! Every outcome returns the controller to [`OperationState::Idle`]. Nothing
//! is rolled back: a failed or cancelled operation leaves the device as the
//! last completed stage left it.

use crate::config::Settings;
use crate::conflict::ConflictDetector;
use crate::error::{ImagingError, Result};
use crate::exec::{CommandRunner, signal_process};
use crate::guard::DeviceGuard;
use crate::image;
use crate::operation::{
    CancelFlag, OperationEvent, OperationOutcome, OperationState, WriteRequest,
};
use crate::partition::{FormatContext, FormatEngine};
use crate::write::{ActiveProcess, WriteEngine};
use nix::sys::signal::Signal;
use std::cell::Cell;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

struct Shared {
    runner: Arc<dyn CommandRunner>,
    settings: Settings,
    state: Mutex<OperationState>,
    busy: AtomicBool,
    cancel: CancelFlag,
    active: ActiveProcess,
    boot_device: Mutex<Option<Option<PathBuf>>>,
}

/// Runs at most one write operation at a time. Cheap to clone; clones share
/// the same operation slot, so a clone can cancel from another thread.
#[derive(Clone)]
pub struct OperationController {
    shared: Arc<Shared>,
}

/// Releases the operation slot when the pipeline ends, however it ends.
struct BusyGuard<'a>(&'a Shared);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        *self.0.state.lock().unwrap_or_else(PoisonError::into_inner) = OperationState::Idle;
        self.0.busy.store(false, Ordering::SeqCst);
    }
}

impl OperationController {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: Settings) -> Self {
        Self {
            shared: Arc::new(Shared {
                runner,
                settings,
                state: Mutex::new(OperationState::Idle),
                busy: AtomicBool::new(false),
                cancel: CancelFlag::new(),
                active: ActiveProcess::default(),
                boot_device: Mutex::new(None),
            }),
        }
    }

    /// Overrides boot-device detection for the device guard.
    pub fn with_boot_device(self, boot: Option<PathBuf>) -> Self {
        *self
            .shared
            .boot_device
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(boot);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.shared.settings
    }

    pub fn runner(&self) -> &dyn CommandRunner {
        self.shared.runner.as_ref()
    }

    /// Validates and stores the elevation credential.
    pub fn authenticate(&self, password: &str) -> Result<()> {
        self.shared.runner.authenticate(password)
    }

    pub fn status(&self) -> OperationState {
        *self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.shared.busy.load(Ordering::SeqCst)
    }

    /// Starts `request` on a worker thread. Events, ending with
    /// [`OperationEvent::Finished`], are sent to `events`.
    ///
    /// Fails with [`ImagingError::OperationInProgress`] while another
    /// operation runs; the request is not queued.
    pub fn start(
        &self,
        request: WriteRequest,
        events: Sender<OperationEvent>,
    ) -> Result<JoinHandle<OperationOutcome>> {
        self.claim()?;
        let shared = Arc::clone(&self.shared);
        thread::Builder::new()
            .name("bootforge-worker".to_string())
            .spawn(move || shared.execute(&request, &events))
            .map_err(|e| {
                self.shared.busy.store(false, Ordering::SeqCst);
                ImagingError::unexpected(format!("failed to start worker thread: {e}"))
            })
    }

    /// Runs `request` on the calling thread.
    pub fn run_blocking(
        &self,
        request: &WriteRequest,
        events: &Sender<OperationEvent>,
    ) -> Result<OperationOutcome> {
        self.claim()?;
        Ok(self.shared.execute(request, events))
    }

    /// Requests cancellation: sets the flag, interrupts any command the
    /// worker is waiting on, stops the active copy process, then kills any
    /// remaining copy-tool writer on the system. Returns `false` when nothing
    /// was running.
    ///
    /// The state machine is left to the worker, which moves to
    /// [`OperationState::Cancelling`] once it observes the flag.
    pub fn cancel(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        log::warn!("Cancellation requested");
        self.shared.cancel.cancel();

        let runner = self.shared.runner.as_ref();
        let interrupted = runner.interrupt();
        if interrupted > 0 {
            log::debug!("Interrupted {interrupted} running command(s)");
        }
        if let Some(pid) = self.shared.active.get() {
            signal_process(runner, pid, Signal::SIGTERM);
        }

        let detector = ConflictDetector::new(runner, &self.shared.settings);
        let (found, writers) = detector.scan_for_writers(None);
        if found {
            detector.terminate(None, &writers);
        }
        true
    }

    fn claim(&self) -> Result<()> {
        self.shared
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| ImagingError::OperationInProgress)?;
        self.shared.cancel.reset();
        Ok(())
    }
}

impl Shared {
    fn set_state(&self, state: OperationState, events: &Sender<OperationEvent>) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
        log::debug!("State: {state}");
        let _ = events.send(OperationEvent::StateChanged(state));
    }

    fn guard(&self) -> DeviceGuard<'_> {
        let guard = DeviceGuard::new(self.runner.as_ref(), &self.settings);
        match self
            .boot_device
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            Some(boot) => guard.with_boot_device(boot),
            None => guard,
        }
    }

    fn execute(&self, request: &WriteRequest, events: &Sender<OperationEvent>) -> OperationOutcome {
        let _busy = BusyGuard(self);
        let stage = Cell::new(OperationState::Idle);

        let outcome = match self.pipeline(request, events, &stage) {
            Ok(()) => {
                self.set_state(OperationState::Succeeded, events);
                OperationOutcome::Succeeded
            }
            Err(ImagingError::Cancelled) => {
                self.set_state(OperationState::Cancelling, events);
                self.set_state(OperationState::Failed, events);
                OperationOutcome::Cancelled
            }
            Err(error) => {
                let stage = stage.get();
                log::error!("Operation failed while {stage}: {error}");
                self.set_state(OperationState::Failed, events);
                OperationOutcome::Failed { stage, error }
            }
        };

        log::info!("Operation {outcome}");
        let _ = events.send(OperationEvent::Finished(outcome.clone()));
        self.set_state(OperationState::Idle, events);
        outcome
    }

    fn pipeline(
        &self,
        request: &WriteRequest,
        events: &Sender<OperationEvent>,
        stage: &Cell<OperationState>,
    ) -> Result<()> {
        let runner = self.runner.as_ref();
        let settings = &self.settings;
        let device = request.device.as_path();
        let message = |text: String| {
            let _ = events.send(OperationEvent::Message(text));
        };
        let enter = |state: OperationState| {
            stage.set(state);
            self.set_state(state, events);
        };

        enter(OperationState::Validating);
        if !runner.has_credential() {
            return Err(ImagingError::CredentialMissing);
        }
        let prepared = image::prepare(&request.image, &self.cancel, |bytes| {
            let _ = events.send(OperationEvent::Decompressing { bytes });
        })?;
        if let Some(expected) = &request.checksum {
            message(format!("Verifying {} checksum", expected.algorithm));
            image::verify_checksum(prepared.path(), expected, &self.cancel)?;
        }
        self.cancel.check()?;

        let guard = self.guard();
        guard.verify(device)?;
        self.clear_conflicts(request)?;
        self.cancel.check()?;

        enter(OperationState::Unmounting);
        guard.unmount_all(device);
        let remaining = guard.force_unmount(device);
        if !remaining.is_empty() {
            return Err(ImagingError::StillMounted {
                device: device.display().to_string(),
                mounts: remaining,
            });
        }
        self.cancel.check()?;

        let ctx = FormatContext {
            runner,
            settings,
            device,
            cancel: &self.cancel,
            on_state: &enter,
        };
        let format_result = FormatEngine::default().run(&ctx);
        let strategy = format_result?;
        message(format!("Formatted with the {strategy} strategy"));

        enter(OperationState::Writing);
        guard.unmount_all(device);
        self.clear_conflicts(request)?;
        self.cancel.check()?;

        let engine = WriteEngine::new(runner, settings, &self.cancel)
            .with_active_process(self.active.clone());
        engine.write(prepared.path(), device, &mut |progress| {
            let _ = events.send(OperationEvent::Progress {
                percent: progress.percent(),
                bytes: progress.bytes(),
                total: progress.total(),
            });
        })
    }

    /// Scans for writers targeting the device and, if allowed, kills them.
    /// Any survivor aborts the operation.
    fn clear_conflicts(&self, request: &WriteRequest) -> Result<()> {
        let detector = ConflictDetector::new(self.runner.as_ref(), &self.settings);
        let device = Some(request.device.as_path());
        let (dangerous, writers) = detector.scan_for_writers(device);
        if !dangerous {
            return Ok(());
        }
        if !request.terminate_conflicts {
            return Err(ImagingError::ConflictingWriter(writers));
        }
        if detector.terminate(device, &writers) {
            return Ok(());
        }
        let (_, survivors) = detector.scan_for_writers(device);
        Err(ImagingError::ConflictingWriter(if survivors.is_empty() {
            writers
        } else {
            survivors
        }))
    }
}
