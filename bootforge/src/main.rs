use anyhow::{Context, Result, anyhow, bail};
use bootforge_core::catalog::{self, Architectures, Catalog, VersionRegistry};
use bootforge_core::conflict::ConflictDetector;
use bootforge_core::image::{self, Checksum, ChecksumAlgorithm};
use bootforge_core::{
    BlockDevice, Executor, ImagingError, OperationController, OperationEvent,
    OperationOutcome, OperationState, Settings, WriteRequest,
};
use clap::{ArgAction, Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Password, Select, theme::ColorfulTheme};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::io::{IsTerminal, Write as _, stdout};
use std::path::{Path, PathBuf};
use std::sync::{Arc, mpsc};
use std::time::Duration;

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

/// Password attempts before giving up.
const AUTH_ATTEMPTS: usize = 3;

#[derive(Parser)]
#[command(name = "bootforge")]
#[command(about = "A safe, interactive tool for making bootable USB drives", version)]
struct Cli {
    /// Increase log output (-v for info, -vv for debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Settings file to use instead of the default location
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an image to a removable device
    Write {
        /// Image file to write (.iso, .img, optionally .gz/.xz/.zst)
        #[arg(required = true)]
        image: PathBuf,

        /// Target device; prompts for one when omitted
        #[arg(short, long)]
        device: Option<PathBuf>,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,

        /// Expected SHA-256 of the image
        #[arg(long, value_name = "HEX", conflicts_with = "sha512")]
        sha256: Option<String>,

        /// Expected SHA-512 of the image
        #[arg(long, value_name = "HEX")]
        sha512: Option<String>,

        /// Abort instead of killing other processes writing to the device
        #[arg(long)]
        no_kill: bool,
    },
    /// List available removable devices
    List,
    /// Look for other copy processes writing to a device
    Scan {
        /// Only report writers targeting this device
        #[arg(short, long)]
        device: Option<PathBuf>,

        /// Kill the writers that were found
        #[arg(long)]
        kill: bool,
    },
    /// Browse or export the distribution catalog
    Catalog {
        #[command(subcommand)]
        action: CatalogAction,
    },
}

#[derive(Subcommand)]
enum CatalogAction {
    /// Show every distribution with its variants, architectures and versions
    List {
        /// Catalog file to read instead of the user or built-in catalog
        #[arg(long, value_name = "FILE")]
        file: Option<PathBuf>,
    },
    /// Write the catalog, with versions filled in, to a JSON file
    Save {
        /// Destination; defaults to the user catalog location
        output: Option<PathBuf>,
    },
}

/// A helper struct that, on Unix, disables `ECHOCTL` for the terminal.
///
/// `ECHOCTL` is the terminal flag that causes Ctrl+C to be printed as `^C`.
/// With it disabled the cancellation message is printed on a clean line
/// below the progress bars. The original state is restored on drop.
struct TermRestorer {
    #[cfg(unix)]
    original_termios: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            if !stdout().is_terminal() {
                return Self {
                    original_termios: None,
                };
            }

            let fd = stdout().as_raw_fd();
            let original_termios = Termios::from_fd(fd).ok().filter(|original| {
                let mut quiet = *original;
                quiet.c_lflag &= !ECHOCTL;
                tcsetattr(fd, TCSANOW, &quiet).is_ok()
            });
            Self { original_termios }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref original_termios) = self.original_termios {
            tcsetattr(stdout().as_raw_fd(), TCSANOW, original_termios).ok();
        }
    }
}

fn init_logger(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .parse_default_env() // RUST_LOG wins over -v
        .init();
}

/// Presents an interactive menu for the user to select a device.
fn select_device(devices: &[BlockDevice], prompt: &str) -> Result<BlockDevice> {
    if devices.is_empty() {
        return Err(anyhow!("No removable devices found."));
    }

    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    Ok(devices[selection].clone())
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

/// Prompts for the elevation password until the executor accepts one.
fn ensure_credential(controller: &OperationController) -> Result<()> {
    if controller.runner().has_credential() {
        return Ok(());
    }

    let prompt = format!(
        "Password for {} (needed to write to the device)",
        controller.settings().elevation_tool
    );
    for attempt in 1..=AUTH_ATTEMPTS {
        let password = Password::with_theme(&ColorfulTheme::default())
            .with_prompt(&prompt)
            .interact()?;
        match controller.authenticate(&password) {
            Ok(()) => return Ok(()),
            Err(ImagingError::CredentialInvalid(reason)) => {
                log::debug!("Authentication attempt {attempt} failed: {reason}");
                eprintln!("{} Sorry, try again.", style("✗").red());
            }
            Err(e) => return Err(e.into()),
        }
    }
    bail!("Authentication failed after {AUTH_ATTEMPTS} attempts")
}

fn parse_checksum(sha256: Option<String>, sha512: Option<String>) -> Option<Checksum> {
    sha256
        .map(|hex| Checksum::new(ChecksumAlgorithm::Sha256, hex))
        .or_else(|| sha512.map(|hex| Checksum::new(ChecksumAlgorithm::Sha512, hex)))
}

fn bar_style(color: &str) -> Result<ProgressStyle> {
    Ok(ProgressStyle::with_template(&format!(
        "{{prefix:12}} [{{elapsed_precise}}] [{{bar:40.{color}/black}}] {{bytes}}/{{total_bytes}} ({{bytes_per_sec}}, {{eta}})"
    ))?
    .progress_chars("■ "))
}

/// Human-readable label for a pipeline stage.
fn stage_label(state: OperationState) -> &'static str {
    match state {
        OperationState::Validating => "Checking the image and device",
        OperationState::Unmounting => "Unmounting partitions",
        OperationState::Wiping => "Wiping old signatures",
        OperationState::Partitioning => "Creating the partition table",
        OperationState::Formatting => "Formatting",
        OperationState::Writing => "Writing",
        OperationState::Cancelling => "Cancelling",
        _ => "",
    }
}

/// Renders controller events until the operation finishes.
struct EventView {
    _bars: MultiProgress,
    stage: ProgressBar,
    decompress: ProgressBar,
    write: ProgressBar,
}

impl EventView {
    fn new(compressed: bool) -> Result<Self> {
        let bars = MultiProgress::new();

        let stage = bars.add(ProgressBar::new_spinner());
        stage.set_style(ProgressStyle::with_template("{spinner:.blue} {msg}")?);
        stage.enable_steady_tick(Duration::from_millis(100));

        let decompress = if compressed {
            let pb = bars.add(ProgressBar::new_spinner());
            pb.set_prefix("Decompress");
            pb.set_style(ProgressStyle::with_template(
                "{prefix:12} [{elapsed_precise}] {bytes} ({bytes_per_sec}) {msg}",
            )?);
            pb
        } else {
            ProgressBar::hidden()
        };

        let write = bars.add(ProgressBar::new(0));
        write.set_prefix("Writing");
        write.set_style(bar_style("green")?);

        Ok(Self {
            _bars: bars,
            stage,
            decompress,
            write,
        })
    }

    fn handle(&self, event: OperationEvent) {
        match event {
            OperationEvent::StateChanged(state) => {
                if state == OperationState::Unmounting {
                    self.decompress.finish_with_message("done");
                }
                let label = stage_label(state);
                if !label.is_empty() {
                    self.stage.set_message(label);
                }
            }
            OperationEvent::Decompressing { bytes } => self.decompress.set_position(bytes),
            OperationEvent::Progress {
                percent, total, ..
            } => {
                // The tool may only report percentages; position follows them.
                self.write.set_length(total);
                self.write
                    .set_position((total as f64 * percent / 100.0).round() as u64);
            }
            OperationEvent::Message(text) => self.stage.set_message(text),
            OperationEvent::Finished(outcome) => log::debug!("Finished: {outcome}"),
        }
    }

    fn finish(&self, outcome: &OperationOutcome) {
        self.stage.finish_and_clear();
        match outcome {
            OperationOutcome::Succeeded => self.write.finish_with_message("Write complete."),
            _ => {
                self.decompress.abandon();
                self.write.abandon();
            }
        }
    }
}

fn run_write(
    controller: &OperationController,
    image: PathBuf,
    device: Option<PathBuf>,
    yes: bool,
    checksum: Option<Checksum>,
    no_kill: bool,
) -> Result<()> {
    let target = match device {
        Some(path) => path,
        None => {
            let devices = bootforge_core::platform::list_removable_devices(
                controller.runner(),
                controller.settings(),
            );
            select_device(&devices, "Select the target device to WRITE to")?.path
        }
    };

    println!(
        "{} This will erase all data on '{}'.",
        style("WARNING:").red().bold(),
        target.display(),
    );
    println!("  Device: {}", style(target.display()).cyan());
    println!("  Image:  {}", style(image.display()).cyan());
    if let Some(sum) = &checksum {
        println!("  {}: {}", sum.algorithm, style(&sum.hex).dim());
    }
    println!();

    if !yes && !confirm_operation("Are you sure you want to proceed?")? {
        println!("Write operation cancelled.");
        return Ok(());
    }

    ensure_credential(controller)?;
    println!();

    let mut request = WriteRequest::new(&image, &target).terminate_conflicts(!no_kill);
    if let Some(sum) = checksum {
        request = request.with_checksum(sum);
    }

    let view = EventView::new(image::is_compressed(&image))?;
    let (tx, rx) = mpsc::channel();
    let worker = controller.start(request, tx)?;

    for event in rx {
        view.handle(event);
    }
    let outcome = worker
        .join()
        .map_err(|_| anyhow!("The write worker panicked"))?;
    view.finish(&outcome);

    match outcome {
        OperationOutcome::Succeeded => {
            println!(
                "\n✨ Successfully flashed {} with {}.",
                style(target.display()).cyan(),
                style(image.display()).cyan()
            );
            Ok(())
        }
        OperationOutcome::Cancelled => {
            println!("\n{}", style("Write operation cancelled.").yellow());
            println!("The device may be left partially written.");
            Ok(())
        }
        failed @ OperationOutcome::Failed { .. } => Err(anyhow!("{failed}")),
    }
}

fn run_list(controller: &OperationController) -> Result<()> {
    let missing = bootforge_core::platform::missing_tools(controller.settings());
    if !missing.is_empty() {
        println!(
            "{} Missing required tools: {}",
            style("WARNING:").yellow().bold(),
            missing.join(", ")
        );
        println!();
    }

    let devices =
        bootforge_core::platform::list_removable_devices(controller.runner(), controller.settings());
    if devices.is_empty() {
        println!("No removable devices found.");
        return Ok(());
    }

    println!("Found {} removable devices:", devices.len());
    println!(
        "\n  {:<12} {:<25} {:<10} {}",
        "DEVICE", "MODEL", "SIZE", "LOCATION"
    );
    println!("  {:-<12} {:-<25} {:-<10} {:-<20}", "", "", "", "");
    for device in devices {
        let location = match device.mounts.as_slice() {
            [] => "(Not mounted)".to_string(),
            mounts => mounts
                .iter()
                .map(|(_, mp)| mp.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        };
        let model = if device.model.is_empty() {
            device.name.as_str()
        } else {
            device.model.as_str()
        };
        println!(
            "  {:<12} {:<25} {:>7.1} GB  {}{}",
            device.path.display(),
            model,
            device.size_gb(),
            location,
            if device.removable { "" } else { "  [fixed]" }
        );
    }
    Ok(())
}

fn run_scan(controller: &OperationController, device: Option<&Path>, kill: bool) -> Result<()> {
    let detector = ConflictDetector::new(controller.runner(), controller.settings());
    let (found, writers) = detector.scan_for_writers(device);
    if !found {
        println!("No conflicting writers found.");
        return Ok(());
    }

    println!("Found {} conflicting writer(s):", writers.len());
    for proc in &writers {
        println!(
            "  PID {:<8} {} {}",
            proc.pid,
            style(proc.target.as_deref().unwrap_or("?")).cyan(),
            style(&proc.command).dim()
        );
    }

    if !kill {
        return Ok(());
    }
    ensure_credential(controller)?;
    if detector.terminate(device, &writers) {
        println!("All conflicting writers were stopped.");
        Ok(())
    } else {
        bail!("Some writers are still running")
    }
}

fn run_catalog(action: CatalogAction) -> Result<()> {
    let registry = VersionRegistry::default();
    match action {
        CatalogAction::List { file } => {
            let mut catalog = Catalog::load(file.as_deref())?;
            catalog.populate_versions(&registry);
            for name in catalog.names() {
                let Some(distro) = catalog.get(name) else {
                    continue;
                };
                println!(
                    "{} {}",
                    style(name).bold(),
                    style(format!("({}, {})", distro.family, distro.checksum_algorithm)).dim()
                );
                for (variant_name, variant) in &distro.variants {
                    let arches = variant.architectures.names().join(", ");
                    println!("  {variant_name:<16} {arches}");
                    if let Architectures::Map(map) = &variant.architectures {
                        if let Some(arch) = map.values().next() {
                            println!("  {:<16} versions: {}", "", arch.versions.join(", "));
                        }
                    }
                }
            }
        }
        CatalogAction::Save { output } => {
            let path = match output.or_else(catalog::default_path) {
                Some(path) => path,
                None => bail!("No configuration directory; pass an output path"),
            };
            let mut catalog = Catalog::load(None)?;
            catalog.populate_versions(&registry);
            catalog.save(&path)?;
            println!(
                "Saved {} distributions to {}",
                catalog.len(),
                style(path.display()).cyan()
            );
        }
    }
    Ok(())
}

/// Loads settings and builds the controller. Ctrl+C cancels a running
/// write; with nothing running it just exits.
fn controller(config: Option<&Path>) -> Result<OperationController> {
    let settings = Settings::load(config).context("Could not load settings")?;
    let executor = Arc::new(Executor::new(&settings));
    let controller = OperationController::new(executor, settings);

    let handler_controller = controller.clone();
    ctrlc::set_handler(move || {
        if handler_controller.cancel() {
            eprintln!("\n{}", style("Cancelling, please wait...").yellow());
        } else {
            let _ = stdout().flush();
            std::process::exit(130);
        }
    })?;
    Ok(controller)
}

fn main() -> Result<()> {
    // This guard will be dropped when main() exits, restoring the terminal.
    let _term_restorer = TermRestorer::new();

    let cli = Cli::parse();
    init_logger(cli.verbose);

    match cli.command {
        Commands::Write {
            image,
            device,
            yes,
            sha256,
            sha512,
            no_kill,
        } => run_write(
            &controller(cli.config.as_deref())?,
            image,
            device,
            yes,
            parse_checksum(sha256, sha512),
            no_kill,
        ),
        Commands::List => run_list(&controller(cli.config.as_deref())?),
        Commands::Scan { device, kill } => {
            run_scan(&controller(cli.config.as_deref())?, device.as_deref(), kill)
        }
        Commands::Catalog { action } => run_catalog(action),
    }
}
