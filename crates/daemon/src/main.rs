//! usbpipe Daemon
//!
//! Runs on the USB peripheral. Provisions the gadget, serves the control
//! channel and starts one worker per opened pipe.

use anyhow::{Context, Result};
use clap::Parser;
use common::{ShutdownToken, install_signal_handler, setup_logging};
use daemon::config::{self, DaemonConfig};
use daemon::ep0::Ep0;
use daemon::gadget::{FunctionFsMount, Gadget};
use daemon::{CommandLauncher, EventLoop, PipeMultiplexer, WorkerCommand};
use protocol::{FunctionDescriptors, PIPE_COUNT};
use std::ffi::OsString;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "usbpipe-daemon")]
#[command(
    author,
    version,
    about = "usbpipe Daemon - Tunnel worker processes over USB bulk pipes"
)]
#[command(long_about = "
Exposes a vendor-specific USB interface with bulk pipes. When the host
opens a pipe, CMD is started with its stdin and stdout attached to that
pipe's OUT and IN endpoint files.

EXAMPLES:
    # Serve iiod on every pipe through the musb controller
    usbpipe-daemon musb-hdrc.0 /dev/usbpipe iiod

    # FunctionFS already mounted and bound by another tool
    usbpipe-daemon --skip-gadget musb-hdrc.0 /dev/ffs-iio cat

CONFIGURATION:
    The daemon looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usbpipe/daemon.toml
    3. /etc/usbpipe/daemon.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Use an existing FunctionFS mount and skip configfs management
    #[arg(long)]
    skip_gadget: bool,

    /// USB device controller to bind the gadget to
    #[arg(value_name = "UDC", required_unless_present = "save_config")]
    udc: Option<String>,

    /// FunctionFS mount point
    #[arg(value_name = "MOUNT", required_unless_present = "save_config")]
    mount: Option<PathBuf>,

    /// Worker command and its arguments, run once per opened pipe
    #[arg(
        value_name = "CMD",
        trailing_var_arg = true,
        allow_hyphen_values = true,
        num_args = 1..,
        required_unless_present = "save_config"
    )]
    command: Vec<OsString>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = DaemonConfig::default();
        let path = DaemonConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        config::load_config(path).context("Failed to load configuration")?
    } else {
        DaemonConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.daemon.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usbpipe Daemon v{}", env!("CARGO_PKG_VERSION"));

    let token = ShutdownToken::new();
    install_signal_handler(token.clone()).context("Failed to install signal handler")?;

    let udc = args.udc.context("Missing UDC argument")?;
    let mount = args.mount.context("Missing MOUNT argument")?;
    let command = WorkerCommand::from_argv(args.command).context("Missing worker command")?;

    let result = serve(&config, args.skip_gadget, &udc, mount, command, token);
    if let Err(ref e) = result {
        error!("Daemon failed: {:#}", e);
    }
    result
}

/// Bring the gadget up, run the event loop, and tear down in reverse order
///
/// Guards are declared in acquisition order and Rust drops locals in
/// reverse, so the UDC is unbound before ep0 is closed, ep0 is closed before
/// the unmount, and the gadget tree goes last. The event loop only borrows
/// ep0 so that ordering holds.
fn serve(
    config: &DaemonConfig,
    skip_gadget: bool,
    udc: &str,
    mount_path: PathBuf,
    command: WorkerCommand,
    token: ShutdownToken,
) -> Result<()> {
    let gadget = if skip_gadget {
        info!("Skipping gadget provisioning");
        None
    } else {
        Some(Gadget::create(&config.gadget).context("Failed to create gadget")?)
    };

    let _mount = match &gadget {
        Some(gadget) => Some(
            FunctionFsMount::mount(gadget.function_instance(), &mount_path)
                .context("Failed to mount FunctionFS")?,
        ),
        None => None,
    };

    let mut ep0 = Ep0::open(&mount_path).context("Failed to open ep0")?;
    let descriptors = FunctionDescriptors::build().context("Failed to build descriptors")?;
    ep0.write_descriptors(&descriptors)
        .context("Failed to write descriptors")?;
    info!("Descriptors written for {} pipes", PIPE_COUNT);

    let _binding = match &gadget {
        Some(gadget) => Some(gadget.enable(udc).context("Failed to enable gadget")?),
        None => None,
    };

    let mut mux = PipeMultiplexer::new(CommandLauncher, command, &mount_path);
    let mut event_loop = EventLoop::new(&mut ep0, config.daemon.poll_interval(), token);
    let result = event_loop.run(&mut mux);

    info!("Shutting down");
    result.context("Event loop failed")
}
