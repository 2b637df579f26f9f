//! usbpipe Client
//!
//! Connects stdin and stdout of this process to a bulk pipe of a usbpipe
//! peripheral.

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use client::config::{self, ClientConfig};
use client::{
    BulkEndpoints, ConfigLayout, LibusbTransport, TransferEngine, discover, parse_usb_id,
    pipe_endpoints,
};
use common::{ShutdownToken, install_signal_handler, setup_logging};
use protocol::{ControlCommand, PipeIndex};
use rusb::{Context as LibusbContext, DeviceHandle, UsbContext};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "usbpipe-client")]
#[command(
    author,
    version,
    about = "usbpipe Client - Tunnel stdin/stdout over USB bulk endpoints"
)]
#[command(long_about = "
Streams standard input to the device's OUT endpoint and the device's IN
endpoint to standard output. Diagnostics go to standard error.

EXAMPLES:
    # First endpoint pair of the default gadget
    usbpipe-client 0456 b672

    # Open pipe 1 on the device and stop once stdin is drained
    echo 'print' | usbpipe-client --pipe 1 --exit-on-eof 0x0456 0xb672

CONFIGURATION:
    The client looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usbpipe/client.toml
    3. /etc/usbpipe/client.toml
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

    /// Open this pipe on the device and use its endpoints
    #[arg(long, value_name = "INDEX")]
    pipe: Option<u16>,

    /// Exit once stdin ends and all data has been sent
    #[arg(long)]
    exit_on_eof: bool,

    /// Vendor id (hex)
    #[arg(value_parser = parse_usb_id, required_unless_present = "save_config")]
    vid: Option<u16>,

    /// Product id (hex)
    #[arg(value_parser = parse_usb_id, required_unless_present = "save_config")]
    pid: Option<u16>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = ClientConfig::default();
        let path = ClientConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        eprintln!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        config::load_config(path).context("Failed to load configuration")?
    } else {
        ClientConfig::load_or_default()
    };
    config.transfer.exit_on_eof |= args.exit_on_eof;

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.client.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usbpipe Client v{}", env!("CARGO_PKG_VERSION"));

    let vid = args.vid.context("Missing VID argument")?;
    let pid = args.pid.context("Missing PID argument")?;
    let pipe = match args.pipe {
        Some(raw) => Some(
            PipeIndex::new(raw).ok_or_else(|| anyhow!("Pipe index {} out of range", raw))?,
        ),
        None => None,
    };

    let token = ShutdownToken::new();
    install_signal_handler(token.clone()).context("Failed to install signal handler")?;

    let result = run(&config, vid, pid, pipe, token);
    if let Err(ref e) = result {
        error!("Client failed: {:#}", e);
    }
    result
}

fn run(
    config: &ClientConfig,
    vid: u16,
    pid: u16,
    pipe: Option<PipeIndex>,
    token: ShutdownToken,
) -> Result<()> {
    let context = LibusbContext::new().context("Failed to initialize libusb")?;
    let mut handle = context
        .open_device_with_vid_pid(vid, pid)
        .ok_or_else(|| anyhow!("Unable to find device {:04x}:{:04x}", vid, pid))?;

    if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
        debug!("Kernel driver auto-detach unavailable: {}", e);
    }

    let descriptor = handle
        .device()
        .active_config_descriptor()
        .context("Unable to read descriptors")?;
    let layout = ConfigLayout::from(&descriptor);

    let endpoints = match pipe {
        Some(pipe) => pipe_endpoints(&layout, pipe)?,
        None => discover(&layout)?,
    };
    info!(
        "Using interface {} (in {:#04x}, out {:#04x})",
        endpoints.interface, endpoints.inbound, endpoints.outbound
    );

    handle
        .claim_interface(endpoints.interface)
        .context("Failed to claim interface")?;

    if let Some(pipe) = pipe {
        send_command(&handle, ControlCommand::Open(pipe.get() as u16))
            .with_context(|| format!("Failed to open {}", pipe))?;
    }

    let handle = Arc::new(handle);
    let result = stream(config, &context, &handle, endpoints, token);

    if let Some(pipe) = pipe {
        if let Err(e) = send_command(&handle, ControlCommand::Close(pipe.get() as u16)) {
            warn!("Failed to close {}: {}", pipe, e);
        }
    }

    match Arc::try_unwrap(handle) {
        Ok(mut handle) => {
            if let Err(e) = handle.release_interface(endpoints.interface) {
                debug!("Failed to release interface: {}", e);
            }
        }
        // Still shared with a feeder blocked on stdin; closing happens at exit
        Err(_) => debug!("Device handle still in use, skipping interface release"),
    }

    result
}

fn stream(
    config: &ClientConfig,
    context: &LibusbContext,
    handle: &Arc<DeviceHandle<LibusbContext>>,
    endpoints: BulkEndpoints,
    token: ShutdownToken,
) -> Result<()> {
    let transport = Arc::new(LibusbTransport::new(context.clone(), Arc::clone(handle)));
    let engine = TransferEngine::new(
        transport,
        config.transfer.engine_config(),
        endpoints.inbound,
        endpoints.outbound,
        token,
    );

    let stats = engine
        .run(std::io::stdin(), std::io::stdout().lock())
        .context("Transfer engine failed")?;

    info!(
        "Transferred {} bytes in, {} bytes out ({} submissions, {} cancelled, {} errors)",
        stats.bytes_in,
        stats.bytes_out,
        stats.outbound_submissions,
        stats.cancelled,
        stats.errors
    );
    Ok(())
}

fn send_command(handle: &DeviceHandle<LibusbContext>, command: ControlCommand) -> Result<()> {
    let request = command.to_request();
    debug!("Sending {:?}", command);
    handle.write_control(
        request.request_type,
        request.request,
        request.value,
        request.index,
        &[],
        CONTROL_TIMEOUT,
    )?;
    Ok(())
}
