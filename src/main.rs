use std::collections::HashSet;
use std::io::IsTerminal;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use human_panic::setup_panic;
use log::{error, info, warn};

use nus_logger::bluetooth::{list_adapters, BtleTransport, Scanner};
use nus_logger::cli::Cli;
use nus_logger::wizard::Wizard;
use nus_logger::{
    init_logger, LoggerController, LoggerSettings, NusError, ShutdownHandle, ShutdownSignal, StopReason,
};

/// Clean shutdown
const EXIT_OK: u8 = 0;
/// Unrecoverable startup or runtime failure
const EXIT_FAILURE: u8 = 1;
/// Bad arguments or settings
const EXIT_USAGE: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    setup_panic!();

    let no_args = std::env::args_os().len() <= 1;
    let mut cli = Cli::parse();
    if no_args {
        cli.wizard = true;
    }
    init_logger(cli.verbose);

    let mut settings = match LoggerSettings::load_or_default(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(EXIT_USAGE);
        }
    };
    cli.apply(&mut settings);

    if cli.needs_name() && settings.name.trim().is_empty() {
        error!("--name required unless --list, --list-adapters or --wizard is used (or set NUS_NAME)");
        return ExitCode::from(EXIT_USAGE);
    }
    if let Err(e) = settings.validate() {
        error!("{}", e);
        return ExitCode::from(EXIT_USAGE);
    }

    let (shutdown, signal) = ShutdownHandle::channel();
    let ctrlc_handle = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        if !ctrlc_handle.is_triggered() {
            warn!("Received Ctrl-C, shutting down...");
        }
        ctrlc_handle.trigger();
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    match run(cli, settings, signal).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{:#}", e);
            if let Some(hint) = e.downcast_ref::<NusError>().and_then(NusError::hint) {
                error!("Hint: {}", hint);
            }
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn run(cli: Cli, mut settings: LoggerSettings, signal: ShutdownSignal) -> anyhow::Result<u8> {
    if cli.list_adapters {
        let adapters = list_adapters().await.context("Failed to list adapters")?;
        if adapters.is_empty() {
            println!("No Bluetooth adapters found.");
        }
        for adapter in adapters {
            println!("{}", adapter);
        }
        return Ok(EXIT_OK);
    }

    let transport = Arc::new(
        BtleTransport::new(settings.adapter.as_deref())
            .await
            .context("Failed to open Bluetooth adapter")?,
    );

    if cli.list {
        let controller = LoggerController::new(transport, settings)?.with_shutdown(signal);
        let devices = match controller.scan("", None).await {
            Ok(devices) => devices,
            Err(NusError::Cancelled) => return Ok(EXIT_OK),
            Err(e) => return Err(anyhow::Error::new(e).context("Scan failed")),
        };
        if devices.is_empty() {
            println!("No devices discovered.");
            return Ok(EXIT_OK);
        }
        println!("Discovered devices (name | address | RSSI dBm):");
        let mut seen = HashSet::new();
        for device in devices {
            if seen.insert((device.name.clone(), device.address.clone())) {
                println!("{}", device);
            }
        }
        return Ok(EXIT_OK);
    }

    if cli.wizard {
        if !std::io::stdin().is_terminal() {
            error!("Wizard requested but stdin is not a TTY; aborting.");
            return Ok(EXIT_USAGE);
        }
        let scanner = Scanner::new(transport.clone()).with_shutdown(signal.clone());
        let stdin = std::io::stdin();
        let mut wizard = Wizard::new(stdin.lock(), std::io::stdout());
        match wizard.run(&scanner, &settings).await? {
            Some(chosen) => settings = chosen,
            None => return Ok(EXIT_OK),
        }
    }

    let controller = LoggerController::new(transport, settings)?.with_shutdown(signal);
    let summary = controller.run().await?;
    info!("Received {} line(s) over {} session(s)", summary.lines, summary.sessions);

    match summary.reason {
        StopReason::RetriesExhausted { attempts } if summary.sessions == 0 => {
            error!("No connection after {} attempts", attempts);
            Ok(EXIT_FAILURE)
        }
        _ => Ok(EXIT_OK),
    }
}
