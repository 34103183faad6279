/*
 * boardlink: inertial/GNSS unit link.
 * This tool is shipped under Mozilla Public V2 license.
 *
 * Discovers the unit, streams its output, logs it and relays
 * NTRIP corrections back to it.
 */

use std::time::Duration;

use env_logger::{Builder, Target};

use log::{debug, error, info, warn};

use tokio::{signal, task};

use boardlink::{
    board::UDP_LOCAL_DATA_PORT,
    prelude::{
        Board, BoardSettings, ConnectionSettings, Error, IoHandle, IoLoop, IoStatus, Message,
        NtripConfig, SystemPorts,
    },
};

mod cli;

use crate::cli::{Cli, Source, StdinPicker};

/// Status report period.
const REPORT_PERIOD: Duration = Duration::from_secs(5);

/// Device session, with the data connection handed over to the I/O loop.
struct Session {
    /// Control side, when there is a device
    board: Option<Board>,
    data: ConnectionSettings,
    serial: Option<String>,
}

fn open_session(cli: &Cli) -> Result<Session, Error> {
    let settings = BoardSettings::default();

    let (mut board, data) = match cli.source() {
        Source::File(path) => {
            return Ok(Session {
                board: None,
                data: ConnectionSettings::FileReader(path),
                serial: None,
            });
        },
        Source::Udp {
            ip,
            data,
            control,
            odometer,
        } => {
            let board = Board::from_udp(ip, Some(data), control, odometer, settings)?;
            let data = ConnectionSettings::Udp {
                remote_ip: ip,
                remote_port: data,
                local_port: UDP_LOCAL_DATA_PORT,
            };
            (board, data)
        },
        Source::Serial {
            control,
            data,
            baud,
        } => {
            let board = Board::connect(&SystemPorts, Some(&control), None, baud, settings)?;
            let data = ConnectionSettings::Serial {
                port: data.unwrap_or(control),
                baud: board.baud,
                timeout: board.settings.timeout,
            };
            (board, data)
        },
        Source::Auto => {
            let use_data_port = cli.use_data_port();
            let board = Board::auto(
                &SystemPorts,
                &mut StdinPicker,
                &cli.cache_dir(),
                use_data_port,
                settings,
            )?;

            let port = if use_data_port {
                board.data_port.clone()
            } else {
                board.control_port.clone()
            }
            .ok_or(Error::Discovery)?;

            let data = ConnectionSettings::Serial {
                port,
                baud: board.baud,
                timeout: board.settings.timeout,
            };
            (board, data)
        },
    };

    let serial = identify(&mut board);

    let shared = matches!(
        &data,
        ConnectionSettings::Serial { port, .. } if board.control_port.as_deref() == Some(port.as_str())
    );

    if shared {
        // single port: the loop takes it over
        board.release_connections();
    } else {
        board.release_data_port();
    }

    Ok(Session {
        board: Some(board),
        data,
        serial,
    })
}

/// Identifies the unit, when its control side is still open.
fn identify(board: &mut Board) -> Option<String> {
    match board.get_version() {
        Ok(version) => info!("firmware {}", version),
        Err(e) => {
            debug!("no version: {}", e);
            return None;
        },
    }
    if let Ok(pid) = board.get_pid() {
        info!("product {}", pid);
    }
    match board.get_serial() {
        Ok(serial) => {
            info!("serial number {}", serial);
            Some(serial)
        },
        Err(e) => {
            warn!("failed to read serial number: {}", e);
            None
        },
    }
}

fn ntrip_config(cli: &Cli) -> Result<Option<NtripConfig>, Error> {
    let cache_dir = cli.cache_dir();
    if let Some(config) = cli.ntrip_config() {
        if cli.save_ntrip() {
            config.save(&cache_dir)?;
            info!("caster saved in {}", NtripConfig::path(&cache_dir).display());
        }
        return Ok(Some(config));
    }
    if cli.saved_ntrip() {
        let config = NtripConfig::load(&cache_dir)?;
        if config.is_none() {
            warn!("no caster saved in {}", cache_dir.display());
        }
        return Ok(config);
    }
    Ok(None)
}

fn summary(msg: &Option<Message>) -> String {
    match msg {
        Some(msg) => format!("{} ({} bytes)", msg.msgtype, msg.raw.len()),
        None => "none".to_string(),
    }
}

fn report(status: &IoStatus) {
    info!(
        "connected: {} | INS: {} | GPS: {} | IMU: {} | HDG: {} | invalid: {}",
        status.connected,
        summary(&status.last_ins),
        summary(&status.last_gps),
        summary(&status.last_imu),
        summary(&status.last_hdg),
        status.invalid_count,
    );
    if status.logging {
        debug!("log size: {} bytes", status.log_size);
    }
    if status.ntrip_forwarded > 0 || status.ntrip_dropped > 0 {
        info!(
            "NTRIP ({:?}): {} bytes forwarded, {} dropped",
            status.ntrip, status.ntrip_forwarded, status.ntrip_dropped
        );
    }
}

async fn stream(cli: &Cli, handle: &IoHandle, data: ConnectionSettings) -> Result<(), Error> {
    handle.connect(data).await?;

    if let Some((name, gzip)) = cli.log() {
        let path = handle.start_log(name, gzip).await?;
        info!("logging to {}", path.display());
    }

    if let Some(config) = ntrip_config(cli)? {
        match handle.start_ntrip(config).await {
            Ok(()) => info!("NTRIP relay started"),
            Err(e) => error!("NTRIP relay failed: {}", e),
        }
    }

    let mut ticker = tokio::time::interval(REPORT_PERIOD);

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("interrupted");
                return Ok(());
            },
            _ = ticker.tick() => {
                let status = handle.status();
                report(&status);
                if !status.connected {
                    warn!("data connection lost");
                    return Ok(());
                }
            },
        }
    }
}

#[tokio::main]
pub async fn main() -> Result<(), Error> {
    let mut builder = Builder::from_default_env();

    builder
        .target(Target::Stdout)
        .format_timestamp_secs()
        .format_module_path(false)
        .init();

    // cli
    let cli = Cli::new();

    let session = task::block_in_place(|| open_session(&cli))?;

    let (ioloop, handle) = IoLoop::new(&cli.log_root());
    let thread = ioloop.spawn()?;

    if let Some(serial) = &session.serial {
        handle.set_serial_number(serial)?;
    }

    info!("streaming from {}", session.data);
    let result = stream(&cli, &handle, session.data.clone()).await;

    if let Err(e) = handle.stop_log() {
        debug!("log stop: {}", e);
    }
    if let Err(e) = handle.stop_ntrip() {
        debug!("NTRIP stop: {}", e);
    }
    if let Err(e) = handle.exit() {
        debug!("I/O loop exit: {}", e);
    }

    if thread.join().is_err() {
        error!("I/O loop panicked");
    }

    drop(session.board);
    result
}
