//! Data acquisition coordinator.
//!
//! [IoLoop] owns the data connection, the raw log and the NTRIP relay.
//! It runs on its own thread and never blocks: every read is either non
//! blocking or bounded. The control side drives it through an [IoHandle]
//! and observes it through [IoStatus], each side being the only writer of
//! its half: [Signal]s one way, status and results the other way.
pub mod gga;
pub mod log;
pub mod ntrip;

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use ::log::{debug, error, info, trace, warn};
use hifitime::prelude::Epoch;
use thiserror::Error;
use tokio::sync::{
    mpsc::{self, error::TryRecvError},
    watch,
};

use crate::{
    connection::{Connection, ConnectionSettings, Link},
    error::Error,
    message::{Message, MsgType},
    stream::StreamDecoder,
};

use self::{
    gga::build_gga,
    log::LogFile,
    ntrip::{CONNECT_RETRIES, CorrectionSource, NTRIP_RETRY, NtripConfig, NtripError, Relay, RelayError},
};

/// Pause between two iterations.
pub const LOOP_SLEEP: Duration = Duration::from_millis(1);

/// Control request. Pending signals are serviced one per iteration,
/// stops first, so a started operation can always be torn down.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    ConnectionStop,
    LogStop,
    NtripStop,
    Exit,
    ConnectionStart {
        ticket: u64,
        settings: ConnectionSettings,
    },
    LogStart {
        ticket: u64,
        name: String,
        gzip: bool,
    },
    NtripStart {
        ticket: u64,
        config: NtripConfig,
    },
}

enum Request {
    Signal(Signal),
    SerialNumber(String),
}

/// Signals waiting for the loop. A newer start replaces a pending one.
#[derive(Debug, Default)]
struct Pending {
    connection_stop: bool,
    log_stop: bool,
    ntrip_stop: bool,
    exit: bool,
    connection_start: Option<(u64, ConnectionSettings)>,
    log_start: Option<(u64, String, bool)>,
    ntrip_start: Option<(u64, NtripConfig)>,
}

impl Pending {
    fn push(&mut self, signal: Signal) {
        match signal {
            Signal::ConnectionStop => self.connection_stop = true,
            Signal::LogStop => self.log_stop = true,
            Signal::NtripStop => self.ntrip_stop = true,
            Signal::Exit => self.exit = true,
            Signal::ConnectionStart { ticket, settings } => {
                self.connection_start = Some((ticket, settings))
            },
            Signal::LogStart { ticket, name, gzip } => self.log_start = Some((ticket, name, gzip)),
            Signal::NtripStart { ticket, config } => self.ntrip_start = Some((ticket, config)),
        }
    }

    fn next(&mut self) -> Option<Signal> {
        if std::mem::take(&mut self.connection_stop) {
            return Some(Signal::ConnectionStop);
        }
        if std::mem::take(&mut self.log_stop) {
            return Some(Signal::LogStop);
        }
        if std::mem::take(&mut self.ntrip_stop) {
            return Some(Signal::NtripStop);
        }
        if std::mem::take(&mut self.exit) {
            return Some(Signal::Exit);
        }
        if let Some((ticket, settings)) = self.connection_start.take() {
            return Some(Signal::ConnectionStart { ticket, settings });
        }
        if let Some((ticket, name, gzip)) = self.log_start.take() {
            return Some(Signal::LogStart { ticket, name, gzip });
        }
        self.ntrip_start
            .take()
            .map(|(ticket, config)| Signal::NtripStart { ticket, config })
    }
}

/// Why a start request failed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Failure {
    #[error("cannot open connection: {0}")]
    Connection(String),

    #[error("cannot open log: {0}")]
    Log(String),

    #[error(transparent)]
    Ntrip(NtripError),
}

impl From<Failure> for Error {
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::Ntrip(e) => Self::Ntrip(e),
            other => Self::IoLoop(other.to_string()),
        }
    }
}

/// Result of the start request identified by `ticket`.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub ticket: u64,
    pub result: Result<(), Failure>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum NtripState {
    #[default]
    Off,
    Connected,
    /// Caster dropped us, reconnecting periodically
    Retrying,
}

/// Everything the loop publishes.
#[derive(Debug, Clone, Default)]
pub struct IoStatus {
    pub connected: bool,
    /// Description of the data connection
    pub connection: Option<String>,
    pub connection_done: Option<Completion>,
    pub logging: bool,
    pub log_path: Option<PathBuf>,
    /// Raw bytes logged so far
    pub log_size: u64,
    pub log_done: Option<Completion>,
    pub ntrip: NtripState,
    pub ntrip_done: Option<Completion>,
    pub ntrip_forwarded: u64,
    pub ntrip_dropped: u64,
    pub serial_number: Option<String>,
    pub last_ins: Option<Message>,
    pub last_gps: Option<Message>,
    pub last_gp2: Option<Message>,
    /// Last IMU or IM1
    pub last_imu: Option<Message>,
    pub last_hdg: Option<Message>,
    pub last_imu_time: Option<Instant>,
    pub gps_received: bool,
    /// Frames that failed to decode
    pub invalid_count: u64,
}

/// Opens what the loop needs. Swapped for fakes in tests.
pub trait Dialer: Send {
    fn open(&mut self, settings: &ConnectionSettings) -> Result<Box<dyn Link>, Error>;

    fn dial(
        &mut self,
        config: &NtripConfig,
        attempts: usize,
    ) -> Result<Box<dyn CorrectionSource>, NtripError>;
}

/// Real serial ports, sockets and files.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDialer;

impl Dialer for SystemDialer {
    fn open(&mut self, settings: &ConnectionSettings) -> Result<Box<dyn Link>, Error> {
        Ok(Box::new(Connection::open(settings)?))
    }

    fn dial(
        &mut self,
        config: &NtripConfig,
        attempts: usize,
    ) -> Result<Box<dyn CorrectionSource>, NtripError> {
        Ok(Box::new(ntrip::connect(config, attempts)?))
    }
}

struct Caster {
    config: NtripConfig,
    /// None while retrying
    source: Option<Box<dyn CorrectionSource>>,
    relay: Relay,
    last_attempt: Instant,
}

pub struct IoLoop {
    requests: mpsc::UnboundedReceiver<Request>,
    status: watch::Sender<IoStatus>,
    dialer: Box<dyn Dialer>,
    log_root: PathBuf,
    pending: Pending,
    data: Option<Box<dyn Link>>,
    decoder: StreamDecoder,
    log: Option<LogFile>,
    caster: Option<Caster>,
}

impl IoLoop {
    /// New [IoLoop] logging under `log_root`, and its control [IoHandle].
    pub fn new(log_root: &Path) -> (Self, IoHandle) {
        Self::with_dialer(log_root, Box::new(SystemDialer))
    }

    pub fn with_dialer(log_root: &Path, dialer: Box<dyn Dialer>) -> (Self, IoHandle) {
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let (status, status_rx) = watch::channel(IoStatus::default());

        let ioloop = Self {
            requests,
            status,
            dialer,
            log_root: log_root.to_path_buf(),
            pending: Pending::default(),
            data: None,
            decoder: StreamDecoder::default(),
            log: None,
            caster: None,
        };

        let handle = IoHandle {
            requests: requests_tx,
            status: status_rx,
            tickets: Arc::new(AtomicU64::new(0)),
        };

        (ioloop, handle)
    }

    /// Runs on a dedicated thread until [IoHandle::exit].
    pub fn spawn(self) -> Result<JoinHandle<()>, Error> {
        let handle = std::thread::Builder::new()
            .name("ioloop".to_string())
            .spawn(move || self.run())?;
        Ok(handle)
    }

    pub fn run(mut self) {
        debug!(target: "ioloop", "started");
        while self.step(Instant::now()) {
            std::thread::sleep(LOOP_SLEEP);
        }
        self.shutdown();
        debug!(target: "ioloop", "exited");
    }

    /// One iteration. Returns false once asked to exit.
    pub fn step(&mut self, now: Instant) -> bool {
        self.drain_requests();

        if let Some(signal) = self.pending.next() {
            if !self.service(signal, now) {
                return false;
            }
        }

        self.retry_ntrip(now);
        self.relay_corrections(now);
        self.read_data(now);
        true
    }

    fn drain_requests(&mut self) {
        loop {
            match self.requests.try_recv() {
                Ok(Request::Signal(signal)) => self.pending.push(signal),
                Ok(Request::SerialNumber(serial)) => {
                    self.status.send_modify(|s| s.serial_number = Some(serial));
                },
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    // every handle is gone
                    self.pending.exit = true;
                    break;
                },
            }
        }
    }

    fn service(&mut self, signal: Signal, now: Instant) -> bool {
        trace!(target: "ioloop", "servicing {:?}", signal);
        match signal {
            Signal::ConnectionStop => self.close_connection(),
            Signal::LogStop => self.close_log(),
            Signal::NtripStop => self.stop_ntrip(),
            Signal::Exit => return false,
            Signal::ConnectionStart { ticket, settings } => {
                let result = self.open_connection(&settings);
                self.status
                    .send_modify(|s| s.connection_done = Some(Completion { ticket, result }));
            },
            Signal::LogStart { ticket, name, gzip } => {
                let result = self.open_log(&name, gzip);
                self.status
                    .send_modify(|s| s.log_done = Some(Completion { ticket, result }));
            },
            Signal::NtripStart { ticket, config } => {
                let result = self.start_ntrip(config, now);
                self.status
                    .send_modify(|s| s.ntrip_done = Some(Completion { ticket, result }));
            },
        }
        true
    }

    fn open_connection(&mut self, settings: &ConnectionSettings) -> Result<(), Failure> {
        self.close_connection();

        let link = self.dialer.open(settings).map_err(|e| {
            error!(target: "ioloop", "failed to open {}: {}", settings, e);
            Failure::Connection(e.to_string())
        })?;

        info!(target: "ioloop", "data connection {}", settings);
        self.data = Some(link);
        self.decoder.reset();

        let description = settings.to_string();
        self.status.send_modify(|s| {
            s.connected = true;
            s.connection = Some(description);
        });
        Ok(())
    }

    fn close_connection(&mut self) {
        if let Some(mut link) = self.data.take() {
            link.close();
            info!(target: "ioloop", "data connection closed");
        }
        self.status.send_modify(|s| {
            s.connected = false;
            s.connection = None;
        });
    }

    fn open_log(&mut self, name: &str, gzip: bool) -> Result<(), Failure> {
        self.close_log();

        let t = Epoch::now().map_err(|e| Failure::Log(e.to_string()))?;
        let log = LogFile::create(&self.log_root, name, gzip, t).map_err(|e| {
            error!(target: "ioloop", "failed to create log {}: {}", name, e);
            Failure::Log(e.to_string())
        })?;

        info!(target: "ioloop", "logging to {}", log.path().display());
        let path = log.path().to_path_buf();
        self.log = Some(log);

        self.status.send_modify(|s| {
            s.logging = true;
            s.log_path = Some(path);
            s.log_size = 0;
        });
        Ok(())
    }

    fn close_log(&mut self) {
        if let Some(log) = self.log.take() {
            let path = log.path().display().to_string();
            match log.close() {
                Ok(()) => info!(target: "ioloop", "{} closed", path),
                Err(e) => error!(target: "ioloop", "failed to close {}: {}", path, e),
            }
        }
        self.status.send_modify(|s| s.logging = false);
    }

    fn start_ntrip(&mut self, config: NtripConfig, now: Instant) -> Result<(), Failure> {
        self.stop_ntrip();

        let source = self
            .dialer
            .dial(&config, CONNECT_RETRIES)
            .map_err(|e| {
                error!(target: "ioloop", "NTRIP start failed: {}", e);
                Failure::Ntrip(e)
            })?;

        info!(target: "ioloop", "NTRIP relay from {}:{}/{}", config.caster, config.port, config.mountpoint);
        self.caster = Some(Caster {
            config,
            source: Some(source),
            relay: Relay::new(now),
            last_attempt: now,
        });

        self.status.send_modify(|s| s.ntrip = NtripState::Connected);
        Ok(())
    }

    fn stop_ntrip(&mut self) {
        if self.caster.take().is_some() {
            info!(target: "ioloop", "NTRIP relay stopped");
        }
        self.status.send_modify(|s| s.ntrip = NtripState::Off);
    }

    fn retry_ntrip(&mut self, now: Instant) {
        let Some(caster) = self.caster.as_mut() else {
            return;
        };
        if caster.source.is_some() || now.duration_since(caster.last_attempt) < NTRIP_RETRY {
            return;
        }

        caster.last_attempt = now;
        match self.dialer.dial(&caster.config, 1) {
            Ok(source) => {
                info!(target: "ioloop", "NTRIP reconnected");
                caster.source = Some(source);
                caster.relay = Relay::new(now);
                self.status.send_modify(|s| s.ntrip = NtripState::Connected);
            },
            Err(e) => {
                debug!(target: "ioloop", "NTRIP reconnection failed: {}", e);
            },
        }
    }

    fn relay_corrections(&mut self, now: Instant) {
        let (Some(caster), Some(data)) = (self.caster.as_mut(), self.data.as_mut()) else {
            return;
        };
        let Some(source) = caster.source.as_mut() else {
            return;
        };

        let sink_error = match caster.relay.poll(now, source.as_mut(), data.as_mut()) {
            Ok(step) => {
                if step.forwarded > 0 || step.dropped > 0 {
                    self.status.send_modify(|s| {
                        s.ntrip_forwarded += step.forwarded as u64;
                        s.ntrip_dropped += step.dropped as u64;
                    });
                }
                None
            },
            Err(RelayError::Disconnected) => {
                warn!(target: "ioloop", "NTRIP caster disconnected, retrying every {:?}", NTRIP_RETRY);
                caster.source = None;
                caster.last_attempt = now;
                self.status.send_modify(|s| s.ntrip = NtripState::Retrying);
                None
            },
            Err(RelayError::Source(e)) => {
                debug!(target: "ioloop", "NTRIP read error: {}", e);
                None
            },
            Err(RelayError::Sink(e)) => Some(e),
        };

        if let Some(e) = sink_error {
            error!(target: "ioloop", "data connection error: {}", e);
            self.close_connection();
        }
    }

    fn read_data(&mut self, now: Instant) {
        let Some(link) = self.data.as_mut() else {
            return;
        };

        let read = match link.data_ready() {
            Ok(false) => return,
            Ok(true) => link.read_all_available(),
            Err(e) => Err(e),
        };

        let bytes = match read {
            Ok(bytes) if bytes.is_empty() => return,
            Ok(bytes) => bytes,
            Err(e) => {
                error!(target: "ioloop", "data connection error: {}", e);
                self.close_connection();
                return;
            },
        };

        let messages = self.decoder.feed(&bytes);
        let invalid_count = self.decoder.rejected();

        let send_gga = self
            .caster
            .as_ref()
            .is_some_and(|caster| caster.config.gga && caster.source.is_some());

        let mut gga = None;
        self.status.send_modify(|s| {
            s.invalid_count = invalid_count;
            for msg in messages {
                match msg.msgtype {
                    MsgType::INS => s.last_ins = Some(msg),
                    MsgType::IMU | MsgType::IM1 => {
                        s.last_imu = Some(msg);
                        s.last_imu_time = Some(now);
                    },
                    MsgType::HDG => s.last_hdg = Some(msg),
                    MsgType::GPS => {
                        if send_gga {
                            gga = build_gga(&msg);
                        }
                        s.gps_received = true;
                        s.last_gps = Some(msg);
                    },
                    MsgType::GP2 => s.last_gp2 = Some(msg),
                    other => trace!(target: "ioloop", "ignoring {} message", other),
                }
            }
        });

        if let Some(sentence) = gga {
            if let Some(source) = self.caster.as_mut().and_then(|c| c.source.as_mut()) {
                if let Err(e) = source.send_all(&sentence) {
                    debug!(target: "ioloop", "failed to send GGA: {}", e);
                }
            }
        }

        let logged = self
            .log
            .as_mut()
            .map(|log| log.write(&bytes).map(|_| log.size()));

        match logged {
            Some(Ok(size)) => self.status.send_modify(|s| s.log_size = size),
            Some(Err(e)) => {
                error!(target: "ioloop", "log write error: {}", e);
                self.close_log();
            },
            None => {},
        }
    }

    fn shutdown(&mut self) {
        self.close_log();
        self.stop_ntrip();
        self.close_connection();
    }
}

/// Control surface of a running [IoLoop]. Cheap to clone.
///
/// Issuing a signal never blocks. Start requests then wait for the loop
/// to report the outcome.
#[derive(Clone)]
pub struct IoHandle {
    requests: mpsc::UnboundedSender<Request>,
    status: watch::Receiver<IoStatus>,
    tickets: Arc<AtomicU64>,
}

impl IoHandle {
    fn send(&self, signal: Signal) -> Result<(), Error> {
        self.requests
            .send(Request::Signal(signal))
            .map_err(|_| Error::Closed)
    }

    fn ticket(&self) -> u64 {
        self.tickets.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Waits for `ticket`, or a later request of the same kind that superseded it.
    async fn completion(
        &self,
        ticket: u64,
        done: impl Fn(&IoStatus) -> Option<&Completion>,
    ) -> Result<(), Error> {
        let mut rx = self.status.clone();
        let status = rx
            .wait_for(|s| done(s).is_some_and(|c| c.ticket >= ticket))
            .await
            .map_err(|_| Error::Closed)?;

        match done(&*status) {
            Some(Completion {
                result: Err(failure),
                ..
            }) => Err(failure.clone().into()),
            _ => Ok(()),
        }
    }

    /// Opens the data connection.
    pub async fn connect(&self, settings: ConnectionSettings) -> Result<(), Error> {
        let ticket = self.ticket();
        self.send(Signal::ConnectionStart { ticket, settings })?;
        self.completion(ticket, |s| s.connection_done.as_ref()).await
    }

    pub fn disconnect(&self) -> Result<(), Error> {
        self.send(Signal::ConnectionStop)
    }

    /// Starts logging raw data to `name`, returns the file path.
    pub async fn start_log(&self, name: &str, gzip: bool) -> Result<PathBuf, Error> {
        let ticket = self.ticket();
        self.send(Signal::LogStart {
            ticket,
            name: name.to_string(),
            gzip,
        })?;
        self.completion(ticket, |s| s.log_done.as_ref()).await?;
        self.status
            .borrow()
            .log_path
            .clone()
            .ok_or_else(|| Error::IoLoop("log path unknown".to_string()))
    }

    pub fn stop_log(&self) -> Result<(), Error> {
        self.send(Signal::LogStop)
    }

    pub async fn start_ntrip(&self, config: NtripConfig) -> Result<(), Error> {
        let ticket = self.ticket();
        self.send(Signal::NtripStart { ticket, config })?;
        self.completion(ticket, |s| s.ntrip_done.as_ref()).await
    }

    pub fn stop_ntrip(&self) -> Result<(), Error> {
        self.send(Signal::NtripStop)
    }

    pub fn set_serial_number(&self, serial: &str) -> Result<(), Error> {
        self.requests
            .send(Request::SerialNumber(serial.to_string()))
            .map_err(|_| Error::Closed)
    }

    /// Snapshot of the current status.
    pub fn status(&self) -> IoStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<IoStatus> {
        self.status.clone()
    }

    pub fn exit(&self) -> Result<(), Error> {
        self.send(Signal::Exit)
    }
}
