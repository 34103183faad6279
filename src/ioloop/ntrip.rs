//! NTRIP caster client and the rate limited correction relay.
use std::{
    fs::File,
    io::{BufReader, BufWriter, ErrorKind, Read, Write},
    net::{TcpStream, ToSocketAddrs},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use base64::{Engine, engine::general_purpose::STANDARD};
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{connection::Link, error::Error};

pub const USER_AGENT: &str = "NTRIP Anello Client";

/// Connect and first response timeout.
pub const NTRIP_TIMEOUT: Duration = Duration::from_secs(2);

/// Attempts per explicit start.
pub const CONNECT_RETRIES: usize = 3;

/// Pause between two reconnects after the caster dropped us.
pub const NTRIP_RETRY: Duration = Duration::from_secs(30);

/// Rate limiting window.
pub const READ_INTERVAL: Duration = Duration::from_secs(1);

/// Correction bytes forwarded per window at most.
pub const MAX_BYTES_PER_INTERVAL: usize = 10_000;

/// Largest single write to the device.
pub const MAX_BYTES_PER_WRITE: usize = 1024;

pub const NTRIP_CACHE: &str = "ntrip_settings.json";

const RESPONSE_SIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum NtripError {
    #[error("could not reach caster: {0}")]
    Unreachable(String),

    #[error("wrong mountpoint (sourcetable)")]
    Sourcetable,

    #[error("wrong mountpoint (not found)")]
    NotFound,

    #[error("wrong mountpoint (bad request)")]
    BadRequest,

    #[error("wrong username/password")]
    Unauthorized,

    #[error("unexpected caster response: {0}")]
    Unexpected(String),

    #[error("caster closed the connection")]
    Disconnected,
}

/// Caster access, as saved by the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NtripConfig {
    pub caster: String,
    pub port: u16,
    pub mountpoint: String,
    pub username: String,
    pub password: String,
    /// Sends our position to the caster
    #[serde(default)]
    pub gga: bool,
}

impl NtripConfig {
    /// NTRIP v1 request with basic authentication.
    pub fn request(&self) -> Vec<u8> {
        let auth = STANDARD.encode(format!("{}:{}", self.username, self.password));
        format!(
            "GET /{} HTTP/1.0\r\nUser-Agent: {}\r\nAuthorization: Basic {}\r\n\r\n",
            self.mountpoint, USER_AGENT, auth
        )
        .into_bytes()
    }

    pub fn path(dir: &Path) -> PathBuf {
        dir.join(NTRIP_CACHE)
    }

    /// None when nothing was saved yet.
    pub fn load(dir: &Path) -> Result<Option<Self>, Error> {
        let fd = match File::open(Self::path(dir)) {
            Ok(fd) => fd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_reader(BufReader::new(fd))?))
    }

    pub fn save(&self, dir: &Path) -> Result<(), Error> {
        std::fs::create_dir_all(dir)?;
        let mut writer = BufWriter::new(File::create(Self::path(dir))?);
        serde_json::to_writer(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }
}

/// Caster answer to our request. The source table check comes first:
/// it also contains "200 OK".
pub fn classify_response(response: &[u8]) -> Result<(), NtripError> {
    let contains = |pattern: &[u8]| response.windows(pattern.len()).any(|w| w == pattern);

    if contains(b"SOURCETABLE 200 OK") {
        Err(NtripError::Sourcetable)
    } else if contains(b"200 OK") {
        Ok(())
    } else if contains(b"404 Not Found") {
        Err(NtripError::NotFound)
    } else if contains(b"400 Bad Request") {
        Err(NtripError::BadRequest)
    } else if contains(b"401 Unauthorized") {
        Err(NtripError::Unauthorized)
    } else {
        Err(NtripError::Unexpected(
            String::from_utf8_lossy(response).trim().to_string(),
        ))
    }
}

/// Non blocking source of correction bytes.
pub trait CorrectionSource: Send {
    /// `Ok(None)`: nothing pending. `Ok(Some(0))`: closed by the peer.
    fn try_recv(&mut self, buf: &mut [u8]) -> std::io::Result<Option<usize>>;

    fn send_all(&mut self, data: &[u8]) -> std::io::Result<()>;
}

impl CorrectionSource for TcpStream {
    fn try_recv(&mut self, buf: &mut [u8]) -> std::io::Result<Option<usize>> {
        match self.read(buf) {
            Ok(size) => Ok(Some(size)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn send_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.write_all(data)
    }
}

/// Read errors meaning the caster is gone, not just a hiccup.
fn lost_connection(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof
    )
}

fn connect_once(config: &NtripConfig) -> Result<TcpStream, NtripError> {
    let unreachable = |e: std::io::Error| NtripError::Unreachable(e.to_string());

    let addr = (config.caster.as_str(), config.port)
        .to_socket_addrs()
        .map_err(unreachable)?
        .next()
        .ok_or_else(|| NtripError::Unreachable(config.caster.clone()))?;

    let mut stream = TcpStream::connect_timeout(&addr, NTRIP_TIMEOUT).map_err(unreachable)?;
    stream.set_read_timeout(Some(NTRIP_TIMEOUT)).map_err(unreachable)?;
    stream.write_all(&config.request()).map_err(unreachable)?;

    let mut response = vec![0; RESPONSE_SIZE];
    let size = stream.read(&mut response).map_err(unreachable)?;
    response.truncate(size);
    trace!(target: "ntrip", "caster response: {}", String::from_utf8_lossy(&response).trim());

    classify_response(&response)?;

    stream.set_nonblocking(true).map_err(unreachable)?;
    Ok(stream)
}

/// Connects to the caster, `attempts` times at most. The last failure is reported.
pub fn connect(config: &NtripConfig, attempts: usize) -> Result<TcpStream, NtripError> {
    let mut last = NtripError::Unreachable("no attempt".to_string());
    for attempt in 1..=attempts.max(1) {
        match connect_once(config) {
            Ok(stream) => {
                debug!(target: "ntrip", "connected to {}:{}/{}", config.caster, config.port, config.mountpoint);
                return Ok(stream);
            },
            Err(e) => {
                debug!(target: "ntrip", "attempt {}/{} failed: {}", attempt, attempts, e);
                last = e;
            },
        }
    }
    Err(last)
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("caster closed the connection")]
    Disconnected,

    #[error("caster read error: {0}")]
    Source(std::io::Error),

    #[error("device write error: {0}")]
    Sink(Error),
}

/// Outcome of one relay step.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct RelayStep {
    pub forwarded: usize,
    pub dropped: usize,
}

/// Forwards corrections to the device, at most `budget` bytes per window.
/// Reads that would exceed the budget are dropped, along with everything
/// pending on the source, never buffered.
#[derive(Debug, Clone)]
pub struct Relay {
    budget: usize,
    interval: Duration,
    chunk: usize,
    window_start: Instant,
    window_bytes: usize,
}

impl Relay {
    pub fn new(now: Instant) -> Self {
        Self::with_budget(MAX_BYTES_PER_INTERVAL, READ_INTERVAL, MAX_BYTES_PER_WRITE, now)
    }

    pub fn with_budget(budget: usize, interval: Duration, chunk: usize, now: Instant) -> Self {
        Self {
            budget,
            interval,
            chunk: chunk.max(1),
            window_start: now,
            window_bytes: 0,
        }
    }

    /// Bytes counted in the current window.
    pub fn window_bytes(&self) -> usize {
        self.window_bytes
    }

    pub fn poll(
        &mut self,
        now: Instant,
        source: &mut dyn CorrectionSource,
        sink: &mut dyn Link,
    ) -> Result<RelayStep, RelayError> {
        if now.duration_since(self.window_start) >= self.interval {
            trace!(target: "ntrip", "{} bytes over the last window", self.window_bytes);
            self.window_start = now;
            self.window_bytes = 0;
        }

        if self.window_bytes > self.budget {
            return Ok(RelayStep::default());
        }

        let mut buf = vec![0; self.budget + 1];
        let size = match source.try_recv(&mut buf) {
            Ok(None) => return Ok(RelayStep::default()),
            Ok(Some(0)) => return Err(RelayError::Disconnected),
            Ok(Some(size)) => size,
            Err(e) if lost_connection(&e) => return Err(RelayError::Disconnected),
            Err(e) => return Err(RelayError::Source(e)),
        };
        self.window_bytes += size;

        if self.window_bytes <= self.budget {
            for chunk in buf[..size].chunks(self.chunk) {
                sink.write(chunk).map_err(RelayError::Sink)?;
            }
            return Ok(RelayStep {
                forwarded: size,
                dropped: 0,
            });
        }

        warn!(target: "ntrip", "more than {} bytes within {:?}, dropping corrections", self.budget, self.interval);
        let mut dropped = size;
        loop {
            match source.try_recv(&mut buf) {
                Ok(Some(size)) if size > 0 => dropped += size,
                _ => break,
            }
        }
        Ok(RelayStep {
            forwarded: 0,
            dropped,
        })
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::{
        collections::VecDeque,
        io::ErrorKind,
        sync::{Arc, Mutex},
        time::{Duration, Instant},
    };

    use super::{
        CorrectionSource, NtripConfig, NtripError, Relay, RelayError, RelayStep,
        classify_response,
    };
    use crate::connection::memory::MemoryLink;

    pub(crate) enum Burst {
        Data(Vec<u8>),
        /// Orderly close by the peer
        Closed,
        Failed(ErrorKind),
    }

    /// Caster scripted by bursts.
    #[derive(Clone, Default)]
    pub(crate) struct MemorySource {
        pub bursts: Arc<Mutex<VecDeque<Burst>>>,
        pub sent: Arc<Mutex<Vec<u8>>>,
    }

    impl MemorySource {
        pub fn push(&self, burst: &[u8]) {
            self.bursts.lock().unwrap().push_back(Burst::Data(burst.to_vec()));
        }

        pub fn disconnect(&self) {
            self.bursts.lock().unwrap().push_back(Burst::Closed);
        }

        pub fn fail(&self, kind: ErrorKind) {
            self.bursts.lock().unwrap().push_back(Burst::Failed(kind));
        }

        pub fn pending(&self) -> usize {
            self.bursts.lock().unwrap().len()
        }
    }

    impl CorrectionSource for MemorySource {
        fn try_recv(&mut self, buf: &mut [u8]) -> std::io::Result<Option<usize>> {
            let mut bursts = self.bursts.lock().unwrap();
            match bursts.pop_front() {
                None => Ok(None),
                Some(Burst::Closed) => Ok(Some(0)),
                Some(Burst::Failed(kind)) => Err(std::io::Error::from(kind)),
                Some(Burst::Data(mut burst)) => {
                    let size = burst.len().min(buf.len());
                    buf[..size].copy_from_slice(&burst[..size]);
                    if size < burst.len() {
                        bursts.push_front(Burst::Data(burst.split_off(size)));
                    }
                    Ok(Some(size))
                },
            }
        }

        fn send_all(&mut self, data: &[u8]) -> std::io::Result<()> {
            self.sent.lock().unwrap().extend_from_slice(data);
            Ok(())
        }
    }

    fn config() -> NtripConfig {
        NtripConfig {
            caster: "caster.example.com".to_string(),
            port: 2101,
            mountpoint: "MOUNT1".to_string(),
            username: "user".to_string(),
            password: "pass".to_string(),
            gga: true,
        }
    }

    #[test]
    fn test_request() {
        assert_eq!(
            String::from_utf8(config().request()).unwrap(),
            "GET /MOUNT1 HTTP/1.0\r\nUser-Agent: NTRIP Anello Client\r\nAuthorization: Basic dXNlcjpwYXNz\r\n\r\n"
        );
    }

    #[test]
    fn test_classify_response() {
        assert_eq!(classify_response(b"ICY 200 OK\r\n\r\n"), Ok(()));
        assert_eq!(classify_response(b"HTTP/1.0 200 OK\r\n"), Ok(()));
        assert_eq!(
            classify_response(b"SOURCETABLE 200 OK\r\nSTR;MOUNT"),
            Err(NtripError::Sourcetable)
        );
        assert_eq!(
            classify_response(b"HTTP/1.1 404 Not Found\r\n"),
            Err(NtripError::NotFound)
        );
        assert_eq!(
            classify_response(b"HTTP/1.1 400 Bad Request\r\n"),
            Err(NtripError::BadRequest)
        );
        assert_eq!(
            classify_response(b"HTTP/1.1 401 Unauthorized\r\n"),
            Err(NtripError::Unauthorized)
        );
        assert!(matches!(
            classify_response(b""),
            Err(NtripError::Unexpected(_))
        ));
    }

    #[test]
    fn test_config_cache() {
        let dir = std::env::temp_dir().join("boardlink-ntrip-cache");
        let _ = std::fs::remove_dir_all(&dir);
        assert_eq!(NtripConfig::load(&dir).unwrap(), None);

        config().save(&dir).unwrap();
        assert_eq!(NtripConfig::load(&dir).unwrap(), Some(config()));

        std::fs::write(
            NtripConfig::path(&dir),
            r#"{"caster":"c","port":2101,"mountpoint":"m","username":"u","password":"p"}"#,
        )
        .unwrap();
        assert!(!NtripConfig::load(&dir).unwrap().unwrap().gga);
    }

    #[test]
    fn test_rate_limit_drains() {
        let t0 = Instant::now();
        let mut relay = Relay::new(t0);
        let mut source = MemorySource::default();
        let device = MemoryLink::new();
        let mut sink = device.clone();

        source.push(&[0x11; 6000]);
        source.push(&[0x22; 6000]);
        source.push(&[0x33; 3000]);

        let step = relay.poll(t0, &mut source, &mut sink).unwrap();
        assert_eq!(
            step,
            RelayStep {
                forwarded: 6000,
                dropped: 0
            }
        );

        // over budget: this read and everything pending is dropped
        let step = relay.poll(t0, &mut source, &mut sink).unwrap();
        assert_eq!(
            step,
            RelayStep {
                forwarded: 0,
                dropped: 9000
            }
        );
        assert_eq!(source.pending(), 0);
        assert_eq!(device.written().len(), 6000);
        assert!(device.written().iter().all(|b| *b == 0x11));

        // window exhausted until it rolls over
        source.push(&[0x44; 100]);
        let later = t0 + Duration::from_millis(500);
        assert_eq!(relay.poll(later, &mut source, &mut sink).unwrap(), RelayStep::default());
        assert_eq!(source.pending(), 1);

        let next = t0 + Duration::from_secs(1);
        let step = relay.poll(next, &mut source, &mut sink).unwrap();
        assert_eq!(step.forwarded, 100);
        assert_eq!(relay.window_bytes(), 100);
        assert_eq!(device.written().len(), 6100);
    }

    #[test]
    fn test_relay_chunks_writes() {
        let t0 = Instant::now();
        let mut relay = Relay::with_budget(100, Duration::from_secs(1), 16, t0);
        let mut source = MemorySource::default();
        let device = MemoryLink::new();
        let mut sink = device.clone();

        source.push(&[0x55; 40]);
        assert_eq!(relay.poll(t0, &mut source, &mut sink).unwrap().forwarded, 40);
        assert_eq!(device.written().len(), 40);

        // a single read larger than the budget is never forwarded
        source.push(&[0x66; 500]);
        let step = relay.poll(t0 + Duration::from_secs(2), &mut source, &mut sink).unwrap();
        assert_eq!(step.forwarded, 0);
        assert_eq!(step.dropped, 500);
        assert_eq!(device.written().len(), 40);
    }

    #[test]
    fn test_relay_disconnect() {
        let t0 = Instant::now();
        let mut relay = Relay::new(t0);
        let mut source = MemorySource::default();
        let mut sink = MemoryLink::new();

        assert_eq!(relay.poll(t0, &mut source, &mut sink).unwrap(), RelayStep::default());
        source.disconnect();
        assert!(matches!(
            relay.poll(t0, &mut source, &mut sink),
            Err(RelayError::Disconnected)
        ));
    }

    #[test]
    fn test_relay_reset_is_disconnection() {
        let t0 = Instant::now();
        let mut relay = Relay::new(t0);
        let mut source = MemorySource::default();
        let mut sink = MemoryLink::new();

        source.fail(ErrorKind::Interrupted);
        assert!(matches!(
            relay.poll(t0, &mut source, &mut sink),
            Err(RelayError::Source(_))
        ));

        source.fail(ErrorKind::ConnectionReset);
        assert!(matches!(
            relay.poll(t0, &mut source, &mut sink),
            Err(RelayError::Disconnected)
        ));
    }
}
