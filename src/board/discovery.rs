//! Finds the control port, the data port and the baud rate of a device.
use std::{net::IpAddr, path::Path, time::Duration};

use log::{debug, info, warn};

use crate::{
    board::{ALLOWED_BAUD, Board, BoardSettings, ConnectionCache, DEFAULT_BAUD, TIMEOUT_AUTOBAUD},
    connection::{DummyLink, Link, SerialConnection, UdpConnection},
    error::Error,
};

/// Local UDP ports the device sends to.
pub const UDP_LOCAL_DATA_PORT: u16 = 1;
pub const UDP_LOCAL_CONFIG_PORT: u16 = 2;
pub const UDP_LOCAL_ODOMETER_PORT: u16 = 3;

/// Product IDs whose data port sits 3 below the control port.
const EVK_PIDS: [&str; 3] = ["EVK", "A1", "A-1"];

/// Source of serial ports.
pub trait PortOpener {
    /// Port names, sorted.
    fn list_ports(&self) -> Result<Vec<String>, Error>;

    fn open(&self, port: &str, baud: u32, timeout: Duration) -> Result<Box<dyn Link>, Error>;
}

/// Ports of this machine.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPorts;

impl PortOpener for SystemPorts {
    fn list_ports(&self) -> Result<Vec<String>, Error> {
        let mut ports = serialport::available_ports()?
            .into_iter()
            .map(|info| info.port_name)
            .collect::<Vec<_>>();
        ports.sort();
        Ok(ports)
    }

    fn open(&self, port: &str, baud: u32, timeout: Duration) -> Result<Box<dyn Link>, Error> {
        Ok(Box::new(SerialConnection::open(port, baud, timeout)?))
    }
}

/// Manual fallback: somebody picks a port among `ports`, None cancels.
pub trait PortPicker {
    fn pick(&mut self, prompt: &str, ports: &[String]) -> Option<String>;
}

/// "COM10" -> "COM7": numeric suffix minus 3.
pub fn compute_data_port(control_port: &str) -> Option<String> {
    let prefix = control_port.trim_end_matches(|c: char| c.is_ascii_digit());
    let number = control_port[prefix.len()..].parse::<u32>().ok()?;
    Some(format!("{}{}", prefix, number.checked_sub(3)?))
}

impl Board {
    /// Session on known ports. `None` leaves that side unconnected.
    /// A wrong baud is corrected by probing the others.
    pub fn connect(
        opener: &dyn PortOpener,
        control_port: Option<&str>,
        data_port: Option<&str>,
        baud: u32,
        settings: BoardSettings,
    ) -> Result<Self, Error> {
        let mut board = Self::new(settings);
        board.connect_to_ports(opener, control_port, data_port, baud)?;
        Ok(board)
    }

    /// Session over UDP, one socket per remote port.
    pub fn from_udp(
        ip: IpAddr,
        data_port: Option<u16>,
        control_port: Option<u16>,
        odometer_port: Option<u16>,
        settings: BoardSettings,
    ) -> Result<Self, Error> {
        let open = |remote: Option<u16>, local: u16| -> Result<Box<dyn Link>, Error> {
            let link: Box<dyn Link> = match remote {
                Some(remote) => Box::new(UdpConnection::open(ip, remote, local, settings.timeout)?),
                None => Box::new(DummyLink),
            };
            Ok(link)
        };
        let data = open(data_port, UDP_LOCAL_DATA_PORT)?;
        let control = open(control_port, UDP_LOCAL_CONFIG_PORT)?;
        let odometer = match odometer_port {
            Some(port) => Some(open(Some(port), UDP_LOCAL_ODOMETER_PORT)?),
            None => None,
        };
        Ok(Self::with_links(control, data, odometer, settings))
    }

    /// Cached ports first, then a full search, then the manual picker.
    /// The outcome is cached on success.
    pub fn auto(
        opener: &dyn PortOpener,
        picker: &mut dyn PortPicker,
        cache_dir: &Path,
        use_data_port: bool,
        settings: BoardSettings,
    ) -> Result<Self, Error> {
        let mut board = Self::new(settings);

        match ConnectionCache::load(cache_dir, use_data_port) {
            Ok(Some(cache)) => {
                let data_port = if use_data_port {
                    cache.data_port.as_deref()
                } else {
                    None
                };
                match board.connect_to_ports(
                    opener,
                    Some(cache.control_port.as_str()),
                    data_port,
                    cache.baud,
                ) {
                    Ok(_) => {
                        info!(target: "discovery", "connected from cache: {}", cache.control_port);
                        board.save_cache(cache_dir, use_data_port);
                        return Ok(board);
                    },
                    Err(e) => debug!(target: "discovery", "cached ports failed: {}", e),
                }
            },
            Ok(None) => debug!(target: "discovery", "no cached ports"),
            Err(e) => warn!(target: "discovery", "unreadable connection cache: {}", e),
        }

        board.release_connections();
        board.auto_no_cache(opener, picker, use_data_port)?;
        board.save_cache(cache_dir, use_data_port);
        Ok(board)
    }

    fn save_cache(&self, cache_dir: &Path, use_data_port: bool) {
        let Some(control_port) = self.control_port.clone() else {
            return;
        };
        let cache = ConnectionCache {
            control_port,
            data_port: if use_data_port {
                self.data_port.clone()
            } else {
                None
            },
            baud: self.baud,
        };
        if let Err(e) = cache.save(cache_dir, use_data_port) {
            warn!(target: "discovery", "failed to write connection cache: {}", e);
        }
    }

    /// Opens the ports and verifies them: ping on control, streamed output on data.
    pub fn connect_to_ports(
        &mut self,
        opener: &dyn PortOpener,
        control_port: Option<&str>,
        data_port: Option<&str>,
        baud: u32,
    ) -> Result<(), Error> {
        let timeout = self.settings.timeout;
        let result = (|| -> Result<u32, Error> {
            let data: Box<dyn Link> = match data_port {
                Some(port) => opener.open(port, baud, timeout)?,
                None => Box::new(DummyLink),
            };
            let control: Box<dyn Link> = match control_port {
                Some(port) => opener.open(port, baud, timeout)?,
                None => Box::new(DummyLink),
            };
            self.set_data_link(data);
            self.set_control_link(control);

            if self.ports_respond(control_port.is_some(), data_port.is_some())? {
                return Ok(baud);
            }

            // maybe the baud changed since
            let baud = self.auto_detect_baud()?.ok_or(Error::Discovery)?;
            if self.ports_respond(control_port.is_some(), data_port.is_some())? {
                Ok(baud)
            } else {
                Err(Error::Discovery)
            }
        })();

        match result {
            Ok(baud) => {
                self.control_port = control_port.map(str::to_string);
                self.data_port = data_port.map(str::to_string);
                self.baud = baud;
                Ok(())
            },
            Err(e) => {
                self.release_connections();
                Err(e)
            },
        }
    }

    fn ports_respond(&mut self, control: bool, data: bool) -> Result<bool, Error> {
        if control && !self.check_control_port() {
            return Ok(false);
        }
        if data && !self.check_data_port()? {
            return Ok(false);
        }
        Ok(true)
    }

    /// Every baud, fastest first, then the manual picker.
    pub fn auto_no_cache(
        &mut self,
        opener: &dyn PortOpener,
        picker: &mut dyn PortPicker,
        use_data_port: bool,
    ) -> Result<(), Error> {
        for baud in ALLOWED_BAUD {
            if self.auto_port(opener, baud, use_data_port)? {
                return Ok(());
            }
        }
        warn!(target: "discovery", "auto search failed, manual selection");
        self.connect_manually(opener, picker, use_data_port)
    }

    /// Tries every port as control port at `baud`, last listed first.
    pub fn auto_port(
        &mut self,
        opener: &dyn PortOpener,
        baud: u32,
        use_data_port: bool,
    ) -> Result<bool, Error> {
        debug!(target: "discovery", "searching at {} baud", baud);
        let ports = opener.list_ports()?;

        for control_port in ports.iter().rev() {
            let link = match opener.open(control_port, baud, TIMEOUT_AUTOBAUD) {
                Ok(link) => link,
                Err(e) => {
                    debug!(target: "discovery", "skipping {}: {}", control_port, e);
                    continue;
                },
            };
            self.set_control_link(link);

            if !self.check_control_port() {
                self.release_connections();
                continue;
            }

            match self.adopt_control_port(opener, control_port, baud, use_data_port, &ports) {
                Ok(true) => return Ok(true),
                Ok(false) => {
                    self.release_connections();
                    return Ok(false);
                },
                Err(e) => {
                    debug!(target: "discovery", "skipping {}: {}", control_port, e);
                    self.control_port = None;
                    self.release_connections();
                },
            }
        }

        self.release_connections();
        Ok(false)
    }

    /// Settles on `control_port`, which answered pings, then finds its data port.
    /// Ok(false) when the data port is nowhere to be found.
    fn adopt_control_port(
        &mut self,
        opener: &dyn PortOpener,
        control_port: &str,
        baud: u32,
        use_data_port: bool,
        ports: &[String],
    ) -> Result<bool, Error> {
        info!(target: "discovery", "control port: {} at {} baud", control_port, baud);
        let timeout = self.settings.timeout;
        self.control_link().set_timeout(timeout)?;
        self.control_port = Some(control_port.to_string());
        self.baud = baud;

        if !use_data_port {
            return Ok(true);
        }

        let data_port = match self.get_pid() {
            Ok(pid) if EVK_PIDS.iter().any(|known| pid.contains(*known)) => {
                let data_port = compute_data_port(control_port);
                if let Some(port) = &data_port {
                    let link = opener.open(port, baud, self.settings.timeout)?;
                    self.set_data_link(link);
                }
                data_port
            },
            Ok(_) => self.find_data_port_gnss_imu(opener, ports),
            Err(e) => {
                debug!(target: "discovery", "no product ID on {}: {}", control_port, e);
                self.find_data_port_gnss_imu(opener, ports)
            },
        };

        match data_port {
            Some(port) => {
                info!(target: "discovery", "data port: {}", port);
                self.data_port = Some(port);
                Ok(true)
            },
            None => Ok(false),
        }
    }

    /// Opens each port as data port until one streams output.
    fn find_data_port_gnss_imu(
        &mut self,
        opener: &dyn PortOpener,
        ports: &[String],
    ) -> Option<String> {
        for port in ports {
            if Some(port) == self.control_port.as_ref() {
                continue;
            }
            debug!(target: "discovery", "looking for data on {} ({})", port, self.data_scheme());
            match opener.open(port, self.baud, self.settings.timeout) {
                Ok(link) => {
                    self.set_data_link(link);
                    match self.check_data_port() {
                        Ok(true) => return Some(port.clone()),
                        Ok(false) => {},
                        Err(e) => debug!(target: "discovery", "skipping {}: {}", port, e),
                    }
                },
                Err(e) => debug!(target: "discovery", "skipping {}: {}", port, e),
            }
            self.release_data_port();
        }
        None
    }

    /// Finds the baud the device answers pings at. Links must be open.
    pub fn auto_detect_baud(&mut self) -> Result<Option<u32>, Error> {
        for baud in ALLOWED_BAUD {
            self.control_link().set_baud(baud)?;
            self.control_link().reset_input_buffer()?;
            if self.check_control_port() {
                self.set_connection_baud(baud)?;
                return Ok(Some(baud));
            }
        }
        Ok(None)
    }

    /// Ports picked by hand, at the default baud, then baud detection.
    pub fn connect_manually(
        &mut self,
        opener: &dyn PortOpener,
        picker: &mut dyn PortPicker,
        use_data_port: bool,
    ) -> Result<(), Error> {
        let ports = opener.list_ports()?;
        if ports.is_empty() {
            warn!(target: "discovery", "no ports found");
            return Err(Error::Discovery);
        }
        let timeout = self.settings.timeout;

        let mut data_port = None;
        if use_data_port {
            loop {
                let port = picker
                    .pick("data port (lowest of the 4 consecutive ports)", &ports)
                    .ok_or(Error::Discovery)?;
                match opener.open(&port, DEFAULT_BAUD, timeout) {
                    Ok(link) => {
                        self.set_data_link(link);
                        data_port = Some(port);
                        break;
                    },
                    Err(e) => warn!(target: "discovery", "cannot open {}: {}", port, e),
                }
            }
        }

        let control_port = loop {
            let port = match picker.pick("configuration port (highest of the 4 consecutive ports)", &ports) {
                Some(port) => port,
                None => {
                    self.release_connections();
                    return Err(Error::Discovery);
                },
            };
            match opener.open(&port, DEFAULT_BAUD, timeout) {
                Ok(link) => {
                    self.set_control_link(link);
                    break port;
                },
                Err(e) => warn!(target: "discovery", "cannot open {}: {}", port, e),
            }
        };

        self.control_port = Some(control_port);
        self.data_port = data_port;
        match self.auto_detect_baud()? {
            Some(baud) => {
                self.baud = baud;
                Ok(())
            },
            None => {
                self.release_connections();
                Err(Error::Discovery)
            },
        }
    }
}

#[cfg(test)]
mod test {
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use super::{PortOpener, PortPicker, compute_data_port};
    use crate::{
        board::{
            Board, ConnectionCache,
            test::{fast_settings, frame, request_body},
        },
        connection::{Link, memory::MemoryLink},
        error::Error,
    };

    /// Ports answering only at one baud on one control port.
    struct FakePorts {
        ports: Vec<String>,
        control: String,
        baud: u32,
        pid: &'static str,
        busy: Option<&'static str>,
        attempts: Arc<Mutex<Vec<(String, u32)>>>,
    }

    impl FakePorts {
        fn new(ports: &[&str], control: &str, baud: u32, pid: &'static str) -> Self {
            Self {
                ports: ports.iter().map(|p| p.to_string()).collect(),
                control: control.to_string(),
                baud,
                pid,
                busy: None,
                attempts: Default::default(),
            }
        }

        /// `port` fails to open.
        fn with_busy(mut self, port: &'static str) -> Self {
            self.busy = Some(port);
            self
        }

        fn attempts(&self) -> Vec<(String, u32)> {
            self.attempts.lock().unwrap().clone()
        }
    }

    impl PortOpener for FakePorts {
        fn list_ports(&self) -> Result<Vec<String>, Error> {
            Ok(self.ports.clone())
        }

        fn open(&self, port: &str, baud: u32, _: Duration) -> Result<Box<dyn Link>, Error> {
            self.attempts.lock().unwrap().push((port.to_string(), baud));
            if self.busy == Some(port) {
                return Err(Error::Io(std::io::Error::other("port busy")));
            }
            let is_control = port == self.control;
            let answers_at = self.baud;
            let pid = self.pid;
            let link = MemoryLink::with_responder(
                baud,
                Box::new(move |current, data| {
                    if !is_control || current != answers_at {
                        return Vec::new();
                    }
                    match request_body(data).as_str() {
                        "APPNG" => frame("APPNG,0"),
                        "APPID" => frame(&format!("APPID,{}", pid)),
                        _ => Vec::new(),
                    }
                }),
            );
            Ok(Box::new(link))
        }
    }

    struct ScriptedPicker(VecDeque<Option<String>>);

    impl PortPicker for ScriptedPicker {
        fn pick(&mut self, _: &str, _: &[String]) -> Option<String> {
            self.0.pop_front().flatten()
        }
    }

    fn cache_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("boardlink-discovery-{}", name));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_compute_data_port() {
        assert_eq!(compute_data_port("COM10").as_deref(), Some("COM7"));
        assert_eq!(compute_data_port("/dev/ttyUSB3").as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(compute_data_port("/dev/ttyUSB2"), None);
        assert_eq!(compute_data_port("COM"), None);
    }

    #[test]
    fn test_discovery_order() {
        let ports = FakePorts::new(&["p0", "p1", "p2"], "p1", 230400, "GNSS-INS");
        let dir = cache_dir("order");
        let mut picker = ScriptedPicker(VecDeque::new());

        let board = Board::auto(&ports, &mut picker, &dir, false, fast_settings()).unwrap();
        assert_eq!(board.control_port.as_deref(), Some("p1"));
        assert_eq!(board.data_port, None);
        assert_eq!(board.baud, 230400);

        let expected = [
            ("p2", 921600),
            ("p1", 921600),
            ("p0", 921600),
            ("p2", 230400),
            ("p1", 230400),
        ]
        .iter()
        .map(|(p, b)| (p.to_string(), *b))
        .collect::<Vec<_>>();
        assert_eq!(ports.attempts(), expected);

        let cache = ConnectionCache::load(&dir, false).unwrap().unwrap();
        assert_eq!(cache.control_port, "p1");
        assert_eq!(cache.baud, 230400);
        assert_eq!(cache.data_port, None);
    }

    #[test]
    fn test_cached_ports_first() {
        let ports = FakePorts::new(&["p0", "p1", "p2"], "p1", 230400, "GNSS-INS");
        let dir = cache_dir("cached");
        ConnectionCache {
            control_port: "p1".to_string(),
            data_port: None,
            baud: 230400,
        }
        .save(&dir, false)
        .unwrap();

        let mut picker = ScriptedPicker(VecDeque::new());
        let board = Board::auto(&ports, &mut picker, &dir, false, fast_settings()).unwrap();
        assert_eq!(board.control_port.as_deref(), Some("p1"));
        assert_eq!(ports.attempts(), vec![("p1".to_string(), 230400)]);
    }

    #[test]
    fn test_cached_baud_redetected() {
        let ports = FakePorts::new(&["p0", "p1"], "p1", 115200, "GNSS-INS");
        let mut board = Board::connect(&ports, Some("p1"), None, 921600, fast_settings()).unwrap();
        assert_eq!(board.baud, 115200);
        assert_eq!(ports.attempts(), vec![("p1".to_string(), 921600)]);
        assert!(board.check_control_port());
    }

    #[test]
    fn test_evk_data_port() {
        let ports = FakePorts::new(&["COM1", "COM2", "COM3", "COM4"], "COM4", 921600, "EVK-2.0");
        let dir = cache_dir("evk");
        let mut picker = ScriptedPicker(VecDeque::new());

        let board = Board::auto(&ports, &mut picker, &dir, true, fast_settings()).unwrap();
        assert_eq!(board.control_port.as_deref(), Some("COM4"));
        assert_eq!(board.data_port.as_deref(), Some("COM1"));
        assert_eq!(
            ports.attempts(),
            vec![("COM4".to_string(), 921600), ("COM1".to_string(), 921600)]
        );

        let cache = ConnectionCache::load(&dir, true).unwrap().unwrap();
        assert_eq!(cache.data_port.as_deref(), Some("COM1"));
    }

    #[test]
    fn test_manual_fallback() {
        let ports = FakePorts::new(&["p0", "p1"], "none", 921600, "GNSS-INS");
        let dir = cache_dir("manual");
        let mut picker = ScriptedPicker(VecDeque::from([None]));

        let result = Board::auto(&ports, &mut picker, &dir, false, fast_settings());
        assert!(matches!(result, Err(Error::Discovery)));
        // every baud on every port, then nothing opened by the cancelled picker
        assert_eq!(ports.attempts().len(), 10);
        assert!(ConnectionCache::load(&dir, false).unwrap().is_none());
    }

    #[test]
    fn test_manual_selection() {
        let ports = FakePorts::new(&["p0", "p1"], "p0", 57600, "GNSS-INS");
        let mut board = Board::new(fast_settings());
        let mut picker = ScriptedPicker(VecDeque::from([Some("p0".to_string())]));
        board
            .connect_manually(&ports, &mut picker, false)
            .unwrap();
        assert_eq!(board.control_port.as_deref(), Some("p0"));
        assert_eq!(board.baud, 57600);
    }

    #[test]
    fn test_failing_port_skipped() {
        let ports = FakePorts::new(&["COM1", "COM2", "COM3", "COM4"], "COM4", 921600, "EVK-2.0")
            .with_busy("COM1");
        let dir = cache_dir("busy");
        let mut picker = ScriptedPicker(VecDeque::from([None]));

        let result = Board::auto(&ports, &mut picker, &dir, true, fast_settings());
        assert!(matches!(result, Err(Error::Discovery)));

        // the data port of COM4 cannot be opened: search goes on
        let attempts = ports.attempts();
        assert_eq!(
            attempts[..3],
            [
                ("COM4".to_string(), 921600),
                ("COM1".to_string(), 921600),
                ("COM3".to_string(), 921600),
            ]
        );
        assert!(attempts.contains(&("COM2".to_string(), 115200)));
        assert!(ConnectionCache::load(&dir, true).unwrap().is_none());
    }
}
