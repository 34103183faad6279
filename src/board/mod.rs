//! Device session: one control link, one data link, request/response commands.
use std::{collections::VecDeque, thread, time::Duration};

use log::{debug, trace, warn};

pub mod cache;
mod discovery;

pub use cache::ConnectionCache;
pub use discovery::{
    PortOpener, PortPicker, SystemPorts, UDP_LOCAL_CONFIG_PORT, UDP_LOCAL_DATA_PORT,
    UDP_LOCAL_ODOMETER_PORT, compute_data_port,
};

use crate::{
    connection::{DummyLink, Link},
    error::Error,
    message::{Configurations, Message, MsgType, ParseError},
    scheme::{ConfigMode, ReadableScheme, Scheme, SchemeKind},
    stream::StreamDecoder,
};

/// Preferred baud rates, fastest first.
pub const ALLOWED_BAUD: [u32; 5] = [921600, 230400, 460800, 115200, 57600];

pub const DEFAULT_BAUD: u32 = 921600;

/// Read timeout while probing ports.
pub const TIMEOUT_AUTOBAUD: Duration = Duration::from_millis(200);

/// Read timeout once the port is known.
pub const TIMEOUT_REGULAR: Duration = Duration::from_millis(400);

/// Attempts per device command.
pub const COMMANDS_RETRY: usize = 5;

/// Bytes requested per data read while looking for one message.
const DATA_READ_SIZE: usize = 256;

const RESPONSE_END: &[u8] = b"\r\n";

/// Device reported error codes.
const DEVICE_ERRORS: [&str; 11] = [
    "No start character",
    "Missing r/w for config",
    "Incomplete Message",
    "Invalid Checksum",
    "Invalid Talker code",
    "Invalid Message Type",
    "Invalid Field",
    "Invalid Value",
    "Flash Locked",
    "Unexpected Character",
    "Feature Disabled",
];

/// Name of a device error code.
pub fn device_error_reason(code: i64) -> &'static str {
    usize::try_from(code)
        .ok()
        .and_then(|code| code.checked_sub(1))
        .and_then(|index| DEVICE_ERRORS.get(index).copied())
        .unwrap_or("Unknown error")
}

/// The device rejected the frame itself (garbled on the wire) rather than its content.
pub fn device_error_is_link_level(code: i64) -> bool {
    matches!(code, 1 | 3 | 4 | 10)
}

/// Runs `op` up to `attempts` times, repeating only while `retryable` accepts the error.
pub fn retry<T>(
    attempts: usize,
    retryable: impl Fn(&Error) -> bool,
    mut op: impl FnMut() -> Result<T, Error>,
) -> Result<T, Error> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts && retryable(&e) => {
                debug!("attempt {}/{} failed: {}", attempt, attempts, e);
                attempt += 1;
            },
            Err(e) => return Err(e),
        }
    }
}

/// Session timing.
#[derive(Debug, Clone, Copy)]
pub struct BoardSettings {
    /// Pause between a request and reading its response
    pub response_delay: Duration,
    /// Attempts per command
    pub retries: usize,
    /// Read timeout once connected
    pub timeout: Duration,
    /// Pause around a reset
    pub reset_wait: Duration,
    /// Pings sent while waiting for the device to come back from a reset
    pub reset_pings: usize,
}

impl Default for BoardSettings {
    fn default() -> Self {
        Self {
            response_delay: Duration::from_millis(100),
            retries: COMMANDS_RETRY,
            timeout: TIMEOUT_REGULAR,
            reset_wait: Duration::from_millis(500),
            reset_pings: 20,
        }
    }
}

pub struct Board {
    control: Box<dyn Link>,
    data: Box<dyn Link>,
    odometer: Option<Box<dyn Link>>,
    pub control_port: Option<String>,
    pub data_port: Option<String>,
    pub baud: u32,
    data_scheme: SchemeKind,
    decoder: StreamDecoder,
    pending: VecDeque<Message>,
    pub settings: BoardSettings,
}

impl Board {
    /// Unconnected session: both links are dummies.
    pub fn new(settings: BoardSettings) -> Self {
        Self {
            control: Box::new(DummyLink),
            data: Box::new(DummyLink),
            odometer: None,
            control_port: None,
            data_port: None,
            baud: DEFAULT_BAUD,
            data_scheme: SchemeKind::default(),
            decoder: StreamDecoder::new(&[SchemeKind::default()]),
            pending: VecDeque::new(),
            settings,
        }
    }

    /// Session over already opened links.
    pub fn with_links(
        control: Box<dyn Link>,
        data: Box<dyn Link>,
        odometer: Option<Box<dyn Link>>,
        settings: BoardSettings,
    ) -> Self {
        let mut board = Self::new(settings);
        board.control = control;
        board.data = data;
        board.odometer = odometer;
        board
    }

    pub fn data_scheme(&self) -> SchemeKind {
        self.data_scheme
    }

    pub fn set_data_scheme(&mut self, scheme: SchemeKind) {
        self.data_scheme = scheme;
        self.decoder = StreamDecoder::new(&[scheme]);
        self.pending.clear();
    }

    /// Hands the data link over (to the I/O loop), leaving a dummy in place.
    pub fn take_data_link(&mut self) -> Box<dyn Link> {
        std::mem::replace(&mut self.data, Box::new(DummyLink))
    }

    pub(crate) fn set_control_link(&mut self, link: Box<dyn Link>) {
        self.control.close();
        self.control = link;
    }

    pub(crate) fn set_data_link(&mut self, link: Box<dyn Link>) {
        self.data.close();
        self.data = link;
        self.decoder.reset();
        self.pending.clear();
    }

    pub(crate) fn control_link(&mut self) -> &mut dyn Link {
        &mut self.control
    }

    pub fn release_data_port(&mut self) {
        self.set_data_link(Box::new(DummyLink));
    }

    pub fn release_connections(&mut self) {
        self.control.close();
        self.data.close();
        if let Some(odometer) = self.odometer.as_mut() {
            odometer.close();
        }
        self.control = Box::new(DummyLink);
        self.data = Box::new(DummyLink);
        self.odometer = None;
    }

    /// Drops anything pending on both links.
    pub fn clear_inputs(&mut self) -> Result<(), Error> {
        self.data.reset_input_buffer()?;
        self.control.reset_input_buffer()?;
        self.data.read_all_available()?;
        self.control.read_all_available()?;
        self.decoder.reset();
        self.pending.clear();
        Ok(())
    }

    /// Changes the local baud rate of both links (not the device setting).
    pub fn set_connection_baud(&mut self, baud: u32) -> Result<(), Error> {
        self.baud = baud;
        self.control.set_baud(baud)?;
        self.data.set_baud(baud)?;
        self.control.read_all_available()?;
        self.data.read_all_available()?;
        Ok(())
    }

    /// Writes one request and reads one response line.
    pub fn send_control_message(&mut self, msg: &Message) -> Result<Message, Error> {
        let bytes = ReadableScheme.build_message_general(msg)?;
        self.control.read_all_available()?;
        self.control.write(&bytes)?;
        trace!("sent {}", String::from_utf8_lossy(&bytes).trim_end());

        thread::sleep(self.settings.response_delay);

        let raw = self.control.read_until(RESPONSE_END)?;
        if raw.is_empty() {
            return Err(Error::Timeout(msg.msgtype));
        }
        if !raw.ends_with(RESPONSE_END) {
            return Err(Error::IncompleteResponse(
                String::from_utf8_lossy(&raw).to_string(),
            ));
        }
        Ok(ReadableScheme.parse_message(&raw))
    }

    /// Request without response (resets, odometer).
    pub fn send_control_no_wait(&mut self, msg: &Message) -> Result<(), Error> {
        let bytes = ReadableScheme.build_message_general(msg)?;
        self.control.write(&bytes)?;
        Ok(())
    }

    /// Single exchange, checked against the `expected` response type.
    fn exchange(&mut self, msg: &Message, expected: MsgType) -> Result<Message, Error> {
        let response = self.send_control_message(msg)?;
        if !response.valid {
            return Err(Error::InvalidResponse(
                response.error.unwrap_or(ParseError::Framing),
            ));
        }
        if response.msgtype == MsgType::ERR && expected != MsgType::ERR {
            let code = response.i64("err").unwrap_or_default();
            return Err(Error::Device {
                code,
                reason: device_error_reason(code),
            });
        }
        if response.msgtype != expected {
            return Err(Error::UnexpectedResponse {
                expected,
                got: response.msgtype,
            });
        }
        Ok(response)
    }

    /// Exchange retried on transient failures.
    fn command(&mut self, msg: &Message, expected: MsgType) -> Result<Message, Error> {
        let retries = self.settings.retries;
        retry(retries, Error::is_transient, || self.exchange(msg, expected))
    }

    fn text_field(&mut self, msgtype: MsgType, name: &str) -> Result<String, Error> {
        let response = self.command(&Message::new(msgtype), msgtype)?;
        response
            .bytes(name)
            .map(|value| String::from_utf8_lossy(value).to_string())
            .ok_or_else(|| Error::IncompleteResponse(name.to_string()))
    }

    fn int_field(&mut self, msgtype: MsgType, name: &str) -> Result<i64, Error> {
        let response = self.command(&Message::new(msgtype), msgtype)?;
        response
            .i64(name)
            .ok_or_else(|| Error::IncompleteResponse(name.to_string()))
    }

    /// One ping, no retry.
    pub fn ping(&mut self) -> Result<Message, Error> {
        self.exchange(&Message::new(MsgType::PNG), MsgType::PNG)
    }

    /// True when the control link answers a ping.
    pub fn check_control_port(&mut self) -> bool {
        match self.ping() {
            Ok(_) => true,
            Err(e) => {
                trace!("ping failed: {}", e);
                false
            },
        }
    }

    pub fn get_version(&mut self) -> Result<String, Error> {
        self.text_field(MsgType::VER, "ver")
    }

    pub fn get_serial(&mut self) -> Result<String, Error> {
        self.text_field(MsgType::SER, "ser")
    }

    pub fn get_pid(&mut self) -> Result<String, Error> {
        self.text_field(MsgType::PID, "pid")
    }

    pub fn get_ihw(&mut self) -> Result<i64, Error> {
        self.int_field(MsgType::IHW, "ihw")
    }

    pub fn get_fhw(&mut self) -> Result<i64, Error> {
        self.int_field(MsgType::FHW, "fhw")
    }

    pub fn get_fsn(&mut self) -> Result<i64, Error> {
        self.int_field(MsgType::FSN, "fsn")
    }

    pub fn get_status(&mut self) -> Result<Configurations, Error> {
        let response = self.command(&Message::new(MsgType::STA), MsgType::STA)?;
        Ok(response.configurations().cloned().unwrap_or_default())
    }

    /// Reads named settings. An empty list reads all of them.
    fn read_named<S: AsRef<str>>(
        &mut self,
        msgtype: MsgType,
        mode: ConfigMode,
        names: &[S],
    ) -> Result<Configurations, Error> {
        let request = Message::new(msgtype)
            .with("mode", mode.as_bytes())
            .with_configurations(Configurations::names(names));

        let retries = self.settings.retries;
        retry(retries, Error::is_transient, || {
            let response = self.exchange(&request, msgtype)?;
            let configurations = response.configurations().cloned().unwrap_or_default();
            for name in names {
                if configurations.get(name.as_ref()).is_none() {
                    return Err(Error::IncompleteResponse(name.as_ref().to_string()));
                }
            }
            Ok(configurations)
        })
    }

    /// Writes named settings; the device must echo every pair back.
    fn write_named<K: AsRef<str>, V: AsRef<[u8]>>(
        &mut self,
        msgtype: MsgType,
        mode: ConfigMode,
        pairs: &[(K, V)],
    ) -> Result<(), Error> {
        let request = Message::new(msgtype)
            .with("mode", mode.as_bytes())
            .with_configurations(Configurations::pairs(pairs));

        let retries = self.settings.retries;
        retry(retries, Error::is_transient, || {
            let response = self.exchange(&request, msgtype)?;
            let echoed = response.configurations().cloned().unwrap_or_default();
            for (name, value) in pairs {
                if echoed.get(name.as_ref()) != Some(value.as_ref()) {
                    return Err(Error::IncompleteResponse(name.as_ref().to_string()));
                }
            }
            Ok(())
        })
    }

    pub fn get_cfg<S: AsRef<str>>(&mut self, names: &[S]) -> Result<Configurations, Error> {
        self.read_named(MsgType::CFG, ConfigMode::ReadRam, names)
    }

    pub fn get_cfg_flash<S: AsRef<str>>(&mut self, names: &[S]) -> Result<Configurations, Error> {
        self.read_named(MsgType::CFG, ConfigMode::ReadFlash, names)
    }

    pub fn get_cfg_all(&mut self) -> Result<Configurations, Error> {
        self.read_named::<&str>(MsgType::CFG, ConfigMode::ReadRam, &[])
    }

    pub fn get_cfg_flash_all(&mut self) -> Result<Configurations, Error> {
        self.read_named::<&str>(MsgType::CFG, ConfigMode::ReadFlash, &[])
    }

    pub fn set_cfg<K: AsRef<str>, V: AsRef<[u8]>>(&mut self, pairs: &[(K, V)]) -> Result<(), Error> {
        self.write_named(MsgType::CFG, ConfigMode::WriteRam, pairs)
    }

    pub fn set_cfg_flash<K: AsRef<str>, V: AsRef<[u8]>>(
        &mut self,
        pairs: &[(K, V)],
    ) -> Result<(), Error> {
        self.write_named(MsgType::CFG, ConfigMode::WriteFlash, pairs)
    }

    pub fn get_veh_flash<S: AsRef<str>>(&mut self, names: &[S]) -> Result<Configurations, Error> {
        self.read_named(MsgType::VEH, ConfigMode::ReadFlash, names)
    }

    pub fn get_veh_flash_all(&mut self) -> Result<Configurations, Error> {
        self.read_named::<&str>(MsgType::VEH, ConfigMode::ReadFlash, &[])
    }

    pub fn set_veh_flash<K: AsRef<str>, V: AsRef<[u8]>>(
        &mut self,
        pairs: &[(K, V)],
    ) -> Result<(), Error> {
        self.write_named(MsgType::VEH, ConfigMode::WriteFlash, pairs)
    }

    /// Single setting read, from RAM or flash.
    pub fn get_cfg_value(&mut self, name: &str, flash: bool) -> Result<Vec<u8>, Error> {
        let configurations = if flash {
            self.get_cfg_flash(&[name])?
        } else {
            self.get_cfg(&[name])?
        };
        configurations
            .get(name)
            .map(|value| value.to_vec())
            .ok_or_else(|| Error::IncompleteResponse(name.to_string()))
    }

    pub fn echo(&mut self, contents: &[u8]) -> Result<Vec<u8>, Error> {
        let request = Message::new(MsgType::ECH).with("contents", contents);
        let response = self.command(&request, MsgType::ECH)?;
        Ok(response.bytes("contents").unwrap_or_default().to_vec())
    }

    /// The device does not answer a reset.
    pub fn reset(&mut self, code: i64) -> Result<(), Error> {
        self.send_control_no_wait(&Message::new(MsgType::RST).with("code", code))
    }

    pub fn reset_regular(&mut self) -> Result<(), Error> {
        self.reset(0)
    }

    pub fn enter_bootloading(&mut self) -> Result<(), Error> {
        self.reset(2)
    }

    /// Resets, then pings until the device answers again. Pass `new_baud`
    /// when the reset applies a new baud rate.
    pub fn reset_with_waits(&mut self, new_baud: Option<u32>) -> Result<(), Error> {
        thread::sleep(self.settings.reset_wait);
        self.reset_regular()?;
        thread::sleep(self.settings.reset_wait);

        if let Some(baud) = new_baud {
            self.set_connection_baud(baud)?;
        }

        for _ in 0..self.settings.reset_pings {
            if self.check_control_port() {
                return Ok(());
            }
            thread::sleep(self.settings.reset_wait);
        }
        warn!("no answer after reset");
        Err(Error::Timeout(MsgType::PNG))
    }

    /// Sends a speed reading, on the odometer link when there is one.
    pub fn send_odometer(&mut self, speed: f64) -> Result<(), Error> {
        let msg = Message::new(MsgType::ODO).with("speed", speed);
        match self.odometer.as_mut() {
            Some(odometer) => {
                let bytes = ReadableScheme.build_message_general(&msg)?;
                odometer.write(&bytes)?;
                Ok(())
            },
            None => self.send_control_no_wait(&msg),
        }
    }

    pub fn enable_odo_ram(&mut self) -> Result<(), Error> {
        self.set_cfg(&[("odo", "on")])
    }

    pub fn enable_odo_flash(&mut self) -> Result<(), Error> {
        self.set_cfg_flash(&[("odo", "on")])
    }

    /// Next valid message from the data link, in the current data scheme.
    pub fn read_one_message(&mut self, attempts: usize) -> Result<Option<Message>, Error> {
        for _ in 0..attempts.max(1) {
            if let Some(msg) = self.pending.pop_front() {
                return Ok(Some(msg));
            }
            let data = self.data.read(DATA_READ_SIZE)?;
            if !data.is_empty() {
                let messages = self.decoder.feed(&data);
                self.pending.extend(messages);
            }
        }
        Ok(self.pending.pop_front())
    }

    /// Picks the data scheme from the flash `mfm` setting.
    pub fn setup_data_port(&mut self) -> Result<(), Error> {
        let mfm = self.get_cfg_value("mfm", true)?;
        match SchemeKind::from_mfm(&mfm) {
            Some(scheme) => self.set_data_scheme(scheme),
            None => debug!(
                "unsupported message format {}, keeping {}",
                String::from_utf8_lossy(&mfm),
                self.data_scheme
            ),
        }
        Ok(())
    }

    /// True when the data link streams output messages. Output rate and UART
    /// output are turned on for the check if they were off, then restored.
    pub fn check_data_port(&mut self) -> Result<bool, Error> {
        let mut changed_odr = false;
        let mut changed_uart = false;

        if let Err(e) = self.enable_output(&mut changed_odr, &mut changed_uart) {
            // older firmware rejects some of these settings
            debug!("output setup skipped: {}", e);
        }

        self.data.read_all_available()?;
        self.decoder.reset();
        self.pending.clear();

        let mut found = false;
        for attempt in 0..4 {
            let msg = self.read_one_message(1)?;
            trace!("data port message {}: {:?}", attempt, msg.as_ref().map(|m| m.msgtype));
            if msg.is_some_and(|m| m.valid && m.msgtype.is_streaming()) {
                found = true;
            }
        }

        if changed_odr {
            self.set_cfg_flash(&[("odr", "0")])?;
        }
        if changed_uart {
            self.set_cfg(&[("uart", "off")])?;
        }
        Ok(found)
    }

    fn enable_output(&mut self, changed_odr: &mut bool, changed_uart: &mut bool) -> Result<(), Error> {
        if self.get_cfg_value("odr", true)? == b"0" {
            *changed_odr = true;
            self.set_cfg_flash(&[("odr", "100")])?;
            self.reset_with_waits(None)?;
        }

        self.setup_data_port()?;

        if self.get_cfg_value("uart", false)? == b"off" {
            *changed_uart = true;
            self.set_cfg(&[("uart", "on")])?;
        }
        Ok(())
    }
}

impl Drop for Board {
    fn drop(&mut self) {
        self.release_connections();
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use super::{
        Board, BoardSettings, device_error_is_link_level, device_error_reason, retry,
    };
    use crate::{
        connection::{DummyLink, Link, memory::MemoryLink},
        error::Error,
        message::MsgType,
        scheme::{SchemeKind, readable::checksum},
    };

    pub(crate) fn frame(body: &str) -> Vec<u8> {
        format!("#{}*{:02X}\r\n", body, checksum(body.as_bytes())).into_bytes()
    }

    pub(crate) fn fast_settings() -> BoardSettings {
        BoardSettings {
            response_delay: Duration::ZERO,
            retries: 5,
            timeout: Duration::ZERO,
            reset_wait: Duration::ZERO,
            reset_pings: 3,
        }
    }

    /// Body of the request in `written`, e.g. "APCFG,r,odr".
    pub(crate) fn request_body(written: &[u8]) -> String {
        let text = String::from_utf8_lossy(written);
        text.trim_start_matches('#')
            .split('*')
            .next()
            .unwrap_or_default()
            .to_string()
    }

    /// Streams the same frame on every read, with nothing pending in between.
    pub(crate) struct StreamingLink(pub Vec<u8>);

    impl Link for StreamingLink {
        fn read(&mut self, _: usize) -> Result<Vec<u8>, Error> {
            Ok(self.0.clone())
        }

        fn read_until(&mut self, _: &[u8]) -> Result<Vec<u8>, Error> {
            Ok(self.0.clone())
        }

        fn read_all_available(&mut self) -> Result<Vec<u8>, Error> {
            Ok(Vec::new())
        }

        fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
            Ok(data.len())
        }

        fn data_ready(&mut self) -> Result<bool, Error> {
            Ok(true)
        }

        fn reset_input_buffer(&mut self) -> Result<(), Error> {
            Ok(())
        }

        fn close(&mut self) {}
    }

    fn board(control: &MemoryLink) -> Board {
        Board::with_links(
            Box::new(control.clone()),
            Box::new(DummyLink),
            None,
            fast_settings(),
        )
    }

    #[test]
    fn test_device_errors() {
        assert_eq!(device_error_reason(4), "Invalid Checksum");
        assert_eq!(device_error_reason(11), "Feature Disabled");
        assert_eq!(device_error_reason(0), "Unknown error");
        assert_eq!(device_error_reason(-3), "Unknown error");
        assert!(device_error_is_link_level(1));
        assert!(device_error_is_link_level(10));
        assert!(!device_error_is_link_level(7));
        assert!(!device_error_is_link_level(8));
    }

    #[test]
    fn test_retry_bound() {
        let mut calls = 0;
        let result: Result<(), Error> = retry(5, Error::is_transient, || {
            calls += 1;
            Err(Error::Timeout(MsgType::PNG))
        });
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(calls, 5);

        let mut calls = 0;
        let result: Result<(), Error> = retry(5, Error::is_transient, || {
            calls += 1;
            Err(Error::Discovery)
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);

        let mut calls = 0;
        let result = retry(5, Error::is_transient, || {
            calls += 1;
            if calls < 3 {
                Err(Error::Timeout(MsgType::VER))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_get_cfg() {
        let control = MemoryLink::with_responder(
            921600,
            Box::new(|_, data| {
                let body = request_body(data);
                assert_eq!(body, "APCFG,R,odr,mfm");
                frame("APCFG,odr,100,mfm,4")
            }),
        );
        let mut board = board(&control);
        let configurations = board.get_cfg_flash(&["odr", "mfm"]).unwrap();
        assert_eq!(configurations.get("odr"), Some(&b"100"[..]));
        assert_eq!(configurations.get("mfm"), Some(&b"4"[..]));
    }

    #[test]
    fn test_set_cfg_echo() {
        let control = MemoryLink::with_responder(
            921600,
            Box::new(|_, data| {
                assert_eq!(request_body(data), "APCFG,w,odr,50");
                frame("APCFG,odr,50")
            }),
        );
        let mut board = board(&control);
        board.set_cfg(&[("odr", "50")]).unwrap();
    }

    #[test]
    fn test_semantic_error_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let control = MemoryLink::with_responder(
            921600,
            Box::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                frame("APERR,7")
            }),
        );
        let mut board = board(&control);
        match board.set_cfg(&[("xyz", "1")]) {
            Err(Error::Device { code, reason }) => {
                assert_eq!(code, 7);
                assert_eq!(reason, "Invalid Field");
            },
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_transient_errors_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let control = MemoryLink::with_responder(
            921600,
            Box::new(move |_, _| match counter.fetch_add(1, Ordering::SeqCst) {
                0 => b"#APVER,1.2*00\r\n".to_vec(),
                1 => frame("APERR,4"),
                2 => frame("APSER,A1234"),
                _ => frame("APVER,1.2.3"),
            }),
        );
        let mut board = board(&control);
        assert_eq!(board.get_version().unwrap(), "1.2.3");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_no_response_times_out() {
        let control = MemoryLink::new();
        let mut board = board(&control);
        assert!(matches!(board.get_pid(), Err(Error::Timeout(MsgType::PID))));
        // one request per attempt
        let written = String::from_utf8_lossy(&control.written()).to_string();
        assert_eq!(written.matches("\r\n").count(), 5);
    }

    #[test]
    fn test_reset_and_odometer_do_not_wait() {
        let control = MemoryLink::new();
        let odometer = MemoryLink::new();
        let mut board = Board::with_links(
            Box::new(control.clone()),
            Box::new(DummyLink),
            Some(Box::new(odometer.clone())),
            fast_settings(),
        );
        board.enter_bootloading().unwrap();
        board.send_odometer(1.5).unwrap();
        assert_eq!(control.written(), frame("APRST,2"));
        assert_eq!(odometer.written(), frame("APODO,1.5"));
    }

    #[test]
    fn test_reset_with_waits_bounded() {
        let control = MemoryLink::new();
        let mut board = board(&control);
        assert!(matches!(
            board.reset_with_waits(Some(230400)),
            Err(Error::Timeout(MsgType::PNG))
        ));
        assert_eq!(board.baud, 230400);
        assert_eq!(control.baud(), 230400);
    }

    #[test]
    fn test_check_data_port() {
        let control = MemoryLink::with_responder(
            921600,
            Box::new(|_, data| match request_body(data).as_str() {
                "APCFG,R,odr" => frame("APCFG,odr,100"),
                "APCFG,R,mfm" => frame("APCFG,mfm,1"),
                "APCFG,r,uart" => frame("APCFG,uart,off"),
                "APCFG,w,uart,on" => frame("APCFG,uart,on"),
                "APCFG,w,uart,off" => frame("APCFG,uart,off"),
                other => panic!("unexpected request {}", other),
            }),
        );
        let data = MemoryLink::new();
        let mut board = Board::with_links(
            Box::new(control.clone()),
            Box::new(data.clone()),
            None,
            fast_settings(),
        );
        board.set_data_scheme(SchemeKind::Rtcm);

        // stale bytes are discarded before looking
        data.push(&frame("APIMU,100.5,0.01,0.02,1.0,0.1,0.2,0.3,0.25,0,0,35.5"));
        assert!(!board.check_data_port().unwrap());
        assert_eq!(board.data_scheme(), SchemeKind::Readable);

        board.set_data_link(Box::new(StreamingLink(frame(
            "APIMU,100.5,0.01,0.02,1.0,0.1,0.2,0.3,0.25,0,0,35.5",
        ))));
        assert!(board.check_data_port().unwrap());

        // uart restored after each check
        let written = String::from_utf8_lossy(&control.written()).to_string();
        assert_eq!(written.matches("APCFG,w,uart,off").count(), 2);
    }
}
