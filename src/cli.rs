use std::{
    io::{BufRead, Write},
    net::IpAddr,
    path::PathBuf,
};

use clap::{Arg, ArgAction, ArgMatches, ColorChoice, Command, value_parser};
use itertools::Itertools;

use boardlink::prelude::{NtripConfig, PortPicker};

/// Where the session comes from.
pub enum Source {
    /// Search ports and baud rates
    Auto,
    /// Known serial ports
    Serial {
        control: String,
        data: Option<String>,
        baud: u32,
    },
    /// Ethernet unit
    Udp {
        ip: IpAddr,
        data: u16,
        control: Option<u16>,
        odometer: Option<u16>,
    },
    /// Replays a recorded stream, no device
    File(PathBuf),
}

pub struct Cli {
    /// Arguments passed by user
    matches: ArgMatches,
}

impl Cli {
    /// Build new command line interface
    pub fn new() -> Self {
        Self {
            matches: {
                Command::new("boardlink")
                    .version(env!("CARGO_PKG_VERSION"))
                    .about("Inertial/GNSS unit streaming, logging and NTRIP relay")
                    .color(ColorChoice::Always)
                    .next_help_heading("Serial ports")
                    .arg(
                        Arg::new("port")
                            .short('p')
                            .long("port")
                            .value_name("PORT")
                            .conflicts_with_all(["udp", "file"])
                            .help("Control (configuration) port. Example /dev/ttyUSB3 on Linux.
Ports are searched for when omitted."),
                    )
                    .arg(
                        Arg::new("data-port")
                            .short('d')
                            .long("data-port")
                            .value_name("PORT")
                            .requires("port")
                            .help("Data port, when the unit streams on a dedicated port"),
                    )
                    .arg(
                        Arg::new("baudrate")
                            .short('b')
                            .long("baud")
                            .value_name("Baudrate (u32)")
                            .value_parser(value_parser!(u32))
                            .help("Serial port baud rate. By default we use 921_600"),
                    )
                    .arg(
                        Arg::new("no-data-port")
                            .long("no-data-port")
                            .action(ArgAction::SetTrue)
                            .help("The unit streams on its control port"),
                    )
                    .arg(
                        Arg::new("cache")
                            .long("cache")
                            .value_name("DIRECTORY")
                            .help("Directory where the last working connection and caster are saved.
Defaults to the current directory."),
                    )
                    .next_help_heading("Ethernet")
                    .arg(
                        Arg::new("udp")
                            .long("udp")
                            .value_name("IP")
                            .value_parser(value_parser!(IpAddr))
                            .conflicts_with("file")
                            .help("Unit IP address"),
                    )
                    .arg(
                        Arg::new("udp-data")
                            .long("udp-data")
                            .value_name("PORT")
                            .value_parser(value_parser!(u16))
                            .requires("udp")
                            .help("Remote data port"),
                    )
                    .arg(
                        Arg::new("udp-config")
                            .long("udp-config")
                            .value_name("PORT")
                            .value_parser(value_parser!(u16))
                            .requires("udp")
                            .help("Remote configuration port"),
                    )
                    .arg(
                        Arg::new("udp-odometer")
                            .long("udp-odometer")
                            .value_name("PORT")
                            .value_parser(value_parser!(u16))
                            .requires("udp")
                            .help("Remote odometer port"),
                    )
                    .next_help_heading("File interface (Passive mode)")
                    .arg(
                        Arg::new("file")
                            .long("file")
                            .short('f')
                            .value_name("FILENAME")
                            .value_parser(value_parser!(PathBuf))
                            .help("Replay a recorded stream"),
                    )
                    .next_help_heading("Logging")
                    .arg(
                        Arg::new("log")
                            .short('l')
                            .long("log")
                            .value_name("NAME")
                            .help("Log raw output to logs/<year>_<month>/<day>/NAME"),
                    )
                    .arg(
                        Arg::new("logs")
                            .long("logs")
                            .value_name("DIRECTORY")
                            .help("Log root directory. Default is \"logs\""),
                    )
                    .arg(
                        Arg::new("gzip")
                            .long("gzip")
                            .action(ArgAction::SetTrue)
                            .requires("log")
                            .help("Gzip compress the log"),
                    )
                    .next_help_heading("NTRIP corrections")
                    .arg(
                        Arg::new("caster")
                            .long("caster")
                            .value_name("HOST")
                            .requires_all(["mountpoint", "user", "password"])
                            .help("NTRIP caster"),
                    )
                    .arg(
                        Arg::new("caster-port")
                            .long("caster-port")
                            .value_name("PORT")
                            .value_parser(value_parser!(u16))
                            .default_value("2101")
                            .help("NTRIP caster port"),
                    )
                    .arg(
                        Arg::new("mountpoint")
                            .long("mountpoint")
                            .value_name("MOUNTPOINT")
                            .requires("caster"),
                    )
                    .arg(
                        Arg::new("user")
                            .long("user")
                            .value_name("USERNAME")
                            .requires("caster"),
                    )
                    .arg(
                        Arg::new("password")
                            .long("password")
                            .value_name("PASSWORD")
                            .requires("caster"),
                    )
                    .arg(
                        Arg::new("gga")
                            .long("gga")
                            .action(ArgAction::SetTrue)
                            .help("Send our position to the caster. Some mountpoints require it."),
                    )
                    .arg(
                        Arg::new("ntrip")
                            .long("ntrip")
                            .action(ArgAction::SetTrue)
                            .conflicts_with("caster")
                            .help("Use the caster saved by a previous --save-ntrip"),
                    )
                    .arg(
                        Arg::new("save-ntrip")
                            .long("save-ntrip")
                            .action(ArgAction::SetTrue)
                            .requires("caster")
                            .help("Save this caster for later sessions"),
                    )
                    .get_matches()
            },
        }
    }

    pub fn source(&self) -> Source {
        if let Some(path) = self.matches.get_one::<PathBuf>("file") {
            Source::File(path.clone())
        } else if let Some(ip) = self.matches.get_one::<IpAddr>("udp") {
            Source::Udp {
                ip: *ip,
                data: self.matches.get_one::<u16>("udp-data").copied().unwrap_or(1),
                control: self.matches.get_one::<u16>("udp-config").copied(),
                odometer: self.matches.get_one::<u16>("udp-odometer").copied(),
            }
        } else if let Some(control) = self.matches.get_one::<String>("port") {
            Source::Serial {
                control: control.to_string(),
                data: self.matches.get_one::<String>("data-port").cloned(),
                baud: self.baud_rate().unwrap_or(boardlink::board::DEFAULT_BAUD),
            }
        } else {
            Source::Auto
        }
    }

    /// Returns User baud rate specification
    pub fn baud_rate(&self) -> Option<u32> {
        self.matches.get_one::<u32>("baudrate").copied()
    }

    pub fn use_data_port(&self) -> bool {
        !self.matches.get_flag("no-data-port")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.matches
            .get_one::<String>("cache")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn log_root(&self) -> PathBuf {
        self.matches
            .get_one::<String>("logs")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("logs"))
    }

    /// Log name and compression
    pub fn log(&self) -> Option<(&str, bool)> {
        let name = self.matches.get_one::<String>("log")?;
        Some((name, self.matches.get_flag("gzip")))
    }

    /// Caster described on the command line.
    pub fn ntrip_config(&self) -> Option<NtripConfig> {
        let caster = self.matches.get_one::<String>("caster")?;
        Some(NtripConfig {
            caster: caster.to_string(),
            port: self
                .matches
                .get_one::<u16>("caster-port")
                .copied()
                .unwrap_or(2101),
            mountpoint: self.matches.get_one::<String>("mountpoint")?.to_string(),
            username: self.matches.get_one::<String>("user")?.to_string(),
            password: self.matches.get_one::<String>("password")?.to_string(),
            gga: self.matches.get_flag("gga"),
        })
    }

    pub fn saved_ntrip(&self) -> bool {
        self.matches.get_flag("ntrip")
    }

    pub fn save_ntrip(&self) -> bool {
        self.matches.get_flag("save-ntrip")
    }
}

/// Manual port selection on the terminal.
pub struct StdinPicker;

impl PortPicker for StdinPicker {
    fn pick(&mut self, prompt: &str, ports: &[String]) -> Option<String> {
        if ports.is_empty() {
            return None;
        }

        let listing = ports
            .iter()
            .enumerate()
            .map(|(i, port)| format!("  {}: {}", i + 1, port))
            .join("\n");

        let mut stdout = std::io::stdout();
        let _ = write!(stdout, "{}\n{}\nselect 1-{}: ", prompt, listing, ports.len());
        let _ = stdout.flush();

        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line).ok()?;

        let index = line.trim().parse::<usize>().ok()?;
        ports.get(index.checked_sub(1)?).cloned()
    }
}
