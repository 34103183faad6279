//! Last working connection, persisted as JSON.
use std::{
    fs::File,
    io::{BufReader, BufWriter, ErrorKind, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::Error;

pub const CACHE_WITH_DATA_PORT: &str = "connection_cache_dataport.json";
pub const CACHE_NO_DATA_PORT: &str = "connection_cache_no_dataport.json";

/// `{"control_port": str, "data_port": str|null, "baud": int}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionCache {
    pub control_port: String,
    #[serde(default)]
    pub data_port: Option<String>,
    pub baud: u32,
}

impl ConnectionCache {
    /// One file per session kind.
    pub fn path(dir: &Path, use_data_port: bool) -> PathBuf {
        dir.join(if use_data_port {
            CACHE_WITH_DATA_PORT
        } else {
            CACHE_NO_DATA_PORT
        })
    }

    /// None when nothing was cached yet.
    pub fn load(dir: &Path, use_data_port: bool) -> Result<Option<Self>, Error> {
        let fd = match File::open(Self::path(dir, use_data_port)) {
            Ok(fd) => fd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let cache = serde_json::from_reader(BufReader::new(fd))?;
        Ok(Some(cache))
    }

    pub fn save(&self, dir: &Path, use_data_port: bool) -> Result<(), Error> {
        std::fs::create_dir_all(dir)?;
        let fd = File::create(Self::path(dir, use_data_port))?;
        let mut writer = BufWriter::new(fd);
        serde_json::to_writer(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::ConnectionCache;

    #[test]
    fn test_cache_files() {
        let dir = std::env::temp_dir().join("boardlink-cache-files");
        let _ = std::fs::remove_dir_all(&dir);

        assert!(ConnectionCache::load(&dir, true).unwrap().is_none());

        let with_data = ConnectionCache {
            control_port: "/dev/ttyUSB3".to_string(),
            data_port: Some("/dev/ttyUSB0".to_string()),
            baud: 921600,
        };
        with_data.save(&dir, true).unwrap();

        let control_only = ConnectionCache {
            control_port: "COM4".to_string(),
            data_port: None,
            baud: 230400,
        };
        control_only.save(&dir, false).unwrap();

        assert_eq!(ConnectionCache::load(&dir, true).unwrap(), Some(with_data));
        assert_eq!(ConnectionCache::load(&dir, false).unwrap(), Some(control_only));

        let content = std::fs::read_to_string(ConnectionCache::path(&dir, false)).unwrap();
        assert_eq!(
            content,
            r#"{"control_port":"COM4","data_port":null,"baud":230400}"#
        );

        std::fs::write(ConnectionCache::path(&dir, true), "not json").unwrap();
        assert!(ConnectionCache::load(&dir, true).is_err());
    }
}
