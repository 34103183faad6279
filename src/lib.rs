#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod board;
pub mod connection;
pub mod error;
pub mod ioloop;
pub mod message;
pub mod scheme;
pub mod stream;

pub mod prelude {
    pub use crate::{
        board::{Board, BoardSettings, ConnectionCache, PortOpener, PortPicker, SystemPorts},
        connection::{Connection, ConnectionSettings, Link},
        error::Error,
        ioloop::{
            IoHandle, IoLoop, IoStatus, NtripState,
            ntrip::{NtripConfig, NtripError},
        },
        message::{Configurations, Message, MsgType, ParseError, Value},
        scheme::{BinaryScheme, ReadableScheme, RtcmScheme, Scheme, SchemeKind},
        stream::StreamDecoder,
    };
}
