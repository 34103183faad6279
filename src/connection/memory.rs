//! In memory [Link], scripted by tests.
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use crate::{connection::Link, error::Error};

/// Produces the device answer to one write, given the current baud rate.
pub(crate) type Responder = Box<dyn FnMut(u32, &[u8]) -> Vec<u8> + Send>;

#[derive(Default)]
struct Shared {
    inbound: VecDeque<u8>,
    written: Vec<u8>,
    baud: u32,
    closed: bool,
}

#[derive(Clone, Default)]
pub(crate) struct MemoryLink {
    shared: Arc<Mutex<Shared>>,
    responder: Option<Arc<Mutex<Responder>>>,
}

impl MemoryLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responder(baud: u32, responder: Responder) -> Self {
        let link = Self {
            shared: Default::default(),
            responder: Some(Arc::new(Mutex::new(responder))),
        };
        link.shared.lock().unwrap().baud = baud;
        link
    }

    /// Queues bytes for the next reads.
    pub fn push(&self, data: &[u8]) {
        self.shared.lock().unwrap().inbound.extend(data);
    }

    pub fn written(&self) -> Vec<u8> {
        self.shared.lock().unwrap().written.clone()
    }

    pub fn baud(&self) -> u32 {
        self.shared.lock().unwrap().baud
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().unwrap().closed
    }

    fn drain(&self, size: usize) -> Vec<u8> {
        let mut shared = self.shared.lock().unwrap();
        let size = size.min(shared.inbound.len());
        shared.inbound.drain(..size).collect()
    }
}

impl Link for MemoryLink {
    fn read(&mut self, size: usize) -> Result<Vec<u8>, Error> {
        Ok(self.drain(size))
    }

    fn read_until(&mut self, delimiter: &[u8]) -> Result<Vec<u8>, Error> {
        let mut shared = self.shared.lock().unwrap();
        let mut data = Vec::new();
        while let Some(byte) = shared.inbound.pop_front() {
            data.push(byte);
            if data.ends_with(delimiter) {
                break;
            }
        }
        Ok(data)
    }

    fn read_all_available(&mut self) -> Result<Vec<u8>, Error> {
        Ok(self.drain(usize::MAX))
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        let baud = {
            let mut shared = self.shared.lock().unwrap();
            if shared.closed {
                return Err(Error::Closed);
            }
            shared.written.extend_from_slice(data);
            shared.baud
        };
        if let Some(responder) = &self.responder {
            let answer = {
                let mut guard = responder.lock().unwrap();
                let respond: &mut Responder = &mut guard;
                respond(baud, data)
            };
            self.push(&answer);
        }
        Ok(data.len())
    }

    fn data_ready(&mut self) -> Result<bool, Error> {
        Ok(!self.shared.lock().unwrap().inbound.is_empty())
    }

    fn reset_input_buffer(&mut self) -> Result<(), Error> {
        self.shared.lock().unwrap().inbound.clear();
        Ok(())
    }

    fn close(&mut self) {
        self.shared.lock().unwrap().closed = true;
    }

    fn set_baud(&mut self, baud: u32) -> Result<(), Error> {
        self.shared.lock().unwrap().baud = baud;
        Ok(())
    }
}
