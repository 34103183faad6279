//! Splits a raw byte stream into messages, whatever scheme(s) the device speaks.
use log::debug;

use crate::{
    message::Message,
    scheme::{FrameLen, Scheme, SchemeKind},
};

/// Carried-over bytes beyond this are considered garbage and dropped.
pub const MAX_PARTIAL_LEN: usize = 4096;

/// Result of splitting a buffer with one scheme.
struct Split {
    /// (offset in buffer, message)
    messages: Vec<(usize, Message)>,
    /// Offsets of frames that failed to decode
    rejected: Vec<usize>,
    /// Start of the bytes this scheme cannot account for
    leftover: usize,
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// A scheme only accounts for the frames it decoded: whatever follows the
/// last one may belong to another scheme and stays unclaimed.
fn split_frames(scheme: &dyn Scheme, buf: &[u8]) -> Split {
    let preamble = scheme.preamble();

    let mut split = Split {
        messages: Vec::new(),
        rejected: Vec::new(),
        leftover: 0,
    };

    let mut pos = 0;

    while let Some(rel) = find(&buf[pos..], preamble) {
        let start = pos + rel;
        match scheme.frame_len(&buf[start..]) {
            FrameLen::Complete(len) => {
                let msg = scheme.parse_message(&buf[start..start + len]);
                if msg.valid {
                    split.messages.push((start, msg));
                    pos = start + len;
                    split.leftover = pos;
                } else {
                    split.rejected.push(start);
                    pos = start + 1;
                }
            },
            FrameLen::Incomplete => {
                split.leftover = start;
                break;
            },
            FrameLen::Invalid => {
                pos = start + 1;
            },
        }
    }
    split
}

/// Multi scheme stream decoder.
///
/// Every chunk is scanned by each configured scheme. The carried-over
/// fragment is the shortest tail left unaccounted for by any scheme, which
/// favors the scheme the device is actually speaking. Only its last
/// [MAX_PARTIAL_LEN] bytes are kept.
#[derive(Debug)]
pub struct StreamDecoder {
    schemes: Vec<SchemeKind>,
    partial: Vec<u8>,
    rejected: u64,
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new(&SchemeKind::ALL)
    }
}

impl StreamDecoder {
    pub fn new(schemes: &[SchemeKind]) -> Self {
        Self {
            schemes: schemes.to_vec(),
            partial: Vec::new(),
            rejected: 0,
        }
    }

    /// Decodes as many messages as possible out of previous fragment + `data`.
    /// Returns valid messages, in stream order.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Message> {
        let mut buf = std::mem::take(&mut self.partial);
        buf.extend_from_slice(data);

        let mut messages = Vec::new();
        let mut rejected = Vec::new();
        let mut leftover = 0;

        for kind in self.schemes.iter() {
            let split = split_frames(kind.scheme(), &buf);
            if !split.rejected.is_empty() {
                debug!("{} scheme rejected {} frame(s)", kind, split.rejected.len());
            }
            rejected.extend(split.rejected);
            messages.extend(split.messages);
            leftover = leftover.max(split.leftover);
        }

        // frames in the carried-over tail get rejected again on the next pass
        self.rejected += rejected.iter().filter(|offset| **offset < leftover).count() as u64;

        let tail = &buf[leftover..];
        if tail.len() > MAX_PARTIAL_LEN {
            debug!("dropping {} unframed bytes", tail.len() - MAX_PARTIAL_LEN);
            self.partial = tail[tail.len() - MAX_PARTIAL_LEN..].to_vec();
        } else {
            self.partial = tail.to_vec();
        }

        messages.sort_by_key(|(offset, _)| *offset);
        messages.into_iter().map(|(_, msg)| msg).collect()
    }

    /// Total number of frames that failed to decode.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    /// Bytes carried over to the next [Self::feed].
    pub fn partial(&self) -> &[u8] {
        &self.partial
    }

    pub fn reset(&mut self) {
        self.partial.clear();
    }
}
