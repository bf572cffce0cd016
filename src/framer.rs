//! Turns the raw byte stream coming off a device into lines.

use log::warn;
use std::{
    collections::VecDeque,
    io::{self, Read},
    mem, str,
};

/// An iterator over the newline-terminated lines of a byte stream, with the
/// terminator (and a trailing `\r`, which serial consoles like to add)
/// stripped.
///
/// Lines split across reads are reassembled. There is no bound on line
/// length. The iterator ends when the stream does; a read error is yielded
/// once, after which the iterator is exhausted as well.
pub struct LineFramer<R> {
    inner: R,
    partial: Vec<u8>,
    ready: VecDeque<String>,
    done: bool,
}

impl<R: Read> LineFramer<R> {
    /// Wraps a byte stream.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            partial: Vec::new(),
            ready: VecDeque::new(),
            done: false,
        }
    }
}

fn decode_line(mut raw: &[u8]) -> String {
    if let Some(stripped) = raw.strip_suffix(b"\r") {
        raw = stripped;
    }
    match str::from_utf8(raw) {
        Ok(s) => s.to_owned(),
        // Often happens at the beginning of transmission when there is
        // still garbage in the device's buffer
        Err(e) => {
            warn!("Failed to decode utf-8: {:?}", e);
            String::from_utf8_lossy(raw).into_owned()
        }
    }
}

impl<R: Read> Iterator for LineFramer<R> {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut buffer = [0; 256];
        loop {
            if let Some(line) = self.ready.pop_front() {
                return Some(Ok(line));
            }
            if self.done {
                return None;
            }

            let read_len = match self.inner.read(&mut buffer) {
                Ok(n) => n,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
                    ) =>
                {
                    continue
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };

            if read_len == 0 {
                self.done = true;
                if !self.partial.is_empty() {
                    let rest = mem::take(&mut self.partial);
                    return Some(Ok(decode_line(&rest)));
                }
                continue;
            }

            for &c in buffer.iter().take(read_len) {
                if c == b'\n' {
                    let raw = mem::take(&mut self.partial);
                    self.ready.push_back(decode_line(&raw));
                } else {
                    self.partial.push(c);
                }
            }
        }
    }
}
