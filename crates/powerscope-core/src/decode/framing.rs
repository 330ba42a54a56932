//! NUL-delimited record framing.
//!
//! Frames are bounded: bytes beyond `limit` are counted but not buffered, so
//! a stream that never sends a delimiter cannot grow memory without bound.

use std::io::{self, BufRead};

/// One unit of framed input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A record with surrounding whitespace removed. Never empty.
    Record(Vec<u8>),
    /// A record that exceeded the limit and was skipped.
    Oversized {
        /// Size of the skipped record in bytes.
        size: usize,
    },
}

/// Splits a byte stream into NUL-delimited records.
///
/// Whitespace around each record is trimmed and empty records are skipped.
/// A final record without a trailing NUL is still delivered at end of
/// stream.
#[derive(Debug)]
pub struct RecordFramer<R> {
    reader: R,
    limit: usize,
    done: bool,
}

impl<R: BufRead> RecordFramer<R> {
    /// Frame `reader`, skipping records larger than `limit` bytes.
    pub const fn new(reader: R, limit: usize) -> Self {
        Self {
            reader,
            limit,
            done: false,
        }
    }

    /// Read the next frame. `Ok(None)` means end of stream.
    ///
    /// # Errors
    ///
    /// Returns the underlying read error. `Interrupted` is retried.
    pub fn next_frame(&mut self) -> io::Result<Option<Frame>> {
        loop {
            if self.done {
                return Ok(None);
            }

            let mut buf = Vec::new();
            let mut size = 0usize;
            let mut oversized = false;

            loop {
                let (consumed, delimited) = {
                    let available = match self.reader.fill_buf() {
                        Ok(available) => available,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            self.done = true;
                            return Err(e);
                        },
                    };
                    if available.is_empty() {
                        self.done = true;
                        break;
                    }

                    let (chunk, consumed, delimited) =
                        match available.iter().position(|&b| b == 0) {
                            Some(i) => (&available[..i], i + 1, true),
                            None => (available, available.len(), false),
                        };

                    size += chunk.len();
                    if !oversized {
                        if size > self.limit {
                            oversized = true;
                            buf = Vec::new();
                        } else {
                            buf.extend_from_slice(chunk);
                        }
                    }
                    (consumed, delimited)
                };

                self.reader.consume(consumed);
                if delimited {
                    break;
                }
            }

            if oversized {
                return Ok(Some(Frame::Oversized { size }));
            }

            let record = buf.trim_ascii();
            if !record.is_empty() {
                return Ok(Some(Frame::Record(record.to_vec())));
            }
        }
    }
}

impl<R: BufRead> Iterator for RecordFramer<R> {
    type Item = io::Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame().transpose()
    }
}
