//! Line-oriented reader over an async byte source, with a bounded line length.

use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

const CHUNK_SIZE: usize = 8192;

pub type Source = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Error, Debug)]
pub enum ReadError {
    #[error("line exceeds the permitted size")]
    LineTooLong,
    #[error("failed to read from stream: {0}")]
    Io(#[from] io::Error),
}

/// Reads newline-delimited documents one at a time.
///
/// Lines longer than `max_line_bytes` are not buffered whole: the reader keeps the
/// first `max_line_bytes` for error reporting, skips the rest up to the newline and
/// reports [`ReadError::LineTooLong`]. The next call resumes with the following line.
/// The limit applies to the line without its `\n` or `\r\n` terminator.
pub struct StreamReader {
    source: Option<Source>,
    max_line_bytes: usize,
    buffer: Box<[u8]>,
    buffer_pos: usize,
    buffer_len: usize,
    line: Vec<u8>,
    eof: bool,
}

impl StreamReader {
    /// The read buffer is only allocated on first use.
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            source: None,
            max_line_bytes,
            buffer: Box::default(),
            buffer_pos: 0,
            buffer_len: 0,
            line: Vec::new(),
            eof: false,
        }
    }

    /// Rebinds the reader to a new source, dropping the previous one. `None` detaches
    /// it entirely.
    pub fn reset(&mut self, source: Option<Source>) {
        self.source = source;
        self.buffer_pos = 0;
        self.buffer_len = 0;
        self.line.clear();
        self.line.shrink_to(CHUNK_SIZE);
        self.eof = false;
    }

    /// Returns the next line without its terminator. An empty slice is either a blank
    /// line or, if [`StreamReader::is_eof`] is now true, the end of the stream.
    pub async fn read_ahead(&mut self) -> Result<&[u8], ReadError> {
        self.line.clear();
        // One byte over the limit leaves room for the `\r` of a CRLF terminator.
        let budget = self.max_line_bytes.saturating_add(1);
        let mut too_long = false;

        loop {
            if self.buffer_pos == self.buffer_len {
                if self.eof {
                    break;
                }
                let Some(source) = self.source.as_mut() else {
                    self.eof = true;
                    break;
                };
                if self.buffer.is_empty() {
                    self.buffer = vec![0; CHUNK_SIZE].into_boxed_slice();
                }
                let read = source.read(&mut self.buffer).await?;
                if read == 0 {
                    self.eof = true;
                    break;
                }
                self.buffer_pos = 0;
                self.buffer_len = read;
            }

            let available = &self.buffer[self.buffer_pos..self.buffer_len];
            match available.iter().position(|b| *b == b'\n') {
                Some(end) => {
                    too_long |= !append_bounded(&mut self.line, &available[..end], budget);
                    self.buffer_pos += end + 1;
                    break;
                }
                None => {
                    too_long |= !append_bounded(&mut self.line, available, budget);
                    self.buffer_pos = self.buffer_len;
                }
            }
        }

        if !too_long && self.line.last() == Some(&b'\r') {
            self.line.pop();
        }
        if too_long || self.line.len() > self.max_line_bytes {
            self.line.truncate(self.max_line_bytes);
            return Err(ReadError::LineTooLong);
        }
        Ok(&self.line)
    }

    /// The line most recently returned by [`StreamReader::read_ahead`], or its
    /// truncated prefix if it was too long.
    pub fn latest_line(&self) -> &[u8] {
        &self.line
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }
}

/// Appends as much of `bytes` as fits under `max`. Returns false if anything was cut.
fn append_bounded(line: &mut Vec<u8>, bytes: &[u8], max: usize) -> bool {
    let room = max.saturating_sub(line.len());
    if bytes.len() <= room {
        line.extend_from_slice(bytes);
        true
    } else {
        line.extend_from_slice(&bytes[..room]);
        false
    }
}

/// Free list of readers sharing one size limit.
pub struct ReaderPool {
    max_line_bytes: usize,
    max_idle: usize,
    idle: Mutex<Vec<StreamReader>>,
}

impl ReaderPool {
    pub fn new(max_line_bytes: usize, max_idle: usize) -> Self {
        Self {
            max_line_bytes,
            max_idle,
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Checks out a reader bound to `source`. It goes back to the pool, detached from
    /// the source, when the handle is dropped.
    pub fn get(&self, source: Source) -> PooledReader<'_> {
        let reader = self
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop();
        let mut reader = reader.unwrap_or_else(|| StreamReader::new(self.max_line_bytes));
        reader.reset(Some(source));
        PooledReader { reader, pool: self }
    }

    pub fn idle_readers(&self) -> usize {
        self.idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    fn put(&self, mut reader: StreamReader) {
        reader.reset(None);
        let mut idle = self
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if idle.len() < self.max_idle {
            idle.push(reader);
        }
    }
}

pub struct PooledReader<'a> {
    reader: StreamReader,
    pool: &'a ReaderPool,
}

impl Deref for PooledReader<'_> {
    type Target = StreamReader;

    fn deref(&self) -> &StreamReader {
        &self.reader
    }
}

impl DerefMut for PooledReader<'_> {
    fn deref_mut(&mut self) -> &mut StreamReader {
        &mut self.reader
    }
}

impl Drop for PooledReader<'_> {
    fn drop(&mut self) {
        let reader = std::mem::replace(&mut self.reader, StreamReader::new(self.pool.max_line_bytes));
        self.pool.put(reader);
    }
}
