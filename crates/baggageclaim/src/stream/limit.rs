//! Byte limit on incoming streams.

use std::io::{self, Read};

/// Reader that fails once more than `limit` bytes have been read.
///
/// A limit of 0 disables the check. The error surfaces through whatever
/// decoder sits on top, so callers check [`LimitedReader::exceeded`] to tell
/// it apart from a malformed stream.
#[derive(Debug)]
pub struct LimitedReader<R> {
    inner: R,
    limit: u64,
    read: u64,
    exceeded: bool,
}

impl<R: Read> LimitedReader<R> {
    /// Wrap `inner` with a byte limit.
    pub const fn new(inner: R, limit: u64) -> Self {
        Self {
            inner,
            limit,
            read: 0,
            exceeded: false,
        }
    }

    /// Whether the limit was hit.
    #[must_use]
    pub const fn exceeded(&self) -> bool {
        self.exceeded
    }

    /// Bytes read so far.
    #[must_use]
    pub const fn bytes_read(&self) -> u64 {
        self.read
    }

    /// The configured limit, 0 meaning unlimited.
    #[must_use]
    pub const fn limit(&self) -> u64 {
        self.limit
    }
}

impl<R: Read> Read for LimitedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.exceeded {
            return Err(limit_error(self.limit));
        }

        let n = self.inner.read(buf)?;
        self.read += n as u64;

        if self.limit > 0 && self.read > self.limit {
            self.exceeded = true;
            return Err(limit_error(self.limit));
        }

        Ok(n)
    }
}

fn limit_error(limit: u64) -> io::Error {
    io::Error::other(format!("stream exceeded limit of {limit} bytes"))
}
