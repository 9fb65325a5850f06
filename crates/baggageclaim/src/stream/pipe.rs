//! Bounded in-memory pipe between a compressing thread and an uploader.

use std::io::{self, Read, Write};

use crossbeam_channel::{Receiver, Sender, bounded};

const CHUNK_SIZE: usize = 64 * 1024;
const CHUNKS_IN_FLIGHT: usize = 4;

type Chunk = io::Result<Vec<u8>>;

/// Create a connected writer/reader pair.
///
/// At most a few chunks are buffered; the writer blocks until the reader
/// catches up. Dropping the reader makes further writes fail with
/// `BrokenPipe`.
#[must_use]
pub fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = bounded(CHUNKS_IN_FLIGHT);
    (
        PipeWriter {
            tx: Some(tx),
            buf: Vec::with_capacity(CHUNK_SIZE),
        },
        PipeReader {
            rx,
            current: Vec::new(),
            pos: 0,
            done: false,
        },
    )
}

/// Writing half of [`pipe`].
#[derive(Debug)]
pub struct PipeWriter {
    tx: Option<Sender<Chunk>>,
    buf: Vec<u8>,
}

impl PipeWriter {
    fn send(&mut self, chunk: Chunk) -> io::Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"))?;
        tx.send(chunk)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader dropped"))
    }

    fn send_buffered(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::replace(&mut self.buf, Vec::with_capacity(CHUNK_SIZE));
        self.send(Ok(chunk))
    }

    /// Flush and signal end of stream.
    ///
    /// # Errors
    ///
    /// Returns `BrokenPipe` if the reader is gone.
    pub fn close(mut self) -> io::Result<()> {
        self.send_buffered()?;
        self.tx = None;
        Ok(())
    }

    /// Deliver `err` to the reader instead of a clean end of stream.
    pub fn close_with_error(mut self, err: io::Error) {
        self.buf.clear();
        // reader may already be gone
        let _ = self.send(Err(err));
        self.tx = None;
    }
}

impl Write for PipeWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let room = CHUNK_SIZE - self.buf.len();
        let n = data.len().min(room);
        self.buf.extend_from_slice(&data[..n]);
        if self.buf.len() == CHUNK_SIZE {
            self.send_buffered()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffered()
    }
}

/// Reading half of [`pipe`].
#[derive(Debug)]
pub struct PipeReader {
    rx: Receiver<Chunk>,
    current: Vec<u8>,
    pos: usize,
    done: bool,
}

impl Read for PipeReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.current.len() {
            if self.done {
                return Ok(0);
            }
            match self.rx.recv() {
                Ok(Ok(chunk)) => {
                    self.current = chunk;
                    self.pos = 0;
                }
                Ok(Err(err)) => {
                    self.done = true;
                    return Err(err);
                }
                Err(_) => {
                    self.done = true;
                    return Ok(0);
                }
            }
        }

        let n = out.len().min(self.current.len() - self.pos);
        out[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfers_large_payload_across_threads() {
        let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
        let (mut writer, mut reader) = pipe();

        let received = std::thread::scope(|scope| {
            scope.spawn(|| {
                writer.write_all(&payload).unwrap();
                writer.close().unwrap();
            });
            let mut out = Vec::new();
            reader.read_to_end(&mut out).unwrap();
            out
        });

        assert_eq!(received, payload);
    }

    #[test]
    fn error_reaches_reader() {
        let (mut writer, mut reader) = pipe();
        writer.write_all(b"partial").unwrap();
        writer.close_with_error(io::Error::other("compression failed"));

        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.to_string(), "compression failed");
    }

    #[test]
    fn dropped_reader_breaks_writer() {
        let (mut writer, reader) = pipe();
        drop(reader);
        let err = writer.write_all(&vec![0; CHUNK_SIZE]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
