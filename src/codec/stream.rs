//! Synchronous reader adapters used on the codec side of the pipelines.

use std::io::{self, BufRead, Read, Seek, SeekFrom, Write};

/// Presents a forward-only stream as seekable.
///
/// Decoders only ask for their position or skip ahead; backward seeks would
/// need the whole payload buffered, so they fail instead.
pub struct ForwardSeek<R> {
    inner: R,
    position: u64,
}

impl<R: BufRead> ForwardSeek<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, position: 0 }
    }

    pub fn position(&self) -> u64 {
        self.position
    }
}

impl<R: BufRead> Read for ForwardSeek<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl<R: BufRead> BufRead for ForwardSeek<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.inner.consume(amt);
        self.position += amt as u64;
    }
}

impl<R: BufRead> Seek for ForwardSeek<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(_) => None,
        };
        let target = match target {
            Some(target) if target >= self.position => target,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "stream only supports forward seeks",
                ))
            }
        };

        let skip = target - self.position;
        let skipped = io::copy(&mut self.by_ref().take(skip), &mut io::sink())?;
        if skipped < skip {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        Ok(self.position)
    }

    fn stream_position(&mut self) -> io::Result<u64> {
        Ok(self.position)
    }
}

/// Copies every byte read from `source` into `sink`, in order.
///
/// A failing sink is detached and the reader keeps serving the source, so
/// the consumer on the read side always gets to finish. Source failures are
/// remembered so callers can tell a broken stream from bad content.
pub struct TeeReader<R, W> {
    source: R,
    sink: Option<W>,
    sink_error: Option<io::Error>,
    source_error: Option<io::Error>,
}

impl<R: Read, W: Write> TeeReader<R, W> {
    pub fn new(source: R, sink: W) -> Self {
        Self {
            source,
            sink: Some(sink),
            sink_error: None,
            source_error: None,
        }
    }

    /// Read the rest of the source through the tee.
    pub fn drain(&mut self) -> io::Result<u64> {
        io::copy(self, &mut io::sink())
    }

    pub fn source_error(&self) -> Option<&io::Error> {
        self.source_error.as_ref()
    }

    pub fn sink_error(&self) -> Option<&io::Error> {
        self.sink_error.as_ref()
    }

    /// Release the sink so its reader observes end of stream.
    pub fn into_sink(self) -> Option<W> {
        self.sink
    }
}

impl<R: Read, W: Write> Read for TeeReader<R, W> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = match self.source.read(buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Err(e),
            Err(e) => {
                self.source_error = Some(io::Error::new(e.kind(), e.to_string()));
                return Err(e);
            }
        };

        if n > 0 {
            if let Some(sink) = self.sink.as_mut() {
                if let Err(e) = sink.write_all(&buf[..n]) {
                    tracing::debug!("tee sink closed, continuing without it: {}", e);
                    self.sink = None;
                    self.sink_error = Some(e);
                }
            }
        }
        Ok(n)
    }
}
