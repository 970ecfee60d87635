use std::io::{self, Read, Write};

const CHUNK_SIZE: usize = 8 * 1024;

/// Writes every buffer to `primary` and then to `secondary`, flushing both.
///
/// A `primary` failure is returned to the caller. A `secondary` failure is
/// recorded, the secondary is dropped from further writes, and `primary`
/// keeps receiving the stream.
pub struct TeeWriter<A: Write, B: Write> {
    primary: A,
    secondary: B,
    secondary_error: Option<io::Error>,
}

impl<A: Write, B: Write> TeeWriter<A, B> {
    pub fn new(primary: A, secondary: B) -> Self {
        Self {
            primary,
            secondary,
            secondary_error: None,
        }
    }

    /// The first error the secondary sink returned, if any.
    pub fn secondary_error(&self) -> Option<&io::Error> {
        self.secondary_error.as_ref()
    }

    pub fn into_inner(self) -> (A, B) {
        (self.primary, self.secondary)
    }

    fn mirror(&mut self, buf: &[u8]) {
        if self.secondary_error.is_some() {
            return;
        }
        if let Err(e) = self
            .secondary
            .write_all(buf)
            .and_then(|_| self.secondary.flush())
        {
            self.secondary_error = Some(e);
        }
    }
}

impl<A: Write, B: Write> Write for TeeWriter<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.primary.write_all(buf)?;
        self.primary.flush()?;
        self.mirror(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.primary.flush()?;
        if self.secondary_error.is_none() {
            if let Err(e) = self.secondary.flush() {
                self.secondary_error = Some(e);
            }
        }
        Ok(())
    }
}

/// Copy `reader` into `sink` chunk by chunk until EOF.
///
/// Each chunk is written as soon as the read returns, so carriage-return
/// progress updates reach the sink without waiting for a newline. After a
/// sink failure the reader is still drained so the writing process never
/// blocks on a full pipe; the first error is returned at EOF.
pub fn pump<R: Read, W: Write>(mut reader: R, sink: &mut W) -> io::Result<()> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut first_err = None;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                first_err.get_or_insert(e);
                break;
            }
        };
        if first_err.is_some() {
            continue;
        }
        if let Err(e) = sink.write_all(&buf[..n]) {
            first_err = Some(e);
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
