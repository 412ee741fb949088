//! ASCII armor.
//!
//! ```text
//! BEGIN SIGIL ENCRYPTED MESSAGE.
//! <base64, 64 columns>
//! .
//! END SIGIL ENCRYPTED MESSAGE.
//! ```
//!
//! Both halves stream: the writer encodes in 48-byte groups and the reader
//! decodes in 4-character groups, so neither buffers the whole message.

use std::io::{self, BufRead, BufReader, Read, Write};

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::wire::{ARMOR_ENCRYPTED_FOOTER, ARMOR_ENCRYPTED_HEADER};

const LINE_BYTES: usize = 48;
const DECODE_CHARS: usize = 1024;

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

pub struct ArmorWriter<W: Write> {
    inner: W,
    pending: Vec<u8>,
    started: bool,
}

impl<W: Write> ArmorWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            pending: Vec::with_capacity(LINE_BYTES),
            started: false,
        }
    }

    fn start(&mut self) -> io::Result<()> {
        if !self.started {
            self.inner.write_all(ARMOR_ENCRYPTED_HEADER.as_bytes())?;
            self.inner.write_all(b"\n")?;
            self.started = true;
        }
        Ok(())
    }

    fn emit_line(&mut self, bytes: &[u8]) -> io::Result<()> {
        let line = STANDARD.encode(bytes);
        self.inner.write_all(line.as_bytes())?;
        self.inner.write_all(b"\n")
    }

    /// Flush the tail, write the terminator and footer, and hand back the sink.
    pub fn finish(mut self) -> io::Result<W> {
        self.start()?;
        if !self.pending.is_empty() {
            let tail = std::mem::take(&mut self.pending);
            self.emit_line(&tail)?;
        }
        self.inner.write_all(b".\n")?;
        self.inner.write_all(ARMOR_ENCRYPTED_FOOTER.as_bytes())?;
        self.inner.write_all(b"\n")?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for ArmorWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.start()?;
        self.pending.extend_from_slice(buf);
        let full = self.pending.len() - self.pending.len() % LINE_BYTES;
        if full > 0 {
            let ready: Vec<u8> = self.pending.drain(..full).collect();
            for line in ready.chunks(LINE_BYTES) {
                self.emit_line(line)?;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

pub struct ArmorReader<R: Read> {
    inner: BufReader<R>,
    decoded: Vec<u8>,
    pos: usize,
    terminated: bool,
}

impl<R: Read> ArmorReader<R> {
    /// Consume the header line; fails if the input is not native armor.
    pub fn new(inner: R) -> io::Result<Self> {
        let mut inner = BufReader::new(inner);
        skip_whitespace(&mut inner)?;
        let mut header = vec![0u8; ARMOR_ENCRYPTED_HEADER.len()];
        inner.read_exact(&mut header)?;
        if header != ARMOR_ENCRYPTED_HEADER.as_bytes() {
            return Err(invalid("missing armor header"));
        }
        Ok(Self {
            inner,
            decoded: Vec::new(),
            pos: 0,
            terminated: false,
        })
    }

    fn fill(&mut self) -> io::Result<()> {
        let mut text = Vec::with_capacity(DECODE_CHARS);
        while !self.terminated && text.len() < DECODE_CHARS {
            let buf = self.inner.fill_buf()?;
            if buf.is_empty() {
                return Err(invalid("armor ended before terminator"));
            }
            let mut used = 0;
            for &b in buf {
                used += 1;
                if b == b'.' {
                    self.terminated = true;
                    break;
                }
                if b.is_ascii_whitespace() {
                    continue;
                }
                text.push(b);
                if text.len() == DECODE_CHARS {
                    break;
                }
            }
            self.inner.consume(used);
        }

        if self.terminated {
            self.read_footer()?;
        }
        self.decoded = STANDARD
            .decode(&text)
            .map_err(|_| invalid("bad base64 in armor"))?;
        self.pos = 0;
        Ok(())
    }

    fn read_footer(&mut self) -> io::Result<()> {
        skip_whitespace(&mut self.inner)?;
        let mut footer = vec![0u8; ARMOR_ENCRYPTED_FOOTER.len()];
        self.inner
            .read_exact(&mut footer)
            .map_err(|_| invalid("missing armor footer"))?;
        if footer != ARMOR_ENCRYPTED_FOOTER.as_bytes() {
            return Err(invalid("bad armor footer"));
        }
        let mut rest = Vec::new();
        self.inner.read_to_end(&mut rest)?;
        if !rest.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(invalid("data after armor footer"));
        }
        Ok(())
    }
}

impl<R: Read> Read for ArmorReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.decoded.len() {
            if self.terminated {
                return Ok(0);
            }
            self.fill()?;
        }
        let n = out.len().min(self.decoded.len() - self.pos);
        out[..n].copy_from_slice(&self.decoded[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

fn skip_whitespace<R: BufRead>(r: &mut R) -> io::Result<()> {
    loop {
        let buf = r.fill_buf()?;
        if buf.is_empty() {
            return Ok(());
        }
        let n = buf.iter().take_while(|b| b.is_ascii_whitespace()).count();
        let exhausted = n == buf.len();
        r.consume(n);
        if !exhausted {
            return Ok(());
        }
    }
}
