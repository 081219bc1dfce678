//! Cursor over received AT text.
//!
//! A [`Params`] walks the parameters of one response or URC line. Parameters
//! are separated by the configured delimiter and the line ends at the stop tag
//! (`\r\n`). Quoted values are opaque: delimiters and stop tags inside quotes
//! are part of the value.
//!
//! The cursor never blocks. When a value runs past the end of the buffered
//! bytes the read fails with [`Error::Parse`] and [`Params::incomplete`] is set,
//! which the async client uses to wait for more bytes and retry.

use crate::error::Error;

/// Terminator of every response and URC line.
pub const STOP_TAG: &[u8] = b"\r\n";

pub(crate) const QUOTE: u8 = b'"';

pub struct Params<'b> {
    buf: &'b [u8],
    pos: usize,
    delimiter: u8,
    ignore_stop_tag: bool,
    stop_hit: bool,
    incomplete: bool,
}

impl<'b> Params<'b> {
    pub(crate) fn new(buf: &'b [u8], delimiter: u8, ignore_stop_tag: bool, stop_hit: bool) -> Self {
        Self {
            buf,
            pos: 0,
            delimiter,
            ignore_stop_tag,
            stop_hit,
            incomplete: false,
        }
    }

    /// Cursor over one complete line, terminator included.
    ///
    /// This is what URC handlers are given; it is public so handlers can be
    /// exercised without a client.
    pub fn line(buf: &'b [u8], delimiter: u8) -> Self {
        Self::new(buf, delimiter, false, false)
    }

    /// Bytes consumed so far.
    pub fn consumed(&self) -> usize {
        self.pos
    }

    /// Whether the last failed read ran out of buffered bytes.
    pub fn incomplete(&self) -> bool {
        self.incomplete
    }

    /// Whether the stop tag of the line has been reached.
    pub fn stop_hit(&self) -> bool {
        self.stop_hit
    }

    pub fn remaining(&self) -> &'b [u8] {
        &self.buf[self.pos..]
    }

    /// Reads a decimal integer, saturating at the `i32` range.
    pub fn read_int(&mut self) -> Result<i32, Error> {
        let (start, end) = self.scan_value(None)?;
        parse_int(&self.buf[start..end]).ok_or(Error::Parse)
    }

    /// Reads an unsigned decimal integer, saturating at `u64::MAX`.
    pub fn read_u64(&mut self) -> Result<u64, Error> {
        let (start, end) = self.scan_value(None)?;
        parse_u64(&self.buf[start..end]).ok_or(Error::Parse)
    }

    /// Reads a quoted or unquoted string into `out`, returning its length.
    ///
    /// With `None` the value is parsed and discarded. While the stop tag is
    /// ignored, a read into a buffer ends once the buffer is full, so an
    /// embedded `\r\n` is taken as data.
    pub fn read_string(&mut self, out: Option<&mut [u8]>) -> Result<usize, Error> {
        let limit = if self.ignore_stop_tag {
            out.as_ref().map(|o| o.len())
        } else {
            None
        };
        let (start, end) = self.scan_value(limit)?;
        let value = &self.buf[start..end];
        if let Some(out) = out {
            if value.len() > out.len() {
                return Err(Error::Overflow);
            }
            out[..value.len()].copy_from_slice(value);
        }
        Ok(value.len())
    }

    /// Borrows the next string value straight out of the line.
    pub fn read_str(&mut self) -> Result<&'b str, Error> {
        let (start, end) = self.scan_value(None)?;
        core::str::from_utf8(&self.buf[start..end]).map_err(|_| Error::Parse)
    }

    /// Reads `len` bytes.
    ///
    /// `standalone` bytes are taken raw, with no regard for delimiters, quotes
    /// or the stop tag. Otherwise the bytes form a parameter: the read stops
    /// early at a delimiter or the stop tag and consumes a trailing delimiter.
    pub fn read_bytes(
        &mut self,
        mut out: Option<&mut [u8]>,
        len: usize,
        standalone: bool,
    ) -> Result<usize, Error> {
        if out.as_ref().is_some_and(|o| o.len() < len) {
            return Err(Error::InvalidParameter);
        }

        let start = self.pos;
        if standalone {
            if self.buf.len() - start < len {
                return self.need_more();
            }
            if let Some(out) = out.as_deref_mut() {
                out[..len].copy_from_slice(&self.buf[start..start + len]);
            }
            self.pos += len;
            self.stop_hit = false;
            return Ok(len);
        }

        self.ensure_open()?;
        let mut i = start;
        loop {
            if i - start == len {
                self.finish(i, true)?;
                break;
            }
            if i >= self.buf.len() {
                return self.need_more();
            }
            if self.buf[i] == self.delimiter {
                self.finish(i, false)?;
                break;
            }
            if !self.ignore_stop_tag {
                match self.is_stop_tag(i) {
                    None => return self.need_more(),
                    Some(true) => {
                        self.finish(i, false)?;
                        break;
                    }
                    Some(false) => {}
                }
            }
            i += 1;
        }

        if let Some(out) = out.as_deref_mut() {
            out[..i - start].copy_from_slice(&self.buf[start..i]);
        }
        Ok(i - start)
    }

    /// Reads everything up to the stop tag, ignoring delimiters and quotes.
    pub fn read_line(&mut self, out: Option<&mut [u8]>) -> Result<usize, Error> {
        self.ensure_open()?;
        let start = self.pos;
        let mut i = start;
        loop {
            if i >= self.buf.len() {
                return self.need_more();
            }
            match self.is_stop_tag(i) {
                None => return self.need_more(),
                Some(true) => break,
                Some(false) => i += 1,
            }
        }

        let value = &self.buf[start..i];
        if let Some(out) = out {
            if value.len() > out.len() {
                return Err(Error::Overflow);
            }
            out[..value.len()].copy_from_slice(value);
        }
        self.pos = i;
        self.stop_hit = true;
        Ok(value.len())
    }

    /// Skips `count` parameters without materialising them.
    pub fn skip_parameters(&mut self, count: usize) -> Result<(), Error> {
        for _ in 0..count {
            self.scan_value(None)?;
        }
        Ok(())
    }

    /// Skips `count` raw bytes, stopping early at the stop tag.
    ///
    /// Delimiters inside the skipped range are consumed like any other byte,
    /// and a delimiter immediately following the range is consumed as well.
    /// This is a raw skip: it changes how many parameters remain on the line.
    pub fn skip_bytes(&mut self, count: usize) -> Result<usize, Error> {
        self.ensure_open()?;
        let start = self.pos;
        let mut i = start;
        while i - start < count {
            if i >= self.buf.len() {
                return self.need_more();
            }
            if !self.ignore_stop_tag {
                match self.is_stop_tag(i) {
                    None => return self.need_more(),
                    Some(true) => {
                        self.pos = i;
                        self.stop_hit = true;
                        return Ok(i - start);
                    }
                    Some(false) => {}
                }
            }
            i += 1;
        }

        if i >= self.buf.len() {
            return self.need_more();
        }
        if self.buf[i] == self.delimiter {
            i += 1;
        } else if !self.ignore_stop_tag {
            match self.is_stop_tag(i) {
                None => return self.need_more(),
                Some(true) => self.stop_hit = true,
                Some(false) => {}
            }
        }
        self.pos = i;
        Ok(count)
    }

    fn need_more<T>(&mut self) -> Result<T, Error> {
        self.incomplete = true;
        Err(Error::Parse)
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.stop_hit {
            Err(Error::Parse)
        } else {
            Ok(())
        }
    }

    /// `None` when a trailing `\r` could still be the start of the stop tag.
    fn is_stop_tag(&self, i: usize) -> Option<bool> {
        if self.buf[i] != STOP_TAG[0] {
            return Some(false);
        }
        self.buf.get(i + 1).map(|&b| b == STOP_TAG[1])
    }

    /// Locates the next value, returning its bounds with quotes stripped.
    fn scan_value(&mut self, limit: Option<usize>) -> Result<(usize, usize), Error> {
        self.ensure_open()?;

        let mut i = self.pos;
        while i < self.buf.len() && self.buf[i] == b' ' {
            i += 1;
        }
        if i >= self.buf.len() {
            return self.need_more();
        }

        let quoted = self.buf[i] == QUOTE;
        if quoted {
            i += 1;
        }
        let start = i;

        loop {
            if limit.is_some_and(|l| i - start >= l) {
                let end = i;
                if quoted && self.buf.get(i) == Some(&QUOTE) {
                    i += 1;
                }
                self.finish(i, true)?;
                return Ok((start, end));
            }
            if i >= self.buf.len() {
                return self.need_more();
            }

            let c = self.buf[i];
            if quoted {
                if c == QUOTE {
                    self.finish(i + 1, false)?;
                    return Ok((start, i));
                }
            } else if c == self.delimiter {
                self.finish(i, false)?;
                return Ok((start, i));
            } else if !self.ignore_stop_tag {
                match self.is_stop_tag(i) {
                    None => return self.need_more(),
                    Some(true) => {
                        self.finish(i, false)?;
                        return Ok((start, i));
                    }
                    Some(false) => {}
                }
            }
            i += 1;
        }
    }

    /// Consumes what follows a value: a delimiter, or stops in front of the
    /// stop tag. A value that ended on a length bound leaves anything else in
    /// place; otherwise stray bytes up to the next boundary are dropped.
    fn finish(&mut self, mut i: usize, bounded: bool) -> Result<(), Error> {
        loop {
            if i >= self.buf.len() {
                return self.need_more();
            }
            if self.buf[i] == self.delimiter {
                self.pos = i + 1;
                return Ok(());
            }
            match self.is_stop_tag(i) {
                None => return self.need_more(),
                Some(true) => {
                    self.pos = i;
                    self.stop_hit = true;
                    return Ok(());
                }
                Some(false) => {}
            }
            if bounded {
                self.pos = i;
                return Ok(());
            }
            i += 1;
        }
    }
}

fn trim(mut value: &[u8]) -> &[u8] {
    while let [b' ', rest @ ..] = value {
        value = rest;
    }
    while let [rest @ .., b' '] = value {
        value = rest;
    }
    value
}

pub(crate) fn parse_int(value: &[u8]) -> Option<i32> {
    let value = trim(value);
    let (negative, digits) = match value {
        [b'-', rest @ ..] => (true, rest),
        [b'+', rest @ ..] => (false, rest),
        _ => (false, value),
    };
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }

    let ceiling = i64::from(i32::MAX) + 1;
    let magnitude = digits
        .iter()
        .fold(0i64, |acc, d| (acc * 10 + i64::from(d - b'0')).min(ceiling));
    let signed = if negative { -magnitude } else { magnitude };
    Some(signed.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32)
}

pub(crate) fn parse_u64(value: &[u8]) -> Option<u64> {
    let value = trim(value);
    let digits = value.strip_prefix(b"+").unwrap_or(value);
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    Some(digits.iter().fold(0u64, |acc, d| {
        acc.saturating_mul(10).saturating_add(u64::from(d - b'0'))
    }))
}
