use std::io::{self, Read, Seek, SeekFrom};

use crate::Result;

/// Exposes only the byte range `[start, end)` of an underlying stream.
///
/// `seek` and `stream_position` work on a virtual offset where `0` is
/// `start`. Reads never go past `end`; once the range is exhausted they
/// return `Ok(0)`.
pub struct OffsetRangeReader<R> {
    inner: R,
    start: u64,
    end: u64,
}

impl<R: Read + Seek> OffsetRangeReader<R> {
    pub fn new(mut inner: R, start: u64, end: u64) -> Result<Self> {
        if start > end {
            return Err(crate::icebox_error!(InvalidParameter {
                description: format!("Invalid stream range [{start}, {end})"),
            }));
        }
        inner.seek(SeekFrom::Start(start))?;
        Ok(Self { inner, start, end })
    }

    /// Number of bytes covered by the range.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl<R: Read + Seek> Read for OffsetRangeReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let current = self.inner.stream_position()?;
        if current >= self.end {
            return Ok(0);
        }
        let allowed = (self.end - current).min(buf.len() as u64) as usize;
        self.inner.read(&mut buf[..allowed])
    }
}

impl<R: Read + Seek> Seek for OffsetRangeReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let absolute: i128 = match pos {
            SeekFrom::Start(offset) => self.start as i128 + offset as i128,
            SeekFrom::Current(offset) => self.inner.stream_position()? as i128 + offset as i128,
            SeekFrom::End(offset) => self.end as i128 + offset as i128,
        };
        let clamped = absolute.clamp(self.start as i128, self.end as i128) as u64;
        self.inner.seek(SeekFrom::Start(clamped))?;
        Ok(clamped - self.start)
    }
}
