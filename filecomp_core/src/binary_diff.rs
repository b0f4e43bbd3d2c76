use crate::progress::{percent, ProgressSink, ProgressThrottle};
use filecomp_common::{BinaryChange, EngineConfig, FileCompError, ProgressEvent, Result};
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

const WORD: usize = std::mem::size_of::<u64>();

/// Read-ahead cache over one input: aligned block reads buffered up to a
/// fixed window, so the file is never materialized
pub struct BlockCache<R> {
    reader: R,
    name: PathBuf,
    len: u64,
    block_size: usize,
    window_size: usize,
    buf: Vec<u8>,
    buf_start: u64,
}

impl<R: Read + Seek> BlockCache<R> {
    pub fn new(reader: R, len: u64, name: impl Into<PathBuf>, block_size: usize, window_size: usize) -> Self {
        Self {
            reader,
            name: name.into(),
            len,
            block_size: block_size.max(1),
            window_size: window_size.max(block_size).max(1),
            buf: Vec::new(),
            buf_start: 0,
        }
    }

    pub fn from_config(reader: R, len: u64, name: impl Into<PathBuf>, config: &EngineConfig) -> Self {
        Self::new(reader, len, name, config.binary_block_size, config.binary_window_size)
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn name(&self) -> &Path {
        &self.name
    }

    /// Buffered bytes starting at `offset`; empty at or past the end
    pub fn slice_at(&mut self, offset: u64) -> Result<&[u8]> {
        if offset >= self.len {
            return Ok(&[]);
        }
        let buf_end = self.buf_start + self.buf.len() as u64;
        if offset < self.buf_start || offset >= buf_end {
            self.fill(offset)?;
        }
        let start = (offset - self.buf_start) as usize;
        Ok(&self.buf[start..])
    }

    fn fill(&mut self, offset: u64) -> Result<()> {
        let start = offset - offset % self.block_size as u64;
        let want = (self.len - start).min(self.window_size as u64) as usize;

        if self.buf.capacity() < want {
            self.buf.try_reserve_exact(want - self.buf.len())?;
        }
        self.buf.clear();
        self.buf.resize(want, 0);
        self.buf_start = start;

        self.reader
            .seek(SeekFrom::Start(start))
            .map_err(|e| FileCompError::io(&self.name, e))?;

        let mut filled = 0;
        while filled < want {
            let end = (filled + self.block_size).min(want);
            match self.reader.read(&mut self.buf[filled..end]) {
                Ok(0) => {
                    return Err(FileCompError::io(
                        &self.name,
                        std::io::Error::new(ErrorKind::UnexpectedEof, "file shrank during comparison"),
                    ))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(FileCompError::io(&self.name, e)),
            }
        }
        Ok(())
    }
}

/// Chunked byte-for-byte comparison of two inputs
pub struct BinaryDiffEngine {
    max_changes: usize,
    progress_interval: Duration,
}

impl BinaryDiffEngine {
    pub fn new(max_changes: usize, progress_interval: Duration) -> Self {
        Self {
            max_changes: max_changes.max(1),
            progress_interval,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.max_binary_changes, Duration::from_millis(config.progress_interval_ms))
    }

    /// Offset of the first differing byte; the shorter length when one input
    /// is a prefix of the other
    pub fn find_first_difference<A, B>(
        &self,
        a: &mut BlockCache<A>,
        b: &mut BlockCache<B>,
        progress: &mut dyn ProgressSink,
        cancel: Option<&AtomicBool>,
    ) -> Result<Option<u64>>
    where
        A: Read + Seek,
        B: Read + Seek,
    {
        let common = a.len().min(b.len());
        let mut scan = Scan::new(a.len().max(b.len()), self.progress_interval, progress, cancel);
        let pos = scan.run(a, b, 0, common, true, 0)?;

        if pos < common || a.len() != b.len() {
            debug!("First difference at offset {}", pos);
            Ok(Some(pos))
        } else {
            Ok(None)
        }
    }

    /// Every maximal run of differing bytes from `start` on, and whether the
    /// list was cut at the change limit
    pub fn enumerate_differences<A, B>(
        &self,
        a: &mut BlockCache<A>,
        b: &mut BlockCache<B>,
        start: u64,
        progress: &mut dyn ProgressSink,
        cancel: Option<&AtomicBool>,
    ) -> Result<(Vec<BinaryChange>, bool)>
    where
        A: Read + Seek,
        B: Read + Seek,
    {
        let common = a.len().min(b.len());
        let longest = a.len().max(b.len());
        let mut scan = Scan::new(longest, self.progress_interval, progress, cancel);
        let mut changes: Vec<BinaryChange> = Vec::new();
        let mut pos = start;

        while pos < common {
            pos = scan.run(a, b, pos, common, true, changes.len())?;
            if pos >= common {
                break;
            }
            let end = scan.run(a, b, pos, common, false, changes.len())?;
            if changes.len() == self.max_changes {
                debug!("Change limit of {} reached at offset {}", self.max_changes, pos);
                return Ok((changes, true));
            }
            changes.push(BinaryChange {
                offset: pos,
                length: end - pos,
            });
            pos = end;
        }

        if longest > common && start <= longest {
            let tail_start = common.max(start);
            let full = changes.len() == self.max_changes;
            match changes.last_mut() {
                Some(last) if last.end() == tail_start => last.length += longest - tail_start,
                _ if full => return Ok((changes, true)),
                _ => changes.push(BinaryChange {
                    offset: tail_start,
                    length: longest - tail_start,
                }),
            }
        }

        debug!("Found {} binary change regions", changes.len());
        Ok((changes, false))
    }
}

/// Shared scan state: progress gate and cancellation
struct Scan<'a> {
    total: u64,
    throttle: ProgressThrottle,
    progress: &'a mut dyn ProgressSink,
    cancel: Option<&'a AtomicBool>,
}

impl<'a> Scan<'a> {
    fn new(total: u64, interval: Duration, progress: &'a mut dyn ProgressSink, cancel: Option<&'a AtomicBool>) -> Self {
        Self {
            total,
            throttle: ProgressThrottle::new(interval),
            progress,
            cancel,
        }
    }

    /// Advance from `pos` while bytes are equal (`equal == true`) or while
    /// they differ, stopping at `limit`
    fn run<A, B>(
        &mut self,
        a: &mut BlockCache<A>,
        b: &mut BlockCache<B>,
        mut pos: u64,
        limit: u64,
        equal: bool,
        changes: usize,
    ) -> Result<u64>
    where
        A: Read + Seek,
        B: Read + Seek,
    {
        while pos < limit {
            if self.cancel.map_or(false, |flag| flag.load(Ordering::Relaxed)) {
                return Err(FileCompError::Cancelled);
            }

            let block = a.block_size;
            let sa = a.slice_at(pos)?;
            let sb = b.slice_at(pos)?;
            let n = sa.len().min(sb.len()).min(block).min((limit - pos) as usize);
            let (sa, sb) = (&sa[..n], &sb[..n]);

            let run = if equal { equal_prefix(sa, sb) } else { differing_prefix(sa, sb) };
            pos += run as u64;

            let total = self.total;
            self.throttle.update(self.progress, || ProgressEvent {
                percent: percent(pos, total),
                changes,
            });

            if run < n {
                break;
            }
        }
        Ok(pos.min(limit))
    }
}

/// Length of the common prefix, compared a word at a time
fn equal_prefix(a: &[u8], b: &[u8]) -> usize {
    let words = a.len() / WORD;
    let mut i = 0;
    while i < words * WORD {
        if word(a, i) != word(b, i) {
            break;
        }
        i += WORD;
    }
    while i < a.len() && a[i] == b[i] {
        i += 1;
    }
    i
}

/// Length of the prefix where every byte differs
fn differing_prefix(a: &[u8], b: &[u8]) -> usize {
    let words = a.len() / WORD;
    let mut i = 0;
    while i < words * WORD {
        if has_zero_byte(word(a, i) ^ word(b, i)) {
            break;
        }
        i += WORD;
    }
    while i < a.len() && a[i] != b[i] {
        i += 1;
    }
    i
}

fn word(bytes: &[u8], at: usize) -> u64 {
    let mut w = [0u8; WORD];
    w.copy_from_slice(&bytes[at..at + WORD]);
    u64::from_ne_bytes(w)
}

fn has_zero_byte(x: u64) -> bool {
    const LO: u64 = 0x0101_0101_0101_0101;
    const HI: u64 = 0x8080_8080_8080_8080;
    x.wrapping_sub(LO) & !x & HI != 0
}
