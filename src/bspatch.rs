#![forbid(unsafe_code)]
use super::utils::*;
use super::Control;
use bzip2::read::BzDecoder;
use log::{debug, trace};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Cursor, Read, Seek, SeekFrom, Take, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default chunk size of the copy and extra phases.
pub const BUFFER_SIZE: usize = 4096;

/// Size of the fixed patch header.
pub const HEADER_SIZE: u64 = 32;

/// Magic bytes of a bsdiff 4.x patch.
pub const MAGIC: &[u8; 8] = b"BSDIFF40";

/// Failure reason of a single delta reconstruction.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Header is shorter than 32 bytes, has the wrong magic or negative lengths.
    #[error("malformed patch header: {0}")]
    MalformedHeader(&'static str),

    /// Control stream ended early, failed to decompress or held invalid tuples.
    #[error("corrupt control stream: {0}")]
    CorruptControlStream(String),

    /// Diff stream ended early or failed to decompress.
    #[error("corrupt diff stream: {0}")]
    CorruptDiffStream(String),

    /// Extra stream ended early or failed to decompress.
    #[error("corrupt extra stream: {0}")]
    CorruptExtraStream(String),

    /// Control tuples would produce more bytes than the header declares.
    #[error("target size mismatch: header declares {expected} bytes, patch produces at least {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// Reading the original file or writing the output failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DecodeError {
    /// Stable numeric code of this failure.
    ///
    /// Library failures are small negative numbers; I/O failures carry the
    /// OS error number when one is known, `-1` otherwise.
    pub fn code(&self) -> i32 {
        match self {
            DecodeError::MalformedHeader(_) => -2,
            DecodeError::CorruptControlStream(_) => -3,
            DecodeError::CorruptDiffStream(_) => -4,
            DecodeError::CorruptExtraStream(_) => -5,
            DecodeError::SizeMismatch { .. } => -6,
            DecodeError::Io(e) => e.raw_os_error().unwrap_or(-1),
        }
    }
}

/// Somewhere the patch blob can be read from, once per stream.
///
/// Every call to `open_at` must return a reader that is independent of all
/// previously returned ones, since the three streams are consumed in an
/// interleaved order.
pub trait PatchSource {
    type Reader: Read;

    /// Open a new reader positioned at `offset` bytes into the blob.
    fn open_at(&self, offset: u64) -> io::Result<Self::Reader>;
}

impl<'a> PatchSource for &'a [u8] {
    type Reader = Cursor<&'a [u8]>;

    fn open_at(&self, offset: u64) -> io::Result<Self::Reader> {
        let data: &'a [u8] = *self;
        let start = Ord::min(offset, data.len() as u64) as usize;
        Ok(Cursor::new(&data[start..]))
    }
}

/// Patch blob stored on disk; each stream gets its own file handle.
#[derive(Debug, Clone)]
pub struct PatchFile {
    path: PathBuf,
}

impl PatchFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        PatchFile {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl PatchSource for PatchFile {
    type Reader = BufReader<File>;

    fn open_at(&self, offset: u64) -> io::Result<Self::Reader> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(BufReader::new(file))
    }
}

/// Decoded patch header.
#[derive(Debug, Clone, Copy)]
struct Header {
    csize: u64,
    dsize: u64,
    tsize: u64,
}

/// Streaming patcher compatible with bspatch.
///
/// Nothing is materialized in memory besides two chunk buffers: the old file
/// is read through `Read + Seek`, and the three compressed streams are
/// decoded from independent readers opened at their offsets in the blob.
///
/// Reconstruct a file in memory:
/// ```
/// use std::io;
/// use treepatch::{Bsdiff, Bspatch, DecodeError};
///
/// fn roundtrip(source: &[u8], target: &[u8]) -> Result<Vec<u8>, DecodeError> {
///     let mut patch = Vec::new();
///     Bsdiff::new(source, target).compare(io::Cursor::new(&mut patch))?;
///
///     let patcher = Bspatch::new(&patch[..])?;
///     let mut output = Vec::with_capacity(patcher.hint_target_size() as usize);
///     patcher.apply(io::Cursor::new(source), &mut output)?;
///     Ok(output)
/// }
/// ```
pub struct Bspatch<S: PatchSource> {
    patch: S,
    header: Header,
    buffer_size: usize,
}

impl Bspatch<PatchFile> {
    /// Open a patch blob on disk and parse its header.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DecodeError> {
        Bspatch::new(PatchFile::new(path))
    }
}

impl<S: PatchSource> Bspatch<S> {
    /// Parse the patch header and create new patcher configuration.
    ///
    /// Only the header is validated here; the streams are checked lazily
    /// while the patch is applied.
    pub fn new(patch: S) -> Result<Self, DecodeError> {
        let header = parse_header(&patch)?;
        debug!(
            "patch header: control {} bytes, diff {} bytes, target {} bytes",
            header.csize, header.dsize, header.tsize
        );
        Ok(Bspatch {
            patch,
            header,
            buffer_size: BUFFER_SIZE,
        })
    }

    /// Set the chunk size of the copy and extra phases (`bs >= 128`,
    /// default is `BUFFER_SIZE`).
    pub fn buffer_size(mut self, mut bs: usize) -> Self {
        if bs < 128 {
            bs = 128;
        }
        self.buffer_size = bs;
        self
    }

    /// Hint the final target file size, as provided in the patch header.
    pub fn hint_target_size(&self) -> u64 {
        self.header.tsize
    }

    /// Apply the patch to `source` and write the reconstruction to `target`.
    ///
    /// Returns the number of bytes written, which always equals the target
    /// size declared by the header.
    pub fn apply<O, T>(self, source: O, target: T) -> Result<u64, DecodeError>
    where
        O: Read + Seek,
        T: Write,
    {
        let streams = Streams::open(&self.patch, self.header)?;
        let ctx = Context::new(streams, source, target, self.header.tsize, self.buffer_size)?;
        ctx.apply()
    }

    /// Apply the patch to the file at `original`, writing the file `output`.
    ///
    /// `output` is created (or truncated) only once `original` could be
    /// opened, and is synced to disk before returning.
    pub fn apply_file<P, Q>(self, original: P, output: Q) -> Result<u64, DecodeError>
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
    {
        let source = BufReader::new(File::open(original)?);
        let mut target = BufWriter::new(File::create(output)?);
        let written = self.apply(source, &mut target)?;
        target.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        Ok(written)
    }
}

/// Reconstruct `output` from `original` and the patch blob at `patch`.
///
/// Nothing is created when the header cannot be read. Callers that must not
/// lose the previous contents of a file should point `output` at a
/// temporary sibling.
pub fn apply_delta<P, Q, R>(original: P, patch: Q, output: R) -> Result<u64, DecodeError>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
    R: AsRef<Path>,
{
    Bspatch::open(patch)?.apply_file(original, output)
}

/// Read and validate the 32-byte header.
fn parse_header<S: PatchSource>(patch: &S) -> Result<Header, DecodeError> {
    let mut raw = [0u8; HEADER_SIZE as usize];
    let mut reader = patch.open_at(0)?;
    if read_up_to(&mut reader, &mut raw[..])? < raw.len() {
        return Err(DecodeError::MalformedHeader("patch is shorter than its header"));
    }
    if &raw[..8] != MAGIC {
        return Err(DecodeError::MalformedHeader("bad magic"));
    }

    let csize = decode_int(&raw[8..16]);
    let dsize = decode_int(&raw[16..24]);
    let tsize = decode_int(&raw[24..32]);
    if csize < 0 || dsize < 0 || tsize < 0 {
        return Err(DecodeError::MalformedHeader("negative length"));
    }

    Ok(Header {
        csize: csize as u64,
        dsize: dsize as u64,
        tsize: tsize as u64,
    })
}

/// The three decompression streams of one patch, each with its own reader.
struct Streams<R: Read> {
    ctrls: BzDecoder<Take<R>>,
    delta: BzDecoder<Take<R>>,
    extra: BzDecoder<R>,
}

impl<R: Read> Streams<R> {
    fn open<S>(patch: &S, header: Header) -> Result<Self, DecodeError>
    where
        S: PatchSource<Reader = R>,
    {
        let ctrls_at = HEADER_SIZE;
        let delta_at = ctrls_at.saturating_add(header.csize);
        let extra_at = delta_at.saturating_add(header.dsize);

        let ctrls = patch.open_at(ctrls_at)?.take(header.csize);
        let delta = patch.open_at(delta_at)?.take(header.dsize);
        let extra = patch.open_at(extra_at)?;

        Ok(Streams {
            ctrls: BzDecoder::new(ctrls),
            delta: BzDecoder::new(delta),
            extra: BzDecoder::new(extra),
        })
    }
}

/// Bspatch context: the reconstruction cursor plus everything it reads from
/// and writes to.
struct Context<R, O, T>
where
    R: Read,
    O: Read + Seek,
    T: Write,
{
    streams: Streams<R>,
    source: O,
    source_len: u64,
    target: T,

    buf: Vec<u8>,
    old: Vec<u8>,
    ctl: [u8; 24],

    oldpos: i64,
    newpos: u64,
    tsize: u64,
}

impl<R, O, T> Context<R, O, T>
where
    R: Read,
    O: Read + Seek,
    T: Write,
{
    fn new(
        streams: Streams<R>,
        mut source: O,
        target: T,
        tsize: u64,
        bsize: usize,
    ) -> Result<Self, DecodeError> {
        let source_len = source.seek(SeekFrom::End(0))?;
        Ok(Context {
            streams,
            source,
            source_len,
            target,
            buf: vec![0; bsize],
            old: vec![0; bsize],
            ctl: [0; 24],
            oldpos: 0,
            newpos: 0,
            tsize,
        })
    }

    /// Apply the patch file.
    fn apply(mut self) -> Result<u64, DecodeError> {
        while self.newpos < self.tsize {
            let Control { copy, extra, seek } = self.next_control()?;
            trace!(
                "control: copy {} extra {} seek {} at old {} new {}",
                copy,
                extra,
                seek,
                self.oldpos,
                self.newpos
            );
            self.reserve(copy)?;
            self.add(copy)?;
            self.reserve(extra)?;
            self.insert(extra)?;
            self.seek(seek)?;
        }
        self.target.flush()?;
        Ok(self.newpos)
    }

    /// Decode the next control tuple.
    fn next_control(&mut self) -> Result<Control, DecodeError> {
        self.streams
            .ctrls
            .read_exact(&mut self.ctl[..])
            .map_err(|e| DecodeError::CorruptControlStream(e.to_string()))?;

        let copy = decode_int(&self.ctl[0..8]);
        let extra = decode_int(&self.ctl[8..16]);
        let seek = decode_int(&self.ctl[16..24]);
        if copy < 0 || extra < 0 {
            return Err(DecodeError::CorruptControlStream(format!(
                "negative length in control tuple ({}, {}, {})",
                copy, extra, seek
            )));
        }

        Ok(Control {
            copy: copy as u64,
            extra: extra as u64,
            seek,
        })
    }

    /// Refuse to grow the output past the declared target size.
    fn reserve(&self, count: u64) -> Result<(), DecodeError> {
        match self.newpos.checked_add(count) {
            Some(end) if end <= self.tsize => Ok(()),
            end => Err(DecodeError::SizeMismatch {
                expected: self.tsize,
                actual: end.unwrap_or(u64::MAX),
            }),
        }
    }

    /// Add diff bytes to the source bytes under the cursor and write the sums.
    fn add(&mut self, mut count: u64) -> Result<(), DecodeError> {
        while count > 0 {
            let k = Ord::min(count, self.buf.len() as u64) as usize;

            self.streams
                .delta
                .read_exact(&mut self.buf[..k])
                .map_err(|e| DecodeError::CorruptDiffStream(e.to_string()))?;
            self.fill_old(k)?;
            for (x, y) in self.buf[..k].iter_mut().zip(self.old[..k].iter()) {
                *x = x.wrapping_add(*y);
            }
            self.target.write_all(&self.buf[..k])?;

            self.oldpos = advance(self.oldpos, k as i64)?;
            self.newpos += k as u64;
            count -= k as u64;
        }
        Ok(())
    }

    /// Copy extra bytes to target verbatim.
    fn insert(&mut self, mut count: u64) -> Result<(), DecodeError> {
        while count > 0 {
            let k = Ord::min(count, self.buf.len() as u64) as usize;

            self.streams
                .extra
                .read_exact(&mut self.buf[..k])
                .map_err(|e| DecodeError::CorruptExtraStream(e.to_string()))?;
            self.target.write_all(&self.buf[..k])?;

            self.newpos += k as u64;
            count -= k as u64;
        }
        Ok(())
    }

    /// Move the cursor on source.
    fn seek(&mut self, offset: i64) -> Result<(), DecodeError> {
        self.oldpos = advance(self.oldpos, offset)?;
        Ok(())
    }

    /// Load `k` source bytes starting at `oldpos` into the old buffer.
    ///
    /// Positions outside of the source (before its start, past its end, or
    /// cut off by a short read) read as zero.
    fn fill_old(&mut self, k: usize) -> Result<(), DecodeError> {
        let old = &mut self.old[..k];
        old.fill(0);

        let start = self.oldpos;
        let end = start.saturating_add(k as i64);
        let lo = Ord::max(start, 0);
        let hi = Ord::min(end, i64::try_from(self.source_len).unwrap_or(i64::MAX));
        if lo < hi {
            let offset = (lo - start) as usize;
            let len = (hi - lo) as usize;
            self.source.seek(SeekFrom::Start(lo as u64))?;
            read_up_to(&mut self.source, &mut old[offset..offset + len])?;
        }
        Ok(())
    }
}

/// Move the source cursor, rejecting overflow as a corrupt patch.
#[inline]
fn advance(pos: i64, offset: i64) -> Result<i64, DecodeError> {
    pos.checked_add(offset)
        .ok_or_else(|| DecodeError::CorruptControlStream("source cursor overflow".to_string()))
}
