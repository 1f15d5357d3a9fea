#![forbid(unsafe_code)]
use super::bspatch::{HEADER_SIZE, MAGIC};
use super::utils::*;
use super::Control;
use bzip2::write::BzEncoder;
use std::io::{Error, ErrorKind, Result, Write};
use suffix_array::SuffixArray;

/// Compression level of the bzip2 compressor.
pub use bzip2::Compression;

/// Max length of the source data.
pub use suffix_array::MAX_LENGTH;

/// Default threshold below which exact matches are ignored.
pub const SMALL_MATCH: usize = 12;

/// Mismatches required before a match is worth a new control tuple.
const MISMATCH_COUNT: usize = 8;

/// Matches longer than this are skipped with a binary search.
const LONG_SUFFIX: usize = 256;

/// Default chunk size for diff calculation.
pub const BUFFER_SIZE: usize = 4096;

/// Delta compressor producing bsdiff 4.x patches.
///
/// This is the authoring side of the patch packages: it indexes the source
/// with a suffix array, so both inputs are kept in memory. Source data size
/// should not be greater than `MAX_LENGTH`.
///
/// ```
/// use std::io;
/// use treepatch::{Bsdiff, Compression};
///
/// fn bsdiff(source: &[u8], target: &[u8]) -> io::Result<Vec<u8>> {
///     let mut patch = Vec::new();
///     Bsdiff::new(source, target)
///         .compression_level(Compression::best())
///         .compare(io::Cursor::new(&mut patch))?;
///     Ok(patch)
/// }
/// ```
pub struct Bsdiff<'s, 't> {
    s: &'s [u8],
    t: &'t [u8],
    small: usize,
    bsize: usize,
    level: Compression,
}

impl<'s, 't> Bsdiff<'s, 't> {
    /// Create new configuration for bsdiff delta compression.
    pub fn new(source: &'s [u8], target: &'t [u8]) -> Self {
        Bsdiff {
            s: source,
            t: target,
            small: SMALL_MATCH,
            bsize: BUFFER_SIZE,
            level: Compression::default(),
        }
    }

    /// Set the threshold to determine small match (default is `SMALL_MATCH`).
    /// If set to zero, no matches would be skipped.
    pub fn small_match(mut self, sm: usize) -> Self {
        self.small = sm;
        self
    }

    /// Set the compression level of bzip2.
    pub fn compression_level(mut self, lv: Compression) -> Self {
        self.level = lv;
        self
    }

    /// Set the chunk size for diff calculation (`bs >= 128`, default is `BUFFER_SIZE`).
    pub fn buffer_size(mut self, mut bs: usize) -> Self {
        if bs < 128 {
            bs = 128;
        }
        self.bsize = bs;
        self
    }

    /// Search matches in target and write the patch file.
    ///
    /// The size of patch file would be returned if no error occurs.
    pub fn compare<P: Write>(&self, patch: P) -> Result<u64> {
        if self.s.len() > MAX_LENGTH {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "source data is too large to be indexed",
            ));
        }

        // Nothing to match against: ship the whole target as extra bytes.
        if self.s.is_empty() {
            let ctrls = Some(Control {
                copy: 0,
                extra: self.t.len() as u64,
                seek: 0,
            })
            .filter(|ctl| ctl.extra > 0);
            return pack(self.s, self.t, ctrls.into_iter(), patch, self.level, self.bsize);
        }

        let sa = SuffixArray::new(self.s);
        let scanner = MatchScanner::new(self.s, self.t, &sa, self.small);
        pack(self.s, self.t, scanner, patch, self.level, self.bsize)
    }
}

/// Construct bsdiff 4.x patch file from the control tuples.
///
/// The three streams are compressed as the tuples come in; only their
/// compressed forms are held until the header can be written.
fn pack<D, P>(s: &[u8], t: &[u8], ctrls: D, mut p: P, lv: Compression, bsize: usize) -> Result<u64>
where
    D: Iterator<Item = Control>,
    P: Write,
{
    let mut bz_ctrls = BzEncoder::new(Vec::new(), lv);
    let mut bz_delta = BzEncoder::new(Vec::new(), lv);
    let mut bz_extra = BzEncoder::new(Vec::new(), lv);

    let mut spos: i64 = 0;
    let mut tpos: usize = 0;
    let mut cbuf = [0; 24];
    let mut dat = Vec::with_capacity(bsize);

    for ctl in ctrls {
        encode_int(ctl.copy as i64, &mut cbuf[0..8]);
        encode_int(ctl.extra as i64, &mut cbuf[8..16]);
        encode_int(ctl.seek, &mut cbuf[16..24]);
        bz_ctrls.write_all(&cbuf[..])?;

        // Source bytes outside of the source count as zero, like on the
        // patching side.
        let mut n = ctl.copy as usize;
        while n > 0 {
            let k = Ord::min(n, bsize);
            dat.extend((0..k).map(|x| {
                let old = usize::try_from(spos + x as i64)
                    .ok()
                    .and_then(|i| s.get(i))
                    .copied()
                    .unwrap_or(0);
                t[tpos + x].wrapping_sub(old)
            }));
            bz_delta.write_all(&dat[..])?;
            dat.clear();

            spos += k as i64;
            tpos += k;
            n -= k;
        }

        let extra = ctl.extra as usize;
        if extra > 0 {
            bz_extra.write_all(&t[tpos..tpos + extra])?;
            tpos += extra;
        }

        spos = spos.wrapping_add(ctl.seek);
    }

    let bz_ctrls = bz_ctrls.finish()?;
    let bz_delta = bz_delta.finish()?;
    let bz_extra = bz_extra.finish()?;

    // Header: magic, control size, diff size, target size.
    let mut header = [0; HEADER_SIZE as usize];
    header[0..8].copy_from_slice(MAGIC);
    encode_int(bz_ctrls.len() as i64, &mut header[8..16]);
    encode_int(bz_delta.len() as i64, &mut header[16..24]);
    encode_int(t.len() as i64, &mut header[24..32]);
    p.write_all(&header[..])?;

    p.write_all(&bz_ctrls[..])?;
    p.write_all(&bz_delta[..])?;
    p.write_all(&bz_extra[..])?;
    p.flush()?;

    Ok(HEADER_SIZE + (bz_ctrls.len() + bz_delta.len() + bz_extra.len()) as u64)
}

/// Suffix array driven match scanner, yielding one control tuple per match.
///
/// A match covers `s[src-back..src+len+ahead] ~= t[tgt-back..tgt+len+ahead]`
/// where `len` bytes match exactly and the `back`/`ahead` bytes around them
/// are merely similar (they go to the diff stream).
struct MatchScanner<'s, 't> {
    s: &'s [u8],
    t: &'t [u8],
    sa: &'s SuffixArray<'s>,
    small: usize,

    src: usize,
    tgt: usize,
    len: usize,
    back: usize,
}

impl<'s, 't> MatchScanner<'s, 't> {
    fn new(s: &'s [u8], t: &'t [u8], sa: &'s SuffixArray<'s>, small: usize) -> Self {
        MatchScanner {
            s,
            t,
            sa,
            small,
            src: 0,
            tgt: 0,
            len: 0,
            back: 0,
        }
    }

    /// Longest exact match of `t[j..]` anywhere in source, as `(i, n)`.
    #[inline]
    fn lookup(&self, j: usize) -> (usize, usize) {
        range_to_extent(self.sa.search_lcp(&self.t[j..]))
    }

    /// Find the next exact match `(i, j, n)` that differs enough from simply
    /// continuing the previous one. End of target counts as a final empty
    /// match at `(s.len(), t.len(), 0)`.
    fn search_next(&self) -> Option<(usize, usize, usize)> {
        if self.tgt == self.t.len() && self.back == 0 {
            return None;
        }

        let mut j = self.tgt + self.len;
        let mut k = j;
        let mut same = 0;
        while j < self.t.len().saturating_sub(self.small) {
            let (i, n) = self.lookup(j);

            // Count how many of the matched bytes the previous match would
            // have produced anyway.
            while k < j + n {
                let i = self.src.saturating_add(k - self.tgt);
                if i < self.s.len() && self.s[i] == self.t[k] {
                    same += 1;
                }
                k += 1;
            }

            if n == 0 {
                j += 1;
                same = 0;
            } else if same == n || n <= self.small {
                j += n;
                same = 0;
            } else if n <= same + MISMATCH_COUNT {
                // Too few mismatches: treat as trailing similar bytes of the
                // previous match and keep going.
                let next = if n <= LONG_SUFFIX {
                    j + 1
                } else {
                    let (mut lo, mut hi) = (0, n);
                    while lo < hi {
                        let mid = lo + (hi - lo) / 2;
                        let (im, nm) = self.lookup(j + mid);
                        if i + n == im + nm && n == mid + nm {
                            lo = mid + 1;
                        } else {
                            hi = mid;
                        }
                    }
                    j + Ord::max(lo, 1)
                };
                let mut i = self.src.saturating_add(j - self.tgt);
                while j < next {
                    if i < self.s.len() && self.s[i] == self.t[j] {
                        same -= 1;
                    }
                    i += 1;
                    j += 1;
                }
            } else {
                return Some((i, j, n));
            }
        }

        Some((self.s.len(), self.t.len(), 0))
    }

    /// Split the gap between the previous match and the one at `(i, j)` into
    /// bytes similar to what follows the previous match (`ahead`) and bytes
    /// similar to what precedes the new one (`back`).
    fn split_gap(&self, i: usize, j: usize) -> (usize, usize) {
        let gap = &self.t[self.tgt + self.len..j];
        let after = &self.s[self.src + self.len..];
        let before = &self.s[..i];

        let mut ahead = similar_prefix(gap.iter(), after.iter());
        let mut back = similar_prefix(gap.iter().rev(), before.iter().rev());

        if ahead + back > gap.len() {
            let overlap = ahead + back - gap.len();
            let xs = gap[gap.len() - back..ahead].iter();
            let ys = after[gap.len() - back..ahead].iter();
            let zs = before[before.len() - back..before.len() - back + overlap].iter();

            let cut = divide_overlap(xs, ys, zs);
            ahead -= overlap - cut;
            back -= cut;
        }

        (ahead, back)
    }
}

impl<'s, 't> Iterator for MatchScanner<'s, 't> {
    type Item = Control;

    fn next(&mut self) -> Option<Self::Item> {
        let (i, j, n) = self.search_next()?;
        let (ahead, back) = self.split_gap(i, j);

        // source:  ...( back0 | len0 | ahead )...( back | ...
        //                      ^ src0               ^ i
        // target:  ...( back0 | len0 | ahead ; extra )( back | ...
        //                      ^ tgt0                          ^ j
        let copy = (self.back + self.len + ahead) as u64;
        let extra = ((j - back) - (self.tgt + self.len + ahead)) as u64;
        let seek = (i - back).wrapping_sub(self.src + self.len + ahead) as isize as i64;

        self.src = i;
        self.tgt = j;
        self.len = n;
        self.back = back;
        Some(Control { copy, extra, seek })
    }
}

/// Length of the prefix where matches outnumber mismatches the most.
#[inline]
fn similar_prefix<T: Eq, I: Iterator<Item = T>>(xs: I, ys: I) -> usize {
    let mut best = 0;
    let mut best_score = 0isize;
    let mut score = 0isize;
    for (n, (x, y)) in (1..).zip(xs.zip(ys)) {
        score += if x == y { 1 } else { -1 };
        if score > best_score {
            best = n;
            best_score = score;
        }
    }
    best
}

/// Dividing point of an overlap, favouring `ys` over `zs` where `xs` agrees.
#[inline]
fn divide_overlap<T: Eq, I: Iterator<Item = T>>(xs: I, ys: I, zs: I) -> usize {
    let mut best = 0;
    let mut best_score = 0isize;
    let mut score = 0isize;
    for (n, ((x, y), z)) in (1..).zip(xs.zip(ys).zip(zs)) {
        score += isize::from(x == y) - isize::from(x == z);
        if score > best_score {
            best = n;
            best_score = score;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Bspatch;
    use std::io::Cursor;

    fn diff(s: &[u8], t: &[u8]) -> Vec<u8> {
        let mut p = Vec::new();
        Bsdiff::new(s, t).compare(Cursor::new(&mut p)).unwrap();
        p
    }

    fn patch(s: &[u8], p: &[u8]) -> Vec<u8> {
        let mut t = Vec::new();
        Bspatch::new(p).unwrap().apply(Cursor::new(s), &mut t).unwrap();
        t
    }

    #[test]
    fn header_declares_target_size() {
        let p = diff(b"old contents", b"new contents, longer");
        assert_eq!(&p[..8], MAGIC);
        assert_eq!(decode_int(&p[24..32]), 20);
    }

    #[test]
    fn small_edits() {
        let s: Vec<u8> = (0..4096u32).map(|i| (i * 7 % 256) as u8).collect();
        let mut t = s.clone();
        t[100] ^= 0xff;
        t.splice(2000..2000, b"inserted".iter().cloned());
        t.drain(3000..3100);
        assert_eq!(patch(&s, &diff(&s, &t)), t);
    }

    #[test]
    fn empty_sides() {
        assert_eq!(patch(b"", &diff(b"", b"fresh")), b"fresh");
        assert_eq!(patch(b"stale", &diff(b"stale", b"")), b"");
        assert_eq!(patch(b"", &diff(b"", b"")), b"");
    }

    #[test]
    fn streams_through_small_chunks() {
        let s: Vec<u8> = (0..20_000u32).map(|i| (i * 31 % 253) as u8).collect();
        let mut t = s.clone();
        for i in (0..t.len()).step_by(997) {
            t[i] = t[i].wrapping_add(1);
        }
        t.extend((0..5000u32).map(|i| (i % 7) as u8));

        let mut p = Vec::new();
        let size = Bsdiff::new(&s, &t)
            .buffer_size(128)
            .compare(Cursor::new(&mut p))
            .unwrap();
        assert_eq!(size, p.len() as u64);
        assert_eq!(patch(&s, &p), t);
    }

    #[test]
    fn scores() {
        assert_eq!(similar_prefix(b"abcx".iter(), b"abcy".iter()), 3);
        assert_eq!(similar_prefix(b"xbc".iter(), b"abc".iter()), 3);
        assert_eq!(similar_prefix(b"xyz".iter(), b"abc".iter()), 0);
    }
}
