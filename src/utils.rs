use byteorder::{ByteOrder, LE};
use std::io::{ErrorKind, Read, Result};
use std::ops::Range;

/// Decodes a bsdiff integer (little-endian magnitude, sign in the top bit).
#[inline]
pub fn decode_int(b: &[u8]) -> i64 {
    let x = LE::read_u64(b);
    let magnitude = (x & 0x7fff_ffff_ffff_ffff) as i64;
    if x >> 63 == 0 {
        magnitude
    } else {
        magnitude.wrapping_neg()
    }
}

/// Encodes a bsdiff integer.
#[inline]
pub fn encode_int(x: i64, b: &mut [u8]) {
    if x < 0 {
        LE::write_u64(b, x.unsigned_abs() | 0x8000_0000_0000_0000);
    } else {
        LE::write_u64(b, x as u64);
    }
}

/// Converts Range<usize> to extent (i, n).
#[inline]
pub fn range_to_extent(range: Range<usize>) -> (usize, usize) {
    let Range { start, end } = range;
    (start, end.saturating_sub(start))
}

/// Reads until `buf` is full or the reader is exhausted, returning the count
/// of bytes read. Unlike `read_exact`, a short count is not an error.
pub fn read_up_to<R: Read + ?Sized>(r: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut cnt = 0;
    while cnt < buf.len() {
        match r.read(&mut buf[cnt..]) {
            Ok(0) => break,
            Ok(n) => cnt += n,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(cnt)
}
