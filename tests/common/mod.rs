#![allow(unused)]

use bzip2::write::BzEncoder;
use bzip2::Compression;
use rand::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::io::prelude::*;
use std::path::Path;
use treepatch::Bsdiff;
use walkdir::WalkDir;

pub fn qbsdiff(s: &[u8], t: &[u8]) -> Vec<u8> {
    let mut p = Vec::new();
    Bsdiff::new(s, t).compare(io::Cursor::new(&mut p)).unwrap();
    p
}

/// Encode a bsdiff integer (magnitude plus sign bit).
pub fn offtout(x: i64) -> [u8; 8] {
    let mut v = x.unsigned_abs();
    if x < 0 {
        v |= 1 << 63;
    }
    v.to_le_bytes()
}

fn bz(data: &[u8]) -> Vec<u8> {
    let mut enc = BzEncoder::new(Vec::new(), Compression::best());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

/// Hand-assemble a patch file from control tuples and raw stream contents.
pub fn build_patch(ctrls: &[(i64, i64, i64)], delta: &[u8], extra: &[u8], tsize: i64) -> Vec<u8> {
    let raw: Vec<u8> = ctrls
        .iter()
        .flat_map(|&(c, e, s)| [offtout(c), offtout(e), offtout(s)])
        .flatten()
        .collect();
    let bz_ctrls = bz(&raw);
    let bz_delta = bz(delta);
    let bz_extra = bz(extra);

    let mut p = b"BSDIFF40".to_vec();
    p.extend_from_slice(&offtout(bz_ctrls.len() as i64));
    p.extend_from_slice(&offtout(bz_delta.len() as i64));
    p.extend_from_slice(&offtout(tsize));
    p.extend_from_slice(&bz_ctrls);
    p.extend_from_slice(&bz_delta);
    p.extend_from_slice(&bz_extra);
    p
}

/// The "abc" -> "bcd" patch.
pub fn abc_to_bcd() -> Vec<u8> {
    build_patch(&[(3, 0, 0)], &[1, 1, 1], b"", 3)
}

pub fn random_bytes<R: Rng>(rng: &mut R, n: usize) -> Vec<u8> {
    let mut v = vec![0u8; n];
    rng.fill_bytes(&mut v[..]);
    v
}

/// Derive a similar buffer by overwriting, inserting and removing ranges.
pub fn distort<R: Rng>(rng: &mut R, s: &[u8], edits: usize) -> Vec<u8> {
    let mut t = s.to_vec();
    for _ in 0..edits {
        let at = if t.is_empty() { 0 } else { rng.gen_range(0..t.len()) };
        let n = rng.gen_range(1..64);
        match rng.gen_range(0..3) {
            0 => {
                let end = Ord::min(at + n, t.len());
                for x in t[at..end].iter_mut() {
                    *x = rng.gen();
                }
            }
            1 => {
                let bytes = random_bytes(rng, n);
                t.splice(at..at, bytes);
            }
            _ => {
                let end = Ord::min(at + n, t.len());
                t.drain(at..end);
            }
        }
    }
    t
}

pub fn write_file<P: AsRef<Path>>(path: P, bytes: &[u8]) {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, bytes).unwrap();
}

pub fn write_tree<P: AsRef<Path>>(root: P, files: &[(&str, &str)]) {
    for (name, text) in files {
        write_file(root.as_ref().join(name), text.as_bytes());
    }
}

/// Every file of a tree, keyed by `/`-separated relative path.
pub fn read_tree<P: AsRef<Path>>(root: P) -> BTreeMap<String, Vec<u8>> {
    let root = root.as_ref();
    let mut files = BTreeMap::new();
    for entry in WalkDir::new(root).min_depth(1) {
        let entry = entry.unwrap();
        if entry.file_type().is_file() {
            let name = entry
                .path()
                .strip_prefix(root)
                .unwrap()
                .to_str()
                .unwrap()
                .replace('\\', "/");
            files.insert(name, fs::read(entry.path()).unwrap());
        }
    }
    files
}

pub fn copy_tree<P: AsRef<Path>, Q: AsRef<Path>>(from: P, to: Q) {
    for (name, bytes) in read_tree(from) {
        write_file(to.as_ref().join(name), &bytes);
    }
}
