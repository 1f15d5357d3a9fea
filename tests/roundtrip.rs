mod common;

use common::*;
use quickcheck_macros::quickcheck;
use rand::prelude::*;
use std::fs;
use std::io;
use treepatch::{apply_delta, Bspatch};

fn qbspatch(s: &[u8], p: &[u8]) -> Vec<u8> {
    let patcher = Bspatch::new(p).unwrap();
    let mut t = Vec::with_capacity(patcher.hint_target_size() as usize);
    patcher.apply(io::Cursor::new(s), &mut t).unwrap();
    t
}

#[quickcheck]
fn arbitrary_pairs_invert(s: Vec<u8>, t: Vec<u8>) -> bool {
    qbspatch(&s[..], &qbsdiff(&s[..], &t[..])) == t
}

#[quickcheck]
fn distorted_pairs_invert(seed: u64, edits: u8) -> bool {
    let mut rng = StdRng::seed_from_u64(seed);
    let s = random_bytes(&mut rng, 2048);
    let t = distort(&mut rng, &s, edits as usize % 16);
    qbspatch(&s[..], &qbsdiff(&s[..], &t[..])) == t
}

#[test]
fn random_files_invert() {
    let dir = tempfile::tempdir().unwrap();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for &n in [0usize, 1, 100, 4095, 4096, 4097, 65_536, 300_000].iter() {
        let s = random_bytes(&mut rng, n);
        let t = distort(&mut rng, &s, 1 + n / 4096);
        eprintln!("invertibility test on {} bytes -> {} bytes", s.len(), t.len());

        let old = dir.path().join("old");
        let blob = dir.path().join("blob.patch");
        let new = dir.path().join("new");
        fs::write(&old, &s).unwrap();
        fs::write(&blob, qbsdiff(&s, &t)).unwrap();

        let written = apply_delta(&old, &blob, &new).unwrap();
        assert_eq!(written, t.len() as u64);
        assert_eq!(fs::read(&new).unwrap(), t);
    }
}

#[test]
fn buffer_size_does_not_change_output() {
    let mut rng = StdRng::seed_from_u64(42);
    let s = random_bytes(&mut rng, 20_000);
    let t = distort(&mut rng, &s, 12);
    let p = qbsdiff(&s, &t);

    for &bs in [1usize, 128, 1000, 4096, 1 << 16].iter() {
        let mut out = Vec::new();
        Bspatch::new(&p[..])
            .unwrap()
            .buffer_size(bs)
            .apply(io::Cursor::new(&s[..]), &mut out)
            .unwrap();
        assert_eq!(out, t, "buffer size {}", bs);
    }
}

#[test]
fn declared_size_matches_output() {
    let s = b"the quick brown fox jumps over the lazy dog".repeat(50);
    let mut t = s.clone();
    t.extend_from_slice(b"and then some");
    let p = qbsdiff(&s, &t);

    let patcher = Bspatch::new(&p[..]).unwrap();
    assert_eq!(patcher.hint_target_size(), t.len() as u64);
    assert_eq!(qbspatch(&s, &p).len(), t.len());
}
