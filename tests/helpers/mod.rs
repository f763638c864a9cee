#![allow(dead_code)]

pub mod fakes;

use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub fn fixture_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

/// DER bytes of a PEM fixture, as a TLS handshake would deliver them.
pub fn fixture_der(name: &str) -> Vec<u8> {
    let pem = std::fs::read(fixture_path(name)).unwrap();
    x509_parser::pem::parse_x509_pem(&pem).unwrap().1.contents
}

/// Copies the named fixtures into a fresh temporary directory.
pub fn cert_dir_with(names: &[&str]) -> TempDir {
    let dir = TempDir::new().unwrap();
    for name in names {
        std::fs::copy(fixture_path(name), dir.path().join(name)).unwrap();
    }
    dir
}
