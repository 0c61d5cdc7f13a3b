//! Master secret generation utility.
//!
//! Writes 32 bytes of OS entropy as 64 hex characters, the format
//! `CLINVAULT_MASTER_KEY_FILE` and the Docker secret expect.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin generate_master_secret -- --out <path> [--force]
//! ```
//!
//! The file is created with 0600 permissions (Unix). Only a short SHA-256
//! fingerprint of the secret is printed, so operators can tell secrets apart.

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::io::Write;
use std::path::PathBuf;
use zeroize::Zeroizing;

const USAGE: &str = "Usage: generate_master_secret --out <path> [--force]";

fn main() {
    let mut args = std::env::args().skip(1);
    let mut out_path: Option<PathBuf> = None;
    let mut force = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--out" => {
                let p = args.next().unwrap_or_default();
                if p.is_empty() {
                    eprintln!("{USAGE}");
                    std::process::exit(2);
                }
                out_path = Some(PathBuf::from(p));
            }
            "--force" => force = true,
            "-h" | "--help" => {
                println!(
                    "{USAGE}\n\nWrites a fresh 256-bit master secret (hex) to <path> with 0600 permissions. Prints only a fingerprint."
                );
                return;
            }
            _ => {
                eprintln!("Unknown arg: {arg}\n{USAGE}");
                std::process::exit(2);
            }
        }
    }

    let out_path = out_path.unwrap_or_else(|| {
        eprintln!("{USAGE}");
        std::process::exit(2);
    });

    if out_path.exists() && !force {
        eprintln!("Refusing to overwrite existing file {out_path:?}. Use --force.");
        std::process::exit(3);
    }

    let mut secret = Zeroizing::new([0u8; 32]);
    OsRng.fill_bytes(secret.as_mut());
    let secret_hex = Zeroizing::new(hex::encode(secret.as_ref()));
    let fingerprint = hex::encode(&Sha256::digest(secret.as_ref())[..8]);

    if let Some(parent) = out_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let mut opts = std::fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        opts.mode(0o600);
    }

    let mut file = opts.open(&out_path).unwrap_or_else(|e| {
        eprintln!("Failed to open {out_path:?}: {e}");
        std::process::exit(4);
    });

    let written = file
        .write_all(secret_hex.as_bytes())
        .and_then(|()| file.write_all(b"\n"))
        .and_then(|()| file.sync_all());
    if let Err(e) = written {
        eprintln!("Failed to write {out_path:?}: {e}");
        std::process::exit(4);
    }

    println!("Wrote master secret (hex) to {out_path:?}");
    println!("MASTER_SECRET_FINGERPRINT={fingerprint}");
}
