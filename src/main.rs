//! Clinvault: key administration for the clinical record store.
//!
//! ```text
//! clinvault status
//! clinvault rotate <purpose>
//! clinvault revoke <key-id>
//! clinvault migrate
//! clinvault enroll <clinician-id> <public-key-b64>
//! ```

use std::io::IsTerminal;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use clinvault::adapters::sanitize::SanitizingMakeWriter;
use clinvault::adapters::TracingAuditSink;
use clinvault::application::Services;
use clinvault::config::{load_master_secret, Settings};
use clinvault::domain::{Actor, KeyPurpose, Role};

const USAGE: &str = "Usage: clinvault <status | rotate <purpose> | revoke <key-id> | migrate | \
     enroll <clinician-id> <public-key-b64>>";

enum Command {
    Status,
    Rotate(KeyPurpose),
    Revoke(String),
    Migrate,
    Enroll { clinician_id: String, public_key: String },
}

fn parse_command(mut args: impl Iterator<Item = String>) -> Result<Command> {
    let command = args.next().ok_or_else(|| anyhow!(USAGE))?;
    let parsed = match command.as_str() {
        "status" => Command::Status,
        "rotate" => {
            let purpose = args.next().ok_or_else(|| anyhow!(USAGE))?;
            Command::Rotate(purpose.parse()?)
        }
        "revoke" => Command::Revoke(args.next().ok_or_else(|| anyhow!(USAGE))?),
        "migrate" => Command::Migrate,
        "enroll" => Command::Enroll {
            clinician_id: args.next().ok_or_else(|| anyhow!(USAGE))?,
            public_key: args.next().ok_or_else(|| anyhow!(USAGE))?,
        },
        other => return Err(anyhow!("Unknown command {other:?}\n{USAGE}")),
    };
    if let Some(extra) = args.next() {
        return Err(anyhow!("Unexpected argument {extra:?}\n{USAGE}"));
    }
    Ok(parsed)
}

fn main() -> Result<()> {
    // Logs default to a file on an interactive TTY and to stdout otherwise
    // (so `docker logs` works).
    let log_mode = std::env::var("CLINVAULT_LOG_MODE").unwrap_or_else(|_| "auto".to_string());
    let use_file = match log_mode.as_str() {
        "file" => true,
        "stdout" => false,
        _ => std::io::stdout().is_terminal(),
    };

    let (writer, _guard) = if use_file {
        let log_file =
            std::env::var("CLINVAULT_LOG_FILE").unwrap_or_else(|_| "clinvault.log".to_string());
        if let Some(parent) = std::path::Path::new(&log_file).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .with_context(|| format!("Failed to open log file {log_file}"))?;
        tracing_appender::non_blocking(file)
    } else {
        tracing_appender::non_blocking(std::io::stdout())
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(SanitizingMakeWriter::new(writer)))
        .init();

    let command = parse_command(std::env::args().skip(1))?;

    // Refuse to start without a valid master secret.
    let master = load_master_secret().context("Master secret unavailable")?;
    let settings = Settings::from_env_or_default();
    let services = Services::open(&settings, master, Arc::new(TracingAuditSink))?;

    let operator_id =
        std::env::var("CLINVAULT_OPERATOR_ID").unwrap_or_else(|_| "clinvault-cli".to_string());
    let operator = Actor::new(operator_id, Role::Admin);

    match command {
        Command::Status => {
            for purpose in KeyPurpose::ALL {
                for key in services.keys.list_keys(purpose)? {
                    let state = if key.is_revoked() {
                        "revoked"
                    } else if key.is_expired() {
                        "expired"
                    } else if key.is_active {
                        "active"
                    } else {
                        "rotated"
                    };
                    println!(
                        "{purpose}\tv{}\t{state}\t{}\tcreated {}",
                        key.version,
                        key.id,
                        key.created_at.to_rfc3339()
                    );
                }
            }
        }
        Command::Rotate(purpose) => {
            let rotation = services.keys.rotate_key(purpose)?;
            match rotation.old_key {
                Some(old) => println!(
                    "{purpose}: v{} -> v{} ({})",
                    old.version, rotation.new_key.version, rotation.new_key.id
                ),
                None => println!(
                    "{purpose}: created v{} ({})",
                    rotation.new_key.version, rotation.new_key.id
                ),
            }
        }
        Command::Revoke(key_id) => {
            let key = services.keys.revoke_key(&key_id, Some(&operator.id))?;
            println!("Revoked {} v{} ({})", key.purpose, key.version, key.id);
        }
        Command::Migrate => {
            let report = services.sessions.migrate_record_keys(&operator)?;
            println!(
                "Target key {}: migrated {}, locked {}, conflicts {}, failed {}",
                report.target_key_id,
                report.migrated.len(),
                report.skipped_locked.len(),
                report.skipped_conflict.len(),
                report.failed.len()
            );
            for (record_id, err) in &report.failed {
                eprintln!("{record_id}: {err}");
            }
        }
        Command::Enroll {
            clinician_id,
            public_key,
        } => {
            let key = services
                .clinician_keys
                .register_key(&clinician_id, &public_key, &operator)?;
            println!("Enrolled attestation key {} for {}", key.public_key_b64, key.clinician_id);
        }
    }

    Ok(())
}
