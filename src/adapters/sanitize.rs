//! Log scrubbing for clinical content and key material.
//!
//! Narratives, notes and keys have redacting `Debug` impls, so they should never
//! reach a log line in the first place. This module is the fallback: every
//! formatted line passes through [`SanitizingMakeWriter`] before it hits the sink.
//!
//! Record, appointment and key ids are *not* redacted; audit lines are useless
//! without them.
//!
//! Input is capped at `CLINVAULT_SANITIZE_MAX_BYTES` (default 16 KiB) per call.

use regex::{Regex, RegexSet};
use std::sync::OnceLock;
use tracing_subscriber::fmt::MakeWriter;

static PATTERNS: OnceLock<Patterns> = OnceLock::new();

const DEFAULT_SANITIZE_MAX_BYTES: usize = 16 * 1024;

/// Narrative section names as they appear in canonical JSON.
const NARRATIVE_FIELDS: &str = "subjectiveReport|objectiveObservations|assessment|plan|\
                                interventions|riskAssessment|additionalNotes";

struct Rule {
    regex: Regex,
    replacement: &'static str,
}

struct Patterns {
    set: RegexSet,
    rules: Vec<Rule>,
    pem: Rule,
}

fn truncate_to_char_boundary(input: &str, max_bytes: usize) -> (&str, bool) {
    if input.len() <= max_bytes {
        return (input, false);
    }
    let mut end = max_bytes;
    while end > 0 && !input.is_char_boundary(end) {
        end -= 1;
    }
    (&input[..end], true)
}

fn max_sanitize_bytes() -> usize {
    std::env::var("CLINVAULT_SANITIZE_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|&v| v > 0)
        .unwrap_or(DEFAULT_SANITIZE_MAX_BYTES)
}

fn patterns() -> &'static Patterns {
    PATTERNS.get_or_init(|| {
        let narrative = format!(r#""(?:{NARRATIVE_FIELDS})"\s*:\s*"(?:[^"\\]|\\.)*""#);
        let rules: Vec<(String, &'static str)> = vec![
            (narrative, "\"[REDACTED-NARRATIVE]\""),
            (
                r"(?i)\b(?:ciphertext|narrative_encrypted|content_encrypted)\b\s*[:=]\s*\[?[A-Za-z0-9+/=, ]{16,}\]?".to_string(),
                "[REDACTED-CIPHERTEXT]",
            ),
            (
                r"(?i)\b(?:master[_-]?key|master[_-]?secret|data[_-]?key|secret|password|private[_-]?key|seed|token)\b\s*[:=]\s*[A-Za-z0-9+/]{16,}={0,2}".to_string(),
                "[REDACTED-SECRET]",
            ),
            (r"\b\d{3}-\d{2}-\d{4}\b".to_string(), "[REDACTED-SSN]"),
            (r"\bMRN[:\s]?\d{6,10}\b".to_string(), "[REDACTED-MRN]"),
            (
                r"(?i)\b[a-z0-9](?:[a-z0-9._%+-]{0,62}[a-z0-9])?@(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z]{2,}\b".to_string(),
                "[REDACTED-EMAIL]",
            ),
            // 64 hex chars is the master secret encoding.
            (r"\b[0-9a-fA-F]{64}\b".to_string(), "[REDACTED-KEY]"),
        ];

        let set = RegexSet::new(rules.iter().map(|(p, _)| p.as_str())).expect("Valid regex set");
        let rules = rules
            .into_iter()
            .map(|(pattern, replacement)| Rule {
                regex: Regex::new(&pattern).expect("Valid regex"),
                replacement,
            })
            .collect();

        // Kept out of the set; multi-line bounded patterns inflate it.
        let pem = Rule {
            regex: Regex::new(
                r"(?s)-----BEGIN [A-Z0-9 ]{0,40}PRIVATE KEY-----[\s\S]{0,8192}-----END [A-Z0-9 ]{0,40}PRIVATE KEY-----",
            )
            .expect("Valid regex"),
            replacement: "[REDACTED-PEM-PRIVATE-KEY]",
        };

        Patterns { set, rules, pem }
    })
}

/// Replace sensitive substrings in `input`.
#[must_use]
pub fn sanitize(input: &str) -> String {
    sanitize_with_limit(input, max_sanitize_bytes())
}

fn sanitize_with_limit(input: &str, max_bytes: usize) -> String {
    let patterns = patterns();
    let (prefix, truncated) = truncate_to_char_boundary(input, max_bytes);

    let mut result = prefix.to_string();
    for idx in patterns.set.matches(prefix).into_iter() {
        let rule = &patterns.rules[idx];
        result = rule.regex.replace_all(&result, rule.replacement).into_owned();
    }
    if result.contains("-----BEGIN ") {
        result = patterns
            .pem
            .regex
            .replace_all(&result, patterns.pem.replacement)
            .into_owned();
    }

    if truncated {
        result.push_str(" [TRUNCATED]");
    }
    result
}

/// Whether `input` would be altered by [`sanitize`].
#[must_use]
pub fn contains_sensitive(input: &str) -> bool {
    let patterns = patterns();
    let (prefix, _) = truncate_to_char_boundary(input, max_sanitize_bytes());
    patterns.set.is_match(prefix)
        || (prefix.contains("-----BEGIN ") && patterns.pem.regex.is_match(prefix))
}

/// `MakeWriter` that scrubs each formatted line before passing it on.
#[derive(Debug, Clone)]
pub struct SanitizingMakeWriter<M> {
    inner: M,
}

impl<M> SanitizingMakeWriter<M> {
    #[must_use]
    pub fn new(inner: M) -> Self {
        Self { inner }
    }
}

pub struct SanitizingWriter<W> {
    inner: W,
    buffer: Vec<u8>,
}

impl<W: std::io::Write> SanitizingWriter<W> {
    fn write_sanitized(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        let text = String::from_utf8_lossy(bytes);
        self.inner.write_all(sanitize(&text).as_bytes())
    }

    fn flush_lines(&mut self) -> std::io::Result<()> {
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.write_sanitized(&line)?;
        }
        Ok(())
    }
}

impl<W: std::io::Write> std::io::Write for SanitizingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend_from_slice(buf);

        // A single enormous line is flushed early rather than buffered without bound.
        let hard_cap = max_sanitize_bytes().saturating_mul(2);
        if self.buffer.len() > hard_cap {
            let pending = std::mem::take(&mut self.buffer);
            self.write_sanitized(&pending)?;
            self.inner.write_all(b"\n")?;
            return Ok(buf.len());
        }

        self.flush_lines()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.flush_lines()?;
        if !self.buffer.is_empty() {
            let pending = std::mem::take(&mut self.buffer);
            self.write_sanitized(&pending)?;
        }
        self.inner.flush()
    }
}

impl<'a, M> MakeWriter<'a> for SanitizingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = SanitizingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        SanitizingWriter {
            inner: self.inner.make_writer(),
            buffer: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_narrative_fields_are_redacted() {
        let input = r#"payload={"subjectiveReport":"patient reports \"low mood\"","plan":"CBT"}"#;
        let sanitized = sanitize(input);
        assert!(!sanitized.contains("low mood"));
        assert!(!sanitized.contains("CBT"));
        assert!(sanitized.contains("[REDACTED-NARRATIVE]"));
    }

    #[test]
    fn test_record_ids_survive() {
        let input = "record_id=550e8400-e29b-41d4-a716-446655440000 signed";
        assert_eq!(sanitize(input), input);
        assert!(!contains_sensitive(input));
    }

    #[test]
    fn test_master_secret_hex_is_redacted() {
        let input = format!("loaded {}", "ab".repeat(32));
        let sanitized = sanitize(&input);
        assert!(sanitized.contains("[REDACTED-KEY]"));
        assert!(!sanitized.contains("abab"));
    }

    #[test]
    fn test_contextual_secret() {
        let sanitized = sanitize("master_key=QWxhZGRpbjpvcGVuIHNlc2FtZQ==");
        assert!(sanitized.contains("[REDACTED-SECRET]"));
    }

    #[test]
    fn test_ssn_and_email() {
        let sanitized = sanitize("SSN: 123-45-6789 contact patient@clinic.org");
        assert!(sanitized.contains("[REDACTED-SSN]"));
        assert!(sanitized.contains("[REDACTED-EMAIL]"));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let sanitized = sanitize_with_limit("ééééé", 3);
        assert!(sanitized.starts_with('é'));
        assert!(sanitized.ends_with("[TRUNCATED]"));
    }

    #[test]
    fn test_writer_scrubs_each_line() {
        let mut sink = Vec::new();
        {
            let mut writer = SanitizingWriter {
                inner: &mut sink,
                buffer: Vec::new(),
            };
            writer
                .write_all(b"ok line\nSSN 123-45-6789\npartial")
                .expect("Should write");
            writer.flush().expect("Should flush");
        }
        let out = String::from_utf8(sink).expect("utf8");
        assert!(out.starts_with("ok line\n"));
        assert!(out.contains("[REDACTED-SSN]"));
        assert!(out.ends_with("partial"));
    }
}
