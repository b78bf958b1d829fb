// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Engine log interpretation.
//!
//! CRIU reports failures only as free-form log lines. The interpreter reads a
//! bounded tail of the log and matches it against a prioritized rule table.
//! The verbatim tail is always kept: matching is best-effort and operators
//! need the raw evidence when nothing matches.

use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Default number of trailing log lines inspected and kept.
pub const DEFAULT_TAIL_LINES: usize = 20;

/// Upper bound on bytes read from the end of a log file.
const TAIL_WINDOW_BYTES: u64 = 256 * 1024;

/// Outcome class of an engine log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogClassification {
    /// A mount's parent could not be found in the dumped namespace.
    MountAncestryMissing,
    /// The engine or the privilege wrapper was refused.
    PermissionDenied,
    /// The target process vanished or could not be seized.
    ProcessNotFound,
    /// A log exists but no known signature matched.
    Unknown,
    /// No log file was written.
    NoLog,
}

impl LogClassification {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::MountAncestryMissing => "MOUNT_ANCESTRY_MISSING",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::ProcessNotFound => "PROCESS_NOT_FOUND",
            Self::Unknown => "UNKNOWN",
            Self::NoLog => "NO_LOG",
        }
    }
}

impl fmt::Display for LogClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Structured result of interpreting one log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogReport {
    pub classification: LogClassification,
    /// Verbatim trailing lines, oldest first.
    pub tail: Vec<String>,
    /// The line that matched a rule, if any.
    pub matched_line: Option<String>,
    /// Mount id named by a mount-ancestry signature.
    pub missing_parent: Option<u64>,
}

impl LogReport {
    fn no_log() -> Self {
        Self {
            classification: LogClassification::NoLog,
            tail: Vec::new(),
            matched_line: None,
            missing_parent: None,
        }
    }

    /// Tail joined back into one block of text.
    pub fn tail_text(&self) -> String {
        self.tail.join("\n")
    }
}

#[derive(Debug, Clone)]
struct Rule {
    pattern: Regex,
    classification: LogClassification,
}

/// Prioritized (pattern, classification) table applied to log tails.
#[derive(Debug, Clone)]
pub struct LogInterpreter {
    rules: Vec<Rule>,
    tail_lines: usize,
}

impl LogInterpreter {
    /// Create an interpreter with the built-in CRIU signatures.
    pub fn new(tail_lines: usize) -> Self {
        Self {
            rules: default_rules(),
            tail_lines: tail_lines.max(1),
        }
    }

    /// Add a rule ahead of every existing one.
    pub fn with_rule(
        mut self,
        pattern: &str,
        classification: LogClassification,
    ) -> Result<Self, regex::Error> {
        let rule = Rule {
            pattern: Regex::new(pattern)?,
            classification,
        };
        self.rules.insert(0, rule);
        Ok(self)
    }

    pub fn tail_lines(&self) -> usize {
        self.tail_lines
    }

    /// Classify the log at `log_path`.
    ///
    /// Never fails: a missing log yields `NoLog`, an unreadable one yields
    /// `Unknown` with the read error as its only tail line.
    pub fn classify(&self, log_path: &Path) -> LogReport {
        match read_tail(log_path, self.tail_lines) {
            Ok(Some(tail)) => self.classify_lines(tail),
            Ok(None) => LogReport::no_log(),
            Err(e) => {
                tracing::warn!(path = %log_path.display(), error = %e, "Engine log unreadable");
                LogReport {
                    classification: LogClassification::Unknown,
                    tail: vec![format!("(failed to read log {}: {})", log_path.display(), e)],
                    matched_line: None,
                    missing_parent: None,
                }
            }
        }
    }

    /// Classify in-memory text such as captured stderr.
    pub fn classify_text(&self, text: &str) -> LogReport {
        if text.trim().is_empty() {
            return LogReport::no_log();
        }
        let lines: Vec<String> = text.lines().map(str::to_string).collect();
        let start = lines.len().saturating_sub(self.tail_lines);
        self.classify_lines(lines[start..].to_vec())
    }

    fn classify_lines(&self, tail: Vec<String>) -> LogReport {
        for rule in &self.rules {
            for line in &tail {
                if let Some(captures) = rule.pattern.captures(line) {
                    let missing_parent = captures
                        .get(1)
                        .and_then(|m| m.as_str().parse::<u64>().ok());
                    return LogReport {
                        classification: rule.classification,
                        matched_line: Some(line.clone()),
                        missing_parent,
                        tail,
                    };
                }
            }
        }

        LogReport {
            classification: LogClassification::Unknown,
            tail,
            matched_line: None,
            missing_parent: None,
        }
    }
}

impl Default for LogInterpreter {
    fn default() -> Self {
        Self::new(DEFAULT_TAIL_LINES)
    }
}

fn default_rules() -> Vec<Rule> {
    let table = [
        (
            r"Can't dump that as parent (\d+) is missing",
            LogClassification::MountAncestryMissing,
        ),
        (
            r"(?i)no (?:parent|root) found for mount(?:point)?(?: (\d+))?",
            LogClassification::MountAncestryMissing,
        ),
        (r"(?i)permission denied", LogClassification::PermissionDenied),
        (r"(?i)operation not permitted", LogClassification::PermissionDenied),
        (r"\bEPERM\b", LogClassification::PermissionDenied),
        (
            r"(?i)sudo: a (?:password|terminal) is required",
            LogClassification::PermissionDenied,
        ),
        (r"(?i)no process with such pid", LogClassification::ProcessNotFound),
        (r"(?i)can't seize", LogClassification::ProcessNotFound),
        (r"(?i)no such process|\bESRCH\b", LogClassification::ProcessNotFound),
    ];

    table
        .iter()
        .filter_map(|(pattern, classification)| {
            Regex::new(pattern).ok().map(|pattern| Rule {
                pattern,
                classification: *classification,
            })
        })
        .collect()
}

/// Read the last `lines` lines of a file, or `None` if it does not exist.
pub fn read_tail(path: &Path, lines: usize) -> std::io::Result<Option<Vec<String>>> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let len = file.metadata()?.len();
    let offset = len.saturating_sub(TAIL_WINDOW_BYTES);
    file.seek(SeekFrom::Start(offset))?;

    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    let text = String::from_utf8_lossy(&buf);

    let mut all: Vec<&str> = text.lines().collect();
    // Window may start mid-line
    if offset > 0 && !all.is_empty() {
        all.remove(0);
    }

    let start = all.len().saturating_sub(lines);
    Ok(Some(all[start..].iter().map(|l| l.to_string()).collect()))
}
