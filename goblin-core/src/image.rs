// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Freeze images and the on-disk layout of attempt directories.
//!
//! Every freeze attempt, successful or not, produces one [`Image`]. Images
//! are immutable once recorded and each lives in its own directory, so an
//! earlier image is never overwritten by a later attempt.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::ancestry::{AncestryDiagnosis, AncestryTable};
use crate::error::{GoblinError, GoblinResult};
use crate::log_interpreter::LogClassification;
use crate::types::{Generation, GoblinId, ProcessId, SequenceNumber};

/// Metadata file written into every image directory.
pub const IMAGE_METADATA_FILE: &str = ".goblin_image.json";

/// Registry snapshot file under the root directory.
pub const REGISTRY_FILE: &str = "goblins.json";

/// Per-goblin lock file held for the duration of a freeze or thaw.
pub const TRANSITION_LOCK_FILE: &str = ".transition.lock";

/// Captured stdout/stderr of launched goblins.
pub const OUTPUT_FILE: &str = "goblin.out";

/// Link-target prefix of an unnamed pipe in `/proc/<pid>/fd`.
pub const PIPE_PREFIX: &str = "pipe:[";

/// Lifecycle operation that produced an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Freeze,
    Thaw,
}

impl Operation {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Freeze => "freeze",
            Self::Thaw => "thaw",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Why an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// The engine was killed after exceeding its time limit.
    Timeout { limit_ms: u64 },
    /// The engine exited unsuccessfully; the log was classified.
    Engine(LogClassification),
    /// Restore succeeded but the new pid never appeared in the pidfile.
    MissingPid { waited_ms: u64 },
}

impl FailureReason {
    pub fn classification(&self) -> Option<LogClassification> {
        match self {
            Self::Engine(class) => Some(*class),
            _ => None,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { limit_ms } => write!(f, "TIMEOUT after {}ms", limit_ms),
            Self::Engine(class) => write!(f, "{}", class),
            Self::MissingPid { waited_ms } => {
                write!(f, "MISSING_PID (no pidfile after {}ms)", waited_ms)
            }
        }
    }
}

/// Result of the engine run that produced an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageOutcome {
    Success,
    Failure {
        reason: FailureReason,
        /// Verbatim log tail.
        tail: Vec<String>,
    },
}

/// Artifact of one freeze attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub goblin_id: GoblinId,
    pub sequence: SequenceNumber,
    /// Generation of the process that was frozen.
    pub generation: Generation,
    pub dir: PathBuf,
    pub log_path: PathBuf,
    pub pid: ProcessId,
    /// Mount table of the process, captured before the dump.
    pub ancestry: AncestryTable,
    /// Link targets of fds 0..=2 at freeze time, keyed by stream name.
    #[serde(default)]
    pub stdio: BTreeMap<String, String>,
    /// Ancestry check run before re-freezing a restored goblin.
    pub preflight: Option<AncestryDiagnosis>,
    pub advisory: Option<String>,
    pub outcome: ImageOutcome,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub created_at: SystemTime,
}

impl Image {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ImageOutcome::Success)
    }

    /// Directory name of this attempt, e.g. `second-freeze`.
    pub fn name(&self) -> String {
        attempt_name(self.sequence)
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        match &self.outcome {
            ImageOutcome::Failure { reason, .. } => Some(*reason),
            ImageOutcome::Success => None,
        }
    }

    /// Write `.goblin_image.json` into the image directory.
    pub fn write_metadata(&self) -> GoblinResult<()> {
        let path = self.dir.join(IMAGE_METADATA_FILE);
        let json = serde_json::to_string_pretty(self).map_err(|e| GoblinError::Persistence {
            path: path.clone(),
            message: e.to_string(),
        })?;
        std::fs::write(&path, json).map_err(|e| GoblinError::Io {
            context: "writing image metadata",
            path,
            source: e,
        })
    }

    /// Read the metadata file of an image directory.
    pub fn read_metadata(dir: &Path) -> GoblinResult<Self> {
        let path = dir.join(IMAGE_METADATA_FILE);
        let content = std::fs::read_to_string(&path).map_err(|e| GoblinError::Io {
            context: "reading image metadata",
            path: path.clone(),
            source: e,
        })?;
        serde_json::from_str(&content).map_err(|e| GoblinError::Persistence {
            path,
            message: e.to_string(),
        })
    }
}

/// Name of the attempt directory for a sequence number.
pub fn attempt_name(sequence: SequenceNumber) -> String {
    format!("{}-freeze", sequence.ordinal())
}

/// A failed freeze or thaw, as reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptFailure {
    pub goblin_id: GoblinId,
    pub operation: Operation,
    /// Freeze sequence, or the sequence of the image a thaw restored from.
    pub sequence: Option<SequenceNumber>,
    pub generation: Generation,
    pub reason: FailureReason,
    pub tail: Vec<String>,
    pub advisory: Option<String>,
    pub log_path: Option<PathBuf>,
}

impl AttemptFailure {
    pub fn classification(&self) -> Option<LogClassification> {
        self.reason.classification()
    }
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of goblin {}", self.operation, self.goblin_id)?;
        if let Some(seq) = self.sequence {
            write!(f, " ({})", attempt_name(seq))?;
        }
        write!(f, " at generation {} failed: {}", self.generation, self.reason)?;
        if let Some(advisory) = &self.advisory {
            write!(f, "\nadvisory: {}", advisory)?;
        }
        if let Some(log) = &self.log_path {
            write!(f, "\nlog: {}", log.display())?;
        }
        if !self.tail.is_empty() {
            write!(f, "\n--- log tail ---\n{}", self.tail.join("\n"))?;
        }
        Ok(())
    }
}

/// Filesystem layout under the goblin root directory.
#[derive(Debug, Clone)]
pub struct ImageLayout {
    root: PathBuf,
}

impl ImageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn goblin_dir(&self, id: &GoblinId) -> PathBuf {
        self.root.join(id.as_str())
    }

    pub fn image_dir(&self, id: &GoblinId, sequence: SequenceNumber) -> PathBuf {
        self.goblin_dir(id).join(attempt_name(sequence))
    }

    pub fn freeze_log(&self, id: &GoblinId, sequence: SequenceNumber) -> PathBuf {
        self.image_dir(id, sequence)
            .join(format!("{}.log", attempt_name(sequence)))
    }

    /// Restore log inside the image directory being restored.
    pub fn thaw_log(image_dir: &Path, generation: Generation) -> PathBuf {
        image_dir.join(format!("goblin-thaw.{}.log", generation))
    }

    pub fn thaw_pidfile(image_dir: &Path, generation: Generation) -> PathBuf {
        image_dir.join(format!("goblin-thaw.{}.pid", generation))
    }

    pub fn output_path(&self, id: &GoblinId) -> PathBuf {
        self.goblin_dir(id).join(OUTPUT_FILE)
    }

    pub fn registry_path(&self) -> PathBuf {
        self.root.join(REGISTRY_FILE)
    }

    pub fn transition_lock_path(&self, id: &GoblinId) -> PathBuf {
        self.goblin_dir(id).join(TRANSITION_LOCK_FILE)
    }
}

/// Record where fds 0, 1 and 2 of `pid` point (e.g. `pipe:[12345]`).
///
/// Unreadable descriptors are skipped.
pub fn capture_stdio(pid: ProcessId) -> BTreeMap<String, String> {
    capture_stdio_from(Path::new("/proc"), pid)
}

fn capture_stdio_from(proc_root: &Path, pid: ProcessId) -> BTreeMap<String, String> {
    let fd_dir = proc_root.join(pid.to_string()).join("fd");
    [("stdin", 0), ("stdout", 1), ("stderr", 2)]
        .iter()
        .filter_map(|(name, fd)| {
            std::fs::read_link(fd_dir.join(fd.to_string()))
                .ok()
                .map(|target| (name.to_string(), target.to_string_lossy().into_owned()))
        })
        .collect()
}
