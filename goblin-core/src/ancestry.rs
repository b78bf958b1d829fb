// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Mount-namespace ancestry tracking.
//!
//! At freeze time the mount table of the goblin is recorded into its image.
//! Before a thawed goblin is frozen again, the recorded table is compared with
//! the live one: a restore rebuilds the namespace and bind mounts created by
//! the restore helper get fresh identifiers, so parents recorded by the
//! original freeze may no longer exist. The engine then refuses the dump.
//! The diagnosis here is advisory only; the engine stays authoritative.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::ProcessId;

/// One row of a process mount table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MountAncestryEntry {
    pub mount_id: u64,
    pub parent_id: u64,
    pub mount_point: PathBuf,
}

/// Mount table captured from one process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AncestryTable {
    entries: Vec<MountAncestryEntry>,
}

impl AncestryTable {
    pub fn new(entries: Vec<MountAncestryEntry>) -> Self {
        Self { entries }
    }

    /// Parse the contents of a `/proc/<pid>/mountinfo` file.
    /// Malformed lines are skipped.
    pub fn parse(mountinfo: &str) -> Self {
        Self {
            entries: mountinfo.lines().filter_map(parse_mountinfo_line).collect(),
        }
    }

    pub fn entries(&self) -> &[MountAncestryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_mount(&self, mount_id: u64) -> bool {
        self.entries.iter().any(|e| e.mount_id == mount_id)
    }

    /// The root mount: the entry mounted at `/`, or failing that the first
    /// entry whose parent lies outside the table.
    pub fn root(&self) -> Option<&MountAncestryEntry> {
        self.entries
            .iter()
            .find(|e| e.mount_point == Path::new("/"))
            .or_else(|| {
                let ids = self.mount_ids();
                self.entries.iter().find(|e| !ids.contains(&e.parent_id))
            })
    }

    /// Non-root entries whose parent is neither root nor another entry.
    pub fn orphans(&self) -> Vec<&MountAncestryEntry> {
        let Some(root) = self.root() else {
            return Vec::new();
        };
        let ids = self.mount_ids();
        self.entries
            .iter()
            .filter(|e| e.mount_id != root.mount_id)
            .filter(|e| e.parent_id != root.mount_id && !ids.contains(&e.parent_id))
            .collect()
    }

    fn mount_ids(&self) -> HashSet<u64> {
        self.entries.iter().map(|e| e.mount_id).collect()
    }
}

/// Parse a single line from mountinfo.
/// Format: mount_id parent_id major:minor root mount_point options [optional...] - fs_type source super_options
fn parse_mountinfo_line(line: &str) -> Option<MountAncestryEntry> {
    let parts: Vec<&str> = line.split_whitespace().collect();

    if parts.len() < 10 || !parts.contains(&"-") {
        return None;
    }

    let mount_id = parts[0].parse::<u64>().ok()?;
    let parent_id = parts[1].parse::<u64>().ok()?;
    let mount_point = PathBuf::from(unescape_octal(parts[4]));

    Some(MountAncestryEntry {
        mount_id,
        parent_id,
        mount_point,
    })
}

/// Undo the kernel's `\ooo` escaping of spaces, tabs, newlines and backslashes.
fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits
                    .iter()
                    .fold(0u16, |acc, b| acc * 8 + u16::from(b - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Result of comparing a recorded table against a live namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AncestryDiagnosis {
    /// Number of recorded entries that were checked.
    pub checked: usize,
    /// Recorded mounts whose parent no longer resolves.
    pub unresolved: Vec<MountAncestryEntry>,
}

impl AncestryDiagnosis {
    /// True when every recorded parent still resolves.
    pub fn is_clear(&self) -> bool {
        self.unresolved.is_empty()
    }

    /// Parent ids that failed to resolve, deduplicated and sorted.
    pub fn missing_parents(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.unresolved.iter().map(|e| e.parent_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// One-line advisory text suitable for an image note.
    pub fn summary(&self) -> String {
        if self.is_clear() {
            return format!("pre-flight ancestry check passed ({} mounts)", self.checked);
        }
        let mounts: Vec<String> = self
            .unresolved
            .iter()
            .map(|e| format!("{} (parent {})", e.mount_point.display(), e.parent_id))
            .collect();
        format!(
            "pre-flight ancestry check flagged {} of {} mounts with unresolved parents: {}",
            self.unresolved.len(),
            self.checked,
            mounts.join(", ")
        )
    }
}

/// Compare a recorded table with the current one.
///
/// A recorded non-root entry is unresolved when its parent id is not in the
/// current table. Entries parented on the recorded root count as resolved
/// as long as the current table has a root at all.
pub fn diagnose_tables(prior: &AncestryTable, current: &AncestryTable) -> AncestryDiagnosis {
    let prior_root = prior.root().map(|e| e.mount_id);
    let current_has_root = current.root().is_some();

    let mut checked = 0;
    let mut unresolved = Vec::new();

    for entry in prior.entries() {
        if Some(entry.mount_id) == prior_root {
            continue;
        }
        checked += 1;

        if Some(entry.parent_id) == prior_root && current_has_root {
            continue;
        }
        if !current.contains_mount(entry.parent_id) {
            unresolved.push(entry.clone());
        }
    }

    AncestryDiagnosis {
        checked,
        unresolved,
    }
}

/// Where mount tables come from.
pub trait MountTableSource: Send + Sync {
    /// Raw mountinfo text for `pid`.
    fn read(&self, pid: ProcessId) -> std::io::Result<String>;
}

/// Reads `/proc/<pid>/mountinfo`.
#[derive(Debug, Clone)]
pub struct ProcMountTable {
    proc_root: PathBuf,
}

impl ProcMountTable {
    pub fn new() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
        }
    }

    /// Use an alternative procfs mount point.
    pub fn with_root(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }
}

impl Default for ProcMountTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MountTableSource for ProcMountTable {
    fn read(&self, pid: ProcessId) -> std::io::Result<String> {
        std::fs::read_to_string(
            self.proc_root
                .join(pid.value().to_string())
                .join("mountinfo"),
        )
    }
}

/// Captures and diagnoses mount ancestry through a [`MountTableSource`].
#[derive(Debug, Clone)]
pub struct AncestryTracker<M> {
    source: M,
}

impl<M: MountTableSource> AncestryTracker<M> {
    pub fn new(source: M) -> Self {
        Self { source }
    }

    /// Record the live mount table of `pid`.
    pub fn capture(&self, pid: ProcessId) -> std::io::Result<AncestryTable> {
        let table = AncestryTable::parse(&self.source.read(pid)?);

        let orphans = table.orphans();
        if !orphans.is_empty() {
            tracing::debug!(
                pid = %pid,
                orphans = orphans.len(),
                "Captured mount table has entries without a recorded parent"
            );
        }

        Ok(table)
    }

    /// Check `prior` against the live namespace of `pid`.
    pub fn diagnose(
        &self,
        prior: &AncestryTable,
        pid: ProcessId,
    ) -> std::io::Result<AncestryDiagnosis> {
        let current = self.capture(pid)?;
        Ok(diagnose_tables(prior, &current))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST_MOUNTINFO: &str = "\
1 0 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
25 1 0:22 / /proc rw,nosuid shared:12 - proc proc rw
62 1 0:40 / /tmp rw,nosuid shared:20 - tmpfs tmpfs rw
80 62 0:41 / /tmp/goblin\\040data rw - tmpfs tmpfs rw
";

    fn entry(mount_id: u64, parent_id: u64, mount_point: &str) -> MountAncestryEntry {
        MountAncestryEntry {
            mount_id,
            parent_id,
            mount_point: PathBuf::from(mount_point),
        }
    }

    #[test]
    fn test_parse_mountinfo() {
        let table = AncestryTable::parse(HOST_MOUNTINFO);
        assert_eq!(table.len(), 4);
        assert_eq!(table.entries()[3], entry(80, 62, "/tmp/goblin data"));
        assert_eq!(table.root().map(|e| e.mount_id), Some(1));
    }

    #[test]
    fn test_parse_skips_malformed_lines() {
        let table = AncestryTable::parse("garbage\n\n36 35 98:0 / /x rw - ext3 /dev/root rw\n");
        assert_eq!(table.len(), 1);
        assert_eq!(table.entries()[0].parent_id, 35);
    }

    #[test]
    fn test_orphans() {
        let table = AncestryTable::new(vec![
            entry(1, 0, "/"),
            entry(2, 1, "/a"),
            entry(3, 99, "/b"),
        ]);
        let orphans = table.orphans();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].mount_id, 3);
    }

    #[test]
    fn test_diagnose_flags_missing_parent() {
        let prior = AncestryTable::parse(HOST_MOUNTINFO);
        // Restore renumbered /tmp
        let current = AncestryTable::new(vec![
            entry(1, 0, "/"),
            entry(90, 1, "/proc"),
            entry(91, 1, "/tmp"),
            entry(92, 91, "/tmp/goblin data"),
        ]);

        let diagnosis = diagnose_tables(&prior, &current);
        assert_eq!(diagnosis.checked, 3);
        assert!(!diagnosis.is_clear());
        assert_eq!(diagnosis.missing_parents(), vec![62]);
        assert!(diagnosis.summary().contains("parent 62"));
    }

    #[test]
    fn test_diagnose_clear_when_ancestry_survives() {
        let prior = AncestryTable::parse(HOST_MOUNTINFO);
        let current = AncestryTable::parse(HOST_MOUNTINFO);
        let diagnosis = diagnose_tables(&prior, &current);
        assert!(diagnosis.is_clear());
        assert!(diagnosis.summary().contains("passed"));
    }

    struct FixedSource(String);

    impl MountTableSource for FixedSource {
        fn read(&self, _pid: ProcessId) -> std::io::Result<String> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_tracker_capture_and_diagnose() {
        let tracker = AncestryTracker::new(FixedSource(HOST_MOUNTINFO.to_string()));
        let pid = ProcessId::new(100).unwrap();
        let table = tracker.capture(pid).unwrap();
        assert_eq!(table.len(), 4);
        assert!(tracker.diagnose(&table, pid).unwrap().is_clear());
    }

    #[test]
    fn test_proc_source_missing_pid() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = ProcMountTable::with_root(dir.path());
        assert!(source.read(ProcessId::new(7).unwrap()).is_err());
    }
}
