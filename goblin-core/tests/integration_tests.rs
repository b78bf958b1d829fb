// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! End-to-end integration tests for goblin lifecycle management.
//!
//! These tests drive the real `CriuEngine` subprocess supervision against a
//! shell script standing in for `criu`, so no privileges are needed.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use goblin_core::ancestry::ProcMountTable;
use goblin_core::{
    BeamRequest, Config, ConfigLoader, CriuEngine, FailureReason, FreezeRequest, GoblinError,
    GoblinManager, GoblinState, LogClassification, ProcessId, ThawRequest,
};
use tempfile::TempDir;

const FAKE_CRIU: &str = r#"#!/bin/sh
mode="$1"; shift
log=""; dir=""; pidfile=""
while [ $# -gt 0 ]; do
  case "$1" in
    -D) dir="$2"; shift 2 ;;
    -o) log="$2"; shift 2 ;;
    --pidfile) pidfile="$2"; shift 2 ;;
    *) shift ;;
  esac
done
behavior=$(cat "$(dirname "$0")/behavior" 2>/dev/null || echo ok)
case "$behavior" in
  slow)
    exec sleep 5
    ;;
  mount-fail)
    echo "(00.010) mnt: Can't dump that as parent 62 is missing" >> "$log"
    echo "(00.011) Error (criu/mount.c:1088): mnt: Failed to dump mounts" >> "$log"
    exit 1
    ;;
esac
if [ "$mode" = "dump" ]; then
  echo "(00.001) Dumping finished successfully" > "$log"
  echo img > "$dir/inventory.img"
else
  echo "(00.001) Restore finished successfully" > "$log"
  echo 4242 > "$pidfile"
fi
exit 0
"#;

struct Fixture {
    dir: TempDir,
    config: Config,
}

impl Fixture {
    fn new(extra_engine_yaml: &str) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let bin = dir.path().join("bin");
        std::fs::create_dir(&bin).unwrap();
        let criu = bin.join("criu");
        std::fs::write(&criu, FAKE_CRIU).expect("Failed to write fake criu");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&criu).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&criu, perms).unwrap();
        }

        let yaml = format!(
            "engine:\n  criu_path: {}\n  use_sudo: false\n  use_criu_ns: false\n{}\ngoblins:\n  root_dir: {}\n  pidfile_timeout_ms: 1000\n",
            criu.display(),
            extra_engine_yaml,
            dir.path().join("goblins").display()
        );
        let config = ConfigLoader::load_string(&yaml).expect("Fixture config must be valid");
        Self { dir, config }
    }

    fn set_behavior(&self, behavior: &str) {
        std::fs::write(self.dir.path().join("bin").join("behavior"), behavior).unwrap();
    }

    fn manager(&self) -> GoblinManager<CriuEngine, ProcMountTable> {
        let engine = CriuEngine::from_config(&self.config.engine).expect("Engine must resolve");
        GoblinManager::new(engine, ProcMountTable::new(), &self.config)
            .with_store()
            .expect("Store must load")
    }

    fn root(&self) -> PathBuf {
        self.dir.path().join("goblins")
    }
}

fn spawn_sleeper() -> (Child, ProcessId) {
    let child = Command::new("sleep")
        .arg("30")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("Failed to spawn sleep");
    let pid = ProcessId::new(child.id()).unwrap();
    (child, pid)
}

fn file_contains(path: &Path, needle: &str) -> bool {
    std::fs::read_to_string(path)
        .map(|s| s.contains(needle))
        .unwrap_or(false)
}

/// Test configuration loading and validation
#[test]
fn test_config_loading_and_validation() {
    let yaml = r#"
engine:
  use_sudo: true
  timeout_ms: 60000
  verbosity: 3
  tcp_established: true

goblins:
  root_dir: /srv/goblins
  log_tail_lines: 50
"#;

    let config = ConfigLoader::load_string(yaml).expect("Config should be valid");
    assert!(config.engine.use_sudo);
    assert!(config.engine.tcp_established);
    assert_eq!(config.engine.timeout, Duration::from_secs(60));
    assert_eq!(config.goblins.root_dir, PathBuf::from("/srv/goblins"));
    assert_eq!(config.goblins.log_tail_lines, 50);
}

/// Test that invalid configs are rejected
#[test]
fn test_invalid_config_rejected() {
    let bad_tail = "goblins:\n  log_tail_lines: 0\n";
    assert!(ConfigLoader::load_string(bad_tail).is_err());

    let bad_timeout = "engine:\n  timeout_ms: 99999999\n";
    assert!(ConfigLoader::load_string(bad_timeout).is_err());
}

/// Freeze, thaw and a re-freeze that hits a missing mount parent
#[test]
fn test_freeze_thaw_refreeze_cycle() {
    let fixture = Fixture::new("");
    let manager = fixture.manager();
    let (mut child, pid) = spawn_sleeper();

    let goblin = manager.adopt(pid).expect("Live process must be adoptable");
    let id = goblin.id.clone();

    // First freeze
    let first = manager
        .freeze(&id, FreezeRequest::default())
        .expect("First freeze should succeed");
    assert_eq!(first.dir, fixture.root().join(id.as_str()).join("first-freeze"));
    assert!(file_contains(&first.log_path, "Dumping finished successfully"));
    assert!(!first.ancestry.is_empty(), "Mount table of a live process was captured");
    assert!(first.ancestry.root().is_some());
    assert_eq!(manager.status(&id).unwrap().state, GoblinState::Frozen);

    // Thaw
    let thawed = manager
        .thaw(&id, ThawRequest::default())
        .expect("Thaw should succeed");
    assert_eq!(thawed.state, GoblinState::Running);
    assert_eq!(thawed.pid.map(|p| p.value()), Some(4242));
    assert_eq!(thawed.generation.value(), 2);
    assert!(first.dir.join("goblin-thaw.2.log").exists());

    // Re-freeze fails on mount ancestry
    fixture.set_behavior("mount-fail");
    let err = manager
        .freeze(&id, FreezeRequest::default())
        .expect_err("Re-freeze should fail");
    let failure = err.attempt().expect("Engine failure carries the attempt");
    assert_eq!(
        failure.classification(),
        Some(LogClassification::MountAncestryMissing)
    );
    assert_eq!(failure.sequence.map(|s| s.value()), Some(2));
    assert!(failure.tail.iter().any(|l| l.contains("parent 62 is missing")));
    assert!(err.to_string().contains("MOUNT_ANCESTRY_MISSING"));

    let after = manager.status(&id).unwrap();
    assert_eq!(after.state, GoblinState::Failed);
    assert_eq!(after.images.len(), 2);
    assert!(after.images[0].is_success());
    assert!(!after.images[1].is_success());
    assert!(after.images[1].dir.ends_with("second-freeze"));

    // A separate manager sees the same state through the registry file.
    let reopened = fixture.manager();
    let persisted = reopened.status(&id).unwrap();
    assert_eq!(persisted.state, GoblinState::Failed);
    assert_eq!(persisted.generation.value(), 2);
    assert!(persisted.last_failure.is_some());

    let _ = child.kill();
    let _ = child.wait();
}

/// A hung engine is killed once the timeout elapses
#[test]
fn test_engine_timeout_kills_subprocess() {
    let fixture = Fixture::new("  timeout_ms: 300\n  kill_grace_ms: 100\n");
    fixture.set_behavior("slow");
    let manager = fixture.manager();
    let (mut child, pid) = spawn_sleeper();
    let id = manager.adopt(pid).unwrap().id;

    let start = Instant::now();
    let err = manager
        .freeze(&id, FreezeRequest::default())
        .expect_err("Slow engine must time out");
    assert!(start.elapsed() < Duration::from_secs(4));
    assert!(matches!(err, GoblinError::Timeout(_)));
    assert_eq!(
        err.attempt().map(|f| f.reason),
        Some(FailureReason::Timeout { limit_ms: 300 })
    );
    assert_eq!(manager.status(&id).unwrap().state, GoblinState::Failed);

    let _ = child.kill();
    let _ = child.wait();
}

/// An engine that cannot be spawned leaves the goblin untouched
#[test]
fn test_unspawnable_engine_leaves_state() {
    let fixture = Fixture::new("");
    let mut config = fixture.config.clone();
    config.engine.criu_path = Some(fixture.dir.path().join("bin").join("missing-criu"));

    let engine = CriuEngine::from_config(&config.engine).unwrap();
    let manager = GoblinManager::new(engine, ProcMountTable::new(), &config);
    let (mut child, pid) = spawn_sleeper();
    let id = manager.adopt(pid).unwrap().id;

    let err = manager.freeze(&id, FreezeRequest::default()).unwrap_err();
    assert!(matches!(err, GoblinError::Engine(_)));

    let goblin = manager.status(&id).unwrap();
    assert_eq!(goblin.state, GoblinState::Running);
    assert_eq!(goblin.pid, Some(pid));
    assert!(goblin.images.is_empty());

    let _ = child.kill();
    let _ = child.wait();
}

/// Adopting a pid that does not exist is refused
#[test]
fn test_adopt_dead_process() {
    let fixture = Fixture::new("");
    let manager = fixture.manager();

    let mut child = Command::new("true").spawn().unwrap();
    let pid = ProcessId::new(child.id()).unwrap();
    child.wait().unwrap();

    assert!(matches!(
        manager.adopt(pid),
        Err(GoblinError::NoSuchProcess(_))
    ));
    assert!(manager.list().is_empty());
}

/// Launched goblins get their output captured under the goblin directory
#[test]
fn test_launch_captures_output() {
    let fixture = Fixture::new("");
    let manager = fixture.manager();

    let goblin = manager
        .launch(vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo launched; sleep 1".to_string(),
        ])
        .expect("Launch should succeed");
    assert_eq!(goblin.state, GoblinState::Running);

    let output = manager.layout().output_path(&goblin.id);
    let deadline = Instant::now() + Duration::from_secs(5);
    while !file_contains(&output, "launched") {
        assert!(Instant::now() < deadline, "Goblin output never appeared");
        std::thread::sleep(Duration::from_millis(20));
    }
}

/// Beam dumps, restores and removes the image in one call
#[test]
fn test_beam_with_cleanup() {
    let fixture = Fixture::new("");
    let manager = fixture.manager();
    let (mut child, pid) = spawn_sleeper();
    let id = manager.adopt(pid).unwrap().id;

    let request = BeamRequest {
        cleanup: true,
        ..BeamRequest::default()
    };
    let outcome = manager.beam(&id, request).expect("Beam should succeed");
    assert_eq!(outcome.goblin.state, GoblinState::Running);
    assert_eq!(outcome.goblin.pid.map(|p| p.value()), Some(4242));
    assert!(outcome.cleaned_up);
    assert!(!outcome.image.dir.exists());

    let reopened = fixture.manager();
    let persisted = reopened.status(&id).unwrap();
    assert_eq!(persisted.state, GoblinState::Running);
    assert_eq!(persisted.generation.value(), 2);

    let _ = child.kill();
    let _ = child.wait();
}

/// Two managers over one root see each other's freezes
#[test]
fn test_managers_share_registry_updates() {
    let fixture = Fixture::new("");
    let setup = fixture.manager();
    let (mut first_child, first_pid) = spawn_sleeper();
    let (mut second_child, second_pid) = spawn_sleeper();
    let first = setup.adopt(first_pid).unwrap().id;
    let second = setup.adopt(second_pid).unwrap().id;

    let one = fixture.manager();
    let two = fixture.manager();
    one.freeze(&first, FreezeRequest::default()).unwrap();
    two.freeze(&second, FreezeRequest::default()).unwrap();

    let reopened = fixture.manager();
    assert_eq!(reopened.status(&first).unwrap().state, GoblinState::Frozen);
    assert_eq!(reopened.status(&second).unwrap().state, GoblinState::Frozen);

    for child in [&mut first_child, &mut second_child] {
        let _ = child.kill();
        let _ = child.wait();
    }
}
