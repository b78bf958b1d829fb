// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Goblin lifecycle manager.
//!
//! Drives freeze and thaw through the engine and keeps the registry
//! consistent with what landed on disk. Every call is synchronous and holds
//! the goblin's transition lock for its whole duration, so a second freeze or
//! thaw on the same goblin fails with `Conflict` while other goblins proceed.
//! The lock is a `flock` on `<root>/<id>/.transition.lock` and so also
//! excludes other processes sharing the root directory.
//!
//! Failure policy:
//! - `NotFound` / `Conflict`: nothing changed, nothing was invoked.
//! - `Io` / `Engine`: the attempt aborted before the engine produced an
//!   outcome; state is unchanged.
//! - `EngineFailure` / `Timeout`: the goblin is now `Failed` and, for a
//!   freeze, a failed image was recorded.

use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::ancestry::{AncestryDiagnosis, AncestryTable, AncestryTracker, MountTableSource, ProcMountTable};
use crate::config::Config;
use crate::engine::{
    wait_for_pidfile, CriuEngine, Direction, Engine, EngineTarget, InheritFd, InvocationOptions,
    InvocationResult,
};
use crate::error::{GoblinError, GoblinResult, StateTransitionError};
use crate::image::{capture_stdio, AttemptFailure, FailureReason, Image, ImageLayout, ImageOutcome, Operation};
use crate::log_interpreter::{LogClassification, LogInterpreter};
use crate::process::{open_stdio_replacements, process_exists, spawn_detached};
use crate::registry::{Goblin, GoblinRegistry, TransitionGuard};
use crate::state::GoblinState;
use crate::storage::{FileLock, RegistryStore};
use crate::types::{GoblinId, ProcessId};

/// Options for one freeze.
#[derive(Debug, Clone, Default)]
pub struct FreezeRequest {
    /// Process to dump. Optional while `Running` (must match the tracked
    /// pid if given); required when re-freezing a `Failed` goblin.
    pub pid: Option<ProcessId>,
    /// Overrides the configured engine timeout.
    pub timeout: Option<Duration>,
    /// Overrides the configured `leave_running`.
    pub leave_running: Option<bool>,
}

/// Options for one thaw.
#[derive(Debug, Clone, Default)]
pub struct ThawRequest {
    /// Image directory to restore; defaults to the latest successful image.
    pub source: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

/// Options for a freeze followed straight away by a thaw of the new image.
#[derive(Debug, Clone, Default)]
pub struct BeamRequest {
    /// `leave_running` is ignored: the dumped process always stops.
    pub freeze: FreezeRequest,
    pub thaw_timeout: Option<Duration>,
    /// Delete the image directory once the goblin runs again.
    pub cleanup: bool,
}

/// Result of a beam.
#[derive(Debug, Clone)]
pub struct BeamOutcome {
    pub image: Image,
    pub goblin: Goblin,
    /// Whether the image directory was removed.
    pub cleaned_up: bool,
}

struct FailureDetails {
    reason: FailureReason,
    tail: Vec<String>,
    missing_parent: Option<u64>,
}

/// In-process and cross-process claim on one goblin.
struct Transition<'a> {
    _guard: TransitionGuard<'a>,
    _lock: FileLock,
}

/// Lifecycle manager over an engine `E` and a mount table source `M`.
pub struct GoblinManager<E, M> {
    engine: E,
    tracker: AncestryTracker<M>,
    interpreter: LogInterpreter,
    registry: GoblinRegistry,
    layout: ImageLayout,
    store: Option<RegistryStore>,
    engine_timeout: Duration,
    leave_running: bool,
    pidfile_timeout: Duration,
}

impl GoblinManager<CriuEngine, ProcMountTable> {
    /// Build a manager backed by CRIU and `/proc`, with the registry
    /// persisted under the configured root directory.
    pub fn open(config: &Config) -> GoblinResult<Self> {
        let engine = CriuEngine::from_config(&config.engine)?
            .with_tail_lines(config.goblins.log_tail_lines);
        Self::new(engine, ProcMountTable::new(), config).with_store()
    }
}

impl<E: Engine, M: MountTableSource> GoblinManager<E, M> {
    pub fn new(engine: E, mounts: M, config: &Config) -> Self {
        Self {
            engine,
            tracker: AncestryTracker::new(mounts),
            interpreter: LogInterpreter::new(config.goblins.log_tail_lines),
            registry: GoblinRegistry::new(),
            layout: ImageLayout::new(&config.goblins.root_dir),
            store: None,
            engine_timeout: config.engine.timeout,
            leave_running: config.engine.leave_running,
            pidfile_timeout: config.goblins.pidfile_timeout,
        }
    }

    /// Persist the registry to `<root>/goblins.json`, loading what is there.
    pub fn with_store(mut self) -> GoblinResult<Self> {
        let store = RegistryStore::new(self.layout.registry_path());
        let loaded = store.load_into(&self.registry)?;
        tracing::debug!(path = %store.path().display(), goblins = loaded, "Registry store attached");
        self.store = Some(store);
        Ok(self)
    }

    /// Replace the log interpreter, e.g. to add site-specific rules.
    pub fn with_interpreter(mut self, interpreter: LogInterpreter) -> Self {
        self.interpreter = interpreter;
        self
    }

    pub fn registry(&self) -> &GoblinRegistry {
        &self.registry
    }

    pub fn layout(&self) -> &ImageLayout {
        &self.layout
    }

    /// Spawn `command` and track it as a new goblin.
    pub fn launch(&self, command: Vec<String>) -> GoblinResult<Goblin> {
        let id = GoblinId::generate();
        let output = self.layout.output_path(&id);
        let pid = spawn_detached(&command, &output)?;

        let goblin = self.commit(|registry| registry.create_with_id(id, pid, Some(command)))?;
        tracing::info!(goblin_id = %goblin.id, pid = %pid, "Goblin launched");
        Ok(goblin)
    }

    /// Track an already running process.
    pub fn adopt(&self, pid: ProcessId) -> GoblinResult<Goblin> {
        if !process_exists(pid) {
            return Err(GoblinError::NoSuchProcess(pid));
        }
        self.create(pid, None)
    }

    /// Register `pid` as a new `Running` goblin without checking that it is alive.
    pub fn create(&self, pid: ProcessId, command: Option<Vec<String>>) -> GoblinResult<Goblin> {
        self.commit(|registry| registry.create(pid, command))
    }

    pub fn status(&self, id: &GoblinId) -> GoblinResult<Goblin> {
        self.refresh()?;
        self.registry.get(id)
    }

    pub fn list(&self) -> Vec<Goblin> {
        if let Err(e) = self.refresh() {
            tracing::warn!(error = %e, "Listing goblins from memory");
        }
        self.registry.list()
    }

    /// Drop a goblin from the registry. Its images stay on disk.
    pub fn forget(&self, id: &GoblinId) -> GoblinResult<Goblin> {
        self.refresh()?;
        self.registry.get_state(id)?;
        let _lock = self.lock_goblin(id)?;

        let goblin = self.commit(|registry| {
            let state = registry.get_state(id)?;
            if state == GoblinState::Running {
                return Err(StateTransitionError::OperationNotAllowed {
                    goblin_id: id.clone(),
                    operation: "forget",
                    state: state.name(),
                }
                .into());
            }
            registry.remove(id)
        })?;
        tracing::info!(goblin_id = %id, images = goblin.images.len(), "Goblin forgotten");
        Ok(goblin)
    }

    /// Checkpoint a goblin into a new image directory.
    ///
    /// Returns the recorded image on success. A failed dump still records an
    /// image and moves the goblin to `Failed`.
    pub fn freeze(&self, id: &GoblinId, request: FreezeRequest) -> GoblinResult<Image> {
        let _transition = self.begin(id)?;
        let goblin = self.registry.get(id)?;
        let pid = freeze_target(&goblin, request.pid)?;

        let preflight = self.preflight(&goblin, pid);

        let sequence = self.commit(|registry| registry.allocate_sequence(id))?;
        let dir = self.layout.image_dir(id, sequence);
        prepare_image_dir(&dir)?;

        let ancestry = self.tracker.capture(pid).unwrap_or_else(|e| {
            tracing::warn!(goblin_id = %id, pid = %pid, error = %e, "Mount table capture failed");
            AncestryTable::default()
        });
        let stdio = capture_stdio(pid);

        let timeout = request.timeout.unwrap_or(self.engine_timeout);
        let options = InvocationOptions {
            log_path: self.layout.freeze_log(id, sequence),
            pidfile: None,
            timeout,
            leave_running: request.leave_running.unwrap_or(self.leave_running),
            inherit_fds: Vec::new(),
        };

        tracing::info!(
            goblin_id = %id,
            pid = %pid,
            sequence = %sequence,
            generation = %goblin.generation,
            dir = %dir.display(),
            "Freezing goblin"
        );

        let result = match self
            .engine
            .invoke(Direction::Dump, &EngineTarget::Process(pid), &dir, &options)
        {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(goblin_id = %id, sequence = %sequence, error = %e, "Engine did not run");
                // Only removes the directory if the engine left it empty.
                let _ = std::fs::remove_dir(&dir);
                return Err(e.into());
            }
        };

        let flagged = preflight.as_ref().filter(|d| !d.is_clear());
        let mut image = Image {
            goblin_id: id.clone(),
            sequence,
            generation: goblin.generation,
            dir,
            log_path: result.log_path.clone(),
            pid,
            ancestry,
            stdio,
            preflight: preflight.clone(),
            advisory: None,
            outcome: ImageOutcome::Success,
            exit_code: result.exit_code,
            duration_ms: result.duration.as_millis() as u64,
            created_at: SystemTime::now(),
        };

        if result.success {
            image.advisory = flagged.map(|d| format!("freeze succeeded; {}", d.summary()));
            write_image_metadata(&image);

            let recorded = image.clone();
            self.commit(|registry| registry.complete_freeze(id, recorded, None))?;
            tracing::info!(
                goblin_id = %id,
                sequence = %sequence,
                elapsed_ms = image.duration_ms,
                "Goblin frozen"
            );
            return Ok(image);
        }

        let details = self.failure_details(&result, timeout);
        let advisory = freeze_advisory(flagged, &details);
        image.advisory = advisory.clone();
        image.outcome = ImageOutcome::Failure {
            reason: details.reason,
            tail: details.tail.clone(),
        };
        write_image_metadata(&image);

        let failure = AttemptFailure {
            goblin_id: id.clone(),
            operation: Operation::Freeze,
            sequence: Some(sequence),
            generation: goblin.generation,
            reason: details.reason,
            tail: details.tail,
            advisory,
            log_path: Some(result.log_path.clone()),
        };

        let recorded = failure.clone();
        self.commit(|registry| registry.complete_freeze(id, image, Some(recorded)))?;
        tracing::error!(
            goblin_id = %id,
            sequence = %sequence,
            reason = %failure.reason,
            "Freeze failed"
        );
        Err(attempt_error(failure))
    }

    /// Restore a goblin from an image and attach the new process.
    pub fn thaw(&self, id: &GoblinId, request: ThawRequest) -> GoblinResult<Goblin> {
        let _transition = self.begin(id)?;
        let goblin = self.registry.get(id)?;
        let source = check_restore_source(&thaw_source(&goblin, request.source)?)?;

        let source_image = goblin
            .images
            .iter()
            .find(|i| i.is_success() && same_dir(&i.dir, &source));
        let restored_from = source_image.map(|i| i.sequence);
        let stdio = match source_image {
            Some(image) => image.stdio.clone(),
            None => Image::read_metadata(&source)
                .map(|image| image.stdio)
                .unwrap_or_default(),
        };
        let replacements = open_stdio_replacements(&stdio, &self.layout.output_path(id))?;

        let next_generation = goblin.generation.next();
        let pidfile = ImageLayout::thaw_pidfile(&source, next_generation);
        if let Err(e) = std::fs::remove_file(&pidfile) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(GoblinError::Io {
                    context: "removing stale pidfile",
                    path: pidfile,
                    source: e,
                });
            }
        }

        let timeout = request.timeout.unwrap_or(self.engine_timeout);
        let options = InvocationOptions {
            log_path: ImageLayout::thaw_log(&source, next_generation),
            pidfile: Some(pidfile.clone()),
            timeout,
            leave_running: false,
            inherit_fds: replacements
                .iter()
                .map(|r| InheritFd {
                    fd: r.file.as_raw_fd(),
                    resource: r.resource.clone(),
                })
                .collect(),
        };

        tracing::info!(
            goblin_id = %id,
            source = %source.display(),
            generation = %next_generation,
            reattached = replacements.len(),
            "Thawing goblin"
        );

        let result = self.engine.invoke(
            Direction::Restore,
            &EngineTarget::Image(source.clone()),
            &source,
            &options,
        )?;
        drop(replacements);

        if !result.success {
            let details = self.failure_details(&result, timeout);
            let advisory = details
                .missing_parent
                .map(|parent| format!("restore could not find parent mount {}", parent));
            let failure = AttemptFailure {
                goblin_id: id.clone(),
                operation: Operation::Thaw,
                sequence: restored_from,
                generation: goblin.generation,
                reason: details.reason,
                tail: details.tail,
                advisory,
                log_path: Some(result.log_path.clone()),
            };
            return self.fail_thaw(id, failure);
        }

        let thawed_from = source.clone();
        self.commit(|registry| registry.mark_thawed(id, thawed_from, restored_from))?;

        let Some(new_pid) = wait_for_pidfile(&pidfile, self.pidfile_timeout) else {
            let failure = AttemptFailure {
                goblin_id: id.clone(),
                operation: Operation::Thaw,
                sequence: restored_from,
                generation: goblin.generation,
                reason: FailureReason::MissingPid {
                    waited_ms: self.pidfile_timeout.as_millis() as u64,
                },
                tail: result.tail,
                advisory: Some(format!("expected pidfile at {}", pidfile.display())),
                log_path: Some(result.log_path),
            };
            return self.fail_thaw(id, failure);
        };

        let goblin = self.commit(|registry| registry.set_process(id, new_pid))?;
        tracing::info!(
            goblin_id = %id,
            pid = %new_pid,
            generation = %goblin.generation,
            elapsed_ms = result.duration.as_millis() as u64,
            "Goblin thawed"
        );
        Ok(goblin)
    }

    /// Freeze a running goblin and immediately thaw the image just taken.
    pub fn beam(&self, id: &GoblinId, request: BeamRequest) -> GoblinResult<BeamOutcome> {
        let freeze = FreezeRequest {
            leave_running: Some(false),
            ..request.freeze
        };
        let image = self.freeze(id, freeze)?;

        let thaw = ThawRequest {
            source: Some(image.dir.clone()),
            timeout: request.thaw_timeout,
        };
        let goblin = self.thaw(id, thaw)?;

        let cleaned_up = request.cleanup
            && match std::fs::remove_dir_all(&image.dir) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(goblin_id = %id, dir = %image.dir.display(), error = %e, "Beam image not removed");
                    false
                }
            };
        tracing::info!(goblin_id = %id, sequence = %image.sequence, cleaned_up, "Goblin beamed");

        Ok(BeamOutcome {
            image,
            goblin,
            cleaned_up,
        })
    }

    fn fail_thaw(&self, id: &GoblinId, failure: AttemptFailure) -> GoblinResult<Goblin> {
        let recorded = failure.clone();
        self.commit(|registry| registry.record_failure(id, recorded))?;
        tracing::error!(goblin_id = %id, reason = %failure.reason, "Thaw failed");
        Err(attempt_error(failure))
    }

    /// Claim `id` for one freeze or thaw, in this process and across
    /// processes, then reload its record.
    fn begin(&self, id: &GoblinId) -> GoblinResult<Transition<'_>> {
        self.refresh()?;
        let guard = self.registry.begin_transition(id)?;
        let lock = self.lock_goblin(id)?;
        // Another process may have finished a transition since the first read.
        self.refresh()?;
        self.registry.get(id)?;
        Ok(Transition {
            _guard: guard,
            _lock: lock,
        })
    }

    fn lock_goblin(&self, id: &GoblinId) -> GoblinResult<FileLock> {
        FileLock::try_acquire(&self.layout.transition_lock_path(id))?.ok_or_else(|| {
            StateTransitionError::TransitionInFlight {
                goblin_id: id.clone(),
            }
            .into()
        })
    }

    /// Ancestry check before re-freezing a restored goblin.
    fn preflight(&self, goblin: &Goblin, pid: ProcessId) -> Option<AncestryDiagnosis> {
        if !goblin.generation.is_restored() {
            return None;
        }
        let prior = goblin.restored_image()?;

        match self.tracker.diagnose(&prior.ancestry, pid) {
            Ok(diagnosis) => {
                if !diagnosis.is_clear() {
                    tracing::warn!(
                        goblin_id = %goblin.id,
                        missing_parents = ?diagnosis.missing_parents(),
                        "Pre-flight ancestry check flagged unresolved mounts"
                    );
                }
                Some(diagnosis)
            }
            Err(e) => {
                tracing::warn!(goblin_id = %goblin.id, pid = %pid, error = %e, "Pre-flight ancestry check skipped");
                None
            }
        }
    }

    fn failure_details(&self, result: &InvocationResult, timeout: Duration) -> FailureDetails {
        if result.timed_out {
            let tail = if result.tail.is_empty() {
                self.interpreter.classify_text(&result.stderr).tail
            } else {
                result.tail.clone()
            };
            return FailureDetails {
                reason: FailureReason::Timeout {
                    limit_ms: timeout.as_millis() as u64,
                },
                tail,
                missing_parent: None,
            };
        }

        let mut report = self.interpreter.classify(&result.log_path);
        if report.classification == LogClassification::NoLog {
            // No log was written; stderr is the only evidence.
            let from_stderr = self.interpreter.classify_text(&result.stderr);
            report = match from_stderr.classification {
                LogClassification::Unknown | LogClassification::NoLog => {
                    let mut report = from_stderr;
                    report.classification = LogClassification::NoLog;
                    report
                }
                _ => from_stderr,
            };
        }

        FailureDetails {
            reason: FailureReason::Engine(report.classification),
            tail: report.tail,
            missing_parent: report.missing_parent,
        }
    }

    /// Apply `update` to the registry and persist it. With a store attached
    /// the update runs under the registry lock against a fresh snapshot.
    fn commit<T>(&self, update: impl FnOnce(&GoblinRegistry) -> GoblinResult<T>) -> GoblinResult<T> {
        match &self.store {
            Some(store) => store.update(&self.registry, update),
            None => update(&self.registry),
        }
    }

    fn refresh(&self) -> GoblinResult<()> {
        match &self.store {
            Some(store) => store.refresh(&self.registry),
            None => Ok(()),
        }
    }
}

/// Resolve which pid a freeze dumps.
fn freeze_target(goblin: &Goblin, requested: Option<ProcessId>) -> GoblinResult<ProcessId> {
    match goblin.state {
        GoblinState::Running => {
            let tracked = goblin.pid.ok_or_else(|| StateTransitionError::MissingTarget {
                goblin_id: goblin.id.clone(),
                operation: "freeze",
                reason: "no process is tracked".to_string(),
            })?;
            match requested {
                Some(pid) if pid != tracked => Err(StateTransitionError::TargetMismatch {
                    goblin_id: goblin.id.clone(),
                    tracked,
                    requested: pid,
                }
                .into()),
                _ => Ok(tracked),
            }
        }
        GoblinState::Failed => requested.ok_or_else(|| {
            StateTransitionError::MissingTarget {
                goblin_id: goblin.id.clone(),
                operation: "freeze",
                reason: "a failed goblin needs a fresh pid".to_string(),
            }
            .into()
        }),
        state => Err(StateTransitionError::OperationNotAllowed {
            goblin_id: goblin.id.clone(),
            operation: "freeze",
            state: state.name(),
        }
        .into()),
    }
}

/// Resolve which image directory a thaw restores.
fn thaw_source(goblin: &Goblin, requested: Option<PathBuf>) -> GoblinResult<PathBuf> {
    match goblin.state {
        GoblinState::Frozen | GoblinState::Failed => requested
            .or_else(|| goblin.latest_successful_image().map(|i| i.dir.clone()))
            .ok_or_else(|| {
                StateTransitionError::MissingTarget {
                    goblin_id: goblin.id.clone(),
                    operation: "thaw",
                    reason: "no successful image to restore".to_string(),
                }
                .into()
            }),
        state => Err(StateTransitionError::OperationNotAllowed {
            goblin_id: goblin.id.clone(),
            operation: "thaw",
            state: state.name(),
        }
        .into()),
    }
}

/// Resolve a restore source to its canonical path and require image files in it.
fn check_restore_source(source: &Path) -> GoblinResult<PathBuf> {
    let canonical = source.canonicalize().map_err(|e| GoblinError::Io {
        context: "resolving image directory",
        path: source.to_path_buf(),
        source: e,
    })?;
    let mut entries = std::fs::read_dir(&canonical).map_err(|e| GoblinError::Io {
        context: "reading image directory",
        path: canonical.clone(),
        source: e,
    })?;
    if entries.next().is_none() {
        return Err(GoblinError::Io {
            context: "image directory is empty",
            path: canonical,
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no image files"),
        });
    }
    Ok(canonical)
}

/// Whether a recorded image dir and a canonical source name the same directory.
fn same_dir(recorded: &Path, canonical: &Path) -> bool {
    recorded == canonical || recorded.canonicalize().is_ok_and(|dir| dir == canonical)
}

/// Create a fresh attempt directory. An existing directory is never reused.
fn prepare_image_dir(dir: &Path) -> GoblinResult<()> {
    if let Some(parent) = dir.parent() {
        std::fs::create_dir_all(parent).map_err(|e| GoblinError::Io {
            context: "creating goblin directory",
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    std::fs::create_dir(dir).map_err(|e| GoblinError::Io {
        context: "creating image directory",
        path: dir.to_path_buf(),
        source: e,
    })
}

fn write_image_metadata(image: &Image) {
    if let Err(e) = image.write_metadata() {
        tracing::warn!(dir = %image.dir.display(), error = %e, "Image metadata not written");
    }
}

fn freeze_advisory(flagged: Option<&AncestryDiagnosis>, details: &FailureDetails) -> Option<String> {
    match (flagged, details.missing_parent) {
        (Some(diagnosis), _) => Some(format!(
            "freeze failed after thaw rebuilt the mount namespace; {}",
            diagnosis.summary()
        )),
        (None, Some(parent)) => Some(format!(
            "engine reports parent mount {} missing from the dumped namespace",
            parent
        )),
        (None, None) => None,
    }
}

fn attempt_error(failure: AttemptFailure) -> GoblinError {
    match failure.reason {
        FailureReason::Timeout { .. } => GoblinError::Timeout(Box::new(failure)),
        _ => GoblinError::EngineFailure(Box::new(failure)),
    }
}
