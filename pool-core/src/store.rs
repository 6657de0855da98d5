//! Durable pool state
//!
//! # Files
//!
//! - `state.json` - full [`PoolState`] snapshot, replaced atomically
//! - `state.json.tmp` - staging file for the snapshot being written
//! - `history.csv` - append-only, human-auditable row per step
//!
//! # Locking
//!
//! In-memory state sits behind one `RwLock`. Writers (the scheduler's
//! commit path) hold it only while mutating; serialization and file I/O
//! happen after it is released. A separate persist mutex orders snapshot
//! writes so an older snapshot can never replace a newer one.

use crate::{
    chain,
    types::{PoolState, StepTrace},
    Error, Result,
};
use parking_lot::{Mutex, RwLock};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const STATE_FILE: &str = "state.json";
const STATE_TEMP_FILE: &str = "state.json.tmp";
const AUDIT_LOG_FILE: &str = "history.csv";

/// Header row of the tabular audit log
pub const AUDIT_LOG_HEADER: [&str; 9] = [
    "timestamp",
    "observation",
    "volume",
    "prior_supply",
    "new_supply",
    "load_ratio",
    "depletion_clamped",
    "capacity_clamped",
    "error",
];

/// Locations of the persisted files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    data_dir: PathBuf,
}

impl StorePaths {
    /// All files live directly under `data_dir`
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Data directory
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Canonical snapshot path
    pub fn state_file(&self) -> PathBuf {
        self.data_dir.join(STATE_FILE)
    }

    /// Staging path for the snapshot being written
    pub fn temp_file(&self) -> PathBuf {
        self.data_dir.join(STATE_TEMP_FILE)
    }

    /// Append-only CSV audit log path
    pub fn audit_log(&self) -> PathBuf {
        self.data_dir.join(AUDIT_LOG_FILE)
    }
}

/// Result of reading the canonical snapshot at startup
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    /// A valid snapshot was found
    Restored(PoolState),
    /// No usable snapshot; caller bootstraps from configuration
    Fresh,
}

/// How far a commit made it to disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Durability {
    /// Audit row appended and snapshot replaced
    Persisted,
    /// In-memory state updated, but some file write failed
    Degraded(String),
}

impl Durability {
    /// True when everything reached disk
    pub fn is_persisted(&self) -> bool {
        matches!(self, Durability::Persisted)
    }
}

/// Owner of the pool state
#[derive(Debug)]
pub struct StateStore {
    paths: StorePaths,
    state: RwLock<PoolState>,
    persist_lock: Mutex<()>,
}

impl StateStore {
    /// Wrap an in-memory state, creating the data directory
    pub fn new(paths: StorePaths, state: PoolState) -> Result<Self> {
        fs::create_dir_all(paths.data_dir())?;
        Ok(Self {
            paths,
            state: RwLock::new(state),
            persist_lock: Mutex::new(()),
        })
    }

    /// Read the canonical snapshot
    ///
    /// Absence or corruption yields [`LoadOutcome::Fresh`]; a corrupt file
    /// is moved aside first. A snapshot that exists but cannot be read is an
    /// I/O error, and so is one whose hash chain does not verify: it means
    /// the history was altered.
    pub fn load(paths: &StorePaths) -> Result<LoadOutcome> {
        let path = paths.state_file();
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No existing state");
                return Ok(LoadOutcome::Fresh);
            }
            Err(e) => {
                // Bootstrapping here would rename a fresh snapshot over it
                tracing::error!(path = %path.display(), error = %e, "State file unreadable");
                return Err(Error::Io(e));
            }
        };

        let state: PoolState = match serde_json::from_slice(&data) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "State file corrupt");
                quarantine(&path);
                return Ok(LoadOutcome::Fresh);
            }
        };

        if let Err(e) = state.check_invariants() {
            tracing::warn!(path = %path.display(), error = %e, "State file violates invariants");
            quarantine(&path);
            return Ok(LoadOutcome::Fresh);
        }

        let head = chain::verify(&state.chain_anchor, &state.history)?;

        tracing::info!(
            supply = state.supply,
            history = state.history.len(),
            head = %head,
            "Loaded state"
        );
        Ok(LoadOutcome::Restored(state))
    }

    /// Restore from disk, or bootstrap and persist a fresh state
    pub fn open_or_bootstrap<F>(paths: StorePaths, bootstrap: F) -> Result<Self>
    where
        F: FnOnce() -> Result<PoolState>,
    {
        fs::create_dir_all(paths.data_dir())?;

        match Self::load(&paths)? {
            LoadOutcome::Restored(state) => Self::new(paths, state),
            LoadOutcome::Fresh => {
                let store = Self::new(paths, bootstrap()?)?;
                tracing::info!(
                    supply = store.read(|s| s.supply),
                    "Bootstrapped from configuration"
                );
                if let Err(e) = store.persist() {
                    tracing::error!(error = %e, "Initial state save failed");
                }
                Ok(store)
            }
        }
    }

    /// File locations
    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    /// Run `f` under shared access
    pub fn read<R>(&self, f: impl FnOnce(&PoolState) -> R) -> R {
        f(&self.state.read())
    }

    /// Clone of the current state
    pub fn snapshot(&self) -> PoolState {
        self.state.read().clone()
    }

    /// Fingerprint the next trace must link to
    pub fn chain_head(&self) -> String {
        self.read(|s| s.chain_head().to_string())
    }

    /// Commit a linked step
    ///
    /// Rejects traces that do not link to the current head and supplies
    /// outside `[0, capacity]`. File failures after the in-memory update
    /// are logged and reported as [`Durability::Degraded`].
    pub fn commit(&self, new_supply: f64, trace: StepTrace) -> Result<Durability> {
        {
            if let Some(field) = trace.non_finite_field() {
                return Err(Error::InvariantViolation(format!(
                    "trace field {} is not finite",
                    field
                )));
            }

            let mut state = self.state.write();

            let expected = chain::fingerprint(state.chain_head(), &trace);
            if expected != trace.fingerprint {
                return Err(Error::AuditChainBroken {
                    index: state.history.len(),
                    expected,
                    actual: trace.fingerprint,
                });
            }
            if !(new_supply.is_finite() && new_supply >= 0.0 && new_supply <= state.capacity) {
                return Err(Error::InvariantViolation(format!(
                    "supply {} outside [0, {}]",
                    new_supply, state.capacity
                )));
            }
            if new_supply != trace.new_supply {
                return Err(Error::InvariantViolation(format!(
                    "committed supply {} differs from trace {}",
                    new_supply, trace.new_supply
                )));
            }

            state.record(new_supply, trace.clone());
        }

        let mut failures = Vec::new();
        if let Err(e) = self.append_audit_row(&trace) {
            tracing::error!(error = %e, "Audit log append failed");
            failures.push(format!("audit log: {}", e));
        }
        if let Err(e) = self.persist() {
            tracing::error!(error = %e, "State save failed, durability degraded");
            failures.push(format!("state file: {}", e));
        }

        if failures.is_empty() {
            Ok(Durability::Persisted)
        } else {
            Ok(Durability::Degraded(failures.join("; ")))
        }
    }

    /// Atomically replace the canonical snapshot with the in-memory state
    pub fn persist(&self) -> Result<()> {
        let _guard = self.persist_lock.lock();

        let bytes = {
            let state = self.state.read();
            serde_json::to_vec(&*state)?
        };
        let temp = self.write_temp(&bytes)?;
        self.promote(&temp)?;

        tracing::debug!(path = %self.paths.state_file().display(), bytes = bytes.len(), "State saved");
        Ok(())
    }

    /// Replay the retained history against its anchor
    pub fn verify_chain(&self) -> Result<String> {
        self.read(|s| chain::verify(&s.chain_anchor, &s.history))
    }

    fn write_temp(&self, bytes: &[u8]) -> Result<PathBuf> {
        let temp = self.paths.temp_file();
        let mut file = File::create(&temp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        Ok(temp)
    }

    fn promote(&self, temp: &Path) -> Result<()> {
        fs::rename(temp, self.paths.state_file())?;
        Ok(())
    }

    fn append_audit_row(&self, trace: &StepTrace) -> Result<()> {
        let path = self.paths.audit_log();
        let write_header = fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        if write_header {
            writer.write_record(AUDIT_LOG_HEADER)?;
        }
        writer.write_record(&[
            trace.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            format!("{:.6}", trace.observation),
            format!("{:.6}", trace.volume),
            format!("{:.6}", trace.prior_supply),
            format!("{:.6}", trace.new_supply),
            format!("{:.4}", trace.load_ratio),
            trace.depletion_clamped.to_string(),
            trace.capacity_clamped.to_string(),
            trace.error.clone().unwrap_or_default(),
        ])?;
        writer.flush()?;
        Ok(())
    }
}

/// Move a bad snapshot aside so bootstrap does not overwrite the evidence
fn quarantine(path: &Path) {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
    let target = path.with_extension(format!("json.corrupt-{}", stamp));
    match fs::rename(path, &target) {
        Ok(()) => tracing::warn!(moved_to = %target.display(), "Quarantined state file"),
        Err(e) => tracing::warn!(error = %e, "Could not quarantine state file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{engine, FormulaParameters, HISTORY_LIMIT};

    fn bootstrap_state() -> PoolState {
        PoolState::bootstrap(1_000.0, 10_000.0, FormulaParameters::for_capacity(10_000.0))
            .unwrap()
    }

    fn open(dir: &Path) -> StateStore {
        StateStore::open_or_bootstrap(StorePaths::new(dir), || Ok(bootstrap_state())).unwrap()
    }

    fn run_step(store: &StateStore, observation: f64, volume: f64) -> Durability {
        let (prior, capacity, params, head) = store.read(|s| {
            (s.supply, s.capacity, s.parameters, s.chain_head().to_string())
        });
        let (new_supply, trace) = engine::step(prior, observation, volume, capacity, &params);
        let (_, trace) = chain::append(&head, trace);
        store.commit(new_supply, trace).unwrap()
    }

    #[test]
    fn test_load_missing_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = StateStore::load(&StorePaths::new(dir.path())).unwrap();
        assert_eq!(outcome, LoadOutcome::Fresh);
    }

    #[test]
    fn test_bootstrap_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let _store = open(dir.path());

        let outcome = StateStore::load(&StorePaths::new(dir.path())).unwrap();
        assert_eq!(outcome, LoadOutcome::Restored(bootstrap_state()));
    }

    #[test]
    fn test_commit_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());

        for i in 0..5 {
            let durability = run_step(&store, 2_000.0 + i as f64, 50.0);
            assert!(durability.is_persisted());
        }
        let before = store.snapshot();
        assert_eq!(before.history.len(), 5);
        assert_eq!(before.supply, before.latest().unwrap().new_supply);
        drop(store);

        let reopened = open(dir.path());
        assert_eq!(reopened.snapshot(), before);
        assert!(reopened.verify_chain().is_ok());
    }

    #[test]
    fn test_history_bounded_to_most_recent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());

        let mut volumes = Vec::new();
        for i in 0..(HISTORY_LIMIT + 5) {
            let volume = i as f64;
            volumes.push(volume);
            run_step(&store, 2_000.0, volume);
        }

        let state = store.snapshot();
        assert_eq!(state.history.len(), HISTORY_LIMIT);
        let kept: Vec<f64> = state.history.iter().map(|t| t.volume).collect();
        assert_eq!(kept, volumes[5..].to_vec());
        assert!(!state.chain_anchor.is_empty());
        assert!(store.verify_chain().is_ok());

        drop(store);
        let reopened = open(dir.path());
        assert_eq!(reopened.read(|s| s.history.len()), HISTORY_LIMIT);
    }

    #[test]
    fn test_crash_before_rename_keeps_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        run_step(&store, 2_000.0, 50.0);
        let committed = store.snapshot();

        // Second step reaches memory and a partial temp file, then the process dies
        let (new_supply, trace) = engine::step(
            committed.supply,
            3_000.0,
            10.0,
            committed.capacity,
            &committed.parameters,
        );
        let (_, trace) = chain::append(committed.chain_head(), trace);
        store.state.write().record(new_supply, trace);
        let staged = serde_json::to_vec(&store.snapshot()).unwrap();
        store.write_temp(&staged[..staged.len() / 2]).unwrap();
        assert!(store.paths().temp_file().exists());
        drop(store);

        let outcome = StateStore::load(&StorePaths::new(dir.path())).unwrap();
        assert_eq!(outcome, LoadOutcome::Restored(committed));
    }

    #[test]
    fn test_half_written_temp_never_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        run_step(&store, 2_000.0, 50.0);
        let committed = store.snapshot();

        store.write_temp(b"{\"supply\": 12").unwrap();
        drop(store);

        let reopened = open(dir.path());
        assert_eq!(reopened.snapshot(), committed);
    }

    #[test]
    fn test_corrupt_state_is_fresh_and_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StorePaths::new(dir.path());
        fs::write(paths.state_file(), b"not json").unwrap();

        assert_eq!(StateStore::load(&paths).unwrap(), LoadOutcome::Fresh);
        assert!(!paths.state_file().exists());
        let quarantined = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().contains("corrupt"));
        assert!(quarantined);
    }

    #[test]
    fn test_out_of_bounds_state_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StorePaths::new(dir.path());
        let mut state = bootstrap_state();
        state.supply = state.capacity * 2.0;
        fs::write(paths.state_file(), serde_json::to_vec(&state).unwrap()).unwrap();

        assert_eq!(StateStore::load(&paths).unwrap(), LoadOutcome::Fresh);
    }

    #[test]
    fn test_tampered_history_is_chain_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        for _ in 0..3 {
            run_step(&store, 2_000.0, 50.0);
        }
        let mut state = store.snapshot();
        drop(store);

        state.history[1].observation += 1.0;
        let paths = StorePaths::new(dir.path());
        fs::write(paths.state_file(), serde_json::to_vec(&state).unwrap()).unwrap();

        let err = StateStore::load(&paths).unwrap_err();
        assert!(err.is_tamper_evidence());
        assert!(matches!(err, Error::AuditChainBroken { index: 1, .. }));
    }

    #[test]
    fn test_commit_rejects_unlinked_trace() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let params = FormulaParameters::for_capacity(10_000.0);
        let (new_supply, trace) = engine::step(1_000.0, 2_000.0, 50.0, 10_000.0, &params);

        let err = store.commit(new_supply, trace).unwrap_err();
        assert!(matches!(err, Error::AuditChainBroken { index: 0, .. }));
        assert_eq!(store.read(|s| s.supply), 1_000.0);
        assert!(store.read(|s| s.history.is_empty()));
    }

    #[test]
    fn test_unreadable_state_is_error_and_left_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StorePaths::new(dir.path());
        // Reading a directory fails with something other than NotFound
        fs::create_dir_all(paths.state_file().join("prior")).unwrap();

        assert!(matches!(StateStore::load(&paths), Err(Error::Io(_))));
        let err = StateStore::open_or_bootstrap(paths.clone(), || Ok(bootstrap_state()))
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(paths.state_file().join("prior").is_dir());
        assert!(!paths.temp_file().exists());
    }

    #[test]
    fn test_overflowing_step_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StorePaths::new(dir.path());
        let store = StateStore::open_or_bootstrap(paths.clone(), || {
            PoolState::bootstrap(0.0, 10_000.0, FormulaParameters::for_capacity(10_000.0))
        })
        .unwrap();

        let durability = run_step(&store, 2_000.0, 1e305);
        assert!(durability.is_persisted());
        let committed = store.snapshot();
        drop(store);

        match StateStore::load(&paths).unwrap() {
            LoadOutcome::Restored(state) => {
                assert_eq!(state, committed);
                assert_eq!(state.supply, 0.0);
                assert!(state.history[0].error.is_some());
            }
            LoadOutcome::Fresh => panic!("committed state was not restored"),
        }
    }

    #[test]
    fn test_commit_rejects_non_finite_trace() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let params = FormulaParameters::for_capacity(10_000.0);
        let (new_supply, mut trace) = engine::step(1_000.0, 2_000.0, 50.0, 10_000.0, &params);
        trace.velocity = f64::INFINITY;
        let (_, trace) = chain::append(chain::GENESIS, trace);

        let err = store.commit(new_supply, trace).unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(ref msg) if msg.contains("velocity")));
        assert!(store.read(|s| s.history.is_empty()));
    }

    #[test]
    fn test_commit_rejects_supply_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let params = FormulaParameters::for_capacity(10_000.0);
        let (_, trace) = engine::step(1_000.0, 2_000.0, 50.0, 10_000.0, &params);
        let (_, trace) = chain::append(chain::GENESIS, trace);

        let err = store.commit(20_000.0, trace).unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
    }

    #[test]
    fn test_audit_log_header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        run_step(&store, 2_000.0, 50.0);
        run_step(&store, 2_000.0, 50.0);
        drop(store);

        let store = open(dir.path());
        run_step(&store, 0.0, 0.0);

        let content = fs::read_to_string(store.paths().audit_log()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], AUDIT_LOG_HEADER.join(","));
        assert_eq!(lines.iter().filter(|l| l.starts_with("timestamp")).count(), 1);

        let last: Vec<&str> = lines[3].split(',').collect();
        assert_eq!(last.len(), AUDIT_LOG_HEADER.len());
        assert_eq!(last[1], "0.000001");
        assert_eq!(last[8], "");
    }

    #[test]
    fn test_audit_log_records_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(StorePaths::new(dir.path()), bootstrap_state()).unwrap();
        let params = FormulaParameters::for_capacity(10_000.0);
        let (new_supply, trace) = engine::step(1_000.0, 2_000.0, 50.0, 0.0, &params);
        let (_, trace) = chain::append(chain::GENESIS, trace);
        store.commit(new_supply, trace).unwrap();

        let mut reader = csv::Reader::from_path(store.paths().audit_log()).unwrap();
        let row = reader.records().next().unwrap().unwrap();
        assert!(row[8].contains("capacity"));
        assert_eq!(store.read(|s| s.supply), 1_000.0);
    }

    #[test]
    fn test_persist_failure_degrades_without_losing_memory_state() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StorePaths::new(dir.path());
        // A non-empty directory where the snapshot should go makes rename fail
        fs::create_dir_all(paths.state_file().join("blocker")).unwrap();
        let store = StateStore::new(paths, bootstrap_state()).unwrap();

        let durability = run_step(&store, 2_000.0, 50.0);
        assert!(matches!(durability, Durability::Degraded(ref reason) if reason.contains("state file")));
        assert_eq!(store.read(|s| s.history.len()), 1);
        assert!(store.read(|s| s.supply) > 1_000.0);
    }
}
