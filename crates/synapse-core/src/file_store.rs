//! JSON file persistence for conversations and solutions.
//!
//! Layout under the data directory:
//! - `conversations/{YYYY}/{MM}/{id}.json`
//! - `solutions/{id}.json` and `solutions/extracted_{type}_solutions_{YYYYMMDD_HHMMSS}.json`
//! - `backups/{stem}_backup_{unix_ts}{ext}`
//!
//! Every read takes a shared lock and every write an exclusive lock on the
//! record path (see [`crate::lock`]). Writes go through a temp file and an
//! atomic rename; an existing file is copied to `backups/` first and restored
//! from there if the write fails.

use crate::atomic;
use crate::lock::{LockMode, LockTable, DEFAULT_LOCK_TIMEOUT};
use crate::paths::StoragePaths;
use crate::repair::repair_solutions;
use crate::{Result, SynapseError};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use synapse_types::{
    is_valid_record_id, ConversationRecord, Solution, SolutionBatch, SolutionType,
};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

const JSON_EXT: &str = "json";
const BACKUP_MARKER: &str = "_backup_";
const BATCH_PREFIX: &str = "extracted_";
const BATCH_INFIX: &str = "_solutions_";
const EXPORT_INFO_FILE: &str = "export_info.json";

/// Aggregate size and count figures for both record trees.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageStats {
    pub total_conversations: usize,
    pub total_solutions: usize,
    pub total_files: usize,
    pub total_size_bytes: u64,
    pub disk_usage_mb: f64,
    pub avg_file_size_kb: f64,
    pub last_updated: DateTime<Utc>,
}

/// A point-in-time copy taken before an overwrite or delete.
#[derive(Debug, Clone, Serialize)]
pub struct BackupInfo {
    pub backup_path: PathBuf,
    pub original_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
}

/// How `import_data` treats existing data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MergeMode {
    /// Copy imported files over the existing tree, keeping files not in the import.
    #[default]
    Append,
    /// Delete each existing subtree before copying the imported one.
    Overwrite,
}

impl MergeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeMode::Append => "append",
            MergeMode::Overwrite => "overwrite",
        }
    }
}

impl std::str::FromStr for MergeMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "append" => Ok(MergeMode::Append),
            "overwrite" => Ok(MergeMode::Overwrite),
            _ => Err(format!("Invalid merge mode: '{}'. Use 'append' or 'overwrite'.", s)),
        }
    }
}

/// Summary of one batch solution file.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub file_name: String,
    pub created_at: Option<DateTime<Utc>>,
    pub solution_type: Option<SolutionType>,
    pub solutions_count: usize,
}

/// Lock-protected, crash-consistent store for conversation and solution records.
///
/// Construct once per process and share by reference; the lock table inside
/// only serializes callers that go through the same instance (other processes
/// are excluded by the OS lock).
pub struct FileStore {
    paths: StoragePaths,
    locks: LockTable,
}

impl FileStore {
    /// Open a store with the default 30 second lock timeout.
    pub fn new(paths: StoragePaths) -> Self {
        Self::with_lock_timeout(paths, DEFAULT_LOCK_TIMEOUT)
    }

    /// Open a store with a custom lock acquisition bound.
    pub fn with_lock_timeout(paths: StoragePaths, timeout: Duration) -> Self {
        let locks = LockTable::new(paths.locks_dir(), timeout);
        let store = Self { paths, locks };
        store.ensure_directories();
        store
    }

    fn ensure_directories(&self) {
        for dir in [
            self.paths.conversations_dir(),
            self.paths.solutions_dir(),
            self.paths.indexes_dir(),
            self.paths.logs_dir(),
            self.paths.backups_dir(),
            self.paths.cache_dir().to_path_buf(),
        ] {
            self.paths.create_directory(&dir);
        }
    }

    pub fn paths(&self) -> &StoragePaths {
        &self.paths
    }

    pub fn lock_timeout(&self) -> Duration {
        self.locks.timeout()
    }

    // =========================================================================
    // Paths
    // =========================================================================

    /// `conversations/{YYYY}/{MM}/{id}.json` for the given date.
    pub fn conversation_path(&self, id: &str, date: NaiveDate) -> PathBuf {
        self.paths
            .conversations_dir()
            .join(format!("{:04}", date.year()))
            .join(format!("{:02}", date.month()))
            .join(format!("{}.{}", id, JSON_EXT))
    }

    pub fn solution_path(&self, id: &str) -> PathBuf {
        self.paths.solutions_dir().join(format!("{}.{}", id, JSON_EXT))
    }

    /// Find the file holding conversation `id`.
    ///
    /// Tries today's directory, then the date embedded in `conv_YYYYMMDD_*`
    /// ids, then (if `search_all_dates`) every year/month directory. The scan
    /// is linear in the number of month directories.
    pub fn locate_conversation(&self, id: &str, search_all_dates: bool) -> Result<Option<PathBuf>> {
        if !is_valid_record_id(id) {
            return Ok(None);
        }

        let today = self.conversation_path(id, Utc::now().date_naive());
        if today.is_file() {
            return Ok(Some(today));
        }

        if let Some(date) = date_hint(id) {
            let hinted = self.conversation_path(id, date);
            if hinted.is_file() {
                return Ok(Some(hinted));
            }
        }

        if !search_all_dates {
            return Ok(None);
        }

        let file_name = format!("{}.{}", id, JSON_EXT);
        for (_, _, month_dir) in self.month_dirs()? {
            let candidate = month_dir.join(&file_name);
            if candidate.is_file() {
                return Ok(Some(candidate));
            }
        }

        Ok(None)
    }

    /// Year/month directories, newest first.
    fn month_dirs(&self) -> Result<Vec<(i32, u32, PathBuf)>> {
        let mut months = Vec::new();
        for (year, year_path) in numeric_subdirs(&self.paths.conversations_dir())? {
            for (month, month_path) in numeric_subdirs(&year_path)? {
                if (1..=12).contains(&month) {
                    months.push((year as i32, month, month_path));
                }
            }
        }
        months.sort_by(|a, b| (b.0, b.1).cmp(&(a.0, a.1)));
        Ok(months)
    }

    // =========================================================================
    // Backups & atomic writes
    // =========================================================================

    /// Copy `path` into `backups/`. Failure is logged and reported as `None`.
    fn create_backup(&self, path: &Path) -> Option<BackupInfo> {
        if !path.is_file() {
            return None;
        }

        let stem = path.file_stem()?.to_string_lossy();
        let ext = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let created_at = Utc::now();
        let backup_path = unused_backup_path(&self.paths.backups_dir(), &stem, created_at.timestamp(), &ext);

        let result = fs::create_dir_all(self.paths.backups_dir()).and_then(|_| fs::copy(path, &backup_path));
        match result {
            Ok(size_bytes) => {
                debug!(target: "synapse::store", "Backed up {} to {}", path.display(), backup_path.display());
                Some(BackupInfo {
                    backup_path,
                    original_path: path.to_path_buf(),
                    created_at,
                    size_bytes,
                })
            }
            Err(e) => {
                warn!(target: "synapse::store", "Backup of {} failed, continuing: {}", path.display(), e);
                None
            }
        }
    }

    fn restore_from_backup(&self, backup: &BackupInfo) -> bool {
        match fs::copy(&backup.backup_path, &backup.original_path) {
            Ok(_) => {
                info!(target: "synapse::store", "Restored {} from backup", backup.original_path.display());
                true
            }
            Err(e) => {
                error!(
                    target: "synapse::store",
                    "Restoring {} from {} failed: {}",
                    backup.original_path.display(),
                    backup.backup_path.display(),
                    e
                );
                false
            }
        }
    }

    /// Back up, write atomically, and restore the backup on failure.
    /// The caller must hold the exclusive lock for `path`.
    pub(crate) fn write_json_recovering<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> Result<()> {
        let backup = self.create_backup(path);

        match atomic::write_json(path, value) {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(target: "synapse::store", "Write to {} failed: {}", path.display(), e);
                if let Some(backup) = &backup {
                    self.restore_from_backup(backup);
                }
                Err(e)
            }
        }
    }

    fn write_locked<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> Result<()> {
        self.locks
            .with_lock(path, LockMode::Exclusive, || self.write_json_recovering(path, value))
    }

    /// Read and parse `path` under a shared lock. A file that is gone by the
    /// time the lock is held reads as `None`.
    fn read_locked<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        self.locks.with_lock(path, LockMode::Shared, || read_json(path))
    }

    // =========================================================================
    // Conversations
    // =========================================================================

    /// Persist a conversation under the year/month of its `created_at`.
    /// Tags, category, and attached solutions are normalized before the
    /// record is validated and written.
    pub fn save_conversation(&self, record: &ConversationRecord) -> Result<PathBuf> {
        let mut record = record.clone();
        record.normalize();
        record.validate()?;
        let path = self.conversation_path(&record.id, record.created_at.date_naive());

        self.write_locked(&path, &record)?;
        info!(target: "synapse::store", "Saved conversation {}", record.id);
        Ok(path)
    }

    /// Load a conversation. Code solutions without a language are repaired
    /// in memory; the file is not rewritten.
    pub fn load_conversation(&self, id: &str, search_all_dates: bool) -> Result<Option<ConversationRecord>> {
        let Some(path) = self.locate_conversation(id, search_all_dates)? else {
            debug!(target: "synapse::store", "Conversation {} not found", id);
            return Ok(None);
        };

        let Some(mut record) = self.read_locked::<ConversationRecord>(&path)? else {
            return Ok(None);
        };
        repair_solutions(&mut record.solutions);
        Ok(Some(record))
    }

    /// Back up and remove a conversation file. Returns false if it does not exist.
    pub fn delete_conversation(&self, id: &str) -> Result<bool> {
        let Some(path) = self.locate_conversation(id, true)? else {
            warn!(target: "synapse::store", "Conversation to delete not found: {}", id);
            return Ok(false);
        };

        let deleted = self.remove_locked(&path)?;
        if deleted {
            info!(target: "synapse::store", "Deleted conversation {}", id);
        }
        Ok(deleted)
    }

    /// Back up and remove `path`, retiring its lock file with it.
    fn remove_locked(&self, path: &Path) -> Result<bool> {
        self.locks.with_retiring_lock(path, || {
            if !path.is_file() {
                return Ok(false);
            }
            self.create_backup(path);
            match fs::remove_file(path) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Conversation ids, newest year/month first and by descending id within
    /// a month. A month is kept when it overlaps `[start_date, end_date]`.
    pub fn list_conversations(
        &self,
        limit: Option<usize>,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
    ) -> Result<Vec<String>> {
        let mut ids = Vec::new();

        for (year, month, month_dir) in self.month_dirs()? {
            let Some(first_day) = NaiveDate::from_ymd_opt(year, month, 1) else {
                continue;
            };
            let last_day = last_day_of_month(first_day);

            if start_date.is_some_and(|start| last_day < start) {
                continue;
            }
            if end_date.is_some_and(|end| first_day > end) {
                continue;
            }

            let mut month_ids = json_stems(&month_dir)?;
            month_ids.sort_unstable_by(|a, b| b.cmp(a));

            for id in month_ids {
                ids.push(id);
                if limit.is_some_and(|limit| ids.len() >= limit) {
                    return Ok(ids);
                }
            }
        }

        Ok(ids)
    }

    // =========================================================================
    // Solutions
    // =========================================================================

    pub fn save_solution(&self, solution: &Solution) -> Result<PathBuf> {
        let mut solution = solution.clone();
        solution.normalize();
        solution.validate()?;
        let path = self.solution_path(&solution.id);
        self.write_locked(&path, &solution)?;
        info!(target: "synapse::store", "Saved solution {}", solution.id);
        Ok(path)
    }

    pub fn load_solution(&self, id: &str) -> Result<Option<Solution>> {
        if !is_valid_record_id(id) {
            return Ok(None);
        }
        let path = self.solution_path(id);
        if !path.is_file() {
            return Ok(None);
        }

        let mut solution = self.read_locked::<Solution>(&path)?;
        if let Some(solution) = solution.as_mut() {
            repair_solutions(std::slice::from_mut(solution));
        }
        Ok(solution)
    }

    pub fn delete_solution(&self, id: &str) -> Result<bool> {
        if !is_valid_record_id(id) {
            return Ok(false);
        }
        let deleted = self.remove_locked(&self.solution_path(id))?;
        if deleted {
            info!(target: "synapse::store", "Deleted solution {}", id);
        }
        Ok(deleted)
    }

    /// Write one batch file per solution type present in `solutions`.
    /// Existing files with the same name are skipped unless `overwrite`.
    pub fn save_solution_batch(&self, solutions: &[Solution], overwrite: bool) -> Result<Vec<PathBuf>> {
        let mut solutions = solutions.to_vec();
        for solution in &mut solutions {
            solution.normalize();
            solution.validate()?;
        }

        let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let mut written = Vec::new();

        for solution_type in SolutionType::ALL {
            let group: Vec<Solution> = solutions
                .iter()
                .filter(|s| s.solution_type == solution_type)
                .cloned()
                .collect();
            if group.is_empty() {
                continue;
            }

            let path = self
                .paths
                .solutions_dir()
                .join(format!("{}{}{}{}.{}", BATCH_PREFIX, solution_type, BATCH_INFIX, stamp, JSON_EXT));
            if path.exists() && !overwrite {
                warn!(target: "synapse::store", "Batch file exists, skipping: {}", path.display());
                continue;
            }

            let count = group.len();
            self.write_locked(&path, &SolutionBatch::new(solution_type, group))?;
            info!(target: "synapse::store", "Saved {} {} solutions to {}", count, solution_type, path.display());
            written.push(path);
        }

        Ok(written)
    }

    /// Summaries of every batch file, newest name first.
    pub fn list_solution_batches(&self) -> Result<Vec<BatchSummary>> {
        let mut summaries = Vec::new();
        for path in self.batch_files()? {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            match self.read_locked::<SolutionBatch>(&path) {
                Ok(Some(batch)) => summaries.push(BatchSummary {
                    file_name,
                    created_at: Some(batch.metadata.created_at),
                    solution_type: Some(batch.metadata.solution_type),
                    solutions_count: batch.solutions.len(),
                }),
                Ok(None) => {}
                Err(e) => {
                    warn!(target: "synapse::store", "Unreadable batch file {}: {}", path.display(), e);
                    summaries.push(BatchSummary {
                        file_name,
                        created_at: None,
                        solution_type: None,
                        solutions_count: 0,
                    });
                }
            }
        }
        summaries.sort_by(|a, b| b.file_name.cmp(&a.file_name));
        Ok(summaries)
    }

    /// Every solution from individual and batch files, one per id. When an id
    /// appears more than once the copy with the higher `reference_count` wins.
    /// Unreadable files are logged and skipped.
    pub fn load_all_solutions(&self) -> Result<Vec<Solution>> {
        let mut found = Vec::new();

        for id in self.individual_solution_ids()? {
            match self.load_solution(&id) {
                Ok(Some(solution)) => found.push(solution),
                Ok(None) => {}
                Err(e) => warn!(target: "synapse::store", "Skipping solution {}: {}", id, e),
            }
        }

        for path in self.batch_files()? {
            match self.read_locked::<SolutionBatch>(&path) {
                Ok(Some(mut batch)) => {
                    repair_solutions(&mut batch.solutions);
                    found.extend(batch.solutions);
                }
                Ok(None) => {}
                Err(e) => warn!(target: "synapse::store", "Skipping batch file {}: {}", path.display(), e),
            }
        }

        let solutions = dedup_solutions(found);
        debug!(target: "synapse::store", "Loaded {} unique solutions", solutions.len());
        Ok(solutions)
    }

    /// Increment a solution's `reference_count` and stamp `last_referenced`.
    ///
    /// The read-modify-write happens under one exclusive lock. A solution that
    /// only exists inside a batch file is written out as an individual file
    /// carrying the new count, which then wins deduplication.
    pub fn update_solution_reference_count(&self, id: &str) -> Result<bool> {
        if !is_valid_record_id(id) {
            return Ok(false);
        }
        let path = self.solution_path(id);

        let fallback = if path.is_file() { None } else { self.find_in_batches(id)? };

        let updated = self.locks.with_lock(&path, LockMode::Exclusive, || {
            let current = match read_json::<Solution>(&path)? {
                Some(solution) => Some(solution),
                None => fallback.clone(),
            };
            let Some(mut solution) = current else {
                return Ok(None);
            };
            solution.increment_reference();
            self.write_json_recovering(&path, &solution)?;
            Ok(Some(solution.reference_count))
        })?;

        match updated {
            Some(count) => {
                debug!(target: "synapse::store", "Solution {} reference count -> {}", id, count);
                Ok(true)
            }
            None => {
                warn!(target: "synapse::store", "Solution not found for reference update: {}", id);
                Ok(false)
            }
        }
    }

    fn find_in_batches(&self, id: &str) -> Result<Option<Solution>> {
        let mut best: Option<Solution> = None;
        for path in self.batch_files()? {
            let Ok(Some(batch)) = self.read_locked::<SolutionBatch>(&path) else {
                continue;
            };
            for solution in batch.solutions.into_iter().filter(|s| s.id == id) {
                if best.as_ref().is_none_or(|b| solution.reference_count > b.reference_count) {
                    best = Some(solution);
                }
            }
        }
        Ok(best)
    }

    fn individual_solution_ids(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = json_stems(&self.paths.solutions_dir())?
            .into_iter()
            .filter(|stem| !is_batch_stem(stem))
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn batch_files(&self) -> Result<Vec<PathBuf>> {
        let dir = self.paths.solutions_dir();
        let mut files: Vec<PathBuf> = json_stems(&dir)?
            .into_iter()
            .filter(|stem| is_batch_stem(stem))
            .map(|stem| dir.join(format!("{}.{}", stem, JSON_EXT)))
            .collect();
        files.sort();
        Ok(files)
    }

    // =========================================================================
    // Statistics, export/import, retention
    // =========================================================================

    /// Counts and byte totals across the conversation and solution trees.
    pub fn storage_statistics(&self) -> Result<StorageStats> {
        let mut stats = StorageStats {
            last_updated: Utc::now(),
            ..Default::default()
        };

        let conversations_dir = self.paths.conversations_dir();
        if conversations_dir.exists() {
            for entry in WalkDir::new(&conversations_dir) {
                let entry = entry?;
                if entry.file_type().is_file() && has_json_ext(entry.path()) {
                    stats.total_conversations += 1;
                    stats.total_size_bytes += entry.metadata()?.len();
                }
            }
        }

        let solutions_dir = self.paths.solutions_dir();
        if solutions_dir.exists() {
            for entry in fs::read_dir(&solutions_dir)? {
                let entry = entry?;
                let path = entry.path();
                if entry.file_type()?.is_file() && has_json_ext(&path) {
                    stats.total_solutions += 1;
                    stats.total_size_bytes += entry.metadata()?.len();
                }
            }
        }

        stats.total_files = stats.total_conversations + stats.total_solutions;
        stats.disk_usage_mb = stats.total_size_bytes as f64 / (1024.0 * 1024.0);
        stats.avg_file_size_kb = if stats.total_files > 0 {
            stats.total_size_bytes as f64 / stats.total_files as f64 / 1024.0
        } else {
            0.0
        };

        Ok(stats)
    }

    /// Copy conversations, solutions, and indexes (plus backups if asked) to
    /// `target_dir`, and write an `export_info.json` manifest there.
    pub fn export_data(&self, target_dir: &Path, include_backups: bool) -> Result<()> {
        fs::create_dir_all(target_dir)?;

        let mut subtrees = vec![
            ("conversations", self.paths.conversations_dir()),
            ("solutions", self.paths.solutions_dir()),
            ("indexes", self.paths.indexes_dir()),
        ];
        if include_backups {
            subtrees.push(("backups", self.paths.backups_dir()));
        }

        for (name, src) in subtrees {
            if src.exists() {
                let copied = copy_tree(&src, &target_dir.join(name))?;
                debug!(target: "synapse::store", "Exported {} files from {}", copied, name);
            }
        }

        let manifest = serde_json::json!({
            "exported_at": Utc::now().to_rfc3339(),
            "source_paths": self.paths.storage_info(),
            "statistics": self.storage_statistics()?,
            "include_backups": include_backups,
        });
        atomic::write_json(&target_dir.join(EXPORT_INFO_FILE), &manifest)?;

        info!(target: "synapse::store", "Exported data to {}", target_dir.display());
        Ok(())
    }

    /// Copy conversations, solutions, and indexes from `source_dir` into the
    /// store. A full export to `backups/pre_import_{ts}` is taken first; if
    /// that fails the import continues. The search index cache of any live
    /// [`crate::SearchIndex`] is not refreshed; reload or rebuild it afterwards.
    pub fn import_data(&self, source_dir: &Path, mode: MergeMode) -> Result<()> {
        if !source_dir.is_dir() {
            return Err(SynapseError::SourceNotFound(source_dir.to_path_buf()));
        }

        let pre_import = self
            .paths
            .backups_dir()
            .join(format!("pre_import_{}", Utc::now().timestamp()));
        if let Err(e) = self.export_data(&pre_import, false) {
            warn!(target: "synapse::store", "Pre-import backup failed, continuing: {}", e);
        }

        for (name, dst) in [
            ("conversations", self.paths.conversations_dir()),
            ("solutions", self.paths.solutions_dir()),
            ("indexes", self.paths.indexes_dir()),
        ] {
            let src = source_dir.join(name);
            if !src.is_dir() {
                continue;
            }
            if mode == MergeMode::Overwrite && dst.exists() {
                fs::remove_dir_all(&dst)?;
            }
            let copied = copy_tree(&src, &dst)?;
            debug!(target: "synapse::store", "Imported {} files into {}", copied, name);
        }

        info!(target: "synapse::store", "Imported data from {} ({:?})", source_dir.display(), mode);
        Ok(())
    }

    /// Delete backup files beyond either retention bound. Backups are ranked
    /// newest first; any at rank `max_count` or later, or older than
    /// `max_age_days`, is removed. Returns the number deleted.
    pub fn cleanup_backups(&self, max_age_days: u64, max_count: usize) -> Result<usize> {
        let backups_dir = self.paths.backups_dir();
        if !backups_dir.exists() {
            return Ok(0);
        }

        let mut backups = Vec::new();
        for entry in fs::read_dir(&backups_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() || !entry.file_name().to_string_lossy().contains(BACKUP_MARKER) {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            backups.push((entry.path(), modified));
        }
        backups.sort_by(|a, b| b.1.cmp(&a.1));

        let max_age = Duration::from_secs(max_age_days.saturating_mul(24 * 3600));
        let now = SystemTime::now();
        let mut removed = 0;

        for (rank, (path, modified)) in backups.iter().enumerate() {
            let too_old = now.duration_since(*modified).is_ok_and(|age| age > max_age);
            if rank < max_count && !too_old {
                continue;
            }
            match fs::remove_file(path) {
                Ok(()) => {
                    removed += 1;
                    debug!(target: "synapse::store", "Removed backup {}", path.display());
                }
                Err(e) => warn!(target: "synapse::store", "Failed to remove backup {}: {}", path.display(), e),
            }
        }

        info!(target: "synapse::store", "Cleaned up {} backup files", removed);
        Ok(removed)
    }
}

// Helper functions

/// `{stem}_backup_{ts}{ext}`, or `{stem}_backup_{ts}_{n}{ext}` when earlier
/// backups of the same file already took that second. Callers hold the
/// record's exclusive lock, so the existence check does not race.
fn unused_backup_path(backups_dir: &Path, stem: &str, timestamp: i64, ext: &str) -> PathBuf {
    let base = format!("{}{}{}", stem, BACKUP_MARKER, timestamp);
    let mut candidate = backups_dir.join(format!("{}{}", base, ext));
    let mut n = 1;
    while candidate.exists() {
        candidate = backups_dir.join(format!("{}_{}{}", base, n, ext));
        n += 1;
    }
    candidate
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_str(&raw)?))
}

/// Subdirectories of `dir` whose names are all digits, with their numeric value.
fn numeric_subdirs(dir: &Path) -> Result<Vec<(u32, PathBuf)>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        if let Ok(value) = name.parse::<u32>() {
            found.push((value, entry.path()));
        }
    }
    Ok(found)
}

/// Stems of the `*.json` files directly inside `dir`.
fn json_stems(dir: &Path) -> Result<Vec<String>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut stems = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_file() || !has_json_ext(&path) {
            continue;
        }
        if let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) {
            if !stem.starts_with('.') {
                stems.push(stem);
            }
        }
    }
    Ok(stems)
}

fn has_json_ext(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == JSON_EXT)
}

fn is_batch_stem(stem: &str) -> bool {
    stem.starts_with(BATCH_PREFIX) && stem.contains(BATCH_INFIX)
}

/// Date encoded in `conv_YYYYMMDD_*` ids.
fn date_hint(id: &str) -> Option<NaiveDate> {
    let digits = id.strip_prefix("conv_")?.get(..8)?;
    NaiveDate::parse_from_str(digits, "%Y%m%d").ok()
}

fn last_day_of_month(first_day: NaiveDate) -> NaiveDate {
    first_day
        .checked_add_months(chrono::Months::new(1))
        .and_then(|next| next.pred_opt())
        .unwrap_or(first_day)
}

/// Keep one solution per id (the highest `reference_count`), in first-seen order.
fn dedup_solutions(solutions: Vec<Solution>) -> Vec<Solution> {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut unique: Vec<Solution> = Vec::new();

    for solution in solutions {
        match positions.get(&solution.id) {
            Some(&pos) => {
                if solution.reference_count > unique[pos].reference_count {
                    unique[pos] = solution;
                }
            }
            None => {
                positions.insert(solution.id.clone(), unique.len());
                unique.push(solution);
            }
        }
    }

    unique
}

/// Recursively copy `src` into `dst`, overlaying existing files. Returns the
/// number of files copied.
fn copy_tree(src: &Path, dst: &Path) -> Result<u64> {
    let mut copied = 0;
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry?;
        let Ok(relative) = entry.path().strip_prefix(src) else {
            continue;
        };
        let target = dst.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use serde::ser::{Error as _, SerializeMap};
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn create_test_store() -> (FileStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::with_lock_timeout(
            StoragePaths::with_root(temp_dir.path()),
            Duration::from_secs(5),
        );
        (store, temp_dir)
    }

    fn record_on(title: &str, year: i32, month: u32, day: u32) -> ConversationRecord {
        ConversationRecord::new(title, format!("{} content", title))
            .unwrap()
            .with_created_at(Utc.with_ymd_and_hms(year, month, day, 12, 0, 0).unwrap())
    }

    fn code_solution(content: &str) -> Solution {
        Solution::new(
            SolutionType::Code,
            content,
            "snippet",
            Some("rust".to_string()),
            vec![],
            0.6,
        )
        .unwrap()
    }

    /// Emits part of a document, then fails.
    struct FailsMidway;

    impl Serialize for FailsMidway {
        fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
            let mut map = serializer.serialize_map(None)?;
            map.serialize_entry("title", "half written")?;
            Err(S::Error::custom("simulated failure"))
        }
    }

    fn tmp_files(dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|e| e == "tmp"))
            .collect()
    }

    fn backup_count(store: &FileStore) -> usize {
        fs::read_dir(store.paths().backups_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(BACKUP_MARKER))
            .count()
    }

    #[test]
    fn test_rapid_overwrites_keep_every_backup() {
        let (store, _dir) = create_test_store();
        let mut record = record_on("Versioned", 2024, 3, 2);
        store.save_conversation(&record).unwrap();
        for version in 2..=4 {
            record.content = format!("version {}", version);
            store.save_conversation(&record).unwrap();
        }
        assert_eq!(backup_count(&store), 3);

        let contents: HashSet<String> = fs::read_dir(store.paths().backups_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| fs::read_to_string(e.path()).unwrap())
            .collect();
        assert_eq!(contents.len(), 3);
    }

    #[test]
    fn test_unused_backup_path_adds_counter() {
        let dir = TempDir::new().unwrap();
        let first = unused_backup_path(dir.path(), "conv_a", 1700000000, ".json");
        assert_eq!(first, dir.path().join("conv_a_backup_1700000000.json"));
        fs::write(&first, "{}").unwrap();

        let second = unused_backup_path(dir.path(), "conv_a", 1700000000, ".json");
        assert_eq!(second, dir.path().join("conv_a_backup_1700000000_1.json"));
        fs::write(&second, "{}").unwrap();

        let third = unused_backup_path(dir.path(), "conv_a", 1700000000, ".json");
        assert_eq!(third, dir.path().join("conv_a_backup_1700000000_2.json"));
    }

    #[test]
    fn test_delete_retires_lock_file() {
        let (store, _dir) = create_test_store();
        let record = record_on("Short lived", 2024, 3, 2);
        let path = store.save_conversation(&record).unwrap();
        let lock_file = store.locks.lock_file_for(&path);
        assert!(lock_file.is_file());

        assert!(store.delete_conversation(&record.id).unwrap());
        assert!(!lock_file.exists());

        let solution = code_solution("fn main() {}");
        let solution_path = store.save_solution(&solution).unwrap();
        assert!(store.delete_solution(&solution.id).unwrap());
        assert!(!store.locks.lock_file_for(&solution_path).exists());
    }

    #[test]
    fn test_conversation_path_layout() {
        let (store, dir) = create_test_store();
        let record = record_on("Fix async bug", 2024, 3, 2);
        let path = store.save_conversation(&record).unwrap();

        let expected = dir
            .path()
            .join("conversations")
            .join("2024")
            .join("03")
            .join(format!("{}.json", record.id));
        assert_eq!(path, expected);
        assert!(expected.is_file());
    }

    #[test]
    fn test_save_load_roundtrip_via_scan() {
        let (store, _dir) = create_test_store();
        let mut record = record_on("Old conversation", 2021, 7, 9);
        record.id = "custom_id_without_date".to_string();
        store.save_conversation(&record).unwrap();

        assert!(store.load_conversation(&record.id, false).unwrap().is_none());
        let loaded = store.load_conversation(&record.id, true).unwrap().unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn test_date_hint_fast_path() {
        assert_eq!(date_hint("conv_20240302_abcdef"), NaiveDate::from_ymd_opt(2024, 3, 2));
        assert_eq!(date_hint("conv_notadate_x"), None);
        assert_eq!(date_hint("sol_1234"), None);

        let (store, _dir) = create_test_store();
        let mut record = record_on("Hinted", 2024, 3, 2);
        record.id = "conv_20240302_abcdef".to_string();
        store.save_conversation(&record).unwrap();
        assert!(store.load_conversation(&record.id, false).unwrap().is_some());
    }

    #[test]
    fn test_load_missing_and_invalid_ids() {
        let (store, _dir) = create_test_store();
        assert!(store.load_conversation("conv_missing", true).unwrap().is_none());
        assert!(store.load_conversation("../../etc/passwd", true).unwrap().is_none());
        assert!(!store.delete_conversation("conv_missing").unwrap());
    }

    #[test]
    fn test_save_rejects_invalid_record() {
        let (store, _dir) = create_test_store();
        let mut record = record_on("Valid", 2024, 1, 1);
        record.importance = 9;
        assert!(matches!(store.save_conversation(&record), Err(SynapseError::Validation(_))));
    }

    #[test]
    fn test_overwrite_takes_backup() {
        let (store, _dir) = create_test_store();
        let mut record = record_on("First title", 2024, 3, 2);
        store.save_conversation(&record).unwrap();
        assert_eq!(backup_count(&store), 0);

        record.title = "Second title".to_string();
        store.save_conversation(&record).unwrap();
        assert_eq!(backup_count(&store), 1);

        let loaded = store.load_conversation(&record.id, true).unwrap().unwrap();
        assert_eq!(loaded.title, "Second title");
    }

    #[test]
    fn test_failed_write_leaves_previous_content() {
        let (store, _dir) = create_test_store();
        let record = record_on("Stable content", 2024, 3, 2);
        let path = store.save_conversation(&record).unwrap();
        let before = fs::read_to_string(&path).unwrap();

        let err = store
            .locks
            .with_lock(&path, LockMode::Exclusive, || store.write_json_recovering(&path, &FailsMidway))
            .unwrap_err();
        assert!(matches!(err, SynapseError::JsonError(_)));

        assert_eq!(fs::read_to_string(&path).unwrap(), before);
        assert!(tmp_files(path.parent().unwrap()).is_empty());
        // The backup taken before the attempt is still there.
        assert_eq!(backup_count(&store), 1);
    }

    #[test]
    fn test_failed_first_write_leaves_nothing() {
        let (store, _dir) = create_test_store();
        let path = store.solution_path("sol_never");

        assert!(store.write_json_recovering(&path, &FailsMidway).is_err());
        assert!(!path.exists());
        assert!(tmp_files(path.parent().unwrap()).is_empty());
        assert_eq!(backup_count(&store), 0);
    }

    #[test]
    fn test_legacy_language_repair_is_idempotent_and_read_only() {
        let (store, _dir) = create_test_store();
        let mut record = record_on("Legacy", 2023, 11, 5);
        let mut solution = code_solution("def main():\n    pass");
        solution.language = None;
        record.solutions.push(solution);

        // Write the legacy shape directly, bypassing validation.
        let path = store.conversation_path(&record.id, record.created_at.date_naive());
        atomic::write_json(&path, &record).unwrap();
        let on_disk = fs::read_to_string(&path).unwrap();

        let first = store.load_conversation(&record.id, true).unwrap().unwrap();
        let second = store.load_conversation(&record.id, true).unwrap().unwrap();
        assert_eq!(first.solutions[0].language.as_deref(), Some("python"));
        assert_eq!(first.solutions[0].language, second.solutions[0].language);
        assert_eq!(fs::read_to_string(&path).unwrap(), on_disk);
    }

    #[test]
    fn test_delete_backs_up_and_removes() {
        let (store, _dir) = create_test_store();
        let record = record_on("To delete", 2024, 3, 2);
        let path = store.save_conversation(&record).unwrap();

        assert!(store.delete_conversation(&record.id).unwrap());
        assert!(!path.exists());
        assert_eq!(backup_count(&store), 1);
        assert!(!store.delete_conversation(&record.id).unwrap());
    }

    #[test]
    fn test_list_conversations_order_filter_limit() {
        let (store, _dir) = create_test_store();
        let mut ids = Vec::new();
        for (title, y, m) in [("a", 2023, 12), ("b", 2024, 1), ("c", 2024, 3), ("d", 2024, 3)] {
            let record = record_on(title, y, m, 15);
            store.save_conversation(&record).unwrap();
            ids.push((record.id, y, m));
        }

        let all = store.list_conversations(None, None, None).unwrap();
        assert_eq!(all.len(), 4);
        // Newest month first.
        let march: Vec<_> = ids.iter().filter(|(_, _, m)| *m == 3).map(|(id, _, _)| id.clone()).collect();
        assert!(march.contains(&all[0]) && march.contains(&all[1]));
        assert_eq!(all[3], ids[0].0);

        let limited = store.list_conversations(Some(2), None, None).unwrap();
        assert_eq!(limited, all[..2].to_vec());

        // A start date in the middle of a month keeps that month.
        let since = store
            .list_conversations(None, NaiveDate::from_ymd_opt(2024, 1, 20), None)
            .unwrap();
        assert_eq!(since.len(), 3);

        let until = store
            .list_conversations(None, None, NaiveDate::from_ymd_opt(2023, 12, 31))
            .unwrap();
        assert_eq!(until, vec![ids[0].0.clone()]);
    }

    #[test]
    fn test_list_ignores_non_numeric_dirs_and_tmp_files() {
        let (store, _dir) = create_test_store();
        let record = record_on("Kept", 2024, 5, 1);
        let path = store.save_conversation(&record).unwrap();
        fs::create_dir_all(store.paths().conversations_dir().join("misc")).unwrap();
        fs::write(path.parent().unwrap().join("partial_abc.tmp"), b"{").unwrap();

        assert_eq!(store.list_conversations(None, None, None).unwrap(), vec![record.id]);
    }

    #[test]
    fn test_solution_crud() {
        let (store, _dir) = create_test_store();
        let solution = code_solution("fn main() {}");
        store.save_solution(&solution).unwrap();

        assert_eq!(store.load_solution(&solution.id).unwrap().unwrap(), solution);
        assert!(store.delete_solution(&solution.id).unwrap());
        assert!(store.load_solution(&solution.id).unwrap().is_none());
        assert!(!store.delete_solution(&solution.id).unwrap());
    }

    #[test]
    fn test_update_reference_count() {
        let (store, _dir) = create_test_store();
        let solution = code_solution("fn main() {}");
        store.save_solution(&solution).unwrap();

        assert!(store.update_solution_reference_count(&solution.id).unwrap());
        assert!(store.update_solution_reference_count(&solution.id).unwrap());
        let loaded = store.load_solution(&solution.id).unwrap().unwrap();
        assert_eq!(loaded.reference_count, 2);
        assert!(loaded.last_referenced.is_some());

        assert!(!store.update_solution_reference_count("sol_absent").unwrap());
    }

    #[test]
    fn test_batch_save_and_dedup_prefers_higher_reference_count() {
        let (store, _dir) = create_test_store();
        let shared = code_solution("let x = 1;");
        let approach = Solution::new(SolutionType::Approach, "binary search the history", "debugging", None, vec![], 0.9)
            .unwrap();

        let written = store.save_solution_batch(&[shared.clone(), approach.clone()], false).unwrap();
        assert_eq!(written.len(), 2);
        assert!(written.iter().all(|p| {
            let name = p.file_name().unwrap().to_string_lossy().into_owned();
            name.starts_with("extracted_") && name.contains("_solutions_")
        }));

        // Surfacing the batch-only solution promotes it to an individual file.
        assert!(store.update_solution_reference_count(&shared.id).unwrap());
        assert!(store.solution_path(&shared.id).is_file());

        let all = store.load_all_solutions().unwrap();
        assert_eq!(all.len(), 2);
        let loaded_shared = all.iter().find(|s| s.id == shared.id).unwrap();
        assert_eq!(loaded_shared.reference_count, 1);

        let batches = store.list_solution_batches().unwrap();
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.solutions_count == 1));
    }

    #[test]
    fn test_dedup_keeps_first_seen_order() {
        let mut a1 = code_solution("a");
        a1.id = "sol_a".to_string();
        let mut b = code_solution("b");
        b.id = "sol_b".to_string();
        let mut a2 = a1.clone();
        a2.reference_count = 5;

        let unique = dedup_solutions(vec![a1, b, a2]);
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].id, "sol_a");
        assert_eq!(unique[0].reference_count, 5);
        assert_eq!(unique[1].id, "sol_b");
    }

    proptest! {
        #[test]
        fn prop_dedup_keeps_highest_count_per_id(entries in proptest::collection::vec((0u8..4, 0u32..20), 0..30)) {
            let solutions: Vec<Solution> = entries
                .iter()
                .map(|(id, count)| {
                    let mut s = code_solution("x");
                    s.id = format!("sol_{}", id);
                    s.reference_count = *count;
                    s
                })
                .collect();

            let unique = dedup_solutions(solutions.clone());
            let ids: HashSet<&str> = unique.iter().map(|s| s.id.as_str()).collect();
            prop_assert_eq!(ids.len(), unique.len());

            for kept in &unique {
                let best = solutions
                    .iter()
                    .filter(|s| s.id == kept.id)
                    .map(|s| s.reference_count)
                    .max();
                prop_assert_eq!(Some(kept.reference_count), best);
            }
            let all_ids: HashSet<&str> = solutions.iter().map(|s| s.id.as_str()).collect();
            prop_assert_eq!(all_ids, ids);
        }
    }

    #[test]
    fn test_storage_statistics() {
        let (store, _dir) = create_test_store();
        store.save_conversation(&record_on("one", 2024, 1, 1)).unwrap();
        store.save_conversation(&record_on("two", 2024, 2, 1)).unwrap();
        store.save_solution(&code_solution("x")).unwrap();

        let stats = store.storage_statistics().unwrap();
        assert_eq!(stats.total_conversations, 2);
        assert_eq!(stats.total_solutions, 1);
        assert_eq!(stats.total_files, 3);
        assert!(stats.total_size_bytes > 0);
        assert!(stats.avg_file_size_kb > 0.0);
    }

    #[test]
    fn test_export_and_import_append() {
        let (source, _src_dir) = create_test_store();
        let exported = record_on("Exported", 2024, 4, 4);
        source.save_conversation(&exported).unwrap();
        source.save_solution(&code_solution("exported")).unwrap();

        let export_dir = TempDir::new().unwrap();
        source.export_data(export_dir.path(), false).unwrap();
        assert!(export_dir.path().join(EXPORT_INFO_FILE).is_file());
        assert!(export_dir.path().join("conversations").join("2024").join("04").is_dir());
        assert!(!export_dir.path().join("backups").exists());

        let (target, _dst_dir) = create_test_store();
        let local = record_on("Local", 2024, 5, 5);
        target.save_conversation(&local).unwrap();

        target.import_data(export_dir.path(), MergeMode::Append).unwrap();
        let ids = target.list_conversations(None, None, None).unwrap();
        assert!(ids.contains(&exported.id));
        assert!(ids.contains(&local.id));

        let pre_import = fs::read_dir(target.paths().backups_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().starts_with("pre_import_"));
        assert!(pre_import);
    }

    #[test]
    fn test_import_overwrite_replaces_subtree() {
        let (source, _src_dir) = create_test_store();
        let exported = record_on("Exported", 2024, 4, 4);
        source.save_conversation(&exported).unwrap();
        let export_dir = TempDir::new().unwrap();
        source.export_data(export_dir.path(), false).unwrap();

        let (target, _dst_dir) = create_test_store();
        let local = record_on("Local", 2024, 5, 5);
        target.save_conversation(&local).unwrap();

        target.import_data(export_dir.path(), MergeMode::Overwrite).unwrap();
        let ids = target.list_conversations(None, None, None).unwrap();
        assert_eq!(ids, vec![exported.id]);
    }

    #[test]
    fn test_import_missing_source() {
        let (store, dir) = create_test_store();
        let err = store.import_data(&dir.path().join("nope"), MergeMode::Append).unwrap_err();
        assert!(matches!(err, SynapseError::SourceNotFound(_)));
    }

    #[test]
    fn test_cleanup_backups_by_count_and_age() {
        let (store, _dir) = create_test_store();
        let backups = store.paths().backups_dir();
        let now = SystemTime::now();

        for i in 0..5u64 {
            let path = backups.join(format!("conv_x_backup_{}.json", 1_700_000_000 + i));
            fs::write(&path, b"{}").unwrap();
            let file = fs::File::options().write(true).open(&path).unwrap();
            file.set_modified(now - Duration::from_secs(60 * (5 - i))).unwrap();
        }
        let ancient = backups.join("conv_y_backup_1.json");
        fs::write(&ancient, b"{}").unwrap();
        fs::File::options()
            .write(true)
            .open(&ancient)
            .unwrap()
            .set_modified(now - Duration::from_secs(90 * 24 * 3600))
            .unwrap();
        fs::write(backups.join("unrelated.json"), b"{}").unwrap();

        // Keep the three newest; the ancient one falls to both bounds.
        let removed = store.cleanup_backups(30, 3).unwrap();
        assert_eq!(removed, 3);
        assert!(!ancient.exists());
        assert!(backups.join("unrelated.json").exists());
        assert!(backups.join("conv_x_backup_1700000004.json").exists());
        assert!(!backups.join("conv_x_backup_1700000000.json").exists());
    }

    #[test]
    fn test_merge_mode_parse() {
        assert_eq!("append".parse::<MergeMode>().unwrap(), MergeMode::Append);
        assert_eq!("OVERWRITE".parse::<MergeMode>().unwrap(), MergeMode::Overwrite);
        assert!("merge".parse::<MergeMode>().is_err());
    }
}
