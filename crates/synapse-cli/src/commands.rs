//! Subcommands and their handlers.
//!
//! Each handler calls the store and the index together (save then index,
//! delete then unindex) and returns a JSON value for `main` to print.

use crate::config::CONFIG_FILE_NAME;
use crate::state::AppState;
use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::Subcommand;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use synapse_core::{MergeMode, SearchQuery, TimeRange};
use synapse_types::ConversationRecord;
use tracing::{info, warn};

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the storage layout, an empty index, and a default config file
    Init {
        /// Re-run even if storage is already initialized
        #[arg(long)]
        force: bool,
    },

    /// Show directory existence, permissions, and sizes
    Status,

    /// Save a conversation from a JSON file and index it
    Save {
        /// A full record, or an object with title, content, and optional
        /// summary, tags, category, importance
        file: PathBuf,
    },

    /// Print a conversation record
    Show { id: String },

    /// Delete a conversation and remove it from the index
    Delete {
        id: String,
        /// Leave the index entry in place
        #[arg(long)]
        keep_index: bool,
    },

    /// List conversation ids, newest first
    List {
        #[arg(short, long)]
        limit: Option<usize>,
        /// Only months overlapping this date or later (YYYY-MM-DD)
        #[arg(long, value_name = "DATE")]
        since: Option<NaiveDate>,
        /// Only months overlapping this date or earlier (YYYY-MM-DD)
        #[arg(long, value_name = "DATE")]
        until: Option<NaiveDate>,
    },

    /// Search indexed conversations
    Search {
        query: String,
        /// Tag filter; can be repeated
        #[arg(long = "tag", value_name = "TAG")]
        tags: Vec<String>,
        #[arg(long)]
        category: Option<String>,
        /// week, month, or all
        #[arg(long, value_name = "RANGE")]
        time_range: Option<TimeRange>,
        #[arg(long, value_name = "N")]
        min_importance: Option<u8>,
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Rebuild the search index from the conversation files
    Reindex,

    /// Storage and index statistics
    Stats,

    /// Work with extracted solutions
    Solutions {
        #[command(subcommand)]
        command: SolutionsCommand,
    },

    /// Copy all data to a directory
    Export {
        dir: PathBuf,
        #[arg(long)]
        include_backups: bool,
    },

    /// Import data exported by `export`, then rebuild the index
    Import {
        dir: PathBuf,
        /// append or overwrite
        #[arg(long, default_value = "append")]
        mode: MergeMode,
    },

    /// Delete old backups
    CleanupBackups {
        #[arg(long, value_name = "DAYS")]
        max_age_days: Option<u64>,
        #[arg(long, value_name = "N")]
        max_count: Option<usize>,
    },
}

#[derive(Subcommand, Debug)]
pub enum SolutionsCommand {
    /// All solutions (one per id) and the batch files they came from
    List,
    /// Print one solution
    Show { id: String },
    /// Record that a solution was used
    Touch { id: String },
}

/// Input shape for `save` when the file is not a full record.
#[derive(Debug, Deserialize)]
struct NewConversation {
    title: String,
    content: String,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    importance: Option<u8>,
}

impl NewConversation {
    fn into_record(self) -> Result<ConversationRecord> {
        let mut record = ConversationRecord::new(self.title, self.content)?.with_tags(self.tags);
        if let Some(summary) = self.summary {
            record = record.with_summary(summary);
        }
        if let Some(category) = self.category {
            record = record.with_category(&category);
        }
        if let Some(importance) = self.importance {
            record = record.with_importance(importance)?;
        }
        Ok(record)
    }
}

/// Parse a `save` input file: a stored record if it carries an `id`,
/// otherwise a new conversation.
pub fn parse_conversation(raw: &str) -> Result<ConversationRecord> {
    let value: Value = serde_json::from_str(raw).context("input is not valid JSON")?;
    if value.get("id").is_some() {
        let mut record: ConversationRecord =
            serde_json::from_value(value).context("input is not a valid conversation record")?;
        record.normalize();
        record.validate()?;
        Ok(record)
    } else {
        let new: NewConversation =
            serde_json::from_value(value).context("input needs at least title and content")?;
        new.into_record()
    }
}

pub fn run(state: &AppState, command: Command) -> Result<Value> {
    match command {
        Command::Init { force } => init(state, force),
        Command::Status => Ok(serde_json::to_value(state.initializer().storage_status())?),
        Command::Save { file } => save(state, &file),
        Command::Show { id } => show(state, &id),
        Command::Delete { id, keep_index } => delete(state, &id, keep_index),
        Command::List { limit, since, until } => {
            let ids = state.store.list_conversations(limit, since, until)?;
            Ok(json!({ "count": ids.len(), "ids": ids }))
        }
        Command::Search {
            query,
            tags,
            category,
            time_range,
            min_importance,
            limit,
        } => {
            let mut search = SearchQuery::new(query)
                .with_tags(tags)
                .with_limit(limit.unwrap_or(state.config.search.default_limit));
            search.category = category;
            search.time_range = time_range;
            search.importance_min = min_importance;

            let hits = state.index.search_conversations(&search)?;
            Ok(json!({ "count": hits.len(), "results": hits }))
        }
        Command::Reindex => Ok(serde_json::to_value(state.index.rebuild(&state.store)?)?),
        Command::Stats => Ok(json!({
            "storage": state.store.storage_statistics()?,
            "index": state.index.stats()?,
        })),
        Command::Solutions { command } => solutions(state, command),
        Command::Export { dir, include_backups } => {
            state.store.export_data(&dir, include_backups)?;
            Ok(json!({ "exported_to": dir, "include_backups": include_backups }))
        }
        Command::Import { dir, mode } => import(state, &dir, mode),
        Command::CleanupBackups {
            max_age_days,
            max_count,
        } => {
            let max_age_days = max_age_days.unwrap_or(state.config.backups.max_age_days);
            let max_count = max_count.unwrap_or(state.config.backups.max_count);
            let removed = state.store.cleanup_backups(max_age_days, max_count)?;
            Ok(json!({ "removed": removed, "max_age_days": max_age_days, "max_count": max_count }))
        }
    }
}

fn init(state: &AppState, force: bool) -> Result<Value> {
    let report = state.initializer().initialize(force)?;

    let config_path = state.paths.config_dir().join(CONFIG_FILE_NAME);
    let config_created = if config_path.exists() {
        false
    } else {
        fs::create_dir_all(state.paths.config_dir())?;
        fs::write(&config_path, state.config.to_toml_string()?)
            .with_context(|| format!("failed to write {}", config_path.display()))?;
        info!(target: "synapse::cli", "Wrote default config to {}", config_path.display());
        true
    };

    for warning in &report.warnings {
        warn!(target: "synapse::cli", "{}", warning);
    }

    Ok(json!({
        "report": report,
        "config_path": config_path,
        "config_created": config_created,
        "storage_paths": state.paths.storage_info(),
    }))
}

fn save(state: &AppState, file: &Path) -> Result<Value> {
    let raw = fs::read_to_string(file).with_context(|| format!("failed to read {}", file.display()))?;
    let record = parse_conversation(&raw)?;
    let path = state.store.save_conversation(&record)?;

    // The record is durable at this point; an index failure only leaves it unsearchable.
    let indexed = match state.index.add_conversation(&record) {
        Ok(()) => true,
        Err(e) => {
            warn!(target: "synapse::cli", "Saved {} but indexing failed, run reindex: {}", record.id, e);
            false
        }
    };

    Ok(json!({ "id": record.id, "path": path, "indexed": indexed }))
}

fn show(state: &AppState, id: &str) -> Result<Value> {
    match state.store.load_conversation(id, true)? {
        Some(record) => Ok(serde_json::to_value(record)?),
        None => bail!("Conversation not found: {}", id),
    }
}

fn delete(state: &AppState, id: &str, keep_index: bool) -> Result<Value> {
    let deleted = state.store.delete_conversation(id)?;
    // Unindex even when the file is already gone, to clear stale entries.
    let unindexed = if keep_index {
        false
    } else {
        state.index.remove_conversation(id)?
    };

    if !deleted && !unindexed {
        bail!("Conversation not found: {}", id);
    }
    Ok(json!({ "id": id, "deleted": deleted, "unindexed": unindexed }))
}

fn solutions(state: &AppState, command: SolutionsCommand) -> Result<Value> {
    match command {
        SolutionsCommand::List => {
            let solutions = state.store.load_all_solutions()?;
            let batches = state.store.list_solution_batches()?;
            Ok(json!({ "count": solutions.len(), "solutions": solutions, "batches": batches }))
        }
        SolutionsCommand::Show { id } => {
            let found = match state.store.load_solution(&id)? {
                Some(solution) => Some(solution),
                None => state.store.load_all_solutions()?.into_iter().find(|s| s.id == id),
            };
            match found {
                Some(solution) => Ok(serde_json::to_value(solution)?),
                None => bail!("Solution not found: {}", id),
            }
        }
        SolutionsCommand::Touch { id } => {
            if !state.store.update_solution_reference_count(&id)? {
                bail!("Solution not found: {}", id);
            }
            let solution = state.store.load_solution(&id)?;
            Ok(json!({ "id": id, "solution": solution }))
        }
    }
}

fn import(state: &AppState, dir: &Path, mode: MergeMode) -> Result<Value> {
    state.store.import_data(dir, mode)?;
    state.index.reload();
    let reindexed = state.index.rebuild(&state.store)?;

    Ok(json!({
        "imported_from": dir,
        "mode": mode.as_str(),
        "reindexed": reindexed,
    }))
}
