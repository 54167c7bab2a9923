//! Persisted inverted index over conversation metadata.
//!
//! The whole index is one JSON document at `indexes/search_index.json`. It is
//! loaded lazily, cached for the lifetime of the [`SearchIndex`], and rewritten
//! in full after every mutation. Callers keep it in sync with the
//! [`FileStore`] by hand; `rebuild` is the repair path when the two drift.

use crate::atomic;
use crate::file_store::FileStore;
use crate::paths::StoragePaths;
use crate::tokenizer::tokenize;
use crate::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use synapse_types::{normalize_category, normalize_tags, ConversationRecord};
use tracing::{debug, error, info, warn};

pub const INDEX_FILE_NAME: &str = "search_index.json";
pub const INDEX_VERSION: &str = "1.0";
pub const DEFAULT_SEARCH_LIMIT: usize = 10;
/// Summaries are truncated to this many characters in the metadata entry.
pub const SUMMARY_PREVIEW_CHARS: usize = 200;

const TITLE_WEIGHT: f64 = 0.5;
const TAG_WEIGHT: f64 = 0.3;
const SUMMARY_WEIGHT: f64 = 0.2;
const IMPORTANCE_WEIGHT: f64 = 0.05;
const RECENCY_WEIGHT: f64 = 0.05;
const RECENCY_WINDOW_DAYS: i64 = 30;

/// Denormalized view of one conversation, enough to filter and score
/// without opening the record file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedMetadata {
    pub title: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub importance: u8,
    #[serde(deserialize_with = "synapse_types::timestamp::deserialize")]
    pub created_at: DateTime<Utc>,
    #[serde(deserialize_with = "synapse_types::timestamp::deserialize")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub content_length: usize,
    #[serde(default)]
    pub solutions_count: usize,
}

impl IndexedMetadata {
    fn from_record(record: &ConversationRecord) -> Self {
        Self {
            title: record.title.clone(),
            category: normalize_category(&record.category),
            importance: record.importance,
            created_at: record.created_at,
            updated_at: record.updated_at,
            tags: normalize_tags(&record.tags),
            summary: record.summary.chars().take(SUMMARY_PREVIEW_CHARS).collect(),
            content_length: record.content.chars().count(),
            solutions_count: record.solutions.len(),
        }
    }

    /// Tokens this entry contributes to the keyword index: title and summary
    /// tokens, lowercased tags, and the category.
    fn keywords(&self) -> BTreeSet<String> {
        let mut keywords = tokenize(&self.title);
        keywords.extend(tokenize(&self.summary));
        keywords.extend(self.tag_keys());
        let category = self.category.trim().to_lowercase();
        if !category.is_empty() {
            keywords.insert(category);
        }
        keywords
    }

    fn tag_keys(&self) -> impl Iterator<Item = String> + '_ {
        self.tags
            .iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
    }
}

/// Summary counters stored alongside the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    #[serde(default)]
    pub total_conversations: usize,
    #[serde(default)]
    pub total_keywords: usize,
    #[serde(default)]
    pub total_tags: usize,
    #[serde(default, deserialize_with = "synapse_types::timestamp::deserialize_option")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default = "default_index_version")]
    pub index_version: String,
}

fn default_index_version() -> String {
    INDEX_VERSION.to_string()
}

impl Default for IndexStats {
    fn default() -> Self {
        Self {
            total_conversations: 0,
            total_keywords: 0,
            total_tags: 0,
            last_updated: None,
            index_version: default_index_version(),
        }
    }
}

/// The on-disk index document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexDocument {
    #[serde(default)]
    pub keyword_index: BTreeMap<String, BTreeSet<String>>,
    #[serde(default)]
    pub tag_index: BTreeMap<String, BTreeSet<String>>,
    #[serde(default)]
    pub metadata_index: BTreeMap<String, IndexedMetadata>,
    #[serde(default)]
    pub stats: IndexStats,
}

impl IndexDocument {
    fn insert(&mut self, id: &str, metadata: IndexedMetadata) {
        self.remove(id);

        for keyword in metadata.keywords() {
            self.keyword_index.entry(keyword).or_default().insert(id.to_string());
        }
        for tag in metadata.tag_keys() {
            self.tag_index.entry(tag).or_default().insert(id.to_string());
        }
        self.metadata_index.insert(id.to_string(), metadata);
    }

    /// Drop every trace of `id`, pruning emptied keyword and tag sets.
    fn remove(&mut self, id: &str) -> bool {
        let Some(metadata) = self.metadata_index.remove(id) else {
            return false;
        };

        for keyword in metadata.keywords() {
            discard(&mut self.keyword_index, &keyword, id);
        }
        for tag in metadata.tag_keys() {
            discard(&mut self.tag_index, &tag, id);
        }
        true
    }

    fn refresh_stats(&mut self, now: DateTime<Utc>) {
        self.stats.total_conversations = self.metadata_index.len();
        self.stats.total_keywords = self.keyword_index.len();
        self.stats.total_tags = self.tag_index.len();
        self.stats.last_updated = Some(now);
        self.stats.index_version = default_index_version();
    }

    fn union_of<'a>(map: &BTreeMap<String, BTreeSet<String>>, keys: impl Iterator<Item = &'a String>) -> BTreeSet<String> {
        keys.filter_map(|key| map.get(key))
            .flat_map(|ids| ids.iter().cloned())
            .collect()
    }
}

fn discard(map: &mut BTreeMap<String, BTreeSet<String>>, key: &str, id: &str) {
    if let Some(ids) = map.get_mut(key) {
        ids.remove(id);
        if ids.is_empty() {
            map.remove(key);
        }
    }
}

/// Time window applied to `created_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeRange {
    /// Created within the last 7 days.
    Week,
    /// Created within the last 30 days.
    Month,
    All,
}

impl TimeRange {
    pub fn contains(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let days = (now - created_at).num_days();
        match self {
            TimeRange::Week => days <= 7,
            TimeRange::Month => days <= 30,
            TimeRange::All => true,
        }
    }
}

impl std::str::FromStr for TimeRange {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "week" => Ok(TimeRange::Week),
            "month" => Ok(TimeRange::Month),
            "all" => Ok(TimeRange::All),
            _ => Err(format!("Invalid time range: '{}'. Use 'week', 'month', or 'all'.", s)),
        }
    }
}

/// Parameters for [`SearchIndex::search_conversations`].
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub query: String,
    pub tags: Vec<String>,
    pub category: Option<String>,
    pub time_range: Option<TimeRange>,
    pub importance_min: Option<u8>,
    pub limit: usize,
}

impl SearchQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            tags: Vec::new(),
            category: None,
            time_range: None,
            importance_min: None,
            limit: DEFAULT_SEARCH_LIMIT,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_time_range(mut self, time_range: TimeRange) -> Self {
        self.time_range = Some(time_range);
        self
    }

    pub fn with_importance_min(mut self, importance_min: u8) -> Self {
        self.importance_min = Some(importance_min);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// One ranked search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub title: String,
    pub summary: String,
    pub tags: Vec<String>,
    pub category: String,
    pub importance: u8,
    pub created_at: DateTime<Utc>,
    /// Relevance in `[0, 1]`, rounded to three decimals.
    pub match_score: f64,
}

/// Outcome of [`SearchIndex::rebuild`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RebuildStats {
    pub indexed: usize,
    pub failed: usize,
}

/// Keyword and tag search over conversation metadata.
///
/// Not covered by the record locks. Mutations within one process serialize on
/// an internal mutex; there is no cross-process coordination on the index file.
pub struct SearchIndex {
    index_path: PathBuf,
    cache: Mutex<Option<IndexDocument>>,
}

impl SearchIndex {
    pub fn new(paths: &StoragePaths) -> Self {
        let indexes_dir = paths.indexes_dir();
        paths.create_directory(&indexes_dir);
        Self {
            index_path: indexes_dir.join(INDEX_FILE_NAME),
            cache: Mutex::new(None),
        }
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// Forget the cached document; the next call re-reads disk.
    pub fn reload(&self) {
        *self.cache.lock() = None;
        debug!(target: "synapse::index", "Search index cache dropped");
    }

    fn load_from_disk(&self) -> Result<IndexDocument> {
        let raw = match fs::read_to_string(&self.index_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(target: "synapse::index", "No search index yet, starting empty");
                return Ok(IndexDocument::default());
            }
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str::<IndexDocument>(&raw) {
            Ok(doc) => {
                debug!(
                    target: "synapse::index",
                    "Loaded search index with {} conversations",
                    doc.metadata_index.len()
                );
                Ok(doc)
            }
            Err(e) => {
                warn!(
                    target: "synapse::index",
                    "Search index at {} is unreadable, starting empty: {}",
                    self.index_path.display(),
                    e
                );
                Ok(IndexDocument::default())
            }
        }
    }

    fn loaded<'a>(&self, cache: &'a mut Option<IndexDocument>) -> Result<&'a mut IndexDocument> {
        if cache.is_none() {
            *cache = Some(self.load_from_disk()?);
        }
        Ok(cache.get_or_insert_with(IndexDocument::default))
    }

    fn read<T>(&self, f: impl FnOnce(&IndexDocument) -> T) -> Result<T> {
        let mut cache = self.cache.lock();
        let doc = self.loaded(&mut cache)?;
        Ok(f(doc))
    }

    /// Apply `f`, refresh stats, and rewrite the document. A failed write
    /// drops the cache so memory never runs ahead of disk.
    fn mutate<T>(&self, f: impl FnOnce(&mut IndexDocument) -> T) -> Result<T> {
        let mut cache = self.cache.lock();
        let doc = self.loaded(&mut cache)?;
        let out = f(doc);
        doc.refresh_stats(Utc::now());

        if let Err(e) = atomic::write_json(&self.index_path, doc) {
            error!(target: "synapse::index", "Failed to persist search index: {}", e);
            *cache = None;
            return Err(e);
        }
        Ok(out)
    }

    /// Index a conversation, replacing any previous entry for its id.
    pub fn add_conversation(&self, record: &ConversationRecord) -> Result<()> {
        let metadata = IndexedMetadata::from_record(record);
        self.mutate(|doc| doc.insert(&record.id, metadata))?;
        debug!(target: "synapse::index", "Indexed conversation {}", record.id);
        Ok(())
    }

    /// Remove a conversation. Returns false if it was not indexed.
    pub fn remove_conversation(&self, id: &str) -> Result<bool> {
        let removed = self.mutate(|doc| doc.remove(id))?;
        if removed {
            debug!(target: "synapse::index", "Removed conversation {} from index", id);
        } else {
            debug!(target: "synapse::index", "Conversation {} was not indexed", id);
        }
        Ok(removed)
    }

    /// Remove then add. Between the two steps (each persisted separately) a
    /// concurrent search will not see the record.
    pub fn update_conversation(&self, record: &ConversationRecord) -> Result<()> {
        self.remove_conversation(&record.id)?;
        self.add_conversation(record)
    }

    pub fn contains(&self, id: &str) -> Result<bool> {
        self.read(|doc| doc.metadata_index.contains_key(id))
    }

    /// Ranked search.
    ///
    /// Candidates are the union of keyword hits for every query token. If tags
    /// are given, candidates are intersected with the tag hits (or replaced by
    /// them when the query matched nothing). Category, importance, and time
    /// range then filter on metadata.
    pub fn search_conversations(&self, query: &SearchQuery) -> Result<Vec<SearchHit>> {
        let query_tokens = tokenize(&query.query);
        let search_tags: BTreeSet<String> = query
            .tags
            .iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        let category = query.category.as_deref().map(normalize_category);
        let now = Utc::now();

        let mut hits = self.read(|doc| {
            let mut candidates = IndexDocument::union_of(&doc.keyword_index, query_tokens.iter());
            if !search_tags.is_empty() {
                let tagged = IndexDocument::union_of(&doc.tag_index, search_tags.iter());
                candidates = if candidates.is_empty() {
                    tagged
                } else {
                    candidates.intersection(&tagged).cloned().collect()
                };
            }

            candidates
                .into_iter()
                .filter_map(|id| {
                    let metadata = doc.metadata_index.get(&id)?;
                    if category.as_ref().is_some_and(|c| &metadata.category != c) {
                        return None;
                    }
                    if query.importance_min.is_some_and(|min| metadata.importance < min) {
                        return None;
                    }
                    if query.time_range.is_some_and(|range| !range.contains(metadata.created_at, now)) {
                        return None;
                    }

                    let score = relevance_score(metadata, &query_tokens, &search_tags, now);
                    Some(SearchHit {
                        id,
                        title: metadata.title.clone(),
                        summary: metadata.summary.clone(),
                        tags: metadata.tags.clone(),
                        category: metadata.category.clone(),
                        importance: metadata.importance,
                        created_at: metadata.created_at,
                        match_score: (score * 1000.0).round() / 1000.0,
                    })
                })
                .collect::<Vec<_>>()
        })?;

        hits.sort_by(|a, b| {
            b.match_score
                .total_cmp(&a.match_score)
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(query.limit);

        debug!(
            target: "synapse::index",
            "Search '{}' returned {} results",
            query.query,
            hits.len()
        );
        Ok(hits)
    }

    /// Rebuild from every conversation in `store`, replacing the current index.
    /// Conversations that fail to load are counted and skipped.
    pub fn rebuild(&self, store: &FileStore) -> Result<RebuildStats> {
        info!(target: "synapse::index", "Rebuilding search index");
        let mut fresh = IndexDocument::default();
        let mut stats = RebuildStats::default();

        for id in store.list_conversations(None, None, None)? {
            match store.load_conversation(&id, true) {
                Ok(Some(record)) => {
                    fresh.insert(&record.id, IndexedMetadata::from_record(&record));
                    stats.indexed += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(target: "synapse::index", "Skipping conversation {} during rebuild: {}", id, e);
                    stats.failed += 1;
                }
            }
        }

        self.mutate(|doc| *doc = fresh)?;
        info!(
            target: "synapse::index",
            "Search index rebuilt: {} indexed, {} failed",
            stats.indexed,
            stats.failed
        );
        Ok(stats)
    }

    /// Counters as of the last persisted mutation.
    pub fn stats(&self) -> Result<IndexStats> {
        self.read(|doc| doc.stats.clone())
    }
}

fn overlap(query: &BTreeSet<String>, field: &BTreeSet<String>) -> f64 {
    if query.is_empty() {
        return 0.0;
    }
    query.intersection(field).count() as f64 / query.len() as f64
}

/// Weighted sum of title, tag, and summary overlap plus small importance and
/// recency boosts, capped at 1.0.
fn relevance_score(
    metadata: &IndexedMetadata,
    query_tokens: &BTreeSet<String>,
    search_tags: &BTreeSet<String>,
    now: DateTime<Utc>,
) -> f64 {
    let mut score = TITLE_WEIGHT * overlap(query_tokens, &tokenize(&metadata.title));

    if !search_tags.is_empty() {
        let tags: BTreeSet<String> = metadata.tag_keys().collect();
        score += TAG_WEIGHT * overlap(search_tags, &tags);
    }

    score += SUMMARY_WEIGHT * overlap(query_tokens, &tokenize(&metadata.summary));
    score += f64::from(metadata.importance) / 5.0 * IMPORTANCE_WEIGHT;

    let days_old = (now - metadata.created_at).num_days().max(0);
    if days_old <= RECENCY_WINDOW_DAYS {
        score += (RECENCY_WINDOW_DAYS - days_old) as f64 / RECENCY_WINDOW_DAYS as f64 * RECENCY_WEIGHT;
    }

    score.min(1.0)
}
