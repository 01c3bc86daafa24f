//! Candidate repository: the persistence boundary of the pipeline.
//!
//! The trait covers exactly what the pipeline needs: create with hash
//! deduplication, partial updates, atomic multi-row commits, filtered
//! search with offset paging, and bulk state moves.
//!
//! Two implementations:
//! - [`InMemoryRepository`]: a mutex-guarded store for tests and single runs.
//! - [`FileRepository`]: the same store snapshotted to a JSON file after every
//!   commit. Writes are atomic: write to `.tmp`, then rename into place. A
//!   snapshot changed on disk by another process since it was last read or
//!   written here is never overwritten.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use alphaforge_core::domain::{
    Candidate, CandidateDraft, CandidateId, CandidatePatch, ExpressionHash,
};
use alphaforge_core::lifecycle::{CandidateState, LifecycleError};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("candidate {0} not found")]
    NotFound(CandidateId),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("invalid filter `{key}`: {reason}")]
    InvalidFilter { key: String, reason: String },

    #[error("repository I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("repository snapshot is corrupt: {0}")]
    Corrupt(String),

    #[error("repository {0} was modified by another writer; reopen it")]
    Conflict(PathBuf),

    #[error("repository lock poisoned")]
    Poisoned,
}

// ─── Filters ─────────────────────────────────────────────────────────

/// Condition on one candidate attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(Value),
    In(Vec<Value>),
    NotIn(Vec<Value>),
    /// Strictly greater; missing values never match.
    Gt(f64),
    /// `true` matches absent values, `false` present ones.
    IsNull(bool),
}

impl Predicate {
    fn matches(&self, value: Option<&Value>) -> bool {
        match self {
            Predicate::Eq(want) => value.is_some_and(|v| values_equal(v, want)),
            Predicate::In(set) => value.is_some_and(|v| set.iter().any(|w| values_equal(v, w))),
            Predicate::NotIn(set) => !value.is_some_and(|v| set.iter().any(|w| values_equal(v, w))),
            Predicate::Gt(min) => value.and_then(Value::as_f64).is_some_and(|v| v > *min),
            Predicate::IsNull(null) => value.is_none() == *null,
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Conjunction of predicates over candidate attributes.
///
/// Attribute names: `id`, `state`, `level`, `template_id`, `parent_id`,
/// `batch_no`, `sharpe`, `fitness`, `operator_count`, `external_id`,
/// `expression_hash`, `expression`, `pnl`, plus any settings key
/// (`region`, `universe`, `delay`, ...).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    clauses: Vec<(String, Predicate)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(state: CandidateState) -> Self {
        Self::new().eq("state", state.ordinal())
    }

    pub fn with(mut self, field: impl Into<String>, predicate: Predicate) -> Self {
        self.clauses.push((field.into(), predicate));
        self
    }

    pub fn eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, Predicate::Eq(value.into()))
    }

    pub fn any_of(self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.with(field, Predicate::In(values))
    }

    pub fn not_in(self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.with(field, Predicate::NotIn(values))
    }

    pub fn gt(self, field: impl Into<String>, min: f64) -> Self {
        self.with(field, Predicate::Gt(min))
    }

    pub fn is_null(self, field: impl Into<String>, null: bool) -> Self {
        self.with(field, Predicate::IsNull(null))
    }

    /// Both filters must hold.
    pub fn and(mut self, other: Filter) -> Self {
        self.clauses.extend(other.clauses);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Parse one `key=value` query pair using the suffix convention:
    /// `sharpe_gt=1.2`, `name_not_in=a,b`, `region_in=USA,EUR`,
    /// `pnl_isnull=true`; anything else is equality. Values are read as
    /// JSON when possible (`1`, `true`), otherwise as plain strings.
    pub fn parse(key: &str, raw: &str) -> Result<Self, RepoError> {
        let invalid = |reason: &str| RepoError::InvalidFilter {
            key: key.to_string(),
            reason: reason.to_string(),
        };
        let list = |s: &str| s.split(',').map(|v| scalar(v.trim())).collect::<Vec<_>>();

        if key.is_empty() {
            return Err(invalid("empty key"));
        }
        let filter = if let Some(field) = key.strip_suffix("_not_in") {
            Self::new().not_in(field, list(raw))
        } else if let Some(field) = key.strip_suffix("_in") {
            Self::new().any_of(field, list(raw))
        } else if let Some(field) = key.strip_suffix("_gt") {
            let min: f64 = raw.trim().parse().map_err(|_| invalid("expected a number"))?;
            Self::new().gt(field, min)
        } else if let Some(field) = key.strip_suffix("_isnull") {
            let null: bool = raw.trim().parse().map_err(|_| invalid("expected true or false"))?;
            Self::new().is_null(field, null)
        } else {
            Self::new().eq(key, scalar(raw))
        };
        Ok(filter)
    }

    /// Parse a list of `key=value` pairs.
    pub fn parse_pairs<'a>(pairs: impl IntoIterator<Item = &'a str>) -> Result<Self, RepoError> {
        let mut filter = Self::new();
        for pair in pairs {
            let (key, raw) = pair.split_once('=').ok_or_else(|| RepoError::InvalidFilter {
                key: pair.to_string(),
                reason: "expected key=value".into(),
            })?;
            filter = filter.and(Self::parse(key.trim(), raw)?);
        }
        Ok(filter)
    }

    pub fn matches(&self, candidate: &Candidate) -> bool {
        self.clauses
            .iter()
            .all(|(field, predicate)| predicate.matches(attribute(candidate, field).as_ref()))
    }
}

fn scalar(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn attribute(c: &Candidate, field: &str) -> Option<Value> {
    match field {
        "id" => Some(c.id.0.into()),
        "state" => Some(c.state.ordinal().into()),
        "level" => Some(u8::from(c.level).into()),
        "template_id" => c.template_id.map(|t| t.0.into()),
        "parent_id" => c.parent_id.map(|p| p.0.into()),
        "batch_no" => c.batch_no.as_ref().map(|b| b.as_str().into()),
        "sharpe" => c.sharpe.map(Value::from),
        "fitness" => c.fitness.map(Value::from),
        "operator_count" => c.operator_count.map(Value::from),
        "external_id" => c.external_id.as_ref().map(|e| e.as_str().into()),
        "expression_hash" => Some(c.expression_hash.as_str().into()),
        "expression" => Some(c.expression.as_str().into()),
        "pnl" => c.pnl.clone(),
        key => c.settings.get(key).cloned(),
    }
}

// ─── Trait ───────────────────────────────────────────────────────────

/// Result of inserting a draft.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(CandidateId),
    /// A candidate with the same identity hash already exists; nothing changed.
    Duplicate(CandidateId),
}

impl CreateOutcome {
    pub fn id(self) -> CandidateId {
        match self {
            CreateOutcome::Created(id) | CreateOutcome::Duplicate(id) => id,
        }
    }

    pub fn is_created(self) -> bool {
        matches!(self, CreateOutcome::Created(_))
    }
}

/// One page of search results plus the total match count at query time.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
}

pub trait CandidateRepository: Send + Sync {
    /// Insert a draft; an existing identity hash is absorbed as a no-op.
    fn create(&self, draft: CandidateDraft) -> Result<CreateOutcome, RepoError>;

    /// Insert several drafts in one commit, one outcome per draft in order.
    /// Hash collisions inside the batch are absorbed like any other.
    fn create_many(&self, drafts: Vec<CandidateDraft>) -> Result<Vec<CreateOutcome>, RepoError> {
        drafts.into_iter().map(|d| self.create(d)).collect()
    }

    fn get(&self, id: CandidateId) -> Result<Option<Candidate>, RepoError>;

    fn find_by_hash(&self, hash: &ExpressionHash) -> Result<Option<Candidate>, RepoError>;

    /// Apply a partial update. A state change must be admitted by the
    /// lifecycle (legal transition or advancing external verdict).
    fn update(&self, id: CandidateId, patch: &CandidatePatch) -> Result<Candidate, RepoError>;

    /// Apply several updates atomically: all succeed or none is applied.
    fn update_many(&self, updates: &[(CandidateId, CandidatePatch)]) -> Result<usize, RepoError>;

    /// All matches, in id order.
    fn search(&self, filter: &Filter) -> Result<Vec<Candidate>, RepoError>;

    fn search_one(&self, filter: &Filter) -> Result<Option<Candidate>, RepoError> {
        Ok(self.search_page(filter, 0, 1)?.items.into_iter().next())
    }

    /// Matches in id order, `offset`/`limit` windowed.
    fn search_page(&self, filter: &Filter, offset: usize, limit: usize) -> Result<Page<Candidate>, RepoError>;

    /// Atomically move the listed candidates that are currently in `from` to
    /// `to`. Returns the ids that moved; the rest are left untouched.
    fn claim(
        &self,
        ids: &[CandidateId],
        from: CandidateState,
        to: CandidateState,
    ) -> Result<Vec<CandidateId>, RepoError>;

    /// Apply in one commit every update whose state change the row still
    /// admits. Returns the ids whose update was dropped (unknown id or a
    /// state change the row's current state rejects).
    fn update_admitted(&self, updates: &[(CandidateId, CandidatePatch)]) -> Result<Vec<CandidateId>, RepoError>;

    /// Move every listed candidate to `state` atomically.
    fn bulk_update_state(&self, ids: &[CandidateId], state: CandidateState) -> Result<usize, RepoError> {
        let updates: Vec<(CandidateId, CandidatePatch)> =
            ids.iter().map(|id| (*id, CandidatePatch::state(state))).collect();
        self.update_many(&updates)
    }
}

// ─── In-memory store ─────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
struct Store {
    next_id: u64,
    rows: BTreeMap<CandidateId, Candidate>,
    by_hash: HashMap<ExpressionHash, CandidateId>,
}

/// On-disk form of a [`Store`].
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    next_id: u64,
    candidates: Vec<Candidate>,
}

impl Store {
    fn from_snapshot(snapshot: Snapshot) -> Self {
        let rows: BTreeMap<CandidateId, Candidate> =
            snapshot.candidates.into_iter().map(|c| (c.id, c)).collect();
        let by_hash = rows.values().map(|c| (c.expression_hash.clone(), c.id)).collect();
        let max_id = rows.keys().next_back().map_or(0, |id| id.0);
        Self {
            next_id: snapshot.next_id.max(max_id),
            rows,
            by_hash,
        }
    }

    fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            next_id: self.next_id,
            candidates: self.rows.values().cloned().collect(),
        }
    }

    fn create(&mut self, draft: CandidateDraft) -> CreateOutcome {
        if let Some(id) = self.by_hash.get(&draft.expression_hash) {
            return CreateOutcome::Duplicate(*id);
        }
        self.next_id += 1;
        let id = CandidateId(self.next_id);
        self.by_hash.insert(draft.expression_hash.clone(), id);
        self.rows.insert(id, Candidate::from_draft(id, draft, Utc::now()));
        CreateOutcome::Created(id)
    }

    /// Validate every update against the current rows without mutating.
    fn check(&self, updates: &[(CandidateId, CandidatePatch)]) -> Result<(), RepoError> {
        let mut pending: HashMap<CandidateId, CandidateState> = HashMap::new();
        for (id, patch) in updates {
            let row = self.rows.get(id).ok_or(RepoError::NotFound(*id))?;
            if let Some(to) = patch.state {
                let from = pending.get(id).copied().unwrap_or(row.state);
                from.admit(to)?;
                pending.insert(*id, to);
            }
        }
        Ok(())
    }

    fn apply(&mut self, updates: &[(CandidateId, CandidatePatch)]) -> Result<usize, RepoError> {
        self.check(updates)?;
        for (id, patch) in updates {
            if let Some(row) = self.rows.get_mut(id) {
                row.apply(patch);
            }
        }
        Ok(updates.len())
    }

    fn apply_admitted(&mut self, updates: &[(CandidateId, CandidatePatch)]) -> Vec<CandidateId> {
        let mut dropped = Vec::new();
        for (id, patch) in updates {
            let Some(row) = self.rows.get_mut(id) else {
                dropped.push(*id);
                continue;
            };
            if patch.state.is_some_and(|to| !row.state.admits(to)) {
                dropped.push(*id);
                continue;
            }
            row.apply(patch);
        }
        dropped
    }

    fn claim(
        &mut self,
        ids: &[CandidateId],
        from: CandidateState,
        to: CandidateState,
    ) -> Result<Vec<CandidateId>, RepoError> {
        from.admit(to)?;
        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = self.rows.get_mut(id).filter(|r| r.state == from) {
                row.apply(&CandidatePatch::state(to));
                claimed.push(*id);
            }
        }
        Ok(claimed)
    }

    fn known(&self, draft: &CandidateDraft) -> Option<CandidateId> {
        self.by_hash.get(&draft.expression_hash).copied()
    }

    fn matching<'a>(&'a self, filter: &'a Filter) -> impl Iterator<Item = &'a Candidate> + 'a {
        self.rows.values().filter(move |c| filter.matches(c))
    }
}

/// Process-local repository.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    store: Mutex<Store>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> Result<usize, RepoError> {
        Ok(self.lock()?.rows.len())
    }

    pub fn is_empty(&self) -> Result<bool, RepoError> {
        Ok(self.len()? == 0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Store>, RepoError> {
        self.store.lock().map_err(|_| RepoError::Poisoned)
    }

    fn from_store(store: Store) -> Self {
        Self {
            store: Mutex::new(store),
        }
    }
}

impl CandidateRepository for InMemoryRepository {
    fn create(&self, draft: CandidateDraft) -> Result<CreateOutcome, RepoError> {
        Ok(self.lock()?.create(draft))
    }

    fn get(&self, id: CandidateId) -> Result<Option<Candidate>, RepoError> {
        Ok(self.lock()?.rows.get(&id).cloned())
    }

    fn find_by_hash(&self, hash: &ExpressionHash) -> Result<Option<Candidate>, RepoError> {
        let store = self.lock()?;
        Ok(store.by_hash.get(hash).and_then(|id| store.rows.get(id)).cloned())
    }

    fn update(&self, id: CandidateId, patch: &CandidatePatch) -> Result<Candidate, RepoError> {
        let mut store = self.lock()?;
        store.apply(&[(id, patch.clone())])?;
        store.rows.get(&id).cloned().ok_or(RepoError::NotFound(id))
    }

    fn create_many(&self, drafts: Vec<CandidateDraft>) -> Result<Vec<CreateOutcome>, RepoError> {
        let mut store = self.lock()?;
        Ok(drafts.into_iter().map(|d| store.create(d)).collect())
    }

    fn update_many(&self, updates: &[(CandidateId, CandidatePatch)]) -> Result<usize, RepoError> {
        self.lock()?.apply(updates)
    }

    fn claim(
        &self,
        ids: &[CandidateId],
        from: CandidateState,
        to: CandidateState,
    ) -> Result<Vec<CandidateId>, RepoError> {
        self.lock()?.claim(ids, from, to)
    }

    fn update_admitted(&self, updates: &[(CandidateId, CandidatePatch)]) -> Result<Vec<CandidateId>, RepoError> {
        Ok(self.lock()?.apply_admitted(updates))
    }

    fn search(&self, filter: &Filter) -> Result<Vec<Candidate>, RepoError> {
        Ok(self.lock()?.matching(filter).cloned().collect())
    }

    fn search_page(&self, filter: &Filter, offset: usize, limit: usize) -> Result<Page<Candidate>, RepoError> {
        let store = self.lock()?;
        let total = store.matching(filter).count();
        let items = store.matching(filter).skip(offset).take(limit).cloned().collect();
        Ok(Page { items, total })
    }
}

// ─── File-backed store ───────────────────────────────────────────────

/// Modification time and size of a snapshot as last seen by this handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: SystemTime,
    len: u64,
}

fn stamp_of(path: &Path) -> Result<Option<FileStamp>, RepoError> {
    match fs::metadata(path) {
        Ok(meta) => Ok(Some(FileStamp {
            modified: meta.modified().map_err(|source| RepoError::Io {
                path: path.to_path_buf(),
                source,
            })?,
            len: meta.len(),
        })),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(RepoError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// JSON snapshot repository.
///
/// The whole store is rewritten after each commit; a failed write leaves the
/// previous snapshot in place and the in-memory state rolled back. Bulk
/// inserts go through [`CandidateRepository::create_many`] so a generation
/// run writes once per chunk rather than once per candidate.
#[derive(Debug)]
pub struct FileRepository {
    path: PathBuf,
    store: Mutex<Store>,
    // only touched inside `commit`, under the `store` lock
    stamp: Mutex<Option<FileStamp>>,
}

impl FileRepository {
    /// Open `path`, creating an empty store if the file does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RepoError> {
        let path = path.as_ref().to_path_buf();
        let stamp = stamp_of(&path)?;
        let store = if stamp.is_some() {
            let text = fs::read_to_string(&path).map_err(|source| RepoError::Io {
                path: path.clone(),
                source,
            })?;
            let snapshot: Snapshot =
                serde_json::from_str(&text).map_err(|e| RepoError::Corrupt(e.to_string()))?;
            Store::from_snapshot(snapshot)
        } else {
            Store::default()
        };
        Ok(Self {
            path,
            store: Mutex::new(store),
            stamp: Mutex::new(stamp),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Store>, RepoError> {
        self.store.lock().map_err(|_| RepoError::Poisoned)
    }

    fn persist(&self, store: &Store) -> Result<(), RepoError> {
        let io = |source| RepoError::Io {
            path: self.path.clone(),
            source,
        };
        let mut seen = self.stamp.lock().map_err(|_| RepoError::Poisoned)?;
        if stamp_of(&self.path)? != *seen {
            return Err(RepoError::Conflict(self.path.clone()));
        }
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(io)?;
        }
        let json = serde_json::to_vec(&store.to_snapshot()).map_err(|e| RepoError::Corrupt(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(io)?;
        fs::rename(&tmp, &self.path).map_err(io)?;
        *seen = stamp_of(&self.path)?;
        Ok(())
    }

    /// Run `f` on a scratch copy and swap it in only once it is on disk.
    fn commit<T>(&self, f: impl FnOnce(&mut Store) -> Result<T, RepoError>) -> Result<T, RepoError> {
        let mut store = self.lock()?;
        let mut next = store.clone();
        let out = f(&mut next)?;
        self.persist(&next)?;
        *store = next;
        Ok(out)
    }

    /// Detached in-memory copy, for read-heavy reporting.
    pub fn snapshot(&self) -> Result<InMemoryRepository, RepoError> {
        Ok(InMemoryRepository::from_store(self.lock()?.clone()))
    }
}

impl CandidateRepository for FileRepository {
    fn create(&self, draft: CandidateDraft) -> Result<CreateOutcome, RepoError> {
        {
            let store = self.lock()?;
            if let Some(id) = store.known(&draft) {
                return Ok(CreateOutcome::Duplicate(id));
            }
        }
        self.commit(|s| Ok(s.create(draft)))
    }

    fn create_many(&self, drafts: Vec<CandidateDraft>) -> Result<Vec<CreateOutcome>, RepoError> {
        {
            // all duplicates: nothing to write
            let store = self.lock()?;
            let known: Option<Vec<CreateOutcome>> =
                drafts.iter().map(|d| store.known(d).map(CreateOutcome::Duplicate)).collect();
            if let Some(outcomes) = known {
                return Ok(outcomes);
            }
        }
        self.commit(|s| Ok(drafts.into_iter().map(|d| s.create(d)).collect()))
    }

    fn get(&self, id: CandidateId) -> Result<Option<Candidate>, RepoError> {
        Ok(self.lock()?.rows.get(&id).cloned())
    }

    fn find_by_hash(&self, hash: &ExpressionHash) -> Result<Option<Candidate>, RepoError> {
        let store = self.lock()?;
        Ok(store.by_hash.get(hash).and_then(|id| store.rows.get(id)).cloned())
    }

    fn update(&self, id: CandidateId, patch: &CandidatePatch) -> Result<Candidate, RepoError> {
        self.commit(|s| {
            s.apply(&[(id, patch.clone())])?;
            s.rows.get(&id).cloned().ok_or(RepoError::NotFound(id))
        })
    }

    fn update_many(&self, updates: &[(CandidateId, CandidatePatch)]) -> Result<usize, RepoError> {
        self.commit(|s| s.apply(updates))
    }

    fn claim(
        &self,
        ids: &[CandidateId],
        from: CandidateState,
        to: CandidateState,
    ) -> Result<Vec<CandidateId>, RepoError> {
        self.commit(|s| s.claim(ids, from, to))
    }

    fn update_admitted(&self, updates: &[(CandidateId, CandidatePatch)]) -> Result<Vec<CandidateId>, RepoError> {
        self.commit(|s| Ok(s.apply_admitted(updates)))
    }

    fn search(&self, filter: &Filter) -> Result<Vec<Candidate>, RepoError> {
        Ok(self.lock()?.matching(filter).cloned().collect())
    }

    fn search_page(&self, filter: &Filter, offset: usize, limit: usize) -> Result<Page<Candidate>, RepoError> {
        let store = self.lock()?;
        let total = store.matching(filter).count();
        let items = store.matching(filter).skip(offset).take(limit).cloned().collect();
        Ok(Page { items, total })
    }
}
