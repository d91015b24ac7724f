//! Cycle progress: the per-cycle state and the event stream observers follow.
//!
//! Every cycle gets a fresh [`CycleState`]. Translation tasks update it
//! concurrently through atomics; readers take a [`CycleSnapshot`]. Events go
//! out through a broadcast channel, so a slow or absent subscriber never
//! holds up a cycle.

use crate::diff::DiffResult;
use crate::i18n::{LanguageDescriptor, LanguageSet};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use tokio::sync::broadcast;

/// Cycle phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Phase {
    Idle,
    Checks,
    JsonBackendDataLoading,
    CheckLanguageNames,
    OldDictionaryLoading,
    GenerateTranslationRequest,
    Translate,
    SaveTranslation,
    MdFoldersChecks,
    TranslateMd,
    SaveMd,
}

impl Phase {
    pub const ALL: [Phase; 11] = [
        Phase::Idle,
        Phase::Checks,
        Phase::JsonBackendDataLoading,
        Phase::CheckLanguageNames,
        Phase::OldDictionaryLoading,
        Phase::GenerateTranslationRequest,
        Phase::Translate,
        Phase::SaveTranslation,
        Phase::MdFoldersChecks,
        Phase::TranslateMd,
        Phase::SaveMd,
    ];

    /// The phase that follows this one; `SaveMd` wraps to `Idle`.
    pub fn next(self) -> Phase {
        let index = self as usize;
        Phase::ALL[(index + 1) % Phase::ALL.len()]
    }

    fn from_index(index: u8) -> Phase {
        Phase::ALL
            .get(index as usize)
            .copied()
            .unwrap_or(Phase::Idle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Json,
    Md,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

/// Live per-language progress row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LanguageRow {
    pub language: String,
    pub kind: ContentKind,
    pub existing: usize,
    pub to_add: usize,
    pub to_remove: usize,
    pub to_update: usize,
    pub translated: usize,
    pub failed: usize,
    pub status: RowStatus,
}

impl LanguageRow {
    pub fn from_diff(diff: &DiffResult, kind: ContentKind) -> Self {
        Self {
            language: diff.language.clone(),
            kind,
            existing: diff.existing,
            to_add: diff.to_add.len(),
            to_remove: diff.to_remove.len(),
            to_update: diff.to_update.len(),
            translated: 0,
            failed: 0,
            status: if diff.is_empty() {
                RowStatus::Done
            } else {
                RowStatus::Pending
            },
        }
    }

    /// Units still waiting for a translation result.
    pub fn remaining(&self) -> usize {
        (self.to_add + self.to_update).saturating_sub(self.translated + self.failed)
    }
}

/// Totals reported when a cycle completes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    pub languages_total: usize,
    pub languages_succeeded: usize,
    pub languages_failed: usize,
    pub units_translated: usize,
    pub units_untranslated: usize,
    pub units_failed: usize,
    pub documents_written: usize,
    pub documents_removed: usize,
    pub duration_ms: i64,
}

/// Notifications sent to observers, serialized with an `event` tag.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum ProgressEvent {
    NewCycle,
    ReceiveLanguages {
        languages: Vec<LanguageDescriptor>,
    },
    ReceiveTranslationSettings {
        default_language: String,
        ignored_for_json: Vec<String>,
        ignored_for_md: Vec<String>,
    },
    LanguageNameTranslationChanged {
        total_count: usize,
        translated_count: usize,
    },
    LanguageNameTranslationError {
        error_count: usize,
    },
    LanguageNamesTranslationFinished,
    LanguageProgress(LanguageRow),
    PhaseChanged {
        phase: Phase,
    },
    CycleFinished {
        summary: CycleSummary,
    },
    CycleFailed {
        phase: Phase,
        reason: String,
    },
}

/// Two counters sharing one atomic word, so `first + second <= limit` can
/// be enforced by a single compare-and-swap.
struct BoundedPair {
    packed: AtomicU64,
}

impl BoundedPair {
    fn new() -> Self {
        Self {
            packed: AtomicU64::new(0),
        }
    }

    fn unpack(packed: u64) -> (usize, usize) {
        ((packed >> 32) as usize, (packed & 0xFFFF_FFFF) as usize)
    }

    fn get(&self) -> (usize, usize) {
        Self::unpack(self.packed.load(Ordering::SeqCst))
    }

    /// Increment one side unless the pair already reached `limit`.
    fn increment(&self, first: bool, limit: usize) -> Option<(usize, usize)> {
        self.packed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |packed| {
                let (a, b) = Self::unpack(packed);
                if a + b >= limit {
                    return None;
                }
                Some(if first { packed + (1 << 32) } else { packed + 1 })
            })
            .ok()
            .map(|previous| {
                let (a, b) = Self::unpack(previous);
                if first {
                    (a + 1, b)
                } else {
                    (a, b + 1)
                }
            })
    }
}

/// State of one cycle. Replaced wholesale when the next cycle starts.
pub struct CycleState {
    cycle: u64,
    started_at: DateTime<Utc>,
    phase: AtomicU8,
    languages: OnceLock<LanguageSet>,
    total_languages: AtomicUsize,
    outcomes: BoundedPair,
    names_total: AtomicUsize,
    names: BoundedPair,
    units_total: AtomicUsize,
    units_translated: AtomicUsize,
    units_untranslated: AtomicUsize,
    units_failed: AtomicUsize,
    documents_written: AtomicUsize,
    documents_removed: AtomicUsize,
    rows: Mutex<BTreeMap<(String, ContentKind), LanguageRow>>,
}

impl CycleState {
    pub fn new(cycle: u64) -> Self {
        Self {
            cycle,
            started_at: Utc::now(),
            phase: AtomicU8::new(Phase::Idle as u8),
            languages: OnceLock::new(),
            total_languages: AtomicUsize::new(0),
            outcomes: BoundedPair::new(),
            names_total: AtomicUsize::new(0),
            names: BoundedPair::new(),
            units_total: AtomicUsize::new(0),
            units_translated: AtomicUsize::new(0),
            units_untranslated: AtomicUsize::new(0),
            units_failed: AtomicUsize::new(0),
            documents_written: AtomicUsize::new(0),
            documents_removed: AtomicUsize::new(0),
            rows: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn phase(&self) -> Phase {
        Phase::from_index(self.phase.load(Ordering::SeqCst))
    }

    fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    /// Freeze the language set for this cycle. Only the first call wins.
    pub fn freeze_languages(&self, languages: LanguageSet) -> bool {
        self.languages.set(languages).is_ok()
    }

    pub fn languages(&self) -> Option<&LanguageSet> {
        self.languages.get()
    }

    pub fn set_total_languages(&self, total: usize) {
        self.total_languages.store(total, Ordering::SeqCst);
    }

    pub fn total_languages(&self) -> usize {
        self.total_languages.load(Ordering::SeqCst)
    }

    /// Count a language as synchronized. Returns false once every language
    /// already has an outcome.
    pub fn record_language_success(&self) -> bool {
        self.outcomes
            .increment(true, self.total_languages())
            .is_some()
    }

    /// Count a language as failed. Returns false once every language
    /// already has an outcome.
    pub fn record_language_error(&self) -> bool {
        self.outcomes
            .increment(false, self.total_languages())
            .is_some()
    }

    pub fn success_count(&self) -> usize {
        self.outcomes.get().0
    }

    pub fn error_count(&self) -> usize {
        self.outcomes.get().1
    }

    pub fn set_names_total(&self, total: usize) {
        self.names_total.store(total, Ordering::SeqCst);
    }

    pub fn names_total(&self) -> usize {
        self.names_total.load(Ordering::SeqCst)
    }

    /// Returns the new translated count.
    pub fn record_name_translated(&self) -> usize {
        match self.names.increment(true, self.names_total()) {
            Some((translated, _)) => translated,
            None => self.names.get().0,
        }
    }

    /// Returns the new error count.
    pub fn record_name_error(&self) -> usize {
        match self.names.increment(false, self.names_total()) {
            Some((_, errors)) => errors,
            None => self.names.get().1,
        }
    }

    /// (translated, errors) for the language-name sub-phase.
    pub fn name_counts(&self) -> (usize, usize) {
        self.names.get()
    }

    pub fn add_units(&self, count: usize) {
        self.units_total.fetch_add(count, Ordering::SeqCst);
    }

    pub fn record_unit_translated(&self) {
        self.units_translated.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_unit_untranslated(&self) {
        self.units_untranslated.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_unit_failed(&self) {
        self.units_failed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_documents(&self, written: usize, removed: usize) {
        self.documents_written.fetch_add(written, Ordering::SeqCst);
        self.documents_removed.fetch_add(removed, Ordering::SeqCst);
    }

    fn upsert_row(&self, row: LanguageRow) {
        self.rows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert((row.language.clone(), row.kind), row);
    }

    pub fn row(&self, language: &str, kind: ContentKind) -> Option<LanguageRow> {
        self.rows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&(language.to_string(), kind))
            .cloned()
    }

    pub fn summary(&self) -> CycleSummary {
        let (succeeded, failed) = self.outcomes.get();
        CycleSummary {
            languages_total: self.total_languages(),
            languages_succeeded: succeeded,
            languages_failed: failed,
            units_translated: self.units_translated.load(Ordering::SeqCst),
            units_untranslated: self.units_untranslated.load(Ordering::SeqCst),
            units_failed: self.units_failed.load(Ordering::SeqCst),
            documents_written: self.documents_written.load(Ordering::SeqCst),
            documents_removed: self.documents_removed.load(Ordering::SeqCst),
            duration_ms: (Utc::now() - self.started_at).num_milliseconds(),
        }
    }

    pub fn snapshot(&self) -> CycleSnapshot {
        let (names_translated, names_errors) = self.names.get();
        CycleSnapshot {
            cycle: self.cycle,
            phase: self.phase(),
            started_at: self.started_at,
            languages: self
                .languages
                .get()
                .map(|set| set.list_all().to_vec())
                .unwrap_or_default(),
            names_total: self.names_total(),
            names_translated,
            names_errors,
            units_total: self.units_total.load(Ordering::SeqCst),
            summary: self.summary(),
            rows: self
                .rows
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .values()
                .cloned()
                .collect(),
        }
    }
}

/// Point-in-time copy of a cycle's counters, for late subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct CycleSnapshot {
    pub cycle: u64,
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub languages: Vec<LanguageDescriptor>,
    pub names_total: usize,
    pub names_translated: usize,
    pub names_errors: usize,
    pub units_total: usize,
    pub summary: CycleSummary,
    pub rows: Vec<LanguageRow>,
}

/// Fans cycle events out to any number of subscribers.
pub struct ProgressPublisher {
    sender: broadcast::Sender<ProgressEvent>,
    state: RwLock<Arc<CycleState>>,
    cycles: AtomicU64,
}

impl ProgressPublisher {
    /// `capacity` events are buffered per subscriber; a subscriber that
    /// falls further behind loses the oldest ones.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            state: RwLock::new(Arc::new(CycleState::new(0))),
            cycles: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Send to current subscribers. Never blocks; no subscribers is fine.
    pub fn publish(&self, event: ProgressEvent) {
        let _ = self.sender.send(event);
    }

    /// Install a fresh state and announce the new cycle.
    pub fn begin_cycle(&self) -> Arc<CycleState> {
        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        let state = Arc::new(CycleState::new(cycle));
        *self
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = state.clone();
        self.publish(ProgressEvent::NewCycle);
        state
    }

    pub fn state(&self) -> Arc<CycleState> {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn snapshot(&self) -> CycleSnapshot {
        self.state().snapshot()
    }

    pub fn enter_phase(&self, state: &CycleState, phase: Phase) {
        state.set_phase(phase);
        self.publish(ProgressEvent::PhaseChanged { phase });
    }

    /// Store a row on the cycle state and broadcast it.
    pub fn update_row(&self, state: &CycleState, row: LanguageRow) {
        state.upsert_row(row.clone());
        self.publish(ProgressEvent::LanguageProgress(row));
    }
}

impl Default for ProgressPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}
