//! The sync cycle.
//!
//! One cycle walks every [`Phase`] in order:
//!
//! ```text
//! Idle → Checks → JsonBackendDataLoading → CheckLanguageNames →
//! OldDictionaryLoading → GenerateTranslationRequest → Translate →
//! SaveTranslation → MdFoldersChecks → TranslateMd → SaveMd → Idle
//! ```
//!
//! Anything that goes wrong outside a single translation unit aborts the
//! cycle before the next save phase; a failed unit is counted and the cycle
//! carries on. Cancellation is honored at phase boundaries and before every
//! translation unit, and a cancelled cycle writes nothing further.

use crate::config::{SettingsError, SettingsSource, TranslationSettings};
use crate::diff::{compute_flat_diff, DiffResult};
use crate::documents::{self, compute_tree_diff, DocumentManifest, DocumentNode};
use crate::i18n::{primary_subtag, LanguageDescriptor, LanguageSet, LanguageSetError};
use crate::progress::{
    ContentKind, CycleState, CycleSummary, LanguageRow, Phase, ProgressEvent, ProgressPublisher,
    RowStatus,
};
use crate::store::{
    fingerprint, BackendChain, FlatDictionary, SaveOutcome, StoreError, StoredDictionary,
};
use crate::translation::{TranslatedText, TranslationClient, TranslationStatus};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Minimum detector confidence (percent) for keeping a hand-written target
/// document instead of translating over it.
const ADOPT_CONFIDENCE: f64 = 80.0;

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("failed to load settings: {0}")]
    SettingsUnavailable(String),

    #[error("invalid settings: {0}")]
    InvalidSettings(#[from] SettingsError),

    #[error("invalid language set: {0}")]
    InvalidLanguages(#[from] LanguageSetError),

    #[error("canonical dictionary '{language}' unavailable: {source}")]
    CanonicalUnavailable {
        language: String,
        #[source]
        source: StoreError,
    },

    #[error("no dictionary store can be read from")]
    NoReadableStore,

    #[error("no dictionary store can be written to")]
    NoWritableStore,

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("cycle cancelled")]
    Cancelled,
}

/// Why a cycle was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Timer,
    Manual,
}

/// Sending side of the trigger queue.
///
/// The queue holds one pending trigger; requests made while one is already
/// pending are folded into it.
#[derive(Clone)]
pub struct TriggerHandle {
    sender: mpsc::Sender<Trigger>,
}

impl TriggerHandle {
    /// Returns false if the request was folded into an already pending one
    /// or the cycle loop is gone.
    pub fn trigger(&self, trigger: Trigger) -> bool {
        match self.sender.try_send(trigger) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Cycle already pending, {:?} trigger coalesced", trigger);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Cycle loop has stopped, {:?} trigger dropped", trigger);
                false
            }
        }
    }
}

pub fn trigger_channel() -> (TriggerHandle, mpsc::Receiver<Trigger>) {
    let (sender, receiver) = mpsc::channel(1);
    (TriggerHandle { sender }, receiver)
}

/// Target dictionary with the diff against canonical.
struct DictionaryPlan {
    language: LanguageDescriptor,
    existing: StoredDictionary,
    diff: DiffResult,
}

/// Target dictionary after the translate phase, ready to save.
struct ReconciledDictionary {
    language: String,
    dictionary: StoredDictionary,
    complete: bool,
    row: LanguageRow,
}

/// One target folder under one document root.
struct DocumentPlan {
    folder: PathBuf,
    canonical: Arc<Vec<DocumentNode>>,
    manifest: DocumentManifest,
    present: BTreeSet<String>,
    diff: DiffResult,
}

/// Result of translating one target folder, ready to save.
struct TranslatedFolder {
    folder: PathBuf,
    /// Manifest as loaded before this cycle
    previous: DocumentManifest,
    writes: Vec<(String, String)>,
    removals: BTreeSet<String>,
    manifest: DocumentManifest,
}

struct TranslatedDocuments {
    folders: Vec<TranslatedFolder>,
    complete: bool,
    row: LanguageRow,
}

enum DocumentOutcome {
    Adopted,
    Translated(TranslatedText),
}

/// Drives sync cycles: settings, stores, translation and progress.
pub struct Orchestrator {
    settings: Arc<dyn SettingsSource>,
    chain: BackendChain,
    client: Arc<TranslationClient>,
    publisher: Arc<ProgressPublisher>,
    workers: usize,
    interval: watch::Sender<u64>,
    running: Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        settings: Arc<dyn SettingsSource>,
        chain: BackendChain,
        client: Arc<TranslationClient>,
        publisher: Arc<ProgressPublisher>,
        workers: usize,
    ) -> Self {
        let (interval, _) = watch::channel(TranslationSettings::default().minutes_between_cycles);
        Self {
            settings,
            chain,
            client,
            publisher,
            workers: workers.max(1),
            interval,
            running: Mutex::new(()),
        }
    }

    pub fn publisher(&self) -> &Arc<ProgressPublisher> {
        &self.publisher
    }

    /// `MinutesBetweenCycles` as of the latest settings load.
    pub fn interval_updates(&self) -> watch::Receiver<u64> {
        self.interval.subscribe()
    }

    /// Serve triggers until cancelled or every trigger handle is dropped.
    pub async fn run(&self, mut triggers: mpsc::Receiver<Trigger>, cancel: CancellationToken) {
        info!("Cycle loop started");
        loop {
            let trigger = tokio::select! {
                _ = cancel.cancelled() => break,
                trigger = triggers.recv() => match trigger {
                    Some(trigger) => trigger,
                    None => break,
                },
            };

            info!("⏰ {:?} trigger received", trigger);
            // Failures are logged and published inside run_cycle
            let _ = self.run_cycle(&cancel).await;
        }
        info!("Cycle loop stopped");
    }

    /// Run one complete cycle. Concurrent calls queue behind each other.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleSummary, CycleError> {
        let _running = self.running.lock().await;

        let state = self.publisher.begin_cycle();
        self.client.begin_cycle().await;
        info!("Starting sync cycle #{}", state.cycle());

        match self.run_phases(&state, cancel).await {
            Ok(()) => {
                self.publisher.enter_phase(&state, Phase::Idle);
                let summary = state.summary();
                info!(
                    "✓ Cycle #{} finished: {}/{} languages synced, {} units translated, {} failed, {} untranslated",
                    state.cycle(),
                    summary.languages_succeeded,
                    summary.languages_total,
                    summary.units_translated,
                    summary.units_failed,
                    summary.units_untranslated
                );
                self.publisher.publish(ProgressEvent::CycleFinished {
                    summary: summary.clone(),
                });
                Ok(summary)
            }
            Err(e) => {
                let phase = state.phase();
                error!("Cycle #{} aborted during {:?}: {}", state.cycle(), phase, e);
                self.publisher.publish(ProgressEvent::CycleFailed {
                    phase,
                    reason: e.to_string(),
                });
                self.publisher.enter_phase(&state, Phase::Idle);
                Err(e)
            }
        }
    }

    fn checkpoint(cancel: &CancellationToken) -> Result<(), CycleError> {
        if cancel.is_cancelled() {
            Err(CycleError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn run_phases(
        &self,
        state: &CycleState,
        cancel: &CancellationToken,
    ) -> Result<(), CycleError> {
        self.publisher.enter_phase(state, Phase::Checks);
        let settings = self.checks().await?;

        Self::checkpoint(cancel)?;
        self.publisher
            .enter_phase(state, Phase::JsonBackendDataLoading);
        let (languages, canonical) = self.load_backend_data(&settings).await?;

        Self::checkpoint(cancel)?;
        self.publisher.enter_phase(state, Phase::CheckLanguageNames);
        let languages = self
            .check_language_names(state, languages, cancel)
            .await?;
        state.freeze_languages(languages.clone());
        let source = languages.default_language().code.clone();

        Self::checkpoint(cancel)?;
        self.publisher
            .enter_phase(state, Phase::OldDictionaryLoading);
        let targets = languages.targets(&settings.ignored_for_json);
        state.set_total_languages(targets.len());
        let existing = self.load_existing(targets).await;

        Self::checkpoint(cancel)?;
        self.publisher
            .enter_phase(state, Phase::GenerateTranslationRequest);
        let plans = self.plan_dictionaries(state, &canonical, existing);

        Self::checkpoint(cancel)?;
        self.publisher.enter_phase(state, Phase::Translate);
        let semaphore = Semaphore::new(self.workers);
        let reconciled = futures::future::join_all(plans.into_iter().map(|plan| {
            self.reconcile_dictionary(state, plan, &canonical, &source, &semaphore, cancel)
        }))
        .await;

        Self::checkpoint(cancel)?;
        self.publisher.enter_phase(state, Phase::SaveTranslation);
        self.save_dictionaries(state, reconciled).await;
        if settings.prune_orphaned_dictionaries {
            self.prune_orphans(&languages).await;
        }

        Self::checkpoint(cancel)?;
        self.publisher.enter_phase(state, Phase::MdFoldersChecks);
        let (document_plans, rows) = self.plan_documents(state, &settings, &languages).await?;

        Self::checkpoint(cancel)?;
        self.publisher.enter_phase(state, Phase::TranslateMd);
        let source = source.as_str();
        let semaphore = &semaphore;
        let translated = futures::future::join_all(document_plans.into_iter().map(
            |(language, plans)| {
                let row = rows.get(&language).cloned().unwrap_or_else(|| {
                    LanguageRow::from_diff(&DiffResult::default(), ContentKind::Md)
                });
                async move {
                    self.translate_documents(state, &language, plans, row, source, semaphore, cancel)
                        .await
                }
            },
        ))
        .await;

        Self::checkpoint(cancel)?;
        self.publisher.enter_phase(state, Phase::SaveMd);
        self.save_documents(state, translated).await;

        Ok(())
    }

    /// Load and validate settings; make sure the chain can be read and written.
    async fn checks(&self) -> Result<TranslationSettings, CycleError> {
        let settings = self
            .settings
            .load_settings()
            .await
            .map_err(|e| CycleError::SettingsUnavailable(format!("{:#}", e)))?;

        if settings.minutes_between_cycles > 0 {
            let minutes = settings.minutes_between_cycles;
            self.interval.send_if_modified(|current| {
                if *current == minutes {
                    return false;
                }
                *current = minutes;
                true
            });
        }

        settings.validate()?;

        if !self.chain.has_readable() {
            return Err(CycleError::NoReadableStore);
        }
        if !self.chain.has_writable() {
            return Err(CycleError::NoWritableStore);
        }

        debug!("Settings valid: {:?}", settings);
        Ok(settings)
    }

    async fn load_backend_data(
        &self,
        settings: &TranslationSettings,
    ) -> Result<(LanguageSet, FlatDictionary), CycleError> {
        let descriptors = self
            .settings
            .load_languages()
            .await
            .map_err(|e| CycleError::SettingsUnavailable(format!("{:#}", e)))?;
        let languages = LanguageSet::new(descriptors, settings.default_language.trim())?;
        let default = languages.default_language().code.clone();

        let canonical = self
            .chain
            .load(&default)
            .await
            .map_err(|source| CycleError::CanonicalUnavailable {
                language: default.clone(),
                source,
            })?
            .entries;

        info!(
            "Loaded {} languages and {} canonical phrases ('{}')",
            languages.len(),
            canonical.len(),
            default
        );

        self.publisher.publish(ProgressEvent::ReceiveLanguages {
            languages: languages.list_all().to_vec(),
        });
        self.publisher
            .publish(ProgressEvent::ReceiveTranslationSettings {
                default_language: default,
                ignored_for_json: settings.ignored_for_json.clone(),
                ignored_for_md: settings.ignored_for_md.clone(),
            });

        Ok((languages, canonical))
    }

    /// Give every language a display name in the default language.
    async fn check_language_names(
        &self,
        state: &CycleState,
        languages: LanguageSet,
        cancel: &CancellationToken,
    ) -> Result<LanguageSet, CycleError> {
        let default = languages.default_language().code.clone();
        let total = languages.len();
        state.set_names_total(total);
        self.publisher
            .publish(ProgressEvent::LanguageNameTranslationChanged {
                total_count: total,
                translated_count: 0,
            });

        let semaphore = Semaphore::new(self.workers);
        let mut results = stream::iter(languages.list_all().iter().cloned())
            .map(|descriptor| {
                let default = default.as_str();
                let semaphore = &semaphore;
                async move {
                    if !descriptor.needs_display_name() {
                        return (descriptor, None);
                    }

                    let source_text = if descriptor.native_name.trim().is_empty() {
                        descriptor.code.clone()
                    } else {
                        descriptor.native_name.clone()
                    };
                    if cancel.is_cancelled() {
                        return (descriptor, Some((source_text, false)));
                    }

                    let Ok(_permit) = semaphore.acquire().await else {
                        return (descriptor, Some((source_text, false)));
                    };
                    let result = self
                        .client
                        .translate(&source_text, &descriptor.code, default)
                        .await;
                    let translated = result.is_translated();
                    let name = if translated { result.text } else { source_text };
                    (descriptor, Some((name, translated)))
                }
            })
            .buffered(self.workers);

        let mut named = Vec::with_capacity(total);
        let mut changed = false;
        while let Some((mut descriptor, outcome)) = results.next().await {
            match outcome {
                None => {
                    let translated_count = state.record_name_translated();
                    self.publisher
                        .publish(ProgressEvent::LanguageNameTranslationChanged {
                            total_count: total,
                            translated_count,
                        });
                }
                Some((name, true)) => {
                    descriptor.name = name;
                    changed = true;
                    let translated_count = state.record_name_translated();
                    self.publisher
                        .publish(ProgressEvent::LanguageNameTranslationChanged {
                            total_count: total,
                            translated_count,
                        });
                }
                Some((fallback, false)) => {
                    warn!(
                        "Could not translate the name of '{}', using '{}'",
                        descriptor.code, fallback
                    );
                    descriptor.name = fallback;
                    changed = true;
                    let error_count = state.record_name_error();
                    self.publisher
                        .publish(ProgressEvent::LanguageNameTranslationError { error_count });
                }
            }
            named.push(descriptor);
        }
        drop(results);

        Self::checkpoint(cancel)?;
        self.publisher
            .publish(ProgressEvent::LanguageNamesTranslationFinished);

        let languages = LanguageSet::new(named, &default)?;
        if changed {
            self.publisher.publish(ProgressEvent::ReceiveLanguages {
                languages: languages.list_all().to_vec(),
            });
        }
        Ok(languages)
    }

    /// Stored dictionaries per target. Absent or unreadable ones start empty.
    async fn load_existing(
        &self,
        targets: Vec<LanguageDescriptor>,
    ) -> Vec<(LanguageDescriptor, StoredDictionary)> {
        let loads = targets.into_iter().map(|language| async move {
            let existing = match self.chain.load(&language.code).await {
                Ok(dictionary) => dictionary,
                Err(StoreError::NotFound(_)) => {
                    info!("No dictionary for '{}' yet, first sync", language.code);
                    StoredDictionary::new()
                }
                Err(e) => {
                    warn!(
                        "Dictionary for '{}' unreadable, treating as first sync: {}",
                        language.code, e
                    );
                    StoredDictionary::new()
                }
            };
            (language, existing)
        });
        futures::future::join_all(loads).await
    }

    fn plan_dictionaries(
        &self,
        state: &CycleState,
        canonical: &FlatDictionary,
        existing: Vec<(LanguageDescriptor, StoredDictionary)>,
    ) -> Vec<DictionaryPlan> {
        let mut plans = Vec::new();
        for (language, existing) in existing {
            let diff = compute_flat_diff(&language.code, canonical, &existing);
            self.publisher
                .update_row(state, LanguageRow::from_diff(&diff, ContentKind::Json));

            if diff.is_empty() {
                debug!("'{}' is up to date", language.code);
                state.record_language_success();
                continue;
            }

            info!(
                "'{}': {} to add, {} to update, {} to remove",
                language.code,
                diff.to_add.len(),
                diff.to_update.len(),
                diff.to_remove.len()
            );
            state.add_units(diff.translation_count());
            plans.push(DictionaryPlan {
                language,
                existing,
                diff,
            });
        }
        plans
    }

    /// Translate one language's affected keys into a working copy of its
    /// dictionary. The working copy is owned by this future alone.
    async fn reconcile_dictionary(
        &self,
        state: &CycleState,
        plan: DictionaryPlan,
        canonical: &FlatDictionary,
        source: &str,
        semaphore: &Semaphore,
        cancel: &CancellationToken,
    ) -> ReconciledDictionary {
        let DictionaryPlan {
            language,
            existing: mut dictionary,
            diff,
        } = plan;
        let target = language.code.as_str();

        let mut row = LanguageRow::from_diff(&diff, ContentKind::Json);
        for key in &diff.to_remove {
            dictionary.remove(key);
        }

        let keys: Vec<String> = diff.keys_to_translate().cloned().collect();
        if !keys.is_empty() {
            row.status = RowStatus::InProgress;
            self.publisher.update_row(state, row.clone());
        }

        let mut complete = true;
        let mut results = stream::iter(keys)
            .map(|key| async move {
                if cancel.is_cancelled() {
                    return (key, None);
                }
                let Ok(_permit) = semaphore.acquire().await else {
                    return (key, None);
                };
                let value = canonical.get(&key).map(String::as_str).unwrap_or_default();
                let result = self.client.translate(value, source, target).await;
                (key, Some(result))
            })
            .buffer_unordered(self.workers);

        while let Some((key, result)) = results.next().await {
            let Some(result) = result else {
                complete = false;
                continue;
            };

            match result.status {
                TranslationStatus::Translated => {
                    let source_fingerprint = canonical
                        .get(&key)
                        .map(|value| fingerprint(value))
                        .unwrap_or_default();
                    dictionary.insert_translated(&key, result.text, source_fingerprint);
                    row.translated += 1;
                    state.record_unit_translated();
                }
                TranslationStatus::Untranslated => {
                    // No fingerprint either way, so the key is retried next cycle.
                    // A stored translation beats the source text.
                    if dictionary.entries.contains_key(&key) {
                        dictionary.mark_unverified(&key);
                    } else {
                        dictionary.insert_unverified(&key, result.text);
                    }
                    row.failed += 1;
                    complete = false;
                    state.record_unit_untranslated();
                }
                TranslationStatus::Failed => {
                    row.failed += 1;
                    complete = false;
                    state.record_unit_failed();
                }
            }
            self.publisher.update_row(state, row.clone());
        }

        ReconciledDictionary {
            language: language.code.clone(),
            dictionary,
            complete,
            row,
        }
    }

    async fn save_dictionaries(&self, state: &CycleState, reconciled: Vec<ReconciledDictionary>) {
        for ReconciledDictionary {
            language,
            dictionary,
            complete,
            mut row,
        } in reconciled
        {
            let saved = match self.chain.save(&language, &dictionary).await {
                Ok(SaveOutcome::Saved(store)) => {
                    debug!("Saved '{}' to {}", language, store);
                    true
                }
                Ok(SaveOutcome::Skipped) => {
                    warn!("No writable store for '{}', save skipped", language);
                    false
                }
                Err(e) => {
                    warn!("Failed to save dictionary '{}': {}", language, e);
                    false
                }
            };

            if saved && complete {
                state.record_language_success();
                row.status = RowStatus::Done;
            } else {
                state.record_language_error();
                row.status = RowStatus::Failed;
            }
            self.publisher.update_row(state, row);
        }
    }

    /// Delete stored dictionaries of languages that are no longer configured.
    async fn prune_orphans(&self, languages: &LanguageSet) {
        let stored = match self.chain.list_available_languages().await {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Could not list stored dictionaries for pruning: {}", e);
                return;
            }
        };

        for code in stored.iter().filter(|code| !languages.contains(code)) {
            match self.chain.delete(code).await {
                Ok(0) => {}
                Ok(count) => info!("Pruned orphaned dictionary '{}' from {} store(s)", code, count),
                Err(e) => warn!("Failed to prune dictionary '{}': {}", code, e),
            }
        }
    }

    /// Diff every target folder of every document root, grouped by language.
    async fn plan_documents(
        &self,
        state: &CycleState,
        settings: &TranslationSettings,
        languages: &LanguageSet,
    ) -> Result<(BTreeMap<String, Vec<DocumentPlan>>, BTreeMap<String, LanguageRow>), CycleError>
    {
        let default = &languages.default_language().code;
        let targets = languages.targets(&settings.ignored_for_md);
        let mut plans: BTreeMap<String, Vec<DocumentPlan>> = BTreeMap::new();
        let mut rows: BTreeMap<String, LanguageRow> = BTreeMap::new();

        for root in &settings.md_folders {
            let canonical_folder = root.join(default);
            if !tokio::fs::try_exists(&canonical_folder).await.unwrap_or(false) {
                warn!(
                    "Document root {} has no '{}' folder, skipping",
                    root.display(),
                    default
                );
                continue;
            }

            let canonical = Arc::new(documents::scan_documents(&canonical_folder).await?);
            debug!(
                "{} canonical documents under {}",
                canonical.len(),
                canonical_folder.display()
            );

            for language in &targets {
                let folder = root.join(&language.code);
                let manifest = DocumentManifest::load(&folder).await?;
                let present = documents::document_paths(&folder).await?;
                let diff = compute_tree_diff(&language.code, &canonical, &manifest, &present);

                let part = LanguageRow::from_diff(&diff, ContentKind::Md);
                rows.entry(language.code.clone())
                    .and_modify(|row| merge_rows(row, &part))
                    .or_insert(part);

                if diff.is_empty() {
                    continue;
                }
                state.add_units(diff.translation_count());
                plans
                    .entry(language.code.clone())
                    .or_default()
                    .push(DocumentPlan {
                        folder,
                        canonical: canonical.clone(),
                        manifest,
                        present,
                        diff,
                    });
            }
        }

        for row in rows.values() {
            self.publisher.update_row(state, row.clone());
        }
        Ok((plans, rows))
    }

    /// Whether an unmanaged target document is already written in `target`.
    async fn adopt_existing(&self, folder: &Path, node: &DocumentNode, target: &str) -> bool {
        let path = documents::document_path(folder, &node.path);
        let Ok(text) = tokio::fs::read_to_string(&path).await else {
            return false;
        };

        match self.client.detect_language(&text).await {
            Ok(detection) => {
                let adopt = primary_subtag(&detection.language)
                    .eq_ignore_ascii_case(primary_subtag(target))
                    && detection.confidence >= ADOPT_CONFIDENCE;
                if adopt {
                    info!("Keeping hand-written {} ({})", path.display(), target);
                }
                adopt
            }
            Err(e) => {
                debug!("Language detection failed for {}: {}", path.display(), e);
                false
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn translate_documents(
        &self,
        state: &CycleState,
        target: &str,
        plans: Vec<DocumentPlan>,
        mut row: LanguageRow,
        source: &str,
        semaphore: &Semaphore,
        cancel: &CancellationToken,
    ) -> TranslatedDocuments {
        if row.remaining() > 0 {
            row.status = RowStatus::InProgress;
            self.publisher.update_row(state, row.clone());
        }

        let mut complete = true;
        let mut folders = Vec::with_capacity(plans.len());

        for plan in plans {
            let mut manifest = plan.manifest.clone();
            let mut writes = Vec::new();
            let plan_ref = &plan;

            let units: Vec<usize> = plan
                .canonical
                .iter()
                .enumerate()
                .filter(|(_, node)| {
                    plan.diff.to_add.contains(&node.path) || plan.diff.to_update.contains(&node.path)
                })
                .map(|(index, _)| index)
                .collect();

            let mut results = stream::iter(units)
                .map(|index| async move {
                    let node = &plan_ref.canonical[index];
                    if cancel.is_cancelled() {
                        return (node, None);
                    }
                    let Ok(_permit) = semaphore.acquire().await else {
                        return (node, None);
                    };

                    let unmanaged = plan_ref.diff.to_add.contains(&node.path)
                        && plan_ref.present.contains(&node.path)
                        && plan_ref.manifest.get(&node.path).is_none();
                    if unmanaged && self.adopt_existing(&plan_ref.folder, node, target).await {
                        return (node, Some(DocumentOutcome::Adopted));
                    }

                    let result = self.client.translate(&node.text, source, target).await;
                    (node, Some(DocumentOutcome::Translated(result)))
                })
                .buffer_unordered(self.workers);

            while let Some((node, outcome)) = results.next().await {
                match outcome {
                    None => complete = false,
                    Some(DocumentOutcome::Adopted) => {
                        manifest.record(node);
                        row.translated += 1;
                        state.record_unit_translated();
                    }
                    Some(DocumentOutcome::Translated(result)) => match result.status {
                        TranslationStatus::Translated => {
                            writes.push((node.path.clone(), result.text));
                            manifest.record(node);
                            row.translated += 1;
                            state.record_unit_translated();
                        }
                        TranslationStatus::Untranslated => {
                            row.failed += 1;
                            complete = false;
                            state.record_unit_untranslated();
                        }
                        TranslationStatus::Failed => {
                            row.failed += 1;
                            complete = false;
                            state.record_unit_failed();
                        }
                    },
                }
                self.publisher.update_row(state, row.clone());
            }
            drop(results);

            folders.push(TranslatedFolder {
                folder: plan.folder.clone(),
                previous: plan.manifest.clone(),
                writes,
                removals: plan.diff.to_remove.clone(),
                manifest,
            });
        }

        TranslatedDocuments {
            folders,
            complete,
            row,
        }
    }

    async fn save_documents(&self, state: &CycleState, translated: Vec<TranslatedDocuments>) {
        for TranslatedDocuments {
            folders,
            mut complete,
            mut row,
        } in translated
        {
            for TranslatedFolder {
                folder,
                previous,
                writes,
                removals,
                mut manifest,
            } in folders
            {
                let mut written = 0;
                for (path, text) in &writes {
                    match documents::write_document(&folder, path, text).await {
                        Ok(()) => written += 1,
                        Err(e) => {
                            warn!("Failed to write {}/{}: {}", folder.display(), path, e);
                            // The file on disk is still whatever the old entry describes
                            manifest.restore(path, &previous);
                            complete = false;
                        }
                    }
                }

                let mut removed = 0;
                for path in &removals {
                    match documents::remove_document(&folder, path).await {
                        Ok(()) => {
                            manifest.forget(path);
                            removed += 1;
                        }
                        Err(e) => {
                            warn!("Failed to remove {}/{}: {}", folder.display(), path, e);
                            complete = false;
                        }
                    }
                }

                if let Err(e) = manifest.save(&folder).await {
                    warn!("Failed to save manifest in {}: {}", folder.display(), e);
                    complete = false;
                }
                state.record_documents(written, removed);
                info!(
                    "{}: {} documents written, {} removed",
                    folder.display(),
                    written,
                    removed
                );
            }

            row.status = if complete {
                RowStatus::Done
            } else {
                RowStatus::Failed
            };
            self.publisher.update_row(state, row);
        }
    }
}

fn merge_rows(row: &mut LanguageRow, part: &LanguageRow) {
    row.existing += part.existing;
    row.to_add += part.to_add;
    row.to_remove += part.to_remove;
    row.to_update += part.to_update;
    if part.status != RowStatus::Done {
        row.status = part.status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_channel_coalesces() {
        let (handle, mut receiver) = trigger_channel();

        assert!(handle.trigger(Trigger::Timer));
        assert!(!handle.trigger(Trigger::Manual));
        assert!(!handle.trigger(Trigger::Timer));

        assert_eq!(receiver.try_recv().ok(), Some(Trigger::Timer));
        assert!(receiver.try_recv().is_err());
        assert!(handle.trigger(Trigger::Manual));
    }

    #[test]
    fn test_trigger_after_loop_stopped() {
        let (handle, receiver) = trigger_channel();
        drop(receiver);
        assert!(!handle.trigger(Trigger::Manual));
    }

    #[test]
    fn test_merge_rows_keeps_pending_status() {
        let mut row = LanguageRow::from_diff(
            &DiffResult {
                language: "es".to_string(),
                existing: 2,
                ..DiffResult::default()
            },
            ContentKind::Md,
        );
        let part = LanguageRow::from_diff(
            &DiffResult {
                language: "es".to_string(),
                to_add: BTreeSet::from(["a.md".to_string()]),
                ..DiffResult::default()
            },
            ContentKind::Md,
        );

        merge_rows(&mut row, &part);
        assert_eq!(row.existing, 2);
        assert_eq!(row.to_add, 1);
        assert_eq!(row.status, RowStatus::Pending);
    }
}
