//! Picks the spellchecker language for a compose window from its recipients,
//! and remembers the language when the user changes it.
//!
//! One [`DeductionOrchestrator`] drives one compose window. Every
//! orchestrator opened on the same storage shares a [`SharedMemory`], so a
//! change saved in one window is seen by the others.
//!
//! A deduction walks through [`Stage`]s. The instance's cancellation token is
//! checked after every suspension point; once [`DeductionOrchestrator::stop`]
//! has been called a pending deduction returns [`DeductionOutcome::Aborted`]
//! without touching the window.

use crate::assigner::{AssignOutcome, LanguageAssigner};
use crate::compose::ComposeWindow;
use crate::config::Config;
use crate::events::{DeductionMethod, Event, EventBus};
use crate::labels::{Label, LabelStrings};
use crate::memory::SharedMemory;
use crate::recipients::{RecipientGroup, RecipientKey};
use crate::retry::{with_retry, RetryConfig, RetryError};
use crate::storage::KeyValueStore;
use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Steps of one deduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    CheckingRecipients,
    CheckingSpellchecker,
    ResolvingLanguage,
    Applying,
    Notifying,
    Failed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeduceOptions {
    /// Readiness checks already spent by the caller. A value at or beyond the
    /// retry budget leaves a single check with no delay.
    pub start_attempt: u32,
}

impl DeduceOptions {
    /// Resolve now: one readiness check, no waiting.
    pub fn immediate() -> Self {
        Self {
            start_attempt: u32::MAX,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeductionOutcome {
    /// The instance was stopped; nothing was applied or shown.
    Aborted,
    /// The window has no "to" recipients.
    NoRecipients,
    SpellcheckerUnavailable { attempts: u32 },
    Resolved {
        language: String,
        method: DeductionMethod,
        /// Whether the language was pushed to the window by this deduction.
        applied: bool,
    },
    Unresolved,
    /// The window could not report its recipients.
    CollaboratorError,
}

/// Result of [`DeductionOrchestrator::language_changed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOutcome {
    Discarded { max_recipients: usize },
    /// Same language and recipients as the last change.
    Unchanged,
    NoRecipients,
    Saved { written: usize },
}

#[derive(Debug, Default)]
struct WindowMemory {
    /// Last (language, recipients) pair a label was produced for.
    last_notified: Option<(Option<String>, RecipientKey)>,
    /// Language last applied or chosen in this window, with its recipients.
    last_language: Option<(String, RecipientKey)>,
}

pub struct DeductionOrchestrator {
    window: Arc<dyn ComposeWindow>,
    memory: Arc<SharedMemory>,
    assigner: LanguageAssigner,
    bus: EventBus,
    retry_delay: Duration,
    strings: &'static LabelStrings,
    cancel: Mutex<CancellationToken>,
    state: tokio::sync::Mutex<WindowMemory>,
}

impl DeductionOrchestrator {
    /// Orchestrator for `window`, sharing memory with every other
    /// orchestrator opened on the same storage.
    pub fn new(
        window: Arc<dyn ComposeWindow>,
        storage: Arc<dyn KeyValueStore>,
        config: Arc<Config>,
    ) -> Self {
        let memory = SharedMemory::for_storage(storage, Arc::clone(&config));
        Self::with_memory(window, memory, &config)
    }

    pub fn with_memory(
        window: Arc<dyn ComposeWindow>,
        memory: Arc<SharedMemory>,
        config: &Config,
    ) -> Self {
        let bus = EventBus::new();
        Self {
            window,
            assigner: LanguageAssigner::new(Arc::clone(&memory), bus.clone()),
            memory,
            bus,
            retry_delay: config.retry_delay,
            strings: LabelStrings::for_locale(&config.locale),
            cancel: Mutex::new(CancellationToken::new()),
            state: tokio::sync::Mutex::new(WindowMemory::default()),
        }
    }

    pub fn memory(&self) -> &Arc<SharedMemory> {
        &self.memory
    }

    pub fn assigner(&self) -> &LanguageAssigner {
        &self.assigner
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    // ==================== Lifecycle ====================

    /// Resume work after [`stop`](Self::stop).
    pub fn start(&self) {
        let mut token = self.lock_cancel();
        if token.is_cancelled() {
            *token = CancellationToken::new();
            debug!("Deduction orchestrator restarted");
        }
    }

    /// Abort pending deductions. New ones abort until [`start`](Self::start).
    pub fn stop(&self) {
        self.lock_cancel().cancel();
        debug!("Deduction orchestrator stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.lock_cancel().is_cancelled()
    }

    /// Stop for good and tell listeners.
    pub fn shutdown(&self) {
        self.stop();
        info!("Deduction orchestrator shut down");
        self.bus.publish(Event::Shutdown);
    }

    fn token(&self) -> CancellationToken {
        self.lock_cancel().clone()
    }

    fn lock_cancel(&self) -> std::sync::MutexGuard<'_, CancellationToken> {
        match self.cancel.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // ==================== Deduction ====================

    /// Find and apply the language for the window's current recipients.
    pub async fn deduce_language(&self, options: DeduceOptions) -> DeductionOutcome {
        let token = self.token();
        if token.is_cancelled() {
            return aborted(Stage::Idle);
        }

        enter(Stage::CheckingRecipients);
        let raw = match self.window.recipients().await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Cannot read recipients: {:#}", e);
                return DeductionOutcome::CollaboratorError;
            }
        };
        if token.is_cancelled() {
            return aborted(Stage::CheckingRecipients);
        }
        let group = RecipientGroup::from_raw(&raw.to, &raw.cc);
        if group.to().is_empty() {
            debug!("No recipients, nothing to deduce");
            enter(Stage::Idle);
            return DeductionOutcome::NoRecipients;
        }

        enter(Stage::CheckingSpellchecker);
        let retry =
            RetryConfig::spellchecker_ready(self.retry_delay).resume_from(options.start_attempt);
        let window = &self.window;
        let readiness = with_retry(&retry, "Spellchecker readiness", &token, || async move {
            match window.can_spell_check().await {
                Ok(true) => Ok(()),
                Ok(false) => Err(anyhow!("spellchecker not ready")),
                Err(e) => Err(e),
            }
        })
        .await;
        match readiness {
            Ok(()) => {}
            Err(RetryError::Cancelled) => return aborted(Stage::CheckingSpellchecker),
            Err(RetryError::Exhausted { attempts, .. }) => {
                enter(Stage::Failed);
                warn!("Spellchecker not ready after {} attempts", attempts);
                self.bus.publish(Event::DeductionFailed {
                    recipients: group,
                    attempts,
                });
                return DeductionOutcome::SpellcheckerUnavailable { attempts };
            }
        }

        enter(Stage::ResolvingLanguage);
        let resolved = self.resolve(&group).await;
        if token.is_cancelled() {
            return aborted(Stage::ResolvingLanguage);
        }
        match &resolved {
            Some((_, DeductionMethod::Exact)) => self.memory.metrics().record_exact_hit(),
            Some((_, DeductionMethod::Heuristic)) => self.memory.metrics().record_heuristic_hit(),
            None => self.memory.metrics().record_miss(),
        }

        enter(Stage::Applying);
        let key = group.key();
        let mut applied = false;
        let mut label = None;
        match &resolved {
            Some((language, method)) => {
                let current = match self.window.current_language().await {
                    Ok(current) => current,
                    Err(e) => {
                        warn!("Cannot read the active language: {:#}", e);
                        None
                    }
                };
                if token.is_cancelled() {
                    return aborted(Stage::Applying);
                }

                let mut apply_failed = false;
                if current.as_deref() != Some(language.as_str()) {
                    match self.window.change_language(language).await {
                        Ok(()) => applied = true,
                        Err(e) => {
                            warn!("Failed to apply language {}: {:#}", language, e);
                            apply_failed = true;
                        }
                    }
                    if token.is_cancelled() {
                        return aborted(Stage::Applying);
                    }
                }

                if !apply_failed {
                    let mut state = self.state.lock().await;
                    state.last_language = Some((language.clone(), key.clone()));
                    let notified = (Some(language.clone()), key.clone());
                    if state.last_notified.as_ref() != Some(&notified) {
                        state.last_notified = Some(notified);
                        label = Some(match method {
                            DeductionMethod::Exact => Label::Deduced {
                                language: language.clone(),
                            },
                            DeductionMethod::Heuristic => Label::Guessed {
                                language: language.clone(),
                            },
                        });
                    }
                }
            }
            None => {
                let mut state = self.state.lock().await;
                if state.last_notified.as_ref() != Some(&(None, key.clone())) {
                    state.last_notified = Some((None, key.clone()));
                    label = Some(Label::NoLanguageForRecipients);
                }
            }
        }

        if let Some(label) = label {
            enter(Stage::Notifying);
            if token.is_cancelled() {
                return aborted(Stage::Notifying);
            }
            self.notify(&label).await;
        }

        enter(Stage::Idle);
        let (language, method) = match resolved {
            Some((language, method)) => (Some(language), Some(method)),
            None => (None, None),
        };
        self.bus.publish(Event::DeductionCompleted {
            recipients: group,
            language: language.clone(),
            method,
            applied,
        });

        match (language, method) {
            (Some(language), Some(method)) => DeductionOutcome::Resolved {
                language,
                method,
                applied,
            },
            _ => DeductionOutcome::Unresolved,
        }
    }

    /// Exact match over [`candidate_keys`], then the domain vote.
    async fn resolve(&self, group: &RecipientGroup) -> Option<(String, DeductionMethod)> {
        for key in candidate_keys(group) {
            if let Some(language) = self.memory.lookup(&key).await {
                debug!("Exact match {} for key {}", language, key);
                return Some((language, DeductionMethod::Exact));
            }
        }

        if !self.memory.preferences().allow_heuristic().await {
            return None;
        }
        let addresses: Vec<&str> = group.all().collect();
        let guess = self.memory.vote(&addresses).await?;
        debug!("Domain vote picked {} for {}", guess, group.key());
        Some((guess, DeductionMethod::Heuristic))
    }

    // ==================== Language Changes ====================

    /// Remember `language`, just chosen by the user, for the window's
    /// current recipients.
    pub async fn language_changed(&self, language: &str) -> Result<ChangeOutcome> {
        let raw = self.window.recipients().await?;
        let group = RecipientGroup::from_raw(&raw.to, &raw.cc);
        let key = group.key();

        // Over the cap the discard notice is shown even for a repeated change.
        if self.assigner.exceeds_cap(&group).await.is_none() {
            let state = self.state.lock().await;
            if state.last_language.as_ref() == Some(&(language.to_string(), key.clone())) {
                debug!("Same language and recipients as before: {}", language);
                return Ok(ChangeOutcome::Unchanged);
            }
        }

        match self.assigner.assign_language_change(&group, language).await? {
            AssignOutcome::Assigned { written } => {
                {
                    let mut state = self.state.lock().await;
                    state.last_language = Some((language.to_string(), key.clone()));
                    state.last_notified = Some((Some(language.to_string()), key));
                }
                self.notify(&Label::SavedForRecipients {
                    language: language.to_string(),
                })
                .await;
                Ok(ChangeOutcome::Saved { written })
            }
            AssignOutcome::NoRecipients => Ok(ChangeOutcome::NoRecipients),
            AssignOutcome::TooManyRecipients { max_recipients, .. } => {
                self.notify(&Label::DiscardedTooManyRecipients { max_recipients })
                    .await;
                Ok(ChangeOutcome::Discarded { max_recipients })
            }
        }
    }

    /// Show `label` unless the configured level hides it.
    async fn notify(&self, label: &Label) {
        let minimum = self.memory.preferences().notification_level().await;
        if !minimum.shows(label.level()) {
            debug!("Label {} hidden at level {}", label.message_key(), minimum);
            return;
        }
        let text = label.render(self.strings);
        if let Err(e) = self.window.change_label(label.level(), &text).await {
            warn!("Failed to show label {}: {:#}", label.message_key(), e);
        }
    }
}

/// Keys tried for an exact match, in priority order: the whole group, the
/// "to" line, then every recipient ("to" first, in order, then "cc").
pub fn candidate_keys(group: &RecipientGroup) -> Vec<RecipientKey> {
    let mut keys = vec![group.key()];
    let to_key = group.without_cc().key();
    if !keys.contains(&to_key) {
        keys.push(to_key);
    }
    for address in group.all() {
        let key = RecipientGroup::single(address).key();
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys
}

fn enter(stage: Stage) {
    debug!("Deduction stage: {:?}", stage);
}

fn aborted(stage: Stage) -> DeductionOutcome {
    debug!("Deduction aborted during {:?}", stage);
    DeductionOutcome::Aborted
}
