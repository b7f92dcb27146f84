//! Boundary to the mail client's compose window.

use crate::labels::NotificationLevel;
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Recipients as reported by the compose window, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRecipients {
    pub to: Vec<String>,
    pub cc: Vec<String>,
}

impl RawRecipients {
    pub fn new<T: Into<String>, C: Into<String>>(
        to: impl IntoIterator<Item = T>,
        cc: impl IntoIterator<Item = C>,
    ) -> Self {
        Self {
            to: to.into_iter().map(Into::into).collect(),
            cc: cc.into_iter().map(Into::into).collect(),
        }
    }

    pub fn to_only<T: Into<String>>(to: impl IntoIterator<Item = T>) -> Self {
        Self::new(to, Vec::<String>::new())
    }
}

/// What the orchestrator needs from one compose window.
#[async_trait]
pub trait ComposeWindow: Send + Sync {
    async fn recipients(&self) -> Result<RawRecipients>;

    /// Language currently active in the spellchecker, if any.
    async fn current_language(&self) -> Result<Option<String>>;

    async fn change_language(&self, language: &str) -> Result<()>;

    async fn change_label(&self, level: NotificationLevel, message: &str) -> Result<()>;

    /// Whether the spellchecker is ready to take a language.
    async fn can_spell_check(&self) -> Result<bool>;
}

#[derive(Debug, Default)]
struct WindowState {
    recipients: RawRecipients,
    language: Option<String>,
    labels: Vec<(NotificationLevel, String)>,
    applied: Vec<String>,
    readiness: VecDeque<bool>,
    ready: bool,
    readiness_checks: usize,
    fail_language_changes: bool,
}

/// Compose window kept entirely in memory.
///
/// Useful headless and in tests: recipients and the active language are set
/// directly, and every label and applied language is recorded.
#[derive(Debug)]
pub struct MemoryComposeWindow {
    state: Mutex<WindowState>,
}

impl MemoryComposeWindow {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WindowState {
                ready: true,
                ..WindowState::default()
            }),
        }
    }

    pub fn set_recipients(&self, recipients: RawRecipients) {
        self.lock().recipients = recipients;
    }

    /// Change the active language as the user would.
    pub fn set_language(&self, language: Option<&str>) {
        self.lock().language = language.map(str::to_string);
    }

    pub fn language(&self) -> Option<String> {
        self.lock().language.clone()
    }

    /// Readiness answer once the scripted answers run out.
    pub fn set_ready(&self, ready: bool) {
        self.lock().ready = ready;
    }

    /// Answers returned by the next readiness checks, in order.
    pub fn script_readiness(&self, answers: impl IntoIterator<Item = bool>) {
        self.lock().readiness.extend(answers);
    }

    pub fn fail_language_changes(&self, fail: bool) {
        self.lock().fail_language_changes = fail;
    }

    /// Every label shown so far.
    pub fn labels(&self) -> Vec<(NotificationLevel, String)> {
        self.lock().labels.clone()
    }

    pub fn label_count(&self) -> usize {
        self.lock().labels.len()
    }

    pub fn last_label(&self) -> Option<String> {
        self.lock().labels.last().map(|(_, text)| text.clone())
    }

    /// Every language pushed through `change_language`.
    pub fn applied_languages(&self) -> Vec<String> {
        self.lock().applied.clone()
    }

    pub fn readiness_checks(&self) -> usize {
        self.lock().readiness_checks
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WindowState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for MemoryComposeWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ComposeWindow for MemoryComposeWindow {
    async fn recipients(&self) -> Result<RawRecipients> {
        Ok(self.lock().recipients.clone())
    }

    async fn current_language(&self) -> Result<Option<String>> {
        Ok(self.lock().language.clone())
    }

    async fn change_language(&self, language: &str) -> Result<()> {
        let mut state = self.lock();
        if state.fail_language_changes {
            bail!("spellchecker rejected language '{}'", language);
        }
        state.language = Some(language.to_string());
        state.applied.push(language.to_string());
        Ok(())
    }

    async fn change_label(&self, level: NotificationLevel, message: &str) -> Result<()> {
        self.lock().labels.push((level, message.to_string()));
        Ok(())
    }

    async fn can_spell_check(&self) -> Result<bool> {
        let mut state = self.lock();
        state.readiness_checks += 1;
        let ready = state.ready;
        Ok(state.readiness.pop_front().unwrap_or(ready))
    }
}
