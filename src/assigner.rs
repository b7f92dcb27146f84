//! Remembers a language for a recipient group, its "to" line and each
//! individual recipient.

use crate::error::Result;
use crate::events::{Event, EventBus};
use crate::lru_store::SetOutcome;
use crate::memory::{SharedMemory, WriteMode};
use crate::recipients::{RecipientGroup, RecipientKey};
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of [`LanguageAssigner::assign_language_change`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignOutcome {
    /// Nothing stored: the group is larger than the recipient cap.
    TooManyRecipients { max_recipients: usize, count: usize },
    /// Nothing stored: the group has no "to" recipients.
    NoRecipients,
    /// Number of keys whose language was written.
    Assigned { written: usize },
}

pub struct LanguageAssigner {
    memory: Arc<SharedMemory>,
    bus: EventBus,
}

impl LanguageAssigner {
    pub fn new(memory: Arc<SharedMemory>, bus: EventBus) -> Self {
        Self { memory, bus }
    }

    pub fn memory(&self) -> &Arc<SharedMemory> {
        &self.memory
    }

    /// Language remembered for `key`.
    pub async fn lookup(&self, key: &RecipientKey) -> Option<String> {
        self.memory.lookup(key).await
    }

    /// `Some(cap)` when `group` has more recipients than the cap allows.
    pub async fn exceeds_cap(&self, group: &RecipientGroup) -> Option<usize> {
        let max_recipients = self.memory.preferences().max_recipients().await;
        (group.len() > max_recipients).then_some(max_recipients)
    }

    /// Remember that `language` was chosen for `group`.
    ///
    /// The whole group and the "to" line (when it has several addresses)
    /// take the new language. Individual recipients only get it if they
    /// have nothing stored yet.
    pub async fn assign_language_change(
        &self,
        group: &RecipientGroup,
        language: &str,
    ) -> Result<AssignOutcome> {
        if let Some(max_recipients) = self.exceeds_cap(group).await {
            warn!(
                "Discarded language change: {} recipients (maxRecipients is {})",
                group.len(),
                max_recipients
            );
            self.memory.metrics().record_discarded_change();
            return Ok(AssignOutcome::TooManyRecipients {
                max_recipients,
                count: group.len(),
            });
        }
        if group.to().is_empty() {
            debug!("Empty recipients, skipping language change");
            return Ok(AssignOutcome::NoRecipients);
        }

        let mut written = 0;
        if self.save(group, language, WriteMode::Force).await? {
            written += 1;
        }
        if group.to().len() > 1
            && self
                .save(&group.without_cc(), language, WriteMode::Force)
                .await?
        {
            written += 1;
        }
        for address in group.all() {
            let individual = RecipientGroup::single(address);
            if self.save(&individual, language, WriteMode::IfAbsent).await? {
                written += 1;
            }
        }

        debug!("Assigned {} to {} keys for {}", language, written, group.key());
        Ok(AssignOutcome::Assigned { written })
    }

    async fn save(
        &self,
        recipients: &RecipientGroup,
        language: &str,
        mode: WriteMode,
    ) -> Result<bool> {
        let key = recipients.key();
        let written = self.memory.write(&key, language, mode).await?;
        let Some(SetOutcome { previous, evicted }) = written else {
            return Ok(false);
        };

        debug!("Assigning language {} to key {}", language, key);
        if let Some((evicted_key, evicted_language)) = evicted {
            self.bus.publish(Event::AssignmentRemoved {
                recipients_key: evicted_key,
                language: evicted_language,
            });
        }
        self.bus.publish(Event::AssignmentChanged {
            recipients: recipients.clone(),
            recipients_key: key.into_string(),
            previous_language: previous,
            language: language.to_string(),
        });
        Ok(true)
    }
}
