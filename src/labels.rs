//! User-facing notification labels and their localized text.

use anyhow::{bail, Result};
use std::fmt;
use std::str::FromStr;

/// Severity of a label, also used as the minimum level a user wants to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum NotificationLevel {
    #[default]
    Info,
    Warn,
    Error,
}

impl NotificationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationLevel::Info => "info",
            NotificationLevel::Warn => "warn",
            NotificationLevel::Error => "error",
        }
    }

    /// Whether a label of `level` is shown when `self` is the configured minimum.
    pub fn shows(&self, level: NotificationLevel) -> bool {
        level >= *self
    }
}

impl FromStr for NotificationLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" => Ok(NotificationLevel::Info),
            "warn" | "warning" => Ok(NotificationLevel::Warn),
            "error" => Ok(NotificationLevel::Error),
            other => bail!("Unknown notification level: '{}'", other),
        }
    }
}

impl fmt::Display for NotificationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A notification shown in the compose window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Label {
    /// The user changed the language and it was remembered.
    SavedForRecipients { language: String },
    /// A language was applied from an exact match.
    Deduced { language: String },
    /// A language was applied from the domain vote.
    Guessed { language: String },
    /// Nothing is known about these recipients.
    NoLanguageForRecipients,
    /// A language change was not remembered because of the recipient cap.
    DiscardedTooManyRecipients { max_recipients: usize },
}

impl Label {
    pub fn level(&self) -> NotificationLevel {
        match self {
            Label::DiscardedTooManyRecipients { .. } => NotificationLevel::Warn,
            _ => NotificationLevel::Info,
        }
    }

    /// Stable identifier of the message, independent of locale.
    pub fn message_key(&self) -> &'static str {
        match self {
            Label::SavedForRecipients { .. } => "savedForRecipients",
            Label::Deduced { .. } => "deducedLang.go",
            Label::Guessed { .. } => "deducedLang.guess",
            Label::NoLanguageForRecipients => "noLangForRecipients",
            Label::DiscardedTooManyRecipients { .. } => "DiscardedUpdateTooMuchRecipients",
        }
    }

    /// Render the label with the given catalog.
    pub fn render(&self, strings: &LabelStrings) -> String {
        match self {
            Label::SavedForRecipients { language } => {
                strings.saved_for_recipients.replace("{language}", language)
            }
            Label::Deduced { language } => strings.deduced.replace("{language}", language),
            Label::Guessed { language } => strings.guessed.replace("{language}", language),
            Label::NoLanguageForRecipients => strings.no_language_for_recipients.to_string(),
            Label::DiscardedTooManyRecipients { max_recipients } => strings
                .discarded_too_many_recipients
                .replace("{max}", &max_recipients.to_string()),
        }
    }
}

/// All localized label strings for one UI locale.
#[derive(Debug, Clone)]
pub struct LabelStrings {
    /// ISO 639-1 code of the UI locale
    pub locale: &'static str,

    /// Placeholders: {language}
    pub saved_for_recipients: &'static str,

    /// Placeholders: {language}
    pub deduced: &'static str,

    /// Placeholders: {language}
    pub guessed: &'static str,

    pub no_language_for_recipients: &'static str,

    /// Placeholders: {max}
    pub discarded_too_many_recipients: &'static str,
}

const ENGLISH: LabelStrings = LabelStrings {
    locale: "en",
    saved_for_recipients: "Saved {language} as the language for these recipients",
    deduced: "Language set to {language} for these recipients",
    guessed: "Language guessed as {language} from the recipients' domains",
    no_language_for_recipients: "No language remembered for these recipients",
    discarded_too_many_recipients:
        "Language not remembered: more than {max} recipients",
};

const SPANISH: LabelStrings = LabelStrings {
    locale: "es",
    saved_for_recipients: "Guardado {language} como idioma para estos destinatarios",
    deduced: "Idioma cambiado a {language} para estos destinatarios",
    guessed: "Idioma deducido como {language} por los dominios de los destinatarios",
    no_language_for_recipients: "No hay idioma guardado para estos destinatarios",
    discarded_too_many_recipients:
        "Idioma no guardado: hay más de {max} destinatarios",
};

const CATALAN: LabelStrings = LabelStrings {
    locale: "ca",
    saved_for_recipients: "Desat {language} com a idioma per a aquests destinataris",
    deduced: "Idioma canviat a {language} per a aquests destinataris",
    guessed: "Idioma deduït com a {language} pels dominis dels destinataris",
    no_language_for_recipients: "No hi ha cap idioma desat per a aquests destinataris",
    discarded_too_many_recipients:
        "Idioma no desat: hi ha més de {max} destinataris",
};

impl LabelStrings {
    /// Catalog for a locale code such as `"es"` or `"ca-ES"`, English otherwise.
    pub fn for_locale(locale: &str) -> &'static LabelStrings {
        let primary = locale
            .split(['-', '_'])
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        match primary.as_str() {
            "es" => &SPANISH,
            "ca" => &CATALAN,
            _ => &ENGLISH,
        }
    }

    pub fn english() -> &'static LabelStrings {
        &ENGLISH
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Level Tests ====================

    #[test]
    fn test_level_parse() {
        assert_eq!("info".parse::<NotificationLevel>().unwrap(), NotificationLevel::Info);
        assert_eq!(" ERROR ".parse::<NotificationLevel>().unwrap(), NotificationLevel::Error);
        assert_eq!("warning".parse::<NotificationLevel>().unwrap(), NotificationLevel::Warn);
        assert!("loud".parse::<NotificationLevel>().is_err());
    }

    #[test]
    fn test_level_filtering() {
        assert!(NotificationLevel::Info.shows(NotificationLevel::Info));
        assert!(NotificationLevel::Info.shows(NotificationLevel::Warn));
        assert!(!NotificationLevel::Error.shows(NotificationLevel::Info));
        assert!(!NotificationLevel::Error.shows(NotificationLevel::Warn));
    }

    // ==================== Rendering Tests ====================

    #[test]
    fn test_render_placeholders() {
        let en = LabelStrings::english();
        let saved = Label::SavedForRecipients { language: "ca".into() }.render(en);
        assert!(saved.contains("ca"));
        assert!(!saved.contains('{'));

        let discarded = Label::DiscardedTooManyRecipients { max_recipients: 10 }.render(en);
        assert!(discarded.contains("10"));
    }

    #[test]
    fn test_locale_fallback() {
        assert_eq!(LabelStrings::for_locale("es-ES").locale, "es");
        assert_eq!(LabelStrings::for_locale("ca").locale, "ca");
        assert_eq!(LabelStrings::for_locale("fr").locale, "en");
        assert_eq!(LabelStrings::for_locale("").locale, "en");
    }

    #[test]
    fn test_all_catalogs_render_every_label() {
        let labels = [
            Label::SavedForRecipients { language: "x".into() },
            Label::Deduced { language: "x".into() },
            Label::Guessed { language: "x".into() },
            Label::NoLanguageForRecipients,
            Label::DiscardedTooManyRecipients { max_recipients: 3 },
        ];
        for locale in ["en", "es", "ca"] {
            let strings = LabelStrings::for_locale(locale);
            for label in &labels {
                let text = label.render(strings);
                assert!(!text.is_empty());
                assert!(!text.contains('{'), "{} left a placeholder: {}", locale, text);
            }
        }
    }

    #[test]
    fn test_message_keys() {
        assert_eq!(Label::NoLanguageForRecipients.message_key(), "noLangForRecipients");
        assert_eq!(
            Label::DiscardedTooManyRecipients { max_recipients: 1 }.level(),
            NotificationLevel::Warn
        );
    }
}
