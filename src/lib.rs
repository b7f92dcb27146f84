//! Remembers which spellchecker language was used for which email
//! recipients, and picks it again the next time the same people are
//! addressed.

pub mod assigner;
pub mod compose;
pub mod config;
pub mod deduction;
pub mod error;
pub mod events;
pub mod heuristic;
pub mod labels;
pub mod lru_store;
pub mod memory;
pub mod metrics;
pub mod persistent;
pub mod preferences;
pub mod recipients;
pub mod retry;
pub mod storage;

pub use assigner::{AssignOutcome, LanguageAssigner};
pub use compose::{ComposeWindow, MemoryComposeWindow, RawRecipients};
pub use config::Config;
pub use deduction::{ChangeOutcome, DeduceOptions, DeductionOrchestrator, DeductionOutcome};
pub use error::MemoryError;
pub use events::{DeductionMethod, Event, EventBus};
pub use memory::SharedMemory;
pub use recipients::{RecipientGroup, RecipientKey};
pub use storage::{JsonFileStorage, KeyValueStore, MemoryStorage};
