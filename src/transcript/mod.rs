//! Conversation transcript
//!
//! `TranscriptStore` reconciles the chunked, partially ordered transport
//! event feed into one ordered log of `TranscriptItem`s.

mod item;
pub(crate) mod store;

pub use item::{ItemKind, ItemStatus, Role, TranscriptItem};
pub use store::{user_utterances, HandoffHandler, Reconciled, TranscriptStore};
