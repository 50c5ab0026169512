//! Avatalk Library
//!
//! Voice-driven talking avatar: speech recognition, wake-word gating,
//! language-model answers and phrase-by-phrase avatar playback.

pub mod asr;
pub mod audio;
pub mod avatar;
pub mod config;
pub mod core;
pub mod error;
pub mod ledger;
pub mod phrase;
pub mod processor;
pub mod response;
pub mod retry;
pub mod scheduler;
pub mod wake_word;
