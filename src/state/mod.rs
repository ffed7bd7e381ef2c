//! State Management Module
//!
//! Persists node records across daemon restarts, along with the audit
//! log of lifecycle transitions.

mod store;

pub use store::{StateStore, TransitionRecord, INTERRUPTED_REASON};
