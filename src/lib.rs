//! Quitador — bill payment planning agent
//!
//! A conversational agent that:
//! - Tracks a company's payable bills against a mutable cash balance
//! - Computes the cheapest way to cover a cash shortfall (working capital,
//!   receivables advance, or a greedy partial-payment plan)
//! - Sequences data gathering, confirmation, and exactly-once commit
//!   through a per-session state machine
//! - Delegates intent recognition and prose generation to collaborators
//!
//! TURN LOOP:
//! MESSAGE → CLASSIFY → DISPATCH (state × intent) → DECIDE → CONFIRM → COMMIT

pub mod api;
pub mod classifier;
pub mod engine;
pub mod error;
pub mod fsm;
pub mod history;
pub mod llm;
pub mod models;
pub mod renderer;
pub mod repository;
pub mod session;

pub use error::Result;

// Re-export common types
pub use classifier::{Intent, IntentClassifier, KeywordClassifier};
pub use models::*;
