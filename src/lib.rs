//! # taskmarket
//!
//! Core of a task-reward marketplace: creators fund repeatable tasks, executors
//! complete them and are paid from escrow after approval.
//!
//! This library provides:
//! - A double-entry style ledger with idempotent postings and escrow
//! - The task factory (funding, quotas, eligibility listing)
//! - The execution state machine (verification, moderation, appeal)
//! - Cancellation, expiry and a timeout-driven auto-approval sweep
//! - Memory and SQLite stores behind one transactional port
//! - An HTTP/SSE adapter
//!
//! ## Money flow
//!
//! ```text
//!   deposit ──► creator balance ──reserve──► task escrow ──credit──► executor
//!                      │                          │
//!                      └──commission──► platform ◄┴──penalty (cancel)
//!                                          │
//!                                          └──bonus (level multiplier)──► executor
//! ```
//!
//! ## Modules
//! - `reward`: pure arithmetic for commissions, multipliers and refunds
//! - `ledger`: accounts, transactions and the posting rules
//! - `task`: tasks, executions and the verifier port
//! - `store`: transactional storage (memory, sqlite)
//! - `market`: the marketplace service and its background sweep
//! - `api`: HTTP routes over the marketplace

pub mod api;
pub mod config;
pub mod ledger;
pub mod market;
pub mod reward;
pub mod store;
pub mod task;
pub mod util;

pub use config::Config;
pub use market::{MarketError, Marketplace};
