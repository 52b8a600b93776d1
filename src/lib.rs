/// QA Rank Ledger - reputation and activity ledger for a Q&A community
///
/// Records every rank affecting action (votes, accepted answers, account
/// activation, follows) as an idempotent, cancellable ledger entry and applies
/// the resulting reputation changes atomically, under a floor of 1 and a daily
/// earning limit.

pub mod activity;
pub mod cache;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod metrics;
pub mod notification;
pub mod object_id;
pub mod orchestrator;
pub mod rank;
pub mod site_config;

pub use config::LedgerConfig;
pub use context::{init_tracing, LedgerContext};
pub use error::{LedgerError, LedgerResult};
pub use orchestrator::{
    AcceptAnswerOrchestrator, AcceptOutcome, BonusOutcome, BonusProcessor, FollowProcessor,
    LedgerOutcome, RankChange, VoteDirection, VoteOrchestrator, VoteOutcome, VoteRequest,
};
