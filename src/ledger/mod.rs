pub mod api;
pub mod models;
pub mod service;

pub use api::{member_balance as ledger_member_balance, member_history as ledger_member_history};
pub use models::{BalanceSnapshot, LedgerEntry, LedgerOutcome};
pub use service::SessionLedger;
