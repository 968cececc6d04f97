//! In-memory ledger used by the memory store.

use std::collections::HashMap;

use chrono::Utc;

use super::{Ledger, LedgerEntry, Posting, Transaction, UserId};
use crate::market::MarketError;

/// Balances plus the append-only log, held in memory.
///
/// Cloning a book is how the memory store snapshots state for a transaction.
#[derive(Debug, Clone, Default)]
pub struct LedgerBook {
    balances: HashMap<UserId, i64>,
    log: Vec<Transaction>,
    by_key: HashMap<String, usize>,
}

impl LedgerBook {
    /// Create a zero-balance account if it does not exist yet.
    pub fn open_account(&mut self, account: &UserId) {
        self.balances.entry(account.clone()).or_insert(0);
    }

    /// Every account with its cached balance.
    pub fn balances(&self) -> impl Iterator<Item = (&UserId, i64)> {
        self.balances.iter().map(|(id, balance)| (id, *balance))
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.log
    }
}

impl Ledger for LedgerBook {
    fn account_balance(&self, account: &UserId) -> Result<Option<i64>, MarketError> {
        Ok(self.balances.get(account).copied())
    }

    fn ledger_sum(&self, account: &UserId) -> Result<i64, MarketError> {
        Ok(self
            .log
            .iter()
            .filter(|tx| &tx.account_id == account)
            .map(|tx| tx.amount)
            .sum())
    }

    fn post(&mut self, entry: LedgerEntry) -> Result<Posting, MarketError> {
        let key = entry.idempotency_key();
        if let Some(&index) = self.by_key.get(&key) {
            return Ok(Posting::Replayed(self.log[index].clone()));
        }
        let balance = self
            .balances
            .get_mut(&entry.account_id)
            .ok_or_else(|| MarketError::not_found("account", &entry.account_id))?;
        let tx = entry.into_transaction(key.clone(), Utc::now());
        *balance = balance
            .checked_add(tx.amount)
            .ok_or_else(|| MarketError::Invariant(format!("balance overflow on {}", tx.account_id)))?;

        self.by_key.insert(key, self.log.len());
        self.log.push(tx.clone());
        Ok(Posting::Applied(tx))
    }

    fn account_transactions(&self, account: &UserId) -> Result<Vec<Transaction>, MarketError> {
        Ok(self
            .log
            .iter()
            .filter(|tx| &tx.account_id == account)
            .cloned()
            .collect())
    }
}
