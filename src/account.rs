use super::common::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single account row. `balance` is the spendable amount; `held` is the
/// sum reserved by in-flight transfer preparations and is invisible to
/// balance queries until the transfer commits or aborts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub name: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub balance: Value,
    #[serde(with = "rust_decimal::serde::float")]
    pub held: Value,
}

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("insufficient funds")]
    InsufficientFunds,
}

impl Account {
    pub fn new(name: impl Into<String>, balance: Value) -> Self {
        Self {
            name: name.into(),
            balance,
            held: Value::ZERO,
        }
    }

    pub fn deposit(&self, amount: Value) -> Self {
        Self {
            balance: self.balance + amount,
            ..self.clone()
        }
    }

    pub fn withdraw(&self, amount: Value) -> Result<Self, AccountError> {
        if self.balance < amount {
            return Err(AccountError::InsufficientFunds);
        }
        Ok(Self {
            balance: self.balance - amount,
            ..self.clone()
        })
    }

    /// Debit without a sufficiency check. Replica apply paths use this and
    /// may drive a non-authoritative balance negative.
    pub fn debit(&self, amount: Value) -> Self {
        Self {
            balance: self.balance - amount,
            ..self.clone()
        }
    }

    /// Move `amount` from the spendable balance into `held`.
    pub fn reserve(&self, amount: Value) -> Result<Self, AccountError> {
        if self.balance < amount {
            return Err(AccountError::InsufficientFunds);
        }
        Ok(Self {
            balance: self.balance - amount,
            held: self.held + amount,
            ..self.clone()
        })
    }

    /// Return a reservation to the spendable balance. Clamped to `held`.
    pub fn release(&self, amount: Value) -> Self {
        let freed = amount.min(self.held);
        Self {
            balance: self.balance + freed,
            held: self.held - freed,
            ..self.clone()
        }
    }

    /// Consume a reservation after a commit decision.
    pub fn capture(&self, amount: Value) -> Result<Self, AccountError> {
        if self.held < amount {
            return Err(AccountError::InsufficientFunds);
        }
        Ok(Self {
            held: self.held - amount,
            ..self.clone()
        })
    }
}
