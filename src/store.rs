//! Embedded per-branch store. Three tables: `accounts` and `pending_tx`
//! rows are JSON documents keyed by account number / transaction id, and
//! `meta` holds the replication sequence counters. Every method is a
//! single `redb` transaction; a committed write transaction is the
//! durability boundary. Cross-statement atomicity is the branch lock's
//! job, not the store's.

use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::account::Account;
use crate::common::*;

const ACCOUNTS: TableDefinition<&str, &[u8]> = TableDefinition::new("accounts");
const PENDING: TableDefinition<&str, &[u8]> = TableDefinition::new("pending_tx");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const REPL_SEQ: &str = "repl_seq";

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Open(#[from] redb::DatabaseError),
    #[error(transparent)]
    Txn(#[from] redb::TransactionError),
    #[error(transparent)]
    Table(#[from] redb::TableError),
    #[error(transparent)]
    Storage(#[from] redb::StorageError),
    #[error(transparent)]
    Commit(#[from] redb::CommitError),
    #[error(transparent)]
    Codec(#[from] serde_json::Error),
}

/// A journaled transfer intent. At most one row exists per txid; a
/// `Withdraw` row means the amount is reserved in the account's `held`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingTx {
    pub account_no: AccountNo,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Value,
    #[serde(rename = "type")]
    pub kind: TxKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxKind {
    Withdraw,
    Deposit,
}

pub struct BranchStore {
    db: Database,
}

impl BranchStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let db = Database::create(path)?;
        let wtx = db.begin_write()?;
        {
            wtx.open_table(ACCOUNTS)?;
            wtx.open_table(PENDING)?;
            wtx.open_table(META)?;
        }
        wtx.commit()?;
        Ok(Self { db })
    }

    pub fn account(&self, account_no: &str) -> Result<Option<Account>, Error> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(ACCOUNTS)?;
        match table.get(account_no)? {
            Some(row) => Ok(Some(serde_json::from_slice(row.value())?)),
            None => Ok(None),
        }
    }

    pub fn put_account(&self, account_no: &str, account: &Account) -> Result<(), Error> {
        let row = serde_json::to_vec(account)?;
        let wtx = self.db.begin_write()?;
        {
            let mut table = wtx.open_table(ACCOUNTS)?;
            table.insert(account_no, row.as_slice())?;
        }
        wtx.commit()?;
        Ok(())
    }

    pub fn accounts(&self) -> Result<Vec<(AccountNo, Account)>, Error> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(ACCOUNTS)?;
        let mut out = Vec::new();
        for row in table.iter()? {
            let (key, value) = row?;
            out.push((key.value().to_string(), serde_json::from_slice(value.value())?));
        }
        Ok(out)
    }

    pub fn pending(&self, txid: &str) -> Result<Option<PendingTx>, Error> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(PENDING)?;
        match table.get(txid)? {
            Some(row) => Ok(Some(serde_json::from_slice(row.value())?)),
            None => Ok(None),
        }
    }

    pub fn put_pending(&self, txid: &str, tx: &PendingTx) -> Result<(), Error> {
        let row = serde_json::to_vec(tx)?;
        let wtx = self.db.begin_write()?;
        {
            let mut table = wtx.open_table(PENDING)?;
            table.insert(txid, row.as_slice())?;
        }
        wtx.commit()?;
        Ok(())
    }

    pub fn remove_pending(&self, txid: &str) -> Result<(), Error> {
        let wtx = self.db.begin_write()?;
        {
            let mut table = wtx.open_table(PENDING)?;
            table.remove(txid)?;
        }
        wtx.commit()?;
        Ok(())
    }

    pub fn pending_all(&self) -> Result<Vec<(TxId, PendingTx)>, Error> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(PENDING)?;
        let mut out = Vec::new();
        for row in table.iter()? {
            let (key, value) = row?;
            out.push((key.value().to_string(), serde_json::from_slice(value.value())?));
        }
        Ok(out)
    }

    /// Advance and return the outbound replication sequence.
    pub fn next_repl_seq(&self) -> Result<u64, Error> {
        let wtx = self.db.begin_write()?;
        let seq = {
            let mut table = wtx.open_table(META)?;
            let next = table.get(REPL_SEQ)?.map(|g| g.value()).unwrap_or(0) + 1;
            table.insert(REPL_SEQ, next)?;
            next
        };
        wtx.commit()?;
        Ok(seq)
    }

    /// Highest inbound replication sequence applied for `origin`.
    pub fn applied_seq(&self, origin: &str) -> Result<u64, Error> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(META)?;
        let key = format!("applied:{origin}");
        Ok(table.get(key.as_str())?.map(|g| g.value()).unwrap_or(0))
    }

    pub fn set_applied_seq(&self, origin: &str, seq: u64) -> Result<(), Error> {
        let key = format!("applied:{origin}");
        let wtx = self.db.begin_write()?;
        {
            let mut table = wtx.open_table(META)?;
            table.insert(key.as_str(), seq)?;
        }
        wtx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> (BranchStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = BranchStore::open(dir.path().join("test.db")).unwrap();
        (store, dir)
    }

    #[test]
    fn test_account_round_trip() {
        let (store, _dir) = scratch();
        assert!(store.account("1001").unwrap().is_none());
        let account = Account::new("Ada", Value::from(1000));
        store.put_account("1001", &account).unwrap();
        assert_eq!(store.account("1001").unwrap().unwrap(), account);
        assert_eq!(store.accounts().unwrap().len(), 1);
    }

    #[test]
    fn test_pending_overwrites_by_txid() {
        let (store, _dir) = scratch();
        let first = PendingTx {
            account_no: "1001".into(),
            amount: Value::from(300),
            kind: TxKind::Withdraw,
        };
        let second = PendingTx {
            amount: Value::from(500),
            ..first.clone()
        };
        store.put_pending("t1", &first).unwrap();
        store.put_pending("t1", &second).unwrap();
        assert_eq!(store.pending_all().unwrap().len(), 1);
        assert_eq!(store.pending("t1").unwrap().unwrap(), second);
        store.remove_pending("t1").unwrap();
        assert!(store.pending("t1").unwrap().is_none());
    }

    #[test]
    fn test_repl_seq_is_monotonic() {
        let (store, _dir) = scratch();
        assert_eq!(store.next_repl_seq().unwrap(), 1);
        assert_eq!(store.next_repl_seq().unwrap(), 2);
        assert_eq!(store.next_repl_seq().unwrap(), 3);
    }

    #[test]
    fn test_applied_seq_is_per_origin() {
        let (store, _dir) = scratch();
        assert_eq!(store.applied_seq("A").unwrap(), 0);
        store.set_applied_seq("A", 5).unwrap();
        assert_eq!(store.applied_seq("A").unwrap(), 5);
        assert_eq!(store.applied_seq("B").unwrap(), 0);
    }

    #[test]
    fn test_rows_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let account = Account::new("Ada", Value::from(1000));
        {
            let store = BranchStore::open(&path).unwrap();
            store.put_account("1001", &account).unwrap();
        }
        let store = BranchStore::open(&path).unwrap();
        assert_eq!(store.account("1001").unwrap().unwrap(), account);
    }
}
