//! The branch state machine. One exclusive lock serializes every
//! read-modify-write against the store; replication is enqueued while the
//! lock is held (so sequence numbers match apply order) but the actual
//! replica I/O happens on the dispatcher thread.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;
use tracing::{debug, info};

use crate::account::{self, Account};
use crate::common::*;
use crate::proto::{
    AccountAmount, AccountSummary, BalanceInfo, BalanceQuery, CreateAccount, LocalTransfer,
    LocalTransferReceipt, NewBalance, Prepare, Replicate, ReplicatedWrite, TransferLeg, TxRef,
};
use crate::replicate::Replicator;
use crate::store::{self, BranchStore, PendingTx, TxKind};

#[derive(Debug, Error)]
pub enum Error {
    #[error("missing account_no")]
    MissingAccountNo,
    #[error("missing txid")]
    MissingTxid,
    #[error("invalid amount")]
    InvalidAmount,
    #[error("account exists")]
    AccountExists,
    #[error("account not found")]
    AccountNotFound,
    #[error("source account not found")]
    SourceAccountNotFound,
    #[error("destination account not found")]
    DestAccountNotFound,
    #[error("insufficient funds at commit")]
    InsufficientFundsAtCommit,
    #[error("no such tx")]
    NoSuchTx,
    #[error("branch lock poisoned")]
    LockPoisoned,
    #[error(transparent)]
    Account(#[from] account::AccountError),
    #[error(transparent)]
    Store(#[from] store::Error),
}

pub struct Branch {
    name: String,
    store: Mutex<BranchStore>,
    replicator: Replicator,
}

impl Branch {
    /// Open (or create) the branch database, optionally seed sample
    /// accounts, and abort any transactions left pending by a crash.
    /// Callers start accepting connections only after this returns.
    pub fn open(
        name: &str,
        db_path: impl AsRef<Path>,
        preload: bool,
        replicas: Vec<(String, u16)>,
    ) -> Result<Self, Error> {
        let branch = Self {
            name: name.to_string(),
            store: Mutex::new(BranchStore::open(db_path)?),
            replicator: Replicator::new(replicas),
        };
        if preload {
            branch.preload()?;
        }
        branch.recover_pending()?;
        Ok(branch)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> Result<MutexGuard<'_, BranchStore>, Error> {
        self.store.lock().map_err(|_| Error::LockPoisoned)
    }

    fn preload(&self) -> Result<(), Error> {
        let store = self.state()?;
        if !store.accounts()?.is_empty() {
            return Ok(());
        }
        for i in 1..=2u32 {
            let account_no = (1000 + i).to_string();
            let account = Account::new(format!("User_{}_{}", self.name, i), Value::from(1000));
            store.put_account(&account_no, &account)?;
        }
        Ok(())
    }

    /// Presumed-abort: every pending row from a previous run is aborted,
    /// returning any withdraw reservation to the spendable balance.
    fn recover_pending(&self) -> Result<(), Error> {
        let store = self.state()?;
        let rows = store.pending_all()?;
        if rows.is_empty() {
            return Ok(());
        }
        info!(
            branch = %self.name,
            count = rows.len(),
            "aborting transactions left pending by previous run"
        );
        for (txid, row) in rows {
            info!(
                branch = %self.name,
                txid = %txid,
                kind = ?row.kind,
                account = %row.account_no,
                "presumed abort"
            );
            clear_pending(&store, &txid, None)?;
        }
        Ok(())
    }

    fn queue_replication(&self, store: &BranchStore, write: ReplicatedWrite) {
        if self.replicator.is_disabled() {
            return;
        }
        match store.next_repl_seq() {
            Ok(seq) => self.replicator.enqueue(Replicate {
                origin: self.name.clone(),
                seq,
                write,
            }),
            Err(e) => tracing::warn!(error = %e, "failed to assign replication sequence"),
        }
    }

    // Immediate operations.

    pub fn create_account(&self, p: CreateAccount) -> Result<&'static str, Error> {
        if p.account_no.is_empty() {
            return Err(Error::MissingAccountNo);
        }
        if p.balance < Value::ZERO {
            return Err(Error::InvalidAmount);
        }
        let store = self.state()?;
        if store.account(&p.account_no)?.is_some() {
            return Err(Error::AccountExists);
        }
        store.put_account(&p.account_no, &Account::new(p.name.clone(), p.balance))?;
        self.queue_replication(&store, ReplicatedWrite::CreateAccount(p));
        Ok("account created")
    }

    pub fn list_accounts(&self) -> Result<Vec<AccountSummary>, Error> {
        let store = self.state()?;
        Ok(store
            .accounts()?
            .into_iter()
            .map(|(account_no, account)| AccountSummary {
                account_no,
                name: account.name,
                balance: account.balance,
            })
            .collect())
    }

    pub fn balance(&self, p: &BalanceQuery) -> Result<BalanceInfo, Error> {
        if p.account_no.is_empty() {
            return Err(Error::MissingAccountNo);
        }
        let store = self.state()?;
        let account = store.account(&p.account_no)?.ok_or(Error::AccountNotFound)?;
        Ok(BalanceInfo {
            balance: account.balance,
            name: account.name,
        })
    }

    pub fn deposit(&self, p: AccountAmount) -> Result<NewBalance, Error> {
        validate_amount(&p)?;
        let store = self.state()?;
        let account = store.account(&p.account_no)?.ok_or(Error::AccountNotFound)?;
        let updated = account.deposit(p.amount);
        store.put_account(&p.account_no, &updated)?;
        let balance = updated.balance;
        self.queue_replication(&store, ReplicatedWrite::Deposit(p));
        Ok(NewBalance { balance })
    }

    pub fn withdraw(&self, p: AccountAmount) -> Result<NewBalance, Error> {
        validate_amount(&p)?;
        let store = self.state()?;
        let account = store.account(&p.account_no)?.ok_or(Error::AccountNotFound)?;
        let updated = account.withdraw(p.amount)?;
        store.put_account(&p.account_no, &updated)?;
        let balance = updated.balance;
        self.queue_replication(&store, ReplicatedWrite::Withdraw(p));
        Ok(NewBalance { balance })
    }

    /// Debit source then credit destination under one lock hold, fully
    /// atomic within the branch.
    pub fn local_transfer(&self, p: LocalTransfer) -> Result<LocalTransferReceipt, Error> {
        if p.src_account_no.is_empty() || p.dest_account_no.is_empty() {
            return Err(Error::MissingAccountNo);
        }
        if p.amount < Value::ZERO {
            return Err(Error::InvalidAmount);
        }
        let store = self.state()?;
        let src = store
            .account(&p.src_account_no)?
            .ok_or(Error::SourceAccountNotFound)?;
        if store.account(&p.dest_account_no)?.is_none() {
            return Err(Error::DestAccountNotFound);
        }
        let debited = src.withdraw(p.amount)?;
        store.put_account(&p.src_account_no, &debited)?;
        // Reload: source and destination may be the same row.
        let dest = store
            .account(&p.dest_account_no)?
            .ok_or(Error::DestAccountNotFound)?;
        let credited = dest.deposit(p.amount);
        store.put_account(&p.dest_account_no, &credited)?;
        let from_balance = if p.src_account_no == p.dest_account_no {
            credited.balance
        } else {
            debited.balance
        };
        self.queue_replication(
            &store,
            ReplicatedWrite::Withdraw(AccountAmount {
                account_no: p.src_account_no.clone(),
                amount: p.amount,
            }),
        );
        self.queue_replication(
            &store,
            ReplicatedWrite::Deposit(AccountAmount {
                account_no: p.dest_account_no.clone(),
                amount: p.amount,
            }),
        );
        Ok(LocalTransferReceipt {
            from: TransferLeg {
                account: p.src_account_no,
                balance: from_balance,
            },
            to: TransferLeg {
                account: p.dest_account_no,
                balance: credited.balance,
            },
            amount: p.amount,
        })
    }

    // 2PC participant: withdraw half.

    /// Journal the intent and reserve the funds. An `ok` return is the
    /// yes-vote; the reservation guarantees the later commit cannot race
    /// an immediate withdrawal.
    pub fn prepare_withdraw(&self, p: Prepare) -> Result<(), Error> {
        validate_prepare(&p)?;
        let store = self.state()?;
        // One pending row per txid: a re-prepare replaces whatever leg was
        // journaled before, so both legs of one transfer cannot coexist on
        // a single branch. A transfer whose source and destination are the
        // same branch therefore fails at commit; callers route those
        // through local_transfer.
        clear_pending(&store, &p.txid, None)?;
        let account = store.account(&p.account_no)?.ok_or(Error::AccountNotFound)?;
        let reserved = account.reserve(p.amount)?;
        store.put_account(&p.account_no, &reserved)?;
        store.put_pending(
            &p.txid,
            &PendingTx {
                account_no: p.account_no,
                amount: p.amount,
                kind: TxKind::Withdraw,
            },
        )?;
        Ok(())
    }

    pub fn commit_withdraw(&self, p: &TxRef) -> Result<(), Error> {
        if p.txid.is_empty() {
            return Err(Error::MissingTxid);
        }
        let store = self.state()?;
        let row = match store.pending(&p.txid)? {
            Some(row) if row.kind == TxKind::Withdraw => row,
            _ => return Err(Error::NoSuchTx),
        };
        let Some(account) = store.account(&row.account_no)? else {
            store.remove_pending(&p.txid)?;
            return Err(Error::AccountNotFound);
        };
        let Ok(updated) = account.capture(row.amount) else {
            store.remove_pending(&p.txid)?;
            return Err(Error::InsufficientFundsAtCommit);
        };
        store.put_account(&row.account_no, &updated)?;
        store.remove_pending(&p.txid)?;
        self.queue_replication(
            &store,
            ReplicatedWrite::Withdraw(AccountAmount {
                account_no: row.account_no,
                amount: row.amount,
            }),
        );
        Ok(())
    }

    pub fn abort_withdraw(&self, p: &TxRef) -> Result<(), Error> {
        if p.txid.is_empty() {
            return Err(Error::MissingTxid);
        }
        let store = self.state()?;
        clear_pending(&store, &p.txid, Some(TxKind::Withdraw))?;
        Ok(())
    }

    // 2PC participant: deposit half.

    pub fn prepare_deposit(&self, p: Prepare) -> Result<(), Error> {
        validate_prepare(&p)?;
        let store = self.state()?;
        // Same one-row-per-txid rule as prepare_withdraw: this releases
        // and replaces any withdraw leg journaled under the same txid.
        clear_pending(&store, &p.txid, None)?;
        if store.account(&p.account_no)?.is_none() {
            return Err(Error::DestAccountNotFound);
        }
        store.put_pending(
            &p.txid,
            &PendingTx {
                account_no: p.account_no,
                amount: p.amount,
                kind: TxKind::Deposit,
            },
        )?;
        Ok(())
    }

    pub fn commit_deposit(&self, p: &TxRef) -> Result<(), Error> {
        if p.txid.is_empty() {
            return Err(Error::MissingTxid);
        }
        let store = self.state()?;
        let row = match store.pending(&p.txid)? {
            Some(row) if row.kind == TxKind::Deposit => row,
            _ => return Err(Error::NoSuchTx),
        };
        let Some(account) = store.account(&row.account_no)? else {
            store.remove_pending(&p.txid)?;
            return Err(Error::AccountNotFound);
        };
        store.put_account(&row.account_no, &account.deposit(row.amount))?;
        store.remove_pending(&p.txid)?;
        self.queue_replication(
            &store,
            ReplicatedWrite::Deposit(AccountAmount {
                account_no: row.account_no,
                amount: row.amount,
            }),
        );
        Ok(())
    }

    pub fn abort_deposit(&self, p: &TxRef) -> Result<(), Error> {
        if p.txid.is_empty() {
            return Err(Error::MissingTxid);
        }
        let store = self.state()?;
        clear_pending(&store, &p.txid, Some(TxKind::Deposit))?;
        Ok(())
    }

    // Replica side.

    /// Apply a write replicated from an authoritative peer. Messages at or
    /// below the last applied sequence for the origin are dropped, so the
    /// sender's retry loop cannot double-apply.
    pub fn apply_replicate(&self, p: Replicate) -> Result<(), Error> {
        let store = self.state()?;
        let last = store.applied_seq(&p.origin)?;
        if p.seq <= last {
            debug!(origin = %p.origin, seq = p.seq, "duplicate replication message ignored");
            return Ok(());
        }
        match p.write {
            ReplicatedWrite::CreateAccount(c) => {
                if store.account(&c.account_no)?.is_none() {
                    store.put_account(&c.account_no, &Account::new(c.name, c.balance))?;
                }
            }
            ReplicatedWrite::Deposit(w) => {
                if let Some(account) = store.account(&w.account_no)? {
                    store.put_account(&w.account_no, &account.deposit(w.amount))?;
                }
            }
            ReplicatedWrite::Withdraw(w) => {
                if let Some(account) = store.account(&w.account_no)? {
                    store.put_account(&w.account_no, &account.debit(w.amount))?;
                }
            }
        }
        store.set_applied_seq(&p.origin, p.seq)?;
        Ok(())
    }
}

fn validate_amount(p: &AccountAmount) -> Result<(), Error> {
    if p.account_no.is_empty() {
        return Err(Error::MissingAccountNo);
    }
    if p.amount < Value::ZERO {
        return Err(Error::InvalidAmount);
    }
    Ok(())
}

fn validate_prepare(p: &Prepare) -> Result<(), Error> {
    if p.txid.is_empty() {
        return Err(Error::MissingTxid);
    }
    if p.account_no.is_empty() {
        return Err(Error::MissingAccountNo);
    }
    if p.amount < Value::ZERO {
        return Err(Error::InvalidAmount);
    }
    Ok(())
}

/// Remove the pending row for `txid` if present (and, when `kind` is
/// given, only if the row matches it), returning any withdraw reservation
/// to the account first. Absent rows are fine: abort is idempotent.
fn clear_pending(store: &BranchStore, txid: &str, kind: Option<TxKind>) -> Result<(), Error> {
    let Some(row) = store.pending(txid)? else {
        return Ok(());
    };
    if let Some(kind) = kind {
        if row.kind != kind {
            return Ok(());
        }
    }
    if row.kind == TxKind::Withdraw {
        if let Some(account) = store.account(&row.account_no)? {
            store.put_account(&row.account_no, &account.release(row.amount))?;
        }
    }
    store.remove_pending(txid)?;
    Ok(())
}
