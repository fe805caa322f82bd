//! 2PC coordinator. The source branch drives a transfer across its own
//! participant (in-process) and the destination participant (over the
//! wire): prepare local withdraw, prepare remote deposit, commit local,
//! commit remote. Every remote failure before the local commit unwinds
//! via the matching abort; a remote failure after it is the protocol's
//! known inconsistency window and is surfaced as a hard error.

use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

use crate::branch::Branch;
use crate::common::*;
use crate::proto::{
    self, InterBranchTransfer, Prepare, Request, TransferReceipt, TxRef, RPC_TIMEOUT,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("missing parameters")]
    MissingParameters,
    #[error("invalid amount")]
    InvalidAmount,
    #[error("local prepare failed: {0}")]
    LocalPrepareFailed(String),
    #[error("destination prepare failed: {0}")]
    DestinationPrepareFailed(String),
    #[error("local commit failed: {0}")]
    LocalCommitFailed(String),
    #[error("remote commit failed: {0}")]
    RemoteCommitFailed(String),
}

pub fn inter_branch_transfer(
    branch: &Branch,
    p: InterBranchTransfer,
) -> Result<TransferReceipt, Error> {
    if p.src_account_no.is_empty()
        || p.dest_host.is_empty()
        || p.dest_account_no.is_empty()
        || p.dest_port == 0
    {
        return Err(Error::MissingParameters);
    }
    if p.amount < Value::ZERO {
        return Err(Error::InvalidAmount);
    }

    let txid: TxId = format!("{}-{}", branch.name(), Uuid::new_v4().simple());
    info!(
        txid = %txid,
        src = %p.src_account_no,
        dest = %format!("{}:{}/{}", p.dest_host, p.dest_port, p.dest_account_no),
        "starting inter-branch transfer"
    );

    // Phase one: collect both votes, journaling intent on each side.
    branch
        .prepare_withdraw(Prepare {
            txid: txid.clone(),
            account_no: p.src_account_no.clone(),
            amount: p.amount,
        })
        .map_err(|e| Error::LocalPrepareFailed(e.to_string()))?;

    let resp = proto::send_request(
        &p.dest_host,
        p.dest_port,
        &Request::PrepareDeposit(Prepare {
            txid: txid.clone(),
            account_no: p.dest_account_no.clone(),
            amount: p.amount,
        }),
        RPC_TIMEOUT,
    );
    if !resp.is_ok() {
        let _ = branch.abort_withdraw(&TxRef { txid: txid.clone() });
        return Err(Error::DestinationPrepareFailed(resp.to_string()));
    }

    // Phase two: local first. The local half is cheaper to unwind while
    // its pending row still exists.
    if let Err(e) = branch.commit_withdraw(&TxRef { txid: txid.clone() }) {
        let _ = proto::send_request(
            &p.dest_host,
            p.dest_port,
            &Request::AbortDeposit(TxRef { txid: txid.clone() }),
            RPC_TIMEOUT,
        );
        return Err(Error::LocalCommitFailed(e.to_string()));
    }

    let resp = proto::send_request(
        &p.dest_host,
        p.dest_port,
        &Request::CommitDeposit(TxRef { txid: txid.clone() }),
        RPC_TIMEOUT,
    );
    if !resp.is_ok() {
        // The local debit is already durable and the destination never
        // credited; the operator must reconcile out of band.
        error!(txid = %txid, "remote commit failed after local commit");
        let _ = proto::send_request(
            &p.dest_host,
            p.dest_port,
            &Request::AbortDeposit(TxRef { txid: txid.clone() }),
            RPC_TIMEOUT,
        );
        return Err(Error::RemoteCommitFailed(resp.to_string()));
    }

    info!(txid = %txid, "transfer complete");
    Ok(TransferReceipt {
        status: "transfer_complete".into(),
        txid,
        amount: p.amount,
        from: format!("{}:{}", branch.name(), p.src_account_no),
        to: format!("{}:{}", p.dest_host, p.dest_account_no),
    })
}
