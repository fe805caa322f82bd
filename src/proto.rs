//! Wire protocol: one 4-byte big-endian length prefix followed by a UTF-8
//! JSON document, one request and one response per connection.
//!
//! Requests arrive as `{"action": <string>, "params": <object>}` and are
//! lifted into the typed [`Request`] enum in two stages so that an unknown
//! action and a malformed parameter object produce distinct errors. Extra
//! fields in `params` are ignored.

use std::fmt;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use thiserror::Error;

use crate::common::*;

/// Inbound read deadline for a single request frame.
pub const READ_TIMEOUT: Duration = Duration::from_secs(10);
/// Outbound deadline for one remote call during 2PC.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(5);
/// Frames above this size are rejected before any allocation.
pub const MAX_FRAME: u32 = 1 << 20;

#[derive(Debug, Error)]
pub enum Error {
    #[error("short read")]
    ShortRead,
    #[error("read timed out")]
    Timeout,
    #[error("frame of {0} bytes exceeds limit")]
    Oversized(u32),
    #[error("unknown action {0}")]
    UnknownAction(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// The untyped request envelope as it appears on the wire.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    pub action: String,
    #[serde(default)]
    pub params: Json,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateAccount {
    pub account_no: AccountNo,
    #[serde(default)]
    pub name: String,
    #[serde(default, with = "rust_decimal::serde::float")]
    pub balance: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BalanceQuery {
    pub account_no: AccountNo,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccountAmount {
    pub account_no: AccountNo,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocalTransfer {
    pub src_account_no: AccountNo,
    pub dest_account_no: AccountNo,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InterBranchTransfer {
    pub src_account_no: AccountNo,
    pub dest_host: String,
    pub dest_port: u16,
    pub dest_account_no: AccountNo,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Prepare {
    pub txid: TxId,
    pub account_no: AccountNo,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TxRef {
    pub txid: TxId,
}

/// The subset of writes a primary streams to its replicas. The sequence
/// number is monotonic per origin branch; replicas drop anything at or
/// below the last applied sequence, which makes the retry loop safe.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Replicate {
    pub origin: String,
    pub seq: u64,
    #[serde(flatten)]
    pub write: ReplicatedWrite,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "params", rename_all = "snake_case")]
pub enum ReplicatedWrite {
    CreateAccount(CreateAccount),
    Deposit(AccountAmount),
    Withdraw(AccountAmount),
}

/// Every operation a branch answers, one variant per wire action.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "action", content = "params", rename_all = "snake_case")]
pub enum Request {
    CreateAccount(CreateAccount),
    ListAccounts,
    Balance(BalanceQuery),
    Deposit(AccountAmount),
    Withdraw(AccountAmount),
    LocalTransfer(LocalTransfer),
    InterBranchTransfer(InterBranchTransfer),
    PrepareWithdraw(Prepare),
    CommitWithdraw(TxRef),
    AbortWithdraw(TxRef),
    PrepareDeposit(Prepare),
    CommitDeposit(TxRef),
    AbortDeposit(TxRef),
    Replicate(Replicate),
}

impl Request {
    pub fn from_envelope(env: Envelope) -> Result<Self, Error> {
        fn p<T: DeserializeOwned>(params: Json) -> Result<T, Error> {
            Ok(serde_json::from_value(params)?)
        }
        match env.action.as_str() {
            "create_account" => Ok(Request::CreateAccount(p(env.params)?)),
            "list_accounts" => Ok(Request::ListAccounts),
            "balance" => Ok(Request::Balance(p(env.params)?)),
            "deposit" => Ok(Request::Deposit(p(env.params)?)),
            "withdraw" => Ok(Request::Withdraw(p(env.params)?)),
            "local_transfer" => Ok(Request::LocalTransfer(p(env.params)?)),
            "inter_branch_transfer" => Ok(Request::InterBranchTransfer(p(env.params)?)),
            "prepare_withdraw" => Ok(Request::PrepareWithdraw(p(env.params)?)),
            "commit_withdraw" => Ok(Request::CommitWithdraw(p(env.params)?)),
            "abort_withdraw" => Ok(Request::AbortWithdraw(p(env.params)?)),
            "prepare_deposit" => Ok(Request::PrepareDeposit(p(env.params)?)),
            "commit_deposit" => Ok(Request::CommitDeposit(p(env.params)?)),
            "abort_deposit" => Ok(Request::AbortDeposit(p(env.params)?)),
            "replicate" => Ok(Request::Replicate(p(env.params)?)),
            other => Err(Error::UnknownAction(other.to_string())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Response {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Json>,
    },
    Error {
        error: String,
    },
}

impl Response {
    pub fn ok(result: impl Serialize) -> Self {
        match serde_json::to_value(result) {
            Ok(v) => Response::Ok { result: Some(v) },
            Err(e) => Response::error(e.to_string()),
        }
    }

    /// A bare `{"status": "ok"}` with no result payload.
    pub fn ack() -> Self {
        Response::Ok { result: None }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Response::Error { error: msg.into() }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok { .. })
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(s) => f.write_str(&s),
            Err(_) => f.write_str(r#"{"status":"error"}"#),
        }
    }
}

// Result payloads.

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccountSummary {
    pub account_no: AccountNo,
    pub name: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub balance: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BalanceInfo {
    #[serde(with = "rust_decimal::serde::float")]
    pub balance: Value,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewBalance {
    #[serde(with = "rust_decimal::serde::float")]
    pub balance: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransferLeg {
    pub account: AccountNo,
    #[serde(with = "rust_decimal::serde::float")]
    pub balance: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocalTransferReceipt {
    pub from: TransferLeg,
    pub to: TransferLeg,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub status: String,
    pub txid: TxId,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Value,
    pub from: String,
    pub to: String,
}

// Framing.

pub fn write_message<W: Write>(w: &mut W, msg: &impl Serialize) -> Result<(), Error> {
    let body = serde_json::to_vec(msg)?;
    let len = u32::try_from(body.len()).map_err(|_| Error::Oversized(u32::MAX))?;
    if len > MAX_FRAME {
        return Err(Error::Oversized(len));
    }
    w.write_all(&len.to_be_bytes())?;
    w.write_all(&body)?;
    w.flush()?;
    Ok(())
}

pub fn read_message<R: Read, T: DeserializeOwned>(r: &mut R) -> Result<T, Error> {
    let mut prefix = [0u8; 4];
    read_exact(r, &mut prefix)?;
    let len = u32::from_be_bytes(prefix);
    if len > MAX_FRAME {
        return Err(Error::Oversized(len));
    }
    let mut body = vec![0u8; len as usize];
    read_exact(r, &mut body)?;
    Ok(serde_json::from_slice(&body)?)
}

fn read_exact<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<(), Error> {
    r.read_exact(buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => Error::ShortRead,
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => Error::Timeout,
        _ => Error::Io(e),
    })
}

/// Connect, send one request, read one response. Transport failures come
/// back as an error response rather than propagating: the callers of this
/// (coordinator, replicator) treat any failure as a no-vote.
pub fn send_request(host: &str, port: u16, req: &Request, timeout: Duration) -> Response {
    match call(host, port, req, timeout) {
        Ok(resp) => resp,
        Err(Error::ShortRead) => Response::error("no response"),
        Err(e) => Response::error(e.to_string()),
    }
}

fn call(host: &str, port: u16, req: &Request, timeout: Duration) -> Result<Response, Error> {
    let addr = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "address did not resolve"))?;
    let mut stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    write_message(&mut stream, req)?;
    read_message(&mut stream)
}
