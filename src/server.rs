//! TCP front end: accept, spawn a worker per connection, read one request
//! frame, dispatch, write one response frame, close.

use std::io;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;

use serde::Serialize;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use crate::branch::Branch;
use crate::coordinator;
use crate::proto::{self, Request, Response};

const BACKLOG: i32 = 50;

/// Build the listener with `SO_REUSEADDR` so a restarted branch can
/// rebind its port immediately.
pub fn bind(host: &str, port: u16) -> io::Result<TcpListener> {
    let addr = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "listen address did not resolve"))?;
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    Ok(socket.into())
}

pub fn serve(branch: Arc<Branch>, listener: TcpListener) -> io::Result<()> {
    info!(
        branch = %branch.name(),
        addr = %listener.local_addr()?,
        "branch listening"
    );
    for conn in listener.incoming() {
        match conn {
            Ok(stream) => {
                let branch = Arc::clone(&branch);
                thread::spawn(move || handle(branch, stream));
            }
            Err(e) => warn!(error = %e, "failed to accept connection"),
        }
    }
    Ok(())
}

fn handle(branch: Arc<Branch>, mut stream: TcpStream) {
    let response = match read_request(&mut stream) {
        Ok(req) => dispatch(&branch, req),
        Err(e) => Response::error(e.to_string()),
    };
    if let Err(e) = proto::write_message(&mut stream, &response) {
        debug!(error = %e, "dropping response for disconnected client");
    }
}

fn read_request(stream: &mut TcpStream) -> Result<Request, proto::Error> {
    stream.set_read_timeout(Some(proto::READ_TIMEOUT))?;
    let env: proto::Envelope = proto::read_message(stream)?;
    Request::from_envelope(env)
}

pub fn dispatch(branch: &Branch, req: Request) -> Response {
    match req {
        Request::CreateAccount(p) => respond(branch.create_account(p)),
        Request::ListAccounts => respond(branch.list_accounts()),
        Request::Balance(p) => respond(branch.balance(&p)),
        Request::Deposit(p) => respond(branch.deposit(p)),
        Request::Withdraw(p) => respond(branch.withdraw(p)),
        Request::LocalTransfer(p) => respond(branch.local_transfer(p)),
        Request::InterBranchTransfer(p) => respond(coordinator::inter_branch_transfer(branch, p)),
        Request::PrepareWithdraw(p) => acked(branch.prepare_withdraw(p)),
        Request::CommitWithdraw(p) => acked(branch.commit_withdraw(&p)),
        Request::AbortWithdraw(p) => acked(branch.abort_withdraw(&p)),
        Request::PrepareDeposit(p) => acked(branch.prepare_deposit(p)),
        Request::CommitDeposit(p) => acked(branch.commit_deposit(&p)),
        Request::AbortDeposit(p) => acked(branch.abort_deposit(&p)),
        Request::Replicate(p) => acked(branch.apply_replicate(p)),
    }
}

fn respond<T: Serialize, E: std::fmt::Display>(outcome: Result<T, E>) -> Response {
    match outcome {
        Ok(result) => Response::ok(result),
        Err(e) => Response::error(e.to_string()),
    }
}

fn acked<E: std::fmt::Display>(outcome: Result<(), E>) -> Response {
    match outcome {
        Ok(()) => Response::ack(),
        Err(e) => Response::error(e.to_string()),
    }
}
