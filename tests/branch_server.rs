//! End-to-end tests: real branches on loopback ports talking the framed
//! JSON protocol, including inter-branch 2PC and replication.

use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Value as Json};

use teller::branch::Branch;
use teller::common::Value;
use teller::proto::{
    self, AccountAmount, BalanceQuery, CreateAccount, InterBranchTransfer, LocalTransfer, Request,
    Response,
};
use teller::server;

const CALL_TIMEOUT: Duration = Duration::from_secs(5);

fn spawn_branch(name: &str, replicas: Vec<(String, u16)>) -> (Arc<Branch>, u16, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let branch = Arc::new(
        Branch::open(name, dir.path().join(format!("{name}.db")), true, replicas).unwrap(),
    );
    let listener = server::bind("127.0.0.1", 0).unwrap();
    let port = listener.local_addr().unwrap().port();
    let serving = Arc::clone(&branch);
    thread::spawn(move || server::serve(serving, listener));
    (branch, port, dir)
}

/// A port that nothing is listening on.
fn dead_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn call(port: u16, req: &Request) -> Response {
    proto::send_request("127.0.0.1", port, req, CALL_TIMEOUT)
}

fn result(resp: Response) -> Json {
    match resp {
        Response::Ok { result } => result.unwrap_or(Json::Null),
        Response::Error { error } => panic!("unexpected error response: {error}"),
    }
}

fn error(resp: Response) -> String {
    match resp {
        Response::Error { error } => error,
        Response::Ok { result } => panic!("unexpected ok response: {result:?}"),
    }
}

fn balance(port: u16, account_no: &str) -> Json {
    result(call(
        port,
        &Request::Balance(BalanceQuery {
            account_no: account_no.into(),
        }),
    ))
}

fn deposit(account_no: &str, n: i64) -> Request {
    Request::Deposit(AccountAmount {
        account_no: account_no.into(),
        amount: Value::from(n),
    })
}

fn withdraw(account_no: &str, n: i64) -> Request {
    Request::Withdraw(AccountAmount {
        account_no: account_no.into(),
        amount: Value::from(n),
    })
}

fn transfer(src: &str, dest_port: u16, dest: &str, n: i64) -> Request {
    Request::InterBranchTransfer(InterBranchTransfer {
        src_account_no: src.into(),
        dest_host: "127.0.0.1".into(),
        dest_port,
        dest_account_no: dest.into(),
        amount: Value::from(n),
    })
}

/// Replication runs on a background dispatcher; poll until the predicate
/// holds or give up.
fn wait_for(mut pred: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if pred() {
            return;
        }
        thread::sleep(Duration::from_millis(50));
    }
    panic!("condition not reached within deadline");
}

#[test]
fn test_preloaded_balance() {
    let (_branch, port, _dir) = spawn_branch("A", Vec::new());
    let info = balance(port, "1001");
    assert_eq!(info, json!({"balance": 1000.0, "name": "User_A_1"}));
}

#[test]
fn test_deposit_then_balance() {
    let (_branch, port, _dir) = spawn_branch("A", Vec::new());
    let out = result(call(port, &deposit("1001", 250)));
    assert_eq!(out, json!({"balance": 1250.0}));
    assert_eq!(balance(port, "1001")["balance"], json!(1250.0));
}

#[test]
fn test_overdraw_is_rejected() {
    let (_branch, port, _dir) = spawn_branch("A", Vec::new());
    let err = error(call(port, &withdraw("1001", 5000)));
    assert_eq!(err, "insufficient funds");
    assert_eq!(balance(port, "1001")["balance"], json!(1000.0));
}

#[test]
fn test_local_transfer_over_the_wire() {
    let (_branch, port, _dir) = spawn_branch("A", Vec::new());
    let out = result(call(
        port,
        &Request::LocalTransfer(LocalTransfer {
            src_account_no: "1001".into(),
            dest_account_no: "1002".into(),
            amount: Value::from(250),
        }),
    ));
    assert_eq!(out["from"]["balance"], json!(750.0));
    assert_eq!(out["to"]["balance"], json!(1250.0));
    assert_eq!(out["amount"], json!(250.0));
}

#[test]
fn test_list_accounts() {
    let (_branch, port, _dir) = spawn_branch("A", Vec::new());
    let out = result(call(port, &Request::ListAccounts));
    let accounts = out.as_array().unwrap();
    assert_eq!(accounts.len(), 2);
    assert!(accounts.iter().any(|a| a["account_no"] == "1001"));
}

#[test]
fn test_create_account_over_the_wire() {
    let (_branch, port, _dir) = spawn_branch("A", Vec::new());
    let out = result(call(
        port,
        &Request::CreateAccount(CreateAccount {
            account_no: "2001".into(),
            name: "Marge".into(),
            balance: Value::from(75),
        }),
    ));
    assert_eq!(out, json!("account created"));
    assert_eq!(balance(port, "2001"), json!({"balance": 75.0, "name": "Marge"}));
}

#[test]
fn test_inter_branch_transfer_moves_funds() {
    let (_a, port_a, _da) = spawn_branch("A", Vec::new());
    let (_b, port_b, _db) = spawn_branch("B", Vec::new());

    let out = result(call(port_a, &transfer("1001", port_b, "1001", 300)));
    assert_eq!(out["status"], "transfer_complete");
    assert_eq!(out["amount"], json!(300.0));

    assert_eq!(balance(port_a, "1001")["balance"], json!(700.0));
    assert_eq!(balance(port_b, "1001")["balance"], json!(1300.0));
}

#[test]
fn test_transfer_to_own_branch_fails_without_losing_money() {
    // Both legs of a transfer share one txid, and a branch keeps a single
    // pending row per txid, so the deposit-prepare on the same branch
    // replaces the withdraw journal entry and the local commit cannot
    // find it. The transfer fails, but every reservation is unwound.
    let (_a, port_a, _da) = spawn_branch("A", Vec::new());

    let err = error(call(port_a, &transfer("1001", port_a, "1002", 300)));
    assert!(
        err.starts_with("local commit failed: "),
        "unexpected error: {err}"
    );
    assert_eq!(balance(port_a, "1001")["balance"], json!(1000.0));
    assert_eq!(balance(port_a, "1002")["balance"], json!(1000.0));
    // No reservation lingers on the source account.
    assert_eq!(result(call(port_a, &withdraw("1001", 1000)))["balance"], json!(0.0));
}

#[test]
fn test_dead_destination_aborts_local_prepare() {
    let (_branch, port_a, _dir) = spawn_branch("A", Vec::new());

    let err = error(call(port_a, &transfer("1001", dead_port(), "1001", 300)));
    assert!(
        err.starts_with("destination prepare failed: "),
        "unexpected error: {err}"
    );

    // The reservation was released and no journal entry remains.
    assert_eq!(balance(port_a, "1001")["balance"], json!(1000.0));
    assert_eq!(result(call(port_a, &withdraw("1001", 1000)))["balance"], json!(0.0));
}

#[test]
fn test_insufficient_funds_fails_before_any_prepare() {
    let (_a, port_a, _da) = spawn_branch("A", Vec::new());
    let (_b, port_b, _db) = spawn_branch("B", Vec::new());

    let err = error(call(port_a, &transfer("1001", port_b, "1001", 99999)));
    assert!(err.starts_with("local prepare failed: "), "unexpected error: {err}");
    assert_eq!(balance(port_a, "1001")["balance"], json!(1000.0));
    assert_eq!(balance(port_b, "1001")["balance"], json!(1000.0));
}

#[test]
fn test_unknown_action_over_the_wire() {
    let (_branch, port, _dir) = spawn_branch("A", Vec::new());
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    proto::write_message(&mut stream, &json!({"action": "fly", "params": {}})).unwrap();
    let resp: Response = proto::read_message(&mut stream).unwrap();
    assert_eq!(error(resp), "unknown action fly");
}

#[test]
fn test_malformed_params_are_a_validation_error() {
    let (_branch, port, _dir) = spawn_branch("A", Vec::new());
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    proto::write_message(&mut stream, &json!({"action": "deposit", "params": {}})).unwrap();
    let resp: Response = proto::read_message(&mut stream).unwrap();
    assert!(error(resp).contains("missing field"));
}

#[test]
fn test_replication_converges() {
    let (_replica, replica_port, _dr) = spawn_branch("R", Vec::new());
    let (_primary, primary_port, _dp) =
        spawn_branch("A", vec![("127.0.0.1".to_string(), replica_port)]);

    result(call(primary_port, &deposit("1001", 100)));
    wait_for(|| balance(replica_port, "1001")["balance"] == json!(1100.0));

    result(call(
        primary_port,
        &Request::CreateAccount(CreateAccount {
            account_no: "3001".into(),
            name: "Newcomer".into(),
            balance: Value::from(10),
        }),
    ));
    wait_for(|| {
        call(
            replica_port,
            &Request::Balance(BalanceQuery {
                account_no: "3001".into(),
            }),
        )
        .is_ok()
    });
    assert_eq!(balance(replica_port, "3001")["balance"], json!(10.0));
}

#[test]
fn test_primary_succeeds_without_replica() {
    // The replica endpoint is dead; the primary's writes must still land.
    let (_primary, primary_port, _dp) =
        spawn_branch("A", vec![("127.0.0.1".to_string(), dead_port())]);
    let out = result(call(primary_port, &deposit("1001", 100)));
    assert_eq!(out["balance"], json!(1100.0));
}

#[test]
fn test_committed_transfer_replicates_both_sides() {
    let (_ra, ra_port, _d1) = spawn_branch("RA", Vec::new());
    let (_rb, rb_port, _d2) = spawn_branch("RB", Vec::new());
    let (_a, port_a, _d3) = spawn_branch("A", vec![("127.0.0.1".to_string(), ra_port)]);
    let (_b, port_b, _d4) = spawn_branch("B", vec![("127.0.0.1".to_string(), rb_port)]);

    result(call(port_a, &transfer("1001", port_b, "1001", 300)));

    wait_for(|| balance(ra_port, "1001")["balance"] == json!(700.0));
    wait_for(|| balance(rb_port, "1001")["balance"] == json!(1300.0));
}
