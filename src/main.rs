use clap::Parser;
use std::sync::Arc;
use thiserror::Error;

use teller::branch::{self, Branch};
use teller::server;

/// Run one branch of the federated bank: a TCP server owning a disjoint
/// set of accounts, persisting them in `<name>.db` in the working
/// directory and optionally streaming committed writes to replica peers.
#[derive(Parser)]
struct Cmd {
    /// Interface to listen on
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// Port to listen on
    #[arg(long)]
    port: u16,
    /// Branch name, also the database filename stem
    #[arg(long)]
    name: String,
    /// Seed two sample accounts if the branch has none
    #[arg(long)]
    preload: bool,
    /// Replica endpoint as host:port; repeat for several replicas
    #[arg(long = "replica", value_name = "HOST:PORT")]
    replicas: Vec<String>,
}

#[derive(Debug, Error)]
enum Error {
    #[error(transparent)]
    Branch(#[from] branch::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid replica endpoint '{0}', expected host:port")]
    Replica(String),
}

impl Cmd {
    fn exec(self) -> Result<(), Error> {
        let replicas = self
            .replicas
            .iter()
            .map(|s| parse_replica(s))
            .collect::<Result<Vec<_>, _>>()?;
        let branch = Arc::new(Branch::open(
            &self.name,
            format!("{}.db", self.name),
            self.preload,
            replicas,
        )?);
        let listener = server::bind(&self.host, self.port)?;
        server::serve(branch, listener)?;
        Ok(())
    }
}

fn parse_replica(s: &str) -> Result<(String, u16), Error> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| Error::Replica(s.to_string()))?;
    let port = port.parse().map_err(|_| Error::Replica(s.to_string()))?;
    if host.is_empty() {
        return Err(Error::Replica(s.to_string()));
    }
    Ok((host.to_string(), port))
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "teller=info".into()),
        )
        .init();
    Cmd::parse().exec()
}
