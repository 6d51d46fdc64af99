use std::fmt::Display;
use std::str::FromStr;

use clap::Parser;

/// A `host port` pair, as carried by `--replicaof` and resolved against the
/// wire address a replica announces in `REPLCONF listening-port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding(pub String, pub u16);

impl Display for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.0, self.1)
    }
}

impl FromStr for Binding {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let mut parts = s.split(' ');
        let host = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("invalid replicaof value: {:?}", s))?;
        let port = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("missing port in replicaof value: {:?}", s))?
            .parse::<u16>()?;
        Ok(Binding(host.to_string(), port))
    }
}

/// CLI surface, parsed with clap's derive API per §10.1 of the design spec.
#[derive(Debug, Parser)]
#[command(name = "rdrs", about = "A minimal RESP-speaking key/value server")]
pub struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 6379)]
    pub port: u16,

    /// "<host> <port>" of the master to replicate from; absence selects master role.
    #[arg(long)]
    pub replicaof: Option<Binding>,

    /// Directory used to locate the RDB snapshot file.
    #[arg(long, default_value = "/tmp/redis-data")]
    pub dir: String,

    /// RDB snapshot filename within `dir`.
    #[arg(long, default_value = "rdbfile")]
    pub dbfilename: String,

    /// Raise log verbosity; repeatable (warn -> info -> debug -> trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
