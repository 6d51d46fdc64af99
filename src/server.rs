//! Shared server context: identity, configuration, and the keyspace handle
//! every connection task works against.

use std::sync::RwLock;

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::args::{Args, Binding};
use crate::replication::ReplicationState;
use crate::store::KvStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Slave,
}

/// The subset of configuration and identity that `INFO`/`CONFIG GET` expose,
/// split out from `Server` so it can be constructed independently of the
/// keyspace and replica registry.
pub struct ServerInfo {
    pub role: Role,
    pub port: u16,
    pub master_of: Option<Binding>,
    pub master_replid: String,
    pub dir: String,
    pub dbfilename: String,
}

impl ServerInfo {
    pub fn from_args(args: &Args) -> Self {
        let role = match &args.replicaof {
            Some(_) => Role::Slave,
            None => Role::Master,
        };
        ServerInfo {
            role,
            port: args.port,
            master_of: args.replicaof.clone(),
            master_replid: random_replid(),
            dir: args.dir.clone(),
            dbfilename: args.dbfilename.clone(),
        }
    }
}

/// A 40 character hex-looking id, matching the shape (if not the exact
/// alphabet a real master uses) of `run_id`/`replid` in upstream Redis.
fn random_replid() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(40)
        .map(char::from)
        .collect()
}

pub struct Server {
    pub info: ServerInfo,
    pub store: RwLock<KvStore>,
    pub repl: ReplicationState,
}

impl Server {
    pub fn new(info: ServerInfo, store: KvStore) -> Self {
        Server {
            info,
            store: RwLock::new(store),
            repl: ReplicationState::new(),
        }
    }

    /// The `# Replication` section of `INFO`. Formatted by hand rather than
    /// through a templating crate since it's a handful of fixed fields.
    pub fn info_replication_section(&self) -> String {
        let role = match self.info.role {
            Role::Master => "master",
            Role::Slave => "slave",
        };
        let offset = self.repl.master_repl_offset();
        format!(
            "# Replication\r\nrole:{}\r\nmaster_replid:{}\r\nmaster_repl_offset:{}\r\n",
            role, self.info.master_replid, offset
        )
    }
}
