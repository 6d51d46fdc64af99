//! Command parsing and dispatch (component C3 of the design spec).
//!
//! Each handler is a pure function of `(argv, &Server)` that returns the
//! reply to send and, for `PSYNC` only, a follow-up payload (the RDB
//! snapshot). Handlers never talk to the network directly.

use std::fmt::Display;
use std::str::FromStr;

use tracing::trace;

use crate::error::{RedisError, Result};
use crate::rdb;
use crate::resp::Resp;
use crate::server::Server;
use crate::store::{self, StreamId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Ping,
    Echo,
    Set,
    Get,
    Type,
    Keys,
    Config,
    Info,
    Replconf,
    Psync,
    Wait,
    Xadd,
    Xrange,
    Xread,
}

impl Command {
    /// Mutations are propagated to replicas and counted against the
    /// replication offset; everything else is read-only.
    pub fn is_mutating(&self) -> bool {
        matches!(self, Command::Set | Command::Xadd)
    }
}

impl FromStr for Command {
    type Err = RedisError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.to_uppercase().as_str() {
            "PING" => Command::Ping,
            "ECHO" => Command::Echo,
            "SET" => Command::Set,
            "GET" => Command::Get,
            "TYPE" => Command::Type,
            "KEYS" => Command::Keys,
            "CONFIG" => Command::Config,
            "INFO" => Command::Info,
            "REPLCONF" => Command::Replconf,
            "PSYNC" => Command::Psync,
            "WAIT" => Command::Wait,
            "XADD" => Command::Xadd,
            "XRANGE" => Command::Xrange,
            "XREAD" => Command::Xread,
            other => return Err(RedisError::UnknownCommand(other.to_string())),
        })
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::Ping => "PING",
            Command::Echo => "ECHO",
            Command::Set => "SET",
            Command::Get => "GET",
            Command::Type => "TYPE",
            Command::Keys => "KEYS",
            Command::Config => "CONFIG",
            Command::Info => "INFO",
            Command::Replconf => "REPLCONF",
            Command::Psync => "PSYNC",
            Command::Wait => "WAIT",
            Command::Xadd => "XADD",
            Command::Xrange => "XRANGE",
            Command::Xread => "XREAD",
        };
        write!(f, "{}", name)
    }
}

/// Parses the command name out of an already-framed argv. Returns the
/// command and the remaining arguments.
pub fn parse_command(argv: &[String]) -> Result<(Command, &[String])> {
    match argv.split_first() {
        Some((name, rest)) => Ok((name.parse::<Command>()?, rest)),
        None => Err(RedisError::Protocol("empty command".to_string())),
    }
}

/// What a command produces: the reply plus an optional follow-up payload
/// sent on the same write (only `PSYNC` uses the follow-up, for the RDB
/// snapshot).
pub struct Outcome {
    pub reply: Resp,
    pub followup: Option<Vec<u8>>,
}

impl Outcome {
    fn reply(reply: Resp) -> Self {
        Outcome { reply, followup: None }
    }
}

/// Executes a non-replication, non-blocking command against the keyspace.
/// `PSYNC`, `REPLCONF`, and `WAIT` are handled one level up in
/// [`crate::connection`] and [`crate::replication`] because they need
/// access to the replica registry, which this function is deliberately
/// kept ignorant of so it can be reused verbatim on the replica side.
pub async fn dispatch(server: &Server, cmd: Command, args: &[String]) -> Result<Outcome> {
    trace!(command = %cmd, ?args, "dispatch");
    match cmd {
        Command::Ping => Ok(Outcome::reply(Resp::Simple("PONG".to_string()))),

        Command::Echo => {
            let msg = args.first().cloned().unwrap_or_default();
            Ok(Outcome::reply(Resp::Simple(msg)))
        }

        Command::Set => {
            let (key, value) = match args {
                [k, v, ..] => (k, v),
                _ => return Err(RedisError::Command("wrong number of arguments for 'set'".into())),
            };
            let ttl_ms = parse_px_option(&args[2..])?;
            server.store.write().unwrap().set(key, value, ttl_ms);
            Ok(Outcome::reply(Resp::ok()))
        }

        Command::Get => {
            let key = args.first().ok_or_else(|| missing_args("get"))?;
            let value = server.store.write().unwrap().get(key);
            Ok(Outcome::reply(value.map(Resp::Bulk).unwrap_or(Resp::Null)))
        }

        Command::Type => {
            let key = args.first().ok_or_else(|| missing_args("type"))?;
            let kind = server.store.read().unwrap().type_of(key);
            Ok(Outcome::reply(Resp::Simple(kind.to_string())))
        }

        Command::Keys => Ok(Outcome::reply(Resp::array_of_bulks(
            server.store.read().unwrap().keys(),
        ))),

        Command::Config => {
            let (sub, name) = match args {
                [sub, name, ..] => (sub.to_uppercase(), name.to_lowercase()),
                _ => return Err(RedisError::Command("wrong number of arguments for 'config'".into())),
            };
            if sub != "GET" {
                return Err(RedisError::Command(format!("unsupported CONFIG subcommand {:?}", sub)));
            }
            let value = match name.as_str() {
                "dir" => Some(server.info.dir.clone()),
                "dbfilename" => Some(server.info.dbfilename.clone()),
                _ => None,
            };
            Ok(Outcome::reply(match value {
                Some(v) => Resp::array_of_bulks([name, v]),
                None => Resp::Array(vec![]),
            }))
        }

        Command::Info => Ok(Outcome::reply(Resp::bulk(server.info_replication_section()))),

        // REPLCONF and PSYNC need replica-registry access the dispatcher
        // deliberately doesn't have; the connection loop intercepts them.
        Command::Replconf | Command::Psync | Command::Wait => Err(RedisError::Command(format!(
            "{} must be handled by the connection layer",
            cmd
        ))),

        Command::Xadd => {
            let (key, id, rest) = match args {
                [key, id, rest @ ..] => (key, id, rest),
                _ => return Err(RedisError::Command("wrong number of arguments for 'xadd'".into())),
            };
            let (field, value) = match rest {
                [field, value, ..] => (field, value),
                _ => return Err(RedisError::Command("wrong number of arguments for 'xadd'".into())),
            };
            let result = server.store.write().unwrap().stream_append(key, id, field, value);
            Ok(Outcome::reply(match result {
                Ok(id) => Resp::Simple(id.to_string()),
                Err(RedisError::XaddZero) => Resp::Error(format!("ERR {}", RedisError::XaddZero)),
                Err(RedisError::XaddBackward) => Resp::Error(format!("ERR {}", RedisError::XaddBackward)),
                Err(RedisError::WrongType) => Resp::Simple(RedisError::WrongType.to_string()),
                Err(other) => return Err(other),
            }))
        }

        Command::Xrange => {
            let (key, start, end) = match args {
                [key, start, end, ..] => (key, start, end),
                _ => return Err(RedisError::Command("wrong number of arguments for 'xrange'".into())),
            };
            let store = server.store.read().unwrap();
            match store.last_stream_id(key) {
                Err(RedisError::WrongType) => Ok(Outcome::reply(Resp::Simple(RedisError::WrongType.to_string()))),
                Err(other) => Err(other),
                Ok(last_id) => {
                    let first_id = store
                        .stream_range(key, StreamId::MIN, StreamId::MAX)?
                        .first()
                        .map(|e| e.id)
                        .unwrap_or(StreamId::MIN);
                    let start = store::parse_range_start(start, first_id)?;
                    let end = store::parse_range_end(end, last_id)?;
                    let entries = store.stream_range(key, start, end)?;
                    Ok(Outcome::reply(encode_stream_entries(&entries)))
                }
            }
        }

        Command::Xread => dispatch_xread(server, args).await,
    }
}

fn missing_args(cmd: &str) -> RedisError {
    RedisError::Command(format!("wrong number of arguments for '{}'", cmd))
}

/// `SET`'s only option: `PX <milliseconds>`, case-insensitive.
fn parse_px_option(options: &[String]) -> Result<Option<u64>> {
    let mut iter = options.iter();
    while let Some(opt) = iter.next() {
        if opt.eq_ignore_ascii_case("PX") {
            let ms = iter
                .next()
                .ok_or_else(|| RedisError::Command("PX requires a value".to_string()))?
                .parse::<u64>()
                .map_err(|_| RedisError::Command("PX value is not an integer".to_string()))?;
            return Ok(Some(ms));
        }
    }
    Ok(None)
}

fn encode_stream_entries(entries: &[store::StreamEntry]) -> Resp {
    Resp::Array(
        entries
            .iter()
            .map(|e| {
                Resp::Array(vec![
                    Resp::Bulk(e.id.to_string()),
                    Resp::Array(vec![Resp::Bulk(e.field.clone()), Resp::Bulk(e.value.clone())]),
                ])
            })
            .collect(),
    )
}

/// `XREAD [BLOCK ms] STREAMS k1..kn id1..idn`. Blocking semantics live here
/// because they need to `.await` a timer or notifier, which the rest of
/// `dispatch` deliberately does not do — every other command resolves
/// synchronously against the keyspace lock.
async fn dispatch_xread(server: &Server, args: &[String]) -> Result<Outcome> {
    let block_ms = find_option_value(args, "BLOCK")
        .map(|s| s.parse::<u64>().map_err(|_| RedisError::Command("invalid BLOCK value".into())))
        .transpose()?;
    let streams_idx = args
        .iter()
        .position(|a| a.eq_ignore_ascii_case("STREAMS"))
        .ok_or_else(|| RedisError::Command("XREAD requires STREAMS".to_string()))?;
    let rest = &args[streams_idx + 1..];
    if rest.is_empty() || rest.len() % 2 != 0 {
        return Err(RedisError::Command("wrong number of arguments for 'xread'".to_string()));
    }
    let (keys, ids) = rest.split_at(rest.len() / 2);

    // Resolve each `$` id against the stream's current last id up front,
    // under the same lock, so a concurrent XADD can't land between
    // resolving "$" and the first non-blocking read.
    let resolved: Vec<(String, StreamId)> = {
        let store = server.store.read().unwrap();
        let mut resolved = Vec::with_capacity(keys.len());
        for (key, id) in keys.iter().zip(ids.iter()) {
            let after = if id == "$" {
                store.last_stream_id(key)?
            } else {
                id.parse::<StreamId>()?
            };
            resolved.push((key.clone(), after));
        }
        resolved
    };

    match block_ms {
        None => Ok(Outcome::reply(read_once(server, &resolved)?)),
        Some(0) => Ok(Outcome::reply(wait_and_read(server, &resolved, None).await?)),
        Some(ms) => Ok(Outcome::reply(wait_and_read(server, &resolved, Some(ms)).await?)),
    }
}

fn read_once(server: &Server, resolved: &[(String, StreamId)]) -> Result<Resp> {
    read_once_locked(&server.store.read().unwrap(), resolved)
}

fn read_once_locked(store: &store::KvStore, resolved: &[(String, StreamId)]) -> Result<Resp> {
    let mut per_key = Vec::new();
    for (key, after) in resolved {
        let entries = store.stream_read_after(key, *after)?;
        if entries.is_empty() {
            continue;
        }
        per_key.push(Resp::Array(vec![Resp::bulk(key.clone()), encode_stream_entries(&entries)]));
    }
    Ok(if per_key.is_empty() { Resp::Null } else { Resp::Array(per_key) })
}

/// Checks for fresh entries and, if none have arrived yet, waits for one
/// (up to `timeout_ms`, or indefinitely if `None`). The check and the
/// registration of interest in each key's notifier happen as one critical
/// section under the store's write lock: `Notify::notify_waiters` stores no
/// permit for callers that subscribe afterwards, so a concurrent `XADD`
/// landing between a separately-locked check and a separately-locked
/// registration would otherwise wake nobody and block this call forever.
async fn wait_and_read(server: &Server, resolved: &[(String, StreamId)], timeout_ms: Option<u64>) -> Result<Resp> {
    let mut store = server.store.write().unwrap();
    let immediate = read_once_locked(&store, resolved)?;
    if immediate != Resp::Null {
        return Ok(immediate);
    }
    let notifiers: Vec<_> = resolved.iter().map(|(key, _)| store.stream_notifier(key)).collect();
    // `enable()` registers each future as a waiter right now, synchronously,
    // rather than on first `.await` poll — so it can't miss a notification
    // fired the instant we drop `store` below. `notifiers` (the `Arc<Notify>`
    // clones each `Notified` future borrows) is kept alive alongside
    // `notifieds` for the rest of this call, not dropped with the lock.
    let mut notifieds: Vec<_> = notifiers.iter().map(|n| Box::pin(n.notified())).collect();
    for notified in notifieds.iter_mut() {
        notified.as_mut().enable();
    }
    drop(store);

    match timeout_ms {
        None => wait_for_any(&mut notifieds).await,
        Some(ms) => {
            let deadline = tokio::time::sleep(std::time::Duration::from_millis(ms));
            tokio::pin!(deadline);
            tokio::select! {
                _ = &mut deadline => {}
                _ = wait_for_any(&mut notifieds) => {}
            }
        }
    }

    read_once(server, resolved)
}

/// Resolves as soon as any one future in `futs` is ready.
async fn wait_for_any<F: std::future::Future<Output = ()>>(futs: &mut [std::pin::Pin<Box<F>>]) {
    use std::future::Future;
    use std::task::{Context, Poll};

    struct SelectAny<'a, F>(&'a mut [std::pin::Pin<Box<F>>]);
    impl<'a, F: Future<Output = ()>> Future for SelectAny<'a, F> {
        type Output = ();
        fn poll(self: std::pin::Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            for fut in self.get_mut().0.iter_mut() {
                if fut.as_mut().poll(cx).is_ready() {
                    return Poll::Ready(());
                }
            }
            Poll::Pending
        }
    }

    SelectAny(futs).await
}

fn find_option_value<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a.eq_ignore_ascii_case(name))
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
}

/// `PSYNC ? -1` on a master: replies with `+FULLRESYNC <id> <offset>` and
/// hands back the empty RDB blob as the follow-up payload. Called directly
/// by [`crate::connection`] since it needs the replica-registry side effect
/// (registering the connection) that `dispatch` is kept out of.
pub fn psync_response(master_replid: &str, master_repl_offset: u64) -> Outcome {
    Outcome {
        reply: Resp::Simple(format!("FULLRESYNC {} {}", master_replid, master_repl_offset)),
        followup: Some(rdb::empty_rdb()),
    }
}
