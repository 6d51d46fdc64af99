//! Replica-side replication (component C5, replica half): the handshake
//! with the master and the subsequent streaming loop. Grounded on the
//! teacher's `ReplicaConnection`/`start_replication`, translated from
//! blocking `std::net::TcpStream` plus a restart-on-error thread loop into
//! an async task that reconnects with backoff instead of giving up.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{error, info, warn};

use crate::args::Binding;
use crate::command::{self, Command};
use crate::error::{RedisError, Result};
use crate::resp::{self, Resp};
use crate::server::Server;

const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

/// Runs forever: on any handshake or streaming error, logs it, sleeps, and
/// retries. A replica's job is to keep trying to catch up, not to die
/// because the master was briefly unreachable.
pub async fn run(server: Arc<Server>, master: Binding) {
    loop {
        match replicate_once(&server, &master).await {
            Ok(()) => warn!(%master, "replication stream ended cleanly, reconnecting"),
            Err(e) => error!(%master, error = %e, "replication connection failed, reconnecting"),
        }
        tokio::time::sleep(RECONNECT_BACKOFF).await;
    }
}

async fn replicate_once(server: &Arc<Server>, master: &Binding) -> Result<()> {
    let mut stream = TcpStream::connect((master.0.as_str(), master.1)).await?;

    // One accumulator threaded through the whole handshake and into the
    // streaming loop below: the master writes its replies back-to-back
    // (`+FULLRESYNC …\r\n$88\r\n<88 bytes>` commonly lands in a single read),
    // so each step must consume only what it needs and leave the rest in
    // `buf` for the next step rather than reading into a throwaway buffer.
    let mut buf = BytesMut::with_capacity(4096);

    send_command(&mut stream, &["PING"]).await?;
    expect_reply(&mut stream, &mut buf).await?;

    let listening_port = server.info.port.to_string();
    send_command(&mut stream, &["REPLCONF", "listening-port", &listening_port]).await?;
    expect_reply(&mut stream, &mut buf).await?;

    send_command(&mut stream, &["REPLCONF", "capa", "psync2"]).await?;
    expect_reply(&mut stream, &mut buf).await?;

    send_command(&mut stream, &["PSYNC", "?", "-1"]).await?;
    expect_reply(&mut stream, &mut buf).await?; // +FULLRESYNC <replid> <offset>
    skip_rdb_payload(&mut stream, &mut buf).await?;

    info!(%master, "replication handshake complete, streaming");

    // `buf` may already hold the first propagated command, pipelined right
    // behind the RDB blob `skip_rdb_payload` just consumed — parse it before
    // blocking on a fresh read, or that command would sit unprocessed until
    // the master happens to write again.
    let mut offset: u64 = 0;
    loop {
        let frames = resp::parse_frames(&buf)?;
        if frames.is_empty() {
            let n = stream.read_buf(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            continue;
        }
        let mut consumed = 0;
        for frame in &frames {
            apply_frame(server, &mut stream, &frame.argv, offset).await?;
            offset += frame.consumed as u64;
            consumed += frame.consumed;
        }
        buf.advance(consumed);
    }
}

/// Applies one command received over the replication stream. Mutating
/// commands update the local keyspace directly (never through
/// [`command::dispatch`]'s replica-side restriction) since a replica is the
/// one place a mutation is trusted without an external client driving it;
/// `REPLCONF GETACK` is answered inline with the offset measured *before*
/// this frame, matching the master's own accounting. Every other command a
/// master might send is executed for its reply but the reply is discarded:
/// a replica's command stream has no client on the other end to answer.
async fn apply_frame(server: &Arc<Server>, stream: &mut TcpStream, argv: &[String], offset_before: u64) -> Result<()> {
    let (cmd, args) = command::parse_command(argv)?;

    if cmd == Command::Replconf {
        if let [sub, _] = args {
            if sub.eq_ignore_ascii_case("GETACK") {
                let ack = Resp::Array(vec![
                    Resp::bulk("REPLCONF"),
                    Resp::bulk("ACK"),
                    Resp::bulk(offset_before.to_string()),
                ]);
                stream.write_all(&ack.encode()).await?;
            }
        }
        return Ok(());
    }

    if cmd == Command::Set {
        let (key, value) = match args {
            [k, v, ..] => (k, v),
            _ => return Err(RedisError::Command("wrong number of arguments for 'set'".to_string())),
        };
        server.store.write().unwrap().set(key, value, None);
        return Ok(());
    }

    if cmd == Command::Xadd {
        let (key, id, rest) = match args {
            [key, id, rest @ ..] => (key, id, rest),
            _ => return Err(RedisError::Command("wrong number of arguments for 'xadd'".to_string())),
        };
        if let [field, value, ..] = rest {
            server.store.write().unwrap().stream_append(key, id, field, value)?;
        }
        return Ok(());
    }

    // A read-only or administrative command arriving on the replication
    // link (PING keepalives, for instance) needs no local effect.
    Ok(())
}

async fn send_command(stream: &mut TcpStream, argv: &[&str]) -> Result<()> {
    let frame = Resp::array_of_bulks(argv.iter().map(|s| s.to_string()));
    stream.write_all(&frame.encode()).await?;
    Ok(())
}

/// Consumes and discards one reply line from `buf` (reading more from
/// `stream` only if `buf` doesn't already hold a complete line); the
/// handshake only needs to know the master answered, not what it said.
/// Bytes past the line — commonly the next step's reply, already pipelined
/// by the master — are left in `buf` for the caller's next step.
async fn expect_reply(stream: &mut TcpStream, buf: &mut BytesMut) -> Result<()> {
    loop {
        if let Some(idx) = buf.windows(2).position(|w| w == b"\r\n") {
            buf.advance(idx + 2);
            return Ok(());
        }
        let n = stream.read_buf(buf).await?;
        if n == 0 {
            return Err(RedisError::Protocol("master closed connection during handshake".to_string()));
        }
    }
}

/// Consumes and discards the RDB payload following `FULLRESYNC`: a
/// bulk-string header with no trailing `\r\n`. This server never
/// reconstructs state from it, since the replication stream that follows
/// replays every mutation from scratch. Reads from `buf` first since the
/// master commonly writes the RDB header and blob in the same packet as the
/// `+FULLRESYNC` line `expect_reply` just consumed.
async fn skip_rdb_payload(stream: &mut TcpStream, buf: &mut BytesMut) -> Result<()> {
    loop {
        if let Some(idx) = buf.windows(2).position(|w| w == b"\r\n") {
            let len: usize = std::str::from_utf8(&buf[1..idx])
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| RedisError::Protocol("invalid RDB payload length".to_string()))?;
            let total = idx + 2 + len;
            while buf.len() < total {
                if stream.read_buf(buf).await? == 0 {
                    return Err(RedisError::Protocol("master closed connection mid RDB payload".to_string()));
                }
            }
            buf.advance(total);
            return Ok(());
        }
        let n = stream.read_buf(buf).await?;
        if n == 0 {
            return Err(RedisError::Protocol("master closed connection sending RDB payload".to_string()));
        }
    }
}
