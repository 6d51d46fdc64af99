//! The per-connection task (component C4 of the design spec): one spawned
//! task per accepted socket, reading frames, dispatching them, and writing
//! replies. A connection that issues `PSYNC` hands itself off to
//! [`run_replica_link`] and never returns to the ordinary client loop.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::command::{self, Command};
use crate::error::{RedisError, Result};
use crate::resp::{self, Resp};
use crate::server::Server;

const READ_CHUNK: usize = 4096;

pub async fn handle_connection(stream: TcpStream, peer: SocketAddr, server: Arc<Server>) {
    if let Err(err) = run(stream, peer, server).await {
        debug!(%peer, error = %err, "connection closed with error");
    }
}

async fn run(stream: TcpStream, peer: SocketAddr, server: Arc<Server>) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let mut replica_port: Option<u16> = None;

    loop {
        let n = reader.read_buf(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }

        let frames = resp::parse_frames(&buf)?;
        let mut consumed = 0;
        let mut upgrade_to_replica = false;

        for frame in &frames {
            let frame_bytes = buf[consumed..consumed + frame.consumed].to_vec();
            consumed += frame.consumed;

            let (cmd, args) = match command::parse_command(&frame.argv) {
                Ok(v) => v,
                Err(RedisError::UnknownCommand(name)) => {
                    warn!(command = %name, "unknown command");
                    writer
                        .write_all(&Resp::Error(format!("ERR unknown command '{}'", name)).encode())
                        .await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            match cmd {
                Command::Replconf => {
                    if let [sub, value] = args {
                        if sub.eq_ignore_ascii_case("listening-port") {
                            replica_port = value.parse::<u16>().ok();
                        }
                    }
                    writer.write_all(&Resp::ok().encode()).await?;
                }

                Command::Psync => {
                    match validate_psync_args(args) {
                        Ok(()) => {
                            let outcome = command::psync_response(
                                &server.info.master_replid,
                                server.repl.master_repl_offset(),
                            );
                            writer.write_all(&outcome.reply.encode()).await?;
                            if let Some(rdb) = outcome.followup {
                                writer.write_all(&Resp::File(rdb).encode()).await?;
                            }
                            upgrade_to_replica = true;
                        }
                        Err(e) => write_error(&mut writer, &e).await?,
                    }
                }

                Command::Wait => match parse_wait_args(args) {
                    Ok((num_replicas, timeout_ms)) => {
                        let acked = server.repl.wait_for_acks(num_replicas, timeout_ms).await;
                        writer.write_all(&Resp::Int(acked as i64).encode()).await?;
                    }
                    Err(e) => write_error(&mut writer, &e).await?,
                },

                _ => match command::dispatch(&server, cmd, args).await {
                    Ok(outcome) => {
                        writer.write_all(&outcome.reply.encode()).await?;
                        if cmd.is_mutating() {
                            server.repl.propagate(&frame_bytes);
                        }
                    }
                    Err(e @ RedisError::Protocol(_)) => return Err(e),
                    Err(e) => write_error(&mut writer, &e).await?,
                },
            }

            if upgrade_to_replica {
                break;
            }
        }

        buf.advance(consumed);

        if upgrade_to_replica {
            info!(%peer, ?replica_port, "connection upgraded to replica link");
            return run_replica_link(reader, writer, server, buf).await;
        }
    }
}

async fn write_error(writer: &mut OwnedWriteHalf, err: &RedisError) -> Result<()> {
    writer.write_all(&Resp::Error(format!("ERR {}", err)).encode()).await?;
    Ok(())
}

fn validate_psync_args(args: &[String]) -> Result<()> {
    match args {
        [repl_id, offset] if repl_id == "?" && offset == "-1" => Ok(()),
        _ => Err(RedisError::Command(format!("unsupported PSYNC arguments {:?}", args))),
    }
}

fn parse_wait_args(args: &[String]) -> Result<(usize, u64)> {
    match args {
        [num_replicas, timeout_ms] => {
            let num_replicas = num_replicas
                .parse::<usize>()
                .map_err(|_| RedisError::Command("invalid numreplicas".to_string()))?;
            let timeout_ms = timeout_ms
                .parse::<u64>()
                .map_err(|_| RedisError::Command("invalid timeout".to_string()))?;
            Ok((num_replicas, timeout_ms))
        }
        _ => Err(RedisError::Command("wrong number of arguments for 'wait'".to_string())),
    }
}

/// Once a connection has completed the `PSYNC` handshake it stops being an
/// ordinary command loop: the write half only ever carries bytes forwarded
/// by [`crate::replication::ReplicationState::propagate`] and `GETACK`
/// probes, while the read half only ever carries `REPLCONF ACK` replies.
async fn run_replica_link(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    server: Arc<Server>,
    mut buf: BytesMut,
) -> Result<()> {
    let (handle, mut rx) = server.repl.register();

    // Any bytes already buffered from before the PSYNC upgrade (pipelined
    // right behind it) need processing before we start waiting on fresh
    // socket reads, or an ACK sitting in `buf` would never be noticed.
    let result: Result<()> = match record_acks(&mut buf, &handle) {
        Ok(()) => loop {
            tokio::select! {
                forwarded = rx.recv() => {
                    match forwarded {
                        Some(bytes) => {
                            if let Err(e) = writer.write_all(&bytes).await {
                                break Err(e.into());
                            }
                        }
                        None => break Ok(()),
                    }
                }
                read = reader.read_buf(&mut buf) => {
                    let n = match read {
                        Ok(n) => n,
                        Err(e) => break Err(e.into()),
                    };
                    if n == 0 {
                        break Ok(());
                    }
                    if let Err(e) = record_acks(&mut buf, &handle) {
                        break Err(e);
                    }
                }
            }
        },
        Err(e) => Err(e),
    };

    server.repl.deregister(&handle);
    result
}

/// Parses as many complete frames as `buf` holds and records any
/// `REPLCONF ACK <offset>` found among them, advancing `buf` past them.
fn record_acks(buf: &mut BytesMut, handle: &crate::replication::ReplicaHandle) -> Result<()> {
    let frames = resp::parse_frames(buf)?;
    let mut consumed = 0;
    for frame in &frames {
        consumed += frame.consumed;
        if let Ok((Command::Replconf, [sub, offset])) = command::parse_command(&frame.argv) {
            if sub.eq_ignore_ascii_case("ACK") {
                if let Ok(off) = offset.parse::<u64>() {
                    handle.record_ack(off);
                } else {
                    warn!(offset = %offset, "replica sent a non-numeric ACK offset");
                }
            }
        }
    }
    buf.advance(consumed);
    Ok(())
}
