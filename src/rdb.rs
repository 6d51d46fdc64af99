//! RDB snapshot support: the fixed empty snapshot sent on every `PSYNC`
//! (this server never persists, so it never has anything richer to offer)
//! and an optional startup loader for the length-encoded subset of the
//! format described at <https://rdb.fnordig.de/file_format.html>.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use crate::error::{RedisError, Result};
use crate::store::KvStore;

const RDB_EMPTY_HEX: &str = "524544495330303131fa0972656469732d76657205372e322e30fa0a72656469732d62697473c040fa056374696d65c26d08bc65fa08757365642d6d656dc2b0c41000fa08616f662d62617365c000fff06e3bfec0ff5aa2";

fn hex_to_bytes(hex: &str) -> Vec<u8> {
    assert_eq!(hex.len() % 2, 0);
    let mut result = Vec::with_capacity(hex.len() / 2);
    let mut chars = hex.chars();
    while let Some(c1) = chars.next() {
        let c2 = chars.next().unwrap();
        result.push(u8::from_str_radix(&format!("{}{}", c1, c2), 16).unwrap());
    }
    result
}

/// The canonical empty RDB snapshot, sent as the `FULLRESYNC` payload. This
/// server keeps no on-disk state of its own, so every replica starts from
/// the same blank slate and catches up entirely from the replication
/// stream that follows it.
pub fn empty_rdb() -> Vec<u8> {
    hex_to_bytes(RDB_EMPTY_HEX)
}

enum Length {
    Len(u32),
    Byte(u8),
    Short(u16),
    Int(u32),
}

fn read_byte(r: &mut impl Read) -> Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32(r: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Reads one of the format's four length encodings, keyed off the two
/// most-significant bits of the leading byte. Compressed (LZF) string
/// encoding is not implemented: it is not emitted by this server and not
/// exercised by the original spec's test fixtures.
fn read_length(r: &mut impl Read) -> Result<Length> {
    let head = read_byte(r)?;
    match head & 0b1100_0000 {
        0b0000_0000 => Ok(Length::Len((head & 0b0011_1111) as u32)),
        0b0100_0000 => {
            let low = read_byte(r)?;
            Ok(Length::Len(u16::from_be_bytes([head & 0b0011_1111, low]) as u32))
        }
        0b1000_0000 => Ok(Length::Len(read_u32(r)?)),
        0b1100_0000 => match head & 0b0011_1111 {
            0 => Ok(Length::Byte(read_byte(r)?)),
            1 => {
                let mut buf = [0u8; 2];
                r.read_exact(&mut buf)?;
                Ok(Length::Short(u16::from_le_bytes(buf)))
            }
            2 => Ok(Length::Int(read_u32(r)?)),
            other => Err(RedisError::Protocol(format!("unsupported RDB special length encoding {}", other))),
        },
        _ => unreachable!(),
    }
}

fn read_int(r: &mut impl Read) -> Result<i64> {
    Ok(match read_length(r)? {
        Length::Len(n) => n as i64,
        Length::Byte(n) => n as i64,
        Length::Short(n) => n as i64,
        Length::Int(n) => n as i64,
    })
}

fn read_string(r: &mut impl Read) -> Result<String> {
    match read_length(r)? {
        Length::Len(len) => {
            let mut buf = vec![0u8; len as usize];
            r.read_exact(&mut buf)?;
            String::from_utf8(buf).map_err(|_| RedisError::Protocol("RDB string is not valid utf-8".to_string()))
        }
        Length::Byte(n) => Ok(n.to_string()),
        Length::Short(n) => Ok(n.to_string()),
        Length::Int(n) => Ok(n.to_string()),
    }
}

/// Loads string keys (streams are never persisted by this server, so none
/// are expected on disk) out of `<dir>/<dbfilename>` into `store`, if the
/// file exists. Absence of the file is not an error: a fresh server simply
/// starts empty. A malformed file is likewise non-fatal: the failure is
/// logged and the load aborts with whatever keys were parsed before the
/// corruption, rather than failing startup.
pub fn load_into(dir: &str, dbfilename: &str, store: &mut KvStore) -> Result<()> {
    let path = Path::new(dir).join(dbfilename);
    if !path.exists() {
        info!(?path, "no RDB snapshot to load at startup");
        return Ok(());
    }
    match try_load(&path, store) {
        Ok(loaded) => info!(keys = loaded, ?path, "loaded RDB snapshot"),
        Err(err) => warn!(?path, error = %err, "malformed RDB snapshot, starting with whatever was loaded so far"),
    }
    Ok(())
}

/// Returns the number of keys loaded, or the error that aborted the load.
fn try_load(path: &Path, store: &mut KvStore) -> Result<usize> {
    let mut reader = BufReader::new(File::open(path)?);

    let mut header = [0u8; 9];
    reader.read_exact(&mut header)?;
    if !header.starts_with(b"REDIS") {
        return Err(RedisError::Protocol("RDB file missing REDIS magic header".to_string()));
    }

    let mut expires_at_ms: Option<u64> = None;
    let mut loaded = 0;

    loop {
        let op = match read_byte(&mut reader) {
            Ok(b) => b,
            Err(_) => break,
        };
        match op {
            0xFF => break,
            0xFE => {
                read_length(&mut reader)?;
            }
            0xFB => {
                read_int(&mut reader)?;
                read_int(&mut reader)?;
            }
            0xFA => {
                read_string(&mut reader)?;
                read_string(&mut reader)?;
            }
            0xFC => {
                expires_at_ms = Some(read_u64(&mut reader)?);
            }
            0xFD => {
                expires_at_ms = Some(read_u32(&mut reader)? as u64 * 1000);
            }
            0..=14 => {
                let key = read_string(&mut reader)?;
                let value = read_string(&mut reader)?;
                let already_expired = matches!(expires_at_ms, Some(ms) if ms <= now_ms());
                if !already_expired {
                    store.load_string(key, value, expires_at_ms.take());
                }
                expires_at_ms = None;
                loaded += 1;
            }
            other => {
                warn!(value_type = other, "unsupported RDB value type, stopping load early");
                break;
            }
        }
    }

    Ok(loaded)
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as u64
}
