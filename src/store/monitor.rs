//! Parser for the lines of a `MONITOR` feed.
//!
//! ```text
//! 1700000000.123456 [0 127.0.0.1:60866] "set" "user:1" "ada"
//! 1700000000.123999 [0 lua] "hset" "h" "f" "\x00\x01"
//! ```

use bytes::Bytes;

use super::ObservedCommand;
use crate::event::CommandInvocation;
use crate::{Error, Result};

/// Parses one monitor line. Returns `Ok(None)` for the initial `OK` reply.
pub fn parse_monitor_line(line: &str) -> Result<Option<ObservedCommand>> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line == "OK" {
        return Ok(None);
    }

    let (timestamp, rest) = line
        .split_once(' ')
        .ok_or_else(|| malformed(line, "missing timestamp"))?;
    if timestamp.parse::<f64>().is_err() {
        return Err(malformed(line, "invalid timestamp"));
    }

    let (db, client, rest) = match rest.strip_prefix('[') {
        Some(bracketed) => {
            let (origin, rest) = bracketed
                .split_once("] ")
                .ok_or_else(|| malformed(line, "unterminated client block"))?;
            let (db, client) = origin.split_once(' ').unwrap_or((origin, ""));
            let db = db
                .parse::<u32>()
                .map_err(|_| malformed(line, "invalid database number"))?;
            let client = (!client.is_empty()).then(|| client.to_string());
            (Some(db), client, rest)
        }
        None => (None, None, rest),
    };

    let mut parts = parse_quoted_args(rest).map_err(|reason| malformed(line, reason))?;
    if parts.is_empty() {
        return Err(malformed(line, "no command"));
    }
    let name = String::from_utf8_lossy(&parts.remove(0)).to_string();

    Ok(Some(ObservedCommand {
        db,
        client,
        command: CommandInvocation {
            name,
            args: parts.into_iter().map(Bytes::from).collect(),
        },
    }))
}

fn parse_quoted_args(input: &str) -> std::result::Result<Vec<Vec<u8>>, &'static str> {
    let bytes = input.as_bytes();
    let mut args = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b' ' => i += 1,
            b'"' => {
                i += 1;
                let mut arg = Vec::new();
                loop {
                    let Some(&c) = bytes.get(i) else {
                        return Err("unterminated argument");
                    };
                    match c {
                        b'"' => {
                            i += 1;
                            break;
                        }
                        b'\\' => {
                            let Some(&escaped) = bytes.get(i + 1) else {
                                return Err("dangling escape");
                            };
                            match escaped {
                                b'n' => arg.push(b'\n'),
                                b'r' => arg.push(b'\r'),
                                b't' => arg.push(b'\t'),
                                b'a' => arg.push(0x07),
                                b'b' => arg.push(0x08),
                                b'x' => {
                                    let hex = bytes.get(i + 2..i + 4).ok_or("truncated hex escape")?;
                                    let hex = std::str::from_utf8(hex).map_err(|_| "invalid hex escape")?;
                                    let value =
                                        u8::from_str_radix(hex, 16).map_err(|_| "invalid hex escape")?;
                                    arg.push(value);
                                    i += 2;
                                }
                                other => arg.push(other),
                            }
                            i += 2;
                        }
                        other => {
                            arg.push(other);
                            i += 1;
                        }
                    }
                }
                args.push(arg);
            }
            _ => return Err("argument is not quoted"),
        }
    }

    Ok(args)
}

fn malformed(line: &str, reason: &str) -> Error {
    Error::Protocol(format!("malformed monitor line ({}): {}", reason, line))
}
