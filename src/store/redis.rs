//! RESP2-over-TCP store client.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, trace};

use super::monitor::parse_monitor_line;
use super::resp::{self, Decoder, RespValue};
use super::{CommandFeed, Connector, StoreConnection, StreamBatch, StreamId, StreamRecord};
use crate::config::StoreConfig;
use crate::event::CommandInvocation;
use crate::{Error, Result};

/// Opens connections to a Redis-compatible server.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    config: StoreConfig,
}

impl RedisConnector {
    pub fn new(config: StoreConfig) -> Self {
        Self { config }
    }

    async fn open(&self) -> Result<RedisConnection> {
        let address = self.config.address();
        debug!(%address, "connecting to store");

        let stream = tokio::time::timeout(self.config.connect_timeout(), TcpStream::connect(&address))
            .await
            .map_err(|_| Error::Timeout {
                message: format!("connecting to {}", address),
            })?
            .map_err(|e| Error::Connection(format!("failed to connect to {}: {}", address, e)))?;
        stream.set_nodelay(true)?;

        let mut conn = RedisConnection {
            stream,
            buffer: BytesMut::with_capacity(16 * 1024),
            decoder: Decoder::default(),
            request_timeout: self.config.request_timeout(),
        };

        if let Some(password) = &self.config.password {
            let mut auth = CommandInvocation::new("AUTH");
            if let Some(username) = &self.config.username {
                auth = auth.arg(username.clone());
            }
            conn.request(&auth.arg(password.clone()))
                .await?
                .into_result()
                .map_err(|e| Error::Connection(format!("authentication failed: {}", e)))?;
        }

        if self.config.db != 0 {
            conn.request(&CommandInvocation::new("SELECT").arg(self.config.db.to_string()))
                .await?
                .into_result()?;
        }

        Ok(conn)
    }
}

#[async_trait]
impl Connector for RedisConnector {
    async fn connect(&self) -> Result<Box<dyn StoreConnection>> {
        let conn = self.open().await?;
        info!(address = %self.config.address(), db = self.config.db, "connected to store");
        Ok(Box::new(conn))
    }

    async fn tap_commands(&self) -> Result<CommandFeed> {
        let mut conn = self.open().await?;
        let reply = conn.request(&CommandInvocation::new("MONITOR")).await?.into_result()?;
        if reply.as_str() != Some("OK") {
            return Err(Error::Protocol(format!("unexpected MONITOR reply {:?}", reply)));
        }
        info!(address = %self.config.address(), "tapping command feed");

        let feed = stream::unfold(Some(conn), |conn| async move {
            let mut conn = conn?;
            loop {
                let item = match conn.read_reply().await {
                    Ok(RespValue::Simple(line)) => match parse_monitor_line(&line) {
                        Ok(Some(observed)) => Ok(observed),
                        Ok(None) => continue,
                        Err(e) => Err(e),
                    },
                    Ok(other) => Err(Error::Protocol(format!(
                        "unexpected monitor reply {:?}",
                        other
                    ))),
                    Err(e) => return Some((Err(e), None)),
                };
                return Some((item, Some(conn)));
            }
        });

        Ok(feed.boxed())
    }

    fn describe(&self) -> String {
        format!("redis://{}/{}", self.config.address(), self.config.db)
    }

    fn db(&self) -> u32 {
        self.config.db
    }
}

/// A single request/response connection.
pub struct RedisConnection {
    stream: TcpStream,
    buffer: BytesMut,
    decoder: Decoder,
    request_timeout: Duration,
}

impl RedisConnection {
    /// Sends a command and waits for its reply.
    pub async fn request(&mut self, command: &CommandInvocation) -> Result<RespValue> {
        self.request_blocking(command, Duration::ZERO).await
    }

    /// Sends a command that may block server-side for up to `block`.
    ///
    /// A failed write is a plain connection error. Once the request is
    /// written, losing the reply yields [`Error::ReplyLost`]; a malformed
    /// reply stays a protocol error.
    async fn request_blocking(
        &mut self,
        command: &CommandInvocation,
        block: Duration,
    ) -> Result<RespValue> {
        let mut out = BytesMut::new();
        resp::encode_command(command, &mut out);
        trace!(command = %command.name, bytes = out.len(), "sending request");
        self.stream
            .write_all(&out)
            .await
            .map_err(|e| Error::Connection(format!("write failed: {}", e)))?;

        let limit = self.request_timeout + block;
        let reply = match tokio::time::timeout(limit, self.read_reply()).await {
            Ok(reply) => reply,
            Err(_) => Err(Error::Timeout {
                message: format!("no reply within {:?}", limit),
            }),
        };
        reply.map_err(|e| match e {
            Error::Protocol(_) => e,
            other => Error::ReplyLost {
                command: command.name.clone(),
                source: Box::new(other),
            },
        })
    }

    async fn read_reply(&mut self) -> Result<RespValue> {
        loop {
            if let Some(value) = self.decoder.decode(&mut self.buffer)? {
                return Ok(value);
            }
            let read = self
                .stream
                .read_buf(&mut self.buffer)
                .await
                .map_err(|e| Error::Connection(format!("read failed: {}", e)))?;
            if read == 0 {
                return Err(Error::Connection("connection closed by server".to_string()));
            }
        }
    }
}

#[async_trait]
impl StoreConnection for RedisConnection {
    async fn ping(&mut self) -> Result<()> {
        let reply = self.request(&CommandInvocation::new("PING")).await?.into_result()?;
        match reply.as_str() {
            Some("PONG") => Ok(()),
            _ => Err(Error::Protocol(format!("unexpected PING reply {:?}", reply))),
        }
    }

    async fn read_streams(
        &mut self,
        cursors: &[(String, StreamId)],
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamBatch>> {
        if cursors.is_empty() {
            return Ok(Vec::new());
        }

        // BLOCK 0 would wait forever.
        let block_ms = block.as_millis().max(1);
        let mut command = CommandInvocation::new("XREAD")
            .arg("COUNT")
            .arg(count.to_string())
            .arg("BLOCK")
            .arg(block_ms.to_string())
            .arg("STREAMS");
        for (stream, _) in cursors {
            command = command.arg(stream.clone());
        }
        for (_, id) in cursors {
            command = command.arg(id.to_string());
        }

        let reply = self.request_blocking(&command, block).await?.into_result()?;
        parse_xread_reply(reply)
    }

    async fn scan_streams(&mut self, pattern: Option<&str>) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor = "0".to_string();
        loop {
            let mut command = CommandInvocation::new("SCAN").arg(cursor.clone());
            if let Some(pattern) = pattern {
                command = command.arg("MATCH").arg(pattern.to_string());
            }
            command = command.arg("COUNT").arg("1000").arg("TYPE").arg("stream");

            let mut reply = self.request(&command).await?.into_result()?.into_array()?;
            if reply.len() != 2 {
                return Err(Error::Protocol("SCAN reply must have two elements".to_string()));
            }
            let batch = reply.pop().map(RespValue::into_array).transpose()?.unwrap_or_default();
            cursor = reply.pop().map(RespValue::into_string).transpose()?.unwrap_or_default();

            for key in batch {
                keys.push(key.into_string()?);
            }
            if cursor == "0" || cursor.is_empty() {
                break;
            }
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn invoke(&mut self, command: &CommandInvocation) -> Result<RespValue> {
        self.request(command).await
    }
}

/// Parses `XREAD` output: `[[stream, [[id, [f, v, ...]], ...]], ...]`.
pub fn parse_xread_reply(reply: RespValue) -> Result<Vec<StreamBatch>> {
    let mut batches = Vec::new();
    for stream in reply.into_array()? {
        let mut parts = stream.into_array()?.into_iter();
        let (Some(name), Some(entries)) = (parts.next(), parts.next()) else {
            return Err(Error::Protocol("XREAD stream element must be a pair".to_string()));
        };
        let name = name.into_string()?;

        let mut records = Vec::new();
        for entry in entries.into_array()? {
            let mut parts = entry.into_array()?.into_iter();
            let (Some(id), Some(flat)) = (parts.next(), parts.next()) else {
                return Err(Error::Protocol("XREAD entry must be a pair".to_string()));
            };
            let id: StreamId = id.into_string()?.parse()?;

            let flat = flat.into_array()?;
            if flat.len() % 2 != 0 {
                return Err(Error::Protocol(format!(
                    "entry {} has an odd number of field elements",
                    id
                )));
            }
            let mut fields: Vec<(Bytes, Bytes)> = Vec::with_capacity(flat.len() / 2);
            let mut flat = flat.into_iter();
            while let (Some(field), Some(value)) = (flat.next(), flat.next()) {
                fields.push((field.into_bytes()?, value.into_bytes()?));
            }
            records.push(StreamRecord { id, fields });
        }
        batches.push(StreamBatch {
            stream: name,
            records,
        });
    }
    Ok(batches)
}
