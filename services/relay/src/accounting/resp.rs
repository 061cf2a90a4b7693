//! Counter store speaking RESP (the Redis serialization protocol).
//!
//! Only the handful of replies the relay needs are understood: simple
//! strings, errors, integers and bulk strings. Commands are sent as arrays of
//! bulk strings.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info};

use super::{CounterError, CounterStore, DEFAULT_REQUEST_TIMEOUT};

/// Largest bulk reply accepted from the store.
const MAX_BULK_LEN: usize = 1024 * 1024;

/// How an increment is applied on the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePolicy {
    /// `INCRBY key delta`, atomic on the server.
    IncrBy,
    /// `GET key` then `SET key total`. Racy under concurrent writers.
    GetSet,
}

/// A decoded RESP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Simple(String),
    Error(String),
    Integer(i64),
    /// `None` is the null bulk string (`$-1`).
    Bulk(Option<Vec<u8>>),
}

/// Encode a command as a RESP array of bulk strings.
pub fn encode_command(args: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + args.iter().map(|a| a.len() + 16).sum::<usize>());
    out.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// One request/response connection to a RESP server.
pub struct RespConnection<S> {
    stream: BufReader<S>,
}

impl<S> RespConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    /// Send one command and read its reply.
    pub async fn command(&mut self, args: &[&[u8]]) -> Result<Reply, CounterError> {
        self.stream.write_all(&encode_command(args)).await?;
        self.stream.flush().await?;
        self.read_reply().await
    }

    async fn read_line(&mut self) -> Result<Vec<u8>, CounterError> {
        let mut line = Vec::new();
        if self.stream.read_until(b'\n', &mut line).await? == 0 {
            return Err(CounterError::Disconnected);
        }
        if !line.ends_with(b"\r\n") {
            return Err(CounterError::Protocol("unterminated reply line".to_string()));
        }
        line.truncate(line.len() - 2);
        Ok(line)
    }

    async fn read_reply(&mut self) -> Result<Reply, CounterError> {
        let line = self.read_line().await?;
        let (kind, body) = line
            .split_first()
            .ok_or_else(|| CounterError::Protocol("empty reply".to_string()))?;
        let text = std::str::from_utf8(body)
            .map_err(|_| CounterError::Protocol("reply is not UTF-8".to_string()))?;

        match kind {
            b'+' => Ok(Reply::Simple(text.to_string())),
            b'-' => Ok(Reply::Error(text.to_string())),
            b':' => Ok(Reply::Integer(parse_int(text)?)),
            b'$' => {
                let len = parse_int(text)?;
                if len < 0 {
                    return Ok(Reply::Bulk(None));
                }
                let len = len as usize;
                if len > MAX_BULK_LEN {
                    return Err(CounterError::Protocol(format!(
                        "bulk reply of {len} bytes exceeds limit"
                    )));
                }
                let mut data = vec![0u8; len + 2];
                self.stream.read_exact(&mut data).await?;
                if !data.ends_with(b"\r\n") {
                    return Err(CounterError::Protocol("unterminated bulk reply".to_string()));
                }
                data.truncate(len);
                Ok(Reply::Bulk(Some(data)))
            }
            other => Err(CounterError::Protocol(format!(
                "unsupported reply type {:?}",
                *other as char
            ))),
        }
    }
}

fn parse_int(text: &str) -> Result<i64, CounterError> {
    text.parse()
        .map_err(|_| CounterError::Protocol(format!("invalid integer {text:?}")))
}

/// Counter store backed by a Redis-compatible server.
///
/// Holds one lazily (re)established connection. Any transport or protocol
/// failure, or a request that outlives the request timeout, discards the
/// connection so the next update reconnects.
pub struct RespCounterStore {
    addr: String,
    policy: UpdatePolicy,
    connect_timeout: Duration,
    request_timeout: Duration,
    connection: Mutex<Option<RespConnection<TcpStream>>>,
}

impl RespCounterStore {
    pub fn new(addr: &str, policy: UpdatePolicy, connect_timeout: Duration) -> Self {
        Self {
            addr: addr.to_string(),
            policy,
            connect_timeout,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connection: Mutex::new(None),
        }
    }

    /// Bound each update (all of its commands) to `request_timeout`.
    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn policy(&self) -> UpdatePolicy {
        self.policy
    }

    async fn connect(&self) -> Result<RespConnection<TcpStream>, CounterError> {
        let stream = match timeout(self.connect_timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(CounterError::Connect {
                    addr: self.addr.clone(),
                    source,
                })
            }
            Err(_) => return Err(CounterError::ConnectTimeout(self.addr.clone())),
        };
        stream.set_nodelay(true)?;

        info!(addr = %self.addr, policy = ?self.policy, "Connected to counter store");
        Ok(RespConnection::new(stream))
    }

    async fn apply(
        &self,
        connection: &mut RespConnection<TcpStream>,
        key: &str,
        delta: u64,
    ) -> Result<i64, CounterError> {
        match self.policy {
            UpdatePolicy::IncrBy => {
                let delta = delta.to_string();
                match connection
                    .command(&[b"INCRBY", key.as_bytes(), delta.as_bytes()])
                    .await?
                {
                    Reply::Integer(total) => Ok(total),
                    other => Err(unexpected("INCRBY", other)),
                }
            }
            UpdatePolicy::GetSet => {
                let current = match connection.command(&[b"GET", key.as_bytes()]).await? {
                    Reply::Bulk(None) => 0,
                    Reply::Bulk(Some(raw)) => {
                        let text = String::from_utf8(raw).map_err(|_| {
                            CounterError::Protocol("counter value is not UTF-8".to_string())
                        })?;
                        parse_int(&text)?
                    }
                    other => return Err(unexpected("GET", other)),
                };

                let delta = i64::try_from(delta)
                    .map_err(|_| CounterError::Protocol(format!("delta {delta} out of range")))?;
                let total = current.saturating_add(delta);
                let value = total.to_string();

                match connection
                    .command(&[b"SET", key.as_bytes(), value.as_bytes()])
                    .await?
                {
                    Reply::Simple(_) => Ok(total),
                    other => Err(unexpected("SET", other)),
                }
            }
        }
    }
}

fn unexpected(command: &str, reply: Reply) -> CounterError {
    match reply {
        Reply::Error(message) => CounterError::Server(message),
        other => CounterError::Protocol(format!("unexpected {command} reply: {other:?}")),
    }
}

#[async_trait]
impl CounterStore for RespCounterStore {
    async fn increment_by(&self, key: &str, delta: u64) -> Result<i64, CounterError> {
        let mut slot = self.connection.lock().await;

        let mut connection = match slot.take() {
            Some(connection) => connection,
            None => self.connect().await?,
        };

        let result = match timeout(
            self.request_timeout,
            self.apply(&mut connection, key, delta),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CounterError::Timeout {
                addr: self.addr.clone(),
                after: self.request_timeout,
            }),
        };
        match &result {
            // The server answered; the connection is still in sync.
            Ok(_) | Err(CounterError::Server(_)) => *slot = Some(connection),
            Err(e) => debug!(addr = %self.addr, error = %e, "Dropping counter store connection"),
        }
        result
    }

    fn name(&self) -> &'static str {
        match self.policy {
            UpdatePolicy::IncrBy => "resp-incrby",
            UpdatePolicy::GetSet => "resp-get-set",
        }
    }
}
