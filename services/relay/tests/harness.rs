//! Test harness for relay integration tests.
//!
//! Provides helpers to spawn TCP upstreams, a minimal RESP counter store, and
//! relay listeners writing to a temporary log.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tapline_pipeline::{DurableLog, LogLayout, Pipeline, PipelineConfig, PipelineStatsSnapshot};
use tapline_relay::accounting::{Accounting, AccountingStatsSnapshot, CounterStore};
use tapline_relay::proxy::{AckMode, Listener, ListenerConfig, SessionContext, Upstream};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};

/// How a [`TcpBackend`] answers.
#[allow(dead_code)]
#[derive(Clone)]
pub enum BackendMode {
    /// Write back whatever arrives.
    Echo,
    /// Record what arrives and never answer.
    Silent,
    /// Send this reply once, after the first bytes arrive.
    ReplyOnce(Vec<u8>),
}

#[allow(dead_code)]
pub struct TcpBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    pub received: Arc<Mutex<Vec<u8>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl TcpBackend {
    pub async fn spawn(mode: BackendMode) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        let received_clone = Arc::clone(&received);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                tokio::spawn(serve_backend(
                                    stream,
                                    mode.clone(),
                                    Arc::clone(&received_clone),
                                ));
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            received,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> Vec<u8> {
        self.received.lock().unwrap().clone()
    }
}

impl Drop for TcpBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn serve_backend(mut stream: TcpStream, mode: BackendMode, received: Arc<Mutex<Vec<u8>>>) {
    let mut buf = vec![0u8; 8192];
    let mut replied = false;
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        received.lock().unwrap().extend_from_slice(&buf[..n]);

        let write = match &mode {
            BackendMode::Echo => stream.write_all(&buf[..n]).await,
            BackendMode::Silent => Ok(()),
            BackendMode::ReplyOnce(reply) if !replied => {
                replied = true;
                stream.write_all(reply).await
            }
            BackendMode::ReplyOnce(_) => Ok(()),
        };
        if write.is_err() {
            break;
        }
    }
}

/// A Redis stand-in that understands `INCRBY`, `GET` and `SET`.
#[allow(dead_code)]
pub struct FakeRedis {
    pub addr: SocketAddr,
    values: Arc<Mutex<HashMap<String, String>>>,
    commands: Arc<Mutex<Vec<String>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl FakeRedis {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let values = Arc::new(Mutex::new(HashMap::new()));
        let commands = Arc::new(Mutex::new(Vec::new()));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let values_clone = Arc::clone(&values);
        let commands_clone = Arc::clone(&commands);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, _)) => {
                                tokio::spawn(serve_redis(
                                    stream,
                                    Arc::clone(&values_clone),
                                    Arc::clone(&commands_clone),
                                ));
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            values,
            commands,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn get(&self, key: &str) -> Option<i64> {
        self.values
            .lock()
            .unwrap()
            .get(key)
            .and_then(|v| v.parse().ok())
    }

    /// Command names in the order they were received.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

impl Drop for FakeRedis {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn read_command(reader: &mut BufReader<TcpStream>) -> io::Result<Option<Vec<String>>> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    let count: usize = line
        .trim_end()
        .strip_prefix('*')
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "expected array"))?;

    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        line.clear();
        reader.read_line(&mut line).await?;
        let len: usize = line
            .trim_end()
            .strip_prefix('$')
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "expected bulk"))?;
        let mut data = vec![0u8; len + 2];
        reader.read_exact(&mut data).await?;
        data.truncate(len);
        args.push(String::from_utf8_lossy(&data).into_owned());
    }
    Ok(Some(args))
}

async fn serve_redis(
    stream: TcpStream,
    values: Arc<Mutex<HashMap<String, String>>>,
    commands: Arc<Mutex<Vec<String>>>,
) {
    let mut reader = BufReader::new(stream);
    while let Ok(Some(args)) = read_command(&mut reader).await {
        commands.lock().unwrap().push(args[0].to_uppercase());

        let reply = {
            let mut values = values.lock().unwrap();
            match (args[0].to_uppercase().as_str(), &args[1..]) {
                ("INCRBY", [key, delta]) => {
                    let current: i64 = values.get(key).and_then(|v| v.parse().ok()).unwrap_or(0);
                    let total = current + delta.parse::<i64>().unwrap_or(0);
                    values.insert(key.clone(), total.to_string());
                    format!(":{total}\r\n")
                }
                ("GET", [key]) => match values.get(key) {
                    Some(value) => format!("${}\r\n{value}\r\n", value.len()),
                    None => "$-1\r\n".to_string(),
                },
                ("SET", [key, value]) => {
                    values.insert(key.clone(), value.clone());
                    "+OK\r\n".to_string()
                }
                _ => "-ERR unknown command\r\n".to_string(),
            }
        };

        if reader.get_mut().write_all(reply.as_bytes()).await.is_err() {
            break;
        }
    }
}

/// Which log layout a [`RelayHandle`] writes.
#[allow(dead_code)]
#[derive(Debug, Clone, Copy)]
pub enum LayoutKind {
    SingleFile,
    PerEventFile,
}

/// Counters gathered when a relay is stopped.
#[allow(dead_code)]
pub struct RelayReport {
    pub pipeline: PipelineStatsSnapshot,
    pub accounting: AccountingStatsSnapshot,
}

#[allow(dead_code)]
pub struct RelayHandle {
    pub listen_addr: SocketAddr,
    pub log_path: PathBuf,
    pub listener: Arc<Listener>,
    pipeline: Pipeline,
    accounting: Accounting,
    shutdown_tx: watch::Sender<bool>,
    dir: TempDir,
}

#[allow(dead_code)]
impl RelayHandle {
    pub async fn spawn(target: SocketAddr, store: Arc<dyn CounterStore>) -> io::Result<Self> {
        Self::spawn_with(target, store, LayoutKind::SingleFile, AckMode::PerChunk).await
    }

    pub async fn spawn_with(
        target: SocketAddr,
        store: Arc<dyn CounterStore>,
        layout: LayoutKind,
        ack_mode: AckMode,
    ) -> io::Result<Self> {
        let dir = tempfile::tempdir()?;
        let (log_path, layout) = match layout {
            LayoutKind::SingleFile => {
                let path = dir.path().join("Log");
                (path.clone(), LogLayout::SingleFile(path))
            }
            LayoutKind::PerEventFile => {
                let path = dir.path().join("events");
                (path.clone(), LogLayout::PerEventFile(path))
            }
        };

        let pipeline = Pipeline::start(
            PipelineConfig {
                capacity: 64,
                wait_timeout: Some(Duration::from_secs(5)),
            },
            DurableLog::open(&layout)?,
        )
        .map_err(io::Error::other)?;
        let accounting = Accounting::start(store, 256);

        let context = SessionContext {
            publisher: pipeline.publisher(),
            accountant: accounting.accountant(),
            chunk_size: 1024,
            ack_mode,
        };

        let upstream = Upstream::new(target, Duration::from_millis(500));
        let config = ListenerConfig::new("127.0.0.1:0".parse().unwrap());
        let listener = Arc::new(Listener::bind(config, upstream, context).await?);
        let listen_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = Arc::clone(&listener);
        tokio::spawn(async move {
            let _ = runner.run(shutdown_rx).await;
        });

        Ok(Self {
            listen_addr,
            log_path,
            listener,
            pipeline,
            accounting,
            shutdown_tx,
            dir,
        })
    }

    pub fn closed_sessions(&self) -> u64 {
        self.listener
            .stats()
            .connections_closed
            .load(Ordering::Relaxed)
    }

    /// Wait until `count` sessions have finished.
    pub async fn wait_for_closed(&self, count: u64) {
        let relay = self;
        wait_until(move || async move { relay.closed_sessions() >= count }).await;
    }

    /// Stop accepting, drain the log and the counter queue.
    ///
    /// The log stays readable until the returned guard is dropped.
    pub async fn stop(self) -> (RelayReport, TempDir) {
        let _ = self.shutdown_tx.send(true);
        let pipeline = self.pipeline.shutdown().await;
        let accounting = self.accounting.shutdown().await;
        (
            RelayReport {
                pipeline,
                accounting,
            },
            self.dir,
        )
    }
}

/// Poll `condition` every 10ms for up to 5s.
#[allow(dead_code)]
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 5s");
}

/// Read the single-file log and split it into `(tag, payload)` records.
#[allow(dead_code)]
pub fn read_records(log: &[u8]) -> Vec<(String, Vec<u8>)> {
    let separator = tapline_pipeline::RECORD_SEPARATOR.as_bytes();
    let mut records = Vec::new();
    let mut rest = log;

    while let Some(at) = find(rest, separator) {
        let payload = rest[..at].to_vec();
        let after = &rest[at + separator.len()..];
        let line_end = after
            .iter()
            .position(|b| *b == b'\n')
            .unwrap_or(after.len());
        let line = String::from_utf8_lossy(&after[..line_end]).into_owned();
        // "<dir> <ip> <asctime>" where asctime has five fields.
        let fields: Vec<&str> = line.split_whitespace().collect();
        let tag = fields[..fields.len().saturating_sub(5)].join(" ");
        records.push((tag, payload));
        rest = &after[(line_end + 1).min(after.len())..];
    }
    records
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
