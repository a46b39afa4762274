//! The multiplexed connection pool. One reader task owns every socket's read
//! side and demultiplexes responses onto waiting callers by invocation id;
//! one keeper task probes idle connections and replaces the unresponsive.

use crate::codec::{self, RpcRequest};
use crate::config::ClientConfig;
use crate::connection::{Connection, ReadEvent};
use crate::error::{DubboError, DubboResult, NetError};
use crate::frame;
use crate::logging::{self, Logger};
use hashbrown::HashMap;
use hessian2::Value;
use indexmap::IndexMap;
use mio::{Events, Poll, Registry, Token, Waker};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const WAKER_TOKEN: Token = Token(0);

type CallOutcome = DubboResult<Value>;

/// Pool state shared between callers, the reader task and the keeper task.
///
/// Lock order, where held together: `connect_lock` → `connections` → one
/// connection's mutex → `tokens`. The `pending`, `heartbeats` and
/// `invoke_id` locks are leaves.
struct Shared {
    config: ClientConfig,
    registry: Registry,
    waker: Waker,
    connections: Mutex<IndexMap<String, Arc<Mutex<Connection>>>>,
    tokens: Mutex<HashMap<Token, String>>,
    pending: Mutex<HashMap<i64, SyncSender<CallOutcome>>>,
    heartbeats: Mutex<HashMap<String, u32>>,
    connect_lock: Mutex<()>,
    invoke_id: Mutex<i64>,
    next_token: AtomicUsize,
    shutdown: AtomicBool,
    log: Logger,
}

/// Keyed map of live connections plus the machinery to multiplex calls over
/// them. Dropping the pool stops both background tasks and closes every
/// connection.
pub struct ConnectionPool {
    shared: Arc<Shared>,
    reader: Option<JoinHandle<()>>,
    keeper: Option<JoinHandle<()>>,
}

impl ConnectionPool {
    pub fn new(config: ClientConfig) -> io::Result<ConnectionPool> {
        ConnectionPool::with_logger(config, None)
    }

    pub fn with_logger<'a, L: Into<Option<&'a Logger>>>(
        config: ClientConfig,
        log: L,
    ) -> io::Result<ConnectionPool> {
        let log = logging::child(log);
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let registry = poll.registry().try_clone()?;

        let shared = Arc::new(Shared {
            config,
            registry,
            waker,
            connections: Mutex::new(IndexMap::new()),
            tokens: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            heartbeats: Mutex::new(HashMap::new()),
            connect_lock: Mutex::new(()),
            invoke_id: Mutex::new(0),
            next_token: AtomicUsize::new(WAKER_TOKEN.0 + 1),
            shutdown: AtomicBool::new(false),
            log,
        });

        let reader = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("dubbo-reader".to_string())
                .spawn(move || reader_loop(&shared, poll))?
        };
        let keeper = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("dubbo-keeper".to_string())
                .spawn(move || keeper_loop(&shared))?
        };

        Ok(ConnectionPool {
            shared,
            reader: Some(reader),
            keeper: Some(keeper),
        })
    }

    /// Dispatches one request to `host` and waits for its response, bounded
    /// by `timeout` when one is given.
    pub fn call(
        &self,
        host: &str,
        request: &RpcRequest,
        timeout: Option<Duration>,
    ) -> DubboResult<Value> {
        let shared = &self.shared;
        if !host.contains(':') {
            return Err(DubboError::Registry(format!("invalid host {:?}", host)));
        }

        let conn = shared.get_connection(host)?;
        let invoke_id = shared.next_invoke_id();
        let request_frame = codec::encode_request(invoke_id, request)?;

        let (sender, receiver) = mpsc::sync_channel(1);
        {
            let mut pending = shared.pending.lock().unwrap();
            if pending.contains_key(&invoke_id) {
                return Err(DubboError::Protocol(format!(
                    "invocation id {} already registered",
                    invoke_id
                )));
            }
            pending.insert(invoke_id, sender);
        }

        logging::debug!(shared.log, "request dispatched";
                        "host" => host,
                        "invoke_id" => invoke_id,
                        "method" => &request.method,
                        "timeout" => ?timeout);

        let written = conn.lock().unwrap().write_frame(&request_frame);
        if let Err(error) = written {
            shared.pending.lock().unwrap().remove(&invoke_id);
            return Err(match error {
                NetError::Fatal(kind) => {
                    shared.delete_connection(host);
                    kind.into()
                }
                NetError::Wait => DubboError::Protocol("request write stalled".to_string()),
            });
        }

        let received = match timeout {
            Some(limit) => receiver.recv_timeout(limit),
            None => receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                // Cancel the slot; a response that straggles in later finds
                // no entry and is discarded by the reader.
                shared.pending.lock().unwrap().remove(&invoke_id);
                Err(DubboError::RequestTimeout {
                    host: host.to_string(),
                    timeout: timeout.unwrap_or_default(),
                })
            }
            Err(RecvTimeoutError::Disconnected) => {
                shared.pending.lock().unwrap().remove(&invoke_id);
                Err(DubboError::Protocol("connection pool shut down".to_string()))
            }
        }
    }

    /// Stops both tasks, closes every connection and unblocks anyone still
    /// waiting without a timeout.
    pub fn shutdown(&mut self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shared.waker.wake();
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.keeper.take() {
            let _ = handle.join();
        }

        let drained: Vec<_> = self
            .shared
            .connections
            .lock()
            .unwrap()
            .drain(..)
            .collect();
        for (_, conn) in drained {
            conn.lock().unwrap().close();
        }
        self.shared.tokens.lock().unwrap().clear();
        // Dropping the senders wakes unbounded waiters with Disconnected.
        self.shared.pending.lock().unwrap().clear();
        logging::debug!(self.shared.log, "pool shut down");
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    /// Monotonic id allocator; wraps back past the signed 64-bit maximum.
    fn next_invoke_id(&self) -> i64 {
        let mut id = self.invoke_id.lock().unwrap();
        if *id == i64::max_value() {
            *id = 0;
        }
        *id += 1;
        *id
    }

    /// Looks up the connection for a host, creating it under the connect
    /// lock (double-checked) on first use.
    fn get_connection(&self, host: &str) -> DubboResult<Arc<Mutex<Connection>>> {
        if let Some(conn) = self.connections.lock().unwrap().get(host) {
            return Ok(conn.clone());
        }
        let _guard = self.connect_lock.lock().unwrap();
        if let Some(conn) = self.connections.lock().unwrap().get(host) {
            return Ok(conn.clone());
        }
        self.open_connection(host)
    }

    /// Connects, registers with the reader's poll and publishes the
    /// connection. The caller must hold `connect_lock`.
    fn open_connection(&self, host: &str) -> DubboResult<Arc<Mutex<Connection>>> {
        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
        let mut conn = Connection::connect(host, token, self.config.connect_timeout(), &self.log)
            .map_err(|error| match error {
                NetError::Fatal(kind) => DubboError::from(kind),
                NetError::Wait => DubboError::Protocol("connect would block".to_string()),
            })?;
        conn.register(&self.registry)
            .map_err(|error| DubboError::Protocol(format!("poll registration failed: {}", error)))?;

        let conn = Arc::new(Mutex::new(conn));
        self.connections
            .lock()
            .unwrap()
            .insert(host.to_string(), conn.clone());
        self.tokens.lock().unwrap().insert(token, host.to_string());
        self.heartbeats.lock().unwrap().insert(host.to_string(), 0);
        let _ = self.waker.wake();
        Ok(conn)
    }

    /// Removes and closes a connection. Shares the connect lock with
    /// creation so a replacement cannot race a caller's lookup.
    fn delete_connection(&self, host: &str) {
        let _guard = self.connect_lock.lock().unwrap();
        self.remove_locked(host);
        self.heartbeats.lock().unwrap().remove(host);
    }

    /// Swaps a dead connection for a fresh one, resetting its miss counter.
    fn replace_connection(&self, host: &str) {
        let _guard = self.connect_lock.lock().unwrap();
        self.remove_locked(host);
        self.heartbeats.lock().unwrap().insert(host.to_string(), 0);
        match self.open_connection(host) {
            Ok(_) => {
                logging::debug!(self.log, "connection replaced"; "host" => host);
            }
            Err(error) => {
                // Leave the slot empty; the next call reconnects.
                self.heartbeats.lock().unwrap().remove(host);
                logging::warn!(self.log, "reconnect failed";
                               "host" => host, "error" => %error);
            }
        }
    }

    fn remove_locked(&self, host: &str) {
        let removed = self.connections.lock().unwrap().shift_remove(host);
        if let Some(conn) = removed {
            let mut conn = conn.lock().unwrap();
            conn.deregister(&self.registry);
            conn.close();
            self.tokens.lock().unwrap().remove(&conn.token());
        }
    }

    /// Applies the frames one readiness event produced: answer heartbeat
    /// probes, count heartbeat replies, decode and deliver responses.
    fn handle_events(
        &self,
        host: &str,
        conn: &Arc<Mutex<Connection>>,
        events: &mut Vec<ReadEvent>,
    ) {
        for event in events.drain(..) {
            match event {
                ReadEvent::HeartbeatRequest { id_bytes } => {
                    logging::debug!(self.log, "heartbeat request"; "host" => host);
                    let reply = frame::encode_heartbeat_response(&id_bytes);
                    if let Err(error) = conn.lock().unwrap().write_frame(&reply) {
                        logging::debug!(self.log, "heartbeat reply failed";
                                        "host" => host, "error" => ?error);
                    }
                }
                ReadEvent::HeartbeatResponse => {
                    logging::debug!(self.log, "heartbeat response"; "host" => host);
                    if let Some(misses) = self.heartbeats.lock().unwrap().get_mut(host) {
                        *misses = misses.saturating_sub(1);
                    }
                }
                ReadEvent::ResponseBody { invoke_id, body } => {
                    self.complete(invoke_id, codec::decode_response(&body));
                }
                ReadEvent::ErrorBody {
                    invoke_id,
                    status,
                    body,
                } => {
                    self.complete(invoke_id, Err(codec::decode_error_body(status, &body)));
                }
            }
        }
    }

    /// Hands a finished outcome to the caller registered for the id. An
    /// absent entry means the caller gave up; the outcome is dropped.
    fn complete(&self, invoke_id: i64, outcome: CallOutcome) {
        match self.pending.lock().unwrap().remove(&invoke_id) {
            Some(sender) => {
                let _ = sender.send(outcome);
            }
            None => {
                logging::debug!(self.log, "discarding uncorrelated response";
                                "invoke_id" => invoke_id);
            }
        }
    }

    /// One keeper pass over a single connection: probe it once idle, replace
    /// it after too many unanswered probes.
    fn check_connection(&self, host: &str, conn: &Arc<Mutex<Connection>>, now: Instant) {
        let idle = conn.lock().unwrap().idle_for(now);
        if idle <= self.config.idle_timeout() {
            return;
        }

        let misses = self
            .heartbeats
            .lock()
            .unwrap()
            .get(host)
            .copied()
            .unwrap_or(0);
        if misses >= self.config.heartbeat_max_misses {
            logging::debug!(self.log, "heartbeat budget exhausted";
                            "host" => host, "misses" => misses);
            self.replace_connection(host);
            return;
        }

        if let Some(count) = self.heartbeats.lock().unwrap().get_mut(host) {
            *count += 1;
        }
        let invoke_id = self.next_invoke_id();
        logging::debug!(self.log, "heartbeat sent"; "host" => host, "invoke_id" => invoke_id);
        let probe = frame::encode_heartbeat_request(invoke_id);
        if let Err(error) = conn.lock().unwrap().write_frame(&probe) {
            logging::debug!(self.log, "heartbeat send failed";
                            "host" => host, "error" => ?error);
            if let NetError::Fatal(_) = error {
                self.delete_connection(host);
            }
        }
    }
}

/// The single reader: waits on readiness for every connection and drives
/// each ready connection's reassembler. I/O failures here drop the offending
/// connection and nothing else.
fn reader_loop(shared: &Arc<Shared>, mut poll: Poll) {
    let mut events = Events::with_capacity(1024);
    let mut frames = Vec::new();

    while !shared.shutdown.load(Ordering::Acquire) {
        if let Err(error) = poll.poll(&mut events, Some(shared.config.poll_interval())) {
            if error.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            logging::error!(shared.log, "readiness poll failed"; "error" => %error);
            break;
        }

        for event in events.iter() {
            let token = event.token();
            if token == WAKER_TOKEN {
                continue;
            }
            let host = match shared.tokens.lock().unwrap().get(&token) {
                Some(host) => host.clone(),
                None => continue,
            };
            let conn = match shared.connections.lock().unwrap().get(&host) {
                Some(conn) => conn.clone(),
                None => continue,
            };

            frames.clear();
            let outcome = {
                let mut conn = conn.lock().unwrap();
                // The slot may have been swapped since the event fired.
                if conn.token() != token {
                    continue;
                }
                conn.receive(Instant::now(), &mut frames)
            };

            shared.handle_events(&host, &conn, &mut frames);

            if let Err(NetError::Fatal(cause)) = outcome {
                logging::debug!(shared.log, "connection dropped";
                                "host" => &host, "cause" => %cause);
                shared.delete_connection(&host);
            }
        }
    }
}

/// The keeper: periodically sweeps for idle connections and runs the
/// heartbeat protocol against them. Per-host failures are logged and the
/// sweep moves on.
fn keeper_loop(shared: &Arc<Shared>) {
    while !shared.shutdown.load(Ordering::Acquire) {
        thread::sleep(shared.config.heartbeat_interval());
        let now = Instant::now();

        let snapshot: Vec<_> = shared
            .connections
            .lock()
            .unwrap()
            .iter()
            .map(|(host, conn)| (host.clone(), conn.clone()))
            .collect();
        for (host, conn) in snapshot {
            shared.check_connection(&host, &conn, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_pool() -> ConnectionPool {
        ConnectionPool::new(ClientConfig::default()).unwrap()
    }

    #[test]
    fn test_invoke_ids_are_monotonic_from_one() {
        let pool = quiet_pool();
        assert_eq!(pool.shared.next_invoke_id(), 1);
        assert_eq!(pool.shared.next_invoke_id(), 2);
        assert_eq!(pool.shared.next_invoke_id(), 3);
    }

    #[test]
    fn test_invoke_id_wraps_at_max() {
        let pool = quiet_pool();
        *pool.shared.invoke_id.lock().unwrap() = i64::max_value() - 1;
        assert_eq!(pool.shared.next_invoke_id(), i64::max_value());
        assert_eq!(pool.shared.next_invoke_id(), 1);
    }

    #[test]
    fn test_invalid_host_rejected_before_io() {
        let pool = quiet_pool();
        let request = RpcRequest {
            dubbo_version: "2.4.10".to_string(),
            path: "com.example.Echo".to_string(),
            version: "1.0.0".to_string(),
            method: "echo".to_string(),
            arguments: vec![],
        };
        let error = pool.call("not-a-host", &request, None).unwrap_err();
        assert!(matches!(error, DubboError::Registry(_)));
    }

    #[test]
    fn test_unreachable_host_fails_fast() {
        let mut config = ClientConfig::default();
        config.connect_timeout_secs = 1;
        let pool = ConnectionPool::new(config).unwrap();
        let request = RpcRequest {
            dubbo_version: "2.4.10".to_string(),
            path: "com.example.Echo".to_string(),
            version: "1.0.0".to_string(),
            method: "echo".to_string(),
            arguments: vec![],
        };
        // Reserved TEST-NET-1 address; nothing listens there.
        let error = pool
            .call("192.0.2.1:20880", &request, Some(Duration::from_secs(2)))
            .unwrap_err();
        assert!(matches!(error, DubboError::Protocol(_)));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let mut pool = quiet_pool();
        pool.shutdown();
        pool.shutdown();
    }
}
