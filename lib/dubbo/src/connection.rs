use crate::error::{FatalKind, NetError};
use crate::frame::{self, FrameKind, HEADER_SIZE};
use crate::logging::{self, Logger};
use bytes::BytesMut;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::io::{self, Read, Write};
use std::net::{Shutdown, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

const READ_CHUNK_SIZE: usize = 8192;
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Where the reassembler is in the frame cycle:
/// header → (normal body | error body | header) → header.
#[derive(Debug, Clone, Copy)]
enum ReadPhase {
    Header,
    /// A payload body; `None` marks a heartbeat body that is read and
    /// discarded without waking anyone.
    NormalBody { invoke_id: Option<i64> },
    ErrorBody { invoke_id: i64, status: u8 },
}

/// A fully reassembled inbound frame, handed to the pool's reader.
#[derive(Debug)]
pub(crate) enum ReadEvent {
    HeartbeatRequest { id_bytes: [u8; 8] },
    HeartbeatResponse,
    ResponseBody { invoke_id: i64, body: BytesMut },
    ErrorBody { invoke_id: i64, status: u8, body: BytesMut },
}

/// One TCP connection to a provider: the socket, its reassembly state, and
/// the last time any traffic moved over it.
///
/// The socket goes non-blocking right after connect; the pool's reader is
/// the only caller of `receive`, while any caller task may `write_frame`.
pub(crate) struct Connection {
    stream: TcpStream,
    host: String,
    token: Token,
    last_active: Instant,
    read_buf: BytesMut,
    expected: usize,
    phase: ReadPhase,
    log: Logger,
}

impl Connection {
    /// Opens a connection to `host` (`ip:port`), bounded by
    /// `connect_timeout`, and switches the socket to non-blocking mode.
    pub fn connect<'a, L: Into<Option<&'a Logger>>>(
        host: &str,
        token: Token,
        connect_timeout: Duration,
        log: L,
    ) -> Result<Connection, NetError> {
        let log = logging::child(log);

        let addr = host
            .to_socket_addrs()
            .map_err(|e| NetError::protocol(format!("cannot resolve {}: {}", host, e)))?
            .next()
            .ok_or_else(|| NetError::protocol(format!("no address for {}", host)))?;

        let stream = std::net::TcpStream::connect_timeout(&addr, connect_timeout)
            .map_err(NetError::from)?;
        stream.set_nonblocking(true).map_err(NetError::from)?;

        logging::debug!(log, "connection opened"; "host" => host, "token" => token.0);

        Ok(Connection {
            stream: TcpStream::from_std(stream),
            host: host.to_string(),
            token,
            last_active: Instant::now(),
            read_buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
            expected: HEADER_SIZE,
            phase: ReadPhase::Header,
            log,
        })
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.duration_since(self.last_active)
    }

    pub fn register(&mut self, registry: &Registry) -> io::Result<()> {
        registry.register(&mut self.stream, self.token, Interest::READABLE)
    }

    pub fn deregister(&mut self, registry: &Registry) {
        if let Err(error) = registry.deregister(&mut self.stream) {
            logging::debug!(self.log, "deregistration failed";
                            "host" => &self.host, "error" => %error);
        }
    }

    /// Drains everything the socket has to give, appending any frames that
    /// complete to `events`. A fatal return means the connection must be
    /// dropped; completed events are still valid in that case.
    pub fn receive(
        &mut self,
        now: Instant,
        events: &mut Vec<ReadEvent>,
    ) -> Result<(), NetError> {
        let mut closed = false;
        let mut chunk = [0u8; READ_CHUNK_SIZE];

        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(count) => {
                    self.read_buf.extend_from_slice(&chunk[..count]);
                    self.last_active = now;
                }
                Err(ref error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(error.into()),
            }
        }

        while self.read_buf.len() >= self.expected {
            let frame = self.read_buf.split_to(self.expected);
            self.advance(frame, events)?;
        }

        if closed {
            logging::debug!(self.log, "closed by remote"; "host" => &self.host);
            return Err(NetError::Fatal(FatalKind::Closed));
        }
        Ok(())
    }

    /// Consumes one completed read unit and decides what the next one is.
    fn advance(&mut self, data: BytesMut, events: &mut Vec<ReadEvent>) -> Result<(), NetError> {
        match self.phase {
            ReadPhase::Header => {
                let header = frame::parse_header(&data)?;
                logging::trace!(self.log, "frame header";
                                "host" => &self.host,
                                "kind" => ?header.kind,
                                "invoke_id" => header.invoke_id,
                                "body_len" => header.body_len);

                let body_phase = match header.kind {
                    FrameKind::HeartbeatRequest => {
                        events.push(ReadEvent::HeartbeatRequest {
                            id_bytes: header.id_bytes,
                        });
                        ReadPhase::NormalBody { invoke_id: None }
                    }
                    FrameKind::HeartbeatResponse => {
                        events.push(ReadEvent::HeartbeatResponse);
                        ReadPhase::NormalBody { invoke_id: None }
                    }
                    FrameKind::Response { status } if status == crate::error::STATUS_OK => {
                        ReadPhase::NormalBody {
                            invoke_id: Some(header.invoke_id),
                        }
                    }
                    FrameKind::Response { status } => ReadPhase::ErrorBody {
                        invoke_id: header.invoke_id,
                        status,
                    },
                };

                // Heartbeats may legally carry no body at all.
                if header.body_len == 0 {
                    match body_phase {
                        ReadPhase::NormalBody { invoke_id: None } => self.next_header(),
                        _ => self.set_phase(body_phase, 0),
                    }
                } else {
                    self.set_phase(body_phase, header.body_len);
                }
            }
            ReadPhase::NormalBody { invoke_id: None } => {
                // Heartbeat body, nothing to correlate.
                self.next_header();
            }
            ReadPhase::NormalBody {
                invoke_id: Some(invoke_id),
            } => {
                events.push(ReadEvent::ResponseBody {
                    invoke_id,
                    body: data,
                });
                self.next_header();
            }
            ReadPhase::ErrorBody { invoke_id, status } => {
                events.push(ReadEvent::ErrorBody {
                    invoke_id,
                    status,
                    body: data,
                });
                self.next_header();
            }
        }
        Ok(())
    }

    fn set_phase(&mut self, phase: ReadPhase, expected: usize) {
        self.phase = phase;
        self.expected = expected;
    }

    fn next_header(&mut self) {
        self.set_phase(ReadPhase::Header, HEADER_SIZE);
    }

    /// Writes a whole frame, riding out short writes and transient
    /// would-block conditions.
    pub fn write_frame(&mut self, data: &[u8]) -> Result<(), NetError> {
        let mut offset = 0;
        while offset < data.len() {
            match self.stream.write(&data[offset..]) {
                Ok(0) => {
                    return Err(NetError::Fatal(FatalKind::Io(
                        io::ErrorKind::WriteZero.into(),
                    )))
                }
                Ok(count) => {
                    offset += count;
                    self.last_active = Instant::now();
                }
                Err(ref error) if error.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(WRITE_RETRY_DELAY);
                }
                Err(ref error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => return Err(error.into()),
            }
        }
        Ok(())
    }

    /// Orderly shutdown of both directions; errors are moot at this point.
    pub fn close(&mut self) {
        logging::debug!(self.log, "closing connection"; "host" => &self.host);
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
