use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Result, StreamError};
use crate::frame::{
    self, FailoverLog, FrameHeader, HEADER_LEN, OPEN_FLAG_PRODUCER, PartVersion, StreamEvent,
    opcode, status,
};
use crate::receiver::{self, ClientResponse, Dispatch};

/// Client tunables. The timeout covers connecting and the bootstrap
/// handshake; established streams wait as long as the server stays up.
#[derive(Debug, Clone)]
pub struct StreamClientConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub timeout: Duration,
    /// A failover log longer than this fails `enum_docs_since`.
    pub max_failover_log_size: usize,
    /// Flag word sent in the open-connection frame.
    pub flags: u32,
}

impl Default for StreamClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 11210,
            password: None,
            timeout: Duration::from_secs(5),
            max_failover_log_size: 25,
            flags: OPEN_FLAG_PRODUCER,
        }
    }
}

/// Outcome of opening one partition stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddStreamOutcome {
    /// Stream open; events will flow until stream-end.
    FailoverLog(FailoverLog),
    /// The requested start is ahead of server history; resume lower.
    Rollback(u64),
}

/// A document-level change pulled out of a partition stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocEvent {
    Mutation(frame::Mutation),
    Deletion(frame::Deletion),
}

/// Handle to one bucket-authenticated protocol connection.
///
/// All state lives in a coordinator task owning the socket's write half;
/// this handle just sends it commands. Clones share the connection.
#[derive(Debug, Clone)]
pub struct StreamClient {
    cmd_tx: mpsc::Sender<Command>,
    max_failover_log_size: usize,
}

impl StreamClient {
    /// Connect, authenticate, and name the connection. The handshake is
    /// synchronous; only afterwards do the reader and coordinator tasks
    /// take over the socket.
    pub async fn connect(name: &str, bucket: &str, config: StreamClientConfig) -> Result<Self> {
        let mut stream = timeout(
            config.timeout,
            TcpStream::connect((config.host.as_str(), config.port)),
        )
        .await
        .map_err(|_| StreamError::Timeout)??;
        stream.set_nodelay(true)?;

        let password = config.password.as_deref().unwrap_or("");
        bootstrap(
            &mut stream,
            frame::sasl_auth_request(0, bucket, password),
            opcode::SASL_AUTH,
            config.timeout,
        )
        .await?;
        bootstrap(
            &mut stream,
            frame::open_connection_request(1, name, config.flags),
            opcode::OPEN_CONNECTION,
            config.timeout,
        )
        .await?;
        info!(name, bucket, "stream connection established");

        let (read_half, write_half) = stream.into_split();
        let (rw_tx, rw_rx) = mpsc::channel(64);
        tokio::spawn(receiver::run(read_half, rw_tx));

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        tokio::spawn(Coordinator::new(write_half).run(cmd_rx, rw_rx));

        Ok(Self {
            cmd_tx,
            max_failover_log_size: config.max_failover_log_size,
        })
    }

    /// Open a stream for one partition. On success the returned request
    /// id keys [`StreamClient::get_stream_event`].
    pub async fn add_stream(
        &self,
        partition: u16,
        version: PartVersion,
        start_seq: u64,
        end_seq: u64,
    ) -> Result<(u32, AddStreamOutcome)> {
        self.call(|reply| Command::AddStream {
            partition,
            version,
            start_seq,
            end_seq,
            reply,
        })
        .await?
    }

    /// Close the active stream of a partition. Any caller blocked on its
    /// events sees a stream-end.
    pub async fn remove_stream(&self, partition: u16) -> Result<()> {
        self.call(|reply| Command::RemoveStream { partition, reply })
            .await?
    }

    /// Next event of a stream; waits if none is queued. After the
    /// stream-end event the request id is forgotten and further calls
    /// return [`StreamError::StreamNotFound`].
    pub async fn get_stream_event(&self, request_id: u32) -> Result<StreamEvent> {
        self.call(|reply| Command::GetEvent { request_id, reply })
            .await?
    }

    /// Partitions with an active stream.
    pub async fn list_streams(&self) -> Result<Vec<u16>> {
        self.call(|reply| Command::ListStreams { reply }).await
    }

    /// Raw stat pairs for one partition-scoped stat request.
    pub async fn get_stats(&self, partition: u16) -> Result<Vec<(String, String)>> {
        self.call(|reply| Command::GetStats { partition, reply })
            .await?
    }

    /// Current high sequence number of a partition.
    pub async fn get_sequence_number(&self, partition: u16) -> Result<u64> {
        let pairs = self.get_stats(partition).await?;
        let (_, value) = pairs
            .first()
            .ok_or(StreamError::StreamNotFound)?;
        value
            .parse()
            .map_err(|_| StreamError::Protocol(format!("bad sequence stat {value:?}")))
    }

    /// Failover log of a partition, or
    /// [`StreamError::NoFailoverLogFound`] when the server has none.
    pub async fn get_failover_log(&self, partition: u16) -> Result<FailoverLog> {
        self.call(|reply| Command::GetFailoverLog { partition, reply })
            .await?
    }

    /// Close the connection, waking every pending caller and waiter.
    pub async fn stop(&self) -> Result<()> {
        self.call(|reply| Command::Stop { reply }).await
    }

    /// Fold all document changes of a partition between two sequences.
    ///
    /// Tries each known partition version until the server accepts one,
    /// skipping versions it rejects as unknown; snapshot markers are
    /// skipped; deletions and expirations arrive as removals. An exhausted
    /// version list means no common history: rollback to zero.
    pub async fn enum_docs_since<A, F>(
        &self,
        partition: u16,
        versions: &[PartVersion],
        start_seq: u64,
        end_seq: u64,
        mut acc: A,
        mut fold: F,
    ) -> Result<(A, FailoverLog)>
    where
        F: FnMut(DocEvent, A) -> A + Send,
        A: Send,
    {
        for version in versions {
            let (request_id, outcome) = match self
                .add_stream(partition, *version, start_seq, end_seq)
                .await
            {
                Err(StreamError::WrongPartitionVersion) => {
                    debug!(partition, uuid = version.uuid, "partition version rejected");
                    continue;
                }
                Err(err) => return Err(err),
                Ok(opened) => opened,
            };
            let log = match outcome {
                AddStreamOutcome::Rollback(seq) => return Err(StreamError::Rollback(seq)),
                AddStreamOutcome::FailoverLog(log) => log,
            };
            if log.len() > self.max_failover_log_size {
                let _ = self.remove_stream(partition).await;
                return Err(StreamError::TooLargeFailoverLog(log.len()));
            }
            loop {
                match self.get_stream_event(request_id).await? {
                    StreamEvent::SnapshotMarker { .. } => {}
                    StreamEvent::Mutation(mutation) => {
                        acc = fold(DocEvent::Mutation(mutation), acc);
                    }
                    StreamEvent::Deletion(deletion) => {
                        acc = fold(DocEvent::Deletion(deletion), acc);
                    }
                    StreamEvent::StreamEnd { .. } => return Ok((acc, log)),
                }
            }
        }
        Err(StreamError::Rollback(0))
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| StreamError::Closed)?;
        rx.await.map_err(|_| StreamError::Closed)
    }
}

/// Synchronous request/response on the raw socket, before the reader
/// task exists.
async fn bootstrap(
    stream: &mut TcpStream,
    request: bytes::Bytes,
    expect_opcode: u8,
    deadline: Duration,
) -> Result<()> {
    timeout(deadline, stream.write_all(&request))
        .await
        .map_err(|_| StreamError::Timeout)??;

    let mut raw = [0u8; HEADER_LEN];
    timeout(deadline, stream.read_exact(&mut raw))
        .await
        .map_err(|_| StreamError::Timeout)??;
    let header = FrameHeader::decode(&raw);
    let mut body = vec![0u8; header.body_len as usize];
    timeout(deadline, stream.read_exact(&mut body))
        .await
        .map_err(|_| StreamError::Timeout)??;

    if header.opcode != expect_opcode {
        return Err(StreamError::UnexpectedOpcode(header.opcode));
    }
    match header.status() {
        status::SUCCESS => Ok(()),
        code => Err(frame::status_error(code)),
    }
}

enum Command {
    AddStream {
        partition: u16,
        version: PartVersion,
        start_seq: u64,
        end_seq: u64,
        reply: oneshot::Sender<Result<(u32, AddStreamOutcome)>>,
    },
    RemoveStream {
        partition: u16,
        reply: oneshot::Sender<Result<()>>,
    },
    GetEvent {
        request_id: u32,
        reply: oneshot::Sender<Result<StreamEvent>>,
    },
    ListStreams {
        reply: oneshot::Sender<Vec<u16>>,
    },
    GetStats {
        partition: u16,
        reply: oneshot::Sender<Result<Vec<(String, String)>>>,
    },
    GetFailoverLog {
        partition: u16,
        reply: oneshot::Sender<Result<FailoverLog>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

enum Pending {
    AddStream {
        partition: u16,
        reply: oneshot::Sender<Result<(u32, AddStreamOutcome)>>,
    },
    RemoveStream {
        partition: u16,
        reply: oneshot::Sender<Result<()>>,
    },
    Stats {
        reply: oneshot::Sender<Result<Vec<(String, String)>>>,
    },
    FailoverLog {
        reply: oneshot::Sender<Result<FailoverLog>>,
    },
}

/// Undelivered events and waiting consumers of one open stream. At any
/// moment at least one side is empty: an arriving event is handed to a
/// waiter when one exists, and a consumer only parks when no event is
/// queued.
struct StreamQueue {
    partition: u16,
    events: VecDeque<StreamEvent>,
    waiters: VecDeque<oneshot::Sender<Result<StreamEvent>>>,
}

struct Coordinator {
    write: OwnedWriteHalf,
    pending: HashMap<u32, Pending>,
    queues: HashMap<u32, StreamQueue>,
    active: HashMap<u16, u32>,
    next_opaque: u32,
}

impl Coordinator {
    fn new(write: OwnedWriteHalf) -> Self {
        Self {
            write,
            pending: HashMap::new(),
            queues: HashMap::new(),
            active: HashMap::new(),
            // 0 and 1 went to the bootstrap handshake.
            next_opaque: 2,
        }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut rw_rx: mpsc::Receiver<Dispatch>,
    ) {
        loop {
            tokio::select! {
                command = cmd_rx.recv() => match command {
                    None => {
                        // Every handle dropped; close the connection.
                        self.fail_all();
                        return;
                    }
                    Some(Command::Stop { reply }) => {
                        debug!("client stop requested");
                        self.fail_all();
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command).await,
                },
                dispatch = rw_rx.recv() => match dispatch {
                    None | Some(Dispatch::Closed { .. }) => {
                        if let Some(Dispatch::Closed { reason }) = dispatch {
                            error!(%reason, "connection lost, stopping client");
                        }
                        self.fail_all();
                        return;
                    }
                    Some(Dispatch::Response { opaque, response }) => {
                        self.handle_response(opaque, response);
                    }
                    Some(Dispatch::Event { opaque, event }) => {
                        self.handle_event(opaque, event);
                    }
                },
            }
        }
    }

    fn alloc_opaque(&mut self) -> u32 {
        let opaque = self.next_opaque;
        self.next_opaque = self.next_opaque.wrapping_add(1);
        opaque
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::AddStream {
                partition,
                version,
                start_seq,
                end_seq,
                reply,
            } => {
                let opaque = self.alloc_opaque();
                let request =
                    frame::stream_request(opaque, partition, 0, start_seq, end_seq, version);
                if let Err(err) = self.write.write_all(&request).await {
                    let _ = reply.send(Err(err.into()));
                    return;
                }
                self.pending
                    .insert(opaque, Pending::AddStream { partition, reply });
            }
            Command::RemoveStream { partition, reply } => {
                let Some(&request_id) = self.active.get(&partition) else {
                    let _ = reply.send(Err(StreamError::StreamNotFound));
                    return;
                };
                let opaque = self.alloc_opaque();
                let request = frame::stream_close_request(opaque, partition);
                if let Err(err) = self.write.write_all(&request).await {
                    let _ = reply.send(Err(err.into()));
                    return;
                }
                trace!(partition, request_id, "closing stream");
                self.pending
                    .insert(opaque, Pending::RemoveStream { partition, reply });
            }
            Command::GetEvent { request_id, reply } => {
                let Some(queue) = self.queues.get_mut(&request_id) else {
                    let _ = reply.send(Err(StreamError::StreamNotFound));
                    return;
                };
                match queue.events.pop_front() {
                    Some(event) => {
                        let ended = matches!(event, StreamEvent::StreamEnd { .. });
                        let _ = reply.send(Ok(event));
                        if ended {
                            self.forget_stream(request_id);
                        }
                    }
                    None => queue.waiters.push_back(reply),
                }
            }
            Command::ListStreams { reply } => {
                let _ = reply.send(self.active.keys().copied().collect());
            }
            Command::GetStats { partition, reply } => {
                let opaque = self.alloc_opaque();
                let request = frame::seq_stat_request(opaque, partition);
                if let Err(err) = self.write.write_all(&request).await {
                    let _ = reply.send(Err(err.into()));
                    return;
                }
                self.pending.insert(opaque, Pending::Stats { reply });
            }
            Command::GetFailoverLog { partition, reply } => {
                let opaque = self.alloc_opaque();
                let request = frame::failover_log_request(opaque, partition);
                if let Err(err) = self.write.write_all(&request).await {
                    let _ = reply.send(Err(err.into()));
                    return;
                }
                self.pending.insert(opaque, Pending::FailoverLog { reply });
            }
            Command::Stop { .. } => unreachable!("handled by the select loop"),
        }
    }

    fn handle_response(&mut self, opaque: u32, response: ClientResponse) {
        let Some(pending) = self.pending.remove(&opaque) else {
            debug!(opaque, "response with no pending request, discarding");
            return;
        };
        match pending {
            Pending::AddStream { partition, reply } => {
                let result = match response {
                    ClientResponse::FailoverLog(log) => {
                        self.queues.insert(
                            opaque,
                            StreamQueue {
                                partition,
                                events: VecDeque::new(),
                                waiters: VecDeque::new(),
                            },
                        );
                        self.active.insert(partition, opaque);
                        debug!(partition, request_id = opaque, "stream open");
                        Ok((opaque, AddStreamOutcome::FailoverLog(log)))
                    }
                    ClientResponse::Rollback(seq) => Ok((opaque, AddStreamOutcome::Rollback(seq))),
                    ClientResponse::Failed(err) => Err(err),
                    other => protocol_violation("stream request", other),
                };
                let _ = reply.send(result);
            }
            Pending::RemoveStream { partition, reply } => {
                let result = match response {
                    ClientResponse::Ok => Ok(()),
                    // The server already dropped the stream; treat the
                    // close as done either way.
                    ClientResponse::Failed(StreamError::StreamNotFound) => Ok(()),
                    ClientResponse::Failed(err) => Err(err),
                    other => protocol_violation("stream close", other),
                };
                if result.is_ok() {
                    self.drop_stream(partition);
                }
                let _ = reply.send(result);
            }
            Pending::Stats { reply } => {
                let result = match response {
                    ClientResponse::Stats(pairs) => Ok(pairs),
                    ClientResponse::Failed(err) => Err(err),
                    other => protocol_violation("stat request", other),
                };
                let _ = reply.send(result);
            }
            Pending::FailoverLog { reply } => {
                let result = match response {
                    ClientResponse::FailoverLog(log) if log.is_empty() => {
                        Err(StreamError::NoFailoverLogFound)
                    }
                    ClientResponse::FailoverLog(log) => Ok(log),
                    ClientResponse::Failed(err) => Err(err),
                    other => protocol_violation("failover log request", other),
                };
                let _ = reply.send(result);
            }
        }
    }

    fn handle_event(&mut self, opaque: u32, event: StreamEvent) {
        let Some(queue) = self.queues.get_mut(&opaque) else {
            // Covers the race where a stream close overtakes in-flight
            // events.
            trace!(opaque, "event for unknown stream, discarding");
            return;
        };
        match queue.waiters.pop_front() {
            Some(waiter) => {
                let ended = matches!(event, StreamEvent::StreamEnd { .. });
                let _ = waiter.send(Ok(event));
                if ended {
                    self.forget_stream(opaque);
                }
            }
            None => queue.events.push_back(event),
        }
    }

    /// The stream ended normally: remove its queue, wake anyone still
    /// parked, unmap the partition.
    fn forget_stream(&mut self, request_id: u32) {
        if let Some(mut queue) = self.queues.remove(&request_id) {
            for waiter in queue.waiters.drain(..) {
                let _ = waiter.send(Err(StreamError::StreamNotFound));
            }
            self.active.remove(&queue.partition);
        }
    }

    /// A close succeeded: parked consumers see a stream-end, queued
    /// events are dropped.
    fn drop_stream(&mut self, partition: u16) {
        let Some(request_id) = self.active.remove(&partition) else {
            return;
        };
        if let Some(mut queue) = self.queues.remove(&request_id) {
            for waiter in queue.waiters.drain(..) {
                let _ = waiter.send(Ok(StreamEvent::StreamEnd { flags: 0 }));
            }
        }
        debug!(partition, request_id, "stream removed");
    }

    /// Connection is over: every pending request and parked waiter gets
    /// a closed error.
    fn fail_all(&mut self) {
        for (_, pending) in self.pending.drain() {
            match pending {
                Pending::AddStream { reply, .. } => {
                    let _ = reply.send(Err(StreamError::Closed));
                }
                Pending::RemoveStream { reply, .. } => {
                    let _ = reply.send(Err(StreamError::Closed));
                }
                Pending::Stats { reply } => {
                    let _ = reply.send(Err(StreamError::Closed));
                }
                Pending::FailoverLog { reply } => {
                    let _ = reply.send(Err(StreamError::Closed));
                }
            }
        }
        for (_, mut queue) in self.queues.drain() {
            for waiter in queue.waiters.drain(..) {
                let _ = waiter.send(Err(StreamError::Closed));
            }
        }
        self.active.clear();
    }
}

fn protocol_violation<T>(context: &str, response: ClientResponse) -> Result<T> {
    warn!(context, ?response, "response shape does not fit the request");
    Err(StreamError::Protocol(format!(
        "unexpected response to {context}"
    )))
}
