//! A scripted protocol server: accepts the handshake, then answers
//! stream requests, stat requests, and failover-log requests from a
//! per-partition script.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use braid_stream::frame::{
    self, FailoverLog, FrameHeader, HEADER_LEN, Mutation, opcode, status,
};

#[derive(Clone)]
pub struct Doc {
    pub seq: u64,
    pub key: String,
    pub value: String,
    pub deleted: bool,
}

pub fn doc(seq: u64) -> Doc {
    Doc {
        seq,
        key: format!("doc-{seq}"),
        value: format!("{{\"seq\":{seq}}}"),
        deleted: false,
    }
}

#[derive(Clone)]
pub enum StreamScript {
    /// Refuse stream requests with this status code.
    Refuse(u16),
    /// Demand a rollback to this sequence.
    Rollback(u64),
    /// Accept (if the request's uuid appears in `log`), stream the docs
    /// within the requested range, then end the stream unless `hold_end`.
    Docs {
        log: FailoverLog,
        docs: Vec<Doc>,
        hold_end: bool,
        /// Drop the whole connection after streaming the docs.
        drop_conn: bool,
    },
}

impl StreamScript {
    pub fn docs(log: FailoverLog, docs: Vec<Doc>) -> Self {
        StreamScript::Docs {
            log,
            docs,
            hold_end: false,
            drop_conn: false,
        }
    }
}

#[derive(Clone, Default)]
pub struct MockServer {
    pub password: Option<String>,
    pub partitions: HashMap<u16, StreamScript>,
}

impl MockServer {
    pub fn with_partition(partition: u16, script: StreamScript) -> Self {
        Self {
            password: None,
            partitions: HashMap::from([(partition, script)]),
        }
    }

    pub async fn spawn(self) -> SocketAddr {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let server = self.clone();
                tokio::spawn(async move {
                    let _ = server.handle_connection(stream).await;
                });
            }
        });
        addr
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> std::io::Result<()> {
        let mut open: HashSet<u16> = HashSet::new();
        loop {
            let mut raw = [0u8; HEADER_LEN];
            stream.read_exact(&mut raw).await?;
            let header = FrameHeader::decode(&raw);
            let mut body = vec![0u8; header.body_len as usize];
            stream.read_exact(&mut body).await?;

            match header.opcode {
                opcode::SASL_AUTH => {
                    let authorized = match &self.password {
                        None => true,
                        Some(expected) => {
                            let value = &body[header.key_len as usize..];
                            value.ends_with(format!("\0{expected}").as_bytes())
                        }
                    };
                    let code = if authorized {
                        status::SUCCESS
                    } else {
                        status::SASL_AUTH_FAILED
                    };
                    stream
                        .write_all(&frame::status_response(
                            opcode::SASL_AUTH,
                            code,
                            header.opaque,
                        ))
                        .await?;
                }
                opcode::OPEN_CONNECTION => {
                    stream
                        .write_all(&frame::status_response(
                            opcode::OPEN_CONNECTION,
                            status::SUCCESS,
                            header.opaque,
                        ))
                        .await?;
                }
                opcode::STREAM_REQUEST => {
                    let params = frame::parse_stream_request(&header, &body).unwrap();
                    let partition = header.partition;
                    match self.partitions.get(&partition) {
                        None => {
                            stream
                                .write_all(&frame::status_response(
                                    opcode::STREAM_REQUEST,
                                    status::NOT_MY_VBUCKET,
                                    header.opaque,
                                ))
                                .await?;
                        }
                        Some(StreamScript::Refuse(code)) => {
                            stream
                                .write_all(&frame::status_response(
                                    opcode::STREAM_REQUEST,
                                    *code,
                                    header.opaque,
                                ))
                                .await?;
                        }
                        Some(StreamScript::Rollback(seq)) => {
                            stream
                                .write_all(&frame::rollback_response(header.opaque, *seq))
                                .await?;
                        }
                        Some(StreamScript::Docs {
                            log,
                            docs,
                            hold_end,
                            drop_conn,
                        }) => {
                            if open.contains(&partition) {
                                stream
                                    .write_all(&frame::status_response(
                                        opcode::STREAM_REQUEST,
                                        status::KEY_EEXISTS,
                                        header.opaque,
                                    ))
                                    .await?;
                                continue;
                            }
                            if !log.iter().any(|entry| entry.uuid == params.uuid) {
                                stream
                                    .write_all(&frame::status_response(
                                        opcode::STREAM_REQUEST,
                                        status::KEY_NOT_FOUND,
                                        header.opaque,
                                    ))
                                    .await?;
                                continue;
                            }
                            open.insert(partition);
                            stream
                                .write_all(&frame::failover_log_response(
                                    opcode::STREAM_REQUEST,
                                    header.opaque,
                                    log,
                                ))
                                .await?;
                            stream
                                .write_all(&frame::snapshot_marker_event(
                                    header.opaque,
                                    partition,
                                    params.start_seq + 1,
                                    params.end_seq,
                                    1,
                                ))
                                .await?;
                            for doc in docs {
                                if doc.seq <= params.start_seq || doc.seq > params.end_seq {
                                    continue;
                                }
                                let event = if doc.deleted {
                                    frame::deletion_event(
                                        header.opaque,
                                        opcode::DELETION,
                                        &frame::Deletion {
                                            partition,
                                            seq: doc.seq,
                                            rev_seq: 1,
                                            key: doc.key.clone().into(),
                                            metadata: bytes::Bytes::new(),
                                        },
                                    )
                                } else {
                                    frame::mutation_event(
                                        header.opaque,
                                        &Mutation {
                                            partition,
                                            seq: doc.seq,
                                            rev_seq: 1,
                                            flags: 0,
                                            expiration: 0,
                                            cas: doc.seq,
                                            key: doc.key.clone().into(),
                                            value: doc.value.clone().into(),
                                        },
                                    )
                                };
                                stream.write_all(&event).await?;
                            }
                            if *drop_conn {
                                return Ok(());
                            }
                            if !*hold_end {
                                stream
                                    .write_all(&frame::stream_end_event(
                                        header.opaque,
                                        partition,
                                        0,
                                    ))
                                    .await?;
                                open.remove(&partition);
                            }
                        }
                    }
                }
                opcode::STREAM_CLOSE => {
                    let code = if open.remove(&header.partition) {
                        status::SUCCESS
                    } else {
                        status::NOT_MY_VBUCKET
                    };
                    stream
                        .write_all(&frame::status_response(
                            opcode::STREAM_CLOSE,
                            code,
                            header.opaque,
                        ))
                        .await?;
                }
                opcode::STAT => {
                    match self.partitions.get(&header.partition) {
                        Some(StreamScript::Docs { docs, .. }) => {
                            let high = docs.iter().map(|d| d.seq).max().unwrap_or(0);
                            let key = format!("vbucket-seqno {}", header.partition);
                            stream
                                .write_all(&frame::stat_response(
                                    header.opaque,
                                    &key,
                                    &high.to_string(),
                                ))
                                .await?;
                            stream
                                .write_all(&frame::stat_end_response(header.opaque))
                                .await?;
                        }
                        _ => {
                            stream
                                .write_all(&frame::status_response(
                                    opcode::STAT,
                                    status::NOT_MY_VBUCKET,
                                    header.opaque,
                                ))
                                .await?;
                        }
                    }
                }
                opcode::FAILOVER_LOG => {
                    let log = match self.partitions.get(&header.partition) {
                        Some(StreamScript::Docs { log, .. }) => log.clone(),
                        _ => FailoverLog::new(),
                    };
                    stream
                        .write_all(&frame::failover_log_response(
                            opcode::FAILOVER_LOG,
                            header.opaque,
                            &log,
                        ))
                        .await?;
                }
                _ => return Ok(()),
            }
        }
    }
}
