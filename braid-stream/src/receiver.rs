use std::collections::HashMap;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::{error, trace};

use crate::error::StreamError;
use crate::frame::{
    self, FrameHeader, HEADER_LEN, StreamEvent, opcode, parse_deletion, parse_failover_log,
    parse_mutation, parse_rollback_seq, parse_snapshot_marker, parse_stat_pair, parse_stream_end,
    status,
};

/// Reply carried by a response frame, already translated for the caller.
#[derive(Debug)]
pub(crate) enum ClientResponse {
    FailoverLog(frame::FailoverLog),
    Rollback(u64),
    Ok,
    Stats(Vec<(String, String)>),
    Failed(StreamError),
}

/// What the reader hands to the client coordinator.
#[derive(Debug)]
pub(crate) enum Dispatch {
    Response {
        opaque: u32,
        response: ClientResponse,
    },
    Event {
        opaque: u32,
        event: StreamEvent,
    },
    /// The reader is gone; the client stops with this reason.
    Closed { reason: StreamError },
}

/// Single reader loop owning the socket's read side. Every inbound frame
/// is parsed here and dispatched; any read error, torn frame, or unknown
/// opcode terminates the loop, and with it the client.
pub(crate) async fn run<R>(mut read: R, tx: mpsc::Sender<Dispatch>)
where
    R: AsyncRead + Unpin,
{
    // Stat responses repeat, one frame per pair, until a zero-body
    // terminator; collected here until then.
    let mut stats: HashMap<u32, Vec<(String, String)>> = HashMap::new();

    let reason = loop {
        let mut raw = [0u8; HEADER_LEN];
        if let Err(err) = read.read_exact(&mut raw).await {
            break closed_reason(err);
        }
        let header = FrameHeader::decode(&raw);
        let mut body = vec![0u8; header.body_len as usize];
        if let Err(err) = read.read_exact(&mut body).await {
            break closed_reason(err);
        }
        trace!(
            opcode = header.opcode,
            opaque = header.opaque,
            body_len = header.body_len,
            "frame"
        );

        let dispatch = match header.opcode {
            opcode::STREAM_REQUEST => {
                let response = match header.status() {
                    status::SUCCESS => match parse_failover_log(&body) {
                        Ok(log) => ClientResponse::FailoverLog(log),
                        Err(err) => break err,
                    },
                    status::ROLLBACK => match parse_rollback_seq(&body) {
                        Ok(seq) => ClientResponse::Rollback(seq),
                        Err(err) => break err,
                    },
                    code => ClientResponse::Failed(frame::status_error(code)),
                };
                Dispatch::Response {
                    opaque: header.opaque,
                    response,
                }
            }
            opcode::FAILOVER_LOG => {
                let response = match header.status() {
                    status::SUCCESS => match parse_failover_log(&body) {
                        Ok(log) => ClientResponse::FailoverLog(log),
                        Err(err) => break err,
                    },
                    code => ClientResponse::Failed(frame::status_error(code)),
                };
                Dispatch::Response {
                    opaque: header.opaque,
                    response,
                }
            }
            opcode::STREAM_CLOSE | opcode::SASL_AUTH | opcode::OPEN_CONNECTION => {
                let response = match header.status() {
                    status::SUCCESS => ClientResponse::Ok,
                    code => ClientResponse::Failed(frame::status_error(code)),
                };
                Dispatch::Response {
                    opaque: header.opaque,
                    response,
                }
            }
            opcode::STAT => {
                if header.status() != status::SUCCESS {
                    stats.remove(&header.opaque);
                    Dispatch::Response {
                        opaque: header.opaque,
                        response: ClientResponse::Failed(frame::status_error(header.status())),
                    }
                } else {
                    match parse_stat_pair(&header, &body) {
                        Err(err) => break err,
                        Ok(Some(pair)) => {
                            stats.entry(header.opaque).or_default().push(pair);
                            continue;
                        }
                        Ok(None) => Dispatch::Response {
                            opaque: header.opaque,
                            response: ClientResponse::Stats(
                                stats.remove(&header.opaque).unwrap_or_default(),
                            ),
                        },
                    }
                }
            }
            opcode::SNAPSHOT_MARKER => match parse_snapshot_marker(&header, &body) {
                Ok(event) => Dispatch::Event {
                    opaque: header.opaque,
                    event,
                },
                Err(err) => break err,
            },
            opcode::MUTATION => match parse_mutation(&header, &body) {
                Ok(event) => Dispatch::Event {
                    opaque: header.opaque,
                    event,
                },
                Err(err) => break err,
            },
            opcode::DELETION | opcode::EXPIRATION => match parse_deletion(&header, &body) {
                Ok(event) => Dispatch::Event {
                    opaque: header.opaque,
                    event,
                },
                Err(err) => break err,
            },
            opcode::STREAM_END => match parse_stream_end(&header, &body) {
                Ok(event) => Dispatch::Event {
                    opaque: header.opaque,
                    event,
                },
                Err(err) => break err,
            },
            unknown => {
                error!(opcode = unknown, "unknown opcode, stopping client");
                break StreamError::UnexpectedOpcode(unknown);
            }
        };

        if tx.send(dispatch).await.is_err() {
            // Coordinator is gone; nothing left to read for.
            return;
        }
    };

    let _ = tx.send(Dispatch::Closed { reason }).await;
}

fn closed_reason(err: std::io::Error) -> StreamError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        StreamError::Closed
    } else {
        StreamError::Io(err)
    }
}
