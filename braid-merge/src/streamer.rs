use serde_json::Value;

use crate::error::{MergeError, Result};

/// One item recovered from a streamed merge response body.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StreamedItem {
    TotalRows(u64),
    Row(Value),
    ErrorEntry(Value),
    DebugInfo(Value),
}

/// Incremental parser for the chunked merge response
/// `{"total_rows":N,"rows":[..],"errors":[..],"debug_info":{..}}`.
///
/// Rows are emitted as soon as their bytes are complete, so a slow remote
/// never forces buffering the whole body. Values may be split at any byte
/// boundary between chunks. Unknown top-level keys are skipped.
pub(crate) struct RowStreamer {
    state: State,
    target: Target,
    capture: Capture,
    scratch: Vec<u8>,
    key: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Expect the opening brace of the response object.
    Start,
    /// Expect a key, or the closing brace right after `{`.
    KeyOrEnd,
    /// Expect a key after a comma.
    ExpectKey,
    InKey,
    KeyEscape,
    /// Expect the colon between key and value.
    AfterKey,
    /// Dispatch on the first byte of a top-level value.
    ValueStart,
    /// Capturing a complete top-level value into scratch.
    InValue,
    /// Expect `,` or `}` after a value.
    AfterValue,
    /// Inside a rows/errors array, before an element or `]`.
    ArrayStart,
    /// Capturing one array element.
    InElement,
    /// Expect `,` or `]` after an element.
    AfterElement,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    TotalRows,
    Rows,
    Errors,
    DebugInfo,
    Skip,
}

#[derive(Debug, Clone, Copy)]
enum ValueKind {
    Compound,
    Str,
    Scalar,
}

struct Capture {
    kind: ValueKind,
    depth: u32,
    in_string: bool,
    escaped: bool,
}

enum CaptureStep {
    Continue,
    /// Value complete; `consumed` tells whether the terminating byte
    /// belongs to the value or must be reprocessed.
    Complete { consumed: bool },
}

impl RowStreamer {
    pub(crate) fn new() -> Self {
        Self {
            state: State::Start,
            target: Target::Skip,
            capture: Capture {
                kind: ValueKind::Scalar,
                depth: 0,
                in_string: false,
                escaped: false,
            },
            scratch: Vec::new(),
            key: Vec::new(),
        }
    }

    /// Feed one chunk, appending every completed item to `out`.
    pub(crate) fn feed(&mut self, chunk: &[u8], out: &mut Vec<StreamedItem>) -> Result<()> {
        let mut i = 0;
        while i < chunk.len() {
            let b = chunk[i];
            match self.state {
                State::Start => {
                    if b == b'{' {
                        self.state = State::KeyOrEnd;
                    } else if !b.is_ascii_whitespace() {
                        return Err(unexpected(b, "response object"));
                    }
                    i += 1;
                }
                State::KeyOrEnd | State::ExpectKey => {
                    if b == b'"' {
                        self.key.clear();
                        self.state = State::InKey;
                    } else if b == b'}' && self.state == State::KeyOrEnd {
                        self.state = State::Done;
                    } else if !b.is_ascii_whitespace() {
                        return Err(unexpected(b, "object key"));
                    }
                    i += 1;
                }
                State::InKey => {
                    match b {
                        b'\\' => self.state = State::KeyEscape,
                        b'"' => {
                            self.target = match self.key.as_slice() {
                                b"total_rows" => Target::TotalRows,
                                b"rows" => Target::Rows,
                                b"errors" => Target::Errors,
                                b"debug_info" => Target::DebugInfo,
                                _ => Target::Skip,
                            };
                            self.state = State::AfterKey;
                        }
                        _ => self.key.push(b),
                    }
                    i += 1;
                }
                State::KeyEscape => {
                    self.key.push(b);
                    self.state = State::InKey;
                    i += 1;
                }
                State::AfterKey => {
                    if b == b':' {
                        self.state = State::ValueStart;
                    } else if !b.is_ascii_whitespace() {
                        return Err(unexpected(b, "colon"));
                    }
                    i += 1;
                }
                State::ValueStart => {
                    if b.is_ascii_whitespace() {
                        i += 1;
                    } else if matches!(self.target, Target::Rows | Target::Errors) {
                        if b != b'[' {
                            return Err(unexpected(b, "array"));
                        }
                        self.state = State::ArrayStart;
                        i += 1;
                    } else {
                        self.begin_capture(b)?;
                        self.state = State::InValue;
                        i += 1;
                    }
                }
                State::InValue => match self.capture_byte(b) {
                    CaptureStep::Continue => i += 1,
                    CaptureStep::Complete { consumed } => {
                        if consumed {
                            i += 1;
                        }
                        self.emit_value(out)?;
                        self.state = State::AfterValue;
                    }
                },
                State::AfterValue => {
                    if b == b',' {
                        self.state = State::ExpectKey;
                    } else if b == b'}' {
                        self.state = State::Done;
                    } else if !b.is_ascii_whitespace() {
                        return Err(unexpected(b, "comma or closing brace"));
                    }
                    i += 1;
                }
                State::ArrayStart => {
                    if b == b']' {
                        self.state = State::AfterValue;
                        i += 1;
                    } else if b.is_ascii_whitespace() {
                        i += 1;
                    } else {
                        self.begin_capture(b)?;
                        self.state = State::InElement;
                        i += 1;
                    }
                }
                State::InElement => match self.capture_byte(b) {
                    CaptureStep::Continue => i += 1,
                    CaptureStep::Complete { consumed } => {
                        if consumed {
                            i += 1;
                        }
                        self.emit_element(out)?;
                        self.state = State::AfterElement;
                    }
                },
                State::AfterElement => {
                    if b == b',' {
                        self.state = State::ArrayStart;
                    } else if b == b']' {
                        self.state = State::AfterValue;
                    } else if !b.is_ascii_whitespace() {
                        return Err(unexpected(b, "comma or closing bracket"));
                    }
                    i += 1;
                }
                State::Done => {
                    if !b.is_ascii_whitespace() {
                        return Err(unexpected(b, "end of response"));
                    }
                    i += 1;
                }
            }
        }
        Ok(())
    }

    /// Verify the body ended on the closing brace.
    pub(crate) fn finish(&self) -> Result<()> {
        if self.state == State::Done {
            Ok(())
        } else {
            Err(MergeError::MalformedResponse(
                "truncated response body".into(),
            ))
        }
    }

    fn begin_capture(&mut self, b: u8) -> Result<()> {
        let kind = match b {
            b'{' | b'[' => ValueKind::Compound,
            b'"' => ValueKind::Str,
            b'-' | b'0'..=b'9' | b't' | b'f' | b'n' => ValueKind::Scalar,
            _ => return Err(unexpected(b, "value")),
        };
        self.scratch.clear();
        self.scratch.push(b);
        self.capture = Capture {
            kind,
            depth: matches!(kind, ValueKind::Compound) as u32,
            in_string: matches!(kind, ValueKind::Str),
            escaped: false,
        };
        Ok(())
    }

    fn capture_byte(&mut self, b: u8) -> CaptureStep {
        let capture = &mut self.capture;
        match capture.kind {
            ValueKind::Str => {
                self.scratch.push(b);
                if capture.escaped {
                    capture.escaped = false;
                } else if b == b'\\' {
                    capture.escaped = true;
                } else if b == b'"' {
                    return CaptureStep::Complete { consumed: true };
                }
                CaptureStep::Continue
            }
            ValueKind::Compound => {
                self.scratch.push(b);
                if capture.in_string {
                    if capture.escaped {
                        capture.escaped = false;
                    } else if b == b'\\' {
                        capture.escaped = true;
                    } else if b == b'"' {
                        capture.in_string = false;
                    }
                } else {
                    match b {
                        b'"' => capture.in_string = true,
                        b'{' | b'[' => capture.depth += 1,
                        b'}' | b']' => {
                            capture.depth -= 1;
                            if capture.depth == 0 {
                                return CaptureStep::Complete { consumed: true };
                            }
                        }
                        _ => {}
                    }
                }
                CaptureStep::Continue
            }
            ValueKind::Scalar => {
                if matches!(b, b',' | b'}' | b']') || b.is_ascii_whitespace() {
                    CaptureStep::Complete { consumed: false }
                } else {
                    self.scratch.push(b);
                    CaptureStep::Continue
                }
            }
        }
    }

    fn emit_value(&mut self, out: &mut Vec<StreamedItem>) -> Result<()> {
        match self.target {
            Target::TotalRows => {
                let total: u64 = serde_json::from_slice(&self.scratch)?;
                out.push(StreamedItem::TotalRows(total));
            }
            Target::DebugInfo => {
                let blob: Value = serde_json::from_slice(&self.scratch)?;
                out.push(StreamedItem::DebugInfo(blob));
            }
            Target::Skip => {}
            // Arrays never land here; their elements go through
            // emit_element.
            Target::Rows | Target::Errors => {
                return Err(MergeError::MalformedResponse(
                    "array captured as scalar".into(),
                ));
            }
        }
        Ok(())
    }

    fn emit_element(&mut self, out: &mut Vec<StreamedItem>) -> Result<()> {
        let value: Value = serde_json::from_slice(&self.scratch)?;
        match self.target {
            Target::Rows => out.push(StreamedItem::Row(value)),
            Target::Errors => out.push(StreamedItem::ErrorEntry(value)),
            _ => {
                return Err(MergeError::MalformedResponse(
                    "element outside rows or errors".into(),
                ));
            }
        }
        Ok(())
    }
}

fn unexpected(byte: u8, expected: &str) -> MergeError {
    MergeError::MalformedResponse(format!(
        "unexpected byte {:?} while reading {expected}",
        byte as char
    ))
}
