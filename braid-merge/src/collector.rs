use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::queue::QueueItem;

/// Event delivered to the caller's sink.
#[derive(Debug, Clone)]
pub enum MergeEvent {
    /// Emitted once, before any row, with the summed row count of every
    /// index that announced one.
    Start { total_rows: u64 },
    /// One merged data row.
    Row(Value),
    /// One index failed; the merge keeps going unless the sink stops it.
    Error { source: String, reason: String },
    /// Diagnostic payload from one index, passed through untouched.
    DebugInfo { source: String, blob: Value },
    /// The merged stream ended.
    Stop,
}

/// Sink verdict after each event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    /// Halt the merge; whatever the sink has accumulated is the reply.
    Stop,
}

/// Receives the merged event stream. The sink owns the accumulator; the
/// caller reads it back out after the query returns.
pub trait MergeSink: Send {
    fn on_event(&mut self, event: MergeEvent) -> Step;
}

/// Hook applied to each row before it reaches the sink.
pub type RowPreprocess = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Verdict of folding one queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fold {
    Continue,
    Halt,
}

enum State {
    /// Waiting for one row count per producer before announcing the total.
    Counting { pending: usize, total: u64 },
    Streaming,
}

/// Folds popped queue items into sink events, enforcing skip/limit.
pub(crate) struct RowCollector<'a> {
    state: State,
    skip: u64,
    limit: u64,
    preprocess: Option<RowPreprocess>,
    sink: &'a mut dyn MergeSink,
    finished: bool,
}

impl<'a> RowCollector<'a> {
    pub(crate) fn new(
        producers: usize,
        skip: u64,
        limit: u64,
        preprocess: Option<RowPreprocess>,
        sink: &'a mut dyn MergeSink,
    ) -> Self {
        Self {
            state: State::Counting {
                pending: producers,
                total: 0,
            },
            skip,
            limit,
            preprocess,
            sink,
            finished: false,
        }
    }

    pub(crate) fn on_item(&mut self, item: QueueItem) -> Fold {
        match item {
            QueueItem::RowCount(count) => match &mut self.state {
                State::Counting { pending, total } => {
                    *total += count;
                    *pending = pending.saturating_sub(1);
                    if *pending == 0 {
                        return self.start_streaming();
                    }
                    Fold::Continue
                }
                State::Streaming => {
                    debug!(count, "row count after streaming started, ignoring");
                    Fold::Continue
                }
            },
            QueueItem::Row(row) => {
                if self.start_streaming() == Fold::Halt {
                    return Fold::Halt;
                }
                if self.skip > 0 {
                    self.skip -= 1;
                    return Fold::Continue;
                }
                if self.limit == 0 {
                    return self.close();
                }
                let row = match &self.preprocess {
                    Some(f) => f(row),
                    None => row,
                };
                match self.sink.on_event(MergeEvent::Row(row)) {
                    Step::Continue => {
                        self.limit -= 1;
                        if self.limit == 0 {
                            return self.close();
                        }
                        Fold::Continue
                    }
                    Step::Stop => self.stop(),
                }
            }
            QueueItem::Error { source, reason } => {
                let step = self.sink.on_event(MergeEvent::Error { source, reason });
                // An errored index will never announce its row count.
                if let State::Counting { pending, total } = &mut self.state {
                    *pending = pending.saturating_sub(1);
                    if *pending == 0 {
                        let total = *total;
                        self.state = State::Streaming;
                        if step == Step::Continue {
                            if self.sink.on_event(MergeEvent::Start { total_rows: total })
                                == Step::Stop
                            {
                                return self.stop();
                            }
                            return Fold::Continue;
                        }
                    }
                }
                match step {
                    Step::Continue => Fold::Continue,
                    Step::Stop => self.stop(),
                }
            }
            QueueItem::DebugInfo { source, blob } => {
                match self.sink.on_event(MergeEvent::DebugInfo { source, blob }) {
                    Step::Continue => Fold::Continue,
                    Step::Stop => self.stop(),
                }
            }
            QueueItem::RevisionMismatch | QueueItem::SetViewOutdated => {
                // Intercepted by the coordinator before folding.
                warn!("restart sentinel reached the collector, ignoring");
                Fold::Continue
            }
        }
    }

    /// Close out the stream: emit `Start` if no row ever forced it, then the
    /// final `Stop` marker. Idempotent.
    pub(crate) fn close(&mut self) -> Fold {
        if self.finished {
            return Fold::Halt;
        }
        if self.start_streaming() == Fold::Halt {
            return Fold::Halt;
        }
        self.finished = true;
        self.sink.on_event(MergeEvent::Stop);
        Fold::Halt
    }

    fn start_streaming(&mut self) -> Fold {
        if let State::Counting { total, .. } = self.state {
            self.state = State::Streaming;
            if self.sink.on_event(MergeEvent::Start { total_rows: total }) == Step::Stop {
                return self.stop();
            }
        }
        Fold::Continue
    }

    // Sink asked to stop: the current accumulator is the reply, no Stop
    // marker follows.
    fn stop(&mut self) -> Fold {
        self.finished = true;
        Fold::Halt
    }
}
