//! Passthrough stream logging.
//!
//! `wrap` taps a live agent byte stream: every chunk is forwarded to the
//! client unmodified and in order, while a decode-and-fork side channel
//! normalizes the chunk's SSE records and persists them. Persistence is
//! fire-and-forget: appends are handed to a writer task over an
//! unbounded channel and never awaited on the chunk path, so the worst a
//! logging failure can do is leave a hole in the transcript.

use std::sync::Arc;

use async_stream::stream;
use bytes::Bytes;
use chrono::Utc;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webqa_protocol::{EventFamily, EventRecord, RunId, RunStatus, normalize};
use webqa_store::{EventStore, RunStore, Store};

use crate::sse::SseLineDecoder;

enum WriterOp {
    Append(EventRecord),
    Finish { status: RunStatus },
}

/// Per-wrap bookkeeping. Constructed fresh for every `wrap` call and
/// never shared across streams; if two loggers were ever attached to the
/// same run, the store's per-run sequence check would reject the second
/// writer's rows rather than corrupt the log.
struct LogSession {
    run_id: RunId,
    sequence: u64,
    has_error: bool,
    is_finished: bool,
    decoder: SseLineDecoder,
    writer: mpsc::UnboundedSender<WriterOp>,
}

impl LogSession {
    fn observe_chunk(&mut self, chunk: &[u8]) {
        for payload in self.decoder.push_chunk(chunk) {
            self.observe_payload(&payload);
        }
    }

    fn observe_payload(&mut self, payload: &str) {
        let Ok(raw) = serde_json::from_str::<serde_json::Value>(payload) else {
            debug!(run_id = %self.run_id, "dropping unparseable stream record");
            return;
        };
        let Some(normalized) = normalize(&raw) else {
            debug!(run_id = %self.run_id, "dropping unrecognizable stream record");
            return;
        };

        if normalized.family == EventFamily::Error {
            self.has_error = true;
        }
        let explicit_finish = normalized.event_type == "finish";

        let event = EventRecord::from_normalized(self.run_id.clone(), self.sequence, normalized);
        self.sequence += 1;
        if self.writer.send(WriterOp::Append(event)).is_err() {
            warn!(run_id = %self.run_id, "event writer gone; log entry dropped");
        }

        if explicit_finish {
            self.finish_run();
        }
    }

    fn observe_end(&mut self) {
        if let Some(payload) = self.decoder.finish() {
            self.observe_payload(&payload);
        }
        self.finish_run();
    }

    /// Terminal update, at most once per wrap. The store-side
    /// only-transition-if-still-running guard covers the rest: an
    /// out-of-band cancellation that already closed the run is never
    /// overwritten.
    fn finish_run(&mut self) {
        if self.is_finished {
            return;
        }
        self.is_finished = true;

        let status = if self.has_error {
            RunStatus::Error
        } else {
            RunStatus::Passed
        };
        if self.writer.send(WriterOp::Finish { status }).is_err() {
            warn!(run_id = %self.run_id, "event writer gone; terminal update dropped");
        }
    }
}

/// Tap a live agent byte stream for the given run.
///
/// The returned stream yields exactly the upstream items (same bytes,
/// same chunking, same order, errors included) and persists every
/// recognizable `data:` record as a side effect. The run's terminal
/// update fires on an explicit `finish` event or, failing that, on end
/// of input, so a run is never left running by this layer's own
/// lifecycle.
pub fn wrap<S, E>(
    upstream: S,
    store: Arc<dyn Store>,
    run_id: RunId,
) -> impl Stream<Item = Result<Bytes, E>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Send + 'static,
{
    let (writer, ops) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(drain_writer(store, run_id.clone(), ops));

    let mut session = LogSession {
        run_id,
        sequence: 0,
        has_error: false,
        is_finished: false,
        decoder: SseLineDecoder::default(),
        writer,
    };

    stream! {
        let mut upstream = std::pin::pin!(upstream);
        while let Some(item) = upstream.next().await {
            if let Ok(chunk) = &item {
                session.observe_chunk(chunk);
            }
            yield item;
        }
        session.observe_end();

        // All bytes are already delivered; wait out the writer so the
        // log and the terminal update are durable when the stream ends.
        drop(session);
        if let Err(error) = writer_task.await {
            warn!(%error, "event writer task failed");
        }
    }
}

/// Sole consumer of a wrap's log channel: appends in emission order and
/// applies the terminal update, reporting failures to the diagnostic log
/// and nothing else.
async fn drain_writer(
    store: Arc<dyn Store>,
    run_id: RunId,
    mut ops: mpsc::UnboundedReceiver<WriterOp>,
) {
    while let Some(op) = ops.recv().await {
        match op {
            WriterOp::Append(event) => {
                let sequence = event.sequence;
                if let Err(error) = store.append(&event).await {
                    warn!(run_id = %run_id, sequence, %error, "failed to persist stream event");
                }
            }
            WriterOp::Finish { status } => {
                match store.finish_if_running(&run_id, status, Utc::now()).await {
                    Ok(true) => debug!(run_id = %run_id, status = ?status, "run finished"),
                    Ok(false) => {
                        debug!(run_id = %run_id, "run already terminal; finish skipped");
                    }
                    Err(error) => warn!(run_id = %run_id, %error, "failed to finish run"),
                }
            }
        }
    }
}
