//! Stream checkpoint manager: sequence-tagged resumable server streams.
//!
//! Grounded on `original_source/services/streaming_checkpoint.py`
//! (`StreamCheckpointManager`/`StreamState`/`StreamCheckpoint`), translated
//! into the teacher's `Arc<Mutex<..>>` + telemetry-on-transition idiom
//! instead of an `asyncio.Lock`-guarded dict.

use crate::call::{CallStream, StreamMessage};
use crate::clock::{Clock, MonotonicClock};
use crate::error::CallError;
use crate::telemetry::{emit_best_effort, CheckpointEvent, FabricEvent, NullSink, TelemetrySink};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub stream_id: String,
    pub sequence: u64,
    pub last_content: serde_json::Value,
    pub progress_percent: u8,
    pub at_millis: u64,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct StreamState {
    pub stream_id: String,
    pub started_at_millis: u64,
    pub checkpoints: Vec<Checkpoint>,
    pub total_messages: u64,
    pub completed: bool,
    pub error: Option<String>,
}

impl StreamState {
    fn new(stream_id: impl Into<String>, started_at_millis: u64) -> Self {
        Self {
            stream_id: stream_id.into(),
            started_at_millis,
            checkpoints: Vec::new(),
            total_messages: 0,
            completed: false,
            error: None,
        }
    }

    pub fn last_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }

    /// Terminal states (`completed` or `error`) disable resume, per spec.md §4.9.
    pub fn can_resume(&self) -> bool {
        !self.completed && self.error.is_none() && self.last_checkpoint().is_some()
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// A checkpoint is written every `interval` sequences, or at 100% progress.
    pub interval: u64,
    pub max_streams: usize,
    pub ttl: Duration,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self { interval: 10, max_streams: 100, ttl: Duration::from_secs(3600) }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CheckpointManagerStats {
    pub total_streams: usize,
    pub active_streams: usize,
    pub completed_streams: usize,
    pub failed_streams: usize,
}

/// Manages `StreamState` per `stream_id`, in-process only (spec.md §1
/// explicitly excludes durable persistence of checkpoint state across
/// restarts). LRU eviction by creation time at `max_streams`; TTL sweep on
/// every `start_stream`, mirroring `_cleanup_expired`/`_evict_oldest` in the
/// original implementation.
pub struct CheckpointManager<Sink = NullSink> {
    config: CheckpointConfig,
    clock: Arc<dyn Clock>,
    streams: Mutex<HashMap<String, StreamState>>,
    sink: Sink,
}

impl CheckpointManager<NullSink> {
    pub fn new(config: CheckpointConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(config: CheckpointConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock, streams: Mutex::new(HashMap::new()), sink: NullSink }
    }
}

impl<Sink> CheckpointManager<Sink>
where
    Sink: Clone,
{
    pub fn with_sink<NewSink: Clone>(self, sink: NewSink) -> CheckpointManager<NewSink> {
        CheckpointManager { config: self.config, clock: self.clock, streams: self.streams, sink }
    }
}

impl<Sink> CheckpointManager<Sink>
where
    Sink: TelemetrySink + Clone + Send + 'static,
    <Sink as tower::Service<FabricEvent>>::Future: Send,
{
    /// Starts (or restarts) a stream, running the TTL sweep and, if the
    /// active-stream cap is hit, evicting the oldest stream by creation time.
    pub fn start_stream(&self, stream_id: &str) -> StreamState {
        let now = self.clock.now_millis();
        let mut streams = self.streams.lock().unwrap();

        streams.retain(|_, s| now.saturating_sub(s.started_at_millis) <= self.config.ttl.as_millis() as u64);

        if streams.len() >= self.config.max_streams && !streams.contains_key(stream_id) {
            if let Some(oldest) = streams.values().min_by_key(|s| s.started_at_millis).map(|s| s.stream_id.clone()) {
                streams.remove(&oldest);
                self.emit(FabricEvent::Checkpoint(CheckpointEvent::Evicted { stream_id: oldest }));
            }
        }

        let state = StreamState::new(stream_id, now);
        streams.insert(stream_id.to_string(), state.clone());
        state
    }

    /// Records a checkpoint when `sequence % interval == 0` or
    /// `progress_percent >= 100`. Always advances `total_messages`.
    pub fn checkpoint(
        &self,
        stream_id: &str,
        sequence: u64,
        content: serde_json::Value,
        progress_percent: u8,
        metadata: HashMap<String, String>,
    ) -> Option<Checkpoint> {
        let now = self.clock.now_millis();
        let mut streams = self.streams.lock().unwrap();
        let state = streams.get_mut(stream_id)?;
        state.total_messages = sequence + 1;

        if sequence % self.config.interval.max(1) == 0 || progress_percent >= 100 {
            let checkpoint = Checkpoint {
                stream_id: stream_id.to_string(),
                sequence,
                last_content: content,
                progress_percent,
                at_millis: now,
                metadata,
            };
            state.checkpoints.push(checkpoint.clone());
            drop(streams);
            self.emit(FabricEvent::Checkpoint(CheckpointEvent::Written {
                stream_id: stream_id.to_string(),
                sequence,
            }));
            return Some(checkpoint);
        }
        None
    }

    /// Returns the latest checkpoint as a resume hint, or `None` if the
    /// stream is terminal or has no checkpoints yet.
    pub fn get_resume_point(&self, stream_id: &str) -> Option<Checkpoint> {
        let streams = self.streams.lock().unwrap();
        let state = streams.get(stream_id)?;
        if state.can_resume() {
            state.last_checkpoint().cloned()
        } else {
            None
        }
    }

    pub fn complete_stream(&self, stream_id: &str) {
        let completed = {
            let mut streams = self.streams.lock().unwrap();
            match streams.get_mut(stream_id) {
                Some(state) => {
                    state.completed = true;
                    true
                }
                None => false,
            }
        };
        if completed {
            self.emit(FabricEvent::Checkpoint(CheckpointEvent::Completed { stream_id: stream_id.to_string() }));
        }
    }

    pub fn fail_stream(&self, stream_id: &str, error: impl Into<String>) {
        let mut streams = self.streams.lock().unwrap();
        if let Some(state) = streams.get_mut(stream_id) {
            state.error = Some(error.into());
        }
    }

    pub fn get_state(&self, stream_id: &str) -> Option<StreamState> {
        self.streams.lock().unwrap().get(stream_id).cloned()
    }

    pub fn stats(&self) -> CheckpointManagerStats {
        let streams = self.streams.lock().unwrap();
        CheckpointManagerStats {
            total_streams: streams.len(),
            active_streams: streams.values().filter(|s| !s.completed).count(),
            completed_streams: streams.values().filter(|s| s.completed).count(),
            failed_streams: streams.values().filter(|s| s.error.is_some()).count(),
        }
    }

    fn emit(&self, event: FabricEvent) {
        let sink = self.sink.clone();
        tokio::spawn(async move {
            emit_best_effort(sink, event).await;
        });
    }
}

/// Drives a `CallStream` against a `CheckpointManager`, mirroring the
/// original `ResumableStreamWrapper`/`create_resumable_stream` pair: opens
/// fresh via `stream_factory` when there is nothing to resume, or via
/// `resume_factory(last_sequence)` when a resumable checkpoint exists.
/// Messages at or before the last checkpointed sequence are dropped on
/// arrival rather than re-checkpointed or re-delivered, since a
/// `resume_factory` reconnect may replay the boundary message.
pub struct ResumableStream<Sink = NullSink> {
    stream_id: String,
    manager: Arc<CheckpointManager<Sink>>,
}

impl<Sink> ResumableStream<Sink>
where
    Sink: TelemetrySink + Clone + Send + 'static,
    <Sink as tower::Service<FabricEvent>>::Future: Send,
{
    pub fn new(stream_id: impl Into<String>, manager: Arc<CheckpointManager<Sink>>) -> Self {
        Self { stream_id: stream_id.into(), manager }
    }

    /// Consumes the stream to completion, calling `on_message` for each
    /// message accepted (i.e. not a duplicate of an already-checkpointed
    /// sequence). Marks the stream completed on a clean end, or failed with
    /// the error's message on an error return from the underlying stream.
    pub async fn run<FreshFut, ResumeFut>(
        &self,
        stream_factory: impl FnOnce() -> FreshFut,
        resume_factory: Option<impl FnOnce(u64) -> ResumeFut>,
        mut on_message: impl FnMut(&StreamMessage),
    ) -> Result<(), CallError>
    where
        FreshFut: Future<Output = Result<Box<dyn CallStream>, CallError>>,
        ResumeFut: Future<Output = Result<Box<dyn CallStream>, CallError>>,
    {
        // Only initialize fresh state for a stream id seen for the first
        // time. A reconnect against an existing, still-resumable stream id
        // must not call `start_stream` again, since that would overwrite
        // the very checkpoint history being resumed from.
        if self.manager.get_state(&self.stream_id).is_none() {
            self.manager.start_stream(&self.stream_id);
        }
        let resume_point = self.manager.get_resume_point(&self.stream_id);
        let mut last_seen = resume_point.as_ref().map(|c| c.sequence);

        let opened = match (resume_point, resume_factory) {
            (Some(checkpoint), Some(factory)) => factory(checkpoint.sequence).await,
            _ => stream_factory().await,
        };

        let mut stream = match opened {
            Ok(s) => s,
            Err(e) => {
                self.manager.fail_stream(&self.stream_id, e.message.clone());
                return Err(e);
            }
        };

        let outcome = self.drain(&mut *stream, &mut last_seen, &mut on_message).await;
        match outcome {
            Ok(()) => {
                self.manager.complete_stream(&self.stream_id);
                Ok(())
            }
            Err(e) => {
                self.manager.fail_stream(&self.stream_id, e.message.clone());
                Err(e)
            }
        }
    }

    async fn drain(
        &self,
        stream: &mut dyn CallStream,
        last_seen: &mut Option<u64>,
        on_message: &mut impl FnMut(&StreamMessage),
    ) -> Result<(), CallError> {
        while let Some(message) = stream.next_message().await? {
            if last_seen.is_some_and(|last| message.sequence <= last) {
                continue;
            }
            *last_seen = Some(message.sequence);
            self.manager.checkpoint(
                &self.stream_id,
                message.sequence,
                message.payload.clone(),
                message.progress_percent,
                HashMap::new(),
            );
            on_message(&message);
        }
        Ok(())
    }
}
