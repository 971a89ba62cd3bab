//! # Inference Stream Adapter
//!
//! Turns a blocking [`InferenceEngine`] into an async, forward-only stream of
//! [`InferenceChunk`]s. The engine runs on tokio's blocking pool and hands each
//! text delta over a bounded channel as soon as it is produced, so synthesis can
//! start long before generation ends and no runtime worker thread is ever blocked.
//!
//! A stream always ends with exactly one of `Ok(EndOfStream)` or `Err(_)`. It
//! cannot be restarted; every request builds a new one.
//!
//! The blocking task is owned through a [`PumpHandle`]. Dropping the stream alone
//! does not wait for the engine; [`PumpHandle::stop`] cancels it between steps and
//! returns once the engine (and any lock it holds) has been released.

use crate::error::SessionError;
use crate::inference::engine::{EngineOutput, InferenceEngine, InferenceRequest};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tracing::{debug, warn};

/// One step of generated output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InferenceChunk {
    TextDelta(String),
    EndOfStream,
}

type ChunkResult = Result<InferenceChunk, SessionError>;

/// Async view over a running inference pump.
#[derive(Debug)]
pub struct InferenceStream {
    chunks: ReceiverStream<ChunkResult>,
    finished: bool,
}

/// Ownership of the blocking task that drives the engine.
#[derive(Debug)]
pub struct PumpHandle {
    cancel: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl PumpHandle {
    /// Stop generating at the next engine step and wait for the pump to return.
    pub async fn stop(self) {
        self.cancel.store(true, Ordering::Release);
        if let Err(e) = self.task.await {
            if e.is_panic() {
                warn!("Inference pump panicked");
            }
        }
    }
}

impl InferenceStream {
    /// Start generating on the blocking pool.
    ///
    /// Fails immediately with `EngineUnavailable` if no engine is installed;
    /// nothing is spawned in that case.
    pub fn start(
        engine: Option<Arc<dyn InferenceEngine>>,
        request: InferenceRequest,
        buffer: usize,
    ) -> Result<(Self, PumpHandle), SessionError> {
        let engine = engine.ok_or(SessionError::EngineUnavailable)?;
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let cancel = Arc::new(AtomicBool::new(false));

        let flag = cancel.clone();
        let task = tokio::task::spawn_blocking(move || pump(engine.as_ref(), request, tx, &flag));

        let stream = Self {
            chunks: ReceiverStream::new(rx),
            finished: false,
        };
        Ok((stream, PumpHandle { cancel, task }))
    }
}

/// Drive the engine to completion, forwarding text as it appears.
///
/// Returns early when `cancel` is set or the stream has been dropped.
fn pump(engine: &dyn InferenceEngine, request: InferenceRequest, tx: mpsc::Sender<ChunkResult>, cancel: &AtomicBool) {
    let mut outputs = match engine.infer_stream(request) {
        Ok(outputs) => outputs,
        Err(e) => {
            warn!(engine = %engine.name(), "Inference failed to start: {:#}", e);
            let _ = tx.blocking_send(Err(SessionError::Inference(format!("{:#}", e))));
            return;
        }
    };

    let mut deltas = 0usize;
    loop {
        if cancel.load(Ordering::Acquire) {
            debug!(deltas, "Inference cancelled");
            return;
        }
        let Some(output) = outputs.next() else {
            break;
        };

        match output {
            Ok(EngineOutput::Text(text)) => {
                if text.is_empty() {
                    continue;
                }
                if tx.blocking_send(Ok(InferenceChunk::TextDelta(text))).is_err() {
                    debug!(deltas, "Inference consumer went away, stopping pump");
                    return;
                }
                deltas += 1;
            }
            Ok(EngineOutput::Marker) => {}
            Err(e) => {
                warn!(deltas, "Inference failed mid-stream: {:#}", e);
                let _ = tx.blocking_send(Err(SessionError::Inference(format!("{:#}", e))));
                return;
            }
        }
    }

    debug!(deltas, "Inference pump finished");
    let _ = tx.blocking_send(Ok(InferenceChunk::EndOfStream));
}

impl Stream for InferenceStream {
    type Item = ChunkResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        match Pin::new(&mut self.chunks).poll_next(cx) {
            Poll::Ready(Some(item)) => {
                if matches!(item, Ok(InferenceChunk::EndOfStream) | Err(_)) {
                    self.finished = true;
                }
                Poll::Ready(Some(item))
            }
            // The pump dropped its sender without a terminal item: it panicked.
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(Some(Err(SessionError::Inference(
                    "inference pump stopped before end of stream".to_string(),
                ))))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::engine::EngineOutputs;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_stream::StreamExt;

    fn request(prompt: &str) -> InferenceRequest {
        InferenceRequest {
            prompt: prompt.to_string(),
            audio: Arc::from(vec![0u8; 32]),
            max_new_tokens: 10,
            temperature: 0.0,
            history: Arc::from(Vec::new()),
        }
    }

    struct Scripted(Vec<anyhow::Result<EngineOutput>>);

    impl InferenceEngine for Scripted {
        fn name(&self) -> String {
            "scripted".to_string()
        }

        fn infer_stream(&self, _request: InferenceRequest) -> anyhow::Result<EngineOutputs<'_>> {
            let items: Vec<_> = self
                .0
                .iter()
                .map(|item| match item {
                    Ok(output) => Ok(output.clone()),
                    Err(e) => Err(anyhow::anyhow!("{}", e)),
                })
                .collect();
            Ok(Box::new(items.into_iter()))
        }
    }

    /// Yields "first", then blocks until the test lets it continue.
    struct Gated(Mutex<std::sync::mpsc::Receiver<()>>);

    impl InferenceEngine for Gated {
        fn name(&self) -> String {
            "gated".to_string()
        }

        fn infer_stream(&self, _request: InferenceRequest) -> anyhow::Result<EngineOutputs<'_>> {
            let gate = self.0.lock().unwrap();
            let mut step = 0;
            Ok(Box::new(std::iter::from_fn(move || {
                step += 1;
                match step {
                    1 => Some(Ok(EngineOutput::Text("first".to_string()))),
                    2 => {
                        gate.recv().ok()?;
                        Some(Ok(EngineOutput::Text("second".to_string())))
                    }
                    _ => None,
                }
            })))
        }
    }

    struct Panicking;

    impl InferenceEngine for Panicking {
        fn name(&self) -> String {
            "panicking".to_string()
        }

        fn infer_stream(&self, _request: InferenceRequest) -> anyhow::Result<EngineOutputs<'_>> {
            Ok(Box::new(std::iter::from_fn(|| -> Option<anyhow::Result<EngineOutput>> {
                panic!("engine blew up")
            })))
        }
    }

    /// Never finishes and never produces text; counts its live output iterators.
    struct Endless(Arc<AtomicUsize>);

    struct EndlessOutputs(Arc<AtomicUsize>);

    impl Iterator for EndlessOutputs {
        type Item = anyhow::Result<EngineOutput>;

        fn next(&mut self) -> Option<Self::Item> {
            std::thread::sleep(Duration::from_millis(5));
            Some(Ok(EngineOutput::Marker))
        }
    }

    impl Drop for EndlessOutputs {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl InferenceEngine for Endless {
        fn name(&self) -> String {
            "endless".to_string()
        }

        fn infer_stream(&self, _request: InferenceRequest) -> anyhow::Result<EngineOutputs<'_>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(EndlessOutputs(self.0.clone())))
        }
    }

    async fn collect(stream: InferenceStream) -> Vec<ChunkResult> {
        stream.collect::<Vec<_>>().await
    }

    #[tokio::test]
    async fn test_missing_engine_fails_fast() {
        let result = InferenceStream::start(None, request("hi"), 4);
        assert_eq!(result.unwrap_err(), SessionError::EngineUnavailable);
    }

    #[tokio::test]
    async fn test_text_in_order_markers_skipped_then_end() {
        let engine = Scripted(vec![
            Ok(EngineOutput::Text("Hel".into())),
            Ok(EngineOutput::Marker),
            Ok(EngineOutput::Text(String::new())),
            Ok(EngineOutput::Text("lo".into())),
        ]);
        let (stream, _pump) = InferenceStream::start(Some(Arc::new(engine)), request("hi"), 1).unwrap();
        assert_eq!(
            collect(stream).await,
            vec![
                Ok(InferenceChunk::TextDelta("Hel".into())),
                Ok(InferenceChunk::TextDelta("lo".into())),
                Ok(InferenceChunk::EndOfStream),
            ]
        );
    }

    #[tokio::test]
    async fn test_engine_error_terminates_stream() {
        let engine = Scripted(vec![
            Ok(EngineOutput::Text("partial".into())),
            Err(anyhow::anyhow!("device lost")),
            Ok(EngineOutput::Text("never".into())),
        ]);
        let (stream, _pump) = InferenceStream::start(Some(Arc::new(engine)), request("hi"), 4).unwrap();
        let items = collect(stream).await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], Ok(InferenceChunk::TextDelta("partial".into())));
        assert!(matches!(&items[1], Err(SessionError::Inference(msg)) if msg.contains("device lost")));
    }

    #[tokio::test]
    async fn test_chunks_arrive_before_generation_finishes() {
        let (gate_tx, gate_rx) = std::sync::mpsc::channel();
        let engine = Gated(Mutex::new(gate_rx));
        let (mut stream, _pump) = InferenceStream::start(Some(Arc::new(engine)), request("hi"), 4).unwrap();

        // The engine is still blocked on the gate when the first delta shows up.
        assert_eq!(stream.next().await, Some(Ok(InferenceChunk::TextDelta("first".into()))));
        gate_tx.send(()).unwrap();
        assert_eq!(stream.next().await, Some(Ok(InferenceChunk::TextDelta("second".into()))));
        assert_eq!(stream.next().await, Some(Ok(InferenceChunk::EndOfStream)));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_panicking_engine_surfaces_as_error() {
        let (stream, pump) = InferenceStream::start(Some(Arc::new(Panicking)), request("hi"), 4).unwrap();
        let items = collect(stream).await;
        assert_eq!(items.len(), 1);
        assert!(matches!(&items[0], Err(SessionError::Inference(_))));
        pump.stop().await;
    }

    #[tokio::test]
    async fn test_stop_cancels_engine_between_steps() {
        let live = Arc::new(AtomicUsize::new(0));
        let engine = Endless(live.clone());
        let (stream, pump) = InferenceStream::start(Some(Arc::new(engine)), request("hi"), 4).unwrap();

        while live.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        drop(stream);
        tokio::time::timeout(Duration::from_secs(5), pump.stop())
            .await
            .expect("pump did not stop");
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }
}
