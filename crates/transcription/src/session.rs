//! Bridges one blocking, callback-driven native inference call per
//! `process` invocation to an asynchronously pulled segment stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_stream::try_stream;
use futures::{Stream, StreamExt, pin_mut};
use murmur_audio::AsyncWaveReader;
use parking_lot::Mutex;
use tokio::io::AsyncRead;
use tokio::sync::{Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::Segment;
use crate::config::TranscriptionConfig;
use crate::engine::{EngineContext, ModelLoader, SessionId};
use crate::error::TranscriptionError;
use crate::registry::{self, ProgressHandler, SessionShared};

/// A transcription session owning one native context for its lifetime.
///
/// `process` calls on one session are fully serialized by a single-permit
/// semaphore: a second concurrent call waits for the first, it is never
/// rejected. Independent sessions, each with their own context, run in
/// parallel without restriction.
pub struct TranscriptionSession {
    id: SessionId,
    context: Arc<dyn EngineContext>,
    config: Mutex<TranscriptionConfig>,
    shared: Arc<SessionShared>,
    permits: Arc<Semaphore>,
    disposed: AtomicBool,
}

impl TranscriptionSession {
    /// Loads the native context through `loader` and registers the session
    /// for callback routing. Fails with `ModelUnavailable` when the loader
    /// cannot produce a context.
    pub fn new(
        loader: &dyn ModelLoader,
        config: TranscriptionConfig,
    ) -> Result<Self, TranscriptionError> {
        let context = loader.load()?;
        let (id, shared) = registry::register(config.compute_probabilities);
        info!(session = id, "transcription session created");
        Ok(Self {
            id,
            context,
            config: Mutex::new(config),
            shared,
            permits: Arc::new(Semaphore::new(1)),
            disposed: AtomicBool::new(false),
        })
    }

    /// Installs a handler for the engine's progress callback.
    pub fn set_progress_handler(&self, handler: ProgressHandler) {
        self.shared.set_progress(Some(handler));
    }

    pub fn clear_progress_handler(&self) {
        self.shared.set_progress(None);
    }

    /// Transcribes pre-decoded 16 kHz mono samples, yielding segments in
    /// engine discovery order as they become available.
    ///
    /// The native call runs on a dedicated blocking task; its per-call
    /// state is created there and freed when the call returns, on every
    /// path. Cancellation is cooperative: it is checked before each drain
    /// iteration here and inside every native callback, where the
    /// encoder-begin veto lets the engine abort early. Queued segments are
    /// abandoned once cancellation is observed.
    pub fn process(
        &self,
        samples: Vec<f32>,
        cancel: CancellationToken,
    ) -> impl Stream<Item = Result<Segment, TranscriptionError>> + '_ {
        try_stream! {
            if self.disposed.load(Ordering::Acquire) {
                Err(TranscriptionError::Disposed)?;
            }
            let permit = Arc::clone(&self.permits)
                .acquire_owned()
                .await
                .map_err(|_| TranscriptionError::Disposed)?;

            self.shared.begin_run(cancel.clone());
            debug!(session = self.id, samples = samples.len(), "inference started");

            let context = Arc::clone(&self.context);
            let config = self.config.lock().clone();
            let session = self.id;
            let mut task = tokio::task::spawn_blocking(move || {
                // The permit lives exactly as long as the native call, so
                // at most one state exists per context even when the
                // consumer abandons the stream early.
                let _permit = permit;
                let mut state = context.create_state()?;
                context.run_inference(state.as_mut(), &config, &samples, session)
            });

            let mut outcome = None;
            loop {
                if cancel.is_cancelled() {
                    self.shared.clear_queue();
                    Err(TranscriptionError::Cancelled)?;
                }

                if outcome.is_none() && self.shared.queue_is_empty() {
                    tokio::select! {
                        result = &mut task => outcome = Some(result),
                        _ = self.shared.wait_signal() => {}
                        _ = cancel.cancelled() => {}
                    }
                }

                while let Some(segment) = self.shared.pop_segment() {
                    if cancel.is_cancelled() {
                        self.shared.clear_queue();
                        Err(TranscriptionError::Cancelled)?;
                    }
                    yield segment;
                }

                if let Some(result) = outcome.take() {
                    result.map_err(|e| TranscriptionError::Task(e.to_string()))??;
                    while let Some(segment) = self.shared.pop_segment() {
                        yield segment;
                    }
                    debug!(session = self.id, "inference finished");
                    break;
                }
            }
        }
    }

    /// Decodes a WAV byte stream to a mono downmix, then transcribes it.
    pub fn process_wave<'a, R>(
        &'a self,
        reader: R,
        cancel: CancellationToken,
    ) -> impl Stream<Item = Result<Segment, TranscriptionError>> + 'a
    where
        R: AsyncRead + Unpin + 'a,
    {
        try_stream! {
            let samples = AsyncWaveReader::new(reader).average_samples().await?;
            let inner = self.process(samples, cancel);
            pin_mut!(inner);
            while let Some(item) = inner.next().await {
                yield item?;
            }
        }
    }

    /// Estimates the spoken language of a sample buffer without running a
    /// full decode. Serialized against `process` through the same permit,
    /// so a probe never races an in-flight call on the shared context.
    pub async fn detect_language(
        &self,
        samples: Vec<f32>,
        fast: bool,
    ) -> Result<Option<(String, f32)>, TranscriptionError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| TranscriptionError::Disposed)?;

        let context = Arc::clone(&self.context);
        let config = self.config.lock().clone();
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let mut state = context.create_state()?;
            context.detect_language(state.as_mut(), &samples, &config, fast)
        })
        .await
        .map_err(|e| TranscriptionError::Task(e.to_string()))?
    }

    /// Replaces the session language. Serialized through the same permit
    /// as `process`; the new value applies from the next call.
    pub async fn change_language(
        &self,
        language: Option<String>,
    ) -> Result<(), TranscriptionError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| TranscriptionError::Disposed)?;
        self.config.lock().language = language;
        Ok(())
    }

    /// Synchronous disposal. Fails with `DisposeInProgress` while a
    /// `process` call holds the session; already-disposed is a no-op.
    pub fn dispose(&self) -> Result<(), TranscriptionError> {
        match self.permits.try_acquire() {
            Ok(_permit) => {
                self.finish_dispose();
                Ok(())
            }
            Err(TryAcquireError::NoPermits) => Err(TranscriptionError::DisposeInProgress),
            Err(TryAcquireError::Closed) => Ok(()),
        }
    }

    /// Asynchronous disposal: waits for any in-flight call to finish, then
    /// releases the session. Idempotent.
    pub async fn dispose_async(&self) {
        if let Ok(_permit) = self.permits.acquire().await {
            self.finish_dispose();
        }
    }

    fn finish_dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        self.permits.close();
        registry::unregister(self.id);
        info!(session = self.id, "transcription session disposed");
    }
}

impl Drop for TranscriptionSession {
    fn drop(&mut self) {
        // Backstop for sessions dropped without an explicit dispose.
        registry::unregister(self.id);
    }
}
