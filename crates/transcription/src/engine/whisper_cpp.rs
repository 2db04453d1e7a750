//! whisper.cpp backend via `whisper-rs`, behind the `whisper-cpp` feature.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};
use whisper_rs::{FullParams, WhisperContext, WhisperContextParameters, WhisperState};

use crate::config::{SamplingStrategy, TranscriptionConfig};
use crate::engine::{EngineContext, EngineState, ModelLoader, SessionId};
use crate::error::TranscriptionError;
use crate::registry;

/// Probe window for fast language detection, 10 s at 16 kHz.
const FAST_PROBE_SAMPLES: usize = 160_000;

fn lang_str(lang_id: i32) -> Option<String> {
    whisper_rs::get_lang_str(lang_id).map(|s| s.to_string())
}

/// One inference call's native state. Dropping it frees the whisper.cpp
/// allocation.
pub struct NativeState {
    state: WhisperState,
}

impl EngineState for NativeState {
    fn segment_count(&self) -> usize {
        self.state.full_n_segments() as usize
    }

    fn segment_start(&self, index: usize) -> i64 {
        self.state
            .get_segment(index as i32)
            .map(|s| s.start_timestamp())
            .unwrap_or(0)
    }

    fn segment_end(&self, index: usize) -> i64 {
        self.state
            .get_segment(index as i32)
            .map(|s| s.end_timestamp())
            .unwrap_or(0)
    }

    fn segment_text(&self, index: usize) -> String {
        self.state
            .get_segment(index as i32)
            .and_then(|s| s.to_str().ok().map(|t| t.to_string()))
            .unwrap_or_default()
    }

    fn token_count(&self, index: usize) -> usize {
        self.state
            .get_segment(index as i32)
            .map(|s| s.n_tokens() as usize)
            .unwrap_or(0)
    }

    fn token_probability(&self, index: usize, token: usize) -> f32 {
        self.state
            .get_segment(index as i32)
            .and_then(|s| s.get_token(token as i32))
            .map(|t| t.token_probability())
            .unwrap_or(0.0)
    }

    fn speaker_turn(&self, index: usize) -> bool {
        self.state
            .get_segment(index as i32)
            .map(|s| s.speaker_turn_next())
            .unwrap_or(false)
    }

    fn detected_language(&self) -> Option<String> {
        lang_str(self.state.full_lang_id_from_state())
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// A loaded whisper.cpp model. One per session; calls on it are already
/// serialized by the session's permit.
pub struct WhisperCppEngine {
    ctx: WhisperContext,
}

impl EngineContext for WhisperCppEngine {
    fn create_state(&self) -> Result<Box<dyn EngineState>, TranscriptionError> {
        let state = self
            .ctx
            .create_state()
            .map_err(|e| TranscriptionError::Inference(format!("state allocation failed: {e}")))?;
        Ok(Box::new(NativeState { state }))
    }

    fn run_inference(
        &self,
        state: &mut dyn EngineState,
        config: &TranscriptionConfig,
        samples: &[f32],
        session: SessionId,
    ) -> Result<(), TranscriptionError> {
        let native = downcast(state)?;

        let mut params = build_params(config);
        // whisper.cpp polls the abort callback between decoder passes;
        // returning true stops the run, which is how a vetoed
        // encoder-begin lands on this backend.
        params.set_abort_callback_safe(move || !registry::on_encoder_begin(session));
        params.set_progress_callback_safe(move |progress: i32| {
            registry::on_progress(session, progress);
        });

        native
            .state
            .full(params, samples)
            .map_err(|e| TranscriptionError::Inference(e.to_string()))?;

        debug!(session, segments = native.segment_count(), "whisper full pass done");

        // The safe bindings expose segment data only through the state, so
        // segments are relayed once the blocking call returns rather than
        // from inside the new-segment callback.
        registry::on_new_segment(session, native);
        Ok(())
    }

    fn detect_language(
        &self,
        state: &mut dyn EngineState,
        samples: &[f32],
        config: &TranscriptionConfig,
        fast: bool,
    ) -> Result<Option<(String, f32)>, TranscriptionError> {
        let native = downcast(state)?;

        let window = if fast {
            &samples[..samples.len().min(FAST_PROBE_SAMPLES)]
        } else {
            samples
        };

        let mut params = FullParams::new(whisper_rs::SamplingStrategy::Greedy { best_of: 1 });
        params.set_detect_language(true);
        params.set_single_segment(true);
        params.set_no_context(true);
        params.set_translate(false);
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);
        if let Some(threads) = config.threads {
            params.set_n_threads(threads);
        }

        native
            .state
            .full(params, window)
            .map_err(|e| TranscriptionError::Inference(e.to_string()))?;

        // The bindings report the winning language id without its
        // probability, so a definite answer carries full confidence.
        Ok(lang_str(native.state.full_lang_id_from_state()).map(|lang| (lang, 1.0)))
    }
}

fn downcast(state: &mut dyn EngineState) -> Result<&mut NativeState, TranscriptionError> {
    state
        .as_any_mut()
        .downcast_mut::<NativeState>()
        .ok_or_else(|| {
            TranscriptionError::Inference("state was created by a different backend".into())
        })
}

fn build_params(config: &TranscriptionConfig) -> FullParams<'_, '_> {
    let strategy = match config.sampling_strategy {
        SamplingStrategy::Greedy { best_of } => whisper_rs::SamplingStrategy::Greedy {
            best_of: best_of.unwrap_or(5),
        },
        SamplingStrategy::BeamSearch { beam_size, patience } => {
            whisper_rs::SamplingStrategy::BeamSearch {
                beam_size: beam_size.unwrap_or(5),
                patience: patience.unwrap_or(-1.0),
            }
        }
    };
    let mut params = FullParams::new(strategy);

    params.set_print_special(false);
    params.set_print_progress(false);
    params.set_print_realtime(false);
    params.set_print_timestamps(false);

    if let Some(threads) = config.threads {
        params.set_n_threads(threads);
    }
    if let Some(n) = config.max_last_text_tokens {
        params.set_n_max_text_ctx(n);
    }
    if let Some(n) = config.audio_context_size {
        params.set_audio_ctx(n);
    }
    if let Some(ms) = config.offset_ms {
        params.set_offset_ms(ms);
    }
    if let Some(ms) = config.duration_ms {
        params.set_duration_ms(ms);
    }
    if let Some(v) = config.translate {
        params.set_translate(v);
    }
    if let Some(v) = config.no_context {
        params.set_no_context(v);
    }
    if let Some(v) = config.single_segment {
        params.set_single_segment(v);
    }
    if let Some(v) = config.suppress_blank {
        params.set_suppress_blank(v);
    }
    if let Some(n) = config.max_segment_length {
        params.set_max_len(n);
    }
    if let Some(v) = config.split_on_word {
        params.set_split_on_word(v);
    }
    if let Some(n) = config.max_tokens_per_segment {
        params.set_max_tokens(n);
    }
    if let Some(v) = config.token_timestamps {
        params.set_token_timestamps(v);
    }
    if let Some(t) = config.token_timestamps_threshold {
        params.set_thold_pt(t);
    }
    if let Some(t) = config.token_timestamps_sum_threshold {
        params.set_thold_ptsum(t);
    }
    if let Some(t) = config.temperature {
        params.set_temperature(t);
    }
    if let Some(t) = config.temperature_inc {
        params.set_temperature_inc(t);
    }
    if let Some(t) = config.max_initial_ts {
        params.set_max_initial_ts(t);
    }
    if let Some(t) = config.length_penalty {
        params.set_length_penalty(t);
    }
    if let Some(t) = config.entropy_threshold {
        params.set_entropy_thold(t);
    }
    if let Some(t) = config.log_prob_threshold {
        params.set_logprob_thold(t);
    }
    if let Some(t) = config.no_speech_threshold {
        params.set_no_speech_thold(t);
    }
    params.set_tdrz_enable(config.diarize);

    match &config.language {
        Some(lang) => params.set_language(Some(lang)),
        None => params.set_detect_language(true),
    }
    if let Some(prompt) = &config.initial_prompt {
        params.set_initial_prompt(prompt);
    }

    params
}

/// Loads a GGML model file from disk, e.g. `ggml-base.en.bin`.
pub struct FileModelLoader {
    path: PathBuf,
}

impl FileModelLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ModelLoader for FileModelLoader {
    fn load(&self) -> Result<Arc<dyn EngineContext>, TranscriptionError> {
        let path = self.path.to_str().ok_or_else(|| {
            TranscriptionError::ModelUnavailable(format!(
                "model path is not valid UTF-8: {}",
                self.path.display()
            ))
        })?;
        info!(model = %self.path.display(), "loading whisper model");
        let ctx = WhisperContext::new_with_params(path, WhisperContextParameters::default())
            .map_err(|e| {
                TranscriptionError::ModelUnavailable(format!("{}: {e}", self.path.display()))
            })?;
        info!(model = %self.path.display(), "whisper model loaded");
        Ok(Arc::new(WhisperCppEngine { ctx }))
    }
}

/// Loads a GGML model already resident in memory.
pub struct BufferModelLoader {
    data: Vec<u8>,
}

impl BufferModelLoader {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl ModelLoader for BufferModelLoader {
    fn load(&self) -> Result<Arc<dyn EngineContext>, TranscriptionError> {
        info!(bytes = self.data.len(), "loading whisper model from buffer");
        let ctx =
            WhisperContext::new_from_buffer_with_params(&self.data, WhisperContextParameters::default())
                .map_err(|e| TranscriptionError::ModelUnavailable(e.to_string()))?;
        Ok(Arc::new(WhisperCppEngine { ctx }))
    }
}
