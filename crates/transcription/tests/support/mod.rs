//! Scripted in-process engine for exercising the session machinery
//! without a native model.

#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::time::Duration;

use parking_lot::Mutex;

use murmur_transcription::TranscriptionConfig;
use murmur_transcription::engine::{EngineContext, EngineState, ModelLoader, SessionId};
use murmur_transcription::error::TranscriptionError;
use murmur_transcription::registry;

static TRACING: Once = Once::new();

/// Honors `RUST_LOG` when debugging a failing test.
pub fn init_tracing() {
    TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// One segment the stub engine will report, times in 10 ms ticks.
#[derive(Clone)]
pub struct ScriptedSegment {
    pub text: String,
    pub start: i64,
    pub end: i64,
    pub token_probabilities: Vec<f32>,
    pub speaker_turn: bool,
}

pub fn seg(text: &str, start: i64, end: i64) -> ScriptedSegment {
    ScriptedSegment {
        text: text.to_string(),
        start,
        end,
        token_probabilities: Vec::new(),
        speaker_turn: false,
    }
}

pub fn seg_with_probs(text: &str, start: i64, end: i64, probs: &[f32]) -> ScriptedSegment {
    ScriptedSegment {
        token_probabilities: probs.to_vec(),
        ..seg(text, start, end)
    }
}

#[derive(Default)]
pub struct Counters {
    pub states_created: AtomicUsize,
    pub states_freed: AtomicUsize,
    pub live_states: AtomicUsize,
    pub max_live_states: AtomicUsize,
    pub runs: AtomicUsize,
}

struct StubState {
    /// Number of scripted segments revealed to callbacks so far.
    visible: usize,
    script: Arc<Vec<ScriptedSegment>>,
    language: Option<String>,
    counters: Arc<Counters>,
}

impl Drop for StubState {
    fn drop(&mut self) {
        self.counters.states_freed.fetch_add(1, Ordering::SeqCst);
        self.counters.live_states.fetch_sub(1, Ordering::SeqCst);
    }
}

impl EngineState for StubState {
    fn segment_count(&self) -> usize {
        self.visible
    }
    fn segment_start(&self, index: usize) -> i64 {
        self.script[index].start
    }
    fn segment_end(&self, index: usize) -> i64 {
        self.script[index].end
    }
    fn segment_text(&self, index: usize) -> String {
        self.script[index].text.clone()
    }
    fn token_count(&self, index: usize) -> usize {
        self.script[index].token_probabilities.len()
    }
    fn token_probability(&self, index: usize, token: usize) -> f32 {
        self.script[index].token_probabilities[token]
    }
    fn speaker_turn(&self, index: usize) -> bool {
        self.script[index].speaker_turn
    }
    fn detected_language(&self) -> Option<String> {
        self.language.clone()
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

pub struct StubEngine {
    script: Arc<Vec<ScriptedSegment>>,
    language: Option<String>,
    pub counters: Arc<Counters>,
    /// Inference parks here before revealing segment `gate_after`, so a
    /// test controls when the blocking call proceeds.
    gate: Mutex<Option<Receiver<()>>>,
    gate_after: usize,
    fail_with: Option<String>,
    /// Language the most recent inference call was configured with.
    pub last_language: Mutex<Option<Option<String>>>,
}

impl StubEngine {
    pub fn new(script: Vec<ScriptedSegment>) -> Arc<Self> {
        init_tracing();
        Arc::new(Self {
            script: Arc::new(script),
            language: Some("en".to_string()),
            counters: Arc::new(Counters::default()),
            gate: Mutex::new(None),
            gate_after: usize::MAX,
            fail_with: None,
            last_language: Mutex::new(None),
        })
    }

    pub fn gated(script: Vec<ScriptedSegment>, gate_after: usize) -> (Arc<Self>, SyncSender<()>) {
        init_tracing();
        let (tx, rx) = sync_channel(8);
        let engine = Arc::new(Self {
            script: Arc::new(script),
            language: Some("en".to_string()),
            counters: Arc::new(Counters::default()),
            gate: Mutex::new(Some(rx)),
            gate_after,
            fail_with: None,
            last_language: Mutex::new(None),
        });
        (engine, tx)
    }

    pub fn failing(message: &str) -> Arc<Self> {
        init_tracing();
        Arc::new(Self {
            script: Arc::new(Vec::new()),
            language: None,
            counters: Arc::new(Counters::default()),
            gate: Mutex::new(None),
            gate_after: usize::MAX,
            fail_with: Some(message.to_string()),
            last_language: Mutex::new(None),
        })
    }

    fn wait_gate(&self) -> Result<(), TranscriptionError> {
        if let Some(gate) = self.gate.lock().as_ref() {
            gate.recv_timeout(Duration::from_secs(5))
                .map_err(|_| TranscriptionError::Inference("gate wait timed out".into()))?;
        }
        Ok(())
    }
}

impl EngineContext for StubEngine {
    fn create_state(&self) -> Result<Box<dyn EngineState>, TranscriptionError> {
        self.counters.states_created.fetch_add(1, Ordering::SeqCst);
        let live = self.counters.live_states.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_live_states.fetch_max(live, Ordering::SeqCst);
        Ok(Box::new(StubState {
            visible: 0,
            script: Arc::clone(&self.script),
            language: self.language.clone(),
            counters: Arc::clone(&self.counters),
        }))
    }

    fn run_inference(
        &self,
        state: &mut dyn EngineState,
        config: &TranscriptionConfig,
        _samples: &[f32],
        session: SessionId,
    ) -> Result<(), TranscriptionError> {
        self.counters.runs.fetch_add(1, Ordering::SeqCst);
        *self.last_language.lock() = Some(config.language.clone());

        if let Some(message) = &self.fail_with {
            return Err(TranscriptionError::Inference(message.clone()));
        }
        if !registry::on_encoder_begin(session) {
            return Ok(());
        }

        let stub = state
            .as_any_mut()
            .downcast_mut::<StubState>()
            .expect("state from another engine");
        let total = stub.script.len();
        for revealed in 1..=total {
            if revealed - 1 == self.gate_after {
                self.wait_gate()?;
            }
            stub.visible = revealed;
            registry::on_new_segment(session, stub);
            registry::on_progress(session, (revealed * 100 / total) as i32);
        }
        Ok(())
    }

    fn detect_language(
        &self,
        _state: &mut dyn EngineState,
        samples: &[f32],
        _config: &TranscriptionConfig,
        fast: bool,
    ) -> Result<Option<(String, f32)>, TranscriptionError> {
        if samples.is_empty() {
            return Ok(None);
        }
        let confidence = if fast { 0.5 } else { 0.9 };
        Ok(self.language.clone().map(|lang| (lang, confidence)))
    }
}

pub struct StubLoader {
    pub engine: Arc<StubEngine>,
}

impl ModelLoader for StubLoader {
    fn load(&self) -> Result<Arc<dyn EngineContext>, TranscriptionError> {
        Ok(Arc::clone(&self.engine) as Arc<dyn EngineContext>)
    }
}

pub struct FailingLoader;

impl ModelLoader for FailingLoader {
    fn load(&self) -> Result<Arc<dyn EngineContext>, TranscriptionError> {
        Err(TranscriptionError::ModelUnavailable(
            "ggml-missing.bin".into(),
        ))
    }
}

pub fn samples(count: usize) -> Vec<f32> {
    vec![0.0; count]
}

/// 16 kHz mono 16-bit WAV bytes for `process_wave` tests.
pub fn wav_bytes(pcm: &[i16]) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 16_000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for &sample in pcm {
            writer.write_sample(sample).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}
