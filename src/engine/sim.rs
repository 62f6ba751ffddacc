//! Simulated engines
//!
//! Stand-ins for real speech, language and display engines: scripted
//! transcripts, a token-streaming generator with canned replies, a
//! synthesizer that "speaks" for a time proportional to the text length and
//! a synthetic waveform visualizer. The demo binary runs on them and the
//! tests use them to observe call ordering through a shared [`CallLog`].

use crate::engine::{
    GenerationEngine, SentenceSink, SynthesisEngine, TranscriptionEngine, Visualizer,
    FREQUENCY_BINS,
};
use crate::llm::{
    clean_response, format_chat_prompt, GenerationParams, SentenceSplitter, DEFAULT_SYSTEM_PROMPT,
    END_OF_TURN,
};
use crate::speech::{select_voice, Utterance, UtteranceError, UtteranceQueue, Voice};
use crate::utils::Signal;
use crate::{Result, VoiceError};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Number of progress steps reported while a simulated model loads
const LOAD_STEPS: u64 = 4;

/// Interval between synthetic visualizer frames
const FRAME_INTERVAL: Duration = Duration::from_millis(16);

/// A call observed on a simulated engine
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineCall {
    CaptureStarted,
    CaptureStopped,
    TranscriptCleared,
    GenerationStarted(String),
    SentenceEmitted(String),
    GenerationFinished,
    SentenceQueued(String),
    UtteranceStarted(String),
    UtteranceFinished(String),
    QueueWaitStarted,
    QueueDrained,
    SynthesisStopped,
    Spoke(String),
    VisualizerStarted,
    VisualizerStopped,
    SimulationStarted,
    SimulationStopped,
}

/// Timestamped record of engine calls, shared by all simulated engines
#[derive(Clone, Debug, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<(Instant, EngineCall)>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, call: EngineCall) {
        self.entries.lock().push((Instant::now(), call));
    }

    /// All calls in the order they happened
    pub fn calls(&self) -> Vec<EngineCall> {
        self.entries.lock().iter().map(|(_, c)| c.clone()).collect()
    }

    /// Index of the first call matching `pred`
    pub fn position(&self, pred: impl Fn(&EngineCall) -> bool) -> Option<usize> {
        self.entries.lock().iter().position(|(_, c)| pred(c))
    }

    /// Index of the last call matching `pred`
    pub fn last_position(&self, pred: impl Fn(&EngineCall) -> bool) -> Option<usize> {
        self.entries.lock().iter().rposition(|(_, c)| pred(c))
    }

    /// Timestamp of the last call matching `pred`
    pub fn last_time(&self, pred: impl Fn(&EngineCall) -> bool) -> Option<Instant> {
        self.entries
            .lock()
            .iter()
            .rev()
            .find(|(_, c)| pred(c))
            .map(|(t, _)| *t)
    }

    pub fn count(&self, pred: impl Fn(&EngineCall) -> bool) -> usize {
        self.entries.lock().iter().filter(|(_, c)| pred(c)).count()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Settings for [`ScriptedTranscriber`]
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct TranscriberSettings {
    /// Simulated model load time in milliseconds
    pub load_ms: u64,

    /// Fail the model load with this message
    pub load_error: Option<String>,

    /// Deny microphone access
    pub deny_permission: bool,

    /// Microphone start-up latency in milliseconds
    pub start_ms: u64,
}

/// Transcriber whose "recognized speech" is whatever the host feeds it
pub struct ScriptedTranscriber {
    settings: TranscriberSettings,
    transcript: Signal<String>,
    capturing: Mutex<bool>,
    log: CallLog,
}

impl ScriptedTranscriber {
    pub fn new(settings: TranscriberSettings, log: CallLog) -> Self {
        Self {
            settings,
            transcript: Signal::new(String::new()),
            capturing: Mutex::new(false),
            log,
        }
    }

    /// Simulate the user finishing an utterance
    ///
    /// Dropped unless capture is running, just as a stopped microphone hears
    /// nothing. Returns whether the utterance was recognized.
    pub fn hear(&self, text: &str) -> bool {
        let text = text.trim();
        if text.is_empty() || !*self.capturing.lock() {
            return false;
        }
        self.transcript.set(text.to_string());
        true
    }

    pub fn is_capturing(&self) -> bool {
        *self.capturing.lock()
    }
}

#[async_trait]
impl TranscriptionEngine for ScriptedTranscriber {
    async fn request_permission(&self) -> Result<()> {
        if self.settings.deny_permission {
            return Err(VoiceError::PermissionDenied(
                "Microphone access denied. Please allow microphone permission and reload the page."
                    .to_string(),
            ));
        }
        Ok(())
    }

    async fn load(&self, progress: &Signal<u8>) -> Result<()> {
        simulate_load(self.settings.load_ms, progress).await;
        match &self.settings.load_error {
            Some(msg) => Err(VoiceError::ModelLoad(msg.clone())),
            None => Ok(()),
        }
    }

    async fn start(&self) -> Result<()> {
        self.request_permission().await?;
        if self.settings.start_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.settings.start_ms)).await;
        }
        *self.capturing.lock() = true;
        self.log.record(EngineCall::CaptureStarted);
        Ok(())
    }

    fn stop(&self) {
        if std::mem::take(&mut *self.capturing.lock()) {
            self.log.record(EngineCall::CaptureStopped);
        }
    }

    fn clear(&self) {
        self.transcript.set(String::new());
        self.log.record(EngineCall::TranscriptCleared);
    }

    fn transcript(&self) -> &Signal<String> {
        &self.transcript
    }
}

/// Settings for [`ScriptedGenerator`]
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct GeneratorSettings {
    /// Simulated model load time in milliseconds
    pub load_ms: u64,

    /// Fail the model load with this message
    pub load_error: Option<String>,

    /// Delay between streamed tokens in milliseconds
    pub token_ms: u64,

    /// Canned replies, used in order before falling back to an echo
    pub replies: Vec<String>,

    /// Fail every generation with this message
    pub generation_error: Option<String>,

    /// Instruction placed ahead of each user message
    pub system_prompt: String,

    /// Sampling parameters; only `n_predict` affects the simulation
    pub params: GenerationParams,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            load_ms: 0,
            load_error: None,
            token_ms: 30,
            replies: Vec::new(),
            generation_error: None,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            params: GenerationParams::default(),
        }
    }
}

/// Generator that streams canned replies word by word
pub struct ScriptedGenerator {
    settings: GeneratorSettings,
    replies: Mutex<VecDeque<String>>,
    log: CallLog,
}

impl ScriptedGenerator {
    pub fn new(settings: GeneratorSettings, log: CallLog) -> Self {
        let replies = settings.replies.iter().cloned().collect();
        Self {
            settings,
            replies: Mutex::new(replies),
            log,
        }
    }

    /// Add a reply to the end of the script
    pub fn push_reply(&self, reply: impl Into<String>) {
        self.replies.lock().push_back(reply.into());
    }

    fn next_reply(&self, message: &str) -> String {
        self.replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| format!("You said: {}", message))
    }
}

/// Split text into word tokens that keep their trailing whitespace
fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        if !c.is_whitespace() && current.ends_with(char::is_whitespace) {
            tokens.push(std::mem::take(&mut current));
        }
        current.push(c);
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

#[async_trait]
impl GenerationEngine for ScriptedGenerator {
    async fn load(&self, progress: &Signal<u8>) -> Result<()> {
        simulate_load(self.settings.load_ms, progress).await;
        match &self.settings.load_error {
            Some(msg) => Err(VoiceError::ModelLoad(msg.clone())),
            None => Ok(()),
        }
    }

    async fn generate_streaming(
        &self,
        prompt: &str,
        on_sentence: SentenceSink<'_>,
    ) -> Result<String> {
        self.log.record(EngineCall::GenerationStarted(prompt.to_string()));
        let formatted = format_chat_prompt(&self.settings.system_prompt, prompt);
        debug!(
            "Formatted prompt: {} chars, params {:?}",
            formatted.len(),
            self.settings.params
        );

        if let Some(msg) = &self.settings.generation_error {
            tokio::time::sleep(Duration::from_millis(self.settings.token_ms)).await;
            self.log.record(EngineCall::GenerationFinished);
            return Err(VoiceError::Generation(msg.clone()));
        }

        // The model keeps going past its end-of-turn marker; cleaning hides that
        let raw_reply = format!("{}{}\n", self.next_reply(prompt), END_OF_TURN);
        let mut splitter = SentenceSplitter::new();
        let mut generated = String::new();

        let budget = self.settings.params.n_predict as usize;
        for token in tokenize(&raw_reply).into_iter().take(budget) {
            tokio::time::sleep(Duration::from_millis(self.settings.token_ms)).await;
            generated.push_str(&token);
            for segment in splitter.push_cumulative(&clean_response(&generated)) {
                self.log.record(EngineCall::SentenceEmitted(segment.text.clone()));
                on_sentence(segment.text);
            }
        }

        let reply = clean_response(&generated);
        splitter.push_cumulative(&reply);
        if let Some(segment) = splitter.finish() {
            self.log.record(EngineCall::SentenceEmitted(segment.text.clone()));
            on_sentence(segment.text);
        }

        debug!(
            "Generated {} chars in {} sentences",
            reply.len(),
            splitter.emitted()
        );
        self.log.record(EngineCall::GenerationFinished);
        Ok(reply)
    }
}

/// Settings for [`TimedSynthesizer`]
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SynthesizerSettings {
    /// Whether the host has speech output at all
    pub supported: bool,

    /// Speaking time per character at rate 1.0, in milliseconds
    pub ms_per_char: u64,

    /// Shortest utterance, in milliseconds
    pub min_utterance_ms: u64,

    /// Rate for streamed sentences
    pub queued_rate: f32,

    /// Rate for immediate utterances such as the greeting
    pub immediate_rate: f32,

    /// Voices the host offers
    pub voices: Vec<Voice>,

    /// Voice to use while it is offered
    pub preferred_voice: Option<String>,

    /// Utterances containing this text fail with a host error
    pub fail_containing: Option<String>,

    /// The host refuses audio playback
    pub playback_blocked: bool,
}

impl Default for SynthesizerSettings {
    fn default() -> Self {
        Self {
            supported: true,
            ms_per_char: 60,
            min_utterance_ms: 200,
            queued_rate: 1.15,
            immediate_rate: 1.1,
            voices: vec![
                Voice::new("Google US English", "en-US"),
                Voice::new("Daniel", "en-GB"),
            ],
            preferred_voice: None,
            fail_containing: None,
            playback_blocked: false,
        }
    }
}

impl SynthesizerSettings {
    fn duration_for(&self, utterance: &Utterance) -> Duration {
        let chars = utterance.text.chars().count() as f64;
        let rate = if utterance.rate > 0.0 { utterance.rate as f64 } else { 1.0 };
        let ms = (chars * self.ms_per_char as f64 / rate).round() as u64;
        Duration::from_millis(ms.max(self.min_utterance_ms))
    }

    fn outcome_for(&self, utterance: &Utterance) -> std::result::Result<(), UtteranceError> {
        if self.playback_blocked {
            return Err(UtteranceError::NotAllowed);
        }
        match &self.fail_containing {
            Some(needle) if utterance.text.contains(needle.as_str()) => {
                Err(UtteranceError::Other("synthesis-failed".to_string()))
            }
            _ => Ok(()),
        }
    }
}

struct PlayRequest {
    utterance: Utterance,
    done: Option<oneshot::Sender<std::result::Result<(), UtteranceError>>>,
}

/// Synthesizer that plays utterances by waiting out their duration
pub struct TimedSynthesizer {
    settings: SynthesizerSettings,
    queue: UtteranceQueue,
    play_tx: mpsc::UnboundedSender<PlayRequest>,
    cancel: Arc<Notify>,
    log: CallLog,
}

impl TimedSynthesizer {
    /// Create the synthesizer and spawn its playback worker
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(settings: SynthesizerSettings, log: CallLog) -> Arc<Self> {
        let queue = UtteranceQueue::new();
        let cancel = Arc::new(Notify::new());
        let (play_tx, play_rx) = mpsc::unbounded_channel();

        tokio::spawn(playback_worker(
            settings.clone(),
            queue.clone(),
            Arc::clone(&cancel),
            play_rx,
            log.clone(),
        ));

        Arc::new(Self {
            settings,
            queue,
            play_tx,
            cancel,
            log,
        })
    }

    /// Number of utterances queued or playing
    pub fn pending(&self) -> usize {
        self.queue.pending()
    }
}

async fn playback_worker(
    settings: SynthesizerSettings,
    queue: UtteranceQueue,
    cancel: Arc<Notify>,
    mut play_rx: mpsc::UnboundedReceiver<PlayRequest>,
    log: CallLog,
) {
    while let Some(request) = play_rx.recv().await {
        let PlayRequest { utterance, done } = request;

        let outcome = if !queue.is_current(&utterance) {
            Err(UtteranceError::Canceled)
        } else {
            let voice = select_voice(&settings.voices, settings.preferred_voice.as_deref());
            debug!(
                "Speaking #{} with {:?}: {}",
                utterance.seq,
                voice.map(|v| v.name.as_str()),
                utterance.text
            );
            queue.started(&utterance);
            log.record(EngineCall::UtteranceStarted(utterance.text.clone()));

            let cancelled = cancel.notified();
            tokio::select! {
                _ = tokio::time::sleep(settings.duration_for(&utterance)) => {
                    if queue.is_current(&utterance) {
                        settings.outcome_for(&utterance)
                    } else {
                        Err(UtteranceError::Canceled)
                    }
                }
                _ = cancelled => Err(UtteranceError::Canceled),
            }
        };

        match &outcome {
            Ok(()) => {
                log.record(EngineCall::UtteranceFinished(utterance.text.clone()));
                queue.finished(&utterance);
            }
            Err(reason) => queue.failed(&utterance, reason),
        }

        if let Some(done) = done {
            let _ = done.send(outcome);
        }
    }
    debug!("Playback worker stopped");
}

#[async_trait]
impl SynthesisEngine for TimedSynthesizer {
    fn is_supported(&self) -> bool {
        self.settings.supported
    }

    fn queue_sentence(&self, text: &str) {
        if !self.settings.supported {
            return;
        }
        let Some(utterance) = self.queue.enqueue(text, self.settings.queued_rate) else {
            return;
        };
        self.log.record(EngineCall::SentenceQueued(utterance.text.clone()));
        if self.play_tx.send(PlayRequest { utterance, done: None }).is_err() {
            warn!("Playback worker is gone; dropping sentence");
            self.queue.stop();
        }
    }

    async fn wait_for_queue(&self) {
        self.log.record(EngineCall::QueueWaitStarted);
        self.queue.wait_for_drain().await;
        self.log.record(EngineCall::QueueDrained);
    }

    async fn speak(&self, text: &str) -> Result<()> {
        if !self.settings.supported {
            return Err(VoiceError::UnsupportedEnvironment(
                "Speech synthesis not supported".to_string(),
            ));
        }

        self.cancel.notify_waiters();
        let utterance = self.queue.replace_with(text, self.settings.immediate_rate);
        self.log.record(EngineCall::Spoke(utterance.text.clone()));

        let (done_tx, done_rx) = oneshot::channel();
        self.play_tx
            .send(PlayRequest {
                utterance,
                done: Some(done_tx),
            })
            .map_err(|e| VoiceError::Channel(format!("Failed to submit utterance: {}", e)))?;

        match done_rx.await {
            Ok(Ok(())) => Ok(()),
            // Permission problems are reported on the error signal only
            Ok(Err(UtteranceError::NotAllowed)) => Ok(()),
            Ok(Err(UtteranceError::Canceled | UtteranceError::Interrupted)) => Ok(()),
            Ok(Err(UtteranceError::Other(code))) => Err(VoiceError::Synthesis(code)),
            Err(_) => Err(VoiceError::Channel("Playback worker dropped utterance".to_string())),
        }
    }

    fn stop(&self) {
        self.queue.stop();
        self.cancel.notify_waiters();
        self.log.record(EngineCall::SynthesisStopped);
    }

    fn speaking(&self) -> &Signal<bool> {
        self.queue.speaking()
    }

    fn error(&self) -> &Signal<Option<String>> {
        self.queue.error()
    }
}

/// Settings for [`SyntheticVisualizer`]
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct VisualizerSettings {
    /// Whether microphone analysis can start
    pub microphone_available: bool,
}

impl Default for VisualizerSettings {
    fn default() -> Self {
        Self {
            microphone_available: true,
        }
    }
}

/// Visualizer that animates a synthetic waveform while speech plays
pub struct SyntheticVisualizer {
    settings: VisualizerSettings,
    active: Signal<bool>,
    frequency: Signal<Vec<u8>>,
    animation: Mutex<Option<JoinHandle<()>>>,
    log: CallLog,
}

impl SyntheticVisualizer {
    pub fn new(settings: VisualizerSettings, log: CallLog) -> Self {
        Self {
            settings,
            active: Signal::new(false),
            frequency: Signal::new(vec![0; FREQUENCY_BINS]),
            animation: Mutex::new(None),
            log,
        }
    }

    /// True while microphone analysis runs
    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    pub fn is_simulating(&self) -> bool {
        self.animation.lock().is_some()
    }

    fn cancel_animation(&self) -> bool {
        match self.animation.lock().take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

/// One frame of a smooth wave with some noise on top
pub fn synthetic_frame(elapsed: Duration) -> Vec<u8> {
    let t = elapsed.as_millis() as f64;
    let mut rng = rand::thread_rng();
    (0..FREQUENCY_BINS)
        .map(|i| {
            let base = (t / 100.0 + i as f64 * 0.3).sin() * 50.0 + 80.0;
            let noise: f64 = rng.gen_range(0.0..40.0);
            (base + noise).clamp(0.0, 255.0) as u8
        })
        .collect()
}

#[async_trait]
impl Visualizer for SyntheticVisualizer {
    async fn start(&self) {
        if self.active.get() {
            return;
        }
        if !self.settings.microphone_available {
            // Non-essential; stay dark
            debug!("Visualizer unavailable, skipping");
            return;
        }
        self.active.set(true);
        self.log.record(EngineCall::VisualizerStarted);
    }

    fn stop(&self) {
        self.cancel_animation();
        self.active.set_if_changed(false);
        self.frequency.set(vec![0; FREQUENCY_BINS]);
        self.log.record(EngineCall::VisualizerStopped);
    }

    fn simulate_speaking(&self) {
        self.cancel_animation();
        let frequency = self.frequency.clone();
        let started = Instant::now();
        let handle = tokio::spawn(async move {
            loop {
                frequency.set(synthetic_frame(started.elapsed()));
                tokio::time::sleep(FRAME_INTERVAL).await;
            }
        });
        *self.animation.lock() = Some(handle);
        self.log.record(EngineCall::SimulationStarted);
    }

    fn stop_simulation(&self) {
        self.cancel_animation();
        self.frequency.set(vec![0; FREQUENCY_BINS]);
        self.log.record(EngineCall::SimulationStopped);
    }

    fn frequency_data(&self) -> &Signal<Vec<u8>> {
        &self.frequency
    }
}

impl Drop for SyntheticVisualizer {
    fn drop(&mut self) {
        self.cancel_animation();
    }
}

async fn simulate_load(load_ms: u64, progress: &Signal<u8>) {
    progress.set(0);
    let step = Duration::from_millis(load_ms / LOAD_STEPS);
    for i in 1..=LOAD_STEPS {
        tokio::time::sleep(step).await;
        progress.set((i * 100 / LOAD_STEPS) as u8);
    }
}

/// Settings for a full set of simulated engines
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct SimSettings {
    pub transcription: TranscriberSettings,
    pub generation: GeneratorSettings,
    pub synthesis: SynthesizerSettings,
    pub visualizer: VisualizerSettings,
}

/// One of each simulated engine, sharing a call log
pub struct SimEngines {
    pub transcriber: Arc<ScriptedTranscriber>,
    pub generator: Arc<ScriptedGenerator>,
    pub synthesizer: Arc<TimedSynthesizer>,
    pub visualizer: Arc<SyntheticVisualizer>,
    pub log: CallLog,
}

impl SimEngines {
    /// Build all four engines; must be called from within a tokio runtime
    pub fn new(settings: SimSettings) -> Self {
        let log = CallLog::new();
        info!("Creating simulated engines");
        Self {
            transcriber: Arc::new(ScriptedTranscriber::new(settings.transcription, log.clone())),
            generator: Arc::new(ScriptedGenerator::new(settings.generation, log.clone())),
            synthesizer: TimedSynthesizer::spawn(settings.synthesis, log.clone()),
            visualizer: Arc::new(SyntheticVisualizer::new(settings.visualizer, log.clone())),
            log,
        }
    }
}
