//! Turn-taking orchestrator
//!
//! Sequences the engines into one conversational loop: listen, stop
//! listening, generate a reply while speaking it sentence by sentence, wait
//! for the speech to drain, then listen again.
//!
//! The microphone is never open while the assistant speaks. Capture stops
//! before generation starts and resumes only after the synthesis queue has
//! drained, and only if the conversation is still switched on.

use super::config::{ConversationConfig, GreetingPolicy};
use super::events::ConversationEvent;
use super::state::{ConversationState, StateInputs};
use crate::engine::sim::SimEngines;
use crate::engine::{
    Engine, GenerationEngine, SentenceSink, SynthesisEngine, TranscriptionEngine, Visualizer,
};
use crate::utils::{shared_stats, FlagGuard, SharedStats, Signal, Stopwatch};
use crate::{Result, VoiceError};
use futures::future::select_all;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Load status of one model
#[derive(Clone, Debug, Default)]
pub struct ModelStatus {
    pub loading: Signal<bool>,
    pub loaded: Signal<bool>,
    /// Percent, 0 to 100
    pub progress: Signal<u8>,
    pub error: Signal<Option<String>>,
}

/// Session flags owned by the orchestrator
///
/// Synthesis publishes its own speaking and error signals; everything else
/// the derived state depends on lives here.
#[derive(Clone, Debug, Default)]
pub struct ConversationSignals {
    pub transcription: ModelStatus,
    pub generation: ModelStatus,
    pub listening: Signal<bool>,
    pub generating: Signal<bool>,
    /// Last complete reply
    pub response: Signal<String>,
    pub processing: Signal<bool>,
    pub active: Signal<bool>,
}

/// Why a transcript did not start a turn
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    EmptyTranscript,
    ModelsNotLoaded,
    Generating,
    Speaking,
    Inactive,
    TurnInFlight,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            SkipReason::EmptyTranscript => "empty transcript",
            SkipReason::ModelsNotLoaded => "models not loaded",
            SkipReason::Generating => "still generating",
            SkipReason::Speaking => "still speaking",
            SkipReason::Inactive => "conversation inactive",
            SkipReason::TurnInFlight => "turn in flight",
        };
        f.write_str(reason)
    }
}

/// Result of offering a transcript to the orchestrator
#[derive(Clone, Debug, PartialEq)]
pub enum TurnOutcome {
    /// A guard failed; nothing happened
    Skipped(SkipReason),

    /// A turn ran to completion
    Completed {
        turn_id: Uuid,
        /// `None` when generation failed
        response: Option<String>,
        resumed_capture: bool,
    },
}

impl TurnOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, TurnOutcome::Completed { .. })
    }
}

struct Inner {
    config: ConversationConfig,
    transcriber: Arc<dyn TranscriptionEngine>,
    generator: Arc<dyn GenerationEngine>,
    synthesizer: Arc<dyn SynthesisEngine>,
    visualizer: Arc<dyn Visualizer>,
    signals: ConversationSignals,
    state: Signal<ConversationState>,
    events: broadcast::Sender<ConversationEvent>,
    stats: SharedStats,
    /// Cancelled on deactivation and replaced with a fresh token
    turn_cancel: Mutex<CancellationToken>,
    greeted: AtomicBool,
    listening_since: Mutex<Option<Instant>>,
    last_error: Mutex<Option<(Engine, String)>>,
    watchers: Mutex<Vec<JoinHandle<()>>>,
}

/// Coordinates transcription, generation, synthesis and visualization
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct ConversationOrchestrator {
    inner: Arc<Inner>,
}

impl ConversationOrchestrator {
    pub fn builder(
        transcriber: Arc<dyn TranscriptionEngine>,
        generator: Arc<dyn GenerationEngine>,
        synthesizer: Arc<dyn SynthesisEngine>,
        visualizer: Arc<dyn Visualizer>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder::new(transcriber, generator, synthesizer, visualizer)
    }

    pub fn config(&self) -> &ConversationConfig {
        &self.inner.config
    }

    pub fn signals(&self) -> &ConversationSignals {
        &self.inner.signals
    }

    pub fn stats(&self) -> SharedStats {
        Arc::clone(&self.inner.stats)
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.inner.events.subscribe()
    }

    /// Derived state as last published by the state watcher
    pub fn state(&self) -> &Signal<ConversationState> {
        &self.inner.state
    }

    pub fn watch_state(&self) -> watch::Receiver<ConversationState> {
        self.inner.state.subscribe()
    }

    /// Snapshot of the flags the state derives from
    pub fn state_inputs(&self) -> StateInputs {
        let signals = &self.inner.signals;
        StateInputs {
            model_loading: signals.transcription.loading.get() || signals.generation.loading.get(),
            speaking: self.inner.synthesizer.speaking().get(),
            generating: signals.generating.get(),
            processing: signals.processing.get(),
            listening: signals.listening.get(),
            conversation_active: signals.active.get(),
        }
    }

    /// Derive the state from the current flags
    pub fn current_state(&self) -> ConversationState {
        self.state_inputs().derive()
    }

    pub fn is_active(&self) -> bool {
        self.inner.signals.active.get()
    }

    pub fn is_processing(&self) -> bool {
        self.inner.signals.processing.get()
    }

    /// Both models loaded
    pub fn is_model_loaded(&self) -> bool {
        self.inner.signals.transcription.loaded.get() && self.inner.signals.generation.loaded.get()
    }

    pub fn is_model_loading(&self) -> bool {
        self.state_inputs().model_loading
    }

    /// Latest error reported for `engine`
    pub fn error(&self, engine: Engine) -> Option<String> {
        match engine {
            Engine::Transcription => self.inner.signals.transcription.error.get(),
            Engine::Generation => self.inner.signals.generation.error.get(),
            Engine::Synthesis => self.inner.synthesizer.error().get(),
        }
    }

    /// Most recent error from any engine
    pub fn last_error(&self) -> Option<(Engine, String)> {
        self.inner.last_error.lock().clone()
    }

    pub fn frequency_data(&self) -> Vec<u8> {
        self.inner.visualizer.frequency_data().get()
    }

    /// Prime the microphone permission, load both models, then greet
    ///
    /// Returns once both loads have settled. Load failures are recorded on
    /// the owning engine's error signal, never returned.
    pub async fn initialize(&self) {
        info!("Initializing conversation engines");

        // Errors from an earlier failed load are stale once a retry begins.
        // Cleared before the permission prompt so a denial stays visible.
        for status in [&self.inner.signals.transcription, &self.inner.signals.generation] {
            if !status.loaded.get() {
                status.error.set_if_changed(None);
            }
        }

        if let Err(e) = self.inner.transcriber.request_permission().await {
            warn!("Microphone permission not granted: {}", e);
            self.record_error(Engine::Transcription, &e);
        }

        let (transcription_loaded, generation_loaded) = tokio::join!(
            self.load_transcription_model(),
            self.load_generation_model()
        );
        info!(
            transcription_loaded,
            generation_loaded, "Model loads settled"
        );
        self.emit(ConversationEvent::Initialized {
            transcription_loaded,
            generation_loaded,
        });

        if self.inner.config.greeting == GreetingPolicy::OnInitialize {
            self.greet().await;
        }
    }

    async fn load_transcription_model(&self) -> bool {
        let status = &self.inner.signals.transcription;
        let load = self.inner.transcriber.load(&status.progress);
        self.load_model(Engine::Transcription, status, load).await
    }

    async fn load_generation_model(&self) -> bool {
        let status = &self.inner.signals.generation;
        let load = self.inner.generator.load(&status.progress);
        self.load_model(Engine::Generation, status, load).await
    }

    async fn load_model(
        &self,
        engine: Engine,
        status: &ModelStatus,
        load: impl Future<Output = Result<()>>,
    ) -> bool {
        if status.loaded.get() {
            return true;
        }
        if !status.loading.try_raise() {
            debug!("{} model already loading", engine);
            return false;
        }
        let _loading = FlagGuard::adopt(&status.loading);
        status.progress.set(0);

        info!("Loading {} model", engine);
        let stopwatch = Stopwatch::start();
        match load.await {
            Ok(()) => {
                status.progress.set(100);
                status.loaded.set(true);
                info!("{} model loaded in {:?}", engine, stopwatch.elapsed());
                true
            }
            Err(e) => {
                error!("Failed to load {} model: {}", engine, e);
                self.record_error(engine, &e);
                false
            }
        }
    }

    async fn greet(&self) {
        self.inner.greeted.store(true, Ordering::SeqCst);
        let synthesizer = &self.inner.synthesizer;
        if !synthesizer.is_supported() {
            debug!("Speech output unsupported, skipping greeting");
            return;
        }

        info!("Greeting: {:?}", self.inner.config.greeting_text);
        if let Err(e) = synthesizer.speak(&self.inner.config.greeting_text).await {
            warn!("Greeting failed: {}", e);
            synthesizer.error().set_if_changed(Some(e.user_message()));
        }
    }

    /// Switch the conversation on or off; returns the new setting
    pub async fn toggle_conversation(&self) -> bool {
        if self.inner.signals.active.get() {
            self.deactivate();
            false
        } else {
            self.activate().await;
            true
        }
    }

    async fn activate(&self) {
        info!("Conversation on");
        self.inner.signals.active.set(true);
        self.emit(ConversationEvent::Toggled { active: true });

        if self.inner.config.greeting == GreetingPolicy::OnFirstActivation
            && !self.inner.greeted.load(Ordering::SeqCst)
        {
            self.greet().await;
            if !self.inner.signals.active.get() {
                return;
            }
        }

        self.inner.transcriber.clear();
        self.start_capture().await;
        if self.inner.signals.active.get() {
            self.inner.visualizer.start().await;
        }
    }

    /// Hard-stop capture, speech and visualization
    ///
    /// A generation call in flight is left to finish; its remaining
    /// sentences are dropped and capture stays off.
    fn deactivate(&self) {
        info!("Conversation off");
        self.inner.signals.active.set(false);

        let token = std::mem::replace(&mut *self.inner.turn_cancel.lock(), CancellationToken::new());
        token.cancel();

        self.stop_capture();
        self.inner.synthesizer.stop();
        self.inner.visualizer.stop();
        self.inner.visualizer.stop_simulation();
        self.emit(ConversationEvent::Toggled { active: false });
    }

    async fn start_capture(&self) -> bool {
        if !self.inner.signals.transcription.loaded.get() {
            warn!("Transcription model not loaded; capture not started");
            self.record_error(
                Engine::Transcription,
                &VoiceError::Transcription("model not loaded".to_string()),
            );
            return false;
        }

        match self.inner.transcriber.start().await {
            Ok(()) if !self.inner.signals.active.get() => {
                // Switched off while capture was starting
                self.inner.transcriber.stop();
                false
            }
            Ok(()) => {
                self.inner.signals.listening.set(true);
                *self.inner.listening_since.lock() = Some(Instant::now());
                debug!("Capture started");
                true
            }
            Err(e) => {
                self.inner.signals.listening.set_if_changed(false);
                self.record_error(Engine::Transcription, &e);
                false
            }
        }
    }

    fn stop_capture(&self) {
        self.inner.transcriber.stop();
        if self.inner.signals.listening.set_if_changed(false) {
            debug!("Capture stopped");
        }
    }

    fn skip_reason(&self, text: &str) -> Option<SkipReason> {
        let signals = &self.inner.signals;
        if text.is_empty() {
            Some(SkipReason::EmptyTranscript)
        } else if !self.is_model_loaded() {
            Some(SkipReason::ModelsNotLoaded)
        } else if signals.generating.get() {
            Some(SkipReason::Generating)
        } else if self.inner.synthesizer.speaking().get() {
            Some(SkipReason::Speaking)
        } else if !signals.active.get() {
            Some(SkipReason::Inactive)
        } else {
            None
        }
    }

    /// Run one turn for a finalized transcript
    ///
    /// Skipped unless the transcript is non-empty, both models are loaded,
    /// nothing is generating or speaking, the conversation is on and no
    /// other turn holds the processing flag.
    pub async fn handle_transcript(&self, transcript: &str) -> TurnOutcome {
        let text = transcript.trim();
        if let Some(reason) = self.skip_reason(text) {
            debug!("Transcript ignored ({}): {:?}", reason, text);
            return TurnOutcome::Skipped(reason);
        }
        if !self.inner.signals.processing.try_raise() {
            debug!("Transcript ignored ({}): {:?}", SkipReason::TurnInFlight, text);
            return TurnOutcome::Skipped(SkipReason::TurnInFlight);
        }
        let processing = FlagGuard::adopt(&self.inner.signals.processing);
        let cancel = self.inner.turn_cancel.lock().clone();
        let turn_id = Uuid::new_v4();

        info!(%turn_id, "Turn started: {:?}", text);
        if let Some(since) = self.inner.listening_since.lock().take() {
            self.inner.stats.lock().record_stt(since.elapsed());
        }
        self.stop_capture();
        self.inner.visualizer.stop();
        self.emit(ConversationEvent::TurnStarted {
            turn_id,
            transcript: text.to_string(),
        });

        let response = self.respond(turn_id, text, &cancel).await;

        drop(processing);
        let resumed_capture = self.resume_listening(&cancel).await;

        info!(%turn_id, resumed_capture, "Turn finished");
        self.emit(ConversationEvent::TurnFinished {
            turn_id,
            response: response.clone(),
            resumed_capture,
        });
        TurnOutcome::Completed {
            turn_id,
            response,
            resumed_capture,
        }
    }

    async fn respond(
        &self,
        turn_id: Uuid,
        text: &str,
        cancel: &CancellationToken,
    ) -> Option<String> {
        let synthesizer = &self.inner.synthesizer;
        let mut stopwatch = Stopwatch::start();

        if !synthesizer.is_supported() {
            let response = self.generate(text, &mut |_sentence: String| {}).await;
            self.inner.stats.lock().record_llm(stopwatch.split("generation"));
            return response;
        }

        let events = &self.inner.events;
        let mut index = 0;
        let mut on_sentence = |sentence: String| {
            if cancel.is_cancelled() {
                debug!(%turn_id, "Dropping sentence after deactivation: {:?}", sentence);
                let _ = events.send(ConversationEvent::SentenceDropped {
                    turn_id,
                    text: sentence,
                });
                return;
            }
            synthesizer.queue_sentence(&sentence);
            let _ = events.send(ConversationEvent::SentenceQueued {
                turn_id,
                index,
                text: sentence,
            });
            index += 1;
        };
        let response = self.generate(text, &mut on_sentence).await;
        let llm_time = stopwatch.split("generation");

        if !cancel.is_cancelled() {
            tokio::select! {
                _ = synthesizer.wait_for_queue() => {}
                _ = cancel.cancelled() => debug!(%turn_id, "Drain wait abandoned"),
            }
        }
        let tts_time = stopwatch.split("synthesis");
        debug!(%turn_id, "Turn timings: {:?}", stopwatch.splits());

        let mut stats = self.inner.stats.lock();
        stats.record_llm(llm_time);
        if !cancel.is_cancelled() {
            stats.record_tts(tts_time);
        }
        response
    }

    async fn generate(&self, text: &str, on_sentence: SentenceSink<'_>) -> Option<String> {
        let signals = &self.inner.signals;
        let _generating = signals.generating.raise_scoped();
        signals.response.set(String::new());
        signals.generation.error.set_if_changed(None);

        match self.inner.generator.generate_streaming(text, on_sentence).await {
            Ok(reply) => {
                debug!("Generated reply: {:?}", reply);
                signals.response.set(reply.clone());
                Some(reply)
            }
            Err(e) => {
                self.record_error(Engine::Generation, &e);
                None
            }
        }
    }

    async fn resume_listening(&self, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() || !self.inner.signals.active.get() {
            return false;
        }
        self.inner.transcriber.clear();
        let started = self.start_capture().await;
        if self.inner.signals.active.get() {
            self.inner.visualizer.start().await;
        }
        started
    }

    /// Spawn the observer tasks
    ///
    /// One runs a turn for each new transcript, one mirrors the speaking
    /// flag onto the visualizer, one reports synthesis errors and one
    /// publishes the derived state. Must be called from within a tokio
    /// runtime; a second call is a no-op.
    pub fn start(&self) {
        let mut watchers = self.inner.watchers.lock();
        if !watchers.is_empty() {
            warn!("Conversation watchers already running");
            return;
        }
        // Subscribe before spawning so nothing published after start() is missed
        let transcript = self.inner.transcriber.transcript().subscribe();
        let speaking = self.inner.synthesizer.speaking().subscribe();
        let errors = self.inner.synthesizer.error().subscribe();
        let signals = &self.inner.signals;
        let state_inputs = vec![
            signals.transcription.loading.subscribe(),
            signals.generation.loading.subscribe(),
            self.inner.synthesizer.speaking().subscribe(),
            signals.generating.subscribe(),
            signals.processing.subscribe(),
            signals.listening.subscribe(),
            signals.active.subscribe(),
        ];

        watchers.push(tokio::spawn(self.clone().watch_transcripts(transcript)));
        watchers.push(tokio::spawn(
            self.clone().mirror_speech_to_visualizer(speaking),
        ));
        watchers.push(tokio::spawn(self.clone().watch_synthesis_errors(errors)));
        watchers.push(tokio::spawn(self.clone().publish_states(state_inputs)));
        debug!("Started {} conversation watchers", watchers.len());
    }

    /// Switch the conversation off and stop the watchers
    pub fn shutdown(&self) {
        if self.is_active() {
            self.deactivate();
        }
        for handle in self.inner.watchers.lock().drain(..) {
            handle.abort();
        }
        info!("Conversation shut down");
    }

    async fn watch_transcripts(self, mut transcript: watch::Receiver<String>) {
        while transcript.changed().await.is_ok() {
            let text = transcript.borrow_and_update().clone();
            if text.trim().is_empty() {
                continue;
            }
            // Each transcript gets its own task so the guards see in-flight turns
            let this = self.clone();
            tokio::spawn(async move {
                this.handle_transcript(&text).await;
            });
        }
    }

    async fn mirror_speech_to_visualizer(self, mut speaking: watch::Receiver<bool>) {
        let mut was_speaking = *speaking.borrow_and_update();

        while speaking.changed().await.is_ok() {
            let now_speaking = *speaking.borrow_and_update();
            if now_speaking == was_speaking {
                continue;
            }
            was_speaking = now_speaking;
            if now_speaking {
                self.inner.visualizer.simulate_speaking();
            } else {
                self.inner.visualizer.stop_simulation();
            }
        }
    }

    async fn watch_synthesis_errors(self, mut errors: watch::Receiver<Option<String>>) {
        while errors.changed().await.is_ok() {
            let message = errors.borrow_and_update().clone();
            if let Some(message) = message {
                self.note_error(Engine::Synthesis, message);
            }
        }
    }

    async fn publish_states(self, mut inputs: Vec<watch::Receiver<bool>>) {
        self.publish_state();

        loop {
            let (changed, _, _) =
                select_all(inputs.iter_mut().map(|rx| Box::pin(rx.changed()))).await;
            if changed.is_err() {
                break;
            }
            self.publish_state();
        }
    }

    fn publish_state(&self) {
        let state = self.current_state();
        if self.inner.state.set_if_changed(state) {
            debug!("State: {}", state);
            self.emit(ConversationEvent::StateChanged(state));
        }
    }

    fn record_error(&self, engine: Engine, err: &VoiceError) {
        let message = err.user_message();
        match engine {
            Engine::Transcription => self
                .inner
                .signals
                .transcription
                .error
                .set(Some(message.clone())),
            Engine::Generation => self
                .inner
                .signals
                .generation
                .error
                .set(Some(message.clone())),
            Engine::Synthesis => {
                // Reported by the synthesis error watcher
                self.inner.synthesizer.error().set_if_changed(Some(message));
                return;
            }
        }
        self.note_error(engine, message);
    }

    fn note_error(&self, engine: Engine, message: String) {
        warn!("{} error: {}", engine, message);
        *self.inner.last_error.lock() = Some((engine, message.clone()));
        self.emit(ConversationEvent::EngineError { engine, message });
    }

    fn emit(&self, event: ConversationEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }
}

/// Builder for a [`ConversationOrchestrator`]
pub struct OrchestratorBuilder {
    transcriber: Arc<dyn TranscriptionEngine>,
    generator: Arc<dyn GenerationEngine>,
    synthesizer: Arc<dyn SynthesisEngine>,
    visualizer: Arc<dyn Visualizer>,
    config: ConversationConfig,
    stats: Option<SharedStats>,
}

impl OrchestratorBuilder {
    pub fn new(
        transcriber: Arc<dyn TranscriptionEngine>,
        generator: Arc<dyn GenerationEngine>,
        synthesizer: Arc<dyn SynthesisEngine>,
        visualizer: Arc<dyn Visualizer>,
    ) -> Self {
        Self {
            transcriber,
            generator,
            synthesizer,
            visualizer,
            config: ConversationConfig::default(),
            stats: None,
        }
    }

    /// Wire up a full set of simulated engines
    pub fn from_sim(engines: &SimEngines) -> Self {
        Self::new(
            engines.transcriber.clone(),
            engines.generator.clone(),
            engines.synthesizer.clone(),
            engines.visualizer.clone(),
        )
    }

    /// Set the complete configuration
    pub fn with_config(mut self, config: ConversationConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an existing stats tracker instead of creating one
    pub fn with_stats(mut self, stats: SharedStats) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Build the orchestrator
    pub fn build(self) -> Result<ConversationOrchestrator> {
        self.config.validate()?;
        let stats = self
            .stats
            .unwrap_or_else(|| shared_stats(self.config.stats_window));
        let (events, _) = broadcast::channel(self.config.event_buffer);

        Ok(ConversationOrchestrator {
            inner: Arc::new(Inner {
                config: self.config,
                transcriber: self.transcriber,
                generator: self.generator,
                synthesizer: self.synthesizer,
                visualizer: self.visualizer,
                signals: ConversationSignals::default(),
                state: Signal::new(ConversationState::Idle),
                events,
                stats,
                turn_cancel: Mutex::new(CancellationToken::new()),
                greeted: AtomicBool::new(false),
                listening_since: Mutex::new(None),
                last_error: Mutex::new(None),
                watchers: Mutex::new(Vec::new()),
            }),
        })
    }
}
