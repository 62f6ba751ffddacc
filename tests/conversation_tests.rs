//! Turn-taking tests driven through the simulated engines
//!
//! Every test runs on a paused clock, so utterance durations and token
//! delays elapse instantly but keep their relative order. The shared call
//! log records what each engine was asked to do and when.

use std::time::Duration;
use tokio::sync::broadcast;
use voxloop::conversation::{ConversationSignals, SkipReason, DEFAULT_GREETING};
use voxloop::engine::sim::{EngineCall, SimEngines, SimSettings};
use voxloop::{
    ConversationConfig, ConversationEvent, ConversationOrchestrator, ConversationState, Engine,
    GreetingPolicy, OrchestratorBuilder, SynthesisEngine, TranscriptionEngine, TurnOutcome,
};

fn settings_with_replies(replies: &[&str]) -> SimSettings {
    let mut settings = SimSettings::default();
    settings.generation.replies = replies.iter().map(|r| r.to_string()).collect();
    settings
}

fn build(engines: &SimEngines, config: ConversationConfig) -> ConversationOrchestrator {
    OrchestratorBuilder::from_sim(engines)
        .with_config(config)
        .build()
        .expect("valid config")
}

/// Loaded, switched on and listening, with a clean call log
async fn listening(settings: SimSettings) -> (SimEngines, ConversationOrchestrator) {
    let engines = SimEngines::new(settings);
    let conversation = build(&engines, ConversationConfig::default().without_greeting());
    conversation.initialize().await;
    assert!(conversation.toggle_conversation().await);
    assert!(engines.transcriber.is_capturing());
    engines.log.clear();
    (engines, conversation)
}

fn queued(engines: &SimEngines) -> Vec<String> {
    engines
        .log
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            EngineCall::SentenceQueued(text) => Some(text),
            _ => None,
        })
        .collect()
}

fn drain_events(rx: &mut broadcast::Receiver<ConversationEvent>) -> Vec<ConversationEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn assert_flags_clear(signals: &ConversationSignals) {
    assert!(!signals.processing.get(), "processing left raised");
    assert!(!signals.generating.get(), "generating left raised");
    assert!(!signals.transcription.loading.get());
    assert!(!signals.generation.loading.get());
}

#[tokio::test(start_paused = true)]
async fn test_weather_scenario() {
    let (engines, conversation) = listening(settings_with_replies(&["It's sunny. Enjoy!"])).await;

    let outcome = conversation.handle_transcript("What's the weather?").await;

    let TurnOutcome::Completed {
        response,
        resumed_capture,
        ..
    } = outcome.clone()
    else {
        panic!("turn was skipped: {:?}", outcome);
    };
    assert_eq!(response.as_deref(), Some("It's sunny. Enjoy!"));
    assert!(resumed_capture);
    assert_eq!(queued(&engines), vec!["It's sunny.", "Enjoy!"]);
    assert!(engines
        .log
        .position(|c| *c == EngineCall::GenerationStarted("What's the weather?".into()))
        .is_some());

    assert_eq!(engines.transcriber.transcript().get(), "");
    assert!(engines.transcriber.is_capturing());
    assert_eq!(conversation.current_state(), ConversationState::Listening);
    assert_eq!(conversation.signals().response.get(), "It's sunny. Enjoy!");
    assert_flags_clear(conversation.signals());
}

#[tokio::test(start_paused = true)]
async fn test_capture_is_off_for_the_whole_turn() {
    let mut settings = settings_with_replies(&["One is here. Two is here. Three is here."]);
    settings.transcription.start_ms = 20;
    let (engines, conversation) = listening(settings).await;

    assert!(conversation
        .handle_transcript("Count to three")
        .await
        .is_completed());

    let log = &engines.log;
    let stopped = log.position(|c| *c == EngineCall::CaptureStopped).unwrap();
    let generation = log
        .position(|c| matches!(c, EngineCall::GenerationStarted(_)))
        .unwrap();
    assert!(stopped < generation, "capture must stop before generation");

    assert_eq!(
        log.count(|c| matches!(c, EngineCall::UtteranceFinished(_))),
        3
    );
    let last_spoken = log
        .last_position(|c| matches!(c, EngineCall::UtteranceFinished(_)))
        .unwrap();
    let resumed = log.last_position(|c| *c == EngineCall::CaptureStarted).unwrap();
    assert!(last_spoken < resumed, "capture resumed before speech drained");
    assert_eq!(log.count(|c| *c == EngineCall::CaptureStarted), 1);

    let spoken_at = log
        .last_time(|c| matches!(c, EngineCall::UtteranceFinished(_)))
        .unwrap();
    let resumed_at = log.last_time(|c| *c == EngineCall::CaptureStarted).unwrap();
    assert!(resumed_at > spoken_at, "capture resumed at the instant speech ended");
    assert!(resumed_at - spoken_at >= Duration::from_millis(20));

    // Nothing reopened the microphone while speech was playing
    let first_spoken = log
        .position(|c| matches!(c, EngineCall::UtteranceStarted(_)))
        .unwrap();
    assert!(log.calls()[first_spoken..resumed]
        .iter()
        .all(|c| *c != EngineCall::CaptureStarted));
}

#[tokio::test(start_paused = true)]
async fn test_sentences_are_queued_while_generating() {
    let (engines, conversation) =
        listening(settings_with_replies(&["First part. Second part."])).await;

    conversation.handle_transcript("Go").await;

    let log = &engines.log;
    let first_queued = log
        .position(|c| matches!(c, EngineCall::SentenceQueued(_)))
        .unwrap();
    let finished = log.position(|c| *c == EngineCall::GenerationFinished).unwrap();
    assert!(first_queued < finished, "first sentence waited for the full reply");
    assert_eq!(queued(&engines), vec!["First part.", "Second part."]);
}

#[tokio::test(start_paused = true)]
async fn test_transcript_while_inactive_is_ignored() {
    let engines = SimEngines::new(SimSettings::default());
    let conversation = build(&engines, ConversationConfig::default().without_greeting());
    conversation.initialize().await;

    assert_eq!(
        conversation.handle_transcript("Hello?").await,
        TurnOutcome::Skipped(SkipReason::Inactive)
    );
    assert!(!engines.transcriber.hear("Hello?"));
    assert_eq!(
        engines
            .log
            .count(|c| matches!(c, EngineCall::GenerationStarted(_))),
        0
    );
    assert_eq!(conversation.current_state(), ConversationState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_transcript_during_turn_is_ignored() {
    let (engines, conversation) =
        listening(settings_with_replies(&["A fairly long answer. With two parts."])).await;

    let turn = {
        let conversation = conversation.clone();
        tokio::spawn(async move { conversation.handle_transcript("First").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(conversation.is_processing());

    let second = conversation.handle_transcript("Second").await;
    assert!(matches!(second, TurnOutcome::Skipped(_)), "{:?}", second);

    assert!(turn.await.unwrap().is_completed());
    assert_eq!(
        engines
            .log
            .count(|c| matches!(c, EngineCall::GenerationStarted(_))),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_processing_flag_is_single_flight() {
    let (_engines, conversation) = listening(SimSettings::default()).await;

    conversation.signals().processing.set(true);
    assert_eq!(
        conversation.handle_transcript("Hello").await,
        TurnOutcome::Skipped(SkipReason::TurnInFlight)
    );
    // The skipped transcript must not release someone else's claim
    assert!(conversation.is_processing());
}

#[tokio::test(start_paused = true)]
async fn test_deactivation_mid_turn_keeps_capture_off() {
    let (engines, conversation) = listening(settings_with_replies(&[
        "One is here. Two is here. Three is here.",
    ]))
    .await;
    let mut events = conversation.subscribe();

    let turn = {
        let conversation = conversation.clone();
        tokio::spawn(async move { conversation.handle_transcript("Count to three").await })
    };

    let mut speaking = engines.synthesizer.speaking().subscribe();
    speaking.wait_for(|speaking| *speaking).await.unwrap();
    assert!(!conversation.toggle_conversation().await);
    let stopped = engines.log.position(|c| *c == EngineCall::SynthesisStopped).unwrap();

    let outcome = turn.await.unwrap();
    assert!(matches!(
        outcome,
        TurnOutcome::Completed {
            resumed_capture: false,
            ..
        }
    ));

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!engines.transcriber.is_capturing());
    assert_eq!(engines.log.count(|c| *c == EngineCall::CaptureStarted), 0);
    assert!(engines.log.calls()[stopped..]
        .iter()
        .all(|c| !matches!(c, EngineCall::SentenceQueued(_))));
    assert_eq!(conversation.current_state(), ConversationState::Idle);
    assert_flags_clear(conversation.signals());

    let dropped = drain_events(&mut events)
        .into_iter()
        .filter(|e| matches!(e, ConversationEvent::SentenceDropped { .. }))
        .count();
    assert_eq!(dropped, 2);
}

#[tokio::test(start_paused = true)]
async fn test_toggle_off_and_on_mid_turn_leaves_capture_to_activation() {
    let (engines, conversation) = listening(settings_with_replies(&[
        "One is here. Two is here. Three is here.",
    ]))
    .await;

    let turn = {
        let conversation = conversation.clone();
        tokio::spawn(async move { conversation.handle_transcript("Count to three").await })
    };

    // Still generating the first sentence
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(conversation.signals().generating.get());
    assert!(!conversation.toggle_conversation().await);
    assert!(conversation.toggle_conversation().await);
    assert!(engines.transcriber.is_capturing());
    let reopened = engines.log.position(|c| *c == EngineCall::CaptureStarted).unwrap();

    let outcome = turn.await.unwrap();
    assert!(
        matches!(
            outcome,
            TurnOutcome::Completed {
                resumed_capture: false,
                ..
            }
        ),
        "cancelled turn resumed capture: {:?}",
        outcome
    );

    tokio::time::sleep(Duration::from_secs(5)).await;
    let log = &engines.log;
    assert_eq!(log.count(|c| *c == EngineCall::CaptureStarted), 1);
    let finished = log.position(|c| *c == EngineCall::GenerationFinished).unwrap();
    assert!(reopened < finished, "capture reopened by the turn, not the activation");
    assert!(queued(&engines).is_empty());
    assert!(engines.transcriber.is_capturing());
    assert_eq!(conversation.current_state(), ConversationState::Listening);
    assert_flags_clear(conversation.signals());
}

#[tokio::test(start_paused = true)]
async fn test_initialize_settles_when_a_load_fails() {
    let mut settings = SimSettings::default();
    settings.transcription.load_ms = 400;
    settings.transcription.load_error = Some("404".into());
    settings.generation.load_ms = 100;

    let engines = SimEngines::new(settings);
    let conversation = build(&engines, ConversationConfig::default().without_greeting());
    let mut events = conversation.subscribe();
    conversation.initialize().await;

    let signals = conversation.signals();
    assert_flags_clear(signals);
    assert!(!signals.transcription.loaded.get());
    assert!(signals.generation.loaded.get());
    assert_eq!(signals.generation.progress.get(), 100);
    assert_eq!(
        conversation.error(Engine::Transcription).as_deref(),
        Some("Failed to load model: 404")
    );
    assert_ne!(conversation.current_state(), ConversationState::Loading);
    assert!(drain_events(&mut events).contains(&ConversationEvent::Initialized {
        transcription_loaded: false,
        generation_loaded: true,
    }));
}

#[tokio::test(start_paused = true)]
async fn test_initialize_settles_in_either_order() {
    for (stt_ms, llm_ms) in [(50, 300), (300, 50)] {
        let mut settings = SimSettings::default();
        settings.transcription.load_ms = stt_ms;
        settings.generation.load_ms = llm_ms;
        settings.generation.load_error = Some("out of memory".into());

        let engines = SimEngines::new(settings);
        let conversation = build(&engines, ConversationConfig::default().without_greeting());

        let init = {
            let conversation = conversation.clone();
            tokio::spawn(async move { conversation.initialize().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(conversation.current_state(), ConversationState::Loading);

        init.await.unwrap();
        assert_flags_clear(conversation.signals());
        assert!(conversation.signals().transcription.loaded.get());
        assert!(!conversation.is_model_loaded());
        assert_eq!(conversation.current_state(), ConversationState::Idle);
    }
}

#[tokio::test(start_paused = true)]
async fn test_unsupported_synthesis_still_completes_turn() {
    let mut settings = settings_with_replies(&["It's sunny. Enjoy!"]);
    settings.synthesis.supported = false;
    let (engines, conversation) = listening(settings).await;

    let outcome = conversation.handle_transcript("What's the weather?").await;
    assert!(matches!(
        outcome,
        TurnOutcome::Completed {
            resumed_capture: true,
            ..
        }
    ));
    assert!(queued(&engines).is_empty());
    assert_eq!(engines.log.count(|c| *c == EngineCall::QueueWaitStarted), 0);
    assert!(engines.transcriber.is_capturing());
}

#[tokio::test(start_paused = true)]
async fn test_generation_failure_ends_turn_quietly() {
    let mut settings = SimSettings::default();
    settings.generation.generation_error = Some("context overflow".into());
    let (engines, conversation) = listening(settings).await;

    let outcome = conversation.handle_transcript("Hello").await;
    assert!(matches!(
        outcome,
        TurnOutcome::Completed {
            response: None,
            resumed_capture: true,
            ..
        }
    ));
    assert_eq!(
        conversation.error(Engine::Generation).as_deref(),
        Some("Failed to generate response: context overflow")
    );
    assert_eq!(
        conversation.last_error().map(|(engine, _)| engine),
        Some(Engine::Generation)
    );
    assert!(engines.transcriber.is_capturing());
    assert_flags_clear(conversation.signals());
}

#[tokio::test(start_paused = true)]
async fn test_failed_utterance_does_not_hang_turn() {
    let mut settings = settings_with_replies(&["This works. This breaks."]);
    settings.synthesis.fail_containing = Some("breaks".into());
    let (engines, conversation) = listening(settings).await;

    let outcome = tokio::time::timeout(
        Duration::from_secs(30),
        conversation.handle_transcript("Try it"),
    )
    .await
    .expect("turn hung on a failed utterance");
    assert!(outcome.is_completed());
    assert_eq!(
        conversation.error(Engine::Synthesis).as_deref(),
        Some("Speech error: synthesis-failed")
    );
    assert!(engines.transcriber.is_capturing());
}

#[tokio::test(start_paused = true)]
async fn test_watchers_drive_turns_from_transcripts() {
    let (engines, conversation) = listening(settings_with_replies(&["It's sunny. Enjoy!"])).await;
    let mut events = conversation.subscribe();
    conversation.start();

    assert!(engines.transcriber.hear("What's the weather?"));
    let finished = loop {
        match events.recv().await.unwrap() {
            ConversationEvent::TurnFinished {
                resumed_capture, ..
            } => break resumed_capture,
            _ => continue,
        }
    };
    assert!(finished);

    // The visualizer animated while speech played
    let log = &engines.log;
    let simulated = log.position(|c| *c == EngineCall::SimulationStarted).unwrap();
    let first_spoken = log
        .position(|c| matches!(c, EngineCall::UtteranceStarted(_)))
        .unwrap();
    assert!(simulated > first_spoken);

    let mut state = conversation.watch_state();
    state
        .wait_for(|s| *s == ConversationState::Listening)
        .await
        .unwrap();
    assert!(log.position(|c| *c == EngineCall::SimulationStopped).is_some());
    conversation.shutdown();
    assert!(!conversation.is_active());
}

#[tokio::test(start_paused = true)]
async fn test_published_states_follow_the_turn() {
    let (_engines, conversation) = listening(settings_with_replies(&["Sure thing."])).await;
    let mut events = conversation.subscribe();
    conversation.start();
    tokio::task::yield_now().await;

    conversation.handle_transcript("Help me").await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    let states: Vec<ConversationState> = drain_events(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            ConversationEvent::StateChanged(state) => Some(state),
            _ => None,
        })
        .collect();
    for expected in [
        ConversationState::Thinking,
        ConversationState::Speaking,
        ConversationState::Listening,
    ] {
        assert!(states.contains(&expected), "{:?} missing from {:?}", expected, states);
    }
    assert_eq!(states.last(), Some(&ConversationState::Listening));
    conversation.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_greeting_on_initialize() {
    let engines = SimEngines::new(SimSettings::default());
    let conversation = build(&engines, ConversationConfig::default());
    conversation.initialize().await;

    assert_eq!(
        engines.log.calls(),
        vec![
            EngineCall::Spoke(DEFAULT_GREETING.to_string()),
            EngineCall::UtteranceStarted(DEFAULT_GREETING.to_string()),
            EngineCall::UtteranceFinished(DEFAULT_GREETING.to_string()),
        ]
    );
    assert!(!engines.synthesizer.speaking().get());
}

#[tokio::test(start_paused = true)]
async fn test_greeting_on_first_activation_only() {
    let engines = SimEngines::new(SimSettings::default());
    let config = ConversationConfig::default()
        .with_greeting(GreetingPolicy::OnFirstActivation)
        .with_greeting_text("Hello there.");
    let conversation = build(&engines, config);
    conversation.initialize().await;
    assert_eq!(engines.log.count(|c| matches!(c, EngineCall::Spoke(_))), 0);

    conversation.toggle_conversation().await;
    let spoke = engines
        .log
        .position(|c| *c == EngineCall::Spoke("Hello there.".into()))
        .unwrap();
    let capture = engines.log.position(|c| *c == EngineCall::CaptureStarted).unwrap();
    assert!(spoke < capture, "capture opened during the greeting");

    conversation.toggle_conversation().await;
    conversation.toggle_conversation().await;
    assert_eq!(engines.log.count(|c| matches!(c, EngineCall::Spoke(_))), 1);
}

#[tokio::test(start_paused = true)]
async fn test_denied_microphone_is_reported() {
    let mut settings = SimSettings::default();
    settings.transcription.deny_permission = true;
    let engines = SimEngines::new(settings);
    let conversation = build(&engines, ConversationConfig::default().without_greeting());

    conversation.initialize().await;
    assert!(conversation.signals().transcription.loaded.get());
    assert_eq!(
        conversation.error(Engine::Transcription).as_deref(),
        Some("Microphone access denied. Please allow microphone permission and reload the page.")
    );

    conversation.toggle_conversation().await;
    assert!(!engines.transcriber.is_capturing());
    assert_eq!(conversation.current_state(), ConversationState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_stats_cover_each_stage() {
    let (_engines, conversation) = listening(settings_with_replies(&["Short reply."])).await;
    tokio::time::sleep(Duration::from_millis(1500)).await;

    conversation.handle_transcript("Hello").await;

    let stats = conversation.stats();
    let stats = stats.lock();
    assert_eq!(stats.turn_count(), 1);
    assert!(stats.avg_stt_ms() >= 1500);
    assert!(stats.avg_llm_ms() > 0);
    assert!(stats.avg_tts_ms() > 0);
}
