//! Top-level prompt pipeline: directives, retry semantics, direct handling,
//! classification, symbolic short-circuit, local generation, the uncertainty
//! gate, the fallback cascade, and persistence.
//!
//! The controller owns every subsystem for the lifetime of the session and
//! never propagates errors past its own boundary — failures become logged
//! events and user-visible messages.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{error, info, warn};

use meridian_accel::AccelerationManager;
use meridian_assist::{CascadeOutcome, CascadeRequest, FallbackOrchestrator};
use meridian_bridge::{BridgeSettings, LocalBridge};
use meridian_clock::TimeSync;
use meridian_config::AppConfig;
use meridian_feedback::FeedbackLedger;
use meridian_llm::{GenerationParams, LocalModel};
use meridian_memory::{
    AttemptRecord, FeedbackRecord, Interaction, MemoryManager, MemoryParams, MetricsTracker,
    ReasoningStepRecord,
};
use meridian_reason::classify::{self, Classification, QueryKind};
use meridian_reason::tracer::ReasoningTracer;
use meridian_reason::{format_trace, tone, uncertainty, ReasoningStep};
use meridian_store::DocumentStore;

use crate::direct;

/// What the REPL should do after a processed line.
#[derive(Debug)]
pub enum ControllerAction {
    Exit,
    Reply(String),
}

pub struct PipelineController {
    config: AppConfig,
    store: Arc<DocumentStore>,
    clock: Arc<TimeSync>,
    memory: MemoryManager,
    metrics: MetricsTracker,
    ledger: FeedbackLedger,
    tracer: ReasoningTracer,
    model: Box<dyn LocalModel>,
    orchestrator: FallbackOrchestrator,
    accel: AccelerationManager,
    bridge: Option<(SocketAddr, tokio::task::JoinHandle<()>)>,
    assist_enabled: bool,
    question_counter: u64,
    last_prompt: Option<String>,
    last_question_id: Option<String>,
}

impl PipelineController {
    pub fn new(
        config: AppConfig,
        store: Arc<DocumentStore>,
        clock: Arc<TimeSync>,
        model: Box<dyn LocalModel>,
        orchestrator: FallbackOrchestrator,
        accel: AccelerationManager,
    ) -> Self {
        let memory = MemoryManager::open(
            Arc::clone(&store),
            MemoryParams {
                session_size: config.memory.session_size,
                long_term_size: config.memory.long_term_size,
                max_age_days: config.memory.max_age_days,
                prune_threshold: config.memory.prune_threshold,
                relevance_window: config.memory.relevance_window,
                relevance_floor: config.memory.relevance_floor,
                relevance_top_k: config.memory.relevance_top_k,
            },
        );
        let metrics = MetricsTracker::open(Arc::clone(&store));
        let ledger = FeedbackLedger::open(Arc::clone(&store));
        let assist_enabled = memory.preference("assist") == Some("on");

        Self {
            config,
            store,
            clock,
            memory,
            metrics,
            ledger,
            tracer: ReasoningTracer::new(),
            model,
            orchestrator,
            accel,
            bridge: None,
            assist_enabled,
            question_counter: 0,
            last_prompt: None,
            last_question_id: None,
        }
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    pub fn assist_enabled(&self) -> bool {
        self.assist_enabled
    }

    /// Process one line of user input.
    pub async fn process(&mut self, input: &str) -> ControllerAction {
        let input = input.trim();
        if input.is_empty() {
            return ControllerAction::Reply(String::new());
        }

        if input.starts_with('#') {
            return self.handle_directive(input).await;
        }

        for (prefix, source) in [
            ("search web:", "websearch"),
            ("ask claude:", "claude"),
            ("ask perplexity:", "perplexity"),
        ] {
            if let Some(rest) = strip_prefix_ci(input, prefix) {
                return self.forced_source(source, rest.trim()).await;
            }
        }

        self.run_pipeline(input).await
    }

    /// Flush session state and stop background services.  Called once at
    /// shutdown; safe to call repeatedly.
    pub fn shutdown(&mut self) {
        self.memory.save_session();
        self.clock.stop();
        if let Some((addr, handle)) = self.bridge.take() {
            info!(%addr, "stopping bridge");
            handle.abort();
        }
    }

    // ── Control directives ───────────────────────────────────────────────────

    async fn handle_directive(&mut self, input: &str) -> ControllerAction {
        let lower = input.to_lowercase();
        let word = lower.split_whitespace().next().unwrap_or_default();

        match word {
            "#exit" => return ControllerAction::Exit,
            "#help" => return ControllerAction::Reply(help_text()),
            "#reset" => {
                self.memory.reset_session();
                return ControllerAction::Reply("Conversation memory cleared".to_string());
            }
            "#stats" => {
                let stats = self.memory.stats();
                return ControllerAction::Reply(format!(
                    "Interactions this session: {}\nLong-term stored: {}\nMemory size: {:.2} KB",
                    stats.session_count,
                    stats.long_term_count,
                    stats.disk_bytes as f64 / 1024.0
                ));
            }
            "#pwd" => return ControllerAction::Reply(meridian_tools::current_directory()),
            "#bridge" => return self.toggle_bridge().await,
            "#assist" => {
                self.assist_enabled = !self.assist_enabled;
                let state = if self.assist_enabled { "on" } else { "off" };
                self.memory.set_preference("assist", state);
                return ControllerAction::Reply(format!(
                    "Assist fallback is now {state}. The hosted assistant {} consulted when local \
                     confidence is low.",
                    if self.assist_enabled { "will be" } else { "will not be" }
                ));
            }
            "#assist-stats" => return ControllerAction::Reply(self.assist_stats()),
            "#performance" => {
                let profile = self.accel.profile(false).await;
                return ControllerAction::Reply(format!(
                    "{}\n\nAcceleration\n─────────────────────────────────────────────\n\
                     Ranked devices:       {}\nThermal state:        {}\nBattery:              {}%",
                    self.metrics.summary(),
                    profile.ranked.join(" > "),
                    profile.thermal_state,
                    profile.battery_pct,
                ));
            }
            "#reset_metrics" => {
                self.metrics.reset();
                return ControllerAction::Reply("All performance metrics reset".to_string());
            }
            "#memory" => return ControllerAction::Reply(self.memory.summary()),
            "#prune_memory" => {
                let removed = self.memory.prune();
                return ControllerAction::Reply(format!("Memory pruned ({removed} removed)"));
            }
            "#export_memory" => {
                return ControllerAction::Reply(match self.memory.export() {
                    Ok(path) => format!("Memory exported to {path}"),
                    Err(err) => format!("⚠ Export failed: {err}"),
                });
            }
            "#export_learning" => {
                return ControllerAction::Reply(match self.ledger.export_learning_data() {
                    Ok(path) => format!("Learning data exported to {path}"),
                    Err(err) => format!("⚠ Export failed: {err}"),
                });
            }
            "#feedback" => return ControllerAction::Reply(self.ledger.summary()),
            "#context" => return ControllerAction::Reply(self.context_summary()),
            "#correct" | "#incorrect" => return self.handle_feedback(input),
            "#tone" => {
                let arg = input.split_whitespace().nth(1);
                return match arg.and_then(tone::Tone::parse) {
                    Some(tone) => {
                        self.memory.set_tone(Some(tone.as_str().to_string()));
                        self.memory.set_preference("tone", tone.as_str());
                        ControllerAction::Reply(format!("Tone preference set to {}", tone.as_str()))
                    }
                    None => ControllerAction::Reply(
                        "Available tones: technical, conversational, advisory, concise".to_string(),
                    ),
                };
            }
            "#verbosity" => {
                let arg = input.split_whitespace().nth(1);
                return match arg.and_then(tone::Verbosity::parse) {
                    Some(level) => {
                        self.memory.set_verbosity(Some(level.as_str().to_string()));
                        self.memory.set_preference("verbosity", level.as_str());
                        ControllerAction::Reply(format!(
                            "Verbosity preference set to {}",
                            level.as_str()
                        ))
                    }
                    None => ControllerAction::Reply(
                        "Available levels: short, medium, long".to_string(),
                    ),
                };
            }
            _ => {}
        }

        ControllerAction::Reply(format!("Unknown command {word} — see #help"))
    }

    async fn toggle_bridge(&mut self) -> ControllerAction {
        if let Some((addr, _)) = &self.bridge {
            return ControllerAction::Reply(format!(
                "Bridge is already running on {addr}\nUse #exit to stop Meridian and the bridge"
            ));
        }

        let settings = BridgeSettings {
            host: self.config.bridge.host.clone(),
            port: self.config.bridge.port,
            api_key: self.config.bridge.api_key.clone(),
            runtime_dir: self.config.base_dir().join("runtime"),
            exec_timeout: std::time::Duration::from_secs(self.config.bridge.exec_timeout_secs),
            ..BridgeSettings::default()
        };
        let bridge = LocalBridge::new(settings, Arc::clone(&self.store));
        match bridge.spawn().await {
            Ok((addr, handle)) => {
                self.bridge = Some((addr, handle));
                ControllerAction::Reply(format!(
                    "Bridge started on {addr}\nCollaborating tools can now POST to /run with the \
                     X-Bridge-Key header."
                ))
            }
            Err(err) => {
                error!(%err, "bridge failed to start");
                ControllerAction::Reply(format!("⚠ Bridge failed to start: {err}"))
            }
        }
    }

    fn assist_stats(&self) -> String {
        #[derive(serde::Deserialize)]
        struct Record {
            source: String,
            ok: bool,
        }

        let records: Vec<Record> = self.store.read_jsonl("logs/fallback.jsonl");
        let total = records.len();
        let succeeded = records.iter().filter(|r| r.ok).count();
        let hosted = records.iter().filter(|r| r.source == "claude").count();
        format!(
            "Fallback attempts:    {total}\nSucceeded:            {succeeded}\n\
             Hosted assistant:     {hosted}\nAssist enabled:       {}",
            self.assist_enabled
        )
    }

    fn context_summary(&self) -> String {
        let metadata = self.memory.metadata();
        let stats = self.memory.stats();
        let mut lines = vec![
            "Session Context".to_string(),
            "─────────────────────────────────────────────".to_string(),
            format!("Session id:      {}", metadata.session_id),
            format!("Queries:         {}", metadata.query_count),
            format!("Last topic:      {}", metadata.last_topic.as_deref().unwrap_or("n/a")),
            format!("Tone:            {}", metadata.tone.as_deref().unwrap_or("auto")),
            format!("Verbosity:       {}", metadata.verbosity.as_deref().unwrap_or("auto")),
            format!("Session items:   {}", stats.session_count),
            format!("Long-term items: {}", stats.long_term_count),
        ];
        if !self.memory.preferences().is_empty() {
            lines.push("Preferences:".to_string());
            for (key, value) in self.memory.preferences() {
                lines.push(format!("  {key}: {value}"));
            }
        }
        lines.join("\n")
    }

    fn handle_feedback(&mut self, input: &str) -> ControllerAction {
        let (head, note) = split_feedback_note(input);
        let is_correct = head.eq_ignore_ascii_case("#correct");

        let Some(last) = self.memory.last_interaction() else {
            return ControllerAction::Reply("No response to rate yet".to_string());
        };
        let source = last.source.clone();
        let prompt = last.prompt.clone();
        let response = last.final_text.clone();
        let confidence = last.confidence;

        self.memory.attach_feedback(FeedbackRecord {
            is_correct,
            note: note.clone(),
            ts: Utc::now(),
        });
        self.ledger
            .add_feedback(&source, &prompt, &response, is_correct, note.as_deref(), confidence);
        self.metrics.record_feedback(is_correct);

        let mut lines = vec![if is_correct {
            "✓ Last response marked as correct".to_string()
        } else {
            "✗ Last response marked as incorrect".to_string()
        }];
        if let Some(note) = &note {
            lines.push(format!(
                "{} {note}",
                if is_correct { "Positive refinement:" } else { "Correction note:" }
            ));
            lines.push("Feedback stored for adaptive learning.".to_string());
            if !is_correct {
                lines.push("Tip: type 'try again' to retry with corrections.".to_string());
            }
        } else {
            lines.push("Thank you for the feedback!".to_string());
        }
        ControllerAction::Reply(lines.join("\n"))
    }

    // ── Forced-source prefixes ───────────────────────────────────────────────

    async fn forced_source(&mut self, source: &str, prompt: &str) -> ControllerAction {
        if prompt.is_empty() {
            return ControllerAction::Reply(format!("Nothing to send to {source}"));
        }

        let started = Instant::now();
        match self.orchestrator.ask_single(source, prompt).await {
            Ok(text) => {
                let latency_ms = started.elapsed().as_millis() as u64;
                let question_id = fresh_question_id(&mut self.question_counter);
                self.record_interaction(
                    &question_id,
                    prompt,
                    &text,
                    source,
                    0.8,
                    "conceptual",
                    false,
                    true,
                    vec![AttemptRecord {
                        source: source.to_string(),
                        ok: true,
                        confidence: 0.8,
                        latency_ms,
                        error: None,
                    }],
                    Vec::new(),
                );
                self.metrics.record_query(latency_ms, false, false);
                ControllerAction::Reply(format!("[{source}]\n{text}"))
            }
            Err(err) => ControllerAction::Reply(format!("⚠ {source} failed: {err}")),
        }
    }

    // ── The main pipeline ────────────────────────────────────────────────────

    async fn run_pipeline(&mut self, input: &str) -> ControllerAction {
        let started = Instant::now();
        let mut out: Vec<String> = Vec::new();

        // Retry reuses the previous prompt and question id; anything else is
        // a strictly fresh question boundary.
        let is_retry = classify::is_retry(input) && self.last_prompt.is_some();
        let (prompt, question_id) = if is_retry {
            let prompt = self.last_prompt.clone().expect("checked above");
            let question_id = self.last_question_id.clone().expect("retry follows a question");
            out.push(format!("♻ Retrying last query: \"{prompt}\""));
            (prompt, question_id)
        } else {
            let question_id = fresh_question_id(&mut self.question_counter);
            self.last_prompt = Some(input.to_string());
            self.last_question_id = Some(question_id.clone());
            (input.to_string(), question_id)
        };

        // Follow-up prompts lean on the previous exchange, which the model
        // prompt already carries; surface that so the user knows.
        if !is_retry && classify::is_expansion(&prompt) && self.memory.last_interaction().is_some() {
            out.push("Using context from the previous interaction".to_string());
        }

        self.tracer.begin(&question_id);

        // Deterministic direct handling needs no trace, no LLM.
        if let Some(text) = direct::handle(&prompt, &self.config, &self.memory).await {
            let latency_ms = started.elapsed().as_millis() as u64;
            self.record_interaction(
                &question_id,
                &prompt,
                &text,
                "local",
                1.0,
                "direct",
                false,
                false,
                Vec::new(),
                vec![ReasoningStep::new(1, "Recognized a direct command and ran it locally")],
            );
            self.metrics.record_query(latency_ms, true, false);
            out.push(text);
            return ControllerAction::Reply(out.join("\n\n"));
        }

        let clock = self.clock.now();
        let classification = classify::classify(&prompt, &clock);
        let temporal = classify::temporal_analysis(&classification, &clock);

        if temporal.time_sensitive {
            out.push(format!("[Time Context] {}", self.clock.context_header()));
            if temporal.temporal_uncertain {
                out.push(format!(
                    "This query is time-sensitive and may involve events after the knowledge \
                     cutoff ({}). Consulting live data sources where needed.",
                    clock.knowledge_cutoff
                ));
            }
        }

        let steps = self.tracer.steps_for(&prompt, &classification);
        out.push(format_trace(&steps));
        if classification.kind == QueryKind::Code {
            out.push(self.tracer.pseudocode_for(&prompt));
        }

        let outcome = self.resolve_answer(&prompt, &classification, &temporal, &mut out).await;

        let (ok, warnings) = self.tracer.validate(&steps, &outcome.final_text);
        if !ok || !warnings.is_empty() {
            for warning in &warnings {
                out.push(format!("[validation] {warning}"));
            }
        }

        // Tone shaping: explicit preferences override detection.
        let tone_pref = self.memory.preference("tone").map(str::to_string);
        let verbosity_pref = self.memory.preference("verbosity").map(str::to_string);
        let (detected_tone, _) = tone::detect_tone(&prompt, tone_pref.as_deref());
        let verbosity = tone::detect_verbosity(&prompt, verbosity_pref.as_deref());
        out.push(format!(
            "{}\n{}",
            tone::header(detected_tone, verbosity),
            outcome.display_text
        ));

        let latency_ms = started.elapsed().as_millis() as u64;
        self.record_interaction(
            &question_id,
            &prompt,
            &outcome.stored_text,
            &outcome.source,
            outcome.confidence,
            classification.kind.as_str(),
            temporal.time_sensitive,
            outcome.used_fallback,
            outcome.attempts,
            steps,
        );
        self.metrics.record_query(latency_ms, false, outcome.used_llm);

        // Advisory only: log what the learned weights would have picked.
        let mut tags: Vec<&str> = Vec::new();
        if temporal.time_sensitive {
            tags.push("time_sensitive");
        }
        if classification.kind == QueryKind::Code {
            tags.push("coding");
        }
        if classification.kind == QueryKind::Math {
            tags.push("math");
        }
        let (advised, advised_score) = self.ledger.best_source_for(&tags);
        info!(advised = %advised, advised_score, actual = %outcome.source, "source advisory");

        ControllerAction::Reply(out.join("\n\n"))
    }

    /// Steps 8–10: symbolic short-circuit, local generation, uncertainty
    /// gate, and the cascade.
    async fn resolve_answer(
        &mut self,
        prompt: &str,
        classification: &Classification,
        temporal: &classify::TemporalAnalysis,
        out: &mut Vec<String>,
    ) -> ResolvedAnswer {
        let mut attempts: Vec<AttemptRecord> = Vec::new();

        // A verified symbolic answer is always final: it bypasses both the
        // uncertainty gate and the cascade.
        if let Some(answer) = self.tracer.calculated_answer() {
            attempts.push(AttemptRecord {
                source: "local_calculated".to_string(),
                ok: true,
                confidence: 1.0,
                latency_ms: 0,
                error: None,
            });
            return ResolvedAnswer {
                display_text: answer.clone(),
                stored_text: answer.clone(),
                final_text: answer,
                source: "local_calculated".to_string(),
                confidence: 1.0,
                attempts,
                used_fallback: false,
                used_llm: false,
            };
        }

        // Local generation.
        let params = self.generation_params(prompt);
        let llm_prompt = self.build_prompt(prompt);
        let llm_started = Instant::now();
        let (local_text, local_error, llm_latency_ms) =
            match self.model.generate(&llm_prompt, &params).await {
                Ok(response) => (response.text, None, response.latency_ms),
                Err(err) => {
                    // LocalModelFailed: record it and continue with empty text,
                    // which the uncertainty gate always sends to the cascade.
                    warn!(%err, "local model failed");
                    self.metrics.record_error();
                    (
                        String::new(),
                        Some(err.to_string()),
                        llm_started.elapsed().as_millis() as u64,
                    )
                }
            };

        let report = uncertainty::assess_with_threshold(
            &local_text,
            self.config.assist.uncertainty_threshold,
        );
        let mut confidence = report.confidence;
        let mut should_fallback = report.should_fallback;
        if temporal.forces_fallback {
            // Temporal override: even a confident local answer must verify
            // against live sources.
            should_fallback = true;
            confidence = confidence.min(0.5);
        }

        attempts.push(AttemptRecord {
            source: "local".to_string(),
            ok: local_error.is_none(),
            confidence,
            latency_ms: llm_latency_ms,
            error: local_error,
        });

        if !should_fallback {
            return ResolvedAnswer {
                display_text: local_text.clone(),
                stored_text: local_text.clone(),
                final_text: local_text,
                source: "local".to_string(),
                confidence,
                attempts,
                used_fallback: false,
                used_llm: true,
            };
        }

        let reason = if temporal.forces_fallback && !report.should_fallback {
            "time-sensitive query requires live data".to_string()
        } else {
            format!("{:?}", report.triggers)
        };
        out.push(format!(
            "⚡ Local confidence {confidence:.2} — consulting external sources ({reason})"
        ));

        let request = CascadeRequest {
            prompt: prompt.to_string(),
            local_response: local_text.clone(),
            local_confidence: confidence,
            reason,
            disabled_sources: if self.assist_enabled {
                Vec::new()
            } else {
                vec!["claude".to_string()]
            },
        };

        match self.orchestrator.cascade(&request).await {
            CascadeOutcome::Answered {
                source,
                text,
                confidence: cascade_confidence,
                attempts: cascade_attempts,
            } => {
                self.metrics.record_fallback(true);
                attempts.extend(convert_attempts(cascade_attempts));
                out.push(format!("✓ {source} answered (confidence {cascade_confidence:.2})"));
                ResolvedAnswer {
                    display_text: text.clone(),
                    stored_text: text.clone(),
                    final_text: text,
                    source,
                    confidence: cascade_confidence,
                    attempts,
                    used_fallback: true,
                    used_llm: true,
                }
            }
            CascadeOutcome::Exhausted { attempts: cascade_attempts } => {
                self.metrics.record_fallback(false);
                attempts.extend(convert_attempts(cascade_attempts));
                out.push(exhausted_banner(confidence, self.assist_enabled, classification));

                let display = if local_text.trim().is_empty() {
                    "No reliable answer is available for this query right now.".to_string()
                } else {
                    format!("Meridian (uncertain):\n{local_text}")
                };
                let stored = format!(
                    "⚠ UNCERTAIN RESPONSE (confidence: {confidence:.2}):\n{local_text}"
                );
                ResolvedAnswer {
                    display_text: display,
                    stored_text: stored,
                    final_text: local_text,
                    source: "local".to_string(),
                    confidence,
                    attempts,
                    used_fallback: true,
                    used_llm: true,
                }
            }
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    fn generation_params(&self, prompt: &str) -> GenerationParams {
        let llm = &self.config.llm;
        let mut params = GenerationParams {
            max_tokens: llm.max_tokens,
            threads: llm.threads,
            temperature: llm.temperature,
            top_p: llm.top_p,
            top_k: llm.top_k,
            context_size: llm.context_size,
            repeat_penalty: llm.repeat_penalty,
            ..GenerationParams::default()
        };

        // The response template bounds generation: line-capped styles get a
        // matching token budget, open-ended ones get room to elaborate.
        let template = self.response_template(prompt);
        params.max_tokens = match template.max_lines {
            Some(lines) => params.max_tokens.min(lines * 20),
            None => params.max_tokens.max(400),
        };
        params
    }

    /// The formatting template for a prompt, honoring persisted tone and
    /// verbosity preferences.
    fn response_template(&self, prompt: &str) -> tone::ResponseTemplate {
        let tone_pref = self.memory.preference("tone").map(str::to_string);
        let verbosity_pref = self.memory.preference("verbosity").map(str::to_string);
        let (detected_tone, _) = tone::detect_tone(prompt, tone_pref.as_deref());
        let verbosity = tone::detect_verbosity(prompt, verbosity_pref.as_deref());
        tone::template(detected_tone, verbosity)
    }

    /// Compose the full model prompt: a short system instruction, the tone
    /// modifier, and only the last exchange for continuity.
    fn build_prompt(&self, prompt: &str) -> String {
        let instruction = "You are Meridian, a helpful AI assistant. Answer the user's question \
                           directly and concisely.\n\
                           Rules:\n\
                           1. Answer the user's CURRENT question only\n\
                           2. Be brief and action-oriented\n\
                           3. For math problems: state the final answer clearly\n\
                           4. For code: write clean, working code\n\
                           5. Do NOT include file paths, tool commands, or placeholder text\n\
                           6. Do NOT generate example Q&A pairs";

        let tone_pref = self.memory.preference("tone").map(str::to_string);
        let verbosity_pref = self.memory.preference("verbosity").map(str::to_string);
        let (detected_tone, _) = tone::detect_tone(prompt, tone_pref.as_deref());
        let verbosity = tone::detect_verbosity(prompt, verbosity_pref.as_deref());
        let mut modifier = tone::prompt_modifier(detected_tone, verbosity).to_string();

        // Template-level constraints the style modifier alone doesn't carry.
        let template = tone::template(detected_tone, verbosity);
        if !template.include_code {
            modifier.push_str(" Do not include code blocks.");
        }
        if let Some(lines) = template.max_lines {
            modifier.push_str(&format!(" Keep the answer under {lines} lines."));
        }

        let context = self.memory.context_string(1);
        if context.is_empty() {
            format!("[INST] {instruction}\n{modifier}\n\nQuestion: {prompt} [/INST]")
        } else {
            format!(
                "[INST] {instruction}\n{modifier}\n\nLast exchange:\n{context}\n\n\
                 Current question: {prompt} [/INST]"
            )
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_interaction(
        &mut self,
        question_id: &str,
        prompt: &str,
        final_text: &str,
        source: &str,
        confidence: f64,
        kind: &str,
        time_sensitive: bool,
        used_fallback: bool,
        attempts: Vec<AttemptRecord>,
        steps: Vec<ReasoningStep>,
    ) {
        let reasoning = steps
            .iter()
            .map(|step| ReasoningStepRecord {
                n: step.n,
                description: step.description.clone(),
            })
            .collect();

        let session_id = self.memory.metadata().session_id.clone();
        self.memory.record(Interaction {
            question_id: question_id.to_string(),
            session_id,
            prompt: prompt.to_string(),
            final_text: final_text.to_string(),
            source: source.to_string(),
            confidence,
            kind: kind.to_string(),
            time_sensitive,
            used_fallback,
            attempts,
            reasoning,
            feedback: None,
            timestamp: Utc::now(),
        });
    }
}

/// Answer resolution result threaded back into the pipeline tail.
struct ResolvedAnswer {
    /// What the user sees (may carry an uncertainty framing).
    display_text: String,
    /// What is persisted (tagged when uncertain).
    stored_text: String,
    /// The bare answer text used for validation.
    final_text: String,
    source: String,
    confidence: f64,
    attempts: Vec<AttemptRecord>,
    used_fallback: bool,
    used_llm: bool,
}

fn fresh_question_id(counter: &mut u64) -> String {
    *counter += 1;
    format!("q{counter}")
}

fn convert_attempts(attempts: Vec<meridian_assist::Attempt>) -> Vec<AttemptRecord> {
    attempts
        .into_iter()
        .map(|a| AttemptRecord {
            source: a.source,
            ok: a.ok,
            confidence: a.confidence,
            latency_ms: a.latency_ms,
            error: a.error,
        })
        .collect()
}

fn strip_prefix_ci<'a>(input: &'a str, prefix: &str) -> Option<&'a str> {
    let head = input.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &input[prefix.len()..])
}

/// Parse `#correct`/`#incorrect` with an optional ` - ` or ` — ` note.
fn split_feedback_note(input: &str) -> (&str, Option<String>) {
    let (head, note) = if let Some((head, note)) = input.split_once(" — ") {
        (head, Some(note))
    } else if let Some((head, note)) = input.split_once(" - ") {
        (head, Some(note))
    } else {
        (input, None)
    };
    (
        head.trim(),
        note.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()),
    )
}

fn exhausted_banner(confidence: f64, assist_enabled: bool, classification: &Classification) -> String {
    let mut lines = vec![
        "⚠ Unable to verify this answer with any external source.".to_string(),
        format!("Confidence score: {confidence:.2} (below the fallback threshold)"),
        "Suggestions:".to_string(),
        "  1. Try a simpler version of your request".to_string(),
        "  2. Break the task into smaller steps".to_string(),
        "  3. Use direct commands where possible (ls, git, find, grep)".to_string(),
    ];
    if !assist_enabled {
        lines.push("  4. Enable the hosted assistant fallback with #assist".to_string());
    }
    if classification.kind == QueryKind::WebResearch {
        lines.push("  5. Check your network connection for web search".to_string());
    }
    lines.join("\n")
}

fn help_text() -> String {
    "Commands:\n\
     #exit            - Exit\n\
     #reset           - Clear conversation memory\n\
     #help            - Show this message\n\
     #stats           - Session memory statistics\n\
     #pwd             - Current directory\n\
     #bridge          - Start the local execution bridge\n\
     #assist          - Toggle the hosted-assistant fallback\n\
     #assist-stats    - Fallback statistics\n\
     #performance     - Performance metrics and device profile\n\
     #correct [- note]   - Mark last response correct\n\
     #incorrect [- note] - Mark last response incorrect\n\
     #reset_metrics   - Reset performance metrics\n\
     #memory          - Memory summary\n\
     #prune_memory    - Trigger memory pruning\n\
     #export_memory   - Export a memory backup\n\
     #export_learning - Export learning events for training\n\
     #feedback        - Feedback and learning summary\n\
     #context         - Session and long-term context\n\
     #tone X          - technical | conversational | advisory | concise\n\
     #verbosity X     - short | medium | long\n\
     \n\
     Prefixes:\n\
     search web: ...      - Force web search\n\
     ask claude: ...      - Force the hosted assistant\n\
     ask perplexity: ...  - Force the research CLI"
        .to_string()
}

// ── Tests ────────────────────────────────────────────────────────────────────
