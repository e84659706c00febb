//! PostProcessPipeline — ordered text-refinement stages with a latency budget (§4.5).

pub mod chat_provider;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::config::StageConfig;
use crate::error::Result;
use crate::session::SurfaceClass;

/// Per-call context a provider needs beyond the text itself (§3).
pub struct PostProcessContext {
    pub target_surface: SurfaceClass,
    pub language: Option<String>,
    pub confidence: Option<f32>,
    pub audio_duration_s: f64,
    pub previous_text: Option<String>,
}

impl PostProcessContext {
    pub fn new(
        target_surface: SurfaceClass,
        language: Option<String>,
        confidence: Option<f32>,
        audio_duration_s: f64,
        previous_text: Option<String>,
    ) -> Self {
        Self {
            target_surface,
            language,
            confidence,
            audio_duration_s,
            previous_text,
        }
    }

    /// Convenience constructor for call sites (and tests) that only care
    /// about the surface and language.
    pub fn from_surface(surface: SurfaceClass, language: Option<String>) -> Self {
        Self::new(surface, language, None, 0.0, None)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.target_surface, SurfaceClass::Terminal)
    }
}

/// One refinement stage. Stateful providers (HTTP clients, local models)
/// implement this directly; `refine` returns the refined text and the
/// provider's own measured latency.
pub trait PostProcessProvider: Send + 'static {
    fn tag(&self) -> &str;
    fn refine(&mut self, text: &str, ctx: &PostProcessContext) -> Result<(String, Duration)>;
}

/// Per-stage soft target for the default provider (§4.5); exceeding it does
/// not abort the stage, only raises a metrics alert.
pub const DEFAULT_STAGE_SOFT_TARGET_MS: u64 = 250;

#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub name: String,
    pub provider_tag: String,
    pub succeeded: bool,
    pub latency_ms: u64,
    pub over_soft_target: bool,
}

pub struct PostProcessResult {
    pub text: String,
    pub processed: bool,
    pub stages: Vec<StageOutcome>,
    pub budget_exceeded: bool,
}

/// Runs the configured stages in order against a registry of providers.
/// Idempotent when disabled or given an empty stage list: returns the input
/// text unchanged with `processed = false` (§8).
pub struct PostProcessPipeline {
    enabled: bool,
    stages: Vec<StageConfig>,
    continue_on_error: bool,
    total_budget: Duration,
    providers: HashMap<String, Box<dyn PostProcessProvider>>,
}

impl PostProcessPipeline {
    pub fn new(
        enabled: bool,
        stages: Vec<StageConfig>,
        continue_on_error: bool,
        total_budget_ms: u64,
    ) -> Self {
        Self {
            enabled,
            stages,
            continue_on_error,
            total_budget: Duration::from_millis(total_budget_ms.max(1)),
            providers: HashMap::new(),
        }
    }

    pub fn register_provider(&mut self, tag: impl Into<String>, provider: Box<dyn PostProcessProvider>) {
        self.providers.insert(tag.into(), provider);
    }

    pub fn run(&mut self, input: &str, ctx: &PostProcessContext) -> PostProcessResult {
        if !self.enabled || self.stages.is_empty() {
            return PostProcessResult {
                text: input.to_string(),
                processed: false,
                stages: Vec::new(),
                budget_exceeded: false,
            };
        }

        let started = Instant::now();
        let mut text = input.to_string();
        let mut outcomes = Vec::new();
        let mut budget_exceeded = false;

        for stage in self.stages.iter().filter(|s| s.enabled) {
            if started.elapsed() >= self.total_budget {
                budget_exceeded = true;
                warn!(
                    session_stage = stage.name.as_str(),
                    "post_budget_exceeded: remaining stages skipped"
                );
                break;
            }

            let Some(provider) = self.providers.get_mut(&stage.provider_tag) else {
                warn!(
                    provider_tag = stage.provider_tag.as_str(),
                    "no provider registered for stage; skipping"
                );
                continue;
            };

            let stage_started = Instant::now();
            match provider.refine(&text, ctx) {
                Ok((refined, provider_latency)) => {
                    let latency_ms = stage_started.elapsed().as_millis() as u64;
                    let over_soft_target = provider_latency.as_millis() as u64 > DEFAULT_STAGE_SOFT_TARGET_MS;
                    if over_soft_target {
                        warn!(
                            stage = stage.name.as_str(),
                            latency_ms,
                            threshold_ms = DEFAULT_STAGE_SOFT_TARGET_MS,
                            "post-process stage exceeded soft target"
                        );
                    }
                    text = refined;
                    outcomes.push(StageOutcome {
                        name: stage.name.clone(),
                        provider_tag: stage.provider_tag.clone(),
                        succeeded: true,
                        latency_ms,
                        over_soft_target,
                    });
                }
                Err(e) => {
                    let latency_ms = stage_started.elapsed().as_millis() as u64;
                    warn!(stage = stage.name.as_str(), error = %e, "post-process stage failed");
                    outcomes.push(StageOutcome {
                        name: stage.name.clone(),
                        provider_tag: stage.provider_tag.clone(),
                        succeeded: false,
                        latency_ms,
                        over_soft_target: false,
                    });
                    if !self.continue_on_error {
                        break;
                    }
                }
            }
        }

        PostProcessResult {
            text,
            processed: !outcomes.is_empty(),
            stages: outcomes,
            budget_exceeded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct UppercaseProvider;
    impl PostProcessProvider for UppercaseProvider {
        fn tag(&self) -> &str {
            "uppercase"
        }
        fn refine(&mut self, text: &str, _ctx: &PostProcessContext) -> Result<(String, Duration)> {
            Ok((text.to_uppercase(), Duration::from_millis(1)))
        }
    }

    struct SlowProvider(Duration);
    impl PostProcessProvider for SlowProvider {
        fn tag(&self) -> &str {
            "slow"
        }
        fn refine(&mut self, text: &str, _ctx: &PostProcessContext) -> Result<(String, Duration)> {
            std::thread::sleep(self.0);
            Ok((text.to_string(), self.0))
        }
    }

    struct FailingProvider;
    impl PostProcessProvider for FailingProvider {
        fn tag(&self) -> &str {
            "failing"
        }
        fn refine(&mut self, _text: &str, _ctx: &PostProcessContext) -> Result<(String, Duration)> {
            Err(crate::error::DictationError::Internal("boom".into()))
        }
    }

    fn ctx() -> PostProcessContext {
        PostProcessContext::from_surface(SurfaceClass::Default, None)
    }

    #[test]
    fn disabled_pipeline_is_idempotent() {
        let mut pipeline = PostProcessPipeline::new(false, Vec::new(), true, 1000);
        let result = pipeline.run("hello", &ctx());
        assert_eq!(result.text, "hello");
        assert!(!result.processed);
    }

    #[test]
    fn empty_stage_list_is_idempotent() {
        let mut pipeline = PostProcessPipeline::new(true, Vec::new(), true, 1000);
        let result = pipeline.run("hello", &ctx());
        assert_eq!(result.text, "hello");
        assert!(!result.processed);
    }

    #[test]
    fn single_stage_refines_text() {
        let mut pipeline = PostProcessPipeline::new(
            true,
            vec![StageConfig {
                name: "case".into(),
                provider_tag: "uppercase".into(),
                enabled: true,
            }],
            true,
            1000,
        );
        pipeline.register_provider("uppercase", Box::new(UppercaseProvider));
        let result = pipeline.run("hello", &ctx());
        assert_eq!(result.text, "HELLO");
        assert!(result.processed);
    }

    #[test]
    fn failed_stage_preserves_previous_text_when_continue_on_error() {
        let mut pipeline = PostProcessPipeline::new(
            true,
            vec![
                StageConfig {
                    name: "case".into(),
                    provider_tag: "uppercase".into(),
                    enabled: true,
                },
                StageConfig {
                    name: "broken".into(),
                    provider_tag: "failing".into(),
                    enabled: true,
                },
            ],
            true,
            1000,
        );
        pipeline.register_provider("uppercase", Box::new(UppercaseProvider));
        pipeline.register_provider("failing", Box::new(FailingProvider));
        let result = pipeline.run("hello", &ctx());
        assert_eq!(result.text, "HELLO");
        assert_eq!(result.stages.len(), 2);
        assert!(!result.stages[1].succeeded);
    }

    #[test]
    fn budget_overrun_skips_remaining_stages() {
        let mut pipeline = PostProcessPipeline::new(
            true,
            vec![
                StageConfig {
                    name: "slow".into(),
                    provider_tag: "slow".into(),
                    enabled: true,
                },
                StageConfig {
                    name: "case".into(),
                    provider_tag: "uppercase".into(),
                    enabled: true,
                },
            ],
            true,
            20,
        );
        pipeline.register_provider("slow", Box::new(SlowProvider(Duration::from_millis(40))));
        pipeline.register_provider("uppercase", Box::new(UppercaseProvider));
        let result = pipeline.run("hello", &ctx());
        assert_eq!(result.stages.len(), 1);
        assert!(result.budget_exceeded);
        assert_eq!(result.text, "hello");
    }

    #[test]
    fn disabled_stage_is_skipped() {
        let mut pipeline = PostProcessPipeline::new(
            true,
            vec![StageConfig {
                name: "case".into(),
                provider_tag: "uppercase".into(),
                enabled: false,
            }],
            true,
            1000,
        );
        pipeline.register_provider("uppercase", Box::new(UppercaseProvider));
        let result = pipeline.run("hello", &ctx());
        assert_eq!(result.text, "hello");
        assert!(!result.processed);
    }
}
