//! FEP Pipeline - the staged request path
//!
//! RECEIVE → PARSE → DUPLICATE_CHECK → SECURITY_CHECK → VALIDATION →
//! ROUTING → PROCESSING → RESPONSE → AUDIT → COMPLETE. Handlers in one
//! stage run in registration order; a handler may short-circuit the rest
//! of the pipeline, and an error synthesizes a decline with the mapped
//! response code. AUDIT runs in every outcome.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use fep_router::RoutingDecision;
use fep_types::{FepError, Result, TransactionRequest, TransactionResponse};

/// Pipeline stages in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Receive,
    Parse,
    DuplicateCheck,
    SecurityCheck,
    Validation,
    Routing,
    Processing,
    Response,
    Audit,
    Complete,
}

impl Stage {
    /// All stages in declared order
    pub const ALL: [Stage; 10] = [
        Stage::Receive,
        Stage::Parse,
        Stage::DuplicateCheck,
        Stage::SecurityCheck,
        Stage::Validation,
        Stage::Routing,
        Stage::Processing,
        Stage::Response,
        Stage::Audit,
        Stage::Complete,
    ];
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Receive => "RECEIVE",
            Self::Parse => "PARSE",
            Self::DuplicateCheck => "DUPLICATE_CHECK",
            Self::SecurityCheck => "SECURITY_CHECK",
            Self::Validation => "VALIDATION",
            Self::Routing => "ROUTING",
            Self::Processing => "PROCESSING",
            Self::Response => "RESPONSE",
            Self::Audit => "AUDIT",
            Self::Complete => "COMPLETE",
        };
        f.write_str(s)
    }
}

/// Everything one request carries through the pipeline
pub struct PipelineContext {
    pub request: TransactionRequest,
    pub response: Option<TransactionResponse>,
    pub routing: Option<RoutingDecision>,
    /// Free-form handler state
    pub attributes: HashMap<String, serde_json::Value>,
    /// Cleared by a handler to short-circuit to AUDIT
    pub continue_processing: bool,
    /// The error that terminated processing, when one did
    pub error: Option<FepError>,
    started_at: Instant,
    stage_timings: Vec<(Stage, Duration)>,
}

impl PipelineContext {
    pub fn new(request: TransactionRequest) -> Self {
        Self {
            request,
            response: None,
            routing: None,
            attributes: HashMap::new(),
            continue_processing: true,
            error: None,
            started_at: Instant::now(),
            stage_timings: Vec::new(),
        }
    }

    /// Total time since the context was created
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Per-stage timings recorded so far
    pub fn stage_timings(&self) -> &[(Stage, Duration)] {
        &self.stage_timings
    }

    /// Whether the pipeline produced an approval
    pub fn is_approved(&self) -> bool {
        self.response.as_ref().is_some_and(|r| r.is_approved())
    }
}

/// One unit of work within a stage
#[async_trait]
pub trait PipelineHandler: Send + Sync {
    /// Handler name for logs and timing
    fn name(&self) -> &str;

    /// Mutate the context; set `continue_processing = false` to
    /// short-circuit, or return an error to terminate with a mapped
    /// decline.
    async fn handle(&self, ctx: &mut PipelineContext) -> Result<()>;
}

/// Side-effect-only observer. Implementations must not block the
/// pipeline meaningfully.
#[async_trait]
pub trait PipelineListener: Send + Sync {
    async fn on_pipeline_start(&self, _ctx: &PipelineContext) {}
    async fn on_stage_start(&self, _stage: Stage, _ctx: &PipelineContext) {}
    async fn on_stage_end(&self, _stage: Stage, _ctx: &PipelineContext, _elapsed: Duration) {}
    async fn on_pipeline_complete(&self, _ctx: &PipelineContext) {}
    async fn on_pipeline_error(&self, _ctx: &PipelineContext, _error: &FepError) {}
}

/// The ordered stage runner
#[derive(Default)]
pub struct Pipeline {
    handlers: BTreeMap<Stage, Vec<Arc<dyn PipelineHandler>>>,
    listeners: Vec<Arc<dyn PipelineListener>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler at a stage; handlers run in registration order
    pub fn register(mut self, stage: Stage, handler: Arc<dyn PipelineHandler>) -> Self {
        self.handlers.entry(stage).or_default().push(handler);
        self
    }

    /// Attach a listener
    pub fn listen(mut self, listener: Arc<dyn PipelineListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Run a request through every stage. Errors are captured, mapped to
    /// a declined response, and AUDIT still runs.
    pub async fn execute(&self, request: TransactionRequest) -> PipelineContext {
        let mut ctx = PipelineContext::new(request);
        for listener in &self.listeners {
            listener.on_pipeline_start(&ctx).await;
        }

        for stage in Stage::ALL {
            let skip = (!ctx.continue_processing || ctx.error.is_some())
                && !matches!(stage, Stage::Audit | Stage::Complete);
            if skip {
                continue;
            }
            let stage_started = Instant::now();
            for listener in &self.listeners {
                listener.on_stage_start(stage, &ctx).await;
            }

            if let Some(handlers) = self.handlers.get(&stage) {
                for handler in handlers {
                    match handler.handle(&mut ctx).await {
                        Ok(()) => {}
                        Err(error) => {
                            warn!(
                                stage = %stage,
                                handler = handler.name(),
                                error = %error,
                                "pipeline handler failed"
                            );
                            self.fail(&mut ctx, error).await;
                            break;
                        }
                    }
                    if !ctx.continue_processing {
                        debug!(stage = %stage, handler = handler.name(), "short-circuit");
                        break;
                    }
                }
            }

            let elapsed = stage_started.elapsed();
            ctx.stage_timings.push((stage, elapsed));
            for listener in &self.listeners {
                listener.on_stage_end(stage, &ctx, elapsed).await;
            }
        }

        if let Some(response) = ctx.response.as_mut() {
            response.processing_ms = ctx.started_at.elapsed().as_millis() as u64;
        }
        for listener in &self.listeners {
            listener.on_pipeline_complete(&ctx).await;
        }
        ctx
    }

    /// Record the error and synthesize the mapped decline
    async fn fail(&self, ctx: &mut PipelineContext, error: FepError) {
        if ctx.response.is_none() {
            ctx.response = Some(TransactionResponse::declined(
                &ctx.request,
                error.response_code(),
            ));
        }
        for listener in &self.listeners {
            listener.on_pipeline_error(ctx, &error).await;
        }
        ctx.error = Some(error);
    }
}
