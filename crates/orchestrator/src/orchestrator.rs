//! The OTAE task driver.
//!
//! A [`TaskOrchestrator`] runs one task at a time through Observe, Think, Act
//! and Evaluate. It owns the per-step and total deadlines, the per-task retry
//! ceiling and the repair loop, and fans every status change out to progress
//! subscribers, the event bus and the optional state store.
//!
//! Several orchestrators may share one [`CircuitBreaker`] and one
//! [`ResultCache`]; nothing else is shared between tasks.

use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;

use chrono::Utc;
use events::{Event, EventBus};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use sheetflow_core::{
    codes, materialize_datasets, DataFile, Datasets, ErrorCategory, EvaluationResult,
    ExecutionPlan, ExecutionSummary, FilePreview, LogEntry, LogLevel, NextAction, OutputData,
    PlanStepStatus, QualityMetrics, QualityReport, RepairStrategy, ResultMetadata, StrategyKind,
    Task, TaskError, TaskResult, TaskStatus,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::ResultCache;
use crate::circuit_breaker::{BreakerState, CircuitBreaker};
use crate::collaborators::{ExecutionSandbox, ReasoningService};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::phases::{
    evaluate, observe, AccuracyScorer, ActRequest, ActRunner, ConstantAccuracy, Observation,
    PhaseFailure, RetryCeiling, StepGuard, Thinker,
};
use crate::repair::{RepairAction, RepairContext, RepairEngine, RepairResult};
use crate::state_machine::TaskStateMachine;
use crate::state_store::{ExecutionState, StateStore};

pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Invoked synchronously with a task snapshot after every status change.
pub type ProgressCallback =
    Box<dyn Fn(&Task) -> std::result::Result<(), CallbackError> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorStatistics {
    pub session_id: Uuid,
    pub tasks_run: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub average_execution_time_ms: u64,
    pub current_status: Option<TaskStatus>,
    pub breaker_state: BreakerState,
}

#[derive(Debug, Default)]
struct StatsInner {
    tasks_run: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    total_time_ms: u64,
}

/// Why the driver stopped short of a normal completion.
#[derive(Debug)]
enum Halt {
    Cancelled,
    Failed(TaskError),
    CeilingReached(TaskError),
    Internal(OrchestratorError),
}

type Flow<T> = std::result::Result<T, Halt>;

struct Completion {
    output: OutputData,
    evaluation: EvaluationResult,
    success: bool,
}

enum Remedy {
    /// Act again, optionally with a hint for code generation.
    Rerun(Option<String>),
    /// Evaluate this output instead of acting again.
    Cached(OutputData),
}

struct ActiveTask {
    task: Mutex<Task>,
    plan: Mutex<Option<ExecutionPlan>>,
    cycle: AtomicU32,
    token: CancellationToken,
    log_start: usize,
    /// Strategies already applied to an Act failure, keyed by error and action.
    tried: Mutex<HashSet<String>>,
}

impl ActiveTask {
    fn new(task: Task, log_start: usize) -> Self {
        Self {
            task: Mutex::new(task),
            plan: Mutex::new(None),
            cycle: AtomicU32::new(0),
            token: CancellationToken::new(),
            log_start,
            tried: Mutex::new(HashSet::new()),
        }
    }

    fn update<R>(&self, f: impl FnOnce(&mut Task) -> R) -> R {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut task)
    }

    fn snapshot(&self) -> Task {
        self.update(|task| task.clone())
    }

    fn plan(&self) -> Option<ExecutionPlan> {
        self.plan
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_plan(&self, plan: ExecutionPlan) {
        *self.plan.lock().unwrap_or_else(PoisonError::into_inner) = Some(plan);
    }

    /// Marks `strategy` as tried for `error`; false if it already was.
    fn try_strategy(&self, error: &TaskError, strategy: &RepairStrategy) -> bool {
        self.tried
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(format!("{}:{}:{}", error.category, error.code, strategy.action))
    }

    fn mark_plan(&self, status: PlanStepStatus) {
        if let Some(plan) = self
            .plan
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            plan.mark_all(status);
        }
    }
}

/// Per-run inputs derived once from the task.
struct Run {
    config: OrchestratorConfig,
    user_input: String,
    files: Vec<DataFile>,
    previews: Vec<FilePreview>,
    datasets: Datasets,
    cache_key: Option<String>,
    guard: StepGuard,
}

/// Holds the orchestrator's running flag; clears it on drop, panics included.
struct RunGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct TaskOrchestrator {
    config: OrchestratorConfig,
    reasoning: Arc<dyn ReasoningService>,
    sandbox: Arc<dyn ExecutionSandbox>,
    breaker: Arc<CircuitBreaker>,
    cache: Arc<ResultCache>,
    repair: RepairEngine,
    accuracy: Arc<dyn AccuracyScorer>,
    state_store: Option<Arc<dyn StateStore>>,
    event_bus: Option<EventBus>,
    subscribers: RwLock<Vec<ProgressCallback>>,
    current: Mutex<Option<Arc<ActiveTask>>>,
    running: AtomicBool,
    logs: Mutex<Vec<LogEntry>>,
    stats: Mutex<StatsInner>,
    session_id: Uuid,
}

impl TaskOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        reasoning: Arc<dyn ReasoningService>,
        sandbox: Arc<dyn ExecutionSandbox>,
        breaker: Arc<CircuitBreaker>,
    ) -> Result<Self> {
        config.validate()?;
        let cache = Arc::new(ResultCache::new());

        Ok(Self {
            config,
            reasoning,
            sandbox,
            breaker,
            repair: RepairEngine::new(cache.clone()),
            cache,
            accuracy: Arc::new(ConstantAccuracy::default()),
            state_store: None,
            event_bus: None,
            subscribers: RwLock::new(Vec::new()),
            current: Mutex::new(None),
            running: AtomicBool::new(false),
            logs: Mutex::new(Vec::new()),
            stats: Mutex::new(StatsInner::default()),
            session_id: Uuid::new_v4(),
        })
    }

    pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn with_accuracy_scorer(mut self, scorer: Arc<dyn AccuracyScorer>) -> Self {
        self.accuracy = scorer;
        self
    }

    /// Shares a result cache with other orchestrators.
    pub fn with_cache(mut self, cache: Arc<ResultCache>) -> Self {
        self.repair = RepairEngine::new(cache.clone());
        self.cache = cache;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&Task) -> std::result::Result<(), CallbackError> + Send + Sync + 'static,
    {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(callback));
    }

    /// Current (or most recent) task.
    pub fn task_snapshot(&self) -> Option<Task> {
        self.active().map(|active| active.snapshot())
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.logs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear_logs(&self) {
        self.logs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn statistics(&self) -> OrchestratorStatistics {
        let stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        OrchestratorStatistics {
            session_id: self.session_id,
            tasks_run: stats.tasks_run,
            completed: stats.completed,
            failed: stats.failed,
            cancelled: stats.cancelled,
            average_execution_time_ms: stats.total_time_ms / stats.tasks_run.max(1),
            current_status: self.active().map(|active| active.update(|task| task.status)),
            breaker_state: self.breaker.state(),
        }
    }

    pub async fn execute_task(&self, prompt: &str, files: Vec<DataFile>) -> Result<TaskResult> {
        let config = self.config.clone();
        self.execute_task_with_config(prompt, files, &config).await
    }

    /// Runs one task to a terminal status.
    ///
    /// Graceful failures and cancellation come back as `Ok` with
    /// `success == false`. `Err` is reserved for rejected input, total
    /// timeout expiry, the retry ceiling and phase panics; in the last three
    /// cases the task is left `Failed`.
    pub async fn execute_task_with_config(
        &self,
        prompt: &str,
        files: Vec<DataFile>,
        config: &OrchestratorConfig,
    ) -> Result<TaskResult> {
        config.validate()?;
        if prompt.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "prompt must not be empty".to_string(),
            ));
        }
        if files.is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "at least one data file is required".to_string(),
            ));
        }
        let _running = RunGuard::acquire(&self.running).ok_or(OrchestratorError::TaskInProgress)?;

        let file_count = files.len();
        let task = Task::new(prompt.trim(), files, self.session_id);
        let task_id = task.id;
        let active = Arc::new(ActiveTask::new(task, self.log_count()));
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(active.clone());

        info!(task_id = %task_id, files = file_count, "Starting task");
        self.log(LogLevel::Info, format!("Task {task_id} created"));
        self.emit(Event::TaskCreated {
            task_id,
            prompt: prompt.trim().to_string(),
            file_count,
        });

        let started = Instant::now();
        let drive = AssertUnwindSafe(self.drive(&active, config)).catch_unwind();

        let result = match tokio::time::timeout(config.total_timeout(), drive).await {
            Ok(Ok(outcome)) => self.finish(&active, outcome).await,
            Ok(Err(payload)) => {
                active.token.cancel();
                let message = panic_message(payload.as_ref());
                let phase = active.update(|task| task.status.as_str().to_string());
                error!(task_id = %task_id, phase = %phase, message = %message, "Phase panicked");
                self.log(LogLevel::Error, format!("Phase {phase} panicked: {message}"));

                let failure = TaskError::new(
                    ErrorCategory::Unknown,
                    codes::PHASE_PANICKED,
                    format!("Phase {phase} panicked: {message}"),
                );
                self.settle(&active, TaskStatus::Failed, Some(failure));
                Err(OrchestratorError::PhasePanicked { phase, message })
            }
            Err(_) => {
                active.token.cancel();
                let duration_ms = config.total_timeout_ms;
                error!(task_id = %task_id, duration_ms, "Task exceeded total timeout");
                self.log(
                    LogLevel::Error,
                    format!("Task exceeded total timeout of {duration_ms}ms"),
                );

                let failure = TaskError::new(
                    ErrorCategory::Timeout,
                    codes::TOTAL_TIMEOUT,
                    format!("Task exceeded total timeout of {duration_ms}ms"),
                );
                self.settle(&active, TaskStatus::Failed, Some(failure));
                Err(OrchestratorError::TotalTimeout { duration_ms })
            }
        };

        self.wrap_up(&active, &result, started).await;
        result
    }

    /// Cancels the running task. A no-op, returning `false`, when there is no
    /// task or it already reached a terminal status.
    pub fn cancel(&self) -> bool {
        let Some(active) = self.active() else {
            debug!("No task to cancel");
            return false;
        };

        let change = active.update(|task| {
            if task.status.is_terminal() {
                return None;
            }
            let from = task.status;
            task.set_status(TaskStatus::Cancelled);
            Some((from, task.clone()))
        });
        let Some((from, snapshot)) = change else {
            debug!("Task already finished, cancel ignored");
            return false;
        };

        active.token.cancel();
        info!(task_id = %snapshot.id, from = %from, "Task cancelled");
        self.announce(from, &snapshot);
        true
    }

    async fn drive(&self, active: &ActiveTask, config: &OrchestratorConfig) -> Flow<Completion> {
        let run = self.prepare(active, config);
        let mut hint: Option<String> = None;

        loop {
            self.transition(active, TaskStatus::Observing).await?;
            let observation = self.observe_phase(active, &run)?;

            self.advance(active).await?;
            self.think_phase(active, &run, &observation).await?;

            self.advance(active).await?;
            loop {
                let cycle = active.cycle.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(cycle, "Starting act cycle");

                let (output, from_cache) = self
                    .act_with_repair(active, &run, hint.take(), &observation)
                    .await?;
                if !from_cache {
                    if let Some(key) = &run.cache_key {
                        self.cache.insert(key.clone(), output.clone());
                    }
                }

                self.transition(active, TaskStatus::Evaluating).await?;
                let evaluation = self.evaluate_phase(active, &run, &output);

                match evaluation.next_action {
                    NextAction::Complete => {
                        active.mark_plan(PlanStepStatus::Done);
                        self.advance(active).await?;
                        return Ok(Completion {
                            success: evaluation.passed,
                            output,
                            evaluation,
                        });
                    }
                    NextAction::Continue | NextAction::Retry => {
                        if cycle >= config.max_cycles {
                            self.log(
                                LogLevel::Warn,
                                format!(
                                    "Cycle limit of {} reached with quality {:.2}",
                                    config.max_cycles, evaluation.quality_score
                                ),
                            );
                            self.transition(active, TaskStatus::Completed).await?;
                            return Ok(Completion {
                                success: false,
                                output,
                                evaluation,
                            });
                        }
                        hint = Some(improvement_hint(&evaluation));
                        self.transition(active, TaskStatus::Acting).await?;
                    }
                    NextAction::Repair => {
                        let failure = quality_error(&evaluation, config.quality_threshold);
                        active.update(|task| task.record_error(failure.clone()));
                        if !config.enable_auto_repair || cycle >= config.max_cycles {
                            active.mark_plan(PlanStepStatus::Failed);
                            return Err(Halt::Failed(failure));
                        }
                        hint = self.restart_hint(active, &run, &failure, &observation)?;
                        break;
                    }
                    NextAction::Fail => {
                        active.mark_plan(PlanStepStatus::Failed);
                        return Err(Halt::Failed(quality_error(
                            &evaluation,
                            config.quality_threshold,
                        )));
                    }
                }
            }

            info!(task_id = %active.update(|task| task.id), "Restarting from observation");
        }
    }

    fn prepare(&self, active: &ActiveTask, config: &OrchestratorConfig) -> Run {
        let (user_input, files) = active.update(|task| {
            (
                task.context.user_input().to_string(),
                task.context.data_files().to_vec(),
            )
        });
        let previews: Vec<FilePreview> = files.iter().filter_map(DataFile::preview).collect();
        let mut datasets = materialize_datasets(&files);
        datasets.retain(|name, _| previews.iter().any(|preview| &preview.file_name == name));
        let cache_key = config
            .enable_caching
            .then(|| ResultCache::fingerprint(&user_input, &files));

        Run {
            config: config.clone(),
            user_input,
            files,
            previews,
            datasets,
            cache_key,
            guard: StepGuard::new(config.timeout_per_step(), active.token.clone()),
        }
    }

    fn observe_phase(&self, active: &ActiveTask, run: &Run) -> Flow<Observation> {
        let index = active.update(|task| task.begin_step(TaskStatus::Observing));
        let result = observe(&run.files);

        active.update(|task| {
            if let Some(step) = task.step_mut(index) {
                match &result {
                    Ok(_) => step.complete(),
                    Err(error) => step.fail(error.clone()),
                }
            }
            if let Err(error) = &result {
                task.record_error(error.clone());
            }
        });

        match result {
            Ok(observation) => {
                for warning in &observation.warnings {
                    self.log(LogLevel::Warn, warning.clone());
                }
                self.log(
                    LogLevel::Info,
                    format!(
                        "Observed {} sheets with {} rows",
                        observation.sheets.len(),
                        observation.total_rows
                    ),
                );
                Ok(observation)
            }
            Err(error) => {
                self.log(LogLevel::Error, format!("Observation failed: {error}"));
                Err(Halt::Failed(error))
            }
        }
    }

    async fn think_phase(
        &self,
        active: &ActiveTask,
        run: &Run,
        observation: &Observation,
    ) -> Flow<()> {
        let index = active.update(|task| task.begin_step(TaskStatus::Thinking));
        let thinker = Thinker {
            reasoning: self.reasoning.as_ref(),
            breaker: &self.breaker,
            guard: &run.guard,
            max_attempts: run.config.max_retries,
        };

        match thinker.run(&run.user_input, observation, &run.previews).await {
            Ok(outcome) => {
                active.update(|task| {
                    if let Some(step) = task.step_mut(index) {
                        step.retries = outcome.retries;
                        step.complete();
                    }
                });
                if let Some(reason) = &outcome.fallback_reason {
                    self.log(
                        LogLevel::Warn,
                        format!("Using basic processing plan: {reason}"),
                    );
                }
                self.log(
                    LogLevel::Info,
                    format!(
                        "Plan ready with {} steps (confidence {:.2})",
                        outcome.plan.steps.len(),
                        outcome.confidence
                    ),
                );
                active.set_plan(outcome.plan);
                Ok(())
            }
            Err(failure) => {
                let (halt, error) = match failure {
                    PhaseFailure::Cancelled => (Halt::Cancelled, cancelled_error()),
                    PhaseFailure::Error(error) => (Halt::Failed(error.clone()), error),
                };
                active.update(|task| {
                    if let Some(step) = task.step_mut(index) {
                        step.fail(error);
                    }
                });
                Err(halt)
            }
        }
    }

    /// Acts until an output is produced, repairing between failed attempts.
    /// The flag is set when the output came from the cache.
    async fn act_with_repair(
        &self,
        active: &ActiveTask,
        run: &Run,
        hint: Option<String>,
        observation: &Observation,
    ) -> Flow<(OutputData, bool)> {
        let mut hint = hint;

        loop {
            let error = match self.act_phase(active, run, hint.as_deref()).await {
                Ok(output) => return Ok((output, false)),
                Err(PhaseFailure::Cancelled) => return Err(Halt::Cancelled),
                Err(PhaseFailure::Error(error)) => error,
            };

            if error.is(codes::MAX_RETRIES_EXCEEDED) {
                return Err(Halt::CeilingReached(error));
            }
            if !run.config.enable_auto_repair {
                return Err(Halt::Failed(error));
            }

            match self.repair_phase(active, run, &error, observation).await? {
                Remedy::Rerun(next) => hint = next,
                Remedy::Cached(output) => return Ok((output, true)),
            }
        }
    }

    async fn act_phase(
        &self,
        active: &ActiveTask,
        run: &Run,
        hint: Option<&str>,
    ) -> std::result::Result<OutputData, PhaseFailure> {
        let (index, mut ceiling) = active.update(|task| {
            task.context.history.attempts += 1;
            (
                task.begin_step(TaskStatus::Acting),
                RetryCeiling::new(
                    task.context.history.act_failures,
                    run.config.max_global_retries,
                ),
            )
        });
        let plan = active.plan().unwrap_or_else(ExecutionPlan::basic_processing);

        let runner = ActRunner {
            reasoning: self.reasoning.as_ref(),
            sandbox: self.sandbox.as_ref(),
            breaker: &self.breaker,
            guard: &run.guard,
        };
        let request = ActRequest {
            user_input: &run.user_input,
            plan: &plan,
            previews: &run.previews,
            datasets: &run.datasets,
            hint,
        };
        let outcome = runner.run(&request, &mut ceiling).await;

        active.update(|task| {
            task.context.history.act_failures = ceiling.used;
            if let Some(step) = task.step_mut(index) {
                match &outcome {
                    Ok(_) => step.complete(),
                    Err(PhaseFailure::Error(error)) => step.fail(error.clone()),
                    Err(PhaseFailure::Cancelled) => step.fail(cancelled_error()),
                }
            }
            if let Err(PhaseFailure::Error(error)) = &outcome {
                task.record_error(error.clone());
            }
        });

        match outcome {
            Ok(outcome) => {
                self.log(
                    LogLevel::Info,
                    format!(
                        "Act produced {} outputs in {}ms",
                        outcome.output.len(),
                        outcome.duration_ms
                    ),
                );
                Ok(outcome.output)
            }
            Err(PhaseFailure::Error(error)) => {
                self.log(LogLevel::Error, format!("Act failed: {error}"));
                Err(PhaseFailure::Error(error))
            }
            Err(PhaseFailure::Cancelled) => Err(PhaseFailure::Cancelled),
        }
    }

    /// Applies strategies for `error` in priority order until one yields an
    /// action. Every application counts against `max_retries` for the task.
    /// A strategy already tried on the same error is skipped, so a persistent
    /// failure walks down the ranking instead of repeating the top entry.
    /// Plain retries stay available until the budget or the ceiling runs out.
    async fn repair_phase(
        &self,
        active: &ActiveTask,
        run: &Run,
        error: &TaskError,
        observation: &Observation,
    ) -> Flow<Remedy> {
        self.transition(active, TaskStatus::Repairing).await?;

        for strategy in self.repair.analyze(error) {
            if !matches!(
                strategy.kind,
                StrategyKind::Retry | StrategyKind::UserIntervention
            ) && !active.try_strategy(error, &strategy)
            {
                debug!(action = %strategy.action, "Strategy already tried, skipping");
                continue;
            }
            let Some(context) = self.repair_context(active, run, observation) else {
                return Err(Halt::Failed(error.clone()));
            };
            let result = self.repair.apply(&strategy, error, &context);
            self.record_repair(active, &result);

            match result.action {
                Some(RepairAction::RerunAct { hint }) => {
                    self.transition(active, TaskStatus::Acting).await?;
                    return Ok(Remedy::Rerun(Some(hint)));
                }
                Some(RepairAction::ManualRetryRequired) => {
                    self.transition(active, TaskStatus::Acting).await?;
                    return Ok(Remedy::Rerun(None));
                }
                Some(RepairAction::UseCachedOutput { output }) => {
                    return Ok(Remedy::Cached(output));
                }
                Some(RepairAction::Abort) => return Err(Halt::Failed(error.clone())),
                None => continue,
            }
        }

        Err(Halt::Failed(error.clone()))
    }

    /// Hint for a restart from observation after a low-quality result.
    fn restart_hint(
        &self,
        active: &ActiveTask,
        run: &Run,
        error: &TaskError,
        observation: &Observation,
    ) -> Flow<Option<String>> {
        for strategy in self.repair.analyze(error) {
            let Some(context) = self.repair_context(active, run, observation) else {
                break;
            };
            let result = self.repair.apply(&strategy, error, &context);
            self.record_repair(active, &result);

            if !result.can_continue {
                break;
            }
            match result.action {
                Some(RepairAction::RerunAct { hint }) => return Ok(Some(hint)),
                Some(RepairAction::ManualRetryRequired | RepairAction::UseCachedOutput { .. }) => {
                    return Ok(None)
                }
                Some(RepairAction::Abort) => break,
                None => continue,
            }
        }

        active.mark_plan(PlanStepStatus::Failed);
        Err(Halt::Failed(error.clone()))
    }

    /// `None` once the task used up its repair budget.
    fn repair_context(
        &self,
        active: &ActiveTask,
        run: &Run,
        observation: &Observation,
    ) -> Option<RepairContext> {
        let applied = active.update(|task| task.context.history.repairs.len() as u32);
        if applied >= run.config.max_retries {
            warn!(
                applied,
                limit = run.config.max_retries,
                "Repair budget exhausted"
            );
            self.log(
                LogLevel::Warn,
                format!("Repair budget of {} attempts exhausted", run.config.max_retries),
            );
            return None;
        }

        Some(RepairContext {
            attempt_number: applied + 1,
            available_columns: observation.available_columns(),
            cache_key: run.cache_key.clone(),
        })
    }

    fn record_repair(&self, active: &ActiveTask, result: &RepairResult) {
        let task_id = active.update(|task| {
            let index = task.begin_step(TaskStatus::Repairing);
            if let Some(step) = task.step_mut(index) {
                match (result.success, result.remaining_errors.first()) {
                    (false, Some(error)) => step.fail(error.clone()),
                    _ => step.complete(),
                }
            }
            task.context
                .history
                .repairs
                .push(result.applied_strategy.clone());
            task.id
        });

        let strategy = &result.applied_strategy;
        info!(
            task_id = %task_id,
            strategy = %strategy.kind,
            action = %strategy.action,
            attempt = result.attempt_number,
            success = result.success,
            "Repair attempted"
        );
        self.log(
            if result.success {
                LogLevel::Info
            } else {
                LogLevel::Warn
            },
            format!(
                "Repair attempt {} with {} ({}): {}",
                result.attempt_number,
                strategy.kind,
                strategy.description,
                if result.success { "applied" } else { "not applicable" }
            ),
        );
        self.emit(Event::RepairAttempted {
            task_id,
            strategy: if strategy.action.is_empty() {
                strategy.kind.to_string()
            } else {
                strategy.action.clone()
            },
            attempt: result.attempt_number,
            success: result.success,
        });
    }

    fn evaluate_phase(&self, active: &ActiveTask, run: &Run, output: &OutputData) -> EvaluationResult {
        let (index, context) =
            active.update(|task| (task.begin_step(TaskStatus::Evaluating), task.context.clone()));
        let evaluation = evaluate(
            output,
            &context,
            self.accuracy.as_ref(),
            run.config.quality_threshold,
        );

        active.update(|task| {
            if let Some(step) = task.step_mut(index) {
                match evaluation.next_action {
                    NextAction::Repair | NextAction::Fail => {
                        step.fail(quality_error(&evaluation, run.config.quality_threshold))
                    }
                    _ => step.complete(),
                }
            }
        });

        self.log(
            LogLevel::Info,
            format!(
                "Quality {:.2} (completeness {:.2}, accuracy {:.2}, consistency {:.2}), next: {}",
                evaluation.quality_score,
                evaluation.scores.completeness,
                evaluation.scores.accuracy,
                evaluation.scores.consistency,
                evaluation.next_action.as_str()
            ),
        );
        evaluation
    }

    async fn advance(&self, active: &ActiveTask) -> Flow<()> {
        let current = active.update(|task| task.status);
        match TaskStateMachine::next_status(&current) {
            Some(next) => self.transition(active, next).await,
            None if current == TaskStatus::Cancelled => Err(Halt::Cancelled),
            None => Err(Halt::Internal(OrchestratorError::InvalidTransition {
                from: current.as_str().to_string(),
                to: "next phase".to_string(),
            })),
        }
    }

    async fn transition(&self, active: &ActiveTask, to: TaskStatus) -> Flow<()> {
        if active.token.is_cancelled() {
            return Err(Halt::Cancelled);
        }

        let (from, snapshot) = active.update(|task| {
            if task.status == TaskStatus::Cancelled {
                return Err(Halt::Cancelled);
            }
            TaskStateMachine::validate_transition(&task.status, &to).map_err(Halt::Internal)?;
            let from = task.status;
            task.set_status(to);
            Ok((from, task.clone()))
        })?;

        self.announce(from, &snapshot);
        self.persist(active, &snapshot).await;
        Ok(())
    }

    /// Moves a task to a terminal status unless it already has one.
    fn settle(&self, active: &ActiveTask, to: TaskStatus, error: Option<TaskError>) {
        let change = active.update(|task| {
            if task.status.is_terminal() {
                return None;
            }
            if let Some(error) = error {
                task.error = Some(error);
            }
            let from = task.status;
            task.set_status(to);
            Some((from, task.clone()))
        });

        if let Some((from, snapshot)) = change {
            self.announce(from, &snapshot);
        }
    }

    async fn finish(
        &self,
        active: &ActiveTask,
        outcome: Flow<Completion>,
    ) -> Result<TaskResult> {
        match outcome {
            Ok(completion) => {
                info!(
                    quality = completion.evaluation.quality_score,
                    success = completion.success,
                    "Task completed"
                );
                Ok(self.build_result(
                    active,
                    Some(completion.output),
                    Some(&completion.evaluation),
                    completion.success,
                    None,
                ))
            }
            Err(Halt::Cancelled) => {
                self.settle(active, TaskStatus::Cancelled, None);
                self.log(LogLevel::Warn, "Task cancelled");
                Ok(self.build_result(active, None, None, false, Some(cancelled_error())))
            }
            Err(Halt::Failed(error)) => {
                warn!(error = %error, "Task failed");
                self.log(LogLevel::Error, format!("Task failed: {error}"));
                self.settle(active, TaskStatus::Failed, Some(error.clone()));
                Ok(self.build_result(active, None, None, false, Some(error)))
            }
            Err(Halt::CeilingReached(error)) => {
                error!(error = %error, "Retry ceiling reached");
                self.log(LogLevel::Error, format!("Task failed: {error}"));
                self.settle(active, TaskStatus::Failed, Some(error.clone()));
                Err(OrchestratorError::RetryCeilingExceeded(error))
            }
            Err(Halt::Internal(err)) => {
                error!(error = %err, "Task aborted");
                self.log(LogLevel::Error, format!("Task aborted: {err}"));
                let failure = TaskError::new(
                    ErrorCategory::Unknown,
                    codes::TASK_EXECUTION_FAILED,
                    err.to_string(),
                );
                self.settle(active, TaskStatus::Failed, Some(failure));
                Err(err)
            }
        }
    }

    fn build_result(
        &self,
        active: &ActiveTask,
        data: Option<OutputData>,
        evaluation: Option<&EvaluationResult>,
        success: bool,
        error: Option<TaskError>,
    ) -> TaskResult {
        let task = active.snapshot();
        let now = Utc::now();
        let execution_summary = ExecutionSummary::from_task(&task, now);
        let quality_report = evaluation.map(|evaluation| {
            QualityReport::from_evaluation(
                evaluation,
                QualityMetrics {
                    total_steps: execution_summary.total_steps,
                    successful_steps: execution_summary.successful_steps,
                    failed_steps: execution_summary.failed_steps,
                    retried_steps: execution_summary.retried_steps,
                    total_time_ms: execution_summary.total_time_ms,
                },
            )
        });

        TaskResult {
            success,
            data,
            logs: self.logs_since(active.log_start),
            quality_report,
            execution_summary,
            metadata: ResultMetadata {
                completed_at: task.metadata.completed_at.unwrap_or(now),
                session_id: self.session_id,
                task_id: task.id,
                final_status: task.status,
            },
            error: error.or(task.error),
        }
    }

    async fn wrap_up(&self, active: &ActiveTask, result: &Result<TaskResult>, started: Instant) {
        let snapshot = active.snapshot();
        let success = result.as_ref().is_ok_and(|result| result.success);
        let elapsed_ms = started.elapsed().as_millis() as u64;

        {
            let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
            stats.tasks_run += 1;
            stats.total_time_ms += elapsed_ms;
            match snapshot.status {
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
                _ => stats.failed += 1,
            }
        }

        self.save_state(active, &snapshot).await;
        self.emit(Event::TaskFinished {
            task_id: snapshot.id,
            status: snapshot.status.as_str().to_string(),
            success,
        });
        info!(
            task_id = %snapshot.id,
            status = %snapshot.status,
            success,
            elapsed_ms,
            "Task finished"
        );
    }

    /// Logs the change, publishes events and notifies subscribers.
    fn announce(&self, from: TaskStatus, snapshot: &Task) {
        info!(
            task_id = %snapshot.id,
            from = %from,
            to = %snapshot.status,
            "Task status changed"
        );
        self.log(
            LogLevel::Info,
            format!("Status {} -> {}", from, snapshot.status),
        );

        self.emit(Event::TaskStatusChanged {
            task_id: snapshot.id,
            from_status: from.as_str().to_string(),
            to_status: snapshot.status.as_str().to_string(),
        });
        self.emit(Event::TaskProgress {
            task_id: snapshot.id,
            percentage: snapshot.progress.percentage,
            phase: snapshot.progress.current_phase.as_str().to_string(),
            message: snapshot.progress.message.clone(),
        });

        self.notify(snapshot);
    }

    fn notify(&self, snapshot: &Task) {
        let subscribers = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        for (index, callback) in subscribers.iter().enumerate() {
            match std::panic::catch_unwind(AssertUnwindSafe(|| callback(snapshot))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(subscriber = index, error = %err, "Progress callback failed");
                }
                Err(payload) => {
                    warn!(
                        subscriber = index,
                        message = %panic_message(payload.as_ref()),
                        "Progress callback panicked"
                    );
                }
            }
        }
    }

    /// Full snapshots at cycle boundaries, progress patches in between.
    async fn persist(&self, active: &ActiveTask, snapshot: &Task) {
        if snapshot.status == TaskStatus::Observing || snapshot.status.is_terminal() {
            self.save_state(active, snapshot).await;
            return;
        }

        let Some(store) = &self.state_store else {
            return;
        };
        if let Err(err) = store.update_progress(snapshot.id, &snapshot.progress).await {
            warn!(task_id = %snapshot.id, error = %err, "Failed to persist task progress");
        }
    }

    async fn save_state(&self, active: &ActiveTask, snapshot: &Task) {
        let Some(store) = &self.state_store else {
            return;
        };
        let state = ExecutionState::new(
            snapshot.clone(),
            active.plan(),
            active.cycle.load(Ordering::SeqCst),
        );
        if let Err(err) = store.save_execution_state(snapshot.id, &state).await {
            warn!(task_id = %snapshot.id, error = %err, "Failed to persist execution state");
        }
    }

    fn emit(&self, event: Event) {
        if let Some(bus) = &self.event_bus {
            bus.emit(event);
        }
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.logs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(LogEntry::new(level, message));
    }

    fn log_count(&self) -> usize {
        self.logs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn logs_since(&self, start: usize) -> Vec<String> {
        self.logs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .skip(start)
            .map(LogEntry::render)
            .collect()
    }

    fn active(&self) -> Option<Arc<ActiveTask>> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn cancelled_error() -> TaskError {
    TaskError::new(
        ErrorCategory::Unknown,
        codes::TASK_CANCELLED,
        "Task was cancelled",
    )
}

fn quality_error(evaluation: &EvaluationResult, threshold: f64) -> TaskError {
    TaskError::new(
        ErrorCategory::Data,
        codes::EVALUATION_FAILED,
        format!(
            "Result quality {:.2} is below threshold {:.2}",
            evaluation.quality_score, threshold
        ),
    )
}

fn improvement_hint(evaluation: &EvaluationResult) -> String {
    let mut hint = format!(
        "The last result scored {:.2} and needs improvement.",
        evaluation.quality_score
    );
    if !evaluation.suggestions.is_empty() {
        hint.push(' ');
        hint.push_str(&evaluation.suggestions.join("; "));
        hint.push('.');
    }
    hint
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_guard_is_exclusive() {
        let flag = AtomicBool::new(false);
        let guard = RunGuard::acquire(&flag);
        assert!(guard.is_some());
        assert!(RunGuard::acquire(&flag).is_none());

        drop(guard);
        assert!(!flag.load(Ordering::Acquire));
        assert!(RunGuard::acquire(&flag).is_some());
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");

        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }

    #[test]
    fn test_improvement_hint_lists_suggestions() {
        let mut evaluation = EvaluationResult::failed("low");
        evaluation.quality_score = 0.6;
        evaluation.suggestions = vec!["Normalize the columns of 'out'".to_string()];

        let hint = improvement_hint(&evaluation);
        assert!(hint.contains("0.60"));
        assert!(hint.contains("Normalize the columns of 'out'"));
    }
}
