//! Worker session: one pass through the cycle
//! `CONNECT -> SEND_READY -> AWAIT_TASK -> RESOLVE_DEPENDENCIES -> EXECUTE ->
//! VALIDATE -> SEND_FINISHED -> AWAIT_ACK -> SEND_RESULTS -> CLEANUP -> SLEEP`.
//!
//! Transport failures end the process; dependency and execution failures
//! end only the current cycle, and the task stays assigned on the dispatcher.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use planductor_common::{CompletionReport, TaskSpec, WorkerMessage};
use tracing::{debug, error, info, warn};

use crate::config::{IdlePolicy, SessionSettings, WorkerSettings};
use crate::dependencies::{DependencyFetcher, DependencyResolver, HttpFetcher};
use crate::executor::TaskExecutor;
use crate::transport::{DispatcherLink, Transport, TransportError};
use crate::validator::PlanValidator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connect,
    SendReady,
    AwaitTask,
    NoTask,
    ResolveDependencies,
    Execute,
    Validate,
    SendFinished,
    AwaitAck,
    SendResults,
    Cleanup,
    Sleep,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connect => "CONNECT",
            SessionState::SendReady => "SEND_READY",
            SessionState::AwaitTask => "AWAIT_TASK",
            SessionState::NoTask => "NO_TASK",
            SessionState::ResolveDependencies => "RESOLVE_DEPENDENCIES",
            SessionState::Execute => "EXECUTE",
            SessionState::Validate => "VALIDATE",
            SessionState::SendFinished => "SEND_FINISHED",
            SessionState::AwaitAck => "AWAIT_ACK",
            SessionState::SendResults => "SEND_RESULTS",
            SessionState::Cleanup => "CLEANUP",
            SessionState::Sleep => "SLEEP",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a cycle ended when the transport stayed healthy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    NoTask,
    Reported { task_id: String, results: usize },
    Aborted { task_id: String, reason: String },
}

pub struct WorkerSession {
    transport: Transport,
    resolver: DependencyResolver,
    executor: TaskExecutor,
    validator: PlanValidator,
    settings: SessionSettings,
}

impl WorkerSession {
    pub fn new(
        transport: Transport,
        resolver: DependencyResolver,
        executor: TaskExecutor,
        validator: PlanValidator,
        settings: SessionSettings,
    ) -> Self {
        Self {
            transport,
            resolver,
            executor,
            validator,
            settings,
        }
    }

    pub fn from_settings(settings: &WorkerSettings) -> Result<Self> {
        let transport = Transport::from_endpoint(&settings.dispatcher)
            .context("failed to prepare dispatcher connection")?;
        let fetcher = match &settings.dependencies.base_url {
            Some(base_url) => {
                let fetcher = HttpFetcher::new(
                    base_url,
                    std::time::Duration::from_secs(settings.dependencies.timeout_secs),
                )
                .context("failed to build dependency client")?;
                Some(Arc::new(fetcher) as Arc<dyn DependencyFetcher>)
            }
            None => None,
        };
        let executor = &settings.executor;
        Ok(Self::new(
            transport,
            DependencyResolver::new(executor, fetcher),
            TaskExecutor::new(executor.clone()),
            PlanValidator::new(
                &settings.validator,
                executor.kill_grace(),
                executor.output_limit_bytes,
            ),
            settings.session.clone(),
        ))
    }

    /// Repeat cycles until the dispatcher runs dry (with `idle = exit`) or
    /// the transport fails.
    pub async fn run(&self) -> Result<(), TransportError> {
        loop {
            let outcome = self.run_cycle().await?;
            enter(SessionState::Sleep);
            let pause = match (&outcome, self.settings.idle) {
                (CycleOutcome::NoTask, IdlePolicy::Exit) => {
                    info!("No task received, exiting");
                    return Ok(());
                }
                (CycleOutcome::NoTask, IdlePolicy::Poll) => self.settings.poll_interval(),
                _ => self.settings.cycle_pause(),
            };
            debug!(pause_secs = pause.as_secs(), "Sleeping before the next cycle");
            tokio::time::sleep(pause).await;
        }
    }

    pub async fn run_cycle(&self) -> Result<CycleOutcome, TransportError> {
        enter(SessionState::Connect);
        let mut link = self.transport.connect().await?;

        enter(SessionState::SendReady);
        let reply = link.request(&WorkerMessage::Ready).await?;

        enter(SessionState::AwaitTask);
        let task = match reply.task {
            Some(Some(task)) => task,
            Some(None) => {
                enter(SessionState::NoTask);
                link.close().await;
                return Ok(CycleOutcome::NoTask);
            }
            None => {
                warn!("Reply to ready carried no task field, treating it as no task");
                enter(SessionState::NoTask);
                link.close().await;
                return Ok(CycleOutcome::NoTask);
            }
        };
        info!(
            task_id = %task.name,
            planner = %task.planner,
            budget_secs = task.duration_secs,
            "Got task"
        );

        let outcome = self.work_on(&mut link, &task).await;
        link.close().await;
        outcome
    }

    async fn work_on(
        &self,
        link: &mut DispatcherLink,
        task: &TaskSpec,
    ) -> Result<CycleOutcome, TransportError> {
        enter(SessionState::ResolveDependencies);
        let resolved = match self.resolver.resolve(task).await {
            Ok(resolved) => resolved,
            Err(err) => {
                error!(task_id = %task.name, "Dependency resolution failed: {}", err);
                enter(SessionState::Cleanup);
                return Ok(aborted(task, err.to_string()));
            }
        };

        enter(SessionState::Execute);
        let mut execution = match self.executor.execute(task, &resolved).await {
            Ok(execution) => execution,
            Err(err) => {
                error!(task_id = %task.name, "Execution failed: {}", err);
                enter(SessionState::Cleanup);
                resolved.cleanup();
                return Ok(aborted(task, err.to_string()));
            }
        };

        enter(SessionState::Validate);
        let mut results = Vec::with_capacity(execution.results.len());
        for file in &execution.results {
            results.push(self.validator.validate(&resolved, file).await);
        }
        let valid = results.iter().filter(|result| result.valid).count();
        info!(task_id = %task.name, results = results.len(), valid, "Validation done");

        let report = CompletionReport {
            task_id: task.name.clone(),
            end_time: Utc::now(),
            output: std::mem::take(&mut execution.output),
            results,
        };
        let reported = report.results.len();

        enter(SessionState::SendFinished);
        link.send(&WorkerMessage::Finished { task: None }).await?;

        enter(SessionState::AwaitAck);
        link.await_reply().await?;

        enter(SessionState::SendResults);
        link.send(&WorkerMessage::Complete { task: report }).await?;
        match link.await_reply_within(self.settings.ack_timeout()).await {
            Ok(_) => debug!(task_id = %task.name, "Results acknowledged"),
            Err(TransportError::TimedOut(limit)) => warn!(
                task_id = %task.name,
                timeout_secs = limit.as_secs(),
                "Results sent but not acknowledged"
            ),
            Err(err) => return Err(err),
        }

        enter(SessionState::Cleanup);
        execution.cleanup();
        resolved.cleanup();

        Ok(CycleOutcome::Reported {
            task_id: task.name.clone(),
            results: reported,
        })
    }
}

fn enter(state: SessionState) {
    debug!(state = %state, "Session state");
}

fn aborted(task: &TaskSpec, reason: String) -> CycleOutcome {
    CycleOutcome::Aborted {
        task_id: task.name.clone(),
        reason,
    }
}
