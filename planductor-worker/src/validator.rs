//! Result Validator invocation and its fixed-line output contract.
//!
//! The validator prints a report whose third line (index 2) is exactly
//! `Plan valid` for an accepted plan, and whose seventh line (index 6) ends
//! in the plan's quality value. Anything else is a format error, kept apart
//! from an ordinary "plan invalid" verdict.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use planductor_common::{snippet, PlanResult};
use planductor_sandbox::{OutputCapture, ProcessSupervisor, RlimitSandbox};
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::ValidatorSettings;
use crate::dependencies::ResolvedTask;
use crate::discovery::ResultFile;

const VERDICT_LINE: usize = 2;
const SCORE_LINE: usize = 6;
const VALID_MARKER: &str = "Plan valid";
const LOG_SNIPPET_LIMIT: usize = 160;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Valid { score: i64 },
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidatorFormatError {
    #[error("validator output has {found} line(s), line {line} is missing")]
    MissingLine { line: usize, found: usize },
    #[error("line {line} does not end in a score: {text:?}")]
    NoTrailingScore { line: usize, text: String },
    #[error("score {digits} does not fit in a 64-bit integer")]
    ScoreOutOfRange { digits: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("validator output unparseable: {source}")]
    Format {
        #[source]
        source: ValidatorFormatError,
        output: String,
    },
    #[error("failed to run validator {}: {source}", binary.display())]
    Spawn {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("validator timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
    #[error("plan file {} unreadable: {source}", path.display())]
    PlanUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Interpret validator stdout. Pure: same text, same answer.
pub fn parse_validator_output(output: &str) -> Result<Verdict, ValidatorFormatError> {
    let lines: Vec<&str> = output.split('\n').collect();
    let line = |index: usize| {
        lines
            .get(index)
            .copied()
            .ok_or(ValidatorFormatError::MissingLine {
                line: index,
                found: lines.len(),
            })
    };

    if line(VERDICT_LINE)? != VALID_MARKER {
        return Ok(Verdict::Invalid);
    }

    let text = line(SCORE_LINE)?;
    let prefix = text.trim_end_matches(|c: char| c.is_ascii_digit());
    let digits = &text[prefix.len()..];
    if digits.is_empty() {
        return Err(ValidatorFormatError::NoTrailingScore {
            line: SCORE_LINE,
            text: text.to_string(),
        });
    }
    let score = digits
        .parse::<i64>()
        .map_err(|_| ValidatorFormatError::ScoreOutOfRange {
            digits: digits.to_string(),
        })?;
    Ok(Verdict::Valid { score })
}

/// A report that parsed, with the raw text it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorReport {
    pub verdict: Verdict,
    pub output: String,
    /// Only the first `output_limit` bytes of stdout were kept.
    pub truncated: bool,
}

pub struct PlanValidator {
    binary: PathBuf,
    tolerance: f64,
    output_limit: usize,
    supervisor: ProcessSupervisor,
}

impl PlanValidator {
    pub fn new(settings: &ValidatorSettings, kill_grace: Duration, output_limit: usize) -> Self {
        Self {
            binary: settings.binary.clone(),
            tolerance: settings.tolerance,
            output_limit,
            // The verdict and score sit at fixed lines from the top.
            supervisor: ProcessSupervisor::new(Duration::from_secs(settings.timeout_secs.max(1)))
                .with_kill_grace(kill_grace)
                .with_output_limit(output_limit)
                .with_capture(OutputCapture::Head),
        }
    }

    fn command(&self, domain: &Path, problem: &Path, plan: &Path) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-t")
            .arg(self.tolerance.to_string())
            .arg(domain)
            .arg(problem)
            .arg(plan);
        cmd
    }

    /// Run the validator on one plan and return its verdict with raw stdout.
    pub async fn check(
        &self,
        domain: &Path,
        problem: &Path,
        plan: &Path,
    ) -> Result<ValidatorReport, ValidationError> {
        let run = self
            .supervisor
            .run(&RlimitSandbox::new(), self.command(domain, problem, plan))
            .await
            .map_err(|source| ValidationError::Spawn {
                binary: self.binary.clone(),
                source,
            })?;
        if run.timed_out {
            return Err(ValidationError::TimedOut(self.supervisor.wall_clock()));
        }
        if run.stdout_truncated {
            warn!(
                plan = %plan.display(),
                limit = self.output_limit,
                "Validator output exceeded the limit, kept its head"
            );
        }
        match parse_validator_output(&run.stdout) {
            Ok(verdict) => Ok(ValidatorReport {
                verdict,
                output: run.stdout,
                truncated: run.stdout_truncated,
            }),
            Err(source) => Err(ValidationError::Format {
                source,
                output: run.stdout,
            }),
        }
    }

    /// Validate one result file. Never fails: problems become an invalid
    /// result carrying the reason.
    pub async fn validate(&self, task: &ResolvedTask, result: &ResultFile) -> PlanResult {
        let plan = match tokio::fs::read(&result.path).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(source) => {
                let err = ValidationError::PlanUnreadable {
                    path: result.path.clone(),
                    source,
                };
                warn!(index = result.index, "{}", err);
                let reason = err.to_string();
                return PlanResult::unparseable(result.index, String::new(), String::new(), reason);
            }
        };

        let report = match self.check(&task.domain, &task.problem, &result.path).await {
            Ok(report) => report,
            Err(err) => {
                warn!(index = result.index, "Plan not validated: {}", err);
                let reason = err.to_string();
                let output = match err {
                    ValidationError::Format { output, .. } => output,
                    _ => String::new(),
                };
                return PlanResult::unparseable(result.index, plan, output, reason);
            }
        };

        let truncated = report.truncated;
        let mut planned = match report.verdict {
            Verdict::Valid { score } => {
                info!(index = result.index, score, "Plan valid");
                PlanResult::valid(result.index, score, plan, report.output)
            }
            Verdict::Invalid => {
                info!(
                    index = result.index,
                    report = %snippet(&report.output, LOG_SNIPPET_LIMIT),
                    "Plan invalid"
                );
                PlanResult::invalid(result.index, plan, report.output)
            }
        };
        if truncated {
            planned.error = Some(format!(
                "validator output truncated to its first {} bytes",
                self.output_limit
            ));
        }
        planned
    }
}
