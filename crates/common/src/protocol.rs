//! Messages exchanged between `planductord` and its workers.
//!
//! Every document on the wire is a JSON object with a `status` field. Worker
//! messages are decoded into [`WorkerMessage`], an internally tagged enum, so
//! the dispatcher handles each status exhaustively instead of probing keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Score reported for a plan that is invalid or whose quality could not be read.
pub const INVALID_SCORE: i64 = -1;

/// A unit of planning work as handed to a worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub planner: String,
    pub domain: String,
    pub problem: String,
    /// CPU-time budget for the planner, in seconds.
    #[serde(rename = "duration")]
    pub duration_secs: u64,
    /// Archive holding the planner, relative to the worker's dependency base URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planner_url: Option<String>,
    /// Archive holding the domain and its problem files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_url: Option<String>,
    /// 1-based index of the problem file inside the domain archive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem_index: Option<u32>,
}

/// Outcome of validating one plan file produced by the planner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanResult {
    /// Sequence number taken from the result file suffix (`plan.3` -> 3).
    pub name: u32,
    pub score: i64,
    /// Raw plan text.
    pub output: String,
    pub valid: bool,
    pub validator_output: String,
    /// Why the result was recorded invalid when the validator gave no verdict.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PlanResult {
    pub fn valid(name: u32, score: i64, output: String, validator_output: String) -> Self {
        Self {
            name,
            score,
            output,
            valid: true,
            validator_output,
            error: None,
        }
    }

    pub fn invalid(name: u32, output: String, validator_output: String) -> Self {
        Self {
            name,
            score: INVALID_SCORE,
            output,
            valid: false,
            validator_output,
            error: None,
        }
    }

    pub fn unparseable(
        name: u32,
        output: String,
        validator_output: String,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            error: Some(reason.into()),
            ..Self::invalid(name, output, validator_output)
        }
    }
}

/// Everything a worker reports once a task has run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionReport {
    pub task_id: String,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub results: Vec<PlanResult>,
}

/// Worker -> dispatcher.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum WorkerMessage {
    Ready,
    Finished {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task: Option<CompletionReport>,
    },
    Complete {
        task: CompletionReport,
    },
    /// Any status this build does not know about.
    #[serde(other)]
    Unknown,
}

impl WorkerMessage {
    pub fn status(&self) -> &'static str {
        match self {
            WorkerMessage::Ready => "ready",
            WorkerMessage::Finished { .. } => "finished",
            WorkerMessage::Complete { .. } => "complete",
            WorkerMessage::Unknown => "unknown",
        }
    }

    /// The completion report carried by this message, if any.
    pub fn into_report(self) -> Option<CompletionReport> {
        match self {
            WorkerMessage::Finished { task } => task,
            WorkerMessage::Complete { task } => Some(task),
            WorkerMessage::Ready | WorkerMessage::Unknown => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Ok,
    #[serde(other)]
    Unknown,
}

/// Dispatcher -> worker.
///
/// `task` is absent on plain acknowledgements and present, possibly `null`,
/// on replies to `ready`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherReply {
    pub status: ReplyStatus,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    pub task: Option<Option<TaskSpec>>,
}

impl DispatcherReply {
    pub fn ack() -> Self {
        Self {
            status: ReplyStatus::Ok,
            task: None,
        }
    }

    pub fn assignment(task: Option<TaskSpec>) -> Self {
        Self {
            status: ReplyStatus::Ok,
            task: Some(task),
        }
    }
}

// Distinguishes `"task": null` from a missing key.
fn present<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    T::deserialize(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_task() -> TaskSpec {
        TaskSpec {
            name: "task1".into(),
            planner: "bsg001/plan".into(),
            domain: "city/domain.pddl".into(),
            problem: "city/deliveries1.pddl".into(),
            duration_secs: 30,
            planner_url: None,
            domain_url: None,
            problem_index: None,
        }
    }

    #[test]
    fn ready_and_unknown_statuses_decode() {
        let ready: WorkerMessage = serde_json::from_str(r#"{"status":"ready"}"#).unwrap();
        assert_eq!(ready, WorkerMessage::Ready);

        let other: WorkerMessage = serde_json::from_str(r#"{"status":"idle"}"#).unwrap();
        assert_eq!(other, WorkerMessage::Unknown);
    }

    #[test]
    fn bare_finished_is_a_handshake() {
        let msg: WorkerMessage = serde_json::from_str(r#"{"status":"finished"}"#).unwrap();
        assert_eq!(msg, WorkerMessage::Finished { task: None });
        assert!(msg.into_report().is_none());
        assert_eq!(
            serde_json::to_value(WorkerMessage::Finished { task: None }).unwrap(),
            json!({"status": "finished"})
        );
    }

    #[test]
    fn complete_requires_a_report() {
        let missing = serde_json::from_str::<WorkerMessage>(r#"{"status":"complete"}"#);
        assert!(missing.is_err());

        let msg: WorkerMessage = serde_json::from_value(json!({
            "status": "complete",
            "task": {
                "task_id": "task1",
                "end_time": "2024-03-01T12:00:00Z",
                "output": "done",
                "results": [{
                    "name": 1,
                    "score": 42,
                    "output": "(move a b)",
                    "valid": true,
                    "validator_output": "Plan valid"
                }]
            }
        }))
        .unwrap();
        let report = msg.into_report().unwrap();
        assert_eq!(report.task_id, "task1");
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].score, 42);
        assert!(report.results[0].error.is_none());
    }

    #[test]
    fn assignment_reply_keeps_explicit_null() {
        let none = serde_json::to_value(DispatcherReply::assignment(None)).unwrap();
        assert_eq!(none, json!({"status": "ok", "task": null}));
        let decoded: DispatcherReply = serde_json::from_value(none).unwrap();
        assert_eq!(decoded.task, Some(None));

        let ack = serde_json::to_value(DispatcherReply::ack()).unwrap();
        assert_eq!(ack, json!({"status": "ok"}));
        let decoded: DispatcherReply = serde_json::from_value(ack).unwrap();
        assert_eq!(decoded.task, None);
    }

    #[test]
    fn task_uses_duration_on_the_wire() {
        let value = serde_json::to_value(DispatcherReply::assignment(Some(sample_task()))).unwrap();
        assert_eq!(value["task"]["duration"], json!(30));
        assert!(value["task"].get("planner_url").is_none());

        let decoded: DispatcherReply = serde_json::from_value(value).unwrap();
        assert_eq!(decoded.task, Some(Some(sample_task())));
    }

    #[test]
    fn unparseable_result_carries_reason() {
        let result = PlanResult::unparseable(2, "plan".into(), "garbage".into(), "line 6 missing");
        assert!(!result.valid);
        assert_eq!(result.score, INVALID_SCORE);
        assert_eq!(result.error.as_deref(), Some("line 6 missing"));
    }
}
