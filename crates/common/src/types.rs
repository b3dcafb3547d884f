//! Task and report records exchanged with the controller.
//!
//! Field names and state flags follow the controller's JSON wire format, so a
//! record can be forwarded verbatim in either direction.

use std::fmt;

use chrono::{Local, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable task key, unique within one store. Never a list position.
pub type TaskId = u64;

/// Wire format of every timestamp the controller sends or receives.
pub const WIRE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum TaskState {
    Pending,
    Finished,
    Accepted,
    Error,
    Running,
}

impl TaskState {
    pub const ALL: [TaskState; 5] = [
        TaskState::Pending,
        TaskState::Accepted,
        TaskState::Running,
        TaskState::Finished,
        TaskState::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Finished => "finish",
            TaskState::Accepted => "accept",
            TaskState::Error => "error",
            TaskState::Running => "running",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Finished | TaskState::Error)
    }

    fn stage(&self) -> u8 {
        match self {
            TaskState::Pending => 0,
            TaskState::Accepted => 1,
            TaskState::Running => 2,
            TaskState::Finished | TaskState::Error => 3,
        }
    }

    /// Tasks only move forward: Pending/Accepted, then Running, then
    /// Finished or Error. Staying in the same state is always allowed.
    pub fn can_move_to(&self, next: TaskState) -> bool {
        *self == next || (!self.is_terminal() && next.stage() > self.stage())
    }
}

impl From<TaskState> for u8 {
    fn from(state: TaskState) -> Self {
        match state {
            TaskState::Pending => 0,
            TaskState::Finished => 1,
            TaskState::Accepted => 2,
            TaskState::Error => 3,
            TaskState::Running => 4,
        }
    }
}

impl TryFrom<u8> for TaskState {
    type Error = String;

    fn try_from(flag: u8) -> Result<Self, String> {
        match flag {
            0 => Ok(TaskState::Pending),
            1 => Ok(TaskState::Finished),
            2 => Ok(TaskState::Accepted),
            3 => Ok(TaskState::Error),
            4 => Ok(TaskState::Running),
            other => Err(format!("unknown task state flag {other}")),
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Register,
    Report,
    Upload,
    Download,
    Command,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskType::Register => "register",
            TaskType::Report => "report",
            TaskType::Upload => "upload",
            TaskType::Download => "download",
            TaskType::Command => "command",
        };
        f.write_str(name)
    }
}

/// Task body: a command line, a list of file names/paths, or nothing.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskPayload {
    #[default]
    Empty,
    Text(String),
    Files(Vec<String>),
    Other(Value),
}

impl TaskPayload {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            TaskPayload::Text(text) => Some(text),
            _ => None,
        }
    }

    /// File list of an upload/download task. A single string is read as one file.
    pub fn files(&self) -> Vec<String> {
        match self {
            TaskPayload::Files(files) => files.clone(),
            TaskPayload::Text(single) if !single.is_empty() => vec![single.clone()],
            _ => Vec::new(),
        }
    }
}

fn default_repeat() -> u32 {
    1
}

fn default_agent_state() -> TaskState {
    TaskState::Accepted
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    #[serde(rename = "taskID", default)]
    pub task_id: TaskId,
    #[serde(rename = "taskType")]
    pub task_type: TaskType,
    /// `None` means run as soon as the task is received.
    #[serde(rename = "StartT", default, with = "wire_time")]
    pub start_time: Option<NaiveDateTime>,
    #[serde(default = "default_repeat")]
    pub repeat: u32,
    #[serde(rename = "ExPreT", alias = "ExPerT", default)]
    pub pre_exec_delay_secs: u64,
    #[serde(default = "default_agent_state")]
    pub state: TaskState,
    #[serde(rename = "taskData", default)]
    pub payload: TaskPayload,
}

impl TaskRecord {
    pub fn new(
        task_id: TaskId,
        task_type: TaskType,
        payload: TaskPayload,
        state: TaskState,
    ) -> Self {
        Self {
            task_id,
            task_type,
            start_time: None,
            repeat: 1,
            pre_exec_delay_secs: 0,
            state,
            payload,
        }
    }

    /// Seed record announcing registration, stamped with the current time.
    pub fn register_seed(task_id: TaskId) -> Self {
        let mut task = Self::new(
            task_id,
            TaskType::Register,
            TaskPayload::Empty,
            TaskState::Running,
        );
        task.start_time = Some(now());
        task
    }

    /// Number of times to run the body; a zero from the wire counts as one.
    pub fn repeat_count(&self) -> u32 {
        self.repeat.max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRecord {
    #[serde(rename = "taskID", default)]
    pub task_id: TaskId,
    #[serde(default = "default_report_state")]
    pub state: TaskState,
    #[serde(alias = "Time", default, with = "wire_time")]
    pub time: Option<NaiveDateTime>,
    #[serde(rename = "taskData", default)]
    pub result: Value,
}

fn default_report_state() -> TaskState {
    TaskState::Pending
}

impl ReportRecord {
    pub fn new(task_id: TaskId, state: TaskState, result: impl Into<Value>) -> Self {
        Self {
            task_id,
            state,
            time: Some(now()),
            result: result.into(),
        }
    }
}

/// Local wall-clock time truncated to the wire precision.
pub fn now() -> NaiveDateTime {
    let local = Local::now().naive_local();
    local.with_nanosecond(0).unwrap_or(local)
}

mod wire_time {
    use chrono::{DateTime, NaiveDateTime};
    use serde::{Deserialize, Deserializer, Serializer};

    use super::WIRE_TIME_FORMAT;

    pub fn serialize<S>(value: &Option<NaiveDateTime>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(ts) => serializer.serialize_str(&ts.format(WIRE_TIME_FORMAT).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<NaiveDateTime>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        let Some(raw) = raw.filter(|s| !s.trim().is_empty()) else {
            return Ok(None);
        };
        let raw = raw.trim();
        NaiveDateTime::parse_from_str(raw, WIRE_TIME_FORMAT)
            .or_else(|_| DateTime::parse_from_rfc3339(raw).map(|ts| ts.naive_local()))
            .map(Some)
            .map_err(serde::de::Error::custom)
    }
}
