use serde::Serialize;
use serde_json::Value;

use c2emu_common::TaskState;

/// Value of the `upload`/`download` reply field when the controller allows a transfer.
pub const ACCEPT_FLAG: &str = "ok";
pub const REJECT_FLAG: &str = "no";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    Register,
    Report,
    GetTask,
    Upload,
    Download,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Register => "register",
            Action::Report => "report",
            Action::GetTask => "getTask",
            Action::Upload => "upload",
            Action::Download => "download",
        }
    }
}

/// Body of every report/poll/register/permission request.
#[derive(Debug, Serialize)]
pub struct Envelope<'a> {
    pub id: &'a str,
    /// `true` while the agent is not executing a task.
    pub free: bool,
    pub action: Action,
    pub data: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Upload,
    Download,
}

impl TransferDirection {
    pub fn action(&self) -> Action {
        match self {
            TransferDirection::Upload => Action::Upload,
            TransferDirection::Download => Action::Download,
        }
    }
}

/// Controller endpoints derived from its base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct C2Urls {
    pub base: String,
    /// Report/poll endpoint, already suffixed with the agent id.
    pub post_data: String,
    pub upload: String,
    pub download: String,
}

impl C2Urls {
    pub fn new(base_url: &str, agent_id: &str) -> Self {
        let base = base_url.trim_end_matches('/').to_string();
        Self {
            post_data: format!("{base}/dataPost/{agent_id}"),
            upload: format!("{base}/fileupload"),
            download: format!("{base}/filedownload"),
            base,
        }
    }
}

/// The `state` flag of a register/report reply, if present and known.
pub fn reply_state(reply: &Value) -> Option<TaskState> {
    reply
        .get("state")
        .and_then(Value::as_u64)
        .and_then(|flag| u8::try_from(flag).ok())
        .and_then(|flag| TaskState::try_from(flag).ok())
}

/// Whether a permission reply grants `action`.
pub fn is_accepted(reply: &Value, action: Action) -> bool {
    reply.get(action.as_str()).and_then(Value::as_str) == Some(ACCEPT_FLAG)
}
