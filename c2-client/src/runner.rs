//! Executes controller tasks on the host program's own control flow, one at a
//! time, and turns each outcome into a queued report.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::task::spawn_blocking;
use tokio::time::sleep;
use tracing::{info, warn};

use c2emu_common::types;
use c2emu_common::{ReportRecord, TaskId, TaskRecord, TaskState, TaskStore, TaskType};
use c2emu_executor::DETAIL_MODE;

use crate::{C2Client, TransferDirection};

pub struct TaskRunner {
    client: Arc<C2Client>,
    store: TaskStore,
}

impl TaskRunner {
    pub fn new(client: Arc<C2Client>) -> Self {
        let store = TaskStore::agent(client.id(), client.own_ip());
        Self { client, store }
    }

    /// Every task this runner has taken, with states and results.
    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Take one task from the client's queue and run it to a terminal state.
    /// Returns `None` when the queue is empty.
    pub async fn run_next(&mut self) -> Option<TaskId> {
        let task = self.client.next_task()?;
        let task_id = task.task_id;

        if !self.store.append_task(task.clone()) {
            self.client.add_report(ReportRecord::new(
                task_id,
                TaskState::Error,
                "duplicate task id",
            ));
            return Some(task_id);
        }

        self.client.set_free(false);
        wait_for_start(&task).await;
        self.store.set_state(task_id, TaskState::Running);

        let (state, result) = self.execute(&task).await;
        info!(task_id, task_type = %task.task_type, %state, "task done");

        self.store.set_state(task_id, state);
        self.store.set_result(task_id, result.clone());
        self.client.add_report(ReportRecord::new(task_id, state, result));
        self.client.set_free(true);
        Some(task_id)
    }

    /// Run the body `repeat` times; the first failing round ends the task.
    async fn execute(&self, task: &TaskRecord) -> (TaskState, Value) {
        let mut outcome = (TaskState::Finished, Value::Null);
        for _ in 0..task.repeat_count() {
            outcome = self.execute_once(task).await;
            if outcome.0 == TaskState::Error {
                break;
            }
        }
        outcome
    }

    async fn execute_once(&self, task: &TaskRecord) -> (TaskState, Value) {
        match task.task_type {
            TaskType::Command => {
                let Some(command) = task.payload.as_text().map(str::to_owned) else {
                    return (TaskState::Error, json!("missing command"));
                };
                match spawn_blocking(move || c2emu_executor::run(DETAIL_MODE, &command)).await {
                    Ok(outcome) => {
                        let state = if outcome.success {
                            TaskState::Finished
                        } else {
                            TaskState::Error
                        };
                        (state, Value::String(outcome.output_lossy()))
                    }
                    Err(err) => {
                        warn!("command worker failed: {}", err);
                        (TaskState::Error, json!("error"))
                    }
                }
            }
            TaskType::Upload | TaskType::Download => {
                let direction = if task.task_type == TaskType::Upload {
                    TransferDirection::Upload
                } else {
                    TransferDirection::Download
                };
                let files = task.payload.files();
                if files.is_empty() {
                    return (TaskState::Error, json!("no files given"));
                }
                if self.client.transfer_files(&files, direction).await {
                    (TaskState::Finished, json!(format!("{} done", task.task_type)))
                } else {
                    (TaskState::Error, json!(format!("{} failed", task.task_type)))
                }
            }
            TaskType::Register => (TaskState::Finished, json!("registered")),
            TaskType::Report => {
                self.client.submit_reports().await;
                (TaskState::Finished, json!("reported"))
            }
        }
    }
}

/// Honour the task's start time and pre-execution delay.
async fn wait_for_start(task: &TaskRecord) {
    if let Some(start) = task.start_time {
        if let Ok(wait) = (start - types::now()).to_std() {
            if !wait.is_zero() {
                info!(task_id = task.task_id, secs = wait.as_secs(), "waiting for task start time");
                sleep(wait).await;
            }
        }
    }
    if task.pre_exec_delay_secs > 0 {
        sleep(Duration::from_secs(task.pre_exec_delay_secs)).await;
    }
}
