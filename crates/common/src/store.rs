//! Per-program task bookkeeping shared by the controller and agent sides.
//!
//! Both sides use the same [`TaskStore`]; a [`StorePolicy`] decides the state
//! given to newly added tasks and what happens to the seed list at creation.
//! Per-state counters are only ever changed together with the record they
//! describe, so [`TaskStore::counts`] always matches the records.

use chrono::NaiveDateTime;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::types::{self, ReportRecord, TaskId, TaskPayload, TaskRecord, TaskState, TaskType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TaskCounts {
    pub total: usize,
    pub pending: usize,
    pub accept: usize,
    pub running: usize,
    pub finish: usize,
    pub error: usize,
}

impl TaskCounts {
    pub fn get(&self, state: TaskState) -> usize {
        match state {
            TaskState::Pending => self.pending,
            TaskState::Accepted => self.accept,
            TaskState::Running => self.running,
            TaskState::Finished => self.finish,
            TaskState::Error => self.error,
        }
    }

    fn slot(&mut self, state: TaskState) -> &mut usize {
        match state {
            TaskState::Pending => &mut self.pending,
            TaskState::Accepted => &mut self.accept,
            TaskState::Running => &mut self.running,
            TaskState::Finished => &mut self.finish,
            TaskState::Error => &mut self.error,
        }
    }

    fn record_new(&mut self, state: TaskState) {
        self.total += 1;
        *self.slot(state) += 1;
    }

    fn record_transition(&mut self, from: TaskState, to: TaskState) {
        let old = self.slot(from);
        *old = old.saturating_sub(1);
        *self.slot(to) += 1;
    }
}

/// What the store does with its seed list when it is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitHook {
    /// Keep seeds exactly as delivered.
    Keep,
    /// A seeded register task means the program already completed its
    /// handshake: mark that task finished and the program connected.
    CompleteRegister,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorePolicy {
    pub default_state: TaskState,
    pub on_init: InitHook,
    /// Controller-side stores track connection and update time.
    pub tracks_connection: bool,
}

impl StorePolicy {
    pub const fn controller() -> Self {
        Self {
            default_state: TaskState::Pending,
            on_init: InitHook::CompleteRegister,
            tracks_connection: true,
        }
    }

    pub const fn agent() -> Self {
        Self {
            default_state: TaskState::Accepted,
            on_init: InitHook::Keep,
            tracks_connection: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreSummary {
    pub id: String,
    #[serde(rename = "ipAddr")]
    pub ip_addr: String,
    #[serde(flatten)]
    pub counts: TaskCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected: Option<bool>,
    #[serde(rename = "updateT", skip_serializing_if = "Option::is_none")]
    pub update_time: Option<String>,
}

pub struct TaskStore {
    uniq_id: String,
    ip_addr: String,
    policy: StorePolicy,
    tasks: Vec<TaskRecord>,
    // Parallel to `tasks`; records are never removed or reordered.
    results: Vec<Option<Value>>,
    counts: TaskCounts,
    next_id: TaskId,
    connected: bool,
    last_update: Option<NaiveDateTime>,
    last_result: ReportRecord,
}

impl TaskStore {
    pub fn new(
        uniq_id: impl Into<String>,
        ip_addr: impl Into<String>,
        seeds: Vec<TaskRecord>,
        policy: StorePolicy,
    ) -> Self {
        let mut store = Self {
            uniq_id: uniq_id.into(),
            ip_addr: ip_addr.into(),
            policy,
            tasks: Vec::with_capacity(seeds.len()),
            results: Vec::with_capacity(seeds.len()),
            counts: TaskCounts::default(),
            next_id: 0,
            connected: false,
            last_update: None,
            last_result: ReportRecord {
                task_id: 0,
                state: TaskState::Finished,
                time: None,
                result: Value::String("registered".into()),
            },
        };
        for seed in seeds {
            store.append_task(seed);
        }

        if policy.on_init == InitHook::CompleteRegister {
            let register = store
                .tasks
                .iter()
                .find(|task| task.task_type == TaskType::Register)
                .map(|task| task.task_id);
            if let Some(task_id) = register {
                store.set_state(task_id, TaskState::Finished);
                store.connected = true;
            }
        }
        if policy.tracks_connection {
            store.touch();
        }
        store
    }

    pub fn controller(
        uniq_id: impl Into<String>,
        ip_addr: impl Into<String>,
        seeds: Vec<TaskRecord>,
    ) -> Self {
        Self::new(uniq_id, ip_addr, seeds, StorePolicy::controller())
    }

    pub fn agent(uniq_id: impl Into<String>, ip_addr: impl Into<String>) -> Self {
        Self::new(uniq_id, ip_addr, Vec::new(), StorePolicy::agent())
    }

    fn position(&self, task_id: TaskId) -> Option<usize> {
        self.tasks.iter().position(|task| task.task_id == task_id)
    }

    /// Create a task with the next sequential id and the policy's default state.
    pub fn add_task(&mut self, task_type: TaskType, payload: TaskPayload) -> TaskRecord {
        let task = TaskRecord::new(self.next_id, task_type, payload, self.policy.default_state);
        self.push(task.clone());
        task
    }

    /// Store an externally delivered record verbatim, keeping its id and state.
    /// Returns `false` if a record with the same id is already present.
    pub fn append_task(&mut self, task: TaskRecord) -> bool {
        if self.position(task.task_id).is_some() {
            warn!(task_id = task.task_id, store = %self.uniq_id, "duplicate task id ignored");
            return false;
        }
        self.push(task);
        true
    }

    fn push(&mut self, task: TaskRecord) {
        self.next_id = self.next_id.max(task.task_id.saturating_add(1));
        self.counts.record_new(task.state);
        self.tasks.push(task);
        self.results.push(None);
    }

    pub fn get_task(&self, task_id: TaskId) -> Option<&TaskRecord> {
        self.position(task_id).map(|idx| &self.tasks[idx])
    }

    /// Tasks in creation order, optionally only those in `filter` state.
    pub fn list_tasks(&self, filter: Option<TaskState>) -> Vec<&TaskRecord> {
        self.tasks
            .iter()
            .filter(|task| filter.map_or(true, |state| task.state == state))
            .collect()
    }

    /// Move a task to `state`. Returns `false` for an unknown id or a move
    /// backwards or out of Finished/Error; the record is left untouched.
    pub fn set_state(&mut self, task_id: TaskId, state: TaskState) -> bool {
        let Some(idx) = self.position(task_id) else {
            debug!(task_id, store = %self.uniq_id, "set_state on unknown task");
            return false;
        };
        let previous = self.tasks[idx].state;
        if !previous.can_move_to(state) {
            warn!(
                task_id,
                store = %self.uniq_id,
                from = %previous,
                to = %state,
                "illegal task state transition rejected"
            );
            return false;
        }
        if previous != state {
            self.tasks[idx].state = state;
            self.counts.record_transition(previous, state);
        }
        true
    }

    pub fn set_result(&mut self, task_id: TaskId, result: Value) -> bool {
        match self.position(task_id) {
            Some(idx) => {
                self.results[idx] = Some(result);
                true
            }
            None => false,
        }
    }

    pub fn result(&self, task_id: TaskId) -> Option<&Value> {
        self.position(task_id).and_then(|idx| self.results[idx].as_ref())
    }

    /// Every task id paired with its stored result, in creation order.
    pub fn results(&self) -> Vec<(TaskId, Option<&Value>)> {
        self.tasks
            .iter()
            .zip(&self.results)
            .map(|(task, result)| (task.task_id, result.as_ref()))
            .collect()
    }

    /// Merge reports submitted by an agent. Reports for unknown ids and
    /// stale reports that would move a task backwards are skipped; returns
    /// the number of reports applied.
    pub fn apply_reports(&mut self, reports: &[ReportRecord]) -> usize {
        let mut applied = 0;
        for report in reports {
            let Some(idx) = self.position(report.task_id) else {
                warn!(task_id = report.task_id, store = %self.uniq_id, "report for unknown task");
                continue;
            };
            if !self.set_state(report.task_id, report.state) {
                continue;
            }
            if report.time.is_some() {
                self.tasks[idx].start_time = report.time;
            }
            self.results[idx] = Some(report.result.clone());
            self.last_result = report.clone();
            applied += 1;
        }
        if applied > 0 && self.policy.tracks_connection {
            self.touch();
        }
        applied
    }

    pub fn last_result(&self) -> &ReportRecord {
        &self.last_result
    }

    pub fn counts(&self) -> TaskCounts {
        self.counts
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    pub fn last_update(&self) -> Option<NaiveDateTime> {
        self.last_update
    }

    pub fn touch(&mut self) {
        self.last_update = Some(types::now());
    }

    /// Re-stamp the register task after the program registers again.
    pub fn refresh_register_time(&mut self) {
        if let Some(task) = self.tasks.iter_mut().find(|t| t.task_type == TaskType::Register) {
            task.start_time = Some(types::now());
        }
    }

    pub fn summary(&self) -> StoreSummary {
        let tracks = self.policy.tracks_connection;
        StoreSummary {
            id: self.uniq_id.clone(),
            ip_addr: self.ip_addr.clone(),
            counts: self.counts,
            connected: tracks.then_some(self.connected),
            update_time: tracks
                .then(|| self.last_update)
                .flatten()
                .map(|ts| ts.format(types::WIRE_TIME_FORMAT).to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assert_counts_match(store: &TaskStore) {
        let counts = store.counts();
        assert_eq!(counts.total, store.len());
        for state in TaskState::ALL {
            assert_eq!(
                counts.get(state),
                store.list_tasks(Some(state)).len(),
                "counter for {state} drifted"
            );
        }
    }

    #[test]
    fn agent_store_defaults_new_tasks_to_accepted() {
        let mut store = TaskStore::agent("agent-1", "10.0.0.5");
        let first = store.add_task(TaskType::Command, TaskPayload::Text("id".into()));
        let second = store.add_task(TaskType::Upload, TaskPayload::Files(vec!["a".into()]));
        assert_eq!(first.task_id, 0);
        assert_eq!(second.task_id, 1);
        assert_eq!(first.state, TaskState::Accepted);
        assert_eq!(store.counts().accept, 2);
        assert_counts_match(&store);
    }

    #[test]
    fn controller_store_completes_seeded_register_task() {
        let seeds = vec![
            TaskRecord::register_seed(0),
            TaskRecord::new(1, TaskType::Command, TaskPayload::Text("dir".into()), TaskState::Pending),
        ];
        let mut store = TaskStore::controller("agent-1", "10.0.0.5", seeds);
        assert!(store.is_connected());
        assert!(store.last_update().is_some());
        assert_eq!(store.get_task(0).unwrap().state, TaskState::Finished);
        assert_eq!(store.counts().finish, 1);
        assert_eq!(store.counts().running, 0);

        let added = store.add_task(TaskType::Download, TaskPayload::Files(vec!["f".into()]));
        assert_eq!(added.task_id, 2);
        assert_eq!(added.state, TaskState::Pending);
        assert_counts_match(&store);
    }

    #[test]
    fn controller_store_without_register_stays_disconnected() {
        let store = TaskStore::controller("agent-2", "10.0.0.6", Vec::new());
        assert!(!store.is_connected());
        assert_eq!(store.summary().connected, Some(false));
    }

    #[test]
    fn lookups_use_stable_ids_not_positions() {
        let seeds = vec![
            TaskRecord::new(40, TaskType::Command, TaskPayload::Text("a".into()), TaskState::Accepted),
            TaskRecord::new(7, TaskType::Command, TaskPayload::Text("b".into()), TaskState::Accepted),
        ];
        let mut store = TaskStore::new("p", "127.0.0.1", seeds, StorePolicy::agent());
        assert_eq!(store.get_task(7).unwrap().payload.as_text(), Some("b"));
        assert!(store.get_task(1).is_none());

        assert!(store.set_result(7, json!("out-b")));
        assert_eq!(store.result(7), Some(&json!("out-b")));
        assert_eq!(store.result(40), None);

        let next = store.add_task(TaskType::Report, TaskPayload::Empty);
        assert_eq!(next.task_id, 41);
    }

    #[test]
    fn unknown_ids_are_rejected_quietly() {
        let mut store = TaskStore::agent("p", "127.0.0.1");
        assert!(!store.set_state(3, TaskState::Finished));
        assert!(!store.set_result(3, json!(1)));
        assert!(store.get_task(3).is_none());
        assert_counts_match(&store);
    }

    #[test]
    fn duplicate_ids_are_not_appended() {
        let mut store = TaskStore::agent("p", "127.0.0.1");
        let task = TaskRecord::new(5, TaskType::Command, TaskPayload::Text("x".into()), TaskState::Accepted);
        assert!(store.append_task(task.clone()));
        assert!(!store.append_task(task));
        assert_eq!(store.len(), 1);
        assert_counts_match(&store);
    }

    #[test]
    fn counters_track_every_transition() {
        let mut store = TaskStore::agent("p", "127.0.0.1");
        for i in 0..6 {
            store.add_task(TaskType::Command, TaskPayload::Text(format!("cmd {i}")));
        }
        let transitions = [
            (0, TaskState::Running),
            (0, TaskState::Finished),
            (1, TaskState::Running),
            (1, TaskState::Error),
            (2, TaskState::Running),
            (2, TaskState::Running),
            (3, TaskState::Running),
            (9, TaskState::Finished),
        ];
        for (task_id, state) in transitions {
            store.set_state(task_id, state);
            assert_counts_match(&store);
        }
        let counts = store.counts();
        assert_eq!(counts.finish, 1);
        assert_eq!(counts.error, 1);
        assert_eq!(counts.running, 2);
        assert_eq!(counts.pending, 0);
        assert_eq!(counts.accept, 2);
    }

    #[test]
    fn terminal_and_backward_transitions_are_rejected() {
        let mut store = TaskStore::agent("p", "127.0.0.1");
        let task = store.add_task(TaskType::Command, TaskPayload::Text("id".into()));
        let other = store.add_task(TaskType::Command, TaskPayload::Text("ls".into()));

        assert!(store.set_state(task.task_id, TaskState::Running));
        assert!(store.set_state(task.task_id, TaskState::Error));
        assert!(!store.set_state(task.task_id, TaskState::Running));
        assert!(!store.set_state(task.task_id, TaskState::Pending));
        assert!(!store.set_state(task.task_id, TaskState::Finished));
        assert_eq!(store.get_task(task.task_id).unwrap().state, TaskState::Error);

        assert!(!store.set_state(other.task_id, TaskState::Pending));
        assert_eq!(store.get_task(other.task_id).unwrap().state, TaskState::Accepted);

        let counts = store.counts();
        assert_eq!(counts.error, 1);
        assert_eq!(counts.accept, 1);
        assert_eq!(counts.running, 0);
        assert_counts_match(&store);
    }

    #[test]
    fn stale_report_does_not_reopen_finished_task() {
        let mut store = TaskStore::controller("agent-1", "10.0.0.5", vec![TaskRecord::register_seed(0)]);
        let task = store.add_task(TaskType::Command, TaskPayload::Text("whoami".into()));

        let done = ReportRecord::new(task.task_id, TaskState::Finished, "root\n");
        assert_eq!(store.apply_reports(&[done]), 1);

        let stale = ReportRecord::new(task.task_id, TaskState::Pending, "late");
        assert_eq!(store.apply_reports(&[stale]), 0);
        assert_eq!(store.get_task(task.task_id).unwrap().state, TaskState::Finished);
        assert_eq!(store.result(task.task_id), Some(&json!("root\n")));
        assert_eq!(store.last_result().state, TaskState::Finished);
        assert_counts_match(&store);
    }

    #[test]
    fn reregistration_restamps_register_task() {
        let mut store = TaskStore::controller("agent-1", "10.0.0.5", vec![TaskRecord::register_seed(0)]);
        store.set_connected(false);
        assert!(!store.is_connected());
        assert_eq!(store.summary().connected, Some(false));

        let before = store.get_task(0).unwrap().start_time;
        std::thread::sleep(std::time::Duration::from_millis(1100));
        store.refresh_register_time();
        store.set_connected(true);

        let after = store.get_task(0).unwrap().start_time;
        assert!(after.is_some());
        assert!(after > before);
        assert!(store.is_connected());
        assert_eq!(store.get_task(0).unwrap().state, TaskState::Finished);
    }

    #[test]
    fn list_tasks_filters_in_creation_order() {
        let mut store = TaskStore::agent("p", "127.0.0.1");
        for i in 0..4 {
            store.add_task(TaskType::Command, TaskPayload::Text(i.to_string()));
        }
        store.set_state(1, TaskState::Finished);
        store.set_state(3, TaskState::Finished);
        let finished: Vec<_> = store
            .list_tasks(Some(TaskState::Finished))
            .into_iter()
            .map(|t| t.task_id)
            .collect();
        assert_eq!(finished, vec![1, 3]);
        assert_eq!(store.list_tasks(None).len(), 4);
    }

    #[test]
    fn apply_reports_updates_state_result_and_last_result() {
        let mut store = TaskStore::controller("agent-1", "10.0.0.5", vec![TaskRecord::register_seed(0)]);
        let task = store.add_task(TaskType::Command, TaskPayload::Text("whoami".into()));
        let reports = vec![
            ReportRecord::new(task.task_id, TaskState::Finished, "root\n"),
            ReportRecord::new(99, TaskState::Error, "nope"),
        ];
        assert_eq!(store.apply_reports(&reports), 1);
        assert_eq!(store.get_task(task.task_id).unwrap().state, TaskState::Finished);
        assert!(store.get_task(task.task_id).unwrap().start_time.is_some());
        assert_eq!(store.result(task.task_id), Some(&json!("root\n")));
        assert_eq!(store.last_result().task_id, task.task_id);
        assert_counts_match(&store);
    }

    #[test]
    fn summary_carries_identity_and_counts() {
        let mut store = TaskStore::agent("agent-9", "192.168.1.9");
        store.add_task(TaskType::Command, TaskPayload::Text("ls".into()));
        let value = serde_json::to_value(store.summary()).unwrap();
        assert_eq!(value["id"], json!("agent-9"));
        assert_eq!(value["ipAddr"], json!("192.168.1.9"));
        assert_eq!(value["total"], json!(1));
        assert_eq!(value["accept"], json!(1));
        assert!(value.get("connected").is_none());
        assert!(value.get("updateT").is_none());
    }
}
