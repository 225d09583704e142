use crate::error::TaskQueueError;
use chrono::Utc;
use serde::Serialize;
use shared::types::{NodeId, Task, TaskId, TaskStatus, Urgency};
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub assigned: usize,
    pub completed: usize,
    pub failed: usize,
}

fn lane_index(urgency: Urgency) -> usize {
    match urgency {
        Urgency::High => 0,
        Urgency::Normal => 1,
        Urgency::Low => 2,
    }
}

struct QueueInner {
    tasks: HashMap<TaskId, Task>,
    // One FIFO lane per urgency, drained high to low.
    lanes: [VecDeque<TaskId>; 3],
}

impl QueueInner {
    fn pending_count(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }
}

/// Coordinator-side task buffer. Tasks wait in urgency lanes until the
/// dispatch loop pulls them; the backing map keeps every task, terminal
/// ones included, so clients can poll results by id.
pub struct TaskQueue {
    inner: RwLock<QueueInner>,
    capacity: usize,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(QueueInner {
                tasks: HashMap::new(),
                lanes: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            }),
            capacity,
        }
    }

    pub async fn enqueue(&self, task: Task) -> Result<TaskId, TaskQueueError> {
        let mut inner = self.inner.write().await;
        if inner.pending_count() >= self.capacity {
            return Err(TaskQueueError::QueueFull);
        }

        let id = task.id;
        let lane = lane_index(task.urgency);
        inner.lanes[lane].push_back(id);
        inner.tasks.insert(id, task);
        info!(task_id = %id, "enqueued task");
        Ok(id)
    }

    /// Pops the oldest task from the most urgent non-empty lane. Ids
    /// whose task is no longer pending (failed in bulk while queued) are
    /// skipped and dropped from the lane.
    pub async fn dequeue_next(&self) -> Option<Task> {
        let mut inner = self.inner.write().await;
        for lane in 0..inner.lanes.len() {
            while let Some(id) = inner.lanes[lane].pop_front() {
                match inner.tasks.get(&id) {
                    Some(task) if task.status == TaskStatus::Pending => {
                        return Some(task.clone());
                    }
                    _ => continue,
                }
            }
        }
        None
    }

    pub async fn mark_assigned(
        &self,
        id: TaskId,
        assignee: NodeId,
    ) -> Result<(), TaskQueueError> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or(TaskQueueError::TaskNotFound(id))?;
        if task.status != TaskStatus::Pending {
            return Err(TaskQueueError::InvalidTransition(id));
        }
        task.status = TaskStatus::Assigned;
        task.assigned_to = Some(assignee);
        Ok(())
    }

    /// Records a successful completion. Only an assigned task can
    /// complete; anything else is a stale report from a superseded
    /// assignment and is rejected.
    pub async fn mark_completed(
        &self,
        id: TaskId,
        output: Option<String>,
    ) -> Result<Task, TaskQueueError> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or(TaskQueueError::TaskNotFound(id))?;
        if task.status != TaskStatus::Assigned {
            return Err(TaskQueueError::StaleCompletion(id));
        }
        task.status = TaskStatus::Completed;
        task.completed_at = Some(Utc::now());
        task.output = output;
        info!(task_id = %id, "task completed");
        Ok(task.clone())
    }

    /// Marks a task failed. Failure is terminal; a failed task is never
    /// retried or re-enqueued.
    pub async fn mark_failed(&self, id: TaskId, reason: &str) -> Result<Task, TaskQueueError> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or(TaskQueueError::TaskNotFound(id))?;
        if matches!(task.status, TaskStatus::Completed | TaskStatus::Failed) {
            return Err(TaskQueueError::InvalidTransition(id));
        }
        task.status = TaskStatus::Failed;
        task.completed_at = Some(Utc::now());
        task.failure = Some(reason.to_string());
        warn!(task_id = %id, reason, "task failed");
        Ok(task.clone())
    }

    /// Puts an assigned task back at the tail of its lane, behind every
    /// task already waiting there. Used when the assignee is declared
    /// dead before reporting a result.
    pub async fn requeue(&self, id: TaskId) -> Result<(), TaskQueueError> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or(TaskQueueError::TaskNotFound(id))?;
        if task.status != TaskStatus::Assigned {
            return Err(TaskQueueError::InvalidTransition(id));
        }
        task.status = TaskStatus::Pending;
        task.assigned_to = None;
        let lane = lane_index(task.urgency);
        inner.lanes[lane].push_back(id);
        info!(task_id = %id, "requeued task after assignee loss");
        Ok(())
    }

    /// Fails every queued task in one sweep. Invoked on demotion, when
    /// this node loses the authority to dispatch what it buffered.
    pub async fn fail_pending(&self, reason: &str) -> usize {
        let mut inner = self.inner.write().await;
        let ids: Vec<TaskId> = inner.lanes.iter_mut().flat_map(|l| l.drain(..)).collect();
        let now = Utc::now();
        let mut failed = 0;
        for id in ids {
            if let Some(task) = inner.tasks.get_mut(&id) {
                if task.status == TaskStatus::Pending {
                    task.status = TaskStatus::Failed;
                    task.completed_at = Some(now);
                    task.failure = Some(reason.to_string());
                    failed += 1;
                }
            }
        }
        if failed > 0 {
            warn!(count = failed, reason, "failed pending tasks");
        }
        failed
    }

    pub async fn get(&self, id: TaskId) -> Option<Task> {
        self.inner.read().await.tasks.get(&id).cloned()
    }

    pub async fn list(&self, status_filter: Option<TaskStatus>) -> Vec<Task> {
        let inner = self.inner.read().await;
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|task| status_filter.map_or(true, |f| task.status == f))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    pub async fn stats(&self) -> QueueStats {
        let inner = self.inner.read().await;
        let mut stats = QueueStats::default();
        for task in inner.tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Assigned => stats.assigned += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.read().await.pending_count()
    }

    /// Drops everything. A freshly elected coordinator starts from an
    /// empty queue rather than inheriting state it cannot vouch for.
    pub async fn reset(&self) {
        let mut inner = self.inner.write().await;
        inner.tasks.clear();
        for lane in inner.lanes.iter_mut() {
            lane.clear();
        }
        info!("queue reset");
    }
}
