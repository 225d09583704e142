use crate::diagnostics::{Counters, Diagnostics};
use crate::election::{
    AnnounceOutcome, BallotOutcome, Election, ElectionPhase, TallyOutcome,
};
use crate::health::{HealthMonitor, HeartbeatOutcome};
use crate::load::{LoadReporter, LoadSampler};
use crate::sensor::{run_sensor_loop, SensorSource, SensorState};
use crate::transport::Transport;
use rand::Rng;
use serde::Serialize;
use shared::messages::{
    Announcement, ElectionBallot, FleetMessage, Heartbeat, TaskAssignment, TaskCompletion,
};
use shared::types::{
    LivenessState, LoadEstimate, NodeId, NodeInfo, Role, SensorReading, Task, TaskId, Term,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use task_queue::error::{DispatchError, TaskQueueError};
use task_queue::{DispatchPolicy, NodeView, QueueStats, TaskExecutor, TaskQueue};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{debug, error, info, warn};

/// Timing and threshold knobs for one node. Defaults match the deployed
/// fleet; tests shrink the intervals to milliseconds.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub heartbeat_interval: Duration,
    pub suspect_after: u32,
    pub dead_after: u32,
    pub load_sample_interval: Duration,
    pub load_ema_weight: f64,
    pub load_max_stale: u32,
    pub offload_threshold: u8,
    pub election_window: Duration,
    pub election_backoff_min: Duration,
    pub election_backoff_max: Duration,
    pub election_max_rounds: u32,
    pub dispatch_interval: Duration,
    pub announce_interval: Duration,
    pub queue_capacity: usize,
    pub sensor_poll_interval: Duration,
    pub sensor_backoff_base: Duration,
    pub sensor_backoff_cap: Duration,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(1000),
            suspect_after: 3,
            dead_after: 8,
            load_sample_interval: Duration::from_millis(5000),
            load_ema_weight: 0.3,
            load_max_stale: 3,
            offload_threshold: 70,
            election_window: Duration::from_millis(500),
            election_backoff_min: Duration::from_millis(200),
            election_backoff_max: Duration::from_millis(800),
            election_max_rounds: 5,
            dispatch_interval: Duration::from_millis(100),
            announce_interval: Duration::from_millis(2000),
            queue_capacity: 1024,
            sensor_poll_interval: Duration::from_millis(1000),
            sensor_backoff_base: Duration::from_millis(1000),
            sensor_backoff_cap: Duration::from_millis(30000),
        }
    }
}

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("this node is not the coordinator")]
    NotCoordinator { coordinator: Option<NodeId> },

    #[error("task queue is full")]
    QueueFull,

    #[error("task rejected: {0}")]
    Internal(String),
}

struct CoordinatorView {
    id: Option<NodeId>,
    term: Term,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerStatus {
    pub id: NodeId,
    pub location: Option<String>,
    pub role: Role,
    pub liveness: LivenessState,
    pub load: Option<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub location: String,
    pub role: Role,
    pub phase: ElectionPhase,
    pub term: Term,
    pub coordinator: Option<NodeId>,
    pub load: Option<u8>,
    pub uptime_secs: u64,
    pub queue: QueueStats,
    pub sensor_degraded: bool,
    pub last_reading: Option<SensorReading>,
    pub peers: Vec<PeerStatus>,
}

/// Handles to the spawned runtime loops. Aborting them is the only
/// shutdown a node needs; all state is in-memory.
pub struct NodeHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    pub fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// One fleet member: supervisor or location agent, the code path is the
/// same. Owns the local views (health table, load reporter, election
/// state, coordinator view) and drives the periodic loops against the
/// transport.
pub struct FleetNode<T: Transport> {
    info: NodeInfo,
    supervisor: NodeId,
    peers: HashMap<NodeId, NodeInfo>,
    config: FleetConfig,
    transport: Arc<T>,
    health: Arc<RwLock<HealthMonitor>>,
    load: Arc<RwLock<LoadReporter>>,
    sampler: Mutex<Box<dyn LoadSampler>>,
    election: Arc<RwLock<Election>>,
    coordinator: Arc<RwLock<CoordinatorView>>,
    queue: Arc<TaskQueue>,
    policy: DispatchPolicy,
    executor: Arc<TaskExecutor>,
    inflight: Mutex<HashMap<TaskId, NodeId>>,
    sensor: Option<Arc<dyn SensorSource>>,
    sensor_state: Arc<RwLock<SensorState>>,
    diagnostics: Arc<Diagnostics>,
    heartbeat_seq: AtomicU64,
    election_running: AtomicBool,
    started_at: Instant,
}

impl<T: Transport> FleetNode<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        info: NodeInfo,
        supervisor: NodeId,
        peers: Vec<NodeInfo>,
        config: FleetConfig,
        transport: T,
        sampler: Box<dyn LoadSampler>,
        executor: TaskExecutor,
        sensor: Option<Arc<dyn SensorSource>>,
    ) -> Arc<Self> {
        let mut health = HealthMonitor::new(config.suspect_after, config.dead_after);
        for peer in &peers {
            let role = if peer.id == supervisor {
                Role::Coordinator
            } else {
                Role::Worker
            };
            health.seed_peer(peer.id.clone(), role);
        }

        let peers: HashMap<NodeId, NodeInfo> =
            peers.into_iter().map(|p| (p.id.clone(), p)).collect();

        Arc::new(Self {
            election: Arc::new(RwLock::new(Election::new(info.id.clone()))),
            coordinator: Arc::new(RwLock::new(CoordinatorView {
                id: Some(supervisor.clone()),
                term: 0,
            })),
            health: Arc::new(RwLock::new(health)),
            load: Arc::new(RwLock::new(LoadReporter::new(
                config.load_ema_weight,
                config.load_max_stale,
            ))),
            sampler: Mutex::new(sampler),
            queue: Arc::new(TaskQueue::new(config.queue_capacity)),
            policy: DispatchPolicy::new(config.offload_threshold),
            executor: Arc::new(executor),
            inflight: Mutex::new(HashMap::new()),
            sensor,
            sensor_state: Arc::new(RwLock::new(SensorState::default())),
            diagnostics: Arc::new(Diagnostics::new()),
            heartbeat_seq: AtomicU64::new(0),
            election_running: AtomicBool::new(false),
            started_at: Instant::now(),
            transport: Arc::new(transport),
            info,
            supervisor,
            peers,
            config,
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.info.id
    }

    pub fn queue(&self) -> Arc<TaskQueue> {
        Arc::clone(&self.queue)
    }

    pub fn diagnostics(&self) -> Arc<Diagnostics> {
        Arc::clone(&self.diagnostics)
    }

    /// Location tag of a fleet member, if it is one we were configured with.
    pub fn location_of(&self, id: &NodeId) -> Option<String> {
        if *id == self.info.id {
            return Some(self.info.location.clone());
        }
        self.peers.get(id).map(|peer| peer.location.clone())
    }

    fn is_supervisor(&self) -> bool {
        self.info.id == self.supervisor
    }

    pub async fn is_coordinator(&self) -> bool {
        self.coordinator.read().await.id.as_ref() == Some(&self.info.id)
    }

    async fn current_role(&self) -> Role {
        if self.is_coordinator().await {
            Role::Coordinator
        } else {
            Role::Worker
        }
    }

    /// Spawns the runtime loops and announces this node to the fleet.
    pub async fn start(self: &Arc<Self>) -> NodeHandle {
        info!(node = %self.info.id, location = %self.info.location, "starting fleet node");

        let hello = Announcement {
            sender: self.info.id.clone(),
            role: if self.is_supervisor() {
                Role::Coordinator
            } else {
                Role::Worker
            },
            term: self.election.read().await.term(),
        };
        if let Err(e) = self.transport.broadcast(FleetMessage::Announce(hello)).await {
            debug!(error = %e, "startup announcement failed");
        }

        let mut tasks = Vec::new();
        let node = Arc::clone(self);
        tasks.push(tokio::spawn(async move { node.heartbeat_loop().await }));
        let node = Arc::clone(self);
        tasks.push(tokio::spawn(async move { node.monitor_loop().await }));
        let node = Arc::clone(self);
        tasks.push(tokio::spawn(async move { node.load_loop().await }));
        let node = Arc::clone(self);
        tasks.push(tokio::spawn(async move { node.receive_loop().await }));
        let node = Arc::clone(self);
        tasks.push(tokio::spawn(async move { node.dispatch_loop().await }));
        if self.is_supervisor() {
            let node = Arc::clone(self);
            tasks.push(tokio::spawn(async move { node.reclaim_loop().await }));
        }
        if let Some(source) = &self.sensor {
            tasks.push(tokio::spawn(run_sensor_loop(
                Arc::clone(source),
                Arc::clone(&self.sensor_state),
                Arc::clone(&self.diagnostics),
                self.config.sensor_poll_interval,
                self.config.sensor_backoff_base,
                self.config.sensor_backoff_cap,
            )));
        }

        NodeHandle { tasks }
    }

    /// Accepts a task into the local queue. Only the coordinator may
    /// take work; everyone else points the caller at who they believe
    /// coordinates.
    pub async fn submit(&self, task: Task) -> Result<TaskId, SubmitError> {
        if !self.is_coordinator().await {
            return Err(SubmitError::NotCoordinator {
                coordinator: self.coordinator.read().await.id.clone(),
            });
        }
        match self.queue.enqueue(task).await {
            Ok(id) => Ok(id),
            Err(TaskQueueError::QueueFull) => Err(SubmitError::QueueFull),
            Err(e) => Err(SubmitError::Internal(e.to_string())),
        }
    }

    pub async fn status(&self) -> NodeStatus {
        let health = self.health.read().await;
        let peers = health
            .snapshot()
            .into_iter()
            .map(|rec| PeerStatus {
                location: self.peers.get(&rec.id).map(|p| p.location.clone()),
                role: rec.role,
                liveness: rec.liveness,
                load: rec.load.as_percent(),
                id: rec.id,
            })
            .collect();
        drop(health);

        let election = self.election.read().await;
        let sensor = self.sensor_state.read().await;
        NodeStatus {
            node_id: self.info.id.clone(),
            location: self.info.location.clone(),
            role: self.current_role().await,
            phase: election.phase(),
            term: election.term(),
            coordinator: self.coordinator.read().await.id.clone(),
            load: self.load.read().await.current_load().as_percent(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            queue: self.queue.stats().await,
            sensor_degraded: sensor.degraded,
            last_reading: sensor.last_reading.clone(),
            peers,
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut ticker = interval(self.config.heartbeat_interval);
        loop {
            ticker.tick().await;
            let beacon = Heartbeat {
                sender: self.info.id.clone(),
                role: self.current_role().await,
                load: self.load.read().await.current_load(),
                seq: self.heartbeat_seq.fetch_add(1, Ordering::Relaxed) + 1,
            };
            if let Err(e) = self
                .transport
                .broadcast(FleetMessage::Heartbeat(beacon))
                .await
            {
                debug!(error = %e, "heartbeat broadcast failed");
                Counters::bump(&self.diagnostics.counters.transport_errors);
            }
        }
    }

    async fn monitor_loop(self: Arc<Self>) {
        let mut ticker = interval(self.config.heartbeat_interval);
        loop {
            ticker.tick().await;
            let transitions = self.health.write().await.tick();
            for t in transitions {
                info!(peer = %t.node, from = ?t.from, to = ?t.to, "peer liveness changed");
                self.diagnostics
                    .event(format!("peer {} is now {:?}", t.node, t.to))
                    .await;
                if t.to == LivenessState::Dead {
                    self.handle_peer_death(&t.node).await;
                }
            }
        }
    }

    async fn load_loop(self: Arc<Self>) {
        let mut ticker = interval(self.config.load_sample_interval);
        loop {
            ticker.tick().await;
            let sample = self.sampler.lock().await.sample();
            self.load.write().await.record_sample(sample);
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        loop {
            match self.transport.receive().await {
                Ok((from, message)) => self.handle_message(from, message).await,
                Err(crate::error::FleetError::ChannelClosed) => {
                    info!("transport closed, receive loop exiting");
                    return;
                }
                Err(e) => {
                    debug!(error = %e, "receive failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }

    /// Coordinator-only loop: drains the queue and places each task.
    async fn dispatch_loop(self: Arc<Self>) {
        let mut ticker = interval(self.config.dispatch_interval);
        loop {
            ticker.tick().await;
            if !self.is_coordinator().await {
                continue;
            }
            while let Some(task) = self.queue.dequeue_next().await {
                self.dispatch_task(task).await;
                if !self.is_coordinator().await {
                    break;
                }
            }
        }
    }

    /// Supervisor-only loop: whenever somebody else coordinates, claim a
    /// fresh term and announce. Interim leaders step down on seeing it.
    async fn reclaim_loop(self: Arc<Self>) {
        let mut ticker = interval(self.config.announce_interval);
        loop {
            ticker.tick().await;
            if self.is_coordinator().await {
                continue;
            }
            let term = self.election.write().await.claim_term();
            {
                let mut view = self.coordinator.write().await;
                view.id = Some(self.info.id.clone());
                view.term = term;
            }
            info!(term, "reclaiming coordination");
            self.diagnostics
                .event(format!("reclaiming coordination at term {term}"))
                .await;
            let ann = Announcement {
                sender: self.info.id.clone(),
                role: Role::Coordinator,
                term,
            };
            if let Err(e) = self.transport.broadcast(FleetMessage::Announce(ann)).await {
                debug!(error = %e, "reclaim announcement failed");
            }
        }
    }

    async fn handle_message(self: &Arc<Self>, from: NodeId, message: FleetMessage) {
        match message {
            FleetMessage::Heartbeat(hb) => self.handle_heartbeat(hb).await,
            FleetMessage::Ballot(ballot) => self.handle_ballot(ballot).await,
            FleetMessage::Vote(vote) => {
                if !self.election.write().await.record_vote(&vote) {
                    Counters::bump(&self.diagnostics.counters.stale_election_messages);
                    debug!(voter = %vote.voter, term = vote.term, "vote not counted");
                }
            }
            FleetMessage::Announce(ann) => self.handle_announcement(ann).await,
            FleetMessage::Assign(assignment) => self.handle_assignment(from, assignment).await,
            FleetMessage::Complete(completion) => self.handle_completion(completion).await,
        }
    }

    async fn handle_heartbeat(&self, hb: Heartbeat) {
        let outcome = self.health.write().await.record_heartbeat(&hb);
        match outcome {
            HeartbeatOutcome::Stale => {
                Counters::bump(&self.diagnostics.counters.stale_heartbeats);
            }
            HeartbeatOutcome::Recovered => {
                info!(peer = %hb.sender, "peer recovered");
                self.diagnostics
                    .event(format!("peer {} recovered", hb.sender))
                    .await;
            }
            HeartbeatOutcome::Accepted => {}
        }
    }

    async fn handle_ballot(self: &Arc<Self>, ballot: ElectionBallot) {
        let candidate = ballot.candidate.clone();
        let term = ballot.term;
        let outcome = self.election.write().await.observe_ballot(ballot);
        match outcome {
            BallotOutcome::OpensWindow { stepped_down } => {
                if stepped_down {
                    self.coordinator.write().await.id = None;
                    self.on_demoted(&format!("ballot for term {term} from {candidate}"))
                        .await;
                }
                debug!(candidate = %candidate, term, "election window open");
                let node = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(node.config.election_window).await;
                    node.cast_window_vote().await;
                });
            }
            BallotOutcome::Recorded => {}
            BallotOutcome::Stale => {
                Counters::bump(&self.diagnostics.counters.stale_election_messages);
            }
        }
    }

    /// Closes the collection window and delivers this node's vote. Both
    /// followers (via the window timer) and candidates (via the round
    /// loop) come through here.
    async fn cast_window_vote(self: &Arc<Self>) {
        let Some(vote) = self.election.write().await.close_window() else {
            return;
        };
        if vote.candidate == self.info.id {
            self.election.write().await.record_vote(&vote);
            return;
        }
        let candidate = vote.candidate.clone();
        debug!(candidate = %candidate, term = vote.term, "casting vote");
        if let Err(e) = self
            .transport
            .send(&candidate, FleetMessage::Vote(vote))
            .await
        {
            debug!(candidate = %candidate, error = %e, "vote delivery failed");
            Counters::bump(&self.diagnostics.counters.transport_errors);
        }
    }

    async fn handle_announcement(&self, ann: Announcement) {
        let outcome = self.election.write().await.observe_announcement(&ann);
        match outcome {
            AnnounceOutcome::Accepted | AnnounceOutcome::SteppedDown => {
                if outcome == AnnounceOutcome::SteppedDown {
                    self.coordinator.write().await.id = None;
                    self.on_demoted(&format!("{} announced term {}", ann.sender, ann.term))
                        .await;
                }
                if ann.role == Role::Coordinator {
                    let changed = {
                        let mut view = self.coordinator.write().await;
                        let changed = view.id.as_ref() != Some(&ann.sender);
                        view.id = Some(ann.sender.clone());
                        view.term = ann.term;
                        changed
                    };
                    if changed {
                        info!(coordinator = %ann.sender, term = ann.term, "coordinator changed");
                        self.diagnostics
                            .event(format!(
                                "coordinator is now {} (term {})",
                                ann.sender, ann.term
                            ))
                            .await;
                    }
                }
            }
            AnnounceOutcome::Stale => {
                Counters::bump(&self.diagnostics.counters.stale_election_messages);
                // Answer so a rebooted announcer learns the current term.
                let reply = Announcement {
                    sender: self.info.id.clone(),
                    role: self.current_role().await,
                    term: self.election.read().await.term(),
                };
                if let Err(e) = self
                    .transport
                    .send(&ann.sender, FleetMessage::Announce(reply))
                    .await
                {
                    debug!(peer = %ann.sender, error = %e, "stale-announce reply failed");
                }
            }
            AnnounceOutcome::Ignored => {}
        }
    }

    async fn handle_assignment(self: &Arc<Self>, from: NodeId, assignment: TaskAssignment) {
        info!(task_id = %assignment.task.id, from = %from, "accepted task assignment");
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = node.executor.execute(&assignment.task).await;
            node.send_completion(&assignment.coordinator, TaskCompletion {
                worker: node.info.id.clone(),
                outcome,
            })
            .await;
        });
    }

    async fn send_completion(&self, coordinator: &NodeId, completion: TaskCompletion) {
        let task_id = completion.outcome.task_id;
        for attempt in 0..3 {
            if attempt > 0 {
                tokio::time::sleep(self.config.heartbeat_interval).await;
            }
            match self
                .transport
                .send(coordinator, FleetMessage::Complete(completion.clone()))
                .await
            {
                Ok(()) => return,
                Err(e) => {
                    warn!(task_id = %task_id, attempt, error = %e, "completion delivery failed");
                    Counters::bump(&self.diagnostics.counters.transport_errors);
                }
            }
        }
        self.diagnostics
            .event(format!("gave up reporting completion of task {task_id}"))
            .await;
    }

    async fn handle_completion(&self, completion: TaskCompletion) {
        let task_id = completion.outcome.task_id;
        let expected = {
            let mut inflight = self.inflight.lock().await;
            match inflight.get(&task_id) {
                Some(worker) if worker == &completion.worker => {
                    inflight.remove(&task_id);
                    true
                }
                _ => false,
            }
        };
        if !expected {
            Counters::bump(&self.diagnostics.counters.stale_completions);
            debug!(task_id = %task_id, worker = %completion.worker, "dropping unexpected completion");
            return;
        }
        self.apply_outcome(completion.outcome).await;
    }

    async fn apply_outcome(&self, outcome: shared::types::TaskOutcome) {
        let task_id = outcome.task_id;
        if outcome.is_success() {
            match self.queue.mark_completed(task_id, outcome.output).await {
                Ok(task) => {
                    Counters::bump(&self.diagnostics.counters.tasks_completed);
                    if let Some(done) = task.completed_at {
                        let ms = (done - task.created_at).num_milliseconds().max(0) as u64;
                        self.diagnostics.record_latency_ms(ms).await;
                    }
                }
                Err(e) => {
                    Counters::bump(&self.diagnostics.counters.stale_completions);
                    debug!(task_id = %task_id, error = %e, "completion not applicable");
                }
            }
        } else {
            let reason = outcome.error.as_deref().unwrap_or("task failed");
            match self.queue.mark_failed(task_id, reason).await {
                Ok(_) => Counters::bump(&self.diagnostics.counters.tasks_failed),
                Err(e) => {
                    Counters::bump(&self.diagnostics.counters.stale_completions);
                    debug!(task_id = %task_id, error = %e, "failure not applicable");
                }
            }
        }
    }

    async fn handle_peer_death(self: &Arc<Self>, dead: &NodeId) {
        // Assignments running on the dead peer will never report back.
        let orphaned: Vec<TaskId> = {
            let mut inflight = self.inflight.lock().await;
            let ids: Vec<TaskId> = inflight
                .iter()
                .filter(|(_, worker)| *worker == dead)
                .map(|(id, _)| *id)
                .collect();
            for id in &ids {
                inflight.remove(id);
            }
            ids
        };
        let coordinating = self.is_coordinator().await;
        for id in orphaned {
            if coordinating {
                match self.queue.requeue(id).await {
                    Ok(()) => {
                        Counters::bump(&self.diagnostics.counters.tasks_reassigned);
                        self.diagnostics
                            .event(format!("requeued task {id} after losing {dead}"))
                            .await;
                    }
                    Err(e) => debug!(task_id = %id, error = %e, "could not requeue orphan"),
                }
            } else {
                match self.queue.mark_failed(id, "assignee unreachable").await {
                    Ok(_) => Counters::bump(&self.diagnostics.counters.tasks_failed),
                    Err(e) => debug!(task_id = %id, error = %e, "could not fail orphan"),
                }
            }
        }

        let lost_coordinator = {
            let mut view = self.coordinator.write().await;
            if view.id.as_ref() == Some(dead) {
                view.id = None;
                true
            } else {
                false
            }
        };
        if lost_coordinator {
            warn!(coordinator = %dead, "coordinator declared dead");
            self.diagnostics
                .event(format!("coordinator {dead} declared dead"))
                .await;
            if !self.is_supervisor() {
                self.trigger_election();
            }
        }
    }

    fn trigger_election(self: &Arc<Self>) {
        if self.election_running.swap(true, Ordering::SeqCst) {
            return;
        }
        Counters::bump(&self.diagnostics.counters.elections_started);
        let node = Arc::clone(self);
        tokio::spawn(async move {
            node.run_election().await;
            node.election_running.store(false, Ordering::SeqCst);
        });
    }

    async fn election_priority(&self) -> f64 {
        let uptime = self.started_at.elapsed().as_secs_f64();
        let load = match self.load.read().await.current_load() {
            LoadEstimate::Known(v) => v as f64,
            LoadEstimate::Unknown => 100.0,
        };
        uptime / (1.0 + load)
    }

    async fn run_election(self: &Arc<Self>) {
        let mut round: u32 = 0;
        loop {
            if self.coordinator.read().await.id.is_some() {
                debug!("coordinator known again, abandoning election");
                return;
            }
            // A spent vote means someone else's candidacy is settling.
            // Give the winner one window to announce before claiming a
            // term over it.
            if self.election.read().await.awaiting_result() {
                tokio::time::sleep(self.config.election_window * 3 / 2).await;
                if self.coordinator.read().await.id.is_some() {
                    return;
                }
            }
            round += 1;
            let priority = self.election_priority().await;
            let ballot = self.election.write().await.start_candidacy(priority);
            let term = ballot.term;
            info!(term, priority, round, "starting candidacy");
            self.diagnostics
                .event(format!("candidacy started for term {term}"))
                .await;
            if let Err(e) = self.transport.broadcast(FleetMessage::Ballot(ballot)).await {
                debug!(error = %e, "ballot broadcast failed");
            }

            tokio::time::sleep(self.config.election_window).await;
            self.cast_window_vote().await;
            // Grace for rival voters to close their windows and reply.
            tokio::time::sleep(self.config.election_window / 2).await;

            let population = 1 + self.health.read().await.alive_peer_count();
            let outcome = self.election.write().await.tally(population);
            match outcome {
                TallyOutcome::Won(term) => {
                    self.become_coordinator(term).await;
                    return;
                }
                TallyOutcome::Lost => {
                    info!(term, "candidacy superseded");
                    return;
                }
                TallyOutcome::Split => {
                    Counters::bump(&self.diagnostics.counters.election_splits);
                    if round >= self.config.election_max_rounds {
                        warn!(round, "coordination degraded: repeated split elections");
                        self.diagnostics
                            .event(format!("election split after round {round}"))
                            .await;
                    }
                    let wait_ms = {
                        let min = self.config.election_backoff_min.as_millis() as u64;
                        let max = self.config.election_backoff_max.as_millis() as u64;
                        rand::rng().random_range(min..=max.max(min))
                    };
                    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                }
            }
        }
    }

    async fn become_coordinator(&self, term: Term) {
        // Fresh authority starts from an empty queue.
        self.queue.reset().await;
        {
            let mut view = self.coordinator.write().await;
            view.id = Some(self.info.id.clone());
            view.term = term;
        }
        Counters::bump(&self.diagnostics.counters.elections_won);
        info!(term, "assuming coordination");
        self.diagnostics
            .event(format!("won election for term {term}, coordinating"))
            .await;
        let ann = Announcement {
            sender: self.info.id.clone(),
            role: Role::Coordinator,
            term,
        };
        if let Err(e) = self.transport.broadcast(FleetMessage::Announce(ann)).await {
            debug!(error = %e, "leadership announcement failed");
        }
    }

    /// Demotion: keep in-flight work draining, but everything still
    /// queued belongs to the new coordinator's era and fails terminally.
    async fn on_demoted(&self, reason: &str) {
        let failed = self.queue.fail_pending("coordinator changed").await;
        if failed > 0 {
            self.diagnostics
                .counters
                .tasks_failed
                .fetch_add(failed as u64, Ordering::Relaxed);
        }
        warn!(reason, failed_pending = failed, "stepped down from coordination");
        self.diagnostics
            .event(format!("stepped down ({reason}), failed {failed} pending tasks"))
            .await;
    }

    async fn candidate_views(&self) -> Vec<NodeView> {
        let mut views = vec![NodeView {
            id: self.info.id.clone(),
            location: self.info.location.clone(),
            load: self.load.read().await.current_load(),
            alive: true,
        }];
        let health = self.health.read().await;
        for (id, info) in &self.peers {
            let (load, alive) = match health.record(id) {
                Some(rec) => (rec.load, rec.liveness == LivenessState::Alive),
                None => (LoadEstimate::Unknown, false),
            };
            views.push(NodeView {
                id: id.clone(),
                location: info.location.clone(),
                load,
                alive,
            });
        }
        views
    }

    async fn dispatch_task(self: &Arc<Self>, task: Task) {
        let views = self.candidate_views().await;
        match self.policy.assign(&task, &self.info.id, &views) {
            Ok(target) if target == self.info.id => {
                if let Err(e) = self.queue.mark_assigned(task.id, target).await {
                    debug!(task_id = %task.id, error = %e, "dequeued task no longer assignable");
                    return;
                }
                Counters::bump(&self.diagnostics.counters.tasks_dispatched_local);
                info!(task_id = %task.id, "executing task locally");
                let node = Arc::clone(self);
                tokio::spawn(async move {
                    let outcome = node.executor.execute(&task).await;
                    node.apply_outcome(outcome).await;
                });
            }
            Ok(target) => {
                if let Err(e) = self.queue.mark_assigned(task.id, target.clone()).await {
                    debug!(task_id = %task.id, error = %e, "dequeued task no longer assignable");
                    return;
                }
                self.inflight.lock().await.insert(task.id, target.clone());
                let assignment = TaskAssignment {
                    coordinator: self.info.id.clone(),
                    task: task.clone(),
                };
                match self
                    .transport
                    .send(&target, FleetMessage::Assign(assignment))
                    .await
                {
                    Ok(()) => {
                        Counters::bump(&self.diagnostics.counters.tasks_dispatched_remote);
                        info!(task_id = %task.id, target = %target, "task dispatched");
                    }
                    Err(e) => {
                        warn!(task_id = %task.id, target = %target, error = %e, "assignment delivery failed, requeueing");
                        Counters::bump(&self.diagnostics.counters.transport_errors);
                        self.inflight.lock().await.remove(&task.id);
                        if let Err(e) = self.queue.requeue(task.id).await {
                            error!(task_id = %task.id, error = %e, "could not requeue task");
                        }
                    }
                }
            }
            Err(DispatchError::NoEligibleNode) => {
                warn!(task_id = %task.id, "no eligible node");
                if self.queue.mark_failed(task.id, "no eligible node").await.is_ok() {
                    Counters::bump(&self.diagnostics.counters.tasks_failed);
                }
                self.diagnostics
                    .event(format!("task {} failed: no eligible node", task.id))
                    .await;
            }
        }
    }
}
