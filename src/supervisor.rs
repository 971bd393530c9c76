//! Per-camera failover supervision.
//!
//! [`FailoverMachine`] holds every decision and is driven one event at a time.
//! The actor spawned by [`SupervisorHandle::spawn`] owns the machine, feeds it
//! timer ticks, commands and the results of the slow work it launched, and
//! carries out the actions the machine returns.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{interval_at, sleep_until, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::capture::{CaptureSession, SessionConnector, SessionEvent};
use crate::config::SupervisorConfig;
use crate::endpoint::{AddressingFacts, CameraEndpoint};
use crate::errors::{Result, StreamError};
use crate::planner::RoutePlanner;
use crate::relay::{RelayEndpoints, RelayEvent, RelaySession, StreamRelay};
use crate::routes::{ConnectionState, Route, RouteEntry, RouteProbeResult, RouteTable, RouteTier};

/// Snapshot of one camera as seen by API callers and the MQTT publisher.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraStatus {
    pub camera_id: String,
    pub name: String,
    pub state: ConnectionState,
    pub active_route: Option<Route>,
    pub active_tier: Option<RouteTier>,
    pub last_error: Option<String>,
    pub routes: Vec<RouteEntry>,
    pub endpoints: RelayEndpoints,
    pub streaming: bool,
    pub updated_at: DateTime<Utc>,
}

impl CameraStatus {
    pub fn initial(endpoint: &CameraEndpoint, endpoints: RelayEndpoints) -> Self {
        Self {
            camera_id: endpoint.id.clone(),
            name: endpoint.name.clone(),
            state: ConnectionState::Unconfigured,
            active_route: None,
            active_tier: None,
            last_error: None,
            routes: Vec::new(),
            endpoints,
            streaming: false,
            updated_at: Utc::now(),
        }
    }

    fn same_as(&self, other: &CameraStatus) -> bool {
        self.state == other.state
            && self.active_route == other.active_route
            && self.last_error == other.last_error
            && self.routes == other.routes
            && self.streaming == other.streaming
            && self.name == other.name
    }

    /// Differs in something a dashboard would alert on, not just fresher probe numbers.
    pub fn is_significant_change(&self, previous: &CameraStatus) -> bool {
        self.state != previous.state
            || self.active_route != previous.active_route
            || self.last_error != previous.last_error
            || self.streaming != previous.streaming
    }
}

/// Consecutive stream losses after which the camera reports `degraded` even
/// though its route still answers probes.
const STREAM_LOSS_LIMIT: u32 = 3;

/// `min(base * 2^attempts, ceiling)`
pub fn backoff_delay(base: Duration, ceiling: Duration, attempts: u32) -> Duration {
    let factor = 1u32 << attempts.min(20);
    base.saturating_mul(factor).min(ceiling)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Start,
    AddressingChanged,
    RetryRequested,
    BackoffExpired,
    Planned { epoch: u64, table: RouteTable },
    HealthTick,
    HealthChecked { epoch: u64, result: RouteProbeResult },
    FailoverProbed { epoch: u64, results: Vec<RouteProbeResult> },
    RestoreTick,
    RestoreProbed { epoch: u64, results: Vec<RouteProbeResult> },
    SessionOpened { epoch: u64 },
    SessionFailed { epoch: u64, error: String },
    /// Capture session lost or transcoder crashed.
    StreamLost { epoch: u64, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Plan { epoch: u64 },
    CheckHealth { epoch: u64, route: Route },
    ProbeForFailover { epoch: u64, routes: Vec<Route> },
    ProbeForRestore { epoch: u64, routes: Vec<Route> },
    OpenSession { epoch: u64, route: Route },
    /// Install the session opened for this epoch and attach the relay to it.
    Attach { epoch: u64 },
    Teardown,
    ScheduleRetry { delay: Duration },
    CancelRetry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Plan,
    /// Waiting out the backoff before rebuilding a lost stream.
    Rebuild,
    Health,
    Failover,
    Restore,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenReason {
    Initial,
    Failover,
    Restore,
    Rebuild,
}

pub struct FailoverMachine {
    camera_id: String,
    retry_base: Duration,
    retry_ceiling: Duration,
    state: ConnectionState,
    table: RouteTable,
    /// Bumped whenever an operation is superseded; results carry the epoch
    /// they were started under and are dropped when it no longer matches.
    epoch: u64,
    pending: Option<Pending>,
    opening: Option<OpenReason>,
    session_live: bool,
    health_failures: u32,
    retry_attempts: u32,
    /// Streams lost since the last health check that found a session live.
    stream_losses: u32,
    last_error: Option<String>,
}

impl FailoverMachine {
    pub fn new(camera_id: &str, settings: &SupervisorConfig) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            retry_base: settings.retry_base,
            retry_ceiling: settings.retry_ceiling,
            state: ConnectionState::Unconfigured,
            table: RouteTable::new(),
            epoch: 0,
            pending: None,
            opening: None,
            session_live: false,
            health_failures: 0,
            retry_attempts: 0,
            stream_losses: 0,
            last_error: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn table(&self) -> &RouteTable {
        &self.table
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn handle(&mut self, event: Event) -> Vec<Action> {
        let mut actions = Vec::new();
        match event {
            Event::Start => {
                actions.push(Action::CancelRetry);
                self.replan(&mut actions);
            }
            Event::AddressingChanged | Event::RetryRequested => {
                actions.push(Action::CancelRetry);
                self.retry_attempts = 0;
                self.stream_losses = 0;
                self.replan(&mut actions);
            }
            Event::BackoffExpired => match self.pending {
                Some(Pending::Rebuild) => self.check_active(&mut actions),
                None if self.state == ConnectionState::Unreachable => self.replan(&mut actions),
                _ => {}
            },
            Event::Planned { epoch, table } => {
                if !self.accepts(epoch, Pending::Plan) {
                    return actions;
                }
                self.pending = None;
                self.table = table;
                match self.table.best_reachable().cloned() {
                    Some(route) => self.open(route, OpenReason::Initial, &mut actions),
                    None => self.exhausted(&mut actions),
                }
            }
            Event::SessionOpened { epoch } => {
                if !self.accepts(epoch, Pending::Open) {
                    return actions;
                }
                self.pending = None;
                self.session_live = true;
                self.health_failures = 0;
                self.retry_attempts = 0;
                self.state = match self.opening.take() {
                    Some(OpenReason::Failover) => ConnectionState::FailedOver,
                    Some(OpenReason::Rebuild) if self.stream_losses >= STREAM_LOSS_LIMIT => {
                        ConnectionState::Degraded
                    }
                    _ => {
                        self.last_error = None;
                        ConnectionState::Connected
                    }
                };
                actions.push(Action::Attach { epoch });
            }
            Event::SessionFailed { epoch, error } => {
                if !self.accepts(epoch, Pending::Open) {
                    return actions;
                }
                self.pending = None;
                let reason = self.opening.take();
                warn!("Camera '{}': could not open capture session: {}", self.camera_id, error);
                if let Some(route) = self.table.active().cloned() {
                    self.table.record_probe(RouteProbeResult::unreachable(route, error.clone()));
                }
                self.last_error = Some(error);
                match self.table.best_reachable().cloned() {
                    Some(next) => {
                        let reason = match reason {
                            Some(OpenReason::Initial) => OpenReason::Initial,
                            _ => OpenReason::Failover,
                        };
                        self.open(next, reason, &mut actions);
                    }
                    None => self.exhausted(&mut actions),
                }
            }
            Event::HealthTick => {
                if self.pending.is_some() || !self.is_attached_state() {
                    return actions;
                }
                if let Some(route) = self.table.active().cloned() {
                    self.pending = Some(Pending::Health);
                    actions.push(Action::CheckHealth { epoch: self.epoch, route });
                }
            }
            Event::HealthChecked { epoch, result } => {
                if !self.accepts(epoch, Pending::Health) {
                    return actions;
                }
                self.pending = None;
                let Some(active) = self.table.active().cloned() else {
                    return actions;
                };
                if result.route != active {
                    return actions;
                }
                if result.reachable {
                    self.table.record_probe(result);
                    self.health_failures = 0;
                    if !self.session_live {
                        self.open(active, OpenReason::Rebuild, &mut actions);
                        return actions;
                    }
                    self.stream_losses = 0;
                    if self.state != ConnectionState::Connected {
                        info!("Camera '{}' healthy again on {}", self.camera_id, active);
                        self.state = ConnectionState::Connected;
                        self.last_error = None;
                    }
                } else {
                    self.health_failures += 1;
                    self.last_error = result.error.clone();
                    if self.health_failures >= 2 {
                        self.fail_over(result, &mut actions);
                    } else {
                        warn!("Camera '{}' missed a health check on {}", self.camera_id, active);
                        self.state = ConnectionState::Degraded;
                    }
                }
            }
            Event::FailoverProbed { epoch, results } => {
                if !self.accepts(epoch, Pending::Failover) {
                    return actions;
                }
                self.pending = None;
                for result in results {
                    self.table.record_probe(result);
                }
                match self.table.best_reachable().cloned() {
                    Some(route) => {
                        warn!("Camera '{}' failing over to {}", self.camera_id, route);
                        self.open(route, OpenReason::Failover, &mut actions);
                    }
                    None => self.replan(&mut actions),
                }
            }
            Event::RestoreTick => {
                if self.pending.is_some()
                    || !matches!(self.state, ConnectionState::Connected | ConnectionState::FailedOver)
                {
                    return actions;
                }
                let routes = self.table.higher_priority_than_active();
                if !routes.is_empty() {
                    self.pending = Some(Pending::Restore);
                    actions.push(Action::ProbeForRestore { epoch: self.epoch, routes });
                }
            }
            Event::RestoreProbed { epoch, results } => {
                if !self.accepts(epoch, Pending::Restore) {
                    return actions;
                }
                self.pending = None;
                let Some(active_tier) = self.table.active().map(Route::tier) else {
                    return actions;
                };
                for result in results {
                    self.table.record_probe(result);
                }
                if let Some(best) = self.table.best_reachable().cloned() {
                    if best.tier() < active_tier {
                        info!("Camera '{}' restoring to {}", self.camera_id, best);
                        self.teardown(&mut actions);
                        self.open(best, OpenReason::Restore, &mut actions);
                    }
                }
            }
            Event::StreamLost { epoch, reason } => {
                if epoch != self.epoch || !self.session_live {
                    return actions;
                }
                warn!("Camera '{}' stream lost: {}", self.camera_id, reason);
                self.teardown(&mut actions);
                self.epoch += 1;
                self.stream_losses = self.stream_losses.saturating_add(1);
                if self.stream_losses >= STREAM_LOSS_LIMIT {
                    self.state = ConnectionState::Degraded;
                    self.last_error = Some(format!("stream lost {} times in a row: {}", self.stream_losses, reason));
                } else {
                    self.last_error = Some(reason);
                }

                // The first loss is rebuilt at once, repeats wait out a growing delay
                if self.stream_losses == 1 {
                    self.check_active(&mut actions);
                } else {
                    let delay = backoff_delay(self.retry_base, self.retry_ceiling, self.stream_losses - 2);
                    warn!("Camera '{}' lost its stream {} times, rebuilding in {:?}", self.camera_id, self.stream_losses, delay);
                    self.pending = Some(Pending::Rebuild);
                    actions.push(Action::ScheduleRetry { delay });
                }
            }
        }
        actions
    }

    fn accepts(&self, epoch: u64, expected: Pending) -> bool {
        epoch == self.epoch && self.pending == Some(expected)
    }

    fn is_attached_state(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Degraded | ConnectionState::FailedOver
        )
    }

    /// Probe the active route before rebuilding on it; without one, plan again.
    fn check_active(&mut self, actions: &mut Vec<Action>) {
        match self.table.active().cloned() {
            Some(route) => {
                self.pending = Some(Pending::Health);
                actions.push(Action::CheckHealth { epoch: self.epoch, route });
            }
            None => self.replan(actions),
        }
    }

    fn teardown(&mut self, actions: &mut Vec<Action>) {
        if self.session_live {
            self.session_live = false;
            actions.push(Action::Teardown);
        }
    }

    fn replan(&mut self, actions: &mut Vec<Action>) {
        self.teardown(actions);
        self.epoch += 1;
        self.pending = Some(Pending::Plan);
        self.opening = None;
        self.health_failures = 0;
        self.state = ConnectionState::Probing;
        actions.push(Action::Plan { epoch: self.epoch });
    }

    fn open(&mut self, route: Route, reason: OpenReason, actions: &mut Vec<Action>) {
        if !self.table.set_active(&route) {
            self.exhausted(actions);
            return;
        }
        self.epoch += 1;
        self.pending = Some(Pending::Open);
        self.opening = Some(reason);
        actions.push(Action::OpenSession { epoch: self.epoch, route });
    }

    fn fail_over(&mut self, failed: RouteProbeResult, actions: &mut Vec<Action>) {
        let failed_route = failed.route.clone();
        warn!("Camera '{}' lost {} after consecutive health check failures", self.camera_id, failed_route);
        self.table.record_probe(failed);
        self.teardown(actions);
        self.epoch += 1;
        self.health_failures = 0;

        let remaining: Vec<Route> = self.table.routes().into_iter().filter(|r| r != &failed_route).collect();
        if remaining.is_empty() {
            self.replan(actions);
        } else {
            self.pending = Some(Pending::Failover);
            actions.push(Action::ProbeForFailover { epoch: self.epoch, routes: remaining });
        }
    }

    fn exhausted(&mut self, actions: &mut Vec<Action>) {
        self.teardown(actions);
        self.table.clear_active();
        self.pending = None;
        self.opening = None;
        self.state = ConnectionState::Unreachable;
        if self.table.is_empty() {
            self.last_error = Some("no addressing facts yield a route".to_string());
        } else if self.last_error.is_none() {
            self.last_error = Some(format!("none of {} route(s) reachable", self.table.len()));
        }

        let delay = backoff_delay(self.retry_base, self.retry_ceiling, self.retry_attempts);
        self.retry_attempts = self.retry_attempts.saturating_add(1);
        warn!("Camera '{}' unreachable, next attempt in {:?}", self.camera_id, delay);
        actions.push(Action::ScheduleRetry { delay });
    }
}

pub struct SupervisorDeps {
    pub planner: Arc<RoutePlanner>,
    pub connector: Arc<dyn SessionConnector>,
    pub relay: Arc<StreamRelay>,
    pub settings: SupervisorConfig,
}

enum Command {
    UpdateAddressing(AddressingFacts),
    Retry,
    Shutdown,
}

enum OpResult {
    Planned { epoch: u64, table: RouteTable },
    Health { epoch: u64, result: RouteProbeResult },
    Failover { epoch: u64, results: Vec<RouteProbeResult> },
    Restore { epoch: u64, results: Vec<RouteProbeResult> },
    Opened {
        epoch: u64,
        route: Route,
        result: Result<CaptureSession>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
    },
}

struct OpenedSession {
    epoch: u64,
    session: CaptureSession,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

struct ActiveStream {
    epoch: u64,
    session: CaptureSession,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    _relay: Option<RelaySession>,
}

/// Owner-side handle of a running supervisor.
pub struct SupervisorHandle {
    camera_id: String,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<CameraStatus>,
    task: tokio::task::JoinHandle<()>,
}

impl SupervisorHandle {
    pub fn spawn(endpoint: CameraEndpoint, deps: SupervisorDeps) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let initial = CameraStatus::initial(&endpoint, deps.relay.endpoints().clone());
        let (status_tx, status_rx) = watch::channel(initial);
        let (relay_events_tx, relay_events_rx) = mpsc::unbounded_channel();
        let camera_id = endpoint.id.clone();

        let actor = SupervisorActor {
            machine: FailoverMachine::new(&endpoint.id, &deps.settings),
            endpoint,
            planner: deps.planner,
            connector: deps.connector,
            relay: deps.relay,
            settings: deps.settings,
            status: status_tx,
            commands: commands_rx,
            ops: JoinSet::new(),
            stream: None,
            opened: None,
            relay_events_tx,
            relay_events: relay_events_rx,
            retry_at: None,
            reset_health: false,
        };
        let task = tokio::spawn(actor.run());

        Self { camera_id, commands: commands_tx, status: status_rx, task }
    }

    pub fn status(&self) -> CameraStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CameraStatus> {
        self.status.clone()
    }

    pub async fn update_addressing(&self, facts: AddressingFacts) -> Result<()> {
        self.send(Command::UpdateAddressing(facts)).await
    }

    pub async fn retry(&self) -> Result<()> {
        self.send(Command::Retry).await
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| StreamError::server(format!("supervisor for camera '{}' has stopped", self.camera_id)))
    }

    /// Stop timers, close the capture session and wait for the actor to exit.
    pub async fn shutdown(mut self) {
        let _ = self.commands.send(Command::Shutdown).await;
        if timeout(Duration::from_secs(5), &mut self.task).await.is_err() {
            warn!("Supervisor for camera '{}' did not stop in time, aborting", self.camera_id);
            self.task.abort();
        }
    }
}

struct SupervisorActor {
    endpoint: CameraEndpoint,
    machine: FailoverMachine,
    planner: Arc<RoutePlanner>,
    connector: Arc<dyn SessionConnector>,
    relay: Arc<StreamRelay>,
    settings: SupervisorConfig,
    status: watch::Sender<CameraStatus>,
    commands: mpsc::Receiver<Command>,
    ops: JoinSet<OpResult>,
    stream: Option<ActiveStream>,
    opened: Option<OpenedSession>,
    relay_events_tx: mpsc::UnboundedSender<RelayEvent>,
    relay_events: mpsc::UnboundedReceiver<RelayEvent>,
    retry_at: Option<Instant>,
    reset_health: bool,
}

impl SupervisorActor {
    async fn run(mut self) {
        info!("Supervisor for camera '{}' started", self.endpoint.id);
        let health_period = self.settings.health_interval;
        let restore_period = self.settings.restore_interval;
        let mut health = interval_at(Instant::now() + health_period, health_period);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut restore = interval_at(Instant::now() + restore_period, restore_period);
        restore.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.dispatch(Event::Start).await;

        loop {
            let retry_at = self.retry_at;
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::UpdateAddressing(facts)) => {
                        info!("Camera '{}' addressing changed", self.endpoint.id);
                        self.endpoint.addressing = facts;
                        self.dispatch(Event::AddressingChanged).await;
                    }
                    Some(Command::Retry) => self.dispatch(Event::RetryRequested).await,
                    Some(Command::Shutdown) | None => break,
                },
                Some(joined) = self.ops.join_next(), if !self.ops.is_empty() => match joined {
                    Ok(result) => self.on_op_result(result).await,
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => warn!("Operation for camera '{}' panicked: {}", self.endpoint.id, e),
                },
                _ = health.tick() => self.dispatch(Event::HealthTick).await,
                _ = restore.tick() => self.dispatch(Event::RestoreTick).await,
                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.retry_at = None;
                    self.dispatch(Event::BackoffExpired).await;
                }
                (epoch, event) = next_session_event(&mut self.stream) => {
                    if let SessionEvent::Lost { reason } = event {
                        self.dispatch(Event::StreamLost { epoch, reason }).await;
                    }
                }
                Some(RelayEvent::WorkerCrashed { epoch, reason }) = self.relay_events.recv() => {
                    let reason = format!("transcoder crashed: {}", reason);
                    self.dispatch(Event::StreamLost { epoch, reason }).await;
                }
            }

            if std::mem::take(&mut self.reset_health) {
                health.reset();
            }
        }

        self.stop();
    }

    async fn on_op_result(&mut self, result: OpResult) {
        match result {
            OpResult::Planned { epoch, table } => self.dispatch(Event::Planned { epoch, table }).await,
            OpResult::Health { epoch, result } => self.dispatch(Event::HealthChecked { epoch, result }).await,
            OpResult::Failover { epoch, results } => self.dispatch(Event::FailoverProbed { epoch, results }).await,
            OpResult::Restore { epoch, results } => self.dispatch(Event::RestoreProbed { epoch, results }).await,
            OpResult::Opened { epoch, route, result, events } => match result {
                Ok(session) => {
                    self.opened = Some(OpenedSession { epoch, session, events });
                    self.dispatch(Event::SessionOpened { epoch }).await;
                    if self.opened.take().is_some() {
                        debug!("Dropping superseded session for camera '{}' over {}", self.endpoint.id, route);
                    }
                }
                Err(e) => self.dispatch(Event::SessionFailed { epoch, error: e.to_string() }).await,
            },
        }
    }

    async fn dispatch(&mut self, event: Event) {
        let actions = self.machine.handle(event);
        for action in actions {
            self.execute(action).await;
        }
        self.publish();
    }

    async fn execute(&mut self, action: Action) {
        match action {
            Action::Plan { epoch } => {
                let planner = self.planner.clone();
                let endpoint = self.endpoint.clone();
                self.ops.spawn(async move {
                    OpResult::Planned { epoch, table: planner.plan(&endpoint).await }
                });
            }
            Action::CheckHealth { epoch, route } => {
                let planner = self.planner.clone();
                self.ops.spawn(async move {
                    OpResult::Health { epoch, result: planner.probe_route(&route).await }
                });
            }
            Action::ProbeForFailover { epoch, routes } => {
                let planner = self.planner.clone();
                self.ops.spawn(async move {
                    OpResult::Failover { epoch, results: planner.probe_routes(&routes).await }
                });
            }
            Action::ProbeForRestore { epoch, routes } => {
                let planner = self.planner.clone();
                self.ops.spawn(async move {
                    OpResult::Restore { epoch, results: planner.probe_routes(&routes).await }
                });
            }
            Action::OpenSession { epoch, route } => {
                let connector = self.connector.clone();
                let endpoint = self.endpoint.clone();
                let (events_tx, events) = mpsc::unbounded_channel();
                self.ops.spawn(async move {
                    let result = connector.open(&endpoint, &route, events_tx).await;
                    OpResult::Opened { epoch, route, result, events }
                });
            }
            Action::Attach { epoch } => {
                let opened = match self.opened.take() {
                    Some(opened) if opened.epoch == epoch => opened,
                    other => {
                        self.opened = other;
                        return;
                    }
                };
                let OpenedSession { epoch, mut session, events } = opened;
                let relay = match session.take_frames() {
                    Some(frames) => Some(self.relay.attach(frames, epoch, self.relay_events_tx.clone()).await),
                    None => None,
                };
                info!("Camera '{}' streaming over {}", self.endpoint.id, session.route());
                self.stream = Some(ActiveStream { epoch, session, events, _relay: relay });
                self.reset_health = true;
            }
            Action::Teardown => {
                if let Some(stream) = self.stream.take() {
                    debug!("Tearing down capture session for camera '{}' over {}", self.endpoint.id, stream.session.route());
                }
            }
            Action::ScheduleRetry { delay } => {
                self.retry_at = Some(Instant::now() + delay);
            }
            Action::CancelRetry => {
                self.retry_at = None;
            }
        }
    }

    fn snapshot(&self) -> CameraStatus {
        let table = self.machine.table();
        CameraStatus {
            camera_id: self.endpoint.id.clone(),
            name: self.endpoint.name.clone(),
            state: self.machine.state(),
            active_route: table.active().cloned(),
            active_tier: table.active().map(Route::tier),
            last_error: self.machine.last_error().map(str::to_string),
            routes: table.entries().to_vec(),
            endpoints: self.relay.endpoints().clone(),
            streaming: self.stream.is_some(),
            updated_at: Utc::now(),
        }
    }

    fn publish(&self) {
        let next = self.snapshot();
        self.status.send_if_modified(|current| {
            if current.same_as(&next) {
                return false;
            }
            if current.state != next.state {
                info!("Camera '{}': {} -> {}", next.camera_id, current.state, next.state);
            }
            *current = next;
            true
        });
    }

    fn stop(&mut self) {
        self.ops.abort_all();
        self.opened = None;
        self.stream = None;
        self.retry_at = None;
        info!("Supervisor for camera '{}' stopped", self.endpoint.id);
    }
}

async fn next_session_event(stream: &mut Option<ActiveStream>) -> (u64, SessionEvent) {
    if let Some(active) = stream {
        if let Some(event) = active.events.recv().await {
            return (active.epoch, event);
        }
    }
    std::future::pending().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::config::{CameraConfig, RelayConfig};
    use crate::endpoint::GatewayForwardFact;
    use crate::gateway_registry::{Gateway, GatewayRegistry, GatewayStatus, StaticGatewayRegistry};
    use crate::testing::{FakeConnector, FakeProber, FakeWorkerFactory};

    fn direct() -> Route {
        Route::Direct { addr: "192.0.2.10:554".parse().unwrap() }
    }

    fn overlay() -> Route {
        Route::Overlay { addr: "10.1.1.5:554".parse().unwrap() }
    }

    fn gateway() -> Route {
        Route::GatewayForward {
            gateway_id: "gw-1".to_string(),
            gateway_addr: "10.1.1.1:18800".parse().unwrap(),
            local_addr: "192.168.1.20:8800".parse().unwrap(),
        }
    }

    fn ok(route: Route, ms: u64) -> RouteProbeResult {
        RouteProbeResult::reachable(route, Duration::from_millis(ms))
    }

    fn down(route: Route) -> RouteProbeResult {
        RouteProbeResult::unreachable(route, "timed out")
    }

    fn machine() -> FailoverMachine {
        FailoverMachine::new("cam1", &SupervisorConfig::default())
    }

    fn assert_invariants(machine: &FailoverMachine) {
        if let Some(active) = machine.table().active() {
            let entry = machine.table().active_entry().expect("active route must be in the table");
            assert_eq!(&entry.route, active);
            assert!(entry.is_reachable(), "active route {} is not reachable", active);
        }
        if machine.table().is_empty() {
            assert!(machine.table().active().is_none());
        }
    }

    fn drive(machine: &mut FailoverMachine, event: Event) -> Vec<Action> {
        let actions = machine.handle(event);
        assert_invariants(machine);
        actions
    }

    /// Start and plan against `probes`, then confirm the session open.
    fn connected(probes: Vec<RouteProbeResult>) -> FailoverMachine {
        let mut m = machine();
        drive(&mut m, Event::Start);
        let epoch = m.epoch();
        let actions = drive(&mut m, Event::Planned { epoch, table: RouteTable::from_probes(probes) });
        assert!(matches!(actions.as_slice(), [Action::OpenSession { .. }]));
        let epoch = m.epoch();
        let actions = drive(&mut m, Event::SessionOpened { epoch });
        assert_eq!(actions, vec![Action::Attach { epoch }]);
        m
    }

    fn health(m: &mut FailoverMachine, result: RouteProbeResult) -> Vec<Action> {
        let tick = drive(m, Event::HealthTick);
        assert!(matches!(tick.as_slice(), [Action::CheckHealth { .. }]), "{:?}", tick);
        let epoch = m.epoch();
        drive(m, Event::HealthChecked { epoch, result })
    }

    #[test]
    fn test_backoff_growth_is_capped() {
        let base = Duration::from_secs(5);
        let ceiling = Duration::from_secs(300);
        let delays: Vec<u64> = (0..9).map(|n| backoff_delay(base, ceiling, n).as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 80, 160, 300, 300, 300]);
        assert_eq!(backoff_delay(base, ceiling, u32::MAX), ceiling);
    }

    #[test]
    fn test_start_plans_and_connects_best_route() {
        let mut m = machine();
        assert_eq!(m.state(), ConnectionState::Unconfigured);

        let actions = drive(&mut m, Event::Start);
        assert_eq!(actions, vec![Action::CancelRetry, Action::Plan { epoch: 1 }]);
        assert_eq!(m.state(), ConnectionState::Probing);

        let table = RouteTable::from_probes(vec![down(direct()), ok(overlay(), 40)]);
        let actions = drive(&mut m, Event::Planned { epoch: 1, table });
        assert_eq!(actions, vec![Action::OpenSession { epoch: 2, route: overlay() }]);
        assert_eq!(m.table().active(), Some(&overlay()));

        assert_eq!(drive(&mut m, Event::SessionOpened { epoch: 2 }), vec![Action::Attach { epoch: 2 }]);
        assert_eq!(m.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_no_routes_goes_unreachable_without_session() {
        let mut m = machine();
        drive(&mut m, Event::Start);
        let actions = drive(&mut m, Event::Planned { epoch: 1, table: RouteTable::new() });
        assert_eq!(actions, vec![Action::ScheduleRetry { delay: Duration::from_secs(5) }]);
        assert_eq!(m.state(), ConnectionState::Unreachable);
        assert!(m.last_error().is_some());

        let actions = drive(&mut m, Event::BackoffExpired);
        assert_eq!(actions, vec![Action::Plan { epoch: 2 }]);
        let actions = drive(&mut m, Event::Planned { epoch: 2, table: RouteTable::new() });
        assert_eq!(actions, vec![Action::ScheduleRetry { delay: Duration::from_secs(10) }]);

        // Manual retry starts the backoff over
        drive(&mut m, Event::RetryRequested);
        let actions = drive(&mut m, Event::Planned { epoch: 3, table: RouteTable::new() });
        assert_eq!(actions, vec![Action::ScheduleRetry { delay: Duration::from_secs(5) }]);
    }

    #[test]
    fn test_single_missed_check_only_degrades() {
        let mut m = connected(vec![ok(overlay(), 40), ok(gateway(), 70)]);

        assert!(health(&mut m, down(overlay())).is_empty());
        assert_eq!(m.state(), ConnectionState::Degraded);
        assert_eq!(m.table().active(), Some(&overlay()));

        assert!(health(&mut m, ok(overlay(), 45)).is_empty());
        assert_eq!(m.state(), ConnectionState::Connected);
        assert_eq!(m.last_error(), None);
    }

    #[test]
    fn test_two_failures_fail_over_to_gateway() {
        let mut m = connected(vec![ok(overlay(), 40), ok(gateway(), 70)]);
        health(&mut m, down(overlay()));

        let actions = health(&mut m, down(overlay()));
        let epoch = m.epoch();
        assert_eq!(actions, vec![
            Action::Teardown,
            Action::ProbeForFailover { epoch, routes: vec![gateway()] },
        ]);
        assert_eq!(m.table().active(), None);

        let actions = drive(&mut m, Event::FailoverProbed { epoch, results: vec![ok(gateway(), 65)] });
        assert_eq!(actions, vec![Action::OpenSession { epoch: epoch + 1, route: gateway() }]);
        drive(&mut m, Event::SessionOpened { epoch: epoch + 1 });
        assert_eq!(m.state(), ConnectionState::FailedOver);

        assert!(health(&mut m, ok(gateway(), 60)).is_empty());
        assert_eq!(m.state(), ConnectionState::Connected);
        assert_eq!(m.table().active().map(Route::tier), Some(RouteTier::GatewayForward));
    }

    #[test]
    fn test_failover_never_reopens_old_route() {
        let mut m = connected(vec![ok(overlay(), 40), ok(gateway(), 70)]);
        let old_epoch = m.epoch();
        health(&mut m, down(overlay()));
        health(&mut m, down(overlay()));
        let failover_epoch = m.epoch();

        // Late result for the old route and ticks during the failover are ignored
        assert!(drive(&mut m, Event::HealthChecked { epoch: old_epoch, result: down(overlay()) }).is_empty());
        assert!(drive(&mut m, Event::HealthTick).is_empty());
        assert!(drive(&mut m, Event::StreamLost { epoch: old_epoch, reason: "eof".into() }).is_empty());

        drive(&mut m, Event::FailoverProbed { epoch: failover_epoch, results: vec![ok(gateway(), 65)] });
        drive(&mut m, Event::SessionOpened { epoch: failover_epoch + 1 });
        assert_eq!(m.state(), ConnectionState::FailedOver);

        // Another failure while failed over degrades the new route, nothing else
        let actions = health(&mut m, down(gateway()));
        assert!(actions.is_empty());
        assert_eq!(m.state(), ConnectionState::Degraded);
        assert_eq!(m.table().active(), Some(&gateway()));
        assert!(drive(&mut m, Event::HealthChecked { epoch: old_epoch, result: down(overlay()) }).is_empty());
    }

    #[test]
    fn test_failover_with_nothing_left_replans_then_unreachable() {
        let mut m = connected(vec![ok(overlay(), 40), down(gateway())]);
        health(&mut m, down(overlay()));
        health(&mut m, down(overlay()));
        let epoch = m.epoch();

        let actions = drive(&mut m, Event::FailoverProbed { epoch, results: vec![down(gateway())] });
        assert_eq!(actions, vec![Action::Plan { epoch: epoch + 1 }]);

        let table = RouteTable::from_probes(vec![down(overlay()), down(gateway())]);
        let actions = drive(&mut m, Event::Planned { epoch: epoch + 1, table });
        assert!(matches!(actions.as_slice(), [Action::ScheduleRetry { .. }]));
        assert_eq!(m.state(), ConnectionState::Unreachable);
    }

    #[test]
    fn test_restoration_promotes_back_within_one_cycle() {
        let mut m = connected(vec![down(overlay()), ok(gateway(), 70)]);
        assert_eq!(m.table().active(), Some(&gateway()));

        let actions = drive(&mut m, Event::RestoreTick);
        let epoch = m.epoch();
        assert_eq!(actions, vec![Action::ProbeForRestore { epoch, routes: vec![overlay()] }]);

        let actions = drive(&mut m, Event::RestoreProbed { epoch, results: vec![ok(overlay(), 35)] });
        assert_eq!(actions, vec![
            Action::Teardown,
            Action::OpenSession { epoch: epoch + 1, route: overlay() },
        ]);
        drive(&mut m, Event::SessionOpened { epoch: epoch + 1 });
        assert_eq!(m.state(), ConnectionState::Connected);
        assert_eq!(m.table().active(), Some(&overlay()));
    }

    #[test]
    fn test_restoration_keeps_route_while_better_one_is_down() {
        let mut m = connected(vec![down(overlay()), ok(gateway(), 70)]);
        drive(&mut m, Event::RestoreTick);
        let epoch = m.epoch();
        let actions = drive(&mut m, Event::RestoreProbed { epoch, results: vec![down(overlay())] });
        assert!(actions.is_empty());
        assert_eq!(m.table().active(), Some(&gateway()));

        // Already on the best tier: nothing to restore
        let mut m = connected(vec![ok(overlay(), 40)]);
        assert!(drive(&mut m, Event::RestoreTick).is_empty());
    }

    #[test]
    fn test_stream_loss_rebuilds_on_healthy_route() {
        let mut m = connected(vec![ok(overlay(), 40)]);
        let epoch = m.epoch();

        let actions = drive(&mut m, Event::StreamLost { epoch, reason: "camera closed the connection".into() });
        assert_eq!(actions, vec![Action::Teardown, Action::CheckHealth { epoch: epoch + 1, route: overlay() }]);

        let actions = drive(&mut m, Event::HealthChecked { epoch: epoch + 1, result: ok(overlay(), 42) });
        assert_eq!(actions, vec![Action::OpenSession { epoch: epoch + 2, route: overlay() }]);
        drive(&mut m, Event::SessionOpened { epoch: epoch + 2 });
        assert_eq!(m.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_stream_loss_on_dead_route_counts_as_failure() {
        let mut m = connected(vec![ok(overlay(), 40), ok(gateway(), 70)]);
        let epoch = m.epoch();
        drive(&mut m, Event::StreamLost { epoch, reason: "transcoder crashed".into() });
        drive(&mut m, Event::HealthChecked { epoch: epoch + 1, result: down(overlay()) });
        assert_eq!(m.state(), ConnectionState::Degraded);

        let actions = health(&mut m, down(overlay()));
        assert!(matches!(actions.as_slice(), [Action::ProbeForFailover { .. }]), "{:?}", actions);
    }

    /// Answer the pending rebuild check with a healthy overlay and open on it.
    fn rebuild(m: &mut FailoverMachine) {
        let epoch = m.epoch();
        let actions = drive(m, Event::HealthChecked { epoch, result: ok(overlay(), 42) });
        assert_eq!(actions, vec![Action::OpenSession { epoch: epoch + 1, route: overlay() }]);
        assert_eq!(drive(m, Event::SessionOpened { epoch: epoch + 1 }), vec![Action::Attach { epoch: epoch + 1 }]);
    }

    #[test]
    fn test_repeated_stream_loss_backs_off_and_degrades() {
        let mut m = connected(vec![ok(overlay(), 40)]);
        let crash = "transcoder crashed: failed to spawn ffmpeg";

        let epoch = m.epoch();
        let actions = drive(&mut m, Event::StreamLost { epoch, reason: crash.into() });
        assert_eq!(actions, vec![Action::Teardown, Action::CheckHealth { epoch: epoch + 1, route: overlay() }]);
        rebuild(&mut m);
        assert_eq!(m.state(), ConnectionState::Connected);

        let epoch = m.epoch();
        let actions = drive(&mut m, Event::StreamLost { epoch, reason: crash.into() });
        assert_eq!(actions, vec![Action::Teardown, Action::ScheduleRetry { delay: Duration::from_secs(5) }]);
        assert_eq!(m.last_error(), Some(crash));
        // Nothing runs until the backoff expires
        assert!(drive(&mut m, Event::HealthTick).is_empty());
        assert!(drive(&mut m, Event::RestoreTick).is_empty());
        let actions = drive(&mut m, Event::BackoffExpired);
        assert_eq!(actions, vec![Action::CheckHealth { epoch: epoch + 1, route: overlay() }]);
        rebuild(&mut m);

        let epoch = m.epoch();
        let actions = drive(&mut m, Event::StreamLost { epoch, reason: crash.into() });
        assert_eq!(actions, vec![Action::Teardown, Action::ScheduleRetry { delay: Duration::from_secs(10) }]);
        assert_eq!(m.state(), ConnectionState::Degraded);
        assert!(m.last_error().unwrap().starts_with("stream lost 3 times in a row"));
        drive(&mut m, Event::BackoffExpired);
        rebuild(&mut m);
        assert_eq!(m.state(), ConnectionState::Degraded, "a fresh session alone does not clear repeated losses");

        // A session that survives until the next health check resets the count
        assert!(health(&mut m, ok(overlay(), 40)).is_empty());
        assert_eq!(m.state(), ConnectionState::Connected);
        assert_eq!(m.last_error(), None);
        let epoch = m.epoch();
        let actions = drive(&mut m, Event::StreamLost { epoch, reason: crash.into() });
        assert_eq!(actions, vec![Action::Teardown, Action::CheckHealth { epoch: epoch + 1, route: overlay() }]);
    }

    #[test]
    fn test_manual_retry_clears_stream_loss_backoff() {
        let mut m = connected(vec![ok(overlay(), 40)]);
        for _ in 0..2 {
            let epoch = m.epoch();
            drive(&mut m, Event::StreamLost { epoch, reason: "eof".into() });
            drive(&mut m, Event::BackoffExpired);
            rebuild(&mut m);
        }

        let actions = drive(&mut m, Event::RetryRequested);
        assert_eq!(actions, vec![Action::CancelRetry, Action::Teardown, Action::Plan { epoch: m.epoch() }]);
        let epoch = m.epoch();
        drive(&mut m, Event::Planned { epoch, table: RouteTable::from_probes(vec![ok(overlay(), 40)]) });
        let epoch = m.epoch();
        drive(&mut m, Event::SessionOpened { epoch });

        let epoch = m.epoch();
        let actions = drive(&mut m, Event::StreamLost { epoch, reason: "eof".into() });
        assert_eq!(actions, vec![Action::Teardown, Action::CheckHealth { epoch: epoch + 1, route: overlay() }]);
    }

    #[test]
    fn test_failed_open_moves_to_next_route() {
        let mut m = machine();
        drive(&mut m, Event::Start);
        let table = RouteTable::from_probes(vec![ok(overlay(), 40), ok(gateway(), 70)]);
        drive(&mut m, Event::Planned { epoch: 1, table });

        let actions = drive(&mut m, Event::SessionFailed { epoch: 2, error: "login rejected".into() });
        assert_eq!(actions, vec![Action::OpenSession { epoch: 3, route: gateway() }]);
        drive(&mut m, Event::SessionOpened { epoch: 3 });
        assert_eq!(m.state(), ConnectionState::Connected);
        assert_eq!(m.last_error(), None);
    }

    #[test]
    fn test_addressing_change_tears_down_and_replans() {
        let mut m = connected(vec![ok(overlay(), 40)]);
        let actions = drive(&mut m, Event::AddressingChanged);
        assert_eq!(actions, vec![Action::CancelRetry, Action::Teardown, Action::Plan { epoch: m.epoch() }]);
        assert_eq!(m.state(), ConnectionState::Probing);
    }

    // Actor-level tests below run against the in-process fakes with paused time.

    struct Rig {
        prober: Arc<FakeProber>,
        connector: Arc<FakeConnector>,
        workers: Arc<FakeWorkerFactory>,
        relay: Arc<StreamRelay>,
    }

    impl Rig {
        fn new() -> Self {
            let workers = Arc::new(FakeWorkerFactory::new());
            let relay = Arc::new(StreamRelay::new(
                "cam1",
                Default::default(),
                "http://localhost:8080",
                &RelayConfig::default(),
                workers.clone(),
            ));
            Self { prober: Arc::new(FakeProber::new()), connector: Arc::new(FakeConnector::new()), workers, relay }
        }

        fn spawn(&self, config: CameraConfig) -> SupervisorHandle {
            let mut sites = HashMap::new();
            sites.insert("site-a".to_string(), vec![Gateway {
                gateway_id: "gw-1".to_string(),
                overlay_address: "10.1.1.1".parse().unwrap(),
                status: GatewayStatus::Online,
            }]);
            let registry: Arc<dyn GatewayRegistry> = Arc::new(StaticGatewayRegistry::new(sites));
            let deps = SupervisorDeps {
                planner: Arc::new(RoutePlanner::new(self.prober.clone(), registry)),
                connector: self.connector.clone(),
                relay: self.relay.clone(),
                settings: SupervisorConfig::default(),
            };
            SupervisorHandle::spawn(CameraEndpoint::from_config("cam1", &config).unwrap(), deps)
        }
    }

    fn site_camera() -> CameraConfig {
        let mut config = CameraConfig::default();
        config.site_id = Some("site-a".to_string());
        config.addressing.overlay = Some("10.1.1.5:554".parse().unwrap());
        config.addressing.gateway = Some(GatewayForwardFact {
            gateway_id: "gw-1".to_string(),
            forwarded_port: 18800,
            local_address: "192.168.1.20:8800".parse().unwrap(),
        });
        config
    }

    async fn wait_for(handle: &SupervisorHandle, mut pred: impl FnMut(&CameraStatus) -> bool) -> CameraStatus {
        let mut rx = handle.subscribe();
        let status = tokio::time::timeout(Duration::from_secs(600), rx.wait_for(|s| pred(s)))
            .await
            .expect("status never matched")
            .expect("supervisor stopped");
        (*status).clone()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_actor_overlay_to_gateway_failover() {
        let rig = Rig::new();
        rig.prober.set("10.1.1.5:554", Some(40));
        rig.prober.set("10.1.1.1:18800", Some(70));
        let handle = rig.spawn(site_camera());

        let status = wait_for(&handle, |s| s.state == ConnectionState::Connected && s.streaming).await;
        assert_eq!(status.active_tier, Some(RouteTier::Overlay));
        let endpoints = status.endpoints.clone();

        rig.prober.set("10.1.1.5:554", None);
        let status = wait_for(&handle, |s| {
            s.state == ConnectionState::Connected && s.active_tier == Some(RouteTier::GatewayForward)
        })
        .await;
        assert!(status.streaming);
        assert_eq!(status.endpoints, endpoints);
        assert_eq!(rig.connector.opened(), vec![overlay(), gateway()]);
        settle().await;
        assert_eq!(rig.connector.live_sessions(), 1);
        assert_eq!(rig.workers.spawned(), 1);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_actor_zero_facts_never_opens_session() {
        let rig = Rig::new();
        let handle = rig.spawn(CameraConfig::default());

        let status = wait_for(&handle, |s| s.state == ConnectionState::Unreachable).await;
        assert!(status.routes.is_empty());
        assert!(status.last_error.is_some());
        assert!(rig.connector.opened().is_empty());
        assert_eq!(rig.prober.calls(), 0);

        // Operator supplies a fact and the camera comes up
        rig.prober.set("10.1.1.5:554", Some(40));
        let mut facts = AddressingFacts::default();
        facts.overlay = Some("10.1.1.5:554".parse().unwrap());
        handle.update_addressing(facts).await.unwrap();
        wait_for(&handle, |s| s.state == ConnectionState::Connected).await;

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_actor_restores_after_network_heals() {
        let rig = Rig::new();
        rig.prober.set("10.1.1.5:554", None);
        rig.prober.set("10.1.1.1:18800", Some(70));
        let handle = rig.spawn(site_camera());
        wait_for(&handle, |s| s.active_tier == Some(RouteTier::GatewayForward) && s.streaming).await;

        rig.prober.set("10.1.1.5:554", Some(40));
        let status = wait_for(&handle, |s| s.active_tier == Some(RouteTier::Overlay) && s.streaming).await;
        assert_eq!(status.state, ConnectionState::Connected);
        settle().await;
        assert_eq!(rig.connector.live_sessions(), 1);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_actor_rebuilds_after_stream_loss() {
        let rig = Rig::new();
        rig.prober.set("10.1.1.5:554", Some(40));
        let handle = rig.spawn(site_camera());
        wait_for(&handle, |s| s.state == ConnectionState::Connected && s.streaming).await;

        rig.connector.lose_all("camera closed the connection");
        wait_for(&handle, |s| rig.connector.opened().len() == 2 && s.streaming).await;
        assert_eq!(rig.connector.opened(), vec![overlay(), overlay()]);
        settle().await;
        assert_eq!(rig.connector.live_sessions(), 1);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_actor_rebuilds_after_transcoder_crash() {
        let rig = Rig::new();
        rig.workers.crash_workers(true);
        rig.prober.set("10.1.1.5:554", Some(40));
        let handle = rig.spawn(site_camera());

        // The second crash in a row holds off the rebuild long enough to observe
        let status = wait_for(&handle, |s| {
            s.last_error.as_deref().is_some_and(|e| e.starts_with("transcoder crashed")) && !s.streaming
        })
        .await;
        assert_eq!(status.active_tier, Some(RouteTier::Overlay));

        rig.workers.crash_workers(false);
        wait_for(&handle, |s| s.state == ConnectionState::Connected && s.streaming && s.last_error.is_none()).await;
        settle().await;
        let opened = rig.connector.opened();
        assert!(opened.len() >= 2, "{:?}", opened);
        assert!(opened.iter().all(|route| route == &overlay()));
        assert_eq!(rig.connector.live_sessions(), 1);
        assert_eq!(rig.workers.live_workers(), 1);
        assert!(rig.workers.written() >= 1);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_actor_backs_off_when_transcoder_cannot_start() {
        let rig = Rig::new();
        rig.workers.fail_spawn(true);
        rig.prober.set("10.1.1.5:554", Some(40));
        let handle = rig.spawn(site_camera());

        let status = wait_for(&handle, |s| s.state == ConnectionState::Degraded).await;
        assert!(status.last_error.unwrap().contains("ffmpeg not found"));

        tokio::time::sleep(Duration::from_secs(60)).await;
        let opened = rig.connector.opened().len();
        assert!((3..10).contains(&opened), "{} sessions opened in a minute", opened);
        let status = handle.status();
        assert_ne!(status.state, ConnectionState::Connected);
        assert!(status.last_error.unwrap().contains("ffmpeg not found"));
        assert_eq!(rig.workers.spawned(), 0);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_actor_survives_stalled_transcoder() {
        let rig = Rig::new();
        rig.workers.stall_writes(true);
        rig.prober.set("10.1.1.5:554", Some(40));
        let handle = rig.spawn(site_camera());
        wait_for(&handle, |s| s.state == ConnectionState::Connected && s.streaming).await;

        // Rebuilding attaches the relay again while the first write is stuck
        rig.connector.lose_all("camera closed the connection");
        wait_for(&handle, |s| rig.connector.opened().len() == 2 && s.streaming).await;

        let status = wait_for(&handle, |s| {
            s.last_error.as_deref().is_some_and(|e| e.contains("did not accept a frame"))
        })
        .await;
        assert_eq!(status.active_tier, Some(RouteTier::Overlay));

        let calls = rig.prober.calls();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rig.prober.calls() > calls, "supervisor stopped probing");

        handle.shutdown().await;
        let stopped = tokio::time::timeout(Duration::from_secs(1), rig.relay.shutdown()).await;
        assert!(stopped.is_ok(), "relay shutdown waited on a stalled write");
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(rig.connector.live_sessions(), 0);
        assert_eq!(rig.workers.live_workers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_actor_refused_session_moves_to_next_route() {
        let rig = Rig::new();
        rig.prober.set("10.1.1.5:554", Some(40));
        rig.prober.set("10.1.1.1:18800", Some(70));
        rig.connector.refuse("10.1.1.5:554");
        let handle = rig.spawn(site_camera());

        let status = wait_for(&handle, |s| s.streaming).await;
        assert_eq!(status.active_tier, Some(RouteTier::GatewayForward));
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(rig.connector.opened(), vec![gateway()]);
        let overlay_entry = status.routes.iter().find(|entry| entry.route == overlay()).unwrap();
        assert!(!overlay_entry.is_reachable());

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_while_probing() {
        let rig = Rig::new();
        rig.prober.hang("10.1.1.5:554");
        let handle = rig.spawn(site_camera());
        wait_for(&handle, |s| s.state == ConnectionState::Probing).await;

        handle.shutdown().await;
        rig.relay.shutdown().await;
        settle().await;
        assert_eq!(rig.connector.live_sessions(), 0);
        assert_eq!(rig.workers.live_workers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_while_connected() {
        let rig = Rig::new();
        rig.prober.set("10.1.1.5:554", Some(40));
        let handle = rig.spawn(site_camera());
        wait_for(&handle, |s| s.state == ConnectionState::Connected && s.streaming).await;
        settle().await;
        assert_eq!(rig.workers.live_workers(), 1);

        handle.shutdown().await;
        rig.relay.shutdown().await;
        settle().await;
        assert_eq!(rig.connector.live_sessions(), 0);
        assert_eq!(rig.workers.live_workers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_while_failed_over() {
        let rig = Rig::new();
        rig.prober.set("10.1.1.5:554", Some(40));
        rig.prober.set("10.1.1.1:18800", Some(70));
        let handle = rig.spawn(site_camera());
        wait_for(&handle, |s| s.state == ConnectionState::Connected && s.streaming).await;

        rig.prober.set("10.1.1.5:554", None);
        wait_for(&handle, |s| s.state == ConnectionState::FailedOver).await;

        handle.shutdown().await;
        rig.relay.shutdown().await;
        settle().await;
        assert_eq!(rig.connector.live_sessions(), 0);
        assert_eq!(rig.workers.live_workers(), 0);
    }
}
