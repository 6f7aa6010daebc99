//! Day cycle
//!
//! Drives every participant through the phases of a simulated day:
//!
//! ```text
//! AwaitCapacity → BidBuilding → BidSubmitted → Clearing → Settlement → NextDay
//!        ▲                                                               │
//!        └───────────────────────────── next date ───────────────────────┘
//! ```
//!
//! Each phase is one broadcast trigger followed by a barrier: the controller
//! waits for one acknowledgement per participant until the phase timeout,
//! re-checks once after a grace period and then moves on. Participants that
//! never answered are reported as missing; the day continues without them.
//!
//! # Critical Invariants
//!
//! 1. Phases of a day run strictly in order, one barrier each
//! 2. The next day starts only after the settlement barrier
//! 3. A failing or silent participant never stops the run

use crate::agents::{spawn_agent, AgentContext, MarketParticipant};
use crate::config::ControllerConfig;
use crate::core::time::SimulationClock;
use crate::error::SimulationError;
use crate::logger::day_span;
use crate::models::event::{Event, EventLog};
use crate::orchestrator::checkpoint::{compute_config_hash, validate_snapshot, SimulationSnapshot};
use crate::transport::{ack_channel, AckStatus, Broadcast, Phase, PhaseAck, Trigger};
use chrono::NaiveDate;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParticipationFailure {
    #[error("{agent_id} did not answer {phase} on {date}")]
    SubmissionTimeout {
        agent_id: String,
        phase: Phase,
        date: NaiveDate,
    },

    #[error("{agent_id} failed {phase} on {date}: {reason}")]
    PhaseFailed {
        agent_id: String,
        phase: Phase,
        date: NaiveDate,
        reason: String,
    },
}

impl ParticipationFailure {
    pub fn agent_id(&self) -> &str {
        match self {
            ParticipationFailure::SubmissionTimeout { agent_id, .. }
            | ParticipationFailure::PhaseFailed { agent_id, .. } => agent_id,
        }
    }
}

/// Barrier outcome of one phase
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseReport {
    pub phase: Phase,
    pub date: NaiveDate,
    pub completed: Vec<String>,
    pub failed: Vec<ParticipationFailure>,
    pub missing: Vec<String>,
}

impl PhaseReport {
    fn new(phase: Phase, date: NaiveDate) -> Self {
        Self {
            phase,
            date,
            completed: Vec::new(),
            failed: Vec::new(),
            missing: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.missing.is_empty()
    }

    /// Failed and missing participants as failures
    pub fn failures(&self) -> Vec<ParticipationFailure> {
        let timeouts = self.missing.iter().map(|agent_id| ParticipationFailure::SubmissionTimeout {
            agent_id: agent_id.clone(),
            phase: self.phase,
            date: self.date,
        });
        self.failed.iter().cloned().chain(timeouts).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DayReport {
    pub date: NaiveDate,
    pub phases: Vec<PhaseReport>,
    /// Stopped before completing the day
    pub terminated: bool,
}

impl DayReport {
    pub fn phase(&self, phase: Phase) -> Option<&PhaseReport> {
        self.phases.iter().find(|p| p.phase == phase)
    }

    pub fn failures(&self) -> Vec<ParticipationFailure> {
        self.phases.iter().flat_map(PhaseReport::failures).collect()
    }

    pub fn is_clean(&self) -> bool {
        !self.terminated && self.phases.iter().all(PhaseReport::is_complete)
    }
}

/// Requests a stop at the next phase boundary
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct DayCycleController {
    broadcast: Broadcast,
    acks: mpsc::Receiver<PhaseAck>,
    participants: BTreeSet<String>,
    config: ControllerConfig,
    events: Arc<Mutex<EventLog>>,
    stop: StopHandle,
    run_id: Uuid,
}

impl DayCycleController {
    pub fn new(
        broadcast: Broadcast,
        acks: mpsc::Receiver<PhaseAck>,
        participants: BTreeSet<String>,
        config: ControllerConfig,
        events: Arc<Mutex<EventLog>>,
    ) -> Self {
        Self {
            broadcast,
            acks,
            participants,
            config,
            events,
            stop: StopHandle::default(),
            run_id: Uuid::new_v4(),
        }
    }

    pub fn participants(&self) -> &BTreeSet<String> {
        &self.participants
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    fn log(&self, event: Event) {
        self.events.lock().log(event);
    }

    /// Simulate `days` consecutive days from `start`
    pub async fn run(&mut self, start: NaiveDate, days: usize) -> Vec<DayReport> {
        let mut clock = SimulationClock::new(start);
        let mut reports = Vec::with_capacity(days);
        for _ in 0..days {
            let report = self.run_day(clock.current_date()).await;
            let terminated = report.terminated;
            reports.push(report);
            if terminated {
                break;
            }
            clock.advance_day();
        }
        reports
    }

    /// Run the phases of one day, stopping early if a stop was requested
    pub async fn run_day(&mut self, date: NaiveDate) -> DayReport {
        let span = day_span(&self.run_id, date);
        async {
            info!("day started");
            let mut phases = Vec::with_capacity(Phase::DAY.len());
            for phase in Phase::DAY {
                if self.stop.is_stopped() {
                    info!(%phase, "stop requested, terminating at phase boundary");
                    self.terminate(date);
                    return DayReport {
                        date,
                        phases,
                        terminated: true,
                    };
                }
                phases.push(self.run_phase(phase, date).await);
            }
            let report = DayReport {
                date,
                phases,
                terminated: false,
            };
            info!(failures = report.failures().len(), "day closed");
            report
        }
        .instrument(span)
        .await
    }

    /// Broadcast `phase` and wait for the barrier
    pub async fn run_phase(&mut self, phase: Phase, date: NaiveDate) -> PhaseReport {
        self.log(Event::PhaseStarted { date, phase });
        let delivered = self.broadcast.publish(Trigger { phase, date });
        debug!(%phase, delivered, "trigger published");

        let mut pending = self.participants.clone();
        let mut report = PhaseReport::new(phase, date);
        let deadline = Instant::now() + self.config.phase_timeout();
        self.collect(&mut pending, &mut report, deadline).await;
        if !pending.is_empty() {
            debug!(%phase, waiting = pending.len(), "grace re-check");
            let grace = Instant::now() + self.config.grace();
            self.collect(&mut pending, &mut report, grace).await;
        }

        for agent_id in pending {
            warn!(agent = %agent_id, %phase, %date, "no acknowledgement before timeout");
            self.log(Event::ParticipationFailure {
                date,
                agent_id: agent_id.clone(),
                phase,
                reason: "submission timeout".to_string(),
            });
            report.missing.push(agent_id);
        }

        self.log(Event::PhaseCompleted {
            date,
            phase,
            completed: report.completed.len(),
            failed: report.failed.len(),
            missing: report.missing.len(),
        });
        report
    }

    async fn collect(&mut self, pending: &mut BTreeSet<String>, report: &mut PhaseReport, deadline: Instant) {
        while !pending.is_empty() {
            let ack = match timeout_at(deadline, self.acks.recv()).await {
                Ok(Some(ack)) => ack,
                Ok(None) => {
                    warn!("acknowledgement channel closed");
                    return;
                }
                Err(_) => return,
            };
            if ack.phase != report.phase || ack.date != report.date || !pending.remove(&ack.agent_id) {
                debug!(agent = %ack.agent_id, phase = %ack.phase, date = %ack.date, "stale acknowledgement ignored");
                continue;
            }
            match ack.status {
                AckStatus::Completed => {
                    info!(agent = %ack.agent_id, phase = %ack.phase, date = %ack.date, "phase completed");
                    report.completed.push(ack.agent_id);
                }
                AckStatus::Failed(reason) => {
                    warn!(agent = %ack.agent_id, phase = %ack.phase, date = %ack.date, %reason, "phase failed");
                    self.log(Event::ParticipationFailure {
                        date: ack.date,
                        agent_id: ack.agent_id.clone(),
                        phase: ack.phase,
                        reason: reason.clone(),
                    });
                    report.failed.push(ParticipationFailure::PhaseFailed {
                        agent_id: ack.agent_id,
                        phase: ack.phase,
                        date: ack.date,
                        reason,
                    });
                }
            }
        }
    }

    /// Tell every participant to leave its loop
    pub fn terminate(&self, date: NaiveDate) {
        let delivered = self.broadcast.publish(Trigger {
            phase: Phase::Terminate,
            date,
        });
        self.log(Event::PhaseStarted {
            date,
            phase: Phase::Terminate,
        });
        info!(delivered, "terminate published");
    }
}

// ============================================================================
// Simulation handle
// ============================================================================

/// Participants spawned as tasks plus the controller driving them
pub struct MarketSimulation {
    ctx: AgentContext,
    controller: DayCycleController,
    handles: Vec<JoinHandle<()>>,
    clock: SimulationClock,
}

impl MarketSimulation {
    /// Spawn every participant; must be called inside a tokio runtime
    pub fn start(ctx: AgentContext, agents: Vec<Box<dyn MarketParticipant>>, start: NaiveDate) -> Self {
        Self::start_at(ctx, agents, SimulationClock::new(start))
    }

    /// Continue a checkpointed run: states are written back to the state
    /// store, where participants pick them up in `AwaitCapacity`
    pub fn resume(
        ctx: AgentContext,
        agents: Vec<Box<dyn MarketParticipant>>,
        snapshot: &SimulationSnapshot,
    ) -> Result<Self, SimulationError> {
        validate_snapshot(snapshot, &ctx.config)?;
        let closed = snapshot.current_date - chrono::Duration::days(1);
        for (agent_id, state) in &snapshot.asset_states {
            ctx.stores.states.set_state(closed, agent_id, state.clone())?;
        }
        info!(run = %snapshot.run_id, day = snapshot.current_day, "resuming from snapshot");
        Ok(Self::start_at(ctx, agents, snapshot.clock()))
    }

    fn start_at(ctx: AgentContext, agents: Vec<Box<dyn MarketParticipant>>, clock: SimulationClock) -> Self {
        let config = ctx.config.controller.clone();
        let broadcast = Broadcast::new(config.channel_capacity);
        let (ack_sender, ack_receiver) = ack_channel(config.channel_capacity);

        let mut participants = BTreeSet::new();
        let mut handles = Vec::with_capacity(agents.len());
        for agent in agents {
            participants.insert(agent.id().to_string());
            handles.push(spawn_agent(agent, ctx.clone(), broadcast.subscribe(), ack_sender.clone()));
        }
        drop(ack_sender);

        let controller = DayCycleController::new(broadcast, ack_receiver, participants, config, ctx.events.clone());
        info!(run = %controller.run_id(), participants = handles.len(), "simulation started");
        Self {
            ctx,
            controller,
            handles,
            clock,
        }
    }

    /// Run the next `days` days
    pub async fn run(&mut self, days: usize) -> Vec<DayReport> {
        let reports = self.controller.run(self.clock.current_date(), days).await;
        for report in &reports {
            if !report.terminated {
                self.clock.advance_day();
            }
        }
        reports
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.controller.stop_handle()
    }

    pub fn clock(&self) -> &SimulationClock {
        &self.clock
    }

    pub fn context(&self) -> &AgentContext {
        &self.ctx
    }

    pub fn events(&self) -> EventLog {
        self.ctx.events.lock().clone()
    }

    /// Capture asset states and the last cleared prices
    pub fn snapshot(&self) -> Result<SimulationSnapshot, SimulationError> {
        let stores = &self.ctx.stores;
        let mut asset_states = BTreeMap::new();
        for agent_id in self.controller.participants() {
            if let Some((_, state)) = stores.states.latest_state(agent_id)? {
                asset_states.insert(agent_id.clone(), state);
            }
        }
        let last_prices = match self.clock.current_day() {
            0 => Vec::new(),
            day => {
                let closed = SimulationClock::at_day(self.clock.start_date(), day - 1).current_date();
                stores
                    .clearing
                    .get_result(closed)?
                    .map(|r| r.prices())
                    .unwrap_or_default()
            }
        };
        Ok(SimulationSnapshot {
            run_id: self.controller.run_id(),
            start_date: self.clock.start_date(),
            current_day: self.clock.current_day(),
            current_date: self.clock.current_date(),
            asset_states,
            last_prices,
            config_hash: compute_config_hash(&*self.ctx.config)?,
        })
    }

    /// Terminate every participant and wait for its task
    pub async fn shutdown(self) {
        self.controller.terminate(self.clock.current_date());
        for handle in self.handles {
            if let Err(error) = handle.await {
                warn!(%error, "agent task ended abnormally");
            }
        }
        info!("simulation stopped");
    }
}
