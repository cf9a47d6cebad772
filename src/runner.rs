//! Machine Runner
//!
//! Async driver for the single timeline. One task owns the [`Machine`];
//! switch events, upward commands and timer deadlines are multiplexed with
//! `tokio::select!` and applied one at a time, so device state needs no
//! locks.
//!
//! Commands use the request / oneshot-response pattern.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info};

use crate::ball_controller::ControllerError;
use crate::core_types::{CoilId, ConsumerId, DeviceId, RequestId};
use crate::driver::{RuleChange, SwitchRule};
use crate::events::{ConfigFault, TransportEvent};
use crate::machine::{Machine, MachineSnapshot};
use crate::switch_feed::{MachineClock, SwitchFeed};
use crate::transfer::TransferError;

/// Runner error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RunnerError {
    #[error("Machine runner stopped")]
    Closed,

    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error(transparent)]
    Config(#[from] ConfigFault),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

impl RunnerError {
    pub fn code(&self) -> &'static str {
        match self {
            RunnerError::Closed => "RUNNER_CLOSED",
            RunnerError::Controller(e) => e.code(),
            RunnerError::Config(_) => "CONFLICTING_SWITCH_RULE",
            RunnerError::Transfer(e) => e.code(),
        }
    }
}

// ============================================================================
// Commands
// ============================================================================

/// Upward command with its response channel
#[derive(Debug)]
pub enum MachineCommand {
    RequestBalls {
        consumer: ConsumerId,
        destination: DeviceId,
        balls: u32,
        response_tx: oneshot::Sender<Result<RequestId, ControllerError>>,
    },
    CancelRequest {
        consumer: ConsumerId,
        request: RequestId,
        response_tx: oneshot::Sender<Result<(), ControllerError>>,
    },
    ClearJam {
        device: DeviceId,
        response_tx: oneshot::Sender<Result<(), TransferError>>,
    },
    ReconcileLedger {
        response_tx: oneshot::Sender<u32>,
    },
    SetSwitchRule {
        coil: CoilId,
        rule: SwitchRule,
        response_tx: oneshot::Sender<Result<RuleChange, ConfigFault>>,
    },
    RemoveSwitchRule {
        coil: CoilId,
        response_tx: oneshot::Sender<Option<SwitchRule>>,
    },
    Snapshot {
        response_tx: oneshot::Sender<MachineSnapshot>,
    },
}

/// Cloneable handle for the game / presentation layer
#[derive(Clone)]
pub struct MachineHandle {
    tx: mpsc::Sender<MachineCommand>,
}

impl MachineHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> MachineCommand,
    ) -> Result<T, RunnerError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(build(response_tx))
            .await
            .map_err(|_| RunnerError::Closed)?;
        response_rx.await.map_err(|_| RunnerError::Closed)
    }

    pub async fn request_balls(
        &self,
        consumer: &str,
        destination: &str,
        balls: u32,
    ) -> Result<RequestId, RunnerError> {
        let result = self
            .call(|response_tx| MachineCommand::RequestBalls {
                consumer: consumer.to_string(),
                destination: destination.to_string(),
                balls,
                response_tx,
            })
            .await?;
        Ok(result?)
    }

    pub async fn cancel_request(&self, consumer: &str, request: RequestId) -> Result<(), RunnerError> {
        let result = self
            .call(|response_tx| MachineCommand::CancelRequest {
                consumer: consumer.to_string(),
                request,
                response_tx,
            })
            .await?;
        Ok(result?)
    }

    pub async fn clear_jam(&self, device: &str) -> Result<(), RunnerError> {
        let result = self
            .call(|response_tx| MachineCommand::ClearJam {
                device: device.to_string(),
                response_tx,
            })
            .await?;
        Ok(result?)
    }

    pub async fn reconcile_ledger(&self) -> Result<u32, RunnerError> {
        self.call(|response_tx| MachineCommand::ReconcileLedger { response_tx })
            .await
    }

    pub async fn set_switch_rule(
        &self,
        coil: &str,
        rule: SwitchRule,
    ) -> Result<RuleChange, RunnerError> {
        let result = self
            .call(|response_tx| MachineCommand::SetSwitchRule {
                coil: coil.to_string(),
                rule,
                response_tx,
            })
            .await?;
        Ok(result?)
    }

    pub async fn remove_switch_rule(&self, coil: &str) -> Result<Option<SwitchRule>, RunnerError> {
        self.call(|response_tx| MachineCommand::RemoveSwitchRule {
            coil: coil.to_string(),
            response_tx,
        })
        .await
    }

    pub async fn snapshot(&self) -> Result<MachineSnapshot, RunnerError> {
        self.call(|response_tx| MachineCommand::Snapshot { response_tx })
            .await
    }
}

/// Receiver side of the command channel (owned by the runner)
pub struct CommandReceiver {
    rx: mpsc::Receiver<MachineCommand>,
}

/// Create a new command channel pair
pub fn command_channel(buffer: usize) -> (MachineHandle, CommandReceiver) {
    let (tx, rx) = mpsc::channel(buffer);
    (MachineHandle { tx }, CommandReceiver { rx })
}

// ============================================================================
// Runner
// ============================================================================

/// Deadline used when no timer is pending; the branch is disabled anyway
const IDLE_WAIT: Duration = Duration::from_secs(3600);

pub struct MachineRunner<F> {
    machine: Machine,
    feed: F,
    commands: CommandReceiver,
    clock: MachineClock,
    forward: Option<mpsc::UnboundedSender<TransportEvent>>,
}

impl<F: SwitchFeed> MachineRunner<F> {
    pub fn new(machine: Machine, feed: F, commands: CommandReceiver, clock: MachineClock) -> Self {
        Self {
            machine,
            feed,
            commands,
            clock,
            forward: None,
        }
    }

    /// Move every published event to `tx` after each step
    pub fn with_event_forwarding(mut self, tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        self.forward = Some(tx);
        self
    }

    /// Run until the switch feed ends, then hand the machine back
    pub async fn run(mut self) -> Machine {
        let mut commands_open = true;
        info!("Machine runner started");

        loop {
            let deadline = self
                .machine
                .next_deadline()
                .map(|at| self.clock.instant_at(at));
            let wake_at = deadline.unwrap_or_else(|| Instant::now() + IDLE_WAIT);

            // switches first: a command must see every transition sent before it
            tokio::select! {
                biased;

                event = self.feed.next_event() => match event {
                    Some(event) => self.machine.process_switch(&event),
                    None => {
                        info!("Switch feed ended");
                        break;
                    }
                },
                command = self.commands.rx.recv(), if commands_open => match command {
                    Some(command) => {
                        self.machine.advance_time(self.clock.now_ms());
                        self.handle(command);
                    }
                    None => {
                        debug!("Command channel closed");
                        commands_open = false;
                    }
                },
                _ = sleep_until(wake_at), if deadline.is_some() => {
                    self.machine.advance_time(self.clock.now_ms());
                }
            }
            self.forward_events();
        }

        self.forward_events();
        info!(now = self.machine.now(), "Machine runner stopped");
        self.machine
    }

    fn handle(&mut self, command: MachineCommand) {
        // a dropped response receiver only means the caller stopped waiting
        match command {
            MachineCommand::RequestBalls {
                consumer,
                destination,
                balls,
                response_tx,
            } => {
                let _ = response_tx.send(self.machine.request_balls(&consumer, &destination, balls));
            }
            MachineCommand::CancelRequest {
                consumer,
                request,
                response_tx,
            } => {
                let _ = response_tx.send(self.machine.cancel_request(&consumer, request));
            }
            MachineCommand::ClearJam {
                device,
                response_tx,
            } => {
                let _ = response_tx.send(self.machine.clear_jam(&device));
            }
            MachineCommand::ReconcileLedger { response_tx } => {
                let _ = response_tx.send(self.machine.reconcile_ledger());
            }
            MachineCommand::SetSwitchRule {
                coil,
                rule,
                response_tx,
            } => {
                let _ = response_tx.send(self.machine.set_switch_rule(&coil, rule));
            }
            MachineCommand::RemoveSwitchRule { coil, response_tx } => {
                let _ = response_tx.send(self.machine.remove_switch_rule(&coil));
            }
            MachineCommand::Snapshot { response_tx } => {
                let _ = response_tx.send(self.machine.snapshot());
            }
        }
    }

    fn forward_events(&self) {
        let Some(tx) = &self.forward else {
            return;
        };
        for event in self.machine.events().drain() {
            if tx.send(event).is_err() {
                debug!("Event consumer gone");
                return;
            }
        }
    }
}
