//! Ball Controller
//!
//! Machine-wide ledger and request router.
//!
//! # Responsibilities
//!
//! - Single authority over `total_known_balls` and `lost_balls`
//! - FIFO queue of "N balls to device D" requests, serviced by walking the
//!   eject graph backwards from D toward the trough
//! - Reconciliation of switch evidence nobody expected (captures, unexpected
//!   arrivals, vanished balls). Anything that could mean a ball is
//!   unaccounted for is raised as a fault, never absorbed silently.
//!
//! # Ledger
//!
//! ```text
//! total_known_balls == Σ device.ball_count + lost_balls
//! ```
//!
//! In-flight balls stay counted at their source until confirmed, so the
//! equation holds between any two events.

use std::collections::VecDeque;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::core_types::{ConsumerId, DeviceId, RequestId, Timestamp};
use crate::device::{BallDevice, DeviceState};
use crate::events::{DiscrepancyFault, DiscrepancyKind, EventSink, Fault, TransportEvent};
use crate::topology::MachineTopology;
use crate::transfer::{EjectRequirement, JamReport, Transfer};

/// Controller error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControllerError {
    #[error("Unknown device: {0}")]
    UnknownDevice(DeviceId),

    #[error("A request must ask for at least one ball")]
    ZeroBalls,

    #[error("No device can deliver balls to {0}")]
    Unreachable(DeviceId),

    #[error("Request not found: {0}")]
    RequestNotFound(RequestId),

    #[error("Request {request} was not issued by {consumer}")]
    NotIssuer {
        request: RequestId,
        consumer: ConsumerId,
    },
}

impl ControllerError {
    pub fn code(&self) -> &'static str {
        match self {
            ControllerError::UnknownDevice(_) => "UNKNOWN_DEVICE",
            ControllerError::ZeroBalls => "ZERO_BALLS",
            ControllerError::Unreachable(_) => "UNREACHABLE",
            ControllerError::RequestNotFound(_) => "REQUEST_NOT_FOUND",
            ControllerError::NotIssuer { .. } => "NOT_ISSUER",
        }
    }
}

/// One outstanding "I need N balls" request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BallRequest {
    pub id: RequestId,
    pub consumer: ConsumerId,
    pub destination: DeviceId,
    pub balls_needed: u32,
    /// Balls routed toward the destination but not yet there
    pub in_flight: u32,
    pub delivered: u32,
    pub requested_at: Timestamp,
}

impl BallRequest {
    /// Balls neither delivered nor on their way
    #[inline]
    pub fn undispatched(&self) -> u32 {
        self.balls_needed
            .saturating_sub(self.delivered + self.in_flight)
    }

    #[inline]
    pub fn is_satisfied(&self) -> bool {
        self.delivered >= self.balls_needed
    }
}

pub struct BallController {
    total_known_balls: u32,
    lost_balls: u32,
    requests: VecDeque<BallRequest>,
    next_request_id: RequestId,
    /// Every fault raised this run, for queries
    faults: Vec<Fault>,
    events: EventSink,
}

impl BallController {
    pub fn new(events: EventSink) -> Self {
        Self {
            total_known_balls: 0,
            lost_balls: 0,
            requests: VecDeque::new(),
            next_request_id: 1,
            faults: Vec::new(),
            events,
        }
    }

    pub fn total_known_balls(&self) -> u32 {
        self.total_known_balls
    }

    pub fn lost_balls(&self) -> u32 {
        self.lost_balls
    }

    /// Outstanding requests in service order
    pub fn requests(&self) -> impl Iterator<Item = &BallRequest> {
        self.requests.iter()
    }

    pub fn request(&self, id: RequestId) -> Option<&BallRequest> {
        self.requests.iter().find(|r| r.id == id)
    }

    pub fn faults(&self) -> &[Fault] {
        &self.faults
    }

    /// Σ ball_count + lost_balls == total_known_balls
    pub fn ledger_balanced(&self, topology: &MachineTopology) -> bool {
        topology.total_balls() + self.lost_balls == self.total_known_balls
    }

    // ============================================================
    // LEDGER
    // ============================================================

    /// Derive the ledger from the boot scan
    pub fn boot(&mut self, topology: &MachineTopology, balls_installed: Option<u32>, now: Timestamp) {
        let observed = topology.total_balls();
        self.total_known_balls = observed;
        self.lost_balls = 0;
        info!(total_known_balls = observed, "Ball ledger initialised");

        if let Some(installed) = balls_installed
            && installed != observed
        {
            self.record_fault(Fault::Discrepancy(DiscrepancyFault {
                kind: DiscrepancyKind::BootMismatch,
                device: None,
                known_balls: installed,
                observed_balls: observed,
                at: now,
            }));
        }
    }

    /// Operator acknowledgement: accept the current device counts as truth
    pub fn reconcile_ledger(&mut self, topology: &MachineTopology) -> u32 {
        let previous = self.total_known_balls;
        self.total_known_balls = topology.total_balls();
        self.lost_balls = 0;
        info!(
            previous,
            total = self.total_known_balls,
            "Ball ledger reconciled"
        );
        self.events.publish(TransportEvent::LedgerReconciled {
            previous,
            total: self.total_known_balls,
        });
        self.total_known_balls
    }

    /// Log, keep and publish a fault. Never halts anything.
    pub fn record_fault(&mut self, fault: Fault) {
        match &fault {
            Fault::Jam(jam) => error!(
                target: "FAULT",
                code = fault.code(),
                transfer_id = %jam.transfer_id,
                source = %jam.source,
                target_device = %jam.target,
                attempts = jam.attempts.len(),
                "Jam fault"
            ),
            Fault::Discrepancy(d) => warn!(
                target: "FAULT",
                code = fault.code(),
                device = ?d.device,
                known_balls = d.known_balls,
                observed_balls = d.observed_balls,
                "Ball count discrepancy"
            ),
            Fault::Configuration(c) => warn!(
                target: "FAULT",
                code = fault.code(),
                coil = %c.coil,
                "Configuration fault"
            ),
        }
        self.faults.push(fault.clone());
        self.events.publish(TransportEvent::Fault(fault));
    }

    fn discrepancy(
        &mut self,
        topology: &MachineTopology,
        kind: DiscrepancyKind,
        device: &str,
        now: Timestamp,
    ) {
        self.record_fault(Fault::Discrepancy(DiscrepancyFault {
            kind,
            device: Some(device.to_string()),
            known_balls: self.total_known_balls,
            observed_balls: topology.total_balls(),
            at: now,
        }));
    }

    // ============================================================
    // REQUESTS
    // ============================================================

    /// Queue a request for `balls` balls delivered into `destination`
    pub fn request_balls(
        &mut self,
        topology: &MachineTopology,
        consumer: &str,
        destination: &str,
        balls: u32,
        now: Timestamp,
    ) -> Result<RequestId, ControllerError> {
        if !topology.contains(destination) {
            return Err(ControllerError::UnknownDevice(destination.to_string()));
        }
        if balls == 0 {
            return Err(ControllerError::ZeroBalls);
        }
        if topology.suppliers_for(destination).is_empty() {
            return Err(ControllerError::Unreachable(destination.to_string()));
        }

        let id = self.next_request_id;
        self.next_request_id += 1;
        self.requests.push_back(BallRequest {
            id,
            consumer: consumer.to_string(),
            destination: destination.to_string(),
            balls_needed: balls,
            in_flight: 0,
            delivered: 0,
            requested_at: now,
        });

        info!(request = id, consumer, destination, balls, "Ball request queued");
        self.events.publish(TransportEvent::RequestQueued {
            request: id,
            consumer: consumer.to_string(),
            destination: destination.to_string(),
            balls,
        });
        Ok(id)
    }

    /// Withdraw a request. Only its issuer may cancel it.
    ///
    /// Queued ejects for it disappear; a ball already moving keeps moving and
    /// becomes generally available once it lands.
    pub fn cancel_request(
        &mut self,
        topology: &mut MachineTopology,
        consumer: &str,
        id: RequestId,
    ) -> Result<(), ControllerError> {
        let index = self
            .requests
            .iter()
            .position(|r| r.id == id)
            .ok_or(ControllerError::RequestNotFound(id))?;
        if self.requests[index].consumer != consumer {
            return Err(ControllerError::NotIssuer {
                request: id,
                consumer: consumer.to_string(),
            });
        }

        let ids = topology.ids().to_vec();
        let mut withdrawn = 0;
        for device_id in &ids {
            if let Some(device) = topology.device_mut(device_id) {
                withdrawn += device.withdraw_request(id);
            }
        }

        if let Some(request) = self.requests.remove(index) {
            info!(
                request = id,
                consumer,
                delivered = request.delivered,
                withdrawn,
                "Ball request cancelled"
            );
        }
        self.events.publish(TransportEvent::RequestCancelled {
            request: id,
            consumer: consumer.to_string(),
        });
        Ok(())
    }

    /// Dispatch undelivered balls in strict arrival order.
    ///
    /// Stops at the first request that cannot get a ball, so a later request
    /// never overtakes an earlier one. Returns the number of balls dispatched.
    pub fn service_requests(&mut self, topology: &mut MachineTopology) -> u32 {
        let mut dispatched = 0;
        for request in self.requests.iter_mut() {
            while request.undispatched() > 0 {
                if !Self::dispatch_one(topology, request) {
                    return dispatched;
                }
                dispatched += 1;
            }
        }
        dispatched
    }

    /// Route one ball toward `request.destination` from the nearest supplier:
    /// adopt an unclaimed ball already on the move, otherwise take a surplus
    /// ball
    fn dispatch_one(topology: &mut MachineTopology, request: &mut BallRequest) -> bool {
        let destination = request.destination.clone();
        for supplier in topology.suppliers_for(&destination) {
            let Some(device) = topology.device(&supplier) else {
                continue;
            };
            if device.is_jammed() {
                continue;
            }
            // a blocked device's balls are not moving; adopting them could
            // park the request behind a full upstream device
            let movable = device.state() != DeviceState::WaitingForTarget;
            let adopt_pending = movable
                && device.has_unclaimed_pending()
                && device
                    .pending_transfer()
                    .is_some_and(|t| topology.reaches(&t.target, &destination));

            let Some(device) = topology.device_mut(&supplier) else {
                continue;
            };
            let how = if adopt_pending && device.claim_pending(&destination, request.id) {
                "adopted in-flight transfer"
            } else if movable && device.claim_queued(&destination, request.id) {
                "adopted queued eject"
            } else if device.surplus() > 0 {
                device.add_requirement(EjectRequirement::routed(destination.clone(), request.id));
                "surplus ball"
            } else {
                continue;
            };

            request.in_flight += 1;
            debug!(
                request = request.id,
                supplier = %supplier,
                destination = %destination,
                how,
                "Ball dispatched"
            );
            return true;
        }
        false
    }

    fn release_slot(&mut self, id: RequestId) {
        if let Some(request) = self.requests.iter_mut().find(|r| r.id == id) {
            request.in_flight = request.in_flight.saturating_sub(1);
        }
    }

    fn deliver(&mut self, index: usize, now: Timestamp) {
        let Some(request) = self.requests.get_mut(index) else {
            return;
        };
        request.delivered += 1;
        if !request.is_satisfied() {
            return;
        }
        if let Some(request) = self.requests.remove(index) {
            info!(
                request = request.id,
                consumer = %request.consumer,
                destination = %request.destination,
                "Ball request fulfilled"
            );
            self.events.publish(TransportEvent::RequestFulfilled {
                request: request.id,
                consumer: request.consumer,
                destination: request.destination,
                at: now,
            });
        }
    }

    // ============================================================
    // TRANSFER OUTCOMES
    // ============================================================

    /// Credit a confirmed transfer to its request.
    ///
    /// Landing in the destination delivers the ball; landing in an
    /// intermediate device returns the requirement to forward from there.
    pub fn on_transfer_confirmed(
        &mut self,
        transfer: &Transfer,
        now: Timestamp,
    ) -> Option<EjectRequirement> {
        let request_id = transfer.request?;
        let index = self.requests.iter().position(|r| r.id == request_id)?;
        let destination = self.requests[index].destination.clone();

        if transfer.target != destination {
            return Some(EjectRequirement::routed(destination, request_id));
        }
        if let Some(request) = self.requests.get_mut(index) {
            request.in_flight = request.in_flight.saturating_sub(1);
        }
        self.deliver(index, now);
        None
    }

    /// Raise the jam and hand its routed balls back for re-dispatch.
    /// Unrouted ejects are simply dropped with the jam.
    pub fn on_jam(&mut self, report: &JamReport) {
        self.record_fault(Fault::Jam(report.fault.clone()));
        for requirement in report.requirements() {
            if let Some(id) = requirement.request {
                self.release_slot(id);
            }
        }
    }

    // ============================================================
    // RECONCILIATION
    // ============================================================

    /// A ball registered in `device` with no transfer heading there.
    ///
    /// Order of explanations: a drain capture from `captures_from`, then an
    /// outstanding request for this device. Whatever is left over is a
    /// discrepancy.
    pub fn on_unexpected_arrival(
        &mut self,
        topology: &mut MachineTopology,
        device_id: &str,
        now: Timestamp,
    ) {
        let source = topology
            .device(device_id)
            .and_then(BallDevice::captures_from)
            .cloned();
        if let Some(source) = source
            && topology
                .device_mut(&source)
                .is_some_and(BallDevice::remove_captured)
        {
            info!(from = %source, into = device_id, "Ball captured");
            self.events.publish(TransportEvent::BallCaptured {
                from: source,
                into: device_id.to_string(),
                at: now,
            });
            return;
        }

        let credited = match self
            .requests
            .iter()
            .position(|r| r.destination == device_id && r.undispatched() > 0)
        {
            Some(index) => {
                self.deliver(index, now);
                true
            }
            None => false,
        };

        let excess = topology.total_balls() + self.lost_balls > self.total_known_balls;
        if credited && !excess {
            return;
        }
        let kind = if self.lost_balls > 0 {
            self.lost_balls -= 1;
            DiscrepancyKind::RecoveredBall
        } else {
            DiscrepancyKind::UntrackedBall
        };
        self.discrepancy(topology, kind, device_id, now);
    }

    /// A ball left `device_id` with no transfer in progress
    pub fn on_ball_missing(
        &mut self,
        topology: &MachineTopology,
        device_id: &str,
        dropped: &[EjectRequirement],
        now: Timestamp,
    ) {
        self.lost_balls += 1;
        for requirement in dropped {
            if let Some(id) = requirement.request {
                self.release_slot(id);
            }
        }
        self.discrepancy(topology, DiscrepancyKind::LostBall, device_id, now);
    }

    /// A ball was sensed in a device that is already full
    pub fn on_capacity_exceeded(&mut self, topology: &MachineTopology, device_id: &str, now: Timestamp) {
        self.discrepancy(topology, DiscrepancyKind::UntrackedBall, device_id, now);
    }
}
