use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::delivery::DeliveryMachine;
use crate::engine::drivers::DriverRegistry;
use crate::engine::fanout::{Notifier, Transition};
use crate::engine::ledger::{ExpireOutcome, Ledger, NewRequest, RespondOutcome};
use crate::engine::proximity::ProximityIndex;
use crate::engine::timers::{TimerKind, Timers};
use crate::error::AppError;
use crate::models::booking::{BookingRequest, BookingStatus, Decision, DispatchMode, Place, TargetState};
use crate::models::delivery::Delivery;
use crate::models::driver::VehicleType;
use crate::models::session::{SearchFailure, SearchSession, SessionState};
use crate::observability::metrics::Metrics;
use crate::routing::{route_or_fallback, RoutingOracle, StraightLineRouter};

pub struct SearchSettings {
    pub search_radius_km: f64,
    pub radius_growth_factor: f64,
    pub max_search_attempts: u32,
    pub request_ttl: Duration,
    pub routing_timeout: Duration,
    pub session_retention: Duration,
}

#[derive(Debug, Clone)]
pub struct StartSearch {
    pub customer_id: Uuid,
    pub pickup: Place,
    pub dropoff: Place,
    pub fare: Decimal,
    pub vehicle: Option<VehicleType>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResponseOutcome {
    Assigned {
        request: BookingRequest,
        delivery: Delivery,
    },
    Declined { request: BookingRequest },
    Rejected { request: BookingRequest },
    NoLongerAvailable { request_id: Uuid },
}

// Who owns the announcement of a resolved request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Followed {
    Moved,
    AlreadyApplied,
    Detached,
}

pub struct Coordinator {
    sessions: Arc<DashMap<Uuid, Arc<Mutex<SearchSession>>>>,
    session_by_request: Arc<DashMap<Uuid, Uuid>>,
    drivers: Arc<DriverRegistry>,
    proximity: Arc<ProximityIndex>,
    ledger: Ledger,
    deliveries: Arc<DeliveryMachine>,
    notifier: Arc<Notifier>,
    timers: Arc<Timers>,
    router: Arc<dyn RoutingOracle>,
    fallback: StraightLineRouter,
    metrics: Metrics,
    settings: SearchSettings,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        drivers: Arc<DriverRegistry>,
        proximity: Arc<ProximityIndex>,
        ledger: Ledger,
        deliveries: Arc<DeliveryMachine>,
        notifier: Arc<Notifier>,
        timers: Arc<Timers>,
        router: Arc<dyn RoutingOracle>,
        fallback: StraightLineRouter,
        metrics: Metrics,
        settings: SearchSettings,
    ) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            session_by_request: Arc::new(DashMap::new()),
            drivers,
            proximity,
            ledger,
            deliveries,
            notifier,
            timers,
            router,
            fallback,
            metrics,
            settings,
        }
    }

    pub async fn start_search(&self, input: StartSearch) -> Result<SearchSession, AppError> {
        validate_trip(&input)?;

        let estimate = route_or_fallback(
            self.router.as_ref(),
            &self.fallback,
            self.settings.routing_timeout,
            input.pickup.point,
            input.dropoff.point,
        )
        .await;

        let now = Utc::now();
        let mut session = SearchSession {
            id: Uuid::new_v4(),
            customer_id: input.customer_id,
            pickup: input.pickup,
            dropoff: input.dropoff,
            fare: input.fare,
            distance_km: estimate.route.distance_m / 1_000.0,
            vehicle_filter: input.vehicle,
            radius_km: self.settings.search_radius_km,
            candidates: Vec::new(),
            state: SessionState::Searching,
            last_failure: None,
            requests: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        self.widen_search(&mut session);

        self.metrics.active_search_sessions.inc();
        self.sessions
            .insert(session.id, Arc::new(Mutex::new(session.clone())));

        info!(
            session_id = %session.id,
            customer_id = %session.customer_id,
            state = session.state.as_str(),
            candidates = session.candidates.len(),
            radius_km = session.radius_km,
            "search session started"
        );
        Ok(session)
    }

    pub async fn get_session(&self, id: Uuid) -> Result<SearchSession, AppError> {
        let cell = self.cell(id)?;

        let waiting_on = match cell.lock().await.state {
            SessionState::Waiting { request_id } => Some(request_id),
            _ => None,
        };

        if let Some(request_id) = waiting_on {
            let request = self.ledger.refresh(request_id).await?;
            if request.status.is_resolved()
                && self.apply_resolution(&request).await? == Followed::Moved
            {
                debug!(session_id = %id, request_id = %request_id, "reconciled missed resolution");
                self.timers.cancel(TimerKind::RequestExpiry, request_id);
                if let Some(transition) = resolution_transition(&request) {
                    self.notifier.notify(transition).await;
                }
            }
        }

        let session = cell.lock().await;
        Ok(session.clone())
    }

    pub async fn refresh_candidates(&self, id: Uuid) -> Result<SearchSession, AppError> {
        let cell = self.cell(id)?;
        let mut session = cell.lock().await;

        match session.state {
            SessionState::Searching | SessionState::Failed => {}
            other => {
                return Err(AppError::invalid_transition(other.as_str(), "refresh candidates"));
            }
        }

        self.widen_search(&mut session);
        Ok(session.clone())
    }

    pub async fn select_driver(
        self: &Arc<Self>,
        id: Uuid,
        driver_id: Uuid,
    ) -> Result<SearchSession, AppError> {
        let cell = self.cell(id)?;
        let mut session = cell.lock().await;
        ensure_searching(&session, "select a driver")?;

        if !session.candidates.iter().any(|c| c.driver_id == driver_id) {
            return Err(AppError::Validation(format!(
                "driver {driver_id} is not among the session's candidates"
            )));
        }
        if !self
            .drivers
            .get(driver_id)
            .is_some_and(|driver| driver.is_available())
        {
            return Err(AppError::Conflict(format!(
                "driver {driver_id} is no longer available"
            )));
        }

        self.dispatch(&mut session, DispatchMode::Direct, vec![driver_id])
            .await?;
        Ok(session.clone())
    }

    pub async fn broadcast_all(self: &Arc<Self>, id: Uuid) -> Result<SearchSession, AppError> {
        let cell = self.cell(id)?;
        let mut session = cell.lock().await;
        ensure_searching(&session, "broadcast")?;

        let targets: Vec<Uuid> = session
            .candidates
            .iter()
            .map(|c| c.driver_id)
            .filter(|driver_id| {
                self.drivers
                    .get(*driver_id)
                    .is_some_and(|driver| driver.is_available())
            })
            .collect();

        if targets.is_empty() {
            session.last_failure = Some(SearchFailure::NoDriversAvailable);
            session.updated_at = Utc::now();
            return Err(AppError::NoDriversAvailable);
        }

        self.dispatch(&mut session, DispatchMode::Broadcast, targets)
            .await?;
        Ok(session.clone())
    }

    pub async fn cancel_session(&self, id: Uuid) -> Result<SearchSession, AppError> {
        let cell = self.cell(id)?;
        let mut session = cell.lock().await;

        match session.state {
            SessionState::Cancelled => return Ok(session.clone()),
            SessionState::Accepted { .. } => {
                return Err(AppError::invalid_transition("accepted", "cancel the search"));
            }
            SessionState::Waiting { request_id } => {
                match self.ledger.expire(request_id).await? {
                    ExpireOutcome::Expired(request) => {
                        self.timers.cancel(TimerKind::RequestExpiry, request_id);
                        let withdrawn = request.drivers_in(TargetState::Withdrawn);
                        self.notifier
                            .notify(Transition::RequestCancelled {
                                request: &request,
                                withdrawn: &withdrawn,
                            })
                            .await;
                    }
                    ExpireOutcome::AlreadyResolved(request)
                        if request.status == BookingStatus::Accepted =>
                    {
                        // the acceptance is applied by whoever committed it
                        return Err(AppError::invalid_transition("accepted", "cancel the search"));
                    }
                    ExpireOutcome::AlreadyResolved(_) => {
                        self.timers.cancel(TimerKind::RequestExpiry, request_id);
                    }
                }
            }
            SessionState::Searching | SessionState::Failed => {}
        }

        self.set_state(&mut session, SessionState::Cancelled);
        info!(session_id = %id, "search session cancelled");
        Ok(session.clone())
    }

    pub async fn request(&self, id: Uuid) -> Result<BookingRequest, AppError> {
        self.ledger.get(id).await
    }

    pub async fn driver_respond(
        &self,
        request_id: Uuid,
        driver_id: Uuid,
        decision: Decision,
    ) -> Result<ResponseOutcome, AppError> {
        let outcome = match decision {
            Decision::Accept => self.accept(request_id, driver_id).await?,
            Decision::Reject => self.ledger.respond(request_id, driver_id, decision).await?,
        };

        match outcome {
            RespondOutcome::Accepted(request) => {
                self.timers.cancel(TimerKind::RequestExpiry, request_id);
                let delivery = self.deliveries.open(&request).await?;
                let followed = self.apply_resolution(&request).await?;
                self.announce(Transition::RequestAccepted { request: &request }, followed)
                    .await;
                info!(request_id = %request_id, driver_id = %driver_id, "driver assigned");
                Ok(ResponseOutcome::Assigned { request, delivery })
            }
            RespondOutcome::Rejected(request) => {
                self.timers.cancel(TimerKind::RequestExpiry, request_id);
                let followed = self.apply_resolution(&request).await?;
                self.announce(
                    Transition::RequestRejected {
                        request: &request,
                        driver_id,
                    },
                    followed,
                )
                .await;
                Ok(ResponseOutcome::Rejected { request })
            }
            RespondOutcome::Declined(request) => {
                self.notifier
                    .notify(Transition::TargetDeclined {
                        request: &request,
                        driver_id,
                    })
                    .await;
                Ok(ResponseOutcome::Declined { request })
            }
            RespondOutcome::StaleResponse(request) => {
                info!(
                    request_id = %request_id,
                    driver_id = %driver_id,
                    status = request.status.as_str(),
                    "late response; request no longer available"
                );
                self.notifier
                    .notify(Transition::StaleResponse {
                        request: &request,
                        driver_id,
                    })
                    .await;
                Ok(ResponseOutcome::NoLongerAvailable { request_id })
            }
        }
    }

    // The driver is reserved before the ledger commits so a broadcast winner
    // cannot already be holding another delivery.
    async fn accept(&self, request_id: Uuid, driver_id: Uuid) -> Result<RespondOutcome, AppError> {
        if let Err(claim_err) = self.drivers.try_claim(driver_id, request_id) {
            let request = self.ledger.get(request_id).await?;
            let answered = request.status.is_resolved()
                || request
                    .target(driver_id)
                    .is_some_and(|target| target.state != TargetState::Pending);
            return if answered {
                Ok(RespondOutcome::StaleResponse(request))
            } else {
                Err(claim_err)
            };
        }

        let outcome = self
            .ledger
            .respond(request_id, driver_id, Decision::Accept)
            .await
            .inspect_err(|_| self.drivers.release(driver_id, request_id))?;

        // a repeated accept from the winner must not unbind it
        if outcome.request().winning_driver_id != Some(driver_id) {
            self.drivers.release(driver_id, request_id);
        }
        Ok(outcome)
    }

    async fn on_request_expired(&self, request_id: Uuid) {
        self.timers.forget(TimerKind::RequestExpiry, request_id);

        let request = match self.ledger.expire(request_id).await {
            Ok(ExpireOutcome::Expired(request)) => request,
            Ok(ExpireOutcome::AlreadyResolved(request)) => {
                debug!(request_id = %request_id, status = request.status.as_str(), "expiry timer found request resolved");
                return;
            }
            Err(err) => {
                warn!(request_id = %request_id, error = %err, "failed to expire request; polling will reconcile");
                return;
            }
        };

        info!(request_id = %request_id, "booking request expired");
        let followed = match self.apply_resolution(&request).await {
            Ok(followed) => followed,
            Err(err) => {
                warn!(request_id = %request_id, error = %err, "failed to apply expiry to session");
                Followed::Detached
            }
        };
        self.announce(Transition::RequestExpired { request: &request }, followed)
            .await;
    }

    async fn dispatch(
        self: &Arc<Self>,
        session: &mut SearchSession,
        mode: DispatchMode,
        targets: Vec<Uuid>,
    ) -> Result<(), AppError> {
        let created = self
            .ledger
            .create(NewRequest {
                customer_id: session.customer_id,
                pickup: session.pickup.clone(),
                dropoff: session.dropoff.clone(),
                fare: session.fare,
                distance_km: session.distance_km,
                mode,
                targets,
                ttl: self.settings.request_ttl,
            })
            .await;

        let request = match created {
            Ok(request) => request,
            Err(err) => {
                if matches!(err, AppError::Transport(_)) {
                    session.last_failure = Some(SearchFailure::TransportFailure);
                    session.updated_at = Utc::now();
                }
                return Err(err);
            }
        };

        self.session_by_request.insert(request.id, session.id);
        self.arm_expiry(request.id);

        session.requests.push(request.id);
        session.last_failure = None;
        self.set_state(
            session,
            SessionState::Waiting {
                request_id: request.id,
            },
        );

        self.notifier
            .notify(Transition::RequestCreated { request: &request })
            .await;
        Ok(())
    }

    fn arm_expiry(self: &Arc<Self>, request_id: Uuid) {
        let coordinator = Arc::clone(self);
        self.timers.arm(
            TimerKind::RequestExpiry,
            request_id,
            self.settings.request_ttl,
            async move { coordinator.on_request_expired(request_id).await },
        );
    }

    // Only the caller that gets `Moved` back announces to the customer.
    async fn apply_resolution(&self, request: &BookingRequest) -> Result<Followed, AppError> {
        let Some(cell) = self
            .session_by_request
            .get(&request.id)
            .and_then(|entry| self.sessions.get(entry.value()).map(|s| s.value().clone()))
        else {
            return Ok(Followed::Detached);
        };
        let mut session = cell.lock().await;
        let session_id = session.id;

        match session.state {
            SessionState::Waiting { request_id } if request_id == request.id => {}
            SessionState::Cancelled => return Ok(Followed::Detached),
            _ => return Ok(Followed::AlreadyApplied),
        }

        match (request.status, request.winning_driver_id) {
            (BookingStatus::Accepted, Some(driver_id)) => {
                let delivery = self.deliveries.open(request).await?;
                session.last_failure = None;
                self.set_state(
                    &mut session,
                    SessionState::Accepted {
                        request_id: request.id,
                        driver_id,
                        delivery_id: delivery.id,
                    },
                );
            }
            (BookingStatus::Rejected, _) => {
                session.last_failure = Some(SearchFailure::DriverDeclined);
                self.set_state(&mut session, SessionState::Searching);
            }
            (BookingStatus::Expired, _) => {
                session.last_failure = Some(SearchFailure::NoDriversResponded);
                self.set_state(&mut session, SessionState::Searching);
            }
            _ => return Ok(Followed::AlreadyApplied),
        }

        debug!(
            session_id = %session_id,
            request_id = %request.id,
            state = session.state.as_str(),
            "session followed request resolution"
        );
        Ok(Followed::Moved)
    }

    async fn announce(&self, transition: Transition<'_>, followed: Followed) {
        match followed {
            Followed::Moved => self.notifier.notify(transition).await,
            Followed::Detached => self.notifier.notify_drivers(transition).await,
            Followed::AlreadyApplied => {
                debug!(?transition, "resolution already announced");
            }
        }
    }

    fn widen_search(&self, session: &mut SearchSession) {
        let now = Utc::now();
        let mut radius_km = self.settings.search_radius_km;

        for attempt in 1..=self.settings.max_search_attempts.max(1) {
            let candidates = self.proximity.find_candidates(
                session.pickup.point,
                radius_km,
                session.vehicle_filter,
                now,
            );
            session.radius_km = radius_km;

            if !candidates.is_empty() {
                session.candidates = candidates;
                session.last_failure = None;
                self.set_state(session, SessionState::Searching);
                return;
            }

            debug!(session_id = %session.id, attempt, radius_km, "no candidates in radius");
            if attempt < self.settings.max_search_attempts {
                radius_km *= self.settings.radius_growth_factor;
            }
        }

        session.candidates.clear();
        session.last_failure = Some(SearchFailure::NoDriversAvailable);
        self.set_state(session, SessionState::Failed);
    }

    fn set_state(&self, session: &mut SearchSession, state: SessionState) {
        let was_terminal = session.state.is_terminal();
        let was_idle = is_idle(session.state);
        session.state = state;
        session.updated_at = Utc::now();

        match (was_terminal, state.is_terminal()) {
            (false, true) => self.metrics.active_search_sessions.dec(),
            (true, false) => self.metrics.active_search_sessions.inc(),
            _ => {}
        }
        match (was_idle, is_idle(state)) {
            (false, true) => self.schedule_eviction(session.id),
            (true, false) => {
                self.timers.cancel(TimerKind::SessionEviction, session.id);
            }
            _ => {}
        }
    }

    // Idle sessions are dropped after the retention window, together with
    // their request index entries.
    fn schedule_eviction(&self, session_id: Uuid) {
        let sessions = Arc::clone(&self.sessions);
        let by_request = Arc::clone(&self.session_by_request);
        let timers = Arc::clone(&self.timers);

        self.timers.arm(
            TimerKind::SessionEviction,
            session_id,
            self.settings.session_retention,
            async move {
                timers.forget(TimerKind::SessionEviction, session_id);
                let Some(cell) = sessions.get(&session_id).map(|entry| entry.value().clone())
                else {
                    return;
                };
                let session = cell.lock().await;
                if !is_idle(session.state) {
                    return;
                }
                sessions.remove(&session_id);
                for request_id in &session.requests {
                    by_request.remove(request_id);
                }
                debug!(session_id = %session_id, state = session.state.as_str(), "search session evicted");
            },
        );
    }

    fn cell(&self, id: Uuid) -> Result<Arc<Mutex<SearchSession>>, AppError> {
        self.sessions
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| AppError::NotFound(format!("search session {id} not found")))
    }
}

fn is_idle(state: SessionState) -> bool {
    state.is_terminal() || state == SessionState::Failed
}

fn resolution_transition(request: &BookingRequest) -> Option<Transition<'_>> {
    match request.status {
        BookingStatus::Accepted => Some(Transition::RequestAccepted { request }),
        BookingStatus::Rejected => request
            .drivers_in(TargetState::Rejected)
            .last()
            .map(|driver_id| Transition::RequestRejected {
                request,
                driver_id: *driver_id,
            }),
        BookingStatus::Expired => Some(Transition::RequestExpired { request }),
        BookingStatus::Pending => None,
    }
}

fn ensure_searching(session: &SearchSession, action: &'static str) -> Result<(), AppError> {
    match session.state {
        SessionState::Searching => Ok(()),
        other => Err(AppError::invalid_transition(other.as_str(), action)),
    }
}

fn validate_trip(input: &StartSearch) -> Result<(), AppError> {
    for (label, place) in [("pickup", &input.pickup), ("dropoff", &input.dropoff)] {
        if place.address.trim().is_empty() {
            return Err(AppError::Validation(format!("{label} address cannot be empty")));
        }
        if !place.point.is_valid() {
            return Err(AppError::Validation(format!(
                "{label} coordinates out of range"
            )));
        }
    }
    if input.fare <= Decimal::ZERO {
        return Err(AppError::Validation("fare must be positive".to_string()));
    }
    Ok(())
}
