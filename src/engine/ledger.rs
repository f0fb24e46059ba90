use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::retry::RetryPolicy;
use crate::error::AppError;
use crate::models::booking::{
    BookingRequest, BookingStatus, Decision, DispatchMode, Place, Target, TargetState,
};
use crate::observability::metrics::Metrics;
use crate::store::{Persistence, StoreError};

#[derive(Debug, Clone)]
pub struct NewRequest {
    pub customer_id: Uuid,
    pub pickup: Place,
    pub dropoff: Place,
    pub fare: Decimal,
    pub distance_km: f64,
    pub mode: DispatchMode,
    pub targets: Vec<Uuid>,
    pub ttl: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RespondOutcome {
    Accepted(BookingRequest),
    Declined(BookingRequest),
    Rejected(BookingRequest),
    StaleResponse(BookingRequest),
}

impl RespondOutcome {
    pub fn request(&self) -> &BookingRequest {
        match self {
            RespondOutcome::Accepted(request)
            | RespondOutcome::Declined(request)
            | RespondOutcome::Rejected(request)
            | RespondOutcome::StaleResponse(request) => request,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExpireOutcome {
    Expired(BookingRequest),
    AlreadyResolved(BookingRequest),
}

pub struct Ledger {
    requests: DashMap<Uuid, Arc<Mutex<BookingRequest>>>,
    store: Arc<dyn Persistence>,
    retry: RetryPolicy,
    metrics: Metrics,
}

impl Ledger {
    pub fn new(store: Arc<dyn Persistence>, retry: RetryPolicy, metrics: Metrics) -> Self {
        Self {
            requests: DashMap::new(),
            store,
            retry,
            metrics,
        }
    }

    pub async fn create(&self, new: NewRequest) -> Result<BookingRequest, AppError> {
        validate(&new)?;

        let now = Utc::now();
        let ttl = chrono::Duration::from_std(new.ttl)
            .map_err(|err| AppError::Validation(format!("ttl out of range: {err}")))?;

        let request = BookingRequest {
            id: Uuid::new_v4(),
            customer_id: new.customer_id,
            pickup: new.pickup,
            dropoff: new.dropoff,
            fare: new.fare,
            distance_km: new.distance_km,
            mode: new.mode,
            targets: new
                .targets
                .into_iter()
                .map(|driver_id| Target {
                    driver_id,
                    state: TargetState::Pending,
                })
                .collect(),
            status: BookingStatus::Pending,
            winning_driver_id: None,
            ttl_secs: new.ttl.as_secs(),
            created_at: now,
            expires_at: now + ttl,
            resolved_at: None,
            version: 1,
        };

        self.retry
            .transient("insert_request", || self.store.insert_request(&request))
            .await?;

        self.requests
            .insert(request.id, Arc::new(Mutex::new(request.clone())));
        self.metrics
            .booking_requests_total
            .with_label_values(&[request.mode.as_str()])
            .inc();

        info!(
            request_id = %request.id,
            customer_id = %request.customer_id,
            mode = request.mode.as_str(),
            targets = request.targets.len(),
            "booking request created"
        );
        Ok(request)
    }

    pub async fn get(&self, id: Uuid) -> Result<BookingRequest, AppError> {
        let cell = self.cell(id).await?;
        let request = cell.lock().await;
        Ok(request.clone())
    }

    pub async fn refresh(&self, id: Uuid) -> Result<BookingRequest, AppError> {
        let cell = self.cell(id).await?;
        let mut current = cell.lock().await;
        if let Some(stored) = self.load(id).await? {
            if stored.version > current.version {
                debug!(request_id = %id, version = stored.version, "adopted newer stored request");
                *current = stored;
            }
            if current.status.is_resolved() {
                self.requests.remove(&id);
            }
        }
        Ok(current.clone())
    }

    pub async fn respond(
        &self,
        id: Uuid,
        driver_id: Uuid,
        decision: Decision,
    ) -> Result<RespondOutcome, AppError> {
        let cell = self.cell(id).await?;
        let mut current = cell.lock().await;

        if current.status.is_resolved() {
            debug!(request_id = %id, driver_id = %driver_id, status = current.status.as_str(), "stale response");
            return Ok(RespondOutcome::StaleResponse(current.clone()));
        }

        let target_state = current
            .target(driver_id)
            .map(|target| target.state)
            .ok_or_else(|| {
                AppError::Forbidden(format!("driver {driver_id} was not offered request {id}"))
            })?;
        if target_state != TargetState::Pending {
            return Ok(RespondOutcome::StaleResponse(current.clone()));
        }

        let now = Utc::now();
        let answer = match decision {
            Decision::Accept => TargetState::Accepted,
            Decision::Reject => TargetState::Rejected,
        };
        let mut next = current.clone();
        set_target(&mut next, driver_id, answer);

        match decision {
            Decision::Accept => {
                next.status = BookingStatus::Accepted;
                next.winning_driver_id = Some(driver_id);
                next.withdraw_pending();
                next.resolved_at = Some(now);
            }
            Decision::Reject => {
                let everyone_declined = next
                    .targets
                    .iter()
                    .all(|target| target.state == TargetState::Rejected);
                if next.mode == DispatchMode::Direct || everyone_declined {
                    next.status = BookingStatus::Rejected;
                    next.resolved_at = Some(now);
                }
            }
        }
        next.version = current.version + 1;

        if let Err(err) = self.persist(&next, current.version).await {
            return match err {
                StoreError::VersionConflict { .. } => {
                    let stored = self.adopt_stored(&mut current).await?;
                    if stored.status.is_resolved() {
                        Ok(RespondOutcome::StaleResponse(stored))
                    } else {
                        Err(AppError::Conflict(format!(
                            "request {id} changed concurrently, retry"
                        )))
                    }
                }
                other => Err(other.into()),
            };
        }

        *current = next.clone();
        if next.status.is_resolved() {
            self.requests.remove(&id);
        }

        let outcome = match next.status {
            BookingStatus::Accepted => RespondOutcome::Accepted(next),
            BookingStatus::Rejected => RespondOutcome::Rejected(next),
            _ => RespondOutcome::Declined(next),
        };

        match &outcome {
            RespondOutcome::Accepted(r) | RespondOutcome::Rejected(r) => {
                self.record_resolution(r);
            }
            RespondOutcome::Declined(_) => {
                info!(request_id = %id, driver_id = %driver_id, "broadcast target declined");
            }
            RespondOutcome::StaleResponse(_) => {}
        }

        Ok(outcome)
    }

    pub async fn expire(&self, id: Uuid) -> Result<ExpireOutcome, AppError> {
        let cell = self.cell(id).await?;
        let mut current = cell.lock().await;

        if current.status.is_resolved() {
            return Ok(ExpireOutcome::AlreadyResolved(current.clone()));
        }

        let mut next = current.clone();
        next.status = BookingStatus::Expired;
        next.withdraw_pending();
        next.resolved_at = Some(Utc::now());
        next.version = current.version + 1;

        if let Err(err) = self.persist(&next, current.version).await {
            return match err {
                StoreError::VersionConflict { .. } => {
                    let stored = self.adopt_stored(&mut current).await?;
                    if stored.status.is_resolved() {
                        Ok(ExpireOutcome::AlreadyResolved(stored))
                    } else {
                        Err(AppError::Conflict(format!(
                            "request {id} changed concurrently, retry"
                        )))
                    }
                }
                other => Err(other.into()),
            };
        }

        *current = next.clone();
        self.requests.remove(&id);
        self.record_resolution(&next);
        Ok(ExpireOutcome::Expired(next))
    }

    async fn cell(&self, id: Uuid) -> Result<Arc<Mutex<BookingRequest>>, AppError> {
        if let Some(cell) = self.requests.get(&id) {
            return Ok(cell.value().clone());
        }

        let stored = self
            .load(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("booking request {id} not found")))?;

        // resolved requests never change again; serve them without caching
        if stored.status.is_resolved() {
            return Ok(Arc::new(Mutex::new(stored)));
        }

        Ok(self
            .requests
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(stored)))
            .value()
            .clone())
    }

    async fn load(&self, id: Uuid) -> Result<Option<BookingRequest>, AppError> {
        Ok(self
            .retry
            .transient("load_request", || self.store.load_request(id))
            .await?)
    }

    async fn persist(&self, next: &BookingRequest, expected: u64) -> Result<(), StoreError> {
        self.retry
            .commit_conditional(
                "update_request",
                next,
                expected,
                || self.store.update_request(next, expected),
                || self.store.load_request(next.id),
            )
            .await
    }

    async fn adopt_stored(&self, current: &mut BookingRequest) -> Result<BookingRequest, AppError> {
        let stored = self.load(current.id).await?.ok_or_else(|| {
            AppError::NotFound(format!("booking request {} not found", current.id))
        })?;
        warn!(
            request_id = %current.id,
            local_version = current.version,
            stored_version = stored.version,
            "request changed in store; adopting stored copy"
        );
        *current = stored.clone();
        if stored.status.is_resolved() {
            self.requests.remove(&current.id);
        }
        Ok(stored)
    }

    fn record_resolution(&self, request: &BookingRequest) {
        let outcome = request.status.as_str();
        self.metrics
            .booking_resolutions_total
            .with_label_values(&[outcome])
            .inc();

        if let Some(resolved_at) = request.resolved_at {
            let latency = (resolved_at - request.created_at)
                .to_std()
                .unwrap_or_default()
                .as_secs_f64();
            self.metrics
                .dispatch_latency_seconds
                .with_label_values(&[outcome])
                .observe(latency);
        }

        info!(
            request_id = %request.id,
            status = outcome,
            winning_driver_id = ?request.winning_driver_id,
            "booking request resolved"
        );
    }
}

fn set_target(request: &mut BookingRequest, driver_id: Uuid, state: TargetState) {
    if let Some(target) = request
        .targets
        .iter_mut()
        .find(|target| target.driver_id == driver_id)
    {
        target.state = state;
    }
}

fn validate(new: &NewRequest) -> Result<(), AppError> {
    if new.targets.is_empty() {
        return Err(AppError::Validation(
            "a request needs at least one target driver".to_string(),
        ));
    }
    if new.mode == DispatchMode::Direct && new.targets.len() != 1 {
        return Err(AppError::Validation(
            "a direct request targets exactly one driver".to_string(),
        ));
    }
    let unique: HashSet<&Uuid> = new.targets.iter().collect();
    if unique.len() != new.targets.len() {
        return Err(AppError::Validation(
            "target drivers must be distinct".to_string(),
        ));
    }
    if new.fare <= Decimal::ZERO {
        return Err(AppError::Validation("fare must be > 0".to_string()));
    }
    if new.ttl.is_zero() {
        return Err(AppError::Validation("ttl must be > 0".to_string()));
    }
    if !new.distance_km.is_finite() || new.distance_km < 0.0 {
        return Err(AppError::Validation(
            "distance must be a non-negative number".to_string(),
        ));
    }
    Ok(())
}
