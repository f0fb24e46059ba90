use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::drivers::DriverRegistry;
use crate::engine::fanout::{Notifier, Transition};
use crate::engine::retry::RetryPolicy;
use crate::engine::settlement::settle;
use crate::engine::timers::{TimerKind, Timers};
use crate::error::AppError;
use crate::models::booking::{BookingRequest, BookingStatus};
use crate::models::delivery::{Actor, ConfirmSource, Delivery, DeliveryStatus};
use crate::observability::metrics::Metrics;
use crate::store::{Persistence, StoreError};

pub struct DeliverySettings {
    pub commission_rate: Decimal,
    pub auto_confirm_after: Duration,
}

#[derive(Debug, Clone)]
pub struct Step {
    pub delivery: Delivery,
    pub from: DeliveryStatus,
    pub changed: bool,
}

pub struct DeliveryMachine {
    deliveries: DashMap<Uuid, Arc<Mutex<Delivery>>>,
    store: Arc<dyn Persistence>,
    retry: RetryPolicy,
    metrics: Metrics,
    drivers: Arc<DriverRegistry>,
    notifier: Arc<Notifier>,
    timers: Arc<Timers>,
    settings: DeliverySettings,
}

impl DeliveryMachine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Persistence>,
        retry: RetryPolicy,
        metrics: Metrics,
        drivers: Arc<DriverRegistry>,
        notifier: Arc<Notifier>,
        timers: Arc<Timers>,
        settings: DeliverySettings,
    ) -> Self {
        Self {
            deliveries: DashMap::new(),
            store,
            retry,
            metrics,
            drivers,
            notifier,
            timers,
            settings,
        }
    }

    pub async fn open(&self, request: &BookingRequest) -> Result<Delivery, AppError> {
        if let Some(existing) = self.find(request.id).await? {
            return Ok(existing);
        }

        let driver_id = match (request.status, request.winning_driver_id) {
            (BookingStatus::Accepted, Some(driver_id)) => driver_id,
            _ => {
                return Err(AppError::invalid_transition(
                    request.status.as_str(),
                    "open a delivery",
                ));
            }
        };

        let delivery = Delivery {
            id: request.id,
            customer_id: request.customer_id,
            driver_id,
            pickup: request.pickup.clone(),
            dropoff: request.dropoff.clone(),
            fare: request.fare,
            commission_rate: self.settings.commission_rate,
            status: DeliveryStatus::Accepted,
            accepted_at: request.resolved_at.unwrap_or(request.created_at),
            picked_up_at: None,
            in_transit_at: None,
            completed_at: None,
            confirmed_at: None,
            cancelled_at: None,
            cancelled_by: None,
            cancel_reason: None,
            settlement: None,
            version: 1,
        };

        self.retry
            .transient("insert_delivery", || self.store.insert_delivery(&delivery))
            .await?;

        let cell = self
            .deliveries
            .entry(delivery.id)
            .or_insert_with(|| Arc::new(Mutex::new(delivery.clone())))
            .value()
            .clone();

        info!(delivery_id = %delivery.id, driver_id = %driver_id, "delivery opened");
        let opened = cell.lock().await.clone();
        Ok(opened)
    }

    pub async fn get(&self, id: Uuid) -> Result<Delivery, AppError> {
        self.find(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("delivery {id} not found")))
    }

    pub async fn active_for_driver(&self, driver_id: Uuid) -> Result<Option<Delivery>, AppError> {
        let Some(delivery_id) = self
            .drivers
            .get(driver_id)
            .and_then(|driver| driver.active_delivery)
        else {
            return Ok(None);
        };

        Ok(self
            .find(delivery_id)
            .await?
            .filter(|delivery| delivery.status.is_active()))
    }

    pub async fn pick_up(&self, id: Uuid, driver_id: Uuid) -> Result<Delivery, AppError> {
        let step = self
            .transition(id, |d| {
                ensure_driver(d, driver_id)?;
                match d.status {
                    DeliveryStatus::Accepted => {
                        let mut next = d.clone();
                        next.status = DeliveryStatus::PickedUp;
                        next.picked_up_at = Some(Utc::now());
                        Ok(Some(next))
                    }
                    DeliveryStatus::PickedUp => Ok(None),
                    other => Err(AppError::invalid_transition(other.as_str(), "pick up")),
                }
            })
            .await?;

        self.announce_advance(&step).await;
        Ok(step.delivery)
    }

    pub async fn start_transit(&self, id: Uuid, driver_id: Uuid) -> Result<Delivery, AppError> {
        let step = self
            .transition(id, |d| {
                ensure_driver(d, driver_id)?;
                match d.status {
                    DeliveryStatus::PickedUp => {
                        let mut next = d.clone();
                        next.status = DeliveryStatus::InTransit;
                        next.in_transit_at = Some(Utc::now());
                        Ok(Some(next))
                    }
                    DeliveryStatus::InTransit => Ok(None),
                    other => Err(AppError::invalid_transition(other.as_str(), "start transit")),
                }
            })
            .await?;

        self.announce_advance(&step).await;
        Ok(step.delivery)
    }

    pub async fn complete(self: &Arc<Self>, id: Uuid, driver_id: Uuid) -> Result<Delivery, AppError> {
        let step = self
            .transition(id, |d| {
                ensure_driver(d, driver_id)?;
                match d.status {
                    DeliveryStatus::InTransit => {
                        let mut next = d.clone();
                        next.status = DeliveryStatus::Completed;
                        next.completed_at = Some(Utc::now());
                        Ok(Some(next))
                    }
                    DeliveryStatus::Completed | DeliveryStatus::Confirmed => Ok(None),
                    other => Err(AppError::invalid_transition(other.as_str(), "complete")),
                }
            })
            .await?;

        if step.changed {
            self.drivers.release(step.delivery.driver_id, id);
            self.arm_auto_confirm(id);
        }
        self.announce_advance(&step).await;
        Ok(step.delivery)
    }

    pub async fn cancel(
        &self,
        id: Uuid,
        actor: Actor,
        reason: Option<String>,
    ) -> Result<Delivery, AppError> {
        let step = self
            .transition(id, |d| {
                match actor {
                    Actor::Customer(customer_id) if customer_id != d.customer_id => {
                        return Err(AppError::Forbidden(format!(
                            "customer {customer_id} does not own delivery {}",
                            d.id
                        )));
                    }
                    Actor::Driver(driver_id) => ensure_driver(d, driver_id)?,
                    _ => {}
                }

                match d.status {
                    status if status.is_active() => {
                        let mut next = d.clone();
                        next.status = DeliveryStatus::Cancelled;
                        next.cancelled_at = Some(Utc::now());
                        next.cancelled_by = Some(actor);
                        next.cancel_reason = reason.clone();
                        Ok(Some(next))
                    }
                    DeliveryStatus::Cancelled => Ok(None),
                    other => Err(AppError::invalid_transition(other.as_str(), "cancel")),
                }
            })
            .await?;

        if step.changed {
            self.drivers.release(step.delivery.driver_id, id);
            info!(delivery_id = %id, by = ?actor, "delivery cancelled");
            self.notifier
                .notify(Transition::DeliveryCancelled {
                    delivery: &step.delivery,
                })
                .await;
        }
        Ok(step.delivery)
    }

    pub async fn confirm_receipt(&self, id: Uuid, customer_id: Uuid) -> Result<Delivery, AppError> {
        let delivery = self.get(id).await?;
        if delivery.customer_id != customer_id {
            return Err(AppError::Forbidden(format!(
                "customer {customer_id} does not own delivery {id}"
            )));
        }
        self.confirm(id, ConfirmSource::Customer).await
    }

    pub async fn auto_confirm(&self, id: Uuid) -> Result<Delivery, AppError> {
        self.confirm(id, ConfirmSource::AutoConfirm).await
    }

    async fn confirm(&self, id: Uuid, source: ConfirmSource) -> Result<Delivery, AppError> {
        let step = self
            .transition(id, |d| match d.status {
                DeliveryStatus::Completed => {
                    let now = Utc::now();
                    let mut next = d.clone();
                    next.status = DeliveryStatus::Confirmed;
                    next.confirmed_at = Some(now);
                    next.settlement = Some(settle(d.fare, d.commission_rate, source, now));
                    Ok(Some(next))
                }
                DeliveryStatus::Confirmed => Ok(None),
                other => Err(AppError::invalid_transition(other.as_str(), "confirm")),
            })
            .await?;

        if step.changed {
            if source == ConfirmSource::Customer {
                self.timers.cancel(TimerKind::AutoConfirm, id);
            } else {
                self.timers.forget(TimerKind::AutoConfirm, id);
            }
            self.metrics
                .settlements_total
                .with_label_values(&[source.as_str()])
                .inc();

            if let Some(settlement) = &step.delivery.settlement {
                info!(
                    delivery_id = %id,
                    source = source.as_str(),
                    commission = %settlement.commission,
                    driver_payout = %settlement.driver_payout,
                    "delivery settled"
                );
            }
            self.notifier
                .notify(Transition::DeliveryConfirmed {
                    delivery: &step.delivery,
                })
                .await;
        }
        Ok(step.delivery)
    }

    fn arm_auto_confirm(self: &Arc<Self>, id: Uuid) {
        let machine = Arc::clone(self);
        self.timers.arm(
            TimerKind::AutoConfirm,
            id,
            self.settings.auto_confirm_after,
            async move {
                match machine.auto_confirm(id).await {
                    Ok(delivery) => {
                        info!(delivery_id = %id, status = delivery.status.as_str(), "auto-confirm ran");
                    }
                    Err(err) => warn!(delivery_id = %id, error = %err, "auto-confirm failed"),
                }
            },
        );
    }

    async fn announce_advance(&self, step: &Step) {
        if !step.changed {
            return;
        }
        info!(
            delivery_id = %step.delivery.id,
            from = step.from.as_str(),
            to = step.delivery.status.as_str(),
            "delivery advanced"
        );
        self.notifier
            .notify(Transition::DeliveryAdvanced {
                delivery: &step.delivery,
                from: step.from,
            })
            .await;
    }

    async fn transition<F>(&self, id: Uuid, apply: F) -> Result<Step, AppError>
    where
        F: FnOnce(&Delivery) -> Result<Option<Delivery>, AppError>,
    {
        let cell = self.cell(id).await?;
        let mut current = cell.lock().await;
        let from = current.status;

        let Some(mut next) = apply(&*current)? else {
            return Ok(Step {
                delivery: current.clone(),
                from,
                changed: false,
            });
        };
        next.version = current.version + 1;

        let expected = current.version;
        let committed = self
            .retry
            .commit_conditional(
                "update_delivery",
                &next,
                expected,
                || self.store.update_delivery(&next, expected),
                || self.store.load_delivery(id),
            )
            .await;

        match committed {
            Ok(()) => {
                *current = next.clone();
                if next.status.is_final() {
                    self.deliveries.remove(&id);
                }
                Ok(Step {
                    delivery: next,
                    from,
                    changed: true,
                })
            }
            Err(StoreError::VersionConflict { .. }) => {
                if let Some(stored) = self
                    .retry
                    .transient("load_delivery", || self.store.load_delivery(id))
                    .await?
                {
                    warn!(delivery_id = %id, stored_version = stored.version, "delivery changed in store; adopting stored copy");
                    *current = stored;
                }
                Err(AppError::Conflict(format!(
                    "delivery {id} changed concurrently, retry"
                )))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn find(&self, id: Uuid) -> Result<Option<Delivery>, AppError> {
        match self.lookup(id).await? {
            Some(cell) => Ok(Some(cell.lock().await.clone())),
            None => Ok(None),
        }
    }

    async fn cell(&self, id: Uuid) -> Result<Arc<Mutex<Delivery>>, AppError> {
        self.lookup(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("delivery {id} not found")))
    }

    // Confirmed and cancelled deliveries are served from the store, uncached.
    async fn lookup(&self, id: Uuid) -> Result<Option<Arc<Mutex<Delivery>>>, AppError> {
        if let Some(cell) = self.deliveries.get(&id).map(|entry| entry.value().clone()) {
            return Ok(Some(cell));
        }

        let Some(stored) = self
            .retry
            .transient("load_delivery", || self.store.load_delivery(id))
            .await?
        else {
            return Ok(None);
        };

        if stored.status.is_final() {
            return Ok(Some(Arc::new(Mutex::new(stored))));
        }
        Ok(Some(
            self.deliveries
                .entry(id)
                .or_insert_with(|| Arc::new(Mutex::new(stored)))
                .value()
                .clone(),
        ))
    }
}

fn ensure_driver(delivery: &Delivery, driver_id: Uuid) -> Result<(), AppError> {
    if delivery.driver_id != driver_id {
        return Err(AppError::Forbidden(format!(
            "driver {driver_id} is not assigned to delivery {}",
            delivery.id
        )));
    }
    Ok(())
}
