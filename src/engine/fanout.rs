use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::error;
use uuid::Uuid;

use crate::bus::MessageBus;
use crate::engine::retry::RetryPolicy;
use crate::models::booking::{BookingRequest, TargetState};
use crate::models::delivery::{Actor, Delivery, DeliveryStatus};
use crate::models::event::{Channel, EtaTarget, Event};
use crate::models::location::LocationSample;
use crate::routing::RouteEstimate;

#[derive(Debug, Clone, Copy)]
pub enum Transition<'a> {
    RequestCreated {
        request: &'a BookingRequest,
    },
    TargetDeclined {
        request: &'a BookingRequest,
        driver_id: Uuid,
    },
    RequestAccepted {
        request: &'a BookingRequest,
    },
    RequestRejected {
        request: &'a BookingRequest,
        driver_id: Uuid,
    },
    RequestExpired {
        request: &'a BookingRequest,
    },
    RequestCancelled {
        request: &'a BookingRequest,
        withdrawn: &'a [Uuid],
    },
    StaleResponse {
        request: &'a BookingRequest,
        driver_id: Uuid,
    },
    DeliveryAdvanced {
        delivery: &'a Delivery,
        from: DeliveryStatus,
    },
    DeliveryCancelled {
        delivery: &'a Delivery,
    },
    DeliveryConfirmed {
        delivery: &'a Delivery,
    },
    DriverMoved {
        delivery: &'a Delivery,
        sample: &'a LocationSample,
    },
    EtaUpdated {
        delivery: &'a Delivery,
        target: EtaTarget,
        estimate: &'a RouteEstimate,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub channel: Channel,
    pub event: Event,
}

fn to(channel: Channel, event: Event) -> Outbound {
    Outbound { channel, event }
}

pub fn fanout(transition: Transition<'_>) -> Vec<Outbound> {
    match transition {
        Transition::RequestCreated { request } => {
            let offer = Event::BookingOffered {
                request_id: request.id,
                customer_id: request.customer_id,
                pickup: request.pickup.clone(),
                dropoff: request.dropoff.clone(),
                fare: request.fare,
                distance_km: request.distance_km,
                mode: request.mode,
                expires_at: request.expires_at,
            };

            let mut out: Vec<Outbound> = request
                .target_ids()
                .map(|driver_id| to(Channel::Driver(driver_id), offer.clone()))
                .collect();
            out.push(to(
                Channel::Customer(request.customer_id),
                Event::SearchWaiting {
                    request_id: request.id,
                    mode: request.mode,
                    targets: request.targets.len(),
                },
            ));
            out
        }

        Transition::TargetDeclined { request, driver_id } => vec![to(
            Channel::Booking(request.id),
            Event::DriverDeclined {
                request_id: request.id,
                driver_id,
            },
        )],

        Transition::RequestAccepted { request } => {
            let Some(winner) = request.winning_driver_id else {
                error!(request_id = %request.id, "accepted request has no winning driver");
                return Vec::new();
            };

            let assigned = Event::DriverAssigned {
                request_id: request.id,
                delivery_id: request.id,
                driver_id: winner,
            };

            let mut out = vec![
                to(Channel::Driver(winner), assigned.clone()),
                to(Channel::Customer(request.customer_id), assigned.clone()),
                to(Channel::Booking(request.id), assigned),
            ];
            out.extend(no_longer_available(request, &request.drivers_in(TargetState::Withdrawn)));
            out
        }

        Transition::RequestRejected { request, driver_id } => vec![
            to(
                Channel::Customer(request.customer_id),
                Event::DriverDeclined {
                    request_id: request.id,
                    driver_id,
                },
            ),
            to(
                Channel::Booking(request.id),
                Event::DriverDeclined {
                    request_id: request.id,
                    driver_id,
                },
            ),
        ],

        Transition::RequestExpired { request } => {
            let mut out = vec![to(
                Channel::Customer(request.customer_id),
                Event::RequestExpired {
                    request_id: request.id,
                },
            )];
            out.extend(no_longer_available(request, &request.drivers_in(TargetState::Withdrawn)));
            out
        }

        Transition::RequestCancelled { request, withdrawn } => {
            let mut out = vec![to(
                Channel::Customer(request.customer_id),
                Event::RequestCancelled {
                    request_id: request.id,
                },
            )];
            out.extend(no_longer_available(request, withdrawn));
            out
        }

        Transition::StaleResponse { request, driver_id } => {
            no_longer_available(request, std::slice::from_ref(&driver_id)).collect()
        }

        Transition::DeliveryAdvanced { delivery, from } => {
            let event = Event::DeliveryStatusChanged {
                delivery_id: delivery.id,
                from,
                to: delivery.status,
                at: delivery_timestamp(delivery),
            };
            vec![
                to(Channel::Customer(delivery.customer_id), event.clone()),
                to(Channel::Booking(delivery.id), event),
            ]
        }

        Transition::DeliveryCancelled { delivery } => {
            let event = Event::DeliveryCancelled {
                delivery_id: delivery.id,
                by: delivery.cancelled_by.unwrap_or(Actor::System),
                reason: delivery.cancel_reason.clone(),
            };
            vec![
                to(Channel::Customer(delivery.customer_id), event.clone()),
                to(Channel::Driver(delivery.driver_id), event.clone()),
                to(Channel::Booking(delivery.id), event),
            ]
        }

        Transition::DeliveryConfirmed { delivery } => {
            let Some(settlement) = delivery.settlement.as_ref() else {
                error!(delivery_id = %delivery.id, "confirmed delivery has no settlement");
                return Vec::new();
            };
            let event = Event::DeliveryConfirmed {
                delivery_id: delivery.id,
                commission: settlement.commission,
                driver_payout: settlement.driver_payout,
                source: settlement.source,
            };
            vec![
                to(Channel::Driver(delivery.driver_id), event.clone()),
                to(Channel::Customer(delivery.customer_id), event.clone()),
                to(Channel::Booking(delivery.id), event),
            ]
        }

        Transition::DriverMoved { delivery, sample } => vec![to(
            Channel::Booking(delivery.id),
            Event::DriverLocation {
                delivery_id: delivery.id,
                driver_id: sample.driver_id,
                point: sample.point,
                heading: sample.heading,
                speed_kmh: sample.speed_kmh,
                recorded_at: sample.recorded_at,
            },
        )],

        Transition::EtaUpdated {
            delivery,
            target,
            estimate,
        } => {
            let event = Event::EtaUpdated {
                delivery_id: delivery.id,
                driver_id: delivery.driver_id,
                target,
                distance_m: estimate.route.distance_m,
                duration_secs: estimate.route.duration_secs,
                source: estimate.source,
            };
            vec![
                to(Channel::Customer(delivery.customer_id), event.clone()),
                to(Channel::Booking(delivery.id), event),
            ]
        }
    }
}

fn no_longer_available<'a>(
    request: &'a BookingRequest,
    drivers: &'a [Uuid],
) -> impl Iterator<Item = Outbound> + 'a {
    drivers.iter().map(move |driver_id| {
        to(
            Channel::Driver(*driver_id),
            Event::NoLongerAvailable {
                request_id: request.id,
            },
        )
    })
}

fn delivery_timestamp(delivery: &Delivery) -> DateTime<Utc> {
    let stamp = match delivery.status {
        DeliveryStatus::Accepted => Some(delivery.accepted_at),
        DeliveryStatus::PickedUp => delivery.picked_up_at,
        DeliveryStatus::InTransit => delivery.in_transit_at,
        DeliveryStatus::Completed => delivery.completed_at,
        DeliveryStatus::Confirmed => delivery.confirmed_at,
        DeliveryStatus::Cancelled => delivery.cancelled_at,
    };
    stamp.unwrap_or(delivery.accepted_at)
}

pub struct Notifier {
    bus: Arc<dyn MessageBus>,
    retry: RetryPolicy,
}

impl Notifier {
    pub fn new(bus: Arc<dyn MessageBus>, retry: RetryPolicy) -> Self {
        Self { bus, retry }
    }

    pub async fn notify(&self, transition: Transition<'_>) {
        self.publish_all(fanout(transition)).await;
    }

    // drivers only; the customer side was told by whoever moved the session
    pub async fn notify_drivers(&self, transition: Transition<'_>) {
        let outbound = fanout(transition)
            .into_iter()
            .filter(|out| matches!(out.channel, Channel::Driver(_)))
            .collect();
        self.publish_all(outbound).await;
    }

    async fn publish_all(&self, outbound: Vec<Outbound>) {
        for outbound in outbound {
            let Outbound { channel, event } = outbound;
            let published = self
                .retry
                .transient("publish", || self.bus.publish(channel, &event))
                .await;

            if let Err(err) = published {
                error!(
                    channel = %channel,
                    event = event.kind(),
                    error = %err,
                    "failed to publish event; consumers will reconcile by polling"
                );
            }
        }
    }
}
