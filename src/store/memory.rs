use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use crate::models::booking::BookingRequest;
use crate::models::delivery::Delivery;
use crate::models::location::LocationSample;
use crate::store::{Persistence, StoreError, Versioned};

#[derive(Default)]
pub struct InMemoryStore {
    requests: DashMap<Uuid, BookingRequest>,
    deliveries: DashMap<Uuid, Delivery>,
    locations: DashMap<Uuid, LocationSample>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn insert<T>(map: &DashMap<Uuid, T>, value: &T, kind: &str) -> Result<(), StoreError>
where
    T: Versioned + Clone + PartialEq,
{
    match map.entry(value.id()) {
        Entry::Occupied(existing) if existing.get() == value => Ok(()),
        Entry::Occupied(_) => Err(StoreError::Duplicate(format!("{kind} {}", value.id()))),
        Entry::Vacant(slot) => {
            slot.insert(value.clone());
            Ok(())
        }
    }
}

fn conditional_update<T>(
    map: &DashMap<Uuid, T>,
    value: &T,
    expected_version: u64,
    kind: &str,
) -> Result<(), StoreError>
where
    T: Versioned + Clone,
{
    let mut stored = map
        .get_mut(&value.id())
        .ok_or_else(|| StoreError::NotFound(format!("{kind} {}", value.id())))?;

    if stored.version() != expected_version || value.version() != expected_version + 1 {
        return Err(StoreError::VersionConflict {
            id: value.id(),
            expected: expected_version,
            found: stored.version(),
        });
    }

    *stored = value.clone();
    Ok(())
}

#[async_trait]
impl Persistence for InMemoryStore {
    async fn insert_request(&self, request: &BookingRequest) -> Result<(), StoreError> {
        insert(&self.requests, request, "booking request")
    }

    async fn update_request(
        &self,
        request: &BookingRequest,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        conditional_update(&self.requests, request, expected_version, "booking request")
    }

    async fn load_request(&self, id: Uuid) -> Result<Option<BookingRequest>, StoreError> {
        Ok(self.requests.get(&id).map(|entry| entry.value().clone()))
    }

    async fn insert_delivery(&self, delivery: &Delivery) -> Result<(), StoreError> {
        insert(&self.deliveries, delivery, "delivery")
    }

    async fn update_delivery(
        &self,
        delivery: &Delivery,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        conditional_update(&self.deliveries, delivery, expected_version, "delivery")
    }

    async fn load_delivery(&self, id: Uuid) -> Result<Option<Delivery>, StoreError> {
        Ok(self.deliveries.get(&id).map(|entry| entry.value().clone()))
    }

    async fn upsert_location(&self, sample: &LocationSample) -> Result<(), StoreError> {
        match self.locations.entry(sample.driver_id) {
            Entry::Occupied(mut existing) => {
                if existing.get().recorded_at <= sample.recorded_at {
                    existing.insert(sample.clone());
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(sample.clone());
            }
        }
        Ok(())
    }

    async fn load_location(&self, driver_id: Uuid) -> Result<Option<LocationSample>, StoreError> {
        Ok(self.locations.get(&driver_id).map(|entry| entry.value().clone()))
    }
}
