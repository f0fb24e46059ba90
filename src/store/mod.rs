pub mod memory;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::models::booking::BookingRequest;
use crate::models::delivery::Delivery;
use crate::models::location::LocationSample;

pub use memory::InMemoryStore;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    Duplicate(String),

    #[error("version conflict on {id}: expected {expected}, found {found}")]
    VersionConflict { id: Uuid, expected: u64, found: u64 },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

pub trait Versioned {
    fn id(&self) -> Uuid;
    fn version(&self) -> u64;
}

impl Versioned for BookingRequest {
    fn id(&self) -> Uuid {
        self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl Versioned for Delivery {
    fn id(&self) -> Uuid {
        self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn insert_request(&self, request: &BookingRequest) -> Result<(), StoreError>;

    async fn update_request(
        &self,
        request: &BookingRequest,
        expected_version: u64,
    ) -> Result<(), StoreError>;

    async fn load_request(&self, id: Uuid) -> Result<Option<BookingRequest>, StoreError>;

    async fn insert_delivery(&self, delivery: &Delivery) -> Result<(), StoreError>;

    async fn update_delivery(
        &self,
        delivery: &Delivery,
        expected_version: u64,
    ) -> Result<(), StoreError>;

    async fn load_delivery(&self, id: Uuid) -> Result<Option<Delivery>, StoreError>;

    async fn upsert_location(&self, sample: &LocationSample) -> Result<(), StoreError>;

    async fn load_location(&self, driver_id: Uuid) -> Result<Option<LocationSample>, StoreError>;
}
