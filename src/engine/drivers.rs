use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::driver::{Driver, Position, VehicleType};

#[derive(Default)]
pub struct DriverRegistry {
    drivers: DashMap<Uuid, Driver>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: String, vehicle: VehicleType, rating: f64) -> Result<Driver, AppError> {
        if name.trim().is_empty() {
            return Err(AppError::Validation("name cannot be empty".to_string()));
        }
        if !rating.is_finite() {
            return Err(AppError::Validation("rating must be a number".to_string()));
        }

        let driver = Driver {
            id: Uuid::new_v4(),
            name,
            vehicle,
            online: false,
            active_delivery: None,
            position: None,
            rating: rating.clamp(0.0, 5.0),
            updated_at: Utc::now(),
        };

        self.drivers.insert(driver.id, driver.clone());
        info!(driver_id = %driver.id, vehicle = ?driver.vehicle, "driver registered");
        Ok(driver)
    }

    pub fn insert(&self, driver: Driver) {
        self.drivers.insert(driver.id, driver);
    }

    pub fn get(&self, id: Uuid) -> Option<Driver> {
        self.drivers.get(&id).map(|entry| entry.value().clone())
    }

    pub fn list(&self) -> Vec<Driver> {
        let mut drivers: Vec<Driver> = self
            .drivers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        drivers.sort_by_key(|driver| driver.id);
        drivers
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    pub fn for_each(&self, mut f: impl FnMut(&Driver)) {
        for entry in self.drivers.iter() {
            f(entry.value());
        }
    }

    pub fn set_online(&self, id: Uuid, online: bool) -> Result<Driver, AppError> {
        let mut driver = self
            .drivers
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("driver {id} not found")))?;

        driver.online = online;
        driver.updated_at = Utc::now();
        info!(driver_id = %id, online, "driver availability changed");

        Ok(driver.clone())
    }

    pub fn update_position(&self, id: Uuid, position: Position) -> Result<(), AppError> {
        let mut driver = self
            .drivers
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("driver {id} not found")))?;

        driver.position = Some(position);
        driver.updated_at = Utc::now();
        Ok(())
    }

    pub fn try_claim(&self, id: Uuid, delivery_id: Uuid) -> Result<(), AppError> {
        let mut driver = self
            .drivers
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("driver {id} not found")))?;

        match driver.active_delivery {
            Some(active) if active == delivery_id => return Ok(()),
            Some(active) => {
                return Err(AppError::Conflict(format!(
                    "driver {id} is already on delivery {active}"
                )));
            }
            None => {}
        }
        if !driver.online {
            return Err(AppError::Conflict(format!("driver {id} is offline")));
        }

        driver.active_delivery = Some(delivery_id);
        driver.updated_at = Utc::now();
        debug!(driver_id = %id, delivery_id = %delivery_id, "driver claimed");
        Ok(())
    }

    pub fn release(&self, id: Uuid, delivery_id: Uuid) {
        if let Some(mut driver) = self.drivers.get_mut(&id) {
            if driver.active_delivery == Some(delivery_id) {
                driver.active_delivery = None;
                driver.updated_at = Utc::now();
                debug!(driver_id = %id, delivery_id = %delivery_id, "driver released");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::DriverRegistry;
    use crate::error::AppError;
    use crate::models::driver::VehicleType;

    #[test]
    fn driver_can_hold_only_one_delivery() {
        let registry = DriverRegistry::new();
        let driver = registry
            .register("Ama".to_string(), VehicleType::Bike, 4.7)
            .unwrap();
        registry.set_online(driver.id, true).unwrap();

        let first = Uuid::from_u128(1);
        let second = Uuid::from_u128(2);

        assert!(registry.try_claim(driver.id, first).is_ok());
        assert!(registry.try_claim(driver.id, first).is_ok());
        assert!(matches!(
            registry.try_claim(driver.id, second),
            Err(AppError::Conflict(_))
        ));
        assert!(!registry.get(driver.id).unwrap().is_available());

        registry.release(driver.id, second);
        assert!(!registry.get(driver.id).unwrap().is_available());

        registry.release(driver.id, first);
        assert!(registry.get(driver.id).unwrap().is_available());
    }

    #[test]
    fn offline_driver_cannot_be_claimed() {
        let registry = DriverRegistry::new();
        let driver = registry
            .register("Kofi".to_string(), VehicleType::Car, 4.2)
            .unwrap();

        assert!(registry.try_claim(driver.id, Uuid::from_u128(1)).is_err());
    }

    #[test]
    fn blank_name_is_rejected() {
        let registry = DriverRegistry::new();
        assert!(matches!(
            registry.register("  ".to_string(), VehicleType::Van, 5.0),
            Err(AppError::Validation(_))
        ));
    }
}
