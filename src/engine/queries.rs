use ulid::Ulid;

use crate::model::*;

use super::conflict::find_overlap;
use super::search::{SearchFilter, SearchQuery};
use super::{Engine, EngineError, SharedCarState};

impl Engine {
    /// Snapshot of the car handles, ordered by id. The map is not held
    /// across the awaits that follow.
    fn car_handles(&self) -> Vec<(Ulid, SharedCarState)> {
        let mut handles: Vec<_> = self
            .cars
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        handles.sort_by_key(|(id, _)| *id);
        handles
    }

    pub async fn list_cars(&self) -> Vec<Car> {
        let mut out = Vec::new();
        for (id, cs) in self.car_handles() {
            let guard = cs.read().await;
            if self.is_live(&id, &cs) {
                out.push(guard.car.clone());
            }
        }
        out
    }

    pub async fn get_car(&self, id: Ulid) -> Result<Car, EngineError> {
        let cs = self.get_car_state(&id).ok_or(EngineError::NotFound(id))?;
        let guard = cs.read().await;
        if !self.is_live(&id, &cs) {
            return Err(EngineError::NotFound(id));
        }
        Ok(guard.car.clone())
    }

    /// All bookings, or only those of one car. Ordered by car, then start.
    pub async fn list_bookings(&self, car_id: Option<Ulid>) -> Result<Vec<Booking>, EngineError> {
        let handles = match car_id {
            Some(id) => {
                let cs = self.get_car_state(&id).ok_or(EngineError::NotFound(id))?;
                vec![(id, cs)]
            }
            None => self.car_handles(),
        };
        let mut out = Vec::new();
        for (_, cs) in handles {
            out.extend(cs.read().await.bookings.iter().cloned());
        }
        Ok(out)
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let car_id = self.car_for_booking(&id).ok_or(EngineError::NotFound(id))?;
        let cs = self.get_car_state(&car_id).ok_or(EngineError::NotFound(id))?;
        let guard = cs.read().await;
        guard
            .bookings
            .iter()
            .find(|b| b.id == id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    /// Whether any booking of the car overlaps `span`. Unknown car is `NotFound`.
    pub async fn is_overlapping(&self, car_id: Ulid, span: Span) -> Result<bool, EngineError> {
        let cs = self
            .get_car_state(&car_id)
            .ok_or(EngineError::NotFound(car_id))?;
        let guard = cs.read().await;
        if !self.is_live(&car_id, &cs) {
            return Err(EngineError::NotFound(car_id));
        }
        Ok(find_overlap(&guard, &span).is_some())
    }

    pub async fn check_availability(
        &self,
        car_id: Ulid,
        span: Span,
    ) -> Result<AvailabilityInfo, EngineError> {
        let available = !self.is_overlapping(car_id, span).await?;
        Ok(AvailabilityInfo {
            car_id,
            span,
            available,
        })
    }

    /// Cars passing every filter in the query, ordered by id.
    pub async fn search_cars(&self, query: SearchQuery) -> Result<Vec<Car>, EngineError> {
        let filter = SearchFilter::build(query)?;
        let mut out = Vec::new();
        for (id, cs) in self.car_handles() {
            let guard = cs.read().await;
            if self.is_live(&id, &cs) && filter.matches(&guard) {
                out.push(guard.car.clone());
            }
        }
        Ok(out)
    }
}
