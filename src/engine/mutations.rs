use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::parse_booking_window;
use super::policy::check_booking_policy;
use super::{Engine, EngineError, ErrorKind, WalCommand};

fn check_text(field: &str, value: &str, reasons: &mut Vec<String>) {
    if value.len() > MAX_TEXT_LEN {
        reasons.push(format!("{field} longer than {MAX_TEXT_LEN} bytes"));
    }
}

fn check_list(field: &str, values: &[String], reasons: &mut Vec<String>) {
    if values.len() > MAX_LIST_LEN {
        reasons.push(format!("{field} has more than {MAX_LIST_LEN} entries"));
    }
    for v in values {
        check_text(field, v, reasons);
        // lists travel comma-joined in text results
        if v.contains(',') {
            reasons.push(format!("{field} entry {v:?} contains a comma"));
        }
    }
}

fn validate_car(car: &Car) -> Result<(), EngineError> {
    let mut reasons = Vec::new();
    for (field, value) in [
        ("doors", car.doors),
        ("big_luggage", car.big_luggage),
        ("small_luggage", car.small_luggage),
        ("seats", car.seats),
        ("min_age", car.min_age),
        ("price", car.price),
        ("car_group", car.car_group),
    ] {
        if value < 0 {
            reasons.push(format!("{field} must not be negative"));
        }
    }
    if car.company.trim().is_empty() {
        reasons.push("company must not be empty".into());
    }
    check_text("company", &car.company, &mut reasons);
    check_text("description", &car.description, &mut reasons);
    check_list("locations", &car.locations, &mut reasons);
    if reasons.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Validation(reasons))
    }
}

fn validate_booking_fields(req: &BookingRequest) -> Result<(), EngineError> {
    let mut reasons = Vec::new();
    if req.location.trim().is_empty() {
        reasons.push("location must not be empty".into());
    }
    check_text("location", &req.location, &mut reasons);
    check_list("extras", &req.extras, &mut reasons);
    check_list("discounts", &req.discounts, &mut reasons);
    if reasons.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Validation(reasons))
    }
}

fn rejection_reason(e: &EngineError) -> &'static str {
    match e {
        EngineError::Conflict { .. } => "conflict",
        EngineError::NotFound(_) => "car_not_found",
        EngineError::Validation(_) => "policy",
        EngineError::AlreadyExists(_) => "duplicate",
        EngineError::LimitExceeded(_) => "limit",
        EngineError::HasBookings(_) | EngineError::WalError(_) => "internal",
    }
}

impl Engine {
    pub async fn create_car(&self, car: Car) -> Result<Ulid, EngineError> {
        validate_car(&car)?;
        let id = car.id;
        let _gate = self.enter_commit().await;
        if self.cars.len() >= MAX_CARS {
            return Err(EngineError::LimitExceeded("too many cars"));
        }

        // Publish the new car already locked so nobody can book it before
        // its creation is durable.
        let cs = Arc::new(RwLock::new(CarState::new(car.clone())));
        let guard = cs.clone().write_owned().await;
        match self.cars.entry(id) {
            Entry::Occupied(_) => {
                return Err(EngineError::AlreadyExists(id));
            }
            Entry::Vacant(slot) => {
                slot.insert(cs.clone());
            }
        }

        if let Err(e) = self.wal_append(&Event::CarCreated { car }).await {
            self.cars.remove_if(&id, |_, v| Arc::ptr_eq(v, &cs));
            return Err(e);
        }
        drop(guard);
        info!("created car {id}");
        Ok(id)
    }

    pub async fn update_car(&self, id: Ulid, patch: CarPatch) -> Result<(), EngineError> {
        let _gate = self.enter_commit().await;
        let mut guard = self.lock_car(id).await?;
        if patch.is_empty() {
            return Ok(());
        }
        let mut car = guard.car.clone();
        patch.apply(&mut car);
        validate_car(&car)?;
        self.persist_and_apply(&mut guard, &Event::CarUpdated { car })
            .await?;
        info!("updated car {id}");
        Ok(())
    }

    /// Refused while the car still has bookings.
    pub async fn delete_car(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.enter_commit().await;
        let guard = self.lock_car(id).await?;
        if !guard.bookings.is_empty() {
            return Err(EngineError::HasBookings(id));
        }
        self.wal_append(&Event::CarDeleted { id }).await?;
        self.cars.remove(&id);
        drop(guard);
        info!("deleted car {id}");
        Ok(())
    }

    /// Validate a booking request against the car and reserve the dates.
    ///
    /// The car stays write-locked from policy check through WAL append, so
    /// two requests racing for the same dates cannot both commit.
    pub async fn create_booking(&self, req: BookingRequest) -> Result<Ulid, EngineError> {
        let car_id = req.car_id;
        let result = self.try_create_booking(req).await;
        match &result {
            Ok(id) => info!("booked car {car_id}: booking {id}"),
            Err(e) => {
                metrics::counter!(
                    crate::observability::BOOKINGS_REJECTED_TOTAL,
                    "reason" => rejection_reason(e)
                )
                .increment(1);
                match e.kind() {
                    ErrorKind::Conflict => debug!("booking on car {car_id} rejected: {e}"),
                    ErrorKind::Internal => tracing::error!("booking on car {car_id} failed: {e}"),
                    _ => warn!("booking on car {car_id} rejected: {e}"),
                }
            }
        }
        result
    }

    async fn try_create_booking(&self, req: BookingRequest) -> Result<Ulid, EngineError> {
        let span = parse_booking_window(&req.from, &req.to)?;
        validate_booking_fields(&req)?;
        let id = req.id.unwrap_or_else(Ulid::new);
        if self.booking_to_car.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let car_id = req.car_id;
        let mut tx = self.begin(car_id).await?;
        check_booking_policy(&req, tx.car())?;
        let details = tx.car().details();
        tx.insert_booking(Booking {
            id,
            car_id,
            span,
            location: req.location,
            extras: req.extras,
            discounts: req.discounts,
            details,
        })?;

        // Reserve the id; another car may be committing the same one.
        match self.booking_to_car.entry(id) {
            Entry::Occupied(_) => {
                tx.rollback();
                return Err(EngineError::AlreadyExists(id));
            }
            Entry::Vacant(slot) => {
                slot.insert(car_id);
            }
        }
        if let Err(e) = tx.commit().await {
            self.booking_to_car.remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    /// Unconditional removal. Unknown or already deleted ids are `NotFound`.
    pub async fn delete_booking(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _gate = self.enter_commit().await;
        let car_id = self.car_for_booking(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = self.lock_car(car_id).await?;
        if !guard.bookings.iter().any(|b| b.id == id) {
            return Err(EngineError::NotFound(id));
        }
        self.persist_and_apply(&mut guard, &Event::BookingDeleted { id, car_id })
            .await?;
        info!("deleted booking {id} on car {car_id}");
        Ok(car_id)
    }

    /// Rewrite the WAL as the minimal event list that rebuilds current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.commit_gate.write().await;

        let mut cars: Vec<_> = self
            .cars
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        cars.sort_by_key(|(id, _)| *id);

        let mut events = Vec::new();
        for (_, cs) in cars {
            let guard = cs.read().await;
            events.push(Event::CarCreated {
                car: guard.car.clone(),
            });
            for booking in &guard.bookings {
                events.push(Event::BookingCreated {
                    booking: booking.clone(),
                });
            }
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!("compacted WAL to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
