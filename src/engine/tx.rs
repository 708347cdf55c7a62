use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard};
use ulid::Ulid;

use crate::limits::MAX_BOOKINGS_PER_CAR;
use crate::model::*;

use super::conflict::check_no_conflict;
use super::{Engine, EngineError};

/// Unit of work over a single car.
///
/// Holding a `BookingTx` means holding the car's write lock, so the overlap
/// check done by `insert_booking` cannot be invalidated before `commit`.
/// Dropping without committing is a rollback: nothing staged reaches the WAL
/// or the in-memory state.
pub struct BookingTx<'a> {
    engine: &'a Engine,
    _gate: OwnedRwLockReadGuard<()>,
    guard: OwnedRwLockWriteGuard<CarState>,
    staged: Option<Booking>,
}

impl<'a> BookingTx<'a> {
    pub(super) fn new(
        engine: &'a Engine,
        gate: OwnedRwLockReadGuard<()>,
        guard: OwnedRwLockWriteGuard<CarState>,
    ) -> Self {
        Self {
            engine,
            _gate: gate,
            guard,
            staged: None,
        }
    }

    pub fn car(&self) -> &Car {
        &self.guard.car
    }

    /// Committed bookings of the car, sorted by start.
    pub fn find_bookings(&self) -> &[Booking] {
        &self.guard.bookings
    }

    /// Stage a booking. Fails if it overlaps a committed booking, if the car
    /// is full, or if a booking is already staged.
    pub fn insert_booking(&mut self, booking: Booking) -> Result<Ulid, EngineError> {
        if self.staged.is_some() {
            return Err(EngineError::invalid(
                "transaction already holds a staged booking",
            ));
        }
        if booking.car_id != self.guard.car.id {
            return Err(EngineError::invalid(format!(
                "booking {} targets car {}, transaction is on car {}",
                booking.id, booking.car_id, self.guard.car.id
            )));
        }
        if self.guard.bookings.len() >= MAX_BOOKINGS_PER_CAR {
            return Err(EngineError::LimitExceeded("too many bookings on car"));
        }
        check_no_conflict(&self.guard, &booking.span)?;
        let id = booking.id;
        self.staged = Some(booking);
        Ok(id)
    }

    /// Write the staged booking to the WAL, then make it visible.
    pub async fn commit(mut self) -> Result<Option<Ulid>, EngineError> {
        let Some(booking) = self.staged.take() else {
            return Ok(None);
        };
        let id = booking.id;
        let event = Event::BookingCreated { booking };
        self.engine.persist_and_apply(&mut self.guard, &event).await?;
        Ok(Some(id))
    }

    pub fn rollback(self) {
        if let Some(b) = &self.staged {
            tracing::debug!("rolled back booking {} on car {}", b.id, b.car_id);
        }
    }
}
