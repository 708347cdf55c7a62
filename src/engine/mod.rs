mod conflict;
mod error;
mod mutations;
mod policy;
mod queries;
mod search;
mod tx;

pub use conflict::{find_overlap, parse_window};
pub use error::{EngineError, ErrorKind};
pub use policy::AgeGroup;
pub use search::{SearchFilter, SearchQuery};
pub use tx::BookingTx;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockReadGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedCarState = Arc<RwLock<CarState>>;

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL. Appends that queue up while one fsync is in flight are
/// written together and share the next fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, &mut batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush of {} events failed: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let appended = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so a half-written batch is not
    // carried into the next one.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

pub struct Engine {
    pub cars: DashMap<Ulid, SharedCarState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// booking id → car id
    pub(super) booking_to_car: DashMap<Ulid, Ulid>,
    /// Held shared by every mutation from lock acquisition through apply,
    /// and exclusively while the WAL is compacted.
    pub(super) commit_gate: Arc<RwLock<()>>,
}

/// Apply a booking event to a car's state. Car-level events are handled at
/// the map level.
fn apply_to_car(cs: &mut CarState, event: &Event, booking_to_car: &DashMap<Ulid, Ulid>) {
    match event {
        Event::BookingCreated { booking } => {
            booking_to_car.insert(booking.id, booking.car_id);
            cs.insert_booking(booking.clone());
        }
        Event::BookingDeleted { id, .. } => {
            cs.remove_booking(*id);
            booking_to_car.remove(id);
        }
        Event::CarUpdated { car } => cs.car = car.clone(),
        Event::CarCreated { .. } | Event::CarDeleted { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let booking_to_car = DashMap::new();
        let mut cars: HashMap<Ulid, CarState> = HashMap::new();
        for event in &events {
            match event {
                Event::CarCreated { car } => {
                    cars.insert(car.id, CarState::new(car.clone()));
                }
                Event::CarDeleted { id } => {
                    if let Some(cs) = cars.remove(id) {
                        for b in &cs.bookings {
                            booking_to_car.remove(&b.id);
                        }
                    }
                }
                Event::CarUpdated { car } => {
                    if let Some(cs) = cars.get_mut(&car.id) {
                        apply_to_car(cs, event, &booking_to_car);
                    }
                }
                Event::BookingCreated { booking } => {
                    if let Some(cs) = cars.get_mut(&booking.car_id) {
                        apply_to_car(cs, event, &booking_to_car);
                    }
                }
                Event::BookingDeleted { car_id, .. } => {
                    if let Some(cs) = cars.get_mut(car_id) {
                        apply_to_car(cs, event, &booking_to_car);
                    }
                }
            }
        }

        let bookings = booking_to_car.len();
        let engine = Self {
            cars: cars
                .into_iter()
                .map(|(id, cs)| (id, Arc::new(RwLock::new(cs))))
                .collect(),
            wal_tx,
            booking_to_car,
            commit_gate: Arc::new(RwLock::new(())),
        };
        tracing::info!(
            "replayed {} WAL events: {} cars, {bookings} bookings",
            events.len(),
            engine.cars.len()
        );
        Ok(engine)
    }

    /// Send an event to the group-commit writer and wait until it is on disk.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_car_state(&self, id: &Ulid) -> Option<SharedCarState> {
        self.cars.get(id).map(|e| e.value().clone())
    }

    pub fn car_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_car.get(booking_id).map(|e| *e.value())
    }

    /// False once the car was deleted (or rolled back) after `cs` was fetched.
    pub(super) fn is_live(&self, id: &Ulid, cs: &SharedCarState) -> bool {
        self.cars
            .get(id)
            .is_some_and(|e| Arc::ptr_eq(e.value(), cs))
    }

    pub(super) async fn enter_commit(&self) -> OwnedRwLockReadGuard<()> {
        self.commit_gate.clone().read_owned().await
    }

    /// Durably log the event, then apply it. On WAL failure the state is untouched.
    pub(super) async fn persist_and_apply(
        &self,
        cs: &mut CarState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_car(cs, event, &self.booking_to_car);
        Ok(())
    }

    /// Exclusive, live write access to one car.
    pub(super) async fn lock_car(
        &self,
        id: Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<CarState>, EngineError> {
        let cs = self.get_car_state(&id).ok_or(EngineError::NotFound(id))?;
        let guard = cs.clone().write_owned().await;
        if !self.is_live(&id, &cs) {
            return Err(EngineError::NotFound(id));
        }
        Ok(guard)
    }

    /// Open a booking transaction on a car. The car stays write-locked until
    /// the transaction is committed, rolled back or dropped.
    pub async fn begin(&self, car_id: Ulid) -> Result<BookingTx<'_>, EngineError> {
        let gate = self.enter_commit().await;
        let guard = self.lock_car(car_id).await?;
        Ok(BookingTx::new(self, gate, guard))
    }
}
