use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds.
pub type Ms = i64;

/// Wire layout for every timestamp, always UTC.
pub const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Parse a `YYYY-MM-DDTHH:MM:SSZ` timestamp.
pub fn parse_timestamp(s: &str) -> Option<Ms> {
    NaiveDateTime::parse_from_str(s.trim(), TIME_FORMAT)
        .ok()
        .map(|dt| dt.and_utc().timestamp_millis())
}

/// Render an instant in the wire layout. Unbounded sides render as `None`.
pub fn format_timestamp(ms: Ms) -> Option<String> {
    if ms == Ms::MIN || ms == Ms::MAX {
        return None;
    }
    DateTime::from_timestamp_millis(ms).map(|dt| dt.format(TIME_FORMAT).to_string())
}

/// Half-open interval `[start, end)`. `Ms::MIN` / `Ms::MAX` stand for an open side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Build a span where a missing bound is unbounded on that side.
    pub fn bounded_by(from: Option<Ms>, to: Option<Ms>) -> Self {
        Self::new(from.unwrap_or(Ms::MIN), to.unwrap_or(Ms::MAX))
    }

    pub fn start_bound(&self) -> Option<Ms> {
        (self.start != Ms::MIN).then_some(self.start)
    }

    pub fn end_bound(&self) -> Option<Ms> {
        (self.end != Ms::MAX).then_some(self.end)
    }

    /// `a` overlaps `b` iff NOT (`a.end <= b.start` OR `a.start >= b.end`).
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Car {
    pub id: Ulid,
    pub company: String,
    pub doors: i32,
    pub big_luggage: i32,
    pub small_luggage: i32,
    pub seats: i32,
    pub air_conditioner: bool,
    /// Minimum driver age.
    pub min_age: i32,
    pub price: i32,
    pub locations: Vec<String>,
    pub car_group: i32,
    pub description: String,
}

impl Car {
    /// Human-readable summary stored on each booking of this car.
    pub fn details(&self) -> String {
        let conditioner = if self.air_conditioner {
            "With Air Conditioner"
        } else {
            "Without Air Conditioner"
        };
        format!(
            "{} {}.Part of {} group. With {} doors, {} adult places, {} big luggage and {} small luggage places.{}. For drivers with minimal age {}",
            self.company,
            self.description,
            self.car_group,
            self.doors,
            self.seats,
            self.big_luggage,
            self.small_luggage,
            conditioner,
            self.min_age,
        )
    }
}

/// Partial car update. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CarPatch {
    pub company: Option<String>,
    pub doors: Option<i32>,
    pub big_luggage: Option<i32>,
    pub small_luggage: Option<i32>,
    pub seats: Option<i32>,
    pub air_conditioner: Option<bool>,
    pub min_age: Option<i32>,
    pub price: Option<i32>,
    pub locations: Option<Vec<String>>,
    pub car_group: Option<i32>,
    pub description: Option<String>,
}

impl CarPatch {
    pub fn is_empty(&self) -> bool {
        *self == CarPatch::default()
    }

    pub fn apply(self, car: &mut Car) {
        if let Some(v) = self.company {
            car.company = v;
        }
        if let Some(v) = self.doors {
            car.doors = v;
        }
        if let Some(v) = self.big_luggage {
            car.big_luggage = v;
        }
        if let Some(v) = self.small_luggage {
            car.small_luggage = v;
        }
        if let Some(v) = self.seats {
            car.seats = v;
        }
        if let Some(v) = self.air_conditioner {
            car.air_conditioner = v;
        }
        if let Some(v) = self.min_age {
            car.min_age = v;
        }
        if let Some(v) = self.price {
            car.price = v;
        }
        if let Some(v) = self.locations {
            car.locations = v;
        }
        if let Some(v) = self.car_group {
            car.car_group = v;
        }
        if let Some(v) = self.description {
            car.description = v;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub car_id: Ulid,
    pub span: Span,
    pub location: String,
    pub extras: Vec<String>,
    pub discounts: Vec<String>,
    /// Car summary rendered at commit time.
    pub details: String,
}

/// What a client asks for. Dates stay raw until the engine validates them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub id: Option<Ulid>,
    pub car_id: Ulid,
    pub from: String,
    pub to: String,
    pub location: String,
    pub extras: Vec<String>,
    pub discounts: Vec<String>,
    /// `"min"` or `"min-max"`.
    pub age_group: Option<String>,
    pub car_group: i32,
}

#[derive(Debug, Clone)]
pub struct CarState {
    pub car: Car,
    /// Sorted by `span.start`.
    pub bookings: Vec<Booking>,
}

impl CarState {
    pub fn new(car: Car) -> Self {
        Self {
            car,
            bookings: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    /// Bookings whose span overlaps the query window.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }
}

/// The WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    CarCreated { car: Car },
    CarUpdated { car: Car },
    CarDeleted { id: Ulid },
    BookingCreated { booking: Booking },
    BookingDeleted { id: Ulid, car_id: Ulid },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityInfo {
    pub car_id: Ulid,
    pub span: Span,
    pub available: bool,
}
