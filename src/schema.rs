//! Column descriptors for every table exposed over the wire.
//!
//! The SQL layer turns literals into [`Cell`]s by looking up the column type
//! here, and the wire layer turns records back into rows through [`Record`],
//! so a column is declared exactly once.

use std::collections::HashMap;

use ulid::Ulid;

use crate::model::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Id,
    Text,
    Int,
    Bool,
    /// `YYYY-MM-DDTHH:MM:SSZ` text.
    Timestamp,
    /// Comma-separated on the wire.
    TextList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadWrite,
    /// Computed by the engine, rejected in INSERT / UPDATE.
    ReadOnly,
    /// Accepted on INSERT but never stored or returned.
    WriteOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
    pub access: Access,
}

const fn col(name: &'static str, ty: ColumnType, access: Access) -> Column {
    Column { name, ty, access }
}

#[derive(Debug, PartialEq, Eq)]
pub struct TableSchema {
    pub name: &'static str,
    pub columns: &'static [Column],
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&'static Column> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Columns returned by SELECT, in order.
    pub fn readable(&self) -> impl Iterator<Item = &'static Column> {
        self.columns.iter().filter(|c| c.access != Access::WriteOnly)
    }

    /// Column order assumed by `INSERT INTO t VALUES (...)` without a column
    /// list. The id is left out and generated.
    pub fn default_insert_order(&self) -> Vec<&'static Column> {
        self.columns
            .iter()
            .filter(|c| c.access != Access::ReadOnly && c.name != "id")
            .collect()
    }
}

use Access::*;
use ColumnType::*;

pub static CARS: TableSchema = TableSchema {
    name: "cars",
    columns: &[
        col("id", Id, ReadWrite),
        col("company", Text, ReadWrite),
        col("doors", Int, ReadWrite),
        col("big_luggage", Int, ReadWrite),
        col("small_luggage", Int, ReadWrite),
        col("seats", Int, ReadWrite),
        col("air_conditioner", Bool, ReadWrite),
        col("min_age", Int, ReadWrite),
        col("price", Int, ReadWrite),
        col("locations", TextList, ReadWrite),
        col("car_group", Int, ReadWrite),
        col("description", Text, ReadWrite),
    ],
};

pub static BOOKINGS: TableSchema = TableSchema {
    name: "bookings",
    columns: &[
        col("id", Id, ReadWrite),
        col("car_id", Id, ReadWrite),
        col("from_date", Timestamp, ReadWrite),
        col("to_date", Timestamp, ReadWrite),
        col("location", Text, ReadWrite),
        col("extras", TextList, ReadWrite),
        col("discounts", TextList, ReadWrite),
        col("age_group", Text, WriteOnly),
        col("car_group", Int, WriteOnly),
        col("details", Text, ReadOnly),
    ],
};

pub static AVAILABILITY: TableSchema = TableSchema {
    name: "availability",
    columns: &[
        col("car_id", Id, ReadOnly),
        col("from_date", Timestamp, ReadOnly),
        col("to_date", Timestamp, ReadOnly),
        col("available", Bool, ReadOnly),
    ],
};

/// Filter columns of `car_search`. Rows come back shaped like [`CARS`].
pub static CAR_SEARCH: TableSchema = TableSchema {
    name: "car_search",
    columns: &[
        col("from_date", Timestamp, WriteOnly),
        col("to_date", Timestamp, WriteOnly),
        col("location", TextList, WriteOnly),
        col("age", Text, WriteOnly),
        col("car_group", Int, WriteOnly),
    ],
};

/// Result of `INSERT ... RETURNING id`.
pub static ID_ONLY: TableSchema = TableSchema {
    name: "returning",
    columns: &[col("id", Id, ReadOnly)],
};

pub fn table(name: &str) -> Option<&'static TableSchema> {
    [&CARS, &BOOKINGS, &AVAILABILITY, &CAR_SEARCH]
        .into_iter()
        .find(|t| t.name.eq_ignore_ascii_case(name))
}

// ── Cells ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cell {
    Null,
    Id(Ulid),
    Text(String),
    Int(i32),
    Bool(bool),
    List(Vec<String>),
}

impl Cell {
    fn timestamp(ms: Ms) -> Cell {
        format_timestamp(ms).map_or(Cell::Null, Cell::Text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellError {
    Missing(&'static str),
    WrongType(&'static str, ColumnType),
}

impl std::fmt::Display for CellError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellError::Missing(c) => write!(f, "column {c} is required"),
            CellError::WrongType(c, ty) => write!(f, "column {c} expects {ty:?}"),
        }
    }
}

impl std::error::Error for CellError {}

/// Values for one written row, keyed by column name. Absent = not given.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Cells(HashMap<&'static str, Cell>);

impl Cells {
    pub fn insert(&mut self, column: &'static Column, cell: Cell) {
        self.0.insert(column.name, cell);
    }

    fn get(&self, name: &'static str) -> Option<&Cell> {
        self.0.get(name).filter(|c| **c != Cell::Null)
    }

    fn id(&self, name: &'static str) -> Result<Option<Ulid>, CellError> {
        match self.get(name) {
            None => Ok(None),
            Some(Cell::Id(v)) => Ok(Some(*v)),
            Some(_) => Err(CellError::WrongType(name, ColumnType::Id)),
        }
    }

    fn text(&self, name: &'static str) -> Result<Option<String>, CellError> {
        match self.get(name) {
            None => Ok(None),
            Some(Cell::Text(v)) => Ok(Some(v.clone())),
            Some(_) => Err(CellError::WrongType(name, ColumnType::Text)),
        }
    }

    fn int(&self, name: &'static str) -> Result<Option<i32>, CellError> {
        match self.get(name) {
            None => Ok(None),
            Some(Cell::Int(v)) => Ok(Some(*v)),
            Some(_) => Err(CellError::WrongType(name, ColumnType::Int)),
        }
    }

    fn bool(&self, name: &'static str) -> Result<Option<bool>, CellError> {
        match self.get(name) {
            None => Ok(None),
            Some(Cell::Bool(v)) => Ok(Some(*v)),
            Some(_) => Err(CellError::WrongType(name, ColumnType::Bool)),
        }
    }

    fn list(&self, name: &'static str) -> Result<Option<Vec<String>>, CellError> {
        match self.get(name) {
            None => Ok(None),
            Some(Cell::List(v)) => Ok(Some(v.clone())),
            Some(_) => Err(CellError::WrongType(name, ColumnType::TextList)),
        }
    }
}

fn required<T>(name: &'static str, v: Option<T>) -> Result<T, CellError> {
    v.ok_or(CellError::Missing(name))
}

// ── Records ───────────────────────────────────────────────────

/// A stored value that can be rendered as a row of its table.
pub trait Record {
    fn schema() -> &'static TableSchema;
    fn cell(&self, column: &Column) -> Cell;
}

impl Record for Car {
    fn schema() -> &'static TableSchema {
        &CARS
    }

    fn cell(&self, column: &Column) -> Cell {
        match column.name {
            "id" => Cell::Id(self.id),
            "company" => Cell::Text(self.company.clone()),
            "doors" => Cell::Int(self.doors),
            "big_luggage" => Cell::Int(self.big_luggage),
            "small_luggage" => Cell::Int(self.small_luggage),
            "seats" => Cell::Int(self.seats),
            "air_conditioner" => Cell::Bool(self.air_conditioner),
            "min_age" => Cell::Int(self.min_age),
            "price" => Cell::Int(self.price),
            "locations" => Cell::List(self.locations.clone()),
            "car_group" => Cell::Int(self.car_group),
            "description" => Cell::Text(self.description.clone()),
            _ => Cell::Null,
        }
    }
}

impl Record for Booking {
    fn schema() -> &'static TableSchema {
        &BOOKINGS
    }

    fn cell(&self, column: &Column) -> Cell {
        match column.name {
            "id" => Cell::Id(self.id),
            "car_id" => Cell::Id(self.car_id),
            "from_date" => Cell::timestamp(self.span.start),
            "to_date" => Cell::timestamp(self.span.end),
            "location" => Cell::Text(self.location.clone()),
            "extras" => Cell::List(self.extras.clone()),
            "discounts" => Cell::List(self.discounts.clone()),
            "details" => Cell::Text(self.details.clone()),
            _ => Cell::Null,
        }
    }
}

impl Record for AvailabilityInfo {
    fn schema() -> &'static TableSchema {
        &AVAILABILITY
    }

    fn cell(&self, column: &Column) -> Cell {
        match column.name {
            "car_id" => Cell::Id(self.car_id),
            "from_date" => Cell::timestamp(self.span.start),
            "to_date" => Cell::timestamp(self.span.end),
            "available" => Cell::Bool(self.available),
            _ => Cell::Null,
        }
    }
}

/// The id row returned by `INSERT ... RETURNING id`.
pub struct InsertedId(pub Ulid);

impl Record for InsertedId {
    fn schema() -> &'static TableSchema {
        &ID_ONLY
    }

    fn cell(&self, _column: &Column) -> Cell {
        Cell::Id(self.0)
    }
}

// ── Row → model ───────────────────────────────────────────────

impl Car {
    /// Every column but `id` (generated when absent) and `description` is required.
    pub fn from_cells(cells: &Cells) -> Result<Car, CellError> {
        Ok(Car {
            id: cells.id("id")?.unwrap_or_else(Ulid::new),
            company: required("company", cells.text("company")?)?,
            doors: required("doors", cells.int("doors")?)?,
            big_luggage: required("big_luggage", cells.int("big_luggage")?)?,
            small_luggage: required("small_luggage", cells.int("small_luggage")?)?,
            seats: required("seats", cells.int("seats")?)?,
            air_conditioner: required("air_conditioner", cells.bool("air_conditioner")?)?,
            min_age: required("min_age", cells.int("min_age")?)?,
            price: required("price", cells.int("price")?)?,
            locations: required("locations", cells.list("locations")?)?,
            car_group: required("car_group", cells.int("car_group")?)?,
            description: cells.text("description")?.unwrap_or_default(),
        })
    }
}

impl CarPatch {
    pub fn from_cells(cells: &Cells) -> Result<CarPatch, CellError> {
        Ok(CarPatch {
            company: cells.text("company")?,
            doors: cells.int("doors")?,
            big_luggage: cells.int("big_luggage")?,
            small_luggage: cells.int("small_luggage")?,
            seats: cells.int("seats")?,
            air_conditioner: cells.bool("air_conditioner")?,
            min_age: cells.int("min_age")?,
            price: cells.int("price")?,
            locations: cells.list("locations")?,
            car_group: cells.int("car_group")?,
            description: cells.text("description")?,
        })
    }
}

impl BookingRequest {
    pub fn from_cells(cells: &Cells) -> Result<BookingRequest, CellError> {
        Ok(BookingRequest {
            id: cells.id("id")?,
            car_id: required("car_id", cells.id("car_id")?)?,
            from: required("from_date", cells.text("from_date")?)?,
            to: required("to_date", cells.text("to_date")?)?,
            location: required("location", cells.text("location")?)?,
            extras: cells.list("extras")?.unwrap_or_default(),
            discounts: cells.list("discounts")?.unwrap_or_default(),
            age_group: cells.text("age_group")?,
            car_group: required("car_group", cells.int("car_group")?)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cells(pairs: Vec<(&str, Cell)>, schema: &'static TableSchema) -> Cells {
        let mut out = Cells::default();
        for (name, cell) in pairs {
            out.insert(schema.column(name).unwrap(), cell);
        }
        out
    }

    #[test]
    fn lookup_is_case_insensitive() {
        assert_eq!(table("CARS"), Some(&CARS));
        assert_eq!(CARS.column("Min_Age").map(|c| c.ty), Some(ColumnType::Int));
        assert!(table("rules").is_none());
    }

    #[test]
    fn default_insert_order_skips_id_and_computed() {
        let names: Vec<_> = BOOKINGS.default_insert_order().iter().map(|c| c.name).collect();
        assert_eq!(
            names,
            vec!["car_id", "from_date", "to_date", "location", "extras", "discounts", "age_group", "car_group"]
        );
        assert_eq!(CARS.default_insert_order().len(), CARS.columns.len() - 1);
    }

    #[test]
    fn readable_hides_request_only_columns() {
        let names: Vec<_> = BOOKINGS.readable().map(|c| c.name).collect();
        assert!(!names.contains(&"age_group"));
        assert!(names.contains(&"details"));
    }

    #[test]
    fn car_from_cells_requires_fields() {
        let c = cells(vec![("company", Cell::Text("Kia".into()))], &CARS);
        assert_eq!(Car::from_cells(&c), Err(CellError::Missing("doors")));
    }

    #[test]
    fn car_roundtrips_through_record() {
        let car = Car {
            id: Ulid::new(),
            company: "Kia".into(),
            doors: 4,
            big_luggage: 1,
            small_luggage: 2,
            seats: 5,
            air_conditioner: true,
            min_age: 21,
            price: 35,
            locations: vec!["Haifa".into()],
            car_group: 2,
            description: "Picanto".into(),
        };
        let mut c = Cells::default();
        for column in CARS.readable() {
            c.insert(column, car.cell(column));
        }
        assert_eq!(Car::from_cells(&c).unwrap(), car);
    }

    #[test]
    fn patch_takes_only_given_columns() {
        let c = cells(
            vec![("price", Cell::Int(10)), ("locations", Cell::List(vec!["A".into()]))],
            &CARS,
        );
        let patch = CarPatch::from_cells(&c).unwrap();
        assert_eq!(patch.price, Some(10));
        assert_eq!(patch.locations, Some(vec!["A".to_string()]));
        assert_eq!(patch.company, None);
    }

    #[test]
    fn wrong_cell_type_reported() {
        let c = cells(vec![("price", Cell::Text("ten".into()))], &CARS);
        assert_eq!(
            CarPatch::from_cells(&c),
            Err(CellError::WrongType("price", ColumnType::Int))
        );
    }

    #[test]
    fn booking_request_defaults() {
        let car_id = Ulid::new();
        let c = cells(
            vec![
                ("car_id", Cell::Id(car_id)),
                ("from_date", Cell::Text("2022-01-15T15:13:30Z".into())),
                ("to_date", Cell::Text("2022-01-16T15:13:30Z".into())),
                ("location", Cell::Text("NYC".into())),
                ("age_group", Cell::Null),
                ("car_group", Cell::Int(14)),
            ],
            &BOOKINGS,
        );
        let req = BookingRequest::from_cells(&c).unwrap();
        assert_eq!(req.car_id, car_id);
        assert_eq!(req.id, None);
        assert_eq!(req.age_group, None);
        assert!(req.extras.is_empty());
    }

    #[test]
    fn unbounded_timestamp_renders_null() {
        let info = AvailabilityInfo {
            car_id: Ulid::new(),
            span: Span::bounded_by(Some(0), None),
            available: true,
        };
        let to = AVAILABILITY.column("to_date").unwrap();
        let from = AVAILABILITY.column("from_date").unwrap();
        assert_eq!(info.cell(to), Cell::Null);
        assert_eq!(info.cell(from), Cell::Text("1970-01-01T00:00:00Z".into()));
    }
}
