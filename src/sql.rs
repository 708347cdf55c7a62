use sqlparser::ast::{
    self, Assignment, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::SearchQuery;
use crate::limits::MAX_IN_CLAUSE_VALUES;
use crate::model::*;
use crate::schema::{self, Access, Cell, CellError, Cells, Column, ColumnType, TableSchema};

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertCar {
        car: Car,
        returning: bool,
    },
    UpdateCar {
        id: Ulid,
        patch: CarPatch,
    },
    DeleteCar {
        id: Ulid,
    },
    SelectCars {
        id: Option<Ulid>,
    },
    InsertBooking {
        request: BookingRequest,
        returning: bool,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectBookings {
        id: Option<Ulid>,
        car_id: Option<Ulid>,
    },
    SelectAvailability {
        car_id: Ulid,
        from: Option<String>,
        to: Option<String>,
    },
    SearchCars {
        query: SearchQuery,
    },
}

fn parse_statement(sql: &str) -> Result<Statement, SqlError> {
    let dialect = PostgreSqlDialect {};
    let mut stmts =
        Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    match stmts.len() {
        0 => Err(SqlError::Empty),
        1 => Ok(stmts.remove(0)),
        _ => Err(SqlError::Unsupported("multiple statements".into())),
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    match parse_statement(sql)? {
        Statement::Insert(insert) => parse_insert(&insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, &assignments, &selection),
        Statement::Delete(delete) => parse_delete(&delete),
        Statement::Query(query) => parse_select(&query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Row shape a statement produces, without executing it. Placeholders are
/// fine here, so this also serves Describe in the extended protocol.
pub fn result_schema(sql: &str) -> Option<&'static TableSchema> {
    match parse_statement(sql).ok()? {
        Statement::Insert(insert) if insert.returning.is_some() => Some(&schema::ID_ONLY),
        Statement::Query(query) => {
            let SetExpr::Select(select) = query.body.as_ref() else {
                return None;
            };
            let name = table_factor_name(&select.from.first()?.relation).ok()?;
            match schema::table(&name)? {
                t if t.name == schema::CAR_SEARCH.name => Some(&schema::CARS),
                t => Some(t),
            }
        }
        _ => None,
    }
}

fn known_table(name: String) -> Result<&'static TableSchema, SqlError> {
    schema::table(&name).ok_or(SqlError::UnknownTable(name))
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = known_table(insert_table_name(insert)?)?;
    let rows = extract_insert_rows(insert)?;
    if rows.len() != 1 {
        return Err(SqlError::Unsupported("multi-row INSERT".into()));
    }
    let values = &rows[0];

    let columns: Vec<&'static Column> = if insert.columns.is_empty() {
        table.default_insert_order()
    } else {
        insert
            .columns
            .iter()
            .map(|ident| writable_column(table, &ident.value))
            .collect::<Result<_, _>>()?
    };
    if columns.len() != values.len() {
        return Err(SqlError::WrongArity(table.name, columns.len(), values.len()));
    }

    let mut cells = Cells::default();
    for (column, expr) in columns.into_iter().zip(values) {
        cells.insert(column, cell_from_expr(column, expr)?);
    }
    let returning = returning_id(&insert.returning)?;

    match table.name {
        "cars" => Ok(Command::InsertCar {
            car: Car::from_cells(&cells)?,
            returning,
        }),
        "bookings" => Ok(Command::InsertBooking {
            request: BookingRequest::from_cells(&cells)?,
            returning,
        }),
        other => Err(SqlError::Unsupported(format!("INSERT into {other}"))),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = known_table(table_factor_name(relation)?)?;
    if table.name != "cars" {
        return Err(SqlError::Unsupported(format!("UPDATE on {}", table.name)));
    }
    let id = extract_where_id(selection)?;

    let mut cells = Cells::default();
    for assignment in assignments {
        let AssignmentTarget::ColumnName(name) = &assignment.target else {
            return Err(SqlError::Unsupported("tuple assignment".into()));
        };
        let name = object_name_last(name).ok_or_else(|| SqlError::Parse("empty column".into()))?;
        if name == "id" {
            return Err(SqlError::ReadOnlyColumn("id"));
        }
        let column = writable_column(table, &name)?;
        cells.insert(column, cell_from_expr(column, &assignment.value)?);
    }
    Ok(Command::UpdateCar {
        id,
        patch: CarPatch::from_cells(&cells)?,
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = known_table(delete_table_name(delete)?)?;
    let id = extract_where_id(&delete.selection)?;

    match table.name {
        "cars" => Ok(Command::DeleteCar { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        other => Err(SqlError::Unsupported(format!("DELETE from {other}"))),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let first = select
        .from
        .first()
        .ok_or_else(|| SqlError::Parse("SELECT without FROM".into()))?;
    let table = known_table(table_factor_name(&first.relation)?)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }
    let mut filters = Filters::new(table, filters)?;

    let cmd = match table.name {
        "cars" => Command::SelectCars {
            id: filters.id("id")?,
        },
        "bookings" => Command::SelectBookings {
            id: filters.id("id")?,
            car_id: filters.id("car_id")?,
        },
        "availability" => Command::SelectAvailability {
            car_id: filters.id("car_id")?.ok_or(SqlError::MissingFilter("car_id"))?,
            from: filters.text("from_date")?,
            to: filters.text("to_date")?,
        },
        "car_search" => Command::SearchCars {
            query: SearchQuery {
                from: filters.text("from_date")?,
                to: filters.text("to_date")?,
                locations: filters.list("location")?,
                age: filters.text("age")?,
                car_group: filters.int("car_group")?,
            },
        },
        other => return Err(SqlError::UnknownTable(other.to_string())),
    };
    filters.finish()?;
    Ok(cmd)
}

// ── WHERE filters ─────────────────────────────────────────────

/// Flatten `a = x AND b IN (y, z)` into `[(a, [x]), (b, [y, z])]`.
fn collect_filters<'e>(expr: &'e Expr, out: &mut Vec<(String, Vec<&'e Expr>)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_filters(left, out)?;
            collect_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((col, vec![right.as_ref()]));
            Ok(())
        }
        Expr::InList {
            expr,
            list,
            negated: false,
        } => {
            let col = expr_column_name(expr)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {expr}")))?;
            if list.len() > MAX_IN_CLAUSE_VALUES {
                return Err(SqlError::TooManyValues(list.len()));
            }
            out.push((col, list.iter().collect()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
    }
}

/// Typed view over collected filters. Every filter must be consumed, so a
/// misspelt column is an error rather than silently ignored.
struct Filters<'e> {
    table: &'static TableSchema,
    entries: Vec<(&'static Column, Vec<&'e Expr>)>,
}

impl<'e> Filters<'e> {
    fn new(
        table: &'static TableSchema,
        raw: Vec<(String, Vec<&'e Expr>)>,
    ) -> Result<Self, SqlError> {
        let mut entries: Vec<(&'static Column, Vec<&'e Expr>)> = Vec::with_capacity(raw.len());
        for (name, values) in raw {
            let column = table
                .column(&name)
                .ok_or_else(|| SqlError::UnknownColumn(table.name, name.clone()))?;
            if entries.iter().any(|(c, _)| c.name == column.name) {
                return Err(SqlError::Parse(format!("duplicate filter on {name}")));
            }
            entries.push((column, values));
        }
        Ok(Self { table, entries })
    }

    fn take(&mut self, name: &'static str) -> Option<(&'static Column, Vec<&'e Expr>)> {
        let pos = self.entries.iter().position(|(c, _)| c.name == name)?;
        Some(self.entries.remove(pos))
    }

    fn single(&mut self, name: &'static str) -> Result<Option<Cell>, SqlError> {
        match self.take(name) {
            None => Ok(None),
            Some((column, values)) if values.len() == 1 => {
                Ok(Some(cell_from_expr(column, values[0])?))
            }
            Some(_) => Err(SqlError::Unsupported(format!("IN list on {name}"))),
        }
    }

    fn id(&mut self, name: &'static str) -> Result<Option<Ulid>, SqlError> {
        match self.single(name)? {
            None | Some(Cell::Null) => Ok(None),
            Some(Cell::Id(id)) => Ok(Some(id)),
            Some(_) => Err(CellError::WrongType(name, ColumnType::Id).into()),
        }
    }

    fn text(&mut self, name: &'static str) -> Result<Option<String>, SqlError> {
        match self.single(name)? {
            None | Some(Cell::Null) => Ok(None),
            Some(Cell::Text(s)) => Ok(Some(s)),
            Some(_) => Err(CellError::WrongType(name, ColumnType::Text).into()),
        }
    }

    fn int(&mut self, name: &'static str) -> Result<Option<i32>, SqlError> {
        match self.single(name)? {
            None | Some(Cell::Null) => Ok(None),
            Some(Cell::Int(v)) => Ok(Some(v)),
            Some(_) => Err(CellError::WrongType(name, ColumnType::Int).into()),
        }
    }

    /// `col = 'a,b'` or `col IN ('a', 'b')`.
    fn list(&mut self, name: &'static str) -> Result<Vec<String>, SqlError> {
        let Some((column, values)) = self.take(name) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for expr in values {
            match cell_from_expr(column, expr)? {
                Cell::List(items) => out.extend(items),
                Cell::Null => {}
                _ => return Err(CellError::WrongType(name, ColumnType::TextList).into()),
            }
        }
        if out.len() > MAX_IN_CLAUSE_VALUES {
            return Err(SqlError::TooManyValues(out.len()));
        }
        Ok(out)
    }

    fn finish(self) -> Result<(), SqlError> {
        match self.entries.first() {
            None => Ok(()),
            Some((column, _)) => Err(SqlError::UnknownColumn(
                self.table.name,
                column.name.to_string(),
            )),
        }
    }
}

// ── Literals ──────────────────────────────────────────────────

fn cell_from_expr(column: &'static Column, expr: &Expr) -> Result<Cell, SqlError> {
    let wrong = || SqlError::Column(CellError::WrongType(column.name, column.ty));
    if let Some(Value::Null) = extract_value(expr) {
        return Ok(Cell::Null);
    }
    match column.ty {
        ColumnType::Id => match extract_value(expr) {
            Some(Value::SingleQuotedString(s)) => Ulid::from_string(s)
                .map(Cell::Id)
                .map_err(|e| SqlError::Parse(format!("bad ULID for {}: {e}", column.name))),
            _ => Err(wrong()),
        },
        ColumnType::Text | ColumnType::Timestamp => match extract_value(expr) {
            Some(Value::SingleQuotedString(s)) => Ok(Cell::Text(s.clone())),
            _ => Err(wrong()),
        },
        ColumnType::Int => {
            let v = parse_i64_expr(expr).map_err(|_| wrong())?;
            i32::try_from(v)
                .map(Cell::Int)
                .map_err(|_| SqlError::Parse(format!("{v} out of range for {}", column.name)))
        }
        ColumnType::Bool => parse_bool(expr).map(Cell::Bool).map_err(|_| wrong()),
        ColumnType::TextList => match expr {
            Expr::Array(array) => array
                .elem
                .iter()
                .map(|e| match extract_value(e) {
                    Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
                    _ => Err(wrong()),
                })
                .collect::<Result<_, _>>()
                .map(Cell::List),
            _ => match extract_value(expr) {
                Some(Value::SingleQuotedString(s)) => Ok(Cell::List(split_list(s))),
                _ => Err(wrong()),
            },
        },
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect()
}

// ── Helpers ───────────────────────────────────────────────────

fn writable_column(table: &'static TableSchema, name: &str) -> Result<&'static Column, SqlError> {
    let column = table
        .column(name)
        .ok_or_else(|| SqlError::UnknownColumn(table.name, name.to_string()))?;
    if column.access == Access::ReadOnly {
        return Err(SqlError::ReadOnlyColumn(column.name));
    }
    Ok(column)
}

fn returning_id(returning: &Option<Vec<ast::SelectItem>>) -> Result<bool, SqlError> {
    let Some(items) = returning else {
        return Ok(false);
    };
    for item in items {
        match item {
            ast::SelectItem::UnnamedExpr(e) if expr_column_name(e).as_deref() == Some("id") => {}
            other => return Err(SqlError::Unsupported(format!("RETURNING {other}"))),
        }
    }
    Ok(true)
}

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if !values.rows.is_empty() => Ok(values.rows.clone()),
        SetExpr::Values(_) => Err(SqlError::Parse("empty VALUES".into())),
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    ReadOnlyColumn(&'static str),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    TooManyValues(usize),
    Column(CellError),
}

impl From<CellError> for SqlError {
    fn from(e: CellError) -> Self {
        SqlError::Column(e)
    }
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "unknown column {c} in {t}"),
            SqlError::ReadOnlyColumn(c) => write!(f, "column {c} cannot be written"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::TooManyValues(n) => {
                write!(f, "{n} values in list, limit is {MAX_IN_CLAUSE_VALUES}")
            }
            SqlError::Column(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SqlError {}
