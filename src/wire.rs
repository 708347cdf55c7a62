use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::StartupHandler;
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::engine::{Engine, EngineError};
use crate::model::Span;
use crate::observability;
use crate::schema::{Cell, ColumnType, InsertedId, Record, TableSchema};
use crate::sql::{self, Command, SqlError};

pub struct RentalHandler {
    engine: Arc<Engine>,
    query_parser: Arc<RentalQueryParser>,
}

impl RentalHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(RentalQueryParser),
        }
    }

    /// `format` is the client's requested result format (extended protocol
    /// only); the simple protocol always gets text.
    async fn run(&self, query: &str, format: Option<&Format>) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        cmd: Command,
        format: Option<&Format>,
    ) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertCar { car, returning } => {
                let id = engine.create_car(car).await.map_err(engine_err)?;
                Ok(inserted(id, returning, format))
            }
            Command::UpdateCar { id, patch } => {
                engine.update_car(id, patch).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteCar { id } => {
                engine.delete_car(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectCars { id: Some(id) } => match engine.get_car(id).await {
                Ok(car) => Ok(rows(vec![car], format)),
                Err(EngineError::NotFound(_)) => Ok(rows(Vec::<crate::model::Car>::new(), format)),
                Err(e) => Err(engine_err(e)),
            },
            Command::SelectCars { id: None } => Ok(rows(engine.list_cars().await, format)),
            Command::InsertBooking { request, returning } => {
                let id = engine.create_booking(request).await.map_err(engine_err)?;
                Ok(inserted(id, returning, format))
            }
            Command::DeleteBooking { id } => {
                engine.delete_booking(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectBookings { id, car_id } => {
                let mut bookings = match id {
                    Some(id) => match engine.get_booking(id).await {
                        Ok(b) => vec![b],
                        Err(EngineError::NotFound(_)) => Vec::new(),
                        Err(e) => return Err(engine_err(e)),
                    },
                    None => match engine.list_bookings(car_id).await {
                        Ok(bookings) => bookings,
                        Err(EngineError::NotFound(_)) => Vec::new(),
                        Err(e) => return Err(engine_err(e)),
                    },
                };
                if let Some(car_id) = car_id {
                    bookings.retain(|b| b.car_id == car_id);
                }
                Ok(rows(bookings, format))
            }
            Command::SelectAvailability { car_id, from, to } => {
                let span: Span = crate::engine::parse_window(from.as_deref(), to.as_deref())
                    .map_err(engine_err)?;
                let info = engine
                    .check_availability(car_id, span)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(vec![info], format))
            }
            Command::SearchCars { query } => {
                let cars = engine.search_cars(query).await.map_err(engine_err)?;
                Ok(rows(cars, format))
            }
        }
    }
}

fn inserted(id: ulid::Ulid, returning: bool, format: Option<&Format>) -> Response {
    if returning {
        rows(vec![InsertedId(id)], format)
    } else {
        Response::Execution(Tag::new("INSERT").with_rows(1))
    }
}

// ── Row encoding ─────────────────────────────────────────────────

fn pg_type(ty: ColumnType) -> Type {
    match ty {
        ColumnType::Int => Type::INT4,
        ColumnType::Bool => Type::BOOL,
        ColumnType::Id | ColumnType::Text | ColumnType::Timestamp | ColumnType::TextList => {
            Type::VARCHAR
        }
    }
}

fn fields(schema: &TableSchema, format: Option<&Format>) -> Vec<FieldInfo> {
    schema
        .readable()
        .enumerate()
        .map(|(i, c)| {
            let field_format = format.map_or(FieldFormat::Text, |f| f.format_for(i));
            FieldInfo::new(c.name.into(), None, None, pg_type(c.ty), field_format)
        })
        .collect()
}

fn encode_cell(encoder: &mut DataRowEncoder, cell: Cell) -> PgWireResult<()> {
    match cell {
        Cell::Null => encoder.encode_field(&None::<String>),
        Cell::Id(id) => encoder.encode_field(&id.to_string()),
        Cell::Text(s) => encoder.encode_field(&s),
        Cell::Int(v) => encoder.encode_field(&v),
        Cell::Bool(b) => encoder.encode_field(&b),
        Cell::List(items) => encoder.encode_field(&items.join(",")),
    }
}

fn rows<R: Record>(records: Vec<R>, format: Option<&Format>) -> Response {
    let table = R::schema();
    let schema = Arc::new(fields(table, format));
    let rows: Vec<PgWireResult<_>> = records
        .iter()
        .map(|record| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            for column in table.readable() {
                encode_cell(&mut encoder, record.cell(column))?;
            }
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn describe_fields(sql: &str, format: Option<&Format>) -> Vec<FieldInfo> {
    sql::result_schema(sql)
        .map(|schema| fields(schema, format))
        .unwrap_or_default()
}

#[async_trait]
impl SimpleQueryHandler for RentalHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(query, None).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RentalQueryParser;

#[async_trait]
impl QueryParser for RentalQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(describe_fields(stmt, column_format))
    }
}

#[async_trait]
impl ExtendedQueryHandler for RentalHandler {
    type Statement = String;
    type QueryParser = RentalQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        self.run(&sql, Some(&portal.result_column_format)).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            describe_fields(&target.statement, None),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(describe_fields(
            &target.statement.statement,
            Some(&target.result_column_format),
        )))
    }
}

/// Count the highest $N parameter placeholder outside quoted literals.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let mut in_literal = false;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\'' {
            in_literal = !in_literal;
            i += 1;
        } else if bytes[i] == b'$' && !in_literal {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if let Ok(n) = sql[start..i].parse::<usize>() {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

/// Single left-to-right pass. A `$N` inside a quoted literal, or inside a
/// value already bound, is left as written.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut in_literal = false;
    let mut chars = sql.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '\'' {
            in_literal = !in_literal;
        }
        if c != '$' || in_literal {
            out.push(c);
            continue;
        }
        let mut end = i + 1;
        while let Some(&(j, d)) = chars.peek() {
            if !d.is_ascii_digit() {
                break;
            }
            end = j + 1;
            chars.next();
        }
        let bound = sql[i + 1..end]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|n| params.get(n));
        match bound {
            Some(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            None => out.push_str(&sql[i..end]),
        }
    }
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct RentalFactory {
    handler: Arc<RentalHandler>,
    noop: Arc<NoopHandler>,
}

impl RentalFactory {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            handler: Arc::new(RentalHandler::new(engine)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RentalFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.noop.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(RentalFactory::new(engine));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::Conflict { .. } => "23P01",
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::HasBookings(_) => "23503",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
