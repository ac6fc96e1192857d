use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
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
use tokio::net::TcpStream;

use crate::auth::FuhrparkAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};

pub struct FuhrparkHandler {
    engine: Arc<Engine>,
    /// How far ahead `SELECT * FROM inspections` flags a deadline as due soon.
    inspection_warn: Ms,
    query_parser: Arc<FuhrparkQueryParser>,
}

impl FuhrparkHandler {
    pub fn new(engine: Arc<Engine>, inspection_warn: Ms) -> Self {
        Self {
            engine,
            inspection_warn,
            query_parser: Arc::new(FuhrparkQueryParser),
        }
    }

    /// Parse, execute and record metrics for one statement.
    async fn run(&self, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::InsertVehicle {
                id,
                name,
                inspection_due,
            } => {
                engine
                    .register_vehicle(id, name, inspection_due)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateVehicle { id, patch } => {
                engine
                    .update_vehicle(id, patch)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteVehicle { id } => {
                engine.retire_vehicle(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertReservation(row) => {
                let span = Span::new(row.start, row.end)
                    .map_err(EngineError::from)
                    .map_err(engine_err)?;
                engine
                    .confirm_reservation(row.id, row.vehicle_id, span, row.label)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::BatchInsertReservations(rows) => {
                let count = rows.len();
                let batch = rows
                    .into_iter()
                    .map(|row| {
                        Ok(NewReservation {
                            id: row.id,
                            vehicle_id: row.vehicle_id,
                            span: Span::new(row.start, row.end)?,
                            label: row.label,
                        })
                    })
                    .collect::<Result<Vec<_>, InvalidInterval>>()
                    .map_err(EngineError::from)
                    .map_err(engine_err)?;
                engine
                    .batch_confirm_reservations(batch)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(count))])
            }
            Command::RescheduleReservation { id, start, end } => {
                let span = Span::new(start, end)
                    .map_err(EngineError::from)
                    .map_err(engine_err)?;
                engine
                    .reschedule_reservation(id, span)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SetReservationStatus { id, status } => {
                engine
                    .transition_reservation(id, status)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteReservation { id } => {
                engine.cancel_reservation(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectVehicles => {
                let vehicles = engine.list_vehicles().await;
                let schema = Arc::new(vehicles_schema());
                let rows: Vec<PgWireResult<_>> = vehicles
                    .into_iter()
                    .map(|v| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&v.id.to_string())?;
                        encoder.encode_field(&v.name)?;
                        encoder.encode_field(&v.inspection_due)?;
                        encoder.encode_field(&(v.active_reservations as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectReservations { vehicle_id, status } => {
                let reservations = match vehicle_id {
                    Some(vid) => engine
                        .get_reservations(vid, status)
                        .await
                        .map_err(engine_err)?,
                    None => engine.all_reservations(status).await,
                };
                Ok(vec![reservation_rows(reservations)])
            }
            Command::SelectConflicts {
                vehicle_id,
                start,
                end,
                exclude_id,
            } => {
                let result = engine
                    .check_availability(vehicle_id, start, end, exclude_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![reservation_rows(result.conflicts)])
            }
            Command::SelectInspections => {
                let now = crate::time::now_ms();
                let report = engine.inspection_report(now, self.inspection_warn).await;
                let schema = Arc::new(inspections_schema());
                let rows: Vec<PgWireResult<_>> = report
                    .into_iter()
                    .map(|entry| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&entry.vehicle_id.to_string())?;
                        encoder.encode_field(&entry.name)?;
                        encoder.encode_field(&entry.inspection_due)?;
                        encoder.encode_field(&entry.status.label().to_string())?;
                        encoder.encode_field(&entry.status.days())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
        }
    }
}

fn reservation_rows(reservations: Vec<Interval>) -> Response {
    let schema = Arc::new(reservations_schema());
    let rows: Vec<PgWireResult<_>> = reservations
        .into_iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.resource_id.to_string())?;
            encoder.encode_field(&r.span.start())?;
            encoder.encode_field(&r.span.end())?;
            encoder.encode_field(&r.status.as_str().to_string())?;
            encoder.encode_field(&r.label)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn vehicles_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("inspection_due", Type::INT8),
        text_field("active_reservations", Type::INT8),
    ]
}

fn reservations_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("vehicle_id", Type::VARCHAR),
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
        text_field("status", Type::VARCHAR),
        text_field("label", Type::VARCHAR),
    ]
}

fn inspections_schema() -> Vec<FieldInfo> {
    vec![
        text_field("vehicle_id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("inspection_due", Type::INT8),
        text_field("status", Type::VARCHAR),
        text_field("days", Type::INT8),
    ]
}

/// Row shape of a SELECT, judged from the table it reads.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    if !lower.trim_start().starts_with("select") {
        return vec![];
    }
    let table = lower
        .split_once(" from ")
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .map(|t| t.trim_end_matches(';').trim_matches('"'))
        .unwrap_or("");
    match table {
        "vehicles" => vehicles_schema(),
        "reservations" | "conflicts" => reservations_schema(),
        "inspections" => inspections_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for FuhrparkHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct FuhrparkQueryParser;

#[async_trait]
impl QueryParser for FuhrparkQueryParser {
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
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for FuhrparkHandler {
    type Statement = String;
    type QueryParser = FuhrparkQueryParser;

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
        let mut responses = self.run(&sql).await?;
        if responses.is_empty() {
            return Ok(Response::EmptyQuery);
        }
        Ok(responses.remove(0))
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
            result_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Substitute `$1, $2, ...` with bound parameter values (text format).
/// Highest index first so `$1` never clobbers `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct FuhrparkFactory {
    handler: Arc<FuhrparkHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<FuhrparkAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl FuhrparkFactory {
    pub fn new(engine: Arc<Engine>, password: String, inspection_warn: Ms) -> Self {
        Self {
            handler: Arc::new(FuhrparkHandler::new(engine, inspection_warn)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                FuhrparkAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for FuhrparkFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    inspection_warn: Ms,
) -> std::io::Result<()> {
    let factory = Arc::new(FuhrparkFactory::new(engine, password, inspection_warn));
    pgwire::tokio::process_socket(socket, None, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for an engine failure.
fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Conflict { .. } => "23P01",
        EngineError::InvalidInterval(_) => "22007",
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        _ => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(engine_sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::BadTimestamp(_) => "22007",
        _ => "42601",
    };
    user_error(code, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM vehicles"), 0);
        assert_eq!(
            count_params("INSERT INTO reservations VALUES ($1, $2, $3, $4, $10)"),
            10
        );
        assert_eq!(count_params("SELECT '$'"), 0);
    }

    #[test]
    fn schema_follows_table() {
        assert_eq!(result_schema("SELECT * FROM vehicles").len(), 4);
        assert_eq!(
            result_schema("select * from conflicts where vehicle_id = $1").len(),
            6
        );
        assert_eq!(result_schema("SELECT * FROM inspections;").len(), 5);
        assert!(result_schema("DELETE FROM reservations WHERE id = $1").is_empty());
    }

    #[test]
    fn sqlstates() {
        let conflict = EngineError::Conflict {
            id: Ulid::new(),
            conflicts: vec![Ulid::new()],
        };
        assert_eq!(engine_sqlstate(&conflict), "23P01");
        let invalid = EngineError::from(InvalidInterval { start: 5, end: 5 });
        assert_eq!(engine_sqlstate(&invalid), "22007");
        assert_eq!(
            engine_sqlstate(&EngineError::LimitExceeded("batch too large")),
            "P0001"
        );
    }
}
