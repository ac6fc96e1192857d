use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// One `VALUES` row of `INSERT INTO reservations`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReservationRow {
    pub id: Ulid,
    pub vehicle_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub label: Option<String>,
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertVehicle {
        id: Ulid,
        name: Option<String>,
        inspection_due: Option<Ms>,
    },
    UpdateVehicle {
        id: Ulid,
        patch: VehiclePatch,
    },
    DeleteVehicle {
        id: Ulid,
    },
    InsertReservation(ReservationRow),
    BatchInsertReservations(Vec<ReservationRow>),
    RescheduleReservation {
        id: Ulid,
        start: Ms,
        end: Ms,
    },
    SetReservationStatus {
        id: Ulid,
        status: IntervalStatus,
    },
    DeleteReservation {
        id: Ulid,
    },
    SelectVehicles,
    SelectReservations {
        vehicle_id: Option<Ulid>,
        status: Option<IntervalStatus>,
    },
    SelectConflicts {
        vehicle_id: Ulid,
        start: Ms,
        end: Ms,
        exclude_id: Option<Ulid>,
    },
    SelectInspections,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_insert_rows(insert)?;

    match table.as_str() {
        "vehicles" => {
            if rows.len() != 1 {
                return Err(SqlError::Unsupported("multi-row vehicle insert".into()));
            }
            let values = &rows[0];
            if values.is_empty() {
                return Err(SqlError::WrongArity("vehicles", 1, 0));
            }
            Ok(Command::InsertVehicle {
                id: parse_ulid(&values[0])?,
                name: values.get(1).map(parse_string_or_null).transpose()?.flatten(),
                inspection_due: values.get(2).map(parse_timestamp_or_null).transpose()?.flatten(),
            })
        }
        "reservations" => {
            let mut parsed = Vec::with_capacity(rows.len());
            for (i, row) in rows.iter().enumerate() {
                let r = parse_reservation_row(row).map_err(|e| match e {
                    SqlError::Parse(msg) if rows.len() > 1 => SqlError::Parse(format!("row {i}: {msg}")),
                    other => other,
                })?;
                parsed.push(r);
            }
            if parsed.len() == 1 {
                Ok(Command::InsertReservation(parsed.remove(0)))
            } else {
                Ok(Command::BatchInsertReservations(parsed))
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_reservation_row(values: &[Expr]) -> Result<ReservationRow, SqlError> {
    if values.len() < 4 {
        return Err(SqlError::WrongArity("reservations", 4, values.len()));
    }
    Ok(ReservationRow {
        id: parse_ulid(&values[0])?,
        vehicle_id: parse_ulid(&values[1])?,
        start: parse_timestamp_expr(&values[2])?,
        end: parse_timestamp_expr(&values[3])?,
        label: values.get(4).map(parse_string_or_null).transpose()?.flatten(),
    })
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;

    let mut columns = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        columns.push((column, &assignment.value));
    }

    match table.as_str() {
        "vehicles" => {
            let mut patch = VehiclePatch::default();
            for (column, value) in columns {
                match column.as_str() {
                    "name" => patch.name = Some(parse_string_or_null(value)?),
                    "inspection_due" => {
                        patch.inspection_due = Some(parse_timestamp_or_null(value)?)
                    }
                    _ => return Err(SqlError::UnknownColumn(column)),
                }
            }
            Ok(Command::UpdateVehicle { id, patch })
        }
        "reservations" => {
            let (mut start, mut end, mut status) = (None, None, None);
            for (column, value) in columns {
                match column.as_str() {
                    "start" => start = Some(parse_timestamp_expr(value)?),
                    "end" => end = Some(parse_timestamp_expr(value)?),
                    "status" => status = Some(parse_status(value)?),
                    _ => return Err(SqlError::UnknownColumn(column)),
                }
            }
            match (start, end, status) {
                (Some(start), Some(end), None) => {
                    Ok(Command::RescheduleReservation { id, start, end })
                }
                (None, None, Some(status)) => Ok(Command::SetReservationStatus { id, status }),
                (None, None, None) => Err(SqlError::Parse("UPDATE without SET".into())),
                (_, _, Some(_)) => Err(SqlError::Unsupported(
                    "status and span cannot change in one statement".into(),
                )),
                (None, _, None) => Err(SqlError::MissingColumn("start")),
                (_, None, None) => Err(SqlError::MissingColumn("end")),
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "vehicles" => Ok(Command::DeleteVehicle { id }),
        "reservations" => Ok(Command::DeleteReservation { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "vehicles" => Ok(Command::SelectVehicles),
        "inspections" => Ok(Command::SelectInspections),
        "reservations" => Ok(Command::SelectReservations {
            vehicle_id: filters.vehicle_id,
            status: filters.status,
        }),
        "conflicts" => Ok(Command::SelectConflicts {
            vehicle_id: filters.vehicle_id.ok_or(SqlError::MissingFilter("vehicle_id"))?,
            start: filters.start.ok_or(SqlError::MissingFilter("start"))?,
            end: filters.end.ok_or(SqlError::MissingFilter("end"))?,
            exclude_id: filters.exclude_id,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Default)]
struct Filters {
    vehicle_id: Option<Ulid>,
    status: Option<IntervalStatus>,
    start: Option<Ms>,
    end: Option<Ms>,
    exclude_id: Option<Ulid>,
}

/// Walk an `AND` chain of `column op value` comparisons.
/// `start` accepts `=` or `>=`, `end` accepts `=` or `<=`.
fn collect_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    let Expr::BinaryOp { left, op, right } = expr else {
        return Err(SqlError::Unsupported(format!("filter: {expr}")));
    };
    if *op == ast::BinaryOperator::And {
        collect_filters(left, filters)?;
        return collect_filters(right, filters);
    }
    let column = expr_column_name(left).ok_or_else(|| SqlError::Unsupported(format!("filter: {expr}")))?;
    match (column.as_str(), op) {
        ("vehicle_id", ast::BinaryOperator::Eq) => filters.vehicle_id = Some(parse_ulid(right)?),
        ("status", ast::BinaryOperator::Eq) => filters.status = Some(parse_status(right)?),
        ("exclude_id", ast::BinaryOperator::Eq) => filters.exclude_id = Some(parse_ulid(right)?),
        ("start", ast::BinaryOperator::Eq | ast::BinaryOperator::GtEq) => {
            filters.start = Some(parse_timestamp_expr(right)?)
        }
        ("end", ast::BinaryOperator::Eq | ast::BinaryOperator::LtEq) => {
            filters.end = Some(parse_timestamp_expr(right)?)
        }
        _ => return Err(SqlError::Unsupported(format!("filter: {expr}"))),
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────

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
    let tables = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    let first = tables
        .first()
        .ok_or_else(|| SqlError::Parse("DELETE without table".into()))?;
    table_factor_name(&first.relation)
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
    let source = insert
        .source
        .as_ref()
        .ok_or_else(|| SqlError::Parse("no VALUES".into()))?;
    match source.body.as_ref() {
        SetExpr::Values(values) if !values.rows.is_empty() => Ok(values.rows.clone()),
        SetExpr::Values(_) => Err(SqlError::Parse("empty VALUES".into())),
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    match selection {
        Some(Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        }) if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s}: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_status(expr: &Expr) -> Result<IntervalStatus, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => s.parse().map_err(SqlError::Parse),
        _ => Err(SqlError::Parse(format!("expected status string, got {expr}"))),
    }
}

/// Integer milliseconds, or a quoted date/date-time.
fn parse_timestamp_expr(expr: &Expr) -> Result<Ms, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        let value = parse_timestamp_expr(expr)?;
        return value
            .checked_neg()
            .ok_or_else(|| SqlError::BadTimestamp(format!("-{value}")));
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad timestamp {s}: {e}"))),
        Some(Value::SingleQuotedString(s)) => {
            crate::time::parse_timestamp(s).ok_or_else(|| SqlError::BadTimestamp(s.clone()))
        }
        Some(value) => Err(SqlError::Parse(format!("expected timestamp, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_timestamp_or_null(expr: &Expr) -> Result<Option<Ms>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_timestamp_expr(expr).map(Some),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("{0}: expected at least {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("unrecognized timestamp: {0}")]
    BadTimestamp(String),
}
