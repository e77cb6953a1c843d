use chrono::{DateTime, NaiveDate, Utc};
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertRoom {
        id: Ulid,
        name: String,
        capacity: u32,
        location: Option<String>,
        approver: Option<String>,
        maintenance: Option<Span>,
    },
    UpdateRoom {
        id: Ulid,
        name: String,
        capacity: u32,
        location: Option<String>,
        approver: Option<String>,
        maintenance: Option<Span>,
    },
    DeleteRoom {
        id: Ulid,
    },
    InsertEquipment {
        id: Ulid,
        name: String,
        description: String,
    },
    DeleteEquipment {
        id: Ulid,
    },
    InsertBooking {
        req: BookingRequest,
    },
    /// `UPDATE bookings SET status = '…' WHERE id = …` — the
    /// approve/reject/cancel transitions.
    SetBookingStatus {
        id: Ulid,
        status: BookingStatus,
    },
    /// Time/content edit (drag-and-reschedule included).
    UpdateBooking {
        id: Ulid,
        patch: BookingPatch,
    },
    /// Cancel alias.
    DeleteBooking {
        id: Ulid,
    },
    SelectRooms,
    SelectEquipment,
    SelectBookings {
        room_id: Ulid,
        window: Option<Span>,
        status: Option<BookingStatus>,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let upper = trimmed.to_uppercase();
    if upper.starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().to_string();
        return Ok(Command::Listen { channel });
    }
    if upper == "UNLISTEN *" {
        return Ok(Command::UnlistenAll);
    }
    if upper.starts_with("UNLISTEN ") {
        let channel = trimmed[9..].trim().to_string();
        return Ok(Command::Unlisten { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "rooms" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("rooms", 3, values.len()));
            }
            let maintenance = parse_maintenance(&values, 5)?;
            Ok(Command::InsertRoom {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
                capacity: parse_u32(&values[2])?,
                location: opt_string(&values, 3)?,
                approver: opt_string(&values, 4)?,
                maintenance,
            })
        }
        "equipment" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("equipment", 2, values.len()));
            }
            Ok(Command::InsertEquipment {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
                description: opt_string(&values, 2)?.unwrap_or_default(),
            })
        }
        "bookings" => {
            if values.len() < 6 {
                return Err(SqlError::WrongArity("bookings", 6, values.len()));
            }
            let equipment = match values.get(11) {
                Some(expr) => parse_ulid_list(expr)?,
                None => Vec::new(),
            };
            let recurrence = parse_recurrence(&values, 12)?;
            Ok(Command::InsertBooking {
                req: BookingRequest {
                    id: parse_ulid(&values[0])?,
                    room_id: parse_ulid(&values[1])?,
                    span: Span::new(parse_timestamp(&values[2])?, parse_timestamp(&values[3])?),
                    title: parse_string(&values[4])?,
                    participants: parse_u32(&values[5])?,
                    chairman: opt_string(&values, 6)?.unwrap_or_default(),
                    department: opt_string(&values, 7)?.unwrap_or_default(),
                    description: opt_string(&values, 8)?.unwrap_or_default(),
                    extra_requests: opt_string(&values, 9)?.unwrap_or_default(),
                    notes: opt_string(&values, 10)?.unwrap_or_default(),
                    equipment,
                    recurrence,
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Positions `at` and `at + 1` hold an optional maintenance window:
/// absent or both NULL means none; anything else needs both bounds.
fn parse_maintenance(values: &[Expr], at: usize) -> Result<Option<Span>, SqlError> {
    let start = match values.get(at) {
        Some(expr) => parse_timestamp_or_null(expr)?,
        None => None,
    };
    let end = match values.get(at + 1) {
        Some(expr) => parse_timestamp_or_null(expr)?,
        None => None,
    };
    match (start, end) {
        (None, None) => Ok(None),
        (Some(s), Some(e)) => Ok(Some(Span::new(s, e))),
        _ => Err(SqlError::Parse(
            "maintenance window needs both maintenance_start and maintenance_end".into(),
        )),
    }
}

/// Positions `at` (repeat) and `at + 1` (repeat_until).
fn parse_recurrence(values: &[Expr], at: usize) -> Result<Recurrence, SqlError> {
    let kind = match values.get(at) {
        Some(expr) => parse_string(expr)?.to_lowercase(),
        None => return Ok(Recurrence::Once),
    };
    if kind == "none" {
        return Ok(Recurrence::Once);
    }
    let until = match values.get(at + 1) {
        Some(expr) => parse_date_or_null(expr)?,
        None => None,
    };
    let until = until.ok_or_else(|| {
        SqlError::Parse(format!("repeat '{kind}' requires a repeat_until date"))
    })?;
    match kind.as_str() {
        "weekly" => Ok(Recurrence::Weekly { until }),
        "monthly" => Ok(Recurrence::Monthly { until }),
        other => Err(SqlError::Parse(format!("unknown repeat kind: {other}"))),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "rooms" => Ok(Command::DeleteRoom { id }),
        "equipment" => Ok(Command::DeleteEquipment { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;

    match table.as_str() {
        "rooms" => parse_update_room(id, assignments),
        "bookings" => parse_update_booking(id, assignments),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `UPDATE rooms` is a full replace: name and capacity are required,
/// omitted optional columns become NULL.
fn parse_update_room(id: Ulid, assignments: &[ast::Assignment]) -> Result<Command, SqlError> {
    let mut name = None;
    let mut capacity = None;
    let mut location = None;
    let mut approver = None;
    let mut maintenance_start = None;
    let mut maintenance_end = None;

    for assignment in assignments {
        let col = assignment_column(assignment)?;
        let value = &assignment.value;
        match col.as_str() {
            "name" => name = Some(parse_string(value)?),
            "capacity" => capacity = Some(parse_u32(value)?),
            "location" => location = parse_string_or_null(value)?,
            "approver" => approver = parse_string_or_null(value)?,
            "maintenance_start" => maintenance_start = parse_timestamp_or_null(value)?,
            "maintenance_end" => maintenance_end = parse_timestamp_or_null(value)?,
            other => return Err(SqlError::Parse(format!("unknown rooms column: {other}"))),
        }
    }

    let name = name.ok_or(SqlError::MissingFilter("name"))?;
    let capacity = capacity.ok_or(SqlError::MissingFilter("capacity"))?;
    let maintenance = match (maintenance_start, maintenance_end) {
        (None, None) => None,
        (Some(s), Some(e)) => Some(Span::new(s, e)),
        _ => {
            return Err(SqlError::Parse(
                "maintenance window needs both maintenance_start and maintenance_end".into(),
            ))
        }
    };

    Ok(Command::UpdateRoom { id, name, capacity, location, approver, maintenance })
}

fn parse_update_booking(id: Ulid, assignments: &[ast::Assignment]) -> Result<Command, SqlError> {
    let has_status = assignments
        .iter()
        .any(|a| assignment_column(a).is_ok_and(|c| c == "status"));

    if has_status {
        if assignments.len() != 1 {
            return Err(SqlError::Unsupported(
                "status cannot be combined with other assignments".into(),
            ));
        }
        let raw = parse_string(&assignments[0].value)?;
        let status = BookingStatus::parse(&raw)
            .ok_or_else(|| SqlError::Parse(format!("unknown status: {raw}")))?;
        if status == BookingStatus::Pending {
            return Err(SqlError::Unsupported("cannot set status to pending".into()));
        }
        return Ok(Command::SetBookingStatus { id, status });
    }

    let mut patch = BookingPatch::default();
    let mut start = None;
    let mut end = None;

    for assignment in assignments {
        let col = assignment_column(assignment)?;
        let value = &assignment.value;
        match col.as_str() {
            "start" => start = Some(parse_timestamp(value)?),
            "end" => end = Some(parse_timestamp(value)?),
            "title" => patch.title = Some(parse_string(value)?),
            "participants" => patch.participants = Some(parse_u32(value)?),
            "chairman" => patch.chairman = Some(parse_string(value)?),
            "department" => patch.department = Some(parse_string(value)?),
            "description" => patch.description = Some(parse_string(value)?),
            "extra_requests" => patch.extra_requests = Some(parse_string(value)?),
            "notes" => patch.notes = Some(parse_string(value)?),
            "equipment" => patch.equipment = Some(parse_ulid_list(value)?),
            other => return Err(SqlError::Parse(format!("unknown bookings column: {other}"))),
        }
    }

    patch.span = match (start, end) {
        (None, None) => None,
        (Some(s), Some(e)) => Some(Span::new(s, e)),
        (Some(_), None) => return Err(SqlError::MissingFilter("end")),
        (None, Some(_)) => return Err(SqlError::MissingFilter("start")),
    };

    if patch == BookingPatch::default() {
        return Err(SqlError::Parse("empty update".into()));
    }

    Ok(Command::UpdateBooking { id, patch })
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    match table.as_str() {
        "rooms" => Ok(Command::SelectRooms),
        "equipment" => Ok(Command::SelectEquipment),
        "bookings" => {
            let (mut room_id, mut start, mut end, mut status) = (None, None, None, None);
            if let Some(selection) = &select.selection {
                extract_booking_filters(selection, &mut room_id, &mut start, &mut end, &mut status)?;
            }
            let window = match (start, end) {
                (None, None) => None,
                (Some(s), Some(e)) => Some(Span::new(s, e)),
                (Some(_), None) => return Err(SqlError::MissingFilter("end")),
                (None, Some(_)) => return Err(SqlError::MissingFilter("start")),
            };
            Ok(Command::SelectBookings {
                room_id: room_id.ok_or(SqlError::MissingFilter("room_id"))?,
                window,
                status,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_booking_filters(
    expr: &Expr,
    room_id: &mut Option<Ulid>,
    start: &mut Option<DateTime<Utc>>,
    end: &mut Option<DateTime<Utc>>,
    status: &mut Option<BookingStatus>,
) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_booking_filters(left, room_id, start, end, status)?;
                extract_booking_filters(right, room_id, start, end, status)?;
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left);
                if col.as_deref() == Some("room_id") {
                    *room_id = Some(parse_ulid(right)?);
                } else if col.as_deref() == Some("status") {
                    let raw = parse_string(right)?;
                    *status = Some(
                        BookingStatus::parse(&raw)
                            .ok_or_else(|| SqlError::Parse(format!("unknown status: {raw}")))?,
                    );
                }
            }
            ast::BinaryOperator::GtEq => {
                if expr_column_name(left).as_deref() == Some("start") {
                    *start = Some(parse_timestamp(right)?);
                }
            }
            ast::BinaryOperator::LtEq => {
                if expr_column_name(left).as_deref() == Some("end") {
                    *end = Some(parse_timestamp(right)?);
                }
            }
            _ => {}
        }
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
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
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

fn assignment_column(assignment: &ast::Assignment) -> Result<String, SqlError> {
    match &assignment.target {
        ast::AssignmentTarget::ColumnName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))
        }
        _ => Err(SqlError::Parse("unsupported assignment target".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            if values.rows.len() > 1 {
                // Recurring requests use the repeat columns; multi-row
                // inserts have no all-or-nothing story of their own here.
                return Err(SqlError::Unsupported("multi-row insert".into()));
            }
            Ok(values.rows[0].clone())
        }
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
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
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
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

/// Comma-separated ULIDs in one string ('' or NULL means none).
fn parse_ulid_list(expr: &Expr) -> Result<Vec<Ulid>, SqlError> {
    let raw = match extract_value(expr) {
        Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::SingleQuotedString(s)) => s,
        Some(other) => return Err(SqlError::Parse(format!("expected string, got {other:?}"))),
        None => return Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    };
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}"))))
        .collect()
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) => Ok(s.clone()),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => Ok(Some(parse_string(expr)?)),
    }
}

fn opt_string(values: &[Expr], at: usize) -> Result<Option<String>, SqlError> {
    match values.get(at) {
        Some(expr) => parse_string_or_null(expr),
        None => Ok(None),
    }
}

fn parse_timestamp(expr: &Expr) -> Result<DateTime<Utc>, SqlError> {
    let raw = parse_string(expr)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SqlError::Parse(format!("bad timestamp '{raw}': {e}")))
}

fn parse_timestamp_or_null(expr: &Expr) -> Result<Option<DateTime<Utc>>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => Ok(Some(parse_timestamp(expr)?)),
    }
}

fn parse_date_or_null(expr: &Expr) -> Result<Option<NaiveDate>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => {
            let raw = parse_string(expr)?;
            NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
                .map(Some)
                .map_err(|e| SqlError::Parse(format!("bad date '{raw}': {e}")))
        }
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
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

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
