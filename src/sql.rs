use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

/// Column values of an `INSERT INTO classes` row.
#[derive(Debug, Clone, PartialEq)]
pub struct NewClass {
    pub id: Ulid,
    pub name: Option<String>,
    pub start_time: Ms,
    pub end_time: Ms,
    pub capacity: u32,
    pub waitlist_enabled: bool,
    pub waitlist_capacity: u32,
    pub booking_opens_hours: Option<u32>,
    pub booking_closes_minutes: u32,
    pub cancellation_deadline_hours: u32,
}

impl NewClass {
    pub fn into_session(self, organization_id: &str) -> ClassSession {
        ClassSession {
            id: self.id,
            organization_id: organization_id.to_string(),
            name: self.name,
            start_time: self.start_time,
            end_time: self.end_time,
            capacity: self.capacity,
            waitlist_enabled: self.waitlist_enabled,
            waitlist_capacity: self.waitlist_capacity,
            booking_opens_hours: self.booking_opens_hours,
            booking_closes_minutes: self.booking_closes_minutes,
            cancellation_deadline_hours: self.cancellation_deadline_hours,
            is_cancelled: false,
            confirmed_count: 0,
        }
    }
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertClass(NewClass),
    CancelClass {
        id: Ulid,
    },
    SelectClass {
        id: Ulid,
    },
    InsertBooking {
        class_id: Ulid,
        member_id: Ulid,
        acting_member_id: Option<Ulid>,
    },
    CancelBooking {
        id: Ulid,
        acting_member_id: Option<Ulid>,
        reason: Option<String>,
    },
    CheckIn {
        id: Ulid,
    },
    MarkNoShow {
        id: Ulid,
    },
    SelectBookings {
        class_id: Ulid,
    },
    InsertMembership {
        member_id: Ulid,
        status: MembershipStatus,
        valid_from: Ms,
        valid_until: Option<Ms>,
    },
    ConfigureLimits {
        max_classes_per_day: Option<u32>,
        timezone: String,
    },
}

/// Column order assumed when an INSERT omits its column list.
const CLASS_COLUMNS: &[&str] = &[
    "id",
    "start_time",
    "end_time",
    "capacity",
    "waitlist_enabled",
    "waitlist_capacity",
    "booking_opens_hours",
    "booking_closes_minutes",
    "cancellation_deadline_hours",
    "name",
];
const BOOKING_COLUMNS: &[&str] = &["class_id", "member_id", "acting_member_id"];
const MEMBERSHIP_COLUMNS: &[&str] = &["member_id", "status", "valid_from", "valid_until"];
const SETTINGS_COLUMNS: &[&str] = &["max_classes_per_day", "timezone"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection.as_ref()),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES row keyed by column name.
struct Row(Vec<(String, Expr)>);

impl Row {
    fn get(&self, col: &str) -> Option<&Expr> {
        self.0.iter().find(|(c, _)| c == col).map(|(_, e)| e)
    }

    fn require(&self, col: &'static str) -> Result<&Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingColumn(col))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let defaults = match table.as_str() {
        "classes" => CLASS_COLUMNS,
        "bookings" => BOOKING_COLUMNS,
        "memberships" => MEMBERSHIP_COLUMNS,
        "settings" => SETTINGS_COLUMNS,
        _ => return Err(SqlError::UnknownTable(table)),
    };
    let row = insert_row(insert, defaults)?;

    match table.as_str() {
        "classes" => {
            let class = NewClass {
                id: parse_ulid_expr(row.require("id")?)?,
                name: row.get("name").map(parse_string_or_null).transpose()?.flatten(),
                start_time: parse_i64_expr(row.require("start_time")?)?,
                end_time: parse_i64_expr(row.require("end_time")?)?,
                capacity: parse_u32(row.require("capacity")?)?,
                waitlist_enabled: row.get("waitlist_enabled").map(parse_bool).transpose()?.unwrap_or(false),
                waitlist_capacity: optional_u32(&row, "waitlist_capacity")?.unwrap_or(0),
                booking_opens_hours: optional_u32(&row, "booking_opens_hours")?,
                booking_closes_minutes: optional_u32(&row, "booking_closes_minutes")?.unwrap_or(0),
                cancellation_deadline_hours: optional_u32(&row, "cancellation_deadline_hours")?.unwrap_or(0),
            };
            Ok(Command::InsertClass(class))
        }
        "bookings" => Ok(Command::InsertBooking {
            class_id: parse_ulid_expr(row.require("class_id")?)?,
            member_id: parse_ulid_expr(row.require("member_id")?)?,
            acting_member_id: row.get("acting_member_id").map(parse_ulid_or_null).transpose()?.flatten(),
        }),
        "memberships" => {
            let status = parse_string(row.require("status")?)?;
            Ok(Command::InsertMembership {
                member_id: parse_ulid_expr(row.require("member_id")?)?,
                status: status.parse().map_err(SqlError::Parse)?,
                valid_from: parse_i64_expr(row.require("valid_from")?)?,
                valid_until: row.get("valid_until").map(parse_i64_or_null).transpose()?.flatten(),
            })
        }
        _ => Ok(Command::ConfigureLimits {
            max_classes_per_day: optional_u32(&row, "max_classes_per_day")?,
            timezone: row
                .get("timezone")
                .map(parse_string)
                .transpose()?
                .unwrap_or_else(|| "UTC".to_string()),
        }),
    }
}

fn insert_row(insert: &ast::Insert, defaults: &[&str]) -> Result<Row, SqlError> {
    let values = extract_insert_values(insert)?;
    let names: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if values.len() > names.len() || (!insert.columns.is_empty() && values.len() != names.len()) {
        return Err(SqlError::WrongArity(names.len(), values.len()));
    }
    Ok(Row(names.into_iter().zip(values).collect()))
}

fn optional_u32(row: &Row, col: &str) -> Result<Option<u32>, SqlError> {
    match row.get(col) {
        None => Ok(None),
        Some(expr) if is_null(expr) => Ok(None),
        Some(expr) => parse_u32(expr).map(Some),
    }
}

// ── DELETE / UPDATE / SELECT ──────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = where_equalities(delete.selection.as_ref())?;
    match table.as_str() {
        "classes" => Ok(Command::CancelClass {
            id: required_filter(&filters, "id")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(relation: &TableFactor, assignments: &[ast::Assignment], selection: Option<&Expr>) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    if table != "bookings" {
        return Err(SqlError::UnknownTable(table));
    }

    let mut status = None;
    let mut reason = None;
    for assignment in assignments {
        let col = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        };
        match col.as_deref() {
            Some("status") => status = Some(parse_string(&assignment.value)?),
            Some("cancellation_reason") => reason = parse_string_or_null(&assignment.value)?,
            Some(other) => return Err(SqlError::Unsupported(format!("cannot set column {other}"))),
            None => return Err(SqlError::Unsupported("tuple assignment".into())),
        }
    }
    let status: BookingStatus = status
        .ok_or(SqlError::MissingColumn("status"))?
        .parse()
        .map_err(SqlError::Parse)?;

    let filters = where_equalities(selection)?;
    let id = required_filter(&filters, "id")?;
    let acting_member_id = filters
        .iter()
        .find(|(c, _)| c == "acting_member_id")
        .map(|(_, e)| parse_ulid_expr(e))
        .transpose()?;

    match status {
        BookingStatus::Cancelled => Ok(Command::CancelBooking {
            id,
            acting_member_id,
            reason,
        }),
        BookingStatus::Attended => Ok(Command::CheckIn { id }),
        BookingStatus::NoShow => Ok(Command::MarkNoShow { id }),
        other => Err(SqlError::Unsupported(format!("cannot set status to {other}"))),
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
    let filters = where_equalities(select.selection.as_ref())?;

    match table.as_str() {
        "classes" => Ok(Command::SelectClass {
            id: required_filter(&filters, "id")?,
        }),
        "bookings" => Ok(Command::SelectBookings {
            class_id: required_filter(&filters, "class_id")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = x AND b = y …` into `(column, value)` pairs.
fn where_equalities(selection: Option<&Expr>) -> Result<Vec<(String, Expr)>, SqlError> {
    let mut out = Vec::new();
    if let Some(expr) = selection {
        collect_equalities(expr, &mut out)?;
    }
    Ok(out)
}

fn collect_equalities(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_equalities(left, out)?;
            collect_equalities(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left).ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
            out.push((col, right.as_ref().clone()));
            Ok(())
        }
        Expr::Nested(inner) => collect_equalities(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

fn required_filter(filters: &[(String, Expr)], col: &'static str) -> Result<Ulid, SqlError> {
    let (_, expr) = filters
        .iter()
        .find(|(c, _)| c == col)
        .ok_or(SqlError::MissingFilter(col))?;
    parse_ulid_expr(expr)
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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        Ok(None)
    } else {
        parse_ulid_expr(expr).map(Some)
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    if is_null(expr) {
        Ok(None)
    } else {
        parse_i64_expr(expr).map(Some)
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
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
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        Ok(None)
    } else {
        parse_string(expr).map(Some)
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("expected {0} values, got {1}")]
    WrongArity(usize, usize),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
