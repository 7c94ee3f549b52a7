use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveTime, Weekday};
use sqlparser::ast::{
    self, AssignmentTarget, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, UnaryOperator, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::engine::Action;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertProvider {
        id: Ulid,
        name: Option<String>,
    },
    DeleteProvider {
        id: Ulid,
    },
    /// `false` is the bulk "not available" update.
    SetProviderAvailable {
        id: Ulid,
        available: bool,
    },
    /// Replaces the weekday's slot list.
    InsertWeeklySlots {
        provider_id: Ulid,
        weekday: Weekday,
        slots: Vec<Slot>,
    },
    ClearWeeklySlots {
        provider_id: Ulid,
        weekday: Weekday,
    },
    /// One or more dates, each replaced wholesale. A date may map to no slots.
    InsertDateSlots {
        provider_id: Ulid,
        dates: BTreeMap<NaiveDate, Vec<Slot>>,
    },
    DeleteDateSlots {
        provider_id: Ulid,
        date: NaiveDate,
    },
    InsertBooking {
        id: Ulid,
        provider_id: Ulid,
        start: Ms,
        end: Ms,
        requester_id: Option<String>,
        mode: Mode,
        notes: Option<String>,
        kind: BookingKind,
    },
    DeleteBooking {
        id: Ulid,
    },
    UpdateBookingStatus {
        id: Ulid,
        action: Action,
    },
    SelectProviders,
    SelectWeeklySlots {
        provider_id: Ulid,
    },
    SelectDateSlots {
        provider_id: Ulid,
    },
    SelectAvailability {
        provider_id: Ulid,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
        requester_id: Option<String>,
    },
    SelectTodayAvailability {
        provider_id: Ulid,
    },
    SelectBookings {
        provider_id: Ulid,
        active_only: bool,
        from: Option<NaiveDate>,
    },
    SelectQuota {
        requester_id: String,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };
    parse_statement(stmt)
}

/// Every `;`-separated statement of a simple query, in order.
pub fn parse_batch(sql: &str) -> Result<Vec<Command>, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    stmts.iter().map(parse_statement).collect()
}

fn parse_statement(stmt: &Statement) -> Result<Command, SqlError> {
    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection.as_ref()),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES row, addressable by column name. Without an explicit column
/// list the table's default order applies.
struct Row<'a> {
    table: &'static str,
    columns: &'a [String],
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn get(&self, column: &str) -> Option<&'a Expr> {
        let pos = self.columns.iter().position(|c| c == column)?;
        self.values.get(pos)
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(self.table, column))
    }
}

const PROVIDER_COLUMNS: &[&str] = &["id", "name"];
const WEEKLY_COLUMNS: &[&str] = &["provider_id", "weekday", "start_time", "end_time", "available"];
const DATE_COLUMNS: &[&str] = &["provider_id", "date", "start_time", "end_time", "available"];
const BOOKING_COLUMNS: &[&str] = &[
    "id",
    "provider_id",
    "start",
    "end",
    "requester_id",
    "mode",
    "notes",
    "kind",
];

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_insert_rows(insert)?;
    let named: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
    let columns_for = |defaults: &[&str]| -> Vec<String> {
        if named.is_empty() {
            defaults.iter().map(|c| c.to_string()).collect()
        } else {
            named.clone()
        }
    };

    match table.as_str() {
        "providers" => {
            let columns = columns_for(PROVIDER_COLUMNS);
            let row = single_row("providers", &columns, rows)?;
            Ok(Command::InsertProvider {
                id: parse_ulid(row.require("id")?)?,
                name: row.get("name").map(parse_string_or_null).transpose()?.flatten(),
            })
        }
        "weekly_slots" => {
            let columns = columns_for(WEEKLY_COLUMNS);
            let mut target: Option<(Ulid, Weekday)> = None;
            let mut slots = Vec::with_capacity(rows.len());
            for values in rows {
                let row = Row { table: "weekly_slots", columns: &columns, values };
                let key = (
                    parse_ulid(row.require("provider_id")?)?,
                    parse_weekday(row.require("weekday")?)?,
                );
                match target {
                    None => target = Some(key),
                    Some(t) if t != key => {
                        return Err(SqlError::Unsupported(
                            "weekly_slots rows must share provider_id and weekday".into(),
                        ));
                    }
                    Some(_) => {}
                }
                slots.extend(parse_slot(&row)?);
            }
            let (provider_id, weekday) = target.ok_or_else(|| SqlError::Parse("empty VALUES".into()))?;
            Ok(Command::InsertWeeklySlots { provider_id, weekday, slots })
        }
        "date_slots" => {
            let columns = columns_for(DATE_COLUMNS);
            let mut provider: Option<Ulid> = None;
            let mut dates: BTreeMap<NaiveDate, Vec<Slot>> = BTreeMap::new();
            for values in rows {
                let row = Row { table: "date_slots", columns: &columns, values };
                let pid = parse_ulid(row.require("provider_id")?)?;
                if provider.is_some_and(|p| p != pid) {
                    return Err(SqlError::Unsupported(
                        "date_slots rows must share provider_id".into(),
                    ));
                }
                provider = Some(pid);
                let date = parse_date(row.require("date")?)?;
                let entry = dates.entry(date).or_default();
                entry.extend(parse_slot(&row)?);
            }
            let provider_id = provider.ok_or_else(|| SqlError::Parse("empty VALUES".into()))?;
            Ok(Command::InsertDateSlots { provider_id, dates })
        }
        "bookings" => {
            let columns = columns_for(BOOKING_COLUMNS);
            let row = single_row("bookings", &columns, rows)?;
            let mode = match row.get("mode").map(parse_string_or_null).transpose()?.flatten() {
                None => Mode::Remote,
                Some(s) => Mode::parse(&s).ok_or_else(|| SqlError::Parse(format!("bad mode: {s}")))?,
            };
            let kind = match row.get("kind").map(parse_string_or_null).transpose()?.flatten() {
                None => BookingKind::Session,
                Some(s) => {
                    BookingKind::parse(&s).ok_or_else(|| SqlError::Parse(format!("bad kind: {s}")))?
                }
            };
            Ok(Command::InsertBooking {
                id: parse_ulid(row.require("id")?)?,
                provider_id: parse_ulid(row.require("provider_id")?)?,
                start: parse_timestamp(row.require("start")?)?,
                end: parse_timestamp(row.require("end")?)?,
                requester_id: row
                    .get("requester_id")
                    .map(parse_string_or_null)
                    .transpose()?
                    .flatten(),
                mode,
                notes: row.get("notes").map(parse_string_or_null).transpose()?.flatten(),
                kind,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn single_row<'a>(
    table: &'static str,
    columns: &'a [String],
    rows: &'a [Vec<Expr>],
) -> Result<Row<'a>, SqlError> {
    match rows {
        [values] => Ok(Row { table, columns, values }),
        _ => Err(SqlError::Unsupported(format!("{table}: one row per INSERT"))),
    }
}

/// A slot from `start_time`/`end_time`/`available`. Both times NULL marks a
/// closed date and yields no slot.
fn parse_slot(row: &Row<'_>) -> Result<Option<Slot>, SqlError> {
    let start = parse_time_or_null(row.require("start_time")?)?;
    let end = parse_time_or_null(row.require("end_time")?)?;
    let available = match row.get("available") {
        Some(expr) if !is_null(expr) => parse_bool(expr)?,
        _ => true,
    };
    match (start, end) {
        (None, None) => Ok(None),
        (Some(start), Some(end)) => Ok(Some(Slot { start, end, available })),
        _ => Err(SqlError::Parse(format!(
            "{}: start_time and end_time must both be set or both NULL",
            row.table
        ))),
    }
}

// ── DELETE / UPDATE ───────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let conds = conditions(delete.selection.as_ref())?;

    match table.as_str() {
        "providers" => Ok(Command::DeleteProvider { id: conds.ulid("id")? }),
        "bookings" => Ok(Command::DeleteBooking { id: conds.ulid("id")? }),
        "weekly_slots" => Ok(Command::ClearWeeklySlots {
            provider_id: conds.ulid("provider_id")?,
            weekday: parse_weekday(conds.eq("weekday").ok_or(SqlError::MissingFilter("weekday"))?)?,
        }),
        "date_slots" => Ok(Command::DeleteDateSlots {
            provider_id: conds.ulid("provider_id")?,
            date: parse_date(conds.eq("date").ok_or(SqlError::MissingFilter("date"))?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let conds = conditions(selection)?;
    let [assignment] = assignments else {
        return Err(SqlError::Unsupported("UPDATE must set exactly one column".into()));
    };
    let column = match &assignment.target {
        AssignmentTarget::ColumnName(name) => object_name_last(name),
        AssignmentTarget::Tuple(_) => None,
    }
    .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;

    match (table.as_str(), column.as_str()) {
        ("providers", "available") => Ok(Command::SetProviderAvailable {
            id: conds.ulid("id")?,
            available: parse_bool(&assignment.value)?,
        }),
        ("bookings", "status") => {
            let status = parse_string(&assignment.value)?;
            let action = match status.to_lowercase().as_str() {
                "approved" => Action::Approve,
                "cancelled" | "canceled" | "rejected" => Action::Cancel,
                "completed" => Action::Complete,
                other => return Err(SqlError::Parse(format!("bad status: {other}"))),
            };
            Ok(Command::UpdateBookingStatus { id: conds.ulid("id")?, action })
        }
        (t, c) if matches!(t, "providers" | "bookings") => {
            Err(SqlError::Unsupported(format!("cannot update {t}.{c}")))
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let conds = conditions(select.selection.as_ref())?;

    match table.as_str() {
        "providers" => Ok(Command::SelectProviders),
        "weekly_slots" => Ok(Command::SelectWeeklySlots { provider_id: conds.ulid("provider_id")? }),
        "date_slots" => Ok(Command::SelectDateSlots { provider_id: conds.ulid("provider_id")? }),
        "availability" => {
            let mut from = conds.get("date", Cmp::GtEq).map(parse_date).transpose()?;
            let mut to = conds.get("date", Cmp::LtEq).map(parse_date).transpose()?;
            if let Some(day) = conds.eq("date").map(parse_date).transpose()? {
                from = Some(day);
                to = Some(day);
            }
            Ok(Command::SelectAvailability {
                provider_id: conds.ulid("provider_id")?,
                from,
                to,
                requester_id: conds.eq("requester_id").map(parse_string).transpose()?,
            })
        }
        "today_availability" => Ok(Command::SelectTodayAvailability {
            provider_id: conds.ulid("provider_id")?,
        }),
        "bookings" => Ok(Command::SelectBookings {
            provider_id: conds.ulid("provider_id")?,
            active_only: conds.flag("active")?.unwrap_or(false),
            from: conds.get("date", Cmp::GtEq).map(parse_date).transpose()?,
        }),
        "booking_quota" => Ok(Command::SelectQuota {
            requester_id: parse_string(
                conds.eq("requester_id").ok_or(SqlError::MissingFilter("requester_id"))?,
            )?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE clauses ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cmp {
    Eq,
    GtEq,
    LtEq,
}

/// `column <op> literal` terms of an AND-only WHERE clause, plus bare
/// boolean columns (`WHERE active`).
struct Conditions<'a> {
    terms: Vec<(String, Cmp, &'a Expr)>,
    flags: Vec<String>,
}

impl<'a> Conditions<'a> {
    fn get(&self, column: &str, cmp: Cmp) -> Option<&'a Expr> {
        self.terms
            .iter()
            .find(|(c, op, _)| c == column && *op == cmp)
            .map(|(_, _, e)| *e)
    }

    fn eq(&self, column: &str) -> Option<&'a Expr> {
        self.get(column, Cmp::Eq)
    }

    fn ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid(self.eq(column).ok_or(SqlError::MissingFilter(column))?)
    }

    fn flag(&self, column: &str) -> Result<Option<bool>, SqlError> {
        if self.flags.iter().any(|f| f == column) {
            return Ok(Some(true));
        }
        self.eq(column).map(parse_bool).transpose()
    }
}

fn conditions(selection: Option<&Expr>) -> Result<Conditions<'_>, SqlError> {
    let mut conds = Conditions { terms: Vec::new(), flags: Vec::new() };
    if let Some(expr) = selection {
        collect_terms(expr, &mut conds)?;
    }
    Ok(conds)
}

fn collect_terms<'a>(expr: &'a Expr, out: &mut Conditions<'a>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_terms(inner, out),
        Expr::BinaryOp { left, op: BinaryOperator::And, right } => {
            collect_terms(left, out)?;
            collect_terms(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let cmp = match op {
                BinaryOperator::Eq => Cmp::Eq,
                BinaryOperator::GtEq => Cmp::GtEq,
                BinaryOperator::LtEq => Cmp::LtEq,
                other => return Err(SqlError::Unsupported(format!("operator {other}"))),
            };
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.terms.push((column, cmp, right.as_ref()));
            Ok(())
        }
        Expr::Identifier(_) | Expr::CompoundIdentifier(_) => {
            out.flags.extend(expr_column_name(expr));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
    }
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

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or_else(|| SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if values.rows.is_empty() => {
            Err(SqlError::Parse("empty VALUES".into()))
        }
        SetExpr::Values(values) => Ok(&values.rows),
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

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(Value::Number(n, _)) => Ok(n.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    match (extract_value(expr), expr) {
        (Some(Value::Number(s, _)), _) | (Some(Value::SingleQuotedString(s)), _) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        (None, Expr::UnaryOp { op: UnaryOperator::Minus, expr }) => Ok(-parse_i64(expr)?),
        _ => Err(SqlError::Parse(format!("expected number, got {expr}"))),
    }
}

/// Unix milliseconds, or an RFC 3339 string with an explicit offset.
fn parse_timestamp(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr)
        && !s.trim().chars().all(|c| c.is_ascii_digit() || c == '-')
    {
        return DateTime::parse_from_rfc3339(s.trim())
            .map(|t| t.timestamp_millis())
            .map_err(|e| SqlError::Parse(format!("bad timestamp {s:?}: {e}")));
    }
    parse_i64(expr)
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn parse_time_or_null(expr: &Expr) -> Result<Option<NaiveTime>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    let s = parse_string(expr)?;
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map(Some)
        .map_err(|e| SqlError::Parse(format!("bad time {s:?}: {e}")))
}

/// Weekday by name (`'mon'`, `'Monday'`) or ISO number (1 = Monday … 7 = Sunday).
fn parse_weekday(expr: &Expr) -> Result<Weekday, SqlError> {
    if let Some(Value::Number(n, _)) = extract_value(expr) {
        return match n.parse::<u8>() {
            Ok(iso @ 1..=7) => crate::engine::weekday_from_index(iso - 1)
                .ok_or_else(|| SqlError::Parse(format!("bad weekday: {n}"))),
            _ => Err(SqlError::Parse(format!("bad weekday: {n}"))),
        };
    }
    let s = parse_string(expr)?;
    s.trim()
        .parse::<Weekday>()
        .map_err(|_| SqlError::Parse(format!("bad weekday: {s}")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" | "yes" => Ok(true),
            "false" | "f" | "0" | "no" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(other) => Err(SqlError::Parse(format!("expected bool, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
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
    #[error("{0}: missing value for {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
