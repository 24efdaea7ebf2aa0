use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    UpsertMachine {
        id: MachineId,
        name: String,
        capacity: String,
        access_group: Option<String>,
    },
    RetireMachine {
        id: MachineId,
    },
    SelectMachines {
        id: Option<MachineId>,
        access_group: Option<String>,
    },
    InsertBooking {
        machine_id: MachineId,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        requester_name: Option<String>,
        access_group: Option<String>,
    },
    DeleteBooking {
        id: BookingId,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    SelectAvailability {
        machine_id: MachineId,
        date: NaiveDate,
    },
}

#[derive(Debug, PartialEq)]
pub enum BookingFilter {
    Slot { machine_id: MachineId, date: NaiveDate },
    Requester(String),
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

const MACHINE_COLUMNS: [&str; 4] = ["id", "name", "capacity", "access_group"];
const BOOKING_COLUMNS: [&str; 6] = [
    "machine_id",
    "date",
    "start",
    "end",
    "requester_name",
    "access_group",
];

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let (table, layout, required): (&'static str, &[&'static str], usize) = match table.as_str() {
        "machines" => ("machines", MACHINE_COLUMNS.as_slice(), 2),
        "bookings" => ("bookings", BOOKING_COLUMNS.as_slice(), 4),
        _ => return Err(SqlError::UnknownTable(table)),
    };
    let row = InsertRow::new(insert, table, layout, required)?;

    if table == "machines" {
        Ok(Command::UpsertMachine {
            id: parse_ulid(row.required("id")?)?,
            name: parse_string(row.required("name")?)?,
            capacity: row.optional("capacity")?.unwrap_or_default(),
            access_group: row.optional("access_group")?,
        })
    } else {
        Ok(Command::InsertBooking {
            machine_id: parse_ulid(row.required("machine_id")?)?,
            date: parse_date(row.required("date")?)?,
            start: parse_time(row.required("start")?)?,
            end: parse_time(row.required("end")?)?,
            requester_name: row.optional("requester_name")?,
            access_group: row.optional("access_group")?,
        })
    }
}

/// The single VALUES row of an INSERT, each value keyed by its column. With
/// no column list, values follow the table's column order.
struct InsertRow {
    values: Vec<(&'static str, Expr)>,
}

impl InsertRow {
    fn new(
        insert: &ast::Insert,
        table: &'static str,
        layout: &[&'static str],
        required: usize,
    ) -> Result<Self, SqlError> {
        let values = extract_insert_values(insert)?;
        let columns: Vec<&'static str> = if insert.columns.is_empty() {
            if values.len() < required || values.len() > layout.len() {
                return Err(SqlError::WrongArity(table, required, values.len()));
            }
            layout[..values.len()].to_vec()
        } else {
            if insert.columns.len() != values.len() {
                return Err(SqlError::WrongArity(table, insert.columns.len(), values.len()));
            }
            insert
                .columns
                .iter()
                .map(|ident| {
                    let name = ident.value.to_lowercase();
                    layout
                        .iter()
                        .copied()
                        .find(|column| *column == name)
                        .ok_or(SqlError::UnknownColumn(name))
                })
                .collect::<Result<_, _>>()?
        };
        Ok(Self {
            values: columns.into_iter().zip(values).collect(),
        })
    }

    fn get(&self, column: &str) -> Option<&Expr> {
        self.values
            .iter()
            .find(|(name, _)| *name == column)
            .map(|(_, expr)| expr)
    }

    fn required(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }

    /// The column's value if given and not NULL.
    fn optional(&self, column: &str) -> Result<Option<String>, SqlError> {
        match self.get(column) {
            None => Ok(None),
            Some(expr) if matches!(extract_value(expr), Some(Value::Null)) => Ok(None),
            Some(expr) => parse_string(expr).map(Some),
        }
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "machines" => Ok(Command::RetireMachine { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
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

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let filter = |col: &str| filters.iter().find(|(c, _)| c == col).map(|(_, e)| *e);

    match table.as_str() {
        "machines" => Ok(Command::SelectMachines {
            id: filter("id").map(parse_ulid).transpose()?,
            access_group: filter("access_group").map(parse_string).transpose()?,
        }),
        "bookings" => {
            if let Some(requester) = filter("requester_id") {
                return Ok(Command::SelectBookings {
                    filter: BookingFilter::Requester(parse_string(requester)?),
                });
            }
            let machine_id = filter("machine_id").ok_or(SqlError::MissingFilter("machine_id"))?;
            let date = filter("date").ok_or(SqlError::MissingFilter("date"))?;
            Ok(Command::SelectBookings {
                filter: BookingFilter::Slot {
                    machine_id: parse_ulid(machine_id)?,
                    date: parse_date(date)?,
                },
            })
        }
        "availability" => Ok(Command::SelectAvailability {
            machine_id: parse_ulid(filter("machine_id").ok_or(SqlError::MissingFilter("machine_id"))?)?,
            date: parse_date(filter("date").ok_or(SqlError::MissingFilter("date"))?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Collect `column = value` terms from a chain of ANDs.
fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((col, right.as_ref()));
            Ok(())
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
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

/// The single VALUES row. Multi-row inserts are rejected: each booking is
/// decided on its own.
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

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(Value::Number(n, _)) => Ok(n.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

/// `HH:MM` or `HH:MM:SS`.
fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_string(expr)?;
    NaiveTime::parse_from_str(&s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(&s, "%H:%M"))
        .map_err(|e| SqlError::Parse(format!("bad time {s:?}: {e}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str),
    UnknownColumn(String),
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
            SqlError::MissingColumn(col) => write!(f, "missing value for column {col}"),
            SqlError::UnknownColumn(col) => write!(f, "unknown column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
