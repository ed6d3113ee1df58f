//! Read-only queries over the audit log.

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use rusqlite::Connection;
use rusqlite::types::ToSql;
use serde::Serialize;
use uuid::Uuid;

use super::{AuditError, AuditRecord, EventType};

/// Filter criteria. Every field is optional; unset fields match everything.
#[derive(Debug, Clone)]
pub struct AuditFilter {
    /// Only rows at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Only rows strictly before this instant.
    pub until: Option<DateTime<Utc>>,
    pub source: Option<String>,
    pub event_types: Vec<EventType>,
    pub executed: Option<bool>,
    pub approved: Option<bool>,
    /// Substring matched against the input and the extracted command.
    pub search: Option<String>,
    pub limit: usize,
    /// Oldest first instead of newest first.
    pub ascending: bool,
}

impl Default for AuditFilter {
    fn default() -> Self {
        Self {
            since: None,
            until: None,
            source: None,
            event_types: Vec::new(),
            executed: None,
            approved: None,
            search: None,
            limit: 100,
            ascending: false,
        }
    }
}

impl AuditFilter {
    pub fn recent(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    pub fn executed(limit: usize) -> Self {
        Self {
            executed: Some(true),
            limit,
            ..Self::default()
        }
    }

    /// Validation failures and approval denials.
    pub fn rejected(limit: usize) -> Self {
        Self {
            event_types: vec![EventType::ValidationFailed, EventType::UserRejected],
            limit,
            ..Self::default()
        }
    }

    pub fn search(keyword: impl Into<String>, limit: usize) -> Self {
        Self {
            search: Some(keyword.into()),
            limit,
            ..Self::default()
        }
    }

    pub fn last_hours(hours: i64, limit: usize) -> Self {
        Self {
            since: Some(Utc::now() - ChronoDuration::hours(hours)),
            limit,
            ..Self::default()
        }
    }
}

/// Per-source counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceCount {
    pub source: String,
    pub total: i64,
    pub executed: i64,
    pub rejected: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditStats {
    pub total_events: i64,
    pub executed: i64,
    pub rejected: i64,
    /// Executed rows whose result reports `success: false`.
    pub failed: i64,
    /// Percentage of executed commands that succeeded.
    pub success_rate: f64,
    pub by_source: Vec<SourceCount>,
    pub by_event_type: Vec<(String, i64)>,
}

fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

const REJECTED_SQL: &str = "event_type IN ('validation_failed', 'user_rejected')";

pub(super) fn run_query(
    conn: &Connection,
    filter: &AuditFilter,
) -> Result<Vec<AuditRecord>, AuditError> {
    let mut sql = String::from(
        "SELECT id, request_id, timestamp, event_type, source, input, suggestion,
                extracted_command, approved, executed, result_summary
         FROM audit_log WHERE 1=1",
    );
    let mut values: Vec<Box<dyn ToSql>> = Vec::new();

    if let Some(since) = &filter.since {
        sql.push_str(" AND timestamp >= ?");
        values.push(Box::new(ts(since)));
    }
    if let Some(until) = &filter.until {
        sql.push_str(" AND timestamp < ?");
        values.push(Box::new(ts(until)));
    }
    if let Some(source) = &filter.source {
        sql.push_str(" AND source = ?");
        values.push(Box::new(source.clone()));
    }
    if !filter.event_types.is_empty() {
        let marks = vec!["?"; filter.event_types.len()].join(", ");
        sql.push_str(&format!(" AND event_type IN ({marks})"));
        for t in &filter.event_types {
            values.push(Box::new(t.as_str()));
        }
    }
    if let Some(executed) = filter.executed {
        sql.push_str(" AND executed = ?");
        values.push(Box::new(executed));
    }
    if let Some(approved) = filter.approved {
        sql.push_str(" AND approved = ?");
        values.push(Box::new(approved));
    }
    if let Some(keyword) = &filter.search {
        sql.push_str(" AND (instr(input, ?) > 0 OR instr(extracted_command, ?) > 0)");
        values.push(Box::new(keyword.clone()));
        values.push(Box::new(keyword.clone()));
    }

    let order = if filter.ascending { "ASC" } else { "DESC" };
    sql.push_str(&format!(" ORDER BY timestamp {order}, id {order} LIMIT ?"));
    values.push(Box::new(filter.limit as i64));

    let params: Vec<&dyn ToSql> = values.iter().map(|b| b.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params.as_slice(), row_to_record)?;
    let mut records = Vec::new();
    for row in rows {
        records.push(row?);
    }
    Ok(records)
}

fn conversion_error(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditRecord> {
    let request_id: String = row.get(1)?;
    let timestamp: String = row.get(2)?;
    let event_type: String = row.get(3)?;

    Ok(AuditRecord {
        id: Some(row.get(0)?),
        request_id: Uuid::parse_str(&request_id).map_err(|e| conversion_error(1, e))?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .map_err(|e| conversion_error(2, e))?
            .with_timezone(&Utc),
        event_type: event_type.parse().map_err(|e: String| {
            conversion_error(3, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?,
        source: row.get(4)?,
        input: row.get(5)?,
        suggestion: row.get(6)?,
        extracted_command: row.get(7)?,
        approved: row.get(8)?,
        executed: row.get(9)?,
        result_summary: row.get(10)?,
    })
}

pub(super) fn run_stats(
    conn: &Connection,
    since: Option<DateTime<Utc>>,
) -> Result<AuditStats, AuditError> {
    // '' sorts before every RFC 3339 timestamp.
    let cutoff = since.as_ref().map(ts).unwrap_or_default();

    let count = |clause: &str| -> Result<i64, rusqlite::Error> {
        conn.query_row(
            &format!("SELECT COUNT(*) FROM audit_log WHERE timestamp >= ?1 AND {clause}"),
            [&cutoff],
            |row| row.get(0),
        )
    };

    let total_events = count("1=1")?;
    let executed = count("executed = 1")?;
    let rejected = count(REJECTED_SQL)?;
    let failed = count("executed = 1 AND json_extract(result_summary, '$.success') = 0")?;
    let success_rate = if executed > 0 {
        ((executed - failed) as f64 / executed as f64 * 10_000.0).round() / 100.0
    } else {
        0.0
    };

    let mut stmt = conn.prepare(&format!(
        "SELECT source,
                COUNT(*),
                SUM(CASE WHEN executed = 1 THEN 1 ELSE 0 END),
                SUM(CASE WHEN {REJECTED_SQL} THEN 1 ELSE 0 END)
         FROM audit_log WHERE timestamp >= ?1
         GROUP BY source ORDER BY COUNT(*) DESC, source"
    ))?;
    let by_source = stmt
        .query_map([&cutoff], |row| {
            Ok(SourceCount {
                source: row.get(0)?,
                total: row.get(1)?,
                executed: row.get(2)?,
                rejected: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT event_type, COUNT(*) FROM audit_log WHERE timestamp >= ?1
         GROUP BY event_type ORDER BY COUNT(*) DESC, event_type",
    )?;
    let by_event_type = stmt
        .query_map([&cutoff], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(AuditStats {
        total_events,
        executed,
        rejected,
        failed,
        success_rate,
        by_source,
        by_event_type,
    })
}
