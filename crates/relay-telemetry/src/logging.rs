use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::types::ToSql;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

const CREATE_LOGS: &str = "
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
CREATE TABLE IF NOT EXISTS logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    level TEXT NOT NULL,
    target TEXT NOT NULL,
    message TEXT NOT NULL,
    fields TEXT,
    session_id TEXT,
    request_id TEXT
);
CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level);
CREATE INDEX IF NOT EXISTS idx_logs_session ON logs(session_id);
CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);
";

const DEFAULT_LIMIT: u32 = 100;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub session_id: Option<String>,
    pub request_id: Option<String>,
}

/// Filters for [`SqliteLogSink::query`]. Results are newest first.
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    /// Substring match on the target.
    pub target: Option<String>,
    pub session_id: Option<String>,
    pub request_id: Option<String>,
    /// RFC 3339 lower bound, inclusive.
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// SQLite sink for warn+ records.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

#[derive(Default)]
struct PendingRecord {
    timestamp: String,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    session_id: Option<String>,
    request_id: Option<String>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(CREATE_LOGS)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_LOGS)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // Write failures are dropped: logging must never take the relay down.
    fn insert(&self, record: &PendingRecord) {
        let conn = self.conn.lock();
        let _ = conn.execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, session_id, request_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                record.timestamp,
                record.level,
                record.target,
                record.message,
                record.fields,
                record.session_id,
                record.request_id,
            ],
        );
    }

    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let mut sql = String::from(
            "SELECT id, timestamp, level, target, message, fields, session_id, request_id FROM logs WHERE 1=1",
        );
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();
        let mut filter = |clause: &str, value: Box<dyn ToSql>| {
            params.push(value);
            sql.push_str(&format!(" AND {clause} ?{}", params.len()));
        };

        if let Some(level) = &q.level {
            filter("level =", Box::new(level.to_uppercase()));
        }
        if let Some(target) = &q.target {
            filter("target LIKE", Box::new(format!("%{target}%")));
        }
        if let Some(session_id) = &q.session_id {
            filter("session_id =", Box::new(session_id.clone()));
        }
        if let Some(request_id) = &q.request_id {
            filter("request_id =", Box::new(request_id.clone()));
        }
        if let Some(since) = &q.since {
            filter("timestamp >=", Box::new(since.clone()));
        }
        sql.push_str(&format!(
            " ORDER BY id DESC LIMIT {}",
            q.limit.unwrap_or(DEFAULT_LIMIT)
        ));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                fields: row.get(5)?,
                session_id: row.get(6)?,
                request_id: row.get(7)?,
            })
        })?;
        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        self.conn
            .lock()
            .query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }
}

/// `tracing` layer feeding warn+ events into a [`SqliteLogSink`].
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

/// Correlation ids picked up from span attributes, inherited by child events.
#[derive(Clone, Default)]
struct Correlation {
    session_id: Option<String>,
    request_id: Option<String>,
}

impl Correlation {
    fn is_empty(&self) -> bool {
        self.session_id.is_none() && self.request_id.is_none()
    }

    fn fill_from(&mut self, other: &Correlation) {
        if self.session_id.is_none() {
            self.session_id.clone_from(&other.session_id);
        }
        if self.request_id.is_none() {
            self.request_id.clone_from(&other.request_id);
        }
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: Map<String, Value>,
    ids: Correlation,
}

impl FieldVisitor {
    fn put(&mut self, field: &Field, value: Value) {
        self.fields.insert(field.name().to_owned(), value);
    }
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = Some(value.to_owned()),
            "session_id" => self.ids.session_id = Some(value.to_owned()),
            "request_id" => self.ids.request_id = Some(value.to_owned()),
            _ => self.put(field, Value::String(value.to_owned())),
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{value:?}");
        match field.name() {
            "message" => self.message = Some(rendered),
            "session_id" | "request_id" => {
                self.record_str(field, rendered.trim_matches('"'));
            }
            _ => self.put(field, Value::String(rendered)),
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.put(field, Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, Value::Bool(value));
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);
        if visitor.ids.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(visitor.ids);
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if let Some(ids) = span.extensions().get::<Correlation>() {
                    visitor.ids.fill_from(ids);
                }
            }
        }

        let fields = if visitor.fields.is_empty() {
            None
        } else {
            serde_json::to_string(&visitor.fields).ok()
        };

        self.sink.insert(&PendingRecord {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string().to_uppercase(),
            target: event.metadata().target().to_owned(),
            message: visitor.message.unwrap_or_default(),
            fields,
            session_id: visitor.ids.session_id,
            request_id: visitor.ids.request_id,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn record(level: &str, message: &str) -> PendingRecord {
        PendingRecord {
            timestamp: Utc::now().to_rfc3339(),
            level: level.into(),
            target: "relay_engine::queue".into(),
            message: message.into(),
            ..Default::default()
        }
    }

    fn with_layer(sink: &Arc<SqliteLogSink>, f: impl FnOnce()) {
        let subscriber = tracing_subscriber::registry().with(SqliteLogLayer::new(sink.clone()));
        tracing::subscriber::with_default(subscriber, f);
    }

    #[test]
    fn file_sink_creates_parent_dirs() {
        let dir = std::env::temp_dir().join(format!("relay-test-logs-{}", uuid::Uuid::now_v7()));
        let sink = SqliteLogSink::new(&dir.join("nested/logs.db")).unwrap();
        sink.insert(&record("WARN", "x"));
        assert_eq!(sink.count().unwrap(), 1);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn query_filters_by_level_case_insensitively() {
        let sink = SqliteLogSink::in_memory().unwrap();
        sink.insert(&record("WARN", "resolver failed"));
        sink.insert(&record("ERROR", "handler panicked"));

        let results = sink
            .query(&LogQuery {
                level: Some("error".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].message, "handler panicked");
    }

    #[test]
    fn query_filters_by_correlation_ids() {
        let sink = SqliteLogSink::in_memory().unwrap();
        sink.insert(&PendingRecord {
            session_id: Some("sess_a".into()),
            request_id: Some("1".into()),
            ..record("WARN", "a1")
        });
        sink.insert(&PendingRecord {
            session_id: Some("sess_b".into()),
            request_id: Some("1".into()),
            ..record("WARN", "b1")
        });

        let by_session = sink
            .query(&LogQuery {
                session_id: Some("sess_a".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_session.len(), 1);
        assert_eq!(by_session[0].message, "a1");

        let by_request = sink
            .query(&LogQuery {
                request_id: Some("1".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_request.len(), 2);
    }

    #[test]
    fn query_newest_first_with_limit_and_since() {
        let sink = SqliteLogSink::in_memory().unwrap();
        for i in 0..10 {
            sink.insert(&PendingRecord {
                timestamp: format!("2026-10-18T12:00:{i:02}Z"),
                ..record("WARN", &format!("msg {i}"))
            });
        }

        let latest = sink
            .query(&LogQuery {
                limit: Some(3),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(latest.len(), 3);
        assert_eq!(latest[0].message, "msg 9");

        let since = sink
            .query(&LogQuery {
                since: Some("2026-10-18T12:00:07Z".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(since.len(), 3);
    }

    #[test]
    fn layer_persists_warn_and_above_only() {
        let sink = Arc::new(SqliteLogSink::in_memory().unwrap());
        with_layer(&sink, || {
            tracing::info!("ignored");
            tracing::debug!("ignored");
            tracing::warn!(position = 2u64, "out of range");
            tracing::error!("handler failed");
        });

        let records = sink.query(&LogQuery::default()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].level, "ERROR");
        assert_eq!(records[1].message, "out of range");
        assert_eq!(records[1].fields.as_deref(), Some(r#"{"position":2}"#));
    }

    #[test]
    fn layer_inherits_ids_from_spans() {
        let sink = Arc::new(SqliteLogSink::in_memory().unwrap());
        with_layer(&sink, || {
            let span = tracing::info_span!("approve", session_id = "sess_1", request_id = "42");
            let _entered = span.enter();
            tracing::warn!("resolver failed");
        });

        let records = sink.query(&LogQuery::default()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].session_id.as_deref(), Some("sess_1"));
        assert_eq!(records[0].request_id.as_deref(), Some("42"));
    }

    #[test]
    fn event_ids_take_precedence_over_span_ids() {
        let sink = Arc::new(SqliteLogSink::in_memory().unwrap());
        with_layer(&sink, || {
            let span = tracing::info_span!("outer", session_id = "sess_outer");
            let _entered = span.enter();
            tracing::warn!(session_id = "sess_inner", "stale event");
        });

        let records = sink.query(&LogQuery::default()).unwrap();
        assert_eq!(records[0].session_id.as_deref(), Some("sess_inner"));
    }
}
