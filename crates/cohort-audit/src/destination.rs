//! Audit destinations.
//!
//! A destination declares the severities it accepts through its descriptor;
//! the trail skips destinations that do not support a record's severity.

use crate::error::{AuditError, Result};
use crate::{AuditLogRecord, Severity};
use cohort_types::Timestamp;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};

/// Maximum number of records kept by a memory destination.
const MAX_RECORDS: usize = 100_000;

/// Capabilities of a destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationDescriptor {
    /// Destination name.
    pub name: String,
    /// Severities the destination stores.
    pub supported_severities: Vec<Severity>,
    /// Implementation identifier.
    pub implementation: String,
}

/// A sink for audit records.
pub trait AuditDestination: Send + Sync {
    /// Returns the destination's capabilities.
    fn descriptor(&self) -> DestinationDescriptor;

    /// Returns true if the destination stores records of `severity`.
    fn supports(&self, severity: Severity) -> bool {
        self.descriptor().supported_severities.contains(&severity)
    }

    /// Stores a record.
    fn store(&self, record: &AuditLogRecord) -> Result<()>;
}

/// Query parameters for searching a memory destination.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    /// Filter by message ids.
    pub message_ids: Option<Vec<String>>,
    /// Filter by severities.
    pub severities: Option<Vec<Severity>>,
    /// Filter by reporting component.
    pub component: Option<String>,
    /// Earliest timestamp.
    pub from: Option<Timestamp>,
    /// Latest timestamp.
    pub to: Option<Timestamp>,
    /// Maximum number of results.
    pub limit: Option<usize>,
    /// Offset for pagination.
    pub offset: Option<usize>,
}

impl AuditQuery {
    fn matches(&self, record: &AuditLogRecord) -> bool {
        if let Some(ref ids) = self.message_ids {
            if !ids.iter().any(|id| *id == record.message_id) {
                return false;
            }
        }
        if let Some(ref severities) = self.severities {
            if !severities.contains(&record.severity) {
                return false;
            }
        }
        if let Some(ref component) = self.component {
            if record.reporting_component != *component {
                return false;
            }
        }
        if let Some(from) = self.from {
            if record.timestamp < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if record.timestamp > to {
                return false;
            }
        }
        true
    }
}

/// Builder for constructing audit queries.
#[derive(Debug, Clone, Default)]
pub struct AuditQueryBuilder {
    query: AuditQuery,
}

impl AuditQueryBuilder {
    /// Creates a new query builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Filters by a single message id.
    pub fn message_id(self, id: impl Into<String>) -> Self {
        self.message_ids(vec![id.into()])
    }

    /// Filters by message ids.
    pub fn message_ids(mut self, ids: Vec<String>) -> Self {
        self.query.message_ids = Some(ids);
        self
    }

    /// Filters by severities.
    pub fn severities(mut self, severities: Vec<Severity>) -> Self {
        self.query.severities = Some(severities);
        self
    }

    /// Filters by reporting component.
    pub fn component(mut self, component: impl Into<String>) -> Self {
        self.query.component = Some(component.into());
        self
    }

    /// Filters by time range.
    pub fn time_range(mut self, from: Timestamp, to: Timestamp) -> Self {
        self.query.from = Some(from);
        self.query.to = Some(to);
        self
    }

    /// Sets the maximum number of results.
    pub fn limit(mut self, limit: usize) -> Self {
        self.query.limit = Some(limit);
        self
    }

    /// Sets the offset for pagination.
    pub fn offset(mut self, offset: usize) -> Self {
        self.query.offset = Some(offset);
        self
    }

    /// Builds the query.
    pub fn build(self) -> AuditQuery {
        self.query
    }
}

/// Bounded in-memory destination.
#[derive(Debug)]
pub struct MemoryDestination {
    name: String,
    records: RwLock<VecDeque<AuditLogRecord>>,
    max_records: usize,
    severities: Vec<Severity>,
}

impl Default for MemoryDestination {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDestination {
    /// Creates a destination with default capacity accepting every severity.
    pub fn new() -> Self {
        Self::with_capacity(MAX_RECORDS)
    }

    /// Creates a destination with the given capacity.
    pub fn with_capacity(max_records: usize) -> Self {
        Self {
            name: "memory".to_string(),
            records: RwLock::new(VecDeque::with_capacity(max_records.min(MAX_RECORDS))),
            max_records: max_records.max(1),
            severities: Severity::ALL.to_vec(),
        }
    }

    /// Restricts the severities stored.
    pub fn with_severities(mut self, severities: Vec<Severity>) -> Self {
        self.severities = severities;
        self
    }

    /// Sets the destination name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Gets a record by guid.
    pub fn get(&self, guid: &str) -> Result<AuditLogRecord> {
        self.records
            .read()
            .iter()
            .find(|r| r.guid == guid)
            .cloned()
            .ok_or_else(|| AuditError::NotFound(guid.to_string()))
    }

    /// Queries records matching the given criteria, oldest first.
    pub fn query(&self, query: &AuditQuery) -> Vec<AuditLogRecord> {
        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(usize::MAX);

        self.records
            .read()
            .iter()
            .filter(|r| query.matches(r))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Returns records with the given message id.
    pub fn by_message_id(&self, id: &str) -> Vec<AuditLogRecord> {
        self.query(&AuditQueryBuilder::new().message_id(id).build())
    }

    /// Returns true if any record carries the message id.
    pub fn contains(&self, id: &str) -> bool {
        self.records.read().iter().any(|r| r.message_id == id)
    }

    /// Returns recent records up to the specified limit, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<AuditLogRecord> {
        let records = self.records.read();
        let skip = records.len().saturating_sub(limit);
        records.iter().skip(skip).cloned().collect()
    }

    /// Returns the number of records held.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns whether the destination is empty.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Removes every record.
    pub fn clear(&self) {
        self.records.write().clear();
    }

    /// Exports records as JSON.
    pub fn export_json(&self) -> Result<String> {
        let records = self.records.read();
        Ok(serde_json::to_string_pretty(&*records)?)
    }
}

impl AuditDestination for MemoryDestination {
    fn descriptor(&self) -> DestinationDescriptor {
        DestinationDescriptor {
            name: self.name.clone(),
            supported_severities: self.severities.clone(),
            implementation: "memory".to_string(),
        }
    }

    fn supports(&self, severity: Severity) -> bool {
        self.severities.contains(&severity)
    }

    fn store(&self, record: &AuditLogRecord) -> Result<()> {
        let mut records = self.records.write();
        while records.len() >= self.max_records {
            records.pop_front();
        }
        records.push_back(record.clone());
        Ok(())
    }
}

/// Destination that writes one structured log line per record.
#[derive(Debug, Clone)]
pub struct TracingDestination {
    severities: Vec<Severity>,
}

impl Default for TracingDestination {
    fn default() -> Self {
        Self::new()
    }
}

impl TracingDestination {
    /// Creates a destination accepting every severity.
    pub fn new() -> Self {
        Self {
            severities: Severity::ALL.to_vec(),
        }
    }

    /// Restricts the severities logged.
    pub fn with_severities(mut self, severities: Vec<Severity>) -> Self {
        self.severities = severities;
        self
    }
}

impl AuditDestination for TracingDestination {
    fn descriptor(&self) -> DestinationDescriptor {
        DestinationDescriptor {
            name: "log".to_string(),
            supported_severities: self.severities.clone(),
            implementation: "tracing".to_string(),
        }
    }

    fn supports(&self, severity: Severity) -> bool {
        self.severities.contains(&severity)
    }

    fn store(&self, record: &AuditLogRecord) -> Result<()> {
        match record.severity {
            Severity::Action | Severity::Security => tracing::warn!(
                message_id = %record.message_id,
                severity = %record.severity,
                component = %record.reporting_component,
                "{}",
                record.formatted_message
            ),
            Severity::Trace | Severity::PerfMon => tracing::debug!(
                message_id = %record.message_id,
                severity = %record.severity,
                component = %record.reporting_component,
                "{}",
                record.formatted_message
            ),
            _ => tracing::info!(
                message_id = %record.message_id,
                severity = %record.severity,
                component = %record.reporting_component,
                "{}",
                record.formatted_message
            ),
        }
        Ok(())
    }
}

enum WriterCommand {
    Line(Vec<u8>),
    Flush(oneshot::Sender<()>),
}

/// Append-only JSON lines file destination.
///
/// Records are serialized by the caller and written by a dedicated writer
/// thread, so storing a record never waits on the disk.
#[derive(Debug)]
pub struct JsonLinesDestination {
    path: PathBuf,
    lines: Option<mpsc::UnboundedSender<WriterCommand>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    severities: Vec<Severity>,
}

impl JsonLinesDestination {
    /// Opens (or creates) the file at `path` for appending and starts its
    /// writer thread.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let (lines, commands) = mpsc::unbounded_channel();
        let shown = path.display().to_string();
        let writer = std::thread::Builder::new()
            .name("audit-jsonl".into())
            .spawn(move || write_lines(file, commands, &shown))?;

        Ok(Self {
            path,
            lines: Some(lines),
            writer: Mutex::new(Some(writer)),
            severities: Severity::ALL.to_vec(),
        })
    }

    /// Restricts the severities written.
    pub fn with_severities(mut self, severities: Vec<Severity>) -> Self {
        self.severities = severities;
        self
    }

    /// Returns the file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn send(&self, command: WriterCommand) -> Result<()> {
        self.lines
            .as_ref()
            .and_then(|lines| lines.send(command).ok())
            .ok_or_else(|| AuditError::Destination {
                name: self.path.display().to_string(),
                reason: "writer thread stopped".into(),
            })
    }

    /// Waits until every record stored so far is on disk.
    pub async fn flush(&self) -> Result<()> {
        let (done, flushed) = oneshot::channel();
        self.send(WriterCommand::Flush(done))?;
        flushed.await.map_err(|_| AuditError::Destination {
            name: self.path.display().to_string(),
            reason: "writer thread stopped".into(),
        })
    }
}

impl Drop for JsonLinesDestination {
    fn drop(&mut self) {
        // Closing the channel lets the writer drain and exit.
        self.lines.take();
        if let Some(writer) = self.writer.lock().take() {
            if writer.join().is_err() {
                tracing::warn!(path = %self.path.display(), "audit writer thread panicked");
            }
        }
    }
}

fn write_lines(file: File, mut commands: mpsc::UnboundedReceiver<WriterCommand>, path: &str) {
    let mut out = BufWriter::new(file);
    while let Some(command) = commands.blocking_recv() {
        let written = match command {
            WriterCommand::Line(line) => {
                let mut result = out.write_all(&line);
                // Flush once the queue is drained so bursts share one write.
                if result.is_ok() && commands.is_empty() {
                    result = out.flush();
                }
                result
            }
            WriterCommand::Flush(done) => {
                let result = out.flush();
                let _ = done.send(());
                result
            }
        };
        if let Err(e) = written {
            tracing::warn!(path, error = %e, "failed to write audit record");
        }
    }
    if let Err(e) = out.flush() {
        tracing::warn!(path, error = %e, "failed to flush audit records");
    }
}

impl AuditDestination for JsonLinesDestination {
    fn descriptor(&self) -> DestinationDescriptor {
        DestinationDescriptor {
            name: self.path.display().to_string(),
            supported_severities: self.severities.clone(),
            implementation: "json-lines".to_string(),
        }
    }

    fn supports(&self, severity: Severity) -> bool {
        self.severities.contains(&severity)
    }

    fn store(&self, record: &AuditLogRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.send(WriterCommand::Line(line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AuditOriginator;

    fn record(id: &str, severity: Severity, component: &str) -> AuditLogRecord {
        AuditLogRecord {
            guid: uuid::Uuid::new_v4().to_string(),
            timestamp: Timestamp::now(),
            originator: AuditOriginator::new("server-a", "mc-1"),
            reporting_component: component.to_string(),
            severity,
            message_id: id.to_string(),
            formatted_message: format!("{id} happened"),
            parameters: vec![],
            additional_information: vec![],
            system_action: String::new(),
            user_action: String::new(),
        }
    }

    #[test]
    fn test_store_and_get() {
        let dest = MemoryDestination::new();
        let rec = record("A", Severity::Info, "registry");
        dest.store(&rec).unwrap();

        assert_eq!(dest.get(&rec.guid).unwrap(), rec);
        assert!(matches!(dest.get("missing"), Err(AuditError::NotFound(_))));
    }

    #[test]
    fn test_query_filters() {
        let dest = MemoryDestination::new();
        dest.store(&record("A", Severity::Info, "registry")).unwrap();
        dest.store(&record("B", Severity::Action, "registry")).unwrap();
        dest.store(&record("A", Severity::Action, "router")).unwrap();

        assert_eq!(dest.by_message_id("A").len(), 2);

        let query = AuditQueryBuilder::new()
            .severities(vec![Severity::Action])
            .component("registry")
            .build();
        let results = dest.query(&query);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].message_id, "B");
    }

    #[test]
    fn test_pagination() {
        let dest = MemoryDestination::new();
        for i in 0..10 {
            dest.store(&record(&format!("M{i}"), Severity::Info, "c"))
                .unwrap();
        }

        let results = dest.query(&AuditQueryBuilder::new().limit(3).offset(5).build());
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].message_id, "M5");
    }

    #[test]
    fn test_capacity_limit() {
        let dest = MemoryDestination::with_capacity(5);
        for i in 0..10 {
            dest.store(&record(&format!("M{i}"), Severity::Info, "c"))
                .unwrap();
        }

        assert_eq!(dest.len(), 5);
        let recent = dest.recent(5);
        assert_eq!(recent[0].message_id, "M5");
        assert_eq!(recent[4].message_id, "M9");
    }

    #[test]
    fn test_supports_filter() {
        let dest = MemoryDestination::new().with_severities(vec![Severity::Error]);
        assert!(dest.supports(Severity::Error));
        assert!(!dest.supports(Severity::Info));
        assert_eq!(dest.descriptor().implementation, "memory");
    }

    #[test]
    fn test_export_json() {
        let dest = MemoryDestination::new();
        dest.store(&record("BAD_EVENT", Severity::Error, "router"))
            .unwrap();

        let json = dest.export_json().unwrap();
        assert!(json.contains("BAD_EVENT"));
        assert!(json.contains("\"ERROR\""));
    }

    #[test]
    fn test_json_lines_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit").join("records.jsonl");

        let dest = JsonLinesDestination::open(&path).unwrap();
        dest.store(&record("A", Severity::Info, "c")).unwrap();
        dest.store(&record("B", Severity::Action, "c")).unwrap();
        drop(dest);

        let reopened = JsonLinesDestination::open(&path).unwrap();
        reopened.store(&record("C", Severity::Info, "c")).unwrap();
        drop(reopened);

        let content = std::fs::read_to_string(&path).unwrap();
        let ids: Vec<String> = content
            .lines()
            .map(|l| {
                serde_json::from_str::<AuditLogRecord>(l)
                    .unwrap()
                    .message_id
            })
            .collect();
        assert_eq!(ids, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_json_lines_flush_waits_for_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.jsonl");
        let dest = JsonLinesDestination::open(&path).unwrap();

        for i in 0..50 {
            dest.store(&record(&format!("M{i}"), Severity::Info, "c"))
                .unwrap();
        }
        dest.flush().await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 50);
        assert!(content.lines().last().unwrap().contains("M49"));
    }

    #[test]
    fn test_tracing_destination_accepts() {
        let dest = TracingDestination::new().with_severities(vec![Severity::Action]);
        assert!(dest.supports(Severity::Action));
        assert!(!dest.supports(Severity::Trace));
        assert!(dest.store(&record("A", Severity::Action, "c")).is_ok());
    }
}
