//! Serialization of the normalized row set.
//!
//! Three formats, all pure functions of `NormalizedRowSet` and nothing
//! else: JSON (lossless structural dump), CSV (generic tagged long
//! format for ingestion pipelines), and SQL (insert statements per
//! normalized table).  No format encodes information the others cannot.
//! JSON and CSV can be read back; SQL is emit-only.
//!
//! CSV long format: one line per scalar field per entity, columns
//! `Table,ID,Field,Value,DataType,ParentID,ParentType`.  Set- and
//! list-valued fields are JSON-encoded with `DataType = json`.
//!
//! Every emitted artifact carries the SHA-256 of its content and a
//! caller-supplied generation timestamp; the engine never reads a clock.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::allocation::{BusinessId, RoleId, StepKey, SubcomponentAllocation};
use crate::normalize::{
    ActivityRow, AreaRow, CategoryRow, FocusRow, NormalizedRowSet, PhaseRow, QraConfigurationRow,
    ROW_SET_SCHEMA_VERSION, StepRow, SubcomponentRow,
};
use crate::taxonomy::NodeId;

/// Component name for structured events.
pub const EXPORT_COMPONENT: &str = "export";

/// CSV header, fixed column order.
pub const CSV_HEADER: &str = "Table,ID,Field,Value,DataType,ParentID,ParentType";

const ERROR_SERIALIZATION: &str = "QRA-EXP-0001";
const ERROR_MALFORMED_CSV: &str = "QRA-EXP-0002";
const ERROR_SCHEMA_VERSION: &str = "QRA-EXP-0003";

// ---------------------------------------------------------------------------
// ExportFormat / ExportArtifact
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Json,
    Csv,
    Sql,
}

impl ExportFormat {
    pub const ALL: [ExportFormat; 3] = [ExportFormat::Json, ExportFormat::Csv, ExportFormat::Sql];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Csv => "csv",
            Self::Sql => "sql",
        }
    }

    pub const fn file_extension(self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One emitted export with its integrity hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportArtifact {
    pub format: ExportFormat,
    pub schema_version: String,
    /// Supplied by the caller; excluded from round-trip equality.
    pub generated_at: DateTime<Utc>,
    pub content: String,
    /// Lowercase-hex SHA-256 of `content`.
    pub content_hash: String,
}

/// Emit one artifact in the requested format.
pub fn export_artifact(
    rows: &NormalizedRowSet,
    format: ExportFormat,
    generated_at: DateTime<Utc>,
) -> Result<ExportArtifact, ExportError> {
    let content = match format {
        ExportFormat::Json => to_json(rows)?,
        ExportFormat::Csv => to_csv(rows)?,
        ExportFormat::Sql => to_sql(rows),
    };
    Ok(ExportArtifact {
        format,
        schema_version: rows.schema_version.clone(),
        generated_at,
        content_hash: content_hash(&content),
        content,
    })
}

/// Lowercase-hex SHA-256 of a string.
pub fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let mut hex = String::with_capacity(64);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

// ---------------------------------------------------------------------------
// ExportError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("malformed csv at line {line}: {detail}")]
    MalformedCsv { line: usize, detail: String },
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: String, actual: String },
}

impl ExportError {
    /// Stable machine-readable error code.
    pub fn stable_code(&self) -> &'static str {
        match self {
            Self::Serialization(_) => ERROR_SERIALIZATION,
            Self::MalformedCsv { .. } => ERROR_MALFORMED_CSV,
            Self::SchemaVersionMismatch { .. } => ERROR_SCHEMA_VERSION,
        }
    }
}

// ---------------------------------------------------------------------------
// JSON
// ---------------------------------------------------------------------------

/// Lossless structural dump.
pub fn to_json(rows: &NormalizedRowSet) -> Result<String, ExportError> {
    Ok(serde_json::to_string_pretty(rows)?)
}

/// Inverse of `to_json`; checks the embedded schema version.
pub fn from_json(content: &str) -> Result<NormalizedRowSet, ExportError> {
    let rows: NormalizedRowSet = serde_json::from_str(content)?;
    if rows.schema_version != ROW_SET_SCHEMA_VERSION {
        return Err(ExportError::SchemaVersionMismatch {
            expected: ROW_SET_SCHEMA_VERSION.to_string(),
            actual: rows.schema_version,
        });
    }
    Ok(rows)
}

// ---------------------------------------------------------------------------
// CSV emission
// ---------------------------------------------------------------------------

struct CsvWriter {
    out: String,
}

impl CsvWriter {
    fn new() -> Self {
        let mut out = String::new();
        out.push_str(CSV_HEADER);
        out.push('\n');
        Self { out }
    }

    fn line(
        &mut self,
        table: &str,
        id: &str,
        field: &str,
        value: &str,
        data_type: &str,
        parent_id: &str,
        parent_type: &str,
    ) {
        for (i, cell) in [table, id, field, value, data_type, parent_id, parent_type]
            .iter()
            .enumerate()
        {
            if i > 0 {
                self.out.push(',');
            }
            self.out.push_str(&csv_escape(cell));
        }
        self.out.push('\n');
    }

    fn string(&mut self, table: &str, id: &str, field: &str, value: &str, parent: (&str, &str)) {
        self.line(table, id, field, value, "string", parent.0, parent.1);
    }

    fn opt_string(
        &mut self,
        table: &str,
        id: &str,
        field: &str,
        value: &Option<String>,
        parent: (&str, &str),
    ) {
        if let Some(value) = value {
            self.string(table, id, field, value, parent);
        }
    }

    fn number(
        &mut self,
        table: &str,
        id: &str,
        field: &str,
        value: impl fmt::Display,
        parent: (&str, &str),
    ) {
        self.line(table, id, field, &value.to_string(), "number", parent.0, parent.1);
    }

    fn boolean(&mut self, table: &str, id: &str, field: &str, value: bool, parent: (&str, &str)) {
        self.line(
            table,
            id,
            field,
            if value { "true" } else { "false" },
            "boolean",
            parent.0,
            parent.1,
        );
    }

    fn json<T: Serialize>(
        &mut self,
        table: &str,
        id: &str,
        field: &str,
        value: &T,
        parent: (&str, &str),
    ) -> Result<(), ExportError> {
        let encoded = serde_json::to_string(value)?;
        self.line(table, id, field, &encoded, "json", parent.0, parent.1);
        Ok(())
    }
}

/// Minimal CSV field escaping (wraps in quotes if needed).
fn csv_escape(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

/// Emit the generic tagged long format.
pub fn to_csv(rows: &NormalizedRowSet) -> Result<String, ExportError> {
    let mut w = CsvWriter::new();
    w.string("meta", "row_set", "schema_version", &rows.schema_version, ("", ""));

    for row in &rows.categories {
        let id = row.id.as_str();
        w.string("category", id, "name", &row.name, ("", ""));
    }
    for row in &rows.areas {
        let id = row.id.as_str();
        let parent = (row.category_id.as_str(), "category");
        w.string("area", id, "name", &row.name, parent);
        w.string("area", id, "category_id", row.category_id.as_str(), parent);
    }
    for row in &rows.focuses {
        let id = row.id.as_str();
        let parent = (row.area_id.as_str(), "area");
        w.string("focus", id, "name", &row.name, parent);
        w.string("focus", id, "area_id", row.area_id.as_str(), parent);
    }
    for row in &rows.activities {
        let id = row.id.as_str();
        let parent = match &row.focus_id {
            Some(focus) => (focus.as_str(), "focus"),
            None => ("", ""),
        };
        w.string("activity", id, "name", &row.name, parent);
        if let Some(focus) = &row.focus_id {
            w.string("activity", id, "focus_id", focus.as_str(), parent);
        }
        w.opt_string("activity", id, "goal", &row.goal, parent);
        w.opt_string("activity", id, "hypothesis", &row.hypothesis, parent);
        w.opt_string("activity", id, "uncertainties", &row.uncertainties, parent);
        w.opt_string("activity", id, "alternatives", &row.alternatives, parent);
        w.opt_string(
            "activity",
            id,
            "developmental_process",
            &row.developmental_process,
            parent,
        );
    }
    for row in &rows.phases {
        let id = row.id.as_str();
        let parent = (row.activity_id.as_str(), "activity");
        w.string("phase", id, "name", &row.name, parent);
        w.string("phase", id, "activity_id", row.activity_id.as_str(), parent);
    }
    for row in &rows.steps {
        let id = row.id.as_str();
        let parent = (row.phase_id.as_str(), "phase");
        w.string("step", id, "name", &row.name, parent);
        w.string("step", id, "phase_id", row.phase_id.as_str(), parent);
    }
    for row in &rows.subcomponents {
        let id = row.id.as_str();
        let parent = (row.step_id.as_str(), "step");
        w.string("subcomponent", id, "name", &row.name, parent);
        w.string("subcomponent", id, "step_id", row.step_id.as_str(), parent);
        w.opt_string("subcomponent", id, "hint", &row.hint, parent);
    }
    for row in &rows.configurations {
        let config_id = row.activity_ref().to_string();
        let id = config_id.as_str();
        let parent = (row.activity_id.as_str(), "activity");
        w.string("qra_configuration", id, "business_id", row.business_id.as_str(), parent);
        w.number("qra_configuration", id, "year", row.year, parent);
        w.string("qra_configuration", id, "activity_id", row.activity_id.as_str(), parent);
        w.string("qra_configuration", id, "activity_name", &row.activity_name, parent);
        w.number("qra_configuration", id, "practice_percent", row.practice_percent, parent);
        w.number("qra_configuration", id, "non_rd_time", row.non_rd_time, parent);
        w.boolean("qra_configuration", id, "active", row.active, parent);
        w.json("qra_configuration", id, "selected_roles", &row.selected_roles, parent)?;
        w.json("qra_configuration", id, "locked_steps", &row.locked_steps, parent)?;
        w.number("qra_configuration", id, "next_sequence", row.next_sequence, parent);
        w.boolean("qra_configuration", id, "qra_completed", row.qra_completed, parent);
        w.number(
            "qra_configuration",
            id,
            "total_applied_percent",
            row.total_applied_percent,
            parent,
        );
        w.number(
            "qra_configuration",
            id,
            "subcomponent_count",
            row.subcomponent_count,
            parent,
        );
        w.number("qra_configuration", id, "step_count", row.step_count, parent);

        for allocation in &row.allocations {
            let alloc_id = format!("{config_id}#{}", allocation.sequence);
            let aid = alloc_id.as_str();
            let parent = (id, "qra_configuration");
            let t = "qra_subcomponent_allocation";
            w.string(t, aid, "subcomponent_id", allocation.subcomponent_id.as_str(), parent);
            w.string(t, aid, "subcomponent_name", &allocation.subcomponent_name, parent);
            w.string(t, aid, "phase", &allocation.phase, parent);
            w.string(t, aid, "step", &allocation.step, parent);
            w.number(t, aid, "time_percent", allocation.time_percent, parent);
            w.number(t, aid, "frequency_percent", allocation.frequency_percent, parent);
            w.number(t, aid, "year_percent", allocation.year_percent, parent);
            if let Some(start_year) = allocation.start_year {
                w.number(t, aid, "start_year", start_year, parent);
            }
            w.json(t, aid, "selected_roles", &allocation.selected_roles, parent)?;
            w.boolean(t, aid, "is_non_rd", allocation.is_non_rd, parent);
            w.number(t, aid, "sequence", allocation.sequence, parent);
        }
    }
    Ok(w.out)
}

// ---------------------------------------------------------------------------
// CSV ingestion
// ---------------------------------------------------------------------------

/// Parsed CSV records: quoted fields, doubled quotes, newlines allowed
/// inside quotes.
fn parse_csv(content: &str) -> Result<Vec<(usize, Vec<String>)>, ExportError> {
    let mut records = Vec::new();
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut line = 1usize;
    let mut record_line = 1usize;
    let mut chars = content.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' => {
                    if chars.peek() == Some(&'"') {
                        field.push('"');
                        chars.next();
                    } else {
                        in_quotes = false;
                    }
                }
                '\n' => {
                    line += 1;
                    field.push(c);
                }
                _ => field.push(c),
            }
        } else {
            match c {
                '"' => in_quotes = true,
                ',' => fields.push(std::mem::take(&mut field)),
                '\n' => {
                    line += 1;
                    fields.push(std::mem::take(&mut field));
                    if !(fields.len() == 1 && fields[0].is_empty()) {
                        records.push((record_line, std::mem::take(&mut fields)));
                    } else {
                        fields.clear();
                    }
                    record_line = line;
                }
                '\r' => {}
                _ => field.push(c),
            }
        }
    }
    if in_quotes {
        return Err(ExportError::MalformedCsv {
            line,
            detail: "unterminated quoted field".to_string(),
        });
    }
    if !field.is_empty() || !fields.is_empty() {
        fields.push(field);
        records.push((record_line, fields));
    }
    Ok(records)
}

/// One entity reassembled from its tagged rows.
#[derive(Debug, Default)]
struct EntityFields {
    parent_id: String,
    values: BTreeMap<String, String>,
}

impl EntityFields {
    fn string(&self, field: &str) -> Option<String> {
        self.values.get(field).cloned()
    }

    fn require_string(&self, field: &str, table: &str, line: usize) -> Result<String, ExportError> {
        self.string(field).ok_or_else(|| ExportError::MalformedCsv {
            line,
            detail: format!("{table} entity is missing required field `{field}`"),
        })
    }

    fn number(&self, field: &str, table: &str, line: usize) -> Result<f64, ExportError> {
        match self.values.get(field) {
            None => Ok(0.0),
            Some(raw) => raw.parse::<f64>().map_err(|_| ExportError::MalformedCsv {
                line,
                detail: format!("{table}.{field}: `{raw}` is not a number"),
            }),
        }
    }

    fn integer(&self, field: &str, table: &str, line: usize) -> Result<u64, ExportError> {
        match self.values.get(field) {
            None => Ok(0),
            Some(raw) => raw.parse::<u64>().map_err(|_| ExportError::MalformedCsv {
                line,
                detail: format!("{table}.{field}: `{raw}` is not an integer"),
            }),
        }
    }

    fn boolean(&self, field: &str, default: bool) -> bool {
        match self.values.get(field).map(String::as_str) {
            Some("true") => true,
            Some("false") => false,
            _ => default,
        }
    }

    fn json<T: serde::de::DeserializeOwned + Default>(
        &self,
        field: &str,
        table: &str,
        line: usize,
    ) -> Result<T, ExportError> {
        match self.values.get(field) {
            None => Ok(T::default()),
            Some(raw) => serde_json::from_str(raw).map_err(|_| ExportError::MalformedCsv {
                line,
                detail: format!("{table}.{field}: invalid json payload"),
            }),
        }
    }
}

/// Rebuild a row set from the tagged long format.  Unknown tables and
/// fields are ignored; entity order follows first appearance.
pub fn from_csv(content: &str) -> Result<NormalizedRowSet, ExportError> {
    let records = parse_csv(content)?;
    let mut iter = records.into_iter();
    match iter.next() {
        Some((_, header)) if header.join(",") == CSV_HEADER => {}
        Some((line, _)) => {
            return Err(ExportError::MalformedCsv {
                line,
                detail: format!("expected header `{CSV_HEADER}`"),
            });
        }
        None => {
            return Err(ExportError::MalformedCsv {
                line: 1,
                detail: "empty document".to_string(),
            });
        }
    }

    // (table, id) -> fields, with first-appearance order per table.
    let mut entities: BTreeMap<(String, String), EntityFields> = BTreeMap::new();
    let mut order: Vec<(String, String)> = Vec::new();
    let mut entity_line: BTreeMap<(String, String), usize> = BTreeMap::new();

    for (line, record) in iter {
        let [table, id, field, value, _data_type, parent_id, _parent_type]: [String; 7] =
            record.try_into().map_err(|bad: Vec<String>| ExportError::MalformedCsv {
                line,
                detail: format!("expected 7 columns, found {}", bad.len()),
            })?;
        let key = (table, id);
        let entry = entities.entry(key.clone()).or_insert_with(|| {
            order.push(key.clone());
            entity_line.insert(key.clone(), line);
            EntityFields::default()
        });
        if !parent_id.is_empty() {
            entry.parent_id = parent_id;
        }
        entry.values.insert(field, value);
    }

    let line_of = |key: &(String, String)| entity_line.get(key).copied().unwrap_or(0);

    let mut rows = NormalizedRowSet::new();
    let mut allocations_by_config: BTreeMap<String, Vec<SubcomponentAllocation>> = BTreeMap::new();
    let mut config_order: Vec<String> = Vec::new();
    let mut configs: BTreeMap<String, QraConfigurationRow> = BTreeMap::new();

    for key in &order {
        let (table, id) = key;
        let entity = &entities[key];
        let line = line_of(key);
        match table.as_str() {
            "meta" => {
                if let Some(version) = entity.string("schema_version") {
                    if version != ROW_SET_SCHEMA_VERSION {
                        return Err(ExportError::SchemaVersionMismatch {
                            expected: ROW_SET_SCHEMA_VERSION.to_string(),
                            actual: version,
                        });
                    }
                }
            }
            "category" => rows.categories.push(CategoryRow {
                id: NodeId::new(id.clone()),
                name: entity.require_string("name", table, line)?,
            }),
            "area" => rows.areas.push(AreaRow {
                id: NodeId::new(id.clone()),
                name: entity.require_string("name", table, line)?,
                category_id: NodeId::new(entity.require_string("category_id", table, line)?),
            }),
            "focus" => rows.focuses.push(FocusRow {
                id: NodeId::new(id.clone()),
                name: entity.require_string("name", table, line)?,
                area_id: NodeId::new(entity.require_string("area_id", table, line)?),
            }),
            "activity" => rows.activities.push(ActivityRow {
                id: NodeId::new(id.clone()),
                name: entity.require_string("name", table, line)?,
                focus_id: entity.string("focus_id").map(NodeId::new),
                goal: entity.string("goal"),
                hypothesis: entity.string("hypothesis"),
                uncertainties: entity.string("uncertainties"),
                alternatives: entity.string("alternatives"),
                developmental_process: entity.string("developmental_process"),
            }),
            "phase" => rows.phases.push(PhaseRow {
                id: NodeId::new(id.clone()),
                name: entity.require_string("name", table, line)?,
                activity_id: NodeId::new(entity.require_string("activity_id", table, line)?),
            }),
            "step" => rows.steps.push(StepRow {
                id: NodeId::new(id.clone()),
                name: entity.require_string("name", table, line)?,
                phase_id: NodeId::new(entity.require_string("phase_id", table, line)?),
            }),
            "subcomponent" => rows.subcomponents.push(SubcomponentRow {
                id: NodeId::new(id.clone()),
                name: entity.require_string("name", table, line)?,
                step_id: NodeId::new(entity.require_string("step_id", table, line)?),
                hint: entity.string("hint"),
            }),
            "qra_configuration" => {
                let year = entity.integer("year", table, line)? as u16;
                let row = QraConfigurationRow {
                    business_id: BusinessId::new(entity.require_string(
                        "business_id",
                        table,
                        line,
                    )?),
                    year,
                    activity_id: NodeId::new(entity.require_string("activity_id", table, line)?),
                    activity_name: entity.string("activity_name").unwrap_or_default(),
                    practice_percent: entity.number("practice_percent", table, line)?,
                    non_rd_time: entity.number("non_rd_time", table, line)?,
                    active: entity.boolean("active", true),
                    selected_roles: entity.json::<Vec<RoleId>>("selected_roles", table, line)?,
                    allocations: Vec::new(),
                    locked_steps: entity.json::<Vec<StepKey>>("locked_steps", table, line)?,
                    next_sequence: entity.integer("next_sequence", table, line)?,
                    qra_completed: entity.boolean("qra_completed", false),
                    total_applied_percent: entity.number("total_applied_percent", table, line)?,
                    subcomponent_count: entity.integer("subcomponent_count", table, line)? as usize,
                    step_count: entity.integer("step_count", table, line)? as usize,
                };
                config_order.push(id.clone());
                configs.insert(id.clone(), row);
            }
            "qra_subcomponent_allocation" => {
                let allocation = SubcomponentAllocation {
                    subcomponent_id: NodeId::new(entity.require_string(
                        "subcomponent_id",
                        table,
                        line,
                    )?),
                    subcomponent_name: entity.string("subcomponent_name").unwrap_or_default(),
                    phase: entity.require_string("phase", table, line)?,
                    step: entity.require_string("step", table, line)?,
                    time_percent: entity.number("time_percent", table, line)?,
                    frequency_percent: entity.number("frequency_percent", table, line)?,
                    year_percent: entity.number("year_percent", table, line)?,
                    start_year: entity
                        .values
                        .contains_key("start_year")
                        .then(|| entity.integer("start_year", table, line))
                        .transpose()?
                        .map(|y| y as u16),
                    selected_roles: entity.json("selected_roles", table, line)?,
                    is_non_rd: entity.boolean("is_non_rd", false),
                    sequence: entity.integer("sequence", table, line)?,
                };
                allocations_by_config
                    .entry(entity.parent_id.clone())
                    .or_default()
                    .push(allocation);
            }
            // Unknown tables are ignored for forward compatibility.
            _ => {}
        }
    }

    for id in config_order {
        if let Some(mut row) = configs.remove(&id) {
            if let Some(mut allocations) = allocations_by_config.remove(&id) {
                allocations.sort_by_key(|a| a.sequence);
                row.allocations = allocations;
            }
            rows.configurations.push(row);
        }
    }
    Ok(rows)
}

// ---------------------------------------------------------------------------
// SQL emission
// ---------------------------------------------------------------------------

fn sql_string(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn sql_opt_string(value: &Option<String>) -> String {
    match value {
        Some(v) => sql_string(v),
        None => "NULL".to_string(),
    }
}

fn sql_json<T: Serialize>(value: &T) -> String {
    match serde_json::to_string(value) {
        Ok(encoded) => sql_string(&encoded),
        Err(_) => "NULL".to_string(),
    }
}

fn sql_bool(value: bool) -> &'static str {
    if value { "TRUE" } else { "FALSE" }
}

fn insert(out: &mut String, table: &str, columns: &str, values: &[String]) {
    out.push_str("INSERT INTO ");
    out.push_str(table);
    out.push_str(" (");
    out.push_str(columns);
    out.push_str(") VALUES (");
    out.push_str(&values.join(", "));
    out.push_str(");\n");
}

/// Emit one insert statement per entity row.
pub fn to_sql(rows: &NormalizedRowSet) -> String {
    let mut out = String::new();
    for row in &rows.categories {
        insert(
            &mut out,
            "category",
            "id, name",
            &[sql_string(row.id.as_str()), sql_string(&row.name)],
        );
    }
    for row in &rows.areas {
        insert(
            &mut out,
            "area",
            "id, name, category_id",
            &[
                sql_string(row.id.as_str()),
                sql_string(&row.name),
                sql_string(row.category_id.as_str()),
            ],
        );
    }
    for row in &rows.focuses {
        insert(
            &mut out,
            "focus",
            "id, name, area_id",
            &[
                sql_string(row.id.as_str()),
                sql_string(&row.name),
                sql_string(row.area_id.as_str()),
            ],
        );
    }
    for row in &rows.activities {
        insert(
            &mut out,
            "activity",
            "id, name, focus_id, goal, hypothesis, uncertainties, alternatives, developmental_process",
            &[
                sql_string(row.id.as_str()),
                sql_string(&row.name),
                match &row.focus_id {
                    Some(focus) => sql_string(focus.as_str()),
                    None => "NULL".to_string(),
                },
                sql_opt_string(&row.goal),
                sql_opt_string(&row.hypothesis),
                sql_opt_string(&row.uncertainties),
                sql_opt_string(&row.alternatives),
                sql_opt_string(&row.developmental_process),
            ],
        );
    }
    for row in &rows.phases {
        insert(
            &mut out,
            "phase",
            "id, name, activity_id",
            &[
                sql_string(row.id.as_str()),
                sql_string(&row.name),
                sql_string(row.activity_id.as_str()),
            ],
        );
    }
    for row in &rows.steps {
        insert(
            &mut out,
            "step",
            "id, name, phase_id",
            &[
                sql_string(row.id.as_str()),
                sql_string(&row.name),
                sql_string(row.phase_id.as_str()),
            ],
        );
    }
    for row in &rows.subcomponents {
        insert(
            &mut out,
            "subcomponent",
            "id, name, step_id, hint",
            &[
                sql_string(row.id.as_str()),
                sql_string(&row.name),
                sql_string(row.step_id.as_str()),
                sql_opt_string(&row.hint),
            ],
        );
    }
    for row in &rows.configurations {
        insert(
            &mut out,
            "qra_configuration",
            "business_id, year, activity_id, activity_name, practice_percent, non_rd_time, \
             active, selected_roles, locked_steps, next_sequence, qra_completed, \
             total_applied_percent, subcomponent_count, step_count",
            &[
                sql_string(row.business_id.as_str()),
                row.year.to_string(),
                sql_string(row.activity_id.as_str()),
                sql_string(&row.activity_name),
                row.practice_percent.to_string(),
                row.non_rd_time.to_string(),
                sql_bool(row.active).to_string(),
                sql_json(&row.selected_roles),
                sql_json(&row.locked_steps),
                row.next_sequence.to_string(),
                sql_bool(row.qra_completed).to_string(),
                row.total_applied_percent.to_string(),
                row.subcomponent_count.to_string(),
                row.step_count.to_string(),
            ],
        );
        for allocation in &row.allocations {
            insert(
                &mut out,
                "qra_subcomponent_allocation",
                "business_id, year, activity_id, subcomponent_id, subcomponent_name, phase, \
                 step, time_percent, frequency_percent, year_percent, start_year, \
                 selected_roles, is_non_rd, sequence",
                &[
                    sql_string(row.business_id.as_str()),
                    row.year.to_string(),
                    sql_string(row.activity_id.as_str()),
                    sql_string(allocation.subcomponent_id.as_str()),
                    sql_string(&allocation.subcomponent_name),
                    sql_string(&allocation.phase),
                    sql_string(&allocation.step),
                    allocation.time_percent.to_string(),
                    allocation.frequency_percent.to_string(),
                    allocation.year_percent.to_string(),
                    match allocation.start_year {
                        Some(year) => year.to_string(),
                        None => "NULL".to_string(),
                    },
                    sql_json(&allocation.selected_roles),
                    sql_bool(allocation.is_non_rd).to_string(),
                    allocation.sequence.to_string(),
                ],
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::TimeZone;

    use super::*;
    use crate::allocation::{
        ActivityRef, AllocationKey, AllocationModel, BusinessYear, SubcomponentParams,
    };
    use crate::normalize::normalize_business_year;
    use crate::taxonomy::InMemoryTaxonomyCatalog;

    fn sample_rows() -> NormalizedRowSet {
        let mut model = AllocationModel::new();
        let activity = ActivityRef::new("biz-1", 2024, "act-1");
        model.select_activity(
            activity.clone(),
            "Assay, \"Complex\" Development",
            50.0,
            BTreeSet::new(),
        );
        model
            .select_subcomponent(
                &activity,
                AllocationKey::new("Research", "Protocol Design", "sub-1"),
                SubcomponentParams {
                    subcomponent_name: "Reagent Selection".to_string(),
                    time_percent: 100.0,
                    frequency_percent: 100.0,
                    year_percent: 100.0,
                    start_year: Some(2023),
                    selected_roles: BTreeSet::new(),
                    is_non_rd: false,
                },
            )
            .expect("select");
        normalize_business_year(
            &model,
            &BusinessYear::new("biz-1", 2024),
            &InMemoryTaxonomyCatalog::new(),
        )
    }

    #[test]
    fn json_round_trips_losslessly() {
        let rows = sample_rows();
        let json = to_json(&rows).expect("to json");
        let back = from_json(&json).expect("from json");
        assert_eq!(back, rows);
    }

    #[test]
    fn csv_escaping_handles_quotes_commas_and_newlines() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_escape("two\nlines"), "\"two\nlines\"");
    }

    #[test]
    fn csv_round_trips_the_row_set() {
        let rows = sample_rows();
        let csv = to_csv(&rows).expect("to csv");
        let back = from_csv(&csv).expect("from csv");
        assert_eq!(back, rows);
    }

    #[test]
    fn csv_parser_reports_unterminated_quotes() {
        let err = from_csv("Table,ID,Field,Value,DataType,ParentID,ParentType\n\"oops")
            .expect_err("unterminated");
        assert_eq!(err.stable_code(), "QRA-EXP-0002");
    }

    #[test]
    fn csv_with_wrong_header_is_rejected() {
        let err = from_csv("not,a,real,header\n").expect_err("bad header");
        assert_eq!(err.stable_code(), "QRA-EXP-0002");
    }

    #[test]
    fn csv_with_foreign_schema_version_is_rejected() {
        let doc = format!(
            "{CSV_HEADER}\nmeta,row_set,schema_version,qra-engine.normalized-rows.v999,string,,\n"
        );
        let err = from_csv(&doc).expect_err("version mismatch");
        assert_eq!(err.stable_code(), "QRA-EXP-0003");
    }

    #[test]
    fn unknown_tables_are_ignored() {
        let doc = format!(
            "{CSV_HEADER}\nfuture_table,x,field,value,string,,\ncategory,cat-1,name,Healthcare,string,,\n"
        );
        let rows = from_csv(&doc).expect("lenient parse");
        assert_eq!(rows.categories.len(), 1);
    }

    #[test]
    fn sql_escapes_embedded_quotes_by_doubling() {
        let mut rows = NormalizedRowSet::new();
        rows.categories.push(crate::normalize::CategoryRow {
            id: NodeId::new("cat-1"),
            name: "O'Brien's Lab".to_string(),
        });
        let sql = to_sql(&rows);
        assert!(sql.contains("'O''Brien''s Lab'"));
        assert!(sql.starts_with("INSERT INTO category"));
    }

    #[test]
    fn sql_emits_one_statement_per_entity_row() {
        let rows = sample_rows();
        let sql = to_sql(&rows);
        let statements = sql.lines().filter(|l| l.starts_with("INSERT INTO")).count();
        let allocation_rows: usize = rows.configurations.iter().map(|c| c.allocations.len()).sum();
        assert_eq!(statements, rows.row_count() + allocation_rows);
    }

    #[test]
    fn artifact_hash_matches_content() {
        let rows = sample_rows();
        let generated_at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).single().expect("timestamp");
        let artifact =
            export_artifact(&rows, ExportFormat::Csv, generated_at).expect("artifact");
        assert_eq!(artifact.content_hash, content_hash(&artifact.content));
        assert_eq!(artifact.format, ExportFormat::Csv);
        assert_eq!(artifact.schema_version, ROW_SET_SCHEMA_VERSION);
    }

    #[test]
    fn formats_derive_from_the_row_set_alone() {
        // Same row set, same bytes: every format is a pure function.
        let rows = sample_rows();
        for format in ExportFormat::ALL {
            let generated_at =
                Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).single().expect("timestamp");
            let a = export_artifact(&rows, format, generated_at).expect("first");
            let b = export_artifact(&rows, format, generated_at).expect("second");
            assert_eq!(a.content_hash, b.content_hash);
        }
    }
}
