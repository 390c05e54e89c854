//! Append-only column storage for run outputs.
//!
//! The reducer is the only writer, so implementations take `&mut self` and
//! need no internal locking.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("table {0} does not exist")]
    UnknownTable(String),
    #[error("table {0} already exists")]
    TableExists(String),
    #[error("table {table}: expected {expected} columns, got {got}")]
    ColumnCount { table: String, expected: usize, got: usize },
    #[error("table {table}: column {column} has type {got:?}, schema says {expected:?}")]
    ColumnType { table: String, column: String, expected: ColumnType, got: ColumnType },
    #[error("table {table}: columns have different lengths")]
    RaggedColumns { table: String },
    #[error("array {name}: shape {shape:?} does not match {len} values")]
    ArrayShape { name: String, shape: Vec<usize>, len: usize },
    #[error("malformed row {line} in {table}: {detail}")]
    MalformedRow { table: String, line: usize, detail: String },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    U8,
    U16,
    U32,
    F64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    F64(Vec<f64>),
}

impl ColumnData {
    pub fn empty(ty: ColumnType) -> Self {
        match ty {
            ColumnType::U8 => ColumnData::U8(Vec::new()),
            ColumnType::U16 => ColumnData::U16(Vec::new()),
            ColumnType::U32 => ColumnData::U32(Vec::new()),
            ColumnType::F64 => ColumnData::F64(Vec::new()),
        }
    }

    pub fn column_type(&self) -> ColumnType {
        match self {
            ColumnData::U8(_) => ColumnType::U8,
            ColumnData::U16(_) => ColumnType::U16,
            ColumnData::U32(_) => ColumnType::U32,
            ColumnData::F64(_) => ColumnType::F64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ColumnData::U8(v) => v.len(),
            ColumnData::U16(v) => v.len(),
            ColumnData::U32(v) => v.len(),
            ColumnData::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes the column occupies once stored.
    pub fn nbytes(&self) -> usize {
        match self {
            ColumnData::U8(v) => v.len(),
            ColumnData::U16(v) => v.len() * 2,
            ColumnData::U32(v) => v.len() * 4,
            ColumnData::F64(v) => v.len() * 8,
        }
    }

    /// Value at `i` as JSON, for row-oriented writers.
    fn json_at(&self, i: usize) -> Value {
        match self {
            ColumnData::U8(v) => Value::from(v[i]),
            ColumnData::U16(v) => Value::from(v[i]),
            ColumnData::U32(v) => Value::from(v[i]),
            ColumnData::F64(v) => Value::from(v[i]),
        }
    }

    fn push_json(&mut self, value: &Value) -> Option<()> {
        match self {
            ColumnData::U8(v) => v.push(u8::try_from(value.as_u64()?).ok()?),
            ColumnData::U16(v) => v.push(u16::try_from(value.as_u64()?).ok()?),
            ColumnData::U32(v) => v.push(u32::try_from(value.as_u64()?).ok()?),
            ColumnData::F64(v) => v.push(value.as_f64()?),
        }
        Some(())
    }

    fn extend(&mut self, other: ColumnData) -> Option<()> {
        match (self, other) {
            (ColumnData::U8(a), ColumnData::U8(b)) => a.extend(b),
            (ColumnData::U16(a), ColumnData::U16(b)) => a.extend(b),
            (ColumnData::U32(a), ColumnData::U32(b)) => a.extend(b),
            (ColumnData::F64(a), ColumnData::F64(b)) => a.extend(b),
            _ => return None,
        }
        Some(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<(String, ColumnType)>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<(String, ColumnType)>) -> Self {
        TableSchema { name: name.into(), columns }
    }

    /// Reject column sets that do not match the schema; returns the row count.
    fn check(&self, columns: &[ColumnData]) -> Result<usize, StoreError> {
        if columns.len() != self.columns.len() {
            return Err(StoreError::ColumnCount {
                table: self.name.clone(),
                expected: self.columns.len(),
                got: columns.len(),
            });
        }
        for ((name, ty), col) in self.columns.iter().zip(columns) {
            if col.column_type() != *ty {
                return Err(StoreError::ColumnType {
                    table: self.name.clone(),
                    column: name.clone(),
                    expected: *ty,
                    got: col.column_type(),
                });
            }
        }
        let nrows = columns.first().map_or(0, ColumnData::len);
        if columns.iter().any(|c| c.len() != nrows) {
            return Err(StoreError::RaggedColumns { table: self.name.clone() });
        }
        Ok(nrows)
    }
}

pub type Metadata = BTreeMap<String, Value>;

/// A dense n-dimensional `f64` array (row-major).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredArray {
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
    pub metadata: Metadata,
}

/// The persistent store as seen by the reducer.
pub trait ColumnStore {
    fn create_table(&mut self, schema: TableSchema, metadata: Metadata) -> Result<(), StoreError>;

    /// Append rows given column-wise; returns the number of rows appended.
    fn append_rows(&mut self, table: &str, columns: Vec<ColumnData>) -> Result<usize, StoreError>;

    /// Read a whole table back, column-wise.
    fn read_table(&mut self, table: &str) -> Result<Vec<ColumnData>, StoreError>;

    fn table_metadata(&self, table: &str) -> Result<&Metadata, StoreError>;

    fn write_array(&mut self, name: &str, array: StoredArray) -> Result<(), StoreError>;

    fn flush(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

fn check_array(name: &str, array: &StoredArray) -> Result<(), StoreError> {
    if array.shape.iter().product::<usize>() != array.data.len() {
        return Err(StoreError::ArrayShape {
            name: name.to_string(),
            shape: array.shape.clone(),
            len: array.data.len(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct MemTable {
    schema: TableSchema,
    metadata: Metadata,
    columns: Vec<ColumnData>,
}

/// Everything kept in memory; used by tests and small runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: HashMap<String, MemTable>,
    arrays: HashMap<String, StoredArray>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn columns(&self, table: &str) -> Option<&[ColumnData]> {
        self.tables.get(table).map(|t| t.columns.as_slice())
    }

    pub fn num_rows(&self, table: &str) -> usize {
        self.columns(table)
            .and_then(|cols| cols.first())
            .map_or(0, ColumnData::len)
    }

    pub fn array(&self, name: &str) -> Option<&StoredArray> {
        self.arrays.get(name)
    }
}

impl ColumnStore for MemoryStore {
    fn create_table(&mut self, schema: TableSchema, metadata: Metadata) -> Result<(), StoreError> {
        if self.tables.contains_key(&schema.name) {
            return Err(StoreError::TableExists(schema.name));
        }
        let columns = schema.columns.iter().map(|(_, ty)| ColumnData::empty(*ty)).collect();
        self.tables.insert(schema.name.clone(), MemTable { schema, metadata, columns });
        Ok(())
    }

    fn append_rows(&mut self, table: &str, columns: Vec<ColumnData>) -> Result<usize, StoreError> {
        let t = self
            .tables
            .get_mut(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;
        let nrows = t.schema.check(&columns)?;
        for (dst, src) in t.columns.iter_mut().zip(columns) {
            // Types were checked against the schema above.
            dst.extend(src).ok_or_else(|| StoreError::RaggedColumns { table: table.to_string() })?;
        }
        Ok(nrows)
    }

    fn read_table(&mut self, table: &str) -> Result<Vec<ColumnData>, StoreError> {
        self.tables
            .get(table)
            .map(|t| t.columns.clone())
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))
    }

    fn table_metadata(&self, table: &str) -> Result<&Metadata, StoreError> {
        self.tables
            .get(table)
            .map(|t| &t.metadata)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))
    }

    fn write_array(&mut self, name: &str, array: StoredArray) -> Result<(), StoreError> {
        check_array(name, &array)?;
        self.arrays.insert(name.to_string(), array);
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct TableHeader {
    schema: TableSchema,
    metadata: Metadata,
}

struct NdjsonTable {
    header: TableHeader,
    path: PathBuf,
    writer: BufWriter<File>,
}

/// One NDJSON file per table (`<name>.ndjson`, one JSON object per row),
/// a `<name>.schema.json` header, and `<name>.json` per array.
pub struct NdjsonStore {
    dir: PathBuf,
    tables: HashMap<String, NdjsonTable>,
}

impl NdjsonStore {
    pub fn create(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(NdjsonStore { dir, tables: HashMap::new() })
    }

    /// Reopen a directory written by an earlier run. New rows are appended.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        let mut tables = HashMap::new();
        for entry in fs::read_dir(&dir)? {
            let header_path = entry?.path();
            let Some(name) = header_path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".schema.json"))
            else {
                continue;
            };
            let name = name.to_string();
            let header: TableHeader = serde_json::from_reader(BufReader::new(File::open(&header_path)?))?;
            let path = dir.join(format!("{name}.ndjson"));
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            tables.insert(name, NdjsonTable { header, path, writer: BufWriter::new(file) });
        }
        Ok(NdjsonStore { dir, tables })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn table_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tables.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn table_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.ndjson"))
    }
}

impl ColumnStore for NdjsonStore {
    fn create_table(&mut self, schema: TableSchema, metadata: Metadata) -> Result<(), StoreError> {
        if self.tables.contains_key(&schema.name) {
            return Err(StoreError::TableExists(schema.name));
        }
        let header = TableHeader { schema, metadata };
        let header_path = self.dir.join(format!("{}.schema.json", header.schema.name));
        serde_json::to_writer_pretty(BufWriter::new(File::create(header_path)?), &header)?;

        let path = self.table_path(&header.schema.name);
        let writer = BufWriter::new(File::create(&path)?);
        let name = header.schema.name.clone();
        self.tables.insert(name, NdjsonTable { header, path, writer });
        Ok(())
    }

    fn append_rows(&mut self, table: &str, columns: Vec<ColumnData>) -> Result<usize, StoreError> {
        let t = self
            .tables
            .get_mut(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;
        let nrows = t.header.schema.check(&columns)?;
        for i in 0..nrows {
            let row: serde_json::Map<String, Value> = t
                .header
                .schema
                .columns
                .iter()
                .zip(&columns)
                .map(|((name, _), col)| (name.clone(), col.json_at(i)))
                .collect();
            serde_json::to_writer(&mut t.writer, &row)?;
            writeln!(t.writer)?;
        }
        Ok(nrows)
    }

    fn read_table(&mut self, table: &str) -> Result<Vec<ColumnData>, StoreError> {
        let t = self
            .tables
            .get_mut(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;
        t.writer.flush()?;
        let schema = &t.header.schema;
        let mut columns: Vec<ColumnData> =
            schema.columns.iter().map(|(_, ty)| ColumnData::empty(*ty)).collect();
        for (line_no, line) in BufReader::new(File::open(&t.path)?).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let row: serde_json::Map<String, Value> = serde_json::from_str(&line)?;
            for ((name, _), col) in schema.columns.iter().zip(columns.iter_mut()) {
                row.get(name).and_then(|v| col.push_json(v)).ok_or_else(|| {
                    StoreError::MalformedRow {
                        table: table.to_string(),
                        line: line_no + 1,
                        detail: format!("missing or invalid column {name}"),
                    }
                })?;
            }
        }
        Ok(columns)
    }

    fn table_metadata(&self, table: &str) -> Result<&Metadata, StoreError> {
        self.tables
            .get(table)
            .map(|t| &t.header.metadata)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))
    }

    fn write_array(&mut self, name: &str, array: StoredArray) -> Result<(), StoreError> {
        check_array(name, &array)?;
        let file = File::create(self.dir.join(format!("{name}.json")))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &array)?;
        writer.flush()?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        for t in self.tables.values_mut() {
            t.writer.flush()?;
        }
        Ok(())
    }
}
