//! Streaming readers for the accepted tabular formats
//!
//! Each reader runs on a blocking task, parses the staged file
//! incrementally (CSV row by row, XLSX sheet by sheet, Parquet row group
//! by row group) and hands batches of parsed rows to the async pipeline
//! over a bounded channel. Files are never materialized in memory.
//!
//! Every emitted row is tagged with `(table_key, 1-based row index)`;
//! CSV and Parquet use the single table key `primary`, XLSX uses the
//! sheet name.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use calamine::{open_workbook, Data, Reader as CalamineReader, Xlsx};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::error::{DomainError, DomainResult};
use crate::models::{ColumnSchema, TableSchema};

/// Table key used for single-table formats.
pub const PRIMARY_TABLE: &str = "primary";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Csv,
    Xlsx,
    Parquet,
}

impl FileFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Xlsx => "xlsx",
            Self::Parquet => "parquet",
        }
    }
}

/// Sniff the file format from magic bytes, falling back to the original
/// filename extension for the text case.
pub fn detect_format(path: &Path, original_filename: &str) -> DomainResult<FileFormat> {
    let mut magic = [0u8; 4];
    let read = File::open(path)
        .and_then(|mut f| f.read(&mut magic))
        .map_err(|e| DomainError::InvalidFileFormat(format!("cannot read upload: {e}")))?;

    if read >= 4 {
        // XLSX is a zip container; Parquet starts with PAR1.
        if &magic == b"PK\x03\x04" {
            return Ok(FileFormat::Xlsx);
        }
        if &magic == b"PAR1" {
            return Ok(FileFormat::Parquet);
        }
    }

    let lower = original_filename.to_ascii_lowercase();
    if lower.ends_with(".csv") || lower.ends_with(".txt") {
        return Ok(FileFormat::Csv);
    }
    if lower.ends_with(".xlsx") {
        return Err(DomainError::InvalidFileFormat(
            "file has an .xlsx name but is not a valid XLSX container".into(),
        ));
    }
    if lower.ends_with(".parquet") {
        return Err(DomainError::InvalidFileFormat(
            "file has a .parquet name but lacks the Parquet magic".into(),
        ));
    }

    // Bare uploads default to CSV, which the parser will validate.
    Ok(FileFormat::Csv)
}

/// One parsed row, positioned within its sheet/table.
#[derive(Debug, Clone)]
pub struct ParsedRow {
    pub table_key: String,
    pub row_index: i64,
    pub data: Value,
}

/// A batch of rows plus the reader's byte position (0 where the format
/// gives no meaningful offset).
#[derive(Debug)]
pub struct RowBatch {
    pub rows: Vec<ParsedRow>,
    pub file_position: u64,
}

/// Final message: schemas captured per table key.
#[derive(Debug)]
pub struct ReaderSummary {
    pub schemas: BTreeMap<String, TableSchema>,
}

#[derive(Debug)]
pub enum ReaderEvent {
    Batch(RowBatch),
    Done(ReaderSummary),
}

/// Spawn a blocking reader task for `path`. `skip_per_table` carries the
/// per-table row counts already staged by a previous attempt (checkpoint
/// resume); those rows are parsed but not re-emitted, so they are not
/// re-hashed downstream.
pub fn spawn_reader(
    path: PathBuf,
    format: FileFormat,
    batch_size: usize,
    skip_per_table: BTreeMap<String, u64>,
) -> mpsc::Receiver<DomainResult<ReaderEvent>> {
    let (tx, rx) = mpsc::channel(4);

    tokio::task::spawn_blocking(move || {
        let result = match format {
            FileFormat::Csv => read_csv(&path, batch_size, &skip_per_table, &tx),
            FileFormat::Xlsx => read_xlsx(&path, batch_size, &skip_per_table, &tx),
            FileFormat::Parquet => read_parquet(&path, batch_size, &skip_per_table, &tx),
        };
        if let Err(err) = result {
            // Receiver may already be gone on cancellation; nothing to do.
            let _ = tx.blocking_send(Err(err));
        }
    });

    rx
}

struct BatchSender<'a> {
    tx: &'a mpsc::Sender<DomainResult<ReaderEvent>>,
    batch_size: usize,
    rows: Vec<ParsedRow>,
}

impl<'a> BatchSender<'a> {
    fn new(tx: &'a mpsc::Sender<DomainResult<ReaderEvent>>, batch_size: usize) -> Self {
        Self {
            tx,
            batch_size,
            rows: Vec::with_capacity(batch_size),
        }
    }

    fn push(&mut self, row: ParsedRow, position: u64) -> DomainResult<()> {
        self.rows.push(row);
        if self.rows.len() >= self.batch_size {
            self.flush(position)?;
        }
        Ok(())
    }

    fn flush(&mut self, position: u64) -> DomainResult<()> {
        if self.rows.is_empty() {
            return Ok(());
        }
        let rows = std::mem::replace(&mut self.rows, Vec::with_capacity(self.batch_size));
        self.tx
            .blocking_send(Ok(ReaderEvent::Batch(RowBatch {
                rows,
                file_position: position,
            })))
            .map_err(|_| DomainError::Transient("import pipeline receiver dropped".into()))
    }

    fn done(mut self, schemas: BTreeMap<String, TableSchema>) -> DomainResult<()> {
        self.flush(0)?;
        self.tx
            .blocking_send(Ok(ReaderEvent::Done(ReaderSummary { schemas })))
            .map_err(|_| DomainError::Transient("import pipeline receiver dropped".into()))
    }
}

// ============================================================================
// CSV
// ============================================================================

fn read_csv(
    path: &Path,
    batch_size: usize,
    skip_per_table: &BTreeMap<String, u64>,
    tx: &mpsc::Sender<DomainResult<ReaderEvent>>,
) -> DomainResult<()> {
    let file = File::open(path)
        .map_err(|e| DomainError::InvalidFileFormat(format!("cannot open upload: {e}")))?;

    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(file);

    let mut schemas = BTreeMap::new();
    let mut sender = BatchSender::new(tx, batch_size);

    // An entirely empty file has no header and therefore no schema; a
    // header-only file captures the columns and emits zero rows.
    let headers: Vec<String> = match reader.headers() {
        Ok(h) if !h.is_empty() || h.iter().any(|f| !f.is_empty()) => {
            h.iter().map(|f| f.to_string()).collect()
        }
        Ok(_) => Vec::new(),
        Err(e) => {
            return Err(DomainError::InvalidFileFormat(format!(
                "cannot parse CSV header: {e}"
            )))
        }
    };

    if headers.is_empty() {
        return sender.done(schemas);
    }

    schemas.insert(
        PRIMARY_TABLE.to_string(),
        TableSchema {
            columns: headers
                .iter()
                .map(|name| ColumnSchema {
                    name: name.clone(),
                    dtype: "string".into(),
                    nullable: true,
                })
                .collect(),
        },
    );

    let skip = skip_per_table.get(PRIMARY_TABLE).copied().unwrap_or(0);
    let mut row_index: i64 = 0;

    for record in reader.records() {
        let record = record.map_err(|e| {
            let at = e
                .position()
                .map(|p| format!(" at line {}", p.line()))
                .unwrap_or_default();
            DomainError::InvalidFileFormat(format!("malformed CSV row{at}: {e}"))
        })?;

        row_index += 1;
        if (row_index as u64) <= skip {
            continue;
        }

        if record.len() != headers.len() {
            return Err(DomainError::InvalidFileFormat(format!(
                "row {row_index} has {} fields, expected {}",
                record.len(),
                headers.len()
            )));
        }

        let mut object = Map::with_capacity(headers.len());
        for (name, field) in headers.iter().zip(record.iter()) {
            object.insert(name.clone(), Value::String(field.to_string()));
        }

        let position = record.position().map(|p| p.byte()).unwrap_or(0);
        sender.push(
            ParsedRow {
                table_key: PRIMARY_TABLE.to_string(),
                row_index,
                data: Value::Object(object),
            },
            position,
        )?;
    }

    sender.done(schemas)
}

// ============================================================================
// XLSX
// ============================================================================

fn cell_to_value(cell: &Data) -> Value {
    match cell {
        Data::Empty => Value::Null,
        Data::String(s) => Value::String(s.clone()),
        Data::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Data::Int(i) => Value::Number((*i).into()),
        Data::Bool(b) => Value::Bool(*b),
        dt @ Data::DateTime(_) => Value::String(dt.to_string()),
        Data::DateTimeIso(s) | Data::DurationIso(s) => Value::String(s.clone()),
        Data::Error(e) => Value::String(format!("#ERR:{e:?}")),
    }
}

fn cell_dtype(cell: &Data) -> Option<&'static str> {
    match cell {
        Data::Empty => None,
        Data::String(_) | Data::DateTimeIso(_) | Data::DurationIso(_) | Data::Error(_) => {
            Some("string")
        }
        Data::Float(_) => Some("float"),
        Data::Int(_) => Some("integer"),
        Data::Bool(_) => Some("boolean"),
        Data::DateTime(_) => Some("datetime"),
    }
}

fn merge_dtype(current: Option<&'static str>, observed: Option<&'static str>) -> Option<&'static str> {
    match (current, observed) {
        (None, o) => o,
        (c, None) => c,
        (Some(c), Some(o)) if c == o => Some(c),
        // Integer widens to float; anything else mixes down to string.
        (Some("integer"), Some("float")) | (Some("float"), Some("integer")) => Some("float"),
        _ => Some("string"),
    }
}

fn read_xlsx(
    path: &Path,
    batch_size: usize,
    skip_per_table: &BTreeMap<String, u64>,
    tx: &mpsc::Sender<DomainResult<ReaderEvent>>,
) -> DomainResult<()> {
    let mut workbook: Xlsx<_> = open_workbook(path)
        .map_err(|e| DomainError::InvalidFileFormat(format!("cannot open XLSX: {e}")))?;

    let sheet_names = workbook.sheet_names().to_owned();
    let mut schemas = BTreeMap::new();
    let mut sender = BatchSender::new(tx, batch_size);

    for sheet in sheet_names {
        let range = workbook.worksheet_range(&sheet).map_err(|e| {
            DomainError::InvalidFileFormat(format!("cannot read sheet '{sheet}': {e}"))
        })?;

        let mut rows = range.rows();
        let headers: Vec<String> = match rows.next() {
            Some(header_row) => header_row
                .iter()
                .enumerate()
                .map(|(i, cell)| match cell {
                    Data::Empty => format!("column_{}", i + 1),
                    other => other.to_string(),
                })
                .collect(),
            None => continue, // empty sheet contributes nothing
        };

        let mut dtypes: Vec<Option<&'static str>> = vec![None; headers.len()];
        let skip = skip_per_table.get(&sheet).copied().unwrap_or(0);
        let mut row_index: i64 = 0;

        for row in rows {
            row_index += 1;

            if row.len() > headers.len() {
                return Err(DomainError::InvalidFileFormat(format!(
                    "sheet '{sheet}' row {row_index} has {} cells, header has {}",
                    row.len(),
                    headers.len()
                )));
            }

            let mut object = Map::with_capacity(headers.len());
            for (i, name) in headers.iter().enumerate() {
                let cell = row.get(i).unwrap_or(&Data::Empty);
                dtypes[i] = merge_dtype(dtypes[i], cell_dtype(cell));
                object.insert(name.clone(), cell_to_value(cell));
            }

            if (row_index as u64) <= skip {
                continue;
            }

            sender.push(
                ParsedRow {
                    table_key: sheet.clone(),
                    row_index,
                    data: Value::Object(object),
                },
                0,
            )?;
        }

        schemas.insert(
            sheet.clone(),
            TableSchema {
                columns: headers
                    .iter()
                    .zip(dtypes.iter())
                    .map(|(name, dtype)| ColumnSchema {
                        name: name.clone(),
                        dtype: dtype.unwrap_or("string").to_string(),
                        nullable: true,
                    })
                    .collect(),
            },
        );
    }

    sender.done(schemas)
}

// ============================================================================
// Parquet
// ============================================================================

fn arrow_dtype_name(dtype: &arrow::datatypes::DataType) -> String {
    use arrow::datatypes::DataType::*;
    match dtype {
        Boolean => "boolean".into(),
        Int8 | Int16 | Int32 | Int64 | UInt8 | UInt16 | UInt32 | UInt64 => "integer".into(),
        Float16 | Float32 | Float64 => "float".into(),
        Utf8 | LargeUtf8 | Utf8View => "string".into(),
        Date32 | Date64 => "date".into(),
        Timestamp(_, _) => "timestamp".into(),
        Decimal128(_, _) | Decimal256(_, _) => "decimal".into(),
        other => format!("{other:?}").to_ascii_lowercase(),
    }
}

fn read_parquet(
    path: &Path,
    batch_size: usize,
    skip_per_table: &BTreeMap<String, u64>,
    tx: &mpsc::Sender<DomainResult<ReaderEvent>>,
) -> DomainResult<()> {
    let file = File::open(path)
        .map_err(|e| DomainError::InvalidFileFormat(format!("cannot open upload: {e}")))?;

    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(|e| DomainError::InvalidFileFormat(format!("cannot read Parquet file: {e}")))?;

    let schema = builder.schema().clone();
    let reader = builder
        .with_batch_size(batch_size)
        .build()
        .map_err(|e| DomainError::InvalidFileFormat(format!("cannot read Parquet file: {e}")))?;

    let mut schemas = BTreeMap::new();
    schemas.insert(
        PRIMARY_TABLE.to_string(),
        TableSchema {
            columns: schema
                .fields()
                .iter()
                .map(|field| ColumnSchema {
                    name: field.name().clone(),
                    dtype: arrow_dtype_name(field.data_type()),
                    nullable: field.is_nullable(),
                })
                .collect(),
        },
    );

    let skip = skip_per_table.get(PRIMARY_TABLE).copied().unwrap_or(0);
    let mut sender = BatchSender::new(tx, batch_size);
    let mut row_index: i64 = 0;

    for batch in reader {
        let batch = batch.map_err(|e| {
            DomainError::InvalidFileFormat(format!(
                "Parquet decode error near row {}: {e}",
                row_index + 1
            ))
        })?;

        // Render the record batch as JSON rows; arrow's JSON writer keeps
        // the source column names verbatim.
        let mut buf = Vec::new();
        {
            let mut writer = arrow::json::LineDelimitedWriter::new(&mut buf);
            writer.write_batches(&[&batch]).map_err(|e| {
                DomainError::InvalidFileFormat(format!("Parquet row conversion failed: {e}"))
            })?;
            writer.finish().map_err(|e| {
                DomainError::InvalidFileFormat(format!("Parquet row conversion failed: {e}"))
            })?;
        }

        for line in buf.split(|b| *b == b'\n').filter(|l| !l.is_empty()) {
            row_index += 1;
            if (row_index as u64) <= skip {
                continue;
            }

            let data: Value = serde_json::from_slice(line).map_err(|e| {
                DomainError::InvalidFileFormat(format!(
                    "Parquet row {row_index} is not a valid record: {e}"
                ))
            })?;

            sender.push(
                ParsedRow {
                    table_key: PRIMARY_TABLE.to_string(),
                    row_index,
                    data,
                },
                0,
            )?;
        }
    }

    sender.done(schemas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(content: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().expect("temp file");
        f.write_all(content).expect("write");
        f.flush().expect("flush");
        f
    }

    async fn collect_events(
        mut rx: mpsc::Receiver<DomainResult<ReaderEvent>>,
    ) -> (Vec<ParsedRow>, Option<ReaderSummary>, Option<DomainError>) {
        let mut rows = Vec::new();
        let mut summary = None;
        let mut error = None;
        while let Some(event) = rx.recv().await {
            match event {
                Ok(ReaderEvent::Batch(batch)) => rows.extend(batch.rows),
                Ok(ReaderEvent::Done(s)) => summary = Some(s),
                Err(e) => {
                    error = Some(e);
                    break;
                }
            }
        }
        (rows, summary, error)
    }

    #[tokio::test]
    async fn test_csv_rows_and_schema() {
        let f = write_temp(b"id,name\n1,alice\n2,bob\n");
        let rx = spawn_reader(
            f.path().to_path_buf(),
            FileFormat::Csv,
            100,
            BTreeMap::new(),
        );
        let (rows, summary, error) = collect_events(rx).await;

        assert!(error.is_none(), "unexpected error: {error:?}");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].table_key, PRIMARY_TABLE);
        assert_eq!(rows[0].row_index, 1);
        assert_eq!(rows[0].data["id"], "1");
        assert_eq!(rows[1].data["name"], "bob");

        let schema = &summary.expect("summary").schemas[PRIMARY_TABLE];
        assert_eq!(
            schema.columns.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            vec!["id", "name"]
        );
        assert!(schema.columns.iter().all(|c| c.dtype == "string" && c.nullable));
    }

    #[tokio::test]
    async fn test_csv_header_only_yields_schema_no_rows() {
        let f = write_temp(b"id,name\n");
        let rx = spawn_reader(
            f.path().to_path_buf(),
            FileFormat::Csv,
            100,
            BTreeMap::new(),
        );
        let (rows, summary, error) = collect_events(rx).await;

        assert!(error.is_none());
        assert!(rows.is_empty());
        assert_eq!(
            summary.expect("summary").schemas[PRIMARY_TABLE].columns.len(),
            2
        );
    }

    #[tokio::test]
    async fn test_csv_empty_file_yields_empty_summary() {
        let f = write_temp(b"");
        let rx = spawn_reader(
            f.path().to_path_buf(),
            FileFormat::Csv,
            100,
            BTreeMap::new(),
        );
        let (rows, summary, error) = collect_events(rx).await;

        assert!(error.is_none());
        assert!(rows.is_empty());
        assert!(summary.expect("summary").schemas.is_empty());
    }

    #[tokio::test]
    async fn test_csv_ragged_row_fails_with_row_identifier() {
        let f = write_temp(b"id,name\n1,alice\n2,bob,extra\n");
        let rx = spawn_reader(
            f.path().to_path_buf(),
            FileFormat::Csv,
            100,
            BTreeMap::new(),
        );
        let (_rows, _summary, error) = collect_events(rx).await;

        match error {
            Some(DomainError::InvalidFileFormat(msg)) => {
                assert!(msg.contains("3") || msg.contains("2"), "message should point at the row: {msg}");
            }
            other => panic!("expected InvalidFileFormat, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_csv_resume_skips_already_emitted_rows() {
        let f = write_temp(b"id,name\n1,alice\n2,bob\n3,carol\n");
        let mut skip = BTreeMap::new();
        skip.insert(PRIMARY_TABLE.to_string(), 2u64);

        let rx = spawn_reader(f.path().to_path_buf(), FileFormat::Csv, 100, skip);
        let (rows, _summary, error) = collect_events(rx).await;

        assert!(error.is_none());
        assert_eq!(rows.len(), 1, "only the unstaged tail should be re-emitted");
        assert_eq!(rows[0].row_index, 3);
        assert_eq!(rows[0].data["name"], "carol");
    }

    #[tokio::test]
    async fn test_batching_respects_batch_size() {
        let mut content = String::from("id\n");
        for i in 0..25 {
            content.push_str(&format!("{i}\n"));
        }
        let f = write_temp(content.as_bytes());

        let mut rx = spawn_reader(
            f.path().to_path_buf(),
            FileFormat::Csv,
            10,
            BTreeMap::new(),
        );

        let mut batch_sizes = Vec::new();
        while let Some(event) = rx.recv().await {
            if let Ok(ReaderEvent::Batch(batch)) = event {
                batch_sizes.push(batch.rows.len());
            }
        }
        assert_eq!(batch_sizes, vec![10, 10, 5]);
    }

    #[test]
    fn test_detect_format_magic_bytes() {
        let parquet = write_temp(b"PAR1xxxx");
        assert_eq!(
            detect_format(parquet.path(), "data.bin").unwrap(),
            FileFormat::Parquet
        );

        let zip = write_temp(b"PK\x03\x04rest");
        assert_eq!(
            detect_format(zip.path(), "book.xlsx").unwrap(),
            FileFormat::Xlsx
        );

        let csv = write_temp(b"id,name\n1,a\n");
        assert_eq!(
            detect_format(csv.path(), "data.csv").unwrap(),
            FileFormat::Csv
        );
    }

    #[test]
    fn test_detect_format_rejects_mislabeled_parquet() {
        let f = write_temp(b"id,name\n");
        assert!(matches!(
            detect_format(f.path(), "data.parquet"),
            Err(DomainError::InvalidFileFormat(_))
        ));
    }

    #[test]
    fn test_merge_dtype_lattice() {
        assert_eq!(merge_dtype(None, Some("integer")), Some("integer"));
        assert_eq!(merge_dtype(Some("integer"), Some("float")), Some("float"));
        assert_eq!(merge_dtype(Some("integer"), Some("integer")), Some("integer"));
        assert_eq!(merge_dtype(Some("boolean"), Some("string")), Some("string"));
        assert_eq!(merge_dtype(Some("float"), None), Some("float"));
    }
}
