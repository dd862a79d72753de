//! Cross-module pipeline tests: parsing, canonicalization and hashing for
//! the accepted import formats, without a database.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

use arrow::array::{Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;

use datavault::canonical;
use datavault::import::readers::{
    detect_format, spawn_reader, FileFormat, ParsedRow, ReaderEvent, PRIMARY_TABLE,
};

async fn read_all(path: std::path::PathBuf, format: FileFormat) -> Vec<ParsedRow> {
    let mut rx = spawn_reader(path, format, 1000, BTreeMap::new());
    let mut rows = Vec::new();
    while let Some(event) = rx.recv().await {
        match event.expect("reader should succeed") {
            ReaderEvent::Batch(batch) => rows.extend(batch.rows),
            ReaderEvent::Done(_) => {}
        }
    }
    rows
}

fn row_hashes(rows: &[ParsedRow]) -> Vec<String> {
    let mut hashes: Vec<String> = rows.iter().map(|r| canonical::row_hash(&r.data)).collect();
    hashes.sort();
    hashes
}

#[tokio::test]
async fn csv_parse_and_hash_is_content_deterministic() {
    // Two byte-identical files in fresh locations must hash to the same
    // multiset of row hashes.
    let content = b"id,name\n1,alice\n2,bob\n3,carol\n";

    let mut a = tempfile::NamedTempFile::new().unwrap();
    a.write_all(content).unwrap();
    let mut b = tempfile::NamedTempFile::new().unwrap();
    b.write_all(content).unwrap();

    let rows_a = read_all(a.path().to_path_buf(), FileFormat::Csv).await;
    let rows_b = read_all(b.path().to_path_buf(), FileFormat::Csv).await;

    assert_eq!(rows_a.len(), 3);
    assert_eq!(row_hashes(&rows_a), row_hashes(&rows_b));
}

#[tokio::test]
async fn csv_duplicate_rows_share_a_hash() {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(b"id,name\n2,bob\n2,bob\n3,carol\n").unwrap();

    let rows = read_all(f.path().to_path_buf(), FileFormat::Csv).await;
    assert_eq!(rows.len(), 3, "duplicate rows still occupy manifest positions");

    let distinct: std::collections::HashSet<String> =
        rows.iter().map(|r| canonical::row_hash(&r.data)).collect();
    assert_eq!(distinct.len(), 2, "identical payloads must share one hash");
}

#[tokio::test]
async fn csv_row_order_is_one_based_and_stable() {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(b"id,name\n1,alice\n2,bob\n").unwrap();

    let rows = read_all(f.path().to_path_buf(), FileFormat::Csv).await;
    let ids: Vec<(String, i64)> = rows
        .iter()
        .map(|r| (r.table_key.clone(), r.row_index))
        .collect();
    assert_eq!(
        ids,
        vec![(PRIMARY_TABLE.to_string(), 1), (PRIMARY_TABLE.to_string(), 2)]
    );
}

fn write_parquet(path: &std::path::Path) {
    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("name", DataType::Utf8, true),
    ]));
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(Int64Array::from(vec![1, 2, 3])),
            Arc::new(StringArray::from(vec![Some("alice"), Some("bob"), None])),
        ],
    )
    .unwrap();

    let file = std::fs::File::create(path).unwrap();
    let mut writer = ArrowWriter::try_new(file, schema, None).unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();
}

#[tokio::test]
async fn parquet_roundtrip_preserves_values_and_positions() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.parquet");
    write_parquet(&path);

    assert_eq!(
        detect_format(&path, "data.parquet").unwrap(),
        FileFormat::Parquet
    );

    let rows = read_all(path, FileFormat::Parquet).await;
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].row_index, 1);
    assert_eq!(rows[0].data["id"], 1);
    assert_eq!(rows[0].data["name"], "alice");
    // Arrow's JSON writer omits null fields; canonicalization treats the
    // absent key and an explicit null as distinct payload shapes, which is
    // fine because it does so deterministically.
    assert_eq!(rows[2].data["id"], 3);
}

#[tokio::test]
async fn parquet_identical_files_hash_identically() {
    let dir = tempfile::tempdir().unwrap();
    let path_a = dir.path().join("a.parquet");
    let path_b = dir.path().join("b.parquet");
    write_parquet(&path_a);
    write_parquet(&path_b);

    let rows_a = read_all(path_a, FileFormat::Parquet).await;
    let rows_b = read_all(path_b, FileFormat::Parquet).await;
    assert_eq!(row_hashes(&rows_a), row_hashes(&rows_b));
}

#[test]
fn csv_and_parquet_schemas_differ_by_dtype_only() {
    // CSV cells are strings; Parquet carries native types. The canonical
    // form therefore differs between formats for the "same" table, and
    // hashing reflects that.
    let csv_row = serde_json::json!({"id": "1", "name": "alice"});
    let parquet_row = serde_json::json!({"id": 1, "name": "alice"});
    assert_ne!(
        canonical::row_hash(&csv_row),
        canonical::row_hash(&parquet_row)
    );
}
