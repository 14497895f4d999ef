//! Storage layer: Parquet metrics, YAML config/metadata, run directory management.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Float64Array, Int64Array, TimestampMicrosecondArray};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::file::properties::WriterProperties;

use crate::error::{ExpsimError, Result};
use crate::models::{JobSpec, MetricRecord, RunConfig, RunMetadata};

pub const RUN_META_FILE: &str = "run.yaml";
pub const CONFIG_FILE: &str = "config.yaml";
pub const METRICS_FILE: &str = "metrics.parquet";
pub const LOG_FILE: &str = "run.log";
pub const JOB_FILE: &str = "job.yaml";
pub const ARTIFACTS_DIR: &str = "artifacts";
pub const CODE_DIR: &str = "code";

// ─── Directory helpers ────────────────────────────────────────────────────────

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub fn list_projects(base_dir: &Path) -> Result<Vec<String>> {
    let mut names = list_dirs(base_dir)?;
    names.sort();
    Ok(names)
}

/// Runs of a project, newest first (run names start with a timestamp).
pub fn list_runs(project_dir: &Path) -> Result<Vec<String>> {
    let mut names = list_dirs(project_dir)?;
    names.sort_by(|a, b| b.cmp(a));
    Ok(names)
}

fn list_dirs(dir: &Path) -> Result<Vec<String>> {
    if !dir.exists() {
        return Ok(vec![]);
    }
    let mut names = vec![];
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}

/// Files under the run's `artifacts/` directory, relative to it.
pub fn list_artifacts(run_dir: &Path) -> Result<Vec<(String, u64)>> {
    let root = run_dir.join(ARTIFACTS_DIR);
    let mut out = vec![];
    if root.exists() {
        collect_files(&root, &root, &mut out)?;
    }
    out.sort();
    Ok(out)
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<(String, u64)>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else {
            let rel = path.strip_prefix(root).unwrap_or(&path);
            out.push((rel.to_string_lossy().to_string(), path.metadata()?.len()));
        }
    }
    Ok(())
}

// ─── YAML I/O ────────────────────────────────────────────────────────────────

pub fn save_yaml<T: serde::Serialize>(path: &Path, data: &T) -> Result<()> {
    let content = serde_yaml::to_string(data)?;
    fs::write(path, content)?;
    Ok(())
}

pub fn load_yaml<T: serde::de::DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let content = fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&content)?)
}

pub fn save_run_metadata(run_dir: &Path, meta: &RunMetadata) -> Result<()> {
    save_yaml(&run_dir.join(RUN_META_FILE), meta)
}

pub fn load_run_metadata(run_dir: &Path) -> Result<RunMetadata> {
    let path = run_dir.join(RUN_META_FILE);
    if !path.exists() {
        return Err(ExpsimError::RunNotFound(run_dir.display().to_string()));
    }
    let content = fs::read_to_string(&path)?;
    Ok(serde_yaml::from_str(&content)?)
}

pub fn save_config(run_dir: &Path, config: &RunConfig) -> Result<()> {
    save_yaml(&run_dir.join(CONFIG_FILE), config)
}

pub fn load_config(run_dir: &Path) -> Result<RunConfig> {
    load_yaml(&run_dir.join(CONFIG_FILE))
}

pub fn save_job(run_dir: &Path, job: &JobSpec) -> Result<()> {
    save_yaml(&run_dir.join(JOB_FILE), job)
}

// ─── Parquet metrics I/O ─────────────────────────────────────────────────────

/// Append metric records to a Parquet file.
/// Strategy: read existing → concat → write back. Called on batched flushes only.
pub fn append_metrics(path: &Path, records: &[MetricRecord]) -> Result<()> {
    if records.is_empty() {
        return Ok(());
    }

    let new_batch = records_to_batch(records)?;
    let final_batch = if path.exists() {
        let existing = read_parquet(path)?;
        concat_batches(&existing, &new_batch)?
    } else {
        new_batch
    };

    write_parquet(path, &final_batch)
}

/// Read all metrics from a Parquet file as a list of row maps.
pub fn read_metrics(path: &Path) -> Result<Vec<HashMap<String, serde_json::Value>>> {
    if !path.exists() {
        return Ok(vec![]);
    }
    let batch = read_parquet(path)?;
    Ok(batch_to_rows(&batch))
}

fn base_fields() -> Vec<Field> {
    vec![
        Field::new("step", DataType::Int64, true),
        Field::new(
            "timestamp",
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            false,
        ),
    ]
}

fn read_parquet(path: &Path) -> Result<RecordBatch> {
    let file = fs::File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
    let mut batches = vec![];
    for batch in reader {
        batches.push(batch?);
    }
    match batches.len() {
        0 => Ok(RecordBatch::new_empty(Arc::new(Schema::new(base_fields())))),
        1 => Ok(batches.remove(0)),
        _ => {
            let schema = batches[0].schema();
            Ok(arrow::compute::concat_batches(&schema, &batches)?)
        }
    }
}

fn write_parquet(path: &Path, batch: &RecordBatch) -> Result<()> {
    let file = fs::File::create(path)?;
    let props = WriterProperties::builder()
        .set_compression(parquet::basic::Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;
    Ok(())
}

fn concat_batches(existing: &RecordBatch, new: &RecordBatch) -> Result<RecordBatch> {
    // Metric keys first seen in the new batch become nullable columns for old rows.
    let merged = Arc::new(merge_schemas(existing.schema_ref(), new.schema_ref()));
    let existing_aligned = align_batch(existing, &merged)?;
    let new_aligned = align_batch(new, &merged)?;
    Ok(arrow::compute::concat_batches(
        &merged,
        &[existing_aligned, new_aligned],
    )?)
}

fn merge_schemas(a: &Schema, b: &Schema) -> Schema {
    let mut fields: Vec<Field> = a.fields().iter().map(|f| f.as_ref().clone()).collect();
    for field in b.fields() {
        if a.field_with_name(field.name()).is_err() {
            fields.push(field.as_ref().clone());
        }
    }
    Schema::new(fields)
}

fn align_batch(batch: &RecordBatch, target: &Arc<Schema>) -> Result<RecordBatch> {
    let n = batch.num_rows();
    let mut columns: Vec<ArrayRef> = vec![];

    for field in target.fields() {
        let column: ArrayRef = match batch.column_by_name(field.name()) {
            Some(col) => col.clone(),
            None => match field.data_type() {
                DataType::Int64 => Arc::new(Int64Array::from(vec![None::<i64>; n])),
                DataType::Timestamp(TimeUnit::Microsecond, _) => Arc::new(
                    TimestampMicrosecondArray::from(vec![None::<i64>; n])
                        .with_timezone_opt(Some("UTC".to_string())),
                ),
                _ => Arc::new(Float64Array::from(vec![None::<f64>; n])),
            },
        };
        columns.push(column);
    }

    Ok(RecordBatch::try_new(target.clone(), columns)?)
}

fn records_to_batch(records: &[MetricRecord]) -> Result<RecordBatch> {
    let mut keys: Vec<&String> = vec![];
    for record in records {
        for key in record.values.keys() {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
    }

    let mut fields = base_fields();
    let mut arrays: Vec<ArrayRef> = vec![];

    let steps: Vec<Option<i64>> = records.iter().map(|r| r.step.map(|s| s as i64)).collect();
    arrays.push(Arc::new(Int64Array::from(steps)));

    let timestamps: Vec<i64> = records.iter().map(|r| r.timestamp.timestamp_micros()).collect();
    arrays.push(Arc::new(
        TimestampMicrosecondArray::from(timestamps).with_timezone_opt(Some("UTC".to_string())),
    ));

    for key in keys {
        let values: Vec<Option<f64>> = records.iter().map(|r| r.values.get(key).copied()).collect();
        fields.push(Field::new(key.as_str(), DataType::Float64, true));
        arrays.push(Arc::new(Float64Array::from(values)));
    }

    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
}

fn batch_to_rows(batch: &RecordBatch) -> Vec<HashMap<String, serde_json::Value>> {
    let schema = batch.schema();
    let n = batch.num_rows();
    let mut rows = vec![HashMap::new(); n];

    for (col_idx, field) in schema.fields().iter().enumerate() {
        let col = batch.column(col_idx);
        for (row_idx, row) in rows.iter_mut().enumerate() {
            let val = if col.is_null(row_idx) {
                serde_json::Value::Null
            } else {
                cell_to_json(col.as_ref(), field.data_type(), row_idx)
            };
            row.insert(field.name().clone(), val);
        }
    }

    rows
}

fn cell_to_json(col: &dyn Array, data_type: &DataType, idx: usize) -> serde_json::Value {
    match data_type {
        DataType::Float64 => col
            .as_any()
            .downcast_ref::<Float64Array>()
            .map(|a| a.value(idx))
            .filter(|f| f.is_finite())
            .map_or(serde_json::Value::Null, |f| serde_json::json!(f)),
        DataType::Int64 => col
            .as_any()
            .downcast_ref::<Int64Array>()
            .map_or(serde_json::Value::Null, |a| serde_json::json!(a.value(idx))),
        DataType::Timestamp(TimeUnit::Microsecond, _) => col
            .as_any()
            .downcast_ref::<TimestampMicrosecondArray>()
            .and_then(|a| DateTime::<Utc>::from_timestamp_micros(a.value(idx)))
            .map_or(serde_json::Value::Null, |dt| serde_json::json!(dt.to_rfc3339())),
        _ => serde_json::Value::Null,
    }
}
