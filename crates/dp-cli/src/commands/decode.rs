use std::path::Path;

use anyhow::{Context, Result};
use dp_core::{ColumnData, DataFrame};
use serde_json::json;

use crate::config::Settings;
use crate::util::codec;

/// Rows shown in the preview.
const PREVIEW_ROWS: usize = 5;

pub fn run(settings: &Settings, file: &Path, metadata: bool) -> Result<()> {
    let bytes =
        std::fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
    let codec = codec(settings)?;

    if metadata {
        let map = codec
            .decode_metadata(&bytes)
            .with_context(|| format!("{} is not a metadata payload", file.display()))?;
        println!("{}", serde_json::to_string_pretty(&map)?);
        return Ok(());
    }

    let frame = codec
        .decode_frame(&bytes)
        .with_context(|| format!("{} is not a dataset payload", file.display()))?;
    println!("{}", serde_json::to_string_pretty(&summary(&frame))?);
    Ok(())
}

fn summary(frame: &DataFrame) -> serde_json::Value {
    let preview = frame.head(PREVIEW_ROWS);
    let rows: Vec<Vec<String>> = (0..preview.height())
        .map(|row| preview.columns().iter().map(|c| cell(&c.data, row)).collect())
        .collect();
    let columns: Vec<_> = frame
        .columns()
        .iter()
        .map(|c| {
            json!({
                "name": c.name,
                "dtype": c.dtype().as_str(),
                "nulls": c.data.null_count(),
            })
        })
        .collect();
    json!({
        "shape": frame.shape(),
        "columns": columns,
        "preview": rows,
    })
}

fn cell(data: &ColumnData, row: usize) -> String {
    fn show<T: ToString>(values: &[Option<T>], row: usize) -> String {
        match values.get(row) {
            Some(Some(v)) => v.to_string(),
            _ => "null".to_string(),
        }
    }
    match data {
        ColumnData::Int64(v) => show(v, row),
        ColumnData::Float64(v) => show(v, row),
        ColumnData::Utf8(v) => show(v, row),
        ColumnData::Bool(v) => show(v, row),
        ColumnData::Timestamp(v) => show(v, row),
        ColumnData::Duration(v) => show(v, row),
        ColumnData::Categorical { categories, codes } => codes
            .get(row)
            .copied()
            .flatten()
            .and_then(|code| categories.get(code as usize))
            .cloned()
            .unwrap_or_else(|| "null".to_string()),
    }
}
