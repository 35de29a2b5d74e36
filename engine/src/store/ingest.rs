//! CSV ingestion
//!
//! Parses a dataset file into a `CsvTable` ready to be written by a backend:
//! the table name comes from the file name, each column gets the narrowest
//! SQLite type that fits every non-empty value, and empty fields become NULL.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::io::Read;
use std::path::Path;

/// Dataset files whose table name is not derived from the file name
const TABLE_NAME_OVERRIDES: &[(&str, &str)] =
    &[("product_category_name_translation", "product_category_translation")];

/// Storage type chosen for a CSV column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Integer,
    Real,
    Text,
}

impl ColumnKind {
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnKind::Integer => "INTEGER",
            ColumnKind::Real => "REAL",
            ColumnKind::Text => "TEXT",
        }
    }

    /// Narrowest kind that fits every non-empty value; TEXT when all are empty
    pub fn infer<'a>(values: impl IntoIterator<Item = &'a str>) -> Self {
        let mut kind = None;
        for value in values {
            let fits = if value.parse::<i64>().is_ok() {
                ColumnKind::Integer
            } else if value.parse::<f64>().is_ok() {
                ColumnKind::Real
            } else {
                return ColumnKind::Text;
            };
            kind = Some(match (kind, fits) {
                (Some(ColumnKind::Real), _) | (_, ColumnKind::Real) => ColumnKind::Real,
                _ => ColumnKind::Integer,
            });
        }
        kind.unwrap_or(ColumnKind::Text)
    }
}

/// A parsed CSV file
#[derive(Debug, Clone, PartialEq)]
pub struct CsvTable {
    pub name: String,
    pub columns: Vec<String>,
    pub kinds: Vec<ColumnKind>,
    /// Every row has exactly `columns.len()` cells; `None` is NULL
    pub rows: Vec<Vec<Option<String>>>,
}

pub fn is_csv(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"))
}

/// Table name for a dataset file
///
/// `olist_orders_dataset.csv` becomes `orders`; other names are lowercased
/// with every non-alphanumeric character replaced by `_`.
pub fn table_name_for(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    if let Some((_, name)) = TABLE_NAME_OVERRIDES.iter().find(|(file, _)| *file == stem) {
        return name.to_string();
    }

    let trimmed = stem.strip_prefix("olist_").unwrap_or(&stem);
    let trimmed = trimmed.strip_suffix("_dataset").unwrap_or(trimmed);
    let name = sanitize(trimmed);
    if name.is_empty() {
        "data".to_string()
    } else {
        name
    }
}

fn sanitize(raw: &str) -> String {
    let name: String = raw
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        format!("t_{}", name)
    } else {
        name
    }
}

/// Header names with blanks filled in and duplicates suffixed
fn column_names(headers: &csv::StringRecord) -> Vec<String> {
    let mut seen = HashSet::new();
    headers
        .iter()
        .enumerate()
        .map(|(i, header)| {
            let base = match header.trim() {
                "" => format!("column_{}", i + 1),
                name => name.to_string(),
            };
            let mut name = base.clone();
            let mut n = 2;
            while !seen.insert(name.to_lowercase()) {
                name = format!("{}_{}", base, n);
                n += 1;
            }
            name
        })
        .collect()
}

/// Parse CSV text with a header row
///
/// Short rows are padded with NULLs and extra trailing cells are dropped.
pub fn parse_csv<R: Read>(name: String, reader: R) -> Result<CsvTable> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let columns = column_names(csv_reader.headers().context("Failed to read header row")?);

    let mut rows = Vec::new();
    for (line, record) in csv_reader.records().enumerate() {
        let record = record.with_context(|| format!("Malformed record {}", line + 1))?;
        let mut row: Vec<Option<String>> = record
            .iter()
            .take(columns.len())
            .map(|field| (!field.is_empty()).then(|| field.to_string()))
            .collect();
        row.resize(columns.len(), None);
        rows.push(row);
    }

    let kinds = (0..columns.len())
        .map(|i| ColumnKind::infer(rows.iter().filter_map(|row| row[i].as_deref())))
        .collect();

    Ok(CsvTable {
        name,
        columns,
        kinds,
        rows,
    })
}
