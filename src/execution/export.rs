//! CSV and XLSX export of formatted result rows.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use inflector::Inflector;
use rust_xlsxwriter::{Format, Workbook, XlsxError};
use serde_json::Value;

use crate::compiler::OutputColumn;
use crate::model::ExportFormat;

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("CSV export failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("XLSX export failed: {0}")]
    Xlsx(#[from] XlsxError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Export has too many {0} for the format")]
    TooLarge(&'static str),
}

pub type ExportResult<T> = Result<T, ExportError>;

/// An exported file.
#[derive(Debug, Clone)]
pub struct ExportArtifact {
    pub filename: String,
    pub format: ExportFormat,
    pub bytes: Vec<u8>,
    /// Where the file was written, when an export directory is configured.
    pub path: Option<PathBuf>,
}

impl ExportArtifact {
    pub fn content_type(&self) -> &'static str {
        self.format.content_type()
    }
}

/// `{slug}_{YYYYMMDD_HHMMSS}.{ext}`
pub fn export_filename(report_name: &str, format: ExportFormat, at: DateTime<Utc>) -> String {
    let slug = report_name.to_snake_case();
    let slug = if slug.is_empty() { "report".to_string() } else { slug };
    format!(
        "{}_{}.{}",
        slug,
        at.format("%Y%m%d_%H%M%S"),
        format.extension()
    )
}

/// Writes exports, optionally persisting them to a directory.
#[derive(Debug, Clone, Default)]
pub struct Exporter {
    dir: Option<PathBuf>,
}

impl Exporter {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Render `rows` under the column labels, in column order.
    pub fn export(
        &self,
        report_name: &str,
        columns: &[OutputColumn],
        rows: &[Vec<Value>],
        format: ExportFormat,
        at: DateTime<Utc>,
    ) -> ExportResult<ExportArtifact> {
        let bytes = match format {
            ExportFormat::Csv => write_csv(columns, rows)?,
            ExportFormat::Xlsx => write_xlsx(columns, rows)?,
        };
        let filename = export_filename(report_name, format, at);

        let path = match &self.dir {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                let path = dir.join(&filename);
                fs::write(&path, &bytes)?;
                Some(path)
            }
            None => None,
        };

        Ok(ExportArtifact {
            filename,
            format,
            bytes,
            path,
        })
    }
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn write_csv(columns: &[OutputColumn], rows: &[Vec<Value>]) -> ExportResult<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(columns.iter().map(|c| c.label.as_str()))?;
    for row in rows {
        writer.write_record(row.iter().map(cell_text))?;
    }
    writer
        .into_inner()
        .map_err(|e| ExportError::Io(e.into_error()))
}

fn write_xlsx(columns: &[OutputColumn], rows: &[Vec<Value>]) -> ExportResult<Vec<u8>> {
    let mut workbook = Workbook::new();
    let header = Format::new().set_bold();
    let sheet = workbook.add_worksheet();

    for (col, column) in columns.iter().enumerate() {
        let col = u16::try_from(col).map_err(|_| ExportError::TooLarge("columns"))?;
        sheet.write_string_with_format(0, col, column.label.as_str(), &header)?;
    }

    for (idx, row) in rows.iter().enumerate() {
        let line = u32::try_from(idx + 1).map_err(|_| ExportError::TooLarge("rows"))?;
        for (col, value) in row.iter().enumerate() {
            let col = u16::try_from(col).map_err(|_| ExportError::TooLarge("columns"))?;
            match value {
                Value::Null => {}
                Value::Bool(b) => {
                    sheet.write_boolean(line, col, *b)?;
                }
                Value::Number(n) => match n.as_f64() {
                    Some(f) => {
                        sheet.write_number(line, col, f)?;
                    }
                    None => {
                        sheet.write_string(line, col, n.to_string())?;
                    }
                },
                other => {
                    sheet.write_string(line, col, cell_text(other))?;
                }
            }
        }
    }

    Ok(workbook.save_to_buffer()?)
}
