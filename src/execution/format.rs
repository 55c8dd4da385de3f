//! Display formatting of result cells by column hint.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value;

use crate::model::ColumnFormat;

const DATE_FORMAT: &str = "%Y-%m-%d";
const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Formats cells for display and export.
#[derive(Debug, Clone)]
pub struct CellFormatter {
    currency_suffix: String,
}

impl Default for CellFormatter {
    fn default() -> Self {
        Self::new("€")
    }
}

impl CellFormatter {
    pub fn new(currency_suffix: impl Into<String>) -> Self {
        Self {
            currency_suffix: currency_suffix.into(),
        }
    }

    /// Format one cell. Null stays null; values the hint cannot read pass
    /// through unchanged.
    pub fn format(&self, value: &Value, format: ColumnFormat) -> Value {
        if value.is_null() {
            return Value::Null;
        }
        let formatted = match format {
            ColumnFormat::Text => None,
            ColumnFormat::Number => {
                as_number(value).map(|n| group_thousands(&format!("{:.2}", n)))
            }
            ColumnFormat::Currency => as_number(value).map(|n| {
                let amount = group_thousands(&format!("{:.2}", n));
                if self.currency_suffix.is_empty() {
                    amount
                } else {
                    format!("{} {}", amount, self.currency_suffix)
                }
            }),
            ColumnFormat::Percent => as_number(value).map(|n| format!("{:.2}%", n)),
            ColumnFormat::Date => as_datetime(value).map(|dt| dt.format(DATE_FORMAT).to_string()),
            ColumnFormat::DateTime => {
                as_datetime(value).map(|dt| dt.format(DATETIME_FORMAT).to_string())
            }
        };
        formatted.map_or_else(|| value.clone(), Value::String)
    }

    /// Format every row in place; `formats[i]` applies to cell `i`.
    pub fn format_rows(&self, rows: &mut [Vec<Value>], formats: &[ColumnFormat]) {
        for row in rows.iter_mut() {
            for (cell, format) in row.iter_mut().zip(formats) {
                *cell = self.format(cell, *format);
            }
        }
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

fn as_datetime(value: &Value) -> Option<NaiveDateTime> {
    let s = value.as_str()?.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    for pattern in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, pattern) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(s, DATE_FORMAT)
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Insert `,` every three digits of the integer part of a plain decimal
/// string.
fn group_thousands(plain: &str) -> String {
    let (sign, digits) = match plain.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", plain),
    };
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (digits, None),
    };

    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, c) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }

    match frac_part {
        Some(frac) => format!("{}{}.{}", sign, grouped, frac),
        None => format!("{}{}", sign, grouped),
    }
}
