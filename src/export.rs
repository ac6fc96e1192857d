use std::fmt::Write;

use serde::Serialize;

use crate::model::Interval;
use crate::time::format_timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExportFormat {
    Csv,
    Json,
}

#[derive(Serialize)]
struct ExportRow<'a> {
    id: String,
    vehicle_id: String,
    start: String,
    end: String,
    status: &'static str,
    label: Option<&'a str>,
}

impl<'a> From<&'a Interval> for ExportRow<'a> {
    fn from(r: &'a Interval) -> Self {
        Self {
            id: r.id.to_string(),
            vehicle_id: r.resource_id.to_string(),
            start: format_timestamp(r.span.start()),
            end: format_timestamp(r.span.end()),
            status: r.status.as_str(),
            label: r.label.as_deref(),
        }
    }
}

pub fn render(reservations: &[Interval], format: ExportFormat) -> Result<String, serde_json::Error> {
    match format {
        ExportFormat::Csv => Ok(to_csv(reservations)),
        ExportFormat::Json => to_json(reservations),
    }
}

pub fn to_csv(reservations: &[Interval]) -> String {
    let mut out = String::from("id,vehicle_id,start,end,status,label\r\n");
    for r in reservations {
        let row = ExportRow::from(r);
        let _ = write!(
            out,
            "{},{},{},{},{},{}\r\n",
            row.id,
            row.vehicle_id,
            row.start,
            row.end,
            row.status,
            csv_field(row.label.unwrap_or(""))
        );
    }
    out
}

pub fn to_json(reservations: &[Interval]) -> Result<String, serde_json::Error> {
    let rows: Vec<ExportRow<'_>> = reservations.iter().map(ExportRow::from).collect();
    serde_json::to_string_pretty(&rows)
}

/// Quote when the value holds a delimiter, quote or line break.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\r', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_owned()
    }
}
