//! Report artifact writer
//!
//! Renders the aggregate rows into a workbook with a deterministic layout:
//! a header row, one row per [`AggregateRow`], and a summary footer with
//! accepted/rejected counts. The layout is built as a plain grid first so
//! it can be tested without touching the filesystem, then serialized and
//! written atomically: a temp file in the destination directory renamed
//! into place, so no partial artifact is ever observable.

use chrono::{DateTime, NaiveDate, Utc};
use rust_xlsxwriter::{Format, Workbook};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use crate::config::ReportSettings;
use crate::types::{AggregateRow, ChannelStats, ReportArtifact};

/// Stable sheet name; consumers key on it.
pub const SHEET_NAME: &str = "RAE Report";

/// Report writing failures. Fatal for the run: no artifact, status failed.
#[derive(Debug, Error)]
pub enum ReportWriteError {
    #[error("failed to render workbook: {0}")]
    Render(#[from] rust_xlsxwriter::XlsxError),

    #[error("failed to write artifact {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

// ============================================================================
// Layout
// ============================================================================

/// Statistics selectable as report columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stat {
    Sum,
    Mean,
    Min,
    Max,
}

impl Stat {
    /// Map validated config strings; unknown names were rejected at load.
    pub fn from_config(names: &[String]) -> Vec<Stat> {
        names
            .iter()
            .filter_map(|name| match name.as_str() {
                "sum" => Some(Stat::Sum),
                "mean" => Some(Stat::Mean),
                "min" => Some(Stat::Min),
                "max" => Some(Stat::Max),
                _ => None,
            })
            .collect()
    }

    fn label(self) -> &'static str {
        match self {
            Stat::Sum => "sum",
            Stat::Mean => "mean",
            Stat::Min => "min",
            Stat::Max => "max",
        }
    }

    fn pick(self, stats: &ChannelStats) -> f64 {
        match self {
            Stat::Sum => stats.sum,
            Stat::Mean => stats.mean,
            Stat::Min => stats.min,
            Stat::Max => stats.max,
        }
    }
}

/// One spreadsheet cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Text(String),
    Number(f64),
    /// Channel had no samples in the bucket; left blank, never zero
    Empty,
}

/// The full report grid, independent of the serialization format.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportLayout {
    pub header: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
    /// Label/value pairs written below the data block
    pub footer: Vec<(String, u64)>,
}

/// Build the deterministic grid: fixed identity columns, then one column
/// per (channel, statistic) over the sorted union of channels.
pub fn build_layout(
    rows: &[AggregateRow],
    accepted: u64,
    rejected: u64,
    stats: &[Stat],
) -> ReportLayout {
    let channels: BTreeSet<&str> = rows
        .iter()
        .flat_map(|row| row.channels.keys().map(String::as_str))
        .collect();

    let mut header = vec!["Well".to_string(), "Bucket Start (UTC)".to_string()];
    for channel in &channels {
        for stat in stats {
            header.push(format!("{channel} {}", stat.label()));
        }
    }

    let grid = rows
        .iter()
        .map(|row| {
            let mut cells = Vec::with_capacity(header.len());
            cells.push(Cell::Text(row.well_id.clone()));
            cells.push(Cell::Text(
                row.bucket_start.format("%Y-%m-%d %H:%M:%S").to_string(),
            ));
            for channel in &channels {
                match row.channels.get(*channel) {
                    Some(channel_stats) => {
                        for stat in stats {
                            cells.push(Cell::Number(stat.pick(channel_stats)));
                        }
                    }
                    None => cells.extend(stats.iter().map(|_| Cell::Empty)),
                }
            }
            cells
        })
        .collect();

    ReportLayout {
        header,
        rows: grid,
        footer: vec![
            ("Accepted records".to_string(), accepted),
            ("Rejected records".to_string(), rejected),
        ],
    }
}

// ============================================================================
// Serialization
// ============================================================================

/// Artifact path for a run date: `<output_dir>/<prefix> YYYY-MM-DD.xlsx`.
pub fn artifact_path(settings: &ReportSettings, date: NaiveDate) -> PathBuf {
    settings
        .output_dir
        .join(format!("{} {}.xlsx", settings.file_prefix, date.format("%Y-%m-%d")))
}

/// Write the layout to `path` atomically and describe the result.
pub fn write_report(
    layout: &ReportLayout,
    path: &Path,
    generated_at: DateTime<Utc>,
    accepted: u64,
    rejected: u64,
) -> Result<ReportArtifact, ReportWriteError> {
    let bytes = render_workbook(layout)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|source| ReportWriteError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }

    // Write-then-rename within the destination directory keeps the final
    // path either absent or complete.
    let tmp_path = path.with_extension("xlsx.tmp");
    std::fs::write(&tmp_path, &bytes).map_err(|source| ReportWriteError::Io {
        path: tmp_path.clone(),
        source,
    })?;
    if let Err(source) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(ReportWriteError::Io {
            path: path.to_path_buf(),
            source,
        });
    }

    info!(
        path = %path.display(),
        data_rows = layout.rows.len(),
        size_bytes = bytes.len(),
        "report artifact written"
    );

    Ok(ReportArtifact {
        path: path.to_path_buf(),
        size_bytes: bytes.len() as u64,
        sheet_name: SHEET_NAME.to_string(),
        data_rows: layout.rows.len(),
        accepted,
        rejected,
        generated_at,
    })
}

fn render_workbook(layout: &ReportLayout) -> Result<Vec<u8>, ReportWriteError> {
    let mut workbook = Workbook::new();
    let bold = Format::new().set_bold();

    let sheet = workbook.add_worksheet();
    sheet.set_name(SHEET_NAME)?;

    for (col, title) in layout.header.iter().enumerate() {
        sheet.write_string_with_format(0, col as u16, title, &bold)?;
    }

    for (i, row) in layout.rows.iter().enumerate() {
        let row_index = (i + 1) as u32;
        for (col, cell) in row.iter().enumerate() {
            match cell {
                Cell::Text(text) => {
                    sheet.write_string(row_index, col as u16, text)?;
                }
                Cell::Number(value) => {
                    sheet.write_number(row_index, col as u16, *value)?;
                }
                Cell::Empty => {}
            }
        }
    }

    // Footer: one blank row, then label/value pairs.
    let mut row_index = (layout.rows.len() + 2) as u32;
    for (label, value) in &layout.footer {
        sheet.write_string_with_format(row_index, 0, label, &bold)?;
        sheet.write_number(row_index, 1, *value as f64)?;
        row_index += 1;
    }

    Ok(workbook.save_to_buffer()?)
}
