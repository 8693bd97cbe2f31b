//! Raw panel ingestion and normalization.
//!
//! The raw source is a delimited text stream with a header row and a
//! fixed 9-column positional schema:
//! `asset|date|timestamp|high|low|open|close|volume_from|volume_to`.
//! Unparsable cells degrade to nulls and never abort the run; only a
//! wrong field count is fatal, since there is no recovery heuristic
//! for an unknown schema.

use std::fs;
use std::ops::Range;
use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::{Datelike, NaiveDate};
use polars::prelude::*;
use tracing::info;

/// Positional field count of the raw schema, including the discarded
/// `timestamp` column.
pub const RAW_FIELD_COUNT: usize = 9;

/// Columns retained after normalization, in output order.
pub const RETAINED_COLUMNS: [&str; 8] = [
    "asset",
    "date",
    "high",
    "low",
    "open",
    "close",
    "volume_from",
    "volume_to",
];

/// Days-from-CE offset of the Unix epoch, used to map between chrono
/// dates and polars' days-since-epoch Date physical type.
pub const EPOCH_DAYS_FROM_CE: i32 = 719_163;

struct RawRow {
    asset: String,
    date: Option<NaiveDate>,
    // high, low, open, close, volume_from, volume_to
    numeric: [Option<f64>; 6],
}

/// A normalized panel: one row per (asset, date), sorted ascending,
/// ready for the feature engine.
#[derive(Debug)]
pub struct PanelData {
    frame: DataFrame,
}

impl PanelData {
    pub fn load(path: &Path, separator: u8) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read raw panel {}", path.display()))?;
        Self::parse_str(&contents, separator)
    }

    pub fn parse_str(contents: &str, separator: u8) -> Result<Self> {
        let sep = separator as char;
        let mut lines = contents.lines();
        if lines.next().is_none() {
            bail!("Raw panel is empty (missing header row)");
        }

        let mut rows = Vec::new();
        for (idx, line) in lines.enumerate() {
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(sep).collect();
            if fields.len() != RAW_FIELD_COUNT {
                bail!(
                    "Row {} has {} fields, expected {} (schema: asset{sep}date{sep}timestamp{sep}high{sep}low{sep}open{sep}close{sep}volume_from{sep}volume_to)",
                    idx + 2,
                    fields.len(),
                    RAW_FIELD_COUNT,
                );
            }
            // Field 2 is the raw timestamp; no feature reads it, so it is
            // dropped here.
            let numeric = [3usize, 4, 5, 6, 7, 8].map(|i| parse_float(fields[i]));
            rows.push(RawRow {
                asset: fields[0].trim().to_string(),
                date: parse_date(fields[1]),
                numeric,
            });
        }

        // Every windowed stage depends on this ordering. Null dates sort
        // last within their asset group; the sort is stable, so ties keep
        // their input order and the output stays deterministic.
        rows.sort_by(|a, b| {
            a.asset
                .cmp(&b.asset)
                .then_with(|| cmp_optional_dates(a.date, b.date))
        });

        let asset = Series::new(
            "asset",
            rows.iter().map(|r| r.asset.as_str()).collect::<Vec<_>>(),
        );
        let date = Int32Chunked::from_iter_options(
            "date",
            rows.iter()
                .map(|r| r.date.map(|d| d.num_days_from_ce() - EPOCH_DAYS_FROM_CE)),
        )
        .into_date()
        .into_series();

        let mut columns = vec![asset, date];
        for (slot, name) in ["high", "low", "open", "close", "volume_from", "volume_to"]
            .iter()
            .enumerate()
        {
            let series =
                Float64Chunked::from_iter_options(name, rows.iter().map(|r| r.numeric[slot]))
                    .into_series();
            columns.push(series);
        }

        let frame = DataFrame::new(columns).context("Failed to assemble normalized panel")?;
        info!(
            rows = frame.height(),
            assets = count_groups(&frame)?,
            "raw panel normalized"
        );
        Ok(Self { frame })
    }

    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }

    pub fn into_frame(self) -> DataFrame {
        self.frame
    }

    /// Contiguous row ranges of the asset groups in the sorted frame.
    /// Windowed computations are applied per range and never cross one.
    pub fn group_ranges(frame: &DataFrame) -> Result<Vec<Range<usize>>> {
        let assets = frame
            .column("asset")
            .context("Missing 'asset' column")?
            .str()
            .context("Failed to interpret 'asset' column as strings")?;

        let mut ranges = Vec::new();
        let mut start = 0usize;
        let mut current: Option<String> = None;
        for (i, value) in assets.into_iter().enumerate() {
            let key = value.unwrap_or("").to_string();
            match &current {
                Some(prev) if *prev == key => {}
                Some(_) => {
                    ranges.push(start..i);
                    start = i;
                    current = Some(key);
                }
                None => current = Some(key),
            }
        }
        if current.is_some() {
            ranges.push(start..assets.len());
        }
        Ok(ranges)
    }
}

fn count_groups(frame: &DataFrame) -> Result<usize> {
    Ok(PanelData::group_ranges(frame)?.len())
}

fn cmp_optional_dates(a: Option<NaiveDate>, b: Option<NaiveDate>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Some(lhs), Some(rhs)) => lhs.cmp(&rhs),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn parse_float(raw: &str) -> Option<f64> {
    match raw.trim().parse::<f64>() {
        Ok(value) if !value.is_nan() => Some(value),
        _ => None,
    }
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}
