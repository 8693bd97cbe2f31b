use std::fs;

use anyhow::Result;
use featurecraft_rs::{Config, run_feature_pipeline};
use polars::prelude::*;
use tempfile::tempdir;

const RAW: &str = "\
ativo|data|ts|maximo|minimo|abertura|fechamento|volumefrom|volumeto
BTC|2024-01-01|1704067200|105|95|100|100|1000|100000
BTC|2024-01-02|1704153600|112|99|100|110|1500|165000
BTC|2024-01-03|1704240000|111|88|110|90|750|67500
ETH|2024-01-01|1704067200|2310|2200|2250|2300|500|1150000
ETH|2024-01-02|1704153600|2400|2250|2300|2380|650|1547000
";

const DERIVED_COLUMNS: [&str; 28] = [
    "close_prev",
    "open_prev",
    "volume_prev",
    "daily_return",
    "log_return",
    "cum_return",
    "close_sma_5",
    "close_sma_20",
    "open_sma_5",
    "open_sma_20",
    "volume_sma_5",
    "volume_sma_20",
    "volatility_5",
    "median_20",
    "mad_20",
    "iqr_20",
    "robust_z_20",
    "hl_log2",
    "parkinson_10",
    "atr_14",
    "pos_no_range",
    "upper_shadow",
    "lower_shadow",
    "candle_body",
    "candle_direction",
    "volume_pct_change",
    "volume_robust_z_20",
    "avg_trade_price",
    // cum_max, drawdown, day_of_week, month, close_vs_prev and
    // volume_vs_prev are asserted separately below.
];

#[test]
fn pipeline_writes_full_feature_table() -> Result<()> {
    let temp_dir = tempdir()?;
    let csv_path = temp_dir.path().join("raw.csv");
    fs::write(&csv_path, RAW)?;

    let config = Config {
        input_csv: csv_path,
        output_dir: temp_dir.path().join("out"),
        separator: b'|',
        s3_output: None,
    };
    let output = run_feature_pipeline(&config)?;

    let df = CsvReader::from_path(&output)?
        .has_header(true)
        .with_separator(b'|')
        .finish()?;
    assert_eq!(df.height(), 5, "windowing must never drop rows");
    for name in DERIVED_COLUMNS {
        assert!(df.column(name).is_ok(), "missing derived column {name}");
    }
    for name in [
        "cum_max",
        "drawdown",
        "day_of_week",
        "month",
        "close_vs_prev",
        "volume_vs_prev",
    ] {
        assert!(df.column(name).is_ok(), "missing derived column {name}");
    }

    // Retained columns survive in output order ahead of the derived ones.
    let names = df.get_column_names();
    assert_eq!(&names[..8], &[
        "asset",
        "date",
        "high",
        "low",
        "open",
        "close",
        "volume_from",
        "volume_to"
    ]);
    Ok(())
}

#[test]
fn rerunning_the_pipeline_is_byte_identical() -> Result<()> {
    let temp_dir = tempdir()?;
    let csv_path = temp_dir.path().join("raw.csv");
    fs::write(&csv_path, RAW)?;

    let config = Config {
        input_csv: csv_path,
        output_dir: temp_dir.path().join("out"),
        separator: b'|',
        s3_output: None,
    };

    let first = run_feature_pipeline(&config)?;
    let first_bytes = fs::read(&first)?;
    let second = run_feature_pipeline(&config)?;
    let second_bytes = fs::read(&second)?;

    assert_eq!(first, second);
    assert_eq!(first_bytes, second_bytes);
    Ok(())
}

#[test]
fn malformed_cells_survive_as_nulls() -> Result<()> {
    let raw = "\
ativo|data|ts|maximo|minimo|abertura|fechamento|volumefrom|volumeto
BTC|2024-01-01|1|105|95|100|100|1000|100000
BTC|bad-date|2|x|99|100|110|1500|165000
";
    let temp_dir = tempdir()?;
    let csv_path = temp_dir.path().join("raw.csv");
    fs::write(&csv_path, raw)?;

    let config = Config {
        input_csv: csv_path,
        output_dir: temp_dir.path().join("out"),
        separator: b'|',
        s3_output: None,
    };
    let output = run_feature_pipeline(&config)?;
    let df = CsvReader::from_path(&output)?
        .has_header(true)
        .with_separator(b'|')
        .finish()?;
    assert_eq!(df.height(), 2, "malformed rows degrade to nulls, never drop");

    let high = df.column("high")?.f64()?;
    assert!(high.get(1).is_none());
    let dow = df.column("day_of_week")?;
    assert!(dow.get(1)? == AnyValue::Null);
    Ok(())
}

#[test]
fn wrong_schema_is_fatal() -> Result<()> {
    let temp_dir = tempdir()?;
    let csv_path = temp_dir.path().join("raw.csv");
    fs::write(&csv_path, "a|b|c\nBTC|2024-01-01|1|2\n")?;

    let config = Config {
        input_csv: csv_path,
        output_dir: temp_dir.path().join("out"),
        separator: b'|',
        s3_output: None,
    };
    assert!(run_feature_pipeline(&config).is_err());
    Ok(())
}
