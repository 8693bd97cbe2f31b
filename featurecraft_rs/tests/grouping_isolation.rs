use anyhow::Result;
use featurecraft_rs::{FeatureEngine, PanelData};
use polars::prelude::*;

const BTC_ROWS: &str = "\
BTC|2024-01-01|1704067200|105|95|100|100|1000|100000
BTC|2024-01-02|1704153600|112|99|100|110|1500|165000
BTC|2024-01-03|1704240000|111|88|110|90|750|67500
BTC|2024-01-04|1704326400|99|85|90|95|900|85500
";

const HEADER: &str = "ativo|data|ts|maximo|minimo|abertura|fechamento|volumefrom|volumeto\n";

fn engineered(raw: &str) -> Result<DataFrame> {
    let panel = PanelData::parse_str(raw, b'|')?;
    let mut engine = FeatureEngine::from_panel(panel)?;
    engine.compute_features()?;
    Ok(engine.into_frame())
}

fn btc_rows(frame: &DataFrame) -> Result<Vec<usize>> {
    let assets = frame.column("asset")?.str()?;
    Ok(assets
        .into_iter()
        .enumerate()
        .filter(|(_, v)| *v == Some("BTC"))
        .map(|(i, _)| i)
        .collect())
}

/// Inserting other assets around a group must not change a single
/// derived value inside it: windows never cross asset boundaries.
#[test]
fn other_assets_never_leak_into_a_group() -> Result<()> {
    let solo = engineered(&format!("{HEADER}{BTC_ROWS}"))?;

    // AAA sorts before BTC, ETH after; both surround the BTC block.
    let mixed_raw = format!(
        "{HEADER}\
AAA|2024-01-01|1|10|1|5|5|10|50
AAA|2024-01-02|2|20|2|6|7|20|140
{BTC_ROWS}\
ETH|2024-01-01|1|2310|2200|2250|2300|500|1150000
ETH|2024-01-02|2|2400|2250|2300|2380|650|1547000
"
    );
    let mixed = engineered(&mixed_raw)?;

    let solo_idx = btc_rows(&solo)?;
    let mixed_idx = btc_rows(&mixed)?;
    assert_eq!(solo_idx.len(), mixed_idx.len());

    for name in solo.get_column_names() {
        let solo_col = solo.column(name)?;
        if !matches!(solo_col.dtype(), DataType::Float64) {
            continue;
        }
        let solo_ca = solo_col.f64()?;
        let mixed_ca = mixed.column(name)?.f64()?;
        for (&a, &b) in solo_idx.iter().zip(mixed_idx.iter()) {
            let lhs = solo_ca.get(a);
            let rhs = mixed_ca.get(b);
            assert_eq!(lhs, rhs, "column {name} leaked across asset groups");
        }
    }
    Ok(())
}

/// The first row of every group starts from a clean window, even when
/// another asset's history directly precedes it in the table.
#[test]
fn first_row_per_group_is_null_even_mid_table() -> Result<()> {
    let raw = format!(
        "{HEADER}{BTC_ROWS}\
ETH|2024-01-01|1|2310|2200|2250|2300|500|1150000
"
    );
    let frame = engineered(&raw)?;
    let eth_first = 4; // sorted after the four BTC rows

    for name in ["close_prev", "daily_return", "log_return", "atr_14"] {
        let ca = frame.column(name)?.f64()?;
        assert!(
            ca.get(eth_first).is_none(),
            "{name} must be null on a group's first row"
        );
    }
    Ok(())
}
