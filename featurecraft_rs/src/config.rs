use std::path::PathBuf;

use serde::{Deserialize, Serialize};

fn default_separator() -> u8 {
    b'|'
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Raw delimited panel with the fixed 9-column schema.
    pub input_csv: PathBuf,
    /// Directory receiving the feature table (and the CLI log file).
    pub output_dir: PathBuf,
    /// Field separator for both the raw input and the feature output.
    #[serde(default = "default_separator")]
    pub separator: u8,
    /// Optional S3 base URI (`s3://bucket/prefix`) to upload the dated
    /// feature artefact and its `latest` pointer to.
    #[serde(default)]
    pub s3_output: Option<String>,
}
