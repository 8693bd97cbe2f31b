use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use featurecraft_rs::Config;

#[derive(Parser, Debug)]
#[command(
    name = "featurecraft",
    about = "Panel OHLCV feature derivation engine"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Derive the full feature table from a raw OHLCV panel
    #[command(name = "engineer")]
    Engineer(EngineerArgs),
}

#[derive(Parser, Debug)]
pub struct EngineerArgs {
    /// Path to the raw delimited panel (asset|date|timestamp|high|low|open|close|volume_from|volume_to)
    #[arg(long = "csv", value_name = "FILE", value_hint = clap::ValueHint::FilePath)]
    pub csv_path: PathBuf,

    /// Output directory for the feature table and log file
    #[arg(long = "output-dir", value_hint = clap::ValueHint::DirPath)]
    pub output_dir: PathBuf,

    /// Field separator used by both the raw input and the output
    #[arg(long, default_value = "|")]
    pub separator: char,

    /// Optional S3 base URI to publish the artefact to (e.g. s3://bucket/prefix)
    #[arg(long = "s3-output", value_name = "S3_URI")]
    pub s3_output: Option<String>,

    /// Disable the on-disk log file under the output directory
    #[arg(long = "no-file-log", default_value_t = false)]
    pub no_file_log: bool,
}

impl EngineerArgs {
    pub fn into_config(self) -> Result<Config> {
        if !self.separator.is_ascii() {
            bail!("Separator must be a single ASCII character");
        }
        Ok(Config {
            input_csv: self.csv_path,
            output_dir: self.output_dir,
            separator: self.separator as u8,
            s3_output: self.s3_output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn engineer_args_map_onto_config() -> Result<()> {
        let cli = Cli::parse_from([
            "featurecraft",
            "engineer",
            "--csv",
            "raw.csv",
            "--output-dir",
            "out",
            "--s3-output",
            "s3://criptos-data",
        ]);
        let Commands::Engineer(args) = cli.command;
        let config = args.into_config()?;
        assert_eq!(config.separator, b'|');
        assert_eq!(config.s3_output.as_deref(), Some("s3://criptos-data"));
        Ok(())
    }
}
