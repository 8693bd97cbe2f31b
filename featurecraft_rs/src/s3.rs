//! Boundary collaborator for publishing feature artefacts to S3.
//!
//! The engine itself performs no I/O; this helper is handed an
//! explicit destination by the pipeline instead of living behind a
//! process-wide client. Uploads shell out to the aws CLI.

use std::path::Path;
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow, bail};
use tracing::info;

/// Parsed `s3://bucket/prefix` destination. The prefix may be empty,
/// in which case objects land at the bucket root.
#[derive(Debug, Clone)]
pub struct S3Destination {
    bucket: String,
    prefix: String,
}

impl S3Destination {
    pub fn parse(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        let rest = trimmed
            .strip_prefix("s3://")
            .ok_or_else(|| anyhow!("S3 output must start with s3:// (got '{trimmed}')"))?;
        let (bucket, prefix) = match rest.split_once('/') {
            Some((bucket, prefix)) => (bucket, prefix.trim_matches('/')),
            None => (rest, ""),
        };
        if bucket.is_empty() {
            bail!("S3 output must include a bucket name (got '{trimmed}')");
        }
        Ok(Self {
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
        })
    }

    pub fn object_uri(&self, relative: &str) -> String {
        let rel = relative.trim_start_matches('/');
        if self.prefix.is_empty() {
            format!("s3://{}/{}", self.bucket, rel)
        } else {
            format!("s3://{}/{}/{}", self.bucket, self.prefix, rel)
        }
    }

    pub fn cp(&self, local_path: &Path, relative: &str) -> Result<()> {
        let uri = self.object_uri(relative);
        let output = Command::new("aws")
            .args(["s3", "cp", "--only-show-errors"])
            .arg(local_path)
            .arg(&uri)
            .output()
            .context("Failed to spawn aws CLI (is awscli installed and on PATH?)")?;
        if !output.status.success() {
            bail!("aws s3 cp to {uri} failed ({})", describe_failure(&output));
        }
        Ok(())
    }

    /// Upload the artefact under a dated key and refresh the stable
    /// `latest` pointer alongside it.
    pub fn publish_with_latest(
        &self,
        local_path: &Path,
        dated_relative: &str,
        latest_relative: &str,
    ) -> Result<()> {
        self.cp(local_path, dated_relative)?;
        self.cp(local_path, latest_relative)?;
        info!(
            dated = %self.object_uri(dated_relative),
            latest = %self.object_uri(latest_relative),
            "feature artefact published"
        );
        Ok(())
    }
}

fn describe_failure(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let detail = if stderr.trim().is_empty() {
        String::from_utf8_lossy(&output.stdout)
    } else {
        stderr
    };
    format!("{}: {}", output.status, detail.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s3_destination_parses_and_joins() -> Result<()> {
        let dest = S3Destination::parse("s3://criptos-data/features/")?;
        assert_eq!(
            dest.object_uri("panel_features_20240101.csv"),
            "s3://criptos-data/features/panel_features_20240101.csv"
        );
        assert_eq!(
            dest.object_uri("/latest.csv"),
            "s3://criptos-data/features/latest.csv"
        );
        Ok(())
    }

    #[test]
    fn bucket_only_destination_joins_at_the_root() -> Result<()> {
        let dest = S3Destination::parse("s3://criptos-data")?;
        assert_eq!(
            dest.object_uri("features/latest.csv"),
            "s3://criptos-data/features/latest.csv"
        );
        Ok(())
    }

    #[test]
    fn s3_destination_rejects_missing_bucket() {
        assert!(S3Destination::parse("s3://").is_err());
        assert!(S3Destination::parse("s3:///features").is_err());
        assert!(S3Destination::parse("http://bucket").is_err());
    }
}
