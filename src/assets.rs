//! Local boot/disk asset catalog.
//!
//! Checksums come from `sha256sum`, the same tool the remote helper uses
//! for the host-side inventory, so both sides compare like for like.

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::FleetError;

/// Checksum every named asset present in `asset_dir`. Names without a
/// local file are left out.
pub async fn catalog<'a>(
    asset_dir: &Path,
    names: impl IntoIterator<Item = &'a str>,
) -> Result<BTreeMap<String, String>, FleetError> {
    let mut present: Vec<&str> = names
        .into_iter()
        .filter(|name| {
            let exists = asset_dir.join(name).is_file();
            if !exists {
                tracing::debug!(asset = name, dir = %asset_dir.display(), "no local copy");
            }
            exists
        })
        .collect();
    present.sort();
    present.dedup();
    if present.is_empty() {
        return Ok(BTreeMap::new());
    }

    let output = tokio::process::Command::new("sha256sum")
        .arg("--")
        .args(&present)
        .current_dir(asset_dir)
        .output()
        .await
        .map_err(|e| FleetError::ExternalCommand {
            command: "sha256sum".into(),
            message: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(FleetError::ExternalCommand {
            command: "sha256sum".into(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let sums = parse_sha256sum(&String::from_utf8_lossy(&output.stdout));
    tracing::debug!(count = sums.len(), "local assets checksummed");
    Ok(sums)
}

/// Parse `<hex>  <name>` lines; binary-mode `*name` markers are stripped.
pub fn parse_sha256sum(output: &str) -> BTreeMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let (sum, name) = line.split_once(' ')?;
            let name = name.trim_start_matches(' ').trim_start_matches('*');
            (sum.len() == 64 && !name.is_empty()).then(|| (name.to_string(), sum.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUM: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    #[test]
    fn parses_text_and_binary_mode_lines() {
        let out = format!("{SUM}  boot.iso\n{SUM} *disk.vmdk\nnot a checksum line\n");
        let sums = parse_sha256sum(&out);
        assert_eq!(sums.len(), 2);
        assert_eq!(sums["boot.iso"], SUM);
        assert_eq!(sums["disk.vmdk"], SUM);
    }

    #[tokio::test]
    async fn missing_files_are_left_out() {
        let dir = tempfile::tempdir().unwrap();
        let sums = catalog(dir.path(), ["absent.iso"]).await.unwrap();
        assert!(sums.is_empty());
    }
}
