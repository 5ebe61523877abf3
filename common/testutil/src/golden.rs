// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{path::Path, process::Command};

use anyhow::{bail, ensure, Result};

/// The name of the environment variable controlling whether to regenerate
/// golden data.
const REGENERATE_VAR_NAME: &str = "ZKG_REGENERATE_GOLDEN";

/// Compares contents of `output` against the committed golden data at `golden`
/// and returns an error if there is any mismatch.
///
/// # Updating golden data
///
/// Set the environment variable `ZKG_REGENERATE_GOLDEN` to a non-empty value
/// to overwrite `golden` with `output` instead of comparing them:
///
/// ```sh
/// ZKG_REGENERATE_GOLDEN=1 cargo test
/// ```
pub fn compare_with_golden_data(output: &Path, golden: &Path) -> Result<()> {
    let regenerate = !std::env::var(REGENERATE_VAR_NAME).unwrap_or_default().is_empty();

    if regenerate {
        if golden.is_dir() {
            std::fs::remove_dir_all(golden)?;
        } else if golden.is_file() {
            std::fs::remove_file(golden)?;
        } else {
            ensure!(!golden.try_exists()?, "Unknown file type");
        }
        if let Some(parent) = golden.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let status = Command::new("cp")
            .args(["--recursive", "--dereference", "--"])
            .arg(output)
            .arg(golden)
            .status()?;
        ensure!(
            status.success(),
            "Failed to update golden data: {:?}",
            status
        );
    } else {
        let status = Command::new("diff")
            .args(["-Naru", "--"])
            .arg(output)
            .arg(golden)
            .status()?;
        if !status.success() {
            bail!(
                "Found mismatch with golden data; consider regenerating with: \
                 ZKG_REGENERATE_GOLDEN=1 cargo test"
            );
        }
    }
    Ok(())
}
