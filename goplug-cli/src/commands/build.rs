//! Rebuild stale plugin sources

use anyhow::{Result, bail};

use super::{manager, print_warnings};
use crate::config::Overrides;

pub async fn run(overrides: &Overrides) -> Result<()> {
    let manager = manager(overrides)?;
    let report = manager.build_plugins().await?;
    print_warnings(&manager);

    for artifact in &report.built {
        println!("built    {}", artifact.display());
    }
    for source in &report.skipped {
        println!("current  {}", source.display());
    }
    for failure in &report.failed {
        println!("failed   {failure}");
    }
    if !report.is_ok() {
        bail!("{} plugin source(s) failed to build", report.failed.len());
    }
    Ok(())
}
