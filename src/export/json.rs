use std::path::Path;

use crate::models::job::Job;
use crate::models::scan_result::ScanResult;

pub fn export_scan_result(result: &ScanResult, output_path: &Path) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(result)?;
    std::fs::write(output_path, json)?;
    Ok(())
}

/// Write queued jobs in consumption order.
pub fn export_jobs(jobs: &[Job], output_path: &Path) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(jobs)?;
    std::fs::write(output_path, json)?;
    Ok(())
}
