use vigil::{JobOptions, NewScanJob, ScanJob};

/// `n` distinct target URLs: `https://target-1.test`, `https://target-2.test`, ...
pub fn targets(n: usize) -> Vec<String> {
    (1..=n).map(target).collect()
}

/// The `idx`th target produced by [`targets`], one-based.
pub fn target(idx: usize) -> String {
    format!("https://target-{idx}.test")
}

/// Submission request for `job_id` over `n` targets.
pub fn scan_request(job_id: &str, n: usize) -> NewScanJob {
    NewScanJob::new(targets(n))
        .with_job_id(job_id)
        .with_config_name("testkit")
}

/// Definition as a worker would hold it after submission.
pub fn scan_job(job_id: &str, n: usize) -> ScanJob {
    ScanJob::new(job_id, targets(n)).with_config_name("testkit")
}

/// Request carrying an option key no worker understands.
pub fn scan_request_with_unknown_option(job_id: &str, n: usize) -> NewScanJob {
    let options: JobOptions = serde_json::from_value(serde_json::json!({
        "max_duration_secs": 120,
        "crawl_depth": 4,
    }))
    .unwrap_or_default();
    scan_request(job_id, n).with_options(options)
}
