use chrono::{DateTime, Local, Utc};

use crate::notify::Notifier;
use crate::offload::job_directory::JobDirectory;

pub const REPORT_SUBJECT: &str = "Results offload failures";

/// strftime format for the "first failure" column.
pub const REPORT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const REPORT_RULE: &str = "=================== ======  ==============================";

/// One line of a failure report.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureRow {
    pub first_failure: DateTime<Local>,
    pub count: u32,
    pub dirname: String,
}

impl FailureRow {
    pub fn from_job(job: &JobDirectory) -> Self {
        let first = job.get_failure_time().unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        Self {
            first_failure: first.with_timezone(&Local),
            count: job.get_failure_count(),
            dirname: job.dirname().to_string(),
        }
    }
}

/// Render the report body, oldest failure first.
pub fn format_failure_report(mut rows: Vec<FailureRow>, helper_url: Option<&str>) -> String {
    rows.sort_by(|a, b| a.first_failure.cmp(&b.first_failure));

    let mut body = String::from("The offloader is failing to offload results directories.\n\n");
    if let Some(url) = helper_url {
        body.push_str(&format!("Check {} to triage the issue.\n\n", url));
    }
    body.push_str("First failure       Count   Directory name\n");
    body.push_str(REPORT_RULE);
    body.push('\n');
    for row in &rows {
        body.push_str(&format!(
            "{} {:>6}  {}\n",
            row.first_failure.format(REPORT_TIME_FORMAT),
            row.count,
            row.dirname
        ));
    }
    body.push_str(REPORT_RULE);
    body.push('\n');
    body
}

/// Send one notification listing every job in `jobs`.
pub fn report_offload_failures<'a, I>(jobs: I, notifier: &dyn Notifier, helper_url: Option<&str>)
where
    I: IntoIterator<Item = &'a JobDirectory>,
{
    let rows: Vec<FailureRow> = jobs.into_iter().map(FailureRow::from_job).collect();
    tracing::debug!(jobs = rows.len(), "Sending offload failure report");
    notifier.notify(REPORT_SUBJECT, &format_failure_report(rows, helper_url));
}
