use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

use crate::error::{DispatchError, Result};
use crate::offload::completion::CompletionService;

/// Per-test file that can ask for a test's results to be dropped.
pub const GS_OFFLOADER_INSTRUCTIONS: &str = "gs_offloader_instructions.json";
/// Key in the instructions file; `true` means delete instead of upload.
pub const GS_OFFLOADER_NO_OFFLOAD: &str = "no_offload";

/// Failed attempts tolerated before a job is worth reporting.
const TOLERATED_FAILURES: u32 = 1;

fn job_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(\d+)-.+$").expect("job name pattern is valid"))
}

/// Parse the id out of a `<digits>-<name>` directory name.
pub fn parse_job_id(dirname: &str) -> Option<u64> {
    let name = Path::new(dirname).file_name()?.to_str()?;
    job_name_pattern()
        .captures(name)
        .and_then(|c| c[1].parse().ok())
}

/// True once `age_limit_days` have passed since `finished`. An age limit of
/// zero means any finished job is expired.
pub fn is_job_expired(age_limit_days: u32, finished: DateTime<Utc>) -> bool {
    if age_limit_days == 0 {
        return true;
    }
    // An age limit beyond the calendar never expires.
    Duration::try_days(age_limit_days as i64)
        .and_then(|age| finished.checked_add_signed(age))
        .is_some_and(|deadline| Utc::now() >= deadline)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JobKind {
    /// A test job, `<results>/<id>-<owner>`.
    Regular,
    /// A per-host maintenance task, `<results>/hosts/<host>/<id>-<task>`.
    Special,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::Regular => write!(f, "regular"),
            JobKind::Special => write!(f, "special"),
        }
    }
}

impl JobKind {
    pub fn glob_pattern(&self) -> &'static str {
        match self {
            JobKind::Regular => "[0-9]*-*",
            JobKind::Special => "hosts/*/[0-9]*-*",
        }
    }

    /// Result directories of this kind under `root`, relative to `root`.
    pub fn get_job_directories(&self, root: &Path) -> Result<Vec<String>> {
        let pattern = format!(
            "{}/{}",
            glob::Pattern::escape(&root.to_string_lossy()),
            self.glob_pattern()
        );

        let mut dirs = Vec::new();
        for entry in glob::glob(&pattern)? {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    tracing::warn!(error = %e, "Unreadable entry in results directory");
                    continue;
                }
            };
            if !path.is_dir() {
                continue;
            }
            let Ok(relative) = path.strip_prefix(root) else {
                continue;
            };
            let dirname = relative.to_string_lossy().into_owned();
            if parse_job_id(&dirname).is_none() {
                tracing::debug!(dirname = %dirname, "Skipping directory without a job id");
                continue;
            }
            dirs.push(dirname);
        }
        Ok(dirs)
    }
}

/// Arguments for one offload: the directory to ship and where under the
/// destination root it goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffloadRequest {
    pub dir: PathBuf,
    pub dest: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffloadOutcome {
    /// The scheduler has not finished the job yet.
    NotFinished,
    /// Finished, but younger than the age limit.
    NotExpired,
    /// Every test asked not to be offloaded; the directory was deleted.
    NothingToOffload,
    Enqueued,
}

/// A job or special task results directory and its offload history.
///
/// A job counts as offloaded once its directory is gone; nothing else marks
/// success. Each offload attempt bumps the failure count, and the count only
/// resets by the job being dropped.
#[derive(Debug, Clone)]
pub struct JobDirectory {
    kind: JobKind,
    root: PathBuf,
    dirname: String,
    id: u64,
    offload_count: u32,
    first_offload_start: Option<DateTime<Utc>>,
}

impl JobDirectory {
    pub fn new(kind: JobKind, root: impl Into<PathBuf>, dirname: impl Into<String>) -> Result<Self> {
        let root = root.into();
        let dirname = dirname.into();
        let id = parse_job_id(&dirname)
            .ok_or_else(|| DispatchError::InvalidJobDirectory(root.join(&dirname)))?;
        Ok(Self {
            kind,
            root,
            dirname,
            id,
            offload_count: 0,
            first_offload_start: None,
        })
    }

    pub fn regular(root: impl Into<PathBuf>, dirname: impl Into<String>) -> Result<Self> {
        Self::new(JobKind::Regular, root, dirname)
    }

    pub fn special(root: impl Into<PathBuf>, dirname: impl Into<String>) -> Result<Self> {
        Self::new(JobKind::Special, root, dirname)
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Path relative to the results root, e.g. `118-fubar`.
    pub fn dirname(&self) -> &str {
        &self.dirname
    }

    pub fn path(&self) -> PathBuf {
        self.root.join(&self.dirname)
    }

    /// Parent of the directory relative to the results root; the upload
    /// destination mirrors it.
    pub fn dest(&self) -> String {
        Path::new(&self.dirname)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// When the job finished, or `None` while it is still running.
    ///
    /// A regular job finishes with its last host queue entry; a job whose
    /// entries were all aborted falls back to its creation time.
    pub async fn get_timestamp_if_finished(
        &self,
        service: &dyn CompletionService,
    ) -> Result<Option<DateTime<Utc>>> {
        match self.kind {
            JobKind::Regular => {
                let Some(job) = service.finished_job(self.id).await? else {
                    return Ok(None);
                };
                let entries = service.finished_host_queue_entries(self.id).await?;
                Ok(Some(entries.into_iter().max().unwrap_or(job.created_on)))
            }
            JobKind::Special => service.completed_special_task(self.id).await,
        }
    }

    /// Apply per-test offload instructions.
    ///
    /// Tests marked `no_offload` are deleted. Returns false when nothing is
    /// left, in which case the job directory itself has been deleted.
    pub fn process_gs_instructions(&self) -> Result<bool> {
        if self.kind == JobKind::Special {
            return Ok(true);
        }
        let path = self.path();
        let pattern = format!(
            "{}/*/{}",
            glob::Pattern::escape(&path.to_string_lossy()),
            GS_OFFLOADER_INSTRUCTIONS
        );
        for entry in glob::glob(&pattern)?.flatten() {
            let instructions: Value = serde_json::from_str(&fs::read_to_string(&entry)?)?;
            if instructions.get(GS_OFFLOADER_NO_OFFLOAD) == Some(&Value::Bool(true)) {
                if let Some(test_dir) = entry.parent() {
                    tracing::debug!(dir = %test_dir.display(), "Deleting test marked no_offload");
                    fs::remove_dir_all(test_dir)?;
                }
            }
        }

        if fs::read_dir(&path)?.next().is_none() {
            tracing::debug!(dirname = %self.dirname, "Nothing left to offload, deleting job directory");
            fs::remove_dir(&path)?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Push this job onto `queue` if it is finished and old enough.
    ///
    /// Every successful enqueue counts as an attempt; the first one records
    /// the failure time. Completion-service errors propagate and leave the
    /// job untouched.
    pub async fn enqueue_offload(
        &mut self,
        queue: &UnboundedSender<OffloadRequest>,
        age_limit_days: u32,
        service: &dyn CompletionService,
    ) -> Result<OffloadOutcome> {
        tracing::debug!(dirname = %self.dirname, "Checking job for offload");

        let Some(finished) = self.get_timestamp_if_finished(service).await? else {
            return Ok(OffloadOutcome::NotFinished);
        };
        if !is_job_expired(age_limit_days, finished) {
            return Ok(OffloadOutcome::NotExpired);
        }
        if !self.process_gs_instructions()? {
            return Ok(OffloadOutcome::NothingToOffload);
        }

        if self.offload_count == 0 {
            self.first_offload_start = Some(Utc::now());
        }
        self.offload_count += 1;
        queue
            .send(OffloadRequest {
                dir: self.path(),
                dest: self.dest(),
            })
            .map_err(|_| DispatchError::Internal("offload queue closed".to_string()))?;
        Ok(OffloadOutcome::Enqueued)
    }

    pub fn is_offloaded(&self) -> bool {
        !self.path().exists()
    }

    pub fn is_reportable(&self) -> bool {
        self.offload_count > TOLERATED_FAILURES
    }

    pub fn get_failure_count(&self) -> u32 {
        self.offload_count
    }

    pub fn get_failure_time(&self) -> Option<DateTime<Utc>> {
        self.first_offload_start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ids() {
        assert_eq!(parse_job_id("118-fubar"), Some(118));
        assert_eq!(parse_job_id("hosts/host1/118-reset"), Some(118));
        assert_eq!(parse_job_id("not-a-job"), None);
        assert_eq!(parse_job_id("118-"), None);
        assert_eq!(parse_job_id("1a-b"), None);
    }

    #[test]
    fn expiration() {
        let margin = Duration::seconds(10);
        let old = Utc::now() - Duration::days(7) - margin;
        let young = Utc::now() - Duration::days(7) + margin;
        assert!(is_job_expired(7, old));
        assert!(!is_job_expired(7, young));
        // Zero age expires even a timestamp in the future.
        assert!(is_job_expired(0, Utc::now() + margin));
        assert!(!is_job_expired(u32::MAX, Utc::now() - Duration::days(7)));
        assert!(!is_job_expired(200_000_000, Utc::now()));
    }

    #[test]
    fn fields_for_each_kind() {
        let job = JobDirectory::regular("/results", "118-fubar").unwrap();
        assert_eq!(job.id(), 118);
        assert_eq!(job.dirname(), "118-fubar");
        assert_eq!(job.dest(), "");
        assert_eq!(job.path(), PathBuf::from("/results/118-fubar"));

        let job = JobDirectory::special("/results", "hosts/host1/118-reset").unwrap();
        assert_eq!(job.id(), 118);
        assert_eq!(job.dest(), "hosts/host1");
        assert_eq!(job.kind(), JobKind::Special);
    }

    #[test]
    fn invalid_name_is_rejected() {
        assert!(matches!(
            JobDirectory::regular("/results", "not-a-job"),
            Err(DispatchError::InvalidJobDirectory(_))
        ));
    }
}
