use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::drone::LOCALHOST;

/// Settings for reaching remote drones over SSH.
///
/// The helper command is what the remote side runs to execute a call batch;
/// it reads the batch on stdin and writes the response on stdout.
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Client program and any leading arguments, e.g. a wrapper script.
    pub client: Vec<String>,
    /// Remote login user. `None` uses the local ssh defaults.
    pub user: Option<String>,
    pub port: Option<u16>,
    /// Seconds ssh waits for the TCP connection before giving up.
    pub connect_timeout_secs: u64,
    /// Upper bound for one full batch round trip.
    pub call_timeout_secs: u64,
    pub helper_command: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            client: vec!["ssh".to_string()],
            user: None,
            port: None,
            connect_timeout_secs: 30,
            call_timeout_secs: 60 * 60,
            helper_command: "drone-dispatch utility".to_string(),
        }
    }
}

impl SshConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// `user@host`, or just `host` when no user is configured.
    pub fn destination(&self, hostname: &str) -> String {
        match self.user {
            Some(ref user) => format!("{}@{}", user, hostname),
            None => hostname.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DroneConfig {
    pub hostname: String,
    pub enabled: bool,
    pub max_processes: u32,
    /// Users allowed to run on this drone. `None` means anyone.
    pub allowed_users: Option<HashSet<String>>,
}

impl Default for DroneConfig {
    fn default() -> Self {
        Self {
            hostname: LOCALHOST.to_string(),
            enabled: true,
            max_processes: 1000,
            allowed_users: None,
        }
    }
}

impl DroneConfig {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            ..Default::default()
        }
    }

    pub fn with_max_processes(mut self, max_processes: u32) -> Self {
        self.max_processes = max_processes;
        self
    }

    pub fn with_allowed_user(mut self, user: impl Into<String>) -> Self {
        self.allowed_users
            .get_or_insert_with(HashSet::new)
            .insert(user.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Directory each drone prepares on first use.
    pub results_dir: PathBuf,
    pub drones: Vec<DroneConfig>,
    pub ssh: SshConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            results_dir: PathBuf::from("/usr/local/autotest/results"),
            drones: vec![DroneConfig::default()],
            ssh: SshConfig::default(),
        }
    }
}

/// Configuration for the result offloader.
#[derive(Debug, Clone)]
pub struct OffloaderConfig {
    pub results_root: PathBuf,
    pub offload_regular: bool,
    pub offload_special: bool,
    /// Number of concurrent offload workers.
    pub parallelism: usize,
    /// Minimum age in days after a job finished before it is offloaded.
    pub age_limit_days: u32,
    /// Delete results instead of uploading them.
    pub delete_only: bool,
    pub gs_uri: String,
    /// gsutil program and any leading arguments.
    pub gsutil: Vec<String>,
    pub use_rsync: bool,
    /// Pass `-m` to gsutil.
    pub multiprocessing: bool,
    pub offload_timeout_secs: u64,
    pub report_interval_secs: u64,
    pub sleep_secs: u64,
    pub max_file_count: usize,
    /// Included in failure reports so operators know where to triage.
    pub helper_url: Option<String>,
}

impl Default for OffloaderConfig {
    fn default() -> Self {
        Self {
            results_root: PathBuf::from("/usr/local/autotest/results"),
            offload_regular: true,
            offload_special: false,
            parallelism: 1,
            age_limit_days: 0,
            delete_only: false,
            gs_uri: "gs://chromeos-autotest-results/".to_string(),
            gsutil: vec!["gsutil".to_string()],
            use_rsync: true,
            multiprocessing: false,
            offload_timeout_secs: 60 * 60,
            report_interval_secs: 60 * 60,
            sleep_secs: 5,
            max_file_count: 500,
            helper_url: None,
        }
    }
}

impl OffloaderConfig {
    pub fn new(results_root: impl Into<PathBuf>) -> Self {
        Self {
            results_root: results_root.into(),
            ..Default::default()
        }
    }

    /// Offload both regular jobs and special tasks.
    pub fn all(mut self) -> Self {
        self.offload_regular = true;
        self.offload_special = true;
        self
    }

    /// Offload special tasks only.
    pub fn hosts_only(mut self) -> Self {
        self.offload_regular = false;
        self.offload_special = true;
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn with_age_limit(mut self, days: u32) -> Self {
        self.age_limit_days = days;
        self
    }

    pub fn offload_timeout(&self) -> Duration {
        Duration::from_secs(self.offload_timeout_secs)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }
}
