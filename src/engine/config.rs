//! Ambient configuration structs (SPEC_FULL.md [AMBIENT] Configuration),
//! mirroring the teacher's `infra::config`/`shared::network::http::config`
//! split between an HTTP transport config and a retry policy, flattened into
//! the CLI the way `HttpArgs`/`RetryArgs` are.

use std::time::Duration;

use clap::Args;

/// HTTP transport knobs, turned into a `reqwest::Client` by
/// [`crate::engine::http_archive::HttpArchiveClient::new`].
#[derive(Debug, Clone, Args)]
pub struct HttpConfig {
    /// Request timeout, in seconds.
    #[arg(long = "http-timeout", env = "DANDI_DL_HTTP_TIMEOUT", default_value_t = 60)]
    pub timeout_secs: u64,

    /// Maximum redirects to follow; unset uses reqwest's default.
    #[arg(long = "max-redirects", env = "DANDI_DL_MAX_REDIRECTS")]
    pub max_redirects: Option<usize>,

    /// HTTP(S) proxy URL.
    #[arg(long = "proxy", env = "DANDI_DL_PROXY")]
    pub proxy_url: Option<String>,
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            max_redirects: None,
            proxy_url: None,
        }
    }
}

/// FileDownloader's transfer-loop retry policy (spec.md §4.4 rule 4): fixed
/// at 3 attempts with a uniform-random [0, 5) second backoff. Exposed as
/// config so a caller can tighten it for tests without touching the engine.
#[derive(Debug, Clone, Copy, Args)]
pub struct RetryConfig {
    #[arg(long = "max-attempts", default_value_t = 3)]
    pub max_attempts: u32,

    #[arg(long = "retry-backoff-max-secs", default_value_t = 5.0)]
    pub backoff_max_secs: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_max_secs: 5.0,
        }
    }
}

/// The two concurrency knobs from spec.md §5.
#[derive(Debug, Clone, Copy, Args)]
pub struct JobsConfig {
    /// Worker pool size for blob downloads.
    #[arg(short = 'J', long = "jobs", default_value_t = 6)]
    pub jobs: usize,

    /// Nested worker pool size for a single Zarr asset's entries.
    #[arg(long = "jobs-per-zarr", default_value_t = 4)]
    pub jobs_per_zarr: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            jobs: 6,
            jobs_per_zarr: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        assert_eq!(JobsConfig::default().jobs, 6);
        assert_eq!(JobsConfig::default().jobs_per_zarr, 4);
        assert_eq!(RetryConfig::default().max_attempts, 3);
    }
}
