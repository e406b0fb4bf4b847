/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/.
 */

//! TOML configuration of the cache daemon.
//!
//! ```toml
//! caching-mode = "req"
//! refresh-schedule = "0 0 1 * * *"
//! store-file = "/var/lib/pccs-cache/store.json"
//!
//! [upstream]
//! api-version = 4
//! api-key = "..."
//! request-timeout-secs = 60
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use cron::Schedule;
use quick_error::quick_error;
use serde::Deserialize;

use crate::policy::{CachingPolicy, Deferred, Immediate, Offline};
use crate::upstream::{PcsClientBuilder, PcsVersion, INTEL_BASE_URL};

pub const DEFAULT_REFRESH_SCHEDULE: &'static str = "0 0 1 * * *";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_ROOT_CA_CRL_URL: &'static str =
    "https://certificates.trustedservices.intel.com/IntelSGXRootCA.der";

quick_error! {
    #[derive(Debug)]
    pub enum ConfigError {
        Io(path: PathBuf, err: io::Error) {
            display("Unable to read {}: {}", path.display(), err)
        }
        Parse(err: toml::de::Error) {
            display("Unable to parse configuration: {}", err)
            from()
        }
        InvalidSchedule(schedule: String, msg: String) {
            display("Invalid refresh schedule `{}`: {}", schedule, msg)
        }
        InvalidApiVersion(version: u16) {
            display("Unsupported upstream API version {}, expected 3 or 4", version)
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CachingMode {
    /// Fetch from upstream on a miss.
    Lazy,
    /// Fetch on a miss, and queue platform registrations.
    Req,
    /// Never contact upstream.
    Offline,
}

impl Default for CachingMode {
    fn default() -> Self {
        CachingMode::Lazy
    }
}

impl CachingMode {
    pub fn policy(&self) -> Arc<dyn CachingPolicy> {
        match self {
            CachingMode::Lazy => Arc::new(Immediate),
            CachingMode::Req => Arc::new(Deferred),
            CachingMode::Offline => Arc::new(Offline),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_url")]
    pub url: String,
    #[serde(default = "default_api_version")]
    pub api_version: u16,
    pub api_key: Option<String>,
    pub retry_timeout_secs: Option<u64>,
    /// Overall timeout of a single upstream request. 0 disables it.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        UpstreamConfig {
            url: default_upstream_url(),
            api_version: default_api_version(),
            api_key: None,
            retry_timeout_secs: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl UpstreamConfig {
    pub fn pcs_version(&self) -> Result<PcsVersion, ConfigError> {
        PcsVersion::from_number(self.api_version).ok_or(ConfigError::InvalidApiVersion(self.api_version))
    }

    pub fn client_builder(&self) -> Result<PcsClientBuilder, ConfigError> {
        let mut builder = PcsClientBuilder::new(self.pcs_version()?).set_base_url(self.url.as_str());
        if let Some(api_key) = &self.api_key {
            builder = builder.set_api_key(api_key.clone());
        }
        if let Some(secs) = self.retry_timeout_secs {
            builder = builder.set_retry_timeout(Duration::from_secs(secs));
        }
        Ok(builder)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        Some(self.request_timeout_secs)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

fn default_upstream_url() -> String {
    INTEL_BASE_URL.into()
}

fn default_api_version() -> u16 {
    4
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_refresh_schedule() -> String {
    DEFAULT_REFRESH_SCHEDULE.into()
}

fn default_root_ca_crl_url() -> String {
    DEFAULT_ROOT_CA_CRL_URL.into()
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub caching_mode: CachingMode,
    /// Cron expression with a seconds field.
    #[serde(default = "default_refresh_schedule")]
    pub refresh_schedule: String,
    /// Where the store is persisted. Without it the cache lives in memory
    /// only.
    pub store_file: Option<PathBuf>,
    #[serde(default = "default_root_ca_crl_url")]
    pub root_ca_crl_url: String,
    #[serde(default)]
    pub upstream: UpstreamConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            caching_mode: CachingMode::default(),
            refresh_schedule: default_refresh_schedule(),
            store_file: None,
            root_ca_crl_url: default_root_ca_crl_url(),
            upstream: UpstreamConfig::default(),
        }
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(s)?;
        config.schedule()?;
        config.upstream.pcs_version()?;
        Ok(config)
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        content.parse()
    }

    pub fn schedule(&self) -> Result<Schedule, ConfigError> {
        Schedule::from_str(&self.refresh_schedule)
            .map_err(|e| ConfigError::InvalidSchedule(self.refresh_schedule.clone(), e.to_string()))
    }
}
