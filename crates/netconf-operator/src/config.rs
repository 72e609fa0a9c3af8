// Copyright (C) 2025-present The NetGauze Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Operator configuration, read from a YAML file and overridden by
//! `NETCONF_OPERATOR_` prefixed environment variables.

use crate::{resources::Resource, sink::default_event_buffer, subscription::default_listener_buffer};
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde_with::serde_as;
use std::{path::Path, time::Duration};

pub const ENV_PREFIX: &str = "NETCONF_OPERATOR_";

const MAX_ATTEMPTS_DEFAULT: usize = 10;

pub(crate) const fn default_max_attempts() -> usize {
    MAX_ATTEMPTS_DEFAULT
}

pub(crate) const fn default_connect_timeout() -> Duration {
    Duration::from_secs(15)
}

pub(crate) const fn default_operation_timeout() -> Duration {
    Duration::from_secs(1)
}

pub(crate) const fn default_requeue_delay() -> Duration {
    Duration::from_secs(2)
}

pub(crate) const fn default_validation_requeue_delay() -> Duration {
    Duration::from_secs(60)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct OperatorConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub resources: Vec<Resource>,
}

impl OperatorConfig {
    pub fn figment(path: impl AsRef<Path>) -> Figment {
        Figment::new()
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, figment::Error> {
        Self::figment(path).extract()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RuntimeConfig {
    #[serde(skip_serializing_if = "::std::option::Option::is_none")]
    pub threads: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Timeouts and retry policy applied by the reconciler, all durations are
/// in milliseconds
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DefaultsConfig {
    /// Mount point connect timeout when the resource sets none
    #[serde(default = "default_connect_timeout")]
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub connect_timeout: Duration,

    /// Operation timeout when the resource sets none
    #[serde(default = "default_operation_timeout")]
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub operation_timeout: Duration,

    /// Timeout of the `<close-session>` sent when a mount point is deleted
    #[serde(default = "default_operation_timeout")]
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub close_timeout: Duration,

    /// Timeout of the `<kill-session>` sent after a failed close, the close
    /// timeout when not set
    #[serde(skip_serializing_if = "::std::option::Option::is_none")]
    #[serde_as(as = "Option<serde_with::DurationMilliSeconds<u64>>")]
    pub kill_timeout: Option<Duration>,

    /// Retry delay for transient failures
    #[serde(default = "default_requeue_delay")]
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub requeue_delay: Duration,

    /// Retry delay for specs that need to be corrected
    #[serde(default = "default_validation_requeue_delay")]
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub validation_requeue_delay: Duration,

    /// Attempts per resource before the bundled driver gives up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    #[serde(default = "default_listener_buffer")]
    pub listener_buffer: usize,

    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            operation_timeout: default_operation_timeout(),
            close_timeout: default_operation_timeout(),
            kill_timeout: None,
            requeue_delay: default_requeue_delay(),
            validation_requeue_delay: default_validation_requeue_delay(),
            max_attempts: default_max_attempts(),
            listener_buffer: default_listener_buffer(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl DefaultsConfig {
    pub fn kill_timeout(&self) -> Duration {
        self.kill_timeout.unwrap_or(self.close_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourceSpec;

    #[test]
    fn test_empty_config() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("operator.yaml", "{}")?;
            let config = OperatorConfig::load("operator.yaml")?;
            assert_eq!(config, OperatorConfig::default());
            assert_eq!(config.logging.level, "info");
            assert_eq!(config.defaults.kill_timeout(), Duration::from_secs(1));
            Ok(())
        });
    }

    #[test]
    fn test_config_file_and_env() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "operator.yaml",
                r#"
runtime:
  threads: 2
logging:
  level: debug
defaults:
  close_timeout: 500
  requeue_delay: 100
resources:
  - name: dev1
    kind: MountPoint
    target: 192.0.2.1:2830
    username: admin
    password: admin
  - name: sub1
    kind: EstablishSubscription
    mount_point: dev1
    xml: <establish-subscription/>
    sink:
      type: kafka
      topic: netconf
"#,
            )?;
            jail.set_env("NETCONF_OPERATOR_LOGGING__LEVEL", "trace");
            jail.set_env("NETCONF_OPERATOR_DEFAULTS__KILL_TIMEOUT", "200");
            let config = OperatorConfig::load("operator.yaml")?;
            assert_eq!(config.runtime.threads, Some(2));
            assert_eq!(config.logging.level, "trace");
            assert_eq!(config.defaults.close_timeout, Duration::from_millis(500));
            assert_eq!(config.defaults.kill_timeout(), Duration::from_millis(200));
            assert_eq!(config.defaults.requeue_delay, Duration::from_millis(100));
            assert_eq!(
                config.defaults.validation_requeue_delay,
                Duration::from_secs(60)
            );
            assert_eq!(config.resources.len(), 2);
            assert!(matches!(
                config.resources[1].spec,
                ResourceSpec::EstablishSubscription(_)
            ));
            Ok(())
        });
    }
}
