/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! Service config parsing: LB policy selection and per-method settings.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::client::load_balancing::{GLOBAL_LB_REGISTRY, LbPolicyBuilder, parse_lb_policy_list};

/// Errors produced while parsing a service config.
#[derive(Debug, Error)]
pub enum ServiceConfigError {
    #[error("invalid service config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid loadBalancingConfig: {0}")]
    LbConfig(String),
    #[error("unknown loadBalancingPolicy {0:?}")]
    UnknownPolicy(String),
    #[error("invalid methodConfig: {0}")]
    MethodConfig(String),
    #[error("invalid duration {0:?}")]
    Duration(String),
}

/// An in-memory representation of a service config, usually provided to gRPC as
/// a JSON object.
#[derive(Clone, Default)]
pub struct ServiceConfig {
    lb_policy: Option<Arc<dyn LbPolicyBuilder>>,
    lb_config: Option<LbConfig>,
    method_configs: HashMap<MethodName, Arc<MethodConfig>>,
}

/// Settings applied to the RPCs matched by a `methodConfig` entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodConfig {
    /// Whether RPCs wait for the channel to become ready instead of failing
    /// on transient errors, unless the call overrides it.
    pub wait_for_ready: Option<bool>,
    /// The default timeout of matched RPCs.  A shorter deadline set by the
    /// call wins.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Deserialize)]
struct MethodName {
    #[serde(default)]
    service: String,
    #[serde(default)]
    method: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServiceConfig {
    load_balancing_config: Option<serde_json::Value>,
    load_balancing_policy: Option<String>,
    #[serde(default)]
    method_config: Vec<RawMethodConfig>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMethodConfig {
    #[serde(default)]
    name: Vec<MethodName>,
    wait_for_ready: Option<bool>,
    timeout: Option<String>,
}

impl ServiceConfig {
    /// Parses a JSON service config.
    ///
    /// `loadBalancingConfig` takes precedence over the deprecated
    /// `loadBalancingPolicy`.  A config naming no supported policy is an
    /// error.
    pub fn parse(json: &str) -> Result<ServiceConfig, ServiceConfigError> {
        let raw: RawServiceConfig = serde_json::from_str(json)?;
        let mut config = ServiceConfig::default();

        if let Some(list) = &raw.load_balancing_config {
            let (builder, lb_config) =
                parse_lb_policy_list(list).map_err(ServiceConfigError::LbConfig)?;
            config.lb_policy = Some(builder);
            config.lb_config = lb_config;
        } else if let Some(name) = &raw.load_balancing_policy {
            let builder = GLOBAL_LB_REGISTRY
                .get_policy(&name.to_ascii_lowercase())
                .ok_or_else(|| ServiceConfigError::UnknownPolicy(name.clone()))?;
            config.lb_policy = Some(builder);
        }

        for entry in raw.method_config {
            let method_config = Arc::new(MethodConfig {
                wait_for_ready: entry.wait_for_ready,
                timeout: entry
                    .timeout
                    .as_deref()
                    .map(parse_duration)
                    .transpose()?,
            });
            for name in entry.name {
                if name.service.is_empty() && !name.method.is_empty() {
                    return Err(ServiceConfigError::MethodConfig(format!(
                        "method {:?} given without a service",
                        name.method
                    )));
                }
                if config.method_configs.contains_key(&name) {
                    return Err(ServiceConfigError::MethodConfig(format!(
                        "duplicate name {{service: {:?}, method: {:?}}}",
                        name.service, name.method
                    )));
                }
                config.method_configs.insert(name, method_config.clone());
            }
        }
        Ok(config)
    }

    /// Returns a config that selects `builder` with `config`.
    pub fn with_lb_policy(builder: Arc<dyn LbPolicyBuilder>, config: Option<LbConfig>) -> Self {
        ServiceConfig {
            lb_policy: Some(builder),
            lb_config: config,
            ..Default::default()
        }
    }

    /// The LB policy selected by this config, if any.
    pub fn lb_policy(&self) -> Option<&Arc<dyn LbPolicyBuilder>> {
        self.lb_policy.as_ref()
    }

    /// The parsed configuration of the selected LB policy.
    pub fn lb_config(&self) -> Option<&LbConfig> {
        self.lb_config.as_ref()
    }

    /// Returns the method config for `method` ("/service/method").  An entry
    /// naming the exact method wins over one naming only the service, which
    /// wins over the default entry.
    pub fn method_config(&self, method: &str) -> Option<&MethodConfig> {
        let path = method.strip_prefix('/').unwrap_or(method);
        let (service, method) = path.rsplit_once('/').unwrap_or((path, ""));
        let candidates = [
            MethodName {
                service: service.to_string(),
                method: method.to_string(),
            },
            MethodName {
                service: service.to_string(),
                method: String::new(),
            },
            MethodName::default(),
        ];
        candidates
            .iter()
            .find_map(|name| self.method_configs.get(name))
            .map(|config| config.as_ref())
    }
}

impl Debug for ServiceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("lb_policy", &self.lb_policy.as_ref().map(|b| b.name()))
            .field("method_configs", &self.method_configs.len())
            .finish()
    }
}

// Largest number of seconds a protobuf Duration holds (10,000 years).
const MAX_DURATION_SECS: u64 = 315_576_000_000;

/// Parses a protobuf JSON duration such as "1.5s".
pub(crate) fn parse_duration(s: &str) -> Result<Duration, ServiceConfigError> {
    let invalid = || ServiceConfigError::Duration(s.to_string());
    let number = s.strip_suffix('s').ok_or_else(invalid)?;
    let (secs, frac) = number.split_once('.').unwrap_or((number, ""));
    if secs.is_empty() || !secs.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    if frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let secs: u64 = secs.parse().map_err(|_| invalid())?;
    if secs > MAX_DURATION_SECS {
        return Err(invalid());
    }
    let nanos = if frac.is_empty() {
        0
    } else {
        let digits: u32 = frac.parse().map_err(|_| invalid())?;
        digits * 10u32.pow(9 - frac.len() as u32)
    };
    Ok(Duration::new(secs, nanos))
}

/// A convenience wrapper for an LB policy's configuration object.
#[derive(Debug, Clone)]
pub struct LbConfig {
    config: Arc<dyn Any + Send + Sync>,
}

impl LbConfig {
    /// Create a new LbConfig wrapper containing the provided config.
    pub fn new(config: impl Any + Send + Sync) -> Self {
        LbConfig {
            config: Arc::new(config),
        }
    }

    /// Convenience method to extract the LB policy's configuration object.
    pub fn convert_to<T: 'static + Send + Sync>(&self) -> Option<Arc<T>> {
        self.config.clone().downcast::<T>().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_load_balancing_config() {
        let config = ServiceConfig::parse(
            r#"{"loadBalancingConfig": [{"unknown_policy": {}}, {"round_robin": {}}]}"#,
        )
        .unwrap();
        assert_eq!(config.lb_policy().unwrap().name(), "round_robin");
    }

    #[test]
    fn load_balancing_config_wins_over_legacy_policy() {
        let config = ServiceConfig::parse(
            r#"{"loadBalancingPolicy": "ROUND_ROBIN", "loadBalancingConfig": [{"pick_first": {}}]}"#,
        )
        .unwrap();
        assert_eq!(config.lb_policy().unwrap().name(), "pick_first");

        let config = ServiceConfig::parse(r#"{"loadBalancingPolicy": "ROUND_ROBIN"}"#).unwrap();
        assert_eq!(config.lb_policy().unwrap().name(), "round_robin");
        assert!(matches!(
            ServiceConfig::parse(r#"{"loadBalancingPolicy": "nope"}"#),
            Err(ServiceConfigError::UnknownPolicy(_))
        ));
    }

    #[test]
    fn empty_config_selects_nothing() {
        let config = ServiceConfig::parse("{}").unwrap();
        assert!(config.lb_policy().is_none());
        assert!(config.method_config("/a.B/C").is_none());
        assert!(matches!(
            ServiceConfig::parse("not json"),
            Err(ServiceConfigError::Json(_))
        ));
    }

    #[test]
    fn method_config_precedence() {
        let config = ServiceConfig::parse(
            r#"{
                "methodConfig": [
                    {"name": [{}], "timeout": "10s"},
                    {"name": [{"service": "pkg.Svc"}], "waitForReady": true},
                    {"name": [{"service": "pkg.Svc", "method": "Get"}], "timeout": "0.250s"}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(
            config.method_config("/pkg.Svc/Get"),
            Some(&MethodConfig {
                wait_for_ready: None,
                timeout: Some(Duration::from_millis(250)),
            })
        );
        assert_eq!(
            config.method_config("/pkg.Svc/List"),
            Some(&MethodConfig {
                wait_for_ready: Some(true),
                timeout: None,
            })
        );
        assert_eq!(
            config.method_config("/other.Svc/Get").unwrap().timeout,
            Some(Duration::from_secs(10))
        );
    }

    #[test]
    fn method_config_validation() {
        assert!(matches!(
            ServiceConfig::parse(r#"{"methodConfig": [{"name": [{"method": "Get"}]}]}"#),
            Err(ServiceConfigError::MethodConfig(_))
        ));
        assert!(matches!(
            ServiceConfig::parse(
                r#"{"methodConfig": [{"name": [{"service": "s"}]}, {"name": [{"service": "s"}]}]}"#
            ),
            Err(ServiceConfigError::MethodConfig(_))
        ));
        assert!(matches!(
            ServiceConfig::parse(r#"{"methodConfig": [{"name": [{}], "timeout": "10"}]}"#),
            Err(ServiceConfigError::Duration(_))
        ));
        assert!(matches!(
            ServiceConfig::parse(
                r#"{"methodConfig": [{"name": [{}], "timeout": "18446744073709551615s"}]}"#
            ),
            Err(ServiceConfigError::Duration(_))
        ));
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("1s").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("0.000000001s").unwrap(), Duration::from_nanos(1));
        assert_eq!(
            parse_duration("315576000000s").unwrap(),
            Duration::from_secs(315_576_000_000)
        );
        for invalid in [
            "",
            "s",
            "1",
            "-1s",
            "1.0000000001s",
            "1.s5",
            "a1s",
            "315576000001s",
            "18446744073709551615s",
        ] {
            assert!(parse_duration(invalid).is_err(), "{invalid:?}");
        }
    }

    #[test]
    fn lb_config_downcasts() {
        let config = LbConfig::new(42u32);
        assert_eq!(*config.convert_to::<u32>().unwrap(), 42);
        assert!(config.convert_to::<String>().is_none());
    }
}
