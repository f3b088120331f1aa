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

//! Parsing and validation of the RLS LB policy config.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use super::keys::{KeyBuilderMap, RawGrpcKeyBuilder};
use crate::client::load_balancing::{LbPolicyBuilder, ParsedJsonLbConfig, parse_lb_policy_list};
use crate::client::service_config::{LbConfig, parse_duration};

/// The longest `maxAge` honored.  Longer values are capped.
pub const MAX_MAX_AGE: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_LOOKUP_SERVICE_TIMEOUT: Duration = Duration::from_secs(10);

// Substituted for the target when validating the child policy config.
const DUMMY_CHILD_TARGET: &str = "target_name_to_be_filled_in_later";

#[derive(Debug, thiserror::Error)]
pub enum RlsConfigError {
    #[error("invalid rls config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("key builder {0}: {1}")]
    KeyBuilder(usize, String),
    #[error("duplicate key builder for {0:?}")]
    DuplicateKeyBuilder(String),
    #[error("lookupService must be set")]
    MissingLookupService,
    #[error("cacheSizeBytes must be positive")]
    CacheSize,
    #[error("invalid duration for {0}: {1}")]
    Duration(&'static str, String),
    #[error("childPolicyConfigTargetFieldName must be set")]
    MissingTargetField,
    #[error("invalid childPolicy: {0}")]
    ChildPolicy(String),
}

/// What a pick does when the lookup service cannot answer for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum RequestProcessingStrategy {
    /// Wait for lookups; use the default target when a lookup fails or is
    /// throttled.
    #[default]
    #[serde(
        rename = "SYNC_LOOKUP_DEFAULT_TARGET_ON_ERROR",
        alias = "SYNC_DEFAULT_ON_ERROR"
    )]
    SyncDefaultOnError,
    /// Wait for lookups; fail the RPC when a lookup fails or is throttled.
    #[serde(
        rename = "SYNC_LOOKUP_CLIENT_SEES_ERROR",
        alias = "SYNC_CLIENT_SEES_ERROR"
    )]
    SyncClientSeesError,
    /// Never wait: use the default target until a lookup completes.
    #[serde(
        rename = "ASYNC_LOOKUP_DEFAULT_TARGET_ON_MISS",
        alias = "ASYNC_DEFAULT_ON_MISS"
    )]
    AsyncDefaultOnMiss,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRlsConfig {
    route_lookup_config: RawRouteLookupConfig,
    child_policy: serde_json::Value,
    #[serde(default)]
    child_policy_config_target_field_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRouteLookupConfig {
    #[serde(default)]
    grpc_keybuilders: Vec<RawGrpcKeyBuilder>,
    #[serde(default)]
    lookup_service: String,
    lookup_service_timeout: Option<String>,
    max_age: Option<String>,
    stale_age: Option<String>,
    // int64 values may be encoded as JSON strings.
    cache_size_bytes: Option<serde_json::Value>,
    #[serde(default)]
    default_target: String,
    #[serde(default)]
    request_processing_strategy: RequestProcessingStrategy,
}

/// A validated RLS config.
#[derive(Clone)]
pub struct RlsConfig {
    pub key_builders: KeyBuilderMap,
    pub lookup_service: String,
    pub lookup_service_timeout: Duration,
    pub max_age: Duration,
    pub stale_age: Duration,
    pub cache_size_bytes: usize,
    pub default_target: Option<String>,
    pub strategy: RequestProcessingStrategy,
    pub child_policy: Arc<dyn LbPolicyBuilder>,
    child_policy_config: serde_json::Value,
    child_policy_target_field: String,
}

impl std::fmt::Debug for RlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RlsConfig")
            .field("lookup_service", &self.lookup_service)
            .field("max_age", &self.max_age)
            .field("stale_age", &self.stale_age)
            .field("cache_size_bytes", &self.cache_size_bytes)
            .field("default_target", &self.default_target)
            .field("strategy", &self.strategy)
            .field("child_policy", &self.child_policy.name())
            .finish()
    }
}

fn duration(field: &'static str, value: Option<String>) -> Result<Option<Duration>, RlsConfigError> {
    value
        .map(|v| parse_duration(&v).map_err(|e| RlsConfigError::Duration(field, e.to_string())))
        .transpose()
}

impl RlsConfig {
    pub fn parse(value: serde_json::Value) -> Result<Self, RlsConfigError> {
        let raw: RawRlsConfig = serde_json::from_value(value)?;
        let lookup = raw.route_lookup_config;
        let key_builders = KeyBuilderMap::parse(lookup.grpc_keybuilders)?;

        if lookup.lookup_service.is_empty() {
            return Err(RlsConfigError::MissingLookupService);
        }
        let lookup_service_timeout = duration("lookupServiceTimeout", lookup.lookup_service_timeout)?
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_LOOKUP_SERVICE_TIMEOUT);
        let max_age = duration("maxAge", lookup.max_age)?;
        let stale_age = duration("staleAge", lookup.stale_age)?;
        let (max_age, stale_age) = match (max_age, stale_age) {
            (None, None) => (MAX_MAX_AGE, MAX_MAX_AGE),
            (Some(max), None) => (max.min(MAX_MAX_AGE), max.min(MAX_MAX_AGE)),
            (None, Some(stale)) => (MAX_MAX_AGE, stale.min(MAX_MAX_AGE)),
            (Some(max), Some(stale)) => {
                let max = max.min(MAX_MAX_AGE);
                (max, stale.min(max))
            }
        };

        let cache_size_bytes = match lookup.cache_size_bytes {
            Some(serde_json::Value::Number(n)) => n.as_i64(),
            Some(serde_json::Value::String(s)) => s.parse::<i64>().ok(),
            _ => None,
        }
        .filter(|n| *n > 0)
        .and_then(|n| usize::try_from(n).ok())
        .ok_or(RlsConfigError::CacheSize)?;

        if raw.child_policy_config_target_field_name.is_empty() {
            return Err(RlsConfigError::MissingTargetField);
        }
        let (child_policy, _) =
            parse_lb_policy_list(&raw.child_policy).map_err(RlsConfigError::ChildPolicy)?;
        let child_policy_config = raw
            .child_policy
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|entry| entry.as_object())
            .find_map(|entry| entry.get(child_policy.name()))
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}));
        if !child_policy_config.is_object() {
            return Err(RlsConfigError::ChildPolicy(
                "child policy config must be an object".into(),
            ));
        }

        let default_target = Some(lookup.default_target).filter(|t| !t.is_empty());
        let config = RlsConfig {
            key_builders,
            lookup_service: lookup.lookup_service,
            lookup_service_timeout,
            max_age,
            stale_age,
            cache_size_bytes,
            default_target,
            strategy: lookup.request_processing_strategy,
            child_policy,
            child_policy_config,
            child_policy_target_field: raw.child_policy_config_target_field_name,
        };
        let check_target = config.default_target.as_deref().unwrap_or(DUMMY_CHILD_TARGET);
        config
            .child_config(check_target)
            .map_err(RlsConfigError::ChildPolicy)?;
        Ok(config)
    }

    /// Returns the child policy config for `target`, with the target field
    /// filled in.
    pub fn child_config(&self, target: &str) -> Result<Option<LbConfig>, String> {
        let mut value = self.child_policy_config.clone();
        if let Some(object) = value.as_object_mut() {
            object.insert(
                self.child_policy_target_field.clone(),
                serde_json::Value::String(target.to_string()),
            );
        }
        self.child_policy
            .parse_config(&ParsedJsonLbConfig::new(value))
            .map_err(|e| e.to_string())
    }
}
