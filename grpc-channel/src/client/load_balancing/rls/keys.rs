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

//! Builds route lookup keys from the path and headers of a request.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write;

use serde::Deserialize;
use tonic::metadata::MetadataMap;

use super::config::RlsConfigError;
use crate::metadata::is_binary_header;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct RawGrpcKeyBuilder {
    #[serde(default)]
    names: Vec<RawName>,
    #[serde(default)]
    headers: Vec<RawNameMatcher>,
    #[serde(default)]
    extra_keys: RawExtraKeys,
    #[serde(default)]
    constant_keys: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawName {
    #[serde(default)]
    service: String,
    #[serde(default)]
    method: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawNameMatcher {
    #[serde(default)]
    key: String,
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    required_match: bool,
}

#[derive(Debug, Default, Deserialize)]
struct RawExtraKeys {
    #[serde(default)]
    host: String,
    #[serde(default)]
    service: String,
    #[serde(default)]
    method: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct HeaderKey {
    key: String,
    names: Vec<String>,
}

/// Builds the key map of one group of methods.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyBuilder {
    headers: Vec<HeaderKey>,
    host_key: Option<String>,
    service_key: Option<String>,
    method_key: Option<String>,
    constant_keys: BTreeMap<String, String>,
}

impl KeyBuilder {
    fn build(&self, path: &str, metadata: &MetadataMap, host: &str) -> BTreeMap<String, String> {
        let mut keys = self.constant_keys.clone();
        for header in &self.headers {
            if let Some(value) = header.names.iter().find_map(|name| header_values(metadata, name))
            {
                keys.insert(header.key.clone(), value);
            }
        }
        if let Some(key) = &self.host_key {
            keys.insert(key.clone(), host.to_string());
        }
        let (service, method) = split_path(path);
        if let Some(key) = &self.service_key {
            keys.insert(key.clone(), service.to_string());
        }
        if let Some(key) = &self.method_key {
            keys.insert(key.clone(), method.to_string());
        }
        keys
    }
}

/// Maps methods to the key builder that applies to them.  Builders are
/// registered either for a whole service (`/service/`) or for one method
/// (`/service/method`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyBuilderMap {
    builders: HashMap<String, KeyBuilder>,
}

/// The key a route lookup is performed (and cached) under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub path: String,
    /// The canonical form of the key map.
    pub keys: String,
}

/// The result of building keys for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RlsKey {
    pub key_map: BTreeMap<String, String>,
    pub cache_key: CacheKey,
}

impl KeyBuilderMap {
    pub(super) fn parse(raw: Vec<RawGrpcKeyBuilder>) -> Result<Self, RlsConfigError> {
        let mut builders = HashMap::new();
        for (i, raw) in raw.into_iter().enumerate() {
            if raw.names.is_empty() {
                return Err(RlsConfigError::KeyBuilder(i, "no names".into()));
            }
            let mut seen_keys = HashSet::new();
            let mut check_key = |key: &str| {
                if seen_keys.insert(key.to_string()) {
                    Ok(())
                } else {
                    Err(RlsConfigError::KeyBuilder(i, format!("duplicate key {key:?}")))
                }
            };

            let mut headers = Vec::with_capacity(raw.headers.len());
            for header in raw.headers {
                if header.required_match {
                    return Err(RlsConfigError::KeyBuilder(
                        i,
                        format!("header {:?} sets requiredMatch", header.key),
                    ));
                }
                if header.key.is_empty() || header.names.is_empty() {
                    return Err(RlsConfigError::KeyBuilder(
                        i,
                        "header keys need a key and at least one name".into(),
                    ));
                }
                check_key(&header.key)?;
                headers.push(HeaderKey {
                    key: header.key,
                    names: header
                        .names
                        .into_iter()
                        .map(|n| n.to_ascii_lowercase())
                        .collect(),
                });
            }
            let mut extra_key = |key: String| -> Result<Option<String>, RlsConfigError> {
                if key.is_empty() {
                    return Ok(None);
                }
                check_key(&key)?;
                Ok(Some(key))
            };
            let host_key = extra_key(raw.extra_keys.host)?;
            let service_key = extra_key(raw.extra_keys.service)?;
            let method_key = extra_key(raw.extra_keys.method)?;
            let mut constant_keys = BTreeMap::new();
            for (key, value) in raw.constant_keys {
                if key.is_empty() {
                    return Err(RlsConfigError::KeyBuilder(i, "empty constant key".into()));
                }
                check_key(&key)?;
                constant_keys.insert(key, value);
            }

            let builder = KeyBuilder {
                headers,
                host_key,
                service_key,
                method_key,
                constant_keys,
            };
            for name in raw.names {
                if name.service.is_empty() {
                    return Err(RlsConfigError::KeyBuilder(i, "name without a service".into()));
                }
                let path = format!("/{}/{}", name.service, name.method);
                if builders.insert(path.clone(), builder.clone()).is_some() {
                    return Err(RlsConfigError::DuplicateKeyBuilder(path));
                }
            }
        }
        Ok(KeyBuilderMap { builders })
    }

    /// Builds the keys for a request to `path` (`/service/method`).  Requests
    /// matched by no builder get an empty key map.
    pub fn build(&self, path: &str, metadata: &MetadataMap, host: &str) -> RlsKey {
        let (service, _) = split_path(path);
        let builder = self
            .builders
            .get(path)
            .or_else(|| self.builders.get(&format!("/{service}/")));
        let key_map = builder
            .map(|b| b.build(path, metadata, host))
            .unwrap_or_default();
        RlsKey {
            cache_key: CacheKey {
                path: path.to_string(),
                keys: canonical(&key_map),
            },
            key_map,
        }
    }
}

fn split_path(path: &str) -> (&str, &str) {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    trimmed.split_once('/').unwrap_or((trimmed, ""))
}

// Repeated header values are joined with ",".  Binary headers never
// contribute to keys.
fn header_values(metadata: &MetadataMap, name: &str) -> Option<String> {
    if is_binary_header(name) {
        return None;
    }
    let values: Vec<&str> = metadata
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.join(","))
    }
}

fn canonical(key_map: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (i, (k, v)) in key_map.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let _ = write!(out, "{k}={v}");
    }
    out
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tonic::metadata::MetadataValue;

    use super::*;

    fn parse(value: serde_json::Value) -> Result<KeyBuilderMap, RlsConfigError> {
        KeyBuilderMap::parse(serde_json::from_value(value).unwrap())
    }

    #[test]
    fn builds_keys_from_headers_and_extra_keys() {
        let map = parse(json!([{
            "names": [{"service": "pkg.Users"}],
            "headers": [{"key": "user", "names": ["x-user-id", "x-user"]}, {"key": "bin", "names": ["x-token-bin"]}],
            "extraKeys": {"host": "h", "method": "m"},
            "constantKeys": {"const": "1"},
        }]))
        .unwrap();
        let mut md = MetadataMap::new();
        md.append("x-user", MetadataValue::from_static("a"));
        md.append("x-user", MetadataValue::from_static("b"));
        md.insert_bin("x-token-bin", MetadataValue::from_bytes(b"secret"));
        let key = map.build("/pkg.Users/Get", &md, "users.example.com");
        assert_eq!(
            key.key_map,
            BTreeMap::from([
                ("const".to_string(), "1".to_string()),
                ("h".to_string(), "users.example.com".to_string()),
                ("m".to_string(), "Get".to_string()),
                ("user".to_string(), "a,b".to_string()),
            ])
        );
        assert_eq!(key.cache_key.keys, "const=1,h=users.example.com,m=Get,user=a,b");
        assert_eq!(key.cache_key.path, "/pkg.Users/Get");
    }

    #[test]
    fn method_builders_take_precedence() {
        let map = parse(json!([
            {"names": [{"service": "s"}], "constantKeys": {"k": "service"}},
            {"names": [{"service": "s", "method": "m"}], "constantKeys": {"k": "method"}},
        ]))
        .unwrap();
        let md = MetadataMap::new();
        assert_eq!(map.build("/s/m", &md, "").key_map["k"], "method");
        assert_eq!(map.build("/s/other", &md, "").key_map["k"], "service");
        assert!(map.build("/t/m", &md, "").key_map.is_empty());
        assert_eq!(map.build("/t/m", &md, "").cache_key.keys, "");
    }

    #[test]
    fn invalid_builders() {
        assert!(parse(json!([{"names": []}])).is_err());
        assert!(parse(json!([{"names": [{"method": "m"}]}])).is_err());
        assert!(matches!(
            parse(json!([{"names": [{"service": "s"}]}, {"names": [{"service": "s"}]}])),
            Err(RlsConfigError::DuplicateKeyBuilder(_))
        ));
        assert!(parse(json!([{"names": [{"service": "s"}], "headers": [{"key": "k", "names": ["a"], "requiredMatch": true}]}])).is_err());
        assert!(parse(json!([{"names": [{"service": "s"}], "headers": [{"key": "k", "names": ["a"]}], "constantKeys": {"k": "v"}}])).is_err());
        assert!(parse(json!([{"names": [{"service": "s"}], "extraKeys": {"host": "k", "method": "k"}}])).is_err());
    }
}
