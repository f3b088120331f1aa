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

//! Request matchers used by the routing policy.

use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use tonic::metadata::MetadataMap;

use super::RoutingConfigError;
use crate::client::RequestHeaders;
use crate::metadata::is_binary_header;

/// The denominator of [`CompositeMatcher`] traffic fractions.
pub const FRACTION_DENOMINATOR: u32 = 1_000_000;

/// Matches the full method path of a request.
#[derive(Debug, Clone)]
pub enum PathMatcher {
    Exact { path: String, case_insensitive: bool },
    Prefix { prefix: String, case_insensitive: bool },
    Regex(Regex),
}

impl PathMatcher {
    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathMatcher::Exact {
                path: want,
                case_insensitive,
            } => {
                if *case_insensitive {
                    want.eq_ignore_ascii_case(path)
                } else {
                    want == path
                }
            }
            PathMatcher::Prefix {
                prefix,
                case_insensitive,
            } => {
                if *case_insensitive {
                    path.len() >= prefix.len()
                        && path.is_char_boundary(prefix.len())
                        && path[..prefix.len()].eq_ignore_ascii_case(prefix)
                } else {
                    path.starts_with(prefix.as_str())
                }
            }
            PathMatcher::Regex(re) => re.is_match(path),
        }
    }
}

impl PartialEq for PathMatcher {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                PathMatcher::Exact {
                    path: a,
                    case_insensitive: ca,
                },
                PathMatcher::Exact {
                    path: b,
                    case_insensitive: cb,
                },
            )
            | (
                PathMatcher::Prefix {
                    prefix: a,
                    case_insensitive: ca,
                },
                PathMatcher::Prefix {
                    prefix: b,
                    case_insensitive: cb,
                },
            ) => a == b && ca == cb,
            (PathMatcher::Regex(a), PathMatcher::Regex(b)) => a.as_str() == b.as_str(),
            _ => false,
        }
    }
}

/// The ways a header value can be matched.
#[derive(Debug, Clone)]
pub enum HeaderMatch {
    Exact(String),
    Regex(Regex),
    Prefix(String),
    Suffix(String),
    /// Matches integer values in `[start, end)`.
    Range { start: i64, end: i64 },
    /// Matches when the header's presence equals the value.
    Present(bool),
}

impl PartialEq for HeaderMatch {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (HeaderMatch::Exact(a), HeaderMatch::Exact(b))
            | (HeaderMatch::Prefix(a), HeaderMatch::Prefix(b))
            | (HeaderMatch::Suffix(a), HeaderMatch::Suffix(b)) => a == b,
            (HeaderMatch::Regex(a), HeaderMatch::Regex(b)) => a.as_str() == b.as_str(),
            (
                HeaderMatch::Range { start: s1, end: e1 },
                HeaderMatch::Range { start: s2, end: e2 },
            ) => s1 == s2 && e1 == e2,
            (HeaderMatch::Present(a), HeaderMatch::Present(b)) => a == b,
            _ => false,
        }
    }
}

/// Matches one request header.  Binary (`-bin`) headers never match a
/// value, and are treated as absent.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderMatcher {
    pub name: String,
    pub matcher: HeaderMatch,
    pub invert: bool,
}

impl HeaderMatcher {
    pub fn matches(&self, metadata: &MetadataMap) -> bool {
        let value = header_value(metadata, &self.name);
        let matched = match (&self.matcher, value.as_deref()) {
            (HeaderMatch::Present(want), value) => value.is_some() == *want,
            (_, None) => false,
            (HeaderMatch::Exact(want), Some(value)) => value == want.as_str(),
            (HeaderMatch::Regex(re), Some(value)) => re.is_match(value),
            (HeaderMatch::Prefix(prefix), Some(value)) => value.starts_with(prefix.as_str()),
            (HeaderMatch::Suffix(suffix), Some(value)) => value.ends_with(suffix.as_str()),
            (HeaderMatch::Range { start, end }, Some(value)) => value
                .parse::<i64>()
                .is_ok_and(|v| *start <= v && v < *end),
        };
        matched != self.invert
    }
}

// Returns the values of `name` joined with ",", or None if the header is
// absent or binary.
fn header_value(metadata: &MetadataMap, name: &str) -> Option<String> {
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

/// A conjunction of a path matcher, header matchers and an optional traffic
/// fraction.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeMatcher {
    pub path: PathMatcher,
    pub headers: Vec<HeaderMatcher>,
    /// Matches this many requests out of every [`FRACTION_DENOMINATOR`].
    pub fraction: Option<u32>,
}

impl CompositeMatcher {
    pub fn matches(&self, request: &RequestHeaders) -> bool {
        if !self.path.matches(request.method_name()) {
            return false;
        }
        if !self.headers.iter().all(|h| h.matches(request.metadata())) {
            return false;
        }
        match self.fraction {
            None => true,
            Some(fraction) => fastrand::u32(0..FRACTION_DENOMINATOR) < fraction,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct RawHeaderMatcher {
    name: String,
    exact_match: Option<String>,
    regex_match: Option<String>,
    prefix_match: Option<String>,
    suffix_match: Option<String>,
    range_match: Option<RawRange>,
    present_match: Option<bool>,
    #[serde(default)]
    invert_match: bool,
}

#[derive(Debug, Deserialize)]
pub(super) struct RawRange {
    start: i64,
    end: i64,
}

/// Compiles `pattern` so that it must match the whole input.
pub(super) fn full_match_regex(
    pattern: &str,
    case_insensitive: bool,
) -> Result<Regex, RoutingConfigError> {
    RegexBuilder::new(&format!("^(?:{pattern})$"))
        .case_insensitive(case_insensitive)
        .build()
        .map_err(|err| RoutingConfigError::InvalidRegex(pattern.to_string(), err.to_string()))
}

impl TryFrom<RawHeaderMatcher> for HeaderMatcher {
    type Error = RoutingConfigError;

    fn try_from(raw: RawHeaderMatcher) -> Result<Self, Self::Error> {
        let mut kinds = Vec::new();
        if let Some(v) = raw.exact_match {
            kinds.push(HeaderMatch::Exact(v));
        }
        if let Some(v) = raw.regex_match {
            kinds.push(HeaderMatch::Regex(full_match_regex(&v, false)?));
        }
        if let Some(v) = raw.prefix_match {
            kinds.push(HeaderMatch::Prefix(v));
        }
        if let Some(v) = raw.suffix_match {
            kinds.push(HeaderMatch::Suffix(v));
        }
        if let Some(RawRange { start, end }) = raw.range_match {
            kinds.push(HeaderMatch::Range { start, end });
        }
        if let Some(v) = raw.present_match {
            kinds.push(HeaderMatch::Present(v));
        }
        if kinds.len() != 1 {
            return Err(RoutingConfigError::HeaderMatcher(raw.name));
        }
        let Some(matcher) = kinds.pop() else {
            return Err(RoutingConfigError::HeaderMatcher(raw.name));
        };
        Ok(HeaderMatcher {
            name: raw.name.to_ascii_lowercase(),
            matcher,
            invert: raw.invert_match,
        })
    }
}

#[cfg(test)]
mod tests {
    use tonic::metadata::MetadataValue;

    use super::*;

    fn metadata(pairs: &[(&'static str, &'static str)]) -> MetadataMap {
        let mut md = MetadataMap::new();
        for &(k, v) in pairs {
            md.append(k, MetadataValue::from_static(v));
        }
        md
    }

    fn header(matcher: HeaderMatch, invert: bool) -> HeaderMatcher {
        HeaderMatcher {
            name: "x-test".to_string(),
            matcher,
            invert,
        }
    }

    #[test]
    fn path_matchers() {
        let exact = PathMatcher::Exact {
            path: "/pkg.Svc/Get".to_string(),
            case_insensitive: false,
        };
        assert!(exact.matches("/pkg.Svc/Get"));
        assert!(!exact.matches("/pkg.svc/get"));

        let prefix = PathMatcher::Prefix {
            prefix: "/PKG.svc/".to_string(),
            case_insensitive: true,
        };
        assert!(prefix.matches("/pkg.Svc/Get"));
        assert!(!prefix.matches("/pkg"));

        let regex = PathMatcher::Regex(full_match_regex("/pkg\\.Svc/(Get|List)", false).unwrap());
        assert!(regex.matches("/pkg.Svc/List"));
        assert!(!regex.matches("/pkg.Svc/ListAll"));
    }

    #[test]
    fn header_matchers() {
        let md = metadata(&[("x-test", "17"), ("x-test", "abc")]);
        assert!(header(HeaderMatch::Exact("17,abc".into()), false).matches(&md));
        assert!(header(HeaderMatch::Prefix("17".into()), false).matches(&md));
        assert!(header(HeaderMatch::Suffix("bc".into()), false).matches(&md));
        assert!(header(HeaderMatch::Regex(full_match_regex("[0-9]+,a.*", false).unwrap()), false).matches(&md));
        assert!(!header(HeaderMatch::Range { start: 0, end: 100 }, false).matches(&md));
        assert!(header(HeaderMatch::Present(true), false).matches(&md));
        assert!(!header(HeaderMatch::Present(true), true).matches(&md));

        let md = metadata(&[("x-test", "17")]);
        assert!(header(HeaderMatch::Range { start: 0, end: 100 }, false).matches(&md));
        assert!(!header(HeaderMatch::Range { start: 17, end: 17 }, false).matches(&md));

        let empty = MetadataMap::new();
        assert!(!header(HeaderMatch::Exact("17".into()), false).matches(&empty));
        assert!(header(HeaderMatch::Exact("17".into()), true).matches(&empty));
        assert!(header(HeaderMatch::Present(false), false).matches(&empty));
    }

    #[test]
    fn binary_headers_are_absent() {
        let mut md = MetadataMap::new();
        md.insert_bin("x-test-bin", tonic::metadata::MetadataValue::from_bytes(b"v"));
        let matcher = HeaderMatcher {
            name: "x-test-bin".to_string(),
            matcher: HeaderMatch::Present(true),
            invert: false,
        };
        assert!(!matcher.matches(&md));
    }

    #[test]
    fn fraction_bounds() {
        let request = RequestHeaders::new().with_method_name("/a/b");
        let mut matcher = CompositeMatcher {
            path: PathMatcher::Prefix {
                prefix: "/".to_string(),
                case_insensitive: false,
            },
            headers: vec![],
            fraction: Some(0),
        };
        assert!((0..100).all(|_| !matcher.matches(&request)));
        matcher.fraction = Some(FRACTION_DENOMINATOR);
        assert!((0..100).all(|_| matcher.matches(&request)));
    }

    #[test]
    fn raw_header_matcher_needs_exactly_one_kind() {
        let raw: RawHeaderMatcher =
            serde_json::from_value(serde_json::json!({"name": "X-A", "exactMatch": "v"})).unwrap();
        let matcher = HeaderMatcher::try_from(raw).unwrap();
        assert_eq!(matcher.name, "x-a");

        let raw: RawHeaderMatcher = serde_json::from_value(
            serde_json::json!({"name": "x", "exactMatch": "v", "prefixMatch": "v"}),
        )
        .unwrap();
        assert!(HeaderMatcher::try_from(raw).is_err());
        let raw: RawHeaderMatcher =
            serde_json::from_value(serde_json::json!({"name": "x"})).unwrap();
        assert!(HeaderMatcher::try_from(raw).is_err());
    }
}
