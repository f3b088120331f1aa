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

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use url::{Position, Url};

/// Target represents a target for gRPC, as specified in:
/// https://github.com/grpc/grpc/blob/master/doc/naming.md.
/// It is parsed from the target string that gets passed during channel creation
/// by the user.  gRPC passes it to the resolver and the balancer.
///
/// Targets of the form `scheme://authority/endpoint` are split into their three
/// parts.  Anything that does not follow that form is kept whole as the
/// endpoint with an empty scheme; the channel then applies its default scheme.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Target {
    scheme: String,
    authority: String,
    endpoint: String,
}

/// The network the dialer should use for a target, as returned by
/// [`parse_dial_target`].
pub const UNIX_NETWORK: &str = "unix";

impl Target {
    pub fn new(
        scheme: impl Into<String>,
        authority: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            scheme: scheme.into(),
            authority: authority.into(),
            endpoint: endpoint.into(),
        }
    }

    /// Parses `target` the way a channel with the default dialer does:
    /// `unix:path` names a unix socket.
    pub fn parse(target: &str) -> Self {
        Self::parse_with_mode(target, false)
    }

    /// Parses `target` for a channel with a custom dialer.  `unix:path` is not
    /// treated specially and is kept whole as the endpoint, since the dialer
    /// decides how to interpret it.
    pub fn parse_with_custom_dialer(target: &str) -> Self {
        Self::parse_with_mode(target, true)
    }

    fn parse_with_mode(target: &str, skip_unix_colon_parsing: bool) -> Self {
        if target.starts_with("unix-abstract:") {
            return Self::parse_unix_abstract(target);
        }
        if target.contains("://") {
            return Self::parse_url(target).unwrap_or_else(|| Self::new("", "", target));
        }
        if !skip_unix_colon_parsing {
            if let Some(path) = target.strip_prefix("unix:") {
                return Self::new("unix", "", path);
            }
        }
        Self::new("", "", target)
    }

    // Splits `scheme://authority/endpoint`.  None when `target` is not a valid
    // URL or nothing follows its authority.
    fn parse_url(target: &str) -> Option<Self> {
        let url = Url::parse(target).ok()?;
        if !url.has_authority() {
            return None;
        }
        let authority = &url[Position::BeforeUsername..Position::AfterPort];
        let path = &url[Position::BeforePath..];
        let endpoint = path.strip_prefix('/')?;
        if url.scheme() == "unix" {
            // The unix resolver needs the absolute path.
            return Some(Self::new(url.scheme(), authority, path));
        }
        Some(Self::new(url.scheme(), authority, endpoint))
    }

    fn parse_unix_abstract(target: &str) -> Self {
        if let Some(rest) = target.strip_prefix("unix-abstract://") {
            return match rest.split_once('/') {
                Some((authority, endpoint)) => {
                    Self::new("unix-abstract", authority, format!("/{endpoint}"))
                }
                None => Self::new("unix-abstract", "", format!("//{rest}")),
            };
        }
        let endpoint = target.strip_prefix("unix-abstract:").unwrap_or_default();
        Self::new("unix-abstract", "", endpoint)
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Returns a copy of this target with `scheme` applied and the original
    /// target string as its endpoint.  Used when the parsed scheme has no
    /// registered resolver.
    pub(crate) fn with_default_scheme(original: &str, scheme: &str) -> Self {
        Self::new(scheme, "", original)
    }
}

impl FromStr for Target {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Target::parse(s))
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.scheme.is_empty() {
            return write!(f, "{}", self.endpoint);
        }
        let endpoint = self.endpoint.strip_prefix('/').unwrap_or(&self.endpoint);
        write!(f, "{}://{}/{}", self.scheme, self.authority, endpoint)
    }
}

/// Returns the network and address a dialer should use for `target`.
///
/// `unix:path`, `unix:/path` and `unix://path` name unix sockets.  Anything
/// else, including targets carrying another scheme, is dialed over tcp with
/// the whole target as the address.
pub fn parse_dial_target(target: &str) -> (&'static str, String) {
    let first_colon = target.find(':');
    let colon_slash = target.find(":/");
    if let (Some(idx), None) = (first_colon, colon_slash) {
        if &target[..idx] == UNIX_NETWORK {
            return (UNIX_NETWORK, target[idx + 1..].to_string());
        }
    }
    if colon_slash.is_some() {
        let Ok(url) = Url::parse(target) else {
            return ("tcp", target.to_string());
        };
        if url.scheme() == UNIX_NETWORK {
            let path = url.path();
            let address = if path.is_empty() {
                url.host_str().unwrap_or_default()
            } else {
                path
            };
            return (UNIX_NETWORK, address.to_string());
        }
    }
    ("tcp", target.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_default_mode() {
        let cases = [
            ("", ("", "", "")),
            ("/", ("", "", "/")),
            ("google.com", ("", "", "google.com")),
            ("google.com:443", ("", "", "google.com:443")),
            ("dns:///google.com", ("dns", "", "google.com")),
            ("dns://a.server.com/google.com", ("dns", "a.server.com", "google.com")),
            ("dns://a.server.com/google.com/?a=b", ("dns", "a.server.com", "google.com/?a=b")),
            ("/unix/socket/address", ("", "", "/unix/socket/address")),
            ("a:b", ("", "", "a:b")),
            ("a/b", ("", "", "a/b")),
            ("a:/b", ("", "", "a:/b")),
            ("a//b", ("", "", "a//b")),
            ("a://b", ("", "", "a://b")),
            ("unix:a/b/c", ("unix", "", "a/b/c")),
            ("unix:/a/b/c", ("unix", "", "/a/b/c")),
            ("unix:///a/b/c", ("unix", "", "/a/b/c")),
            ("unix://authority/a/b/c", ("unix", "authority", "/a/b/c")),
            ("unix-abstract:a/b/c", ("unix-abstract", "", "a/b/c")),
            ("unix-abstract:a b", ("unix-abstract", "", "a b")),
            ("unix-abstract:a:b", ("unix-abstract", "", "a:b")),
            ("unix-abstract:a-b", ("unix-abstract", "", "a-b")),
            ("unix-abstract:/ a///://::!@#$%^&*()b", ("unix-abstract", "", "/ a///://::!@#$%^&*()b")),
            ("unix-abstract:passthrough:abc", ("unix-abstract", "", "passthrough:abc")),
            ("unix-abstract:unix:///abc", ("unix-abstract", "", "unix:///abc")),
            ("unix-abstract:///a/b/c", ("unix-abstract", "", "/a/b/c")),
            ("unix-abstract://authority/a/b/c", ("unix-abstract", "authority", "/a/b/c")),
            ("unix-abstract://authority", ("unix-abstract", "", "//authority")),
            ("passthrough:///unix:///a/b/c", ("passthrough", "", "unix:///a/b/c")),
        ];
        for (input, (scheme, authority, endpoint)) in cases {
            let target = Target::parse(input);
            assert_eq!(
                target,
                Target::new(scheme, authority, endpoint),
                "input {input:?}"
            );
        }
    }

    #[test]
    fn invalid_scheme_keeps_the_whole_target() {
        assert_eq!(
            Target::parse("a b://host/path"),
            Target::new("", "", "a b://host/path")
        );
        assert_eq!(
            Target::parse("1dns://host/path"),
            Target::new("", "", "1dns://host/path")
        );
    }

    #[test]
    fn authority_keeps_its_port() {
        let target = Target::parse("dns://8.8.8.8:53/grpc.io/docs");
        assert_eq!(target.scheme(), "dns");
        assert_eq!(target.authority(), "8.8.8.8:53");
        assert_eq!(target.endpoint(), "grpc.io/docs");
    }

    #[test]
    fn parse_custom_dialer_mode_keeps_unix_colon() {
        assert_eq!(
            Target::parse_with_custom_dialer("unix:a/b/c"),
            Target::new("", "", "unix:a/b/c")
        );
        assert_eq!(
            Target::parse_with_custom_dialer("unix:///a/b/c"),
            Target::new("unix", "", "/a/b/c")
        );
        assert_eq!(
            Target::parse_with_custom_dialer("dns:///google.com"),
            Target::new("dns", "", "google.com")
        );
    }

    #[test]
    fn display_round_trips_scheme_targets() {
        assert_eq!(Target::parse("dns://8.8.8.8/grpc.io").to_string(), "dns://8.8.8.8/grpc.io");
        assert_eq!(Target::parse("unix:///tmp/sock").to_string(), "unix:///tmp/sock");
        assert_eq!(Target::parse("localhost:50051").to_string(), "localhost:50051");
    }

    #[test]
    fn dial_target() {
        let cases = [
            ("unix:a", ("unix", "a")),
            ("unix:a/b/c", ("unix", "a/b/c")),
            ("unix:/a", ("unix", "/a")),
            ("unix:/a/b/c", ("unix", "/a/b/c")),
            ("unix://a", ("unix", "a")),
            ("unix:///a/b/c", ("unix", "/a/b/c")),
            ("unix-abstract:a/b/c", ("tcp", "unix-abstract:a/b/c")),
            ("passthrough:///unix://domain", ("tcp", "passthrough:///unix://domain")),
            ("127.0.0.1:50051", ("tcp", "127.0.0.1:50051")),
            ("[::1]:50051", ("tcp", "[::1]:50051")),
            (":50051", ("tcp", ":50051")),
        ];
        for (input, (network, address)) in cases {
            assert_eq!(
                parse_dial_target(input),
                (network, address.to_string()),
                "input {input:?}"
            );
        }
    }
}
