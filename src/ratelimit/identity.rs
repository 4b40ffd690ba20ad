//! Identity key derivation and per-header limit overrides.

use axum::http::{HeaderMap, HeaderName};
use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::borrow::Cow;
use std::fmt;
use std::fmt::Write as _;
use std::net::SocketAddr;

use crate::error::{RatewallError, Result};

/// Header carrying the client address set by a reverse proxy.
pub const REAL_IP_HEADER: &str = "x-real-ip";
/// Header carrying the proxy chain, client first.
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
/// Key used when a request carries no address information at all.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Where an identity key came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IdentitySource {
    /// Value of a configured override header
    Header(HeaderName),
    /// Client address from proxy headers or the peer address
    Address,
}

/// The string a request is counted against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    /// Where the key came from
    pub source: IdentitySource,
    /// The key value
    pub value: String,
}

impl IdentityKey {
    /// Key derived from an override header value.
    pub fn from_header(header: HeaderName, value: &str) -> Self {
        Self {
            source: IdentitySource::Header(header),
            value: value.to_string(),
        }
    }

    /// Key derived from the client address.
    pub fn from_address(headers: &HeaderMap, peer: Option<SocketAddr>) -> Self {
        Self {
            source: IdentitySource::Address,
            value: client_address(headers, peer),
        }
    }

    /// The key value as handed to the score store.
    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            IdentitySource::Header(name) => write!(f, "{}={}", name, self.value),
            IdentitySource::Address => write!(f, "addr={}", self.value),
        }
    }
}

/// Get a header as trimmed, non-empty text.
///
/// Values are read from their raw bytes. UTF-8 values are used as they are
/// and anything else is hex encoded, so every present value yields a key.
fn header_text<'a>(headers: &'a HeaderMap, name: &str) -> Option<Cow<'a, str>> {
    let bytes = headers.get(name)?.as_bytes();
    let text = match std::str::from_utf8(bytes) {
        Ok(text) => Cow::Borrowed(text.trim()),
        Err(_) => Cow::Owned(hex_encode(bytes.trim_ascii())),
    };
    (!text.is_empty()).then_some(text)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{:02x}", b);
        out
    })
}

/// Resolve the real client address of a request.
///
/// Priority: `X-Real-Ip`, then the first entry of `X-Forwarded-For`, then the
/// peer IP. The peer port is dropped so reconnects share a key.
pub fn client_address(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(real_ip) = header_text(headers, REAL_IP_HEADER) {
        return real_ip.into_owned();
    }

    if let Some(forwarded) = header_text(headers, FORWARDED_FOR_HEADER) {
        let client = forwarded.split(',').next().unwrap_or_default().trim();
        if !client.is_empty() {
            return client.to_string();
        }
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

/// A single header override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderLimit {
    /// Header whose value becomes the identity key
    pub header: String,
    /// Requests allowed per window for that key
    pub limit: u64,
}

/// A matched override for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderMatch<'a> {
    /// Configured header that matched
    pub header: &'a HeaderName,
    /// Trimmed header value, hex encoded when not UTF-8
    pub value: Cow<'a, str>,
    /// Requests allowed per window for this value
    pub limit: u64,
}

/// Ordered table of header name to limit.
///
/// Lookup walks the table in declaration order and the first header present
/// on the request wins. Names are case-insensitive and must be unique.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderLimits {
    entries: Vec<(HeaderName, u64)>,
}

impl HeaderLimits {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an override.
    ///
    /// Fails if the header name is invalid or already present.
    pub fn insert(&mut self, header: &str, limit: u64) -> Result<()> {
        let name = HeaderName::from_bytes(header.trim().as_bytes()).map_err(|e| {
            RatewallError::Config(format!("invalid override header '{}': {}", header, e))
        })?;

        if self.entries.iter().any(|(existing, _)| *existing == name) {
            return Err(RatewallError::Config(format!(
                "override header '{}' is configured more than once",
                name
            )));
        }

        self.entries.push((name, limit));
        Ok(())
    }

    /// Parse a JSON object of header name to limit, keeping its order.
    pub fn from_json(json: &str) -> Result<Self> {
        let map: serde_json::Map<String, serde_json::Value> = serde_json::from_str(json)
            .map_err(|e| RatewallError::Config(format!("invalid header limiter JSON: {}", e)))?;
        Self::from_entries(map.iter().map(|(k, v)| (k.as_str(), v)))
    }

    fn from_entries<'a, I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a serde_json::Value)>,
    {
        let mut limits = Self::new();
        for (header, value) in entries {
            let limit = value
                .as_u64()
                .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
                .ok_or_else(|| {
                    RatewallError::Config(format!(
                        "limit for header '{}' must be a non-negative integer, got {}",
                        header, value
                    ))
                })?;
            limits.insert(header, limit)?;
        }
        Ok(limits)
    }

    /// Number of configured overrides.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no overrides are configured.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate overrides in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&HeaderName, u64)> {
        self.entries.iter().map(|(name, limit)| (name, *limit))
    }

    /// Find the first configured header present with a non-empty value.
    pub fn find_match<'a>(&'a self, headers: &'a HeaderMap) -> Option<HeaderMatch<'a>> {
        self.entries.iter().find_map(|(name, limit)| {
            header_text(headers, name.as_str()).map(|value| HeaderMatch {
                header: name,
                value,
                limit: *limit,
            })
        })
    }
}

impl Serialize for HeaderLimits {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, limit) in &self.entries {
            map.serialize_entry(name.as_str(), limit)?;
        }
        map.end()
    }
}

/// Accepted shapes: a JSON string (as found in the environment), a list of
/// `{header, limit}` entries, or a map of header to limit.
#[derive(Deserialize)]
#[serde(untagged)]
enum HeaderLimitsRepr {
    Json(String),
    List(Vec<HeaderLimit>),
    Map(serde_json::Map<String, serde_json::Value>),
}

impl<'de> Deserialize<'de> for HeaderLimits {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let parsed = match HeaderLimitsRepr::deserialize(deserializer)? {
            HeaderLimitsRepr::Json(json) if json.trim().is_empty() => Ok(Self::new()),
            HeaderLimitsRepr::Json(json) => Self::from_json(&json),
            HeaderLimitsRepr::List(list) => {
                list.iter().try_fold(Self::new(), |mut acc, entry| -> Result<Self> {
                    acc.insert(&entry.header, entry.limit)?;
                    Ok(acc)
                })
            }
            HeaderLimitsRepr::Map(map) => {
                Self::from_entries(map.iter().map(|(k, v)| (k.as_str(), v)))
            }
        };
        parsed.map_err(D::Error::custom)
    }
}
