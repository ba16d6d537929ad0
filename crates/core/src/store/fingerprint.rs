//! Request-target canonicalization and cache fingerprints.

use std::fmt;

use sha2::{Digest, Sha256};
use url::{ParseError, Url};

use crate::Error;

/// Canonicalize a URL string so that equivalent targets share one cache entry.
///
/// Normalization steps:
/// 1. Trim leading/trailing whitespace, replace inner spaces with `+`
/// 2. Default scheme to https:// if the input has none; any other scheme is rejected
/// 3. Lowercase the host
/// 4. Remove fragment (#...)
/// 5. Keep query string intact (do not reorder)
pub fn canonicalize(input: &str) -> Result<Url, Error> {
    let trimmed = input.trim().replace(' ', "+");

    if trimmed.is_empty() {
        return Err(Error::InvalidUrl("empty URL".into()));
    }

    let (url_str, parsed) = match Url::parse(&trimmed) {
        Err(ParseError::RelativeUrlWithoutBase) => {
            let with_scheme = format!("https://{trimmed}");
            let parsed = Url::parse(&with_scheme);
            (with_scheme, parsed)
        }
        parsed => (trimmed, parsed),
    };
    let mut parsed = parsed.map_err(|e| Error::InvalidUrl(format!("{url_str}: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => return Err(Error::InvalidUrl(format!("unsupported scheme: {scheme}"))),
    }

    let host = parsed
        .host_str()
        .filter(|h| !h.is_empty())
        .map(str::to_lowercase)
        .ok_or_else(|| Error::InvalidUrl(format!("missing host: {url_str}")))?;
    parsed
        .set_host(Some(&host))
        .map_err(|e| Error::InvalidUrl(e.to_string()))?;

    parsed.set_fragment(None);

    Ok(parsed)
}

/// Longest host prefix kept in a fingerprint. With the digest and the store's
/// suffixes this stays well under the usual 255-byte file name limit.
pub const MAX_HOST_PREFIX: usize = 64;

/// Filesystem-safe cache key derived from a canonical request target.
///
/// Rendered as `{host}-{sha256 hex}` so cache directories stay browsable
/// by host while the digest keeps keys collision-resistant. The host part
/// is truncated to [`MAX_HOST_PREFIX`] characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub(crate) String);

impl Fingerprint {
    /// Fingerprint an already canonical URL.
    pub fn of(url: &Url) -> Self {
        let host: String = url
            .host_str()
            .unwrap_or("err")
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .take(MAX_HOST_PREFIX)
            .collect();

        let mut hasher = Sha256::new();
        hasher.update(url.as_str().as_bytes());
        Self(format!("{host}-{}", hex::encode(hasher.finalize())))
    }

    /// Canonicalize `target` and fingerprint the result.
    pub fn parse(target: &str) -> Result<(Url, Self), Error> {
        let url = canonicalize(target)?;
        let fp = Self::of(&url);
        Ok((url, fp))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hex SHA-256 of a payload, stored next to the payload to detect torn pairs.
pub(crate) fn payload_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
