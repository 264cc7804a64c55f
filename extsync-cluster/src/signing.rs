//! Time-bounded, optionally HMAC-signed download URLs.
//!
//! Format: `<baseUrl><archivePath>?exp=<epochSeconds>[&sig=<hex>]`, where the
//! signature is HMAC-SHA256 over every byte of the URL before `&sig=`.
//! Without a configured secret the URL is returned unsigned; validating
//! unsigned downloads is the receiving side's concern.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use extsync_core::config::{DEFAULT_HTTPS_PORT, DEFAULT_HTTP_PORT, SHARE_DIR_NAME};
use extsync_core::{Clock, ManagementServerHost, SyncConfig, SystemClock};

use crate::error::ClusterError;

type HmacSha256 = Hmac<Sha256>;

const SIG_PARAM: &str = "&sig=";

/// Builds peer-addressed download URLs for published archives.
#[derive(Clone)]
pub struct UrlSigner {
    https_enabled: bool,
    http_port: u16,
    https_port: u16,
    secret: Option<Vec<u8>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for UrlSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlSigner")
            .field("https_enabled", &self.https_enabled)
            .field("http_port", &self.http_port)
            .field("https_port", &self.https_port)
            .field("signed", &self.secret.is_some())
            .finish()
    }
}

impl Default for UrlSigner {
    fn default() -> Self {
        Self {
            https_enabled: false,
            http_port: DEFAULT_HTTP_PORT,
            https_port: DEFAULT_HTTPS_PORT,
            secret: None,
            clock: Arc::new(SystemClock),
        }
    }
}

impl UrlSigner {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            https_enabled: config.https_enabled,
            http_port: config.http_port,
            https_port: config.https_port,
            secret: config.signing_secret().map(|s| s.as_bytes().to_vec()),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_secret(mut self, secret: impl AsRef<[u8]>) -> Self {
        let secret = secret.as_ref();
        self.secret = (!secret.is_empty()).then(|| secret.to_vec());
        self
    }

    pub fn with_https(mut self, enabled: bool) -> Self {
        self.https_enabled = enabled;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// `https://<ip>:<httpsPort>` when HTTPS is enabled, else
    /// `http://<ip>:<httpPort>`. IPv6 literals are bracketed.
    pub fn base_url_for(&self, peer: &ManagementServerHost) -> String {
        let (scheme, port) = if self.https_enabled {
            ("https", self.https_port)
        } else {
            ("http", self.http_port)
        };
        let host = if peer.service_ip.contains(':') && !peer.service_ip.starts_with('[') {
            format!("[{}]", peer.service_ip)
        } else {
            peer.service_ip.clone()
        };
        format!("{scheme}://{host}:{port}")
    }

    /// Download URL for `archive_url_path` on `peer`, valid for `ttl`.
    pub fn signed_url(
        &self,
        peer: &ManagementServerHost,
        archive_url_path: &str,
        ttl: Duration,
    ) -> Result<String, ClusterError> {
        let ttl_secs = i64::try_from(ttl.as_secs())
            .map_err(|_| ClusterError::Signing(format!("ttl {ttl:?} out of range")))?;
        let expires = self.clock.now_secs().saturating_add(ttl_secs);
        let path = if archive_url_path.starts_with('/') {
            archive_url_path.to_string()
        } else {
            format!("/{archive_url_path}")
        };

        let mut url = format!("{}{path}?exp={expires}", self.base_url_for(peer));
        if let Some(secret) = &self.secret {
            let sig = hmac_hex(secret, url.as_bytes())?;
            url.push_str(SIG_PARAM);
            url.push_str(&sig);
        }
        tracing::debug!(
            peer = %peer,
            expires,
            signed = self.secret.is_some(),
            "built download URL"
        );
        Ok(url)
    }

    /// Check that `url` has not expired and, when a secret is configured,
    /// that it carries a valid signature.
    pub fn verify_signed_url(&self, url: &str) -> Result<(), ClusterError> {
        let (unsigned, sig) = match url.rfind(SIG_PARAM) {
            Some(at) => (&url[..at], Some(&url[at + SIG_PARAM.len()..])),
            None => (url, None),
        };

        let expires = unsigned
            .rsplit_once("?exp=")
            .and_then(|(_, exp)| exp.parse::<i64>().ok())
            .ok_or_else(|| ClusterError::InvalidUrl("missing or malformed exp".to_string()))?;
        if self.clock.now_secs() > expires {
            return Err(ClusterError::InvalidUrl(format!("expired at {expires}")));
        }

        let Some(secret) = &self.secret else {
            return Ok(());
        };
        let sig = sig.ok_or_else(|| ClusterError::InvalidUrl("missing signature".to_string()))?;
        let expected = hex::decode(sig)
            .map_err(|_| ClusterError::InvalidUrl("signature is not hex".to_string()))?;
        let mut mac = new_mac(secret)?;
        mac.update(unsigned.as_bytes());
        mac.verify_slice(&expected)
            .map_err(|_| ClusterError::InvalidUrl("signature mismatch".to_string()))
    }
}

/// URL path under which a published archive is served:
/// `/extensions-share/<file name>`.
pub fn share_url_path(archive: &Path) -> Result<String, ClusterError> {
    let name = archive
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            ClusterError::Signing(format!("archive path {} has no file name", archive.display()))
        })?;
    Ok(format!("/{SHARE_DIR_NAME}/{name}"))
}

fn new_mac(secret: &[u8]) -> Result<HmacSha256, ClusterError> {
    HmacSha256::new_from_slice(secret).map_err(|e| ClusterError::Signing(e.to_string()))
}

fn hmac_hex(secret: &[u8], data: &[u8]) -> Result<String, ClusterError> {
    let mut mac = new_mac(secret)?;
    mac.update(data);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use extsync_core::FixedClock;
    use rstest::rstest;

    const NOW_MILLIS: i64 = 1_690_000_000_000;

    fn peer(ip: &str) -> ManagementServerHost {
        ManagementServerHost {
            id: 1,
            uuid: "ms-1".to_string(),
            name: "ms-one".to_string(),
            service_ip: ip.to_string(),
        }
    }

    fn signer() -> UrlSigner {
        UrlSigner::default().with_clock(Arc::new(FixedClock(NOW_MILLIS)))
    }

    #[rstest]
    #[case::http(false, "10.0.0.5", "http://10.0.0.5:8080")]
    #[case::https(true, "10.0.0.5", "https://10.0.0.5:8443")]
    #[case::ipv6(false, "fd00::5", "http://[fd00::5]:8080")]
    fn base_url_follows_scheme(#[case] https: bool, #[case] ip: &str, #[case] expected: &str) {
        assert_eq!(signer().with_https(https).base_url_for(&peer(ip)), expected);
    }

    #[test]
    fn no_secret_yields_unsigned_url() {
        let url = signer()
            .signed_url(&peer("10.0.0.5"), "/extensions-share/a.tgz", Duration::from_secs(600))
            .unwrap();
        assert_eq!(url, "http://10.0.0.5:8080/extensions-share/a.tgz?exp=1690000600");
        assert!(!url.contains("sig="));
    }

    #[test]
    fn secret_yields_signed_url() {
        let url = signer()
            .with_secret("s3cret")
            .signed_url(&peer("10.0.0.5"), "extensions-share/a.tgz", Duration::from_secs(600))
            .unwrap();
        assert!(url.contains("?exp=1690000600"));
        let sig = url.split("&sig=").nth(1).expect("sig param");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn empty_secret_counts_as_unset() {
        let url = signer()
            .with_secret("")
            .signed_url(&peer("10.0.0.5"), "/x.tgz", Duration::from_secs(1))
            .unwrap();
        assert!(!url.contains("sig="));
    }

    #[test]
    fn signed_url_verifies_until_expiry() {
        let issuer = signer().with_secret("s3cret");
        let url = issuer
            .signed_url(&peer("10.0.0.5"), "/x.tgz", Duration::from_secs(600))
            .unwrap();
        assert!(issuer.verify_signed_url(&url).is_ok());

        let later = issuer.with_clock(Arc::new(FixedClock(NOW_MILLIS + 601_000)));
        let err = later.verify_signed_url(&url).unwrap_err();
        assert_eq!(err.kind(), extsync_core::ErrorKind::SecurityViolation);
    }

    #[test]
    fn tampered_url_fails_verification() {
        let issuer = signer().with_secret("s3cret");
        let url = issuer
            .signed_url(&peer("10.0.0.5"), "/x.tgz", Duration::from_secs(600))
            .unwrap();
        let tampered = url.replace("/x.tgz", "/y.tgz");
        assert!(issuer.verify_signed_url(&tampered).is_err());

        let other_secret = signer().with_secret("other");
        assert!(other_secret.verify_signed_url(&url).is_err());
    }

    #[test]
    fn share_url_path_uses_file_name() {
        let path = Path::new("/var/lib/extsync/extensions-share/demo-1.tgz");
        assert_eq!(share_url_path(path).unwrap(), "/extensions-share/demo-1.tgz");
    }
}
