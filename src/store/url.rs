//! Counter store connection strings.

use url::Url;

use crate::error::{QuotaError, Result};

const PLAIN_SCHEME: &str = "redis";
const TLS_SCHEME: &str = "rediss";
const SOCKET_SCHEMES: [&str; 2] = ["redis+unix", "unix"];

/// Validate a store URL and upgrade it to TLS where required.
///
/// A `redis://` URL becomes `rediss://` when `require_tls` is set or its host
/// belongs to one of `tls_host_suffixes` (managed services that only accept
/// TLS). `rediss://` and unix socket URLs pass through unchanged.
pub fn normalize_store_url(
    raw: &str,
    require_tls: bool,
    tls_host_suffixes: &[String],
) -> Result<String> {
    let mut url = Url::parse(raw.trim())
        .map_err(|e| QuotaError::Config(format!("invalid store url: {}", e)))?;

    match url.scheme() {
        TLS_SCHEME => return Ok(url.to_string()),
        scheme if SOCKET_SCHEMES.contains(&scheme) => return Ok(url.to_string()),
        PLAIN_SCHEME => {}
        other => {
            return Err(QuotaError::Config(format!(
                "unsupported store url scheme '{}'",
                other
            )))
        }
    }

    let host = url
        .host_str()
        .ok_or_else(|| QuotaError::Config("store url has no host".to_string()))?
        .to_ascii_lowercase();

    if require_tls || is_tls_only_host(&host, tls_host_suffixes) {
        url.set_scheme(TLS_SCHEME)
            .map_err(|_| QuotaError::Config("cannot upgrade store url to TLS".to_string()))?;
    }

    Ok(url.to_string())
}

fn is_tls_only_host(host: &str, suffixes: &[String]) -> bool {
    suffixes.iter().any(|suffix| {
        let suffix = suffix.trim_start_matches('.').to_ascii_lowercase();
        !suffix.is_empty() && (host == suffix || host.ends_with(&format!(".{}", suffix)))
    })
}

/// Render a store URL for logs with any password masked.
pub fn redact(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("***"));
            }
            url.to_string()
        }
        Err(_) => "<invalid url>".to_string(),
    }
}
