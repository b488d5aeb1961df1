//! URL helpers.

use url::Url;

use crate::{Error, Result};

/// Schemes the transfer engine can fetch.
pub const SUPPORTED_SCHEMES: &[&str] = &["http", "https", "ftp", "ftps", "sftp"];

/// Parse and validate a download URL.
///
/// The URL must be absolute, use a supported scheme and name a host.
pub fn validate_download_url(input: &str) -> Result<Url> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(Error::invalid_input("URL is empty"));
    }

    let url = Url::parse(trimmed)
        .map_err(|e| Error::invalid_input(format!("invalid URL '{trimmed}': {e}")))?;

    if !SUPPORTED_SCHEMES.contains(&url.scheme()) {
        return Err(Error::invalid_input(format!(
            "unsupported URL scheme '{}'",
            url.scheme()
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(Error::invalid_input(format!("URL '{trimmed}' has no host")));
    }

    Ok(url)
}

/// Last non-empty path segment of a URL, if any.
pub fn file_name_from_url(url: &Url) -> Option<String> {
    url.path_segments()?
        .rev()
        .find(|segment| !segment.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_supported_schemes() {
        for url in [
            "https://example.com/file.zip",
            "http://example.com:8080/a/b?x=1",
            "ftp://mirror.example.org/pub/file.iso",
            "sftp://user@host.example/file",
        ] {
            assert!(validate_download_url(url).is_ok(), "{url}");
        }
    }

    #[test]
    fn rejects_malformed_urls() {
        for url in [
            "",
            "   ",
            "example.com/file",
            "/local/path",
            "file:///etc/passwd",
            "mailto:someone@example.com",
            "https://",
        ] {
            let err = validate_download_url(url).unwrap_err();
            assert!(matches!(err, Error::InvalidInput(_)), "{url}: {err}");
        }
    }

    #[test]
    fn extracts_file_name() {
        let url = Url::parse("https://example.com/dir/archive.tar.gz?token=1").unwrap();
        assert_eq!(file_name_from_url(&url), Some("archive.tar.gz".to_string()));

        let url = Url::parse("https://example.com/dir/").unwrap();
        assert_eq!(file_name_from_url(&url), Some("dir".to_string()));

        let url = Url::parse("https://example.com").unwrap();
        assert_eq!(file_name_from_url(&url), None);
    }
}
