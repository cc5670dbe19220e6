//! Maps `file://` URL paths to local filesystem paths.

use std::path::PathBuf;
use url::Url;

/// Converts a file URL into a file path without decoding percent encoding, which could
/// otherwise restore path traversal characters. (`url.to_file_path()` decodes; `url.path()`
/// roots paths to `/` on Windows.)
pub trait SafeUrlPath {
    /// Returns the path component of a URL as a filesystem path.
    fn safe_url_filepath(&self) -> PathBuf;
}

#[cfg(windows)]
impl SafeUrlPath for Url {
    fn safe_url_filepath(&self) -> PathBuf {
        let url_path = self.path();

        // Windows filepaths written as `file://` URLs have path components prefixed with /.
        PathBuf::from(if let Some(stripped) = url_path.strip_prefix('/') {
            stripped
        } else {
            url_path
        })
    }
}

#[cfg(unix)]
impl SafeUrlPath for Url {
    fn safe_url_filepath(&self) -> PathBuf {
        PathBuf::from(self.path())
    }
}
