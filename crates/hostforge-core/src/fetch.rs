use std::path::Path;

use crate::error::{ProvisionError, Result};

/// HTTP access for release metadata, signing keys and archives.
pub trait Fetcher {
    fn get_text(&self, url: &str) -> Result<String>;

    /// Stream `url` into `dest`, replacing any existing file.
    fn download(&self, url: &str, dest: &Path) -> Result<()>;
}

/// Blocking reqwest client. No timeout is configured: a hung request stalls
/// the calling stage until the operator interrupts it.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("hostforge/", env!("CARGO_PKG_VERSION")))
            .timeout(None::<std::time::Duration>)
            .build()?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn get_text(&self, url: &str) -> Result<String> {
        let resp = self
            .client
            .get(url)
            .header("Accept", "application/json, text/plain, */*")
            .send()
            .map_err(|e| download_err(url, e))?;
        if !resp.status().is_success() {
            return Err(ProvisionError::Download {
                url: url.to_string(),
                message: format!("HTTP {}", resp.status()),
            });
        }
        resp.text().map_err(|e| download_err(url, e))
    }

    fn download(&self, url: &str, dest: &Path) -> Result<()> {
        let mut resp = self
            .client
            .get(url)
            .send()
            .map_err(|e| download_err(url, e))?;
        if !resp.status().is_success() {
            return Err(ProvisionError::Download {
                url: url.to_string(),
                message: format!("HTTP {}", resp.status()),
            });
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::File::create(dest)?;
        resp.copy_to(&mut file).map_err(|e| download_err(url, e))?;
        Ok(())
    }
}

fn download_err(url: &str, e: reqwest::Error) -> ProvisionError {
    ProvisionError::Download {
        url: url.to_string(),
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn get_text_returns_body() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/ip")
            .with_status(200)
            .with_body("203.0.113.7")
            .create();

        let fetcher = HttpFetcher::new().unwrap();
        let body = fetcher.get_text(&format!("{}/ip", server.url())).unwrap();
        assert_eq!(body, "203.0.113.7");
        mock.assert();
    }

    #[test]
    fn get_text_maps_http_errors() {
        let mut server = mockito::Server::new();
        server.mock("GET", "/missing").with_status(404).create();

        let fetcher = HttpFetcher::new().unwrap();
        let err = fetcher
            .get_text(&format!("{}/missing", server.url()))
            .unwrap_err();
        match err {
            ProvisionError::Download { message, .. } => assert!(message.contains("404")),
            other => panic!("expected Download error, got {other:?}"),
        }
    }

    #[test]
    fn download_writes_file() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/archive.tar.gz")
            .with_status(200)
            .with_body(b"tarball-bytes".as_slice())
            .create();

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("nested/archive.tar.gz");
        HttpFetcher::new()
            .unwrap()
            .download(&format!("{}/archive.tar.gz", server.url()), &dest)
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"tarball-bytes");
    }
}
