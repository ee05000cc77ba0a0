//! Loading a chat preamble from a URL or a local file.

use anyhow::Context;
use tracing::debug;
use url::Url;

use crate::error::StreamError;

/// Download a static text document such as a persona.
pub async fn fetch_preamble(client: &reqwest::Client, url: &str) -> Result<String, StreamError> {
    debug!(%url, "fetching preamble");
    let text = client
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    Ok(text)
}

/// Read a preamble from `location`, which is either an `http(s)` URL or a
/// filesystem path.
pub async fn load_preamble(location: &str) -> anyhow::Result<String> {
    match Url::parse(location) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => {
            fetch_preamble(&reqwest::Client::new(), url.as_str())
                .await
                .with_context(|| format!("fetching preamble from {location}"))
        }
        _ => tokio::fs::read_to_string(location)
            .await
            .with_context(|| format!("reading preamble from {location}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use std::io::Write;

    #[tokio::test]
    async fn fetches_over_http() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/persona.txt");
                then.status(200).body("You are a helpful assistant.");
            })
            .await;
        let text = load_preamble(&server.url("/persona.txt")).await.unwrap();
        assert_eq!(text, "You are a helpful assistant.");
    }

    #[tokio::test]
    async fn http_errors_are_reported() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/missing");
                then.status(404);
            })
            .await;
        let err = fetch_preamble(&reqwest::Client::new(), &server.url("/missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::Http(_)));
    }

    #[tokio::test]
    async fn reads_local_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "local persona").unwrap();
        let path = file.path().to_str().unwrap().to_string();
        assert_eq!(load_preamble(&path).await.unwrap(), "local persona");
    }

    #[tokio::test]
    async fn missing_file_mentions_location() {
        let err = load_preamble("/definitely/not/here.txt").await.unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.txt"));
    }
}
