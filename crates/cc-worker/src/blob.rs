use std::time::Duration;

use reqwest::Client;

/// Default cap on a single blob download.
pub const DEFAULT_BLOB_TIMEOUT_SECS: u64 = 60;

/// Download a stored blob with a bounded timeout.
pub async fn fetch(client: &Client, url: &str, timeout_secs: u64) -> Result<Vec<u8>, String> {
    let response = client
        .get(url)
        .timeout(Duration::from_secs(timeout_secs))
        .send()
        .await
        .map_err(|err| format!("blob download failed: {err}"))?;

    let status = response.status();
    if !status.is_success() {
        return Err(format!("blob download failed with status {status}"));
    }

    response
        .bytes()
        .await
        .map(|bytes| bytes.to_vec())
        .map_err(|err| format!("blob body read failed: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn fetch_returns_bytes_on_success() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/blob/a.txt");
                then.status(200).body("hello");
            })
            .await;

        let client = Client::new();
        let bytes = fetch(&client, &server.url("/blob/a.txt"), 5).await.unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn fetch_reports_http_errors() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/blob/missing.pdf");
                then.status(404);
            })
            .await;

        let client = Client::new();
        let err = fetch(&client, &server.url("/blob/missing.pdf"), 5)
            .await
            .unwrap_err();
        assert!(err.contains("404"));
    }
}
