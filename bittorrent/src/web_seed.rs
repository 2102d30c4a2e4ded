// BEP 19 web seeding: fetch a piece's byte range over HTTP from a mirror URL
// instead of a P2P peer. Used only when no connected peer has the piece;
// falls back transparently to P2P on any failure.

use std::time::Duration;

use url::Url;

const MAX_RETRIES_PER_URL: u32 = 3;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(thiserror::Error, Debug)]
pub enum WebSeedError {

    #[error("request error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("server returned status {0}")]
    BadStatus(u16),

    #[error("response body length {got} does not match requested range length {want}")]
    LengthMismatch { got: usize, want: usize },

    #[error("no webseed urls configured")]
    NoUrls,

    #[error("all webseed urls exhausted for this range")]
    Exhausted,
}

type Result<T> = std::result::Result<T, WebSeedError>;

pub struct WebSeeder {
    client: reqwest::Client,
    urls: Vec<Url>,
    // Round-robin cursor into `urls`.
    next_url: usize,
}

impl WebSeeder {
    pub fn new(urls: Vec<Url>) -> Self {
        Self { client: reqwest::Client::new(), urls, next_url: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    // Fetches `[start, start+len)` of the concatenated torrent byte stream.
    // Tries each configured url in round-robin order, up to `MAX_RETRIES_PER_URL`
    // attempts per url, before giving up.
    pub async fn fetch_range(&mut self, start: u64, len: usize) -> Result<Vec<u8>> {
        if self.urls.is_empty() {
            return Err(WebSeedError::NoUrls);
        }

        let end = start + len as u64 - 1;
        let num_urls = self.urls.len();

        for _ in 0..num_urls {
            let url = self.urls[self.next_url].clone();
            self.next_url = (self.next_url + 1) % num_urls;

            for attempt in 0..MAX_RETRIES_PER_URL {
                match self.try_fetch(&url, start, end, len).await {
                    Ok(bytes) => return Ok(bytes),
                    Err(e) => {
                        tracing::warn!("webseed {} attempt {} failed: {}", url, attempt + 1, e);
                    }
                }
            }
        }

        Err(WebSeedError::Exhausted)
    }

    async fn try_fetch(&self, url: &Url, start: u64, end: u64, len: usize) -> Result<Vec<u8>> {
        let resp = tokio::time::timeout(
            REQUEST_TIMEOUT,
            self.client
                .get(url.clone())
                .header("Range", format!("bytes={start}-{end}"))
                .send(),
        )
        .await
        .map_err(|_| WebSeedError::BadStatus(408))??;

        let status = resp.status().as_u16();
        if status != 206 && status != 200 {
            return Err(WebSeedError::BadStatus(status));
        }

        let bytes = resp.bytes().await?;
        // A server ignoring the Range header (200 instead of 206) returns the
        // whole resource; slice out the requested window ourselves.
        let slice = if status == 200 && bytes.len() > len {
            bytes.slice(start as usize..start as usize + len)
        } else {
            bytes
        };

        if slice.len() != len {
            return Err(WebSeedError::LengthMismatch { got: slice.len(), want: len });
        }

        Ok(slice.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_url_list_errors_immediately() {
        let mut seeder = WebSeeder::new(Vec::new());
        let err = seeder.fetch_range(0, 16).await.unwrap_err();
        assert!(matches!(err, WebSeedError::NoUrls));
    }

    #[test]
    fn round_robin_cycles_through_urls() {
        let urls: Vec<Url> = vec![
            "http://a.example/".parse().unwrap(),
            "http://b.example/".parse().unwrap(),
        ];
        let seeder = WebSeeder::new(urls.clone());
        assert_eq!(seeder.urls.len(), 2);
        assert_eq!(seeder.next_url, 0);
    }
}
