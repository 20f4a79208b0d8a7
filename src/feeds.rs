use std::fs;
use std::io::Read;
use std::thread;
use std::time::Duration;

use flate2::read::GzDecoder;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::debug;

use crate::error::PipelineError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

pub trait FeedClient: Send + Sync {
    fn fetch(&self, location: &str) -> Result<Vec<u8>, PipelineError>;
}

#[derive(Clone)]
pub struct FeedHttpClient {
    client: Client,
}

impl FeedHttpClient {
    pub fn new() -> Result<Self, PipelineError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("covid-forecast/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| PipelineError::InvalidConfig(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| PipelineError::FeedHttp {
                location: "client".to_string(),
                message: err.to_string(),
            })?;
        Ok(Self { client })
    }

    fn send_with_retries(&self, url: &str) -> Result<reqwest::blocking::Response, PipelineError> {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            let response = self.client.get(url).send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(PipelineError::FeedHttp {
                        location: url.to_string(),
                        message: err.to_string(),
                    });
                }
            }
        }
    }

    fn download(&self, url: &str) -> Result<Vec<u8>, PipelineError> {
        let response = self.send_with_retries(url)?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "feed request failed".to_string());
            return Err(PipelineError::FeedStatus {
                location: url.to_string(),
                status,
                message,
            });
        }
        let bytes = response.bytes().map_err(|err| PipelineError::FeedHttp {
            location: url.to_string(),
            message: err.to_string(),
        })?;
        Ok(bytes.to_vec())
    }
}

impl FeedClient for FeedHttpClient {
    fn fetch(&self, location: &str) -> Result<Vec<u8>, PipelineError> {
        debug!(location, "fetching feed");
        let raw = if is_remote(location) {
            self.download(location)?
        } else {
            fs::read(location)
                .map_err(|err| PipelineError::Filesystem(format!("read {location}: {err}")))?
        };
        decode_payload(location, raw)
    }
}

pub fn is_remote(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

pub fn decode_payload(location: &str, raw: Vec<u8>) -> Result<Vec<u8>, PipelineError> {
    let path = location.split('?').next().unwrap_or(location);
    if !path.ends_with(".gz") && !raw.starts_with(&GZIP_MAGIC) {
        return Ok(raw);
    }
    let mut decoder = GzDecoder::new(raw.as_slice());
    let mut inflated = Vec::new();
    decoder
        .read_to_end(&mut inflated)
        .map_err(|err| PipelineError::malformed(location, format!("gzip: {err}")))?;
    Ok(inflated)
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
