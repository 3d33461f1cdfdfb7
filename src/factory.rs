use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, RequestBuilder, Url};
use thiserror::Error;

use crate::config::{ConfigError, HttpMethod, RunConfig};

/// A per-request failure where no response was received. Recorded in the
/// outcome sequence, never fatal to the run.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request failed: {0}")]
    Other(String),
}

/// Seam between the driver and the HTTP client: dispatch one request built
/// from the run configuration and report the status code, or a transport
/// error when no response arrived. Tests substitute deterministic mocks.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn dispatch(&self) -> Result<u16, TransportError>;
}

pub fn build_headers(headers: &HashMap<String, String>) -> Result<HeaderMap, ConfigError> {
    let mut header_map = HeaderMap::new();
    for (key, value) in headers {
        match (HeaderName::from_str(key), HeaderValue::from_str(value)) {
            (Ok(header_name), Ok(header_value)) => {
                header_map.insert(header_name, header_value);
            }
            _ => {
                return Err(ConfigError::InvalidHeader {
                    name: key.clone(),
                    reason: format!("'{}' is not a valid header entry", value),
                })
            }
        }
    }
    Ok(header_map)
}

pub fn build_client(config: &RunConfig) -> Result<Client, ConfigError> {
    Client::builder()
        .timeout(config.request_timeout)
        .build()
        .map_err(|e| ConfigError::Invalid(format!("failed to build http client: {}", e)))
}

/// The real transport: a reqwest client plus the fully resolved request
/// parts, so each dispatch only clones cheap handles.
pub struct HttpTransport {
    client: Client,
    method: HttpMethod,
    url: Url,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl HttpTransport {
    pub fn new(config: &RunConfig) -> Result<Self, ConfigError> {
        Ok(HttpTransport {
            client: build_client(config)?,
            method: config.method.clone(),
            url: config.url.clone(),
            headers: build_headers(&config.headers)?,
            body: config.body.clone(),
        })
    }

    fn request_builder(&self) -> RequestBuilder {
        let builder = match self.method {
            HttpMethod::POST => self.client.post(self.url.clone()),
            HttpMethod::PUT => self.client.put(self.url.clone()),
            HttpMethod::DELETE => self.client.delete(self.url.clone()),
            HttpMethod::GET => self.client.get(self.url.clone()),
            // Extend this match to handle other HTTP methods as needed
        };
        let builder = builder.headers(self.headers.clone());
        match self.method {
            HttpMethod::POST | HttpMethod::PUT => builder.body(self.body.clone()),
            HttpMethod::GET | HttpMethod::DELETE => builder,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn dispatch(&self) -> Result<u16, TransportError> {
        match self.request_builder().send().await {
            Ok(response) => Ok(response.status().as_u16()),
            Err(e) if e.is_timeout() => Err(TransportError::Timeout),
            Err(e) if e.is_connect() => Err(TransportError::Connect(e.to_string())),
            Err(e) => Err(TransportError::Other(e.to_string())),
        }
    }
}
