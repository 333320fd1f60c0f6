//! HTTP connector.
//!
//! Request/response only: each exchange is one POST carrying one envelope.
//! Redirects are not followed by the HTTP client; they are surfaced as
//! [`Response::Redirect`] so the transport can learn the new URL.

use std::time::Duration;

use bytes::Bytes;
use fleetlink_core::TransportError;
use reqwest::{StatusCode, header, redirect};

use crate::connector::{Connector, Handler, NoDuplex, Response};

/// Header flagging an urgent upload.
pub const URGENT_HEADER: &str = "x-fleetlink-urgent";

/// [`Connector`] over HTTP(S).
#[derive(Clone, Debug)]
pub struct HttpConnector {
    client: reqwest::Client,
}

impl HttpConnector {
    /// Connector whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .redirect(redirect::Policy::none())
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Unreachable {
                url: String::new(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }

    fn join(base_url: &str, path: &str) -> String {
        format!("{}/{path}", base_url.trim_end_matches('/'))
    }

    fn unreachable(url: &str, error: &reqwest::Error) -> TransportError {
        TransportError::Unreachable { url: url.to_string(), reason: error.to_string() }
    }
}

impl Connector for HttpConnector {
    type Duplex = NoDuplex;

    async fn server_key(&self, base_url: &str) -> Result<String, TransportError> {
        let url = Self::join(base_url, "server.pem");
        let response =
            self.client.get(&url).send().await.map_err(|e| Self::unreachable(&url, &e))?;
        if response.status() != StatusCode::OK {
            return Err(TransportError::Status { url, status: response.status().as_u16() });
        }
        response.text().await.map_err(|e| Self::unreachable(&url, &e))
    }

    async fn post(
        &self,
        base_url: &str,
        handler: Handler,
        envelope: Bytes,
        urgent: bool,
    ) -> Result<Response, TransportError> {
        let url = Self::join(base_url, handler.path());
        let mut request = self
            .client
            .post(&url)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(envelope);
        if urgent {
            request = request.header(URGENT_HEADER, "1");
        }

        let response = request.send().await.map_err(|e| Self::unreachable(&url, &e))?;
        let status = response.status();

        if status.is_redirection() {
            let location = response
                .headers()
                .get(header::LOCATION)
                .and_then(|value| value.to_str().ok())
                .map(|location| location.trim_end_matches(handler.path()).to_string());
            return match location {
                Some(location) => Ok(Response::Redirect(location)),
                None => Err(TransportError::Status { url, status: status.as_u16() }),
            };
        }
        if status == StatusCode::NOT_ACCEPTABLE {
            return Err(TransportError::EnrolmentRequired);
        }
        if status != StatusCode::OK {
            return Err(TransportError::Status { url, status: status.as_u16() });
        }

        let body = response.bytes().await.map_err(|e| Self::unreachable(&url, &e))?;
        Ok(Response::Delivered(body))
    }

    async fn open_duplex(&self, base_url: &str, _handler: Handler) -> Result<NoDuplex, TransportError> {
        Err(TransportError::Unreachable {
            url: base_url.to_string(),
            reason: "full-duplex exchange is not available over plain HTTP".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_handles_trailing_slash() {
        assert_eq!(HttpConnector::join("https://a.example/", "control"), "https://a.example/control");
        assert_eq!(HttpConnector::join("https://a.example", "server.pem"), "https://a.example/server.pem");
    }
}
