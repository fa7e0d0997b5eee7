use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::backend::{RpcBackend, RpcErrorPayload, RpcResponse};

/// Errors building an [`HttpRpcBackend`].
#[derive(Debug, Error)]
pub enum HttpBackendError {
    #[error("backend url '{0}' cannot be used as a base url")]
    InvalidBaseUrl(Url),
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Remote procedure backend speaking the PostgREST RPC dialect.
///
/// Procedures are invoked with `POST {base}/rest/v1/rpc/{name}` and a JSON
/// object of named parameters.
#[derive(Clone)]
pub struct HttpRpcBackend {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
}

impl HttpRpcBackend {
    pub fn new(base_url: Url, api_key: Option<String>) -> Result<Self, HttpBackendError> {
        if base_url.cannot_be_a_base() {
            return Err(HttpBackendError::InvalidBaseUrl(base_url));
        }
        Ok(Self {
            client: Client::builder().build()?,
            base_url,
            api_key,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn rpc_url(&self, procedure: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["rest", "v1", "rpc", procedure]);
        }
        url
    }
}

#[async_trait]
impl RpcBackend for HttpRpcBackend {
    async fn invoke(&self, procedure: &str, params: Value) -> RpcResponse {
        let url = self.rpc_url(procedure);
        let mut request = self.client.post(url).json(&params);
        if let Some(key) = &self.api_key {
            request = request.header("apikey", key).bearer_auth(key);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => return RpcResponse::err(map_transport_error(&err)),
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(err) => return RpcResponse::err(map_transport_error(&err)),
        };

        if !status.is_success() {
            let payload = map_status_error(status, &body);
            debug!(
                procedure,
                status = status.as_u16(),
                code = %payload.code,
                "rpc returned error status"
            );
            return RpcResponse::err(payload);
        }

        decode_body(procedure, &body)
    }
}

fn decode_body(procedure: &str, body: &str) -> RpcResponse {
    if body.trim().is_empty() {
        return RpcResponse::default();
    }
    match serde_json::from_str::<Value>(body) {
        Ok(data) => RpcResponse::ok(data),
        Err(err) => {
            warn!(procedure, error = %err, "rpc body is not json");
            RpcResponse::err(RpcErrorPayload::new(
                "DECODE_ERROR",
                format!("response of '{procedure}' is not json: {err}"),
            ))
        }
    }
}

fn map_transport_error(err: &reqwest::Error) -> RpcErrorPayload {
    let code = if err.is_timeout() {
        "TIMEOUT"
    } else if err.is_connect() || err.is_request() {
        "FETCH_ERROR"
    } else {
        "NETWORK_ERROR"
    };
    RpcErrorPayload::new(code, err.to_string())
}

fn map_status_error(status: StatusCode, body: &str) -> RpcErrorPayload {
    if let Ok(payload) = serde_json::from_str::<RpcErrorPayload>(body)
        && !payload.code.is_empty()
    {
        return payload;
    }

    let code = match status {
        StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => "NETWORK_ERROR".to_owned(),
        _ => format!("HTTP_{}", status.as_u16()),
    };
    let message = match body.trim() {
        "" => status.to_string(),
        text => text.to_owned(),
    };
    RpcErrorPayload::new(code, message)
}
