use async_trait::async_trait;
use reqwest::{StatusCode, Url};

use crate::pool::{Connector, RemoteConnection};
use crate::remote::{path_segments, TransferError};

/// File-addressed retrieval over HTTP(S): `GET {base_url}/{path}`.
///
/// Each pooled connection owns a client limited to one idle socket, so the
/// pool bound is also the bound on sockets held open against the server.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    base_url: String,
    username: Option<String>,
    password: Option<String>,
}

impl HttpConnector {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.username = username;
        self.password = password;
        self
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self) -> Result<Box<dyn RemoteConnection>, TransferError> {
        let base_url = Url::parse(&self.base_url)
            .map_err(|e| TransferError::Connect(format!("invalid base url '{}': {e}", self.base_url)))?;
        if base_url.cannot_be_a_base() {
            return Err(TransferError::Connect(format!(
                "invalid base url '{}'",
                self.base_url
            )));
        }
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(1)
            .build()
            .map_err(|e| TransferError::Connect(e.to_string()))?;
        Ok(Box::new(HttpConnection {
            client,
            base_url,
            username: self.username.clone(),
            password: self.password.clone(),
            alive: true,
        }))
    }

    fn kind(&self) -> &'static str {
        "http"
    }
}

struct HttpConnection {
    client: reqwest::Client,
    base_url: Url,
    username: Option<String>,
    password: Option<String>,
    alive: bool,
}

impl HttpConnection {
    /// Append the confined, percent-encoded path segments to the base URL.
    fn url_for(&self, path: &str) -> Result<Url, TransferError> {
        let segments = path_segments(path)?;
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| TransferError::Connect(format!("invalid base url '{}'", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

#[async_trait]
impl RemoteConnection for HttpConnection {
    async fn retrieve(&mut self, path: &str) -> Result<Option<Vec<u8>>, TransferError> {
        let url = self.url_for(path)?;
        let mut req = self.client.get(url);
        if let Some(user) = &self.username {
            req = req.basic_auth(user, self.password.as_deref());
        }

        let resp = match req.send().await {
            Ok(resp) => resp,
            Err(e) => {
                self.alive = false;
                return Err(if e.is_connect() {
                    TransferError::Connect(e.to_string())
                } else {
                    TransferError::Io(e.to_string())
                });
            }
        };

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let body = resp.bytes().await.map_err(|e| {
                    self.alive = false;
                    TransferError::Io(e.to_string())
                })?;
                Ok(Some(body.to_vec()))
            }
            s => {
                // Auth and server errors leave the socket usable but the
                // session suspect; let the pool open a fresh one.
                if s == StatusCode::UNAUTHORIZED || s.is_server_error() {
                    self.alive = false;
                }
                Err(TransferError::Status {
                    status: s.as_u16(),
                    path: path.to_string(),
                })
            }
        }
    }

    fn is_alive(&self) -> bool {
        self.alive
    }
}
