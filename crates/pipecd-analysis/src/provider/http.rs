//! HTTP probe: a request passes when the status equals `expectedCode`

use super::http_error;
use crate::config::AnalysisHttp;
use pipecd_common::{Error, Result};
use reqwest::Method;

pub const PROVIDER_TYPE: &str = "HTTP";

pub struct HttpProbe {
    http: reqwest::Client,
    cfg: AnalysisHttp,
    method: Method,
}

impl HttpProbe {
    /// `cfg` must already be rendered
    pub fn new(cfg: AnalysisHttp) -> Result<Self> {
        if cfg.url.is_empty() {
            return Err(Error::invalid_argument("http analysis needs a url"));
        }
        if cfg.expected_code == 0 {
            return Err(Error::invalid_argument("http analysis needs an expectedCode"));
        }
        let method = if cfg.method.is_empty() {
            Method::GET
        } else {
            Method::from_bytes(cfg.method.to_ascii_uppercase().as_bytes())
                .map_err(|_| Error::invalid_argument(format!("invalid http method {:?}", cfg.method)))?
        };
        Ok(Self {
            http: reqwest::Client::new(),
            cfg,
            method,
        })
    }

    pub fn url(&self) -> &str {
        &self.cfg.url
    }

    pub async fn probe(&self) -> Result<(bool, String)> {
        let mut req = self.http.request(self.method.clone(), &self.cfg.url);
        for h in &self.cfg.custom_headers {
            req = req.header(h.key.as_str(), h.value.as_str());
        }
        if self.cfg.timeout.as_std() > std::time::Duration::ZERO {
            req = req.timeout(self.cfg.timeout.as_std());
        }
        let status = req.send().await.map_err(http_error)?.status().as_u16();
        if status == self.cfg.expected_code {
            Ok((true, format!("got expected status {status}")))
        } else {
            Ok((false, format!("got status {status}, want {}", self.cfg.expected_code)))
        }
    }
}
