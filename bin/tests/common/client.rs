//! Thin HTTP client for the lease api.
use std::net::SocketAddr;

use anyhow::Result;

pub struct Client {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl Client {
    pub fn new(addr: SocketAddr, token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: format!("http://{addr}/v1"),
            token: Some(token.to_owned()),
        }
    }

    pub fn without_token(addr: SocketAddr) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: format!("http://{addr}/v1"),
            token: None,
        }
    }

    fn with_token(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.header("X-Ofcirtoken", token),
            None => req,
        }
    }

    pub async fn acquire(&self, resource_type: Option<&str>) -> Result<reqwest::Response> {
        let mut url = format!("{}/ofcir", self.base);
        if let Some(t) = resource_type {
            url = format!("{url}?type={t}");
        }
        Ok(self.with_token(self.http.post(url)).send().await?)
    }

    pub async fn status(&self, name: &str) -> Result<reqwest::Response> {
        let url = format!("{}/ofcir/{name}", self.base);
        Ok(self.with_token(self.http.get(url)).send().await?)
    }

    pub async fn release(&self, name: &str) -> Result<reqwest::Response> {
        let url = format!("{}/ofcir/{name}", self.base);
        Ok(self.with_token(self.http.delete(url)).send().await?)
    }
}
