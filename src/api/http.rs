use super::{FilePart, HttpReply, JobApi, Route};
use crate::config::RunConfig;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::Body;
use reqwest::multipart::{Form, Part};
use tracing::{debug, warn};

pub struct HttpJobApi {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    submit_path: String,
    status_path: String,
    file_field: String,
}

impl HttpJobApi {
    pub fn new(run: &RunConfig) -> Result<Self> {
        let target = &run.target;
        let pool = run.connection_budget();
        if !target.verify_tls {
            warn!("TLS certificate verification is disabled for {}", target.base_url);
        }
        debug!(
            "http client pool_max_idle_per_host={} timeout={:?}",
            pool, target.request_timeout
        );
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(!target.verify_tls)
            .pool_max_idle_per_host(pool)
            .timeout(target.request_timeout)
            .connect_timeout(target.connect_timeout)
            .build()
            .with_context(|| "building HTTP client")?;
        Ok(Self {
            client,
            base_url: target.base_url.clone(),
            api_key: target.api_key.clone(),
            submit_path: target.submit_path.clone(),
            status_path: target.status_path.clone(),
            file_field: target.file_field.clone(),
        })
    }

    fn url(&self, template: &str, route: &Route, job_id: Option<&str>) -> String {
        format!("{}{}", self.base_url, render_path(template, route, job_id))
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    async fn read(resp: reqwest::Response) -> Result<HttpReply> {
        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| anyhow!("reading response body (HTTP {status}): {e}"))?;
        Ok(HttpReply { status, body })
    }
}

pub fn render_path(template: &str, route: &Route, job_id: Option<&str>) -> String {
    let mut path = template.to_string();
    if let Some(ds) = route.datasource {
        path = path.replace("{datasource}", &ds.to_string());
    }
    if let Some(id) = job_id {
        path = path.replace("{id}", id);
    }
    path
}

#[async_trait]
impl JobApi for HttpJobApi {
    async fn submit(&self, route: &Route, files: Vec<FilePart>) -> Result<HttpReply> {
        let url = self.url(&self.submit_path, route, None);
        let mut form = Form::new();
        for f in files {
            let len = f.content.len() as u64;
            let part = Part::stream_with_length(Body::from(f.content), len)
                .file_name(f.file_name)
                .mime_str(f.content_type)
                .with_context(|| "building multipart part")?;
            form = form.part(self.file_field.clone(), part);
        }
        let resp = self
            .authorize(self.client.post(&url).multipart(form))
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;
        Self::read(resp).await
    }

    async fn job_status(&self, route: &Route, job_id: &str) -> Result<HttpReply> {
        let url = self.url(&self.status_path, route, Some(job_id));
        let resp = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        Self::read(resp).await
    }
}
