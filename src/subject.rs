use crate::config;
use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

/// The system under test, when the harness owns its lifecycle. Dispatch for
/// a stage starts only after `start` returned Ok.
#[async_trait]
pub trait Subject: Send {
    async fn start(&mut self, fleet_count: u32) -> Result<()>;
    /// Best effort; failures are logged, never returned.
    async fn stop(&mut self);
}

pub struct DockerSubject {
    cfg: config::Subject,
    ready_url: Option<String>,
    client: reqwest::Client,
}

impl DockerSubject {
    pub fn new(cfg: &config::Subject, base_url: &str) -> Result<Self> {
        if cfg.image.trim().is_empty() {
            bail!("subject.image is required to manage the subject lifecycle");
        }
        let ready_url = if cfg.ready_path.is_empty() {
            None
        } else {
            Some(format!("{}{}", base_url.trim_end_matches('/'), cfg.ready_path))
        };
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(5))
            .build()
            .with_context(|| "building readiness client")?;
        Ok(Self {
            cfg: cfg.clone(),
            ready_url,
            client,
        })
    }

    pub fn env_vars(&self, fleet_count: u32) -> Vec<(String, String)> {
        env_vars(&self.cfg, fleet_count)
    }

    async fn wait_ready(&self) -> Result<()> {
        let Some(url) = &self.ready_url else {
            info!(
                "waiting {}s for {} to start",
                self.cfg.startup_wait_seconds, self.cfg.container_name
            );
            sleep(Duration::from_secs(self.cfg.startup_wait_seconds)).await;
            return Ok(());
        };

        let deadline = Instant::now() + Duration::from_secs(self.cfg.startup_timeout_seconds);
        loop {
            match self.client.get(url).send().await {
                Ok(resp) if resp.status().as_u16() < 500 => {
                    info!("{} ready ({} from {url})", self.cfg.container_name, resp.status());
                    return Ok(());
                }
                Ok(resp) => debug!("readiness {url}: HTTP {}", resp.status()),
                Err(err) => debug!("readiness {url}: {err}"),
            }
            if Instant::now() >= deadline {
                bail!(
                    "{} not ready after {}s ({url})",
                    self.cfg.container_name,
                    self.cfg.startup_timeout_seconds
                );
            }
            sleep(Duration::from_secs(1)).await;
        }
    }
}

/// Fleet size goes through `fleet_env_var`; forwarded harness variables
/// and the `[subject.env]` table follow, the table winning on conflicts.
pub fn env_vars(cfg: &config::Subject, fleet_count: u32) -> Vec<(String, String)> {
    let mut vars = vec![(cfg.fleet_env_var.clone(), fleet_count.to_string())];
    for name in &cfg.forward_env {
        if cfg.env.contains_key(name) {
            continue;
        }
        if let Ok(value) = std::env::var(name) {
            vars.push((name.clone(), value));
        }
    }
    for (k, v) in &cfg.env {
        if k != &cfg.fleet_env_var {
            vars.push((k.clone(), v.clone()));
        }
    }
    vars
}

async fn docker(args: &[String]) -> Result<Output> {
    debug!("docker {}", args.join(" "));
    Command::new("docker")
        .args(args)
        .output()
        .await
        .with_context(|| format!("spawning docker {}", args.first().map(String::as_str).unwrap_or("")))
}

#[async_trait]
impl Subject for DockerSubject {
    async fn start(&mut self, fleet_count: u32) -> Result<()> {
        info!(
            "starting {} from {} with {}={}",
            self.cfg.container_name, self.cfg.image, self.cfg.fleet_env_var, fleet_count
        );
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "-p".to_string(),
            format!("{0}:{0}", self.cfg.port),
            format!("--name={}", self.cfg.container_name),
        ];
        for (k, v) in self.env_vars(fleet_count) {
            args.push("-e".into());
            args.push(format!("{k}={v}"));
        }
        args.push(self.cfg.image.clone());

        let out = docker(&args).await?;
        if !out.status.success() {
            return Err(anyhow!(
                "failed to start container {}: {}",
                self.cfg.container_name,
                String::from_utf8_lossy(&out.stderr).trim()
            ));
        }
        let id = String::from_utf8_lossy(&out.stdout).trim().to_string();
        info!("container started: {}", id.get(..12).unwrap_or(&id));

        if let Err(err) = self.wait_ready().await {
            self.stop().await;
            return Err(err);
        }
        Ok(())
    }

    async fn stop(&mut self) {
        let name = self.cfg.container_name.clone();
        info!("stopping container {name}");
        for verb in ["stop", "rm"] {
            match docker(&[verb.to_string(), name.clone()]).await {
                Ok(out) if out.status.success() => {}
                Ok(out) => warn!(
                    "docker {verb} {name} failed: {}",
                    String::from_utf8_lossy(&out.stderr).trim()
                ),
                Err(err) => warn!("docker {verb} {name}: {err:#}"),
            }
        }
    }
}
