use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cke_core::cluster::{Mount, ServiceParams};
use serde::{Deserialize, Serialize};

use crate::agent::{Agent, shell_join, shell_quote};

/// Directory holding the parameter file of every component container.
pub const PARAMS_DIR: &str = "/run/cke";

/// Contents of `/run/cke/<name>`, written before the container starts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceParamsFile {
    #[serde(default)]
    pub built_in: ServiceParams,
    #[serde(default)]
    pub extra: ServiceParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubelet: Option<KubeletParamsFile>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeletParamsFile {
    pub domain: String,
    pub allow_swap: bool,
}

/// Observed container metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    pub running: bool,
    pub image: String,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectEntry {
    name: String,
    state: InspectState,
    config: InspectConfig,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    running: bool,
    #[serde(default)]
    started_at: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    image: String,
}

/// How to start a component container.
#[derive(Debug, Clone, Default)]
pub struct RunSpec {
    pub image: String,
    pub args: Vec<String>,
    pub binds: Vec<Mount>,
    pub env: BTreeMap<String, String>,
    pub privileged: bool,
    pub pid_host: bool,
    pub entrypoint: Option<String>,
    pub params: ServiceParamsFile,
}

/// Docker CLI driven over an [`Agent`].
#[derive(Clone)]
pub struct ContainerEngine {
    agent: Arc<dyn Agent>,
}

impl ContainerEngine {
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        Self { agent }
    }

    pub fn agent(&self) -> &Arc<dyn Agent> {
        &self.agent
    }

    async fn names(&self) -> Result<Vec<String>> {
        let out = self.agent.run("docker ps -a --format '{{.Names}}'").await?;
        Ok(out
            .stdout_str()
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.names().await?.iter().any(|n| n == name))
    }

    /// Metadata of the named containers that exist.
    pub async fn inspect(&self, names: &[&str]) -> Result<HashMap<String, ContainerInfo>> {
        let existing = self.names().await?;
        let targets: Vec<&str> = names
            .iter()
            .copied()
            .filter(|n| existing.iter().any(|e| e == n))
            .collect();
        if targets.is_empty() {
            return Ok(HashMap::new());
        }
        let out = self
            .agent
            .run(&format!("docker container inspect {}", shell_join(&targets)))
            .await?;
        parse_inspect(&out.stdout)
    }

    /// Parameter file of `name`, if it was ever written.
    pub async fn read_params(&self, name: &str) -> Result<Option<ServiceParamsFile>> {
        let path = format!("{PARAMS_DIR}/{name}");
        let out = self
            .agent
            .run(&format!("if [ -f {p} ]; then cat {p}; fi", p = shell_quote(&path)))
            .await?;
        if out.stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        let params = serde_json::from_slice(&out.stdout).with_context(|| format!("parse {path}"))?;
        Ok(Some(params))
    }

    pub async fn pull_image(&self, image: &str) -> Result<()> {
        let img = shell_quote(image);
        self.agent
            .run(&format!("docker image inspect {img} >/dev/null 2>&1 || docker pull {img}"))
            .await
            .with_context(|| format!("pull {image}"))?;
        Ok(())
    }

    pub async fn volume_exists(&self, name: &str) -> Result<bool> {
        let out = self
            .agent
            .run(&format!("docker volume ls -q --filter name={}", shell_quote(&format!("^{name}$"))))
            .await?;
        Ok(out.stdout_str().lines().any(|l| l.trim() == name))
    }

    pub async fn volume_create(&self, name: &str) -> Result<()> {
        self.agent
            .run(&format!("docker volume create {}", shell_quote(name)))
            .await?;
        Ok(())
    }

    pub async fn volume_remove(&self, name: &str) -> Result<()> {
        if self.volume_exists(name).await? {
            self.agent
                .run(&format!("docker volume rm {}", shell_quote(name)))
                .await?;
        }
        Ok(())
    }

    /// Replace any container called `name` with a fresh one running `spec`.
    pub async fn run(&self, name: &str, spec: &RunSpec) -> Result<()> {
        let params = serde_json::to_vec(&spec.params).context("encode params file")?;
        self.put_file(&format!("{PARAMS_DIR}/{name}"), &params, 0o644)
            .await?;

        let mut cmd = vec![
            "docker".to_string(),
            "run".into(),
            "-d".into(),
            format!("--name={name}"),
            "--network=host".into(),
            "--uts=host".into(),
            "--restart=unless-stopped".into(),
            "--log-driver=journald".into(),
            format!("--log-opt=tag=cke-{name}"),
        ];
        if spec.privileged {
            cmd.push("--privileged".into());
        }
        if spec.pid_host {
            cmd.push("--pid=host".into());
        }
        if let Some(ep) = &spec.entrypoint {
            cmd.push(format!("--entrypoint={ep}"));
        }
        for m in &spec.binds {
            cmd.push(format!("--volume={}", m.to_volume_arg()));
        }
        for (k, v) in &spec.env {
            cmd.push(format!("--env={k}={v}"));
        }
        cmd.push(spec.image.clone());
        cmd.extend(spec.args.iter().cloned());

        self.agent
            .run(&format!(
                "docker rm -f {} >/dev/null 2>&1; {}",
                shell_quote(name),
                shell_join(&cmd)
            ))
            .await
            .with_context(|| format!("run container {name}"))?;
        Ok(())
    }

    pub async fn stop(&self, name: &str) -> Result<()> {
        if self.exists(name).await? {
            self.agent
                .run(&format!("docker container stop {}", shell_quote(name)))
                .await?;
        }
        Ok(())
    }

    pub async fn remove(&self, name: &str) -> Result<()> {
        if self.exists(name).await? {
            self.agent
                .run(&format!("docker rm -f {}", shell_quote(name)))
                .await?;
        }
        Ok(())
    }

    /// Write `content` to `path`, creating parent directories.
    pub async fn put_file(&self, path: &str, content: &[u8], mode: u32) -> Result<()> {
        let dir = path.rsplit_once('/').map(|(d, _)| d).filter(|d| !d.is_empty()).unwrap_or("/");
        let p = shell_quote(path);
        self.agent
            .run_with_input(
                &format!("mkdir -p {} && cat > {p} && chmod {mode:o} {p}", shell_quote(dir)),
                content,
            )
            .await
            .with_context(|| format!("write {path}"))?;
        Ok(())
    }

    pub async fn remove_file(&self, path: &str) -> Result<()> {
        self.agent
            .run(&format!("rm -f {}", shell_quote(path)))
            .await?;
        Ok(())
    }

    pub async fn make_dirs(&self, dirs: &[String]) -> Result<()> {
        if dirs.is_empty() {
            return Ok(());
        }
        self.agent
            .run(&format!("mkdir -p {}", shell_join(dirs)))
            .await?;
        Ok(())
    }
}

/// Parse `docker container inspect` output keyed by container name.
pub fn parse_inspect(json: &[u8]) -> Result<HashMap<String, ContainerInfo>> {
    let entries: Vec<InspectEntry> = serde_json::from_slice(json).context("parse docker inspect")?;
    Ok(entries
        .into_iter()
        .map(|e| {
            let started_at = DateTime::parse_from_rfc3339(&e.state.started_at)
                .ok()
                .map(|t| t.with_timezone(&Utc));
            (
                e.name.trim_start_matches('/').to_string(),
                ContainerInfo {
                    running: e.state.running,
                    image: e.config.image,
                    started_at,
                },
            )
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inspect() {
        let json = br#"[
            {"Name": "/etcd", "State": {"Running": true, "StartedAt": "2024-05-01T10:00:00.123456789Z"},
             "Config": {"Image": "ghcr.io/cybozu/etcd:3.5"}},
            {"Name": "/kubelet", "State": {"Running": false, "StartedAt": "0001-01-01T00:00:00Z"},
             "Config": {"Image": "ghcr.io/cybozu/kubernetes:1.32"}}
        ]"#;
        let m = parse_inspect(json).unwrap();
        assert!(m["etcd"].running);
        assert_eq!(m["etcd"].image, "ghcr.io/cybozu/etcd:3.5");
        assert!(m["etcd"].started_at.is_some());
        assert!(!m["kubelet"].running);
    }

    #[test]
    fn test_params_file_json() {
        let p = ServiceParamsFile {
            built_in: ServiceParams {
                extra_args: vec!["--a".into()],
                ..Default::default()
            },
            extra: ServiceParams::default(),
            kubelet: None,
        };
        let json = serde_json::to_string(&p).unwrap();
        assert!(!json.contains("kubelet"));
        let back: ServiceParamsFile = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }
}
