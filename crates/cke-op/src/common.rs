//! Commanders shared by the component operators.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cke_core::Error;
use cke_core::cluster::{Cluster, ServiceParams};
use cke_core::node::Node;
use cke_core::record::Command;
use cke_infra::container::ContainerEngine;
use tokio::time::{Instant, sleep};
use tracing::{debug, info};

use crate::operator::{Commander, RunContext};
use crate::parallel;
use crate::service::Service;

pub const WAIT_INTERVAL: Duration = Duration::from_secs(2);

/// Container engine on `addr` for this pass.
pub async fn engine(ctx: &RunContext<'_>, addr: &str) -> Result<ContainerEngine> {
    let agent = ctx
        .infra
        .agent(addr)
        .await
        .ok_or_else(|| Error::transient(format!("node {addr} is unreachable")))?;
    Ok(ContainerEngine::new(agent))
}

pub fn addrs_of(nodes: &[Node]) -> Vec<String> {
    nodes.iter().map(|n| n.address.clone()).collect()
}

pub fn join_addrs(nodes: &[Node]) -> String {
    addrs_of(nodes).join(",")
}

/// Poll `check` every `interval` until it returns true.
///
/// Fails after `timeout` or when the pass is cancelled. Errors from `check`
/// count as "not yet".
pub async fn wait_until<F, Fut>(
    ctx: &RunContext<'_>,
    what: &str,
    timeout: Duration,
    interval: Duration,
    mut check: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        ctx.check_cancelled()?;
        match check().await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) => debug!(what, error = %format!("{e:#}"), "wait check failed"),
        }
        if Instant::now() >= deadline {
            return Err(Error::transient(format!("timed out waiting for {what}")).into());
        }
        tokio::select! {
            _ = ctx.cancel.cancelled() => {}
            _ = sleep(interval) => {}
        }
    }
}

pub struct MakeDirs {
    pub nodes: Vec<Node>,
    pub dirs: Vec<String>,
}

#[async_trait]
impl Commander for MakeDirs {
    async fn run(&self, ctx: &RunContext<'_>) -> Result<()> {
        let addrs = addrs_of(&self.nodes);
        parallel::on_nodes("make-dirs", &addrs, |addr| async move {
            engine(ctx, addr).await?.make_dirs(&self.dirs).await
        })
        .await
    }

    fn command(&self) -> Command {
        Command::new("make-dirs", join_addrs(&self.nodes)).with_detail(self.dirs.join(" "))
    }
}

pub struct ImagePull {
    pub nodes: Vec<Node>,
    pub image: String,
}

#[async_trait]
impl Commander for ImagePull {
    async fn run(&self, ctx: &RunContext<'_>) -> Result<()> {
        let addrs = addrs_of(&self.nodes);
        parallel::on_nodes("image-pull", &addrs, |addr| async move {
            engine(ctx, addr).await?.pull_image(&self.image).await
        })
        .await
    }

    fn command(&self) -> Command {
        Command::new("image-pull", join_addrs(&self.nodes)).with_detail(self.image.clone())
    }
}

pub struct VolumeCreate {
    pub nodes: Vec<Node>,
    pub volume: String,
}

#[async_trait]
impl Commander for VolumeCreate {
    async fn run(&self, ctx: &RunContext<'_>) -> Result<()> {
        let addrs = addrs_of(&self.nodes);
        parallel::on_nodes("volume-create", &addrs, |addr| async move {
            let engine = engine(ctx, addr).await?;
            if !engine.volume_exists(&self.volume).await? {
                engine.volume_create(&self.volume).await?;
            }
            Ok(())
        })
        .await
    }

    fn command(&self) -> Command {
        Command::new("volume-create", join_addrs(&self.nodes)).with_detail(self.volume.clone())
    }
}

pub struct VolumeRemove {
    pub nodes: Vec<Node>,
    pub volume: String,
}

#[async_trait]
impl Commander for VolumeRemove {
    async fn run(&self, ctx: &RunContext<'_>) -> Result<()> {
        let addrs = addrs_of(&self.nodes);
        parallel::on_nodes("volume-remove", &addrs, |addr| async move {
            let engine = engine(ctx, addr).await?;
            if engine.volume_exists(&self.volume).await? {
                engine.volume_remove(&self.volume).await?;
            }
            Ok(())
        })
        .await
    }

    fn command(&self) -> Command {
        Command::new("volume-remove", join_addrs(&self.nodes)).with_detail(self.volume.clone())
    }
}

/// Start (or replace) a component container with its built-in params.
pub struct RunContainer {
    pub service: Service,
    /// Each node with the built-in params computed for it.
    pub nodes: Vec<(Node, ServiceParams)>,
}

impl RunContainer {
    pub fn new(cluster: &Cluster, service: Service, nodes: &[Node]) -> Self {
        Self {
            service,
            nodes: nodes
                .iter()
                .map(|n| (n.clone(), service.built_in(cluster, n)))
                .collect(),
        }
    }
}

#[async_trait]
impl Commander for RunContainer {
    async fn run(&self, ctx: &RunContext<'_>) -> Result<()> {
        let addrs: Vec<String> = self.nodes.iter().map(|(n, _)| n.address.clone()).collect();
        parallel::on_nodes("run-container", &addrs, |addr| async move {
            let (_, built_in) = self
                .nodes
                .iter()
                .find(|(n, _)| n.address == addr)
                .context("node vanished")?;
            let spec = self.service.run_spec(ctx.cluster, built_in.clone());
            engine(ctx, addr).await?.run(self.service.name(), &spec).await?;
            info!(node = %addr, service = %self.service, "container started");
            Ok(())
        })
        .await
    }

    fn command(&self) -> Command {
        let addrs: Vec<String> = self.nodes.iter().map(|(n, _)| n.address.clone()).collect();
        Command::new("run-container", addrs.join(",")).with_detail(self.service.name())
    }
}

pub struct StopContainer {
    pub nodes: Vec<Node>,
    pub name: String,
}

#[async_trait]
impl Commander for StopContainer {
    async fn run(&self, ctx: &RunContext<'_>) -> Result<()> {
        let addrs = addrs_of(&self.nodes);
        parallel::on_nodes("stop-container", &addrs, |addr| async move {
            let engine = engine(ctx, addr).await?;
            if engine.exists(&self.name).await? {
                engine.stop(&self.name).await?;
            }
            Ok(())
        })
        .await
    }

    fn command(&self) -> Command {
        Command::new("stop-container", join_addrs(&self.nodes)).with_detail(self.name.clone())
    }
}

pub struct RemoveContainer {
    pub nodes: Vec<Node>,
    pub name: String,
}

#[async_trait]
impl Commander for RemoveContainer {
    async fn run(&self, ctx: &RunContext<'_>) -> Result<()> {
        let addrs = addrs_of(&self.nodes);
        parallel::on_nodes("remove-container", &addrs, |addr| async move {
            engine(ctx, addr).await?.remove(&self.name).await
        })
        .await
    }

    fn command(&self) -> Command {
        Command::new("remove-container", join_addrs(&self.nodes)).with_detail(self.name.clone())
    }
}

pub struct RemoveFile {
    pub nodes: Vec<Node>,
    pub path: String,
}

#[async_trait]
impl Commander for RemoveFile {
    async fn run(&self, ctx: &RunContext<'_>) -> Result<()> {
        let addrs = addrs_of(&self.nodes);
        parallel::on_nodes("remove-file", &addrs, |addr| async move {
            engine(ctx, addr).await?.remove_file(&self.path).await
        })
        .await
    }

    fn command(&self) -> Command {
        Command::new("remove-file", join_addrs(&self.nodes)).with_detail(self.path.clone())
    }
}

pub struct MakeFile {
    pub nodes: Vec<Node>,
    pub path: String,
    pub content: String,
    pub mode: u32,
}

#[async_trait]
impl Commander for MakeFile {
    async fn run(&self, ctx: &RunContext<'_>) -> Result<()> {
        let addrs = addrs_of(&self.nodes);
        parallel::on_nodes("make-file", &addrs, |addr| async move {
            engine(ctx, addr)
                .await?
                .put_file(&self.path, self.content.as_bytes(), self.mode)
                .await
        })
        .await
    }

    fn command(&self) -> Command {
        Command::new("make-file", join_addrs(&self.nodes)).with_detail(self.path.clone())
    }
}

/// Wait until the apiserver on `node` answers `/readyz`.
pub struct WaitKubernetes {
    pub node: Node,
    pub timeout: Duration,
}

#[async_trait]
impl Commander for WaitKubernetes {
    async fn run(&self, ctx: &RunContext<'_>) -> Result<()> {
        let kube = ctx.infra.kube(ctx.cluster, &self.node).await?;
        wait_until(ctx, "kubernetes apiserver", self.timeout, WAIT_INTERVAL, || {
            let kube = kube.clone();
            async move { kube.is_ready().await }
        })
        .await
    }

    fn command(&self) -> Command {
        Command::new("wait-kubernetes", self.node.address.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{ctx, test_cluster};
    use cke_infra::fake::FakeInfra;

    #[tokio::test]
    async fn test_volume_create_is_idempotent() {
        let infra = FakeInfra::new();
        let c = test_cluster(1, 0);
        let cmd = VolumeCreate {
            nodes: c.nodes.clone(),
            volume: "etcd-cke".into(),
        };
        cmd.run(&ctx(&infra, &c)).await.unwrap();
        cmd.run(&ctx(&infra, &c)).await.unwrap();
        let host = infra.host("10.0.0.1");
        let creates = host
            .commands()
            .iter()
            .filter(|c| c.starts_with("docker volume create"))
            .count();
        assert_eq!(creates, 1);
        assert!(host.state().volumes.contains("etcd-cke"));
    }

    #[tokio::test]
    async fn test_run_container_on_every_node() {
        let infra = FakeInfra::new();
        let c = test_cluster(1, 2);
        let cmd = RunContainer::new(&c, Service::Rivers, &c.nodes);
        assert_eq!(cmd.command().target, "10.0.0.1,10.0.1.1,10.0.1.2");
        cmd.run(&ctx(&infra, &c)).await.unwrap();
        for n in &c.nodes {
            let rivers = infra.host(&n.address).container("rivers").unwrap();
            assert!(rivers.running);
            assert_eq!(rivers.args[0], "rivers");
        }
    }

    #[tokio::test]
    async fn test_unreachable_node_fails_step() {
        let infra = FakeInfra::new();
        let c = test_cluster(2, 0);
        infra.set_unreachable("10.0.0.2");
        let err = ImagePull {
            nodes: c.nodes.clone(),
            image: "img".into(),
        }
        .run(&ctx(&infra, &c))
        .await
        .unwrap_err();
        assert!(format!("{err:#}").contains("10.0.0.2 is unreachable"));
        assert!(infra.host("10.0.0.1").state().images.contains("img"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_kubernetes_times_out() {
        let infra = FakeInfra::new();
        let c = test_cluster(1, 0);
        let err = WaitKubernetes {
            node: c.nodes[0].clone(),
            timeout: Duration::from_secs(10),
        }
        .run(&ctx(&infra, &c))
        .await
        .unwrap_err();
        assert!(err.to_string().contains("timed out"));

        infra.kube.state().ready = true;
        WaitKubernetes {
            node: c.nodes[0].clone(),
            timeout: Duration::from_secs(10),
        }
        .run(&ctx(&infra, &c))
        .await
        .unwrap();
    }
}
