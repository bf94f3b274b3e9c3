use std::io::Write;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use cke_core::Error;
use cke_core::cluster::Cluster;
use cke_core::node::{Node, validate_node};
use cke_infra::{Agent, CertIssuer, SshAgent};
use tempfile::NamedTempFile;

use crate::context::{CliContext, find_node, split_user};

const SSH_OPTIONS: &[&str] = &["-o", "StrictHostKeyChecking=no", "-o", "UserKnownHostsFile=/dev/null", "-o", "LogLevel=ERROR"];

/// A node with its signer resolved from the secret store.
pub async fn resolve_node(cx: &CliContext, cluster: &Cluster, target: &str) -> Result<Node> {
    let (user, name) = split_user(target);
    let mut node = find_node(cluster, name)?.clone();
    if let Some(user) = user {
        node.user = user.to_string();
    }
    let keys = cx.vault().await?.ssh_keys().await.context("load SSH keys")?;
    validate_node(&mut node, &keys)?;
    Ok(node)
}

/// Private key of `node` in a file only the current user can read.
fn key_file(node: &Node) -> Result<NamedTempFile> {
    let signer = node
        .signer
        .as_ref()
        .ok_or_else(|| Error::bad_request(format!("no SSH key for {}", node.address)))?;
    let mut f = tempfile::Builder::new()
        .prefix("ckecli-key-")
        .tempfile()
        .context("create key file")?;
    f.write_all(signer.pem().as_bytes()).context("write key file")?;
    f.flush()?;
    Ok(f)
}

/// `ssh` arguments for an interactive session or a single command.
pub fn ssh_args(key: &str, node: &Node, command: &[String]) -> Vec<String> {
    let mut args = vec!["-i".to_string(), key.to_string()];
    args.extend(SSH_OPTIONS.iter().map(|s| s.to_string()));
    if command.is_empty() {
        args.push("-t".into());
    }
    args.push(format!("{}@{}", node.user, node.address));
    args.extend(command.iter().cloned());
    args
}

/// Run `command` on `target`; without a command open an interactive shell.
pub async fn ssh(cx: &CliContext, target: &str, command: &[String]) -> Result<()> {
    let cluster = cx.cluster().await?;
    let node = resolve_node(cx, &cluster, target).await?;
    if command.is_empty() {
        return run_interactive("ssh", &node, |key| ssh_args(key, &node, command));
    }

    let agent = SshAgent::connect(&node, Duration::from_secs(3600)).await?;
    let result = agent.run(&command.join(" ")).await;
    agent.close().await;
    let out = result?;
    std::io::stdout().write_all(&out.stdout)?;
    std::io::stderr().write_all(&out.stderr)?;
    Ok(())
}

/// A `[user@]node:path` operand, or a local path.
#[derive(Debug, PartialEq, Eq)]
pub enum ScpOperand<'a> {
    Local(&'a str),
    Remote { user: Option<&'a str>, node: &'a str, path: &'a str },
}

pub fn parse_operand(s: &str) -> ScpOperand<'_> {
    match s.split_once(':') {
        Some((host, path)) if !host.is_empty() && !host.contains('/') => {
            let (user, node) = split_user(host);
            ScpOperand::Remote { user, node, path }
        }
        _ => ScpOperand::Local(s),
    }
}

fn render_operand(op: &ScpOperand<'_>, node: &Node) -> String {
    match op {
        ScpOperand::Local(p) => p.to_string(),
        ScpOperand::Remote { path, .. } => format!("{}@{}:{path}", node.user, node.address),
    }
}

/// `scp` arguments with node names rewritten to addresses.
pub fn scp_args(key: &str, node: &Node, recursive: bool, src: &ScpOperand<'_>, dst: &ScpOperand<'_>) -> Vec<String> {
    let mut args = vec!["-i".to_string(), key.to_string()];
    args.extend(SSH_OPTIONS.iter().map(|s| s.to_string()));
    if recursive {
        args.push("-r".into());
    }
    args.push(render_operand(src, node));
    args.push(render_operand(dst, node));
    args
}

/// Copy files between the local host and one node.
pub async fn scp(cx: &CliContext, recursive: bool, src: &str, dst: &str) -> Result<()> {
    let (src, dst) = (parse_operand(src), parse_operand(dst));
    let target = match (&src, &dst) {
        (ScpOperand::Remote { .. }, ScpOperand::Remote { .. }) => bail!("only one of source and destination may be remote"),
        (ScpOperand::Remote { user, node, .. }, _) | (_, ScpOperand::Remote { user, node, .. }) => match user {
            Some(u) => format!("{u}@{node}"),
            None => node.to_string(),
        },
        _ => bail!("either source or destination must be NODE:PATH"),
    };
    let cluster = cx.cluster().await?;
    let node = resolve_node(cx, &cluster, &target).await?;
    run_interactive("scp", &node, |key| scp_args(key, &node, recursive, &src, &dst))
}

fn run_interactive(program: &str, node: &Node, args: impl FnOnce(&str) -> Vec<String>) -> Result<()> {
    let bin = which::which(program).with_context(|| format!("{program} is not installed"))?;
    let key = key_file(node)?;
    let key_path = key.path().to_string_lossy().to_string();
    let status = Command::new(bin)
        .args(args(&key_path))
        .status()
        .with_context(|| format!("run {program}"))?;
    if !status.success() {
        bail!("{program} exited with {status}");
    }
    Ok(())
}
