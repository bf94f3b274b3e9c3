use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cke_core::Error;
use cke_core::node::Node;
use russh::ChannelMsg;
use russh::client::{self, Handle};
use russh_keys::key::{KeyPair, PublicKey};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Default deadline of a single remote command.
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(60);

const SSH_PORT: u16 = 22;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Output of a remote command that exited zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl RunOutput {
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }
}

/// Executes commands on one node.
///
/// A non-zero exit status is an error that carries stderr.
#[async_trait]
pub trait Agent: Send + Sync {
    fn address(&self) -> &str;

    async fn run(&self, command: &str) -> Result<RunOutput> {
        self.run_with_input(command, &[]).await
    }

    async fn run_with_input(&self, command: &str, input: &[u8]) -> Result<RunOutput>;

    async fn close(&self) {}
}

struct HostKeyAcceptor;

#[async_trait]
impl client::Handler for HostKeyAcceptor {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        // Nodes are provisioned fresh; host keys are not pinned.
        Ok(true)
    }
}

/// [`Agent`] over an SSH session authenticated with the node's signer.
///
/// At most one command runs at a time on the session.
pub struct SshAgent {
    address: String,
    session: Mutex<Handle<HostKeyAcceptor>>,
    timeout: Duration,
}

impl SshAgent {
    /// Connect, authenticate and probe the container engine.
    pub async fn connect(node: &Node, timeout: Duration) -> Result<Self> {
        let signer = node
            .signer
            .as_ref()
            .ok_or_else(|| Error::bad_request(format!("node {} has no signer", node.address)))?;
        let key: KeyPair = russh_keys::decode_secret_key(signer.pem(), None)
            .map_err(|e| Error::bad_request(format!("decode private key for {}: {e}", node.address)))?;

        let config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(600)),
            ..Default::default()
        });
        let addr = (node.address.as_str(), SSH_PORT);
        let mut session = tokio::time::timeout(CONNECT_TIMEOUT, client::connect(config, addr, HostKeyAcceptor))
            .await
            .map_err(|_| Error::transient(format!("ssh connect to {} timed out", node.address)))?
            .map_err(|e| Error::transient(format!("ssh connect to {}: {e}", node.address)))?;

        let authenticated = session
            .authenticate_publickey(&node.user, Arc::new(key))
            .await
            .map_err(|e| Error::transient(format!("ssh auth to {}: {e}", node.address)))?;
        if !authenticated {
            return Err(Error::fatal(format!("ssh public key rejected by {}@{}", node.user, node.address)).into());
        }

        let agent = Self {
            address: node.address.clone(),
            session: Mutex::new(session),
            timeout,
        };
        agent
            .run("docker version")
            .await
            .with_context(|| format!("docker is not available on {}", node.address))?;
        debug!(node = %node.address, "ssh agent connected");
        Ok(agent)
    }

    async fn exec(&self, command: &str, input: &[u8]) -> Result<(Option<u32>, RunOutput)> {
        let session = self.session.lock().await;
        let mut channel = session
            .channel_open_session()
            .await
            .map_err(|e| Error::transient(format!("ssh channel to {}: {e}", self.address)))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| Error::transient(format!("ssh exec on {}: {e}", self.address)))?;
        if !input.is_empty() {
            channel
                .data(input)
                .await
                .map_err(|e| Error::transient(format!("ssh stdin to {}: {e}", self.address)))?;
        }
        channel
            .eof()
            .await
            .map_err(|e| Error::transient(format!("ssh eof to {}: {e}", self.address)))?;

        let mut out = RunOutput::default();
        let mut code = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => out.stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext: 1 } => out.stderr.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status } => code = Some(exit_status),
                _ => {}
            }
        }
        Ok((code, out))
    }
}

#[async_trait]
impl Agent for SshAgent {
    fn address(&self) -> &str {
        &self.address
    }

    async fn run_with_input(&self, command: &str, input: &[u8]) -> Result<RunOutput> {
        let (code, out) = tokio::time::timeout(self.timeout, self.exec(command, input))
            .await
            .map_err(|_| Error::transient(format!("command timed out on {}: {command}", self.address)))??;
        match code {
            Some(0) => Ok(out),
            Some(code) => Err(Error::fatal(format!(
                "command failed on {} (exit {code}): {command}: {}",
                self.address,
                String::from_utf8_lossy(&out.stderr).trim()
            ))
            .into()),
            None => Err(Error::transient(format!("session to {} closed without exit status", self.address)).into()),
        }
    }

    async fn close(&self) {
        let session = self.session.lock().await;
        if let Err(e) = session
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            warn!(node = %self.address, error = %e, "ssh disconnect failed");
        }
    }
}

/// Quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./:=@,+%".contains(&b))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Join `args` into a single shell-safe command line.
pub fn shell_join<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|a| shell_quote(a.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("docker"), "docker");
        assert_eq!(shell_quote("--name=etcd"), "--name=etcd");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_shell_join() {
        assert_eq!(shell_join(&["echo", "hello world"]), "echo 'hello world'");
    }

    #[test]
    fn test_run_output_trims() {
        let out = RunOutput {
            stdout: b"true\n".to_vec(),
            stderr: vec![],
        };
        assert_eq!(out.stdout_str(), "true");
    }
}
