use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{CommandFactory, Parser, Subcommand};
use cke_core::Error;
use cke_core::ca::CaName;
use cke_core::cluster::Cluster;
use cke_core::config::{CkeConfig, DEFAULT_CONFIG_PATH};
use cke_core::images::all_images;
use cke_core::is_not_found;
use cke_core::logging::{self, LogFormat};
use cke_core::resource::parse_resources;
use cke_core::vault::VaultConfig;
use cke_infra::VaultClient;
use cke_sabakan::generator::validate_template;
use serde_json::json;

use crate::context::CliContext;
use crate::output::{print_bool, print_json, print_yaml, read_input};
use crate::{NoStatus, backup, etcd, queue, ssh, ui};

#[derive(Parser)]
#[command(name = "ckecli", version, about = "Control CKE, the Kubernetes cluster engine")]
pub struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Get or set the cluster declaration
    Cluster {
        #[command(subcommand)]
        action: ClusterCmd,
    },
    /// Show or set cluster constraints
    Constraints {
        #[command(subcommand)]
        action: ConstraintsCmd,
    },
    /// Get or set CA certificates
    Ca {
        #[command(subcommand)]
        action: CaCmd,
    },
    /// Configure the Vault connection and key material
    Vault {
        #[command(subcommand)]
        action: VaultCmd,
    },
    /// Kubernetes credentials
    Kubernetes {
        #[command(subcommand)]
        action: KubernetesCmd,
    },
    /// Managed etcd: users, certificates and backups
    Etcd {
        #[command(subcommand)]
        action: EtcdCmd,
    },
    /// Print the hostname of the current leader
    Leader,
    /// Show the operation history
    History {
        /// Number of records to show, newest first
        #[arg(short = 'n', long, default_value_t = 10)]
        count: usize,
    },
    /// List the container images CKE uses
    Images,
    /// User-defined Kubernetes resources
    Resource {
        #[command(subcommand)]
        action: ResourceCmd,
    },
    /// Inventory integration
    Sabakan {
        #[command(subcommand)]
        action: SabakanCmd,
    },
    /// Automatic repair of unhealthy machines
    AutoRepair {
        #[command(subcommand)]
        action: AutoRepairCmd,
    },
    /// Graceful node reboots
    RebootQueue {
        #[command(subcommand)]
        action: RebootQueueCmd,
    },
    /// Machine repair operations
    RepairQueue {
        #[command(subcommand)]
        action: RepairQueueCmd,
    },
    /// Open a shell or run a command on a node
    Ssh {
        /// [user@]NODE, by address or node name
        target: String,
        /// Command to run instead of an interactive shell
        #[arg(trailing_var_arg = true)]
        command: Vec<String>,
    },
    /// Copy files to or from a node
    Scp {
        /// Copy directories recursively
        #[arg(short = 'r')]
        recursive: bool,
        /// Source; [user@]NODE:PATH for a remote file
        src: String,
        /// Destination; [user@]NODE:PATH for a remote file
        dst: String,
    },
    /// Show the server status and the latest operation record
    Status,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ClusterCmd {
    /// Print the cluster declaration as YAML
    Get,
    /// Validate and store a cluster declaration
    Set {
        /// YAML file, `-` for stdin
        file: String,
    },
}

#[derive(Subcommand)]
enum ConstraintsCmd {
    /// Print the constraints
    Show,
    /// Set one constraint
    Set {
        /// Constraint name, e.g. control-plane-count
        name: String,
        value: u64,
    },
}

#[derive(Subcommand)]
enum CaCmd {
    /// Print a CA certificate
    Get {
        /// CA name, e.g. kubernetes
        name: String,
    },
    /// Store a CA certificate from a PEM file
    Set { name: String, file: String },
}

#[derive(Subcommand)]
enum VaultCmd {
    /// Store Vault connection settings from a JSON file
    Config {
        /// JSON with endpoint, ca-cert, role-id and secret-id
        file: String,
    },
    /// Prepare Vault for CKE using VAULT_ADDR and VAULT_TOKEN
    Init,
    /// Generate the Secret encryption key unless it exists
    Enckey,
    /// Store an SSH private key
    SshPrivkey {
        /// Node address the key is for; the default key when omitted
        #[arg(long)]
        host: Option<String>,
        /// PEM file, `-` for stdin
        file: String,
    },
}

#[derive(Subcommand)]
enum KubernetesCmd {
    /// Issue an admin kubeconfig
    Issue {
        /// Certificate lifetime
        #[arg(long, default_value = "2h")]
        ttl: String,
    },
}

#[derive(Subcommand)]
enum EtcdCmd {
    /// Create a user limited to a key prefix
    UserAdd { name: String, prefix: String },
    /// Issue a client certificate for the etcd root user
    RootIssue {
        #[arg(long, default_value = "2h")]
        ttl: String,
    },
    /// Backups taken by the in-cluster backup service
    Backup {
        #[command(subcommand)]
        action: EtcdBackupCmd,
    },
    /// Local snapshots of the CKE storage
    Snapshot {
        #[command(subcommand)]
        action: EtcdSnapshotCmd,
    },
    /// Snapshot the CKE storage into DIR
    LocalBackup {
        dir: PathBuf,
        /// Number of snapshots to keep
        #[arg(long, default_value_t = 10)]
        max: usize,
    },
}

#[derive(Subcommand)]
enum EtcdBackupCmd {
    /// List backups
    List,
    /// Download a backup into the current directory
    Get { name: String },
}

#[derive(Subcommand)]
enum EtcdSnapshotCmd {
    /// List snapshots in DIR
    List { dir: PathBuf },
}

#[derive(Subcommand)]
enum ResourceCmd {
    /// List resource keys
    List,
    /// Print one resource as YAML
    Get { key: String },
    /// Add or update the resources in a YAML file
    Set { file: String },
    /// Remove the resources in a YAML file
    Delete { file: String },
}

#[derive(Subcommand)]
enum SabakanCmd {
    Enable,
    Disable,
    /// Print whether the integration is enabled
    IsEnabled,
    SetUrl { url: String },
    GetUrl,
    /// Store the cluster template
    SetTemplate { file: String },
    GetTemplate,
    /// Store searchMachines variables from a JSON file
    SetVariables { file: String },
    GetVariables,
}

#[derive(Subcommand)]
enum AutoRepairCmd {
    Enable,
    Disable,
    IsEnabled,
    /// Store searchMachines variables selecting machines to repair
    SetVariables { file: String },
    GetVariables,
}

#[derive(Subcommand)]
enum RebootQueueCmd {
    /// Queue the nodes listed in FILE, one per line
    Add { file: String },
    List,
    /// Cancel one entry
    Cancel { index: i64 },
    CancelAll,
    Enable,
    Disable,
    IsEnabled,
    /// Clear the drain backoff of every entry
    ResetBackoff,
}

#[derive(Subcommand)]
enum RepairQueueCmd {
    /// Queue a repair operation
    Add {
        operation: String,
        /// Machine type
        machine_type: String,
        address: String,
        /// Machine serial
        #[arg(default_value = "")]
        serial: String,
    },
    List,
    /// Delete one entry
    Delete { index: i64 },
    /// Delete finished entries
    DeleteFinished,
    /// Delete entries still being processed
    DeleteUnfinished,
    Enable,
    Disable,
    IsEnabled,
    /// Clear the drain backoff of every entry
    ResetBackoff,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(LogFormat::Human);

    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(shell, &mut cmd, "ckecli", &mut std::io::stdout());
        return Ok(());
    }
    if let Commands::Images = cli.command {
        for image in all_images() {
            println!("{image}");
        }
        return Ok(());
    }

    let config = CkeConfig::load_or_default(&cli.config)?;
    let runtime = tokio::runtime::Runtime::new().context("start runtime")?;
    runtime.block_on(async move {
        let cx = CliContext::connect(config).await?;
        dispatch(&cx, cli.command).await
    })
}

async fn dispatch(cx: &CliContext, command: Commands) -> Result<()> {
    match command {
        Commands::Cluster { action } => cmd_cluster(cx, action).await,
        Commands::Constraints { action } => cmd_constraints(cx, action).await,
        Commands::Ca { action } => cmd_ca(cx, action).await,
        Commands::Vault { action } => cmd_vault(cx, action).await,
        Commands::Kubernetes {
            action: KubernetesCmd::Issue { ttl },
        } => {
            print!("{}", cx.admin_kubeconfig(&ttl).await?);
            Ok(())
        }
        Commands::Etcd { action } => cmd_etcd(cx, action).await,
        Commands::Leader => cmd_leader(cx).await,
        Commands::History { count } => print_json(&cx.storage.get_records(count.max(1)).await?),
        Commands::Resource { action } => cmd_resource(cx, action).await,
        Commands::Sabakan { action } => cmd_sabakan(cx, action).await,
        Commands::AutoRepair { action } => cmd_auto_repair(cx, action).await,
        Commands::RebootQueue { action } => cmd_reboot_queue(cx, action).await,
        Commands::RepairQueue { action } => cmd_repair_queue(cx, action).await,
        Commands::Ssh { target, command } => ssh::ssh(cx, &target, &command).await,
        Commands::Scp { recursive, src, dst } => ssh::scp(cx, recursive, &src, &dst).await,
        Commands::Status => cmd_status(cx).await,
        Commands::Images | Commands::Completions { .. } => Ok(()),
    }
}

/// Treat a missing key as "empty" for the get-style commands.
fn or_not_set<T>(r: Result<T>, what: &str) -> Result<T> {
    r.map_err(|e| if is_not_found(&e) { e.context(format!("{what} is not set")) } else { e })
}

// --- cluster / constraints / ca ---

async fn cmd_cluster(cx: &CliContext, action: ClusterCmd) -> Result<()> {
    match action {
        ClusterCmd::Get => print_yaml(&cx.cluster().await?),
        ClusterCmd::Set { file } => {
            let cluster = Cluster::from_yaml(&read_input(&file)?)?;
            cluster.validate(false)?;
            cx.constraints().await?.check(&cluster)?;
            cx.storage.put_cluster(&cluster).await
        }
    }
}

async fn cmd_constraints(cx: &CliContext, action: ConstraintsCmd) -> Result<()> {
    match action {
        ConstraintsCmd::Show => print_json(&cx.constraints().await?),
        ConstraintsCmd::Set { name, value } => {
            let mut constraints = cx.constraints().await?;
            constraints.set(&name, value)?;
            match cx.storage.get_cluster().await {
                Ok(cluster) => constraints.check(&cluster)?,
                Err(e) if is_not_found(&e) => {}
                Err(e) => return Err(e),
            }
            cx.storage.put_constraints(&constraints).await
        }
    }
}

async fn cmd_ca(cx: &CliContext, action: CaCmd) -> Result<()> {
    match action {
        CaCmd::Get { name } => {
            let name: CaName = name.parse()?;
            print!("{}", or_not_set(cx.storage.get_ca_certificate(name).await, &format!("CA {name}"))?);
            Ok(())
        }
        CaCmd::Set { name, file } => {
            let name: CaName = name.parse()?;
            let pem = read_input(&file)?;
            if !pem.contains("-----BEGIN CERTIFICATE-----") {
                return Err(Error::bad_request(format!("{file} is not a PEM certificate")).into());
            }
            cx.storage.put_ca_certificate(None, name, &pem).await
        }
    }
}

// --- vault / kubernetes ---

async fn cmd_vault(cx: &CliContext, action: VaultCmd) -> Result<()> {
    match action {
        VaultCmd::Config { file } => {
            let cfg = VaultConfig::from_json(read_input(&file)?.as_bytes())?;
            cx.storage.put_vault_config(&cfg).await
        }
        VaultCmd::Init => vault_init(cx).await,
        VaultCmd::Enckey => {
            if cx.vault().await?.ensure_encryption_key().await? {
                ui::success("generated the encryption key");
            } else {
                ui::info("the encryption key already exists");
            }
            Ok(())
        }
        VaultCmd::SshPrivkey { host, file } => {
            let pem = read_input(&file)?;
            cke_core::node::Signer::from_pem(&pem).context("parse private key")?;
            let addr = host.unwrap_or_default();
            cx.vault().await?.put_ssh_key(&addr, &pem).await
        }
    }
}

async fn vault_init(cx: &CliContext) -> Result<()> {
    let endpoint = std::env::var("VAULT_ADDR").context("VAULT_ADDR is not set")?;
    let token = std::env::var("VAULT_TOKEN").context("VAULT_TOKEN is not set")?;
    let ca_cert = match std::env::var("VAULT_CACERT") {
        Ok(path) => std::fs::read_to_string(&path).with_context(|| format!("Failed to read {path}"))?,
        Err(_) => String::new(),
    };
    let name = match cx.storage.get_cluster().await {
        Ok(c) => c.name,
        Err(e) if is_not_found(&e) => "cke".to_string(),
        Err(e) => return Err(e),
    };

    let vault = VaultClient::with_token(&endpoint, &ca_cert, &token)?;
    let (cas, role_id, secret_id) = vault.init(&name).await?;
    for (ca, pem) in &cas {
        cx.storage.put_ca_certificate(None, *ca, pem).await?;
    }
    cx.storage
        .put_vault_config(&VaultConfig {
            endpoint,
            ca_cert,
            role_id,
            secret_id,
        })
        .await?;
    ui::success(&format!("vault initialized with {} CAs", cas.len()));
    Ok(())
}

// --- etcd ---

async fn cmd_etcd(cx: &CliContext, action: EtcdCmd) -> Result<()> {
    match action {
        EtcdCmd::UserAdd { name, prefix } => etcd::user_add(cx, &name, &prefix).await,
        EtcdCmd::RootIssue { ttl } => print_json(&etcd::root_issue(cx, &ttl).await?),
        EtcdCmd::Backup {
            action: EtcdBackupCmd::List,
        } => {
            for name in etcd::backup_list(cx).await? {
                println!("{name}");
            }
            Ok(())
        }
        EtcdCmd::Backup {
            action: EtcdBackupCmd::Get { name },
        } => {
            let path = etcd::backup_get(cx, &name).await?;
            ui::success(&format!("saved {}", path.display()));
            Ok(())
        }
        EtcdCmd::Snapshot {
            action: EtcdSnapshotCmd::List { dir },
        } => {
            for name in backup::list_snapshots(&dir)? {
                println!("{name}");
            }
            Ok(())
        }
        EtcdCmd::LocalBackup { dir, max } => {
            let data = cx.storage.kv().snapshot().await?;
            let path = backup::write_snapshot(&dir, &data, Utc::now())?;
            backup::rotate(&dir, max.max(1))?;
            ui::success(&format!("saved {}", path.display()));
            Ok(())
        }
    }
}

async fn cmd_leader(cx: &CliContext) -> Result<()> {
    let host = cx
        .storage
        .get_leader_hostname()
        .await
        .map_err(|e| if is_not_found(&e) { Error::NoLeader.into() } else { e })?;
    println!("{host}");
    Ok(())
}

async fn cmd_status(cx: &CliContext) -> Result<()> {
    let status = match cx.storage.get_status().await {
        Ok(s) => s,
        Err(e) if is_not_found(&e) => return Err(NoStatus.into()),
        Err(e) => return Err(e),
    };
    let latest = cx.storage.get_records(1).await?.into_iter().next();
    print_json(&json!({ "status": status, "record": latest }))
}

// --- resources ---

async fn cmd_resource(cx: &CliContext, action: ResourceCmd) -> Result<()> {
    match action {
        ResourceCmd::List => {
            for def in cx.storage.list_resources().await? {
                println!("{}", def.key);
            }
            Ok(())
        }
        ResourceCmd::Get { key } => {
            let def = or_not_set(cx.storage.get_resource(&key).await, &format!("resource {key}"))?;
            print_yaml(&def.definition)
        }
        ResourceCmd::Set { file } => {
            for def in parse_resources(&read_input(&file)?)? {
                cx.storage.put_resource(&def).await?;
            }
            Ok(())
        }
        ResourceCmd::Delete { file } => {
            for def in parse_resources(&read_input(&file)?)? {
                cx.storage.delete_resource(&def.key).await?;
            }
            Ok(())
        }
    }
}

// --- inventory integration ---

fn read_json_variables(file: &str) -> Result<Vec<u8>> {
    let text = read_input(file)?;
    serde_json::from_str::<serde_json::Value>(&text)
        .map_err(|e| Error::bad_request(format!("{file} is not valid JSON: {e}")))?;
    Ok(text.into_bytes())
}

fn print_raw(data: &[u8]) {
    println!("{}", String::from_utf8_lossy(data).trim_end());
}

async fn cmd_sabakan(cx: &CliContext, action: SabakanCmd) -> Result<()> {
    let s = &cx.storage;
    match action {
        SabakanCmd::Enable => s.enable_sabakan(true).await,
        SabakanCmd::Disable => s.enable_sabakan(false).await,
        SabakanCmd::IsEnabled => {
            print_bool(!s.is_sabakan_disabled().await?);
            Ok(())
        }
        SabakanCmd::SetUrl { url } => s.set_sabakan_url(&url).await,
        SabakanCmd::GetUrl => {
            println!("{}", or_not_set(s.get_sabakan_url().await, "sabakan URL")?);
            Ok(())
        }
        SabakanCmd::SetTemplate { file } => {
            let tmpl = Cluster::from_yaml(&read_input(&file)?)?;
            validate_template(&tmpl)?;
            s.set_sabakan_template(&tmpl).await
        }
        SabakanCmd::GetTemplate => {
            let (tmpl, _) = or_not_set(s.get_sabakan_template().await, "sabakan template")?;
            print_yaml(&tmpl)
        }
        SabakanCmd::SetVariables { file } => s.set_sabakan_query_variables(&read_json_variables(&file)?).await,
        SabakanCmd::GetVariables => {
            print_raw(&or_not_set(s.get_sabakan_query_variables().await, "query variables")?);
            Ok(())
        }
    }
}

async fn cmd_auto_repair(cx: &CliContext, action: AutoRepairCmd) -> Result<()> {
    let s = &cx.storage;
    match action {
        AutoRepairCmd::Enable => s.enable_auto_repair(true).await,
        AutoRepairCmd::Disable => s.enable_auto_repair(false).await,
        AutoRepairCmd::IsEnabled => {
            print_bool(!s.is_auto_repair_disabled().await?);
            Ok(())
        }
        AutoRepairCmd::SetVariables { file } => s.set_auto_repair_query_variables(&read_json_variables(&file)?).await,
        AutoRepairCmd::GetVariables => {
            print_raw(&or_not_set(s.get_auto_repair_query_variables().await, "auto-repair variables")?);
            Ok(())
        }
    }
}

// --- queues ---

async fn cmd_reboot_queue(cx: &CliContext, action: RebootQueueCmd) -> Result<()> {
    let s = &cx.storage;
    match action {
        RebootQueueCmd::Add { file } => {
            let names = queue::parse_node_list(&read_input(&file)?);
            let cluster = cx.cluster().await?;
            let added = queue::add_reboot_entries(s, &cluster, &names).await?;
            ui::success(&format!("queued {} node(s) for reboot", added.len()));
            Ok(())
        }
        RebootQueueCmd::List => print_json(&s.get_reboot_entries().await?),
        RebootQueueCmd::Cancel { index } => queue::cancel_reboot_entry(s, index).await,
        RebootQueueCmd::CancelAll => {
            let n = queue::cancel_all_reboot_entries(s).await?;
            ui::info(&format!("cancelled {n} entries"));
            Ok(())
        }
        RebootQueueCmd::Enable => s.enable_reboot_queue(true).await,
        RebootQueueCmd::Disable => s.enable_reboot_queue(false).await,
        RebootQueueCmd::IsEnabled => {
            print_bool(!s.is_reboot_queue_disabled().await?);
            Ok(())
        }
        RebootQueueCmd::ResetBackoff => queue::reset_reboot_backoff(s).await,
    }
}

async fn cmd_repair_queue(cx: &CliContext, action: RepairQueueCmd) -> Result<()> {
    let s = &cx.storage;
    match action {
        RepairQueueCmd::Add {
            operation,
            machine_type,
            address,
            serial,
        } => {
            let cluster = match s.get_cluster().await {
                Ok(c) => Some(c),
                Err(e) if is_not_found(&e) => None,
                Err(e) => return Err(e),
            };
            let entry =
                queue::add_repair_entry(s, cluster.as_ref(), &operation, &machine_type, &address, &serial).await?;
            if entry.nodename.is_empty() {
                ui::warn(&format!("{address} is not a cluster node"));
            }
            Ok(())
        }
        RepairQueueCmd::List => print_json(&s.get_repair_entries().await?),
        RepairQueueCmd::Delete { index } => queue::delete_repair_entry(s, index).await,
        RepairQueueCmd::DeleteFinished => {
            let n = queue::delete_finished_repair_entries(s).await?;
            ui::info(&format!("deleted {n} finished entries"));
            Ok(())
        }
        RepairQueueCmd::DeleteUnfinished => {
            let n = queue::delete_unfinished_repair_entries(s).await?;
            ui::info(&format!("marked {n} unfinished entries for deletion"));
            Ok(())
        }
        RepairQueueCmd::Enable => s.enable_repair_queue(true).await,
        RepairQueueCmd::Disable => s.enable_repair_queue(false).await,
        RepairQueueCmd::IsEnabled => {
            print_bool(!s.is_repair_queue_disabled().await?);
            Ok(())
        }
        RepairQueueCmd::ResetBackoff => queue::reset_repair_backoff(s).await,
    }
}
