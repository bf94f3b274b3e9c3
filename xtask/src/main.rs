use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "xtask", about = "Development tasks")]
struct Args {
    #[command(subcommand)]
    task: Task,
}

#[derive(Subcommand)]
enum Task {
    /// Generate man pages for ckecli
    Man {
        /// Output directory
        #[arg(long, default_value = "target/man")]
        out: PathBuf,
    },
}

fn main() -> Result<()> {
    match Args::parse().task {
        Task::Man { out } => {
            let pages = generate_man_pages(&out)?;
            println!("wrote {} man pages to {}", pages.len(), out.display());
            Ok(())
        }
    }
}

/// Render `ckecli.1` plus one page per top-level subcommand.
fn generate_man_pages(out: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(out).with_context(|| format!("Failed to create {}", out.display()))?;
    let root = cke_cli::Cli::command();
    let mut written = vec![render(out, "ckecli", root.clone())?];
    for sub in root.get_subcommands() {
        let name = format!("ckecli-{}", sub.get_name());
        let page = sub.clone().name(name.clone());
        written.push(render(out, &name, page)?);
    }
    Ok(written)
}

fn render(out: &Path, name: &str, cmd: clap::Command) -> Result<PathBuf> {
    let path = out.join(format!("{name}.1"));
    let mut buf = Vec::new();
    clap_mangen::Man::new(cmd)
        .render(&mut buf)
        .with_context(|| format!("render {name}"))?;
    fs::write(&path, buf).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generates_root_and_subcommand_pages() {
        let dir = tempfile::tempdir().unwrap();
        let pages = generate_man_pages(dir.path()).unwrap();
        assert!(pages.iter().any(|p| p.ends_with("ckecli.1")));
        assert!(pages.iter().any(|p| p.ends_with("ckecli-reboot-queue.1")));
        let root = fs::read_to_string(dir.path().join("ckecli.1")).unwrap();
        assert!(root.contains("ckecli"));
    }
}
