// cke-cli: the ckecli command tree.
// Talks to CKE storage directly; Vault, etcd and the apiserver are reached
// with credentials issued on the fly.

pub mod backup;
pub mod commands;
pub mod context;
pub mod etcd;
pub mod output;
pub mod queue;
pub mod ssh;
pub mod ui;

use std::process::ExitCode;

pub use commands::{Cli, run};

/// Exit status when the server has not reported any status yet.
pub const EXIT_NO_STATUS: u8 = 4;

/// Raised by `ckecli status` before the first pass wrote a status.
#[derive(Debug, thiserror::Error)]
#[error("no status available")]
pub struct NoStatus;

/// Process exit status for a failed command.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    if err.is::<NoStatus>() { EXIT_NO_STATUS } else { 1 }
}

/// Run ckecli and map the outcome to an exit status.
pub fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            ui::error(&format!("{e:#}"));
            ExitCode::from(exit_code(&e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&anyhow::Error::new(NoStatus)), EXIT_NO_STATUS);
        assert_eq!(exit_code(&anyhow::anyhow!("boom")), 1);
        let wrapped = anyhow::Error::new(NoStatus).context("status");
        assert_eq!(exit_code(&wrapped), EXIT_NO_STATUS);
    }
}
