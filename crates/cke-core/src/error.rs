/// Error taxonomy shared by every cke crate.
///
/// Values of this enum travel inside `anyhow::Error`; use [`is_not_found`]
/// and [`is_no_leader`] to classify a propagated error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A storage read found no value for the key.
    #[error("not found")]
    NotFound,
    /// The object already exists with incompatible content.
    /// Also returned when a compare-and-swap lost to a concurrent writer;
    /// re-reading and retrying is safe.
    #[error("conflicted: {0}")]
    Conflicted(String),
    /// User input failed validation.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// The leader key witnessing a mutation no longer exists.
    #[error("no leader")]
    NoLeader,
    /// Network, SSH or HTTP failure.
    #[error("transient failure: {0}")]
    Transient(String),
    /// The container engine, a validator or the CA refused the request.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }
}

fn find(err: &anyhow::Error) -> Option<&Error> {
    err.chain().find_map(|e| e.downcast_ref::<Error>())
}

/// True if `err` (or any error in its context chain) is [`Error::NotFound`].
pub fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(find(err), Some(Error::NotFound))
}

/// True if `err` (or any error in its context chain) is [`Error::NoLeader`].
pub fn is_no_leader(err: &anyhow::Error) -> bool {
    matches!(find(err), Some(Error::NoLeader))
}

/// True if `err` (or any error in its context chain) is [`Error::Conflicted`].
pub fn is_conflicted(err: &anyhow::Error) -> bool {
    matches!(find(err), Some(Error::Conflicted(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_classify_through_context() {
        let err: anyhow::Result<()> = Err(Error::NoLeader.into());
        let err = err.context("update record").unwrap_err();
        assert!(is_no_leader(&err));
        assert!(!is_not_found(&err));
    }

    #[test]
    fn test_not_found_display() {
        let err = anyhow::Error::from(Error::NotFound);
        assert!(is_not_found(&err));
        assert_eq!(err.to_string(), "not found");
    }

    #[test]
    fn test_plain_anyhow_is_unclassified() {
        let err = anyhow::anyhow!("boom");
        assert!(!is_not_found(&err));
        assert!(!is_no_leader(&err));
        assert!(!is_conflicted(&err));
    }

    #[test]
    fn test_conflicted_through_context() {
        let err: anyhow::Result<()> = Err(Error::Conflicted("entry changed".into()).into());
        let err = err.context("cancel reboot entry 3").unwrap_err();
        assert!(is_conflicted(&err));
        assert!(!is_not_found(&err));
    }
}
