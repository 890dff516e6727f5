use std::io;
use std::path::PathBuf;

use crate::constants::{
    CODE_BLOCK_MISSING, CODE_FILE_NOT_EXIST, CODE_INSERT_FORBIDDEN, CODE_QUOTA_EXCEEDED,
    ENTITY_TOO_LARGE,
};
use crate::plan::BlockPlan;

/// A failed call against the remote storage client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("remote error {code}: {message}")]
    Service { code: i64, message: String },

    #[error("transport error: {0}")]
    Transport(String),
}

impl RemoteError {
    pub fn service(code: i64, message: impl Into<String>) -> Self {
        Self::Service {
            code,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn code(&self) -> Option<i64> {
        match self {
            Self::Service { code, .. } => Some(*code),
            Self::Transport(_) => None,
        }
    }

    /// Duplicate-insert race: the object is already there.
    pub fn is_insert_forbidden(&self) -> bool {
        self.code() == Some(CODE_INSERT_FORBIDDEN)
    }

    pub fn is_quota_exceeded(&self) -> bool {
        self.code() == Some(CODE_QUOTA_EXCEEDED)
    }

    pub fn is_block_missing(&self) -> bool {
        self.code() == Some(CODE_BLOCK_MISSING)
    }

    pub fn is_not_found(&self) -> bool {
        self.code() == Some(CODE_FILE_NOT_EXIST)
    }

    pub fn is_entity_too_large(&self) -> bool {
        match self {
            Self::Transport(message) => message.to_ascii_lowercase().contains(ENTITY_TOO_LARGE),
            Self::Service { .. } => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("file unreadable: {}: {source}", path.display())]
    FileUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read block {index}: {source}")]
    BlockRead {
        index: usize,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("resume state mismatch: persisted {persisted}, planned {planned}")]
    StateInconsistency {
        persisted: BlockPlan,
        planned: BlockPlan,
    },

    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(err) => Some(err),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger i/o: {0}")]
    Io(#[from] io::Error),

    #[error("corrupted ledger: {0}")]
    Decode(#[from] toml::de::Error),

    #[error("failed to encode ledger: {0}")]
    Encode(#[from] toml::ser::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config i/o: {0}")]
    Io(#[from] io::Error),

    #[error("invalid config: {0}")]
    Decode(#[from] toml::de::Error),

    #[error("invalid rate `{0}`")]
    Rate(String),
}

/// What the orchestrator does with a task after an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Behave as if the step succeeded.
    Continue,
    Retry,
    Terminal,
}

pub fn classify(err: &TransferError) -> Verdict {
    match err {
        TransferError::Remote(remote) => {
            if remote.is_insert_forbidden() {
                Verdict::Continue
            } else if remote.is_entity_too_large()
                || remote.is_quota_exceeded()
                || remote.is_block_missing()
            {
                Verdict::Terminal
            } else {
                Verdict::Retry
            }
        }
        TransferError::FileUnreadable { .. }
        | TransferError::BlockRead { .. }
        | TransferError::StateInconsistency { .. }
        | TransferError::Cancelled => Verdict::Terminal,
    }
}
