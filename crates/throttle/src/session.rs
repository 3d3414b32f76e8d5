//! Session identity and traffic direction.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Direction of a storage operation. Traffic is tracked and throttled
/// independently per direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Read => "read",
            Direction::Write => "write",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a storage-service client session.
///
/// The throttling registry accepts any hashable key; this type is provided for
/// clients that address an account endpoint and a container with a shared key.
/// Only a digest of the credential is kept, so the key can be logged freely.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct StorageSession {
    endpoint: String,
    container: String,
    credential_fingerprint: [u8; 32],
}

impl StorageSession {
    pub fn new(
        endpoint: impl Into<String>,
        credential: impl AsRef<[u8]>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            container: container.into(),
            credential_fingerprint: *blake3::hash(credential.as_ref()).as_bytes(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    /// Short hex prefix of the credential digest.
    pub fn fingerprint(&self) -> String {
        self.credential_fingerprint[..4]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

impl fmt::Debug for StorageSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}#{}",
            self.endpoint,
            self.container,
            self.fingerprint()
        )
    }
}

impl fmt::Display for StorageSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_display() {
        assert_eq!(Direction::Read.to_string(), "read");
        assert_eq!(Direction::Write.to_string(), "write");
    }

    #[test]
    fn test_session_identity_includes_credential() {
        let a = StorageSession::new("acct.dfs.core.windows.net", "key-a", "fs");
        let b = StorageSession::new("acct.dfs.core.windows.net", "key-a", "fs");
        let c = StorageSession::new("acct.dfs.core.windows.net", "key-b", "fs");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_session_debug_hides_credential() {
        let session = StorageSession::new("acct.dfs.core.windows.net", "dGVzdFN0cmluZw==", "fs");
        let rendered = format!("{session:?}");
        assert!(rendered.starts_with("acct.dfs.core.windows.net/fs#"));
        assert!(!rendered.contains("dGVzdFN0cmluZw=="));
        assert_eq!(session.fingerprint().len(), 8);
    }
}
