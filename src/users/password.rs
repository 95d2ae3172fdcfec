use std::fmt;

use tracing::error;

/// A bcrypt digest. Only [`PasswordHasher::hash`] and the credential store
/// (when loading rows) can produce one, so plaintext never ends up stored.
#[derive(Clone, PartialEq, Eq)]
pub struct PasswordHash(String);

impl PasswordHash {
    pub(crate) fn from_stored(digest: String) -> Self {
        Self(digest)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PasswordHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PasswordHash(..)")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PasswordHasher {
    cost: u32,
}

impl PasswordHasher {
    pub fn new(cost: u32) -> Self {
        Self { cost }
    }

    pub fn hash(&self, plain: &str) -> anyhow::Result<PasswordHash> {
        let digest = bcrypt::hash(plain, self.cost).map_err(|e| {
            error!(error = %e, "bcrypt hash error");
            anyhow::anyhow!(e)
        })?;
        Ok(PasswordHash(digest))
    }

    pub fn verify(&self, plain: &str, hash: &PasswordHash) -> anyhow::Result<bool> {
        bcrypt::verify(plain, hash.as_str()).map_err(|e| {
            error!(error = %e, "bcrypt verify error");
            anyhow::anyhow!(e)
        })
    }
}
