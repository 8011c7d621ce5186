use std::fmt;
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};

pub const ID_HEX_LEN: usize = 40;

/// Cache identifier of an origin URL: lowercase hex SHA-1 of the raw URL bytes.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Id(String);

impl Id {
    pub fn derive(url: &str) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(url.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `<root>/<first two>/<last two>/<id>`.
    pub fn wpath(&self, root: &Path) -> PathBuf {
        let hash = self.as_str();
        root.join(&hash[0..2])
            .join(&hash[hash.len() - 2..])
            .join(hash)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
