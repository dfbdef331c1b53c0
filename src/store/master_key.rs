use std::fmt;

/// Secret used only to derive the at-rest encryption key
///
/// Never serialized; `Debug` does not reveal the bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct MasterKey(Vec<u8>);

impl MasterKey {
    pub fn new(key: impl AsRef<[u8]>) -> Self {
        Self(key.as_ref().to_vec())
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Fallback key material for configs written without an explicit key
    ///
    /// Bound to the strategy and the local machine, so it only protects against
    /// casually copying the file elsewhere.
    pub(crate) fn machine_default(strategy: &str) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self(format!("collabauth:{}:{}", strategy, host).into_bytes())
    }
}

impl From<&str> for MasterKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for MasterKey {
    fn from(key: String) -> Self {
        Self(key.into_bytes())
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(***)")
    }
}
