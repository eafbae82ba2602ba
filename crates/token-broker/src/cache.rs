use device_auth::AuthData;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Empty,
    Valid,
}

/// Holds zero or one token believed current. Has no notion of expiry time;
/// the owner decides when to [`TokenCache::expire`] it.
#[derive(Debug, Default)]
pub struct TokenCache {
    current: Option<AuthData>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CacheState {
        if self.current.is_some() {
            CacheState::Valid
        } else {
            CacheState::Empty
        }
    }

    pub fn get(&self) -> Option<&AuthData> {
        self.current.as_ref()
    }

    /// Store a freshly obtained token. An empty token empties the cache.
    pub fn store(&mut self, data: AuthData) {
        self.current = if data.is_empty() { None } else { Some(data) };
    }

    /// Drop the cached token. Returns whether one was held.
    pub fn expire(&mut self) -> bool {
        self.current.take().is_some()
    }
}
