//! Prefetcher/listener plugin surface.
//!
//! Only the trait and the null implementation live here; concrete
//! prefetchers are external plugins resolved by name at init.

use crate::config::ConfigError;
use crate::Address;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessRecord {
    pub addr: Address,
    pub base_addr: Address,
    pub write: bool,
    pub hit: bool,
}

pub trait CacheListener {
    fn on_access(&mut self, _access: &AccessRecord) {}
    fn on_evict(&mut self, _base_addr: Address) {}
}

/// Listener that ignores everything; selected by an empty plugin name.
#[derive(Debug, Default)]
pub struct NullListener;

impl CacheListener for NullListener {}

/// Resolve a listener by plugin name. An unknown name is fatal at init.
pub fn from_name(name: &str) -> Result<Box<dyn CacheListener>, ConfigError> {
    match name {
        "" => Ok(Box::new(NullListener)),
        other => Err(ConfigError::UnknownPrefetcher(other.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_name_selects_null_listener() {
        assert!(from_name("").is_ok());
    }

    #[test]
    fn unknown_plugin_is_fatal() {
        assert!(matches!(
            from_name("stride"),
            Err(ConfigError::UnknownPrefetcher(_))
        ));
    }
}
