//! One-time selection of process-wide commit settings

use crate::cell::AtomicCell;
use crate::htm;
use oc_core::config::{AtomicConfig, HtmMode};
use oc_core::error::AtomicError;
use once_cell::sync::OnceCell;

static CAPABILITIES: OnceCell<Capabilities> = OnceCell::new();

/// Active commit settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// The CPU reports restricted transactional memory
    pub htm_supported: bool,
    /// Multi-cell commits try the hardware path first
    pub htm_enabled: bool,
    /// The double-word compare-and-swap is lock-free
    pub dcas_lock_free: bool,
    pub htm_retries: u32,
    pub pool_spin_limit: u32,
}

impl Capabilities {
    fn detect(config: &AtomicConfig) -> Self {
        let htm_supported = htm::rtm_supported();
        Self {
            htm_supported,
            htm_enabled: htm_supported && config.htm == HtmMode::Auto,
            dcas_lock_free: AtomicCell::is_lock_free(),
            htm_retries: config.htm_retries,
            pool_spin_limit: config.pool_spin_limit,
        }
    }
}

fn install(wanted: Capabilities) -> &'static Capabilities {
    CAPABILITIES.get_or_init(|| {
        tracing::debug!(
            "atomic commit: htm supported={} enabled={}, dcas lock-free={}",
            wanted.htm_supported,
            wanted.htm_enabled,
            wanted.dcas_lock_free
        );
        if !wanted.dcas_lock_free {
            tracing::warn!("128-bit compare-and-swap is emulated with a lock on this machine");
        }
        wanted
    })
}

/// Select the commit settings before first use.
///
/// Calling it again with the same settings is a no-op; different settings
/// are rejected once any commit or earlier `init` has fixed them.
pub fn init(config: &AtomicConfig) -> Result<Capabilities, AtomicError> {
    let wanted = Capabilities::detect(config);
    let active = *install(wanted);
    if active == wanted {
        Ok(active)
    } else {
        Err(AtomicError::AlreadyInitialized)
    }
}

/// Active settings, initializing with defaults if `init` was never called
#[inline]
pub fn capabilities() -> Capabilities {
    match CAPABILITIES.get() {
        Some(caps) => *caps,
        None => *install(Capabilities::detect(&AtomicConfig::default())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_fixed_once() {
        let active = capabilities();
        assert_eq!(capabilities(), active);
        assert!(!active.htm_enabled || active.htm_supported);

        let different = AtomicConfig {
            htm_retries: active.htm_retries + 1,
            ..AtomicConfig::default()
        };
        assert_eq!(init(&different), Err(AtomicError::AlreadyInitialized));
    }
}
