//! Remote credentials in the OS credential store.
//!
//! On Windows this uses the Credential Manager (via the `keyring` crate), on
//! macOS Keychain, and on Linux the Secret Service API. Only the remote API
//! key is sensitive; everything else lives in `local_settings`.

use keyring::Entry;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::error::{Result, SyncError};

const SERVICE_NAME: &str = "pos-offline-sync";

pub const KEY_API_KEY: &str = "remote_api_key";

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential. Returns `None` when the entry does not
/// exist or the platform store is unavailable.
pub fn get_credential(key: &str) -> Option<Zeroizing<String>> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(Zeroizing::new(pw)),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

pub fn set_credential(key: &str, value: &str) -> Result<()> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(keyring_error)?;
    entry.set_password(value).map_err(keyring_error)?;
    Ok(())
}

/// Delete a credential. Succeeds if the entry does not exist.
pub fn delete_credential(key: &str) -> Result<()> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(keyring_error)?;
    match entry.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(keyring_error(e)),
    }
}

fn keyring_error(e: keyring::Error) -> SyncError {
    SyncError::Config(format!("credential store: {e}"))
}

// ---------------------------------------------------------------------------
// High-level API
// ---------------------------------------------------------------------------

pub fn api_key() -> Option<Zeroizing<String>> {
    get_credential(KEY_API_KEY).filter(|k| !k.trim().is_empty())
}

/// Store the remote API key received during onboarding.
pub fn store_api_key(api_key: &str) -> Result<()> {
    let api_key = api_key.trim();
    if api_key.is_empty() {
        return Err(SyncError::Invalid("API key is empty".into()));
    }
    set_credential(KEY_API_KEY, api_key)?;
    info!("Remote API key stored in credential store");
    Ok(())
}

/// Forget the stored API key (terminal unpaired).
pub fn clear_api_key() -> Result<()> {
    delete_credential(KEY_API_KEY)?;
    info!("Remote API key removed from credential store");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_api_key_is_rejected_before_touching_the_store() {
        assert!(matches!(store_api_key("   "), Err(SyncError::Invalid(_))));
    }
}
