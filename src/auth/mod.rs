//! Provider identities and API key resolution.
//!
//! Keys for one generation are resolved through a fixed fallback chain:
//! a runtime-injected key wins over the legacy per-profile key table,
//! which wins over the system vault. The bag is read-only from the
//! session core; nothing here performs network I/O.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;

use keyring::Entry;

const KEYRING_SERVICE: &str = "parley";

/// The set of chat backends the client can route a generation to.
///
/// Each variant carries its own auth mode and endpoint defaults; the
/// local `Ollama` backend never requires a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    OpenAi,
    Anthropic,
    Gemini,
    Ollama,
}

impl Provider {
    pub const ALL: [Provider; 4] = [
        Provider::OpenAi,
        Provider::Anthropic,
        Provider::Gemini,
        Provider::Ollama,
    ];

    pub fn id(self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Gemini => "gemini",
            Provider::Ollama => "ollama",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Provider::OpenAi => "OpenAI",
            Provider::Anthropic => "Anthropic",
            Provider::Gemini => "Gemini",
            Provider::Ollama => "Ollama",
        }
    }

    /// Default OpenAI-compatible endpoint root for the provider.
    pub fn default_base_url(self) -> &'static str {
        match self {
            Provider::OpenAi => "https://api.openai.com/v1",
            Provider::Anthropic => "https://api.anthropic.com/v1",
            Provider::Gemini => "https://generativelanguage.googleapis.com/v1beta/openai",
            Provider::Ollama => "http://localhost:11434/v1",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Provider::OpenAi => "gpt-4o-mini",
            Provider::Anthropic => "claude-sonnet-4-5",
            Provider::Gemini => "gemini-2.0-flash",
            Provider::Ollama => "llama3.2",
        }
    }

    /// True for remote providers that reject unauthenticated requests.
    pub fn requires_api_key(self) -> bool {
        !matches!(self, Provider::Ollama)
    }

    /// Anthropic authenticates with `x-api-key` plus a version header
    /// instead of the usual bearer token.
    pub fn uses_anthropic_auth(self) -> bool {
        matches!(self, Provider::Anthropic)
    }

    pub fn from_id(id: &str) -> Option<Provider> {
        match id.to_lowercase().as_str() {
            "openai" => Some(Provider::OpenAi),
            "anthropic" => Some(Provider::Anthropic),
            "gemini" => Some(Provider::Gemini),
            "ollama" => Some(Provider::Ollama),
            _ => None,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// A provider/model pair selecting where one generation is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub provider: Provider,
    pub model: String,
}

impl Route {
    pub fn new(provider: Provider, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }
}

/// Describes failures when accessing the system keyring.
///
/// Recoverable errors indicate the credential backend was temporarily
/// unavailable (for example a locked keychain service). Permanent
/// errors surface the underlying cause directly.
#[derive(Debug)]
pub enum VaultAccessError {
    Recoverable(keyring::Error),
    Permanent(keyring::Error),
}

impl VaultAccessError {
    fn inner(&self) -> &keyring::Error {
        match self {
            VaultAccessError::Recoverable(err) | VaultAccessError::Permanent(err) => err,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, VaultAccessError::Recoverable(_))
    }
}

impl From<keyring::Error> for VaultAccessError {
    fn from(err: keyring::Error) -> Self {
        match err {
            keyring::Error::PlatformFailure(_) | keyring::Error::NoStorageAccess(_) => {
                VaultAccessError::Recoverable(err)
            }
            other => VaultAccessError::Permanent(other),
        }
    }
}

impl fmt::Display for VaultAccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner())
    }
}

impl Error for VaultAccessError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.inner())
    }
}

/// Read-only credential source backing the last link of the key chain.
pub trait KeyVault {
    fn get_key(&self, provider: Provider) -> Result<Option<String>, VaultAccessError>;
}

/// Vault backed by the platform keyring.
pub struct SystemKeyVault;

impl SystemKeyVault {
    pub fn store_key(&self, provider: Provider, key: &str) -> Result<(), VaultAccessError> {
        let entry = Entry::new(KEYRING_SERVICE, provider.id())?;
        entry.set_password(key)?;
        Ok(())
    }

    pub fn remove_key(&self, provider: Provider) -> Result<(), VaultAccessError> {
        let entry = Entry::new(KEYRING_SERVICE, provider.id())?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl KeyVault for SystemKeyVault {
    fn get_key(&self, provider: Provider) -> Result<Option<String>, VaultAccessError> {
        let entry = Entry::new(KEYRING_SERVICE, provider.id())?;
        match entry.get_password() {
            Ok(key) => Ok(Some(key)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Merged per-provider key sources with a fixed precedence order:
/// runtime-injected key, then the legacy profile key table, then the
/// vault. Never mutated by the session core.
#[derive(Default)]
pub struct KeyBag {
    runtime: HashMap<Provider, String>,
    profile: HashMap<Provider, String>,
    vault: Option<Box<dyn KeyVault>>,
    /// Lets requests proceed without a key for remote providers. Meant
    /// for offline and test setups where no real call will be made.
    pub allow_missing_key: bool,
}

impl KeyBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_vault(mut self, vault: Box<dyn KeyVault>) -> Self {
        self.vault = Some(vault);
        self
    }

    pub fn set_runtime_key(&mut self, provider: Provider, key: impl Into<String>) {
        self.runtime.insert(provider, key.into());
    }

    pub fn set_profile_key(&mut self, provider: Provider, key: impl Into<String>) {
        self.profile.insert(provider, key.into());
    }

    /// Resolve the key for a provider through the fallback chain.
    /// Vault outages are logged and treated as a miss; resolution is a
    /// pure read either way.
    pub fn resolve(&self, provider: Provider) -> Option<String> {
        if let Some(key) = self.runtime.get(&provider) {
            return Some(key.clone());
        }
        if let Some(key) = self.profile.get(&provider) {
            return Some(key.clone());
        }
        match self.vault.as_ref().map(|v| v.get_key(provider)) {
            Some(Ok(key)) => key,
            Some(Err(err)) => {
                tracing::debug!(provider = provider.id(), %err, "vault lookup failed");
                None
            }
            None => None,
        }
    }
}

#[cfg(test)]
pub(crate) struct StaticVault(pub HashMap<Provider, String>);

#[cfg(test)]
impl KeyVault for StaticVault {
    fn get_key(&self, provider: Provider) -> Result<Option<String>, VaultAccessError> {
        Ok(self.0.get(&provider).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault_with(provider: Provider, key: &str) -> Box<dyn KeyVault> {
        let mut map = HashMap::new();
        map.insert(provider, key.to_string());
        Box::new(StaticVault(map))
    }

    #[test]
    fn provider_ids_round_trip() {
        for provider in Provider::ALL {
            assert_eq!(Provider::from_id(provider.id()), Some(provider));
        }
        assert_eq!(Provider::from_id("OpenAI"), Some(Provider::OpenAi));
        assert_eq!(Provider::from_id("mystery"), None);
    }

    #[test]
    fn only_ollama_skips_api_keys() {
        assert!(!Provider::Ollama.requires_api_key());
        assert!(Provider::OpenAi.requires_api_key());
        assert!(Provider::Anthropic.requires_api_key());
        assert!(Provider::Gemini.requires_api_key());
    }

    #[test]
    fn runtime_key_wins_over_profile_and_vault() {
        let mut bag = KeyBag::new().with_vault(vault_with(Provider::OpenAi, "vault-key"));
        bag.set_profile_key(Provider::OpenAi, "profile-key");
        bag.set_runtime_key(Provider::OpenAi, "runtime-key");

        assert_eq!(bag.resolve(Provider::OpenAi).as_deref(), Some("runtime-key"));
    }

    #[test]
    fn profile_key_wins_over_vault() {
        let mut bag = KeyBag::new().with_vault(vault_with(Provider::Gemini, "vault-key"));
        bag.set_profile_key(Provider::Gemini, "profile-key");

        assert_eq!(bag.resolve(Provider::Gemini).as_deref(), Some("profile-key"));
    }

    #[test]
    fn vault_is_the_last_resort() {
        let bag = KeyBag::new().with_vault(vault_with(Provider::Anthropic, "vault-key"));

        assert_eq!(bag.resolve(Provider::Anthropic).as_deref(), Some("vault-key"));
        assert_eq!(bag.resolve(Provider::OpenAi), None);
    }
}
