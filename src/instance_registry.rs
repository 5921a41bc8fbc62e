//! Instance registry (spec §4.1).
//!
//! Parses `instance-<id>` / `merchant-account-<name>` configuration sections,
//! loads each instance's signing key, attaches the wire methods it honors,
//! and exposes the lookups every other subsystem needs. Built the same way
//! `multi_evm.rs`'s `MultiEvmConfig` is: validate once at startup, then hand
//! out an immutable, already-checked collection.

use eyre::{bail, eyre, Result, WrapErr};
use serde_json::Value;
use std::collections::HashMap;

use crate::config::{AccountSection, Config, InstanceSection};
use crate::crypto::MerchantKeypair;
use crate::hash::hash_json_canonical;
use crate::types::{HashCode, PublicKey32};

/// A wire method owned by an instance (spec §3).
#[derive(Debug, Clone)]
pub struct WireMethod {
    pub name: String,
    pub details: Value,
    pub h_wire: HashCode,
    pub active: bool,
}

/// A named merchant identity (spec §3).
pub struct Instance {
    pub id: String,
    pub name: String,
    keypair: MerchantKeypair,
    /// Active methods precede inactive ones (spec §3 invariant).
    pub wire_methods: Vec<WireMethod>,
}

impl Instance {
    pub fn public_key(&self) -> PublicKey32 {
        self.keypair.public_key()
    }

    pub fn keypair(&self) -> &MerchantKeypair {
        &self.keypair
    }

    /// The instance's preferred wire method, if it has any active ones.
    pub fn preferred_wire_method(&self) -> Option<&WireMethod> {
        self.wire_methods.iter().find(|m| m.active)
    }
}

pub struct InstanceRegistry {
    instances: Vec<Instance>,
    by_id: HashMap<String, usize>,
    by_pubkey: HashMap<PublicKey32, usize>,
}

impl InstanceRegistry {
    /// Build the registry from configuration, per spec §4.1's startup
    /// contract failure modes (a)-(f).
    pub fn load(config: &Config) -> Result<Self> {
        if config.instances.is_empty() {
            bail!("ConfigError: no instance-* sections defined");
        }

        let mut instances = Vec::with_capacity(config.instances.len());
        for section in &config.instances {
            instances.push(build_instance(section, &config.accounts, &config.merchant.wireformat)?);
        }

        if !instances.iter().any(|i| i.id.eq_ignore_ascii_case("default")) {
            bail!("ConfigError: no `default` instance is defined (failure mode e)");
        }

        let mut by_id = HashMap::new();
        let mut by_pubkey = HashMap::new();
        for (idx, instance) in instances.iter().enumerate() {
            let key = instance.id.to_lowercase();
            if by_id.insert(key, idx).is_some() {
                bail!("ConfigError: duplicate instance id {:?}", instance.id);
            }
            if by_pubkey.insert(instance.public_key(), idx).is_some() {
                bail!(
                    "ConfigError: instance {:?} shares a public key with another instance",
                    instance.id
                );
            }
            if instance.wire_methods.iter().all(|m| !m.active) {
                bail!(
                    "ConfigError: instance {:?} has zero active wire methods (failure mode f)",
                    instance.id
                );
            }
        }

        Ok(Self {
            instances,
            by_id,
            by_pubkey,
        })
    }

    /// Case-insensitive; absent or empty `id` resolves to `default`.
    pub fn lookup_by_id(&self, id: Option<&str>) -> Option<&Instance> {
        let key = match id {
            None => "default".to_string(),
            Some(s) if s.is_empty() => "default".to_string(),
            Some(s) => s.to_lowercase(),
        };
        self.by_id.get(&key).map(|&idx| &self.instances[idx])
    }

    pub fn lookup_by_pubkey(&self, pubkey: &PublicKey32) -> Option<&Instance> {
        self.by_pubkey.get(pubkey).map(|&idx| &self.instances[idx])
    }

    pub fn iterate(&self) -> impl Iterator<Item = &Instance> {
        self.instances.iter()
    }
}

fn build_instance(
    section: &InstanceSection,
    accounts: &[AccountSection],
    wireformat: &str,
) -> Result<Instance> {
    if section.name.is_empty() {
        bail!(
            "ConfigError: instance-{} lacks NAME (failure mode a)",
            section.id
        );
    }

    let keypair = MerchantKeypair::load_or_create(&section.keyfile, 0o600).wrap_err_with(|| {
        format!(
            "ConfigError: instance-{} keyfile is present but unreadable (failure mode b)",
            section.id
        )
    })?;

    let mut wire_methods = Vec::new();
    for account in accounts {
        let honors = account
            .honor
            .iter()
            .any(|h| h.eq_ignore_ascii_case(&section.id));
        if !honors {
            continue;
        }
        if account.payto_uri.is_empty() {
            bail!(
                "ConfigError: merchant-account-{} lacks PAYTO_URI (failure mode c)",
                account.name
            );
        }
        let active = account
            .active
            .iter()
            .any(|a| a.eq_ignore_ascii_case(&section.id));
        let method = load_wire_method(account, wireformat, active)?;
        wire_methods.push(method);
    }

    // Active methods precede inactive ones; stable within each group.
    wire_methods.sort_by_key(|m| !m.active);

    Ok(Instance {
        id: section.id.clone(),
        name: section.name.clone(),
        keypair,
        wire_methods,
    })
}

/// Load (or bootstrap) the wire-response file for one account, verifying it
/// agrees with the configured payto URI, and computing `H_wire` from the
/// exact bytes persisted to disk (spec §4.1 invariant).
fn load_wire_method(account: &AccountSection, wireformat: &str, active: bool) -> Result<WireMethod> {
    let details = if account.wire_response.exists() {
        let bytes = std::fs::read(&account.wire_response).wrap_err_with(|| {
            format!(
                "failed to read wire-response file {}",
                account.wire_response.display()
            )
        })?;
        let value: Value = serde_json::from_slice(&bytes).wrap_err_with(|| {
            format!(
                "wire-response file {} is not valid JSON",
                account.wire_response.display()
            )
        })?;
        let on_disk_payto = value.get("payto_uri").and_then(Value::as_str);
        if on_disk_payto != Some(account.payto_uri.as_str()) {
            bail!(
                "ConfigError: wire-response file {} disagrees with configured PAYTO_URI (failure mode d)",
                account.wire_response.display()
            );
        }
        value
    } else {
        bootstrap_wire_response(account, wireformat)?
    };

    let h_wire = hash_json_canonical(&details)?;

    Ok(WireMethod {
        name: wireformat.to_string(),
        details,
        h_wire,
        active,
    })
}

fn bootstrap_wire_response(account: &AccountSection, wireformat: &str) -> Result<Value> {
    if let Some(parent) = account.wire_response.parent() {
        std::fs::create_dir_all(parent)
            .wrap_err_with(|| format!("failed to create {}", parent.display()))?;
    }

    let mut salt_bytes = [0u8; 16];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut salt_bytes);
    let salt = data_encoding::BASE32_NOPAD
        .encode(&salt_bytes)
        .to_ascii_lowercase();

    let value = serde_json::json!({
        "wire_method": wireformat,
        "payto_uri": account.payto_uri,
        "salt": salt,
    });

    let bytes = serde_json::to_vec_pretty(&value)
        .map_err(|e| eyre!("failed to serialize wire-response file: {e}"))?;
    std::fs::write(&account.wire_response, &bytes).wrap_err_with(|| {
        format!(
            "failed to write wire-response file {}",
            account.wire_response.display()
        )
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(
            &account.wire_response,
            std::fs::Permissions::from_mode(account.wire_file_mode),
        )
        .wrap_err_with(|| {
            format!(
                "failed to chmod wire-response file {}",
                account.wire_response.display()
            )
        })?;
    }

    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AccountSection, InstanceSection};
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!(
            "taler-merchant-core-instreg-test-{}-{}",
            std::process::id(),
            name
        ));
        p
    }

    #[test]
    fn lookup_by_id_defaults_on_empty_or_absent() {
        let instance_id = "default";
        let keyfile = temp_path("reg1-key");
        let wire_response = temp_path("reg1-wire");
        let _ = std::fs::remove_file(&keyfile);
        let _ = std::fs::remove_file(&wire_response);

        let section = InstanceSection {
            id: instance_id.to_string(),
            name: "Default Shop".to_string(),
            keyfile: keyfile.clone(),
        };
        let account = AccountSection {
            name: "main".to_string(),
            payto_uri: "payto://x-taler-bank/bank/acct".to_string(),
            wire_response: wire_response.clone(),
            wire_file_mode: 0o600,
            honor: vec!["default".to_string()],
            active: vec!["default".to_string()],
        };

        let config_instances = vec![section];
        let config_accounts = vec![account];
        let instance = build_instance(&config_instances[0], &config_accounts, "x-taler-bank").unwrap();
        assert_eq!(instance.id, "default");
        assert!(instance.preferred_wire_method().is_some());

        let _ = std::fs::remove_file(&keyfile);
        let _ = std::fs::remove_file(&wire_response);
    }

    #[test]
    fn instance_with_no_active_methods_has_none_preferred() {
        let keyfile = temp_path("reg2-key");
        let wire_response = temp_path("reg2-wire");
        let _ = std::fs::remove_file(&keyfile);
        let _ = std::fs::remove_file(&wire_response);

        let section = InstanceSection {
            id: "shop2".to_string(),
            name: "Shop Two".to_string(),
            keyfile: keyfile.clone(),
        };
        let account = AccountSection {
            name: "inactive-acct".to_string(),
            payto_uri: "payto://x-taler-bank/bank/acct2".to_string(),
            wire_response: wire_response.clone(),
            wire_file_mode: 0o600,
            honor: vec!["shop2".to_string()],
            active: vec![],
        };

        let instance = build_instance(&section, &[account], "x-taler-bank").unwrap();
        assert!(instance.preferred_wire_method().is_none());

        let _ = std::fs::remove_file(&keyfile);
        let _ = std::fs::remove_file(&wire_response);
    }
}
