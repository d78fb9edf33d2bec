//! Authorization strategy for permissioned deployments.
//!
//! A fixed capability interface with concrete strategy objects, selected once
//! at process start from [`Config`] and passed by reference to the execution
//! layer. No ambient lookup, no runtime feature probing.

use crate::Config;
use anyhow::{anyhow, Context as _, Result};
use commonware_codec::ReadExt;
use commonware_cryptography::ed25519::PublicKey;
use commonware_utils::from_hex;
use std::collections::BTreeSet;

/// Predicate gating shuffling creation. Opaque to the core.
pub trait Authorizer: Send + Sync {
    fn is_allowed(&self, account: &PublicKey) -> bool;
}

/// Default strategy when the permissioned feature is disabled.
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn is_allowed(&self, _: &PublicKey) -> bool {
        true
    }
}

/// Locked-down strategy; useful while a deployment's allow list is staged.
pub struct DenyAll;

impl Authorizer for DenyAll {
    fn is_allowed(&self, _: &PublicKey) -> bool {
        false
    }
}

/// Allow a fixed set of creator accounts.
pub struct AllowList {
    allowed: BTreeSet<PublicKey>,
}

impl AllowList {
    pub fn new(allowed: impl IntoIterator<Item = PublicKey>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
        }
    }
}

impl Authorizer for AllowList {
    fn is_allowed(&self, account: &PublicKey) -> bool {
        self.allowed.contains(account)
    }
}

/// Build the deployment's authorizer from chain parameters: open deployments
/// get [`AllowAll`]; permissioned deployments get the configured allow list,
/// or [`DenyAll`] while it is empty.
pub fn authorizer_from_config(config: &Config) -> Result<Box<dyn Authorizer>> {
    if !config.permissioned {
        return Ok(Box::new(AllowAll));
    }
    if config.allowed_creators.is_empty() {
        return Ok(Box::new(DenyAll));
    }
    let mut allowed = Vec::with_capacity(config.allowed_creators.len());
    for entry in &config.allowed_creators {
        let bytes = from_hex(entry)
            .ok_or_else(|| anyhow!("invalid hex in allowed_creators entry {entry}"))?;
        let key = PublicKey::read(&mut bytes.as_slice())
            .with_context(|| format!("invalid public key in allowed_creators entry {entry}"))?;
        allowed.push(key);
    }
    Ok(Box::new(AllowList::new(allowed)))
}
