// SPDX-License-Identifier: MIT OR Apache-2.0

//! Creating the key hierarchy: a primary storage key and a signing key under it

use log::info;
use std::path::PathBuf;

use crate::config::{Config, KeyPolicy};
use crate::context::{ContextBlob, ContextOps};
use crate::error::{Error, Result};
use crate::object::{ObjectOps, RsaPublicArea};
use crate::store;
use crate::transport::Connector;
use crate::TPM_RH_OWNER;

/// Where the provisioner writes the two saved contexts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleFiles {
    pub primary: PathBuf,
    pub key: PathBuf,
}

impl HandleFiles {
    pub fn new(primary: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        Self {
            primary: primary.into(),
            key: key.into(),
        }
    }
}

impl From<&Config> for HandleFiles {
    fn from(config: &Config) -> Self {
        Self::new(&config.primary_handle_file, &config.key_handle_file)
    }
}

/// Outcome of a successful provisioning run
#[derive(Debug, Clone)]
pub struct ProvisionedKey {
    /// Saved primary context, kept for inspection only
    pub primary: ContextBlob,
    /// Saved signing key context
    pub signing: ContextBlob,
    /// Public area of the signing key as returned by TPM2_Create
    pub public: RsaPublicArea,
}

/// Creates a fresh signing key according to a [`KeyPolicy`]
pub struct Provisioner<'a, C: Connector + ?Sized> {
    connector: &'a C,
    policy: &'a KeyPolicy,
}

impl<'a, C: Connector + ?Sized> Provisioner<'a, C> {
    pub fn new(connector: &'a C, policy: &'a KeyPolicy) -> Self {
        Self { connector, policy }
    }

    /// Run the provisioning sequence, writing both contexts to `files`
    ///
    /// Steps run strictly in order and the first failure aborts the rest.
    /// A failed context save is reported like a failure to create the object
    /// being saved.
    /// Files written before a failure are left in place. Any handle still
    /// loaded when a step fails is flushed as the session is dropped.
    pub fn provision(&self, files: &HandleFiles) -> Result<ProvisionedKey> {
        let policy = self.policy;
        let pcrs = &policy.pcr_selection;
        let mut tpm = self.connector.connect()?;

        let primary = tpm
            .create_primary(TPM_RH_OWNER, &RsaPublicArea::storage_primary(policy.primary_key_bits), pcrs)
            .map_err(Error::tpm("create primary", Error::Provisioning))?;
        info!("Created primary key 0x{:08X}", primary.handle);

        let primary_context = tpm
            .context_save(primary.handle)
            .map_err(Error::tpm("save primary context", Error::Provisioning))?;
        store::save_context(&files.primary, &primary_context)?;
        info!("Saved primary context to {}", files.primary.display());

        let template = RsaPublicArea::signing_key(policy.signing_key_bits, policy.scheme);
        let created = tpm
            .create(primary.handle, &template, pcrs)
            .map_err(Error::tpm("create signing key", Error::KeyCreation))?;
        info!("Created {}-bit {} signing key", created.public.key_bits, policy.scheme);

        let key_handle = tpm
            .load(primary.handle, &created.private, &created.public)
            .map_err(Error::tpm("load signing key", |source| Error::Load {
                object: "signing key",
                source,
            }))?;

        let primary_handle = primary.handle;
        tpm.flush_context(primary_handle)
            .map_err(Error::tpm("flush primary", |source| Error::Flush {
                handle: primary_handle,
                source,
            }))?;

        let signing_context = tpm
            .context_save(key_handle)
            .map_err(Error::tpm("save signing key context", Error::KeyCreation))?;
        store::save_context(&files.key, &signing_context)?;
        info!("Saved signing key context to {}", files.key.display());

        tpm.flush_context(key_handle)
            .map_err(Error::tpm("flush signing key", |source| Error::Flush {
                handle: key_handle,
                source,
            }))?;

        tpm.close()?;

        Ok(ProvisionedKey {
            primary: primary_context,
            signing: signing_context,
            public: created.public,
        })
    }
}
