/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/.
 */

//! Transactional storage of cached collateral.
//!
//! All access goes through [`CollateralStore::transaction`]. A transaction
//! either commits as a whole when its body returns `Ok`, or leaves the store
//! untouched when the body returns an error.

use crate::types::{
    CaType, CertificateId, CrlCacheEntry, EnclaveIdentity, EnclaveIdentityKind, FmspcTcbInfo, PckCertificate, PckCrl,
    PcsCertificate, PendingRegistration, Platform, PlatformKey, PlatformTcbMapping, RawTcb, RegistrationState,
    TcbInfoKey,
};
use crate::{Error, Result};

mod memory;

pub use self::memory::MemoryStore;

pub trait CollateralStore: Send + Sync {
    /// Runs `work` in a transaction. Changes are committed iff `work` returns
    /// `Ok`.
    fn transaction(&self, work: &mut dyn FnMut(&mut dyn Transaction) -> Result<()>) -> Result<()>;
}

/// Runs `work` in a transaction on `store` and returns its output.
pub fn with_transaction<T, F>(store: &dyn CollateralStore, work: F) -> Result<T>
where
    F: FnOnce(&mut dyn Transaction) -> Result<T>,
{
    let mut work = Some(work);
    let mut output = None;
    store.transaction(&mut |tx: &mut dyn Transaction| {
        let work = work
            .take()
            .ok_or_else(|| Error::internal("transaction body invoked twice"))?;
        output = Some(work(tx)?);
        Ok(())
    })?;
    output.ok_or_else(|| Error::internal("transaction body was not invoked"))
}

/// Keyed access to the cached entities within one transaction.
pub trait Transaction {
    fn platform(&self, key: &PlatformKey) -> Result<Option<Platform>>;
    fn platforms(&self) -> Result<Vec<Platform>>;
    fn upsert_platform(&mut self, platform: Platform) -> Result<()>;

    fn tcb_mapping(&self, key: &PlatformKey, raw_tcb: &RawTcb) -> Result<Option<PlatformTcbMapping>>;
    fn tcb_mappings(&self, key: &PlatformKey) -> Result<Vec<PlatformTcbMapping>>;
    fn all_tcb_mappings(&self) -> Result<Vec<PlatformTcbMapping>>;
    fn upsert_tcb_mapping(&mut self, mapping: PlatformTcbMapping) -> Result<()>;
    fn delete_tcb_mappings(&mut self, key: &PlatformKey) -> Result<()>;

    fn pck_cert(&self, key: &PlatformKey, tcbm: &str) -> Result<Option<PckCertificate>>;
    fn pck_certs(&self, key: &PlatformKey) -> Result<Vec<PckCertificate>>;
    fn insert_pck_cert(&mut self, cert: PckCertificate) -> Result<()>;
    fn delete_pck_certs(&mut self, key: &PlatformKey) -> Result<()>;

    fn tcb_info(&self, key: &TcbInfoKey) -> Result<Option<FmspcTcbInfo>>;
    fn tcb_infos(&self) -> Result<Vec<FmspcTcbInfo>>;
    fn upsert_tcb_info(&mut self, tcb_info: FmspcTcbInfo) -> Result<()>;

    fn enclave_identity(&self, kind: EnclaveIdentityKind, version: u16) -> Result<Option<EnclaveIdentity>>;
    fn enclave_identities(&self) -> Result<Vec<EnclaveIdentity>>;
    fn upsert_enclave_identity(&mut self, identity: EnclaveIdentity) -> Result<()>;

    fn pck_crl(&self, ca: CaType) -> Result<Option<PckCrl>>;
    fn pck_crls(&self) -> Result<Vec<PckCrl>>;
    fn upsert_pck_crl(&mut self, crl: PckCrl) -> Result<()>;

    fn pcs_certificate(&self, id: CertificateId) -> Result<Option<PcsCertificate>>;
    fn upsert_pcs_certificate(&mut self, cert: PcsCertificate) -> Result<()>;

    fn cached_crl(&self, url: &str) -> Result<Option<CrlCacheEntry>>;
    fn cached_crls(&self) -> Result<Vec<CrlCacheEntry>>;
    fn upsert_cached_crl(&mut self, entry: CrlCacheEntry) -> Result<()>;

    fn registration(&self, key: &PlatformKey, raw_tcb: &RawTcb) -> Result<Option<PendingRegistration>>;
    /// Registrations in `state`, or all registrations for `None`.
    fn registrations(&self, state: Option<RegistrationState>) -> Result<Vec<PendingRegistration>>;
    fn upsert_registration(&mut self, registration: PendingRegistration) -> Result<()>;
}
