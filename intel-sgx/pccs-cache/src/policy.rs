/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/.
 */

//! Caching policies decide what happens on a cache miss.
//!
//! | policy        | on a miss                  | platform registration                 | refresh |
//! |---------------|----------------------------|---------------------------------------|---------|
//! | [`Immediate`] | fetch from upstream        | fetched right away unless cached      | yes     |
//! | [`Deferred`]  | fetch from upstream        | queued as `NEW`, `DELETED` once fetched | yes   |
//! | [`Offline`]   | `NoCacheData`              | queued as `NEW`                       | no      |

use std::fmt::Debug;

use log::{info, warn};

use crate::cache::{fill, Collaborators};
use crate::store::with_transaction;
use crate::types::{
    CaType, Collateral, EnclaveIdentityKind, PckCertRequest, PckCertResult, PendingRegistration, PlatformRegistration,
    ProductType, RawTcb, RegistrationState,
};
use crate::{Error, Result};

pub trait CachingPolicy: Send + Sync + Debug {
    fn fetch_pck_cert(&self, _env: &Collaborators, _request: &PckCertRequest) -> Result<PckCertResult> {
        Err(Error::NoCacheData)
    }

    fn fetch_pck_crl(&self, _env: &Collaborators, _ca: CaType) -> Result<Collateral> {
        Err(Error::NoCacheData)
    }

    fn fetch_tcb_info(&self, _env: &Collaborators, _product: ProductType, _fmspc: &str, _version: u16) -> Result<Collateral> {
        Err(Error::NoCacheData)
    }

    fn fetch_enclave_identity(&self, _env: &Collaborators, _kind: EnclaveIdentityKind, _version: u16) -> Result<Collateral> {
        Err(Error::NoCacheData)
    }

    fn fetch_root_crl(&self, _env: &Collaborators) -> Result<Vec<u8>> {
        Err(Error::NoCacheData)
    }

    fn fetch_crl_by_url(&self, _env: &Collaborators, _url: &str) -> Result<Vec<u8>> {
        Err(Error::NoCacheData)
    }

    fn is_refreshable(&self) -> bool {
        true
    }

    /// `already_cached` is set when the platform and the mapping for the
    /// registered raw TCB are both cached.
    fn register_platform(&self, env: &Collaborators, already_cached: bool, registration: &PlatformRegistration) -> Result<()>;

    /// Whether the mapping selected for the requested raw TCB is kept, given
    /// whether upstream reported some of the platform's certificates as not
    /// available.
    fn should_persist_tcb_mapping(&self, _had_unavailable_certs: bool) -> bool {
        true
    }

    /// Called with the raw TCBs upstream has no certificate for.
    fn record_unavailable_tcbs(&self, _env: &Collaborators, _request: &PckCertRequest, _tcbs: &[RawTcb]) -> Result<()> {
        Ok(())
    }
}

macro_rules! fetch_from_upstream {
    () => {
        fn fetch_pck_cert(&self, env: &Collaborators, request: &PckCertRequest) -> Result<PckCertResult> {
            fill::fetch_pck_cert_from_upstream(env, self, request)
        }

        fn fetch_pck_crl(&self, env: &Collaborators, ca: CaType) -> Result<Collateral> {
            fill::fetch_pck_crl(env, ca)
        }

        fn fetch_tcb_info(&self, env: &Collaborators, product: ProductType, fmspc: &str, version: u16) -> Result<Collateral> {
            fill::fetch_tcb_info(env, product, fmspc, version)
        }

        fn fetch_enclave_identity(&self, env: &Collaborators, kind: EnclaveIdentityKind, version: u16) -> Result<Collateral> {
            fill::fetch_enclave_identity(env, kind, version)
        }

        fn fetch_root_crl(&self, env: &Collaborators) -> Result<Vec<u8>> {
            fill::fetch_root_crl(env)
        }

        fn fetch_crl_by_url(&self, env: &Collaborators, url: &str) -> Result<Vec<u8>> {
            fill::fetch_crl_by_url(env, url)
        }
    };
}

fn enqueue(env: &Collaborators, registration: PendingRegistration) -> Result<()> {
    with_transaction(&*env.store, |tx| tx.upsert_registration(registration))
}

/// Fetches from upstream whenever something is missing.
#[derive(Clone, Copy, Debug, Default)]
pub struct Immediate;

impl CachingPolicy for Immediate {
    fetch_from_upstream!();

    fn register_platform(&self, env: &Collaborators, already_cached: bool, registration: &PlatformRegistration) -> Result<()> {
        if already_cached {
            return Ok(());
        }
        self.fetch_pck_cert(env, &PckCertRequest::from(registration)).map(|_| ())
    }
}

/// Fetches from upstream on a miss, and keeps track of registered platforms
/// for later collection.
#[derive(Clone, Copy, Debug, Default)]
pub struct Deferred;

impl CachingPolicy for Deferred {
    fetch_from_upstream!();

    fn register_platform(&self, env: &Collaborators, already_cached: bool, registration: &PlatformRegistration) -> Result<()> {
        if already_cached {
            return Ok(());
        }
        // The NEW row is committed on its own, so it outlives a failed fetch
        enqueue(env, registration.pending(RegistrationState::New))?;
        match self.fetch_pck_cert(env, &PckCertRequest::from(registration)) {
            Ok(_) => enqueue(env, registration.pending(RegistrationState::Deleted)),
            Err(e) => {
                warn!("Registered platform {} could not be fetched yet: {}", registration.key(), e);
                Err(e)
            }
        }
    }

    fn should_persist_tcb_mapping(&self, had_unavailable_certs: bool) -> bool {
        !had_unavailable_certs
    }

    fn record_unavailable_tcbs(&self, env: &Collaborators, request: &PckCertRequest, tcbs: &[RawTcb]) -> Result<()> {
        let key = request.key();
        info!("Upstream has no certificate for {} TCB levels of {}", tcbs.len(), key);
        with_transaction(&*env.store, |tx| {
            for raw_tcb in tcbs {
                tx.upsert_registration(PendingRegistration {
                    key: key.clone(),
                    raw_tcb: raw_tcb.clone(),
                    enc_ppid: request.enc_ppid.clone(),
                    platform_manifest: request.platform_manifest.clone(),
                    state: RegistrationState::NotAvailable,
                })?;
            }
            Ok(())
        })
    }
}

/// Never contacts upstream. The cache is filled by bulk uploads.
#[derive(Clone, Copy, Debug, Default)]
pub struct Offline;

impl CachingPolicy for Offline {
    fn is_refreshable(&self) -> bool {
        false
    }

    fn register_platform(&self, env: &Collaborators, already_cached: bool, registration: &PlatformRegistration) -> Result<()> {
        if already_cached {
            return Ok(());
        }
        enqueue(env, registration.pending(RegistrationState::New))
    }
}
