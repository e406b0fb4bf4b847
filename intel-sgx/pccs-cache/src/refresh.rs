/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/.
 */

//! Bulk re-synchronization of the cache with upstream.
//!
//! A refresh first downloads everything it is going to replace and only then
//! writes, in a single transaction. Any upstream failure aborts the refresh
//! before the store is touched.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use log::{debug, error, info};

use crate::cache::fill::{self, CertSetDownload, TcbInfoDownload};
use crate::cache::Collaborators;
use crate::policy::CachingPolicy;
use crate::store::with_transaction;
use crate::types::{CertificateId, PckCertRequest, Platform, PlatformKey};
use crate::{Error, Result};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RefreshScope {
    /// Re-fetches the certificate sets of cached platforms, optionally only
    /// those of the given fmspcs, and re-selects every known raw TCB.
    Certificates { fmspcs: Option<Vec<String>> },
    /// Re-fetches CRLs, TCB infos, enclave identities, the root CA CRL and
    /// CRLs cached by URL.
    Collateral,
}

#[derive(Clone)]
pub struct RefreshEngine {
    env: Collaborators,
    policy: Arc<dyn CachingPolicy>,
}

fn unavailable(what: &str, e: Error) -> Error {
    match e {
        Error::NoCacheData | Error::PlatformUnknown => {
            Error::ServiceUnavailable(format!("failed to refresh {}: {}", what, e).into())
        }
        e => e,
    }
}

impl RefreshEngine {
    pub fn new(env: Collaborators, policy: Arc<dyn CachingPolicy>) -> Self {
        RefreshEngine { env, policy }
    }

    pub fn refresh(&self, scope: &RefreshScope) -> Result<()> {
        if !self.policy.is_refreshable() {
            return Err(Error::ServiceUnavailable(
                format!("refresh is not available with the {:?} caching policy", self.policy).into(),
            ));
        }
        match scope {
            RefreshScope::Certificates { fmspcs } => self.refresh_certificates(fmspcs.as_ref().map(|f| &f[..])),
            RefreshScope::Collateral => self.refresh_collateral(),
        }
    }

    /// Refresh run by the scheduler. Failures are logged, not returned. A
    /// policy that does not refresh is skipped quietly. Returns whether a
    /// refresh was attempted.
    pub fn scheduled_refresh(&self, scope: &RefreshScope) -> bool {
        if !self.policy.is_refreshable() {
            debug!("Skipping scheduled {:?} refresh with the {:?} caching policy", scope, self.policy);
            return false;
        }
        match self.refresh(scope) {
            Ok(()) => info!("Scheduled {:?} refresh completed", scope),
            Err(e) => error!("Scheduled {:?} refresh failed: {}", scope, e),
        }
        true
    }

    fn refresh_certificates(&self, fmspcs: Option<&[String]>) -> Result<()> {
        let env = &self.env;
        let fmspcs: Option<BTreeSet<String>> = fmspcs.map(|f| f.iter().map(|f| f.to_lowercase()).collect());

        let platforms: BTreeMap<PlatformKey, Platform> = with_transaction(&*env.store, |tx| {
            let mut platforms = BTreeMap::new();
            for mapping in tx.all_tcb_mappings()? {
                if platforms.contains_key(&mapping.key) {
                    continue;
                }
                if let Some(platform) = tx.platform(&mapping.key)? {
                    platforms.insert(mapping.key, platform);
                }
            }
            Ok(platforms)
        })?;
        let platforms = platforms.into_iter().filter(|(_, platform)| match (&fmspcs, &platform.fmspc) {
            (None, _) => true,
            (Some(filter), Some(fmspc)) => filter.contains(fmspc),
            (Some(_), None) => false,
        });

        let mut cert_sets: Vec<CertSetDownload> = vec![];
        let mut tcb_infos: BTreeMap<String, Vec<TcbInfoDownload>> = BTreeMap::new();
        for (key, platform) in platforms {
            let download = fill::download_cert_set(env, &PckCertRequest::for_platform(&platform))
                .map_err(|e| unavailable(&format!("the certificates of {}", key), e))?;
            if download.certs.is_empty() {
                return Err(Error::ServiceUnavailable(
                    format!("upstream returned no certificates for {}", key).into(),
                ));
            }
            if !tcb_infos.contains_key(&download.fmspc) {
                let downloads = fill::download_tcb_infos(env, &download.fmspc)
                    .map_err(|e| unavailable(&format!("the TCB info of {}", download.fmspc), e))?;
                tcb_infos.insert(download.fmspc.clone(), downloads);
            }
            cert_sets.push(download);
        }

        with_transaction(&*env.store, |tx| {
            for tcb_info in tcb_infos.values().flatten() {
                fill::store_tcb_info(tx, tcb_info)?;
            }
            for cert_set in &cert_sets {
                fill::store_cert_set(tx, env, cert_set, &[])?;
            }
            Ok(())
        })
        .map_err(|e| unavailable("the certificates of cached platforms", e))?;
        info!("Refreshed the certificates of {} platforms", cert_sets.len());
        Ok(())
    }

    fn refresh_collateral(&self) -> Result<()> {
        let env = &self.env;
        let (crls, tcb_infos, identities, root, urls) = with_transaction(&*env.store, |tx| {
            Ok((
                tx.pck_crls()?.into_iter().map(|crl| crl.ca).collect::<Vec<_>>(),
                tx.tcb_infos()?.into_iter().map(|t| t.key).collect::<Vec<_>>(),
                tx.enclave_identities()?
                    .into_iter()
                    .map(|i| (i.kind, i.version))
                    .collect::<Vec<_>>(),
                tx.pcs_certificate(CertificateId::Root)?,
                tx.cached_crls()?.into_iter().map(|c| c.url).collect::<Vec<_>>(),
            ))
        })?;

        let crls = crls
            .into_iter()
            .map(|ca| fill::download_pck_crl(env, ca).map_err(|e| unavailable(&format!("the {} PCK CRL", ca.as_query()), e)))
            .collect::<Result<Vec<_>>>()?;
        let tcb_infos = tcb_infos
            .into_iter()
            .map(|key| {
                fill::download_tcb_info(env, key.product, &key.fmspc, key.version)
                    .map_err(|e| unavailable(&format!("the TCB info of {}", key.fmspc), e))
            })
            .collect::<Result<Vec<_>>>()?;
        let identities = identities
            .into_iter()
            .map(|(kind, version)| {
                fill::download_enclave_identity(env, kind, version)
                    .map_err(|e| unavailable(&format!("the {:?} identity", kind), e))
            })
            .collect::<Result<Vec<_>>>()?;
        let root_crl = match &root {
            Some(root) => Some(fill::download_root_crl(env, root).map_err(|e| unavailable("the root CA CRL", e))?),
            None => None,
        };
        let cached_crls = urls
            .iter()
            .map(|url| fill::download_crl(env, url).map_err(|e| unavailable(url, e)))
            .collect::<Result<Vec<_>>>()?;

        with_transaction(&*env.store, |tx| {
            for crl in &crls {
                fill::store_pck_crl(tx, crl)?;
            }
            for tcb_info in &tcb_infos {
                fill::store_tcb_info(tx, tcb_info)?;
            }
            for identity in &identities {
                fill::store_enclave_identity(tx, identity)?;
            }
            if let Some(crl) = &root_crl {
                fill::store_root_crl(tx, crl.clone())?;
            }
            for entry in &cached_crls {
                tx.upsert_cached_crl(entry.clone())?;
            }
            Ok(())
        })?;
        info!(
            "Refreshed {} PCK CRLs, {} TCB infos, {} enclave identities and {} cached CRLs",
            crls.len(),
            tcb_infos.len(),
            identities.len(),
            cached_crls.len()
        );
        Ok(())
    }
}

/// Runs [`RefreshEngine::scheduled_refresh`] on a cron schedule, on a thread
/// of its own.
pub struct RefreshScheduler {
    stop: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl RefreshScheduler {
    pub fn start(engine: RefreshEngine, schedule: Schedule, scope: RefreshScope) -> Self {
        let (stop, stopped) = mpsc::channel();
        let handle = thread::spawn(move || loop {
            let next = match schedule.upcoming(Utc).next() {
                Some(next) => next,
                None => {
                    info!("Refresh schedule has no upcoming runs");
                    return;
                }
            };
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::from_secs(0));
            debug!("Next refresh at {}", next);
            match stopped.recv_timeout(wait) {
                Err(RecvTimeoutError::Timeout) => {
                    engine.scheduled_refresh(&scope);
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            }
        });
        RefreshScheduler { stop, handle }
    }

    /// Stops the scheduler. A refresh in progress is completed first.
    pub fn stop(self) {
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            error!("Refresh scheduler thread panicked");
        }
    }
}
