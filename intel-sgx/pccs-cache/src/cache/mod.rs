/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/.
 */

use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, info};
use rustc_serialize::hex::FromHex;
use serde::{Deserialize, Serialize};

use crate::policy::CachingPolicy;
use crate::refresh::RefreshEngine;
use crate::selector::PckCertSelector;
use crate::store::{with_transaction, CollateralStore};
use crate::types::{
    CaType, CertificateId, Collateral, EnclaveIdentityKind, PckCertRequest, PckCertResult, PckCertificate,
    PendingRegistration, Platform, PlatformKey, PlatformRegistration, ProductType, RawTcb, RegistrationState,
    TcbInfoKey,
};
use crate::upstream::{parse_issuer_chain, UpstreamClient};
use crate::{Error, Result};

pub mod fill;

use self::fill::{CertSetDownload, EnclaveIdentityDownload, PckCrlDownload, TcbInfoDownload};

/// The collaborators shared by the cache, the policies and the refresh engine.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn CollateralStore>,
    pub upstream: Arc<dyn UpstreamClient>,
    pub selector: Arc<dyn PckCertSelector>,
    /// Where the root CA CRL is fetched from when the root certificate names
    /// no distribution point.
    pub root_ca_crl_url: String,
}

/// Request-time access to cached collateral.
#[derive(Clone)]
pub struct CollateralCache {
    env: Collaborators,
    policy: Arc<dyn CachingPolicy>,
}

impl CollateralCache {
    pub fn new(env: Collaborators, policy: Arc<dyn CachingPolicy>) -> Self {
        CollateralCache { env, policy }
    }

    pub fn policy(&self) -> &dyn CachingPolicy {
        &*self.policy
    }

    pub fn refresh_engine(&self) -> RefreshEngine {
        RefreshEngine::new(self.env.clone(), self.policy.clone())
    }

    /// Looks up the PCK certificate of a platform at a raw TCB level.
    ///
    /// Unknown platforms are handed to the policy. For known platforms a
    /// previously mapped raw TCB is served from the cache. Otherwise a
    /// certificate is selected from the cached set, and the selection is
    /// remembered.
    pub fn get_pck_cert(&self, request: &PckCertRequest) -> Result<PckCertResult> {
        let key = request.key();
        if key.device_id.is_empty() {
            return Err(Error::invalid_request("qeid is required"));
        }
        key.pce_id_value()?;
        let raw_tcb = request.raw_tcb()?;

        let platform = with_transaction(&*self.env.store, |tx| tx.platform(&key))?;
        if platform.is_none() {
            debug!("Platform {} not cached", key);
            return self.policy.fetch_pck_cert(&self.env, request);
        }
        let raw_tcb = match raw_tcb {
            Some(raw_tcb) => raw_tcb,
            None => return Ok(PckCertResult::default()),
        };

        let env = &self.env;
        let result = with_transaction(&*env.store, |tx| {
            if let Some(hit) = fill::cached_pck_cert(&*tx, &key, &raw_tcb)? {
                return Ok(Some(hit));
            }
            fill::select_pck_cert(tx, env, &key, &raw_tcb, true)
        })?;
        result.ok_or(Error::NoCacheData)
    }

    pub fn get_pck_crl(&self, ca: CaType) -> Result<Collateral> {
        let cached = with_transaction(&*self.env.store, |tx| {
            let crl = match tx.pck_crl(ca)? {
                Some(crl) => crl,
                None => return Ok(None),
            };
            let chain = fill::resolve_issuer_chain(&*tx, &[crl.intermediate_cert, crl.root_cert])?;
            Ok(chain.map(|issuer_chain| Collateral {
                body: crl.crl,
                issuer_chain,
            }))
        })?;
        match cached {
            Some(collateral) => Ok(collateral),
            None => self.policy.fetch_pck_crl(&self.env, ca),
        }
    }

    pub fn get_tcb_info(&self, product: ProductType, fmspc: &str, version: u16) -> Result<Collateral> {
        if fmspc.from_hex().ok().map_or(true, |fmspc| fmspc.len() != 6) {
            return Err(Error::invalid_request("fmspc must be 6 hex encoded bytes"));
        }
        let key = TcbInfoKey::new(fmspc, product, version);
        let cached = with_transaction(&*self.env.store, |tx| {
            let tcb_info = match tx.tcb_info(&key)? {
                Some(tcb_info) => tcb_info,
                None => return Ok(None),
            };
            let chain = fill::resolve_issuer_chain(&*tx, &[tcb_info.signing_cert, tcb_info.root_cert])?;
            Ok(chain.map(|issuer_chain| Collateral {
                body: tcb_info.tcb_info.into_bytes(),
                issuer_chain,
            }))
        })?;
        match cached {
            Some(collateral) => Ok(collateral),
            None => self.policy.fetch_tcb_info(&self.env, product, &key.fmspc, version),
        }
    }

    pub fn get_enclave_identity(&self, kind: EnclaveIdentityKind, version: u16) -> Result<Collateral> {
        let cached = with_transaction(&*self.env.store, |tx| {
            let identity = match tx.enclave_identity(kind, version)? {
                Some(identity) => identity,
                None => return Ok(None),
            };
            let chain = fill::resolve_issuer_chain(&*tx, &[identity.signing_cert, identity.root_cert])?;
            Ok(chain.map(|issuer_chain| Collateral {
                body: identity.identity.into_bytes(),
                issuer_chain,
            }))
        })?;
        match cached {
            Some(collateral) => Ok(collateral),
            None => self.policy.fetch_enclave_identity(&self.env, kind, version),
        }
    }

    pub fn get_root_crl(&self) -> Result<Vec<u8>> {
        let cached = with_transaction(&*self.env.store, |tx| {
            Ok(tx.pcs_certificate(CertificateId::Root)?.and_then(|root| root.crl))
        })?;
        match cached {
            Some(crl) => Ok(crl),
            None => self.policy.fetch_root_crl(&self.env),
        }
    }

    pub fn get_crl_by_url(&self, url: &str) -> Result<Vec<u8>> {
        if url.is_empty() {
            return Err(Error::invalid_request("CRL url is required"));
        }
        let cached = with_transaction(&*self.env.store, |tx| tx.cached_crl(url))?;
        match cached {
            Some(entry) => Ok(entry.crl),
            None => self.policy.fetch_crl_by_url(&self.env, url),
        }
    }

    pub fn register_platform(&self, registration: &PlatformRegistration) -> Result<()> {
        let key = registration.key();
        if key.device_id.is_empty() {
            return Err(Error::invalid_request("qeid is required"));
        }
        key.pce_id_value()?;
        let raw_tcb = registration.raw_tcb();
        raw_tcb.validate()?;

        let already_cached = with_transaction(&*self.env.store, |tx| {
            Ok(tx.platform(&key)?.is_some() && tx.tcb_mapping(&key, &raw_tcb)?.is_some())
        })?;
        self.policy.register_platform(&self.env, already_cached, registration)
    }

    /// Registrations waiting to be collected.
    pub fn pending_registrations(&self) -> Result<Vec<PendingRegistration>> {
        with_transaction(&*self.env.store, |tx| tx.registrations(Some(RegistrationState::New)))
    }

    /// Marks the given `NEW` registrations as collected. Returns how many
    /// were marked.
    pub fn mark_registrations_collected(&self, registrations: &[(PlatformKey, RawTcb)]) -> Result<usize> {
        with_transaction(&*self.env.store, |tx| {
            let mut marked = 0;
            for (key, raw_tcb) in registrations {
                match tx.registration(key, raw_tcb)? {
                    Some(mut pending) if pending.state == RegistrationState::New => {
                        pending.state = RegistrationState::Deleted;
                        tx.upsert_registration(pending)?;
                        marked += 1;
                    }
                    _ => (),
                }
            }
            Ok(marked)
        })
    }

    /// Imports collateral gathered elsewhere, e.g. by the registration
    /// tooling of an offline deployment. All issuer chains of the bundle must
    /// end in the same root certificate.
    pub fn upload_platform_collateral(&self, bundle: &CollateralBundle) -> Result<UploadReport> {
        let upload = ParsedBundle::parse(bundle, self.env.upstream.tcb_info_version())?;
        let env = &self.env;

        let report = with_transaction(&*env.store, |tx| {
            for tcb_info in &upload.tcb_infos {
                fill::store_tcb_info(tx, tcb_info)?;
            }
            for crl in &upload.pck_crls {
                fill::store_pck_crl(tx, crl)?;
            }
            for identity in &upload.identities {
                fill::store_enclave_identity(tx, identity)?;
            }

            let mut report = UploadReport::default();
            for (platform, raw_tcbs) in &upload.platforms {
                fill::store_cert_set(tx, env, platform, &[])?;
                report.platforms += 1;
                for raw_tcb in raw_tcbs {
                    match fill::select_pck_cert(tx, env, &platform.platform.key, raw_tcb, true)? {
                        Some(_) => report.resolved += 1,
                        None => report.unresolved.push((platform.platform.key.clone(), raw_tcb.clone())),
                    }
                }
            }
            if let Some(crl) = &upload.root_ca_crl {
                fill::store_root_crl(tx, crl.clone())?;
            }
            Ok(report)
        })?;
        info!(
            "Uploaded {} platforms, {} raw TCBs resolved, {} unresolved",
            report.platforms,
            report.resolved,
            report.unresolved.len()
        );
        Ok(report)
    }
}

/// Collateral for offline deployments, in the format produced by the
/// platform registration tooling.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CollateralBundle {
    #[serde(default)]
    pub platforms: Vec<BundlePlatform>,
    #[serde(default)]
    pub tcb_infos: Vec<BundleTcbInfo>,
    #[serde(default)]
    pub pck_crls: Vec<BundlePckCrl>,
    #[serde(default)]
    pub enclave_identities: Vec<BundleEnclaveIdentity>,
    /// Hex encoded DER.
    pub root_ca_crl: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BundlePlatform {
    pub qe_id: String,
    pub pce_id: String,
    pub platform_manifest: Option<String>,
    pub enc_ppid: Option<String>,
    pub fmspc: String,
    pub ca: CaType,
    /// PEM encoded, root last.
    pub issuer_chain: String,
    pub certs: Vec<BundlePckCert>,
    /// Raw TCBs the platform was seen at.
    #[serde(default)]
    pub raw_tcbs: Vec<RawTcb>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BundlePckCert {
    pub tcbm: String,
    pub cert: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BundleTcbInfo {
    pub fmspc: String,
    pub product: ProductType,
    /// Defaults to the schema version of the configured upstream.
    pub version: Option<u16>,
    pub tcb_info: String,
    pub issuer_chain: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BundlePckCrl {
    pub ca: CaType,
    pub crl: String,
    pub issuer_chain: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BundleEnclaveIdentity {
    pub kind: EnclaveIdentityKind,
    pub version: u16,
    pub identity: String,
    pub issuer_chain: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub platforms: usize,
    pub resolved: usize,
    pub unresolved: Vec<(PlatformKey, RawTcb)>,
}

struct ParsedBundle {
    platforms: Vec<(CertSetDownload, Vec<RawTcb>)>,
    tcb_infos: Vec<TcbInfoDownload>,
    pck_crls: Vec<PckCrlDownload>,
    identities: Vec<EnclaveIdentityDownload>,
    root_ca_crl: Option<Vec<u8>>,
}

impl ParsedBundle {
    fn parse(bundle: &CollateralBundle, tcb_info_version: u16) -> Result<ParsedBundle> {
        let mut roots = HashSet::new();
        let mut chain = |pem: &str| -> Result<_> {
            let chain = parse_issuer_chain(pem).map_err(|_| Error::invalid_request("malformed issuer chain"))?;
            if let Some(root) = chain.root() {
                roots.insert(root.trim().to_owned());
            }
            Ok(chain)
        };

        let mut platforms = vec![];
        for p in &bundle.platforms {
            let key = PlatformKey::new(p.qe_id.as_str(), p.pce_id.as_str());
            key.pce_id_value()?;
            for raw_tcb in &p.raw_tcbs {
                raw_tcb.validate()?;
            }
            let certs = p
                .certs
                .iter()
                .map(|c| PckCertificate {
                    key: key.clone(),
                    tcbm: c.tcbm.to_lowercase(),
                    pck_cert: c.cert.clone(),
                })
                .collect();
            let fmspc = p.fmspc.to_lowercase();
            let download = CertSetDownload {
                platform: Platform {
                    key,
                    platform_manifest: p.platform_manifest.clone(),
                    enc_ppid: p.enc_ppid.clone(),
                    fmspc: Some(fmspc.clone()),
                    ca: Some(p.ca),
                },
                fmspc,
                ca: p.ca,
                issuer_chain: chain(&p.issuer_chain)?,
                certs,
                unavailable: vec![],
            };
            platforms.push((download, p.raw_tcbs.clone()));
        }

        let mut tcb_infos = vec![];
        for t in &bundle.tcb_infos {
            tcb_infos.push(TcbInfoDownload {
                key: TcbInfoKey::new(t.fmspc.as_str(), t.product, t.version.unwrap_or(tcb_info_version)),
                tcb_info: t.tcb_info.clone(),
                issuer_chain: chain(&t.issuer_chain)?,
            });
        }
        let mut pck_crls = vec![];
        for c in &bundle.pck_crls {
            pck_crls.push(PckCrlDownload {
                ca: c.ca,
                crl: c.crl.clone().into_bytes(),
                issuer_chain: chain(&c.issuer_chain)?,
            });
        }
        let mut identities = vec![];
        for i in &bundle.enclave_identities {
            identities.push(EnclaveIdentityDownload {
                kind: i.kind,
                version: i.version,
                identity: i.identity.clone(),
                issuer_chain: chain(&i.issuer_chain)?,
            });
        }
        let root_ca_crl = match &bundle.root_ca_crl {
            Some(crl) => Some(
                crl.from_hex()
                    .map_err(|_| Error::invalid_request("root CA CRL must be hex encoded"))?,
            ),
            None => None,
        };

        if roots.len() > 1 {
            return Err(Error::IntegrityError(
                format!("issuer chains end in {} different root certificates", roots.len()).into(),
            ));
        }
        Ok(ParsedBundle {
            platforms,
            tcb_infos,
            pck_crls,
            identities,
            root_ca_crl,
        })
    }
}
