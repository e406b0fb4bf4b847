/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/.
 */

//! Filling the cache from upstream.
//!
//! Downloads and writes are separate steps: the `download_*` functions only
//! talk to upstream, the `store_*` functions only write within a transaction.
//! This keeps upstream calls out of store transactions, and lets the refresh
//! engine fetch everything before it writes anything.

use log::{debug, warn};
use pkix::oid;
use pkix::pem::{self, PEM_CERTIFICATE};
use pkix::x509::GenericCertificate;
use pkix::FromBer;
use yasna::{ASN1Error, ASN1ErrorKind, ASN1Result, Tag};

use super::Collaborators;
use crate::policy::CachingPolicy;
use crate::store::{with_transaction, Transaction};
use crate::types::{
    CaType, CertificateId, Collateral, CrlCacheEntry, EnclaveIdentity, EnclaveIdentityKind, FmspcTcbInfo, IssuerChain,
    PckCertRequest, PckCertResult, PckCertificate, PckCrl, PcsCertificate, Platform, PlatformKey, PlatformTcbMapping,
    ProductType, RawTcb, TcbInfoKey,
};
use crate::upstream::{
    PckCertSet, PckCertsQuery, StatusCode, UpstreamResponse, ENCLAVE_ID_ISSUER_CHAIN_HEADER,
    PCK_CRL_ISSUER_CHAIN_HEADER,
};
use crate::{Error, Result};

/// A platform's certificate set as returned by upstream.
#[derive(Clone, Debug)]
pub struct CertSetDownload {
    pub platform: Platform,
    pub fmspc: String,
    pub ca: CaType,
    pub issuer_chain: IssuerChain,
    pub certs: Vec<PckCertificate>,
    /// Raw TCBs upstream has no certificate for.
    pub unavailable: Vec<RawTcb>,
}

#[derive(Clone, Debug)]
pub struct TcbInfoDownload {
    pub key: TcbInfoKey,
    pub tcb_info: String,
    pub issuer_chain: IssuerChain,
}

#[derive(Clone, Debug)]
pub struct PckCrlDownload {
    pub ca: CaType,
    pub crl: Vec<u8>,
    pub issuer_chain: IssuerChain,
}

#[derive(Clone, Debug)]
pub struct EnclaveIdentityDownload {
    pub kind: EnclaveIdentityKind,
    pub version: u16,
    pub identity: String,
    pub issuer_chain: IssuerChain,
}

fn expect_success(response: &UpstreamResponse, what: &str) -> Result<()> {
    if response.status.is_success() {
        Ok(())
    } else {
        warn!("Upstream returned {:?} for {}", response.status, what);
        Err(Error::NoCacheData)
    }
}

/// Fetches the certificate set of the platform in `request`. The platform
/// manifest takes precedence over the encrypted PPID. Without either (or with
/// an all-zero encrypted PPID) upstream is not contacted. Any non-success
/// status, including upstream not knowing the platform, is `NoCacheData`.
pub fn download_cert_set(env: &Collaborators, request: &PckCertRequest) -> Result<CertSetDownload> {
    let key = request.key();
    let platform_manifest = request.platform_manifest.as_ref().filter(|pm| !pm.is_empty());
    let enc_ppid = request.enc_ppid.as_ref().filter(|_| request.has_usable_enc_ppid());
    let query = match (platform_manifest, enc_ppid) {
        (Some(platform_manifest), _) => PckCertsQuery::PlatformManifest {
            platform_manifest: platform_manifest.clone(),
            pce_id: key.pce_id.clone(),
        },
        (None, Some(enc_ppid)) => PckCertsQuery::EncryptedPpid {
            enc_ppid: enc_ppid.clone(),
            pce_id: key.pce_id.clone(),
        },
        (None, None) => {
            debug!("No usable platform identity for {}, not asking upstream", key);
            return Err(Error::NoCacheData);
        }
    };

    let response = env.upstream.pck_certs(&query)?;
    expect_success(&response, &format!("the PCK certificates of {}", key))?;

    let set = PckCertSet::parse(&response)?;
    let fmspc = set.fmspc.clone();
    let ca = set.ca;
    let issuer_chain = set.issuer_chain.clone();
    let (available, unavailable) = set.partition();
    let unavailable = unavailable
        .iter()
        .map(|tcbm| RawTcb::from_tcbm(tcbm))
        .collect::<Result<Vec<_>>>()?;
    let certs = available
        .into_iter()
        .map(|(tcbm, pck_cert)| PckCertificate {
            key: key.clone(),
            tcbm,
            pck_cert,
        })
        .collect();

    Ok(CertSetDownload {
        platform: Platform {
            key,
            platform_manifest: platform_manifest.cloned(),
            enc_ppid: enc_ppid.cloned(),
            fmspc: Some(fmspc.clone()),
            ca: Some(ca),
        },
        fmspc,
        ca,
        issuer_chain,
        certs,
        unavailable,
    })
}

fn tcb_info_download(product: ProductType, fmspc: &str, version: u16, response: UpstreamResponse) -> Result<TcbInfoDownload> {
    expect_success(&response, &format!("{:?} TCB info of fmspc {}", product, fmspc))?;
    Ok(TcbInfoDownload {
        key: TcbInfoKey::new(fmspc, product, version),
        tcb_info: response.body_string()?,
        issuer_chain: response.tcb_info_issuer_chain()?,
    })
}

pub fn download_tcb_info(env: &Collaborators, product: ProductType, fmspc: &str, version: u16) -> Result<TcbInfoDownload> {
    let response = env.upstream.tcb_info(product, fmspc, version)?;
    tcb_info_download(product, fmspc, version, response)
}

/// The SGX TCB info of `fmspc` at the current schema version, followed by the
/// TDX one when upstream publishes TDX collateral. A platform without a TDX
/// TCB info (404) is not TDX capable; any other failure is an error.
pub fn download_tcb_infos(env: &Collaborators, fmspc: &str) -> Result<Vec<TcbInfoDownload>> {
    let version = env.upstream.tcb_info_version();
    let mut downloads = vec![download_tcb_info(env, ProductType::Sgx, fmspc, version)?];
    if env.upstream.serves_tdx() {
        let response = env.upstream.tcb_info(ProductType::Tdx, fmspc, version)?;
        if response.status == StatusCode::NotFound {
            debug!("No TDX TCB info for fmspc {}", fmspc);
        } else {
            downloads.push(tcb_info_download(ProductType::Tdx, fmspc, version, response)?);
        }
    }
    Ok(downloads)
}

pub fn download_pck_crl(env: &Collaborators, ca: CaType) -> Result<PckCrlDownload> {
    let response = env.upstream.pck_crl(ca)?;
    expect_success(&response, &format!("the {} PCK CRL", ca.as_query()))?;
    Ok(PckCrlDownload {
        ca,
        issuer_chain: response.issuer_chain(PCK_CRL_ISSUER_CHAIN_HEADER)?,
        crl: response.body,
    })
}

pub fn download_enclave_identity(env: &Collaborators, kind: EnclaveIdentityKind, version: u16) -> Result<EnclaveIdentityDownload> {
    let response = env.upstream.enclave_identity(kind, version)?;
    expect_success(&response, &format!("{:?} identity v{}", kind, version))?;
    Ok(EnclaveIdentityDownload {
        kind,
        version,
        identity: response.body_string()?,
        issuer_chain: response.issuer_chain(ENCLAVE_ID_ISSUER_CHAIN_HEADER)?,
    })
}

pub fn download_crl(env: &Collaborators, url: &str) -> Result<CrlCacheEntry> {
    let response = env.upstream.fetch_url(url)?;
    expect_success(&response, url)?;
    Ok(CrlCacheEntry {
        url: url.to_owned(),
        crl: response.body,
    })
}

/// The root CA CRL, from the distribution point named in the cached root
/// certificate, or from `env.root_ca_crl_url` when it names none.
pub fn download_root_crl(env: &Collaborators, root: &PcsCertificate) -> Result<Vec<u8>> {
    let url = root
        .crl_distribution_point
        .as_ref()
        .unwrap_or(&env.root_ca_crl_url);
    Ok(download_crl(env, url)?.crl)
}

/// Returns the first URI of the certificate's CRL distribution points.
pub fn crl_distribution_point(cert: &str) -> Option<String> {
    let der = pem::pem_to_der(cert, Some(PEM_CERTIFICATE))?;
    let cert = GenericCertificate::from_ber(&der).ok()?;
    let extension = cert
        .tbscert
        .get_extension(oid::NAME_TO_OID.get("crlDistributionPoints")?)?;
    match distribution_point_uris(&extension.value) {
        Ok(uris) => uris.into_iter().next(),
        Err(e) => {
            debug!("Malformed CRL distribution points extension: {}", e);
            None
        }
    }
}

/// The `uniformResourceIdentifier`s among the full names of a DER encoded
/// `CRLDistributionPoints`, in order.
fn distribution_point_uris(der: &[u8]) -> ASN1Result<Vec<String>> {
    let mut uris = vec![];
    yasna::parse_der(der, |reader| {
        reader.read_sequence_of(|reader| {
            reader.read_sequence(|reader| {
                // distributionPoint [0] DistributionPointName OPTIONAL
                let names = reader.read_optional(|reader| {
                    reader.read_tagged(Tag::context(0), |reader| {
                        // fullName [0] GeneralNames, or nameRelativeToCRLIssuer [1]
                        if reader.lookahead_tag()? != Tag::context(0) {
                            reader.read_der()?;
                            return Ok(vec![]);
                        }
                        reader.read_tagged_implicit(Tag::context(0), |reader| {
                            let mut names = vec![];
                            reader.read_sequence_of(|reader| {
                                if reader.lookahead_tag()? != Tag::context(6) {
                                    return reader.read_der().map(|_| ());
                                }
                                let uri = reader.read_tagged_implicit(Tag::context(6), |reader| reader.read_bytes())?;
                                names.push(String::from_utf8(uri).map_err(|_| ASN1Error::new(ASN1ErrorKind::Invalid))?);
                                Ok(())
                            })?;
                            Ok(names)
                        })
                    })
                })?;
                uris.extend(names.into_iter().flatten());
                // reasons [1], cRLIssuer [2]
                while reader.read_optional(|reader| reader.read_der())?.is_some() {}
                Ok(())
            })
        })
    })?;
    Ok(uris)
}

fn upsert_pcs_certificate(tx: &mut dyn Transaction, id: CertificateId, cert: &str) -> Result<()> {
    let existing = tx.pcs_certificate(id)?;
    // A CRL only stays valid for the certificate it was fetched for
    let crl = existing.filter(|existing| existing.cert == cert).and_then(|existing| existing.crl);
    tx.upsert_pcs_certificate(PcsCertificate {
        id,
        cert: cert.to_owned(),
        crl,
        crl_distribution_point: crl_distribution_point(cert),
    })
}

/// Writes the fragments of `chain`: its first certificate into `leaf_ca`, its
/// last into the root slot.
pub fn store_issuer_chain(tx: &mut dyn Transaction, leaf_ca: CertificateId, chain: &IssuerChain) -> Result<()> {
    match (chain.0.first(), chain.root()) {
        (Some(leaf), Some(root)) if chain.0.len() >= 2 => {
            upsert_pcs_certificate(tx, leaf_ca, leaf)?;
            upsert_pcs_certificate(tx, CertificateId::Root, root)
        }
        _ => Err(Error::internal(format!(
            "issuer chain for {:?} has {} certificates, expected at least 2",
            leaf_ca,
            chain.0.len()
        ))),
    }
}

/// Resolves an issuer chain from its fragments. `None` if any of them is not
/// cached.
pub fn resolve_issuer_chain(tx: &dyn Transaction, ids: &[CertificateId]) -> Result<Option<IssuerChain>> {
    let mut chain = Vec::with_capacity(ids.len());
    for id in ids {
        match tx.pcs_certificate(*id)? {
            Some(cert) => chain.push(cert.cert),
            None => return Ok(None),
        }
    }
    Ok(Some(IssuerChain(chain)))
}

pub fn store_tcb_info(tx: &mut dyn Transaction, download: &TcbInfoDownload) -> Result<()> {
    store_issuer_chain(tx, CertificateId::TcbSigning, &download.issuer_chain)?;
    tx.upsert_tcb_info(FmspcTcbInfo {
        key: download.key.clone(),
        tcb_info: download.tcb_info.clone(),
        root_cert: CertificateId::Root,
        signing_cert: CertificateId::TcbSigning,
    })
}

pub fn store_pck_crl(tx: &mut dyn Transaction, download: &PckCrlDownload) -> Result<()> {
    store_issuer_chain(tx, download.ca.intermediate_cert(), &download.issuer_chain)?;
    tx.upsert_pck_crl(PckCrl {
        ca: download.ca,
        crl: download.crl.clone(),
        root_cert: CertificateId::Root,
        intermediate_cert: download.ca.intermediate_cert(),
    })
}

pub fn store_enclave_identity(tx: &mut dyn Transaction, download: &EnclaveIdentityDownload) -> Result<()> {
    store_issuer_chain(tx, CertificateId::TcbSigning, &download.issuer_chain)?;
    tx.upsert_enclave_identity(EnclaveIdentity {
        kind: download.kind,
        version: download.version,
        identity: download.identity.clone(),
        root_cert: CertificateId::Root,
        signing_cert: CertificateId::TcbSigning,
    })
}

/// Attaches `crl` to the cached root certificate.
pub fn store_root_crl(tx: &mut dyn Transaction, crl: Vec<u8>) -> Result<()> {
    let mut root = tx.pcs_certificate(CertificateId::Root)?.ok_or(Error::NoCacheData)?;
    root.crl = Some(crl);
    tx.upsert_pcs_certificate(root)
}

/// Replaces the platform's certificate set and re-selects a certificate for
/// every raw TCB that was mapped before the replacement. Fails with
/// `NoCacheData` if any of them no longer resolves, so that the transaction
/// keeps the previous set and mappings.
pub fn store_cert_set(
    tx: &mut dyn Transaction,
    env: &Collaborators,
    download: &CertSetDownload,
    tcb_infos: &[TcbInfoDownload],
) -> Result<()> {
    let key = &download.platform.key;
    let previous = tx.tcb_mappings(key)?;

    let mut platform = download.platform.clone();
    if let Some(existing) = tx.platform(key)? {
        platform.platform_manifest = platform.platform_manifest.or(existing.platform_manifest);
        platform.enc_ppid = platform.enc_ppid.or(existing.enc_ppid);
    }
    tx.upsert_platform(platform)?;

    tx.delete_pck_certs(key)?;
    for cert in &download.certs {
        tx.insert_pck_cert(cert.clone())?;
    }
    tx.delete_tcb_mappings(key)?;
    for tcb_info in tcb_infos {
        store_tcb_info(tx, tcb_info)?;
    }
    store_issuer_chain(tx, download.ca.intermediate_cert(), &download.issuer_chain)?;

    for mapping in previous {
        if select_pck_cert(tx, env, key, &mapping.raw_tcb, true)?.is_none() {
            warn!("{} of platform {} no longer resolves to a PCK certificate", mapping.raw_tcb, key);
            return Err(Error::NoCacheData);
        }
    }
    Ok(())
}

/// The cached PCK certificate mapped to `raw_tcb`, if it and its issuer chain
/// are fully cached.
pub fn cached_pck_cert(tx: &dyn Transaction, key: &PlatformKey, raw_tcb: &RawTcb) -> Result<Option<PckCertResult>> {
    let mapping = match tx.tcb_mapping(key, raw_tcb)? {
        Some(mapping) => mapping,
        None => return Ok(None),
    };
    let cert = match tx.pck_cert(key, &mapping.tcbm)? {
        Some(cert) => cert,
        None => return Ok(None),
    };
    let platform = match tx.platform(key)? {
        Some(platform) => platform,
        None => return Ok(None),
    };
    let ca = match platform.ca {
        Some(ca) => ca,
        None => return Ok(None),
    };
    let issuer_chain = match resolve_issuer_chain(tx, &[ca.intermediate_cert(), CertificateId::Root])? {
        Some(chain) => chain,
        None => return Ok(None),
    };
    Ok(Some(PckCertResult {
        tcbm: Some(cert.tcbm),
        fmspc: platform.fmspc,
        ca: Some(ca),
        issuer_chain,
        pck_cert: Some(cert.pck_cert),
    }))
}

/// Selects among the platform's cached certificates, using the cached SGX TCB
/// info of its fmspc. With `persist`, the selection is recorded as the
/// platform's mapping for `raw_tcb`.
pub fn select_pck_cert(
    tx: &mut dyn Transaction,
    env: &Collaborators,
    key: &PlatformKey,
    raw_tcb: &RawTcb,
    persist: bool,
) -> Result<Option<PckCertResult>> {
    let platform = match tx.platform(key)? {
        Some(platform) => platform,
        None => return Ok(None),
    };
    let (fmspc, ca) = match (platform.fmspc, platform.ca) {
        (Some(fmspc), Some(ca)) => (fmspc, ca),
        _ => return Ok(None),
    };
    let tcb_info_key = TcbInfoKey::new(fmspc.as_str(), ProductType::Sgx, env.upstream.tcb_info_version());
    let tcb_info = match tx.tcb_info(&tcb_info_key)? {
        Some(tcb_info) => tcb_info,
        None => {
            debug!("No SGX TCB info cached for fmspc {}", fmspc);
            return Ok(None);
        }
    };
    let certs = tx.pck_certs(key)?;
    let candidates: Vec<String> = certs.iter().map(|cert| cert.pck_cert.clone()).collect();

    let selected = env.selector.select(
        &raw_tcb.cpu_svn_bytes()?,
        raw_tcb.pce_svn_value()?,
        key.pce_id_value()?,
        &tcb_info.tcb_info,
        &candidates,
    );
    let cert = match selected.and_then(|idx| certs.into_iter().nth(idx)) {
        Some(cert) => cert,
        None => {
            debug!("No PCK certificate of {} matches {}", key, raw_tcb);
            return Ok(None);
        }
    };
    let issuer_chain = match resolve_issuer_chain(&*tx, &[ca.intermediate_cert(), CertificateId::Root])? {
        Some(chain) => chain,
        None => return Ok(None),
    };

    if persist {
        tx.upsert_tcb_mapping(PlatformTcbMapping {
            key: key.clone(),
            raw_tcb: raw_tcb.clone(),
            tcbm: cert.tcbm.clone(),
        })?;
    }
    Ok(Some(PckCertResult {
        tcbm: Some(cert.tcbm),
        fmspc: Some(fmspc),
        ca: Some(ca),
        issuer_chain,
        pck_cert: Some(cert.pck_cert),
    }))
}

/// Fetches the platform's certificate set from upstream, caches it together
/// with its TCB info and issuer chains, and selects the certificate for the
/// requested raw TCB. Without a raw TCB the result is empty.
pub fn fetch_pck_cert_from_upstream(
    env: &Collaborators,
    policy: &dyn CachingPolicy,
    request: &PckCertRequest,
) -> Result<PckCertResult> {
    let raw_tcb = request.raw_tcb()?;
    let download = download_cert_set(env, request)?;

    let had_unavailable = !download.unavailable.is_empty();
    if had_unavailable {
        policy.record_unavailable_tcbs(env, request, &download.unavailable)?;
    }
    if download.certs.is_empty() {
        return Err(Error::NoCacheData);
    }
    let tcb_infos = download_tcb_infos(env, &download.fmspc)?;
    let persist = policy.should_persist_tcb_mapping(had_unavailable);

    let key = request.key();
    let result = with_transaction(&*env.store, |tx| {
        store_cert_set(tx, env, &download, &tcb_infos)?;
        match &raw_tcb {
            Some(raw_tcb) => select_pck_cert(tx, env, &key, raw_tcb, persist),
            None => Ok(Some(PckCertResult::default())),
        }
    })?;
    result.ok_or(Error::NoCacheData)
}

pub fn fetch_pck_crl(env: &Collaborators, ca: CaType) -> Result<Collateral> {
    let download = download_pck_crl(env, ca)?;
    with_transaction(&*env.store, |tx| store_pck_crl(tx, &download))?;
    Ok(Collateral {
        body: download.crl,
        issuer_chain: download.issuer_chain,
    })
}

pub fn fetch_tcb_info(env: &Collaborators, product: ProductType, fmspc: &str, version: u16) -> Result<Collateral> {
    let download = download_tcb_info(env, product, fmspc, version)?;
    with_transaction(&*env.store, |tx| store_tcb_info(tx, &download))?;
    Ok(Collateral {
        body: download.tcb_info.into_bytes(),
        issuer_chain: download.issuer_chain,
    })
}

pub fn fetch_enclave_identity(env: &Collaborators, kind: EnclaveIdentityKind, version: u16) -> Result<Collateral> {
    let download = download_enclave_identity(env, kind, version)?;
    with_transaction(&*env.store, |tx| store_enclave_identity(tx, &download))?;
    Ok(Collateral {
        body: download.identity.into_bytes(),
        issuer_chain: download.issuer_chain,
    })
}

/// The root CRL is attached to the cached root certificate, so it can only be
/// cached once some issuer chain has been.
pub fn fetch_root_crl(env: &Collaborators) -> Result<Vec<u8>> {
    let root = with_transaction(&*env.store, |tx| tx.pcs_certificate(CertificateId::Root))?.ok_or(Error::NoCacheData)?;
    let crl = download_root_crl(env, &root)?;
    with_transaction(&*env.store, |tx| store_root_crl(tx, crl.clone()))?;
    Ok(crl)
}

pub fn fetch_crl_by_url(env: &Collaborators, url: &str) -> Result<Vec<u8>> {
    let entry = download_crl(env, url)?;
    with_transaction(&*env.store, |tx| tx.upsert_cached_crl(entry.clone()))?;
    Ok(entry.crl)
}
