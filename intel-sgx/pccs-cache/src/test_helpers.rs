/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/.
 */

//! Fixtures shared by the unit tests.
//!
//! Certificates are fake PEM blocks. A PCK certificate carries its TCB level
//! as `tcb:<cpusvn[0]>:<pcesvn>:<pceid>` in its body, which [`MarkerSelector`]
//! picks up. Selection on real certificates is tested with the files in
//! `tests/data`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rustc_serialize::hex::ToHex;
use serde_json::json;

use crate::cache::fill::{self, CertSetDownload, TcbInfoDownload};
use crate::cache::{BundlePckCert, BundlePckCrl, BundlePlatform, BundleTcbInfo, CollateralBundle, Collaborators};
use crate::selector::PckCertSelector;
use crate::store::{with_transaction, CollateralStore, MemoryStore};
use crate::types::{
    hex_u16_le, CaType, CpuSvn, EnclaveIdentityKind, IssuerChain, PckCertRequest, PckCertificate, Platform,
    PlatformKey, PlatformRegistration, ProductType, RawTcb, RegistrationState, TcbInfoKey,
};
use crate::upstream::{
    PckCertsQuery, StatusCode, UpstreamClient, UpstreamResponse, ENCLAVE_ID_ISSUER_CHAIN_HEADER, FMSPC_HEADER,
    PCK_CA_TYPE_HEADER, PCK_CERTIFICATE_ISSUER_CHAIN_HEADER, PCK_CRL_ISSUER_CHAIN_HEADER,
    TCB_INFO_ISSUER_CHAIN_HEADER_V4,
};
use crate::Result;

pub const DEVICE_ID: &str = "0123456789abcdef0123456789abcdef";
pub const PCE_ID: &str = "0000";
pub const FMSPC: &str = "00906ed50000";
pub const ROOT_CA: &str = "root ca";
pub const PROCESSOR_CA: &str = "processor ca";
pub const PLATFORM_CA: &str = "platform ca";
pub const TCB_SIGNING_CA: &str = "tcb signing";
pub const ROOT_CRL: &[u8] = b"root ca crl";
pub const ROOT_CRL_URL: &str = "https://certificates.example/IntelSGXRootCA.der";

/// TCB levels published by [`MockUpstream`], highest first.
pub const LEVELS: &[(u8, u16)] = &[(9, 20), (7, 13), (6, 12), (5, 11), (4, 4), (3, 3), (2, 2), (1, 1)];

pub fn pem(name: &str) -> String {
    format!("-----BEGIN CERTIFICATE-----\n{}\n-----END CERTIFICATE-----\n", name)
}

pub fn chain(intermediate: &str, root: &str) -> String {
    format!("{}{}", pem(intermediate), pem(root))
}

pub fn cpu_svn(first: u8) -> String {
    let mut cpu_svn = [0u8; 16];
    cpu_svn[0] = first;
    cpu_svn.to_hex()
}

pub fn tcbm(first: u8, pce_svn: u16) -> String {
    format!("{}{}", cpu_svn(first), hex_u16_le(pce_svn))
}

pub fn raw_tcb(first: u8, pce_svn: u16) -> RawTcb {
    RawTcb::new(cpu_svn(first), hex_u16_le(pce_svn))
}

/// A PCK certificate for TCB level `(first, pce_svn)` and pce id 0.
pub fn pck_pem(name: &str, first: u8, pce_svn: u16) -> String {
    pem(&format!("{} tcb:{}:{}:0", name, first, pce_svn))
}

/// An available entry of a certificate set.
pub fn pck(name: &str, first: u8, pce_svn: u16) -> (String, Option<String>) {
    (tcbm(first, pce_svn), Some(pck_pem(name, first, pce_svn)))
}

pub fn enc_ppid_for(device_id: &str) -> String {
    device_id.repeat(768 / device_id.len().max(1))
}

pub fn platform_key() -> PlatformKey {
    PlatformKey::new(DEVICE_ID, PCE_ID)
}

pub fn request(first: u8, pce_svn: u16) -> PckCertRequest {
    PckCertRequest {
        device_id: DEVICE_ID.into(),
        pce_id: PCE_ID.into(),
        cpu_svn: Some(cpu_svn(first)),
        pce_svn: Some(hex_u16_le(pce_svn)),
        enc_ppid: Some(enc_ppid_for(DEVICE_ID)),
        platform_manifest: None,
    }
}

pub fn registration() -> PlatformRegistration {
    PlatformRegistration {
        device_id: DEVICE_ID.into(),
        pce_id: PCE_ID.into(),
        cpu_svn: cpu_svn(5),
        pce_svn: hex_u16_le(11),
        enc_ppid: Some(enc_ppid_for(DEVICE_ID)),
        platform_manifest: None,
    }
}

/// A signed TCB info document with one level per `(cpusvn[0], pcesvn)`.
pub fn tcb_info_json(version: u16, levels: &[(u8, u16)]) -> String {
    let levels: Vec<_> = levels
        .iter()
        .map(|(first, pce_svn)| {
            let mut tcb = serde_json::Map::new();
            if version >= 3 {
                let components: Vec<_> = (0..16)
                    .map(|i| {
                        let svn = if i == 0 { *first } else { 0 };
                        json!({ "svn": svn })
                    })
                    .collect();
                tcb.insert("sgxtcbcomponents".into(), components.into());
            } else {
                for i in 0..16 {
                    let svn = if i == 0 { *first } else { 0 };
                    tcb.insert(format!("sgxtcbcomp{:02}svn", i + 1), json!(svn));
                }
            }
            tcb.insert("pcesvn".into(), json!(pce_svn));
            json!({ "tcb": tcb, "tcbDate": "2024-03-13T00:00:00Z", "tcbStatus": "UpToDate" })
        })
        .collect();
    json!({
        "tcbInfo": {
            "id": "SGX",
            "version": version,
            "issueDate": "2024-03-13T00:00:00Z",
            "nextUpdate": "2049-01-01T00:00:00Z",
            "fmspc": FMSPC,
            "pceId": PCE_ID,
            "tcbType": 0,
            "tcbEvaluationDataNumber": 17,
            "tcbLevels": levels,
        },
        "signature": "00",
    })
    .to_string()
}

fn ok(body: Vec<u8>, headers: Vec<(&str, String)>) -> UpstreamResponse {
    UpstreamResponse {
        status: StatusCode::Ok,
        body,
        headers: headers.into_iter().map(|(k, v)| (k.to_owned(), v)).collect(),
    }
}

fn not_found() -> UpstreamResponse {
    UpstreamResponse {
        status: StatusCode::NotFound,
        body: vec![],
        headers: vec![],
    }
}

fn ca_name(ca: CaType) -> &'static str {
    match ca {
        CaType::Processor => PROCESSOR_CA,
        CaType::Platform => PLATFORM_CA,
    }
}

/// A `pckcerts` response. Entries without a certificate are reported as not
/// available.
pub fn pck_certs_response(fmspc: &str, ca: &str, certs: &[(String, Option<String>)]) -> UpstreamResponse {
    let body: Vec<_> = certs
        .iter()
        .map(|(tcbm, cert)| {
            json!({
                "tcb": {},
                "tcbm": tcbm,
                "cert": cert.as_deref().unwrap_or("Not available"),
            })
        })
        .collect();
    let intermediate = CaType::from_header(ca).map_or(PROCESSOR_CA, ca_name);
    ok(
        serde_json::to_vec(&body).unwrap(),
        vec![
            (FMSPC_HEADER, fmspc.to_uppercase()),
            (PCK_CA_TYPE_HEADER, ca.to_uppercase()),
            (PCK_CERTIFICATE_ISSUER_CHAIN_HEADER, chain(intermediate, ROOT_CA)),
        ],
    )
}

/// Reads `tcb:<cpusvn[0]>:<pcesvn>:<pceid>` from anywhere in the certificate.
fn marker(pem: &str) -> Option<(u8, u16, u16)> {
    let start = pem.find("tcb:")? + 4;
    let token = pem[start..].split_whitespace().next()?;
    let mut parts = token.split(':');
    let first = parts.next()?.parse().ok()?;
    let pce_svn = parts.next()?.parse().ok()?;
    let pce_id = parts.next()?.parse().ok()?;
    Some((first, pce_svn, pce_id))
}

/// Selects on the TCB markers of fake certificates: the highest
/// `(cpusvn[0], pcesvn)` at or below the platform's, the earliest on ties.
#[derive(Clone, Copy, Debug, Default)]
pub struct MarkerSelector;

impl PckCertSelector for MarkerSelector {
    fn select(&self, cpu_svn: &CpuSvn, pce_svn: u16, pce_id: u16, _: &str, candidates: &[String]) -> Option<usize> {
        let mut best: Option<(usize, (u8, u16))> = None;
        for (idx, candidate) in candidates.iter().enumerate() {
            let (first, svn, id) = match marker(candidate) {
                Some(marker) => marker,
                None => continue,
            };
            if id != pce_id || first > cpu_svn[0] || svn > pce_svn {
                continue;
            }
            if best.map_or(true, |(_, level)| (first, svn) > level) {
                best = Some((idx, (first, svn)));
            }
        }
        best.map(|(idx, _)| idx)
    }
}

/// Returns a fixed index and counts how often it was asked.
pub struct MockSelector {
    index: Option<usize>,
    calls: AtomicUsize,
}

impl MockSelector {
    pub fn returning(index: Option<usize>) -> Self {
        MockSelector {
            index,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PckCertSelector for MockSelector {
    fn select(&self, _: &CpuSvn, _: u16, _: u16, _: &str, candidates: &[String]) -> Option<usize> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.index.filter(|idx| *idx < candidates.len())
    }
}

/// An in-process provisioning service. It knows the platforms added with
/// [`MockUpstream::add_platform`] and serves every other collateral.
#[derive(Default)]
pub struct MockUpstream {
    platforms: Mutex<HashMap<String, Vec<(String, Option<String>)>>>,
    fail_collateral: Mutex<bool>,
    legacy_api: Mutex<bool>,
    tdx_status: Mutex<Option<StatusCode>>,
    tcb_info_requests: Mutex<Vec<ProductType>>,
    total_calls: AtomicUsize,
    pck_certs_calls: AtomicUsize,
    url_calls: Mutex<Vec<String>>,
    observed_store: Mutex<Option<Arc<dyn CollateralStore>>>,
    observed_states: Mutex<Vec<RegistrationState>>,
}

impl MockUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `certs` for the platform with `device_id`, replacing what was
    /// served before.
    pub fn add_platform(&self, device_id: &str, certs: Vec<(String, Option<String>)>) {
        self.platforms.lock().unwrap().insert(enc_ppid_for(device_id), certs);
    }

    /// Makes every request other than `pckcerts` fail with a 503.
    pub fn fail_collateral(&self, fail: bool) {
        *self.fail_collateral.lock().unwrap() = fail;
    }

    /// Acts as an API version 3 service, which has no TDX collateral.
    pub fn legacy_api(&self, legacy: bool) {
        *self.legacy_api.lock().unwrap() = legacy;
    }

    /// Serves TDX TCB info with `status`. Without it, there is none (404).
    pub fn tdx_status(&self, status: StatusCode) {
        *self.tdx_status.lock().unwrap() = Some(status);
    }

    pub fn tcb_info_requests(&self) -> Vec<ProductType> {
        self.tcb_info_requests.lock().unwrap().clone()
    }

    pub fn total_calls(&self) -> usize {
        self.total_calls.load(Ordering::SeqCst)
    }

    pub fn pck_certs_calls(&self) -> usize {
        self.pck_certs_calls.load(Ordering::SeqCst)
    }

    pub fn url_calls(&self) -> Vec<String> {
        self.url_calls.lock().unwrap().clone()
    }

    /// Records the states of all registrations in `store` whenever a
    /// certificate set is requested.
    pub fn observe_registrations(&self, store: Arc<dyn CollateralStore>) {
        *self.observed_store.lock().unwrap() = Some(store);
    }

    pub fn observed_registration_states(&self) -> Vec<RegistrationState> {
        self.observed_states.lock().unwrap().clone()
    }

    fn collateral(&self, response: UpstreamResponse) -> Result<UpstreamResponse> {
        self.total_calls.fetch_add(1, Ordering::SeqCst);
        if *self.fail_collateral.lock().unwrap() {
            return Ok(UpstreamResponse {
                status: StatusCode::ServiceUnavailable,
                body: vec![],
                headers: vec![],
            });
        }
        Ok(response)
    }
}

impl UpstreamClient for MockUpstream {
    fn pck_certs(&self, query: &PckCertsQuery) -> Result<UpstreamResponse> {
        self.total_calls.fetch_add(1, Ordering::SeqCst);
        self.pck_certs_calls.fetch_add(1, Ordering::SeqCst);
        let store = self.observed_store.lock().unwrap().clone();
        if let Some(store) = store {
            let registrations = with_transaction(&*store, |tx| tx.registrations(None))?;
            self.observed_states
                .lock()
                .unwrap()
                .extend(registrations.into_iter().map(|r| r.state));
        }

        let identity = match query {
            PckCertsQuery::EncryptedPpid { enc_ppid, .. } => enc_ppid,
            PckCertsQuery::PlatformManifest { platform_manifest, .. } => platform_manifest,
        };
        match self.platforms.lock().unwrap().get(identity) {
            Some(certs) => Ok(pck_certs_response(FMSPC, "processor", certs)),
            None => Ok(not_found()),
        }
    }

    fn pck_crl(&self, ca: CaType) -> Result<UpstreamResponse> {
        self.collateral(ok(
            format!("{} crl", ca.as_query()).into_bytes(),
            vec![(PCK_CRL_ISSUER_CHAIN_HEADER, chain(ca_name(ca), ROOT_CA))],
        ))
    }

    fn tcb_info(&self, product: ProductType, _fmspc: &str, version: u16) -> Result<UpstreamResponse> {
        self.tcb_info_requests.lock().unwrap().push(product);
        let found = ok(
            tcb_info_json(version, LEVELS).into_bytes(),
            vec![(TCB_INFO_ISSUER_CHAIN_HEADER_V4, chain(TCB_SIGNING_CA, ROOT_CA))],
        );
        let response = match (product, *self.tdx_status.lock().unwrap()) {
            (ProductType::Sgx, _) | (ProductType::Tdx, Some(StatusCode::Ok)) => found,
            (ProductType::Tdx, None) => not_found(),
            (ProductType::Tdx, Some(status)) => UpstreamResponse {
                status,
                body: vec![],
                headers: vec![],
            },
        };
        self.collateral(response)
    }

    fn enclave_identity(&self, kind: EnclaveIdentityKind, version: u16) -> Result<UpstreamResponse> {
        let id = format!("{:?}", kind).to_uppercase();
        let body = json!({
            "enclaveIdentity": { "id": id, "version": version },
            "signature": "00",
        });
        self.collateral(ok(
            body.to_string().into_bytes(),
            vec![(ENCLAVE_ID_ISSUER_CHAIN_HEADER, chain(TCB_SIGNING_CA, ROOT_CA))],
        ))
    }

    fn fetch_url(&self, url: &str) -> Result<UpstreamResponse> {
        self.url_calls.lock().unwrap().push(url.to_owned());
        let body = if url == ROOT_CRL_URL {
            ROOT_CRL.to_vec()
        } else {
            url.as_bytes().to_vec()
        };
        self.collateral(ok(body, vec![]))
    }

    fn tcb_info_version(&self) -> u16 {
        if *self.legacy_api.lock().unwrap() {
            2
        } else {
            3
        }
    }

    fn serves_tdx(&self) -> bool {
        !*self.legacy_api.lock().unwrap()
    }

    fn enclave_identity_version(&self) -> u16 {
        4
    }
}

pub struct TestEnv {
    pub env: Collaborators,
}

impl TestEnv {
    /// A memory store, `upstream`, and the [`MarkerSelector`].
    pub fn new(upstream: Arc<MockUpstream>) -> Self {
        Self::with_selector(upstream, Arc::new(MarkerSelector))
    }

    pub fn with_selector<S: PckCertSelector + 'static>(upstream: Arc<MockUpstream>, selector: Arc<S>) -> Self {
        TestEnv {
            env: Collaborators {
                store: Arc::new(MemoryStore::new()),
                upstream,
                selector,
                root_ca_crl_url: ROOT_CRL_URL.into(),
            },
        }
    }

    /// Caches the platform of [`platform_key`] with one certificate per
    /// `tcbm`, together with its TCB info and issuer chain.
    pub fn seed_platform(&self, tcbms: &[String]) {
        let key = platform_key();
        let download = CertSetDownload {
            platform: Platform {
                key: key.clone(),
                platform_manifest: None,
                enc_ppid: Some(enc_ppid_for(DEVICE_ID)),
                fmspc: Some(FMSPC.into()),
                ca: Some(CaType::Processor),
            },
            fmspc: FMSPC.into(),
            ca: CaType::Processor,
            issuer_chain: IssuerChain(vec![pem(PROCESSOR_CA), pem(ROOT_CA)]),
            certs: tcbms
                .iter()
                .map(|tcbm| PckCertificate {
                    key: key.clone(),
                    tcbm: tcbm.clone(),
                    pck_cert: pem(&format!("seeded {}", tcbm)),
                })
                .collect(),
            unavailable: vec![],
        };
        let tcb_info = TcbInfoDownload {
            key: TcbInfoKey::new(FMSPC, ProductType::Sgx, 3),
            tcb_info: tcb_info_json(3, LEVELS),
            issuer_chain: IssuerChain(vec![pem(TCB_SIGNING_CA), pem(ROOT_CA)]),
        };
        let env = &self.env;
        with_transaction(&*env.store, |tx| fill::store_cert_set(tx, env, &download, &[tcb_info])).unwrap();
    }
}

/// An offline bundle for the platform of [`platform_key`], with a certificate
/// for TCB level `(5, 11)`. All chains end in `root`.
pub fn bundle(root: &str) -> CollateralBundle {
    CollateralBundle {
        platforms: vec![BundlePlatform {
            qe_id: DEVICE_ID.into(),
            pce_id: PCE_ID.into(),
            platform_manifest: None,
            enc_ppid: Some(enc_ppid_for(DEVICE_ID)),
            fmspc: FMSPC.into(),
            ca: CaType::Processor,
            issuer_chain: chain(PROCESSOR_CA, root),
            certs: vec![BundlePckCert {
                tcbm: tcbm(5, 11),
                cert: pck_pem("cert-a", 5, 11),
            }],
            raw_tcbs: vec![raw_tcb(5, 11)],
        }],
        tcb_infos: vec![BundleTcbInfo {
            fmspc: FMSPC.into(),
            product: ProductType::Sgx,
            version: None,
            tcb_info: tcb_info_json(3, LEVELS),
            issuer_chain: chain(TCB_SIGNING_CA, root),
        }],
        pck_crls: vec![BundlePckCrl {
            ca: CaType::Processor,
            crl: "processor crl".into(),
            issuer_chain: chain(PROCESSOR_CA, root),
        }],
        enclave_identities: vec![],
        root_ca_crl: Some(ROOT_CRL.to_hex()),
    }
}
