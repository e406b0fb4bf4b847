/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/.
 */

//! Drives the cache through the public API, with the PCS client talking to an
//! in-process fake of the provisioning service.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use serde_json::json;

use pccs_cache::cache::{CollateralBundle, Collaborators};
use pccs_cache::selector::TcbOrderSelector;
use pccs_cache::store::{with_transaction, MemoryStore};
use pccs_cache::types::{
    CaType, EnclaveIdentityKind, PckCertRequest, PendingRegistration, PlatformRegistration, RegistrationState,
};
use pccs_cache::upstream::{Fetcher, PcsClientBuilder, PcsVersion, UpstreamRequest};
use pccs_cache::{CachingMode, CollateralCache, Error, RefreshScope, StatusCode};

const QE_ID: &str = "00112233445566778899aabbccddeeff";
const PCE_ID: &str = "0000";
const FMSPC: &str = "00906ED50000";
const ROOT_CRL_URL: &str = "https://crl.example/root.der";

// PCK certificates for TCB components `[<first>, 1, 0, ..]` and a pcesvn
const PCK_5_11: &str = include_str!("data/pck_5_11.pem");
const PCK_1_5: &str = include_str!("data/pck_1_5.pem");

fn pem(body: &str) -> String {
    format!("-----BEGIN CERTIFICATE-----\n{}\n-----END CERTIFICATE-----\n", body)
}

fn chain(intermediate: &str) -> String {
    format!("{}{}", pem(intermediate), pem("root"))
}

fn cpu_svn(first: u8) -> String {
    format!("{:02x}01{}", first, "00".repeat(14))
}

fn pce_svn(svn: u16) -> String {
    format!("{:02x}{:02x}", svn & 0xff, svn >> 8)
}

fn tcb_info() -> String {
    let levels: Vec<_> = [(7u8, 13u16), (5, 11), (1, 5)]
        .iter()
        .map(|(first, pcesvn)| {
            let components: Vec<_> = (0..16)
                .map(|i| {
                    let svn = if i == 0 { *first } else { 0 };
                    json!({ "svn": svn })
                })
                .collect();
            json!({
                "tcb": { "sgxtcbcomponents": components, "pcesvn": pcesvn },
                "tcbDate": "2024-03-13T00:00:00Z",
                "tcbStatus": "UpToDate",
            })
        })
        .collect();
    json!({
        "tcbInfo": {
            "id": "SGX",
            "version": 3,
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

#[derive(Default)]
struct FakePcs {
    requests: Mutex<Vec<UpstreamRequest>>,
    pck_certs_calls: AtomicUsize,
}

impl FakePcs {
    fn route(&self, request: &UpstreamRequest) -> (StatusCode, Vec<u8>, Vec<(String, String)>) {
        let url = request.url.as_str();
        let header = |name: &str, value: String| (name.to_owned(), value);
        if url.contains("/sgx/certification/v4/pckcerts") {
            self.pck_certs_calls.fetch_add(1, Ordering::SeqCst);
            let body = json!([
                { "tcbm": format!("{}{}", cpu_svn(5), pce_svn(11)), "cert": PCK_5_11 },
                { "tcbm": format!("{}{}", cpu_svn(1), pce_svn(5)), "cert": PCK_1_5 },
                { "tcbm": format!("{}{}", cpu_svn(7), pce_svn(13)), "cert": "Not available" },
            ]);
            return (
                StatusCode::Ok,
                body.to_string().into_bytes(),
                vec![
                    header("SGX-FMSPC", FMSPC.into()),
                    header("SGX-PCK-Certificate-CA-Type", "processor".into()),
                    header("SGX-PCK-Certificate-Issuer-Chain", chain("processor")),
                ],
            );
        }
        if url.contains("/sgx/certification/v4/pckcrl?ca=processor") {
            return (
                StatusCode::Ok,
                b"processor crl".to_vec(),
                vec![header("SGX-PCK-CRL-Issuer-Chain", chain("processor"))],
            );
        }
        if url.contains("/sgx/certification/v4/tcb?fmspc=") {
            return (StatusCode::Ok, tcb_info().into_bytes(), vec![header("TCB-Info-Issuer-Chain", chain("tcb"))]);
        }
        if url.contains("/sgx/certification/v4/qe/identity") {
            return (
                StatusCode::Ok,
                br#"{"enclaveIdentity":{"id":"QE"},"signature":"00"}"#.to_vec(),
                vec![header("SGX-Enclave-Identity-Issuer-Chain", chain("tcb"))],
            );
        }
        if url == ROOT_CRL_URL {
            return (StatusCode::Ok, b"root crl".to_vec(), vec![]);
        }
        (StatusCode::NotFound, vec![], vec![])
    }
}

struct FakeFetcher(Arc<FakePcs>);

impl Fetcher for FakeFetcher {
    type Request = UpstreamRequest;
    type Response = (Vec<u8>, Vec<(String, String)>);

    fn build_request(&self, request: &UpstreamRequest) -> pccs_cache::Result<UpstreamRequest> {
        Ok(request.clone())
    }

    fn send(&self, request: UpstreamRequest) -> pccs_cache::Result<(StatusCode, Self::Response)> {
        let (status, body, headers) = self.0.route(&request);
        self.0.requests.lock().unwrap().push(request);
        Ok((status, (body, headers)))
    }

    fn parse_response(&self, response: Self::Response) -> pccs_cache::Result<(Vec<u8>, Vec<(String, String)>)> {
        Ok(response)
    }
}

fn cache(mode: CachingMode) -> (CollateralCache, Arc<FakePcs>) {
    let (cache, pcs, _) = cache_with_store(mode);
    (cache, pcs)
}

fn cache_with_store(mode: CachingMode) -> (CollateralCache, Arc<FakePcs>, Arc<MemoryStore>) {
    let pcs = Arc::new(FakePcs::default());
    let store = Arc::new(MemoryStore::new());
    let client = PcsClientBuilder::new(PcsVersion::V4)
        .set_base_url("https://pcs.example/")
        .set_api_key("key".into())
        .build(FakeFetcher(pcs.clone()));
    let env = Collaborators {
        store: store.clone(),
        upstream: Arc::new(client),
        selector: Arc::new(TcbOrderSelector::new()),
        root_ca_crl_url: ROOT_CRL_URL.into(),
    };
    (CollateralCache::new(env, mode.policy()), pcs, store)
}

fn registration() -> PlatformRegistration {
    PlatformRegistration {
        device_id: QE_ID.into(),
        pce_id: PCE_ID.into(),
        cpu_svn: cpu_svn(6),
        pce_svn: pce_svn(12),
        enc_ppid: Some("ab".repeat(384)),
        platform_manifest: None,
    }
}

#[test]
fn registered_platform_is_served_from_cache() {
    let (cache, pcs) = cache(CachingMode::Req);
    cache.register_platform(&registration()).unwrap();
    assert_eq!(pcs.pck_certs_calls.load(Ordering::SeqCst), 1);
    assert!(cache.pending_registrations().unwrap().is_empty());

    let request = PckCertRequest::from(&registration());
    let result = cache.get_pck_cert(&request).unwrap();
    assert_eq!(result.pck_cert.as_deref(), Some(PCK_5_11));
    assert_eq!(result.tcbm, Some(format!("{}{}", cpu_svn(5), pce_svn(11))));
    assert_eq!(result.fmspc.as_deref(), Some("00906ed50000"));
    assert_eq!(result.ca, Some(CaType::Processor));
    assert_eq!(result.issuer_chain.0.len(), 2);

    // A lower TCB level of the same platform is selected locally
    let mut lower = request.clone();
    lower.cpu_svn = Some(cpu_svn(3));
    lower.pce_svn = Some(pce_svn(6));
    assert_eq!(cache.get_pck_cert(&lower).unwrap().pck_cert.as_deref(), Some(PCK_1_5));
    assert_eq!(pcs.pck_certs_calls.load(Ordering::SeqCst), 1);

    let requests = pcs.requests.lock().unwrap();
    assert!(requests[0].url.starts_with("https://pcs.example/sgx/certification/v4/pckcerts?encrypted_ppid="));
    assert!(requests[0].headers.iter().any(|(k, v)| k == "Ocp-Apim-Subscription-Key" && v == "key"));
    assert!(requests.iter().any(|r| r.url.contains("/tcb?fmspc=00906ed50000&update=early")));
}

#[test]
fn unavailable_certificates_are_queued() {
    let (cache, _pcs, store) = cache_with_store(CachingMode::Req);
    let request = PckCertRequest::from(&registration());
    assert_eq!(cache.get_pck_cert(&request).unwrap().pck_cert.as_deref(), Some(PCK_5_11));

    let (queued, mappings) = with_transaction(&*store, |tx| {
        Ok((
            tx.registrations(Some(RegistrationState::NotAvailable))?,
            tx.all_tcb_mappings()?,
        ))
    })
    .unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].raw_tcb.cpu_svn, cpu_svn(7));
    // Not remembered while upstream is missing certificates
    assert!(mappings.is_empty());
}

#[test]
fn collateral_and_root_crl() {
    let (cache, pcs) = cache(CachingMode::Lazy);
    assert_matches!(cache.get_root_crl(), Err(Error::NoCacheData));

    let crl = cache.get_pck_crl(CaType::Processor).unwrap();
    assert_eq!(crl.body, b"processor crl".to_vec());
    assert_eq!(cache.get_root_crl().unwrap(), b"root crl".to_vec());
    let identity = cache.get_enclave_identity(EnclaveIdentityKind::Qe, 4).unwrap();
    assert!(identity.body_str().unwrap().contains("QE"));

    let before = pcs.requests.lock().unwrap().len();
    cache.refresh_engine().refresh(&RefreshScope::Collateral).unwrap();
    assert_eq!(pcs.requests.lock().unwrap().len(), before + 3);

    // Unknown to the provisioning service
    assert_matches!(cache.get_pck_crl(CaType::Platform), Err(Error::NoCacheData));
}

#[test]
fn offline_mode_uses_uploaded_collateral() {
    let (cache, pcs) = cache(CachingMode::Offline);
    let bundle: CollateralBundle = serde_json::from_value(json!({
        "platforms": [{
            "qe-id": QE_ID,
            "pce-id": PCE_ID,
            "fmspc": FMSPC,
            "ca": "PROCESSOR",
            "issuer-chain": chain("processor"),
            "certs": [{ "tcbm": format!("{}{}", cpu_svn(5), pce_svn(11)), "cert": PCK_5_11 }],
            "raw-tcbs": [{ "cpu_svn": cpu_svn(6), "pce_svn": pce_svn(12) }],
        }],
        "tcb-infos": [{
            "fmspc": FMSPC,
            "product": "SGX",
            "tcb-info": tcb_info(),
            "issuer-chain": chain("tcb"),
        }],
        "root-ca-crl": "726f6f742063726c",
    }))
    .unwrap();

    let report = cache.upload_platform_collateral(&bundle).unwrap();
    assert_eq!(report.resolved, 1);

    let result = cache.get_pck_cert(&PckCertRequest::from(&registration())).unwrap();
    assert_eq!(result.pck_cert.as_deref(), Some(PCK_5_11));
    assert_eq!(cache.get_root_crl().unwrap(), b"root crl".to_vec());

    cache.register_platform(&registration()).unwrap();
    let mut unknown = registration();
    unknown.device_id = "ff".repeat(16);
    cache.register_platform(&unknown).unwrap();
    let pending = cache.pending_registrations().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].state, RegistrationState::New);

    assert_matches!(
        cache.refresh_engine().refresh(&RefreshScope::Certificates { fmspcs: None }),
        Err(Error::ServiceUnavailable(_))
    );
    assert!(pcs.requests.lock().unwrap().is_empty());
}

#[test]
fn store_transactions_are_all_or_nothing() {
    let store = MemoryStore::new();
    let failed: pccs_cache::Result<()> = with_transaction(&store, |tx| {
        tx.upsert_registration(PendingRegistration {
            key: registration().key(),
            raw_tcb: registration().raw_tcb(),
            enc_ppid: None,
            platform_manifest: None,
            state: RegistrationState::New,
        })?;
        Err(Error::NoCacheData)
    });
    assert_matches!(failed, Err(Error::NoCacheData));
    assert!(with_transaction(&store, |tx| tx.registrations(None)).unwrap().is_empty());
}
