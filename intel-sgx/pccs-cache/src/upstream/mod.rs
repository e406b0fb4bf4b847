/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/.
 */

//! Access to the upstream provisioning certification service.
//!
//! The cache only ever sees [`UpstreamResponse`]s: a status, a body and the
//! response headers. Transport problems that survive the client's own retries
//! are reported as [`Error::UpstreamAccessFailure`].

use num_enum::FromPrimitive;
use percent_encoding::percent_decode;
use pkix::pem::PemBlock;
use serde::Deserialize;

use crate::types::{CaType, EnclaveIdentityKind, IssuerChain, ProductType};
use crate::{Error, Result};

pub mod pcs;

pub use self::pcs::{Fetcher, Method, PcsClient, PcsClientBuilder, PcsVersion, UpstreamRequest, INTEL_BASE_URL};

pub const PCK_CERTIFICATE_ISSUER_CHAIN_HEADER: &'static str = "SGX-PCK-Certificate-Issuer-Chain";
pub const PCK_CRL_ISSUER_CHAIN_HEADER: &'static str = "SGX-PCK-CRL-Issuer-Chain";
pub const TCB_INFO_ISSUER_CHAIN_HEADER_V3: &'static str = "SGX-TCB-Info-Issuer-Chain";
pub const TCB_INFO_ISSUER_CHAIN_HEADER_V4: &'static str = "TCB-Info-Issuer-Chain";
pub const ENCLAVE_ID_ISSUER_CHAIN_HEADER: &'static str = "SGX-Enclave-Identity-Issuer-Chain";
pub const FMSPC_HEADER: &'static str = "SGX-FMSPC";
pub const PCK_CA_TYPE_HEADER: &'static str = "SGX-PCK-Certificate-CA-Type";

const CERT_NOT_AVAILABLE: &'static str = "Not available";

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, FromPrimitive)]
#[repr(u16)]
pub enum StatusCode {
    Ok = 200,
    BadRequest = 400,
    Unauthorized = 401,
    NotFound = 404,
    Gone = 410,
    TooManyRequests = 429,
    NonStandard461 = 461, // used by PCCS
    NonStandard462 = 462, // used by PCCS
    InternalServerError = 500,
    BadGateway = 502,
    ServiceUnavailable = 503,
    GatewayTimeout = 504,
    #[num_enum(catch_all)]
    Other(u16),
}

impl StatusCode {
    pub fn as_u16(&self) -> u16 {
        match *self {
            StatusCode::Ok => 200,
            StatusCode::BadRequest => 400,
            StatusCode::Unauthorized => 401,
            StatusCode::NotFound => 404,
            StatusCode::Gone => 410,
            StatusCode::TooManyRequests => 429,
            StatusCode::NonStandard461 => 461,
            StatusCode::NonStandard462 => 462,
            StatusCode::InternalServerError => 500,
            StatusCode::BadGateway => 502,
            StatusCode::ServiceUnavailable => 503,
            StatusCode::GatewayTimeout => 504,
            StatusCode::Other(code) => code,
        }
    }

    pub fn is_success(&self) -> bool {
        *self == StatusCode::Ok
    }

    /// Responses worth retrying: the service may answer differently later.
    pub fn is_transient(&self) -> bool {
        *self == StatusCode::TooManyRequests || self.as_u16() >= 500
    }
}

#[derive(Clone, Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl UpstreamResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body_string(&self) -> Result<String> {
        String::from_utf8(self.body.clone())
            .map_err(|_| Error::internal("upstream response body is not utf8"))
    }

    /// Returns the certificate chain starting from the leaf CA.
    pub fn issuer_chain(&self, header: &'static str) -> Result<IssuerChain> {
        let value = self
            .header(header)
            .ok_or_else(|| Error::internal(format!("Expected header \"{}\" missing", header)))?;
        parse_issuer_chain(value)
    }

    /// The TCB info signing chain. Its header was renamed with API version 4.
    pub fn tcb_info_issuer_chain(&self) -> Result<IssuerChain> {
        match self.header(TCB_INFO_ISSUER_CHAIN_HEADER_V4) {
            Some(_) => self.issuer_chain(TCB_INFO_ISSUER_CHAIN_HEADER_V4),
            None => self.issuer_chain(TCB_INFO_ISSUER_CHAIN_HEADER_V3),
        }
    }
}

/// Decodes a (percent encoded) concatenation of PEM certificates.
pub fn parse_issuer_chain(value: &str) -> Result<IssuerChain> {
    let cert_chain = percent_decode(value.as_bytes())
        .decode_utf8()
        .map_err(|_| Error::internal("issuer chain header could not be decoded"))?;

    let mut chain = vec![];
    for cert in PemBlock::new(cert_chain.as_bytes()) {
        let cert = String::from_utf8(cert.to_vec())
            .map_err(|_| Error::internal("issuer chain certificate is not utf8"))?;
        chain.push(cert);
    }
    if chain.is_empty() {
        return Err(Error::internal("issuer chain is empty"));
    }
    Ok(IssuerChain(chain))
}

/// How the platform identifies itself when asking for its certificate set.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum PckCertsQuery {
    EncryptedPpid { enc_ppid: String, pce_id: String },
    PlatformManifest { platform_manifest: String, pce_id: String },
}

pub trait UpstreamClient: Send + Sync {
    fn pck_certs(&self, query: &PckCertsQuery) -> Result<UpstreamResponse>;

    fn pck_crl(&self, ca: CaType) -> Result<UpstreamResponse>;

    fn tcb_info(&self, product: ProductType, fmspc: &str, version: u16) -> Result<UpstreamResponse>;

    fn enclave_identity(&self, kind: EnclaveIdentityKind, version: u16) -> Result<UpstreamResponse>;

    /// Plain GET of a URL, used for CRL distribution points.
    fn fetch_url(&self, url: &str) -> Result<UpstreamResponse>;

    /// Schema version of the TCB info documents this client asks for.
    fn tcb_info_version(&self) -> u16;

    /// Schema version of the enclave identities this client asks for.
    fn enclave_identity_version(&self) -> u16;

    /// Whether the service publishes TDX collateral (API version 4 onwards).
    fn serves_tdx(&self) -> bool;
}

/// One entry of a `pckcerts` response.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PckCertCandidate {
    pub tcbm: String,
    /// `None` when upstream reported the certificate as not available.
    pub cert: Option<String>,
}

/// A decoded `pckcerts` response.
#[derive(Clone, Debug)]
pub struct PckCertSet {
    pub fmspc: String,
    pub ca: CaType,
    pub issuer_chain: IssuerChain,
    pub candidates: Vec<PckCertCandidate>,
}

impl PckCertSet {
    pub fn parse(response: &UpstreamResponse) -> Result<PckCertSet> {
        #[derive(Deserialize)]
        struct Item {
            tcbm: String,
            cert: String,
        }

        let fmspc = response
            .header(FMSPC_HEADER)
            .map(|v| v.trim().to_lowercase())
            .filter(|v| v.len() == 12)
            .ok_or_else(|| Error::internal("pckcerts response lacks a usable SGX-FMSPC header"))?;
        let ca = response
            .header(PCK_CA_TYPE_HEADER)
            .and_then(CaType::from_header)
            .ok_or_else(|| Error::internal("pckcerts response lacks a usable CA type header"))?;
        let issuer_chain = response.issuer_chain(PCK_CERTIFICATE_ISSUER_CHAIN_HEADER)?;

        let items: Vec<Item> = serde_json::from_slice(&response.body)
            .map_err(|e| Error::internal(format!("pckcerts response failed to parse: {}", e)))?;
        let candidates = items
            .into_iter()
            .map(|item| {
                let cert = percent_decode(item.cert.as_bytes())
                    .decode_utf8()
                    .ok()
                    .filter(|c| c.trim() != CERT_NOT_AVAILABLE && c.contains("-----BEGIN CERTIFICATE-----"))
                    .map(|c| c.into_owned());
                PckCertCandidate {
                    tcbm: item.tcbm.to_lowercase(),
                    cert,
                }
            })
            .collect();

        Ok(PckCertSet {
            fmspc,
            ca,
            issuer_chain,
            candidates,
        })
    }

    /// Splits the candidates into available certificates `(tcbm, pem)` and the
    /// `tcbm`s upstream could not provide a certificate for.
    pub fn partition(self) -> (Vec<(String, String)>, Vec<String>) {
        let mut available = vec![];
        let mut unavailable = vec![];
        for candidate in self.candidates {
            match candidate.cert {
                Some(cert) => available.push((candidate.tcbm, cert)),
                None => unavailable.push(candidate.tcbm),
            }
        }
        (available, unavailable)
    }
}
