/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/.
 */

//! Cached entities and the request/response values exchanged with the cache.
//!
//! Identifiers are kept as lowercase hex strings, the way the provisioning
//! service exchanges them. Multi-byte integers (`pce_id`, `pce_svn`) are
//! little-endian hex.

use std::convert::TryInto;
use std::fmt;

use rustc_serialize::hex::{FromHex, ToHex};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub type CpuSvn = [u8; 16];

fn decode_hex(name: &'static str, value: &str, len: usize) -> Result<Vec<u8>> {
    let bytes = value
        .from_hex()
        .map_err(|_| Error::invalid_request(format!("{} is not hex encoded", name)))?;
    if bytes.len() != len {
        return Err(Error::invalid_request(format!("{} must be {} bytes", name, len)));
    }
    Ok(bytes)
}

fn decode_le_u16(name: &'static str, value: &str) -> Result<u16> {
    let bytes = decode_hex(name, value, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

/// A platform as identified by the quoting enclave: `(qe_id, pce_id)`.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct PlatformKey {
    pub device_id: String,
    pub pce_id: String,
}

impl PlatformKey {
    pub fn new<D: Into<String>, P: Into<String>>(device_id: D, pce_id: P) -> Self {
        PlatformKey {
            device_id: device_id.into().to_lowercase(),
            pce_id: pce_id.into().to_lowercase(),
        }
    }

    pub fn pce_id_value(&self) -> Result<u16> {
        decode_le_u16("pce_id", &self.pce_id)
    }
}

impl fmt::Display for PlatformKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device_id, self.pce_id)
    }
}

/// The raw (not yet decomposed) TCB level a platform reports.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct RawTcb {
    pub cpu_svn: String,
    pub pce_svn: String,
}

impl RawTcb {
    pub fn new<C: Into<String>, P: Into<String>>(cpu_svn: C, pce_svn: P) -> Self {
        RawTcb {
            cpu_svn: cpu_svn.into().to_lowercase(),
            pce_svn: pce_svn.into().to_lowercase(),
        }
    }

    /// Splits a `tcbm` (cpu_svn followed by little-endian pce_svn) into its
    /// raw TCB level.
    pub fn from_tcbm(tcbm: &str) -> Result<Self> {
        match (tcbm.get(..32), tcbm.get(32..)) {
            (Some(cpu_svn), Some(pce_svn)) if tcbm.len() == 36 => Ok(RawTcb::new(cpu_svn, pce_svn)),
            _ => Err(Error::internal(format!("tcbm `{}` is not 36 hex characters", tcbm))),
        }
    }

    pub fn cpu_svn_bytes(&self) -> Result<CpuSvn> {
        let bytes = decode_hex("cpu_svn", &self.cpu_svn, 16)?;
        Ok(bytes.as_slice().try_into().expect("validated len = 16"))
    }

    pub fn pce_svn_value(&self) -> Result<u16> {
        decode_le_u16("pce_svn", &self.pce_svn)
    }

    pub fn validate(&self) -> Result<()> {
        self.cpu_svn_bytes()?;
        self.pce_svn_value()?;
        Ok(())
    }
}

impl fmt::Display for RawTcb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpusvn={} pcesvn={}", self.cpu_svn, self.pce_svn)
    }
}

/// Which intermediate CA issued a platform's PCK certificates.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CaType {
    Processor,
    Platform,
}

impl CaType {
    pub fn as_query(&self) -> &'static str {
        match self {
            CaType::Processor => "processor",
            CaType::Platform => "platform",
        }
    }

    pub fn from_header(value: &str) -> Option<CaType> {
        match value.trim().to_lowercase().as_str() {
            "processor" => Some(CaType::Processor),
            "platform" => Some(CaType::Platform),
            _ => None,
        }
    }

    pub fn intermediate_cert(&self) -> CertificateId {
        match self {
            CaType::Processor => CertificateId::ProcessorCa,
            CaType::Platform => CertificateId::PlatformCa,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProductType {
    Sgx,
    Tdx,
}

impl ProductType {
    pub fn tag(&self) -> &'static str {
        match self {
            ProductType::Sgx => "sgx",
            ProductType::Tdx => "tdx",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EnclaveIdentityKind {
    Qe,
    Qve,
    Tdqe,
}

impl EnclaveIdentityKind {
    /// Path of the identity below the certification API root.
    pub fn path(&self) -> (&'static str, &'static str) {
        match self {
            EnclaveIdentityKind::Qe => ("sgx", "qe/identity"),
            EnclaveIdentityKind::Qve => ("sgx", "qve/identity"),
            EnclaveIdentityKind::Tdqe => ("tdx", "qe/identity"),
        }
    }
}

/// Slots for the certificates that make up the issuer chains of cached
/// collateral.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum CertificateId {
    Root,
    ProcessorCa,
    PlatformCa,
    TcbSigning,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistrationState {
    New,
    NotAvailable,
    Deleted,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Platform {
    pub key: PlatformKey,
    pub platform_manifest: Option<String>,
    pub enc_ppid: Option<String>,
    pub fmspc: Option<String>,
    pub ca: Option<CaType>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PlatformTcbMapping {
    pub key: PlatformKey,
    pub raw_tcb: RawTcb,
    pub tcbm: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PckCertificate {
    pub key: PlatformKey,
    pub tcbm: String,
    pub pck_cert: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct TcbInfoKey {
    pub fmspc: String,
    pub product: ProductType,
    pub version: u16,
}

impl TcbInfoKey {
    pub fn new<F: Into<String>>(fmspc: F, product: ProductType, version: u16) -> Self {
        TcbInfoKey {
            fmspc: fmspc.into().to_lowercase(),
            product,
            version,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FmspcTcbInfo {
    pub key: TcbInfoKey,
    pub tcb_info: String,
    pub root_cert: CertificateId,
    pub signing_cert: CertificateId,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EnclaveIdentity {
    pub kind: EnclaveIdentityKind,
    pub version: u16,
    pub identity: String,
    pub root_cert: CertificateId,
    pub signing_cert: CertificateId,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PckCrl {
    pub ca: CaType,
    pub crl: Vec<u8>,
    pub root_cert: CertificateId,
    pub intermediate_cert: CertificateId,
}

/// A fragment of an issuer chain: a CA certificate, and for the root also its
/// CRL.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PcsCertificate {
    pub id: CertificateId,
    pub cert: String,
    pub crl: Option<Vec<u8>>,
    pub crl_distribution_point: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CrlCacheEntry {
    pub url: String,
    pub crl: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PendingRegistration {
    pub key: PlatformKey,
    pub raw_tcb: RawTcb,
    pub enc_ppid: Option<String>,
    pub platform_manifest: Option<String>,
    pub state: RegistrationState,
}

/// Certificate chain, starting from the CA closest to the leaf and ending with
/// the root.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct IssuerChain(pub Vec<String>);

impl IssuerChain {
    pub fn root(&self) -> Option<&str> {
        self.0.last().map(|c| c.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The concatenated PEM chain, as it is sent in the issuer chain headers.
    pub fn to_pem(&self) -> String {
        self.0.concat()
    }
}

/// A request for the PCK certificate of a platform at a raw TCB level.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct PckCertRequest {
    pub device_id: String,
    pub pce_id: String,
    pub cpu_svn: Option<String>,
    pub pce_svn: Option<String>,
    pub enc_ppid: Option<String>,
    pub platform_manifest: Option<String>,
}

impl PckCertRequest {
    pub fn key(&self) -> PlatformKey {
        PlatformKey::new(self.device_id.as_str(), self.pce_id.as_str())
    }

    /// The requested raw TCB, if any. Supplying only one of the two values is a
    /// caller error.
    pub fn raw_tcb(&self) -> Result<Option<RawTcb>> {
        match (&self.cpu_svn, &self.pce_svn) {
            (Some(cpu_svn), Some(pce_svn)) => {
                let raw_tcb = RawTcb::new(cpu_svn.as_str(), pce_svn.as_str());
                raw_tcb.validate()?;
                Ok(Some(raw_tcb))
            }
            (None, None) => Ok(None),
            _ => Err(Error::invalid_request("cpusvn and pcesvn must be provided together")),
        }
    }

    /// An encrypted PPID of all zeroes carries no platform identity.
    pub fn has_usable_enc_ppid(&self) -> bool {
        self.enc_ppid
            .as_ref()
            .map_or(false, |id| !id.is_empty() && id.chars().any(|c| c != '0'))
    }

    pub(crate) fn for_platform(platform: &Platform) -> Self {
        PckCertRequest {
            device_id: platform.key.device_id.clone(),
            pce_id: platform.key.pce_id.clone(),
            cpu_svn: None,
            pce_svn: None,
            enc_ppid: platform.enc_ppid.clone(),
            platform_manifest: platform.platform_manifest.clone(),
        }
    }
}

impl From<&PlatformRegistration> for PckCertRequest {
    fn from(reg: &PlatformRegistration) -> Self {
        PckCertRequest {
            device_id: reg.device_id.clone(),
            pce_id: reg.pce_id.clone(),
            cpu_svn: Some(reg.cpu_svn.clone()),
            pce_svn: Some(reg.pce_svn.clone()),
            enc_ppid: reg.enc_ppid.clone(),
            platform_manifest: reg.platform_manifest.clone(),
        }
    }
}

/// Outcome of a PCK certificate lookup. Requests without a raw TCB level only
/// establish the platform and yield an empty result.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct PckCertResult {
    pub tcbm: Option<String>,
    pub fmspc: Option<String>,
    pub ca: Option<CaType>,
    pub issuer_chain: IssuerChain,
    pub pck_cert: Option<String>,
}

impl PckCertResult {
    pub fn is_empty(&self) -> bool {
        self.pck_cert.is_none()
    }
}

/// A collateral body together with the chain that signed it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Collateral {
    pub body: Vec<u8>,
    pub issuer_chain: IssuerChain,
}

impl Collateral {
    pub fn body_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.body).map_err(|_| Error::internal("collateral body is not utf8"))
    }
}

/// Registration request as sent by the platform registration tooling.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct PlatformRegistration {
    pub device_id: String,
    pub pce_id: String,
    pub cpu_svn: String,
    pub pce_svn: String,
    pub enc_ppid: Option<String>,
    pub platform_manifest: Option<String>,
}

impl PlatformRegistration {
    pub fn key(&self) -> PlatformKey {
        PlatformKey::new(self.device_id.as_str(), self.pce_id.as_str())
    }

    pub fn raw_tcb(&self) -> RawTcb {
        RawTcb::new(self.cpu_svn.as_str(), self.pce_svn.as_str())
    }

    pub(crate) fn pending(&self, state: RegistrationState) -> PendingRegistration {
        PendingRegistration {
            key: self.key(),
            raw_tcb: self.raw_tcb(),
            enc_ppid: self.enc_ppid.clone(),
            platform_manifest: self.platform_manifest.clone(),
            state,
        }
    }
}

pub(crate) fn hex_u16_le(value: u16) -> String {
    value.to_le_bytes().to_hex()
}
