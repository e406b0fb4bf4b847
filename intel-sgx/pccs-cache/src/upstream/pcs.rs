/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/.
 */

//! Client for the Intel Provisioning Certification Service.
//!
//! Origins:
//! - <https://api.portal.trustedservices.intel.com/provisioning-certification>

#[cfg(feature = "reqwest")]
use std::io::Read;
use std::time::Duration;

use log::{debug, warn};
use serde::Serialize;

use super::{PckCertsQuery, StatusCode, UpstreamClient, UpstreamResponse};
use crate::types::{CaType, EnclaveIdentityKind, ProductType};
use crate::{Error, Result};

pub const INTEL_BASE_URL: &'static str = "https://api.trustedservices.intel.com";
const SUBSCRIPTION_KEY_HEADER: &'static str = "Ocp-Apim-Subscription-Key";

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PcsVersion {
    V3 = 3,
    V4 = 4,
}

impl PcsVersion {
    pub fn from_number(version: u16) -> Option<PcsVersion> {
        match version {
            3 => Some(PcsVersion::V3),
            4 => Some(PcsVersion::V4),
            _ => None,
        }
    }

    /// TCB info schema version served by this API version.
    pub fn tcb_info_version(&self) -> u16 {
        *self as u16 - 1
    }

    fn for_tcb_info_version(version: u16) -> Option<PcsVersion> {
        PcsVersion::from_number(version + 1)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl UpstreamRequest {
    fn get(url: String) -> Self {
        UpstreamRequest {
            method: Method::Get,
            url,
            headers: vec![],
            body: None,
        }
    }
}

pub trait Fetcher: Send + Sync {
    type Request;
    type Response;

    fn build_request(&self, request: &UpstreamRequest) -> Result<Self::Request>;

    fn send(&self, request: Self::Request) -> Result<(StatusCode, Self::Response)>;

    fn parse_response(&self, response: Self::Response) -> Result<(Vec<u8>, Vec<(String, String)>)>;
}

#[cfg(feature = "reqwest")]
impl Fetcher for crate::ReqwestClient {
    type Request = reqwest::blocking::RequestBuilder;
    type Response = reqwest::blocking::Response;

    fn build_request(&self, request: &UpstreamRequest) -> Result<Self::Request> {
        let url = reqwest::Url::parse(&request.url)
            .map_err(|e| Error::internal(format!("invalid upstream url {}: {}", request.url, e)))?;

        let mut result = match request.method {
            Method::Get => self.get(url),
            Method::Post => self.post(url),
        };
        for (name, value) in &request.headers {
            result = result.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            result = result.body(body.clone());
        }
        Ok(result)
    }

    fn send(&self, request: Self::Request) -> Result<(StatusCode, Self::Response)> {
        use std::fmt::Write;
        // Reqwest does not provide enough info about error
        fn report(mut err: &(dyn std::error::Error + 'static)) -> String {
            let mut s = format!("{}", err);
            while let Some(src) = err.source() {
                let _ = write!(s, "\n  Caused by: {}", src);
                err = src;
            }
            s
        }
        let response = request.send().map_err(|e| Error::UpstreamAccessFailure(report(&e)))?;
        let status_code = StatusCode::from(response.status().as_u16());
        Ok((status_code, response))
    }

    fn parse_response(&self, mut response: Self::Response) -> Result<(Vec<u8>, Vec<(String, String)>)> {
        let mut body = Vec::new();
        response.read_to_end(&mut body).map_err(|e| {
            Error::UpstreamAccessFailure(format!("Error while trying to read response body. Error: {}", e))
        })?;

        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .map(|(header, value)| (header.to_string(), value.to_str().unwrap_or("").to_string()))
            .collect();
        Ok((body, headers))
    }
}

pub struct PcsClientBuilder {
    base_url: String,
    api_key: Option<String>,
    api_version: PcsVersion,
    retry_timeout: Option<Duration>,
}

impl PcsClientBuilder {
    pub fn new(api_version: PcsVersion) -> Self {
        PcsClientBuilder {
            base_url: INTEL_BASE_URL.into(),
            api_key: None,
            api_version,
            retry_timeout: None,
        }
    }

    pub fn set_base_url<U: Into<String>>(mut self, base_url: U) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn set_api_key(mut self, api_key: String) -> Self {
        self.api_key = Some(api_key);
        self
    }

    pub fn set_retry_timeout(mut self, retry_timeout: Duration) -> Self {
        self.retry_timeout = Some(retry_timeout);
        self
    }

    pub fn build<F: Fetcher>(self, fetcher: F) -> PcsClient<F> {
        PcsClient {
            base_url: self.base_url,
            api_key: self.api_key,
            api_version: self.api_version,
            retry_timeout: self.retry_timeout,
            fetcher,
        }
    }
}

pub struct PcsClient<F: Fetcher> {
    base_url: String,
    api_key: Option<String>,
    api_version: PcsVersion,
    retry_timeout: Option<Duration>,
    fetcher: F,
}

enum FailedAttempt {
    Status(UpstreamResponse),
    Error(Error),
}

impl<F: Fetcher> PcsClient<F> {
    const RETRY_INITIAL_INTERVAL: Duration = Duration::from_secs(2);
    const RETRY_INTERVAL_MULTIPLIER: f64 = 2.0;

    pub fn api_version(&self) -> PcsVersion {
        self.api_version
    }

    fn with_api_key(&self, mut request: UpstreamRequest) -> UpstreamRequest {
        if let Some(api_key) = &self.api_key {
            request
                .headers
                .push((SUBSCRIPTION_KEY_HEADER.to_owned(), api_key.to_string()));
        }
        request
    }

    fn fetch_once(&self, request: &UpstreamRequest) -> Result<UpstreamResponse> {
        let built = self.fetcher.build_request(request)?;
        let (status, response) = self.fetcher.send(built)?;
        let (body, headers) = self.fetcher.parse_response(response)?;
        debug!("{:?} {} -> {:?}", request.method, request.url, status);
        Ok(UpstreamResponse { status, body, headers })
    }

    /// Performs the request, retrying transport failures and server side
    /// errors until the retry timeout elapses. A server side error that
    /// persists is returned as a response, not as an error.
    fn call(&self, request: UpstreamRequest) -> Result<UpstreamResponse> {
        let retry_timeout = match self.retry_timeout {
            Some(retry_timeout) => retry_timeout,
            None => return self.fetch_once(&request),
        };

        let op = || match self.fetch_once(&request) {
            Ok(response) if response.status.is_transient() => {
                warn!("{} returned {:?}, retrying", request.url, response.status);
                Err(backoff::Error::transient(FailedAttempt::Status(response)))
            }
            Ok(response) => Ok(response),
            Err(err @ Error::UpstreamAccessFailure(_)) => {
                warn!("{}: {}, retrying", request.url, err);
                Err(backoff::Error::transient(FailedAttempt::Error(err)))
            }
            Err(err) => Err(backoff::Error::permanent(FailedAttempt::Error(err))),
        };

        let backoff = backoff::ExponentialBackoffBuilder::default()
            .with_initial_interval(Self::RETRY_INITIAL_INTERVAL)
            .with_multiplier(Self::RETRY_INTERVAL_MULTIPLIER)
            .with_max_elapsed_time(Some(retry_timeout))
            .build();
        backoff::retry(backoff, op).or_else(|backoff_err| {
            let attempt = match backoff_err {
                backoff::Error::Permanent(attempt) => attempt,
                backoff::Error::Transient { err, .. } => err,
            };
            match attempt {
                FailedAttempt::Status(response) => Ok(response),
                FailedAttempt::Error(err) => Err(err),
            }
        })
    }

    fn certification_url(&self, product: ProductType, version: PcsVersion) -> String {
        format!("{}/{}/certification/v{}", self.base_url, product.tag(), version as u16)
    }
}

impl<F: Fetcher> UpstreamClient for PcsClient<F> {
    fn pck_certs(&self, query: &PckCertsQuery) -> Result<UpstreamResponse> {
        let base = self.certification_url(ProductType::Sgx, self.api_version);
        let request = match query {
            PckCertsQuery::EncryptedPpid { enc_ppid, pce_id } => UpstreamRequest::get(format!(
                "{}/pckcerts?encrypted_ppid={}&pceid={}",
                base, enc_ppid, pce_id
            )),
            PckCertsQuery::PlatformManifest {
                platform_manifest,
                pce_id,
            } => {
                #[derive(Serialize)]
                #[serde(rename_all = "camelCase")]
                struct Body<'a> {
                    platform_manifest: &'a str,
                    pceid: &'a str,
                }
                let body = serde_json::to_vec(&Body {
                    platform_manifest,
                    pceid: pce_id,
                })
                .map_err(|e| Error::internal(format!("failed to encode pckcerts request: {}", e)))?;
                UpstreamRequest {
                    method: Method::Post,
                    url: format!("{}/pckcerts", base),
                    headers: vec![("Content-Type".to_owned(), "application/json".to_owned())],
                    body: Some(body),
                }
            }
        };
        self.call(self.with_api_key(request))
    }

    fn pck_crl(&self, ca: CaType) -> Result<UpstreamResponse> {
        let url = format!(
            "{}/pckcrl?ca={}&encoding=pem",
            self.certification_url(ProductType::Sgx, self.api_version),
            ca.as_query()
        );
        self.call(UpstreamRequest::get(url))
    }

    fn tcb_info(&self, product: ProductType, fmspc: &str, version: u16) -> Result<UpstreamResponse> {
        let api_version = PcsVersion::for_tcb_info_version(version)
            .ok_or_else(|| Error::invalid_request(format!("unsupported TCB info version {}", version)))?;
        let url = format!(
            "{}/tcb?fmspc={}&update=early",
            self.certification_url(product, api_version),
            fmspc
        );
        self.call(UpstreamRequest::get(url))
    }

    fn enclave_identity(&self, kind: EnclaveIdentityKind, version: u16) -> Result<UpstreamResponse> {
        let api_version = PcsVersion::from_number(version)
            .ok_or_else(|| Error::invalid_request(format!("unsupported enclave identity version {}", version)))?;
        let (product, path) = kind.path();
        let product = if product == ProductType::Tdx.tag() {
            ProductType::Tdx
        } else {
            ProductType::Sgx
        };
        let url = format!("{}/{}?update=early", self.certification_url(product, api_version), path);
        self.call(UpstreamRequest::get(url))
    }

    fn fetch_url(&self, url: &str) -> Result<UpstreamResponse> {
        self.call(UpstreamRequest::get(url.to_owned()))
    }

    fn tcb_info_version(&self) -> u16 {
        self.api_version.tcb_info_version()
    }

    fn enclave_identity_version(&self) -> u16 {
        self.api_version as u16
    }

    fn serves_tdx(&self) -> bool {
        self.api_version == PcsVersion::V4
    }
}
