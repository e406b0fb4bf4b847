/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/.
 */

//! A caching proxy for DCAP attestation collateral.
//!
//! Clients ask for PCK certificates, CRLs, TCB info and enclave identities.
//! [`CollateralCache`] serves them from a [`CollateralStore`], and consults the
//! active [`CachingPolicy`] on a cache miss. The policy decides whether the
//! Intel Provisioning Certification Service is contacted right away, whether
//! the request is queued as a platform registration, or both.
//! [`RefreshEngine`] keeps the cached collateral in sync with upstream.

use std::borrow::Cow;

#[cfg(feature = "reqwest")]
pub use reqwest::blocking::Client as ReqwestClient;
use quick_error::quick_error;

pub mod cache;
pub mod config;
pub mod policy;
pub mod refresh;
pub mod selector;
pub mod store;
pub mod types;
pub mod upstream;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use crate::cache::CollateralCache;
pub use crate::config::{CachingMode, Config};
pub use crate::policy::{CachingPolicy, Deferred, Immediate, Offline};
pub use crate::refresh::{RefreshEngine, RefreshScheduler, RefreshScope};
pub use crate::selector::PckCertSelector;
pub use crate::store::{CollateralStore, Transaction};
pub use crate::upstream::{StatusCode, UpstreamClient};

quick_error! {
    #[derive(Debug)]
    pub enum Error {
        InvalidRequest(msg: Cow<'static, str>) {
            description("Malformed or missing request parameter")
            display("Invalid request: {}", msg)
        }
        NoCacheData {
            description("No cache data for this request")
            display("No cache data available for this request")
        }
        PlatformUnknown {
            description("Platform not recognized")
            display("Platform is not known to the cache nor to the provisioning service")
        }
        IntegrityError(msg: Cow<'static, str>) {
            description("Collateral violates a consistency invariant")
            display("Integrity error: {}", msg)
        }
        ServiceUnavailable(msg: Cow<'static, str>) {
            description("Service unavailable")
            display("Service unavailable: {}", msg)
        }
        UpstreamAccessFailure(msg: String) {
            description("Provisioning service could not be reached")
            display("Failed to access the provisioning service: {}", msg)
        }
        InternalError(msg: Cow<'static, str>) {
            description("Internal error")
            display("Internal error: {}", msg)
        }
    }
}

/// Coarse classification of [`Error`], one per outward status the routing
/// layer reports.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    InvalidRequest,
    NoCacheData,
    PlatformUnknown,
    IntegrityError,
    ServiceUnavailable,
    UpstreamAccessFailure,
    InternalError,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Error::NoCacheData => ErrorKind::NoCacheData,
            Error::PlatformUnknown => ErrorKind::PlatformUnknown,
            Error::IntegrityError(_) => ErrorKind::IntegrityError,
            Error::ServiceUnavailable(_) => ErrorKind::ServiceUnavailable,
            Error::UpstreamAccessFailure(_) => ErrorKind::UpstreamAccessFailure,
            Error::InternalError(_) => ErrorKind::InternalError,
        }
    }

    pub(crate) fn invalid_request<M: Into<Cow<'static, str>>>(msg: M) -> Error {
        Error::InvalidRequest(msg.into())
    }

    pub(crate) fn internal<M: Into<Cow<'static, str>>>(msg: M) -> Error {
        Error::InternalError(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(feature = "reqwest")]
pub fn reqwest_client(timeout: Option<std::time::Duration>) -> ReqwestClient {
    // `None` lifts the blocking client's default timeout as well
    ReqwestClient::builder()
        .use_native_tls()
        .timeout(timeout)
        .build()
        .expect("Failed to build reqwest client")
}
