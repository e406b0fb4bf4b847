/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/.
 */

//! Selection of the PCK certificate that best matches a platform's raw TCB.

use crate::types::CpuSvn;

#[cfg(feature = "link")]
pub mod native;
mod reference;

#[cfg(feature = "link")]
pub use self::native::NativeSelector;
pub use self::reference::TcbOrderSelector;

/// Picks, among a platform's PCK certificates, the one matching a raw TCB.
pub trait PckCertSelector: Send + Sync {
    /// Returns the index into `candidates` (PEM certificates) of the best
    /// match, or `None` when no certificate is valid for the platform's TCB.
    fn select(
        &self,
        cpu_svn: &CpuSvn,
        pce_svn: u16,
        pce_id: u16,
        tcb_info: &str,
        candidates: &[String],
    ) -> Option<usize>;
}
