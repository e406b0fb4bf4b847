/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/.
 */

use std::convert::TryFrom;

use log::debug;
use pcs::{PckCert, PckCerts, TcbInfo};
use pkix::pem::{self, PEM_CERTIFICATE};

use super::PckCertSelector;
use crate::types::CpuSvn;

/// Selects with [`PckCerts::select_pck`]: candidates are ordered by the
/// highest level of the TCB info they satisfy, and the first one the
/// platform's TCB is at or above wins. Candidates whose SGX extension cannot
/// be parsed are not considered.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcbOrderSelector;

impl TcbOrderSelector {
    pub fn new() -> Self {
        TcbOrderSelector
    }
}

impl PckCertSelector for TcbOrderSelector {
    fn select(
        &self,
        cpu_svn: &CpuSvn,
        pce_svn: u16,
        pce_id: u16,
        tcb_info: &str,
        candidates: &[String],
    ) -> Option<usize> {
        let tcb_info: TcbInfo = match TcbInfo::parse(&tcb_info.to_owned(), vec![]) {
            Ok(tcb_info) => tcb_info,
            Err(e) => {
                debug!("Failed to parse TCB info: {}", e);
                return None;
            }
        };
        let tcb_data = match tcb_info.data() {
            Ok(data) => data,
            Err(e) => {
                debug!("Unusable TCB info: {}", e);
                return None;
            }
        };

        // (index into `candidates`, DER) of every certificate with an SGX extension
        let mut parsed = Vec::with_capacity(candidates.len());
        let mut pcks = Vec::with_capacity(candidates.len());
        for (idx, candidate) in candidates.iter().enumerate() {
            let pck = PckCert::new(candidate.clone(), vec![]);
            match (pck.sgx_extension(), pem::pem_to_der(candidate, Some(PEM_CERTIFICATE))) {
                (Ok(_), Some(der)) => {
                    parsed.push((idx, der));
                    pcks.push(pck);
                }
                (Err(e), _) => debug!("Skipping PCK certificate {}: {}", idx, e),
                (_, None) => debug!("Skipping PCK certificate {}: not PEM", idx),
            }
        }
        if pcks.is_empty() {
            return None;
        }

        let pcks = PckCerts::try_from(pcks).ok()?;
        let selected = match pcks.select_pck(&tcb_data, cpu_svn, pce_svn, pce_id) {
            Ok(selected) => selected,
            Err(e) => {
                debug!("No PCK certificate selected: {}", e);
                return None;
            }
        };
        let selected = pem::pem_to_der(selected.pck_pem(), Some(PEM_CERTIFICATE))?;
        parsed
            .into_iter()
            .find(|(_, der)| *der == selected)
            .map(|(idx, _)| idx)
    }
}
