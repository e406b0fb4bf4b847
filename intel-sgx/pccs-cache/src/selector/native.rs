/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/.
 */

//! Selection through Intel's PCKCertSelection library.

use std::ffi::CString;
use std::os::raw::c_char;

use log::debug;

use super::PckCertSelector;
use crate::types::CpuSvn;

#[repr(C)]
#[allow(non_camel_case_types)]
struct cpu_svn_t {
    cpu_svn: [u8; 16],
}

const PCK_CERT_SELECT_SUCCESS: u32 = 0;

#[link(name = "PCKCertSelection")]
extern "C" {
    fn pck_cert_select(
        platform_svn: *const cpu_svn_t,
        pce_isvsvn: u16,
        pce_id: u16,
        tcb_info: *const c_char,
        pem_certificates: *const *const c_char,
        ncerts: u32,
        best_cert_index: *mut u32,
    ) -> u32;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NativeSelector;

impl PckCertSelector for NativeSelector {
    fn select(
        &self,
        cpu_svn: &CpuSvn,
        pce_svn: u16,
        pce_id: u16,
        tcb_info: &str,
        candidates: &[String],
    ) -> Option<usize> {
        let tcb_info = CString::new(tcb_info).ok()?;
        let certs = candidates
            .iter()
            .map(|c| CString::new(c.as_str()))
            .collect::<Result<Vec<_>, _>>()
            .ok()?;
        let cert_ptrs: Vec<*const c_char> = certs.iter().map(|c| c.as_ptr()).collect();
        let platform_svn = cpu_svn_t { cpu_svn: *cpu_svn };
        let mut best = 0u32;

        let ret = unsafe {
            pck_cert_select(
                &platform_svn,
                pce_svn,
                pce_id,
                tcb_info.as_ptr(),
                cert_ptrs.as_ptr(),
                cert_ptrs.len() as u32,
                &mut best,
            )
        };
        if ret != PCK_CERT_SELECT_SUCCESS {
            debug!("pck_cert_select returned {}", ret);
            return None;
        }
        Some(best as usize).filter(|idx| *idx < candidates.len())
    }
}
