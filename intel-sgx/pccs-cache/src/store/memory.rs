/* Copyright (c) Fortanix, Inc.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/.
 */

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::{CollateralStore, Transaction};
use crate::types::{
    CaType, CertificateId, CrlCacheEntry, EnclaveIdentity, EnclaveIdentityKind, FmspcTcbInfo, PckCertificate, PckCrl,
    PcsCertificate, PendingRegistration, Platform, PlatformKey, PlatformTcbMapping, RawTcb, RegistrationState,
    TcbInfoKey,
};
use crate::{Error, Result};

#[derive(Clone, Debug, Default)]
struct Tables {
    platforms: BTreeMap<PlatformKey, Platform>,
    tcb_mappings: BTreeMap<(PlatformKey, RawTcb), PlatformTcbMapping>,
    pck_certs: BTreeMap<(PlatformKey, String), PckCertificate>,
    tcb_infos: BTreeMap<TcbInfoKey, FmspcTcbInfo>,
    identities: BTreeMap<(EnclaveIdentityKind, u16), EnclaveIdentity>,
    pck_crls: BTreeMap<CaType, PckCrl>,
    pcs_certificates: BTreeMap<CertificateId, PcsCertificate>,
    crl_cache: BTreeMap<String, CrlCacheEntry>,
    registrations: BTreeMap<(PlatformKey, RawTcb), PendingRegistration>,
}

/// A write performed by a transaction, replayed on the shared tables when the
/// transaction commits.
#[derive(Clone, Debug)]
enum Mutation {
    Platform(Platform),
    TcbMapping(PlatformTcbMapping),
    DeleteTcbMappings(PlatformKey),
    PckCert(PckCertificate),
    DeletePckCerts(PlatformKey),
    TcbInfo(FmspcTcbInfo),
    EnclaveIdentity(EnclaveIdentity),
    PckCrl(PckCrl),
    PcsCertificate(PcsCertificate),
    CachedCrl(CrlCacheEntry),
    Registration(PendingRegistration),
}

impl Tables {
    fn apply(&mut self, mutation: Mutation) {
        match mutation {
            Mutation::Platform(p) => {
                self.platforms.insert(p.key.clone(), p);
            }
            Mutation::TcbMapping(m) => {
                self.tcb_mappings.insert((m.key.clone(), m.raw_tcb.clone()), m);
            }
            Mutation::DeleteTcbMappings(key) => self.tcb_mappings.retain(|(k, _), _| *k != key),
            Mutation::PckCert(c) => {
                self.pck_certs.insert((c.key.clone(), c.tcbm.clone()), c);
            }
            Mutation::DeletePckCerts(key) => self.pck_certs.retain(|(k, _), _| *k != key),
            Mutation::TcbInfo(t) => {
                self.tcb_infos.insert(t.key.clone(), t);
            }
            Mutation::EnclaveIdentity(i) => {
                self.identities.insert((i.kind, i.version), i);
            }
            Mutation::PckCrl(c) => {
                self.pck_crls.insert(c.ca, c);
            }
            Mutation::PcsCertificate(c) => {
                self.pcs_certificates.insert(c.id, c);
            }
            Mutation::CachedCrl(c) => {
                self.crl_cache.insert(c.url.clone(), c);
            }
            Mutation::Registration(r) => {
                self.registrations.insert((r.key.clone(), r.raw_tcb.clone()), r);
            }
        }
    }
}

/// On-disk representation of the store.
#[derive(Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Snapshot {
    platforms: Vec<Platform>,
    tcb_mappings: Vec<PlatformTcbMapping>,
    pck_certs: Vec<PckCertificate>,
    tcb_infos: Vec<FmspcTcbInfo>,
    enclave_identities: Vec<EnclaveIdentity>,
    pck_crls: Vec<PckCrl>,
    pcs_certificates: Vec<PcsCertificate>,
    crl_cache: Vec<CrlCacheEntry>,
    registrations: Vec<PendingRegistration>,
}

impl From<&Tables> for Snapshot {
    fn from(t: &Tables) -> Snapshot {
        Snapshot {
            platforms: t.platforms.values().cloned().collect(),
            tcb_mappings: t.tcb_mappings.values().cloned().collect(),
            pck_certs: t.pck_certs.values().cloned().collect(),
            tcb_infos: t.tcb_infos.values().cloned().collect(),
            enclave_identities: t.identities.values().cloned().collect(),
            pck_crls: t.pck_crls.values().cloned().collect(),
            pcs_certificates: t.pcs_certificates.values().cloned().collect(),
            crl_cache: t.crl_cache.values().cloned().collect(),
            registrations: t.registrations.values().cloned().collect(),
        }
    }
}

impl From<Snapshot> for Tables {
    fn from(s: Snapshot) -> Tables {
        let mut tables = Tables::default();
        let mutations = s
            .platforms
            .into_iter()
            .map(Mutation::Platform)
            .chain(s.tcb_mappings.into_iter().map(Mutation::TcbMapping))
            .chain(s.pck_certs.into_iter().map(Mutation::PckCert))
            .chain(s.tcb_infos.into_iter().map(Mutation::TcbInfo))
            .chain(s.enclave_identities.into_iter().map(Mutation::EnclaveIdentity))
            .chain(s.pck_crls.into_iter().map(Mutation::PckCrl))
            .chain(s.pcs_certificates.into_iter().map(Mutation::PcsCertificate))
            .chain(s.crl_cache.into_iter().map(Mutation::CachedCrl))
            .chain(s.registrations.into_iter().map(Mutation::Registration));
        for mutation in mutations {
            tables.apply(mutation);
        }
        tables
    }
}

/// A [`CollateralStore`] kept in memory, optionally persisted to a JSON file
/// after every commit.
///
/// Transactions share the committed tables until their first write, which
/// takes a private copy. Writes are recorded and, if another transaction
/// committed in the meantime, replayed on the newer tables at commit, so of
/// two concurrent transactions writing the same row the one committing last
/// wins.
pub struct MemoryStore {
    tables: Mutex<Arc<Tables>>,
    snapshot_file: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            tables: Mutex::new(Arc::new(Tables::default())),
            snapshot_file: None,
        }
    }

    /// Opens a store persisted at `path`. A missing file yields an empty
    /// store.
    pub fn with_snapshot_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let tables = if path.exists() {
            let file = File::open(&path)
                .map_err(|e| Error::internal(format!("failed to open {}: {}", path.display(), e)))?;
            let snapshot: Snapshot = serde_json::from_reader(BufReader::new(file))
                .map_err(|e| Error::internal(format!("failed to parse {}: {}", path.display(), e)))?;
            info!("Loaded cache from {}", path.display());
            Tables::from(snapshot)
        } else {
            Tables::default()
        };
        Ok(MemoryStore {
            tables: Mutex::new(Arc::new(tables)),
            snapshot_file: Some(path),
        })
    }

    fn persist(&self, tables: &Tables) -> Result<()> {
        let path = match &self.snapshot_file {
            Some(path) => path,
            None => return Ok(()),
        };
        let bytes = serde_json::to_vec(&Snapshot::from(tables))
            .map_err(|e| Error::internal(format!("failed to serialize cache: {}", e)))?;
        // Write next to the target, then rename over it
        let tmp = path.with_extension("tmp");
        let write = || -> std::io::Result<()> {
            let mut fp = File::create(&tmp)?;
            fp.write_all(&bytes)?;
            fp.sync_all()?;
            fs::rename(&tmp, path)
        };
        write().map_err(|e| Error::internal(format!("failed to write {}: {}", path.display(), e)))
    }

    /// The committed tables, shared with every transaction that has not
    /// written yet.
    fn current(&self) -> Result<Arc<Tables>> {
        self.tables
            .lock()
            .map(|tables| Arc::clone(&tables))
            .map_err(|_| Error::internal("store lock poisoned"))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CollateralStore for MemoryStore {
    fn transaction(&self, work: &mut dyn FnMut(&mut dyn Transaction) -> Result<()>) -> Result<()> {
        let base = self.current()?;
        let mut tx = MemoryTransaction {
            tables: Arc::clone(&base),
            log: vec![],
        };
        work(&mut tx)?;
        let MemoryTransaction { tables, log } = tx;
        if log.is_empty() {
            return Ok(());
        }

        let mut shared = self.tables.lock().map_err(|_| Error::internal("store lock poisoned"))?;
        debug!("Committing {} writes", log.len());
        let next = if Arc::ptr_eq(&base, &shared) {
            tables
        } else {
            let mut next = Tables::clone(&shared);
            for mutation in log {
                next.apply(mutation);
            }
            Arc::new(next)
        };
        self.persist(&next)?;
        *shared = next;
        Ok(())
    }
}

struct MemoryTransaction {
    tables: Arc<Tables>,
    log: Vec<Mutation>,
}

impl MemoryTransaction {
    fn record(&mut self, mutation: Mutation) -> Result<()> {
        Arc::make_mut(&mut self.tables).apply(mutation.clone());
        self.log.push(mutation);
        Ok(())
    }
}

impl Transaction for MemoryTransaction {
    fn platform(&self, key: &PlatformKey) -> Result<Option<Platform>> {
        Ok(self.tables.platforms.get(key).cloned())
    }

    fn platforms(&self) -> Result<Vec<Platform>> {
        Ok(self.tables.platforms.values().cloned().collect())
    }

    fn upsert_platform(&mut self, platform: Platform) -> Result<()> {
        self.record(Mutation::Platform(platform))
    }

    fn tcb_mapping(&self, key: &PlatformKey, raw_tcb: &RawTcb) -> Result<Option<PlatformTcbMapping>> {
        Ok(self.tables.tcb_mappings.get(&(key.clone(), raw_tcb.clone())).cloned())
    }

    fn tcb_mappings(&self, key: &PlatformKey) -> Result<Vec<PlatformTcbMapping>> {
        Ok(self
            .tables
            .tcb_mappings
            .values()
            .filter(|m| m.key == *key)
            .cloned()
            .collect())
    }

    fn all_tcb_mappings(&self) -> Result<Vec<PlatformTcbMapping>> {
        Ok(self.tables.tcb_mappings.values().cloned().collect())
    }

    fn upsert_tcb_mapping(&mut self, mapping: PlatformTcbMapping) -> Result<()> {
        self.record(Mutation::TcbMapping(mapping))
    }

    fn delete_tcb_mappings(&mut self, key: &PlatformKey) -> Result<()> {
        self.record(Mutation::DeleteTcbMappings(key.clone()))
    }

    fn pck_cert(&self, key: &PlatformKey, tcbm: &str) -> Result<Option<PckCertificate>> {
        Ok(self.tables.pck_certs.get(&(key.clone(), tcbm.to_lowercase())).cloned())
    }

    fn pck_certs(&self, key: &PlatformKey) -> Result<Vec<PckCertificate>> {
        Ok(self
            .tables
            .pck_certs
            .values()
            .filter(|c| c.key == *key)
            .cloned()
            .collect())
    }

    fn insert_pck_cert(&mut self, cert: PckCertificate) -> Result<()> {
        self.record(Mutation::PckCert(cert))
    }

    fn delete_pck_certs(&mut self, key: &PlatformKey) -> Result<()> {
        self.record(Mutation::DeletePckCerts(key.clone()))
    }

    fn tcb_info(&self, key: &TcbInfoKey) -> Result<Option<FmspcTcbInfo>> {
        Ok(self.tables.tcb_infos.get(key).cloned())
    }

    fn tcb_infos(&self) -> Result<Vec<FmspcTcbInfo>> {
        Ok(self.tables.tcb_infos.values().cloned().collect())
    }

    fn upsert_tcb_info(&mut self, tcb_info: FmspcTcbInfo) -> Result<()> {
        self.record(Mutation::TcbInfo(tcb_info))
    }

    fn enclave_identity(&self, kind: EnclaveIdentityKind, version: u16) -> Result<Option<EnclaveIdentity>> {
        Ok(self.tables.identities.get(&(kind, version)).cloned())
    }

    fn enclave_identities(&self) -> Result<Vec<EnclaveIdentity>> {
        Ok(self.tables.identities.values().cloned().collect())
    }

    fn upsert_enclave_identity(&mut self, identity: EnclaveIdentity) -> Result<()> {
        self.record(Mutation::EnclaveIdentity(identity))
    }

    fn pck_crl(&self, ca: CaType) -> Result<Option<PckCrl>> {
        Ok(self.tables.pck_crls.get(&ca).cloned())
    }

    fn pck_crls(&self) -> Result<Vec<PckCrl>> {
        Ok(self.tables.pck_crls.values().cloned().collect())
    }

    fn upsert_pck_crl(&mut self, crl: PckCrl) -> Result<()> {
        self.record(Mutation::PckCrl(crl))
    }

    fn pcs_certificate(&self, id: CertificateId) -> Result<Option<PcsCertificate>> {
        Ok(self.tables.pcs_certificates.get(&id).cloned())
    }

    fn upsert_pcs_certificate(&mut self, cert: PcsCertificate) -> Result<()> {
        self.record(Mutation::PcsCertificate(cert))
    }

    fn cached_crl(&self, url: &str) -> Result<Option<CrlCacheEntry>> {
        Ok(self.tables.crl_cache.get(url).cloned())
    }

    fn cached_crls(&self) -> Result<Vec<CrlCacheEntry>> {
        Ok(self.tables.crl_cache.values().cloned().collect())
    }

    fn upsert_cached_crl(&mut self, entry: CrlCacheEntry) -> Result<()> {
        self.record(Mutation::CachedCrl(entry))
    }

    fn registration(&self, key: &PlatformKey, raw_tcb: &RawTcb) -> Result<Option<PendingRegistration>> {
        Ok(self.tables.registrations.get(&(key.clone(), raw_tcb.clone())).cloned())
    }

    fn registrations(&self, state: Option<RegistrationState>) -> Result<Vec<PendingRegistration>> {
        Ok(self
            .tables
            .registrations
            .values()
            .filter(|r| state.map_or(true, |state| r.state == state))
            .cloned()
            .collect())
    }

    fn upsert_registration(&mut self, registration: PendingRegistration) -> Result<()> {
        self.record(Mutation::Registration(registration))
    }
}
