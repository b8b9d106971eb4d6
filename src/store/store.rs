//! JSON-file backed service table.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::models::*;

/// Most services the table holds.
pub const MAX_SERVICES: usize = 20;

/// Store error types.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Not found")]
    NotFound,
    #[error("service limit of {0} reached")]
    Full(usize),
    #[error("{0}")]
    Invalid(String),
}

/// On-disk and export shape.
#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceFile {
    pub services: Vec<Service>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredTable {
    Wrapped { services: Vec<serde_json::Value> },
    Bare(Vec<serde_json::Value>),
}

/// Change applied by `PATCH /api/services/{id}`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePatch {
    pub enabled: Option<bool>,
    /// Seconds from now; 0 un-pauses.
    pub pause_duration: Option<u64>,
}

/// Outcome of a bulk import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub imported: usize,
    pub skipped: usize,
}

/// Thread-safe service table.
///
/// The lock is held for every read-modify-write but never across network
/// I/O: checks work on a snapshot and write their result back through
/// [`Store::update_runtime`].
pub struct Store {
    path: PathBuf,
    entries: Mutex<Vec<ServiceEntry>>,
}

impl Store {
    /// Open the table at `path`, starting empty if the file does not exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let mut entries = Vec::new();

        match std::fs::read_to_string(&path) {
            Ok(text) if !text.trim().is_empty() => {
                let raw = match serde_json::from_str::<StoredTable>(&text)? {
                    StoredTable::Wrapped { services } => services,
                    StoredTable::Bare(services) => services,
                };
                for value in raw {
                    if entries.len() >= MAX_SERVICES {
                        tracing::warn!("services file holds more than {} entries, ignoring the rest", MAX_SERVICES);
                        break;
                    }
                    match serde_json::from_value::<Service>(value) {
                        Ok(service) => entries.push(ServiceEntry::new(service)),
                        Err(e) => tracing::warn!("Skipping unreadable service entry: {}", e),
                    }
                }
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        tracing::info!("Loaded {} services from {}", entries.len(), path.display());
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Write the table atomically (temp file, then rename). Callers hold the
    /// `entries` lock, so writers never overlap on the temp file.
    fn save(&self, entries: &[ServiceEntry]) -> Result<(), StoreError> {
        let services = Self::snapshot_services(entries);
        let text = serde_json::to_string_pretty(&ServiceFile { services })?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn snapshot_services(entries: &[ServiceEntry]) -> Vec<Service> {
        entries.iter().map(|e| e.service.clone()).collect()
    }

    /// Apply `f` and persist the result under one lock. A failed save rolls
    /// the table back so memory and disk agree.
    fn mutate<R>(
        &self,
        f: impl FnOnce(&mut Vec<ServiceEntry>) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut entries = self.entries.lock();
        let before = entries.clone();
        let out = f(&mut entries)?;
        if let Err(e) = self.save(&entries) {
            *entries = before;
            return Err(e);
        }
        Ok(out)
    }

    /// Snapshot of every entry.
    pub fn list(&self) -> Vec<ServiceEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn get(&self, id: &str) -> Option<ServiceEntry> {
        self.entries.lock().iter().find(|e| e.service.id == id).cloned()
    }

    /// Validate and add a service. Returns the stored service.
    pub fn add(&self, input: ServiceInput) -> Result<Service, StoreError> {
        let service = input.into_service()?;
        self.mutate(|entries| {
            if entries.len() >= MAX_SERVICES {
                return Err(StoreError::Full(MAX_SERVICES));
            }
            entries.push(ServiceEntry::new(service.clone()));
            Ok(())
        })?;
        tracing::info!("Added service '{}' ({}, {})", service.name, service.kind, service.id);
        Ok(service)
    }

    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.mutate(|entries| {
            let before = entries.len();
            entries.retain(|e| e.service.id != id);
            if entries.len() == before {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })?;
        tracing::info!("Deleted service {}", id);
        Ok(())
    }

    /// Apply an enable/pause change.
    pub fn update(&self, id: &str, patch: &ServicePatch, now_ms: u64) -> Result<Service, StoreError> {
        self.mutate(|entries| {
            let entry = entries
                .iter_mut()
                .find(|e| e.service.id == id)
                .ok_or(StoreError::NotFound)?;
            if let Some(enabled) = patch.enabled {
                entry.service.enabled = enabled;
            }
            if let Some(seconds) = patch.pause_duration {
                entry.service.set_pause(seconds, now_ms);
            }
            Ok(entry.service.clone())
        })
    }

    /// Bulk add. Invalid entries and entries beyond the table limit are
    /// skipped; every imported service gets a fresh id and push token.
    pub fn import(&self, items: Vec<serde_json::Value>) -> Result<ImportSummary, StoreError> {
        let summary = self.mutate(|entries| {
            let mut summary = ImportSummary {
                imported: 0,
                skipped: 0,
            };
            for item in items {
                let parsed = serde_json::from_value::<ServiceInput>(item)
                    .map_err(StoreError::from)
                    .and_then(|mut input| {
                        input.push_token = None;
                        input.into_service()
                    });
                match parsed {
                    Ok(service) if entries.len() < MAX_SERVICES => {
                        entries.push(ServiceEntry::new(service));
                        summary.imported += 1;
                    }
                    Ok(service) => {
                        tracing::warn!("Import: table full, skipping '{}'", service.name);
                        summary.skipped += 1;
                    }
                    Err(e) => {
                        tracing::warn!("Import: skipping invalid entry: {}", e);
                        summary.skipped += 1;
                    }
                }
            }
            Ok(summary)
        })?;
        tracing::info!(
            "Imported {} services ({} skipped)",
            summary.imported,
            summary.skipped
        );
        Ok(summary)
    }

    pub fn export(&self) -> ServiceFile {
        ServiceFile {
            services: Self::snapshot_services(&self.entries.lock()),
        }
    }

    /// Services whose check is due at `now_ms`. Their `last_check` is set
    /// to `now_ms` and expired pauses are cleared as a side effect.
    pub fn take_due(&self, now_ms: u64) -> Vec<Service> {
        let mut due = Vec::new();
        for entry in self.entries.lock().iter_mut() {
            let svc = &mut entry.service;
            if !svc.enabled {
                continue;
            }
            if svc.pause_until != 0 {
                if svc.is_paused(now_ms) {
                    continue;
                }
                tracing::info!("Pause expired for '{}'", svc.name);
                svc.pause_until = 0;
            }
            // A push deadline is evaluated on every walk; its interval is the
            // heartbeat period, not a check period.
            let interval_ms = match svc.kind {
                ServiceKind::Push => 0,
                _ => svc.check_interval as u64 * 1000,
            };
            if let Some(last) = entry.runtime.last_check {
                if now_ms.saturating_sub(last) < interval_ms {
                    continue;
                }
            }
            entry.runtime.last_check = Some(now_ms);
            due.push(svc.clone());
        }
        due
    }

    /// Run `f` on a service's runtime state under the lock.
    pub fn update_runtime<R>(
        &self,
        id: &str,
        f: impl FnOnce(&Service, &mut ServiceRuntime) -> R,
    ) -> Option<R> {
        let mut entries = self.entries.lock();
        let entry = entries.iter_mut().find(|e| e.service.id == id)?;
        Some(f(&entry.service, &mut entry.runtime))
    }

    /// Id of the push service owning `token`.
    pub fn find_push_token(&self, token: &str) -> Option<String> {
        if token.is_empty() {
            return None;
        }
        self.entries
            .lock()
            .iter()
            .find(|e| e.service.kind == ServiceKind::Push && e.service.push_token == token)
            .map(|e| e.service.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn input(value: serde_json::Value) -> ServiceInput {
        serde_json::from_value(value).unwrap()
    }

    fn ping(name: &str) -> ServiceInput {
        input(json!({"name": name, "type": "ping", "host": "10.0.0.1", "checkInterval": 10}))
    }

    #[test]
    fn test_service_crud_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("services.json");
        let store = Store::open(&path).unwrap();
        assert!(store.is_empty());

        let a = store.add(ping("a")).unwrap();
        let b = store.add(ping("b")).unwrap();
        store.delete(&a.id).unwrap();
        assert!(matches!(store.delete(&a.id), Err(StoreError::NotFound)));

        let reopened = Store::open(&path).unwrap();
        let ids: Vec<_> = reopened.list().into_iter().map(|e| e.service.id).collect();
        assert_eq!(ids, vec![b.id]);
    }

    #[test]
    fn test_concurrent_adds_all_reach_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("services.json");
        let store = std::sync::Arc::new(Store::open(&path).unwrap());

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || store.add(ping(&format!("s{}", i))).is_ok())
            })
            .collect();
        let acknowledged = handles.into_iter().map(|h| h.join().unwrap()).filter(|ok| *ok).count();

        assert_eq!(acknowledged, 16);
        assert_eq!(store.len(), 16);
        assert_eq!(Store::open(&path).unwrap().len(), 16);
    }

    #[test]
    fn test_failed_save_rolls_back() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("missing").join("services.json")).unwrap();

        assert!(matches!(store.add(ping("a")), Err(StoreError::Io(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn test_table_limit() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("s.json")).unwrap();
        for i in 0..MAX_SERVICES {
            store.add(ping(&format!("s{}", i))).unwrap();
        }
        assert!(matches!(store.add(ping("extra")), Err(StoreError::Full(20))));
    }

    #[test]
    fn test_open_accepts_bare_array() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.json");
        std::fs::write(
            &path,
            r#"[{"id":"x1","name":"a","type":3,"host":"h","port":22,
                 "checkInterval":30,"failThreshold":2,"passThreshold":1},
                {"id":"bad"}]"#,
        )
        .unwrap();
        let store = Store::open(&path).unwrap();
        let entries = store.list();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].service.kind, ServiceKind::PortOpen);
        assert!(entries[0].service.enabled);
    }

    #[test]
    fn test_import_skips_invalid_and_regenerates_tokens() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("s.json")).unwrap();
        let summary = store
            .import(vec![
                json!({"name": "hb", "type": "push", "pushToken": "00112233aabbccdd"}),
                json!({"name": "no-type"}),
                json!("garbage"),
                json!({"name": "p", "type": 1, "host": "h"}),
            ])
            .unwrap();
        assert_eq!(summary, ImportSummary { imported: 2, skipped: 2 });

        let hb = store
            .list()
            .into_iter()
            .find(|e| e.service.name == "hb")
            .unwrap();
        assert_ne!(hb.service.push_token, "00112233aabbccdd");
        assert_eq!(
            store.find_push_token(&hb.service.push_token),
            Some(hb.service.id.clone())
        );
    }

    #[test]
    fn test_due_respects_interval_and_pause() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("s.json")).unwrap();
        let svc = store.add(ping("a")).unwrap();

        assert_eq!(store.take_due(0).len(), 1);
        assert!(store.take_due(9_999).is_empty());
        assert_eq!(store.take_due(10_000).len(), 1);

        let patch = ServicePatch {
            enabled: None,
            pause_duration: Some(60),
        };
        store.update(&svc.id, &patch, 10_000).unwrap();
        assert!(store.take_due(30_000).is_empty());
        assert_eq!(store.take_due(70_000).len(), 1);
        assert_eq!(store.get(&svc.id).unwrap().service.pause_until, 0);

        let patch = ServicePatch {
            enabled: Some(false),
            pause_duration: None,
        };
        store.update(&svc.id, &patch, 70_000).unwrap();
        assert!(store.take_due(200_000).is_empty());
    }

    #[test]
    fn test_export_shape() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("s.json")).unwrap();
        store.add(ping("a")).unwrap();
        let value = serde_json::to_value(store.export()).unwrap();
        assert_eq!(value["services"][0]["name"], "a");
        assert_eq!(value["services"][0]["type"], 1);
    }
}
