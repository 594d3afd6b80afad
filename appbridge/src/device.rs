use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::Mutex;

/// Wire shape of a device inside a configuration snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub unique_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sw_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hw_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_area: Option<String>,
}

/// A tracked device, primary or secondary.
///
/// `via_device` points a secondary device back at the primary by unique id.
/// It is a lookup reference only and never owns the primary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    #[serde(flatten)]
    pub info: DeviceInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via_device: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeviceDiff {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
}

/// The primary and secondary devices exposed by one app session.
///
/// The primary device lives as long as the session does: it is upserted on
/// every sync but never removed by reconciliation, only by session teardown.
/// Secondary devices are removed when absent from the newest snapshot.
#[derive(Debug, Default)]
pub struct DeviceDirectory {
    primary: Option<DeviceRecord>,
    secondary: BTreeMap<String, DeviceRecord>,
}

impl DeviceDirectory {
    pub fn primary(&self) -> Option<&DeviceRecord> {
        self.primary.as_ref()
    }

    pub fn get(&self, unique_id: &str) -> Option<&DeviceRecord> {
        match &self.primary {
            Some(primary) if primary.info.unique_id == unique_id => Some(primary),
            _ => self.secondary.get(unique_id),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.primary.iter().chain(self.secondary.values())
    }

    pub fn reconcile(&mut self, primary: &DeviceInfo, secondary: &[DeviceInfo]) -> DeviceDiff {
        let mut diff = DeviceDiff::default();

        match &mut self.primary {
            Some(record) => {
                record.info = primary.clone();
                diff.updated.push(primary.unique_id.clone());
            }
            None => {
                self.primary = Some(DeviceRecord {
                    info: primary.clone(),
                    via_device: None,
                });
                diff.created.push(primary.unique_id.clone());
            }
        }

        let mut seen = BTreeSet::new();
        for info in secondary {
            if info.unique_id == primary.unique_id {
                tracing::warn!(
                    unique_id = %info.unique_id,
                    "Ignoring secondary device that shares the primary's unique id"
                );
                continue;
            }
            if !seen.insert(info.unique_id.clone()) {
                tracing::warn!(
                    unique_id = %info.unique_id,
                    "Ignoring duplicate secondary device in configuration snapshot"
                );
                continue;
            }

            match self.secondary.get_mut(&info.unique_id) {
                Some(record) => {
                    record.info = info.clone();
                    record.via_device = Some(primary.unique_id.clone());
                    diff.updated.push(info.unique_id.clone());
                }
                None => {
                    self.secondary.insert(
                        info.unique_id.clone(),
                        DeviceRecord {
                            info: info.clone(),
                            via_device: Some(primary.unique_id.clone()),
                        },
                    );
                    diff.created.push(info.unique_id.clone());
                }
            }
        }

        let stale: Vec<String> = self
            .secondary
            .keys()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();
        for id in stale {
            self.secondary.remove(&id);
            diff.removed.push(id);
        }

        diff
    }
}

/// Host-platform seam: the bridge mirrors its device directory into this
/// registry on every reconciliation.
#[async_trait::async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn upsert(&self, app: &str, record: &DeviceRecord) -> anyhow::Result<()>;
    async fn remove(&self, app: &str, unique_id: &str) -> anyhow::Result<()>;
}

/// Simple map-backed registry, used in tests and by embedded hosts.
#[derive(Debug, Default)]
pub struct InMemoryDeviceRegistry {
    inner: Mutex<BTreeMap<(String, String), DeviceRecord>>,
}

impl InMemoryDeviceRegistry {
    pub async fn get(&self, app: &str, unique_id: &str) -> Option<DeviceRecord> {
        self.inner
            .lock()
            .await
            .get(&(app.to_owned(), unique_id.to_owned()))
            .cloned()
    }

    pub async fn ids(&self, app: &str) -> Vec<String> {
        self.inner
            .lock()
            .await
            .keys()
            .filter(|(a, _)| a == app)
            .map(|(_, id)| id.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl DeviceRegistry for InMemoryDeviceRegistry {
    async fn upsert(&self, app: &str, record: &DeviceRecord) -> anyhow::Result<()> {
        self.inner.lock().await.insert(
            (app.to_owned(), record.info.unique_id.clone()),
            record.clone(),
        );
        Ok(())
    }

    async fn remove(&self, app: &str, unique_id: &str) -> anyhow::Result<()> {
        self.inner
            .lock()
            .await
            .remove(&(app.to_owned(), unique_id.to_owned()));
        Ok(())
    }
}
