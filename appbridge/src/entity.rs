use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::Mutex;

/// Capability domain of an entity, i.e. which kind of controllable or
/// observable point it represents on the remote app.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Domain {
    BinarySensor,
    Button,
    Lock,
    Number,
    Select,
    Sensor,
    Switch,
    Text,
}

/// A single attribute value as reported by the remote app.
///
/// Apps ship free-form attribute bags; we pin them down to this small tagged
/// union instead of handing untyped JSON through the whole bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<AttrValue>),
}

pub type AttrMap = BTreeMap<String, AttrValue>;

/// Wire shape of an entity inside a configuration snapshot.
///
/// Everything the bridge does not model explicitly lands in the flattened
/// attribute bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDefinition {
    pub unique_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_id: Option<String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default, flatten)]
    pub attributes: AttrMap,
}

/// Live state of one remote-controlled entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub unique_id: String,
    pub domain: Domain,
    pub name: String,
    pub icon: Option<String>,
    pub category: Option<String>,
    pub labels: Vec<String>,
    pub area_id: Option<String>,
    /// Weak reference into the device directory, by unique id.
    pub device_id: Option<String>,
    pub disabled: bool,
    pub attributes: AttrMap,
}

impl EntityRecord {
    fn from_definition(domain: Domain, def: &EntityDefinition, device_id: &str) -> Self {
        Self {
            unique_id: def.unique_id.clone(),
            domain,
            name: def.name.clone(),
            icon: def.icon.clone(),
            category: def.category.clone(),
            labels: def.labels.clone(),
            area_id: def.area_id.clone(),
            device_id: Some(device_id.to_owned()),
            disabled: def.disabled,
            attributes: def.attributes.clone(),
        }
    }

    /// Overwrites the fields present in `def`, keeping attributes that only
    /// exist on the live record (e.g. set through earlier update events).
    fn merge_definition(&mut self, domain: Domain, def: &EntityDefinition, device_id: &str) {
        self.domain = domain;
        self.name = def.name.clone();
        self.icon = def.icon.clone();
        self.category = def.category.clone();
        self.labels = def.labels.clone();
        self.area_id = def.area_id.clone();
        self.device_id = Some(device_id.to_owned());
        self.disabled = def.disabled;
        for (key, value) in &def.attributes {
            self.attributes.insert(key.clone(), value.clone());
        }
    }

    /// Flat key→value view of the record: the modelled fields folded into the
    /// attribute bag, as carried by update events.
    pub fn merged_data(&self) -> AttrMap {
        fn text_or_null(value: &Option<String>) -> AttrValue {
            match value {
                Some(text) => AttrValue::Text(text.clone()),
                None => AttrValue::Null,
            }
        }

        let mut data = self.attributes.clone();
        data.insert("name".to_owned(), AttrValue::Text(self.name.clone()));
        data.insert("icon".to_owned(), text_or_null(&self.icon));
        data.insert("category".to_owned(), text_or_null(&self.category));
        data.insert("area_id".to_owned(), text_or_null(&self.area_id));
        data.insert("disabled".to_owned(), AttrValue::Bool(self.disabled));
        data.insert(
            "labels".to_owned(),
            AttrValue::List(self.labels.iter().cloned().map(AttrValue::Text).collect()),
        );
        data
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no entity with this unique id is tracked for the session")]
pub struct UnknownEntity;

/// Outcome of one reconciliation pass. An id appears in at most one of the
/// three sets unless its identity (domain) changed, in which case it is
/// removed and re-created in the same pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EntityDiff {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
}

impl EntityDiff {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// The current set of entities owned by one app session, across all domains.
#[derive(Debug, Default)]
pub struct EntityDirectory {
    records: BTreeMap<String, EntityRecord>,
}

impl EntityDirectory {
    pub fn get(&self, unique_id: &str) -> Option<&EntityRecord> {
        self.records.get(unique_id)
    }

    pub fn contains(&self, unique_id: &str) -> bool {
        self.records.contains_key(unique_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityRecord> {
        self.records.values()
    }

    /// Applies a partial update to a tracked entity, shallow key overwrite.
    ///
    /// Keys matching a modelled field update that field; everything else goes
    /// into the attribute bag. Returns the merged record.
    pub fn merge_changes(
        &mut self,
        unique_id: &str,
        changes: &AttrMap,
    ) -> Result<&EntityRecord, UnknownEntity> {
        let record = self.records.get_mut(unique_id).ok_or(UnknownEntity)?;

        for (key, value) in changes {
            match (key.as_str(), value) {
                ("name", AttrValue::Text(name)) => record.name = name.clone(),
                ("icon", AttrValue::Text(icon)) => record.icon = Some(icon.clone()),
                ("icon", AttrValue::Null) => record.icon = None,
                ("category", AttrValue::Text(category)) => record.category = Some(category.clone()),
                ("category", AttrValue::Null) => record.category = None,
                ("area_id", AttrValue::Text(area)) => record.area_id = Some(area.clone()),
                ("area_id", AttrValue::Null) => record.area_id = None,
                ("disabled", AttrValue::Bool(disabled)) => record.disabled = *disabled,
                ("labels", AttrValue::List(items)) => {
                    record.labels = items
                        .iter()
                        .filter_map(|item| match item {
                            AttrValue::Text(label) => Some(label.clone()),
                            _ => None,
                        })
                        .collect();
                }
                _ => {
                    record.attributes.insert(key.clone(), value.clone());
                }
            }
        }

        Ok(&self.records[unique_id])
    }

    /// Reconciles the directory against a new snapshot in a single pass.
    ///
    /// Tracked entities present in the snapshot are merged in place (the map
    /// entry is reused, never re-inserted), new ones are created, and tracked
    /// entities absent from the snapshot are dropped.
    pub fn reconcile(
        &mut self,
        domains: &BTreeMap<Domain, Vec<EntityDefinition>>,
        primary_device_id: &str,
    ) -> EntityDiff {
        let mut diff = EntityDiff::default();
        let mut seen = BTreeSet::new();

        for (domain, definitions) in domains {
            for def in definitions {
                if !seen.insert(def.unique_id.clone()) {
                    tracing::warn!(
                        unique_id = %def.unique_id,
                        %domain,
                        "Ignoring duplicate unique id in configuration snapshot"
                    );
                    continue;
                }

                match self.records.get_mut(&def.unique_id) {
                    Some(record) if record.domain == *domain => {
                        record.merge_definition(*domain, def, primary_device_id);
                        diff.updated.push(def.unique_id.clone());
                    }
                    Some(record) => {
                        // Same id, different domain: the identity changed, so
                        // the old record must go before the new one appears.
                        tracing::debug!(
                            unique_id = %def.unique_id,
                            old_domain = %record.domain,
                            new_domain = %domain,
                            "Entity changed domain, recreating"
                        );
                        self.records.insert(
                            def.unique_id.clone(),
                            EntityRecord::from_definition(*domain, def, primary_device_id),
                        );
                        diff.removed.push(def.unique_id.clone());
                        diff.created.push(def.unique_id.clone());
                    }
                    None => {
                        self.records.insert(
                            def.unique_id.clone(),
                            EntityRecord::from_definition(*domain, def, primary_device_id),
                        );
                        diff.created.push(def.unique_id.clone());
                    }
                }
            }
        }

        let stale: Vec<String> = self
            .records
            .keys()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();
        for id in stale {
            self.records.remove(&id);
            diff.removed.push(id);
        }

        diff
    }
}

/// Host-platform seam: the bridge mirrors its entity directory into this
/// registry on every reconciliation.
#[async_trait::async_trait]
pub trait EntityRegistry: Send + Sync {
    async fn upsert(&self, app: &str, record: &EntityRecord) -> anyhow::Result<()>;
    async fn remove(&self, app: &str, unique_id: &str) -> anyhow::Result<()>;
}

/// Simple map-backed registry, used in tests and by embedded hosts.
#[derive(Debug, Default)]
pub struct InMemoryEntityRegistry {
    inner: Mutex<BTreeMap<(String, String), EntityRecord>>,
}

impl InMemoryEntityRegistry {
    pub async fn get(&self, app: &str, unique_id: &str) -> Option<EntityRecord> {
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
impl EntityRegistry for InMemoryEntityRegistry {
    async fn upsert(&self, app: &str, record: &EntityRecord) -> anyhow::Result<()> {
        self.inner
            .lock()
            .await
            .insert((app.to_owned(), record.unique_id.clone()), record.clone());
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

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(unique_id: &str, name: &str) -> EntityDefinition {
        EntityDefinition {
            unique_id: unique_id.to_owned(),
            name: name.to_owned(),
            icon: None,
            category: None,
            labels: vec![],
            area_id: None,
            disabled: false,
            attributes: AttrMap::new(),
        }
    }

    fn snapshot_domains(ids: &[&str]) -> BTreeMap<Domain, Vec<EntityDefinition>> {
        let mut domains = BTreeMap::new();
        domains.insert(
            Domain::Sensor,
            ids.iter().map(|id| definition(id, id)).collect(),
        );
        domains
    }

    #[test]
    fn reconcile_creates_updates_and_removes_disjointly() {
        let mut directory = EntityDirectory::default();

        let diff = directory.reconcile(&snapshot_domains(&["a", "b", "c"]), "dev-1");
        assert_eq!(diff.created, vec!["a", "b", "c"]);
        assert!(diff.updated.is_empty());
        assert!(diff.removed.is_empty());

        let diff = directory.reconcile(&snapshot_domains(&["b", "c", "d"]), "dev-1");
        assert_eq!(diff.created, vec!["d"]);
        assert_eq!(diff.updated, vec!["b", "c"]);
        assert_eq!(diff.removed, vec!["a"]);
        assert!(!directory.contains("a"));
    }

    #[test]
    fn reconcile_updates_in_place_keeping_live_attributes() {
        let mut directory = EntityDirectory::default();
        directory.reconcile(&snapshot_domains(&["b"]), "dev-1");

        let mut changes = AttrMap::new();
        changes.insert("native_value".to_owned(), AttrValue::Number(21.5));
        directory.merge_changes("b", &changes).unwrap();

        directory.reconcile(&snapshot_domains(&["b"]), "dev-1");

        // The live attribute survives the sync, proving the record was merged
        // rather than recreated.
        assert_eq!(
            directory.get("b").unwrap().attributes.get("native_value"),
            Some(&AttrValue::Number(21.5))
        );
    }

    #[test]
    fn merge_changes_maps_known_fields_and_bags_the_rest() {
        let mut directory = EntityDirectory::default();
        directory.reconcile(&snapshot_domains(&["a"]), "dev-1");

        let mut changes = AttrMap::new();
        changes.insert("name".to_owned(), AttrValue::Text("renamed".to_owned()));
        changes.insert("disabled".to_owned(), AttrValue::Bool(true));
        changes.insert("battery".to_owned(), AttrValue::Number(80.0));

        let record = directory.merge_changes("a", &changes).unwrap();

        assert_eq!(record.name, "renamed");
        assert!(record.disabled);
        assert_eq!(
            record.attributes.get("battery"),
            Some(&AttrValue::Number(80.0))
        );
    }

    #[test]
    fn merged_data_folds_model_fields_into_the_bag() {
        let mut directory = EntityDirectory::default();
        directory.reconcile(&snapshot_domains(&["a"]), "dev-1");

        let mut changes = AttrMap::new();
        changes.insert("name".to_owned(), AttrValue::Text("renamed".to_owned()));
        changes.insert("battery".to_owned(), AttrValue::Number(80.0));
        let data = directory.merge_changes("a", &changes).unwrap().merged_data();

        assert_eq!(data.get("name"), Some(&AttrValue::Text("renamed".to_owned())));
        assert_eq!(data.get("battery"), Some(&AttrValue::Number(80.0)));
        assert_eq!(data.get("disabled"), Some(&AttrValue::Bool(false)));
    }

    #[test]
    fn merge_changes_for_unknown_entity_is_an_error() {
        let mut directory = EntityDirectory::default();

        assert_eq!(
            directory.merge_changes("ghost", &AttrMap::new()),
            Err(UnknownEntity)
        );
    }

    #[test]
    fn domain_change_recreates_the_entity() {
        let mut directory = EntityDirectory::default();
        directory.reconcile(&snapshot_domains(&["a"]), "dev-1");

        let mut domains = BTreeMap::new();
        domains.insert(Domain::Switch, vec![definition("a", "a")]);
        let diff = directory.reconcile(&domains, "dev-1");

        assert_eq!(diff.created, vec!["a"]);
        assert_eq!(diff.removed, vec!["a"]);
        assert_eq!(directory.get("a").unwrap().domain, Domain::Switch);
    }

    #[test]
    fn duplicate_unique_id_in_snapshot_is_ignored() {
        let mut directory = EntityDirectory::default();

        let mut domains = BTreeMap::new();
        domains.insert(
            Domain::Sensor,
            vec![definition("a", "first"), definition("a", "second")],
        );
        let diff = directory.reconcile(&domains, "dev-1");

        assert_eq!(diff.created, vec!["a"]);
        assert_eq!(directory.get("a").unwrap().name, "first");
    }

    #[test]
    fn attr_value_round_trips_through_json() {
        let value = AttrValue::List(vec![
            AttrValue::Null,
            AttrValue::Bool(true),
            AttrValue::Number(3.5),
            AttrValue::Text("on".to_owned()),
        ]);

        let json = serde_json::to_string(&value).unwrap();
        let back: AttrValue = serde_json::from_str(&json).unwrap();

        assert_eq!(back, value);
    }

    #[test]
    fn entity_definition_collects_unknown_keys_into_attributes() {
        let json = r#"{
            "unique_id": "sensor-1",
            "name": "CPU load",
            "native_value": 0.42,
            "unit_of_measurement": "%"
        }"#;

        let def: EntityDefinition = serde_json::from_str(json).unwrap();

        assert_eq!(
            def.attributes.get("native_value"),
            Some(&AttrValue::Number(0.42))
        );
        assert_eq!(
            def.attributes.get("unit_of_measurement"),
            Some(&AttrValue::Text("%".to_owned()))
        );
    }
}
