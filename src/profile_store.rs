use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::StoreError,
    profile::Profile,
    settings::{to_sorted_json, write_file},
    share_link,
};

#[derive(Serialize, Deserialize, Default)]
struct ProfilesFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    selected: Option<Uuid>,
    #[serde(default)]
    profiles: Vec<Profile>,
}

/// One record of the `lines_config.json` export.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ExportedProfile {
    pub created: DateTime<Utc>,
    pub id: Uuid,
    pub profile: Profile,
}

/// Ordered profile list plus the current selection.
///
/// `profiles.toml` is the source of truth; `lines_config.json` is rewritten
/// next to it on every save for external tools.
pub struct ProfileStore {
    directory: PathBuf,
    profiles: Vec<Profile>,
    selected: Option<Uuid>,
}

impl ProfileStore {
    pub fn profiles_file_path(data_directory: &Path) -> PathBuf {
        data_directory.join("profiles.toml")
    }

    pub fn export_file_path(data_directory: &Path) -> PathBuf {
        data_directory.join("lines_config.json")
    }

    pub fn load(directory: PathBuf) -> Self {
        let path = Self::profiles_file_path(&directory);
        let file = match std::fs::read_to_string(&path) {
            Ok(content) => match toml::from_str::<ProfilesFile>(&content) {
                Ok(file) => {
                    log::info!(
                        "[profiles] loaded {} profiles from {}",
                        file.profiles.len(),
                        path.display()
                    );
                    Some(file)
                }
                Err(error) => {
                    log::warn!("[profiles] failed to parse {}: {error}", path.display());
                    None
                }
            },
            Err(_) => {
                log::info!("[profiles] no profile store at {}", path.display());
                None
            }
        };

        let mut store = match file {
            Some(file) if !file.profiles.is_empty() => Self {
                directory,
                profiles: file.profiles,
                selected: file.selected,
            },
            _ => {
                let sample = Profile::sample();
                log::info!("[profiles] creating sample profile {}", sample.id);
                Self {
                    directory,
                    selected: Some(sample.id),
                    profiles: vec![sample],
                }
            }
        };

        if store.selected.is_none_or(|selected| store.get(selected).is_none()) {
            if let Some(stale) = store.selected {
                log::warn!("[profiles] selected profile {stale} no longer exists");
            }
            store.selected = store.profiles.first().map(|profile| profile.id);
        }

        if let Err(error) = store.save() {
            log::warn!("[profiles] failed to write profile store: {error}");
        }
        store
    }

    pub fn profiles(&self) -> &[Profile] {
        &self.profiles
    }

    pub fn selected(&self) -> Option<&Profile> {
        self.selected.and_then(|id| self.get(id))
    }

    pub fn get(&self, id: Uuid) -> Option<&Profile> {
        self.profiles.iter().find(|profile| profile.id == id)
    }

    /// Looks a profile up by id, exact name, then case-insensitive name.
    pub fn find(&self, key: &str) -> Option<&Profile> {
        let key = key.trim();
        if let Ok(id) = Uuid::parse_str(key)
            && let Some(profile) = self.get(id)
        {
            return Some(profile);
        }
        self.profiles
            .iter()
            .find(|profile| profile.name == key)
            .or_else(|| {
                self.profiles
                    .iter()
                    .find(|profile| profile.name.eq_ignore_ascii_case(key))
            })
    }

    pub fn resolve(&self, key: &str) -> Result<&Profile, StoreError> {
        self.find(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    pub fn is_name_duplicate(&self, name: &str, excluding: Option<Uuid>) -> bool {
        let name = name.trim();
        self.profiles
            .iter()
            .filter(|profile| Some(profile.id) != excluding)
            .any(|profile| profile.name.trim() == name)
    }

    /// Appends a valid profile. A taken or nil id is replaced; a taken name
    /// is refused.
    pub fn add(&mut self, mut profile: Profile) -> Result<Uuid, StoreError> {
        check_valid(&profile)?;
        if self.is_name_duplicate(&profile.name, None) {
            return Err(StoreError::DuplicateName(profile.name));
        }
        if profile.id.is_nil() || self.get(profile.id).is_some() {
            let replacement = self.fresh_id();
            log::info!("[profiles] id {} is taken, using {replacement}", profile.id);
            profile.id = replacement;
        }

        let id = profile.id;
        log::info!("[profiles] added '{}' ({id})", profile.name);
        self.profiles.push(profile);
        self.save()?;
        Ok(id)
    }

    pub fn update(&mut self, profile: Profile) -> Result<(), StoreError> {
        check_valid(&profile)?;
        if self.is_name_duplicate(&profile.name, Some(profile.id)) {
            return Err(StoreError::DuplicateName(profile.name));
        }
        let Some(position) = self.position(profile.id) else {
            return Err(StoreError::NotFound(profile.id.to_string()));
        };

        log::info!("[profiles] updated '{}' ({})", profile.name, profile.id);
        self.profiles[position] = profile;
        self.save()
    }

    /// Removes a profile. Deleting the selected one selects the first left.
    pub fn delete(&mut self, id: Uuid) -> Result<Profile, StoreError> {
        let Some(position) = self.position(id) else {
            return Err(StoreError::NotFound(id.to_string()));
        };
        let removed = self.profiles.remove(position);
        if self.selected == Some(id) {
            self.selected = self.profiles.first().map(|profile| profile.id);
        }

        log::info!("[profiles] deleted '{}' ({id})", removed.name);
        self.save()?;
        Ok(removed)
    }

    pub fn duplicate(&mut self, id: Uuid) -> Result<Uuid, StoreError> {
        let Some(original) = self.get(id) else {
            return Err(StoreError::NotFound(id.to_string()));
        };
        let copy = Profile {
            id: self.fresh_id(),
            name: self.unique_name(&format!("{} copy", original.name)),
            ..original.clone()
        };
        self.add(copy)
    }

    pub fn select(&mut self, id: Option<Uuid>) -> Result<(), StoreError> {
        if let Some(id) = id
            && self.get(id).is_none()
        {
            return Err(StoreError::NotFound(id.to_string()));
        }
        self.selected = id;
        log::info!(
            "[profiles] selected {}",
            self.selected()
                .map(|profile| profile.name.as_str())
                .unwrap_or("nothing")
        );
        self.save()
    }

    /// Parses a share link or profile JSON and stores the result. A name
    /// that is already taken gets a numeric suffix.
    pub fn import(&mut self, raw_text: &str) -> Result<Uuid, StoreError> {
        let mut profile = share_link::parse(raw_text)?;
        check_valid(&profile)?;
        profile.name = self.unique_name(&profile.name);
        self.add(profile)
    }

    /// Writes the store and its export, first giving every profile a
    /// distinct id.
    pub fn save(&mut self) -> Result<(), StoreError> {
        self.ensure_unique_ids();

        let file = ProfilesFile {
            selected: self.selected,
            profiles: self.profiles.clone(),
        };
        let path = Self::profiles_file_path(&self.directory);
        write_file(&path, &toml::to_string_pretty(&file)?)?;

        let created = Utc::now();
        let export: Vec<ExportedProfile> = self
            .profiles
            .iter()
            .map(|profile| ExportedProfile {
                created,
                id: profile.id,
                profile: profile.clone(),
            })
            .collect();
        write_file(
            &Self::export_file_path(&self.directory),
            &to_sorted_json(&export)?,
        )?;

        log::debug!("[profiles] saved {}", path.display());
        Ok(())
    }

    fn ensure_unique_ids(&mut self) {
        let mut seen = HashSet::new();
        for index in 0..self.profiles.len() {
            if seen.contains(&self.profiles[index].id) || self.profiles[index].id.is_nil() {
                let mut replacement = Uuid::new_v4();
                while seen.contains(&replacement) {
                    replacement = Uuid::new_v4();
                }
                log::warn!(
                    "[profiles] reassigning duplicate id {} of '{}'",
                    self.profiles[index].id,
                    self.profiles[index].name
                );
                self.profiles[index].id = replacement;
            }
            seen.insert(self.profiles[index].id);
        }
    }

    fn position(&self, id: Uuid) -> Option<usize> {
        self.profiles.iter().position(|profile| profile.id == id)
    }

    fn fresh_id(&self) -> Uuid {
        let mut id = Uuid::new_v4();
        while self.get(id).is_some() {
            id = Uuid::new_v4();
        }
        id
    }

    fn unique_name(&self, base: &str) -> String {
        let base = base.trim();
        let mut name = base.to_string();
        let mut counter = 1u32;
        while self.is_name_duplicate(&name, None) {
            name = format!("{base}_{counter}");
            counter += 1;
        }
        name
    }
}

fn check_valid(profile: &Profile) -> Result<(), StoreError> {
    let errors = profile.validate();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(StoreError::Validation(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ValidationError,
        profile::{Protocol, TlsMode},
    };

    fn temp_directory() -> PathBuf {
        std::env::temp_dir().join(format!("v2rayctl-profiles-{}", Uuid::new_v4()))
    }

    const TROJAN_LINK: &str =
        "trojan://secret@tj.example.com:443?security=tls&sni=tj.example.com#Tokyo";

    #[test]
    fn empty_store_gets_sample_profile() {
        let directory = temp_directory();
        let store = ProfileStore::load(directory.clone());

        assert_eq!(store.profiles().len(), 1);
        assert_eq!(store.selected().unwrap().name, "Sample profile");
        assert!(ProfileStore::profiles_file_path(&directory).exists());
        assert!(ProfileStore::export_file_path(&directory).exists());

        std::fs::remove_dir_all(directory).ok();
    }

    #[test]
    fn store_round_trips_through_toml() {
        let directory = temp_directory();
        let mut store = ProfileStore::load(directory.clone());
        let id = store.import(TROJAN_LINK).unwrap();
        store.select(Some(id)).unwrap();

        let reloaded = ProfileStore::load(directory.clone());
        assert_eq!(reloaded.profiles().len(), 2);
        let selected = reloaded.selected().unwrap();
        assert_eq!(selected.name, "Tokyo");
        assert_eq!(selected.protocol, Protocol::Trojan);
        assert_eq!(selected.tls_mode, TlsMode::Tls);

        std::fs::remove_dir_all(directory).ok();
    }

    #[test]
    fn import_suffixes_taken_names() {
        let directory = temp_directory();
        let mut store = ProfileStore::load(directory.clone());
        let first = store.import(TROJAN_LINK).unwrap();
        let second = store.import(TROJAN_LINK).unwrap();

        assert_ne!(first, second);
        assert_eq!(store.get(second).unwrap().name, "Tokyo_1");

        std::fs::remove_dir_all(directory).ok();
    }

    #[test]
    fn import_rejects_invalid_profiles_without_saving() {
        let directory = temp_directory();
        let mut store = ProfileStore::load(directory.clone());

        let error = store
            .import(r#"{"protocolType":"shadowsocks","serverAddress":"1.2.3.4","name":"ss","password":"pw"}"#)
            .unwrap_err();
        match error {
            StoreError::Validation(errors) => {
                assert!(errors.contains(&ValidationError::MethodRequired))
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.profiles().len(), 1);
        assert!(matches!(
            store.import("hello"),
            Err(StoreError::Parse(_))
        ));

        std::fs::remove_dir_all(directory).ok();
    }

    #[test]
    fn nil_and_colliding_ids_are_reassigned_on_import() {
        let directory = temp_directory();
        let mut store = ProfileStore::load(directory.clone());
        let sample_id = store.profiles()[0].id;

        let nil = store
            .import(&format!(
                r#"{{"id":"{}","protocolType":"trojan","serverAddress":"a.example","name":"a","password":"pw"}}"#,
                Uuid::nil()
            ))
            .unwrap();
        let colliding = store
            .import(&format!(
                r#"{{"id":"{sample_id}","protocolType":"trojan","serverAddress":"b.example","name":"b","password":"pw"}}"#
            ))
            .unwrap();

        assert!(!nil.is_nil());
        assert_ne!(colliding, sample_id);
        assert_eq!(store.profiles().len(), 3);

        std::fs::remove_dir_all(directory).ok();
    }

    #[test]
    fn deleting_selected_moves_selection_to_first() {
        let directory = temp_directory();
        let mut store = ProfileStore::load(directory.clone());
        let sample_id = store.profiles()[0].id;
        let imported = store.import(TROJAN_LINK).unwrap();
        store.select(Some(imported)).unwrap();

        store.delete(imported).unwrap();
        assert_eq!(store.selected().map(|profile| profile.id), Some(sample_id));

        store.delete(sample_id).unwrap();
        assert!(store.selected().is_none());
        assert!(matches!(store.delete(sample_id), Err(StoreError::NotFound(_))));

        std::fs::remove_dir_all(directory).ok();
    }

    #[test]
    fn duplicate_gets_copy_name_and_new_id() {
        let directory = temp_directory();
        let mut store = ProfileStore::load(directory.clone());
        let sample_id = store.profiles()[0].id;

        let copy = store.duplicate(sample_id).unwrap();
        let again = store.duplicate(sample_id).unwrap();

        assert_ne!(copy, sample_id);
        assert_eq!(store.get(copy).unwrap().name, "Sample profile copy");
        assert_eq!(store.get(again).unwrap().name, "Sample profile copy_1");
        assert_eq!(store.get(copy).unwrap().address, "example.com");

        std::fs::remove_dir_all(directory).ok();
    }

    #[test]
    fn update_rejects_taken_name() {
        let directory = temp_directory();
        let mut store = ProfileStore::load(directory.clone());
        let imported = store.import(TROJAN_LINK).unwrap();

        let mut renamed = store.get(imported).unwrap().clone();
        renamed.name = "Sample profile".into();
        assert!(matches!(
            store.update(renamed.clone()),
            Err(StoreError::DuplicateName(_))
        ));

        renamed.name = "Osaka".into();
        store.update(renamed).unwrap();
        assert_eq!(store.find("osaka").unwrap().id, imported);
        assert_eq!(store.find(&imported.to_string()).unwrap().name, "Osaka");

        std::fs::remove_dir_all(directory).ok();
    }

    #[test]
    fn add_refuses_taken_name() {
        let directory = temp_directory();
        let mut store = ProfileStore::load(directory.clone());

        let clone = Profile {
            id: Uuid::new_v4(),
            ..store.profiles()[0].clone()
        };
        assert!(matches!(
            store.add(clone),
            Err(StoreError::DuplicateName(name)) if name == "Sample profile"
        ));
        assert_eq!(store.profiles().len(), 1);

        std::fs::remove_dir_all(directory).ok();
    }

    #[test]
    fn stale_or_missing_selection_falls_back_to_first() {
        let directory = temp_directory();
        let mut store = ProfileStore::load(directory.clone());
        let first = store.profiles()[0].id;
        store.import(TROJAN_LINK).unwrap();

        let mut file = ProfilesFile {
            selected: Some(Uuid::new_v4()),
            profiles: store.profiles().to_vec(),
        };
        let path = ProfileStore::profiles_file_path(&directory);
        write_file(&path, &toml::to_string_pretty(&file).unwrap()).unwrap();
        let reloaded = ProfileStore::load(directory.clone());
        assert_eq!(reloaded.selected().map(|profile| profile.id), Some(first));

        file.selected = None;
        write_file(&path, &toml::to_string_pretty(&file).unwrap()).unwrap();
        let reloaded = ProfileStore::load(directory.clone());
        assert_eq!(reloaded.selected().map(|profile| profile.id), Some(first));

        std::fs::remove_dir_all(directory).ok();
    }

    #[test]
    fn duplicate_ids_on_disk_are_healed() {
        let directory = temp_directory();
        let mut first = Profile::sample();
        first.name = "first".into();
        let mut second = first.clone();
        second.name = "second".into();
        let file = ProfilesFile {
            selected: None,
            profiles: vec![first, second],
        };
        write_file(
            &ProfileStore::profiles_file_path(&directory),
            &toml::to_string_pretty(&file).unwrap(),
        )
        .unwrap();

        let store = ProfileStore::load(directory.clone());
        assert_ne!(store.profiles()[0].id, store.profiles()[1].id);

        std::fs::remove_dir_all(directory).ok();
    }

    #[test]
    fn export_has_sorted_records() {
        let directory = temp_directory();
        let store = ProfileStore::load(directory.clone());

        let content = std::fs::read_to_string(ProfileStore::export_file_path(&directory)).unwrap();
        let records: Vec<ExportedProfile> = serde_json::from_str(&content).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, store.profiles()[0].id);
        let created = content.find("\"created\"").unwrap();
        let id = content.find("\"id\"").unwrap();
        assert!(created < id);

        std::fs::remove_dir_all(directory).ok();
    }
}
