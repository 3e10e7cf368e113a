//! Named presets: slot count, probe config and target addresses.
//!
//! Wire format of one preset value: `<slotCount>;<intervalMillis>;<count>;<csv addresses>`,
//! stored under `preset_<name>` with spaces in the name escaped as `\ `.

mod store;

pub use store::*;

use serde::{Deserialize, Serialize};

use crate::probe::ProbeConfig;

/// Namespace prefix of preset keys.
pub const PRESET_PREFIX: &str = "preset_";

const FIELD_SEPARATOR: char = ';';
const ADDRESS_SEPARATOR: char = ',';

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preset {
    pub name: String,
    pub slot_count: usize,
    pub interval_millis: u64,
    pub count: u32,
    pub addresses: Vec<String>,
}

impl Preset {
    pub fn new<S: AsRef<str>>(
        name: &str,
        slot_count: usize,
        interval_millis: u64,
        count: u32,
        addresses: &[S],
    ) -> Self {
        Self {
            name: name.to_string(),
            slot_count,
            interval_millis,
            count,
            addresses: addresses.iter().map(|a| a.as_ref().to_string()).collect(),
        }
    }

    pub fn key(&self) -> String {
        preset_key(&self.name)
    }

    pub fn config(&self) -> ProbeConfig {
        ProbeConfig::new(self.interval_millis, self.count)
    }

    pub fn encode(&self) -> String {
        format!(
            "{}{sep}{}{sep}{}{sep}{}",
            self.slot_count,
            self.interval_millis,
            self.count,
            self.addresses.join(","),
            sep = FIELD_SEPARATOR
        )
    }

    /// Decode a stored value. Malformed input yields `None`.
    pub fn decode(name: &str, value: &str) -> Option<Self> {
        let fields: Vec<&str> = value.split(FIELD_SEPARATOR).collect();
        let [slot_count, interval, count, addresses] = fields.as_slice() else {
            return None;
        };

        let slot_count: usize = slot_count.trim().parse().ok()?;
        if slot_count < 1 {
            return None;
        }
        let interval_millis: u64 = interval.trim().parse().ok()?;
        let count: u32 = match count.trim() {
            "" => 0,
            n => n.parse().ok()?,
        };

        // more addresses than slots is kept; only the first `slot_count` get loaded
        let addresses: Vec<String> = if addresses.is_empty() {
            Vec::new()
        } else {
            addresses
                .split(ADDRESS_SEPARATOR)
                .map(str::to_string)
                .collect()
        };

        Some(Self {
            name: name.to_string(),
            slot_count,
            interval_millis,
            count,
            addresses,
        })
    }
}

/// Store key for a preset name.
pub fn preset_key(name: &str) -> String {
    format!("{}{}", PRESET_PREFIX, name.replace(' ', "\\ "))
}

/// Preset name for a store key, if the key is in the preset namespace.
pub fn preset_name(key: &str) -> Option<String> {
    key.strip_prefix(PRESET_PREFIX)
        .map(|name| name.replace("\\ ", " "))
}

/// Save and persist a preset, replacing any preset of the same name.
pub fn save_preset<S: PresetStore + ?Sized>(store: &mut S, preset: &Preset) -> Result<(), StoreError> {
    store.set(&preset.key(), &preset.encode());
    store.persist()?;
    tracing::info!(name = %preset.name, "Saved preset");
    Ok(())
}

/// Load a preset. Missing or malformed entries both mean "nothing to load".
pub fn load_preset<S: PresetStore + ?Sized>(store: &S, name: &str) -> Option<Preset> {
    let value = store.get(&preset_key(name), "");
    if value.is_empty() {
        return None;
    }
    let preset = Preset::decode(name, &value);
    if preset.is_none() {
        tracing::debug!(name, value = %value, "Ignoring malformed preset");
    }
    preset
}

/// Delete a preset. Returns whether it existed.
pub fn delete_preset<S: PresetStore + ?Sized>(store: &mut S, name: &str) -> Result<bool, StoreError> {
    let key = preset_key(name);
    if !store.keys().contains(&key) {
        return Ok(false);
    }
    store.remove(&key);
    store.persist()?;
    Ok(true)
}

/// Names of all stored presets, sorted.
pub fn list_presets<S: PresetStore + ?Sized>(store: &S) -> Vec<String> {
    store
        .keys()
        .iter()
        .filter_map(|key| preset_name(key))
        .collect()
}
