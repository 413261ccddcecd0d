//! External collaborator seams: device keys, attributes, upstream API,
//! firmware store. Reference implementations live next to each trait.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use rsa::RsaPublicKey;

use crate::gateway::DeviceId;
use crate::gateway::flasher::FlashError;

/// Device public keys, keyed by device id.
pub trait DeviceKeyStore: Send + Sync {
    fn public_key(&self, device_id: &DeviceId) -> Option<RsaPublicKey>;
}

#[derive(Clone, Default)]
pub struct MemoryKeyStore {
    keys: Arc<Mutex<BTreeMap<DeviceId, RsaPublicKey>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, device_id: DeviceId, key: RsaPublicKey) {
        self.keys.lock().expect("key store lock").insert(device_id, key);
    }
}

impl DeviceKeyStore for MemoryKeyStore {
    fn public_key(&self, device_id: &DeviceId) -> Option<RsaPublicKey> {
        self.keys.lock().expect("key store lock").get(device_id).cloned()
    }
}

/// Per-device key/value attributes (`claimCode`, `spark_system_version`,
/// `name`, `userid`, ...).
pub trait AttributeStore: Send + Sync {
    fn get_core_attributes(&self, device_id: &DeviceId) -> BTreeMap<String, String>;
    fn set_core_attribute(&self, device_id: &DeviceId, key: &str, value: &str);
}

#[derive(Clone, Default)]
pub struct MemoryAttributeStore {
    attributes: Arc<Mutex<BTreeMap<DeviceId, BTreeMap<String, String>>>>,
}

impl MemoryAttributeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AttributeStore for MemoryAttributeStore {
    fn get_core_attributes(&self, device_id: &DeviceId) -> BTreeMap<String, String> {
        self.attributes
            .lock()
            .expect("attribute store lock")
            .get(device_id)
            .cloned()
            .unwrap_or_default()
    }

    fn set_core_attribute(&self, device_id: &DeviceId, key: &str, value: &str) {
        self.attributes
            .lock()
            .expect("attribute store lock")
            .entry(*device_id)
            .or_default()
            .insert(key.to_string(), value.to_string());
    }
}

/// Upstream API calls the gateway makes on a device's behalf.
pub trait ApiClient: Send + Sync {
    fn link_device(&self, device_id: &DeviceId, claim_code: &str, product_id: u16);
    fn safe_mode(&self, device_id: &DeviceId, payload: &[u8]);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApiCall {
    LinkDevice {
        device_id: DeviceId,
        claim_code: String,
        product_id: u16,
    },
    SafeMode {
        device_id: DeviceId,
        payload: Vec<u8>,
    },
}

/// Records calls for assertion; stands in for the real backend client.
#[derive(Clone, Default)]
pub struct RecordingApiClient {
    calls: Arc<Mutex<Vec<ApiCall>>>,
}

impl RecordingApiClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.calls.lock().expect("api client lock").clone()
    }
}

impl ApiClient for RecordingApiClient {
    fn link_device(&self, device_id: &DeviceId, claim_code: &str, product_id: u16) {
        self.calls.lock().expect("api client lock").push(ApiCall::LinkDevice {
            device_id: *device_id,
            claim_code: claim_code.to_string(),
            product_id,
        });
    }

    fn safe_mode(&self, device_id: &DeviceId, payload: &[u8]) {
        self.calls.lock().expect("api client lock").push(ApiCall::SafeMode {
            device_id: *device_id,
            payload: payload.to_vec(),
        });
    }
}

/// Read-only firmware lookup.
pub trait FirmwareStore: Send + Sync {
    fn known_firmware(&self, app: &str) -> Result<Vec<u8>, FlashError>;
}

/// Resolves `known_firmware/<app>_<env>.bin` under a root directory.
#[derive(Clone, Debug)]
pub struct DirFirmwareStore {
    root: PathBuf,
    environment: String,
}

impl DirFirmwareStore {
    pub fn new(root: impl Into<PathBuf>, environment: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            environment: environment.into(),
        }
    }

    fn path_for(&self, app: &str) -> PathBuf {
        self.root
            .join("known_firmware")
            .join(format!("{app}_{}.bin", self.environment))
    }
}

impl FirmwareStore for DirFirmwareStore {
    fn known_firmware(&self, app: &str) -> Result<Vec<u8>, FlashError> {
        std::fs::read(self.path_for(app)).map_err(|_| FlashError::UnknownFirmware {
            app: app.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_id() -> DeviceId {
        DeviceId::from_bytes([7; 12])
    }

    #[test]
    fn attributes_are_scoped_per_device() {
        let store = MemoryAttributeStore::new();
        store.set_core_attribute(&device_id(), "claimCode", "ABCDEF");
        store.set_core_attribute(&DeviceId::from_bytes([8; 12]), "claimCode", "OTHER");

        let attrs = store.get_core_attributes(&device_id());
        assert_eq!(attrs.get("claimCode").map(String::as_str), Some("ABCDEF"));
        assert_eq!(attrs.len(), 1);
    }

    #[test]
    fn recording_api_keeps_call_order() {
        let api = RecordingApiClient::new();
        api.link_device(&device_id(), "ABCDEF", 6);
        api.safe_mode(&device_id(), b"details");
        let calls = api.calls();
        assert_eq!(calls.len(), 2);
        assert!(matches!(calls[0], ApiCall::LinkDevice { .. }));
        assert!(matches!(calls[1], ApiCall::SafeMode { .. }));
    }

    #[test]
    fn firmware_lookup_resolves_app_and_environment() {
        let dir = tempfile::tempdir().unwrap();
        let fw_dir = dir.path().join("known_firmware");
        std::fs::create_dir_all(&fw_dir).unwrap();
        std::fs::write(fw_dir.join("tinker_production.bin"), b"binary").unwrap();

        let store = DirFirmwareStore::new(dir.path(), "production");
        assert_eq!(store.known_firmware("tinker").unwrap(), b"binary");
        assert!(matches!(
            store.known_firmware("absent"),
            Err(FlashError::UnknownFirmware { .. })
        ));
    }
}
