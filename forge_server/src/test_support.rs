//! Test harness utilities — an in-memory recording cloud adapter and
//! state construction helpers shared by the unit and integration suites.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::cloud::{CloudProvider, ImageInfo};
use crate::config::Config;
use crate::routes::AppState;
use crate::services::builder::Builder;
use crate::store::BuildStore;

/// Recording cloud adapter. Every mutation is captured for assertions;
/// failure injection flips the `fail_*` switches.
#[derive(Default)]
pub struct MockCloud {
    images: Mutex<Vec<ImageInfo>>,
    created_vms: Mutex<Vec<String>>,
    deleted_vms: Mutex<Vec<String>>,
    rename_calls: Mutex<Vec<(String, String)>>,
    delete_by_name_calls: Mutex<Vec<String>>,
    pub fail_upload: AtomicBool,
    pub fail_vm_active: AtomicBool,
    next_image: AtomicU64,
    next_vm: AtomicU64,
}

impl MockCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_image(&self, id: &str, name: &str) {
        self.images.lock().unwrap().push(ImageInfo {
            id: id.to_string(),
            name: name.to_string(),
            status: "active".to_string(),
            size: 0,
            created_at: String::new(),
        });
    }

    pub fn images(&self) -> Vec<ImageInfo> {
        self.images.lock().unwrap().clone()
    }

    pub fn image_named(&self, name: &str) -> Option<ImageInfo> {
        self.images.lock().unwrap().iter().find(|i| i.name == name).cloned()
    }

    pub fn created_vms(&self) -> Vec<String> {
        self.created_vms.lock().unwrap().clone()
    }

    pub fn deleted_vms(&self) -> Vec<String> {
        self.deleted_vms.lock().unwrap().clone()
    }

    pub fn rename_calls(&self) -> Vec<(String, String)> {
        self.rename_calls.lock().unwrap().clone()
    }

    pub fn delete_by_name_calls(&self) -> Vec<String> {
        self.delete_by_name_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CloudProvider for MockCloud {
    async fn list_images(&self) -> Result<Vec<ImageInfo>> {
        Ok(self.images())
    }

    async fn upload_image(&self, _file_path: &Path, name: &str) -> Result<String> {
        if self.fail_upload.load(Ordering::SeqCst) {
            bail!("upload failed (injected)");
        }
        let id = format!("img-{}", self.next_image.fetch_add(1, Ordering::SeqCst) + 1);
        self.images.lock().unwrap().push(ImageInfo {
            id: id.clone(),
            name: name.to_string(),
            status: "active".to_string(),
            size: 0,
            created_at: String::new(),
        });
        Ok(id)
    }

    async fn delete_images_by_name(&self, name: &str) -> Result<()> {
        self.delete_by_name_calls.lock().unwrap().push(name.to_string());
        self.images.lock().unwrap().retain(|i| i.name != name);
        Ok(())
    }

    async fn create_vm(
        &self,
        _name: &str,
        _image_id: &str,
        _flavor_id: &str,
        _network_id: &str,
        _user_data: &str,
    ) -> Result<String> {
        let id = format!("vm-{}", self.next_vm.fetch_add(1, Ordering::SeqCst) + 1);
        self.created_vms.lock().unwrap().push(id.clone());
        Ok(id)
    }

    async fn wait_vm_active(&self, vm_id: &str, _timeout: Duration) -> Result<()> {
        if self.fail_vm_active.load(Ordering::SeqCst) {
            bail!("server {vm_id} entered ERROR state (injected)");
        }
        Ok(())
    }

    async fn delete_vm(&self, vm_id: &str) -> Result<()> {
        self.deleted_vms.lock().unwrap().push(vm_id.to_string());
        Ok(())
    }

    async fn rename_image(&self, image_id: &str, new_name: &str) -> Result<()> {
        self.rename_calls
            .lock()
            .unwrap()
            .push((image_id.to_string(), new_name.to_string()));
        let mut images = self.images.lock().unwrap();
        match images.iter_mut().find(|i| i.id == image_id) {
            Some(image) => {
                image.name = new_name.to_string();
                Ok(())
            }
            None => bail!("image {image_id} not found"),
        }
    }
}

/// A fully wired state over an in-memory store and the given mock cloud.
pub fn test_state(config: Config, cloud: Arc<MockCloud>) -> AppState {
    let store = Arc::new(BuildStore::open_in_memory().expect("in-memory store"));
    store.init().expect("schema init");
    let builder = Arc::new(Builder::new(&config));
    AppState {
        store,
        cloud,
        builder,
        config: Arc::new(config),
    }
}
