//! Cloud adapter — image and VM CRUD against the infrastructure API.

pub mod openstack;

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

pub use openstack::OpenStackClient;

/// Image metadata as exposed to API consumers.
#[derive(Debug, Clone, Serialize)]
pub struct ImageInfo {
    pub id: String,
    pub name: String,
    pub status: String,
    pub size: i64,
    pub created_at: String,
}

/// Seam between the orchestration core and the infrastructure API.
/// The production implementation is [`OpenStackClient`]; tests use the
/// recording mock in `test_support`.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn list_images(&self) -> Result<Vec<ImageInfo>>;

    /// Upload a local image file under the given name, returning the
    /// provider-assigned image id.
    async fn upload_image(&self, file_path: &Path, name: &str) -> Result<String>;

    /// Delete every image bearing this name. Zero matches is success;
    /// individual deletion failures are logged and skipped.
    async fn delete_images_by_name(&self, name: &str) -> Result<()>;

    async fn create_vm(
        &self,
        name: &str,
        image_id: &str,
        flavor_id: &str,
        network_id: &str,
        user_data: &str,
    ) -> Result<String>;

    /// Block until the VM reaches its running state, bounded by `timeout`.
    async fn wait_vm_active(&self, vm_id: &str, timeout: Duration) -> Result<()>;

    async fn delete_vm(&self, vm_id: &str) -> Result<()>;

    /// Rename an image in place (metadata patch).
    async fn rename_image(&self, image_id: &str, new_name: &str) -> Result<()>;
}
