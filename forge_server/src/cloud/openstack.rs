//! OpenStack-flavored implementation of the cloud adapter — Keystone v3
//! password auth, Glance for images, Nova for test servers.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{header, RequestBuilder, StatusCode};
use serde_json::{json, Value};
use tokio::sync::RwLock;

use super::{CloudProvider, ImageInfo};
use crate::config::Config;

const ACTIVE_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct Session {
    token: String,
    image_url: String,
    compute_url: String,
}

pub struct OpenStackClient {
    http: reqwest::Client,
    auth_url: String,
    username: String,
    password: String,
    project_id: String,
    project_name: String,
    domain_name: String,
    region: String,
    ssh_key_name: String,
    session: RwLock<Option<Session>>,
}

impl OpenStackClient {
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("building http client")?;
        Ok(Self {
            http,
            auth_url: config.auth_url.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            project_id: config.project_id.clone(),
            project_name: config.project_name.clone(),
            domain_name: config.domain_name.clone(),
            region: config.region.clone(),
            ssh_key_name: config.ssh_key_name.clone(),
            session: RwLock::new(None),
        })
    }

    /// Obtain a token and resolve the image/compute endpoints from the
    /// service catalog. Called eagerly at startup and again whenever a
    /// cached token is rejected.
    pub async fn authenticate(&self) -> Result<()> {
        if self.auth_url.is_empty() {
            bail!("cloud auth URL is not configured");
        }

        let mut payload = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": self.username,
                            "domain": {"name": self.domain_name},
                            "password": self.password,
                        }
                    }
                }
            }
        });
        if !self.project_id.is_empty() {
            payload["auth"]["scope"] = json!({"project": {"id": self.project_id}});
        } else if !self.project_name.is_empty() {
            payload["auth"]["scope"] = json!({
                "project": {"name": self.project_name, "domain": {"name": self.domain_name}}
            });
        }

        let url = format!("{}/auth/tokens", self.auth_url.trim_end_matches('/'));
        let resp = self.http.post(&url).json(&payload).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("auth failed: {status} {text}");
        }

        let token = resp
            .headers()
            .get("x-subject-token")
            .and_then(|v| v.to_str().ok())
            .context("auth response carried no subject token")?
            .to_string();
        let body: Value = resp.json().await.context("parsing auth response")?;
        let catalog = &body["token"]["catalog"];

        let image_url = endpoint_for(catalog, "image", &self.region)
            .context("no public image endpoint in service catalog")?;
        let compute_url = endpoint_for(catalog, "compute", &self.region)
            .context("no public compute endpoint in service catalog")?;

        tracing::info!(image_url = %image_url, compute_url = %compute_url, "authenticated against cloud");
        *self.session.write().await = Some(Session { token, image_url, compute_url });
        Ok(())
    }

    async fn session(&self) -> Result<Session> {
        if let Some(session) = self.session.read().await.clone() {
            return Ok(session);
        }
        self.authenticate().await?;
        self.session
            .read()
            .await
            .clone()
            .context("authentication produced no session")
    }

    /// Send a request built against the current session; on a 401 the
    /// token is refreshed once and the request retried.
    async fn execute<F>(&self, build: F) -> Result<reqwest::Response>
    where
        F: Fn(&reqwest::Client, &Session) -> RequestBuilder,
    {
        let session = self.session().await?;
        let resp = build(&self.http, &session).send().await?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            tracing::debug!("token rejected, re-authenticating");
            *self.session.write().await = None;
            let session = self.session().await?;
            return Ok(build(&self.http, &session).send().await?);
        }
        Ok(resp)
    }

    async fn images_by_name(&self, name: &str) -> Result<Vec<ImageInfo>> {
        let resp = self
            .execute(|http, s| {
                http.get(format!("{}/v2/images", s.image_url))
                    .query(&[("name", name)])
                    .header("X-Auth-Token", &s.token)
            })
            .await?;
        let resp = require_success(resp, "listing images").await?;
        let body: Value = resp.json().await?;
        Ok(parse_image_list(&body))
    }
}

#[async_trait]
impl CloudProvider for OpenStackClient {
    async fn list_images(&self) -> Result<Vec<ImageInfo>> {
        let resp = self
            .execute(|http, s| {
                http.get(format!("{}/v2/images", s.image_url))
                    .header("X-Auth-Token", &s.token)
            })
            .await?;
        let resp = require_success(resp, "listing images").await?;
        let body: Value = resp.json().await?;
        Ok(parse_image_list(&body))
    }

    async fn upload_image(&self, file_path: &Path, name: &str) -> Result<String> {
        tracing::info!(file = %file_path.display(), name, "starting image upload");

        let metadata = json!({
            "name": name,
            "container_format": "bare",
            "disk_format": "qcow2",
            "visibility": "private",
            "hw_qemu_guest_agent": "yes",
            "os_distro": "linux",
        });
        let resp = self
            .execute(|http, s| {
                http.post(format!("{}/v2/images", s.image_url))
                    .header("X-Auth-Token", &s.token)
                    .json(&metadata)
            })
            .await?;
        let resp = require_success(resp, "creating image metadata").await?;
        let body: Value = resp.json().await?;
        let image_id = body["id"]
            .as_str()
            .context("image create response carried no id")?
            .to_string();
        tracing::debug!(id = %image_id, "image metadata created");

        // The data upload streams the file and cannot be replayed, so it
        // skips the reauth helper.
        let session = self.session().await?;
        let file = tokio::fs::File::open(file_path)
            .await
            .with_context(|| format!("opening image file {}", file_path.display()))?;
        let resp = self
            .http
            .put(format!("{}/v2/images/{}/file", session.image_url, image_id))
            .header("X-Auth-Token", &session.token)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(file)
            .send()
            .await?;
        require_success(resp, "uploading image data").await?;

        tracing::info!(id = %image_id, "image uploaded successfully");
        Ok(image_id)
    }

    async fn delete_images_by_name(&self, name: &str) -> Result<()> {
        for image in self.images_by_name(name).await? {
            tracing::info!(id = %image.id, name, status = %image.status, "deleting old image");
            let resp = self
                .execute(|http, s| {
                    http.delete(format!("{}/v2/images/{}", s.image_url, image.id))
                        .header("X-Auth-Token", &s.token)
                })
                .await;
            match resp {
                Ok(r) if r.status().is_success() || r.status() == StatusCode::NOT_FOUND => {}
                Ok(r) => tracing::error!(id = %image.id, "failed to delete old image: {}", r.status()),
                Err(e) => tracing::error!(id = %image.id, "failed to delete old image: {e:#}"),
            }
        }
        Ok(())
    }

    async fn create_vm(
        &self,
        name: &str,
        image_id: &str,
        flavor_id: &str,
        network_id: &str,
        user_data: &str,
    ) -> Result<String> {
        let mut server = json!({
            "name": name,
            "imageRef": image_id,
            "flavorRef": flavor_id,
            "networks": [{"uuid": network_id}],
        });
        if !self.ssh_key_name.is_empty() {
            server["key_name"] = json!(self.ssh_key_name);
        }
        if !user_data.is_empty() {
            // The compute API expects user_data already base64-encoded.
            server["user_data"] = json!(user_data);
        }
        let payload = json!({"server": server});

        let resp = self
            .execute(|http, s| {
                http.post(format!("{}/servers", s.compute_url))
                    .header("X-Auth-Token", &s.token)
                    .json(&payload)
            })
            .await?;
        let resp = require_success(resp, "creating server").await?;
        let body: Value = resp.json().await?;
        let vm_id = body["server"]["id"]
            .as_str()
            .context("server create response carried no id")?
            .to_string();

        tracing::info!(id = %vm_id, key = %self.ssh_key_name, "vm created");
        Ok(vm_id)
    }

    async fn wait_vm_active(&self, vm_id: &str, timeout: Duration) -> Result<()> {
        tracing::info!(vm_id, "waiting for vm to become active");
        let start = Instant::now();
        loop {
            let resp = self
                .execute(|http, s| {
                    http.get(format!("{}/servers/{}", s.compute_url, vm_id))
                        .header("X-Auth-Token", &s.token)
                })
                .await?;
            let resp = require_success(resp, "reading server state").await?;
            let body: Value = resp.json().await?;
            match body["server"]["status"].as_str().unwrap_or("") {
                "ACTIVE" => return Ok(()),
                "ERROR" => bail!("server {vm_id} entered ERROR state"),
                status => tracing::debug!(vm_id, status, "server not active yet"),
            }
            if start.elapsed() >= timeout {
                bail!(
                    "server {vm_id} did not become active within {}s",
                    timeout.as_secs()
                );
            }
            tokio::time::sleep(ACTIVE_POLL_INTERVAL).await;
        }
    }

    async fn delete_vm(&self, vm_id: &str) -> Result<()> {
        let resp = self
            .execute(|http, s| {
                http.delete(format!("{}/servers/{}", s.compute_url, vm_id))
                    .header("X-Auth-Token", &s.token)
            })
            .await?;
        if resp.status().is_success() || resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        bail!("deleting server {vm_id} failed: {status} {text}");
    }

    async fn rename_image(&self, image_id: &str, new_name: &str) -> Result<()> {
        let patch = serde_json::to_string(&json!([
            {"op": "replace", "path": "/name", "value": new_name}
        ]))?;
        let resp = self
            .execute(|http, s| {
                http.patch(format!("{}/v2/images/{}", s.image_url, image_id))
                    .header("X-Auth-Token", &s.token)
                    .header(
                        header::CONTENT_TYPE,
                        "application/openstack-images-v2.1-json-patch+json",
                    )
                    .body(patch.clone())
            })
            .await?;
        require_success(resp, "renaming image").await?;
        Ok(())
    }
}

fn endpoint_for(catalog: &Value, service_type: &str, region: &str) -> Option<String> {
    for service in catalog.as_array()? {
        if service["type"].as_str() != Some(service_type) {
            continue;
        }
        let Some(endpoints) = service["endpoints"].as_array() else {
            continue;
        };
        for ep in endpoints {
            if ep["interface"].as_str() != Some("public") {
                continue;
            }
            let ep_region = ep["region"].as_str().unwrap_or("");
            if !region.is_empty() && !ep_region.is_empty() && ep_region != region {
                continue;
            }
            if let Some(url) = ep["url"].as_str() {
                return Some(url.trim_end_matches('/').to_string());
            }
        }
    }
    None
}

fn parse_image_list(body: &Value) -> Vec<ImageInfo> {
    let empty = Vec::new();
    let images = body["images"].as_array().unwrap_or(&empty);
    images
        .iter()
        .map(|img| ImageInfo {
            id: img["id"].as_str().unwrap_or_default().to_string(),
            name: img["name"].as_str().unwrap_or_default().to_string(),
            status: img["status"].as_str().unwrap_or_default().to_string(),
            size: img["size"].as_i64().unwrap_or(0),
            created_at: img["created_at"].as_str().unwrap_or_default().to_string(),
        })
        .collect()
}

async fn require_success(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    bail!("{what} failed: {status} {text}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_lookup_respects_type_interface_and_region() {
        let catalog = json!([
            {
                "type": "image",
                "endpoints": [
                    {"interface": "admin", "region": "RegionOne", "url": "http://admin:9292"},
                    {"interface": "public", "region": "RegionTwo", "url": "http://two:9292"},
                    {"interface": "public", "region": "RegionOne", "url": "http://one:9292/"}
                ]
            },
            {
                "type": "compute",
                "endpoints": [
                    {"interface": "public", "region": "RegionOne", "url": "http://one:8774/v2.1"}
                ]
            }
        ]);

        assert_eq!(
            endpoint_for(&catalog, "image", "RegionOne").as_deref(),
            Some("http://one:9292")
        );
        assert_eq!(
            endpoint_for(&catalog, "compute", "RegionOne").as_deref(),
            Some("http://one:8774/v2.1")
        );
        assert!(endpoint_for(&catalog, "volume", "RegionOne").is_none());
    }

    #[test]
    fn image_list_parsing_tolerates_missing_fields() {
        let body = json!({"images": [
            {"id": "img-1", "name": "web01", "status": "active", "size": 1024, "created_at": "2025-01-01T00:00:00Z"},
            {"id": "img-2"}
        ]});
        let images = parse_image_list(&body);
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].name, "web01");
        assert_eq!(images[1].size, 0);
    }
}
