//! Service configuration — loaded from environment variables.

use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    /// Flavor used for test VMs.
    pub flavor_id: String,
    /// Network the test VM is attached to.
    pub network_id: String,
    /// Address the in-guest agent reports back to; baked into images at
    /// build time via MANAGER_ADDRESS.
    pub manager_address: String,

    // Cloud credentials
    pub auth_url: String,
    pub username: String,
    pub password: String,
    pub project_id: String,
    pub project_name: String,
    pub domain_name: String,
    pub region: String,
    pub ssh_key_name: String,
    /// Public key material injected into built images, when set.
    pub ssh_inject_key: String,

    // Build tool surroundings
    pub elements_dir: String,
    pub distro_config_dir: String,
    pub work_dir: String,
    pub build_command: String,

    // Stage deadlines
    pub build_timeout_secs: u64,
    pub vm_active_timeout_secs: u64,
    /// Agent silence after which the watchdog logs a warning.
    pub agent_warn_secs: u64,
    /// Total agent silence after which the watchdog terminates the build.
    pub agent_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            flavor_id: "2".to_string(),
            network_id: String::new(),
            manager_address: String::new(),
            auth_url: String::new(),
            username: String::new(),
            password: String::new(),
            project_id: String::new(),
            project_name: String::new(),
            domain_name: "Default".to_string(),
            region: "RegionOne".to_string(),
            ssh_key_name: "master-key".to_string(),
            ssh_inject_key: String::new(),
            elements_dir: "./elements".to_string(),
            distro_config_dir: "./configs/distros".to_string(),
            work_dir: ".".to_string(),
            build_command: "disk-image-create".to_string(),
            build_timeout_secs: 600,
            vm_active_timeout_secs: 300,
            agent_warn_secs: 180,
            agent_timeout_secs: 480,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Config::default();
        let config = Self {
            flavor_id: env_or("OS_FLAVOR_ID", defaults.flavor_id),
            network_id: env_or("OS_NETWORK_ID", defaults.network_id),
            manager_address: env_or("MANAGER_ADDRESS", defaults.manager_address),
            auth_url: env_or("OS_AUTH_URL", defaults.auth_url),
            username: env_or("OS_USERNAME", defaults.username),
            password: env_or("OS_PASSWORD", defaults.password),
            project_id: env_or("OS_PROJECT_ID", defaults.project_id),
            project_name: env_or("OS_PROJECT_NAME", defaults.project_name),
            domain_name: env_or("OS_DOMAIN_NAME", defaults.domain_name),
            region: env_or("OS_REGION_NAME", defaults.region),
            ssh_key_name: env_or("OS_SSH_KEY_NAME", defaults.ssh_key_name),
            ssh_inject_key: env_or("SSH_INJECT_KEY", defaults.ssh_inject_key),
            elements_dir: env_or("FORGE_ELEMENTS_DIR", defaults.elements_dir),
            distro_config_dir: env_or("FORGE_DISTRO_DIR", defaults.distro_config_dir),
            work_dir: env_or("FORGE_WORK_DIR", defaults.work_dir),
            build_command: env_or("FORGE_BUILD_COMMAND", defaults.build_command),
            build_timeout_secs: env_parsed("FORGE_BUILD_TIMEOUT", defaults.build_timeout_secs),
            vm_active_timeout_secs: env_parsed("FORGE_VM_TIMEOUT", defaults.vm_active_timeout_secs),
            agent_warn_secs: env_parsed("FORGE_AGENT_WARN_SECS", defaults.agent_warn_secs),
            agent_timeout_secs: env_parsed("FORGE_AGENT_TIMEOUT_SECS", defaults.agent_timeout_secs),
        };

        if config.auth_url.is_empty() {
            tracing::warn!("OS_AUTH_URL not set -- image uploads will fail");
        }
        if config.network_id.is_empty() {
            tracing::warn!("OS_NETWORK_ID not set -- test VMs cannot be created");
        }
        if config.manager_address.is_empty() {
            tracing::warn!("MANAGER_ADDRESS not set -- agents will not be able to report back");
        }

        config
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn vm_active_timeout(&self) -> Duration {
        Duration::from_secs(self.vm_active_timeout_secs)
    }

    pub fn agent_warn_delay(&self) -> Duration {
        Duration::from_secs(self.agent_warn_secs)
    }

    pub fn agent_timeout_delay(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }
}

fn env_or(key: &str, default: String) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default,
    }
}

fn env_parsed(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
