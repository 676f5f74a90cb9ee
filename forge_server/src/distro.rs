//! Distro build profiles — per-OS parameters for the image build tool,
//! loaded from `configs/distros/<name>.yaml`.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct DistroProfile {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Base OS element, passed first on the command line.
    #[serde(default)]
    pub os_element: String,
    /// Extra environment handed to the build tool.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Additional elements, in order.
    #[serde(default)]
    pub elements: Vec<String>,
}

/// Map the short distro names accepted on the API to profile file names.
pub fn resolve_alias(distro: &str) -> &str {
    match distro {
        "debian" => "debian-12",
        "ubuntu" => "ubuntu-24",
        other => other,
    }
}

/// Load a profile by name. The name is reduced to its final path
/// component so request input cannot escape the config directory.
pub fn load(dir: &Path, distro: &str) -> Result<DistroProfile> {
    let safe_name = Path::new(distro)
        .file_name()
        .and_then(|n| n.to_str())
        .context("invalid distro name")?;
    let path = dir.join(format!("{safe_name}.yaml"));

    let data = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read distro config {}", path.display()))?;
    let profile: DistroProfile =
        serde_yaml::from_str(&data).context("failed to parse distro config")?;
    Ok(profile)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_resolve() {
        assert_eq!(resolve_alias("debian"), "debian-12");
        assert_eq!(resolve_alias("ubuntu"), "ubuntu-24");
        assert_eq!(resolve_alias("rocky-9"), "rocky-9");
    }

    #[test]
    fn loads_profile_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("debian-12.yaml"),
            "id: debian-12\nname: Debian 12\nos_element: debian-minimal\nenv:\n  DIB_RELEASE: bookworm\nelements:\n  - vm\n  - cloud-init\n",
        )
        .unwrap();

        let profile = load(dir.path(), "debian-12").unwrap();
        assert_eq!(profile.os_element, "debian-minimal");
        assert_eq!(profile.elements, vec!["vm", "cloud-init"]);
        assert_eq!(profile.env.get("DIB_RELEASE").map(String::as_str), Some("bookworm"));
    }

    #[test]
    fn path_components_are_stripped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("evil.yaml"), "id: evil\n").unwrap();
        // "../evil" must resolve inside the config dir, not above it.
        let profile = load(dir.path(), "../evil").unwrap();
        assert_eq!(profile.id, "evil");
    }

    #[test]
    fn missing_profile_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(dir.path(), "no-such-distro").is_err());
    }
}
