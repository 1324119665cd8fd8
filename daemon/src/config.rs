use serde::{Deserialize, Serialize};

use crate::error::Error;

pub const DEFAULT_CONTAINER_IMAGE: &str = "crops/poky:ubuntu-22.04";
const DEFAULT_DISTRO: &str = "poky";
const DEFAULT_YOCTO_SERIES: &str = "scarthgap";

/// A fully-parsed build configuration as submitted by a client.
///
/// Parsing and field validation happen at the daemon boundary; everything
/// downstream of `submit` consumes this record and never re-reads the YAML.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BuildConfig {
    /// Project name, also used as the config label in status responses.
    pub name: Option<String>,
    pub machine: String,
    #[serde(default = "default_distro")]
    pub distro: String,
    /// Yocto release series used for layer compatibility filtering.
    #[serde(default = "default_series")]
    pub yocto_series: String,
    /// Default target image when the request does not name one.
    pub target: Option<String>,
    /// Container image BitBake runs in.
    pub image: Option<String>,
    #[serde(default)]
    pub layers: Vec<LayerSpec>,
    #[serde(default)]
    pub build: BuildSettings,
    #[serde(default)]
    pub resources: ResourceLimits,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LayerSpec {
    pub name: String,
    /// Git repository to fetch the layer from. Absent for local layers.
    pub url: Option<String>,
    pub branch: Option<String>,
    /// Local directory for layers not fetched from a repository.
    pub path: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct BuildSettings {
    /// BB_NUMBER_THREADS; host CPU count when absent.
    pub bb_threads: Option<u32>,
    /// PARALLEL_MAKE job count; host CPU count when absent.
    pub parallel_make: Option<u32>,
    pub sstate_mirrors: Option<String>,
    pub premirrors: Option<String>,
    #[serde(default)]
    pub bb_no_network: bool,
    /// Override for DL_DIR on the host; defaults under the daemon state dir.
    pub downloads_dir: Option<String>,
    /// Override for SSTATE_DIR on the host; defaults under the daemon state dir.
    pub sstate_dir: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ResourceLimits {
    pub memory_gb: Option<u64>,
    /// Capped to the host CPU count at container construction.
    pub cpus: Option<f64>,
}

impl BuildConfig {
    pub fn from_yaml(raw: &str) -> Result<Self, Error> {
        let config: BuildConfig = serde_yaml::from_str(raw)
            .map_err(|err| Error::InvalidRequest(format!("malformed config: {err}")))?;
        config.validate()?;

        Ok(config)
    }

    /// Field checks that must hold before any store mutation.
    pub fn validate(&self) -> Result<(), Error> {
        if self.machine.trim().is_empty() {
            return Err(Error::InvalidRequest("machine must not be empty".into()));
        }

        for layer in &self.layers {
            if layer.name.trim().is_empty() {
                return Err(Error::InvalidRequest("layer name must not be empty".into()));
            }
            if layer.url.is_none() && layer.path.is_none() {
                return Err(Error::InvalidRequest(format!(
                    "layer {} needs a url or a local path",
                    layer.name
                )));
            }
        }

        Ok(())
    }

    /// Target resolution: explicit request target wins over the config default.
    pub fn resolve_target(&self, requested: Option<&str>) -> Result<String, Error> {
        match requested
            .filter(|t| !t.trim().is_empty())
            .or(self.target.as_deref())
        {
            Some(target) => Ok(target.to_string()),
            None => Err(Error::InvalidRequest(
                "no target image given and the config has no default".into(),
            )),
        }
    }

    pub fn container_image(&self) -> &str {
        self.image.as_deref().unwrap_or(DEFAULT_CONTAINER_IMAGE)
    }

    pub fn project_name(&self) -> &str {
        self.name.as_deref().unwrap_or("unnamed")
    }
}

fn default_distro() -> String {
    DEFAULT_DISTRO.to_string()
}

fn default_series() -> String {
    DEFAULT_YOCTO_SERIES.to_string()
}

#[cfg(test)]
mod tests {
    use super::BuildConfig;
    use crate::error::Error;

    const MINIMAL: &str = r#"
name: gateway
machine: qemux86-64
target: core-image-minimal
layers:
  - name: poky
    url: https://git.yoctoproject.org/poky
    branch: scarthgap
"#;

    #[test]
    fn parses_minimal_config() {
        let config = BuildConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.machine, "qemux86-64");
        assert_eq!(config.distro, "poky");
        assert_eq!(config.yocto_series, "scarthgap");
        assert_eq!(config.layers.len(), 1);
        assert_eq!(config.container_image(), super::DEFAULT_CONTAINER_IMAGE);
    }

    #[test]
    fn rejects_missing_machine() {
        let err = BuildConfig::from_yaml("name: x\nmachine: ''\n").unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn rejects_layer_without_source() {
        let err = BuildConfig::from_yaml("machine: m\nlayers:\n  - name: meta-foo\n").unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn target_resolution_prefers_request() {
        let config = BuildConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(
            config.resolve_target(Some("core-image-sato")).unwrap(),
            "core-image-sato"
        );
        assert_eq!(
            config.resolve_target(None).unwrap(),
            "core-image-minimal"
        );

        let no_default = BuildConfig::from_yaml("machine: m\n").unwrap();
        assert!(matches!(
            no_default.resolve_target(None),
            Err(Error::InvalidRequest(_))
        ));
    }
}
