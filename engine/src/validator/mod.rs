use anyhow::Result;
use regex::Regex;
use sdk::PluginManifest;
use serde::Serialize;

/// Reverse-domain plugin id, e.g. `com.example.word-count`
pub const PLUGIN_ID_PATTERN: &str = r"^[a-z][a-z0-9-]*(\.[a-z0-9][a-z0-9-]*)+$";

/// Outcome of validating one manifest
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Structural and semantic checks over a plugin manifest
///
/// Fails closed: every violation adds one error and `valid` is only true
/// when there are none. Warnings are informational.
///
/// # Example
///
/// ```
/// use warden_engine::validator::ManifestValidator;
/// use sdk::PluginManifest;
///
/// let validator = ManifestValidator::new().unwrap();
/// let report = validator.validate(&PluginManifest::default());
///
/// assert!(!report.valid);
/// assert!(report.errors.iter().any(|e| e.contains("manifest.main")));
/// ```
pub struct ManifestValidator {
    id_pattern: Regex,
}

impl ManifestValidator {
    pub fn new() -> Result<Self> {
        Ok(Self {
            id_pattern: Regex::new(PLUGIN_ID_PATTERN)?,
        })
    }

    pub fn validate(&self, manifest: &PluginManifest) -> ValidationReport {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        // The raw id is the registry key and must match untrimmed
        if manifest.id.trim().is_empty() {
            errors.push("manifest.id is required".to_string());
        } else if !self.id_pattern.is_match(&manifest.id) {
            errors.push(
                "manifest.id must be a reverse-domain identifier (e.g. com.example.plugin)"
                    .to_string(),
            );
        }

        for (field, value) in [
            ("name", &manifest.name),
            ("version", &manifest.version),
            ("author", &manifest.author),
            ("description", &manifest.description),
            ("main", &manifest.main),
        ] {
            if value.trim().is_empty() {
                errors.push(format!("manifest.{} is required", field));
            }
        }

        match &manifest.extension_points {
            None => errors.push("manifest.extensionPoints is required".to_string()),
            Some(points) => {
                for name in manifest.unknown_extension_points() {
                    errors.push(format!("unknown extension point '{}'", name));
                }
                if !points.values().any(|enabled| *enabled) {
                    warnings.push("no extension point is enabled".to_string());
                }
            }
        }

        let version = manifest.version.trim();
        if !version.is_empty() && semver::Version::parse(version).is_err() {
            warnings.push(format!("version '{}' is not valid semver", version));
        }

        for (dep, range) in &manifest.dependencies {
            if semver::VersionReq::parse(range).is_err() {
                warnings.push(format!(
                    "dependency '{}' has an invalid version range '{}'",
                    dep, range
                ));
            }
        }

        if let Some(min) = manifest.min_app_version.as_deref() {
            if semver::Version::parse(min).is_err() {
                warnings.push(format!("minAppVersion '{}' is not valid semver", min));
            }
        }

        tracing::debug!(
            "Validated manifest {:?}: {} errors, {} warnings",
            manifest.id,
            errors.len(),
            warnings.len()
        );

        ValidationReport {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }
}
