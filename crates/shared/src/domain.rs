use std::{collections::BTreeSet, fmt, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageName(pub String);

impl PackageName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppSource {
    Installed,
    Storage,
}

/// The application a session patches: identifier, display metadata and the
/// APK files (base plus splits) handed to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetApp {
    pub package_name: PackageName,
    pub label: String,
    pub apk_paths: Vec<PathBuf>,
    pub source: AppSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleApp {
    pub package_name: PackageName,
    pub apk_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureScheme {
    V1,
    V2,
}

impl fmt::Display for SignatureScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignatureScheme::V1 => f.write_str("V1"),
            SignatureScheme::V2 => f.write_str("V2"),
        }
    }
}

/// Highest accepted signature-bypass level.
pub const SIG_BYPASS_LEVEL_MAX: u8 = SigBypassLevel::PackageManagerAndOpenat as u8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum SigBypassLevel {
    Disable = 0,
    PackageManager = 1,
    PackageManagerAndOpenat = 2,
}

impl SigBypassLevel {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn description(self) -> &'static str {
        match self {
            SigBypassLevel::Disable => "disabled",
            SigBypassLevel::PackageManager => "package manager",
            SigBypassLevel::PackageManagerAndOpenat => "package manager + openat",
        }
    }
}

impl TryFrom<u8> for SigBypassLevel {
    type Error = ConfigError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if value > SIG_BYPASS_LEVEL_MAX {
            return Err(ConfigError::InvalidSigBypassLevel(value));
        }
        Ok(match value {
            0 => SigBypassLevel::Disable,
            1 => SigBypassLevel::PackageManager,
            _ => SigBypassLevel::PackageManagerAndOpenat,
        })
    }
}

impl From<SigBypassLevel> for u8 {
    fn from(value: SigBypassLevel) -> Self {
        value.as_u8()
    }
}

/// Patch options for one session. Editable while configuring, frozen once
/// the engine is invoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchConfig {
    pub target_app: TargetApp,
    pub use_manager_mode: bool,
    pub embedded_modules: Vec<ModuleApp>,
    pub debuggable: bool,
    pub override_version_code: bool,
    pub signature_schemes: BTreeSet<SignatureScheme>,
    pub sig_bypass_level: SigBypassLevel,
}

impl PatchConfig {
    pub fn for_target(target_app: TargetApp) -> Self {
        Self {
            target_app,
            use_manager_mode: true,
            embedded_modules: Vec::new(),
            debuggable: false,
            override_version_code: false,
            signature_schemes: BTreeSet::from([SignatureScheme::V2]),
            sig_bypass_level: SigBypassLevel::PackageManagerAndOpenat,
        }
    }

    pub fn signs_with(&self, scheme: SignatureScheme) -> bool {
        self.signature_schemes.contains(&scheme)
    }

    /// Modules the engine embeds. Manager mode loads modules at runtime, so
    /// nothing is embedded there.
    pub fn effective_modules(&self) -> &[ModuleApp] {
        if self.use_manager_mode {
            &[]
        } else {
            &self.embedded_modules
        }
    }

    pub fn signature_label(&self) -> String {
        if self.signature_schemes.is_empty() {
            return "None".to_string();
        }
        self.signature_schemes
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" + ")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_app.package_name.as_str().trim().is_empty() {
            return Err(ConfigError::MissingPackageName);
        }
        if self.target_app.apk_paths.is_empty() {
            return Err(ConfigError::NoInputApks(self.target_app.package_name.clone()));
        }
        Ok(())
    }
}
