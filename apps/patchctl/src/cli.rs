use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, ValueEnum};
use patch_session::read_apk_manifest;
use shared::domain::{
    ModuleApp, PackageName, PatchConfig, SigBypassLevel, SignatureScheme, SIG_BYPASS_LEVEL_MAX,
};

#[derive(Parser, Debug)]
#[command(name = "patchctl", about = "Patch APKs and install the result over adb")]
pub struct Args {
    /// Base APK followed by any split APKs.
    #[arg(required = true)]
    pub apks: Vec<PathBuf>,
    /// Package name of the target app. Read from the base APK's manifest when
    /// omitted.
    #[arg(long)]
    pub package: Option<String>,
    #[arg(long)]
    pub label: Option<String>,
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Embed modules into the APK instead of loading them through the manager.
    #[arg(long)]
    pub portable: bool,
    /// Module to embed in portable mode, as PACKAGE=APK.
    #[arg(long = "embed", value_name = "PACKAGE=APK", value_parser = parse_module)]
    pub embed: Vec<ModuleApp>,
    #[arg(long)]
    pub debuggable: bool,
    #[arg(long)]
    pub override_version_code: bool,
    #[arg(long, value_enum, value_delimiter = ',', conflicts_with = "no_sign")]
    pub sign: Vec<SchemeArg>,
    #[arg(long)]
    pub no_sign: bool,
    #[arg(
        long,
        default_value_t = 2,
        value_parser = clap::value_parser!(u8).range(0..=SIG_BYPASS_LEVEL_MAX as i64)
    )]
    pub sigbypass: u8,
    #[arg(long)]
    pub install: bool,
    /// Uninstall an unpatched copy without asking.
    #[arg(short = 'y', long)]
    pub yes: bool,
    /// Print the final session snapshot as JSON.
    #[arg(long)]
    pub json: bool,
    #[arg(short, long)]
    pub verbose: bool,
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
    #[arg(long)]
    pub serial: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SchemeArg {
    V1,
    V2,
}

impl From<SchemeArg> for SignatureScheme {
    fn from(value: SchemeArg) -> Self {
        match value {
            SchemeArg::V1 => SignatureScheme::V1,
            SchemeArg::V2 => SignatureScheme::V2,
        }
    }
}

impl Args {
    pub fn package_name(&self) -> Result<PackageName> {
        if let Some(package) = &self.package {
            return Ok(PackageName::new(package.trim()));
        }
        let base = self
            .apks
            .first()
            .ok_or_else(|| anyhow!("no input APKs given"))?;
        read_apk_manifest(base)
            .and_then(|manifest| manifest.package())
            .with_context(|| {
                format!(
                    "cannot read the package name of '{}'; pass --package",
                    base.display()
                )
            })
    }

    /// Applies the command-line options on top of the session defaults.
    pub fn apply(&self, config: &mut PatchConfig) -> Result<()> {
        if !self.portable && !self.embed.is_empty() {
            bail!("--embed requires --portable");
        }
        config.use_manager_mode = !self.portable;
        config.embedded_modules = self.embed.clone();
        config.debuggable = self.debuggable;
        config.override_version_code = self.override_version_code;
        if self.no_sign {
            config.signature_schemes.clear();
        } else if !self.sign.is_empty() {
            config.signature_schemes = self.sign.iter().copied().map(Into::into).collect();
        }
        config.sig_bypass_level = SigBypassLevel::try_from(self.sigbypass)?;
        Ok(())
    }
}

fn parse_module(raw: &str) -> Result<ModuleApp, String> {
    let (package, apk) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected PACKAGE=APK, got '{raw}'"))?;
    if package.trim().is_empty() || apk.trim().is_empty() {
        return Err(format!("expected PACKAGE=APK, got '{raw}'"));
    }
    Ok(ModuleApp {
        package_name: PackageName::new(package.trim()),
        apk_path: PathBuf::from(apk.trim()),
    })
}

#[cfg(test)]
#[path = "tests/cli_tests.rs"]
mod tests;
