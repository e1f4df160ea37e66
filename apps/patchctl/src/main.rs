use std::{fs, sync::Arc};

use adb_device::AdbDevice;
use anyhow::{bail, Context, Result};
use clap::Parser;
use patch_session::{CommandPatchEngine, InstallCoordinator, PatchSession, SessionContext};
use shared::session::{InstallStatus, LogLevel, LogLine, Phase};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod prompt;

use cli::Args;
use config::load_settings;
use prompt::PromptConfirmation;

const ERROR_REPORT_FILE: &str = "patch-error.log";

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut settings = load_settings(args.config.as_deref())?;
    if let Some(output_dir) = &args.output_dir {
        settings.output_dir = output_dir.clone();
    }
    if args.serial.is_some() {
        settings.device_serial = args.serial.clone();
    }
    settings.verbose |= args.verbose;

    // Engine output is printed directly; keep it out of the diagnostic log.
    let default_filter = if settings.verbose {
        "debug,patch=off"
    } else {
        "info,patch=off"
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let context = SessionContext::new(&settings.scratch_dir, &settings.output_dir)
        .verbose(settings.verbose);
    let engine = CommandPatchEngine::new(&settings.patcher_program, &settings.output_dir)
        .with_base_args(settings.patcher_args.clone())
        .with_verbose(settings.verbose);
    let device = Arc::new(
        AdbDevice::new(&settings.adb_program).with_serial(settings.device_serial.clone()),
    );
    let installer = InstallCoordinator::new(device.clone(), device.clone());
    let session = PatchSession::new(context, Arc::new(engine), installer)?;

    let _phase_log = session.subscribe(|snapshot| {
        debug!(
            session_id = %snapshot.session_id,
            phase = ?snapshot.phase,
            lines = snapshot.log_lines.len(),
            "patchctl: session updated"
        );
    });

    let package = args.package_name()?;
    let label = args.label.clone().unwrap_or_else(|| package.to_string());
    session.select_from_storage(&args.apks, package, label)?;
    let mut apply_result = Ok(());
    session.update_config(|config| apply_result = args.apply(config))?;
    apply_result?;

    if let Some(config) = session.config() {
        info!(
            package = %config.target_app.package_name,
            manager_mode = config.use_manager_mode,
            modules = config.effective_modules().len(),
            signature = %config.signature_label(),
            sigbypass = config.sig_bypass_level.description(),
            "patchctl: starting patch"
        );
    }

    let phase = run_patch(&session, !args.json).await?;

    if phase == Phase::Error {
        if args.json {
            println!("{}", serde_json::to_string_pretty(&session.snapshot())?);
        }
        if let Some(report) = session.error_report() {
            let output_dir = &session.context().output_dir;
            let path = output_dir.join(ERROR_REPORT_FILE);
            fs::create_dir_all(output_dir)
                .and_then(|()| fs::write(&path, report))
                .with_context(|| format!("failed to write '{}'", path.display()))?;
            bail!("patching failed; full log saved to {}", path.display());
        }
        bail!("patching failed");
    }

    if args.install {
        install(&session, &device, args.yes, args.json).await?;
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&session.snapshot())?);
    } else {
        println!(
            "patched APKs written to {}",
            session.context().output_dir.display()
        );
    }
    Ok(())
}

/// Submits the configured session and echoes engine output until the run
/// reaches a terminal phase.
async fn run_patch(session: &Arc<PatchSession>, echo: bool) -> Result<Phase> {
    let logs = session.logs();
    let mut follower = logs.follow();
    let mut handle = session.submit_patch()?;

    let phase = loop {
        tokio::select! {
            phase = &mut handle => break phase?,
            batch = follower.recv() => match batch {
                Some(lines) => {
                    if echo {
                        lines.iter().for_each(print_line);
                    }
                }
                None => break (&mut handle).await?,
            },
        }
    };

    // Lines appended after the handle resolved.
    let rest = follower.remaining();
    if echo {
        rest.iter().for_each(print_line);
    }
    Ok(phase)
}

fn print_line(line: &LogLine) {
    match line.level {
        LogLevel::Error => eprintln!("{}", line.message),
        LogLevel::Debug | LogLevel::Info => println!("{}", line.message),
    }
}

async fn install(
    session: &PatchSession,
    device: &AdbDevice,
    assume_yes: bool,
    quiet: bool,
) -> Result<()> {
    device.connect().await?;

    let mut stage = session.installer().subscribe_stage();
    let stage_log = tokio::spawn(async move {
        while stage.changed().await.is_ok() {
            let current = *stage.borrow_and_update();
            info!(stage = ?current, "patchctl: install");
        }
    });

    let result = session
        .install(&PromptConfirmation { assume_yes })
        .await;
    stage_log.abort();
    let result = result?;

    match result.status {
        InstallStatus::Success => {
            if !quiet {
                println!("installed {}", describe_target(session));
            }
        }
        InstallStatus::UserCancelled => {
            debug!("patchctl: install cancelled");
        }
        InstallStatus::Failure { code } => {
            if let Some(diagnostics) = result.diagnostics() {
                eprintln!("{diagnostics}");
            }
            bail!("install failed with status {code}");
        }
    }
    Ok(())
}

fn describe_target(session: &PatchSession) -> String {
    session
        .config()
        .map(|config| config.target_app.package_name.to_string())
        .unwrap_or_else(|| "patched app".to_string())
}
