use std::io::{self, BufRead, Write};

use async_trait::async_trait;
use patch_session::UninstallConfirmation;
use shared::domain::PackageName;
use tracing::warn;

/// Asks on the terminal before removing an unpatched copy of the target app.
pub struct PromptConfirmation {
    pub assume_yes: bool,
}

#[async_trait]
impl UninstallConfirmation for PromptConfirmation {
    async fn confirm_uninstall(&self, package: &PackageName) -> bool {
        if self.assume_yes {
            return true;
        }
        let question = format!(
            "{package} is installed with its original signature and must be uninstalled first. \
             App data will be lost. Continue? [y/N] "
        );
        match tokio::task::spawn_blocking(move || ask(&question)).await {
            Ok(Ok(answer)) => is_yes(&answer),
            Ok(Err(err)) => {
                warn!(%err, "prompt: failed to read answer");
                false
            }
            Err(err) => {
                warn!(%err, "prompt: reader task failed");
                false
            }
        }
    }
}

fn ask(question: &str) -> io::Result<String> {
    let mut stderr = io::stderr().lock();
    stderr.write_all(question.as_bytes())?;
    stderr.flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(answer)
}

pub(crate) fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
