//! Host service control for `disable-and-shutoff-rackd`.
//!
//! Disabling the unit kills this very process, so `systemctl` dying from
//! SIGTERM mid-call counts as success; the region only needs the disable to
//! have landed.

use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
#[error("cannot disable the rack service: {0}")]
pub struct ServiceError(pub String);

const SIGTERM_EXIT: i32 = 128 + 15;

pub struct ServiceController {
    unit: String,
}

impl ServiceController {
    pub fn new(unit: String) -> Self {
        Self { unit }
    }

    pub async fn disable_and_stop(&self) -> Result<(), ServiceError> {
        info!(unit = %self.unit, "disabling the rack service on region request");
        let output = tokio::process::Command::new("systemctl")
            .args(["disable", "--now", &self.unit])
            .output()
            .await
            .map_err(|e| ServiceError(e.to_string()))?;
        if exit_acceptable(&output.status) {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(ServiceError(format!(
                "systemctl exited with {}: {}",
                output.status,
                stderr.trim()
            )))
        }
    }
}

fn exit_acceptable(status: &std::process::ExitStatus) -> bool {
    if status.success() {
        return true;
    }
    // Stopping the unit tears down systemctl's own session.
    matches!(status.code(), Some(SIGTERM_EXIT)) || {
        use std::os::unix::process::ExitStatusExt;
        status.signal() == Some(15)
    }
}
