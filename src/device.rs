//! Kindle device commands
//!
//! Each operation is exactly one shell command. This is the only module that
//! knows the device's command syntax.

use crate::error::PushError;
use crate::session::{CommandOutput, RemoteSession};

/// Highest frontlight intensity the device accepts
pub const MAX_BACKLIGHT: u8 = 24;

/// Clamp any requested level into `0..=MAX_BACKLIGHT`
pub fn clamp_backlight(level: i64) -> u8 {
    level.clamp(0, MAX_BACKLIGHT as i64) as u8
}

/// A single device operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    /// Wake the screen from the screensaver
    Wake,
    /// Set frontlight intensity (already clamped)
    SetBacklight(u8),
    /// Draw an image file on the screen
    Refresh(String),
    /// Clear the screen to white
    Clear,
    /// List a directory, used as a harmless reachability check
    ListDirectory(String),
}

impl DeviceCommand {
    /// Shell command line for this operation
    pub fn shell(&self) -> String {
        match self {
            DeviceCommand::Wake => "lipc-set-prop com.lab126.powerd wakeUp 1".to_string(),
            DeviceCommand::SetBacklight(level) => {
                format!("lipc-set-prop com.lab126.powerd flIntensity {}", level)
            }
            DeviceCommand::Refresh(path) => format!("eips -g {}", shell_quote(path)),
            DeviceCommand::Clear => "eips -c".to_string(),
            DeviceCommand::ListDirectory(path) => format!("ls {}", shell_quote(path)),
        }
    }
}

/// Single-quote a value for a POSIX shell
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Issues device operations over a session
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceController;

impl DeviceController {
    pub fn new() -> Self {
        Self
    }

    pub async fn wake(&self, session: &mut dyn RemoteSession) -> Result<(), PushError> {
        self.run(session, DeviceCommand::Wake).await.map(|_| ())
    }

    /// Set the frontlight, returning the level actually transmitted
    pub async fn set_backlight(
        &self,
        session: &mut dyn RemoteSession,
        level: i64,
    ) -> Result<u8, PushError> {
        let clamped = clamp_backlight(level);
        if clamped as i64 != level {
            tracing::debug!("Backlight level {} clamped to {}", level, clamped);
        }
        self.run(session, DeviceCommand::SetBacklight(clamped))
            .await
            .map(|_| clamped)
    }

    pub async fn refresh_display(
        &self,
        session: &mut dyn RemoteSession,
        remote_path: &str,
    ) -> Result<(), PushError> {
        self.run(session, DeviceCommand::Refresh(remote_path.to_string()))
            .await
            .map(|_| ())
    }

    pub async fn clear_display(&self, session: &mut dyn RemoteSession) -> Result<(), PushError> {
        self.run(session, DeviceCommand::Clear).await.map(|_| ())
    }

    pub async fn list_directory(
        &self,
        session: &mut dyn RemoteSession,
        path: &str,
    ) -> Result<CommandOutput, PushError> {
        self.run(session, DeviceCommand::ListDirectory(path.to_string()))
            .await
    }

    /// Run a command, treating a non-zero exit as an execution error
    async fn run(
        &self,
        session: &mut dyn RemoteSession,
        command: DeviceCommand,
    ) -> Result<CommandOutput, PushError> {
        let line = command.shell();
        tracing::debug!("Running `{}`", line);

        let output = session.execute(&line).await?;
        if !output.success() {
            return Err(PushError::Execution(format!(
                "`{}` exited with status {}: {}",
                line,
                output.exit_code,
                output.stderr.trim()
            )));
        }

        Ok(output)
    }
}
