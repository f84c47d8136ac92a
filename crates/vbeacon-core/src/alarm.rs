//! Alarm sinks.
//!
//! - [`LogAlarm`] - records the violation in the log only
//! - [`CommandAlarm`] - plays an alert by spawning an external command
//!   (a buzzer driver, `aplay`, ...) without waiting for it

use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, error, info, warn};

use crate::monitor::AlarmSink;

/// Alarm that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlarm;

impl AlarmSink for LogAlarm {
    fn trigger(&self) {
        info!("Proximity alarm");
    }
}

/// Alarm that spawns an external command per trigger.
///
/// A trigger that arrives while the previous command is still running is
/// skipped, so playback never overlaps.
#[derive(Debug)]
pub struct CommandAlarm {
    program: String,
    args: Vec<String>,
    playing: Mutex<Option<Child>>,
}

impl CommandAlarm {
    /// Create an alarm from a program and its arguments.
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            playing: Mutex::new(None),
        }
    }

    /// Build from a command line split on whitespace.
    ///
    /// Returns `None` for an empty command line.
    #[must_use]
    pub fn from_command_line(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    /// The program that will be spawned.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Whether the last spawned command is still running.
    #[must_use]
    pub fn is_playing(&self) -> bool {
        let mut playing = self.playing.lock().unwrap_or_else(PoisonError::into_inner);
        Self::still_running(&mut playing)
    }

    fn still_running(slot: &mut Option<Child>) -> bool {
        let Some(child) = slot.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                if !status.success() {
                    warn!(%status, "Alarm command exited unsuccessfully");
                }
                *slot = None;
                false
            }
            Err(e) => {
                warn!(error = %e, "Failed to poll alarm command");
                *slot = None;
                false
            }
        }
    }
}

impl AlarmSink for CommandAlarm {
    fn trigger(&self) {
        let mut playing = self.playing.lock().unwrap_or_else(PoisonError::into_inner);
        if Self::still_running(&mut playing) {
            debug!("Alarm already playing; skipping trigger");
            return;
        }

        match Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => {
                debug!(program = %self.program, pid = child.id(), "Alarm command started");
                *playing = Some(child);
            }
            Err(e) => error!(program = %self.program, error = %e, "Failed to start alarm command"),
        }
    }
}

impl Drop for CommandAlarm {
    fn drop(&mut self) {
        let slot = self.playing.get_mut().unwrap_or_else(PoisonError::into_inner);
        let Some(mut child) = slot.take() else {
            return;
        };
        if let Err(e) = child.kill() {
            debug!(program = %self.program, error = %e, "Alarm command already exited");
        }
        // Reap so the child does not linger as a zombie.
        match child.wait() {
            Ok(status) => debug!(program = %self.program, %status, "Alarm command reaped"),
            Err(e) => warn!(program = %self.program, error = %e, "Failed to reap alarm command"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_command_line_splits_arguments() {
        let alarm = CommandAlarm::from_command_line("aplay -q /usr/share/sounds/alert.wav").unwrap();
        assert_eq!(alarm.program(), "aplay");
        assert_eq!(alarm.args, vec!["-q", "/usr/share/sounds/alert.wav"]);
    }

    #[test]
    fn test_from_empty_command_line_is_none() {
        assert!(CommandAlarm::from_command_line("   ").is_none());
    }

    #[test]
    fn test_missing_program_does_not_panic() {
        let alarm = CommandAlarm::new("/nonexistent/vbeacon-alarm", Vec::new());
        alarm.trigger();
        assert!(!alarm.is_playing());
    }

    #[cfg(unix)]
    #[test]
    fn test_trigger_skips_while_playing() {
        let alarm = CommandAlarm::new("sleep", vec!["2".to_string()]);

        alarm.trigger();
        assert!(alarm.is_playing());
        let first_pid = alarm
            .playing
            .lock()
            .unwrap()
            .as_ref()
            .map(Child::id)
            .unwrap();

        alarm.trigger();
        let second_pid = alarm
            .playing
            .lock()
            .unwrap()
            .as_ref()
            .map(Child::id)
            .unwrap();
        assert_eq!(first_pid, second_pid);

        let leftover = alarm.playing.lock().unwrap().take();
        if let Some(mut child) = leftover {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_drop_stops_a_running_command() {
        let alarm = CommandAlarm::new("sleep", vec!["30".to_string()]);
        alarm.trigger();
        assert!(alarm.is_playing());

        let started = std::time::Instant::now();
        drop(alarm);

        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }
}
