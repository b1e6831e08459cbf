// OS volume control for the endpoint client.
//
// `CommandMixer` runs configured shell commands (`sh -c` on unix, `cmd /C` on
// Windows). The volume template gets `{volume}` replaced by the percentage,
// e.g. `amixer -q set Master {volume}%` or `pactl set-sink-volume
// @DEFAULT_SINK@ {volume}%`. The optional unmute command runs before every
// volume change; without one, `unmute` answers `NotMuted`.

use std::process::Command;

use tracing::debug;

use super::{Mixer, MixerError};
use crate::config::ClientConfig;

/// Runs shell commands to change the volume.
#[derive(Clone, Debug)]
pub struct CommandMixer {
    volume_template: String,
    unmute_command: Option<String>,
}

impl CommandMixer {
    pub fn new(volume_template: impl Into<String>) -> Self {
        Self {
            volume_template: volume_template.into(),
            unmute_command: None,
        }
    }

    pub fn with_unmute(mut self, command: impl Into<String>) -> Self {
        self.unmute_command = Some(command.into());
        self
    }

    /// Mixer for the commands in `config`; `None` without a volume command.
    pub fn from_config(config: &ClientConfig) -> Option<Self> {
        let mixer = Self::new(config.volume_command.as_deref()?);
        Some(match &config.unmute_command {
            Some(command) => mixer.with_unmute(command.as_str()),
            None => mixer,
        })
    }

    fn volume_command(&self, volume: u8) -> String {
        self.volume_template.replace("{volume}", &volume.to_string())
    }
}

impl Mixer for CommandMixer {
    fn unmute(&mut self) -> Result<(), MixerError> {
        match &self.unmute_command {
            Some(command) => run_shell(command),
            None => Err(MixerError::NotMuted),
        }
    }

    fn set_volume(&mut self, volume: u8) -> Result<(), MixerError> {
        run_shell(&self.volume_command(volume))
    }
}

fn run_shell(command: &str) -> Result<(), MixerError> {
    debug!("Running volume command: {command}");
    let status = if cfg!(windows) {
        Command::new("cmd").args(["/C", command]).status()?
    } else {
        Command::new("sh").args(["-c", command]).status()?
    };
    if status.success() {
        Ok(())
    } else {
        Err(MixerError::Command(format!("`{command}` exited with {status}")))
    }
}

/// Logs volume changes and does nothing else.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullMixer;

impl Mixer for NullMixer {
    fn unmute(&mut self) -> Result<(), MixerError> {
        Err(MixerError::NotMuted)
    }

    fn set_volume(&mut self, volume: u8) -> Result<(), MixerError> {
        debug!("No volume command configured, ignoring volume {volume}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_mixer_substitutes_volume() {
        let mixer = CommandMixer::new("amixer -q set Master {volume}%");
        assert_eq!(mixer.volume_command(42), "amixer -q set Master 42%");
    }

    #[test]
    fn mixer_without_unmute_command_reports_not_muted() {
        let mut mixer = CommandMixer::new("true");
        assert!(matches!(mixer.unmute(), Err(MixerError::NotMuted)));
        assert!(matches!(NullMixer.unmute(), Err(MixerError::NotMuted)));
    }

    #[test]
    fn config_without_volume_command_has_no_mixer() {
        let config = ClientConfig {
            unmute_command: Some("true".into()),
            ..ClientConfig::default()
        };
        assert!(CommandMixer::from_config(&config).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn configured_unmute_command_runs() {
        let config = ClientConfig {
            volume_command: Some("test {volume} -eq 30".into()),
            unmute_command: Some("true".into()),
            ..ClientConfig::default()
        };
        let mut mixer = CommandMixer::from_config(&config).unwrap();
        assert!(mixer.unmute().is_ok());
        assert!(mixer.set_volume(30).is_ok());
        assert!(matches!(mixer.set_volume(31), Err(MixerError::Command(_))));

        let config = ClientConfig {
            unmute_command: Some("exit 1".into()),
            ..config
        };
        let mut mixer = CommandMixer::from_config(&config).unwrap();
        assert!(matches!(mixer.unmute(), Err(MixerError::Command(_))));
    }

    #[cfg(unix)]
    #[test]
    fn failing_volume_command_is_reported() {
        let mut mixer = CommandMixer::new("exit 3");
        assert!(matches!(mixer.set_volume(10), Err(MixerError::Command(_))));
        let mut mixer = CommandMixer::new("true");
        assert!(mixer.set_volume(10).is_ok());
    }
}
