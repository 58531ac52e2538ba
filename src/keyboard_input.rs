use crate::error::{Result, ScanError};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Operator commands read from the terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserCommand {
    /// Run a single scan cycle
    ScanOnce,
    /// Start the scan loop if idle, stop it otherwise
    ToggleScan,
    /// Re-run backend initialization
    RetryBackend,
    Quit,
}

impl UserCommand {
    pub fn from_key(key: &KeyEvent) -> Option<Self> {
        if key.kind != KeyEventKind::Press {
            return None;
        }
        match key.code {
            KeyCode::Char(' ') | KeyCode::Enter => Some(UserCommand::ScanOnce),
            KeyCode::Char('s') | KeyCode::Char('S') => Some(UserCommand::ToggleScan),
            KeyCode::Char('r') | KeyCode::Char('R') => Some(UserCommand::RetryBackend),
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                Some(UserCommand::Quit)
            }
            KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc => Some(UserCommand::Quit),
            _ => None,
        }
    }
}

/// Reads key presses in raw mode on a blocking thread and forwards them as
/// [`UserCommand`]s.
pub struct KeyboardInputHandler {
    commands: mpsc::Sender<UserCommand>,
    cancellation_token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl KeyboardInputHandler {
    pub fn new(commands: mpsc::Sender<UserCommand>) -> Self {
        Self {
            commands,
            cancellation_token: CancellationToken::new(),
            task: None,
        }
    }

    pub fn start(&mut self) -> Result<()> {
        if self.task.is_some() {
            return Err(ScanError::system("keyboard handler already running"));
        }
        info!("Keyboard controls: SPACE scan once, s start/stop, r retry backend, q quit");

        let commands = self.commands.clone();
        let token = self.cancellation_token.clone();

        self.task = Some(task::spawn_blocking(move || {
            if let Err(e) = enable_raw_mode() {
                error!("Failed to enable raw mode for keyboard input: {}", e);
                return;
            }

            while !token.is_cancelled() {
                match event::poll(Duration::from_millis(100)) {
                    Ok(true) => {
                        let key = match event::read() {
                            Ok(Event::Key(key)) => key,
                            Ok(_) => continue,
                            Err(e) => {
                                warn!("Failed to read keyboard event: {}", e);
                                continue;
                            }
                        };

                        let Some(command) = UserCommand::from_key(&key) else {
                            debug!("Ignoring key {:?}", key.code);
                            continue;
                        };
                        debug!("Key {:?} -> {:?}", key.code, command);

                        if commands.blocking_send(command).is_err() {
                            debug!("Command receiver dropped");
                            break;
                        }
                        if command == UserCommand::Quit {
                            break;
                        }
                    }
                    Ok(false) => {}
                    Err(e) => warn!("Error polling for keyboard events: {}", e),
                }
            }

            if let Err(e) = disable_raw_mode() {
                error!("Failed to disable raw mode: {}", e);
            }
            debug!("Keyboard input handler exited");
        }));

        Ok(())
    }

    pub async fn stop(&mut self) {
        self.cancellation_token.cancel();
        if let Some(task) = self.task.take() {
            if tokio::time::timeout(Duration::from_millis(500), task)
                .await
                .is_err()
            {
                warn!("Keyboard handler did not exit in time");
            }
        }
        // Restore the terminal even if the blocking task never got to it
        let _ = disable_raw_mode();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::KeyEventState;

    fn press(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    #[test]
    fn test_key_mapping() {
        assert_eq!(
            UserCommand::from_key(&press(KeyCode::Char(' '))),
            Some(UserCommand::ScanOnce)
        );
        assert_eq!(
            UserCommand::from_key(&press(KeyCode::Char('s'))),
            Some(UserCommand::ToggleScan)
        );
        assert_eq!(
            UserCommand::from_key(&press(KeyCode::Char('r'))),
            Some(UserCommand::RetryBackend)
        );
        assert_eq!(
            UserCommand::from_key(&press(KeyCode::Esc)),
            Some(UserCommand::Quit)
        );
        assert_eq!(
            UserCommand::from_key(&KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL)),
            Some(UserCommand::Quit)
        );
        assert_eq!(UserCommand::from_key(&press(KeyCode::Char('x'))), None);
    }

    #[test]
    fn test_key_release_ignored() {
        let release = KeyEvent {
            code: KeyCode::Char(' '),
            modifiers: KeyModifiers::NONE,
            kind: KeyEventKind::Release,
            state: KeyEventState::NONE,
        };
        assert_eq!(UserCommand::from_key(&release), None);
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let (tx, _rx) = mpsc::channel(4);
        let mut handler = KeyboardInputHandler::new(tx);

        handler.stop().await;
        assert!(handler.cancellation_token.is_cancelled());
        assert!(handler.task.is_none());
    }
}
