use std::{
    io::{self, BufRead, IsTerminal, Write},
    sync::{Arc, Mutex, PoisonError},
    thread,
};

use anyhow::{Context, Result};
use crossterm::{
    cursor::MoveToColumn,
    event::{Event, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    queue,
    style::Print,
    terminal::{self, Clear, ClearType},
};
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const PROMPT: &str = "> ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
    /// The edit buffer changed; carries its new length in characters.
    Changed(usize),
    Submitted(String),
    Closed,
}

#[derive(Debug, Default)]
struct Screen {
    interactive: bool,
    buffer: String,
    indicator: Option<String>,
}

impl Screen {
    fn prompt(&self) -> String {
        match &self.indicator {
            Some(indicator) => format!("{PROMPT}* {indicator} "),
            None => PROMPT.to_string(),
        }
    }

    fn redraw(&self, out: &mut impl Write) -> io::Result<()> {
        queue!(
            out,
            MoveToColumn(0),
            Clear(ClearType::CurrentLine),
            Print(self.prompt()),
            Print(&self.buffer)
        )?;
        out.flush()
    }

    fn print_line(&self, out: &mut impl Write, line: &str) -> io::Result<()> {
        if !self.interactive {
            writeln!(out, "{line}")?;
            return out.flush();
        }
        queue!(
            out,
            MoveToColumn(0),
            Clear(ClearType::CurrentLine),
            Print(line),
            Print("\r\n")
        )?;
        self.redraw(out)
    }
}

/// Applies one key press to the edit buffer.
fn edit(buffer: &mut String, key: KeyEvent) -> Option<InputEvent> {
    let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
    match key.code {
        KeyCode::Char('c') if ctrl => Some(InputEvent::Closed),
        KeyCode::Char('d') if ctrl => buffer.is_empty().then_some(InputEvent::Closed),
        KeyCode::Char('u') if ctrl => {
            if buffer.is_empty() {
                return None;
            }
            buffer.clear();
            Some(InputEvent::Changed(0))
        }
        KeyCode::Char(_) if ctrl => None,
        KeyCode::Char(c) => {
            buffer.push(c);
            Some(InputEvent::Changed(buffer.chars().count()))
        }
        KeyCode::Backspace => buffer
            .pop()
            .map(|_| InputEvent::Changed(buffer.chars().count())),
        KeyCode::Enter => Some(InputEvent::Submitted(std::mem::take(buffer))),
        _ => None,
    }
}

/// Restores cooked mode when dropped.
pub struct RawModeGuard {
    enabled: bool,
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if !self.enabled {
            return;
        }
        if let Err(error) = terminal::disable_raw_mode() {
            warn!(?error, "failed to restore terminal mode");
        }
        println!();
    }
}

/// Cloneable handle for printing above the prompt.
///
/// When both stdin and stdout are terminals the client runs a small raw-mode
/// line editor: every keystroke that changes the buffer is reported as
/// [`InputEvent::Changed`]. Otherwise stdin is read line by line and output
/// is plain text, which keeps the client scriptable.
#[derive(Debug, Clone)]
pub struct Terminal {
    screen: Arc<Mutex<Screen>>,
}

impl Terminal {
    /// Starts reading input and returns the output handle, the input events
    /// and the guard that restores the terminal.
    pub fn start() -> Result<(Self, mpsc::UnboundedReceiver<InputEvent>, RawModeGuard)> {
        let interactive = io::stdin().is_terminal() && io::stdout().is_terminal();
        let (tx, rx) = mpsc::unbounded_channel();
        let screen = Arc::new(Mutex::new(Screen {
            interactive,
            ..Screen::default()
        }));

        if interactive {
            terminal::enable_raw_mode().context("failed to enable raw terminal mode")?;
            tokio::spawn(pump_keys(Arc::clone(&screen), tx));
        } else {
            // A plain thread, so a pending blocking read never holds up runtime shutdown.
            thread::spawn(move || pump_lines(tx));
        }

        let terminal = Self { screen };
        if interactive {
            terminal.with_screen(|screen, out| screen.redraw(out));
        }
        Ok((terminal, rx, RawModeGuard { enabled: interactive }))
    }

    pub fn print_line(&self, line: &str) {
        self.with_screen(|screen, out| screen.print_line(out, line));
    }

    /// Replaces the "who is typing" text shown in the prompt.
    pub fn set_indicator(&self, indicator: Option<String>) {
        self.with_screen(|screen, out| {
            screen.indicator = indicator;
            if screen.interactive {
                screen.redraw(out)
            } else {
                Ok(())
            }
        });
    }

    fn with_screen(&self, f: impl FnOnce(&mut Screen, &mut io::StdoutLock<'static>) -> io::Result<()>) {
        let mut screen = self.lock();
        let mut out = io::stdout().lock();
        if let Err(error) = f(&mut *screen, &mut out) {
            debug!(?error, "failed to write to terminal");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Screen> {
        self.screen.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn pump_keys(screen: Arc<Mutex<Screen>>, tx: mpsc::UnboundedSender<InputEvent>) {
    let mut events = EventStream::new();

    while let Some(event) = events.next().await {
        let key = match event {
            Ok(Event::Key(key)) if key.kind == KeyEventKind::Press => key,
            Ok(_) => continue,
            Err(error) => {
                warn!(?error, "failed to read terminal input");
                break;
            }
        };

        let input = {
            let mut screen = screen.lock().unwrap_or_else(PoisonError::into_inner);
            let input = edit(&mut screen.buffer, key);
            if input.is_some() {
                if let Err(error) = screen.redraw(&mut io::stdout().lock()) {
                    debug!(?error, "failed to redraw prompt");
                }
            }
            input
        };

        match input {
            Some(InputEvent::Closed) => break,
            Some(input) => {
                if tx.send(input).is_err() {
                    return;
                }
            }
            None => {}
        }
    }

    let _ = tx.send(InputEvent::Closed);
}

fn pump_lines(tx: mpsc::UnboundedSender<InputEvent>) {
    for line in io::stdin().lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(error) => {
                debug!(?error, "failed to read stdin");
                break;
            }
        };

        let line = line.trim_end_matches(['\r', '\n']).to_string();
        let len = line.chars().count();
        if len > 0 && tx.send(InputEvent::Changed(len)).is_err() {
            return;
        }
        if tx.send(InputEvent::Submitted(line)).is_err() {
            return;
        }
    }

    let _ = tx.send(InputEvent::Closed);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    fn ctrl(c: char) -> KeyEvent {
        KeyEvent::new(KeyCode::Char(c), KeyModifiers::CONTROL)
    }

    #[test]
    fn typing_and_erasing_reports_lengths() {
        let mut buffer = String::new();

        assert_eq!(edit(&mut buffer, key(KeyCode::Char('h'))), Some(InputEvent::Changed(1)));
        assert_eq!(edit(&mut buffer, key(KeyCode::Char('é'))), Some(InputEvent::Changed(2)));
        assert_eq!(edit(&mut buffer, key(KeyCode::Backspace)), Some(InputEvent::Changed(1)));
        assert_eq!(edit(&mut buffer, key(KeyCode::Backspace)), Some(InputEvent::Changed(0)));
        assert_eq!(edit(&mut buffer, key(KeyCode::Backspace)), None);
    }

    #[test]
    fn enter_submits_and_clears() {
        let mut buffer = String::from("hi");

        assert_eq!(
            edit(&mut buffer, key(KeyCode::Enter)),
            Some(InputEvent::Submitted("hi".into()))
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn control_keys() {
        let mut buffer = String::from("draft");

        assert_eq!(edit(&mut buffer, ctrl('d')), None);
        assert_eq!(edit(&mut buffer, ctrl('u')), Some(InputEvent::Changed(0)));
        assert_eq!(edit(&mut buffer, ctrl('u')), None);
        assert_eq!(edit(&mut buffer, ctrl('d')), Some(InputEvent::Closed));
        assert_eq!(edit(&mut buffer, ctrl('c')), Some(InputEvent::Closed));
        assert_eq!(edit(&mut buffer, ctrl('x')), None);
    }

    #[test]
    fn prompt_shows_typing_indicator() {
        let mut screen = Screen::default();
        assert_eq!(screen.prompt(), "> ");

        screen.indicator = Some("bob typing...".into());
        assert_eq!(screen.prompt(), "> * bob typing... ");
    }

    #[test]
    fn plain_screen_prints_bare_lines() {
        let screen = Screen::default();
        let mut out = Vec::new();

        screen.print_line(&mut out, "* bob joined the chat").expect("print");

        assert_eq!(out, b"* bob joined the chat\n");
    }
}
