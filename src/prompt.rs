use std::io::{self, Write};
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};

use crate::output::OutputMode;

/// Asks `question` on stderr and waits for `y` or `n`. Non-interactive runs
/// accept without asking.
pub fn confirm(question: &str, mode: OutputMode) -> io::Result<bool> {
    if !mode.is_interactive() {
        return Ok(true);
    }
    let mut stderr = io::stderr();
    write!(stderr, "{question} [y/n] ")?;
    stderr.flush()?;

    enable_raw_mode()?;
    let answer = read_answer();
    disable_raw_mode()?;

    let confirmed = answer?;
    writeln!(stderr, "{}", if confirmed { "y" } else { "n" })?;
    Ok(confirmed)
}

fn read_answer() -> io::Result<bool> {
    loop {
        if !event::poll(Duration::from_millis(100))? {
            continue;
        }
        if let Event::Key(key) = event::read()? {
            if key.kind != KeyEventKind::Press {
                continue;
            }
            match key.code {
                KeyCode::Char('y') | KeyCode::Char('Y') => return Ok(true),
                KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => return Ok(false),
                _ => {}
            }
        }
    }
}

/// Wording for the restart flags a run was started with.
pub fn restart_question(
    restart_failed: bool,
    restart_finished: bool,
    restart_running: bool,
) -> Option<String> {
    let mut kinds = Vec::new();
    if restart_failed {
        kinds.push("failed");
    }
    if restart_finished {
        kinds.push("finished");
    }
    if restart_running {
        kinds.push("running");
    }
    if kinds.is_empty() {
        return None;
    }
    Some(format!(
        "Restart {} analyses? Existing results may be overwritten.",
        kinds.join(" and ")
    ))
}
