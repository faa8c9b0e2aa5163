//! Terminal side of the interactive module hooks

use std::io::{self, BufRead, Write};

use indicatif::ProgressBar;
use secrecy::SecretString;
use sfe_encryption::Console;

/// Passphrase source for non-interactive runs
pub const PASSPHRASE_ENV: &str = "SFE_PASSPHRASE";

pub struct TerminalConsole {
    assume_yes: bool,
    bar: Option<ProgressBar>,
}

impl TerminalConsole {
    pub fn new(assume_yes: bool) -> Self {
        Self {
            assume_yes,
            bar: None,
        }
    }

    /// Route output around an active progress bar.
    pub fn attach(&mut self, bar: ProgressBar) {
        self.bar = Some(bar);
    }

    pub fn detach(&mut self) -> Option<ProgressBar> {
        self.bar.take()
    }

    fn suspended<R>(&self, f: impl FnOnce() -> R) -> R {
        match &self.bar {
            Some(bar) => bar.suspend(f),
            None => f(),
        }
    }
}

impl Console for TerminalConsole {
    fn writeln(&mut self, line: &str) {
        match &self.bar {
            Some(bar) => bar.println(line),
            None => println!("{line}"),
        }
    }

    fn confirm(&mut self, question: &str) -> bool {
        if self.assume_yes {
            return true;
        }
        self.suspended(|| ask_yes_no(question).unwrap_or(false))
    }

    fn read_secret(&mut self, prompt: &str) -> Option<SecretString> {
        self.suspended(|| read_passphrase(prompt).ok())
    }
}

fn ask_yes_no(question: &str) -> io::Result<bool> {
    let mut stdout = io::stdout();
    write!(stdout, "{question} (y/n) ")?;
    stdout.flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

/// `SFE_PASSPHRASE` if set, otherwise a hidden prompt.
pub fn read_passphrase(prompt: &str) -> io::Result<SecretString> {
    if let Ok(value) = std::env::var(PASSPHRASE_ENV) {
        return Ok(SecretString::from(value));
    }
    rpassword::prompt_password(prompt).map(SecretString::from)
}
