use anyhow::Result;
use nix::libc;
use nix::sys::termios::{self, LocalFlags, SetArg, Termios};

/// RAII guard that saves terminal settings and restores them on drop.
/// Does nothing when stdin is not a terminal.
pub struct TerminalGuard {
    original: Option<Termios>,
}

impl TerminalGuard {
    pub fn new() -> Self {
        let stdin = std::io::stdin();
        let original = termios::tcgetattr(&stdin).ok();
        Self { original }
    }

    pub fn enter_raw_mode(&self) {
        if let Some(ref original) = self.original {
            let stdin = std::io::stdin();
            let mut raw = original.clone();
            termios::cfmakeraw(&mut raw);
            let _ = termios::tcsetattr(&stdin, SetArg::TCSANOW, &raw);
        }
    }

    /// Keep line editing but stop echoing typed characters.
    pub fn disable_echo(&self) {
        if let Some(ref original) = self.original {
            let stdin = std::io::stdin();
            let mut quiet = original.clone();
            quiet.local_flags.remove(LocalFlags::ECHO);
            let _ = termios::tcsetattr(&stdin, SetArg::TCSANOW, &quiet);
        }
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        if let Some(ref original) = self.original {
            let stdin = std::io::stdin();
            let _ = termios::tcsetattr(&stdin, SetArg::TCSADRAIN, original);
        }
    }
}

/// Get the current terminal size (rows, cols).
pub fn get_terminal_size() -> Result<(u16, u16)> {
    let mut ws = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let ret = unsafe { libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, &mut ws) };
    if ret == -1 || ws.ws_row == 0 || ws.ws_col == 0 {
        anyhow::bail!("ioctl TIOCGWINSZ failed");
    }
    Ok((ws.ws_row, ws.ws_col))
}

/// Prompt on stderr and read one line from stdin without echo.
pub fn prompt_password(prompt: &str) -> Result<String> {
    use std::io::{BufRead, Write};

    eprint!("{}", prompt);
    std::io::stderr().flush()?;

    let guard = TerminalGuard::new();
    guard.disable_echo();
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    drop(guard);
    eprintln!();

    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
