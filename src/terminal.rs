use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size};
use thiserror::Error;

use crate::packet::WindowSize;

#[derive(Error, Debug)]
pub enum TerminalError {
    #[error("failed to enable raw mode: {0}")]
    EnableRawMode(#[source] std::io::Error),

    #[error("failed to query terminal size: {0}")]
    Size(#[source] std::io::Error),
}

/// RAII guard for terminal raw mode.
///
/// Raw mode lets every keystroke (Ctrl+C included) reach the remote shell
/// instead of the local line discipline. Dropping the guard, on any exit
/// path including a panic, restores the previous mode.
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    pub fn new() -> Result<Self, TerminalError> {
        enable_raw_mode().map_err(TerminalError::EnableRawMode)?;
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Current geometry of the local terminal.
///
/// Pixel dimensions are included when the terminal reports them; otherwise
/// they are zero.
pub fn window_size() -> Result<WindowSize, TerminalError> {
    match crossterm::terminal::window_size() {
        Ok(ws) if ws.rows > 0 && ws.columns > 0 => Ok(WindowSize {
            rows: ws.rows,
            cols: ws.columns,
            x_pixels: ws.width,
            y_pixels: ws.height,
        }),
        _ => {
            // crossterm reports (cols, rows)
            let (cols, rows) = size().map_err(TerminalError::Size)?;
            Ok(WindowSize::new(rows, cols))
        }
    }
}
