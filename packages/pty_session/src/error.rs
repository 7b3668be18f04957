/// Errors that can occur during PTY session operations
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    /// Terminal allocation or process creation failed
    #[error("failed to launch PTY: {0}")]
    Launch(String),
    /// Window-size change rejected by the terminal
    #[error("failed to resize PTY: {0}")]
    Resize(String),
    /// Signal delivery to the child failed
    #[error("failed to signal PTY process: {0}")]
    Signal(String),
}

impl From<anyhow::Error> for PtyError {
    fn from(err: anyhow::Error) -> Self {
        PtyError::Launch(format!("{:#}", err))
    }
}
