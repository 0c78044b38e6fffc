use std::error::Error as StdError;

use thiserror::Error;

/// Errors produced by the switch engine
#[derive(Error, Debug)]
pub enum SwitchError {
    #[error("Inconsistent options: {0}")]
    Config(String),

    #[error("Wrong core state: {0}")]
    State(String),

    #[error("Input plugin error: {0}")]
    Input(#[source] Box<dyn StdError + Send + Sync>),

    #[error("Output plugin error: {0}")]
    Output(#[source] Box<dyn StdError + Send + Sync>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SwitchError {
    /// Wrap a plugin-specific error as an input failure.
    pub fn input<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Input(Box::new(err))
    }

    /// Wrap a plugin-specific error as an output failure.
    pub fn output<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Output(Box::new(err))
    }
}
