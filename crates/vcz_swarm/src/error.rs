use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Picker(#[from] vcz_picker::error::Error),
    #[error("The swarm does not have {0} of the pieces, the download can never finish")]
    PiecesUnavailable(usize),
    #[error("The download did not finish after {0} rounds")]
    Stalled(usize),
    #[error("Invalid settings: `{0}`")]
    InvalidSettings(String),
}
