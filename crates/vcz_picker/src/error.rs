use std::io;

use thiserror::Error;

use crate::block::BlockInfo;

#[derive(Error, Debug)]
pub enum Error {
    #[error("The piece `{0}` has no outstanding requests")]
    PieceNotRequested(usize),
    #[error("The block {0:?} does not exist on its piece")]
    BlockUnknown(BlockInfo),
    #[error("The block {0:?} was requested from a different peer")]
    WrongPeer(BlockInfo),
    #[error("The block {0:?} was already received")]
    BlockAlreadyReceived(BlockInfo),
    #[error("The block {0:?} was never requested")]
    BlockNotRequested(BlockInfo),
    #[error("IO error")]
    IO(#[from] io::Error),
    #[error("Tried to load $HOME but could not find it. Please make sure you have a $HOME env and that this program has the permission to create dirs.")]
    HomeInvalid,
    #[error(
        "Could not open the folder `{0}`. Please make sure the program has permission to open it and that the folder exist"
    )]
    FolderOpenError(String),
    #[error("Error while trying to read the configuration file, please make sure it has the correct format")]
    ConfigDeserializeError(#[from] toml::de::Error),
    #[error("Could not write the default configuration")]
    ConfigSerializeError(#[from] toml::ser::Error),
}
