use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum UpnpError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("interface {interface} has no usable {family} address")]
    NoSuitableAddress {
        interface: String,
        family: &'static str,
    },
}
