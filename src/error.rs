use crate::{dialog::DialogId, transaction::key::TransactionKey, transport::SipAddr};
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("SIP message error: {0}")]
    SipMessageError(#[from] rsip::Error),

    #[error("transport error: {0}: {1}")]
    TransportError(String, SipAddr),

    #[error("transaction error: {0}: {1}")]
    TransactionError(String, TransactionKey),

    #[error("dialog error: {0}: {1}")]
    DialogError(String, DialogId),

    #[error("registration error: {0}")]
    RegistrationError(String),

    #[error("call error: {0}")]
    CallError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("address parse error: {0}")]
    AddrParseError(#[from] std::net::AddrParseError),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("keepalive frame")]
    Keepalive,

    #[error("{0}")]
    Error(String),
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelSendError(e.to_string())
    }
}
