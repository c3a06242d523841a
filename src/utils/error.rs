//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;
use std::string;

use serde::{Serialize, Deserialize};

/// Customized error type for Viewstamp.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ViewstampError {
    /// Read or undo on an empty operation log.
    EmptyLog,

    /// Message carrying a view/op number at or below the current one.
    StaleMessage,

    /// Gave up waiting for a quorum of acknowledgements.
    QuorumTimeout,

    /// Recovery did not gather enough responses in time.
    RecoveryTimeout,

    /// Recovery responses did not all echo the nonce sent out.
    NonceMismatch,

    /// Recovery responses did not contain exactly one primary.
    NoPrimaryFound,

    /// Collected DoViewChange messages disagree on the view number.
    ViewMismatch,

    /// This replica is not the primary.
    NotPrimary,

    /// This replica is in the middle of a view change.
    UnderViewChange,

    /// The processing context was cancelled before completion.
    Cancelled,

    /// Any other error, carrying its string representation.
    Msg(String),
}

impl ViewstampError {
    pub fn msg(msg: impl ToString) -> Self {
        ViewstampError::Msg(msg.to_string())
    }
}

impl fmt::Display for ViewstampError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::EmptyLog => write!(f, "operation log is empty"),
            Self::StaleMessage => write!(f, "stale message"),
            Self::QuorumTimeout => write!(f, "quorum wait timed out"),
            Self::RecoveryTimeout => write!(f, "recovery timed out"),
            Self::NonceMismatch => write!(f, "recovery nonce mismatch"),
            Self::NoPrimaryFound => {
                write!(f, "no unique primary among recovery responses")
            }
            Self::ViewMismatch => {
                write!(f, "DoViewChange messages carry different views")
            }
            Self::NotPrimary => write!(f, "not primary"),
            Self::UnderViewChange => write!(f, "view change"),
            Self::Cancelled => write!(f, "context cancelled"),
            Self::Msg(msg) => write!(f, "{}", msg), // no literal quotes
        }
    }
}

impl error::Error for ViewstampError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `ViewstampError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for ViewstampError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                ViewstampError::Msg(e.to_string())
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `ViewstampError`.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for ViewstampError {
            fn from(e: $error) -> ViewstampError {
                ViewstampError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(string::FromUtf8Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::sync::oneshot::error::RecvError);
impl_from_error!(tokio::task::JoinError);

impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);
impl_from_error_generic!(tokio::sync::watch::error::SendError<T>);
