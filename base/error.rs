// This file is part of Reelcut, a short-form clip rendering service.
// Copyright (C) 2025 The Reelcut Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Error type carrying a classification kind, in the spirit of
//! `grpc::StatusCode`-style error taxonomies. The kind is what the job runner
//! and the API read; the message is what lands on the job row.

use std::fmt;

/// Error classification. Stages map their failures onto exactly one kind;
/// the runner's catch site and the HTTP plane branch on it.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Unreadable container, zero dimensions, non-positive duration, no audio.
    CorruptMedia,
    /// The artifact store could not be reached or refused the operation.
    StorageUnavailable,
    /// The requested blob or row does not exist.
    NotFound,
    /// Speech-to-text failed or produced an empty transcript.
    TranscribeFailed,
    /// The user's credit balance cannot cover the job.
    InsufficientCredits,
    /// The encoder exited non-zero or produced empty output.
    EncodeFailed,
    /// An external process exceeded its deadline.
    Timeout,
    /// SQLite refused or corrupted an operation.
    DbFailure,
    /// Bad environment configuration or a missing external tool.
    ConfigError,
    /// A bug: invariants violated inside the worker itself.
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::CorruptMedia => "corrupt media",
            ErrorKind::StorageUnavailable => "storage unavailable",
            ErrorKind::NotFound => "not found",
            ErrorKind::TranscribeFailed => "transcribe failed",
            ErrorKind::InsufficientCredits => "insufficient credits",
            ErrorKind::EncodeFailed => "encode failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::DbFailure => "database failure",
            ErrorKind::ConfigError => "config error",
            ErrorKind::Internal => "internal error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Error {
            kind,
            msg: msg.into(),
            source: None,
        }
    }

    pub fn wrap<E>(kind: ErrorKind, msg: impl Into<String>, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    {
        Error {
            kind,
            msg: msg.into(),
            source: Some(source.into()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn msg(&self) -> &str {
        &self.msg
    }

    /// Returns a `Display` adaptor that prints the full cause chain,
    /// for logging: `error!(err = %e.chain(), ...)`.
    pub fn chain(&self) -> ErrorChain<'_> {
        ErrorChain(self)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.msg.is_empty() {
            fmt::Display::fmt(&self.kind, f)
        } else {
            write!(f, "{}: {}", self.kind, self.msg)
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

pub struct ErrorChain<'a>(&'a Error);

impl fmt::Display for ErrorChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut cur = std::error::Error::source(self.0);
        while let Some(e) = cur {
            write!(f, ": caused by: {e}")?;
            cur = e.source();
        }
        Ok(())
    }
}

/// Extension methods for `Result`.
pub trait ResultExt<T> {
    /// Annotates an error with the given kind, keeping it as the source.
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| {
            let source = e.into();
            Error {
                kind: k,
                msg: source.to_string(),
                source: Some(source),
            }
        })
    }
}

/// Constructs an [`Error`]. The first argument is an [`ErrorKind`] variant
/// name; the message goes inside `msg(...)`:
///
/// ```
/// use reelcut_base::{err, ErrorKind};
/// let e = err!(NotFound, msg("no such job {}", 3));
/// assert_eq!(e.kind(), ErrorKind::NotFound);
/// assert_eq!(e.to_string(), "not found: no such job 3");
/// ```
#[macro_export]
macro_rules! err {
    ($k:ident, msg($($m:tt)*)) => {
        $crate::Error::new($crate::ErrorKind::$k, format!($($m)*))
    };
    ($k:ident, msg($($m:tt)*), source($s:expr)) => {
        $crate::Error::wrap($crate::ErrorKind::$k, format!($($m)*), $s)
    };
}

/// Like [`err!`], but returns the error from the enclosing function.
///
/// ```
/// use reelcut_base::{bail, ErrorKind};
/// let e = || -> Result<(), reelcut_base::Error> {
///     bail!(Timeout, msg("probe exceeded {} s", 30));
/// }()
/// .unwrap_err();
/// assert_eq!(e.kind(), ErrorKind::Timeout);
/// ```
#[macro_export]
macro_rules! bail {
    ($($args:tt)*) => {
        return Err($crate::err!($($args)*))
    };
}
