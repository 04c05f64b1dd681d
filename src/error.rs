// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config line {line}: {reason}")]
    Config { line: usize, reason: String },

    #[error("reading config {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("encoding {kind} failed: {source}")]
    Encode {
        kind: crate::Kind,
        #[source]
        source: bincode::Error,
    },

    #[error("decoding message failed: {0}")]
    Decode(#[source] bincode::Error),

    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    #[error("{addr} unreachable after {attempts} attempts")]
    Unreachable { addr: crate::Address, attempts: u32 },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn config(line: usize, reason: impl Into<String>) -> Self {
        Error::Config {
            line,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
