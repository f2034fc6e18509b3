// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    #[error("use after release: {0}")]
    UseAfterRelease(&'static str),

    #[error("native name {name} is already bound to live frame {holder}")]
    NameCollision { name: u32, holder: uuid::Uuid },

    #[error("native call failed (code {code}): {context}")]
    NativeCall { code: i32, context: String },

    #[error("frame pool is closed")]
    PoolClosed,

    #[error("output stream is closed")]
    StreamClosed,

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Build a `NativeCall` error from a raw engine status code.
    pub fn native(code: i32, context: impl Into<String>) -> Self {
        Self::NativeCall {
            code,
            context: context.into(),
        }
    }
}
