//! Domain error types. Configuration/validation failures are fatal at
//! startup (spec: "report the offending field and exit"); I/O failures on
//! trace files are wrapped with `anyhow::Context` at their call sites and
//! propagate out of `main`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("packet too long for any valid SF/BW pair under the given PHY parameters")]
    NoValidSfBw,
}
