// ===============================
// src/risk.rs
// ===============================
use thiserror::Error;

use crate::config::Limits;
use crate::domain::Signal;

#[derive(Debug, Error, PartialEq)]
pub enum SignalError {
    #[error("Invalid trade signal: missing symbol")]
    MissingSymbol,
    #[error("Invalid trade signal: volume must be positive, got {0}")]
    NonPositiveVolume(f64),
    #[error("Invalid trade signal: volume {volume} exceeds limit {limit}")]
    VolumeLimit { volume: f64, limit: f64 },
}

/// Pre-trade checks. A signal that fails here never reaches the gateway.
pub fn check(sig: &Signal, lim: &Limits) -> Result<(), SignalError> {
    // 1) required fields
    if sig.symbol.trim().is_empty() {
        return Err(SignalError::MissingSymbol);
    }
    if !sig.volume.is_finite() || sig.volume <= 0.0 {
        return Err(SignalError::NonPositiveVolume(sig.volume));
    }

    // 2) size limit
    if sig.volume > lim.max_volume {
        return Err(SignalError::VolumeLimit { volume: sig.volume, limit: lim.max_volume });
    }
    Ok(())
}
