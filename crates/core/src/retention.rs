//! Object retention and legal hold.

use crate::error::{Error, Result};
use time::OffsetDateTime;

/// Retention mode discriminant, as stored in the low bits of the packed
/// lock-mode column.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum RetentionMode {
    #[default]
    None = 0,
    Compliance = 1,
    Governance = 2,
}

impl RetentionMode {
    fn from_bits(bits: u8) -> Result<Self> {
        match bits {
            0 => Ok(RetentionMode::None),
            1 => Ok(RetentionMode::Compliance),
            2 => Ok(RetentionMode::Governance),
            other => Err(Error::Encoding(format!("invalid retention mode {other}"))),
        }
    }
}

/// Retention configuration of an object.
///
/// An object under compliance retention cannot be deleted or overwritten
/// before `retain_until`; governance retention can additionally be bypassed
/// by suitably privileged callers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Retention {
    #[default]
    None,
    Governance {
        retain_until: OffsetDateTime,
    },
    Compliance {
        retain_until: OffsetDateTime,
    },
}

impl Retention {
    /// Build from a mode and timestamp pair, validating their consistency.
    pub fn from_parts(mode: RetentionMode, retain_until: Option<OffsetDateTime>) -> Result<Self> {
        match (mode, retain_until) {
            (RetentionMode::None, None) => Ok(Retention::None),
            (RetentionMode::None, Some(_)) => Err(Error::InvalidArgument(
                "retention timestamp set without a mode".into(),
            )),
            (RetentionMode::Governance, Some(retain_until)) => {
                Ok(Retention::Governance { retain_until })
            }
            (RetentionMode::Compliance, Some(retain_until)) => {
                Ok(Retention::Compliance { retain_until })
            }
            (_, None) => Err(Error::InvalidArgument(
                "retention mode set without a timestamp".into(),
            )),
        }
    }

    /// The mode discriminant.
    pub fn mode(&self) -> RetentionMode {
        match self {
            Retention::None => RetentionMode::None,
            Retention::Governance { .. } => RetentionMode::Governance,
            Retention::Compliance { .. } => RetentionMode::Compliance,
        }
    }

    /// The retain-until timestamp, if retention is enabled.
    pub fn retain_until(&self) -> Option<OffsetDateTime> {
        match self {
            Retention::None => None,
            Retention::Governance { retain_until } | Retention::Compliance { retain_until } => {
                Some(*retain_until)
            }
        }
    }

    /// Whether any retention mode is configured.
    pub fn enabled(&self) -> bool {
        !matches!(self, Retention::None)
    }

    /// Whether retention is configured and has not yet elapsed.
    pub fn active(&self, now: OffsetDateTime) -> bool {
        self.retain_until().is_some_and(|until| until > now)
    }

    /// Validate the configuration.
    pub fn verify(&self) -> Result<()> {
        if let Some(until) = self.retain_until() {
            if until == OffsetDateTime::UNIX_EPOCH {
                return Err(Error::InvalidArgument(
                    "retention timestamp must be set".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Pack retention mode and legal hold into the lock-mode column:
/// mode in the low two bits, legal hold in bit 2.
pub fn pack_lock_mode(retention: &Retention, legal_hold: bool) -> i16 {
    let mut bits = retention.mode() as i16;
    if legal_hold {
        bits |= LEGAL_HOLD_BIT;
    }
    bits
}

/// Unpack the lock-mode column into retention state and a legal-hold flag.
pub fn unpack_lock_mode(
    bits: i16,
    retain_until: Option<OffsetDateTime>,
) -> Result<(Retention, bool)> {
    let legal_hold = bits & LEGAL_HOLD_BIT != 0;
    let mode = RetentionMode::from_bits((bits & !LEGAL_HOLD_BIT) as u8)?;
    let retention = Retention::from_parts(mode, retain_until)
        .map_err(|err| Error::Encoding(err.to_string()))?;
    Ok((retention, legal_hold))
}

const LEGAL_HOLD_BIT: i16 = 0b100;
