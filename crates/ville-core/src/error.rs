#![forbid(unsafe_code)]

//! Error taxonomy for the detection core.
//!
//! Only structural problems are errors. Warm-up (too little reference data),
//! degenerate references (zero spread) and wealth overflow are absorbed
//! locally and produce sentinel values instead:
//!
//! | Condition | Behavior |
//! |-----------|----------|
//! | reference < 2 points | score `0.0`, p-value `1.0` |
//! | zero variance / MAD | epsilon-guarded denominator |
//! | wealth overflow / underflow | clipped to `[WEALTH_MIN, WEALTH_MAX]` |
//! | bad configuration | [`VilleError::InvalidConfiguration`] at construction |
//! | ragged multivariate rows | [`VilleError::ShapeMismatch`] before processing |

use thiserror::Error;

/// Errors raised by configuration resolution and input validation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VilleError {
    /// A configuration field is outside its valid domain.
    #[error("invalid configuration: {field} = {value} ({reason})")]
    InvalidConfiguration {
        field: &'static str,
        value: String,
        reason: &'static str,
    },

    /// Scorer name not recognized.
    #[error("unknown scorer kind: {0:?}")]
    UnknownScorer(String),

    /// Martingale name not recognized.
    #[error("unknown martingale kind: {0:?}")]
    UnknownMartingale(String),

    /// A row's vector length disagrees with the table width.
    #[error("shape mismatch at row {row}: expected {expected} features, found {found}")]
    ShapeMismatch {
        row: usize,
        expected: usize,
        found: usize,
    },

    /// NaN or infinite input value.
    #[error("non-finite observation at row {row}, column {column}")]
    NonFiniteObservation { row: usize, column: usize },

    /// A table needs at least one column.
    #[error("feature table has no columns")]
    EmptyTable,

    /// The configuration document could not be decoded.
    #[error("invalid configuration document: {0}")]
    ConfigParse(String),
}

impl VilleError {
    pub(crate) fn invalid(field: &'static str, value: impl ToString, reason: &'static str) -> Self {
        Self::InvalidConfiguration {
            field,
            value: value.to_string(),
            reason,
        }
    }

    /// True for errors caused by the configuration rather than the data.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfiguration { .. }
                | Self::UnknownScorer(_)
                | Self::UnknownMartingale(_)
                | Self::ConfigParse(_)
        )
    }
}

impl From<serde_json::Error> for VilleError {
    fn from(e: serde_json::Error) -> Self {
        VilleError::ConfigParse(e.to_string())
    }
}

/// Result alias for the detection core.
pub type VilleResult<T> = Result<T, VilleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_field() {
        let e = VilleError::invalid("alpha", 1.5, "must lie in (0, 1)");
        let msg = e.to_string();
        assert!(msg.contains("alpha"));
        assert!(msg.contains("1.5"));
        assert!(e.is_configuration());
    }

    #[test]
    fn shape_mismatch_is_data_error() {
        let e = VilleError::ShapeMismatch {
            row: 3,
            expected: 2,
            found: 5,
        };
        assert!(e.to_string().contains("row 3"));
        assert!(!e.is_configuration());
    }

    #[test]
    fn json_errors_convert() {
        let err = serde_json::from_str::<u32>("not json").unwrap_err();
        let e: VilleError = err.into();
        assert!(matches!(e, VilleError::ConfigParse(_)));
    }
}
