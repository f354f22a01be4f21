//! Version compatibility gate.
//!
//! `x.y.z` strings compare as `x * 1_000_000 + y * 1_000 + z`. A model whose
//! archive requires a newer runtime is refused; an archive older than the
//! runtime only warns.

use tracing::warn;

use crate::error::EngineError;
use crate::{Result, FLM_VERSION};

/// Parse `x.y.z` into a comparable integer. Missing components count as zero.
pub fn parse(version: &str) -> Option<u32> {
    let mut parts = version.trim().splitn(3, '.');
    let major: u32 = parts.next()?.parse().ok()?;
    let minor: u32 = parts.next().unwrap_or("0").parse().ok()?;
    let patch: u32 = parts.next().unwrap_or("0").parse().ok()?;
    Some(major * 1_000_000 + minor * 1_000 + patch)
}

/// Check a model's `flm_version` requirement against this build.
pub fn check_model_compatible(model_version: &str) -> Result<()> {
    let required = parse(model_version).ok_or_else(|| {
        EngineError::InvalidRequest(format!("unparseable model version `{model_version}`"))
    })?;
    let current = parse(FLM_VERSION).unwrap_or(0);
    if required > current {
        return Err(EngineError::ModelIncompatible {
            required: model_version.to_string(),
            current: FLM_VERSION.to_string(),
        });
    }
    if required < current {
        warn!(
            target: "flm::engine",
            "model version {model_version} predates runtime {FLM_VERSION}; continuing"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_orders_versions() {
        assert!(parse("1.0.0") > parse("0.99.999"));
        assert!(parse("0.9.30") > parse("0.9.4"));
        assert_eq!(parse("2"), Some(2_000_000));
        assert_eq!(parse("not.a.version"), None);
    }

    #[test]
    fn test_future_model_is_refused() {
        let err = check_model_compatible("99.0.0").unwrap_err();
        assert!(matches!(err, EngineError::ModelIncompatible { .. }));
        assert!(check_model_compatible("0.1.0").is_ok());
        assert!(check_model_compatible(FLM_VERSION).is_ok());
    }
}
