//! Default remediation catalogue, error classification and retry backoff

use std::time::Duration;

use crate::models::{ErrorReport, FixSource, FixType, ProposedFix};

/// Confidence assigned to catalogue defaults
pub const DEFAULT_FIX_CONFIDENCE: f64 = 0.1;

/// Classify an error into the fix category its default remediation comes from.
///
/// Keyword matching over the error type and message. Dependency problems are
/// checked before code problems because "cannot find module" style messages
/// would otherwise look like compile errors.
pub fn classify_error(error: &ErrorReport) -> FixType {
    let text = format!("{} {}", error.error_type, error.error_message).to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| text.contains(n));

    if has(&[
        "modulenotfound",
        "module not found",
        "cannot find module",
        "no module named",
        "importerror",
        "unresolved import",
        "e0432",
        "e0433",
        "dependency",
        "dependencies",
        "package",
        "crate",
        "lockfile",
        "version conflict",
        "peer dep",
    ]) {
        return FixType::Dependency;
    }

    if has(&[
        "config",
        "configuration",
        "environment variable",
        "env var",
        ".env",
        "setting",
        "missing key",
        "invalid option",
        "permission denied",
    ]) {
        return FixType::Config;
    }

    if has(&[
        "syntax",
        "typeerror",
        "type error",
        "mismatched types",
        "compile",
        "compilation",
        "referenceerror",
        "undefined",
        "lint",
        "assertion",
        "test failed",
        "panicked",
        "e0308",
    ]) {
        return FixType::Patch;
    }

    FixType::Custom
}

/// Deterministic fallback remediations for an error, most specific first
pub fn default_fixes(error: &ErrorReport) -> Vec<ProposedFix> {
    let category = classify_error(error);
    let target = |fallback: &str| {
        error
            .file
            .clone()
            .filter(|f| !f.trim().is_empty())
            .unwrap_or_else(|| fallback.to_string())
    };

    let mut fixes = vec![match category {
        FixType::Dependency => default_fix(
            FixType::Dependency,
            target("dependencies"),
            "Reinstall dependencies and refresh the lockfile",
        ),
        FixType::Config => default_fix(
            FixType::Config,
            target("configuration"),
            "Reset configuration to the last known-good values",
        ),
        FixType::Patch => default_fix(
            FixType::Patch,
            target("source"),
            &format!("Patch the reported location to resolve {}", error.error_type.trim()),
        ),
        FixType::Rollback | FixType::Custom => default_fix(
            FixType::Custom,
            target("workspace"),
            "Clear caches and re-run the failed step",
        ),
    }];

    if category != FixType::Custom {
        fixes.push(default_fix(
            FixType::Custom,
            target("workspace"),
            "Clear caches and re-run the failed step",
        ));
    }
    fixes
}

fn default_fix(fix_type: FixType, fix_target: String, description: &str) -> ProposedFix {
    ProposedFix {
        fix_type,
        fix_target,
        fix_description: description.to_string(),
        source: FixSource::Default,
        confidence: DEFAULT_FIX_CONFIDENCE,
    }
}

/// Exponential backoff before retry number `retry_count`.
///
/// Formula: base * 2^(retry_count-1), capped at max. Retry 0 waits nothing.
pub fn calculate_backoff(retry_count: u32, base: Duration, max: Duration) -> Duration {
    if retry_count == 0 {
        return Duration::ZERO;
    }
    let multiplier = 2u32.saturating_pow(retry_count - 1);
    base.saturating_mul(multiplier).min(max)
}
