//! Range validation for tenant settings. Out-of-range values are rejected,
//! never clamped.

use std::fmt::Display;

use crate::error::ValidationIssue;
use crate::tenant::model::{TenantSettings, WEBHOOK_EVENTS};

#[derive(Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

fn check_range<T: PartialOrd + Display>(
    report: &mut ValidationReport,
    field: &str,
    value: T,
    min: T,
    max: T,
) {
    if value < min || value > max {
        report.errors.push(ValidationIssue::new(
            field,
            format!("must be between {min} and {max} (got {value})"),
        ));
    }
}

pub fn validate_settings(settings: &TenantSettings) -> ValidationReport {
    let mut report = ValidationReport::default();

    let rl = &settings.rate_limiting;
    check_range(&mut report, "rate_limiting.requests_per_minute", rl.requests_per_minute, 1, 10_000);
    check_range(&mut report, "rate_limiting.burst_limit", rl.burst_limit, 1, 1_000);
    if rl.burst_limit < rl.requests_per_minute {
        report.warnings.push(format!(
            "rate_limiting.burst_limit ({}) is lower than requests_per_minute ({})",
            rl.burst_limit, rl.requests_per_minute
        ));
    }

    let p = &settings.processing;
    check_range(&mut report, "processing.max_concurrent_analyses", p.max_concurrent_analyses, 1, 1_000);
    check_range(&mut report, "processing.timeout_ms", p.timeout_ms, 100, 30_000);
    check_range(&mut report, "processing.batch_size", p.batch_size, 1, 1_000);

    let c = &settings.caching;
    check_range(&mut report, "caching.ttl_seconds", c.ttl_seconds, 30, 3_600);
    check_range(&mut report, "caching.max_size", c.max_size, 100, 100_000);

    let min_confidence = settings.quality.min_confidence;
    if !min_confidence.is_finite() {
        report.errors.push(ValidationIssue::new(
            "quality.min_confidence",
            "must be a finite number",
        ));
    } else {
        check_range(&mut report, "quality.min_confidence", min_confidence, 0.1, 1.0);
    }

    check_range(
        &mut report,
        "security.data_retention_days",
        settings.security.data_retention_days,
        1,
        365,
    );

    if let Some(webhook) = &settings.webhook {
        match reqwest::Url::parse(&webhook.url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => {}
            _ => report.errors.push(ValidationIssue::new(
                "webhook.url",
                format!("'{}' is not an http(s) URL", webhook.url),
            )),
        }
        for event in &webhook.events {
            if !WEBHOOK_EVENTS.contains(&event.as_str()) {
                report.errors.push(ValidationIssue::new(
                    "webhook.events",
                    format!("unknown event '{event}'"),
                ));
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::model::WebhookSettings;

    #[test]
    fn defaults_are_valid_without_warnings() {
        let report = validate_settings(&TenantSettings::default());
        assert!(report.is_valid(), "{:?}", report.errors);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn zero_rpm_is_rejected() {
        let mut settings = TenantSettings::default();
        settings.rate_limiting.requests_per_minute = 0;
        let report = validate_settings(&settings);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].field, "rate_limiting.requests_per_minute");
    }

    #[test]
    fn boundaries_are_inclusive() {
        let mut settings = TenantSettings::default();
        settings.rate_limiting.requests_per_minute = 10_000;
        settings.processing.timeout_ms = 100;
        settings.caching.ttl_seconds = 3_600;
        settings.quality.min_confidence = 0.1;
        settings.security.data_retention_days = 365;
        assert!(validate_settings(&settings).is_valid());

        settings.processing.timeout_ms = 30_001;
        settings.caching.max_size = 99;
        settings.quality.min_confidence = 1.5;
        let report = validate_settings(&settings);
        assert_eq!(report.errors.len(), 3);
    }

    #[test]
    fn low_burst_is_a_warning() {
        let mut settings = TenantSettings::default();
        settings.rate_limiting.requests_per_minute = 5000;
        let report = validate_settings(&settings);
        assert!(report.is_valid());
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn webhook_must_be_http() {
        let mut settings = TenantSettings::default();
        settings.webhook = Some(WebhookSettings {
            url: "ftp://example.com/hook".into(),
            events: vec!["message.processed".into(), "bogus".into()],
            secret: None,
        });
        let report = validate_settings(&settings);
        assert_eq!(report.errors.len(), 2);

        settings.webhook = Some(WebhookSettings {
            url: "https://example.com/hook".into(),
            events: vec!["message.failed".into()],
            secret: None,
        });
        assert!(validate_settings(&settings).is_valid());
    }
}
