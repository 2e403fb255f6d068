//! Tenant configuration manager: validated, versioned, auditable settings.
//!
//! Every write produces a new version; the replaced configuration goes to a
//! bounded most-recent-first history. Changes are broadcast so running
//! components can pick them up for new work.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{RwLock, broadcast};
use tracing::{info, warn};

use crate::config::TenantManagerConfig;
use crate::error::{ConfigurationError, ValidationIssue};
use crate::health::{ComponentHealth, HealthProbe, RecoveryAction};
use crate::tenant::model::{
    ChangeKind, ConfigurationChange, ConfigurationExport, ConfigurationMetadata,
    ConfigurationUpdate, DEFAULT_TENANT, ImportFailure, ImportReport, TenantConfiguration,
    TenantSettings,
};
use crate::tenant::validation::validate_settings;

/// Capacity of the change broadcast channel.
const CHANGE_CHANNEL_CAPACITY: usize = 256;

struct TenantRecord {
    current: TenantConfiguration,
    /// Prior versions, most recent first.
    history: VecDeque<TenantConfiguration>,
}

/// Deep-merge `patch` into `base`. `null` removes a key.
fn merge_json(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                if value.is_null() {
                    base.remove(key);
                } else {
                    merge_json(base.entry(key.clone()).or_insert(Value::Null), value);
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

/// Apply a partial JSON patch to settings.
pub fn merge_settings(
    base: &TenantSettings,
    patch: &Value,
) -> Result<TenantSettings, ConfigurationError> {
    if !patch.is_object() {
        return Err(ConfigurationError::Validation(vec![ValidationIssue::new(
            "settings",
            "settings patch must be a JSON object",
        )]));
    }
    let mut merged = serde_json::to_value(base)?;
    merge_json(&mut merged, patch);
    let mut settings: TenantSettings = serde_json::from_value(merged).map_err(|e| {
        ConfigurationError::Validation(vec![ValidationIssue::new("settings", e.to_string())])
    })?;

    // Secrets are not serialized, so carry the current one across the merge.
    if patch.pointer("/webhook/secret").is_none() {
        if let (Some(merged), Some(current)) = (settings.webhook.as_mut(), base.webhook.as_ref()) {
            if merged.secret.is_none() {
                merged.secret = current.secret.clone();
            }
        }
    }
    Ok(settings)
}

pub struct TenantConfigManager {
    config: TenantManagerConfig,
    tenants: RwLock<HashMap<String, TenantRecord>>,
    changes: broadcast::Sender<ConfigurationChange>,
}

impl TenantConfigManager {
    /// Create a manager holding only the `default` tenant at version 1.
    pub fn new(config: TenantManagerConfig) -> Arc<Self> {
        let now = Utc::now();
        let default = TenantConfiguration {
            tenant_id: DEFAULT_TENANT.to_string(),
            enabled: true,
            settings: TenantSettings::default(),
            metadata: ConfigurationMetadata {
                created_at: now,
                updated_at: now,
                updated_by: "system".to_string(),
                version: 1,
                environment: config.environment.clone(),
            },
        };
        let mut tenants = HashMap::new();
        tenants.insert(
            DEFAULT_TENANT.to_string(),
            TenantRecord {
                current: default,
                history: VecDeque::new(),
            },
        );
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Arc::new(Self {
            config,
            tenants: RwLock::new(tenants),
            changes,
        })
    }

    /// Receive every configuration change from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigurationChange> {
        self.changes.subscribe()
    }

    /// Replace the current configuration, recording history and broadcasting.
    ///
    /// Callers hold the write lock; the version is computed here.
    fn commit(
        &self,
        tenants: &mut HashMap<String, TenantRecord>,
        tenant_id: &str,
        enabled: bool,
        settings: TenantSettings,
        updated_by: &str,
        kind: ChangeKind,
    ) -> TenantConfiguration {
        let now = Utc::now();
        let configuration = match tenants.get_mut(tenant_id) {
            Some(record) => {
                let configuration = TenantConfiguration {
                    tenant_id: tenant_id.to_string(),
                    enabled,
                    settings,
                    metadata: ConfigurationMetadata {
                        created_at: record.current.metadata.created_at,
                        updated_at: now,
                        updated_by: updated_by.to_string(),
                        version: record.current.metadata.version + 1,
                        environment: self.config.environment.clone(),
                    },
                };
                let previous = std::mem::replace(&mut record.current, configuration.clone());
                record.history.push_front(previous);
                record.history.truncate(self.config.max_history);
                configuration
            }
            None => {
                let configuration = TenantConfiguration {
                    tenant_id: tenant_id.to_string(),
                    enabled,
                    settings,
                    metadata: ConfigurationMetadata {
                        created_at: now,
                        updated_at: now,
                        updated_by: updated_by.to_string(),
                        version: 1,
                        environment: self.config.environment.clone(),
                    },
                };
                tenants.insert(
                    tenant_id.to_string(),
                    TenantRecord {
                        current: configuration.clone(),
                        history: VecDeque::new(),
                    },
                );
                configuration
            }
        };

        info!(
            tenant_id = %tenant_id,
            version = configuration.metadata.version,
            updated_by = %updated_by,
            change = ?kind,
            "Tenant configuration applied"
        );
        // No subscribers is fine.
        let _ = self.changes.send(ConfigurationChange {
            kind,
            configuration: configuration.clone(),
        });
        configuration
    }

    // ── Writes ──────────────────────────────────────────────────────

    /// Merge a partial settings patch onto the tenant's current settings
    /// (or defaults), validate, and store as a new version.
    pub async fn set_configuration(
        &self,
        tenant_id: &str,
        patch: &Value,
        updated_by: &str,
    ) -> Result<ConfigurationUpdate, ConfigurationError> {
        if tenant_id.trim().is_empty() {
            return Err(ConfigurationError::Validation(vec![ValidationIssue::new(
                "tenant_id",
                "tenant id must not be empty",
            )]));
        }

        let mut tenants = self.tenants.write().await;
        let (base, enabled) = match tenants.get(tenant_id) {
            Some(record) => (record.current.settings.clone(), record.current.enabled),
            None => (TenantSettings::default(), true),
        };
        let settings = merge_settings(&base, patch)?;

        let report = validate_settings(&settings);
        if !report.is_valid() {
            warn!(
                tenant_id = %tenant_id,
                errors = report.errors.len(),
                "Rejected tenant configuration"
            );
            return Err(ConfigurationError::Validation(report.errors));
        }
        for warning in &report.warnings {
            warn!(tenant_id = %tenant_id, warning = %warning, "Tenant configuration warning");
        }

        let configuration = self.commit(
            &mut tenants,
            tenant_id,
            enabled,
            settings,
            updated_by,
            ChangeKind::Updated,
        );
        Ok(ConfigurationUpdate {
            configuration,
            warnings: report.warnings,
        })
    }

    /// Flip the enabled flag as a new version.
    pub async fn set_tenant_enabled(
        &self,
        tenant_id: &str,
        enabled: bool,
        updated_by: &str,
    ) -> Result<TenantConfiguration, ConfigurationError> {
        let mut tenants = self.tenants.write().await;
        let settings = tenants
            .get(tenant_id)
            .map(|r| r.current.settings.clone())
            .unwrap_or_default();
        let kind = if enabled {
            ChangeKind::Enabled
        } else {
            ChangeKind::Disabled
        };
        Ok(self.commit(&mut tenants, tenant_id, enabled, settings, updated_by, kind))
    }

    /// Re-apply an earlier version's settings as a new version.
    pub async fn rollback_configuration(
        &self,
        tenant_id: &str,
        version: u64,
        updated_by: &str,
    ) -> Result<TenantConfiguration, ConfigurationError> {
        let mut tenants = self.tenants.write().await;
        let record = tenants
            .get(tenant_id)
            .ok_or_else(|| ConfigurationError::TenantNotFound {
                tenant_id: tenant_id.to_string(),
            })?;
        let target = std::iter::once(&record.current)
            .chain(record.history.iter())
            .find(|c| c.metadata.version == version)
            .ok_or_else(|| ConfigurationError::VersionNotFound {
                tenant_id: tenant_id.to_string(),
                version,
            })?;
        let settings = target.settings.clone();
        let enabled = record.current.enabled;

        let report = validate_settings(&settings);
        if !report.is_valid() {
            return Err(ConfigurationError::Validation(report.errors));
        }

        Ok(self.commit(
            &mut tenants,
            tenant_id,
            enabled,
            settings,
            updated_by,
            ChangeKind::RolledBack {
                from_version: version,
            },
        ))
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub async fn get_configuration(&self, tenant_id: &str) -> Option<TenantConfiguration> {
        self.tenants
            .read()
            .await
            .get(tenant_id)
            .map(|r| r.current.clone())
    }

    /// The tenant's configuration, or the `default` tenant's.
    pub async fn effective_configuration(&self, tenant_id: &str) -> Option<TenantConfiguration> {
        let tenants = self.tenants.read().await;
        tenants
            .get(tenant_id)
            .or_else(|| tenants.get(DEFAULT_TENANT))
            .map(|r| r.current.clone())
    }

    /// All current configurations, sorted by tenant id.
    pub async fn get_all_configurations(&self) -> Vec<TenantConfiguration> {
        let tenants = self.tenants.read().await;
        let mut all: Vec<TenantConfiguration> =
            tenants.values().map(|r| r.current.clone()).collect();
        all.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        all
    }

    /// Prior versions, most recent first.
    pub async fn get_configuration_history(
        &self,
        tenant_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<TenantConfiguration>, ConfigurationError> {
        let tenants = self.tenants.read().await;
        let record = tenants
            .get(tenant_id)
            .ok_or_else(|| ConfigurationError::TenantNotFound {
                tenant_id: tenant_id.to_string(),
            })?;
        Ok(record
            .history
            .iter()
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    // ── Export / import ─────────────────────────────────────────────

    /// Serialize one tenant (or all) to JSON. Webhook secrets are omitted.
    pub async fn export_configuration(
        &self,
        tenant_id: Option<&str>,
    ) -> Result<String, ConfigurationError> {
        let tenants = match tenant_id {
            Some(id) => vec![self.get_configuration(id).await.ok_or_else(|| {
                ConfigurationError::TenantNotFound {
                    tenant_id: id.to_string(),
                }
            })?],
            None => self.get_all_configurations().await,
        };
        let export = ConfigurationExport {
            exported_at: Utc::now(),
            environment: self.config.environment.clone(),
            tenants,
        };
        Ok(serde_json::to_string_pretty(&export)?)
    }

    /// Import an export document. Each tenant is validated independently;
    /// failures are reported without aborting the rest. Imported entries
    /// become new versions; their stored version numbers are ignored.
    pub async fn import_configuration(
        &self,
        json: &str,
        updated_by: &str,
        overwrite: bool,
    ) -> Result<ImportReport, ConfigurationError> {
        let document: Value = serde_json::from_str(json)?;
        let entries = document
            .get("tenants")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| {
                ConfigurationError::Validation(vec![ValidationIssue::new(
                    "tenants",
                    "import document must contain a tenants array",
                )])
            })?;

        let mut report = ImportReport::default();
        let mut tenants = self.tenants.write().await;
        for entry in entries {
            let label = entry
                .get("tenant_id")
                .and_then(Value::as_str)
                .unwrap_or("<unknown>")
                .to_string();

            let configuration: TenantConfiguration = match serde_json::from_value(entry) {
                Ok(c) => c,
                Err(e) => {
                    report.failed.push(ImportFailure {
                        tenant_id: label,
                        errors: vec![e.to_string()],
                    });
                    continue;
                }
            };
            if configuration.tenant_id.trim().is_empty() {
                report.failed.push(ImportFailure {
                    tenant_id: label,
                    errors: vec!["tenant id must not be empty".to_string()],
                });
                continue;
            }
            if tenants.contains_key(&configuration.tenant_id) && !overwrite {
                report.skipped.push(configuration.tenant_id);
                continue;
            }
            let validation = validate_settings(&configuration.settings);
            if !validation.is_valid() {
                report.failed.push(ImportFailure {
                    tenant_id: configuration.tenant_id,
                    errors: validation.errors.iter().map(ToString::to_string).collect(),
                });
                continue;
            }

            self.commit(
                &mut tenants,
                &configuration.tenant_id,
                configuration.enabled,
                configuration.settings,
                updated_by,
                ChangeKind::Imported,
            );
            report.imported.push(configuration.tenant_id);
        }

        info!(
            imported = report.imported.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "Configuration import complete"
        );
        Ok(report)
    }
}

#[async_trait]
impl HealthProbe for TenantConfigManager {
    fn component(&self) -> &'static str {
        "tenant_config"
    }

    async fn check(&self) -> ComponentHealth {
        let tenants = self.tenants.read().await;
        if tenants.is_empty() {
            ComponentHealth::unhealthy(self.component(), "no tenant configurations")
        } else if !tenants.values().any(|r| r.current.enabled) {
            ComponentHealth::unhealthy(self.component(), "no enabled tenants")
        } else {
            ComponentHealth::healthy(self.component())
        }
    }

    async fn recover(&self) -> RecoveryAction {
        RecoveryAction::ManualInterventionRequired {
            reason: "tenant configuration must be fixed by an operator".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthState;
    use serde_json::json;

    fn manager() -> Arc<TenantConfigManager> {
        TenantConfigManager::new(TenantManagerConfig::default())
    }

    #[tokio::test]
    async fn default_tenant_always_exists() {
        let m = manager();
        let default = m.get_configuration(DEFAULT_TENANT).await.unwrap();
        assert_eq!(default.version(), 1);
        assert!(default.enabled);

        let effective = m.effective_configuration("nobody").await.unwrap();
        assert_eq!(effective.tenant_id, DEFAULT_TENANT);
    }

    #[tokio::test]
    async fn zero_rpm_is_rejected_without_state_change() {
        let m = manager();
        m.set_configuration("t1", &json!({}), "admin").await.unwrap();

        let err = m
            .set_configuration(
                "t1",
                &json!({"rate_limiting": {"requests_per_minute": 0}}),
                "admin",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::Validation(_)));
        assert_eq!(m.get_configuration("t1").await.unwrap().version(), 1);
    }

    #[tokio::test]
    async fn valid_update_bumps_version_by_one() {
        let m = manager();
        m.set_configuration("t1", &json!({}), "admin").await.unwrap();
        let before = m.get_configuration("t1").await.unwrap().version();

        let update = m
            .set_configuration(
                "t1",
                &json!({"rate_limiting": {"requests_per_minute": 500}}),
                "admin",
            )
            .await
            .unwrap();
        assert_eq!(update.configuration.version(), before + 1);
        assert_eq!(update.configuration.settings.rate_limiting.requests_per_minute, 500);
        // Untouched fields keep their values.
        assert_eq!(update.configuration.settings.rate_limiting.burst_limit, 1000);
    }

    #[tokio::test]
    async fn first_write_creates_version_one() {
        let m = manager();
        assert!(m.get_configuration("fresh").await.is_none());
        let update = m
            .set_configuration("fresh", &json!({"caching": {"enabled": false}}), "ops")
            .await
            .unwrap();
        assert_eq!(update.configuration.version(), 1);
        assert!(!update.configuration.settings.caching.enabled);
        assert_eq!(update.configuration.metadata.updated_by, "ops");
    }

    #[tokio::test]
    async fn rollback_reapplies_old_settings_as_new_version() {
        let m = manager();
        let v1 = m.set_configuration("t1", &json!({}), "admin").await.unwrap();
        assert_eq!(v1.configuration.version(), 1);

        let v2 = m
            .set_configuration(
                "t1",
                &json!({"rate_limiting": {"requests_per_minute": 5000}}),
                "admin",
            )
            .await
            .unwrap();
        assert_eq!(v2.configuration.version(), 2);
        assert_eq!(v2.warnings.len(), 1);

        let v3 = m.rollback_configuration("t1", 1, "admin").await.unwrap();
        assert_eq!(v3.version(), 3);
        assert_eq!(v3.settings, v1.configuration.settings);

        let history = m.get_configuration_history("t1", None).await.unwrap();
        assert_eq!(
            history.iter().map(|c| c.version()).collect::<Vec<_>>(),
            vec![2, 1]
        );
    }

    #[tokio::test]
    async fn rollback_to_unknown_version_fails() {
        let m = manager();
        m.set_configuration("t1", &json!({}), "admin").await.unwrap();
        let err = m.rollback_configuration("t1", 7, "admin").await.unwrap_err();
        assert!(matches!(err, ConfigurationError::VersionNotFound { version: 7, .. }));
        let err = m.rollback_configuration("ghost", 1, "admin").await.unwrap_err();
        assert!(matches!(err, ConfigurationError::TenantNotFound { .. }));
    }

    #[tokio::test]
    async fn history_is_bounded_and_limited() {
        let m = TenantConfigManager::new(TenantManagerConfig {
            max_history: 3,
            ..TenantManagerConfig::default()
        });
        for rpm in 1..=6u32 {
            m.set_configuration(
                "t1",
                &json!({"rate_limiting": {"requests_per_minute": rpm * 100}}),
                "admin",
            )
            .await
            .unwrap();
        }
        let history = m.get_configuration_history("t1", None).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].version(), 5);
        assert_eq!(m.get_configuration_history("t1", Some(1)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn enable_toggle_is_versioned_and_broadcast() {
        let m = manager();
        let mut changes = m.subscribe();
        m.set_configuration("t1", &json!({}), "admin").await.unwrap();
        let disabled = m.set_tenant_enabled("t1", false, "admin").await.unwrap();
        assert!(!disabled.enabled);
        assert_eq!(disabled.version(), 2);

        assert_eq!(changes.recv().await.unwrap().kind, ChangeKind::Updated);
        let change = changes.recv().await.unwrap();
        assert_eq!(change.kind, ChangeKind::Disabled);
        assert_eq!(change.configuration.tenant_id, "t1");
    }

    #[tokio::test]
    async fn webhook_secret_survives_unrelated_updates() {
        use secrecy::ExposeSecret;
        let m = manager();
        m.set_configuration(
            "t1",
            &json!({"webhook": {"url": "https://hooks.example.com/a", "secret": "k"}}),
            "admin",
        )
        .await
        .unwrap();
        let update = m
            .set_configuration("t1", &json!({"quality": {"min_confidence": 0.7}}), "admin")
            .await
            .unwrap();
        let webhook = update.configuration.settings.webhook.unwrap();
        assert_eq!(webhook.secret.unwrap().expose_secret(), "k");

        let removed = m
            .set_configuration("t1", &json!({"webhook": null}), "admin")
            .await
            .unwrap();
        assert!(removed.configuration.settings.webhook.is_none());
    }

    #[tokio::test]
    async fn export_import_round_trip_reports_per_tenant() {
        let source = manager();
        source
            .set_configuration("t1", &json!({"rate_limiting": {"requests_per_minute": 300}}), "admin")
            .await
            .unwrap();
        let exported = source.export_configuration(None).await.unwrap();

        // One out-of-range entry and one malformed entry.
        let mut doc: Value = serde_json::from_str(&exported).unwrap();
        let tenants = doc["tenants"].as_array_mut().unwrap();
        let mut bad = tenants[0].clone();
        bad["tenant_id"] = json!("bad");
        bad["settings"]["caching"]["ttl_seconds"] = json!(5);
        tenants.push(bad);
        tenants.push(json!({"tenant_id": "broken", "enabled": "yes"}));

        let target = manager();
        let report = target
            .import_configuration(&doc.to_string(), "restore", false)
            .await
            .unwrap();
        assert_eq!(report.imported, vec!["t1".to_string()]);
        assert_eq!(report.skipped, vec![DEFAULT_TENANT.to_string()]);
        assert_eq!(report.failed.len(), 2);
        assert!(report.failed.iter().any(|f| f.tenant_id == "bad"));
        assert!(report.failed.iter().any(|f| f.tenant_id == "broken"));

        let t1 = target.get_configuration("t1").await.unwrap();
        assert_eq!(t1.settings.rate_limiting.requests_per_minute, 300);
        assert_eq!(t1.metadata.updated_by, "restore");
    }

    #[tokio::test]
    async fn import_rejects_garbage_document() {
        let m = manager();
        assert!(matches!(
            m.import_configuration("not json", "x", true).await,
            Err(ConfigurationError::Parse(_))
        ));
        assert!(matches!(
            m.import_configuration("{}", "x", true).await,
            Err(ConfigurationError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn health_requires_an_enabled_tenant() {
        let m = manager();
        assert_eq!(m.check().await.state, HealthState::Healthy);
        m.set_tenant_enabled(DEFAULT_TENANT, false, "admin").await.unwrap();
        assert_eq!(m.check().await.state, HealthState::Unhealthy);
    }
}
