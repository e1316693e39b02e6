//! Runtime settings.
//!
//! A [`Settings`] value is built once at process entry (defaults, then an
//! optional YAML file, then environment variables and flags) and handed to
//! the services that need it.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;
use crate::validation::{
    validate_scope, IssueCode, IssueContext, ValidationIssue, ValidationReport,
};

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Authentication methods the catalog's auth server offers.
pub const AUTH_TYPES: [&str; 7] = ["x509", "x509_proxy", "userpass", "gss", "ssh", "saml", "oidc"];

/// Everything the crate can be configured with.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub catalog: CatalogSettings,
    pub workflow: WorkflowSettings,
}

/// How to reach the catalog service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogSettings {
    pub rucio_host: String,
    pub auth_host: String,
    pub auth_type: String,
    pub account: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    pub request_timeout_secs: u64,
    /// Extra attempts after a transport failure.
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            rucio_host: "https://voatlasrucio-server-prod.cern.ch".into(),
            auth_host: "https://voatlasrucio-auth-prod.cern.ch".into(),
            auth_type: "x509".into(),
            account: "pilot".into(),
            auth_token: None,
            request_timeout_secs: 600,
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

/// Defaults applied by the workflow and its services.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSettings {
    pub default_rse: String,
    pub default_scope: String,
    pub default_lifetime_days: u32,
    /// Replicas per registration call.
    pub batch_size: usize,
    /// Files per dataset attachment call.
    pub attach_batch_size: usize,
    /// Lifetime given to a dataset left behind by a failed run.
    pub cleanup_grace_hours: u32,
    pub log_level: String,
    pub detailed_logging: bool,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            default_rse: "ATLAS_DISK".into(),
            default_scope: "user.pilot".into(),
            default_lifetime_days: 30,
            batch_size: 100,
            attach_batch_size: 1000,
            cleanup_grace_hours: 1,
            log_level: "info".into(),
            detailed_logging: false,
        }
    }
}

/// Values that take precedence over the file, usually from flags or the
/// environment. `None` leaves the setting alone.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub rucio_host: Option<String>,
    pub auth_host: Option<String>,
    pub auth_type: Option<String>,
    pub account: Option<String>,
    pub auth_token: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub default_rse: Option<String>,
    pub default_scope: Option<String>,
    pub batch_size: Option<usize>,
    pub detailed_logging: Option<bool>,
}

impl Settings {
    /// Loads settings from an optional YAML file on top of the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, WorkflowError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text).map_err(|source| WorkflowError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
    }

    /// Applies overrides in place.
    pub fn apply(&mut self, overrides: Overrides) {
        let catalog = &mut self.catalog;
        set(&mut catalog.rucio_host, overrides.rucio_host);
        set(&mut catalog.auth_host, overrides.auth_host);
        set(&mut catalog.auth_type, overrides.auth_type);
        set(&mut catalog.account, overrides.account);
        set(&mut catalog.request_timeout_secs, overrides.request_timeout_secs);
        set(&mut catalog.max_retries, overrides.max_retries);
        if overrides.auth_token.is_some() {
            catalog.auth_token = overrides.auth_token;
        }

        let workflow = &mut self.workflow;
        set(&mut workflow.default_rse, overrides.default_rse);
        set(&mut workflow.default_scope, overrides.default_scope);
        set(&mut workflow.batch_size, overrides.batch_size);
        set(&mut workflow.detailed_logging, overrides.detailed_logging);
    }

    /// The log filter directive these settings ask for.
    pub fn log_directive(&self) -> &str {
        if self.workflow.detailed_logging {
            "debug"
        } else {
            &self.workflow.log_level
        }
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

/// Checks settings for values that would make every run fail.
pub fn validate_settings(settings: &Settings) -> ValidationReport {
    let mut report = ValidationReport::new();
    let catalog = &settings.catalog;
    let workflow = &settings.workflow;

    let catalog_ctx = |field| IssueContext::Catalog { field };
    let workflow_ctx = |field| IssueContext::Workflow { field };

    if catalog.rucio_host.trim().is_empty() {
        report.add(ValidationIssue::error(
            IssueCode::MissingHost,
            "catalog server URL is empty",
            catalog_ctx("rucio_host"),
        ));
    }
    if catalog.auth_host.trim().is_empty() {
        report.add(ValidationIssue::error(
            IssueCode::MissingHost,
            "authentication server URL is empty",
            catalog_ctx("auth_host"),
        ));
    }
    if !AUTH_TYPES.contains(&catalog.auth_type.as_str()) {
        report.add(ValidationIssue::error(
            IssueCode::UnknownAuthType,
            format!("unknown auth type '{}'", catalog.auth_type),
            catalog_ctx("auth_type"),
        ));
    }
    if catalog.account.trim().is_empty() {
        report.add(ValidationIssue::error(
            IssueCode::MissingAccount,
            "no catalog account configured",
            catalog_ctx("account"),
        ));
    }
    if catalog.auth_token.as_deref().map_or(true, str::is_empty) {
        report.add(ValidationIssue::warning(
            IssueCode::MissingAuthToken,
            "no auth token configured; requests will be rejected by a real server",
            catalog_ctx("auth_token"),
        ));
    }
    if catalog.request_timeout_secs == 0 {
        report.add(ValidationIssue::error(
            IssueCode::NonPositiveTimeout,
            "request timeout must be positive",
            catalog_ctx("request_timeout_secs"),
        ));
    }

    if workflow.batch_size == 0 {
        report.add(ValidationIssue::error(
            IssueCode::NonPositiveBatchSize,
            "batch size must be positive",
            workflow_ctx("batch_size"),
        ));
    }
    if workflow.attach_batch_size == 0 {
        report.add(ValidationIssue::error(
            IssueCode::NonPositiveBatchSize,
            "attach batch size must be positive",
            workflow_ctx("attach_batch_size"),
        ));
    }
    if let Err(err) = validate_scope(&workflow.default_scope) {
        report.add(ValidationIssue::error(
            IssueCode::InvalidDefaultScope,
            err.to_string(),
            workflow_ctx("default_scope"),
        ));
    }
    if workflow.default_rse.trim().is_empty() {
        report.add(ValidationIssue::error(
            IssueCode::MissingDefaultRse,
            "no default RSE configured",
            workflow_ctx("default_rse"),
        ));
    }
    if !LOG_LEVELS.contains(&workflow.log_level.to_ascii_lowercase().as_str()) {
        report.add(ValidationIssue::warning(
            IssueCode::UnknownLogLevel,
            format!("unknown log level '{}'", workflow.log_level),
            workflow_ctx("log_level"),
        ));
    }

    report
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let catalog = &self.catalog;
        let workflow = &self.workflow;
        writeln!(f, "Catalog:")?;
        writeln!(f, "  rucio_host:           {}", catalog.rucio_host)?;
        writeln!(f, "  auth_host:            {}", catalog.auth_host)?;
        writeln!(f, "  auth_type:            {}", catalog.auth_type)?;
        writeln!(f, "  account:              {}", catalog.account)?;
        writeln!(
            f,
            "  auth_token:           {}",
            if catalog.auth_token.is_some() { "<set>" } else { "<unset>" }
        )?;
        writeln!(f, "  request_timeout_secs: {}", catalog.request_timeout_secs)?;
        writeln!(f, "  max_retries:          {}", catalog.max_retries)?;
        writeln!(f, "Workflow:")?;
        writeln!(f, "  default_rse:          {}", workflow.default_rse)?;
        writeln!(f, "  default_scope:        {}", workflow.default_scope)?;
        writeln!(f, "  default_lifetime:     {} days", workflow.default_lifetime_days)?;
        writeln!(f, "  batch_size:           {}", workflow.batch_size)?;
        writeln!(f, "  attach_batch_size:    {}", workflow.attach_batch_size)?;
        writeln!(f, "  cleanup_grace_hours:  {}", workflow.cleanup_grace_hours)?;
        write!(f, "  log_level:            {}", self.log_directive())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_production_service() {
        let settings = Settings::default();
        assert_eq!(settings.catalog.account, "pilot");
        assert_eq!(settings.catalog.request_timeout_secs, 600);
        assert_eq!(settings.workflow.default_rse, "ATLAS_DISK");
        assert_eq!(settings.workflow.batch_size, 100);
        assert_eq!(settings.workflow.attach_batch_size, 1000);
    }

    #[test]
    fn yaml_overrides_only_named_fields() {
        let settings = Settings::from_yaml(
            "catalog:\n  account: alice\nworkflow:\n  batch_size: 10\n",
        )
        .unwrap();
        assert_eq!(settings.catalog.account, "alice");
        assert_eq!(settings.catalog.auth_type, "x509");
        assert_eq!(settings.workflow.batch_size, 10);
        assert_eq!(settings.workflow.default_scope, "user.pilot");
    }

    #[test]
    fn empty_yaml_is_default() {
        assert_eq!(Settings::from_yaml("  \n").unwrap(), Settings::default());
    }

    #[test]
    fn overrides_win() {
        let mut settings = Settings::default();
        settings.apply(Overrides {
            account: Some("bob".into()),
            batch_size: Some(7),
            detailed_logging: Some(true),
            ..Overrides::default()
        });
        assert_eq!(settings.catalog.account, "bob");
        assert_eq!(settings.workflow.batch_size, 7);
        assert_eq!(settings.log_directive(), "debug");
        assert_eq!(settings.catalog.rucio_host, CatalogSettings::default().rucio_host);
    }

    #[test]
    fn default_settings_only_warn_about_token() {
        let report = validate_settings(&Settings::default());
        assert!(report.is_ok());
        assert_eq!(report.warning_count(), 1);
        assert_eq!(report.issues[0].code, IssueCode::MissingAuthToken);
    }

    #[test]
    fn broken_settings_collect_every_error() {
        let mut settings = Settings::default();
        settings.catalog.account.clear();
        settings.catalog.request_timeout_secs = 0;
        settings.workflow.batch_size = 0;
        settings.workflow.default_scope = "bad:scope".into();

        let report = validate_settings(&settings);
        assert_eq!(report.error_count(), 4);
        let codes: Vec<_> = report.issues.iter().map(|issue| issue.code).collect();
        assert!(codes.contains(&IssueCode::MissingAccount));
        assert!(codes.contains(&IssueCode::NonPositiveTimeout));
        assert!(codes.contains(&IssueCode::NonPositiveBatchSize));
        assert!(codes.contains(&IssueCode::InvalidDefaultScope));
    }

    #[test]
    fn unknown_auth_type_is_an_error() {
        let mut settings = Settings::default();
        settings.catalog.auth_type = "kerberos".into();

        let report = validate_settings(&settings);
        assert!(!report.is_ok());
        assert_eq!(report.error_count(), 1);
        assert!(report
            .issues
            .iter()
            .any(|issue| issue.code == IssueCode::UnknownAuthType));
    }
}
