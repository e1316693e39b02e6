//! Validation report types for structured error reporting.
//!
//! Used when a whole settings value is checked at once, so every problem
//! can be shown together instead of stopping at the first one.

use serde::Serialize;
use std::fmt;

/// The result of validating a configuration.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ValidationReport {
    /// All issues found during validation.
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    /// Creates a new empty report.
    pub fn new() -> Self {
        Self { issues: Vec::new() }
    }

    /// Adds an issue to the report.
    pub fn add(&mut self, issue: ValidationIssue) {
        self.issues.push(issue);
    }

    /// Returns the number of errors in the report.
    pub fn error_count(&self) -> usize {
        self.issues
            .iter()
            .filter(|i| i.severity == Severity::Error)
            .count()
    }

    /// Returns the number of warnings in the report.
    pub fn warning_count(&self) -> usize {
        self.issues
            .iter()
            .filter(|i| i.severity == Severity::Warning)
            .count()
    }

    /// Returns true if there are no errors.
    pub fn is_ok(&self) -> bool {
        self.error_count() == 0
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.issues.is_empty() {
            return writeln!(f, "Configuration is valid: no issues found");
        }

        writeln!(
            f,
            "Configuration checked with {} error(s) and {} warning(s):",
            self.error_count(),
            self.warning_count()
        )?;
        writeln!(f)?;

        for issue in &self.issues {
            writeln!(f, "  {}", issue)?;
        }

        Ok(())
    }
}

/// A single validation issue (error or warning).
#[derive(Clone, Debug, Serialize)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub code: IssueCode,
    pub message: String,
    pub context: IssueContext,
}

impl ValidationIssue {
    pub fn new(
        severity: Severity,
        code: IssueCode,
        message: impl Into<String>,
        context: IssueContext,
    ) -> Self {
        Self {
            severity,
            code,
            message: message.into(),
            context,
        }
    }

    pub fn error(code: IssueCode, message: impl Into<String>, context: IssueContext) -> Self {
        Self::new(Severity::Error, code, message, context)
    }

    pub fn warning(code: IssueCode, message: impl Into<String>, context: IssueContext) -> Self {
        Self::new(Severity::Warning, code, message, context)
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let severity = match self.severity {
            Severity::Error => "ERROR",
            Severity::Warning => "WARN ",
        };
        write!(
            f,
            "[{}] {:?} in {}: {}",
            severity, self.code, self.context, self.message
        )
    }
}

/// The severity of a validation issue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Severity {
    /// Usable, but likely to cause trouble against a real catalog.
    Warning,
    /// The settings cannot be used.
    Error,
}

/// A stable code identifying the type of validation issue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum IssueCode {
    /// A required endpoint URL is empty.
    MissingHost,
    /// No catalog account is configured.
    MissingAccount,
    /// No auth token is configured.
    MissingAuthToken,
    /// A timeout is zero.
    NonPositiveTimeout,
    /// A batch size is zero.
    NonPositiveBatchSize,
    /// The default scope is not a legal scope.
    InvalidDefaultScope,
    /// The default RSE is empty.
    MissingDefaultRse,
    /// The log level is not recognised.
    UnknownLogLevel,
    /// The auth type is not one the auth server offers.
    UnknownAuthType,
}

/// Which settings section an issue belongs to.
#[derive(Clone, Debug, Serialize)]
pub enum IssueContext {
    /// Catalog connection settings.
    Catalog { field: &'static str },
    /// Workflow execution settings.
    Workflow { field: &'static str },
}

impl fmt::Display for IssueContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssueContext::Catalog { field } => write!(f, "catalog.{}", field),
            IssueContext::Workflow { field } => write!(f, "workflow.{}", field),
        }
    }
}
