//! Identity validation pipeline
//!
//! A [`Validator`] runs its stages in order. Each stage sees the identity, the
//! load context, and the report accumulated so far, and adds errors (fatal)
//! or warnings (annotations). Unknown callbacks are not checked here; invoking
//! one fails per call.

use std::path::{Path, PathBuf};

use goplug_plugin_api::Identity;

use crate::error::{PluginHostError, Result};
use crate::lifecycle::Mechanism;

/// What the validator knows about where the identity came from
#[derive(Debug, Clone, Default)]
pub struct ValidationContext {
    /// Directory relative source paths resolve against
    pub base_dir: Option<PathBuf>,
    /// Mechanism about to load the plugin, if any
    pub mechanism: Option<Mechanism>,
}

impl ValidationContext {
    pub fn new(base_dir: Option<&Path>, mechanism: Option<Mechanism>) -> Self {
        Self {
            base_dir: base_dir.map(Path::to_path_buf),
            mechanism,
        }
    }
}

/// Accumulated outcome of the pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Warnings on success, [`PluginHostError::Validation`] otherwise
    pub fn into_result(self, name: &str) -> Result<Vec<String>> {
        if self.errors.is_empty() {
            Ok(self.warnings)
        } else {
            Err(PluginHostError::Validation {
                name: name.to_string(),
                errors: self.errors,
            })
        }
    }
}

/// One step of the pipeline
pub trait ValidationStage: Send + Sync {
    fn name(&self) -> &'static str;

    fn check(&self, identity: &Identity, ctx: &ValidationContext, report: &mut ValidationReport);
}

/// Name, version, maintainers, description, repository
pub struct ShapeCheck;

impl ValidationStage for ShapeCheck {
    fn name(&self) -> &'static str {
        "shape"
    }

    fn check(&self, identity: &Identity, _ctx: &ValidationContext, report: &mut ValidationReport) {
        if identity.name.trim().is_empty() {
            report.error("name is empty");
        }
        if identity.version.is_empty() {
            report.error("version is empty");
        } else if let Err(e) = semver::Version::parse(&identity.version) {
            report.error(format!("version '{}' is not semver: {e}", identity.version));
        }
        if identity.maintainers.iter().all(|m| m.trim().is_empty()) {
            report.error("maintainers is empty");
        }
        if identity.description.trim().is_empty() {
            report.warn("description is missing");
        }
        if identity
            .repository
            .as_deref()
            .is_none_or(|r| r.trim().is_empty())
        {
            report.warn("repository is missing");
        }
    }
}

/// Every callback is named `Plugin.Function`; in-process callbacks must be bound
pub struct CallbackShapeCheck;

impl ValidationStage for CallbackShapeCheck {
    fn name(&self) -> &'static str {
        "callbacks"
    }

    fn check(&self, identity: &Identity, ctx: &ValidationContext, report: &mut ValidationReport) {
        for (kind, callback) in identity.callbacks.iter() {
            let well_formed = callback
                .name()
                .split_once('.')
                .is_some_and(|(plugin, func)| !plugin.is_empty() && !func.is_empty());
            if !well_formed {
                report.error(format!(
                    "{kind} callback '{}' is not of the form Plugin.Function",
                    callback.name()
                ));
            }
            if ctx.mechanism == Some(Mechanism::Native) && !callback.is_bound() {
                report.error(format!(
                    "{kind} callback '{}' has no function",
                    callback.name()
                ));
            }
        }
    }
}

/// Declared source must carry a semver version and, if local, exist on disk
pub struct SourceCheck;

impl ValidationStage for SourceCheck {
    fn name(&self) -> &'static str {
        "source"
    }

    fn check(&self, identity: &Identity, ctx: &ValidationContext, report: &mut ValidationReport) {
        let Some(source) = &identity.source else {
            report.warn("no source declared");
            return;
        };
        if let Err(e) = semver::Version::parse(&source.version) {
            report.error(format!(
                "source version '{}' is not semver: {e}",
                source.version
            ));
        }
        if source.local {
            let path = match &ctx.base_dir {
                Some(base) if source.path.is_relative() => base.join(&source.path),
                _ => source.path.clone(),
            };
            if !path.exists() {
                report.error(format!("local source {} does not exist", path.display()));
            }
        } else {
            report.warn(format!(
                "remote source {} is not fetched",
                source.path.display()
            ));
        }
    }
}

/// At least one capability, and the loading mechanism among them
pub struct CapabilityCheck;

impl ValidationStage for CapabilityCheck {
    fn name(&self) -> &'static str {
        "capabilities"
    }

    fn check(&self, identity: &Identity, ctx: &ValidationContext, report: &mut ValidationReport) {
        if !identity.types.any() {
            report.error("neither native nor rpc capability is set");
            return;
        }
        match ctx.mechanism {
            Some(Mechanism::Native) if !identity.types.native => {
                report.error("loaded in-process but does not declare native capability");
            }
            Some(Mechanism::Rpc) if !identity.types.rpc => {
                report.error("loaded over rpc but does not declare rpc capability");
            }
            _ => {}
        }
    }
}

/// Ordered list of stages
pub struct Validator {
    stages: Vec<Box<dyn ValidationStage>>,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

impl Validator {
    /// The built-in pipeline: shape, callbacks, source, capabilities
    pub fn new() -> Self {
        Self::empty()
            .with_stage(ShapeCheck)
            .with_stage(CallbackShapeCheck)
            .with_stage(SourceCheck)
            .with_stage(CapabilityCheck)
    }

    pub fn empty() -> Self {
        Self { stages: Vec::new() }
    }

    #[must_use]
    pub fn with_stage(mut self, stage: impl ValidationStage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn validate(&self, identity: &Identity, ctx: &ValidationContext) -> ValidationReport {
        let mut report = ValidationReport::default();
        for stage in &self.stages {
            stage.check(identity, ctx, &mut report);
        }
        report
    }
}
