use crate::changes::{BranchSelection, ChangeFilter, ImportancePolicy};
use crate::time_window::{TimeWindow, TimeWindowError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_REASON: &str = "The {classname} scheduler named '{name}' triggered this build";

/// Change-selection policy of a timed scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    #[default]
    SingleBranch,
    AnyBranch,
}

impl SchedulerKind {
    /// Class name used for the scheduler's stable identity and in reasons.
    pub fn class_name(&self) -> &'static str {
        match self {
            SchedulerKind::SingleBranch => "TimedSingleBranchScheduler",
            SchedulerKind::AnyBranch => "TimedAnyBranchScheduler",
        }
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.class_name())
    }
}

#[derive(Debug, Error)]
pub enum SchedulerConfigError {
    #[error("Scheduler name must not be empty")]
    EmptyName,

    #[error("Scheduler '{scheduler}': invalid time window: {source}")]
    InvalidWindow {
        scheduler: String,
        #[source]
        source: TimeWindowError,
    },

    #[error("Scheduler '{0}': 'branch' is mandatory unless change_filter is provided")]
    MissingBranch(String),

    #[error("Scheduler '{0}': 'branches' is not allowed for a single-branch scheduler")]
    BranchesNotAllowed(String),

    #[error("Scheduler '{0}': set either 'branch' or 'default_branch', not both")]
    ConflictingBranch(String),

    #[error("Scheduler '{0}': change_filter cannot be combined with branch or categories")]
    ConflictingFilter(String),

    #[error("Scheduler '{scheduler}': invalid importance pattern: {source}")]
    InvalidImportancePattern {
        scheduler: String,
        #[source]
        source: regex::Error,
    },

    #[error("Scheduler '{0}': at least one builder name is required")]
    NoBuilders(String),
}

/// Explicit change filter as written in the configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChangeFilterDefinition {
    pub branch: Option<String>,
    /// Select the repository's default branch (a change without a branch name).
    pub default_branch: bool,
    pub branches: Option<Vec<String>>,
    pub categories: Option<Vec<String>>,
    pub repository: Option<String>,
}

/// A `[[schedulers]]` entry of the configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SchedulerDefinition {
    pub name: String,
    pub kind: SchedulerKind,
    /// `[start, end]`; defaults to the whole day.
    pub time_range: Option<[String; 2]>,
    pub tree_stable_timer: Option<u64>,
    pub builder_names: Vec<String>,
    pub branch: Option<String>,
    pub default_branch: bool,
    pub branches: Option<Vec<String>>,
    pub categories: Option<Vec<String>>,
    pub change_filter: Option<ChangeFilterDefinition>,
    /// Regexes over changed file paths.
    pub file_is_important: Option<Vec<String>>,
    pub only_important: bool,
    pub collapse_requests: bool,
    pub reason: Option<String>,
    pub properties: BTreeMap<String, String>,
}

/// Validated configuration of one timed scheduler.
#[derive(Debug, Clone)]
pub struct TimedSchedulerSettings {
    pub name: String,
    pub kind: SchedulerKind,
    pub window: TimeWindow,
    /// Accepted for configuration compatibility; the window alone decides when to fire.
    pub tree_stable_timer: Option<Duration>,
    pub filter: ChangeFilter,
    pub importance: ImportancePolicy,
    pub only_important: bool,
    pub collapse_requests: bool,
    /// Reason with placeholders already rendered.
    pub reason: String,
    pub builder_names: Vec<String>,
    pub properties: BTreeMap<String, String>,
}

impl TimedSchedulerSettings {
    /// Settings with an all-day window, no filtering and no importance patterns.
    pub fn new(name: &str, kind: SchedulerKind, builder_names: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            window: TimeWindow::all_day(),
            tree_stable_timer: None,
            filter: ChangeFilter::any(),
            importance: ImportancePolicy::default(),
            only_important: false,
            collapse_requests: false,
            reason: render_reason(DEFAULT_REASON, name, kind),
            builder_names,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_window(mut self, window: TimeWindow) -> Self {
        self.window = window;
        self
    }

    pub fn with_filter(mut self, filter: ChangeFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_importance(mut self, importance: ImportancePolicy) -> Self {
        self.importance = importance;
        self
    }

    pub fn with_collapse_requests(mut self, collapse: bool) -> Self {
        self.collapse_requests = collapse;
        self
    }

    pub fn with_only_important(mut self, only_important: bool) -> Self {
        self.only_important = only_important;
        self
    }

    pub fn from_definition(def: &SchedulerDefinition) -> Result<Self, SchedulerConfigError> {
        let name = def.name.trim();
        if name.is_empty() {
            return Err(SchedulerConfigError::EmptyName);
        }
        if def.builder_names.is_empty() {
            return Err(SchedulerConfigError::NoBuilders(name.to_string()));
        }

        let window = match &def.time_range {
            Some([start, end]) => TimeWindow::parse(start, end).map_err(|source| {
                SchedulerConfigError::InvalidWindow {
                    scheduler: name.to_string(),
                    source,
                }
            })?,
            None => TimeWindow::all_day(),
        };

        let filter = build_filter(name, def)?;

        let importance = match &def.file_is_important {
            Some(patterns) => ImportancePolicy::compile(patterns).map_err(|source| {
                SchedulerConfigError::InvalidImportancePattern {
                    scheduler: name.to_string(),
                    source,
                }
            })?,
            None => ImportancePolicy::default(),
        };

        let template = def.reason.as_deref().unwrap_or(DEFAULT_REASON);

        Ok(Self {
            name: name.to_string(),
            kind: def.kind,
            window,
            tree_stable_timer: def.tree_stable_timer.map(Duration::from_secs),
            filter,
            importance,
            only_important: def.only_important,
            collapse_requests: def.collapse_requests,
            reason: render_reason(template, name, def.kind),
            builder_names: def.builder_names.clone(),
            properties: def.properties.clone(),
        })
    }
}

fn branch_selection(
    scheduler: &str,
    branch: &Option<String>,
    default_branch: bool,
    branches: &Option<Vec<String>>,
) -> Result<BranchSelection, SchedulerConfigError> {
    match (branch, default_branch, branches) {
        (Some(_), true, _) => Err(SchedulerConfigError::ConflictingBranch(scheduler.to_string())),
        (Some(branch), false, _) => Ok(BranchSelection::Exact(Some(branch.clone()))),
        (None, true, _) => Ok(BranchSelection::Exact(None)),
        (None, false, Some(list)) => Ok(BranchSelection::OneOf(list.clone())),
        (None, false, None) => Ok(BranchSelection::Any),
    }
}

fn build_filter(
    scheduler: &str,
    def: &SchedulerDefinition,
) -> Result<ChangeFilter, SchedulerConfigError> {
    let has_branch = def.branch.is_some() || def.default_branch;

    if def.kind == SchedulerKind::SingleBranch {
        if !has_branch && def.change_filter.is_none() {
            return Err(SchedulerConfigError::MissingBranch(scheduler.to_string()));
        }
        if def.branches.is_some() {
            return Err(SchedulerConfigError::BranchesNotAllowed(scheduler.to_string()));
        }
    }

    if let Some(explicit) = &def.change_filter {
        if has_branch || def.branches.is_some() || def.categories.is_some() {
            return Err(SchedulerConfigError::ConflictingFilter(scheduler.to_string()));
        }
        return Ok(ChangeFilter {
            branch: branch_selection(
                scheduler,
                &explicit.branch,
                explicit.default_branch,
                &explicit.branches,
            )?,
            categories: explicit.categories.clone(),
            repository: explicit.repository.clone(),
        });
    }

    Ok(ChangeFilter {
        branch: branch_selection(scheduler, &def.branch, def.default_branch, &def.branches)?,
        categories: def.categories.clone(),
        repository: None,
    })
}

/// Substitute `{name}` and `{classname}` in a reason template.
pub fn render_reason(template: &str, name: &str, kind: SchedulerKind) -> String {
    template
        .replace("{name}", name)
        .replace("{classname}", kind.class_name())
}
