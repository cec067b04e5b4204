//! Per-scheduler change selection: which changes a scheduler sees at all, and
//! which of those are important enough to arm a timer.

use super::models::Change;
use regex::Regex;

/// Branch part of a change filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchSelection {
    /// Every branch, including the default one.
    Any,
    /// Exactly this branch; `None` selects the default branch.
    Exact(Option<String>),
    OneOf(Vec<String>),
}

impl BranchSelection {
    fn matches(&self, branch: Option<&str>) -> bool {
        match self {
            BranchSelection::Any => true,
            BranchSelection::Exact(expected) => expected.as_deref() == branch,
            BranchSelection::OneOf(list) => branch.is_some_and(|b| list.iter().any(|x| x == b)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFilter {
    pub branch: BranchSelection,
    pub categories: Option<Vec<String>>,
    pub repository: Option<String>,
}

impl ChangeFilter {
    pub fn any() -> Self {
        Self {
            branch: BranchSelection::Any,
            categories: None,
            repository: None,
        }
    }

    pub fn matches(&self, change: &Change) -> bool {
        if !self.branch.matches(change.branch.as_deref()) {
            return false;
        }
        if let Some(categories) = &self.categories {
            match &change.category {
                Some(category) if categories.contains(category) => {}
                _ => return false,
            }
        }
        if let Some(repository) = &self.repository {
            if &change.repository != repository {
                return false;
            }
        }
        true
    }
}

/// Decides whether a change touches files that matter.
#[derive(Debug, Clone, Default)]
pub struct ImportancePolicy {
    patterns: Vec<Regex>,
}

impl ImportancePolicy {
    pub fn new(patterns: Vec<Regex>) -> Self {
        Self { patterns }
    }

    pub fn compile<S: AsRef<str>>(patterns: &[S]) -> Result<Self, regex::Error> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// With no patterns configured every change is important.
    pub fn is_important(&self, change: &Change) -> bool {
        if self.patterns.is_empty() {
            return true;
        }
        change
            .files
            .iter()
            .any(|file| self.patterns.iter().any(|p| p.is_match(file)))
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(Regex::as_str)
    }
}
