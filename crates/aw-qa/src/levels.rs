use std::time::Duration;

use aw_core::config::{CheckDefinition, LevelConfig, QaConfig};
use aw_core::types::{Task, ValidationLevel};

/// The check plan a QA run executes.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLevel {
    pub level: ValidationLevel,
    pub checks: Vec<CheckDefinition>,
    pub total_budget: Duration,
    pub fail_fast: bool,
}

impl ResolvedLevel {
    fn from_config(level: ValidationLevel, cfg: &LevelConfig) -> Self {
        Self {
            level,
            checks: cfg.checks.clone(),
            total_budget: cfg.total_budget(),
            fail_fast: cfg.fail_fast,
        }
    }

    pub fn check(&self, name: &str) -> Option<&CheckDefinition> {
        self.checks.iter().find(|c| c.name == name)
    }
}

/// The task's own level if it names one that is configured, otherwise the
/// configured default. `None` only when neither is configured.
pub fn resolve(config: &QaConfig, task: &Task) -> Option<ResolvedLevel> {
    if let Some(level) = task.qa_level {
        match config.level(level) {
            Some(cfg) => return Some(ResolvedLevel::from_config(level, cfg)),
            None => tracing::warn!(
                task = %task.display_id,
                %level,
                default = %config.default_level,
                "qa level not configured, using default"
            ),
        }
    }
    config
        .level(config.default_level)
        .map(|cfg| ResolvedLevel::from_config(config.default_level, cfg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn default_levels_grow_in_strictness() {
        let config = QaConfig::default();
        let names = |level| {
            let mut task = Task::new(Uuid::new_v4(), "T-1", "t");
            task.qa_level = Some(level);
            resolve(&config, &task)
                .unwrap()
                .checks
                .iter()
                .map(|c| c.name.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(names(ValidationLevel::Quick), vec!["TypeScript Compilation"]);
        assert_eq!(
            names(ValidationLevel::Standard),
            vec!["TypeScript Compilation", "Lint", "Tests"]
        );
        assert_eq!(names(ValidationLevel::Thorough).len(), 5);
        assert_eq!(names(ValidationLevel::Release).last().unwrap(), "Security Audit");
    }

    #[test]
    fn unconfigured_level_falls_back_to_default() {
        let mut config = QaConfig::default();
        config.levels.remove("RELEASE");
        let mut task = Task::new(Uuid::new_v4(), "T-1", "t");
        task.qa_level = Some(ValidationLevel::Release);
        let resolved = resolve(&config, &task).unwrap();
        assert_eq!(resolved.level, ValidationLevel::Standard);
        assert_eq!(resolved.total_budget, Duration::from_secs(600));
        assert!(!resolved.fail_fast);
    }
}
