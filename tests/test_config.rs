use std::io::Write;

use caseflow::cli::CaseflowConfig;
use caseflow::rules::TaskRegistry;
use tempfile::NamedTempFile;

fn load(yaml: &str) -> CaseflowConfig {
    let mut f = NamedTempFile::new().unwrap();
    f.write_all(yaml.as_bytes()).unwrap();
    CaseflowConfig::load(Some(f.path())).unwrap()
}

#[test]
fn load_valid_config_all_fields() {
    let cfg = load(
        r#"
store:
  base_url: "http://cases.internal:4452/"
  case_type: "DIVORCE"
  page_size: 250
  timeout_s: 12.5
timezone: "Europe/Dublin"
max_concurrent_submissions: 8
timing:
  applicant2_reminder_days_before_due: 5
  conditional_order_reminder_days: 21
  final_order_reminder_days: 7
  joint_final_order_reminder_days: 3
tasks:
  progress-held-cases:
    schedule: "0 0 9 * * *"
  remind-awaiting-joint-final-order:
    schedule: "0 30 6 * * *"
    enabled: false
"#,
    );

    assert_eq!(cfg.store.base_url.as_deref(), Some("http://cases.internal:4452/"));
    assert_eq!(cfg.case_type(), "DIVORCE");
    assert_eq!(cfg.page_size(), 250);
    assert_eq!(cfg.timeout(), std::time::Duration::from_millis(12_500));
    assert_eq!(cfg.timezone().unwrap(), chrono_tz::Europe::Dublin);
    assert_eq!(cfg.max_concurrent_submissions, Some(8));
    assert_eq!(cfg.timing.applicant2_reminder_days_before_due, 5);
    assert_eq!(cfg.timing.conditional_order_reminder_days, 21);
    assert_eq!(cfg.timing.final_order_reminder_days, 7);
    assert_eq!(cfg.timing.joint_final_order_reminder_days, 3);
    assert_eq!(cfg.tasks.len(), 2);
}

#[test]
fn load_partial_config() {
    let cfg = load(
        r#"
timing:
  joint_final_order_reminder_days: 10
"#,
    );

    assert!(cfg.store.base_url.is_none());
    assert_eq!(cfg.case_type(), "NFD");
    assert_eq!(cfg.page_size(), 100);
    assert_eq!(cfg.timezone().unwrap(), chrono_tz::Europe::London);
    assert_eq!(cfg.timing.joint_final_order_reminder_days, 10);
    // Unset offsets keep their defaults.
    assert_eq!(cfg.timing.conditional_order_reminder_days, 14);
    assert_eq!(cfg.timing.applicant2_reminder_days_before_due, 10);
    assert!(cfg.tasks.is_empty());
}

#[test]
fn missing_explicit_path_returns_error() {
    let result = CaseflowConfig::load(Some(std::path::Path::new("/nonexistent/caseflow.yaml")));
    assert!(result.is_err());
    assert!(
        result
            .unwrap_err()
            .to_string()
            .contains("Config file not found")
    );
}

#[test]
fn default_config_is_usable() {
    let cfg = CaseflowConfig::default();
    assert!(cfg.store.base_url.is_none());
    assert!(cfg.max_concurrent_submissions.is_none());
    assert_eq!(cfg.timeout(), std::time::Duration::from_secs(30));
    assert!(cfg.validate(&TaskRegistry::with_builtins()).is_empty());
}

#[test]
fn invalid_yaml_returns_error() {
    let mut f = NamedTempFile::new().unwrap();
    f.write_all(b"store: [this is not valid yaml").unwrap();

    let result = CaseflowConfig::load(Some(f.path()));
    assert!(result.is_err());
    assert!(
        result
            .unwrap_err()
            .to_string()
            .contains("Failed to parse config file")
    );
}

#[test]
fn unknown_keys_are_ignored() {
    let cfg = load(
        r#"
max_concurrent_submissions: 4
unknown_setting: true
"#,
    );
    assert_eq!(cfg.max_concurrent_submissions, Some(4));
}

#[test]
fn disabled_tasks_are_not_scheduled() {
    let cfg = load(
        r#"
tasks:
  progress-held-cases:
    schedule: "0 0 9 * * *"
  progress-paid-cases:
    schedule: "0 */15 * * * *"
    enabled: false
"#,
    );

    let enabled: Vec<(&str, &str)> = cfg.enabled_tasks().collect();
    assert_eq!(enabled, vec![("progress-held-cases", "0 0 9 * * *")]);
}

#[test]
fn validate_reports_every_problem() {
    let cfg = load(
        r#"
timezone: "Mars/Olympus"
store:
  page_size: 0
max_concurrent_submissions: 0
tasks:
  no-such-task:
    schedule: "0 0 9 * * *"
  progress-held-cases:
    schedule: "every morning"
"#,
    );

    let errors = cfg.validate(&TaskRegistry::with_builtins());
    assert_eq!(errors.len(), 5, "{:?}", errors);
    assert!(errors.iter().any(|e| e.contains("Mars/Olympus")));
    assert!(errors.iter().any(|e| e.contains("page_size")));
    assert!(errors.iter().any(|e| e.contains("max_concurrent_submissions")));
    assert!(errors.iter().any(|e| e.contains("Unknown task 'no-such-task'")));
    assert!(
        errors
            .iter()
            .any(|e| e.contains("Task 'progress-held-cases' has invalid schedule"))
    );
}

#[test]
fn valid_schedule_passes_validation() {
    let cfg = load(
        r#"
tasks:
  remind-awaiting-joint-final-order:
    schedule: "0 0 8 * * Mon-Fri"
"#,
    );
    assert!(cfg.validate(&TaskRegistry::with_builtins()).is_empty());
}
