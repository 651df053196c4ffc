//! `{{ name }}` placeholder substitution for task commands.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};

use crate::TaskError;

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("valid regex"))
}

/// Replace every `{{ name }}` in `template` with its value from `vars`.
///
/// # Errors
/// Returns [`TaskError::Fatal`] naming the first placeholder with no value.
pub fn render(template: &str, vars: &BTreeMap<&'static str, String>) -> Result<String, TaskError> {
    let mut missing: Option<String> = None;

    let rendered = placeholder().replace_all(template, |caps: &Captures<'_>| {
        let name = &caps[1];
        match vars.get(name) {
            Some(value) => value.clone(),
            None => {
                missing.get_or_insert_with(|| name.to_owned());
                String::new()
            }
        }
    });

    match missing {
        Some(name) => Err(TaskError::Fatal(format!("unknown template variable '{name}'"))),
        None => Ok(rendered.into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> BTreeMap<&'static str, String> {
        BTreeMap::from([("ds", "2025-01-01".to_string()), ("task_id", "dbt_run".to_string())])
    }

    #[test]
    fn substitutes_known_placeholders() {
        let out = render("dbt run --vars '{run_date: {{ ds }}}' # {{task_id}}", &vars()).unwrap();
        assert_eq!(out, "dbt run --vars '{run_date: 2025-01-01}' # dbt_run");
    }

    #[test]
    fn text_without_placeholders_is_unchanged() {
        let cmd = "cd /opt/dbt && dbt seed --profiles-dir /opt/.dbt";
        assert_eq!(render(cmd, &vars()).unwrap(), cmd);
    }

    #[test]
    fn unknown_placeholder_is_fatal() {
        let err = render("echo {{ nope }}", &vars()).unwrap_err();
        assert_eq!(err, TaskError::Fatal("unknown template variable 'nope'".into()));
    }

    #[test]
    fn shell_braces_are_left_alone() {
        let cmd = "echo ${HOME} {a,b}";
        assert_eq!(render(cmd, &vars()).unwrap(), cmd);
    }
}
