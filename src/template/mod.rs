//! Reverse-proxy configuration templating.
//!
//! Templates use `${NAME}` placeholders. `$${` emits a literal `${`, and any
//! other `$` (nginx's `$host`, `$remote_addr`, ...) is left alone.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Deserialize;
use tracing::info;

use crate::error::{Error, Result};
use crate::executor::files::write_atomic;
use crate::executor::users::{self, Identity};

static PLACEHOLDER_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\$\{|\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("Invalid placeholder regex")
});

/// Template source, destination and variable declarations.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateSpec {
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Static defaults, overridable from the environment.
    #[serde(default)]
    pub defaults: BTreeMap<String, String>,
    /// Names without a default that the environment must supply.
    #[serde(default)]
    pub required: Vec<String>,
    /// User that owns the rendered file, looked up in the runtime root.
    #[serde(default)]
    pub owner: Option<String>,
}

/// Resolved variable values for one render.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariableSet {
    values: BTreeMap<String, String>,
}

impl VariableSet {
    /// Defaults overridden by same-named environment values.
    ///
    /// Only declared names (defaults and `required`) are taken from `env`.
    pub fn resolve(
        defaults: &BTreeMap<String, String>,
        required: &[String],
        env: &BTreeMap<String, String>,
    ) -> Self {
        let mut values = defaults.clone();
        for name in defaults.keys().chain(required.iter()) {
            if let Some(value) = env.get(name) {
                values.insert(name.clone(), value.clone());
            }
        }
        Self { values }
    }

    /// [`VariableSet::resolve`] against the current process environment.
    pub fn from_process_env(defaults: &BTreeMap<String, String>, required: &[String]) -> Self {
        let env: BTreeMap<String, String> = std::env::vars().collect();
        Self::resolve(defaults, required, &env)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }
}

/// Substitute every placeholder in `template`.
///
/// Fails with [`Error::TemplateResolution`] naming every unresolved
/// placeholder, sorted and deduplicated.
pub fn render(template: &str, variables: &VariableSet) -> Result<String> {
    let mut missing = BTreeSet::new();
    let rendered = PLACEHOLDER_REGEX.replace_all(template, |caps: &Captures| {
        match caps.get(1) {
            None => "${".to_string(),
            Some(name) => match variables.get(name.as_str()) {
                Some(value) => value.to_string(),
                None => {
                    missing.insert(name.as_str().to_string());
                    String::new()
                }
            },
        }
    });

    if !missing.is_empty() {
        return Err(Error::TemplateResolution {
            names: missing.into_iter().collect(),
        });
    }
    Ok(rendered.into_owned())
}

/// Atomically write rendered config and hand it to `identity`.
pub fn write(config_text: &str, destination: &Path, identity: Option<&Identity>) -> Result<()> {
    write_atomic(destination, config_text.as_bytes())?;
    if let Some(identity) = identity {
        users::reown(&[destination.to_path_buf()], identity)?;
    }
    Ok(())
}

/// Identity of `spec.owner`, looked up in `root`'s passwd.
pub fn resolve_owner(spec: &TemplateSpec, root: &Path) -> Result<Option<Identity>> {
    let Some(owner) = &spec.owner else {
        return Ok(None);
    };
    match users::resolve_identity(root, owner)? {
        Some(identity) => Ok(Some(identity)),
        None => Err(Error::InvalidPipeline(format!(
            "template owner '{}' not found under '{}'",
            owner,
            root.display()
        ))),
    }
}

/// Read, render and write the template described by `spec`.
pub fn render_spec(
    spec: &TemplateSpec,
    variables: &VariableSet,
    identity: Option<&Identity>,
) -> Result<String> {
    let template = fs::read_to_string(&spec.source).map_err(|e| Error::io(&spec.source, e))?;
    let text = render(&template, variables)?;
    write(&text, &spec.destination, identity)?;
    info!(
        source = %spec.source.display(),
        destination = %spec.destination.display(),
        "rendered config template"
    );
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const NGINX: &str = "worker_processes ${WORKER_PROCESSES};\n\
        server {\n    listen ${PORT};\n    proxy_set_header Host $host;\n    \
        proxy_pass http://127.0.0.1:${APP_PORT};\n}\n";

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_environment_overrides_defaults() {
        let defaults = vars(&[("PORT", "8080"), ("WORKER_PROCESSES", "auto")]);
        let env = vars(&[("PORT", "9000"), ("UNRELATED", "x")]);
        let set = VariableSet::resolve(&defaults, &[], &env);

        assert_eq!(set.get("PORT"), Some("9000"));
        assert_eq!(set.get("WORKER_PROCESSES"), Some("auto"));
        assert_eq!(set.get("UNRELATED"), None);
    }

    #[test]
    fn test_required_comes_from_environment() {
        let env = vars(&[("APP_PORT", "5000")]);
        let set = VariableSet::resolve(&BTreeMap::new(), &["APP_PORT".into()], &env);
        assert_eq!(set.get("APP_PORT"), Some("5000"));
    }

    #[test]
    fn test_render_substitutes_and_keeps_nginx_variables() {
        let set = VariableSet::resolve(
            &vars(&[("PORT", "8080"), ("WORKER_PROCESSES", "2"), ("APP_PORT", "5000")]),
            &[],
            &BTreeMap::new(),
        );
        let text = render(NGINX, &set).unwrap();

        assert!(text.contains("listen 8080;"));
        assert!(text.contains("worker_processes 2;"));
        assert!(text.contains("Host $host;"));
        assert!(text.contains("127.0.0.1:5000"));
        assert_eq!(text, render(NGINX, &set).unwrap());
    }

    #[test]
    fn test_render_lists_every_missing_name_once() {
        let set = VariableSet::resolve(&vars(&[("PORT", "8080")]), &[], &BTreeMap::new());
        let template = "${ZETA} ${PORT} ${ALPHA} ${ZETA}";

        match render(template, &set).unwrap_err() {
            Error::TemplateResolution { names } => assert_eq!(names, ["ALPHA", "ZETA"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_escaped_placeholder_is_literal() {
        let text = render("a $${PORT} b ${ 1x}", &VariableSet::default()).unwrap();
        assert_eq!(text, "a ${PORT} b ${ 1x}");
    }

    #[test]
    fn test_render_independent_of_insertion_order() {
        let mut a = VariableSet::default();
        a.insert("X", "1");
        a.insert("Y", "2");
        let mut b = VariableSet::default();
        b.insert("Y", "2");
        b.insert("X", "1");
        assert_eq!(render("${X}${Y}", &a).unwrap(), render("${X}${Y}", &b).unwrap());
    }

    #[test]
    fn test_render_spec_writes_owned_file() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("nginx.conf.tpl");
        fs::write(&source, "listen ${PORT};\n").unwrap();
        let spec = TemplateSpec {
            source,
            destination: temp.path().join("etc/nginx/nginx.conf"),
            defaults: vars(&[("PORT", "8080")]),
            required: vec![],
            owner: None,
        };
        let identity = users::current_identity("/home/app");
        let set = VariableSet::resolve(&spec.defaults, &spec.required, &BTreeMap::new());

        render_spec(&spec, &set, Some(&identity)).unwrap();

        assert_eq!(
            fs::read_to_string(&spec.destination).unwrap(),
            "listen 8080;\n"
        );
        assert!(users::is_owned_by(&spec.destination, &identity).unwrap());
    }

    #[test]
    fn test_render_spec_failure_writes_nothing() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("nginx.conf.tpl");
        fs::write(&source, "listen ${PORT};\n").unwrap();
        let spec = TemplateSpec {
            source,
            destination: temp.path().join("nginx.conf"),
            defaults: BTreeMap::new(),
            required: vec!["PORT".into()],
            owner: None,
        };
        let set = VariableSet::resolve(&spec.defaults, &spec.required, &BTreeMap::new());

        assert!(render_spec(&spec, &set, None).is_err());
        assert!(!spec.destination.exists());
    }

    #[test]
    fn test_resolve_owner() {
        let temp = TempDir::new().unwrap();
        let mut spec = TemplateSpec {
            source: temp.path().join("nginx.conf.tpl"),
            destination: temp.path().join("nginx.conf"),
            defaults: BTreeMap::new(),
            required: vec![],
            owner: None,
        };
        assert!(resolve_owner(&spec, temp.path()).unwrap().is_none());

        spec.owner = Some("nginx".into());
        assert!(matches!(
            resolve_owner(&spec, temp.path()),
            Err(Error::InvalidPipeline(_))
        ));
    }
}
