//! Config templating.
//!
//! Templates use `%(key)s` (or `%(key)d`) placeholders filled from an App's
//! config; `%%` is a literal percent sign.

use regex::Regex;
use std::sync::LazyLock;

use super::config::AppConfig;
use super::paths::PathCategory;
use crate::errors::TemplateError;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"%%|%\((\w+)\)[sd]").unwrap());

/// How a template becomes a file in the App sandbox.
#[derive(Debug, Clone)]
pub struct TemplateOptions {
    /// Substitute placeholders; `false` copies the template verbatim
    pub substitute: bool,
    /// Raw text appended after a newline, never substituted
    pub append: Option<String>,
    pub category: PathCategory,
    /// Add a random suffix to the file name
    pub unique: bool,
}

impl Default for TemplateOptions {
    fn default() -> Self {
        Self {
            substitute: true,
            append: None,
            category: PathCategory::Temporary,
            unique: false,
        }
    }
}

/// Fill the placeholders in `template` from `config`.
pub fn render(template: &str, config: &AppConfig) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in PLACEHOLDER.captures_iter(template) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        out.push_str(&template[last..whole.start()]);
        match caps.get(1) {
            None => out.push('%'),
            Some(key) => {
                let value = config
                    .render(key.as_str())
                    .ok_or_else(|| TemplateError::MissingKey {
                        key: key.as_str().to_string(),
                    })?;
                out.push_str(&value);
            }
        }
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Produce final file contents per `opts`.
pub(crate) fn materialize(
    template: &str,
    config: &AppConfig,
    opts: &TemplateOptions,
) -> Result<String, TemplateError> {
    let mut rendered = if opts.substitute {
        render(template, config)?
    } else {
        template.to_string()
    };
    if let Some(extra) = &opts.append {
        rendered.push('\n');
        rendered.push_str(extra);
    }
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AppConfig {
        let mut config = AppConfig::new();
        config.set("port", 2181).unwrap();
        config.set("datadir", "/tmp/zk/data").unwrap();
        config
    }

    #[test]
    fn substitutes_string_and_numeric_placeholders() {
        let out = render("dataDir=%(datadir)s\nclientPort=%(port)d\n", &config()).unwrap();
        assert_eq!(out, "dataDir=/tmp/zk/data\nclientPort=2181\n");
    }

    #[test]
    fn double_percent_is_literal() {
        let out = render("usage=100%% of %(port)s", &config()).unwrap();
        assert_eq!(out, "usage=100% of 2181");
    }

    #[test]
    fn missing_key_is_an_error() {
        let err = render("listeners=%(listeners)s", &config()).unwrap_err();
        match err {
            TemplateError::MissingKey { key } => assert_eq!(key, "listeners"),
            other => panic!("Expected MissingKey, got {:?}", other),
        }
    }

    #[test]
    fn verbatim_copy_and_raw_append() {
        let opts = TemplateOptions {
            substitute: false,
            append: Some("extra=%(not_substituted)s".into()),
            ..Default::default()
        };
        let out = materialize("port=%(port)d", &config(), &opts).unwrap();
        assert_eq!(out, "port=%(port)d\nextra=%(not_substituted)s");
    }
}
