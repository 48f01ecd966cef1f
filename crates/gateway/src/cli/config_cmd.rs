//! `ruche config validate` / `ruche config show`.

use std::path::Path;

use ruche_domain::config::{Config, ConfigSeverity};

/// Print every issue; returns whether the configuration is usable.
pub fn validate(config: &Config, path: &Path) -> bool {
    let issues = config.validate();
    if issues.is_empty() {
        println!("{}: OK", path.display());
        return true;
    }
    for issue in &issues {
        println!("{issue}");
    }
    let errors = issues
        .iter()
        .filter(|i| i.severity == ConfigSeverity::Error)
        .count();
    if errors > 0 {
        println!("{errors} error(s) in {}", path.display());
        false
    } else {
        println!("{} warning(s), configuration usable", issues.len());
        true
    }
}

/// Print the effective configuration (defaults applied) as TOML.
pub fn show(config: &Config) {
    match toml::to_string_pretty(config) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("failed to render config: {e}"),
    }
}
