//! Environment file loading utilities

use std::path::Path;

/// Load environment variables from .env files in `folder`.
/// This loads .env first, then .env.{APP_ENV} if APP_ENV is set.
///
/// Call before the runtime starts; it mutates the process environment.
pub fn load_env_files(folder: &Path) {
    load_env_file(folder, ".env", false);

    if let Ok(app_env) = std::env::var("APP_ENV") {
        load_env_file(folder, &format!(".env.{}", app_env), true);
    }
}

/// Load a single .env file
///
/// # Arguments
/// * `folder` - The directory containing the .env file
/// * `filename` - The name of the .env file
/// * `override_existing` - Whether to override existing environment variables
pub fn load_env_file(folder: &Path, filename: &str, override_existing: bool) {
    let env_file = folder.join(filename);
    let Ok(content) = std::fs::read_to_string(&env_file) else {
        return;
    };

    let mut loaded = 0;
    for (key, value) in parse_env(&content) {
        if override_existing || std::env::var(key).is_err() {
            std::env::set_var(key, value);
            loaded += 1;
        }
    }
    tracing::debug!(file = %env_file.display(), loaded, "loaded env file");
}

/// `KEY=value` pairs of an env file. Blank lines and `#` comments are
/// skipped, surrounding quotes are stripped from values.
fn parse_env(content: &str) -> Vec<(&str, &str)> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim(), value.trim().trim_matches('"').trim_matches('\'')))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_env() {
        let content = "# comment\n\nLIVE_OUTBOUND_CAPACITY=64\nLIVE_SESSION_COOKIE=\"sid\"\n =x\nnot a pair\n";
        assert_eq!(
            parse_env(content),
            vec![("LIVE_OUTBOUND_CAPACITY", "64"), ("LIVE_SESSION_COOKIE", "sid")]
        );
    }

    #[test]
    fn test_load_env_file_keeps_existing_values() {
        let dir = std::env::temp_dir().join(format!("livehyper-env-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(".env"),
            "LIVEHYPER_TEST_FRESH=from-file\nLIVEHYPER_TEST_SET=from-file\n",
        )
        .unwrap();
        std::env::set_var("LIVEHYPER_TEST_SET", "from-process");

        load_env_file(&dir, ".env", false);
        assert_eq!(std::env::var("LIVEHYPER_TEST_FRESH").unwrap(), "from-file");
        assert_eq!(std::env::var("LIVEHYPER_TEST_SET").unwrap(), "from-process");

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
