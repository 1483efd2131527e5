use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Parsed `.env` content. `skipped` holds 1-based numbers of lines without
/// `=`; logging them is left to the caller, since `.env` is read before the
/// logger starts.
#[derive(Debug, Default)]
pub struct EnvFile {
    pub vars: HashMap<String, String>,
    pub skipped: Vec<usize>,
}

/// Parses `KEY=value` lines. Blank lines and `#` comments are skipped and
/// surrounding quotes are stripped from values.
pub fn parse_env_str(content: &str) -> EnvFile {
    let mut parsed = EnvFile::default();
    for (idx, line) in content.lines().enumerate() {
        let s = line.trim();
        if s.is_empty() || s.starts_with('#') {
            continue;
        }
        let Some((key, val)) = s.split_once('=') else {
            parsed.skipped.push(idx + 1);
            continue;
        };
        let mut val = val.trim();
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = &val[1..val.len() - 1];
        }
        parsed.vars.insert(key.trim().to_string(), val.to_string());
    }
    parsed
}

pub fn parse_env_file(path: &Path) -> Result<EnvFile> {
    if !path.exists() {
        return Ok(EnvFile::default());
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(parse_env_str(&content))
}

/// Loads `.env` from the working directory into the process environment.
/// Variables already set are left alone. Returns the parse result with `vars`
/// reduced to the variables actually applied.
pub fn load_dotenv_if_present() -> Result<EnvFile> {
    let parsed = parse_env_file(Path::new(".env"))?;
    let mut applied = HashMap::new();
    for (k, v) in parsed.vars {
        if std::env::var_os(&k).is_none() {
            // Called from main before any other thread is started.
            unsafe {
                std::env::set_var(&k, &v);
            }
            applied.insert(k, v);
        }
    }
    Ok(EnvFile {
        vars: applied,
        skipped: parsed.skipped,
    })
}

pub fn write_env_template(path: &Path) -> Result<()> {
    let template = r#"# entity_dedupe environment configuration template
# Copy this file to .env and fill in your database connection settings.
# Any of these variables can also be provided via the system environment.

DB_HOST=127.0.0.1
DB_PORT=3306
DB_USER=root
DB_PASSWORD=secret
DB_NAME=dedupe

# Connection pool (optional)
#DEDUPE_POOL_SIZE=8
#DEDUPE_POOL_MIN=1
#DEDUPE_ACQUIRE_MS=30000

# Log level (optional, overrides --verbose)
#RUST_LOG=info
"#;
    fs::write(path, template).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
