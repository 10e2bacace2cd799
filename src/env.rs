use anyhow::{Result, anyhow};
use std::{collections::HashMap, fs, io, path::Path};

/// Load worker environment overrides from a .env-style file, tolerating comments and blank lines.
pub fn load_env_overrides(path: &Path) -> Result<HashMap<String, String>> {
    parse_lenient_dotenv(path).map_err(|error| {
        anyhow!(
            "failed to parse environment overrides from {:?}: {error}",
            path
        )
    })
}

fn parse_lenient_dotenv(path: &Path) -> io::Result<HashMap<String, String>> {
    let contents = fs::read_to_string(path)?;
    parse_dotenv_str(&contents)
}

fn parse_dotenv_str(contents: &str) -> io::Result<HashMap<String, String>> {
    let mut map = HashMap::new();

    for (idx, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() || key.starts_with('.') {
            continue;
        }

        if !key.chars().all(is_env_key_char) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "invalid environment variable name `{}` at line {}",
                    key,
                    idx + 1
                ),
            ));
        }

        map.insert(key.to_string(), strip_quotes(value.trim()));
    }

    Ok(map)
}

fn is_env_key_char(ch: char) -> bool {
    matches!(ch, '_' | '-' | '.') || ch.is_ascii_alphanumeric()
}

fn strip_quotes(value: &str) -> String {
    if value.len() >= 2 {
        let bytes = value.as_bytes();
        if (bytes[0] == b'"' && bytes[value.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[value.len() - 1] == b'\'')
        {
            return value[1..value.len() - 1].to_string();
        }
    }
    value.to_string()
}
