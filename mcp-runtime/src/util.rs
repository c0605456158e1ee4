use std::io::Write;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct StoredCredentials {
    pub api_url: String,
    pub api_key: String,
    pub saved_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

pub fn client() -> reqwest::Client {
    reqwest::Client::new()
}

pub fn config_path() -> std::path::PathBuf {
    let config_dir = dirs::config_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("cloudkit");
    config_dir.join("credentials.json")
}

pub fn load_credentials() -> Option<StoredCredentials> {
    let path = config_path();
    let data = std::fs::read_to_string(&path).ok()?;
    serde_json::from_str(&data).ok()
}

pub fn save_credentials(creds: &StoredCredentials) -> Result<(), Box<dyn std::error::Error>> {
    let path = config_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let data = serde_json::to_string_pretty(creds)?;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&path)?;
    file.write_all(data.as_bytes())?;

    Ok(())
}

/// Returns whether a credentials file existed.
pub fn delete_credentials() -> Result<bool, std::io::Error> {
    match std::fs::remove_file(config_path()) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

/// `CLOUDKIT_API_KEY` first, then the stored credentials for the same API URL.
pub fn resolve_token(api_url: &str) -> Result<String, Box<dyn std::error::Error>> {
    if let Ok(key) = std::env::var("CLOUDKIT_API_KEY") {
        if !key.trim().is_empty() {
            return Ok(key.trim().to_string());
        }
    }

    if let Some(creds) = load_credentials() {
        return token_from_stored(&creds, api_url, Utc::now());
    }

    Err("No credentials found. Run `cloudkit-mcp login` or set CLOUDKIT_API_KEY.".into())
}

fn token_from_stored(
    creds: &StoredCredentials,
    api_url: &str,
    now: DateTime<Utc>,
) -> Result<String, Box<dyn std::error::Error>> {
    if creds.api_url.trim_end_matches('/') != api_url.trim_end_matches('/') {
        return Err(format!(
            "Stored credentials belong to {}, not {api_url}. Run `cloudkit-mcp login` again.",
            creds.api_url
        )
        .into());
    }
    if creds.expires_at.is_some_and(|expires_at| now >= expires_at) {
        return Err("Stored API key expired. Run `cloudkit-mcp login` again.".into());
    }
    Ok(creds.api_key.clone())
}

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

#[cfg(not(unix))]
trait OpenOptionsExt {
    fn mode(&mut self, _mode: u32) -> &mut Self;
}

#[cfg(not(unix))]
impl OpenOptionsExt for std::fs::OpenOptions {
    fn mode(&mut self, _mode: u32) -> &mut Self {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(api_url: &str, expires_at: Option<DateTime<Utc>>) -> StoredCredentials {
        StoredCredentials {
            api_url: api_url.to_string(),
            api_key: "ck_test".to_string(),
            saved_at: Utc::now(),
            expires_at,
        }
    }

    #[test]
    fn stored_key_is_scoped_to_its_api_url() {
        let now = Utc::now();
        let stored = creds("https://api.example.com/", None);
        assert_eq!(
            token_from_stored(&stored, "https://api.example.com", now).unwrap(),
            "ck_test"
        );
        assert!(token_from_stored(&stored, "https://other.example.com", now).is_err());
    }

    #[test]
    fn expired_stored_key_is_rejected() {
        let now = Utc::now();
        let stored = creds("https://api.example.com", Some(now - chrono::Duration::minutes(1)));
        assert!(token_from_stored(&stored, "https://api.example.com", now).is_err());
    }
}
