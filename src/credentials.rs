//! Managed credential file
//!
//! API keys live in `<data_dir>/.env` and nowhere else. Keys are never
//! sourced from the ambient process environment; the file is the single
//! path so a stray `ANTHROPIC_API_KEY` in the user's shell cannot bill the
//! wrong account through the memory agent.
//!
//! Format: `KEY=VALUE` lines, `#` comments, optional single or double
//! quoting around the value.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Recognized credential keys.
pub const ANTHROPIC_API_KEY: &str = "ANTHROPIC_API_KEY";
pub const GEMINI_API_KEY: &str = "GEMINI_API_KEY";
pub const OPENROUTER_API_KEY: &str = "OPENROUTER_API_KEY";

/// Parsed contents of the credential file.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    values: HashMap<String, String>,
}

impl Credentials {
    /// Load from `<data_dir>/.env`. A missing file is an empty credential
    /// set, not an error.
    pub fn load(data_dir: &Path) -> anyhow::Result<Self> {
        let path = Self::path(data_dir);
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&path)?;
        Ok(Self::parse(&contents))
    }

    pub fn path(data_dir: &Path) -> PathBuf {
        data_dir.join(".env")
    }

    fn parse(contents: &str) -> Self {
        let mut values = HashMap::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            values.insert(key.to_string(), unquote(value.trim()).to_string());
        }
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    pub fn anthropic_api_key(&self) -> Option<&str> {
        self.get(ANTHROPIC_API_KEY)
    }

    pub fn gemini_api_key(&self) -> Option<&str> {
        self.get(GEMINI_API_KEY)
    }

    pub fn openrouter_api_key(&self) -> Option<&str> {
        self.get(OPENROUTER_API_KEY)
    }
}

/// Strip one matching pair of single or double quotes.
fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_quoted_values() {
        let creds = Credentials::parse(
            "# managed by mnemo\nANTHROPIC_API_KEY=sk-ant-123\nGEMINI_API_KEY=\"gm-456\"\nOPENROUTER_API_KEY='or-789'\n",
        );
        assert_eq!(creds.anthropic_api_key(), Some("sk-ant-123"));
        assert_eq!(creds.gemini_api_key(), Some("gm-456"));
        assert_eq!(creds.openrouter_api_key(), Some("or-789"));
    }

    #[test]
    fn skips_comments_blanks_and_malformed_lines() {
        let creds = Credentials::parse("# comment\n\nnot a pair\nGEMINI_API_KEY=x\n");
        assert_eq!(creds.gemini_api_key(), Some("x"));
        assert_eq!(creds.anthropic_api_key(), None);
    }

    #[test]
    fn empty_value_reads_as_absent() {
        let creds = Credentials::parse("ANTHROPIC_API_KEY=\n");
        assert_eq!(creds.anthropic_api_key(), None);
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let creds = Credentials::load(dir.path()).unwrap();
        assert_eq!(creds.anthropic_api_key(), None);
    }
}
