use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::config::Config;

pub const SYSTEM_PROMPT: &str = "system_message";
pub const INITIAL_PROMPT: &str = "initial_message";

pub const DEFAULT_SYSTEM_MESSAGE: &str =
    "You are a helpful phone assistant. Keep your answers short and conversational.";
pub const DEFAULT_INITIAL_MESSAGE: &str = "Hello! How can I help you today?";

/// Reads every `*.md` file in `dir_path`, keyed by file stem.
pub fn load_prompts(dir_path: &Path) -> Result<HashMap<String, String>> {
    let mut prompts = HashMap::new();

    for entry in fs::read_dir(dir_path)
        .with_context(|| format!("Failed to read prompts directory: {}", dir_path.display()))?
    {
        let entry = entry?;
        let path = entry.path();

        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("md") {
            let prompt_key = path
                .file_stem()
                .and_then(|s| s.to_str())
                .context("Could not get file stem for prompt file")?
                .to_string();

            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read prompt file: {}", path.display()))?;

            prompts.insert(prompt_key, content.trim().to_string());
        }
    }

    Ok(prompts)
}

/// The messages every new call starts with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompts {
    pub system_message: String,
    pub initial_message: String,
}

impl Default for Prompts {
    fn default() -> Self {
        Self {
            system_message: DEFAULT_SYSTEM_MESSAGE.to_string(),
            initial_message: DEFAULT_INITIAL_MESSAGE.to_string(),
        }
    }
}

impl Prompts {
    /// Environment overrides win over prompt files, which win over the defaults.
    ///
    /// A missing prompts directory is not an error; an unreadable one is.
    pub fn resolve(config: &Config) -> Result<Self> {
        let mut files = if config.prompts_dir.is_dir() {
            load_prompts(&config.prompts_dir)?
        } else {
            tracing::warn!(
                "Prompts directory {} not found, using built-in prompts.",
                config.prompts_dir.display()
            );
            HashMap::new()
        };
        let mut pick = |key: &str, over: &Option<String>, default: &str| {
            over.clone()
                .or_else(|| files.remove(key).filter(|p| !p.is_empty()))
                .unwrap_or_else(|| default.to_string())
        };

        Ok(Self {
            system_message: pick(SYSTEM_PROMPT, &config.system_message, DEFAULT_SYSTEM_MESSAGE),
            initial_message: pick(INITIAL_PROMPT, &config.initial_message, DEFAULT_INITIAL_MESSAGE),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    fn config(prompts_dir: &Path, system_message: Option<&str>) -> Config {
        let dir = prompts_dir.display().to_string();
        let system_message = system_message.map(str::to_string);
        Config::from_lookup(move |key| match key {
            "TWILIO_ACCOUNT_SID" => Some("AC123".into()),
            "TWILIO_AUTH_TOKEN" => Some("token".into()),
            "OPENAI_API_KEY" => Some("sk-test".into()),
            "DEEPGRAM_API_KEY" => Some("dg-test".into()),
            "PROMPTS_DIR" => Some(dir.clone()),
            "SYSTEM_MESSAGE" => system_message.clone(),
            _ => None,
        })
        .unwrap()
    }

    #[test]
    fn test_load_prompts_successfully() -> Result<()> {
        let dir = tempdir()?;
        let dir_path = dir.path();

        let mut file1 = File::create(dir_path.join("system_message.md"))?;
        writeln!(file1, "You answer the phone for {{company}}.")?;

        let mut file2 = File::create(dir_path.join("initial_message.md"))?;
        writeln!(file2, "Hi there!")?;

        // Not a prompt.
        let mut ignored_file = File::create(dir_path.join("notes.txt"))?;
        writeln!(ignored_file, "some notes")?;
        std::fs::create_dir(dir_path.join("subdir"))?;

        let prompts = load_prompts(dir_path)?;

        assert_eq!(prompts.len(), 2, "Should only load .md files");
        assert_eq!(
            prompts.get("system_message").unwrap(),
            "You answer the phone for {company}."
        );
        assert_eq!(prompts.get("initial_message").unwrap(), "Hi there!");
        assert!(prompts.get("notes").is_none());
        Ok(())
    }

    #[test]
    fn test_load_prompts_from_nonexistent_dir() {
        let result = load_prompts(Path::new("nonexistent_dir_for_testing_prompts"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_prompts_from_empty_dir() -> Result<()> {
        let dir = tempdir()?;
        assert!(load_prompts(dir.path())?.is_empty());
        Ok(())
    }

    #[test]
    fn files_are_used_unless_overridden() -> Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join("system_message.md"), "From file.\n")?;
        fs::write(dir.path().join("initial_message.md"), "Welcome!\n")?;

        let prompts = Prompts::resolve(&config(dir.path(), None))?;
        assert_eq!(prompts.system_message, "From file.");
        assert_eq!(prompts.initial_message, "Welcome!");

        let prompts = Prompts::resolve(&config(dir.path(), Some("From env.")))?;
        assert_eq!(prompts.system_message, "From env.");
        assert_eq!(prompts.initial_message, "Welcome!");
        Ok(())
    }

    #[test]
    fn missing_dir_falls_back_to_defaults() -> Result<()> {
        let prompts = Prompts::resolve(&config(Path::new("no_such_prompts_dir"), None))?;
        assert_eq!(prompts, Prompts::default());
        Ok(())
    }
}
