// Language configuration management for the execution engine
use crate::diagnostics::DiagnosticExtractor;
use anyhow::{bail, Context, Result};
use runlab_common::config::ExecutionLimits;
use runlab_common::types::Language;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub const DEFAULT_CONFIG_PATH: &str = "config/languages.json";
pub const CONFIG_PATH_ENV: &str = "RUNLAB_LANGUAGES";

/// How a language is turned into a running process.
///
/// Argument templates may use `{source}`, `{output}` and `{workdir}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ToolchainConfig {
    Compiled {
        compiler: String,
        #[serde(default)]
        compile_args: Vec<String>,
        #[serde(default)]
        run_args: Vec<String>,
    },
    Interpreted {
        interpreter: String,
        #[serde(default)]
        run_args: Vec<String>,
    },
}

impl ToolchainConfig {
    pub fn executable(&self) -> &str {
        match self {
            ToolchainConfig::Compiled { compiler, .. } => compiler,
            ToolchainConfig::Interpreted { interpreter, .. } => interpreter,
        }
    }
}

/// Regex overrides for the diagnostic extractor. Missing entries fall back to
/// the built-in pattern for the language.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticPatterns {
    /// `file:line:column: error: message` style, named groups `line`, `column`, `message`
    #[serde(default)]
    pub located: Option<String>,
    /// Traceback frame header, named groups `file` and `line`
    #[serde(default)]
    pub traceback: Option<String>,
    /// Source excerpt gutter such as `  12 | let x =`, named group `line`
    #[serde(default)]
    pub excerpt: Option<String>,
}

impl DiagnosticPatterns {
    pub fn defaults_for(language: Language) -> Self {
        match language {
            Language::Swift => Self {
                located: Some(
                    r"(?P<file>[^\s:]+\.swift):(?P<line>\d+):(?P<column>\d+):\s*(?:error|warning):\s*(?P<message>.+)"
                        .to_string(),
                ),
                traceback: None,
                excerpt: Some(r"(?m)^\s*(?P<line>\d+)\s*\|".to_string()),
            },
            Language::Python => Self {
                located: None,
                traceback: Some(r#"File "(?P<file>[^"]+)", line (?P<line>\d+)"#.to_string()),
                excerpt: None,
            },
        }
    }

    /// Fill unset entries from the built-in defaults
    pub fn merged_with_defaults(&self, language: Language) -> Self {
        let defaults = Self::defaults_for(language);
        Self {
            located: self.located.clone().or(defaults.located),
            traceback: self.traceback.clone().or(defaults.traceback),
            excerpt: self.excerpt.clone().or(defaults.excerpt),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageConfig {
    pub name: Language,
    #[serde(default)]
    pub version: String,
    /// File name the submission is written to inside the run's workspace
    #[serde(default)]
    pub source_file: Option<String>,
    pub toolchain: ToolchainConfig,
    #[serde(default)]
    pub diagnostics: Option<DiagnosticPatterns>,
}

impl LanguageConfig {
    /// Built-in toolchain for a language, used when no config file exists
    pub fn default_for(language: Language) -> Self {
        let toolchain = match language {
            Language::Swift => ToolchainConfig::Compiled {
                compiler: "/usr/bin/swiftc".to_string(),
                compile_args: vec!["-o".to_string(), "{output}".to_string(), "{source}".to_string()],
                run_args: Vec::new(),
            },
            Language::Python => ToolchainConfig::Interpreted {
                interpreter: "/usr/bin/python3".to_string(),
                run_args: vec!["-u".to_string(), "{source}".to_string()],
            },
        };

        Self {
            name: language,
            version: String::new(),
            source_file: None,
            toolchain,
            diagnostics: None,
        }
    }

    pub fn source_file_name(&self) -> String {
        self.source_file
            .clone()
            .unwrap_or_else(|| format!("main.{}", self.name.file_extension()))
    }

    pub fn diagnostic_patterns(&self) -> DiagnosticPatterns {
        match &self.diagnostics {
            Some(patterns) => patterns.merged_with_defaults(self.name),
            None => DiagnosticPatterns::defaults_for(self.name),
        }
    }

    fn validate(&self) -> Result<()> {
        match (&self.toolchain, self.name.is_compiled()) {
            (ToolchainConfig::Compiled { .. }, true) | (ToolchainConfig::Interpreted { .. }, false) => {}
            (ToolchainConfig::Compiled { .. }, false) => {
                bail!("Language '{}' is interpreted but configured with a compiler", self.name)
            }
            (ToolchainConfig::Interpreted { .. }, true) => {
                bail!("Language '{}' is compiled but configured with an interpreter", self.name)
            }
        }

        if self.toolchain.executable().trim().is_empty() {
            bail!("Language '{}' has an empty toolchain executable", self.name);
        }

        DiagnosticExtractor::new(self.name, &self.diagnostic_patterns())
            .with_context(|| format!("Invalid diagnostic pattern for '{}'", self.name))?;

        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    #[serde(default)]
    limits: ExecutionLimits,
    languages: Vec<LanguageConfig>,
}

/// Language configuration manager
#[derive(Debug, Clone)]
pub struct LanguageConfigManager {
    configs: HashMap<Language, LanguageConfig>,
    limits: ExecutionLimits,
}

impl LanguageConfigManager {
    /// Load language configurations from a languages.json file
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let languages_json: LanguagesJson = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        let manager = Self::from_parts(languages_json.limits.with_env_overrides(), languages_json.languages)?;
        info!(
            path = %config_path.display(),
            languages = ?manager.list_languages(),
            "Loaded language configuration"
        );
        Ok(manager)
    }

    /// Load from `$RUNLAB_LANGUAGES` or `config/languages.json`, falling back
    /// to the built-in toolchains when neither exists
    pub fn load_default() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

        if path.exists() {
            return Self::load(&path);
        }

        info!(path = %path.display(), "No language config found, using built-in toolchains");
        Ok(Self::builtin().with_limits(ExecutionLimits::default().with_env_overrides()))
    }

    pub fn builtin() -> Self {
        let configs = Language::ALL
            .iter()
            .map(|language| (*language, LanguageConfig::default_for(*language)))
            .collect();

        Self {
            configs,
            limits: ExecutionLimits::default(),
        }
    }

    pub fn from_parts(limits: ExecutionLimits, languages: Vec<LanguageConfig>) -> Result<Self> {
        let mut configs = HashMap::new();
        for lang in languages {
            lang.validate()?;
            if configs.contains_key(&lang.name) {
                bail!("Language '{}' is configured more than once", lang.name);
            }
            configs.insert(lang.name, lang);
        }

        if configs.is_empty() {
            bail!("No languages configured");
        }

        Ok(Self { configs, limits })
    }

    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Get configuration for a specific language
    pub fn get_config(&self, language: &Language) -> Option<&LanguageConfig> {
        self.configs.get(language)
    }

    pub fn limits(&self) -> ExecutionLimits {
        self.limits
    }

    /// List all configured languages
    pub fn list_languages(&self) -> Vec<Language> {
        let mut languages: Vec<Language> = self.configs.keys().copied().collect();
        languages.sort_by_key(|language| language.as_str());
        languages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_builtin_covers_all_languages() {
        let manager = LanguageConfigManager::builtin();
        assert_eq!(manager.list_languages(), vec![Language::Python, Language::Swift]);

        let swift = manager.get_config(&Language::Swift).unwrap();
        assert_eq!(swift.source_file_name(), "main.swift");
        assert_eq!(swift.toolchain.executable(), "/usr/bin/swiftc");
    }

    #[test]
    fn test_load_config_file() {
        let file = write_config(
            r#"{
                "limits": { "timeout_ms": 2000 },
                "languages": [
                    {
                        "name": "python",
                        "version": "3.12",
                        "toolchain": { "kind": "interpreted", "interpreter": "/bin/sh", "run_args": ["{source}"] }
                    }
                ]
            }"#,
        );

        let manager = LanguageConfigManager::load(file.path()).unwrap();
        assert_eq!(manager.list_languages(), vec![Language::Python]);
        assert!(manager.get_config(&Language::Swift).is_none());

        let python = manager.get_config(&Language::Python).unwrap();
        assert_eq!(python.version, "3.12");
        assert_eq!(python.source_file_name(), "main.py");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = LanguageConfigManager::load(Path::new("/definitely/not/here/languages.json"));
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_mismatched_toolchain_kind() {
        let mut swift = LanguageConfig::default_for(Language::Swift);
        swift.toolchain = ToolchainConfig::Interpreted {
            interpreter: "/usr/bin/swift".to_string(),
            run_args: Vec::new(),
        };

        let err = LanguageConfigManager::from_parts(ExecutionLimits::default(), vec![swift]).unwrap_err();
        assert!(err.to_string().contains("compiled"));
    }

    #[test]
    fn test_rejects_duplicate_language() {
        let languages = vec![
            LanguageConfig::default_for(Language::Python),
            LanguageConfig::default_for(Language::Python),
        ];
        assert!(LanguageConfigManager::from_parts(ExecutionLimits::default(), languages).is_err());
    }

    #[test]
    fn test_rejects_invalid_pattern() {
        let mut python = LanguageConfig::default_for(Language::Python);
        python.diagnostics = Some(DiagnosticPatterns {
            traceback: Some("File \"(unclosed".to_string()),
            ..Default::default()
        });

        assert!(LanguageConfigManager::from_parts(ExecutionLimits::default(), vec![python]).is_err());
    }

    #[test]
    fn test_partial_patterns_merge_with_defaults() {
        let patterns = DiagnosticPatterns {
            excerpt: Some(r"^(?P<line>\d+)>".to_string()),
            ..Default::default()
        };

        let merged = patterns.merged_with_defaults(Language::Swift);
        assert_eq!(merged.excerpt.as_deref(), Some(r"^(?P<line>\d+)>"));
        assert!(merged.located.is_some());
    }

    #[test]
    fn test_shipped_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/languages.json");
        let manager = LanguageConfigManager::load(&path).unwrap();

        assert_eq!(manager.list_languages(), vec![Language::Python, Language::Swift]);
        let python = manager.get_config(&Language::Python).unwrap();
        assert_eq!(python.toolchain.executable(), "/usr/bin/python3");
    }
}
