use crate::error::{Result, VigilError};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Declarative definition of one managed app.
///
/// Specs are immutable once loaded; every runtime decision is derived from
/// these fields plus the app's own runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// App name (unique key within a registry)
    pub name: String,

    /// Path to the script or executable to run
    pub script: PathBuf,

    /// Command-line arguments
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the process
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Interpreter to launch the script with (e.g. `python3`).
    /// `None` or `"none"` runs the script as a native binary.
    #[serde(default, deserialize_with = "deserialize_interpreter")]
    pub interpreter: Option<PathBuf>,

    /// Environment variable overrides; merged over the inherited
    /// environment, overrides win.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Whether to automatically restart on exit
    #[serde(default = "default_autorestart")]
    pub autorestart: bool,

    /// Maximum consecutive rapid failures before giving up; `None` = unlimited
    #[serde(default)]
    pub max_restarts: Option<u32>,

    /// Minimum uptime (ms) for a run to count as a successful start
    #[serde(default = "default_min_uptime_ms")]
    pub min_uptime_ms: u64,

    /// Base delay (ms) before respawning
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,

    /// Exponential backoff multiplier applied per consecutive rapid failure
    #[serde(default)]
    pub backoff_factor: Option<u32>,

    /// Resident memory threshold triggering a forced restart.
    /// Accepts plain bytes or strings like "200M", "1G", "512K".
    #[serde(default, deserialize_with = "deserialize_memory_limit")]
    pub max_memory_restart: Option<u64>,

    /// Cron expression (5-field) relaunching the app on schedule.
    /// A cron-mode app is never restarted automatically on exit.
    #[serde(default)]
    pub cron_restart: Option<String>,

    /// Grace period (ms) between the stop signal and SIGKILL
    #[serde(default = "default_kill_timeout_ms")]
    pub kill_timeout_ms: u64,

    /// Signal to send on graceful stop (default: SIGTERM)
    #[serde(default = "default_stop_signal")]
    pub stop_signal: String,

    /// Stdout log destination; defaults to `<log_dir>/<name>-out.log`
    #[serde(default)]
    pub out_file: Option<PathBuf>,

    /// Stderr log destination; defaults to `<log_dir>/<name>-err.log`
    #[serde(default)]
    pub err_file: Option<PathBuf>,

    /// Interleave both streams into the stdout destination
    #[serde(default)]
    pub merge_logs: bool,

    /// chrono format string for merged-log timestamps
    #[serde(default)]
    pub log_date_format: Option<String>,
}

// Default value functions for serde
fn default_autorestart() -> bool {
    true
}

fn default_min_uptime_ms() -> u64 {
    1000
}

fn default_restart_delay_ms() -> u64 {
    1000
}

fn default_kill_timeout_ms() -> u64 {
    5000
}

fn default_stop_signal() -> String {
    "SIGTERM".to_string()
}

fn deserialize_interpreter<'de, D>(deserializer: D) -> std::result::Result<Option<PathBuf>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.filter(|s| s != "none" && !s.is_empty()).map(PathBuf::from))
}

fn deserialize_memory_limit<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bytes(u64),
        Human(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Bytes(n)) => Ok(Some(n)),
        Some(Raw::Human(s)) => parse_memory_size(&s)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Parse a memory size string such as "200M", "1G", "512K" or "1048576"
pub fn parse_memory_size(s: &str) -> std::result::Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty memory size".to_string());
    }

    let (digits, multiplier) = match s.chars().last() {
        Some('K') | Some('k') => (&s[..s.len() - 1], 1024u64),
        Some('M') | Some('m') => (&s[..s.len() - 1], 1024 * 1024),
        Some('G') | Some('g') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };

    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid memory size: {}", s))?;

    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("memory size overflows: {}", s))
}

impl ProcessSpec {
    /// Load app specs from a file (supports TOML and JSON)
    pub fn from_file(path: &Path) -> Result<Vec<ProcessSpec>> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| VigilError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");

        let specs = match extension {
            "toml" => Self::parse_toml(&contents)?,
            "json" => Self::parse_json(&contents)?,
            _ => {
                return Err(VigilError::InvalidConfig(format!(
                    "Unsupported file format: {}. Use .toml or .json",
                    extension
                )))
            }
        };

        let expanded: Vec<ProcessSpec> = specs
            .into_iter()
            .map(|mut spec| {
                spec.expand_env_vars();
                spec
            })
            .collect();

        for spec in &expanded {
            spec.validate()?;
        }

        Ok(expanded)
    }

    /// Parse a TOML config file with an `[[apps]]` array
    fn parse_toml(contents: &str) -> Result<Vec<ProcessSpec>> {
        #[derive(Deserialize)]
        struct ConfigFile {
            #[serde(default)]
            apps: Vec<ProcessSpec>,
        }

        let config_file: ConfigFile = toml::from_str(contents)
            .map_err(|e| VigilError::InvalidConfig(format!("Failed to parse TOML: {}", e)))?;

        if config_file.apps.is_empty() {
            return Err(VigilError::InvalidConfig(
                "No app definitions found in file".to_string(),
            ));
        }

        Ok(config_file.apps)
    }

    /// Parse a JSON config file with an `apps` array
    fn parse_json(contents: &str) -> Result<Vec<ProcessSpec>> {
        #[derive(Deserialize)]
        struct ConfigFile {
            apps: Vec<ProcessSpec>,
        }

        let config_file: ConfigFile = serde_json::from_str(contents)
            .map_err(|e| VigilError::InvalidConfig(format!("Failed to parse JSON: {}", e)))?;

        if config_file.apps.is_empty() {
            return Err(VigilError::InvalidConfig(
                "No app definitions found in file".to_string(),
            ));
        }

        Ok(config_file.apps)
    }

    /// Validate the spec
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(VigilError::MissingConfigField("name".to_string()));
        }

        if self.script.as_os_str().is_empty() {
            return Err(VigilError::MissingConfigField("script".to_string()));
        }

        // A cron app is relaunched only by the scheduler, never on exit.
        if self.cron_restart.is_some() && self.autorestart {
            return Err(VigilError::ConfigValidationError(format!(
                "App {}: cron_restart and autorestart are mutually exclusive",
                self.name
            )));
        }

        if let Some(ref expr) = self.cron_restart {
            crate::cron::parse_schedule(expr)?;
        }

        let valid_signals = [
            "SIGTERM", "SIGINT", "SIGQUIT", "SIGKILL", "SIGHUP", "SIGUSR1", "SIGUSR2",
        ];
        if !valid_signals.contains(&self.stop_signal.as_str()) {
            return Err(VigilError::ConfigValidationError(format!(
                "Invalid stop_signal: {}. Must be one of: {}",
                self.stop_signal,
                valid_signals.join(", ")
            )));
        }

        if let Some(ref cwd) = self.cwd {
            if !cwd.is_dir() {
                return Err(VigilError::ConfigValidationError(format!(
                    "Working directory is not a directory: {}",
                    cwd.display()
                )));
            }
        }

        if self.merge_logs && self.err_file.is_some() {
            return Err(VigilError::ConfigValidationError(format!(
                "App {}: err_file has no effect when merge_logs is set",
                self.name
            )));
        }

        Ok(())
    }

    /// Expand environment variables in spec fields
    fn expand_env_vars(&mut self) {
        self.script = Self::expand_env_in_path(&self.script);

        if let Some(ref cwd) = self.cwd {
            self.cwd = Some(Self::expand_env_in_path(cwd));
        }

        if let Some(ref out) = self.out_file {
            self.out_file = Some(Self::expand_env_in_path(out));
        }

        if let Some(ref err) = self.err_file {
            self.err_file = Some(Self::expand_env_in_path(err));
        }

        self.args = self
            .args
            .iter()
            .map(|arg| Self::expand_env_in_string(arg))
            .collect();

        // Values only; keys are taken literally
        self.env = self
            .env
            .iter()
            .map(|(k, v)| (k.clone(), Self::expand_env_in_string(v)))
            .collect();
    }

    /// Expand `$VAR` and `${VAR}` in a string
    fn expand_env_in_string(s: &str) -> String {
        let mut result = s.to_string();

        for (key, value) in std::env::vars() {
            result = result.replace(&format!("${{{}}}", key), &value);
            result = result.replace(&format!("${}", key), &value);
        }

        result
    }

    fn expand_env_in_path(path: &Path) -> PathBuf {
        let path_str = path.to_string_lossy();
        PathBuf::from(Self::expand_env_in_string(&path_str))
    }

    /// Whether this app is relaunched by the cron scheduler
    pub fn is_cron(&self) -> bool {
        self.cron_restart.is_some()
    }

    pub fn min_uptime(&self) -> Duration {
        Duration::from_millis(self.min_uptime_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }
}

/// Immutable snapshot of all app definitions, loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct SpecRegistry {
    specs: Vec<Arc<ProcessSpec>>,
}

impl SpecRegistry {
    /// Build a registry from validated specs, rejecting duplicate names
    pub fn new(specs: Vec<ProcessSpec>) -> Result<Self> {
        let mut seen = std::collections::HashSet::new();
        for spec in &specs {
            spec.validate()?;
            if !seen.insert(spec.name.clone()) {
                return Err(VigilError::DuplicateApp(spec.name.clone()));
            }
        }

        Ok(Self {
            specs: specs.into_iter().map(Arc::new).collect(),
        })
    }

    /// Load a registry straight from a config file
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::new(ProcessSpec::from_file(path)?)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ProcessSpec>> {
        self.specs.iter().find(|s| s.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ProcessSpec>> {
        self.specs.iter()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn base_spec(name: &str) -> ProcessSpec {
        ProcessSpec {
            name: name.to_string(),
            script: PathBuf::from("/bin/echo"),
            args: vec![],
            cwd: None,
            interpreter: None,
            env: HashMap::new(),
            autorestart: true,
            max_restarts: Some(10),
            min_uptime_ms: default_min_uptime_ms(),
            restart_delay_ms: default_restart_delay_ms(),
            backoff_factor: None,
            max_memory_restart: None,
            cron_restart: None,
            kill_timeout_ms: default_kill_timeout_ms(),
            stop_signal: default_stop_signal(),
            out_file: None,
            err_file: None,
            merge_logs: false,
            log_date_format: None,
        }
    }

    #[test]
    fn test_defaults() {
        let spec = base_spec("defaults");
        assert!(spec.autorestart);
        assert_eq!(spec.min_uptime_ms, 1000);
        assert_eq!(spec.restart_delay_ms, 1000);
        assert_eq!(spec.kill_timeout_ms, 5000);
        assert_eq!(spec.stop_signal, "SIGTERM");
        assert!(!spec.is_cron());
    }

    #[test]
    fn test_validate_valid_spec() {
        assert!(base_spec("ok").validate().is_ok());
    }

    #[test]
    fn test_validate_empty_name() {
        let spec = base_spec("");
        assert!(matches!(
            spec.validate(),
            Err(VigilError::MissingConfigField(_))
        ));
    }

    #[test]
    fn test_validate_cron_excludes_autorestart() {
        let mut spec = base_spec("cron-app");
        spec.cron_restart = Some("*/5 * * * *".to_string());
        assert!(matches!(
            spec.validate(),
            Err(VigilError::ConfigValidationError(_))
        ));

        spec.autorestart = false;
        assert!(spec.validate().is_ok());
        assert!(spec.is_cron());
    }

    #[test]
    fn test_validate_bad_cron_expression() {
        let mut spec = base_spec("bad-cron");
        spec.autorestart = false;
        spec.cron_restart = Some("not a cron expr".to_string());
        assert!(matches!(
            spec.validate(),
            Err(VigilError::InvalidCronExpr(_, _))
        ));
    }

    #[test]
    fn test_validate_invalid_signal() {
        let mut spec = base_spec("bad-signal");
        spec.stop_signal = "INVALID".to_string();
        assert!(matches!(
            spec.validate(),
            Err(VigilError::ConfigValidationError(_))
        ));
    }

    #[test]
    fn test_parse_memory_size() {
        assert_eq!(parse_memory_size("1048576").unwrap(), 1048576);
        assert_eq!(parse_memory_size("512K").unwrap(), 512 * 1024);
        assert_eq!(parse_memory_size("200M").unwrap(), 200 * 1024 * 1024);
        assert_eq!(parse_memory_size("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory_size("2g").unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(parse_memory_size("").is_err());
        assert!(parse_memory_size("abcM").is_err());
    }

    #[test]
    fn test_parse_toml_apps() {
        let toml_content = r#"
            [[apps]]
            name = "bridge"
            script = "bridge.py"
            interpreter = "python3"
            max_memory_restart = "200M"

            [[apps]]
            name = "tunnel"
            script = "/usr/bin/cloudflared"
            args = ["tunnel", "run"]
            restart_delay_ms = 10000
        "#;

        let specs = ProcessSpec::parse_toml(toml_content).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].name, "bridge");
        assert_eq!(specs[0].interpreter, Some(PathBuf::from("python3")));
        assert_eq!(specs[0].max_memory_restart, Some(200 * 1024 * 1024));
        assert_eq!(specs[1].restart_delay_ms, 10000);
        assert!(specs[1].autorestart);
    }

    #[test]
    fn test_parse_json_apps() {
        let json_content = r#"
            {
                "apps": [
                    {
                        "name": "state-push",
                        "script": "state_push.py",
                        "interpreter": "python3",
                        "autorestart": false,
                        "cron_restart": "*/5 * * * *"
                    }
                ]
            }
        "#;

        let specs = ProcessSpec::parse_json(json_content).unwrap();
        assert_eq!(specs.len(), 1);
        assert!(specs[0].is_cron());
        assert!(!specs[0].autorestart);
    }

    #[test]
    fn test_interpreter_none_literal() {
        let json_content = r#"
            {
                "apps": [
                    { "name": "native", "script": "/bin/true", "interpreter": "none" }
                ]
            }
        "#;

        let specs = ProcessSpec::parse_json(json_content).unwrap();
        assert_eq!(specs[0].interpreter, None);
    }

    #[test]
    fn test_from_file_toml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("apps.toml");

        fs::write(
            &config_path,
            r#"
            [[apps]]
            name = "echo"
            script = "/bin/echo"
            args = ["hello"]
        "#,
        )
        .unwrap();

        let specs = ProcessSpec::from_file(&config_path).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "echo");
    }

    #[test]
    fn test_from_file_unsupported_format() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("apps.yaml");
        fs::write(&config_path, "apps: []").unwrap();

        let result = ProcessSpec::from_file(&config_path);
        assert!(matches!(result, Err(VigilError::InvalidConfig(_))));
    }

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("VIGIL_TEST_DIR", "/tmp");

        let mut spec = base_spec("expand");
        spec.script = PathBuf::from("$VIGIL_TEST_DIR/run.sh");
        spec.args = vec!["--root=${VIGIL_TEST_DIR}".to_string()];
        spec.env
            .insert("DATA".to_string(), "$VIGIL_TEST_DIR/data".to_string());
        spec.expand_env_vars();

        assert_eq!(spec.script, PathBuf::from("/tmp/run.sh"));
        assert_eq!(spec.args[0], "--root=/tmp");
        assert_eq!(spec.env.get("DATA"), Some(&"/tmp/data".to_string()));
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let result = SpecRegistry::new(vec![base_spec("dup"), base_spec("dup")]);
        assert!(matches!(result, Err(VigilError::DuplicateApp(_))));
    }

    #[test]
    fn test_registry_lookup() {
        let registry = SpecRegistry::new(vec![base_spec("a"), base_spec("b")]).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.get("a").is_some());
        assert!(registry.get("missing").is_none());
    }
}
