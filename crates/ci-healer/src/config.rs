//! HealerConfig — explicit configuration record built from environment
//! variables (spec §6). Following the teacher's `ota::self_builder::BuildConfig`
//! / `ota::OtaConfig` pattern: a plain struct with a `Default` impl and a
//! `from_env()` constructor, not a dynamic settings singleton.

use std::path::PathBuf;
use std::time::Duration;

/// Which LLM capability binding to use, selected via `LLM_PROVIDER`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LlmProviderKind {
    OpenAi,
    Anthropic,
    Mock,
}

impl LlmProviderKind {
    fn from_env_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "openai" => LlmProviderKind::OpenAi,
            "anthropic" => LlmProviderKind::Anthropic,
            _ => LlmProviderKind::Mock,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealerConfig {
    /// Which capability binding to use (`LLM_PROVIDER`).
    pub llm_provider: LlmProviderKind,
    /// Provider API key, e.g. `OPENAI_API_KEY` / `ANTHROPIC_API_KEY`.
    pub llm_api_key: Option<String>,
    /// Provider model name, e.g. `OPENAI_MODEL`.
    pub llm_model: String,
    /// `GITHUB_TOKEN` — enables push; absence forces local-only commits.
    pub github_token: Option<String>,
    /// `MAX_RETRIES` — upper bound on pipeline iterations. Default 5.
    pub max_retries: u32,
    /// `PATCH_MAX_LINES` — diff-size gate. Default 50.
    pub patch_max_lines: usize,
    /// `RANDOM_SEED` — deterministic LLM seed. Default 42.
    pub random_seed: u64,
    /// `USE_DOCKER_SANDBOX` — route subprocess execution through a container.
    pub use_docker_sandbox: bool,
    /// `SANDBOX_DOCKER_IMAGE` — image the sandbox container runs.
    pub sandbox_docker_image: String,
    /// `SANDBOX_MEMORY_LIMIT` — container memory limit, passed through verbatim to `docker run --memory`.
    pub sandbox_memory_limit: Option<String>,
    /// `SANDBOX_CPU_QUOTA` — container CPU quota, passed through verbatim to `docker run --cpu-quota`.
    pub sandbox_cpu_quota: Option<String>,
    /// `RESULTS_DIR` — where result artifacts are written.
    pub results_dir: PathBuf,
    /// `WORKSPACE_DIR` — root under which repositories are cloned.
    pub workspace_dir: PathBuf,

    /// Per-stage subprocess timeouts (spec §4.2, not independently
    /// configurable in §6 but kept here so callers have one place to look).
    pub python_test_timeout: Duration,
    pub node_test_timeout: Duration,
    pub java_test_timeout: Duration,
    /// Per-LLM-request timeout (spec §5): 30s.
    pub llm_request_timeout: Duration,
    /// Bounded worker pool size for root-cause resolution (spec §4.4): 4.
    pub resolver_worker_pool: usize,
    /// Defensive recursion cap on pipeline graph transitions (spec §5): 50.
    pub max_graph_transitions: u32,
}

impl Default for HealerConfig {
    fn default() -> Self {
        Self {
            llm_provider: LlmProviderKind::Mock,
            llm_api_key: None,
            llm_model: "gpt-4o-mini".to_string(),
            github_token: None,
            max_retries: 5,
            patch_max_lines: 50,
            random_seed: 42,
            use_docker_sandbox: false,
            sandbox_docker_image: "autonomous-healing-sandbox:latest".to_string(),
            sandbox_memory_limit: None,
            sandbox_cpu_quota: None,
            results_dir: PathBuf::from("./results"),
            workspace_dir: PathBuf::from("./workspace"),
            python_test_timeout: Duration::from_secs(120),
            node_test_timeout: Duration::from_secs(180),
            java_test_timeout: Duration::from_secs(300),
            llm_request_timeout: Duration::from_secs(30),
            resolver_worker_pool: 4,
            max_graph_transitions: 50,
        }
    }
}

impl HealerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let provider = std::env::var("LLM_PROVIDER")
            .map(|s| LlmProviderKind::from_env_str(&s))
            .unwrap_or(defaults.llm_provider);

        let llm_api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok());

        let llm_model = std::env::var("OPENAI_MODEL")
            .or_else(|_| std::env::var("ANTHROPIC_MODEL"))
            .unwrap_or(defaults.llm_model);

        let github_token = std::env::var("GITHUB_TOKEN").ok();

        let max_retries = env_u32("MAX_RETRIES", defaults.max_retries);
        let patch_max_lines = env_u32("PATCH_MAX_LINES", defaults.patch_max_lines as u32) as usize;
        let random_seed = std::env::var("RANDOM_SEED")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.random_seed);

        let use_docker_sandbox = std::env::var("USE_DOCKER_SANDBOX")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let sandbox_docker_image = std::env::var("SANDBOX_DOCKER_IMAGE").unwrap_or(defaults.sandbox_docker_image);
        let sandbox_memory_limit = std::env::var("SANDBOX_MEMORY_LIMIT").ok();
        let sandbox_cpu_quota = std::env::var("SANDBOX_CPU_QUOTA").ok();

        let results_dir = std::env::var("RESULTS_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.results_dir);
        let workspace_dir = std::env::var("WORKSPACE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.workspace_dir);

        Self {
            llm_provider: provider,
            llm_api_key,
            llm_model,
            github_token,
            max_retries,
            patch_max_lines,
            random_seed,
            use_docker_sandbox,
            sandbox_docker_image,
            sandbox_memory_limit,
            sandbox_cpu_quota,
            results_dir,
            workspace_dir,
            ..defaults
        }
    }

    pub fn llm_enabled(&self) -> bool {
        self.llm_provider != LlmProviderKind::Mock && self.llm_api_key.is_some()
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = HealerConfig::default();
        assert_eq!(cfg.max_retries, 5);
        assert_eq!(cfg.patch_max_lines, 50);
        assert_eq!(cfg.random_seed, 42);
        assert!(!cfg.use_docker_sandbox);
        assert_eq!(cfg.sandbox_docker_image, "autonomous-healing-sandbox:latest");
        assert_eq!(cfg.python_test_timeout, Duration::from_secs(120));
        assert_eq!(cfg.node_test_timeout, Duration::from_secs(180));
        assert_eq!(cfg.java_test_timeout, Duration::from_secs(300));
    }

    #[test]
    fn llm_disabled_without_api_key() {
        let cfg = HealerConfig {
            llm_provider: LlmProviderKind::OpenAi,
            llm_api_key: None,
            ..HealerConfig::default()
        };
        assert!(!cfg.llm_enabled());
    }
}
