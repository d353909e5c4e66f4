use anyhow::{bail, Context, Result};
use reunite_core::{DistanceMetric, MatcherConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// CLI configuration.
///
/// Resolved from built-in defaults, then an optional TOML file, then
/// `REUNITE_*` environment variables (highest precedence).
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory containing `det_10g.onnx` and `w600k_r50.onnx`.
    pub model_dir: PathBuf,
    /// JSON file holding the registered missing-person embeddings.
    pub gallery_path: PathBuf,
    /// Distance used to compare embeddings.
    pub distance_metric: DistanceMetric,
    /// Maximum distance accepted as a match. Unset means the metric's default.
    pub match_threshold: Option<f32>,
    /// Embedding length the gallery is expected to hold.
    pub embedding_dim: usize,
    /// ONNX Runtime intra-op threads per model.
    pub intra_threads: usize,
    /// Upper bound on identifications in flight during `batch`.
    pub max_concurrency: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_dir: reunite_core::default_model_dir(),
            gallery_path: reunite_core::default_data_dir().join("gallery.json"),
            distance_metric: DistanceMetric::default(),
            match_threshold: None,
            embedding_dim: reunite_core::extractor::ARCFACE_EMBEDDING_DIM,
            intra_threads: 2,
            max_concurrency: 4,
        }
    }
}

impl Config {
    /// Load configuration from `file` (or `$REUNITE_CONFIG`) and the process environment.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        Self::resolve(file, |key| std::env::var(key).ok())
    }

    fn resolve(file: Option<&Path>, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let file = file.map(Path::to_path_buf).or_else(|| env("REUNITE_CONFIG").map(PathBuf::from));

        let mut config = match &file {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                toml::from_str::<Config>(&text)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => Config::default(),
        };

        if let Some(dir) = env("REUNITE_MODEL_DIR") {
            config.model_dir = PathBuf::from(dir);
        }
        if let Some(path) = env("REUNITE_GALLERY_PATH") {
            config.gallery_path = PathBuf::from(path);
        }
        if let Some(metric) = env_parse(&env, "REUNITE_DISTANCE_METRIC") {
            config.distance_metric = metric;
        }
        if let Some(threshold) = env_parse(&env, "REUNITE_MATCH_THRESHOLD") {
            config.match_threshold = Some(threshold);
        }
        if let Some(dim) = env_parse(&env, "REUNITE_EMBEDDING_DIM") {
            config.embedding_dim = dim;
        }
        if let Some(threads) = env_parse(&env, "REUNITE_INTRA_THREADS") {
            config.intra_threads = threads;
        }
        if let Some(n) = env_parse(&env, "REUNITE_MAX_CONCURRENCY") {
            config.max_concurrency = n;
        }

        config.validate()?;
        tracing::debug!(?config, source = ?file, "configuration resolved");
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if let Some(t) = self.match_threshold {
            if !t.is_finite() || t < 0.0 {
                bail!("match_threshold must be a non-negative number, got {t}");
            }
        }
        if self.embedding_dim == 0 {
            bail!("embedding_dim must be > 0");
        }
        if self.intra_threads == 0 {
            bail!("intra_threads must be > 0");
        }
        if self.max_concurrency == 0 {
            bail!("max_concurrency must be > 0");
        }
        Ok(())
    }

    /// Matcher settings, with an optional per-invocation threshold override.
    pub fn matcher_config(&self, threshold_override: Option<f32>) -> Result<MatcherConfig> {
        let threshold = threshold_override
            .or(self.match_threshold)
            .unwrap_or_else(|| self.distance_metric.default_threshold());
        if !threshold.is_finite() || threshold < 0.0 {
            bail!("threshold must be a non-negative number, got {threshold}");
        }
        Ok(MatcherConfig::new(self.distance_metric, threshold))
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join(reunite_core::SCRFD_MODEL_FILE)
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> PathBuf {
        self.model_dir.join(reunite_core::ARCFACE_MODEL_FILE)
    }
}

/// Parse an environment value, ignoring (with a warning) anything malformed.
fn env_parse<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    let raw = env(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "ignoring malformed environment value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::resolve(None, env_of(&[])).unwrap();
        assert_eq!(config.distance_metric, DistanceMetric::Euclidean);
        assert_eq!(config.embedding_dim, 512);
        assert!(config.match_threshold.is_none());
        assert!(config.scrfd_model_path().ends_with("det_10g.onnx"));
        assert!(config.arcface_model_path().ends_with("w600k_r50.onnx"));

        let matcher = config.matcher_config(None).unwrap();
        assert_eq!(matcher.threshold, DistanceMetric::Euclidean.default_threshold());
    }

    #[test]
    fn test_default_paths_share_data_dir() {
        let config = Config::default();
        let data_dir = reunite_core::default_data_dir();
        assert_eq!(config.gallery_path, data_dir.join("gallery.json"));
        assert_eq!(config.model_dir, data_dir.join("models"));
    }

    #[test]
    fn test_env_overrides() {
        let env = env_of(&[
            ("REUNITE_MODEL_DIR", "/opt/models"),
            ("REUNITE_GALLERY_PATH", "/srv/gallery.json"),
            ("REUNITE_DISTANCE_METRIC", "cosine"),
            ("REUNITE_MATCH_THRESHOLD", "0.35"),
            ("REUNITE_EMBEDDING_DIM", "128"),
            ("REUNITE_INTRA_THREADS", "8"),
        ]);
        let config = Config::resolve(None, env).unwrap();
        assert_eq!(config.model_dir, PathBuf::from("/opt/models"));
        assert_eq!(config.gallery_path, PathBuf::from("/srv/gallery.json"));
        assert_eq!(config.distance_metric, DistanceMetric::Cosine);
        assert_eq!(config.match_threshold, Some(0.35));
        assert_eq!(config.embedding_dim, 128);
        assert_eq!(config.intra_threads, 8);
    }

    #[test]
    fn test_malformed_env_is_ignored() {
        let env = env_of(&[("REUNITE_MATCH_THRESHOLD", "loose"), ("REUNITE_DISTANCE_METRIC", "hamming")]);
        let config = Config::resolve(None, env).unwrap();
        assert!(config.match_threshold.is_none());
        assert_eq!(config.distance_metric, DistanceMetric::Euclidean);
    }

    #[test]
    fn test_toml_file_then_env() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "model_dir = \"/models\"\ndistance_metric = \"cosine\"\nmatch_threshold = 0.5\nmax_concurrency = 2"
        )
        .unwrap();

        let config = Config::resolve(Some(file.path()), env_of(&[])).unwrap();
        assert_eq!(config.model_dir, PathBuf::from("/models"));
        assert_eq!(config.distance_metric, DistanceMetric::Cosine);
        assert_eq!(config.match_threshold, Some(0.5));
        assert_eq!(config.max_concurrency, 2);
        // Unset keys keep their defaults.
        assert_eq!(config.embedding_dim, 512);

        let env = env_of(&[("REUNITE_MATCH_THRESHOLD", "0.25")]);
        let config = Config::resolve(Some(file.path()), env).unwrap();
        assert_eq!(config.match_threshold, Some(0.25));
    }

    #[test]
    fn test_config_path_from_env() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "embedding_dim = 128").unwrap();
        let path = file.path().to_string_lossy().into_owned();
        let config = Config::resolve(None, env_of(&[("REUNITE_CONFIG", path.as_str())])).unwrap();
        assert_eq!(config.embedding_dim, 128);
    }

    #[test]
    fn test_unknown_toml_key_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "treshold = 0.5").unwrap();
        assert!(Config::resolve(Some(file.path()), env_of(&[])).is_err());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(Config::resolve(None, env_of(&[("REUNITE_MATCH_THRESHOLD", "-1")])).is_err());
        assert!(Config::resolve(None, env_of(&[("REUNITE_EMBEDDING_DIM", "0")])).is_err());
        assert!(Config::resolve(None, env_of(&[("REUNITE_MAX_CONCURRENCY", "0")])).is_err());
    }

    #[test]
    fn test_threshold_override() {
        let config = Config::resolve(None, env_of(&[("REUNITE_MATCH_THRESHOLD", "0.9")])).unwrap();
        assert_eq!(config.matcher_config(None).unwrap().threshold, 0.9);
        assert_eq!(config.matcher_config(Some(1.3)).unwrap().threshold, 1.3);
        assert!(config.matcher_config(Some(f32::NAN)).is_err());
    }
}
