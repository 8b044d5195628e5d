//! Configuration types for controlling a conjecture run.

use std::time::Duration;

#[cfg(feature = "persistence")]
use serde::{Deserialize, Serialize};

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Invalid number of examples (must be > 0)
    InvalidMaxExamples(usize),
    /// Invalid iteration budget (must be >= max_examples)
    InvalidMaxIterations(usize),
    /// Invalid buffer size (must be > 0)
    InvalidBufferSize(usize),
    /// Invalid cache size (must be > 0)
    InvalidCacheSize(usize),
    /// Invalid max depth (must be > 0)
    InvalidMaxDepth(usize),
    /// A probability outside of [0, 1]
    InvalidProbability(f64),
    /// No phase enabled
    NoPhases,
    /// Settings could not be read or parsed
    Load(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidMaxExamples(n) => {
                write!(f, "Invalid max examples: {} (must be > 0)", n)
            }
            ConfigError::InvalidMaxIterations(n) => {
                write!(
                    f,
                    "Invalid max iterations: {} (must be at least max examples)",
                    n
                )
            }
            ConfigError::InvalidBufferSize(n) => {
                write!(f, "Invalid buffer size: {} (must be > 0)", n)
            }
            ConfigError::InvalidCacheSize(n) => {
                write!(f, "Invalid cache size: {} (must be > 0)", n)
            }
            ConfigError::InvalidMaxDepth(n) => {
                write!(f, "Invalid max depth: {} (must be > 0)", n)
            }
            ConfigError::InvalidProbability(p) => {
                write!(f, "Invalid probability: {} (must be in [0, 1])", p)
            }
            ConfigError::NoPhases => write!(f, "At least one phase must be enabled"),
            ConfigError::Load(message) => write!(f, "Could not load settings: {}", message),
        }
    }
}

impl std::error::Error for ConfigError {}

/// The phases a runner moves through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "persistence", derive(Serialize, Deserialize))]
pub enum Phase {
    /// Replay examples saved in the database
    Reuse,
    /// Generate fresh examples
    Generate,
    /// Hill-climb target observations
    Target,
    /// Shrink interesting examples
    Shrink,
}

impl Phase {
    /// Every phase, in execution order
    pub fn all() -> Vec<Phase> {
        vec![Phase::Reuse, Phase::Generate, Phase::Target, Phase::Shrink]
    }
}

/// Tuning constants for `integer_range`.
///
/// The drawn value always shrinks towards the center. These only shape the
/// distribution seen during generation.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "persistence", derive(Serialize, Deserialize))]
pub struct IntegerRangeBias {
    /// Probability of drawing above the center when it is strictly inside the range
    pub above_chance: f64,
    /// Ranges wider than this many bits are usually narrowed to one of `sizes`
    pub wide_range_bits: u32,
    /// Candidate bit widths for narrowed draws
    pub sizes: Vec<u32>,
    /// Relative weight of each entry of `sizes`
    pub size_weights: Vec<f64>,
}

impl Default for IntegerRangeBias {
    fn default() -> Self {
        Self {
            above_chance: 0.5,
            wide_range_bits: 24,
            sizes: vec![8, 16, 32, 64],
            size_weights: vec![4.0, 8.0, 1.0, 1.0],
        }
    }
}

impl IntegerRangeBias {
    /// Validate the bias constants
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.above_chance) {
            return Err(ConfigError::InvalidProbability(self.above_chance));
        }
        Ok(())
    }
}

/// Budget for shrinking a single interesting example
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "persistence", derive(Serialize, Deserialize))]
pub struct ShrinkSettings {
    /// Maximum number of test function calls made by one shrinker
    pub max_calls: usize,
    /// Optional wall-clock budget for one shrinker
    pub timeout: Option<Duration>,
}

impl Default for ShrinkSettings {
    fn default() -> Self {
        Self {
            max_calls: 10_000,
            timeout: None,
        }
    }
}

/// Settings for a [`ConjectureRunner`](crate::engine::ConjectureRunner)
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "persistence", derive(Serialize, Deserialize))]
pub struct RunnerSettings {
    /// Number of valid examples to generate before stopping
    pub max_examples: usize,
    /// Total number of test function calls allowed during generation
    pub max_iterations: usize,
    /// Number of successful shrinks after which the run stops
    pub max_shrinks: usize,
    /// Maximum number of bytes a single test case may draw
    pub buffer_size: usize,
    /// Capacity of the buffer → result cache
    pub cache_size: usize,
    /// Maximum example nesting depth before a test case is marked invalid
    pub max_depth: usize,
    /// Enabled phases
    pub phases: Vec<Phase>,
    /// Keep generating after the first bug to look for distinct failures
    pub report_multiple_bugs: bool,
    /// Seed for reproducible runs
    pub seed: Option<u64>,
    /// Key under which examples are saved in the database
    pub database_key: Option<Vec<u8>>,
    /// Wall-clock budget for the whole run, checked between test cases
    pub timeout: Option<Duration>,
    /// Consecutive non-improving attempts before the optimiser changes strategy
    pub optimiser_max_failures: usize,
    /// Budget for each shrinker
    pub shrink: ShrinkSettings,
    /// Distribution constants for `integer_range`
    pub integer_range_bias: IntegerRangeBias,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            max_examples: 100,
            max_iterations: 1000,
            max_shrinks: 500,
            buffer_size: 8 * 1024,
            cache_size: 10_000,
            max_depth: 100,
            phases: Phase::all(),
            report_multiple_bugs: true,
            seed: None,
            database_key: None,
            timeout: None,
            optimiser_max_failures: 10,
            shrink: ShrinkSettings::default(),
            integer_range_bias: IntegerRangeBias::default(),
        }
    }
}

impl RunnerSettings {
    /// Create new settings with validation
    pub fn new(
        max_examples: usize,
        buffer_size: usize,
        phases: Vec<Phase>,
        seed: Option<u64>,
    ) -> Result<Self, ConfigError> {
        let settings = Self {
            max_examples,
            max_iterations: (max_examples * 10).max(1000),
            buffer_size,
            phases,
            seed,
            ..Self::default()
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_examples == 0 {
            return Err(ConfigError::InvalidMaxExamples(self.max_examples));
        }
        if self.max_iterations < self.max_examples {
            return Err(ConfigError::InvalidMaxIterations(self.max_iterations));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::InvalidBufferSize(self.buffer_size));
        }
        if self.cache_size == 0 {
            return Err(ConfigError::InvalidCacheSize(self.cache_size));
        }
        if self.max_depth == 0 {
            return Err(ConfigError::InvalidMaxDepth(self.max_depth));
        }
        if self.phases.is_empty() {
            return Err(ConfigError::NoPhases);
        }
        self.integer_range_bias.validate()?;
        Ok(())
    }

    /// Whether `phase` is enabled
    pub fn has_phase(&self, phase: Phase) -> bool {
        self.phases.contains(&phase)
    }

    /// Set the number of valid examples, scaling the iteration budget with it
    pub fn with_max_examples(mut self, max_examples: usize) -> Self {
        self.max_examples = max_examples;
        self.max_iterations = (max_examples * 10).max(1000);
        self
    }

    /// Set the iteration budget
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the number of successful shrinks allowed
    pub fn with_max_shrinks(mut self, max_shrinks: usize) -> Self {
        self.max_shrinks = max_shrinks;
        self
    }

    /// Set the per-test-case buffer size
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Set the enabled phases
    pub fn with_phases(mut self, phases: Vec<Phase>) -> Self {
        self.phases = phases;
        self
    }

    /// Set the seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Set the database key
    pub fn with_database_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.database_key = Some(key.into());
        self
    }

    /// Set the wall-clock budget
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Stop generating once the first bug is found
    pub fn report_first_bug_only(mut self) -> Self {
        self.report_multiple_bugs = false;
        self
    }

    /// Set the shrink budget
    pub fn with_shrink_settings(mut self, shrink: ShrinkSettings) -> Self {
        self.shrink = shrink;
        self
    }
}

#[cfg(feature = "persistence")]
impl RunnerSettings {
    /// Parse settings from JSON and validate them
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let settings: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Load(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Serialize settings to pretty-printed JSON
    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Load(e.to_string()))
    }

    /// Load settings from a JSON file
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let json =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Load(e.to_string()))?;
        Self::from_json(&json)
    }

    /// Save settings to a JSON file
    pub fn save<P: AsRef<std::path::Path>>(&self, path: P) -> Result<(), ConfigError> {
        let json = self.to_json()?;
        std::fs::write(path, json).map_err(|e| ConfigError::Load(e.to_string()))
    }
}

/// Configuration for sharded parallel runs
#[derive(Debug, Clone)]
pub struct ParallelSettings {
    /// Number of independent runners
    pub num_shards: usize,
    /// Whether to run shards on separate threads
    pub enabled: bool,
}

impl Default for ParallelSettings {
    fn default() -> Self {
        Self {
            num_shards: num_cpus::get(),
            enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = RunnerSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.max_examples, 100);
        assert_eq!(settings.optimiser_max_failures, 10);
        assert!(settings.has_phase(Phase::Shrink));
    }

    #[test]
    fn test_new_validates() {
        assert_eq!(
            RunnerSettings::new(0, 1024, Phase::all(), None),
            Err(ConfigError::InvalidMaxExamples(0))
        );
        assert_eq!(
            RunnerSettings::new(10, 0, Phase::all(), None),
            Err(ConfigError::InvalidBufferSize(0))
        );
        assert_eq!(
            RunnerSettings::new(10, 1024, vec![], None),
            Err(ConfigError::NoPhases)
        );

        let settings = RunnerSettings::new(500, 1024, vec![Phase::Generate], Some(3)).unwrap();
        assert_eq!(settings.max_iterations, 5000);
        assert!(!settings.has_phase(Phase::Shrink));
    }

    #[test]
    fn test_builder_methods() {
        let settings = RunnerSettings::default()
            .with_max_examples(20)
            .with_seed(42)
            .with_database_key(b"key".to_vec())
            .with_timeout(Duration::from_secs(5))
            .report_first_bug_only();

        assert_eq!(settings.max_examples, 20);
        assert_eq!(settings.max_iterations, 1000);
        assert_eq!(settings.seed, Some(42));
        assert_eq!(settings.database_key.as_deref(), Some(&b"key"[..]));
        assert!(!settings.report_multiple_bugs);
    }

    #[test]
    fn test_invalid_bias_rejected() {
        let mut settings = RunnerSettings::default();
        settings.integer_range_bias.above_chance = 1.5;
        assert_eq!(
            settings.validate(),
            Err(ConfigError::InvalidProbability(1.5))
        );
    }

    #[test]
    fn test_config_error_display() {
        assert!(ConfigError::InvalidCacheSize(0).to_string().contains("cache size"));
        assert!(ConfigError::NoPhases.to_string().contains("phase"));
    }

    #[cfg(feature = "persistence")]
    mod persistence_tests {
        use super::*;
        use tempfile::TempDir;

        #[test]
        fn test_json_round_trip() {
            let settings = RunnerSettings::default()
                .with_max_examples(50)
                .with_seed(9);
            let json = settings.to_json().unwrap();
            let restored = RunnerSettings::from_json(&json).unwrap();
            assert_eq!(settings, restored);
        }

        #[test]
        fn test_from_json_validates() {
            let mut settings = RunnerSettings::default();
            settings.buffer_size = 0;
            let json = serde_json::to_string(&settings).unwrap();
            assert_eq!(
                RunnerSettings::from_json(&json),
                Err(ConfigError::InvalidBufferSize(0))
            );
            assert!(matches!(
                RunnerSettings::from_json("{not json"),
                Err(ConfigError::Load(_))
            ));
        }

        #[test]
        fn test_save_and_load() {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("settings.json");
            let settings = RunnerSettings::default().with_phases(vec![Phase::Generate]);
            settings.save(&path).unwrap();
            assert_eq!(RunnerSettings::load(&path).unwrap(), settings);
        }
    }
}
