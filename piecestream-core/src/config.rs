//! Centralized configuration for Piecestream.
//!
//! Tunable parameters for the streaming reader, the priority window and the
//! simulated download engine.

use std::time::Duration;

/// Central configuration for all Piecestream components.
///
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct PiecestreamConfig {
    pub streaming: StreamingConfig,
    pub priority: PriorityConfig,
    pub simulation: SimulationConfig,
}

/// Reader session settings.
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// Read-ahead capacity in each direction around the cursor
    pub buffer_size: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            buffer_size: 128 * 1024, // 128 KiB
        }
    }
}

/// Sliding window settings.
///
/// The window length is derived from the piece size unless `window_pieces`
/// pins it explicitly.
#[derive(Debug, Clone)]
pub struct PriorityConfig {
    /// Explicit window length in pieces, overriding the byte-based sizing
    pub window_pieces: Option<u32>,
    /// Bytes of playback the window should cover
    pub window_bytes: u64,
    /// Lower bound for the derived window length
    pub min_window_pieces: u32,
    /// Upper bound for the derived window length
    pub max_window_pieces: u32,
    /// Trailing pieces of each session kept at footer priority
    pub footer_pieces: u32,
}

/// Largest window that still yields strictly descending priorities.
pub const MAX_WINDOW_PIECES: u32 = 200;

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            window_pieces: None,
            window_bytes: 8 * 1024 * 1024, // 8 MiB
            min_window_pieces: 2,
            max_window_pieces: 64,
            footer_pieces: 0,
        }
    }
}

impl PriorityConfig {
    /// Window length `K` for pieces of `piece_size` bytes.
    pub fn window_pieces(&self, piece_size: u64) -> u32 {
        let pieces = match self.window_pieces {
            Some(pieces) => pieces,
            None => {
                let derived = self.window_bytes / piece_size.max(1);
                let derived = u32::try_from(derived).unwrap_or(u32::MAX);
                let min = self.min_window_pieces.max(1);
                derived.clamp(min, self.max_window_pieces.max(min))
            }
        };
        pieces.clamp(1, MAX_WINDOW_PIECES)
    }
}

/// Simulated download engine configuration.
///
/// Deterministic when `seed` is set, so integration tests reproduce exactly.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Deterministic seed for reproducible simulations
    pub seed: Option<u64>,
    /// Simulated latency per piece fetch
    pub latency: Duration,
    /// Probability (0.0 to 1.0) that a fetched piece arrives corrupted
    pub failure_rate: f64,
    /// Attempts per piece before it is left failed
    pub max_attempts: u32,
    /// Pieces fetched concurrently
    pub concurrency: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: None,
            latency: Duration::from_millis(20),
            failure_rate: 0.0,
            max_attempts: 5,
            concurrency: 4,
        }
    }
}

impl SimulationConfig {
    /// Creates a configuration for deterministic testing.
    pub fn deterministic_testing() -> Self {
        Self {
            seed: Some(42),
            latency: Duration::from_millis(1),
            failure_rate: 0.0,
            max_attempts: 5,
            concurrency: 2,
        }
    }
}

impl PiecestreamConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Unparseable values are ignored and the default is kept.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(size) = env_parse::<usize>("PIECESTREAM_BUFFER_SIZE") {
            config.streaming.buffer_size = size;
        }

        if let Some(pieces) = env_parse::<u32>("PIECESTREAM_WINDOW_PIECES") {
            config.priority.window_pieces = Some(pieces);
        }
        if let Some(bytes) = env_parse::<u64>("PIECESTREAM_WINDOW_BYTES") {
            config.priority.window_bytes = bytes;
        }
        if let Some(pieces) = env_parse::<u32>("PIECESTREAM_FOOTER_PIECES") {
            config.priority.footer_pieces = pieces;
        }

        if let Some(seed) = env_parse::<u64>("PIECESTREAM_SIMULATION_SEED") {
            config.simulation.seed = Some(seed);
        }
        if let Some(millis) = env_parse::<u64>("PIECESTREAM_SIMULATION_LATENCY_MS") {
            config.simulation.latency = Duration::from_millis(millis);
        }
        if let Some(rate) = env_parse::<f64>("PIECESTREAM_SIMULATION_FAILURE_RATE") {
            config.simulation.failure_rate = rate.clamp(0.0, 1.0);
        }

        config
    }

    /// Creates a configuration optimized for testing.
    pub fn for_testing() -> Self {
        Self {
            streaming: StreamingConfig { buffer_size: 16 },
            priority: PriorityConfig {
                window_pieces: Some(4),
                ..PriorityConfig::default()
            },
            simulation: SimulationConfig::deterministic_testing(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = PiecestreamConfig::default();

        assert_eq!(config.streaming.buffer_size, 131_072);
        assert_eq!(config.priority.window_pieces, None);
        assert_eq!(config.priority.footer_pieces, 0);
        assert_eq!(config.simulation.max_attempts, 5);
        assert_eq!(config.simulation.seed, None);
    }

    #[test]
    fn test_window_is_derived_from_piece_size() {
        let config = PriorityConfig::default();

        assert_eq!(config.window_pieces(1024 * 1024), 8);
        assert_eq!(config.window_pieces(16 * 1024), 64);
        assert_eq!(config.window_pieces(16 * 1024 * 1024), 2);
        assert_eq!(config.window_pieces(0), 64);
    }

    #[test]
    fn test_explicit_window_is_clamped() {
        let mut config = PriorityConfig {
            window_pieces: Some(5),
            ..PriorityConfig::default()
        };
        assert_eq!(config.window_pieces(1), 5);

        config.window_pieces = Some(0);
        assert_eq!(config.window_pieces(1), 1);

        config.window_pieces = Some(10_000);
        assert_eq!(config.window_pieces(1), MAX_WINDOW_PIECES);
    }

    #[test]
    fn test_config_presets() {
        let testing = PiecestreamConfig::for_testing();
        assert_eq!(testing.simulation.seed, Some(42));
        assert_eq!(testing.priority.window_pieces, Some(4));
        assert_eq!(testing.simulation.failure_rate, 0.0);
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("PIECESTREAM_BUFFER_SIZE", "4096");
            std::env::set_var("PIECESTREAM_WINDOW_PIECES", "12");
            std::env::set_var("PIECESTREAM_FOOTER_PIECES", "3");
            std::env::set_var("PIECESTREAM_SIMULATION_SEED", "12345");
            std::env::set_var("PIECESTREAM_SIMULATION_LATENCY_MS", "7");
            std::env::set_var("PIECESTREAM_SIMULATION_FAILURE_RATE", "2.5");
        }

        let config = PiecestreamConfig::from_env();

        assert_eq!(config.streaming.buffer_size, 4096);
        assert_eq!(config.priority.window_pieces, Some(12));
        assert_eq!(config.priority.footer_pieces, 3);
        assert_eq!(config.simulation.seed, Some(12345));
        assert_eq!(config.simulation.latency, Duration::from_millis(7));
        assert_eq!(config.simulation.failure_rate, 1.0);

        // Cleanup
        unsafe {
            std::env::remove_var("PIECESTREAM_BUFFER_SIZE");
            std::env::remove_var("PIECESTREAM_WINDOW_PIECES");
            std::env::remove_var("PIECESTREAM_FOOTER_PIECES");
            std::env::remove_var("PIECESTREAM_SIMULATION_SEED");
            std::env::remove_var("PIECESTREAM_SIMULATION_LATENCY_MS");
            std::env::remove_var("PIECESTREAM_SIMULATION_FAILURE_RATE");
        }
    }
}
