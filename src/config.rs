use std::{fmt, fs, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::GpioError;

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    In,
    Out,
    /// Output, driven high as part of the direction change.
    OutHigh,
    /// Output, driven low as part of the direction change.
    OutLow,
}

impl Direction {
    pub fn is_output(&self) -> bool {
        !matches!(self, Direction::In)
    }

    /// The token the kernel expects in the `direction` attribute.
    pub fn as_sysfs(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
            Direction::OutHigh => "high",
            Direction::OutLow => "low",
        }
    }
}

impl FromStr for Direction {
    type Err = GpioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "in" => Ok(Direction::In),
            "out" => Ok(Direction::Out),
            "high" | "out-high" => Ok(Direction::OutHigh),
            "low" | "out-low" => Ok(Direction::OutLow),
            other => Err(GpioError::InvalidValue(format!("unknown direction {other:?}"))),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sysfs())
    }
}

#[derive(Debug, Default, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Edge {
    #[default]
    None,
    Rising,
    Falling,
    Both,
}

impl Edge {
    pub fn as_sysfs(&self) -> &'static str {
        match self {
            Edge::None => "none",
            Edge::Rising => "rising",
            Edge::Falling => "falling",
            Edge::Both => "both",
        }
    }
}

impl FromStr for Edge {
    type Err = GpioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "none" => Ok(Edge::None),
            "rising" => Ok(Edge::Rising),
            "falling" => Ok(Edge::Falling),
            "both" => Ok(Edge::Both),
            other => Err(GpioError::InvalidValue(format!("unknown edge {other:?}"))),
        }
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sysfs())
    }
}

/// Watch behaviour of a line, fixed when the line is opened.
#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct WatchOptions {
    /// Keep delivering on every edge instead of firing once per `watch`.
    pub persistent_watch: bool,
    /// Window after a delivery during which the line is not re-armed.
    pub debounce_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct LineConfig {
    pub id: u32,
    pub direction: Direction,
    #[serde(default)]
    pub edge: Option<Edge>,
    #[serde(default)]
    pub options: WatchOptions,
}

impl LineConfig {
    pub fn new(id: u32, direction: Direction) -> Self {
        Self {
            id,
            direction,
            edge: None,
            options: WatchOptions::default(),
        }
    }

    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edge = Some(edge);
        self
    }

    pub fn with_options(mut self, options: WatchOptions) -> Self {
        self.options = options;
        self
    }
}

fn default_capacity() -> usize {
    64
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub sysfs_root: Option<String>,
    pub lines: Vec<LineConfig>,
    #[serde(default = "default_capacity")]
    pub broadcast_capacity: usize,
    #[serde(default = "default_capacity")]
    pub event_history_capacity: usize,
    #[serde(default)]
    pub unexport_on_exit: bool,
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, GpioError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| GpioError::Config(format!("Failed to read config: {e}")))?;
        serde_json::from_str(&contents)
            .map_err(|e| GpioError::Config(format!("Invalid config json: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_line_config_with_defaults() {
        let cfg: AppConfig = serde_json::from_str(
            r#"
            {
                "lines": [
                    { "id": 4, "direction": "out-high" },
                    {
                        "id": 17,
                        "direction": "in",
                        "edge": "both",
                        "options": { "persistent_watch": true, "debounce_timeout_ms": 20 }
                    }
                ]
            }
            "#,
        )
        .expect("valid config");

        assert_eq!(cfg.broadcast_capacity, 64);
        assert!(!cfg.unexport_on_exit);
        assert_eq!(cfg.lines[0], LineConfig::new(4, Direction::OutHigh));
        assert_eq!(cfg.lines[1].edge, Some(Edge::Both));
        assert_eq!(
            cfg.lines[1].options,
            WatchOptions {
                persistent_watch: true,
                debounce_timeout_ms: 20,
            }
        );
    }

    #[test]
    fn direction_maps_to_kernel_tokens() {
        assert_eq!(Direction::OutHigh.as_sysfs(), "high");
        assert_eq!(Direction::OutLow.to_string(), "low");
        assert_eq!("out\n".parse::<Direction>(), Ok(Direction::Out));
        assert!(Direction::OutLow.is_output());
        assert!(!Direction::In.is_output());
        assert!("sideways".parse::<Direction>().is_err());
    }

    #[test]
    fn missing_config_file_is_config_error() {
        let err = AppConfig::load_from_file("/nonexistent/sgpio.json").unwrap_err();
        assert!(matches!(err, GpioError::Config(_)));
    }
}
