use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use roxmltree::{Document, Node};

use crate::error::ConfigError;

/// Names of the POSIX objects used for the step transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_request_queue")]
    pub request_queue: String,
    #[serde(default = "default_request_region")]
    pub request_region: String,
    #[serde(default = "default_response_queue")]
    pub response_queue: String,
    #[serde(default = "default_response_region")]
    pub response_region: String,
}

fn default_request_queue() -> String {
    "/taosim-req".to_string()
}

fn default_request_region() -> String {
    "/state".to_string()
}

fn default_response_queue() -> String {
    "/taosim-res".to_string()
}

fn default_response_region() -> String {
    "/responses".to_string()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_queue: default_request_queue(),
            request_region: default_request_region(),
            response_queue: default_response_queue(),
            response_region: default_response_region(),
        }
    }
}

/// Parameters of the per-step ledger bookkeeping and the reward model contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Simulation-time width of one trade volume bucket (ns).
    #[serde(default = "default_sampling_interval")]
    pub trade_volume_sampling_interval: i64,

    /// Simulation-time span of trade volume kept for activity assessment (ns).
    #[serde(default = "default_assessment_period")]
    pub trade_volume_assessment_period: i64,

    /// Number of inventory observations retained per agent.
    #[serde(default = "default_lookback")]
    pub sharpe_lookback: usize,

    #[serde(default = "default_normalization_min")]
    pub sharpe_normalization_min: f64,

    #[serde(default = "default_normalization_max")]
    pub sharpe_normalization_max: f64,

    /// Turnover of initial capital allowed per assessment period.
    #[serde(default = "default_capital_turnover_cap")]
    pub capital_turnover_cap: f64,
}

fn default_sampling_interval() -> i64 {
    600_000_000_000
}

fn default_assessment_period() -> i64 {
    86_400_000_000_000
}

fn default_lookback() -> usize {
    1440
}

fn default_normalization_min() -> f64 {
    -10.0
}

fn default_normalization_max() -> f64 {
    10.0
}

fn default_capital_turnover_cap() -> f64 {
    20.0
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            trade_volume_sampling_interval: default_sampling_interval(),
            trade_volume_assessment_period: default_assessment_period(),
            sharpe_lookback: default_lookback(),
            sharpe_normalization_min: default_normalization_min(),
            sharpe_normalization_max: default_normalization_max(),
            capital_turnover_cap: default_capital_turnover_cap(),
        }
    }
}

/// Retention policy for the engine's log output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Directory holding one output directory per run. Defaults to the parent of the run's log directory.
    #[serde(default)]
    pub outputs_dir: Option<String>,

    /// Fraction of disk usage above which old run outputs are deleted.
    #[serde(default = "default_disk_usage_limit")]
    pub disk_usage_limit: f64,

    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
}

fn default_disk_usage_limit() -> f64 {
    0.85
}

fn default_retention_days() -> i64 {
    7
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            outputs_dir: None,
            disk_usage_limit: default_disk_usage_limit(),
            retention_days: default_retention_days(),
        }
    }
}

/// Top-level configuration for the bridge process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Directory for checkpoints and error dumps.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    /// Path of the engine's XML configuration file.
    #[serde(default = "default_simulation_config")]
    pub simulation_config: String,

    /// Port of the notification channel.
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Error reports tolerated per run before the engine is told to stop.
    #[serde(default = "default_error_report_threshold")]
    pub error_report_threshold: u32,

    /// Poll interval of the join on in-flight reward and maintenance duties.
    #[serde(default = "default_join_poll_interval_ms")]
    pub join_poll_interval_ms: u64,

    /// Number of step-rate samples kept.
    #[serde(default = "default_step_rate_window")]
    pub step_rate_window: usize,

    /// Market trades remembered per book.
    #[serde(default = "default_recent_trades")]
    pub recent_trades_per_book: usize,

    /// Trades remembered per agent and book.
    #[serde(default = "default_recent_agent_trades")]
    pub recent_agent_trades: usize,

    #[serde(default)]
    pub reporting_disabled: bool,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub scoring: ScoringConfig,

    #[serde(default)]
    pub archive: ArchiveConfig,
}

fn default_state_dir() -> String {
    "state".to_string()
}

fn default_simulation_config() -> String {
    "simulation_0.xml".to_string()
}

fn default_http_port() -> u16 {
    8000
}

fn default_error_report_threshold() -> u32 {
    10
}

fn default_join_poll_interval_ms() -> u64 {
    500
}

fn default_step_rate_window() -> usize {
    10_000
}

fn default_recent_trades() -> usize {
    25
}

fn default_recent_agent_trades() -> usize {
    5
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            simulation_config: default_simulation_config(),
            http_port: default_http_port(),
            error_report_threshold: default_error_report_threshold(),
            join_poll_interval_ms: default_join_poll_interval_ms(),
            step_rate_window: default_step_rate_window(),
            recent_trades_per_book: default_recent_trades(),
            recent_agent_trades: default_recent_agent_trades(),
            reporting_disabled: false,
            transport: TransportConfig::default(),
            scoring: ScoringConfig::default(),
            archive: ArchiveConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Load config from disk. Returns default if the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no bridge config file, using defaults");
            return Ok(Self::default());
        }
        read_toml(path)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        write_toml(path, self)
    }

    /// State directory, honouring `SIMBRIDGE_STATE_DIR`.
    pub fn resolved_state_dir(&self) -> PathBuf {
        std::env::var("SIMBRIDGE_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(&self.state_dir))
    }
}

/// Parameters of the current simulation, derived from the engine's XML configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Short label used to name the market checkpoint.
    #[serde(default = "default_label")]
    pub label: String,

    #[serde(default = "default_book_count")]
    pub book_count: u32,

    /// Books handled per engine process; `None` means a single block.
    #[serde(default)]
    pub books_per_block: Option<u32>,

    /// Decimal places of quote volume.
    #[serde(default = "default_volume_decimals")]
    pub volume_decimals: u32,

    /// Initial wealth allocated to each miner per book.
    #[serde(default)]
    pub miner_wealth: f64,

    /// Simulated run length (ns).
    #[serde(default = "default_duration")]
    pub duration: i64,

    /// Interval between published log chunks (ns).
    #[serde(default = "default_publish_interval")]
    pub publish_interval: i64,

    /// Length of one log file window (ns).
    #[serde(default = "default_log_window")]
    pub log_window: i64,

    /// Engine output directory of the current run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<String>,

    /// Run identifier derived from the log directory name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulation_id: Option<String>,
}

fn default_label() -> String {
    "simulation_0".to_string()
}

fn default_book_count() -> u32 {
    1
}

fn default_volume_decimals() -> u32 {
    4
}

fn default_duration() -> i64 {
    86_400_000_000_000
}

fn default_publish_interval() -> i64 {
    60_000_000_000
}

fn default_log_window() -> i64 {
    3_600_000_000_000
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            label: default_label(),
            book_count: default_book_count(),
            books_per_block: None,
            volume_decimals: default_volume_decimals(),
            miner_wealth: 0.0,
            duration: default_duration(),
            publish_interval: default_publish_interval(),
            log_window: default_log_window(),
            log_dir: None,
            simulation_id: None,
        }
    }
}

impl SimulationConfig {
    /// Load the engine's XML configuration. Unlike the bridge config, a
    /// missing file is an error. The label is the file stem.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_engine_xml(&content).map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })?;
        if let Some(stem) = path.file_stem() {
            config.label = stem.to_string_lossy().into_owned();
        }
        config.validate()?;
        Ok(config)
    }

    /// Read the settings the bridge needs from an engine configuration:
    ///
    /// - `Simulation@duration`, `@step` (publish interval), `@logWindow`, `@blockCount`
    /// - `Agents/MultiBookExchangeAgent@volumeDecimals`
    /// - `Agents/MultiBookExchangeAgent/Books@instanceCount` (books per block)
    /// - `Agents/MultiBookExchangeAgent/Balances@wealth`, or the quote total plus
    ///   the base total valued at `@initialPrice`
    pub fn from_engine_xml(content: &str) -> Result<Self, String> {
        let doc = Document::parse(content).map_err(|e| e.to_string())?;
        let root = doc.root_element();
        if !root.has_tag_name("Simulation") {
            return Err(format!("root element is <{}>, expected <Simulation>", root.tag_name().name()));
        }
        let exchange = child(root, "Agents")
            .and_then(|agents| child(agents, "MultiBookExchangeAgent"))
            .ok_or("missing element Agents/MultiBookExchangeAgent")?;

        let blocks: u32 = attr(Some(root), "blockCount")?.unwrap_or(1);
        let books_per_block: u32 = attr(child(exchange, "Books"), "instanceCount")?.unwrap_or(1);
        let book_count = blocks
            .checked_mul(books_per_block)
            .ok_or("book count overflows")?;
        let duration = attr(Some(root), "duration")?.ok_or("missing attribute Simulation@duration")?;
        let defaults = Self::default();

        Ok(Self {
            book_count,
            books_per_block: Some(books_per_block),
            volume_decimals: attr(Some(exchange), "volumeDecimals")?.unwrap_or(defaults.volume_decimals),
            miner_wealth: engine_wealth(exchange)?,
            duration,
            publish_interval: attr(Some(root), "step")?.unwrap_or(defaults.publish_interval),
            log_window: attr::<i64>(Some(root), "logWindow")?
                .filter(|w| *w > 0)
                .unwrap_or(defaults.log_window),
            ..defaults
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.book_count == 0 {
            return Err(ConfigError::Invalid("book_count must be positive".into()));
        }
        if self.log_window <= 0 || self.duration <= 0 {
            return Err(ConfigError::Invalid(
                "log_window and duration must be positive".into(),
            ));
        }
        if self.books_per_block == Some(0) {
            return Err(ConfigError::Invalid("books_per_block must be positive".into()));
        }
        Ok(())
    }

    pub fn books_per_block(&self) -> u32 {
        self.books_per_block.unwrap_or(self.book_count)
    }

    pub fn block_count(&self) -> u32 {
        self.book_count.div_ceil(self.books_per_block())
    }

    /// Round a volume to the configured precision.
    pub fn round_volume(&self, value: f64) -> f64 {
        let scale = 10f64.powi(self.volume_decimals as i32);
        (value * scale).round() / scale
    }

    /// Identifier of a run: the first 13 characters of its log directory name.
    pub fn simulation_id_for(log_dir: &str) -> String {
        Path::new(log_dir)
            .file_name()
            .map(|name| name.to_string_lossy().chars().take(13).collect())
            .unwrap_or_default()
    }
}

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children().find(|c| c.has_tag_name(name))
}

fn attr<T>(node: Option<Node>, name: &str) -> Result<Option<T>, String>
where
    T: FromStr,
    T::Err: Display,
{
    let Some((element, value)) = node.and_then(|n| Some((n.tag_name().name(), n.attribute(name)?))) else {
        return Ok(None);
    };
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|e| format!("{element}@{name}=\"{value}\": {e}"))
}

fn engine_wealth(exchange: Node) -> Result<f64, String> {
    let balances = child(exchange, "Balances");
    if let Some(wealth) = attr(balances, "wealth")? {
        return Ok(wealth);
    }
    let total = |side: &str| attr::<f64>(balances.and_then(|b| child(b, side)), "total");
    let price: f64 = attr(Some(exchange), "initialPrice")?.unwrap_or(0.0);
    Ok(total("Quote")?.unwrap_or(0.0) + total("Base")?.unwrap_or(0.0) * price)
}

fn read_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn write_toml<T: Serialize>(path: &Path, value: &T) -> Result<(), ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let content = toml::to_string_pretty(value).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    std::fs::write(path, content).map_err(io_err)
}

/// Format a simulation timestamp (ns) as `D-HH:MM:SS.nnnnnnnnn`.
pub fn duration_from_timestamp(timestamp: i64) -> String {
    const NS: i64 = 1_000_000_000;
    let secs = timestamp.div_euclid(NS);
    let nanos = timestamp.rem_euclid(NS);
    format!(
        "{}-{:02}:{:02}:{:02}.{:09}",
        secs / 86_400,
        (secs % 86_400) / 3_600,
        (secs % 3_600) / 60,
        secs % 60,
        nanos
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_bridge_config_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.error_report_threshold, 10);
        assert_eq!(config.join_poll_interval_ms, 500);
        assert_eq!(config.step_rate_window, 10_000);
        assert_eq!(config.transport.request_queue, "/taosim-req");
        assert_eq!(config.transport.response_region, "/responses");
        assert_eq!(config.scoring.sharpe_lookback, 1440);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bridge.toml");
        std::fs::write(&path, "http_port = 9100\n[scoring]\nsharpe_lookback = 10\n").unwrap();

        let config = BridgeConfig::load(&path).unwrap();
        assert_eq!(config.http_port, 9100);
        assert_eq!(config.scoring.sharpe_lookback, 10);
        assert_eq!(config.scoring.trade_volume_sampling_interval, 600_000_000_000);
        assert!(!config.reporting_disabled);
    }

    #[test]
    fn test_bridge_config_save_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("bridge.toml");
        let mut config = BridgeConfig::default();
        config.reporting_disabled = true;
        config.save(&path).unwrap();
        assert_eq!(BridgeConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_bridge_config_is_default() {
        let dir = tempdir().unwrap();
        let config = BridgeConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, BridgeConfig::default());
    }

    const ENGINE_XML: &str = r#"<Simulation start="0" duration="86400000000000" step="1000000000" logWindow="3600000000000" blockCount="4">
  <Agents>
    <MultiBookExchangeAgent name="EXCHANGE" volumeDecimals="3" initialPrice="300.0">
      <Books instanceCount="5" algorithm="PriceTime" maxDepth="21"/>
      <Balances>
        <Base total="10"/>
        <Quote total="3000"/>
      </Balances>
    </MultiBookExchangeAgent>
    <StylizedTraderAgent instanceCount="100"/>
  </Agents>
</Simulation>"#;

    #[test]
    fn test_engine_xml_settings() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("simulation_7.xml");
        std::fs::write(&path, ENGINE_XML).unwrap();

        let config = SimulationConfig::load(&path).unwrap();
        assert_eq!(config.label, "simulation_7");
        assert_eq!(config.book_count, 20);
        assert_eq!(config.books_per_block(), 5);
        assert_eq!(config.block_count(), 4);
        assert_eq!(config.volume_decimals, 3);
        assert_eq!(config.miner_wealth, 6_000.0);
        assert_eq!(config.duration, 86_400_000_000_000);
        assert_eq!(config.publish_interval, 1_000_000_000);
        assert_eq!(config.log_window, 3_600_000_000_000);
    }

    #[test]
    fn test_engine_xml_wealth_attribute_and_defaults() {
        let xml = r#"<Simulation duration="600">
            <Agents><MultiBookExchangeAgent><Balances type="pareto" wealth="1500"/></MultiBookExchangeAgent></Agents>
        </Simulation>"#;
        let config = SimulationConfig::from_engine_xml(xml).unwrap();
        assert_eq!(config.book_count, 1);
        assert_eq!(config.miner_wealth, 1_500.0);
        assert_eq!(config.volume_decimals, 4);
        assert_eq!(config.log_window, 3_600_000_000_000);
    }

    #[test]
    fn test_missing_simulation_config_is_error() {
        let dir = tempdir().unwrap();
        let err = SimulationConfig::load(&dir.path().join("simulation_0.xml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_invalid_simulation_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("simulation_0.xml");
        std::fs::write(&path, ENGINE_XML.replace(r#"instanceCount="5""#, r#"instanceCount="0""#)).unwrap();
        assert!(matches!(
            SimulationConfig::load(&path),
            Err(ConfigError::Invalid(_))
        ));

        for broken in [
            "<Simulation duration=\"1\">",
            "<Config/>",
            "<Simulation duration=\"1\"><Agents/></Simulation>",
            "<Simulation><Agents><MultiBookExchangeAgent/></Agents></Simulation>",
            ENGINE_XML.replace(r#"volumeDecimals="3""#, r#"volumeDecimals="three""#).as_str(),
        ] {
            std::fs::write(&path, broken).unwrap();
            assert!(
                matches!(SimulationConfig::load(&path), Err(ConfigError::Parse { .. })),
                "{broken}"
            );
        }
    }

    #[test]
    fn test_block_layout() {
        let config = SimulationConfig {
            book_count: 10,
            books_per_block: Some(4),
            ..Default::default()
        };
        assert_eq!(config.block_count(), 3);
        assert_eq!(SimulationConfig::default().block_count(), 1);
    }

    #[test]
    fn test_round_volume() {
        let config = SimulationConfig {
            volume_decimals: 2,
            ..Default::default()
        };
        assert_eq!(config.round_volume(1.23456), 1.23);
        assert_eq!(config.round_volume(8.0), 8.0);
    }

    #[test]
    fn test_simulation_id_for() {
        assert_eq!(
            SimulationConfig::simulation_id_for("/out/20250102_1030-run-a"),
            "20250102_1030"
        );
        assert_eq!(SimulationConfig::simulation_id_for("short"), "short");
    }

    #[test]
    fn test_duration_from_timestamp() {
        assert_eq!(duration_from_timestamp(0), "0-00:00:00.000000000");
        assert_eq!(
            duration_from_timestamp(90_061_000_000_005),
            "1-01:01:01.000000005"
        );
    }
}
