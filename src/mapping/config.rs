//! Configuration loader and validator
//!
//! Loads driver configuration from TOML files in the configs/ directory.
//! Every field has a default, so an empty file is a valid configuration.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::joycon2::connection::{LinkSettings, ReconnectPolicy};
use crate::joycon2::protocol::ReportLayout;
use crate::joycon2::types::{Button, Side, SideFilter};
use crate::mapping::mode::{DeviceMode, GestureBindings, Topology};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub session: SessionSettings,

    #[serde(default)]
    pub reconnect: ReconnectSettings,

    #[serde(default)]
    pub mouse: MouseSettings,

    #[serde(default)]
    pub gamepad: GamepadSettings,

    #[serde(default)]
    pub gestures: GestureSettings,

    #[serde(default)]
    pub layout: LayoutSettings,
}

// ============================================================================
// [session]
// ============================================================================

/// How controller addresses are resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Scan for advertising controllers
    #[default]
    Auto,
    /// Use the configured addresses
    Address,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopologyKind {
    #[default]
    Single,
    Combined,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default)]
    pub run_mode: RunMode,

    /// Which controllers to use: "left", "right" or "both"
    #[serde(default)]
    pub sides: SideFilter,

    #[serde(default)]
    pub topology: TopologyKind,

    #[serde(default)]
    pub left_address: Option<String>,

    #[serde(default)]
    pub right_address: Option<String>,

    /// Scan budget per side in auto mode (milliseconds)
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,

    /// How long combined topology waits for the second controller (milliseconds)
    #[serde(default = "default_combined_wait_ms")]
    pub combined_wait_ms: u64,

    /// Reports buffered between the link sessions and the pipeline
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            run_mode: RunMode::default(),
            sides: SideFilter::default(),
            topology: TopologyKind::default(),
            left_address: None,
            right_address: None,
            discovery_timeout_ms: default_discovery_timeout_ms(),
            combined_wait_ms: default_combined_wait_ms(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_discovery_timeout_ms() -> u64 { 30_000 }
fn default_combined_wait_ms() -> u64 { 20_000 }
fn default_queue_capacity() -> usize { 256 }

// ============================================================================
// [reconnect]
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectSettings {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Silence after which the enable commands are re-sent (milliseconds)
    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            connect_timeout_ms: default_connect_timeout_ms(),
            stall_timeout_ms: default_stall_timeout_ms(),
        }
    }
}

fn default_base_delay_ms() -> u64 { 500 }
fn default_max_delay_ms() -> u64 { 8_000 }
fn default_max_attempts() -> u32 { 6 }
fn default_connect_timeout_ms() -> u64 { 15_000 }
fn default_stall_timeout_ms() -> u64 { 2_000 }

// ============================================================================
// [mouse]
// ============================================================================

/// Controller buttons acting as mouse buttons. Unset entries are unassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClickMap {
    #[serde(default)]
    pub left: Option<Button>,
    #[serde(default)]
    pub right: Option<Button>,
    #[serde(default)]
    pub middle: Option<Button>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MouseSettings {
    /// Pointer counts per optical count
    #[serde(default = "default_sensitivity")]
    pub sensitivity: f32,

    /// Optical motion at or below this many counts per axis is ignored
    #[serde(default)]
    pub deadzone: i32,

    /// Per-report clamp on optical counts (spike guard)
    #[serde(default = "default_max_step")]
    pub max_step: i32,

    #[serde(default)]
    pub invert_x: bool,

    #[serde(default)]
    pub invert_y: bool,

    /// Accumulated scroll needed for one wheel tick
    #[serde(default = "default_scroll_threshold")]
    pub scroll_threshold: f32,

    /// Scroll accumulated per report at full stick deflection
    #[serde(default = "default_scroll_speed")]
    pub scroll_speed: f32,

    /// Response curve exponent applied to stick deflection
    #[serde(default = "default_scroll_curve")]
    pub scroll_curve: f32,

    /// Raw stick counts around centre that do not scroll
    #[serde(default = "default_scroll_deadzone")]
    pub scroll_deadzone: u16,

    /// Maximum wheel ticks per report
    #[serde(default = "default_scroll_max_step")]
    pub scroll_max_step: i32,

    #[serde(default)]
    pub invert_scroll: bool,

    #[serde(default = "default_right_clicks")]
    pub right_clicks: ClickMap,

    #[serde(default = "default_left_clicks")]
    pub left_clicks: ClickMap,
}

impl Default for MouseSettings {
    fn default() -> Self {
        Self {
            sensitivity: default_sensitivity(),
            deadzone: 0,
            max_step: default_max_step(),
            invert_x: false,
            invert_y: false,
            scroll_threshold: default_scroll_threshold(),
            scroll_speed: default_scroll_speed(),
            scroll_curve: default_scroll_curve(),
            scroll_deadzone: default_scroll_deadzone(),
            scroll_max_step: default_scroll_max_step(),
            invert_scroll: false,
            right_clicks: default_right_clicks(),
            left_clicks: default_left_clicks(),
        }
    }
}

impl MouseSettings {
    pub fn clicks(&self, side: Side) -> &ClickMap {
        match side {
            Side::Left => &self.left_clicks,
            Side::Right => &self.right_clicks,
        }
    }
}

fn default_sensitivity() -> f32 { 1.0 }
fn default_max_step() -> i32 { 200 }
fn default_scroll_threshold() -> f32 { 1.0 }
fn default_scroll_speed() -> f32 { 0.2 }
fn default_scroll_curve() -> f32 { 1.6 }
fn default_scroll_deadzone() -> u16 { 70 }
fn default_scroll_max_step() -> i32 { 3 }

fn default_right_clicks() -> ClickMap {
    ClickMap { left: Some(Button::R), right: Some(Button::Zr), middle: Some(Button::RStick) }
}

fn default_left_clicks() -> ClickMap {
    ClickMap { left: Some(Button::L), right: Some(Button::Zl), middle: Some(Button::LStick) }
}

// ============================================================================
// [gamepad]
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GamepadSettings {
    /// Stick deadzone (0.0 to 1.0 of full deflection)
    #[serde(default = "default_stick_deadzone")]
    pub stick_deadzone: f32,

    /// Samples used to find the stick centre after each connect
    #[serde(default = "default_calibration_samples")]
    pub calibration_samples: usize,

    /// Raw counts around centre inside which the centre keeps adapting
    #[serde(default = "default_recenter_radius")]
    pub recenter_radius: u16,

    /// Weight of each new sample when re-centring
    #[serde(default = "default_recenter_alpha")]
    pub recenter_alpha: f32,

    #[serde(default = "default_range_x")]
    pub range_x: [u16; 2],

    #[serde(default = "default_range_y")]
    pub range_y: [u16; 2],
}

impl Default for GamepadSettings {
    fn default() -> Self {
        Self {
            stick_deadzone: default_stick_deadzone(),
            calibration_samples: default_calibration_samples(),
            recenter_radius: default_recenter_radius(),
            recenter_alpha: default_recenter_alpha(),
            range_x: default_range_x(),
            range_y: default_range_y(),
        }
    }
}

fn default_stick_deadzone() -> f32 { 0.08 }
fn default_calibration_samples() -> usize { 25 }
fn default_recenter_radius() -> u16 { 25 }
fn default_recenter_alpha() -> f32 { 0.02 }
fn default_range_x() -> [u16; 2] { [780, 3260] }
fn default_range_y() -> [u16; 2] { [820, 3250] }

// ============================================================================
// [gestures]
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GestureSettings {
    /// Right controller: press to toggle gamepad/mouse (overlay in combined)
    #[serde(default = "default_right_toggle")]
    pub right_toggle: Button,

    /// Left controller: hold these two together to toggle gamepad/mouse
    #[serde(default = "default_left_hold")]
    pub left_hold: Vec<Button>,

    #[serde(default = "default_left_hold_ms")]
    pub left_hold_ms: u64,

    /// Initial mode of a single controller
    #[serde(default = "default_single_mode")]
    pub default_mode: DeviceMode,
}

impl Default for GestureSettings {
    fn default() -> Self {
        Self {
            right_toggle: default_right_toggle(),
            left_hold: default_left_hold(),
            left_hold_ms: default_left_hold_ms(),
            default_mode: default_single_mode(),
        }
    }
}

fn default_right_toggle() -> Button { Button::Chat }
fn default_left_hold() -> Vec<Button> { vec![Button::SlLeft, Button::SrLeft] }
fn default_left_hold_ms() -> u64 { 1_000 }
fn default_single_mode() -> DeviceMode { DeviceMode::Mouse }

// ============================================================================
// [layout]
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutSettings {
    /// Input report layout version
    #[serde(default = "default_layout_version")]
    pub version: u8,
}

impl Default for LayoutSettings {
    fn default() -> Self {
        Self { version: default_layout_version() }
    }
}

fn default_layout_version() -> u8 { 1 }

// ============================================================================
// Loading & Validation
// ============================================================================

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        info!("Loading config from: {}", path_ref.display());

        let content = std::fs::read_to_string(path_ref)?;
        let config = Self::from_toml(&content)?;

        info!("✓ Config loaded");
        Ok(config)
    }

    /// Load default configuration from configs/default.toml
    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load("configs/default.toml")
    }

    /// Parse and validate configuration text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;

        debug!("  - Run mode: {:?}", config.session.run_mode);
        debug!("  - Sides: {:?}, topology: {:?}", config.session.sides, config.session.topology);
        debug!("  - Default single mode: {:?}", config.gestures.default_mode);

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_session()?;
        self.validate_reconnect()?;
        self.validate_mouse()?;
        self.validate_gamepad()?;
        self.validate_gestures()?;

        ReportLayout::for_version(self.layout.version)
            .and_then(|layout| layout.validate())
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        Ok(())
    }

    fn validate_session(&self) -> Result<(), ConfigError> {
        let session = &self.session;

        match (session.topology, session.sides) {
            (TopologyKind::Combined, SideFilter::Both) => {}
            (TopologyKind::Combined, _) => {
                return Err(ConfigError::Invalid("combined topology requires sides = \"both\"".into()));
            }
            (TopologyKind::Single, SideFilter::Both) => {
                return Err(ConfigError::Invalid(
                    "single topology requires sides = \"left\" or \"right\"".into(),
                ));
            }
            (TopologyKind::Single, _) => {}
        }

        if session.run_mode == RunMode::Address {
            let mut seen = HashSet::new();
            for side in session.sides.sides() {
                let address = self.address_for(side).ok_or_else(|| {
                    ConfigError::Invalid(format!("run_mode \"address\" needs {}_address", side_key(side)))
                })?;
                if !seen.insert(address.to_ascii_uppercase()) {
                    return Err(ConfigError::Invalid(format!(
                        "left_address and right_address are the same ({})",
                        address
                    )));
                }
            }
        }

        if session.discovery_timeout_ms == 0 {
            return Err(ConfigError::Invalid("discovery_timeout_ms must be positive".into()));
        }
        if session.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be at least 1".into()));
        }

        Ok(())
    }

    fn validate_reconnect(&self) -> Result<(), ConfigError> {
        let r = &self.reconnect;
        if r.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        if r.max_delay_ms < r.base_delay_ms {
            return Err(ConfigError::Invalid("max_delay_ms must be >= base_delay_ms".into()));
        }
        if r.connect_timeout_ms == 0 || r.stall_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "connect_timeout_ms and stall_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    fn validate_mouse(&self) -> Result<(), ConfigError> {
        let m = &self.mouse;
        let positive = [
            ("sensitivity", m.sensitivity),
            ("scroll_threshold", m.scroll_threshold),
            ("scroll_speed", m.scroll_speed),
            ("scroll_curve", m.scroll_curve),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }
        if m.deadzone < 0 {
            return Err(ConfigError::Invalid("deadzone must not be negative".into()));
        }
        if m.max_step < 1 || m.scroll_max_step < 1 {
            return Err(ConfigError::Invalid("max_step and scroll_max_step must be at least 1".into()));
        }
        Ok(())
    }

    fn validate_gamepad(&self) -> Result<(), ConfigError> {
        let g = &self.gamepad;
        if !(0.0..1.0).contains(&g.stick_deadzone) {
            return Err(ConfigError::Invalid("stick_deadzone must be between 0.0 and 1.0".into()));
        }
        if g.calibration_samples == 0 {
            return Err(ConfigError::Invalid("calibration_samples must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&g.recenter_alpha) {
            return Err(ConfigError::Invalid("recenter_alpha must be between 0.0 and 1.0".into()));
        }
        for (name, [min, max]) in [("range_x", g.range_x), ("range_y", g.range_y)] {
            if min >= max || max > 4095 {
                return Err(ConfigError::Invalid(format!("{} must be an increasing pair within 0..=4095", name)));
            }
        }
        Ok(())
    }

    fn validate_gestures(&self) -> Result<(), ConfigError> {
        let g = &self.gestures;
        let distinct: HashSet<Button> = g.left_hold.iter().copied().collect();
        if g.left_hold.len() != 2 || distinct.len() != 2 {
            return Err(ConfigError::Invalid("left_hold needs exactly two distinct buttons".into()));
        }
        if g.left_hold_ms == 0 {
            return Err(ConfigError::Invalid("left_hold_ms must be positive".into()));
        }
        Ok(())
    }

    // ========================================================================
    // Derived settings
    // ========================================================================

    pub fn address_for(&self, side: Side) -> Option<&str> {
        match side {
            Side::Left => self.session.left_address.as_deref(),
            Side::Right => self.session.right_address.as_deref(),
        }
    }

    /// Requested topology. Only meaningful on a validated config.
    pub fn topology(&self) -> Topology {
        match (self.session.topology, self.session.sides) {
            (TopologyKind::Combined, _) | (_, SideFilter::Both) => Topology::Combined,
            (TopologyKind::Single, SideFilter::Left) => Topology::Single(Side::Left),
            (TopologyKind::Single, SideFilter::Right) => Topology::Single(Side::Right),
        }
    }

    pub fn link_settings(&self) -> Result<LinkSettings, ConfigError> {
        let layout = ReportLayout::for_version(self.layout.version)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(LinkSettings {
            layout,
            policy: ReconnectPolicy {
                base_delay: Duration::from_millis(self.reconnect.base_delay_ms),
                max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
                max_attempts: self.reconnect.max_attempts,
            },
            connect_timeout: Duration::from_millis(self.reconnect.connect_timeout_ms),
            stall_timeout: Duration::from_millis(self.reconnect.stall_timeout_ms),
            motion_clamp: self.mouse.max_step,
        })
    }

    pub fn combined_wait(&self) -> Duration {
        Duration::from_millis(self.session.combined_wait_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.session.discovery_timeout_ms)
    }

    pub fn left_hold_duration(&self) -> Duration {
        Duration::from_millis(self.gestures.left_hold_ms)
    }

    pub fn gesture_bindings(&self) -> Result<GestureBindings, ConfigError> {
        let left_hold = match self.gestures.left_hold.as_slice() {
            [a, b] => [*a, *b],
            other => {
                return Err(ConfigError::Invalid(format!(
                    "left_hold needs exactly two buttons, got {}",
                    other.len()
                )))
            }
        };
        Ok(GestureBindings {
            right_toggle: self.gestures.right_toggle,
            left_hold,
            left_hold_duration: self.left_hold_duration(),
            default_mode: self.gestures.default_mode,
        })
    }
}

fn side_key(side: Side) -> &'static str {
    match side {
        Side::Left => "left",
        Side::Right => "right",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.topology(), Topology::Single(Side::Right));
        assert_eq!(config.session.run_mode, RunMode::Auto);
        assert_eq!(config.mouse.sensitivity, 1.0);
        assert_eq!(config.gestures.right_toggle, Button::Chat);
        assert_eq!(config.gestures.left_hold, vec![Button::SlLeft, Button::SrLeft]);
        assert_eq!(config.left_hold_duration(), Duration::from_millis(1000));

        let bindings = config.gesture_bindings().unwrap();
        assert_eq!(bindings.left_hold, [Button::SlLeft, Button::SrLeft]);
        assert_eq!(bindings.default_mode, DeviceMode::Mouse);
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.session.queue_capacity, 256);
        assert_eq!(config.reconnect.max_attempts, 6);
        assert_eq!(config.mouse.right_clicks.left, Some(Button::R));
        assert_eq!(config.mouse.clicks(Side::Left).middle, Some(Button::LStick));
    }

    #[test]
    fn test_parse_full_config() {
        let text = r#"
            [session]
            run_mode = "address"
            sides = "both"
            topology = "combined"
            left_address = "98:E2:55:00:00:01"
            right_address = "98:E2:55:00:00:02"

            [reconnect]
            base_delay_ms = 250
            max_attempts = 3

            [mouse]
            sensitivity = 1.5
            scroll_threshold = 2.0
            right_clicks = { left = "zr", right = "r" }

            [gestures]
            right_toggle = "home"
            left_hold = ["l", "zl"]
            left_hold_ms = 750
            default_mode = "gamepad"
        "#;

        let config = Config::from_toml(text).unwrap();
        assert_eq!(config.topology(), Topology::Combined);
        assert_eq!(config.address_for(Side::Right), Some("98:E2:55:00:00:02"));
        assert_eq!(config.mouse.right_clicks.left, Some(Button::Zr));
        assert_eq!(config.mouse.right_clicks.middle, None);
        assert_eq!(config.gestures.right_toggle, Button::Home);
        assert_eq!(config.gestures.default_mode, DeviceMode::Gamepad);

        let link = config.link_settings().unwrap();
        assert_eq!(link.policy.base_delay, Duration::from_millis(250));
        assert_eq!(link.policy.max_attempts, 3);
        assert_eq!(link.layout, ReportLayout::V1);
    }

    #[test]
    fn test_topology_requires_matching_sides() {
        let mut config = Config::default();
        config.session.topology = TopologyKind::Combined;
        assert!(config.validate().is_err());

        config.session.sides = SideFilter::Both;
        assert!(config.validate().is_ok());

        config.session.topology = TopologyKind::Single;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_address_mode_requires_distinct_addresses() {
        let mut config = Config::default();
        config.session.run_mode = RunMode::Address;
        config.session.sides = SideFilter::Both;
        config.session.topology = TopologyKind::Combined;
        config.session.left_address = Some("AA:BB:CC:DD:EE:FF".into());
        assert!(config.validate().is_err());

        config.session.right_address = Some("aa:bb:cc:dd:ee:ff".into());
        assert!(config.validate().is_err());

        config.session.right_address = Some("AA:BB:CC:DD:EE:00".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_thresholds() {
        let mut config = Config::default();
        config.mouse.sensitivity = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.mouse.scroll_threshold = -1.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.reconnect.max_delay_ms = 100;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.reconnect.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.gamepad.stick_deadzone = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_left_hold_needs_two_distinct_buttons() {
        let mut config = Config::default();
        config.gestures.left_hold = vec![Button::SlLeft];
        assert!(config.validate().is_err());

        config.gestures.left_hold = vec![Button::SlLeft, Button::SlLeft];
        assert!(config.validate().is_err());

        config.gestures.left_hold = vec![Button::L, Button::Zl];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_layout_version() {
        let err = Config::from_toml("[layout]\nversion = 9\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_unknown_button_name_is_parse_error() {
        let err = Config::from_toml("[gestures]\nright_toggle = \"turbo\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
