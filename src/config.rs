// =============================================================================
// Risk Configuration - validated at startup, read-only afterwards
// =============================================================================
//
// Every tunable of the rule set lives here. The structure is loaded from a
// single JSON file once at startup and validated before the engine spins up;
// a validation failure is fatal.
//
// All fields carry `#[serde(default)]` so that adding new fields never breaks
// loading an older config file.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::NaiveTime;
use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{RuleId, Symbol};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_reset_time() -> String {
    "17:00".to_string()
}

fn default_timezone() -> String {
    "America/New_York".to_string()
}

fn default_rule_order() -> Vec<String> {
    RuleId::ALL.iter().map(|r| r.code().to_string()).collect()
}

fn default_tick_interval_secs() -> u64 {
    5
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_command_timeout_secs() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    250
}

fn default_max_contracts() -> i64 {
    5
}

fn default_grace_secs() -> u64 {
    120
}

fn default_per_minute() -> u32 {
    3
}

fn default_per_hour() -> u32 {
    20
}

fn default_per_session() -> u32 {
    60
}

fn default_cooldown_minute_secs() -> u64 {
    60
}

fn default_cooldown_hour_secs() -> u64 {
    600
}

fn default_cooldown_session_secs() -> u64 {
    1800
}

fn default_stop_ticks() -> i64 {
    40
}

fn default_take_profit_ticks() -> i64 {
    80
}

fn default_trail_ticks() -> i64 {
    8
}

// =============================================================================
// Contract specifications
// =============================================================================

/// Per-symbol contract economics used by the unrealized-PnL arithmetic and
/// the trade-management tick distances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractSpec {
    pub tick_size: Decimal,
    pub tick_value: Decimal,
}

// =============================================================================
// Per-rule sections
// =============================================================================

/// RULE-001: account-wide contract cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaxContractsCfg {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_contracts")]
    pub limit: i64,
}

impl Default for MaxContractsCfg {
    fn default() -> Self {
        Self { enabled: true, limit: default_max_contracts() }
    }
}

/// What RULE-002 does with a position in a symbol it has no limit for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownSymbolPolicy {
    Block,
    Allow,
    AllowWithLimit(i64),
}

impl Default for UnknownSymbolPolicy {
    fn default() -> Self {
        Self::Allow
    }
}

/// How RULE-002 enforces an over-limit position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentLimitMode {
    ReduceToLimit,
    Close,
}

impl Default for InstrumentLimitMode {
    fn default() -> Self {
        Self::ReduceToLimit
    }
}

/// RULE-002: per-instrument contract caps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstrumentLimitsCfg {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub limits: HashMap<Symbol, i64>,
    #[serde(default)]
    pub mode: InstrumentLimitMode,
    #[serde(default)]
    pub unknown_symbol: UnknownSymbolPolicy,
}

/// RULE-003 / RULE-013: daily realized P&L boundaries. The loss limit is
/// negative, the profit target positive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DailyRealizedCfg {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub limit: Decimal,
}

/// RULE-004 / RULE-005: per-position unrealized P&L boundaries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnrealizedCfg {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub limit: Decimal,
}

/// RULE-006: rolling-window trade frequency caps with per-window cooldowns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeFrequencyCfg {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_per_minute")]
    pub per_minute: u32,
    #[serde(default = "default_per_hour")]
    pub per_hour: u32,
    #[serde(default = "default_per_session")]
    pub per_session: u32,
    #[serde(default = "default_cooldown_minute_secs")]
    pub cooldown_minute_secs: u64,
    #[serde(default = "default_cooldown_hour_secs")]
    pub cooldown_hour_secs: u64,
    #[serde(default = "default_cooldown_session_secs")]
    pub cooldown_session_secs: u64,
}

impl Default for TradeFrequencyCfg {
    fn default() -> Self {
        Self {
            enabled: false,
            per_minute: default_per_minute(),
            per_hour: default_per_hour(),
            per_session: default_per_session(),
            cooldown_minute_secs: default_cooldown_minute_secs(),
            cooldown_hour_secs: default_cooldown_hour_secs(),
            cooldown_session_secs: default_cooldown_session_secs(),
        }
    }
}

/// One tier of RULE-007: losses of at least `loss_at_least` (a positive
/// magnitude) earn `cooldown_secs` on the bench. Tiers are ascending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossCooldownTier {
    pub loss_at_least: Decimal,
    pub cooldown_secs: u64,
}

/// RULE-007: cooldown after a realized loss, tiered by loss magnitude.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LossCooldownCfg {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub tiers: Vec<LossCooldownTier>,
}

/// RULE-008: grace window to attach a stop-loss to a fresh position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopLossGraceCfg {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
}

impl Default for StopLossGraceCfg {
    fn default() -> Self {
        Self { enabled: false, grace_secs: default_grace_secs() }
    }
}

/// RULE-009: allowed session window, in the engine's configured timezone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionHoursCfg {
    #[serde(default)]
    pub enabled: bool,
    /// "HH:MM" local session open.
    #[serde(default)]
    pub open: String,
    /// "HH:MM" local session close.
    #[serde(default)]
    pub close: String,
}

/// RULE-010: flatten and lock while the broker says `can_trade = false`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthGuardCfg {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for AuthGuardCfg {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// RULE-011: banned symbols. Entries are glob-ish patterns: a leading or
/// trailing `*` matches any prefix/suffix, a bare `*` matches everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolBlocksCfg {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub blocked: Vec<String>,
}

/// What RULE-012 places when a position opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionMode {
    Stop,
    TakeProfit,
    Bracket,
}

impl Default for ProtectionMode {
    fn default() -> Self {
        Self::Stop
    }
}

/// RULE-012 trailing-stop sub-section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingStopCfg {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_trail_ticks")]
    pub trail_ticks: i64,
}

impl Default for TrailingStopCfg {
    fn default() -> Self {
        Self { enabled: false, trail_ticks: default_trail_ticks() }
    }
}

/// RULE-012: automated bracket placement and trailing stops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeManagementCfg {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_stop_ticks")]
    pub stop_ticks: i64,
    #[serde(default = "default_take_profit_ticks")]
    pub take_profit_ticks: i64,
    /// Which protective order(s) to place on open: stop only, take-profit
    /// only, or both as a bracket.
    #[serde(default)]
    pub protection: ProtectionMode,
    #[serde(default)]
    pub trailing_stop: TrailingStopCfg,
}

impl Default for TradeManagementCfg {
    fn default() -> Self {
        Self {
            enabled: false,
            stop_ticks: default_stop_ticks(),
            take_profit_ticks: default_take_profit_ticks(),
            protection: ProtectionMode::default(),
            trailing_stop: TrailingStopCfg::default(),
        }
    }
}

/// All rule sections together.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleParams {
    #[serde(default)]
    pub max_contracts: MaxContractsCfg,
    #[serde(default)]
    pub instrument_limits: InstrumentLimitsCfg,
    #[serde(default)]
    pub daily_realized_loss: DailyRealizedCfg,
    #[serde(default)]
    pub daily_realized_profit: DailyRealizedCfg,
    #[serde(default)]
    pub unrealized_loss: UnrealizedCfg,
    #[serde(default)]
    pub unrealized_profit: UnrealizedCfg,
    #[serde(default)]
    pub trade_frequency: TradeFrequencyCfg,
    #[serde(default)]
    pub loss_cooldown: LossCooldownCfg,
    #[serde(default)]
    pub stop_loss_grace: StopLossGraceCfg,
    #[serde(default)]
    pub session_hours: SessionHoursCfg,
    #[serde(default)]
    pub auth_guard: AuthGuardCfg,
    #[serde(default)]
    pub symbol_blocks: SymbolBlocksCfg,
    #[serde(default)]
    pub trade_management: TradeManagementCfg,
}

// =============================================================================
// Enforcement / transport parameters
// =============================================================================

/// Knobs for the enforcement dispatcher's broker calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcementCfg {
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

impl Default for EnforcementCfg {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout_secs(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

// =============================================================================
// RiskConfig
// =============================================================================

/// Top-level validated configuration, read once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Accounts the engine supervises.
    #[serde(default)]
    pub accounts: Vec<String>,

    /// "HH:MM" wall-clock daily reset in `timezone`.
    #[serde(default = "default_reset_time")]
    pub reset_time: String,

    /// IANA timezone name, e.g. "America/New_York".
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Rule evaluation order as `RULE-NNN` codes. Rules missing from this
    /// list are appended in id order.
    #[serde(default = "default_rule_order")]
    pub rule_order: Vec<String>,

    /// Per-symbol contract economics.
    #[serde(default)]
    pub contracts: HashMap<Symbol, ContractSpec>,

    /// Heartbeat driving timer expiry and session checks.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// Per-account event queue depth (backpressure beyond this).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default)]
    pub enforcement: EnforcementCfg,

    #[serde(default)]
    pub rules: RuleParams,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            accounts: Vec::new(),
            reset_time: default_reset_time(),
            timezone: default_timezone(),
            rule_order: default_rule_order(),
            contracts: HashMap::new(),
            tick_interval_secs: default_tick_interval_secs(),
            queue_capacity: default_queue_capacity(),
            enforcement: EnforcementCfg::default(),
            rules: RuleParams::default(),
        }
    }
}

impl RiskConfig {
    /// Load and validate a config file. Any validation failure is fatal.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        info!(
            path = %path.display(),
            accounts = config.accounts.len(),
            reset_time = %config.reset_time,
            timezone = %config.timezone,
            "configuration loaded"
        );
        Ok(config)
    }

    /// Validate cross-field consistency. Called by `load`, and directly by
    /// tests that build configs in memory.
    pub fn validate(&self) -> Result<()> {
        self.tz()?;
        self.reset_naive_time()?;

        if self.rule_order.is_empty() {
            bail!("rule_order must not be empty");
        }
        for code in &self.rule_order {
            if RuleId::from_code(code).is_none() {
                bail!("unknown rule id in rule_order: {code}");
            }
        }

        if self.queue_capacity == 0 {
            bail!("queue_capacity must be positive");
        }
        if self.tick_interval_secs == 0 {
            bail!("tick_interval_secs must be positive");
        }
        if self.enforcement.max_attempts == 0 {
            bail!("enforcement.max_attempts must be positive");
        }

        for (symbol, spec) in &self.contracts {
            if spec.tick_size <= Decimal::ZERO || spec.tick_value <= Decimal::ZERO {
                bail!("contract {symbol}: tick_size and tick_value must be positive");
            }
        }

        if self.rules.max_contracts.enabled && self.rules.max_contracts.limit <= 0 {
            bail!("max_contracts.limit must be positive");
        }
        if self.rules.daily_realized_loss.enabled
            && self.rules.daily_realized_loss.limit >= Decimal::ZERO
        {
            bail!("daily_realized_loss.limit must be negative");
        }
        if self.rules.daily_realized_profit.enabled
            && self.rules.daily_realized_profit.limit <= Decimal::ZERO
        {
            bail!("daily_realized_profit.limit must be positive");
        }
        if self.rules.unrealized_loss.enabled && self.rules.unrealized_loss.limit >= Decimal::ZERO
        {
            bail!("unrealized_loss.limit must be negative");
        }
        if self.rules.unrealized_profit.enabled
            && self.rules.unrealized_profit.limit <= Decimal::ZERO
        {
            bail!("unrealized_profit.limit must be positive");
        }
        if self.rules.session_hours.enabled {
            parse_hhmm(&self.rules.session_hours.open)
                .context("session_hours.open must be HH:MM")?;
            parse_hhmm(&self.rules.session_hours.close)
                .context("session_hours.close must be HH:MM")?;
        }
        if self.rules.loss_cooldown.enabled {
            let tiers = &self.rules.loss_cooldown.tiers;
            if tiers.is_empty() {
                bail!("loss_cooldown.tiers must not be empty when enabled");
            }
            for pair in tiers.windows(2) {
                if pair[1].loss_at_least <= pair[0].loss_at_least {
                    bail!("loss_cooldown.tiers must be strictly ascending");
                }
            }
        }

        Ok(())
    }

    /// The configured IANA timezone.
    pub fn tz(&self) -> Result<Tz> {
        Tz::from_str(&self.timezone)
            .map_err(|_| anyhow::anyhow!("unknown timezone: {}", self.timezone))
    }

    /// The configured daily reset as a local wall-clock time.
    pub fn reset_naive_time(&self) -> Result<NaiveTime> {
        parse_hhmm(&self.reset_time)
            .with_context(|| format!("reset_time must be HH:MM, got {:?}", self.reset_time))
    }

    /// Contract spec lookup.
    pub fn contract(&self, symbol: &str) -> Option<&ContractSpec> {
        self.contracts.get(symbol)
    }

    /// Per-broker-call timeout for the dispatcher.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.enforcement.command_timeout_secs)
    }
}

/// Parse "HH:MM" into a `NaiveTime`.
pub fn parse_hhmm(raw: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M").map_err(|e| anyhow::anyhow!("bad HH:MM {raw:?}: {e}"))
}

// =============================================================================
// Tests
// =============================================================================
