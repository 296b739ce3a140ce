//! Setting tables: physical value → command payload(s).
//!
//! Each table is built once from the protocol encoders and never changes.
//! Values are looked up exactly; there is no rounding to a nearby entry.

use bytes::Bytes;
use std::{collections::BTreeMap, sync::LazyLock, time::Duration};

use crate::{
    error::{Result, Setting, VoltraError},
    protocol::{self, Parameter},
};

/// Lowest supported base weight in pounds
pub const WEIGHT_MIN: i32 = 5;
/// Highest supported base weight in pounds
pub const WEIGHT_MAX: i32 = 200;
/// Base weight stride in pounds
pub const WEIGHT_STEP: i32 = 5;

/// Highest supported chains load in pounds
pub const CHAINS_MAX: i32 = 100;
/// Chains stride in pounds
pub const CHAINS_STEP: i32 = 5;

/// Largest eccentric offset magnitude in pounds
pub const ECCENTRIC_LIMIT: i32 = 195;
/// Eccentric stride in pounds
pub const ECCENTRIC_STEP: i32 = 5;

/// Delay between the select and set halves of a chains change
pub const CHAINS_STEP_DELAY_MS: u32 = 100;
/// Delay between the select and set halves of an eccentric change
pub const ECCENTRIC_STEP_DELAY_MS: u32 = 100;

/// Payload(s) for one table value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandEntry {
    /// One write
    Single(Bytes),
    /// Two writes with a mandatory pause in between
    Dual {
        /// Written first
        step1: Bytes,
        /// Written after `inter_step_delay_ms`
        step2: Bytes,
        /// Minimum pause between the two writes
        inter_step_delay_ms: u32,
    },
}

impl CommandEntry {
    /// Pause required between the steps, zero for single writes
    #[must_use]
    pub fn inter_step_delay(&self) -> Duration {
        match self {
            Self::Single(_) => Duration::ZERO,
            Self::Dual {
                inter_step_delay_ms,
                ..
            } => Duration::from_millis(u64::from(*inter_step_delay_ms)),
        }
    }
}

/// Immutable value → entry map for one setting
#[derive(Debug)]
pub struct CommandTable {
    setting: Setting,
    entries: BTreeMap<i32, CommandEntry>,
}

static WEIGHT_TABLE: LazyLock<CommandTable> = LazyLock::new(|| {
    CommandTable::build(
        Setting::Weight,
        (WEIGHT_MIN..=WEIGHT_MAX).filter(|v| v % WEIGHT_STEP == 0),
        |value| {
            // Range is 5..=200, always fits
            let pounds = u16::try_from(value).unwrap_or_default();
            CommandEntry::Single(protocol::set_weight(pounds))
        },
    )
});

static CHAINS_TABLE: LazyLock<CommandTable> = LazyLock::new(|| {
    CommandTable::build(
        Setting::Chains,
        (0..=CHAINS_MAX).filter(|v| v % CHAINS_STEP == 0),
        |value| dual(Parameter::Chains, value, CHAINS_STEP_DELAY_MS),
    )
});

static ECCENTRIC_TABLE: LazyLock<CommandTable> = LazyLock::new(|| {
    CommandTable::build(
        Setting::Eccentric,
        (-ECCENTRIC_LIMIT..=ECCENTRIC_LIMIT).filter(|v| v % ECCENTRIC_STEP == 0),
        |value| dual(Parameter::Eccentric, value, ECCENTRIC_STEP_DELAY_MS),
    )
});

fn dual(parameter: Parameter, value: i32, inter_step_delay_ms: u32) -> CommandEntry {
    let value = i16::try_from(value).unwrap_or_default();
    CommandEntry::Dual {
        step1: protocol::select_parameter(parameter),
        step2: protocol::set_parameter(value),
        inter_step_delay_ms,
    }
}

impl CommandTable {
    fn build(
        setting: Setting,
        values: impl Iterator<Item = i32>,
        encode: impl Fn(i32) -> CommandEntry,
    ) -> Self {
        Self {
            setting,
            entries: values.map(|value| (value, encode(value))).collect(),
        }
    }

    /// Base weight table (5–200 lb, stride 5)
    #[must_use]
    pub fn weight() -> &'static Self {
        &WEIGHT_TABLE
    }

    /// Chains table (0–100 lb, stride 5)
    #[must_use]
    pub fn chains() -> &'static Self {
        &CHAINS_TABLE
    }

    /// Eccentric table (−195–+195 lb, stride 5)
    #[must_use]
    pub fn eccentric() -> &'static Self {
        &ECCENTRIC_TABLE
    }

    /// Table for a setting
    #[must_use]
    pub fn for_setting(setting: Setting) -> &'static Self {
        match setting {
            Setting::Weight => Self::weight(),
            Setting::Chains => Self::chains(),
            Setting::Eccentric => Self::eccentric(),
        }
    }

    /// Setting this table encodes
    #[must_use]
    pub const fn setting(&self) -> Setting {
        self.setting
    }

    /// Look up the entry for an exact value
    ///
    /// # Errors
    ///
    /// Returns [`VoltraError::InvalidSettingValue`] if the value is out of
    /// range or off-stride.
    pub fn lookup(&self, value: i32) -> Result<&CommandEntry> {
        self.entries
            .get(&value)
            .ok_or(VoltraError::InvalidSettingValue {
                setting: self.setting,
                value,
            })
    }

    /// Supported values in ascending order
    #[must_use]
    pub fn available_values(&self) -> Vec<i32> {
        self.entries.keys().copied().collect()
    }
}
