//! Code cache tunables.
//!
//! Tunables are read from the `[code-cache]` table of a TOML file:
//!
//! ```toml
//! [code-cache]
//! code-cache-capacity = "48Mi"
//! exception-cache-size = 4
//! cold-gc-count = 8
//! ```
//!
//! Every key is optional. Unknown keys are rejected.

use anyhow::{Context, Result, bail};
use serde::de::{self, Deserializer};
use serde::Deserialize as _;
use serde_derive::Deserialize;
use std::fs;
use std::path::Path;

// Wrapper, so we can use the `[code-cache]` table name
#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct Config {
    #[serde(default, rename = "code-cache")]
    code_cache: Tunables,
}

/// Knobs of the code cache and of the nmethods in it.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Tunables {
    /// Bytes of code and metadata the cache may hold.
    #[serde(
        default = "default_code_cache_capacity",
        rename = "code-cache-capacity",
        deserialize_with = "deserialize_size"
    )]
    pub code_cache_capacity: usize,

    /// Handler slots of one exception-cache node.
    #[serde(
        default = "default_exception_cache_size",
        rename = "exception-cache-size"
    )]
    pub exception_cache_size: usize,

    /// Whether cold or unreachable code may be unloaded at all.
    #[serde(default = "default_true", rename = "method-flushing")]
    pub method_flushing: bool,

    /// Whether code that is still reachable may be unloaded once cold.
    #[serde(default = "default_true", rename = "use-code-cache-flushing")]
    pub use_code_cache_flushing: bool,

    /// Marking cycles, halved, that live code may go unseen on any stack
    /// before it counts as cold.
    #[serde(default = "default_cold_gc_count", rename = "cold-gc-count")]
    pub cold_gc_count: u64,

    /// Whether invalidating code bumps its method's decompile count.
    #[serde(default = "default_true", rename = "update-recompile-counts")]
    pub update_recompile_counts: bool,

    /// Whether object references embedded as instruction immediates are
    /// visited by `oops_do`.
    #[serde(default = "default_true", rename = "iterate-immediate-oops")]
    pub iterate_immediate_oops: bool,

    /// Whether nmethods carry an entry barrier.
    #[serde(default = "default_true", rename = "entry-barriers")]
    pub entry_barriers: bool,

    /// Whether the heap uses 32-bit object references.
    #[serde(default = "default_true", rename = "use-compressed-oops")]
    pub use_compressed_oops: bool,

    /// Heap base added to decoded narrow references.
    #[serde(default, rename = "narrow-oop-base")]
    pub narrow_oop_base: usize,

    /// Shift applied to decoded narrow references.
    #[serde(default = "default_narrow_oop_shift", rename = "narrow-oop-shift")]
    pub narrow_oop_shift: u32,

    /// Whether state changes are logged at info level.
    #[serde(default, rename = "log-compilation")]
    pub log_compilation: bool,
}

// Private functions with default values for serde.

fn default_code_cache_capacity() -> usize {
    48 << 20
}
fn default_exception_cache_size() -> usize {
    4
}
fn default_true() -> bool {
    true
}
fn default_cold_gc_count() -> u64 {
    4
}
fn default_narrow_oop_shift() -> u32 {
    3
}

/// Largest accepted handler slot count of an exception-cache node.
const MAX_EXCEPTION_CACHE_SIZE: usize = 64;

/// Largest accepted narrow reference shift.
const MAX_NARROW_OOP_SHIFT: u32 = 5;

// Accepts either a plain integer or a string with a binary or decimal
// unit suffix, e.g. "48Mi".
fn deserialize_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(serde_derive::Deserialize)]
    #[serde(untagged)]
    enum Size {
        Bytes(u64),
        Text(String),
    }

    let text = match Size::deserialize(deserializer)? {
        Size::Bytes(n) => return usize::try_from(n).map_err(de::Error::custom),
        Size::Text(text) => text,
    };
    let text = text.trim();
    let split_point = text.find(|c: char| !c.is_numeric());
    let (num, unit) = split_point.map_or_else(|| (text, ""), |p| text.split_at(p));
    let parsed = num.parse::<u64>().ok().and_then(|num| match unit.trim() {
        "" => Some(num),
        "K" => num.checked_mul(1_000),
        "Ki" => num.checked_mul(1 << 10),
        "M" => num.checked_mul(1_000_000),
        "Mi" => num.checked_mul(1 << 20),
        "G" => num.checked_mul(1_000_000_000),
        "Gi" => num.checked_mul(1 << 30),
        _ => None,
    });
    parsed
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| de::Error::custom("invalid size, expected e.g. `1024`, `64Ki` or `48Mi`"))
}

impl Default for Tunables {
    fn default() -> Tunables {
        Tunables {
            code_cache_capacity: default_code_cache_capacity(),
            exception_cache_size: default_exception_cache_size(),
            method_flushing: true,
            use_code_cache_flushing: true,
            cold_gc_count: default_cold_gc_count(),
            update_recompile_counts: true,
            iterate_immediate_oops: true,
            entry_barriers: true,
            use_compressed_oops: true,
            narrow_oop_base: 0,
            narrow_oop_shift: default_narrow_oop_shift(),
            log_compilation: false,
        }
    }
}

impl Tunables {
    /// Parses the `[code-cache]` table of `contents` and validates it.
    pub fn from_toml(contents: &str) -> Result<Tunables> {
        let config =
            toml::from_str::<Config>(contents).context("failed to parse code cache config")?;
        let tunables = config.code_cache;
        tunables.validate()?;
        Ok(tunables)
    }

    /// Loads tunables from the TOML file at `path`.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors, syntax errors, unknown keys and values that do
    /// not pass [`Tunables::validate`].
    pub fn from_file(path: &Path) -> Result<Tunables> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Tunables::from_toml(&contents)
            .with_context(|| format!("failed to load config file: {}", path.display()))
    }

    /// Checks that the values are usable together.
    pub fn validate(&self) -> Result<()> {
        if self.code_cache_capacity == 0 {
            bail!("code-cache-capacity must be non-zero");
        }
        if self.exception_cache_size == 0 || self.exception_cache_size > MAX_EXCEPTION_CACHE_SIZE
        {
            bail!(
                "exception-cache-size must be between 1 and {MAX_EXCEPTION_CACHE_SIZE}, got {}",
                self.exception_cache_size
            );
        }
        if self.cold_gc_count == 0 {
            bail!("cold-gc-count must be non-zero");
        }
        if self.narrow_oop_shift > MAX_NARROW_OOP_SHIFT {
            bail!(
                "narrow-oop-shift must be at most {MAX_NARROW_OOP_SHIFT}, got {}",
                self.narrow_oop_shift
            );
        }
        if !self.use_compressed_oops && self.narrow_oop_base != 0 {
            bail!("narrow-oop-base is set but use-compressed-oops is disabled");
        }
        Ok(())
    }
}
