//! Boot-time configuration.
//!
//! The teacher hardcodes its PIT divisor and has no notion of a scheduler
//! flag at all; this crate lifts the handful of constants spec.md actually
//! names into one small struct so `main.rs` and the integration tests can
//! read them from one place instead of matching magic numbers scattered
//! through `interrupts.rs`/`thread::scheduler`.

use spin::Once;

/// Ticks per second the PIT is programmed to fire at.
pub const DEFAULT_PIT_HZ: u32 = 100;

/// Ticks a thread may run before preemption is requested (spec.md §4.2,
/// "TIME_SLICE (4 ticks)").
pub const TIME_SLICE: u64 = 4;

/// Default `base_priority` assigned to a thread that doesn't request one
/// explicitly (spec.md §3, "0..63, default 31").
pub const PRIORITY_DEFAULT: u8 = 31;
pub const PRIORITY_MIN: u8 = 0;
pub const PRIORITY_MAX: u8 = 63;

/// Depth bound on nested donation chain walks (spec.md §4.5).
pub const DONATION_DEPTH_LIMIT: u32 = 8;

#[derive(Debug, Clone, Copy)]
pub struct BootConfig {
    /// Recognized per spec.md §6 ("CLI opt-in recognized but not otherwise
    /// part of the core"); selecting it is a no-op here since the MLFQS
    /// body is explicitly unspecified.
    pub mlfqs: bool,
    pub pit_hz: u32,
}

impl Default for BootConfig {
    fn default() -> Self {
        BootConfig { mlfqs: false, pit_hz: DEFAULT_PIT_HZ }
    }
}

static CONFIG: Once<BootConfig> = Once::new();

impl BootConfig {
    /// Parses the bootloader's kernel command line (a space-separated
    /// argument string) for `-mlfqs`; everything else defaults.
    pub fn parse(cmdline: &str) -> Self {
        let mut cfg = BootConfig::default();
        for arg in cmdline.split_whitespace() {
            if arg == "-mlfqs" {
                cfg.mlfqs = true;
            }
        }
        cfg
    }

    /// Installs the config parsed from the boot command line. Must be
    /// called at most once, before `get()`.
    pub fn init(cmdline: &str) {
        CONFIG.call_once(|| BootConfig::parse(cmdline));
    }

    /// Reads the installed config, or the default if `init` was never
    /// called (e.g. integration tests that don't go through `main.rs`).
    pub fn get() -> BootConfig {
        *CONFIG.call_once(BootConfig::default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mlfqs_flag() {
        let cfg = BootConfig::parse("-mlfqs");
        assert!(cfg.mlfqs);
    }

    #[test]
    fn defaults_to_fixed_priority() {
        let cfg = BootConfig::parse("quiet loglevel=3");
        assert!(!cfg.mlfqs);
        assert_eq!(cfg.pit_hz, DEFAULT_PIT_HZ);
    }
}
