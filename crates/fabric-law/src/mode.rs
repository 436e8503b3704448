// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The mode router: a pure function from signals to operational mode.
//!
//! Three rule families compose, priority top-to-bottom:
//!
//! 1. **Global overrides** — sleep debt and open-loop pressure force RECOVER
//!    or CLOSE_LOOPS regardless of everything else.
//! 2. **Closure-ratio LUT** — when a ratio signal is present it decides the
//!    mode and `build_allowed` outright.
//! 3. **Progression ladder** — without a ratio signal, the current mode
//!    advances one rung at a time on good sleep, few loops, and leverage.
//!
//! Ties resolve by the earlier rule. The router never mutates state; the
//! closure engine and the daemon consult it and commit any transition as a
//! leaf-patch delta.

use fabric_kernel::Mode;

/// Inputs to the router.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct ModeSignals {
    /// Mode currently recorded in `system_state`.
    pub mode: Mode,
    /// Last night's sleep, hours.
    pub sleep_hours: f64,
    /// Currently open loops.
    pub open_loops: u64,
    /// Leverage balance (created minus consumed).
    pub leverage_balance: f64,
    /// Current streak, days.
    pub streak_days: u64,
    /// Closure ratio when a fresh one is available; `None` routes through
    /// the progression ladder instead of the LUT.
    pub closure_ratio: Option<f64>,
}

impl Default for ModeSignals {
    fn default() -> Self {
        ModeSignals {
            mode: Mode::Closure,
            sleep_hours: 7.0,
            open_loops: 0,
            leverage_balance: 0.0,
            streak_days: 0,
            closure_ratio: None,
        }
    }
}

/// The router's verdict.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ModeDecision {
    /// Mode the system should be in.
    pub mode: Mode,
    /// Whether build work is admitted in that mode.
    pub build_allowed: bool,
    /// Stable tag naming the rule that decided.
    pub reason: &'static str,
}

fn decide(mode: Mode, reason: &'static str) -> ModeDecision {
    ModeDecision {
        mode,
        build_allowed: matches!(mode, Mode::Build | Mode::Compound | Mode::Scale),
        reason,
    }
}

/// Computes the mode for the given signals.
#[must_use]
pub fn compute_mode(signals: &ModeSignals) -> ModeDecision {
    // Family 1: global overrides.
    if signals.sleep_hours < 5.0 {
        return decide(Mode::Recover, "sleep_below_5h");
    }
    let in_build_tier = matches!(signals.mode, Mode::Build | Mode::Compound | Mode::Scale);
    if signals.sleep_hours < 7.0 && in_build_tier {
        return decide(Mode::CloseLoops, "sleep_below_7h");
    }
    if signals.open_loops > 7 && in_build_tier {
        return decide(Mode::CloseLoops, "open_loops_above_7");
    }

    // Family 2: closure-ratio LUT.
    if let Some(ratio) = signals.closure_ratio {
        return if ratio >= 0.80 {
            decide(Mode::Scale, "ratio_scale")
        } else if ratio >= 0.60 {
            decide(Mode::Build, "ratio_build")
        } else if ratio >= 0.40 {
            decide(Mode::Maintenance, "ratio_maintenance")
        } else {
            decide(Mode::Closure, "ratio_closure")
        };
    }

    // Family 3: progression ladder.
    match signals.mode {
        Mode::Recover if signals.sleep_hours >= 7.0 => decide(Mode::CloseLoops, "ladder_recovered"),
        Mode::CloseLoops if signals.open_loops <= 3 => decide(Mode::Build, "ladder_loops_closed"),
        Mode::Build if signals.leverage_balance >= 5.0 => {
            decide(Mode::Compound, "ladder_leverage_5")
        }
        Mode::Compound if signals.leverage_balance >= 10.0 && signals.streak_days >= 3 => {
            decide(Mode::Scale, "ladder_leverage_10_streak_3")
        }
        current => decide(current, "hold"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signals() -> ModeSignals {
        ModeSignals::default()
    }

    #[test]
    fn sleep_debt_forces_recover_over_everything() {
        let s = ModeSignals {
            mode: Mode::Scale,
            sleep_hours: 4.5,
            closure_ratio: Some(0.95),
            ..signals()
        };
        let d = compute_mode(&s);
        assert_eq!(d.mode, Mode::Recover);
        assert!(!d.build_allowed);
    }

    #[test]
    fn mild_sleep_debt_demotes_build_tier_only() {
        let s = ModeSignals {
            mode: Mode::Build,
            sleep_hours: 6.0,
            closure_ratio: Some(0.95),
            ..signals()
        };
        assert_eq!(compute_mode(&s).mode, Mode::CloseLoops);

        // Non-build tiers keep routing through the LUT.
        let s = ModeSignals {
            mode: Mode::Maintenance,
            sleep_hours: 6.0,
            closure_ratio: Some(0.95),
            ..signals()
        };
        assert_eq!(compute_mode(&s).mode, Mode::Scale);
    }

    #[test]
    fn loop_pressure_demotes_build_tier() {
        let s = ModeSignals {
            mode: Mode::Compound,
            open_loops: 8,
            closure_ratio: Some(0.9),
            ..signals()
        };
        assert_eq!(compute_mode(&s).mode, Mode::CloseLoops);
    }

    #[test]
    fn ratio_lut_boundaries() {
        for (ratio, mode, allowed) in [
            (0.80, Mode::Scale, true),
            (0.79, Mode::Build, true),
            (0.60, Mode::Build, true),
            (0.59, Mode::Maintenance, false),
            (0.40, Mode::Maintenance, false),
            (0.39, Mode::Closure, false),
            (1.0, Mode::Scale, true),
            (0.0, Mode::Closure, false),
        ] {
            let s = ModeSignals {
                closure_ratio: Some(ratio),
                ..signals()
            };
            let d = compute_mode(&s);
            assert_eq!(d.mode, mode, "ratio {ratio}");
            assert_eq!(d.build_allowed, allowed, "ratio {ratio}");
        }
    }

    #[test]
    fn ladder_advances_one_rung_at_a_time() {
        let s = ModeSignals {
            mode: Mode::Recover,
            sleep_hours: 8.0,
            ..signals()
        };
        assert_eq!(compute_mode(&s).mode, Mode::CloseLoops);

        let s = ModeSignals {
            mode: Mode::CloseLoops,
            open_loops: 3,
            ..signals()
        };
        assert_eq!(compute_mode(&s).mode, Mode::Build);

        let s = ModeSignals {
            mode: Mode::CloseLoops,
            open_loops: 4,
            ..signals()
        };
        assert_eq!(compute_mode(&s).mode, Mode::CloseLoops);

        let s = ModeSignals {
            mode: Mode::Build,
            leverage_balance: 5.0,
            ..signals()
        };
        assert_eq!(compute_mode(&s).mode, Mode::Compound);

        let s = ModeSignals {
            mode: Mode::Compound,
            leverage_balance: 10.0,
            streak_days: 3,
            ..signals()
        };
        assert_eq!(compute_mode(&s).mode, Mode::Scale);

        let s = ModeSignals {
            mode: Mode::Compound,
            leverage_balance: 10.0,
            streak_days: 2,
            ..signals()
        };
        assert_eq!(compute_mode(&s).mode, Mode::Compound);
    }
}
