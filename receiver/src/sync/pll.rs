//! Low-rate control loop on the clock map offset and slope.
//!
//! Observations come from the playout scheduler: how far ahead of "now" a
//! chunk was scheduled when it was popped. The loop nudges the map so that
//! headroom settles at one packet duration. It is advisory only; mapping
//! validity and SR freshness are decided elsewhere.

/// PLL gains and limits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PllConfig {
    // ---
    pub kb: f64,
    pub ki: f64,
    pub ka: f64,

    /// Slope clamp around `a₀`, in ppm.
    pub max_ppm: f64,

    /// Observations beyond this many windows are discarded.
    pub outlier_factor: f64,
    pub apply_interval_us: u64,

    /// Per-application limit on the offset change.
    pub offset_step_limit_us: f64,
}

impl Default for PllConfig {
    fn default() -> Self {
        // ---
        Self {
            kb: 0.02,
            ki: 5e-5,
            ka: 1e-9,
            max_ppm: 300.0,
            outlier_factor: 6.0,
            apply_interval_us: 20_000,
            offset_step_limit_us: 200.0,
        }
    }
}

/// Result of one observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PllOutcome {
    /// Outside the outlier bound; not integrated.
    Rejected,

    /// Integrated; the apply interval has not elapsed.
    Accumulated,

    /// Map updated by these deltas.
    Applied { delta_b_us: f64, delta_ppm: f64 },
}

/// Accumulators kept per SSRC.
#[derive(Debug, Clone, Default)]
pub struct PllState {
    // ---
    pub i_err: f64,
    pub last_apply_us: u64,
    pub last_delta_b_us: f64,
    pub last_delta_ppm: f64,
    pub obs_count: u64,
    pub rejected_count: u64,
}

impl PllState {
    // ---
    pub fn reset(&mut self) {
        // ---
        *self = Self::default();
    }

    /// Feeds one observation and, when due, adjusts `offset_b` and `slope_a`.
    ///
    /// `error_us` is scheduled wait minus the desired headroom. A positive
    /// error means chunks are scheduled later than needed, so the map is
    /// pulled earlier: the deltas are applied against the error sign.
    #[allow(clippy::too_many_arguments)]
    pub fn observe(
        &mut self,
        cfg: &PllConfig,
        error_us: f64,
        window_us: f64,
        now_us: u64,
        a0: f64,
        offset_b_us: &mut f64,
        slope_a: &mut f64,
    ) -> PllOutcome {
        // ---
        if window_us <= 0.0 || error_us.abs() > cfg.outlier_factor * window_us {
            self.rejected_count += 1;
            return PllOutcome::Rejected;
        }

        let window_sec = window_us / 1e6;
        self.i_err += error_us.clamp(-4.0 * window_us, 4.0 * window_us);
        // Anti-windup: the integral term alone never exceeds one step.
        if cfg.ki > 0.0 {
            let i_limit = cfg.offset_step_limit_us / (cfg.ki * window_sec);
            self.i_err = self.i_err.clamp(-i_limit, i_limit);
        }
        self.obs_count += 1;

        if self.last_apply_us != 0 && now_us.saturating_sub(self.last_apply_us) < cfg.apply_interval_us {
            return PllOutcome::Accumulated;
        }

        let delta_b = (cfg.kb * error_us + cfg.ki * (self.i_err * window_sec))
            .clamp(-cfg.offset_step_limit_us, cfg.offset_step_limit_us);
        let delta_ppm = cfg.ka * (error_us / window_us) * 1e6;

        let p = cfg.max_ppm / 1e6;
        *slope_a = (*slope_a * (1.0 - delta_ppm / 1e6)).clamp(a0 * (1.0 - p), a0 * (1.0 + p));
        *offset_b_us -= delta_b;

        self.last_apply_us = now_us;
        self.last_delta_b_us = -delta_b;
        self.last_delta_ppm = -delta_ppm;

        PllOutcome::Applied {
            delta_b_us: -delta_b,
            delta_ppm: -delta_ppm,
        }
    }
}
