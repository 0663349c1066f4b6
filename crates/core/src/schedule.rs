//! Diffusion noise schedule: the model's fixed linear-β training schedule,
//! respaced to the requested step count, then gated to the `[t_min, t_max]` window.

use tracing::debug;

use crate::error::{CcsrError, Result};

/// Length of the training schedule the model was trained with.
pub const NUM_TRAIN_TIMESTEPS: usize = 1000;
pub const LINEAR_BETA_START: f64 = 0.00085;
pub const LINEAR_BETA_END: f64 = 0.012;

/// The model's training schedule. Fixed by the model, not configurable per run.
#[derive(Clone, Debug)]
pub struct BaseSchedule {
    alphas_cumprod: Vec<f64>,
}

impl BaseSchedule {
    /// "scaled linear" betas: `linspace(√start, √end, T)²`.
    pub fn linear() -> Self {
        let n = NUM_TRAIN_TIMESTEPS;
        let (lo, hi) = (LINEAR_BETA_START.sqrt(), LINEAR_BETA_END.sqrt());
        let mut cumprod = 1.0;
        let alphas_cumprod = (0..n)
            .map(|i| {
                let root = lo + (hi - lo) * i as f64 / (n - 1) as f64;
                cumprod *= 1.0 - root * root;
                cumprod
            })
            .collect();
        Self { alphas_cumprod }
    }

    pub fn len(&self) -> usize {
        self.alphas_cumprod.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alphas_cumprod.is_empty()
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }
}

impl Default for BaseSchedule {
    fn default() -> Self {
        Self::linear()
    }
}

/// Evenly spaced subset of `steps` training timesteps, ascending, always
/// including `0` and `T - 1` (when `steps > 1`).
pub fn respaced_timesteps(total: usize, steps: usize) -> Result<Vec<usize>> {
    if steps == 0 || steps > total {
        return Err(CcsrError::InvalidParameter(format!(
            "steps must be in 1..={total}, got {steps}"
        )));
    }
    if steps == 1 {
        return Ok(vec![0]);
    }
    let stride = (total - 1) as f64 / (steps - 1) as f64;
    Ok((0..steps).map(|i| (i as f64 * stride).round() as usize).collect())
}

/// Per-step coefficients of the respaced schedule, indexed by step index
/// (`0` is the least noisy step).
#[derive(Clone, Debug)]
pub struct SpacedSchedule {
    timesteps: Vec<usize>,
    alphas_cumprod: Vec<f64>,
    posterior_log_variance_clipped: Vec<f64>,
    posterior_mean_coef1: Vec<f64>,
    posterior_mean_coef2: Vec<f64>,
}

impl SpacedSchedule {
    pub fn new(base: &BaseSchedule, steps: usize) -> Result<Self> {
        let timesteps = respaced_timesteps(base.len(), steps)?;
        let alphas_cumprod: Vec<f64> = timesteps
            .iter()
            .map(|&t| base.alphas_cumprod()[t])
            .collect();

        let n = alphas_cumprod.len();
        let mut posterior_variance = Vec::with_capacity(n);
        let mut coef1 = Vec::with_capacity(n);
        let mut coef2 = Vec::with_capacity(n);
        for i in 0..n {
            let acp = alphas_cumprod[i];
            let acp_prev = if i == 0 { 1.0 } else { alphas_cumprod[i - 1] };
            let beta = 1.0 - acp / acp_prev;
            let alpha = 1.0 - beta;
            posterior_variance.push(beta * (1.0 - acp_prev) / (1.0 - acp));
            coef1.push(beta * acp_prev.sqrt() / (1.0 - acp));
            coef2.push((1.0 - acp_prev) * alpha.sqrt() / (1.0 - acp));
        }

        // The posterior variance at step 0 is zero; clip its log with step 1.
        let posterior_log_variance_clipped = (0..n)
            .map(|i| match (i, posterior_variance.get(1)) {
                (0, Some(&next)) => next.ln(),
                (0, None) => 0.0,
                _ => posterior_variance[i].ln(),
            })
            .collect();

        Ok(Self {
            timesteps,
            alphas_cumprod,
            posterior_log_variance_clipped,
            posterior_mean_coef1: coef1,
            posterior_mean_coef2: coef2,
        })
    }

    pub fn len(&self) -> usize {
        self.timesteps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timesteps.is_empty()
    }

    /// Training timestep the model is conditioned on at `index`.
    pub fn timestep(&self, index: usize) -> usize {
        self.timesteps[index]
    }

    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    pub fn alpha_cumprod(&self, index: usize) -> f64 {
        self.alphas_cumprod[index]
    }

    pub fn sqrt_recip_alphas_cumprod(&self, index: usize) -> f64 {
        (1.0 / self.alphas_cumprod[index]).sqrt()
    }

    pub fn sqrt_recipm1_alphas_cumprod(&self, index: usize) -> f64 {
        (1.0 / self.alphas_cumprod[index] - 1.0).sqrt()
    }

    pub fn posterior_mean_coef1(&self, index: usize) -> f64 {
        self.posterior_mean_coef1[index]
    }

    pub fn posterior_mean_coef2(&self, index: usize) -> f64 {
        self.posterior_mean_coef2[index]
    }

    pub fn posterior_log_variance_clipped(&self, index: usize) -> f64 {
        self.posterior_log_variance_clipped[index]
    }
}

/// One active reverse step: position in the spaced schedule and its training timestep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActiveStep {
    pub index: usize,
    pub timestep: usize,
}

/// The timesteps a run actually denoises, most noisy first.
#[derive(Clone, Debug)]
pub struct NoiseSchedule {
    spaced: SpacedSchedule,
    active: Vec<ActiveStep>,
}

impl NoiseSchedule {
    /// Respaces the base schedule to `steps` and keeps timesteps `t` with
    /// `t_min·T <= t <= t_max·T`.
    pub fn build(base: &BaseSchedule, steps: usize, t_min: f64, t_max: f64) -> Result<Self> {
        for (name, value) in [("t_min", t_min), ("t_max", t_max)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(CcsrError::InvalidParameter(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        let spaced = SpacedSchedule::new(base, steps)?;
        if t_min > t_max {
            return Err(CcsrError::ScheduleEmpty { steps, t_min, t_max });
        }

        let total = base.len() as f64;
        let (lo, hi) = (t_min * total, t_max * total);
        let active: Vec<ActiveStep> = (0..spaced.len())
            .rev()
            .map(|index| ActiveStep {
                index,
                timestep: spaced.timestep(index),
            })
            .filter(|step| {
                let t = step.timestep as f64;
                t >= lo && t <= hi
            })
            .collect();

        if active.is_empty() {
            return Err(CcsrError::ScheduleEmpty { steps, t_min, t_max });
        }

        debug!(
            steps,
            active = active.len(),
            first_timestep = active[0].timestep,
            last_timestep = active[active.len() - 1].timestep,
            "Built noise schedule"
        );

        Ok(Self { spaced, active })
    }

    pub fn spaced(&self) -> &SpacedSchedule {
        &self.spaced
    }

    pub fn active(&self) -> &[ActiveStep] {
        &self.active
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn first(&self) -> ActiveStep {
        self.active[0]
    }

    pub fn last(&self) -> ActiveStep {
        self.active[self.active.len() - 1]
    }

    /// True when the window cuts off the noisiest steps: the run starts from the
    /// forward-diffused condition latent instead of pure noise.
    pub fn starts_truncated(&self) -> bool {
        self.first().index + 1 < self.spaced.len()
    }

    /// True when the window cuts off the final steps: the run ends on the
    /// predicted clean latent instead of the last sampled state.
    pub fn ends_truncated(&self) -> bool {
        self.last().index > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_schedule_endpoints() {
        let base = BaseSchedule::linear();
        assert_eq!(base.len(), NUM_TRAIN_TIMESTEPS);
        let acp = base.alphas_cumprod();
        assert!((acp[0] - (1.0 - LINEAR_BETA_START)).abs() < 1e-12);
        assert!(acp.windows(2).all(|w| w[1] < w[0]));
        // Known value for the SD/LDM schedule.
        assert!((acp[999] - 0.00466).abs() < 1e-4, "got {}", acp[999]);
    }

    #[test]
    fn test_respaced_timesteps() {
        assert_eq!(respaced_timesteps(1000, 1).unwrap(), vec![0]);
        assert_eq!(respaced_timesteps(1000, 2).unwrap(), vec![0, 999]);
        assert_eq!(
            respaced_timesteps(1000, 10).unwrap(),
            vec![0, 111, 222, 333, 444, 555, 666, 777, 888, 999]
        );
        let all = respaced_timesteps(1000, 1000).unwrap();
        assert_eq!(all, (0..1000).collect::<Vec<_>>());
        assert!(respaced_timesteps(1000, 0).is_err());
        assert!(respaced_timesteps(1000, 1001).is_err());
    }

    #[test]
    fn test_spaced_coefficients_consistent() {
        let base = BaseSchedule::linear();
        let spaced = SpacedSchedule::new(&base, 45).unwrap();
        assert_eq!(spaced.len(), 45);
        for i in 1..spaced.len() {
            assert!(spaced.alpha_cumprod(i) < spaced.alpha_cumprod(i - 1));
            assert!(spaced.posterior_log_variance_clipped(i).is_finite());
            let acp = spaced.alpha_cumprod(i);
            let acp_prev = spaced.alpha_cumprod(i - 1);
            // mean(x0, x_t) must reproduce x0 when x_t is exactly the noiseless forward sample.
            let mean = spaced.posterior_mean_coef1(i) + spaced.posterior_mean_coef2(i) * acp.sqrt();
            assert!((mean - acp_prev.sqrt()).abs() < 1e-9, "index {i}");
        }
        assert_eq!(
            spaced.posterior_log_variance_clipped(0),
            spaced.posterior_log_variance_clipped(1)
        );
    }

    #[test]
    fn test_full_window_keeps_every_step() {
        let base = BaseSchedule::linear();
        for steps in [1, 3, 10, 45] {
            let schedule = NoiseSchedule::build(&base, steps, 0.0, 1.0).unwrap();
            assert_eq!(schedule.len(), steps);
            assert!(!schedule.starts_truncated());
            assert!(!schedule.ends_truncated());
            let ts: Vec<usize> = schedule.active().iter().map(|s| s.timestep).collect();
            assert!(ts.windows(2).all(|w| w[1] < w[0]), "not decreasing: {ts:?}");
        }
    }

    #[test]
    fn test_window_gating() {
        let base = BaseSchedule::linear();
        let schedule = NoiseSchedule::build(&base, 10, 0.3333, 0.6667).unwrap();
        let ts: Vec<usize> = schedule.active().iter().map(|s| s.timestep).collect();
        // 333 < 0.3333 * 1000, so it falls outside the window.
        assert_eq!(ts, vec![666, 555, 444]);
        assert_eq!(schedule.first(), ActiveStep { index: 6, timestep: 666 });
        assert_eq!(schedule.last(), ActiveStep { index: 4, timestep: 444 });
        assert!(schedule.starts_truncated());
        assert!(schedule.ends_truncated());
    }

    #[test]
    fn test_shrinking_window_reduces_steps() {
        let base = BaseSchedule::linear();
        let windows = [(0.0, 1.0), (0.1, 0.9), (0.25, 0.75), (0.4, 0.6)];
        let counts: Vec<usize> = windows
            .iter()
            .map(|&(lo, hi)| NoiseSchedule::build(&base, 45, lo, hi).unwrap().len())
            .collect();
        assert!(counts.windows(2).all(|w| w[1] < w[0]), "{counts:?}");
    }

    #[test]
    fn test_inverted_window_is_empty() {
        let base = BaseSchedule::linear();
        let err = NoiseSchedule::build(&base, 10, 0.7, 0.3).unwrap_err();
        assert!(matches!(err, CcsrError::ScheduleEmpty { steps: 10, .. }));
    }

    #[test]
    fn test_window_between_timesteps_is_empty() {
        let base = BaseSchedule::linear();
        // 10 steps land on multiples of 111; nothing lies in [0.40, 0.42].
        let err = NoiseSchedule::build(&base, 10, 0.40, 0.42).unwrap_err();
        assert_eq!(err.kind(), "schedule_empty");
    }

    #[test]
    fn test_out_of_range_fraction() {
        let base = BaseSchedule::linear();
        let err = NoiseSchedule::build(&base, 10, -0.1, 0.5).unwrap_err();
        assert_eq!(err.kind(), "invalid_parameter");
        assert!(NoiseSchedule::build(&base, 10, 0.0, 1.5).is_err());
    }
}
