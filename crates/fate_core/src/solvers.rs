use crate::traits::{Steppable, VectorField};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Classic Runge-Kutta 4th Order Solver
pub struct RK4 {
    k1: Vec<f64>,
    k2: Vec<f64>,
    k3: Vec<f64>,
    k4: Vec<f64>,
    tmp: Vec<f64>,
}

impl RK4 {
    pub fn new(dim: usize) -> Self {
        Self {
            k1: vec![0.0; dim],
            k2: vec![0.0; dim],
            k3: vec![0.0; dim],
            k4: vec![0.0; dim],
            tmp: vec![0.0; dim],
        }
    }
}

impl Steppable for RK4 {
    fn step(&mut self, field: &impl VectorField, t: &mut f64, state: &mut [f64], dt: f64) {
        let n = state.len();

        // k1 = f(y)
        field.apply(state, &mut self.k1);

        // k2 = f(y + dt*k1/2)
        for i in 0..n {
            self.tmp[i] = state[i] + 0.5 * dt * self.k1[i];
        }
        field.apply(&self.tmp, &mut self.k2);

        // k3 = f(y + dt*k2/2)
        for i in 0..n {
            self.tmp[i] = state[i] + 0.5 * dt * self.k2[i];
        }
        field.apply(&self.tmp, &mut self.k3);

        // k4 = f(y + dt*k3)
        for i in 0..n {
            self.tmp[i] = state[i] + dt * self.k3[i];
        }
        field.apply(&self.tmp, &mut self.k4);

        for i in 0..n {
            state[i] += dt / 6.0 * (self.k1[i] + 2.0 * self.k2[i] + 2.0 * self.k3[i] + self.k4[i]);
        }

        *t += dt;
    }
}

// Tsitouras 5/4 tableau (lower triangle of A and the 5th order weights).
const TSIT5_A: [[f64; 5]; 5] = [
    [0.161, 0.0, 0.0, 0.0, 0.0],
    [-0.008480655492356989, 0.335480655492357, 0.0, 0.0, 0.0],
    [2.898, -6.359447987781783, 4.361447987781783, 0.0, 0.0],
    [
        5.325864858437957,
        -11.748883564062828,
        7.495539342889693,
        -0.09249506636030195,
        0.0,
    ],
    [
        5.86145544294642,
        -12.92096931784711,
        8.159367898576159,
        -0.071584973281401,
        -0.02826857949054663,
    ],
];

const TSIT5_B: [f64; 6] = [
    0.09646076681806523,
    0.01,
    0.4798896504144996,
    1.379008574103742,
    -3.290069515436099,
    2.324710524099774,
];

/// Tsitouras 5/4 Solver, fixed step.
pub struct Tsit5 {
    k: [Vec<f64>; 6],
    tmp: Vec<f64>,
}

impl Tsit5 {
    pub fn new(dim: usize) -> Self {
        Self {
            k: std::array::from_fn(|_| vec![0.0; dim]),
            tmp: vec![0.0; dim],
        }
    }
}

impl Steppable for Tsit5 {
    fn step(&mut self, field: &impl VectorField, t: &mut f64, state: &mut [f64], dt: f64) {
        let n = state.len();
        field.apply(state, &mut self.k[0]);

        for stage in 1..6 {
            let row = &TSIT5_A[stage - 1];
            for i in 0..n {
                let mut acc = 0.0;
                for (j, a) in row.iter().enumerate().take(stage) {
                    acc += a * self.k[j][i];
                }
                self.tmp[i] = state[i] + dt * acc;
            }
            let (_, rest) = self.k.split_at_mut(stage);
            field.apply(&self.tmp, &mut rest[0]);
        }

        for i in 0..n {
            let mut acc = 0.0;
            for (j, b) in TSIT5_B.iter().enumerate() {
                acc += b * self.k[j][i];
            }
            state[i] += dt * acc;
        }

        *t += dt;
    }
}

/// Fixed-step stepper used by the grid integrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StepperKind {
    #[default]
    Rk4,
    Tsit5,
}

impl StepperKind {
    pub(crate) fn build(self, dim: usize) -> FixedStepper {
        match self {
            StepperKind::Rk4 => FixedStepper::Rk4(RK4::new(dim)),
            StepperKind::Tsit5 => FixedStepper::Tsit5(Tsit5::new(dim)),
        }
    }
}

pub(crate) enum FixedStepper {
    Rk4(RK4),
    Tsit5(Tsit5),
}

impl FixedStepper {
    pub(crate) fn step(
        &mut self,
        field: &impl VectorField,
        t: &mut f64,
        state: &mut [f64],
        dt: f64,
    ) {
        match self {
            FixedStepper::Rk4(s) => s.step(field, t, state, dt),
            FixedStepper::Tsit5(s) => s.step(field, t, state, dt),
        }
    }
}

// Dormand-Prince 5(4) tableau. The fields are autonomous, so the nodes are not needed.
const DOPRI_A: [[f64; 6]; 6] = [
    [1.0 / 5.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [3.0 / 40.0, 9.0 / 40.0, 0.0, 0.0, 0.0, 0.0],
    [44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0, 0.0, 0.0, 0.0],
    [
        19372.0 / 6561.0,
        -25360.0 / 2187.0,
        64448.0 / 6561.0,
        -212.0 / 729.0,
        0.0,
        0.0,
    ],
    [
        9017.0 / 3168.0,
        -355.0 / 33.0,
        46732.0 / 5247.0,
        49.0 / 176.0,
        -5103.0 / 18656.0,
        0.0,
    ],
    [
        35.0 / 384.0,
        0.0,
        500.0 / 1113.0,
        125.0 / 192.0,
        -2187.0 / 6784.0,
        11.0 / 84.0,
    ],
];
// Difference between the 5th and embedded 4th order weights.
const DOPRI_E: [f64; 7] = [
    71.0 / 57600.0,
    0.0,
    -71.0 / 16695.0,
    71.0 / 1920.0,
    -17253.0 / 339200.0,
    22.0 / 525.0,
    -1.0 / 40.0,
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveSettings {
    pub rtol: f64,
    pub atol: f64,
    pub max_step: f64,
    pub max_steps: usize,
    /// Integration stops once ‖f(x)‖ drops below this speed.
    pub stop_speed: Option<f64>,
}

impl Default for AdaptiveSettings {
    fn default() -> Self {
        Self {
            rtol: 1e-3,
            atol: 1e-6,
            max_step: f64::INFINITY,
            max_steps: 100_000,
            stop_speed: None,
        }
    }
}

/// Why an adaptive integration finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    Completed,
    FixedPoint,
    MaxSteps,
}

/// Accepted steps of an adaptive run, interpolable at any time inside the
/// integrated span with cubic Hermite polynomials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseSolution {
    pub dimension: usize,
    pub times: Vec<f64>,
    pub states: Vec<f64>,
    pub derivatives: Vec<f64>,
    pub termination: Termination,
}

impl DenseSolution {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn state(&self, idx: usize) -> &[f64] {
        &self.states[idx * self.dimension..(idx + 1) * self.dimension]
    }

    fn derivative(&self, idx: usize) -> &[f64] {
        &self.derivatives[idx * self.dimension..(idx + 1) * self.dimension]
    }

    /// First and last integrated time (the last may precede the requested end
    /// when the run stopped at a fixed point).
    pub fn span(&self) -> (f64, f64) {
        (self.times[0], self.times[self.times.len() - 1])
    }

    /// Evaluates the solution at `t`. Times outside the integrated span are
    /// clamped to the nearest end state.
    pub fn evaluate(&self, t: f64) -> Vec<f64> {
        let n = self.times.len();
        let (first, last) = self.span();
        let forward = last >= first;
        let before = |a: f64, b: f64| if forward { a <= b } else { a >= b };
        if n == 1 || before(t, first) {
            return self.state(0).to_vec();
        }
        if before(last, t) {
            return self.state(n - 1).to_vec();
        }

        let idx = self.times[1..]
            .iter()
            .position(|&tk| before(t, tk))
            .unwrap_or(n - 2);
        let (t0, t1) = (self.times[idx], self.times[idx + 1]);
        let h = t1 - t0;
        if h == 0.0 {
            return self.state(idx + 1).to_vec();
        }
        let s = (t - t0) / h;
        let h00 = (1.0 + 2.0 * s) * (1.0 - s) * (1.0 - s);
        let h10 = s * (1.0 - s) * (1.0 - s);
        let h01 = s * s * (3.0 - 2.0 * s);
        let h11 = s * s * (s - 1.0);

        let (y0, y1) = (self.state(idx), self.state(idx + 1));
        let (f0, f1) = (self.derivative(idx), self.derivative(idx + 1));
        (0..self.dimension)
            .map(|i| h00 * y0[i] + h10 * h * f0[i] + h01 * y1[i] + h11 * h * f1[i])
            .collect()
    }
}

/// Dormand-Prince 5(4) with step size control and dense output.
pub struct Dopri5 {
    k: [Vec<f64>; 7],
    tmp: Vec<f64>,
    next: Vec<f64>,
}

impl Dopri5 {
    pub fn new(dim: usize) -> Self {
        Self {
            k: std::array::from_fn(|_| vec![0.0; dim]),
            tmp: vec![0.0; dim],
            next: vec![0.0; dim],
        }
    }

    /// Integrates from `t0` to `t_end` (either direction).
    pub fn integrate(
        &mut self,
        field: &impl VectorField,
        y0: &[f64],
        t0: f64,
        t_end: f64,
        settings: &AdaptiveSettings,
    ) -> Result<DenseSolution> {
        let dim = y0.len();
        if dim != field.dimension() {
            bail!(
                "Initial state dimension mismatch. Expected {}, got {}.",
                field.dimension(),
                dim
            );
        }
        if settings.rtol <= 0.0 || settings.atol <= 0.0 {
            bail!("rtol and atol must be positive.");
        }
        if settings.max_step <= 0.0 {
            bail!("max_step must be positive.");
        }

        let mut y = y0.to_vec();
        field.apply(&y, &mut self.k[0]);
        let mut solution = DenseSolution {
            dimension: dim,
            times: vec![t0],
            states: y.clone(),
            derivatives: self.k[0].clone(),
            termination: Termination::Completed,
        };
        if t_end == t0 {
            return Ok(solution);
        }
        if reached_fixed_point(&self.k[0], settings.stop_speed) {
            solution.termination = Termination::FixedPoint;
            return Ok(solution);
        }

        let direction = (t_end - t0).signum();
        let span = (t_end - t0).abs();
        let mut h = self.initial_step(&y, settings).min(settings.max_step).min(span);
        let mut t = t0;
        let mut steps = 0usize;

        while (t_end - t) * direction > 0.0 {
            if steps >= settings.max_steps {
                solution.termination = Termination::MaxSteps;
                break;
            }
            h = h.min((t_end - t).abs());
            let err = self.attempt(field, &y, direction * h, settings);
            steps += 1;

            if err <= 1.0 {
                t += direction * h;
                if (t_end - t) * direction < 1e-12 * span {
                    t = t_end;
                }
                y.copy_from_slice(&self.next);
                // FSAL: the last stage is f at the accepted state.
                self.k.swap(0, 6);
                solution.times.push(t);
                solution.states.extend_from_slice(&y);
                solution.derivatives.extend_from_slice(&self.k[0]);

                if reached_fixed_point(&self.k[0], settings.stop_speed) {
                    solution.termination = Termination::FixedPoint;
                    break;
                }
            }

            let factor = if err == 0.0 {
                5.0
            } else {
                (0.9 * err.powf(-0.2)).clamp(0.2, 5.0)
            };
            h = (h * factor).min(settings.max_step);
            if h <= f64::EPSILON * t.abs().max(1.0) {
                bail!("Step size underflow at t = {}.", t);
            }
        }

        Ok(solution)
    }

    fn initial_step(&self, y: &[f64], settings: &AdaptiveSettings) -> f64 {
        let mut d0 = 0.0;
        let mut d1 = 0.0;
        for (yi, fi) in y.iter().zip(&self.k[0]) {
            let scale = settings.atol + settings.rtol * yi.abs();
            d0 += (yi / scale).powi(2);
            d1 += (fi / scale).powi(2);
        }
        let n = y.len().max(1) as f64;
        let (d0, d1) = ((d0 / n).sqrt(), (d1 / n).sqrt());
        if d0 < 1e-5 || d1 < 1e-5 {
            1e-6
        } else {
            0.01 * d0 / d1
        }
    }

    /// One trial step from `y` with `k[0] = f(y)`. Leaves the 5th order
    /// result in `next` and returns the scaled error norm.
    fn attempt(
        &mut self,
        field: &impl VectorField,
        y: &[f64],
        h: f64,
        settings: &AdaptiveSettings,
    ) -> f64 {
        let n = y.len();
        for stage in 1..7 {
            let row = &DOPRI_A[stage - 1];
            for i in 0..n {
                let mut acc = 0.0;
                for (j, a) in row.iter().enumerate().take(stage) {
                    acc += a * self.k[j][i];
                }
                self.tmp[i] = y[i] + h * acc;
            }
            let (_, rest) = self.k.split_at_mut(stage);
            field.apply(&self.tmp, &mut rest[0]);
        }
        // The 7th stage was evaluated at the 5th order solution.
        self.next.copy_from_slice(&self.tmp);

        let mut err = 0.0;
        for i in 0..n {
            let mut e = 0.0;
            for (j, w) in DOPRI_E.iter().enumerate() {
                e += w * self.k[j][i];
            }
            let scale = settings.atol + settings.rtol * y[i].abs().max(self.next[i].abs());
            err += (h * e / scale).powi(2);
        }
        (err / n.max(1) as f64).sqrt()
    }
}

fn reached_fixed_point(velocity: &[f64], stop_speed: Option<f64>) -> bool {
    match stop_speed {
        Some(limit) => velocity.iter().map(|v| v * v).sum::<f64>().sqrt() < limit,
        None => false,
    }
}
