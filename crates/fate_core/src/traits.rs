use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

/// A trait for types that can be used as scalars in generic vector fields.
/// Must support basic arithmetic, debug printing, and conversion from f64.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// Relative step used by the finite-difference Jacobian fallback.
const JACOBIAN_FD_STEP: f64 = 1e-6;

/// An autonomous vector field over a state space of fixed dimension.
///
/// Implementations must be pure: the integrators and the least action solver
/// call `apply` many times per iteration and assume identical inputs give
/// identical outputs.
pub trait VectorField {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Evaluates the velocity at `x` into `out`.
    fn apply(&self, x: &[f64], out: &mut [f64]);

    /// Evaluates a row-major batch of states (`xs.len() == n * dimension`).
    fn apply_batch(&self, xs: &[f64], out: &mut [f64]) {
        let dim = self.dimension();
        for (x, o) in xs.chunks_exact(dim).zip(out.chunks_exact_mut(dim)) {
            self.apply(x, o);
        }
    }

    /// Whether `jacobian` is backed by an exact derivative.
    ///
    /// The least action solver only uses the analytic action gradient when this
    /// returns true and falls back to differencing the action otherwise.
    fn has_jacobian(&self) -> bool {
        false
    }

    /// Writes the Jacobian `J[i, j] = ∂f_i/∂x_j` at `x` into `out` (row-major).
    /// The default differences `apply` centrally.
    fn jacobian(&self, x: &[f64], out: &mut [f64]) {
        central_difference_jacobian(self, x, out)
    }
}

/// Central finite-difference Jacobian of `field` at `x`, row-major.
pub fn central_difference_jacobian<F: VectorField + ?Sized>(field: &F, x: &[f64], out: &mut [f64]) {
    let dim = field.dimension();
    let mut probe = x.to_vec();
    let mut plus = vec![0.0; dim];
    let mut minus = vec![0.0; dim];
    for j in 0..dim {
        let h = JACOBIAN_FD_STEP * x[j].abs().max(1.0);
        probe[j] = x[j] + h;
        field.apply(&probe, &mut plus);
        probe[j] = x[j] - h;
        field.apply(&probe, &mut minus);
        probe[j] = x[j];
        for i in 0..dim {
            out[i * dim + j] = (plus[i] - minus[i]) / (2.0 * h);
        }
    }
}

impl<F: VectorField + ?Sized> VectorField for &F {
    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    fn apply(&self, x: &[f64], out: &mut [f64]) {
        (**self).apply(x, out)
    }

    fn apply_batch(&self, xs: &[f64], out: &mut [f64]) {
        (**self).apply_batch(xs, out)
    }

    fn has_jacobian(&self) -> bool {
        (**self).has_jacobian()
    }

    fn jacobian(&self, x: &[f64], out: &mut [f64]) {
        (**self).jacobian(x, out)
    }
}

/// A vector field written once over any `Scalar`, so it can be evaluated on
/// `f64` for integration and on `Dual` for exact Jacobians.
pub trait GenericField<T: Scalar> {
    fn dimension(&self) -> usize;

    fn apply(&self, x: &[T], out: &mut [T]);
}

/// A trait for solvers that can step a state through time.
pub trait Steppable {
    /// Performs one step of size dt. Negative dt integrates the same field
    /// towards earlier times.
    /// t: current time (updated after step)
    /// state: current state (updated after step)
    fn step(&mut self, field: &impl VectorField, t: &mut f64, state: &mut [f64], dt: f64);
}
