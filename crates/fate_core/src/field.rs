use crate::traits::{central_difference_jacobian, VectorField};

type JacobianFn = fn(&[f64], &mut [f64]);

/// A vector field backed by closures: `func(x, out)` writes the velocity and the
/// optional `jacobian(x, out)` writes `∂f_i/∂x_j` row-major.
pub struct FnField<F, J = JacobianFn> {
    dimension: usize,
    func: F,
    jacobian: Option<J>,
}

impl<F> FnField<F>
where
    F: Fn(&[f64], &mut [f64]),
{
    pub fn new(dimension: usize, func: F) -> Self {
        Self {
            dimension,
            func,
            jacobian: None,
        }
    }
}

impl<F, J> FnField<F, J>
where
    F: Fn(&[f64], &mut [f64]),
{
    pub fn with_jacobian<J2>(self, jacobian: J2) -> FnField<F, J2>
    where
        J2: Fn(&[f64], &mut [f64]),
    {
        FnField {
            dimension: self.dimension,
            func: self.func,
            jacobian: Some(jacobian),
        }
    }
}

impl<F, J> VectorField for FnField<F, J>
where
    F: Fn(&[f64], &mut [f64]),
    J: Fn(&[f64], &mut [f64]),
{
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn apply(&self, x: &[f64], out: &mut [f64]) {
        (self.func)(x, out)
    }

    fn has_jacobian(&self) -> bool {
        self.jacobian.is_some()
    }

    fn jacobian(&self, x: &[f64], out: &mut [f64]) {
        match &self.jacobian {
            Some(jac) => jac(x, out),
            None => central_difference_jacobian(self, x, out),
        }
    }
}

/// Constant velocity everywhere. Its Jacobian is zero.
#[derive(Debug, Clone)]
pub struct ConstantField {
    pub velocity: Vec<f64>,
}

impl VectorField for ConstantField {
    fn dimension(&self) -> usize {
        self.velocity.len()
    }

    fn apply(&self, _x: &[f64], out: &mut [f64]) {
        out.copy_from_slice(&self.velocity);
    }

    fn has_jacobian(&self) -> bool {
        true
    }

    fn jacobian(&self, _x: &[f64], out: &mut [f64]) {
        out.fill(0.0);
    }
}

/// Linear field `f(x) = A (x - x*)` with `A` row-major, which has a fixed point
/// at `x*`.
#[derive(Debug, Clone)]
pub struct LinearField {
    pub matrix: Vec<f64>,
    pub fixed_point: Vec<f64>,
}

impl LinearField {
    pub fn new(matrix: Vec<f64>, fixed_point: Vec<f64>) -> Self {
        debug_assert_eq!(matrix.len(), fixed_point.len() * fixed_point.len());
        Self {
            matrix,
            fixed_point,
        }
    }
}

impl VectorField for LinearField {
    fn dimension(&self) -> usize {
        self.fixed_point.len()
    }

    fn apply(&self, x: &[f64], out: &mut [f64]) {
        let n = self.fixed_point.len();
        for i in 0..n {
            out[i] = (0..n)
                .map(|j| self.matrix[i * n + j] * (x[j] - self.fixed_point[j]))
                .sum();
        }
    }

    fn has_jacobian(&self) -> bool {
        true
    }

    fn jacobian(&self, _x: &[f64], out: &mut [f64]) {
        out.copy_from_slice(&self.matrix);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn closure_field_without_jacobian_differences_numerically() {
        let field = FnField::new(2, |x: &[f64], out: &mut [f64]| {
            out[0] = x[0] * x[1];
            out[1] = x[0].sin();
        });
        assert!(!field.has_jacobian());
        let mut jac = [0.0; 4];
        field.jacobian(&[2.0, 3.0], &mut jac);
        assert_relative_eq!(jac[0], 3.0, epsilon = 1e-6);
        assert_relative_eq!(jac[1], 2.0, epsilon = 1e-6);
        assert_relative_eq!(jac[2], 2.0f64.cos(), epsilon = 1e-6);
        assert_relative_eq!(jac[3], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn closure_field_uses_supplied_jacobian() {
        let field = FnField::new(1, |x: &[f64], out: &mut [f64]| out[0] = x[0] * x[0])
            .with_jacobian(|x: &[f64], out: &mut [f64]| out[0] = 2.0 * x[0]);
        assert!(field.has_jacobian());
        let mut jac = [0.0];
        field.jacobian(&[4.0], &mut jac);
        assert_eq!(jac[0], 8.0);
    }

    #[test]
    fn linear_field_vanishes_at_fixed_point() {
        let field = LinearField::new(vec![-1.0, 0.5, 0.0, -2.0], vec![1.0, 1.0]);
        let mut out = [1.0; 2];
        field.apply(&[1.0, 1.0], &mut out);
        assert_eq!(out, [0.0, 0.0]);

        let mut batch = [0.0; 4];
        field.apply_batch(&[2.0, 1.0, 1.0, 3.0], &mut batch);
        assert_eq!(batch, [-1.0, 0.0, 1.0, -4.0]);
    }
}
