//! Regularization operators and the augmented least-squares system.
//!
//! The regularized problem `‖Ax − y‖² + α‖Gx‖²` is solved as the stacked
//! system `[A; √α G] x ≈ [y; 0]`, where `G` is the identity (zeroth order)
//! or the forward-difference gradient (first order, optionally with
//! per-voxel weights for Huber reweighting).

use crate::operator::LinearOperator;

/// Forward differences along each axis; zero on the last plane of the axis.
/// `out` holds the three components one after another.
pub fn gradient(x: &[f64], shape: [usize; 3], out: &mut [f64]) {
    let n = x.len();
    debug_assert_eq!(out.len(), 3 * n);
    let [nx, ny, nz] = shape;
    let strides = [ny * nz, nz, 1];
    let (gx, rest) = out.split_at_mut(n);
    let (gy, gz) = rest.split_at_mut(n);
    for i in 0..nx {
        for j in 0..ny {
            for k in 0..nz {
                let idx = i * strides[0] + j * strides[1] + k;
                let xv = x[idx];
                gx[idx] = if i + 1 < nx { x[idx + strides[0]] - xv } else { 0.0 };
                gy[idx] = if j + 1 < ny { x[idx + strides[1]] - xv } else { 0.0 };
                gz[idx] = if k + 1 < nz { x[idx + strides[2]] - xv } else { 0.0 };
            }
        }
    }
}

/// Transpose of [`gradient`] (negative backward divergence).
pub fn gradient_adjoint(g: &[f64], shape: [usize; 3], out: &mut [f64]) {
    let n = out.len();
    debug_assert_eq!(g.len(), 3 * n);
    let [nx, ny, nz] = shape;
    let strides = [ny * nz, nz, 1];
    let (gx, rest) = g.split_at(n);
    let (gy, gz) = rest.split_at(n);
    for i in 0..nx {
        for j in 0..ny {
            for k in 0..nz {
                let idx = i * strides[0] + j * strides[1] + k;
                let mut v = 0.0;
                if i > 0 {
                    v += gx[idx - strides[0]];
                }
                if i + 1 < nx {
                    v -= gx[idx];
                }
                if j > 0 {
                    v += gy[idx - strides[1]];
                }
                if j + 1 < ny {
                    v -= gy[idx];
                }
                if k > 0 {
                    v += gz[idx - strides[2]];
                }
                if k + 1 < nz {
                    v -= gz[idx];
                }
                out[idx] = v;
            }
        }
    }
}

/// Per-voxel gradient magnitude.
pub fn gradient_magnitude(x: &[f64], shape: [usize; 3]) -> Vec<f64> {
    let n = x.len();
    let mut g = vec![0.0; 3 * n];
    gradient(x, shape, &mut g);
    (0..n)
        .map(|v| (g[v] * g[v] + g[n + v] * g[n + v] + g[2 * n + v] * g[2 * n + v]).sqrt())
        .collect()
}

/// Regularization operator `G`.
#[derive(Debug, Clone)]
pub enum Prior {
    Identity,
    /// Gradient rows scaled by `sqrt(w)` of their voxel, if weights are given.
    Gradient { sqrt_weights: Option<Vec<f64>> },
}

impl Prior {
    fn rows(&self, n: usize) -> usize {
        match self {
            Prior::Identity => n,
            Prior::Gradient { .. } => 3 * n,
        }
    }
}

/// `[A P; √α G P]` where `P` optionally pins unsupported voxels to zero.
pub struct AugmentedOperator<'a, A: LinearOperator + ?Sized> {
    data: &'a A,
    n_data: usize,
    shape: [usize; 3],
    sqrt_alpha: f64,
    prior: Prior,
    support: Option<&'a [bool]>,
}

impl<'a, A: LinearOperator + ?Sized> AugmentedOperator<'a, A> {
    pub fn new(
        data: &'a A,
        n_data: usize,
        shape: [usize; 3],
        alpha: f64,
        prior: Prior,
        support: Option<&'a [bool]>,
    ) -> Self {
        Self {
            data,
            n_data,
            shape,
            sqrt_alpha: alpha.sqrt(),
            prior,
            support,
        }
    }

    fn n_voxels(&self) -> usize {
        self.shape.iter().product()
    }

    fn has_prior(&self) -> bool {
        self.sqrt_alpha > 0.0
    }

    /// Right-hand side `[y; 0]`.
    pub fn rhs(&self, observed: &[f64]) -> Vec<f64> {
        let mut b = observed.to_vec();
        if self.has_prior() {
            b.resize(self.n_data + self.prior.rows(self.n_voxels()), 0.0);
        }
        b
    }

    fn project(&self, x: &mut [f64]) {
        if let Some(support) = self.support {
            for (v, &inside) in x.iter_mut().zip(support) {
                if !inside {
                    *v = 0.0;
                }
            }
        }
    }
}

impl<A: LinearOperator + ?Sized> LinearOperator for AugmentedOperator<'_, A> {
    fn apply(&self, x: &[f64]) -> Vec<f64> {
        let mut xp = x.to_vec();
        self.project(&mut xp);
        let mut out = self.data.apply(&xp);
        debug_assert_eq!(out.len(), self.n_data);
        if !self.has_prior() {
            return out;
        }
        let n = self.n_voxels();
        match &self.prior {
            Prior::Identity => {
                out.extend(xp.iter().map(|&v| self.sqrt_alpha * v));
            }
            Prior::Gradient { sqrt_weights } => {
                let start = out.len();
                out.resize(start + 3 * n, 0.0);
                let g = &mut out[start..];
                gradient(&xp, self.shape, g);
                for c in 0..3 {
                    for v in 0..n {
                        let w = sqrt_weights.as_ref().map_or(1.0, |sw| sw[v]);
                        g[c * n + v] *= self.sqrt_alpha * w;
                    }
                }
            }
        }
        out
    }

    fn apply_adjoint(&self, y: &[f64]) -> Vec<f64> {
        let (y_data, y_prior) = y.split_at(self.n_data);
        let mut out = self.data.apply_adjoint(y_data);
        if self.has_prior() {
            let n = self.n_voxels();
            match &self.prior {
                Prior::Identity => {
                    for (o, &r) in out.iter_mut().zip(y_prior) {
                        *o += self.sqrt_alpha * r;
                    }
                }
                Prior::Gradient { sqrt_weights } => {
                    let mut scaled = y_prior.to_vec();
                    for c in 0..3 {
                        for v in 0..n {
                            let w = sqrt_weights.as_ref().map_or(1.0, |sw| sw[v]);
                            scaled[c * n + v] *= self.sqrt_alpha * w;
                        }
                    }
                    let mut back = vec![0.0; n];
                    gradient_adjoint(&scaled, self.shape, &mut back);
                    for (o, b) in out.iter_mut().zip(back) {
                        *o += b;
                    }
                }
            }
        }
        self.project(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    struct Scale(f64);

    impl LinearOperator for Scale {
        fn apply(&self, x: &[f64]) -> Vec<f64> {
            x.iter().map(|v| v * self.0).collect()
        }
        fn apply_adjoint(&self, y: &[f64]) -> Vec<f64> {
            self.apply(y)
        }
    }

    fn dot(a: &[f64], b: &[f64]) -> f64 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    fn random(n: usize, seed: u64) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect()
    }

    #[test]
    fn gradient_of_ramp_is_constant_inside() {
        let shape = [3, 4, 5];
        let x: Vec<f64> = (0..60).map(|f| (f / 20) as f64 * 2.0).collect();
        let mut g = vec![0.0; 180];
        gradient(&x, shape, &mut g);
        assert_eq!(g[0], 2.0);
        assert_eq!(g[40], 0.0);
        assert!(g[60..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn gradient_adjoint_identity() {
        let shape = [4, 3, 5];
        let x = random(60, 1);
        let g = random(180, 2);
        let mut gx = vec![0.0; 180];
        gradient(&x, shape, &mut gx);
        let mut gtg = vec![0.0; 60];
        gradient_adjoint(&g, shape, &mut gtg);
        assert_relative_eq!(dot(&gx, &g), dot(&x, &gtg), epsilon = 1e-12);
    }

    #[test]
    fn augmented_operator_adjoint_identity() {
        let shape = [3, 3, 3];
        let data = Scale(0.7);
        let support: Vec<bool> = (0..27).map(|v| v % 5 != 0).collect();
        let weights: Vec<f64> = random(27, 9).iter().map(|v| v.abs() + 0.1).collect();
        for prior in [
            Prior::Identity,
            Prior::Gradient { sqrt_weights: None },
            Prior::Gradient {
                sqrt_weights: Some(weights),
            },
        ] {
            let op = AugmentedOperator::new(&data, 27, shape, 0.05, prior, Some(support.as_slice()));
            let x = random(27, 3);
            let ax = op.apply(&x);
            let y = random(ax.len(), 4);
            assert_relative_eq!(dot(&ax, &y), dot(&x, &op.apply_adjoint(&y)), epsilon = 1e-12);
        }
    }

    #[test]
    fn zero_alpha_drops_prior_rows() {
        let data = Scale(1.0);
        let op = AugmentedOperator::new(&data, 8, [2, 2, 2], 0.0, Prior::Identity, None);
        assert_eq!(op.rhs(&[1.0; 8]).len(), 8);
        assert_eq!(op.apply(&[1.0; 8]).len(), 8);
    }

    #[test]
    fn magnitude_of_linear_ramp() {
        let shape = [2, 2, 2];
        let x: Vec<f64> = (0..8).map(|f| ((f >> 2) * 3 + (f & 1) * 4) as f64).collect();
        let m = gradient_magnitude(&x, shape);
        assert_relative_eq!(m[0], 5.0, epsilon = 1e-12);
    }
}
