//! LSMR solver
//!
//! Least Squares Minimal Residual algorithm for
//! min ||Ax - b||₂² + damp²·||x||₂², with an optional starting point.
//!
//! Besides the iterate, the solver tracks estimates of ||r||, ||Aᵀr||,
//! ||A|| and cond(A) through the short recurrences of the method, which
//! drive the stopping rules. ||r_k|| is non-increasing in exact arithmetic.
//!
//! Reference:
//! Fong & Saunders, "LSMR: An iterative algorithm for sparse
//! least-squares problems", SISC 2011.

use log::debug;
use serde::Serialize;

use crate::operator::LinearOperator;

#[derive(Debug, Clone, Copy)]
pub struct LsmrOptions {
    pub damp: f64,
    /// Relative tolerance on ||Aᵀr|| and on the error in A.
    pub atol: f64,
    /// Relative tolerance on the error in b.
    pub btol: f64,
    /// Stop when the estimated condition number exceeds this (0 disables).
    pub conlim: f64,
    pub max_iter: usize,
}

impl LsmrOptions {
    pub fn new(tol: f64, max_iter: usize) -> Self {
        Self {
            damp: 0.0,
            atol: tol,
            btol: tol,
            conlim: 1e8,
            max_iter,
        }
    }
}

/// Why the iteration stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LsmrStop {
    /// The starting point already solves the problem.
    StartingPointExact,
    /// Ax ≈ b within `atol`/`btol`.
    ResidualTolerance,
    /// Least-squares optimality within `atol`.
    LeastSquaresTolerance,
    /// Estimated cond(A) reached `conlim`.
    ConditionLimit,
    /// Ax = b to machine precision.
    MachineResidual,
    /// Least-squares optimality to machine precision.
    MachineLeastSquares,
    /// cond(A) too large for machine precision.
    MachineCondition,
    IterationLimit,
}

impl LsmrStop {
    pub fn reached_tolerance(&self) -> bool {
        !matches!(
            self,
            LsmrStop::IterationLimit | LsmrStop::ConditionLimit | LsmrStop::MachineCondition
        )
    }
}

#[derive(Debug, Clone)]
pub struct LsmrOutcome {
    pub x: Vec<f64>,
    pub stop: LsmrStop,
    pub iterations: usize,
    /// Estimated ||b - Ax|| before the first and after every iteration.
    pub residual_history: Vec<f64>,
    pub norm_ar: f64,
    pub norm_a: f64,
    pub cond_a: f64,
}

/// Solve `min ||Ax - b||` starting from `x0` (zero if `None`).
pub fn lsmr<A>(op: &A, b: &[f64], x0: Option<&[f64]>, opts: &LsmrOptions) -> LsmrOutcome
where
    A: LinearOperator + ?Sized,
{
    let damp = opts.damp;
    let norm_b = norm(b);

    let mut u = b.to_vec();
    let mut x = match x0 {
        Some(x0) => {
            if x0.iter().any(|&v| v != 0.0) {
                let ax = op.apply(x0);
                for (ui, axi) in u.iter_mut().zip(&ax) {
                    *ui -= axi;
                }
            }
            x0.to_vec()
        }
        None => Vec::new(),
    };
    let mut beta = norm(&u);
    if beta > 0.0 {
        scale(&mut u, 1.0 / beta);
    }

    let mut v = op.apply_adjoint(&u);
    let n = v.len();
    if x.is_empty() {
        x = vec![0.0; n];
    }
    let mut alpha = norm(&v);
    if alpha > 0.0 {
        scale(&mut v, 1.0 / alpha);
    }

    // Bidiagonalization and QR state.
    let mut zetabar = alpha * beta;
    let mut alphabar = alpha;
    let mut rho = 1.0;
    let mut rhobar = 1.0;
    let mut cbar = 1.0;
    let mut sbar = 0.0;
    let mut h = v.clone();
    let mut hbar = vec![0.0; n];

    // ||r|| estimation.
    let mut betadd = beta;
    let mut betad = 0.0;
    let mut rhodold = 1.0;
    let mut tautildeold = 0.0;
    let mut thetatilde = 0.0;
    let mut zeta = 0.0;
    let mut d = 0.0;

    // ||A|| and cond(A) estimation.
    let mut norm_a2 = alpha * alpha;
    let mut maxrbar: f64 = 0.0;
    let mut minrbar: f64 = 1e100;
    let mut norm_a = norm_a2.sqrt();
    let mut cond_a = 1.0;

    let ctol = if opts.conlim > 0.0 { 1.0 / opts.conlim } else { 0.0 };
    let mut norm_r = beta;
    let mut norm_ar = alpha * beta;
    let mut residual_history = vec![norm_r];

    if norm_ar == 0.0 || norm_b == 0.0 {
        if norm_b == 0.0 {
            x.iter_mut().for_each(|xi| *xi = 0.0);
            norm_r = 0.0;
            residual_history[0] = 0.0;
        }
        return LsmrOutcome {
            x,
            stop: LsmrStop::StartingPointExact,
            iterations: 0,
            residual_history,
            norm_ar,
            norm_a,
            cond_a,
        };
    }

    let mut stop = LsmrStop::IterationLimit;
    let mut itn = 0;
    while itn < opts.max_iter {
        itn += 1;

        // Bidiagonalization
        let av = op.apply(&v);
        for (ui, avi) in u.iter_mut().zip(&av) {
            *ui = avi - alpha * *ui;
        }
        beta = norm(&u);
        if beta > 0.0 {
            scale(&mut u, 1.0 / beta);
            let atu = op.apply_adjoint(&u);
            for (vi, atui) in v.iter_mut().zip(&atu) {
                *vi = atui - beta * *vi;
            }
            alpha = norm(&v);
            if alpha > 0.0 {
                scale(&mut v, 1.0 / alpha);
            }
        }

        // Rotation eliminating the damping term.
        let (chat, shat, alphahat) = sym_ortho(alphabar, damp);

        // Plane rotation Q_i.
        let rhoold = rho;
        let (c, s, rho_new) = sym_ortho(alphahat, beta);
        rho = rho_new;
        let thetanew = s * alpha;
        alphabar = c * alpha;

        // Plane rotation Qbar_i.
        let rhobarold = rhobar;
        let zetaold = zeta;
        let thetabar = sbar * rho;
        let rhotemp = cbar * rho;
        let (cb, sb, rb) = sym_ortho(cbar * rho, thetanew);
        cbar = cb;
        sbar = sb;
        rhobar = rb;
        zeta = cbar * zetabar;
        zetabar = -sbar * zetabar;

        if rho == 0.0 || rhobar == 0.0 {
            stop = LsmrStop::MachineCondition;
            break;
        }

        // Update h, hbar, x.
        let hbar_scale = thetabar * rho / (rhoold * rhobarold);
        let x_scale = zeta / (rho * rhobar);
        let h_scale = thetanew / rho;
        for i in 0..n {
            hbar[i] = h[i] - hbar_scale * hbar[i];
            x[i] += x_scale * hbar[i];
            h[i] = v[i] - h_scale * h[i];
        }

        // Estimate ||r||.
        let betaacute = chat * betadd;
        let betacheck = -shat * betadd;
        let betahat = c * betaacute;
        betadd = -s * betaacute;

        let thetatildeold = thetatilde;
        let (ctildeold, stildeold, rhotildeold) = sym_ortho(rhodold, thetabar);
        thetatilde = stildeold * rhobar;
        rhodold = ctildeold * rhobar;
        betad = -stildeold * betad + ctildeold * betahat;

        tautildeold = (zetaold - thetatildeold * tautildeold) / rhotildeold;
        let taud = (zeta - thetatilde * tautildeold) / rhodold;
        d += betacheck * betacheck;
        norm_r = (d + (betad - taud).powi(2) + betadd * betadd).sqrt();
        residual_history.push(norm_r);

        // Estimate ||A|| and cond(A).
        norm_a2 += beta * beta;
        norm_a = norm_a2.sqrt();
        norm_a2 += alpha * alpha;

        maxrbar = maxrbar.max(rhobarold);
        if itn > 1 {
            minrbar = minrbar.min(rhobarold);
        }
        cond_a = maxrbar.max(rhotemp) / minrbar.min(rhotemp);

        // Stopping rules.
        norm_ar = zetabar.abs();
        let norm_x = norm(&x);
        let test1 = norm_r / norm_b;
        let test2 = if norm_a * norm_r != 0.0 {
            norm_ar / (norm_a * norm_r)
        } else {
            f64::INFINITY
        };
        let test3 = 1.0 / cond_a;
        let t1 = test1 / (1.0 + norm_a * norm_x / norm_b);
        let rtol = opts.btol + opts.atol * norm_a * norm_x / norm_b;

        debug!(
            "lsmr iter {itn}: |r| = {norm_r:.6e}, |A'r| = {norm_ar:.6e}, cond(A) = {cond_a:.3e}"
        );

        let mut istop = None;
        if 1.0 + test3 <= 1.0 {
            istop = Some(LsmrStop::MachineCondition);
        }
        if 1.0 + test2 <= 1.0 {
            istop = Some(LsmrStop::MachineLeastSquares);
        }
        if 1.0 + t1 <= 1.0 {
            istop = Some(LsmrStop::MachineResidual);
        }
        if test3 <= ctol {
            istop = Some(LsmrStop::ConditionLimit);
        }
        if test2 <= opts.atol {
            istop = Some(LsmrStop::LeastSquaresTolerance);
        }
        if test1 <= rtol {
            istop = Some(LsmrStop::ResidualTolerance);
        }
        if let Some(reason) = istop {
            stop = reason;
            break;
        }
    }

    LsmrOutcome {
        x,
        stop,
        iterations: itn,
        residual_history,
        norm_ar,
        norm_a,
        cond_a,
    }
}

/// Stable Givens rotation `(c, s, r)` with `c·a + s·b = r`.
fn sym_ortho(a: f64, b: f64) -> (f64, f64, f64) {
    if b == 0.0 {
        return (sign(a), 0.0, a.abs());
    }
    if a == 0.0 {
        return (0.0, sign(b), b.abs());
    }
    if b.abs() > a.abs() {
        let tau = a / b;
        let s = sign(b) / (1.0 + tau * tau).sqrt();
        let c = s * tau;
        (c, s, b / s)
    } else {
        let tau = b / a;
        let c = sign(a) / (1.0 + tau * tau).sqrt();
        let s = c * tau;
        (c, s, a / c)
    }
}

fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

pub(crate) fn norm(v: &[f64]) -> f64 {
    v.iter().map(|&x| x * x).sum::<f64>().sqrt()
}

fn scale(v: &mut [f64], factor: f64) {
    v.iter_mut().for_each(|x| *x *= factor);
}
