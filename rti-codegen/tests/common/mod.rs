//! Plant model, mock collaborators and dense reference math shared by the
//! integration tests

#![allow(dead_code)]

use rti_ir::StorageClass;
use rti_vm::{Externals, Memory, VmError};

/// Dense row-major matrix
#[derive(Debug, Clone, PartialEq)]
pub struct Mat {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f64>,
}

impl Mat {
    pub fn from_fn(rows: usize, cols: usize, f: impl Fn(usize, usize) -> f64) -> Self {
        let mut data = Vec::with_capacity(rows * cols);
        for i in 0..rows {
            for j in 0..cols {
                data.push(f(i, j));
            }
        }
        Self { rows, cols, data }
    }

    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self::from_fn(rows, cols, |_, _| 0.0)
    }

    pub fn at(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.cols + j]
    }

    pub fn t(&self) -> Mat {
        Mat::from_fn(self.cols, self.rows, |i, j| self.at(j, i))
    }

    pub fn mul(&self, other: &Mat) -> Mat {
        assert_eq!(self.cols, other.rows);
        Mat::from_fn(self.rows, other.cols, |i, j| {
            (0..self.cols).map(|k| self.at(i, k) * other.at(k, j)).sum()
        })
    }

    pub fn add(&self, other: &Mat) -> Mat {
        assert_eq!((self.rows, self.cols), (other.rows, other.cols));
        Mat::from_fn(self.rows, self.cols, |i, j| self.at(i, j) + other.at(i, j))
    }
}

pub fn assert_close(actual: f64, expected: f64, what: &str) {
    let tolerance = 1e-10 * (1.0 + expected.abs());
    assert!(
        (actual - expected).abs() <= tolerance,
        "{}: got {}, expected {}",
        what,
        actual,
        expected
    );
}

/// Stage-varying linear model and quadratic objective
#[derive(Debug, Clone, Copy)]
pub struct Model {
    pub nx: usize,
    pub nu: usize,
    pub ny: usize,
    pub nyn: usize,
    pub n: usize,
    /// Scales the continuity defects; zero gives a consistent trajectory
    pub defect_scale: f64,
}

impl Model {
    pub fn new(nx: usize, nu: usize, ny: usize, nyn: usize, n: usize) -> Self {
        Self {
            nx,
            nu,
            ny,
            nyn,
            n,
            defect_scale: 1.0,
        }
    }

    pub fn consistent(self) -> Self {
        Self {
            defect_scale: 0.0,
            ..self
        }
    }

    pub fn dims(&self) -> rti_common::Dimensions {
        rti_common::Dimensions::new(self.nx, self.nu, self.ny, self.nyn, self.n)
    }

    pub fn a(&self, stage: usize) -> Mat {
        Mat::from_fn(self.nx, self.nx, |r, c| {
            if r == c {
                1.0
            } else {
                0.1 * (stage + 1) as f64 + 0.05 * r as f64
            }
        })
    }

    pub fn b(&self, stage: usize) -> Mat {
        Mat::from_fn(self.nx, self.nu, |r, c| 0.2 + 0.1 * (stage + r + c) as f64)
    }

    pub fn defect(&self, stage: usize) -> Mat {
        Mat::from_fn(self.nx, 1, |r, _| {
            self.defect_scale * (0.01 * (stage + 1) as f64 - 0.02 * r as f64)
        })
    }

    pub fn q(&self, stage: usize) -> Mat {
        Mat::from_fn(self.nx, self.nx, |r, c| if r == c { 2.0 + stage as f64 } else { 0.1 })
    }

    pub fn s(&self, stage: usize) -> Mat {
        Mat::from_fn(self.nx, self.nu, |r, _| 0.05 * (r + 1) as f64 + 0.01 * stage as f64)
    }

    pub fn r(&self, stage: usize) -> Mat {
        Mat::from_fn(self.nu, self.nu, |r, c| if r == c { 1.0 + 0.5 * stage as f64 } else { 0.0 })
    }

    pub fn q2(&self, stage: usize) -> Mat {
        Mat::from_fn(self.nx, self.ny, |r, c| 0.3 + 0.1 * (r + c + stage) as f64)
    }

    pub fn r2(&self, _stage: usize) -> Mat {
        Mat::from_fn(self.nu, self.ny, |_, c| 0.2 - 0.05 * c as f64)
    }

    /// Output evaluated by the objective routine, before the reference is removed
    pub fn output(&self, stage: usize) -> Mat {
        Mat::from_fn(self.ny, 1, |r, _| 1.0 + stage as f64 + 0.5 * r as f64)
    }

    pub fn reference(&self, stage: usize) -> Mat {
        Mat::from_fn(self.ny, 1, |r, _| 0.25 * r as f64 + 0.5 + 0.1 * stage as f64)
    }

    pub fn qn1(&self) -> Mat {
        self.q(self.n)
    }

    pub fn qn2(&self) -> Mat {
        Mat::from_fn(self.nx, self.nyn, |r, c| 0.4 + 0.1 * (r + c) as f64)
    }

    pub fn terminal_output(&self) -> Mat {
        Mat::from_fn(self.nyn, 1, |r, _| 2.0 - 0.5 * r as f64)
    }

    pub fn terminal_reference(&self) -> Mat {
        Mat::from_fn(self.nyn, 1, |r, _| 0.75 + r as f64)
    }

    /// Stage matrices stacked on top of each other
    fn stacked(&self, m: impl Fn(usize) -> Mat) -> Vec<f64> {
        (0..self.n).flat_map(|stage| m(stage).data).collect()
    }

    /// `y` is stored with one row per stage
    pub fn references(&self) -> Vec<f64> {
        self.stacked(|stage| self.reference(stage))
    }

    /// State deviations of a plain forward sweep from `dx0` under `du`
    pub fn forward_sweep(&self, dx0: &[f64], du: &[Vec<f64>]) -> Vec<Vec<f64>> {
        let mut dx = vec![dx0.to_vec()];
        for stage in 0..self.n {
            let current = Mat {
                rows: self.nx,
                cols: 1,
                data: dx[stage].clone(),
            };
            let control = Mat {
                rows: self.nu,
                cols: 1,
                data: du[stage].clone(),
            };
            let next = self
                .a(stage)
                .mul(&current)
                .add(&self.b(stage).mul(&control))
                .add(&self.defect(stage));
            dx.push(next.data);
        }
        dx
    }

    /// Dense condensing of `stages`: block Hessian, gradient, coupling matrix and offset
    pub fn condense(&self, stages: std::ops::Range<usize>) -> (Mat, Mat, Mat, Mat) {
        let (nx, nu) = (self.nx, self.nu);
        let width = nx + stages.len() * nu;
        let mut g = Mat::from_fn(nx, width, |r, c| if r == c { 1.0 } else { 0.0 });
        let mut c = Mat::zeros(nx, 1);
        let mut h = Mat::zeros(width, width);
        let mut f = Mat::zeros(width, 1);

        for (j, stage) in stages.enumerate() {
            let cu = nx + j * nu;
            let e = Mat::from_fn(nu, width, |r, col| if col == cu + r { 1.0 } else { 0.0 });
            let (q, s, r) = (self.q(stage), self.s(stage), self.r(stage));
            let dy = Mat::from_fn(self.ny, 1, |i, _| {
                self.output(stage).at(i, 0) - self.reference(stage).at(i, 0)
            });

            let upper = q.mul(&g).add(&s.mul(&e));
            let lower = s.t().mul(&g).add(&r.mul(&e));
            h = h.add(&g.t().mul(&upper)).add(&e.t().mul(&lower));

            let state = q.mul(&c).add(&self.q2(stage).mul(&dy));
            let control = s.t().mul(&c).add(&self.r2(stage).mul(&dy));
            f = f.add(&g.t().mul(&state)).add(&e.t().mul(&control));

            g = self.a(stage).mul(&g).add(&self.b(stage).mul(&e));
            c = self.a(stage).mul(&c).add(&self.defect(stage));
        }
        (h, f, g, c)
    }
}

/// Mock model simulation, objective evaluation and QP solver
pub struct Plant {
    pub model: Model,
    pub model_status: i32,
    pub solve_status: i32,
    /// Block decisions in QP order and the terminal state, written to the
    /// solver output on every solve, failed or not
    pub solution: Option<(Vec<f64>, Vec<f64>)>,
    pub calls: Vec<String>,
}

impl Plant {
    pub fn new(model: Model) -> Self {
        Self {
            model,
            model_status: 0,
            solve_status: 0,
            solution: None,
            calls: Vec::new(),
        }
    }

    pub fn called(&self, name: &str) -> bool {
        self.calls.iter().any(|c| c == name)
    }

    fn simulate(&self, memory: &mut Memory) -> Result<(), VmError> {
        let m = &self.model;
        memory.set(StorageClass::Workspace, "evGx", &m.stacked(|k| m.a(k)))?;
        memory.set(StorageClass::Workspace, "evGu", &m.stacked(|k| m.b(k)))?;
        memory.set(StorageClass::Workspace, "d", &m.stacked(|k| m.defect(k)))?;
        Ok(())
    }

    fn evaluate(&self, memory: &mut Memory) -> Result<(), VmError> {
        let m = &self.model;
        memory.set(StorageClass::Workspace, "Q1", &m.stacked(|k| m.q(k)))?;
        memory.set(StorageClass::Workspace, "S1", &m.stacked(|k| m.s(k)))?;
        memory.set(StorageClass::Workspace, "R1", &m.stacked(|k| m.r(k)))?;
        memory.set(StorageClass::Workspace, "Q2", &m.stacked(|k| m.q2(k)))?;
        memory.set(StorageClass::Workspace, "R2", &m.stacked(|k| m.r2(k)))?;
        memory.set(StorageClass::Workspace, "Dy", &m.stacked(|k| m.output(k)))?;
        memory.set(StorageClass::Workspace, "QN1", &m.qn1().data)?;
        memory.set(StorageClass::Workspace, "QN2", &m.qn2().data)?;
        memory.set(StorageClass::Workspace, "DyN", &m.terminal_output().data)?;
        Ok(())
    }
}

impl Externals for Plant {
    fn call(&mut self, name: &str, memory: &mut Memory) -> Result<i32, VmError> {
        self.calls.push(name.to_string());
        match name {
            "modelSimulation" => {
                if self.model_status == 0 {
                    self.simulate(memory)?;
                }
                Ok(self.model_status)
            }
            "evaluateObjective" => {
                self.evaluate(memory)?;
                Ok(0)
            }
            "forces_solve" => {
                if let Some((z, zn)) = &self.solution {
                    // The decisions of a shorter last block have their own field
                    let tail = memory
                        .get(StorageClass::QpOutput, "zLast")
                        .map(|last| last.len())
                        .unwrap_or(0);
                    let (full, last) = z.split_at(z.len() - tail);
                    memory.set(StorageClass::QpOutput, "z", full)?;
                    if tail > 0 {
                        memory.set(StorageClass::QpOutput, "zLast", last)?;
                    }
                    memory.set(StorageClass::QpOutput, "zN", zn)?;
                }
                Ok(self.solve_status)
            }
            "initializeForces" => Ok(0),
            other => Err(VmError::External {
                name: other.to_string(),
                message: "not provided by the test plant".to_string(),
            }),
        }
    }
}

/// Solver decisions laid out with the uniform block stride
pub fn block_decisions(
    model: &Model,
    block_size: usize,
    dx: &[Vec<f64>],
    du: &[Vec<f64>],
) -> Vec<f64> {
    let (nx, nu, n) = (model.nx, model.nu, model.n);
    let nb = n.div_ceil(block_size);
    let stride = nx + block_size * nu;
    let mut z = vec![0.0; nb * nx + n * nu];
    for k in 0..nb {
        let start = k * block_size;
        let end = (start + block_size).min(n);
        z[k * stride..k * stride + nx].copy_from_slice(&dx[start]);
        for (i, stage) in (start..end).enumerate() {
            let at = k * stride + nx + i * nu;
            z[at..at + nu].copy_from_slice(&du[stage]);
        }
    }
    z
}

/// Deterministic trajectory values that are not all zero
pub fn trajectory(rows: usize, cols: usize, seed: f64) -> Vec<f64> {
    (0..rows * cols).map(|i| seed + 0.125 * i as f64).collect()
}
