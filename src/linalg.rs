// Copyright (C) 2023, Alex Badics
// This file is part of ps1080-protocol
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! Small linear algebra helpers used to derive calibration coefficients.

use nalgebra::{Matrix3, Point3, Vector3};

use crate::{Error, Result};

/// Coefficients of the plane `z = a * x + b * y + c`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane {
    /// Slope along x
    pub a: f64,
    /// Slope along y
    pub b: f64,
    /// Value at the origin
    pub c: f64,
}

impl Plane {
    /// Evaluate the plane at `(x, y)`
    pub fn z_at(&self, x: f64, y: f64) -> f64 {
        self.a * x + self.b * y + self.c
    }
}

/// Solve `a * x = b` with an LU decomposition (partial pivoting).
pub fn solve3(a: &Matrix3<f64>, b: &Vector3<f64>) -> Result<Vector3<f64>> {
    a.lu()
        .solve(b)
        .ok_or(Error::Other("Singular matrix in 3x3 solve"))
}

/// Least squares fit of `z = a * x + b * y + c` over `points`.
///
/// Needs at least three points that are not collinear in the xy plane.
pub fn fit_plane(points: &[Point3<f64>]) -> Result<Plane> {
    if points.len() < 3 {
        return Err(Error::Other("Plane fitting needs at least three points"));
    }
    let mut normal = Matrix3::zeros();
    let mut rhs = Vector3::zeros();
    for p in points {
        let row = Vector3::new(1.0, p.x, p.y);
        normal += row * row.transpose();
        rhs += row * p.z;
    }
    let solution = solve3(&normal, &rhs)?;
    Ok(Plane {
        a: solution[1],
        b: solution[2],
        c: solution[0],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solve_needs_pivoting() {
        // Zero on the diagonal, works only with row exchange
        let a = Matrix3::new(0.0, 2.0, 1.0, 1.0, 1.0, 0.0, 3.0, 0.0, 1.0);
        let x = Vector3::new(1.0, -2.0, 4.0);
        let solved = solve3(&a, &(a * x)).unwrap();
        assert!((solved - x).norm() < 1e-9);
    }

    #[test]
    fn singular_matrix_is_an_error() {
        let a = Matrix3::new(1.0, 2.0, 3.0, 2.0, 4.0, 6.0, 0.0, 1.0, 1.0);
        assert!(solve3(&a, &Vector3::new(1.0, 2.0, 3.0)).is_err());
    }

    #[test]
    fn fits_exact_plane() {
        let plane = Plane {
            a: 0.5,
            b: -1.25,
            c: 30.0,
        };
        let points: Vec<_> = (0..5)
            .flat_map(|x| (0..4).map(move |y| (x as f64, y as f64)))
            .map(|(x, y)| Point3::new(x, y, plane.z_at(x, y)))
            .collect();
        let fitted = fit_plane(&points).unwrap();
        assert!((fitted.a - plane.a).abs() < 1e-9);
        assert!((fitted.b - plane.b).abs() < 1e-9);
        assert!((fitted.c - plane.c).abs() < 1e-9);
    }

    #[test]
    fn collinear_points_cannot_be_fitted() {
        let points: Vec<_> = (0..5)
            .map(|i| Point3::new(i as f64, 2.0 * i as f64, 1.0))
            .collect();
        assert!(fit_plane(&points).is_err());
    }
}
