//! Shared helpers for integration tests: synthetic source rendering and
//! seeded noise generation.

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

/// Render a pixel-sampled elliptical Gaussian source.
#[allow(dead_code)]
pub fn render_gaussian(
    size: usize,
    center: (f64, f64),
    amplitude: f64,
    xx: f64,
    yy: f64,
    xy: f64,
) -> Array2<f64> {
    let det = xx * yy - xy * xy;
    let mut image = Array2::<f64>::zeros((size, size));
    for iy in 0..size {
        for ix in 0..size {
            let dx = ix as f64 - center.0;
            let dy = iy as f64 - center.1;
            let q = (dx * dx * yy - 2.0 * dx * dy * xy + dy * dy * xx) / det;
            image[[iy, ix]] += amplitude * (-0.5 * q).exp();
        }
    }
    image
}

/// Add seeded Gaussian noise in place.
#[allow(dead_code)]
pub fn add_noise(image: &mut Array2<f64>, sigma: f64, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, sigma).unwrap();
    image.mapv_inplace(|v| v + normal.sample(&mut rng));
}
