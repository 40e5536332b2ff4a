//! End-to-end measurement of synthetic sources through the full stack:
//! schema registration, centroid provider, adaptive moments, PSF shape
//! and fixed-Gaussian flux, all serialized through source records.

mod common;

use std::f64::consts::PI;

use approx::assert_relative_eq;
use ndarray::Array2;

use adaptive_moments::{
    AdaptiveMomentsAlgorithm, AdaptiveMomentsConfig, CentroidEstimate, CentroidProvider, Exposure,
    GaussianFluxAlgorithm, PsfModel, Quadrupole, Schema, ShapeFlag, SourceRecord,
};

use common::{add_noise, render_gaussian};

struct KnownPositions(Vec<(f64, f64)>);

impl KnownPositions {
    fn provider(&self, index: usize) -> FixedCentroid {
        FixedCentroid(self.0[index])
    }
}

struct FixedCentroid((f64, f64));

impl CentroidProvider for FixedCentroid {
    fn centroid(&self, _record: &mut SourceRecord) -> Option<CentroidEstimate> {
        Some(CentroidEstimate {
            x: self.0 .0,
            y: self.0 .1,
        })
    }
}

struct RoundPsf(f64);

impl PsfModel for RoundPsf {
    fn shape_at(&self, _x: f64, _y: f64) -> Option<Quadrupole> {
        Some(Quadrupole::new(self.0, self.0, 0.0))
    }
}

#[test]
fn noisy_gaussian_measured_end_to_end() {
    // Amplitude 1000, sigma = 2 pixels, unit-variance noise: high
    // signal-to-noise, so shape and flux come back within a percent.
    let mut image = render_gaussian(41, (20.0, 20.0), 1000.0, 4.0, 4.0, 0.0);
    add_noise(&mut image, 1.0, 20260807);
    let variance = Array2::<f64>::ones((41, 41));
    let exposure = Exposure::new(image.view())
        .with_variance(variance.view())
        .unwrap();

    let mut schema = Schema::new();
    let algorithm =
        AdaptiveMomentsAlgorithm::new(AdaptiveMomentsConfig::default(), &mut schema, "shape");
    let mut record = schema.make_record();

    algorithm
        .measure(
            &mut record,
            &exposure,
            &FixedCentroid((20.0, 20.0)),
            Some(&RoundPsf(2.25)),
        )
        .unwrap();

    let result = algorithm.keys().get(&record);
    assert!(!result.flags.any(), "unexpected flags: {:?}", result.flags);
    assert_relative_eq!(result.shape.xx, 4.0, max_relative = 0.02);
    assert_relative_eq!(result.shape.yy, 4.0, max_relative = 0.02);
    assert!(result.shape.xy.abs() < 0.05);
    assert_relative_eq!(result.centroid.x, 20.0, epsilon = 0.05);
    assert_relative_eq!(
        result.flux.inst_flux,
        1000.0 * 2.0 * PI * 4.0,
        max_relative = 0.02
    );
    // With unit variance the flux error is a small fraction of the flux
    assert!(result.flux.inst_flux_err > 0.0);
    assert!(result.flux.inst_flux_err < 0.05 * result.flux.inst_flux);
    assert!(result.xx_err > 0.0);

    // PSF model shape stored alongside
    let psf = algorithm.keys().psf_shape(&record).unwrap();
    assert_eq!(psf.xx, 2.25);
}

#[test]
fn measurement_order_does_not_matter() {
    // Sources share the read-only exposure; measuring them in either
    // order yields identical records.
    let mut image = render_gaussian(61, (15.0, 30.0), 800.0, 2.5, 2.5, 0.0);
    image += &render_gaussian(61, (45.0, 30.0), 1200.0, 5.0, 3.0, 0.8);
    let exposure = Exposure::new(image.view());

    let positions = KnownPositions(vec![(15.0, 30.0), (45.0, 30.0)]);

    let mut schema = Schema::new();
    let algorithm =
        AdaptiveMomentsAlgorithm::new(AdaptiveMomentsConfig::default(), &mut schema, "shape");

    let measure = |order: &[usize]| -> Vec<f64> {
        let mut values = Vec::new();
        let mut records = vec![schema.make_record(), schema.make_record()];
        for &index in order {
            algorithm
                .measure(
                    &mut records[index],
                    &exposure,
                    &positions.provider(index),
                    None,
                )
                .unwrap();
        }
        for record in &records {
            let result = algorithm.keys().get(record);
            values.extend([
                result.shape.xx,
                result.shape.yy,
                result.shape.xy,
                result.flux.inst_flux,
                result.centroid.x,
            ]);
        }
        values
    };

    let forward = measure(&[0, 1]);
    let reverse = measure(&[1, 0]);
    for (a, b) in forward.iter().zip(&reverse) {
        assert_eq!(a.to_bits(), b.to_bits());
    }
}

#[test]
fn double_blob_ends_in_unweighted_fallback() {
    // A source that is two separated blobs violates the Gaussian-product
    // assumption of the weight update; the measurement must terminate in
    // the unweighted fallback, flagged but with a populated record.
    let mut image = Array2::<f64>::zeros((21, 21));
    for (x, y) in [(8, 9), (8, 11), (12, 9), (12, 11)] {
        image[[y, x]] = 1000.0;
    }
    let exposure = Exposure::new(image.view());

    let mut schema = Schema::new();
    let algorithm =
        AdaptiveMomentsAlgorithm::new(AdaptiveMomentsConfig::default(), &mut schema, "shape");
    let mut record = schema.make_record();

    algorithm
        .measure(&mut record, &exposure, &FixedCentroid((10.0, 10.0)), None)
        .unwrap();

    let result = algorithm.keys().get(&record);
    assert!(result.flags.get(ShapeFlag::Unweighted));
    assert!(result.flags.get(ShapeFlag::Failure));
    assert!(result.shape.xx.is_finite());
}

#[test]
fn source_at_image_edge_is_flagged_not_panicking() {
    let image = render_gaussian(21, (1.0, 10.0), 1000.0, 4.0, 4.0, 0.0);
    let exposure = Exposure::new(image.view());

    let mut schema = Schema::new();
    let algorithm =
        AdaptiveMomentsAlgorithm::new(AdaptiveMomentsConfig::default(), &mut schema, "shape");

    // On-edge and off-image starting positions both produce records
    for center in [(1.0, 10.0), (-30.0, 10.0)] {
        let mut record = schema.make_record();
        algorithm
            .measure(&mut record, &exposure, &FixedCentroid(center), None)
            .unwrap();
    }
}

#[test]
fn fixed_flux_follows_adaptive_shape() {
    let image = render_gaussian(41, (20.0, 20.0), 1500.0, 3.0, 3.0, 0.0);
    let variance = Array2::<f64>::from_elem((41, 41), 2.0);
    let exposure = Exposure::new(image.view())
        .with_variance(variance.view())
        .unwrap();

    let mut schema = Schema::new();
    let shape_algorithm = AdaptiveMomentsAlgorithm::new(
        AdaptiveMomentsConfig {
            do_measure_psf: false,
            ..Default::default()
        },
        &mut schema,
        "shape",
    );
    let flux_algorithm = GaussianFluxAlgorithm::new(&mut schema, "gaussian_flux");
    let mut record = schema.make_record();

    shape_algorithm
        .measure(&mut record, &exposure, &FixedCentroid((20.0, 20.0)), None)
        .unwrap();
    flux_algorithm.measure(&mut record, &exposure, shape_algorithm.keys());

    let flux_key = schema.find_value("gaussian_flux_inst_flux").unwrap();
    let err_key = schema.find_value("gaussian_flux_inst_flux_err").unwrap();
    assert_relative_eq!(
        record.value(flux_key),
        1500.0 * 2.0 * PI * 3.0,
        max_relative = 0.02
    );
    // err = 2 * sqrt(var * pi * sqrt(det)) at the measured shape
    let shape = shape_algorithm.keys().get(&record).shape;
    let expected_err = 2.0 * (2.0 * PI * shape.determinant().sqrt()).sqrt();
    assert_relative_eq!(record.value(err_key), expected_err, max_relative = 1e-9);
}
