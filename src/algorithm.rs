//! Measurement algorithms wired to schema registration and collaborators.
//!
//! An algorithm instance is created once per measurement run: it registers
//! its output fields against the shared [`Schema`] and keeps the resulting
//! keys. Per-source calls then read the initial centroid from a
//! [`CentroidProvider`], run the numeric core, and serialize the result
//! into the source's [`SourceRecord`].

use crate::adaptive::{compute_adaptive_moments, AdaptiveMomentsConfig, AdaptiveMomentsError};
use crate::flags::{FlagDefinition, FlagSet, ShapeFlag};
use crate::gaussian_flux::compute_fixed_moments_flux;
use crate::image::SourceImage;
use crate::record::{FlagKey, Schema, SourceRecord, ValueKey};
use crate::results::{AdaptiveMomentsResult, CentroidEstimate, Quadrupole};

/// Supplies the initial position estimate for a source.
///
/// Returning `None` means no usable centroid exists; the provider may
/// record its own diagnostic flags on the record before returning.
pub trait CentroidProvider {
    /// Initial `(x, y)` estimate in parent coordinates.
    fn centroid(&self, record: &mut SourceRecord) -> Option<CentroidEstimate>;
}

/// Supplies the PSF model shape at an image position.
pub trait PsfModel {
    /// Second moments of the PSF model at `(x, y)`, or `None` when the
    /// model cannot be evaluated there.
    fn shape_at(&self, x: f64, y: f64) -> Option<Quadrupole>;
}

/// Keys of the PSF-model shape fields.
#[derive(Debug, Clone, Copy)]
struct PsfShapeKeys {
    xx: ValueKey,
    yy: ValueKey,
    xy: ValueKey,
}

/// Schema keys of one adaptive-moments algorithm instance.
#[derive(Debug, Clone)]
pub struct AdaptiveMomentsKeys {
    x: ValueKey,
    y: ValueKey,
    xx: ValueKey,
    yy: ValueKey,
    xy: ValueKey,
    xx_err: ValueKey,
    yy_err: ValueKey,
    xy_err: ValueKey,
    inst_flux: ValueKey,
    inst_flux_err: ValueKey,
    flux_xx_cov: ValueKey,
    flux_yy_cov: ValueKey,
    flux_xy_cov: ValueKey,
    xx_yy_cov: ValueKey,
    xx_xy_cov: ValueKey,
    yy_xy_cov: ValueKey,
    psf: Option<PsfShapeKeys>,
    flags: Vec<Option<FlagKey>>,
}

impl AdaptiveMomentsKeys {
    /// Register every output field under `prefix` and return the keys.
    ///
    /// PSF shape fields (and the PSF failure flag) are only allocated when
    /// `do_measure_psf` is set.
    pub fn register(schema: &mut Schema, prefix: &str, do_measure_psf: bool) -> Self {
        let value = |schema: &mut Schema, name: &str, doc: &str, units: &str| {
            schema.add_value(Schema::join(prefix, name), doc, units)
        };

        let x = value(schema, "x", "elliptical Gaussian adaptive moments centroid", "pixel");
        let y = value(schema, "y", "elliptical Gaussian adaptive moments centroid", "pixel");
        let xx = value(schema, "xx", "elliptical Gaussian adaptive moments", "pixel^2");
        let yy = value(schema, "yy", "elliptical Gaussian adaptive moments", "pixel^2");
        let xy = value(schema, "xy", "elliptical Gaussian adaptive moments", "pixel^2");
        let xx_err = value(schema, "xx_err", "uncertainty of xx moment", "pixel^2");
        let yy_err = value(schema, "yy_err", "uncertainty of yy moment", "pixel^2");
        let xy_err = value(schema, "xy_err", "uncertainty of xy moment", "pixel^2");
        let inst_flux = value(
            schema,
            "inst_flux",
            "elliptical Gaussian adaptive moments flux",
            "count",
        );
        let inst_flux_err = value(schema, "inst_flux_err", "uncertainty of the flux", "count");
        let flux_xx_cov = value(
            schema,
            "inst_flux_xx_cov",
            "uncertainty covariance between flux and xx",
            "count*pixel^2",
        );
        let flux_yy_cov = value(
            schema,
            "inst_flux_yy_cov",
            "uncertainty covariance between flux and yy",
            "count*pixel^2",
        );
        let flux_xy_cov = value(
            schema,
            "inst_flux_xy_cov",
            "uncertainty covariance between flux and xy",
            "count*pixel^2",
        );
        let xx_yy_cov = value(
            schema,
            "xx_yy_cov",
            "uncertainty covariance between xx and yy",
            "pixel^4",
        );
        let xx_xy_cov = value(
            schema,
            "xx_xy_cov",
            "uncertainty covariance between xx and xy",
            "pixel^4",
        );
        let yy_xy_cov = value(
            schema,
            "yy_xy_cov",
            "uncertainty covariance between yy and xy",
            "pixel^4",
        );

        let psf = do_measure_psf.then(|| PsfShapeKeys {
            xx: value(
                schema,
                "psf_xx",
                "adaptive moments of the PSF model at the object position",
                "pixel^2",
            ),
            yy: value(
                schema,
                "psf_yy",
                "adaptive moments of the PSF model at the object position",
                "pixel^2",
            ),
            xy: value(
                schema,
                "psf_xy",
                "adaptive moments of the PSF model at the object position",
                "pixel^2",
            ),
        });

        let flags = ShapeFlag::ALL
            .iter()
            .map(|flag| {
                if *flag == ShapeFlag::PsfShapeBad && !do_measure_psf {
                    None
                } else {
                    Some(schema.add_flag(Schema::join(prefix, flag.name()), flag.doc()))
                }
            })
            .collect();

        Self {
            x,
            y,
            xx,
            yy,
            xy,
            xx_err,
            yy_err,
            xy_err,
            inst_flux,
            inst_flux_err,
            flux_xx_cov,
            flux_yy_cov,
            flux_xy_cov,
            xx_yy_cov,
            xx_xy_cov,
            yy_xy_cov,
            psf,
            flags,
        }
    }

    /// Serialize a result into a record.
    pub fn set(&self, record: &mut SourceRecord, result: &AdaptiveMomentsResult) {
        record.set_value(self.x, result.centroid.x);
        record.set_value(self.y, result.centroid.y);
        record.set_value(self.xx, result.shape.xx);
        record.set_value(self.yy, result.shape.yy);
        record.set_value(self.xy, result.shape.xy);
        record.set_value(self.xx_err, result.xx_err);
        record.set_value(self.yy_err, result.yy_err);
        record.set_value(self.xy_err, result.xy_err);
        record.set_value(self.inst_flux, result.flux.inst_flux);
        record.set_value(self.inst_flux_err, result.flux.inst_flux_err);
        record.set_value(self.flux_xx_cov, result.flux_xx_cov);
        record.set_value(self.flux_yy_cov, result.flux_yy_cov);
        record.set_value(self.flux_xy_cov, result.flux_xy_cov);
        record.set_value(self.xx_yy_cov, result.xx_yy_cov);
        record.set_value(self.xx_xy_cov, result.xx_xy_cov);
        record.set_value(self.yy_xy_cov, result.yy_xy_cov);
        for flag in ShapeFlag::ALL {
            if let Some(key) = self.flags[flag.index()] {
                record.set_flag(key, result.flags.get(*flag));
            }
        }
    }

    /// Read a previously stored result back from a record.
    pub fn get(&self, record: &SourceRecord) -> AdaptiveMomentsResult {
        let mut result = AdaptiveMomentsResult::new();
        result.centroid.x = record.value(self.x);
        result.centroid.y = record.value(self.y);
        result.shape.xx = record.value(self.xx);
        result.shape.yy = record.value(self.yy);
        result.shape.xy = record.value(self.xy);
        result.xx_err = record.value(self.xx_err);
        result.yy_err = record.value(self.yy_err);
        result.xy_err = record.value(self.xy_err);
        result.flux.inst_flux = record.value(self.inst_flux);
        result.flux.inst_flux_err = record.value(self.inst_flux_err);
        result.flux_xx_cov = record.value(self.flux_xx_cov);
        result.flux_yy_cov = record.value(self.flux_yy_cov);
        result.flux_xy_cov = record.value(self.flux_xy_cov);
        result.xx_yy_cov = record.value(self.xx_yy_cov);
        result.xx_xy_cov = record.value(self.xx_xy_cov);
        result.yy_xy_cov = record.value(self.yy_xy_cov);
        let mut flags = FlagSet::empty();
        for flag in ShapeFlag::ALL {
            if let Some(key) = self.flags[flag.index()] {
                if record.flag(key) {
                    flags.set(*flag);
                }
            }
        }
        result.flags = flags;
        result
    }

    /// Store the PSF model shape alongside the source measurement.
    pub fn set_psf_shape(&self, record: &mut SourceRecord, shape: &Quadrupole) {
        if let Some(psf) = &self.psf {
            record.set_value(psf.xx, shape.xx);
            record.set_value(psf.yy, shape.yy);
            record.set_value(psf.xy, shape.xy);
        }
    }

    /// Read the stored PSF model shape, if those fields were registered.
    pub fn psf_shape(&self, record: &SourceRecord) -> Option<Quadrupole> {
        self.psf.as_ref().map(|psf| {
            Quadrupole::new(
                record.value(psf.xx),
                record.value(psf.yy),
                record.value(psf.xy),
            )
        })
    }

    /// Raise the general failure flag on a record.
    pub fn set_failure(&self, record: &mut SourceRecord) {
        if let Some(key) = self.flags[ShapeFlag::Failure.index()] {
            record.set_flag(key, true);
        }
    }
}

/// Per-source adaptive-moments measurement bound to a schema.
#[derive(Debug, Clone)]
pub struct AdaptiveMomentsAlgorithm {
    config: AdaptiveMomentsConfig,
    keys: AdaptiveMomentsKeys,
    is_negative: Option<FlagKey>,
}

impl AdaptiveMomentsAlgorithm {
    /// Register the algorithm's fields under `prefix` and bind it to the
    /// schema.
    ///
    /// If the schema already carries an `is_negative` flag (registered by
    /// the detection stage), sources marked with it are measured in
    /// negative mode.
    pub fn new(config: AdaptiveMomentsConfig, schema: &mut Schema, prefix: &str) -> Self {
        let keys = AdaptiveMomentsKeys::register(schema, prefix, config.do_measure_psf);
        let is_negative = schema.find_flag("is_negative");
        Self {
            config,
            keys,
            is_negative,
        }
    }

    /// The schema keys this instance writes through.
    pub fn keys(&self) -> &AdaptiveMomentsKeys {
        &self.keys
    }

    /// The configuration in effect.
    pub fn config(&self) -> &AdaptiveMomentsConfig {
        &self.config
    }

    /// Measure one source and write the outcome into its record.
    ///
    /// A record is always produced: measurement problems surface as flags
    /// in the record, and a missing centroid just raises the failure flag.
    /// The only `Err` is the internal-inconsistency class, which is also
    /// recorded as a failure before propagating.
    pub fn measure<S: SourceImage>(
        &self,
        record: &mut SourceRecord,
        image: &S,
        centroids: &dyn CentroidProvider,
        psf: Option<&dyn PsfModel>,
    ) -> Result<(), AdaptiveMomentsError> {
        let Some(center) = centroids.centroid(record) else {
            self.keys.set_failure(record);
            return Ok(());
        };
        let negative = self.is_negative.map(|key| record.flag(key)).unwrap_or(false);

        let mut result =
            match compute_adaptive_moments(image, (center.x, center.y), negative, &self.config) {
                Ok(result) => result,
                Err(err) => {
                    self.keys.set_failure(record);
                    return Err(err);
                }
            };

        if self.config.do_measure_psf {
            match psf.and_then(|model| model.shape_at(result.centroid.x, result.centroid.y)) {
                Some(shape) => self.keys.set_psf_shape(record, &shape),
                None => result.flags.set(ShapeFlag::PsfShapeBad),
            }
        }

        self.keys.set(record, &result);
        Ok(())
    }
}

/// Flux at a previously measured shape, written under its own prefix.
///
/// Reads the shape and centroid stored by an [`AdaptiveMomentsAlgorithm`]
/// and measures the flux through that fixed elliptical Gaussian weight.
#[derive(Debug, Clone)]
pub struct GaussianFluxAlgorithm {
    inst_flux: ValueKey,
    inst_flux_err: ValueKey,
    failure: FlagKey,
}

impl GaussianFluxAlgorithm {
    /// Register the flux fields under `prefix`.
    pub fn new(schema: &mut Schema, prefix: &str) -> Self {
        Self {
            inst_flux: schema.add_value(
                Schema::join(prefix, "inst_flux"),
                "flux through the fixed elliptical Gaussian weight",
                "count",
            ),
            inst_flux_err: schema.add_value(
                Schema::join(prefix, "inst_flux_err"),
                "uncertainty of the flux",
                "count",
            ),
            failure: schema.add_flag(
                Schema::join(prefix, "flag"),
                "general failure flag, set if anything went wrong",
            ),
        }
    }

    /// Measure the flux of one source at its stored shape and centroid.
    pub fn measure<S: SourceImage>(
        &self,
        record: &mut SourceRecord,
        image: &S,
        shape_keys: &AdaptiveMomentsKeys,
    ) {
        let stored = shape_keys.get(record);
        let center = (stored.centroid.x, stored.centroid.y);
        match compute_fixed_moments_flux(image, &stored.shape, center) {
            Ok(flux) => {
                record.set_value(self.inst_flux, flux.inst_flux);
                record.set_value(self.inst_flux_err, flux.inst_flux_err);
            }
            Err(err) => {
                log::debug!(
                    "fixed-moments flux at ({:.1}, {:.1}) failed: {err}",
                    center.0,
                    center.1
                );
                record.set_flag(self.failure, true);
            }
        }
    }
}
