//! BundleSolutionInfo - the serializable outcome of a run.

use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::control::{ControlNet, SerialNumber};

use super::image::BundleImage;
use super::parameter_index::ImageLayout;
use super::results::{BundleResults, ImageResiduals};
use super::settings::BundleSettings;
use super::trajectory::{ImageAxis, Trajectory};

/// One image's trajectories before and after the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSolution {
    pub serial: SerialNumber,
    pub file_name: String,
    pub held: bool,
    pub initial: Trajectory,
    pub adjusted: Trajectory,
    /// Adjusted coefficient sigmas in block order (km, rad).
    pub sigmas: Option<Vec<f64>>,
    pub residuals: Option<ImageResiduals>,
}

impl ImageSolution {
    pub fn from_image(image: &BundleImage, results: &BundleResults) -> Self {
        Self {
            serial: image.serial.clone(),
            file_name: image.file_name.clone(),
            held: image.is_held(),
            initial: image.initial().clone(),
            adjusted: image.trajectory.clone(),
            sigmas: image.adjusted_sigmas().map(|s| s.as_slice().to_vec()),
            residuals: results.image_residuals(&image.serial).cloned(),
        }
    }
}

/// One row of the image report: a single polynomial coefficient.
#[derive(Debug, Clone, PartialEq)]
pub struct CoefficientRow {
    pub label: String,
    pub initial: f64,
    pub correction: f64,
    pub adjusted: f64,
    pub apriori_sigma: Option<f64>,
    pub adjusted_sigma: Option<f64>,
    /// Units of the values, then of the sigmas.
    pub units: (&'static str, &'static str),
}

fn format_optional(value: Option<f64>) -> String {
    value.map_or_else(|| "N/A".to_string(), |v| format!("{:.6}", v))
}

/// Format one coefficient row; used for every position and pointing axis.
pub fn format_coefficient_row(row: &CoefficientRow) -> String {
    format!(
        "{:<10}{:>20.8}{:>18.8}{:>20.8}{:>14}{:>14}  {}/{}",
        row.label,
        row.initial,
        row.correction,
        row.adjusted,
        format_optional(row.apriori_sigma),
        format_optional(row.adjusted_sigma),
        row.units.0,
        row.units.1
    )
}

/// Settings, results and adjusted data of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleSolutionInfo {
    pub id: String,
    /// Seconds since the Unix epoch.
    pub run_time: u64,
    pub control_network_file: Option<String>,
    pub settings: BundleSettings,
    pub results: BundleResults,
    pub images: Vec<ImageSolution>,
    pub network: ControlNet,
}

impl BundleSolutionInfo {
    pub fn new(
        settings: BundleSettings,
        results: BundleResults,
        images: &[BundleImage],
        network: ControlNet,
        control_network_file: Option<String>,
    ) -> Self {
        let run_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            id: format!("{}-{}", network.network_id, run_time),
            run_time,
            control_network_file,
            images: images
                .iter()
                .map(|img| ImageSolution::from_image(img, &results))
                .collect(),
            settings,
            results,
            network,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Rows of every coefficient of one image, position then pointing.
    ///
    /// Values are per second to the coefficient's order: positions in km
    /// with sigmas in m, angles and their sigmas in degrees.
    pub fn coefficient_rows(&self, image: &ImageSolution) -> Vec<CoefficientRow> {
        let layout = ImageLayout::from_settings(&self.settings);
        let time_scale = if image.adjusted.time_scale == 0.0 {
            1.0
        } else {
            image.adjusted.time_scale
        };

        let mut rows = Vec::new();
        for axis in ImageAxis::ALL {
            let initial = image.initial.coefficients(axis);
            for (order, adjusted) in image.adjusted.coefficients(axis).iter().enumerate() {
                let per_second = time_scale.powi(order as i32);
                let solved = !image.held && order < layout.coefficients(axis);
                let block_offset = layout.axis_offset(axis).map(|o| o + order);
                let sigma = block_offset
                    .filter(|_| solved)
                    .and_then(|k| image.sigmas.as_ref().and_then(|s| s.get(k).copied()));

                let (scale, sigma_scale, apriori, units) = if axis.is_position() {
                    let apriori = self.settings.position_sigmas.get(order).copied();
                    (1.0, 1000.0, apriori, ("km", "m"))
                } else {
                    let apriori = self.settings.pointing_sigmas.get(order).copied();
                    (1.0f64.to_degrees(), 1.0f64.to_degrees(), apriori, ("deg", "deg"))
                };
                let start = initial.get(order).copied().unwrap_or(0.0);

                rows.push(CoefficientRow {
                    label: if order == 0 {
                        axis.label().to_string()
                    } else {
                        format!("{}(t^{})", axis.label(), order)
                    },
                    initial: start * scale / per_second,
                    correction: (adjusted - start) * scale / per_second,
                    adjusted: adjusted * scale / per_second,
                    apriori_sigma: apriori.filter(|s| solved && *s > 0.0),
                    adjusted_sigma: sigma.map(|s| s * sigma_scale / per_second),
                    units,
                });
            }
        }
        rows
    }

    /// Per-image residuals and coefficient table.
    pub fn image_report(&self) -> String {
        let mut out = String::new();
        for image in &self.images {
            let _ = writeln!(
                out,
                "Image: {} ({}){}",
                image.serial,
                image.file_name,
                if image.held { " HELD" } else { "" }
            );
            if let Some(r) = &image.residuals {
                let _ = writeln!(
                    out,
                    "  residual rms (px): sample {:.4}  line {:.4}  total {:.4}  measures {}/{}",
                    r.sample.rms(),
                    r.line.rms(),
                    r.total.rms(),
                    r.used,
                    r.total_measures
                );
            }
            let _ = writeln!(
                out,
                "{:<10}{:>20}{:>18}{:>20}{:>14}{:>14}  units",
                "", "initial", "correction", "final", "apriori", "adjusted"
            );
            for row in self.coefficient_rows(image) {
                let _ = writeln!(out, "{}", format_coefficient_row(&row));
            }
            out.push('\n');
        }
        out
    }

    /// Short run summary.
    pub fn summary(&self) -> String {
        let r = &self.results;
        let mut out = String::new();
        let _ = writeln!(out, "Bundle solution {}", self.id);
        let _ = writeln!(out, "  state:               {}", r.state);
        let _ = writeln!(out, "  iterations:          {}", r.iterations);
        let _ = writeln!(out, "  sigma0:              {:.6} (initial {:.6})", r.sigma0, r.initial_sigma0);
        let _ = writeln!(out, "  observations:        {}", r.observations);
        let _ = writeln!(out, "  rejected measures:   {}", r.rejected_measures);
        let _ = writeln!(
            out,
            "  constrained params:  {} point, {} image",
            r.constrained_point_parameters, r.constrained_image_parameters
        );
        let _ = writeln!(out, "  unknowns:            {}", r.unknowns);
        let _ = writeln!(out, "  degrees of freedom:  {}", r.degrees_of_freedom);
        let _ = writeln!(
            out,
            "  residual rms (px):   sample {:.4}  line {:.4}  total {:.4}",
            r.rms_sample, r.rms_line, r.rms_total
        );
        if let Some(limit) = r.rejection_limit {
            let _ = writeln!(out, "  rejection limit:     {:.4}", limit);
        }
        for tier in &r.tiers {
            let _ = writeln!(
                out,
                "  tier {}:              {} q={:.3} c={:.6} (iteration {})",
                tier.tier,
                tier.model.name(),
                tier.quantile,
                tier.tweaking_constant,
                tier.entered_at
            );
        }
        if let Some(sigmas) = &r.point_sigmas {
            let labels = self.settings.coordinate_type.labels();
            for (label, s) in labels.iter().zip(sigmas.iter()) {
                let _ = writeln!(
                    out,
                    "  {:<9} sigma (m):  rms {:.4}  min {}  max {}",
                    label,
                    s.rms,
                    s.minimum
                        .as_ref()
                        .map_or_else(|| "N/A".to_string(), |(v, id)| format!("{:.4} ({})", v, id)),
                    s.maximum
                        .as_ref()
                        .map_or_else(|| "N/A".to_string(), |(v, id)| format!("{:.4} ({})", v, id)),
                );
            }
        }
        let _ = writeln!(
            out,
            "  elapsed:             {:.3} s (error propagation {:.3} s)",
            r.elapsed_seconds, r.error_propagation_seconds
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use approx::assert_relative_eq;
    use nalgebra::{DVector, Vector3};

    use crate::bundle::settings::PositionSolveOption;
    use crate::camera::FrameCamera;

    fn solved_image(settings: &BundleSettings) -> BundleImage {
        let layout = ImageLayout::from_settings(settings);
        let mut image = BundleImage::new(
            SerialNumber::new("img1"),
            "img1.cub",
            Arc::new(FrameCamera::new(1000.0, 0.0, 0.0)),
            Trajectory::constant(Vector3::new(1800.0, 0.0, 0.0), Vector3::new(3.0, 0.1, 0.0))
                .with_time_base(0.0, 2.0),
        );
        image.prepare(&layout);
        let mut delta = vec![0.0; layout.len()];
        delta[0] = 0.25;
        image.apply_corrections(&layout, &delta);
        image.set_adjusted_sigmas(Some(DVector::from_element(layout.len(), 0.001)));
        image
    }

    #[test]
    fn test_format_row_marks_missing_sigmas() {
        let row = CoefficientRow {
            label: "X".into(),
            initial: 1.0,
            correction: 0.5,
            adjusted: 1.5,
            apriori_sigma: None,
            adjusted_sigma: Some(2.0),
            units: ("km", "m"),
        };
        let text = format_coefficient_row(&row);
        assert!(text.starts_with("X "));
        assert!(text.contains("N/A"));
        assert!(text.contains("2.000000"));
        assert!(text.ends_with("km/m"));
    }

    #[test]
    fn test_coefficient_rows_cover_every_axis() {
        let settings = BundleSettings {
            position: PositionSolveOption::PositionVelocity,
            position_sigmas: vec![100.0],
            ..Default::default()
        };
        let image = solved_image(&settings);
        let info = BundleSolutionInfo::new(
            settings,
            BundleResults::new(),
            &[image],
            ControlNet::new("net", "Moon"),
            None,
        );

        let rows = info.coefficient_rows(&info.images[0]);
        // X, Y, Z with velocity; RA, DEC, TWI constant
        assert_eq!(rows.len(), 9);
        assert_eq!(rows[0].label, "X");
        assert_eq!(rows[1].label, "X(t^1)");
        assert_relative_eq!(rows[0].correction, 0.25);
        assert_eq!(rows[0].apriori_sigma, Some(100.0));
        assert_eq!(rows[1].apriori_sigma, None);
        assert_relative_eq!(rows[0].adjusted_sigma.unwrap(), 1.0);
        // Velocity sigma is per second: km per scaled time over the scale
        assert_relative_eq!(rows[1].adjusted_sigma.unwrap(), 0.5);
        assert_relative_eq!(rows[6].adjusted, 3.0f64.to_degrees());

        let report = info.image_report();
        assert!(report.contains("Image: img1 (img1.cub)"));
        assert_eq!(report.matches("km/m").count(), 6);
        assert_eq!(report.matches("deg/deg").count(), 3);
    }

    #[test]
    fn test_json_keeps_results_and_trajectories() {
        let settings = BundleSettings::default();
        let image = solved_image(&settings);
        let results = BundleResults {
            sigma0: 0.75,
            iterations: 4,
            converged: true,
            ..BundleResults::new()
        };
        let info = BundleSolutionInfo::new(
            settings,
            results,
            &[image],
            ControlNet::new("net", "Moon"),
            Some("net.json".into()),
        );

        let back = BundleSolutionInfo::from_json(&info.to_json().unwrap()).unwrap();
        assert_eq!(back.results.iterations, 4);
        assert_relative_eq!(back.results.sigma0, 0.75);
        assert_eq!(back.images[0].adjusted, info.images[0].adjusted);
        assert!(back.summary().contains("0.750000"));
    }
}
