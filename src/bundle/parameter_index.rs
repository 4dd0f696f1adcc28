//! Parameter index: where each unknown lives in the global unknown vector.
//!
//! The global vector is every solved image block followed by every solved
//! point triple:
//!
//! ```text
//! [ img0: X.. Y.. Z.. RA.. DEC.. (TWI..) | img1 ... | pt0: c0 c1 c2 | pt1 ... ]
//! ```
//!
//! Held images and fixed (or excluded) points take no slots. The layout is
//! only valid for the solved classes it was built from; a different twist
//! flag or degree needs a new index.

use std::ops::Range;

use super::error::BundleError;
use super::settings::BundleSettings;
use super::trajectory::ImageAxis;

/// Shape of one image parameter block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLayout {
    position_coefficients: usize,
    pointing_coefficients: usize,
    solve_twist: bool,
}

impl ImageLayout {
    pub fn new(position_coefficients: usize, pointing_coefficients: usize, solve_twist: bool) -> Self {
        Self {
            position_coefficients,
            pointing_coefficients,
            solve_twist,
        }
    }

    pub fn from_settings(settings: &BundleSettings) -> Self {
        Self::new(
            settings.position_coefficients(),
            settings.pointing_coefficients(),
            settings.solve_twist,
        )
    }

    /// Solved coefficients of one axis.
    pub fn coefficients(&self, axis: ImageAxis) -> usize {
        match axis {
            ImageAxis::X | ImageAxis::Y | ImageAxis::Z => self.position_coefficients,
            ImageAxis::RightAscension | ImageAxis::Declination => self.pointing_coefficients,
            ImageAxis::Twist if self.solve_twist => self.pointing_coefficients,
            ImageAxis::Twist => 0,
        }
    }

    pub fn position_coefficients(&self) -> usize {
        self.position_coefficients
    }

    pub fn pointing_coefficients(&self) -> usize {
        self.pointing_coefficients
    }

    /// Offset of an axis's first coefficient within the block.
    pub fn axis_offset(&self, axis: ImageAxis) -> Option<usize> {
        if self.coefficients(axis) == 0 {
            return None;
        }
        Some(
            ImageAxis::ALL
                .iter()
                .take_while(|a| **a != axis)
                .map(|a| self.coefficients(*a))
                .sum(),
        )
    }

    /// Axes with at least one solved coefficient, in block order.
    pub fn solved_axes(&self) -> impl Iterator<Item = ImageAxis> + '_ {
        ImageAxis::ALL
            .into_iter()
            .filter(move |a| self.coefficients(*a) > 0)
    }

    /// Unknowns per solved image.
    pub fn len(&self) -> usize {
        ImageAxis::ALL.iter().map(|a| self.coefficients(*a)).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Offsets of every unknown in the global unknown vector.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterIndex {
    layout: ImageLayout,
    image_offsets: Vec<Option<usize>>,
    point_offsets: Vec<Option<usize>>,
    image_unknowns: usize,
    total: usize,
}

impl ParameterIndex {
    /// Build the index.
    ///
    /// `held_images[i]` marks image `i` as held; `solved_points[j]` marks
    /// point `j` as carrying unknowns.
    pub fn new(layout: ImageLayout, held_images: &[bool], solved_points: &[bool]) -> Self {
        let mut next = 0;
        let image_offsets = held_images
            .iter()
            .map(|held| {
                if *held || layout.is_empty() {
                    None
                } else {
                    let offset = next;
                    next += layout.len();
                    Some(offset)
                }
            })
            .collect();
        let image_unknowns = next;

        let point_offsets = solved_points
            .iter()
            .map(|solved| {
                solved.then(|| {
                    let offset = next;
                    next += 3;
                    offset
                })
            })
            .collect();

        Self {
            layout,
            image_offsets,
            point_offsets,
            image_unknowns,
            total: next,
        }
    }

    pub fn layout(&self) -> &ImageLayout {
        &self.layout
    }

    /// Base offset of an image's coefficients for one axis.
    pub fn image_offset(&self, image: usize, axis: ImageAxis) -> Result<usize, BundleError> {
        let start = self.image_start(image)?;
        let within = self.layout.axis_offset(axis).ok_or_else(|| {
            BundleError::NoUnknowns(format!("axis {} of image {}", axis, image))
        })?;
        Ok(start + within)
    }

    /// Range of an image's whole block.
    pub fn image_block(&self, image: usize) -> Result<Range<usize>, BundleError> {
        let start = self.image_start(image)?;
        Ok(start..start + self.layout.len())
    }

    /// Base offset of a point's coordinate triple.
    pub fn point_offset(&self, point: usize) -> Result<usize, BundleError> {
        self.point_offsets
            .get(point)
            .ok_or(BundleError::OrdinalOutOfRange {
                entity: "point",
                ordinal: point,
            })?
            .ok_or_else(|| BundleError::NoUnknowns(format!("point {}", point)))
    }

    /// Block start of an image, `None` when held or out of range.
    pub fn image_start_of(&self, image: usize) -> Option<usize> {
        self.image_offsets.get(image).copied().flatten()
    }

    pub fn is_image_solved(&self, image: usize) -> bool {
        self.image_start_of(image).is_some()
    }

    pub fn is_point_solved(&self, point: usize) -> bool {
        matches!(self.point_offsets.get(point), Some(Some(_)))
    }

    /// Ordinals of images with unknowns, ascending.
    pub fn solved_images(&self) -> impl Iterator<Item = usize> + '_ {
        self.image_offsets
            .iter()
            .enumerate()
            .filter_map(|(i, o)| o.map(|_| i))
    }

    pub fn num_images(&self) -> usize {
        self.image_offsets.len()
    }

    pub fn num_points(&self) -> usize {
        self.point_offsets.len()
    }

    /// Unknowns in the image part (the reduced system dimension).
    pub fn image_unknowns(&self) -> usize {
        self.image_unknowns
    }

    pub fn point_unknowns(&self) -> usize {
        self.total - self.image_unknowns
    }

    pub fn num_unknowns(&self) -> usize {
        self.total
    }

    fn image_start(&self, image: usize) -> Result<usize, BundleError> {
        self.image_offsets
            .get(image)
            .ok_or(BundleError::OrdinalOutOfRange {
                entity: "image",
                ordinal: image,
            })?
            .ok_or_else(|| BundleError::NoUnknowns(format!("held image {}", image)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::error::ErrorKind;

    #[test]
    fn test_layout_offsets() {
        let layout = ImageLayout::new(2, 3, true);
        assert_eq!(layout.len(), 15);
        assert_eq!(layout.axis_offset(ImageAxis::X), Some(0));
        assert_eq!(layout.axis_offset(ImageAxis::Z), Some(4));
        assert_eq!(layout.axis_offset(ImageAxis::RightAscension), Some(6));
        assert_eq!(layout.axis_offset(ImageAxis::Twist), Some(12));
    }

    #[test]
    fn test_layout_without_twist_or_position() {
        let layout = ImageLayout::new(0, 1, false);
        assert_eq!(layout.len(), 2);
        assert_eq!(layout.axis_offset(ImageAxis::X), None);
        assert_eq!(layout.axis_offset(ImageAxis::Declination), Some(1));
        assert_eq!(layout.axis_offset(ImageAxis::Twist), None);
        let axes: Vec<_> = layout.solved_axes().collect();
        assert_eq!(axes, vec![ImageAxis::RightAscension, ImageAxis::Declination]);
    }

    #[test]
    fn test_index_skips_held_and_fixed() {
        let index = ParameterIndex::new(
            ImageLayout::new(1, 1, true),
            &[false, true, false],
            &[true, false, true],
        );
        assert_eq!(index.image_unknowns(), 12);
        assert_eq!(index.num_unknowns(), 18);
        assert_eq!(index.image_block(2).unwrap(), 6..12);
        assert_eq!(index.image_offset(2, ImageAxis::RightAscension).unwrap(), 9);
        assert_eq!(index.point_offset(0).unwrap(), 12);
        assert_eq!(index.point_offset(2).unwrap(), 15);
        assert_eq!(index.solved_images().collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn test_held_and_fixed_requests_are_programmer_errors() {
        let index = ParameterIndex::new(ImageLayout::new(1, 1, true), &[true], &[false]);
        let err = index.image_offset(0, ImageAxis::X).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Programmer);
        assert_eq!(index.point_offset(0).unwrap_err().kind(), ErrorKind::Programmer);
        assert_eq!(index.point_offset(5).unwrap_err().kind(), ErrorKind::Programmer);
    }

    #[test]
    fn test_twist_toggle_changes_layout() {
        let with = ParameterIndex::new(ImageLayout::new(0, 2, true), &[false, false], &[true]);
        let without = ParameterIndex::new(ImageLayout::new(0, 2, false), &[false, false], &[true]);
        assert_eq!(with.point_offset(0).unwrap(), 12);
        assert_eq!(without.point_offset(0).unwrap(), 8);
        assert!(without.image_offset(0, ImageAxis::Twist).is_err());
    }
}
