//! Representation of axis-aligned boxes.

use nalgebra::Point3;

/// A box with orientation aligned with the coordinate system axes. The width,
/// height and depth axes are aligned with the x-, y- and z-axis respectively.
#[derive(Clone, Debug, PartialEq)]
pub struct AxisAlignedBox {
    corners: [Point3<f32>; 2],
}

impl AxisAlignedBox {
    /// Creates a new box with the given lower and upper corner points.
    pub fn new(lower_corner: Point3<f32>, upper_corner: Point3<f32>) -> Self {
        Self {
            corners: [lower_corner, upper_corner],
        }
    }

    /// Creates the axis-aligned bounding box for the set of points in the
    /// given slice.
    ///
    /// # Panics
    /// If the point slice is empty.
    pub fn aabb_for_points(points: &[Point3<f32>]) -> Self {
        assert!(
            !points.is_empty(),
            "Tried to create AABB for empty point slice"
        );

        let first_point = points[0];

        let lower_corner = points
            .iter()
            .skip(1)
            .fold(first_point, |lower_corner, point| lower_corner.inf(point));

        let upper_corner = points
            .iter()
            .skip(1)
            .fold(first_point, |upper_corner, point| upper_corner.sup(point));

        Self::new(lower_corner, upper_corner)
    }

    /// Returns a reference to the lower corner of the box.
    pub fn lower_corner(&self) -> &Point3<f32> {
        &self.corners[0]
    }

    /// Returns a reference to the upper corner of the box.
    pub fn upper_corner(&self) -> &Point3<f32> {
        &self.corners[1]
    }

    /// Returns the eight corners of the box.
    pub fn all_corners(&self) -> [Point3<f32>; 8] {
        let [lower, upper] = &self.corners;
        [
            Point3::new(lower.x, lower.y, lower.z),
            Point3::new(lower.x, lower.y, upper.z),
            Point3::new(lower.x, upper.y, lower.z),
            Point3::new(lower.x, upper.y, upper.z),
            Point3::new(upper.x, lower.y, lower.z),
            Point3::new(upper.x, lower.y, upper.z),
            Point3::new(upper.x, upper.y, lower.z),
            Point3::new(upper.x, upper.y, upper.z),
        ]
    }

    /// Returns the center point of the box.
    pub fn center(&self) -> Point3<f32> {
        nalgebra::center(self.lower_corner(), self.upper_corner())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra::point;

    #[test]
    fn aabb_for_points_bounds_every_point() {
        let points = [
            point![1.0, -2.0, 3.0],
            point![-4.0, 5.0, 0.5],
            point![2.0, 0.0, -1.0],
        ];
        let aabb = AxisAlignedBox::aabb_for_points(&points);
        assert_abs_diff_eq!(*aabb.lower_corner(), point![-4.0, -2.0, -1.0]);
        assert_abs_diff_eq!(*aabb.upper_corner(), point![2.0, 5.0, 3.0]);
    }

    #[test]
    #[should_panic]
    fn creating_aabb_for_no_points_fails() {
        AxisAlignedBox::aabb_for_points(&[]);
    }

    #[test]
    fn corners_span_the_box() {
        let aabb = AxisAlignedBox::new(point![-1.0, -2.0, -3.0], point![1.0, 2.0, 3.0]);
        let corners = aabb.all_corners();
        let recovered = AxisAlignedBox::aabb_for_points(&corners);
        assert_eq!(recovered, aabb);
        assert_abs_diff_eq!(aabb.center(), point![0.0, 0.0, 0.0]);
    }
}
