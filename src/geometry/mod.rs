use nalgebra::{Matrix3, Matrix4, Rotation3, Vector3};

/// Axis flip between the vision convention (y down, z forward) and the scene-tool
/// convention (y up, z backward): `diag(1, -1, -1, 1)`.
pub fn flip_yz() -> Matrix4<f64> {
    Matrix4::from_diagonal(&nalgebra::Vector4::new(1.0, -1.0, -1.0, 1.0))
}

/// Builds the homogeneous transform `[[R, t], [0, 0, 0, 1]]`.
pub fn rigid_transform(rotation: &Matrix3<f64>, translation: &Vector3<f64>) -> Matrix4<f64> {
    let mut transform = Matrix4::identity();
    transform.fixed_view_mut::<3, 3>(0, 0).copy_from(rotation);
    transform.fixed_view_mut::<3, 1>(0, 3).copy_from(translation);
    transform
}

/// Converts an axis-angle (Rodrigues) vector into a rotation matrix.
///
/// The direction of `rvec` is the rotation axis and its norm the angle in radians,
/// which is the representation returned by PnP solvers.
pub fn rotation_from_rodrigues(rvec: &Vector3<f64>) -> Matrix3<f64> {
    Rotation3::from_scaled_axis(*rvec).into_inner()
}

/// Derives the scene-tool object transform from a world-to-camera transform `T`:
/// `T^-1 * F` with `F = flip_yz()`.
///
/// A point in scene-tool camera axes is flipped into vision camera axes, then carried
/// to the world by `T^-1`. The identity pose therefore maps to `F`.
///
/// Returns `None` when `T` is not invertible.
pub fn scene_transform(transform: &Matrix4<f64>) -> Option<Matrix4<f64>> {
    transform.try_inverse().map(|inv| inv * flip_yz())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_scene_transform_of_identity_is_flip() {
        let scene = scene_transform(&Matrix4::identity()).unwrap();
        assert_relative_eq!(scene, flip_yz(), epsilon = 1e-12);
    }

    #[test]
    fn test_scene_transform_places_camera_center() {
        // Camera looking down +z from world origin, shifted by t in camera coordinates.
        let rotation = Matrix3::identity();
        let translation = Vector3::new(1.0, 2.0, 3.0);
        let transform = rigid_transform(&rotation, &translation);
        let scene = scene_transform(&transform).unwrap();

        // The camera center sits at -t, the camera axes are flipped in y and z.
        let expected_rotation = Matrix3::from_diagonal(&Vector3::new(1.0, -1.0, -1.0));
        assert_relative_eq!(scene.fixed_view::<3, 3>(0, 0).into_owned(), expected_rotation, epsilon = 1e-12);
        assert_relative_eq!(scene[(0, 3)], -1.0, epsilon = 1e-12);
        assert_relative_eq!(scene[(1, 3)], -2.0, epsilon = 1e-12);
        assert_relative_eq!(scene[(2, 3)], -3.0, epsilon = 1e-12);
        assert_relative_eq!(scene[(3, 3)], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_scene_transform_singular() {
        assert!(scene_transform(&Matrix4::zeros()).is_none());
    }

    #[test]
    fn test_rigid_transform_layout() {
        let rotation = rotation_from_rodrigues(&Vector3::new(0.0, 0.0, FRAC_PI_2));
        let transform = rigid_transform(&rotation, &Vector3::new(4.0, 5.0, 6.0));

        assert_relative_eq!(transform[(0, 1)], -1.0, epsilon = 1e-12);
        assert_relative_eq!(transform[(1, 0)], 1.0, epsilon = 1e-12);
        assert_eq!(transform[(0, 3)], 4.0);
        assert_eq!(transform[(1, 3)], 5.0);
        assert_eq!(transform[(2, 3)], 6.0);
        assert_eq!(transform.row(3).iter().copied().collect::<Vec<_>>(), vec![0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_rodrigues_zero_is_identity() {
        let rotation = rotation_from_rodrigues(&Vector3::zeros());
        assert_relative_eq!(rotation, Matrix3::identity(), epsilon = 1e-12);
    }
}
