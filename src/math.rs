//! Vector types matching the engine's `Vector`, `QAngle` and `matrix3x4_t` layouts.

use std::ops::{Add, AddAssign, Mul};

/// A 3-component vector (x, y, z) matching the engine's float[3] layout.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[repr(C)]
pub struct Vector {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vector {
    pub const fn new(x: f32, y: f32, z: f32) -> Vector {
        Vector { x, y, z }
    }

    /// Checks that every component is within `tolerance` of `other`.
    pub fn approx_eq(self, other: Vector, tolerance: f32) -> bool {
        (self.x - other.x).abs() <= tolerance
            && (self.y - other.y).abs() <= tolerance
            && (self.z - other.z).abs() <= tolerance
    }
}

impl Add for Vector {
    type Output = Vector;

    fn add(self, rhs: Vector) -> Vector {
        Vector::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl AddAssign for Vector {
    fn add_assign(&mut self, rhs: Vector) {
        *self = *self + rhs;
    }
}

impl Mul<f32> for Vector {
    type Output = Vector;

    fn mul(self, rhs: f32) -> Vector {
        Vector::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

/// Euler angles in degrees, stored pitch/yaw/roll like the engine does.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[repr(C)]
pub struct QAngle {
    pub pitch: f32,
    pub yaw: f32,
    pub roll: f32,
}

impl QAngle {
    pub const fn new(pitch: f32, yaw: f32, roll: f32) -> QAngle {
        QAngle { pitch, yaw, roll }
    }
}

/// Row-major 3x4 matrix: a rotation in the first three columns and a translation in the last.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[repr(C)]
pub struct Matrix3x4(pub [[f32; 4]; 3]);

impl Matrix3x4 {
    /// Builds the entity-to-world frame for something at `origin` rotated by `angles`.
    ///
    /// Composition order is yaw, then pitch, then roll.
    pub fn from_angles(angles: QAngle, origin: Vector) -> Matrix3x4 {
        let (sy, cy) = angles.yaw.to_radians().sin_cos();
        let (sp, cp) = angles.pitch.to_radians().sin_cos();
        let (sr, cr) = angles.roll.to_radians().sin_cos();

        let crcy = cr * cy;
        let crsy = cr * sy;
        let srcy = sr * cy;
        let srsy = sr * sy;

        Matrix3x4([
            [cp * cy, sp * srcy - crsy, sp * crcy + srsy, origin.x],
            [cp * sy, sp * srsy + crcy, sp * crsy - srcy, origin.y],
            [-sp, sr * cp, cr * cp, origin.z],
        ])
    }

    /// Rotates `vector` by the rotation part of the matrix. The translation is ignored.
    pub fn rotate(&self, vector: Vector) -> Vector {
        let row = |r: &[f32; 4]| vector.x * r[0] + vector.y * r[1] + vector.z * r[2];

        Vector::new(row(&self.0[0]), row(&self.0[1]), row(&self.0[2]))
    }

    pub fn origin(&self) -> Vector {
        Vector::new(self.0[0][3], self.0[1][3], self.0[2][3])
    }
}
