//! Packed small-vector math used by the pair kernels. The layouts are
//! C-compatible so device backends can reinterpret host slices directly.

#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[repr(C)]
pub struct Float2 {
    pub x: f32,
    pub y: f32,
}

impl Float2 {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn mul(self, other: Self) -> Self {
        Self::new(self.x * other.x, self.y * other.y)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[repr(C)]
pub struct Float3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Float3 {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    pub fn to_array(self) -> [f32; 3] {
        [self.x, self.y, self.z]
    }

    pub fn add(self, other: Self) -> Self {
        Self::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }

    pub fn sub(self, other: Self) -> Self {
        Self::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }

    pub fn scale(self, s: f32) -> Self {
        Self::new(self.x * s, self.y * s, self.z * s)
    }

    pub fn neg(self) -> Self {
        Self::new(-self.x, -self.y, -self.z)
    }

    pub fn dot(self, other: Self) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn norm2(self) -> f32 {
        self.dot(self)
    }

    pub fn norm(self) -> f32 {
        self.norm2().sqrt()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[repr(C)]
pub struct Float4 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Float4 {
    pub fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }

    pub fn from_xyz_w(v: Float3, w: f32) -> Self {
        Self::new(v.x, v.y, v.z, w)
    }

    pub fn xyz(self) -> Float3 {
        Float3::new(self.x, self.y, self.z)
    }
}

/// Pack positions and charges into the xq layout the kernels consume.
pub fn pack_xq(positions: &[Float3], charges: &[f32]) -> Vec<Float4> {
    debug_assert_eq!(positions.len(), charges.len());
    positions
        .iter()
        .zip(charges.iter())
        .map(|(&x, &q)| Float4::from_xyz_w(x, q))
        .collect()
}
