//! Meshing parameters.

use std::io::Write;

use hexspring_math::{BoundingBox, Vec3, FILE_PRECISION};
use hexspring_surface::{SurfaceError, TokenReader};
use serde::{Deserialize, Serialize};

/// User-facing meshing parameters. Loaded from TOML by the CLI and
/// embedded as text in the saved mesher stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Params {
    /// Smallest edge length refinement may produce.
    pub min_edge_length: f64,
    /// Narrowest gap between surfaces; measured from the models when
    /// possible.
    pub min_gap_size: f64,
    /// Edge length of the initial lattice.
    pub max_edge_length: f64,
    /// Dihedral angle threshold (degrees) for sharp-edge detection.
    pub sharp_angle_deg: f64,
    /// Lower corner of the meshed box.
    pub bounds_min: [f64; 3],
    /// Upper corner of the meshed box.
    pub bounds_max: [f64; 3],
}

impl Default for Params {
    fn default() -> Self {
        Self {
            min_edge_length: 0.01,
            min_gap_size: 0.01,
            max_edge_length: 1.0,
            sharp_angle_deg: 20.0,
            bounds_min: [0.0; 3],
            bounds_max: [1.0; 3],
        }
    }
}

impl Params {
    /// The meshed box.
    pub fn bounds(&self) -> BoundingBox {
        BoundingBox::new(
            Vec3::new(self.bounds_min[0], self.bounds_min[1], self.bounds_min[2]),
            Vec3::new(self.bounds_max[0], self.bounds_max[1], self.bounds_max[2]),
        )
    }

    /// Edge length of the initial lattice.
    pub fn calc_max_edge_length(&self) -> f64 {
        self.max_edge_length
    }

    /// Refinement floor: a sixth of the narrowest gap, or the
    /// configured minimum, whichever is smaller.
    pub fn calc_min_edge_length(&self) -> f64 {
        (self.min_gap_size / 6.0).min(self.min_edge_length)
    }

    /// Number of halvings from the max to the min edge length.
    pub fn calc_max_divisions(&self) -> usize {
        let ratio = self.calc_max_edge_length() / self.calc_min_edge_length();
        (ratio.log2() + 0.5).max(0.0) as usize
    }

    /// Reject unusable parameter combinations.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_edge_length <= 0.0 {
            return Err("max_edge_length must be positive".into());
        }
        if self.min_edge_length <= 0.0 || self.min_edge_length > self.max_edge_length {
            return Err("min_edge_length must be in (0, max_edge_length]".into());
        }
        if !(0.0..=90.0).contains(&self.sharp_angle_deg) {
            return Err("sharp_angle_deg must be in [0, 90]".into());
        }
        let bb = self.bounds();
        if bb.range().iter().any(|&r| r <= 0.0) {
            return Err("bounds must have positive extent on every axis".into());
        }
        Ok(())
    }

    /// Write the parameter block of the mesher stream.
    pub fn save(&self, out: &mut dyn Write) -> std::io::Result<()> {
        writeln!(out, "Params version 1")?;
        writeln!(out, "MINEL: {:.prec$}", self.min_edge_length, prec = FILE_PRECISION)?;
        writeln!(out, "MINGAP: {:.prec$}", self.min_gap_size, prec = FILE_PRECISION)?;
        writeln!(out, "MAXEL: {:.prec$}", self.max_edge_length, prec = FILE_PRECISION)?;
        writeln!(out, "SHARP: {:.prec$}", self.sharp_angle_deg, prec = FILE_PRECISION)?;
        write!(out, "BOUNDS:")?;
        for v in self.bounds_min.iter().chain(self.bounds_max.iter()) {
            write!(out, " {:.prec$}", v, prec = FILE_PRECISION)?;
        }
        writeln!(out)
    }

    /// Read the parameter block.
    pub fn read(tokens: &mut TokenReader<'_>) -> hexspring_surface::Result<Self> {
        tokens.expect("Params")?;
        tokens.expect("version")?;
        let version: u32 = tokens.parse()?;
        if version != 1 {
            return Err(SurfaceError::Stream(format!(
                "unsupported params version {version}"
            )));
        }
        let mut params = Self::default();
        tokens.expect("MINEL:")?;
        params.min_edge_length = tokens.parse()?;
        tokens.expect("MINGAP:")?;
        params.min_gap_size = tokens.parse()?;
        tokens.expect("MAXEL:")?;
        params.max_edge_length = tokens.parse()?;
        tokens.expect("SHARP:")?;
        params.sharp_angle_deg = tokens.parse()?;
        tokens.expect("BOUNDS:")?;
        for i in 0..3 {
            params.bounds_min[i] = tokens.parse()?;
        }
        for i in 0..3 {
            params.bounds_max[i] = tokens.parse()?;
        }
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_edge_uses_gap() {
        let params = Params {
            min_gap_size: 0.03,
            min_edge_length: 0.02,
            ..Default::default()
        };
        assert!((params.calc_min_edge_length() - 0.005).abs() < 1e-12);
    }

    #[test]
    fn test_max_divisions_rounds_log2() {
        let params = Params {
            max_edge_length: 1.0,
            min_edge_length: 0.25,
            min_gap_size: 10.0,
            ..Default::default()
        };
        assert_eq!(params.calc_max_divisions(), 2);
    }

    #[test]
    fn test_validate_rejects_bad_bounds() {
        let params = Params {
            bounds_min: [0.0; 3],
            bounds_max: [1.0, 0.0, 1.0],
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_save_read_round_trip() {
        let params = Params {
            min_edge_length: 0.05,
            min_gap_size: 0.4,
            max_edge_length: 0.5,
            sharp_angle_deg: 35.0,
            bounds_min: [-1.0, -2.0, 0.0],
            bounds_max: [1.0, 2.0, 3.0],
        };
        let mut buf = Vec::new();
        params.save(&mut buf).unwrap();
        let mut tokens = TokenReader::new(std::io::BufReader::new(buf.as_slice()));
        let restored = Params::read(&mut tokens).unwrap();
        assert!((restored.max_edge_length - params.max_edge_length).abs() < 1e-12);
        assert_eq!(restored.bounds_min, params.bounds_min);
        assert_eq!(restored.bounds_max, params.bounds_max);
    }
}
