// Copyright (C) 2023, Alex Badics
// This file is part of ps1080-protocol
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! Shift to depth conversion. See [`ShiftToDepthTables`]
//!
//! The depth sensor reports disparity ("shift") values. Depth is triangulated from the shift,
//! the reference plane the sensor was calibrated against, and the emitter to sensor baseline.
//! The result is cached in two lookup tables: shift to depth, and its step-function inverse.

use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::{Error, Result};

/// Largest shift value the PS1080 can report, plus one
pub const MAX_SHIFT_VALUE: u32 = 2048;
/// Default device max depth for millimeter output
pub const MAX_DEPTH_1_MM: u32 = 10000;
/// Default device max depth for 100 micrometer output
pub const MAX_DEPTH_100_UM: u32 = 65534;

/// Calibration and cut-off parameters the tables are built from
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShiftToDepthConfig {
    /// Distance of the reference plane, in depth units
    pub zero_plane_distance: u16,
    /// Pixel size at the reference plane
    pub zero_plane_pixel_size: f64,
    /// Distance between the emitter and the depth CMOS
    pub emitter_distance: f64,
    /// Largest shift value the device produces
    pub device_max_shift: u32,
    /// Largest depth value the device produces (not a cut-off)
    pub device_max_depth: u32,
    /// Shift offset
    pub const_shift: u32,
    /// Pixel binning factor
    pub pixel_size_factor: u32,
    /// Sub-pixel resolution of the shift values
    pub param_coeff: u32,
    /// Output unit multiplier
    pub shift_scale: u32,
    /// Depths at or below this are dropped
    pub min_cut_off: u16,
    /// Depths at or above this are dropped
    pub max_cut_off: u16,
}

impl Default for ShiftToDepthConfig {
    /// Typical Carmine 1.08 calibration
    fn default() -> Self {
        Self {
            zero_plane_distance: 120,
            zero_plane_pixel_size: 0.1042,
            emitter_distance: 7.5,
            device_max_shift: MAX_SHIFT_VALUE - 1,
            device_max_depth: MAX_DEPTH_1_MM,
            const_shift: 200,
            pixel_size_factor: 1,
            param_coeff: 4,
            shift_scale: 10,
            min_cut_off: 0,
            max_cut_off: MAX_DEPTH_1_MM as u16,
        }
    }
}

/// The shift-to-depth table, and its depth-to-shift inverse.
///
/// `shift_to_depth` has `device_max_shift + 1` entries, `depth_to_shift` has
/// `device_max_depth + 1`. Shifts whose depth falls outside the cut-offs map to zero.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShiftToDepthTables {
    shift_to_depth: Vec<u16>,
    depth_to_shift: Vec<u16>,
}

impl ShiftToDepthTables {
    /// Allocate zeroed tables sized for `config` and fill them.
    pub fn init(config: &ShiftToDepthConfig) -> Result<Self> {
        let mut tables = Self {
            shift_to_depth: vec![0; config.device_max_shift as usize + 1],
            depth_to_shift: vec![0; config.device_max_depth as usize + 1],
        };
        tables.update(config)?;
        Ok(tables)
    }

    /// Recompute the values of already allocated tables.
    ///
    /// Fails with [`Error::InvalidMaxShift`] or [`Error::InvalidMaxDepth`] if `config` needs
    /// bigger tables than the allocated ones. Those changes need a new [`ShiftToDepthTables::init`].
    pub fn update(&mut self, config: &ShiftToDepthConfig) -> Result<()> {
        if config.device_max_shift as usize + 1 > self.shift_to_depth.len() {
            return Err(Error::InvalidMaxShift);
        }
        if config.device_max_depth as usize + 1 > self.depth_to_shift.len() {
            return Err(Error::InvalidMaxDepth);
        }
        if config.pixel_size_factor == 0 || config.param_coeff == 0 {
            return Err(Error::Other("Pixel size factor and param coeff must be non-zero"));
        }

        let plane_pixel_size = config.zero_plane_pixel_size * config.pixel_size_factor as f64;
        let plane_dsr = config.zero_plane_distance as f64;
        let plane_dcl = config.emitter_distance;
        let const_shift =
            (config.param_coeff as i64 * config.const_shift as i64) / config.pixel_size_factor as i64;
        let max_depth = config.device_max_depth.min(config.max_cut_off as u32) as f64;
        let min_depth = config.min_cut_off as f64;

        self.shift_to_depth.fill(0);
        self.depth_to_shift.fill(0);

        let mut last_depth: usize = 0;
        let mut last_index: u16 = 0;
        for index in 1..config.device_max_shift as usize {
            let fixed_ref_x =
                (index as i64 - const_shift) as f64 / config.param_coeff as f64 - 0.375;
            let metric = fixed_ref_x * plane_pixel_size;
            let depth = config.shift_scale as f64
                * ((metric * plane_dsr / (plane_dcl - metric)) + plane_dsr);

            if depth > min_depth && depth < max_depth {
                self.shift_to_depth[index] = depth as u16;
                let mut i = last_depth;
                while (i as f64) < depth {
                    self.depth_to_shift[i] = last_index;
                    i += 1;
                }
                last_index = index as u16;
                last_depth = depth as usize;
            }
        }

        for entry in self.depth_to_shift[last_depth..=config.device_max_depth as usize].iter_mut()
        {
            *entry = last_index;
        }

        debug!(
            max_shift = config.device_max_shift,
            max_depth = config.device_max_depth,
            last_index,
            last_depth,
            "shift to depth tables updated"
        );
        Ok(())
    }

    /// Look up every shift in `shifts` and store the depth in `depths`.
    ///
    /// Shift values must be smaller than the table. An out of range shift panics.
    pub fn convert(&self, shifts: &[u16], depths: &mut [u16]) {
        debug_assert_eq!(shifts.len(), depths.len());
        for (depth, &shift) in depths.iter_mut().zip(shifts) {
            *depth = self.shift_to_depth[shift as usize];
        }
    }

    /// Depth for a single shift value. Panics if `shift` is outside the table.
    #[inline]
    pub fn depth(&self, shift: u16) -> u16 {
        self.shift_to_depth[shift as usize]
    }

    /// Release both tables. Calling it again is a no-op.
    pub fn free(&mut self) {
        self.shift_to_depth = Vec::new();
        self.depth_to_shift = Vec::new();
    }

    /// `false` before `init` and after `free`
    pub fn is_initialized(&self) -> bool {
        !self.shift_to_depth.is_empty()
    }

    /// Depth indexed by shift
    pub fn shift_to_depth(&self) -> &[u16] {
        &self.shift_to_depth
    }

    /// Shift indexed by depth
    pub fn depth_to_shift(&self) -> &[u16] {
        &self.depth_to_shift
    }
}

/// Tables shared between the decode path and whoever rebuilds them.
///
/// Readers take an [`Arc`] snapshot and keep using it for a whole chunk, while a rebuild
/// swaps a fresh table set in. The old one is freed when the last reader lets go.
#[derive(Debug, Default)]
pub struct SharedTables {
    current: RwLock<Arc<ShiftToDepthTables>>,
}

impl SharedTables {
    /// Share `tables`
    pub fn new(tables: ShiftToDepthTables) -> Self {
        Self {
            current: RwLock::new(Arc::new(tables)),
        }
    }

    /// The current tables
    pub fn snapshot(&self) -> Arc<ShiftToDepthTables> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swap in a new table set
    pub fn replace(&self, tables: ShiftToDepthTables) {
        *self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(tables);
    }

    /// Copy the current tables, change the copy with `f`, and swap it in.
    /// If `f` fails, the current tables stay.
    pub fn modify(&self, f: impl FnOnce(&mut ShiftToDepthTables) -> Result<()>) -> Result<()> {
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut tables = ShiftToDepthTables::clone(&guard);
        f(&mut tables)?;
        *guard = Arc::new(tables);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_config() -> ShiftToDepthConfig {
        ShiftToDepthConfig {
            zero_plane_distance: 120,
            zero_plane_pixel_size: 0.1,
            emitter_distance: 7.5,
            device_max_shift: 2047,
            device_max_depth: 10000,
            const_shift: 200,
            pixel_size_factor: 1,
            param_coeff: 4,
            shift_scale: 10,
            min_cut_off: 50,
            max_cut_off: 9999,
        }
    }

    #[test]
    fn reference_calibration() {
        let tables = ShiftToDepthTables::init(&reference_config()).unwrap();
        assert_eq!(tables.shift_to_depth().len(), 2048);
        assert_eq!(tables.depth_to_shift().len(), 10001);
        assert_eq!(tables.shift_to_depth()[0], 0);

        let last_valid = tables
            .shift_to_depth()
            .iter()
            .rposition(|&d| d != 0)
            .unwrap();
        assert_eq!(last_valid, 1065);
        assert_eq!(tables.shift_to_depth()[1065], 9863);
        assert_eq!(tables.shift_to_depth()[1066], 0);
        assert_eq!(tables.depth_to_shift()[9999] as usize, last_valid);
        assert_eq!(tables.depth_to_shift()[10000] as usize, last_valid);
    }

    #[test]
    fn depth_to_shift_is_monotonic() {
        let tables = ShiftToDepthTables::init(&reference_config()).unwrap();
        assert!(tables.depth_to_shift().windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn round_trip_within_cut_offs() {
        let config = reference_config();
        let tables = ShiftToDepthTables::init(&config).unwrap();
        for (shift, &depth) in tables.shift_to_depth().iter().enumerate() {
            if depth <= config.min_cut_off || depth >= config.max_cut_off {
                continue;
            }
            let back = tables.depth_to_shift()[depth as usize];
            assert!(back as usize >= shift, "shift {shift} depth {depth} back {back}");
            assert!(tables.depth(back) <= depth);
        }
    }

    #[test]
    fn cut_offs_are_respected() {
        let mut config = reference_config();
        config.min_cut_off = 500;
        config.max_cut_off = 4000;
        let tables = ShiftToDepthTables::init(&config).unwrap();
        assert!(tables
            .shift_to_depth()
            .iter()
            .all(|&d| d == 0 || (d >= 500 && d < 4000)));
    }

    #[test]
    fn unrepresentable_depths_are_dropped() {
        let mut config = reference_config();
        config.shift_scale = 1000;
        config.device_max_depth = 65534;
        config.max_cut_off = u16::MAX;
        let tables = ShiftToDepthTables::init(&config).unwrap();
        assert!(tables.shift_to_depth().iter().all(|&d| d < 65534));
        assert!(tables.shift_to_depth().iter().any(|&d| d != 0));
    }

    #[test]
    fn update_refuses_bigger_tables() {
        let mut config = reference_config();
        let mut tables = ShiftToDepthTables::init(&config).unwrap();
        config.device_max_shift = 4095;
        assert!(matches!(tables.update(&config), Err(Error::InvalidMaxShift)));
        config = reference_config();
        config.device_max_depth = 20000;
        assert!(matches!(tables.update(&config), Err(Error::InvalidMaxDepth)));
    }

    #[test]
    fn update_changes_values_only() {
        let mut config = reference_config();
        let mut tables = ShiftToDepthTables::init(&config).unwrap();
        let before = tables.clone();
        config.zero_plane_distance = 125;
        tables.update(&config).unwrap();
        assert_eq!(tables.shift_to_depth().len(), before.shift_to_depth().len());
        assert_ne!(tables, before);
    }

    #[test]
    fn convert_and_free() {
        let mut tables = ShiftToDepthTables::init(&reference_config()).unwrap();
        let shifts = [0u16, 800, 1065, 2000];
        let mut depths = [0xffffu16; 4];
        tables.convert(&shifts, &mut depths);
        assert_eq!(depths[0], 0);
        assert_eq!(depths[1], tables.depth(800));
        assert_eq!(depths[2], 9863);
        assert_eq!(depths[3], 0);

        tables.free();
        assert!(!tables.is_initialized());
        tables.free();
        assert!(!tables.is_initialized());
    }

    #[test]
    #[should_panic]
    fn convert_out_of_range_panics() {
        let tables = ShiftToDepthTables::init(&reference_config()).unwrap();
        let mut depths = [0u16; 1];
        tables.convert(&[2048], &mut depths);
    }

    #[test]
    fn shared_tables_copy_on_write() {
        let config = reference_config();
        let shared = SharedTables::new(ShiftToDepthTables::init(&config).unwrap());
        let old = shared.snapshot();

        let mut changed = config;
        changed.zero_plane_distance = 130;
        shared.modify(|t| t.update(&changed)).unwrap();
        assert_ne!(*old, *shared.snapshot());
        assert_eq!(*old, ShiftToDepthTables::init(&config).unwrap());

        changed.device_max_shift = 9000;
        assert!(shared.modify(|t| t.update(&changed)).is_err());
        assert_eq!(shared.snapshot().shift_to_depth().len(), 2048);
    }
}
