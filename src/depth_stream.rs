// Copyright (C) 2023, Alex Badics
// This file is part of ps1080-protocol
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! Keeps the shift-to-depth tables of a depth stream in sync with its calibration properties.
//!
//! [`register_depth_properties`] adds the calibration and cut-off properties to a store, and
//! [`DepthStreamHelper::init`] builds the tables from them and watches them. Changes that keep
//! the table sizes recompute the values; changes of the max shift, the device max depth or the
//! output format rebuild the tables. Either way, the `S2D` and `D2S` table properties raise a
//! change event afterwards.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use tracing::debug;

use crate::{
    depth::{depth_processor, DepthCodec, DepthProcessorConfig},
    processor::FrameStreamProcessor,
    property::{property_id, Property, PropertyStore, PropertyValue},
    shift_to_depth::{
        SharedTables, ShiftToDepthConfig, ShiftToDepthTables, MAX_DEPTH_100_UM, MAX_DEPTH_1_MM,
    },
    Error, PixelFormat, Result,
};

const MODULE: &str = "Depth";

/// Properties whose change only needs new table values
const VALUE_PROPERTIES: [u32; 9] = [
    property_id::MIN_DEPTH,
    property_id::MAX_DEPTH,
    property_id::CONST_SHIFT,
    property_id::PIXEL_SIZE_FACTOR,
    property_id::PARAM_COEFF,
    property_id::SHIFT_SCALE,
    property_id::ZERO_PLANE_DISTANCE,
    property_id::ZERO_PLANE_PIXEL_SIZE,
    property_id::EMITTER_DCMOS_DISTANCE,
];

/// Properties whose change needs new tables
const SIZE_PROPERTIES: [u32; 3] = [
    property_id::MAX_SHIFT,
    property_id::DEVICE_MAX_DEPTH,
    property_id::OUTPUT_FORMAT,
];

/// Largest supported max shift. Shift indices must fit 16 bits.
pub const MAX_SHIFT_LIMIT: u64 = 1 << 16;

fn int_value(value: &PropertyValue) -> Option<u64> {
    match value {
        PropertyValue::Int(v) => Some(*v),
        _ => None,
    }
}

fn cut_off_validator(store: &PropertyStore, value: &PropertyValue) -> Result<()> {
    match int_value(value) {
        Some(depth) if depth > store.get_int(property_id::DEVICE_MAX_DEPTH)? => Err(
            Error::PropertyRejected("depth cut-off exceeds device max depth"),
        ),
        _ => Ok(()),
    }
}

/// Accept integers in `min..=max`
fn range_validator(
    min: u64,
    max: u64,
    reason: &'static str,
) -> impl Fn(&PropertyStore, &PropertyValue) -> Result<()> + Send + Sync + 'static {
    move |_store: &PropertyStore, value: &PropertyValue| -> Result<()> {
        match int_value(value) {
            Some(v) if !(min..=max).contains(&v) => Err(Error::PropertyRejected(reason)),
            _ => Ok(()),
        }
    }
}

fn output_format_validator(_store: &PropertyStore, value: &PropertyValue) -> Result<()> {
    match int_value(value).map(PixelFormat::from_code) {
        Some(Some(format)) => device_max_depth(format).map(|_| ()),
        Some(None) => Err(Error::PropertyRejected("not a depth output format")),
        None => Ok(()),
    }
}

/// Device max depth of an output format
fn device_max_depth(format: PixelFormat) -> Result<u32> {
    match format {
        PixelFormat::Depth1Mm | PixelFormat::Shift9_2 => Ok(MAX_DEPTH_1_MM),
        PixelFormat::Depth100Um => Ok(MAX_DEPTH_100_UM),
        _ => Err(Error::PropertyRejected("not a depth output format")),
    }
}

/// Set the device max depth of `format`, and bring the cut-offs into its range. A max cut-off
/// at the old device max depth is no cut-off at all, so it moves with the device max depth.
/// Stores quietly and returns the changed properties.
fn apply_device_limits(store: &mut PropertyStore, format: PixelFormat) -> Result<Vec<u32>> {
    let old_limit = store.get_int(property_id::DEVICE_MAX_DEPTH)?;
    let limit = device_max_depth(format)? as u64;
    let mut changed = Vec::new();
    if store.update_value(property_id::DEVICE_MAX_DEPTH, PropertyValue::Int(limit))? {
        changed.push(property_id::DEVICE_MAX_DEPTH);
    }
    for id in [property_id::MIN_DEPTH, property_id::MAX_DEPTH] {
        let cut_off = store.get_int(id)?;
        let cut_off = if id == property_id::MAX_DEPTH && cut_off == old_limit {
            limit
        } else {
            cut_off.min(limit)
        };
        if store.update_value(id, PropertyValue::Int(cut_off))? {
            changed.push(id);
        }
    }
    Ok(changed)
}

fn set_output_format(store: &mut PropertyStore, value: PropertyValue) -> Result<()> {
    let format = int_value(&value)
        .and_then(PixelFormat::from_code)
        .ok_or(Error::PropertyRejected("not a depth output format"))?;
    let mut changed = apply_device_limits(store, format)?;
    if store.update_value(property_id::OUTPUT_FORMAT, value)? {
        changed.push(property_id::OUTPUT_FORMAT);
    }
    for id in changed {
        store.notify(id)?;
    }
    Ok(())
}

/// Add the calibration, cut-off and output format properties of a depth stream, initialized
/// from `config` and `output_format`.
///
/// The device max depth follows the output format: 10000 for millimeters and shifts, 65534 for
/// 100 micrometer units.
pub fn register_depth_properties(
    store: &mut PropertyStore,
    config: &ShiftToDepthConfig,
    output_format: PixelFormat,
) -> Result<()> {
    if config.device_max_shift as u64 > MAX_SHIFT_LIMIT {
        return Err(Error::InvalidMaxShift);
    }
    let int = |id, name: &str, value: u64| Property::int(id, name, value).in_module(MODULE);
    let real = |id, name: &str, value: f64| Property::real(id, name, value).in_module(MODULE);

    store.add(
        int(property_id::OUTPUT_FORMAT, "OutputFormat", output_format.code())
            .with_validator(output_format_validator)
            .with_setter(set_output_format),
    )?;
    store.add(
        int(
            property_id::DEVICE_MAX_DEPTH,
            "DeviceMaxDepth",
            config.device_max_depth as u64,
        )
        .with_validator(range_validator(
            1,
            MAX_DEPTH_100_UM as u64,
            "device max depth out of range",
        )),
    )?;
    store.add(
        int(property_id::MIN_DEPTH, "MinDepthValue", config.min_cut_off as u64)
            .with_validator(cut_off_validator),
    )?;
    store.add(
        int(property_id::MAX_DEPTH, "MaxDepthValue", config.max_cut_off as u64)
            .with_validator(cut_off_validator),
    )?;
    store.add(
        int(property_id::CONST_SHIFT, "ConstShift", config.const_shift as u64).with_validator(
            range_validator(0, u32::MAX as u64, "const shift does not fit 32 bits"),
        ),
    )?;
    store.add(
        int(
            property_id::PIXEL_SIZE_FACTOR,
            "PixelSizeFactor",
            config.pixel_size_factor as u64,
        )
        .with_validator(range_validator(
            1,
            u32::MAX as u64,
            "pixel size factor must be a non-zero 32 bit value",
        )),
    )?;
    store.add(
        int(property_id::MAX_SHIFT, "MaxShift", config.device_max_shift as u64).with_validator(
            range_validator(0, MAX_SHIFT_LIMIT, "max shift does not fit 16 bits"),
        ),
    )?;
    store.add(
        int(property_id::PARAM_COEFF, "ParamCoeff", config.param_coeff as u64).with_validator(
            range_validator(1, u32::MAX as u64, "param coeff must be a non-zero 32 bit value"),
        ),
    )?;
    // Room for the 100 micrometer scaling
    store.add(
        int(property_id::SHIFT_SCALE, "ShiftScale", config.shift_scale as u64).with_validator(
            range_validator(0, (u32::MAX / 10) as u64, "shift scale is too big"),
        ),
    )?;
    store.add(
        int(
            property_id::ZERO_PLANE_DISTANCE,
            "ZPD",
            config.zero_plane_distance as u64,
        )
        .with_validator(range_validator(
            0,
            u16::MAX as u64,
            "zero plane distance does not fit 16 bits",
        )),
    )?;
    store.add(real(
        property_id::ZERO_PLANE_PIXEL_SIZE,
        "ZPPS",
        config.zero_plane_pixel_size,
    ))?;
    store.add(real(
        property_id::EMITTER_DCMOS_DISTANCE,
        "LDDIS",
        config.emitter_distance,
    ))?;
    apply_device_limits(store, output_format)?;
    Ok(())
}

/// Current output format of the depth stream
pub fn output_format(store: &PropertyStore) -> Result<PixelFormat> {
    let code = store.get_int(property_id::OUTPUT_FORMAT)?;
    PixelFormat::from_code(code).ok_or(Error::Other("Unknown output format code"))
}

fn int_property<T: TryFrom<u64>>(
    store: &PropertyStore,
    id: u32,
    reason: &'static str,
) -> Result<T> {
    T::try_from(store.get_int(id)?).map_err(|_| Error::PropertyRejected(reason))
}

/// Build the table configuration from the current property values
pub fn shift_to_depth_config(store: &PropertyStore) -> Result<ShiftToDepthConfig> {
    let shift_scale: u32 = int_property(store, property_id::SHIFT_SCALE, "shift scale is too big")?;
    let shift_scale = match output_format(store)? {
        PixelFormat::Depth1Mm | PixelFormat::Shift9_2 => shift_scale,
        // One millimeter is ten output units
        PixelFormat::Depth100Um => shift_scale
            .checked_mul(10)
            .ok_or(Error::PropertyRejected("shift scale is too big"))?,
        other => return Err(Error::UnsupportedFormat(other)),
    };
    Ok(ShiftToDepthConfig {
        zero_plane_distance: int_property(
            store,
            property_id::ZERO_PLANE_DISTANCE,
            "zero plane distance does not fit 16 bits",
        )?,
        zero_plane_pixel_size: store.get_real(property_id::ZERO_PLANE_PIXEL_SIZE)?,
        emitter_distance: store.get_real(property_id::EMITTER_DCMOS_DISTANCE)?,
        device_max_shift: int_property(store, property_id::MAX_SHIFT, "max shift is too big")?,
        device_max_depth: int_property(
            store,
            property_id::DEVICE_MAX_DEPTH,
            "device max depth is too big",
        )?,
        const_shift: int_property(store, property_id::CONST_SHIFT, "const shift is too big")?,
        pixel_size_factor: int_property(
            store,
            property_id::PIXEL_SIZE_FACTOR,
            "pixel size factor is too big",
        )?,
        param_coeff: int_property(store, property_id::PARAM_COEFF, "param coeff is too big")?,
        shift_scale,
        min_cut_off: int_property(store, property_id::MIN_DEPTH, "min depth is too big")?,
        max_cut_off: int_property(store, property_id::MAX_DEPTH, "max depth is too big")?,
    })
}

fn table_bytes(table: &[u16]) -> Vec<u8> {
    let mut bytes = vec![0; table.len() * 2];
    LittleEndian::write_u16_into(table, &mut bytes);
    bytes
}

fn raise_change_events(store: &PropertyStore) -> Result<()> {
    store.notify(property_id::S2D_TABLE)?;
    store.notify(property_id::D2S_TABLE)
}

/// Owner of the shift-to-depth tables of one depth stream
pub struct DepthStreamHelper {
    tables: Arc<SharedTables>,
}

impl DepthStreamHelper {
    /// Build the tables from the properties of `store` (see [`register_depth_properties`]),
    /// publish them as the `S2D` and `D2S` properties, and follow the property changes.
    pub fn init(store: &mut PropertyStore) -> Result<Self> {
        let config = shift_to_depth_config(store)?;
        let tables = Arc::new(SharedTables::new(ShiftToDepthTables::init(&config)?));

        let s2d_tables = tables.clone();
        store.add(
            Property::computed(property_id::S2D_TABLE, "S2D", move || {
                PropertyValue::General(table_bytes(s2d_tables.snapshot().shift_to_depth()))
            })
            .in_module(MODULE),
        )?;
        let d2s_tables = tables.clone();
        store.add(
            Property::computed(property_id::D2S_TABLE, "D2S", move || {
                PropertyValue::General(table_bytes(d2s_tables.snapshot().depth_to_shift()))
            })
            .in_module(MODULE),
        )?;

        for id in VALUE_PROPERTIES {
            let tables = tables.clone();
            store.subscribe(id, move |store: &PropertyStore, id: u32| -> Result<()> {
                let config = shift_to_depth_config(store)?;
                tables.modify(|t| t.update(&config))?;
                debug!(property = format_args!("0x{id:08x}"), "depth tables updated");
                raise_change_events(store)
            })?;
        }
        for id in SIZE_PROPERTIES {
            let tables = tables.clone();
            store.subscribe(id, move |store: &PropertyStore, id: u32| -> Result<()> {
                let config = shift_to_depth_config(store)?;
                tables.replace(ShiftToDepthTables::init(&config)?);
                debug!(property = format_args!("0x{id:08x}"), "depth tables rebuilt");
                raise_change_events(store)
            })?;
        }

        Ok(Self { tables })
    }

    /// The tables, for the decode path
    pub fn tables(&self) -> Arc<SharedTables> {
        self.tables.clone()
    }

    /// Depth processor producing the current output format of `store`, reading these tables
    pub fn depth_processor(
        &self,
        store: &PropertyStore,
        config: DepthProcessorConfig,
    ) -> Result<FrameStreamProcessor<DepthCodec>> {
        let config = DepthProcessorConfig {
            output_format: output_format(store)?,
            ..config
        };
        depth_processor(config, self.tables())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    fn setup(output_format: PixelFormat) -> (PropertyStore, DepthStreamHelper) {
        let mut store = PropertyStore::new();
        register_depth_properties(&mut store, &ShiftToDepthConfig::default(), output_format)
            .unwrap();
        let helper = DepthStreamHelper::init(&mut store).unwrap();
        (store, helper)
    }

    fn s2d(store: &PropertyStore) -> Vec<u8> {
        let mut out = vec![0; 8192];
        let size = store
            .get_general_into(property_id::S2D_TABLE, &mut out)
            .unwrap();
        out.truncate(size);
        out
    }

    #[test]
    fn tables_follow_the_defaults() {
        let (store, helper) = setup(PixelFormat::Depth1Mm);
        let expected = ShiftToDepthTables::init(&ShiftToDepthConfig::default()).unwrap();
        assert_eq!(*helper.tables().snapshot(), expected);
        assert_eq!(s2d(&store), table_bytes(expected.shift_to_depth()));
        assert_eq!(
            shift_to_depth_config(&store).unwrap(),
            ShiftToDepthConfig::default()
        );

        let mut small = [0u8; 16];
        assert!(matches!(
            store.get_general_into(property_id::D2S_TABLE, &mut small),
            Err(Error::OutputBufferOverflow { .. })
        ));
    }

    #[test]
    fn value_change_updates_tables_and_raises_events() {
        let (mut store, helper) = setup(PixelFormat::Depth1Mm);
        let events = Arc::new(AtomicUsize::new(0));
        let counter = events.clone();
        store
            .subscribe(
                property_id::S2D_TABLE,
                move |_: &PropertyStore, _: u32| -> Result<()> {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
            )
            .unwrap();

        let before = helper.tables().snapshot();
        store.set_int(property_id::ZERO_PLANE_DISTANCE, 125).unwrap();
        let expected = ShiftToDepthTables::init(&ShiftToDepthConfig {
            zero_plane_distance: 125,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(*helper.tables().snapshot(), expected);
        assert_ne!(*before, expected);
        assert_eq!(s2d(&store), table_bytes(expected.shift_to_depth()));
        assert_eq!(events.load(Ordering::SeqCst), 1);

        // Same value, no change
        store.set_int(property_id::ZERO_PLANE_DISTANCE, 125).unwrap();
        assert_eq!(events.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn size_change_rebuilds_tables() {
        let (mut store, helper) = setup(PixelFormat::Depth1Mm);
        store.set_int(property_id::MAX_SHIFT, 4095).unwrap();
        assert_eq!(helper.tables().snapshot().shift_to_depth().len(), 4096);
        store.set_int(property_id::DEVICE_MAX_DEPTH, 12000).unwrap();
        assert_eq!(helper.tables().snapshot().depth_to_shift().len(), 12001);
    }

    #[test]
    fn sub_millimeter_output_extends_the_range() {
        let (mut store, helper) = setup(PixelFormat::Depth1Mm);
        store
            .set_int(property_id::OUTPUT_FORMAT, PixelFormat::Depth100Um.code())
            .unwrap();
        assert_eq!(
            store.get_int(property_id::DEVICE_MAX_DEPTH).unwrap(),
            MAX_DEPTH_100_UM as u64
        );
        assert_eq!(
            store.get_int(property_id::MAX_DEPTH).unwrap(),
            MAX_DEPTH_100_UM as u64
        );
        let expected = ShiftToDepthTables::init(&ShiftToDepthConfig {
            shift_scale: 100,
            device_max_depth: MAX_DEPTH_100_UM,
            max_cut_off: MAX_DEPTH_100_UM as u16,
            ..Default::default()
        })
        .unwrap();
        let tables = helper.tables().snapshot();
        assert_eq!(*tables, expected);
        assert_eq!(tables.depth_to_shift().len(), 65535);
        // Farther than a meter
        assert!(tables.shift_to_depth().iter().any(|&d| d > 10000));

        let processor = helper
            .depth_processor(&store, DepthProcessorConfig::default())
            .unwrap();
        assert_eq!(processor.codec().no_depth_value(), 0);

        store
            .set_int(property_id::OUTPUT_FORMAT, PixelFormat::Depth1Mm.code())
            .unwrap();
        assert_eq!(
            store.get_int(property_id::DEVICE_MAX_DEPTH).unwrap(),
            MAX_DEPTH_1_MM as u64
        );
        assert_eq!(
            *helper.tables().snapshot(),
            ShiftToDepthTables::init(&ShiftToDepthConfig::default()).unwrap()
        );
    }

    #[test]
    fn sub_millimeter_registration_uses_the_full_range() {
        let (store, helper) = setup(PixelFormat::Depth100Um);
        assert_eq!(
            shift_to_depth_config(&store).unwrap().device_max_depth,
            MAX_DEPTH_100_UM
        );
        assert_eq!(helper.tables().snapshot().depth_to_shift().len(), 65535);
    }

    #[test]
    fn narrowed_cut_off_is_clamped_on_format_change() {
        let (mut store, _helper) = setup(PixelFormat::Depth100Um);
        store.set_int(property_id::MAX_DEPTH, 30000).unwrap();
        store.set_int(property_id::MIN_DEPTH, 20000).unwrap();
        store
            .set_int(property_id::OUTPUT_FORMAT, PixelFormat::Shift9_2.code())
            .unwrap();
        assert_eq!(store.get_int(property_id::MAX_DEPTH).unwrap(), 10000);
        assert_eq!(store.get_int(property_id::MIN_DEPTH).unwrap(), 10000);
    }

    #[test]
    fn out_of_range_calibration_is_rejected() {
        let (mut store, helper) = setup(PixelFormat::Depth1Mm);
        let before = helper.tables().snapshot();
        for (id, value) in [
            (property_id::MAX_SHIFT, 1 << 32),
            (property_id::MAX_SHIFT, MAX_SHIFT_LIMIT + 1),
            (property_id::DEVICE_MAX_DEPTH, 1 << 40),
            (property_id::DEVICE_MAX_DEPTH, MAX_DEPTH_100_UM as u64 + 1),
            (property_id::ZERO_PLANE_DISTANCE, 1 << 16),
            (property_id::SHIFT_SCALE, u32::MAX as u64),
            (property_id::CONST_SHIFT, 1 << 32),
            (property_id::PARAM_COEFF, 0),
            (property_id::PIXEL_SIZE_FACTOR, 0),
        ] {
            let old = store.get_int(id).unwrap();
            assert!(
                matches!(store.set_int(id, value), Err(Error::PropertyRejected(_))),
                "0x{id:08x} = {value} accepted"
            );
            assert_eq!(store.get_int(id).unwrap(), old);
        }
        assert!(Arc::ptr_eq(&before, &helper.tables().snapshot()));

        store.set_int(property_id::MAX_SHIFT, MAX_SHIFT_LIMIT).unwrap();
        assert_eq!(
            helper.tables().snapshot().shift_to_depth().len(),
            MAX_SHIFT_LIMIT as usize + 1
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        let (mut store, helper) = setup(PixelFormat::Depth1Mm);
        let before = helper.tables().snapshot();
        assert!(matches!(
            store.set_int(property_id::MIN_DEPTH, 20000),
            Err(Error::PropertyRejected(_))
        ));
        assert!(matches!(
            store.set_int(property_id::MAX_DEPTH, 10001),
            Err(Error::PropertyRejected(_))
        ));
        assert!(matches!(
            store.set_int(property_id::OUTPUT_FORMAT, PixelFormat::Rgb888.code()),
            Err(Error::PropertyRejected(_))
        ));
        assert_eq!(store.get_int(property_id::MIN_DEPTH).unwrap(), 0);
        assert!(Arc::ptr_eq(&before, &helper.tables().snapshot()));

        store.set_int(property_id::MIN_DEPTH, 500).unwrap();
        assert!(helper
            .tables()
            .snapshot()
            .shift_to_depth()
            .iter()
            .all(|&d| d == 0 || d >= 500));
    }

    #[test]
    fn shift_output_keeps_the_scale() {
        let (store, _helper) = setup(PixelFormat::Shift9_2);
        assert_eq!(shift_to_depth_config(&store).unwrap().shift_scale, 10);
    }
}
