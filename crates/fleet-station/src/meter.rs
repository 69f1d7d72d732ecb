//! Meter value synthesis
//!
//! Each sample tick builds one `MeterValue` from the connector's electrical
//! envelope: energy always, then voltage, power, current and SoC when the
//! station's `MeterValuesSampledData` key lists them. AC three-phase expands
//! voltage/power/current into per-phase samples; DC collapses to a single
//! all-phases sample. Values fluctuate around their nominal figure and are
//! clamped to the per-connector capacity when value limitation is enabled.

use fleet_types::common::{
    CurrentOutType, Measurand, MeterValue, Phase, ReadingContext, SampledValue, UnitOfMeasure,
};
use rand::Rng;
use std::time::Duration;

/// Default fluctuation applied to synthesized values, in percent
pub const DEFAULT_FLUCTUATION_PERCENT: f64 = 5.0;

/// Electrical envelope and options for one synthesis tick
#[derive(Debug, Clone)]
pub struct MeterContext {
    pub phases: u8,
    pub current_out_type: CurrentOutType,
    pub voltage: f64,
    /// Per-connector power cap in W (station maximum over the power divider)
    pub max_power_w: f64,
    /// Per-connector amperage cap, after any amperage-limitation key
    pub max_amperage: f64,
    /// 1.0 for W/Wh templates, 1000.0 for kW/kWh templates
    pub unit_divider: f64,
    /// Measurands beyond energy to include, from MeterValuesSampledData
    pub measurands: Vec<Measurand>,
    /// Also emit line-to-line voltage samples (AC three-phase only)
    pub line_to_line_voltage: bool,
    /// Clamp fluctuated values to the connector capacity
    pub clamp_values: bool,
    /// Time since the previous tick
    pub interval: Duration,
    /// Battery state of charge carried across ticks, in percent
    pub soc_percent: f64,
}

/// Output of one synthesis tick
#[derive(Debug, Clone)]
pub struct MeterTick {
    pub meter_value: MeterValue,
    /// Energy drawn during the tick, in Wh
    pub energy_increment_wh: f64,
    /// Updated state of charge
    pub soc_percent: f64,
}

/// Apply a random fluctuation of +/- `percent` around `value`
pub fn fluctuate<R: Rng>(rng: &mut R, value: f64, percent: f64) -> f64 {
    if value == 0.0 || percent == 0.0 {
        return value;
    }
    let spread = value * percent / 100.0;
    rng.gen_range(value - spread..=value + spread)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Energy/power value scaled by the template's unit divider
fn scaled(value: f64, divider: f64) -> f64 {
    round2(value / divider)
}

fn energy_unit(divider: f64) -> UnitOfMeasure {
    if divider > 1.0 {
        UnitOfMeasure::KWh
    } else {
        UnitOfMeasure::Wh
    }
}

fn power_unit(divider: f64) -> UnitOfMeasure {
    if divider > 1.0 {
        UnitOfMeasure::KW
    } else {
        UnitOfMeasure::W
    }
}

/// Synthesize one meter value. `energy_register_wh` is the connector's
/// cumulative register before the tick; the caller persists
/// `energy_increment_wh` back onto the connector.
pub fn synthesize<R: Rng>(rng: &mut R, ctx: &MeterContext, energy_register_wh: f64) -> MeterTick {
    let mut sampled = Vec::new();

    // Power draw for this tick drives the energy increment
    let mut power_w = fluctuate(rng, ctx.max_power_w, DEFAULT_FLUCTUATION_PERCENT);
    if ctx.clamp_values {
        power_w = power_w.min(ctx.max_power_w);
    }
    let hours = ctx.interval.as_secs_f64() / 3600.0;
    let energy_increment_wh = power_w * hours;

    // Energy.Active.Import.Register is always present, cumulative
    let register = energy_register_wh + energy_increment_wh;
    sampled.push(SampledValue::measured(
        Measurand::EnergyActiveImportRegister,
        format!("{}", scaled(register, ctx.unit_divider).round()),
        energy_unit(ctx.unit_divider),
    ));

    let three_phase_ac = ctx.current_out_type == CurrentOutType::AC && ctx.phases == 3;

    for measurand in &ctx.measurands {
        match measurand {
            Measurand::EnergyActiveImportRegister => {}
            Measurand::Voltage => {
                let line_voltage = round2(fluctuate(rng, ctx.voltage, 2.0));
                sampled.push(SampledValue::measured(
                    Measurand::Voltage,
                    line_voltage.to_string(),
                    UnitOfMeasure::V,
                ));
                if three_phase_ac {
                    for phase in [Phase::L1N, Phase::L2N, Phase::L3N] {
                        let value = round2(fluctuate(rng, ctx.voltage, 2.0));
                        sampled.push(
                            SampledValue::measured(
                                Measurand::Voltage,
                                value.to_string(),
                                UnitOfMeasure::V,
                            )
                            .with_phase(phase),
                        );
                    }
                    if ctx.line_to_line_voltage {
                        let line_to_line = ctx.voltage * 3f64.sqrt();
                        for phase in [Phase::L1L2, Phase::L2L3, Phase::L3L1] {
                            let value = round2(fluctuate(rng, line_to_line, 2.0));
                            sampled.push(
                                SampledValue::measured(
                                    Measurand::Voltage,
                                    value.to_string(),
                                    UnitOfMeasure::V,
                                )
                                .with_phase(phase),
                            );
                        }
                    }
                }
            }
            Measurand::PowerActiveImport => {
                sampled.push(SampledValue::measured(
                    Measurand::PowerActiveImport,
                    scaled(power_w, ctx.unit_divider).to_string(),
                    power_unit(ctx.unit_divider),
                ));
                if three_phase_ac {
                    let per_phase = power_w / 3.0;
                    for phase in [Phase::L1, Phase::L2, Phase::L3] {
                        sampled.push(
                            SampledValue::measured(
                                Measurand::PowerActiveImport,
                                scaled(per_phase, ctx.unit_divider).to_string(),
                                power_unit(ctx.unit_divider),
                            )
                            .with_phase(phase),
                        );
                    }
                }
            }
            Measurand::CurrentImport => {
                let phases = ctx.phases.max(1) as f64;
                let mut amperage = power_w / (ctx.voltage * phases);
                if ctx.clamp_values {
                    amperage = amperage.min(ctx.max_amperage);
                }
                sampled.push(SampledValue::measured(
                    Measurand::CurrentImport,
                    round2(amperage).to_string(),
                    UnitOfMeasure::A,
                ));
                if three_phase_ac {
                    for phase in [Phase::L1, Phase::L2, Phase::L3] {
                        let value = round2(fluctuate(rng, amperage, 2.0).min(ctx.max_amperage));
                        sampled.push(
                            SampledValue::measured(
                                Measurand::CurrentImport,
                                value.to_string(),
                                UnitOfMeasure::A,
                            )
                            .with_phase(phase),
                        );
                    }
                }
            }
            Measurand::StateOfCharge => {
                sampled.push(SampledValue::measured(
                    Measurand::StateOfCharge,
                    format!("{}", ctx.soc_percent.round()),
                    UnitOfMeasure::Percent,
                ));
            }
            _ => {}
        }
    }

    // SoC creeps upward while energy flows; a 60 kWh pack is assumed
    let soc_percent = (ctx.soc_percent + energy_increment_wh / 60_000.0 * 100.0).min(100.0);

    MeterTick {
        meter_value: MeterValue {
            timestamp: chrono::Utc::now(),
            sampled_value: sampled,
        },
        energy_increment_wh,
        soc_percent,
    }
}

/// Build the single-sample meter value bracketing a transaction
pub fn transaction_boundary_meter_value(
    energy_register_wh: f64,
    unit_divider: f64,
    context: ReadingContext,
) -> MeterValue {
    MeterValue {
        timestamp: chrono::Utc::now(),
        sampled_value: vec![SampledValue::measured(
            Measurand::EnergyActiveImportRegister,
            format!("{}", scaled(energy_register_wh, unit_divider).round()),
            energy_unit(unit_divider),
        )
        .with_context(context)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::thread_rng;

    fn ac_context(phases: u8, measurands: Vec<Measurand>) -> MeterContext {
        MeterContext {
            phases,
            current_out_type: CurrentOutType::AC,
            voltage: 230.0,
            max_power_w: 11000.0,
            max_amperage: 16.0,
            unit_divider: 1.0,
            measurands,
            line_to_line_voltage: false,
            clamp_values: true,
            interval: Duration::from_secs(60),
            soc_percent: 50.0,
        }
    }

    fn count(meter_value: &MeterValue, measurand: Measurand) -> usize {
        meter_value
            .sampled_value
            .iter()
            .filter(|s| s.measurand == Some(measurand))
            .count()
    }

    #[test]
    fn test_energy_always_present_and_monotonic() {
        let mut rng = thread_rng();
        let ctx = ac_context(3, vec![]);
        let first = synthesize(&mut rng, &ctx, 0.0);
        assert_eq!(count(&first.meter_value, Measurand::EnergyActiveImportRegister), 1);
        assert!(first.energy_increment_wh > 0.0);

        let second = synthesize(&mut rng, &ctx, first.energy_increment_wh);
        let first_reading: f64 = first.meter_value.sampled_value[0].value.parse().unwrap();
        let second_reading: f64 = second.meter_value.sampled_value[0].value.parse().unwrap();
        assert!(second_reading >= first_reading);
    }

    #[test]
    fn test_ac_three_phase_voltage_expansion() {
        let mut rng = thread_rng();
        let ctx = ac_context(3, vec![Measurand::Voltage]);
        let tick = synthesize(&mut rng, &ctx, 0.0);
        // 1 line sample + 3 line-to-neutral samples
        assert_eq!(count(&tick.meter_value, Measurand::Voltage), 4);

        let with_ll = MeterContext {
            line_to_line_voltage: true,
            ..ctx
        };
        let tick = synthesize(&mut rng, &with_ll, 0.0);
        // plus 3 line-to-line samples
        assert_eq!(count(&tick.meter_value, Measurand::Voltage), 7);
    }

    #[test]
    fn test_dc_collapses_to_single_samples() {
        let mut rng = thread_rng();
        let ctx = MeterContext {
            current_out_type: CurrentOutType::DC,
            phases: 0,
            measurands: vec![Measurand::Voltage, Measurand::CurrentImport],
            ..ac_context(0, vec![])
        };
        let tick = synthesize(&mut rng, &ctx, 0.0);
        assert_eq!(count(&tick.meter_value, Measurand::Voltage), 1);
        assert_eq!(count(&tick.meter_value, Measurand::CurrentImport), 1);
        assert!(tick
            .meter_value
            .sampled_value
            .iter()
            .all(|s| s.phase.is_none()));
    }

    #[test]
    fn test_clamping_respects_capacity() {
        let mut rng = thread_rng();
        let ctx = ac_context(3, vec![Measurand::PowerActiveImport, Measurand::CurrentImport]);
        for _ in 0..50 {
            let tick = synthesize(&mut rng, &ctx, 0.0);
            for sample in &tick.meter_value.sampled_value {
                match sample.measurand {
                    Some(Measurand::PowerActiveImport) if sample.phase.is_none() => {
                        let power: f64 = sample.value.parse().unwrap();
                        assert!(power <= ctx.max_power_w + 0.01);
                    }
                    Some(Measurand::CurrentImport) => {
                        let amperage: f64 = sample.value.parse().unwrap();
                        assert!(amperage <= ctx.max_amperage + 0.01);
                    }
                    _ => {}
                }
            }
        }
    }

    #[test]
    fn test_kw_unit_divider() {
        let mut rng = thread_rng();
        let ctx = MeterContext {
            unit_divider: 1000.0,
            measurands: vec![Measurand::PowerActiveImport],
            ..ac_context(3, vec![])
        };
        let tick = synthesize(&mut rng, &ctx, 0.0);
        let energy = &tick.meter_value.sampled_value[0];
        assert_eq!(energy.unit, Some(UnitOfMeasure::KWh));
        let power = tick
            .meter_value
            .sampled_value
            .iter()
            .find(|s| s.measurand == Some(Measurand::PowerActiveImport) && s.phase.is_none())
            .unwrap();
        assert_eq!(power.unit, Some(UnitOfMeasure::KW));
        let value: f64 = power.value.parse().unwrap();
        assert!(value <= 11.0 * 1.06);
    }

    #[test]
    fn test_fluctuate_zero_cases() {
        let mut rng = thread_rng();
        assert_eq!(fluctuate(&mut rng, 0.0, 5.0), 0.0);
        assert_eq!(fluctuate(&mut rng, 42.0, 0.0), 42.0);
    }

    #[test]
    fn test_transaction_boundary_value() {
        let meter_value =
            transaction_boundary_meter_value(1500.0, 1.0, ReadingContext::TransactionBegin);
        assert_eq!(meter_value.sampled_value.len(), 1);
        assert_eq!(
            meter_value.sampled_value[0].context,
            Some(ReadingContext::TransactionBegin)
        );
        assert_eq!(meter_value.sampled_value[0].value, "1500");
    }
}
