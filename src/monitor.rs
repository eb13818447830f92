use crate::commandline::OutputFormat;
use anyhow::{Context, Result};
use bmsmon_lib::protocol::{BatterySnapshot, DecodeOutcome};
use bmsmon_lib::serialport::{BmsReader, Transport};
use log::{debug, error, warn};
use serde_json::json;
use std::time::Duration;

/// Periodically read the telemetry stream and print every reading that
/// differs from the previously printed one.
///
/// Failed cycles are logged and retried on the next interval; nothing
/// here terminates the process.
pub fn run<T: Transport>(
    bms: &mut BmsReader<T>,
    interval: Duration,
    timeout: Duration,
    format: &OutputFormat,
) -> Result<()> {
    let mut last: Option<BatterySnapshot> = None;
    loop {
        match bms.read(timeout) {
            DecodeOutcome::Snapshot(snapshot) => {
                if last.as_ref() == Some(&snapshot) {
                    debug!("Reading unchanged, output skipped");
                } else {
                    print_snapshot(&snapshot, format)?;
                    last = Some(snapshot);
                }
            }
            DecodeOutcome::Timeout => {
                warn!("Failed to read BMS data: no data was received within {timeout:?}");
            }
            DecodeOutcome::ChecksumInvalid => {
                warn!("The received BMS data is corrupted, checksum mismatch");
            }
            DecodeOutcome::StreamError(err) => {
                error!("Cannot read from serial port: {err}");
            }
        }
        std::thread::sleep(interval);
    }
}

pub fn print_snapshot(snapshot: &BatterySnapshot, format: &OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => print_text(snapshot),
        OutputFormat::Json => print_json(snapshot)?,
    }
    Ok(())
}

fn print_text(battery: &BatterySnapshot) {
    println!("--- Reading at {} ---", chrono::Local::now().to_rfc3339());
    println!("Cell-Count: {}", battery.cell_count);
    println!("Pack-SOC: {}%", battery.pack_soc);
    println!("Pack-Voltage: {}V", battery.pack_voltage);
    println!("Pack-Current: {}A", battery.pack_current);
    println!("Pack-Charge-Current: {}A", battery.charge_current_limit);
    println!("Pack-Discharge-Current: {}A", battery.discharge_current_limit);
    println!("Pack-Capacity: {}kWh", battery.pack_capacity);
    println!("Pack-Energy: {}kWh", battery.remaining_energy);
    println!("Balance-Voltage: {}V", battery.balance_voltage);
    println!("Lowest-Cell-Voltage: {}V", battery.lowest_cell_voltage);
    println!(
        "Lowest-Cell-Voltage-Number: {}",
        battery.lowest_cell_voltage_cell
    );
    println!("Highest-Cell-Voltage: {}V", battery.highest_cell_voltage);
    println!(
        "Highest-Cell-Voltage-Number: {}",
        battery.highest_cell_voltage_cell
    );
    println!("Lowest-Cell-Temp: {}°C", battery.lowest_cell_temperature);
    println!(
        "Lowest-Cell-Temp-Number: {}",
        battery.lowest_cell_temperature_cell
    );
    println!("Highest-Cell-Temp: {}°C", battery.highest_cell_temperature);
    println!(
        "Highest-Cell-Temp-Number: {}",
        battery.highest_cell_temperature_cell
    );
    println!(
        "Allowed-Charge: {}",
        if battery.allowed_to_charge { "Yes" } else { "No" }
    );
    println!(
        "Allowed-Discharge: {}",
        if battery.allowed_to_discharge {
            "Yes"
        } else {
            "No"
        }
    );
    println!(
        "Alarm-Communication-Error: {}",
        active(battery.alarm_communication_error)
    );
    println!("Alarm-Min-Voltage: {}", active(battery.alarm_min_voltage));
    println!("Alarm-Max-Voltage: {}", active(battery.alarm_max_voltage));
    println!("Alarm-Min-Temp: {}", active(battery.alarm_min_temperature));
    println!("Alarm-Max-Temp: {}", active(battery.alarm_max_temperature));
}

fn active(flag: bool) -> &'static str {
    if flag {
        "Active"
    } else {
        "Inactive"
    }
}

fn print_json(snapshot: &BatterySnapshot) -> Result<()> {
    let mut value =
        serde_json::to_value(snapshot).with_context(|| "Cannot serialize battery reading")?;
    if let serde_json::Value::Object(map) = &mut value {
        map.insert(
            "timestamp".to_string(),
            json!(chrono::Utc::now().to_rfc3339()),
        );
    }
    println!("{value}");
    Ok(())
}
