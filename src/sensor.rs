//! # Environmental Sampling
//!
//! The [`EnvironmentSensor`] trait is the boundary to the sensor driver;
//! [`SensorSampler`] pulls one [`Reading`] per tick and formats it as the
//! fixed-schema telemetry payload the broker expects.

use core::fmt::Write;
use heapless::String;

/// Capacity of the formatted telemetry payload. The schema is fixed and
/// three formatted floats fit with plenty of slack.
pub const TELEMETRY_BUF: usize = 192;

/// Boundary to the temperature/humidity/pressure sensor driver.
///
/// Implementations wrap a register-level driver (BME280 and friends) and
/// report raw units: degrees Celsius, percent relative humidity, and
/// Pascals.
pub trait EnvironmentSensor {
    /// Probes and configures the device; `false` means the sensor is
    /// absent or unresponsive.
    fn initialize(&mut self) -> bool;

    /// Switches the device to its normal periodic-sampling power mode.
    fn configure_power_mode(&mut self);

    /// Degrees Celsius.
    fn temperature(&mut self) -> f32;

    /// Percent relative humidity.
    fn humidity(&mut self) -> f32;

    /// Pascals.
    fn pressure(&mut self) -> f32;
}

/// One sample, ready for formatting. Pressure is in hectoPascals.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Reading {
    pub temperature: f32,
    pub humidity: f32,
    pub pressure: f32,
}

impl Reading {
    /// Renders the telemetry payload:
    /// `{"feeds":{"Temperature":"…","Humidity":"…","Pressure":"…"}}`,
    /// every value with exactly two decimal digits.
    ///
    /// Fails only if the values overflow the buffer, which the caller
    /// treats as a dropped sample.
    pub fn to_json(&self) -> Result<String<TELEMETRY_BUF>, core::fmt::Error> {
        let mut out = String::new();
        write!(
            out,
            "{{\"feeds\":{{\"Temperature\":\"{:.2}\",\"Humidity\":\"{:.2}\",\"Pressure\":\"{:.2}\"}}}}",
            self.temperature, self.humidity, self.pressure
        )?;
        Ok(out)
    }
}

/// Reads one sample per tick from the sensor collaborator.
pub struct SensorSampler<S> {
    sensor: S,
}

impl<S: EnvironmentSensor> SensorSampler<S> {
    pub fn new(sensor: S) -> Self {
        Self { sensor }
    }

    pub fn initialize(&mut self) -> bool {
        self.sensor.initialize()
    }

    pub fn configure_power_mode(&mut self) {
        self.sensor.configure_power_mode();
    }

    /// Takes one reading, converting pressure from Pascals to
    /// hectoPascals.
    pub fn sample(&mut self) -> Reading {
        Reading {
            temperature: self.sensor.temperature(),
            humidity: self.sensor.humidity(),
            pressure: self.sensor.pressure() / 100.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::FixedSensor;

    #[test]
    fn telemetry_matches_the_feed_schema() {
        let reading = Reading {
            temperature: 23.456,
            humidity: 55.1,
            pressure: 1013.25,
        };
        assert_eq!(
            reading.to_json().unwrap().as_str(),
            "{\"feeds\":{\"Temperature\":\"23.46\",\"Humidity\":\"55.10\",\"Pressure\":\"1013.25\"}}"
        );
    }

    #[test]
    fn values_always_carry_two_decimals() {
        let reading = Reading {
            temperature: -12.3,
            humidity: 100.0,
            pressure: 0.0,
        };
        assert_eq!(
            reading.to_json().unwrap().as_str(),
            "{\"feeds\":{\"Temperature\":\"-12.30\",\"Humidity\":\"100.00\",\"Pressure\":\"0.00\"}}"
        );
    }

    #[test]
    fn large_magnitudes_still_fit_the_buffer() {
        let reading = Reading {
            temperature: 100000.0,
            humidity: -100000.0,
            pressure: 123456.0,
        };
        let json = reading.to_json().unwrap();
        assert!(json.as_str().contains("\"100000.00\""));
        assert!(json.as_str().contains("\"-100000.00\""));
        assert!(json.as_str().contains("\"123456.00\""));
    }

    #[test]
    fn sampler_converts_pressure_to_hectopascals() {
        let mut sampler = SensorSampler::new(FixedSensor::new(23.456, 55.1, 101325.0));
        let reading = sampler.sample();
        assert_eq!(reading.pressure, 1013.25);
        assert_eq!(reading.temperature, 23.456);
        assert_eq!(reading.humidity, 55.1);
    }
}
