//! Named, typed operations over the meter's property map.
//!
//! Everything energy-shaped leaves this layer already scaled to kWh: the
//! coefficient (0xD3) and unit (0xE1) registers are fetched once after the
//! join and applied to every cumulative reading. Raw register values never
//! cross the façade.

use crate::config::Config;
use crate::echonet::codec::{self, epc, HistoryCursor, InstantaneousCurrent};
use crate::echonet::frame::ElProperty;
use crate::echonet::ElClient;
use crate::error::{Error, Result};
use crate::session::Session;
use chrono::{Days, Duration as ChronoDuration, Local, NaiveDate, NaiveDateTime, NaiveTime};
use skstack::logging;
use std::sync::Mutex;
use std::time::Duration;

/// Energy flow direction of a cumulative register pair.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Direction {
    /// Forward: grid to consumer.
    Normal,
    /// Reverse: consumer to grid.
    Reverse,
}

/// One slot of a timestamped historical series, scaled to kWh.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoricalEnergy {
    pub at: NaiveDateTime,
    pub normal: Option<f64>,
    pub reverse: Option<f64>,
}

#[derive(Debug, Copy, Clone)]
struct Scaling {
    coefficient: f64,
    unit: f64,
}

/// Handle to one low-voltage smart electric energy meter over Route B.
pub struct Meter {
    el: ElClient,
    scaling: Mutex<Option<Scaling>>,
    timeout: Duration,
    log: logging::Logger,
}

impl Meter {
    /// Open the session (scan, register, PANA join) and wrap it in the
    /// property-level API.
    pub fn open<'a, L: Into<Option<&'a logging::Logger>>>(
        config: &Config,
        log: L,
    ) -> Result<Meter> {
        let root = log.into();
        let session = Session::open(config, root)?;

        Ok(Self::wrap(session, config, root))
    }

    /// Same as [`open`](Meter::open) over an already-open byte-stream pair
    /// instead of a serial device path.
    pub fn open_io<'a, R, W, L>(reader: R, writer: W, config: &Config, log: L) -> Result<Meter>
    where
        R: std::io::Read + Send + 'static,
        W: std::io::Write + Send + 'static,
        L: Into<Option<&'a logging::Logger>>,
    {
        let root = log.into();
        let session = Session::open_io(reader, writer, config, root)?;

        Ok(Self::wrap(session, config, root))
    }

    fn wrap(session: Session, config: &Config, root: Option<&logging::Logger>) -> Meter {
        Meter {
            el: ElClient::new(session, root),
            scaling: Mutex::new(None),
            timeout: config.response_timeout(),
            log: logging::layer(root, "meter"),
        }
    }

    /// Tear down the session. Idempotent; concurrent waiters are released
    /// with `NeedToReopen`.
    pub fn close(&self) {
        self.el.close();
    }

    pub fn get_operation_status(&self) -> Result<bool> {
        codec::decode_operation_status(&self.get_one(epc::OPERATION_STATUS)?)
    }

    pub fn get_installation_location(&self) -> Result<String> {
        codec::decode_installation_location(&self.get_one(epc::INSTALLATION_LOCATION)?)
    }

    pub fn get_standard_version(&self) -> Result<String> {
        codec::decode_standard_version(&self.get_one(epc::STANDARD_VERSION)?)
    }

    pub fn get_fault_status(&self) -> Result<bool> {
        codec::decode_fault_status(&self.get_one(epc::FAULT_STATUS)?)
    }

    pub fn get_manufacturer_code(&self) -> Result<[u8; 3]> {
        codec::decode_manufacturer_code(&self.get_one(epc::MANUFACTURER_CODE)?)
    }

    pub fn get_serial_number(&self) -> Result<String> {
        codec::decode_serial_number(&self.get_one(epc::SERIAL_NUMBER)?)
    }

    pub fn get_current_time(&self) -> Result<NaiveTime> {
        codec::decode_current_time(&self.get_one(epc::CURRENT_TIME)?)
    }

    pub fn get_current_date(&self) -> Result<NaiveDate> {
        codec::decode_current_date(&self.get_one(epc::CURRENT_DATE)?)
    }

    pub fn get_coefficient(&self) -> Result<u32> {
        codec::decode_coefficient(&self.get_one(epc::COEFFICIENT)?)
    }

    pub fn get_effective_digits(&self) -> Result<u8> {
        codec::decode_effective_digits(&self.get_one(epc::EFFECTIVE_DIGITS)?)
    }

    pub fn get_unit_for_cumulative_energy(&self) -> Result<f64> {
        codec::decode_unit_multiplier(&self.get_one(epc::CUMULATIVE_ENERGY_UNIT)?)
    }

    /// Cumulative energy in kWh, or `None` while the register reads the
    /// no-data sentinel.
    pub fn get_cumulative_energy(&self, direction: Direction) -> Result<Option<f64>> {
        let which = match direction {
            Direction::Normal => epc::CUMULATIVE_ENERGY,
            Direction::Reverse => epc::CUMULATIVE_ENERGY_REVERSE,
        };

        let raw = codec::decode_cumulative_energy(which, &self.get_one(which)?)?;
        let scaling = self.scaling()?;

        Ok(raw.map(|raw| to_kwh(raw, scaling)))
    }

    /// Cumulative energy latched at the most recent half-hour boundary,
    /// with the meter-side timestamp.
    pub fn get_cumulative_energy_at_fixed_time(
        &self,
        direction: Direction,
    ) -> Result<(NaiveDateTime, Option<f64>)> {
        let which = match direction {
            Direction::Normal => epc::FIXED_TIME_ENERGY,
            Direction::Reverse => epc::FIXED_TIME_ENERGY_REVERSE,
        };

        let fixed = codec::decode_fixed_time_energy(which, &self.get_one(which)?)?;
        let scaling = self.scaling()?;

        Ok((fixed.at, fixed.raw.map(|raw| to_kwh(raw, scaling))))
    }

    /// One day of half-hour cumulative readings in kWh.
    ///
    /// Timestamps are synthesised on the client clock: 30-minute increments
    /// starting at 00:30 on "today minus the meter-reported day offset". A
    /// call that straddles midnight therefore attributes the series to a
    /// day off by one; this mirrors the meter-side day indexing and is not
    /// compensated.
    pub fn get_historical_cumulative_energy_1(
        &self,
        day: u8,
        direction: Direction,
    ) -> Result<Vec<(NaiveDateTime, Option<f64>)>> {
        if day > 99 {
            return Err(Error::InvalidArgument("day must be within 0..=99"));
        }

        self.el.set_c(
            vec![ElProperty::with_edt(epc::HISTORY_1_DAY, codec::encode_history_1_day(day))],
            self.timeout,
        )?;

        let which = match direction {
            Direction::Normal => epc::CUMULATIVE_HISTORY_1,
            Direction::Reverse => epc::CUMULATIVE_HISTORY_1_REVERSE,
        };

        let history = codec::decode_history_1(which, &self.get_one(which)?)?;
        let scaling = self.scaling()?;

        logging::debug!(self.log, "historical series 1";
                        "day" => history.day,
                        "slots" => history.values.len());

        let stamps = history_1_timestamps(Local::now().date_naive(), history.day);

        Ok(stamps
            .into_iter()
            .zip(history.values)
            .map(|(at, raw)| (at, raw.map(|raw| to_kwh(raw, scaling))))
            .collect())
    }

    pub fn set_day_for_historical_data_1(&self, day: u8) -> Result<()> {
        if day > 99 {
            return Err(Error::InvalidArgument("day must be within 0..=99"));
        }

        self.el.set_c(
            vec![ElProperty::with_edt(epc::HISTORY_1_DAY, codec::encode_history_1_day(day))],
            self.timeout,
        )?;

        Ok(())
    }

    pub fn get_day_for_historical_data_1(&self) -> Result<u8> {
        codec::decode_history_1_day(&self.get_one(epc::HISTORY_1_DAY)?)
    }

    /// Half-hour normal/reverse pairs ending at `at`, newest first.
    /// `num_of_data_points` must lie within `1..=12`.
    pub fn get_historical_cumulative_energy_2(
        &self,
        at: NaiveDateTime,
        num_of_data_points: u8,
    ) -> Result<Vec<HistoricalEnergy>> {
        if !(1..=12).contains(&num_of_data_points) {
            return Err(Error::InvalidArgument(
                "num_of_data_points must be within 1..=12",
            ));
        }

        self.get_history_series(
            epc::HISTORY_2_TIME,
            epc::CUMULATIVE_HISTORY_2,
            at,
            num_of_data_points,
            ChronoDuration::minutes(30),
        )
    }

    pub fn set_time_for_historical_data_2(
        &self,
        at: NaiveDateTime,
        num_of_data_points: u8,
    ) -> Result<()> {
        if !(1..=12).contains(&num_of_data_points) {
            return Err(Error::InvalidArgument(
                "num_of_data_points must be within 1..=12",
            ));
        }

        self.set_history_cursor(epc::HISTORY_2_TIME, at, num_of_data_points)
    }

    pub fn get_time_for_historical_data_2(&self) -> Result<(NaiveDateTime, u8)> {
        let cursor =
            codec::decode_history_cursor(epc::HISTORY_2_TIME, &self.get_one(epc::HISTORY_2_TIME)?)?;

        Ok((cursor.at, cursor.count))
    }

    /// One-minute normal/reverse pairs ending at `at`, newest first.
    /// `num_of_data_points` must lie within `1..=10`.
    pub fn get_historical_cumulative_energy_3(
        &self,
        at: NaiveDateTime,
        num_of_data_points: u8,
    ) -> Result<Vec<HistoricalEnergy>> {
        if !(1..=10).contains(&num_of_data_points) {
            return Err(Error::InvalidArgument(
                "num_of_data_points must be within 1..=10",
            ));
        }

        self.get_history_series(
            epc::HISTORY_3_TIME,
            epc::CUMULATIVE_HISTORY_3,
            at,
            num_of_data_points,
            ChronoDuration::minutes(1),
        )
    }

    pub fn set_time_for_historical_data_3(
        &self,
        at: NaiveDateTime,
        num_of_data_points: u8,
    ) -> Result<()> {
        if !(1..=10).contains(&num_of_data_points) {
            return Err(Error::InvalidArgument(
                "num_of_data_points must be within 1..=10",
            ));
        }

        self.set_history_cursor(epc::HISTORY_3_TIME, at, num_of_data_points)
    }

    pub fn get_time_for_historical_data_3(&self) -> Result<(NaiveDateTime, u8)> {
        let cursor =
            codec::decode_history_cursor(epc::HISTORY_3_TIME, &self.get_one(epc::HISTORY_3_TIME)?)?;

        Ok((cursor.at, cursor.count))
    }

    /// Instantaneous power in watts.
    pub fn get_instantaneous_power(&self) -> Result<f64> {
        let raw = codec::decode_instantaneous_power(&self.get_one(epc::INSTANTANEOUS_POWER)?)?;

        Ok(f64::from(raw))
    }

    /// Instantaneous R/T phase currents in amperes.
    pub fn get_instantaneous_current(&self) -> Result<InstantaneousCurrent> {
        codec::decode_instantaneous_current(&self.get_one(epc::INSTANTANEOUS_CURRENT)?)
    }

    fn set_history_cursor(&self, which: u8, at: NaiveDateTime, count: u8) -> Result<()> {
        let cursor = HistoryCursor { at, count };

        self.el.set_c(
            vec![ElProperty::with_edt(which, codec::encode_history_cursor(&cursor))],
            self.timeout,
        )?;

        Ok(())
    }

    fn get_history_series(
        &self,
        cursor_epc: u8,
        series_epc: u8,
        at: NaiveDateTime,
        count: u8,
        step: ChronoDuration,
    ) -> Result<Vec<HistoricalEnergy>> {
        self.set_history_cursor(cursor_epc, at, count)?;

        let series = codec::decode_history_series(series_epc, &self.get_one(series_epc)?)?;
        let scaling = self.scaling()?;

        logging::debug!(self.log, "historical series";
                        "epc" => format!("{:02X}", series_epc),
                        "anchor" => %series.at,
                        "slots" => series.slots.len());

        let stamps = series_timestamps(series.at, series.slots.len(), step);

        Ok(stamps
            .into_iter()
            .zip(series.slots)
            .map(|(at, (normal, reverse))| HistoricalEnergy {
                at,
                normal: normal.map(|raw| to_kwh(raw, scaling)),
                reverse: reverse.map(|raw| to_kwh(raw, scaling)),
            })
            .collect())
    }

    /// Fetch a single property and unwrap its data bytes.
    fn get_one(&self, which: u8) -> Result<Vec<u8>> {
        let props = self.el.get(&[which], self.timeout)?;

        props
            .into_iter()
            .find(|prop| prop.epc == which)
            .map(|prop| prop.edt)
            .ok_or(Error::MalformedResponse { epc: which })
    }

    /// Coefficient and unit, fetched once per session. Meters are allowed
    /// to omit the coefficient register entirely; that reads as 1.
    fn scaling(&self) -> Result<Scaling> {
        if let Some(scaling) = *self.scaling.lock().unwrap() {
            return Ok(scaling);
        }

        let fetched = self
            .el
            .get(&[epc::COEFFICIENT, epc::CUMULATIVE_ENERGY_UNIT], self.timeout);

        let scaling = match fetched {
            Ok(props) => {
                let mut coefficient = 1.0;
                let mut unit = None;

                for prop in props {
                    match prop.epc {
                        epc::COEFFICIENT => {
                            coefficient = f64::from(codec::decode_coefficient(&prop.edt)?)
                        }
                        epc::CUMULATIVE_ENERGY_UNIT => {
                            unit = Some(codec::decode_unit_multiplier(&prop.edt)?)
                        }
                        _ => (),
                    }
                }

                Scaling {
                    coefficient,
                    unit: unit.ok_or(Error::MalformedResponse {
                        epc: epc::CUMULATIVE_ENERGY_UNIT,
                    })?,
                }
            }
            Err(Error::ResponsePossibleFailure { ref epcs })
                if epcs.contains(&epc::COEFFICIENT)
                    && !epcs.contains(&epc::CUMULATIVE_ENERGY_UNIT) =>
            {
                // No coefficient register on this meter.
                Scaling {
                    coefficient: 1.0,
                    unit: self.get_unit_for_cumulative_energy()?,
                }
            }
            Err(err) => return Err(err),
        };

        logging::debug!(self.log, "scaling cached";
                        "coefficient" => scaling.coefficient,
                        "unit" => scaling.unit);

        *self.scaling.lock().unwrap() = Some(scaling);

        Ok(scaling)
    }
}

#[inline]
fn to_kwh(raw: u32, scaling: Scaling) -> f64 {
    f64::from(raw) * scaling.coefficient * scaling.unit
}

/// Half-hour timestamps for a one-day series measured `day` days before
/// `today`: 48 slots from 00:30 up to the following midnight.
fn history_1_timestamps(today: NaiveDate, day: u16) -> Vec<NaiveDateTime> {
    let base = today
        .checked_sub_days(Days::new(u64::from(day)))
        .unwrap_or(today)
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always valid");

    (1..=codec::HISTORY_1_SLOTS as i64)
        .map(|slot| base + ChronoDuration::minutes(30 * slot))
        .collect()
}

/// Timestamps for a cursor-anchored series running backwards from `anchor`,
/// newest first.
fn series_timestamps(anchor: NaiveDateTime, count: usize, step: ChronoDuration) -> Vec<NaiveDateTime> {
    (0..count as i64).map(|slot| anchor - step * (slot as i32)).collect()
}
