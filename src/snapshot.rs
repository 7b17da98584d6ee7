use crate::collectors::{Reading, SensorSource, Subsystem};
use serde::{Serialize, Serializer};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

/// Readings of every known subsystem taken at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct SystemSnapshot {
    #[serde(serialize_with = "serialize_rfc3339")]
    captured_at: SystemTime,
    readings: Vec<Reading>,
}

impl SystemSnapshot {
    /// Builds a snapshot holding exactly one reading per subsystem. Subsystems
    /// absent from `readings` become `Unavailable`; duplicates keep the first.
    pub fn from_readings(captured_at: SystemTime, readings: impl IntoIterator<Item = Reading>) -> Self {
        let mut slots: [Option<Reading>; 4] = Default::default();
        for reading in readings {
            let slot = &mut slots[slot_of(reading.subsystem())];
            if slot.is_none() {
                *slot = Some(reading);
            }
        }
        let readings = Subsystem::ALL
            .iter()
            .zip(slots)
            .map(|(s, r)| r.unwrap_or_else(|| Reading::unavailable(*s)))
            .collect();
        Self {
            captured_at,
            readings,
        }
    }

    pub fn captured_at(&self) -> SystemTime {
        self.captured_at
    }

    pub fn reading(&self, subsystem: Subsystem) -> &Reading {
        &self.readings[slot_of(subsystem)]
    }

    pub fn readings(&self) -> &[Reading] {
        &self.readings
    }

    /// True when neither CPU nor GPU produced an `Ok` reading.
    pub fn lacks_core_telemetry(&self) -> bool {
        !self.reading(Subsystem::Cpu).is_ok() && !self.reading(Subsystem::Gpu).is_ok()
    }
}

fn slot_of(subsystem: Subsystem) -> usize {
    match subsystem {
        Subsystem::Cpu => 0,
        Subsystem::Gpu => 1,
        Subsystem::Ram => 2,
        Subsystem::Disk => 3,
    }
}

pub(crate) fn serialize_rfc3339<S: Serializer>(t: &SystemTime, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(&humantime::format_rfc3339_millis(*t))
}

/// Fans one read per subsystem out to its own thread so a stuck sensor
/// costs at most `read_timeout` and never blocks the others. A subsystem
/// whose previous read is still running is not read again until it returns,
/// so a hung sensor holds at most one thread.
#[derive(Clone)]
pub struct SnapshotAggregator {
    source: Arc<dyn SensorSource>,
    read_timeout: Duration,
    in_flight: Arc<[AtomicBool; 4]>,
}

/// Clears the subsystem's in-flight flag when the read thread ends, panics included.
struct InFlight(Arc<[AtomicBool; 4]>, usize);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0[self.1].store(false, Ordering::Release);
    }
}

impl SnapshotAggregator {
    pub fn new(source: Arc<dyn SensorSource>, read_timeout: Duration) -> Self {
        Self {
            source,
            read_timeout,
            in_flight: Arc::new(Default::default()),
        }
    }

    pub fn capture(&self) -> SystemSnapshot {
        let captured_at = SystemTime::now();
        let (tx, rx) = mpsc::channel();
        let mut readings = Vec::with_capacity(Subsystem::ALL.len());

        for subsystem in Subsystem::ALL {
            let slot = slot_of(subsystem);
            if self.in_flight[slot].swap(true, Ordering::AcqRel) {
                debug!(%subsystem, "предыдущее чтение датчика ещё не завершилось");
                readings.push(Reading::error(subsystem, "sensor read timed out"));
                continue;
            }

            let guard = InFlight(Arc::clone(&self.in_flight), slot);
            let tx = tx.clone();
            let source = Arc::clone(&self.source);
            let spawned = thread::Builder::new()
                .name(format!("read-{subsystem}"))
                .spawn(move || {
                    let reading = source.read(subsystem);
                    drop(guard);
                    let _ = tx.send(reading);
                });
            if let Err(err) = spawned {
                warn!(%subsystem, error = %err, "не удалось запустить поток чтения датчика");
                readings.push(Reading::error(subsystem, format!("поток чтения не запущен: {err}")));
            }
        }
        drop(tx);

        let deadline = Instant::now() + self.read_timeout;
        let mut timed_out = false;
        while readings.len() < Subsystem::ALL.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(reading) => readings.push(reading),
                Err(RecvTimeoutError::Timeout) => {
                    timed_out = true;
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        for subsystem in Subsystem::ALL {
            if readings.iter().any(|r| r.subsystem() == subsystem) {
                continue;
            }
            if timed_out {
                warn!(%subsystem, timeout_ms = self.read_timeout.as_millis() as u64, "чтение датчика превысило таймаут");
                readings.push(Reading::error(subsystem, "sensor read timed out"));
            } else {
                warn!(%subsystem, "поток чтения датчика завершился без результата");
                readings.push(Reading::error(subsystem, "sensor read failed"));
            }
        }

        let snapshot = SystemSnapshot::from_readings(captured_at, readings);
        debug!(
            cpu_ok = snapshot.reading(Subsystem::Cpu).is_ok(),
            gpu_ok = snapshot.reading(Subsystem::Gpu).is_ok(),
            ram_ok = snapshot.reading(Subsystem::Ram).is_ok(),
            disk_ok = snapshot.reading(Subsystem::Disk).is_ok(),
            "снимок собран"
        );
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::testing::FixedSensors;
    use crate::collectors::{Metric, ReadingStatus};

    fn aggregator(source: FixedSensors, timeout_ms: u64) -> SnapshotAggregator {
        SnapshotAggregator::new(Arc::new(source), Duration::from_millis(timeout_ms))
    }

    #[test]
    fn capture_is_complete_when_every_sensor_is_missing() {
        let snapshot = aggregator(FixedSensors::new(), 500).capture();
        assert_eq!(snapshot.readings().len(), 4);
        for subsystem in Subsystem::ALL {
            assert_eq!(snapshot.reading(subsystem).subsystem(), subsystem);
            assert_eq!(snapshot.reading(subsystem).status(), &ReadingStatus::Unavailable);
        }
        assert!(snapshot.lacks_core_telemetry());
    }

    #[test]
    fn capture_is_complete_for_every_subset_of_missing_sensors() {
        for mask in 0u8..16 {
            let mut source = FixedSensors::new();
            for (i, subsystem) in Subsystem::ALL.iter().enumerate() {
                if mask & (1 << i) != 0 {
                    source = source.with(*subsystem, &[(Metric::UsagePercent, 10.0)]);
                }
            }
            let snapshot = aggregator(source, 500).capture();
            assert_eq!(snapshot.readings().len(), 4, "mask {mask:04b}");
            for (i, subsystem) in Subsystem::ALL.iter().enumerate() {
                let expected_ok = mask & (1 << i) != 0;
                assert_eq!(snapshot.reading(*subsystem).is_ok(), expected_ok, "mask {mask:04b}");
            }
        }
    }

    #[test]
    fn slow_sensor_times_out_without_stalling_others() {
        let source = FixedSensors::healthy().with_delay(Subsystem::Gpu, Duration::from_secs(2));
        let started = Instant::now();
        let snapshot = aggregator(source, 300).capture();
        assert!(started.elapsed() < Duration::from_millis(1500));
        assert_eq!(
            snapshot.reading(Subsystem::Gpu).status(),
            &ReadingStatus::Error("sensor read timed out".to_string())
        );
        assert!(snapshot.reading(Subsystem::Cpu).is_ok());
        assert!(snapshot.reading(Subsystem::Disk).is_ok());
    }

    #[test]
    fn hung_sensor_holds_at_most_one_thread() {
        let source = Arc::new(
            FixedSensors::healthy().with_delay(Subsystem::Gpu, Duration::from_millis(600)),
        );
        let aggregator = SnapshotAggregator::new(source.clone(), Duration::from_millis(50));

        for _ in 0..5 {
            let snapshot = aggregator.capture();
            assert_eq!(
                snapshot.reading(Subsystem::Gpu).status(),
                &ReadingStatus::Error("sensor read timed out".to_string())
            );
            assert!(snapshot.reading(Subsystem::Cpu).is_ok());
        }
        assert_eq!(source.delayed_reads(), 1);
        assert_eq!(source.peak_delayed_in_flight(), 1);

        thread::sleep(Duration::from_millis(800));
        aggregator.capture();
        assert_eq!(source.delayed_reads(), 2);
        assert_eq!(source.peak_delayed_in_flight(), 1);
    }

    #[test]
    fn clones_share_the_in_flight_guard() {
        let source = Arc::new(
            FixedSensors::healthy().with_delay(Subsystem::Ram, Duration::from_millis(500)),
        );
        let first = SnapshotAggregator::new(source.clone(), Duration::from_millis(50));
        let second = first.clone();
        first.capture();
        second.capture();
        assert_eq!(source.delayed_reads(), 1);
    }

    #[test]
    fn duplicate_readings_keep_the_first() {
        let snapshot = SystemSnapshot::from_readings(
            SystemTime::now(),
            vec![
                Reading::error(Subsystem::Ram, "first"),
                Reading::unavailable(Subsystem::Ram),
            ],
        );
        assert_eq!(
            snapshot.reading(Subsystem::Ram).status(),
            &ReadingStatus::Error("first".to_string())
        );
        assert_eq!(snapshot.readings().len(), 4);
    }

    #[test]
    fn snapshot_serializes_timestamp_as_rfc3339() {
        let snapshot = aggregator(FixedSensors::healthy(), 500).capture();
        let json = serde_json::to_value(&snapshot).expect("json");
        let ts = json["captured_at"].as_str().expect("string timestamp");
        assert!(ts.ends_with('Z'));
        assert_eq!(json["readings"].as_array().map(Vec::len), Some(4));
    }
}
