//! Cross-device alignment of session fragments.

use std::collections::BTreeMap;

use tracing::warn;

use super::{Crop, MergedSession, MergedTime, SessionFragment};
use crate::error::{AppResult, DaqError};

/// Combine per-device fragments into one aligned session.
///
/// The reference start is the latest device start. Each sensor drops the packages
/// it recorded before that instant (`floor(lead_seconds * sample_rate)`), then every
/// streaming sensor is trimmed to the shortest remaining length so all crop windows
/// have the same size. Sensors that streamed nothing get an empty window and do not
/// constrain the others.
pub fn merge_fragments(mut fragments: Vec<SessionFragment>) -> AppResult<MergedSession> {
    if fragments.is_empty() {
        return Err(DaqError::Session("no session fragments to merge".into()));
    }
    fragments.sort_by(|a, b| a.device_id.cmp(&b.device_id));
    for pair in fragments.windows(2) {
        if pair[0].device_id == pair[1].device_id {
            return Err(DaqError::Session(format!(
                "device \"{}\" contributed more than one fragment",
                pair[0].device_id
            )));
        }
    }

    let name = fragments[0].name.clone();
    let duration = fragments[0].time.duration;
    if let Some(other) = fragments.iter().find(|f| f.name != name) {
        warn!(expected = %name, found = %other.name, device_id = %other.device_id, "fragment session names differ");
    }
    let reference = fragments
        .iter()
        .map(|f| f.time.start)
        .fold(f64::NEG_INFINITY, f64::max);

    let mut merged = MergedSession {
        name,
        devices: BTreeMap::new(),
        time: MergedTime {
            start: BTreeMap::new(),
            duration,
        },
        sensors: BTreeMap::new(),
        overflows: BTreeMap::new(),
        files: BTreeMap::new(),
        n_packages: BTreeMap::new(),
        crops: BTreeMap::new(),
    };

    for fragment in fragments {
        let lead_seconds = reference - fragment.time.start;
        for (sensor_id, snapshot) in &fragment.sensors {
            let total = fragment.n_packages.get(sensor_id).copied().unwrap_or(0);
            let crop = if snapshot.package_length == 0 {
                Crop::new(0, 0)
            } else {
                let lead = (lead_seconds * snapshot.sample_rate).floor() as usize;
                Crop::new(lead.min(total), total)
            };
            merged.crops.insert(sensor_id.clone(), crop);
        }
        merged
            .devices
            .insert(fragment.device_id.clone(), fragment.sensors.keys().cloned().collect());
        merged
            .time
            .start
            .insert(fragment.device_id, fragment.time.start);
        merged.sensors.extend(fragment.sensors);
        merged.overflows.extend(fragment.overflows);
        merged.files.extend(fragment.files);
        merged.n_packages.extend(fragment.n_packages);
    }

    let aligned = merged
        .sensors
        .iter()
        .filter(|(_, snapshot)| snapshot.package_length > 0)
        .filter_map(|(id, _)| merged.crops.get(id).map(Crop::len))
        .min()
        .unwrap_or(0);
    for (sensor_id, crop) in merged.crops.iter_mut() {
        let streaming = merged
            .sensors
            .get(sensor_id)
            .is_some_and(|snapshot| snapshot.package_length > 0);
        if streaming {
            crop.end = crop.start + aligned;
        }
    }

    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{DlpfMode, SensorConfig, SensorSnapshot};
    use crate::session::SessionTime;

    fn snapshot(dlpf_mode: DlpfMode, rate: u8, streaming: bool) -> SensorSnapshot {
        SensorConfig {
            dlpf_mode,
            rate,
            accel_fifo_enabled: streaming,
            ..SensorConfig::default()
        }
        .into()
    }

    fn fragment(device: &str, start: f64, sensors: &[(&str, SensorSnapshot, usize)]) -> SessionFragment {
        let mut fragment = SessionFragment {
            name: "session".into(),
            device_id: device.into(),
            time: SessionTime {
                start,
                duration: 10.0,
            },
            sensors: BTreeMap::new(),
            overflows: BTreeMap::new(),
            files: BTreeMap::new(),
            n_packages: BTreeMap::new(),
        };
        for (id, snapshot, n) in sensors {
            fragment.sensors.insert(id.to_string(), *snapshot);
            fragment.overflows.insert(id.to_string(), Vec::new());
            fragment.files.insert(id.to_string(), id.to_string());
            fragment.n_packages.insert(id.to_string(), *n);
        }
        fragment
    }

    #[test]
    fn later_device_sets_the_reference() {
        let hz100 = snapshot(DlpfMode::Bw5, 9, true);
        let merged = merge_fragments(vec![
            fragment("a", 100.0, &[("a_1", hz100, 1000)]),
            fragment("b", 100.5, &[("b_1", hz100, 950)]),
        ])
        .unwrap();

        assert_eq!(merged.reference_start(), Some(100.5));
        assert_eq!(merged.crops["a_1"], Crop::new(50, 1000));
        assert_eq!(merged.crops["b_1"], Crop::new(0, 950));
        assert_eq!(merged.aligned_length(), 950);
        assert_eq!(merged.devices["a"], vec!["a_1"]);
        assert_eq!(merged.time.start["b"], 100.5);
    }

    #[test]
    fn longer_streams_are_trimmed_to_the_shortest() {
        let hz100 = snapshot(DlpfMode::Bw5, 9, true);
        let hz1000 = snapshot(DlpfMode::Bw98, 0, true);
        let merged = merge_fragments(vec![
            fragment("a", 10.0, &[("a_1", hz100, 500), ("a_2", hz1000, 5000)]),
            fragment("b", 10.25, &[("b_1", hz100, 400)]),
        ])
        .unwrap();

        // a_1 leads by 25 packages, a_2 by 250
        assert_eq!(merged.crops["a_1"], Crop::new(25, 425));
        assert_eq!(merged.crops["a_2"], Crop::new(250, 650));
        assert_eq!(merged.crops["b_1"], Crop::new(0, 400));
        assert!(merged.crops.values().all(|crop| crop.len() == 400));
    }

    #[test]
    fn idle_sensors_get_empty_windows() {
        let hz100 = snapshot(DlpfMode::Bw5, 9, true);
        let idle = snapshot(DlpfMode::Bw5, 9, false);
        let merged = merge_fragments(vec![
            fragment("a", 0.0, &[("a_1", hz100, 300), ("a_2", idle, 0)]),
            fragment("b", 2.0, &[("b_1", hz100, 100)]),
        ])
        .unwrap();

        assert_eq!(merged.crops["a_2"], Crop::new(0, 0));
        assert_eq!(merged.crops["a_1"], Crop::new(200, 300));
        assert_eq!(merged.aligned_length(), 100);
    }

    #[test]
    fn lead_beyond_stream_clamps_to_empty() {
        let hz100 = snapshot(DlpfMode::Bw5, 9, true);
        let merged = merge_fragments(vec![
            fragment("a", 0.0, &[("a_1", hz100, 50)]),
            fragment("b", 5.0, &[("b_1", hz100, 100)]),
        ])
        .unwrap();

        assert_eq!(merged.crops["a_1"], Crop::new(50, 50));
        assert_eq!(merged.crops["b_1"], Crop::new(0, 0));
    }

    #[test]
    fn empty_and_duplicate_inputs_are_rejected() {
        assert!(matches!(merge_fragments(vec![]), Err(DaqError::Session(_))));
        let hz100 = snapshot(DlpfMode::Bw5, 9, true);
        let err = merge_fragments(vec![
            fragment("a", 0.0, &[("a_1", hz100, 10)]),
            fragment("a", 1.0, &[("a_2", hz100, 10)]),
        ])
        .unwrap_err();
        assert!(matches!(err, DaqError::Session(_)));
    }
}
