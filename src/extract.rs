//! Event detection over one session's lap sequences.
//!
//! Every detector walks each driver's laps in ascending lap order and emits
//! an [`EventRecord`] whose vector uses the single-session normalization
//! rules from [`crate::schema`].

use std::collections::{HashMap, VecDeque};

use tracing::{debug, info, warn};

use crate::error::SignalError;
use crate::schema::{
    by_ceiling, compound_scaled, rainfall_flag, signed_by_ceiling, TrackEncoder, POSITION_CEILING,
    TRACK_TEMP_CEILING, TYRE_LIFE_CEILING,
};
use crate::source::TelemetrySource;
use crate::types::{EventMetadata, EventRecord, LapRecord, Session, SignalKind, WeatherSample};

/// Laps in the rolling reference window of the cliff detector.
pub const CLIFF_WINDOW: usize = 3;

#[derive(Debug, Clone)]
pub struct ExtractionParams {
    /// Minimum loss (s) over the rolling mean that counts as a tire cliff.
    pub drop_threshold_s: f64,
    /// Only this team's drivers are scanned for undercuts.
    pub undercut_team: String,
    /// Scale applied to the gap to the rival before a pit stop.
    pub gap_normalizer_s: f64,
}

impl Default for ExtractionParams {
    fn default() -> Self {
        Self {
            drop_threshold_s: 2.0,
            undercut_team: "Williams".to_string(),
            gap_normalizer_s: 20.0,
        }
    }
}

/// Session-wide values shared by every event of one session.
struct SessionFrame<'a> {
    session: &'a Session,
    track_norm: f32,
    max_lap: u32,
}

impl<'a> SessionFrame<'a> {
    fn new(session: &'a Session, encoder: &TrackEncoder) -> Self {
        Self {
            session,
            track_norm: encoder.encode(&session.event_name),
            max_lap: session.max_lap(),
        }
    }

    fn lap_fraction(&self, lap: &LapRecord) -> f32 {
        by_ceiling(Some(lap.lap_number as f64), self.max_lap as f64)
    }

    fn conditions(&self, lap: &LapRecord) -> (f32, f32) {
        match nearest_weather(&self.session.weather, lap.time_s) {
            Some(w) => (by_ceiling(w.track_temp, TRACK_TEMP_CEILING), rainfall_flag(w.rainfall)),
            None => (0.0, 0.0),
        }
    }

    fn metadata(&self, lap: &LapRecord) -> EventMetadata {
        EventMetadata {
            driver: lap.driver.clone(),
            team: lap.team.clone(),
            track_name: self.session.event_name.clone(),
            year: self.session.year as i64,
            lap_number: lap.lap_number as i64,
            ..EventMetadata::default()
        }
    }
}

fn position_fraction(lap: &LapRecord) -> f32 {
    by_ceiling(lap.position.map(f64::from), POSITION_CEILING)
}

fn tyre_fraction(lap: &LapRecord) -> f32 {
    by_ceiling(lap.tyre_life, TYRE_LIFE_CEILING)
}

/// Weather sample closest in time to `time_s`; ties keep the earliest sample
/// in sequence order.
pub fn nearest_weather(weather: &[WeatherSample], time_s: f64) -> Option<&WeatherSample> {
    let mut best: Option<(&WeatherSample, f64)> = None;
    for w in weather {
        let d = (w.time_s - time_s).abs();
        if !d.is_finite() {
            continue;
        }
        match best {
            Some((_, bd)) if bd <= d => {}
            _ => best = Some((w, d)),
        }
    }
    best.map(|(w, _)| w)
}

/// Groups laps per driver in first-seen driver order, each group sorted by lap number.
fn laps_by_driver<'a>(laps: impl IntoIterator<Item = &'a LapRecord>) -> Vec<Vec<&'a LapRecord>> {
    let mut slot: HashMap<&str, usize> = HashMap::new();
    let mut groups: Vec<Vec<&LapRecord>> = Vec::new();
    for lap in laps {
        let idx = *slot.entry(lap.driver.as_str()).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[idx].push(lap);
    }
    for g in &mut groups {
        g.sort_by_key(|l| l.lap_number);
    }
    groups
}

fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

/// Tire cliff: a lap at least `drop_threshold_s` slower than the mean of the
/// three laps immediately before it. Laps whose window has a missing time are skipped.
pub fn detect_cliffs(session: &Session, encoder: &TrackEncoder, params: &ExtractionParams) -> Vec<EventRecord> {
    let frame = SessionFrame::new(session, encoder);
    let mut records = Vec::new();

    for laps in laps_by_driver(&session.laps) {
        let mut window: VecDeque<Option<f64>> = VecDeque::with_capacity(CLIFF_WINDOW);

        for lap in laps {
            if window.len() == CLIFF_WINDOW {
                let prev: Option<Vec<f64>> = window.iter().copied().collect();
                if let (Some(prev), Some(current)) = (prev, lap.lap_time_s) {
                    let mean = prev.iter().sum::<f64>() / CLIFF_WINDOW as f64;
                    let drop_s = current - mean;
                    if drop_s >= params.drop_threshold_s {
                        let (track_temp, rain) = frame.conditions(lap);
                        let mut metadata = frame.metadata(lap);
                        metadata.lap_time_loss = Some(round3(drop_s));
                        records.push(EventRecord {
                            kind: SignalKind::Cliff,
                            vector: vec![
                                frame.track_norm,
                                compound_scaled(lap.compound()),
                                tyre_fraction(lap),
                                track_temp,
                                rain,
                                frame.lap_fraction(lap),
                                position_fraction(lap),
                            ],
                            metadata,
                        });
                    }
                }
                window.pop_front();
            }
            window.push_back(lap.lap_time_s);
        }
    }
    records
}

/// Undercut: a stint change for one of the tracked team's drivers, paired
/// with the closest rival still ahead on the same lap.
pub fn detect_undercuts(session: &Session, encoder: &TrackEncoder, params: &ExtractionParams) -> Vec<EventRecord> {
    let frame = SessionFrame::new(session, encoder);
    let mut records = Vec::new();
    let team_laps = session.laps.iter().filter(|l| l.team == params.undercut_team);

    for laps in laps_by_driver(team_laps) {
        for pair in laps.windows(2) {
            let (prev, curr) = (pair[0], pair[1]);
            let pitted = matches!((prev.stint, curr.stint), (Some(a), Some(b)) if a != b);
            if !pitted {
                continue;
            }
            let Some(rival) = closest_rival_ahead(session, curr) else {
                debug!(driver = %curr.driver, lap = curr.lap_number, "pit without a rival ahead");
                continue;
            };

            let (track_temp, rain) = frame.conditions(curr);
            let mut metadata = frame.metadata(curr);
            metadata.rival_pitted_lap = Some(rival.lap_number as i64);
            records.push(EventRecord {
                kind: SignalKind::Undercut,
                vector: vec![
                    frame.track_norm,
                    frame.lap_fraction(curr),
                    position_fraction(curr),
                    compound_scaled(curr.compound()),
                    compound_scaled(rival.compound()),
                    tyre_fraction(rival),
                    signed_by_ceiling(Some(rival.time_s - curr.time_s), params.gap_normalizer_s),
                    track_temp,
                    rain,
                ],
                metadata,
            });
        }
    }
    records
}

/// Among all cars on the same lap with a better position than `lap`, the
/// one with the worst position, i.e. the car directly ahead.
pub fn closest_rival_ahead<'a>(session: &'a Session, lap: &LapRecord) -> Option<&'a LapRecord> {
    let own = lap.position?;
    session
        .laps
        .iter()
        .filter(|r| r.lap_number == lap.lap_number)
        .filter_map(|r| r.position.filter(|p| *p < own).map(|p| (p, r)))
        .max_by_key(|(p, _)| *p)
        .map(|(_, r)| r)
}

/// Overtake: position strictly improves from one lap to the next. The
/// earlier lap is recorded as the pre-overtake snapshot.
pub fn detect_overtakes(session: &Session, encoder: &TrackEncoder, _params: &ExtractionParams) -> Vec<EventRecord> {
    let frame = SessionFrame::new(session, encoder);
    let mut records = Vec::new();

    for laps in laps_by_driver(&session.laps) {
        for pair in laps.windows(2) {
            let (current, next) = (pair[0], pair[1]);
            let (Some(before), Some(after)) = (current.position, next.position) else {
                continue;
            };
            if after >= before {
                continue;
            }
            let (track_temp, rain) = frame.conditions(current);
            records.push(EventRecord {
                kind: SignalKind::Overtake,
                vector: vec![
                    frame.track_norm,
                    position_fraction(current),
                    compound_scaled(current.compound()),
                    tyre_fraction(current),
                    track_temp,
                    rain,
                ],
                metadata: frame.metadata(current),
            });
        }
    }
    records
}

pub fn extract_session(
    kind: SignalKind,
    session: &Session,
    encoder: &TrackEncoder,
    params: &ExtractionParams,
) -> Vec<EventRecord> {
    match kind {
        SignalKind::Cliff => detect_cliffs(session, encoder, params),
        SignalKind::Undercut => detect_undercuts(session, encoder, params),
        SignalKind::Overtake => detect_overtakes(session, encoder, params),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Extracted { year: i32, track: String, events: usize },
    Skipped { year: i32, track: String, reason: String },
}

#[derive(Debug, Default)]
pub struct ExtractionReport {
    pub records: Vec<EventRecord>,
    pub outcomes: Vec<SessionOutcome>,
}

impl ExtractionReport {
    pub fn skipped(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, SessionOutcome::Skipped { .. }))
            .count()
    }

    /// Records grouped by year, in the order years were first seen.
    pub fn by_year(&self) -> Vec<(i64, Vec<&EventRecord>)> {
        let mut out: Vec<(i64, Vec<&EventRecord>)> = Vec::new();
        for r in &self.records {
            match out.iter_mut().find(|(y, _)| *y == r.metadata.year) {
                Some((_, v)) => v.push(r),
                None => out.push((r.metadata.year, vec![r])),
            }
        }
        out
    }
}

/// Runs one detector over every (year, track) session. Sessions that fail to
/// load are logged and skipped; the rest of the batch still runs.
pub fn extract_batch(
    source: &dyn TelemetrySource,
    kind: SignalKind,
    years: &[i32],
    tracks: &[String],
    encoder: &TrackEncoder,
    params: &ExtractionParams,
) -> ExtractionReport {
    let mut report = ExtractionReport::default();

    for &year in years {
        for track in tracks {
            info!("processing {kind} data for {track} ({year})");
            match source.load_session(year, track) {
                Ok(session) => {
                    let events = extract_session(kind, &session, encoder, params);
                    info!("{} {kind} events in {track} ({year})", events.len());
                    report.outcomes.push(SessionOutcome::Extracted {
                        year,
                        track: track.clone(),
                        events: events.len(),
                    });
                    report.records.extend(events);
                }
                Err(e) => {
                    warn!("skipping {track} {year}: {e}");
                    let reason = match e {
                        SignalError::SourceUnavailable { reason, .. } => reason,
                        other => other.to_string(),
                    };
                    report.outcomes.push(SessionOutcome::Skipped {
                        year,
                        track: track.clone(),
                        reason,
                    });
                }
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn lap(driver: &str, team: &str, n: u32, pos: Option<u32>, time: Option<f64>) -> LapRecord {
        LapRecord {
            driver: driver.to_string(),
            team: team.to_string(),
            lap_number: n,
            position: pos,
            compound: Some("MEDIUM".to_string()),
            tyre_life: Some(n as f64),
            stint: Some(1),
            lap_time_s: time,
            sector_times_s: [None; 3],
            time_s: n as f64 * 90.0,
        }
    }

    fn session(laps: Vec<LapRecord>) -> Session {
        Session {
            year: 2023,
            event_name: "Miami Grand Prix".to_string(),
            laps,
            weather: vec![
                WeatherSample {
                    time_s: 0.0,
                    air_temp: Some(28.0),
                    track_temp: Some(48.0),
                    humidity: None,
                    wind_speed: None,
                    rainfall: false,
                },
                WeatherSample {
                    time_s: 300.0,
                    air_temp: Some(28.0),
                    track_temp: Some(40.0),
                    humidity: None,
                    wind_speed: None,
                    rainfall: true,
                },
            ],
        }
    }

    fn fixed_encoder() -> TrackEncoder {
        TrackEncoder::Fixed {
            map: BTreeMap::from([("Miami Grand Prix".to_string(), 0.9)]),
            unknown: 0.5,
        }
    }

    #[test]
    fn cliff_fires_on_drop_over_rolling_mean() {
        let laps = [90.0, 90.0, 90.0, 95.0]
            .iter()
            .enumerate()
            .map(|(i, t)| lap("SAR", "Williams", i as u32 + 1, Some(15), Some(*t)))
            .collect();
        let s = session(laps);

        let events = detect_cliffs(&s, &fixed_encoder(), &ExtractionParams::default());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].metadata.lap_number, 4);
        assert_eq!(events[0].metadata.lap_time_loss, Some(5.0));
        assert_eq!(events[0].vector.len(), 7);
        assert_eq!(events[0].vector[0], 0.9);

        let strict = ExtractionParams { drop_threshold_s: 6.0, ..ExtractionParams::default() };
        assert!(detect_cliffs(&s, &fixed_encoder(), &strict).is_empty());
    }

    #[test]
    fn cliff_skips_window_with_missing_time() {
        let times = [Some(90.0), None, Some(90.0), Some(99.0), Some(90.0)];
        let laps = times
            .iter()
            .enumerate()
            .map(|(i, t)| lap("SAR", "Williams", i as u32 + 1, Some(15), *t))
            .collect();
        let events = detect_cliffs(&session(laps), &fixed_encoder(), &ExtractionParams::default());
        // the missing lap 2 time poisons the windows of both lap 4 and lap 5
        assert!(events.is_empty());
    }

    #[test]
    fn cliff_handles_unsorted_input() {
        let mut laps: Vec<LapRecord> = [90.0, 90.0, 90.0, 93.0]
            .iter()
            .enumerate()
            .map(|(i, t)| lap("SAR", "Williams", i as u32 + 1, Some(15), Some(*t)))
            .collect();
        laps.reverse();
        let events = detect_cliffs(&session(laps), &fixed_encoder(), &ExtractionParams::default());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].metadata.lap_time_loss, Some(3.0));
    }

    #[test]
    fn overtake_fires_only_on_position_gain() {
        let laps = vec![
            lap("HAM", "Mercedes", 1, Some(5), Some(90.0)),
            lap("HAM", "Mercedes", 2, Some(5), Some(90.0)),
            lap("HAM", "Mercedes", 3, Some(3), Some(90.0)),
            lap("HAM", "Mercedes", 4, None, Some(90.0)),
            lap("HAM", "Mercedes", 5, Some(1), Some(90.0)),
        ];
        let events = detect_overtakes(&session(laps), &fixed_encoder(), &ExtractionParams::default());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].metadata.lap_number, 2);
        assert_eq!(events[0].vector.len(), 6);
        assert_eq!(events[0].vector[1], 0.25);
    }

    #[test]
    fn undercut_picks_closest_rival_ahead() {
        let mut pitting = lap("ALB", "Williams", 10, Some(8), Some(110.0));
        pitting.stint = Some(2);
        pitting.compound = Some("HARD".to_string());
        let mut laps = vec![lap("ALB", "Williams", 9, Some(8), Some(91.0)), pitting];
        for (driver, pos) in [("VER", 2), ("NOR", 4), ("GAS", 7), ("STR", 11)] {
            let mut r = lap(driver, "Other", 10, Some(pos), Some(90.0));
            r.time_s = 10.0 * 90.0 - 5.0;
            laps.push(r);
        }

        let s = session(laps);
        let rival = closest_rival_ahead(&s, &s.laps[1]).unwrap();
        assert_eq!(rival.driver, "GAS");

        let events = detect_undercuts(&s, &fixed_encoder(), &ExtractionParams::default());
        assert_eq!(events.len(), 1);
        let e = &events[0];
        assert_eq!(e.vector.len(), 9);
        assert_eq!(e.metadata.rival_pitted_lap, Some(10));
        assert!((e.vector[3] - 0.3).abs() < 1e-6);
        assert_eq!(e.vector[6], -0.25);
    }

    #[test]
    fn undercut_ignores_other_teams_and_leaders() {
        let mut leader = lap("VER", "Red Bull", 2, Some(1), Some(95.0));
        leader.stint = Some(2);
        let laps = vec![lap("VER", "Red Bull", 1, Some(1), Some(90.0)), leader];
        assert!(detect_undercuts(&session(laps.clone()), &fixed_encoder(), &ExtractionParams::default()).is_empty());

        let params = ExtractionParams { undercut_team: "Red Bull".to_string(), ..ExtractionParams::default() };
        assert!(detect_undercuts(&session(laps), &fixed_encoder(), &params).is_empty());
    }

    #[test]
    fn nearest_weather_prefers_first_on_tie() {
        let s = session(vec![]);
        assert_eq!(nearest_weather(&s.weather, 150.0).unwrap().track_temp, Some(48.0));
        assert_eq!(nearest_weather(&s.weather, 200.0).unwrap().track_temp, Some(40.0));
        assert!(nearest_weather(&[], 10.0).is_none());
    }

    struct FlakySource;

    impl TelemetrySource for FlakySource {
        fn load_session(&self, year: i32, track: &str) -> crate::error::Result<Session> {
            if year == 2022 {
                return Err(SignalError::SourceUnavailable {
                    year,
                    track: track.to_string(),
                    reason: "timing feed offline".to_string(),
                });
            }
            let laps = (1..=5)
                .map(|n| lap("HAM", "Mercedes", n, Some(10 - n), Some(90.0)))
                .collect();
            Ok(Session { year, event_name: track.to_string(), ..session(laps) })
        }
    }

    #[test]
    fn batch_skips_unavailable_sessions() {
        let report = extract_batch(
            &FlakySource,
            SignalKind::Overtake,
            &[2022, 2023],
            &["Miami Grand Prix".to_string()],
            &fixed_encoder(),
            &ExtractionParams::default(),
        );
        assert_eq!(report.skipped(), 1);
        assert_eq!(report.records.len(), 4);
        assert_eq!(report.by_year().len(), 1);
        assert!(matches!(&report.outcomes[0], SessionOutcome::Skipped { reason, .. } if reason == "timing feed offline"));
    }
}
