//! Historical batch loader: per-year event CSVs in, one normalized batch out
//! to the similarity index.

use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

use crate::error::{Result, SignalError};
use crate::extract::ExtractionReport;
use crate::index::{IndexRecord, SignalIndex};
use crate::schema::{AggregationPlan, VectorSchema};
use crate::types::{EventMetadata, EventRecord, SignalKind};

/// Raw lap column for signals whose vector already has a `LapNumber` component.
pub const RAW_LAP_COLUMN: &str = "RawLapNumber";

pub fn csv_file_name(kind: SignalKind, year: i64) -> String {
    match kind {
        SignalKind::Cliff => format!("tire_cliff_laps_{year}.csv"),
        SignalKind::Undercut => format!("undercut_laps_{year}.csv"),
        SignalKind::Overtake => format!("overtake_laps_{year}.csv"),
    }
}

pub fn combined_file_name(kind: SignalKind) -> String {
    format!("{kind}_all_years_combined.csv")
}

/// Metadata columns carried next to the vector, in file order.
pub fn metadata_columns(kind: SignalKind) -> &'static [&'static str] {
    match kind {
        SignalKind::Cliff => &["Driver", "Year", "LapTimeLoss", "TrackName", "Team", RAW_LAP_COLUMN],
        SignalKind::Undercut => &["Driver", "Year", "TrackName", "Team", "Rival_Pitted_Lap", RAW_LAP_COLUMN],
        SignalKind::Overtake => &["TrackName", "Year", "Driver", "Team", "LapNumber"],
    }
}

fn header(kind: SignalKind) -> Vec<&'static str> {
    metadata_columns(kind)
        .iter()
        .copied()
        .chain(VectorSchema::for_kind(kind).names())
        .collect()
}

fn metadata_cell(meta: &EventMetadata, column: &str) -> String {
    let opt = |v: Option<String>| v.unwrap_or_default();
    match column {
        "Driver" => meta.driver.clone(),
        "Team" => meta.team.clone(),
        "TrackName" => meta.track_name.clone(),
        "Year" => meta.year.to_string(),
        "LapNumber" | RAW_LAP_COLUMN => meta.lap_number.to_string(),
        "LapTimeLoss" => opt(meta.lap_time_loss.map(|x| x.to_string())),
        "Rival_Pitted_Lap" => opt(meta.rival_pitted_lap.map(|x| x.to_string())),
        _ => String::new(),
    }
}

pub fn write_event_csv(path: &Path, kind: SignalKind, records: &[EventRecord]) -> Result<()> {
    let mut w = csv::Writer::from_path(path)?;
    let cols = metadata_columns(kind);
    w.write_record(header(kind))?;
    for r in records {
        let row = cols
            .iter()
            .map(|c| metadata_cell(&r.metadata, c))
            .chain(r.vector.iter().map(|x| x.to_string()));
        w.write_record(row)?;
    }
    w.flush()?;
    Ok(())
}

fn parse_f64(cell: Option<&str>) -> Option<f64> {
    cell.map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|x| x.is_finite())
}

fn parse_i64(cell: Option<&str>) -> Option<i64> {
    parse_f64(cell).map(|x| x.round() as i64)
}

/// Reads one event CSV. Only the vector columns are required; a missing
/// metadata column, or a missing or unparseable number in a row, becomes 0
/// (or empty).
pub fn read_event_csv(path: &Path, kind: SignalKind) -> Result<Vec<EventRecord>> {
    let mut rdr = csv::Reader::from_path(path)?;
    let columns: HashMap<String, usize> = rdr
        .headers()?
        .iter()
        .enumerate()
        .map(|(i, h)| (h.trim().to_string(), i))
        .collect();

    let schema = VectorSchema::for_kind(kind);
    if let Some(missing) = schema.names().find(|c| !columns.contains_key(*c)) {
        return Err(SignalError::MalformedRecord(format!(
            "{} has no `{missing}` column",
            path.display()
        )));
    }
    let col = |name: &str| columns.get(name).copied().unwrap_or(usize::MAX);
    let text = |row: &csv::StringRecord, name: &str| row.get(col(name)).unwrap_or("").to_string();

    // files written by older extractions carry no raw lap column
    let raw_lap_col = if schema.position("LapNumber").is_some() {
        RAW_LAP_COLUMN
    } else {
        "LapNumber"
    };
    for name in metadata_columns(kind).iter().filter(|c| !columns.contains_key(**c)) {
        debug!("{} has no `{name}` column; defaulting it", path.display());
    }

    let mut out = Vec::new();
    for row in rdr.records() {
        let row = row?;
        let vector = schema
            .names()
            .map(|name| parse_f64(row.get(col(name))).unwrap_or(0.0) as f32)
            .collect();
        let metadata = EventMetadata {
            driver: text(&row, "Driver"),
            team: text(&row, "Team"),
            track_name: text(&row, "TrackName"),
            year: parse_i64(row.get(col("Year"))).unwrap_or(0),
            lap_number: parse_i64(row.get(col(raw_lap_col))).unwrap_or(0),
            lap_time_loss: match kind {
                SignalKind::Cliff => parse_f64(row.get(col("LapTimeLoss"))),
                _ => None,
            },
            rival_pitted_lap: match kind {
                SignalKind::Undercut => parse_i64(row.get(col("Rival_Pitted_Lap"))),
                _ => None,
            },
        };
        out.push(EventRecord { kind, vector, metadata });
    }
    Ok(out)
}

/// Writes one CSV per year of an extraction run into `out_dir`.
pub fn write_extraction(report: &ExtractionReport, kind: SignalKind, out_dir: &Path) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(out_dir)?;
    let mut written = Vec::new();
    for (year, records) in report.by_year() {
        let path = out_dir.join(csv_file_name(kind, year));
        let owned: Vec<EventRecord> = records.into_iter().cloned().collect();
        write_event_csv(&path, kind, &owned)?;
        info!("saved {} {kind} events to {}", owned.len(), path.display());
        written.push(path);
    }
    Ok(written)
}

/// Applies the kind's global normalization over the combined batch.
pub fn aggregate(kind: SignalKind, mut records: Vec<EventRecord>) -> Vec<EventRecord> {
    let tracks: Vec<String> = records.iter().map(|r| r.metadata.track_name.clone()).collect();
    let track_refs: Vec<&str> = tracks.iter().map(String::as_str).collect();
    let mut vectors: Vec<Vec<f32>> = records.iter_mut().map(|r| std::mem::take(&mut r.vector)).collect();

    AggregationPlan::for_kind(kind).apply(kind, &mut vectors, &track_refs);

    for (r, v) in records.iter_mut().zip(vectors) {
        r.vector = v;
    }
    records
}

/// Ids are `{year}_{row}` where `row` is the position in the combined batch.
pub fn to_index_records(records: &[EventRecord]) -> Vec<IndexRecord> {
    records
        .iter()
        .enumerate()
        .map(|(i, r)| IndexRecord {
            id: format!("{}_{i}", r.metadata.year),
            values: r.vector.clone(),
            metadata: r.metadata.clone(),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadReport {
    pub files_read: usize,
    pub records: usize,
    pub batches: usize,
    pub combined_path: PathBuf,
}

/// Reads every available year file from `dir`, normalizes the combined batch,
/// saves it next to the inputs and upserts it in batches.
pub async fn load_history(index: &SignalIndex, dir: &Path, years: &[i32]) -> Result<LoadReport> {
    let kind = index.kind();
    let mut combined = Vec::new();
    let mut files_read = 0;

    for &year in years {
        let path = dir.join(csv_file_name(kind, year as i64));
        if !path.exists() {
            warn!("file not found: {}, skipping", path.display());
            continue;
        }
        let mut records = read_event_csv(&path, kind)?;
        for r in &mut records {
            r.metadata.year = year as i64;
        }
        info!("read {} {kind} events from {}", records.len(), path.display());
        combined.extend(records);
        files_read += 1;
    }

    if files_read == 0 {
        return Err(SignalError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no {kind} CSVs for {years:?} in {}", dir.display()),
        )));
    }

    let combined = aggregate(kind, combined);
    let combined_path = dir.join(combined_file_name(kind));
    write_event_csv(&combined_path, kind, &combined)?;
    info!("saved normalized batch: {}", combined_path.display());

    let records = to_index_records(&combined);
    info!("uploading {} {kind} vectors", records.len());
    let batches = index.upsert_batched(&records).await?;

    match index.count().await {
        Ok(n) => info!("{kind} index reports {n} vectors"),
        Err(e) => warn!("could not read {kind} index stats: {e}"),
    }

    Ok(LoadReport {
        files_read,
        records: records.len(),
        batches,
        combined_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::MemoryIndex;
    use std::sync::Arc;

    fn cliff(track: &str, year: i64, lap: i64, vector: Vec<f32>) -> EventRecord {
        EventRecord {
            kind: SignalKind::Cliff,
            vector,
            metadata: EventMetadata {
                driver: "ALB".to_string(),
                team: "Williams".to_string(),
                track_name: track.to_string(),
                year,
                lap_number: lap,
                lap_time_loss: Some(2.5),
                rival_pitted_lap: None,
            },
        }
    }

    #[test]
    fn file_names() {
        assert_eq!(csv_file_name(SignalKind::Cliff, 2023), "tire_cliff_laps_2023.csv");
        assert_eq!(csv_file_name(SignalKind::Undercut, 2020), "undercut_laps_2020.csv");
        assert_eq!(combined_file_name(SignalKind::Overtake), "overtake_all_years_combined.csv");
    }

    #[test]
    fn csv_keeps_metadata_and_vector() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cliff.csv");
        let records = vec![cliff("Miami Grand Prix", 2023, 14, vec![0.9, 0.2, 0.25, 0.5, 0.0, 0.25, 0.4])];
        write_event_csv(&path, SignalKind::Cliff, &records).unwrap();

        let back = read_event_csv(&path, SignalKind::Cliff).unwrap();
        assert_eq!(back, records);
    }

    #[test]
    fn missing_column_rejects_file_and_blank_numbers_become_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overtake.csv");
        std::fs::write(&path, "TrackName,Year,Driver,Team,LapNumber,TrackNormalized,Position\nX,2024,HAM,Mercedes,3,1,0.5\n")
            .unwrap();
        let err = read_event_csv(&path, SignalKind::Overtake).unwrap_err();
        assert!(matches!(err, SignalError::MalformedRecord(_)));

        std::fs::write(
            &path,
            "TrackName,Year,Driver,Team,LapNumber,TrackNormalized,Position,Compound,TyreLife,TrackTemp,Rainfall\n\
             X,2024,HAM,Mercedes,3,1,,0.1,0.2,nan,0\n",
        )
        .unwrap();
        let rows = read_event_csv(&path, SignalKind::Overtake).unwrap();
        assert_eq!(rows[0].vector, vec![1.0, 0.0, 0.1, 0.2, 0.0, 0.0]);
        assert_eq!(rows[0].metadata.lap_number, 3);
    }

    #[test]
    fn aggregate_reencodes_tracks_and_scales_columns() {
        let records = vec![
            cliff("Las Vegas Grand Prix", 2023, 10, vec![1.0, 0.1, 0.1, 0.5, 0.0, 0.2, 0.1]),
            cliff("Miami Grand Prix", 2023, 20, vec![0.9, 0.3, 0.3, 0.5, 0.0, 0.6, 0.5]),
        ];
        let out = aggregate(SignalKind::Cliff, records);
        // first-seen track order
        assert_eq!(out[0].vector[0], 0.0);
        assert_eq!(out[1].vector[0], 1.0);
        // compound re-encoded as rank / 5: SOFT, HARD
        assert!((out[0].vector[1] - 0.2).abs() < 1e-6);
        assert!((out[1].vector[1] - 0.6).abs() < 1e-6);
        // min-max TyreLife, constant TrackTemp collapses to 0
        assert_eq!((out[0].vector[2], out[1].vector[2]), (0.0, 1.0));
        assert_eq!((out[0].vector[3], out[1].vector[3]), (0.0, 0.0));
    }

    #[test]
    fn ids_follow_batch_position() {
        let records = vec![
            cliff("A", 2022, 1, vec![0.0; 7]),
            cliff("A", 2023, 2, vec![0.0; 7]),
        ];
        let ids: Vec<String> = to_index_records(&records).into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["2022_0", "2023_1"]);
    }

    #[tokio::test]
    async fn load_history_skips_missing_years_and_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let recs: Vec<EventRecord> = (0..5)
            .map(|i| cliff("Miami Grand Prix", 2023, i, vec![0.9, 0.2, i as f32 / 10.0, 0.5, 0.0, 0.3, 0.4]))
            .collect();
        write_event_csv(&dir.path().join(csv_file_name(SignalKind::Cliff, 2023)), SignalKind::Cliff, &recs).unwrap();

        let memory = Arc::new(MemoryIndex::new());
        let index = SignalIndex::new(SignalKind::Cliff, memory.clone()).with_batch_size(2);
        let report = load_history(&index, dir.path(), &[2022, 2023]).await.unwrap();

        assert_eq!(report.files_read, 1);
        assert_eq!(report.records, 5);
        assert_eq!(report.batches, 3);
        assert!(report.combined_path.exists());
        assert_eq!(index.count().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn load_history_without_inputs_fails() {
        let dir = tempfile::tempdir().unwrap();
        let index = SignalIndex::new(SignalKind::Undercut, Arc::new(MemoryIndex::new()));
        assert!(load_history(&index, dir.path(), &[2020]).await.is_err());
    }

    #[tokio::test]
    async fn loads_files_with_only_vector_and_base_metadata_columns() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(csv_file_name(SignalKind::Cliff, 2023)),
            "TrackName,TrackNormalized,Year,Driver,Team,LapNumber,Position,Compound,TyreLife,TrackTemp,Rainfall,LapTimeLoss\n\
             Miami Grand Prix,0.9,2023,ALB,Williams,0.4,0.5,0.2,0.3,0.6,0,3.25\n\
             Las Vegas Grand Prix,1.0,2023,SAR,Williams,0.8,0.9,0.3,0.5,0.4,0,2.1\n",
        )
        .unwrap();

        let rows = read_event_csv(&dir.path().join(csv_file_name(SignalKind::Cliff, 2023)), SignalKind::Cliff).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].metadata.lap_number, 0);
        assert_eq!(rows[0].metadata.lap_time_loss, Some(3.25));
        assert_eq!(rows[0].vector[5], 0.4);

        let index = SignalIndex::new(SignalKind::Cliff, Arc::new(MemoryIndex::new()));
        let report = load_history(&index, dir.path(), &[2023]).await.unwrap();
        assert_eq!(report.records, 2);
        assert_eq!(index.count().await.unwrap(), 2);
    }
}
