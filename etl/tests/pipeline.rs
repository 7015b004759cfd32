use arrow::datatypes::DataType;
use arrow::util::display::array_value_to_string;
use common::Error;
use common::config::Settings;
use datafusion::prelude::*;
use etl::processor::{EventTransform, Transform};
use etl::run_etl_pipeline;
use etl::session::create_session;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const PLAY_TS: i64 = 1541548796000;

fn song(song_id: &str, title: &str, artist_id: &str, artist_name: &str, year: i64) -> String {
    song_at(song_id, title, artist_id, artist_name, year, "")
}

fn song_at(
    song_id: &str,
    title: &str,
    artist_id: &str,
    artist_name: &str,
    year: i64,
    location: &str,
) -> String {
    format!(
        r#"{{"num_songs": 1, "artist_id": "{artist_id}", "artist_latitude": null, "artist_longitude": null, "artist_location": "{location}", "artist_name": "{artist_name}", "song_id": "{song_id}", "title": "{title}", "duration": 201.5, "year": {year}}}"#
    )
}

fn event(user: &str, first: &str, level: &str, ts: i64, page: &str, song: &str, artist: &str) -> String {
    format!(
        r#"{{"artist": "{artist}", "auth": "Logged In", "firstName": "{first}", "gender": "F", "itemInSession": 0, "lastName": "Doe", "length": 201.5, "level": "{level}", "location": "Paris", "method": "PUT", "page": "{page}", "registration": 1540919166796.0, "sessionId": 42, "song": "{song}", "status": 200, "ts": {ts}, "userAgent": "agent", "userId": "{user}"}}"#
    )
}

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let fixture = Self {
            dir: tempfile::tempdir().unwrap(),
        };
        fixture.write_songs(
            "A/A/A/TRAAA.json",
            &[song("SO1", "Paris", "AR1", "Line Renaud", 1961)],
        );
        fixture.write_songs(
            "A/A/B/TRAAB.json",
            &[
                song("SO1", "Paris", "AR1", "Line Renaud", 1961),
                song("SO2", "Der Kleine Dompfaff", "AR2", "Other Artist", 0),
            ],
        );
        fixture
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn write_songs(&self, relative: &str, lines: &[String]) {
        write_lines(&self.root().join("song_data").join(relative), lines);
    }

    fn write_events(&self, lines: &[String]) {
        write_lines(
            &self.root().join("log_data/2018/11/2018-11-06-events.json"),
            lines,
        );
    }

    fn output(&self, table: &str) -> PathBuf {
        self.root().join("out").join(table)
    }

    fn config(&self, extra: &str) -> String {
        let path = self.root().join("dl.cfg");
        let contents = format!(
            "[SOURCE]\nSONGPATH = {}\nLOGPATH = {}\n\n[OUTPUT]\nOUTPUT_PATH = {}\nSONGTABLE = songs\nARTISTTABLE = artists\nUSERTABLE = users\nTIMETABLE = time\nSONGPLAY = songplays\n{}",
            self.root().join("song_data").display(),
            self.root().join("log_data").display(),
            self.root().join("out").display(),
            extra
        );
        fs::write(&path, contents).unwrap();
        path.to_str().unwrap().to_string()
    }
}

fn write_lines(path: &Path, lines: &[String]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, lines.join("\n")).unwrap();
}

fn default_events() -> Vec<String> {
    vec![
        event("10", "Ann", "free", PLAY_TS, "NextSong", "Paris", "Line Renaud"),
        event("10", "Ann", "paid", PLAY_TS + 4000, "NextSong", "Unknown Song", "Nobody"),
        event("20", "Bob", "free", PLAY_TS, "NextSong", "Der Kleine Dompfaff", "Wrong Artist"),
        event("20", "Bobby", "paid", PLAY_TS, "NextSong", "Paris", "Line Renaud"),
        event("30", "Cy", "free", PLAY_TS + 9000, "Home", "", ""),
    ]
}

async fn count_where(dir: &Path, partition_cols: &[&str], predicate: Expr) -> usize {
    let ctx = SessionContext::new();
    let cols = partition_cols
        .iter()
        .map(|c| (c.to_string(), DataType::Utf8))
        .collect::<Vec<_>>();
    let options = ParquetReadOptions::default().table_partition_cols(cols);
    ctx.read_parquet(format!("{}/", dir.display()), options)
        .await
        .unwrap()
        .filter(predicate)
        .unwrap()
        .count()
        .await
        .unwrap()
}

/// Reads a written table back, one map of column to display value per row.
async fn read_rows(dir: &Path, partition_cols: &[&str]) -> Vec<BTreeMap<String, String>> {
    let ctx = SessionContext::new();
    let cols = partition_cols
        .iter()
        .map(|c| (c.to_string(), DataType::Utf8))
        .collect::<Vec<_>>();
    let options = ParquetReadOptions::default().table_partition_cols(cols);
    let batches = ctx
        .read_parquet(format!("{}/", dir.display()), options)
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();

    let mut rows = Vec::new();
    for batch in batches {
        let schema = batch.schema();
        for row in 0..batch.num_rows() {
            rows.push(
                schema
                    .fields()
                    .iter()
                    .enumerate()
                    .map(|(i, f)| {
                        (f.name().clone(), array_value_to_string(batch.column(i), row).unwrap())
                    })
                    .collect(),
            );
        }
    }
    rows
}

fn snapshot(dir: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    let mut files = BTreeMap::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in fs::read_dir(&current).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                pending.push(path);
            } else {
                files.insert(path.strip_prefix(dir).unwrap().to_path_buf(), fs::read(&path).unwrap());
            }
        }
    }
    files
}

#[tokio::test]
async fn test_full_run_builds_all_tables() {
    let fixture = Fixture::new();
    fixture.write_events(&default_events());

    let manifests = run_etl_pipeline(&fixture.config("")).await.unwrap();
    let tables: Vec<&str> = manifests.iter().map(|m| m.table.as_str()).collect();
    assert_eq!(tables, vec!["songs", "artists", "users", "time", "songplays"]);

    let songs = read_rows(&fixture.output("songs"), &["year", "artist_id"]).await;
    assert_eq!(songs.len(), 2);
    assert!(fixture.output("songs").join("year=1961/artist_id=AR1/part-00000.parquet").exists());
    assert!(fixture.output("songs").join("_SUCCESS").exists());

    let artists = read_rows(&fixture.output("artists"), &[]).await;
    assert_eq!(artists.len(), 2);

    let users = read_rows(&fixture.output("users"), &[]).await;
    let users: BTreeMap<String, (String, String)> = users
        .into_iter()
        .map(|u| (u["userId"].clone(), (u["firstName"].clone(), u["level"].clone())))
        .collect();
    assert_eq!(users.len(), 2);
    assert_eq!(users["10"], ("Ann".to_string(), "paid".to_string()));
    assert_eq!(users["20"], ("Bob".to_string(), "free".to_string()));

    let time = read_rows(&fixture.output("time"), &["year", "month"]).await;
    assert_eq!(time.len(), 2);
    let first = time.iter().find(|t| t["hour"] == "23" && t["week"] == "45").unwrap();
    assert_eq!(first["day"], "6");
    assert_eq!(first["weekday"], "1");
    assert_eq!(first["year"], "2018");
    assert_eq!(first["month"], "11");

    let songplays = read_rows(&fixture.output("songplays"), &["year", "month"]).await;
    assert_eq!(songplays.len(), 3);
    let mut song_ids: Vec<&str> = songplays.iter().map(|p| p["song_id"].as_str()).collect();
    song_ids.sort();
    assert_eq!(song_ids, vec!["SO1", "SO1", "SO2"]);
    assert!(songplays.iter().all(|p| p["year"] == "2018" && p["month"] == "11"));
    let ids: HashSet<&str> = songplays.iter().map(|p| p["songplay_id"].as_str()).collect();
    assert_eq!(ids.len(), songplays.len());
}

#[tokio::test]
async fn test_title_artist_match_narrows_songplays() {
    let fixture = Fixture::new();
    fixture.write_events(&default_events());

    run_etl_pipeline(&fixture.config("\n[PIPELINE]\nSONG_MATCH = title_artist\n"))
        .await
        .unwrap();

    let songplays = read_rows(&fixture.output("songplays"), &["year", "month"]).await;
    assert_eq!(songplays.len(), 2);
    assert!(songplays.iter().all(|p| p["song_id"] == "SO1" && p["artist_id"] == "AR1"));
}

#[tokio::test]
async fn test_rerun_produces_identical_catalog_output() {
    let fixture = Fixture::new();
    fixture.write_events(&default_events());
    let config = fixture.config("");

    run_etl_pipeline(&config).await.unwrap();
    let songs = snapshot(&fixture.output("songs"));
    let artists = snapshot(&fixture.output("artists"));

    run_etl_pipeline(&config).await.unwrap();
    assert_eq!(snapshot(&fixture.output("songs")), songs);
    assert_eq!(snapshot(&fixture.output("artists")), artists);
}

#[tokio::test]
async fn test_events_before_catalog_fail_with_missing_table() {
    let fixture = Fixture::new();
    fixture.write_events(&default_events());

    let settings = Settings::new(&fixture.config("")).unwrap();
    let ctx = create_session(settings).unwrap();
    let err = EventTransform.run(&ctx).await.unwrap_err();
    match err {
        Error::MissingTable { table, .. } => assert_eq!(table, "songs"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_non_play_event_yields_empty_event_tables() {
    let fixture = Fixture::new();
    fixture.write_events(&[event("30", "Cy", "free", PLAY_TS, "Home", "", "")]);

    let manifests = run_etl_pipeline(&fixture.config("")).await.unwrap();
    for manifest in manifests.iter().filter(|m| ["users", "time", "songplays"].contains(&m.table.as_str())) {
        assert_eq!(manifest.rows, 0, "{}", manifest.table);
    }
    assert!(read_rows(&fixture.output("users"), &[]).await.is_empty());
}

#[tokio::test]
async fn test_play_without_timestamp_fails() {
    let fixture = Fixture::new();
    fixture.write_events(&[
        event("10", "Ann", "free", PLAY_TS, "NextSong", "Paris", "Line Renaud"),
        r#"{"userId": "11", "page": "NextSong", "song": "Paris", "ts": null}"#.to_string(),
    ]);

    let err = run_etl_pipeline(&fixture.config("")).await.unwrap_err();
    assert!(matches!(err, Error::InvalidTimestamp(_)), "{err}");
}

#[tokio::test]
async fn test_title_artist_match_ignores_repeated_artist_rows() {
    let fixture = Fixture::new();
    fixture.write_songs(
        "A/B/A/TRABA.json",
        &[
            song_at("SO1", "Paris", "AR1", "Line Renaud", 1961, "Paris"),
            song_at("SO1", "Paris", "AR1", "Line Renaud", 1961, "France"),
        ],
    );
    fixture.write_events(&[event("10", "Ann", "free", PLAY_TS, "NextSong", "Paris", "Line Renaud")]);

    run_etl_pipeline(&fixture.config("\n[PIPELINE]\nSONG_MATCH = title_artist\n"))
        .await
        .unwrap();

    let artists = read_rows(&fixture.output("artists"), &[]).await;
    assert_eq!(artists.iter().filter(|a| a["artist_id"] == "AR1").count(), 3);

    let songplays = read_rows(&fixture.output("songplays"), &["year", "month"]).await;
    assert_eq!(songplays.len(), 1);
    assert_eq!(songplays[0]["song_id"], "SO1");
}

#[tokio::test]
async fn test_song_without_artist_keeps_null_artist_in_songplays() {
    let fixture = Fixture::new();
    write_lines(
        &fixture.root().join("song_data/B/B/B/TRBBB.json"),
        &[r#"{"num_songs": 1, "artist_id": null, "artist_name": "Anon", "song_id": "SO9", "title": "Nowhere", "duration": 99.0, "year": 2001}"#.to_string()],
    );
    fixture.write_events(&[event("10", "Ann", "free", PLAY_TS, "NextSong", "Nowhere", "Anon")]);

    run_etl_pipeline(&fixture.config("")).await.unwrap();

    assert!(
        fixture
            .output("songs")
            .join("year=2001/artist_id=__HIVE_DEFAULT_PARTITION__/part-00000.parquet")
            .exists()
    );
    let songplays = fixture.output("songplays");
    assert_eq!(read_rows(&songplays, &["year", "month"]).await.len(), 1);
    assert_eq!(
        count_where(&songplays, &["year", "month"], col("artist_id").is_null()).await,
        1
    );
    assert_eq!(
        count_where(&songplays, &["year", "month"], col("song_id").eq(lit("SO9"))).await,
        1
    );
}

#[tokio::test]
async fn test_artist_id_with_path_characters_round_trips() {
    let fixture = Fixture::new();
    fixture.write_songs(
        "C/C/C/TRCCC.json",
        &[song("SO7", "Slashes", "AR/7#b", "Slash Band", 1999)],
    );
    fixture.write_events(&[event("10", "Ann", "free", PLAY_TS, "NextSong", "Slashes", "Slash Band")]);

    run_etl_pipeline(&fixture.config("")).await.unwrap();

    assert!(
        fixture
            .output("songs")
            .join("year=1999/artist_id=AR%2F7%23b/part-00000.parquet")
            .exists()
    );
    let songplays = read_rows(&fixture.output("songplays"), &["year", "month"]).await;
    assert_eq!(songplays.len(), 1);
    assert_eq!(songplays[0]["artist_id"], "AR/7#b");
}
