use std::path::Path;

use rusqlite::{Connection, Statement, params, params_from_iter};
use tracing::{debug, warn};

use crate::dates::format_timestamp;
use crate::domain::{Cultivar, FileRecord, Season, WeatherFileLink};
use crate::error::CatalogError;
use crate::genotype::CsvTable;
use crate::weather::NumberedReading;

pub const SEASON_INFO: &str = "season_info";
pub const CULTIVARS: &str = "cultivars";
pub const FILES: &str = "files";
pub const WEATHER: &str = "weather";
pub const WEATHER_FILE_MAP: &str = "weather_file_map";
pub const GENE_MARKERS: &str = "gene_markers";
pub const CULTIVAR_GENES: &str = "cultivar_genes";

const WEATHER_COLUMNS: [&str; 7] = [
    "temperature",
    "illuminance",
    "precipitation",
    "sun_direction",
    "wind_speed",
    "wind_direction",
    "relative_humidity",
];

/// Insert counters for one table, committing every `threshold` rows.
struct BatchWriter<'c> {
    conn: &'c Connection,
    table: &'static str,
    threshold: usize,
    pending: usize,
    total: usize,
}

impl<'c> BatchWriter<'c> {
    fn begin(conn: &'c Connection, table: &'static str, threshold: usize) -> Result<Self, CatalogError> {
        conn.execute_batch("BEGIN")?;
        Ok(Self {
            conn,
            table,
            threshold: threshold.max(1),
            pending: 0,
            total: 0,
        })
    }

    fn inserted(&mut self) -> Result<(), CatalogError> {
        self.pending += 1;
        self.total += 1;
        if self.pending >= self.threshold {
            self.conn.execute_batch("COMMIT; BEGIN")?;
            self.pending = 0;
        }
        Ok(())
    }

    fn finish(self) -> Result<usize, CatalogError> {
        self.conn.execute_batch("COMMIT")?;
        if self.total == 0 {
            warn!("No {} records were written", self.table);
        } else {
            debug!("Wrote {} {} records", self.total, self.table);
        }
        Ok(self.total)
    }
}

/// Streams file rows into the files table.
pub struct FileWriter<'c> {
    writer: BatchWriter<'c>,
    insert: Statement<'c>,
    next_id: i64,
}

impl FileWriter<'_> {
    /// Stores one file and returns the id it was given.
    pub fn insert(&mut self, file: &FileRecord) -> Result<i64, CatalogError> {
        let id = self.next_id;
        self.insert.execute(params![
            id,
            file.directory,
            file.filename,
            file.format,
            file.sensor,
            file.start_time.as_ref().map(format_timestamp),
            file.finish_time.as_ref().map(format_timestamp),
            file.gantry_x,
            file.gantry_y,
            file.gantry_z,
            file.plot_id,
            file.season_id,
        ])?;
        self.writer.inserted()?;
        self.next_id += 1;
        Ok(id)
    }

    pub fn finish(self) -> Result<usize, CatalogError> {
        drop(self.insert);
        self.writer.finish()
    }
}

/// The SQLite catalog being built.
pub struct Catalog {
    conn: Connection,
    commit_threshold: usize,
}

impl Catalog {
    pub fn create(path: &Path, commit_threshold: usize) -> Result<Self, CatalogError> {
        let conn = Connection::open(path)?;
        Ok(Self {
            conn,
            commit_threshold,
        })
    }

    pub fn in_memory(commit_threshold: usize) -> Result<Self, CatalogError> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
            commit_threshold,
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn write_seasons(&self, seasons: &[Season]) -> Result<usize, CatalogError> {
        self.conn.execute_batch(
            "CREATE TABLE season_info (
                id INTEGER, plot_name TEXT, season_id INTEGER, season TEXT, cultivar_id INTEGER,
                plot_bb_min_lat REAL, plot_bb_min_lon REAL, plot_bb_max_lat REAL, plot_bb_max_lon REAL
            );
            CREATE UNIQUE INDEX season_info_id_cultivar ON season_info (id, cultivar_id);",
        )?;

        let mut writer = BatchWriter::begin(&self.conn, SEASON_INFO, self.commit_threshold)?;
        let mut insert = self
            .conn
            .prepare("INSERT INTO season_info VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)")?;
        for season in seasons {
            for site in &season.sites {
                insert.execute(params![
                    site.id,
                    site.plot_name(),
                    season.id,
                    season.name,
                    site.cultivar_id,
                    site.bounds.min_lat,
                    site.bounds.min_lon,
                    site.bounds.max_lat,
                    site.bounds.max_lon,
                ])?;
                writer.inserted()?;
            }
        }
        drop(insert);
        writer.finish()
    }

    pub fn write_cultivars(&self, cultivars: &[Cultivar]) -> Result<usize, CatalogError> {
        self.conn.execute_batch(
            "CREATE TABLE cultivars (id INTEGER, name TEXT);
            CREATE UNIQUE INDEX cultivars_id_name ON cultivars (id, name);",
        )?;

        let mut writer = BatchWriter::begin(&self.conn, CULTIVARS, self.commit_threshold)?;
        let mut insert = self.conn.prepare("INSERT INTO cultivars VALUES (?1, ?2)")?;
        for cultivar in cultivars {
            insert.execute(params![cultivar.id, cultivar.name])?;
            writer.inserted()?;
        }
        drop(insert);
        writer.finish()
    }

    /// Creates the files table and opens a writer that numbers rows from 1 as they arrive.
    pub fn files_writer(&self) -> Result<FileWriter<'_>, CatalogError> {
        self.conn.execute_batch(
            "CREATE TABLE files (
                id INTEGER, folder TEXT, filename TEXT, format TEXT, sensor TEXT,
                start_time TEXT, finish_time TEXT, gantry_x REAL, gantry_y REAL, gantry_z REAL,
                plot_id INTEGER, season_id INTEGER
            );
            CREATE UNIQUE INDEX files_id_plot ON files (id, plot_id);",
        )?;

        let writer = BatchWriter::begin(&self.conn, FILES, self.commit_threshold)?;
        let insert = self.conn.prepare(
            "INSERT INTO files VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )?;
        Ok(FileWriter {
            writer,
            insert,
            next_id: 1,
        })
    }

    pub fn write_weather(&self, readings: &[NumberedReading]) -> Result<usize, CatalogError> {
        self.conn.execute_batch(
            "CREATE TABLE weather (
                id INTEGER, timestamp TEXT, temperature REAL, illuminance REAL, precipitation REAL,
                sun_direction REAL, wind_speed REAL, wind_direction REAL, relative_humidity REAL
            );
            CREATE UNIQUE INDEX weather_id ON weather (id);",
        )?;

        let mut writer = BatchWriter::begin(&self.conn, WEATHER, self.commit_threshold)?;
        let mut insert = self
            .conn
            .prepare("INSERT INTO weather VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)")?;
        for (id, reading) in readings {
            insert.execute(params![
                id,
                reading.timestamp.as_ref().map(format_timestamp),
                reading.temperature,
                reading.illuminance,
                reading.precipitation,
                reading.sun_direction,
                reading.wind_speed,
                reading.wind_direction,
                reading.relative_humidity,
            ])?;
            writer.inserted()?;
        }
        drop(insert);
        writer.finish()
    }

    pub fn write_weather_map(&self, links: &[WeatherFileLink]) -> Result<usize, CatalogError> {
        self.conn.execute_batch(
            "CREATE TABLE weather_file_map (
                id INTEGER, file_id INTEGER, min_weather_id INTEGER, max_weather_id INTEGER
            );
            CREATE UNIQUE INDEX weather_file_map_id ON weather_file_map (id);
            CREATE INDEX weather_file_map_range ON weather_file_map (min_weather_id, max_weather_id);",
        )?;

        let mut writer = BatchWriter::begin(&self.conn, WEATHER_FILE_MAP, self.commit_threshold)?;
        let mut insert = self
            .conn
            .prepare("INSERT INTO weather_file_map VALUES (?1, ?2, ?3, ?4)")?;
        for (idx, link) in links.iter().enumerate() {
            insert.execute(params![
                idx as i64 + 1,
                link.file_id,
                link.min_weather_id,
                link.max_weather_id,
            ])?;
            writer.inserted()?;
        }
        drop(insert);
        writer.finish()
    }

    /// Creates a table shaped by an imported CSV file, unique on its key column.
    pub fn write_csv_table(&self, table: &'static str, csv: &CsvTable) -> Result<usize, CatalogError> {
        let columns = csv
            .columns
            .iter()
            .zip(&csv.kinds)
            .map(|(name, kind)| format!("{} {}", quote(name), kind.sql_type()))
            .collect::<Vec<_>>()
            .join(", ");
        self.conn.execute_batch(&format!(
            "CREATE TABLE {table} ({columns});
            CREATE UNIQUE INDEX {table}_key ON {table} ({});",
            quote(csv.key_name())
        ))?;

        let placeholders = (1..=csv.columns.len())
            .map(|idx| format!("?{idx}"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut writer = BatchWriter::begin(&self.conn, table, self.commit_threshold)?;
        let mut insert = self
            .conn
            .prepare(&format!("INSERT INTO {table} VALUES ({placeholders})"))?;
        for row in &csv.rows {
            insert.execute(params_from_iter(row.iter()))?;
            writer.inserted()?;
        }
        drop(insert);
        writer.finish()
    }

    /// Composes the derived views once every base table exists.
    pub fn create_views(&self, cultivar_genes: Option<&CsvTable>) -> Result<(), CatalogError> {
        self.conn.execute_batch(
            "CREATE VIEW cultivar_files AS
            SELECT s.id AS plot_id, s.plot_name, s.season_id, s.season,
                c.id AS cultivar_id, c.name AS cultivar_name,
                f.id AS file_id, f.folder, f.filename, f.format, f.sensor,
                f.start_time, f.finish_time, f.gantry_x, f.gantry_y, f.gantry_z
            FROM season_info AS s
                JOIN files AS f ON f.plot_id = s.id AND f.season_id = s.season_id
                JOIN cultivars AS c ON c.id = s.cultivar_id;",
        )?;

        let weather_columns = WEATHER_COLUMNS
            .iter()
            .map(|column| format!("w.{column}"))
            .collect::<Vec<_>>()
            .join(", ");
        self.conn.execute_batch(&format!(
            "CREATE VIEW weather_files AS
            SELECT w.id AS weather_id, w.timestamp AS weather_timestamp, {weather_columns},
                m.min_weather_id, m.max_weather_id, f.id AS file_id
            FROM weather AS w
                LEFT JOIN weather_file_map AS m ON w.id = m.min_weather_id
                LEFT JOIN files AS f ON f.id = m.file_id
            WHERE f.id IS NOT NULL;"
        ))?;

        let (gene_columns, gene_join) = match cultivar_genes {
            Some(genes) => {
                let columns = genes
                    .columns
                    .iter()
                    .map(|column| format!(", g.{} AS {}", quote(column), quote(&format!("gene_{column}"))))
                    .collect::<String>();
                let join = format!(
                    "LEFT JOIN {CULTIVAR_GENES} AS g ON g.{} = c.name",
                    quote(genes.key_name())
                );
                (columns, join)
            }
            None => (String::new(), String::new()),
        };
        let weather_select = WEATHER_COLUMNS
            .iter()
            .map(|column| format!("wf.{column}"))
            .collect::<Vec<_>>()
            .join(", ");
        self.conn.execute_batch(&format!(
            "CREATE VIEW unified AS
            SELECT f.id AS file_id, f.folder, f.filename, f.format, f.sensor,
                f.start_time, f.finish_time, f.gantry_x, f.gantry_y, f.gantry_z,
                s.id AS plot_id, s.plot_name, s.season_id, s.season,
                s.plot_bb_min_lat, s.plot_bb_min_lon, s.plot_bb_max_lat, s.plot_bb_max_lon,
                c.id AS cultivar_id, c.name AS cultivar_name{gene_columns},
                wf.weather_id, wf.weather_timestamp, {weather_select},
                wf.min_weather_id, wf.max_weather_id
            FROM files AS f
                JOIN season_info AS s ON s.id = f.plot_id AND s.season_id = f.season_id
                JOIN cultivars AS c ON c.id = s.cultivar_id
                {gene_join}
                LEFT JOIN weather_files AS wf ON wf.file_id = f.id;"
        ))?;
        Ok(())
    }

    pub fn count(&self, table: &str) -> Result<usize, CatalogError> {
        let count: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", quote(table)), [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn close(self) -> Result<(), CatalogError> {
        self.conn
            .close()
            .map_err(|(_, err)| CatalogError::Database(err.to_string()))
    }
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}
