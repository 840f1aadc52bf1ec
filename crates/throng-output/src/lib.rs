//! CSV trajectory and PNG heatmap export for throng simulations.
//!
//! The CSV writer mirrors the two classic layouts: one file per agent
//! (`output_<id>.csv`, rows appended over time) or one file per written
//! timestep (`<seq>.csv`, one row per agent). Writes are throttled to a
//! configurable interval of simulated time rather than one per tick.

use image::{ImageError, Rgb, RgbImage};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use thiserror::Error;
use throng_core::{
    LineSegment, OccupancyGrid, TrajectoryBatch, TrajectoryRecorder, TrajectorySample, Vec2,
};

/// Simulated seconds between CSV rows when no interval is given.
pub const DEFAULT_WRITE_INTERVAL: f32 = 0.2;

const CSV_HEADER: &str = "time,pos_x,pos_y,pos_z,ori_x,ori_y,ori_z,color_r,color_g,color_b";

/// Export error wrapper.
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image error: {0}")]
    Image(#[from] ImageError),
}

/// How trajectory rows are grouped into files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsvLayout {
    /// One numbered file per written timestep, one row per agent.
    ByTimestep,
    /// One file per agent. Rows are buffered in memory and flushed on
    /// demand, or after every write when `immediate_flush` is set.
    ByAgent { immediate_flush: bool },
}

/// Writes agent trajectories as CSV files under one output directory.
pub struct CsvTrajectoryWriter {
    directory: PathBuf,
    layout: CsvLayout,
    write_interval: f32,
    write_time: f32,
    last_batch_time: f32,
    sequence: u64,
    buffers: HashMap<u64, Vec<String>>,
    headers_written: Vec<u64>,
    last_error: Option<OutputError>,
}

impl CsvTrajectoryWriter {
    /// Creates the output directory and a writer with the default
    /// write interval.
    pub fn create(directory: impl Into<PathBuf>, layout: CsvLayout) -> Result<Self, OutputError> {
        Self::with_write_interval(directory, layout, DEFAULT_WRITE_INTERVAL)
    }

    pub fn with_write_interval(
        directory: impl Into<PathBuf>,
        layout: CsvLayout,
        write_interval: f32,
    ) -> Result<Self, OutputError> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;
        Ok(Self {
            directory,
            layout,
            write_interval,
            write_time: 0.0,
            last_batch_time: 0.0,
            sequence: 0,
            buffers: HashMap::new(),
            headers_written: Vec::new(),
            last_error: None,
        })
    }

    /// Writes a batch unconditionally, bypassing the interval gate.
    /// Used for the initial agent positions before the first tick.
    pub fn record(&mut self, batch: &TrajectoryBatch) -> Result<(), OutputError> {
        match self.layout {
            CsvLayout::ByAgent { immediate_flush } => {
                for sample in &batch.samples {
                    self.buffers
                        .entry(sample.id.raw())
                        .or_default()
                        .push(sample_row(batch.time, sample));
                }
                if immediate_flush {
                    self.flush()?;
                }
            }
            CsvLayout::ByTimestep => {
                let path = self.directory.join(format!("{}.csv", self.sequence));
                let mut file = BufWriter::new(File::create(path)?);
                writeln!(file, "id,{CSV_HEADER}")?;
                let mut samples = batch.samples.clone();
                samples.sort_by_key(|sample| sample.id);
                for sample in &samples {
                    writeln!(file, "{},{}", sample.id, sample_row(batch.time, sample))?;
                }
                file.flush()?;
                self.sequence += 1;
            }
        }
        Ok(())
    }

    /// Appends all buffered by-agent rows to their `output_<id>.csv`
    /// files. Each file gets the header line when it is first created.
    pub fn flush(&mut self) -> Result<(), OutputError> {
        let buffers = std::mem::take(&mut self.buffers);
        for (id, rows) in buffers {
            if rows.is_empty() {
                continue;
            }
            let path = self.directory.join(format!("output_{id}.csv"));
            let mut file = BufWriter::new(
                OpenOptions::new().append(true).create(true).open(path)?,
            );
            if !self.headers_written.contains(&id) {
                writeln!(file, "{CSV_HEADER}")?;
                self.headers_written.push(id);
            }
            for row in rows {
                writeln!(file, "{row}")?;
            }
            file.flush()?;
        }
        Ok(())
    }

    /// Final flush, surfacing any error swallowed during recording.
    pub fn finish(&mut self) -> Result<(), OutputError> {
        self.flush()?;
        match self.last_error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn observe(&mut self, batch: &TrajectoryBatch) -> Result<(), OutputError> {
        let delta = batch.time - self.last_batch_time;
        self.last_batch_time = batch.time;
        self.write_time += delta;
        if self.write_time >= self.write_interval {
            self.write_time = 0.0;
        }
        if self.write_time == 0.0 {
            self.record(batch)?;
        }
        Ok(())
    }
}

impl TrajectoryRecorder for CsvTrajectoryWriter {
    fn on_tick(&mut self, batch: &TrajectoryBatch) {
        if self.last_error.is_some() {
            return;
        }
        if let Err(error) = self.observe(batch) {
            self.last_error = Some(error);
        }
    }
}

impl Drop for CsvTrajectoryWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn sample_row(time: f32, sample: &TrajectorySample) -> String {
    format!(
        "{},{},{},0,{},{},0,{},{},{}",
        time,
        sample.position.x,
        sample.position.y,
        sample.orientation.x,
        sample.orientation.y,
        sample.color[0],
        sample.color[1],
        sample.color[2],
    )
}

/// Cells of the heatmap image that render black instead of a density
/// color, built by rasterizing obstacle outlines onto the unit grid.
#[derive(Debug, Clone)]
pub struct ObstacleMask {
    width: usize,
    height: usize,
    cells: Vec<bool>,
}

impl ObstacleMask {
    #[must_use]
    pub fn empty(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            cells: vec![false; width * height],
        }
    }

    /// Marks every cell whose center lies within half a cell of an edge.
    #[must_use]
    pub fn from_segments(width: usize, height: usize, edges: &[LineSegment]) -> Self {
        let mut mask = Self::empty(width, height);
        for y in 0..height {
            for x in 0..width {
                let center = Vec2::new(x as f32 + 0.5, y as f32 + 0.5);
                if edges.iter().any(|edge| edge.distance_sq(center) <= 0.25) {
                    mask.cells[y * width + x] = true;
                }
            }
        }
        mask
    }

    #[must_use]
    pub fn is_obstacle(&self, x: usize, y: usize) -> bool {
        x < self.width && y < self.height && self.cells[y * self.width + x]
    }
}

/// Writes numbered `<seq>.png` density heatmaps.
pub struct HeatmapWriter {
    directory: PathBuf,
    sequence: u64,
}

impl HeatmapWriter {
    pub fn create(directory: impl Into<PathBuf>) -> Result<Self, OutputError> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;
        Ok(Self {
            directory,
            sequence: 0,
        })
    }

    /// Renders one occupancy grid to the next numbered PNG. Rows are
    /// flipped so that the world's y axis points up in the image.
    pub fn write(
        &mut self,
        grid: &OccupancyGrid,
        obstacles: &ObstacleMask,
    ) -> Result<PathBuf, OutputError> {
        let width = grid.width.max(1) as u32;
        let height = grid.height.max(1) as u32;
        let mut image = RgbImage::new(width, height);
        for y in 0..grid.height {
            let flipped = (grid.height - 1 - y) as u32;
            for x in 0..grid.width {
                let color = if obstacles.is_obstacle(x, y) {
                    [0, 0, 0]
                } else {
                    heat_color(grid.count(x, y))
                };
                image.put_pixel(x as u32, flipped, Rgb(color));
            }
        }
        let path = self.directory.join(format!("{}.png", self.sequence));
        image.save(&path)?;
        self.sequence += 1;
        Ok(path)
    }
}

/// Color ramp from white (empty) through blue, green, yellow and red to
/// dark brown for crowded cells.
#[must_use]
pub fn heat_color(count: u32) -> [u8; 3] {
    match count {
        0 => [255, 255, 255],
        1 => [0, 0, 255],
        2 => [0, 128, 255],
        3 => [0, 255, 255],
        4 => [0, 255, 128],
        5 => [0, 255, 0],
        6 => [255, 255, 0],
        7 => [255, 128, 0],
        8 => [255, 0, 0],
        9 => [128, 0, 0],
        _ => [64, 0, 0],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};
    use throng_core::{AgentId, Tick};

    fn temp_output_dir(prefix: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time")
            .as_nanos();
        path.push(format!("{}-{}-{}", prefix, std::process::id(), timestamp));
        path
    }

    fn sample(id: u64, x: f32) -> TrajectorySample {
        TrajectorySample {
            id: AgentId::new(id),
            position: Vec2::new(x, 2.0),
            orientation: Vec2::new(1.0, 0.0),
            color: [10, 20, 30],
        }
    }

    fn batch(tick: u64, time: f32, samples: Vec<TrajectorySample>) -> TrajectoryBatch {
        TrajectoryBatch {
            tick: Tick(tick),
            time,
            samples,
        }
    }

    #[test]
    fn by_agent_files_get_one_header_and_interval_gated_rows() -> Result<(), OutputError> {
        let dir = temp_output_dir("throng-by-agent");
        let mut writer = CsvTrajectoryWriter::create(
            &dir,
            CsvLayout::ByAgent {
                immediate_flush: false,
            },
        )?;

        // Ticks at 0.1s with a 0.2s interval: every second batch lands.
        writer.on_tick(&batch(1, 0.1, vec![sample(3, 1.0)]));
        writer.on_tick(&batch(2, 0.2, vec![sample(3, 2.0)]));
        writer.on_tick(&batch(3, 0.3, vec![sample(3, 3.0)]));
        writer.on_tick(&batch(4, 0.4, vec![sample(3, 4.0)]));
        writer.finish()?;

        let contents = fs::read_to_string(dir.join("output_3.csv"))?;
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3, "header plus two gated rows");
        assert_eq!(lines[0], CSV_HEADER);
        assert!(lines[1].starts_with("0.2,2,2,0,"));
        assert!(lines[2].starts_with("0.4,4,2,0,"));

        // A later flush must not repeat the header.
        writer.record(&batch(6, 0.6, vec![sample(3, 6.0)]))?;
        writer.finish()?;
        let contents = fs::read_to_string(dir.join("output_3.csv"))?;
        assert_eq!(
            contents.matches(CSV_HEADER).count(),
            1,
            "the header is written only when the file is created"
        );

        let _ = fs::remove_dir_all(&dir);
        Ok(())
    }

    #[test]
    fn immediate_flush_writes_without_an_explicit_flush() -> Result<(), OutputError> {
        let dir = temp_output_dir("throng-immediate");
        let mut writer = CsvTrajectoryWriter::with_write_interval(
            &dir,
            CsvLayout::ByAgent {
                immediate_flush: true,
            },
            0.1,
        )?;
        writer.on_tick(&batch(1, 0.1, vec![sample(7, 1.5)]));

        let contents = fs::read_to_string(dir.join("output_7.csv"))?;
        assert!(contents.lines().count() == 2, "header and one row on disk");

        let _ = fs::remove_dir_all(&dir);
        Ok(())
    }

    #[test]
    fn by_timestep_files_are_numbered_and_sorted_by_id() -> Result<(), OutputError> {
        let dir = temp_output_dir("throng-by-step");
        let mut writer = CsvTrajectoryWriter::create(&dir, CsvLayout::ByTimestep)?;
        writer.record(&batch(0, 0.0, vec![sample(9, 9.0), sample(2, 2.0)]))?;
        writer.record(&batch(2, 0.2, vec![sample(2, 2.5)]))?;

        let first = fs::read_to_string(dir.join("0.csv"))?;
        let lines: Vec<&str> = first.lines().collect();
        assert_eq!(lines[0], format!("id,{CSV_HEADER}"));
        assert!(lines[1].starts_with("2,"), "rows are ordered by agent id");
        assert!(lines[2].starts_with("9,"));
        assert!(dir.join("1.csv").exists());

        let _ = fs::remove_dir_all(&dir);
        Ok(())
    }

    #[test]
    fn heat_colors_match_the_published_ramp() {
        assert_eq!(heat_color(0), [255, 255, 255]);
        assert_eq!(heat_color(1), [0, 0, 255]);
        assert_eq!(heat_color(4), [0, 255, 128]);
        assert_eq!(heat_color(8), [255, 0, 0]);
        assert_eq!(heat_color(9), [128, 0, 0]);
        assert_eq!(heat_color(37), [64, 0, 0]);
    }

    #[test]
    fn heatmaps_flip_rows_and_black_out_obstacles() -> Result<(), OutputError> {
        let dir = temp_output_dir("throng-heatmap");
        let mut writer = HeatmapWriter::create(&dir)?;
        let grid = OccupancyGrid {
            width: 2,
            height: 2,
            counts: vec![1, 0, 0, 5],
        };
        let mut mask = ObstacleMask::empty(2, 2);
        mask.cells[1] = true; // cell (1, 0)
        let path = writer.write(&grid, &mask)?;
        assert!(path.ends_with("0.png"));

        let image = image::open(&path)?.into_rgb8();
        // Cell (0, 0) holds one agent and renders on the bottom row.
        assert_eq!(image.get_pixel(0, 1), &Rgb([0, 0, 255]));
        assert_eq!(image.get_pixel(1, 1), &Rgb([0, 0, 0]));
        assert_eq!(image.get_pixel(0, 0), &Rgb([255, 255, 255]));
        assert_eq!(image.get_pixel(1, 0), &Rgb([0, 255, 0]));

        let _ = fs::remove_dir_all(&dir);
        Ok(())
    }

    #[test]
    fn segment_rasterization_marks_cells_along_the_edge() {
        let wall = LineSegment::new(Vec2::new(0.0, 1.0), Vec2::new(4.0, 1.0));
        let mask = ObstacleMask::from_segments(4, 3, &[wall]);
        for x in 0..4 {
            assert!(mask.is_obstacle(x, 0), "cell ({x}, 0) borders the wall");
            assert!(mask.is_obstacle(x, 1), "cell ({x}, 1) borders the wall");
            assert!(!mask.is_obstacle(x, 2), "cell ({x}, 2) is clear");
        }
    }
}
