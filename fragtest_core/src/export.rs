// Flat CSV export of a run, and re-import of the fragment matrix

use crate::packet::{FragmentIndex, TestIndex, TestSize};
use crate::registry::{BoundsPolicy, TestRunRegistry};
use crate::state::TestRunState;
use std::fs::{self, File};
use std::io::{self, BufRead, BufWriter, Write};
use std::path::Path;

pub const LATENCY_HEADER: &str = "totalFragments,time,delta";
pub const FINISH_HEADER: &str = "totalFragments,startTime,endTime";
pub const FRAGMENT_HEADER: &str = "totalFragments,testNum,fragmentNum,received";

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("export I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },
}

/// One row per latency sample: `(size, elapsed since run start, one-way delay)`.
pub fn write_latency_csv<W: Write>(mut out: W, state: &TestRunState) -> io::Result<()> {
    writeln!(out, "{}", LATENCY_HEADER)?;
    let recorder = state.recorder();
    for size in recorder.sizes() {
        for sample in recorder.series(size) {
            writeln!(out, "{},{},{}", size, sample.elapsed_ms, sample.delay_ms)?;
        }
    }
    out.flush()
}

/// One row per timed instance: `(size, first send, last arrival)`.
pub fn write_finish_csv<W: Write>(mut out: W, state: &TestRunState) -> io::Result<()> {
    writeln!(out, "{}", FINISH_HEADER)?;
    let recorder = state.recorder();
    for size in recorder.sizes() {
        for (_, window) in recorder.windows(size) {
            writeln!(out, "{},{},{}", size, window.first_seen_ms, window.last_seen_ms)?;
        }
    }
    out.flush()
}

/// One row per fragment slot of every observed instance.
pub fn write_fragment_csv<W: Write>(mut out: W, state: &TestRunState) -> io::Result<()> {
    writeln!(out, "{}", FRAGMENT_HEADER)?;
    let registry = state.registry();
    for size in registry.sizes() {
        let Some(matrix) = registry.matrix(size) else { continue };
        for (index, instance) in matrix.realized() {
            for (fragment, received) in instance.fragments().iter().enumerate() {
                writeln!(out, "{},{},{},{}", size, index, fragment, u8::from(*received))?;
            }
        }
    }
    out.flush()
}

/// Writes `latency.csv`, `finish.csv` and `fragments.csv` into `dir`.
pub fn export_all(dir: impl AsRef<Path>, state: &TestRunState) -> Result<(), ExportError> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;
    write_latency_csv(BufWriter::new(File::create(dir.join("latency.csv"))?), state)?;
    write_finish_csv(BufWriter::new(File::create(dir.join("finish.csv"))?), state)?;
    write_fragment_csv(BufWriter::new(File::create(dir.join("fragments.csv"))?), state)?;
    tracing::info!(dir = %dir.display(), "exported run data");
    Ok(())
}

/// Rebuilds the delivery matrices from a fragment CSV written by [`write_fragment_csv`].
pub fn read_fragment_csv<R: BufRead>(input: R, population: u8) -> Result<TestRunRegistry, ExportError> {
    let mut registry = TestRunRegistry::new(population, BoundsPolicy::Reject);
    import_fragments(input, &mut registry)?;
    Ok(registry)
}

/// Loads a fragment CSV into the matrices of an existing state.
pub fn import_fragment_csv<R: BufRead>(input: R, state: &mut TestRunState) -> Result<(), ExportError> {
    import_fragments(input, state.registry_mut())
}

fn import_fragments<R: BufRead>(input: R, registry: &mut TestRunRegistry) -> Result<(), ExportError> {
    for (i, line) in input.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        let number = i + 1;
        if line.is_empty() || (number == 1 && line == FRAGMENT_HEADER) {
            continue;
        }
        let (size, index, fragment, received) = parse_fragment_row(line)
            .map_err(|reason| ExportError::Parse { line: number, reason })?;
        registry.restore(size, index, fragment, received);
    }
    Ok(())
}

fn parse_fragment_row(line: &str) -> Result<(TestSize, TestIndex, FragmentIndex, bool), String> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != 4 {
        return Err(format!("expected 4 fields, found {}", fields.len()));
    }
    let number = |name: &str, value: &str| -> Result<u8, String> {
        value.parse::<u8>().map_err(|e| format!("invalid {} {:?}: {}", name, value, e))
    };
    let received = match fields[3] {
        "0" => false,
        "1" => true,
        other => return Err(format!("invalid received flag {:?}", other)),
    };
    Ok((
        number("totalFragments", fields[0])?,
        number("testNum", fields[1])?,
        number("fragmentNum", fields[2])?,
        received,
    ))
}
