//! Replay of a recorded JSON-lines trace.
//!
//! The scenario handle is a file path. Each non-blank line holds one
//! tick as `{"vehicles": {...}, "trafficLights": {...}, "time": <float>}`;
//! missing fields default to empty. The stepper reports `Done` at end of
//! file. A line that does not parse fails the run at that tick.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use relay_core::source::{ScenarioHandle, SnapshotSource, SourceError, StepOutcome, Stepper};
use relay_types::StepSnapshot;
use tracing::debug;

/// Source that replays a trace file named by the scenario handle.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplaySource;

impl SnapshotSource for ReplaySource {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn check(&self, scenario: &ScenarioHandle) -> Result<(), SourceError> {
        let path = Path::new(scenario.as_str());
        let metadata = std::fs::metadata(path).map_err(|e| SourceError::Unavailable {
            message: format!("trace {scenario} is not readable: {e}"),
        })?;
        if !metadata.is_file() {
            return Err(SourceError::Unavailable {
                message: format!("trace {scenario} is not a regular file"),
            });
        }
        Ok(())
    }

    fn initialize(&self, scenario: &ScenarioHandle) -> Result<Box<dyn Stepper>, SourceError> {
        let file = File::open(scenario.as_str()).map_err(|e| SourceError::Unavailable {
            message: format!("failed to open trace {scenario}: {e}"),
        })?;
        debug!(%scenario, "Replay trace opened");
        Ok(Box::new(ReplayStepper {
            reader: Some(BufReader::new(file)),
            tick: 0,
            line: String::new(),
        }))
    }
}

struct ReplayStepper {
    reader: Option<BufReader<File>>,
    tick: u64,
    line: String,
}

impl Stepper for ReplayStepper {
    fn advance(&mut self) -> Result<StepOutcome, SourceError> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(StepOutcome::Done);
        };

        loop {
            self.line.clear();
            let read = reader.read_line(&mut self.line).map_err(|e| SourceError::Step {
                tick: self.tick,
                message: format!("failed to read trace: {e}"),
            })?;
            if read == 0 {
                return Ok(StepOutcome::Done);
            }
            if !self.line.trim().is_empty() {
                break;
            }
        }

        let snapshot: StepSnapshot =
            serde_json::from_str(self.line.trim()).map_err(|e| SourceError::Step {
                tick: self.tick,
                message: format!("invalid trace line: {e}"),
            })?;
        self.tick = self.tick.saturating_add(1);
        Ok(StepOutcome::Advanced(snapshot))
    }

    fn shutdown(&mut self) {
        self.reader = None;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic, clippy::float_cmp)]
mod tests {
    use std::io::Write;
    use std::path::PathBuf;

    use super::*;

    /// A trace file removed on drop.
    struct TempTrace(PathBuf);

    impl TempTrace {
        fn new(contents: &str) -> Self {
            let path = std::env::temp_dir().join(format!("relay-trace-{}.jsonl", uuid::Uuid::now_v7()));
            let mut file = File::create(&path).unwrap();
            file.write_all(contents.as_bytes()).unwrap();
            Self(path)
        }

        fn handle(&self) -> ScenarioHandle {
            ScenarioHandle::new(self.0.to_string_lossy())
        }
    }

    impl Drop for TempTrace {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    fn next(stepper: &mut dyn Stepper) -> StepSnapshot {
        match stepper.advance().unwrap() {
            StepOutcome::Advanced(s) => s,
            StepOutcome::Done => panic!("trace ended early"),
        }
    }

    #[test]
    fn replays_lines_then_done() {
        let trace = TempTrace::new(concat!(
            r#"{"vehicles":{"v1":{"id":"v1","x":1.0,"y":2.0,"angle":90.0,"speed":3.0,"type":"car","route":["a","b"]}},"trafficLights":{"j":{"state":"Gr","phases":["Gr","rG"]}},"time":0.1}"#,
            "\n\n",
            r#"{"time":0.2}"#,
            "\n",
        ));
        let source = ReplaySource;
        source.check(&trace.handle()).unwrap();
        let mut stepper = source.initialize(&trace.handle()).unwrap();

        let first = next(stepper.as_mut());
        assert_eq!(first.entities["v1"].route, vec!["a", "b"]);
        assert_eq!(first.signals["j"].current_state, "Gr");
        assert_eq!(first.sim_time, 0.1);

        let second = next(stepper.as_mut());
        assert!(second.entities.is_empty());
        assert_eq!(second.sim_time, 0.2);

        assert_eq!(stepper.advance().unwrap(), StepOutcome::Done);
        stepper.shutdown();
        assert_eq!(stepper.advance().unwrap(), StepOutcome::Done);
    }

    #[test]
    fn bad_line_fails_at_its_tick() {
        let trace = TempTrace::new("{\"time\":1.0}\nnot json\n");
        let mut stepper = ReplaySource.initialize(&trace.handle()).unwrap();
        let _ = next(stepper.as_mut());
        assert!(matches!(
            stepper.advance(),
            Err(SourceError::Step { tick: 1, .. })
        ));
    }

    #[test]
    fn missing_trace_fails_check() {
        let handle = ScenarioHandle::new("/nonexistent/relay/trace.jsonl");
        assert!(matches!(
            ReplaySource.check(&handle),
            Err(SourceError::Unavailable { .. })
        ));
        assert!(ReplaySource.initialize(&handle).is_err());
    }

    #[test]
    fn directory_fails_check() {
        let handle = ScenarioHandle::new(std::env::temp_dir().to_string_lossy());
        assert!(ReplaySource.check(&handle).is_err());
    }
}
