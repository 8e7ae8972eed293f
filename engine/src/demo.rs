//! A self-contained engine used by the default worker binary and the test
//! suites. It integrates a first-order decay `dx/dt = -gain * x` with a fixed
//! step, which is enough to exercise every dispatch-layer behavior: long
//! runs, progress reporting, cooperative aborts, parameters, results and
//! diagnostics.

use std::{collections::BTreeMap, thread, time::Duration};

use comms::msg::{LogMessage, ResultVariable};
use log::debug;

use crate::{EngineError, Model, Result, RunProgress, SimulationEngine};

/// Loads `key = value` model descriptions.
///
/// Recognized keys: `start`, `stop`, `step`, `gain`, `x0` and `pace_us`
/// (wall-clock microseconds slept per step, for tests that need a run to
/// outlast its observers).
#[derive(Debug, Default)]
pub struct DemoEngine;

impl SimulationEngine for DemoEngine {
    fn load_model(&self, source: &str) -> Result<Box<dyn Model>> {
        let mut params = BTreeMap::from([
            ("start".to_string(), 0.0),
            ("stop".to_string(), 1.0),
            ("step".to_string(), 1e-3),
            ("gain".to_string(), 1.0),
            ("x0".to_string(), 1.0),
            ("pace_us".to_string(), 0.0),
        ]);

        for (lineno, line) in source.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(EngineError::InvalidModel(format!(
                    "line {}: expected key = value, got {line:?}",
                    lineno + 1
                )));
            };
            let key = key.trim();
            let Some(slot) = params.get_mut(key) else {
                return Err(EngineError::InvalidModel(format!(
                    "line {}: unknown key {key:?}",
                    lineno + 1
                )));
            };
            *slot = value.trim().parse().map_err(|_| {
                EngineError::InvalidModel(format!("line {}: bad number {value:?}", lineno + 1))
            })?;
        }

        if params["step"] <= 0.0 || params["stop"] <= params["start"] {
            return Err(EngineError::InvalidModel(
                "time window must be non-empty and the step positive".into(),
            ));
        }

        Ok(Box::new(DemoModel {
            params,
            time: Vec::new(),
            state: Vec::new(),
            messages: vec![LogMessage {
                kind: "info".into(),
                tag: "load".into(),
                text: "model loaded".into(),
            }],
            initialized: false,
        }))
    }
}

struct DemoModel {
    params: BTreeMap<String, f64>,
    time: Vec<f64>,
    state: Vec<f64>,
    messages: Vec<LogMessage>,
    initialized: bool,
}

impl DemoModel {
    fn push_message(&mut self, kind: &str, tag: &str, text: impl Into<String>) {
        self.messages.push(LogMessage {
            kind: kind.into(),
            tag: tag.into(),
            text: text.into(),
        });
    }
}

impl Model for DemoModel {
    fn time_range(&self) -> (f64, f64) {
        (self.params["start"], self.params["stop"])
    }

    fn initialize(&mut self, start: f64, stop: f64) -> Result<()> {
        if stop <= start {
            self.push_message("error", "init", "empty time window");
            return Err(EngineError::InitFailed("empty time window".into()));
        }
        self.time.clear();
        self.state.clear();
        self.initialized = true;
        Ok(())
    }

    fn run(&mut self, progress: &RunProgress) -> Result<()> {
        if !self.initialized {
            return Err(EngineError::RunFailed("run before initialize".into()));
        }

        let (start, stop) = self.time_range();
        let step = self.params["step"];
        let gain = self.params["gain"];
        let pace = Duration::from_micros(self.params["pace_us"] as u64);

        let mut t = start;
        let mut x = self.params["x0"];

        while t < stop {
            if progress.stop_requested() {
                self.push_message("warning", "run", format!("aborted at t = {t}"));
                return Err(EngineError::RunFailed(format!("stopped at t = {t}")));
            }

            self.time.push(t);
            self.state.push(x);

            x -= gain * x * step;
            t += step;
            progress.publish(t, ((t - start) / (stop - start)).min(1.0));

            if !pace.is_zero() {
                thread::sleep(pace);
            }
        }

        self.time.push(stop);
        self.state.push(x);
        progress.publish(stop, 1.0);
        debug!("run complete after {} samples", self.time.len());

        Ok(())
    }

    fn finalize(&mut self) {
        self.initialized = false;
    }

    fn set_parameter(&mut self, name: &str, value: &str) -> Result<()> {
        let parsed: f64 = value.parse().map_err(|_| EngineError::InvalidValue {
            name: name.into(),
            value: value.into(),
        })?;
        match self.params.get_mut(name) {
            Some(slot) => {
                *slot = parsed;
                Ok(())
            }
            None => Err(EngineError::UnknownParameter(name.into())),
        }
    }

    fn get_parameter(&self, name: &str) -> Option<String> {
        self.params.get(name).map(|v| v.to_string())
    }

    fn collect_results(&self, filter: &str) -> Vec<ResultVariable> {
        if self.time.is_empty() {
            return Vec::new();
        }

        let mut variables = vec![ResultVariable {
            name: "Time".into(),
            alias: String::new(),
            quantity: "Time".into(),
            unit: "s".into(),
            data: self.time.clone(),
        }];
        variables.push(ResultVariable {
            name: "model#x".into(),
            alias: "x".into(),
            quantity: "State".into(),
            unit: "-".into(),
            data: self.state.clone(),
        });

        if filter == "*" || filter.is_empty() {
            variables
        } else {
            variables
                .into_iter()
                .filter(|v| v.name == "Time" || v.name == filter || v.alias == filter)
                .collect()
        }
    }

    fn pending_messages(&mut self) -> Vec<LogMessage> {
        std::mem::take(&mut self.messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODEL: &str = "start = 0\nstop = 0.1\nstep = 0.001\ngain = 2\nx0 = 1\n";

    #[test]
    fn loads_and_runs_to_completion() {
        let mut model = DemoEngine.load_model(MODEL).unwrap();
        let progress = RunProgress::new();

        let (start, stop) = model.time_range();
        model.initialize(start, stop).unwrap();
        model.run(&progress).unwrap();
        model.finalize();

        assert_eq!(progress.progress(), 1.0);
        let results = model.collect_results("*");
        assert_eq!(results[0].name, "Time");
        assert_eq!(results[0].data.len(), results[1].data.len());
        assert!(results[1].data.last().unwrap() < &1.0);
    }

    #[test]
    fn stop_flag_aborts_the_run() {
        let mut model = DemoEngine.load_model(MODEL).unwrap();
        let progress = RunProgress::new();
        progress.request_stop();

        let (start, stop) = model.time_range();
        model.initialize(start, stop).unwrap();
        assert!(matches!(
            model.run(&progress).unwrap_err(),
            EngineError::RunFailed(_)
        ));
    }

    #[test]
    fn rejects_malformed_descriptions() {
        assert!(DemoEngine.load_model("what is this").is_err());
        assert!(DemoEngine.load_model("frequency = 10").is_err());
        assert!(DemoEngine.load_model("start = 1\nstop = 0").is_err());
    }

    #[test]
    fn parameters_roundtrip_by_name() {
        let mut model = DemoEngine.load_model(MODEL).unwrap();
        model.set_parameter("gain", "3.5").unwrap();
        assert_eq!(model.get_parameter("gain").unwrap(), "3.5");
        assert!(model.get_parameter("missing").is_none());
        assert!(model.set_parameter("gain", "fast").is_err());
    }

    #[test]
    fn messages_are_drained_once() {
        let mut model = DemoEngine.load_model(MODEL).unwrap();
        let first = model.pending_messages();
        assert_eq!(first.len(), 1);
        assert!(model.pending_messages().is_empty());
    }
}
