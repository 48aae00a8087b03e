//! Run command - drive a scenario on a simulated VM and print the session as JSON lines

use std::{
    io::Write,
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use bpdb_common::{
    types::{ExecutionContextId, PauseInfo, SessionEvent},
    DebuggerConfig,
};
use bpdb_engine::{AssetError, DebugSession, MemoryHost, RunReport, SimVm};
use eyre::{bail, eyre, Result};
use serde::Serialize;
use serde_json::{json, Value as Json};
use tokio::sync::broadcast::{
    self,
    error::{RecvError, TryRecvError},
};
use tracing::{debug, info, warn};

use crate::scenario::{parse_breakpoint, parse_location, parse_watch, Command, Scenario};

/// How often waits re-check whether any worker is still running.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Outcome of a scenario run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunSummary {
    /// Commands issued, including automatic continues.
    pub commands: usize,
    /// Commands that failed.
    pub failed: usize,
    /// Runs that executed.
    pub runs: usize,
}

struct Worker {
    run: usize,
    context: ExecutionContextId,
    handle: JoinHandle<Result<RunReport, AssetError>>,
}

/// Executes a scenario against a fresh session and writes every event and
/// command result as one JSON object per line.
pub struct ScenarioRunner<W> {
    scenario: Scenario,
    session: Arc<DebugSession>,
    vm: SimVm,
    events: broadcast::Receiver<SessionEvent>,
    started: Vec<bool>,
    workers: Vec<Worker>,
    pause_timeout: Duration,
    out: W,
    summary: RunSummary,
}

impl<W: Write> ScenarioRunner<W> {
    /// Install the scenario into a new in-memory host and attach a session to it.
    pub fn new(scenario: Scenario, config: DebuggerConfig, pause_timeout: Duration, out: W) -> Result<Self> {
        let host = Arc::new(MemoryHost::new());
        scenario.install(&host);

        let session = DebugSession::new(config, host.clone(), host.clone());
        session.attach(host.clone())?;
        let events = session.subscribe();

        Ok(Self {
            started: vec![false; scenario.runs.len()],
            scenario,
            session,
            vm: SimVm::new(host),
            events,
            workers: Vec::new(),
            pause_timeout,
            out,
            summary: RunSummary::default(),
        })
    }

    /// Issue every command, start any run not started yet, continue whatever
    /// is still paused until all runs end, then shut the session down.
    pub async fn run(mut self) -> Result<(RunSummary, W)> {
        let commands = std::mem::take(&mut self.scenario.commands);
        for command in &commands {
            self.drain()?;
            self.issue(command).await?;
        }

        self.start_remaining()?;
        self.finish().await?;

        self.session.shutdown();
        self.drain()?;
        info!(
            commands = self.summary.commands,
            failed = self.summary.failed,
            runs = self.summary.runs,
            "Scenario finished"
        );
        Ok((self.summary, self.out))
    }

    async fn issue(&mut self, command: &Command) -> Result<()> {
        debug!(command = command.name(), "Issuing command");
        self.summary.commands += 1;
        let result = match self.execute(command).await {
            Ok(result) => json!({ "command": command.name(), "ok": true, "result": result }),
            Err(err) => {
                self.summary.failed += 1;
                warn!(command = command.name(), %err, "Command failed");
                json!({ "command": command.name(), "ok": false, "error": err.to_string() })
            }
        };
        self.drain()?;
        self.emit(&result)
    }

    async fn execute(&mut self, command: &Command) -> Result<Json> {
        let paused = if command.needs_pause() { Some(self.wait_for_pause().await?) } else { None };
        let context = paused.as_ref().map(|p| p.context);

        let result = match command {
            Command::Start { run: Some(run) } => self.start(*run)?,
            Command::Start { run: None } => json!(self.start_remaining()?),
            Command::Break { target } => {
                serde_json::to_value(self.session.set_breakpoint(parse_breakpoint(target)?)?)?
            }
            Command::Clear { target } => {
                serde_json::to_value(self.session.clear_breakpoint(parse_location(target)?)?)?
            }
            Command::Enable { target } => {
                serde_json::to_value(self.session.enable_breakpoint(parse_location(target)?)?)?
            }
            Command::Disable { target } => {
                serde_json::to_value(self.session.disable_breakpoint(parse_location(target)?)?)?
            }
            Command::Continue => {
                let context = focused(context)?;
                self.session.resume(context)?;
                json!({ "context": context })
            }
            Command::StepInto => {
                let context = focused(context)?;
                self.session.step_into(context)?;
                json!({ "context": context })
            }
            Command::StepOver => {
                let context = focused(context)?;
                self.session.step_over(context)?;
                json!({ "context": context })
            }
            Command::StepOut => {
                let context = focused(context)?;
                self.session.step_out(context)?;
                json!({ "context": context })
            }
            Command::Watch { watch } => {
                let context = focused(context)?;
                let watch = parse_watch(watch)?;
                let reading = self.session.read_watch(context, &watch)?;
                json!({ "context": context, "watch": watch.to_string(), "reading": reading })
            }
            Command::Vars { object } => serde_json::to_value(self.session.inspect_variables(*object)?)?,
            Command::Invalidate { graph } => json!({ "orphaned": self.session.invalidate_graph(*graph) }),
            Command::RemoveOrphaned => json!({ "removed": self.session.remove_orphaned() }),
            Command::Snapshot => serde_json::to_value(self.session.snapshot())?,
        };
        Ok(result)
    }

    fn start(&mut self, run: usize) -> Result<Json> {
        let spec = *self.scenario.runs.get(run).ok_or_else(|| eyre!("No run with index {run}"))?;
        if std::mem::replace(&mut self.started[run], true) {
            bail!("Run {run} already started");
        }
        let (context, handle) = self.vm.spawn(spec.graph, spec.object)?;
        info!(run, ctx = %context, graph = %spec.graph, object = %spec.object, "Run started");
        self.workers.push(Worker { run, context, handle });
        Ok(json!({ "run": run, "context": context }))
    }

    fn start_remaining(&mut self) -> Result<Vec<Json>> {
        let pending: Vec<_> = (0..self.started.len()).filter(|i| !self.started[*i]).collect();
        pending.into_iter().map(|run| self.start(run)).collect()
    }

    fn running(&self) -> bool {
        self.workers.iter().any(|w| !w.handle.is_finished())
    }

    /// Wait until some context is focused.
    async fn wait_for_pause(&mut self) -> Result<PauseInfo> {
        let deadline = Instant::now() + self.pause_timeout;
        loop {
            self.drain()?;
            if let Some(info) = self.session.focused() {
                return Ok(info);
            }
            if !self.running() {
                bail!("No paused context and no run in progress");
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                bail!("Timed out after {:?} waiting for a pause", self.pause_timeout);
            }
            match tokio::time::timeout(remaining.min(POLL_INTERVAL), self.events.recv()).await {
                Ok(Ok(event)) => self.emit(&event)?,
                Ok(Err(RecvError::Lagged(skipped))) => warn!(skipped, "Event stream lagged"),
                Ok(Err(RecvError::Closed)) => bail!("Event stream closed"),
                Err(_) => {}
            }
        }
    }

    /// Continue paused contexts until every worker ends, then report the runs.
    async fn finish(&mut self) -> Result<()> {
        let mut deadline = Instant::now() + self.pause_timeout;
        while self.running() {
            self.drain()?;
            if let Some(info) = self.session.focused() {
                self.summary.commands += 1;
                let line = match self.session.resume(info.context) {
                    Ok(()) => json!({ "command": "continue", "ok": true, "auto": true,
                                      "result": { "context": info.context } }),
                    Err(err) => {
                        self.summary.failed += 1;
                        json!({ "command": "continue", "ok": false, "auto": true, "error": err.to_string() })
                    }
                };
                self.emit(&line)?;
                deadline = Instant::now() + self.pause_timeout;
                continue;
            }
            if Instant::now() >= deadline {
                bail!("Timed out after {:?} waiting for runs to end", self.pause_timeout);
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        for worker in std::mem::take(&mut self.workers) {
            let line = match worker.handle.join() {
                Ok(Ok(report)) => {
                    self.summary.runs += 1;
                    json!({ "run": worker.run, "context": report.context, "end": report.end,
                            "executed": report.executed })
                }
                Ok(Err(err)) => json!({ "run": worker.run, "context": worker.context, "error": err.to_string() }),
                Err(_) => bail!("Worker of run {} panicked", worker.run),
            };
            self.emit(&line)?;
        }
        Ok(())
    }

    /// Print every event received so far.
    fn drain(&mut self) -> Result<()> {
        loop {
            match self.events.try_recv() {
                Ok(event) => self.emit(&event)?,
                Err(TryRecvError::Lagged(skipped)) => warn!(skipped, "Event stream lagged"),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return Ok(()),
            }
        }
    }

    fn emit(&mut self, line: &impl Serialize) -> Result<()> {
        serde_json::to_writer(&mut self.out, line)?;
        writeln!(self.out)?;
        Ok(())
    }
}

fn focused(context: Option<ExecutionContextId>) -> Result<ExecutionContextId> {
    context.ok_or_else(|| eyre!("No paused context"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOOR: &str = r#"
[[graphs]]
id = 1
path = "/Game/BP_Door"
nodes = [
    { id = "1", kind = "event" },
    { id = "2", kind = "branch" },
    { id = "3", kind = "variable_set", variable = "Open", pins = [
        { name = "Open", direction = "input", pin_type = "bool", default_value = "true" },
    ] },
]

[[objects]]
handle = 1
name = "Door_1"
class = "BP_Door_C"
variables = [{ name = "Open", type = "bool", value = "false", category = "State" }]

[[runs]]
graph = 1
object = 1
"#;

    async fn run(commands: &str) -> (RunSummary, Vec<Json>) {
        bpdb_common::logging::ensure_test_logging(None);
        let scenario = Scenario::from_toml_str(&format!("{DOOR}\n{commands}")).unwrap();
        let runner = ScenarioRunner::new(
            scenario,
            DebuggerConfig::default(),
            Duration::from_secs(10),
            Vec::new(),
        )
        .unwrap();
        let (summary, out) = runner.run().await.unwrap();
        let lines = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        (summary, lines)
    }

    fn commands<'a>(lines: &'a [Json], name: &str) -> Vec<&'a Json> {
        lines.iter().filter(|l| l["command"] == name).collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_break_step_and_watch() {
        let (summary, lines) = run(r#"
[[commands]]
action = "break"
target = "@1:2"

[[commands]]
action = "break"
target = "@1:3"

[[commands]]
action = "start"

[[commands]]
action = "step-over"

[[commands]]
action = "watch"
watch = "3.Open"

[[commands]]
action = "continue"
"#)
        .await;
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.runs, 1);

        let paused: Vec<_> = lines.iter().filter(|l| l["event"] == "paused").collect();
        assert_eq!(paused.len(), 2);
        assert_eq!(paused[1]["reason"]["kind"], "breakpoint");
        assert_eq!(paused[1]["node"], paused[1]["reason"]["at"]);

        let watch = commands(&lines, "watch");
        assert_eq!(watch[0]["result"]["reading"]["value"]["value"], true);

        let run = lines.iter().find(|l| l.get("run").is_some() && l.get("end").is_some()).unwrap();
        assert_eq!(run["end"], "completed");
        assert_eq!(run["executed"], 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_paused_context_is_auto_continued() {
        let (summary, lines) = run(r#"
[[commands]]
action = "break"
target = "@1:3"
"#)
        .await;
        assert_eq!(summary.failed, 0);
        let auto: Vec<_> = lines.iter().filter(|l| l["auto"] == true).collect();
        assert_eq!(auto.len(), 1);
        assert_eq!(summary.runs, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failures_are_reported_not_fatal() {
        let (summary, lines) = run(r#"
[[commands]]
action = "break"
target = "@1:9"

[[commands]]
action = "continue"

[[commands]]
action = "vars"
object = 1
"#)
        .await;
        assert_eq!(summary.failed, 2);
        assert_eq!(commands(&lines, "break")[0]["ok"], false);
        assert_eq!(commands(&lines, "continue")[0]["ok"], false);
        let vars = commands(&lines, "vars");
        assert_eq!(vars[0]["result"]["categories"][0]["name"], "State");
    }
}
