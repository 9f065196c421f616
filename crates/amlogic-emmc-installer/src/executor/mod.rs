use std::collections::BTreeMap;
use std::io::{BufReader, Read};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Instant;

use crate::ampart::ToolRunner;
use crate::error::{Error, ErrorKind, Result};
use crate::log_sanitize::sanitize_log_line;
use crate::pipeline::Pipeline;
use crate::session::InstallSession;

pub type StepExecFn = fn(&mut InstallSession, &mut ExecCtx) -> Result<()>;

#[derive(Debug, Clone)]
pub enum ExecEvent {
    StepStarted {
        id: String,
    },
    StepLog {
        id: String,
        line: String,
    },
    StepFinished {
        id: String,
        ok: bool,
        error: Option<String>,
        elapsed_ms: u128,
    },
    ExecutorDone {
        ok: bool,
        error: Option<String>,
    },
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: ExecEvent);
}

/// Prints progress lines; the summary only appears when every step succeeded.
#[derive(Default)]
pub struct StdoutSink {
    state: Mutex<StdoutSinkState>,
}

#[derive(Default)]
struct StdoutSinkState {
    started_at: Option<Instant>,
    steps_ok: usize,
    log_lines: usize,
    total_step_ms: u128,
}

impl ExecSink for StdoutSink {
    fn emit(&self, ev: ExecEvent) {
        match ev {
            ExecEvent::StepStarted { id } => {
                if let Ok(mut s) = self.state.lock() {
                    s.started_at.get_or_insert_with(Instant::now);
                }
                println!("RUN: {id}");
            }
            ExecEvent::StepLog { id, line } => {
                if let Ok(mut s) = self.state.lock() {
                    s.log_lines = s.log_lines.saturating_add(1);
                }
                println!("[{id}] {line}");
            }
            ExecEvent::StepFinished {
                id,
                ok,
                error,
                elapsed_ms,
            } => {
                if let Ok(mut s) = self.state.lock() {
                    s.total_step_ms = s.total_step_ms.saturating_add(elapsed_ms);
                    if ok {
                        s.steps_ok = s.steps_ok.saturating_add(1);
                    }
                }
                if ok {
                    println!("DONE: {id} ({elapsed_ms}ms)");
                } else {
                    println!("FAIL: {id} ({elapsed_ms}ms) {}", error.unwrap_or_default());
                }
            }
            ExecEvent::ExecutorDone { ok, .. } => {
                let Ok(mut s) = self.state.lock() else {
                    return;
                };
                if ok {
                    let wall = s.started_at.map(|t| t.elapsed()).unwrap_or_default();
                    for line in s.summary_lines(wall.as_secs()) {
                        println!("{line}");
                    }
                }
                *s = StdoutSinkState::default();
            }
        }
    }
}

impl StdoutSinkState {
    fn summary_lines(&self, wall_secs: u64) -> Vec<String> {
        vec![
            "SUMMARY:".to_string(),
            format!("  steps: {}", self.steps_ok),
            format!("  logs: {}", self.log_lines),
            format!("  step time: {}", format_elapsed_hms((self.total_step_ms / 1000) as u64)),
            format!("  elapsed: {}", format_elapsed_hms(wall_secs)),
        ]
    }
}

#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ExecEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<ExecEvent>) -> Self {
        Self { tx }
    }
}

impl ExecSink for ChannelSink {
    fn emit(&self, ev: ExecEvent) {
        let _ = self.tx.send(ev);
    }
}

#[derive(Clone)]
pub struct ExecCtx {
    pub dry_run: bool,
    pub sink: Arc<dyn ExecSink>,
    pub current_step_id: Option<String>,
}

/// `parted -s /dev/mmcblk2 mklabel msdos`, for logs.
pub fn command_line(cmd: &Command) -> String {
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|s| s.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

impl ExecCtx {
    pub fn new(dry_run: bool, sink: Arc<dyn ExecSink>) -> Self {
        Self {
            dry_run,
            sink,
            current_step_id: None,
        }
    }

    pub fn set_step(&mut self, id: impl Into<String>) {
        self.current_step_id = Some(id.into());
    }

    pub fn log(&self, msg: &str) {
        let id = self
            .current_step_id
            .clone()
            .unwrap_or_else(|| "<none>".into());
        self.sink.emit(ExecEvent::StepLog {
            id,
            line: msg.to_string(),
        });
    }

    /// Runs a command, streaming its sanitised output into the sink line by line.
    pub fn run_cmd(&self, mut cmd: Command) -> Result<()> {
        let line = command_line(&cmd);
        if self.dry_run {
            self.log(&format!("DRY-RUN: {line}"));
            return Ok(());
        }
        self.log(&format!("$ {line}"));

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::new(ErrorKind::ExternalTool, format!("spawn {line} failed: {e}")))?;

        let (tx, rx) = mpsc::channel::<String>();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(out, tx));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(err, tx));
        }
        drop(tx);

        for line in rx {
            let line = sanitize_log_line(&line);
            if !line.is_empty() {
                self.log(&line);
            }
        }

        let status = child
            .wait()
            .map_err(|e| Error::new(ErrorKind::ExternalTool, format!("wait failed: {e}")))?;
        if !status.success() {
            return Err(Error::new(
                ErrorKind::ExternalTool,
                format!("{line} failed: {status}"),
            ));
        }
        Ok(())
    }

    /// Runs a command and returns its stdout; stderr is forwarded to the sink.
    /// In dry-run mode nothing runs and the output is empty.
    pub fn run_capture(&self, mut cmd: Command) -> Result<String> {
        let line = command_line(&cmd);
        if self.dry_run {
            self.log(&format!("DRY-RUN: {line}"));
            return Ok(String::new());
        }
        self.log(&format!("$ {line}"));
        let out = cmd
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::new(ErrorKind::ExternalTool, format!("spawn {line} failed: {e}")))?;
        for l in String::from_utf8_lossy(&out.stderr).lines() {
            let l = sanitize_log_line(l);
            if !l.is_empty() {
                self.log(&l);
            }
        }
        if !out.status.success() {
            return Err(Error::new(
                ErrorKind::ExternalTool,
                format!("{line} failed: {}", out.status),
            ));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

impl ToolRunner for ExecCtx {
    fn capture(&self, program: &str, args: &[String]) -> Result<String> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        self.run_capture(cmd)
    }
}

#[derive(Default)]
pub struct StepRegistry {
    exec: BTreeMap<&'static str, StepExecFn>,
}

impl StepRegistry {
    pub fn add(&mut self, id: &'static str, f: StepExecFn) -> Result<()> {
        if self.exec.contains_key(id) {
            return Err(Error::msg(format!("duplicate step executor for '{id}'")));
        }
        self.exec.insert(id, f);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<StepExecFn> {
        self.exec.get(id).copied()
    }
}

pub trait StageExec {
    fn register_steps(reg: &mut StepRegistry) -> Result<()>;
}

/// Runs the pipeline in order and stops at the first failing step.
/// The failing step's error kind is kept; its id is prefixed to the message.
pub fn execute_pipeline(
    session: &mut InstallSession,
    pipeline: &Pipeline,
    reg: &StepRegistry,
    ctx: &mut ExecCtx,
) -> Result<()> {
    for step in pipeline.ordered()? {
        let Some(exec) = reg.get(&step.id) else {
            return Err(Error::msg(format!(
                "no executor registered for step '{}'",
                step.id
            )));
        };
        ctx.sink.emit(ExecEvent::StepStarted {
            id: step.id.clone(),
        });
        ctx.set_step(step.id.clone());
        let start = Instant::now();
        let res = exec(session, ctx);
        let elapsed_ms = start.elapsed().as_millis();
        match res {
            Ok(()) => ctx.sink.emit(ExecEvent::StepFinished {
                id: step.id.clone(),
                ok: true,
                error: None,
                elapsed_ms,
            }),
            Err(e) => {
                ctx.sink.emit(ExecEvent::StepFinished {
                    id: step.id.clone(),
                    ok: false,
                    error: Some(e.to_string()),
                    elapsed_ms,
                });
                let err = Error::new(e.kind(), format!("step '{}' failed: {e}", step.id));
                ctx.sink.emit(ExecEvent::ExecutorDone {
                    ok: false,
                    error: Some(err.to_string()),
                });
                return Err(err);
            }
        }
    }
    ctx.sink.emit(ExecEvent::ExecutorDone {
        ok: true,
        error: None,
    });
    Ok(())
}

/// Splits a child's output on `\n` and `\r` (mkfs and parted redraw progress
/// with bare carriage returns) and forwards each non-empty line.
fn read_output_stream<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    const MAX_LINE_BYTES: usize = 16 * 1024;
    let mut line = Vec::with_capacity(256);
    let flush = |line: &mut Vec<u8>| {
        if !line.is_empty() {
            tx.send(String::from_utf8_lossy(line).into_owned()).ok();
            line.clear();
        }
    };
    for byte in BufReader::new(reader).bytes() {
        let Ok(b) = byte else {
            break;
        };
        match b {
            b'\n' | b'\r' => flush(&mut line),
            _ => {
                line.push(b);
                if line.len() >= MAX_LINE_BYTES {
                    flush(&mut line);
                }
            }
        }
    }
    flush(&mut line);
}

fn format_elapsed_hms(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dry_run_logs_command_line_without_running() {
        let (tx, rx) = mpsc::channel();
        let mut ctx = ExecCtx::new(true, Arc::new(ChannelSink::new(tx)));
        ctx.set_step("t");
        let mut cmd = Command::new("/nonexistent/parted");
        cmd.args(["-s", "/dev/mmcblk2", "mklabel", "msdos"]);
        ctx.run_cmd(cmd).expect("dry-run never spawns");
        let Ok(ExecEvent::StepLog { id, line }) = rx.try_recv() else {
            panic!("expected a log line");
        };
        assert_eq!(id, "t");
        assert_eq!(line, "DRY-RUN: /nonexistent/parted -s /dev/mmcblk2 mklabel msdos");
    }

    #[cfg(unix)]
    #[test]
    fn failing_command_is_an_external_tool_error() {
        let (tx, _rx) = mpsc::channel();
        let ctx = ExecCtx::new(false, Arc::new(ChannelSink::new(tx)));
        let err = ctx.run_cmd(Command::new("false")).expect_err("false fails");
        assert_eq!(err.kind(), ErrorKind::ExternalTool);
    }

    #[test]
    fn elapsed_format() {
        assert_eq!(format_elapsed_hms(3725), "01:02:05");
    }

    #[test]
    fn summary_reports_accumulated_step_time() {
        let sink = StdoutSink::default();
        for (id, ms) in [("install.backup", 1_500u128), ("install.rootfs", 62_000)] {
            sink.emit(ExecEvent::StepFinished {
                id: id.into(),
                ok: true,
                error: None,
                elapsed_ms: ms,
            });
        }
        let s = sink.state.lock().expect("state");
        let lines = s.summary_lines(70);
        assert_eq!(lines[1], "  steps: 2");
        assert_eq!(lines[3], "  step time: 00:01:03");
        assert_eq!(lines[4], "  elapsed: 00:01:10");
    }
}
