use std::sync::Mutex;
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::builder::ProbeObserver;
use crate::fleet::HostInventory;
use crate::probe::ProbeError;

/// Controls how progress is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Spinners and bars on stderr.
    Normal,
    /// Like Normal, plus one line per finished host.
    Verbose,
    /// Nothing but final output.
    Quiet,
    /// No ANSI, plain lines (for piped/non-TTY).
    Plain,
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("[{prefix}] {spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn done_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("[{prefix}] \u{2713} {msg:.green}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn probe_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("[{prefix}] {bar:24.cyan/blue} {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

/// Numbered phases of one command (probe, plan, apply, refresh), each
/// with a spinner that turns into a checkmark.
pub struct StepProgress {
    multi: MultiProgress,
    total_steps: usize,
    current_step: usize,
    mode: OutputMode,
}

impl StepProgress {
    pub fn new(total_steps: usize, mode: OutputMode) -> Self {
        let multi = match mode {
            OutputMode::Plain | OutputMode::Quiet => {
                MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
            }
            _ => MultiProgress::with_draw_target(ProgressDrawTarget::stderr()),
        };
        Self {
            multi,
            total_steps,
            current_step: 0,
            mode,
        }
    }

    fn next_prefix(&mut self) -> String {
        self.current_step += 1;
        format!("{}/{}", self.current_step, self.total_steps)
    }

    /// Run `fut` as the next step.
    pub async fn run<Fut, T>(&mut self, label: &str, fut: Fut) -> T
    where
        Fut: Future<Output = T>,
    {
        let prefix = self.next_prefix();
        if self.mode == OutputMode::Plain {
            eprintln!("[{prefix}] {label}");
        }

        let bar = self.multi.add(ProgressBar::new_spinner());
        bar.set_style(spinner_style());
        bar.set_prefix(prefix);
        bar.set_message(label.to_string());
        bar.enable_steady_tick(Duration::from_millis(80));

        let result = fut.await;

        bar.set_style(done_style());
        bar.finish_with_message(label.to_string());
        result
    }

    /// A probe step: a bar advancing once per host.
    pub fn probe(&mut self, hosts: usize) -> ProbeProgress {
        let prefix = self.next_prefix();
        if self.mode == OutputMode::Plain {
            eprintln!("[{prefix}] probing {hosts} hypervisor(s)");
        }
        let bar = self.multi.add(ProgressBar::new(hosts as u64));
        bar.set_style(probe_style());
        bar.set_prefix(prefix);
        ProbeProgress {
            bar,
            mode: self.mode,
            failed: Mutex::new(Vec::new()),
        }
    }

    /// Instant completion, for steps satisfied without work (cache hits).
    pub fn skip(&mut self, label: &str) {
        let prefix = self.next_prefix();
        if self.mode == OutputMode::Plain {
            eprintln!("[{prefix}] \u{2713} {label}");
            return;
        }
        let bar = self.multi.add(ProgressBar::new_spinner());
        bar.set_style(done_style());
        bar.set_prefix(prefix);
        bar.set_message(label.to_string());
        bar.finish();
    }

    /// Print a line above the managed bars.
    pub fn println(&self, text: &str) {
        match self.mode {
            OutputMode::Quiet => {}
            OutputMode::Plain => eprintln!("{text}"),
            _ => {
                self.multi.println(text).ok();
            }
        }
    }
}

/// Per-host probe progress, fed by the fleet builder.
pub struct ProbeProgress {
    bar: ProgressBar,
    mode: OutputMode,
    failed: Mutex<Vec<String>>,
}

impl ProbeProgress {
    /// Close the bar with a summary of how many hosts answered.
    pub fn finish(self) {
        let failed = self.failed.lock().map(|f| f.len()).unwrap_or(0);
        let total = self.bar.length().unwrap_or(0) as usize;
        let msg = if failed == 0 {
            format!("{total} hypervisor(s) probed")
        } else {
            format!("{} of {total} hypervisor(s) probed", total.saturating_sub(failed))
        };
        if self.mode == OutputMode::Plain {
            eprintln!("      \u{2192} {msg}");
        }
        self.bar.set_style(done_style());
        self.bar.finish_with_message(msg);
    }
}

impl ProbeObserver for ProbeProgress {
    fn probe_started(&self, host: &str) {
        self.bar.set_message(host.to_string());
    }

    fn probe_finished(&self, host: &str, result: &Result<HostInventory, ProbeError>) {
        self.bar.inc(1);
        let line = match result {
            Ok(inv) => {
                if self.mode != OutputMode::Verbose {
                    return;
                }
                format!("      {host}: {} VM(s)", inv.vms.len())
            }
            Err(e) => {
                if let Ok(mut failed) = self.failed.lock() {
                    failed.push(host.to_string());
                }
                format!("      \u{2717} {e}")
            }
        };
        match self.mode {
            OutputMode::Quiet => {}
            OutputMode::Plain => eprintln!("{line}"),
            _ => self.bar.println(line),
        }
    }
}
