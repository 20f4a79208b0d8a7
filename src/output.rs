use std::io::{self, Write};

use serde::Serialize;

use crate::app::{ProgressEvent, ProgressSink, RunReport};
use crate::config::ResolvedConfig;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_report(report: &RunReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_config(config: &ResolvedConfig) -> io::Result<()> {
        Self::print_json(config)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

pub struct ConsoleProgress;

impl ProgressSink for ConsoleProgress {
    fn event(&self, event: ProgressEvent) {
        let dim = "\x1b[2m";
        let reset = "\x1b[0m";
        match event.elapsed {
            Some(elapsed) => eprintln!(
                "{} {dim}({:.1}s){reset}",
                event.message,
                elapsed.as_secs_f64()
            ),
            None => eprintln!("{}", event.message),
        }
    }
}
