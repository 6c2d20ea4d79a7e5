use std::io::{self, Write};

use scraps_core::claims::ClaimVerdict;
use scraps_core::config::OutputFormat;
use scraps_core::cursor::ChunkKey;
use scraps_core::reference::BranchRef;
use scraps_core::watch::Signal;
use serde_json::json;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::claim::{ClaimOutcome, ReleaseOutcome};

/// Writes watch signals as plain lines or as one JSON object per line.
///
/// In table mode the most recent live-write line stays open (no trailing
/// newline) so updates can rewrite it in place.
pub struct SignalPrinter<W: Write> {
    out: W,
    format: OutputFormat,
    timestamps: bool,
    open_line: Option<ChunkKey>,
}

impl<W: Write> SignalPrinter<W> {
    pub fn new(out: W, format: OutputFormat) -> Self {
        Self {
            out,
            format,
            timestamps: true,
            open_line: None,
        }
    }

    pub fn without_timestamps(mut self) -> Self {
        self.timestamps = false;
        self
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn print(&mut self, signal: &Signal) -> io::Result<()> {
        match self.format {
            OutputFormat::Json => {
                let line = serde_json::to_string(signal).map_err(io::Error::other)?;
                writeln!(self.out, "{line}")?;
            }
            OutputFormat::Table => self.print_table(signal)?,
        }
        self.out.flush()
    }

    pub fn print_all(&mut self, signals: &[Signal]) -> io::Result<()> {
        for s in signals {
            self.print(s)?;
        }
        Ok(())
    }

    fn print_table(&mut self, signal: &Signal) -> io::Result<()> {
        match signal {
            Signal::Begin { key, char_count } | Signal::Update { key, char_count, .. } => {
                if self.open_line.as_ref() == Some(key) {
                    write!(self.out, "\r\x1b[2K")?;
                } else {
                    self.break_open_line()?;
                }
                let stamp = self.stamp();
                write!(self.out, "{stamp}{:<14} {key} ({char_count} chars)", "WRITE")?;
                self.open_line = Some(key.clone());
            }
            Signal::Finalize { key, char_count } => {
                if self.open_line.as_ref() == Some(key) {
                    self.open_line = None;
                    writeln!(self.out)?;
                } else {
                    self.break_open_line()?;
                    let stamp = self.stamp();
                    writeln!(self.out, "{stamp}{:<14} {key} ({char_count} chars)", "WROTE")?;
                }
            }
            Signal::Line {
                label,
                summary,
                details,
                ..
            } => {
                self.break_open_line()?;
                let stamp = self.stamp();
                writeln!(self.out, "{stamp}{label:<14} {summary}")?;
                for d in details {
                    writeln!(self.out, "    {d}")?;
                }
            }
            Signal::Status { message, .. } => {
                self.break_open_line()?;
                writeln!(self.out, "-- {message}")?;
            }
            Signal::Warning { message } => {
                self.break_open_line()?;
                writeln!(self.out, "!! {message}")?;
            }
        }
        Ok(())
    }

    fn break_open_line(&mut self) -> io::Result<()> {
        if self.open_line.take().is_some() {
            writeln!(self.out)?;
        }
        Ok(())
    }

    fn stamp(&self) -> String {
        if !self.timestamps {
            return String::new();
        }
        let now = OffsetDateTime::now_utc();
        format!("{:02}:{:02}:{:02} ", now.hour(), now.minute(), now.second())
    }
}

/// Human-readable claim result, including how to release it later.
pub fn claim_text(branch: &BranchRef, patterns: &[String], outcome: &ClaimOutcome) -> String {
    let mut out = String::new();
    match &outcome.verdict {
        ClaimVerdict::Granted { expires_at } => {
            out.push_str(&format!("Claimed on {branch}: {}\n", patterns.join(", ")));
            out.push_str(&format!("  agent:   {}\n", outcome.agent_id));
            match remaining(expires_at, OffsetDateTime::now_utc()) {
                Some(left) => out.push_str(&format!("  expires: {expires_at} ({left})\n")),
                None => out.push_str(&format!("  expires: {expires_at}\n")),
            }
            out.push_str(&format!(
                "\nUse --agent-id {} to release\n",
                outcome.agent_id
            ));
        }
        ClaimVerdict::Conflict { competitors } => {
            out.push_str(&format!("Claim conflict on {branch}:\n"));
            for c in competitors {
                out.push_str(&format!("  {}\n", c.display_name()));
                out.push_str(&format!("    patterns: {}\n", c.patterns.join(", ")));
                if !c.description.is_empty() {
                    out.push_str(&format!("    claim:    {}\n", c.description));
                }
            }
        }
    }
    out
}

pub fn claim_json(patterns: &[String], outcome: &ClaimOutcome) -> serde_json::Value {
    match &outcome.verdict {
        ClaimVerdict::Granted { expires_at } => json!({
            "agent_id": outcome.agent_id,
            "patterns": patterns,
            "expires_at": expires_at,
        }),
        ClaimVerdict::Conflict { .. } => {
            serde_json::to_value(outcome).unwrap_or_else(|_| json!({"agent_id": outcome.agent_id}))
        }
    }
}

/// Release result as the server phrased it; a no-op is shown, not hidden.
pub fn release_text(branch: &BranchRef, patterns: &[String], outcome: &ReleaseOutcome) -> String {
    let mut out = format!("Release on {branch}: {}\n", patterns.join(", "));
    out.push_str(&format!("  agent:    {}\n", outcome.agent_id));
    if let Some(n) = outcome.released() {
        out.push_str(&format!("  released: {n}\n"));
    }
    if let Some(message) = outcome.message() {
        out.push_str(&format!("  server:   {message}\n"));
    }
    out
}

/// The server's release body verbatim, or `{}` when it sent none.
pub fn release_json(outcome: &ReleaseOutcome) -> serde_json::Value {
    match &outcome.body {
        serde_json::Value::Null => json!({}),
        body => body.clone(),
    }
}

fn remaining(expires_at: &str, now: OffsetDateTime) -> Option<String> {
    let at = OffsetDateTime::parse(expires_at, &Rfc3339).ok()?;
    let secs = (at - now).whole_seconds();
    if secs <= 0 {
        return Some("expired".to_owned());
    }
    Some(if secs < 120 {
        format!("in {secs}s")
    } else {
        format!("in {}m", secs / 60)
    })
}
