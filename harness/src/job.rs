//! Job descriptor: everything needed to (re)submit an attempt to the scheduler.

use std::{collections::BTreeMap, fmt::Write as _, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::scheduler::JobId;

/// Wall-clock limit in SLURM time notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Walltime(Duration);

impl Walltime {
    #[must_use]
    pub fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    #[must_use]
    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl std::str::FromStr for Walltime {
    type Err = String;

    /// Accepts `MM`, `MM:SS`, `HH:MM:SS`, `D-HH`, `D-HH:MM` and `D-HH:MM:SS`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || format!("invalid walltime '{s}', expected e.g. 1-00:00:00 or 24:00:00");
        let parse = |part: &str| part.trim().parse::<u64>().map_err(|_| invalid());

        let (days, rest) = match s.trim().split_once('-') {
            Some((d, rest)) => (Some(parse(d)?), rest),
            None => (None, s.trim()),
        };
        let parts = rest
            .split(':')
            .map(parse)
            .collect::<Result<Vec<_>, _>>()?;

        let (d, h, m, sec) = match (days, parts.as_slice()) {
            (None, [m]) => (0, 0, *m, 0),
            (None, [m, s]) => (0, 0, *m, *s),
            (None, [h, m, s]) => (0, *h, *m, *s),
            (Some(d), [h]) => (d, *h, 0, 0),
            (Some(d), [h, m]) => (d, *h, *m, 0),
            (Some(d), [h, m, s]) => (d, *h, *m, *s),
            _ => return Err(invalid()),
        };
        let secs = d
            .checked_mul(86400)
            .and_then(|t| t.checked_add(h.checked_mul(3600)?))
            .and_then(|t| t.checked_add(m.checked_mul(60)?))
            .and_then(|t| t.checked_add(sec))
            .ok_or_else(invalid)?;
        if secs == 0 {
            return Err(invalid());
        }
        Ok(Self::from_secs(secs))
    }
}

impl std::fmt::Display for Walltime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let total = self.0.as_secs();
        let (days, rem) = (total / 86400, total % 86400);
        let (h, m, s) = (rem / 3600, rem % 3600 / 60, rem % 60);
        if days > 0 {
            write!(f, "{days}-{h:02}:{m:02}:{s:02}")
        } else {
            write!(f, "{h:02}:{m:02}:{s:02}")
        }
    }
}

impl Serialize for Walltime {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Walltime {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Bare integers are minutes, as in `sbatch --time`.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Minutes(u64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Minutes(0) => Err(serde::de::Error::custom("walltime must be positive")),
            Raw::Minutes(m) => m
                .checked_mul(60)
                .map(Self::from_secs)
                .ok_or_else(|| serde::de::Error::custom(format!("walltime of {m} minutes is too long"))),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Resource request for one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub partition: Option<String>,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub qos: Option<String>,
    #[serde(default = "default_one")]
    pub nodes: u32,
    #[serde(default = "default_one")]
    pub ntasks: u32,
    #[serde(default)]
    pub cpus_per_task: Option<u32>,
    /// GPU request, passed to `--gpus` verbatim (`1`, `a100:2`, ...).
    #[serde(default)]
    pub gpus: Option<String>,
    #[serde(default)]
    pub mem: Option<String>,
}

fn default_one() -> u32 {
    1
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            partition: None,
            account: None,
            qos: None,
            nodes: 1,
            ntasks: 1,
            cpus_per_task: None,
            gpus: None,
            mem: None,
        }
    }
}

/// Reusable submission template for an attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub name: String,
    pub walltime: Walltime,
    #[serde(default)]
    pub resources: Resources,
    /// Environment modules loaded before the attempt starts.
    #[serde(default)]
    pub modules: Vec<String>,
    /// Extra environment exported to the attempt.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Extra arguments appended to every `mdrun` invocation.
    #[serde(default)]
    pub mdrun_args: Vec<String>,
    /// Scheduler output file pattern.
    #[serde(default = "default_output")]
    pub output: String,
}

fn default_output() -> String {
    "mdchain-%j.out".to_string()
}

/// One request to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    /// Attempt entry point, without the resume flag.
    pub command: Vec<String>,
    /// Whether the attempt continues from the existing checkpoint.
    pub resume: bool,
    /// Predecessor that must reach a terminal state before this one starts.
    pub after: Option<JobId>,
}

impl Submission {
    /// Full command line of the attempt, including the resume flag.
    #[must_use]
    pub fn command_line(&self) -> Vec<String> {
        let mut cmd = self.command.clone();
        if self.resume {
            cmd.push("--resume".to_string());
        }
        cmd
    }
}

/// Quote a word for a POSIX shell when it contains anything unusual.
fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

impl JobDescriptor {
    /// Time the computation may use inside one allocation.
    #[must_use]
    pub fn budget(&self, safety_margin: Duration) -> Option<Duration> {
        self.walltime
            .as_duration()
            .checked_sub(safety_margin)
            .filter(|d| !d.is_zero())
    }

    /// Render the batch script for a submission.
    #[must_use]
    pub fn batch_script(
        &self,
        submission: &Submission,
        workdir: &Path,
        rust_log: Option<&str>,
    ) -> String {
        let r = &self.resources;
        let mut script = String::from("#!/bin/bash\n");
        let mut directive = |line: String| {
            let _ = writeln!(script, "#SBATCH {line}");
        };
        directive(format!("--job-name={}", self.name));
        directive(format!("--time={}", self.walltime));
        directive(format!("--nodes={}", r.nodes));
        directive(format!("--ntasks={}", r.ntasks));
        if let Some(cpus) = r.cpus_per_task {
            directive(format!("--cpus-per-task={cpus}"));
        }
        if let Some(ref gpus) = r.gpus {
            directive(format!("--gpus={gpus}"));
        }
        if let Some(ref mem) = r.mem {
            directive(format!("--mem={mem}"));
        }
        if let Some(ref partition) = r.partition {
            directive(format!("--partition={partition}"));
        }
        if let Some(ref account) = r.account {
            directive(format!("--account={account}"));
        }
        if let Some(ref qos) = r.qos {
            directive(format!("--qos={qos}"));
        }
        directive(format!("--output={}", self.output));
        if let Some(ref after) = submission.after {
            directive(format!("--dependency=afterany:{after}"));
        }

        script.push_str("\nset -euo pipefail\n\n");
        for module in &self.modules {
            let _ = writeln!(script, "module load {module}");
        }
        for (key, value) in &self.env {
            let _ = writeln!(script, "export {key}={}", shell_quote(value));
        }
        if let Some(rust_log) = rust_log {
            let _ = writeln!(script, "export RUST_LOG={}", shell_quote(rust_log));
        }
        let _ = writeln!(script, "cd {}", shell_quote(&workdir.to_string_lossy()));

        let command: Vec<String> = submission
            .command_line()
            .iter()
            .map(|w| shell_quote(w))
            .collect();
        let _ = writeln!(script, "exec {}", command.join(" "));
        script
    }
}
