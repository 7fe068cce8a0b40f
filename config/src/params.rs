//! System-building and run-length parameters.

use serde::{Deserialize, Serialize};

use crate::{BoxType, MdpOverride, Stage, WaterModel};

/// How the simulated system is assembled.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SystemConfig {
    #[serde(default = "default_force_field")]
    pub force_field: String,
    #[serde(default)]
    pub water: WaterModel,
    #[serde(default)]
    pub box_type: BoxType,
    /// Minimum solute to box edge distance (nm).
    #[serde(default = "default_box_distance")]
    pub box_distance: f64,
    /// Salt concentration (mol/L) on top of neutralizing counter-ions.
    #[serde(default = "default_salt_conc")]
    pub salt_conc: f64,
    #[serde(default = "default_positive_ion")]
    pub positive_ion: String,
    #[serde(default = "default_negative_ion")]
    pub negative_ion: String,
}

fn default_force_field() -> String {
    "amber99sb-ildn".into()
}
fn default_box_distance() -> f64 {
    1.0
}
fn default_salt_conc() -> f64 {
    0.15
}
fn default_positive_ion() -> String {
    "NA".into()
}
fn default_negative_ion() -> String {
    "CL".into()
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            force_field: default_force_field(),
            water: WaterModel::default(),
            box_type: BoxType::default(),
            box_distance: default_box_distance(),
            salt_conc: default_salt_conc(),
            positive_ion: default_positive_ion(),
            negative_ion: default_negative_ion(),
        }
    }
}

/// Step counts per stage.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StepConfig {
    #[serde(default = "default_em_steps")]
    pub em_steps: u64,
    #[serde(default = "default_equil_steps")]
    pub nvt_steps: u64,
    #[serde(default = "default_equil_steps")]
    pub npt_steps: u64,
    #[serde(default = "default_md_steps")]
    pub md_steps: u64,
    /// Integration timestep (ps).
    #[serde(default = "default_dt")]
    pub dt: f64,
}

fn default_em_steps() -> u64 {
    50_000
}
fn default_equil_steps() -> u64 {
    50_000
}
fn default_md_steps() -> u64 {
    5_000_000
}
fn default_dt() -> f64 {
    0.002
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            em_steps: default_em_steps(),
            nvt_steps: default_equil_steps(),
            npt_steps: default_equil_steps(),
            md_steps: default_md_steps(),
            dt: default_dt(),
        }
    }
}

/// Full simulation parameters.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MdParams {
    #[serde(default, flatten)]
    pub system: SystemConfig,
    #[serde(default, flatten)]
    pub steps: StepConfig,
    /// Reference temperature (K).
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Reference pressure (bar).
    #[serde(default = "default_pressure")]
    pub pressure: f64,
}

fn default_temperature() -> f64 {
    300.0
}
fn default_pressure() -> f64 {
    1.0
}

impl Default for MdParams {
    fn default() -> Self {
        Self {
            system: SystemConfig::default(),
            steps: StepConfig::default(),
            temperature: default_temperature(),
            pressure: default_pressure(),
        }
    }
}

impl MdParams {
    /// Number of steps a stage integrates, for the stages that run `mdrun`.
    #[must_use]
    pub fn target_steps(&self, stage: Stage) -> Option<u64> {
        match stage {
            Stage::Minimize => Some(self.steps.em_steps),
            Stage::Nvt => Some(self.steps.nvt_steps),
            Stage::Npt => Some(self.steps.npt_steps),
            Stage::Production => Some(self.steps.md_steps),
            Stage::Prepare | Stage::Analysis => None,
        }
    }

    /// Parameter-file entries this configuration imposes on a stage's template.
    #[must_use]
    pub fn mdp_overrides(&self, stage: Stage) -> Vec<MdpOverride> {
        let mut overrides = Vec::new();
        if let Some(nsteps) = self.target_steps(stage) {
            overrides.push(MdpOverride::scalar("nsteps", nsteps));
        }
        if matches!(stage, Stage::Nvt | Stage::Npt | Stage::Production) {
            overrides.push(MdpOverride::scalar("dt", self.steps.dt));
            overrides.push(MdpOverride::per_group("ref_t", self.temperature));
        }
        if stage == Stage::Nvt {
            overrides.push(MdpOverride::scalar("gen_temp", self.temperature));
        }
        if matches!(stage, Stage::Npt | Stage::Production) {
            overrides.push(MdpOverride::per_group("ref_p", self.pressure));
        }
        overrides
    }
}
